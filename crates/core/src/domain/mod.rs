pub mod followup;
pub mod lead;
pub mod meeting;
pub mod owner;
pub mod transcript;
