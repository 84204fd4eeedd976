//! Read-only record fetchers: the CRM client and the transcript backends.

pub mod crm;
pub mod error;
pub mod http;
pub mod transcripts;

pub use crm::{CloseCrmClient, CrmSource};
pub use error::SourceError;
pub use http::{HttpClient, HttpSettings};
pub use transcripts::{providers_from_config, DateRange, TranscriptProvider};
