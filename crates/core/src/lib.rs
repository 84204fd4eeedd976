pub mod cadence;
pub mod compose;
pub mod config;
pub mod domain;
pub mod errors;
pub mod matching;
pub mod reference;

pub use cadence::{CadenceEngine, CadenceInput, CadenceSettings, CadenceState, ExclusionReason, Track};
pub use compose::{Draft, DraftComposer, DraftOrigin, DraftPlan, DraftRequest, SelectedTip};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions};
pub use domain::followup::{FollowUpHistory, OutgoingEmail, SentEmail};
pub use domain::lead::{Lead, LeadId, Opportunity, OpportunityStatus};
pub use domain::meeting::{Meeting, MeetingId, MeetingStatus};
pub use domain::owner::Owner;
pub use domain::transcript::{TranscriptRecord, TranscriptSource};
pub use errors::{ApplicationError, DomainError, ErrorClass};
pub use matching::{MatchResult, MatchSettings, MeetingMatcher, ScoreBreakdown};
pub use reference::{ApprovedLink, ReferenceLibrary};
