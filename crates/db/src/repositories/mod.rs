use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use touchpoint_core::cadence::Track;
use touchpoint_core::compose::Draft;
use touchpoint_core::domain::lead::LeadId;
use touchpoint_core::domain::transcript::TranscriptRecord;
use touchpoint_core::errors::ApplicationError;

pub mod draft_cache;
pub mod memory;
pub mod transcript_cache;

pub use draft_cache::SqlDraftCacheRepository;
pub use memory::{InMemoryDraftCacheRepository, InMemoryTranscriptCacheRepository};
pub use transcript_cache::SqlTranscriptCacheRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        Self::Persistence(value.to_string())
    }
}

/// Memoization key for a rendered draft. The hash covers every input that
/// can change the text, so a stale entry is never returned.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DraftCacheKey {
    pub lead_id: LeadId,
    pub track: Track,
    pub touch: u32,
    pub input_hash: String,
}

#[async_trait]
pub trait DraftCacheRepository: Send + Sync {
    async fn find(&self, key: &DraftCacheKey) -> Result<Option<Draft>, RepositoryError>;
    async fn save(&self, key: &DraftCacheKey, draft: &Draft) -> Result<(), RepositoryError>;
    /// Drops entries created before `cutoff`, returning how many were removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait TranscriptCacheRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<TranscriptRecord>, RepositoryError>;
    async fn save(&self, record: &TranscriptRecord) -> Result<(), RepositoryError>;
    /// Records dated within `[start, end]`, oldest first.
    async fn list_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TranscriptRecord>, RepositoryError>;
}
