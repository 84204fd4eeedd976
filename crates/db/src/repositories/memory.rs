use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use touchpoint_core::compose::Draft;
use touchpoint_core::domain::transcript::TranscriptRecord;

use super::{DraftCacheKey, DraftCacheRepository, RepositoryError, TranscriptCacheRepository};

#[derive(Default)]
pub struct InMemoryDraftCacheRepository {
    drafts: RwLock<HashMap<DraftCacheKey, (Draft, DateTime<Utc>)>>,
}

impl InMemoryDraftCacheRepository {
    pub async fn len(&self) -> usize {
        self.drafts.read().await.len()
    }
}

#[async_trait::async_trait]
impl DraftCacheRepository for InMemoryDraftCacheRepository {
    async fn find(&self, key: &DraftCacheKey) -> Result<Option<Draft>, RepositoryError> {
        let drafts = self.drafts.read().await;
        Ok(drafts.get(key).map(|(draft, _)| draft.clone()))
    }

    async fn save(&self, key: &DraftCacheKey, draft: &Draft) -> Result<(), RepositoryError> {
        let mut drafts = self.drafts.write().await;
        drafts.insert(key.clone(), (draft.clone(), Utc::now()));
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut drafts = self.drafts.write().await;
        let before = drafts.len();
        drafts.retain(|_, (_, created_at)| *created_at >= cutoff);
        Ok((before - drafts.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryTranscriptCacheRepository {
    records: RwLock<HashMap<String, TranscriptRecord>>,
}

#[async_trait::async_trait]
impl TranscriptCacheRepository for InMemoryTranscriptCacheRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<TranscriptRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(id).cloned())
    }

    async fn save(&self, record: &TranscriptRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn list_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TranscriptRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut found: Vec<TranscriptRecord> = records
            .values()
            .filter(|record| record.date.is_some_and(|date| date >= start && date <= end))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }
}
