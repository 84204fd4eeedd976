use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use touchpoint_core::compose::{Draft, DraftOrigin, SelectedTip};

use super::{DraftCacheKey, DraftCacheRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDraftCacheRepository {
    pool: DbPool,
}

impl SqlDraftCacheRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DraftCacheRepository for SqlDraftCacheRepository {
    async fn find(&self, key: &DraftCacheKey) -> Result<Option<Draft>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT subject, body, origin, template, tip_json
            FROM draft_cache
            WHERE lead_id = ? AND track = ? AND touch = ? AND input_hash = ?
            "#,
        )
        .bind(&key.lead_id.0)
        .bind(key.track.as_str())
        .bind(i64::from(key.touch))
        .bind(&key.input_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| draft_from_row(&row)).transpose()
    }

    async fn save(&self, key: &DraftCacheKey, draft: &Draft) -> Result<(), RepositoryError> {
        let tip_json = draft
            .tip
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO draft_cache (
                lead_id, track, touch, input_hash, subject, body, origin, template, tip_json, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (lead_id, track, touch, input_hash) DO UPDATE SET
                subject = excluded.subject,
                body = excluded.body,
                origin = excluded.origin,
                template = excluded.template,
                tip_json = excluded.tip_json,
                created_at = excluded.created_at
            "#,
        )
        .bind(&key.lead_id.0)
        .bind(key.track.as_str())
        .bind(i64::from(key.touch))
        .bind(&key.input_hash)
        .bind(&draft.subject)
        .bind(&draft.body)
        .bind(origin_str(draft.origin))
        .bind(&draft.template)
        .bind(tip_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM draft_cache WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn origin_str(origin: DraftOrigin) -> &'static str {
    match origin {
        DraftOrigin::FixedTemplate => "fixed_template",
        DraftOrigin::RulesTable => "rules_table",
        DraftOrigin::GenericTemplate => "generic_template",
        DraftOrigin::Generative => "generative",
    }
}

fn parse_origin(value: &str) -> Result<DraftOrigin, RepositoryError> {
    match value {
        "fixed_template" => Ok(DraftOrigin::FixedTemplate),
        "rules_table" => Ok(DraftOrigin::RulesTable),
        "generic_template" => Ok(DraftOrigin::GenericTemplate),
        "generative" => Ok(DraftOrigin::Generative),
        other => Err(RepositoryError::Decode(format!("unknown draft origin `{other}`"))),
    }
}

fn draft_from_row(row: &SqliteRow) -> Result<Draft, RepositoryError> {
    let origin: String = row.try_get("origin")?;
    let tip_json: Option<String> = row.try_get("tip_json")?;
    let tip = tip_json
        .map(|raw| serde_json::from_str::<SelectedTip>(&raw))
        .transpose()
        .map_err(|error| RepositoryError::Decode(format!("invalid tip_json: {error}")))?;

    Ok(Draft {
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        origin: parse_origin(&origin)?,
        template: row.try_get("template")?,
        tip,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use touchpoint_core::cadence::Track;
    use touchpoint_core::compose::{Draft, DraftOrigin, SelectedTip};
    use touchpoint_core::domain::lead::LeadId;
    use touchpoint_core::reference::ApprovedLink;

    use super::SqlDraftCacheRepository;
    use crate::repositories::{DraftCacheKey, DraftCacheRepository};
    use crate::{connect_with_settings, migrations};

    async fn repository() -> SqlDraftCacheRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlDraftCacheRepository::new(pool)
    }

    fn key(hash: &str) -> DraftCacheKey {
        DraftCacheKey {
            lead_id: LeadId("lead_1".to_string()),
            track: Track::Standard,
            touch: 2,
            input_hash: hash.to_string(),
        }
    }

    fn draft() -> Draft {
        Draft {
            subject: "Follow-up 2: Personal tip".to_string(),
            body: "Hey Jane,\n\nMove the baby monitor.".to_string(),
            origin: DraftOrigin::RulesTable,
            template: "standard_tip".to_string(),
            tip: Some(SelectedTip {
                topic: "baby monitors and EMF".to_string(),
                trigger: "baby monitor".to_string(),
                tip: "Move the baby monitor.".to_string(),
                links: vec![ApprovedLink {
                    label: "science".to_string(),
                    url: "https://www.lightworkhome.com/blog-posts/the-science-behind-lightwork"
                        .to_string(),
                }],
            }),
        }
    }

    #[tokio::test]
    async fn saved_draft_is_found_by_exact_key() {
        let repo = repository().await;
        repo.save(&key("h1"), &draft()).await.expect("save");

        assert_eq!(repo.find(&key("h1")).await.expect("find"), Some(draft()));
        assert_eq!(repo.find(&key("h2")).await.expect("find other hash"), None);
    }

    #[tokio::test]
    async fn saving_twice_replaces_the_entry() {
        let repo = repository().await;
        repo.save(&key("h1"), &draft()).await.expect("save");

        let mut updated = draft();
        updated.body = "Hey Jane,\n\nUpdated.".to_string();
        updated.tip = None;
        updated.origin = DraftOrigin::Generative;
        repo.save(&key("h1"), &updated).await.expect("save again");

        assert_eq!(repo.find(&key("h1")).await.expect("find"), Some(updated));
    }

    #[tokio::test]
    async fn prune_removes_only_older_entries() {
        let repo = repository().await;
        repo.save(&key("h1"), &draft()).await.expect("save");

        let removed = repo.prune_before(Utc::now() - Duration::days(1)).await.expect("prune");
        assert_eq!(removed, 0);

        let removed = repo.prune_before(Utc::now() + Duration::minutes(1)).await.expect("prune");
        assert_eq!(removed, 1);
        assert_eq!(repo.find(&key("h1")).await.expect("find"), None);
    }
}
