use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use touchpoint_core::domain::transcript::{TranscriptRecord, TranscriptSource};

use super::{RepositoryError, TranscriptCacheRepository};
use crate::DbPool;

/// Durable copy of transcripts pulled from the live note-taker, so a run does
/// not refetch bodies it already has.
pub struct SqlTranscriptCacheRepository {
    pool: DbPool,
}

impl SqlTranscriptCacheRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TranscriptCacheRepository for SqlTranscriptCacheRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<TranscriptRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, source, title, alternate_title, meeting_date, attendees_json, notes, body
            FROM transcript_cache
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    async fn save(&self, record: &TranscriptRecord) -> Result<(), RepositoryError> {
        let attendees_json = serde_json::to_string(&record.attendees)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO transcript_cache (
                id, source, title, alternate_title, meeting_date, attendees_json, notes, body, fetched_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                source = excluded.source,
                title = excluded.title,
                alternate_title = excluded.alternate_title,
                meeting_date = excluded.meeting_date,
                attendees_json = excluded.attendees_json,
                notes = excluded.notes,
                body = excluded.body,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&record.id)
        .bind(record.source.as_str())
        .bind(&record.title)
        .bind(record.alternate_title.as_deref())
        .bind(record.date.map(|date| date.to_rfc3339()))
        .bind(attendees_json)
        .bind(&record.notes)
        .bind(&record.body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TranscriptRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, title, alternate_title, meeting_date, attendees_json, notes, body
            FROM transcript_cache
            WHERE meeting_date >= ? AND meeting_date <= ?
            ORDER BY meeting_date ASC, id ASC
            "#,
        )
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<TranscriptRecord, RepositoryError> {
    let source: String = row.try_get("source")?;
    let source = source.parse::<TranscriptSource>().map_err(RepositoryError::Decode)?;
    let meeting_date: Option<String> = row.try_get("meeting_date")?;
    let date = meeting_date
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|date| date.with_timezone(&Utc))
                .map_err(|error| RepositoryError::Decode(format!("invalid meeting_date: {error}")))
        })
        .transpose()?;
    let attendees_json: String = row.try_get("attendees_json")?;
    let attendees: BTreeSet<String> = serde_json::from_str(&attendees_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid attendees_json: {error}")))?;

    Ok(TranscriptRecord {
        id: row.try_get("id")?,
        source,
        title: row.try_get("title")?,
        alternate_title: row.try_get("alternate_title")?,
        date,
        attendees,
        notes: row.try_get("notes")?,
        body: row.try_get("body")?,
    })
}
