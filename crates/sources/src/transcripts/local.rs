//! Note-taker desktop cache (`cache-v3.json`).
//!
//! The file wraps its state in a `cache` field that is usually a JSON string
//! holding another JSON document. Every document is a candidate; matching
//! relies on attendee overlap to ignore unrelated notes.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use touchpoint_core::domain::transcript::{cap_text, TranscriptRecord, TranscriptSource};

use crate::error::SourceError;
use crate::transcripts::{DateRange, TranscriptProvider};

pub struct LocalCacheProvider {
    path: PathBuf,
    body_cap: usize,
    records: OnceCell<Vec<TranscriptRecord>>,
}

impl LocalCacheProvider {
    pub fn new(path: PathBuf, body_cap: usize) -> Self {
        Self { path, body_cap, records: OnceCell::new() }
    }

    async fn records(&self) -> Result<&Vec<TranscriptRecord>, SourceError> {
        self.records
            .get_or_try_init(|| async {
                if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
                    warn!(
                        event_name = "sources.local.missing",
                        path = %self.path.display(),
                        "local note cache not found"
                    );
                    return Ok(Vec::new());
                }
                let raw = tokio::fs::read_to_string(&self.path)
                    .await
                    .map_err(|source| SourceError::Io { path: self.path.clone(), source })?;
                let records = parse_cache(&raw, self.body_cap)?;
                info!(event_name = "sources.local.loaded", documents = records.len(), "local note cache loaded");
                Ok::<_, SourceError>(records)
            })
            .await
    }
}

#[async_trait]
impl TranscriptProvider for LocalCacheProvider {
    fn source(&self) -> TranscriptSource {
        TranscriptSource::LocalCache
    }

    async fn list(&self, range: DateRange) -> Result<Vec<TranscriptRecord>, SourceError> {
        let records = self.records().await?;
        Ok(records.iter().filter(|record| range.contains(record.date)).cloned().collect())
    }
}

/// Parses the cache file into one record per document.
pub fn parse_cache(raw: &str, body_cap: usize) -> Result<Vec<TranscriptRecord>, SourceError> {
    let outer: Value = serde_json::from_str(raw).map_err(|error| SourceError::Decode(error.to_string()))?;
    let cache = match outer.get("cache") {
        Some(Value::String(inner)) => {
            serde_json::from_str(inner).map_err(|error| SourceError::Decode(error.to_string()))?
        }
        Some(inner) => inner.clone(),
        None => return Err(SourceError::Decode("cache file has no `cache` field".to_string())),
    };

    let state = cache.get("state").cloned().unwrap_or(Value::Null);
    let empty = serde_json::Map::new();
    let documents = state.get("documents").and_then(Value::as_object).unwrap_or(&empty);
    let transcripts = state.get("transcripts").and_then(Value::as_object).unwrap_or(&empty);

    let mut records: Vec<TranscriptRecord> = documents
        .iter()
        .map(|(id, document)| {
            let segments = transcripts.get(id).and_then(Value::as_array);
            document_record(id, document, segments.map(Vec::as_slice).unwrap_or_default(), body_cap)
        })
        .collect();
    records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
    Ok(records)
}

fn text_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).map(str::trim).filter(|text| !text.is_empty())
}

fn document_record(id: &str, document: &Value, segments: &[Value], body_cap: usize) -> TranscriptRecord {
    let calendar = document.get("google_calendar_event").cloned().unwrap_or(Value::Null);
    let title = text_at(document, "title").unwrap_or_default();
    let summary = text_at(&calendar, "summary");

    let mut record = TranscriptRecord::new(id, TranscriptSource::LocalCache, title);
    if title.is_empty() {
        record.title = summary.unwrap_or_default().to_string();
    } else if summary.is_some_and(|summary| !summary.eq_ignore_ascii_case(title)) {
        record.alternate_title = summary.map(str::to_string);
    }

    record.date = text_at(document, "created_at")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|date| date.with_timezone(&Utc));
    record.attendees = attendee_emails(&calendar, document.get("people"));
    record.notes = typed_notes(document);
    record.body = cap_text(&spoken_transcript(segments), body_cap);
    record
}

fn attendee_emails(calendar: &Value, people: Option<&Value>) -> BTreeSet<String> {
    let mut emails = BTreeSet::new();
    let mut collect = |entries: Option<&Vec<Value>>| {
        for entry in entries.into_iter().flatten() {
            if let Some(email) = text_at(entry, "email") {
                emails.insert(email.to_lowercase());
            }
        }
    };

    collect(calendar.get("attendees").and_then(Value::as_array));
    if let Some(groups) = people.and_then(Value::as_object) {
        for group in groups.values() {
            collect(group.as_array());
        }
    }
    emails
}

/// Markdown notes, then plain notes, then the rich-text document.
fn typed_notes(document: &Value) -> String {
    if let Some(notes) = text_at(document, "notes_markdown").or_else(|| text_at(document, "notes_plain")) {
        return notes.to_string();
    }
    document.get("notes").map(rich_text).unwrap_or_default().trim().to_string()
}

/// Flattens a ProseMirror-style node tree, one text node per line.
fn rich_text(node: &Value) -> String {
    let Some(object) = node.as_object() else {
        return String::new();
    };

    let mut parts = Vec::new();
    if object.get("type").and_then(Value::as_str) == Some("text") {
        if let Some(text) = object.get("text").and_then(Value::as_str) {
            parts.push(text.to_string());
        }
    }
    for child in object.get("content").and_then(Value::as_array).into_iter().flatten() {
        parts.push(rich_text(child));
    }
    parts.retain(|part| !part.is_empty());
    parts.join("\n")
}

fn spoken_transcript(segments: &[Value]) -> String {
    segments
        .iter()
        .filter_map(|segment| {
            let text = text_at(segment, "text")?;
            let speaker = text_at(segment, "speaker_name").or_else(|| text_at(segment, "speaker"));
            Some(match speaker {
                Some(speaker) => format!("{speaker}: {text}"),
                None => text.to_string(),
            })
        })
        .collect::<Vec<_>>()
        .join("\n")
}
