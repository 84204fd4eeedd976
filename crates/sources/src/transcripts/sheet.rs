//! Spreadsheet export backend: one CSV row per call.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use csv::{ReaderBuilder, StringRecord};
use reqwest::Method;
use tokio::sync::OnceCell;
use tracing::info;

use touchpoint_core::config::TranscriptsConfig;
use touchpoint_core::domain::transcript::{cap_text, TranscriptRecord, TranscriptSource};

use crate::error::SourceError;
use crate::http::{HttpClient, HttpSettings};
use crate::transcripts::{DateRange, TranscriptProvider};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SheetOrigin {
    Url(String),
    Path(PathBuf),
}

pub struct SpreadsheetProvider {
    origin: SheetOrigin,
    body_cap: usize,
    http: HttpClient,
    rows: OnceCell<Vec<TranscriptRecord>>,
}

impl SpreadsheetProvider {
    pub fn new(origin: SheetOrigin, body_cap: usize) -> Result<Self, SourceError> {
        Ok(Self { origin, body_cap, http: HttpClient::new(HttpSettings::default())?, rows: OnceCell::new() })
    }

    pub fn from_config(config: &TranscriptsConfig) -> Result<Option<Self>, SourceError> {
        let origin = match (&config.sheet_url, &config.sheet_path) {
            (Some(url), _) => SheetOrigin::Url(url.clone()),
            (None, Some(path)) => SheetOrigin::Path(path.clone()),
            (None, None) => return Ok(None),
        };
        Self::new(origin, config.sheet_body_cap).map(Some)
    }

    async fn read_export(&self) -> Result<String, SourceError> {
        match &self.origin {
            SheetOrigin::Path(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|source| SourceError::Io { path: path.clone(), source }),
            SheetOrigin::Url(url) => {
                let response = self.http.execute(Method::GET, url, |request| request).await?;
                response
                    .text()
                    .await
                    .map_err(|source| SourceError::Transport { url: url.clone(), source })
            }
        }
    }

    async fn rows(&self) -> Result<&Vec<TranscriptRecord>, SourceError> {
        self.rows
            .get_or_try_init(|| async {
                let raw = self.read_export().await?;
                let rows = parse_export(&raw, self.body_cap)?;
                info!(event_name = "sources.sheet.loaded", rows = rows.len(), "spreadsheet export loaded");
                Ok::<_, SourceError>(rows)
            })
            .await
    }
}

#[async_trait]
impl TranscriptProvider for SpreadsheetProvider {
    fn source(&self) -> TranscriptSource {
        TranscriptSource::Spreadsheet
    }

    async fn list(&self, range: DateRange) -> Result<Vec<TranscriptRecord>, SourceError> {
        let rows = self.rows().await?;
        Ok(rows.iter().filter(|record| range.contains(record.date)).cloned().collect())
    }
}

struct Columns {
    title: Option<usize>,
    attendees: Option<usize>,
    notes: Option<usize>,
    time: Option<usize>,
    transcript: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> Self {
        let find = |name: &str| headers.iter().position(|header| header.trim().eq_ignore_ascii_case(name));
        Self {
            title: find("Title"),
            attendees: find("Attendees"),
            notes: find("Notes"),
            time: find("Time"),
            transcript: find("Transcript"),
        }
    }
}

fn field(row: &StringRecord, column: Option<usize>) -> &str {
    column.and_then(|index| row.get(index)).map(str::trim).unwrap_or_default()
}

/// Parses the CSV export. Rows with neither a title nor a transcript are dropped.
pub fn parse_export(raw: &str, body_cap: usize) -> Result<Vec<TranscriptRecord>, SourceError> {
    let mut reader = ReaderBuilder::new().flexible(true).from_reader(raw.as_bytes());
    let columns = Columns::from_headers(reader.headers()?);
    let mut records = Vec::new();

    for (index, row) in reader.records().enumerate() {
        let row = row?;
        let title = field(&row, columns.title);
        let body = field(&row, columns.transcript);
        if title.is_empty() && body.is_empty() {
            continue;
        }

        let mut record = TranscriptRecord::new(format!("sheet-{}", index + 1), TranscriptSource::Spreadsheet, title);
        record.date = parse_day(field(&row, columns.time));
        record.attendees = field(&row, columns.attendees)
            .split(',')
            .map(|email| email.trim().to_lowercase())
            .filter(|email| email.contains('@'))
            .collect();
        record.notes = field(&row, columns.notes).to_string();
        record.body = cap_text(body, body_cap);
        records.push(record);
    }

    Ok(records)
}

/// The export writes timestamps whose first ten characters are the call date.
fn parse_day(raw: &str) -> Option<chrono::DateTime<Utc>> {
    let prefix = raw.get(..10)?;
    let day = NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()?;
    Utc.from_local_datetime(&day.and_hms_opt(0, 0, 0)?).single()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::NaiveDate;

    use super::{parse_export, SheetOrigin, SpreadsheetProvider};
    use crate::transcripts::{DateRange, TranscriptProvider};

    const EXPORT: &str = "Title,Attendees,Notes,Time,Transcript\n\
\"Intro call, Jane\",\"Jane@Example.com, rep@lightwork.test\",Asked about mold,2026-03-02 15:00:00,\"Jane: we had a leak last year\"\n\
,,,,\n\
Untimed call,,,,Some text\n";

    #[test]
    fn rows_map_to_records_with_lowercased_attendees() {
        let records = parse_export(EXPORT, 6000).expect("parse");

        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.title, "Intro call, Jane");
        assert!(first.attendees.contains("jane@example.com"));
        assert!(first.attendees.contains("rep@lightwork.test"));
        assert_eq!(first.notes, "Asked about mold");
        assert_eq!(first.date.map(|date| date.date_naive()), NaiveDate::from_ymd_opt(2026, 3, 2));
        assert!(records[1].date.is_none());
    }

    #[test]
    fn long_transcripts_are_capped() {
        let long = "a".repeat(50);
        let raw = format!("Title,Transcript\nCall,{long}\n");
        let records = parse_export(&raw, 10).expect("parse");

        assert!(records[0].body.starts_with("aaaaaaaaaa\n"));
        assert!(records[0].body.contains("truncated"));
    }

    #[tokio::test]
    async fn file_export_is_filtered_by_date_window() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(EXPORT.as_bytes()).expect("write export");
        let provider =
            SpreadsheetProvider::new(SheetOrigin::Path(file.path().to_path_buf()), 6000).expect("provider");

        let day = |d| NaiveDate::from_ymd_opt(2026, 3, d).expect("day");
        let hits = provider.list(DateRange::new(day(1), day(3))).await.expect("list");
        let misses = provider.list(DateRange::new(day(10), day(12))).await.expect("list");

        assert_eq!(hits.len(), 2);
        assert_eq!(misses.len(), 1, "undated rows stay candidates");
    }

    #[tokio::test]
    async fn url_export_is_fetched_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/export.csv").with_body(EXPORT).expect(1).create_async().await;
        let provider =
            SpreadsheetProvider::new(SheetOrigin::Url(format!("{}/export.csv", server.url())), 6000)
                .expect("provider");

        let day = |d| NaiveDate::from_ymd_opt(2026, 3, d).expect("day");
        provider.list(DateRange::new(day(1), day(3))).await.expect("first");
        provider.list(DateRange::new(day(1), day(3))).await.expect("second");

        mock.assert_async().await;
    }
}
