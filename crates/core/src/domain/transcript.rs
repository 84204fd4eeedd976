use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend a transcript record was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    Live,
    Spreadsheet,
    LocalCache,
}

impl TranscriptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Spreadsheet => "spreadsheet",
            Self::LocalCache => "local_cache",
        }
    }
}

impl std::str::FromStr for TranscriptSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "live" => Ok(Self::Live),
            "spreadsheet" | "sheet" => Ok(Self::Spreadsheet),
            "local_cache" | "local" => Ok(Self::LocalCache),
            other => Err(format!(
                "unsupported transcript source `{other}` (expected live|spreadsheet|local_cache)"
            )),
        }
    }
}

/// Provider-agnostic transcript shape. `body` may be empty until the record
/// is hydrated by a provider that fetches bodies lazily.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub id: String,
    pub source: TranscriptSource,
    pub title: String,
    pub alternate_title: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub attendees: BTreeSet<String>,
    pub notes: String,
    pub body: String,
}

impl TranscriptRecord {
    pub fn new(id: impl Into<String>, source: TranscriptSource, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source,
            title: title.into(),
            alternate_title: None,
            date: None,
            attendees: BTreeSet::new(),
            notes: String::new(),
            body: String::new(),
        }
    }

    pub fn has_body(&self) -> bool {
        !self.body.trim().is_empty()
    }

    pub fn has_content(&self) -> bool {
        self.has_body() || !self.notes.trim().is_empty()
    }

    /// Notes and transcript joined into the text the composer scans.
    pub fn call_notes(&self) -> String {
        let mut parts = Vec::new();
        if !self.notes.trim().is_empty() {
            parts.push(format!("MEETING NOTES:\n{}", self.notes.trim()));
        }
        if self.has_body() {
            parts.push(format!("CALL TRANSCRIPT:\n{}", self.body.trim()));
        }
        parts.join("\n\n")
    }
}

/// Truncate at a char boundary, appending a marker when text was dropped.
pub fn cap_text(text: &str, max_chars: usize) -> String {
    let prefix = char_prefix(text, max_chars);
    if prefix.len() < text.len() {
        format!("{prefix}\n[...transcript truncated]")
    } else {
        text.to_string()
    }
}

/// First `max_chars` characters of `text`.
pub fn char_prefix(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::{cap_text, TranscriptRecord, TranscriptSource};

    #[test]
    fn call_notes_joins_notes_and_body() {
        let mut record = TranscriptRecord::new("t1", TranscriptSource::Spreadsheet, "Intro");
        record.notes = "Worried about mold".to_string();
        record.body = "Lead: we found mold in the basement".to_string();

        let text = record.call_notes();
        assert!(text.starts_with("MEETING NOTES:\nWorried about mold"));
        assert!(text.contains("CALL TRANSCRIPT:\nLead: we found mold"));
    }

    #[test]
    fn cap_text_respects_char_boundaries() {
        assert_eq!(cap_text("héllo", 10), "héllo");
        assert_eq!(cap_text("héllo", 2), "hé\n[...transcript truncated]");
    }

    #[test]
    fn source_parses_aliases() {
        assert_eq!("sheet".parse::<TranscriptSource>(), Ok(TranscriptSource::Spreadsheet));
        assert_eq!("local-cache".parse::<TranscriptSource>(), Ok(TranscriptSource::LocalCache));
        assert!("granola".parse::<TranscriptSource>().is_err());
    }
}
