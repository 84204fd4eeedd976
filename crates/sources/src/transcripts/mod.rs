//! Interchangeable transcript backends.
//!
//! Each backend lists candidate records for a date window. The live backend
//! lists metadata only and fetches bodies on [`TranscriptProvider::hydrate`];
//! the file-based backends return complete records up front.

pub mod live;
pub mod local;
pub mod sheet;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};

use touchpoint_core::config::TranscriptsConfig;
use touchpoint_core::domain::transcript::{TranscriptRecord, TranscriptSource};

use crate::error::SourceError;

pub use live::{LiveTranscriptClient, TokenStore};
pub use local::LocalCacheProvider;
pub use sheet::SpreadsheetProvider;

/// Inclusive calendar-day window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    /// Window of `days` on each side of `at`.
    pub fn around(at: DateTime<Utc>, days: u32) -> Self {
        let day = at.date_naive();
        let span = Duration::days(i64::from(days));
        Self::new(day - span, day + span)
    }

    /// Records without a date are kept; the scorer decides what to do with them.
    pub fn contains(&self, date: Option<DateTime<Utc>>) -> bool {
        match date {
            Some(date) => {
                let day = date.date_naive();
                day >= self.start && day <= self.end
            }
            None => true,
        }
    }
}

#[async_trait]
pub trait TranscriptProvider: Send + Sync {
    fn source(&self) -> TranscriptSource;

    async fn list(&self, range: DateRange) -> Result<Vec<TranscriptRecord>, SourceError>;

    /// Fills in `body` for records listed without one.
    async fn hydrate(&self, record: TranscriptRecord) -> Result<TranscriptRecord, SourceError> {
        Ok(record)
    }
}

/// Providers in configured order. A backend whose settings are missing is
/// skipped rather than failing the run.
pub fn providers_from_config(
    config: &TranscriptsConfig,
) -> Result<Vec<Arc<dyn TranscriptProvider>>, SourceError> {
    let mut providers: Vec<Arc<dyn TranscriptProvider>> = Vec::new();

    for source in &config.order {
        match source {
            TranscriptSource::Live => {
                if let Some(token_path) = &config.token_path {
                    let store = TokenStore::new(token_path.clone(), config.token_endpoint.clone());
                    providers.push(Arc::new(LiveTranscriptClient::new(&config.live_url, store)?));
                }
            }
            TranscriptSource::Spreadsheet => {
                if let Some(provider) = SpreadsheetProvider::from_config(config)? {
                    providers.push(Arc::new(provider));
                }
            }
            TranscriptSource::LocalCache => {
                if let Some(path) = &config.local_cache_path {
                    providers.push(Arc::new(LocalCacheProvider::new(path.clone(), config.local_body_cap)));
                }
            }
        }
    }

    Ok(providers)
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::DateRange;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn range_around_a_call_spans_both_sides_and_keeps_undated_records() {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 23, 30, 0).single().expect("at");
        let range = DateRange::around(at, 1);

        assert_eq!(range, DateRange::new(day(2026, 3, 1), day(2026, 3, 3)));
        assert!(range.contains(Some(Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 0).single().expect("d"))));
        assert!(!range.contains(Some(Utc.with_ymd_and_hms(2026, 3, 4, 0, 0, 0).single().expect("d"))));
        assert!(range.contains(None));
    }

    #[test]
    fn reversed_bounds_are_normalized() {
        let range = DateRange::new(day(2026, 3, 5), day(2026, 3, 1));
        assert_eq!(range.start, day(2026, 3, 1));
        assert_eq!(range.end, day(2026, 3, 5));
    }
}
