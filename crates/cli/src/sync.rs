//! Batch backfill of live transcript bodies into the transcript cache.
//!
//! The live backend rate-limits aggressively, so the sync paces requests,
//! backs off on rate limits and stops after repeated ones. Rate-limited
//! records are never cached; they are retried on the next sync.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use touchpoint_core::domain::transcript::TranscriptRecord;
use touchpoint_core::errors::ApplicationError;
use touchpoint_db::TranscriptCacheRepository;
use touchpoint_sources::{DateRange, SourceError, TranscriptProvider};

/// Meetings booked through the company calendar carry this in their title.
const COMPANY_TITLE_MARKER: &str = "lightwork";
const HISTORY_DAYS: u32 = 730;

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub batch_size: usize,
    /// Pause after every hydrate request.
    pub pace: Duration,
    /// Wait before each retry after a rate limit; the sync stops once exhausted.
    pub backoffs: Vec<Duration>,
}

impl SyncSettings {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            pace: Duration::from_secs(2),
            backoffs: vec![Duration::from_secs(10), Duration::from_secs(20), Duration::from_secs(30)],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub candidates: usize,
    pub already_cached: usize,
    pub fetched: usize,
    pub empty: usize,
    pub errors: usize,
    pub rate_limited: bool,
}

pub async fn sync_transcripts(
    provider: &dyn TranscriptProvider,
    cache: &dyn TranscriptCacheRepository,
    team_emails: &[String],
    settings: &SyncSettings,
) -> Result<SyncReport, ApplicationError> {
    let team: BTreeSet<String> = team_emails.iter().map(|email| email.to_lowercase()).collect();
    let range = DateRange::around(Utc::now(), HISTORY_DAYS);
    let records = provider.list(range).await?;
    let candidates: Vec<TranscriptRecord> =
        records.into_iter().filter(|record| is_company_meeting(record, &team)).collect();

    let mut report = SyncReport { candidates: candidates.len(), ..SyncReport::default() };
    info!(
        event_name = "sync.transcripts.listed",
        source = provider.source().as_str(),
        candidates = report.candidates,
        batch_size = settings.batch_size,
        "listed transcripts to sync"
    );

    for record in candidates {
        if report.fetched + report.empty >= settings.batch_size {
            break;
        }
        let cached = cache.find_by_id(&record.id).await?;
        if cached.is_some_and(|cached| cached.has_body()) {
            report.already_cached += 1;
            continue;
        }

        match hydrate_with_backoff(provider, record, settings).await {
            Ok(hydrated) => {
                if hydrated.has_body() {
                    report.fetched += 1;
                } else {
                    report.empty += 1;
                }
                cache.save(&hydrated).await?;
            }
            Err(SourceError::RateLimited(detail)) => {
                warn!(
                    event_name = "sync.transcripts.rate_limited",
                    detail = %detail,
                    "rate limited repeatedly, stopping sync"
                );
                report.rate_limited = true;
                break;
            }
            Err(error) if error.is_mutation_blocked() => return Err(error.into()),
            Err(error) => {
                report.errors += 1;
                warn!(
                    event_name = "sync.transcripts.fetch_failed",
                    error = %error,
                    "transcript fetch failed"
                );
            }
        }
        tokio::time::sleep(settings.pace).await;
    }

    info!(
        event_name = "sync.transcripts.completed",
        fetched = report.fetched,
        empty = report.empty,
        already_cached = report.already_cached,
        errors = report.errors,
        "transcript sync finished"
    );
    Ok(report)
}

/// Hydrates one record, waiting out each rate limit in turn. Returns the last
/// rate-limit error once every backoff has been used.
async fn hydrate_with_backoff(
    provider: &dyn TranscriptProvider,
    record: TranscriptRecord,
    settings: &SyncSettings,
) -> Result<TranscriptRecord, SourceError> {
    let mut waits = settings.backoffs.iter();
    loop {
        match provider.hydrate(record.clone()).await {
            Err(SourceError::RateLimited(detail)) => {
                let Some(wait) = waits.next() else {
                    return Err(SourceError::RateLimited(detail));
                };
                warn!(
                    event_name = "sync.transcripts.backoff",
                    record_id = %record.id,
                    wait_secs = wait.as_secs(),
                    "rate limited, backing off"
                );
                tokio::time::sleep(*wait).await;
            }
            other => return other,
        }
    }
}

fn is_company_meeting(record: &TranscriptRecord, team: &BTreeSet<String>) -> bool {
    record.title.to_lowercase().contains(COMPANY_TITLE_MARKER)
        || record.attendees.iter().any(|email| team.contains(&email.to_lowercase()))
}
