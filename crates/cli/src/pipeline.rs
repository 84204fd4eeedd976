//! The daily digest run.
//!
//! A run has two fan-out phases over a bounded worker pool. The first reads
//! every lead whose first meeting is inside its track's window and evaluates
//! its cadence; that is all `status` needs. The second runs only for due leads that survive the
//! per-owner cap: it matches the first call to a transcript, then drafts.
//! A skippable failure drops one lead; a fatal one aborts the whole run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use touchpoint_agent::{AgentRequest, DraftAgent, DraftOutcome};
use touchpoint_core::cadence::{CadenceEngine, CadenceInput, CadenceState, Track};
use touchpoint_core::compose::{input_fingerprint, Draft, DraftOrigin, DraftRequest};
use touchpoint_core::config::TeamConfig;
use touchpoint_core::domain::followup::{FollowUpHistory, SentEmail};
use touchpoint_core::domain::lead::{Lead, LeadId};
use touchpoint_core::domain::meeting::{self, Meeting};
use touchpoint_core::domain::owner::{owner_email, Owner};
use touchpoint_core::domain::transcript::{TranscriptRecord, TranscriptSource};
use touchpoint_core::errors::ApplicationError;
use touchpoint_core::matching::MeetingMatcher;
use touchpoint_db::{DraftCacheKey, DraftCacheRepository, TranscriptCacheRepository};
use touchpoint_sources::{CrmSource, DateRange, TranscriptProvider};

#[derive(Clone, Debug)]
pub struct RunSettings {
    pub today: NaiveDate,
    pub lookback_days: u32,
    pub workers: usize,
    pub max_per_owner: usize,
    /// Skip draft cache lookups. Fresh drafts are still written back.
    pub fresh: bool,
    /// Lead name substring whose follow-up history is logged in detail.
    pub debug_lead: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrackerEntry {
    pub lead_id: LeadId,
    pub lead_name: String,
    pub owner: String,
    pub follow_ups_sent: Option<u32>,
    pub cadence: CadenceState,
}

#[derive(Clone, Debug, Serialize)]
pub struct TranscriptMatch {
    pub source: TranscriptSource,
    pub record_id: String,
    pub title: String,
    pub score: u32,
    pub has_transcript: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct DigestEntry {
    pub lead_id: LeadId,
    pub lead_name: String,
    pub lead_url: Option<String>,
    pub owner: String,
    pub track: Track,
    pub touch: u32,
    pub due_on: NaiveDate,
    pub days_overdue: i64,
    pub days_since_call: Option<i64>,
    pub transcript: Option<TranscriptMatch>,
    pub prior_emails: Vec<SentEmail>,
    pub draft: Draft,
    pub cached: bool,
    pub model_calls: u32,
    pub fallback_reason: Option<String>,
    pub remaining_issues: Vec<String>,
    pub priority: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RunStats {
    pub leads: usize,
    pub skipped: usize,
    pub due: usize,
    pub deferred: usize,
    pub drafted: usize,
    pub missing_transcripts: usize,
    pub unavailable_sources: Vec<TranscriptSource>,
}

/// Machine-readable output of one run, consumed by the rendering layer.
#[derive(Clone, Debug, Serialize)]
pub struct Digest {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub entries: Vec<DigestEntry>,
    pub tracker: Vec<TrackerEntry>,
    pub stats: RunStats,
}

struct Assessment {
    lead: Lead,
    meetings: Vec<Meeting>,
    owner: Owner,
    history: Option<FollowUpHistory>,
    state: CadenceState,
}

impl Assessment {
    fn tracker_entry(&self) -> TrackerEntry {
        TrackerEntry {
            lead_id: self.lead.id.clone(),
            lead_name: self.lead.name.clone(),
            owner: self.owner.display_name.clone(),
            follow_ups_sent: self.history.as_ref().map(|history| history.count),
            cadence: self.state.clone(),
        }
    }

    fn days_overdue(&self) -> i64 {
        match self.state {
            CadenceState::Due { days_overdue, .. } => days_overdue,
            _ => i64::MIN,
        }
    }
}

struct Backend {
    provider: Arc<dyn TranscriptProvider>,
    records: Vec<TranscriptRecord>,
}

/// Candidate records per backend, listed once per run in configured order.
struct Catalog {
    backends: Vec<Backend>,
    unavailable: Vec<TranscriptSource>,
}

/// What one lead task produced.
enum Outcome<T> {
    Kept(T),
    Skipped,
    /// First meeting is older than the lead's window; the lead is not tracked.
    OutOfWindow,
}

struct Assessed {
    assessments: Vec<Assessment>,
    skipped: usize,
}

pub struct Pipeline {
    run_id: String,
    crm: Arc<dyn CrmSource>,
    providers: Vec<Arc<dyn TranscriptProvider>>,
    transcript_cache: Option<Arc<dyn TranscriptCacheRepository>>,
    draft_cache: Option<Arc<dyn DraftCacheRepository>>,
    agent: Arc<DraftAgent>,
    engine: CadenceEngine,
    matcher: MeetingMatcher,
    team: TeamConfig,
    team_emails: Vec<String>,
    settings: RunSettings,
}

impl Pipeline {
    pub fn new(
        crm: Arc<dyn CrmSource>,
        agent: Arc<DraftAgent>,
        engine: CadenceEngine,
        matcher: MeetingMatcher,
        team: TeamConfig,
        settings: RunSettings,
    ) -> Self {
        let team_emails = team.emails();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            crm,
            providers: Vec::new(),
            transcript_cache: None,
            draft_cache: None,
            agent,
            engine,
            matcher,
            team,
            team_emails,
            settings,
        }
    }

    pub fn with_providers(mut self, providers: Vec<Arc<dyn TranscriptProvider>>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_transcript_cache(mut self, cache: Arc<dyn TranscriptCacheRepository>) -> Self {
        self.transcript_cache = Some(cache);
        self
    }

    pub fn with_draft_cache(mut self, cache: Arc<dyn DraftCacheRepository>) -> Self {
        self.draft_cache = Some(cache);
        self
    }

    /// Cadence state for every lead in scope. No transcripts are read and no
    /// drafts are produced.
    pub async fn status(self: Arc<Self>) -> Result<Vec<TrackerEntry>, ApplicationError> {
        let assessed = self.assess_all().await?;
        Ok(tracker(&assessed.assessments))
    }

    pub async fn run(self: Arc<Self>) -> Result<Digest, ApplicationError> {
        info!(
            event_name = "digest.run.start",
            correlation_id = %self.run_id,
            today = %self.settings.today,
            workers = self.settings.workers,
            "starting digest run"
        );
        let Assessed { assessments, skipped } = Arc::clone(&self).assess_all().await?;
        let mut stats = RunStats { leads: assessments.len() + skipped, skipped, ..RunStats::default() };
        let tracker = tracker(&assessments);

        let (due, deferred) = self.select_due(assessments);
        stats.due = due.len() + deferred;
        stats.deferred = deferred;

        // Rebook touches never quote a call, so only the other tracks need transcripts.
        let earliest_call = due
            .iter()
            .filter(|assessment| assessment.state.track() != Some(Track::Rebook))
            .filter_map(|assessment| meeting::first_completed(&assessment.meetings))
            .map(|call| call.starts_at.date_naive())
            .min();
        let catalog = if let Some(earliest_call) = earliest_call {
            self.load_catalog(earliest_call).await?
        } else {
            Catalog { backends: Vec::new(), unavailable: Vec::new() }
        };
        stats.unavailable_sources = catalog.unavailable.clone();

        let (mut entries, draft_skipped) = Arc::clone(&self).draft_all(due, Arc::new(catalog)).await?;
        sort_entries(&mut entries);
        stats.skipped += draft_skipped;
        stats.drafted = entries.len();
        stats.missing_transcripts = entries
            .iter()
            .filter(|entry| entry.track != Track::Rebook && entry.transcript.is_none())
            .count();

        info!(
            event_name = "digest.run.completed",
            correlation_id = %self.run_id,
            leads = stats.leads,
            due = stats.due,
            drafted = stats.drafted,
            deferred = stats.deferred,
            skipped = stats.skipped,
            "digest run completed"
        );

        Ok(Digest {
            run_id: self.run_id.clone(),
            generated_at: Utc::now(),
            today: self.settings.today,
            entries,
            tracker,
            stats,
        })
    }

    fn days_before_today(&self, days: u32) -> DateTime<Utc> {
        let start = self.settings.today - Duration::days(i64::from(days));
        start.and_hms_opt(0, 0, 0).map(|start| start.and_utc()).unwrap_or_else(Utc::now)
    }

    /// Days after its first meeting that a lead stays in scope. Nurture leads
    /// keep the lookback slack past their last nurture offset.
    fn horizon_days(&self, track: Option<Track>) -> u32 {
        let lookback = self.settings.lookback_days;
        match track {
            Some(Track::Nurture) => {
                let last = self.engine.settings().offsets(Track::Nurture).last().copied().unwrap_or(0);
                lookback.saturating_add(last)
            }
            _ => lookback,
        }
    }

    /// `meetings` must be sorted by start time.
    fn out_of_window(&self, track: Option<Track>, meetings: &[Meeting]) -> bool {
        meetings
            .first()
            .is_some_and(|first| first.starts_at < self.days_before_today(self.horizon_days(track)))
    }

    async fn assess_all(self: Arc<Self>) -> Result<Assessed, ApplicationError> {
        let since = self.days_before_today(self.horizon_days(Some(Track::Nurture)));
        let meetings = self.crm.meetings_since(since).await?;
        let mut by_lead: BTreeMap<LeadId, Vec<Meeting>> = BTreeMap::new();
        for meeting in meetings {
            by_lead.entry(meeting.lead_id.clone()).or_default().push(meeting);
        }
        info!(
            event_name = "digest.leads.grouped",
            correlation_id = %self.run_id,
            leads = by_lead.len(),
            "grouped meetings by lead"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut tasks = JoinSet::new();
        for (lead_id, mut meetings) in by_lead {
            meetings.sort_by_key(|meeting| meeting.starts_at);
            let pipeline = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|error| ApplicationError::Runtime(error.to_string()))?;
                pipeline.assess_lead(lead_id, meetings).await
            });
        }

        let mut assessed = Assessed { assessments: Vec::new(), skipped: 0 };
        let mut out_of_window = 0usize;
        for outcome in join_all(tasks).await? {
            match outcome {
                Outcome::Kept(assessment) => assessed.assessments.push(assessment),
                Outcome::Skipped => assessed.skipped += 1,
                Outcome::OutOfWindow => out_of_window += 1,
            }
        }
        info!(
            event_name = "digest.leads.assessed",
            correlation_id = %self.run_id,
            tracked = assessed.assessments.len(),
            skipped = assessed.skipped,
            out_of_window,
            "assessed leads"
        );
        assessed.assessments.sort_by(|left, right| left.lead.id.cmp(&right.lead.id));
        Ok(assessed)
    }

    async fn assess_lead(
        &self,
        lead_id: LeadId,
        recent: Vec<Meeting>,
    ) -> Result<Outcome<Assessment>, ApplicationError> {
        let lead = match self.crm.lead(&lead_id).await {
            Ok(lead) => lead,
            Err(error) => return self.skip_or_abort(&lead_id, "lead", error.into()),
        };
        // Nurture membership depends only on the lead, so an early meeting in
        // the recent set already settles the active tracks.
        if self.out_of_window(self.engine.track_for(&lead, &recent).ok(), &recent) {
            return Ok(self.outside_window(&lead_id));
        }

        // The anchor is the lead's first meeting ever, not the first one fetched.
        let meetings = match self.crm.meetings_for_lead(&lead_id).await {
            Ok(history) => merge_meetings(recent, history),
            Err(error) => return self.skip_or_abort(&lead_id, "meetings", error.into()),
        };
        let track = self.engine.track_for(&lead, &meetings).ok();
        if self.out_of_window(track, &meetings) {
            return Ok(self.outside_window(&lead_id));
        }
        let attendees = meetings.iter().flat_map(|meeting| meeting.attendees.iter());
        let owner = self.team.owner(owner_email(attendees, &self.team_emails).as_deref());

        let anchor = track
            .and_then(|track| self.engine.anchor(track, &meetings))
            .map(|anchor| anchor.starts_at);
        let history = match anchor {
            Some(anchor) => self.history(&lead, anchor).await?,
            None => None,
        };

        let state = self.engine.evaluate(
            CadenceInput {
                lead: &lead,
                meetings: &meetings,
                follow_ups_sent: history.as_ref().map(|history| history.count),
            },
            self.settings.today,
        );
        debug!(
            event_name = "digest.cadence.evaluated",
            correlation_id = %self.run_id,
            lead_id = %lead.id,
            state = ?state,
            "cadence evaluated"
        );

        Ok(Outcome::Kept(Assessment { lead, meetings, owner, history, state }))
    }

    fn outside_window<T>(&self, lead_id: &LeadId) -> Outcome<T> {
        debug!(
            event_name = "digest.lead.out_of_window",
            correlation_id = %self.run_id,
            lead_id = %lead_id,
            "first meeting is older than the lead's window"
        );
        Outcome::OutOfWindow
    }

    /// Follow-up history since the anchor. A CRM failure here leaves the count
    /// unknown, which keeps the lead out of today's due list.
    async fn history(
        &self,
        lead: &Lead,
        anchor: DateTime<Utc>,
    ) -> Result<Option<FollowUpHistory>, ApplicationError> {
        let emails = match self.crm.emails_since(&lead.id, anchor).await {
            Ok(emails) => emails,
            Err(source_error) => {
                let error = ApplicationError::from(source_error);
                if error.is_fatal() {
                    return Err(error);
                }
                warn!(
                    event_name = "digest.history.unavailable",
                    correlation_id = %self.run_id,
                    lead_id = %lead.id,
                    error = %error,
                    "follow-up count unavailable"
                );
                return Ok(None);
            }
        };
        let history = FollowUpHistory::from_emails(&emails, anchor);

        let debug_match = self
            .settings
            .debug_lead
            .as_deref()
            .is_some_and(|needle| lead.name.to_lowercase().contains(&needle.to_lowercase()));
        if debug_match {
            info!(
                event_name = "digest.debug.history",
                lead_id = %lead.id,
                lead_name = %lead.name,
                fetched = emails.len(),
                counted = history.count,
                "follow-up history"
            );
            for email in &history.emails {
                info!(
                    event_name = "digest.debug.email",
                    lead_id = %lead.id,
                    sent_at = %email.sent_at,
                    subject = %email.subject,
                    "counted follow-up"
                );
            }
        }

        Ok(Some(history))
    }

    /// Due leads, most overdue first, capped per owner. Returns the kept leads
    /// and how many were deferred to a later run.
    fn select_due(&self, assessments: Vec<Assessment>) -> (Vec<Assessment>, usize) {
        let mut due: Vec<Assessment> =
            assessments.into_iter().filter(|assessment| assessment.state.is_due()).collect();
        due.sort_by(|left, right| {
            right.days_overdue().cmp(&left.days_overdue()).then_with(|| left.lead.id.cmp(&right.lead.id))
        });

        let mut per_owner: HashMap<String, usize> = HashMap::new();
        let mut kept = Vec::new();
        let mut deferred = 0;
        for assessment in due {
            let count = per_owner.entry(assessment.owner.display_name.clone()).or_default();
            *count += 1;
            if *count <= self.settings.max_per_owner {
                kept.push(assessment);
            } else {
                deferred += 1;
            }
        }
        if deferred > 0 {
            info!(
                event_name = "digest.due.deferred",
                correlation_id = %self.run_id,
                deferred,
                max_per_owner = self.settings.max_per_owner,
                "per-owner cap deferred leads"
            );
        }
        (kept, deferred)
    }

    /// Lists every backend once over the span of the due leads' first calls.
    async fn load_catalog(&self, earliest_call: NaiveDate) -> Result<Catalog, ApplicationError> {
        let tolerance = Duration::days(i64::from(self.matcher.settings().date_tolerance_days));
        let range = DateRange::new(
            earliest_call - tolerance,
            self.settings.today + Duration::days(1),
        );

        let mut catalog = Catalog { backends: Vec::new(), unavailable: Vec::new() };
        for provider in &self.providers {
            match provider.list(range).await {
                Ok(records) => {
                    info!(
                        event_name = "digest.transcripts.listed",
                        correlation_id = %self.run_id,
                        source = provider.source().as_str(),
                        records = records.len(),
                        "listed transcript candidates"
                    );
                    catalog.backends.push(Backend { provider: Arc::clone(provider), records });
                }
                Err(source_error) => {
                    let error = ApplicationError::from(source_error);
                    if error.is_fatal() {
                        return Err(error);
                    }
                    warn!(
                        event_name = "digest.transcripts.unavailable",
                        correlation_id = %self.run_id,
                        source = provider.source().as_str(),
                        error = %error,
                        "transcript backend unavailable"
                    );
                    catalog.unavailable.push(provider.source());
                }
            }
        }
        Ok(catalog)
    }

    async fn draft_all(
        self: Arc<Self>,
        due: Vec<Assessment>,
        catalog: Arc<Catalog>,
    ) -> Result<(Vec<DigestEntry>, usize), ApplicationError> {
        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut tasks = JoinSet::new();
        for assessment in due {
            let pipeline = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let catalog = Arc::clone(&catalog);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|error| ApplicationError::Runtime(error.to_string()))?;
                pipeline.draft_lead(assessment, &catalog).await
            });
        }

        let mut entries = Vec::new();
        let mut skipped = 0;
        for outcome in join_all(tasks).await? {
            match outcome {
                Outcome::Kept(entry) => entries.push(entry),
                Outcome::Skipped | Outcome::OutOfWindow => skipped += 1,
            }
        }
        Ok((entries, skipped))
    }

    async fn draft_lead(
        &self,
        assessment: Assessment,
        catalog: &Catalog,
    ) -> Result<Outcome<DigestEntry>, ApplicationError> {
        let CadenceState::Due { track, touch, due_on, days_overdue } = assessment.state else {
            return Ok(Outcome::Skipped);
        };
        let Assessment { lead, meetings, owner, history, .. } = assessment;
        let history = history.unwrap_or_default();

        let call = meeting::first_completed(&meetings);
        let matched = match (track, call) {
            (Track::Rebook, _) | (_, None) => None,
            (_, Some(call)) => self.find_transcript(&lead.id, call, catalog).await?,
        };
        let call_date = call.map(|call| call.starts_at.date_naive());
        let days_since_call = match track {
            Track::Rebook => None,
            _ => call_date.map(|date| (self.settings.today - date).num_days()),
        };

        let request = AgentRequest {
            draft: DraftRequest {
                lead: &lead,
                owner: &owner,
                track,
                touch,
                transcript: matched.as_ref().map(|(record, _)| record),
                call_date,
            },
            history: &history,
            days_since_call,
            days_overdue: Some(days_overdue),
        };
        let (outcome, cached) = match self.draft(&request).await {
            Ok(drafted) => drafted,
            Err(error) => return self.skip_or_abort(&lead.id, "draft", error),
        };
        info!(
            event_name = "digest.lead.drafted",
            correlation_id = %self.run_id,
            lead_id = %lead.id,
            track = track.as_str(),
            touch,
            origin = ?outcome.draft.origin,
            cached,
            "draft ready"
        );

        let transcript = matched.map(|(record, score)| TranscriptMatch {
            source: record.source,
            has_transcript: record.has_body(),
            record_id: record.id,
            title: record.title,
            score,
        });
        Ok(Outcome::Kept(DigestEntry {
            lead_id: lead.id,
            lead_name: lead.name,
            lead_url: lead.url,
            owner: owner.display_name,
            track,
            touch,
            due_on,
            days_overdue,
            days_since_call,
            transcript,
            prior_emails: history.emails,
            draft: outcome.draft,
            cached,
            model_calls: outcome.model_calls,
            fallback_reason: outcome.fallback_reason,
            remaining_issues: outcome.remaining_issues,
            priority: outcome.priority,
        }))
    }

    /// First backend, in configured order, whose best match carries notes or a
    /// transcript. A match without content falls through to the next backend.
    async fn find_transcript(
        &self,
        lead_id: &LeadId,
        call: &Meeting,
        catalog: &Catalog,
    ) -> Result<Option<(TranscriptRecord, u32)>, ApplicationError> {
        for backend in &catalog.backends {
            let Some(found) = self.matcher.best_match(call, &backend.records) else {
                continue;
            };
            let score = found.score();
            debug!(
                event_name = "digest.match.accepted",
                correlation_id = %self.run_id,
                lead_id = %lead_id,
                source = backend.provider.source().as_str(),
                record_id = %found.record.id,
                score,
                breakdown = ?found.breakdown,
                "transcript matched"
            );

            let record = match self.complete(backend.provider.as_ref(), found.record.clone()).await {
                Ok(record) => record,
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    warn!(
                        event_name = "digest.match.hydrate_failed",
                        correlation_id = %self.run_id,
                        lead_id = %lead_id,
                        source = backend.provider.source().as_str(),
                        error = %error,
                        "matched transcript could not be read"
                    );
                    continue;
                }
            };
            if record.has_content() {
                return Ok(Some((record, score)));
            }
        }
        debug!(
            event_name = "digest.match.none",
            correlation_id = %self.run_id,
            lead_id = %lead_id,
            "no transcript for first call"
        );
        Ok(None)
    }

    /// Fills in a live record's body, consulting the transcript cache first.
    /// Rate-limited fetches are never cached so the next run retries them.
    async fn complete(
        &self,
        provider: &dyn TranscriptProvider,
        mut record: TranscriptRecord,
    ) -> Result<TranscriptRecord, ApplicationError> {
        if record.has_body() || provider.source() != TranscriptSource::Live {
            return Ok(provider.hydrate(record).await?);
        }

        if let Some(cache) = &self.transcript_cache {
            match cache.find_by_id(&record.id).await {
                Ok(Some(cached)) => {
                    record.body = cached.body;
                    return Ok(record);
                }
                Ok(None) => {}
                Err(error) => warn!(
                    event_name = "digest.transcript_cache.read_failed",
                    record_id = %record.id,
                    error = %error,
                    "transcript cache lookup failed"
                ),
            }
        }

        let hydrated = provider.hydrate(record).await?;
        if let Some(cache) = &self.transcript_cache {
            if let Err(error) = cache.save(&hydrated).await {
                warn!(
                    event_name = "digest.transcript_cache.write_failed",
                    record_id = %hydrated.id,
                    error = %error,
                    "transcript cache write failed"
                );
            }
        }
        Ok(hydrated)
    }

    /// Draft via the agent, memoized on the inputs when a model is involved.
    async fn draft(&self, request: &AgentRequest<'_>) -> Result<(DraftOutcome, bool), ApplicationError> {
        let key = match (&self.draft_cache, self.agent.is_generative()) {
            (Some(_), true) => {
                let plan = self.agent.composer().plan(&request.draft)?;
                let notes = request.draft.transcript.map(TranscriptRecord::call_notes).unwrap_or_default();
                let history = request.history.summary();
                Some(DraftCacheKey {
                    lead_id: request.draft.lead.id.clone(),
                    track: request.draft.track,
                    touch: request.draft.touch,
                    input_hash: input_fingerprint(&[notes.as_str(), history.as_str(), plan.template]),
                })
            }
            _ => None,
        };

        if let (Some(cache), Some(key)) = (&self.draft_cache, &key) {
            if !self.settings.fresh {
                match cache.find(key).await {
                    Ok(Some(draft)) => {
                        let outcome = DraftOutcome {
                            draft,
                            model_calls: 0,
                            fallback_reason: None,
                            remaining_issues: Vec::new(),
                            priority: None,
                        };
                        return Ok((outcome, true));
                    }
                    Ok(None) => {}
                    Err(error) => warn!(
                        event_name = "digest.draft_cache.read_failed",
                        lead_id = %key.lead_id,
                        error = %error,
                        "draft cache lookup failed"
                    ),
                }
            }
        }

        let outcome = self.agent.draft(request).await?;
        if let (Some(cache), Some(key)) = (&self.draft_cache, &key) {
            if outcome.draft.origin == DraftOrigin::Generative {
                if let Err(error) = cache.save(key, &outcome.draft).await {
                    warn!(
                        event_name = "digest.draft_cache.write_failed",
                        lead_id = %key.lead_id,
                        error = %error,
                        "draft cache write failed"
                    );
                }
            }
        }
        Ok((outcome, false))
    }

    fn skip_or_abort<T>(
        &self,
        lead_id: &LeadId,
        stage: &'static str,
        error: ApplicationError,
    ) -> Result<Outcome<T>, ApplicationError> {
        if error.is_fatal() {
            error!(
                event_name = "digest.run.aborted",
                correlation_id = %self.run_id,
                lead_id = %lead_id,
                stage,
                error_class = error.class().as_str(),
                error = %error,
                "fatal error, aborting run"
            );
            return Err(error);
        }
        warn!(
            event_name = "digest.lead.skipped",
            correlation_id = %self.run_id,
            lead_id = %lead_id,
            stage,
            error_class = error.class().as_str(),
            error = %error,
            "skipping lead"
        );
        Ok(Outcome::Skipped)
    }
}

fn tracker(assessments: &[Assessment]) -> Vec<TrackerEntry> {
    assessments.iter().map(Assessment::tracker_entry).collect()
}

/// Recent meetings plus the lead's full history, deduplicated and sorted.
fn merge_meetings(recent: Vec<Meeting>, history: Vec<Meeting>) -> Vec<Meeting> {
    let mut by_id: BTreeMap<String, Meeting> = BTreeMap::new();
    for meeting in recent.into_iter().chain(history) {
        by_id.entry(meeting.id.0.clone()).or_insert(meeting);
    }
    let mut meetings: Vec<Meeting> = by_id.into_values().collect();
    meetings.sort_by(|left, right| left.starts_at.cmp(&right.starts_at).then_with(|| left.id.0.cmp(&right.id.0)));
    meetings
}

fn sort_entries(entries: &mut [DigestEntry]) {
    entries.sort_by(|left, right| {
        right.days_overdue.cmp(&left.days_overdue).then_with(|| left.lead_id.cmp(&right.lead_id))
    });
}

/// Joins every task, aborting the rest on the first error.
async fn join_all<T: Send + 'static>(
    mut tasks: JoinSet<Result<T, ApplicationError>>,
) -> Result<Vec<T>, ApplicationError> {
    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(join_error) => Err(ApplicationError::Runtime(format!("lead task failed: {join_error}"))),
        };
        match outcome {
            Ok(value) => results.push(value),
            Err(error) => {
                tasks.abort_all();
                return Err(error);
            }
        }
    }
    Ok(results)
}
