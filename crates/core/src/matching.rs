//! Meeting to transcript matching.
//!
//! Each candidate transcript is scored against a CRM meeting:
//! 10 points per shared non-team attendee email, 8/6/5 for an exact,
//! substring or fuzzy title match (best tier only) and 2 when the dates fall
//! inside the tolerance window. The highest total at or above the threshold
//! wins; ties go to the candidate closest in date.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::domain::meeting::Meeting;
use crate::domain::transcript::TranscriptRecord;

pub const ATTENDEE_POINTS: u32 = 10;
pub const EXACT_TITLE_POINTS: u32 = 8;
pub const SUBSTRING_TITLE_POINTS: u32 = 6;
pub const FUZZY_TITLE_POINTS: u32 = 5;
pub const DATE_POINTS: u32 = 2;

#[derive(Clone, Debug, PartialEq)]
pub struct MatchSettings {
    pub threshold: u32,
    pub date_tolerance_days: u32,
    pub fuzzy_title_threshold: f64,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self { threshold: 5, date_tolerance_days: 1, fuzzy_title_threshold: 0.85 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleTier {
    None,
    Fuzzy,
    Substring,
    Exact,
}

impl TitleTier {
    pub fn points(self) -> u32 {
        match self {
            Self::Exact => EXACT_TITLE_POINTS,
            Self::Substring => SUBSTRING_TITLE_POINTS,
            Self::Fuzzy => FUZZY_TITLE_POINTS,
            Self::None => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScoreBreakdown {
    pub shared_attendees: u32,
    pub title_tier: TitleTier,
    pub date_within_tolerance: bool,
    /// Absolute calendar-day distance, `None` when the record has no date.
    pub date_distance_days: Option<i64>,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u32 {
        self.shared_attendees * ATTENDEE_POINTS
            + self.title_tier.points()
            + if self.date_within_tolerance { DATE_POINTS } else { 0 }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MatchResult<'a> {
    pub record: &'a TranscriptRecord,
    pub breakdown: ScoreBreakdown,
}

impl MatchResult<'_> {
    pub fn score(&self) -> u32 {
        self.breakdown.total()
    }
}

#[derive(Clone, Debug)]
pub struct MeetingMatcher {
    settings: MatchSettings,
    team_emails: BTreeSet<String>,
}

impl MeetingMatcher {
    pub fn new<I, S>(settings: MatchSettings, team_emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let team_emails =
            team_emails.into_iter().map(|email| email.as_ref().trim().to_lowercase()).collect();
        Self { settings, team_emails }
    }

    pub fn settings(&self) -> &MatchSettings {
        &self.settings
    }

    pub fn score(&self, meeting: &Meeting, record: &TranscriptRecord) -> ScoreBreakdown {
        let meeting_emails = self.external_emails(meeting.attendees.iter());
        let record_emails = self.external_emails(record.attendees.iter());
        let shared_attendees = meeting_emails.intersection(&record_emails).count() as u32;

        let title_tier = std::iter::once(record.title.as_str())
            .chain(record.alternate_title.as_deref())
            .map(|title| self.title_tier(&meeting.title, title))
            .max()
            .unwrap_or(TitleTier::None);

        let date_distance_days = record.date.map(|date| {
            (date.date_naive() - meeting.starts_at.date_naive()).num_days().abs()
        });
        let date_within_tolerance = date_distance_days
            .is_some_and(|distance| distance <= i64::from(self.settings.date_tolerance_days));

        ScoreBreakdown { shared_attendees, title_tier, date_within_tolerance, date_distance_days }
    }

    /// Best candidate for `meeting`, or `None` when nothing reaches the threshold.
    pub fn best_match<'a>(
        &self,
        meeting: &Meeting,
        candidates: &'a [TranscriptRecord],
    ) -> Option<MatchResult<'a>> {
        let mut best: Option<MatchResult<'a>> = None;
        for record in candidates {
            let breakdown = self.score(meeting, record);
            if breakdown.total() < self.settings.threshold {
                continue;
            }
            let replace = match &best {
                None => true,
                Some(current) => outranks(&breakdown, &current.breakdown),
            };
            if replace {
                best = Some(MatchResult { record, breakdown });
            }
        }
        best
    }

    fn external_emails<'a, I>(&self, emails: I) -> BTreeSet<String>
    where
        I: Iterator<Item = &'a String>,
    {
        emails
            .map(|email| email.trim().to_lowercase())
            .filter(|email| !email.is_empty() && !self.team_emails.contains(email))
            .collect()
    }

    fn title_tier(&self, meeting_title: &str, record_title: &str) -> TitleTier {
        let left = meeting_title.trim().to_lowercase();
        let right = record_title.trim().to_lowercase();
        if left.is_empty() || right.is_empty() {
            return TitleTier::None;
        }
        if left == right {
            TitleTier::Exact
        } else if left.contains(&right) || right.contains(&left) {
            TitleTier::Substring
        } else if strsim::jaro_winkler(&left, &right) >= self.settings.fuzzy_title_threshold {
            TitleTier::Fuzzy
        } else {
            TitleTier::None
        }
    }
}

/// Strictly better: higher score, then closer date. Dated beats undated.
fn outranks(candidate: &ScoreBreakdown, current: &ScoreBreakdown) -> bool {
    match candidate.total().cmp(&current.total()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => match (candidate.date_distance_days, current.date_distance_days)
        {
            (Some(left), Some(right)) => left < right,
            (Some(_), None) => true,
            _ => false,
        },
    }
}
