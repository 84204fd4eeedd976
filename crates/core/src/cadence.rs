//! Follow-up cadence state.
//!
//! The engine is a pure function of (lead, meetings, follow-up count, today).
//! The count is derived from CRM email activity on every run, so nothing is
//! persisted between runs.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::domain::lead::{Lead, Opportunity, OpportunityStatus};
use crate::domain::meeting::{self, Meeting};

pub const STANDARD_OFFSETS: [u32; 7] = [1, 3, 6, 10, 16, 25, 35];
pub const NURTURE_OFFSETS: [u32; 6] = [60, 120, 180, 240, 300, 360];
pub const REBOOK_OFFSETS: [u32; 5] = [1, 3, 7, 14, 30];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Standard,
    Nurture,
    Rebook,
}

impl Track {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Nurture => "nurture",
            Self::Rebook => "rebook",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(Self::Standard),
            "nurture" => Some(Self::Nurture),
            "rebook" => Some(Self::Rebook),
            _ => None,
        }
    }

    pub fn touch_label(&self) -> &'static str {
        match self {
            Self::Standard => "FU",
            Self::Nurture => "nurture",
            Self::Rebook => "rebook",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum ExclusionReason {
    Won,
    Disqualified(String),
    SkippedStatus(String),
    OutsideCategory,
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Won => f.write_str("won opportunity"),
            Self::Disqualified(term) => write!(f, "disqualifying term `{term}`"),
            Self::SkippedStatus(status) => write!(f, "lead status `{status}`"),
            Self::OutsideCategory => f.write_str("outside processed category"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum CadenceState {
    /// `next_touch` is `None` when there is no anchor meeting or no count signal.
    NotYetDue { track: Track, next_touch: Option<u32>, due_on: Option<NaiveDate> },
    Due { track: Track, touch: u32, due_on: NaiveDate, days_overdue: i64 },
    Completed { track: Track, touches_sent: u32 },
    Excluded { reason: ExclusionReason },
}

impl CadenceState {
    pub fn is_due(&self) -> bool {
        matches!(self, Self::Due { .. })
    }

    pub fn track(&self) -> Option<Track> {
        match self {
            Self::NotYetDue { track, .. } | Self::Due { track, .. } | Self::Completed { track, .. } => {
                Some(*track)
            }
            Self::Excluded { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CadenceSettings {
    pub standard_offsets: Vec<u32>,
    pub nurture_offsets: Vec<u32>,
    pub rebook_offsets: Vec<u32>,
    pub disqualifying_terms: Vec<String>,
    pub skip_statuses: Vec<String>,
    pub won_labels: Vec<String>,
    pub lost_labels: Vec<String>,
    pub category: Option<String>,
}

impl Default for CadenceSettings {
    fn default() -> Self {
        Self {
            standard_offsets: STANDARD_OFFSETS.to_vec(),
            nurture_offsets: NURTURE_OFFSETS.to_vec(),
            rebook_offsets: REBOOK_OFFSETS.to_vec(),
            disqualifying_terms: vec!["testing".to_string()],
            skip_statuses: vec!["unqualified".to_string(), "not interested".to_string()],
            won_labels: [
                "booked assessment",
                "test completed",
                "report completed",
                "won",
                "free test booked",
                "free test completed",
                "referred first lead",
            ]
            .iter()
            .map(|label| label.to_string())
            .collect(),
            lost_labels: vec!["lost".to_string()],
            category: Some("Customer Lead".to_string()),
        }
    }
}

impl CadenceSettings {
    pub fn offsets(&self, track: Track) -> &[u32] {
        match track {
            Track::Standard => &self.standard_offsets,
            Track::Nurture => &self.nurture_offsets,
            Track::Rebook => &self.rebook_offsets,
        }
    }

    /// Opportunity status after applying the configured label sets.
    pub fn classify(&self, opportunity: &Opportunity) -> OpportunityStatus {
        let label = opportunity.label.trim().to_lowercase();
        if opportunity.status == OpportunityStatus::Won || contains_label(&self.won_labels, &label) {
            OpportunityStatus::Won
        } else if opportunity.status == OpportunityStatus::Lost
            || contains_label(&self.lost_labels, &label)
        {
            OpportunityStatus::Lost
        } else {
            OpportunityStatus::Open
        }
    }
}

fn contains_label(labels: &[String], label: &str) -> bool {
    labels.iter().any(|candidate| candidate.eq_ignore_ascii_case(label))
}

/// Everything the engine needs for one lead.
#[derive(Clone, Copy, Debug)]
pub struct CadenceInput<'a> {
    pub lead: &'a Lead,
    pub meetings: &'a [Meeting],
    /// Follow-ups sent since the anchor; `None` when the CRM could not be read.
    pub follow_ups_sent: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct CadenceEngine {
    settings: CadenceSettings,
}

impl CadenceEngine {
    pub fn new(settings: CadenceSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CadenceSettings {
        &self.settings
    }

    /// Track the lead is on, or the reason it is excluded.
    pub fn track_for(&self, lead: &Lead, meetings: &[Meeting]) -> Result<Track, ExclusionReason> {
        if let Some(reason) = self.exclusion(lead) {
            return Err(reason);
        }

        let lost = lead
            .opportunities
            .iter()
            .any(|opportunity| self.settings.classify(opportunity) == OpportunityStatus::Lost);
        if lost {
            Ok(Track::Nurture)
        } else if meeting::latest_is_missed(meetings) {
            Ok(Track::Rebook)
        } else {
            Ok(Track::Standard)
        }
    }

    /// Meeting the track's offsets are measured from.
    pub fn anchor<'m>(&self, track: Track, meetings: &'m [Meeting]) -> Option<&'m Meeting> {
        match track {
            Track::Standard | Track::Nurture => meeting::first_completed(meetings),
            Track::Rebook => meeting::rebook_anchor(meetings),
        }
    }

    pub fn evaluate(&self, input: CadenceInput<'_>, today: NaiveDate) -> CadenceState {
        let track = match self.track_for(input.lead, input.meetings) {
            Ok(track) => track,
            Err(reason) => return CadenceState::Excluded { reason },
        };
        let Some(anchor) = self.anchor(track, input.meetings) else {
            return CadenceState::NotYetDue { track, next_touch: None, due_on: None };
        };
        let Some(sent) = input.follow_ups_sent else {
            return CadenceState::NotYetDue { track, next_touch: None, due_on: None };
        };

        let offsets = self.settings.offsets(track);
        let Some(offset) = offsets.get(sent as usize) else {
            return CadenceState::Completed { track, touches_sent: sent };
        };

        let touch = sent + 1;
        let due_on = anchor.starts_at.date_naive() + Duration::days(i64::from(*offset));
        let days_overdue = (today - due_on).num_days();
        if days_overdue >= 0 {
            CadenceState::Due { track, touch, due_on, days_overdue }
        } else {
            CadenceState::NotYetDue { track, next_touch: Some(touch), due_on: Some(due_on) }
        }
    }

    fn exclusion(&self, lead: &Lead) -> Option<ExclusionReason> {
        let won = lead
            .opportunities
            .iter()
            .any(|opportunity| self.settings.classify(opportunity) == OpportunityStatus::Won);
        if won {
            return Some(ExclusionReason::Won);
        }

        let name = lead.name.to_lowercase();
        for term in &self.settings.disqualifying_terms {
            let term_lower = term.to_lowercase();
            let in_opportunity = lead
                .opportunities
                .iter()
                .any(|opportunity| opportunity.label.to_lowercase().contains(&term_lower));
            if name.contains(&term_lower) || in_opportunity {
                return Some(ExclusionReason::Disqualified(term.clone()));
            }
        }

        if let Some(status) = &lead.status_label {
            if contains_label(&self.settings.skip_statuses, status.trim()) {
                return Some(ExclusionReason::SkippedStatus(status.clone()));
            }
        }

        match &self.settings.category {
            Some(category) if !lead.in_category(category) => Some(ExclusionReason::OutsideCategory),
            _ => None,
        }
    }
}
