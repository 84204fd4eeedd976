use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::lead::LeadId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeetingId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Completed,
    Canceled,
    NoShow,
    Other,
}

impl MeetingStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "completed" => Self::Completed,
            "canceled" | "cancelled" | "declined-by-lead" => Self::Canceled,
            "no-show" | "noshow" | "no_show" => Self::NoShow,
            _ => Self::Other,
        }
    }

    /// Canceled and no-show meetings both put a lead on the rebook track.
    pub fn is_missed(self) -> bool {
        matches!(self, Self::Canceled | Self::NoShow)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: MeetingId,
    pub lead_id: LeadId,
    pub title: String,
    pub status: MeetingStatus,
    pub starts_at: DateTime<Utc>,
    pub attendees: Vec<String>,
}

impl Meeting {
    pub fn is_completed(&self) -> bool {
        self.status == MeetingStatus::Completed
    }
}

/// Earliest completed meeting, the anchor for the standard cadence.
pub fn first_completed(meetings: &[Meeting]) -> Option<&Meeting> {
    meetings.iter().filter(|meeting| meeting.is_completed()).min_by_key(|meeting| meeting.starts_at)
}

/// True when the latest missed meeting is more recent than the latest completed one.
pub fn latest_is_missed(meetings: &[Meeting]) -> bool {
    let latest_completed = meetings
        .iter()
        .filter(|meeting| meeting.is_completed())
        .map(|meeting| meeting.starts_at)
        .max();
    let latest_missed = meetings
        .iter()
        .filter(|meeting| meeting.status.is_missed())
        .map(|meeting| meeting.starts_at)
        .max();

    match (latest_missed, latest_completed) {
        (Some(missed), Some(completed)) => missed > completed,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Earliest missed meeting after the latest completed one, the rebook anchor.
pub fn rebook_anchor(meetings: &[Meeting]) -> Option<&Meeting> {
    let latest_completed = meetings
        .iter()
        .filter(|meeting| meeting.is_completed())
        .map(|meeting| meeting.starts_at)
        .max();
    meetings
        .iter()
        .filter(|meeting| meeting.status.is_missed())
        .filter(|meeting| latest_completed.map_or(true, |completed| meeting.starts_at > completed))
        .min_by_key(|meeting| meeting.starts_at)
}
