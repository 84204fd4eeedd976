use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::transcript::char_prefix;

pub const SENT_EMAIL_BODY_CAP: usize = 1000;

const SCHEDULING_SUBJECTS: &[&str] =
    &["test call between", "testing call between", "partner call between", "intro call between"];
const THREAD_PREFIXES: &[&str] = &["re:", "fwd:", "fw:", "[int]", ".re:"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailDirection {
    Outgoing,
    Incoming,
}

/// Email activity metadata as read from the CRM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub direction: EmailDirection,
}

/// Latest email sent to a lead on a given day within one thread.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentEmail {
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Follow-up count derived from outgoing email activity.
///
/// A follow-up is one (thread, calendar day) pair: several emails on the same
/// day in the same thread count once, the same thread on two days counts
/// twice. The count is an approximation of "touches sent" and can drift when
/// the team changes subject lines mid-thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpHistory {
    pub count: u32,
    pub emails: Vec<SentEmail>,
}

impl FollowUpHistory {
    pub fn from_emails(emails: &[OutgoingEmail], anchor: DateTime<Utc>) -> Self {
        let mut threads: BTreeMap<String, BTreeMap<NaiveDate, SentEmail>> = BTreeMap::new();

        for email in emails {
            if email.direction != EmailDirection::Outgoing || email.sent_at < anchor {
                continue;
            }
            let subject = match email.subject.trim() {
                "" => "(no subject)",
                subject => subject,
            };
            if !counts_as_follow_up(subject) {
                continue;
            }

            let days = threads.entry(normalize_subject(subject)).or_default();
            let day = email.sent_at.date_naive();
            let replace = days.get(&day).map_or(true, |existing| email.sent_at > existing.sent_at);
            if replace {
                let body = email.body.trim();
                let body = if body.chars().count() > SENT_EMAIL_BODY_CAP {
                    format!("{}...", char_prefix(body, SENT_EMAIL_BODY_CAP))
                } else {
                    body.to_string()
                };
                days.insert(day, SentEmail { subject: subject.to_string(), body, sent_at: email.sent_at });
            }
        }

        let mut flattened: Vec<SentEmail> =
            threads.into_values().flat_map(|days| days.into_values()).collect();
        flattened.sort_by_key(|email| email.sent_at);

        Self { count: flattened.len() as u32, emails: flattened }
    }

    /// Prior emails rendered for prompt context, oldest first.
    pub fn summary(&self) -> String {
        self.emails
            .iter()
            .enumerate()
            .map(|(index, email)| {
                format!(
                    "--- Email {} ({}) ---\nSubject: {}\n{}",
                    index + 1,
                    email.sent_at.format("%Y-%m-%d"),
                    email.subject,
                    email.body
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// True when any prior email body or subject mentions `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.emails.iter().any(|email| {
            email.body.to_lowercase().contains(&needle) || email.subject.to_lowercase().contains(&needle)
        })
    }
}

fn counts_as_follow_up(subject: &str) -> bool {
    let lowered = subject.to_lowercase();
    if lowered.contains("assessment") {
        return false;
    }
    let scheduling = SCHEDULING_SUBJECTS.iter().any(|pattern| lowered.contains(pattern));
    let reply = lowered.starts_with("re:") || lowered.starts_with("fwd:");
    !scheduling || reply
}

/// Root thread subject: reply/forward markers stripped repeatedly, lowercased.
pub fn normalize_subject(subject: &str) -> String {
    let mut current = subject.trim().to_lowercase();
    loop {
        let stripped = THREAD_PREFIXES
            .iter()
            .find_map(|prefix| current.strip_prefix(prefix))
            .map(|rest| rest.trim().to_string());
        match stripped {
            Some(rest) => current = rest,
            None => return current,
        }
    }
}
