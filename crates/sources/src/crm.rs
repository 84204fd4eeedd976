//! Close CRM reader. Only GET endpoints are exposed; writes are refused by
//! the shared [`HttpClient`] guard.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use touchpoint_core::config::CrmConfig;
use touchpoint_core::domain::followup::{EmailDirection, OutgoingEmail};
use touchpoint_core::domain::lead::{Lead, LeadId, Opportunity, OpportunityStatus, Qualification};
use touchpoint_core::domain::meeting::{Meeting, MeetingId, MeetingStatus};

use crate::error::SourceError;
use crate::http::{HttpClient, HttpSettings};

/// Meetings are listed by creation date, which can precede the start time by
/// up to a week when calls are booked ahead.
const MEETING_CREATION_SLACK_DAYS: i64 = 7;

#[async_trait]
pub trait CrmSource: Send + Sync {
    /// Meetings of any status starting at or after `since`.
    async fn meetings_since(&self, since: DateTime<Utc>) -> Result<Vec<Meeting>, SourceError>;
    /// Every meeting on the lead, oldest first.
    async fn meetings_for_lead(&self, id: &LeadId) -> Result<Vec<Meeting>, SourceError>;
    /// Lead record with its opportunities attached.
    async fn lead(&self, id: &LeadId) -> Result<Lead, SourceError>;
    async fn emails_since(
        &self,
        id: &LeadId,
        since: DateTime<Utc>,
    ) -> Result<Vec<OutgoingEmail>, SourceError>;
    /// Cheap authenticated request used by `doctor`.
    async fn ping(&self) -> Result<(), SourceError>;
}

pub struct CloseCrmClient {
    http: HttpClient,
    base_url: String,
    api_key: SecretString,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct RawAttendee {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMeeting {
    id: String,
    #[serde(default)]
    lead_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    starts_at: Option<String>,
    #[serde(default)]
    attendees: Vec<RawAttendee>,
}

#[derive(Debug, Deserialize)]
struct RawEmailAddress {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawContact {
    #[serde(default)]
    emails: Vec<RawEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct RawAddress {
    #[serde(default)]
    city: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLead {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    status_label: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    contacts: Vec<RawContact>,
    #[serde(default)]
    addresses: Vec<RawAddress>,
    #[serde(default)]
    custom: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawOpportunity {
    #[serde(default)]
    status_label: Option<String>,
    #[serde(default)]
    status_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEmail {
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    body_text: Option<String>,
    #[serde(default)]
    body_text_quoted: Option<String>,
    #[serde(default)]
    date_created: Option<String>,
    #[serde(default)]
    direction: Option<String>,
}

impl CloseCrmClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        page_size: u32,
        mut settings: HttpSettings,
    ) -> Result<Self, SourceError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let parsed = Url::parse(&base_url).map_err(|_| SourceError::InvalidUrl(base_url.clone()))?;
        if let Some(host) = parsed.host_str() {
            settings.read_only_hosts.push(host.to_string());
        }
        Ok(Self { http: HttpClient::new(settings)?, base_url, api_key, page_size: page_size.max(1) })
    }

    pub fn from_config(config: &CrmConfig) -> Result<Self, SourceError> {
        let settings = HttpSettings {
            timeout: Duration::from_secs(config.timeout_secs),
            max_attempts: config.max_retries,
            min_interval: Duration::from_millis(config.request_delay_ms),
            ..HttpSettings::default()
        };
        Self::new(config.base_url.clone(), config.api_key.clone(), config.page_size, settings)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        self.http
            .get_json(&url, |request| {
                request.basic_auth(self.api_key.expose_secret(), Some("")).query(query)
            })
            .await
    }

    async fn get_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, SourceError> {
        let mut collected = Vec::new();
        let mut skip = 0usize;

        loop {
            let mut paged = query.to_vec();
            paged.push(("_limit", self.page_size.to_string()));
            paged.push(("_skip", skip.to_string()));

            let page: Page<T> = self.get(path, &paged).await?;
            let received = page.data.len();
            collected.extend(page.data);
            skip += received;

            if !page.has_more || received == 0 {
                break;
            }
        }

        debug!(event_name = "sources.crm.paged", path, records = collected.len(), "fetched pages");
        Ok(collected)
    }

    async fn opportunities(&self, id: &LeadId) -> Result<Vec<Opportunity>, SourceError> {
        let raw: Vec<RawOpportunity> =
            self.get_all("/opportunity/", &[("lead_id", id.0.clone())]).await?;
        Ok(raw.into_iter().map(opportunity_from_raw).collect())
    }
}

#[async_trait]
impl CrmSource for CloseCrmClient {
    async fn meetings_since(&self, since: DateTime<Utc>) -> Result<Vec<Meeting>, SourceError> {
        let created_after = since - ChronoDuration::days(MEETING_CREATION_SLACK_DAYS);
        let raw: Vec<RawMeeting> = self
            .get_all("/activity/meeting/", &[("date_created__gte", crm_timestamp(created_after))])
            .await?;

        let mut meetings: Vec<Meeting> = raw
            .into_iter()
            .filter_map(meeting_from_raw)
            .filter(|meeting| meeting.starts_at >= since)
            .collect();
        sort_meetings(&mut meetings);
        Ok(meetings)
    }

    async fn meetings_for_lead(&self, id: &LeadId) -> Result<Vec<Meeting>, SourceError> {
        let raw: Vec<RawMeeting> =
            self.get_all("/activity/meeting/", &[("lead_id", id.0.clone())]).await?;
        let mut meetings: Vec<Meeting> = raw
            .into_iter()
            .filter_map(meeting_from_raw)
            .filter(|meeting| meeting.lead_id == *id)
            .collect();
        sort_meetings(&mut meetings);
        Ok(meetings)
    }

    async fn lead(&self, id: &LeadId) -> Result<Lead, SourceError> {
        let raw: RawLead = self.get(&format!("/lead/{}/", id.0), &[]).await?;
        let mut lead = lead_from_raw(raw);
        lead.opportunities = self.opportunities(id).await?;
        Ok(lead)
    }

    async fn emails_since(
        &self,
        id: &LeadId,
        since: DateTime<Utc>,
    ) -> Result<Vec<OutgoingEmail>, SourceError> {
        let raw: Vec<RawEmail> = self
            .get_all(
                "/activity/email/",
                &[("lead_id", id.0.clone()), ("date_created__gte", crm_timestamp(since))],
            )
            .await?;
        Ok(raw.into_iter().filter_map(email_from_raw).collect())
    }

    async fn ping(&self) -> Result<(), SourceError> {
        let _: Value = self.get("/me/", &[]).await?;
        Ok(())
    }
}

fn sort_meetings(meetings: &mut [Meeting]) {
    meetings.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then_with(|| a.id.0.cmp(&b.id.0)));
}

fn crm_timestamp(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%S+00:00").to_string()
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim()).ok().map(|value| value.with_timezone(&Utc))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn meeting_from_raw(raw: RawMeeting) -> Option<Meeting> {
    let lead_id = non_empty(raw.lead_id)?;
    let starts_at = raw.starts_at.as_deref().and_then(parse_timestamp)?;
    Some(Meeting {
        id: MeetingId(raw.id),
        lead_id: LeadId(lead_id),
        title: raw.title.unwrap_or_default().trim().to_string(),
        status: MeetingStatus::parse(raw.status.as_deref().unwrap_or_default()),
        starts_at,
        attendees: raw
            .attendees
            .into_iter()
            .filter_map(|attendee| non_empty(attendee.email))
            .map(|email| email.to_lowercase())
            .collect(),
    })
}

/// Text of a custom field that may be stored as a string, number or list.
fn custom_text(custom: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match custom.get(key)? {
        Value::String(text) => non_empty(Some(text.clone())),
        Value::Number(number) => Some(number.to_string()),
        Value::Array(items) => {
            let joined = items.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(", ");
            non_empty(Some(joined))
        }
        _ => None,
    }
}

fn custom_list(custom: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
    match custom.get(key) {
        Some(Value::Array(items)) => {
            items.iter().filter_map(Value::as_str).map(|item| item.trim().to_string()).collect()
        }
        Some(Value::String(item)) if !item.trim().is_empty() => vec![item.trim().to_string()],
        _ => Vec::new(),
    }
}

fn lead_from_raw(raw: RawLead) -> Lead {
    let email = raw
        .contacts
        .into_iter()
        .flat_map(|contact| contact.emails)
        .find_map(|address| non_empty(address.email));
    let city = raw.addresses.into_iter().find_map(|address| non_empty(address.city));

    Lead {
        id: LeadId(raw.id),
        name: raw.display_name.unwrap_or_default().trim().to_string(),
        email,
        city,
        qualification: Qualification {
            budget: custom_text(&raw.custom, "Budget"),
            health_spend: custom_text(&raw.custom, "Annual spend on health and wellness"),
            home_size: custom_text(&raw.custom, "Square Footage"),
        },
        source: custom_text(&raw.custom, "How did you hear about us?"),
        reason: custom_text(&raw.custom, "Why are you reaching out"),
        status_label: non_empty(raw.status_label),
        categories: custom_list(&raw.custom, "Category"),
        opportunities: Vec::new(),
        url: non_empty(raw.html_url),
    }
}

fn opportunity_from_raw(raw: RawOpportunity) -> Opportunity {
    let status = match raw.status_type.as_deref().map(str::trim).map(str::to_ascii_lowercase) {
        Some(kind) if kind == "won" => OpportunityStatus::Won,
        Some(kind) if kind == "lost" => OpportunityStatus::Lost,
        _ => OpportunityStatus::Open,
    };
    Opportunity { label: raw.status_label.unwrap_or_default().trim().to_string(), status }
}

fn email_from_raw(raw: RawEmail) -> Option<OutgoingEmail> {
    let sent_at = raw.date_created.as_deref().and_then(parse_timestamp)?;
    let direction = match raw.direction.as_deref() {
        Some("outgoing") => EmailDirection::Outgoing,
        _ => EmailDirection::Incoming,
    };
    let body = non_empty(raw.body_text).or_else(|| non_empty(raw.body_text_quoted)).unwrap_or_default();
    Some(OutgoingEmail { subject: raw.subject.unwrap_or_default(), body, sent_at, direction })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use mockito::Matcher;
    use secrecy::SecretString;

    use touchpoint_core::domain::followup::EmailDirection;
    use touchpoint_core::domain::lead::{LeadId, OpportunityStatus};
    use touchpoint_core::domain::meeting::MeetingStatus;

    use super::{CloseCrmClient, CrmSource};
    use crate::http::HttpSettings;

    const AUTH: &str = "Basic a2V5Og==";

    fn client(base_url: &str, page_size: u32) -> CloseCrmClient {
        CloseCrmClient::new(
            base_url,
            SecretString::from("key".to_string()),
            page_size,
            HttpSettings {
                timeout: Duration::from_secs(5),
                max_attempts: 2,
                backoff: Duration::from_millis(1),
                ..HttpSettings::default()
            },
        )
        .expect("client")
    }

    #[tokio::test]
    async fn meetings_follow_pagination_and_drop_unusable_rows() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/activity/meeting/")
            .match_header("authorization", AUTH)
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("_limit".into(), "2".into()),
                Matcher::UrlEncoded("_skip".into(), "0".into()),
            ]))
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"has_more": true, "data": [
                    {"id": "m1", "lead_id": "lead_a", "title": "Intro", "status": "completed",
                     "starts_at": "2026-03-02T15:00:00+00:00",
                     "attendees": [{"email": "Jane@Example.com"}, {"email": null}]},
                    {"id": "m2", "lead_id": "", "status": "completed", "starts_at": "2026-03-02T15:00:00+00:00"}
                ]}"#,
            )
            .create_async()
            .await;
        let second = server
            .mock("GET", "/activity/meeting/")
            .match_query(Matcher::UrlEncoded("_skip".into(), "2".into()))
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"has_more": false, "data": [
                    {"id": "m3", "lead_id": "lead_b", "title": "Intro", "status": "no-show",
                     "starts_at": "2026-03-01T15:00:00Z", "attendees": []},
                    {"id": "m4", "lead_id": "lead_c", "status": "completed", "starts_at": "2026-01-01T15:00:00Z"}
                ]}"#,
            )
            .create_async()
            .await;

        let since = Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0).single().expect("since");
        let meetings = client(&server.url(), 2).meetings_since(since).await.expect("meetings");

        let ids: Vec<&str> = meetings.iter().map(|meeting| meeting.id.0.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m1"]);
        assert_eq!(meetings[0].status, MeetingStatus::NoShow);
        assert_eq!(meetings[1].attendees, vec!["jane@example.com".to_string()]);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn lead_meetings_include_calls_older_than_any_window() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/activity/meeting/")
            .match_query(Matcher::UrlEncoded("lead_id".into(), "lead_a".into()))
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"has_more": false, "data": [
                    {"id": "m9", "lead_id": "lead_a", "title": "Second call", "status": "completed",
                     "starts_at": "2026-02-25T15:00:00Z"},
                    {"id": "m1", "lead_id": "lead_a", "title": "Intro", "status": "completed",
                     "starts_at": "2025-06-10T15:00:00Z"}
                ]}"#,
            )
            .create_async()
            .await;

        let meetings =
            client(&server.url(), 100).meetings_for_lead(&LeadId("lead_a".into())).await.expect("meetings");

        let ids: Vec<&str> = meetings.iter().map(|meeting| meeting.id.0.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m9"]);
    }

    #[tokio::test]
    async fn lead_reads_custom_fields_and_opportunities() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/lead/lead_a/")
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id": "lead_a", "display_name": "Jane Doe", "status_label": "Potential",
                    "html_url": "https://app.close.com/lead/lead_a/",
                    "contacts": [{"emails": [{"email": "jane@example.com"}]}],
                    "addresses": [{"city": "Austin"}],
                    "custom": {"Category": ["Customer Lead"], "Budget": "$5k+",
                               "Square Footage": 2400,
                               "How did you hear about us?": "Podcast"}}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/opportunity/")
            .match_query(Matcher::UrlEncoded("lead_id".into(), "lead_a".into()))
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"has_more": false, "data": [
                    {"status_label": "Follow up", "status_type": "active"},
                    {"status_label": "Not now", "status_type": "lost"}
                ]}"#,
            )
            .create_async()
            .await;

        let lead = client(&server.url(), 100).lead(&LeadId("lead_a".into())).await.expect("lead");

        assert_eq!(lead.name, "Jane Doe");
        assert_eq!(lead.email.as_deref(), Some("jane@example.com"));
        assert_eq!(lead.city.as_deref(), Some("Austin"));
        assert_eq!(lead.qualification.home_size.as_deref(), Some("2400"));
        assert_eq!(lead.source.as_deref(), Some("Podcast"));
        assert!(lead.in_category("customer lead"));
        assert_eq!(lead.opportunities.len(), 2);
        assert_eq!(lead.opportunity_status(), Some(OpportunityStatus::Lost));
    }

    #[tokio::test]
    async fn emails_keep_direction_and_prefer_plain_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/activity/email/")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("lead_id".into(), "lead_a".into()),
                Matcher::UrlEncoded("date_created__gte".into(), "2026-03-02T15:00:00+00:00".into()),
            ]))
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"has_more": false, "data": [
                    {"subject": "Your report", "body_text": "", "body_text_quoted": "Quoted body",
                     "date_created": "2026-03-03T10:00:00Z", "direction": "outgoing"},
                    {"subject": "Re: Your report", "body_text": "Thanks!",
                     "date_created": "2026-03-03T12:00:00Z", "direction": "incoming"},
                    {"subject": "No date", "direction": "outgoing"}
                ]}"#,
            )
            .create_async()
            .await;

        let since = Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).single().expect("since");
        let emails =
            client(&server.url(), 100).emails_since(&LeadId("lead_a".into()), since).await.expect("emails");

        assert_eq!(emails.len(), 2);
        assert_eq!(emails[0].body, "Quoted body");
        assert_eq!(emails[0].direction, EmailDirection::Outgoing);
        assert_eq!(emails[1].direction, EmailDirection::Incoming);
    }

    #[tokio::test]
    async fn upstream_failure_surfaces_status() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/me/").with_status(401).create_async().await;

        let error = client(&server.url(), 100).ping().await.expect_err("unauthorized");
        assert!(error.to_string().contains("401"));
    }
}
