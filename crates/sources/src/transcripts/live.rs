//! Live note-taker backend: JSON-RPC tool calls over streamable HTTP.
//!
//! The bearer token comes from a token file written out of band. When it is
//! close to expiry it is refreshed through the OAuth token endpoint and the
//! file is rewritten.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use touchpoint_core::domain::transcript::{TranscriptRecord, TranscriptSource};

use crate::error::SourceError;
use crate::http::{HttpClient, HttpSettings};
use crate::transcripts::{DateRange, TranscriptProvider};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
const SESSION_HEADER: &str = "MCP-Session-Id";
const CLIENT_NAME: &str = "touchpoint";
/// Tokens with less than this many seconds left are refreshed first.
const REFRESH_MARGIN_SECS: i64 = 30;
const MEETING_DATE_FORMAT: &str = "%b %d, %Y %I:%M %p";

static MEETING_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<meeting id="([^"]+)" title="([^"]*)" date="([^"]*)">(.*?)</meeting>"#)
        .expect("meeting block pattern is valid")
});

static ATTENDEE_EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^>\s]+@[^>\s]+)>").expect("attendee email pattern is valid"));

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TokenClient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Tokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    #[serde(default)]
    client: TokenClient,
    #[serde(default)]
    tokens: Tokens,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AuthServerMetadata {
    token_endpoint: String,
}

/// Token file plus the endpoint used to refresh it.
pub struct TokenStore {
    path: PathBuf,
    endpoint: Option<String>,
    state: Mutex<Option<TokenFile>>,
}

impl TokenStore {
    pub fn new(path: PathBuf, endpoint: Option<String>) -> Self {
        Self { path, endpoint, state: Mutex::new(None) }
    }

    async fn load(&self) -> Result<TokenFile, SourceError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SourceError::Auth(format!("token file {} not found", self.path.display()))
            } else {
                SourceError::Io { path: self.path.clone(), source }
            }
        })?;
        serde_json::from_str(&raw).map_err(|error| SourceError::Decode(format!("token file: {error}")))
    }

    async fn save(&self, file: &TokenFile) -> Result<(), SourceError> {
        let raw = serde_json::to_string_pretty(file).map_err(|error| SourceError::Decode(error.to_string()))?;
        let io_error = |source| SourceError::Io { path: self.path.clone(), source };
        tokio::fs::write(&self.path, raw).await.map_err(io_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let owner_only = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, owner_only).await.map_err(io_error)?;
        }
        Ok(())
    }

    /// Current access token, refreshing it first when it is about to expire.
    pub async fn access_token(&self, http: &HttpClient, live_url: &str) -> Result<String, SourceError> {
        let mut guard = self.state.lock().await;
        let mut file = match guard.take() {
            Some(file) => file,
            None => self.load().await?,
        };

        let now = Utc::now().timestamp();
        let fresh = file.tokens.expires_at.is_some_and(|expires_at| expires_at - now > REFRESH_MARGIN_SECS);
        if let (Some(token), true) = (&file.tokens.access_token, fresh) {
            let token = token.clone();
            *guard = Some(file);
            return Ok(token);
        }

        let refresh_token = file
            .tokens
            .refresh_token
            .clone()
            .ok_or_else(|| SourceError::Auth("access token expired and no refresh token is stored".into()))?;
        let client_id = file.client.client_id.clone().unwrap_or_default();
        let endpoint = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => discover_token_endpoint(http, live_url).await?,
        };

        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", client_id.as_str()),
            ("refresh_token", refresh_token.as_str()),
        ];
        let response = http.execute(Method::POST, &endpoint, |request| request.form(&form)).await?;
        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|error| SourceError::Auth(format!("token refresh response: {error}")))?;

        file.tokens.access_token = Some(refreshed.access_token.clone());
        if let Some(rotated) = refreshed.refresh_token {
            file.tokens.refresh_token = Some(rotated);
        }
        file.tokens.expires_at = Some(now + refreshed.expires_in.unwrap_or_default());
        self.save(&file).await?;
        info!(event_name = "sources.live.token_refreshed", path = %self.path.display(), "access token refreshed");

        *guard = Some(file);
        Ok(refreshed.access_token)
    }
}

async fn discover_token_endpoint(http: &HttpClient, live_url: &str) -> Result<String, SourceError> {
    let parsed = Url::parse(live_url).map_err(|_| SourceError::InvalidUrl(live_url.to_string()))?;
    let metadata_url = format!("{}/.well-known/oauth-authorization-server", parsed.origin().ascii_serialization());
    let metadata: AuthServerMetadata = http.get_json(&metadata_url, |request| request).await?;
    Ok(metadata.token_endpoint)
}

pub struct LiveTranscriptClient {
    url: String,
    http: HttpClient,
    tokens: TokenStore,
    session_id: Mutex<Option<String>>,
    initialized: OnceCell<()>,
    next_id: AtomicU64,
}

impl LiveTranscriptClient {
    pub fn new(url: &str, tokens: TokenStore) -> Result<Self, SourceError> {
        Url::parse(url).map_err(|_| SourceError::InvalidUrl(url.to_string()))?;
        Ok(Self {
            url: url.to_string(),
            http: HttpClient::new(HttpSettings::default())?,
            tokens,
            session_id: Mutex::new(None),
            initialized: OnceCell::new(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, SourceError> {
        let token = self.tokens.access_token(&self.http, &self.url).await?;
        let session = self.session_id.lock().await.clone();
        let payload = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .execute(Method::POST, &self.url, |request| {
                let request = request
                    .bearer_auth(&token)
                    .header("MCP-Protocol-Version", PROTOCOL_VERSION)
                    .header(ACCEPT, "application/json, text/event-stream")
                    .json(&payload);
                match &session {
                    Some(id) => request.header(SESSION_HEADER, id),
                    None => request,
                }
            })
            .await?;

        if let Some(id) = response.headers().get(SESSION_HEADER).and_then(|value| value.to_str().ok()) {
            *self.session_id.lock().await = Some(id.to_string());
        }
        let streamed = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.to_ascii_lowercase().contains("text/event-stream"));
        let body = response
            .text()
            .await
            .map_err(|source| SourceError::Transport { url: self.url.clone(), source })?;

        let envelope = if streamed {
            last_event_frame(&body)?
        } else {
            serde_json::from_str(&body).map_err(|error| SourceError::Decode(error.to_string()))?
        };

        if let Some(error) = envelope.get("error") {
            let message = error.get("message").and_then(Value::as_str).map(str::to_string);
            let message = message.unwrap_or_else(|| error.to_string());
            if is_rate_limit(&message) {
                return Err(SourceError::RateLimited(message));
            }
            return Err(SourceError::Decode(format!("{method} failed: {message}")));
        }
        debug!(event_name = "sources.live.rpc", method, "rpc call completed");
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn ensure_initialized(&self) -> Result<(), SourceError> {
        self.initialized
            .get_or_try_init(|| async {
                self.rpc(
                    "initialize",
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "clientInfo": {"name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION")},
                        "capabilities": {},
                    }),
                )
                .await
                .map(|_| ())
            })
            .await
            .map(|_| ())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, SourceError> {
        self.ensure_initialized().await?;
        let result = self.rpc("tools/call", json!({"name": name, "arguments": arguments})).await?;
        Ok(tool_text(&result))
    }

    /// Transcript body for one meeting. An empty string means the meeting has
    /// no transcript; rate limiting is reported as an error instead.
    pub async fn transcript(&self, meeting_id: &str) -> Result<String, SourceError> {
        let text = self.call_tool("get_meeting_transcript", json!({"meeting_id": meeting_id})).await?;
        let text = text.trim();
        if is_rate_limit(text) {
            let preview: String = text.chars().take(200).collect();
            return Err(SourceError::RateLimited(format!("transcript {meeting_id}: {preview}")));
        }
        if text.is_empty() {
            return Ok(String::new());
        }
        let transcript = serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|value| value.get("transcript").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        Ok(transcript.trim().to_string())
    }
}

#[async_trait]
impl TranscriptProvider for LiveTranscriptClient {
    fn source(&self) -> TranscriptSource {
        TranscriptSource::Live
    }

    async fn list(&self, range: DateRange) -> Result<Vec<TranscriptRecord>, SourceError> {
        let text = self
            .call_tool(
                "list_meetings",
                json!({
                    "time_range": "custom",
                    "custom_start": range.start.format("%Y-%m-%d").to_string(),
                    "custom_end": range.end.format("%Y-%m-%d").to_string(),
                }),
            )
            .await?;
        Ok(parse_meeting_list(&text))
    }

    async fn hydrate(&self, mut record: TranscriptRecord) -> Result<TranscriptRecord, SourceError> {
        if !record.has_body() {
            record.body = self.transcript(&record.id).await?;
        }
        Ok(record)
    }
}

fn is_rate_limit(text: &str) -> bool {
    text.to_ascii_lowercase().contains("rate limit")
}

/// Last `data:` frame of a server-sent event stream.
pub fn last_event_frame(body: &str) -> Result<Value, SourceError> {
    let mut last = None;
    for line in body.lines() {
        if let Some(data) = line.trim().strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() {
                last = Some(serde_json::from_str(data).map_err(|error| SourceError::Decode(error.to_string()))?);
            }
        }
    }
    last.ok_or_else(|| {
        let preview: String = body.chars().take(200).collect();
        SourceError::Decode(format!("event stream had no data frames: {preview}"))
    })
}

fn tool_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Meeting metadata from the `list_meetings` tool text.
pub fn parse_meeting_list(text: &str) -> Vec<TranscriptRecord> {
    MEETING_BLOCK
        .captures_iter(text)
        .map(|captures| {
            let id = captures.get(1).map_or("", |m| m.as_str());
            let title = captures.get(2).map_or("", |m| m.as_str());
            let mut record = TranscriptRecord::new(id, TranscriptSource::Live, title.trim());
            record.date = captures
                .get(3)
                .and_then(|m| NaiveDateTime::parse_from_str(m.as_str().trim(), MEETING_DATE_FORMAT).ok())
                .map(|naive| Utc.from_utc_datetime(&naive));
            if let Some(inner) = captures.get(4) {
                record.attendees = ATTENDEE_EMAIL
                    .captures_iter(inner.as_str())
                    .filter_map(|email| email.get(1))
                    .map(|email| email.as_str().to_lowercase())
                    .collect();
            }
            record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, NaiveDate, Timelike, Utc};
    use mockito::Matcher;
    use serde_json::json;

    use super::{last_event_frame, parse_meeting_list, LiveTranscriptClient, TokenStore};
    use crate::error::SourceError;
    use crate::transcripts::{DateRange, TranscriptProvider};

    const LISTING: &str = r#"<meetings>
<meeting id="g-1" title="Lightwork intro" date="Mar 02, 2026 03:00 PM">
  <participants>Jane Doe <Jane@Example.com>, Rep <rep@lightwork.test></participants>
</meeting>
<meeting id="g-2" title="" date="not a date"></meeting>
</meetings>"#;

    fn token_file(dir: &tempfile::TempDir, expires_at: i64) -> std::path::PathBuf {
        let path = dir.path().join("token.json");
        let body = json!({
            "client": {"client_id": "client-1"},
            "tokens": {"access_token": "old-token", "refresh_token": "refresh-1", "expires_at": expires_at}
        });
        std::fs::write(&path, body.to_string()).expect("write token file");
        path
    }

    fn sse(value: serde_json::Value) -> String {
        format!("event: message\ndata: {value}\n\n")
    }

    #[test]
    fn meeting_blocks_become_records() {
        let records = parse_meeting_list(LISTING);

        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.id, "g-1");
        let date = first.date.expect("date");
        assert_eq!((date.month(), date.day(), date.hour()), (3, 2, 15));
        assert!(first.attendees.contains("jane@example.com"));
        assert!(first.attendees.contains("rep@lightwork.test"));
        assert!(records[1].date.is_none());
        assert!(records[1].attendees.is_empty());
    }

    #[test]
    fn last_data_frame_wins() {
        let body = "event: message\ndata: {\"id\": 1}\n\nevent: message\ndata: {\"id\": 2}\n\n";
        assert_eq!(last_event_frame(body).expect("frame")["id"], 2);
        assert!(matches!(last_event_frame("event: ping\n\n"), Err(SourceError::Decode(_))));
    }

    #[tokio::test]
    async fn lists_and_hydrates_over_one_session() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let far_future = Utc::now().timestamp() + 3600;
        let store = TokenStore::new(token_file(&dir, far_future), None);

        let initialize = server
            .mock("POST", "/mcp")
            .match_header("authorization", "Bearer old-token")
            .match_header("mcp-protocol-version", "2024-11-05")
            .match_body(Matcher::PartialJson(json!({"method": "initialize"})))
            .with_header("content-type", "application/json")
            .with_header("mcp-session-id", "sess-1")
            .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": {}}).to_string())
            .expect(1)
            .create_async()
            .await;
        let list = server
            .mock("POST", "/mcp")
            .match_header("mcp-session-id", "sess-1")
            .match_body(Matcher::PartialJson(json!({
                "method": "tools/call",
                "params": {"name": "list_meetings", "arguments": {"custom_start": "2026-03-01"}}
            })))
            .with_header("content-type", "text/event-stream")
            .with_body(sse(json!({"result": {"content": [{"type": "text", "text": LISTING}]}})))
            .create_async()
            .await;
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"params": {"name": "get_meeting_transcript"}})))
            .with_header("content-type", "text/event-stream")
            .with_body(sse(json!({"result": {"content": [
                {"type": "text", "text": json!({"transcript": "  Jane: we had a leak  "}).to_string()}
            ]}})))
            .create_async()
            .await;

        let client = LiveTranscriptClient::new(&format!("{}/mcp", server.url()), store).expect("client");
        let day = |d| NaiveDate::from_ymd_opt(2026, 3, d).expect("day");
        let records = client.list(DateRange::new(day(1), day(3))).await.expect("list");
        let hydrated = client.hydrate(records[0].clone()).await.expect("hydrate");

        assert_eq!(hydrated.body, "Jane: we had a leak");
        initialize.assert_async().await;
        list.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limited_transcript_is_a_distinct_error() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TokenStore::new(token_file(&dir, Utc::now().timestamp() + 3600), None);

        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "initialize"})))
            .with_header("content-type", "application/json")
            .with_body(json!({"result": {}}).to_string())
            .create_async()
            .await;
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "tools/call"})))
            .with_header("content-type", "application/json")
            .with_body(
                json!({"result": {"isError": true, "content": [{"type": "text", "text": "Rate limit exceeded, slow down"}]}})
                    .to_string(),
            )
            .create_async()
            .await;

        let client = LiveTranscriptClient::new(&format!("{}/mcp", server.url()), store).expect("client");
        let error = client.transcript("g-1").await.expect_err("rate limited");
        assert!(matches!(error, SourceError::RateLimited(_)));
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = token_file(&dir, Utc::now().timestamp() - 10);
        let store = TokenStore::new(path.clone(), Some(format!("{}/oauth/token", server.url())));

        let refresh = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("client_id".into(), "client-1".into()),
                Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
            ]))
            .with_header("content-type", "application/json")
            .with_body(json!({"access_token": "new-token", "expires_in": 3600}).to_string())
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/mcp")
            .match_header("authorization", "Bearer new-token")
            .with_header("content-type", "application/json")
            .with_body(json!({"result": {"content": []}}).to_string())
            .create_async()
            .await;

        let client = LiveTranscriptClient::new(&format!("{}/mcp", server.url()), store).expect("client");
        let day = |d| NaiveDate::from_ymd_opt(2026, 3, d).expect("day");
        assert!(client.list(DateRange::new(day(1), day(3))).await.expect("list").is_empty());

        refresh.assert_async().await;
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(saved["tokens"]["access_token"], "new-token");
        assert_eq!(saved["tokens"]["refresh_token"], "refresh-1");
        assert_eq!(saved["client"]["client_id"], "client-1");
    }
}
