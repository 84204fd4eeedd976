//! Shared HTTP plumbing: retries, pacing and the read-only guard.
//!
//! Every outbound request goes through [`HttpClient::execute`], which refuses
//! any non-GET request to a host registered as read-only before the request
//! is built. The CRM host is always registered.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::error::SourceError;

pub const TRANSIENT_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];
pub const CRM_HOST: &str = "api.close.com";

const ERROR_BODY_PREVIEW: usize = 300;

#[derive(Clone, Debug)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Linear backoff unit: attempt `n` waits `backoff * n` before retrying.
    pub backoff: Duration,
    /// Minimum spacing between two requests from this client.
    pub min_interval: Duration,
    pub read_only_hosts: Vec<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            min_interval: Duration::ZERO,
            read_only_hosts: vec![CRM_HOST.to_string()],
        }
    }
}

pub struct HttpClient {
    client: Client,
    settings: HttpSettings,
    last_request: Mutex<Option<Instant>>,
}

impl HttpClient {
    pub fn new(mut settings: HttpSettings) -> Result<Self, SourceError> {
        if !settings.read_only_hosts.iter().any(|host| host.eq_ignore_ascii_case(CRM_HOST)) {
            settings.read_only_hosts.push(CRM_HOST.to_string());
        }
        settings.max_attempts = settings.max_attempts.max(1);
        let client =
            Client::builder().timeout(settings.timeout).build().map_err(SourceError::ClientBuild)?;
        Ok(Self { client, settings, last_request: Mutex::new(None) })
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    /// Parses `url` and rejects it when `method` would mutate a read-only host.
    pub fn guard(&self, method: &Method, url: &str) -> Result<Url, SourceError> {
        let parsed = Url::parse(url).map_err(|_| SourceError::InvalidUrl(url.to_string()))?;
        if *method == Method::GET {
            return Ok(parsed);
        }

        let read_only = parsed.host_str().is_some_and(|host| {
            self.settings.read_only_hosts.iter().any(|blocked| blocked.eq_ignore_ascii_case(host))
        });
        if read_only {
            error!(
                event_name = "sources.http.mutation_blocked",
                method = %method,
                url = %url,
                "blocked write request to read-only host"
            );
            return Err(SourceError::MutationBlocked {
                method: method.to_string(),
                url: url.to_string(),
            });
        }
        Ok(parsed)
    }

    /// Sends a request built by `build`, retrying transient failures.
    pub async fn execute<F>(&self, method: Method, url: &str, build: F) -> Result<Response, SourceError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let parsed = self.guard(&method, url)?;
        let max_attempts = self.settings.max_attempts;
        let mut attempt = 1;

        loop {
            self.pace().await;
            let request = build(self.client.request(method.clone(), parsed.clone()));

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
                    if !TRANSIENT_STATUSES.contains(&status) || attempt >= max_attempts {
                        return Err(SourceError::Status { status, url: url.to_string(), body: preview });
                    }
                    warn!(
                        event_name = "sources.http.retry",
                        status,
                        attempt,
                        url = %url,
                        "transient HTTP status, retrying"
                    );
                }
                Err(source) => {
                    let transient = source.is_timeout() || source.is_connect();
                    if !transient || attempt >= max_attempts {
                        return Err(SourceError::Transport { url: url.to_string(), source });
                    }
                    warn!(
                        event_name = "sources.http.retry",
                        attempt,
                        url = %url,
                        error = %source,
                        "transport failure, retrying"
                    );
                }
            }

            tokio::time::sleep(self.settings.backoff * attempt).await;
            attempt += 1;
        }
    }

    pub async fn get_json<T, F>(&self, url: &str, build: F) -> Result<T, SourceError>
    where
        T: DeserializeOwned,
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let response = self.execute(Method::GET, url, build).await?;
        response.json::<T>().await.map_err(|error| SourceError::Decode(format!("{url}: {error}")))
    }

    async fn pace(&self) {
        if self.settings.min_interval.is_zero() {
            return;
        }
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.settings.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use reqwest::Method;

    use super::{HttpClient, HttpSettings};
    use crate::error::SourceError;

    fn client(read_only_hosts: Vec<String>) -> HttpClient {
        HttpClient::new(HttpSettings {
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff: Duration::from_millis(1),
            min_interval: Duration::ZERO,
            read_only_hosts,
        })
        .expect("client")
    }

    #[tokio::test]
    async fn write_to_crm_host_is_blocked_before_sending() {
        let client = client(Vec::new());
        let error = client
            .execute(Method::POST, "https://api.close.com/api/v1/activity/email/", |request| request)
            .await
            .expect_err("blocked");

        assert!(error.is_mutation_blocked());
        assert!(client.guard(&Method::GET, "https://api.close.com/api/v1/me/").is_ok());
    }

    #[tokio::test]
    async fn write_to_registered_host_never_reaches_the_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("PUT", "/lead/1/").expect(0).create_async().await;
        let host = server.host_with_port();
        let hostname = host.split(':').next().unwrap_or_default().to_string();

        let client = client(vec![hostname]);
        let url = format!("{}/lead/1/", server.url());
        let error = client.execute(Method::PUT, &url, |request| request).await.expect_err("blocked");

        assert!(matches!(error, SourceError::MutationBlocked { ref method, .. } if method == "PUT"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn transient_status_is_retried_until_attempts_run_out() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/flaky").with_status(503).expect(3).create_async().await;

        let error = client(Vec::new())
            .execute(Method::GET, &format!("{}/flaky", server.url()), |request| request)
            .await
            .expect_err("still failing");

        assert!(matches!(error, SourceError::Status { status: 503, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn permanent_status_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/missing").with_status(404).expect(1).create_async().await;

        let error = client(Vec::new())
            .execute(Method::GET, &format!("{}/missing", server.url()), |request| request)
            .await
            .expect_err("not found");

        assert!(matches!(error, SourceError::Status { status: 404, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn dropped_connection_after_send_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}/dropped", listener.local_addr().expect("addr"));
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buffer = [0u8; 1024];
                let _ = stream.read(&mut buffer);
            }
        });

        let error = client(Vec::new())
            .execute(Method::GET, &url, |request| request)
            .await
            .expect_err("connection closed without a response");

        assert!(matches!(error, SourceError::Transport { .. }));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_json_decodes_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"value": 7}"#)
            .create_async()
            .await;

        let body: serde_json::Value = client(Vec::new())
            .get_json(&format!("{}/ok", server.url()), |request| request)
            .await
            .expect("json");
        assert_eq!(body["value"], 7);
    }
}
