//! Language model providers behind one completion trait.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use touchpoint_core::config::{LlmConfig, LlmProvider};
use touchpoint_sources::http::{HttpClient, HttpSettings};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 2048;
const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENAI_REASONING_EFFORT: &str = "low";

/// Stable run context in `system`, per-lead context in `user`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &'static str;
    async fn complete(&self, prompt: &PromptPair) -> Result<String>;
}

/// Builds the configured provider, or `None` when generation is disabled.
pub fn client_from_config(config: &LlmConfig) -> Result<Option<Arc<dyn LlmClient>>> {
    if !config.enabled {
        return Ok(None);
    }

    let http = HttpClient::new(HttpSettings {
        timeout: Duration::from_secs(config.timeout_secs),
        max_attempts: config.max_retries.max(1),
        ..HttpSettings::default()
    })?;
    let base_url = config.base_url.as_deref().map(|url| url.trim_end_matches('/').to_string());

    let client: Arc<dyn LlmClient> = match config.provider {
        LlmProvider::Anthropic => Arc::new(AnthropicClient {
            http,
            base_url: base_url.unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
            api_key: config.api_key.clone().context("llm.api_key is required for anthropic")?,
            model: config.model.clone(),
        }),
        LlmProvider::OpenAi => Arc::new(OpenAiClient {
            http,
            base_url: base_url.unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            api_key: config.api_key.clone().context("llm.api_key is required for openai")?,
            model: config.model.clone(),
        }),
        LlmProvider::Ollama => Arc::new(OllamaClient {
            http,
            base_url: base_url.context("llm.base_url is required for ollama")?,
            model: config.model.clone(),
        }),
    };
    Ok(Some(client))
}

async fn post_json(
    http: &HttpClient,
    url: &str,
    body: &Value,
    headers: &[(&str, String)],
) -> Result<Value> {
    let response = http
        .execute(Method::POST, url, |request| {
            headers.iter().fold(request.json(body), |request, (name, value)| request.header(*name, value))
        })
        .await?;
    response.json::<Value>().await.with_context(|| format!("decoding response from {url}"))
}

fn non_empty(text: String, provider: &str) -> Result<String> {
    let text = text.trim().to_string();
    if text.is_empty() {
        bail!("{provider} response contained no text");
    }
    Ok(text)
}

pub struct AnthropicClient {
    http: HttpClient,
    base_url: String,
    api_key: SecretString,
    model: String,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn complete(&self, prompt: &PromptPair) -> Result<String> {
        let body = json!({
            "model": self.model,
            "max_tokens": ANTHROPIC_MAX_TOKENS,
            "system": prompt.system,
            "messages": [{"role": "user", "content": prompt.user}],
        });
        let headers = [
            ("x-api-key", self.api_key.expose_secret().to_string()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ];
        let response = post_json(&self.http, &format!("{}/v1/messages", self.base_url), &body, &headers).await?;

        let text = response
            .get("content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        non_empty(text, self.name())
    }
}

/// Responses API client. The system context is prepended to the input.
pub struct OpenAiClient {
    http: HttpClient,
    base_url: String,
    api_key: SecretString,
    model: String,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, prompt: &PromptPair) -> Result<String> {
        let body = json!({
            "model": self.model,
            "input": format!("{}\n\n---\n\n{}", prompt.system, prompt.user),
            "reasoning": {"effort": OPENAI_REASONING_EFFORT},
        });
        let headers = [("authorization", format!("Bearer {}", self.api_key.expose_secret()))];
        let response = post_json(&self.http, &format!("{}/v1/responses", self.base_url), &body, &headers).await?;

        if let Some(text) = response.get("output_text").and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return Ok(text.trim().to_string());
            }
        }

        let text = response
            .get("output")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
            .filter_map(|item| item.get("content").and_then(Value::as_array))
            .flatten()
            .filter(|part| matches!(part.get("type").and_then(Value::as_str), Some("output_text" | "text")))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        non_empty(text, self.name())
    }
}

pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    model: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn complete(&self, prompt: &PromptPair) -> Result<String> {
        let body = json!({
            "model": self.model,
            "system": prompt.system,
            "prompt": prompt.user,
            "stream": false,
        });
        let response = post_json(&self.http, &format!("{}/api/generate", self.base_url), &body, &[]).await?;
        let text = response
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("ollama response has no `response` field"))?;
        non_empty(text.to_string(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use secrecy::SecretString;
    use serde_json::json;

    use touchpoint_core::config::{LlmConfig, LlmProvider};

    use super::{client_from_config, PromptPair};

    fn config(provider: LlmProvider, base_url: &str) -> LlmConfig {
        LlmConfig {
            enabled: true,
            provider,
            api_key: Some(SecretString::from("sk-test".to_string())),
            base_url: Some(base_url.to_string()),
            model: "test-model".to_string(),
            timeout_secs: 5,
            max_retries: 1,
            max_rewrites: 3,
        }
    }

    fn prompt() -> PromptPair {
        PromptPair { system: "be brief".to_string(), user: "write the email".to_string() }
    }

    #[test]
    fn disabled_generation_builds_no_client() {
        let mut disabled = config(LlmProvider::Ollama, "http://localhost:11434");
        disabled.enabled = false;
        assert!(client_from_config(&disabled).expect("config").is_none());
    }

    #[test]
    fn hosted_provider_without_key_is_rejected() {
        let mut missing = config(LlmProvider::Anthropic, "https://api.anthropic.com");
        missing.api_key = None;
        let error = client_from_config(&missing).err().expect("missing key");
        assert!(error.to_string().contains("llm.api_key"));
    }

    #[tokio::test]
    async fn anthropic_joins_text_blocks() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "sk-test")
            .match_header("anthropic-version", "2023-06-01")
            .match_body(Matcher::PartialJson(json!({
                "model": "test-model",
                "system": "be brief",
                "messages": [{"role": "user", "content": "write the email"}]
            })))
            .with_header("content-type", "application/json")
            .with_body(
                json!({"content": [{"type": "text", "text": "Hello"}, {"type": "tool_use"}, {"type": "text", "text": "there"}]})
                    .to_string(),
            )
            .create_async()
            .await;

        let client = client_from_config(&config(LlmProvider::Anthropic, &server.url()))
            .expect("config")
            .expect("enabled");
        assert_eq!(client.complete(&prompt()).await.expect("completion"), "Hello\nthere");
    }

    #[tokio::test]
    async fn openai_falls_back_to_message_parts() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/responses")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(json!({"reasoning": {"effort": "low"}})))
            .with_header("content-type", "application/json")
            .with_body(
                json!({"output": [
                    {"type": "reasoning"},
                    {"type": "message", "content": [{"type": "output_text", "text": "Drafted."}]}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let client = client_from_config(&config(LlmProvider::OpenAi, &server.url()))
            .expect("config")
            .expect("enabled");
        assert_eq!(client.complete(&prompt()).await.expect("completion"), "Drafted.");
    }

    #[tokio::test]
    async fn ollama_empty_response_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(json!({"stream": false, "prompt": "write the email"})))
            .with_header("content-type", "application/json")
            .with_body(json!({"response": "   "}).to_string())
            .create_async()
            .await;

        let client = client_from_config(&config(LlmProvider::Ollama, &server.url()))
            .expect("config")
            .expect("enabled");
        assert!(client.complete(&prompt()).await.is_err());
    }
}
