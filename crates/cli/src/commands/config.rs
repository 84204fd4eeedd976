use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use toml::Value;
use touchpoint_core::config::{AppConfig, LoadOptions};

struct ConfigView {
    doc: Option<Value>,
    path: Option<PathBuf>,
    lines: Vec<String>,
}

impl ConfigView {
    fn push(&mut self, key: &str, env_keys: &[&str], value: &str) {
        let source = field_source(key, env_keys, self.doc.as_ref(), self.path.as_deref());
        self.lines.push(render_line(key, value, source));
    }
}

pub fn run(options: &LoadOptions) -> String {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let path = options.config_path.clone().filter(|path| path.exists()).or_else(detect_config_path);
    let mut view = ConfigView {
        doc: load_config_file_doc(path.as_deref()),
        path,
        lines: vec!["effective config (source precedence: env > file > default):".to_string()],
    };

    view.push("crm.api_key", &["TOUCHPOINT_CRM_API_KEY"], &redact_token(config.crm.api_key.expose_secret()));
    view.push("crm.base_url", &["TOUCHPOINT_CRM_BASE_URL"], &config.crm.base_url);
    view.push("crm.timeout_secs", &["TOUCHPOINT_CRM_TIMEOUT_SECS"], &config.crm.timeout_secs.to_string());
    view.push("crm.max_retries", &["TOUCHPOINT_CRM_MAX_RETRIES"], &config.crm.max_retries.to_string());
    view.push(
        "crm.request_delay_ms",
        &["TOUCHPOINT_CRM_REQUEST_DELAY_MS"],
        &config.crm.request_delay_ms.to_string(),
    );

    let order: Vec<&str> = config.transcripts.order.iter().map(|source| source.as_str()).collect();
    view.push("transcripts.order", &["TOUCHPOINT_TRANSCRIPTS_ORDER"], &order.join(","));
    view.push("transcripts.live_url", &["TOUCHPOINT_TRANSCRIPTS_LIVE_URL"], &config.transcripts.live_url);
    view.push(
        "transcripts.token_path",
        &["TOUCHPOINT_TRANSCRIPTS_TOKEN_PATH"],
        &display_path(config.transcripts.token_path.as_deref()),
    );
    view.push(
        "transcripts.sheet_url",
        &["TOUCHPOINT_TRANSCRIPTS_SHEET_URL"],
        config.transcripts.sheet_url.as_deref().unwrap_or("<unset>"),
    );
    view.push(
        "transcripts.sheet_path",
        &["TOUCHPOINT_TRANSCRIPTS_SHEET_PATH"],
        &display_path(config.transcripts.sheet_path.as_deref()),
    );
    view.push(
        "transcripts.local_cache_path",
        &["TOUCHPOINT_TRANSCRIPTS_LOCAL_CACHE_PATH"],
        &display_path(config.transcripts.local_cache_path.as_deref()),
    );

    view.push("llm.enabled", &["TOUCHPOINT_LLM_ENABLED"], &config.llm.enabled.to_string());
    view.push("llm.provider", &["TOUCHPOINT_LLM_PROVIDER"], &format!("{:?}", config.llm.provider));
    view.push("llm.model", &["TOUCHPOINT_LLM_MODEL"], &config.llm.model);
    view.push(
        "llm.base_url",
        &["TOUCHPOINT_LLM_BASE_URL"],
        config.llm.base_url.as_deref().unwrap_or("<unset>"),
    );
    let llm_api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    view.push("llm.api_key", &["TOUCHPOINT_LLM_API_KEY"], llm_api_key);
    view.push("llm.max_rewrites", &["TOUCHPOINT_LLM_MAX_REWRITES"], &config.llm.max_rewrites.to_string());

    view.push("matching.threshold", &["TOUCHPOINT_MATCHING_THRESHOLD"], &config.matching.threshold.to_string());
    view.push(
        "matching.date_tolerance_days",
        &["TOUCHPOINT_MATCHING_DATE_TOLERANCE_DAYS"],
        &config.matching.date_tolerance_days.to_string(),
    );
    view.push(
        "cadence.lookback_days",
        &["TOUCHPOINT_CADENCE_LOOKBACK_DAYS"],
        &config.cadence.lookback_days.to_string(),
    );
    view.push("team.members", &[], &config.team.emails().join(","));

    view.push(
        "digest.output_path",
        &["TOUCHPOINT_DIGEST_OUTPUT_PATH"],
        &config.digest.output_path.display().to_string(),
    );
    view.push("digest.workers", &["TOUCHPOINT_DIGEST_WORKERS"], &config.digest.workers.to_string());
    view.push(
        "digest.max_per_owner",
        &["TOUCHPOINT_DIGEST_MAX_PER_OWNER"],
        &config.digest.max_per_owner.to_string(),
    );

    view.push("database.enabled", &["TOUCHPOINT_DATABASE_ENABLED"], &config.database.enabled.to_string());
    view.push("database.url", &["TOUCHPOINT_DATABASE_URL"], &config.database.url);
    view.push(
        "database.max_connections",
        &["TOUCHPOINT_DATABASE_MAX_CONNECTIONS"],
        &config.database.max_connections.to_string(),
    );
    view.push("reference.path", &["TOUCHPOINT_REFERENCE_PATH"], &display_path(config.reference.path.as_deref()));

    view.push(
        "logging.level",
        &["TOUCHPOINT_LOGGING_LEVEL", "TOUCHPOINT_LOG_LEVEL"],
        &config.logging.level,
    );
    view.push(
        "logging.format",
        &["TOUCHPOINT_LOGGING_FORMAT", "TOUCHPOINT_LOG_FORMAT"],
        &format!("{:?}", config.logging.format),
    );

    view.lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("touchpoint.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/touchpoint.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn display_path(path: Option<&Path>) -> String {
    path.map(|path| path.display().to_string()).unwrap_or_else(|| "<unset>".to_string())
}

/// Close keys look like `api_<random>`; only the prefix survives.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('_') {
        return format!("{prefix}_***");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, redact_token, render_line};

    #[test]
    fn tokens_keep_only_their_prefix() {
        assert_eq!(redact_token("api_4f9aSECRET"), "api_***");
        assert_eq!(redact_token("opaque"), "<redacted>");
        assert_eq!(redact_token("  "), "<empty>");
    }

    #[test]
    fn nested_keys_are_found_in_the_file_document() {
        let doc: Value = "[crm]\nbase_url = \"https://example.test\"\n".parse().expect("toml");

        assert!(contains_path(&doc, "crm.base_url"));
        assert!(!contains_path(&doc, "crm.api_key"));
        assert!(!contains_path(&doc, "llm.model"));
    }

    #[test]
    fn lines_name_their_source() {
        assert_eq!(
            render_line("crm.base_url", "https://x", "default".to_string()),
            "- crm.base_url = https://x (source: default)"
        );
    }
}
