use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cadence::{CadenceSettings, NURTURE_OFFSETS, REBOOK_OFFSETS, STANDARD_OFFSETS};
use crate::domain::owner::{Owner, UNASSIGNED_OWNER};
use crate::domain::transcript::TranscriptSource;
use crate::matching::MatchSettings;

pub const ENV_PREFIX: &str = "TOUCHPOINT_";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub crm: CrmConfig,
    pub transcripts: TranscriptsConfig,
    pub llm: LlmConfig,
    pub matching: MatchingConfig,
    pub cadence: CadenceConfig,
    pub team: TeamConfig,
    pub digest: DigestConfig,
    pub database: DatabaseConfig,
    pub reference: ReferenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Pause between CRM requests; 250ms keeps under four requests per second.
    pub request_delay_ms: u64,
    pub page_size: u32,
}

#[derive(Clone, Debug)]
pub struct TranscriptsConfig {
    pub order: Vec<TranscriptSource>,
    pub live_url: String,
    pub token_path: Option<PathBuf>,
    pub token_endpoint: Option<String>,
    pub sheet_url: Option<String>,
    pub sheet_path: Option<PathBuf>,
    pub local_cache_path: Option<PathBuf>,
    pub sheet_body_cap: usize,
    pub local_body_cap: usize,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub enabled: bool,
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub max_rewrites: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MatchingConfig {
    pub threshold: u32,
    pub date_tolerance_days: u32,
    pub fuzzy_title_threshold: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CadenceConfig {
    pub standard_offsets: Vec<u32>,
    pub nurture_offsets: Vec<u32>,
    pub rebook_offsets: Vec<u32>,
    pub lookback_days: u32,
    pub disqualifying_terms: Vec<String>,
    pub skip_statuses: Vec<String>,
    pub won_labels: Vec<String>,
    pub lost_labels: Vec<String>,
    pub category: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub booking_link: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeamConfig {
    pub members: Vec<TeamMember>,
    /// Signature used for leads without an owning team member.
    pub unassigned_signature: String,
    pub unassigned_booking_link: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestConfig {
    pub output_path: PathBuf,
    pub workers: usize,
    pub max_per_owner: usize,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub enabled: bool,
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Default)]
pub struct ReferenceConfig {
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub database_enabled: Option<bool>,
    pub log_level: Option<String>,
    pub llm_enabled: Option<bool>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub crm_api_key: Option<String>,
    pub crm_base_url: Option<String>,
    pub output_path: Option<PathBuf>,
    pub workers: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            crm: CrmConfig {
                api_key: String::new().into(),
                base_url: "https://api.close.com/api/v1".to_string(),
                timeout_secs: 30,
                max_retries: 3,
                request_delay_ms: 250,
                page_size: 100,
            },
            transcripts: TranscriptsConfig {
                order: vec![
                    TranscriptSource::Live,
                    TranscriptSource::Spreadsheet,
                    TranscriptSource::LocalCache,
                ],
                live_url: "https://mcp.granola.ai/mcp".to_string(),
                token_path: None,
                token_endpoint: None,
                sheet_url: None,
                sheet_path: None,
                local_cache_path: None,
                sheet_body_cap: 6000,
                local_body_cap: 4000,
            },
            llm: LlmConfig {
                enabled: false,
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 60,
                max_retries: 2,
                max_rewrites: 3,
            },
            matching: MatchingConfig {
                threshold: 5,
                date_tolerance_days: 1,
                fuzzy_title_threshold: 0.85,
            },
            cadence: CadenceConfig::default(),
            team: TeamConfig {
                members: Vec::new(),
                unassigned_signature: "Best,\nThe team".to_string(),
                unassigned_booking_link: None,
            },
            digest: DigestConfig {
                output_path: PathBuf::from("digest.json"),
                workers: 4,
                max_per_owner: 20,
            },
            database: DatabaseConfig {
                enabled: true,
                url: "sqlite://touchpoint.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            reference: ReferenceConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for CadenceConfig {
    fn default() -> Self {
        let settings = CadenceSettings::default();
        Self {
            standard_offsets: STANDARD_OFFSETS.to_vec(),
            nurture_offsets: NURTURE_OFFSETS.to_vec(),
            rebook_offsets: REBOOK_OFFSETS.to_vec(),
            lookback_days: 45,
            disqualifying_terms: settings.disqualifying_terms,
            skip_statuses: settings.skip_statuses,
            won_labels: settings.won_labels,
            lost_labels: settings.lost_labels,
            category: settings.category,
        }
    }
}

impl CadenceConfig {
    pub fn settings(&self) -> CadenceSettings {
        CadenceSettings {
            standard_offsets: self.standard_offsets.clone(),
            nurture_offsets: self.nurture_offsets.clone(),
            rebook_offsets: self.rebook_offsets.clone(),
            disqualifying_terms: self.disqualifying_terms.clone(),
            skip_statuses: self.skip_statuses.clone(),
            won_labels: self.won_labels.clone(),
            lost_labels: self.lost_labels.clone(),
            category: self.category.clone(),
        }
    }
}

impl MatchingConfig {
    pub fn settings(&self) -> MatchSettings {
        MatchSettings {
            threshold: self.threshold,
            date_tolerance_days: self.date_tolerance_days,
            fuzzy_title_threshold: self.fuzzy_title_threshold,
        }
    }
}

impl TeamConfig {
    pub fn emails(&self) -> Vec<String> {
        self.members.iter().map(|member| member.email.to_lowercase()).collect()
    }

    /// Owner record for a team email, or the unassigned owner.
    pub fn owner(&self, email: Option<&str>) -> Owner {
        let member = email.and_then(|email| {
            self.members.iter().find(|member| member.email.eq_ignore_ascii_case(email))
        });
        match member {
            Some(member) => Owner {
                email: Some(member.email.to_lowercase()),
                display_name: member.name.clone(),
                signature: member.signature.clone().unwrap_or_else(|| member.name.clone()),
                booking_link: member.booking_link.clone(),
            },
            None => Owner {
                email: None,
                display_name: UNASSIGNED_OWNER.to_string(),
                signature: self.unassigned_signature.clone(),
                booking_link: self.unassigned_booking_link.clone(),
            },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("touchpoint.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(crm) = patch.crm {
            if let Some(api_key) = crm.api_key {
                self.crm.api_key = secret_value(api_key);
            }
            if let Some(base_url) = crm.base_url {
                self.crm.base_url = base_url;
            }
            if let Some(timeout_secs) = crm.timeout_secs {
                self.crm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = crm.max_retries {
                self.crm.max_retries = max_retries;
            }
            if let Some(request_delay_ms) = crm.request_delay_ms {
                self.crm.request_delay_ms = request_delay_ms;
            }
            if let Some(page_size) = crm.page_size {
                self.crm.page_size = page_size;
            }
        }

        if let Some(transcripts) = patch.transcripts {
            if let Some(order) = transcripts.order {
                self.transcripts.order = order;
            }
            if let Some(live_url) = transcripts.live_url {
                self.transcripts.live_url = live_url;
            }
            if let Some(token_path) = transcripts.token_path {
                self.transcripts.token_path = Some(token_path);
            }
            if let Some(token_endpoint) = transcripts.token_endpoint {
                self.transcripts.token_endpoint = Some(token_endpoint);
            }
            if let Some(sheet_url) = transcripts.sheet_url {
                self.transcripts.sheet_url = Some(sheet_url);
            }
            if let Some(sheet_path) = transcripts.sheet_path {
                self.transcripts.sheet_path = Some(sheet_path);
            }
            if let Some(local_cache_path) = transcripts.local_cache_path {
                self.transcripts.local_cache_path = Some(local_cache_path);
            }
            if let Some(sheet_body_cap) = transcripts.sheet_body_cap {
                self.transcripts.sheet_body_cap = sheet_body_cap;
            }
            if let Some(local_body_cap) = transcripts.local_body_cap {
                self.transcripts.local_body_cap = local_body_cap;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(enabled) = llm.enabled {
                self.llm.enabled = enabled;
            }
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(max_rewrites) = llm.max_rewrites {
                self.llm.max_rewrites = max_rewrites;
            }
        }

        if let Some(matching) = patch.matching {
            if let Some(threshold) = matching.threshold {
                self.matching.threshold = threshold;
            }
            if let Some(date_tolerance_days) = matching.date_tolerance_days {
                self.matching.date_tolerance_days = date_tolerance_days;
            }
            if let Some(fuzzy_title_threshold) = matching.fuzzy_title_threshold {
                self.matching.fuzzy_title_threshold = fuzzy_title_threshold;
            }
        }

        if let Some(cadence) = patch.cadence {
            if let Some(offsets) = cadence.standard_offsets {
                self.cadence.standard_offsets = offsets;
            }
            if let Some(offsets) = cadence.nurture_offsets {
                self.cadence.nurture_offsets = offsets;
            }
            if let Some(offsets) = cadence.rebook_offsets {
                self.cadence.rebook_offsets = offsets;
            }
            if let Some(lookback_days) = cadence.lookback_days {
                self.cadence.lookback_days = lookback_days;
            }
            if let Some(terms) = cadence.disqualifying_terms {
                self.cadence.disqualifying_terms = terms;
            }
            if let Some(statuses) = cadence.skip_statuses {
                self.cadence.skip_statuses = statuses;
            }
            if let Some(labels) = cadence.won_labels {
                self.cadence.won_labels = labels;
            }
            if let Some(labels) = cadence.lost_labels {
                self.cadence.lost_labels = labels;
            }
            if let Some(category) = cadence.category {
                self.cadence.category = (!category.trim().is_empty()).then_some(category);
            }
        }

        if let Some(team) = patch.team {
            if let Some(members) = team.members {
                self.team.members = members;
            }
            if let Some(signature) = team.unassigned_signature {
                self.team.unassigned_signature = signature;
            }
            if let Some(booking_link) = team.unassigned_booking_link {
                self.team.unassigned_booking_link = Some(booking_link);
            }
        }

        if let Some(digest) = patch.digest {
            if let Some(output_path) = digest.output_path {
                self.digest.output_path = output_path;
            }
            if let Some(workers) = digest.workers {
                self.digest.workers = workers;
            }
            if let Some(max_per_owner) = digest.max_per_owner {
                self.digest.max_per_owner = max_per_owner;
            }
        }

        if let Some(database) = patch.database {
            if let Some(enabled) = database.enabled {
                self.database.enabled = enabled;
            }
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(reference) = patch.reference {
            if let Some(path) = reference.path {
                self.reference.path = Some(path);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TOUCHPOINT_CRM_API_KEY") {
            self.crm.api_key = secret_value(value);
        }
        if let Some(value) = read_env("TOUCHPOINT_CRM_BASE_URL") {
            self.crm.base_url = value;
        }
        if let Some(value) = read_env("TOUCHPOINT_CRM_TIMEOUT_SECS") {
            self.crm.timeout_secs = parse_u64("TOUCHPOINT_CRM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TOUCHPOINT_CRM_MAX_RETRIES") {
            self.crm.max_retries = parse_u32("TOUCHPOINT_CRM_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("TOUCHPOINT_CRM_REQUEST_DELAY_MS") {
            self.crm.request_delay_ms = parse_u64("TOUCHPOINT_CRM_REQUEST_DELAY_MS", &value)?;
        }

        if let Some(value) = read_env("TOUCHPOINT_TRANSCRIPTS_ORDER") {
            self.transcripts.order = parse_sources("TOUCHPOINT_TRANSCRIPTS_ORDER", &value)?;
        }
        if let Some(value) = read_env("TOUCHPOINT_TRANSCRIPTS_LIVE_URL") {
            self.transcripts.live_url = value;
        }
        if let Some(value) = read_env("TOUCHPOINT_TRANSCRIPTS_TOKEN_PATH") {
            self.transcripts.token_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("TOUCHPOINT_TRANSCRIPTS_SHEET_URL") {
            self.transcripts.sheet_url = Some(value);
        }
        if let Some(value) = read_env("TOUCHPOINT_TRANSCRIPTS_SHEET_PATH") {
            self.transcripts.sheet_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("TOUCHPOINT_TRANSCRIPTS_LOCAL_CACHE_PATH") {
            self.transcripts.local_cache_path = Some(PathBuf::from(value));
        }

        if let Some(value) = read_env("TOUCHPOINT_LLM_ENABLED") {
            self.llm.enabled = parse_bool("TOUCHPOINT_LLM_ENABLED", &value)?;
        }
        if let Some(value) = read_env("TOUCHPOINT_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("TOUCHPOINT_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TOUCHPOINT_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("TOUCHPOINT_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("TOUCHPOINT_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("TOUCHPOINT_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TOUCHPOINT_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("TOUCHPOINT_LLM_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("TOUCHPOINT_LLM_MAX_REWRITES") {
            self.llm.max_rewrites = parse_u32("TOUCHPOINT_LLM_MAX_REWRITES", &value)?;
        }

        if let Some(value) = read_env("TOUCHPOINT_MATCHING_THRESHOLD") {
            self.matching.threshold = parse_u32("TOUCHPOINT_MATCHING_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("TOUCHPOINT_MATCHING_DATE_TOLERANCE_DAYS") {
            self.matching.date_tolerance_days =
                parse_u32("TOUCHPOINT_MATCHING_DATE_TOLERANCE_DAYS", &value)?;
        }

        if let Some(value) = read_env("TOUCHPOINT_CADENCE_LOOKBACK_DAYS") {
            self.cadence.lookback_days = parse_u32("TOUCHPOINT_CADENCE_LOOKBACK_DAYS", &value)?;
        }

        if let Some(value) = read_env("TOUCHPOINT_DIGEST_OUTPUT_PATH") {
            self.digest.output_path = PathBuf::from(value);
        }
        if let Some(value) = read_env("TOUCHPOINT_DIGEST_WORKERS") {
            self.digest.workers = parse_usize("TOUCHPOINT_DIGEST_WORKERS", &value)?;
        }
        if let Some(value) = read_env("TOUCHPOINT_DIGEST_MAX_PER_OWNER") {
            self.digest.max_per_owner = parse_usize("TOUCHPOINT_DIGEST_MAX_PER_OWNER", &value)?;
        }

        if let Some(value) = read_env("TOUCHPOINT_DATABASE_ENABLED") {
            self.database.enabled = parse_bool("TOUCHPOINT_DATABASE_ENABLED", &value)?;
        }
        if let Some(value) = read_env("TOUCHPOINT_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TOUCHPOINT_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("TOUCHPOINT_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TOUCHPOINT_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TOUCHPOINT_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TOUCHPOINT_REFERENCE_PATH") {
            self.reference.path = Some(PathBuf::from(value));
        }

        let log_level =
            read_env("TOUCHPOINT_LOGGING_LEVEL").or_else(|| read_env("TOUCHPOINT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TOUCHPOINT_LOGGING_FORMAT").or_else(|| read_env("TOUCHPOINT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(enabled) = overrides.database_enabled {
            self.database.enabled = enabled;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(enabled) = overrides.llm_enabled {
            self.llm.enabled = enabled;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(api_key) = overrides.crm_api_key {
            self.crm.api_key = secret_value(api_key);
        }
        if let Some(base_url) = overrides.crm_base_url {
            self.crm.base_url = base_url;
        }
        if let Some(output_path) = overrides.output_path {
            self.digest.output_path = output_path;
        }
        if let Some(workers) = overrides.workers {
            self.digest.workers = workers;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_crm(&self.crm)?;
        validate_transcripts(&self.transcripts)?;
        validate_llm(&self.llm)?;
        validate_matching(&self.matching)?;
        validate_cadence(&self.cadence)?;
        validate_team(&self.team)?;
        validate_digest(&self.digest)?;
        validate_database(&self.database)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("touchpoint.toml"), PathBuf::from("config/touchpoint.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    if crm.api_key.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "crm.api_key is required. Create a read-only key in Close under Settings > API Keys and set TOUCHPOINT_CRM_API_KEY".to_string(),
        ));
    }
    if !crm.base_url.starts_with("http://") && !crm.base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "crm.base_url must start with http:// or https://".to_string(),
        ));
    }
    if crm.timeout_secs == 0 || crm.timeout_secs > 300 {
        return Err(ConfigError::Validation("crm.timeout_secs must be in range 1..=300".to_string()));
    }
    if crm.max_retries == 0 || crm.max_retries > 10 {
        return Err(ConfigError::Validation("crm.max_retries must be in range 1..=10".to_string()));
    }
    if crm.page_size == 0 || crm.page_size > 100 {
        return Err(ConfigError::Validation("crm.page_size must be in range 1..=100".to_string()));
    }
    Ok(())
}

fn validate_transcripts(transcripts: &TranscriptsConfig) -> Result<(), ConfigError> {
    if transcripts.order.is_empty() {
        return Err(ConfigError::Validation(
            "transcripts.order must list at least one source".to_string(),
        ));
    }
    for (index, source) in transcripts.order.iter().enumerate() {
        if transcripts.order[..index].contains(source) {
            return Err(ConfigError::Validation(format!(
                "transcripts.order lists `{}` more than once",
                source.as_str()
            )));
        }
    }
    if transcripts.sheet_url.is_some() && transcripts.sheet_path.is_some() {
        return Err(ConfigError::Validation(
            "set only one of transcripts.sheet_url and transcripts.sheet_path".to_string(),
        ));
    }
    if transcripts.sheet_body_cap == 0 || transcripts.local_body_cap == 0 {
        return Err(ConfigError::Validation(
            "transcripts body caps must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if llm.max_rewrites > 10 {
        return Err(ConfigError::Validation("llm.max_rewrites must be at most 10".to_string()));
    }
    if !llm.enabled {
        return Ok(());
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_matching(matching: &MatchingConfig) -> Result<(), ConfigError> {
    if matching.threshold == 0 {
        return Err(ConfigError::Validation(
            "matching.threshold must be greater than zero".to_string(),
        ));
    }
    if matching.date_tolerance_days > 7 {
        return Err(ConfigError::Validation(
            "matching.date_tolerance_days must be in range 0..=7".to_string(),
        ));
    }
    if !(matching.fuzzy_title_threshold > 0.0 && matching.fuzzy_title_threshold <= 1.0) {
        return Err(ConfigError::Validation(
            "matching.fuzzy_title_threshold must be in range (0, 1]".to_string(),
        ));
    }
    Ok(())
}

fn validate_cadence(cadence: &CadenceConfig) -> Result<(), ConfigError> {
    for (name, offsets) in [
        ("standard_offsets", &cadence.standard_offsets),
        ("nurture_offsets", &cadence.nurture_offsets),
        ("rebook_offsets", &cadence.rebook_offsets),
    ] {
        if offsets.is_empty() {
            return Err(ConfigError::Validation(format!("cadence.{name} must not be empty")));
        }
        if offsets.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::Validation(format!(
                "cadence.{name} must be strictly increasing"
            )));
        }
    }
    if cadence.lookback_days == 0 {
        return Err(ConfigError::Validation(
            "cadence.lookback_days must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_team(team: &TeamConfig) -> Result<(), ConfigError> {
    for member in &team.members {
        if !member.email.contains('@') {
            return Err(ConfigError::Validation(format!(
                "team member `{}` needs a valid email address",
                member.name
            )));
        }
        if let Some(link) = &member.booking_link {
            if !link.starts_with("https://") {
                return Err(ConfigError::Validation(format!(
                    "team member `{}` booking_link must start with https://",
                    member.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_digest(digest: &DigestConfig) -> Result<(), ConfigError> {
    if digest.workers == 0 || digest.workers > 64 {
        return Err(ConfigError::Validation("digest.workers must be in range 1..=64".to_string()));
    }
    if digest.max_per_owner == 0 {
        return Err(ConfigError::Validation(
            "digest.max_per_owner must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

fn parse_sources(key: &str, value: &str) -> Result<Vec<TranscriptSource>, ConfigError> {
    value
        .split(',')
        .filter(|item| !item.trim().is_empty())
        .map(|item| item.parse::<TranscriptSource>().map_err(|_| invalid_override(key, value)))
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    crm: Option<CrmPatch>,
    transcripts: Option<TranscriptsPatch>,
    llm: Option<LlmPatch>,
    matching: Option<MatchingPatch>,
    cadence: Option<CadencePatch>,
    team: Option<TeamPatch>,
    digest: Option<DigestPatch>,
    database: Option<DatabasePatch>,
    reference: Option<ReferencePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    request_delay_ms: Option<u64>,
    page_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct TranscriptsPatch {
    order: Option<Vec<TranscriptSource>>,
    live_url: Option<String>,
    token_path: Option<PathBuf>,
    token_endpoint: Option<String>,
    sheet_url: Option<String>,
    sheet_path: Option<PathBuf>,
    local_cache_path: Option<PathBuf>,
    sheet_body_cap: Option<usize>,
    local_body_cap: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    enabled: Option<bool>,
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    max_rewrites: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct MatchingPatch {
    threshold: Option<u32>,
    date_tolerance_days: Option<u32>,
    fuzzy_title_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct CadencePatch {
    standard_offsets: Option<Vec<u32>>,
    nurture_offsets: Option<Vec<u32>>,
    rebook_offsets: Option<Vec<u32>>,
    lookback_days: Option<u32>,
    disqualifying_terms: Option<Vec<String>>,
    skip_statuses: Option<Vec<String>>,
    won_labels: Option<Vec<String>>,
    lost_labels: Option<Vec<String>>,
    category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TeamPatch {
    members: Option<Vec<TeamMember>>,
    unassigned_signature: Option<String>,
    unassigned_booking_link: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DigestPatch {
    output_path: Option<PathBuf>,
    workers: Option<usize>,
    max_per_owner: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    enabled: Option<bool>,
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ReferencePatch {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
    use crate::domain::transcript::TranscriptSource;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CLOSE_KEY", "api_from_env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("touchpoint.toml");
            fs::write(
                &path,
                r#"
[crm]
api_key = "${TEST_CLOSE_KEY}"

[[team.members]]
email = "Sam@Lightwork.example"
name = "Sam"
booking_link = "https://cal.example/sam"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.crm.api_key.expose_secret() == "api_from_env",
                "crm key should be interpolated from the environment",
            )?;
            ensure(
                config.team.emails() == vec!["sam@lightwork.example".to_string()],
                "team emails should be lowercased",
            )?;
            let owner = config.team.owner(Some("sam@lightwork.example"));
            ensure(owner.signature == "Sam", "signature should default to the member name")?;
            ensure(
                config.team.owner(None).display_name == "Unassigned",
                "missing owner should be unassigned",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_CLOSE_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TOUCHPOINT_CRM_API_KEY", "api_test");
        env::set_var("TOUCHPOINT_LOG_LEVEL", "warn");
        env::set_var("TOUCHPOINT_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["TOUCHPOINT_CRM_API_KEY", "TOUCHPOINT_LOG_LEVEL", "TOUCHPOINT_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TOUCHPOINT_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("TOUCHPOINT_CRM_API_KEY", "api_from_env");
        env::set_var("TOUCHPOINT_TRANSCRIPTS_ORDER", "local,sheet");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("touchpoint.toml");
            fs::write(
                &path,
                r#"
[crm]
api_key = "api_from_file"

[database]
url = "sqlite://from-file.db"

[digest]
workers = 8

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.crm.api_key.expose_secret() == "api_from_env",
                "env crm key should win over file and defaults",
            )?;
            ensure(config.digest.workers == 8, "file worker count should win over default")?;
            ensure(
                config.transcripts.order
                    == vec![TranscriptSource::LocalCache, TranscriptSource::Spreadsheet],
                "env transcript order should be parsed",
            )?;
            Ok(())
        })();

        clear_vars(&[
            "TOUCHPOINT_DATABASE_URL",
            "TOUCHPOINT_CRM_API_KEY",
            "TOUCHPOINT_TRANSCRIPTS_ORDER",
        ]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(&["TOUCHPOINT_CRM_API_KEY"]);

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => return Err("expected validation failure but config load succeeded".to_string()),
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("crm.api_key")
        );
        ensure(has_message, "validation failure should mention crm.api_key")
    }

    #[test]
    fn offsets_must_be_strictly_increasing() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TOUCHPOINT_CRM_API_KEY", "api_test");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("touchpoint.toml");
            fs::write(&path, "[cadence]\nstandard_offsets = [1, 3, 3, 10]\n")
                .map_err(|err| err.to_string())?;

            let error =
                match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() }) {
                    Ok(_) => return Err("expected offsets to be rejected".to_string()),
                    Err(error) => error,
                };
            ensure(
                matches!(error, ConfigError::Validation(ref message) if message.contains("strictly increasing")),
                "validation should reject repeated offsets",
            )
        })();

        clear_vars(&["TOUCHPOINT_CRM_API_KEY"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TOUCHPOINT_CRM_API_KEY", "api_test");
        env::set_var("TOUCHPOINT_DIGEST_WORKERS", "many");

        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("expected invalid override error".to_string()),
            Err(error) => ensure(
                matches!(error, ConfigError::InvalidEnvOverride { ref key, .. } if key == "TOUCHPOINT_DIGEST_WORKERS"),
                "error should name the offending variable",
            ),
        };

        clear_vars(&["TOUCHPOINT_CRM_API_KEY", "TOUCHPOINT_DIGEST_WORKERS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TOUCHPOINT_CRM_API_KEY", "api_secret_value");
        env::set_var("TOUCHPOINT_LLM_API_KEY", "llm_secret_value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("api_secret_value"), "debug output should not contain crm key")?;
            ensure(!debug.contains("llm_secret_value"), "debug output should not contain llm key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            ensure(!config.llm.enabled, "generative drafting should be off by default")?;
            Ok(())
        })();

        clear_vars(&["TOUCHPOINT_CRM_API_KEY", "TOUCHPOINT_LLM_API_KEY"]);
        result
    }
}
