pub mod config;
pub mod doctor;
pub mod migrate;
pub mod run;
pub mod status;
pub mod sync_transcripts;

use serde::Serialize;
use tokio::runtime::Runtime;
use touchpoint_core::config::{AppConfig, LoadOptions};
use touchpoint_core::errors::ApplicationError;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    /// Failure carrying the error's class, exit code and operator hint.
    pub fn from_error(command: &str, error: &ApplicationError) -> Self {
        let class = error.class();
        let exit_code = u8::try_from(class.exit_code()).unwrap_or(1);
        Self::failure(
            command,
            class.as_str(),
            format!("{} ({error})", error.user_message()),
            exit_code,
        )
    }

    /// Raw output, for commands whose payload is a report rather than an outcome.
    pub fn report(output: String) -> Self {
        Self { exit_code: 0, output }
    }
}

/// Loads config, starts logging and builds the runtime every async command needs.
pub(crate) fn prepare(command: &str, options: &LoadOptions) -> Result<(AppConfig, Runtime), CommandResult> {
    let config = AppConfig::load(options.clone())
        .map_err(|error| CommandResult::from_error(command, &error.into()))?;
    crate::init_logging(&config.logging);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|error| {
            CommandResult::failure(
                command,
                "runtime",
                format!("failed to initialize async runtime: {error}"),
                3,
            )
        })?;
    Ok((config, runtime))
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}
