use chrono::NaiveDate;
use touchpoint_core::config::LoadOptions;
use touchpoint_core::errors::ApplicationError;

use crate::bootstrap::bootstrap;
use crate::commands::run::{run_settings, RunArgs};
use crate::commands::{prepare, CommandResult};

/// Cadence tracker for every lead with a recent meeting. No transcripts are
/// read and no drafts are produced.
pub fn run(options: &LoadOptions, today: Option<NaiveDate>) -> CommandResult {
    let (mut config, runtime) = match prepare("status", options) {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };
    // The tracker never touches the draft or transcript caches.
    config.database.enabled = false;
    let settings = run_settings(&config, &RunArgs { today, ..RunArgs::default() });

    let result = runtime.block_on(async move {
        let app = bootstrap(config, settings).await?;
        app.pipeline.status().await
    });

    let tracker = match result {
        Ok(tracker) => tracker,
        Err(error) => return CommandResult::from_error("status", &error),
    };
    match serde_json::to_string_pretty(&tracker) {
        Ok(rendered) => CommandResult::report(rendered),
        Err(error) => CommandResult::from_error(
            "status",
            &ApplicationError::Runtime(format!("tracker serialization failed: {error}")),
        ),
    }
}
