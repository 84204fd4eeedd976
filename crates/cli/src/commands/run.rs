use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use touchpoint_core::config::{AppConfig, LoadOptions};
use touchpoint_core::errors::ApplicationError;
use tracing::info;

use crate::bootstrap::bootstrap;
use crate::commands::{prepare, CommandResult};
use crate::pipeline::{Digest, RunSettings};

#[derive(Clone, Debug, Default)]
pub struct RunArgs {
    pub fresh: bool,
    pub debug_lead: Option<String>,
    pub output: Option<PathBuf>,
    pub today: Option<NaiveDate>,
    pub workers: Option<usize>,
}

pub fn run(options: &LoadOptions, args: RunArgs) -> CommandResult {
    let (config, runtime) = match prepare("run", options) {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };
    let output = args.output.clone().unwrap_or_else(|| config.digest.output_path.clone());
    let settings = run_settings(&config, &args);

    let result = runtime.block_on(async move {
        let app = bootstrap(config, settings).await?;
        let digest = app.pipeline.run().await;
        if let Some(pool) = app.db_pool {
            pool.close().await;
        }
        digest
    });

    match result.and_then(|digest| write_digest(&digest, &output).map(|()| digest)) {
        Ok(digest) => CommandResult::success(
            "run",
            format!(
                "{} drafts for {} due leads ({} deferred, {} skipped) written to {}",
                digest.stats.drafted,
                digest.stats.due,
                digest.stats.deferred,
                digest.stats.skipped,
                output.display()
            ),
        ),
        Err(error) => CommandResult::from_error("run", &error),
    }
}

pub(crate) fn run_settings(config: &AppConfig, args: &RunArgs) -> RunSettings {
    RunSettings {
        today: args.today.unwrap_or_else(|| chrono::Local::now().date_naive()),
        lookback_days: config.cadence.lookback_days,
        workers: args.workers.unwrap_or(config.digest.workers),
        max_per_owner: config.digest.max_per_owner,
        fresh: args.fresh,
        debug_lead: args.debug_lead.clone(),
    }
}

fn write_digest(digest: &Digest, path: &Path) -> Result<(), ApplicationError> {
    let rendered = serde_json::to_string_pretty(digest)
        .map_err(|error| ApplicationError::Runtime(format!("digest serialization failed: {error}")))?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|error| {
            ApplicationError::Runtime(format!("could not create `{}`: {error}", parent.display()))
        })?;
    }
    fs::write(path, rendered).map_err(|error| {
        ApplicationError::Runtime(format!("could not write `{}`: {error}", path.display()))
    })?;
    info!(
        event_name = "digest.output.written",
        correlation_id = %digest.run_id,
        path = %path.display(),
        entries = digest.entries.len(),
        "digest written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};

    use super::write_digest;
    use crate::pipeline::{Digest, RunStats};

    #[test]
    fn digest_is_written_as_pretty_json_creating_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out").join("digest.json");
        let digest = Digest {
            run_id: "run-1".to_string(),
            generated_at: Utc::now(),
            today: NaiveDate::from_ymd_opt(2026, 3, 5).expect("date"),
            entries: Vec::new(),
            tracker: Vec::new(),
            stats: RunStats::default(),
        };

        write_digest(&digest, &path).expect("write");

        let raw = std::fs::read_to_string(&path).expect("read back");
        let parsed: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(parsed["run_id"], "run-1");
        assert_eq!(parsed["today"], "2026-03-05");
        assert!(raw.contains("\n  \"entries\""));
    }
}
