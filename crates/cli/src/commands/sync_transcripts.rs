use std::sync::Arc;

use touchpoint_core::config::LoadOptions;
use touchpoint_core::errors::ApplicationError;
use touchpoint_db::SqlTranscriptCacheRepository;
use touchpoint_sources::transcripts::{LiveTranscriptClient, TokenStore};
use touchpoint_sources::TranscriptProvider;

use crate::bootstrap::open_database;
use crate::commands::{prepare, CommandResult};
use crate::sync::{sync_transcripts, SyncSettings};

pub fn run(options: &LoadOptions, batch_size: usize) -> CommandResult {
    let (config, runtime) = match prepare("sync-transcripts", options) {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async move {
        let Some(token_path) = config.transcripts.token_path.clone() else {
            return Err(ApplicationError::Configuration(
                "transcripts.token_path is required to sync live transcripts".to_string(),
            ));
        };
        let store = TokenStore::new(token_path, config.transcripts.token_endpoint.clone());
        let live: Arc<dyn TranscriptProvider> =
            Arc::new(LiveTranscriptClient::new(&config.transcripts.live_url, store)?);

        let pool = open_database(&config).await?;
        let cache = SqlTranscriptCacheRepository::new(pool.clone());
        let report = sync_transcripts(
            live.as_ref(),
            &cache,
            &config.team.emails(),
            &SyncSettings::new(batch_size.max(1)),
        )
        .await;
        pool.close().await;
        report
    });

    match result {
        Ok(report) => CommandResult::success(
            "sync-transcripts",
            format!(
                "fetched {}, empty {}, already cached {}, errors {}{}",
                report.fetched,
                report.empty,
                report.already_cached,
                report.errors,
                if report.rate_limited { " (stopped on repeated rate limits)" } else { "" }
            ),
        ),
        Err(error) => CommandResult::from_error("sync-transcripts", &error),
    }
}
