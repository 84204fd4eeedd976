use std::sync::Arc;

use chrono::{Duration, Utc};
use touchpoint_agent::{client_from_config, DraftAgent};
use touchpoint_core::cadence::CadenceEngine;
use touchpoint_core::compose::DraftComposer;
use touchpoint_core::config::AppConfig;
use touchpoint_core::errors::ApplicationError;
use touchpoint_core::matching::MeetingMatcher;
use touchpoint_core::reference::ReferenceLibrary;
use touchpoint_db::{
    connect_with_settings, migrations, DbPool, DraftCacheRepository, SqlDraftCacheRepository,
    SqlTranscriptCacheRepository,
};
use touchpoint_sources::{providers_from_config, CloseCrmClient};
use tracing::{info, warn};

use crate::pipeline::{Pipeline, RunSettings};

/// Drafts older than this are dropped from the cache at startup.
const DRAFT_CACHE_RETENTION_DAYS: i64 = 30;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: Option<DbPool>,
    pub pipeline: Arc<Pipeline>,
}

/// Wires config, sources, the drafting agent and the optional cache database
/// into a ready-to-run pipeline.
pub async fn bootstrap(config: AppConfig, settings: RunSettings) -> Result<Application, ApplicationError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let library = Arc::new(ReferenceLibrary::load(config.reference.path.as_deref())?);
    let composer = Arc::new(DraftComposer::new(library)?);
    let llm = client_from_config(&config.llm)
        .map_err(|error| ApplicationError::Configuration(format!("llm: {error:#}")))?;
    if let Some(llm) = &llm {
        info!(
            event_name = "system.bootstrap.llm_ready",
            correlation_id = "bootstrap",
            provider = llm.name(),
            model = %config.llm.model,
            "generative drafting enabled"
        );
    }
    let agent = Arc::new(DraftAgent::new(composer, llm, config.llm.max_rewrites));

    let crm = Arc::new(CloseCrmClient::from_config(&config.crm)?);
    let providers = providers_from_config(&config.transcripts)?;
    let team_emails = config.team.emails();

    let mut pipeline = Pipeline::new(
        crm,
        agent,
        CadenceEngine::new(config.cadence.settings()),
        MeetingMatcher::new(config.matching.settings(), &team_emails),
        config.team.clone(),
        settings,
    )
    .with_providers(providers);

    let db_pool = if config.database.enabled {
        let pool = open_database(&config).await?;
        let drafts = SqlDraftCacheRepository::new(pool.clone());
        let cutoff = Utc::now() - Duration::days(DRAFT_CACHE_RETENTION_DAYS);
        match drafts.prune_before(cutoff).await {
            Ok(removed) if removed > 0 => info!(
                event_name = "system.bootstrap.draft_cache_pruned",
                correlation_id = "bootstrap",
                removed,
                "pruned stale cached drafts"
            ),
            Ok(_) => {}
            Err(error) => warn!(
                event_name = "system.bootstrap.draft_cache_prune_failed",
                correlation_id = "bootstrap",
                error = %error,
                "could not prune cached drafts"
            ),
        }
        pipeline = pipeline
            .with_draft_cache(Arc::new(drafts))
            .with_transcript_cache(Arc::new(SqlTranscriptCacheRepository::new(pool.clone())));
        Some(pool)
    } else {
        info!(
            event_name = "system.bootstrap.database_disabled",
            correlation_id = "bootstrap",
            "cache database disabled; drafts and transcripts will not be cached"
        );
        None
    };

    Ok(Application { config, db_pool, pipeline: Arc::new(pipeline) })
}

/// Connects to the cache database and applies pending migrations.
pub async fn open_database(config: &AppConfig) -> Result<DbPool, ApplicationError> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| ApplicationError::Persistence(format!("database connection failed: {error}")))?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&pool)
        .await
        .map_err(|error| ApplicationError::Persistence(format!("database migration failed: {error}")))?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    Ok(pool)
}
