use touchpoint_core::config::LoadOptions;
use touchpoint_core::errors::ApplicationError;

use crate::bootstrap::open_database;
use crate::commands::{prepare, CommandResult};

pub fn run(options: &LoadOptions) -> CommandResult {
    let (config, runtime) = match prepare("migrate", options) {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };
    if !config.database.enabled {
        return CommandResult::from_error(
            "migrate",
            &ApplicationError::Configuration(
                "database.enabled is false; there is no cache database to migrate".to_string(),
            ),
        );
    }

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        pool.close().await;
        Ok::<(), ApplicationError>(())
    });

    match result {
        Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
        Err(error) => CommandResult::from_error("migrate", &error),
    }
}
