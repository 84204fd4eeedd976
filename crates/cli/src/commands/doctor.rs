use serde::Serialize;
use touchpoint_core::config::{AppConfig, LoadOptions};
use touchpoint_db::{connect_with_settings, migrations};
use touchpoint_sources::{providers_from_config, CloseCrmClient, CrmSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(options: &LoadOptions, json_output: bool) -> String {
    let report = build_report(options);

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report(options: &LoadOptions) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(options.clone()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_transcript_sources(&config));
            match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => {
                    checks.push(runtime.block_on(check_crm_reachability(&config)));
                    checks.push(runtime.block_on(check_database(&config)));
                }
                Err(error) => {
                    for name in ["crm_reachability", "database_connectivity"] {
                        checks.push(DoctorCheck {
                            name,
                            status: CheckStatus::Fail,
                            details: format!("failed to initialize async runtime: {error}"),
                        });
                    }
                }
            }
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["transcript_sources", "crm_reachability", "database_connectivity"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_transcript_sources(config: &AppConfig) -> DoctorCheck {
    match providers_from_config(&config.transcripts) {
        Ok(providers) if providers.is_empty() => DoctorCheck {
            name: "transcript_sources",
            status: CheckStatus::Fail,
            details: "no transcript backend is configured; drafts will lack call notes".to_string(),
        },
        Ok(providers) => {
            let names: Vec<&str> = providers.iter().map(|provider| provider.source().as_str()).collect();
            DoctorCheck {
                name: "transcript_sources",
                status: CheckStatus::Pass,
                details: format!("configured in order: {}", names.join(", ")),
            }
        }
        Err(error) => DoctorCheck {
            name: "transcript_sources",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

/// A single authenticated GET; the client refuses anything else.
async fn check_crm_reachability(config: &AppConfig) -> DoctorCheck {
    let client = match CloseCrmClient::from_config(&config.crm) {
        Ok(client) => client,
        Err(error) => {
            return DoctorCheck {
                name: "crm_reachability",
                status: CheckStatus::Fail,
                details: error.to_string(),
            };
        }
    };

    match client.ping().await {
        Ok(()) => DoctorCheck {
            name: "crm_reachability",
            status: CheckStatus::Pass,
            details: format!("authenticated against `{}`", config.crm.base_url),
        },
        Err(error) => {
            DoctorCheck { name: "crm_reachability", status: CheckStatus::Fail, details: error.to_string() }
        }
    }
}

async fn check_database(config: &AppConfig) -> DoctorCheck {
    if !config.database.enabled {
        return DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Skipped,
            details: "cache database disabled".to_string(),
        };
    }

    let result = async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;
        let applied = migrations::applied_versions(&pool)
            .await
            .map_err(|error| format!("failed to read migration state: {error}"));
        pool.close().await;
        applied
    }
    .await;

    match result {
        Ok(applied) if applied.is_empty() => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Fail,
            details: format!("connected using `{}` but no migrations applied; run `touchpoint migrate`", config.database.url),
        },
        Ok(applied) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}` ({} migrations applied)", config.database.url, applied.len()),
        },
        Err(error) => {
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error }
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
