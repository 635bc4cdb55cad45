use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Global flags of the cadenza binary
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, Default)]
pub enum CommonCommands {
    /// Start the service (default behavior)
    #[default]
    Start,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    const REDACTED: &str = "<redacted>";

    /// Install the fmt subscriber. `RUST_LOG` wins over the CLI flags.
    pub fn init_logging(args: &CommonArgs) {
        let level = if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        if let Some(path) = config_path {
            tracing::info!("Loading configuration from: {}", path.display());
        }
        Configuration::load_from_path(config_path.map(PathBuf::as_path))
            .context("Failed to load configuration")
    }

    /// Display configuration in human-readable or JSON format. The hard
    /// delete secret is never printed.
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        let mut config = config.clone();
        if config.cascade.hard_delete_secret.is_some() {
            config.cascade.hard_delete_secret = Some(REDACTED.to_string());
        }

        if json {
            let json = serde_json::to_string_pretty(&config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
            return Ok(());
        }

        println!("Cadenza Configuration:");
        println!("======================");
        println!("Database DSN: {}", config.database.dsn);
        println!("HTTP bind: {}", config.http.bind);
        println!(
            "Queue retry delay: {:?} .. {:?}",
            config.queue.base_retry_delay, config.queue.max_retry_delay
        );
        println!(
            "Circuit breaker: {} failures, reset after {:?}",
            config.circuit_breaker.failure_threshold, config.circuit_breaker.reset_timeout
        );
        println!("Snapshot TTL: {:?}", config.cascade.snapshot_ttl);
        println!(
            "Hard delete: {}",
            if config.cascade.hard_delete_secret.is_some() {
                "enabled"
            } else {
                "disabled"
            }
        );
        println!(
            "Audit retention: {} months",
            config.retention.audit_retention_months
        );

        if config.scheduler.enabled {
            for job in &config.scheduler.recurring {
                println!("Recurring: {} [{}] {}", job.name, job.cron.as_str(), job.job_type);
            }
        } else {
            println!("Scheduler: disabled");
        }
        Ok(())
    }

    pub fn validate_config(config: &Configuration) -> Result<()> {
        tracing::info!("Validating configuration...");
        config.validate().context("Invalid configuration")?;
        tracing::info!("Configuration validation passed");
        Ok(())
    }

    /// Handle commands that don't start the service. Returns `true` when the
    /// command was fully handled.
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                Ok(true)
            }
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(true)
            }
            CommonCommands::Start => Ok(false),
        }
    }

    pub fn version_info() -> String {
        format!(
            "cadenza {} ({})",
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}
