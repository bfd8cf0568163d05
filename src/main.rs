//! `perfwatch` binary entry point.

use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tracing::{info, warn};

use std::time::Duration;

use perfwatch_engine::cli::{
    handle_generate_config, handle_scan_query, handle_validate, handle_version, print_summary, print_watch_summary,
    run_simulation, run_watch, Cli, Commands, SimulationPlan,
};
use perfwatch_engine::constants::{ENGINE_FULL_NAME, ENGINE_VERSION};
use perfwatch_engine::logging::{init_logging, TARGET_INIT};
use perfwatch_engine::{MonitorConfig, SystemHostSource};

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging or a loaded config
    match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => {
            handle_generate_config(output.as_deref()).context("Failed to generate configuration")?;
            return Ok(());
        }
        Commands::Validate { verbose } => {
            handle_validate(&cli.config, *verbose)
                .with_context(|| format!("Invalid configuration in {}", cli.config.display()))?;
            return Ok(());
        }
        Commands::ScanQuery {
            query,
            database,
            execution_time_ms,
        } => {
            handle_scan_query(query, database, *execution_time_ms)?;
            return Ok(());
        }
        Commands::Simulate { .. } | Commands::Watch { .. } => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        MonitorConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        MonitorConfig::from_env().context("Failed to load config from environment")?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    info!(target: TARGET_INIT, "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    if !config_found {
        warn!(target: TARGET_INIT, "Config file not found at {}, using defaults", cli.config.display());
    }

    match cli.command {
        Commands::Simulate {
            requests,
            spike_every,
            host_cpu,
            concurrency,
            json,
        } => {
            let plan = SimulationPlan {
                requests,
                spike_every,
                host_cpu,
                concurrency,
            };
            let summary = run_simulation(config, plan).await.context("Simulation failed")?;
            print_summary(&summary, json)?;
        }
        Commands::Watch {
            samples,
            interval_ms,
            json,
        } => {
            let every = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.host.sample_interval());
            let summary = run_watch(config, SystemHostSource::new(), samples, every)
                .await
                .context("Host watch failed")?;
            print_watch_summary(&summary, json)?;
        }
        _ => {}
    }

    Ok(())
}
