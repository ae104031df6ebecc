//! Command-line entry point.

use crate::controller::{Coordinator, DetailedError, PipelineError};
use crate::logging::init_pipeline_logging;
use crate::transport::KafkaSourceProvider;
use clap::Parser;
use smartcity_storage::tokio::TOKIO;
use smartcity_storage::ObjectStoreBackend;
use smartcity_types::config::PipelineConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServerArgs {
    /// Pipeline configuration YAML file
    #[arg(short, long, env = "SMARTCITY_CONFIG_FILE")]
    pub config_file: String,

    /// Validate the configuration and exit
    #[arg(long, default_value_t = false)]
    pub check: bool,
}

/// Server main function.
///
/// * Parse command line arguments and the configuration file.
/// * Setup logging.
/// * Run the pipeline until SIGINT or SIGTERM, or until a stream fails.
pub fn server_main() -> Result<(), PipelineError> {
    let args = ServerArgs::try_parse().map_err(|e| PipelineError::cli_args_error(&e))?;
    run_server(args)
}

/// Runs the pipeline described by `args`.
///
/// Errors are returned, not logged: the caller reports them once, with
/// [`exit_diagnostic`].
pub fn run_server(args: ServerArgs) -> Result<(), PipelineError> {
    let config = parse_config(&args.config_file)?;

    init_pipeline_logging(&config.name, get_env_filter(&config)).unwrap_or_else(|e| {
        // This happens in unit tests when another test has initialized logging.
        eprintln!("Failed to initialize logging: {e}.")
    });

    if args.check {
        info!(
            "configuration '{}' is valid: {} streams",
            args.config_file,
            config.resolved_streams().len()
        );
        return Ok(());
    }

    TOKIO.block_on(run_pipeline(config))
}

/// Message printed to stderr when the process exits with `error`.
///
/// Stream failures already name the stream and the error code.
pub fn exit_diagnostic(error: &PipelineError) -> String {
    match error.kind() {
        Some(_) => error.to_string(),
        None => format!("{error} ({})", error.error_code()),
    }
}

async fn run_pipeline(config: PipelineConfig) -> Result<(), PipelineError> {
    let store = ObjectStoreBackend::open(
        &config.storage.url,
        config.storage.options.clone(),
        config.storage_timeout(),
    )?;
    let sources = KafkaSourceProvider::new(&config.kafka);
    let coordinator = Coordinator::new(config, Arc::new(store), Arc::new(sources))?;

    let token = CancellationToken::new();
    tokio::spawn(wait_for_signal(token.clone()));
    coordinator.run(token).await?;
    info!("pipeline stopped");
    Ok(())
}

/// Cancels `token` on SIGINT or SIGTERM.
async fn wait_for_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl-C, shutting down");
    }
    token.cancel();
}

/// Reads, validates, and resolves environment references in the
/// configuration file.
pub(crate) fn parse_config(config_file: &str) -> Result<PipelineConfig, PipelineError> {
    let yaml_config = std::fs::read_to_string(config_file).map_err(|e| {
        PipelineError::io_error(format!("reading configuration file '{config_file}'"), e)
    })?;

    // Printed before references are resolved so that secrets stay out of
    // the log.
    eprintln!("Pipeline configuration:\n{yaml_config}");

    let mut config = PipelineConfig::from_yaml(&yaml_config)?;
    config.validate()?;
    config.resolve_env_references()?;
    Ok(config)
}

/// Get the log filtering configuration.
pub(crate) fn get_env_filter(config: &PipelineConfig) -> EnvFilter {
    // The `RUST_LOG` environment variable takes precedence.  It isn't usually
    // set.
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        return env_filter;
    }

    // Otherwise, take the configuration from the pipeline.
    if let Some(dirs) = &config.logging {
        match EnvFilter::try_new(dirs) {
            Ok(env_filter) => return env_filter,
            Err(error) => {
                // Write directly to stderr because logging isn't set up yet.
                eprintln!("Invalid pipeline `logging` configuration ({error}): {dirs}")
            }
        }
    }

    // Otherwise, fall back to `INFO`.
    EnvFilter::new("info")
}
