//! Transfers command line tool
//!
//! Runs the transfer engine in process against a systems file and drives a
//! single request to completion.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod logging;
mod output;
mod progress;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use console::style;
use logging::{init_logging, Verbosity};
use progress::TransferProgress;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use transfers_config::{Config, ConfigLoader};
use transfers_engine::{StaticSystems, TransferEngine};
use transfers_types::{TaskStatus, TransferRequest, TransferRequestElement, TransferUri};

/// Move files between storage systems
#[derive(Parser)]
#[command(name = "transfers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Move files and directories between storage systems")]
#[command(
    long_about = "Runs the transfer engine in process: validates the request, stages one task per \
                  file and moves the bytes between LOCAL, LINUX, S3, IRODS, GLOBUS and HTTP \
                  endpoints described in a systems file."
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Only log errors and hide the progress bar
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the first transfers.{yaml,toml,json} found)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a transfer and wait for it to finish
    Run {
        /// YAML file describing the available systems
        #[arg(short, long)]
        systems: PathBuf,

        /// Tenant the request is made in
        #[arg(short, long)]
        tenant: String,

        /// User making the request
        #[arg(short, long)]
        user: String,

        /// Free form tag stored on the transfer
        #[arg(long)]
        tag: Option<String>,

        /// Tolerate failures of every element
        #[arg(long)]
        optional: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 86_400)]
        timeout: u64,

        /// Source and destination URIs, in pairs
        #[arg(value_name = "SRC DST", num_args = 2.., required = true)]
        uris: Vec<String>,
    },

    /// Print the effective configuration as YAML
    Config {
        /// Print the built-in defaults instead
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let verbosity = Verbosity {
        debug: cli.debug,
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Run {
            systems,
            tenant,
            user,
            tag,
            optional,
            json,
            timeout,
            uris,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let _guard = init_logging(&config.logging, verbosity)?;
            let request = TransferRequest {
                tenant_id: tenant,
                username: user,
                tag,
                elements: parse_elements(&uris, optional)?,
            };
            run_command(
                config,
                &systems,
                request,
                Duration::from_secs(timeout),
                json,
                cli.quiet || json,
            )
            .await
        }
        Commands::Config { default } => config_command(cli.config.as_deref(), default),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Pair up positional URIs into request elements
fn parse_elements(uris: &[String], optional: bool) -> anyhow::Result<Vec<TransferRequestElement>> {
    if uris.len() % 2 != 0 {
        bail!("Expected SRC DST pairs, got {} URIs", uris.len());
    }
    uris.chunks(2)
        .map(|pair| {
            let source: TransferUri = pair[0].parse()?;
            let destination: TransferUri = pair[1].parse()?;
            Ok(TransferRequestElement::new(source, destination).optional(optional))
        })
        .collect()
}

async fn run_command(
    config: Config,
    systems_path: &Path,
    request: TransferRequest,
    timeout: Duration,
    json: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    let systems = StaticSystems::load(systems_path).await?;
    debug!(systems = systems.len(), "Systems loaded");

    let poll_interval = config.client.progress_interval();
    let engine = TransferEngine::builder(config)
        .systems(Arc::new(systems))
        .build()?;
    engine.start();

    let (tenant, username) = (request.tenant_id.clone(), request.username.clone());
    let elements = request.elements.len();
    let task = engine.service().create_transfer(request).await?;
    if !quiet {
        println!(
            "{} Transfer {} accepted with {} element(s)",
            style("→").green().bold(),
            task.id,
            elements
        );
    }

    let progress = TransferProgress::new(quiet);
    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = tokio::time::interval(poll_interval.min(Duration::from_millis(500)));
    let task = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = engine.service().get_transfer(&tenant, &username, task.id).await?;
                progress.update(&current);
                if current.is_terminal() {
                    break current;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(task_id = %task.id, "Timed out waiting, cancelling");
                    break engine.service().cancel_transfer(&tenant, &username, task.id).await?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(task_id = %task.id, "Interrupted, cancelling");
                break engine.service().cancel_transfer(&tenant, &username, task.id).await?;
            }
        }
    };
    progress.finish(&task);

    engine.stop().await;

    let details = engine
        .service()
        .get_transfer_details(&tenant, &username, task.id)
        .await?;
    if json {
        output::print_json(&details)?;
    } else {
        output::print_summary(&details);
    }

    match details.task.status {
        TaskStatus::Completed => Ok(()),
        status => bail!("Transfer {} finished as {}", details.task.id, status),
    }
}

fn config_command(path: Option<&Path>, default: bool) -> anyhow::Result<()> {
    let config = if default {
        Config::default()
    } else {
        load_config(path)?
    };
    print!("{}", ConfigLoader::to_yaml(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "transfers",
            "run",
            "--systems",
            "systems.yaml",
            "--tenant",
            "t1",
            "--user",
            "alice",
            "--optional",
            "tapis://t1/a/in",
            "tapis://t1/b/out",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                uris, optional, ..
            } => {
                assert!(optional);
                assert_eq!(uris.len(), 2);
            }
            Commands::Config { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_elements_pairs() {
        let uris: Vec<String> = [
            "tapis://t1/a/x",
            "tapis://t1/b/x",
            "https://example.com/f.txt",
            "tapis://t1/b/f.txt",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        let elements = parse_elements(&uris, true).unwrap();
        assert_eq!(elements.len(), 2);
        assert!(elements.iter().all(|e| e.optional));
        assert!(!elements[1].source_uri.is_tapis());
    }

    #[test]
    fn test_parse_elements_rejects_odd_count() {
        let uris = vec!["tapis://t1/a/x".to_string(); 3];
        assert!(parse_elements(&uris, false).is_err());
    }

    #[test]
    fn test_parse_elements_rejects_bad_uri() {
        let uris = vec!["ftp://host/x".to_string(), "tapis://t1/b/x".to_string()];
        assert!(parse_elements(&uris, false).is_err());
    }

    #[test]
    fn test_default_config_renders() {
        let yaml = ConfigLoader::to_yaml(&Config::default()).unwrap();
        assert!(yaml.contains("workers"));
    }
}
