use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::args::{Cli, Command, RepositoryCommand, VolumeCommand};
use crate::cli::commands::{backup, exit_for_error, repository, serve, status, volume};

const CONFIG_FILE: &str = "/etc/cronvault.yaml";

pub mod args;
pub mod commands;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config_path = cli.config.unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;

    let result = runtime.block_on(async {
        match cli.command {
            Command::Serve => serve::run_serve(&config_path).await,
            Command::Backup(args) => backup::run_backup(&config_path, &args.schedule).await,
            Command::Due => status::run_due(&config_path),
            Command::Status => status::run_status(&config_path),
            Command::Volume { command } => match command {
                VolumeCommand::Mount(args) => volume::run_mount(&config_path, &args.name).await,
                VolumeCommand::Unmount(args) => volume::run_unmount(&config_path, &args.name).await,
                VolumeCommand::Health(args) => volume::run_health(&config_path, &args.name).await,
            },
            Command::Repository { command } => match command {
                RepositoryCommand::Init(args) => repository::run_init(&config_path, &args.name).await,
                RepositoryCommand::Check(args) => {
                    repository::run_check(&config_path, &args.name, args.read_data).await
                }
                RepositoryCommand::Snapshots(args) => {
                    repository::run_snapshots(&config_path, &args.name, args.schedule.as_deref())
                        .await
                }
                RepositoryCommand::Unlock(args) => {
                    repository::run_unlock(&config_path, &args.name).await
                }
                RepositoryCommand::DeleteSnapshot(args) => {
                    repository::run_delete_snapshot(&config_path, &args.name, &args.snapshot).await
                }
            },
        }
    });
    if let Err(err) = result {
        exit_for_error(&err);
    }
    Ok(())
}

/// `RUST_LOG` wins over `--verbose`.
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(verbose)
        .try_init();
}
