use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "cronvault", version, about = "Cron-driven restic backups of mounted volumes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the scheduler until interrupted.
    Serve,
    /// Run one schedule's backup now, in the foreground.
    Backup(BackupArgs),
    /// List schedules whose next run is due.
    Due,
    Status,
    Volume {
        #[command(subcommand)]
        command: VolumeCommand,
    },
    Repository {
        #[command(subcommand)]
        command: RepositoryCommand,
    },
}

#[derive(Args, Debug, Clone)]
pub struct BackupArgs {
    pub schedule: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum VolumeCommand {
    Mount(NameArgs),
    #[command(alias = "umount")]
    Unmount(NameArgs),
    Health(NameArgs),
}

#[derive(Subcommand, Debug, Clone)]
pub enum RepositoryCommand {
    /// Initialize the repository, or adopt it when it already exists.
    Init(NameArgs),
    Check(CheckArgs),
    Snapshots(SnapshotsArgs),
    /// Remove stale restic locks.
    Unlock(NameArgs),
    DeleteSnapshot(DeleteSnapshotArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NameArgs {
    pub name: String,
}

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    pub name: String,
    #[arg(long)]
    pub read_data: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SnapshotsArgs {
    pub name: String,
    /// Only list snapshots taken by this schedule.
    #[arg(long)]
    pub schedule: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteSnapshotArgs {
    pub name: String,
    pub snapshot: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_commands_and_global_flags() {
        let cli = Cli::try_parse_from([
            "cronvault",
            "repository",
            "check",
            "offsite",
            "--read-data",
            "--config",
            "/tmp/c.yaml",
            "-v",
        ])
        .expect("parse");
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
        match cli.command {
            Command::Repository {
                command: RepositoryCommand::Check(args),
            } => {
                assert_eq!(args.name, "offsite");
                assert!(args.read_data);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn umount_alias() {
        let cli = Cli::try_parse_from(["cronvault", "volume", "umount", "media"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::Volume {
                command: VolumeCommand::Unmount(_)
            }
        ));
    }

    #[test]
    fn backup_requires_a_schedule() {
        assert!(Cli::try_parse_from(["cronvault", "backup"]).is_err());
    }
}
