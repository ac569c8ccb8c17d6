//! Command-line driver for the modmount overlay composer.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{debug, error, info};

use modmount::{config, modules, mount, unmount, Config};

/// mmctl
#[derive(Debug, Parser)]
#[clap(name = "mmctl", version)]
struct App {
    /// Staging tmpfs mountpoint
    #[clap(long, global = true, default_value = config::WORK_DIR)]
    work_dir: PathBuf,

    /// Source tag identifying this tool's tmpfs mounts during teardown
    #[clap(long, global = true, default_value = config::MAGIC)]
    magic: String,

    /// Additional partitions eligible for extraction, comma separated
    /// (appended to /vendor,/product,/system_ext)
    #[clap(long, global = true, value_delimiter = ',', value_name = "PARTITIONS")]
    add_partitions: Vec<String>,

    /// Abort instead of skipping entries that cannot be represented
    #[clap(long, global = true)]
    strict: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compose and install the module overlay mounts
    Mount,
    /// Detach every mount installed by a previous run
    Umount,
}

fn run(app: App) -> Result<()> {
    let mut config = Config {
        work_dir: app.work_dir,
        magic: app.magic,
        strict: app.strict,
        ..Config::default()
    };
    for partition in &app.add_partitions {
        config.add_partition(partition);
    }

    match app.cmd {
        Command::Umount => unmount::unmount_modules(&config.magic),
        Command::Mount => {
            info!(
                "work dir {} magic {}",
                config.work_dir.display(),
                config.magic
            );
            for partition in &config.partitions {
                debug!("supported partition: /{partition}");
            }
            mount::setup_work_dir(&config)?;
            let result = modules::handle_modules(&config);
            mount::detach_work_dir(&config);
            result
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();

    // clap exits with 2 on bad arguments by default; our contract is 1.
    let app = match App::try_parse() {
        Ok(app) => app,
        Err(err) => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
    };

    match run(app) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
