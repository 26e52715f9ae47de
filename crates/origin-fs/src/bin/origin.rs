//! origin: create, mount and fill originfs origins.
//!
//! # Usage
//!
//! ```bash
//! origin create photos.zip
//! origin mount photos.zip          # returns once the background worker is ready
//! origin put beach.jpg photos.zip
//! origin get beach.jpg photos.zip ./copy.jpg
//! origin unmount photos.zip        # repacks the archive
//! ```

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use origin_fs::{daemon, default_provider, Error, Relaunch, Result, Settings, StorageManager};
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

/// Manage origins: directories and archives mounted as filesystems.
#[derive(Parser, Debug)]
#[command(name = "origin")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (default: $ORIGINFS_CONFIG or the user config dir)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new origin (a directory, or an archive when NAME has an archive extension)
    Create { origin: String },

    /// Delete an unmounted origin and its data
    Delete { origin: String },

    /// Mount an origin, in a background worker unless --foreground is given
    Mount {
        origin: String,

        /// Serve in this process until interrupted
        #[arg(long)]
        foreground: bool,

        /// Signal this process with SIGUSR1 once mounted
        #[arg(long, value_name = "PID", requires = "foreground")]
        notify_pid: Option<u32>,
    },

    /// Unmount an origin
    Unmount { origin: String },

    /// Copy a file into a mounted origin
    Put { file: PathBuf, origin: String },

    /// Copy a file out of a mounted origin
    Get {
        file: String,
        origin: String,

        /// Destination file or directory (default: current directory)
        dest: Option<PathBuf>,

        /// Write the contents to stdout instead of a file
        #[arg(long, conflicts_with = "dest")]
        stdout: bool,
    },

    /// Remove a file from a mounted origin
    Remove { file: String, origin: String },

    /// List origins and their mount state
    List,

    /// List the top-level entries of a mounted origin
    Ls { origin: String },
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run(args) {
        error!("{}", e);
        process::exit(e.exit_code());
    }
}

fn run(args: Args) -> Result<()> {
    let settings = Settings::load(args.config.as_deref())?;
    let manager = StorageManager::open(settings, default_provider())?;

    match args.command {
        Command::Create { origin } => {
            let bucket = manager.create(&origin)?;
            println!("{}", bucket.backing_path().display());
        }
        Command::Delete { origin } => manager.delete(&origin)?,
        Command::Mount {
            origin,
            foreground: true,
            notify_pid,
        } => {
            // Before attaching, so a SIGTERM from a parent that gave up
            // waiting unmounts instead of killing a recorded mount.
            daemon::install_termination_handlers().map_err(|source| Error::Process {
                origin: origin.clone(),
                source,
            })?;
            let mount = manager.mount(&origin)?;
            if notify_pid.is_none() {
                println!("{}", mount.mount_path().display());
            }
            mount.serve(notify_pid)?;
        }
        Command::Mount { origin, .. } => {
            let relaunch = worker_relaunch(&args.config, args.verbose, &origin)
                .map_err(|source| Error::Process {
                    origin: origin.clone(),
                    source,
                })?;
            manager.mount_detached(&origin, &relaunch)?;
            let (_, mount) = manager.registry().resolve(&origin)?;
            info!("Origin {} mounted in the background", origin);
            println!("{}", mount.mount_path.display());
        }
        Command::Unmount { origin } => manager.unmount(&origin)?,
        Command::Put { file, origin } => {
            let dest = manager.bucket(&origin)?.put_file(&file, None)?;
            println!("{}", dest.display());
        }
        Command::Get {
            file,
            origin,
            dest,
            stdout,
        } => {
            let bucket = manager.bucket(&origin)?;
            if stdout {
                let data = bucket.get_file(&file, None, true)?;
                io::stdout()
                    .write_all(&data)
                    .map_err(|e| Error::Io {
                        op: "get",
                        origin: origin.clone(),
                        source: e,
                    })?;
            } else {
                bucket.get_file(&file, dest.as_deref(), false)?;
            }
        }
        Command::Remove { file, origin } => manager.bucket(&origin)?.remove_file(&file)?,
        Command::List => {
            for origin in manager.list()? {
                let mount = origin
                    .mount_path
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}\t{}\t{}", origin.name, origin.kind, mount);
            }
        }
        Command::Ls { origin } => {
            for name in manager.bucket(&origin)?.list()? {
                println!("{}", name);
            }
        }
    }
    Ok(())
}

/// The command line a background worker runs: this binary, the same
/// settings, `mount <origin>`.
fn worker_relaunch(
    config: &Option<PathBuf>,
    verbose: bool,
    origin: &str,
) -> std::result::Result<Relaunch, origin_fs::DaemonError> {
    let mut worker_args: Vec<OsString> = Vec::new();
    if let Some(config) = config {
        worker_args.push("--config".into());
        worker_args.push(config.clone().into_os_string());
    }
    if verbose {
        worker_args.push("--verbose".into());
    }
    worker_args.push("mount".into());
    worker_args.push(origin.into());
    Relaunch::current_exe(worker_args)
}
