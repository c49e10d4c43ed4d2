use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

use crate::config;
use crate::daemon::{self, DaemonOpts};
use crate::orchestrator::{Orchestrator, RealSystem};
use crate::paths::RuntimePaths;
use crate::protocol::StatusMap;

#[derive(Parser, Debug)]
#[command(
    name = "tend",
    about = "Run and supervise a declared stack of services",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control-plane daemon in the foreground.
    Daemon {
        #[arg(long)]
        socket: PathBuf,
        #[arg(long)]
        pid_file: PathBuf,
        #[arg(long)]
        log_dir: PathBuf,
        /// Graceful-stop budget per service, in milliseconds.
        #[arg(long)]
        shutdown_timeout_ms: Option<u64>,
    },
    /// Start services up to and including SERVICE (all when omitted).
    Start {
        service: Option<String>,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Stop services from SERVICE through the last (everything, daemon
    /// included, when omitted).
    Stop {
        service: Option<String>,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Report supervised service states.
    Status {
        service: Option<String>,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

pub fn entrypoint() {
    process::exit(run(Cli::parse()));
}

fn run(cli: Cli) -> i32 {
    match dispatch(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Daemon {
            socket,
            pid_file,
            log_dir,
            shutdown_timeout_ms,
        } => {
            init_tracing();
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(daemon::run(DaemonOpts {
                socket_path: socket,
                pid_file,
                log_dir,
                shutdown_timeout_ms,
            }))
        }
        Commands::Start { service, dir } => build(&dir)?.start(service.as_deref()),
        Commands::Stop { service, dir } => build(&dir)?.stop(service.as_deref()),
        Commands::Status { service, dir } => {
            let map = build(&dir)?.status(service.as_deref())?;
            print_status(&map);
            Ok(())
        }
    }
}

fn build(dir: &Path) -> Result<Orchestrator<RealSystem>> {
    let paths = RuntimePaths::from_root(dir);
    let config = config::load(&paths.services_file())?;
    Ok(Orchestrator::new(config, paths, RealSystem))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn print_status(map: &StatusMap) {
    println!("NAME\tSTATE\tPID\tRESTARTS");
    for (name, st) in map {
        println!(
            "{}\t{}\t{}\t{}",
            name,
            st.state,
            st.pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            st.restart_count
        );
    }
}
