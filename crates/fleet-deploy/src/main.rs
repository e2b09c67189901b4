use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use fleet_deploy::Result;
use fleet_deploy::executor::CancelToken;
use fleet_deploy::gate::{WaitPolicy, wait_ready};
use fleet_deploy::provision::aws::AwsCliProvider;
use fleet_deploy::remote::SshShell;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Debug-level logging (ignored when RUST_LOG is set)
    #[arg(long, global = true)]
    verbose: bool,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch every configured batch, start workloads, and follow them to completion
    Deploy {
        /// Path to a deploy config TOML
        #[arg(short = 'f', long = "config")]
        config: PathBuf,
        /// Override the local log directory from the config
        #[arg(long)]
        log_dir: Option<String>,
    },
    /// Resume log sync and status tracking from persisted state
    Sync {
        #[arg(short = 'f', long = "config")]
        config: PathBuf,
    },
    /// Relaunch recorded workloads on their existing hosts, then monitor them
    Restore {
        #[arg(short = 'f', long = "config")]
        config: PathBuf,
        /// Only relaunch these addresses (comma separated)
        #[arg(long, value_delimiter = ',')]
        ips: Vec<String>,
    },
    /// Wait until a single host accepts ssh
    WaitSsh {
        #[arg(long)]
        ip: String,
        #[arg(long, default_value = "ubuntu")]
        user: String,
        /// Private key file
        #[arg(long)]
        key: PathBuf,
    },
    /// Print the persisted instance roster and run states
    Status {
        #[arg(short = 'f', long = "config")]
        config: PathBuf,
    },
}

fn install_interrupt_handlers(cancel: &CancelToken) {
    for sig in [SIGINT, SIGTERM] {
        if let Err(e) = signal_hook::flag::register(sig, cancel.flag()) {
            warn!(signal = sig, error = %e, "failed to install signal handler");
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.verbose, args.log_json);

    let cancel = CancelToken::new();
    install_interrupt_handlers(&cancel);

    let res = match args.cmd {
        Command::Deploy { config, log_dir } => cmd_deploy(&config, log_dir, &cancel),
        Command::Sync { config } => cmd_sync(&config, &cancel),
        Command::Restore { config, ips } => cmd_restore(&config, ips, &cancel),
        Command::WaitSsh { ip, user, key } => cmd_wait_ssh(&ip, &user, &key, &cancel),
        Command::Status { config } => cmd_status(&config),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_cancelled() {
                eprintln!("interrupted");
            } else {
                eprintln!("error: {e}");
            }
            ExitCode::FAILURE
        }
    }
}

fn shell_for(common: &fleet_deploy::config::CommonConfig) -> SshShell {
    SshShell::new(
        common.ssh_user.clone(),
        &common.ssh_key_path(),
        common.timing.ssh_connect_timeout(),
    )
}

fn cmd_deploy(path: &Path, log_dir: Option<String>, cancel: &CancelToken) -> Result<()> {
    let mut cfg = fleet_deploy::config::load(path)?;
    if let Some(dir) = log_dir.filter(|d| !d.trim().is_empty()) {
        cfg.common.log_dir = dir;
    }
    let provider = AwsCliProvider::new(cfg.common.region.clone());
    let shell = shell_for(&cfg.common);
    fleet_deploy::deploy::run(&cfg, &provider, &shell, cancel)
}

fn cmd_sync(path: &Path, cancel: &CancelToken) -> Result<()> {
    let cfg = fleet_deploy::config::load(path)?;
    let shell = shell_for(&cfg.common);
    fleet_deploy::deploy::resume_sync(&cfg.common, &shell, cancel)
}

fn cmd_restore(path: &Path, ips: Vec<String>, cancel: &CancelToken) -> Result<()> {
    let cfg = fleet_deploy::config::load(path)?;
    cfg.common.validate_remote_access()?;
    let only: BTreeSet<String> = ips
        .into_iter()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .collect();
    let shell = shell_for(&cfg.common);
    fleet_deploy::restore::restore(&shell, &cfg.common, &only, cancel)
}

fn cmd_wait_ssh(ip: &str, user: &str, key: &Path, cancel: &CancelToken) -> Result<()> {
    let policy = WaitPolicy::default();
    let shell = SshShell::new(user, key, policy.attempt_timeout);
    wait_ready(&shell, ip, &policy, cancel)?;
    println!("{ip} is reachable over ssh");
    Ok(())
}

fn cmd_status(path: &Path) -> Result<()> {
    let cfg = fleet_deploy::config::load(path)?;
    print!("{}", fleet_deploy::deploy::status_report(&cfg.common)?);
    Ok(())
}
