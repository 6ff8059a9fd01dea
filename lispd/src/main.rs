#![forbid(unsafe_code)]

use clap::Parser;
use lispd_lib::{config::load_from_path, ctrl};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "LISP control-plane daemon (xTR/MN/MS/RTR)")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE", default_value = "lispd.toml")]
    config: PathBuf,

    /// PID file location
    #[arg(long, value_name = "FILE", default_value = "/var/run/lispd.pid")]
    pid_file: PathBuf,

    /// Override the configured debug level (0..=3)
    #[arg(short, long, value_name = "LEVEL")]
    debug: Option<u8>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let mut cfg = match load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("lispd: failed to load configuration: {err}");
            std::process::exit(1);
        }
    };
    if let Some(level) = cli.debug {
        cfg.debug = level;
    }
    if let Err(err) = init_tracing(cfg.debug, cfg.log_file.as_deref()) {
        eprintln!("lispd: failed to open log file: {err}");
        std::process::exit(1);
    }
    info!(mode = ?cfg.mode, eids = cfg.eids.len(), map_servers = cfg.map_servers.len(),
        "configuration loaded");

    if let Err(err) = write_pid_file(&cli.pid_file) {
        error!(path = %cli.pid_file.display(), %err, "failed to write PID file");
        std::process::exit(1);
    }

    let cfg = Arc::new(cfg);
    let (intents_tx, mut intents_rx) = mpsc::channel(256);
    // The data-plane collaborator owns the tun device and route table; it
    // consumes intents from this channel. Until one is wired in, surface
    // them in the log.
    tokio::spawn(async move {
        while let Some(intent) = intents_rx.recv().await {
            debug!(?intent, "data-plane intent");
        }
    });

    // Interface status events arrive here from the netlink watcher
    // collaborator. The sender stays alive for the daemon's lifetime.
    let (_external_tx, external_rx) = mpsc::channel(64);

    let result = ctrl::run(cfg, intents_tx, external_rx).await;
    let _ = std::fs::remove_file(&cli.pid_file);
    if let Err(err) = result {
        error!(%err, "daemon exited with error");
        std::process::exit(1);
    }
}

fn init_tracing(debug: u8, log_file: Option<&Path>) -> std::io::Result<()> {
    // The 0..=3 ladder mirrors the config surface: 0 keeps operational
    // logs only, 1 turns on protocol debugging, 2 and 3 open everything.
    let default_filter = match debug {
        0 => "info",
        1 => "info,lispd=debug,lispd_lib=debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false);
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_writer(std::sync::Arc::new(file)).with_ansi(false).init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn write_pid_file(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}
