//! `hearken` – interactive publish/subscribe shell.
//!
//! 1. Loads `~/.hearken/config.toml`, writing the defaults on first run.
//! 2. Opens the configured backend (`memory` or `loopback`).
//! 3. Drops the user into a line-based shell with slash-commands
//!    (`/sub`, `/unsub`, `/pub`, `/topics`, `/state`, `/help`, `/quit`).

mod config;
mod repl;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use hearken_bus::{Backend, BrokerAdapter, LoopbackBroker, MemoryBus};
use hearken_types::BusError;
use tracing::{info, warn};

use crate::config::{BackendKind, Config};

#[tokio::main]
async fn main() {
    // RUST_LOG selects the level (default "info"); HEARKEN_LOG_FORMAT=json
    // switches to newline-delimited JSON.  Shell output stays on println!.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("HEARKEN_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    print_banner();

    let cfg = load_or_create_config();

    print!("  Opening {} backend … ", cfg.backend.to_string().bold());
    std::io::stdout().flush().ok();
    let backend = match open_backend(&cfg).await {
        Ok(backend) => {
            println!("{}", backend.state().to_string().green());
            backend
        }
        Err(e) => {
            println!("{}", "failed".red());
            println!("  {}: {}", "Backend error".red(), e);
            std::process::exit(1);
        }
    };

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(backend).await;
}

fn load_or_create_config() -> Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

/// Build the backend selected by `cfg` and wait until it is ready.
pub(crate) async fn open_backend(cfg: &Config) -> Result<Arc<dyn Backend>, BusError> {
    let backend: Arc<dyn Backend> = match cfg.backend {
        BackendKind::Memory => Arc::new(MemoryBus::new()),
        BackendKind::Loopback => {
            let adapter =
                BrokerAdapter::connect(cfg.broker.clone(), Arc::new(LoopbackBroker::new()))
                    .await?;
            Arc::new(adapter)
        }
    };

    let wait = Duration::from_millis(cfg.broker.ack_timeout_ms);
    match tokio::time::timeout(wait, backend.wait_ready()).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(backend = %cfg.backend, "backend not ready in time");
            return Err(BusError::Transport(format!(
                "{} backend not ready after {} ms",
                cfg.backend, cfg.broker.ack_timeout_ms
            )));
        }
    }
    info!(backend = %cfg.backend, "backend ready");
    Ok(backend)
}

fn print_banner() {
    println!();
    println!("  {} {}", "hearken".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Topic publish/subscribe shell");
    println!();
}
