//! switchboard - local bridge between UI processes and their backends.
//!
//! This is the main binary entry point. See the `switchboard` library for
//! the core functionality.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use switchboard::config::Config;
use switchboard::connection::AllowAll;
use switchboard::router::persistence::JsonFileAtomStore;
use switchboard::router::{Collaborators, Router, RouterEvent};
use switchboard::terminal::pty_host::{self, PtyHostOptions};
use switchboard::terminal::ProcessLauncher;
use switchboard::ui_socket::UiSocketServer;
use switchboard::worker::git;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Bridge UI connections to an assistant, a bus, terminals and a git worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router behind the UI socket until interrupted
    Serve {
        /// UI socket path (overrides config)
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Host one command on a real PTY, speaking the bridge protocol on stdio
    PtyBridge {
        /// Initial width
        #[arg(long, default_value_t = 80)]
        cols: u16,
        /// Initial height
        #[arg(long, default_value_t = 24)]
        rows: u16,
        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Program and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Serve version-control requests as JSON lines on stdio
    GitWorker,
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { socket } => {
            let config_dir = Config::config_dir()?;
            init_file_logging(&config_dir)?;
            let config = Config::load()?;
            let socket = socket.unwrap_or_else(|| config.ui_socket_path(&config_dir));
            serve(&config, &config_dir, socket)?;
        }
        Commands::PtyBridge {
            cols,
            rows,
            cwd,
            command,
        } => {
            init_stderr_logging();
            let code = pty_host::run(&PtyHostOptions {
                cols,
                rows,
                cwd,
                command,
            })?;
            std::process::exit(code);
        }
        Commands::GitWorker => {
            init_stderr_logging();
            git::run()?;
        }
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Log to a file; stdout and stderr belong to whoever launched us.
///
/// Uses `SWITCHBOARD_LOG_FILE` or `<config dir>/switchboard.log`.
fn init_file_logging(config_dir: &Path) -> Result<()> {
    let log_path = std::env::var("SWITCHBOARD_LOG_FILE")
        .map_or_else(|_| config_dir.join("switchboard.log"), PathBuf::from);
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("Failed to create log file at {}", log_path.display()))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .init();

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {panic_info}");
        default_hook(panic_info);
    }));
    Ok(())
}

/// Helper subcommands own stdout for their protocol.
fn init_stderr_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .format_timestamp_secs()
        .init();
}

fn serve(config: &Config, config_dir: &Path, socket: PathBuf) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate the switchboard executable")?;
    let options = config.router_options(&exe);
    let collaborators = Collaborators {
        auth: Box::new(AllowAll),
        atoms: Box::new(JsonFileAtomStore::new(config.atoms_path(config_dir))),
        launcher: Box::new(ProcessLauncher::with_bridge(
            exe.clone(),
            vec!["pty-bridge".to_string()],
        )),
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(async move {
        let router = Router::new(options, collaborators);
        let router_tx = router.sender();
        let server = UiSocketServer::start(socket, router_tx.clone())?;
        log::info!("switchboard {} serving", env!("CARGO_PKG_VERSION"));

        let shutdown_tx = router_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            log::info!("Shutdown signal received");
            let _ = shutdown_tx.send(RouterEvent::Shutdown);
        });

        router.run().await;
        server.shutdown();
        Ok(())
    })
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Could not install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
