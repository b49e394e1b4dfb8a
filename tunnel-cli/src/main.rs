//! `wstunnel` — the CLI wrapper around `tunnel-core`.
//!
//! Argv forms (see `tunnel_core::runtime` / `tunnel_core::secret`):
//! `wstunnel generate-secret <mode|hostname>` prints an MTProto hex secret
//! and exits; `wstunnel [config.yaml]` loads a config (default
//! `./config.yaml`) and runs until SIGINT/SIGTERM.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "wstunnel")]
#[command(about = "Bidirectional TCP/WebSocket tunnel with protocol-aware fallback routing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the YAML config file to run.
    #[arg(default_value = "config.yaml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Produce an MTProto hex secret and exit.
    GenerateSecret {
        /// "simple", "secured", or any other token treated as a FakeTLS cloak hostname.
        mode: String,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(Commands::GenerateSecret { mode }) = &cli.command {
        println!("{}", tunnel_core::secret::generate(mode));
        return ExitCode::SUCCESS;
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(tunnel_core::runtime::run(&cli.config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("bootstrap failed: {e}");
            ExitCode::FAILURE
        }
    }
}
