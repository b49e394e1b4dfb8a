//! Thin binary entry point. The argv contract from the CLI surface:
//! `generate-secret <mode|hostname>` prints a secret and exits;
//! `<config.yaml>` (default `./config.yaml`) loads and runs.
//!
//! `tunnel-cli`'s `wstunnel` binary wraps the same two forms behind `clap`
//! for a friendlier `--help`; this binary is the teacher's own
//! no-framework entry point kept alongside it.

use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.first().map(String::as_str) == Some("generate-secret") {
        let Some(mode) = args.get(1) else {
            eprintln!("usage: generate-secret <mode|hostname>");
            return ExitCode::FAILURE;
        };
        println!("{}", tunnel_core::secret::generate(mode));
        return ExitCode::SUCCESS;
    }

    let config_path = args
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(tunnel_core::runtime::run(&config_path)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("bootstrap failed: {e}");
            ExitCode::FAILURE
        }
    }
}
