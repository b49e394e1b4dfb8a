//! Ambient bootstrap: load a config file, link it into a `Runtime`, spawn
//! everything, and block until a shutdown signal arrives. Grounded in
//! `main.go`'s `signal.Notify(os.Interrupt, syscall.SIGTERM)` followed by a
//! blocking channel receive — the same two-step shutdown here, built on
//! `tokio::signal`.

use std::path::Path;

use crate::config;
use crate::error::Result;
use crate::registry::Runtime;

/// Load `config_path`, build and spawn every listener/tunnel it describes,
/// then wait for SIGINT/SIGTERM before returning.
pub async fn run(config_path: &Path) -> Result<()> {
    let cfg = config::load(config_path)?;

    if !cfg.disable_log && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    if !cfg.disable_log {
        let _ = env_logger::try_init();
    }

    let runtime = Runtime::build(&cfg)?;
    let handles = runtime.spawn_all();

    wait_for_shutdown().await;
    log::info!("shutdown signal received, exiting");

    for h in handles {
        h.abort();
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
