//! Relay Supervisor
//!
//! Runs one or many providers concurrently: creates and initialises each,
//! installs the auto-reply engine's handler, starts the listeners, and on
//! SIGINT/SIGTERM stops and disconnects everything, awaiting settlement.
//! One provider's failure never takes down the others.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, TwilioEnv};
use crate::providers::{
    self, ListenTuning, Provider, ProviderFatal, ProviderKind,
};
use crate::reply::AutoReplyEngine;
use crate::session::SessionManager;

/// Which providers a relay run should drive.
#[derive(Debug, Clone)]
pub enum ProviderSelection {
    /// Detect from on-disk credentials and environment.
    Auto,
    /// Explicit ordered list from the CLI.
    Explicit(Vec<ProviderKind>),
}

/// Deterministic auto-detection: wa-web credentials, then a telegram
/// session, then a complete Twilio environment.
pub fn detect_configured() -> Vec<ProviderKind> {
    let mut found = Vec::new();
    if providers::waweb::WaWebProvider::credentials_present() {
        found.push(ProviderKind::WaWeb);
    }
    if providers::telegram::TelegramProvider::session_present() {
        found.push(ProviderKind::Telegram);
    }
    if TwilioEnv::is_configured() {
        found.push(ProviderKind::WaTwilio);
    }
    found
}

/// Installs handlers for SIGINT and SIGTERM. Returns a token that is
/// cancelled when either signal arrives.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("failed to install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    signalled.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("received Ctrl+C, shutting down");
        }

        signalled.cancel();
    });

    token
}

/// Guards the on-disk state directory against a second concurrent relay.
/// The state stores are single-writer; two relays on one config dir corrupt
/// each other.
struct StateLock {
    path: std::path::PathBuf,
}

impl StateLock {
    fn acquire() -> Result<Self> {
        let path = crate::config::paths::config_dir().join("warelay.lock");
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path).unwrap_or_default();
                anyhow::bail!(
                    "another relay appears to be running (lock {} held by pid {}); \
                     remove the file if that process is gone",
                    path.display(),
                    holder.trim()
                )
            }
            Err(e) => Err(e).context("could not create relay lock file"),
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Run the relay until a shutdown signal. Returns an error only for startup
/// failures; runtime provider faults are logged and isolated.
pub async fn run(config: Config, selection: ProviderSelection, tuning: ListenTuning) -> Result<()> {
    let _state_lock = StateLock::acquire()?;
    let configured = detect_configured();
    let kinds = match selection {
        ProviderSelection::Auto => {
            if configured.is_empty() {
                anyhow::bail!(
                    "no provider is configured: pair wa-web, log in to telegram, \
                     or export the TWILIO_* variables"
                );
            }
            tracing::info!(
                "auto-detected providers: {}",
                configured
                    .iter()
                    .map(|k| k.tag())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            configured.clone()
        }
        ProviderSelection::Explicit(kinds) => {
            let unselected: Vec<&str> = configured
                .iter()
                .filter(|k| !kinds.contains(k))
                .map(|k| k.tag())
                .collect();
            if !unselected.is_empty() {
                tracing::info!(
                    "authenticated but not selected: {}",
                    unselected.join(", ")
                );
            }
            kinds
        }
    };

    // Engine + session machinery.
    let reply_cfg = &config.inbound.reply;
    let sessions = Arc::new(SessionManager::new(
        reply_cfg.session.scope,
        reply_cfg.session.idle_minutes,
        reply_cfg.heartbeat_minutes,
    ));
    let engine = AutoReplyEngine::new(config.clone(), sessions.clone());

    let cancel = install_signal_handler();

    // Long-lived session tasks: idle sweeper and heartbeat scheduler.
    let sweeper = tokio::spawn(sessions.clone().run_sweeper(cancel.clone()));
    let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<String>(16);
    let scheduler = tokio::spawn(
        sessions
            .clone()
            .run_heartbeats(cancel.clone(), heartbeat_tx),
    );
    let heartbeat_engine = engine.clone();
    let heartbeat_pump = tokio::spawn(async move {
        while let Some(key) = heartbeat_rx.recv().await {
            heartbeat_engine.fire_heartbeat(&key).await;
        }
    });

    // Fatal reports: log and keep going with the remaining providers.
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<ProviderFatal>();
    let fatal_log = tokio::spawn(async move {
        while let Some(fatal) = fatal_rx.recv().await {
            tracing::error!(
                "{}: provider terminated: {} (other providers keep running)",
                fatal.kind,
                fatal.message
            );
        }
    });
    let tuning = ListenTuning {
        fatal: Some(fatal_tx),
        ..tuning
    };

    // Bring every selected provider up. Per-provider failures are logged;
    // the relay runs with whatever started.
    let mut running: Vec<Arc<dyn Provider>> = Vec::new();
    for kind in kinds {
        match providers::connect_provider(kind, &config).await {
            Ok(provider) => {
                provider.on_message(engine.handler());
                engine.register_provider(provider.clone()).await;
                match provider.start_listening(cancel.clone(), &tuning).await {
                    Ok(()) => {
                        tracing::info!("{kind}: listening");
                        running.push(provider);
                    }
                    Err(e) => {
                        tracing::error!("{kind}: failed to start listening: {e}");
                        let _ = provider.disconnect().await;
                    }
                }
            }
            Err(e) => {
                tracing::error!("{kind}: initialisation failed: {e}");
            }
        }
    }
    if running.is_empty() {
        cancel.cancel();
        anyhow::bail!("no provider could be started");
    }

    println!(
        "Relay running on: {}. Press Ctrl+C to stop.",
        running
            .iter()
            .map(|p| p.kind().detailed_name())
            .collect::<Vec<_>>()
            .join(", ")
    );

    cancel.cancelled().await;

    // Shutdown: stop listening, then disconnect, awaiting every settlement.
    tracing::info!("stopping {} provider(s)", running.len());
    join_all(running.iter().map(|p| async move {
        if let Err(e) = p.stop_listening().await {
            tracing::warn!("{}: stop_listening failed: {e}", p.kind());
        }
        if let Err(e) = p.disconnect().await {
            tracing::warn!("{}: disconnect failed: {e}", p.kind());
        }
    }))
    .await;

    // Sessions die with the relay: terminate agents, cancel heartbeats.
    sessions.destroy_all().await;

    let _ = sweeper.await;
    let _ = scheduler.await;
    heartbeat_pump.abort();
    fatal_log.abort();

    tracing::info!("relay stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_handler_token_starts_uncancelled() {
        let token = install_signal_handler();
        assert!(!token.is_cancelled());
        token.cancel();
    }

    #[tokio::test]
    async fn test_explicit_selection_runs_requested_kinds_only() {
        // Pure selection logic: the unselected-but-authenticated report is
        // computed against detection, which is empty in a clean test env.
        let selection = ProviderSelection::Explicit(vec![ProviderKind::WaTwilio]);
        match selection {
            ProviderSelection::Explicit(kinds) => {
                assert_eq!(kinds, vec![ProviderKind::WaTwilio]);
            }
            ProviderSelection::Auto => unreachable!(),
        }
    }
}
