//! Signal handling for the server process.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DaemonError;

/// Signal type for server control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// Stop claiming, let running jobs finish (SIGTERM, SIGINT).
    Shutdown,
    /// Stop without waiting for running jobs (second SIGTERM/SIGINT).
    Terminate,
}

impl std::fmt::Display for DaemonSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonSignal::Shutdown => write!(f, "SHUTDOWN"),
            DaemonSignal::Terminate => write!(f, "TERMINATE"),
        }
    }
}

/// Signal handler for managing server lifecycle signals.
///
/// Shutdown and terminate are exposed as cancellation tokens so they can be
/// handed to the scheduler loops directly.
#[derive(Clone)]
pub struct SignalHandler {
    sender: broadcast::Sender<DaemonSignal>,
    shutdown: CancellationToken,
    terminate: CancellationToken,
}

impl SignalHandler {
    /// Create a new signal handler.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender,
            shutdown: CancellationToken::new(),
            terminate: CancellationToken::new(),
        }
    }

    /// Subscribe to signals.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonSignal> {
        self.sender.subscribe()
    }

    /// Send a signal. Terminate implies shutdown.
    pub fn send(&self, signal: DaemonSignal) {
        debug!("Sending signal: {}", signal);
        if signal == DaemonSignal::Terminate {
            self.terminate.cancel();
        }
        self.shutdown.cancel();
        let _ = self.sender.send(signal);
    }

    /// Request graceful shutdown; a repeated request terminates.
    pub fn request_shutdown(&self) {
        if self.is_shutdown_requested() {
            warn!("Shutdown requested again, no longer waiting for running jobs");
            self.send(DaemonSignal::Terminate);
        } else {
            self.send(DaemonSignal::Shutdown);
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn is_terminate_requested(&self) -> bool {
        self.terminate.is_cancelled()
    }

    /// Token cancelled on the first shutdown request.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Token cancelled when running jobs should no longer be awaited.
    pub fn terminate_token(&self) -> CancellationToken {
        self.terminate.clone()
    }

    /// Set up OS signal handlers (Unix only).
    #[cfg(unix)]
    pub async fn setup_os_signals(&self) -> Result<(), DaemonError> {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::interrupt(), "SIGINT"),
        ] {
            let mut stream = signal(kind).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;
            let handler = self.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    info!("Received {}", name);
                    handler.request_shutdown();
                }
            });
        }

        info!("OS signal handlers installed (SIGTERM, SIGINT)");
        Ok(())
    }

    /// Set up OS signal handlers (non-Unix fallback).
    #[cfg(not(unix))]
    pub async fn setup_os_signals(&self) -> Result<(), DaemonError> {
        let handler = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                handler.request_shutdown();
            }
        });
        info!("OS signal handler installed (Ctrl+C)");
        Ok(())
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
