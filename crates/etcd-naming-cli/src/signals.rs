//! Process signals that end a registration.

use anyhow::Result;
use tokio::signal;

/// Signals that end a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Hangup,
    Interrupt,
    Quit,
    Terminate,
}

impl ShutdownSignal {
    pub fn number(self) -> i32 {
        match self {
            ShutdownSignal::Hangup => 1,
            ShutdownSignal::Interrupt => 2,
            ShutdownSignal::Quit => 3,
            ShutdownSignal::Terminate => 15,
        }
    }

    /// Shell convention for a process ended by this signal.
    pub fn exit_code(self) -> i32 {
        128 + self.number()
    }

    pub fn name(self) -> &'static str {
        match self {
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Quit => "SIGQUIT",
            ShutdownSignal::Terminate => "SIGTERM",
        }
    }
}

/// Wait for SIGINT, SIGTERM, SIGHUP or SIGQUIT.
///
/// # Errors
/// Returns an error if a signal handler cannot be installed.
#[cfg(unix)]
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    use signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let received = tokio::select! {
        _ = hangup.recv() => ShutdownSignal::Hangup,
        _ = interrupt.recv() => ShutdownSignal::Interrupt,
        _ = quit.recv() => ShutdownSignal::Quit,
        _ = terminate.recv() => ShutdownSignal::Terminate,
    };

    tracing::info!(signal = received.name(), "Shutdown signal received");
    Ok(received)
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    signal::ctrl_c().await.map_err(|e| {
        tracing::error!(%e, "Error handling Ctrl+C signal");
        e
    })?;
    tracing::info!(signal = "SIGINT", "Shutdown signal received");
    Ok(ShutdownSignal::Interrupt)
}
