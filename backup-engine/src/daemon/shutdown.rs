//! Operator cancellation through SIGTERM and SIGINT.
//!
//! The first signal cancels the run's token; the lifecycle manager then
//! cancels the active copy job and records the run as CANCELLED.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for SIGINT or SIGTERM and return its name.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    signal::ctrl_c().await.map(|_| "SIGINT")
}

/// Cancel `token` on the first shutdown signal. The watcher exits on its own
/// once `token` is cancelled for any other reason.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = wait_for_signal() => match signal {
                Ok(name) => {
                    info!("Received {}, cancelling backup run...", name);
                    token.cancel();
                }
                Err(e) => warn!("Failed to install signal handlers: {}", e),
            },
            _ = token.cancelled() => {}
        }
    })
}
