//! Shutdown signal handling

use tracing::warn;

/// Wait for Ctrl+C, or SIGTERM on Unix.
///
/// ```ignore
/// tokio::select! {
///     _ = common::shutdown::wait_for_shutdown() => info!("Stopping gateway"),
///     msg = bus_rx.recv() => { /* ... */ }
/// }
/// ```
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("SIGTERM handler unavailable, Ctrl+C only: {}", e);
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                match term.as_mut() {
                    Some(sig) => { sig.recv().await; },
                    None => std::future::pending::<()>().await,
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl+C handler failed: {}", e);
        }
    }
}
