//! Graceful shutdown handling for devletd.
//!
//! The controller and every plugin observe one shared stop flag; flipping it
//! lets each plugin deregister from the node agent before the daemon exits.

use tokio::sync::watch;
use tracing::info;

/// Create a shutdown signal receiver.
///
/// Returns a watch receiver that flips to `true` when SIGTERM or SIGINT is
/// received.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        let _ = tx.send(true);
    });

    rx
}
