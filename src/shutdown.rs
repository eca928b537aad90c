use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// The run treats cancellation as "stop scheduling": polling and scheduling
/// loops exit at their next tick and launches already in flight complete.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping scheduler");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping scheduler");
            }
        }

        token_clone.cancel();
    });

    token
}
