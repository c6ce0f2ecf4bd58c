/// Signal handling for operator interruption.
///
/// SIGINT (Ctrl-C) and SIGTERM both resolve the shutdown future; the
/// supervisor then runs its normal termination path on the agent.
use tokio::signal::unix::{signal, SignalKind};

/// Resolves on the first SIGINT or SIGTERM.
///
/// If a handler cannot be installed the corresponding signal is simply not
/// awaited.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, interrupting run"),
        _ = terminate => tracing::info!("received SIGTERM, interrupting run"),
    }
}
