//! Operator interrupt handling.
//!
//! On Unix the run is cancelled on SIGINT, SIGTERM or SIGQUIT (and
//! [`tokio::signal::ctrl_c`]); elsewhere only on ctrl-c.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Completes when the process receives a termination signal.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Cancel `cancel` on the first termination signal.
///
/// The listener exits quietly if the token is cancelled by other means.
pub fn spawn_signal_listener(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            res = wait_for_shutdown_signal() => match res {
                Ok(()) => {
                    info!("interrupt received, cancelling the run");
                    cancel.cancel();
                }
                Err(e) => warn!(error = %e, "could not install signal handlers; interrupts will not cancel cleanly"),
            },
            () = cancel.cancelled() => {}
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    #[tokio::test]
    #[serial]
    async fn test_sigterm_cancels_token() {
        let cancel = CancellationToken::new();
        let listener = spawn_signal_listener(cancel.clone());
        // Give the listener a chance to register its handlers.
        tokio::time::sleep(Duration::from_millis(50)).await;

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .unwrap();
        listener.await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_listener_exits_when_token_cancelled_elsewhere() {
        let cancel = CancellationToken::new();
        let listener = spawn_signal_listener(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .unwrap()
            .unwrap();
    }
}
