//! Cooperative cancellation.
//!
//! Signals and the stop flag both set one `CancellationToken`. Every
//! suspension point in the dispatch loop runs under [`guard`], which turns a
//! set token into the typed [`Interrupted`] error, so an in-flight job falls
//! into the ordinary failure path (persist a failed record, acknowledge)
//! before the worker exits.

use std::future::Future;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// The worker was asked to stop by a signal or the stop flag.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("worker interrupted")]
pub struct Interrupted;

/// Cancel `token` on SIGINT or SIGTERM.
pub fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => (),
        }
        tracing::info!("caught signal to exit");
        token.cancel();
    });
}

/// Run `future` unless `token` is (or becomes) cancelled, in which case the
/// result is an [`Interrupted`] error.
pub async fn guard<T, E>(
    token: &CancellationToken,
    future: impl Future<Output = Result<T, E>>,
) -> anyhow::Result<T>
where
    E: Into<anyhow::Error>,
{
    tokio::select! {
        biased;
        () = token.cancelled() => Err(Interrupted.into()),
        result = future => result.map_err(Into::into),
    }
}

/// Whether `err` is the cancellation marker.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Interrupted>().is_some())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn guard_passes_results_through() {
        let token = CancellationToken::new();
        let value = guard(&token, async { Ok::<_, std::io::Error>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn guard_converts_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let err = guard(&token, std::future::pending::<Result<(), std::io::Error>>())
            .await
            .unwrap_err();
        assert!(is_interrupted(&err));
    }
}
