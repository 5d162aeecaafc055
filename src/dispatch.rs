//! Runs one command handler as a task and races it against termination signals.
//!
//! The handler gets a [`CancellationToken`] and reports exactly one outcome
//! through a oneshot channel. If a signal arrives first, the token is
//! cancelled and the dispatcher still waits for that outcome before
//! returning, so the handler is never abandoned mid-flight.

use std::future::Future;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::CcvmError;

type Outcome = Result<(), CcvmError>;

enum Race {
    Finished(Result<Outcome, oneshot::error::RecvError>),
    Signalled,
}

/// Spawn `handler` and wait for its outcome, cancelling it if `termination`
/// resolves first. In that case the result is [`CcvmError::Cancelled`]
/// whatever the handler eventually reported.
pub async fn dispatch<F, Fut, S>(handler: F, termination: S) -> Outcome
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Outcome> + Send + 'static,
    S: Future<Output = ()>,
{
    let cancel = CancellationToken::new();
    let (outcome_tx, mut outcome_rx) = oneshot::channel::<Outcome>();

    let command = handler(cancel.clone());
    let task = tokio::spawn(async move {
        let outcome = command.await;
        // The receiver outlives the task unless the dispatcher itself was dropped.
        let _ = outcome_tx.send(outcome);
    });

    tokio::pin!(termination);
    let race = tokio::select! {
        biased;
        outcome = &mut outcome_rx => Race::Finished(outcome),
        () = &mut termination => Race::Signalled,
    };

    let result = match race {
        Race::Finished(outcome) => unwrap_outcome(outcome),
        Race::Signalled => {
            tracing::info!("termination signal received, cancelling command");
            cancel.cancel();
            match unwrap_outcome(outcome_rx.await) {
                Ok(()) => tracing::debug!("command finished after cancellation"),
                Err(e) => tracing::debug!(error = %e, "command stopped after cancellation"),
            }
            Err(CcvmError::Cancelled)
        }
    };

    if let Err(e) = task.await {
        tracing::error!(error = %e, "command task panicked");
    }
    result
}

fn unwrap_outcome(received: Result<Outcome, oneshot::error::RecvError>) -> Outcome {
    received.unwrap_or_else(|_| {
        Err(CcvmError::Driver {
            message: "command ended without reporting an outcome".into(),
        })
    })
}

/// Resolves on the first SIGINT, SIGTERM or SIGHUP.
///
/// Handlers are registered immediately, so a signal arriving before the
/// future is first polled is not lost.
pub fn termination_signal() -> Result<impl Future<Output = ()> + Send, CcvmError> {
    let register = |kind: SignalKind, name: &str| {
        signal(kind).map_err(|source| CcvmError::Io {
            context: format!("registering {name} handler"),
            source,
        })
    };
    let mut interrupt = register(SignalKind::interrupt(), "SIGINT")?;
    let mut terminate = register(SignalKind::terminate(), "SIGTERM")?;
    let mut hangup = register(SignalKind::hangup(), "SIGHUP")?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = hangup.recv() => {}
        }
    })
}
