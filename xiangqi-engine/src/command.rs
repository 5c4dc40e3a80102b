//! Shared lifecycle machinery for protocol commands.

use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::warn;

use crate::error::EngineError;
use crate::Result;

/// Lifecycle of a protocol command.
///
/// `New → Active → (Cancelling →)? Done`. A command keeps parsing engine
/// output while `Cancelling` until the engine acknowledges the stop request
/// with its terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandState {
    New,
    Active,
    Cancelling,
    Done,
}

/// What a command handler wants the driver to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Keep feeding lines to this command.
    Continue,
    /// The command is done; promote the pending command, if any.
    Finished,
}

/// The caller-facing result slot of a command.
///
/// The caller holds the receiving end; dropping it is the cancellation
/// signal observed through [`CommandFuture::poll_closed`].
#[derive(Debug)]
pub(crate) struct CommandFuture<T> {
    tx: Option<oneshot::Sender<Result<T>>>,
}

impl<T> CommandFuture<T> {
    pub fn new(tx: oneshot::Sender<Result<T>>) -> CommandFuture<T> {
        CommandFuture { tx: Some(tx) }
    }

    /// Whether the result has not been delivered yet.
    pub fn is_pending(&self) -> bool {
        self.tx.is_some()
    }

    pub fn resolve(&mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(value));
        }
    }

    /// Fails a pending result; a late error after the result was delivered
    /// is only logged.
    pub fn fail(&mut self, err: EngineError) {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(Err(err));
            }
            None => warn!(%err, "Command failed after returning its result"),
        }
    }

    /// Fails a still pending result when a command finishes without one.
    pub fn abandon(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(EngineError::NoResult));
        }
    }

    /// Ready when the caller abandoned the pending result.
    pub fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.tx {
            Some(tx) => tx.poll_closed(cx),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_and_fail() {
        let (tx, rx) = oneshot::channel();
        let mut future = CommandFuture::new(tx);
        assert!(future.is_pending());
        future.resolve(7);
        assert!(!future.is_pending());
        future.fail(EngineError::Timeout);
        assert_eq!(rx.await.ok(), Some(Ok(7)));
    }

    #[tokio::test]
    async fn abandon_fails_pending() {
        let (tx, rx) = oneshot::channel::<Result<()>>();
        let mut future = CommandFuture::new(tx);
        future.abandon();
        assert_eq!(rx.await.ok(), Some(Err(EngineError::NoResult)));
    }

    #[tokio::test]
    async fn poll_closed_fires_on_drop() {
        let (tx, rx) = oneshot::channel::<Result<()>>();
        let mut future = CommandFuture::new(tx);
        drop(rx);
        std::future::poll_fn(|cx| future.poll_closed(cx)).await;
    }
}
