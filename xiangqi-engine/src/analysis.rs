//! Streaming handle to an ongoing analysis.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use derivative::Derivative;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::board::EngineMove;
use crate::error::EngineError;
use crate::info::{BestMove, Info};
use crate::Result;

/// Creates the paired driver-side sink and caller-side handle.
pub(crate) fn channel<M: EngineMove>(stop: StopSignal) -> (AnalysisSink<M>, Analysis<M>) {
    let (info_tx, info_rx) = mpsc::unbounded_channel();
    let (finished_tx, finished_rx) = oneshot::channel();
    let multipv = Arc::new(Mutex::new(vec![Info::default()]));
    let sink = AnalysisSink {
        info_tx: Some(info_tx),
        finished_tx: Some(finished_tx),
        multipv: multipv.clone(),
    };
    let handle = Analysis {
        rx: info_rx,
        peek: None,
        closed: false,
        exhausted: false,
        multipv,
        finished_rx: Some(finished_rx),
        finished: None,
        stop: Some(stop),
    };
    (sink, handle)
}

/// Routes a stop request back to the driver's cancel path.
#[derive(Debug)]
pub(crate) struct StopSignal {
    pub id: u64,
    pub tx: mpsc::UnboundedSender<u64>,
}

/// Driver-side half of an analysis: publishes parsed info records and the
/// terminating best move.
#[derive(Debug)]
pub(crate) struct AnalysisSink<M: EngineMove> {
    info_tx: Option<mpsc::UnboundedSender<Info<M>>>,
    finished_tx: Option<oneshot::Sender<Result<BestMove<M>>>>,
    multipv: Arc<Mutex<Vec<Info<M>>>>,
}

impl<M: EngineMove> AnalysisSink<M> {
    /// Publishes one info record: merged into its multipv slot and queued
    /// for the consumer.
    pub fn post(&mut self, info: Info<M>) {
        if info.is_empty() {
            return;
        }
        {
            let mut slots = lock(&self.multipv);
            let index = info.multipv.unwrap_or(1).max(1) as usize;
            while slots.len() < index {
                slots.push(Info::default());
            }
            slots[index - 1].merge(info.clone());
        }
        if let Some(tx) = &self.info_tx {
            let _ = tx.send(info);
        }
    }

    /// Terminates the stream with the final best move. Closing the info
    /// channel is the consumer's end-of-stream sentinel.
    pub fn finish(&mut self, best: BestMove<M>) {
        if let Some(tx) = self.finished_tx.take() {
            let _ = tx.send(Ok(best));
        }
        self.info_tx = None;
    }

    /// Terminates the stream with an error.
    pub fn fail(&mut self, err: EngineError) {
        if let Some(tx) = self.finished_tx.take() {
            let _ = tx.send(Err(err));
        }
        self.info_tx = None;
    }
}

/// Handle to an ongoing analysis.
///
/// Yields [`Info`] records as the engine produces them and terminates with a
/// [`BestMove`]. Also usable as a [`futures::Stream`]. Dropping the handle
/// stops the analysis.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Analysis<M: EngineMove> {
    #[derivative(Debug = "ignore")]
    rx: mpsc::UnboundedReceiver<Info<M>>,
    peek: Option<Info<M>>,
    closed: bool,
    exhausted: bool,
    #[derivative(Debug = "ignore")]
    multipv: Arc<Mutex<Vec<Info<M>>>>,
    #[derivative(Debug = "ignore")]
    finished_rx: Option<oneshot::Receiver<Result<BestMove<M>>>>,
    finished: Option<Result<BestMove<M>>>,
    #[derivative(Debug = "ignore")]
    stop: Option<StopSignal>,
}

impl<M: EngineMove> Analysis<M> {
    /// Aggregated information for the mainline.
    pub fn info(&self) -> Info<M> {
        lock(&self.multipv)
            .first()
            .cloned()
            .unwrap_or_default()
    }

    /// Aggregated information per root move, one entry per multipv index.
    pub fn multipv(&self) -> Vec<Info<M>> {
        lock(&self.multipv).clone()
    }

    /// Asks the engine to stop the analysis as soon as possible. Idempotent;
    /// already queued information stays readable.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.tx.send(stop.id);
        }
    }

    /// Waits until the analysis is finished and returns the best move.
    pub async fn wait(&mut self) -> Result<BestMove<M>> {
        if let Some(rx) = self.finished_rx.take() {
            let outcome = match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(EngineError::Shutdown),
            };
            self.finished = Some(outcome);
        }
        match &self.finished {
            Some(outcome) => outcome.clone(),
            None => Err(EngineError::Shutdown),
        }
    }

    /// Waits for the next info record.
    ///
    /// Fails with [`EngineError::AnalysisComplete`] once the analysis has
    /// ended and everything has been consumed.
    pub async fn get(&mut self) -> Result<Info<M>> {
        if self.exhausted {
            return Err(EngineError::AnalysisComplete);
        }
        if let Some(info) = self.peek.take() {
            return Ok(info);
        }
        match self.rx.recv().await {
            Some(info) => Ok(info),
            None => {
                self.exhausted = true;
                self.wait().await?;
                Err(EngineError::AnalysisComplete)
            }
        }
    }

    /// Like [`Analysis::get`], but signals the end of the analysis with
    /// `None` instead of an error.
    pub async fn next_info(&mut self) -> Result<Option<Info<M>>> {
        match self.get().await {
            Ok(info) => Ok(Some(info)),
            Err(EngineError::AnalysisComplete) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Whether reading the next record would wait for the engine.
    pub fn would_block(&mut self) -> bool {
        self.poke();
        !self.exhausted && self.peek.is_none() && !self.closed
    }

    /// Whether all currently available information has been consumed.
    pub fn empty(&mut self) -> bool {
        self.poke();
        self.peek.is_none()
    }

    fn poke(&mut self) {
        if self.peek.is_none() && !self.exhausted && !self.closed {
            match self.rx.try_recv() {
                Ok(info) => self.peek = Some(info),
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => self.closed = true,
            }
        }
    }
}

impl<M: EngineMove> Stream for Analysis<M> {
    type Item = Info<M>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Info<M>>> {
        let this = self.get_mut();
        if this.exhausted {
            return Poll::Ready(None);
        }
        if let Some(info) = this.peek.take() {
            return Poll::Ready(Some(info));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(info)) => Poll::Ready(Some(info)),
            Poll::Ready(None) => {
                this.exhausted = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<M: EngineMove> Drop for Analysis<M> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<'a, M: EngineMove>(slots: &'a Arc<Mutex<Vec<Info<M>>>>) -> MutexGuard<'a, Vec<Info<M>>> {
    match slots.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::testing::TestMove;

    fn pair() -> (AnalysisSink<TestMove>, Analysis<TestMove>, mpsc::UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (sink, handle) = channel(StopSignal { id: 7, tx });
        (sink, handle, rx)
    }

    fn info_at(depth: u32, multipv: Option<u32>) -> Info<TestMove> {
        Info {
            depth: Some(depth),
            multipv,
            ..Info::default()
        }
    }

    #[tokio::test]
    async fn streams_until_sentinel() {
        let (mut sink, mut handle, _stop_rx) = pair();
        sink.post(info_at(1, None));
        sink.post(info_at(2, None));
        sink.finish(BestMove { mov: None, ponder: None });

        assert_eq!(handle.get().await.map(|i| i.depth), Ok(Some(1)));
        assert_eq!(handle.get().await.map(|i| i.depth), Ok(Some(2)));
        assert!(matches!(handle.get().await, Err(EngineError::AnalysisComplete)));
        assert!(matches!(handle.get().await, Err(EngineError::AnalysisComplete)));
        assert_eq!(handle.wait().await, Ok(BestMove { mov: None, ponder: None }));
    }

    #[tokio::test]
    async fn multipv_slots_extend_and_merge() {
        let (mut sink, handle, _stop_rx) = pair();
        sink.post(info_at(3, Some(1)));
        sink.post(info_at(3, Some(3)));
        sink.post(info_at(5, Some(1)));
        let slots = handle.multipv();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].depth, Some(5));
        assert_eq!(slots[2].depth, Some(3));
        assert_eq!(handle.info().depth, Some(5));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (_sink, mut handle, mut stop_rx) = pair();
        handle.stop();
        handle.stop();
        assert_eq!(stop_rx.recv().await, Some(7));
        assert!(stop_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failure_surfaces_on_get_and_wait() {
        let (mut sink, mut handle, _stop_rx) = pair();
        sink.fail(EngineError::terminated(9));
        assert_eq!(handle.get().await.map(|_| ()), Err(EngineError::terminated(9)));
        assert_eq!(handle.wait().await, Err(EngineError::terminated(9)));
    }

    #[tokio::test]
    async fn would_block_probe() {
        let (mut sink, mut handle, _stop_rx) = pair();
        assert!(handle.would_block());
        assert!(handle.empty());
        sink.post(info_at(1, None));
        assert!(!handle.would_block());
        assert!(!handle.empty());
        assert_eq!(handle.get().await.map(|i| i.depth), Ok(Some(1)));
        sink.finish(BestMove { mov: None, ponder: None });
        assert!(!handle.would_block());
    }
}
