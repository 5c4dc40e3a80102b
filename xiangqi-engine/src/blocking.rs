//! Synchronous facade over the async driver.
//!
//! Runs the driver on a dedicated background runtime thread and bridges
//! every call by submitting a future with an optional overall timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use derivative::Derivative;
use tokio::runtime;
use tokio::sync::Notify;
use tracing::warn;

use crate::analysis::Analysis;
use crate::board::{Board, Color};
use crate::config::EngineConfig;
use crate::engine::{AnalysisOptions, Engine, PlayOptions};
use crate::error::EngineError;
use crate::info::{BestMove, Info, Opponent, PlayResult};
use crate::limit::Limit;
use crate::option::{EngineOption, OptionMap, OptionValue};
use crate::transport::Transport;
use crate::Result;

/// Default per-call timeout of the blocking facade.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

struct Shutdown {
    flag: Mutex<bool>,
    notify: Notify,
}

/// Blocking wrapper around [`Engine`], safe to call from multiple threads
/// as long as the inputs of a single call are not mutated concurrently.
///
/// Every call is bounded by the configured timeout (`None` disables it);
/// play and analyse additionally get the limit's search time on top. An
/// expired timer cancels the in-flight command and surfaces
/// [`EngineError::Timeout`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BlockingEngine<B: Board> {
    engine: Engine<B>,
    #[derivative(Debug = "ignore")]
    handle: runtime::Handle,
    timeout: Option<Duration>,
    #[derivative(Debug = "ignore")]
    shutdown: Arc<Shutdown>,
    #[derivative(Debug = "ignore")]
    thread: Option<JoinHandle<()>>,
}

impl<B: Board> BlockingEngine<B> {
    /// Spawns and initializes a UCI engine process.
    pub fn popen_uci(config: &EngineConfig, timeout: Option<Duration>) -> Result<BlockingEngine<B>> {
        let config = config.clone();
        Self::bootstrap(timeout, move || async move { Engine::popen_uci(&config).await })
    }

    /// Spawns and initializes an XBoard engine process.
    pub fn popen_xboard(
        config: &EngineConfig,
        timeout: Option<Duration>,
    ) -> Result<BlockingEngine<B>> {
        let config = config.clone();
        Self::bootstrap(timeout, move || async move { Engine::popen_xboard(&config).await })
    }

    /// Drives a UCI engine over a custom transport.
    pub fn new_uci<T: Transport>(transport: T, timeout: Option<Duration>) -> Result<BlockingEngine<B>> {
        Self::bootstrap(timeout, move || async move {
            let engine = Engine::new_uci(transport).await;
            engine.initialize().await?;
            Ok(engine)
        })
    }

    /// Drives an XBoard engine over a custom transport.
    pub fn new_xboard<T: Transport>(
        transport: T,
        timeout: Option<Duration>,
    ) -> Result<BlockingEngine<B>> {
        Self::bootstrap(timeout, move || async move {
            let engine = Engine::new_xboard(transport).await;
            engine.initialize().await?;
            Ok(engine)
        })
    }

    fn bootstrap<F, Fut>(timeout: Option<Duration>, init: F) -> Result<BlockingEngine<B>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Engine<B>>>,
    {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(EngineError::from)?;
        let handle = rt.handle().clone();
        let shutdown = Arc::new(Shutdown {
            flag: Mutex::new(false),
            notify: Notify::new(),
        });

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let background = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("xiangqi-engine".to_string())
            .spawn(move || {
                rt.block_on(async move {
                    let outcome = match timeout {
                        Some(timeout) => match tokio::time::timeout(timeout, init()).await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(EngineError::Timeout),
                        },
                        None => init().await,
                    };
                    match outcome {
                        Ok(engine) => {
                            let _ = ready_tx.send(Ok(engine));
                            // Keep the loop alive for submitted calls.
                            background.notify.notified().await;
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                        }
                    }
                });
            })
            .map_err(EngineError::from)?;

        let engine = match ready_rx.recv() {
            Ok(Ok(engine)) => engine,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(EngineError::Shutdown);
            }
        };

        Ok(BlockingEngine {
            engine,
            handle,
            timeout,
            shutdown,
            thread: Some(thread),
        })
    }

    fn submit<T, Fut>(&self, timeout: Option<Duration>, fut: Fut) -> Result<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let task = {
            let flag = lock_flag(&self.shutdown.flag);
            if *flag {
                return Err(EngineError::Shutdown);
            }
            self.handle.spawn(async move {
                match timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(EngineError::Timeout),
                    },
                    None => fut.await,
                }
            })
        };
        match futures::executor::block_on(task) {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::Shutdown),
        }
    }

    fn timeout_for(&self, limit: &Limit) -> Option<Duration> {
        match (self.timeout, limit.time) {
            (Some(timeout), Some(time)) => Some(timeout + time),
            _ => None,
        }
    }

    /// Pings the engine and waits for the response.
    pub fn ping(&self) -> Result<()> {
        let engine = self.engine.clone();
        self.submit(self.timeout, async move { engine.ping().await })
    }

    /// Configures global engine options.
    pub fn configure(&self, options: impl IntoIterator<Item = (String, OptionValue)>) -> Result<()> {
        let options: Vec<_> = options.into_iter().collect();
        let engine = self.engine.clone();
        self.submit(self.timeout, async move { engine.configure(options).await })
    }

    /// Sends the engine information about its opponent.
    pub fn send_opponent_information(
        &self,
        opponent: Option<Opponent>,
        engine_rating: Option<u32>,
    ) -> Result<()> {
        let engine = self.engine.clone();
        self.submit(self.timeout, async move {
            engine.send_opponent_information(opponent, engine_rating).await
        })
    }

    /// Plays a position, blocking until the engine commits to a move.
    pub fn play(
        &self,
        board: &B,
        limit: Limit,
        opts: PlayOptions<B::Move>,
    ) -> Result<PlayResult<B::Move>> {
        let engine = self.engine.clone();
        let board = board.clone();
        let timeout = self.timeout_for(&limit);
        self.submit(timeout, async move { engine.play(&board, limit, opts).await })
    }

    /// Analyses a position to completion.
    pub fn analyse(
        &self,
        board: &B,
        limit: Limit,
        opts: AnalysisOptions<B::Move>,
    ) -> Result<Vec<Info<B::Move>>> {
        let engine = self.engine.clone();
        let board = board.clone();
        let timeout = self.timeout_for(&limit);
        self.submit(timeout, async move { engine.analyse(&board, limit, opts).await })
    }

    /// Starts an analysis and returns a blocking streaming handle. The
    /// timeout only covers starting the analysis.
    pub fn analysis(
        &self,
        board: &B,
        limit: Option<Limit>,
        opts: AnalysisOptions<B::Move>,
    ) -> Result<BlockingAnalysis<B::Move>> {
        let engine = self.engine.clone();
        let board = board.clone();
        let inner = self.submit(self.timeout, async move {
            engine.analysis(&board, limit, opts).await
        })?;
        Ok(BlockingAnalysis { inner })
    }

    /// Reports the game result to the engine.
    pub fn send_game_result(
        &self,
        board: &B,
        winner: Option<Color>,
        ending: Option<String>,
        complete: bool,
    ) -> Result<()> {
        let engine = self.engine.clone();
        let board = board.clone();
        self.submit(self.timeout, async move {
            engine.send_game_result(&board, winner, ending, complete).await
        })
    }

    /// Switches the engine's debug mode on or off.
    pub fn set_debug(&self, on: bool) -> Result<()> {
        let engine = self.engine.clone();
        self.submit(self.timeout, async move { engine.set_debug(on).await })
    }

    /// Asks the engine process to shut down and waits for it to exit.
    pub fn quit(&self) -> Result<()> {
        let engine = self.engine.clone();
        self.submit(self.timeout, async move { engine.quit().await })
    }

    /// Snapshot of the options the engine declared during initialization.
    pub fn options(&self) -> Result<OptionMap<EngineOption>> {
        let engine = self.engine.clone();
        self.submit(self.timeout, async move { engine.options().await })
    }

    /// Snapshot of the engine's identification.
    pub fn id(&self) -> Result<HashMap<String, String>> {
        let engine = self.engine.clone();
        self.submit(self.timeout, async move { engine.id().await })
    }

    pub fn pid(&self) -> u32 {
        self.engine.pid()
    }

    /// Exit code of the engine process, if it has exited.
    pub fn returncode(&self) -> Option<i32> {
        self.engine.returncode()
    }

    /// Shuts down the background event loop (and with it the engine
    /// process) as soon as possible. Idempotent; later calls fail with
    /// [`EngineError::Shutdown`].
    pub fn close(&self) {
        let mut flag = lock_flag(&self.shutdown.flag);
        if !*flag {
            *flag = true;
            self.shutdown.notify.notify_one();
        }
    }
}

impl<B: Board> Drop for BlockingEngine<B> {
    fn drop(&mut self) {
        self.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Engine event loop thread panicked");
            }
        }
    }
}

/// Blocking wrapper around [`Analysis`]; also usable as an [`Iterator`]
/// over the streamed info records.
#[derive(Debug)]
pub struct BlockingAnalysis<M: crate::board::EngineMove> {
    inner: Analysis<M>,
}

impl<M: crate::board::EngineMove> BlockingAnalysis<M> {
    /// Aggregated information for the mainline.
    pub fn info(&self) -> Info<M> {
        self.inner.info()
    }

    /// Aggregated information per root move.
    pub fn multipv(&self) -> Vec<Info<M>> {
        self.inner.multipv()
    }

    /// Asks the engine to stop the analysis as soon as possible.
    pub fn stop(&mut self) {
        self.inner.stop();
    }

    /// Blocks until the analysis is finished and returns the best move.
    pub fn wait(&mut self) -> Result<BestMove<M>> {
        futures::executor::block_on(self.inner.wait())
    }

    /// Blocks for the next info record.
    pub fn get(&mut self) -> Result<Info<M>> {
        futures::executor::block_on(self.inner.get())
    }

    /// Like [`BlockingAnalysis::get`], but signals the end of the analysis
    /// with `None`.
    pub fn next_info(&mut self) -> Result<Option<Info<M>>> {
        futures::executor::block_on(self.inner.next_info())
    }

    /// Whether reading the next record would block.
    pub fn would_block(&mut self) -> bool {
        self.inner.would_block()
    }

    /// Whether all currently available information has been consumed.
    pub fn empty(&mut self) -> bool {
        self.inner.empty()
    }
}

impl<M: crate::board::EngineMove> Iterator for BlockingAnalysis<M> {
    type Item = Info<M>;

    fn next(&mut self) -> Option<Info<M>> {
        self.next_info().ok().flatten()
    }
}

fn lock_flag(flag: &Mutex<bool>) -> std::sync::MutexGuard<'_, bool> {
    match flag.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
