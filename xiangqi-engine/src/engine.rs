//! Asynchronous engine handle and the per-engine driver task.
//!
//! One driver task owns the transport and all protocol state. Requests
//! arrive over a channel from cloneable [`Engine`] handles; at most one
//! command drives the engine at a time, a newly submitted command preempts
//! at most the single pending one, and cancellation is signalled by
//! dropping the caller's future.

use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use derivative::Derivative;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Sleep;
use tracing::{debug, instrument, trace, warn};

use crate::analysis::Analysis;
use crate::board::{Board, Color};
use crate::command::{CommandState, Flow};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::info::{Info, InfoSelector, Opponent, PlayResult};
use crate::limit::Limit;
use crate::option::{EngineOption, OptionMap, OptionValue};
use crate::transport::{ChildTransport, Transport, TransportEvent};
use crate::uci::UciProtocol;
use crate::xboard::XBoardProtocol;
use crate::Result;

/// Per-call parameters of a play request.
#[derive(Debug, Clone)]
pub struct PlayOptions<M> {
    /// Opaque game identity; a change triggers new-game handling.
    pub game: Option<u64>,
    /// Which information to parse while the engine thinks.
    pub selector: InfoSelector,
    /// Let the engine keep searching on the expected reply afterwards.
    pub ponder: bool,
    /// Whether the opponent offered a draw. Ignored by UCI engines.
    pub draw_offered: bool,
    /// Consider only these root moves.
    pub root_moves: Option<Vec<M>>,
    /// Option overrides for this call only.
    pub options: Vec<(String, OptionValue)>,
    /// Opponent information for this call only.
    pub opponent: Option<Opponent>,
}

impl<M> Default for PlayOptions<M> {
    fn default() -> Self {
        PlayOptions {
            game: None,
            selector: InfoSelector::NONE,
            ponder: false,
            draw_offered: false,
            root_moves: None,
            options: Vec::new(),
            opponent: None,
        }
    }
}

/// Per-call parameters of an analysis request.
#[derive(Debug, Clone)]
pub struct AnalysisOptions<M> {
    /// Analyse the top N root moves simultaneously.
    pub multipv: Option<u32>,
    /// Opaque game identity; a change triggers new-game handling.
    pub game: Option<u64>,
    /// Which information to parse.
    pub selector: InfoSelector,
    /// Limit the analysis to these root moves.
    pub root_moves: Option<Vec<M>>,
    /// Option overrides for this call only.
    pub options: Vec<(String, OptionValue)>,
}

impl<M> Default for AnalysisOptions<M> {
    fn default() -> Self {
        AnalysisOptions {
            multipv: None,
            game: None,
            selector: InfoSelector::ALL,
            root_moves: None,
            options: Vec::new(),
        }
    }
}

pub(crate) type Respond<T> = oneshot::Sender<Result<T>>;

/// A request that is scheduled as a protocol command.
pub(crate) enum CommandRequest<B: Board> {
    Initialize(Respond<()>),
    Ping(Respond<()>),
    Configure {
        options: Vec<(String, OptionValue)>,
        respond: Respond<()>,
    },
    SendOpponent {
        opponent: Option<Opponent>,
        engine_rating: Option<u32>,
        respond: Respond<()>,
    },
    Play {
        board: B,
        limit: Limit,
        opts: PlayOptions<B::Move>,
        respond: Respond<PlayResult<B::Move>>,
    },
    Analysis {
        board: B,
        limit: Option<Limit>,
        opts: AnalysisOptions<B::Move>,
        respond: Respond<Analysis<B::Move>>,
    },
    GameResult {
        board: B,
        winner: Option<Color>,
        ending: Option<String>,
        complete: bool,
        respond: Respond<()>,
    },
}

pub(crate) enum Request<B: Board> {
    Command(CommandRequest<B>),
    Quit(Respond<()>),
    Debug { on: bool, respond: Respond<()> },
    Options(Respond<OptionMap<EngineOption>>),
    Id(Respond<HashMap<String, String>>),
}

/// Outgoing lines and timer instructions gathered while a command handler
/// runs; applied by the driver afterwards.
pub(crate) struct Io {
    out: Vec<String>,
    timer: TimerOp,
}

enum TimerOp {
    Keep,
    Set(Duration),
    Clear,
}

impl Io {
    fn new() -> Io {
        Io {
            out: Vec::new(),
            timer: TimerOp::Keep,
        }
    }

    pub fn send_line(&mut self, line: impl Into<String>) {
        self.out.push(line.into());
    }

    pub fn set_timer(&mut self, after: Duration) {
        self.timer = TimerOp::Set(after);
    }

    pub fn clear_timer(&mut self) {
        self.timer = TimerOp::Clear;
    }
}

/// Dialect-specific half of the driver: creates commands for requests and
/// steps their state machines.
pub(crate) trait Dialect<B: Board>: Send + 'static {
    type Command: Send;

    /// Satisfies a request without scheduling a command, or hands it back.
    fn shortcut(&mut self, req: CommandRequest<B>) -> Option<CommandRequest<B>> {
        Some(req)
    }

    /// Toggles the engine's debug mode, if the dialect has one.
    fn debug(&mut self, io: &mut Io, on: bool) -> Result<()>;

    /// Builds the command for a request. Runs at submission time, before
    /// any preemption of the running command.
    fn create(&mut self, req: CommandRequest<B>, id: u64, cancel: mpsc::UnboundedSender<u64>) -> Self::Command;

    fn start(&mut self, cmd: &mut Self::Command, io: &mut Io) -> Result<Flow>;

    fn line(&mut self, cmd: &mut Self::Command, io: &mut Io, line: &str) -> Result<Flow>;

    /// The command is being cancelled; emit the dialect's stop bytes.
    fn cancel(&mut self, cmd: &mut Self::Command, io: &mut Io) -> Flow;

    /// The driver's deadline timer fired for this command.
    fn deadline(&mut self, cmd: &mut Self::Command, io: &mut Io) -> Flow;

    /// The engine process exited while this command was running.
    fn terminated(&mut self, cmd: &mut Self::Command, err: EngineError);

    /// Whether the command's result has not been delivered yet.
    fn result_pending(cmd: &Self::Command) -> bool;

    /// Ready when the caller abandoned the pending result.
    fn poll_result_closed(cmd: &mut Self::Command, cx: &mut Context<'_>) -> Poll<()>;

    /// Fails the command's result (or logs, if already delivered).
    fn fail(cmd: &mut Self::Command, err: EngineError);

    /// Final bookkeeping when the command is disposed of.
    fn conclude(cmd: &mut Self::Command);

    fn options_snapshot(&self) -> OptionMap<EngineOption>;

    fn id_snapshot(&self) -> HashMap<String, String>;
}

/// Asynchronous handle to an engine. Cheap to clone; all clones talk to the
/// same driver task.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Engine<B: Board> {
    #[derivative(Debug = "ignore")]
    tx: mpsc::UnboundedSender<Request<B>>,
    pid: u32,
    #[derivative(Debug = "ignore")]
    exit: watch::Receiver<Option<i32>>,
}

impl<B: Board> Clone for Engine<B> {
    fn clone(&self) -> Self {
        Engine {
            tx: self.tx.clone(),
            pid: self.pid,
            exit: self.exit.clone(),
        }
    }
}

impl<B: Board> Engine<B> {
    /// Starts a driver for a UCI engine over the given transport. The engine
    /// still needs [`Engine::initialize`].
    pub async fn new_uci<T: Transport>(transport: T) -> Engine<B> {
        Self::start(UciProtocol::new(), transport)
    }

    /// Starts a driver for an XBoard engine over the given transport. The
    /// engine still needs [`Engine::initialize`].
    pub async fn new_xboard<T: Transport>(transport: T) -> Engine<B> {
        Self::start(XBoardProtocol::new(), transport)
    }

    /// Spawns and initializes a UCI engine process.
    #[instrument(skip(config), err)]
    pub async fn popen_uci(config: &EngineConfig) -> Result<Engine<B>> {
        let transport = ChildTransport::spawn(config)?;
        let engine = Self::new_uci(transport).await;
        engine.initialize().await?;
        engine.apply_config(config).await;
        Ok(engine)
    }

    /// Spawns and initializes an XBoard engine process.
    #[instrument(skip(config), err)]
    pub async fn popen_xboard(config: &EngineConfig) -> Result<Engine<B>> {
        let transport = ChildTransport::spawn(config)?;
        let engine = Self::new_xboard(transport).await;
        engine.initialize().await?;
        engine.apply_config(config).await;
        Ok(engine)
    }

    fn start<D, T>(dialect: D, transport: T) -> Engine<B>
    where
        D: Dialect<B>,
        T: Transport,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let pid = transport.pid();

        let driver = Driver {
            dialect,
            transport,
            rx,
            cancel_tx,
            cancel_rx,
            current: None,
            next: None,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            deadline: None,
            exit: None,
            exit_tx,
            quit_waiters: Vec::new(),
            seq: 0,
            hangup: false,
        };
        tokio::spawn(driver.run());
        debug!(pid, "Engine driver started");

        Engine { tx, pid, exit: exit_rx }
    }

    async fn apply_config(&self, config: &EngineConfig) {
        if config.debug {
            trace!("Enabling debug engine mode");
            if let Err(err) = self.set_debug(true).await {
                warn!(%err, "While setting engine debug mode");
            }
        }
        for (option, value) in &config.options {
            let assignment = [(option.clone(), OptionValue::Str(value.clone()))];
            if let Err(err) = self.configure(assignment).await {
                warn!(%err, "While setting engine option");
            }
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Respond<T>) -> Request<B>) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .map_err(|_| EngineError::Shutdown)?;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::Cancelled),
        }
    }

    /// Performs the dialect's initialization handshake. Fails when invoked
    /// more than once.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> Result<()> {
        self.request(|tx| Request::Command(CommandRequest::Initialize(tx))).await
    }

    /// Pings the engine and waits for the response, ensuring it is alive
    /// and idle.
    #[instrument(skip(self), err)]
    pub async fn ping(&self) -> Result<()> {
        self.request(|tx| Request::Command(CommandRequest::Ping(tx))).await
    }

    /// Configures global engine options. Managed options are rejected.
    #[instrument(skip(self, options), err)]
    pub async fn configure(
        &self,
        options: impl IntoIterator<Item = (String, OptionValue)>,
    ) -> Result<()> {
        let options: Vec<_> = options.into_iter().collect();
        self.request(|tx| {
            Request::Command(CommandRequest::Configure { options, respond: tx })
        })
        .await
    }

    /// Sends the engine information about its opponent; call before the
    /// first move of a game.
    #[instrument(skip(self, opponent), err)]
    pub async fn send_opponent_information(
        &self,
        opponent: Option<Opponent>,
        engine_rating: Option<u32>,
    ) -> Result<()> {
        self.request(|tx| {
            Request::Command(CommandRequest::SendOpponent {
                opponent,
                engine_rating,
                respond: tx,
            })
        })
        .await
    }

    /// Plays a position: the entire move stack is sent to the engine, which
    /// searches under `limit` and commits to a move.
    #[instrument(skip(self, board, opts), err)]
    pub async fn play(
        &self,
        board: &B,
        limit: Limit,
        opts: PlayOptions<B::Move>,
    ) -> Result<PlayResult<B::Move>> {
        let board = board.clone();
        self.request(|tx| {
            Request::Command(CommandRequest::Play {
                board,
                limit,
                opts,
                respond: tx,
            })
        })
        .await
    }

    /// Starts analysing a position, streaming results through the returned
    /// handle until stopped or until `limit` is reached.
    #[instrument(skip(self, board, opts), err)]
    pub async fn analysis(
        &self,
        board: &B,
        limit: Option<Limit>,
        opts: AnalysisOptions<B::Move>,
    ) -> Result<Analysis<B::Move>> {
        let board = board.clone();
        self.request(|tx| {
            Request::Command(CommandRequest::Analysis {
                board,
                limit,
                opts,
                respond: tx,
            })
        })
        .await
    }

    /// Analyses a position to completion and returns the aggregated
    /// information, one entry per multipv index.
    #[instrument(skip(self, board, opts), err)]
    pub async fn analyse(
        &self,
        board: &B,
        limit: Limit,
        opts: AnalysisOptions<B::Move>,
    ) -> Result<Vec<Info<B::Move>>> {
        let mut analysis = self.analysis(board, Some(limit), opts).await?;
        analysis.wait().await?;
        Ok(analysis.multipv())
    }

    /// Reports the game result to the engine. XBoard engines receive the
    /// final moves and a `result` line; UCI engines are sent nothing.
    #[instrument(skip(self, board, ending), err)]
    pub async fn send_game_result(
        &self,
        board: &B,
        winner: Option<Color>,
        ending: Option<String>,
        complete: bool,
    ) -> Result<()> {
        let board = board.clone();
        self.request(|tx| {
            Request::Command(CommandRequest::GameResult {
                board,
                winner,
                ending,
                complete,
                respond: tx,
            })
        })
        .await
    }

    /// Switches the engine's debug mode without interrupting other ongoing
    /// operations. Only supported by UCI engines.
    pub async fn set_debug(&self, on: bool) -> Result<()> {
        self.request(|tx| Request::Debug { on, respond: tx }).await
    }

    /// Asks the engine process to shut down and waits for it to exit.
    #[instrument(skip(self), err)]
    pub async fn quit(&self) -> Result<()> {
        self.request(Request::Quit).await
    }

    /// Snapshot of the options the engine declared during initialization.
    pub async fn options(&self) -> Result<OptionMap<EngineOption>> {
        self.request(Request::Options).await
    }

    /// Snapshot of the engine's identification, commonly `name` and
    /// `author`.
    pub async fn id(&self) -> Result<HashMap<String, String>> {
        self.request(Request::Id).await
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit code of the engine process, if it has exited.
    pub fn returncode(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Waits for the engine process to exit and returns the exit code.
    pub async fn wait_exit(&self) -> Result<i32> {
        let mut exit = self.exit.clone();
        let code = exit
            .wait_for(|code| code.is_some())
            .await
            .map_err(|_| EngineError::Shutdown)?;
        code.ok_or(EngineError::Shutdown)
    }
}

struct Active<C> {
    id: u64,
    state: CommandState,
    cmd: C,
}

struct Pending<C> {
    id: u64,
    state: CommandState,
    cmd: C,
}

enum Wake<B: Board> {
    Request(Option<Request<B>>),
    Cancel(Option<u64>),
    Event(TransportEvent),
    Abandoned,
    Deadline,
}

struct Driver<B: Board, D: Dialect<B>, T: Transport> {
    dialect: D,
    transport: T,
    rx: mpsc::UnboundedReceiver<Request<B>>,
    cancel_tx: mpsc::UnboundedSender<u64>,
    cancel_rx: mpsc::UnboundedReceiver<u64>,
    current: Option<Active<D::Command>>,
    next: Option<Pending<D::Command>>,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    deadline: Option<Pin<Box<Sleep>>>,
    exit: Option<i32>,
    exit_tx: watch::Sender<Option<i32>>,
    quit_waiters: Vec<Respond<()>>,
    seq: u64,
    hangup: bool,
}

impl<B, D, T> Driver<B, D, T>
where
    B: Board,
    D: Dialect<B>,
    T: Transport,
{
    async fn run(mut self) {
        loop {
            if self.hangup && self.current.is_none() && self.next.is_none() {
                break;
            }
            let hangup = self.hangup;
            let alive = self.exit.is_none();

            let wake: Wake<B> = {
                let rx = &mut self.rx;
                let cancel_rx = &mut self.cancel_rx;
                let transport = &mut self.transport;
                let current = &mut self.current;
                let deadline = &mut self.deadline;
                tokio::select! {
                    biased;
                    req = rx.recv(), if !hangup => Wake::Request(req),
                    id = cancel_rx.recv() => Wake::Cancel(id),
                    ev = transport.recv(), if alive => Wake::Event(ev),
                    _ = poll_fn(|cx| match current.as_mut() {
                        Some(active) if active.state == CommandState::Active => {
                            D::poll_result_closed(&mut active.cmd, cx)
                        }
                        _ => Poll::Pending,
                    }) => Wake::Abandoned,
                    _ = poll_fn(|cx| match deadline.as_mut() {
                        Some(sleep) => sleep.as_mut().poll(cx),
                        None => Poll::Pending,
                    }) => Wake::Deadline,
                }
            };

            match wake {
                Wake::Request(None) => self.hangup = true,
                Wake::Request(Some(req)) => self.handle_request(req).await,
                Wake::Cancel(id) => {
                    if let Some(id) = id {
                        if self.current.as_ref().map(|active| active.id) == Some(id) {
                            self.cancel_current().await;
                        }
                    }
                }
                Wake::Event(TransportEvent::Stdout(bytes)) => self.pump_stdout(bytes).await,
                Wake::Event(TransportEvent::Stderr(bytes)) => self.pump_stderr(bytes),
                Wake::Event(TransportEvent::Exited(code)) => self.handle_exit(code),
                Wake::Abandoned => self.cancel_current().await,
                Wake::Deadline => {
                    self.deadline = None;
                    self.fire_deadline().await;
                }
            }
        }
        debug!("Engine driver finished");
    }

    async fn handle_request(&mut self, req: Request<B>) {
        let req = match req {
            Request::Quit(respond) => {
                if self.exit.is_some() {
                    let _ = respond.send(Ok(()));
                } else {
                    self.send_raw("quit").await;
                    self.quit_waiters.push(respond);
                }
                return;
            }
            Request::Debug { on, respond } => {
                let mut io = Io::new();
                let outcome = self.dialect.debug(&mut io, on);
                self.flush(io).await;
                let _ = respond.send(outcome);
                return;
            }
            Request::Options(respond) => {
                let _ = respond.send(Ok(self.dialect.options_snapshot()));
                return;
            }
            Request::Id(respond) => {
                let _ = respond.send(Ok(self.dialect.id_snapshot()));
                return;
            }
            Request::Command(req) => req,
        };

        let Some(req) = self.dialect.shortcut(req) else {
            return;
        };

        self.seq += 1;
        let id = self.seq;
        let mut cmd = self.dialect.create(req, id, self.cancel_tx.clone());

        if let Some(code) = self.exit {
            D::fail(&mut cmd, EngineError::terminated(code));
            return;
        }

        // A queued command that never started is displaced outright; its
        // caller observes the dropped result channel.
        self.next = Some(Pending {
            id,
            state: CommandState::New,
            cmd,
        });

        if self.current.is_none() {
            self.advance(false).await;
        } else {
            self.cancel_current().await;
        }
    }

    async fn cancel_current(&mut self) {
        let mut io = Io::new();
        let flow = match self.current.as_mut() {
            Some(active) if active.state == CommandState::Active => {
                active.state = CommandState::Cancelling;
                let flow = self.dialect.cancel(&mut active.cmd, &mut io);
                // The caller no longer gets a result; the command keeps
                // parsing until the engine acknowledges the stop.
                if D::result_pending(&active.cmd) {
                    D::fail(&mut active.cmd, EngineError::Cancelled);
                }
                Some(flow)
            }
            _ => None,
        };
        self.flush(io).await;
        if flow == Some(Flow::Finished) {
            self.advance(true).await;
        }
    }

    async fn fire_deadline(&mut self) {
        let mut io = Io::new();
        let flow = match self.current.as_mut() {
            Some(active) => Some(self.dialect.deadline(&mut active.cmd, &mut io)),
            None => None,
        };
        self.flush(io).await;
        if flow == Some(Flow::Finished) {
            self.advance(true).await;
        }
    }

    async fn pump_stdout(&mut self, bytes: Vec<u8>) {
        self.stdout_buf.extend_from_slice(&bytes);
        while let Some(line) = take_line(&mut self.stdout_buf) {
            match line {
                Ok(line) => self.feed_line(line).await,
                Err(bytes) => warn!(?bytes, "Engine sent invalid utf-8"),
            }
        }
    }

    fn pump_stderr(&mut self, bytes: Vec<u8>) {
        self.stderr_buf.extend_from_slice(&bytes);
        while let Some(line) = take_line(&mut self.stderr_buf) {
            match line {
                Ok(line) => warn!(err = %line, "Engine stderr"),
                Err(bytes) => warn!(?bytes, "Engine sent invalid utf-8 on stderr"),
            }
        }
    }

    async fn feed_line(&mut self, line: String) {
        trace!(">> {line}");
        let mut io = Io::new();
        let outcome = match self.current.as_mut() {
            Some(active)
                if active.state == CommandState::Active
                    || active.state == CommandState::Cancelling =>
            {
                Some(self.dialect.line(&mut active.cmd, &mut io, &line))
            }
            _ => None,
        };
        self.flush(io).await;
        match outcome {
            Some(Ok(Flow::Continue)) | None => {}
            Some(Ok(Flow::Finished)) => self.advance(true).await,
            Some(Err(err)) => {
                if let Some(active) = self.current.as_mut() {
                    D::fail(&mut active.cmd, err);
                }
                self.advance(true).await;
            }
        }
    }

    /// Disposes of the current command (if asked) and starts queued
    /// commands until one keeps running.
    async fn advance(&mut self, finish_current: bool) {
        if finish_current {
            if let Some(mut active) = self.current.take() {
                active.state = CommandState::Done;
                D::conclude(&mut active.cmd);
            }
            self.deadline = None;
        }
        if self.current.is_some() {
            return;
        }
        loop {
            let Some(pending) = self.next.take() else {
                return;
            };
            debug_assert_eq!(pending.state, CommandState::New);
            let mut active = Active {
                id: pending.id,
                state: CommandState::Active,
                cmd: pending.cmd,
            };
            let mut io = Io::new();
            let outcome = self.dialect.start(&mut active.cmd, &mut io);
            self.flush(io).await;
            match outcome {
                Ok(Flow::Continue) => {
                    self.current = Some(active);
                    return;
                }
                Ok(Flow::Finished) => {
                    active.state = CommandState::Done;
                    D::conclude(&mut active.cmd);
                    self.deadline = None;
                }
                Err(err) => {
                    D::fail(&mut active.cmd, err);
                    D::conclude(&mut active.cmd);
                    self.deadline = None;
                }
            }
        }
    }

    fn handle_exit(&mut self, code: i32) {
        debug!(code, "Engine process exited");
        self.exit = Some(code);
        let _ = self.exit_tx.send(Some(code));
        self.stdout_buf.clear();
        self.stderr_buf.clear();

        for waiter in self.quit_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        let err = EngineError::terminated(code);
        if let Some(mut pending) = self.next.take() {
            D::fail(&mut pending.cmd, err.clone());
        }
        if let Some(active) = self.current.as_mut() {
            self.dialect.terminated(&mut active.cmd, err);
        }
        if let Some(mut active) = self.current.take() {
            active.state = CommandState::Done;
            D::conclude(&mut active.cmd);
        }
        self.deadline = None;
    }

    async fn send_raw(&mut self, line: &str) {
        trace!("<< {line}");
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        if let Err(err) = self.transport.write(&data).await {
            warn!(%err, "Failed writing to engine");
        }
    }

    async fn flush(&mut self, io: Io) {
        for line in io.out {
            self.send_raw(&line).await;
        }
        match io.timer {
            TimerOp::Keep => {}
            TimerOp::Clear => self.deadline = None,
            TimerOp::Set(after) => {
                self.deadline = Some(Box::pin(tokio::time::sleep(after)));
            }
        }
    }
}

/// Splits one LF-terminated line off the front of `buf`, stripping an
/// optional trailing CR. Invalid utf-8 yields the raw bytes instead.
fn take_line(buf: &mut Vec<u8>) -> Option<std::result::Result<String, Vec<u8>>> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line_bytes: Vec<u8> = buf.drain(..=pos).collect();
    line_bytes.pop();
    if line_bytes.last() == Some(&b'\r') {
        line_bytes.pop();
    }
    match String::from_utf8(line_bytes) {
        Ok(line) => Some(Ok(line)),
        Err(err) => Some(Err(err.into_bytes())),
    }
}
