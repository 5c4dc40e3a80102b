//! UCI protocol state machine.

use std::collections::HashMap;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::warn;

use crate::analysis::{self, Analysis, AnalysisSink, StopSignal};
use crate::board::{Board, Color, EngineMove};
use crate::command::{CommandFuture, Flow};
use crate::engine::{CommandRequest, Dialect, Io};
use crate::error::EngineError;
use crate::info::{Info, InfoSelector, Opponent, PlayResult};
use crate::limit::Limit;
use crate::option::{chain_config, is_managed, EngineOption, OptionMap, OptionValue};
use crate::Result;

pub(crate) mod parse;

use parse::next_token;

pub(crate) struct UciProtocol<B: Board> {
    initialized: bool,
    options: OptionMap<EngineOption>,
    config: OptionMap<OptionValue>,
    target_config: OptionMap<OptionValue>,
    id: HashMap<String, String>,
    /// Stack-less shadow of the position the engine was last pointed at.
    board: Option<B>,
    game: Option<u64>,
    first_game: bool,
    /// Board a follow-up play request may convert into a ponderhit.
    may_ponderhit: Option<B>,
    /// The next play command starts with `ponderhit` instead of a search.
    ponderhit: bool,
}

impl<B: Board> UciProtocol<B> {
    pub fn new() -> UciProtocol<B> {
        UciProtocol {
            initialized: false,
            options: OptionMap::new(),
            config: OptionMap::new(),
            target_config: OptionMap::new(),
            id: HashMap::new(),
            board: None,
            game: None,
            first_game: true,
            may_ponderhit: None,
            ponderhit: false,
        }
    }

    fn isready(&self, io: &mut Io) {
        io.send_line("isready");
    }

    // UCI_Opponent is stashed and only transmitted right after ucinewgame.
    fn opponent_info(&self, io: &mut Io) {
        let value = self
            .config
            .get("UCI_Opponent")
            .or_else(|| self.target_config.get("UCI_Opponent"));
        if let Some(OptionValue::Str(opponent)) = value {
            if !opponent.is_empty() {
                io.send_line(format!("setoption name UCI_Opponent value {opponent}"));
            }
        }
    }

    fn ucinewgame(&mut self, io: &mut Io) {
        io.send_line("ucinewgame");
        self.opponent_info(io);
        self.first_game = false;
        self.ponderhit = false;
    }

    fn setoption(&mut self, io: &mut Io, name: &str, value: OptionValue) -> Result<()> {
        let option = self.options.get(name).ok_or_else(|| EngineError::UnknownOption {
            name: name.to_string(),
            available: self.options.keys_joined(),
        })?;
        let value = option.parse(&value)?;

        if matches!(value, OptionValue::None) || self.config.get(name) != Some(&value) {
            let mut line = format!("setoption name {name}");
            if !matches!(value, OptionValue::None) {
                line.push_str(&format!(" value {value}"));
            }
            if !name.eq_ignore_ascii_case("uci_opponent") {
                io.send_line(line);
            }
            self.config.insert(name, value);
        }
        Ok(())
    }

    fn apply_configure(&mut self, io: &mut Io, options: &[(String, OptionValue)]) -> Result<()> {
        let merged = chain_config(options, &self.target_config);
        for (name, value) in merged {
            if is_managed(&name) {
                return Err(EngineError::ManagedOption(name));
            }
            self.setoption(io, &name, value)?;
        }
        Ok(())
    }

    fn changed_options(&self, options: &[(String, OptionValue)]) -> bool {
        chain_config(options, &self.target_config)
            .iter()
            .any(|(name, value)| {
                matches!(value, OptionValue::None) || self.config.get(name) != Some(value)
            })
    }

    fn opponent_configuration(&self, opponent: Option<&Opponent>) -> Vec<(String, OptionValue)> {
        let Some(opponent) = opponent else {
            return Vec::new();
        };
        let Some(name) = opponent.name.as_deref().filter(|name| !name.is_empty()) else {
            return Vec::new();
        };
        if !self.options.contains("UCI_Opponent") {
            return Vec::new();
        }
        let rating = opponent
            .rating
            .map(|rating| rating.to_string())
            .unwrap_or_else(|| "none".to_string());
        let title = opponent
            .title
            .clone()
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| "none".to_string());
        let player = if opponent.is_engine { "computer" } else { "human" };
        vec![(
            "UCI_Opponent".to_string(),
            OptionValue::Str(format!("{title} {rating} {player} {name}")),
        )]
    }

    fn position(&mut self, io: &mut Io, board: &B) {
        let safe_history = board.move_stack().iter().all(|mv| !mv.is_null());
        let root = if safe_history { board.root() } else { board.clone() };
        let fen = root.fen();

        let mut line = String::from("position");
        if fen == B::startpos_fen() {
            line.push_str(" startpos");
        } else {
            line.push_str(" fen ");
            line.push_str(&fen);
        }

        if !safe_history {
            warn!("Not transmitting history with null moves to UCI engine");
        } else if !board.move_stack().is_empty() {
            line.push_str(" moves");
            for mv in board.move_stack() {
                line.push(' ');
                line.push_str(&mv.uci());
            }
        }

        io.send_line(line);
        self.board = Some(board.without_stack());
    }

    fn go(
        &self,
        io: &mut Io,
        limit: &Limit,
        root_moves: Option<&[B::Move]>,
        ponder: bool,
        infinite: bool,
    ) {
        let mut line = String::from("go");
        if ponder {
            line.push_str(" ponder");
        }
        if let Some(clock) = limit.red_clock {
            line.push_str(&format!(" wtime {}", clock.as_millis().max(1)));
        }
        if let Some(clock) = limit.black_clock {
            line.push_str(&format!(" btime {}", clock.as_millis().max(1)));
        }
        if let Some(inc) = limit.red_inc {
            line.push_str(&format!(" winc {}", inc.as_millis()));
        }
        if let Some(inc) = limit.black_inc {
            line.push_str(&format!(" binc {}", inc.as_millis()));
        }
        if let Some(moves) = limit.remaining_moves {
            if moves > 0 {
                line.push_str(&format!(" movestogo {moves}"));
            }
        }
        if let Some(depth) = limit.depth {
            line.push_str(&format!(" depth {}", depth.max(1)));
        }
        if let Some(nodes) = limit.nodes {
            line.push_str(&format!(" nodes {}", nodes.max(1)));
        }
        if let Some(mate) = limit.mate {
            line.push_str(&format!(" mate {}", mate.max(1)));
        }
        if let Some(time) = limit.time {
            line.push_str(&format!(" movetime {}", time.as_millis().max(1)));
        }
        if infinite {
            line.push_str(" infinite");
        }
        if let Some(moves) = root_moves {
            line.push_str(" searchmoves");
            if moves.is_empty() {
                // Work around searchmoves followed by nothing.
                line.push_str(" 0000");
            } else {
                for mv in moves {
                    line.push(' ');
                    line.push_str(&mv.uci());
                }
            }
        }
        io.send_line(line);
    }

    fn shadow(&self, fallback: &B) -> B {
        match &self.board {
            Some(board) => board.clone(),
            None => fallback.without_stack(),
        }
    }

    fn start_search(&mut self, play: &mut UciPlay<B>, io: &mut Io) {
        play.sent_isready = false;
        self.position(io, &play.board);
        self.go(io, &play.limit, play.root_moves.as_deref(), false, false);
    }

    fn play_line(&mut self, play: &mut UciPlay<B>, io: &mut Io, line: &str) -> Result<Flow> {
        let (token, remaining) = next_token(line);
        match token {
            "info" => {
                if play.pondering.is_none() {
                    if let Some(board) = &self.board {
                        play.info.merge(parse::parse_info(remaining, board, play.selector));
                    }
                }
                Ok(Flow::Continue)
            }
            "bestmove" => self.play_bestmove(play, io, remaining),
            "readyok" if play.sent_isready && remaining.is_empty() => {
                self.start_search(play, io);
                Ok(Flow::Continue)
            }
            _ => {
                warn!("Unexpected engine output: {line:?}");
                Ok(Flow::Continue)
            }
        }
    }

    fn play_bestmove(&mut self, play: &mut UciPlay<B>, io: &mut Io, arg: &str) -> Result<Flow> {
        if play.pondering.take().is_some() {
            // The background search ended; its move is discarded.
        } else if !play.stopped {
            let shadow = self.shadow(&play.board);
            let best = parse::parse_bestmove(&shadow, arg)?;
            let info = std::mem::take(&mut play.info);
            play.result.resolve(PlayResult {
                mov: best.mov.clone(),
                ponder: best.ponder.clone(),
                info,
                draw_offered: false,
                resigned: false,
            });

            if play.ponder {
                if let (Some(mv), Some(reply)) = (best.mov, best.ponder) {
                    let mut pondering = play.board.clone();
                    pondering.push(mv);
                    pondering.push(reply);
                    self.position(io, &pondering);

                    // Charge the time already spent to the side the engine
                    // now ponders for.
                    let elapsed = play.started_at.map(|at| at.elapsed()).unwrap_or_default();
                    let mut ponder_limit = play.limit.clone();
                    if let Some(clock) = ponder_limit.red_clock {
                        let mut clock = clock + ponder_limit.red_inc.unwrap_or_default();
                        if pondering.turn() == Color::Red {
                            clock = clock.saturating_sub(elapsed);
                        }
                        ponder_limit.red_clock = Some(clock);
                    }
                    if let Some(clock) = ponder_limit.black_clock {
                        let mut clock = clock + ponder_limit.black_inc.unwrap_or_default();
                        if pondering.turn() == Color::Black {
                            clock = clock.saturating_sub(elapsed);
                        }
                        ponder_limit.black_clock = Some(clock);
                    }
                    if let Some(moves) = ponder_limit.remaining_moves {
                        ponder_limit.remaining_moves = Some(moves.saturating_sub(1));
                    }

                    self.go(io, &ponder_limit, None, true, false);
                    play.pondering = Some(pondering);
                }
            }
        }

        if play.pondering.is_none() {
            self.may_ponderhit = None;
            Ok(Flow::Finished)
        } else {
            Ok(Flow::Continue)
        }
    }

    fn analysis_line(
        &mut self,
        analysis: &mut UciAnalysis<B>,
        io: &mut Io,
        line: &str,
    ) -> Result<Flow> {
        let (token, remaining) = next_token(line);
        match token {
            "info" => {
                if let Some(board) = &self.board {
                    analysis
                        .sink
                        .post(parse::parse_info(remaining, board, analysis.selector));
                }
                Ok(Flow::Continue)
            }
            "bestmove" => {
                if analysis.result.is_pending() {
                    return Err(EngineError::Protocol(
                        "was not searching, but engine sent bestmove".to_string(),
                    ));
                }
                let shadow = self.shadow(&analysis.board);
                let best = parse::parse_bestmove(&shadow, remaining)?;
                analysis.sink.finish(best);
                Ok(Flow::Finished)
            }
            "readyok" if analysis.sent_isready && remaining.is_empty() => {
                self.start_analysis(analysis, io);
                Ok(Flow::Continue)
            }
            _ => {
                warn!("Unexpected engine output: {line:?}");
                Ok(Flow::Continue)
            }
        }
    }

    fn start_analysis(&mut self, analysis: &mut UciAnalysis<B>, io: &mut Io) {
        analysis.sent_isready = false;
        self.position(io, &analysis.board);
        match &analysis.limit {
            Some(limit) => self.go(io, limit, analysis.root_moves.as_deref(), false, false),
            None => self.go(io, &Limit::default(), analysis.root_moves.as_deref(), false, true),
        }
        if let Some(handle) = analysis.handle.take() {
            analysis.result.resolve(handle);
        }
    }
}

pub(crate) struct UciPlay<B: Board> {
    result: CommandFuture<PlayResult<B::Move>>,
    board: B,
    limit: Limit,
    game: Option<u64>,
    selector: InfoSelector,
    ponder: bool,
    root_moves: Option<Vec<B::Move>>,
    new_options: Vec<(String, OptionValue)>,
    info: Info<B::Move>,
    pondering: Option<B>,
    sent_isready: bool,
    stopped: bool,
    started_at: Option<Instant>,
}

pub(crate) struct UciAnalysis<B: Board> {
    result: CommandFuture<Analysis<B::Move>>,
    board: B,
    limit: Option<Limit>,
    game: Option<u64>,
    selector: InfoSelector,
    multipv: Option<u32>,
    root_moves: Option<Vec<B::Move>>,
    options: Vec<(String, OptionValue)>,
    sink: AnalysisSink<B::Move>,
    handle: Option<Analysis<B::Move>>,
    sent_isready: bool,
}

pub(crate) enum UciCommand<B: Board> {
    Initialize(CommandFuture<()>),
    Ping(CommandFuture<()>),
    Configure {
        options: Vec<(String, OptionValue)>,
        result: CommandFuture<()>,
    },
    Resolved(CommandFuture<()>),
    Play(Box<UciPlay<B>>),
    Analysis(Box<UciAnalysis<B>>),
}

impl<B: Board> Dialect<B> for UciProtocol<B> {
    type Command = UciCommand<B>;

    fn shortcut(&mut self, req: CommandRequest<B>) -> Option<CommandRequest<B>> {
        match req {
            // UCI engines do not expect end-of-game information.
            CommandRequest::GameResult { respond, .. } => {
                let _ = respond.send(Ok(()));
                None
            }
            other => Some(other),
        }
    }

    fn debug(&mut self, io: &mut Io, on: bool) -> Result<()> {
        io.send_line(if on { "debug on" } else { "debug off" });
        Ok(())
    }

    fn create(
        &mut self,
        req: CommandRequest<B>,
        id: u64,
        cancel: mpsc::UnboundedSender<u64>,
    ) -> UciCommand<B> {
        match req {
            CommandRequest::Initialize(respond) => UciCommand::Initialize(CommandFuture::new(respond)),
            CommandRequest::Ping(respond) => UciCommand::Ping(CommandFuture::new(respond)),
            CommandRequest::Configure { options, respond } => UciCommand::Configure {
                options,
                result: CommandFuture::new(respond),
            },
            CommandRequest::SendOpponent { opponent, respond, .. } => UciCommand::Configure {
                options: self.opponent_configuration(opponent.as_ref()),
                result: CommandFuture::new(respond),
            },
            CommandRequest::GameResult { respond, .. } => {
                UciCommand::Resolved(CommandFuture::new(respond))
            }
            CommandRequest::Play { board, limit, opts, respond } => {
                let mut new_options = opts.options;
                new_options.extend(self.opponent_configuration(opts.opponent.as_ref()));

                // A later play on the predicted continuation may turn into a
                // ponderhit, but only in the same game with settled options.
                self.may_ponderhit = if opts.ponder
                    && !self.first_game
                    && self.game == opts.game
                    && !self.changed_options(&new_options)
                {
                    Some(board.clone())
                } else {
                    None
                };

                UciCommand::Play(Box::new(UciPlay {
                    result: CommandFuture::new(respond),
                    board,
                    limit,
                    game: opts.game,
                    selector: opts.selector,
                    ponder: opts.ponder,
                    root_moves: opts.root_moves,
                    new_options,
                    info: Info::default(),
                    pondering: None,
                    sent_isready: false,
                    stopped: false,
                    started_at: None,
                }))
            }
            CommandRequest::Analysis { board, limit, opts, respond } => {
                let (sink, handle) = analysis::channel(StopSignal { id, tx: cancel });
                UciCommand::Analysis(Box::new(UciAnalysis {
                    result: CommandFuture::new(respond),
                    board,
                    limit,
                    game: opts.game,
                    selector: opts.selector,
                    multipv: opts.multipv,
                    root_moves: opts.root_moves,
                    options: opts.options,
                    sink,
                    handle: Some(handle),
                    sent_isready: false,
                }))
            }
        }
    }

    fn start(&mut self, cmd: &mut UciCommand<B>, io: &mut Io) -> Result<Flow> {
        if !self.initialized && !matches!(cmd, UciCommand::Initialize(_)) {
            return Err(EngineError::NotInitialized);
        }
        match cmd {
            UciCommand::Initialize(_) => {
                if self.initialized {
                    return Err(EngineError::AlreadyInitialized);
                }
                io.send_line("uci");
                Ok(Flow::Continue)
            }
            UciCommand::Ping(_) => {
                self.isready(io);
                Ok(Flow::Continue)
            }
            UciCommand::Configure { options, result } => {
                let options = std::mem::take(options);
                self.apply_configure(io, &options)?;
                for (name, value) in options {
                    if !matches!(value, OptionValue::None) {
                        self.target_config.insert(name, value);
                    }
                }
                result.resolve(());
                Ok(Flow::Finished)
            }
            UciCommand::Resolved(result) => {
                result.resolve(());
                Ok(Flow::Finished)
            }
            UciCommand::Play(play) => {
                play.started_at = Some(Instant::now());

                if self.ponderhit {
                    self.ponderhit = false;
                    io.send_line("ponderhit");
                    return Ok(Flow::Continue);
                }

                if self.options.contains("UCI_AnalyseMode")
                    && !self.target_config.contains("UCI_AnalyseMode")
                    && play
                        .new_options
                        .iter()
                        .all(|(name, _)| !name.eq_ignore_ascii_case("uci_analysemode"))
                {
                    self.setoption(io, "UCI_AnalyseMode", OptionValue::Bool(false))?;
                }
                if self.options.contains("Ponder") {
                    self.setoption(io, "Ponder", OptionValue::Bool(play.ponder))?;
                }
                if self.options.contains("MultiPV") {
                    let default = self
                        .options
                        .get("MultiPV")
                        .map(|option| option.default.clone())
                        .unwrap_or(OptionValue::None);
                    self.setoption(io, "MultiPV", default)?;
                }

                let new_opponent = play
                    .new_options
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("uci_opponent"))
                    .map(|(_, value)| value.clone())
                    .or_else(|| self.target_config.get("UCI_Opponent").cloned());
                let opponent_changed = new_opponent.as_ref() != self.config.get("UCI_Opponent");

                let new_options = std::mem::take(&mut play.new_options);
                self.apply_configure(io, &new_options)?;
                play.new_options = new_options;

                if self.first_game || self.game != play.game || opponent_changed {
                    self.game = play.game;
                    self.ucinewgame(io);
                    play.sent_isready = true;
                    self.isready(io);
                } else {
                    self.start_search(play, io);
                }
                Ok(Flow::Continue)
            }
            UciCommand::Analysis(analysis) => {
                if self.options.contains("Ponder") {
                    self.setoption(io, "Ponder", OptionValue::Bool(false))?;
                }
                if self.options.contains("UCI_AnalyseMode")
                    && !self.target_config.contains("UCI_AnalyseMode")
                    && analysis
                        .options
                        .iter()
                        .all(|(name, _)| !name.eq_ignore_ascii_case("uci_analysemode"))
                {
                    self.setoption(io, "UCI_AnalyseMode", OptionValue::Bool(true))?;
                }
                if self.options.contains("MultiPV") || analysis.multipv.is_some_and(|n| n > 1) {
                    let multipv = analysis.multipv.unwrap_or(1);
                    self.setoption(io, "MultiPV", OptionValue::Int(i64::from(multipv)))?;
                }

                let options = std::mem::take(&mut analysis.options);
                self.apply_configure(io, &options)?;
                analysis.options = options;

                if self.first_game || self.game != analysis.game {
                    self.game = analysis.game;
                    self.ucinewgame(io);
                    analysis.sent_isready = true;
                    self.isready(io);
                } else {
                    self.start_analysis(analysis, io);
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn line(&mut self, cmd: &mut UciCommand<B>, io: &mut Io, line: &str) -> Result<Flow> {
        match cmd {
            UciCommand::Initialize(result) => {
                let (token, remaining) = next_token(line);
                if line.trim() == "uciok" {
                    if result.is_pending() {
                        self.initialized = true;
                        result.resolve(());
                    }
                    return Ok(Flow::Finished);
                } else if token == "option" {
                    let option = parse::parse_option(remaining)?;
                    if !matches!(option.default, OptionValue::None) {
                        self.config.insert(option.name.clone(), option.default.clone());
                        if !option.is_managed()
                            && !option.name.eq_ignore_ascii_case("uci_analysemode")
                        {
                            self.target_config
                                .insert(option.name.clone(), option.default.clone());
                        }
                    }
                    self.options.insert(option.name.clone(), option);
                } else if token == "id" {
                    let (key, value) = next_token(remaining);
                    if !key.is_empty() {
                        self.id.insert(key.to_string(), value.trim().to_string());
                    }
                }
                Ok(Flow::Continue)
            }
            UciCommand::Ping(result) => {
                if line.trim() == "readyok" {
                    result.resolve(());
                    Ok(Flow::Finished)
                } else {
                    warn!("Unexpected engine output: {line:?}");
                    Ok(Flow::Continue)
                }
            }
            UciCommand::Configure { .. } | UciCommand::Resolved(_) => Ok(Flow::Continue),
            UciCommand::Play(play) => self.play_line(play, io, line),
            UciCommand::Analysis(analysis) => self.analysis_line(analysis, io, line),
        }
    }

    fn cancel(&mut self, cmd: &mut UciCommand<B>, io: &mut Io) -> Flow {
        match cmd {
            UciCommand::Play(play) => {
                let hit = match (&self.may_ponderhit, &play.pondering) {
                    (Some(target), Some(pondering)) => {
                        target.move_stack() == pondering.move_stack() && target == pondering
                    }
                    _ => false,
                };
                if hit {
                    self.ponderhit = true;
                    self.may_ponderhit = None;
                    Flow::Finished
                } else {
                    play.stopped = true;
                    io.send_line("stop");
                    Flow::Continue
                }
            }
            UciCommand::Analysis(_) => {
                io.send_line("stop");
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn deadline(&mut self, _cmd: &mut UciCommand<B>, _io: &mut Io) -> Flow {
        Flow::Continue
    }

    fn terminated(&mut self, cmd: &mut UciCommand<B>, err: EngineError) {
        match cmd {
            UciCommand::Play(play) => {
                // An engine dying while it merely ponders is not an error.
                if play.result.is_pending() {
                    play.result.fail(err);
                }
            }
            UciCommand::Analysis(analysis) => {
                if analysis.result.is_pending() {
                    analysis.result.fail(err.clone());
                }
                analysis.sink.fail(err);
            }
            UciCommand::Initialize(result)
            | UciCommand::Ping(result)
            | UciCommand::Configure { result, .. }
            | UciCommand::Resolved(result) => result.fail(err),
        }
    }

    fn result_pending(cmd: &UciCommand<B>) -> bool {
        match cmd {
            UciCommand::Initialize(result)
            | UciCommand::Ping(result)
            | UciCommand::Configure { result, .. }
            | UciCommand::Resolved(result) => result.is_pending(),
            UciCommand::Play(play) => play.result.is_pending(),
            UciCommand::Analysis(analysis) => analysis.result.is_pending(),
        }
    }

    fn poll_result_closed(cmd: &mut UciCommand<B>, cx: &mut Context<'_>) -> Poll<()> {
        match cmd {
            UciCommand::Initialize(result)
            | UciCommand::Ping(result)
            | UciCommand::Configure { result, .. }
            | UciCommand::Resolved(result) => result.poll_closed(cx),
            UciCommand::Play(play) => play.result.poll_closed(cx),
            UciCommand::Analysis(analysis) => analysis.result.poll_closed(cx),
        }
    }

    fn fail(cmd: &mut UciCommand<B>, err: EngineError) {
        match cmd {
            UciCommand::Initialize(result)
            | UciCommand::Ping(result)
            | UciCommand::Configure { result, .. }
            | UciCommand::Resolved(result) => result.fail(err),
            UciCommand::Play(play) => play.result.fail(err),
            UciCommand::Analysis(analysis) => {
                if analysis.result.is_pending() {
                    analysis.result.fail(err);
                } else {
                    analysis.sink.fail(err);
                }
            }
        }
    }

    fn conclude(cmd: &mut UciCommand<B>) {
        match cmd {
            UciCommand::Initialize(result)
            | UciCommand::Ping(result)
            | UciCommand::Configure { result, .. }
            | UciCommand::Resolved(result) => result.abandon(),
            UciCommand::Play(play) => play.result.abandon(),
            UciCommand::Analysis(analysis) => analysis.result.abandon(),
        }
    }

    fn options_snapshot(&self) -> OptionMap<EngineOption> {
        self.options.clone()
    }

    fn id_snapshot(&self) -> HashMap<String, String> {
        self.id.clone()
    }
}
