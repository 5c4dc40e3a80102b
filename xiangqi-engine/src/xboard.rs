//! XBoard (CECP) protocol state machine.

use std::collections::HashMap;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::analysis::{self, Analysis, AnalysisSink, StopSignal};
use crate::board::{Board, Color, EngineMove, Termination};
use crate::command::{CommandFuture, Flow};
use crate::engine::{CommandRequest, Dialect, Io};
use crate::error::EngineError;
use crate::info::{Info, InfoSelector, Opponent, PlayResult};
use crate::limit::Limit;
use crate::option::{chain_config, is_managed, EngineOption, OptionKind, OptionMap, OptionValue};
use crate::score::Score;
use crate::uci::parse::next_token;
use crate::Result;

pub(crate) mod parse;

const INIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Option names applied while announcing a new game rather than through
/// `option` commands.
const GAME_SETUP_OPTIONS: [&str; 5] = [
    "random",
    "computer",
    "name",
    "engine_rating",
    "opponent_rating",
];

#[derive(Debug, Clone)]
enum FeatureValue {
    Int(i64),
    Str(String),
}

pub(crate) struct XBoardProtocol<B: Board> {
    initialized: bool,
    features: HashMap<String, FeatureValue>,
    options: OptionMap<EngineOption>,
    config: OptionMap<OptionValue>,
    target_config: OptionMap<OptionValue>,
    id: HashMap<String, String>,
    /// Shadow of the move stack the engine has been fed.
    board: Option<B>,
    game: Option<u64>,
    clock_id: Option<u64>,
    first_game: bool,
}

impl<B: Board> XBoardProtocol<B> {
    pub fn new() -> XBoardProtocol<B> {
        let mut options = OptionMap::new();
        options.insert(
            "random",
            EngineOption {
                name: "random".to_string(),
                kind: OptionKind::Check,
                default: OptionValue::Bool(false),
                min: None,
                max: None,
                var: vec![],
            },
        );
        options.insert(
            "computer",
            EngineOption {
                name: "computer".to_string(),
                kind: OptionKind::Check,
                default: OptionValue::Bool(false),
                min: None,
                max: None,
                var: vec![],
            },
        );
        options.insert(
            "name",
            EngineOption {
                name: "name".to_string(),
                kind: OptionKind::Str,
                default: OptionValue::Str(String::new()),
                min: None,
                max: None,
                var: vec![],
            },
        );
        options.insert(
            "engine_rating",
            EngineOption {
                name: "engine_rating".to_string(),
                kind: OptionKind::Spin,
                default: OptionValue::Int(0),
                min: None,
                max: None,
                var: vec![],
            },
        );
        options.insert(
            "opponent_rating",
            EngineOption {
                name: "opponent_rating".to_string(),
                kind: OptionKind::Spin,
                default: OptionValue::Int(0),
                min: None,
                max: None,
                var: vec![],
            },
        );

        XBoardProtocol {
            initialized: false,
            features: HashMap::new(),
            options,
            config: OptionMap::new(),
            target_config: OptionMap::new(),
            id: HashMap::new(),
            board: None,
            game: None,
            clock_id: None,
            first_game: true,
        }
    }

    fn feature_truthy(&self, key: &str, default: bool) -> bool {
        match self.features.get(key) {
            None => default,
            Some(FeatureValue::Int(value)) => *value != 0,
            Some(FeatureValue::Str(value)) => !value.is_empty(),
        }
    }

    fn feature_str(&self, key: &str) -> Option<String> {
        match self.features.get(key) {
            None => None,
            Some(FeatureValue::Int(value)) => Some(value.to_string()),
            Some(FeatureValue::Str(value)) => Some(value.clone()),
        }
    }

    fn variant(&self, io: &mut Io, variant: &str) -> Result<()> {
        let supported = self.feature_str("variants").unwrap_or_default();
        let variants: Vec<&str> = supported.split(',').map(str::trim).collect();
        if variant.is_empty() || !variants.contains(&variant) {
            return Err(EngineError::Unsupported(format!(
                "unsupported xboard variant: {variant} (available: {})",
                variants.join(", ")
            )));
        }
        io.send_line(format!("variant {variant}"));
        Ok(())
    }

    fn setoption(&mut self, io: &mut Io, name: &str, value: OptionValue) -> Result<()> {
        if !matches!(value, OptionValue::None) && self.config.get(name) == Some(&value) {
            return Ok(());
        }

        let option = self.options.get(name).ok_or_else(|| EngineError::UnknownOption {
            name: name.to_string(),
            available: self.options.keys_joined(),
        })?;
        let value = option.parse(&value)?;
        self.config.insert(name, value.clone());

        let lower = name.to_ascii_lowercase();
        if GAME_SETUP_OPTIONS.contains(&lower.as_str()) {
            // Applied when the next game is announced.
        } else if lower == "memory" || lower == "cores" || lower.starts_with("egtpath ") {
            io.send_line(format!("{name} {value}"));
        } else {
            match value {
                OptionValue::None => io.send_line(format!("option {name}")),
                OptionValue::Bool(flag) => {
                    io.send_line(format!("option {name}={}", if flag { 1 } else { 0 }))
                }
                other => io.send_line(format!("option {name}={other}")),
            }
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

    fn opponent_configuration(
        &self,
        opponent: Option<&Opponent>,
        engine_rating: Option<u32>,
    ) -> Vec<(String, OptionValue)> {
        let Some(opponent) = opponent else {
            return Vec::new();
        };

        let engine_rating = engine_rating
            .map(|rating| i64::from(rating))
            .unwrap_or_else(|| value_int(self.target_config.get("engine_rating")));
        let mut info = vec![
            ("engine_rating".to_string(), OptionValue::Int(engine_rating)),
            (
                "opponent_rating".to_string(),
                OptionValue::Int(opponent.rating.map(i64::from).unwrap_or(0)),
            ),
            ("computer".to_string(), OptionValue::Bool(opponent.is_engine)),
        ];

        if let Some(name) = opponent.name.as_deref().filter(|name| !name.is_empty()) {
            if self.feature_truthy("name", true) {
                let full = match opponent.title.as_deref().filter(|title| !title.is_empty()) {
                    Some(title) => format!("{title} {name}"),
                    None => name.to_string(),
                };
                info.push(("name".to_string(), OptionValue::Str(full)));
            }
        }
        info
    }

    /// Announces a new game if needed, then synchronizes the engine's move
    /// stack with the host's.
    fn new_game(
        &mut self,
        io: &mut Io,
        board: &B,
        game: Option<u64>,
        options: &[(String, OptionValue)],
        opponent: Option<&Opponent>,
    ) -> Result<()> {
        self.apply_configure(io, options)?;
        let opponent_options = self.opponent_configuration(opponent, None);
        self.apply_configure(io, &opponent_options)?;

        let root = board.root();
        let new_options = options.iter().any(|(name, _)| {
            name.eq_ignore_ascii_case("random") || name.eq_ignore_ascii_case("computer")
        });
        let new_game = self.first_game
            || self.game != game
            || new_options
            || opponent.is_some()
            || self.board.as_ref().map_or(true, |shadow| shadow.root() != root);
        self.game = game;
        self.first_game = false;

        if new_game {
            self.board = Some(root.clone());
            io.send_line("new");

            let variant = B::XBOARD_VARIANT;
            if variant == "normal" && board.cchess960() {
                self.variant(io, "fischerandom")?;
            } else if variant != "normal" {
                self.variant(io, variant)?;
            }

            if value_truthy(self.config.get("random")) {
                io.send_line("random");
            }
            if let Some(OptionValue::Str(name)) = self.config.get("name") {
                if !name.is_empty() && self.feature_truthy("name", true) {
                    io.send_line(format!("name {name}"));
                }
            }
            let engine_rating = value_int(self.config.get("engine_rating"));
            let opponent_rating = value_int(self.config.get("opponent_rating"));
            if engine_rating != 0 || opponent_rating != 0 {
                io.send_line(format!("rating {engine_rating} {opponent_rating}"));
            }
            if value_truthy(self.config.get("computer")) {
                io.send_line("computer");
            }

            io.send_line("force");

            let fen = root.fen();
            if variant != "normal" || fen != B::startpos_fen() || board.cchess960() {
                io.send_line(format!("setboard {fen}"));
            }
        } else {
            io.send_line("force");
        }

        // Undo moves until the longest common history prefix.
        let mut common = 0;
        if !new_game {
            if let Some(shadow) = &self.board {
                for (ours, theirs) in shadow.move_stack().iter().zip(board.move_stack()) {
                    if ours == theirs {
                        common += 1;
                    } else {
                        break;
                    }
                }
            }
            if let Some(shadow) = self.board.as_mut() {
                while shadow.move_stack().len() > common + 1 {
                    io.send_line("remove");
                    shadow.pop();
                    shadow.pop();
                }
                while shadow.move_stack().len() > common {
                    io.send_line("undo");
                    shadow.pop();
                }
            }
        }

        // Play the remaining moves from the host's stack.
        let usermove = self.feature_truthy("usermove", false);
        if let Some(shadow) = self.board.as_mut() {
            for mv in &board.move_stack()[common..] {
                if mv.is_null() {
                    warn!(
                        "Null move (in {}) may not be supported by all XBoard engines",
                        shadow.fen()
                    );
                }
                let text = shadow.xboard(mv);
                if usermove {
                    io.send_line(format!("usermove {text}"));
                } else {
                    io.send_line(text);
                }
                shadow.push(mv.clone());
            }
        }
        Ok(())
    }

    fn handle_features(
        &mut self,
        result: &mut CommandFuture<()>,
        io: &mut Io,
        arg: &str,
    ) -> Flow {
        for token in parse::split_features(arg) {
            let Some((key, value)) = token.split_once('=') else {
                warn!("Malformed feature token: {token:?}");
                continue;
            };
            if key == "option" {
                match parse::parse_feature_option(value) {
                    Ok(option) => {
                        let lower = option.name.to_ascii_lowercase();
                        if !["random", "computer", "cores", "memory"].contains(&lower.as_str()) {
                            self.options.insert(option.name.clone(), option);
                        }
                    }
                    Err(err) => warn!(%err, "Ignoring malformed option feature"),
                }
            } else {
                let value = match value.parse::<i64>() {
                    Ok(number) => FeatureValue::Int(number),
                    Err(_) => FeatureValue::Str(value.to_string()),
                };
                self.features.insert(key.to_string(), value);
            }
        }

        if self.features.contains_key("done") {
            io.clear_timer();
        }
        if self.feature_truthy("done", false) {
            self.finish_init(result, io)
        } else {
            Flow::Continue
        }
    }

    fn finish_init(&mut self, result: &mut CommandFuture<()>, io: &mut Io) -> Flow {
        if !self.feature_truthy("ping", false) {
            result.fail(EngineError::MissingFeature("ping"));
            return Flow::Finished;
        }
        if !self.feature_truthy("setboard", false) {
            result.fail(EngineError::MissingFeature("setboard"));
            return Flow::Finished;
        }

        if !self.feature_truthy("reuse", true) {
            warn!("Rejecting feature reuse=0");
            io.send_line("rejected reuse");
        }
        if !self.feature_truthy("sigterm", true) {
            warn!("Rejecting feature sigterm=0");
            io.send_line("rejected sigterm");
        }
        if self.feature_truthy("san", false) {
            warn!("Rejecting feature san=1");
            io.send_line("rejected san");
        }

        if let Some(myname) = self.feature_str("myname") {
            self.id.insert("name".to_string(), myname);
        }

        if self.feature_truthy("memory", false) {
            self.options.insert(
                "memory",
                EngineOption {
                    name: "memory".to_string(),
                    kind: OptionKind::Spin,
                    default: OptionValue::Int(16),
                    min: Some(1),
                    max: None,
                    var: vec![],
                },
            );
            io.send_line("accepted memory");
        }
        if self.feature_truthy("smp", false) {
            self.options.insert(
                "cores",
                EngineOption {
                    name: "cores".to_string(),
                    kind: OptionKind::Spin,
                    default: OptionValue::Int(1),
                    min: Some(1),
                    max: None,
                    var: vec![],
                },
            );
            io.send_line("accepted smp");
        }
        if let Some(egt) = self.feature_str("egt").filter(|egt| !egt.is_empty()) {
            for kind in egt.split(',') {
                let name = format!("egtpath {}", kind.trim());
                self.options.insert(
                    name.clone(),
                    EngineOption {
                        name,
                        kind: OptionKind::Path,
                        default: OptionValue::None,
                        min: None,
                        max: None,
                        var: vec![],
                    },
                );
            }
            io.send_line("accepted egt");
        }

        let defaults: Vec<(String, OptionValue, bool)> = self
            .options
            .iter()
            .map(|(_, option)| (option.name.clone(), option.default.clone(), option.is_managed()))
            .collect();
        for (name, default, managed) in defaults {
            if !matches!(default, OptionValue::None) {
                self.config.insert(name.clone(), default.clone());
                if !managed {
                    self.target_config.insert(name, default);
                }
            }
        }

        self.initialized = true;
        result.resolve(());
        Flow::Finished
    }

    fn send_time_control(
        &self,
        io: &mut Io,
        limit: &Limit,
        clock: Option<Duration>,
        increment: Option<Duration>,
    ) {
        if limit.remaining_moves.unwrap_or(0) > 0 || clock.is_some() || increment.is_some() {
            let total = clock.unwrap_or_default().as_secs();
            let increment = increment.map(|inc| inc.as_secs_f64()).unwrap_or(0.0);
            io.send_line(format!(
                "level {} {}:{:02} {}",
                limit.remaining_moves.unwrap_or(0),
                total / 60,
                total % 60,
                increment
            ));
        }
        if let Some(time) = limit.time {
            io.send_line(format!("st {}", time.as_secs_f64().max(0.01)));
        }
    }

    fn ping_after_move(&self, play: &mut XBoardPlay<B>, io: &mut Io) {
        if play.pong_after_move.is_none() {
            let nonce = play.id & 0xffff;
            play.pong_after_move = Some(format!("pong {nonce}"));
            io.send_line(format!("ping {nonce}"));
        }
    }

    fn play_move(&mut self, play: &mut XBoardPlay<B>, io: &mut Io, arg: &str) -> Result<Flow> {
        if play.result.is_pending() && play.mov.is_none() {
            let outcome = self.board.as_mut().map(|shadow| shadow.push_xboard(arg));
            match outcome {
                Some(Ok(mv)) => {
                    play.mov = Some(mv);
                    self.ping_after_move(play, io);
                    Ok(Flow::Continue)
                }
                Some(Err(err)) => {
                    self.first_game = true;
                    Err(EngineError::InvalidMove(err.0))
                }
                None => {
                    self.first_game = true;
                    Err(EngineError::Protocol(format!(
                        "engine sent a move before the position was set up: {arg:?}"
                    )))
                }
            }
        } else {
            // The engine repeats or follows up on a move we already
            // accepted, or moves after the result was cancelled; keep the
            // shadow in sync and gate completion through a ping.
            if let Some(shadow) = self.board.as_mut() {
                if let Err(err) = shadow.push_xboard(arg) {
                    error!(%err, "Failed playing unexpected move");
                }
            }
            self.ping_after_move(play, io);
            Ok(Flow::Continue)
        }
    }

    fn play_hint(&mut self, play: &mut XBoardPlay<B>, arg: &str) {
        if play.result.is_pending() && play.mov.is_some() && play.hint.is_none() {
            match self.board.as_ref().map(|shadow| shadow.parse_xboard(arg)) {
                Some(Ok(mv)) => play.hint = Some(mv),
                Some(Err(err)) => error!(%err, "Failed parsing hint"),
                None => {}
            }
        } else {
            warn!("Unexpected hint: {arg:?}");
        }
    }

    fn play_line(&mut self, play: &mut XBoardPlay<B>, io: &mut Io, line: &str) -> Result<Flow> {
        let (token, remaining) = next_token(line);
        match token {
            "move" => self.play_move(play, io, remaining.trim()),
            "Hint:" => {
                self.play_hint(play, remaining.trim());
                Ok(Flow::Continue)
            }
            "pong" => {
                let pong = format!("pong {}", remaining.trim());
                if play.pong_after_move.as_deref() == Some(pong.as_str()) {
                    play.resolve_result();
                    if play.ponder {
                        Ok(Flow::Continue)
                    } else {
                        Ok(Flow::Finished)
                    }
                } else if play.pong_after_ponder.as_deref() == Some(pong.as_str()) {
                    play.resolve_result();
                    Ok(Flow::Finished)
                } else {
                    Ok(Flow::Continue)
                }
            }
            "offer" if remaining.trim() == "draw" => {
                if play.result.is_pending() {
                    play.draw_offered_by_engine = true;
                }
                self.ping_after_move(play, io);
                Ok(Flow::Continue)
            }
            "resign" if remaining.is_empty() => {
                if play.result.is_pending() {
                    play.resigned = true;
                }
                self.ping_after_move(play, io);
                Ok(Flow::Continue)
            }
            "1-0" | "0-1" | "1/2-1/2" => {
                if line.contains("resign") && play.result.is_pending() {
                    play.resigned = true;
                }
                self.ping_after_move(play, io);
                Ok(Flow::Continue)
            }
            comment if comment.starts_with('#') => Ok(Flow::Continue),
            _ if parse::is_error_line(line) => {
                // Board state might no longer be in sync.
                self.first_game = true;
                Err(EngineError::Protocol(line.to_string()))
            }
            _ if parse::is_thinking_line(line) => {
                if play.result.is_pending() {
                    if let Some(shadow) = &self.board {
                        play.info = parse::parse_post(line, shadow, play.selector);
                    }
                }
                Ok(Flow::Continue)
            }
            _ => {
                warn!("Unexpected engine output: {line:?}");
                Ok(Flow::Continue)
            }
        }
    }

    fn stop_analysis(&mut self, analysis: &mut XBoardAnalysis<B>, io: &mut Io) {
        if analysis.stopped {
            return;
        }
        analysis.stopped = true;
        io.send_line(".");
        io.send_line("exit");
        let nonce = analysis.id & 0xffff;
        analysis.final_pong = Some(format!("pong {nonce}"));
        io.send_line(format!("ping {nonce}"));
    }

    fn analysis_post(&mut self, analysis: &mut XBoardAnalysis<B>, io: &mut Io, line: &str) {
        let Some(shadow) = self.board.clone() else {
            return;
        };
        let post = parse::parse_post(line, &shadow, analysis.selector);

        if let Some(mv) = post.pv.as_ref().and_then(|pv| pv.first()) {
            analysis.best = Some(mv.clone());
        }

        let mut should_stop = false;
        if let Some(limit) = &analysis.limit {
            if let Some(cap) = limit.time {
                should_stop = post.time.unwrap_or_default() >= cap;
            } else if let Some(cap) = limit.nodes {
                should_stop = post.nodes.unwrap_or_default() >= cap;
            } else if let Some(cap) = limit.depth {
                should_stop = post.depth.unwrap_or_default() >= cap;
            } else if let Some(cap) = limit.mate {
                if let Some(score) = &post.score {
                    should_stop = score.relative >= Score::Mate(cap as i32);
                }
            }
        }

        analysis.sink.post(post);
        if should_stop {
            self.stop_analysis(analysis, io);
        }
    }

    fn analysis_line(
        &mut self,
        analysis: &mut XBoardAnalysis<B>,
        io: &mut Io,
        line: &str,
    ) -> Result<Flow> {
        let (token, remaining) = next_token(line);
        if token.starts_with('#') {
            return Ok(Flow::Continue);
        }
        if parse::is_thinking_line(line) {
            self.analysis_post(analysis, io, line);
            return Ok(Flow::Continue);
        }
        if token == "pong" {
            let pong = format!("pong {}", remaining.trim());
            if analysis.final_pong.as_deref() == Some(pong.as_str()) {
                analysis.sink.finish(crate::info::BestMove {
                    mov: analysis.best.clone(),
                    ponder: None,
                });
                return Ok(Flow::Finished);
            }
        }
        if parse::is_error_line(line) {
            self.first_game = true;
            return Err(EngineError::Protocol(line.to_string()));
        }
        warn!("Unexpected engine output: {line:?}");
        Ok(Flow::Continue)
    }
}

pub(crate) struct XBoardPlay<B: Board> {
    id: u64,
    result: CommandFuture<PlayResult<B::Move>>,
    board: B,
    limit: Limit,
    game: Option<u64>,
    selector: InfoSelector,
    ponder: bool,
    draw_offered: bool,
    root_moves: Option<Vec<B::Move>>,
    options: Vec<(String, OptionValue)>,
    opponent: Option<Opponent>,
    mov: Option<B::Move>,
    hint: Option<B::Move>,
    info: Info<B::Move>,
    draw_offered_by_engine: bool,
    resigned: bool,
    stopped: bool,
    pong_after_move: Option<String>,
    pong_after_ponder: Option<String>,
}

impl<B: Board> XBoardPlay<B> {
    fn resolve_result(&mut self) {
        if self.result.is_pending() {
            let info = std::mem::take(&mut self.info);
            self.result.resolve(PlayResult {
                mov: self.mov.clone(),
                ponder: self.hint.clone(),
                info,
                draw_offered: self.draw_offered_by_engine,
                resigned: self.resigned,
            });
        }
    }
}

pub(crate) struct XBoardAnalysis<B: Board> {
    id: u64,
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
    best: Option<B::Move>,
    stopped: bool,
    final_pong: Option<String>,
}

pub(crate) struct XBoardGameResult<B: Board> {
    result: CommandFuture<()>,
    board: B,
    winner: Option<Color>,
    ending: Option<String>,
    complete: bool,
}

pub(crate) enum XBoardCommand<B: Board> {
    Initialize(CommandFuture<()>),
    Ping {
        nonce: u64,
        result: CommandFuture<()>,
    },
    Configure {
        options: Vec<(String, OptionValue)>,
        result: CommandFuture<()>,
    },
    GameResult(Box<XBoardGameResult<B>>),
    Play(Box<XBoardPlay<B>>),
    Analysis(Box<XBoardAnalysis<B>>),
}

impl<B: Board> Dialect<B> for XBoardProtocol<B> {
    type Command = XBoardCommand<B>;

    fn debug(&mut self, _io: &mut Io, _on: bool) -> Result<()> {
        Err(EngineError::Unsupported(
            "xboard engines have no debug mode".to_string(),
        ))
    }

    fn create(
        &mut self,
        req: CommandRequest<B>,
        id: u64,
        cancel: mpsc::UnboundedSender<u64>,
    ) -> XBoardCommand<B> {
        match req {
            CommandRequest::Initialize(respond) => {
                XBoardCommand::Initialize(CommandFuture::new(respond))
            }
            CommandRequest::Ping(respond) => XBoardCommand::Ping {
                nonce: id & 0xffff,
                result: CommandFuture::new(respond),
            },
            CommandRequest::Configure { options, respond } => XBoardCommand::Configure {
                options,
                result: CommandFuture::new(respond),
            },
            CommandRequest::SendOpponent {
                opponent,
                engine_rating,
                respond,
            } => XBoardCommand::Configure {
                options: self.opponent_configuration(opponent.as_ref(), engine_rating),
                result: CommandFuture::new(respond),
            },
            CommandRequest::GameResult {
                board,
                winner,
                ending,
                complete,
                respond,
            } => XBoardCommand::GameResult(Box::new(XBoardGameResult {
                result: CommandFuture::new(respond),
                board,
                winner,
                ending,
                complete,
            })),
            CommandRequest::Play {
                board,
                limit,
                opts,
                respond,
            } => XBoardCommand::Play(Box::new(XBoardPlay {
                id,
                result: CommandFuture::new(respond),
                board,
                limit,
                game: opts.game,
                selector: opts.selector,
                ponder: opts.ponder,
                draw_offered: opts.draw_offered,
                root_moves: opts.root_moves,
                options: opts.options,
                opponent: opts.opponent,
                mov: None,
                hint: None,
                info: Info::default(),
                draw_offered_by_engine: false,
                resigned: false,
                stopped: false,
                pong_after_move: None,
                pong_after_ponder: None,
            })),
            CommandRequest::Analysis {
                board,
                limit,
                opts,
                respond,
            } => {
                let (sink, handle) = analysis::channel(StopSignal { id, tx: cancel });
                XBoardCommand::Analysis(Box::new(XBoardAnalysis {
                    id,
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
                    best: None,
                    stopped: false,
                    final_pong: None,
                }))
            }
        }
    }

    fn start(&mut self, cmd: &mut XBoardCommand<B>, io: &mut Io) -> Result<Flow> {
        if !self.initialized && !matches!(cmd, XBoardCommand::Initialize(_)) {
            return Err(EngineError::NotInitialized);
        }
        match cmd {
            XBoardCommand::Initialize(_) => {
                if self.initialized {
                    return Err(EngineError::AlreadyInitialized);
                }
                io.send_line("xboard");
                io.send_line("protover 2");
                io.set_timer(INIT_TIMEOUT);
                Ok(Flow::Continue)
            }
            XBoardCommand::Ping { nonce, .. } => {
                io.send_line(format!("ping {nonce}"));
                Ok(Flow::Continue)
            }
            XBoardCommand::Configure { options, result } => {
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
            XBoardCommand::GameResult(cmd) => {
                if let Some(ending) = &cmd.ending {
                    if ending
                        .chars()
                        .any(|c| matches!(c, '{' | '}' | '\n' | '\r'))
                    {
                        return Err(EngineError::InvalidValue(format!(
                            "invalid line break or curly braces in game ending message: {ending:?}"
                        )));
                    }
                }

                // Bring the engine up to the final position first.
                let game = self.game;
                self.new_game(io, &cmd.board, game, &[], None)?;

                let outcome = cmd.board.outcome(true);
                let (result_token, ending) = if !cmd.complete {
                    ("*", cmd.ending.clone().unwrap_or_default())
                } else if cmd.winner.is_some() || cmd.ending.is_some() {
                    let token = match cmd.winner {
                        Some(Color::Red) => "1-0",
                        Some(Color::Black) => "0-1",
                        None => "1/2-1/2",
                    };
                    (token, cmd.ending.clone().unwrap_or_default())
                } else if let Some(outcome) = outcome {
                    match outcome.winner {
                        Some(winner) => {
                            let color = if winner == Color::Red { "Red" } else { "Black" };
                            let verb = if outcome.termination == Termination::Checkmate {
                                "mates"
                            } else {
                                "variant win"
                            };
                            (outcome.result(), format!("{color} {verb}"))
                        }
                        None => (outcome.result(), outcome.termination.label().to_string()),
                    }
                } else {
                    ("*", String::new())
                };

                if ending.is_empty() {
                    io.send_line(format!("result {result_token}"));
                } else {
                    io.send_line(format!("result {result_token} {{{ending}}}"));
                }
                cmd.result.resolve(());
                Ok(Flow::Finished)
            }
            XBoardCommand::Play(play) => {
                if play.root_moves.is_some() {
                    return Err(EngineError::Unsupported(
                        "play with root_moves, but xboard supports 'include' only in analysis mode"
                            .to_string(),
                    ));
                }

                let board = play.board.clone();
                let options = std::mem::take(&mut play.options);
                self.new_game(io, &board, play.game, &options, play.opponent.as_ref())?;
                play.options = options;

                let turn = play.board.turn();
                let (clock, increment) = match turn {
                    Color::Red => (play.limit.red_clock, play.limit.red_inc),
                    Color::Black => (play.limit.black_clock, play.limit.black_inc),
                };

                if play.limit.clock_id.is_none() || play.limit.clock_id != self.clock_id {
                    self.send_time_control(io, &play.limit, clock, increment);
                }
                self.clock_id = play.limit.clock_id;

                if let Some(nodes) = play.limit.nodes {
                    if play.limit.time.is_some()
                        || play.limit.red_clock.is_some()
                        || play.limit.black_clock.is_some()
                        || increment.is_some()
                    {
                        return Err(EngineError::Unsupported(
                            "xboard does not support mixing node limits with time limits"
                                .to_string(),
                        ));
                    }
                    if !self.features.contains_key("nps") {
                        warn!("Engine did not explicitly declare support for node limits (feature nps=?)");
                    } else if !self.feature_truthy("nps", false) {
                        return Err(EngineError::Unsupported(
                            "xboard engine does not support node limits (feature nps=0)"
                                .to_string(),
                        ));
                    }
                    io.send_line("nps 1");
                    io.send_line(format!("st {}", nodes.max(1)));
                }
                if let Some(depth) = play.limit.depth {
                    io.send_line(format!("sd {}", depth.max(1)));
                }
                if let Some(clock) = play.limit.red_clock {
                    let verb = if turn == Color::Red { "time" } else { "otim" };
                    io.send_line(format!("{verb} {}", centis(clock)));
                }
                if let Some(clock) = play.limit.black_clock {
                    let verb = if turn == Color::Red { "otim" } else { "time" };
                    io.send_line(format!("{verb} {}", centis(clock)));
                }

                if play.draw_offered && self.feature_truthy("draw", true) {
                    io.send_line("draw");
                }

                io.send_line(if play.selector.is_empty() { "nopost" } else { "post" });
                io.send_line(if play.ponder { "hard" } else { "easy" });
                io.send_line("go");
                Ok(Flow::Continue)
            }
            XBoardCommand::Analysis(analysis) => {
                if analysis.multipv.is_some() {
                    return Err(EngineError::Unsupported(
                        "xboard engine does not support multipv".to_string(),
                    ));
                }
                if let Some(limit) = &analysis.limit {
                    if limit.red_clock.is_some() || limit.black_clock.is_some() {
                        return Err(EngineError::Unsupported(
                            "xboard analysis does not support clock limits".to_string(),
                        ));
                    }
                }

                let board = analysis.board.clone();
                let options = std::mem::take(&mut analysis.options);
                self.new_game(io, &board, analysis.game, &options, None)?;
                analysis.options = options;

                if let Some(moves) = &analysis.root_moves {
                    if !self.feature_truthy("exclude", false) {
                        return Err(EngineError::Unsupported(
                            "xboard engine does not support root_moves (feature exclude=0)"
                                .to_string(),
                        ));
                    }
                    io.send_line("exclude all");
                    if let Some(shadow) = &self.board {
                        for mv in moves {
                            io.send_line(format!("include {}", shadow.xboard(mv)));
                        }
                    }
                }

                io.send_line("post");
                io.send_line("analyze");

                if let Some(handle) = analysis.handle.take() {
                    analysis.result.resolve(handle);
                }
                if let Some(time) = analysis.limit.as_ref().and_then(|limit| limit.time) {
                    io.set_timer(time);
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn line(&mut self, cmd: &mut XBoardCommand<B>, io: &mut Io, line: &str) -> Result<Flow> {
        match cmd {
            XBoardCommand::Initialize(result) => {
                let (token, remaining) = next_token(line);
                if token.starts_with('#') {
                    Ok(Flow::Continue)
                } else if token == "feature" {
                    Ok(self.handle_features(result, io, remaining))
                } else if parse::is_error_line(line) {
                    Err(EngineError::Protocol(line.to_string()))
                } else {
                    Ok(Flow::Continue)
                }
            }
            XBoardCommand::Ping { nonce, result } => {
                if line.trim() == format!("pong {nonce}") {
                    result.resolve(());
                    Ok(Flow::Finished)
                } else if parse::is_error_line(line) {
                    Err(EngineError::Protocol(line.to_string()))
                } else if line.starts_with('#') {
                    Ok(Flow::Continue)
                } else {
                    warn!("Unexpected engine output: {line:?}");
                    Ok(Flow::Continue)
                }
            }
            XBoardCommand::Configure { .. } | XBoardCommand::GameResult(_) => Ok(Flow::Continue),
            XBoardCommand::Play(play) => self.play_line(play, io, line),
            XBoardCommand::Analysis(analysis) => self.analysis_line(analysis, io, line),
        }
    }

    fn cancel(&mut self, cmd: &mut XBoardCommand<B>, io: &mut Io) -> Flow {
        match cmd {
            XBoardCommand::Play(play) => {
                if play.stopped {
                    return Flow::Continue;
                }
                play.stopped = true;
                if play.result.is_pending() {
                    io.send_line("?");
                }
                if play.ponder {
                    io.send_line("easy");
                    let nonce = (play.id + 1) & 0xffff;
                    play.pong_after_ponder = Some(format!("pong {nonce}"));
                    io.send_line(format!("ping {nonce}"));
                }
                Flow::Continue
            }
            XBoardCommand::Analysis(analysis) => {
                self.stop_analysis(analysis, io);
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn deadline(&mut self, cmd: &mut XBoardCommand<B>, io: &mut Io) -> Flow {
        match cmd {
            XBoardCommand::Initialize(result) => {
                error!("Timeout during initialization");
                self.finish_init(result, io)
            }
            XBoardCommand::Analysis(analysis) => {
                self.stop_analysis(analysis, io);
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn terminated(&mut self, cmd: &mut XBoardCommand<B>, err: EngineError) {
        match cmd {
            XBoardCommand::Play(play) => {
                if play.result.is_pending() {
                    play.result.fail(err);
                }
            }
            XBoardCommand::Analysis(analysis) => {
                if analysis.result.is_pending() {
                    analysis.result.fail(err.clone());
                }
                analysis.sink.fail(err);
            }
            XBoardCommand::Initialize(result)
            | XBoardCommand::Ping { result, .. }
            | XBoardCommand::Configure { result, .. } => result.fail(err),
            XBoardCommand::GameResult(cmd) => cmd.result.fail(err),
        }
    }

    fn result_pending(cmd: &XBoardCommand<B>) -> bool {
        match cmd {
            XBoardCommand::Initialize(result)
            | XBoardCommand::Ping { result, .. }
            | XBoardCommand::Configure { result, .. } => result.is_pending(),
            XBoardCommand::GameResult(cmd) => cmd.result.is_pending(),
            XBoardCommand::Play(play) => play.result.is_pending(),
            XBoardCommand::Analysis(analysis) => analysis.result.is_pending(),
        }
    }

    fn poll_result_closed(cmd: &mut XBoardCommand<B>, cx: &mut Context<'_>) -> Poll<()> {
        match cmd {
            XBoardCommand::Initialize(result)
            | XBoardCommand::Ping { result, .. }
            | XBoardCommand::Configure { result, .. } => result.poll_closed(cx),
            XBoardCommand::GameResult(cmd) => cmd.result.poll_closed(cx),
            XBoardCommand::Play(play) => play.result.poll_closed(cx),
            XBoardCommand::Analysis(analysis) => analysis.result.poll_closed(cx),
        }
    }

    fn fail(cmd: &mut XBoardCommand<B>, err: EngineError) {
        match cmd {
            XBoardCommand::Initialize(result)
            | XBoardCommand::Ping { result, .. }
            | XBoardCommand::Configure { result, .. } => result.fail(err),
            XBoardCommand::GameResult(cmd) => cmd.result.fail(err),
            XBoardCommand::Play(play) => play.result.fail(err),
            XBoardCommand::Analysis(analysis) => {
                if analysis.result.is_pending() {
                    analysis.result.fail(err);
                } else {
                    analysis.sink.fail(err);
                }
            }
        }
    }

    fn conclude(cmd: &mut XBoardCommand<B>) {
        match cmd {
            XBoardCommand::Initialize(result)
            | XBoardCommand::Ping { result, .. }
            | XBoardCommand::Configure { result, .. } => result.abandon(),
            XBoardCommand::GameResult(cmd) => cmd.result.abandon(),
            XBoardCommand::Play(play) => play.result.abandon(),
            XBoardCommand::Analysis(analysis) => analysis.result.abandon(),
        }
    }

    fn options_snapshot(&self) -> OptionMap<EngineOption> {
        self.options.clone()
    }

    fn id_snapshot(&self) -> HashMap<String, String> {
        self.id.clone()
    }
}

fn centis(clock: Duration) -> u128 {
    (clock.as_millis() / 10).max(1)
}

fn value_truthy(value: Option<&OptionValue>) -> bool {
    match value {
        Some(OptionValue::Bool(flag)) => *flag,
        Some(OptionValue::Int(number)) => *number != 0,
        Some(OptionValue::Str(text)) => !text.is_empty(),
        Some(OptionValue::None) | None => false,
    }
}

fn value_int(value: Option<&OptionValue>) -> i64 {
    match value {
        Some(OptionValue::Int(number)) => *number,
        Some(OptionValue::Bool(true)) => 1,
        _ => 0,
    }
}
