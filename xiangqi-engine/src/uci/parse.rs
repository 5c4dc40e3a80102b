//! Parsers for the UCI wire dialect.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{error, warn};

use crate::board::{Board, EngineMove};
use crate::error::EngineError;
use crate::info::{BestMove, Info, InfoSelector};
use crate::option::{EngineOption, OptionKind, OptionValue};
use crate::score::{PovScore, PovWdl, Score, Wdl};
use crate::Result;

/// Splits the next whitespace-delimited token off a line. Returns two empty
/// strings when the line is exhausted.
pub(crate) fn next_token(line: &str) -> (&str, &str) {
    let line = line.trim_start();
    match line.split_once(char::is_whitespace) {
        Some((token, rest)) => (token, rest.trim_start()),
        None => (line, ""),
    }
}

/// Whether a token looks like a UCI move: a coordinate pair with an optional
/// promotion letter, a drop, or the null move.
pub(crate) fn is_uci_move(token: &str) -> bool {
    if token == "0000" {
        return true;
    }
    let bytes = token.as_bytes();
    let file = |b: u8| (b'a'..=b'i').contains(&b);
    let rank = |b: u8| b.is_ascii_digit();
    match bytes {
        [a, b, c, d] => {
            (file(*a) && rank(*b) && file(*c) && rank(*d))
                || (b"PNBRACK".contains(a) && *b == b'@' && file(*c) && rank(*d))
        }
        [a, b, c, d, promo] => {
            file(*a) && rank(*b) && file(*c) && rank(*d) && b"pnbrack".contains(promo)
        }
        _ => false,
    }
}

/// Parses an `option name ... type ... [default ...] [min ...] [max ...]
/// [var ...]*` declaration. Values between keyword tokens keep their inner
/// whitespace.
pub(crate) fn parse_option(arg: &str) -> Result<EngineOption> {
    const KEYWORDS: [&str; 6] = ["name", "type", "default", "min", "max", "var"];

    fn commit(
        key: Option<&'static str>,
        value: &str,
        fields: &mut HashMap<&'static str, String>,
        var: &mut Vec<String>,
    ) {
        let value = value.trim();
        match key {
            Some("var") => var.push(value.to_string()),
            Some(key) => {
                fields.insert(key, value.to_string());
            }
            None => {}
        }
    }

    let arg = arg.trim();
    let mut fields: HashMap<&'static str, String> = HashMap::new();
    let mut var: Vec<String> = Vec::new();
    let mut current: Option<&'static str> = None;
    let mut value_start = 0;

    for (start, end) in token_spans(arg) {
        let token = &arg[start..end];
        if let Some(keyword) = KEYWORDS.iter().find(|k| **k == token).copied() {
            let fillable =
                keyword == "var" || fields.get(keyword).map_or(true, |filled| filled.is_empty());
            if fillable {
                commit(current, &arg[value_start..start], &mut fields, &mut var);
                current = Some(keyword);
                value_start = end;
            }
        }
    }
    commit(current, &arg[value_start..], &mut fields, &mut var);

    let name = fields.remove("name").unwrap_or_default();
    let kind_name = fields.remove("type").unwrap_or_default();
    let default_text = fields.remove("default").unwrap_or_default();
    let min = parse_bound(fields.get("min"));
    let max = parse_bound(fields.get("max"));

    let kind = OptionKind::from_name(&kind_name)
        .ok_or_else(|| EngineError::UnknownOptionKind(kind_name.clone()))?;

    let skeleton = EngineOption {
        name,
        kind,
        default: OptionValue::None,
        min,
        max,
        var,
    };
    let default = skeleton.parse(&OptionValue::Str(default_text))?;
    Ok(EngineOption { default, ..skeleton })
}

fn parse_bound(text: Option<&String>) -> Option<i64> {
    let text = text?;
    if text.is_empty() {
        return None;
    }
    match text.parse() {
        Ok(number) => Some(number),
        Err(err) => {
            error!(%err, value = %text, "Failed parsing option bound");
            None
        }
    }
}

fn token_spans(s: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in s.char_indices() {
        if c.is_whitespace() {
            if let Some(st) = start.take() {
                spans.push((st, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(st) = start {
        spans.push((st, s.len()));
    }
    spans
}

/// Parses the moves of one variation starting from `root`, stopping at the
/// first token that does not look like a move. Returns the moves and the
/// unparsed remainder.
fn variation_line<'a, B: Board>(root: &B, mut line: &'a str) -> Result<(Vec<B::Move>, &'a str)> {
    let mut board = root.without_stack();
    let mut moves = Vec::new();
    loop {
        let (token, rest) = next_token(line);
        if is_uci_move(token) {
            moves.push(board.push_uci(token)?);
            line = rest;
        } else {
            return Ok((moves, line));
        }
    }
}

/// Parses the arguments of an `info` line relative to the position the
/// engine is analysing.
pub(crate) fn parse_info<B: Board>(arg: &str, root: &B, selector: InfoSelector) -> Info<B::Move> {
    let mut info = Info::default();
    if selector.is_empty() {
        return info;
    }

    let turn = root.turn();
    let mut remaining = arg;
    while !remaining.is_empty() {
        let (parameter, rest) = next_token(remaining);
        remaining = rest;
        match parameter {
            "string" => {
                info.string = Some(remaining.to_string());
                break;
            }
            "depth" | "seldepth" | "multipv" | "currmovenumber" | "hashfull" | "cpuload" => {
                let (number, rest) = next_token(remaining);
                remaining = rest;
                match number.parse::<u32>() {
                    Ok(number) => match parameter {
                        "depth" => info.depth = Some(number),
                        "seldepth" => info.seldepth = Some(number),
                        "multipv" => info.multipv = Some(number),
                        "currmovenumber" => info.currmovenumber = Some(number),
                        "hashfull" => info.hashfull = Some(number),
                        _ => info.cpuload = Some(number),
                    },
                    Err(_) => error!("Failed parsing {parameter} from info: {arg:?}"),
                }
            }
            "nodes" | "nps" | "tbhits" => {
                let (number, rest) = next_token(remaining);
                remaining = rest;
                match number.parse::<u64>() {
                    Ok(number) => match parameter {
                        "nodes" => info.nodes = Some(number),
                        "nps" => info.nps = Some(number),
                        _ => info.tbhits = Some(number),
                    },
                    Err(_) => error!("Failed parsing {parameter} from info: {arg:?}"),
                }
            }
            "time" => {
                let (millis, rest) = next_token(remaining);
                remaining = rest;
                match millis.parse::<u64>() {
                    Ok(millis) => info.time = Some(Duration::from_millis(millis)),
                    Err(_) => error!("Failed parsing time from info: {arg:?}"),
                }
            }
            "ebf" => {
                let (number, rest) = next_token(remaining);
                remaining = rest;
                match number.parse::<f64>() {
                    Ok(number) => info.ebf = Some(number),
                    Err(_) => error!("Failed parsing ebf from info: {arg:?}"),
                }
            }
            "score" if selector.contains(InfoSelector::SCORE) => {
                let (kind, rest) = next_token(remaining);
                let (value, rest) = next_token(rest);
                remaining = rest;
                let (bound, after_bound) = next_token(remaining);
                if bound == "lowerbound" {
                    info.lowerbound = true;
                    remaining = after_bound;
                } else if bound == "upperbound" {
                    info.upperbound = true;
                    remaining = after_bound;
                }
                match (kind, value.parse::<i32>()) {
                    ("cp", Ok(value)) => info.score = Some(PovScore::new(Score::Cp(value), turn)),
                    ("mate", Ok(value)) => info.score = Some(PovScore::new(Score::Mate(value), turn)),
                    (_, Ok(_)) => {
                        error!("Unknown score kind {kind:?} in info (expected cp or mate): {arg:?}")
                    }
                    (_, Err(_)) => error!("Failed parsing score from info: {arg:?}"),
                }
            }
            "currmove" => {
                let (token, rest) = next_token(remaining);
                remaining = rest;
                match B::Move::from_uci(token) {
                    Ok(mv) => info.currmove = Some(mv),
                    Err(err) => error!(%err, "Failed parsing currmove from info: {arg:?}"),
                }
            }
            "currline" if selector.contains(InfoSelector::CURRLINE) => {
                let (cpu, rest) = next_token(remaining);
                remaining = rest;
                match cpu.parse::<u32>() {
                    Ok(cpu) => match variation_line(root, remaining) {
                        Ok((line, rest)) => {
                            remaining = rest;
                            info.currline.get_or_insert_with(HashMap::new).insert(cpu, line);
                        }
                        Err(err) => {
                            error!(%err, "Failed parsing currline from info: {arg:?}");
                        }
                    },
                    Err(_) => error!("Failed parsing currline from info: {arg:?}"),
                }
            }
            "refutation" if selector.contains(InfoSelector::REFUTATION) => {
                let mut board = root.without_stack();
                let (refuted_text, rest) = next_token(remaining);
                remaining = rest;
                match board.push_uci(refuted_text) {
                    Ok(refuted) => match variation_line(&board, remaining) {
                        Ok((refuted_by, rest)) => {
                            remaining = rest;
                            info.refutation
                                .get_or_insert_with(HashMap::new)
                                .insert(refuted, refuted_by);
                        }
                        Err(err) => error!(%err, "Failed parsing refutation from info: {arg:?}"),
                    },
                    Err(err) => error!(%err, "Failed parsing refutation from info: {arg:?}"),
                }
            }
            "pv" if selector.contains(InfoSelector::PV) => match variation_line(root, remaining) {
                Ok((pv, rest)) => {
                    remaining = rest;
                    info.pv = Some(pv);
                }
                Err(err) => error!(%err, "Failed parsing pv from info: {arg:?}"),
            },
            "wdl" => {
                let (wins, rest) = next_token(remaining);
                let (draws, rest) = next_token(rest);
                let (losses, rest) = next_token(rest);
                remaining = rest;
                match (wins.parse(), draws.parse(), losses.parse()) {
                    (Ok(w), Ok(d), Ok(l)) => {
                        info.wdl = Some(PovWdl::new(Wdl::new(w, d, l), turn));
                    }
                    _ => error!("Failed parsing wdl from info: {arg:?}"),
                }
            }
            _ => {}
        }
    }

    info
}

/// Parses a `bestmove <move> [ponder <move>]` line relative to the analysed
/// position. `(none)` and `NULL` placeholders yield an empty result.
pub(crate) fn parse_bestmove<B: Board>(board: &B, args: &str) -> Result<BestMove<B::Move>> {
    let tokens: Vec<&str> = args.split_whitespace().collect();

    let mut mov = None;
    let mut ponder = None;

    if let Some(first) = tokens.first() {
        if *first != "(none)" && *first != "NULL" {
            // Some engines use uppercase letters to denote promotion types.
            let mut context = board.clone();
            mov = Some(
                context
                    .push_uci(&first.to_ascii_lowercase())
                    .map_err(|err| EngineError::InvalidMove(err.0))?,
            );

            if tokens.len() >= 3 && tokens[1] == "ponder" {
                let token = tokens[2];
                // Some engines send NULL instead of skipping the token.
                if token != "(none)" && token != "NULL" {
                    match context.parse_uci(&token.to_ascii_lowercase()) {
                        Ok(reply) => ponder = Some(reply),
                        Err(err) => warn!(%err, "Engine sent invalid ponder move"),
                    }
                }
            }
        }
    }

    Ok(BestMove { mov, ponder })
}
