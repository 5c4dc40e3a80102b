//! Parsers for the XBoard (CECP) wire dialect.

use std::collections::VecDeque;
use std::time::Duration;

use crate::board::Board;
use crate::error::EngineError;
use crate::info::{Info, InfoSelector};
use crate::option::{EngineOption, OptionKind, OptionValue};
use crate::score::{PovScore, Score};
use crate::Result;

/// Splits the arguments of a `feature` line into `key=value` tokens,
/// honoring double-quoted values.
pub(crate) fn split_features(arg: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in arg.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Parses an `option="NAME -type ..."` feature specifier.
pub(crate) fn parse_feature_option(spec: &str) -> Result<EngineOption> {
    let params: Vec<&str> = spec.split_whitespace().collect();
    let name = params.first().copied().unwrap_or_default().to_string();
    if name.is_empty() {
        return Err(EngineError::InvalidValue("empty option feature".to_string()));
    }
    let kind_text = params
        .get(1)
        .map(|token| token.trim_start_matches('-'))
        .unwrap_or_default();
    let kind = OptionKind::from_name(kind_text)
        .ok_or_else(|| EngineError::UnknownOptionKind(kind_text.to_string()))?;

    let mut default = OptionValue::None;
    let mut min = None;
    let mut max = None;
    let mut var = Vec::new();
    let rest = params.get(2..).unwrap_or(&[]);

    match kind {
        OptionKind::Combo => {
            for choice in rest {
                if *choice == "///" {
                    continue;
                }
                if let Some(preselected) = choice.strip_prefix('*') {
                    default = OptionValue::Str(preselected.to_string());
                    var.push(preselected.to_string());
                } else {
                    var.push(choice.to_string());
                }
            }
        }
        OptionKind::Check => {
            let value = rest
                .first()
                .and_then(|token| token.parse::<i64>().ok())
                .ok_or_else(|| bad_spec(&name, spec))?;
            default = OptionValue::Bool(value != 0);
        }
        OptionKind::Str | OptionKind::File | OptionKind::Path => {
            default = OptionValue::Str(rest.first().copied().unwrap_or_default().to_string());
        }
        OptionKind::Spin => {
            let number = |index: usize| {
                rest.get(index)
                    .and_then(|token| token.parse::<i64>().ok())
                    .ok_or_else(|| bad_spec(&name, spec))
            };
            default = OptionValue::Int(number(0)?);
            min = Some(number(1)?);
            max = Some(number(2)?);
        }
        OptionKind::Button | OptionKind::Reset | OptionKind::Save => {}
    }

    Ok(EngineOption {
        name,
        kind,
        default,
        min,
        max,
        var,
    })
}

fn bad_spec(name: &str, spec: &str) -> EngineError {
    EngineError::InvalidValue(format!("malformed option feature for {name:?}: {spec:?}"))
}

/// Matches fatal `Error ...:` / `Illegal move ...:` lines.
pub(crate) fn is_error_line(line: &str) -> bool {
    let rest = line.trim_start();
    let rest = if let Some(rest) = rest.strip_prefix("Illegal move") {
        rest
    } else if let Some(rest) = rest.strip_prefix("Error") {
        rest
    } else {
        return false;
    };
    let rest = rest.trim_start();
    let rest = if let Some(inner) = rest.strip_prefix('(') {
        match inner.find(')') {
            Some(end) if end > 0 && !inner[..end].contains('(') => inner[end + 1..].trim_start(),
            _ => return false,
        }
    } else {
        rest
    };
    rest.starts_with(':')
}

/// Whether a line is thinking output: it starts with a digit and has at
/// least four whitespace-separated tokens.
pub(crate) fn is_thinking_line(line: &str) -> bool {
    line.trim_start().starts_with(|c: char| c.is_ascii_digit())
        && line.split_whitespace().count() >= 4
}

/// Parses a thinking-output line,
/// `depth score time nodes [seldepth [nps [reserved... tbhits]]] pv...`,
/// with the score in centipawns and mates folded around ±100000.
pub(crate) fn parse_post<B: Board>(line: &str, root: &B, selector: InfoSelector) -> Info<B::Move> {
    let mut info = Info::default();

    let mut tokens: VecDeque<&str> = line.split_whitespace().collect();
    let mut ints: VecDeque<i64> = VecDeque::new();
    while let Some(token) = tokens.front() {
        match token.parse::<i64>() {
            Ok(value) => {
                ints.push_back(value);
                tokens.pop_front();
            }
            Err(_) => break,
        }
    }

    if ints.len() < 4 {
        return info;
    }

    info.depth = ints.pop_front().map(|v| v.max(0) as u32);
    let cp = ints.pop_front().unwrap_or_default();
    info.time = ints
        .pop_front()
        .map(|centis| Duration::from_millis(centis.max(0) as u64 * 10));
    info.nodes = ints.pop_front().map(|v| v.max(0) as u64);

    let score = if cp <= -100_000 {
        Score::Mate((cp + 100_000) as i32)
    } else if cp == 100_000 {
        Score::MateGiven
    } else if cp >= 100_000 {
        Score::Mate((cp - 100_000) as i32)
    } else {
        Score::Cp(cp as i32)
    };
    info.score = Some(PovScore::new(score, root.turn()));

    if !ints.is_empty() {
        info.seldepth = ints.pop_front().map(|v| v.max(0) as u32);
    }
    if !ints.is_empty() {
        info.nps = ints.pop_front().map(|v| v.max(0) as u64);
    }
    while ints.len() > 1 {
        // Reserved for future extensions.
        ints.pop_front();
    }
    if !ints.is_empty() {
        info.tbhits = ints.pop_front().map(|v| v.max(0) as u64);
    }

    let mut pv = Vec::new();
    let mut board = root.without_stack();
    for token in tokens {
        let trimmed = token.trim_end_matches('.');
        if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
            // Move numbers interleaved with the variation.
            continue;
        }
        match board.push_xboard(token) {
            Ok(mv) => pv.push(mv),
            Err(_) => break,
        }
        if !selector.contains(InfoSelector::PV) {
            break;
        }
    }
    info.pv = Some(pv);

    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::testing::TestBoard;
    use crate::board::{Color, EngineMove};

    #[test]
    fn feature_tokens_honor_quotes() {
        let tokens = split_features("ping=1 setboard=1 myname=\"Fairy-Max 5.0\" option=\"Resign -check 0\" done=1");
        assert_eq!(
            tokens,
            vec![
                "ping=1",
                "setboard=1",
                "myname=Fairy-Max 5.0",
                "option=Resign -check 0",
                "done=1",
            ]
        );
    }

    #[test]
    fn option_specifiers() {
        let option = parse_feature_option("Resign -check 0").unwrap();
        assert_eq!(option.kind, OptionKind::Check);
        assert_eq!(option.default, OptionValue::Bool(false));

        let option = parse_feature_option("Depth -spin 8 1 26").unwrap();
        assert_eq!(option.default, OptionValue::Int(8));
        assert_eq!(option.min, Some(1));
        assert_eq!(option.max, Some(26));

        let option = parse_feature_option("Style -combo Solid /// *Normal /// Risky").unwrap();
        assert_eq!(option.default, OptionValue::Str("Normal".into()));
        assert_eq!(
            option.var,
            vec!["Solid".to_string(), "Normal".into(), "Risky".into()]
        );

        let option = parse_feature_option("Clear -button").unwrap();
        assert_eq!(option.default, OptionValue::None);

        assert!(parse_feature_option("Broken -spin 8").is_err());
    }

    #[test]
    fn error_lines() {
        assert!(is_error_line("Error (unknown command): analyze"));
        assert!(is_error_line("Illegal move: e2e4"));
        assert!(is_error_line("  Error: oops"));
        assert!(!is_error_line("Errors: lots"));
        assert!(!is_error_line("move h2e2"));
    }

    #[test]
    fn thinking_lines() {
        assert!(is_thinking_line("10 -15 123 45678 7 365000 0 h2e2 h9g7"));
        assert!(is_thinking_line("4 105 12 3456 h2e2"));
        assert!(!is_thinking_line("pong 4"));
        assert!(!is_thinking_line("9 22 11"));
    }

    #[test]
    fn post_with_optional_fields() {
        let board = TestBoard::new();
        let info = parse_post("10 -15 123 45678 7 365000 0 h2e2 h9g7", &board, InfoSelector::ALL);
        assert_eq!(info.depth, Some(10));
        assert_eq!(info.score, Some(PovScore::new(Score::Cp(-15), Color::Red)));
        assert_eq!(info.time, Some(Duration::from_millis(1230)));
        assert_eq!(info.nodes, Some(45678));
        assert_eq!(info.seldepth, Some(7));
        assert_eq!(info.nps, Some(365_000));
        assert_eq!(info.tbhits, Some(0));
        let pv: Vec<String> = info.pv.unwrap().iter().map(|mv| mv.uci()).collect();
        assert_eq!(pv, vec!["h2e2", "h9g7"]);
    }

    #[test]
    fn post_minimal() {
        let board = TestBoard::new();
        let info = parse_post("4 105 12 3456 h2e2", &board, InfoSelector::ALL);
        assert_eq!(info.depth, Some(4));
        assert_eq!(info.score, Some(PovScore::new(Score::Cp(105), Color::Red)));
        assert_eq!(info.time, Some(Duration::from_millis(120)));
        assert_eq!(info.nodes, Some(3456));
        assert_eq!(info.seldepth, None);
        assert_eq!(info.pv.unwrap().len(), 1);
    }

    #[test]
    fn post_mate_folding() {
        let board = TestBoard::new();
        let mate_given = parse_post("12 100000 5 100 h2e2", &board, InfoSelector::ALL);
        assert_eq!(mate_given.score.map(|s| s.relative), Some(Score::MateGiven));

        let mating = parse_post("12 100005 5 100 h2e2", &board, InfoSelector::ALL);
        assert_eq!(mating.score.map(|s| s.relative), Some(Score::Mate(5)));

        let mated = parse_post("12 -100003 5 100 h2e2", &board, InfoSelector::ALL);
        assert_eq!(mated.score.map(|s| s.relative), Some(Score::Mate(-3)));
    }

    #[test]
    fn post_skips_move_numbers_in_pv() {
        let board = TestBoard::new();
        let info = parse_post("6 40 20 999 1. h2e2 h9g7 2. b2e2", &board, InfoSelector::ALL);
        let pv: Vec<String> = info.pv.unwrap().iter().map(|mv| mv.uci()).collect();
        assert_eq!(pv, vec!["h2e2", "h9g7", "b2e2"]);
    }

    #[test]
    fn post_without_pv_flag_keeps_best_move_only() {
        let board = TestBoard::new();
        let info = parse_post("6 40 20 999 h2e2 h9g7", &board, InfoSelector::BASIC | InfoSelector::SCORE);
        let pv: Vec<String> = info.pv.unwrap().iter().map(|mv| mv.uci()).collect();
        assert_eq!(pv, vec!["h2e2"]);
    }
}
