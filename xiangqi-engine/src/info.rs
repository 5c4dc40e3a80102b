//! Structured information streamed by engines during search.

use std::collections::HashMap;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::board::EngineMove;
use crate::score::{PovScore, PovWdl};

/// Filter for the information parsed out of engine output. Parsing the
/// heavier fields costs time, so play requests default to [`InfoSelector::NONE`]
/// and analysis requests to [`InfoSelector::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoSelector(u32);

impl InfoSelector {
    pub const NONE: InfoSelector = InfoSelector(0);
    pub const BASIC: InfoSelector = InfoSelector(1);
    pub const SCORE: InfoSelector = InfoSelector(2);
    pub const PV: InfoSelector = InfoSelector(4);
    pub const REFUTATION: InfoSelector = InfoSelector(8);
    pub const CURRLINE: InfoSelector = InfoSelector(16);
    pub const ALL: InfoSelector = InfoSelector(1 | 2 | 4 | 8 | 16);

    pub fn contains(self, other: InfoSelector) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for InfoSelector {
    type Output = InfoSelector;

    fn bitor(self, rhs: InfoSelector) -> InfoSelector {
        InfoSelector(self.0 | rhs.0)
    }
}

impl BitOrAssign for InfoSelector {
    fn bitor_assign(&mut self, rhs: InfoSelector) {
        self.0 |= rhs.0;
    }
}

/// Aggregated information sent by the engine, an open record of optional
/// fields.
#[derive(Debug, Clone)]
pub struct Info<M: EngineMove> {
    pub score: Option<PovScore>,
    pub pv: Option<Vec<M>>,
    pub depth: Option<u32>,
    pub seldepth: Option<u32>,
    pub time: Option<Duration>,
    pub nodes: Option<u64>,
    pub nps: Option<u64>,
    pub tbhits: Option<u64>,
    /// 1-based multipv index, `1` for the mainline.
    pub multipv: Option<u32>,
    pub currmove: Option<M>,
    pub currmovenumber: Option<u32>,
    pub hashfull: Option<u32>,
    pub cpuload: Option<u32>,
    /// Effective branching factor.
    pub ebf: Option<f64>,
    pub wdl: Option<PovWdl>,
    /// Refuted move mapped to the refuting continuation.
    pub refutation: Option<HashMap<M, Vec<M>>>,
    /// CPU index mapped to the line it is currently searching.
    pub currline: Option<HashMap<u32, Vec<M>>>,
    pub string: Option<String>,
    pub lowerbound: bool,
    pub upperbound: bool,
}

impl<M: EngineMove> Default for Info<M> {
    fn default() -> Self {
        Info {
            score: None,
            pv: None,
            depth: None,
            seldepth: None,
            time: None,
            nodes: None,
            nps: None,
            tbhits: None,
            multipv: None,
            currmove: None,
            currmovenumber: None,
            hashfull: None,
            cpuload: None,
            ebf: None,
            wdl: None,
            refutation: None,
            currline: None,
            string: None,
            lowerbound: false,
            upperbound: false,
        }
    }
}

impl<M: EngineMove> Info<M> {
    /// Whether no field carries information.
    pub fn is_empty(&self) -> bool {
        self.score.is_none()
            && self.pv.is_none()
            && self.depth.is_none()
            && self.seldepth.is_none()
            && self.time.is_none()
            && self.nodes.is_none()
            && self.nps.is_none()
            && self.tbhits.is_none()
            && self.multipv.is_none()
            && self.currmove.is_none()
            && self.currmovenumber.is_none()
            && self.hashfull.is_none()
            && self.cpuload.is_none()
            && self.ebf.is_none()
            && self.wdl.is_none()
            && self.refutation.is_none()
            && self.currline.is_none()
            && self.string.is_none()
            && !self.lowerbound
            && !self.upperbound
    }

    /// Folds a newer record into this accumulator; fields present in `other`
    /// win.
    pub fn merge(&mut self, other: Info<M>) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(score);
        take!(pv);
        take!(depth);
        take!(seldepth);
        take!(time);
        take!(nodes);
        take!(nps);
        take!(tbhits);
        take!(multipv);
        take!(currmove);
        take!(currmovenumber);
        take!(hashfull);
        take!(cpuload);
        take!(ebf);
        take!(wdl);
        take!(refutation);
        take!(currline);
        take!(string);
        self.lowerbound |= other.lowerbound;
        self.upperbound |= other.upperbound;
    }
}

/// Final search outcome, as reported when an analysis ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestMove<M: EngineMove> {
    /// The best move according to the engine, if any.
    pub mov: Option<M>,
    /// The reply the engine expects after the best move.
    pub ponder: Option<M>,
}

/// Returned by a play request.
#[derive(Debug, Clone)]
pub struct PlayResult<M: EngineMove> {
    /// The move the engine wants to play, if any.
    pub mov: Option<M>,
    /// The reply the engine expects, if announced.
    pub ponder: Option<M>,
    /// Extra information collected while the engine was thinking.
    pub info: Info<M>,
    /// Whether the engine offered a draw before moving.
    pub draw_offered: bool,
    /// Whether the engine resigned.
    pub resigned: bool,
}

/// Information about the engine's opponent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opponent {
    pub name: Option<String>,
    /// Title such as GM, IM or BOT.
    pub title: Option<String>,
    /// Elo rating.
    pub rating: Option<u32>,
    /// Whether the opponent is another engine.
    pub is_engine: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::testing::TestMove;
    use crate::board::Color;
    use crate::score::Score;

    #[test]
    fn selector_flags() {
        let selector = InfoSelector::BASIC | InfoSelector::SCORE;
        assert!(selector.contains(InfoSelector::SCORE));
        assert!(!selector.contains(InfoSelector::PV));
        assert!(InfoSelector::ALL.contains(selector));
        assert!(InfoSelector::NONE.is_empty());
        assert!(!selector.is_empty());
    }

    #[test]
    fn merge_prefers_newer_fields() {
        let mut acc: Info<TestMove> = Info {
            depth: Some(4),
            nodes: Some(1000),
            ..Info::default()
        };
        let newer = Info {
            depth: Some(6),
            score: Some(PovScore::new(Score::Cp(12), Color::Red)),
            lowerbound: true,
            ..Info::default()
        };
        acc.merge(newer);
        assert_eq!(acc.depth, Some(6));
        assert_eq!(acc.nodes, Some(1000));
        assert_eq!(acc.score, Some(PovScore::new(Score::Cp(12), Color::Red)));
        assert!(acc.lowerbound);
    }
}
