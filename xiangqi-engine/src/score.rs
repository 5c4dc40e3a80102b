//! Engine evaluation values and win/draw/loss models.

use std::cmp::Ordering;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::board::Color;

/// Evaluation of a position, from the point of view of the side to move.
///
/// There is a total order over all scores:
/// `Mate(0) < Mate(-1) < Cp(-50) < Cp(200) < Mate(4) < Mate(1) < MateGiven`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Score {
    /// Centipawn score.
    Cp(i32),
    /// Signed ply distance to mate: positive means we deliver mate, zero or
    /// negative means we get mated.
    Mate(i32),
    /// Mate has been delivered, equivalent to `-Mate(0)`.
    MateGiven,
}

impl Score {
    /// Centipawn value, or `None` for mate scores.
    pub fn score(&self) -> Option<i32> {
        match self {
            Score::Cp(cp) => Some(*cp),
            Score::Mate(_) | Score::MateGiven => None,
        }
    }

    /// Centipawn value with mate scores folded onto `mate_score`.
    ///
    /// `Mate(5).score_with(100_000)` is `99_995`, `Mate(-3).score_with(100_000)`
    /// is `-99_997`.
    pub fn score_with(&self, mate_score: i32) -> i32 {
        match self {
            Score::Cp(cp) => *cp,
            Score::Mate(moves) if *moves > 0 => mate_score - moves,
            Score::Mate(moves) => -mate_score - moves,
            Score::MateGiven => mate_score,
        }
    }

    /// Plies to mate, negative when getting mated. Conflates `Mate(0)` (we
    /// lost) and `MateGiven` (we won) to `0`.
    pub fn mate(&self) -> Option<i32> {
        match self {
            Score::Cp(_) => None,
            Score::Mate(moves) => Some(*moves),
            Score::MateGiven => Some(0),
        }
    }

    pub fn is_mate(&self) -> bool {
        self.mate().is_some()
    }

    /// Expected outcome statistics under a given model, assuming the score
    /// was reached at `ply`.
    pub fn wdl(&self, model: WdlModel, ply: u32) -> Wdl {
        match self {
            Score::Cp(cp) => model.wdl_from_cp(*cp, ply),
            Score::Mate(moves) => model.wdl_from_mate(*moves),
            Score::MateGiven => Wdl::new(1000, 0, 0),
        }
    }

    pub fn abs(&self) -> Score {
        match self {
            Score::Cp(cp) => Score::Cp(cp.abs()),
            Score::Mate(0) => Score::MateGiven,
            Score::Mate(moves) => Score::Mate(moves.abs()),
            Score::MateGiven => Score::MateGiven,
        }
    }

    // Sort key mirroring the total order: mate-given flag, winning-mate flag,
    // centipawn flag, mate distance, centipawns.
    fn key(&self) -> (bool, bool, bool, i64, i64) {
        match self {
            Score::MateGiven => (true, false, false, 0, 0),
            Score::Mate(moves) if *moves > 0 => (false, true, false, -i64::from(*moves), 0),
            Score::Cp(cp) => (false, false, true, 0, i64::from(*cp)),
            Score::Mate(moves) => (false, false, false, -i64::from(*moves), 0),
        }
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl std::ops::Neg for Score {
    type Output = Score;

    fn neg(self) -> Score {
        match self {
            Score::Cp(cp) => Score::Cp(-cp),
            Score::Mate(0) => Score::MateGiven,
            Score::Mate(moves) => Score::Mate(-moves),
            Score::MateGiven => Score::Mate(0),
        }
    }
}

impl Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Cp(cp) if *cp > 0 => write!(f, "+{cp}"),
            Score::Cp(cp) => write!(f, "{cp}"),
            Score::Mate(moves) if *moves > 0 => write!(f, "#+{moves}"),
            Score::Mate(moves) => write!(f, "#-{}", moves.abs()),
            Score::MateGiven => write!(f, "#+0"),
        }
    }
}

/// A relative [`Score`] and the point of view it is relative to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PovScore {
    pub relative: Score,
    pub turn: Color,
}

impl PovScore {
    pub fn new(relative: Score, turn: Color) -> PovScore {
        PovScore { relative, turn }
    }

    pub fn red(&self) -> Score {
        self.pov(Color::Red)
    }

    pub fn black(&self) -> Score {
        self.pov(Color::Black)
    }

    /// The score from the point of view of `color`.
    pub fn pov(&self, color: Color) -> Score {
        if self.turn == color {
            self.relative
        } else {
            -self.relative
        }
    }

    pub fn is_mate(&self) -> bool {
        self.relative.is_mate()
    }

    pub fn wdl(&self, model: WdlModel, ply: u32) -> PovWdl {
        PovWdl::new(self.relative.wdl(model, ply), self.turn)
    }
}

impl PartialEq for PovScore {
    fn eq(&self, other: &Self) -> bool {
        self.red() == other.red()
    }
}

impl Eq for PovScore {}

/// Win/draw/loss statistics, usually scaled to 1000 games.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wdl {
    pub wins: i32,
    pub draws: i32,
    pub losses: i32,
}

impl Wdl {
    pub fn new(wins: i32, draws: i32, losses: i32) -> Wdl {
        Wdl { wins, draws, losses }
    }

    pub fn total(&self) -> i32 {
        self.wins + self.draws + self.losses
    }

    pub fn winning_chance(&self) -> f64 {
        f64::from(self.wins) / f64::from(self.total())
    }

    pub fn drawing_chance(&self) -> f64 {
        f64::from(self.draws) / f64::from(self.total())
    }

    pub fn losing_chance(&self) -> f64 {
        f64::from(self.losses) / f64::from(self.total())
    }

    /// Expectation value with a win counting 1 and a draw counting 0.5.
    pub fn expectation(&self) -> f64 {
        (f64::from(self.wins) + 0.5 * f64::from(self.draws)) / f64::from(self.total())
    }
}

impl std::ops::Neg for Wdl {
    type Output = Wdl;

    fn neg(self) -> Wdl {
        Wdl {
            wins: self.losses,
            draws: self.draws,
            losses: self.wins,
        }
    }
}

/// A relative [`Wdl`] and the point of view it is relative to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PovWdl {
    pub relative: Wdl,
    pub turn: Color,
}

impl PovWdl {
    pub fn new(relative: Wdl, turn: Color) -> PovWdl {
        PovWdl { relative, turn }
    }

    pub fn red(&self) -> Wdl {
        self.pov(Color::Red)
    }

    pub fn black(&self) -> Wdl {
        self.pov(Color::Black)
    }

    pub fn pov(&self, color: Color) -> Wdl {
        if self.turn == color {
            self.relative
        } else {
            -self.relative
        }
    }
}

impl PartialEq for PovWdl {
    fn eq(&self, other: &Self) -> bool {
        self.red() == other.red()
    }
}

impl Eq for PovWdl {}

/// Win/draw/loss models keyed by the engine generation they were fitted on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WdlModel {
    /// The model of the latest Stockfish, currently [`WdlModel::Sf16_1`].
    #[default]
    Sf,
    Sf16_1,
    Sf16,
    Sf15_1,
    Sf15,
    Sf14,
    Sf12,
    /// The licchess win-rate model. Ignores `ply` and never predicts draws.
    Licchess,
}

impl WdlModel {
    pub fn from_name(name: &str) -> Option<WdlModel> {
        match name {
            "sf" => Some(WdlModel::Sf),
            "sf16.1" => Some(WdlModel::Sf16_1),
            "sf16" => Some(WdlModel::Sf16),
            "sf15.1" => Some(WdlModel::Sf15_1),
            "sf15" => Some(WdlModel::Sf15),
            "sf14" => Some(WdlModel::Sf14),
            "sf12" => Some(WdlModel::Sf12),
            "licchess" => Some(WdlModel::Licchess),
            _ => None,
        }
    }

    fn wdl_from_cp(self, cp: i32, ply: u32) -> Wdl {
        if self == WdlModel::Licchess {
            let wins = licchess_raw_wins(cp.clamp(-1000, 1000));
            return Wdl::new(wins, 0, 1000 - wins);
        }
        let wins = self.model_wins(cp, ply);
        let losses = self.model_wins(-cp, ply);
        Wdl::new(wins, 1000 - wins - losses, losses)
    }

    fn wdl_from_mate(self, moves: i32) -> Wdl {
        if self == WdlModel::Licchess {
            let cp = (21 - moves.abs().min(10)) * 100;
            let wins = licchess_raw_wins(cp);
            if moves > 0 {
                Wdl::new(wins, 0, 1000 - wins)
            } else {
                Wdl::new(1000 - wins, 0, wins)
            }
        } else if moves > 0 {
            Wdl::new(1000, 0, 0)
        } else {
            Wdl::new(0, 0, 1000)
        }
    }

    fn model_wins(self, cp: i32, ply: u32) -> i32 {
        match self {
            WdlModel::Sf | WdlModel::Sf16_1 => sf16_1_wins(cp, ply),
            WdlModel::Sf16 => sf16_wins(cp, ply),
            WdlModel::Sf15_1 => sf15_1_wins(cp, ply),
            WdlModel::Sf15 => sf15_wins(cp, ply),
            WdlModel::Sf14 => sf14_wins(cp, ply),
            WdlModel::Sf12 => sf12_wins(cp, ply),
            WdlModel::Licchess => licchess_raw_wins(cp.clamp(-1000, 1000)),
        }
    }
}

fn logistic_permille(a: f64, b: f64, x: f64) -> i32 {
    (0.5 + 1000.0 / (1.0 + ((a - x) / b).exp())) as i32
}

fn sf16_1_wins(cp: i32, ply: u32) -> i32 {
    const NORMALIZE_TO_PAWN_VALUE: f64 = 356.0;
    let m = (f64::from(ply) / 2.0 + 1.0).clamp(8.0, 120.0) / 32.0;
    let a = (((-1.062_497_02 * m + 7.420_169_37) * m + 0.894_256_29) * m) + 348.603_561_74;
    let b = (((-5.331_221_90 * m + 39.578_315_33) * m + -90.844_737_71) * m) + 123.406_207_48;
    let x = (f64::from(cp) * NORMALIZE_TO_PAWN_VALUE / 100.0).clamp(-4000.0, 4000.0);
    logistic_permille(a, b, x)
}

fn sf16_wins(cp: i32, ply: u32) -> i32 {
    const NORMALIZE_TO_PAWN_VALUE: f64 = 328.0;
    let m = f64::from(ply.min(240)) / 64.0;
    let a = (((0.380_365_25 * m + -2.820_150_70) * m + 23.178_821_35) * m) + 307.367_684_07;
    let b = (((-2.294_347_33 * m + 13.276_897_88) * m + -14.268_289_04) * m) + 63.453_183_30;
    let x = (f64::from(cp) * NORMALIZE_TO_PAWN_VALUE / 100.0).clamp(-4000.0, 4000.0);
    logistic_permille(a, b, x)
}

fn sf15_1_wins(cp: i32, ply: u32) -> i32 {
    const NORMALIZE_TO_PAWN_VALUE: f64 = 361.0;
    let m = f64::from(ply.min(240)) / 64.0;
    let a = (((-0.582_704_99 * m + 2.685_125_49) * m + 15.246_380_15) * m) + 344.497_453_82;
    let b = (((-2.657_345_62 * m + 15.965_097_99) * m + -20.690_408_36) * m) + 73.610_299_37;
    let x = (f64::from(cp) * NORMALIZE_TO_PAWN_VALUE / 100.0).clamp(-4000.0, 4000.0);
    logistic_permille(a, b, x)
}

fn sf15_wins(cp: i32, ply: u32) -> i32 {
    let m = f64::from(ply.min(240)) / 64.0;
    let a = (((-1.172_024_60e-1 * m + 5.947_291_04e-1) * m + 1.120_655_46e1) * m) + 1.226_062_22e2;
    let b = (((-1.790_667_59 * m + 11.307_591_93) * m + -17.436_776_12) * m) + 36.471_474_79;
    let x = f64::from(cp.clamp(-2000, 2000));
    logistic_permille(a, b, x)
}

fn sf14_wins(cp: i32, ply: u32) -> i32 {
    let m = f64::from(ply.min(240)) / 64.0;
    let a = (((-3.683_893_04 * m + 30.070_659_21) * m + -60.528_787_23) * m) + 149.533_785_57;
    let b = (((-2.018_185_70 * m + 15.856_850_38) * m + -29.834_520_23) * m) + 47.590_788_27;
    let x = f64::from(cp.clamp(-2000, 2000));
    logistic_permille(a, b, x)
}

fn sf12_wins(cp: i32, ply: u32) -> i32 {
    let m = f64::from(ply.min(240)) / 64.0;
    let a = (((-8.244_042_95 * m + 64.238_923_42) * m + -95.730_564_62) * m) + 153.864_786_79;
    let b = (((-3.371_543_71 * m + 28.444_891_98) * m + -56.676_577_41) * m) + 72.058_587_51;
    let x = f64::from(cp.clamp(-1000, 1000));
    logistic_permille(a, b, x)
}

fn licchess_raw_wins(cp: i32) -> i32 {
    (1000.0 / (1.0 + (-0.003_682_08 * f64::from(cp)).exp())).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODELS: [WdlModel; 8] = [
        WdlModel::Sf,
        WdlModel::Sf16_1,
        WdlModel::Sf16,
        WdlModel::Sf15_1,
        WdlModel::Sf15,
        WdlModel::Sf14,
        WdlModel::Sf12,
        WdlModel::Licchess,
    ];

    #[test]
    fn total_order() {
        let ascending = [
            Score::Mate(0),
            Score::Mate(-1),
            Score::Mate(-2),
            Score::Cp(-50),
            Score::Cp(0),
            Score::Cp(200),
            Score::Mate(4),
            Score::Mate(1),
            Score::MateGiven,
        ];
        for (i, a) in ascending.iter().enumerate() {
            for (j, b) in ascending.iter().enumerate() {
                assert_eq!(a < b, i < j, "{a} vs {b}");
                assert_eq!(a == b, i == j, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn negation_involution() {
        let scores = [
            Score::Cp(-120),
            Score::Cp(0),
            Score::Cp(75),
            Score::Mate(-3),
            Score::Mate(0),
            Score::Mate(8),
            Score::MateGiven,
        ];
        for score in scores {
            assert_eq!(-(-score), score);
        }
        assert_eq!(-Score::Cp(20), Score::Cp(-20));
        assert_eq!(-Score::Mate(-4), Score::Mate(4));
        assert_eq!(-Score::Mate(0), Score::MateGiven);
        assert_eq!(-Score::MateGiven, Score::Mate(0));
    }

    #[test]
    fn abs_is_non_negative() {
        let scores = [Score::Cp(-120), Score::Mate(-3), Score::Mate(0), Score::Cp(5)];
        for score in scores {
            assert!(score.abs() >= Score::Cp(0));
        }
        assert_eq!(Score::Mate(0).abs(), Score::MateGiven);
    }

    #[test]
    fn centipawn_folding() {
        assert_eq!(Score::Cp(-300).score(), Some(-300));
        assert_eq!(Score::Mate(5).score(), None);
        assert_eq!(Score::Mate(5).score_with(100_000), 99_995);
        assert_eq!(Score::Mate(-3).score_with(100_000), -99_997);
        assert_eq!(Score::Mate(0).score_with(100_000), -100_000);
        assert_eq!(Score::MateGiven.score_with(100_000), 100_000);
    }

    #[test]
    fn wdl_sums_to_permille() {
        for model in MODELS {
            for cp in [-1500, -300, -1, 0, 1, 120, 900, 3000] {
                for ply in [0, 10, 30, 119, 240] {
                    let wdl = Score::Cp(cp).wdl(model, ply);
                    assert_eq!(wdl.total(), 1000, "{model:?} cp={cp} ply={ply}");
                    let mirrored = Score::Cp(-cp).wdl(model, ply);
                    assert_eq!(wdl.wins, mirrored.losses, "{model:?} cp={cp} ply={ply}");
                }
            }
        }
    }

    #[test]
    fn wdl_mate_scores() {
        for model in MODELS {
            if model == WdlModel::Licchess {
                continue;
            }
            assert_eq!(Score::Mate(3).wdl(model, 30), Wdl::new(1000, 0, 0));
            assert_eq!(Score::Mate(-3).wdl(model, 30), Wdl::new(0, 0, 1000));
            assert_eq!(Score::Mate(0).wdl(model, 30), Wdl::new(0, 0, 1000));
            assert_eq!(Score::MateGiven.wdl(model, 30), Wdl::new(1000, 0, 0));
        }
        let near = Score::Mate(2).wdl(WdlModel::Licchess, 30);
        assert!(near.wins > 990);
        assert_eq!(near.draws, 0);
        assert_eq!(near.total(), 1000);
        let mated = Score::Mate(-2).wdl(WdlModel::Licchess, 30);
        assert_eq!(mated.wins, 1000 - near.wins);
    }

    #[test]
    fn licchess_even_position() {
        let wdl = Score::Cp(0).wdl(WdlModel::Licchess, 30);
        assert_eq!(wdl, Wdl::new(500, 0, 500));
    }

    #[test]
    fn expectation_gradient() {
        let low = Score::Cp(-100).wdl(WdlModel::Sf, 30).expectation();
        let high = Score::Cp(100).wdl(WdlModel::Sf, 30).expectation();
        let mid = Score::Cp(300).wdl(WdlModel::Sf, 30).expectation();
        let top = Score::Cp(500).wdl(WdlModel::Sf, 30).expectation();
        assert!(high - low > top - mid);
    }

    #[test]
    fn pov_score() {
        let score = PovScore::new(Score::Cp(30), Color::Black);
        assert_eq!(score.black(), Score::Cp(30));
        assert_eq!(score.red(), Score::Cp(-30));
        assert_eq!(score, PovScore::new(Score::Cp(-30), Color::Red));
        assert!(PovScore::new(Score::Mate(2), Color::Red).is_mate());
    }

    #[test]
    fn pov_wdl_negation() {
        let wdl = PovWdl::new(Wdl::new(600, 300, 100), Color::Black);
        assert_eq!(wdl.black(), Wdl::new(600, 300, 100));
        assert_eq!(wdl.red(), Wdl::new(100, 300, 600));
    }

    #[test]
    fn model_names() {
        assert_eq!(WdlModel::from_name("sf"), Some(WdlModel::Sf));
        assert_eq!(WdlModel::from_name("sf16.1"), Some(WdlModel::Sf16_1));
        assert_eq!(WdlModel::from_name("licchess"), Some(WdlModel::Licchess));
        assert_eq!(WdlModel::from_name("alphazero"), None);
    }

    #[test]
    fn display_forms() {
        assert_eq!(Score::Cp(15).to_string(), "+15");
        assert_eq!(Score::Cp(-7).to_string(), "-7");
        assert_eq!(Score::Mate(3).to_string(), "#+3");
        assert_eq!(Score::Mate(-2).to_string(), "#-2");
        assert_eq!(Score::MateGiven.to_string(), "#+0");
    }
}
