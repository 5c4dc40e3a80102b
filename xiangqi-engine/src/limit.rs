//! Search termination conditions.

use std::time::Duration;

/// Conditions under which the engine should stop searching.
///
/// All fields are optional; an empty limit means an unbounded search (only
/// meaningful for analysis).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Limit {
    /// Search exactly this long.
    pub time: Option<Duration>,
    /// Search this many plies only.
    pub depth: Option<u32>,
    /// Search a limited number of nodes.
    pub nodes: Option<u64>,
    /// Search for a mate in this many moves.
    pub mate: Option<u32>,
    /// Time remaining on Red's clock.
    pub red_clock: Option<Duration>,
    /// Time remaining on Black's clock.
    pub black_clock: Option<Duration>,
    /// Fischer increment for Red.
    pub red_inc: Option<Duration>,
    /// Fischer increment for Black.
    pub black_inc: Option<Duration>,
    /// Moves to the next time control; sudden death when unset while the
    /// clocks are set.
    pub remaining_moves: Option<u32>,
    /// Opaque sentinel for XBoard engines: when it changes between calls the
    /// time control is transmitted again, otherwise only the clocks are
    /// updated.
    pub clock_id: Option<u64>,
}

impl Limit {
    pub fn move_time(time: Duration) -> Limit {
        Limit {
            time: Some(time),
            ..Limit::default()
        }
    }

    pub fn depth(depth: u32) -> Limit {
        Limit {
            depth: Some(depth),
            ..Limit::default()
        }
    }

    pub fn nodes(nodes: u64) -> Limit {
        Limit {
            nodes: Some(nodes),
            ..Limit::default()
        }
    }

    pub fn mate(mate: u32) -> Limit {
        Limit {
            mate: Some(mate),
            ..Limit::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors() {
        assert_eq!(Limit::depth(12).depth, Some(12));
        assert_eq!(Limit::move_time(Duration::from_millis(100)).time, Some(Duration::from_millis(100)));
        assert_eq!(Limit::nodes(5000).nodes, Some(5000));
        assert_eq!(Limit::mate(2).mate, Some(2));
        let unbounded = Limit::default();
        assert!(unbounded.time.is_none() && unbounded.depth.is_none() && unbounded.clock_id.is_none());
    }
}
