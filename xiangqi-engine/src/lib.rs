//! Driver for xiangqi engines speaking the UCI or XBoard (CECP) protocol.
//!
//! The host submits high-level requests — play a move under a [`Limit`],
//! analyse a position while streaming [`Info`] records, configure options,
//! ping, quit — and the driver translates them into the engine's wire
//! dialect, pipelines requests, parses the streamed responses and delivers
//! structured results.
//!
//! The same API is exposed twice: asynchronously through [`Engine`] and
//! blocking through [`blocking::BlockingEngine`], which runs the driver on a
//! private background runtime.
//!
//! Board and move representation are collaborator traits ([`Board`],
//! [`EngineMove`]); the driver contains no xiangqi rules.

mod analysis;
mod board;
mod command;
mod config;
mod engine;
mod error;
mod info;
mod limit;
mod option;
mod score;
mod transport;
mod uci;
mod xboard;

pub mod blocking;

pub use analysis::Analysis;
pub use board::{Board, Color, EngineMove, InvalidMoveError, Outcome, Termination};
pub use config::EngineConfig;
pub use engine::{AnalysisOptions, Engine, PlayOptions};
pub use error::EngineError;
pub use info::{BestMove, Info, InfoSelector, Opponent, PlayResult};
pub use limit::Limit;
pub use option::{EngineOption, OptionKind, OptionMap, OptionValue};
pub use score::{PovScore, PovWdl, Score, Wdl, WdlModel};
pub use transport::{ChildTransport, MockController, MockTransport, Transport, TransportEvent};

/// Result alias used throughout the crate.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests;
