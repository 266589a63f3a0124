//! Phase orchestration: state, prompts, gates and the engine that drives a
//! run from discovery to validation.

pub mod artifacts;
pub mod complexity;
pub mod engine;
pub mod gate;
pub mod prompts;
pub mod state;
pub mod tracker;

pub use complexity::ComplexityLevel;
pub use engine::{Engine, RunContext, RunOptions};
pub use state::{RunState, TerminalStatus};
