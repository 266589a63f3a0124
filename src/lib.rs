//! Research-Plan-Implement orchestration for agent sessions.
//!
//! A run drives three phases (discovery, implementation, validation) through
//! an agent runtime, each gated on a council verdict, inside an isolated
//! sibling worktree that is merged back on success. Every transition is
//! appended to a hash-chained ledger; the run registry under
//! `.agents/rpi/runs/` backs `status`, `cleanup` and `cancel`; the
//! supervisor repeats runs under a single-flight lease.

pub mod config;
pub mod errors;
pub mod executor;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod registry;
pub mod rpi_config;
pub mod supervisor;
pub mod ui;
pub mod util;
pub mod worktree;
