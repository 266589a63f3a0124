//! CLI command implementations.
//!
//! | Module      | Commands handled |
//! |-------------|------------------|
//! | `run`       | `Run`            |
//! | `status`    | `Status`         |
//! | `cleanup`   | `Cleanup`        |
//! | `cancel`    | `Cancel`         |
//! | `ledger`    | `Ledger`         |
//! | `supervise` | `Loop`           |

pub mod cancel;
pub mod cleanup;
pub mod ledger;
pub mod run;
pub mod status;
pub mod supervise;

pub use cancel::cmd_cancel;
pub use cleanup::{CleanupArgs, cmd_cleanup};
pub use ledger::cmd_ledger;
pub use run::cmd_run;
pub use status::cmd_status;
pub use supervise::cmd_loop;
