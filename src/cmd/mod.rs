//! CLI command implementations.
//!
//! | Module        | Commands handled        |
//! |---------------|-------------------------|
//! | `run`         | `Run`, `Resume`         |
//! | `checkpoints` | `Checkpoints`, `Status` |
//! | `graph`       | `Graph`                 |
//! | `shell`       | executor used by `run`  |

pub mod checkpoints;
pub mod graph;
pub mod run;
pub mod shell;

pub use checkpoints::{cmd_checkpoints, cmd_status};
pub use graph::cmd_graph;
pub use run::{RunOverrides, cmd_resume, cmd_run};
