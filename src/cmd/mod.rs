//! CLI command implementations.
//!
//! | Module    | Commands handled   |
//! |-----------|--------------------|
//! | `project` | `Init`             |
//! | `serve`   | `Serve`            |
//! | `config`  | `Config`           |
//! | `runs`    | `Status`, `Runs`   |

pub mod config;
pub mod project;
pub mod runs;
pub mod serve;

pub use config::cmd_config;
pub use project::cmd_init;
pub use runs::{cmd_runs, cmd_status};
pub use serve::cmd_serve;
