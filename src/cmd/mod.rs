//! CLI command implementations.
//!
//! | Module   | Commands handled          |
//! |----------|---------------------------|
//! | `serve`  | `Serve`, `InitDb`         |
//! | `sweep`  | `Sweep`                   |
//! | `config` | `Config`                  |
//! | `status` | `Status`                  |

pub mod config;
pub mod serve;
pub mod status;
pub mod sweep;

pub use config::cmd_config;
pub use serve::{cmd_init_db, cmd_serve};
pub use status::cmd_status;
pub use sweep::cmd_sweep;
