//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `create` - Snapshot a medium and dump it into an image file
//! - `show` - Display configuration or what a medium looks like
//! - `preflight` - Run preflight checks

pub mod create;
mod preflight;
pub mod show;

pub use create::cmd_create;
pub use preflight::cmd_preflight;
pub use show::cmd_show;
