//! CLI command handlers, one file per command.

mod fetch;
mod show_config;

pub use fetch::run_fetch;
pub use show_config::run_show_config;
