//! CLI commands.

pub mod clean;
pub mod info;
pub mod serve;
pub mod setup;
