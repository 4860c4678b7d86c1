//! Subcommand implementations.

pub mod predict;
pub mod run;
pub mod serve;
