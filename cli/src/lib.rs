//! MoltAgent CLI library — exposes modules for integration testing.

pub mod cli;
pub mod client;
pub mod commands;
pub mod output;
pub mod worker;
