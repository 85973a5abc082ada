//! Shared building blocks for the Ember crates: logging, command line, collections and profiling.

pub mod cli;
pub mod collections;
pub mod log;
pub mod profile;
