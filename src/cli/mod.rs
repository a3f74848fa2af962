//! Command-line interface for rag-worker.
//!
//! Provides the worker process, the load generator and a result lookup.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
