//! Terminal tables for CLI output.

pub mod tables;

pub use tables::{TableBuilder, create_results_table, create_stats_table, create_sync_table};
