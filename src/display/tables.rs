//! Table formatting utilities for structured output.

use comfy_table::{
    Attribute, Cell, CellAlignment, Color, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_FULL,
};

use crate::engine::CoreStats;
use crate::index::SearchResult;
use crate::sync::SyncReport;

fn styled_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);
    table
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|name| Cell::new(name).add_attribute(Attribute::Bold))
        .collect()
}

/// Builder for creating formatted tables.
pub struct TableBuilder {
    table: Table,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    /// Create a new table builder.
    pub fn new() -> Self {
        Self {
            table: styled_table(),
        }
    }

    /// Set the table headers.
    pub fn set_headers(mut self, headers: Vec<&str>) -> Self {
        self.table.set_header(header(&headers));
        self
    }

    /// Add a row to the table.
    pub fn add_row(mut self, row: Vec<String>) -> Self {
        self.table.add_row(row);
        self
    }

    /// Build and return the formatted table.
    pub fn build(self) -> String {
        self.table.to_string()
    }
}

/// Ranked recommendations.
pub fn create_results_table(results: &[SearchResult]) -> String {
    let mut table = styled_table();
    table.set_header(header(&["Rank", "Item", "Score"]));

    for result in results {
        // Scores near 1 are close matches, below 0 point away
        let color = match result.score.get() {
            s if s >= 0.75 => Color::Green,
            s if s >= 0.4 => Color::Yellow,
            _ => Color::Red,
        };
        table.add_row(vec![
            Cell::new(result.rank).set_alignment(CellAlignment::Right),
            Cell::new(result.item_id),
            Cell::new(result.score)
                .fg(color)
                .set_alignment(CellAlignment::Right),
        ]);
    }

    table.to_string()
}

/// Item states, staging and snapshot figures.
pub fn create_stats_table(stats: &CoreStats) -> String {
    let mut table = styled_table();
    table.set_header(header(&["Metric", "Value"]));

    let last_rebuild = stats
        .index
        .last_rebuild_at
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string());

    let rows: Vec<(&str, String)> = vec![
        ("Model", stats.model.clone()),
        ("Dimension", stats.index.dimension.to_string()),
        (
            "Storage",
            if stats.durable { "durable" } else { "in-memory" }.to_string(),
        ),
        ("Stored items", stats.stored_items.to_string()),
        ("Log records", stats.log_records.to_string()),
        ("Unindexed", stats.items.unindexed.to_string()),
        ("Embedding", stats.items.embedding.to_string()),
        ("Indexed", stats.items.indexed.to_string()),
        ("Reindexing", stats.items.reindexing.to_string()),
        ("Deleted", stats.items.deleted.to_string()),
        ("Snapshot items", stats.index.snapshot_items.to_string()),
        ("Staged", stats.index.staged_items.to_string()),
        ("Tombstones", stats.index.tombstones.to_string()),
        ("Partitions", stats.index.partitions.to_string()),
        ("Generation", stats.index.generation.to_string()),
        ("Last rebuild", last_rebuild),
    ];
    for (metric, value) in rows {
        table.add_row(vec![Cell::new(metric), Cell::new(value)]);
    }

    if stats.index.rebuild_in_flight {
        table.add_row(vec![
            Cell::new("Rebuild"),
            Cell::new("in progress")
                .fg(Color::Yellow)
                .add_attribute(Attribute::Bold),
        ]);
    }

    table.to_string()
}

/// Outcome of a sync run.
pub fn create_sync_table(source: &str, report: &SyncReport) -> String {
    let mut table = styled_table();
    table.set_header(header(&["Source", "Fetched", "Upserted", "Deleted", "Batches"]));
    table.add_row(vec![
        Cell::new(source),
        Cell::new(report.fetched),
        Cell::new(report.upserted),
        Cell::new(report.deleted),
        Cell::new(report.batches),
    ]);
    table.to_string()
}
