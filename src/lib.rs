//! # Stock Reconciler
//!
//! A library for auditing declared inventory against fiscal movements: what a
//! business says it had in stock, what it sold and bought, and whether the
//! two stories agree.
//!
//! ## Core Concepts
//!
//! - **Movements**: ledger rows tagged with a transaction code (CFOP). Which
//!   codes count as sales or purchases is configuration.
//! - **Aggregation**: rows are folded per normalized product name and ranked
//!   by quantity sold. The best sellers drive inventory extraction.
//! - **Inventory Facts**: (code, name, quantity) lines recovered from the
//!   plain text of inventory documents, tagged with the snapshot they
//!   represent (initial, physical, accounting, final).
//! - **Balance**: `expected = initial + purchased - sold`, compared to the
//!   closing snapshot and classified OK / ALERT / CRITICAL.
//! - **No fabrication**: a document with no recognisable inventory is
//!   reported as such and its snapshot is treated as absent.
//!
//! ## Example
//!
//! ```rust,ignore
//! use stock_reconciler::*;
//!
//! let config = ReconciliationConfig::from_toml(r#"
//! [movements]
//! sale_codes = ["5101", "5102", "5405"]
//! purchase_codes = ["1102"]
//! "#)?;
//!
//! let inputs = ReconciliationInputs::new()
//!     .movement(MovementSource::from_csv_str("vendas.csv", csv_text, b';')?)
//!     .document(InventoryDocument::new("fisico.txt", SourceTag::Physical, physical_text))
//!     .document(InventoryDocument::new("inicial.txt", SourceTag::Initial, initial_text));
//!
//! let run = run_reconciliation(config, inputs)?;
//! println!("{}% critical", run.report.percentage_critical);
//! ```

pub mod balancer;
pub mod columns;
pub mod config;
pub mod error;
pub mod extraction;
pub mod ingestion;
pub mod matching;
pub mod pipeline;
pub mod report;
pub mod schema;
pub mod utils;

pub use balancer::{
    associate_facts, classify_balance, reconcile, BalanceCalculator, BalanceInputs, BalanceOutcome,
};
pub use columns::{resolve_columns, ColumnMap, FieldCandidates, MovementField};
pub use config::{
    BalanceConfig, ColumnOverrides, ExtractionConfig, MatcherKind, MovementConfig,
    ReconciliationConfig,
};
pub use error::{ReconciliationError, Result};
pub use extraction::{
    extract_inventory_facts, DocumentExtraction, ExtractionStrategy, FactExtractor,
    InventoryCandidate, InventoryDocument,
};
pub use ingestion::{
    aggregate_movements, parse_movement_row, Aggregation, MovementAggregator, MovementKind,
    MovementTotals, RowIssue, RowWarning, SourceInfo, SourceSummary,
};
pub use matching::{matcher_from_config, ContainmentMatcher, NameMatcher, TokenOverlapMatcher};
pub use pipeline::{
    Diagnostic, MovementSource, ReconciliationInputs, ReconciliationPipeline, ReconciliationRun,
};
pub use report::{build_report, ReconciliationReport, ReportFilter, SeverityCounts};
pub use schema::*;
pub use utils::*;

/// Runs the whole pipeline with `config`.
pub fn run_reconciliation(
    config: ReconciliationConfig,
    inputs: ReconciliationInputs,
) -> Result<ReconciliationRun> {
    ReconciliationPipeline::new(config).run(inputs)
}
