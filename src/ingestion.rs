use crate::columns::{resolve_columns, ColumnMap, FieldCandidates, MovementField};
use crate::error::{ReconciliationError, Result};
use crate::schema::{AggregatedProduct, MovementRow};
use crate::utils::{normalize_key, normalize_transaction_code, parse_number};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Identifies one movement file within an aggregation pass. The index
/// orders sources for first-seen tie-breaking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub index: usize,
    pub name: String,
}

impl SourceInfo {
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RowIssue {
    MissingName,
    MissingQuantity,
    MissingTransactionCode,
    InvalidQuantity(String),
}

impl fmt::Display for RowIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingName => write!(f, "missing product name"),
            Self::MissingQuantity => write!(f, "missing quantity"),
            Self::MissingTransactionCode => write!(f, "missing transaction code"),
            Self::InvalidQuantity(raw) => {
                write!(f, "quantity '{}' is not a non-negative number", raw)
            }
        }
    }
}

/// A data row that was skipped. `row_number` counts the header as row 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowWarning {
    pub source_index: usize,
    pub source_name: String,
    pub row_number: usize,
    pub issue: RowIssue,
}

impl fmt::Display for RowWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} row {}: {}",
            self.source_name, self.row_number, self.issue
        )
    }
}

/// Builds a [`MovementRow`] from raw cells, or explains why the row is
/// unusable.
pub fn parse_movement_row(
    columns: &ColumnMap,
    cells: &[String],
) -> std::result::Result<MovementRow, RowIssue> {
    let name = columns
        .cell(MovementField::ProductName, cells)
        .ok_or(RowIssue::MissingName)?;

    let quantity_raw = columns
        .cell(MovementField::Quantity, cells)
        .ok_or(RowIssue::MissingQuantity)?;

    let transaction_code = columns
        .cell(MovementField::TransactionCode, cells)
        .map(normalize_transaction_code)
        .filter(|code| !code.is_empty())
        .ok_or(RowIssue::MissingTransactionCode)?;

    let quantity = parse_number(quantity_raw)
        .filter(|q| *q >= 0.0)
        .ok_or_else(|| RowIssue::InvalidQuantity(quantity_raw.to_string()))?;

    Ok(MovementRow {
        product_name_raw: name.to_string(),
        code: columns
            .cell(MovementField::Code, cells)
            .map(|c| c.to_string()),
        quantity,
        unit_value: columns
            .cell(MovementField::UnitValue, cells)
            .and_then(parse_number),
        total_value: total_value_cell(columns, cells).and_then(parse_number),
        transaction_code,
    })
}

/// A column that also resolved as the unit value holds unit prices, not totals.
fn total_value_cell<'a>(columns: &ColumnMap, cells: &'a [String]) -> Option<&'a str> {
    let total = columns.index(MovementField::TotalValue)?;
    if columns.index(MovementField::UnitValue) == Some(total) {
        return None;
    }
    columns.cell(MovementField::TotalValue, cells)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementKind {
    Sale,
    Purchase,
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source_name: String,
    pub rows_read: usize,
    pub sale_rows: usize,
    pub purchase_rows: usize,
    pub skipped_rows: usize,
}

struct Accumulator {
    product: AggregatedProduct,
    first_seen: (usize, usize),
}

impl Accumulator {
    fn add(&mut self, row: &MovementRow, position: (usize, usize)) {
        self.product.total_quantity += row.quantity;
        self.product.total_value += row.effective_total_value();
        self.product
            .transaction_codes_used
            .insert(row.transaction_code.clone());
        if self.product.code.is_none() {
            self.product.code = row.code.clone();
        }
        // Sources may be ingested out of order; keep the earliest position.
        if position < self.first_seen {
            self.first_seen = position;
            self.product.display_name = row.product_name_raw.trim().to_string();
            if row.code.is_some() {
                self.product.code = row.code.clone();
            }
        }
    }
}

#[derive(Default)]
struct LedgerState {
    sales: HashMap<String, Accumulator>,
    purchases: HashMap<String, Accumulator>,
    warnings: Vec<RowWarning>,
    rows_read: usize,
}

fn accumulate_into(
    map: &mut HashMap<String, Accumulator>,
    key: String,
    row: &MovementRow,
    position: (usize, usize),
) {
    match map.get_mut(&key) {
        Some(acc) => acc.add(row, position),
        None => {
            let mut acc = Accumulator {
                product: AggregatedProduct {
                    key: key.clone(),
                    display_name: row.product_name_raw.trim().to_string(),
                    code: row.code.clone(),
                    total_quantity: 0.0,
                    total_value: 0.0,
                    transaction_codes_used: BTreeSet::new(),
                },
                first_seen: position,
            };
            acc.add(row, position);
            map.insert(key, acc);
        }
    }
}

/// Per-product totals produced by one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    /// Best-selling products, descending by quantity, ties by first-seen order.
    pub top_n: Vec<AggregatedProduct>,
    pub all: BTreeMap<String, AggregatedProduct>,
    pub warnings: Vec<RowWarning>,
    pub rows_read: usize,
}

impl Aggregation {
    pub fn get(&self, key: &str) -> Option<&AggregatedProduct> {
        self.all.get(key)
    }

    pub fn find_by_code(&self, code: &str) -> Option<&AggregatedProduct> {
        self.all
            .values()
            .find(|p| p.code.as_deref() == Some(code))
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

/// Sales ranked for extraction plus purchase totals for the balance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovementTotals {
    pub sales: Aggregation,
    pub purchases: BTreeMap<String, AggregatedProduct>,
}

impl MovementTotals {
    pub fn purchased_quantity(&self, key: &str) -> f64 {
        self.purchases
            .get(key)
            .map(|p| p.total_quantity)
            .unwrap_or(0.0)
    }
}

/// Streams movement rows into per-product totals.
///
/// The aggregator is `Sync`: several sources may be ingested concurrently
/// from different threads. All accumulation goes through a single mutex.
pub struct MovementAggregator {
    sale_codes: BTreeSet<String>,
    purchase_codes: BTreeSet<String>,
    state: Mutex<LedgerState>,
}

impl MovementAggregator {
    pub fn new<I, S>(sale_codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            sale_codes: normalize_codes(sale_codes),
            purchase_codes: BTreeSet::new(),
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn with_purchase_codes<I, S>(mut self, purchase_codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.purchase_codes = normalize_codes(purchase_codes);
        self
    }

    pub fn sale_codes(&self) -> &BTreeSet<String> {
        &self.sale_codes
    }

    pub fn classify(&self, transaction_code: &str) -> MovementKind {
        if self.sale_codes.contains(transaction_code) {
            MovementKind::Sale
        } else if self.purchase_codes.contains(transaction_code) {
            MovementKind::Purchase
        } else {
            MovementKind::Ignored
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds one parsed row. Rows whose code is neither a sale nor a purchase
    /// leave no trace.
    pub fn accumulate(
        &self,
        row: &MovementRow,
        source_index: usize,
        row_number: usize,
    ) -> MovementKind {
        let kind = self.classify(&row.transaction_code);
        let position = (source_index, row_number);

        match kind {
            MovementKind::Sale => {
                let key = normalize_key(&row.product_name_raw);
                accumulate_into(&mut self.lock().sales, key, row, position);
            }
            MovementKind::Purchase => {
                let key = normalize_key(&row.product_name_raw);
                accumulate_into(&mut self.lock().purchases, key, row, position);
            }
            MovementKind::Ignored => {}
        }

        kind
    }

    /// Resolves the header once, then consumes `rows` one at a time.
    ///
    /// An empty header is treated as an empty source. A header that lacks a
    /// required column is fatal for the source.
    pub fn ingest_rows<I>(
        &self,
        source: &SourceInfo,
        header: &[String],
        rows: I,
        candidates: &FieldCandidates,
    ) -> Result<SourceSummary>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let mut summary = SourceSummary {
            source_name: source.name.clone(),
            ..SourceSummary::default()
        };

        let Some(columns) = self.prepare_columns(source, header, candidates)? else {
            return Ok(summary);
        };

        for (offset, cells) in rows.into_iter().enumerate() {
            self.ingest_one(source, &columns, offset + 2, &cells, &mut summary);
        }

        self.finish_source(&summary);
        Ok(summary)
    }

    /// Same as [`ingest_rows`](Self::ingest_rows) for rows that arrive from
    /// asynchronous I/O. Dropping the future abandons the source.
    pub async fn ingest_stream<S>(
        &self,
        source: &SourceInfo,
        header: &[String],
        rows: S,
        candidates: &FieldCandidates,
    ) -> Result<SourceSummary>
    where
        S: Stream<Item = Vec<String>>,
    {
        let mut summary = SourceSummary {
            source_name: source.name.clone(),
            ..SourceSummary::default()
        };

        let Some(columns) = self.prepare_columns(source, header, candidates)? else {
            return Ok(summary);
        };

        futures::pin_mut!(rows);
        let mut row_number = 1;
        while let Some(cells) = rows.next().await {
            row_number += 1;
            self.ingest_one(source, &columns, row_number, &cells, &mut summary);
        }

        self.finish_source(&summary);
        Ok(summary)
    }

    fn prepare_columns(
        &self,
        source: &SourceInfo,
        header: &[String],
        candidates: &FieldCandidates,
    ) -> Result<Option<ColumnMap>> {
        if header.iter().all(|h| h.trim().is_empty()) {
            warn!("Movement source '{}' has no header; treating it as empty", source.name);
            return Ok(None);
        }

        let columns = resolve_columns(header, candidates);
        let missing = columns.missing_required();
        if !missing.is_empty() {
            return Err(ReconciliationError::MissingColumns {
                source_name: source.name.clone(),
                fields: missing.iter().map(|f| f.to_string()).collect(),
            });
        }

        debug!("Movement source '{}' column map: {:?}", source.name, columns);
        Ok(Some(columns))
    }

    fn ingest_one(
        &self,
        source: &SourceInfo,
        columns: &ColumnMap,
        row_number: usize,
        cells: &[String],
        summary: &mut SourceSummary,
    ) {
        summary.rows_read += 1;

        match parse_movement_row(columns, cells) {
            Ok(row) => match self.accumulate(&row, source.index, row_number) {
                MovementKind::Sale => summary.sale_rows += 1,
                MovementKind::Purchase => summary.purchase_rows += 1,
                MovementKind::Ignored => {}
            },
            Err(issue) => {
                let warning = RowWarning {
                    source_index: source.index,
                    source_name: source.name.clone(),
                    row_number,
                    issue,
                };
                warn!("Skipping movement row: {}", warning);
                summary.skipped_rows += 1;
                self.lock().warnings.push(warning);
            }
        }
    }

    fn finish_source(&self, summary: &SourceSummary) {
        self.lock().rows_read += summary.rows_read;
        info!(
            "Movement source '{}': {} rows read, {} sales, {} purchases, {} skipped",
            summary.source_name,
            summary.rows_read,
            summary.sale_rows,
            summary.purchase_rows,
            summary.skipped_rows
        );
    }

    /// Closes the pass and ranks the sold products.
    pub fn finish(self, top_n: usize) -> MovementTotals {
        let state = self
            .state
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut ranked: Vec<Accumulator> = state.sales.into_values().collect();
        ranked.sort_by(|a, b| {
            b.product
                .total_quantity
                .total_cmp(&a.product.total_quantity)
                .then(a.first_seen.cmp(&b.first_seen))
        });

        let top: Vec<AggregatedProduct> = ranked
            .iter()
            .take(top_n)
            .map(|acc| acc.product.clone())
            .collect();

        let all: BTreeMap<String, AggregatedProduct> = ranked
            .into_iter()
            .map(|acc| (acc.product.key.clone(), acc.product))
            .collect();

        let purchases: BTreeMap<String, AggregatedProduct> = state
            .purchases
            .into_iter()
            .map(|(key, acc)| (key, acc.product))
            .collect();

        let mut warnings = state.warnings;
        warnings.sort_by_key(|w| (w.source_index, w.row_number));

        info!(
            "Aggregated {} sold products and {} purchased products from {} rows",
            all.len(),
            purchases.len(),
            state.rows_read
        );

        MovementTotals {
            sales: Aggregation {
                top_n: top,
                all,
                warnings,
                rows_read: state.rows_read,
            },
            purchases,
        }
    }
}

fn normalize_codes<I, S>(codes: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    codes
        .into_iter()
        .map(|c| normalize_transaction_code(c.as_ref()))
        .filter(|c| !c.is_empty())
        .collect()
}

/// One-shot aggregation of a single movement source.
pub fn aggregate_movements<I, S>(
    header: &[String],
    rows: I,
    counted_codes: &[S],
    top_n: usize,
) -> Result<Aggregation>
where
    I: IntoIterator<Item = Vec<String>>,
    S: AsRef<str>,
{
    let aggregator = MovementAggregator::new(counted_codes);
    aggregator.ingest_rows(
        &SourceInfo::new(0, "movements"),
        header,
        rows,
        &FieldCandidates::movement_defaults(),
    )?;
    Ok(aggregator.finish(top_n).sales)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn header() -> Vec<String> {
        cells(&["codigo", "produto", "quantidade", "valor_total", "cfop"])
    }

    #[test]
    fn test_sums_counted_codes() {
        let rows = vec![
            cells(&["001", "X", "100", "500", "5101"]),
            cells(&["001", "X", "50", "250", "5102"]),
        ];
        let agg = aggregate_movements(&header(), rows, &["5101", "5102"], 10).unwrap();

        let x = agg.get("x").unwrap();
        assert_eq!(x.total_quantity, 150.0);
        assert_eq!(x.total_value, 750.0);
        assert_eq!(
            x.transaction_codes_used,
            BTreeSet::from(["5101".to_string(), "5102".to_string()])
        );
        assert_eq!(x.code.as_deref(), Some("001"));
        assert_eq!(agg.top_n.len(), 1);
    }

    #[test]
    fn test_uncounted_codes_create_no_entry() {
        let rows = vec![
            cells(&["001", "X", "100", "", "5101"]),
            cells(&["002", "Y", "999", "", "1102"]),
        ];
        let agg = aggregate_movements(&header(), rows, &["5101"], 10).unwrap();
        assert!(agg.get("y").is_none());
        assert_eq!(agg.all.len(), 1);
    }

    #[test]
    fn test_key_folds_case_and_spacing() {
        let rows = vec![
            cells(&["", "  Nescau  Cereal ", "3", "", "5102"]),
            cells(&["", "NESCAU CEREAL", "4", "", "5.102"]),
        ];
        let agg = aggregate_movements(&header(), rows, &["5102"], 10).unwrap();
        let product = agg.get("nescau cereal").unwrap();
        assert_eq!(product.total_quantity, 7.0);
        assert_eq!(product.display_name, "Nescau  Cereal");
    }

    #[test]
    fn test_malformed_rows_are_skipped_with_warnings() {
        let rows = vec![
            cells(&["001", "", "10", "", "5102"]),
            cells(&["002", "B", "", "", "5102"]),
            cells(&["003", "C", "5", "", ""]),
            cells(&["004", "D", "-2", "", "5102"]),
            cells(&["005", "E", "abc", "", "5102"]),
            cells(&["006", "F", "8", "", "5102"]),
        ];
        let agg = aggregate_movements(&header(), rows, &["5102"], 10).unwrap();

        assert_eq!(agg.all.len(), 1);
        assert_eq!(agg.rows_read, 6);
        let issues: Vec<&RowIssue> = agg.warnings.iter().map(|w| &w.issue).collect();
        assert_eq!(
            issues,
            vec![
                &RowIssue::MissingName,
                &RowIssue::MissingQuantity,
                &RowIssue::MissingTransactionCode,
                &RowIssue::InvalidQuantity("-2".to_string()),
                &RowIssue::InvalidQuantity("abc".to_string()),
            ]
        );
        assert_eq!(agg.warnings[0].row_number, 2);
    }

    #[test]
    fn test_short_rows_do_not_panic() {
        let rows = vec![cells(&["001", "X"]), cells(&[])];
        let agg = aggregate_movements(&header(), rows, &["5102"], 10).unwrap();
        assert!(agg.is_empty());
        assert_eq!(agg.warnings.len(), 2);
    }

    #[test]
    fn test_ranking_stable_by_first_seen() {
        let rows = vec![
            cells(&["", "B", "10", "", "5102"]),
            cells(&["", "A", "10", "", "5102"]),
            cells(&["", "C", "30", "", "5102"]),
            cells(&["", "D", "5", "", "5102"]),
        ];
        let agg = aggregate_movements(&header(), rows, &["5102"], 3).unwrap();
        let names: Vec<&str> = agg.top_n.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, vec!["C", "B", "A"]);
        assert_eq!(agg.all.len(), 4);
    }

    #[test]
    fn test_empty_and_header_only_inputs() {
        let agg = aggregate_movements(&[], Vec::new(), &["5102"], 10).unwrap();
        assert!(agg.is_empty());

        let agg = aggregate_movements(&header(), Vec::new(), &["5102"], 10).unwrap();
        assert!(agg.is_empty());
        assert!(agg.top_n.is_empty());
    }

    #[test]
    fn test_missing_required_column_is_fatal() {
        let err = aggregate_movements(&cells(&["produto", "qtd"]), Vec::new(), &["5102"], 10)
            .unwrap_err();
        match err {
            ReconciliationError::MissingColumns { source_name, fields } => {
                assert_eq!(source_name, "movements");
                assert_eq!(fields, vec!["transaction_code".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sales_and_purchases_in_one_pass() {
        let aggregator = MovementAggregator::new(["5102"]).with_purchase_codes(["1.102"]);
        let rows = vec![
            cells(&["001", "X", "30", "", "5102"]),
            cells(&["001", "X", "20", "", "1102"]),
            cells(&["002", "Y", "7", "", "1102"]),
        ];
        let summary = aggregator
            .ingest_rows(
                &SourceInfo::new(0, "ledger.csv"),
                &header(),
                rows,
                &FieldCandidates::movement_defaults(),
            )
            .unwrap();
        assert_eq!(summary.sale_rows, 1);
        assert_eq!(summary.purchase_rows, 2);

        let totals = aggregator.finish(10);
        assert_eq!(totals.sales.get("x").unwrap().total_quantity, 30.0);
        assert_eq!(totals.purchased_quantity("x"), 20.0);
        assert_eq!(totals.purchased_quantity("y"), 7.0);
        assert_eq!(totals.purchased_quantity("z"), 0.0);
        assert!(totals.sales.get("y").is_none());
    }

    #[test]
    fn test_concurrent_sources_rank_deterministically() {
        let aggregator = MovementAggregator::new(["5102"]);
        let candidates = FieldCandidates::movement_defaults();
        let first = vec![cells(&["", "Late", "10", "", "5102"])];
        let second = vec![cells(&["", "Early", "10", "", "5102"])];

        // Ingest the second source before the first; source index decides ties.
        std::thread::scope(|scope| {
            scope.spawn(|| {
                aggregator
                    .ingest_rows(&SourceInfo::new(1, "b.csv"), &header(), second, &candidates)
                    .unwrap()
            });
        });
        std::thread::scope(|scope| {
            scope.spawn(|| {
                aggregator
                    .ingest_rows(&SourceInfo::new(0, "a.csv"), &header(), first, &candidates)
                    .unwrap()
            });
        });

        let totals = aggregator.finish(10);
        let names: Vec<&str> = totals
            .sales
            .top_n
            .iter()
            .map(|p| p.display_name.as_str())
            .collect();
        assert_eq!(names, vec!["Late", "Early"]);
    }

    #[test]
    fn test_ingest_stream() {
        let aggregator = MovementAggregator::new(["5102"]);
        let rows = futures::stream::iter(vec![
            cells(&["001", "X", "2", "", "5102"]),
            cells(&["001", "X", "3", "", "5102"]),
            cells(&["001", "X", "oops", "", "5102"]),
        ]);
        let summary = futures::executor::block_on(aggregator.ingest_stream(
            &SourceInfo::new(0, "stream"),
            &header(),
            rows,
            &FieldCandidates::movement_defaults(),
        ))
        .unwrap();
        assert_eq!(summary.rows_read, 3);
        assert_eq!(summary.skipped_rows, 1);

        let totals = aggregator.finish(10);
        assert_eq!(totals.sales.get("x").unwrap().total_quantity, 5.0);
        assert_eq!(totals.sales.warnings[0].row_number, 4);
    }

    #[test]
    fn test_unit_value_fills_missing_total() {
        let header = cells(&["produto", "qtd", "vl_unit", "cfop"]);
        let rows = vec![cells(&["X", "4", "2,50", "5102"])];
        let agg = aggregate_movements(&header, rows, &["5102"], 10).unwrap();
        assert_eq!(agg.get("x").unwrap().total_value, 10.0);
    }

    #[test]
    fn test_rows_keyed_by_description_not_code() {
        let header = cells(&["codigo_produto", "descricao", "qtd", "cfop"]);
        let rows = vec![
            cells(&["001", "ARROZ TIPO 1", "10", "5102"]),
            cells(&["002", "FEIJAO CARIOCA", "4", "5102"]),
        ];
        let agg = aggregate_movements(&header, rows, &["5102"], 10).unwrap();
        let keys: Vec<&str> = agg.all.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["arroz tipo 1", "feijao carioca"]);
        assert_eq!(agg.get("arroz tipo 1").unwrap().code.as_deref(), Some("001"));
    }

    #[test]
    fn test_shared_unit_column_is_not_a_total() {
        let header = cells(&["produto", "qtd", "valor_unitario", "cfop"]);
        let rows = vec![cells(&["X", "4", "2,50", "5102"])];
        let agg = aggregate_movements(&header, rows, &["5102"], 10).unwrap();
        assert_eq!(agg.get("x").unwrap().total_value, 10.0);
    }
}
