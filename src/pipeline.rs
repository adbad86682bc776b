use crate::balancer::{associate_facts, BalanceCalculator};
use crate::config::ReconciliationConfig;
use crate::error::{ReconciliationError, Result};
use crate::extraction::{DocumentExtraction, FactExtractor, InventoryDocument};
use crate::ingestion::{MovementAggregator, MovementTotals, SourceInfo, SourceSummary};
use crate::report::ReconciliationReport;
use crate::schema::{AggregatedProduct, InventoryFact, ReconciliationResult, SourceTag};
use crate::utils::normalize_key;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;

/// One movement file: its header and a lazily consumed row iterator.
pub struct MovementSource {
    pub name: String,
    pub header: Vec<String>,
    rows: Box<dyn Iterator<Item = Vec<String>> + Send>,
}

impl fmt::Debug for MovementSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MovementSource")
            .field("name", &self.name)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl MovementSource {
    pub fn new<I>(name: impl Into<String>, header: Vec<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = Vec<String>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            name: name.into(),
            header,
            rows: Box::new(rows.into_iter()),
        }
    }

    /// Streams a delimited file. Records the CSV parser rejects are logged
    /// and dropped; an empty file becomes an empty source.
    pub fn from_csv_reader<R>(name: impl Into<String>, reader: R, delimiter: u8) -> Result<Self>
    where
        R: io::Read + Send + 'static,
    {
        let name = name.into();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(delimiter)
            .from_reader(reader);

        let header: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

        let source_name = name.clone();
        let rows = reader
            .into_records()
            .filter_map(move |record| match record {
                Ok(record) => Some(record.iter().map(|cell| cell.to_string()).collect()),
                Err(e) => {
                    warn!("Dropping unreadable record in '{}': {}", source_name, e);
                    None
                }
            });

        Ok(Self {
            name,
            header,
            rows: Box::new(rows),
        })
    }

    pub fn from_csv_str(name: impl Into<String>, data: &str, delimiter: u8) -> Result<Self> {
        Self::from_csv_reader(name, io::Cursor::new(data.to_owned().into_bytes()), delimiter)
    }
}

#[derive(Debug, Default)]
pub struct ReconciliationInputs {
    pub movements: Vec<MovementSource>,
    pub documents: Vec<InventoryDocument>,
}

impl ReconciliationInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn movement(mut self, source: MovementSource) -> Self {
        self.movements.push(source);
        self
    }

    pub fn document(mut self, document: InventoryDocument) -> Self {
        self.documents.push(document);
        self
    }
}

/// Recoverable problems met during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    SkippedRow {
        source_name: String,
        row_number: usize,
        reason: String,
    },
    NoStructuredInventory {
        document: String,
        source_tag: SourceTag,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SkippedRow {
                source_name,
                row_number,
                reason,
            } => write!(f, "{} row {} skipped: {}", source_name, row_number, reason),
            Self::NoStructuredInventory {
                document,
                source_tag,
            } => write!(
                f,
                "no structured inventory found in document {} ({})",
                document, source_tag
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub generated_at: DateTime<Utc>,
    pub top_products: Vec<AggregatedProduct>,
    pub sources: Vec<SourceSummary>,
    pub extractions: Vec<DocumentExtraction>,
    pub report: ReconciliationReport,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct ReconciliationPipeline {
    config: ReconciliationConfig,
    extractor: FactExtractor,
}

impl ReconciliationPipeline {
    pub fn new(config: ReconciliationConfig) -> Self {
        let extractor = FactExtractor::new(config.extraction.clone());
        Self { config, extractor }
    }

    /// Swaps the extractor, e.g. to plug in a custom name matcher.
    pub fn with_extractor(mut self, extractor: FactExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub fn run(&self, inputs: ReconciliationInputs) -> Result<ReconciliationRun> {
        self.config.validate()?;

        if inputs.movements.is_empty() {
            return Err(ReconciliationError::MissingInput(
                "at least one movement source is required".into(),
            ));
        }

        info!(
            "Reconciling {} movement sources against {} inventory documents",
            inputs.movements.len(),
            inputs.documents.len()
        );

        let (totals, sources) = self.aggregate(inputs.movements)?;
        let top_products = totals.sales.top_n.clone();

        // Inventory-only products need every line, not just the ones
        // resembling a best seller.
        let targets: Vec<String> = if self.config.balance.include_inventory_only {
            Vec::new()
        } else {
            top_products.iter().map(|p| p.display_name.clone()).collect()
        };
        info!(
            "Extraction targets: {:?}",
            top_products
                .iter()
                .map(|p| p.display_name.as_str())
                .collect::<Vec<_>>()
        );

        let extractions = self.extractor.extract_all(&inputs.documents, &targets);
        let facts: Vec<InventoryFact> = extractions
            .iter()
            .flat_map(|e| e.facts.iter().cloned())
            .collect();

        let mut diagnostics: Vec<Diagnostic> = totals
            .sales
            .warnings
            .iter()
            .map(|w| Diagnostic::SkippedRow {
                source_name: w.source_name.clone(),
                row_number: w.row_number,
                reason: w.issue.to_string(),
            })
            .collect();
        diagnostics.extend(
            extractions
                .iter()
                .filter(|e| e.is_unstructured())
                .map(|e| Diagnostic::NoStructuredInventory {
                    document: e.document.clone(),
                    source_tag: e.source_tag,
                }),
        );

        let mut results = self.reconcile_products(&top_products, &totals, &facts);
        if self.config.balance.include_inventory_only {
            results.extend(self.reconcile_inventory_only(&totals, &facts));
        }

        let report = ReconciliationReport::build(results);

        Ok(ReconciliationRun {
            generated_at: Utc::now(),
            top_products,
            sources,
            extractions,
            report,
            diagnostics,
        })
    }

    fn aggregate(
        &self,
        movements: Vec<MovementSource>,
    ) -> Result<(MovementTotals, Vec<SourceSummary>)> {
        let movement_config = &self.config.movements;
        let aggregator = MovementAggregator::new(&movement_config.sale_codes)
            .with_purchase_codes(&movement_config.purchase_codes);
        let candidates = self.config.field_candidates();

        let outcomes: Vec<Result<SourceSummary>> = if movements.len() == 1 {
            movements
                .into_iter()
                .enumerate()
                .map(|(idx, source)| {
                    aggregator.ingest_rows(
                        &SourceInfo::new(idx, source.name),
                        &source.header,
                        source.rows,
                        &candidates,
                    )
                })
                .collect()
        } else {
            std::thread::scope(|scope| {
                let handles: Vec<_> = movements
                    .into_iter()
                    .enumerate()
                    .map(|(idx, source)| {
                        let aggregator = &aggregator;
                        let candidates = &candidates;
                        scope.spawn(move || {
                            aggregator.ingest_rows(
                                &SourceInfo::new(idx, source.name),
                                &source.header,
                                source.rows,
                                candidates,
                            )
                        })
                    })
                    .collect();

                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                    })
                    .collect()
            })
        };

        let sources = outcomes.into_iter().collect::<Result<Vec<_>>>()?;
        Ok((aggregator.finish(movement_config.top_n), sources))
    }

    fn reconcile_products(
        &self,
        products: &[AggregatedProduct],
        totals: &MovementTotals,
        facts: &[InventoryFact],
    ) -> Vec<ReconciliationResult> {
        let calculator = BalanceCalculator::new(&self.config.balance);
        products
            .iter()
            .map(|product| {
                let associated = associate_facts(
                    &product.display_name,
                    product.code.as_deref(),
                    facts,
                    self.extractor.matcher(),
                );
                calculator.reconcile(product, totals.purchased_quantity(&product.key), &associated)
            })
            .collect()
    }

    /// Facts that no sold product claims, grouped by their normalized name.
    fn reconcile_inventory_only(
        &self,
        totals: &MovementTotals,
        facts: &[InventoryFact],
    ) -> Vec<ReconciliationResult> {
        let matcher = self.extractor.matcher();
        let mut unsold: BTreeMap<String, (String, BTreeMap<SourceTag, InventoryFact>)> =
            BTreeMap::new();

        for fact in facts {
            let claimed = totals.sales.all.values().any(|product| {
                product.code.as_deref() == Some(fact.code.as_str())
                    || matcher.matches(&fact.name_raw, &product.display_name)
            });
            if claimed {
                continue;
            }

            let key = normalize_key(&fact.name_raw);
            let (_, snapshots) = unsold
                .entry(key)
                .or_insert_with(|| (fact.name_raw.clone(), BTreeMap::new()));
            snapshots
                .entry(fact.source_tag)
                .or_insert_with(|| fact.clone());
        }

        debug!("{} products found only in inventory", unsold.len());

        let calculator = BalanceCalculator::new(&self.config.balance);
        unsold
            .into_iter()
            .map(|(key, (display_name, snapshots))| {
                let purchased = totals.purchased_quantity(&key);
                calculator.reconcile_unsold(&key, &display_name, purchased, &snapshots)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconciliationConfig {
        let mut config = ReconciliationConfig::with_sale_codes(["5102", "5405"]);
        config.movements.purchase_codes = ["1102".to_string()].into();
        config
    }

    const LEDGER: &str = "\
produto;quantidade;valor_total;cfop
Arroz Tipo 1;30;150,00;5.102
Arroz Tipo 1;20;;1.102
Feijao Carioca;12;96,00;5405
Feijao Carioca;;;5405
";

    const PHYSICAL: &str = "\
001|ARROZ TIPO 1|42
002|FEIJAO CARIOCA|0
003|SAL MARINHO|7
";

    #[test]
    fn test_csv_source_and_run() {
        let source = MovementSource::from_csv_str("ledger.csv", LEDGER, b';').unwrap();
        let inputs = ReconciliationInputs::new()
            .movement(source)
            .document(InventoryDocument::new("fisico.txt", SourceTag::Physical, PHYSICAL))
            .document(InventoryDocument::new(
                "inicial.txt",
                SourceTag::Initial,
                "001|ARROZ TIPO 1|50\n002|FEIJAO CARIOCA|12\n003|SAL MARINHO|7\n",
            ));

        let run = ReconciliationPipeline::new(config()).run(inputs).unwrap();
        assert_eq!(run.top_products.len(), 2);
        assert_eq!(run.top_products[0].display_name, "Arroz Tipo 1");

        let arroz = run.report.get("arroz tipo 1").unwrap();
        assert_eq!(arroz.quantity_purchased, 20.0);
        assert_eq!(arroz.stock_expected, 40.0);
        assert_eq!(arroz.discrepancy, 2.0);
        assert_eq!(arroz.total_value_sold, 150.0);

        let feijao = run.report.get("feijao carioca").unwrap();
        assert_eq!(feijao.stock_expected, 0.0);
        assert_eq!(feijao.discrepancy, 0.0);

        assert!(run.report.get("sal marinho").is_none());
        assert_eq!(run.diagnostics.len(), 1);
        assert!(matches!(
            run.diagnostics[0],
            Diagnostic::SkippedRow { row_number: 5, .. }
        ));
    }

    #[test]
    fn test_inventory_only_products() {
        let mut config = config();
        config.balance.include_inventory_only = true;

        let source = MovementSource::from_csv_str("ledger.csv", LEDGER, b';').unwrap();
        let inputs = ReconciliationInputs::new()
            .movement(source)
            .document(InventoryDocument::new("fisico.txt", SourceTag::Physical, PHYSICAL));

        let run = ReconciliationPipeline::new(config).run(inputs).unwrap();
        let sal = run.report.get("sal marinho").unwrap();
        assert_eq!(sal.quantity_sold, 0.0);
        assert_eq!(sal.stock_final, Some(7.0));
        assert_eq!(sal.severity, crate::schema::Severity::Alert);
        assert_eq!(run.report.results.len(), 3);
    }

    #[test]
    fn test_missing_movements_is_fatal() {
        let err = ReconciliationPipeline::new(config())
            .run(ReconciliationInputs::new())
            .unwrap_err();
        assert!(matches!(err, ReconciliationError::MissingInput(_)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let source = MovementSource::new("empty", Vec::new(), Vec::new());
        let err = ReconciliationPipeline::new(ReconciliationConfig::default())
            .run(ReconciliationInputs::new().movement(source))
            .unwrap_err();
        assert!(matches!(err, ReconciliationError::InvalidConfig(_)));
    }

    #[test]
    fn test_empty_csv_is_valid_empty_run() {
        let source = MovementSource::from_csv_str("empty.csv", "", b',').unwrap();
        let run = ReconciliationPipeline::new(config())
            .run(ReconciliationInputs::new().movement(source))
            .unwrap();
        assert!(run.report.is_empty());
        assert!(run.top_products.is_empty());
    }

    #[test]
    fn test_diagnostic_display() {
        let d = Diagnostic::NoStructuredInventory {
            document: "contabil.pdf".into(),
            source_tag: SourceTag::Accounting,
        };
        assert_eq!(
            d.to_string(),
            "no structured inventory found in document contabil.pdf (accounting)"
        );
    }
}
