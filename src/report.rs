use crate::error::Result;
use crate::schema::{ReconciliationResult, Severity};
use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SeverityCounts {
    pub critical: usize,
    pub alert: usize,
    pub ok: usize,
}

impl SeverityCounts {
    pub fn get(&self, severity: Severity) -> usize {
        match severity {
            Severity::Critical => self.critical,
            Severity::Alert => self.alert,
            Severity::Ok => self.ok,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.alert + self.ok
    }

    fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::Alert => self.alert += 1,
            Severity::Ok => self.ok += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[schemars(description = "Reconciliation of sold products against inventory snapshots")]
pub struct ReconciliationReport {
    pub counts: SeverityCounts,

    #[schemars(description = "round(critical / total * 100); 0 for an empty report")]
    pub percentage_critical: u32,

    pub total_quantity_sold: f64,
    pub total_value_sold: f64,

    #[schemars(description = "Products whose closing snapshots disagree")]
    pub divergent_count: usize,

    #[schemars(
        description = "Sorted by severity (CRITICAL, ALERT, OK), then absolute discrepancy descending, then product key"
    )]
    pub results: Vec<ReconciliationResult>,
}

fn compare_results(a: &ReconciliationResult, b: &ReconciliationResult) -> Ordering {
    a.severity
        .rank()
        .cmp(&b.severity.rank())
        .then_with(|| b.discrepancy.abs().total_cmp(&a.discrepancy.abs()))
        .then_with(|| a.product_key.cmp(&b.product_key))
}

impl ReconciliationReport {
    pub fn build(mut results: Vec<ReconciliationResult>) -> Self {
        results.sort_by(compare_results);

        let mut counts = SeverityCounts::default();
        let mut total_quantity_sold = 0.0;
        let mut total_value_sold = 0.0;
        let mut divergent_count = 0;

        for result in &results {
            counts.record(result.severity);
            total_quantity_sold += result.quantity_sold;
            total_value_sold += result.total_value_sold;
            if result.divergent_sources {
                divergent_count += 1;
            }
        }

        let percentage_critical = if counts.total() == 0 {
            0
        } else {
            (counts.critical as f64 / counts.total() as f64 * 100.0).round() as u32
        };

        info!(
            "Report: {} products, {} critical ({}%), {} alert, {} ok, {} divergent",
            counts.total(),
            counts.critical,
            percentage_critical,
            counts.alert,
            counts.ok,
            divergent_count
        );

        Self {
            counts,
            percentage_critical,
            total_quantity_sold,
            total_value_sold,
            divergent_count,
            results,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, product_key: &str) -> Option<&ReconciliationResult> {
        self.results.iter().find(|r| r.product_key == product_key)
    }

    /// Results accepted by `filter`, in report order.
    pub fn filter(&self, filter: &ReportFilter) -> Vec<&ReconciliationResult> {
        self.results.iter().filter(|r| filter.matches(r)).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::WriterBuilder::new().from_writer(writer);

        csv.write_record([
            "severity",
            "product_key",
            "display_name",
            "code",
            "quantity_sold",
            "quantity_purchased",
            "total_value_sold",
            "stock_initial",
            "stock_final",
            "stock_expected",
            "discrepancy",
            "divergent_sources",
            "transaction_codes",
            "observations",
        ])?;

        for r in &self.results {
            let codes: Vec<&str> = r.transaction_codes_used.iter().map(String::as_str).collect();
            csv.write_record([
                r.severity.as_str(),
                &r.product_key,
                &r.display_name,
                r.code.as_deref().unwrap_or(""),
                &r.quantity_sold.to_string(),
                &r.quantity_purchased.to_string(),
                &r.total_value_sold.to_string(),
                &r.stock_initial.to_string(),
                &r.stock_final.map(|v| v.to_string()).unwrap_or_default(),
                &r.stock_expected.to_string(),
                &r.discrepancy.to_string(),
                &r.divergent_sources.to_string(),
                &codes.join("|"),
                &r.observations,
            ])?;
        }

        csv.flush()?;
        Ok(())
    }

    pub fn to_csv_string(&self) -> Result<String> {
        let mut buffer = Vec::new();
        self.to_csv(&mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ReconciliationReport)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

/// Narrows a report for presentation. Empty criteria accept everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportFilter {
    pub severity: Option<Severity>,
    /// Case-insensitive substring over display name, key and code.
    pub search: Option<String>,
    pub divergent_only: bool,
}

impl ReportFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        let text = text.into().trim().to_lowercase();
        self.search = if text.is_empty() { None } else { Some(text) };
        self
    }

    pub fn divergent_only(mut self) -> Self {
        self.divergent_only = true;
        self
    }

    pub fn matches(&self, result: &ReconciliationResult) -> bool {
        if self.severity.is_some_and(|s| s != result.severity) {
            return false;
        }
        if self.divergent_only && !result.divergent_sources {
            return false;
        }
        match &self.search {
            Some(needle) => {
                let needle = needle.to_lowercase();
                result.display_name.to_lowercase().contains(&needle)
                    || result.product_key.contains(&needle)
                    || result
                        .code
                        .as_deref()
                        .is_some_and(|c| c.to_lowercase().contains(&needle))
            }
            None => true,
        }
    }
}

pub fn build_report(results: Vec<ReconciliationResult>) -> ReconciliationReport {
    ReconciliationReport::build(results)
}
