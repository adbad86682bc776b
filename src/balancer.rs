use crate::config::BalanceConfig;
use crate::matching::NameMatcher;
use crate::schema::{AggregatedProduct, InventoryFact, ReconciliationResult, Severity, SourceTag};
use crate::utils::format_quantity;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// The scalar core of a reconciliation. Absent snapshots stay `None`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceInputs {
    pub initial: Option<f64>,
    pub purchased: f64,
    pub sold: f64,
    pub actual: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceOutcome {
    pub stock_expected: f64,
    pub discrepancy: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub notes: Vec<String>,
}

/// Classifies one product from its quantities alone.
pub fn classify_balance(inputs: &BalanceInputs, threshold_ratio: f64) -> BalanceOutcome {
    let initial = inputs.initial.unwrap_or(0.0);
    let stock_expected = initial + inputs.purchased - inputs.sold;
    let threshold = if inputs.sold > 0.0 {
        threshold_ratio * inputs.sold
    } else {
        0.0
    };

    let Some(actual) = inputs.actual else {
        return BalanceOutcome {
            stock_expected,
            discrepancy: inputs.sold,
            threshold,
            severity: Severity::Critical,
            notes: vec!["sold with no recorded inventory: no inventory snapshot found".to_string()],
        };
    };

    let discrepancy = actual - stock_expected;
    let mut notes = Vec::new();

    let severity = if initial == 0.0 && inputs.sold > 0.0 {
        notes.push("sold without any starting inventory".to_string());
        Severity::Critical
    } else if discrepancy.abs() > threshold && discrepancy < 0.0 {
        notes.push(format!(
            "shortage of {} against expected {}",
            format_quantity(-discrepancy),
            format_quantity(stock_expected)
        ));
        Severity::Critical
    } else if discrepancy.abs() > threshold && discrepancy > 0.0 {
        notes.push(format!(
            "surplus of {} against expected {}",
            format_quantity(discrepancy),
            format_quantity(stock_expected)
        ));
        Severity::Alert
    } else {
        Severity::Ok
    };

    BalanceOutcome {
        stock_expected,
        discrepancy,
        threshold,
        severity,
        notes,
    }
}

/// Picks, per source tag, the fact describing one product: an exact code
/// match first, then the first fact whose name the matcher accepts.
pub fn associate_facts(
    display_name: &str,
    code: Option<&str>,
    facts: &[InventoryFact],
    matcher: &dyn NameMatcher,
) -> BTreeMap<SourceTag, InventoryFact> {
    let mut chosen: BTreeMap<SourceTag, InventoryFact> = BTreeMap::new();

    if let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) {
        for fact in facts.iter().filter(|f| f.code == code) {
            chosen.entry(fact.source_tag).or_insert_with(|| fact.clone());
        }
    }

    for fact in facts {
        if chosen.contains_key(&fact.source_tag) {
            continue;
        }
        if matcher.matches(&fact.name_raw, display_name) {
            chosen.insert(fact.source_tag, fact.clone());
        }
    }

    chosen
}

pub struct BalanceCalculator<'a> {
    config: &'a BalanceConfig,
}

impl<'a> BalanceCalculator<'a> {
    pub fn new(config: &'a BalanceConfig) -> Self {
        Self { config }
    }

    pub fn reconcile(
        &self,
        product: &AggregatedProduct,
        purchased: f64,
        facts: &BTreeMap<SourceTag, InventoryFact>,
    ) -> ReconciliationResult {
        self.build(
            ProductTotals {
                key: &product.key,
                display_name: &product.display_name,
                code: product.code.as_deref(),
                sold: product.total_quantity,
                value_sold: product.total_value,
                purchased,
                transaction_codes: &product.transaction_codes_used,
            },
            facts,
        )
    }

    /// Reconciles a product that appears in inventory but was never sold.
    pub fn reconcile_unsold(
        &self,
        key: &str,
        display_name: &str,
        purchased: f64,
        facts: &BTreeMap<SourceTag, InventoryFact>,
    ) -> ReconciliationResult {
        let no_codes = BTreeSet::new();
        self.build(
            ProductTotals {
                key,
                display_name,
                code: None,
                sold: 0.0,
                value_sold: 0.0,
                purchased,
                transaction_codes: &no_codes,
            },
            facts,
        )
    }

    fn build(
        &self,
        totals: ProductTotals<'_>,
        facts: &BTreeMap<SourceTag, InventoryFact>,
    ) -> ReconciliationResult {
        let snapshots: BTreeMap<SourceTag, f64> = facts
            .iter()
            .map(|(tag, fact)| (*tag, fact.quantity))
            .collect();

        let final_states: Vec<(SourceTag, f64)> = SourceTag::FINAL_STATE_PRIORITY
            .iter()
            .filter_map(|tag| snapshots.get(tag).map(|q| (*tag, *q)))
            .collect();

        let inputs = BalanceInputs {
            initial: snapshots.get(&SourceTag::Initial).copied(),
            purchased: totals.purchased,
            sold: totals.sold,
            actual: final_states.first().map(|(_, q)| *q),
        };
        let outcome = classify_balance(&inputs, self.config.threshold_ratio);

        let divergent_sources = final_states
            .first()
            .is_some_and(|(_, first)| final_states.iter().any(|(_, q)| q != first));

        let mut notes = outcome.notes;
        if divergent_sources {
            let values: Vec<String> = final_states
                .iter()
                .map(|(tag, q)| format!("{}: {}", tag, format_quantity(*q)))
                .collect();
            notes.push(format!("divergent sources ({})", values.join(", ")));
        }

        let code = totals
            .code
            .map(str::to_string)
            .or_else(|| facts.values().next().map(|f| f.code.clone()));

        debug!(
            "Reconciled '{}': sold {}, expected {}, discrepancy {}, {}",
            totals.key,
            totals.sold,
            outcome.stock_expected,
            outcome.discrepancy,
            outcome.severity
        );

        ReconciliationResult {
            product_key: totals.key.to_string(),
            display_name: totals.display_name.to_string(),
            code,
            quantity_sold: totals.sold,
            quantity_purchased: totals.purchased,
            total_value_sold: totals.value_sold,
            stock_initial: inputs.initial.unwrap_or(0.0),
            stock_final: inputs.actual,
            stock_expected: outcome.stock_expected,
            discrepancy: outcome.discrepancy,
            severity: outcome.severity,
            divergent_sources,
            snapshots,
            transaction_codes_used: totals.transaction_codes.clone(),
            observations: notes.join("; "),
        }
    }
}

struct ProductTotals<'a> {
    key: &'a str,
    display_name: &'a str,
    code: Option<&'a str>,
    sold: f64,
    value_sold: f64,
    purchased: f64,
    transaction_codes: &'a BTreeSet<String>,
}

/// Reconciles one product with the default threshold.
pub fn reconcile(
    aggregated: &AggregatedProduct,
    purchased: f64,
    facts_by_source_tag: &BTreeMap<SourceTag, InventoryFact>,
) -> ReconciliationResult {
    BalanceCalculator::new(&BalanceConfig::default()).reconcile(
        aggregated,
        purchased,
        facts_by_source_tag,
    )
}
