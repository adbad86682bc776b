use crate::error::ReconciliationError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Identifies which inventory reading a fact came from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    #[schemars(description = "Opening inventory snapshot (start of the audited period)")]
    Initial,

    #[schemars(description = "Closing inventory counted physically in the warehouse")]
    Physical,

    #[schemars(description = "Closing inventory as declared in the accounting books")]
    Accounting,

    #[schemars(description = "Closing inventory snapshot of unspecified provenance")]
    Final,
}

impl SourceTag {
    /// Closing-state sources, most trusted first.
    pub const FINAL_STATE_PRIORITY: [SourceTag; 3] =
        [SourceTag::Physical, SourceTag::Accounting, SourceTag::Final];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Physical => "physical",
            Self::Accounting => "accounting",
            Self::Final => "final",
        }
    }

    pub fn is_final_state(&self) -> bool {
        !matches!(self, Self::Initial)
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTag {
    type Err = ReconciliationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "initial" => Ok(Self::Initial),
            "physical" => Ok(Self::Physical),
            "accounting" => Ok(Self::Accounting),
            "final" => Ok(Self::Final),
            other => Err(ReconciliationError::InvalidConfig(format!(
                "unknown source tag '{}': expected initial, physical, accounting or final",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[schemars(description = "Goods missing relative to expectation, or sold without inventory")]
    Critical,

    #[schemars(description = "Unexplained surplus relative to expectation")]
    Alert,

    #[schemars(description = "Discrepancy within the tolerated threshold")]
    Ok,
}

impl Severity {
    /// Sort rank: most severe first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::Alert => 1,
            Self::Ok => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::Alert => "ALERT",
            Self::Ok => "OK",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fiscal movement line after column resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct MovementRow {
    pub product_name_raw: String,
    pub code: Option<String>,
    pub quantity: f64,
    pub unit_value: Option<f64>,
    pub total_value: Option<f64>,
    /// Normalized CFOP (dots and spaces removed).
    pub transaction_code: String,
}

impl MovementRow {
    /// Declared total, or unit value times quantity when only the unit
    /// value is present.
    pub fn effective_total_value(&self) -> f64 {
        match (self.total_value, self.unit_value) {
            (Some(total), _) => total,
            (None, Some(unit)) => unit * self.quantity,
            (None, None) => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AggregatedProduct {
    pub key: String,
    pub display_name: String,
    pub code: Option<String>,
    pub total_quantity: f64,
    pub total_value: f64,
    pub transaction_codes_used: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InventoryFact {
    pub code: String,
    pub name_raw: String,
    pub quantity: f64,
    pub source_tag: SourceTag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReconciliationResult {
    #[schemars(description = "Normalized product key (trimmed, case-folded name)")]
    pub product_key: String,

    pub display_name: String,

    #[schemars(description = "Product code from the movements, or from the matched inventory fact")]
    pub code: Option<String>,

    pub quantity_sold: f64,
    pub quantity_purchased: f64,
    pub total_value_sold: f64,

    #[schemars(description = "Opening stock; 0 when no initial snapshot was found")]
    pub stock_initial: f64,

    #[schemars(
        description = "Closing stock resolved from physical, accounting or final snapshots in that order. Absent when no closing snapshot exists."
    )]
    pub stock_final: Option<f64>,

    #[schemars(description = "stock_initial + quantity_purchased - quantity_sold")]
    pub stock_expected: f64,

    #[schemars(description = "stock_final - stock_expected, or quantity_sold when no closing stock exists")]
    pub discrepancy: f64,

    pub severity: Severity,

    #[schemars(description = "True when two closing snapshots disagree on the quantity")]
    pub divergent_sources: bool,

    pub snapshots: BTreeMap<SourceTag, f64>,
    pub transaction_codes_used: BTreeSet<String>,
    pub observations: String,
}
