use crate::columns::{FieldCandidates, MovementField};
use crate::error::{ReconciliationError, Result};
use serde::Deserialize;
use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconciliationConfig {
    #[serde(default)]
    pub movements: MovementConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
}

// ---------------------------------------------------------------------------
// Movements
// ---------------------------------------------------------------------------

/// Which transaction codes count as sales and purchases, and how many of
/// the best-selling products drive inventory extraction.
///
/// Codes are compared after normalization, so "5.102" and "5102" are the
/// same code.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MovementConfig {
    #[serde(default)]
    pub sale_codes: BTreeSet<String>,
    #[serde(default)]
    pub purchase_codes: BTreeSet<String>,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default)]
    pub columns: ColumnOverrides,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            sale_codes: BTreeSet::new(),
            purchase_codes: BTreeSet::new(),
            top_n: default_top_n(),
            columns: ColumnOverrides::default(),
        }
    }
}

fn default_top_n() -> usize {
    10
}

/// Optional replacement header vocabularies, one list per field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnOverrides {
    pub product_name: Option<Vec<String>>,
    pub code: Option<Vec<String>>,
    pub quantity: Option<Vec<String>>,
    pub unit_value: Option<Vec<String>>,
    pub total_value: Option<Vec<String>>,
    pub transaction_code: Option<Vec<String>>,
}

impl ColumnOverrides {
    pub fn apply(&self, base: FieldCandidates) -> FieldCandidates {
        let overrides = [
            (MovementField::ProductName, &self.product_name),
            (MovementField::Code, &self.code),
            (MovementField::Quantity, &self.quantity),
            (MovementField::UnitValue, &self.unit_value),
            (MovementField::TotalValue, &self.total_value),
            (MovementField::TransactionCode, &self.transaction_code),
        ];

        overrides
            .into_iter()
            .fold(base, |acc, (field, names)| match names {
                Some(names) => acc.with_field(field, names.iter().cloned()),
                None => acc,
            })
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    Containment,
    TokenOverlap,
}

impl Default for MatcherKind {
    fn default() -> Self {
        Self::Containment
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractionConfig {
    #[serde(default = "default_min_candidates")]
    pub min_candidates: usize,
    #[serde(default = "default_code_len_min")]
    pub code_len_min: usize,
    #[serde(default = "default_code_len_max")]
    pub code_len_max: usize,
    #[serde(default = "default_name_len_min")]
    pub name_len_min: usize,
    #[serde(default = "default_name_len_max")]
    pub name_len_max: usize,
    /// Exclusive upper bound for extracted quantities.
    #[serde(default = "default_max_quantity")]
    pub max_quantity: f64,
    #[serde(default)]
    pub matcher: MatcherKind,
    #[serde(default = "default_token_overlap_ratio")]
    pub token_overlap_ratio: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_candidates: default_min_candidates(),
            code_len_min: default_code_len_min(),
            code_len_max: default_code_len_max(),
            name_len_min: default_name_len_min(),
            name_len_max: default_name_len_max(),
            max_quantity: default_max_quantity(),
            matcher: MatcherKind::default(),
            token_overlap_ratio: default_token_overlap_ratio(),
        }
    }
}

fn default_min_candidates() -> usize {
    3
}

fn default_code_len_min() -> usize {
    2
}

fn default_code_len_max() -> usize {
    10
}

fn default_name_len_min() -> usize {
    3
}

fn default_name_len_max() -> usize {
    80
}

fn default_max_quantity() -> f64 {
    1_000_000.0
}

fn default_token_overlap_ratio() -> f64 {
    0.5
}

// ---------------------------------------------------------------------------
// Balance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BalanceConfig {
    /// Fraction of the sold quantity a discrepancy may reach before it is
    /// flagged.
    #[serde(default = "default_threshold_ratio")]
    pub threshold_ratio: f64,
    /// Also report products that appear in inventory but never in sales.
    #[serde(default)]
    pub include_inventory_only: bool,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            threshold_ratio: default_threshold_ratio(),
            include_inventory_only: false,
        }
    }
}

fn default_threshold_ratio() -> f64 {
    0.1
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl ReconciliationConfig {
    /// Config with the given sale codes and every other setting defaulted.
    pub fn with_sale_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = Self::default();
        config.movements.sale_codes = codes.into_iter().map(Into::into).collect();
        config
    }

    pub fn from_toml(input: &str) -> Result<Self> {
        let config: ReconciliationConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let movements = &self.movements;

        if movements.sale_codes.is_empty() {
            return Err(ReconciliationError::InvalidConfig(
                "movements.sale_codes must list at least one transaction code".into(),
            ));
        }

        if movements.top_n == 0 {
            return Err(ReconciliationError::InvalidConfig(
                "movements.top_n must be greater than 0".into(),
            ));
        }

        let overlap: Vec<&String> = movements
            .sale_codes
            .intersection(&movements.purchase_codes)
            .collect();
        if !overlap.is_empty() {
            return Err(ReconciliationError::InvalidConfig(format!(
                "transaction codes listed as both sale and purchase: {:?}",
                overlap
            )));
        }

        let extraction = &self.extraction;

        if extraction.min_candidates == 0 {
            return Err(ReconciliationError::InvalidConfig(
                "extraction.min_candidates must be greater than 0".into(),
            ));
        }

        if extraction.code_len_min == 0 || extraction.code_len_min > extraction.code_len_max {
            return Err(ReconciliationError::InvalidConfig(format!(
                "extraction code length range {}..={} is empty",
                extraction.code_len_min, extraction.code_len_max
            )));
        }

        if extraction.name_len_min == 0 || extraction.name_len_min > extraction.name_len_max {
            return Err(ReconciliationError::InvalidConfig(format!(
                "extraction name length range {}..={} is empty",
                extraction.name_len_min, extraction.name_len_max
            )));
        }

        if extraction.max_quantity.is_nan() || extraction.max_quantity <= 0.0 {
            return Err(ReconciliationError::InvalidConfig(format!(
                "extraction.max_quantity must be positive, got {}",
                extraction.max_quantity
            )));
        }

        if !(0.0..=1.0).contains(&extraction.token_overlap_ratio) {
            return Err(ReconciliationError::InvalidConfig(format!(
                "extraction.token_overlap_ratio must be between 0.0 and 1.0, got {}",
                extraction.token_overlap_ratio
            )));
        }

        if !(0.0..=1.0).contains(&self.balance.threshold_ratio) {
            return Err(ReconciliationError::InvalidConfig(format!(
                "balance.threshold_ratio must be between 0.0 and 1.0, got {}",
                self.balance.threshold_ratio
            )));
        }

        Ok(())
    }

    pub fn field_candidates(&self) -> FieldCandidates {
        self.movements
            .columns
            .apply(FieldCandidates::movement_defaults())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
