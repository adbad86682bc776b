//! Maps human-authored spreadsheet headers onto the semantic fields the
//! movement aggregator needs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum MovementField {
    ProductName,
    Code,
    Quantity,
    UnitValue,
    TotalValue,
    TransactionCode,
}

impl MovementField {
    /// Fields without which a movement row cannot be aggregated.
    pub const REQUIRED: [MovementField; 3] = [
        MovementField::ProductName,
        MovementField::Quantity,
        MovementField::TransactionCode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProductName => "product_name",
            Self::Code => "code",
            Self::Quantity => "quantity",
            Self::UnitValue => "unit_value",
            Self::TotalValue => "total_value",
            Self::TransactionCode => "transaction_code",
        }
    }
}

impl fmt::Display for MovementField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ranked header substrings per field. Earlier candidates win.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCandidates {
    fields: BTreeMap<MovementField, Vec<String>>,
}

impl FieldCandidates {
    pub fn empty() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    /// Header vocabulary found in Brazilian fiscal movement exports.
    pub fn movement_defaults() -> Self {
        let defaults: [(MovementField, &[&str]); 6] = [
            (
                MovementField::ProductName,
                &[
                    "descricao",
                    "descrição",
                    "nome_produto",
                    "mercadoria",
                    "produto",
                    "item",
                ],
            ),
            (
                MovementField::Code,
                &["codigo", "código", "sku", "cod_produto"],
            ),
            (MovementField::Quantity, &["quantidade", "qtd", "qtde", "qty"]),
            (
                MovementField::UnitValue,
                &["valor_unitario", "preco_unitario", "vl_unit"],
            ),
            (
                MovementField::TotalValue,
                &["valor_total", "valor", "vl_total", "total"],
            ),
            (MovementField::TransactionCode, &["cfop", "cfop_operacao"]),
        ];

        let mut candidates = Self::empty();
        for (field, names) in defaults {
            candidates = candidates.with_field(field, names.iter().map(|n| n.to_string()));
        }
        candidates
    }

    /// Replaces the candidate list for `field`.
    pub fn with_field<I, S>(mut self, field: MovementField, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names
            .into_iter()
            .map(|n| n.into().trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        self.fields.insert(field, names);
        self
    }

    pub fn get(&self, field: MovementField) -> Option<&[String]> {
        self.fields.get(&field).map(|v| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (MovementField, &[String])> {
        self.fields.iter().map(|(f, names)| (*f, names.as_slice()))
    }
}

impl Default for FieldCandidates {
    fn default() -> Self {
        Self::movement_defaults()
    }
}

/// Resolved column index per field. Unresolved fields are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap {
    indices: BTreeMap<MovementField, usize>,
}

impl ColumnMap {
    pub fn index(&self, field: MovementField) -> Option<usize> {
        self.indices.get(&field).copied()
    }

    pub fn is_resolved(&self, field: MovementField) -> bool {
        self.indices.contains_key(&field)
    }

    /// Required fields the header did not provide.
    pub fn missing_required(&self) -> Vec<MovementField> {
        MovementField::REQUIRED
            .into_iter()
            .filter(|f| !self.is_resolved(*f))
            .collect()
    }

    /// Trimmed, non-empty cell for `field`.
    pub fn cell<'a>(&self, field: MovementField, row: &'a [String]) -> Option<&'a str> {
        self.index(field)
            .and_then(|idx| row.get(idx))
            .map(|cell| cell.trim())
            .filter(|cell| !cell.is_empty())
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Assigns each field the first column whose header contains its
/// highest-ranked candidate. Fields are resolved independently.
pub fn resolve_columns(header: &[String], candidates: &FieldCandidates) -> ColumnMap {
    let lowered: Vec<String> = header.iter().map(|h| h.trim().to_lowercase()).collect();
    let mut indices = BTreeMap::new();

    for (field, names) in candidates.iter() {
        let hit = names
            .iter()
            .find_map(|name| lowered.iter().position(|col| col.contains(name.as_str())));

        if let Some(idx) = hit {
            indices.insert(field, idx);
        }
    }

    ColumnMap { indices }
}
