//! Best-effort recovery of structured inventory lines from free-form text.
//!
//! Strategies run from most to least strict. The first one that yields at
//! least `min_candidates` valid, deduplicated lines wins and nothing from the
//! other strategies is kept.

use crate::config::ExtractionConfig;
use crate::matching::{matcher_from_config, NameMatcher};
use crate::schema::{InventoryFact, SourceTag};
use crate::utils::{clean_product_name, parse_number};
use log::{debug, info, warn};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    #[schemars(description = "Código: 001 Produto: NESCAU Quantidade: 95")]
    LabeledFields,
    #[schemars(description = "001 - NESCAU CEREAL 210G - 95")]
    DashDelimited,
    #[schemars(description = "001|NESCAU CEREAL 210G|95")]
    PipeDelimited,
    #[schemars(description = "001;NESCAU CEREAL 210G;95")]
    SemicolonDelimited,
    #[schemars(description = "001,NESCAU CEREAL 210G,95")]
    CommaDelimited,
    #[schemars(description = "001    NESCAU CEREAL 210G    95")]
    Tabular,
    #[schemars(description = "Any line shaped like digits, free text, digits")]
    LineScan,
}

// Name runs start with a letter and stay on one line.
const NAME: &str = r"[A-Za-zÀ-ÿ][A-Za-zÀ-ÿ0-9 \t\-\.]{2,79}";

// Quantities keep their decimal and thousands separators ("12,5", "1.234,00")
// and are parsed with `parse_number`.
const QTY: &str = r"(\d{1,8}(?:[.,]\d+)*)";

// A quantity ends at whitespace or a delimiter, never inside a number.
const QTY_END: &str = r"(?:[ \t\r|;]|,\D|$)";

fn labeled_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?im)(?:código|codigo|cod|item)[ \t]*[:\-]?[ \t]*(\d+)[ \t\-]*(?:(?:produto|descrição|descricao|desc|nome)[ \t]*[:\-]?[ \t]*)?({NAME}?)[ \t\-]*(?:quantidade|qtde|qtd|quant|estoque|saldo)[ \t]*[:\-]?[ \t]*{QTY}{QTY_END}"
        ))
        .expect("labeled-fields pattern is valid")
    })
}

fn dash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?m)\b(\d{{1,10}})[ \t]*-[ \t]*({NAME}?)[ \t]*-[ \t]*{QTY}{QTY_END}"
        ))
        .expect("dash-delimited pattern is valid")
    })
}

fn pipe_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?m)\b(\d{{1,10}})[ \t]*\|[ \t]*({NAME}?)[ \t]*\|[ \t]*{QTY}{QTY_END}"
        ))
        .expect("pipe-delimited pattern is valid")
    })
}

fn semicolon_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?m)\b(\d{{1,10}})[ \t]*;[ \t]*({NAME}?)[ \t]*;[ \t]*{QTY}{QTY_END}"
        ))
        .expect("semicolon-delimited pattern is valid")
    })
}

fn comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?m)\b(\d{{1,10}})[ \t]*,[ \t]*({NAME}?)[ \t]*,[ \t]*{QTY}{QTY_END}"
        ))
        .expect("comma-delimited pattern is valid")
    })
}

fn tabular_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Greedy name: the quantity is the last numeric column on the line.
        Regex::new(&format!(
            r"(?m)^[ \t]*(\d{{1,10}})[ \t]+({NAME})[ \t]+{QTY}(?:[ \t\r]|$)"
        ))
        .expect("tabular pattern is valid")
    })
}

fn line_scan_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)(\d{2,6})[ \t]+(.{3,50}?)[ \t]+(\d{1,6}(?:[.,]\d+)*)(?:[ \t\r]|$)")
            .expect("line-scan pattern is valid")
    })
}

impl ExtractionStrategy {
    /// Most strict first.
    pub const CASCADE: [ExtractionStrategy; 7] = [
        ExtractionStrategy::LabeledFields,
        ExtractionStrategy::DashDelimited,
        ExtractionStrategy::PipeDelimited,
        ExtractionStrategy::SemicolonDelimited,
        ExtractionStrategy::CommaDelimited,
        ExtractionStrategy::Tabular,
        ExtractionStrategy::LineScan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LabeledFields => "labeled_fields",
            Self::DashDelimited => "dash_delimited",
            Self::PipeDelimited => "pipe_delimited",
            Self::SemicolonDelimited => "semicolon_delimited",
            Self::CommaDelimited => "comma_delimited",
            Self::Tabular => "tabular",
            Self::LineScan => "line_scan",
        }
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            Self::LabeledFields => labeled_re(),
            Self::DashDelimited => dash_re(),
            Self::PipeDelimited => pipe_re(),
            Self::SemicolonDelimited => semicolon_re(),
            Self::CommaDelimited => comma_re(),
            Self::Tabular => tabular_re(),
            Self::LineScan => line_scan_re(),
        }
    }
}

impl fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated (code, name, quantity) triple before target association.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryCandidate {
    pub code: String,
    pub name: String,
    pub quantity: f64,
}

/// Plain text of one inventory document, tagged with the snapshot it
/// represents.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryDocument {
    pub name: String,
    pub source_tag: SourceTag,
    pub text: String,
}

impl InventoryDocument {
    pub fn new(name: impl Into<String>, source_tag: SourceTag, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_tag,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentExtraction {
    pub document: String,
    pub source_tag: SourceTag,
    pub facts: Vec<InventoryFact>,
    /// `None` when no strategy reached the minimum candidate count.
    pub strategy: Option<ExtractionStrategy>,
    /// Valid candidates per attempted strategy, in cascade order.
    pub candidate_counts: BTreeMap<ExtractionStrategy, usize>,
}

impl DocumentExtraction {
    /// True when the document produced no structured inventory at all.
    pub fn is_unstructured(&self) -> bool {
        self.strategy.is_none()
    }
}

pub struct FactExtractor {
    config: ExtractionConfig,
    matcher: Box<dyn NameMatcher>,
}

impl fmt::Debug for FactExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactExtractor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for FactExtractor {
    fn default() -> Self {
        Self::new(ExtractionConfig::default())
    }
}

impl FactExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        let matcher = matcher_from_config(&config);
        Self { config, matcher }
    }

    pub fn with_matcher(mut self, matcher: Box<dyn NameMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn matcher(&self) -> &dyn NameMatcher {
        self.matcher.as_ref()
    }

    /// Runs one strategy over the whole text and returns the valid
    /// candidates, first occurrence of each code only.
    pub fn candidates(&self, text: &str, strategy: ExtractionStrategy) -> Vec<InventoryCandidate> {
        let mut seen_codes = HashSet::new();
        let mut out = Vec::new();

        for caps in strategy.pattern().captures_iter(text) {
            let (Some(code), Some(name), Some(quantity)) = (caps.get(1), caps.get(2), caps.get(3))
            else {
                continue;
            };

            let Some(candidate) = self.validate(code.as_str(), name.as_str(), quantity.as_str())
            else {
                continue;
            };

            if seen_codes.insert(candidate.code.clone()) {
                out.push(candidate);
            }
        }

        out
    }

    fn validate(&self, code: &str, name: &str, quantity: &str) -> Option<InventoryCandidate> {
        let code = code.trim();
        let code_len = code.chars().count();
        if code_len < self.config.code_len_min || code_len > self.config.code_len_max {
            return None;
        }

        let name = clean_product_name(name);
        let name_len = name.chars().count();
        if name_len < self.config.name_len_min || name_len > self.config.name_len_max {
            return None;
        }

        let quantity = parse_number(quantity)?;
        if quantity < 0.0 || quantity >= self.config.max_quantity {
            return None;
        }

        Some(InventoryCandidate {
            code: code.to_string(),
            name,
            quantity,
        })
    }

    /// True when `name` refers to at least one target. No targets means
    /// everything is relevant.
    pub fn is_relevant<S: AsRef<str>>(&self, name: &str, targets: &[S]) -> bool {
        targets.is_empty()
            || targets
                .iter()
                .any(|t| self.matcher.matches(name, t.as_ref()))
    }

    pub fn extract<S: AsRef<str>>(
        &self,
        document: &InventoryDocument,
        targets: &[S],
    ) -> DocumentExtraction {
        let mut candidate_counts = BTreeMap::new();
        let mut winner = None;

        for strategy in ExtractionStrategy::CASCADE {
            let found = self.candidates(&document.text, strategy);
            debug!(
                "Document '{}': strategy {} found {} candidates",
                document.name,
                strategy,
                found.len()
            );
            candidate_counts.insert(strategy, found.len());

            if found.len() >= self.config.min_candidates {
                winner = Some((strategy, found));
                break;
            }
        }

        let Some((strategy, found)) = winner else {
            warn!(
                "No structured inventory found in document '{}'",
                document.name
            );
            return DocumentExtraction {
                document: document.name.clone(),
                source_tag: document.source_tag,
                facts: Vec::new(),
                strategy: None,
                candidate_counts,
            };
        };

        let total = found.len();
        let facts: Vec<InventoryFact> = found
            .into_iter()
            .filter(|c| self.is_relevant(&c.name, targets))
            .map(|c| InventoryFact {
                code: c.code,
                name_raw: c.name,
                quantity: c.quantity,
                source_tag: document.source_tag,
            })
            .collect();

        info!(
            "Document '{}' ({}): {} of {} lines kept via {}",
            document.name,
            document.source_tag,
            facts.len(),
            total,
            strategy
        );

        DocumentExtraction {
            document: document.name.clone(),
            source_tag: document.source_tag,
            facts,
            strategy: Some(strategy),
            candidate_counts,
        }
    }

    /// Parses every document on its own thread. Output order follows input
    /// order.
    pub fn extract_all<S>(
        &self,
        documents: &[InventoryDocument],
        targets: &[S],
    ) -> Vec<DocumentExtraction>
    where
        S: AsRef<str> + Sync,
    {
        if documents.len() <= 1 {
            return documents.iter().map(|d| self.extract(d, targets)).collect();
        }

        std::thread::scope(|scope| {
            let handles: Vec<_> = documents
                .iter()
                .map(|doc| scope.spawn(move || self.extract(doc, targets)))
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
    }
}

/// Extracts facts from one document with the default settings.
pub fn extract_inventory_facts<S: AsRef<str>>(
    text: &str,
    target_names: &[S],
    source_tag: SourceTag,
) -> Vec<InventoryFact> {
    let document = InventoryDocument::new("document", source_tag, text);
    FactExtractor::default()
        .extract(&document, target_names)
        .facts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::TokenOverlapMatcher;

    const NO_TARGETS: &[&str] = &[];

    fn doc(text: &str) -> InventoryDocument {
        InventoryDocument::new("inventario.pdf", SourceTag::Physical, text)
    }

    #[test]
    fn test_labeled_fields() {
        let text = "\
Código: 001 Produto: NESCAU CEREAL 210G Quantidade: 95
Código: 002 Produto: TODDY 400G Quantidade: 40
Item: 003 Desc: LEITE NINHO Estoque: 12
";
        let extraction = FactExtractor::default().extract(&doc(text), NO_TARGETS);
        assert_eq!(extraction.strategy, Some(ExtractionStrategy::LabeledFields));
        assert_eq!(extraction.facts.len(), 3);
        assert_eq!(extraction.facts[0].code, "001");
        assert_eq!(extraction.facts[0].name_raw, "NESCAU CEREAL 210G");
        assert_eq!(extraction.facts[0].quantity, 95.0);
        assert_eq!(extraction.facts[2].name_raw, "LEITE NINHO");
        assert_eq!(extraction.facts[2].source_tag, SourceTag::Physical);
    }

    #[test]
    fn test_dash_delimited() {
        let text = "\
001 - NESCAU CEREAL 210G - 95
002 - TODDY 400G - 40
003 - LEITE NINHO - 12
";
        let extraction = FactExtractor::default().extract(&doc(text), NO_TARGETS);
        assert_eq!(extraction.strategy, Some(ExtractionStrategy::DashDelimited));
        let names: Vec<&str> = extraction.facts.iter().map(|f| f.name_raw.as_str()).collect();
        assert_eq!(names, vec!["NESCAU CEREAL 210G", "TODDY 400G", "LEITE NINHO"]);
    }

    #[test]
    fn test_pipe_and_semicolon_and_comma() {
        let extractor = FactExtractor::default();
        let cases = [
            ("001|ARROZ|10\n002|FEIJAO|20\n003|ACUCAR|30\n", ExtractionStrategy::PipeDelimited),
            ("001;ARROZ;10\n002;FEIJAO;20\n003;ACUCAR;30\n", ExtractionStrategy::SemicolonDelimited),
            ("001,ARROZ,10\n002,FEIJAO,20\n003,ACUCAR,30\n", ExtractionStrategy::CommaDelimited),
        ];
        for (text, expected) in cases {
            let extraction = extractor.extract(&doc(text), NO_TARGETS);
            assert_eq!(extraction.strategy, Some(expected), "{text}");
            assert_eq!(extraction.facts.len(), 3);
            assert_eq!(extraction.facts[1].quantity, 20.0);
        }
    }

    #[test]
    fn test_fractional_and_thousands_quantities() {
        let extractor = FactExtractor::default();
        let cases = [
            (
                "001|ARROZ|12.5\n002|FEIJAO|3,5\n003|ACUCAR|1.234,00\n",
                ExtractionStrategy::PipeDelimited,
            ),
            (
                "001 - ARROZ - 12.5\n002 - FEIJAO - 3,5\n003 - ACUCAR - 1.234,00\n",
                ExtractionStrategy::DashDelimited,
            ),
            (
                "Código: 001 Produto: ARROZ Quantidade: 12.5\n\
                 Código: 002 Produto: FEIJAO Quantidade: 3,5\n\
                 Código: 003 Produto: ACUCAR Quantidade: 1.234,00\n",
                ExtractionStrategy::LabeledFields,
            ),
            (
                "001    ARROZ    12.5\n002    FEIJAO    3,5\n003    ACUCAR    1.234,00\n",
                ExtractionStrategy::Tabular,
            ),
        ];

        for (text, expected) in cases {
            let extraction = extractor.extract(&doc(text), NO_TARGETS);
            assert_eq!(extraction.strategy, Some(expected), "{text}");
            let quantities: Vec<f64> = extraction.facts.iter().map(|f| f.quantity).collect();
            assert_eq!(quantities, vec![12.5, 3.5, 1234.0], "{text}");
        }
    }

    #[test]
    fn test_quantity_is_never_truncated() {
        // "12.5kg" is not a bare number; the line is dropped, not read as 12
        let text = "001|ARROZ|12.5kg\n002|FEIJAO|20\n003|ACUCAR|30\n004|SAL|8\n";
        let extraction = FactExtractor::default().extract(&doc(text), NO_TARGETS);
        assert_eq!(extraction.strategy, Some(ExtractionStrategy::PipeDelimited));
        let codes: Vec<&str> = extraction.facts.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(codes, vec!["002", "003", "004"]);
    }

    #[test]
    fn test_comma_delimited_with_trailing_column() {
        let text = "001,ARROZ,10,UN\n002,FEIJAO,20,UN\n003,ACUCAR,30,KG\n";
        let extraction = FactExtractor::default().extract(&doc(text), NO_TARGETS);
        assert_eq!(extraction.strategy, Some(ExtractionStrategy::CommaDelimited));
        let quantities: Vec<f64> = extraction.facts.iter().map(|f| f.quantity).collect();
        assert_eq!(quantities, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_tabular_takes_last_number() {
        let text = "\
001    ARROZ TIPO 1 5KG    40
002    FEIJAO CARIOCA    25
003    OLEO DE SOJA 900ML    18
";
        let extraction = FactExtractor::default().extract(&doc(text), NO_TARGETS);
        assert_eq!(extraction.strategy, Some(ExtractionStrategy::Tabular));
        assert_eq!(extraction.facts[0].name_raw, "ARROZ TIPO 1 5KG");
        assert_eq!(extraction.facts[0].quantity, 40.0);
    }

    #[test]
    fn test_strategies_are_not_merged() {
        // Two pipe lines are below the minimum; the tabular strategy wins and
        // the pipe lines do not leak into the result.
        let text = "\
001|ARROZ|10
002|FEIJAO|20
101    ACUCAR REFINADO    30
102    CAFE TORRADO    15
103    SAL MARINHO    8
";
        let extraction = FactExtractor::default().extract(&doc(text), NO_TARGETS);
        assert_eq!(extraction.strategy, Some(ExtractionStrategy::Tabular));
        assert_eq!(
            extraction.candidate_counts.get(&ExtractionStrategy::PipeDelimited),
            Some(&2)
        );
        let codes: Vec<&str> = extraction.facts.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(codes, vec!["101", "102", "103"]);
    }

    #[test]
    fn test_validation_and_dedupe() {
        let text = "\
001|ARROZ|10
001|ARROZ DUPLICADO|99
7|CODIGO CURTO|5
002|AB|5
003|QUANTIDADE ENORME|99999999
004|FEIJAO|20
005|ACUCAR|30
";
        let extraction = FactExtractor::default().extract(&doc(text), NO_TARGETS);
        let codes: Vec<&str> = extraction.facts.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(codes, vec!["001", "004", "005"]);
        assert_eq!(extraction.facts[0].name_raw, "ARROZ");
    }

    #[test]
    fn test_unstructured_document_yields_nothing() {
        let text = "Relatório de inventário\nNenhum item listado nesta página.\n";
        let extraction = FactExtractor::default().extract(&doc(text), NO_TARGETS);
        assert!(extraction.is_unstructured());
        assert!(extraction.facts.is_empty());
        assert_eq!(
            extraction.candidate_counts.len(),
            ExtractionStrategy::CASCADE.len()
        );
    }

    #[test]
    fn test_below_minimum_is_empty() {
        let text = "001|ARROZ|10\n002|FEIJAO|20\n";
        let extraction = FactExtractor::default().extract(&doc(text), NO_TARGETS);
        assert!(extraction.facts.is_empty());

        let config = ExtractionConfig {
            min_candidates: 2,
            ..ExtractionConfig::default()
        };
        let extraction = FactExtractor::new(config).extract(&doc(text), NO_TARGETS);
        assert_eq!(extraction.facts.len(), 2);
    }

    #[test]
    fn test_targets_filter_after_minimum() {
        let text = "001|NESCAU CEREAL 210G|95\n002|TODDY 400G|40\n003|LEITE NINHO|12\n";
        let extraction = FactExtractor::default().extract(&doc(text), &["nescau cereal"]);
        assert_eq!(extraction.strategy, Some(ExtractionStrategy::PipeDelimited));
        assert_eq!(extraction.facts.len(), 1);
        assert_eq!(extraction.facts[0].code, "001");
    }

    #[test]
    fn test_custom_matcher() {
        let text = "001|OLEO|95\n002|TODDY 400G|40\n003|LEITE NINHO|12\n";
        let extractor =
            FactExtractor::default().with_matcher(Box::new(TokenOverlapMatcher::new(0.5)));
        let facts = extractor.extract(&doc(text), &["oleo de soja 900ml"]).facts;
        assert!(facts.is_empty());

        let facts = FactExtractor::default()
            .extract(&doc(text), &["oleo de soja 900ml"])
            .facts;
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn test_extract_all_keeps_document_order() {
        let physical = InventoryDocument::new(
            "fisico.txt",
            SourceTag::Physical,
            "001|ARROZ|10\n002|FEIJAO|20\n003|ACUCAR|30\n",
        );
        let accounting = InventoryDocument::new(
            "contabil.txt",
            SourceTag::Accounting,
            "001;ARROZ;11\n002;FEIJAO;20\n003;ACUCAR;31\n",
        );
        let empty = InventoryDocument::new("vazio.txt", SourceTag::Initial, "");

        let results =
            FactExtractor::default().extract_all(&[physical, accounting, empty], NO_TARGETS);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].source_tag, SourceTag::Physical);
        assert_eq!(results[1].facts[0].quantity, 11.0);
        assert!(results[2].is_unstructured());
    }

    #[test]
    fn test_extract_inventory_facts_free_function() {
        let facts = extract_inventory_facts(
            "001 - ARROZ - 10\n002 - FEIJAO - 20\n003 - ACUCAR - 30\n",
            &["feijao"],
            SourceTag::Accounting,
        );
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].source_tag, SourceTag::Accounting);
        assert_eq!(facts[0].quantity, 20.0);
    }
}
