//! Name association between extracted inventory lines and sold products.

use crate::config::{ExtractionConfig, MatcherKind};
use std::collections::BTreeSet;

/// Decides whether an extracted product name refers to a target product.
pub trait NameMatcher: Send + Sync {
    fn matches(&self, candidate: &str, target: &str) -> bool;
}

/// Case-insensitive containment in either direction.
///
/// Loose on purpose: fiscal descriptions abbreviate and reorder freely.
/// Short names produce false positives, which is what
/// [`TokenOverlapMatcher`] exists for.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainmentMatcher;

impl NameMatcher for ContainmentMatcher {
    fn matches(&self, candidate: &str, target: &str) -> bool {
        let candidate = candidate.trim().to_lowercase();
        let target = target.trim().to_lowercase();
        if candidate.is_empty() || target.is_empty() {
            return false;
        }
        candidate.contains(&target) || target.contains(&candidate)
    }
}

/// Jaccard similarity over lowercased word tokens.
#[derive(Debug, Clone, Copy)]
pub struct TokenOverlapMatcher {
    pub min_ratio: f64,
}

impl TokenOverlapMatcher {
    pub fn new(min_ratio: f64) -> Self {
        Self { min_ratio }
    }

    pub fn similarity(candidate: &str, target: &str) -> f64 {
        let a = tokens(candidate);
        let b = tokens(target);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let shared = a.intersection(&b).count();
        let union = a.union(&b).count();
        shared as f64 / union as f64
    }
}

impl Default for TokenOverlapMatcher {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl NameMatcher for TokenOverlapMatcher {
    fn matches(&self, candidate: &str, target: &str) -> bool {
        let score = Self::similarity(candidate, target);
        score > 0.0 && score >= self.min_ratio
    }
}

fn tokens(name: &str) -> BTreeSet<String> {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

pub fn matcher_from_config(config: &ExtractionConfig) -> Box<dyn NameMatcher> {
    match config.matcher {
        MatcherKind::Containment => Box::new(ContainmentMatcher),
        MatcherKind::TokenOverlap => Box::new(TokenOverlapMatcher::new(config.token_overlap_ratio)),
    }
}
