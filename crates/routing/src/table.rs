//! The routing table: logical model → ordered provider candidates.
//!
//! Ordering is deterministic: descending weight, ties broken by provider
//! name ascending. The table is built at startup and read-only afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One routable (provider, upstream-model, weight) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub provider: String,
    /// The model id the provider expects on the wire. Usually equal to
    /// the logical id.
    pub upstream_model: String,
    pub weight: u32,
}

impl Candidate {
    pub fn new(provider: impl Into<String>, upstream_model: impl Into<String>, weight: u32) -> Self {
        Self {
            provider: provider.into(),
            upstream_model: upstream_model.into(),
            weight,
        }
    }
}

/// Immutable-after-startup candidate table.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, Vec<Candidate>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register candidates for a logical model. The list is sorted into
    /// canonical order on insert.
    pub fn insert(&mut self, logical_model: impl Into<String>, mut candidates: Vec<Candidate>) {
        candidates.sort_by(|a, b| {
            b.weight
                .cmp(&a.weight)
                .then_with(|| a.provider.cmp(&b.provider))
        });
        self.routes.insert(logical_model.into(), candidates);
    }

    /// Candidates for a logical model, best first.
    pub fn candidates(&self, logical_model: &str) -> Option<&[Candidate]> {
        self.routes.get(logical_model).map(Vec::as_slice)
    }

    /// Every routable logical model id, sorted.
    pub fn logical_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.routes.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_ordered_by_weight_desc() {
        let mut table = RoutingTable::new();
        table.insert(
            "gpt-4o-mini",
            vec![
                Candidate::new("backup", "gpt-4o-mini", 10),
                Candidate::new("primary", "gpt-4o-mini", 90),
            ],
        );

        let candidates = table.candidates("gpt-4o-mini").unwrap();
        assert_eq!(candidates[0].provider, "primary");
        assert_eq!(candidates[1].provider, "backup");
    }

    #[test]
    fn weight_ties_break_by_provider_name() {
        let mut table = RoutingTable::new();
        table.insert(
            "m",
            vec![
                Candidate::new("zeta", "m", 50),
                Candidate::new("alpha", "m", 50),
                Candidate::new("mid", "m", 50),
            ],
        );

        let providers: Vec<_> = table
            .candidates("m")
            .unwrap()
            .iter()
            .map(|c| c.provider.as_str())
            .collect();
        assert_eq!(providers, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn unknown_model_has_no_candidates() {
        let table = RoutingTable::new();
        assert!(table.candidates("nonexistent").is_none());
    }

    #[test]
    fn logical_models_sorted() {
        let mut table = RoutingTable::new();
        table.insert("zebra", vec![Candidate::new("p", "zebra", 1)]);
        table.insert("alpha", vec![Candidate::new("p", "alpha", 1)]);
        assert_eq!(table.logical_models(), vec!["alpha", "zebra"]);
    }

    #[test]
    fn upstream_model_can_differ_from_logical() {
        let mut table = RoutingTable::new();
        table.insert(
            "claude-fast",
            vec![Candidate::new("anthropic", "claude-haiku-35-20241022", 100)],
        );
        assert_eq!(
            table.candidates("claude-fast").unwrap()[0].upstream_model,
            "claude-haiku-35-20241022"
        );
    }
}
