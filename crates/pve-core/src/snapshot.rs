use std::sync::Arc;

use crate::{ProductId, ValidationRule};

/// Immutable, versioned view of the rule set used by one validation run.
/// Refreshing the repository produces a new snapshot; runs already holding
/// this one never observe the change.
#[derive(Clone, Debug)]
pub struct RuleSnapshot {
    pub version: u64,
    pub loaded_at_ms: i64,
    /// Hex sha256 over the canonical JSON of `rules`.
    pub digest: String,
    pub rules: Arc<[ValidationRule]>,
    /// Definitions skipped at load time because they failed type-checking.
    pub rejected: usize,
}

impl Default for RuleSnapshot {
    fn default() -> Self {
        Self {
            version: 0,
            loaded_at_ms: 0,
            digest: String::new(),
            rules: Arc::from(Vec::new()),
            rejected: 0,
        }
    }
}

impl RuleSnapshot {
    /// Active global rules plus active rules scoped to a selected product,
    /// in snapshot order.
    pub fn applicable(&self, selected: &[ProductId]) -> Vec<&ValidationRule> {
        self.rules
            .iter()
            .filter(|r| r.is_active)
            .filter(|r| match &r.product_id {
                None => true,
                Some(p) => selected.contains(p),
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&ValidationRule> {
        self.rules.iter().find(|r| r.id.as_str() == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
