use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use pve_core::{now_ms, RuleFilter, RuleSnapshot, ValidationRule};
use pve_rules::parse_rules;
use pve_storage::Storage;
use sha2::{Digest, Sha256};
use tracing::info;

/// Hands out immutable rule snapshots. `refresh` builds a new snapshot from
/// storage; runs already holding the previous one keep it.
pub struct RuleRepository {
    storage: Arc<dyn Storage>,
    current: RwLock<Arc<RuleSnapshot>>,
    next_version: AtomicU64,
}

impl RuleRepository {
    /// Empty repository (version 0) until the first `refresh`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            current: RwLock::new(Arc::new(RuleSnapshot::default())),
            next_version: AtomicU64::new(1),
        }
    }

    pub fn load(storage: Arc<dyn Storage>) -> Result<Self> {
        let repo = Self::new(storage);
        repo.refresh()?;
        Ok(repo)
    }

    pub fn refresh(&self) -> Result<Arc<RuleSnapshot>> {
        let raws = self.storage.load_rules().context("load rule definitions")?;
        let (rules, rejected) = parse_rules(&raws);
        let digest = rules_digest(&rules)?;
        let snapshot = Arc::new(RuleSnapshot {
            version: self.next_version.fetch_add(1, Ordering::SeqCst),
            loaded_at_ms: now_ms(),
            digest,
            rules: Arc::from(rules),
            rejected: rejected.len(),
        });
        info!(
            version = snapshot.version,
            rules = snapshot.len(),
            rejected = snapshot.rejected,
            "rule snapshot loaded"
        );
        let mut slot = self.current.write().unwrap_or_else(|p| p.into_inner());
        *slot = snapshot.clone();
        Ok(snapshot)
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.current.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn list_rules(&self, filter: &RuleFilter) -> Vec<ValidationRule> {
        self.snapshot().rules.iter().filter(|r| filter.matches(r)).cloned().collect()
    }
}

/// Stable content hash over the parsed rules.
pub fn rules_digest(rules: &[ValidationRule]) -> Result<String> {
    let bytes = serde_json::to_vec(rules).context("serialize rule snapshot")?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pve_core::{RawRule, RuleType};
    use pve_storage::InMemoryStorage;
    use serde_json::json;

    fn raw(id: &str, category: &str, active: bool) -> RawRule {
        RawRule {
            id: id.to_string(),
            name: id.to_string(),
            category: category.to_string(),
            rule_type: "configuration".to_string(),
            conditions: json!([]),
            actions: json!([{"type": "suggest_fix", "suggestion": "check"}]),
            severity: "low".to_string(),
            is_active: active,
            product_id: None,
        }
    }

    #[test]
    fn refresh_skips_malformed_and_bumps_version() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.upsert_rule(&raw("a", "pricing", true)).unwrap();
        let mut bad = raw("b", "pricing", true);
        bad.severity = "catastrophic".into();
        storage.upsert_rule(&bad).unwrap();

        let repo = RuleRepository::load(storage.clone()).unwrap();
        let first = repo.snapshot();
        assert_eq!(first.version, 1);
        assert_eq!(first.len(), 1);
        assert_eq!(first.rejected, 1);

        storage.upsert_rule(&raw("c", "legal", true)).unwrap();
        let second = repo.refresh().unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.len(), 2);
        assert_ne!(first.digest, second.digest);
        // A run holding the old snapshot does not see the refresh.
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn digest_is_stable_for_same_rules() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.upsert_rule(&raw("a", "pricing", true)).unwrap();
        let repo = RuleRepository::load(storage).unwrap();
        let a = repo.snapshot().digest.clone();
        let b = repo.refresh().unwrap().digest.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn list_rules_applies_filter() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.upsert_rule(&raw("a", "pricing", true)).unwrap();
        storage.upsert_rule(&raw("b", "pricing", false)).unwrap();
        storage.upsert_rule(&raw("c", "legal", true)).unwrap();
        let repo = RuleRepository::load(storage).unwrap();

        let pricing = repo.list_rules(&RuleFilter {
            category: Some("pricing".into()),
            ..Default::default()
        });
        assert_eq!(pricing.len(), 2);

        let active = repo.list_rules(&RuleFilter {
            is_active: Some(true),
            rule_type: Some(RuleType::Configuration),
            ..Default::default()
        });
        let ids: Vec<_> = active.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
