use anyhow::{anyhow, Context, Result};
use pve_rules::parse_rules;
use pve_storage::Storage;
use serde::Serialize;

use crate::EngineConfig;

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub rules_stored: usize,
    pub rules_loaded: usize,
    /// `(rule id, reason)` for every definition the snapshot would skip.
    pub rejected: Vec<(String, String)>,
}

/// Sanity checks for an opened project. Bad configuration is an error;
/// malformed rules are only reported.
pub fn doctor(cfg: &EngineConfig, storage: &dyn Storage) -> Result<DoctorReport> {
    if cfg.run.budget_ms == 0 {
        return Err(anyhow!("run.budget_ms must be positive; every run would be incomplete"));
    }
    if cfg.run.rule_workers == 0 {
        return Err(anyhow!("run.rule_workers must be at least 1"));
    }
    if cfg.storage.max_write_attempts == 0 {
        return Err(anyhow!("storage.max_write_attempts must be at least 1"));
    }

    let raws = storage.load_rules().context("load rule definitions")?;
    let (rules, rejected) = parse_rules(&raws);
    Ok(DoctorReport {
        rules_stored: raws.len(),
        rules_loaded: rules.len(),
        rejected: rejected.into_iter().map(|(id, e)| (id, e.to_string())).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pve_core::RawRule;
    use pve_storage::InMemoryStorage;
    use serde_json::json;

    #[test]
    fn reports_rejected_rules() {
        let storage = InMemoryStorage::new();
        storage
            .upsert_rule(&RawRule {
                id: "r1".into(),
                name: "r1".into(),
                category: String::new(),
                rule_type: "compliance".into(),
                conditions: json!([{"attribute": "region", "operator": "like", "value": "EU"}]),
                actions: json!([{"type": "suggest_fix", "suggestion": "x"}]),
                severity: "low".into(),
                is_active: true,
                product_id: None,
            })
            .unwrap();
        let report = doctor(&EngineConfig::default(), &storage).unwrap();
        assert_eq!(report.rules_stored, 1);
        assert_eq!(report.rules_loaded, 0);
        assert_eq!(report.rejected[0].0, "r1");
    }

    #[test]
    fn zero_budget_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.run.budget_ms = 0;
        assert!(doctor(&cfg, &InMemoryStorage::new()).is_err());
    }
}
