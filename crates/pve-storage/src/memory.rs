use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail};
use pve_core::{
    IssueId, IssueStatus, ProductConfiguration, ProposalId, RawRule, ValidationExecution, ValidationIssue,
};

use crate::traits::Storage;

/// In-memory storage for tests. Not durable, but good for unit/small scenario tests.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rules: BTreeMap<String, RawRule>,
    configurations: HashMap<ProposalId, ProductConfiguration>,
    /// Insertion order doubles as detection order.
    issues: Vec<ValidationIssue>,
    executions: Vec<ValidationExecution>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("in-memory storage lock poisoned"))
    }
}

impl Storage for InMemoryStorage {
    fn upsert_rule(&self, rule: &RawRule) -> anyhow::Result<()> {
        self.lock()?.rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    fn load_rules(&self) -> anyhow::Result<Vec<RawRule>> {
        Ok(self.lock()?.rules.values().cloned().collect())
    }

    fn save_configuration(&self, config: &ProductConfiguration) -> anyhow::Result<()> {
        self.lock()?.configurations.insert(config.proposal_id.clone(), config.clone());
        Ok(())
    }

    fn load_configuration(&self, proposal_id: &ProposalId) -> anyhow::Result<Option<ProductConfiguration>> {
        Ok(self.lock()?.configurations.get(proposal_id).cloned())
    }

    fn insert_issue(&self, issue: &ValidationIssue) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        if inner.issues.iter().any(|i| i.id == issue.id) {
            bail!("issue {} already exists", issue.id);
        }
        inner.issues.push(issue.clone());
        Ok(())
    }

    fn update_issue(&self, issue: &ValidationIssue) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        match inner.issues.iter_mut().find(|i| i.id == issue.id) {
            Some(slot) => {
                *slot = issue.clone();
                Ok(())
            }
            None => bail!("issue {} not found", issue.id),
        }
    }

    fn get_issue(&self, id: &IssueId) -> anyhow::Result<Option<ValidationIssue>> {
        Ok(self.lock()?.issues.iter().find(|i| &i.id == id).cloned())
    }

    fn list_issues(&self, entity_id: &str, status: Option<IssueStatus>) -> anyhow::Result<Vec<ValidationIssue>> {
        Ok(self
            .lock()?
            .issues
            .iter()
            .filter(|i| i.entity_id == entity_id)
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect())
    }

    fn insert_execution(&self, execution: &ValidationExecution) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        if inner.executions.iter().any(|e| e.id == execution.id) {
            bail!("execution {} already exists", execution.id);
        }
        inner.executions.push(execution.clone());
        Ok(())
    }

    fn list_executions(&self, entity_id: &str) -> anyhow::Result<Vec<ValidationExecution>> {
        Ok(self
            .lock()?
            .executions
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pve_core::{ExecutionId, IssueOrigin, Severity, ValidationStatus};

    fn raw(id: &str) -> RawRule {
        RawRule {
            id: id.to_string(),
            name: id.to_string(),
            category: "pricing".to_string(),
            rule_type: "configuration".to_string(),
            conditions: serde_json::Value::Null,
            actions: serde_json::Value::Null,
            severity: "low".to_string(),
            is_active: true,
            product_id: None,
        }
    }

    #[test]
    fn test_new_creates_empty_storage() {
        let storage = InMemoryStorage::new();
        assert!(storage.load_rules().unwrap().is_empty());
        assert!(storage.list_issues("p-1", None).unwrap().is_empty());
        assert!(storage.list_executions("p-1").unwrap().is_empty());
        assert!(storage.load_configuration(&"p-1".into()).unwrap().is_none());
    }

    #[test]
    fn test_upsert_rule_replaces_by_id() {
        let storage = InMemoryStorage::new();
        storage.upsert_rule(&raw("b")).unwrap();
        storage.upsert_rule(&raw("a")).unwrap();
        let mut changed = raw("a");
        changed.is_active = false;
        storage.upsert_rule(&changed).unwrap();
        let rules = storage.load_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, "a");
        assert!(!rules[0].is_active);
    }

    #[test]
    fn test_issue_lifecycle() {
        let storage = InMemoryStorage::new();
        let mut issue = ValidationIssue::open("p-1", IssueOrigin::License, "license:A", Severity::Critical, "m", 1);
        storage.insert_issue(&issue).unwrap();
        assert!(storage.insert_issue(&issue).is_err());

        issue.status = IssueStatus::Ignored;
        storage.update_issue(&issue).unwrap();
        assert_eq!(storage.get_issue(&issue.id).unwrap().unwrap().status, IssueStatus::Ignored);
        assert!(storage.list_issues("p-1", Some(IssueStatus::Open)).unwrap().is_empty());
        assert_eq!(storage.list_issues("p-1", Some(IssueStatus::Ignored)).unwrap().len(), 1);
        assert!(storage.list_issues("p-2", None).unwrap().is_empty());
    }

    #[test]
    fn test_update_missing_issue_fails() {
        let storage = InMemoryStorage::new();
        let issue = ValidationIssue::open("p-1", IssueOrigin::Rule, "rule:x", Severity::Low, "m", 1);
        assert!(storage.update_issue(&issue).is_err());
    }

    #[test]
    fn test_duplicate_execution_id_is_rejected() {
        let storage = InMemoryStorage::new();
        let exec = ValidationExecution {
            id: ExecutionId::from_str("e-1"),
            entity_id: "p-1".into(),
            entity_type: "proposal".into(),
            rule_ids: vec![],
            execution_time_ms: 3,
            issues_found: 0,
            issues_resolved: 0,
            performance_score: 100.0,
            triggered_by: "cli".into(),
            timestamp_ms: 1_700_000_000_000,
            snapshot_version: 1,
            status: ValidationStatus::Valid,
            incomplete: false,
        };
        storage.insert_execution(&exec).unwrap();
        assert!(storage.insert_execution(&exec).is_err());
        assert_eq!(storage.list_executions("p-1").unwrap().len(), 1);
    }
}
