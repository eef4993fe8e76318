use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use pve_core::{now_ms, IssueId, IssueStatus, ResolutionMethod, ValidationIssue};
use pve_storage::Storage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("issue {0} not found")]
    NotFound(IssueId),
    #[error("issue {id} is already {status}")]
    AlreadyClosed { id: IssueId, status: IssueStatus },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Ways out of `open`. All of them are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum IssueTransition {
    Resolve { method: ResolutionMethod },
    Ignore,
    FalsePositive,
}

impl IssueTransition {
    fn target(&self) -> IssueStatus {
        match self {
            IssueTransition::Resolve { .. } => IssueStatus::Resolved,
            IssueTransition::Ignore => IssueStatus::Ignored,
            IssueTransition::FalsePositive => IssueStatus::FalsePositive,
        }
    }

    fn method(&self) -> ResolutionMethod {
        match self {
            IssueTransition::Resolve { method } => *method,
            IssueTransition::Ignore | IssueTransition::FalsePositive => ResolutionMethod::Manual,
        }
    }
}

/// Writes needed to record one run's detections, plus the issues as they
/// will be stored (re-detections keep the id of the open issue they update).
#[derive(Clone, Debug, Default)]
pub struct RunPlan {
    pub inserts: Vec<ValidationIssue>,
    pub updates: Vec<ValidationIssue>,
    pub issues: Vec<ValidationIssue>,
    pub found: u32,
    pub resolved: u32,
}

/// Computes the bookkeeping for one run against the entity's open issues.
/// Auto-resolution only happens for complete runs, so a timed-out checker
/// never closes issues it did not get to re-check.
pub fn plan_run(
    open: &[ValidationIssue],
    detected: &[ValidationIssue],
    complete: bool,
    dedup_open: bool,
    now: i64,
) -> RunPlan {
    let mut plan = RunPlan::default();
    let mut by_fingerprint: HashMap<&str, &ValidationIssue> = HashMap::new();
    if dedup_open {
        for issue in open {
            by_fingerprint.entry(issue.fingerprint.as_str()).or_insert(issue);
        }
    }

    // Detections sharing a fingerprint within one run are the same problem.
    let mut this_run: HashMap<&str, usize> = HashMap::new();
    for issue in detected {
        if let Some(&idx) = this_run.get(issue.fingerprint.as_str()) {
            let same = plan.issues[idx].clone();
            plan.issues.push(same);
            continue;
        }
        this_run.insert(issue.fingerprint.as_str(), plan.issues.len());
        match by_fingerprint.remove(issue.fingerprint.as_str()) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.severity = issue.severity;
                updated.message = issue.message.clone();
                updated.fix_suggestion = issue.fix_suggestion.clone();
                updated.rule_id = issue.rule_id.clone();
                plan.updates.push(updated.clone());
                plan.issues.push(updated);
            }
            None => {
                plan.inserts.push(issue.clone());
                plan.issues.push(issue.clone());
            }
        }
    }
    plan.found = u32::try_from(this_run.len()).unwrap_or(u32::MAX);

    if complete {
        let seen: HashSet<&str> = detected.iter().map(|i| i.fingerprint.as_str()).collect();
        for issue in open {
            if seen.contains(issue.fingerprint.as_str()) {
                continue;
            }
            let mut closed = issue.clone();
            close(&mut closed, IssueStatus::Resolved, ResolutionMethod::Auto, SYSTEM_ACTOR, now);
            plan.updates.push(closed);
            plan.resolved += 1;
        }
    }
    plan
}

fn close(issue: &mut ValidationIssue, status: IssueStatus, method: ResolutionMethod, by: &str, now: i64) {
    issue.status = status;
    issue.resolved_at_ms = Some(now);
    issue.resolved_by = Some(by.to_string());
    issue.resolution_method = Some(method);
}

/// Lifecycle of persisted issues.
#[derive(Clone)]
pub struct IssueTracker {
    storage: Arc<dyn Storage>,
    dedup_open: bool,
}

impl IssueTracker {
    pub fn new(storage: Arc<dyn Storage>, dedup_open: bool) -> Self {
        Self { storage, dedup_open }
    }

    pub fn resolve(&self, id: &IssueId, method: ResolutionMethod, resolved_by: &str) -> Result<ValidationIssue, IssueError> {
        self.transition(id, IssueTransition::Resolve { method }, resolved_by)
    }

    pub fn transition(
        &self,
        id: &IssueId,
        transition: IssueTransition,
        resolved_by: &str,
    ) -> Result<ValidationIssue, IssueError> {
        let mut issue = self
            .storage
            .get_issue(id)?
            .ok_or_else(|| IssueError::NotFound(id.clone()))?;
        if issue.status.is_terminal() {
            return Err(IssueError::AlreadyClosed {
                id: id.clone(),
                status: issue.status,
            });
        }
        close(&mut issue, transition.target(), transition.method(), resolved_by, now_ms());
        self.storage.update_issue(&issue)?;
        info!(issue_id = %id, status = %issue.status, by = resolved_by, "issue closed");
        Ok(issue)
    }

    pub fn list(&self, entity_id: &str, status: Option<IssueStatus>) -> anyhow::Result<Vec<ValidationIssue>> {
        self.storage.list_issues(entity_id, status)
    }

    /// Persists one run's detections for `entity_id`.
    pub fn record_run(&self, entity_id: &str, detected: &[ValidationIssue], complete: bool) -> anyhow::Result<RunPlan> {
        let open = self
            .storage
            .list_issues(entity_id, Some(IssueStatus::Open))
            .with_context(|| format!("list open issues for {entity_id}"))?;
        let plan = plan_run(&open, detected, complete, self.dedup_open, now_ms());
        self.storage
            .record_issues(&plan.inserts, &plan.updates)
            .with_context(|| format!("record issues for {entity_id}"))?;
        debug!(
            entity_id,
            inserted = plan.inserts.len(),
            updated = plan.updates.len(),
            auto_resolved = plan.resolved,
            "issues recorded"
        );
        Ok(plan)
    }
}
