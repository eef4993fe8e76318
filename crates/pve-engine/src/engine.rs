use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use pve_compat::{compatibility_issues, ProductCompatibilityService};
use pve_core::{
    group_issues, now_ms, overall_status, performance_score, retry_backoff_ms, sort_issues, ConfigurationValidationResult,
    Deadline, ExecutionId, IssueId, IssueOrigin, LicenseConflict, ProductConfiguration, ProductId, ProposalId,
    RuleFilter, RuleSnapshot, RunState, RunStateError, ValidationExecution, ValidationIssue, ValidationResult,
    ValidationRule, ValidationStatus, PROPOSAL_ENTITY,
};
use pve_license::{license_issues, EntitlementLookup, LicenseValidationService};
use pve_rules::{ActionResult, ContextSet, RuleExecutor, RuleResult, RulesetOutcome};
use pve_storage::Storage;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::analytics::{AnalyticsSink, LogSink, ValidationEvent};
use crate::config::EngineConfig;
use crate::issues::{IssueTracker, RunPlan};
use crate::repository::RuleRepository;
use crate::util::{blocking, today};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    RunState(#[from] RunStateError),
    #[error("no product configuration stored for proposal {0}")]
    ConfigurationNotFound(ProposalId),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Runs the rule, compatibility and license checks for one configuration
/// and merges their findings.
pub struct ValidationEngine {
    config: EngineConfig,
    repository: Arc<RuleRepository>,
    executor: RuleExecutor,
    compatibility: Arc<ProductCompatibilityService>,
    license: LicenseValidationService,
    storage: Arc<dyn Storage>,
    issues: IssueTracker,
    analytics: Arc<dyn AnalyticsSink>,
}

/// Output of the three checkers before aggregation.
struct CheckerOutput {
    rules: RulesetOutcome,
    compatibility: Option<ConfigurationValidationResult>,
    license: Option<Vec<LicenseConflict>>,
}

impl ValidationEngine {
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        repository: Arc<RuleRepository>,
        entitlements: Arc<dyn EntitlementLookup>,
    ) -> Self {
        let compatibility = Arc::new(ProductCompatibilityService::new(config.compatibility.clone()));
        let license = LicenseValidationService::new(entitlements, config.lookup_timeout());
        let issues = IssueTracker::new(storage.clone(), config.issues.dedup_open);
        Self {
            config,
            repository,
            executor: RuleExecutor::new(),
            compatibility,
            license,
            storage,
            issues,
            analytics: Arc::new(LogSink),
        }
    }

    pub fn with_analytics(mut self, sink: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &RuleRepository {
        &self.repository
    }

    pub fn issues(&self) -> &IssueTracker {
        &self.issues
    }

    pub fn list_rules(&self, filter: &RuleFilter) -> Vec<ValidationRule> {
        self.repository.list_rules(filter)
    }

    /// Validates one configuration against the current rule snapshot. Never
    /// fails because of a checker: timeouts and lookup failures show up as
    /// `incomplete` or as issues.
    pub async fn validate_product_configuration(
        &self,
        config: &ProductConfiguration,
    ) -> Result<ValidationResult, EngineError> {
        let started = Instant::now();
        let state = RunState::Pending.transition(RunState::InProgress)?;
        let snapshot = self.repository.snapshot();

        if config.products.is_empty() {
            let result = ValidationResult {
                proposal_id: config.proposal_id.clone(),
                status: ValidationStatus::Valid,
                run_state: state.transition(RunState::Completed)?,
                incomplete: false,
                issues: vec![],
                suggestions: vec![],
                execution_time_ms: elapsed_ms(started),
                user_story_mappings: Default::default(),
                snapshot_version: snapshot.version,
                rules_executed: vec![],
                compatibility: None,
                persistence_pending: false,
            };
            self.analytics.emit(ValidationEvent::from_result(&result));
            return Ok(result);
        }

        let deadline = Deadline::after(self.config.budget());
        let output = self.run_checkers(config, snapshot.clone(), deadline).await;
        let result = self.aggregate(config, &snapshot, output, state, started)?;

        info!(
            proposal_id = %result.proposal_id,
            status = %result.status,
            issues = result.issues.len(),
            rules = result.rules_executed.len(),
            elapsed_ms = result.execution_time_ms,
            incomplete = result.incomplete,
            snapshot_version = result.snapshot_version,
            "validation run finished"
        );
        self.analytics.emit(ValidationEvent::from_result(&result));
        Ok(result)
    }

    /// Batch mode: load the stored configuration, validate it and record the
    /// issues plus one audit record. A failed write does not fail the call;
    /// it is retried in the background and flagged on the result.
    pub async fn execute_validation_workflow(
        &self,
        proposal_id: &ProposalId,
        triggered_by: &str,
    ) -> Result<ValidationResult, EngineError> {
        let storage = self.storage.clone();
        let id = proposal_id.clone();
        let config = blocking(self.config.write_timeout(), "load configuration", move || {
            storage.load_configuration(&id)
        })
        .await
        .with_context(|| format!("load configuration for {proposal_id}"))?
        .ok_or_else(|| EngineError::ConfigurationNotFound(proposal_id.clone()))?;

        let mut result = self.validate_product_configuration(&config).await?;

        let blocking_issues = result.issues.iter().filter(|i| i.severity.blocks()).count();
        let execution = ValidationExecution {
            id: ExecutionId::new(),
            entity_id: proposal_id.as_str().to_string(),
            entity_type: PROPOSAL_ENTITY.to_string(),
            rule_ids: result.rules_executed.clone(),
            execution_time_ms: result.execution_time_ms,
            issues_found: 0,
            issues_resolved: 0,
            performance_score: performance_score(result.execution_time_ms, self.config.run.budget_ms, blocking_issues),
            triggered_by: triggered_by.to_string(),
            timestamp_ms: now_ms(),
            snapshot_version: result.snapshot_version,
            status: result.status,
            incomplete: result.incomplete,
        };
        let job = PersistJob {
            storage: self.storage.clone(),
            tracker: self.issues.clone(),
            issues: result.issues.clone(),
            complete: !result.incomplete,
            execution,
            progress: Arc::default(),
        };

        match blocking(self.config.write_timeout(), "persist validation run", job.call()).await {
            Ok(plan) => adopt_stored_ids(&mut result, &plan),
            Err(e) => {
                warn!(proposal_id = %proposal_id, error = %e, "persisting validation run failed; retrying in background");
                result.persistence_pending = true;
                self.spawn_persist_retry(job);
            }
        }
        Ok(result)
    }

    fn spawn_persist_retry(&self, job: PersistJob) {
        let max_attempts = self.config.storage.max_write_attempts.max(1);
        let timeout = self.config.write_timeout();
        tokio::spawn(async move {
            let entity = job.execution.entity_id.clone();
            for attempt in 2..=max_attempts {
                tokio::time::sleep(std::time::Duration::from_millis(retry_backoff_ms(attempt))).await;
                match blocking(timeout, "persist validation run", job.call()).await {
                    Ok(_) => {
                        info!(proposal_id = %entity, attempt, "validation run persisted after retry");
                        return;
                    }
                    Err(e) => warn!(proposal_id = %entity, attempt, error = %e, "persist retry failed"),
                }
            }
            error!(proposal_id = %entity, attempts = max_attempts, "giving up persisting validation run");
        });
    }

    async fn run_checkers(
        &self,
        config: &ProductConfiguration,
        snapshot: Arc<RuleSnapshot>,
        deadline: Deadline,
    ) -> CheckerOutput {
        let backstop = self.config.budget() + self.config.grace();
        let shared = Arc::new(config.clone());

        let rules = async {
            match tokio::time::timeout(backstop, self.run_rules(&shared, snapshot.clone(), deadline)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(proposal_id = %config.proposal_id, "rule evaluation exceeded run budget");
                    RulesetOutcome::default()
                }
            }
        };

        let compatibility = async {
            let svc = self.compatibility.clone();
            let cfg = shared.clone();
            let task = tokio::task::spawn_blocking(move || svc.validate_product_configuration(&cfg, vec![], deadline));
            match tokio::time::timeout(backstop, task).await {
                Ok(Ok(out)) => Some(out),
                Ok(Err(e)) => {
                    warn!(proposal_id = %config.proposal_id, error = %e, "compatibility check failed");
                    None
                }
                Err(_) => {
                    warn!(proposal_id = %config.proposal_id, "compatibility check exceeded run budget");
                    None
                }
            }
        };

        let license = async {
            match tokio::time::timeout(backstop, self.license.validate_licenses(config, today())).await {
                Ok(conflicts) => Some(conflicts),
                Err(_) => {
                    warn!(proposal_id = %config.proposal_id, "license check exceeded run budget");
                    None
                }
            }
        };

        let (rules, compatibility, license) = tokio::join!(rules, compatibility, license);
        CheckerOutput {
            rules,
            compatibility,
            license,
        }
    }

    /// Applicable rules split into `rule_workers` chunks on the blocking
    /// pool; results are merged back in chunk order.
    async fn run_rules(
        &self,
        config: &Arc<ProductConfiguration>,
        snapshot: Arc<RuleSnapshot>,
        deadline: Deadline,
    ) -> RulesetOutcome {
        let selected: Vec<ProductId> = config.products.iter().map(|p| p.id.clone()).collect();
        let applicable: Vec<ValidationRule> = snapshot.applicable(&selected).into_iter().cloned().collect();
        if applicable.is_empty() {
            return RulesetOutcome {
                results: vec![],
                complete: true,
            };
        }

        let contexts = Arc::new(ContextSet::from_configuration(config));
        let chunk = applicable.len().div_ceil(self.config.run.rule_workers.max(1));
        let handles: Vec<_> = applicable
            .chunks(chunk)
            .map(|part| {
                let part = part.to_vec();
                let contexts = contexts.clone();
                let executor = self.executor;
                tokio::task::spawn_blocking(move || executor.execute_ruleset_until(&part, &contexts, deadline))
            })
            .collect();

        let mut merged = RulesetOutcome {
            results: Vec::with_capacity(applicable.len()),
            complete: true,
        };
        for handle in handles {
            match handle.await {
                Ok(outcome) => {
                    merged.complete &= outcome.complete;
                    merged.results.extend(outcome.results);
                }
                Err(e) => {
                    warn!(error = %e, "rule worker failed");
                    merged.complete = false;
                }
            }
        }
        merged
    }

    fn aggregate(
        &self,
        config: &ProductConfiguration,
        snapshot: &RuleSnapshot,
        output: CheckerOutput,
        state: RunState,
        started: Instant,
    ) -> Result<ValidationResult, RunStateError> {
        let entity = config.proposal_id.as_str();
        let now = now_ms();
        let mut issues = vec![];
        let mut suggestions = vec![];

        for result in &output.rules.results {
            rule_findings(entity, result, now, &mut issues, &mut suggestions);
        }

        let license_conflicts = output.license.clone().unwrap_or_default();
        let compatibility = output
            .compatibility
            .map(|c| ConfigurationValidationResult::compose(c.compatibility, c.matrix, license_conflicts.clone()));
        if let Some(c) = &compatibility {
            issues.extend(compatibility_issues(&c.compatibility, entity, now));
            suggestions.extend(c.compatibility.recommendations.iter().cloned());
        }
        issues.extend(license_issues(&license_conflicts, entity, now));

        sort_issues(&mut issues);
        let incomplete = !output.rules.complete
            || compatibility.as_ref().map_or(true, |c| !c.compatibility.complete)
            || output.license.is_none();
        let run_state = state.transition(if incomplete { RunState::Failed } else { RunState::Completed })?;
        if incomplete {
            warn!(proposal_id = %config.proposal_id, "validation run incomplete");
        }

        let user_story_mappings = group_issues(&issues, |i| story_key(snapshot, i));
        Ok(ValidationResult {
            proposal_id: config.proposal_id.clone(),
            status: overall_status(&issues),
            run_state,
            incomplete,
            issues,
            suggestions,
            execution_time_ms: elapsed_ms(started),
            user_story_mappings,
            snapshot_version: snapshot.version,
            rules_executed: output.rules.results.iter().map(|r| r.rule_id.clone()).collect(),
            compatibility,
            persistence_pending: false,
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Issues and suggestions from one rule. The first raised issue is
/// fingerprinted `rule:<id>`, later ones in the same rule get `#<n>`.
fn rule_findings(
    entity: &str,
    result: &RuleResult,
    now: i64,
    issues: &mut Vec<ValidationIssue>,
    suggestions: &mut Vec<String>,
) {
    let mut raised = 0usize;
    for action in &result.actions {
        match action {
            ActionResult::RaiseIssue {
                severity,
                message,
                fix_suggestion,
                ..
            } => {
                let fingerprint = match raised {
                    0 => format!("rule:{}", result.rule_id),
                    n => format!("rule:{}#{n}", result.rule_id),
                };
                raised += 1;
                issues.push(
                    ValidationIssue::open(entity, IssueOrigin::Rule, fingerprint, *severity, message.clone(), now)
                        .with_rule(result.rule_id.clone())
                        .with_fix(fix_suggestion.clone()),
                );
            }
            ActionResult::Suggest { suggestion } => suggestions.push(suggestion.clone()),
        }
    }
}

/// Rule issues group under their rule's category, everything else under
/// the check that raised it.
fn story_key(snapshot: &RuleSnapshot, issue: &ValidationIssue) -> String {
    match (issue.origin, &issue.rule_id) {
        (IssueOrigin::Rule, Some(id)) => snapshot
            .get(id.as_str())
            .map(|r| r.category.trim())
            .filter(|c| !c.is_empty())
            .unwrap_or("uncategorized")
            .to_string(),
        (origin, _) => origin.as_str().to_string(),
    }
}

/// Re-detected issues keep the id of the open issue they updated; point the
/// result at the stored ids.
fn adopt_stored_ids(result: &mut ValidationResult, plan: &RunPlan) {
    let mut renamed: HashMap<IssueId, IssueId> = HashMap::new();
    for (issue, stored) in result.issues.iter_mut().zip(&plan.issues) {
        if issue.id != stored.id {
            renamed.insert(issue.id.clone(), stored.id.clone());
        }
        *issue = stored.clone();
    }
    for ids in result.user_story_mappings.values_mut() {
        for id in ids.iter_mut() {
            if let Some(new) = renamed.get(id) {
                *id = new.clone();
            }
        }
    }
}

/// Which of a run's writes have landed. Shared by every attempt of one job.
#[derive(Default)]
struct PersistProgress {
    plan: Option<RunPlan>,
    execution_written: bool,
}

/// One run's writes, cloneable so the background retry can replay it.
/// Attempts skip steps an earlier attempt finished, so the issue plan is
/// computed once and its counts land on the execution row.
#[derive(Clone)]
struct PersistJob {
    storage: Arc<dyn Storage>,
    tracker: IssueTracker,
    issues: Vec<ValidationIssue>,
    complete: bool,
    execution: ValidationExecution,
    progress: Arc<Mutex<PersistProgress>>,
}

impl PersistJob {
    fn call(&self) -> impl FnOnce() -> anyhow::Result<RunPlan> + Send + 'static {
        let job = self.clone();
        move || job.attempt()
    }

    /// Held for the whole attempt: a timed-out attempt still running on the
    /// blocking pool finishes before its retry looks at the progress.
    fn attempt(&self) -> anyhow::Result<RunPlan> {
        let mut progress = self.progress.lock().unwrap_or_else(|p| p.into_inner());
        let plan = match &progress.plan {
            Some(plan) => plan.clone(),
            None => {
                let plan = self
                    .tracker
                    .record_run(&self.execution.entity_id, &self.issues, self.complete)?;
                progress.plan = Some(plan.clone());
                plan
            }
        };
        if !progress.execution_written {
            let mut execution = self.execution.clone();
            execution.issues_found = plan.found;
            execution.issues_resolved = plan.resolved;
            self.storage
                .insert_execution(&execution)
                .with_context(|| format!("insert execution {}", execution.id))?;
            progress.execution_written = true;
        }
        Ok(plan)
    }
}
