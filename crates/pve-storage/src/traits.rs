use pve_core::{
    IssueId, IssueStatus, ProductConfiguration, ProposalId, RawRule, ValidationExecution, ValidationIssue,
};

/// Persistence collaborator. Synchronous; async callers go through
/// `spawn_blocking`.
pub trait Storage: Send + Sync {
    /// Insert or replace by rule id.
    fn upsert_rule(&self, rule: &RawRule) -> anyhow::Result<()>;
    /// Every persisted definition, ordered by id.
    fn load_rules(&self) -> anyhow::Result<Vec<RawRule>>;

    fn save_configuration(&self, config: &ProductConfiguration) -> anyhow::Result<()>;
    fn load_configuration(&self, proposal_id: &ProposalId) -> anyhow::Result<Option<ProductConfiguration>>;

    fn insert_issue(&self, issue: &ValidationIssue) -> anyhow::Result<()>;
    /// Replaces the stored issue with the same id; an unknown id is an error.
    fn update_issue(&self, issue: &ValidationIssue) -> anyhow::Result<()>;
    fn get_issue(&self, id: &IssueId) -> anyhow::Result<Option<ValidationIssue>>;
    /// Issues for one entity in detection order.
    fn list_issues(&self, entity_id: &str, status: Option<IssueStatus>) -> anyhow::Result<Vec<ValidationIssue>>;

    /// Applies one run's issue bookkeeping. Stores that support it do this
    /// atomically.
    fn record_issues(&self, inserts: &[ValidationIssue], updates: &[ValidationIssue]) -> anyhow::Result<()> {
        for issue in inserts {
            self.insert_issue(issue)?;
        }
        for issue in updates {
            self.update_issue(issue)?;
        }
        Ok(())
    }

    fn insert_execution(&self, execution: &ValidationExecution) -> anyhow::Result<()>;
    /// Audit records for one entity, oldest first.
    fn list_executions(&self, entity_id: &str) -> anyhow::Result<Vec<ValidationExecution>>;
}
