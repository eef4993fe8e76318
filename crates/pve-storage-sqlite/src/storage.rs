use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use pve_core::{
    ExecutionId, IssueId, IssueOrigin, IssueStatus, ProductConfiguration, ProposalId, RawRule, ResolutionMethod,
    RuleId, Severity, ValidationExecution, ValidationIssue, ValidationStatus,
};
use pve_storage::Storage;

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

const ISSUE_COLUMNS: &str = "id, entity_id, entity_type, origin, rule_id, fingerprint, severity, message, \
     fix_suggestion, status, detected_at, resolved_at, resolved_by, resolution_method";

/// Raw column values; enum columns are parsed outside the row callback so a
/// bad value surfaces as an error with context.
struct IssueRow {
    id: String,
    entity_id: String,
    entity_type: String,
    origin: String,
    rule_id: Option<String>,
    fingerprint: String,
    severity: String,
    message: String,
    fix_suggestion: Option<String>,
    status: String,
    detected_at: i64,
    resolved_at: Option<i64>,
    resolved_by: Option<String>,
    resolution_method: Option<String>,
}

impl IssueRow {
    fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            entity_id: r.get(1)?,
            entity_type: r.get(2)?,
            origin: r.get(3)?,
            rule_id: r.get(4)?,
            fingerprint: r.get(5)?,
            severity: r.get(6)?,
            message: r.get(7)?,
            fix_suggestion: r.get(8)?,
            status: r.get(9)?,
            detected_at: r.get(10)?,
            resolved_at: r.get(11)?,
            resolved_by: r.get(12)?,
            resolution_method: r.get(13)?,
        })
    }

    fn into_issue(self) -> Result<ValidationIssue> {
        let resolution_method = match self.resolution_method.as_deref() {
            None => None,
            Some(s) => Some(ResolutionMethod::parse(s).ok_or_else(|| anyhow!("unknown resolution method '{s}'"))?),
        };
        Ok(ValidationIssue {
            origin: IssueOrigin::parse(&self.origin).ok_or_else(|| anyhow!("unknown issue origin '{}'", self.origin))?,
            severity: Severity::parse(&self.severity).ok_or_else(|| anyhow!("unknown severity '{}'", self.severity))?,
            status: IssueStatus::parse(&self.status).ok_or_else(|| anyhow!("unknown issue status '{}'", self.status))?,
            id: IssueId::from_str(self.id),
            entity_id: self.entity_id,
            entity_type: self.entity_type,
            rule_id: self.rule_id.map(RuleId::from_str),
            fingerprint: self.fingerprint,
            message: self.message,
            fix_suggestion: self.fix_suggestion,
            detected_at_ms: self.detected_at,
            resolved_at_ms: self.resolved_at,
            resolved_by: self.resolved_by,
            resolution_method,
        })
    }
}

impl SqliteStorage {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db {}", db_path.display()))?;
        Self::init(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory sqlite db")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        // init schema
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql).context("apply schema migration")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    fn insert_issue_on(conn: &Connection, issue: &ValidationIssue) -> Result<()> {
        conn.execute(
            &format!("INSERT INTO validation_issues({ISSUE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
            params![
                issue.id.as_str(),
                issue.entity_id,
                issue.entity_type,
                issue.origin.as_str(),
                issue.rule_id.as_ref().map(|r| r.as_str()),
                issue.fingerprint,
                issue.severity.as_str(),
                issue.message,
                issue.fix_suggestion,
                issue.status.as_str(),
                issue.detected_at_ms,
                issue.resolved_at_ms,
                issue.resolved_by,
                issue.resolution_method.map(|m| m.as_str()),
            ],
        )
        .with_context(|| format!("insert issue {}", issue.id))?;
        Ok(())
    }

    fn update_issue_on(conn: &Connection, issue: &ValidationIssue) -> Result<()> {
        let n = conn.execute(
            "UPDATE validation_issues SET severity=?1, message=?2, fix_suggestion=?3, status=?4, detected_at=?5,
                resolved_at=?6, resolved_by=?7, resolution_method=?8
             WHERE id=?9",
            params![
                issue.severity.as_str(),
                issue.message,
                issue.fix_suggestion,
                issue.status.as_str(),
                issue.detected_at_ms,
                issue.resolved_at_ms,
                issue.resolved_by,
                issue.resolution_method.map(|m| m.as_str()),
                issue.id.as_str(),
            ],
        )?;
        if n == 0 {
            bail!("issue {} not found", issue.id);
        }
        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn upsert_rule(&self, rule: &RawRule) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO validation_rules(id, name, category, rule_type, conditions_json, actions_json, severity, is_active, product_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name, category=excluded.category, rule_type=excluded.rule_type,
                conditions_json=excluded.conditions_json, actions_json=excluded.actions_json, severity=excluded.severity,
                is_active=excluded.is_active, product_id=excluded.product_id",
            params![
                rule.id,
                rule.name,
                rule.category,
                rule.rule_type,
                serde_json::to_string(&rule.conditions)?,
                serde_json::to_string(&rule.actions)?,
                rule.severity,
                rule.is_active,
                rule.product_id,
            ],
        )
        .with_context(|| format!("upsert rule {}", rule.id))?;
        Ok(())
    }

    fn load_rules(&self) -> Result<Vec<RawRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, category, rule_type, conditions_json, actions_json, severity, is_active, product_id
             FROM validation_rules ORDER BY id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, bool>(7)?,
                r.get::<_, Option<String>>(8)?,
            ))
        })?;
        let mut rules = vec![];
        for row in rows {
            let (id, name, category, rule_type, conditions, actions, severity, is_active, product_id) = row?;
            rules.push(RawRule {
                conditions: serde_json::from_str(&conditions).with_context(|| format!("rule {id} conditions"))?,
                actions: serde_json::from_str(&actions).with_context(|| format!("rule {id} actions"))?,
                id,
                name,
                category,
                rule_type,
                severity,
                is_active,
                product_id,
            });
        }
        Ok(rules)
    }

    fn save_configuration(&self, config: &ProductConfiguration) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO product_configurations(proposal_id, config_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(proposal_id) DO UPDATE SET config_json=excluded.config_json, updated_at=excluded.updated_at",
            params![config.proposal_id.as_str(), serde_json::to_string(config)?, pve_core::now_ms()],
        )?;
        Ok(())
    }

    fn load_configuration(&self, proposal_id: &ProposalId) -> Result<Option<ProductConfiguration>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT config_json FROM product_configurations WHERE proposal_id=?1",
                params![proposal_id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).with_context(|| format!("configuration {proposal_id}")))
            .transpose()
    }

    fn insert_issue(&self, issue: &ValidationIssue) -> Result<()> {
        let conn = self.conn()?;
        Self::insert_issue_on(&conn, issue)
    }

    fn update_issue(&self, issue: &ValidationIssue) -> Result<()> {
        let conn = self.conn()?;
        Self::update_issue_on(&conn, issue)
    }

    fn get_issue(&self, id: &IssueId) -> Result<Option<ValidationIssue>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {ISSUE_COLUMNS} FROM validation_issues WHERE id=?1"),
                params![id.as_str()],
                IssueRow::from_row,
            )
            .optional()?;
        row.map(IssueRow::into_issue).transpose()
    }

    fn list_issues(&self, entity_id: &str, status: Option<IssueStatus>) -> Result<Vec<ValidationIssue>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ISSUE_COLUMNS} FROM validation_issues
             WHERE entity_id=?1 AND (?2 IS NULL OR status=?2)
             ORDER BY seq"
        ))?;
        let rows = stmt.query_map(params![entity_id, status.map(|s| s.as_str())], IssueRow::from_row)?;
        let mut issues = vec![];
        for row in rows {
            issues.push(row?.into_issue()?);
        }
        Ok(issues)
    }

    fn record_issues(&self, inserts: &[ValidationIssue], updates: &[ValidationIssue]) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        for issue in inserts {
            Self::insert_issue_on(&tx, issue)?;
        }
        for issue in updates {
            Self::update_issue_on(&tx, issue)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_execution(&self, execution: &ValidationExecution) -> Result<()> {
        let conn = self.conn()?;
        let rule_ids: Vec<&str> = execution.rule_ids.iter().map(|r| r.as_str()).collect();
        conn.execute(
            "INSERT INTO validation_executions(id, entity_id, entity_type, rule_ids_json, execution_time_ms, issues_found,
                issues_resolved, performance_score, triggered_by, timestamp, snapshot_version, status, incomplete)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                execution.id.as_str(),
                execution.entity_id,
                execution.entity_type,
                serde_json::to_string(&rule_ids)?,
                execution.execution_time_ms as i64,
                execution.issues_found,
                execution.issues_resolved,
                execution.performance_score,
                execution.triggered_by,
                execution.timestamp_ms,
                execution.snapshot_version as i64,
                execution.status.as_str(),
                execution.incomplete,
            ],
        )
        .with_context(|| format!("insert execution {}", execution.id))?;
        Ok(())
    }

    fn list_executions(&self, entity_id: &str) -> Result<Vec<ValidationExecution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entity_id, entity_type, rule_ids_json, execution_time_ms, issues_found, issues_resolved,
                performance_score, triggered_by, timestamp, snapshot_version, status, incomplete
             FROM validation_executions WHERE entity_id=?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![entity_id], |r| {
            Ok((
                ExecutionId::from_str(r.get::<_, String>(0)?),
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, u32>(5)?,
                r.get::<_, u32>(6)?,
                r.get::<_, f64>(7)?,
                r.get::<_, String>(8)?,
                r.get::<_, i64>(9)?,
                r.get::<_, i64>(10)?,
                r.get::<_, String>(11)?,
                r.get::<_, bool>(12)?,
            ))
        })?;
        let mut out = vec![];
        for row in rows {
            let (id, entity_id, entity_type, rule_ids, time_ms, found, resolved, score, triggered_by, ts, version, status, incomplete) =
                row?;
            let rule_ids: Vec<String> = serde_json::from_str(&rule_ids).with_context(|| format!("execution {id} rule ids"))?;
            out.push(ValidationExecution {
                id,
                entity_id,
                entity_type,
                rule_ids: rule_ids.into_iter().map(RuleId::from_str).collect(),
                execution_time_ms: u64::try_from(time_ms).unwrap_or_default(),
                issues_found: found,
                issues_resolved: resolved,
                performance_score: score,
                triggered_by,
                timestamp_ms: ts,
                snapshot_version: u64::try_from(version).unwrap_or_default(),
                status: ValidationStatus::parse(&status).ok_or_else(|| anyhow!("unknown validation status '{status}'"))?,
                incomplete,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pve_core::{SelectedProduct, ValidationStatus};
    use serde_json::json;
    use tempfile::tempdir;

    fn raw(id: &str) -> RawRule {
        RawRule {
            id: id.to_string(),
            name: "High value".to_string(),
            category: "pricing".to_string(),
            rule_type: "configuration".to_string(),
            conditions: json!([{"attribute": "total_price", "operator": "greater_than", "value": 10000}]),
            actions: json!([{"type": "flag", "label": "high_value"}]),
            severity: "medium".to_string(),
            is_active: true,
            product_id: None,
        }
    }

    #[test]
    fn sqlite_open_and_migrate() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("pve.db");
        let _ = SqliteStorage::open(&db_path).unwrap();
        // Reopening applies the idempotent schema again.
        let _ = SqliteStorage::open(&db_path).unwrap();
    }

    #[test]
    fn rules_round_trip_and_upsert() {
        let dir = tempdir().unwrap();
        let store = SqliteStorage::open(&dir.path().join("pve.db")).unwrap();
        store.upsert_rule(&raw("high-value")).unwrap();
        let mut changed = raw("high-value");
        changed.is_active = false;
        changed.product_id = Some("A".into());
        store.upsert_rule(&changed).unwrap();
        let rules = store.load_rules().unwrap();
        assert_eq!(rules, vec![changed]);
    }

    #[test]
    fn configuration_round_trip() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let cfg = ProductConfiguration {
            proposal_id: "p-1".into(),
            products: vec![SelectedProduct {
                id: "A".into(),
                name: "Alpha".into(),
                license_gated: true,
                quantity: 2,
                attributes: Default::default(),
            }],
            relationships: vec![],
            context: [("total_price".to_string(), json!(15000))].into_iter().collect(),
        };
        store.save_configuration(&cfg).unwrap();
        assert_eq!(store.load_configuration(&"p-1".into()).unwrap(), Some(cfg));
        assert_eq!(store.load_configuration(&"p-2".into()).unwrap(), None);
    }

    #[test]
    fn issues_keep_detection_order_and_filter_by_status() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let a = ValidationIssue::open("p-1", IssueOrigin::License, "license:A", Severity::Critical, "a", 1);
        let b = ValidationIssue::open("p-1", IssueOrigin::Rule, "rule:r", Severity::Medium, "b", 2)
            .with_rule("r".into())
            .with_fix(Some("fix".into()));
        store.record_issues(&[a.clone(), b.clone()], &[]).unwrap();

        let mut resolved = a.clone();
        resolved.status = IssueStatus::Resolved;
        resolved.resolved_at_ms = Some(5);
        resolved.resolved_by = Some("system".into());
        resolved.resolution_method = Some(ResolutionMethod::Auto);
        store.record_issues(&[], &[resolved.clone()]).unwrap();

        let all = store.list_issues("p-1", None).unwrap();
        assert_eq!(all, vec![resolved.clone(), b.clone()]);
        assert_eq!(store.list_issues("p-1", Some(IssueStatus::Open)).unwrap(), vec![b]);
        assert_eq!(store.get_issue(&a.id).unwrap(), Some(resolved));
    }

    #[test]
    fn failed_batch_rolls_back() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let a = ValidationIssue::open("p-1", IssueOrigin::License, "license:A", Severity::Critical, "a", 1);
        let ghost = ValidationIssue::open("p-1", IssueOrigin::Rule, "rule:x", Severity::Low, "x", 1);
        assert!(store.record_issues(&[a], &[ghost]).is_err());
        assert!(store.list_issues("p-1", None).unwrap().is_empty());
    }

    #[test]
    fn executions_round_trip() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let exec = ValidationExecution {
            id: ExecutionId::from_str("e-1"),
            entity_id: "p-1".into(),
            entity_type: "proposal".into(),
            rule_ids: vec!["a".into(), "b".into()],
            execution_time_ms: 12,
            issues_found: 2,
            issues_resolved: 1,
            performance_score: 99.4,
            triggered_by: "cli".into(),
            timestamp_ms: 1_700_000_000_000,
            snapshot_version: 3,
            status: ValidationStatus::Warning,
            incomplete: false,
        };
        store.insert_execution(&exec).unwrap();
        assert_eq!(store.list_executions("p-1").unwrap(), vec![exec]);
    }
}
