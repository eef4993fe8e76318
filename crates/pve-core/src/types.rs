use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{ids::*, model::*};

/// Free-form attributes a rule can read (`total_price`, `customer.tier`, ...).
pub type Context = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Rule definition as persisted: conditions and actions are loosely typed
/// JSON until a snapshot is built from it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RawRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    pub rule_type: String,
    #[serde(default)]
    pub conditions: serde_json::Value,
    #[serde(default)]
    pub actions: serde_json::Value,
    pub severity: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub product_id: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Normalised condition operand.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    Number(f64),
    Date(NaiveDate),
    String(String),
}

impl ConditionValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ConditionValue::Bool(_) => "boolean",
            ConditionValue::Number(_) => "number",
            ConditionValue::Date(_) => "date",
            ConditionValue::String(_) => "string",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub attribute: String,
    pub operator: Operator,
    pub value: ConditionValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Raise an issue; severity defaults to the rule's.
    EmitIssue {
        message: String,
        #[serde(default)]
        severity: Option<Severity>,
        #[serde(default)]
        fix_suggestion: Option<String>,
    },
    /// Attach a suggestion to the result without raising an issue.
    SuggestFix { suggestion: String },
    /// Raise a `warning` issue labelled for follow-up.
    Flag {
        label: String,
        #[serde(default)]
        message: Option<String>,
    },
}

/// Type-checked rule. Immutable once part of a snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: RuleId,
    pub name: String,
    pub category: String,
    pub rule_type: RuleType,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    pub severity: Severity,
    pub is_active: bool,
    pub product_id: Option<ProductId>,
}

impl ValidationRule {
    /// Global rules apply to every configuration; scoped rules only when
    /// their product is selected.
    pub fn is_global(&self) -> bool {
        self.product_id.is_none()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuleFilter {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub rule_type: Option<RuleType>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl RuleFilter {
    pub fn matches(&self, rule: &ValidationRule) -> bool {
        self.category.as_ref().map_or(true, |c| &rule.category == c)
            && self.rule_type.map_or(true, |t| rule.rule_type == t)
            && self.is_active.map_or(true, |a| rule.is_active == a)
    }
}

// ---------------------------------------------------------------------------
// Configuration under validation
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SelectedProduct {
    pub id: ProductId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub license_gated: bool,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub attributes: Context,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProductRelationship {
    pub source_product_id: ProductId,
    pub target_product_id: ProductId,
    #[serde(rename = "type")]
    pub relationship_type: RelationshipType,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProductConfiguration {
    pub proposal_id: ProposalId,
    #[serde(default)]
    pub products: Vec<SelectedProduct>,
    #[serde(default)]
    pub relationships: Vec<ProductRelationship>,
    #[serde(default)]
    pub context: Context,
}

impl ProductConfiguration {
    pub fn product(&self, id: &ProductId) -> Option<&SelectedProduct> {
        self.products.iter().find(|p| &p.id == id)
    }

    pub fn is_selected(&self, id: &ProductId) -> bool {
        self.product(id).is_some()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Entitlement {
    pub product_id: ProductId,
    #[serde(default)]
    pub license_key: Option<String>,
    #[serde(default)]
    pub expires_on: Option<NaiveDate>,
}

// ---------------------------------------------------------------------------
// Issues and executions
// ---------------------------------------------------------------------------

pub const PROPOSAL_ENTITY: &str = "proposal";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationIssue {
    pub id: IssueId,
    pub entity_id: String,
    pub entity_type: String,
    pub origin: IssueOrigin,
    #[serde(default)]
    pub rule_id: Option<RuleId>,
    /// Identifies "the same problem" across runs.
    pub fingerprint: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub fix_suggestion: Option<String>,
    pub status: IssueStatus,
    pub detected_at_ms: i64,
    #[serde(default)]
    pub resolved_at_ms: Option<i64>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub resolution_method: Option<ResolutionMethod>,
}

impl ValidationIssue {
    pub fn open(
        entity_id: impl Into<String>,
        origin: IssueOrigin,
        fingerprint: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        detected_at_ms: i64,
    ) -> Self {
        Self {
            id: IssueId::new(),
            entity_id: entity_id.into(),
            entity_type: PROPOSAL_ENTITY.to_string(),
            origin,
            rule_id: None,
            fingerprint: fingerprint.into(),
            severity,
            message: message.into(),
            fix_suggestion: None,
            status: IssueStatus::Open,
            detected_at_ms,
            resolved_at_ms: None,
            resolved_by: None,
            resolution_method: None,
        }
    }

    pub fn with_rule(mut self, rule_id: RuleId) -> Self {
        self.rule_id = Some(rule_id);
        self
    }

    pub fn with_fix(mut self, fix: Option<String>) -> Self {
        self.fix_suggestion = fix;
        self
    }
}

/// Audit record for one batch run. Written once.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationExecution {
    pub id: ExecutionId,
    pub entity_id: String,
    pub entity_type: String,
    pub rule_ids: Vec<RuleId>,
    pub execution_time_ms: u64,
    pub issues_found: u32,
    pub issues_resolved: u32,
    pub performance_score: f64,
    pub triggered_by: String,
    pub timestamp_ms: i64,
    pub snapshot_version: u64,
    pub status: ValidationStatus,
    pub incomplete: bool,
}

// ---------------------------------------------------------------------------
// Derived compatibility output
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProductCompatibility {
    pub product_a: ProductId,
    pub product_b: ProductId,
    pub status: CompatibilityStatus,
    /// Strongest relationship that decided the status.
    #[serde(default)]
    pub relationship: Option<RelationshipType>,
    /// Set for malformed relationship data.
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CircularDependency {
    /// Closed path: first and last entries are the same product.
    pub path: Vec<ProductId>,
    pub severity: Severity,
}

impl CircularDependency {
    /// Number of distinct products on the cycle.
    pub fn len(&self) -> usize {
        self.path.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fingerprint(&self) -> String {
        let ids: Vec<&str> = self.path.iter().map(|p| p.as_str()).collect();
        format!("cycle:{}", ids.join(">"))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LicenseConflict {
    pub product_id: ProductId,
    pub kind: LicenseConflictKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MissingRequirement {
    pub product_id: ProductId,
    pub requires: ProductId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompatibilityResult {
    pub status: CompatibilityStatus,
    pub pairs: Vec<ProductCompatibility>,
    pub circular_dependencies: Vec<CircularDependency>,
    pub license_conflicts: Vec<LicenseConflict>,
    pub missing_requirements: Vec<MissingRequirement>,
    pub malformed: Vec<ProductCompatibility>,
    pub recommendations: Vec<String>,
    /// False when the deadline expired before every pair/root was visited.
    pub complete: bool,
}

impl Default for CompatibilityResult {
    fn default() -> Self {
        Self {
            status: CompatibilityStatus::Compatible,
            pairs: vec![],
            circular_dependencies: vec![],
            license_conflicts: vec![],
            missing_requirements: vec![],
            malformed: vec![],
            recommendations: vec![],
            complete: true,
        }
    }
}

impl CompatibilityResult {
    pub fn pair(&self, a: &ProductId, b: &ProductId) -> Option<&ProductCompatibility> {
        self.pairs.iter().find(|p| {
            (&p.product_a == a && &p.product_b == b) || (&p.product_a == b && &p.product_b == a)
        })
    }
}

/// N x N pairwise statuses, rows and columns in `products` order.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompatibilityMatrix {
    pub products: Vec<ProductId>,
    pub cells: Vec<Vec<CompatibilityStatus>>,
}

impl CompatibilityMatrix {
    pub fn get(&self, a: &ProductId, b: &ProductId) -> Option<CompatibilityStatus> {
        let i = self.products.iter().position(|p| p == a)?;
        let j = self.products.iter().position(|p| p == b)?;
        Some(self.cells[i][j])
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfigurationValidationResult {
    pub compatibility: CompatibilityResult,
    pub matrix: CompatibilityMatrix,
}

impl ConfigurationValidationResult {
    pub fn compose(
        mut compatibility: CompatibilityResult,
        matrix: CompatibilityMatrix,
        license_conflicts: Vec<LicenseConflict>,
    ) -> Self {
        compatibility.license_conflicts = license_conflicts;
        Self { compatibility, matrix }
    }
}

// ---------------------------------------------------------------------------
// Run output
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub proposal_id: ProposalId,
    pub status: ValidationStatus,
    pub run_state: RunState,
    /// Some checker did not finish within the run budget.
    pub incomplete: bool,
    pub issues: Vec<ValidationIssue>,
    pub suggestions: Vec<String>,
    pub execution_time_ms: u64,
    /// Issue ids grouped by rule category (rule issues) or check name.
    pub user_story_mappings: BTreeMap<String, Vec<IssueId>>,
    pub snapshot_version: u64,
    pub rules_executed: Vec<RuleId>,
    #[serde(default)]
    pub compatibility: Option<ConfigurationValidationResult>,
    /// The audit/issue write failed and is being retried in the background.
    #[serde(default)]
    pub persistence_pending: bool,
}
