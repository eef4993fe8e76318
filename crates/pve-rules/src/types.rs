use std::collections::HashMap;

use pve_core::{Context, ProductConfiguration, ProductId, RuleId, Severity, ValidationRule};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Rejection reasons for a persisted rule definition.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuleLoadError {
    #[error("rule id must not be blank")]
    BlankId,
    #[error("unknown rule type '{0}'")]
    UnknownRuleType(String),
    #[error("severity '{0}' is not one of critical|high|medium|low")]
    UnknownSeverity(String),
    #[error("{field} must be a list")]
    NotAList { field: &'static str },
    #[error("condition[{index}]: {reason}")]
    MalformedCondition { index: usize, reason: String },
    #[error("condition[{index}]: unknown operator '{operator}'")]
    UnknownOperator { index: usize, operator: String },
    #[error("condition[{index}]: {kind} value cannot be compared with '{operator}'")]
    OperatorKindMismatch { index: usize, operator: &'static str, kind: &'static str },
    #[error("action[{index}]: {reason}")]
    MalformedAction { index: usize, reason: String },
    #[error("rule has no actions")]
    NoActions,
}

/// Failure inside one rule's evaluation. Isolated to that rule.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuleEvaluationError {
    #[error("attribute '{attribute}': expected {expected}, found {found}")]
    TypeMismatch { attribute: String, expected: &'static str, found: String },
    #[error("message placeholder '{{{placeholder}}}' has no context value")]
    UnknownPlaceholder { placeholder: String },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Warning,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RuleDiagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
}

/// Intended effect of one action. The orchestrator turns these into issues
/// and suggestions; nothing is applied here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum ActionResult {
    RaiseIssue {
        severity: Severity,
        message: String,
        #[serde(default)]
        fix_suggestion: Option<String>,
        #[serde(default)]
        label: Option<String>,
    },
    Suggest { suggestion: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RuleResult {
    pub rule_id: RuleId,
    pub matched: bool,
    pub actions: Vec<ActionResult>,
    pub diagnostics: Vec<RuleDiagnostic>,
}

impl RuleResult {
    pub fn empty(rule_id: RuleId) -> Self {
        Self {
            rule_id,
            matched: false,
            actions: vec![],
            diagnostics: vec![],
        }
    }

    pub fn failed(&self) -> bool {
        self.diagnostics.iter().any(|d| d.level == DiagnosticLevel::Error)
    }
}

#[derive(Clone, Debug, Default)]
pub struct RulesetOutcome {
    pub results: Vec<RuleResult>,
    /// False when the deadline expired before every rule ran.
    pub complete: bool,
}

/// Attribute lookup for condition evaluation.
#[derive(Clone, Debug, Default)]
pub struct RuleContext {
    values: Context,
}

impl RuleContext {
    pub fn new(values: Context) -> Self {
        Self { values }
    }

    /// Context attributes plus derived `product_count`, `products` and
    /// `total_quantity` (explicit attributes win).
    pub fn for_configuration(config: &ProductConfiguration) -> Self {
        let mut values = config.context.clone();
        let ids: Vec<Value> = config.products.iter().map(|p| Value::from(p.id.as_str())).collect();
        let total_quantity: u64 = config.products.iter().map(|p| u64::from(p.quantity)).sum();
        values.entry("product_count".into()).or_insert_with(|| Value::from(config.products.len()));
        values.entry("products".into()).or_insert_with(|| Value::Array(ids));
        values.entry("total_quantity".into()).or_insert_with(|| Value::from(total_quantity));
        Self { values }
    }

    /// Copy of this context with `product.*` bound to one selected product.
    pub fn scoped_to(&self, config: &ProductConfiguration, product_id: &ProductId) -> Self {
        let mut values = self.values.clone();
        if let Some(p) = config.product(product_id) {
            let mut obj = serde_json::Map::new();
            for (k, v) in &p.attributes {
                obj.insert(k.clone(), v.clone());
            }
            obj.insert("id".into(), Value::from(p.id.as_str()));
            obj.insert("name".into(), Value::from(p.name.clone()));
            obj.insert("quantity".into(), Value::from(p.quantity));
            obj.insert("license_gated".into(), Value::from(p.license_gated));
            values.insert("product".into(), Value::Object(obj));
        }
        Self { values }
    }

    /// Exact key first, then a dotted walk through nested objects.
    pub fn get(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.values.get(path) {
            return Some(v);
        }
        let mut parts = path.split('.');
        let mut cur = self.values.get(parts.next()?)?;
        for part in parts {
            cur = cur.as_object()?.get(part)?;
        }
        Some(cur)
    }
}

/// Global context plus one scoped context per selected product, built once
/// per run and shared read-only by every rule.
#[derive(Clone, Debug, Default)]
pub struct ContextSet {
    pub global: RuleContext,
    pub scoped: HashMap<ProductId, RuleContext>,
}

impl ContextSet {
    pub fn from_configuration(config: &ProductConfiguration) -> Self {
        let global = RuleContext::for_configuration(config);
        let scoped = config
            .products
            .iter()
            .map(|p| (p.id.clone(), global.scoped_to(config, &p.id)))
            .collect();
        Self { global, scoped }
    }

    pub fn for_rule(&self, rule: &ValidationRule) -> &RuleContext {
        rule.product_id
            .as_ref()
            .and_then(|p| self.scoped.get(p))
            .unwrap_or(&self.global)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pve_core::{ProposalId, SelectedProduct};
    use serde_json::json;

    fn config() -> ProductConfiguration {
        let mut attrs = Context::new();
        attrs.insert("tier".into(), json!("gold"));
        ProductConfiguration {
            proposal_id: ProposalId::from_str("p-1"),
            products: vec![
                SelectedProduct {
                    id: "A".into(),
                    name: "Alpha".into(),
                    license_gated: false,
                    quantity: 2,
                    attributes: attrs,
                },
                SelectedProduct {
                    id: "B".into(),
                    name: "Beta".into(),
                    license_gated: true,
                    quantity: 3,
                    attributes: Context::new(),
                },
            ],
            relationships: vec![],
            context: [("customer".to_string(), json!({"region": "EMEA"}))].into_iter().collect(),
        }
    }

    #[test]
    fn derived_attributes_are_present() {
        let ctx = RuleContext::for_configuration(&config());
        assert_eq!(ctx.get("product_count"), Some(&json!(2)));
        assert_eq!(ctx.get("total_quantity"), Some(&json!(5)));
        assert_eq!(ctx.get("products"), Some(&json!(["A", "B"])));
    }

    #[test]
    fn dotted_paths_walk_nested_objects() {
        let ctx = RuleContext::for_configuration(&config());
        assert_eq!(ctx.get("customer.region"), Some(&json!("EMEA")));
        assert_eq!(ctx.get("customer.missing"), None);
        assert_eq!(ctx.get("nothing"), None);
    }

    #[test]
    fn scoped_context_exposes_product_attributes() {
        let cfg = config();
        let set = ContextSet::from_configuration(&cfg);
        let ctx = &set.scoped[&ProductId::from_str("A")];
        assert_eq!(ctx.get("product.tier"), Some(&json!("gold")));
        assert_eq!(ctx.get("product.quantity"), Some(&json!(2)));
        assert_eq!(set.global.get("product.tier"), None);
    }
}
