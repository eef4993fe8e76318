use std::sync::Arc;

use pve_core::{
    CircularDependency, CompatibilityMatrix, CompatibilityStatus, ConditionValue, IssueOrigin, IssueStatus,
    Operator, ProductConfiguration, ProductId, RelationshipType, RuleAction, RuleCondition, RuleSnapshot,
    RuleType, Severity, ValidationIssue, ValidationRule,
};

fn rule(id: &str, product: Option<&str>, active: bool) -> ValidationRule {
    ValidationRule {
        id: id.into(),
        name: id.to_string(),
        category: "pricing".to_string(),
        rule_type: RuleType::Configuration,
        conditions: vec![],
        actions: vec![RuleAction::SuggestFix { suggestion: "x".into() }],
        severity: Severity::Low,
        is_active: active,
        product_id: product.map(ProductId::from_str),
    }
}

#[test]
fn test_configuration_from_json_applies_defaults() {
    let json = r#"{
        "proposal_id": "p-1",
        "products": [{"id": "A"}, {"id": "B", "license_gated": true, "quantity": 3}],
        "relationships": [{"source_product_id": "A", "target_product_id": "B", "type": "requires"}],
        "context": {"total_price": 15000}
    }"#;
    let cfg: ProductConfiguration = serde_json::from_str(json).unwrap();
    assert_eq!(cfg.products[0].quantity, 1);
    assert!(!cfg.products[0].license_gated);
    assert!(cfg.products[1].license_gated);
    assert_eq!(cfg.relationships[0].relationship_type, RelationshipType::Requires);
    assert!(cfg.is_selected(&ProductId::from_str("B")));
    assert!(!cfg.is_selected(&ProductId::from_str("C")));
}

#[test]
fn test_condition_value_prefers_dates_over_strings() {
    let c: RuleCondition =
        serde_json::from_str(r#"{"attribute":"valid_until","operator":"less_than","value":"2025-01-31"}"#).unwrap();
    assert_eq!(c.operator, Operator::LessThan);
    assert_eq!(c.value.kind(), "date");

    let c: RuleCondition =
        serde_json::from_str(r#"{"attribute":"region","operator":"equals","value":"EMEA"}"#).unwrap();
    assert_eq!(c.value, ConditionValue::String("EMEA".into()));
}

#[test]
fn test_action_tags_are_snake_case() {
    let a: RuleAction = serde_json::from_str(r#"{"type":"flag","label":"high_value"}"#).unwrap();
    assert_eq!(a, RuleAction::Flag { label: "high_value".into(), message: None });
}

#[test]
fn test_snapshot_applicable_rules() {
    let snap = RuleSnapshot {
        version: 3,
        rules: Arc::from(vec![
            rule("global", None, true),
            rule("scoped-a", Some("A"), true),
            rule("scoped-z", Some("Z"), true),
            rule("inactive", None, false),
        ]),
        ..Default::default()
    };
    let selected = vec![ProductId::from_str("A"), ProductId::from_str("B")];
    let ids: Vec<_> = snap.applicable(&selected).iter().map(|r| r.id.as_str().to_string()).collect();
    assert_eq!(ids, vec!["global", "scoped-a"]);
    assert!(snap.get("inactive").is_some());
}

#[test]
fn test_new_issue_is_open() {
    let issue = ValidationIssue::open("p-1", IssueOrigin::License, "license:A", Severity::Critical, "m", 42);
    assert_eq!(issue.status, IssueStatus::Open);
    assert_eq!(issue.entity_type, "proposal");
    assert!(issue.rule_id.is_none());
    assert!(issue.resolved_at_ms.is_none());
}

#[test]
fn test_cycle_length_excludes_closing_node() {
    let cycle = CircularDependency {
        path: vec!["X".into(), "Y".into(), "X".into()],
        severity: Severity::Error,
    };
    assert_eq!(cycle.len(), 2);
    assert_eq!(cycle.fingerprint(), "cycle:X>Y>X");
}

#[test]
fn test_matrix_lookup() {
    let m = CompatibilityMatrix {
        products: vec!["A".into(), "B".into()],
        cells: vec![
            vec![CompatibilityStatus::Compatible, CompatibilityStatus::Incompatible],
            vec![CompatibilityStatus::Incompatible, CompatibilityStatus::Compatible],
        ],
    };
    assert_eq!(m.get(&"A".into(), &"B".into()), Some(CompatibilityStatus::Incompatible));
    assert_eq!(m.get(&"A".into(), &"C".into()), None);
}
