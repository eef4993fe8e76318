use chrono::NaiveDate;
use pve_core::{
    ConditionValue, Operator, ProductId, RawRule, RuleAction, RuleCondition, RuleId, RuleType, Severity,
    ValidationRule,
};
use serde_json::Value;
use tracing::warn;

use crate::types::RuleLoadError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Type-check one persisted definition. Everything that could fail during
/// evaluation because of the definition's shape fails here instead.
pub fn parse_rule(raw: &RawRule) -> Result<ValidationRule, RuleLoadError> {
    if raw.id.trim().is_empty() {
        return Err(RuleLoadError::BlankId);
    }
    let rule_type =
        RuleType::parse(&raw.rule_type).ok_or_else(|| RuleLoadError::UnknownRuleType(raw.rule_type.clone()))?;
    let severity = Severity::parse(&raw.severity)
        .filter(|s| Severity::RULE_LEVELS.contains(s))
        .ok_or_else(|| RuleLoadError::UnknownSeverity(raw.severity.clone()))?;

    let conditions = as_list(&raw.conditions, "conditions")?
        .iter()
        .enumerate()
        .map(|(i, v)| parse_condition(i, v))
        .collect::<Result<Vec<_>, _>>()?;

    let actions = as_list(&raw.actions, "actions")?
        .iter()
        .enumerate()
        .map(|(i, v)| parse_action(i, v))
        .collect::<Result<Vec<_>, _>>()?;
    if actions.is_empty() {
        return Err(RuleLoadError::NoActions);
    }

    Ok(ValidationRule {
        id: RuleId::from_str(raw.id.trim()),
        name: raw.name.clone(),
        category: raw.category.clone(),
        rule_type,
        conditions,
        actions,
        severity,
        is_active: raw.is_active,
        product_id: raw
            .product_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(ProductId::from_str),
    })
}

/// Parse every definition, logging and skipping the ones that fail.
pub fn parse_rules(raws: &[RawRule]) -> (Vec<ValidationRule>, Vec<(String, RuleLoadError)>) {
    let mut rules = Vec::with_capacity(raws.len());
    let mut rejected = vec![];
    for raw in raws {
        match parse_rule(raw) {
            Ok(rule) => rules.push(rule),
            Err(e) => {
                warn!(rule_id = %raw.id, error = %e, "rejecting malformed rule");
                rejected.push((raw.id.clone(), e));
            }
        }
    }
    (rules, rejected)
}

fn as_list<'a>(v: &'a Value, field: &'static str) -> Result<&'a [Value], RuleLoadError> {
    match v {
        Value::Null => Ok(&[]),
        Value::Array(items) => Ok(items),
        _ => Err(RuleLoadError::NotAList { field }),
    }
}

fn parse_condition(index: usize, v: &Value) -> Result<RuleCondition, RuleLoadError> {
    let malformed = |reason: &str| RuleLoadError::MalformedCondition {
        index,
        reason: reason.to_string(),
    };
    let obj = v.as_object().ok_or_else(|| malformed("must be an object"))?;
    let attribute = obj
        .get("attribute")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| malformed("missing attribute"))?;
    let op_str = obj
        .get("operator")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing operator"))?;
    let operator = Operator::parse(op_str).ok_or_else(|| RuleLoadError::UnknownOperator {
        index,
        operator: op_str.to_string(),
    })?;
    let raw_value = obj.get("value").ok_or_else(|| malformed("missing value"))?;
    let value = normalize_value(raw_value).ok_or_else(|| malformed("value must be a string, number or boolean"))?;

    check_operator_kind(index, operator, &value)?;

    Ok(RuleCondition {
        attribute: attribute.to_string(),
        operator,
        value,
    })
}

/// Strings in `YYYY-MM-DD` form become dates; null, lists and objects have
/// no comparable kind.
pub fn normalize_value(v: &Value) -> Option<ConditionValue> {
    match v {
        Value::Bool(b) => Some(ConditionValue::Bool(*b)),
        Value::Number(n) => n.as_f64().map(ConditionValue::Number),
        Value::String(s) => Some(match parse_date(s) {
            Some(d) => ConditionValue::Date(d),
            None => ConditionValue::String(s.clone()),
        }),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    if s.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

fn check_operator_kind(index: usize, operator: Operator, value: &ConditionValue) -> Result<(), RuleLoadError> {
    let ok = match operator {
        Operator::Equals | Operator::NotEquals => true,
        Operator::Contains => !matches!(value, ConditionValue::Date(_)),
        Operator::GreaterThan | Operator::LessThan => {
            matches!(value, ConditionValue::Number(_) | ConditionValue::Date(_))
        }
    };
    if ok {
        Ok(())
    } else {
        Err(RuleLoadError::OperatorKindMismatch {
            index,
            operator: operator.as_str(),
            kind: value.kind(),
        })
    }
}

fn parse_action(index: usize, v: &Value) -> Result<RuleAction, RuleLoadError> {
    let action: RuleAction = serde_json::from_value(v.clone()).map_err(|e| RuleLoadError::MalformedAction {
        index,
        reason: e.to_string(),
    })?;
    let blank = match &action {
        RuleAction::EmitIssue { message, .. } => message.trim().is_empty(),
        RuleAction::SuggestFix { suggestion } => suggestion.trim().is_empty(),
        RuleAction::Flag { label, .. } => label.trim().is_empty(),
    };
    if blank {
        return Err(RuleLoadError::MalformedAction {
            index,
            reason: "text must not be blank".to_string(),
        });
    }
    Ok(action)
}
