use std::cmp::Ordering;

use chrono::NaiveDate;
use pve_core::{ConditionValue, Deadline, Operator, RuleAction, RuleCondition, Severity, ValidationRule};
use serde_json::Value;
use tracing::{debug, warn};

use crate::parse::parse_date;
use crate::types::{
    ActionResult, ContextSet, DiagnosticLevel, RuleContext, RuleDiagnostic, RuleEvaluationError, RuleResult,
    RulesetOutcome,
};

/// Evaluates type-checked rules against a read-only context. Stateless; a
/// single executor is shared by every worker of a run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuleExecutor;

enum Verdict {
    Holds,
    Fails,
    /// Attribute absent from the context: false, with a diagnostic.
    Missing(String),
}

impl RuleExecutor {
    pub fn new() -> Self {
        Self
    }

    /// AND over the conditions, stopping at the first one that does not hold.
    /// Evaluation errors are contained in the returned result.
    pub fn execute_rule(&self, rule: &ValidationRule, ctx: &RuleContext) -> RuleResult {
        let mut result = RuleResult::empty(rule.id.clone());
        match self.evaluate(rule, ctx, &mut result.diagnostics) {
            Ok(true) => match self.execute_actions(rule, ctx) {
                Ok(actions) => {
                    result.matched = true;
                    result.actions = actions;
                }
                Err(e) => fail(&mut result, e),
            },
            Ok(false) => {}
            Err(e) => fail(&mut result, e),
        }
        debug!(rule_id = %rule.id, matched = result.matched, actions = result.actions.len(), "rule evaluated");
        result
    }

    /// Effects of a matched rule. Nothing is applied here.
    pub fn execute_actions(
        &self,
        rule: &ValidationRule,
        ctx: &RuleContext,
    ) -> Result<Vec<ActionResult>, RuleEvaluationError> {
        rule.actions
            .iter()
            .map(|action| match action {
                RuleAction::EmitIssue {
                    message,
                    severity,
                    fix_suggestion,
                } => Ok(ActionResult::RaiseIssue {
                    severity: severity.unwrap_or(rule.severity),
                    message: interpolate(message, ctx)?,
                    fix_suggestion: fix_suggestion.as_deref().map(|f| interpolate(f, ctx)).transpose()?,
                    label: None,
                }),
                RuleAction::SuggestFix { suggestion } => Ok(ActionResult::Suggest {
                    suggestion: interpolate(suggestion, ctx)?,
                }),
                RuleAction::Flag { label, message } => {
                    let message = match message {
                        Some(m) => interpolate(m, ctx)?,
                        None => format!("{} ({label})", rule.name),
                    };
                    Ok(ActionResult::RaiseIssue {
                        severity: Severity::Warning,
                        message,
                        fix_suggestion: None,
                        label: Some(label.clone()),
                    })
                }
            })
            .collect()
    }

    pub fn execute_ruleset<'a, I>(&self, rules: I, ctx: &RuleContext) -> Vec<RuleResult>
    where
        I: IntoIterator<Item = &'a ValidationRule>,
    {
        rules.into_iter().map(|r| self.execute_rule(r, ctx)).collect()
    }

    /// Like `execute_ruleset`, but each rule sees its own scoped context and
    /// the loop stops once `deadline` expires.
    pub fn execute_ruleset_until<'a, I>(&self, rules: I, contexts: &ContextSet, deadline: Deadline) -> RulesetOutcome
    where
        I: IntoIterator<Item = &'a ValidationRule>,
    {
        let mut results = vec![];
        for rule in rules {
            if deadline.expired() {
                warn!(evaluated = results.len(), "rule deadline expired");
                return RulesetOutcome {
                    results,
                    complete: false,
                };
            }
            results.push(self.execute_rule(rule, contexts.for_rule(rule)));
        }
        RulesetOutcome {
            results,
            complete: true,
        }
    }

    fn evaluate(
        &self,
        rule: &ValidationRule,
        ctx: &RuleContext,
        diagnostics: &mut Vec<RuleDiagnostic>,
    ) -> Result<bool, RuleEvaluationError> {
        for cond in &rule.conditions {
            match check_condition(cond, ctx)? {
                Verdict::Holds => {}
                Verdict::Fails => return Ok(false),
                Verdict::Missing(attribute) => {
                    warn!(rule_id = %rule.id, %attribute, "condition attribute missing from context");
                    diagnostics.push(RuleDiagnostic {
                        level: DiagnosticLevel::Warning,
                        message: format!("attribute '{attribute}' not present in context"),
                    });
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

fn fail(result: &mut RuleResult, e: RuleEvaluationError) {
    warn!(rule_id = %result.rule_id, error = %e, "rule evaluation failed");
    result.matched = false;
    result.actions.clear();
    result.diagnostics.push(RuleDiagnostic {
        level: DiagnosticLevel::Error,
        message: e.to_string(),
    });
}

fn check_condition(cond: &RuleCondition, ctx: &RuleContext) -> Result<Verdict, RuleEvaluationError> {
    let actual = match ctx.get(&cond.attribute) {
        None | Some(Value::Null) => return Ok(Verdict::Missing(cond.attribute.clone())),
        Some(v) => v,
    };
    let holds = match cond.operator {
        Operator::Equals => compare(&cond.attribute, actual, &cond.value)? == Ordering::Equal,
        Operator::NotEquals => compare(&cond.attribute, actual, &cond.value)? != Ordering::Equal,
        Operator::GreaterThan => compare(&cond.attribute, actual, &cond.value)? == Ordering::Greater,
        Operator::LessThan => compare(&cond.attribute, actual, &cond.value)? == Ordering::Less,
        Operator::Contains => contains(&cond.attribute, actual, &cond.value)?,
    };
    Ok(if holds { Verdict::Holds } else { Verdict::Fails })
}

/// Orders the context value against the operand after coercing it to the
/// operand's kind.
fn compare(attribute: &str, actual: &Value, expected: &ConditionValue) -> Result<Ordering, RuleEvaluationError> {
    let mismatch = || RuleEvaluationError::TypeMismatch {
        attribute: attribute.to_string(),
        expected: expected.kind(),
        found: describe(actual),
    };
    match expected {
        ConditionValue::Number(n) => {
            let a = as_number(actual).ok_or_else(mismatch)?;
            a.partial_cmp(n).ok_or_else(mismatch)
        }
        ConditionValue::Date(d) => as_date(actual).map(|a| a.cmp(d)).ok_or_else(mismatch),
        ConditionValue::Bool(b) => actual.as_bool().map(|a| a.cmp(b)).ok_or_else(mismatch),
        ConditionValue::String(s) => as_text(actual).map(|a| a.as_str().cmp(s.as_str())).ok_or_else(mismatch),
    }
}

/// Substring of a string attribute, or membership in a list attribute.
fn contains(attribute: &str, actual: &Value, expected: &ConditionValue) -> Result<bool, RuleEvaluationError> {
    match actual {
        Value::String(s) => Ok(s.contains(&operand_text(expected))),
        Value::Array(items) => Ok(items
            .iter()
            .any(|item| matches!(compare(attribute, item, expected), Ok(Ordering::Equal)))),
        other => Err(RuleEvaluationError::TypeMismatch {
            attribute: attribute.to_string(),
            expected: "string or list",
            found: describe(other),
        }),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_date(v: &Value) -> Option<NaiveDate> {
    v.as_str().and_then(parse_date)
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn operand_text(v: &ConditionValue) -> String {
    match v {
        ConditionValue::String(s) => s.clone(),
        ConditionValue::Number(n) => n.to_string(),
        ConditionValue::Bool(b) => b.to_string(),
        ConditionValue::Date(d) => d.to_string(),
    }
}

fn describe(v: &Value) -> String {
    let kind = match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    };
    format!("{kind} {v}")
}

/// Replaces `{attribute}` placeholders with context values. A brace pair
/// that does not close is kept as text.
fn interpolate(template: &str, ctx: &RuleContext) -> Result<String, RuleEvaluationError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let key = after[..end].trim();
        match ctx.get(key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(v) => out.push_str(&v.to_string()),
            None => {
                return Err(RuleEvaluationError::UnknownPlaceholder {
                    placeholder: key.to_string(),
                })
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
