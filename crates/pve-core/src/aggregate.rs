use std::collections::BTreeMap;

use crate::{IssueId, IssueOrigin, IssueStatus, ValidationIssue, ValidationStatus};

/// Pure merge helpers used by the orchestrator once every checker has
/// reported:
/// - overall status from unresolved issue severities
/// - stable issue ordering (check, then rule id, then detection order)
/// - audit performance score
pub fn overall_status(issues: &[ValidationIssue]) -> ValidationStatus {
    let open = issues.iter().filter(|i| i.status == IssueStatus::Open);
    let mut status = ValidationStatus::Valid;
    for issue in open {
        if issue.severity.blocks() {
            return ValidationStatus::Invalid;
        }
        status = ValidationStatus::Warning;
    }
    status
}

fn origin_rank(origin: IssueOrigin) -> u8 {
    match origin {
        IssueOrigin::Rule => 0,
        IssueOrigin::Compatibility => 1,
        IssueOrigin::CircularDependency => 2,
        IssueOrigin::License => 3,
    }
}

/// Stable: issues with equal keys keep their detection order.
pub fn sort_issues(issues: &mut [ValidationIssue]) {
    issues.sort_by(|a, b| {
        origin_rank(a.origin)
            .cmp(&origin_rank(b.origin))
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });
}

/// 100 for an instant run, falling linearly to 0 at the run budget, minus 5
/// per blocking issue. Clamped to [0, 100].
pub fn performance_score(elapsed_ms: u64, budget_ms: u64, blocking_issues: usize) -> f64 {
    let budget = budget_ms.max(1) as f64;
    let time_score = 100.0 * (1.0 - (elapsed_ms as f64 / budget));
    let penalty = 5.0 * blocking_issues as f64;
    (time_score - penalty).clamp(0.0, 100.0)
}

/// Groups issue ids under the key returned by `key_of`, preserving order.
pub fn group_issues<F>(issues: &[ValidationIssue], key_of: F) -> BTreeMap<String, Vec<IssueId>>
where
    F: Fn(&ValidationIssue) -> String,
{
    let mut out: BTreeMap<String, Vec<IssueId>> = BTreeMap::new();
    for issue in issues {
        out.entry(key_of(issue)).or_default().push(issue.id.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RuleId, Severity};

    fn issue(origin: IssueOrigin, rule: Option<&str>, severity: Severity) -> ValidationIssue {
        let mut i = ValidationIssue::open("p-1", origin, "fp", severity, "m", 0);
        i.rule_id = rule.map(RuleId::from_str);
        i
    }

    #[test]
    fn no_issues_is_valid() {
        assert_eq!(overall_status(&[]), ValidationStatus::Valid);
    }

    #[test]
    fn blocking_severity_is_invalid() {
        let issues = vec![
            issue(IssueOrigin::Rule, Some("r"), Severity::Low),
            issue(IssueOrigin::License, None, Severity::Critical),
        ];
        assert_eq!(overall_status(&issues), ValidationStatus::Invalid);
    }

    #[test]
    fn non_blocking_severities_are_warning() {
        let issues = vec![
            issue(IssueOrigin::Rule, Some("r"), Severity::Warning),
            issue(IssueOrigin::License, None, Severity::High),
        ];
        assert_eq!(overall_status(&issues), ValidationStatus::Warning);
    }

    #[test]
    fn resolved_issues_do_not_count() {
        let mut i = issue(IssueOrigin::Rule, Some("r"), Severity::Critical);
        i.status = IssueStatus::Resolved;
        assert_eq!(overall_status(&[i]), ValidationStatus::Valid);
    }

    #[test]
    fn sort_is_by_origin_then_rule_and_stable() {
        let mut a = issue(IssueOrigin::License, None, Severity::Critical);
        a.message = "license".into();
        let mut b = issue(IssueOrigin::Rule, Some("b"), Severity::Low);
        b.message = "b-first".into();
        let mut c = issue(IssueOrigin::Rule, Some("a"), Severity::Low);
        c.message = "a".into();
        let mut d = issue(IssueOrigin::Rule, Some("b"), Severity::Low);
        d.message = "b-second".into();
        let mut v = vec![a, b, c, d];
        sort_issues(&mut v);
        let msgs: Vec<_> = v.iter().map(|i| i.message.as_str()).collect();
        assert_eq!(msgs, vec!["a", "b-first", "b-second", "license"]);
    }

    #[test]
    fn performance_score_is_clamped() {
        assert_eq!(performance_score(0, 2_000, 0), 100.0);
        assert_eq!(performance_score(1_000, 2_000, 0), 50.0);
        assert_eq!(performance_score(1_000, 2_000, 2), 40.0);
        assert_eq!(performance_score(5_000, 2_000, 0), 0.0);
    }
}
