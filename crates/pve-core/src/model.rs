use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// String-backed enum: snake_case serde names plus `as_str`/`parse` for
/// storage columns and loosely typed rule definitions.
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s.trim() {
                    $($s => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(RuleType {
    Compatibility => "compatibility",
    License => "license",
    Configuration => "configuration",
    Compliance => "compliance",
    Custom => "custom",
});

str_enum!(Operator {
    Equals => "equals",
    NotEquals => "not_equals",
    Contains => "contains",
    GreaterThan => "greater_than",
    LessThan => "less_than",
});

str_enum!(IssueStatus {
    Open => "open",
    Resolved => "resolved",
    Ignored => "ignored",
    FalsePositive => "false_positive",
});

str_enum!(ResolutionMethod {
    Auto => "auto",
    Manual => "manual",
    Suggestion => "suggestion",
});

str_enum!(RelationshipType {
    Requires => "requires",
    Recommends => "recommends",
    Incompatible => "incompatible",
    Alternative => "alternative",
    Optional => "optional",
});

str_enum!(CompatibilityStatus {
    Compatible => "compatible",
    Incompatible => "incompatible",
    Conditional => "conditional",
});

str_enum!(ValidationStatus {
    Valid => "valid",
    Warning => "warning",
    Invalid => "invalid",
});

str_enum!(RunState {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

str_enum!(
    /// Which check produced an issue.
    IssueOrigin {
        Rule => "rule",
        Compatibility => "compatibility",
        CircularDependency => "circular_dependency",
        License => "license",
    }
);

str_enum!(LicenseConflictKind {
    Missing => "missing",
    Expired => "expired",
    Unknown => "unknown",
});

/// Ordered from least to most severe.
///
/// Rules only declare `critical | high | medium | low`; the remaining levels
/// are produced by the built-in checks (`error` for unsatisfiable graphs,
/// `warning` for flags) and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Warning,
    Medium,
    High,
    Error,
    Critical,
}

impl Severity {
    pub const RULE_LEVELS: &'static [Severity] =
        &[Severity::Critical, Severity::High, Severity::Medium, Severity::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Warning => "warning",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "info" => Some(Severity::Info),
            "low" => Some(Severity::Low),
            "warning" => Some(Severity::Warning),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Severities that make a configuration `invalid`.
    pub fn blocks(&self) -> bool {
        matches!(self, Severity::Critical | Severity::Error)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IssueStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IssueStatus::Open)
    }
}

impl RunState {
    pub fn can_transition_to(&self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Pending, RunState::InProgress)
                | (RunState::InProgress, RunState::Completed)
                | (RunState::InProgress, RunState::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    pub fn transition(self, next: RunState) -> Result<RunState, RunStateError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(RunStateError { from: self, to: next })
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal run transition {from} -> {to}")]
pub struct RunStateError {
    pub from: RunState,
    pub to: RunState,
}
