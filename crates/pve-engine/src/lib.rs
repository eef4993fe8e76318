pub mod analytics;
pub mod config;
pub mod doctor;
pub mod engine;
pub mod issues;
pub mod repository;
pub mod runner;
pub mod scenario;
pub mod util;

pub use analytics::*;
pub use config::*;
pub use doctor::*;
pub use engine::*;
pub use issues::*;
pub use repository::*;
pub use runner::*;
pub use util::*;

#[cfg(test)]
mod scenario_tests {
    use super::scenario::*;
    use pve_core::{Severity, ValidationStatus};
    use std::path::{Path, PathBuf};

    fn dir(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/scenarios").join(name)
    }

    async fn check(name: &str) -> ScenarioResult {
        let p = dir(name);
        let exp = load_expected(&p).unwrap();
        let res = simulate(&p).await.unwrap();
        assert_eq!(res.result.status, exp.status, "{}", exp.scenario_id);
        let want: Vec<(String, Severity)> = exp.issues.iter().map(|i| (i.fingerprint.clone(), i.severity)).collect();
        assert_eq!(res.issues, want, "{}", exp.scenario_id);
        assert!(!res.result.incomplete);
        res
    }

    #[tokio::test]
    async fn scenario_a_mutual_requires_is_one_cycle() {
        let res = check("SC-A-mutual-requires").await;
        let compat = res.result.compatibility.unwrap();
        assert_eq!(compat.compatibility.circular_dependencies.len(), 1);
        let path: Vec<&str> = compat.compatibility.circular_dependencies[0]
            .path
            .iter()
            .map(|p| p.as_str())
            .collect();
        assert_eq!(path, vec!["X", "Y", "X"]);
    }

    #[tokio::test]
    async fn scenario_b_incompatible_pair() {
        let res = check("SC-B-incompatible-pair").await;
        let compat = res.result.compatibility.unwrap();
        let pair = compat.compatibility.pair(&"A".into(), &"B".into()).unwrap();
        assert_eq!(pair.status, pve_core::CompatibilityStatus::Incompatible);
    }

    #[tokio::test]
    async fn scenario_c_high_value_flag() {
        let res = check("SC-C-high-value-flag").await;
        let issue = &res.result.issues[0];
        assert_eq!(issue.rule_id.as_ref().map(|r| r.as_str()), Some("high-value"));
        assert_eq!(issue.message, "proposal total 15000 exceeds 10000");
        assert_eq!(res.result.rules_executed.len(), 2);
        assert_eq!(res.result.user_story_mappings["pricing"], vec![issue.id.clone()]);
    }

    #[tokio::test]
    async fn scenario_d_empty_configuration_is_valid() {
        let res = check("SC-D-empty-configuration").await;
        assert_eq!(res.result.status, ValidationStatus::Valid);
        assert!(res.result.issues.is_empty());
        assert!(res.result.execution_time_ms < 100);
    }

    #[tokio::test]
    async fn scenario_e_missing_license_is_critical() {
        let res = check("SC-E-missing-license").await;
        let compat = res.result.compatibility.unwrap();
        assert_eq!(compat.compatibility.license_conflicts.len(), 1);
        assert_eq!(compat.compatibility.license_conflicts[0].product_id.as_str(), "vault");
    }
}
