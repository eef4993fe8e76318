use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use pve_core::{Entitlement, ProductConfiguration, RawRule, Severity, ValidationResult, ValidationStatus};
use pve_license::InMemoryEntitlements;
use pve_storage::{InMemoryStorage, Storage};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::EngineConfig;
use crate::engine::ValidationEngine;
use crate::repository::RuleRepository;
use crate::util::read_yaml;

#[derive(Debug, Deserialize)]
pub struct ScenarioExpected {
    pub scenario_id: String,
    pub status: ValidationStatus,
    #[serde(default)]
    pub issues: Vec<ExpectedIssue>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct ExpectedIssue {
    pub fingerprint: String,
    pub severity: Severity,
}

#[derive(Debug)]
pub struct ScenarioResult {
    pub result: ValidationResult,
    /// `(fingerprint, severity)` in result order.
    pub issues: Vec<(String, Severity)>,
}

pub fn load_expected(dir: &Path) -> Result<ScenarioExpected> {
    read_yaml(&dir.join("expected.yaml"))
}

/// Runs one fixture directory through an in-memory engine:
/// - `configuration.yaml`: the proposal under validation
/// - `rules.yaml`: raw rule definitions (optional)
/// - `entitlements.yaml`: entitlements held by the proposal (optional)
pub async fn simulate(dir: &Path) -> Result<ScenarioResult> {
    let config: ProductConfiguration = read_yaml(&dir.join("configuration.yaml"))?;
    let rules: Vec<RawRule> = read_optional_yaml(&dir.join("rules.yaml"))?;
    let entitlements: Vec<Entitlement> = read_optional_yaml(&dir.join("entitlements.yaml"))?;

    let storage = Arc::new(InMemoryStorage::new());
    for rule in &rules {
        storage.upsert_rule(rule)?;
    }
    let repository = Arc::new(RuleRepository::load(storage.clone())?);
    let engine = ValidationEngine::new(
        EngineConfig::default(),
        storage,
        repository,
        Arc::new(InMemoryEntitlements::shared(entitlements)),
    );

    let result = engine
        .validate_product_configuration(&config)
        .await
        .with_context(|| format!("validate scenario {}", dir.display()))?;
    let issues = result
        .issues
        .iter()
        .map(|i| (i.fingerprint.clone(), i.severity))
        .collect();
    Ok(ScenarioResult { result, issues })
}

fn read_optional_yaml<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    read_yaml(path)
}
