use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use pve_core::{Entitlement, ProductConfiguration, RawRule, RuleSnapshot};
use pve_license::EntitlementLookup;
use pve_storage::Storage;
use pve_storage_sqlite::SqliteStorage;
use tracing::info;

use crate::doctor::{doctor, DoctorReport};
use crate::util::read_yaml;
use crate::{EngineConfig, RuleRepository, ValidationEngine};

/// A project directory opened for validation: config from `.pve/pve.toml`,
/// the sqlite store and an engine wired to both.
pub struct Runner {
    pub root: PathBuf,
    pub cfg: EngineConfig,
    pub storage: Arc<SqliteStorage>,
    pub engine: ValidationEngine,
}

impl Runner {
    pub fn open(root: PathBuf, entitlements: Arc<dyn EntitlementLookup>) -> Result<Self> {
        let cfg_path = EngineConfig::config_path(&root);
        let cfg = if cfg_path.exists() {
            EngineConfig::load_from(&cfg_path)?
        } else {
            let cfg = EngineConfig::default();
            cfg.save_to(&cfg_path)?;
            cfg
        };

        let storage = Arc::new(SqliteStorage::open(&cfg.db_path(&root))?);
        let repository = Arc::new(RuleRepository::load(storage.clone())?);
        let engine = ValidationEngine::new(cfg.clone(), storage.clone(), repository, entitlements);
        Ok(Self {
            root,
            cfg,
            storage,
            engine,
        })
    }

    pub fn init_repo(root: &Path) -> Result<()> {
        let cfg_path = EngineConfig::config_path(root);
        let cfg = if cfg_path.exists() {
            EngineConfig::load_from(&cfg_path)?
        } else {
            let cfg = EngineConfig::default();
            cfg.save_to(&cfg_path)?;
            cfg
        };
        // create db
        let _ = SqliteStorage::open(&cfg.db_path(root))?;
        Ok(())
    }

    pub fn doctor(&self) -> Result<DoctorReport> {
        doctor(&self.cfg, self.storage.as_ref())
    }

    /// Upserts every definition in a YAML list, then refreshes the rule
    /// snapshot. Malformed definitions are stored but stay out of the
    /// snapshot.
    pub fn import_rules(&self, path: &Path) -> Result<Arc<RuleSnapshot>> {
        let raws: Vec<RawRule> = read_yaml(path)?;
        for raw in &raws {
            self.storage
                .upsert_rule(raw)
                .with_context(|| format!("store rule {}", raw.id))?;
        }
        info!(path = %path.display(), rules = raws.len(), "rules imported");
        self.engine.repository().refresh()
    }

    pub fn import_configuration(&self, path: &Path) -> Result<ProductConfiguration> {
        let config: ProductConfiguration = read_yaml(path)?;
        self.storage.save_configuration(&config)?;
        info!(proposal_id = %config.proposal_id, products = config.products.len(), "configuration imported");
        Ok(config)
    }
}

pub fn load_configuration_file(path: &Path) -> Result<ProductConfiguration> {
    read_yaml(path)
}

pub fn load_entitlements_file(path: &Path) -> Result<Vec<Entitlement>> {
    read_yaml(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pve_license::InMemoryEntitlements;

    #[test]
    fn init_then_open_creates_config_and_db() {
        let dir = tempfile::tempdir().unwrap();
        Runner::init_repo(dir.path()).unwrap();
        assert!(EngineConfig::config_path(dir.path()).exists());
        assert!(dir.path().join(".pve").join("pve.db").exists());

        let runner = Runner::open(dir.path().to_path_buf(), Arc::new(InMemoryEntitlements::new())).unwrap();
        assert_eq!(runner.engine.repository().snapshot().len(), 0);
    }

    #[test]
    fn import_rules_refreshes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.yaml");
        std::fs::write(
            &rules,
            r#"
- id: big-order
  name: Big order
  category: pricing
  rule_type: configuration
  severity: low
  conditions:
    - { attribute: product_count, operator: greater_than, value: 10 }
  actions:
    - { type: suggest_fix, suggestion: "split the order" }
- id: broken
  name: Broken
  rule_type: configuration
  severity: apocalyptic
  actions:
    - { type: suggest_fix, suggestion: "never" }
"#,
        )
        .unwrap();

        let runner = Runner::open(dir.path().to_path_buf(), Arc::new(InMemoryEntitlements::new())).unwrap();
        let snap = runner.import_rules(&rules).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.rejected, 1);
        assert_eq!(runner.storage.load_rules().unwrap().len(), 2);
    }
}
