use anyhow::{Context, Result};
use pve_compat::CompatibilityOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub compatibility: CompatibilityOptions,
    #[serde(default)]
    pub license: LicenseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub issues: IssueConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Soft budget for one validation run.
    pub budget_ms: u64,
    /// Extra time the outer join waits for a checker after the budget.
    pub grace_ms: u64,
    /// Rule chunks evaluated in parallel.
    pub rule_workers: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            budget_ms: 2_000,
            grace_ms: 250,
            rule_workers: 4,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LicenseConfig {
    pub lookup_timeout_ms: u64,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self { lookup_timeout_ms: 500 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Relative paths resolve against the project root; `~` is expanded.
    pub db_path: String,
    pub write_timeout_ms: u64,
    /// Total attempts for a failed audit write, including the first.
    pub max_write_attempts: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: ".pve/pve.db".to_string(),
            write_timeout_ms: 1_000,
            max_write_attempts: 4,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IssueConfig {
    /// Re-detections update the open issue with the same fingerprint instead
    /// of creating another one.
    pub dedup_open: bool,
}

impl Default for IssueConfig {
    fn default() -> Self {
        Self { dedup_open: true }
    }
}

impl EngineConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: EngineConfig = toml::from_str(&s).with_context(|| "parse pve.toml")?;
        Ok(cfg)
    }

    /// `load_from` when the file exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn config_path(project_root: &Path) -> PathBuf {
        project_root.join(".pve").join("pve.toml")
    }

    pub fn db_path(&self, project_root: &Path) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(&self.storage.db_path).to_string());
        if expanded.is_absolute() {
            expanded
        } else {
            project_root.join(expanded)
        }
    }

    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.run.budget_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.run.grace_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.license.lookup_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.write_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = EngineConfig::config_path(dir.path());
        let mut cfg = EngineConfig::default();
        cfg.run.rule_workers = 8;
        cfg.compatibility.include_recommends_in_cycles = true;
        cfg.save_to(&path).unwrap();
        assert_eq!(EngineConfig::load_from(&path).unwrap(), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: EngineConfig = toml::from_str("[run]\nbudget_ms = 500\n").unwrap();
        assert_eq!(cfg.run.budget_ms, 500);
        assert_eq!(cfg.run.rule_workers, 4);
        assert!(cfg.issues.dedup_open);
        assert_eq!(cfg.license.lookup_timeout_ms, 500);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempdir().unwrap();
        let cfg = EngineConfig::load_or_default(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn db_path_resolves_against_root() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.db_path(Path::new("/srv/app")), PathBuf::from("/srv/app/.pve/pve.db"));
        let mut abs = EngineConfig::default();
        abs.storage.db_path = "/var/lib/pve.db".into();
        assert_eq!(abs.db_path(Path::new("/srv/app")), PathBuf::from("/var/lib/pve.db"));
    }
}
