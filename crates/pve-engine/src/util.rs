use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use serde::de::DeserializeOwned;

/// Runs a synchronous storage call on the blocking pool, bounded by `timeout`.
pub async fn blocking<T, F>(timeout: Duration, what: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, handle).await {
        Ok(joined) => joined.with_context(|| format!("{what}: task panicked"))?,
        Err(_) => Err(anyhow!("{what}: timed out after {}ms", timeout.as_millis())),
    }
}

/// Reads and parses one YAML file, naming the path in either failure.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_yaml::from_str(&s).with_context(|| format!("parse {}", path.display()))
}

/// Calendar date used for entitlement expiry.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocking_returns_value_and_errors() {
        let v = blocking(Duration::from_secs(1), "add", || Ok(1 + 1)).await.unwrap();
        assert_eq!(v, 2);
        let e = blocking::<(), _>(Duration::from_secs(1), "fail", || Err(anyhow!("boom")))
            .await
            .unwrap_err();
        assert!(e.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn blocking_times_out() {
        let e = blocking(Duration::from_millis(10), "slow", || {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(e.to_string().contains("timed out"));
    }

    #[test]
    fn read_yaml_names_the_file_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("ids.yaml");
        std::fs::write(&good, "- a\n- b\n").unwrap();
        let ids: Vec<String> = read_yaml(&good).unwrap();
        assert_eq!(ids, vec!["a", "b"]);

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "[unclosed").unwrap();
        let e = read_yaml::<Vec<String>>(&bad).unwrap_err();
        assert!(e.to_string().contains("bad.yaml"));
        assert!(read_yaml::<Vec<String>>(&dir.path().join("missing.yaml")).is_err());
    }
}
