//! JSON file configuration provider.
//!
//! Sections nest, so `{"schedule": {"interval_secs": 600}}` answers the key
//! `schedule.interval_secs`. Scalars come back as their JSON text, strings
//! unquoted.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::provider::ConfigProvider;
use super::{ConfigError, ConfigResult};

pub struct FileConfigProvider {
    path: PathBuf,
    data: RwLock<Option<Map<String, Value>>>,
    auto_reload: bool,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: RwLock::new(None),
            auto_reload: false,
        }
    }

    /// Re-read the file on every access.
    pub fn auto_reload(path: impl Into<PathBuf>) -> Self {
        Self {
            auto_reload: true,
            ..Self::new(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty configuration.
    async fn load(&self) -> ConfigResult<Map<String, Value>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => match serde_json::from_str(&content)? {
                Value::Object(map) => Ok(map),
                _ => Err(ConfigError::InvalidValue {
                    key: self.path.display().to_string(),
                    message: "top level must be a JSON object".into(),
                }),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_loaded(&self) -> ConfigResult<()> {
        let mut data = self.data.write().await;
        if data.is_none() || self.auto_reload {
            *data = Some(self.load().await?);
        }
        Ok(())
    }

    async fn save(&self, data: &Map<String, Value>) -> ConfigResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(data)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    pub async fn reload(&self) -> ConfigResult<()> {
        let fresh = self.load().await?;
        *self.data.write().await = Some(fresh);
        Ok(())
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let first = map.get(parts.next()?)?;
    parts.try_fold(first, |value, part| value.get(part))
}

fn insert_path(map: &mut Map<String, Value>, key: &str, value: Value) {
    match key.split_once('.') {
        None => {
            map.insert(key.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                insert_path(child, rest, value);
            }
        }
    }
}

fn remove_path(map: &mut Map<String, Value>, key: &str) -> bool {
    match key.split_once('.') {
        None => map.remove(key).is_some(),
        Some((head, rest)) => match map.get_mut(head) {
            Some(Value::Object(child)) => remove_path(child, rest),
            _ => false,
        },
    }
}

/// Dotted paths of every leaf under `map`.
fn leaf_keys(map: &Map<String, Value>, base: &str, out: &mut Vec<String>) {
    for (name, value) in map {
        let key = if base.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", base, name)
        };
        match value {
            Value::Object(child) => leaf_keys(child, &key, out),
            _ => out.push(key),
        }
    }
}

#[async_trait::async_trait]
impl ConfigProvider for FileConfigProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        self.ensure_loaded().await?;
        let data = self.data.read().await;
        Ok(data
            .as_ref()
            .and_then(|map| lookup(map, key))
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }))
    }

    async fn set_raw(&self, key: &str, value: &str) -> ConfigResult<()> {
        self.ensure_loaded().await?;
        let mut data = self.data.write().await;
        let map = data.get_or_insert_with(Map::new);

        let value =
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        insert_path(map, key, value);
        self.save(map).await
    }

    async fn delete(&self, key: &str) -> ConfigResult<bool> {
        self.ensure_loaded().await?;
        let mut data = self.data.write().await;
        let Some(map) = data.as_mut() else {
            return Ok(false);
        };
        let existed = remove_path(map, key);
        if existed {
            self.save(map).await?;
        }
        Ok(existed)
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        self.ensure_loaded().await?;
        let data = self.data.read().await;
        let mut keys = Vec::new();
        if let Some(map) = data.as_ref() {
            leaf_keys(map, "", &mut keys);
        }
        keys.retain(|k| k.starts_with(prefix));
        Ok(keys)
    }
}

impl std::fmt::Debug for FileConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileConfigProvider")
            .field("path", &self.path)
            .field("auto_reload", &self.auto_reload)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_nested_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("su-reconcile.json");
        let config = serde_json::json!({
            "schedule": { "interval_secs": 600, "lock_policy": "skip" },
            "reconcile": { "reserved_accounts": ["root", "admin"] },
            "logging": { "json": true }
        });
        tokio::fs::write(&path, config.to_string()).await.unwrap();

        let provider = FileConfigProvider::new(&path);
        assert_eq!(
            provider.get_raw("schedule.interval_secs").await.unwrap(),
            Some("600".to_string())
        );
        assert_eq!(
            provider.get_raw("schedule.lock_policy").await.unwrap(),
            Some("skip".to_string())
        );
        assert_eq!(
            provider.get_raw("reconcile.reserved_accounts").await.unwrap(),
            Some(r#"["root","admin"]"#.to_string())
        );
        assert_eq!(provider.get_raw("schedule.missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let provider = FileConfigProvider::new(dir.path().join("absent.json"));
        assert_eq!(provider.get_raw("ledger.kind").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_non_object_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("list.json");
        tokio::fs::write(&path, "[1, 2]").await.unwrap();

        let provider = FileConfigProvider::new(&path);
        assert!(matches!(
            provider.get_raw("a").await,
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_nested_write_and_delete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let provider = FileConfigProvider::new(&path);

        provider.set_raw("ledger.kind", "postgres").await.unwrap();
        provider.set_raw("schedule.max_concurrency", "4").await.unwrap();
        assert!(path.exists());

        let reread = FileConfigProvider::new(&path);
        assert_eq!(
            reread.get_raw("schedule.max_concurrency").await.unwrap(),
            Some("4".to_string())
        );

        let mut keys = reread.list_keys("").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ledger.kind", "schedule.max_concurrency"]);

        assert!(reread.delete("ledger.kind").await.unwrap());
        assert!(!reread.delete("ledger.kind").await.unwrap());
        assert_eq!(reread.get_raw("ledger.kind").await.unwrap(), None);
    }
}
