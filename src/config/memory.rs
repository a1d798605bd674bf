//! In-memory configuration provider, for tests and code-defined overrides
//! such as command-line flags.

use std::collections::HashMap;

use tokio::sync::RwLock;

use super::ConfigResult;
use super::provider::ConfigProvider;

#[derive(Debug)]
pub struct MemoryConfigProvider {
    data: RwLock<HashMap<String, String>>,
    name: String,
}

impl Default for MemoryConfigProvider {
    fn default() -> Self {
        Self::named("memory")
    }
}

impl MemoryConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            name: name.into(),
        }
    }

    pub fn from_data(data: HashMap<String, String>) -> Self {
        Self {
            data: RwLock::new(data),
            ..Self::default()
        }
    }

    /// Builder-style insert.
    pub fn value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.get_mut().insert(key.into(), value.into());
        self
    }

    pub async fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.data.write().await.insert(key.into(), value.into());
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for MemoryConfigProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: &str) -> ConfigResult<()> {
        self.insert(key, value).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> ConfigResult<bool> {
        Ok(self.data.write().await.remove(key).is_some())
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let data = self.data.read().await;
        Ok(data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigProviderExt;

    #[tokio::test]
    async fn test_builder_values() {
        let provider = MemoryConfigProvider::new()
            .value("reconcile.dry_run", "true")
            .value("schedule.max_concurrency", "2");

        assert_eq!(provider.len().await, 2);
        let dry_run: Option<bool> = provider.get_parsed("reconcile.dry_run").await.unwrap();
        assert_eq!(dry_run, Some(true));
        assert_eq!(provider.get_raw("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let provider = MemoryConfigProvider::new();
        provider.set_raw("source.kind", "memory").await.unwrap();
        provider.set_raw("source.sshare", "/opt/slurm/bin/sshare").await.unwrap();
        provider.set_raw("ledger.kind", "memory").await.unwrap();

        let mut keys = provider.list_keys("source.").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["source.kind", "source.sshare"]);

        assert!(provider.delete("ledger.kind").await.unwrap());
        assert!(!provider.delete("ledger.kind").await.unwrap());
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let provider = MemoryConfigProvider::new();
        ConfigProviderExt::set(&provider, "reconcile.reserved_accounts", &vec!["root", "admin"])
            .await
            .unwrap();

        let reserved: Option<Vec<String>> =
            ConfigProviderExt::get(&provider, "reconcile.reserved_accounts")
                .await
                .unwrap();
        assert_eq!(reserved, Some(vec!["root".to_string(), "admin".to_string()]));
    }

    #[tokio::test]
    async fn test_unparsable_value() {
        let provider = MemoryConfigProvider::new().value("schedule.interval_secs", "hourly");
        let parsed = provider.get_parsed::<u64>("schedule.interval_secs").await;
        assert!(parsed.is_err());
    }
}
