//! Layered configuration: the first provider holding a key wins, so the
//! usual stack is command-line overrides, then environment, then file.

use super::ConfigResult;
use super::provider::ConfigProvider;

/// Composite configuration provider that chains multiple providers
pub struct CompositeConfigProvider {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl CompositeConfigProvider {
    /// Create a new empty composite provider
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Add a provider (first added = highest priority)
    pub fn add_provider(&mut self, provider: Box<dyn ConfigProvider>) {
        self.providers.push(provider);
    }

    /// Add a provider and return self (for chaining)
    pub fn provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Get the number of providers
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Get provider names
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}

impl Default for CompositeConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for CompositeConfigProvider {
    fn name(&self) -> &str {
        "composite"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        // Try each provider in order (first match wins)
        for provider in &self.providers {
            if let Some(value) = provider.get_raw(key).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    async fn set_raw(&self, key: &str, value: &str) -> ConfigResult<()> {
        // Set in the first provider (highest priority)
        if let Some(provider) = self.providers.first() {
            provider.set_raw(key, value).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> ConfigResult<bool> {
        // Delete from all providers that have the key
        let mut deleted = false;
        for provider in &self.providers {
            if provider.delete(key).await? {
                deleted = true;
            }
        }
        Ok(deleted)
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let mut all_keys = std::collections::BTreeSet::new();
        for provider in &self.providers {
            all_keys.extend(provider.list_keys(prefix).await?);
        }
        Ok(all_keys.into_iter().collect())
    }
}

impl std::fmt::Debug for CompositeConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeConfigProvider")
            .field("provider_count", &self.providers.len())
            .field("provider_names", &self.provider_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::memory::MemoryConfigProvider;

    fn layered() -> CompositeConfigProvider {
        let flags = MemoryConfigProvider::named("flags").value("reconcile.dry_run", "true");
        let file = MemoryConfigProvider::named("file")
            .value("reconcile.dry_run", "false")
            .value("schedule.interval_secs", "600");

        CompositeConfigProvider::new()
            .provider(Box::new(flags))
            .provider(Box::new(file))
    }

    #[tokio::test]
    async fn test_first_provider_wins() {
        let composite = layered();
        assert_eq!(
            composite.get_raw("reconcile.dry_run").await.unwrap(),
            Some("true".to_string())
        );
        assert_eq!(
            composite.get_raw("schedule.interval_secs").await.unwrap(),
            Some("600".to_string())
        );
        assert_eq!(composite.get_raw("ledger.url").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_keys_is_deduplicated() {
        let keys = layered().list_keys("").await.unwrap();
        assert_eq!(keys, vec!["reconcile.dry_run", "schedule.interval_secs"]);
    }

    #[tokio::test]
    async fn test_set_goes_to_first_provider() {
        let composite = layered();
        composite.set_raw("ledger.kind", "postgres").await.unwrap();
        assert_eq!(
            composite.get_raw("ledger.kind").await.unwrap(),
            Some("postgres".to_string())
        );
    }

    #[tokio::test]
    async fn test_delete_removes_every_layer() {
        let composite = layered();
        assert!(composite.delete("reconcile.dry_run").await.unwrap());
        assert_eq!(composite.get_raw("reconcile.dry_run").await.unwrap(), None);
    }

    #[test]
    fn test_provider_names() {
        assert_eq!(layered().provider_names(), vec!["flags", "file"]);
        assert_eq!(layered().provider_count(), 2);
    }
}
