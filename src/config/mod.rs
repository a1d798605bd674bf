//! Pluggable configuration providers and the typed service [`Settings`].
//!
//! ```rust,no_run
//! use hpc_allocations::config::{ConfigBuilder, Settings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let providers = ConfigBuilder::new()
//!     .env()
//!     .file("/etc/su-reconcile.json")
//!     .build();
//! let settings = Settings::load(&providers).await?;
//! settings.validate()?;
//! # Ok(())
//! # }
//! ```

pub mod composite;
pub mod env;
pub mod file;
pub mod memory;
pub mod provider;
pub mod settings;

pub use composite::CompositeConfigProvider;
pub use env::{ENV_PREFIX, EnvConfigProvider};
pub use file::FileConfigProvider;
pub use memory::MemoryConfigProvider;
pub use provider::{ConfigProvider, ConfigProviderExt};
pub use settings::{
    LedgerKind, LedgerSettings, LoggingSettings, ReconcileSettings, ScheduleSettings, Settings,
    SourceKind, SourceSettings,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Environment error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("Provider error: {message}")]
    Provider { message: String },

    /// Every problem `Settings::validate` found.
    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Stacks providers; the first one added has the highest priority.
#[derive(Default)]
pub struct ConfigBuilder {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment variables under [`ENV_PREFIX`].
    pub fn env(self) -> Self {
        self.provider(Box::new(EnvConfigProvider::default()))
    }

    pub fn env_with_prefix(self, prefix: &str) -> Self {
        self.provider(Box::new(EnvConfigProvider::prefixed(prefix)))
    }

    pub fn file(self, path: impl AsRef<std::path::Path>) -> Self {
        self.provider(Box::new(FileConfigProvider::new(path.as_ref())))
    }

    pub fn memory(self, provider: MemoryConfigProvider) -> Self {
        self.provider(Box::new(provider))
    }

    pub fn provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn build(self) -> CompositeConfigProvider {
        self.providers
            .into_iter()
            .fold(CompositeConfigProvider::new(), |composite, provider| {
                composite.provider(provider)
            })
    }
}
