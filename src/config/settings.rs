//! Typed service settings.
//!
//! Every key has a default, so an empty provider yields a working
//! configuration that reconciles against Slurm with an in-memory ledger.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::provider::{ConfigProvider, ConfigProviderExt};
use super::{ConfigError, ConfigResult, ValidationErrors};
use crate::reconcile::ReconcileOptions;
use crate::resilience::{CircuitConfig, ExponentialBackoff, ResilienceConfig};
use crate::scheduler::{LockPolicy, SchedulerConfig};
use crate::source::SlurmConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Slurm,
    Memory,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slurm" => Ok(Self::Slurm),
            "memory" => Ok(Self::Memory),
            other => Err(format!("expected 'slurm' or 'memory', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    #[default]
    Memory,
    Postgres,
}

impl FromStr for LedgerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!("expected 'memory' or 'postgres', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSettings {
    pub interval: Duration,
    pub max_concurrency: usize,
    pub unit_timeout: Duration,
    pub lock_policy: LockPolicy,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        let config = SchedulerConfig::default();
        Self {
            interval: config.interval,
            max_concurrency: config.max_concurrency,
            unit_timeout: config.unit_timeout,
            lock_policy: config.lock_policy,
        }
    }
}

impl ScheduleSettings {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.interval,
            max_concurrency: self.max_concurrency,
            unit_timeout: self.unit_timeout,
            lock_policy: self.lock_policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub kind: SourceKind,
    pub sacctmgr: String,
    pub sshare: String,
    pub command_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Zero disables the breaker.
    pub circuit_failure_threshold: u32,
    pub circuit_recovery: Duration,
    /// Accounts seeding the in-memory source.
    pub fixture: Option<PathBuf>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            kind: SourceKind::Slurm,
            sacctmgr: "sacctmgr".into(),
            sshare: "sshare".into(),
            command_timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(5000),
            circuit_failure_threshold: 5,
            circuit_recovery: Duration::from_secs(60),
            fixture: None,
        }
    }
}

impl SourceSettings {
    pub fn slurm_config(&self) -> SlurmConfig {
        SlurmConfig {
            sacctmgr: self.sacctmgr.clone(),
            sshare: self.sshare.clone(),
            command_timeout: self.command_timeout,
        }
    }

    pub fn resilience_config(&self) -> ResilienceConfig {
        let circuit = (self.circuit_failure_threshold > 0).then(|| CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout: self.circuit_recovery,
            ..Default::default()
        });
        ResilienceConfig::default()
            .with_timeout(self.command_timeout)
            .with_retries(
                self.max_retries,
                ExponentialBackoff::new(self.initial_backoff, self.max_backoff),
            )
            .with_circuit(circuit)
    }
}

#[derive(Debug, Default)]
pub struct LedgerSettings {
    pub kind: LedgerKind,
    pub url: Option<SecretString>,
    pub fixture: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub reserved_accounts: BTreeSet<String>,
    pub dry_run: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        let options = ReconcileOptions::default();
        Self {
            reserved_accounts: options.reserved_accounts,
            dry_run: options.dry_run,
        }
    }
}

impl ReconcileSettings {
    pub fn options(&self) -> ReconcileOptions {
        ReconcileOptions {
            reserved_accounts: self.reserved_accounts.clone(),
            dry_run: self.dry_run,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            json: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Settings {
    pub schedule: ScheduleSettings,
    pub source: SourceSettings,
    pub ledger: LedgerSettings,
    pub reconcile: ReconcileSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Read every known key from `provider`, keeping defaults for absent ones.
    pub async fn load(provider: &dyn ConfigProvider) -> ConfigResult<Self> {
        let mut settings = Self::default();

        let schedule = &mut settings.schedule;
        if let Some(secs) = provider.get_parsed("schedule.interval_secs").await? {
            schedule.interval = Duration::from_secs(secs);
        }
        if let Some(n) = provider.get_parsed("schedule.max_concurrency").await? {
            schedule.max_concurrency = n;
        }
        if let Some(secs) = provider.get_parsed("schedule.unit_timeout_secs").await? {
            schedule.unit_timeout = Duration::from_secs(secs);
        }
        if let Some(policy) = provider.get_parsed("schedule.lock_policy").await? {
            schedule.lock_policy = policy;
        }

        let source = &mut settings.source;
        if let Some(kind) = provider.get_parsed("source.kind").await? {
            source.kind = kind;
        }
        if let Some(path) = provider.get_raw("source.sacctmgr").await? {
            source.sacctmgr = path;
        }
        if let Some(path) = provider.get_raw("source.sshare").await? {
            source.sshare = path;
        }
        if let Some(secs) = provider.get_parsed("source.command_timeout_secs").await? {
            source.command_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = provider.get_parsed("source.max_retries").await? {
            source.max_retries = n;
        }
        if let Some(ms) = provider.get_parsed("source.initial_backoff_ms").await? {
            source.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = provider.get_parsed("source.max_backoff_ms").await? {
            source.max_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = provider.get_parsed("source.circuit_failure_threshold").await? {
            source.circuit_failure_threshold = n;
        }
        if let Some(secs) = provider.get_parsed("source.circuit_recovery_secs").await? {
            source.circuit_recovery = Duration::from_secs(secs);
        }
        source.fixture = provider.get_raw("source.fixture").await?.map(PathBuf::from);

        let ledger = &mut settings.ledger;
        if let Some(kind) = provider.get_parsed("ledger.kind").await? {
            ledger.kind = kind;
        }
        ledger.url = provider
            .get_raw("ledger.url")
            .await?
            .filter(|url| !url.trim().is_empty())
            .map(SecretString::from);
        ledger.fixture = provider.get_raw("ledger.fixture").await?.map(PathBuf::from);

        let reconcile = &mut settings.reconcile;
        if let Some(raw) = provider.get_raw("reconcile.reserved_accounts").await? {
            reconcile.reserved_accounts = parse_account_list("reconcile.reserved_accounts", &raw)?;
        }
        if let Some(dry_run) = provider.get_parsed("reconcile.dry_run").await? {
            reconcile.dry_run = dry_run;
        }

        let logging = &mut settings.logging;
        if let Some(filter) = provider.get_raw("logging.filter").await? {
            logging.filter = filter;
        }
        if let Some(json) = provider.get_parsed("logging.json").await? {
            logging.json = json;
        }

        Ok(settings)
    }

    /// Report every problem at once.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut reject = |key: &str, message: &str| {
            errors.push(ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            })
        };

        if self.schedule.max_concurrency == 0 {
            reject("schedule.max_concurrency", "must be at least 1");
        }
        if self.schedule.interval.is_zero() {
            reject("schedule.interval_secs", "must be greater than zero");
        }
        if self.schedule.unit_timeout.is_zero() {
            reject("schedule.unit_timeout_secs", "must be greater than zero");
        }
        if self.source.command_timeout.is_zero() {
            reject("source.command_timeout_secs", "must be greater than zero");
        }
        if self.source.initial_backoff > self.source.max_backoff {
            reject(
                "source.initial_backoff_ms",
                "must not exceed source.max_backoff_ms",
            );
        }
        if self.source.kind == SourceKind::Memory && self.source.fixture.is_none() {
            reject("source.fixture", "required when source.kind is memory");
        }
        if self.ledger.kind == LedgerKind::Postgres && self.ledger.url.is_none() {
            reject("ledger.url", "required when ledger.kind is postgres");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationErrors(ValidationErrors(errors)))
        }
    }
}

/// A JSON array or a comma-separated list.
fn parse_account_list(key: &str, raw: &str) -> ConfigResult<BTreeSet<String>> {
    let raw = raw.trim();
    let names: Vec<String> = if raw.starts_with('[') {
        serde_json::from_str(raw).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?
    } else {
        raw.split(',').map(|s| s.trim().to_string()).collect()
    };
    Ok(names.into_iter().filter(|s| !s.is_empty()).collect())
}
