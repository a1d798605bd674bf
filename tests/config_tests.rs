//! Configuration Tests
//!
//! Layered settings: command-line overrides, then environment, then a JSON
//! file, with defaults for everything left unset.

use std::time::Duration;

use hpc_allocations::config::{
    ConfigBuilder, ConfigError, EnvConfigProvider, FileConfigProvider, LedgerKind,
    MemoryConfigProvider, Settings, SourceKind,
};
use hpc_allocations::scheduler::LockPolicy;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

async fn write_file(dir: &TempDir, value: serde_json::Value) -> std::path::PathBuf {
    let path = dir.path().join("su-reconcile.json");
    tokio::fs::write(&path, value.to_string()).await.unwrap();
    path
}

// ============================================================================
// Layering
// ============================================================================

mod layering_tests {
    use super::*;

    #[tokio::test]
    async fn test_file_values_are_loaded() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            serde_json::json!({
                "schedule": { "interval_secs": 900, "max_concurrency": 4, "lock_policy": "skip" },
                "source": { "kind": "memory", "max_retries": 1, "circuit_failure_threshold": 2 },
                "reconcile": { "reserved_accounts": ["root", "ops"], "dry_run": true },
                "logging": { "filter": "hpc_allocations=debug" }
            }),
        )
        .await;

        let providers = ConfigBuilder::new().file(&path).build();
        let settings = assert_ok!(Settings::load(&providers).await);

        assert_eq!(settings.schedule.interval, Duration::from_secs(900));
        assert_eq!(settings.schedule.max_concurrency, 4);
        assert_eq!(settings.schedule.lock_policy, LockPolicy::Skip);
        assert_eq!(settings.source.kind, SourceKind::Memory);
        assert!(settings.reconcile.reserved_accounts.contains("ops"));
        assert!(settings.reconcile.dry_run);
        assert_eq!(settings.logging.filter, "hpc_allocations=debug");

        let resilience = settings.source.resilience_config();
        assert_eq!(resilience.retry.max_retries, 1);
        assert_eq!(resilience.circuit.unwrap().failure_threshold, 2);

        let scheduler = settings.schedule.scheduler_config();
        assert_eq!(scheduler.max_concurrency, 4);
    }

    #[tokio::test]
    async fn test_overrides_beat_environment_beat_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            serde_json::json!({
                "schedule": { "interval_secs": 900, "unit_timeout_secs": 60 },
                "ledger": { "kind": "memory" }
            }),
        )
        .await;

        // SAFETY: Test-only environment setup with a prefix no other test uses
        unsafe { std::env::set_var("SU_LAYER_TEST_SCHEDULE_INTERVAL_SECS", "120") };
        unsafe { std::env::set_var("SU_LAYER_TEST_SCHEDULE_UNIT_TIMEOUT_SECS", "30") };

        let flags = MemoryConfigProvider::named("flags").value("schedule.unit_timeout_secs", "10");
        let providers = ConfigBuilder::new()
            .memory(flags)
            .provider(Box::new(EnvConfigProvider::prefixed("SU_LAYER_TEST_")))
            .provider(Box::new(FileConfigProvider::new(&path)))
            .build();
        let settings = Settings::load(&providers).await;

        unsafe { std::env::remove_var("SU_LAYER_TEST_SCHEDULE_INTERVAL_SECS") };
        unsafe { std::env::remove_var("SU_LAYER_TEST_SCHEDULE_UNIT_TIMEOUT_SECS") };

        let settings = assert_ok!(settings);
        assert_eq!(settings.schedule.interval, Duration::from_secs(120));
        assert_eq!(settings.schedule.unit_timeout, Duration::from_secs(10));
        assert_eq!(settings.ledger.kind, LedgerKind::Memory);
    }

    #[tokio::test]
    async fn test_fixture_path_is_read() {
        let providers = ConfigBuilder::new()
            .memory(MemoryConfigProvider::new().value("ledger.fixture", "/var/lib/su/ledger.json"))
            .build();
        let settings = assert_ok!(Settings::load(&providers).await);
        assert_eq!(
            settings.ledger.fixture.as_deref(),
            Some(std::path::Path::new("/var/lib/su/ledger.json"))
        );
    }
}

// ============================================================================
// Validation
// ============================================================================

mod validation_tests {
    use super::*;

    #[tokio::test]
    async fn test_postgres_requires_url() {
        let providers = ConfigBuilder::new()
            .memory(MemoryConfigProvider::new().value("ledger.kind", "postgres"))
            .build();
        let settings = assert_ok!(Settings::load(&providers).await);

        let err = assert_err!(settings.validate());
        assert!(err.to_string().contains("ledger.url"));
    }

    #[tokio::test]
    async fn test_memory_source_requires_fixture() {
        let providers = ConfigBuilder::new()
            .memory(MemoryConfigProvider::new().value("source.kind", "memory"))
            .build();
        let settings = assert_ok!(Settings::load(&providers).await);
        let err = assert_err!(settings.validate());
        assert!(err.to_string().contains("source.fixture"));

        let providers = ConfigBuilder::new()
            .memory(
                MemoryConfigProvider::new()
                    .value("source.kind", "memory")
                    .value("source.fixture", "accounts.json"),
            )
            .build();
        let settings = assert_ok!(Settings::load(&providers).await);
        assert_ok!(settings.validate());
    }

    #[tokio::test]
    async fn test_every_problem_is_reported() {
        let providers = ConfigBuilder::new()
            .memory(
                MemoryConfigProvider::new()
                    .value("schedule.max_concurrency", "0")
                    .value("schedule.interval_secs", "0")
                    .value("source.initial_backoff_ms", "9000"),
            )
            .build();
        let settings = assert_ok!(Settings::load(&providers).await);

        match settings.validate() {
            Err(ConfigError::ValidationErrors(errors)) => assert_eq!(errors.0.len(), 3),
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_values_fail_to_load() {
        for (key, value) in [
            ("schedule.lock_policy", "block"),
            ("source.kind", "pbs"),
            ("reconcile.dry_run", "maybe"),
            ("reconcile.reserved_accounts", "[root"),
        ] {
            let providers = ConfigBuilder::new()
                .memory(MemoryConfigProvider::new().value(key, value))
                .build();
            let err = assert_err!(Settings::load(&providers).await);
            assert!(err.to_string().contains(key), "{} -> {}", key, err);
        }
    }
}
