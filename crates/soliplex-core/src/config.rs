// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration loaded from environment variables.

use std::time::Duration;

/// Which artifact backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactBackend {
    /// Local filesystem under the configured artifact root.
    Fs,
    /// The relational store (`document_bytes` table).
    Db,
    /// S3-compatible object store.
    S3,
}

impl ArtifactBackend {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "fs" => Some(Self::Fs),
            "db" => Some(Self::Db),
            "s3" => Some(Self::S3),
            _ => None,
        }
    }
}

/// S3 settings for the `s3` artifact backend.
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    /// Bucket name.
    pub bucket: String,
    /// Custom endpoint URL for S3-compatible stores; empty for AWS.
    pub endpoint: String,
    /// Region.
    pub region: String,
    /// Access key id; empty to use the ambient credential chain.
    pub access_key_id: String,
    /// Secret access key; empty to use the ambient credential chain.
    pub secret_access_key: String,
}

/// Ingester configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite or PostgreSQL connection URL.
    pub database_url: String,
    /// Artifact backend selector.
    pub artifact_backend: ArtifactBackend,
    /// Root directory for the `fs` artifact backend.
    pub file_store_dir: String,
    /// Root directory handed to the `store` step's vector database.
    pub vector_store_dir: String,
    /// Directory of workflow definition YAML files.
    pub workflow_dir: String,
    /// Directory of parameter set YAML files.
    pub param_dir: String,
    /// Workflow definition used when none is specified.
    pub default_workflow_id: String,
    /// Parameter set used when none is specified.
    pub default_param_id: String,
    /// Size of each worker's internal task pool.
    pub worker_concurrency: usize,
    /// Steps claimed per poll.
    pub claim_batch_size: usize,
    /// Heartbeat interval.
    pub worker_checkin_interval: Duration,
    /// Staleness threshold for worker reclaim. Must exceed the heartbeat
    /// interval by a wide margin (recommended >= 5x).
    pub worker_checkin_timeout: Duration,
    /// Base delay for retry backoff.
    pub retry_base: Duration,
    /// Ceiling for retry backoff.
    pub retry_cap: Duration,
    /// Sleep between empty claim polls.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight steps before cancelling them.
    pub drain_deadline: Duration,
    /// S3 settings, used when the artifact backend is `s3`.
    pub s3: S3Settings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `SOLIPLEX_DATABASE_URL`: SQLite or PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `SOLIPLEX_ARTIFACT_BACKEND`: `fs` | `db` | `s3` (default: `fs`)
    /// - `SOLIPLEX_FILE_STORE_DIR` (default: `file_store`)
    /// - `SOLIPLEX_VECTOR_STORE_DIR` (default: `lancedb`)
    /// - `SOLIPLEX_WORKFLOW_DIR` (default: `config/workflows`)
    /// - `SOLIPLEX_PARAM_DIR` (default: `config/params`)
    /// - `SOLIPLEX_DEFAULT_WORKFLOW_ID` (default: `batch_split`)
    /// - `SOLIPLEX_DEFAULT_PARAM_ID` (default: `default`)
    /// - `SOLIPLEX_WORKER_CONCURRENCY` (default: 10)
    /// - `SOLIPLEX_CLAIM_BATCH_SIZE` (default: 5)
    /// - `SOLIPLEX_WORKER_CHECKIN_INTERVAL` seconds (default: 120)
    /// - `SOLIPLEX_WORKER_CHECKIN_TIMEOUT` seconds (default: 600)
    /// - `SOLIPLEX_RETRY_BASE_SECS` (default: 5)
    /// - `SOLIPLEX_RETRY_CAP_SECS` (default: 600)
    /// - `SOLIPLEX_POLL_INTERVAL_SECS` (default: 1)
    /// - `SOLIPLEX_DRAIN_DEADLINE_SECS` (default: 30)
    /// - `SOLIPLEX_S3_BUCKET` / `_ENDPOINT` / `_REGION` / `_ACCESS_KEY_ID` /
    ///   `_SECRET_ACCESS_KEY` for the `s3` backend
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("SOLIPLEX_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("SOLIPLEX_DATABASE_URL"))?;

        let backend_raw =
            std::env::var("SOLIPLEX_ARTIFACT_BACKEND").unwrap_or_else(|_| "fs".to_string());
        let artifact_backend = ArtifactBackend::parse(&backend_raw).ok_or(
            ConfigError::InvalidValue("SOLIPLEX_ARTIFACT_BACKEND", "must be one of fs, db, s3"),
        )?;

        Ok(Self {
            database_url,
            artifact_backend,
            file_store_dir: env_string("SOLIPLEX_FILE_STORE_DIR", "file_store"),
            vector_store_dir: env_string("SOLIPLEX_VECTOR_STORE_DIR", "lancedb"),
            workflow_dir: env_string("SOLIPLEX_WORKFLOW_DIR", "config/workflows"),
            param_dir: env_string("SOLIPLEX_PARAM_DIR", "config/params"),
            default_workflow_id: env_string("SOLIPLEX_DEFAULT_WORKFLOW_ID", "batch_split"),
            default_param_id: env_string("SOLIPLEX_DEFAULT_PARAM_ID", "default"),
            worker_concurrency: env_parse("SOLIPLEX_WORKER_CONCURRENCY", 10)?,
            claim_batch_size: env_parse("SOLIPLEX_CLAIM_BATCH_SIZE", 5)?,
            worker_checkin_interval: Duration::from_secs(env_parse(
                "SOLIPLEX_WORKER_CHECKIN_INTERVAL",
                120,
            )?),
            worker_checkin_timeout: Duration::from_secs(env_parse(
                "SOLIPLEX_WORKER_CHECKIN_TIMEOUT",
                600,
            )?),
            retry_base: Duration::from_secs(env_parse("SOLIPLEX_RETRY_BASE_SECS", 5)?),
            retry_cap: Duration::from_secs(env_parse("SOLIPLEX_RETRY_CAP_SECS", 600)?),
            poll_interval: Duration::from_secs(env_parse("SOLIPLEX_POLL_INTERVAL_SECS", 1)?),
            drain_deadline: Duration::from_secs(env_parse("SOLIPLEX_DRAIN_DEADLINE_SECS", 30)?),
            s3: S3Settings {
                bucket: env_string("SOLIPLEX_S3_BUCKET", ""),
                endpoint: env_string("SOLIPLEX_S3_ENDPOINT", ""),
                region: env_string("SOLIPLEX_S3_REGION", ""),
                access_key_id: env_string("SOLIPLEX_S3_ACCESS_KEY_ID", ""),
                secret_access_key: env_string("SOLIPLEX_S3_SECRET_ACCESS_KEY", ""),
            },
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn clear_all(guard: &mut EnvGuard) {
        for key in [
            "SOLIPLEX_DATABASE_URL",
            "SOLIPLEX_ARTIFACT_BACKEND",
            "SOLIPLEX_FILE_STORE_DIR",
            "SOLIPLEX_VECTOR_STORE_DIR",
            "SOLIPLEX_WORKFLOW_DIR",
            "SOLIPLEX_PARAM_DIR",
            "SOLIPLEX_DEFAULT_WORKFLOW_ID",
            "SOLIPLEX_DEFAULT_PARAM_ID",
            "SOLIPLEX_WORKER_CONCURRENCY",
            "SOLIPLEX_CLAIM_BATCH_SIZE",
            "SOLIPLEX_WORKER_CHECKIN_INTERVAL",
            "SOLIPLEX_WORKER_CHECKIN_TIMEOUT",
            "SOLIPLEX_RETRY_BASE_SECS",
            "SOLIPLEX_RETRY_CAP_SECS",
            "SOLIPLEX_POLL_INTERVAL_SECS",
            "SOLIPLEX_DRAIN_DEADLINE_SECS",
        ] {
            guard.remove(key);
        }
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SOLIPLEX_DATABASE_URL", "sqlite:.data/ingester.db");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:.data/ingester.db");
        assert_eq!(config.artifact_backend, ArtifactBackend::Fs);
        assert_eq!(config.file_store_dir, "file_store");
        assert_eq!(config.vector_store_dir, "lancedb");
        assert_eq!(config.workflow_dir, "config/workflows");
        assert_eq!(config.param_dir, "config/params");
        assert_eq!(config.default_workflow_id, "batch_split");
        assert_eq!(config.default_param_id, "default");
        assert_eq!(config.worker_concurrency, 10);
        assert_eq!(config.claim_batch_size, 5);
        assert_eq!(config.worker_checkin_interval, Duration::from_secs(120));
        assert_eq!(config.worker_checkin_timeout, Duration::from_secs(600));
        assert_eq!(config.retry_base, Duration::from_secs(5));
        assert_eq!(config.retry_cap, Duration::from_secs(600));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.drain_deadline, Duration::from_secs(30));
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingEnvVar("SOLIPLEX_DATABASE_URL")
        ));
    }

    #[test]
    fn test_config_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SOLIPLEX_DATABASE_URL", "postgres://localhost/soliplex");
        guard.set("SOLIPLEX_ARTIFACT_BACKEND", "db");
        guard.set("SOLIPLEX_WORKER_CONCURRENCY", "4");
        guard.set("SOLIPLEX_RETRY_BASE_SECS", "2");

        let config = Config::from_env().unwrap();

        assert_eq!(config.artifact_backend, ArtifactBackend::Db);
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.retry_base, Duration::from_secs(2));
    }

    #[test]
    fn test_config_invalid_backend() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SOLIPLEX_DATABASE_URL", "sqlite::memory:");
        guard.set("SOLIPLEX_ARTIFACT_BACKEND", "tape");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue("SOLIPLEX_ARTIFACT_BACKEND", _)
        ));
    }

    #[test]
    fn test_config_invalid_number() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SOLIPLEX_DATABASE_URL", "sqlite::memory:");
        guard.set("SOLIPLEX_CLAIM_BATCH_SIZE", "many");

        assert!(Config::from_env().is_err());
    }
}
