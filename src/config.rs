//! Configuration resolution (§6.3): CLI args -> environment variables
//! (`PYWORKFLOW_` prefix) -> `pyworkflow.config.yaml` -> defaults, each layer
//! overriding the one before it only where it sets a value.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: serde_yaml::Error },
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PartialStorageConfig {
    backend: Option<String>,
    path: Option<String>,
    dsn: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PartialWorkerSection {
    concurrency: Option<u32>,
    max_memory: Option<u64>,
    max_tasks: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PartialRecoverySection {
    interval: Option<u64>,
    max_attempts: Option<u32>,
}

/// Every field is optional here; this is what a config file or the
/// environment may partially specify before defaults fill the rest.
#[derive(Debug, Clone, Default, Deserialize)]
struct PartialConfig {
    module: Option<String>,
    runtime: Option<String>,
    storage: Option<PartialStorageConfig>,
    broker_url: Option<String>,
    result_backend_url: Option<String>,
    worker: Option<PartialWorkerSection>,
    recovery: Option<PartialRecoverySection>,
    nesting_limit: Option<u32>,
    claim_ttl_secs: Option<u64>,
}

impl PartialConfig {
    fn merge(self, overlay: PartialConfig) -> PartialConfig {
        PartialConfig {
            module: overlay.module.or(self.module),
            runtime: overlay.runtime.or(self.runtime),
            storage: match (self.storage, overlay.storage) {
                (Some(base), Some(over)) => Some(PartialStorageConfig {
                    backend: over.backend.or(base.backend),
                    path: over.path.or(base.path),
                    dsn: over.dsn.or(base.dsn),
                }),
                (base, over) => over.or(base),
            },
            broker_url: overlay.broker_url.or(self.broker_url),
            result_backend_url: overlay.result_backend_url.or(self.result_backend_url),
            worker: match (self.worker, overlay.worker) {
                (Some(base), Some(over)) => Some(PartialWorkerSection {
                    concurrency: over.concurrency.or(base.concurrency),
                    max_memory: over.max_memory.or(base.max_memory),
                    max_tasks: over.max_tasks.or(base.max_tasks),
                }),
                (base, over) => over.or(base),
            },
            recovery: match (self.recovery, overlay.recovery) {
                (Some(base), Some(over)) => Some(PartialRecoverySection {
                    interval: over.interval.or(base.interval),
                    max_attempts: over.max_attempts.or(base.max_attempts),
                }),
                (base, over) => over.or(base),
            },
            nesting_limit: overlay.nesting_limit.or(self.nesting_limit),
            claim_ttl_secs: overlay.claim_ttl_secs.or(self.claim_ttl_secs),
        }
    }

    fn from_env() -> Self {
        let var = |name: &str| std::env::var(format!("PYWORKFLOW_{name}")).ok();
        Self {
            module: var("MODULE"),
            runtime: var("RUNTIME"),
            storage: Some(PartialStorageConfig {
                backend: var("STORAGE_BACKEND"),
                path: var("STORAGE_PATH"),
                dsn: var("STORAGE_DSN"),
            }),
            broker_url: var("BROKER_URL"),
            result_backend_url: var("RESULT_BACKEND_URL"),
            worker: Some(PartialWorkerSection {
                concurrency: var("WORKER_CONCURRENCY").and_then(|v| v.parse().ok()),
                max_memory: var("WORKER_MAX_MEMORY").and_then(|v| v.parse().ok()),
                max_tasks: var("WORKER_MAX_TASKS").and_then(|v| v.parse().ok()),
            }),
            recovery: Some(PartialRecoverySection {
                interval: var("RECOVERY_INTERVAL").and_then(|v| v.parse().ok()),
                max_attempts: var("RECOVERY_MAX_ATTEMPTS").and_then(|v| v.parse().ok()),
            }),
            nesting_limit: var("NESTING_LIMIT").and_then(|v| v.parse().ok()),
            claim_ttl_secs: var("CLAIM_TTL").and_then(|v| v.parse().ok()),
        }
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// CLI-supplied overrides, the highest-precedence layer. `None` means "the
/// flag wasn't passed", not "set to empty".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub module: Option<String>,
    pub storage_backend: Option<String>,
    pub storage_path: Option<String>,
    pub storage_dsn: Option<String>,
    pub broker_url: Option<String>,
    pub worker_concurrency: Option<u32>,
}

impl From<ConfigOverrides> for PartialConfig {
    fn from(o: ConfigOverrides) -> Self {
        PartialConfig {
            module: o.module,
            runtime: None,
            storage: Some(PartialStorageConfig {
                backend: o.storage_backend,
                path: o.storage_path,
                dsn: o.storage_dsn,
            }),
            broker_url: o.broker_url,
            result_backend_url: None,
            worker: Some(PartialWorkerSection {
                concurrency: o.worker_concurrency,
                max_memory: None,
                max_tasks: None,
            }),
            recovery: None,
            nesting_limit: None,
            claim_ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub backend: String,
    pub path: Option<String>,
    pub dsn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSection {
    pub concurrency: u32,
    pub max_memory: Option<u64>,
    pub max_tasks: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySection {
    pub interval_secs: u64,
    pub max_attempts: u32,
}

/// The fully-resolved configuration, every field defaulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub module: String,
    pub runtime: String,
    pub storage: StorageConfig,
    pub broker_url: String,
    pub result_backend_url: Option<String>,
    pub worker: WorkerSection,
    pub recovery: RecoverySection,
    pub nesting_limit: u32,
    pub claim_ttl_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            module: "workflows".to_string(),
            runtime: "tokio".to_string(),
            storage: StorageConfig {
                backend: "memory".to_string(),
                path: None,
                dsn: None,
            },
            broker_url: "memory://".to_string(),
            result_backend_url: None,
            worker: WorkerSection {
                concurrency: 16,
                max_memory: None,
                max_tasks: None,
            },
            recovery: RecoverySection {
                interval_secs: 15,
                max_attempts: 5,
            },
            nesting_limit: crate::model::run::DEFAULT_NESTING_LIMIT,
            claim_ttl_secs: 30,
        }
    }
}

/// Loads `pyworkflow.config.yaml` (if present at `config_path`), overlays
/// `PYWORKFLOW_*` environment variables, then `overrides` from parsed CLI
/// flags, and fills anything still unset from [`WorkerConfig::default`].
pub fn resolve(config_path: &Path, overrides: ConfigOverrides) -> Result<WorkerConfig, ConfigError> {
    // Load a .env file if present so `PYWORKFLOW_*` vars can be set without
    // exporting them into the shell; absence is not an error.
    let _ = dotenvy::dotenv();

    let from_file = if config_path.exists() {
        PartialConfig::from_file(config_path)?
    } else {
        PartialConfig::default()
    };
    let from_env = PartialConfig::from_env();
    let from_cli: PartialConfig = overrides.into();

    let merged = from_file.merge(from_env).merge(from_cli);
    let defaults = WorkerConfig::default();

    Ok(WorkerConfig {
        module: merged.module.unwrap_or(defaults.module),
        runtime: merged.runtime.unwrap_or(defaults.runtime),
        storage: match merged.storage {
            Some(s) => StorageConfig {
                backend: s.backend.unwrap_or(defaults.storage.backend),
                path: s.path.or(defaults.storage.path),
                dsn: s.dsn.or(defaults.storage.dsn),
            },
            None => defaults.storage,
        },
        broker_url: merged.broker_url.unwrap_or(defaults.broker_url),
        result_backend_url: merged.result_backend_url.or(defaults.result_backend_url),
        worker: match merged.worker {
            Some(w) => WorkerSection {
                concurrency: w.concurrency.unwrap_or(defaults.worker.concurrency),
                max_memory: w.max_memory.or(defaults.worker.max_memory),
                max_tasks: w.max_tasks.or(defaults.worker.max_tasks),
            },
            None => defaults.worker,
        },
        recovery: match merged.recovery {
            Some(r) => RecoverySection {
                interval_secs: r.interval.unwrap_or(defaults.recovery.interval_secs),
                max_attempts: r.max_attempts.unwrap_or(defaults.recovery.max_attempts),
            },
            None => defaults.recovery,
        },
        nesting_limit: merged.nesting_limit.unwrap_or(defaults.nesting_limit),
        claim_ttl_secs: merged.claim_ttl_secs.unwrap_or(defaults.claim_ttl_secs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_set() {
        let config = resolve(Path::new("/nonexistent/pyworkflow.config.yaml"), ConfigOverrides::default()).unwrap();
        assert_eq!(config, WorkerConfig::default());
    }

    #[test]
    fn cli_override_wins_over_default() {
        let overrides = ConfigOverrides {
            storage_backend: Some("postgres".to_string()),
            ..Default::default()
        };
        let config = resolve(Path::new("/nonexistent/pyworkflow.config.yaml"), overrides).unwrap();
        assert_eq!(config.storage.backend, "postgres");
    }

    #[test]
    fn file_values_fill_unset_fields() {
        let dir = std::env::temp_dir().join(format!("pyworkflow-config-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pyworkflow.config.yaml");
        std::fs::write(&path, "module: billing_workflows\nnesting_limit: 7\n").unwrap();

        let config = resolve(&path, ConfigOverrides::default()).unwrap();
        assert_eq!(config.module, "billing_workflows");
        assert_eq!(config.nesting_limit, 7);

        std::fs::remove_dir_all(&dir).ok();
    }
}
