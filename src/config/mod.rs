/// Configuration management for the wireflow engine
///
/// Handles server, storage, trigger and execution parameters. Every value can be
/// overridden with a `WIREFLOW_*` environment variable for container deployment.

use crate::runtime::EngineLimits;
use crate::trigger::TriggerSettings;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control API server
    pub server: ServerConfig,
    /// Persistent storage
    pub database: DatabaseConfig,
    /// Shared webhook listener
    pub webhook: WebhookListenerConfig,
    /// Cron tick loop
    pub cron: CronConfig,
    /// Execution bounds
    pub execution: ExecutionConfig,
    /// Model backend used by llm and router nodes
    pub model: ModelConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding `wireflow.db`; `:memory:` keeps everything in process
    pub data_dir: String,
}

impl DatabaseConfig {
    pub fn in_memory(&self) -> bool {
        self.data_dir == ":memory:"
    }

    pub fn database_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("wireflow.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookListenerConfig {
    pub host: String,
    pub port: u16,
    /// Path prefix for hooks, e.g. `/hook`
    pub base_path: String,
    /// Default requests per minute per path
    pub rate_per_minute: u32,
    /// Default wait-mode timeout
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    pub tick_ms: u64,
    /// Cap on replays under the `run_all` catch-up policy
    pub max_catch_up: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub max_loop_iterations: u32,
    pub iterator_concurrency: usize,
    pub shell_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("WIREFLOW_HOST", "0.0.0.0"),
                port: env_parse("WIREFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: env_or("WIREFLOW_DATA_DIR", "data"),
            },
            webhook: WebhookListenerConfig {
                host: env_or("WIREFLOW_WEBHOOK_HOST", "127.0.0.1"),
                port: env_parse("WIREFLOW_WEBHOOK_PORT", 9876),
                base_path: env_or("WIREFLOW_WEBHOOK_BASE", "/hook"),
                rate_per_minute: env_parse("WIREFLOW_WEBHOOK_RATE", 60),
                timeout_secs: env_parse("WIREFLOW_WEBHOOK_TIMEOUT", 30),
            },
            cron: CronConfig {
                tick_ms: env_parse("WIREFLOW_CRON_TICK_MS", 1000),
                max_catch_up: env_parse("WIREFLOW_CRON_MAX_CATCH_UP", 10),
            },
            execution: ExecutionConfig {
                max_loop_iterations: env_parse("WIREFLOW_MAX_LOOP_ITERATIONS", 50),
                iterator_concurrency: env_parse("WIREFLOW_ITERATOR_CONCURRENCY", 4),
                shell_timeout_secs: env_parse("WIREFLOW_SHELL_TIMEOUT", 30),
            },
            model: ModelConfig {
                endpoint: env_opt("WIREFLOW_MODEL_ENDPOINT"),
                api_key: env_opt("WIREFLOW_MODEL_API_KEY"),
            },
        }
    }
}

impl Config {
    pub fn engine_limits(&self) -> EngineLimits {
        EngineLimits {
            max_loop_iterations: self.execution.max_loop_iterations.max(1),
            iterator_concurrency: self.execution.iterator_concurrency.max(1),
        }
    }

    pub fn trigger_settings(&self) -> TriggerSettings {
        TriggerSettings {
            webhook_base: self.webhook.base_path.clone(),
            webhook_rate_per_minute: self.webhook.rate_per_minute.max(1),
            webhook_timeout_secs: self.webhook.timeout_secs.max(1),
            cron_max_catch_up: self.cron.max_catch_up,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_settings_are_clamped() {
        let mut config = Config::default();
        config.execution.max_loop_iterations = 0;
        config.execution.iterator_concurrency = 0;
        config.webhook.rate_per_minute = 0;

        let limits = config.engine_limits();
        assert_eq!(limits.max_loop_iterations, 1);
        assert_eq!(limits.iterator_concurrency, 1);
        assert_eq!(config.trigger_settings().webhook_rate_per_minute, 1);
    }

    #[test]
    fn memory_data_dir_is_recognised() {
        let database = DatabaseConfig { data_dir: ":memory:".into() };
        assert!(database.in_memory());
        let database = DatabaseConfig { data_dir: "data".into() };
        assert!(!database.in_memory());
        assert!(database.database_path().ends_with("wireflow.db"));
    }
}
