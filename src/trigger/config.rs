/// Trigger configuration documents
///
/// A trigger record stores its config as free-form JSON. These types are the parsed,
/// validated form used when a trigger is armed. Parsing rejects configs that would
/// arm in a dangerous or undefined state (an empty auth secret, a bad cron
/// expression), so those problems surface at arm time.

use crate::error::TriggerError;
use crate::trigger::cron::compile_expression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a webhook request is authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    None,
    /// `Authorization: Bearer <secret>`
    Token,
    /// `X-Signature: sha256=<hex hmac of the raw body>`
    Hmac,
}

/// When the webhook answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// 202 as soon as the run is accepted
    #[default]
    Immediate,
    /// Block until the run finishes or the route timeout elapses
    Wait,
}

/// What the scheduler does with minutes it missed while not running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpPolicy {
    #[default]
    Skip,
    RunOnce,
    RunAll,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWebhookConfig {
    #[serde(default)]
    path: String,
    #[serde(default)]
    methods: Vec<String>,
    #[serde(default)]
    response_mode: ResponseMode,
    timeout_secs: Option<u64>,
    max_per_minute: Option<u32>,
    #[serde(default)]
    auth_mode: AuthMode,
    #[serde(alias = "authToken", alias = "hmacSecret")]
    secret: Option<String>,
}

/// Validated webhook route settings
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookConfig {
    /// Route key: no leading or trailing slash
    pub path: String,
    /// Upper-case method allow-list
    pub methods: Vec<String>,
    pub response_mode: ResponseMode,
    pub timeout_secs: u64,
    pub max_per_minute: Option<u32>,
    pub auth_mode: AuthMode,
    pub secret: String,
}

impl WebhookConfig {
    /// `default_timeout_secs` applies when the route sets no `timeoutSecs`
    pub fn parse(config: &Value, default_timeout_secs: u64) -> Result<Self, TriggerError> {
        let raw: RawWebhookConfig = serde_json::from_value(config.clone())
            .map_err(|e| TriggerError::InvalidConfig(format!("webhook config: {}", e)))?;

        let path = normalize_path(&raw.path);
        if path.is_empty() {
            return Err(TriggerError::InvalidConfig("webhook path must not be empty".into()));
        }
        if path.chars().any(|c| c.is_whitespace() || c == '?' || c == '#') {
            return Err(TriggerError::InvalidConfig(format!("invalid webhook path '{}'", raw.path)));
        }

        let methods: Vec<String> = if raw.methods.is_empty() {
            vec!["POST".to_string()]
        } else {
            raw.methods.iter().map(|m| m.trim().to_uppercase()).collect()
        };

        let secret = raw.secret.unwrap_or_default().trim().to_string();
        if raw.auth_mode != AuthMode::None && secret.is_empty() {
            return Err(TriggerError::InvalidConfig(format!(
                "auth mode {:?} requires a non-empty secret",
                raw.auth_mode
            )));
        }
        if raw.max_per_minute == Some(0) {
            return Err(TriggerError::InvalidConfig("maxPerMinute must be at least 1".into()));
        }

        Ok(Self {
            path,
            methods,
            response_mode: raw.response_mode,
            timeout_secs: raw
                .timeout_secs
                .filter(|t| *t > 0)
                .unwrap_or(default_timeout_secs),
            max_per_minute: raw.max_per_minute,
            auth_mode: raw.auth_mode,
            secret,
        })
    }

    pub fn allows(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// Strip surrounding slashes so `/hook/` and `hook` name the same route
pub fn normalize_path(path: &str) -> String {
    path.trim().trim_matches('/').to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCronConfig {
    #[serde(default)]
    expression: String,
    max_concurrent: Option<u32>,
    #[serde(default)]
    catch_up: CatchUpPolicy,
    #[serde(default)]
    input: Value,
}

/// Validated cron settings
#[derive(Debug, Clone, PartialEq)]
pub struct CronConfig {
    /// The 5-field expression as the user wrote it
    pub expression: String,
    /// Ceiling on concurrently active runs, at least 1
    pub max_concurrent: usize,
    pub catch_up: CatchUpPolicy,
    /// Static input handed to every run
    pub input: Value,
}

impl CronConfig {
    pub fn parse(config: &Value) -> Result<Self, TriggerError> {
        let raw: RawCronConfig = serde_json::from_value(config.clone())
            .map_err(|e| TriggerError::InvalidConfig(format!("cron config: {}", e)))?;
        let expression = raw.expression.trim().to_string();
        compile_expression(&expression).map_err(|e| TriggerError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            expression,
            max_concurrent: raw.max_concurrent.unwrap_or(1).max(1) as usize,
            catch_up: raw.catch_up,
            input: raw.input,
        })
    }
}
