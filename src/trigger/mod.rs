/// Trigger subsystem
///
/// Starts workflow runs from outside stimuli:
/// - Webhooks on one shared HTTP listener, with auth and per-path rate limits
/// - Cron schedules on a periodic tick loop with per-minute dedup
/// - A manager that owns arming, disarming and the listener lifecycle

// Parsed trigger configs
pub mod config;

// Token and HMAC request checks
pub mod auth;

// Per-path token buckets
pub mod rate_limit;

// Shared fire path and trigger log
pub mod dispatch;

// Axum webhook listener
pub mod webhook;

// Cron tick loop
pub mod cron;

// Arm/disarm and trigger commands
pub mod manager;

pub use config::{AuthMode, CatchUpPolicy, CronConfig, ResponseMode, WebhookConfig};
pub use cron::CronScheduler;
pub use dispatch::{Dispatcher, FireMode};
pub use manager::{TriggerManager, TriggerPatch, TriggerSettings};
pub use rate_limit::RateLimiter;
pub use webhook::{AxumWebhookListener, ListenerStatus, WebhookListener};
