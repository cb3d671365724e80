/// wireflow: local-first workflow automation engine
///
/// Main entry point. Loads configuration from the environment and starts the
/// control API, the webhook listener (on first armed hook) and the cron loop.

use wireflow::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Workflow management API at /api/workflows/*
/// - Trigger management at /api/triggers/*
/// - Run records at /api/runs/*
/// - Webhooks at {WIREFLOW_WEBHOOK_BASE}/* on the webhook port
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    start_server(config).await?;
    Ok(())
}
