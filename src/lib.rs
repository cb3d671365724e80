/// wireflow: local-first workflow automation engine
///
/// Executes node graphs as handle-aware data flow, with Iterator and Loop containers,
/// and starts runs from webhooks and cron schedules.

// Core configuration and setup
pub mod config;

// Typed errors crossing module and HTTP boundaries
pub mod error;

// Persistence collaborator
pub mod store;

// Workflow model, validation and compiled-plan registry
pub mod workflow;

// Graph execution engine, node handlers and run records
pub mod runtime;

// Webhook listener, cron scheduler and trigger manager
pub mod trigger;

// HTTP control API
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use runtime::{RunRequest, WorkflowRunner};
pub use server::start_server;
pub use trigger::TriggerManager;
pub use workflow::{Edge, Node, NodeKind, Workflow, WorkflowGraph};
