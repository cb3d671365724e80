/// Runtime Execution Engine
///
/// This module executes compiled workflow plans.
/// It handles:
/// - Topological execution of top-level nodes with handle-aware data flow
/// - Iterator and Loop containers over bounded sub-graphs
/// - Node executors behind one `NodeHandler` contract
/// - Run records, cancellation and lifecycle events

// Core DAG walker
pub mod engine;

// Iterator and Loop execution
pub mod container;

// Per-run state: inputs, trigger payload, cancellation
pub mod context;

// Lifecycle event envelopes and sinks
pub mod events;

// {{…}} placeholder resolution
pub mod template;

// Model backend collaborator
pub mod backend;

// Individual node execution handlers
pub mod nodes;

// Run records, spawning and cancellation
pub mod runner;

// Re-export main types
pub use context::{RunContext, RunRequest, TriggerPayload};
pub use engine::{EngineLimits, GraphExecutor, NodeFailure, RunOutcome};
pub use events::{BroadcastEventSink, EventEnvelope, EventSink, FanoutEventSink, TracingEventSink};
pub use nodes::{NodeHandler, NodeRegistry};
pub use runner::{RunHandle, RunLauncher, WorkflowRunner};
