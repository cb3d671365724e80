/// Workflow Management Layer
///
/// Graph model, value types, structural validation and the compiled-plan registry:
/// - Type definitions (Workflow, Node, Edge, NodeKind)
/// - Tagged-union node values and handle-keyed outputs
/// - Bounded subgraph extraction shared by all container kinds
/// - Validation and compilation into an execution plan
/// - Lock-free hot-reload registry using ArcSwap

// Core workflow type definitions
pub mod types;

// Dynamically typed handle values
pub mod value;

// Container body extraction
pub mod subgraph;

// Structural validation and execution plans
pub mod validation;

// Hot-reload registry of compiled workflows
pub mod registry;

// Re-export commonly used types
pub use registry::{CompiledWorkflow, WorkflowRegistry};
pub use types::{Edge, Node, NodeKind, Workflow, WorkflowGraph};
pub use validation::{compile, validate, ExecutionPlan, ValidationReport};
pub use value::{NodeOutput, NodeValue, ValueType};
