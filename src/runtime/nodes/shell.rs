/// Shell exec node
///
/// Runs `sh -c <command>` with a cleared environment (plus `PATH`, `HOME` and any
/// `envVars`) under a wall-clock bound that is always enforced: default from config,
/// capped at 300 seconds. The child is killed when the bound elapses.

use super::{NodeContext, NodeHandler, NodeResult};
use crate::error::NodeError;
use crate::workflow::types::NodeKind;
use crate::workflow::value::{NodeOutput, NodeValue};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Upper bound for any configured subprocess timeout
pub const MAX_SHELL_TIMEOUT_SECS: u64 = 300;

pub struct ShellExecNode {
    default_timeout_secs: u64,
}

impl ShellExecNode {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            default_timeout_secs: default_timeout_secs.clamp(1, MAX_SHELL_TIMEOUT_SECS),
        }
    }
}

#[async_trait]
impl NodeHandler for ShellExecNode {
    fn kind(&self) -> NodeKind {
        NodeKind::ShellExec
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let command = match ctx.handle("command") {
            Some(value) => value.as_text(),
            None => match ctx.config_str("command") {
                Some(command) => command.to_string(),
                None => ctx.input().as_text(),
            },
        };
        if command.trim().is_empty() {
            return Err(NodeError::config(format!("shell node '{}' has an empty command", ctx.node.id)));
        }
        let timeout_secs = ctx
            .config_u64("timeoutSecs")
            .unwrap_or(self.default_timeout_secs)
            .clamp(1, MAX_SHELL_TIMEOUT_SECS);

        let mut cmd = Command::new(ctx.config_str("shell").unwrap_or("sh"));
        cmd.arg("-c").arg(&command);
        cmd.env_clear();
        cmd.env("PATH", std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()));
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }
        if let Some(vars) = ctx.config.get("envVars").and_then(Value::as_object) {
            for (key, value) in vars {
                if let Some(value) = value.as_str() {
                    cmd.env(key, value);
                }
            }
        }
        if let Some(dir) = ctx.config_str("workingDir").filter(|d| !d.is_empty()) {
            cmd.current_dir(dir);
        }

        let stdin = ctx.handle("stdin").map(NodeValue::as_text);
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!("🐚 Shell node {} running: {}", ctx.node.id, command);
        let mut child = cmd
            .spawn()
            .map_err(|e| NodeError::failed(format!("Failed to spawn shell process: {}", e)))?;
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data.as_bytes())
                .await
                .map_err(|e| NodeError::failed(format!("Failed to write stdin: {}", e)))?;
        }

        // dropping the wait future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(NodeError::failed(format!("Shell process error: {}", e))),
            Err(_) => {
                tracing::warn!("⏰ Shell node {} timed out after {}s", ctx.node.id, timeout_secs);
                return Err(NodeError::Timeout { secs: timeout_secs });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if exit_code != 0 && ctx.config.get("failOnError").and_then(Value::as_bool).unwrap_or(false) {
            return Err(NodeError::failed(format!("command exited with {}: {}", exit_code, stderr.trim())));
        }

        Ok(NodeResult::new(
            NodeOutput::new()
                .with("stdout", stdout)
                .with("stderr", stderr)
                .with("exitCode", NodeValue::Number(f64::from(exit_code))),
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runtime::nodes::testing::{execute, run_context};
    use crate::workflow::types::Node;
    use serde_json::{json, Map};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let node = Node::new("sh", NodeKind::ShellExec, json!({"command": "echo hello; exit 3"}));
        let run = run_context(Map::new());
        let out = execute(&ShellExecNode::new(30), &node, BTreeMap::new(), &run).await.unwrap();
        assert_eq!(out.output.resolve("stdout"), NodeValue::text("hello\n"));
        assert_eq!(out.output.resolve("exitCode"), NodeValue::Number(3.0));
    }

    #[tokio::test]
    async fn stdin_handle_is_piped() {
        let node = Node::new("sh", NodeKind::ShellExec, json!({"command": "tr a-z A-Z"}));
        let run = run_context(Map::new());
        let inputs = BTreeMap::from([("stdin".to_string(), NodeValue::text("shout"))]);
        let out = execute(&ShellExecNode::new(30), &node, inputs, &run).await.unwrap();
        assert_eq!(out.output.resolve("stdout"), NodeValue::text("SHOUT"));
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let node = Node::new("sh", NodeKind::ShellExec, json!({"command": "sleep 5", "timeoutSecs": 1}));
        let run = run_context(Map::new());
        let err = execute(&ShellExecNode::new(30), &node, BTreeMap::new(), &run).await.unwrap_err();
        assert!(matches!(err, NodeError::Timeout { secs: 1 }));
    }
}
