/// Transform node: template, Lua script, JSONPath or pass-through
///
/// Config picks the mode, either explicitly with `mode` or by which key is present:
/// - `template`: already resolved by the engine, emitted as text
/// - `script`: Lua 5.4 (mlua) with `input`, `inputs` and `vars` globals
/// - `jsonpath`: selection over the primary input
///
/// Scripts run on the blocking pool inside a fresh, stripped-down Lua state and are
/// interrupted by an instruction-count hook once their wall-clock bound passes.

use super::{NodeContext, NodeHandler, NodeResult};
use crate::error::NodeError;
use crate::workflow::types::NodeKind;
use crate::workflow::value::{NodeOutput, NodeValue};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// Globals removed from every script state
const BLOCKED_GLOBALS: [&str; 7] = ["os", "io", "debug", "package", "require", "dofile", "loadfile"];

/// Memory ceiling for one script state
const SCRIPT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

pub struct TransformNode {
    script_timeout_secs: u64,
}

impl Default for TransformNode {
    fn default() -> Self {
        Self { script_timeout_secs: 5 }
    }
}

impl TransformNode {
    pub fn with_script_timeout(script_timeout_secs: u64) -> Self {
        Self {
            script_timeout_secs: script_timeout_secs.max(1),
        }
    }

    async fn run_script(&self, ctx: &NodeContext<'_>, script: &str) -> Result<Value, NodeError> {
        let secs = ctx.config_u64("scriptTimeoutSecs").unwrap_or(self.script_timeout_secs).max(1);
        let script = script.to_string();
        let input = ctx.input().to_json();
        let inputs: Map<String, Value> = ctx.inputs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        let vars = ctx.run.inputs.clone();
        let deadline = Instant::now() + Duration::from_secs(secs);

        tracing::debug!("🧠 Executing Lua transform: {}", ctx.node.id);
        let task = tokio::task::spawn_blocking(move || eval_script(&script, &input, &inputs, &vars, deadline));
        // the in-state hook stops the script at the deadline; the outer bound is a backstop
        match tokio::time::timeout(Duration::from_secs(secs + 1), task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(ScriptFailure::TimedOut))) | Err(_) => Err(NodeError::Timeout { secs }),
            Ok(Ok(Err(ScriptFailure::Error(e)))) => Err(NodeError::failed(e.to_string())),
            Ok(Err(join)) => Err(NodeError::failed(format!("script task failed: {}", join))),
        }
    }
}

#[async_trait]
impl NodeHandler for TransformNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Transform
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let mode = ctx.config_str("mode").or_else(|| {
            ["script", "template", "jsonpath"]
                .into_iter()
                .find(|key| ctx.config.get(*key).is_some())
        });

        let value: NodeValue = match mode {
            Some("script") | Some("lua") => {
                let script = ctx.require_str("script")?;
                NodeValue::from(self.run_script(ctx, script).await?)
            }
            Some("template") => match ctx.config.get("template") {
                Some(Value::String(text)) => NodeValue::text(text.as_str()),
                // a whole-placeholder template keeps the referenced value's shape
                Some(other) => NodeValue::from(other.clone()),
                None => ctx.input(),
            },
            Some("jsonpath") => {
                let path = ctx.require_str("jsonpath")?;
                NodeValue::from(select_path(&ctx.input().to_json(), path)?)
            }
            Some(other) => {
                return Err(NodeError::config(format!("unknown transform mode '{}'", other)));
            }
            None => ctx.input(),
        };

        Ok(NodeResult::new(NodeOutput::single("output", value)))
    }
}

/// Apply a JSONPath expression; a single match is unwrapped
pub fn select_path(value: &Value, path: &str) -> Result<Value, NodeError> {
    // JSON encoded as text is parsed first so `$.field` works on string payloads
    let parsed;
    let target = match value {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(v) => {
                parsed = v;
                &parsed
            }
            Err(_) => value,
        },
        _ => value,
    };
    let matches = jsonpath_lib::select(target, path)
        .map_err(|e| NodeError::config(format!("invalid jsonpath '{}': {:?}", path, e)))?;
    Ok(match matches.as_slice() {
        [] => Value::Null,
        [single] => (*single).clone(),
        many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
    })
}

enum ScriptFailure {
    TimedOut,
    Error(anyhow::Error),
}

impl From<anyhow::Error> for ScriptFailure {
    fn from(err: anyhow::Error) -> Self {
        ScriptFailure::Error(err)
    }
}

/// Instructions between deadline checks
const HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;

/// Evaluate a script in a fresh sandboxed state
fn eval_script(
    script: &str,
    input: &Value,
    inputs: &Map<String, Value>,
    vars: &Map<String, Value>,
    deadline: Instant,
) -> Result<Value, ScriptFailure> {
    let lua = mlua::Lua::new();
    lua.set_memory_limit(SCRIPT_MEMORY_LIMIT)
        .map_err(|e| anyhow::anyhow!("Failed to limit Lua memory: {}", e))?;
    let globals = lua.globals();

    let timed_out = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&timed_out);
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_, _| {
            if Instant::now() >= deadline {
                flag.store(true, Ordering::SeqCst);
                Err(mlua::Error::runtime("script exceeded its time limit"))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    )
    .map_err(|e| anyhow::anyhow!("Failed to install deadline hook: {}", e))?;

    for name in BLOCKED_GLOBALS {
        globals
            .set(name, mlua::Nil)
            .map_err(|e| anyhow::anyhow!("Failed to remove Lua global {}: {}", name, e))?;
    }

    let set = |name: &str, value: &Value| -> Result<()> {
        let lua_value = json_to_lua(&lua, value).map_err(|e| anyhow::anyhow!("Failed to convert {}: {}", name, e))?;
        globals
            .set(name, lua_value)
            .map_err(|e| anyhow::anyhow!("Failed to set Lua global {}: {}", name, e))
    };
    set("input", input)?;
    set("inputs", &Value::Object(inputs.clone()))?;
    set("vars", &Value::Object(vars.clone()))?;

    let result: mlua::Value = match lua.load(script).set_name("transform").eval() {
        Ok(value) => value,
        Err(_) if timed_out.load(Ordering::SeqCst) => return Err(ScriptFailure::TimedOut),
        Err(e) => return Err(anyhow::anyhow!("Lua script execution failed: {}", e).into()),
    };
    Ok(lua_to_json(result)?)
}

fn json_to_lua(lua: &mlua::Lua, value: &Value) -> mlua::Result<mlua::Value> {
    Ok(match value {
        Value::Null => mlua::Value::Nil,
        Value::Bool(b) => mlua::Value::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => mlua::Value::Integer(i),
            None => mlua::Value::Number(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => mlua::Value::String(lua.create_string(s)?),
        Value::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.set(i + 1, json_to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            mlua::Value::Table(table)
        }
    })
}

/// Convert a Lua value to JSON; sequence tables become arrays
fn lua_to_json(lua_value: mlua::Value) -> Result<Value> {
    match lua_value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Number(serde_json::Number::from(i))),
        mlua::Value::Number(f) => Ok(serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)),
        mlua::Value::String(s) => {
            let s_str = s.to_str().map_err(|e| anyhow::anyhow!("Invalid UTF-8 in Lua string: {}", e))?;
            Ok(Value::String(s_str.to_string()))
        }
        mlua::Value::Table(table) => {
            let mut is_array = true;
            let mut max_index = 0;
            let mut count = 0;
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(|e| anyhow::anyhow!("Failed to iterate Lua table: {}", e))?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => is_array = false,
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut items = Vec::with_capacity(max_index);
                for i in 1..=max_index {
                    let item: mlua::Value = table
                        .get(i)
                        .map_err(|e| anyhow::anyhow!("Failed to get Lua table value: {}", e))?;
                    items.push(lua_to_json(item)?);
                }
                return Ok(Value::Array(items));
            }

            let mut obj = Map::new();
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, value) = pair.map_err(|e| anyhow::anyhow!("Failed to iterate Lua table: {}", e))?;
                let key = match key {
                    mlua::Value::String(s) => s
                        .to_str()
                        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in Lua key: {}", e))?
                        .to_string(),
                    mlua::Value::Integer(i) => i.to_string(),
                    mlua::Value::Number(f) => f.to_string(),
                    _ => continue,
                };
                obj.insert(key, lua_to_json(value)?);
            }
            Ok(Value::Object(obj))
        }
        _ => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::nodes::testing::{execute, run_context};
    use crate::workflow::types::Node;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn input(value: Value) -> BTreeMap<String, NodeValue> {
        BTreeMap::from([("input".to_string(), NodeValue::from(value))])
    }

    #[tokio::test]
    async fn lua_script_doubles_input() {
        let node = Node::new(
            "double",
            NodeKind::Transform,
            json!({"script": "return tostring(tonumber(input) * 2)"}),
        );
        let run = run_context(Map::new());
        let out = execute(&TransformNode::default(), &node, input(json!("2")), &run).await.unwrap();
        assert_eq!(out.output.resolve("output"), NodeValue::text("4"));
    }

    #[tokio::test]
    async fn lua_tables_round_trip_to_json() {
        let node = Node::new(
            "shape",
            NodeKind::Transform,
            json!({"script": "return { names = { input.a, vars.who }, total = #input.list }"}),
        );
        let mut vars = Map::new();
        vars.insert("who".into(), json!("ada"));
        let run = run_context(vars);
        let out = execute(
            &TransformNode::default(),
            &node,
            input(json!({"a": "x", "list": [1, 2, 3]})),
            &run,
        )
        .await
        .unwrap();
        assert_eq!(out.output.resolve("output").to_json(), json!({"names": ["x", "ada"], "total": 3}));
    }

    #[tokio::test]
    async fn sandbox_removes_os_and_io() {
        let node = Node::new("evil", NodeKind::Transform, json!({"script": "return os.time()"}));
        let run = run_context(Map::new());
        let err = execute(&TransformNode::default(), &node, BTreeMap::new(), &run).await.unwrap_err();
        assert!(err.to_string().contains("Lua script execution failed"));
    }

    #[tokio::test]
    async fn runaway_script_times_out() {
        let node = Node::new(
            "spin",
            NodeKind::Transform,
            json!({"script": "while true do end", "scriptTimeoutSecs": 1}),
        );
        let run = run_context(Map::new());
        let err = execute(&TransformNode::default(), &node, BTreeMap::new(), &run).await.unwrap_err();
        assert!(matches!(err, NodeError::Timeout { secs: 1 }));
    }

    #[test]
    fn hook_interrupts_the_blocking_thread() {
        let started = Instant::now();
        let result = eval_script(
            "while true do end",
            &Value::Null,
            &Map::new(),
            &Map::new(),
            started + Duration::from_millis(100),
        );
        assert!(matches!(result, Err(ScriptFailure::TimedOut)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn pcall_cannot_swallow_the_deadline() {
        let result = eval_script(
            "while true do pcall(function() while true do end end) end",
            &Value::Null,
            &Map::new(),
            &Map::new(),
            Instant::now() + Duration::from_millis(100),
        );
        assert!(matches!(result, Err(ScriptFailure::TimedOut)));
    }

    #[test]
    fn sandbox_globals_are_removed() {
        let far = Instant::now() + Duration::from_secs(5);
        let value = eval_script(
            "return debug == nil and os == nil and io == nil and require == nil",
            &Value::Null,
            &Map::new(),
            &Map::new(),
            far,
        );
        assert!(matches!(value, Ok(Value::Bool(true))));

        let doubled = eval_script("return input * 2", &json!(2), &Map::new(), &Map::new(), far);
        assert!(matches!(doubled, Ok(v) if v == json!(4)));
    }

    #[tokio::test]
    async fn jsonpath_selects_from_input() {
        let node = Node::new("pick", NodeKind::Transform, json!({"jsonpath": "$.items[*].name"}));
        let run = run_context(Map::new());
        let out = execute(
            &TransformNode::default(),
            &node,
            input(json!({"items": [{"name": "a"}, {"name": "b"}]})),
            &run,
        )
        .await
        .unwrap();
        assert_eq!(out.output.resolve("output").to_json(), json!(["a", "b"]));
    }

    #[tokio::test]
    async fn without_mode_input_passes_through() {
        let node = Node::new("noop", NodeKind::Transform, json!({}));
        let run = run_context(Map::new());
        let out = execute(&TransformNode::default(), &node, input(json!({"k": 1})), &run).await.unwrap();
        assert_eq!(out.output.resolve("output").to_json(), json!({"k": 1}));
    }
}
