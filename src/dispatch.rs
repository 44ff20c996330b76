use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio::time::Duration;
use tracing::{debug, error};

use crate::error::ServerError;
use crate::orchestrator::{SharedState, ensure_connected};
use crate::schema::ToolSpec;

/// A registered tool handler. Handlers receive the shared state and the
/// validated argument map, and either return a structured value or raise.
pub type ToolHandler = Arc<
    dyn Fn(SharedState, Map<String, Value>) -> BoxFuture<'static, Result<Value, ServerError>>
        + Send
        + Sync,
>;

/// Spec plus handler: one catalog entry.
pub struct ToolDef {
    pub spec: ToolSpec,
    pub handler: ToolHandler,
}

/// Adapt a plain async fn into a [`ToolHandler`].
pub fn handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(SharedState, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ServerError>> + Send + 'static,
{
    Arc::new(move |state, args| Box::pin(f(state, args)))
}

/// The tool dispatcher: validates, routes, enforces deadlines, and turns
/// every outcome into a structured result. Nothing escapes it.
pub struct Dispatcher {
    tools: Vec<ToolDef>,
    by_name: HashMap<&'static str, usize>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(tools: Vec<ToolDef>) -> Self {
        let by_name = tools
            .iter()
            .enumerate()
            .map(|(i, def)| (def.spec.name, i))
            .collect();
        Self { tools, by_name }
    }

    /// The visible catalog, shaped for `tools/list`.
    #[must_use]
    pub fn list_tools(&self, advanced_enabled: bool) -> Vec<Value> {
        self.tools
            .iter()
            .filter(|def| advanced_enabled || !def.spec.advanced)
            .map(|def| {
                json!({
                    "name": def.spec.name,
                    "description": def.spec.description,
                    "inputSchema": def.spec.input_schema(),
                })
            })
            .collect()
    }

    /// Run one tool call to a structured conclusion.
    ///
    /// The success path yields the handler's value with `success: true`
    /// guaranteed present; every failure path yields
    /// `{ success: false, error, tool, hint? }`.
    pub async fn call(&self, state: &SharedState, name: &str, args: &Value) -> Value {
        let Some(&index) = self.by_name.get(name) else {
            return ServerError::invalid_arguments(format!("unknown tool {name:?}"))
                .to_tool_result(name);
        };
        let def = &self.tools[index];

        // Lifecycle work is automatic for every tool that talks to the
        // browser; the small allow-list (status, visibility, launch, close)
        // runs without it.
        if def.spec.requires_browser {
            if let Err(e) = ensure_connected(state).await {
                return e.to_tool_result(name);
            }
        }

        let validated = match def.spec.validate(args) {
            Ok(validated) => validated,
            Err(e) => return e.to_tool_result(name),
        };

        let timeout_ms = validated
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .unwrap_or(def.spec.timeout_ms);

        debug!(tool = name, timeout_ms, "dispatching");
        let fut = (def.handler)(Arc::clone(state), validated);
        let guarded = AssertUnwindSafe(fut).catch_unwind();

        match tokio::time::timeout(Duration::from_millis(timeout_ms), guarded).await {
            Err(_) => ServerError::handler_raised(format!(
                "tool {name:?} exceeded its {timeout_ms}ms deadline"
            ))
            .with_hint("pass timeoutMs to allow more time")
            .to_tool_result(name),
            Ok(Err(panic)) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".into());
                error!(tool = name, detail = %detail, "handler panicked");
                ServerError::handler_raised(format!("handler panicked: {detail}"))
                    .to_tool_result(name)
            }
            Ok(Ok(Err(e))) => e.to_tool_result(name),
            Ok(Ok(Ok(mut value))) => {
                if let Value::Object(map) = &mut value {
                    map.entry("success").or_insert(json!(true));
                }
                value
            }
        }
    }

    #[must_use]
    pub fn has_tool(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::orchestrator::ServerState;
    use crate::schema::{ParamKind, ParamSpec};
    use tokio::sync::Mutex;

    fn test_state() -> SharedState {
        Arc::new(Mutex::new(ServerState::new(Config::resolve(
            Some(9777),
            &crate::config::ConfigFile::default(),
        ))))
    }

    fn spec(name: &'static str, timeout_ms: u64) -> ToolSpec {
        ToolSpec {
            name,
            description: "test tool",
            params: vec![ParamSpec::optional("echo", ParamKind::String, "echoed")],
            timeout_ms,
            advanced: false,
            requires_browser: false,
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(vec![
            ToolDef {
                spec: spec("echo", 30_000),
                handler: handler(|_state, args| async move {
                    Ok(json!({ "echoed": args.get("echo").cloned().unwrap_or(Value::Null) }))
                }),
            },
            ToolDef {
                spec: spec("sleepy", 50),
                handler: handler(|_state, _args| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!({}))
                }),
            },
            ToolDef {
                spec: spec("raises", 30_000),
                handler: handler(|_state, _args| async move {
                    Err(ServerError::no_page_available())
                }),
            },
            ToolDef {
                spec: spec("panics", 30_000),
                handler: handler(|_state, _args| async move {
                    panic!("boom");
                    #[allow(unreachable_code)]
                    Ok(json!({}))
                }),
            },
            ToolDef {
                spec: ToolSpec {
                    advanced: true,
                    ..spec("advanced_only", 30_000)
                },
                handler: handler(|_state, _args| async move { Ok(json!({})) }),
            },
        ])
    }

    #[tokio::test]
    async fn success_gets_success_true_injected() {
        let result = dispatcher()
            .call(&test_state(), "echo", &json!({ "echo": "hi" }))
            .await;
        assert_eq!(result["success"], true);
        assert_eq!(result["echoed"], "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_structured() {
        let result = dispatcher().call(&test_state(), "nope", &json!({})).await;
        assert_eq!(result["success"], false);
        assert_eq!(result["error"], "invalid-arguments");
        assert_eq!(result["tool"], "nope");
    }

    #[tokio::test]
    async fn validation_failure_is_structured() {
        let result = dispatcher()
            .call(&test_state(), "echo", &json!({ "echo": 7 }))
            .await;
        assert_eq!(result["success"], false);
        assert_eq!(result["error"], "invalid-arguments");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_is_structured() {
        let result = dispatcher().call(&test_state(), "sleepy", &json!({})).await;
        assert_eq!(result["success"], false);
        assert_eq!(result["error"], "handler-raised");
        assert!(result["message"].as_str().unwrap().contains("deadline"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_override_extends_the_deadline() {
        let result = dispatcher()
            .call(&test_state(), "sleepy", &json!({ "timeoutMs": 60_000 }))
            .await;
        assert_eq!(result["success"], true);
    }

    #[tokio::test]
    async fn handler_error_keeps_its_kind() {
        let result = dispatcher().call(&test_state(), "raises", &json!({})).await;
        assert_eq!(result["error"], "no-page-available");
        assert_eq!(result["tool"], "raises");
    }

    #[tokio::test]
    async fn handler_panic_is_caught() {
        let result = dispatcher().call(&test_state(), "panics", &json!({})).await;
        assert_eq!(result["success"], false);
        assert_eq!(result["error"], "handler-raised");
        assert!(result["message"].as_str().unwrap().contains("boom"));
    }

    #[test]
    fn advanced_tools_are_hidden_until_enabled() {
        let d = dispatcher();
        let core: Vec<String> = d
            .list_tools(false)
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert!(!core.contains(&"advanced_only".to_string()));
        let full: Vec<String> = d
            .list_tools(true)
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert!(full.contains(&"advanced_only".to_string()));
    }
}
