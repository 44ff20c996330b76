use std::path::PathBuf;

use serde_json::{Map, Value, json};
use tokio::time::Duration;

use crate::chrome::ProfileRequest;
use crate::dispatch::{ToolDef, handler};
use crate::error::{ErrorKind, ServerError};
use crate::orchestrator::{self, SharedState};
use crate::schema::{ParamKind, ParamSpec, ToolSpec};
use crate::sessions::ManagedSession;

use super::{arg_bool, arg_str, arg_u64, page_session};

/// How long `navigate` waits for the load event before giving up on it.
const NAVIGATE_WAIT: Duration = Duration::from_secs(10);

/// Poll interval for `wait_for_selector`.
const SELECTOR_POLL: Duration = Duration::from_millis(100);

/// Default selector wait budget.
const SELECTOR_WAIT_MS: u64 = 5_000;

pub fn tools() -> Vec<ToolDef> {
    vec![
        ToolDef {
            spec: ToolSpec {
                name: "status",
                description: "Report the connection state of the managed browser",
                params: vec![],
                timeout_ms: 10_000,
                advanced: false,
                requires_browser: false,
            },
            handler: handler(status),
        },
        ToolDef {
            spec: ToolSpec {
                name: "launch_with_profile",
                description: "Launch (or attach to) a Chromium with a shadow copy of a user profile",
                params: vec![
                    ParamSpec::optional(
                        "profile",
                        ParamKind::String,
                        "Profile directory name, e.g. \"Default\"",
                    ),
                    ParamSpec::optional(
                        "userDataDir",
                        ParamKind::String,
                        "Custom user data directory, used verbatim instead of a shadow copy",
                    ),
                    ParamSpec::optional(
                        "chromiumPath",
                        ParamKind::String,
                        "Explicit Chromium executable path",
                    ),
                    ParamSpec::optional(
                        "force",
                        ParamKind::Boolean,
                        "Disconnect an existing instance first",
                    )
                    .with_default(json!(false)),
                ],
                timeout_ms: 60_000,
                advanced: false,
                requires_browser: false,
            },
            handler: handler(launch_with_profile),
        },
        ToolDef {
            spec: ToolSpec {
                name: "close_browser",
                description: "Close the managed browser and release every session",
                params: vec![],
                timeout_ms: 15_000,
                advanced: false,
                requires_browser: false,
            },
            handler: handler(close_browser),
        },
        ToolDef {
            spec: ToolSpec {
                name: "set_advanced_tools",
                description: "Show or hide the advanced tool catalog",
                params: vec![ParamSpec::required(
                    "enabled",
                    ParamKind::Boolean,
                    "Whether advanced tools are listed",
                )],
                timeout_ms: 5_000,
                advanced: false,
                requires_browser: false,
            },
            handler: handler(set_advanced_tools),
        },
        ToolDef {
            spec: ToolSpec {
                name: "apply_stealth",
                description: "Install the automation-fingerprint masking script on page targets",
                params: vec![
                    ParamSpec::optional(
                        "force",
                        ParamKind::Boolean,
                        "Re-install even on targets that already have it",
                    )
                    .with_default(json!(false)),
                ],
                timeout_ms: 15_000,
                advanced: false,
                requires_browser: true,
            },
            handler: handler(apply_stealth),
        },
        ToolDef {
            spec: ToolSpec {
                name: "browser_action",
                description: "Drive the page: navigate, history, click, type, wait for a selector",
                params: vec![
                    ParamSpec::required(
                        "action",
                        ParamKind::Enum(&[
                            "navigate",
                            "back",
                            "forward",
                            "reload",
                            "click",
                            "type",
                            "wait_for_selector",
                        ]),
                        "The action to perform",
                    ),
                    ParamSpec::optional("url", ParamKind::String, "URL for navigate"),
                    ParamSpec::optional("selector", ParamKind::String, "CSS selector"),
                    ParamSpec::optional("text", ParamKind::String, "Text for type"),
                    ParamSpec::optional("targetId", ParamKind::String, "Target id; default is the active tab"),
                ],
                timeout_ms: 30_000,
                advanced: false,
                requires_browser: true,
            },
            handler: handler(browser_action),
        },
        ToolDef {
            spec: ToolSpec {
                name: "evaluate_js",
                description: "Evaluate a JavaScript expression on the page",
                params: vec![
                    ParamSpec::required("expression", ParamKind::String, "Expression to evaluate"),
                    ParamSpec::optional(
                        "awaitPromise",
                        ParamKind::Boolean,
                        "Await a returned promise",
                    )
                    .with_default(json!(true)),
                    ParamSpec::optional("targetId", ParamKind::String, "Target id; default is the active tab"),
                ],
                timeout_ms: 30_000,
                advanced: true,
                requires_browser: true,
            },
            handler: handler(evaluate_js),
        },
        ToolDef {
            spec: ToolSpec {
                name: "inject_script",
                description: "Inject a script into the page, optionally at document start of every new document",
                params: vec![
                    ParamSpec::required("script", ParamKind::String, "JavaScript source"),
                    ParamSpec::optional(
                        "onNewDocument",
                        ParamKind::Boolean,
                        "Register for every new document instead of evaluating once",
                    )
                    .with_default(json!(false)),
                    ParamSpec::optional("targetId", ParamKind::String, "Target id; default is the active tab"),
                ],
                timeout_ms: 15_000,
                advanced: true,
                requires_browser: true,
            },
            handler: handler(inject_script),
        },
    ]
}

async fn status(state: SharedState, _args: Map<String, Value>) -> Result<Value, ServerError> {
    let server = state.lock().await;
    match &server.instance {
        Some(instance) => {
            let (pages, targets) = {
                let registry = instance.targets.lock().await;
                (registry.pages().len(), registry.all().len())
            };
            Ok(json!({
                "connected": true,
                "debuggingPort": instance.port,
                "wsUrl": instance.ws_url,
                "pid": instance.process.as_ref().map(crate::chrome::ManagedProcess::pid),
                "shadowProfile": instance.shadow.as_ref().map(|s| s.data_dir.display().to_string()),
                "pageCount": pages,
                "targetCount": targets,
                "advancedToolsEnabled": server.advanced_tools,
            }))
        }
        None => Ok(json!({
            "connected": false,
            "debuggingPort": server.config.port,
            "advancedToolsEnabled": server.advanced_tools,
            "hint": "call launch_with_profile to start a browser",
        })),
    }
}

async fn launch_with_profile(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    // Config-file defaults back the call arguments.
    let (default_profile, default_path) = {
        let server = state.lock().await;
        (
            server.config.profile.clone(),
            server.config.chromium_path.clone(),
        )
    };
    let request = ProfileRequest {
        profile: arg_str(&args, "profile")
            .map(ToString::to_string)
            .or(default_profile),
        user_data_dir: arg_str(&args, "userDataDir").map(PathBuf::from),
        chromium_path: arg_str(&args, "chromiumPath")
            .map(PathBuf::from)
            .or(default_path),
    };
    let force = arg_bool(&args, "force").unwrap_or(false);
    let info = orchestrator::launch_with_profile(&state, request, force).await?;
    let mut result = serde_json::to_value(&info)
        .map_err(|e| ServerError::handler_raised(format!("serialization error: {e}")))?;
    result["success"] = json!(true);
    Ok(result)
}

async fn close_browser(state: SharedState, _args: Map<String, Value>) -> Result<Value, ServerError> {
    let killed = orchestrator::close_browser(&state).await?;
    Ok(json!({ "closed": true, "killedPid": killed }))
}

async fn set_advanced_tools(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let enabled = arg_bool(&args, "enabled").unwrap_or(false);
    let mut server = state.lock().await;
    server.advanced_tools = enabled;
    Ok(json!({ "advancedToolsEnabled": enabled }))
}

async fn apply_stealth(state: SharedState, args: Map<String, Value>) -> Result<Value, ServerError> {
    let force = arg_bool(&args, "force").unwrap_or(false);
    let mut server = state.lock().await;
    let instance = server.instance_mut()?;
    let patched = orchestrator::apply_stealth(instance, force).await?;
    Ok(json!({ "patchedTargets": patched }))
}

async fn browser_action(state: SharedState, args: Map<String, Value>) -> Result<Value, ServerError> {
    let action = arg_str(&args, "action").unwrap_or_default().to_string();
    let target_id = arg_str(&args, "targetId").map(ToString::to_string);
    let mut server = state.lock().await;
    let (tid, session) = page_session(&mut server, target_id.as_deref()).await?;
    let mut managed = ManagedSession::new(session);

    match action.as_str() {
        "navigate" => {
            let url = require_str(&args, "url")?;
            navigate(&mut managed, url).await
        }
        "back" => history_step(&mut managed, -1).await,
        "forward" => history_step(&mut managed, 1).await,
        "reload" => {
            managed.ensure_domain("Page").await?;
            managed.send_command("Page.reload", None).await?;
            Ok(json!({ "reloaded": true, "targetId": tid }))
        }
        "click" => {
            let selector = require_str(&args, "selector")?;
            let wait = arg_u64(&args, "timeoutMs").unwrap_or(SELECTOR_WAIT_MS);
            wait_for_selector(&managed, selector, wait).await?;
            let escaped = serde_json::to_string(selector)
                .map_err(|e| ServerError::handler_raised(e.to_string()))?;
            let result = evaluate(
                &managed,
                &format!("document.querySelector({escaped}).click(); true"),
                false,
            )
            .await?;
            Ok(json!({ "clicked": true, "targetId": tid, "result": result }))
        }
        "type" => {
            let selector = require_str(&args, "selector")?;
            let text = require_str(&args, "text")?;
            let wait = arg_u64(&args, "timeoutMs").unwrap_or(SELECTOR_WAIT_MS);
            wait_for_selector(&managed, selector, wait).await?;
            let sel = serde_json::to_string(selector)
                .map_err(|e| ServerError::handler_raised(e.to_string()))?;
            let value = serde_json::to_string(text)
                .map_err(|e| ServerError::handler_raised(e.to_string()))?;
            let script = format!(
                "(() => {{ const el = document.querySelector({sel}); el.focus(); \
                 el.value = {value}; \
                 el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
                 el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
                 return true; }})()"
            );
            evaluate(&managed, &script, false).await?;
            Ok(json!({ "typed": true, "targetId": tid }))
        }
        "wait_for_selector" => {
            let selector = require_str(&args, "selector")?;
            let wait = arg_u64(&args, "timeoutMs").unwrap_or(SELECTOR_WAIT_MS);
            wait_for_selector(&managed, selector, wait).await?;
            Ok(json!({ "found": true, "selector": selector, "targetId": tid }))
        }
        other => Err(ServerError::invalid_arguments(format!(
            "unknown action {other:?}"
        ))),
    }
}

async fn evaluate_js(state: SharedState, args: Map<String, Value>) -> Result<Value, ServerError> {
    let expression = require_str(&args, "expression")?.to_string();
    let await_promise = arg_bool(&args, "awaitPromise").unwrap_or(true);
    let target_id = arg_str(&args, "targetId").map(ToString::to_string);
    let mut server = state.lock().await;
    let (_, session) = page_session(&mut server, target_id.as_deref()).await?;
    let managed = ManagedSession::new(session);
    let result = evaluate(&managed, &expression, await_promise).await?;
    Ok(json!({ "result": result }))
}

async fn inject_script(state: SharedState, args: Map<String, Value>) -> Result<Value, ServerError> {
    let script = require_str(&args, "script")?.to_string();
    let on_new_document = arg_bool(&args, "onNewDocument").unwrap_or(false);
    let target_id = arg_str(&args, "targetId").map(ToString::to_string);
    let mut server = state.lock().await;
    let (tid, session) = page_session(&mut server, target_id.as_deref()).await?;
    let mut managed = ManagedSession::new(session);

    if on_new_document {
        managed.ensure_domain("Page").await?;
        let result = managed
            .send_command(
                "Page.addScriptToEvaluateOnNewDocument",
                Some(json!({ "source": script })),
            )
            .await?;
        Ok(json!({
            "registered": true,
            "identifier": result["identifier"],
            "targetId": tid,
        }))
    } else {
        let result = evaluate(&managed, &script, false).await?;
        Ok(json!({ "evaluated": true, "result": result, "targetId": tid }))
    }
}

// =============================================================================
// Page recipes
// =============================================================================

async fn navigate(managed: &mut ManagedSession, url: &str) -> Result<Value, ServerError> {
    managed.ensure_domain("Page").await?;

    // Subscribe before navigating so the load event cannot be missed.
    let mut load_rx = managed.subscribe("Page.loadEventFired").await?;

    let result = managed
        .send_command("Page.navigate", Some(json!({ "url": url })))
        .await?;
    if let Some(error_text) = result["errorText"].as_str() {
        if !error_text.is_empty() {
            return Err(ServerError::handler_raised(format!(
                "navigation failed: {error_text}"
            )));
        }
    }

    // Loading may legitimately outlast our patience (slow pages); the
    // navigation itself has already been accepted at this point.
    let loaded = tokio::time::timeout(NAVIGATE_WAIT, load_rx.recv())
        .await
        .is_ok();

    Ok(json!({
        "url": url,
        "frameId": result["frameId"],
        "loadEventFired": loaded,
    }))
}

async fn history_step(managed: &mut ManagedSession, delta: i64) -> Result<Value, ServerError> {
    managed.ensure_domain("Page").await?;
    let history = managed
        .send_command("Page.getNavigationHistory", None)
        .await?;
    let current = history["currentIndex"].as_i64().unwrap_or(0);
    let entries = history["entries"].as_array().cloned().unwrap_or_default();
    let target_index = current + delta;
    let Some(entry) = usize::try_from(target_index)
        .ok()
        .and_then(|i| entries.get(i))
    else {
        return Ok(json!({ "moved": false, "reason": "no history entry in that direction" }));
    };
    managed
        .send_command(
            "Page.navigateToHistoryEntry",
            Some(json!({ "entryId": entry["id"] })),
        )
        .await?;
    Ok(json!({ "moved": true, "url": entry["url"] }))
}

/// Evaluate an expression, surfacing page-side exceptions as errors.
async fn evaluate(
    managed: &ManagedSession,
    expression: &str,
    await_promise: bool,
) -> Result<Value, ServerError> {
    let result = managed
        .send_command(
            "Runtime.evaluate",
            Some(json!({
                "expression": expression,
                "returnByValue": true,
                "awaitPromise": await_promise,
            })),
        )
        .await?;
    if let Some(details) = result.get("exceptionDetails") {
        let text = details["exception"]["description"]
            .as_str()
            .or_else(|| details["text"].as_str())
            .unwrap_or("evaluation failed");
        return Err(ServerError::handler_raised(text.to_string()));
    }
    Ok(result["result"]["value"].clone())
}

/// Poll for a selector until it appears or the budget runs out.
async fn wait_for_selector(
    managed: &ManagedSession,
    selector: &str,
    budget_ms: u64,
) -> Result<(), ServerError> {
    let escaped = serde_json::to_string(selector)
        .map_err(|e| ServerError::handler_raised(e.to_string()))?;
    let probe = format!("document.querySelector({escaped}) !== null");
    let deadline = tokio::time::Instant::now() + Duration::from_millis(budget_ms);

    loop {
        if let Ok(found) = evaluate(managed, &probe, false).await {
            if found == json!(true) {
                return Ok(());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ServerError::new(
                ErrorKind::SelectorNotFound,
                format!("selector {selector:?} did not match within {budget_ms}ms"),
            ));
        }
        tokio::time::sleep(SELECTOR_POLL).await;
    }
}

fn require_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ServerError> {
    arg_str(args, key).ok_or_else(|| {
        ServerError::invalid_arguments(format!("missing required parameter {key:?}"))
    })
}
