use serde_json::{Map, Value, json};

use crate::dispatch::{ToolDef, handler};
use crate::error::ServerError;
use crate::intercept::har_document;
use crate::orchestrator::SharedState;
use crate::schema::{ParamKind, ParamSpec, ToolSpec};

use super::{arg_bool, arg_str, arg_u64};

pub fn tools() -> Vec<ToolDef> {
    vec![
        ToolDef {
            spec: target_only_spec("start_har_recording", "Start recording network traffic for HAR export"),
            handler: handler(start_har_recording),
        },
        ToolDef {
            spec: target_only_spec(
                "stop_har_recording",
                "Stop recording and drain the captured entries",
            ),
            handler: handler(stop_har_recording),
        },
        ToolDef {
            spec: ToolSpec {
                name: "export_har_file",
                description: "Write the captured traffic to a HAR 1.2 file",
                params: vec![
                    ParamSpec::required("path", ParamKind::String, "Destination file path"),
                    ParamSpec::optional("targetId", ParamKind::String, "Target; default is the active tab"),
                ],
                timeout_ms: 15_000,
                advanced: true,
                requires_browser: true,
            },
            handler: handler(export_har_file),
        },
        ToolDef {
            spec: ToolSpec {
                name: "capture_websocket",
                description: "Toggle WebSocket frame capture on a target",
                params: vec![
                    ParamSpec::required("enabled", ParamKind::Boolean, "Capture on or off"),
                    ParamSpec::optional("targetId", ParamKind::String, "Target; default is the active tab"),
                ],
                timeout_ms: 15_000,
                advanced: true,
                requires_browser: true,
            },
            handler: handler(capture_websocket),
        },
        ToolDef {
            spec: ToolSpec {
                name: "list_websocket_messages",
                description: "List captured WebSocket frames, most recent last",
                params: vec![
                    ParamSpec::optional("limit", ParamKind::Integer, "Maximum frames to return")
                        .with_default(json!(100))
                        .range(1.0, 1000.0),
                    ParamSpec::optional("targetId", ParamKind::String, "Target; default is the active tab"),
                ],
                timeout_ms: 10_000,
                advanced: true,
                requires_browser: true,
            },
            handler: handler(list_websocket_messages),
        },
    ]
}

fn target_only_spec(name: &'static str, description: &'static str) -> ToolSpec {
    ToolSpec {
        name,
        description,
        params: vec![ParamSpec::optional(
            "targetId",
            ParamKind::String,
            "Target; default is the active tab",
        )],
        timeout_ms: 15_000,
        advanced: true,
        requires_browser: true,
    }
}

/// Resolve the target id argument against the registry.
async fn resolve_target(
    server: &mut crate::orchestrator::ServerState,
    args: &Map<String, Value>,
) -> Result<String, ServerError> {
    let target_arg = arg_str(args, "targetId").map(ToString::to_string);
    let instance = server.instance_mut()?;
    let registry = instance.targets.lock().await;
    Ok(registry.resolve(target_arg.as_deref())?.id)
}

async fn start_har_recording(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let mut server = state.lock().await;
    let target_id = resolve_target(&mut server, &args).await?;
    let instance = server.instance_mut()?;
    instance
        .engine
        .start_har(&mut instance.sessions, &target_id)
        .await?;
    Ok(json!({ "recording": true, "targetId": target_id }))
}

async fn stop_har_recording(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let mut server = state.lock().await;
    let target_id = resolve_target(&mut server, &args).await?;
    let instance = server.instance_mut()?;
    let entries = instance
        .engine
        .stop_har(&mut instance.sessions, &target_id)
        .await?;
    Ok(json!({
        "recording": false,
        "targetId": target_id,
        "entryCount": entries.len(),
        "entries": entries,
    }))
}

async fn export_har_file(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let path = arg_str(&args, "path")
        .ok_or_else(|| ServerError::invalid_arguments("missing required parameter \"path\""))?
        .to_string();
    let mut server = state.lock().await;
    let target_id = resolve_target(&mut server, &args).await?;
    let instance = server.instance_mut()?;
    let entries = instance.engine.har_entries(&target_id).await;
    let document = har_document(&entries);
    let text = serde_json::to_string_pretty(&document)
        .map_err(|e| ServerError::handler_raised(format!("serialization error: {e}")))?;
    tokio::fs::write(&path, text)
        .await
        .map_err(|e| ServerError::handler_raised(format!("could not write {path}: {e}")))?;
    Ok(json!({
        "path": path,
        "entryCount": entries.len(),
    }))
}

async fn capture_websocket(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let enabled = arg_bool(&args, "enabled").unwrap_or(false);
    let mut server = state.lock().await;
    let target_id = resolve_target(&mut server, &args).await?;
    let instance = server.instance_mut()?;
    instance
        .engine
        .set_ws_capture(&mut instance.sessions, &target_id, enabled)
        .await?;
    Ok(json!({ "capturing": enabled, "targetId": target_id }))
}

async fn list_websocket_messages(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let limit = usize::try_from(arg_u64(&args, "limit").unwrap_or(100)).unwrap_or(100);
    let mut server = state.lock().await;
    let target_id = resolve_target(&mut server, &args).await?;
    let instance = server.instance_mut()?;
    let frames = instance.engine.ws_messages(&target_id, limit).await;
    Ok(json!({
        "targetId": target_id,
        "count": frames.len(),
        "messages": frames,
    }))
}
