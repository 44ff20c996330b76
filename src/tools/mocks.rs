use serde_json::{Map, Value, json};

use crate::dispatch::{ToolDef, handler};
use crate::error::ServerError;
use crate::intercept::MockSpec;
use crate::orchestrator::SharedState;
use crate::schema::{ParamKind, ParamSpec, ToolSpec};

use super::{arg_str, arg_string_map, arg_u64};

pub fn tools() -> Vec<ToolDef> {
    vec![
        ToolDef {
            spec: ToolSpec {
                name: "create_mock_endpoint",
                description: "Serve matching requests locally without forwarding them upstream",
                params: vec![
                    ParamSpec::required("urlPattern", ParamKind::String, "URL glob to mock"),
                    ParamSpec::optional("method", ParamKind::String, "HTTP method filter"),
                    ParamSpec::optional("statusCode", ParamKind::Integer, "Status to serve")
                        .with_default(json!(200))
                        .range(100.0, 599.0),
                    ParamSpec::optional("responseBody", ParamKind::String, "Body to serve")
                        .with_default(json!("")),
                    ParamSpec::optional("headers", ParamKind::Object, "Headers to serve"),
                    ParamSpec::optional("latencyMs", ParamKind::Integer, "Artificial latency")
                        .with_default(json!(0))
                        .range(0.0, 120_000.0),
                    ParamSpec::optional("targetId", ParamKind::String, "Target; default is the active tab"),
                ],
                timeout_ms: 15_000,
                advanced: true,
                requires_browser: true,
            },
            handler: handler(create_mock_endpoint),
        },
        ToolDef {
            spec: ToolSpec {
                name: "list_mock_endpoints",
                description: "List every mock endpoint with its call count",
                params: vec![],
                timeout_ms: 10_000,
                advanced: true,
                requires_browser: true,
            },
            handler: handler(list_mock_endpoints),
        },
        ToolDef {
            spec: ToolSpec {
                name: "delete_mock_endpoint",
                description: "Delete one mock endpoint by id",
                params: vec![ParamSpec::required(
                    "mockId",
                    ParamKind::Integer,
                    "Id returned by create_mock_endpoint",
                )],
                timeout_ms: 10_000,
                advanced: true,
                requires_browser: true,
            },
            handler: handler(delete_mock_endpoint),
        },
        ToolDef {
            spec: ToolSpec {
                name: "clear_all_mocks",
                description: "Delete every mock endpoint on every target",
                params: vec![],
                timeout_ms: 10_000,
                advanced: true,
                requires_browser: true,
            },
            handler: handler(clear_all_mocks),
        },
    ]
}

async fn create_mock_endpoint(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let pattern = arg_str(&args, "urlPattern")
        .ok_or_else(|| ServerError::invalid_arguments("missing required parameter \"urlPattern\""))?
        .to_string();
    let method = arg_str(&args, "method").map(ToString::to_string);
    let status = arg_u64(&args, "statusCode")
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(200);
    let body = arg_str(&args, "responseBody").unwrap_or_default().to_string();
    let headers = arg_string_map(&args, "headers");
    let latency = arg_u64(&args, "latencyMs").unwrap_or(0);
    let target_arg = arg_str(&args, "targetId").map(ToString::to_string);

    let mut server = state.lock().await;
    let instance = server.instance_mut()?;
    let target = {
        let registry = instance.targets.lock().await;
        registry.resolve(target_arg.as_deref())?
    };
    let spec = MockSpec {
        pattern: pattern.clone(),
        method,
        status,
        headers,
        body,
        latency_ms: latency,
    };
    let mock_id = instance
        .engine
        .create_mock(&mut instance.sessions, &target.id, spec)
        .await?;
    Ok(json!({
        "mockId": mock_id,
        "targetId": target.id,
        "urlPattern": pattern,
        "statusCode": status,
    }))
}

async fn list_mock_endpoints(
    state: SharedState,
    _args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let mut server = state.lock().await;
    let instance = server.instance_mut()?;
    let mocks = instance.engine.list_mocks().await;
    Ok(json!({ "mocks": mocks, "count": mocks.len() }))
}

async fn delete_mock_endpoint(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let mock_id = arg_u64(&args, "mockId")
        .ok_or_else(|| ServerError::invalid_arguments("missing required parameter \"mockId\""))?;
    let mut server = state.lock().await;
    let instance = server.instance_mut()?;
    instance.engine.delete_mock(mock_id).await?;
    Ok(json!({ "deleted": true, "mockId": mock_id }))
}

async fn clear_all_mocks(
    state: SharedState,
    _args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let mut server = state.lock().await;
    let instance = server.instance_mut()?;
    let cleared = instance.engine.clear_mocks().await;
    Ok(json!({ "cleared": cleared }))
}
