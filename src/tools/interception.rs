use serde_json::{Map, Value, json};
use tokio::time::Duration;

use crate::dispatch::{ToolDef, handler};
use crate::error::ServerError;
use crate::intercept::{InterceptionRule, Modification, RuleAction, RuleStage};
use crate::orchestrator::SharedState;
use crate::schema::{ParamKind, ParamSpec, ToolSpec};

use super::{arg_bool, arg_str, arg_string_map, arg_string_vec, arg_u64};

pub fn tools() -> Vec<ToolDef> {
    vec![
        ToolDef {
            spec: enable_spec(
                "enable_request_interception",
                "Pause matching requests before they go upstream",
            ),
            handler: handler(enable_request_interception),
        },
        ToolDef {
            spec: enable_spec(
                "enable_response_interception",
                "Pause matching responses before the page sees them",
            ),
            handler: handler(enable_response_interception),
        },
        ToolDef {
            spec: disable_spec(
                "disable_request_interception",
                "Stop request interception, draining any paused requests",
            ),
            handler: handler(disable_interception),
        },
        ToolDef {
            spec: disable_spec(
                "disable_response_interception",
                "Stop response interception, draining any paused responses",
            ),
            handler: handler(disable_interception),
        },
        ToolDef {
            spec: ToolSpec {
                name: "intercept_and_modify_traffic",
                description: "Register a rule that rewrites, delays, fails, or blocks matching traffic",
                params: vec![
                    ParamSpec::required("urlPattern", ParamKind::String, "URL glob to match"),
                    ParamSpec::optional(
                        "stage",
                        ParamKind::Enum(&["request", "response"]),
                        "Pause stage",
                    )
                    .with_default(json!("request")),
                    ParamSpec::optional(
                        "action",
                        ParamKind::Enum(&["modify", "observe", "fail", "delay", "block"]),
                        "What to do with matches",
                    )
                    .with_default(json!("modify")),
                    ParamSpec::optional("method", ParamKind::String, "HTTP method filter"),
                    ParamSpec::optional(
                        "resourceType",
                        ParamKind::String,
                        "CDP resource type filter (Document, XHR, Fetch, ...)",
                    ),
                    ParamSpec::optional("addHeaders", ParamKind::Object, "Headers to add or override"),
                    ParamSpec::optional(
                        "removeHeaders",
                        ParamKind::StringArray,
                        "Header names to drop",
                    ),
                    ParamSpec::optional("setMethod", ParamKind::String, "Replace the request method"),
                    ParamSpec::optional("setBody", ParamKind::String, "Replace the body"),
                    ParamSpec::optional("setStatus", ParamKind::Integer, "Replace the response status")
                        .range(100.0, 599.0),
                    ParamSpec::optional("delayMs", ParamKind::Integer, "Latency for delay rules")
                        .range(0.0, 120_000.0),
                    ParamSpec::optional("targetId", ParamKind::String, "Target; default is the active tab"),
                ],
                timeout_ms: 15_000,
                advanced: true,
                requires_browser: true,
            },
            handler: handler(intercept_and_modify_traffic),
        },
        ToolDef {
            spec: list_spec(
                "list_intercepted_requests",
                "Snapshot requests currently paused at the request stage",
            ),
            handler: handler(list_intercepted_requests),
        },
        ToolDef {
            spec: list_spec(
                "list_intercepted_responses",
                "Snapshot responses currently paused at the response stage",
            ),
            handler: handler(list_intercepted_responses),
        },
        ToolDef {
            spec: ToolSpec {
                name: "resume_intercepted_request",
                description: "Resume, modify, or fail one paused request by id",
                params: vec![
                    ParamSpec::required("requestId", ParamKind::String, "The paused request id"),
                    ParamSpec::optional("addHeaders", ParamKind::Object, "Headers to add or override"),
                    ParamSpec::optional(
                        "removeHeaders",
                        ParamKind::StringArray,
                        "Header names to drop",
                    ),
                    ParamSpec::optional("setBody", ParamKind::String, "Replace the body"),
                    ParamSpec::optional("setStatus", ParamKind::Integer, "Replace the response status")
                        .range(100.0, 599.0),
                    ParamSpec::optional("fail", ParamKind::Boolean, "Fail instead of resuming")
                        .with_default(json!(false)),
                    ParamSpec::optional("targetId", ParamKind::String, "Target; default is the active tab"),
                ],
                timeout_ms: 15_000,
                advanced: true,
                requires_browser: true,
            },
            handler: handler(resume_intercepted_request),
        },
    ]
}

fn enable_spec(name: &'static str, description: &'static str) -> ToolSpec {
    ToolSpec {
        name,
        description,
        params: vec![
            ParamSpec::optional("patterns", ParamKind::StringArray, "URL globs to pause")
                .with_default(json!(["*"])),
            ParamSpec::optional(
                "autoContinue",
                ParamKind::Boolean,
                "Resume unmatched/observed traffic immediately instead of queueing it",
            )
            .with_default(json!(true)),
            ParamSpec::optional(
                "pauseTimeoutMs",
                ParamKind::Integer,
                "Deadline after which a paused request is resumed as-is",
            )
            .range(100.0, 300_000.0),
            ParamSpec::optional("targetId", ParamKind::String, "Target; default is the active tab"),
        ],
        timeout_ms: 15_000,
        advanced: true,
        requires_browser: true,
    }
}

fn disable_spec(name: &'static str, description: &'static str) -> ToolSpec {
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

fn list_spec(name: &'static str, description: &'static str) -> ToolSpec {
    ToolSpec {
        name,
        description,
        params: vec![ParamSpec::optional(
            "targetId",
            ParamKind::String,
            "Target; default is the active tab",
        )],
        timeout_ms: 10_000,
        advanced: true,
        requires_browser: true,
    }
}

/// Resolve the target and enable fetch interception at a stage.
async fn enable_at_stage(
    state: &SharedState,
    args: &Map<String, Value>,
    stage: RuleStage,
) -> Result<Value, ServerError> {
    let patterns = {
        let p = arg_string_vec(args, "patterns");
        if p.is_empty() { vec!["*".to_string()] } else { p }
    };
    let auto_continue = arg_bool(args, "autoContinue").unwrap_or(true);
    let timeout = arg_u64(args, "pauseTimeoutMs").map(Duration::from_millis);
    let target_arg = arg_str(args, "targetId").map(ToString::to_string);

    let mut server = state.lock().await;
    let configured_timeout = server.config.pause_timeout_ms.map(Duration::from_millis);
    let instance = server.instance_mut()?;
    let target = {
        let registry = instance.targets.lock().await;
        registry.resolve(target_arg.as_deref())?
    };
    instance
        .engine
        .enable(
            &mut instance.sessions,
            &target.id,
            stage,
            patterns.clone(),
            auto_continue,
            timeout.or(configured_timeout),
        )
        .await?;
    Ok(json!({
        "targetId": target.id,
        "stage": stage,
        "patterns": patterns,
        "autoContinue": auto_continue,
    }))
}

async fn enable_request_interception(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    enable_at_stage(&state, &args, RuleStage::Request).await
}

async fn enable_response_interception(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    enable_at_stage(&state, &args, RuleStage::Response).await
}

async fn disable_interception(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let target_arg = arg_str(&args, "targetId").map(ToString::to_string);
    let mut server = state.lock().await;
    let instance = server.instance_mut()?;
    let target = {
        let registry = instance.targets.lock().await;
        registry.resolve(target_arg.as_deref())?
    };
    instance
        .engine
        .disable(&mut instance.sessions, &target.id)
        .await?;
    Ok(json!({ "targetId": target.id, "disabled": true }))
}

async fn intercept_and_modify_traffic(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let pattern = arg_str(&args, "urlPattern")
        .ok_or_else(|| ServerError::invalid_arguments("missing required parameter \"urlPattern\""))?
        .to_string();
    let stage = match arg_str(&args, "stage") {
        Some("response") => RuleStage::Response,
        _ => RuleStage::Request,
    };
    let action = match arg_str(&args, "action") {
        Some("observe") => RuleAction::Observe,
        Some("fail") => RuleAction::Fail,
        Some("delay") => RuleAction::Delay,
        Some("block") => RuleAction::Block,
        _ => RuleAction::Modify,
    };
    let modification = Modification {
        add_headers: arg_string_map(&args, "addHeaders"),
        remove_headers: arg_string_vec(&args, "removeHeaders"),
        set_method: arg_str(&args, "setMethod").map(ToString::to_string),
        set_body: arg_str(&args, "setBody").map(ToString::to_string),
        set_status: arg_u64(&args, "setStatus").and_then(|s| u16::try_from(s).ok()),
        latency_ms: arg_u64(&args, "delayMs"),
    };
    // The rule keeps its own traffic flowing; the context policy set by an
    // explicit enable_*_interception call stays whatever the caller chose.
    let rule = InterceptionRule::new(&pattern, stage, action, modification)?
        .with_method(arg_str(&args, "method").map(ToString::to_string))
        .with_resource_type(arg_str(&args, "resourceType").map(ToString::to_string))
        .with_auto_continue(Some(true));

    let target_arg = arg_str(&args, "targetId").map(ToString::to_string);
    let mut server = state.lock().await;
    let instance = server.instance_mut()?;
    let target = {
        let registry = instance.targets.lock().await;
        registry.resolve(target_arg.as_deref())?
    };

    if instance.engine.fetch_stage(&target.id).await == Some(stage) {
        // Already enabled at this stage: just make sure the rule's pattern
        // pauses traffic.
        instance
            .engine
            .extend_patterns(&mut instance.sessions, &target.id, vec![pattern.clone()])
            .await?;
    } else {
        // Not enabled (or enabled at the other stage, which enable() will
        // report as a mode conflict); default policy is auto-continue.
        instance
            .engine
            .enable(
                &mut instance.sessions,
                &target.id,
                stage,
                vec![pattern.clone()],
                true,
                None,
            )
            .await?;
    }
    let rule_index = instance.engine.add_rule(&target.id, rule).await?;

    Ok(json!({
        "targetId": target.id,
        "ruleIndex": rule_index,
        "urlPattern": pattern,
        "stage": stage,
        "action": action,
    }))
}

async fn list_at_stage(
    state: &SharedState,
    args: &Map<String, Value>,
    stage: RuleStage,
) -> Result<Value, ServerError> {
    let target_arg = arg_str(args, "targetId").map(ToString::to_string);
    let mut server = state.lock().await;
    let instance = server.instance_mut()?;
    let target = {
        let registry = instance.targets.lock().await;
        registry.resolve(target_arg.as_deref())?
    };
    let snapshot = instance.engine.snapshot(&target.id, stage).await;
    Ok(json!({
        "targetId": target.id,
        "count": snapshot.pending.len(),
        "pending": snapshot.pending,
        "observed": snapshot.observed,
        "warnings": snapshot.warnings,
    }))
}

async fn list_intercepted_requests(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    list_at_stage(&state, &args, RuleStage::Request).await
}

async fn list_intercepted_responses(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    list_at_stage(&state, &args, RuleStage::Response).await
}

async fn resume_intercepted_request(
    state: SharedState,
    args: Map<String, Value>,
) -> Result<Value, ServerError> {
    let request_id = arg_str(&args, "requestId")
        .ok_or_else(|| ServerError::invalid_arguments("missing required parameter \"requestId\""))?
        .to_string();
    let fail = arg_bool(&args, "fail").unwrap_or(false);

    let add_headers = arg_string_map(&args, "addHeaders");
    let remove_headers = arg_string_vec(&args, "removeHeaders");
    let set_body = arg_str(&args, "setBody").map(ToString::to_string);
    let set_status = arg_u64(&args, "setStatus").and_then(|s| u16::try_from(s).ok());
    let has_modification = !add_headers.is_empty()
        || !remove_headers.is_empty()
        || set_body.is_some()
        || set_status.is_some();
    let modification = has_modification.then(|| Modification {
        add_headers,
        remove_headers,
        set_method: None,
        set_body,
        set_status,
        latency_ms: None,
    });

    let target_arg = arg_str(&args, "targetId").map(ToString::to_string);
    let mut server = state.lock().await;
    let instance = server.instance_mut()?;
    let target = {
        let registry = instance.targets.lock().await;
        registry.resolve(target_arg.as_deref())?
    };
    instance
        .engine
        .resume_request(&target.id, &request_id, modification, fail)
        .await?;
    Ok(json!({ "requestId": request_id, "resolved": true }))
}
