use serde_json::{Map, Value, json};

use crate::chrome;
use crate::dispatch::{ToolDef, handler};
use crate::error::ServerError;
use crate::orchestrator::SharedState;
use crate::schema::{ParamKind, ParamSpec, ToolSpec};
use crate::sessions::ManagedSession;
use crate::targets::TargetKind;

use super::{arg_str, page_session};

pub fn tools() -> Vec<ToolDef> {
    vec![ToolDef {
        spec: ToolSpec {
            name: "manage_tabs",
            description: "List, open, close, and activate tabs, or read the active tab's URL",
            params: vec![
                ParamSpec::required(
                    "action",
                    ParamKind::Enum(&["list", "new", "close", "activate", "get_url"]),
                    "The tab operation",
                ),
                ParamSpec::optional("targetId", ParamKind::String, "Tab to operate on"),
                ParamSpec::optional("url", ParamKind::String, "URL for a new tab"),
            ],
            timeout_ms: 15_000,
            advanced: false,
            requires_browser: true,
        },
        handler: handler(manage_tabs),
    }]
}

async fn manage_tabs(state: SharedState, args: Map<String, Value>) -> Result<Value, ServerError> {
    let action = arg_str(&args, "action").unwrap_or_default().to_string();
    let target_id = arg_str(&args, "targetId").map(ToString::to_string);
    let mut server = state.lock().await;
    let port = server.config.port;

    match action.as_str() {
        "list" => {
            let instance = server.instance_mut()?;
            let registry = instance.targets.lock().await;
            let tabs: Vec<Value> = registry
                .pages()
                .iter()
                .map(|t| {
                    json!({
                        "targetId": t.id,
                        "url": t.url,
                        "title": t.title,
                    })
                })
                .collect();
            Ok(json!({ "tabs": tabs, "count": tabs.len() }))
        }
        "new" => {
            let url = arg_str(&args, "url").unwrap_or("about:blank");
            let opened = chrome::open_page("127.0.0.1", port, url)
                .await
                .map_err(ServerError::from)?;
            let instance = server.instance_mut()?;
            let mut registry = instance.targets.lock().await;
            registry.upsert(&opened.id, TargetKind::Page, &opened.url, &opened.title);
            registry.note_activated(&opened.id);
            Ok(json!({ "targetId": opened.id, "url": opened.url }))
        }
        "close" => {
            let instance = server.instance_mut()?;
            let target = {
                let registry = instance.targets.lock().await;
                registry.resolve(target_id.as_deref())?
            };
            chrome::close_target("127.0.0.1", port, &target.id)
                .await
                .map_err(ServerError::from)?;
            instance.sessions.forget_target(&target.id);
            instance.targets.lock().await.remove(&target.id);
            Ok(json!({ "closed": true, "targetId": target.id }))
        }
        "activate" => {
            let instance = server.instance_mut()?;
            let target = {
                let registry = instance.targets.lock().await;
                registry.resolve(target_id.as_deref())?
            };
            chrome::activate_target("127.0.0.1", port, &target.id)
                .await
                .map_err(ServerError::from)?;
            instance.targets.lock().await.note_activated(&target.id);
            Ok(json!({ "activated": true, "targetId": target.id }))
        }
        "get_url" => {
            let (tid, session) = page_session(&mut server, target_id.as_deref()).await?;
            let managed = ManagedSession::new(session);
            // Ask the page itself rather than trusting possibly stale
            // registry metadata.
            let result = managed
                .send_command(
                    "Runtime.evaluate",
                    Some(json!({
                        "expression": "window.location.href",
                        "returnByValue": true,
                    })),
                )
                .await?;
            Ok(json!({
                "targetId": tid,
                "url": result["result"]["value"],
            }))
        }
        other => Err(ServerError::invalid_arguments(format!(
            "unknown action {other:?}"
        ))),
    }
}
