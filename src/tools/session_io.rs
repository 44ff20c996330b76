use serde_json::{Map, Value, json};

use crate::dispatch::{ToolDef, handler};
use crate::error::ServerError;
use crate::orchestrator::SharedState;
use crate::schema::{ParamKind, ParamSpec, ToolSpec};
use crate::sessions::ManagedSession;

use super::page_session;

pub fn tools() -> Vec<ToolDef> {
    vec![
        ToolDef {
            spec: ToolSpec {
                name: "export_session",
                description: "Export cookies and the active page's web storage",
                params: vec![ParamSpec::optional(
                    "targetId",
                    ParamKind::String,
                    "Page whose storage to export; default is the active tab",
                )],
                timeout_ms: 20_000,
                advanced: false,
                requires_browser: true,
            },
            handler: handler(export_session),
        },
        ToolDef {
            spec: ToolSpec {
                name: "import_session",
                description: "Import cookies and web storage exported by export_session",
                params: vec![
                    ParamSpec::required(
                        "cookies",
                        ParamKind::Object,
                        "The {cookies: [...]} object from export_session, or a bare cookie list wrapper",
                    ),
                    ParamSpec::optional(
                        "origins",
                        ParamKind::Object,
                        "The {origins: [...]} storage object from export_session",
                    ),
                    ParamSpec::optional("targetId", ParamKind::String, "Page to restore storage into"),
                ],
                timeout_ms: 20_000,
                advanced: false,
                requires_browser: true,
            },
            handler: handler(import_session),
        },
    ]
}

/// Serialize the page's local and session storage as JSON entries.
const STORAGE_SNAPSHOT_JS: &str = r"(() => ({
  origin: window.location.origin,
  localStorage: Object.entries(localStorage),
  sessionStorage: Object.entries(sessionStorage),
}))()";

async fn export_session(state: SharedState, args: Map<String, Value>) -> Result<Value, ServerError> {
    let target_arg = args
        .get("targetId")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let mut server = state.lock().await;

    // Cookies come from the browser target and cover every domain; they are
    // transported verbatim, encrypted values and all.
    let cookies = {
        let instance = server.instance_mut()?;
        instance
            .client
            .send_command("Storage.getCookies", None)
            .await?["cookies"]
            .clone()
    };

    let (_, session) = page_session(&mut server, target_arg.as_deref()).await?;
    let managed = ManagedSession::new(session);
    let storage = managed
        .send_command(
            "Runtime.evaluate",
            Some(json!({
                "expression": STORAGE_SNAPSHOT_JS,
                "returnByValue": true,
            })),
        )
        .await?["result"]["value"]
        .clone();

    Ok(json!({
        "cookies": cookies,
        "origins": [storage],
    }))
}

async fn import_session(state: SharedState, args: Map<String, Value>) -> Result<Value, ServerError> {
    let cookies = args
        .get("cookies")
        .and_then(|c| c.get("cookies").or(Some(c)))
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| {
            ServerError::invalid_arguments("\"cookies\" must contain a cookie array")
        })?;
    let target_arg = args
        .get("targetId")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let mut server = state.lock().await;
    let cookie_count = cookies.len();
    {
        let instance = server.instance_mut()?;
        instance
            .client
            .send_command(
                "Storage.setCookies",
                Some(json!({ "cookies": sanitize_cookies(cookies) })),
            )
            .await?;
    }

    // Storage restore is scoped to the page we can reach: entries for the
    // current origin apply, others are reported back untouched.
    let mut restored_origins = 0;
    let mut skipped_origins = Vec::new();
    if let Some(origins) = args.get("origins").and_then(|o| o["origins"].as_array()) {
        let (_, session) = page_session(&mut server, target_arg.as_deref()).await?;
        let managed = ManagedSession::new(session);
        let current_origin = managed
            .send_command(
                "Runtime.evaluate",
                Some(json!({
                    "expression": "window.location.origin",
                    "returnByValue": true,
                })),
            )
            .await?["result"]["value"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        for origin_entry in origins {
            let origin = origin_entry["origin"].as_str().unwrap_or_default();
            if origin != current_origin {
                skipped_origins.push(origin.to_string());
                continue;
            }
            let payload = serde_json::to_string(origin_entry)
                .map_err(|e| ServerError::handler_raised(e.to_string()))?;
            let script = format!(
                "(() => {{ const data = {payload}; \
                 for (const [k, v] of data.localStorage || []) localStorage.setItem(k, v); \
                 for (const [k, v] of data.sessionStorage || []) sessionStorage.setItem(k, v); \
                 return true; }})()"
            );
            managed
                .send_command(
                    "Runtime.evaluate",
                    Some(json!({ "expression": script, "returnByValue": true })),
                )
                .await?;
            restored_origins += 1;
        }
    }

    Ok(json!({
        "cookiesImported": cookie_count,
        "originsRestored": restored_origins,
        "originsSkipped": skipped_origins,
    }))
}

/// Strip fields `Storage.setCookies` rejects (session flag, id-like extras)
/// while keeping the cookie values verbatim.
fn sanitize_cookies(cookies: Vec<Value>) -> Vec<Value> {
    cookies
        .into_iter()
        .map(|mut cookie| {
            if let Some(map) = cookie.as_object_mut() {
                map.remove("session");
                map.remove("size");
                map.remove("priority");
                map.remove("sameParty");
                map.remove("sourceScheme");
                map.remove("sourcePort");
                map.remove("partitionKeyOpaque");
            }
            cookie
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_the_value_verbatim() {
        let cookies = vec![json!({
            "name": "sid",
            "value": "opaque-encrypted-blob",
            "domain": ".example.com",
            "path": "/",
            "session": true,
            "size": 32,
            "priority": "Medium",
        })];
        let sanitized = sanitize_cookies(cookies);
        assert_eq!(sanitized[0]["value"], "opaque-encrypted-blob");
        assert_eq!(sanitized[0]["domain"], ".example.com");
        assert!(sanitized[0].get("session").is_none());
        assert!(sanitized[0].get("size").is_none());
    }

    #[test]
    fn storage_snapshot_reads_both_stores() {
        assert!(STORAGE_SNAPSHOT_JS.contains("localStorage"));
        assert!(STORAGE_SNAPSHOT_JS.contains("sessionStorage"));
        assert!(STORAGE_SNAPSHOT_JS.contains("origin"));
    }
}
