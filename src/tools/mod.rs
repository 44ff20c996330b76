mod browser;
mod interception;
mod mocks;
mod recording;
mod session_io;
mod tabs;

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::dispatch::ToolDef;

/// The complete tool catalog: core first, advanced after. Adding a tool is
/// one spec entry plus one handler function in the matching module.
#[must_use]
pub fn catalog() -> Vec<ToolDef> {
    let mut tools = Vec::new();
    tools.extend(browser::tools());
    tools.extend(tabs::tools());
    tools.extend(session_io::tools());
    tools.extend(interception::tools());
    tools.extend(mocks::tools());
    tools.extend(recording::tools());
    tools
}

// =============================================================================
// Shared handler helpers
// =============================================================================

/// Resolve the page target (explicit id or active tab) and obtain an
/// ephemeral session for it.
pub(crate) async fn page_session(
    server: &mut crate::orchestrator::ServerState,
    target_id: Option<&str>,
) -> Result<(String, crate::cdp::CdpSession), crate::error::ServerError> {
    let instance = server.instance_mut()?;
    let target = {
        let registry = instance.targets.lock().await;
        registry.resolve(target_id)?
    };
    let session = instance.sessions.ephemeral(&target.id).await?;
    Ok((target.id, session))
}

// =============================================================================
// Argument access helpers shared by the handlers
// =============================================================================

pub(crate) fn arg_str<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

pub(crate) fn arg_bool(args: &Map<String, Value>, key: &str) -> Option<bool> {
    args.get(key).and_then(Value::as_bool)
}

pub(crate) fn arg_u64(args: &Map<String, Value>, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_u64)
}

pub(crate) fn arg_string_vec(args: &Map<String, Value>, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Read an object argument as a string-to-string map; non-string values are
/// stringified.
pub(crate) fn arg_string_map(args: &Map<String, Value>, key: &str) -> BTreeMap<String, String> {
    args.get(key)
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let value = v
                        .as_str()
                        .map_or_else(|| v.to_string(), ToString::to_string);
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn catalog_names_are_unique() {
        let tools = catalog();
        let mut names: Vec<&str> = tools.iter().map(|t| t.spec.name).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total, "duplicate tool names in catalog");
    }

    #[test]
    fn core_catalog_contains_the_contract_tools() {
        let tools = catalog();
        for name in [
            "status",
            "launch_with_profile",
            "close_browser",
            "browser_action",
            "manage_tabs",
            "apply_stealth",
            "set_advanced_tools",
            "export_session",
            "import_session",
        ] {
            let def = tools
                .iter()
                .find(|t| t.spec.name == name)
                .unwrap_or_else(|| panic!("missing tool {name}"));
            assert!(!def.spec.advanced, "{name} should be core");
        }
    }

    #[test]
    fn interception_tools_are_advanced() {
        let tools = catalog();
        for name in [
            "enable_request_interception",
            "enable_response_interception",
            "create_mock_endpoint",
            "start_har_recording",
            "capture_websocket",
        ] {
            let def = tools
                .iter()
                .find(|t| t.spec.name == name)
                .unwrap_or_else(|| panic!("missing tool {name}"));
            assert!(def.spec.advanced, "{name} should be advanced");
        }
    }

    #[test]
    fn allow_list_skips_ensure_connected() {
        let tools = catalog();
        for name in ["status", "launch_with_profile", "close_browser", "set_advanced_tools"] {
            let def = tools.iter().find(|t| t.spec.name == name).unwrap();
            assert!(!def.spec.requires_browser, "{name} must not require a browser");
        }
        let def = tools.iter().find(|t| t.spec.name == "browser_action").unwrap();
        assert!(def.spec.requires_browser);
    }

    #[test]
    fn string_map_stringifies_non_string_values() {
        let map = arg_string_map(
            &args(json!({ "headers": { "X-Limit": 10, "X-Name": "a" } })),
            "headers",
        );
        assert_eq!(map["X-Limit"], "10");
        assert_eq!(map["X-Name"], "a");
    }

    #[test]
    fn string_vec_ignores_non_strings() {
        let v = arg_string_vec(&args(json!({ "patterns": ["*", 5, "x"] })), "patterns");
        assert_eq!(v, vec!["*", "x"]);
    }
}
