use serde_json::{Map, Value, json};

use crate::error::ServerError;

/// The kinds a tool parameter can declare.
#[derive(Debug, Clone)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    StringArray,
    Enum(&'static [&'static str]),
}

/// One parameter descriptor. Tool schemas are data, not code: adding a tool
/// is a table entry plus a handler function.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub description: &'static str,
}

impl ParamSpec {
    #[must_use]
    pub fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
            min: None,
            max: None,
            description,
        }
    }

    #[must_use]
    pub fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: None,
            min: None,
            max: None,
            description,
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    #[must_use]
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Validate and coerce one supplied value.
    fn check(&self, value: &Value) -> Result<Value, ServerError> {
        let fail = |why: &str| {
            Err(ServerError::invalid_arguments(format!(
                "parameter {:?}: {why}",
                self.name
            )))
        };
        match &self.kind {
            ParamKind::String => match value.as_str() {
                Some(_) => Ok(value.clone()),
                None => fail("expected a string"),
            },
            ParamKind::Integer => {
                let Some(n) = value.as_i64() else {
                    return fail("expected an integer");
                };
                #[allow(clippy::cast_precision_loss)]
                self.check_bounds(n as f64)?;
                Ok(value.clone())
            }
            ParamKind::Number => {
                let Some(n) = value.as_f64() else {
                    return fail("expected a number");
                };
                self.check_bounds(n)?;
                Ok(value.clone())
            }
            ParamKind::Boolean => match value.as_bool() {
                Some(_) => Ok(value.clone()),
                None => fail("expected a boolean"),
            },
            ParamKind::Object => match value.as_object() {
                Some(_) => Ok(value.clone()),
                None => fail("expected an object"),
            },
            ParamKind::StringArray => {
                let Some(items) = value.as_array() else {
                    return fail("expected an array of strings");
                };
                if items.iter().any(|i| !i.is_string()) {
                    return fail("expected every element to be a string");
                }
                Ok(value.clone())
            }
            ParamKind::Enum(allowed) => {
                let Some(s) = value.as_str() else {
                    return fail("expected a string");
                };
                if allowed.contains(&s) {
                    Ok(value.clone())
                } else {
                    Err(ServerError::invalid_arguments(format!(
                        "parameter {:?}: {s:?} is not one of {allowed:?}",
                        self.name
                    )))
                }
            }
        }
    }

    fn check_bounds(&self, n: f64) -> Result<(), ServerError> {
        if let Some(min) = self.min {
            if n < min {
                return Err(ServerError::invalid_arguments(format!(
                    "parameter {:?}: {n} is below the minimum {min}",
                    self.name
                )));
            }
        }
        if let Some(max) = self.max {
            if n > max {
                return Err(ServerError::invalid_arguments(format!(
                    "parameter {:?}: {n} is above the maximum {max}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn schema_json(&self) -> Value {
        let mut schema = match &self.kind {
            ParamKind::String => json!({ "type": "string" }),
            ParamKind::Integer => json!({ "type": "integer" }),
            ParamKind::Number => json!({ "type": "number" }),
            ParamKind::Boolean => json!({ "type": "boolean" }),
            ParamKind::Object => json!({ "type": "object" }),
            ParamKind::StringArray => {
                json!({ "type": "array", "items": { "type": "string" } })
            }
            ParamKind::Enum(allowed) => json!({ "type": "string", "enum": allowed }),
        };
        schema["description"] = json!(self.description);
        if let Some(default) = &self.default {
            schema["default"] = default.clone();
        }
        if let Some(min) = self.min {
            schema["minimum"] = json!(min);
        }
        if let Some(max) = self.max {
            schema["maximum"] = json!(max);
        }
        schema
    }
}

/// The declared surface of one tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
    /// Default per-call deadline.
    pub timeout_ms: u64,
    /// Listed only when advanced tools are enabled.
    pub advanced: bool,
    /// Whether the dispatcher runs `ensure_connected` first.
    pub requires_browser: bool,
}

impl ToolSpec {
    /// Walk the descriptor against the argument object: reject unknown
    /// keys, enforce kinds and constraints, fill defaults.
    ///
    /// `timeoutMs` is accepted on every tool as the deadline override.
    ///
    /// # Errors
    ///
    /// `invalid-arguments` on any mismatch.
    pub fn validate(&self, args: &Value) -> Result<Map<String, Value>, ServerError> {
        let supplied = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => {
                return Err(ServerError::invalid_arguments(
                    "arguments must be an object",
                ));
            }
        };

        for key in supplied.keys() {
            if key != "timeoutMs" && !self.params.iter().any(|p| p.name == key) {
                return Err(ServerError::invalid_arguments(format!(
                    "unknown parameter {key:?} for tool {:?}",
                    self.name
                )));
            }
        }

        let mut validated = Map::new();
        for param in &self.params {
            match supplied.get(param.name) {
                Some(Value::Null) | None => {
                    if let Some(default) = &param.default {
                        validated.insert(param.name.to_string(), default.clone());
                    } else if param.required {
                        return Err(ServerError::invalid_arguments(format!(
                            "missing required parameter {:?}",
                            param.name
                        )));
                    }
                }
                Some(value) => {
                    validated.insert(param.name.to_string(), param.check(value)?);
                }
            }
        }

        if let Some(timeout) = supplied.get("timeoutMs") {
            let Some(ms) = timeout.as_u64() else {
                return Err(ServerError::invalid_arguments(
                    "parameter \"timeoutMs\": expected a positive integer",
                ));
            };
            validated.insert("timeoutMs".into(), json!(ms));
        }

        Ok(validated)
    }

    /// The JSON-Schema object published by `tools/list`.
    #[must_use]
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            properties.insert(param.name.to_string(), param.schema_json());
            if param.required {
                required.push(json!(param.name));
            }
        }
        properties.insert(
            "timeoutMs".into(),
            json!({
                "type": "integer",
                "description": "Overrides the tool's default timeout in milliseconds",
            }),
        );
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn spec() -> ToolSpec {
        ToolSpec {
            name: "example",
            description: "example tool",
            params: vec![
                ParamSpec::required("url", ParamKind::String, "target url"),
                ParamSpec::optional(
                    "statusCode",
                    ParamKind::Integer,
                    "status to serve",
                )
                .with_default(json!(200))
                .range(100.0, 599.0),
                ParamSpec::optional(
                    "action",
                    ParamKind::Enum(&["observe", "block"]),
                    "what to do",
                ),
                ParamSpec::optional("patterns", ParamKind::StringArray, "url globs"),
                ParamSpec::optional("headers", ParamKind::Object, "header map"),
            ],
            timeout_ms: 30_000,
            advanced: false,
            requires_browser: true,
        }
    }

    #[test]
    fn validates_and_fills_defaults() {
        let validated = spec()
            .validate(&json!({ "url": "https://example.com" }))
            .unwrap();
        assert_eq!(validated["url"], "https://example.com");
        assert_eq!(validated["statusCode"], 200);
        assert!(!validated.contains_key("action"));
    }

    #[test]
    fn missing_required_is_rejected() {
        let err = spec().validate(&json!({})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArguments);
        assert!(err.message.contains("url"));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = spec()
            .validate(&json!({ "url": "x", "bogus": 1 }))
            .unwrap_err();
        assert!(err.message.contains("bogus"));
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let err = spec().validate(&json!({ "url": 42 })).unwrap_err();
        assert!(err.message.contains("expected a string"));
    }

    #[test]
    fn integer_range_is_enforced() {
        let err = spec()
            .validate(&json!({ "url": "x", "statusCode": 99 }))
            .unwrap_err();
        assert!(err.message.contains("below the minimum"));
        let err = spec()
            .validate(&json!({ "url": "x", "statusCode": 600 }))
            .unwrap_err();
        assert!(err.message.contains("above the maximum"));
    }

    #[test]
    fn enum_values_are_enforced() {
        let ok = spec()
            .validate(&json!({ "url": "x", "action": "block" }))
            .unwrap();
        assert_eq!(ok["action"], "block");
        let err = spec()
            .validate(&json!({ "url": "x", "action": "explode" }))
            .unwrap_err();
        assert!(err.message.contains("explode"));
    }

    #[test]
    fn string_array_elements_are_checked() {
        let err = spec()
            .validate(&json!({ "url": "x", "patterns": ["*", 3] }))
            .unwrap_err();
        assert!(err.message.contains("every element"));
    }

    #[test]
    fn timeout_override_is_accepted_everywhere() {
        let validated = spec()
            .validate(&json!({ "url": "x", "timeoutMs": 5000 }))
            .unwrap();
        assert_eq!(validated["timeoutMs"], 5000);
    }

    #[test]
    fn null_argument_uses_default() {
        let validated = spec()
            .validate(&json!({ "url": "x", "statusCode": null }))
            .unwrap();
        assert_eq!(validated["statusCode"], 200);
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        let err = spec().validate(&json!([1, 2])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArguments);
    }

    #[test]
    fn input_schema_lists_properties_and_required() {
        let schema = spec().input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["url"]["type"], "string");
        assert_eq!(schema["properties"]["statusCode"]["default"], 200);
        assert_eq!(schema["required"], json!(["url"]));
        assert!(schema["properties"]["timeoutMs"].is_object());
    }
}
