use std::collections::BTreeMap;

use globset::{Glob, GlobMatcher};
use serde::Serialize;

use crate::error::ServerError;

/// Which Fetch pause stage a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStage {
    Request,
    Response,
}

impl RuleStage {
    /// The CDP `Fetch.RequestStage` wire name.
    #[must_use]
    pub fn cdp_name(self) -> &'static str {
        match self {
            Self::Request => "Request",
            Self::Response => "Response",
        }
    }
}

/// What to do with a matching paused request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Observe,
    Modify,
    Fail,
    Mock,
    Delay,
    Block,
}

/// Header and body edits applied by a `modify` rule.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Modification {
    /// Headers to add or override, name to value.
    pub add_headers: BTreeMap<String, String>,
    /// Header names to drop (case-insensitive).
    pub remove_headers: Vec<String>,
    /// Replace the request method.
    pub set_method: Option<String>,
    /// Replace the request post data / response body.
    pub set_body: Option<String>,
    /// Replace the response status.
    pub set_status: Option<u16>,
    /// Extra latency before the request is resumed.
    pub latency_ms: Option<u64>,
}

/// One interception rule on a target. Rules are evaluated first-match-wins
/// in declaration order; mock endpoints shadow all of them.
#[derive(Debug, Clone)]
pub struct InterceptionRule {
    /// The raw url glob as supplied by the caller.
    pub pattern: String,
    matcher: GlobMatcher,
    pub stage: RuleStage,
    /// Optional CDP resource type filter (`Document`, `XHR`, `Fetch`, ...).
    pub resource_type: Option<String>,
    /// Optional exact-match method filter; `None` matches every method.
    pub method: Option<String>,
    pub action: RuleAction,
    pub modification: Modification,
    /// Per-rule auto-continue override for `observe`; falls back to the
    /// context policy when unset.
    pub auto_continue: Option<bool>,
}

impl InterceptionRule {
    /// Build a rule, compiling the url glob.
    ///
    /// # Errors
    ///
    /// Returns `invalid-arguments` if the glob does not compile.
    pub fn new(
        pattern: &str,
        stage: RuleStage,
        action: RuleAction,
        modification: Modification,
    ) -> Result<Self, ServerError> {
        let matcher = compile_glob(pattern)?;
        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
            stage,
            resource_type: None,
            method: None,
            action,
            modification,
            auto_continue: None,
        })
    }

    #[must_use]
    pub fn with_method(mut self, method: Option<String>) -> Self {
        self.method = method.map(|m| m.to_uppercase());
        self
    }

    #[must_use]
    pub fn with_resource_type(mut self, resource_type: Option<String>) -> Self {
        self.resource_type = resource_type;
        self
    }

    /// Per-rule auto-continue override for `observe` matches. `None` defers
    /// to the context policy.
    #[must_use]
    pub fn with_auto_continue(mut self, auto_continue: Option<bool>) -> Self {
        self.auto_continue = auto_continue;
        self
    }

    /// Does this rule match a paused request?
    #[must_use]
    pub fn matches(&self, url: &str, method: &str, resource_type: &str, stage: RuleStage) -> bool {
        if self.stage != stage {
            return false;
        }
        if let Some(want) = &self.method {
            if !want.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(want) = &self.resource_type {
            if !want.eq_ignore_ascii_case(resource_type) {
                return false;
            }
        }
        self.matcher.is_match(url)
    }
}

/// Caller-supplied definition of a mock endpoint; the engine assigns ids.
#[derive(Debug, Clone)]
pub struct MockSpec {
    pub pattern: String,
    /// `None` matches every method.
    pub method: Option<String>,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub latency_ms: u64,
}

/// A locally served endpoint. Matching requests are fulfilled without ever
/// going upstream.
#[derive(Debug, Clone)]
pub struct MockEndpoint {
    pub id: u64,
    pub pattern: String,
    matcher: GlobMatcher,
    /// `None` matches every method.
    pub method: Option<String>,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub latency_ms: u64,
    pub call_count: u64,
}

impl MockEndpoint {
    /// Build a mock endpoint from its spec, compiling the url glob.
    ///
    /// # Errors
    ///
    /// Returns `invalid-arguments` if the glob does not compile.
    pub fn new(id: u64, spec: MockSpec) -> Result<Self, ServerError> {
        let matcher = compile_glob(&spec.pattern)?;
        Ok(Self {
            id,
            pattern: spec.pattern,
            matcher,
            method: spec.method.map(|m| m.to_uppercase()),
            status: spec.status,
            headers: spec.headers,
            body: spec.body,
            latency_ms: spec.latency_ms,
            call_count: 0,
        })
    }

    #[must_use]
    pub fn matches(&self, url: &str, method: &str) -> bool {
        if let Some(want) = &self.method {
            if !want.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        self.matcher.is_match(url)
    }
}

/// Terminal and non-terminal states of a paused request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Pending,
    Resumed,
    Modified,
    Failed,
    Mocked,
    TimedOut,
}

impl Disposition {
    /// Pending is the only non-terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// One `Fetch.requestPaused` occurrence and its lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedRequest {
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub resource_type: String,
    pub stage: RuleStage,
    pub headers: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    /// Index into the context rule list of the owning rule, if any matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_index: Option<usize>,
    pub disposition: Disposition,
    /// ISO 8601 arrival timestamp.
    pub paused_at: String,
    /// Set when the per-context timeout forced a resume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Compile a caller-supplied url glob.
fn compile_glob(pattern: &str) -> Result<GlobMatcher, ServerError> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| ServerError::invalid_arguments(format!("bad url pattern {pattern:?}: {e}")))
}

/// Conservative pattern overlap test used by the mode-conflict check: two
/// patterns overlap when they are identical or either is a match-all glob.
#[must_use]
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let is_match_all = |p: &str| p == "*" || p == "**";
    a == b || is_match_all(a) || is_match_all(b)
}
