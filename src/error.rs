use std::fmt;

use serde::Serialize;

/// Semantic error kinds surfaced to the tool caller.
///
/// The wire form is the kebab-case string in [`ErrorKind::as_str`]; tool
/// results embed it as `{ "success": false, "error": ..., "tool": ..., "hint"? }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Tool arguments failed schema validation.
    InvalidArguments,
    /// No Chromium executable could be located.
    ChromiumNotFound,
    /// Spawn/port/verify sequence timed out or failed.
    BrowserFailedToStart,
    /// A tool needs a browser; none is available and auto-launch is refused.
    NotConnected,
    /// The debugging port answers but identifies as a look-alike (WebView).
    PortNotBrowser,
    /// The underlying CDP channel closed mid-command.
    TransportGone,
    /// The browser has zero page targets.
    NoPageAvailable,
    /// A DOM selector did not match within the timeout.
    SelectorNotFound,
    /// Overlapping interception modes requested on the same target.
    InterceptionModeConflict,
    /// A paused request aged past its deadline.
    InterceptionTimeout,
    /// Any unexpected handler fault.
    HandlerRaised,
}

impl ErrorKind {
    /// The kebab-case wire name for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArguments => "invalid-arguments",
            Self::ChromiumNotFound => "chromium-not-found",
            Self::BrowserFailedToStart => "browser-failed-to-start",
            Self::NotConnected => "not-connected",
            Self::PortNotBrowser => "port-not-browser",
            Self::TransportGone => "transport-gone",
            Self::NoPageAvailable => "no-page-available",
            Self::SelectorNotFound => "selector-not-found",
            Self::InterceptionModeConflict => "interception-mode-conflict",
            Self::InterceptionTimeout => "interception-timeout",
            Self::HandlerRaised => "handler-raised",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured server error: kind, human-readable message, optional hint
/// telling the caller how to recover.
#[derive(Debug, Clone)]
pub struct ServerError {
    pub kind: ErrorKind,
    pub message: String,
    pub hint: Option<String>,
}

impl ServerError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    #[must_use]
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }

    #[must_use]
    pub fn not_connected() -> Self {
        Self::new(
            ErrorKind::NotConnected,
            "no browser is connected and auto-launch is disabled",
        )
        .with_hint("call launch_with_profile to start a browser")
    }

    #[must_use]
    pub fn port_not_browser(port: u16, identity: &str) -> Self {
        Self::new(
            ErrorKind::PortNotBrowser,
            format!("port {port} answers but identifies as \"{identity}\", not a full Chromium"),
        )
    }

    #[must_use]
    pub fn no_page_available() -> Self {
        Self::new(ErrorKind::NoPageAvailable, "the browser has no page targets")
    }

    #[must_use]
    pub fn handler_raised(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerRaised, message)
    }

    /// The `{ success: false, ... }` object returned from a failed tool call.
    #[must_use]
    pub fn to_tool_result(&self, tool: &str) -> serde_json::Value {
        let payload = ToolErrorPayload {
            success: false,
            error: self.kind.as_str(),
            message: &self.message,
            tool,
            hint: self.hint.as_deref(),
        };
        serde_json::to_value(&payload).unwrap_or_else(|_| {
            serde_json::json!({
                "success": false,
                "error": self.kind.as_str(),
                "tool": tool,
            })
        })
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ServerError {}

#[derive(Serialize)]
struct ToolErrorPayload<'a> {
    success: bool,
    error: &'a str,
    message: &'a str,
    tool: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'a str>,
}
