use std::fmt;

/// Errors from Chromium discovery, profile preparation, and launch.
#[derive(Debug)]
pub enum ChromeError {
    /// No Chromium executable was found on the system.
    NotFound(String),

    /// The process failed to spawn.
    SpawnFailed(String),

    /// The spawned browser never became reachable. Carries the accumulated
    /// diagnostic log from each verification step.
    FailedToStart {
        port: u16,
        diagnostics: Vec<String>,
    },

    /// The debugging port answers but the responder is not a full Chromium
    /// (embedded WebView, headless shell).
    NotABrowser {
        port: u16,
        identity: String,
    },

    /// HTTP request to the DevTools endpoint failed.
    HttpError(String),

    /// Failed to parse a response from the DevTools endpoint.
    ParseError(String),

    /// Shadow profile mirroring failed.
    ProfileError(String),

    /// An I/O error occurred.
    Io(std::io::Error),
}

impl fmt::Display for ChromeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "Chromium not found: {msg}"),
            Self::SpawnFailed(msg) => write!(f, "Chromium spawn failed: {msg}"),
            Self::FailedToStart { port, diagnostics } => {
                write!(
                    f,
                    "browser failed to start on port {port}: {}",
                    diagnostics.join("; ")
                )
            }
            Self::NotABrowser { port, identity } => {
                write!(
                    f,
                    "port {port} is served by \"{identity}\", which is not a full Chromium"
                )
            }
            Self::HttpError(msg) => write!(f, "DevTools endpoint error: {msg}"),
            Self::ParseError(msg) => write!(f, "DevTools response parse error: {msg}"),
            Self::ProfileError(msg) => write!(f, "shadow profile error: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ChromeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChromeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ChromeError> for crate::error::ServerError {
    fn from(e: ChromeError) -> Self {
        use crate::error::ErrorKind;
        match &e {
            ChromeError::NotFound(_) => Self::new(ErrorKind::ChromiumNotFound, e.to_string())
                .with_hint("pass chromiumPath to launch_with_profile"),
            ChromeError::NotABrowser { port, identity } => {
                Self::port_not_browser(*port, identity)
            }
            ChromeError::SpawnFailed(_) | ChromeError::FailedToStart { .. } => {
                Self::new(ErrorKind::BrowserFailedToStart, e.to_string())
            }
            ChromeError::HttpError(_)
            | ChromeError::ParseError(_)
            | ChromeError::ProfileError(_)
            | ChromeError::Io(_) => Self::new(ErrorKind::HandlerRaised, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn display_failed_to_start_joins_diagnostics() {
        let err = ChromeError::FailedToStart {
            port: 9222,
            diagnostics: vec!["child exited early".into(), "port never listened".into()],
        };
        assert_eq!(
            err.to_string(),
            "browser failed to start on port 9222: child exited early; port never listened"
        );
    }

    #[test]
    fn display_not_a_browser() {
        let err = ChromeError::NotABrowser {
            port: 9222,
            identity: "Edge WebView2".into(),
        };
        assert!(err.to_string().contains("Edge WebView2"));
        assert!(err.to_string().contains("9222"));
    }

    #[test]
    fn not_found_maps_with_hint() {
        let server: crate::error::ServerError =
            ChromeError::NotFound("no candidates exist".into()).into();
        assert_eq!(server.kind, ErrorKind::ChromiumNotFound);
        assert!(server.hint.is_some());
    }

    #[test]
    fn look_alike_maps_to_port_not_browser() {
        let server: crate::error::ServerError = ChromeError::NotABrowser {
            port: 9222,
            identity: "headless-shell".into(),
        }
        .into();
        assert_eq!(server.kind, ErrorKind::PortNotBrowser);
    }

    #[test]
    fn spawn_failures_map_to_browser_failed_to_start() {
        let server: crate::error::ServerError =
            ChromeError::SpawnFailed("permission denied".into()).into();
        assert_eq!(server.kind, ErrorKind::BrowserFailedToStart);
    }

    #[test]
    fn io_error_source_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked");
        let err: &dyn std::error::Error = &ChromeError::Io(io);
        assert!(err.source().is_some());
    }
}
