use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::ChromeError;

/// Browser version information returned by `/json/version`.
///
/// The `Browser` field is the sole source of truth for deciding whether the
/// responder is a real Chromium or a look-alike.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserVersion {
    /// Browser product string (e.g. `"Chrome/127.0.6533.88"`).
    #[serde(rename = "Browser")]
    pub browser: String,

    /// CDP protocol version (e.g. `"1.3"`).
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: String,

    /// Browser-level WebSocket debugger URL.
    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_debugger_url: String,
}

/// One debuggable target as enumerated by `/json/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSummary {
    pub id: String,

    /// Target type (`page`, `service_worker`, `background_page`, ...).
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub url: String,

    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_debugger_url: Option<String>,
}

/// Decide whether a `/json/version` response identifies a full Chromium.
///
/// Embedded WebViews and the headless shell announce themselves in the
/// product string; a desktop Chrome/Chromium/Brave reports `Chrome/…` or
/// `Chromium/…` with no webview marker.
#[must_use]
pub fn is_real_chromium(version: &BrowserVersion) -> bool {
    let product = version.browser.as_str();
    if product.starts_with("HeadlessChrome/") || product.starts_with("headless-shell") {
        return false;
    }
    if product.contains("WebView") || product.contains("wv") || product.contains("Edg/") {
        return false;
    }
    product.starts_with("Chrome/") || product.starts_with("Chromium/")
}

/// Query `/json/version`.
///
/// # Errors
///
/// Returns `ChromeError::HttpError` on connection failure or
/// `ChromeError::ParseError` if the response cannot be deserialized.
pub async fn query_version(host: &str, port: u16) -> Result<BrowserVersion, ChromeError> {
    let body = http_request("GET", host, port, "/json/version").await?;
    serde_json::from_str(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
}

/// Query `/json/list` for debuggable targets.
///
/// # Errors
///
/// Returns `ChromeError::HttpError` on connection failure or
/// `ChromeError::ParseError` if the response cannot be deserialized.
pub async fn query_targets(host: &str, port: u16) -> Result<Vec<TargetSummary>, ChromeError> {
    let body = http_request("GET", host, port, "/json/list").await?;
    serde_json::from_str(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
}

/// Open a new page via `/json/new`. Recent Chromium requires PUT here.
///
/// # Errors
///
/// Returns `ChromeError::HttpError` or `ChromeError::ParseError`.
pub async fn open_page(host: &str, port: u16, url: &str) -> Result<TargetSummary, ChromeError> {
    let encoded: String = url::form_urlencoded::byte_serialize(url.as_bytes()).collect();
    let path = format!("/json/new?{encoded}");
    let body = http_request("PUT", host, port, &path).await?;
    serde_json::from_str(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
}

/// Close a target via `/json/close/<id>`.
///
/// # Errors
///
/// Returns `ChromeError::HttpError` on failure.
pub async fn close_target(host: &str, port: u16, target_id: &str) -> Result<(), ChromeError> {
    let path = format!("/json/close/{target_id}");
    http_request("GET", host, port, &path).await.map(|_| ())
}

/// Bring a target's window to the foreground via `/json/activate/<id>`.
///
/// # Errors
///
/// Returns `ChromeError::HttpError` on failure.
pub async fn activate_target(host: &str, port: u16, target_id: &str) -> Result<(), ChromeError> {
    let path = format!("/json/activate/{target_id}");
    http_request("GET", host, port, &path).await.map(|_| ())
}

// =============================================================================
// Minimal HTTP client
// =============================================================================
//
// The DevTools sibling endpoint speaks plain HTTP/1.1 on localhost with
// tiny JSON bodies. Headers are consumed line by line; the body is then
// read against Content-Length, since Chromium may hold the connection open
// past the end of the body.

/// Overall deadline for one endpoint round trip.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(5);

/// Perform one request against the DevTools endpoint.
async fn http_request(
    method: &str,
    host: &str,
    port: u16,
    path: &str,
) -> Result<String, ChromeError> {
    let request =
        format!("{method} {path} HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: close\r\n\r\n");

    let exchange = async {
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            ChromeError::HttpError(format!("connection failed to {host}:{port}: {e}"))
        })?;
        let mut reader = BufReader::new(stream);
        reader
            .get_mut()
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ChromeError::HttpError(format!("write failed: {e}")))?;
        read_response(&mut reader).await
    };

    tokio::time::timeout(ENDPOINT_TIMEOUT, exchange)
        .await
        .map_err(|_| ChromeError::HttpError(format!("{method} {path} timed out")))?
}

/// Read one HTTP/1.1 response: status line, header lines up to the blank
/// separator, then a body sized by Content-Length (to EOF without one).
async fn read_response<R>(reader: &mut R) -> Result<String, ChromeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .await
        .map_err(|e| ChromeError::HttpError(format!("read failed: {e}")))?;
    check_status(&status_line)?;

    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ChromeError::HttpError(format!("read failed: {e}")))?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        if let Some(value) = header_value(&line, "content-length") {
            content_length = value.parse().ok();
        }
    }

    let body_bytes = match content_length {
        Some(len) => {
            let mut body = vec![0u8; len];
            reader
                .read_exact(&mut body)
                .await
                .map_err(|e| ChromeError::HttpError(format!("body truncated: {e}")))?;
            body
        }
        None => {
            let mut body = Vec::new();
            reader
                .read_to_end(&mut body)
                .await
                .map_err(|e| ChromeError::HttpError(format!("read failed: {e}")))?;
            body
        }
    };

    String::from_utf8(body_bytes)
        .map_err(|e| ChromeError::ParseError(format!("response body is not UTF-8: {e}")))
}

/// Accept any 2xx status line, reject everything else.
fn check_status(status_line: &str) -> Result<(), ChromeError> {
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| {
            ChromeError::ParseError(format!("malformed status line {:?}", status_line.trim()))
        })?;
    if (200..300).contains(&code) {
        Ok(())
    } else {
        Err(ChromeError::HttpError(format!(
            "endpoint answered {code} for a request that expects success"
        )))
    }
}

/// Case-insensitive header lookup on one raw `Name: value` line.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    if key.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(browser: &str) -> BrowserVersion {
        BrowserVersion {
            browser: browser.to_string(),
            protocol_version: "1.3".into(),
            ws_debugger_url: "ws://127.0.0.1:9222/devtools/browser/abc".into(),
        }
    }

    /// Run `read_response` over canned bytes.
    async fn read_canned(raw: &[u8]) -> Result<String, ChromeError> {
        let mut reader = BufReader::new(raw);
        read_response(&mut reader).await
    }

    #[test]
    fn desktop_chrome_is_real() {
        assert!(is_real_chromium(&version("Chrome/127.0.6533.88")));
    }

    #[test]
    fn chromium_build_is_real() {
        assert!(is_real_chromium(&version("Chromium/126.0.6478.0")));
    }

    #[test]
    fn headless_shell_is_rejected() {
        assert!(!is_real_chromium(&version("HeadlessChrome/127.0.6533.88")));
    }

    #[test]
    fn webview_is_rejected() {
        assert!(!is_real_chromium(&version("Chrome/127.0.0.0 WebView")));
    }

    #[test]
    fn edge_is_rejected() {
        assert!(!is_real_chromium(&version("Chrome/127.0.0.0 Edg/127.0.2651.74")));
    }

    #[test]
    fn parse_version_response() {
        let json = r#"{
            "Browser": "Chrome/127.0.6533.88",
            "Protocol-Version": "1.3",
            "User-Agent": "Mozilla/5.0",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/abc-123"
        }"#;
        let v: BrowserVersion = serde_json::from_str(json).unwrap();
        assert!(is_real_chromium(&v));
        assert!(v.ws_debugger_url.starts_with("ws://"));
    }

    #[test]
    fn parse_target_list() {
        let json = r#"[{
            "id": "T1",
            "type": "page",
            "title": "Example",
            "url": "https://example.com/",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/T1"
        }, {
            "id": "SW1",
            "type": "service_worker",
            "url": "https://example.com/sw.js"
        }]"#;
        let targets: Vec<TargetSummary> = serde_json::from_str(json).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].kind, "page");
        assert_eq!(targets[1].kind, "service_worker");
        assert!(targets[1].ws_debugger_url.is_none());
    }

    #[tokio::test]
    async fn body_is_sized_by_content_length() {
        // Trailing junk after the body simulates a connection Chromium
        // keeps open; the reader must not wait for EOF.
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\n{\"ok\":true}garbage";
        assert_eq!(read_canned(raw).await.unwrap(), "{\"ok\":true}");
    }

    #[tokio::test]
    async fn body_without_content_length_reads_to_eof() {
        let raw = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n[]";
        assert_eq!(read_canned(raw).await.unwrap(), "[]");
    }

    #[tokio::test]
    async fn empty_body_is_ok() {
        let raw = b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n";
        assert_eq!(read_canned(raw).await.unwrap(), "");
    }

    #[tokio::test]
    async fn non_2xx_status_is_an_error() {
        let raw = b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n";
        assert!(matches!(
            read_canned(raw).await,
            Err(ChromeError::HttpError(_))
        ));
    }

    #[tokio::test]
    async fn malformed_status_line_is_a_parse_error() {
        let raw = b"totally not http\r\n\r\n";
        assert!(matches!(
            read_canned(raw).await,
            Err(ChromeError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 64\r\n\r\nshort";
        assert!(matches!(
            read_canned(raw).await,
            Err(ChromeError::HttpError(_))
        ));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        assert_eq!(header_value("Content-Length: 42\r\n", "content-length"), Some("42"));
        assert_eq!(header_value("CONTENT-LENGTH:7\r\n", "content-length"), Some("7"));
        assert_eq!(header_value("Content-Type: text/json\r\n", "content-length"), None);
        assert_eq!(header_value("no colon here\r\n", "content-length"), None);
    }

    #[test]
    fn status_accepts_any_2xx() {
        assert!(check_status("HTTP/1.1 200 OK\r\n").is_ok());
        assert!(check_status("HTTP/1.1 204 No Content\r\n").is_ok());
        assert!(check_status("HTTP/1.1 302 Found\r\n").is_err());
        assert!(check_status("HTTP/1.1 404 Not Found\r\n").is_err());
    }

    #[tokio::test]
    async fn query_version_against_a_mock_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                // Drain the request head before answering.
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let body = r#"{"Browser":"Chrome/127.0.0.0","Protocol-Version":"1.3","webSocketDebuggerUrl":"ws://127.0.0.1:9222/devtools/browser/x"}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        let v = query_version("127.0.0.1", port).await.unwrap();
        assert!(is_real_chromium(&v));
        assert_eq!(v.protocol_version, "1.3");
    }

    #[test]
    fn new_page_url_is_form_encoded() {
        let encoded: String =
            url::form_urlencoded::byte_serialize("https://example.com/a b".as_bytes()).collect();
        assert_eq!(encoded, "https%3A%2F%2Fexample.com%2Fa+b");
    }
}
