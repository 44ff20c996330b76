use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

/// One finished request/response pair, ready to serialize as a HAR entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub started_date_time: String,
    /// Total elapsed time in milliseconds.
    pub time: f64,
    pub request: HarRequest,
    pub response: HarResponse,
    pub cache: Value,
    pub timings: HarTimings,
    pub pageref: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<HarHeader>,
    pub query_string: Vec<Value>,
    pub cookies: Vec<Value>,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub headers: Vec<HarHeader>,
    pub cookies: Vec<Value>,
    pub content: HarContent,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    pub size: i64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarTimings {
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

/// In-flight entry accumulating data across the Network event triple.
#[derive(Debug)]
struct EntryBuilder {
    wall_time: f64,
    monotonic_start: f64,
    method: String,
    url: String,
    request_headers: Vec<HarHeader>,
    post_data_size: i64,
    status: Option<u16>,
    status_text: String,
    response_headers: Vec<HarHeader>,
    mime_type: String,
    receive_headers_end: f64,
    encoded_length: i64,
    finished_at: Option<f64>,
}

/// Accumulates `Network.*` events into HAR entries while recording is on.
///
/// Runs independently of rule dispatch; the engine feeds it events from the
/// same persistent session. `drain` empties the buffer, which is the
/// contract of `stop_har_recording`.
#[derive(Debug, Default)]
pub struct HarRecorder {
    builders: HashMap<String, EntryBuilder>,
    order: Vec<String>,
}

impl HarRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one CDP Network event into the recorder.
    pub fn record_event(&mut self, method: &str, params: &Value) {
        match method {
            "Network.requestWillBeSent" => self.on_request(params),
            "Network.responseReceived" => self.on_response(params),
            "Network.loadingFinished" => self.on_finished(params),
            _ => {}
        }
    }

    fn on_request(&mut self, params: &Value) {
        let Some(request_id) = params["requestId"].as_str() else {
            return;
        };
        let request = &params["request"];
        let builder = EntryBuilder {
            wall_time: params["wallTime"].as_f64().unwrap_or(0.0),
            monotonic_start: params["timestamp"].as_f64().unwrap_or(0.0),
            method: request["method"].as_str().unwrap_or("GET").to_string(),
            url: request["url"].as_str().unwrap_or_default().to_string(),
            request_headers: headers_from_object(&request["headers"]),
            post_data_size: request["postData"]
                .as_str()
                .map_or(0, |b| i64::try_from(b.len()).unwrap_or(i64::MAX)),
            status: None,
            status_text: String::new(),
            response_headers: Vec::new(),
            mime_type: String::new(),
            receive_headers_end: 0.0,
            encoded_length: -1,
            finished_at: None,
        };
        if !self.builders.contains_key(request_id) {
            self.order.push(request_id.to_string());
        }
        self.builders.insert(request_id.to_string(), builder);
    }

    fn on_response(&mut self, params: &Value) {
        let Some(builder) = params["requestId"]
            .as_str()
            .and_then(|id| self.builders.get_mut(id))
        else {
            return;
        };
        let response = &params["response"];
        builder.status = response["status"]
            .as_u64()
            .and_then(|s| u16::try_from(s).ok());
        builder.status_text = response["statusText"].as_str().unwrap_or_default().to_string();
        builder.response_headers = headers_from_object(&response["headers"]);
        builder.mime_type = response["mimeType"].as_str().unwrap_or_default().to_string();
        builder.receive_headers_end = response["timing"]["receiveHeadersEnd"]
            .as_f64()
            .unwrap_or(0.0);
    }

    fn on_finished(&mut self, params: &Value) {
        let Some(builder) = params["requestId"]
            .as_str()
            .and_then(|id| self.builders.get_mut(id))
        else {
            return;
        };
        builder.finished_at = params["timestamp"].as_f64();
        builder.encoded_length = params["encodedDataLength"]
            .as_f64()
            .map_or(-1, |l| l as i64);
    }

    /// Number of requests observed so far (finished or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Convert everything recorded so far into HAR entries and clear the
    /// buffer.
    #[must_use]
    pub fn drain(&mut self) -> Vec<HarEntry> {
        let order = std::mem::take(&mut self.order);
        let mut builders = std::mem::take(&mut self.builders);
        order
            .into_iter()
            .filter_map(|id| builders.remove(&id))
            .map(finish_entry)
            .collect()
    }
}

fn finish_entry(builder: EntryBuilder) -> HarEntry {
    let total_ms = builder
        .finished_at
        .map_or(0.0, |end| ((end - builder.monotonic_start) * 1000.0).max(0.0));
    let wait = builder.receive_headers_end.max(0.0);
    let receive = (total_ms - wait).max(0.0);

    HarEntry {
        started_date_time: timestamp_to_iso(builder.wall_time),
        time: total_ms,
        request: HarRequest {
            method: builder.method,
            url: builder.url,
            http_version: "HTTP/1.1".into(),
            headers: builder.request_headers,
            query_string: Vec::new(),
            cookies: Vec::new(),
            headers_size: -1,
            body_size: builder.post_data_size,
        },
        response: HarResponse {
            status: builder.status.unwrap_or(0),
            status_text: builder.status_text,
            http_version: "HTTP/1.1".into(),
            headers: builder.response_headers,
            cookies: Vec::new(),
            content: HarContent {
                size: builder.encoded_length,
                mime_type: builder.mime_type,
            },
            redirect_url: String::new(),
            headers_size: -1,
            body_size: builder.encoded_length,
        },
        cache: serde_json::json!({}),
        timings: HarTimings {
            send: 0.0,
            wait,
            receive,
        },
        pageref: "page_1".into(),
    }
}

/// Build the complete HAR 1.2 document (log, pages, entries).
#[must_use]
pub fn har_document(entries: &[HarEntry]) -> Value {
    let started = entries
        .first()
        .map_or_else(|| timestamp_to_iso(0.0), |e| e.started_date_time.clone());
    serde_json::json!({
        "log": {
            "version": "1.2",
            "creator": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "pages": [{
                "startedDateTime": started,
                "id": "page_1",
                "title": "",
                "pageTimings": {},
            }],
            "entries": entries,
        }
    })
}

fn headers_from_object(headers: &Value) -> Vec<HarHeader> {
    let Some(map) = headers.as_object() else {
        return Vec::new();
    };
    map.iter()
        .map(|(name, value)| HarHeader {
            name: name.clone(),
            value: value.as_str().unwrap_or_default().to_string(),
        })
        .collect()
}

/// Convert a CDP wall-clock timestamp (seconds since epoch, fractional) to
/// an ISO 8601 string with millisecond precision.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::similar_names
)]
#[must_use]
pub fn timestamp_to_iso(ts: f64) -> String {
    let total_ms = (ts.max(0.0) * 1000.0) as u64;
    let secs = total_ms / 1000;
    let ms_part = total_ms % 1000;

    let day_secs = secs % 86_400;
    let hours = day_secs / 3_600;
    let minutes = (day_secs % 3_600) / 60;
    let seconds = day_secs % 60;

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let z = (secs / 86_400) as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}.{ms_part:03}Z")
}
