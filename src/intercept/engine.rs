use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::Engine as _;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::cdp::{CdpEvent, CdpSession};
use crate::error::{ErrorKind, ServerError};
use crate::sessions::{PersistentPurpose, SessionManager};

use super::har::{HarEntry, HarRecorder, timestamp_to_iso};
use super::rules::{
    Disposition, InterceptionRule, MockEndpoint, MockSpec, PausedRequest, RuleAction, RuleStage,
    patterns_overlap,
};

/// Default per-context deadline for a paused request.
const DEFAULT_PAUSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on the observed-request log per context.
const OBSERVED_LOG_CAP: usize = 500;

/// Cap on captured WebSocket frames per context.
const WS_FRAME_CAP: usize = 1000;

/// A captured WebSocket frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WsFrame {
    pub direction: &'static str,
    pub url: String,
    pub opcode: u64,
    pub payload: String,
    pub timestamp: String,
}

/// Snapshot of a context's queues, returned by the listing tools.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSnapshot {
    pub pending: Vec<PausedRequest>,
    pub observed: Vec<PausedRequest>,
    pub warnings: Vec<String>,
}

/// Mutable state of one per-target interception context. The event pump,
/// watchdog timers, and tool calls all lock this; per-target dispatch is
/// serialized by the lock, in arrival order.
struct ContextState {
    target_id: String,
    session: CdpSession,
    /// The enabled Fetch stage, if fetch interception is on.
    stage: Option<RuleStage>,
    patterns: Vec<String>,
    rules: Vec<InterceptionRule>,
    mocks: Vec<MockEndpoint>,
    pending: HashMap<String, PausedRequest>,
    observed: Vec<PausedRequest>,
    auto_continue: bool,
    pause_timeout: Duration,
    warnings: Vec<String>,
    har: Option<HarRecorder>,
    har_drained: Vec<HarEntry>,
    ws_capture: bool,
    ws_urls: HashMap<String, String>,
    ws_frames: Vec<WsFrame>,
}

/// One per-target context: shared state plus the event pump owning the
/// subscriptions on the persistent session.
struct Context {
    state: Arc<Mutex<ContextState>>,
    pump: JoinHandle<()>,
}

/// The interception engine: owns every per-target context and is the only
/// owner of persistent sessions.
#[derive(Default)]
pub struct InterceptionEngine {
    contexts: HashMap<String, Context>,
    next_mock_id: u64,
}

impl InterceptionEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable fetch interception on a target at the given stage.
    ///
    /// # Errors
    ///
    /// `interception-mode-conflict` when the other stage is already active
    /// on overlapping patterns of the same target; transport errors from
    /// enabling the Fetch domain.
    pub async fn enable(
        &mut self,
        sessions: &mut SessionManager,
        target_id: &str,
        stage: RuleStage,
        patterns: Vec<String>,
        auto_continue: bool,
        timeout: Option<Duration>,
    ) -> Result<(), ServerError> {
        let context = self.context_for(sessions, target_id).await?;
        let mut state = context.lock().await;

        if let Some(active) = state.stage {
            if active != stage
                && state
                    .patterns
                    .iter()
                    .any(|p| patterns.iter().any(|q| patterns_overlap(p, q)))
            {
                return Err(mode_conflict(active, stage));
            }
        }
        // Mocks imply request-stage fulfillment; response interception on
        // the same urls would race it.
        if stage == RuleStage::Response {
            if let Some(mock) = state
                .mocks
                .iter()
                .find(|m| patterns.iter().any(|q| patterns_overlap(&m.pattern, q)))
            {
                return Err(ServerError::new(
                    ErrorKind::InterceptionModeConflict,
                    format!(
                        "mock endpoint {} is active on overlapping pattern {:?}",
                        mock.id, mock.pattern
                    ),
                )
                .with_hint("delete the mock or clear_all_mocks first"));
            }
        }

        state.stage = Some(stage);
        // Pattern sets accumulate across enables; disable clears them.
        for pattern in patterns {
            if !state.patterns.contains(&pattern) {
                state.patterns.push(pattern);
            }
        }
        state.auto_continue = auto_continue;
        if let Some(t) = timeout {
            state.pause_timeout = t;
        }
        apply_fetch_patterns(&state).await?;
        debug!(target_id, ?stage, "fetch interception enabled");
        Ok(())
    }

    /// Disable fetch interception on a target: remove patterns, drain any
    /// still-paused requests by resuming them unmodified, clear rules and
    /// mocks. The persistent session closes unless HAR recording or
    /// WebSocket capture still needs it.
    ///
    /// # Errors
    ///
    /// Returns transport errors from `Fetch.disable`; the drain itself is
    /// best-effort.
    pub async fn disable(
        &mut self,
        sessions: &mut SessionManager,
        target_id: &str,
    ) -> Result<(), ServerError> {
        let Some(context) = self.contexts.get(target_id) else {
            return Ok(());
        };
        {
            let mut state = context.state.lock().await;
            drain_pending(&mut state).await;
            let _ = state.session.send_command("Fetch.disable", None).await;
            state.stage = None;
            state.patterns.clear();
            state.rules.clear();
            state.mocks.clear();
        }
        self.close_context_if_idle(sessions, target_id).await;
        Ok(())
    }

    /// The Fetch stage currently enabled on a target, if any.
    pub async fn fetch_stage(&self, target_id: &str) -> Option<RuleStage> {
        let context = self.contexts.get(target_id)?;
        let state = context.state.lock().await;
        state.stage
    }

    /// Add patterns to an already-enabled context, leaving its auto-continue
    /// policy and pause timeout untouched. Re-issues `Fetch.enable` only
    /// when the pattern set actually grew.
    ///
    /// # Errors
    ///
    /// Transport errors from `Fetch.enable`.
    pub async fn extend_patterns(
        &mut self,
        sessions: &mut SessionManager,
        target_id: &str,
        patterns: Vec<String>,
    ) -> Result<(), ServerError> {
        let context = self.context_for(sessions, target_id).await?;
        let mut state = context.lock().await;
        let mut grew = false;
        for pattern in patterns {
            if !state.patterns.contains(&pattern) {
                state.patterns.push(pattern);
                grew = true;
            }
        }
        if grew {
            apply_fetch_patterns(&state).await?;
        }
        Ok(())
    }

    /// Append a rule to a target's context. Fetch interception must already
    /// be enabled at the rule's stage.
    ///
    /// # Errors
    ///
    /// `invalid-arguments` when no context or the wrong stage is enabled.
    pub async fn add_rule(
        &mut self,
        target_id: &str,
        rule: InterceptionRule,
    ) -> Result<usize, ServerError> {
        let context = self.contexts.get(target_id).ok_or_else(|| {
            ServerError::invalid_arguments(format!(
                "interception is not enabled on target {target_id}"
            ))
            .with_hint("call enable_request_interception or enable_response_interception first")
        })?;
        let mut state = context.state.lock().await;
        if state.stage != Some(rule.stage) {
            return Err(ServerError::invalid_arguments(format!(
                "interception on target {target_id} is enabled at a different stage"
            )));
        }
        state.rules.push(rule);
        Ok(state.rules.len() - 1)
    }

    /// Create a mock endpoint on a target, enabling request-stage fetch
    /// interception for its pattern as needed.
    ///
    /// # Errors
    ///
    /// `interception-mode-conflict` when response interception is active on
    /// an overlapping pattern; transport errors from `Fetch.enable`.
    pub async fn create_mock(
        &mut self,
        sessions: &mut SessionManager,
        target_id: &str,
        spec: MockSpec,
    ) -> Result<u64, ServerError> {
        self.next_mock_id += 1;
        let mock = MockEndpoint::new(self.next_mock_id, spec)?;
        let pattern = mock.pattern.clone();

        let context = self.context_for(sessions, target_id).await?;
        let mut state = context.lock().await;

        if state.stage == Some(RuleStage::Response)
            && state
                .patterns
                .iter()
                .any(|p| patterns_overlap(p, &pattern))
        {
            return Err(mode_conflict(RuleStage::Response, RuleStage::Request));
        }

        if state.stage.is_none() {
            state.stage = Some(RuleStage::Request);
        }
        if !state.patterns.contains(&pattern) {
            state.patterns.push(pattern.clone());
        }
        apply_fetch_patterns(&state).await?;

        let id = mock.id;
        state.mocks.push(mock);
        debug!(target_id, id, pattern = %pattern, "mock endpoint created");
        Ok(id)
    }

    /// Delete one mock endpoint by id, across all targets.
    ///
    /// # Errors
    ///
    /// `invalid-arguments` when no mock has that id.
    pub async fn delete_mock(&mut self, mock_id: u64) -> Result<(), ServerError> {
        for context in self.contexts.values() {
            let mut state = context.state.lock().await;
            if let Some(index) = state.mocks.iter().position(|m| m.id == mock_id) {
                state.mocks.remove(index);
                return Ok(());
            }
        }
        Err(ServerError::invalid_arguments(format!(
            "no mock endpoint with id {mock_id}"
        )))
    }

    /// Remove every mock endpoint on every target.
    pub async fn clear_mocks(&mut self) -> usize {
        let mut cleared = 0;
        for context in self.contexts.values() {
            let mut state = context.state.lock().await;
            cleared += state.mocks.len();
            state.mocks.clear();
        }
        cleared
    }

    /// All mock endpoints with their call counts.
    pub async fn list_mocks(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for (target_id, context) in &self.contexts {
            let state = context.state.lock().await;
            for mock in &state.mocks {
                out.push(json!({
                    "mockId": mock.id,
                    "targetId": target_id,
                    "urlPattern": mock.pattern,
                    "method": mock.method,
                    "statusCode": mock.status,
                    "latencyMs": mock.latency_ms,
                    "callCount": mock.call_count,
                }));
            }
        }
        out.sort_by_key(|m| m["mockId"].as_u64());
        out
    }

    /// Snapshot the pending queue and observed log for a target at a stage.
    pub async fn snapshot(&self, target_id: &str, stage: RuleStage) -> PendingSnapshot {
        let Some(context) = self.contexts.get(target_id) else {
            return PendingSnapshot {
                pending: Vec::new(),
                observed: Vec::new(),
                warnings: Vec::new(),
            };
        };
        let state = context.state.lock().await;
        let mut pending: Vec<PausedRequest> = state
            .pending
            .values()
            .filter(|r| r.stage == stage)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.paused_at.cmp(&b.paused_at));
        let observed = state
            .observed
            .iter()
            .filter(|r| r.stage == stage)
            .cloned()
            .collect();
        PendingSnapshot {
            pending,
            observed,
            warnings: state.warnings.clone(),
        }
    }

    /// Explicitly resume (or fail, or modify) one pending request.
    ///
    /// # Errors
    ///
    /// `invalid-arguments` when the request is not pending on that target.
    pub async fn resume_request(
        &mut self,
        target_id: &str,
        request_id: &str,
        modification: Option<super::rules::Modification>,
        fail: bool,
    ) -> Result<(), ServerError> {
        let context = self.contexts.get(target_id).ok_or_else(|| {
            ServerError::invalid_arguments(format!(
                "interception is not enabled on target {target_id}"
            ))
        })?;
        let mut state = context.state.lock().await;
        let Some(request) = state.pending.get(request_id).cloned() else {
            // The caller was waiting on this specific request: a watchdog
            // resume is their error to see, anything else is a bad id.
            let timed_out = state
                .observed
                .iter()
                .any(|r| r.request_id == request_id && r.disposition == Disposition::TimedOut);
            if timed_out {
                return Err(ServerError::new(
                    ErrorKind::InterceptionTimeout,
                    format!("request {request_id} aged past its deadline and was resumed as-is"),
                ));
            }
            return Err(ServerError::invalid_arguments(format!(
                "no pending request with id {request_id}"
            )));
        };

        if fail {
            finalize(
                &mut state,
                request_id,
                Disposition::Failed,
                "Fetch.failRequest",
                json!({ "requestId": request_id, "errorReason": "BlockedByClient" }),
            )
            .await;
            return Ok(());
        }

        match modification {
            Some(m) => dispatch_modify(&mut state, &request, &m).await,
            None => resume_as_is(&mut state, &request, Disposition::Resumed).await,
        }
        Ok(())
    }

    /// Start HAR recording on a target.
    ///
    /// # Errors
    ///
    /// Transport errors from `Network.enable`.
    pub async fn start_har(
        &mut self,
        sessions: &mut SessionManager,
        target_id: &str,
    ) -> Result<(), ServerError> {
        let context = self.context_for(sessions, target_id).await?;
        let mut state = context.lock().await;
        state
            .session
            .send_command("Network.enable", None)
            .await
            .map_err(ServerError::from)?;
        if state.har.is_none() {
            state.har = Some(HarRecorder::new());
        }
        Ok(())
    }

    /// Stop HAR recording: drain and clear the buffer. The drained entries
    /// are retained for `export_har_file`.
    ///
    /// # Errors
    ///
    /// `invalid-arguments` when recording was never started.
    pub async fn stop_har(
        &mut self,
        sessions: &mut SessionManager,
        target_id: &str,
    ) -> Result<Vec<HarEntry>, ServerError> {
        let Some(context) = self.contexts.get(target_id) else {
            return Err(ServerError::invalid_arguments(
                "HAR recording is not active on this target",
            ));
        };
        let entries = {
            let mut state = context.state.lock().await;
            let Some(mut recorder) = state.har.take() else {
                return Err(ServerError::invalid_arguments(
                    "HAR recording is not active on this target",
                ));
            };
            let entries = recorder.drain();
            state.har_drained.clone_from(&entries);
            entries
        };
        self.close_context_if_idle(sessions, target_id).await;
        Ok(entries)
    }

    /// Entries for HAR export: the live buffer when recording, otherwise
    /// the last drained set.
    pub async fn har_entries(&self, target_id: &str) -> Vec<HarEntry> {
        let Some(context) = self.contexts.get(target_id) else {
            return Vec::new();
        };
        let state = context.state.lock().await;
        state.har_drained.clone()
    }

    /// Toggle WebSocket frame capture on a target.
    ///
    /// # Errors
    ///
    /// Transport errors from `Network.enable`.
    pub async fn set_ws_capture(
        &mut self,
        sessions: &mut SessionManager,
        target_id: &str,
        enabled: bool,
    ) -> Result<(), ServerError> {
        if enabled {
            let context = self.context_for(sessions, target_id).await?;
            let mut state = context.lock().await;
            state
                .session
                .send_command("Network.enable", None)
                .await
                .map_err(ServerError::from)?;
            state.ws_capture = true;
        } else if let Some(context) = self.contexts.get(target_id) {
            {
                let mut state = context.state.lock().await;
                state.ws_capture = false;
            }
            self.close_context_if_idle(sessions, target_id).await;
        }
        Ok(())
    }

    /// Captured WebSocket frames, most recent last.
    pub async fn ws_messages(&self, target_id: &str, limit: usize) -> Vec<WsFrame> {
        let Some(context) = self.contexts.get(target_id) else {
            return Vec::new();
        };
        let state = context.state.lock().await;
        let start = state.ws_frames.len().saturating_sub(limit);
        state.ws_frames[start..].to_vec()
    }

    /// Whether any interception concern is active on the target.
    #[must_use]
    pub fn has_context(&self, target_id: &str) -> bool {
        self.contexts.contains_key(target_id)
    }

    /// Drain and tear down every context. Pending requests are resumed
    /// before any session closes; this must complete before the browser may
    /// be killed.
    pub async fn disable_all(&mut self, sessions: &mut SessionManager) {
        let target_ids: Vec<String> = self.contexts.keys().cloned().collect();
        for target_id in target_ids {
            if let Some(context) = self.contexts.remove(&target_id) {
                {
                    let mut state = context.state.lock().await;
                    drain_pending(&mut state).await;
                    let _ = state.session.send_command("Fetch.disable", None).await;
                }
                context.pump.abort();
                sessions
                    .close_persistent(&target_id, PersistentPurpose::Interception)
                    .await;
            }
        }
    }

    /// Get or create the context (and its persistent session + pump) for a
    /// target, returning the shared state handle.
    async fn context_for(
        &mut self,
        sessions: &mut SessionManager,
        target_id: &str,
    ) -> Result<Arc<Mutex<ContextState>>, ServerError> {
        if let Some(context) = self.contexts.get(target_id) {
            return Ok(Arc::clone(&context.state));
        }

        let session = sessions
            .persistent(target_id, PersistentPurpose::Interception)
            .await
            .map_err(ServerError::from)?;

        let state = Arc::new(Mutex::new(ContextState {
            target_id: target_id.to_string(),
            session: session.clone(),
            stage: None,
            patterns: Vec::new(),
            rules: Vec::new(),
            mocks: Vec::new(),
            pending: HashMap::new(),
            observed: Vec::new(),
            auto_continue: true,
            pause_timeout: DEFAULT_PAUSE_TIMEOUT,
            warnings: Vec::new(),
            har: None,
            har_drained: Vec::new(),
            ws_capture: false,
            ws_urls: HashMap::new(),
            ws_frames: Vec::new(),
        }));

        let pump = spawn_event_pump(&session, Arc::clone(&state))
            .await
            .map_err(ServerError::from)?;

        self.contexts.insert(
            target_id.to_string(),
            Context {
                state: Arc::clone(&state),
                pump,
            },
        );
        Ok(state)
    }

    /// Close the context and its persistent session when no concern needs
    /// it any more.
    async fn close_context_if_idle(&mut self, sessions: &mut SessionManager, target_id: &str) {
        let idle = {
            let Some(context) = self.contexts.get(target_id) else {
                return;
            };
            let state = context.state.lock().await;
            state.stage.is_none() && state.har.is_none() && !state.ws_capture
        };
        if idle {
            if let Some(context) = self.contexts.remove(target_id) {
                context.pump.abort();
            }
            sessions
                .close_persistent(target_id, PersistentPurpose::Interception)
                .await;
            debug!(target_id, "interception context closed");
        }
    }
}

fn mode_conflict(active: RuleStage, requested: RuleStage) -> ServerError {
    ServerError::new(
        ErrorKind::InterceptionModeConflict,
        format!(
            "{} interception is already active on overlapping patterns; cannot enable {} mode",
            active.cdp_name(),
            requested.cdp_name()
        ),
    )
    .with_hint("disable the active interception mode first")
}

/// (Re-)issue `Fetch.enable` with the context's current pattern set.
async fn apply_fetch_patterns(state: &ContextState) -> Result<(), ServerError> {
    let stage = state.stage.unwrap_or(RuleStage::Request);
    let patterns: Vec<Value> = if state.patterns.is_empty() {
        vec![json!({ "urlPattern": "*", "requestStage": stage.cdp_name() })]
    } else {
        state
            .patterns
            .iter()
            .map(|p| json!({ "urlPattern": p, "requestStage": stage.cdp_name() }))
            .collect()
    };
    state
        .session
        .send_command(
            "Fetch.enable",
            Some(json!({ "patterns": patterns, "handleAuthRequests": true })),
        )
        .await
        .map_err(ServerError::from)?;
    Ok(())
}

/// Subscribe the pump to every event the context consumes and spawn it.
async fn spawn_event_pump(
    session: &CdpSession,
    state: Arc<Mutex<ContextState>>,
) -> Result<JoinHandle<()>, crate::cdp::CdpError> {
    let mut paused_rx = session.subscribe("Fetch.requestPaused").await?;
    let mut auth_rx = session.subscribe("Fetch.authRequired").await?;
    let mut net_request_rx = session.subscribe("Network.requestWillBeSent").await?;
    let mut net_response_rx = session.subscribe("Network.responseReceived").await?;
    let mut net_finished_rx = session.subscribe("Network.loadingFinished").await?;
    let mut ws_created_rx = session.subscribe("Network.webSocketCreated").await?;
    let mut ws_sent_rx = session.subscribe("Network.webSocketFrameSent").await?;
    let mut ws_recv_rx = session.subscribe("Network.webSocketFrameReceived").await?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                event = paused_rx.recv() => {
                    let Some(event) = event else { break };
                    handle_request_paused(&state, &event).await;
                }
                event = auth_rx.recv() => {
                    let Some(event) = event else { break };
                    handle_auth_required(&state, &event).await;
                }
                event = net_request_rx.recv() => {
                    let Some(event) = event else { break };
                    feed_har(&state, "Network.requestWillBeSent", &event.params).await;
                }
                event = net_response_rx.recv() => {
                    let Some(event) = event else { break };
                    feed_har(&state, "Network.responseReceived", &event.params).await;
                }
                event = net_finished_rx.recv() => {
                    let Some(event) = event else { break };
                    feed_har(&state, "Network.loadingFinished", &event.params).await;
                }
                event = ws_created_rx.recv() => {
                    let Some(event) = event else { break };
                    handle_ws_created(&state, &event.params).await;
                }
                event = ws_sent_rx.recv() => {
                    let Some(event) = event else { break };
                    handle_ws_frame(&state, &event.params, "sent").await;
                }
                event = ws_recv_rx.recv() => {
                    let Some(event) = event else { break };
                    handle_ws_frame(&state, &event.params, "received").await;
                }
            }
        }
        debug!("interception pump ended");
    }))
}

async fn feed_har(state: &Arc<Mutex<ContextState>>, method: &str, params: &Value) {
    let mut state = state.lock().await;
    if let Some(har) = state.har.as_mut() {
        har.record_event(method, params);
    }
}

async fn handle_ws_created(state: &Arc<Mutex<ContextState>>, params: &Value) {
    let mut state = state.lock().await;
    if !state.ws_capture {
        return;
    }
    if let (Some(id), Some(url)) = (params["requestId"].as_str(), params["url"].as_str()) {
        state.ws_urls.insert(id.to_string(), url.to_string());
    }
}

async fn handle_ws_frame(
    state: &Arc<Mutex<ContextState>>,
    params: &Value,
    direction: &'static str,
) {
    let mut state = state.lock().await;
    if !state.ws_capture {
        return;
    }
    let url = params["requestId"]
        .as_str()
        .and_then(|id| state.ws_urls.get(id))
        .cloned()
        .unwrap_or_default();
    let frame = WsFrame {
        direction,
        url,
        opcode: params["response"]["opcode"].as_u64().unwrap_or(1),
        payload: params["response"]["payloadData"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        timestamp: timestamp_to_iso(params["timestamp"].as_f64().unwrap_or(0.0)),
    };
    state.ws_frames.push(frame);
    if state.ws_frames.len() > WS_FRAME_CAP {
        let excess = state.ws_frames.len() - WS_FRAME_CAP;
        state.ws_frames.drain(..excess);
    }
}

async fn handle_auth_required(state: &Arc<Mutex<ContextState>>, event: &CdpEvent) {
    let state = state.lock().await;
    let Some(request_id) = event.params["requestId"].as_str() else {
        return;
    };
    // Surface the browser's own prompt rather than answering for the user.
    let _ = state
        .session
        .send_command(
            "Fetch.continueWithAuth",
            Some(json!({
                "requestId": request_id,
                "authChallengeResponse": { "response": "Default" },
            })),
        )
        .await;
}

/// The dispatch state machine for one `Fetch.requestPaused` event.
async fn handle_request_paused(shared: &Arc<Mutex<ContextState>>, event: &CdpEvent) {
    let mut state = shared.lock().await;
    let params = &event.params;
    let Some(request_id) = params["requestId"].as_str() else {
        return;
    };
    let request_id = request_id.to_string();

    let stage = if params.get("responseStatusCode").is_some()
        || params.get("responseHeaders").is_some()
    {
        RuleStage::Response
    } else {
        RuleStage::Request
    };

    debug!(target_id = %state.target_id, request_id = %request_id, ?stage, "request paused");

    let mut paused = PausedRequest {
        request_id: request_id.clone(),
        url: params["request"]["url"].as_str().unwrap_or_default().to_string(),
        method: params["request"]["method"].as_str().unwrap_or("GET").to_string(),
        resource_type: params["resourceType"].as_str().unwrap_or_default().to_string(),
        stage,
        headers: params["request"]["headers"].clone(),
        post_data: params["request"]["postData"].as_str().map(String::from),
        response_status: params["responseStatusCode"]
            .as_u64()
            .and_then(|s| u16::try_from(s).ok()),
        rule_index: None,
        disposition: Disposition::Pending,
        paused_at: now_iso(),
        warning: None,
    };

    // Mocks shadow every rule, and only make sense before the request has
    // gone upstream.
    if stage == RuleStage::Request {
        let mock_hit = state
            .mocks
            .iter_mut()
            .find(|m| m.matches(&paused.url, &paused.method));
        if let Some(mock) = mock_hit {
            mock.call_count += 1;
            let (status, headers, body, latency) = (
                mock.status,
                mock.headers.clone(),
                mock.body.clone(),
                mock.latency_ms,
            );
            state.pending.insert(request_id.clone(), paused);
            dispatch_mock(&mut state, &request_id, status, &headers, &body, latency).await;
            return;
        }
    }

    let matched = state
        .rules
        .iter()
        .enumerate()
        .find(|(_, r)| r.matches(&paused.url, &paused.method, &paused.resource_type, stage))
        .map(|(i, r)| (i, r.action, r.modification.clone(), r.auto_continue));

    paused.rule_index = matched.as_ref().map(|(i, ..)| *i);
    state.pending.insert(request_id.clone(), paused.clone());

    // No match is an implicit observe: the pattern set decided the request
    // should pause, so the context policy decides what happens next.
    let (action, modification, rule_auto) = match matched {
        Some((_, action, modification, rule_auto)) => (action, modification, rule_auto),
        None => (RuleAction::Observe, super::rules::Modification::default(), None),
    };

    match action {
        RuleAction::Fail | RuleAction::Block => {
            finalize(
                &mut state,
                &request_id,
                Disposition::Failed,
                "Fetch.failRequest",
                json!({ "requestId": request_id, "errorReason": "BlockedByClient" }),
            )
            .await;
        }
        RuleAction::Mock => {
            // A mock-action rule behaves like an inline mock endpoint.
            let status = modification.set_status.unwrap_or(200);
            let body = modification.set_body.clone().unwrap_or_default();
            let headers = modification.add_headers.clone();
            let latency = modification.latency_ms.unwrap_or(0);
            dispatch_mock(&mut state, &request_id, status, &headers, &body, latency).await;
        }
        RuleAction::Modify => {
            dispatch_modify(&mut state, &paused, &modification).await;
        }
        RuleAction::Delay => {
            let delay = Duration::from_millis(modification.latency_ms.unwrap_or(0));
            spawn_delayed_resume(shared, &request_id, delay);
        }
        RuleAction::Observe => {
            if rule_auto.unwrap_or(state.auto_continue) {
                resume_as_is(&mut state, &paused, Disposition::Resumed).await;
            } else {
                // Left pending for the caller; the watchdog guarantees the
                // terminal invariant if nobody acts.
                let timeout = state.pause_timeout;
                spawn_watchdog(shared, &request_id, timeout);
            }
        }
    }
}

/// Serve a mock response, honoring its latency.
async fn dispatch_mock(
    state: &mut ContextState,
    request_id: &str,
    status: u16,
    headers: &BTreeMap<String, String>,
    body: &str,
    latency_ms: u64,
) {
    if latency_ms > 0 {
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;
    }
    let header_array: Vec<Value> = headers
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    let encoded = base64::engine::general_purpose::STANDARD.encode(body.as_bytes());
    finalize(
        state,
        request_id,
        Disposition::Mocked,
        "Fetch.fulfillRequest",
        json!({
            "requestId": request_id,
            "responseCode": status,
            "responseHeaders": header_array,
            "body": encoded,
        }),
    )
    .await;
}

/// Forward a request/response with the rule's modifications applied.
async fn dispatch_modify(
    state: &mut ContextState,
    paused: &PausedRequest,
    modification: &super::rules::Modification,
) {
    if let Some(latency) = modification.latency_ms {
        tokio::time::sleep(Duration::from_millis(latency)).await;
    }

    match paused.stage {
        RuleStage::Request => {
            let mut params = json!({ "requestId": paused.request_id });
            let merged = merge_headers(&paused.headers, modification);
            params["headers"] = Value::Array(merged);
            if let Some(method) = &modification.set_method {
                params["method"] = json!(method);
            }
            if let Some(body) = &modification.set_body {
                params["postData"] =
                    json!(base64::engine::general_purpose::STANDARD.encode(body.as_bytes()));
            }
            finalize(
                state,
                &paused.request_id,
                Disposition::Modified,
                "Fetch.continueRequest",
                params,
            )
            .await;
        }
        RuleStage::Response => {
            // Body replacement wins; otherwise fetch the original so the
            // fulfill carries it through unchanged.
            let body = if let Some(body) = &modification.set_body {
                base64::engine::general_purpose::STANDARD.encode(body.as_bytes())
            } else {
                match state
                    .session
                    .send_command(
                        "Fetch.getResponseBody",
                        Some(json!({ "requestId": paused.request_id })),
                    )
                    .await
                {
                    Ok(result) => {
                        let raw = result["body"].as_str().unwrap_or_default();
                        if result["base64Encoded"].as_bool().unwrap_or(false) {
                            raw.to_string()
                        } else {
                            base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
                        }
                    }
                    Err(e) => {
                        warn!(request_id = %paused.request_id, "getResponseBody failed: {e}");
                        String::new()
                    }
                }
            };

            let status = modification
                .set_status
                .or(paused.response_status)
                .unwrap_or(200);
            let merged = merge_headers(&paused.headers, modification);
            finalize(
                state,
                &paused.request_id,
                Disposition::Modified,
                "Fetch.fulfillRequest",
                json!({
                    "requestId": paused.request_id,
                    "responseCode": status,
                    "responseHeaders": merged,
                    "body": body,
                }),
            )
            .await;
        }
    }
}

/// Resume a paused request unchanged, at whichever stage it is paused.
async fn resume_as_is(state: &mut ContextState, paused: &PausedRequest, disposition: Disposition) {
    let method = match paused.stage {
        RuleStage::Request => "Fetch.continueRequest",
        RuleStage::Response => "Fetch.continueResponse",
    };
    finalize(
        state,
        &paused.request_id,
        disposition,
        method,
        json!({ "requestId": paused.request_id }),
    )
    .await;
}

/// Apply exactly one terminal disposition to a pending request.
///
/// A watchdog, a drain, and an explicit resume can all race here; exactly
/// one terminal CDP call is issued per paused request.
async fn finalize(
    state: &mut ContextState,
    request_id: &str,
    disposition: Disposition,
    method: &str,
    params: Value,
) {
    // Removal from the pending map is the check-and-set: whoever removes
    // the entry issues the one terminal call; later racers find nothing.
    let Some(mut record) = state.pending.remove(request_id) else {
        return;
    };
    record.disposition = disposition;

    if let Err(e) = state.session.send_command(method, Some(params)).await {
        // The request may already be gone (navigation, target closed); the
        // disposition still counts as issued.
        debug!(request_id, "terminal call {method} failed: {e}");
        record.warning.get_or_insert_with(|| format!("{method} failed: {e}"));
    }

    state.observed.push(record);
    if state.observed.len() > OBSERVED_LOG_CAP {
        let excess = state.observed.len() - OBSERVED_LOG_CAP;
        state.observed.drain(..excess);
    }
}

/// Resume every still-pending request unmodified. Runs before the context
/// or the browser goes away.
async fn drain_pending(state: &mut ContextState) {
    let pending: Vec<PausedRequest> = state.pending.values().cloned().collect();
    for request in pending {
        resume_as_is(state, &request, Disposition::Resumed).await;
    }
}

/// Watchdog for the terminal invariant: after the context timeout, a
/// still-pending request is resumed as-is and a warning recorded.
fn spawn_watchdog(shared: &Arc<Mutex<ContextState>>, request_id: &str, timeout: Duration) {
    let shared = Arc::clone(shared);
    let request_id = request_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let mut state = shared.lock().await;
        let Some(paused) = state.pending.get(&request_id).cloned() else {
            return;
        };
        warn!(request_id = %request_id, url = %paused.url, "paused request timed out, resuming as-is");
        state.warnings.push(format!(
            "request {request_id} ({}) aged past {}ms and was resumed unmodified",
            paused.url,
            timeout.as_millis()
        ));
        resume_as_is(&mut state, &paused, Disposition::TimedOut).await;
        if let Some(record) = state.observed.last_mut() {
            if record.request_id == request_id {
                record.warning = Some("resumed by timeout".into());
            }
        }
    });
}

/// Single scheduled resume for a delay rule.
fn spawn_delayed_resume(shared: &Arc<Mutex<ContextState>>, request_id: &str, delay: Duration) {
    let shared = Arc::clone(shared);
    let request_id = request_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut state = shared.lock().await;
        let Some(paused) = state.pending.get(&request_id).cloned() else {
            return;
        };
        resume_as_is(&mut state, &paused, Disposition::Resumed).await;
    });
}

/// Merge original request/response headers with a modification's adds and
/// removes into the CDP header-entry array form.
fn merge_headers(original: &Value, modification: &super::rules::Modification) -> Vec<Value> {
    let mut merged: Vec<(String, String)> = Vec::new();

    match original {
        // Request headers arrive as an object.
        Value::Object(map) => {
            for (name, value) in map {
                merged.push((name.clone(), value.as_str().unwrap_or_default().to_string()));
            }
        }
        // Response headers arrive as a [{name, value}] array.
        Value::Array(entries) => {
            for entry in entries {
                if let (Some(name), Some(value)) =
                    (entry["name"].as_str(), entry["value"].as_str())
                {
                    merged.push((name.to_string(), value.to_string()));
                }
            }
        }
        _ => {}
    }

    merged.retain(|(name, _)| {
        !modification
            .remove_headers
            .iter()
            .any(|r| r.eq_ignore_ascii_case(name))
            && !modification
                .add_headers
                .keys()
                .any(|a| a.eq_ignore_ascii_case(name))
    });
    for (name, value) in &modification.add_headers {
        merged.push((name.clone(), value.clone()));
    }

    merged
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect()
}

fn now_iso() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    timestamp_to_iso(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn modification(
        add: &[(&str, &str)],
        remove: &[&str],
    ) -> super::super::rules::Modification {
        super::super::rules::Modification {
            add_headers: add
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            remove_headers: remove.iter().map(|r| (*r).to_string()).collect(),
            ..Default::default()
        }
    }

    fn header_value<'a>(merged: &'a [Value], name: &str) -> Option<&'a str> {
        merged
            .iter()
            .find(|h| h["name"].as_str().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .and_then(|h| h["value"].as_str())
    }

    #[test]
    fn merge_preserves_cookie_and_adds_new_header() {
        let original = json!({
            "Cookie": "session=abc123",
            "Accept": "application/json",
        });
        let merged = merge_headers(&original, &modification(&[("X-Test", "1")], &[]));
        assert_eq!(header_value(&merged, "Cookie"), Some("session=abc123"));
        assert_eq!(header_value(&merged, "Accept"), Some("application/json"));
        assert_eq!(header_value(&merged, "X-Test"), Some("1"));
    }

    #[test]
    fn merge_overrides_case_insensitively() {
        let original = json!({ "user-agent": "real-browser" });
        let merged = merge_headers(&original, &modification(&[("User-Agent", "other")], &[]));
        assert_eq!(merged.len(), 1);
        assert_eq!(header_value(&merged, "user-agent"), Some("other"));
    }

    #[test]
    fn merge_removes_requested_headers() {
        let original = json!({ "Referer": "https://a/", "Accept": "*/*" });
        let merged = merge_headers(&original, &modification(&[], &["referer"]));
        assert!(header_value(&merged, "Referer").is_none());
        assert_eq!(header_value(&merged, "Accept"), Some("*/*"));
    }

    #[test]
    fn merge_handles_response_header_arrays() {
        let original = json!([
            { "name": "Content-Type", "value": "text/html" },
            { "name": "Server", "value": "nginx" },
        ]);
        let merged = merge_headers(&original, &modification(&[("X-Injected", "yes")], &["server"]));
        assert_eq!(header_value(&merged, "Content-Type"), Some("text/html"));
        assert!(header_value(&merged, "Server").is_none());
        assert_eq!(header_value(&merged, "X-Injected"), Some("yes"));
    }

    #[test]
    fn mode_conflict_error_names_both_modes() {
        let err = mode_conflict(RuleStage::Response, RuleStage::Request);
        assert_eq!(err.kind, ErrorKind::InterceptionModeConflict);
        assert!(err.message.contains("Response"));
        assert!(err.message.contains("Request"));
    }

    #[test]
    fn now_iso_is_well_formed() {
        let ts = now_iso();
        assert_eq!(ts.len(), 24);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[10..11], "T");
    }
}
