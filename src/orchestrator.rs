use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cdp::{CdpClient, CdpConfig};
use crate::chrome::{
    self, ManagedProcess, ProfileRequest, ShadowProfile, SpawnOutcome, ensure_browser,
};
use crate::config::Config;
use crate::error::ServerError;
use crate::intercept::InterceptionEngine;
use crate::sessions::SessionManager;
use crate::stealth::install_stealth;
use crate::targets::{TargetKind, TargetRegistry, spawn_target_pump};

/// Shared server state: one of these per process, behind a mutex that every
/// tool call and background supervisor locks.
pub type SharedState = Arc<Mutex<ServerState>>;

pub struct ServerState {
    pub config: Config,
    pub instance: Option<BrowserInstance>,
    pub advanced_tools: bool,
}

impl ServerState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            instance: None,
            advanced_tools: false,
        }
    }

    /// The connected instance, or the refusal error.
    ///
    /// # Errors
    ///
    /// `not-connected` when no instance exists.
    pub fn instance_mut(&mut self) -> Result<&mut BrowserInstance, ServerError> {
        self.instance.as_mut().ok_or_else(ServerError::not_connected)
    }
}

/// The singleton connection to one browser.
pub struct BrowserInstance {
    /// Debugging port; immutable once chosen.
    pub port: u16,
    pub ws_url: String,
    pub client: CdpClient,
    /// Present only for a browser this server spawned. An externally
    /// managed browser we merely attached to has no handle.
    pub process: Option<ManagedProcess>,
    pub shadow: Option<ShadowProfile>,
    /// Fingerprint seed drawn once per connection.
    pub stealth_seed: u32,
    /// Page targets that already received the stealth script.
    pub stealth_applied: HashSet<String>,
    pub targets: Arc<Mutex<TargetRegistry>>,
    pub sessions: SessionManager,
    pub engine: InterceptionEngine,
    pumps: Vec<JoinHandle<()>>,
}

/// Result of `launch_with_profile`, serialized into the tool result.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchInfo {
    pub debugging_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// True when an already-running browser was adopted instead of spawned.
    pub attached: bool,
    /// True when the call found an existing connection and only foregrounded
    /// the window.
    pub already_connected: bool,
}

/// Ensure a working connection exists, without ever launching.
///
/// An existing instance is re-verified with a cheap version query; a dead
/// one is torn down. With no instance, a real browser answering on the port
/// is attached; a free port or a look-alike is refused.
///
/// # Errors
///
/// `not-connected` when nothing is answering (hint: `launch_with_profile`);
/// `port-not-browser` for look-alikes; transport errors from attach.
pub async fn ensure_connected(state: &SharedState) -> Result<(), ServerError> {
    let mut server = state.lock().await;
    let port = server.config.port;

    if let Some(instance) = server.instance.as_ref() {
        // The HTTP probe proves the browser is alive; the transport flag
        // proves our channel to it still is. Either failing means rebuild.
        let transport_alive = instance.client.is_connected();
        match chrome::query_version("127.0.0.1", port).await {
            Ok(_) if transport_alive => {
                ensure_some_page(&mut server, port).await?;
                return Ok(());
            }
            Ok(_) => {
                warn!(port, "transport gone while browser lives, reconnecting");
                teardown_instance(&mut server).await;
            }
            Err(_) => {
                warn!(port, "browser stopped answering, tearing down");
                teardown_instance(&mut server).await;
            }
        }
    }

    match chrome::query_version("127.0.0.1", port).await {
        Ok(version) => {
            if !chrome::is_real_chromium(&version) {
                return Err(ServerError::port_not_browser(port, &version.browser));
            }
            let instance =
                connect_instance(state, port, version.ws_debugger_url, None, None).await?;
            server.instance = Some(instance);
            ensure_some_page(&mut server, port).await?;
            Ok(())
        }
        // The port is free: refuse. Launching is an explicit, user-visible
        // act, never a side effect of a reconnecting agent.
        Err(_) => Err(ServerError::not_connected()),
    }
}

/// Create a blank page when the browser has zero page targets.
async fn ensure_some_page(server: &mut ServerState, port: u16) -> Result<(), ServerError> {
    let Some(instance) = server.instance.as_mut() else {
        return Ok(());
    };
    let has_page = {
        let registry = instance.targets.lock().await;
        !registry.pages().is_empty()
    };
    if has_page {
        return Ok(());
    }
    // Fall back to enumeration before opening anything; the discovery pump
    // may simply not have caught up yet.
    let summaries = chrome::query_targets("127.0.0.1", port)
        .await
        .map_err(ServerError::from)?;
    {
        let mut registry = instance.targets.lock().await;
        registry.sync_from_enumeration(&summaries);
        if !registry.pages().is_empty() {
            return Ok(());
        }
    }
    let opened = chrome::open_page("127.0.0.1", port, "about:blank")
        .await
        .map_err(ServerError::from)?;
    let mut registry = instance.targets.lock().await;
    registry.upsert(&opened.id, TargetKind::Page, &opened.url, &opened.title);
    Ok(())
}

/// Unconditionally (re)create the browser instance.
///
/// Already connected without `force` only brings the window forward;
/// `force` disconnects first. Stealth is applied automatically after a
/// successful launch.
///
/// # Errors
///
/// `chromium-not-found`, `browser-failed-to-start`, `port-not-browser`, or
/// transport errors.
pub async fn launch_with_profile(
    state: &SharedState,
    request: ProfileRequest,
    force: bool,
) -> Result<LaunchInfo, ServerError> {
    let mut server = state.lock().await;
    let port = server.config.port;

    if server.instance.is_some() {
        if force {
            teardown_instance(&mut server).await;
        } else {
            foreground_window(&server, port).await;
            return Ok(LaunchInfo {
                debugging_port: port,
                pid: server
                    .instance
                    .as_ref()
                    .and_then(|i| i.process.as_ref().map(ManagedProcess::pid)),
                attached: false,
                already_connected: true,
            });
        }
    }

    let outcome = ensure_browser(port, &request).await?;
    let (ws_url, process, shadow, attached) = match outcome {
        SpawnOutcome::Attached { ws_url } => (ws_url, None, None, true),
        SpawnOutcome::Spawned {
            ws_url,
            process,
            shadow,
        } => (ws_url, Some(process), shadow, false),
    };
    let pid = process.as_ref().map(ManagedProcess::pid);

    let instance = connect_instance(state, port, ws_url, process, shadow).await?;
    server.instance = Some(instance);
    ensure_some_page(&mut server, port).await?;

    // Stealth rides along with every launch; the tool exists for re-installs.
    if let Some(instance) = server.instance.as_mut() {
        if let Err(e) = apply_stealth(instance, false).await {
            warn!("stealth install after launch failed: {e}");
        }
    }

    Ok(LaunchInfo {
        debugging_port: port,
        pid,
        attached,
        already_connected: false,
    })
}

/// Bring the most recently active page's window to the foreground.
async fn foreground_window(server: &ServerState, port: u16) {
    let Some(instance) = server.instance.as_ref() else {
        return;
    };
    let target_id = {
        let registry = instance.targets.lock().await;
        registry.resolve(None).ok().map(|t| t.id)
    };
    if let Some(id) = target_id {
        let _ = chrome::activate_target("127.0.0.1", port, &id).await;
    }
}

/// Close the browser: drain interception, close sessions, close the
/// transport, and kill the process tree if we own one. This is the only
/// code path that terminates the browser.
pub async fn close_browser(state: &SharedState) -> Result<Option<u32>, ServerError> {
    let mut server = state.lock().await;
    let Some(mut instance) = server.instance.take() else {
        return Ok(None);
    };

    instance
        .engine
        .disable_all(&mut instance.sessions)
        .await;
    instance.sessions.close_all().await;
    let _ = instance.client.close().await;
    for pump in &instance.pumps {
        pump.abort();
    }

    let killed = match instance.process.as_mut() {
        Some(process) => {
            let pid = process.pid();
            process.kill().await;
            info!(pid, "browser process terminated");
            Some(pid)
        }
        None => None,
    };
    Ok(killed)
}

/// Tear down all downstream state without touching the process. Used when
/// the transport dies or the browser stops answering.
pub async fn teardown_instance(server: &mut ServerState) {
    let Some(mut instance) = server.instance.take() else {
        return;
    };
    instance
        .engine
        .disable_all(&mut instance.sessions)
        .await;
    instance.sessions.close_all().await;
    let _ = instance.client.close().await;
    for pump in &instance.pumps {
        pump.abort();
    }
    info!(port = instance.port, "instance torn down");
}

/// Install the stealth script on every page target that has not received
/// it yet (or on all of them with `force`). Returns how many targets were
/// patched.
///
/// # Errors
///
/// Returns the first `CdpError` from a registration command.
pub async fn apply_stealth(
    instance: &mut BrowserInstance,
    force: bool,
) -> Result<usize, ServerError> {
    let page_ids: Vec<String> = {
        let registry = instance.targets.lock().await;
        registry.pages().iter().map(|t| t.id.clone()).collect()
    };

    let mut patched = 0;
    for target_id in page_ids {
        if !force && instance.stealth_applied.contains(&target_id) {
            continue;
        }
        let session = instance
            .sessions
            .ephemeral(&target_id)
            .await
            .map_err(ServerError::from)?;
        install_stealth(&session, instance.stealth_seed)
            .await
            .map_err(ServerError::from)?;
        instance.stealth_applied.insert(target_id);
        patched += 1;
    }
    Ok(patched)
}

/// Build a `BrowserInstance` around a verified ws endpoint: connect the
/// root client, start target discovery, seed the registry, and attach the
/// process exit supervisor when we own the process.
async fn connect_instance(
    state: &SharedState,
    port: u16,
    ws_url: String,
    mut process: Option<ManagedProcess>,
    shadow: Option<ShadowProfile>,
) -> Result<BrowserInstance, ServerError> {
    let client = CdpClient::connect(&ws_url, CdpConfig::default())
        .await
        .map_err(ServerError::from)?;

    let targets = Arc::new(Mutex::new(TargetRegistry::new()));
    let mut pumps = Vec::new();
    let pump = spawn_target_pump(&client, Arc::clone(&targets))
        .await
        .map_err(ServerError::from)?;
    pumps.push(pump);

    if let Ok(summaries) = chrome::query_targets("127.0.0.1", port).await {
        targets.lock().await.sync_from_enumeration(&summaries);
    }

    if let Some(process) = process.as_mut() {
        if let Some(child) = process.take_child() {
            pumps.push(spawn_exit_supervisor(state, port, child));
        }
    }

    Ok(BrowserInstance {
        port,
        ws_url,
        client: client.clone(),
        process,
        shadow,
        stealth_seed: rand::random::<u32>(),
        stealth_applied: HashSet::new(),
        targets,
        sessions: SessionManager::new(client),
        engine: InterceptionEngine::new(),
        pumps,
    })
}

/// Watch the spawned child. Chromium sometimes re-parents its window
/// process and the spawn handle dies while the browser keeps running, so
/// on exit the port is re-probed once: still a real Chromium means only
/// the handle is dropped; otherwise everything is torn down.
fn spawn_exit_supervisor(
    state: &SharedState,
    port: u16,
    mut child: tokio::process::Child,
) -> JoinHandle<()> {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let status = child.wait().await;
        info!(port, ?status, "spawn handle exited, re-probing port");

        let still_browser = matches!(
            chrome::query_version("127.0.0.1", port).await,
            Ok(version) if chrome::is_real_chromium(&version)
        );

        let mut server = state.lock().await;
        let Some(instance) = server.instance.as_mut() else {
            return;
        };
        if instance.port != port {
            return;
        }
        if still_browser {
            info!(port, "browser survived handle exit, keeping instance");
            instance.process = None;
        } else {
            teardown_instance(&mut server).await;
        }
    })
}
