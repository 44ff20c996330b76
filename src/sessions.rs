use std::collections::{HashMap, HashSet};

use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::cdp::{CdpClient, CdpError, CdpSession};

/// Maximum number of cached ephemeral sessions.
const EPHEMERAL_CAPACITY: usize = 8;

/// How long an unused ephemeral session stays attached.
const EPHEMERAL_TTL: Duration = Duration::from_secs(30);

/// Why a persistent session exists. At most one persistent session per
/// (target id, purpose) tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistentPurpose {
    /// Owned by the interception engine while interception is enabled.
    Interception,
}

struct EphemeralEntry {
    session: CdpSession,
    last_used: Instant,
}

/// Pool of CDP sessions keyed by target id.
///
/// Ephemeral sessions are cached (LRU, short TTL) and owned by whichever
/// tool call is running; persistent sessions have an explicit lifetime and
/// a single owner, the interception engine. Dropping the whole manager is
/// how instance teardown clears downstream session state atomically.
pub struct SessionManager {
    client: CdpClient,
    ephemeral: HashMap<String, EphemeralEntry>,
    persistent: HashMap<(String, PersistentPurpose), CdpSession>,
}

impl SessionManager {
    #[must_use]
    pub fn new(client: CdpClient) -> Self {
        Self {
            client,
            ephemeral: HashMap::new(),
            persistent: HashMap::new(),
        }
    }

    /// Obtain an ephemeral session for a target, reusing a cached one when
    /// present.
    ///
    /// # Errors
    ///
    /// Returns `CdpError` if attaching to the target fails.
    pub async fn ephemeral(&mut self, target_id: &str) -> Result<CdpSession, CdpError> {
        self.sweep_expired();

        if let Some(entry) = self.ephemeral.get_mut(target_id) {
            entry.last_used = Instant::now();
            return Ok(entry.session.clone());
        }

        let session = self.client.attach(target_id).await?;
        self.evict_if_full().await;
        self.ephemeral.insert(
            target_id.to_string(),
            EphemeralEntry {
                session: session.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(session)
    }

    /// Close the ephemeral session for a target. Idempotent: closing a
    /// target without one is a no-op.
    pub async fn close_ephemeral(&mut self, target_id: &str) {
        if let Some(entry) = self.ephemeral.remove(target_id) {
            entry.session.detach().await;
        }
    }

    /// Create (or return) the persistent session for a (target, purpose).
    ///
    /// # Errors
    ///
    /// Returns `CdpError` if attaching to the target fails.
    pub async fn persistent(
        &mut self,
        target_id: &str,
        purpose: PersistentPurpose,
    ) -> Result<CdpSession, CdpError> {
        let key = (target_id.to_string(), purpose);
        if let Some(session) = self.persistent.get(&key) {
            return Ok(session.clone());
        }
        let session = self.client.attach(target_id).await?;
        debug!(target_id, ?purpose, "persistent session created");
        self.persistent.insert(key, session.clone());
        Ok(session)
    }

    /// Close the persistent session for a (target, purpose), detaching all
    /// its event subscribers. Idempotent.
    pub async fn close_persistent(&mut self, target_id: &str, purpose: PersistentPurpose) {
        let key = (target_id.to_string(), purpose);
        if let Some(session) = self.persistent.remove(&key) {
            session.detach().await;
            debug!(target_id, ?purpose, "persistent session closed");
        }
    }

    /// Whether a persistent session currently exists for the tuple.
    #[must_use]
    pub fn has_persistent(&self, target_id: &str, purpose: PersistentPurpose) -> bool {
        self.persistent
            .contains_key(&(target_id.to_string(), purpose))
    }

    /// Drop sessions for a target that no longer exists. Detach is skipped;
    /// the browser already tore the channel down with the target.
    pub fn forget_target(&mut self, target_id: &str) {
        self.ephemeral.remove(target_id);
        self.persistent.retain(|(tid, _), _| tid != target_id);
    }

    /// Close everything. Called on instance teardown and server shutdown.
    pub async fn close_all(&mut self) {
        for (_, entry) in self.ephemeral.drain() {
            entry.session.detach().await;
        }
        let persistent: Vec<_> = self.persistent.drain().collect();
        for (_, session) in persistent {
            session.detach().await;
        }
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        self.ephemeral
            .retain(|_, entry| now.duration_since(entry.last_used) < EPHEMERAL_TTL);
    }

    async fn evict_if_full(&mut self) {
        if self.ephemeral.len() < EPHEMERAL_CAPACITY {
            return;
        }
        let oldest = self
            .ephemeral
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.close_ephemeral(&id).await;
        }
    }
}

/// A session wrapper that tracks which CDP domains have been enabled, so
/// each `{domain}.enable` is sent at most once per session.
#[derive(Debug)]
pub struct ManagedSession {
    session: CdpSession,
    enabled_domains: HashSet<String>,
}

impl ManagedSession {
    #[must_use]
    pub fn new(session: CdpSession) -> Self {
        Self {
            session,
            enabled_domains: HashSet::new(),
        }
    }

    /// Ensure a CDP domain is enabled.
    ///
    /// # Errors
    ///
    /// Returns `CdpError` if the enable command fails.
    pub async fn ensure_domain(&mut self, domain: &str) -> Result<(), CdpError> {
        if self.enabled_domains.contains(domain) {
            return Ok(());
        }
        let method = format!("{domain}.enable");
        self.session.send_command(&method, None).await?;
        self.enabled_domains.insert(domain.to_string());
        Ok(())
    }

    /// Send a command within this session.
    ///
    /// # Errors
    ///
    /// Returns `CdpError` if the command fails.
    pub async fn send_command(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CdpError> {
        self.session.send_command(method, params).await
    }

    /// Subscribe to events within this session.
    ///
    /// # Errors
    ///
    /// Returns `CdpError` if the transport task has exited.
    pub async fn subscribe(
        &self,
        method: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<crate::cdp::CdpEvent>, CdpError> {
        self.session.subscribe(method).await
    }

    #[must_use]
    pub fn session(&self) -> &CdpSession {
        &self.session
    }

    #[must_use]
    pub fn enabled_domains(&self) -> &HashSet<String> {
        &self.enabled_domains
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Mock CDP endpoint: answers attachToTarget with a session id derived
    /// from the target id, and `{}` for everything else.
    async fn start_mock_browser() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    let (mut sink, mut source) = ws.split();
                    while let Some(Ok(Message::Text(text))) = source.next().await {
                        let cmd: serde_json::Value = serde_json::from_str(&text).unwrap();
                        let response = if cmd["method"] == "Target.attachToTarget" {
                            let tid = cmd["params"]["targetId"].as_str().unwrap_or("t");
                            serde_json::json!({
                                "id": cmd["id"],
                                "result": {"sessionId": format!("sess-{tid}")}
                            })
                        } else {
                            let mut r = serde_json::json!({"id": cmd["id"], "result": {}});
                            if let Some(sid) = cmd.get("sessionId") {
                                r["sessionId"] = sid.clone();
                            }
                            r
                        };
                        let _ = sink.send(Message::Text(response.to_string().into())).await;
                    }
                });
            }
        });
        addr
    }

    async fn connect(addr: std::net::SocketAddr) -> CdpClient {
        CdpClient::connect(&format!("ws://{addr}"), crate::cdp::CdpConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ephemeral_sessions_are_reused() {
        let addr = start_mock_browser().await;
        let mut manager = SessionManager::new(connect(addr).await);

        let first = manager.ephemeral("tab-1").await.unwrap();
        let second = manager.ephemeral("tab-1").await.unwrap();
        assert_eq!(first.session_id(), second.session_id());
    }

    #[tokio::test]
    async fn distinct_targets_get_distinct_sessions() {
        let addr = start_mock_browser().await;
        let mut manager = SessionManager::new(connect(addr).await);

        let a = manager.ephemeral("tab-a").await.unwrap();
        let b = manager.ephemeral("tab-b").await.unwrap();
        assert_ne!(a.session_id(), b.session_id());
    }

    #[tokio::test]
    async fn close_ephemeral_is_idempotent() {
        let addr = start_mock_browser().await;
        let mut manager = SessionManager::new(connect(addr).await);

        let _ = manager.ephemeral("tab-1").await.unwrap();
        manager.close_ephemeral("tab-1").await;
        manager.close_ephemeral("tab-1").await;
        manager.close_ephemeral("never-existed").await;
    }

    #[tokio::test]
    async fn persistent_is_unique_per_purpose() {
        let addr = start_mock_browser().await;
        let mut manager = SessionManager::new(connect(addr).await);

        let first = manager
            .persistent("tab-1", PersistentPurpose::Interception)
            .await
            .unwrap();
        let second = manager
            .persistent("tab-1", PersistentPurpose::Interception)
            .await
            .unwrap();
        assert_eq!(first.session_id(), second.session_id());
        assert!(manager.has_persistent("tab-1", PersistentPurpose::Interception));
    }

    #[tokio::test]
    async fn close_persistent_removes_the_entry() {
        let addr = start_mock_browser().await;
        let mut manager = SessionManager::new(connect(addr).await);

        let _ = manager
            .persistent("tab-1", PersistentPurpose::Interception)
            .await
            .unwrap();
        manager
            .close_persistent("tab-1", PersistentPurpose::Interception)
            .await;
        assert!(!manager.has_persistent("tab-1", PersistentPurpose::Interception));
    }

    #[tokio::test]
    async fn forget_target_drops_both_tables() {
        let addr = start_mock_browser().await;
        let mut manager = SessionManager::new(connect(addr).await);

        let _ = manager.ephemeral("tab-1").await.unwrap();
        let _ = manager
            .persistent("tab-1", PersistentPurpose::Interception)
            .await
            .unwrap();
        manager.forget_target("tab-1");
        assert!(!manager.has_persistent("tab-1", PersistentPurpose::Interception));
    }

    #[tokio::test]
    async fn managed_session_enables_domain_once() {
        let addr = start_mock_browser().await;
        let client = connect(addr).await;
        let session = client.attach("tab-1").await.unwrap();
        let mut managed = ManagedSession::new(session);

        managed.ensure_domain("Page").await.unwrap();
        managed.ensure_domain("Page").await.unwrap();
        managed.ensure_domain("Network").await.unwrap();
        assert_eq!(managed.enabled_domains().len(), 2);
    }
}
