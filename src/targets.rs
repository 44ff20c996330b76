use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cdp::{CdpClient, CdpError};
use crate::chrome::TargetSummary;
use crate::error::ServerError;

/// Classification of a debuggable target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Page,
    ServiceWorker,
    BackgroundPage,
    Browser,
    Other(String),
}

impl TargetKind {
    #[must_use]
    pub fn parse(kind: &str) -> Self {
        match kind {
            "page" => Self::Page,
            "service_worker" => Self::ServiceWorker,
            "background_page" => Self::BackgroundPage,
            "browser" => Self::Browser,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Page => "page",
            Self::ServiceWorker => "service_worker",
            Self::BackgroundPage => "background_page",
            Self::Browser => "browser",
            Self::Other(s) => s,
        }
    }
}

/// One live target as observed from the browser. The registry never
/// fabricates these; they enter via discovery events or enumeration.
#[derive(Debug, Clone)]
pub struct Target {
    pub id: String,
    pub kind: TargetKind,
    pub url: String,
    pub title: String,
    /// Ordinal of the most recent activation we observed; higher is newer.
    pub activated_at: u64,
    /// Insertion order, for the enumeration-order fallback.
    pub discovered_at: u64,
}

/// Live map of target id to target record.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: HashMap<String, Target>,
    clock: u64,
}

impl TargetRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Record a created or enumerated target. Existing entries keep their
    /// activation ordinal.
    pub fn upsert(&mut self, id: &str, kind: TargetKind, url: &str, title: &str) {
        let ordinal = self.tick();
        self.targets
            .entry(id.to_string())
            .and_modify(|t| {
                t.kind = kind.clone();
                t.url = url.to_string();
                t.title = title.to_string();
            })
            .or_insert_with(|| Target {
                id: id.to_string(),
                kind,
                url: url.to_string(),
                title: title.to_string(),
                activated_at: 0,
                discovered_at: ordinal,
            });
    }

    pub fn remove(&mut self, id: &str) {
        self.targets.remove(id);
    }

    /// Mark a target as the most recently activated.
    pub fn note_activated(&mut self, id: &str) {
        let ordinal = self.tick();
        if let Some(target) = self.targets.get_mut(id) {
            target.activated_at = ordinal;
        }
    }

    /// Replace the registry contents from a `/json/list` enumeration,
    /// preserving activation ordinals for ids that survive.
    pub fn sync_from_enumeration(&mut self, summaries: &[TargetSummary]) {
        let live: std::collections::HashSet<&str> =
            summaries.iter().map(|s| s.id.as_str()).collect();
        self.targets.retain(|id, _| live.contains(id.as_str()));
        for summary in summaries {
            self.upsert(
                &summary.id,
                TargetKind::parse(&summary.kind),
                &summary.url,
                &summary.title,
            );
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Target> {
        self.targets.get(id)
    }

    /// All page targets, enumeration order.
    #[must_use]
    pub fn pages(&self) -> Vec<&Target> {
        let mut pages: Vec<&Target> = self
            .targets
            .values()
            .filter(|t| t.kind == TargetKind::Page)
            .collect();
        pages.sort_by_key(|t| t.discovered_at);
        pages
    }

    /// All targets, enumeration order.
    #[must_use]
    pub fn all(&self) -> Vec<&Target> {
        let mut all: Vec<&Target> = self.targets.values().collect();
        all.sort_by_key(|t| t.discovered_at);
        all
    }

    /// Resolve a caller-supplied optional target id to a page target.
    ///
    /// An explicit id must exist and be a page. Without one, the most
    /// recently activated page wins, falling back to the first page in
    /// enumeration order.
    ///
    /// # Errors
    ///
    /// `invalid-arguments` for an unknown or non-page explicit id;
    /// `no-page-available` when the browser has zero pages.
    pub fn resolve(&self, explicit: Option<&str>) -> Result<Target, ServerError> {
        if let Some(id) = explicit {
            let target = self.targets.get(id).ok_or_else(|| {
                ServerError::invalid_arguments(format!("no target with id {id}"))
            })?;
            if target.kind != TargetKind::Page {
                return Err(ServerError::invalid_arguments(format!(
                    "target {id} is a {}, not a page",
                    target.kind.as_str()
                )));
            }
            return Ok(target.clone());
        }

        let pages = self.pages();
        if pages.is_empty() {
            return Err(ServerError::no_page_available());
        }
        let best = pages
            .iter()
            .max_by_key(|t| t.activated_at)
            .filter(|t| t.activated_at > 0)
            .copied()
            .unwrap_or(pages[0]);
        Ok(best.clone())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn clear(&mut self) {
        self.targets.clear();
    }
}

/// Subscribe to target discovery events on the root session and keep the
/// registry current. The pump task ends when the transport closes its
/// event streams.
///
/// # Errors
///
/// Returns `CdpError` if the subscriptions or `Target.setDiscoverTargets`
/// fail.
pub async fn spawn_target_pump(
    client: &CdpClient,
    registry: Arc<Mutex<TargetRegistry>>,
) -> Result<JoinHandle<()>, CdpError> {
    // Subscribe before enabling discovery so the initial burst of
    // targetCreated events is not missed.
    let mut created_rx = client.subscribe("Target.targetCreated").await?;
    let mut destroyed_rx = client.subscribe("Target.targetDestroyed").await?;
    let mut changed_rx = client.subscribe("Target.targetInfoChanged").await?;

    client
        .send_command(
            "Target.setDiscoverTargets",
            Some(serde_json::json!({ "discover": true })),
        )
        .await?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                event = created_rx.recv() => {
                    let Some(event) = event else { break };
                    let info = &event.params["targetInfo"];
                    apply_target_info(&registry, info).await;
                }
                event = changed_rx.recv() => {
                    let Some(event) = event else { break };
                    let info = &event.params["targetInfo"];
                    apply_target_info(&registry, info).await;
                }
                event = destroyed_rx.recv() => {
                    let Some(event) = event else { break };
                    if let Some(id) = event.params["targetId"].as_str() {
                        registry.lock().await.remove(id);
                    }
                }
            }
        }
        debug!("target pump ended");
    }))
}

async fn apply_target_info(registry: &Arc<Mutex<TargetRegistry>>, info: &serde_json::Value) {
    let Some(id) = info["targetId"].as_str() else {
        return;
    };
    let kind = TargetKind::parse(info["type"].as_str().unwrap_or("other"));
    let url = info["url"].as_str().unwrap_or_default();
    let title = info["title"].as_str().unwrap_or_default();
    registry.lock().await.upsert(id, kind, url, title);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn registry_with(pages: &[&str]) -> TargetRegistry {
        let mut registry = TargetRegistry::new();
        for id in pages {
            registry.upsert(id, TargetKind::Page, "about:blank", "");
        }
        registry
    }

    #[test]
    fn kind_round_trip() {
        assert_eq!(TargetKind::parse("page"), TargetKind::Page);
        assert_eq!(TargetKind::parse("service_worker"), TargetKind::ServiceWorker);
        assert_eq!(
            TargetKind::parse("webview").as_str(),
            "webview"
        );
    }

    #[test]
    fn resolve_explicit_id() {
        let registry = registry_with(&["A", "B"]);
        assert_eq!(registry.resolve(Some("B")).unwrap().id, "B");
    }

    #[test]
    fn resolve_unknown_id_is_invalid_arguments() {
        let registry = registry_with(&["A"]);
        let err = registry.resolve(Some("missing")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArguments);
    }

    #[test]
    fn resolve_non_page_id_is_invalid_arguments() {
        let mut registry = registry_with(&["A"]);
        registry.upsert("SW", TargetKind::ServiceWorker, "https://x/sw.js", "");
        let err = registry.resolve(Some("SW")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArguments);
    }

    #[test]
    fn resolve_prefers_most_recently_activated() {
        let mut registry = registry_with(&["A", "B", "C"]);
        registry.note_activated("B");
        assert_eq!(registry.resolve(None).unwrap().id, "B");
        registry.note_activated("C");
        assert_eq!(registry.resolve(None).unwrap().id, "C");
    }

    #[test]
    fn resolve_falls_back_to_enumeration_order() {
        let registry = registry_with(&["first", "second"]);
        assert_eq!(registry.resolve(None).unwrap().id, "first");
    }

    #[test]
    fn resolve_with_zero_pages_is_no_page_available() {
        let mut registry = TargetRegistry::new();
        registry.upsert("SW", TargetKind::ServiceWorker, "https://x/sw.js", "");
        let err = registry.resolve(None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoPageAvailable);
    }

    #[test]
    fn destroyed_targets_leave_the_map() {
        let mut registry = registry_with(&["A", "B"]);
        registry.remove("A");
        assert!(registry.get("A").is_none());
        assert_eq!(registry.pages().len(), 1);
    }

    #[test]
    fn sync_drops_dead_ids_and_keeps_activation() {
        let mut registry = registry_with(&["A", "B"]);
        registry.note_activated("B");

        let summaries = vec![
            TargetSummary {
                id: "B".into(),
                kind: "page".into(),
                title: "kept".into(),
                url: "https://example.com/".into(),
                ws_debugger_url: None,
            },
            TargetSummary {
                id: "C".into(),
                kind: "page".into(),
                title: String::new(),
                url: "about:blank".into(),
                ws_debugger_url: None,
            },
        ];
        registry.sync_from_enumeration(&summaries);

        assert!(registry.get("A").is_none());
        assert_eq!(registry.get("B").unwrap().title, "kept");
        // B's activation survives the sync, so it still wins resolution.
        assert_eq!(registry.resolve(None).unwrap().id, "B");
    }

    #[test]
    fn upsert_refreshes_url_and_title() {
        let mut registry = registry_with(&["A"]);
        registry.upsert("A", TargetKind::Page, "https://example.com/", "Example");
        let target = registry.get("A").unwrap();
        assert_eq!(target.url, "https://example.com/");
        assert_eq!(target.title, "Example");
    }
}
