//! Capability aggregation across ready backends.
//!
//! Builds deterministic, immutable snapshots of the merged tool / resource /
//! prompt lists. Backends are queried concurrently with per-call isolation:
//! one failing list query empties that kind for that backend and never
//! aborts the refresh. Merging walks backends in sorted name order, so
//! duplicate names resolve first-writer-wins in that order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rmcp::model::{Prompt, Resource, Tool};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinSet;

use crate::internal::InternalProvider;
use crate::upstream::OutboundManager;

/// Origin name used for first-party items; never tag-filtered.
pub const INTERNAL_ORIGIN: &str = "internal";

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub origin: String,
    pub tool: Tool,
}

#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub origin: String,
    pub resource: Resource,
}

#[derive(Debug, Clone)]
pub struct PromptEntry {
    pub origin: String,
    pub prompt: Prompt,
}

/// What the snapshot knows about one contributing backend.
#[derive(Debug, Clone, Default)]
pub struct BackendView {
    pub tags: BTreeSet<String>,
    pub instructions: Option<String>,
}

/// Immutable aggregated view over all ready backends.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySnapshot {
    pub tools: Vec<ToolEntry>,
    pub resources: Vec<ResourceEntry>,
    pub prompts: Vec<PromptEntry>,
    /// Sorted backend names that contributed (the internal provider is not
    /// listed).
    pub ready_backends: Vec<String>,
    pub backends: BTreeMap<String, BackendView>,
    pub taken_at: DateTime<Utc>,
}

impl CapabilitySnapshot {
    pub fn tool(&self, name: &str) -> Option<&ToolEntry> {
        self.tools.iter().find(|e| e.tool.name.as_ref() == name)
    }

    pub fn resource(&self, uri: &str) -> Option<&ResourceEntry> {
        self.resources.iter().find(|e| e.resource.uri == uri)
    }

    pub fn prompt(&self, name: &str) -> Option<&PromptEntry> {
        self.prompts.iter().find(|e| e.prompt.name == name)
    }

    /// True iff items from `origin` are visible under `filter`.
    pub fn origin_visible(&self, origin: &str, filter: &crate::filter::TagFilter) -> bool {
        if origin == INTERNAL_ORIGIN {
            return true;
        }
        match self.backends.get(origin) {
            Some(view) => filter.admits(&view.tags),
            None => false,
        }
    }

    fn sorted_tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .iter()
            .map(|e| e.tool.name.as_ref().to_string())
            .collect();
        names.sort();
        names
    }

    fn sorted_resource_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self
            .resources
            .iter()
            .map(|e| e.resource.uri.clone())
            .collect();
        uris.sort();
        uris
    }

    fn sorted_prompt_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.prompts.iter().map(|e| e.prompt.name.clone()).collect();
        names.sort();
        names
    }

    /// Sorted item identifiers contributed by one origin, for change
    /// attribution.
    fn origin_items(&self, origin: &str) -> Vec<String> {
        let mut items = Vec::new();
        for entry in &self.tools {
            if entry.origin == origin {
                items.push(format!("tool:{}", entry.tool.name));
            }
        }
        for entry in &self.resources {
            if entry.origin == origin {
                items.push(format!("resource:{}", entry.resource.uri));
            }
        }
        for entry in &self.prompts {
            if entry.origin == origin {
                items.push(format!("prompt:{}", entry.prompt.name));
            }
        }
        items.sort();
        items
    }
}

/// A backend whose contribution differs between two snapshots.
#[derive(Debug, Clone)]
pub struct ChangedOrigin {
    pub name: String,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityChanges {
    pub tools_changed: bool,
    pub resources_changed: bool,
    pub prompts_changed: bool,
    /// Ready set or any contributing instruction text changed; only new
    /// session handshakes can observe it.
    pub instructions_changed: bool,
    pub added_backends: Vec<String>,
    pub removed_backends: Vec<String>,
    pub changed_origins: Vec<ChangedOrigin>,
}

impl CapabilityChanges {
    pub fn has_changes(&self) -> bool {
        self.tools_changed
            || self.resources_changed
            || self.prompts_changed
            || !self.added_backends.is_empty()
            || !self.removed_backends.is_empty()
    }
}

/// Pure diff of two snapshots; equal inputs produce no changes.
pub fn diff(prev: &CapabilitySnapshot, next: &CapabilitySnapshot) -> CapabilityChanges {
    let tools_changed = prev.sorted_tool_names() != next.sorted_tool_names();
    let resources_changed = prev.sorted_resource_uris() != next.sorted_resource_uris();
    let prompts_changed = prev.sorted_prompt_names() != next.sorted_prompt_names();

    let prev_set: BTreeSet<&String> = prev.ready_backends.iter().collect();
    let next_set: BTreeSet<&String> = next.ready_backends.iter().collect();
    let added_backends: Vec<String> = next_set
        .difference(&prev_set)
        .map(|n| (*n).clone())
        .collect();
    let removed_backends: Vec<String> = prev_set
        .difference(&next_set)
        .map(|n| (*n).clone())
        .collect();

    let mut changed_origins = Vec::new();
    for name in prev_set.union(&next_set) {
        if prev.origin_items(name) != next.origin_items(name) {
            let tags = next
                .backends
                .get(*name)
                .or_else(|| prev.backends.get(*name))
                .map(|view| view.tags.clone())
                .unwrap_or_default();
            changed_origins.push(ChangedOrigin {
                name: (*name).clone(),
                tags,
            });
        }
    }

    let instructions_changed = added_backends
        .iter()
        .chain(removed_backends.iter())
        .next()
        .is_some()
        || prev
            .backends
            .iter()
            .any(|(name, view)| {
                next.backends
                    .get(name)
                    .is_some_and(|n| n.instructions != view.instructions)
            });

    CapabilityChanges {
        tools_changed,
        resources_changed,
        prompts_changed,
        instructions_changed,
        added_backends,
        removed_backends,
        changed_origins,
    }
}

struct BackendContribution {
    name: String,
    view: BackendView,
    tools: Vec<Tool>,
    resources: Vec<Resource>,
    prompts: Vec<Prompt>,
}

/// Computes snapshots and publishes `capabilities-changed` events.
pub struct CapabilityAggregator {
    manager: Arc<OutboundManager>,
    internal: Arc<InternalProvider>,
    current: RwLock<Arc<CapabilitySnapshot>>,
    last_changes: RwLock<Arc<CapabilityChanges>>,
    refresh_gate: Mutex<()>,
    epoch: AtomicU64,
    events: broadcast::Sender<Arc<CapabilityChanges>>,
    list_timeout: Duration,
}

impl CapabilityAggregator {
    pub fn new(
        manager: Arc<OutboundManager>,
        internal: Arc<InternalProvider>,
        list_timeout: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            manager,
            internal,
            current: RwLock::new(Arc::new(CapabilitySnapshot::default())),
            last_changes: RwLock::new(Arc::new(CapabilityChanges::default())),
            refresh_gate: Mutex::new(()),
            epoch: AtomicU64::new(0),
            events,
            list_timeout,
        })
    }

    pub async fn current(&self) -> Arc<CapabilitySnapshot> {
        self.current.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CapabilityChanges>> {
        self.events.subscribe()
    }

    /// Recompute the snapshot. Only one refresh runs at a time; callers that
    /// queued behind a completed refresh receive its result instead of
    /// recomputing.
    pub async fn refresh(&self) -> Arc<CapabilityChanges> {
        let entry_epoch = self.epoch.load(Ordering::SeqCst);
        let _gate = self.refresh_gate.lock().await;
        if self.epoch.load(Ordering::SeqCst) != entry_epoch {
            return self.last_changes.read().await.clone();
        }

        let next = Arc::new(self.collect().await);
        let prev = self.current.read().await.clone();
        let changes = Arc::new(diff(&prev, &next));

        *self.current.write().await = next;
        *self.last_changes.write().await = changes.clone();
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if changes.has_changes() {
            let _ = self.events.send(changes.clone());
        }
        changes
    }

    async fn collect(&self) -> CapabilitySnapshot {
        let ready = self.manager.ready().await;
        let mut join_set = JoinSet::new();

        for connection in ready {
            let list_timeout = self.list_timeout;
            join_set.spawn(async move {
                let config = connection.config().await;
                let info = connection.server_info().await;
                let Ok(peer) = connection.peer().await else {
                    return None;
                };

                let caps = info.as_ref().map(|i| i.capabilities.clone());
                let supports_tools = caps.as_ref().is_some_and(|c| c.tools.is_some());
                let supports_resources = caps.as_ref().is_some_and(|c| c.resources.is_some());
                let supports_prompts = caps.as_ref().is_some_and(|c| c.prompts.is_some());
                let name = connection.name.clone();

                let (tools, resources, prompts) = tokio::join!(
                    async {
                        if !supports_tools {
                            return Vec::new();
                        }
                        match tokio::time::timeout(list_timeout, peer.list_tools(None)).await {
                            Ok(Ok(result)) => result.tools,
                            Ok(Err(error)) => {
                                tracing::warn!(backend = %name, error = %error, "tools/list failed");
                                Vec::new()
                            }
                            Err(_) => {
                                tracing::warn!(backend = %name, "tools/list timed out");
                                Vec::new()
                            }
                        }
                    },
                    async {
                        if !supports_resources {
                            return Vec::new();
                        }
                        match tokio::time::timeout(list_timeout, peer.list_resources(None)).await {
                            Ok(Ok(result)) => result.resources,
                            Ok(Err(error)) => {
                                tracing::warn!(backend = %name, error = %error, "resources/list failed");
                                Vec::new()
                            }
                            Err(_) => {
                                tracing::warn!(backend = %name, "resources/list timed out");
                                Vec::new()
                            }
                        }
                    },
                    async {
                        if !supports_prompts {
                            return Vec::new();
                        }
                        match tokio::time::timeout(list_timeout, peer.list_prompts(None)).await {
                            Ok(Ok(result)) => result.prompts,
                            Ok(Err(error)) => {
                                tracing::warn!(backend = %name, error = %error, "prompts/list failed");
                                Vec::new()
                            }
                            Err(_) => {
                                tracing::warn!(backend = %name, "prompts/list timed out");
                                Vec::new()
                            }
                        }
                    },
                );

                let tools = tools
                    .into_iter()
                    .filter(|t| config.tools.admits(t.name.as_ref()))
                    .collect();
                let resources = resources
                    .into_iter()
                    .filter(|r| config.resources.admits(&r.uri))
                    .collect();
                let prompts = prompts
                    .into_iter()
                    .filter(|p| config.prompts.admits(&p.name))
                    .collect();

                Some(BackendContribution {
                    name,
                    view: BackendView {
                        tags: config.tags.clone(),
                        instructions: info.and_then(|i| i.instructions),
                    },
                    tools,
                    resources,
                    prompts,
                })
            });
        }

        let mut contributions: BTreeMap<String, BackendContribution> = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(contribution)) => {
                    contributions.insert(contribution.name.clone(), contribution);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "capability query task panicked");
                }
            }
        }

        let mut snapshot = CapabilitySnapshot {
            taken_at: Utc::now(),
            ..Default::default()
        };
        let mut seen_tools = BTreeSet::new();
        let mut seen_resources = BTreeSet::new();
        let mut seen_prompts = BTreeSet::new();

        // First-party items merge ahead of every external backend.
        for tool in self.internal.tools() {
            seen_tools.insert(tool.name.as_ref().to_string());
            snapshot.tools.push(ToolEntry {
                origin: INTERNAL_ORIGIN.to_string(),
                tool,
            });
        }

        for (name, contribution) in contributions {
            snapshot.ready_backends.push(name.clone());
            snapshot.backends.insert(name.clone(), contribution.view);

            for tool in contribution.tools {
                if !seen_tools.insert(tool.name.as_ref().to_string()) {
                    tracing::debug!(backend = %name, tool = %tool.name, "dropping duplicate tool name");
                    continue;
                }
                snapshot.tools.push(ToolEntry {
                    origin: name.clone(),
                    tool,
                });
            }
            for resource in contribution.resources {
                if !seen_resources.insert(resource.uri.clone()) {
                    tracing::debug!(backend = %name, uri = %resource.uri, "dropping duplicate resource uri");
                    continue;
                }
                snapshot.resources.push(ResourceEntry {
                    origin: name.clone(),
                    resource,
                });
            }
            for prompt in contribution.prompts {
                if !seen_prompts.insert(prompt.name.clone()) {
                    tracing::debug!(backend = %name, prompt = %prompt.name, "dropping duplicate prompt name");
                    continue;
                }
                snapshot.prompts.push(PromptEntry {
                    origin: name.clone(),
                    prompt,
                });
            }
        }

        snapshot
    }
}

#[cfg(test)]
#[path = "aggregate_tests.rs"]
mod tests;
