//! Template instance pool.
//!
//! Materializes parameterized backends per session, coalesces shareable
//! instances by `(template, variableHash)`, reference-counts them by
//! session, and evicts idle instances after their template's idle timeout.
//!
//! Lock order: a slot mutex may be held while taking the table mutex, never
//! the other way around.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use magg_config::BackendConfig;
use magg_core::ProxyError;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::aggregate::CapabilityAggregator;
use crate::template::{RenderContext, render_backend};
use crate::upstream::OutboundManager;

pub const REAP_INTERVAL: Duration = Duration::from_secs(30);
const HASH_DISCRIMINATOR_LEN: usize = 12;

/// Identity of a pooled instance. Shareable instances discriminate by
/// variable hash so equal bindings coalesce; everything else gets a fresh
/// instance id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub template: String,
    pub discriminator: String,
}

/// Session-facing description of a held instance.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    pub key: InstanceKey,
    pub instance_id: String,
    pub backend_name: String,
    pub shared: bool,
}

#[derive(Debug)]
struct InstanceState {
    instance_id: String,
    backend_name: String,
    variable_hash: String,
    idle_timeout: Duration,
    sessions: BTreeSet<String>,
    idle_since: Option<Instant>,
}

#[derive(Debug, Default)]
struct Slot {
    instance: Option<InstanceState>,
    /// Creation failed and the key was unlinked; waiters must restart.
    failed: bool,
}

/// Inspection row for status payloads and tests.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub template: String,
    pub instance_id: String,
    pub backend_name: String,
    pub variable_hash: String,
    pub reference_count: usize,
    pub idle: bool,
}

pub struct TemplatePool {
    manager: Arc<OutboundManager>,
    aggregator: Arc<CapabilityAggregator>,
    slots: Mutex<HashMap<InstanceKey, Arc<Mutex<Slot>>>>,
    reap_gate: Mutex<()>,
}

/// Stable hash of the rendered variable bindings: lowercase hex SHA-256 of
/// the canonical JSON of the rendered config with `name` excluded.
pub fn variable_hash(rendered: &BackendConfig) -> String {
    let mut anonymous = rendered.clone();
    anonymous.name = String::new();
    let canonical =
        serde_json::to_string(&anonymous).expect("backend config serializes to JSON");
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{digest:x}")
}

impl TemplatePool {
    pub fn new(manager: Arc<OutboundManager>, aggregator: Arc<CapabilityAggregator>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            aggregator,
            slots: Mutex::new(HashMap::new()),
            reap_gate: Mutex::new(()),
        })
    }

    /// Resolve `template` for one session, creating or joining an instance.
    ///
    /// Exactly one creation per key runs at a time; concurrent callers for
    /// the same key wait on the slot and share the created instance.
    pub async fn get_or_create(
        &self,
        template: &BackendConfig,
        ctx: &RenderContext,
        session_id: &str,
    ) -> Result<InstanceHandle, ProxyError> {
        let settings = template.template.clone().unwrap_or_default();
        let rendered = render_backend(template, ctx)?;
        let hash = variable_hash(&rendered);
        let shared = settings.shareable && !settings.per_client;

        // A waiter that raced a failed creation restarts on a fresh slot.
        loop {
            let discriminator = if shared {
                hash[..HASH_DISCRIMINATOR_LEN].to_string()
            } else {
                Ulid::new().to_string().to_lowercase()
            };
            let key = InstanceKey {
                template: template.name.clone(),
                discriminator,
            };

            let slot = {
                let mut slots = self.slots.lock().await;
                match slots.get(&key) {
                    Some(slot) => slot.clone(),
                    None => {
                        if let Some(max) = settings.max_instances {
                            let live =
                                slots.keys().filter(|k| k.template == key.template).count();
                            if live >= max {
                                return Err(ProxyError::ResourceExhausted {
                                    template: template.name.clone(),
                                    max_instances: max,
                                });
                            }
                        }
                        let slot = Arc::new(Mutex::new(Slot::default()));
                        slots.insert(key.clone(), slot.clone());
                        slot
                    }
                }
            };

            let mut guard = slot.lock().await;
            if guard.failed {
                continue;
            }
            if let Some(instance) = guard.instance.as_mut() {
                instance.sessions.insert(session_id.to_string());
                instance.idle_since = None;
                tracing::debug!(
                    template = %key.template,
                    instance = %instance.instance_id,
                    sessions = instance.sessions.len(),
                    "joined shared template instance"
                );
                return Ok(InstanceHandle {
                    key,
                    instance_id: instance.instance_id.clone(),
                    backend_name: instance.backend_name.clone(),
                    shared,
                });
            }

            // First caller for this key materializes the backend.
            let instance_id = Ulid::new().to_string().to_lowercase();
            let backend_name = format!("{}@{}", key.template, key.discriminator);
            let mut config = rendered.clone();
            config.name = backend_name.clone();

            if let Err(error) = self.manager.start(config).await {
                guard.failed = true;
                self.slots.lock().await.remove(&key);
                drop(guard);
                self.manager.remove(&backend_name).await;
                return Err(error);
            }
            self.aggregator.refresh().await;

            guard.instance = Some(InstanceState {
                instance_id: instance_id.clone(),
                backend_name: backend_name.clone(),
                variable_hash: hash,
                idle_timeout: Duration::from_secs(settings.idle_timeout),
                sessions: [session_id.to_string()].into_iter().collect(),
                idle_since: None,
            });
            tracing::info!(
                template = %key.template,
                backend = %backend_name,
                "created template instance"
            );

            return Ok(InstanceHandle {
                key,
                instance_id,
                backend_name,
                shared,
            });
        }
    }

    /// Drop one session's reference; the instance idles at zero.
    pub async fn release(&self, key: &InstanceKey, session_id: &str) {
        let slot = self.slots.lock().await.get(key).cloned();
        let Some(slot) = slot else {
            return;
        };
        let mut guard = slot.lock().await;
        if let Some(instance) = guard.instance.as_mut() {
            instance.sessions.remove(session_id);
            if instance.sessions.is_empty() {
                instance.idle_since = Some(Instant::now());
            }
        }
    }

    /// Drop every reference a disconnecting session holds.
    pub async fn release_session(&self, session_id: &str) {
        let slots: Vec<Arc<Mutex<Slot>>> = self.slots.lock().await.values().cloned().collect();
        for slot in slots {
            let mut guard = slot.lock().await;
            if let Some(instance) = guard.instance.as_mut() {
                if instance.sessions.remove(session_id) && instance.sessions.is_empty() {
                    instance.idle_since = Some(Instant::now());
                }
            }
        }
    }

    /// Evict instances idle past their timeout. Returns the eviction count;
    /// skips entirely when another reap is in flight.
    pub async fn reap(&self, now: Instant) -> usize {
        let Ok(_gate) = self.reap_gate.try_lock() else {
            return 0;
        };

        let entries: Vec<(InstanceKey, Arc<Mutex<Slot>>)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut count = 0;
        for (key, slot) in entries {
            let mut guard = slot.lock().await;
            let expired = guard.instance.as_ref().is_some_and(|instance| {
                instance.sessions.is_empty()
                    && instance.idle_since.is_some_and(|since| {
                        now.saturating_duration_since(since) >= instance.idle_timeout
                    })
            });
            if !expired {
                continue;
            }

            // Stop the backend while holding the slot so a concurrent
            // get_or_create for the same key cannot join a dying instance;
            // the failed marker sends stale waiters back to a fresh slot.
            let instance = guard.instance.take().expect("expired instance present");
            guard.failed = true;
            tracing::info!(backend = %instance.backend_name, "evicting idle template instance");
            self.manager.remove(&instance.backend_name).await;
            self.slots.lock().await.remove(&key);
            count += 1;
        }

        if count > 0 {
            self.aggregator.refresh().await;
        }
        count
    }

    pub async fn instances(&self) -> Vec<InstanceSnapshot> {
        let entries: Vec<(InstanceKey, Arc<Mutex<Slot>>)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut out = Vec::new();
        for (key, slot) in entries {
            let guard = slot.lock().await;
            if let Some(instance) = guard.instance.as_ref() {
                out.push(InstanceSnapshot {
                    template: key.template.clone(),
                    instance_id: instance.instance_id.clone(),
                    backend_name: instance.backend_name.clone(),
                    variable_hash: instance.variable_hash.clone(),
                    reference_count: instance.sessions.len(),
                    idle: instance.sessions.is_empty(),
                });
            }
        }
        out.sort_by(|a, b| (&a.template, &a.instance_id).cmp(&(&b.template, &b.instance_id)));
        out
    }

    /// Periodic reaper; stops with the token and never keeps the process
    /// alive on its own.
    pub fn spawn_reaper(self: &Arc<Self>, ct: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ct.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = pool.reap(Instant::now()).await;
                        if removed > 0 {
                            tracing::debug!(removed, "template reaper evicted instances");
                        }
                    }
                }
            }
        })
    }
}

/// Resolve the per-template render context for one session.
pub fn render_context_for(
    template: &BackendConfig,
    session_id: &str,
    transport_kind: &str,
    connection_id: &str,
    client_context: Option<&serde_json::Value>,
) -> RenderContext {
    let mut ctx = RenderContext::for_session(
        session_id,
        transport_kind,
        connection_id,
        crate::transport::filtered_parent_environment(template),
        client_context,
    );
    ctx.allow_sensitive_data = template
        .template
        .as_ref()
        .is_some_and(|t| t.allow_sensitive_data);
    ctx
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
