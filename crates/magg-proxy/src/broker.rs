//! Notification fan-out from backends to matching sessions.
//!
//! List-changed diffs reach a session only when an origin visible under its
//! filter changed. Logging and progress notifications forward to sessions
//! that can see the emitting backend. Delivery is best effort: a session
//! whose peer is gone is skipped with a log line.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rmcp::model::{LoggingMessageNotificationParam, ProgressNotificationParam};
use rmcp::service::Peer;
use rmcp::RoleServer;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::aggregate::{CapabilityAggregator, CapabilityChanges, INTERNAL_ORIGIN};
use crate::filter::TagFilter;
use crate::upstream::{BackendEvent, OutboundManager, UpstreamNotice};

struct BrokerEntry {
    peer: Peer<RoleServer>,
    filter: TagFilter,
    preset: Option<String>,
}

#[derive(Default)]
pub struct NotificationBroker {
    sessions: RwLock<HashMap<String, BrokerEntry>>,
}

impl NotificationBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn track(
        &self,
        session_id: &str,
        peer: Peer<RoleServer>,
        filter: TagFilter,
        preset: Option<String>,
    ) {
        self.sessions.write().await.insert(
            session_id.to_string(),
            BrokerEntry {
                peer,
                filter,
                preset,
            },
        );
    }

    pub async fn untrack(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn tracked_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Push list-changed notifications to every session whose filter admits
    /// one of the changed origins.
    pub async fn fan_out_changes(&self, changes: &CapabilityChanges) {
        let sessions = self.sessions.read().await;
        for (session_id, entry) in sessions.iter() {
            let affected = changes.changed_origins.iter().any(|origin| {
                origin.name == INTERNAL_ORIGIN || entry.filter.admits(&origin.tags)
            });
            if !affected {
                continue;
            }

            if changes.tools_changed {
                if let Err(error) = entry.peer.notify_tool_list_changed().await {
                    tracing::debug!(session = %session_id, error = %error, "dropping tool list notification");
                }
            }
            if changes.resources_changed {
                if let Err(error) = entry.peer.notify_resource_list_changed().await {
                    tracing::debug!(session = %session_id, error = %error, "dropping resource list notification");
                }
            }
            if changes.prompts_changed {
                if let Err(error) = entry.peer.notify_prompt_list_changed().await {
                    tracing::debug!(session = %session_id, error = %error, "dropping prompt list notification");
                }
            }
        }
    }

    /// Forward a backend log message to sessions that can see the backend.
    pub async fn forward_logging(
        &self,
        backend_tags: &BTreeSet<String>,
        params: LoggingMessageNotificationParam,
    ) {
        let sessions = self.sessions.read().await;
        for (session_id, entry) in sessions.iter() {
            if !entry.filter.admits(backend_tags) {
                continue;
            }
            if let Err(error) = entry.peer.notify_logging_message(params.clone()).await {
                tracing::debug!(session = %session_id, error = %error, "dropping logging notification");
            }
        }
    }

    /// Progress carries a per-request token; every session receives it and
    /// clients correlate by token.
    pub async fn forward_progress(&self, params: ProgressNotificationParam) {
        let sessions = self.sessions.read().await;
        for (session_id, entry) in sessions.iter() {
            if let Err(error) = entry.peer.notify_progress(params.clone()).await {
                tracing::debug!(session = %session_id, error = %error, "dropping progress notification");
            }
        }
    }

    /// Preset definitions changed: sessions bound to the preset re-list.
    pub async fn notify_preset_changed(&self, preset_name: &str) {
        let sessions = self.sessions.read().await;
        for (session_id, entry) in sessions.iter() {
            if entry.preset.as_deref() != Some(preset_name) {
                continue;
            }
            if let Err(error) = entry.peer.notify_tool_list_changed().await {
                tracing::debug!(session = %session_id, error = %error, "dropping preset notification");
            }
        }
    }
}

/// Wire the broker into the event streams. Backend up/down and upstream
/// list-changed notices trigger a refresh; refresh diffs fan out to
/// sessions; logging and progress forward directly.
pub fn spawn_broker_task(
    broker: Arc<NotificationBroker>,
    manager: Arc<OutboundManager>,
    aggregator: Arc<CapabilityAggregator>,
    mut notices: mpsc::UnboundedReceiver<UpstreamNotice>,
    ct: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut backend_events = manager.subscribe();
    let mut changes = aggregator.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ct.cancelled() => break,

                notice = notices.recv() => {
                    let Some(notice) = notice else { break };
                    handle_notice(&broker, &manager, &aggregator, notice).await;
                }

                event = backend_events.recv() => {
                    match event {
                        Ok(BackendEvent::Up { .. })
                        | Ok(BackendEvent::Down { .. })
                        | Ok(BackendEvent::CapabilitiesChanged { .. }) => {
                            aggregator.refresh().await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "backend event stream lagged, refreshing");
                            aggregator.refresh().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                diff = changes.recv() => {
                    match diff {
                        Ok(diff) => broker.fan_out_changes(&diff).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "capability change stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    })
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;

async fn handle_notice(
    broker: &NotificationBroker,
    manager: &OutboundManager,
    aggregator: &CapabilityAggregator,
    notice: UpstreamNotice,
) {
    match notice {
        UpstreamNotice::ToolListChanged { backend }
        | UpstreamNotice::ResourceListChanged { backend }
        | UpstreamNotice::PromptListChanged { backend } => {
            tracing::debug!(backend = %backend, "backend list changed, refreshing");
            aggregator.refresh().await;
        }
        UpstreamNotice::Logging { backend, params } => {
            let tags = match manager.get(&backend).await {
                Some(connection) => connection.config().await.tags,
                None => BTreeSet::new(),
            };
            broker.forward_logging(&tags, params).await;
        }
        UpstreamNotice::Progress { backend, params } => {
            tracing::trace!(backend = %backend, "forwarding progress");
            broker.forward_progress(params).await;
        }
    }
}
