//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the resources every
//! handler and call shares: the backend store, the function dispatcher, the
//! session bridge and the registry of live calls.

use crate::{
    config::Config,
    ws::bridge::{CloseReason, SessionBridge, SessionHandle, SessionSnapshot},
};
use restaurant_core::{BackendStore, FunctionDispatcher};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BackendStore>,
    pub bridge: SessionBridge,
    /// Settings document sent to the agent at the start of every call.
    pub agent_settings: Arc<Value>,
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(store: Arc<dyn BackendStore>, agent_settings: Value, config: Config) -> Self {
        let dispatcher = Arc::new(FunctionDispatcher::new(store.clone()));
        Self {
            bridge: SessionBridge::new(dispatcher, config.bridge_config()),
            store,
            agent_settings: Arc::new(agent_settings),
            config: Arc::new(config),
            sessions: Arc::new(SessionRegistry::default()),
        }
    }
}

/// Live call sessions, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl SessionRegistry {
    pub async fn insert(&self, handle: SessionHandle) {
        self.sessions.lock().await.insert(handle.id(), handle);
    }

    pub async fn remove(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.lock().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .lock()
            .await
            .values()
            .map(SessionHandle::snapshot)
            .collect()
    }

    /// Closes every live session and waits for them to finish tearing down.
    pub async fn close_all(&self, reason: CloseReason) {
        let handles: Vec<SessionHandle> = self.sessions.lock().await.values().cloned().collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), %reason, "Closing live sessions");
        for handle in &handles {
            handle.close(reason.clone());
        }
        for handle in &handles {
            handle.closed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::{bridge::BridgeConfig, transport::memory};
    use restaurant_core::InMemoryStore;
    use std::time::Duration;

    fn bridge() -> SessionBridge {
        let store = Arc::new(InMemoryStore::demo());
        SessionBridge::new(
            Arc::new(FunctionDispatcher::new(store)),
            BridgeConfig {
                shutdown_grace: Duration::from_millis(200),
                keepalive_interval: None,
                ..BridgeConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_registry_tracks_and_closes_sessions() {
        let bridge = bridge();
        let registry = SessionRegistry::default();

        let (telephony, _caller_a) = memory::telephony();
        let (agent, _agent_a) = memory::agent();
        let first = bridge.open(telephony, agent);
        let (telephony, _caller_b) = memory::telephony();
        let (agent, _agent_b) = memory::agent();
        let second = bridge.open(telephony, agent);

        registry.insert(first.clone()).await;
        registry.insert(second.clone()).await;
        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.snapshots().await.len(), 2);

        tokio::time::timeout(Duration::from_secs(5), registry.close_all(CloseReason::Shutdown))
            .await
            .expect("sessions did not close");
        assert_eq!(first.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(second.close_reason(), Some(CloseReason::Shutdown));

        assert!(registry.remove(first.id()).await.is_some());
        assert!(registry.remove(first.id()).await.is_none());
        assert_eq!(registry.len().await, 1);
    }
}
