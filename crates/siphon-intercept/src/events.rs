//! Event fan-out to registered rule sets.

use std::collections::BTreeMap;

use serde::Serialize;
use siphon_core::{Body, PostBody};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Something a consumer asked to observe.
///
/// Header maps are already filtered for the consumer named by `marker`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum InterceptEvent {
    Request {
        marker: String,
        method: String,
        url: String,
        headers: BTreeMap<String, String>,
    },
    Response {
        marker: String,
        method: String,
        url: String,
        status_code: u16,
        headers: BTreeMap<String, String>,
        response_headers: BTreeMap<String, String>,
        body: Option<Body>,
        post: Option<PostBody>,
        /// Served from cache rather than the network.
        synthetic: bool,
    },
    /// Bytes answered from cache instead of the network.
    LoadedFromCache { bytes: u64 },
}

impl InterceptEvent {
    /// Consumer the event is addressed to. Metrics are addressed to all.
    pub fn marker(&self) -> Option<&str> {
        match self {
            InterceptEvent::Request { marker, .. } | InterceptEvent::Response { marker, .. } => {
                Some(marker)
            }
            InterceptEvent::LoadedFromCache { .. } => None,
        }
    }
}

/// Broadcast bus for [`InterceptEvent`]s.
///
/// Subscribers filter by marker; a slow subscriber lags rather than
/// blocking the dispatcher.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<InterceptEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InterceptEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Returns how many subscribers received it.
    pub fn emit(&self, event: InterceptEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
