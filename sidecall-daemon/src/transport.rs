//! Transport abstraction over the local peer-to-peer link, plus an
//! in-process loopback hub for tests and simulation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use sidecall_core::{ConnectionOutcome, EndpointId, TransportEvent};
use tokio::sync::mpsc;
use tracing::debug;

/// Queue feeding transport callbacks to the coordinator. Single consumer;
/// arrival order is processing order.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Local-link operations the manager's commands map onto. Implementations
/// report results through the event queue handed over at construction and
/// never block the caller on network progress.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn advertise(&self, local_name: &str, channel_id: &str) -> Result<()>;
    async fn discover(&self, channel_id: &str) -> Result<()>;
    async fn stop_advertising(&self);
    async fn stop_discovery(&self);
    async fn request_connection(&self, local_name: &str, endpoint_id: &EndpointId) -> Result<()>;
    async fn accept_connection(&self, endpoint_id: &EndpointId) -> Result<()>;
    async fn send(&self, endpoint_ids: &[EndpointId], bytes: &[u8]) -> Result<()>;
    async fn disconnect_all(&self);
}

/// In-process hub: every node registered on it can discover and connect to
/// the others, mimicking the radio SDK closely enough for the manager's full
/// lifecycle to run without sockets. A connection request surfaces
/// `ConnectionInitiated` on both sides (as the real stack does); the link
/// forms once both sides accept.
#[derive(Default)]
pub struct LoopbackHub {
    inner: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<EndpointId, NodeState>,
    next_id: u64,
    fail_next_request: bool,
}

struct NodeState {
    events: EventSender,
    name: String,
    advertising: Option<String>,
    discovering: Option<String>,
    /// Peer id -> whether this side has accepted the in-flight attempt.
    pending: HashMap<EndpointId, bool>,
    connected: HashSet<EndpointId>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node; the returned transport reports into `events`.
    pub fn register(self: &Arc<Self>, events: EventSender) -> LoopbackTransport {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = EndpointId::new(format!("loopback-{}", inner.next_id));
        inner.nodes.insert(
            id.clone(),
            NodeState {
                events,
                name: String::new(),
                advertising: None,
                discovering: None,
                pending: HashMap::new(),
                connected: HashSet::new(),
            },
        );
        LoopbackTransport {
            hub: Arc::clone(self),
            id,
        }
    }

    /// Make the next connection request report failure; exercises the
    /// manager's retry path.
    pub fn fail_next_request(&self) {
        self.inner.lock().unwrap().fail_next_request = true;
    }
}

impl HubState {
    fn emit(&self, to: &EndpointId, event: TransportEvent) {
        if let Some(node) = self.nodes.get(to) {
            let _ = node.events.send(event);
        }
    }

    /// Surface `EndpointFound` to every discoverer matched with every
    /// advertiser on the same channel.
    fn match_channels(&self) {
        for (seeker_id, seeker) in &self.nodes {
            let Some(channel) = &seeker.discovering else {
                continue;
            };
            for (target_id, target) in &self.nodes {
                if target_id == seeker_id || target.advertising.as_ref() != Some(channel) {
                    continue;
                }
                self.emit(
                    seeker_id,
                    TransportEvent::EndpointFound {
                        id: target_id.clone(),
                        name: target.name.clone(),
                    },
                );
            }
        }
    }

    fn complete_if_both_accepted(&mut self, a: &EndpointId, b: &EndpointId) {
        let a_accepted = self
            .nodes
            .get(a)
            .and_then(|n| n.pending.get(b))
            .copied()
            .unwrap_or(false);
        let b_accepted = self
            .nodes
            .get(b)
            .and_then(|n| n.pending.get(a))
            .copied()
            .unwrap_or(false);
        if !(a_accepted && b_accepted) {
            return;
        }
        for (this, other) in [(a, b), (b, a)] {
            if let Some(node) = self.nodes.get_mut(this) {
                node.pending.remove(other);
                node.connected.insert(other.clone());
            }
            self.emit(
                this,
                TransportEvent::ConnectionResult {
                    id: other.clone(),
                    outcome: ConnectionOutcome::Connected,
                },
            );
        }
    }
}

/// One node's view of the [`LoopbackHub`].
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    id: EndpointId,
}

impl LoopbackTransport {
    /// The id under which peers see this node.
    pub fn local_id(&self) -> &EndpointId {
        &self.id
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn advertise(&self, local_name: &str, channel_id: &str) -> Result<()> {
        let mut inner = self.hub.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&self.id) {
            node.name = local_name.to_string();
            node.advertising = Some(channel_id.to_string());
        }
        inner.match_channels();
        Ok(())
    }

    async fn discover(&self, channel_id: &str) -> Result<()> {
        let mut inner = self.hub.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&self.id) {
            node.discovering = Some(channel_id.to_string());
        }
        inner.match_channels();
        Ok(())
    }

    async fn stop_advertising(&self) {
        let mut inner = self.hub.inner.lock().unwrap();
        let channel = inner
            .nodes
            .get_mut(&self.id)
            .and_then(|node| node.advertising.take());
        // Discoverers that could still see this node lose it.
        if let Some(channel) = channel {
            let watchers: Vec<EndpointId> = inner
                .nodes
                .iter()
                .filter(|(id, node)| {
                    **id != self.id && node.discovering.as_deref() == Some(channel.as_str())
                })
                .map(|(id, _)| id.clone())
                .collect();
            for watcher in watchers {
                inner.emit(
                    &watcher,
                    TransportEvent::EndpointLost {
                        id: self.id.clone(),
                    },
                );
            }
        }
    }

    async fn stop_discovery(&self) {
        let mut inner = self.hub.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&self.id) {
            node.discovering = None;
        }
    }

    async fn request_connection(&self, local_name: &str, endpoint_id: &EndpointId) -> Result<()> {
        let mut inner = self.hub.inner.lock().unwrap();
        if inner.fail_next_request || !inner.nodes.contains_key(endpoint_id) {
            inner.fail_next_request = false;
            debug!(endpoint = %endpoint_id, "loopback: request fails");
            inner.emit(
                &self.id,
                TransportEvent::ConnectionResult {
                    id: endpoint_id.clone(),
                    outcome: ConnectionOutcome::Failed,
                },
            );
            return Ok(());
        }
        if let Some(node) = inner.nodes.get(&self.id) {
            if node.connected.contains(endpoint_id) {
                inner.emit(
                    &self.id,
                    TransportEvent::ConnectionResult {
                        id: endpoint_id.clone(),
                        outcome: ConnectionOutcome::AlreadyConnected,
                    },
                );
                return Ok(());
            }
        }
        if let Some(node) = inner.nodes.get_mut(&self.id) {
            node.name = local_name.to_string();
            node.pending.insert(endpoint_id.clone(), false);
        }
        if let Some(peer) = inner.nodes.get_mut(endpoint_id) {
            peer.pending.insert(self.id.clone(), false);
        }
        let requester_name = local_name.to_string();
        let peer_name = inner
            .nodes
            .get(endpoint_id)
            .map(|n| n.name.clone())
            .unwrap_or_default();
        // Both sides see the offer, as with the real SDK.
        inner.emit(
            &self.id,
            TransportEvent::ConnectionInitiated {
                id: endpoint_id.clone(),
                name: peer_name,
            },
        );
        inner.emit(
            endpoint_id,
            TransportEvent::ConnectionInitiated {
                id: self.id.clone(),
                name: requester_name,
            },
        );
        Ok(())
    }

    async fn accept_connection(&self, endpoint_id: &EndpointId) -> Result<()> {
        let mut inner = self.hub.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&self.id) {
            if let Some(accepted) = node.pending.get_mut(endpoint_id) {
                *accepted = true;
            }
        }
        inner.complete_if_both_accepted(&self.id, endpoint_id);
        Ok(())
    }

    async fn send(&self, endpoint_ids: &[EndpointId], bytes: &[u8]) -> Result<()> {
        let inner = self.hub.inner.lock().unwrap();
        let connected = match inner.nodes.get(&self.id) {
            Some(node) => &node.connected,
            None => return Ok(()),
        };
        for endpoint_id in endpoint_ids {
            if connected.contains(endpoint_id) {
                inner.emit(
                    endpoint_id,
                    TransportEvent::PayloadReceived {
                        id: self.id.clone(),
                        bytes: bytes.to_vec(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn disconnect_all(&self) {
        let mut inner = self.hub.inner.lock().unwrap();
        let peers: Vec<EndpointId> = inner
            .nodes
            .get(&self.id)
            .map(|n| n.connected.iter().cloned().collect())
            .unwrap_or_default();
        if let Some(node) = inner.nodes.get_mut(&self.id) {
            node.connected.clear();
            node.pending.clear();
        }
        for peer_id in peers {
            if let Some(peer) = inner.nodes.get_mut(&peer_id) {
                peer.connected.remove(&self.id);
                peer.pending.remove(&self.id);
            }
            inner.emit(
                &peer_id,
                TransportEvent::Disconnected {
                    id: self.id.clone(),
                },
            );
        }
    }
}
