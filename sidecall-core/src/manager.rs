//! Peer connection manager: the advertising/discovery/connection state machine.
//!
//! Host-driven like the rest of the core: one owning task feeds transport
//! events in arrival order and executes the returned commands. At most one
//! endpoint ever occupies the connection set, and while it does, advertising
//! and discovery stay halted.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, EndpointId};

/// Display name recorded when a connection result arrives for an endpoint no
/// name was ever reported for.
const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Manager phase, derived from the channel id and the two endpoint maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    /// Advertising and discovering concurrently.
    Seeking,
    /// A candidate has an in-flight connection request or a pending accept.
    Connecting,
    Connected,
}

/// Result of a connection attempt as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Connected,
    /// The transport already held a channel to this endpoint; treated as success.
    AlreadyConnected,
    Failed,
}

/// Inbound transport callback. Delivered on a single queue; processing order
/// is arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    EndpointFound { id: EndpointId, name: String },
    EndpointLost { id: EndpointId },
    ConnectionInitiated { id: EndpointId, name: String },
    ConnectionResult { id: EndpointId, outcome: ConnectionOutcome },
    Disconnected { id: EndpointId },
    PayloadReceived { id: EndpointId, bytes: Vec<u8> },
}

/// Outbound transport operation for the owner to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Advertise {
        local_name: String,
        channel_id: String,
    },
    Discover {
        channel_id: String,
    },
    StopAdvertising,
    StopDiscovery,
    RequestConnection {
        local_name: String,
        endpoint_id: EndpointId,
    },
    AcceptConnection {
        endpoint_id: EndpointId,
    },
    Send {
        endpoint_ids: Vec<EndpointId>,
        bytes: Vec<u8>,
    },
    DisconnectAll,
}

/// Connection lifecycle state machine. Owned by one coordinator task; no
/// locking inside. Every failure self-heals by re-entering seeking while a
/// channel id is set; only [`ConnectionManager::stop`] prevents recovery.
pub struct ConnectionManager {
    channel_id: Option<String>,
    local_name: String,
    /// Candidates with an in-flight request or pending accept, by id.
    discovered: HashMap<EndpointId, String>,
    /// The connection set. Size is 0 or 1.
    connected: HashMap<EndpointId, String>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            channel_id: None,
            local_name: String::new(),
            discovered: HashMap::new(),
            connected: HashMap::new(),
        }
    }

    /// Begin (or re-apply) seeking under `channel_id`. The local display name
    /// is resolved by the caller at this moment, not cached from
    /// construction, so it reflects late renames and permission grants.
    ///
    /// Idempotent: calling again re-registers advertising and discovery. A
    /// live connection is kept and the radio stays quiet around it.
    pub fn start(
        &mut self,
        channel_id: impl Into<String>,
        local_name: impl Into<String>,
    ) -> Vec<TransportCommand> {
        let channel_id = channel_id.into();
        self.local_name = local_name.into();
        info!(channel_id = %channel_id, local_name = %self.local_name, "starting peer link");
        self.channel_id = Some(channel_id);
        if !self.connected.is_empty() {
            debug!("start while connected; keeping the existing peer");
            return vec![
                TransportCommand::StopAdvertising,
                TransportCommand::StopDiscovery,
            ];
        }
        self.seek_commands()
    }

    /// Tear everything down. Clears the channel id first, so late transport
    /// callbacks cannot restart advertising or discovery.
    pub fn stop(&mut self) -> Vec<TransportCommand> {
        info!("stopping peer link");
        self.channel_id = None;
        self.discovered.clear();
        self.connected.clear();
        vec![
            TransportCommand::StopAdvertising,
            TransportCommand::StopDiscovery,
            TransportCommand::DisconnectAll,
        ]
    }

    /// Transmit a frame to every connected endpoint (0 or 1). An empty
    /// connection set drops the frame: not an error, just nobody to deliver to.
    pub fn send(&mut self, bytes: Vec<u8>) -> Vec<TransportCommand> {
        if self.connected.is_empty() {
            warn!("send with no connected endpoints; dropping frame");
            return Vec::new();
        }
        let endpoint_ids = self.connected.keys().cloned().collect();
        vec![TransportCommand::Send {
            endpoint_ids,
            bytes,
        }]
    }

    /// Apply one transport event. Payload events are routed by the owner to
    /// the decode path and never reach this method in normal operation.
    pub fn handle(&mut self, event: TransportEvent) -> Vec<TransportCommand> {
        match event {
            TransportEvent::EndpointFound { id, name } => self.on_endpoint_found(id, name),
            TransportEvent::EndpointLost { id } => {
                debug!(endpoint = %id, "endpoint lost");
                Vec::new()
            }
            TransportEvent::ConnectionInitiated { id, name } => {
                self.on_connection_initiated(id, name)
            }
            TransportEvent::ConnectionResult { id, outcome } => {
                self.on_connection_result(id, outcome)
            }
            TransportEvent::Disconnected { id } => self.on_disconnected(id),
            TransportEvent::PayloadReceived { id, .. } => {
                debug!(endpoint = %id, "payload event reached the manager; owner routes these");
                Vec::new()
            }
        }
    }

    fn on_endpoint_found(&mut self, id: EndpointId, name: String) -> Vec<TransportCommand> {
        if self.channel_id.is_none() {
            debug!(endpoint = %id, "endpoint found after stop; ignoring");
            return Vec::new();
        }
        if !self.connected.is_empty() {
            // Single-peer policy, enforced even under racing discovery events.
            debug!(endpoint = %id, name = %name, "endpoint found while connected; ignoring");
            return Vec::new();
        }
        info!(endpoint = %id, name = %name, "endpoint found; requesting connection");
        self.discovered.insert(id.clone(), name);
        vec![TransportCommand::RequestConnection {
            local_name: self.local_name.clone(),
            endpoint_id: id,
        }]
    }

    fn on_connection_initiated(&mut self, id: EndpointId, name: String) -> Vec<TransportCommand> {
        if self.channel_id.is_none() {
            debug!(endpoint = %id, "connection initiated after stop; ignoring");
            return Vec::new();
        }
        // No allow-list: trust is the shared channel identifier alone.
        info!(endpoint = %id, name = %name, "connection initiated; accepting");
        self.discovered.insert(id.clone(), name);
        vec![TransportCommand::AcceptConnection { endpoint_id: id }]
    }

    fn on_connection_result(
        &mut self,
        id: EndpointId,
        outcome: ConnectionOutcome,
    ) -> Vec<TransportCommand> {
        let name = self
            .discovered
            .remove(&id)
            .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());
        match outcome {
            ConnectionOutcome::Connected | ConnectionOutcome::AlreadyConnected => {
                if self.channel_id.is_none() {
                    debug!(endpoint = %id, "connection success after stop; ignoring");
                    return Vec::new();
                }
                if self.connected.contains_key(&id) {
                    debug!(endpoint = %id, "duplicate connection success; already tracked");
                    return Vec::new();
                }
                if !self.connected.is_empty() {
                    warn!(endpoint = %id, name = %name, "connection success while another peer is connected; ignoring");
                    return Vec::new();
                }
                info!(endpoint = %id, name = %name, "connected");
                self.connected.insert(id, name);
                vec![
                    TransportCommand::StopAdvertising,
                    TransportCommand::StopDiscovery,
                ]
            }
            ConnectionOutcome::Failed => {
                warn!(endpoint = %id, name = %name, "connection failed");
                if self.connected.is_empty() && self.channel_id.is_some() {
                    self.seek_commands()
                } else {
                    // Stale failure for an old attempt; nothing to recover.
                    Vec::new()
                }
            }
        }
    }

    fn on_disconnected(&mut self, id: EndpointId) -> Vec<TransportCommand> {
        match self.connected.remove(&id) {
            Some(name) => info!(endpoint = %id, name = %name, "disconnected"),
            None => debug!(endpoint = %id, "disconnect for an untracked endpoint"),
        }
        if self.connected.is_empty() && self.channel_id.is_some() {
            self.seek_commands()
        } else {
            debug!("disconnect after stop or with a live peer; not reseeking");
            Vec::new()
        }
    }

    /// Defensive stop-then-start: the transport's advertise/discover
    /// registration is not idempotent, and a duplicate registration wedges
    /// the session.
    fn seek_commands(&self) -> Vec<TransportCommand> {
        let channel_id = match &self.channel_id {
            Some(channel_id) => channel_id.clone(),
            None => return Vec::new(),
        };
        vec![
            TransportCommand::StopAdvertising,
            TransportCommand::Advertise {
                local_name: self.local_name.clone(),
                channel_id: channel_id.clone(),
            },
            TransportCommand::StopDiscovery,
            TransportCommand::Discover { channel_id },
        ]
    }

    pub fn phase(&self) -> Phase {
        if self.channel_id.is_none() {
            Phase::Stopped
        } else if !self.connected.is_empty() {
            Phase::Connected
        } else if !self.discovered.is_empty() {
            Phase::Connecting
        } else {
            Phase::Seeking
        }
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    /// Display names of connected peers, for the status surface.
    pub fn connected_names(&self) -> Vec<String> {
        self.connected.values().cloned().collect()
    }

    /// Read-only snapshot of the connection set.
    pub fn connected_endpoints(&self) -> Vec<Endpoint> {
        self.connected
            .iter()
            .map(|(id, name)| Endpoint {
                id: id.clone(),
                display_name: name.clone(),
            })
            .collect()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> ConnectionManager {
        let mut manager = ConnectionManager::new();
        manager.start("chan-a", "Pixel 8");
        manager
    }

    /// Drive a manager into Connected with the given endpoint id.
    fn connect(manager: &mut ConnectionManager, id: &str, name: &str) {
        manager.handle(TransportEvent::EndpointFound {
            id: id.into(),
            name: name.to_string(),
        });
        manager.handle(TransportEvent::ConnectionResult {
            id: id.into(),
            outcome: ConnectionOutcome::Connected,
        });
        assert_eq!(manager.phase(), Phase::Connected);
    }

    fn seek_commands_for(channel_id: &str, local_name: &str) -> Vec<TransportCommand> {
        vec![
            TransportCommand::StopAdvertising,
            TransportCommand::Advertise {
                local_name: local_name.to_string(),
                channel_id: channel_id.to_string(),
            },
            TransportCommand::StopDiscovery,
            TransportCommand::Discover {
                channel_id: channel_id.to_string(),
            },
        ]
    }

    #[test]
    fn start_stops_then_restarts_both_registrations() {
        let mut manager = ConnectionManager::new();
        let commands = manager.start("chan-a", "Pixel 8");
        assert_eq!(commands, seek_commands_for("chan-a", "Pixel 8"));
        assert_eq!(manager.phase(), Phase::Seeking);
    }

    #[test]
    fn start_is_idempotent_while_seeking() {
        let mut manager = started();
        let commands = manager.start("chan-a", "Pixel 8");
        assert_eq!(commands, seek_commands_for("chan-a", "Pixel 8"));
        assert_eq!(manager.phase(), Phase::Seeking);
    }

    #[test]
    fn found_endpoint_gets_a_connection_request() {
        let mut manager = started();
        let commands = manager.handle(TransportEvent::EndpointFound {
            id: "ep-1".into(),
            name: "Tab S9".to_string(),
        });
        assert_eq!(
            commands,
            vec![TransportCommand::RequestConnection {
                local_name: "Pixel 8".to_string(),
                endpoint_id: "ep-1".into(),
            }]
        );
        assert_eq!(manager.phase(), Phase::Connecting);
    }

    #[test]
    fn found_while_connected_is_ignored() {
        let mut manager = started();
        connect(&mut manager, "ep-1", "Tab S9");
        let commands = manager.handle(TransportEvent::EndpointFound {
            id: "ep-2".into(),
            name: "Other".to_string(),
        });
        assert!(commands.is_empty());
        assert_eq!(manager.connected_names(), vec!["Tab S9".to_string()]);
    }

    #[test]
    fn initiated_is_accepted_unconditionally() {
        let mut manager = started();
        let commands = manager.handle(TransportEvent::ConnectionInitiated {
            id: "ep-1".into(),
            name: "Tab S9".to_string(),
        });
        assert_eq!(
            commands,
            vec![TransportCommand::AcceptConnection {
                endpoint_id: "ep-1".into(),
            }]
        );
        assert_eq!(manager.phase(), Phase::Connecting);
    }

    #[test]
    fn success_halts_radio_and_records_the_peer() {
        let mut manager = started();
        manager.handle(TransportEvent::EndpointFound {
            id: "ep-1".into(),
            name: "Tab S9".to_string(),
        });
        let commands = manager.handle(TransportEvent::ConnectionResult {
            id: "ep-1".into(),
            outcome: ConnectionOutcome::Connected,
        });
        assert_eq!(
            commands,
            vec![
                TransportCommand::StopAdvertising,
                TransportCommand::StopDiscovery,
            ]
        );
        assert_eq!(manager.phase(), Phase::Connected);
        assert_eq!(manager.connected_names(), vec!["Tab S9".to_string()]);
    }

    #[test]
    fn already_connected_counts_as_success() {
        let mut manager = started();
        manager.handle(TransportEvent::EndpointFound {
            id: "ep-1".into(),
            name: "Tab S9".to_string(),
        });
        manager.handle(TransportEvent::ConnectionResult {
            id: "ep-1".into(),
            outcome: ConnectionOutcome::AlreadyConnected,
        });
        assert_eq!(manager.phase(), Phase::Connected);
    }

    #[test]
    fn duplicate_success_is_a_noop() {
        let mut manager = started();
        connect(&mut manager, "ep-1", "Tab S9");
        let commands = manager.handle(TransportEvent::ConnectionResult {
            id: "ep-1".into(),
            outcome: ConnectionOutcome::Connected,
        });
        assert!(commands.is_empty());
        assert_eq!(manager.connected_endpoints().len(), 1);
    }

    #[test]
    fn success_for_a_second_endpoint_never_grows_the_set() {
        let mut manager = started();
        // Two candidates race; both attempts are in flight.
        manager.handle(TransportEvent::EndpointFound {
            id: "ep-1".into(),
            name: "Tab S9".to_string(),
        });
        manager.handle(TransportEvent::EndpointFound {
            id: "ep-2".into(),
            name: "Other".to_string(),
        });
        manager.handle(TransportEvent::ConnectionResult {
            id: "ep-1".into(),
            outcome: ConnectionOutcome::Connected,
        });
        let commands = manager.handle(TransportEvent::ConnectionResult {
            id: "ep-2".into(),
            outcome: ConnectionOutcome::Connected,
        });
        assert!(commands.is_empty());
        assert_eq!(manager.connected_endpoints().len(), 1);
        assert_eq!(manager.connected_names(), vec!["Tab S9".to_string()]);
    }

    #[test]
    fn failure_restarts_seeking() {
        let mut manager = started();
        manager.handle(TransportEvent::EndpointFound {
            id: "ep-1".into(),
            name: "Tab S9".to_string(),
        });
        let commands = manager.handle(TransportEvent::ConnectionResult {
            id: "ep-1".into(),
            outcome: ConnectionOutcome::Failed,
        });
        assert_eq!(commands, seek_commands_for("chan-a", "Pixel 8"));
        assert_eq!(manager.phase(), Phase::Seeking);
    }

    #[test]
    fn stale_failure_while_connected_changes_nothing() {
        let mut manager = started();
        connect(&mut manager, "ep-1", "Tab S9");
        let commands = manager.handle(TransportEvent::ConnectionResult {
            id: "ep-2".into(),
            outcome: ConnectionOutcome::Failed,
        });
        assert!(commands.is_empty());
        assert_eq!(manager.phase(), Phase::Connected);
    }

    #[test]
    fn disconnect_reseeks_while_a_channel_is_set() {
        let mut manager = started();
        connect(&mut manager, "ep-1", "Tab S9");
        let commands = manager.handle(TransportEvent::Disconnected { id: "ep-1".into() });
        assert_eq!(commands, seek_commands_for("chan-a", "Pixel 8"));
        assert_eq!(manager.phase(), Phase::Seeking);
        assert!(manager.connected_names().is_empty());
    }

    #[test]
    fn late_events_after_stop_never_resurrect_the_link() {
        let mut manager = started();
        manager.handle(TransportEvent::EndpointFound {
            id: "ep-1".into(),
            name: "Tab S9".to_string(),
        });
        manager.stop();
        assert!(manager
            .handle(TransportEvent::EndpointFound {
                id: "ep-2".into(),
                name: "Other".to_string(),
            })
            .is_empty());
        assert!(manager
            .handle(TransportEvent::ConnectionInitiated {
                id: "ep-2".into(),
                name: "Other".to_string(),
            })
            .is_empty());
        assert!(manager
            .handle(TransportEvent::ConnectionResult {
                id: "ep-1".into(),
                outcome: ConnectionOutcome::Connected,
            })
            .is_empty());
        assert_eq!(manager.phase(), Phase::Stopped);
        assert!(manager.connected_endpoints().is_empty());
    }

    #[test]
    fn late_disconnect_after_stop_stays_stopped() {
        let mut manager = started();
        connect(&mut manager, "ep-1", "Tab S9");
        manager.stop();
        let commands = manager.handle(TransportEvent::Disconnected { id: "ep-1".into() });
        assert!(commands.is_empty());
        assert_eq!(manager.phase(), Phase::Stopped);
    }

    #[test]
    fn stop_tears_everything_down() {
        let mut manager = started();
        connect(&mut manager, "ep-1", "Tab S9");
        let commands = manager.stop();
        assert_eq!(
            commands,
            vec![
                TransportCommand::StopAdvertising,
                TransportCommand::StopDiscovery,
                TransportCommand::DisconnectAll,
            ]
        );
        assert_eq!(manager.phase(), Phase::Stopped);
        assert!(manager.connected_endpoints().is_empty());
        assert!(manager.channel_id().is_none());
    }

    #[test]
    fn send_with_no_peer_drops_the_frame() {
        let mut manager = started();
        assert!(manager.send(b"call:5551234".to_vec()).is_empty());
    }

    #[test]
    fn send_targets_the_connected_peer() {
        let mut manager = started();
        connect(&mut manager, "ep-1", "Tab S9");
        let commands = manager.send(b"call:5551234".to_vec());
        assert_eq!(
            commands,
            vec![TransportCommand::Send {
                endpoint_ids: vec!["ep-1".into()],
                bytes: b"call:5551234".to_vec(),
            }]
        );
    }

    #[test]
    fn send_is_valid_while_stopped() {
        let mut manager = ConnectionManager::new();
        assert!(manager.send(b"action:dismiss".to_vec()).is_empty());
        assert_eq!(manager.phase(), Phase::Stopped);
    }

    #[test]
    fn success_without_prior_name_falls_back() {
        let mut manager = started();
        manager.handle(TransportEvent::ConnectionResult {
            id: "ep-9".into(),
            outcome: ConnectionOutcome::Connected,
        });
        assert_eq!(manager.connected_names(), vec!["Unknown Device".to_string()]);
    }

    #[test]
    fn start_while_connected_keeps_the_peer_and_the_quiet_radio() {
        let mut manager = started();
        connect(&mut manager, "ep-1", "Tab S9");
        let commands = manager.start("chan-a", "Pixel 8 Pro");
        assert_eq!(
            commands,
            vec![
                TransportCommand::StopAdvertising,
                TransportCommand::StopDiscovery,
            ]
        );
        assert_eq!(manager.phase(), Phase::Connected);
        assert_eq!(manager.connected_names(), vec!["Tab S9".to_string()]);
    }
}
