//! The long-running coordinator task.
//!
//! One task owns the connection manager and all channel state. Transport
//! callbacks and owner operations drain through a single `select!` loop, so
//! transitions apply strictly in arrival order and the manager needs no
//! locking. The latest notification message and the connected device names
//! are published on watch channels for observers.

use std::sync::Arc;

use sidecall_core::{
    apply_event, codec, ConnectionManager, ConnectionOutcome, ContactResolver, DomainEvent,
    EndpointId, LatestChange, NotificationDispatch, TransportCommand, TransportEvent,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::transport::{EventReceiver, Transport};

/// Owner-side operation, serialized into the coordinator loop.
#[derive(Debug)]
enum Control {
    Start {
        channel_id: String,
        local_name: String,
    },
    Stop,
    SendEvent(DomainEvent),
    ClearLatest,
}

/// Handle to a running coordinator. Cheap to clone; dropping every handle
/// (together with the transport's event sender) ends the task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    control: mpsc::UnboundedSender<Control>,
    latest: watch::Receiver<Option<String>>,
    names: watch::Receiver<Vec<String>>,
}

impl CoordinatorHandle {
    /// Begin seeking under `channel_id`. The local display name is resolved
    /// at this moment so it reflects renames since the last start.
    pub fn start(&self, channel_id: impl Into<String>, local_name: impl Into<String>) {
        let _ = self.control.send(Control::Start {
            channel_id: channel_id.into(),
            local_name: local_name.into(),
        });
    }

    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    /// Encode and relay a domain event to the connected peer, if any.
    pub fn send_event(&self, event: DomainEvent) {
        let _ = self.control.send(Control::SendEvent(event));
    }

    /// Clear the latest message (the user dismissed it or left the view).
    pub fn clear_latest(&self) {
        let _ = self.control.send(Control::ClearLatest);
    }

    /// The most recent user-facing message, if one is showing.
    pub fn latest_message(&self) -> watch::Receiver<Option<String>> {
        self.latest.clone()
    }

    /// Display names of currently connected peers.
    pub fn connected_names(&self) -> watch::Receiver<Vec<String>> {
        self.names.clone()
    }
}

/// Spawn the coordinator task. `events` is the transport's callback queue.
pub fn spawn(
    transport: Arc<dyn Transport>,
    events: EventReceiver,
    dispatch: Arc<dyn NotificationDispatch>,
    contacts: Arc<dyn ContactResolver>,
) -> CoordinatorHandle {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (latest_tx, latest_rx) = watch::channel(None);
    let (names_tx, names_rx) = watch::channel(Vec::new());
    let coordinator = Coordinator {
        manager: ConnectionManager::new(),
        transport,
        events,
        control: control_rx,
        dispatch,
        contacts,
        latest: latest_tx,
        names: names_tx,
    };
    tokio::spawn(coordinator.run());
    CoordinatorHandle {
        control: control_tx,
        latest: latest_rx,
        names: names_rx,
    }
}

struct Coordinator {
    manager: ConnectionManager,
    transport: Arc<dyn Transport>,
    events: EventReceiver,
    control: mpsc::UnboundedReceiver<Control>,
    dispatch: Arc<dyn NotificationDispatch>,
    contacts: Arc<dyn ContactResolver>,
    latest: watch::Sender<Option<String>>,
    names: watch::Sender<Vec<String>>,
}

impl Coordinator {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(control) = self.control.recv() => self.on_control(control).await,
                Some(event) = self.events.recv() => self.on_event(event).await,
                else => break,
            }
        }
        debug!("coordinator loop ended");
    }

    async fn on_control(&mut self, control: Control) {
        match control {
            Control::Start {
                channel_id,
                local_name,
            } => {
                let commands = self.manager.start(channel_id, local_name);
                self.execute(commands).await;
                self.publish_names();
            }
            Control::Stop => {
                let commands = self.manager.stop();
                self.execute(commands).await;
                self.publish_names();
            }
            Control::SendEvent(event) => {
                let frame = codec::encode(&event);
                debug!(frame = %frame, "relaying event");
                let commands = self.manager.send(frame.into_bytes());
                self.execute(commands).await;
            }
            Control::ClearLatest => {
                self.latest.send_if_modified(|latest| {
                    let changed = latest.is_some();
                    *latest = None;
                    changed
                });
            }
        }
    }

    async fn on_event(&mut self, event: TransportEvent) {
        if let TransportEvent::PayloadReceived { id, bytes } = event {
            self.on_payload(id, bytes);
            return;
        }
        let commands = self.manager.handle(event);
        self.execute(commands).await;
        self.publish_names();
    }

    fn on_payload(&mut self, id: EndpointId, bytes: Vec<u8>) {
        let raw = match String::from_utf8(bytes) {
            Ok(raw) => raw,
            Err(_) => {
                warn!(endpoint = %id, "non-UTF-8 payload; dropping");
                return;
            }
        };
        debug!(endpoint = %id, frame = %raw, "payload received");
        let Some(event) = codec::decode(&raw) else {
            debug!(frame = %raw, "frame decodes to nothing; dropping");
            return;
        };
        let change = apply_event(&event, self.contacts.as_ref(), self.dispatch.as_ref());
        let value = match change {
            LatestChange::Set(text) => Some(text),
            LatestChange::Clear => None,
        };
        self.latest.send_if_modified(|latest| {
            if *latest == value {
                false
            } else {
                *latest = value;
                true
            }
        });
    }

    /// Execute manager commands against the transport. Failures are logged
    /// and absorbed; a failed connection request is fed back to the manager
    /// as a failed result so the usual recovery path runs.
    async fn execute(&mut self, mut commands: Vec<TransportCommand>) {
        while !commands.is_empty() {
            let mut feedback = Vec::new();
            for command in commands {
                match command {
                    TransportCommand::Advertise {
                        local_name,
                        channel_id,
                    } => {
                        if let Err(error) = self.transport.advertise(&local_name, &channel_id).await
                        {
                            warn!(%error, "advertise failed");
                        }
                    }
                    TransportCommand::Discover { channel_id } => {
                        if let Err(error) = self.transport.discover(&channel_id).await {
                            warn!(%error, "discover failed");
                        }
                    }
                    TransportCommand::StopAdvertising => self.transport.stop_advertising().await,
                    TransportCommand::StopDiscovery => self.transport.stop_discovery().await,
                    TransportCommand::RequestConnection {
                        local_name,
                        endpoint_id,
                    } => {
                        if let Err(error) = self
                            .transport
                            .request_connection(&local_name, &endpoint_id)
                            .await
                        {
                            warn!(endpoint = %endpoint_id, %error, "connection request failed");
                            feedback.push(TransportEvent::ConnectionResult {
                                id: endpoint_id,
                                outcome: ConnectionOutcome::Failed,
                            });
                        }
                    }
                    TransportCommand::AcceptConnection { endpoint_id } => {
                        if let Err(error) = self.transport.accept_connection(&endpoint_id).await {
                            warn!(endpoint = %endpoint_id, %error, "accept failed");
                        }
                    }
                    TransportCommand::Send {
                        endpoint_ids,
                        bytes,
                    } => {
                        if let Err(error) = self.transport.send(&endpoint_ids, &bytes).await {
                            warn!(%error, "send failed; frame dropped");
                        }
                    }
                    TransportCommand::DisconnectAll => self.transport.disconnect_all().await,
                }
            }
            commands = Vec::new();
            for event in feedback {
                commands.extend(self.manager.handle(event));
            }
        }
    }

    fn publish_names(&mut self) {
        let current = self.manager.connected_names();
        self.names.send_if_modified(|names| {
            if *names == current {
                false
            } else {
                *names = current;
                true
            }
        });
    }
}
