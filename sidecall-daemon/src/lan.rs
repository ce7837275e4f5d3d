//! LAN transport: UDP multicast advertise/discover, TCP peer connections.
//!
//! Control frames are bincode with a 4-byte LE length prefix. Event payload
//! bytes ride opaque inside `Payload` frames; this layer never inspects them.
//! A connection goes live only after both sides have sent `Accept`, matching
//! the initiated/accept surface the manager drives.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sidecall_core::{ConnectionOutcome, EndpointId, TransportEvent};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{EventSender, Transport};

const CONTROL_VERSION: u8 = 1;
const MULTICAST_GROUP: &str = "239.255.71.18";
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 64 * 1024;

/// Control frame between daemons.
#[derive(Debug, Serialize, Deserialize)]
enum Control {
    /// Multicast presence announcement.
    Beacon {
        version: u8,
        /// Random per-process token so a daemon skips its own beacons.
        instance: String,
        channel_id: String,
        name: String,
        listen_port: u16,
    },
    /// TCP opening handshake, exchanged in both directions.
    Hello {
        version: u8,
        channel_id: String,
        name: String,
    },
    /// The local side accepted the pending connection.
    Accept,
    /// An opaque event frame for the decode path.
    Payload(Vec<u8>),
}

fn encode_frame(msg: &Control) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg).context("encode control frame")?;
    anyhow::ensure!(payload.len() as u64 <= MAX_FRAME_LEN as u64, "frame too large");
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_datagram(bytes: &[u8]) -> Result<Control> {
    anyhow::ensure!(bytes.len() >= LEN_SIZE, "short datagram");
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    anyhow::ensure!(
        len <= MAX_FRAME_LEN as usize && bytes.len() >= LEN_SIZE + len,
        "bad datagram length"
    );
    bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).context("decode control frame")
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Control> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("read frame length")?;
    let len = u32::from_le_bytes(len_buf);
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame too large");
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.context("read frame body")?;
    bincode::deserialize(&buf).context("decode control frame")
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Control) -> Result<()> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await.context("write frame")?;
    writer.flush().await.context("flush frame")?;
    Ok(())
}

#[derive(Default)]
struct LanState {
    local_name: String,
    /// Channel currently advertised/discovered under; gates inbound handshakes.
    channel_id: Option<String>,
    advertise_task: Option<JoinHandle<()>>,
    discover_task: Option<JoinHandle<()>>,
    /// Discovered candidate addresses by assigned endpoint id.
    addrs: HashMap<EndpointId, SocketAddr>,
    /// Beacon dedup: peer address -> assigned endpoint id.
    seen: HashMap<SocketAddr, EndpointId>,
    /// Pending connections awaiting the local accept.
    pending: HashMap<EndpointId, oneshot::Sender<()>>,
    /// Established links: endpoint id -> payload writer.
    links: HashMap<EndpointId, mpsc::UnboundedSender<Vec<u8>>>,
}

/// State and event queue shared with the socket tasks.
#[derive(Clone)]
struct Shared {
    state: Arc<Mutex<LanState>>,
    events: EventSender,
}

/// LAN implementation of [`Transport`].
pub struct LanTransport {
    shared: Shared,
    instance: String,
    discovery_port: u16,
    listen_port: u16,
    discovery_socket: Arc<UdpSocket>,
}

impl LanTransport {
    /// Bind the TCP listener and the multicast discovery socket, and start
    /// accepting inbound connections. Pass `0` as the transport port for an
    /// ephemeral one.
    pub async fn bind(
        events: EventSender,
        discovery_port: u16,
        transport_port: u16,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", transport_port))
            .await
            .context("bind transport port")?;
        let listen_port = listener.local_addr().context("transport local addr")?.port();
        let discovery_socket = Arc::new(make_multicast_socket(discovery_port)?);
        let shared = Shared {
            state: Arc::new(Mutex::new(LanState::default())),
            events,
        };
        let transport = Arc::new(Self {
            shared: shared.clone(),
            instance: uuid::Uuid::new_v4().to_string(),
            discovery_port,
            listen_port,
            discovery_socket,
        });
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            if let Err(error) = shared.run_inbound(stream).await {
                                debug!(%addr, %error, "inbound connection ended");
                            }
                        });
                    }
                    Err(error) => {
                        warn!(%error, "accept failed; listener closing");
                        break;
                    }
                }
            }
        });
        info!(listen_port, discovery_port, "LAN transport bound");
        Ok(transport)
    }

    /// The TCP port peers connect to.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }
}

#[async_trait]
impl Transport for LanTransport {
    async fn advertise(&self, local_name: &str, channel_id: &str) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .context("bind beacon socket")?;
        socket
            .set_multicast_ttl_v4(1)
            .context("set multicast ttl")?;
        let dest: SocketAddr = format!("{}:{}", MULTICAST_GROUP, self.discovery_port)
            .parse()
            .context("multicast group address")?;
        let beacon = Control::Beacon {
            version: CONTROL_VERSION,
            instance: self.instance.clone(),
            channel_id: channel_id.to_string(),
            name: local_name.to_string(),
            listen_port: self.listen_port,
        };
        let frame = encode_frame(&beacon)?;
        let mut state = self.shared.state.lock().await;
        state.local_name = local_name.to_string();
        state.channel_id = Some(channel_id.to_string());
        if let Some(task) = state.advertise_task.take() {
            task.abort();
        }
        state.advertise_task = Some(tokio::spawn(async move {
            loop {
                if let Err(error) = socket.send_to(&frame, dest).await {
                    debug!(%error, "beacon send failed");
                }
                tokio::time::sleep(BEACON_INTERVAL).await;
            }
        }));
        info!(channel_id, local_name, "advertising");
        Ok(())
    }

    async fn discover(&self, channel_id: &str) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state.channel_id = Some(channel_id.to_string());
        if let Some(task) = state.discover_task.take() {
            task.abort();
        }
        // The socket outlives discovery sessions; only the loop task restarts.
        state.discover_task = Some(tokio::spawn(discover_loop(
            Arc::clone(&self.discovery_socket),
            channel_id.to_string(),
            self.instance.clone(),
            self.shared.clone(),
        )));
        info!(channel_id, "discovering");
        Ok(())
    }

    async fn stop_advertising(&self) {
        let mut state = self.shared.state.lock().await;
        if let Some(task) = state.advertise_task.take() {
            task.abort();
            debug!("advertising stopped");
        }
    }

    async fn stop_discovery(&self) {
        let mut state = self.shared.state.lock().await;
        if let Some(task) = state.discover_task.take() {
            task.abort();
            debug!("discovery stopped");
        }
        // A fresh discovery session re-finds peers under new ids.
        state.seen.clear();
    }

    async fn request_connection(&self, local_name: &str, endpoint_id: &EndpointId) -> Result<()> {
        let (addr, channel) = {
            let mut state = self.shared.state.lock().await;
            state.local_name = local_name.to_string();
            let addr = state
                .addrs
                .get(endpoint_id)
                .copied()
                .context("unknown endpoint")?;
            let channel = state.channel_id.clone().context("no active channel")?;
            (addr, channel)
        };
        let shared = self.shared.clone();
        let id = endpoint_id.clone();
        let local_name = local_name.to_string();
        tokio::spawn(shared.run_outbound(id, addr, channel, local_name));
        Ok(())
    }

    async fn accept_connection(&self, endpoint_id: &EndpointId) -> Result<()> {
        let gate = self.shared.state.lock().await.pending.remove(endpoint_id);
        match gate {
            Some(accept) => {
                let _ = accept.send(());
                Ok(())
            }
            None => {
                debug!(endpoint = %endpoint_id, "accept for an unknown pending endpoint");
                Ok(())
            }
        }
    }

    async fn send(&self, endpoint_ids: &[EndpointId], bytes: &[u8]) -> Result<()> {
        let state = self.shared.state.lock().await;
        for endpoint_id in endpoint_ids {
            match state.links.get(endpoint_id) {
                Some(link) => {
                    let _ = link.send(bytes.to_vec());
                }
                None => debug!(endpoint = %endpoint_id, "send to an unknown link; dropping"),
            }
        }
        Ok(())
    }

    async fn disconnect_all(&self) {
        let mut state = self.shared.state.lock().await;
        // Dropping the accept gates tears pending handshakes down; dropping
        // the writers closes established sockets.
        state.pending.clear();
        state.links.clear();
        state.addrs.clear();
        state.seen.clear();
        state.channel_id = None;
        debug!("all connections dropped");
    }
}

impl Shared {
    /// Listener side: validate the peer's hello against the active channel,
    /// answer with ours, then run the shared connection lifecycle.
    async fn run_inbound(self, mut stream: TcpStream) -> Result<()> {
        let hello = read_frame(&mut stream).await?;
        let Control::Hello {
            version,
            channel_id: peer_channel,
            name: peer_name,
        } = hello
        else {
            anyhow::bail!("unexpected opening frame");
        };
        anyhow::ensure!(version == CONTROL_VERSION, "protocol version mismatch");
        let (channel, local_name) = {
            let state = self.state.lock().await;
            (state.channel_id.clone(), state.local_name.clone())
        };
        let channel = channel.context("no active channel")?;
        anyhow::ensure!(peer_channel == channel, "channel mismatch");
        write_frame(
            &mut stream,
            &Control::Hello {
                version: CONTROL_VERSION,
                channel_id: channel,
                name: local_name,
            },
        )
        .await?;
        let id = EndpointId::new(uuid::Uuid::new_v4().to_string());
        self.run_connection(stream, id, peer_name).await
    }

    /// Connector side: dial, exchange hellos, then run the shared lifecycle.
    /// Failures surface as a failed connection result, never as an error to
    /// the caller.
    async fn run_outbound(
        self,
        id: EndpointId,
        addr: SocketAddr,
        channel: String,
        local_name: String,
    ) {
        let handshake = async {
            let mut stream = TcpStream::connect(addr).await.context("connect")?;
            write_frame(
                &mut stream,
                &Control::Hello {
                    version: CONTROL_VERSION,
                    channel_id: channel.clone(),
                    name: local_name,
                },
            )
            .await?;
            match read_frame(&mut stream).await? {
                Control::Hello {
                    version,
                    channel_id,
                    name,
                } if version == CONTROL_VERSION && channel_id == channel => Ok((stream, name)),
                _ => Err(anyhow::anyhow!("handshake rejected")),
            }
        }
        .await;
        match handshake {
            Ok((stream, peer_name)) => {
                if let Err(error) = self.run_connection(stream, id.clone(), peer_name).await {
                    debug!(endpoint = %id, %error, "connection ended");
                }
            }
            Err(error) => {
                warn!(endpoint = %id, %addr, %error, "outbound connection failed");
                let _ = self.events.send(TransportEvent::ConnectionResult {
                    id,
                    outcome: ConnectionOutcome::Failed,
                });
            }
        }
    }

    /// Surface the pending connection, gate on the local accept, complete
    /// the accept exchange, then relay payload frames until the peer goes away.
    async fn run_connection(
        self,
        stream: TcpStream,
        id: EndpointId,
        peer_name: String,
    ) -> Result<()> {
        let (accept_tx, accept_rx) = oneshot::channel();
        self.state
            .lock()
            .await
            .pending
            .insert(id.clone(), accept_tx);
        let _ = self.events.send(TransportEvent::ConnectionInitiated {
            id: id.clone(),
            name: peer_name,
        });

        let (mut reader, mut writer) = stream.into_split();
        let accepted = async {
            accept_rx
                .await
                .map_err(|_| anyhow::anyhow!("pending connection torn down"))?;
            write_frame(&mut writer, &Control::Accept).await?;
            match read_frame(&mut reader).await? {
                Control::Accept => Ok(()),
                _ => Err(anyhow::anyhow!("peer sent an unexpected frame before accepting")),
            }
        }
        .await;
        if let Err(error) = accepted {
            self.state.lock().await.pending.remove(&id);
            let _ = self.events.send(TransportEvent::ConnectionResult {
                id,
                outcome: ConnectionOutcome::Failed,
            });
            return Err(error);
        }

        let (payload_tx, mut payload_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = payload_rx.recv().await {
                if write_frame(&mut writer, &Control::Payload(bytes)).await.is_err() {
                    break;
                }
            }
        });
        self.state.lock().await.links.insert(id.clone(), payload_tx);
        let _ = self.events.send(TransportEvent::ConnectionResult {
            id: id.clone(),
            outcome: ConnectionOutcome::Connected,
        });

        loop {
            match read_frame(&mut reader).await {
                Ok(Control::Payload(bytes)) => {
                    let _ = self.events.send(TransportEvent::PayloadReceived {
                        id: id.clone(),
                        bytes,
                    });
                }
                Ok(_) => debug!(endpoint = %id, "unexpected control frame on an established link"),
                Err(_) => break,
            }
        }
        writer_task.abort();
        // A local disconnect_all already untracked the link; only a peer-side
        // drop surfaces as a disconnection.
        let was_tracked = self.state.lock().await.links.remove(&id).is_some();
        if was_tracked {
            let _ = self.events.send(TransportEvent::Disconnected { id });
        }
        Ok(())
    }
}

async fn discover_loop(socket: Arc<UdpSocket>, channel: String, instance: String, shared: Shared) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) => {
                warn!(%error, "discovery socket error");
                break;
            }
        };
        let Ok(control) = decode_datagram(&buf[..n]) else {
            continue;
        };
        let Control::Beacon {
            version,
            instance: peer_instance,
            channel_id,
            name,
            listen_port,
        } = control
        else {
            continue;
        };
        if version != CONTROL_VERSION || peer_instance == instance || channel_id != channel {
            continue;
        }
        let addr = SocketAddr::new(from.ip(), listen_port);
        let id = {
            let mut state = shared.state.lock().await;
            if state.seen.contains_key(&addr) {
                continue;
            }
            let id = EndpointId::new(uuid::Uuid::new_v4().to_string());
            state.seen.insert(addr, id.clone());
            state.addrs.insert(id.clone(), addr);
            id
        };
        info!(endpoint = %id, name = %name, %addr, "endpoint found");
        let _ = shared.events.send(TransportEvent::EndpointFound { id, name });
    }
}

fn make_multicast_socket(port: u16) -> Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", port)).context("bind discovery port")?;
    let group: std::net::Ipv4Addr = MULTICAST_GROUP
        .parse()
        .context("multicast group address")?;
    std_sock
        .join_multicast_v4(&group, &std::net::Ipv4Addr::UNSPECIFIED)
        .context("join multicast group")?;
    std_sock
        .set_nonblocking(true)
        .context("set discovery socket nonblocking")?;
    UdpSocket::from_std(std_sock).context("register discovery socket")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_roundtrip() {
        let beacon = Control::Beacon {
            version: CONTROL_VERSION,
            instance: "inst".to_string(),
            channel_id: "chan".to_string(),
            name: "Pixel 8".to_string(),
            listen_port: 45000,
        };
        let frame = encode_frame(&beacon).unwrap();
        match decode_datagram(&frame).unwrap() {
            Control::Beacon {
                channel_id, name, listen_port, ..
            } => {
                assert_eq!(channel_id, "chan");
                assert_eq!(name, "Pixel 8");
                assert_eq!(listen_port, 45000);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn short_datagram_is_rejected() {
        assert!(decode_datagram(&[1, 2]).is_err());
        // A length prefix promising more bytes than the datagram holds.
        assert!(decode_datagram(&[255, 0, 0, 0, 1]).is_err());
    }
}
