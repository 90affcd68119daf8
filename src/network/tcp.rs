//! TCP transport
//!
//! Frames are `MAGIC (4) + length (4, big endian) + JSON`. Both sides send a
//! `Hello` frame first so each end learns the other's peer id; after that
//! only envelopes flow.

use crate::error::{CoordinatorError, Result};
use crate::network::message::{Envelope, MAGIC, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use crate::network::transport::{ConnectionState, DialTarget, PeerTransport, INBOUND_CAPACITY};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::codec::{Decoder, Encoder, Framed};

/// How long the peer has to answer our hello
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Hello { peer_id: String, version: u32 },
    Envelope(Envelope),
}

/// Frame codec for length-prefixed framing
pub struct FrameCodec;

fn invalid_data(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let data = serde_json::to_vec(&item).map_err(|e| invalid_data(e.to_string()))?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(invalid_data("frame too large"));
        }

        // Magic (4) + Length (4) + Data
        dst.reserve(8 + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < 8 {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(invalid_data("Invalid magic bytes"));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(invalid_data("frame too large"));
        }
        if src.len() < 8 + len {
            src.reserve(8 + len - src.len());
            return Ok(None);
        }

        src.advance(8);
        let data = src.split_to(len);
        let frame = serde_json::from_slice(&data).map_err(|e| invalid_data(e.to_string()))?;
        Ok(Some(frame))
    }
}

/// Turn a dial address into `host:port`.
///
/// Accepts `/ip4/<ip>/tcp/<port>`, `/ip6/<ip>/tcp/<port>`,
/// `/dns4/<host>/tcp/<port>` and plain `host:port`.
pub fn parse_dial_addr(addr: &str) -> Option<String> {
    if !addr.starts_with('/') {
        return addr.contains(':').then(|| addr.to_string());
    }

    let parts: Vec<&str> = addr.trim_start_matches('/').split('/').collect();
    match parts.as_slice() {
        ["ip4", ip, "tcp", port] | ["dns4", ip, "tcp", port] | ["dns", ip, "tcp", port] => {
            port.parse::<u16>().ok()?;
            Some(format!("{}:{}", ip, port))
        }
        ["ip6", ip, "tcp", port] => {
            port.parse::<u16>().ok()?;
            Some(format!("[{}]:{}", ip, port))
        }
        _ => None,
    }
}

struct PeerLink {
    id: u64,
    tx: mpsc::Sender<Frame>,
    reader: AbortHandle,
}

struct Shared {
    peer_id: String,
    links: RwLock<HashMap<String, PeerLink>>,
    states: RwLock<HashMap<String, ConnectionState>>,
    inbound: mpsc::Sender<Envelope>,
    next_link: AtomicU64,
}

impl Shared {
    async fn set_state(&self, peer_id: &str, state: ConnectionState) {
        self.states.write().await.insert(peer_id.to_string(), state);
    }

    /// Exchange hellos. Returns the remote peer id.
    async fn handshake(
        &self,
        framed: &mut Framed<TcpStream, FrameCodec>,
        expected: Option<&str>,
    ) -> Result<String> {
        framed
            .send(Frame::Hello {
                peer_id: self.peer_id.clone(),
                version: PROTOCOL_VERSION,
            })
            .await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| CoordinatorError::Transport("handshake timed out".into()))?;

        match reply {
            Some(Ok(Frame::Hello { peer_id, version })) => {
                if version != PROTOCOL_VERSION {
                    return Err(CoordinatorError::Transport(format!(
                        "peer {} speaks protocol {}",
                        peer_id, version
                    )));
                }
                if let Some(expected) = expected {
                    if peer_id != expected {
                        return Err(CoordinatorError::Transport(format!(
                            "expected peer {}, got {}",
                            expected, peer_id
                        )));
                    }
                }
                Ok(peer_id)
            }
            Some(Ok(_)) => Err(CoordinatorError::Transport("expected hello".into())),
            Some(Err(e)) => Err(e.into()),
            None => Err(CoordinatorError::Transport("connection closed".into())),
        }
    }

    /// Register an established connection and start its reader and writer
    async fn attach(self: &Arc<Self>, peer_id: String, framed: Framed<TcpStream, FrameCodec>) {
        let (mut writer, mut reader) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Frame>(100);
        let id = self.next_link.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.send(frame).await {
                    log::debug!("Write failed: {}", e);
                    break;
                }
            }
        });

        let shared = self.clone();
        let remote = peer_id.clone();
        let reader_task: JoinHandle<()> = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Frame::Envelope(envelope)) => {
                        if envelope.from_peer != remote {
                            log::warn!(
                                "Dropping envelope claiming {} on link to {}",
                                envelope.from_peer,
                                remote
                            );
                            continue;
                        }
                        if shared.inbound.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Ok(Frame::Hello { .. }) => log::debug!("Ignoring repeated hello from {}", remote),
                    Err(e) => {
                        log::debug!("Read from {} failed: {}", remote, e);
                        break;
                    }
                }
            }

            let mut links = shared.links.write().await;
            if links.get(&remote).map(|l| l.id) == Some(id) {
                links.remove(&remote);
                drop(links);
                shared.set_state(&remote, ConnectionState::Disconnected).await;
                log::info!("Peer {} disconnected", remote);
            }
        });

        let previous = self.links.write().await.insert(
            peer_id.clone(),
            PeerLink {
                id,
                tx,
                reader: reader_task.abort_handle(),
            },
        );
        if let Some(previous) = previous {
            previous.reader.abort();
        }
        self.set_state(&peer_id, ConnectionState::Connected).await;
    }
}

/// Transport over plain TCP
pub struct TcpTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    /// Listen on `addr` and accept peers in the background
    pub async fn bind(
        peer_id: &str,
        addr: &str,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Envelope>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Listening on {} as {}", local_addr, peer_id);

        let (inbound, rx) = mpsc::channel(INBOUND_CAPACITY);
        let shared = Arc::new(Shared {
            peer_id: peer_id.to_string(),
            links: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            inbound,
            next_link: AtomicU64::new(1),
        });

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                let shared = accept_shared.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, FrameCodec);
                    match shared.handshake(&mut framed, None).await {
                        Ok(peer_id) => {
                            log::info!("Accepted peer {} from {}", peer_id, remote);
                            shared.attach(peer_id, framed).await;
                        }
                        Err(e) => log::debug!("Handshake with {} failed: {}", remote, e),
                    }
                });
            }
        });

        Ok((
            Arc::new(Self {
                shared,
                local_addr,
                accept_task,
            }),
            rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Our listen address as a multiaddr, for advertisements
    pub fn local_multiaddr(&self) -> String {
        match self.local_addr {
            SocketAddr::V4(addr) => format!("/ip4/{}/tcp/{}", addr.ip(), addr.port()),
            SocketAddr::V6(addr) => format!("/ip6/{}/tcp/{}", addr.ip(), addr.port()),
        }
    }

    pub async fn connected_peers(&self) -> Vec<String> {
        self.shared.links.read().await.keys().cloned().collect()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    fn local_peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    fn listen_addrs(&self) -> Vec<String> {
        vec![self.local_multiaddr()]
    }

    async fn connect(&self, target: &DialTarget) -> Result<()> {
        if self.shared.links.read().await.contains_key(&target.peer_id) {
            return Ok(());
        }

        let addrs: Vec<String> = target
            .multiaddrs
            .iter()
            .filter_map(|a| parse_dial_addr(a))
            .collect();
        if addrs.is_empty() {
            self.shared
                .set_state(&target.peer_id, ConnectionState::Failed)
                .await;
            return Err(CoordinatorError::ParticipantUnreachable(format!(
                "{} (no dialable address)",
                target.peer_id
            )));
        }

        self.shared
            .set_state(&target.peer_id, ConnectionState::Connecting)
            .await;

        let mut last_error = String::new();
        for addr in addrs {
            let stream = match TcpStream::connect(&addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };
            let mut framed = Framed::new(stream, FrameCodec);
            match self
                .shared
                .handshake(&mut framed, Some(&target.peer_id))
                .await
            {
                Ok(peer_id) => {
                    log::info!("Connected to peer {} at {}", peer_id, addr);
                    self.shared.attach(peer_id, framed).await;
                    return Ok(());
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        self.shared
            .set_state(&target.peer_id, ConnectionState::Failed)
            .await;
        Err(CoordinatorError::ParticipantUnreachable(format!(
            "{}: {}",
            target.peer_id, last_error
        )))
    }

    async fn disconnect(&self, peer_id: &str) -> Result<()> {
        if let Some(link) = self.shared.links.write().await.remove(peer_id) {
            link.reader.abort();
            self.shared
                .set_state(peer_id, ConnectionState::Disconnected)
                .await;
        }
        Ok(())
    }

    async fn connection_state(&self, peer_id: &str) -> ConnectionState {
        if self.shared.links.read().await.contains_key(peer_id) {
            return ConnectionState::Connected;
        }
        self.shared
            .states
            .read()
            .await
            .get(peer_id)
            .copied()
            .unwrap_or(ConnectionState::Unknown)
    }

    async fn send(&self, peer_id: &str, envelope: Envelope) -> Result<()> {
        let tx = self
            .shared
            .links
            .read()
            .await
            .get(peer_id)
            .map(|l| l.tx.clone())
            .ok_or_else(|| CoordinatorError::ParticipantUnreachable(peer_id.to_string()))?;

        tx.send(Frame::Envelope(envelope))
            .await
            .map_err(|_| CoordinatorError::Transport(format!("link to {} closed", peer_id)))
    }
}
