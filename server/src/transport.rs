//! Peer-oriented datagram transport
//!
//! The connection handler talks to peers through the [`Transport`] trait and
//! learns about them from a stream of [`TransportEvent`]s. [`UdpTransport`]
//! implements both over a single tokio `UdpSocket` with a two-byte frame
//! header:
//!
//! ```text
//! [kind u8][channel u8][payload ...]
//! ```
//!
//! A peer sends `Connect` and is answered with `Accept` (or `Disconnect` when
//! the server is full). `Data` frames carry packets on a channel below the
//! channel ceiling. Either side may send `Disconnect` to end the session.

use crate::peer::PeerId;
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type Channel = u8;

/// Channel the connection handler sends every message on
pub const DEFAULT_CHANNEL: Channel = 0;

/// Largest payload that fits one IPv4 UDP datagram after the frame header.
pub const MAX_PAYLOAD: usize = 65_507 - FRAME_HEADER_LEN;

const FRAME_HEADER_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Connect = 1,
    Accept = 2,
    Data = 3,
    Disconnect = 4,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FrameKind::Connect),
            2 => Some(FrameKind::Accept),
            3 => Some(FrameKind::Data),
            4 => Some(FrameKind::Disconnect),
            _ => None,
        }
    }
}

pub fn encode_frame(kind: FrameKind, channel: Channel, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(kind as u8);
    frame.push(channel);
    frame.extend_from_slice(payload);
    frame
}

/// Splits a datagram into its header fields and payload.
pub fn decode_frame(datagram: &[u8]) -> Option<(FrameKind, Channel, &[u8])> {
    if datagram.len() < FRAME_HEADER_LEN {
        return None;
    }
    let kind = FrameKind::from_byte(datagram[0])?;
    Some((kind, datagram[1], &datagram[FRAME_HEADER_LEN..]))
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),

    #[error("channel {channel} is out of range, transport has {limit}")]
    InvalidChannel { channel: Channel, limit: u8 },

    #[error("payload of {0} bytes does not fit a datagram")]
    TooLarge(usize),

    #[error("transport is shut down")]
    Closed,
}

/// What the transport reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { peer: PeerId, addr: SocketAddr },
    Received { peer: PeerId, channel: Channel, data: Bytes },
    Disconnected { peer: PeerId },
}

/// Operations the connection handler needs from a transport.
pub trait Transport: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    /// Queues `data` for `peer`. Never blocks.
    fn send(&self, peer: PeerId, data: Vec<u8>, channel: Channel) -> Result<(), TransportError>;

    /// Tears the peer down once `flush_delay` has passed, giving messages
    /// queued before this call time to leave. Unknown peers are ignored.
    fn request_disconnect(&self, peer: PeerId, flush_delay: Duration);

    /// The transport's own round-trip estimate, if it keeps one.
    fn round_trip(&self, peer: PeerId) -> Option<Duration>;

    fn shutdown(&self);
}

#[derive(Debug, Clone, Copy)]
enum Admission {
    New(PeerId),
    Existing,
    Full,
}

/// Address ↔ id mapping shared by the socket tasks
struct Directory {
    by_addr: HashMap<SocketAddr, PeerId>,
    by_id: HashMap<PeerId, SocketAddr>,
    next_id: u32,
    max_peers: usize,
}

impl Directory {
    fn new(max_peers: usize) -> Self {
        Self {
            by_addr: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
            max_peers,
        }
    }

    fn admit(&mut self, addr: SocketAddr) -> Admission {
        if self.by_addr.contains_key(&addr) {
            return Admission::Existing;
        }
        if self.by_id.len() >= self.max_peers {
            return Admission::Full;
        }

        let peer = PeerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.by_addr.insert(addr, peer);
        self.by_id.insert(peer, addr);
        Admission::New(peer)
    }

    fn peer_at(&self, addr: SocketAddr) -> Option<PeerId> {
        self.by_addr.get(&addr).copied()
    }

    fn addr_of(&self, peer: PeerId) -> Option<SocketAddr> {
        self.by_id.get(&peer).copied()
    }

    fn remove(&mut self, peer: PeerId) -> Option<SocketAddr> {
        let addr = self.by_id.remove(&peer)?;
        self.by_addr.remove(&addr);
        Some(addr)
    }

    fn drain(&mut self) -> Vec<SocketAddr> {
        self.by_addr.clear();
        self.by_id.drain().map(|(_, addr)| addr).collect()
    }
}

/// Work queued for the sender task
#[derive(Debug)]
enum Outgoing {
    Datagram { addr: SocketAddr, frame: Vec<u8> },
    Disconnect { peer: PeerId, flush_delay: Duration },
}

/// Shared pieces both socket tasks work with.
#[derive(Clone)]
struct Link {
    socket: Arc<UdpSocket>,
    directory: Arc<Mutex<Directory>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Link {
    fn directory(&self) -> std::sync::MutexGuard<'_, Directory> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Transport event dropped, receiver is gone");
        }
    }

    async fn send_frame(&self, addr: SocketAddr, frame: &[u8]) {
        if let Err(e) = self.socket.send_to(frame, addr).await {
            error!("Failed to send datagram to {}: {}", addr, e);
        }
    }

    async fn finish_disconnect(&self, peer: PeerId) {
        let addr = self.directory().remove(peer);
        if let Some(addr) = addr {
            self.send_frame(addr, &encode_frame(FrameKind::Disconnect, 0, &[]))
                .await;
            self.emit(TransportEvent::Disconnected { peer });
        }
    }
}

/// UDP implementation of [`Transport`]
pub struct UdpTransport {
    link: Link,
    local_addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    max_channels: u8,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Binds `addr` and starts the receiver and sender tasks.
    ///
    /// At most `max_peers` peers are admitted at once; data on a channel at
    /// or above `max_channels` is dropped.
    pub async fn bind(
        addr: SocketAddr,
        max_peers: usize,
        max_channels: u8,
    ) -> io::Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("Transport listening on {}", local_addr);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let link = Link {
            socket,
            directory: Arc::new(Mutex::new(Directory::new(max_peers))),
            events: events_tx,
        };
        let cancel = CancellationToken::new();

        let receiver = Self::spawn_receiver(link.clone(), outgoing_tx.clone(), max_channels, cancel.clone());
        let sender = Self::spawn_sender(link.clone(), outgoing_rx, cancel.clone());

        let transport = Arc::new(UdpTransport {
            link,
            local_addr,
            outgoing: outgoing_tx,
            max_channels,
            cancel,
            tasks: Mutex::new(vec![receiver, sender]),
        });
        Ok((transport, events_rx))
    }

    pub fn peer_count(&self) -> usize {
        self.link.directory().by_id.len()
    }

    /// Waits for both socket tasks to exit after [`Transport::shutdown`].
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                error!("Transport task panicked: {}", e);
            }
        }
    }

    fn queue(&self, outgoing: Outgoing) -> Result<(), TransportError> {
        self.outgoing.send(outgoing).map_err(|_| TransportError::Closed)
    }

    /// Spawns task that reads datagrams and turns them into events
    fn spawn_receiver(
        link: Link,
        outgoing: mpsc::UnboundedSender<Outgoing>,
        max_channels: u8,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 65_536];

            loop {
                let (len, addr) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = link.socket.recv_from(&mut buffer) => match result {
                        Ok(received) => received,
                        Err(e) => {
                            // ICMP unreachable from a departed peer shows up here
                            debug!("Error receiving datagram: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            continue;
                        }
                    },
                };

                let Some((kind, channel, payload)) = decode_frame(&buffer[..len]) else {
                    warn!("Malformed datagram of {} bytes from {}", len, addr);
                    continue;
                };

                match kind {
                    FrameKind::Connect => {
                        let admission = link.directory().admit(addr);
                        let reply = match admission {
                            Admission::New(_) | Admission::Existing => FrameKind::Accept,
                            Admission::Full => {
                                warn!("Rejecting {}: peer limit reached", addr);
                                FrameKind::Disconnect
                            }
                        };
                        // Accept goes out before anything the owner sends in response
                        let frame = encode_frame(reply, 0, &[]);
                        if outgoing.send(Outgoing::Datagram { addr, frame }).is_err() {
                            break;
                        }
                        if let Admission::New(peer) = admission {
                            link.emit(TransportEvent::Connected { peer, addr });
                        }
                    }
                    FrameKind::Data => {
                        let Some(peer) = link.directory().peer_at(addr) else {
                            debug!("Data from unknown address {}", addr);
                            continue;
                        };
                        if channel >= max_channels {
                            warn!("Dropping data from {} on channel {}", peer, channel);
                            continue;
                        }
                        link.emit(TransportEvent::Received {
                            peer,
                            channel,
                            data: Bytes::copy_from_slice(payload),
                        });
                    }
                    FrameKind::Disconnect => {
                        let peer = link.directory().peer_at(addr);
                        if let Some(peer) = peer {
                            link.directory().remove(peer);
                            link.emit(TransportEvent::Disconnected { peer });
                        }
                    }
                    FrameKind::Accept => debug!("Ignoring accept frame from {}", addr),
                }
            }
            debug!("Transport receiver stopped");
        })
    }

    /// Spawns task that processes the outgoing queue
    fn spawn_sender(
        link: Link,
        mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = outgoing.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                match message {
                    Outgoing::Datagram { addr, frame } => link.send_frame(addr, &frame).await,
                    Outgoing::Disconnect { peer, flush_delay } if flush_delay.is_zero() => {
                        link.finish_disconnect(peer).await;
                    }
                    Outgoing::Disconnect { peer, flush_delay } => {
                        let link = link.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(flush_delay).await;
                            link.finish_disconnect(peer).await;
                        });
                    }
                }
            }

            let remaining = link.directory().drain();
            let farewell = encode_frame(FrameKind::Disconnect, 0, &[]);
            for addr in remaining {
                link.send_frame(addr, &farewell).await;
            }
            debug!("Transport sender stopped");
        })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send(&self, peer: PeerId, data: Vec<u8>, channel: Channel) -> Result<(), TransportError> {
        if channel >= self.max_channels {
            return Err(TransportError::InvalidChannel {
                channel,
                limit: self.max_channels,
            });
        }
        if data.len() > MAX_PAYLOAD {
            return Err(TransportError::TooLarge(data.len()));
        }
        let addr = self
            .link
            .directory()
            .addr_of(peer)
            .ok_or(TransportError::UnknownPeer(peer))?;

        self.queue(Outgoing::Datagram {
            addr,
            frame: encode_frame(FrameKind::Data, channel, &data),
        })
    }

    fn request_disconnect(&self, peer: PeerId, flush_delay: Duration) {
        if self.link.directory().addr_of(peer).is_none() {
            return;
        }
        if self.queue(Outgoing::Disconnect { peer, flush_delay }).is_err() {
            debug!("Disconnect of {} dropped, transport is shut down", peer);
        }
    }

    fn round_trip(&self, _peer: PeerId) -> Option<Duration> {
        None
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}
