//! Application-level heartbeat
//!
//! Every tick the monitor evicts peers whose oldest unanswered ping has
//! outlived the client timeout, then pings every connected peer again. A
//! matching pong clears its ping and records the round trip on the peer.
//!
//! With `custom_heartbeat` off the monitor neither pings nor evicts; it only
//! logs the transport's own round-trip figures.

use crate::config::LivenessConfig;
use crate::error::Result;
use crate::events::{EventBus, PongReceived};
use crate::network::DisconnectReason;
use crate::peer::PeerId;
use log::{debug, trace, warn};
use protocol::{Message, Ping};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Reason sent to peers evicted for not answering pings.
pub const TIMEOUT_REASON: &str = "Timeout.";

/// What the monitor needs from the connection handler
pub trait PeerControl: Send + Sync + 'static {
    fn connected_peers(&self) -> Vec<PeerId>;

    fn is_connected(&self, peer: PeerId) -> bool;

    fn send_message(&self, peer: PeerId, message: &Message) -> Result<()>;

    fn disconnect(&self, peer: PeerId, reason: DisconnectReason);

    fn record_round_trip(&self, peer: PeerId, round_trip: Duration);

    fn transport_round_trip(&self, peer: PeerId) -> Option<Duration>;
}

/// A ping that has not been answered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPing {
    pub peer: PeerId,
    pub ping_id: u64,
    pub sent_at: Instant,
}

/// Outcome of one [`LivenessMonitor::tick`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Peers disconnected for timing out
    pub evicted: Vec<PeerId>,
    /// Pings sent this tick
    pub pinged: Vec<(PeerId, u64)>,
}

struct PingBook {
    pending: Vec<PendingPing>,
    next_ping_id: u64,
}

impl PingBook {
    fn allocate(&mut self) -> u64 {
        let id = self.next_ping_id;
        self.next_ping_id = match self.next_ping_id.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        id
    }
}

pub struct LivenessMonitor {
    config: LivenessConfig,
    book: Mutex<PingBook>,
}

impl LivenessMonitor {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            book: Mutex::new(PingBook {
                pending: Vec::new(),
                next_ping_id: 1,
            }),
        }
    }

    pub fn pending(&self) -> Vec<PendingPing> {
        self.book().pending.clone()
    }

    fn book(&self) -> std::sync::MutexGuard<'_, PingBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one heartbeat step as of `now`.
    pub fn tick(&self, control: &dyn PeerControl, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        if !self.config.custom_heartbeat {
            for peer in control.connected_peers() {
                match control.transport_round_trip(peer) {
                    Some(rtt) => debug!("Peer {} transport round trip {:?}", peer, rtt),
                    None => debug!("Peer {} has no transport round trip yet", peer),
                }
            }
            return report;
        }

        let expired: Vec<PendingPing> = {
            let mut book = self.book();
            let timeout = self.config.client_timeout;
            let (expired, live): (Vec<PendingPing>, Vec<PendingPing>) = std::mem::take(&mut book.pending)
                .into_iter()
                .partition(|ping| now.saturating_duration_since(ping.sent_at) > timeout);
            book.pending = live;
            expired
        };

        for ping in expired {
            if control.is_connected(ping.peer) && !report.evicted.contains(&ping.peer) {
                warn!(
                    "Peer {} did not answer ping {} within {:?}",
                    ping.peer, ping.ping_id, self.config.client_timeout
                );
                control.disconnect(ping.peer, DisconnectReason::from(TIMEOUT_REASON));
                report.evicted.push(ping.peer);
            }
        }

        for peer in control.connected_peers() {
            let ping_id = {
                let mut book = self.book();
                let ping_id = book.allocate();
                book.pending.push(PendingPing {
                    peer,
                    ping_id,
                    sent_at: now,
                });
                ping_id
            };

            if let Err(e) = control.send_message(peer, &Message::from(Ping::new(ping_id))) {
                warn!("Failed to ping {}: {}", peer, e);
            }
            report.pinged.push((peer, ping_id));
        }
        report
    }

    /// Matches a pong against the pending pings as of `now`.
    ///
    /// Returns the round trip on a match. Unknown or repeated pongs are
    /// ignored.
    pub fn handle_pong(&self, control: &dyn PeerControl, peer: PeerId, ping_id: u64, now: Instant) -> Option<Duration> {
        let ping = {
            let mut book = self.book();
            let index = book
                .pending
                .iter()
                .position(|ping| ping.peer == peer && ping.ping_id == ping_id);
            match index {
                Some(index) => book.pending.remove(index),
                None => {
                    trace!("Unmatched pong {} from {}", ping_id, peer);
                    return None;
                }
            }
        };

        let round_trip = now.saturating_duration_since(ping.sent_at);
        debug!("Peer {} round trip {:?}", peer, round_trip);
        control.record_round_trip(peer, round_trip);
        Some(round_trip)
    }

    /// Starts the heartbeat task
    ///
    /// The pong subscription is registered before this returns and removed
    /// when `cancel` fires.
    pub fn spawn(
        self: Arc<Self>,
        control: Arc<dyn PeerControl>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let subscription = {
            let monitor = Arc::clone(&self);
            let control = Arc::clone(&control);
            bus.subscribe(move |_: &str, event: &PongReceived| match event.pong.ping_id() {
                Ok(ping_id) => {
                    monitor.handle_pong(control.as_ref(), event.peer, ping_id, Instant::now());
                }
                Err(e) => warn!("Unreadable pong from {}: {}", event.peer, e),
            })
        };

        tokio::spawn(async move {
            let period = self.config.ping_interval.max(Duration::from_millis(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick(control.as_ref(), Instant::now());
                    }
                }
            }

            bus.unsubscribe(subscription);
            debug!("Liveness monitor stopped");
        })
    }
}
