//! Connection handler: hosting, peer lifecycle and the receive loop

use crate::config::{LivenessConfig, ListenParameters};
use crate::dispatch::{Dispatcher, SENDER};
use crate::error::{Result, ServerError};
use crate::events::{EventBus, PeerConnected, PeerDisconnected, ServerInitialized};
use crate::liveness::{LivenessMonitor, PeerControl};
use crate::map::MapService;
use crate::peer::{Peer, PeerId, PeerState, PeerTable};
use crate::transport::{Transport, TransportEvent, UdpTransport, DEFAULT_CHANNEL};
use log::{debug, error, info, warn};
use protocol::{AuthStatus, MapChange, Message, Registry, Terminate};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Listening,
    /// Terminal; a stopped handler cannot host again
    Stopped,
}

impl HandlerState {
    fn as_str(self) -> &'static str {
        match self {
            HandlerState::Idle => "idle",
            HandlerState::Listening => "listening",
            HandlerState::Stopped => "stopped",
        }
    }
}

/// Why a peer is being disconnected. Exactly one of the two `Terminate`
/// fields is populated from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Text(String),
    AuthFailure(AuthStatus),
}

impl DisconnectReason {
    pub fn to_terminate(&self) -> Terminate {
        match self {
            DisconnectReason::Text(text) => Terminate::with_reason(text.clone()),
            DisconnectReason::AuthFailure(status) => Terminate::with_auth_failure(*status),
        }
    }
}

impl From<&str> for DisconnectReason {
    fn from(text: &str) -> Self {
        DisconnectReason::Text(text.to_string())
    }
}

impl From<String> for DisconnectReason {
    fn from(text: String) -> Self {
        DisconnectReason::Text(text)
    }
}

impl From<AuthStatus> for DisconnectReason {
    fn from(status: AuthStatus) -> Self {
        DisconnectReason::AuthFailure(status)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Text(text) => f.write_str(text),
            DisconnectReason::AuthFailure(status) => write!(f, "authentication failed ({})", status),
        }
    }
}

/// Resolves the bind address
///
/// IP literals are used as is. Anything that is not a plausible host name is
/// rejected without a lookup.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let plausible = !host.is_empty()
        && host.len() <= 253
        && host
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    if !plausible {
        return Err(ServerError::AddressResolution {
            host: host.to_string(),
            reason: "not a valid host name".to_string(),
        });
    }

    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ServerError::AddressResolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
    addrs.next().ok_or_else(|| ServerError::AddressResolution {
        host: host.to_string(),
        reason: "no addresses found".to_string(),
    })
}

/// State that exists only while listening
struct Session {
    parameters: ListenParameters,
    transport: Arc<dyn Transport>,
    local_addr: SocketAddr,
}

struct Shared {
    state: Mutex<HandlerState>,
    session: Mutex<Option<Session>>,
    peers: Mutex<PeerTable>,
    dispatcher: Dispatcher,
    bus: Arc<EventBus>,
    maps: Arc<dyn MapService>,
    liveness: LivenessConfig,
    monitor: Mutex<Option<Arc<LivenessMonitor>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the transport and the peer table of one server
///
/// Cloning is cheap and every clone drives the same server, so the handler
/// can be handed to event subscribers and background tasks.
#[derive(Clone)]
pub struct ConnectionHandler {
    shared: Arc<Shared>,
}

impl ConnectionHandler {
    pub fn new(liveness: LivenessConfig, bus: Arc<EventBus>, maps: Arc<dyn MapService>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(HandlerState::Idle),
                session: Mutex::new(None),
                peers: Mutex::new(PeerTable::new(0)),
                dispatcher: Dispatcher::new(Registry::with_defaults(), Arc::clone(&bus)),
                bus,
                maps,
                liveness,
                monitor: Mutex::new(None),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> HandlerState {
        *lock(&self.shared.state)
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.session).as_ref().map(|session| session.local_addr)
    }

    pub fn parameters(&self) -> Option<ListenParameters> {
        lock(&self.shared.session)
            .as_ref()
            .map(|session| session.parameters.clone())
    }

    pub fn monitor(&self) -> Option<Arc<LivenessMonitor>> {
        lock(&self.shared.monitor).clone()
    }

    pub fn peer(&self, peer: PeerId) -> Option<Peer> {
        lock(&self.shared.peers).get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<Peer> {
        lock(&self.shared.peers).snapshot()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        lock(&self.shared.peers).connected()
    }

    pub fn set_peer_name(&self, peer: PeerId, name: impl Into<String>) -> bool {
        lock(&self.shared.peers).set_name(peer, name)
    }

    fn ensure_idle(&self, action: &'static str) -> Result<()> {
        match self.state() {
            HandlerState::Idle => Ok(()),
            HandlerState::Listening => Err(ServerError::AlreadyListening),
            state => Err(ServerError::InvalidState {
                action,
                state: state.as_str(),
            }),
        }
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.shared.session)
            .as_ref()
            .map(|session| Arc::clone(&session.transport))
    }

    /// Binds a UDP transport for `parameters` and starts serving
    ///
    /// Fails without changing state if the handler is not idle, the host does
    /// not resolve or the port cannot be bound.
    pub async fn host(&self, parameters: ListenParameters) -> Result<SocketAddr> {
        self.ensure_idle("host")?;

        let addr = resolve(&parameters.host, parameters.port).await?;
        let (transport, events) =
            match UdpTransport::bind(addr, parameters.peer_limit(), parameters.max_channels).await {
                Ok(bound) => bound,
                Err(source) => {
                    error!("Failed to host server on {}. Is the port already in use? {}", addr, source);
                    return Err(ServerError::Bind { addr, source });
                }
            };

        self.attach(parameters, transport, events)
    }

    /// Starts serving on an already bound transport.
    pub fn attach(
        &self,
        parameters: ListenParameters,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<SocketAddr> {
        let local_addr = transport.local_addr();
        {
            let mut state = lock(&self.shared.state);
            match *state {
                HandlerState::Idle => {}
                HandlerState::Listening => {
                    transport.shutdown();
                    return Err(ServerError::AlreadyListening);
                }
                HandlerState::Stopped => {
                    transport.shutdown();
                    return Err(ServerError::InvalidState {
                        action: "host",
                        state: HandlerState::Stopped.as_str(),
                    });
                }
            }
            *state = HandlerState::Listening;
            *lock(&self.shared.peers) = PeerTable::new(parameters.peer_limit());
            *lock(&self.shared.session) = Some(Session {
                parameters: parameters.clone(),
                transport,
                local_addr,
            });
        }

        info!(
            "Hosted server \"{}\" on {} for up to {} players",
            parameters.name, local_addr, parameters.max_players
        );

        let receiver = tokio::spawn(Self::run_receive_loop(self.clone(), events, self.shared.cancel.clone()));

        let monitor = Arc::new(LivenessMonitor::new(self.shared.liveness.clone()));
        let heartbeat = Arc::clone(&monitor).spawn(
            Arc::new(self.clone()),
            Arc::clone(&self.shared.bus),
            self.shared.cancel.clone(),
        );
        *lock(&self.shared.monitor) = Some(monitor);
        lock(&self.shared.tasks).extend([receiver, heartbeat]);

        self.shared.maps.change_map(&parameters.map);
        self.shared.bus.publish(
            SENDER,
            &ServerInitialized {
                parameters,
                local_addr,
            },
        );
        Ok(local_addr)
    }

    /// Encodes `message` and queues it for `peer`.
    pub fn send(&self, peer: PeerId, message: &Message) -> Result<()> {
        let transport = self.transport().ok_or(ServerError::NotListening)?;
        let packet = self.shared.dispatcher.registry().encode_packet(message)?;
        transport.send(peer, packet, DEFAULT_CHANNEL)?;
        Ok(())
    }

    /// Sends `Terminate` to the peer and asks the transport to drop it
    ///
    /// Does nothing for unknown peers and peers already on their way out, so
    /// the timeout path and the auth path may both call it for one peer.
    pub fn disconnect(&self, peer: PeerId, reason: impl Into<DisconnectReason>) {
        let reason = reason.into();
        let name = {
            let mut peers = lock(&self.shared.peers);
            let name = match peers.get(peer) {
                Some(record) if !record.state.is_leaving() => record.name.clone(),
                _ => return,
            };
            peers.set_state(peer, PeerState::Disconnecting);
            name
        };

        match &reason {
            DisconnectReason::AuthFailure(status) => {
                warn!("{} was rejected because of failed authentication: {}", name, status)
            }
            DisconnectReason::Text(text) => info!("{} was disconnected: {}", name, text),
        }

        if let Err(e) = self.send(peer, &Message::from(reason.to_terminate())) {
            error!("Failed to send Terminate to {}: {}", name, e);
        }
        if let Some(transport) = self.transport() {
            transport.request_disconnect(peer, self.shared.liveness.disconnect_flush);
        }
    }

    /// Stops the heartbeat, the receive loop and the transport
    ///
    /// Returns once the handler's tasks have exited.
    pub async fn stop(&self) {
        {
            let mut state = lock(&self.shared.state);
            if *state == HandlerState::Stopped {
                return;
            }
            *state = HandlerState::Stopped;
        }

        self.shared.cancel.cancel();
        let session = lock(&self.shared.session).take();
        if let Some(session) = session {
            session.transport.shutdown();
            info!("Server \"{}\" stopped", session.parameters.name);
        }
        lock(&self.shared.monitor).take();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.shared.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                error!("Handler task panicked: {}", e);
            }
        }
        lock(&self.shared.peers).clear();
    }

    async fn run_receive_loop(
        handler: ConnectionHandler,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            handler.handle_transport_event(event);
        }
        debug!("Receive loop stopped");
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, addr } => {
                if !lock(&self.shared.peers).add_peer(peer, addr) {
                    warn!("No room for peer {} from {}", peer, addr);
                    if let Some(transport) = self.transport() {
                        transport.request_disconnect(peer, Duration::ZERO);
                    }
                    return;
                }

                let welcome = MapChange::new(self.shared.maps.current_map());
                if let Err(e) = self.send(peer, &Message::from(welcome)) {
                    warn!("Failed to send map to {}: {}", peer, e);
                }
                lock(&self.shared.peers).set_state(peer, PeerState::Connected);
                self.shared.bus.publish(SENDER, &PeerConnected { peer, addr });
            }
            TransportEvent::Received { peer, data, .. } => {
                lock(&self.shared.peers).touch(peer);
                if let Err(e) = self.shared.dispatcher.dispatch(peer, &data) {
                    warn!("Dropping packet from {}: {}", peer, e);
                }
            }
            TransportEvent::Disconnected { peer } => {
                let removed = lock(&self.shared.peers).remove_peer(peer);
                if removed.is_some() {
                    self.shared.bus.publish(SENDER, &PeerDisconnected { peer });
                }
            }
        }
    }
}

impl PeerControl for ConnectionHandler {
    fn connected_peers(&self) -> Vec<PeerId> {
        ConnectionHandler::connected_peers(self)
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        lock(&self.shared.peers).state(peer) == Some(PeerState::Connected)
    }

    fn send_message(&self, peer: PeerId, message: &Message) -> Result<()> {
        self.send(peer, message)
    }

    fn disconnect(&self, peer: PeerId, reason: DisconnectReason) {
        ConnectionHandler::disconnect(self, peer, reason)
    }

    fn record_round_trip(&self, peer: PeerId, round_trip: Duration) {
        lock(&self.shared.peers).record_round_trip(peer, round_trip);
    }

    fn transport_round_trip(&self, peer: PeerId) -> Option<Duration> {
        self.transport()?.round_trip(peer)
    }
}
