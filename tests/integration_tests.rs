//! Integration tests for the server endpoint
//!
//! These tests drive a hosted server over real UDP sockets on loopback.

use bytes::Bytes;
use protocol::{AuthStatus, Authenticate, MapChange, Message, Ping, Pong, Registry, Terminate};
use server::config::{ListenParameters, LivenessConfig};
use server::events::{AuthenticateReceived, EventBus};
use server::map::LoggingMapService;
use server::transport::{decode_frame, encode_frame, FrameKind, DEFAULT_CHANNEL};
use server::{ConnectionHandler, HandlerState, PeerId, ServerError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(3);

/// What a test peer reads off the wire
#[derive(Debug)]
enum Incoming {
    Accept,
    Disconnect,
    Message(Message),
}

/// Minimal peer speaking the transport framing
struct TestPeer {
    socket: UdpSocket,
    server: SocketAddr,
    registry: Registry,
}

impl TestPeer {
    async fn connect(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&encode_frame(FrameKind::Connect, 0, &[]), server)
            .await
            .unwrap();
        let peer = Self {
            socket,
            server,
            registry: Registry::with_defaults(),
        };
        assert!(matches!(peer.recv().await, Incoming::Accept));
        peer
    }

    async fn recv(&self) -> Incoming {
        let mut buf = vec![0u8; 65_536];
        let (len, _) = timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("no datagram from server")
            .unwrap();
        let (kind, _, payload) = decode_frame(&buf[..len]).unwrap();
        match kind {
            FrameKind::Accept => Incoming::Accept,
            FrameKind::Disconnect => Incoming::Disconnect,
            FrameKind::Data => {
                let packet = self.registry.decode_packet(&Bytes::copy_from_slice(payload)).unwrap();
                Incoming::Message(packet.message.unwrap())
            }
            FrameKind::Connect => panic!("server sent a connect frame"),
        }
    }

    /// Reads until a message of interest arrives, skipping pings.
    async fn recv_skipping_pings(&self) -> Incoming {
        loop {
            match self.recv().await {
                Incoming::Message(Message::Ping(_)) => continue,
                other => return other,
            }
        }
    }

    async fn send(&self, message: Message) {
        let packet = self.registry.encode_packet(&message).unwrap();
        self.socket
            .send_to(&encode_frame(FrameKind::Data, DEFAULT_CHANNEL, &packet), self.server)
            .await
            .unwrap();
    }
}

fn handler_with(liveness: LivenessConfig) -> ConnectionHandler {
    ConnectionHandler::new(liveness, Arc::new(EventBus::new()), Arc::new(LoggingMapService::new()))
}

fn local_parameters(map: &str) -> ListenParameters {
    ListenParameters {
        name: "Integration".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        map: map.to_string(),
        ..ListenParameters::default()
    }
}

async fn wait_for_peer(handler: &ConnectionHandler) -> PeerId {
    for _ in 0..300 {
        if let Some(peer) = handler.connected_peers().first() {
            return *peer;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("peer never connected");
}

/// WIRE PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Every message type survives a trip through the packet framing
    #[test]
    fn packet_round_trip_per_message_type() {
        let registry = Registry::with_defaults();
        let messages = vec![
            Message::from(Authenticate::new(76561197960265728, Some(vec![7; 240]))),
            Message::from(Authenticate::new(1, None)),
            Message::from(MapChange::new(Some("harbor".to_string()))),
            Message::from(MapChange::new(None)),
            Message::from(Ping::new(u64::MAX)),
            Message::from(Pong::new(0)),
            Message::from(Terminate::with_reason("Server full")),
            Message::from(Terminate::with_auth_failure(AuthStatus::PublisherIssuedBan)),
        ];

        for message in messages {
            let packet = registry.encode_packet(&message).unwrap();
            let decoded = registry.decode_packet(&Bytes::from(packet)).unwrap();
            assert_eq!(decoded.tag, message.tag());
            assert_eq!(decoded.message.as_ref(), Some(&message));
        }
    }

    /// A relay that decodes and re-encodes without touching fields is byte exact
    #[test]
    fn untouched_message_relays_byte_for_byte() {
        let registry = Registry::with_defaults();
        let original = registry
            .encode_packet(&Message::from(MapChange::new(Some("docks".to_string()))))
            .unwrap();

        let decoded = registry.decode_packet(&Bytes::from(original.clone())).unwrap();
        let relayed = registry.encode_packet(decoded.message.as_ref().unwrap()).unwrap();
        assert_eq!(relayed, original);

        let mut edited = decoded.message.unwrap();
        if let Message::MapChange(change) = &mut edited {
            change.set_map_name(Some("harbor".to_string()));
        }
        let re_encoded = registry.encode_packet(&edited).unwrap();
        assert_ne!(re_encoded, original);
        match registry.decode_packet(&Bytes::from(re_encoded)).unwrap().message {
            Some(Message::MapChange(change)) => assert_eq!(change.map_name().unwrap(), Some("harbor")),
            other => panic!("unexpected {:?}", other),
        }
    }
}

/// SERVER TESTS
mod server_tests {
    use super::*;

    /// A connecting peer is accepted and told the current map
    #[tokio::test]
    async fn peer_receives_map_on_connect() {
        let handler = handler_with(LivenessConfig::default());
        let addr = handler.host(local_parameters("docks")).await.unwrap();

        let peer = TestPeer::connect(addr).await;
        match peer.recv_skipping_pings().await {
            Incoming::Message(Message::MapChange(change)) => {
                assert_eq!(change.map_name().unwrap(), Some("docks"))
            }
            other => panic!("unexpected {:?}", other),
        }
        wait_for_peer(&handler).await;
        assert_eq!(handler.peers().len(), 1);

        handler.stop().await;
    }

    /// Hosting a second time is refused and leaves the first server running
    #[tokio::test]
    async fn second_host_is_refused() {
        let handler = handler_with(LivenessConfig::default());
        let addr = handler.host(local_parameters("lobby")).await.unwrap();

        let again = handler.host(local_parameters("lobby")).await;
        assert!(matches!(again, Err(ServerError::AlreadyListening)));
        assert_eq!(handler.state(), HandlerState::Listening);

        let peer = TestPeer::connect(addr).await;
        assert!(matches!(
            peer.recv_skipping_pings().await,
            Incoming::Message(Message::MapChange(_))
        ));

        handler.stop().await;
    }

    /// A peer that stops answering pings is evicted with a timeout reason
    #[tokio::test]
    async fn silent_peer_is_evicted() {
        let handler = handler_with(LivenessConfig {
            ping_interval: Duration::from_millis(50),
            client_timeout: Duration::from_millis(150),
            custom_heartbeat: true,
            disconnect_flush: Duration::from_millis(10),
        });
        let addr = handler.host(local_parameters("lobby")).await.unwrap();
        let peer = TestPeer::connect(addr).await;

        let mut pings = 0;
        let terminate = loop {
            match peer.recv().await {
                Incoming::Message(Message::Ping(_)) => pings += 1,
                Incoming::Message(Message::Terminate(terminate)) => break terminate,
                Incoming::Message(Message::MapChange(_)) => {}
                other => panic!("unexpected {:?}", other),
            }
        };

        assert!(pings >= 2, "only {} pings before eviction", pings);
        assert_eq!(terminate.reason().unwrap(), Some("Timeout."));
        assert!(matches!(peer.recv_skipping_pings().await, Incoming::Disconnect));

        handler.stop().await;
    }

    /// A peer that answers every ping stays connected and gets a round trip
    #[tokio::test]
    async fn responsive_peer_stays_connected() {
        let handler = handler_with(LivenessConfig {
            ping_interval: Duration::from_millis(50),
            client_timeout: Duration::from_millis(150),
            custom_heartbeat: true,
            disconnect_flush: Duration::from_millis(10),
        });
        let addr = handler.host(local_parameters("lobby")).await.unwrap();
        let peer = TestPeer::connect(addr).await;
        let id = wait_for_peer(&handler).await;

        let answered = tokio::spawn(async move {
            let mut answered = 0;
            let deadline = tokio::time::Instant::now() + Duration::from_millis(600);
            while tokio::time::Instant::now() < deadline {
                match peer.recv().await {
                    Incoming::Message(Message::Ping(ping)) => {
                        peer.send(Message::from(Pong::new(ping.ping_id().unwrap()))).await;
                        answered += 1;
                    }
                    Incoming::Message(Message::Terminate(t)) => panic!("terminated: {:?}", t.reason()),
                    _ => {}
                }
            }
            answered
        })
        .await
        .unwrap();

        assert!(answered >= 5, "only {} pings answered", answered);
        assert_eq!(handler.connected_peers(), vec![id]);
        let round_trip = handler.peer(id).unwrap().round_trip.unwrap();
        assert_approx_eq::assert_approx_eq!(round_trip.as_secs_f64(), 0.0, 0.1);

        handler.stop().await;
    }

    /// An auth subscriber can reject a peer with a status code
    #[tokio::test]
    async fn rejected_authentication_terminates_peer() {
        let handler = handler_with(LivenessConfig::default());
        {
            let handler_for_auth = handler.clone();
            handler
                .event_bus()
                .subscribe(move |_: &str, event: &AuthenticateReceived| {
                    if event.request.ticket().unwrap().is_none() {
                        handler_for_auth.disconnect(event.peer, AuthStatus::AuthTicketInvalid);
                    }
                });
        }
        let addr = handler.host(local_parameters("lobby")).await.unwrap();
        let peer = TestPeer::connect(addr).await;
        wait_for_peer(&handler).await;

        peer.send(Message::from(Authenticate::new(42, None))).await;

        let terminate = loop {
            match peer.recv_skipping_pings().await {
                Incoming::Message(Message::Terminate(terminate)) => break terminate,
                Incoming::Message(Message::MapChange(_)) => continue,
                other => panic!("unexpected {:?}", other),
            }
        };
        assert_eq!(terminate.reason().unwrap(), None);
        assert_eq!(terminate.auth_failure().unwrap(), AuthStatus::AuthTicketInvalid);

        handler.stop().await;
    }

    /// Garbage from a peer is dropped without affecting the connection
    #[tokio::test]
    async fn undecodable_packet_keeps_connection() {
        let handler = handler_with(LivenessConfig::default());
        let addr = handler.host(local_parameters("lobby")).await.unwrap();
        let peer = TestPeer::connect(addr).await;
        let id = wait_for_peer(&handler).await;

        peer.socket
            .send_to(&encode_frame(FrameKind::Data, 0, &[0xee, 0, 1, 2, 3]), addr)
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(handler.connected_peers(), vec![id]);
        handler.stop().await;
    }

    /// Stopping the server tells connected peers the session is over
    #[tokio::test]
    async fn stop_disconnects_peers() {
        let handler = handler_with(LivenessConfig::default());
        let addr = handler.host(local_parameters("lobby")).await.unwrap();
        let peer = TestPeer::connect(addr).await;
        wait_for_peer(&handler).await;

        timeout(WAIT, handler.stop()).await.expect("stop hung");

        loop {
            match peer.recv().await {
                Incoming::Disconnect => break,
                Incoming::Message(_) => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(handler.state(), HandlerState::Stopped);
    }
}
