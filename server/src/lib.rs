//! # Multiplayer Server Endpoint
//!
//! This library hosts a dedicated-server endpoint: it binds a datagram
//! transport, tracks connected peers, routes their packets onto an in-process
//! event bus and evicts peers that stop answering heartbeat pings.
//!
//! ## Core Responsibilities
//!
//! ### Hosting
//! [`ConnectionHandler::host`] resolves the bind address, binds the UDP
//! transport with the configured player ceiling, loads the starting map and
//! announces [`events::ServerInitialized`]. Hosting twice, or after the
//! handler was stopped, is refused without touching the running server.
//!
//! ### Peer Lifecycle
//! Accepted peers are welcomed with the current map and become connected.
//! [`ConnectionHandler::disconnect`] sends a `Terminate` carrying either a
//! text reason or an authentication failure code, then asks the transport to
//! drop the peer after a short flush delay. Repeated disconnects of the same
//! peer are ignored.
//!
//! ### Liveness
//! The [`liveness::LivenessMonitor`] pings every connected peer on a fixed
//! interval. A peer whose ping stays unanswered for longer than the client
//! timeout is disconnected with the reason `"Timeout."`. Matched pongs
//! record the round-trip time on the peer.
//!
//! ## Architecture Design
//!
//! ### Task Layout
//! Hosting spawns four tokio tasks:
//! - **Transport Receiver**: reads datagrams and emits transport events
//! - **Transport Sender**: drains the outgoing queue onto the socket
//! - **Receive Loop**: applies transport events to the peer table and
//!   dispatches decoded messages
//! - **Heartbeat**: runs the liveness monitor on its interval
//!
//! All of them observe a cancellation token, so [`ConnectionHandler::stop`]
//! returns as soon as they have wound down.
//!
//! ### Lazy Messages
//! Packets are decoded with the `protocol` crate, which only validates the
//! envelope up front. Subscribers pay for the fields they read, and a message
//! that is forwarded unchanged is re-sent as a copy of its original bytes.
//!
//! ## Module Organization
//!
//! ### Peer Module (`peer`)
//! Peer records, connection states and the capped peer table.
//!
//! ### Network Module (`network`)
//! The connection handler, its state machine and the receive loop.
//!
//! ### Liveness Module (`liveness`)
//! Pending pings, eviction and pong matching.
//!
//! ### Transport Module (`transport`)
//! The transport trait and its UDP implementation.
//!
//! ### Supporting Modules
//! - `dispatch`: packet decoding and event routing
//! - `events`: the event bus and event types
//! - `map`: the map loading seam
//! - `config`: listen and liveness settings
//! - `error`: the server error type
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::{ListenParameters, LivenessConfig};
//! use server::events::EventBus;
//! use server::map::LoggingMapService;
//! use server::ConnectionHandler;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handler = ConnectionHandler::new(
//!         LivenessConfig::default(),
//!         Arc::new(EventBus::new()),
//!         Arc::new(LoggingMapService::new()),
//!     );
//!
//!     // Binds 127.0.0.1:27015, pings peers every 5s and drops them after 15s
//!     // without an answer
//!     handler.host(ListenParameters::default()).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handler.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod liveness;
pub mod map;
pub mod network;
pub mod peer;
pub mod transport;

pub use error::ServerError;
pub use network::{ConnectionHandler, DisconnectReason, HandlerState};
pub use peer::PeerId;
