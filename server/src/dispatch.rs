//! Routes decoded packets onto the event bus.

use crate::events::{AuthenticateReceived, EventBus, MessageReceived, PongReceived};
use crate::peer::PeerId;
use bytes::Bytes;
use log::debug;
use protocol::{CodecError, Message, MessageTag, Registry};
use std::sync::Arc;

/// Name the dispatcher publishes under.
pub const SENDER: &str = "ConnectionHandler";

pub struct Dispatcher {
    registry: Registry,
    bus: Arc<EventBus>,
}

impl Dispatcher {
    pub fn new(registry: Registry, bus: Arc<EventBus>) -> Self {
        Self { registry, bus }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Decodes one packet from `peer` and publishes it.
    ///
    /// Only the envelope is validated here; fields are parsed by whoever
    /// reads them. A null message is decoded but not published.
    pub fn dispatch(&self, peer: PeerId, packet: &Bytes) -> Result<MessageTag, CodecError> {
        let decoded = self.registry.decode_packet(packet)?;
        let Some(message) = decoded.message else {
            debug!("Null {:?} from {}", decoded.tag, peer);
            return Ok(decoded.tag);
        };

        match message {
            Message::Pong(pong) => {
                self.bus.publish(SENDER, &PongReceived { peer, pong });
            }
            Message::Authenticate(request) => {
                self.bus.publish(SENDER, &AuthenticateReceived { peer, request });
            }
            message => {
                self.bus.publish(SENDER, &MessageReceived { peer, message });
            }
        }
        Ok(decoded.tag)
    }
}
