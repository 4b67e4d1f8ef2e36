//! In-process publish/subscribe keyed by event type
//!
//! Handlers run synchronously on the publishing task. The handler list is
//! cloned before dispatch, so a handler may publish, subscribe or unsubscribe
//! without deadlocking the bus.

use crate::config::ListenParameters;
use crate::peer::PeerId;
use log::trace;
use protocol::{Authenticate, Message, Pong};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Handler = Arc<dyn Fn(&str, &dyn Any) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], needed to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    event: TypeId,
}

#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<TypeId, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<E, F>(&self, handler: F) -> Subscription
    where
        E: Any,
        F: Fn(&str, &E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = TypeId::of::<E>();
        let erased: Handler = Arc::new(move |sender: &str, event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(sender, event);
            }
        });

        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event)
            .or_default()
            .push((id, erased));
        Subscription { id, event }
    }

    /// Returns false if the subscription was already removed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(&subscription.event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&subscription.event);
        }
        removed
    }

    /// Delivers `event` to every handler subscribed to `E` and returns how
    /// many ran.
    pub fn publish<E: Any>(&self, sender: &str, event: &E) -> usize {
        let handlers: Vec<Handler> = {
            let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            match handlers.get(&TypeId::of::<E>()) {
                Some(list) => list.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
                None => Vec::new(),
            }
        };

        if handlers.is_empty() {
            trace!("{} published {} with no subscribers", sender, std::any::type_name::<E>());
        }
        for handler in &handlers {
            handler(sender, event);
        }
        handlers.len()
    }

    pub fn subscriber_count<E: Any>(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }
}

/// Hosting succeeded.
#[derive(Debug, Clone)]
pub struct ServerInitialized {
    pub parameters: ListenParameters,
    pub local_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct PeerConnected {
    pub peer: PeerId,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct PeerDisconnected {
    pub peer: PeerId,
}

#[derive(Debug, Clone)]
pub struct PongReceived {
    pub peer: PeerId,
    pub pong: Pong,
}

/// A peer presented its platform ticket; subscribers decide whether to
/// reject it with an auth failure.
#[derive(Debug, Clone)]
pub struct AuthenticateReceived {
    pub peer: PeerId,
    pub request: Authenticate,
}

/// Any other decoded message.
#[derive(Debug, Clone)]
pub struct MessageReceived {
    pub peer: PeerId,
    pub message: Message,
}
