//! Tag → codec table used to frame and unframe packets.
//!
//! A packet is one tag byte followed by one object envelope.

use crate::error::{CodecError, Result};
use crate::messages::{Authenticate, MapChange, Message, MessageTag, Payload, Ping, Pong, Terminate};
use crate::object::{decode_object, encode_object};
use crate::tracker::DirtyTracker;
use bytes::Bytes;
use std::collections::HashMap;

type DecodeFn = fn(&Bytes, usize, &DirtyTracker) -> Result<(Option<Message>, usize)>;
type EncodeFn = fn(Option<&Message>, &mut Vec<u8>, usize) -> Result<usize>;

/// Encode/decode pair for one message type.
#[derive(Clone, Copy)]
pub struct CodecEntry {
    pub name: &'static str,
    decode: DecodeFn,
    encode: EncodeFn,
}

fn decode_as<T: Payload>(buffer: &Bytes, offset: usize, parent: &DirtyTracker) -> Result<(Option<Message>, usize)> {
    let (value, consumed) = decode_object::<T>(buffer, offset, parent)?;
    Ok((value.map(T::wrap), consumed))
}

fn encode_as<T: Payload>(message: Option<&Message>, buf: &mut Vec<u8>, offset: usize) -> Result<usize> {
    let value = match message {
        None => None,
        Some(message) => Some(T::peel(message).ok_or_else(|| {
            CodecError::Corrupt(format!("{} codec cannot encode {}", T::NAME, message.name()))
        })?),
    };
    encode_object(value, buf, offset)
}

/// A packet after its envelope has been validated.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub tag: MessageTag,
    /// `None` when the packet carried the null sentinel.
    pub message: Option<Message>,
    /// Root of the tracker tree for everything decoded from this packet.
    pub tracker: DirtyTracker,
}

#[derive(Clone, Default)]
pub struct Registry {
    codecs: HashMap<u8, CodecEntry>,
}

impl Registry {
    /// An empty table; every tag is unknown until registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// The table with every message type of the protocol.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<Authenticate>();
        registry.register::<MapChange>();
        registry.register::<Ping>();
        registry.register::<Pong>();
        registry.register::<Terminate>();
        registry
    }

    pub fn register<T: Payload>(&mut self) {
        self.codecs.insert(
            T::TAG as u8,
            CodecEntry {
                name: T::NAME,
                decode: decode_as::<T>,
                encode: encode_as::<T>,
            },
        );
    }

    pub fn lookup(&self, tag: u8) -> Option<&CodecEntry> {
        self.codecs.get(&tag)
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Decodes the object at `offset` with the codec registered for `tag`.
    pub fn decode(
        &self,
        tag: u8,
        buffer: &Bytes,
        offset: usize,
        parent: &DirtyTracker,
    ) -> Result<(Option<Message>, usize)> {
        let entry = self.lookup(tag).ok_or(CodecError::UnknownTag(tag))?;
        (entry.decode)(buffer, offset, parent)
    }

    /// Frames `message` as a packet.
    pub fn encode_packet(&self, message: &Message) -> Result<Vec<u8>> {
        self.encode_tagged(message.tag(), Some(message))
    }

    /// Frames a null instance of `tag`.
    pub fn encode_null_packet(&self, tag: MessageTag) -> Result<Vec<u8>> {
        self.encode_tagged(tag, None)
    }

    fn encode_tagged(&self, tag: MessageTag, message: Option<&Message>) -> Result<Vec<u8>> {
        let entry = self.lookup(tag as u8).ok_or(CodecError::UnknownTag(tag as u8))?;
        let mut buf = vec![tag as u8];
        let written = (entry.encode)(message, &mut buf, 1)?;
        buf.truncate(1 + written);
        Ok(buf)
    }

    /// Unframes a packet. The decoded message borrows `packet` through a
    /// reference-counted handle, so the caller may drop its own copy.
    pub fn decode_packet(&self, packet: &Bytes) -> Result<DecodedPacket> {
        let tag_byte = *packet.first().ok_or(CodecError::EmptyPacket)?;
        let tag = MessageTag::from_byte(tag_byte).ok_or(CodecError::UnknownTag(tag_byte))?;
        let tracker = DirtyTracker::root();
        let (message, consumed) = self.decode(tag_byte, packet, 1, &tracker)?;
        if 1 + consumed != packet.len() {
            return Err(CodecError::Corrupt(format!(
                "{} trailing bytes after {} object",
                packet.len() - 1 - consumed,
                tag_byte
            )));
        }
        Ok(DecodedPacket {
            tag,
            message,
            tracker,
        })
    }
}
