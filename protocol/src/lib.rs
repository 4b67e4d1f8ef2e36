//! # Wire Protocol Library
//!
//! Message types and the binary codec shared by the server and its peers.
//!
//! ## Lazy Decoding
//!
//! Decoding a packet validates its envelope and nothing else. Each field is
//! parsed the first time it is read: fixed-width fields straight from their
//! byte position, variable-width fields (strings, byte blocks) once, after
//! which the parsed value is cached.
//!
//! ## Zero-Copy Re-Encoding
//!
//! Every decoded object owns a node in a [`DirtyTracker`] tree. Writing any
//! field marks the node and its ancestors dirty. Encoding a clean decoded
//! object copies its original bytes instead of serializing it again, and a
//! dirty object still copies the bytes of variable fields nobody touched.
//! Forwarding or echoing a message therefore costs a `memcpy`.
//!
//! ## Module Organization
//!
//! - `binary`: offset-explicit integer, string and byte block primitives
//! - `tracker`: the dirty tracker arena
//! - `segment`: lazy slots for fixed and variable fields
//! - `object`: the object envelope, generic encode/decode
//! - `messages`: the message types and [`Message`]
//! - `registry`: tag → codec table and packet framing
//!
//! ## Usage Example
//!
//! ```rust
//! use bytes::Bytes;
//! use protocol::{Message, Ping, Registry};
//!
//! let registry = Registry::with_defaults();
//! let packet = registry.encode_packet(&Message::from(Ping::new(7))).unwrap();
//!
//! let decoded = registry.decode_packet(&Bytes::from(packet.clone())).unwrap();
//! match decoded.message {
//!     Some(Message::Ping(ping)) => assert_eq!(ping.ping_id().unwrap(), 7),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

pub mod binary;
pub mod error;
pub mod messages;
pub mod object;
pub mod registry;
pub mod segment;
pub mod tracker;

pub use error::CodecError;
pub use messages::{AuthStatus, Authenticate, MapChange, Message, MessageTag, Payload, Ping, Pong, Terminate};
pub use object::{decode_object, encode_object, ObjectCodec};
pub use registry::{DecodedPacket, Registry};
pub use tracker::DirtyTracker;
