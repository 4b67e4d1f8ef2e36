//! Errors surfaced by the connection handler and its collaborators.

use crate::transport::TransportError;
use protocol::CodecError;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already listening")]
    AlreadyListening,

    #[error("handler cannot {action} while {state}")]
    InvalidState { action: &'static str, state: &'static str },

    #[error("failed to resolve host {host:?}: {reason}")]
    AddressResolution { host: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("server is not listening")]
    NotListening,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("config {path:?}: {message}")]
    Config { path: PathBuf, message: String },
}

pub type Result<T> = std::result::Result<T, ServerError>;
