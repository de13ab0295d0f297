use crate::transport::Address;
use std::io;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessage(#[from] rsip::Error),

    #[error("DNS resolution error: {0}")]
    Resolve(String),

    #[error("no usable destination: {0}")]
    HostUnreachable(String),

    #[error("delivery timed out: {0}")]
    DeliveryTimeout(String),

    #[error("leg removed: {0}")]
    LegRemoved(Address),

    #[error("transport error: {0}: {1}")]
    Transport(String, Address),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("keepalive")]
    Keepalive,

    #[error("{0}")]
    Error(String),
}

impl Error {
    /// Write errors that end a delivery even on transports that would
    /// otherwise keep retransmitting.
    pub fn is_fatal_write(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::PermissionDenied
                    | io::ErrorKind::AddrNotAvailable
                    | io::ErrorKind::InvalidInput
            ),
            Error::LegRemoved(_) => true,
            Error::ChannelSend(_) => true,
            _ => false,
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelSend(e.to_string())
    }
}
