use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod address;
pub mod channel;
pub mod leg;
pub mod registry;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use address::{Address, Proto};
pub use channel::ChannelTransport;
pub use leg::{Leg, LegSpec};
pub use registry::LegRegistry;
pub use tls::TlsConfig;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// Events emitted by leg serve loops towards the dispatcher.
#[derive(Debug)]
pub enum TransportEvent {
    /// A SIP message arrived on a leg, with the source address.
    Incoming(rsip::SipMessage, Leg, Address),
    /// A leg's serve loop exited.
    Closed(Leg),
}

pub type TransportSender = UnboundedSender<TransportEvent>;
pub type TransportReceiver = UnboundedReceiver<TransportEvent>;

#[cfg(test)]
mod tests;
