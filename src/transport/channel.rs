//! In-memory transport, used by tests and embedded consumers that feed a
//! dispatcher without a socket.

use super::{Address, TransportSender};
use crate::transport::leg::Leg;
use crate::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub type ChannelMessage = (rsip::SipMessage, Address);

struct ChannelInner {
    addr: Address,
    incoming: Mutex<Option<UnboundedReceiver<ChannelMessage>>>,
    outgoing: UnboundedSender<ChannelMessage>,
}

#[derive(Clone)]
pub struct ChannelTransport {
    inner: Arc<ChannelInner>,
}

impl ChannelTransport {
    pub fn new(
        addr: Address,
        incoming: UnboundedReceiver<ChannelMessage>,
        outgoing: UnboundedSender<ChannelMessage>,
    ) -> Self {
        ChannelTransport {
            inner: Arc::new(ChannelInner {
                addr,
                incoming: Mutex::new(Some(incoming)),
                outgoing,
            }),
        }
    }

    /// Two transports wired back to back: whatever one sends arrives on
    /// the other's serve loop.
    pub fn pair(addr_a: Address, addr_b: Address) -> (ChannelTransport, ChannelTransport) {
        let (tx_ab, rx_ab) = unbounded_channel();
        let (tx_ba, rx_ba) = unbounded_channel();
        (
            ChannelTransport::new(addr_a, rx_ba, tx_ab),
            ChannelTransport::new(addr_b, rx_ab, tx_ba),
        )
    }

    pub fn addr(&self) -> &Address {
        &self.inner.addr
    }

    pub fn send(&self, msg: rsip::SipMessage) -> Result<()> {
        self.inner
            .outgoing
            .send((msg, self.inner.addr.clone()))
            .map_err(Into::into)
    }

    pub async fn serve_loop(&self, leg: Leg, sender: TransportSender) -> Result<()> {
        let incoming = self.inner.incoming.lock().unwrap().take();
        let mut incoming = incoming.ok_or_else(|| {
            crate::Error::Error("ChannelTransport::serve_loop called twice".to_string())
        })?;
        while let Some((msg, from)) = incoming.recv().await {
            leg.ingress(msg, from, &sender);
        }
        Ok(())
    }
}

impl std::fmt::Display for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}
