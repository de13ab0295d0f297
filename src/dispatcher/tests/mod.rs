mod test_deliver;

use crate::{
    dispatcher::Receiver,
    transport::{channel::ChannelMessage, Address, ChannelTransport, Leg, Proto},
};
use rsip::SipMessage;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub(crate) fn udp_addr(ip: &str, port: u16) -> Address {
    Address::new(Proto::Udp, ip.parse().unwrap(), port)
}

pub(crate) fn channel_leg(
    addr: Address,
) -> (
    Leg,
    UnboundedSender<ChannelMessage>,
    UnboundedReceiver<ChannelMessage>,
) {
    let (in_tx, in_rx) = unbounded_channel();
    let (out_tx, out_rx) = unbounded_channel();
    let leg = Leg::channel(ChannelTransport::new(addr, in_rx, out_tx));
    (leg, in_tx, out_rx)
}

/// Receiver that forwards every demultiplexed packet to a channel.
pub(crate) struct CapturingReceiver {
    tx: UnboundedSender<(SipMessage, Address)>,
}

impl CapturingReceiver {
    pub(crate) fn new() -> (Self, UnboundedReceiver<(SipMessage, Address)>) {
        let (tx, rx) = unbounded_channel();
        (CapturingReceiver { tx }, rx)
    }
}

impl Receiver for CapturingReceiver {
    fn receive(&self, msg: SipMessage, _leg: &Leg, from: &Address) -> Option<u16> {
        self.tx.send((msg, from.clone())).ok();
        Some(200)
    }
}
