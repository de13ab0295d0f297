mod test_address;
mod test_channel;
mod test_udp;

use super::{channel::ChannelMessage, Address, ChannelTransport, Leg};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Channel-backed leg plus the injection and observation ends of its
/// wiring: `in_tx` feeds the leg's serve loop, `out_rx` sees what it
/// sends.
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

pub(crate) fn udp_addr(ip: &str, port: u16) -> Address {
    Address::new(super::Proto::Udp, ip.parse().unwrap(), port)
}
