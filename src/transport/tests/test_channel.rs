use super::udp_addr;
use crate::transport::{ChannelTransport, Leg, TransportEvent};
use rsip::headers::*;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::timeout;

fn register_request() -> rsip::Request {
    rsip::Request {
        method: rsip::Method::Register,
        uri: rsip::Uri::try_from("sip:registrar.example.com").expect("uri"),
        headers: vec![
            Via::new("SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKnashd92").into(),
            CSeq::new("1 REGISTER").into(),
            From::new("Bob <sip:bob@example.com>;tag=a1").into(),
            To::new("Bob <sip:bob@example.com>").into(),
            CallId::new("chan-test@example.com").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

#[tokio::test]
async fn test_pair_delivers_between_legs() {
    let (chan_a, chan_b) = ChannelTransport::pair(udp_addr("10.0.0.1", 5060), udp_addr("10.0.0.2", 5060));
    let leg_a = Leg::channel(chan_a);
    let leg_b = Leg::channel(chan_b.clone());

    let (b_events_tx, mut b_events) = unbounded_channel();
    let serve_leg = leg_b.clone();
    tokio::spawn(async move { serve_leg.serve_loop(b_events_tx).await });

    leg_a
        .deliver(&register_request().into(), &udp_addr("10.0.0.2", 5060))
        .await
        .expect("deliver");

    let event = timeout(Duration::from_millis(200), b_events.recv())
        .await
        .expect("event in time")
        .expect("event");
    match event {
        TransportEvent::Incoming(msg, leg, from) => {
            assert!(msg.is_request());
            assert_eq!(leg, leg_b);
            assert_eq!(from, udp_addr("10.0.0.1", 5060));
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_serve_loop_called_twice_fails() {
    let (chan_a, _chan_b) = ChannelTransport::pair(udp_addr("10.0.0.1", 5060), udp_addr("10.0.0.2", 5060));
    let leg = Leg::channel(chan_a.clone());

    let (tx, _rx) = unbounded_channel();
    let serve_leg = leg.clone();
    let tx_clone = tx.clone();
    tokio::spawn(async move { serve_leg.serve_loop(tx_clone).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(leg.serve_loop(tx).await.is_err());
}
