use super::{channel_leg, udp_addr, CapturingReceiver};
use crate::{
    dispatcher::{CancelKey, DeliverOpts, Dispatcher},
    message::{make_response, Tid},
    resolver::StaticDns,
    Error, Result,
};
use rsip::{headers::*, SipMessage};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{sync::mpsc::unbounded_channel, time::timeout};

const TEST_T1: Duration = Duration::from_millis(20);

fn spawn_dispatcher() -> Arc<Dispatcher> {
    let dispatcher = Arc::new(
        crate::DispatcherBuilder::new()
            .with_dns(Arc::new(StaticDns::new()))
            .with_t1(TEST_T1)
            .with_timer_interval(Duration::from_millis(5))
            .build()
            .expect("build dispatcher"),
    );
    let serve = dispatcher.clone();
    tokio::spawn(async move { serve.serve().await });
    dispatcher
}

fn invite_request(call_id: &str, cseq: u32) -> rsip::Request {
    rsip::Request {
        method: rsip::Method::Invite,
        uri: rsip::Uri::try_from("sip:bob@1.2.3.4:5060").expect("uri"),
        headers: vec![
            CSeq::new(format!("{} INVITE", cseq).as_str()).into(),
            From::new("Alice <sip:alice@example.com>;tag=abc").into(),
            To::new("Bob <sip:bob@example.com>").into(),
            CallId::new(call_id).into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

fn callback_channel() -> (
    crate::dispatcher::DeliveryCallback,
    tokio::sync::mpsc::UnboundedReceiver<Result<()>>,
) {
    let (tx, rx) = unbounded_channel();
    (
        Box::new(move |result: Result<()>| {
            tx.send(result).ok();
        }),
        rx,
    )
}

#[tokio::test]
async fn test_deliver_resolves_and_sends() {
    let dispatcher = spawn_dispatcher();
    let (leg, _in_tx, mut out_rx) = channel_leg(udp_addr("10.0.0.1", 5060));
    dispatcher.add_leg(leg);

    dispatcher.deliver(invite_request("resolve-test@x", 1).into(), DeliverOpts::default());

    let (sent, _) = timeout(Duration::from_millis(500), out_rx.recv())
        .await
        .expect("sent in time")
        .expect("sent");
    assert!(sent.is_request());
    assert_eq!(dispatcher.pending_deliveries(), 1);
}

#[tokio::test]
async fn test_response_cancels_delivery_and_reaches_receiver_once() {
    let dispatcher = spawn_dispatcher();
    let (receiver, mut received) = CapturingReceiver::new();
    dispatcher.set_receiver(Arc::new(receiver));

    let (leg, in_tx, mut out_rx) = channel_leg(udp_addr("10.0.0.1", 5060));
    dispatcher.add_leg(leg);

    dispatcher.deliver(invite_request("cancel-by-response@x", 1).into(), DeliverOpts::default());

    let (sent, _) = timeout(Duration::from_millis(500), out_rx.recv())
        .await
        .expect("sent in time")
        .expect("sent");
    let SipMessage::Request(sent) = sent else {
        panic!("expected request")
    };

    // The peer answers 180; its response carries our Via back.
    let resp = make_response(&sent, rsip::StatusCode::Ringing, vec![], None);
    in_tx
        .send((resp.into(), udp_addr("1.2.3.4", 5060)))
        .expect("inject response");

    let (msg, _) = timeout(Duration::from_millis(500), received.recv())
        .await
        .expect("response forwarded in time")
        .expect("response");
    assert!(msg.is_response());
    assert!(timeout(Duration::from_millis(100), received.recv()).await.is_err());

    // Delivery acknowledged: no entry left, no further retransmission.
    assert_eq!(dispatcher.pending_deliveries(), 0);
    while out_rx.try_recv().is_ok() {}
    tokio::time::sleep(TEST_T1 * 10).await;
    assert!(out_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_response_with_foreign_via_is_dropped() {
    let dispatcher = spawn_dispatcher();
    let (receiver, mut received) = CapturingReceiver::new();
    dispatcher.set_receiver(Arc::new(receiver));

    let (leg, in_tx, mut out_rx) = channel_leg(udp_addr("10.0.0.1", 5060));
    dispatcher.add_leg(leg);

    dispatcher.deliver(invite_request("foreign-via@x", 1).into(), DeliverOpts::default());
    let _ = timeout(Duration::from_millis(500), out_rx.recv())
        .await
        .expect("sent in time");

    let mut resp = make_response(&invite_request("foreign-via@x", 1), rsip::StatusCode::OK, vec![], None);
    resp.headers.push(
        Via::new("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK-other").into(),
    );
    in_tx
        .send((resp.into(), udp_addr("1.2.3.4", 5060)))
        .expect("inject response");

    // Never reaches the receiver, never cancels the delivery.
    assert!(timeout(Duration::from_millis(150), received.recv()).await.is_err());
    assert_eq!(dispatcher.dropped_responses(), 1);
    assert_eq!(dispatcher.pending_deliveries(), 1);
}

#[tokio::test]
async fn test_retransmits_then_times_out() {
    let dispatcher = spawn_dispatcher();
    let (leg, _in_tx, mut out_rx) = channel_leg(udp_addr("10.0.0.1", 5060));
    dispatcher.add_leg(leg);

    let (callback, mut errors) = callback_channel();
    dispatcher.deliver(
        invite_request("blackhole@x", 1).into(),
        DeliverOpts {
            callback: Some(callback),
            ..Default::default()
        },
    );

    // With T1=20ms the schedule is 0, 20, 60, 140, 300, 620, 1260 ms
    // and the transaction times out at 64*T1 = 1280 ms.
    let result = timeout(Duration::from_secs(3), errors.recv())
        .await
        .expect("timeout error in time")
        .expect("callback invoked");
    assert!(matches!(result, Err(Error::DeliveryTimeout(_))));

    let mut transmissions = 0;
    while out_rx.try_recv().is_ok() {
        transmissions += 1;
    }
    assert_eq!(transmissions, 7);
    assert_eq!(dispatcher.pending_deliveries(), 0);
}

#[tokio::test]
async fn test_cancel_delivery_is_side_effect_free() {
    let dispatcher = spawn_dispatcher();
    let (leg, _in_tx, mut out_rx) = channel_leg(udp_addr("10.0.0.1", 5060));
    dispatcher.add_leg(leg);

    let request = invite_request("cancel-by-id@x", 1);
    let tid = Tid::call_seq(&request.clone().into()).expect("tid");
    let (callback, mut errors) = callback_channel();
    dispatcher.deliver(
        request.into(),
        DeliverOpts {
            callback: Some(callback),
            ..Default::default()
        },
    );

    let _ = timeout(Duration::from_millis(500), out_rx.recv())
        .await
        .expect("first transmission");
    assert!(dispatcher.cancel_delivery(&CancelKey::Id(tid.to_string())));
    assert!(!dispatcher.cancel_delivery(&CancelKey::Id(tid.to_string())));
    assert_eq!(dispatcher.pending_deliveries(), 0);

    // The already-armed timer fires into the void: no transmissions, no
    // callback.
    while out_rx.try_recv().is_ok() {}
    tokio::time::sleep(TEST_T1 * 10).await;
    assert!(out_rx.try_recv().is_err());
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_cancel_delivery_by_call_id() {
    let dispatcher = spawn_dispatcher();
    let (leg, _in_tx, mut out_rx) = channel_leg(udp_addr("10.0.0.1", 5060));
    dispatcher.add_leg(leg);

    dispatcher.deliver(invite_request("same-call@x", 1).into(), DeliverOpts::default());
    dispatcher.deliver(invite_request("same-call@x", 2).into(), DeliverOpts::default());

    for _ in 0..2 {
        let _ = timeout(Duration::from_millis(500), out_rx.recv())
            .await
            .expect("transmission");
    }
    assert_eq!(dispatcher.pending_deliveries(), 2);
    assert!(dispatcher.cancel_delivery(&CancelKey::CallId("same-call@x".to_string())));
    assert_eq!(dispatcher.pending_deliveries(), 0);
}

#[tokio::test]
async fn test_remove_leg_fails_deliveries_in_flight() {
    let dispatcher = spawn_dispatcher();
    let (leg, _in_tx, mut out_rx) = channel_leg(udp_addr("10.0.0.1", 5060));
    dispatcher.add_leg(leg.clone());

    let (callback, mut errors) = callback_channel();
    dispatcher.deliver(
        invite_request("leg-removed@x", 1).into(),
        DeliverOpts {
            callback: Some(callback),
            ..Default::default()
        },
    );
    let _ = timeout(Duration::from_millis(500), out_rx.recv())
        .await
        .expect("first transmission");

    assert!(dispatcher.remove_leg(&leg));
    let result = timeout(Duration::from_millis(500), errors.recv())
        .await
        .expect("failure in time")
        .expect("callback invoked");
    assert!(matches!(result, Err(Error::LegRemoved(_))));
    assert_eq!(dispatcher.pending_deliveries(), 0);
}

#[tokio::test]
async fn test_unresolvable_destination_reports_failure() {
    let dispatcher = spawn_dispatcher();
    let (leg, _in_tx, _out_rx) = channel_leg(udp_addr("10.0.0.1", 5060));
    dispatcher.add_leg(leg);

    let mut request = invite_request("unresolvable@x", 1);
    request.uri = rsip::Uri::try_from("sip:bob@nxdomain.example").expect("uri");

    let (callback, mut errors) = callback_channel();
    dispatcher.deliver(
        request.into(),
        DeliverOpts {
            callback: Some(callback),
            ..Default::default()
        },
    );

    let result = timeout(Duration::from_millis(500), errors.recv())
        .await
        .expect("failure in time")
        .expect("callback invoked");
    assert!(matches!(result, Err(Error::HostUnreachable(_))));
    assert_eq!(dispatcher.pending_deliveries(), 0);
}

#[tokio::test]
async fn test_reliable_transport_completes_on_write() {
    let dispatcher = spawn_dispatcher();
    let tcp_addr = crate::transport::Address::new(
        crate::transport::Proto::Tcp,
        "10.0.0.1".parse().unwrap(),
        5060,
    );
    let (leg, _in_tx, mut out_rx) = channel_leg(tcp_addr.clone());
    dispatcher.add_leg(leg.clone());

    let dst = crate::transport::Address::new(
        crate::transport::Proto::Tcp,
        "1.2.3.4".parse().unwrap(),
        5060,
    );
    let (callback, mut completions) = callback_channel();
    dispatcher.deliver(
        invite_request("reliable@x", 1).into(),
        DeliverOpts {
            leg: Some(leg),
            dst: Some(dst),
            callback: Some(callback),
            ..Default::default()
        },
    );

    let result = timeout(Duration::from_millis(500), completions.recv())
        .await
        .expect("completion in time")
        .expect("callback invoked");
    assert!(result.is_ok());
    assert_eq!(dispatcher.pending_deliveries(), 0);

    // Exactly one transmission, no retransmit schedule.
    let _ = timeout(Duration::from_millis(100), out_rx.recv()).await;
    tokio::time::sleep(TEST_T1 * 5).await;
    assert!(out_rx.try_recv().is_err());
}
