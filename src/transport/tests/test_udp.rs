use crate::{
    transport::{
        udp::UdpTransport, Leg, TransportEvent, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE,
    },
    Result,
};
use std::time::Duration;
use tokio::{select, sync::mpsc::unbounded_channel, time::sleep};

#[tokio::test]
async fn test_udp_keepalive() -> Result<()> {
    let leg_alice = Leg::udp("127.0.0.1:0".parse()?, None).await?;
    let peer_bob = UdpTransport::bind("127.0.0.1:0".parse()?, None).await?;
    let (alice_tx, _) = unbounded_channel();

    let alice_addr = leg_alice.local().socket_addr();
    let bob_loop = async {
        sleep(Duration::from_millis(20)).await; // wait for serve_loop to start
        peer_bob
            .send_to(KEEPALIVE_REQUEST, alice_addr)
            .await
            .expect("send keepalive");
        let buf = &mut [0u8; 2048];
        let (n, _) = peer_bob.recv_raw(buf).await.expect("recv_raw");
        assert_eq!(&buf[..n], KEEPALIVE_RESPONSE);
    };

    select! {
        _ = leg_alice.serve_loop(alice_tx) => {
            panic!("serve_loop exited");
        }
        _ = bob_loop => {}
        _ = sleep(Duration::from_millis(500)) => {
            panic!("timeout waiting for keepalive response");
        }
    };
    Ok(())
}

#[tokio::test]
async fn test_udp_recv_sip_message() -> Result<()> {
    let leg_alice = Leg::udp("127.0.0.1:0".parse()?, None).await?;
    let peer_bob = UdpTransport::bind("127.0.0.1:0".parse()?, None).await?;
    let (alice_tx, mut alice_rx) = unbounded_channel();

    let alice_addr = leg_alice.local().socket_addr();
    let send_loop = async {
        sleep(Duration::from_millis(20)).await; // wait for serve_loop to start
        let msg = "REGISTER sip:bob@example.com SIP/2.0\r\nVia: SIP/2.0/UDP 127.0.0.1:5061;branch=z9hG4bKnashd92\r\nCSeq: 1 REGISTER\r\n\r\n";
        peer_bob
            .send_to(msg.as_bytes(), alice_addr)
            .await
            .expect("send message");
        sleep(Duration::from_secs(3)).await;
    };

    select! {
        _ = leg_alice.serve_loop(alice_tx) => {
            panic!("serve_loop exited");
        }
        _ = send_loop => {
            panic!("send_loop exited");
        }
        event = alice_rx.recv() => {
            match event {
                Some(TransportEvent::Incoming(msg, leg, from)) => {
                    assert!(msg.is_request());
                    assert_eq!(leg, leg_alice);
                    assert_eq!(from.socket_addr(), peer_bob.local_addr());
                }
                _ => panic!("unexpected event"),
            }
        }
        _ = sleep(Duration::from_millis(500)) => {
            panic!("timeout waiting for message");
        }
    };
    Ok(())
}

#[tokio::test]
async fn test_udp_malformed_packet_counted_and_dropped() -> Result<()> {
    let leg_alice = Leg::udp("127.0.0.1:0".parse()?, None).await?;
    let peer_bob = UdpTransport::bind("127.0.0.1:0".parse()?, None).await?;
    let (alice_tx, mut alice_rx) = unbounded_channel::<TransportEvent>();

    let alice_addr = leg_alice.local().socket_addr();
    let leg_ref = leg_alice.clone();
    let send_loop = async {
        sleep(Duration::from_millis(20)).await;
        peer_bob
            .send_to(b"this is not SIP\r\n\r\n", alice_addr)
            .await
            .expect("send garbage");
        // give the serve loop time to drop it
        sleep(Duration::from_millis(100)).await;
        assert_eq!(leg_ref.parse_errors(), 1);
        assert!(alice_rx.try_recv().is_err());
    };

    select! {
        _ = leg_alice.serve_loop(alice_tx) => {
            panic!("serve_loop exited");
        }
        _ = send_loop => {}
        _ = sleep(Duration::from_millis(500)) => {
            panic!("timeout");
        }
    };
    Ok(())
}
