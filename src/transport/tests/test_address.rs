use crate::transport::{Address, Proto};
use rsip::HostWithPort;

#[test]
fn test_proto_defaults() {
    assert_eq!(Proto::Udp.default_port(), 5060);
    assert_eq!(Proto::Tcp.default_port(), 5060);
    assert_eq!(Proto::Tls.default_port(), 5061);

    assert!(!Proto::Udp.is_reliable());
    assert!(Proto::Tcp.is_reliable());
    assert!(Proto::Tls.is_reliable());
}

#[test]
fn test_proto_parse() {
    assert_eq!("UDP".parse::<Proto>().unwrap(), Proto::Udp);
    assert_eq!("tls".parse::<Proto>().unwrap(), Proto::Tls);
    assert!("sctp".parse::<Proto>().is_err());
}

#[test]
fn test_address_from_socket_addr() {
    let addr = Address::from_socket_addr(Proto::Udp, "10.0.0.1:5070".parse().unwrap());
    assert_eq!(addr.port, 5070);
    assert_eq!(addr.socket_addr(), "10.0.0.1:5070".parse().unwrap());
    assert!(addr.is_ipv4());
    assert_eq!(addr.server_name(), "10.0.0.1");
}

#[test]
fn test_address_keeps_host_for_sni() {
    let addr = Address::new(Proto::Tls, "10.0.0.1".parse().unwrap(), 5061)
        .with_host("sip.example.com");
    assert_eq!(addr.server_name(), "sip.example.com");
    // The numeric address stays authoritative for the socket.
    assert_eq!(addr.socket_addr(), "10.0.0.1:5061".parse().unwrap());
}

#[test]
fn test_address_from_host_port_literal() {
    let hwp = HostWithPort::try_from("1.2.3.4:5080").expect("host with port");
    let addr = Address::try_from_host_port(Proto::Udp, &hwp).expect("address");
    assert_eq!(addr.addr, "1.2.3.4".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(addr.port, 5080);

    let hwp = HostWithPort::try_from("1.2.3.4").expect("host only");
    let addr = Address::try_from_host_port(Proto::Tls, &hwp).expect("address");
    assert_eq!(addr.port, 5061);

    let hwp = HostWithPort::try_from("example.com:5060").expect("domain");
    assert!(Address::try_from_host_port(Proto::Udp, &hwp).is_err());
}

#[test]
fn test_address_to_uri() {
    let addr = Address::new(Proto::Tls, "10.0.0.1".parse().unwrap(), 5061);
    let uri: rsip::Uri = (&addr).into();
    assert_eq!(uri.scheme, Some(rsip::Scheme::Sips));

    let addr = Address::new(Proto::Udp, "10.0.0.1".parse().unwrap(), 5060);
    let uri: rsip::Uri = (&addr).into();
    assert_eq!(uri.scheme, Some(rsip::Scheme::Sip));
}
