use crate::{Error, Result};
use rsip::HostWithPort;
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

/// Transport protocol of a leg or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Udp,
    Tcp,
    Tls,
}

impl Proto {
    pub fn default_port(&self) -> u16 {
        match self {
            Proto::Udp | Proto::Tcp => 5060,
            Proto::Tls => 5061,
        }
    }

    /// Reliable transports get one transmission attempt; unreliable ones
    /// are driven by the retransmission schedule.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Proto::Udp)
    }

    pub fn transport(&self) -> rsip::transport::Transport {
        match self {
            Proto::Udp => rsip::transport::Transport::Udp,
            Proto::Tcp => rsip::transport::Transport::Tcp,
            Proto::Tls => rsip::transport::Transport::Tls,
        }
    }

    pub fn from_transport(transport: &rsip::transport::Transport) -> Option<Proto> {
        match transport {
            rsip::transport::Transport::Udp => Some(Proto::Udp),
            rsip::transport::Transport::Tcp => Some(Proto::Tcp),
            rsip::transport::Transport::Tls => Some(Proto::Tls),
            _ => None,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Udp => write!(f, "udp"),
            Proto::Tcp => write!(f, "tcp"),
            Proto::Tls => write!(f, "tls"),
        }
    }
}

impl std::str::FromStr for Proto {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(Proto::Udp)
        } else if s.eq_ignore_ascii_case("tcp") {
            Ok(Proto::Tcp)
        } else if s.eq_ignore_ascii_case("tls") {
            Ok(Proto::Tls)
        } else {
            Err(Error::Config(format!("unknown transport protocol: {}", s)))
        }
    }
}

/// A resolved network destination or local binding.
///
/// `addr` is authoritative for socket syscalls; `host` keeps the name the
/// address was resolved from, for TLS SNI and certificate checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub proto: Proto,
    pub host: Option<String>,
    pub addr: IpAddr,
    pub port: u16,
}

impl Address {
    pub fn new(proto: Proto, addr: IpAddr, port: u16) -> Self {
        Address {
            proto,
            host: None,
            addr,
            port,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn from_socket_addr(proto: Proto, addr: SocketAddr) -> Self {
        Address::new(proto, addr.ip(), addr.port())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Name presented for TLS server-name indication and certificate
    /// validation.
    pub fn server_name(&self) -> String {
        self.host
            .clone()
            .unwrap_or_else(|| self.addr.to_string())
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Address from a host/port pair that is already an IP literal.
    pub fn try_from_host_port(proto: Proto, host_with_port: &HostWithPort) -> Result<Self> {
        let addr = match &host_with_port.host {
            rsip::host_with_port::Host::IpAddr(ip) => *ip,
            rsip::host_with_port::Host::Domain(domain) => domain
                .to_string()
                .parse::<IpAddr>()
                .map_err(|_| Error::Resolve(format!("not an IP literal: {}", domain)))?,
        };
        let port = host_with_port
            .port
            .as_ref()
            .map(|p| *p.value())
            .unwrap_or_else(|| proto.default_port());
        Ok(Address::new(proto, addr, port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.proto, self.addr, self.port)?;
        if let Some(host) = &self.host {
            write!(f, " ({})", host)?;
        }
        Ok(())
    }
}

impl From<&Address> for rsip::Uri {
    fn from(addr: &Address) -> Self {
        let scheme = match addr.proto {
            Proto::Tls => rsip::Scheme::Sips,
            _ => rsip::Scheme::Sip,
        };
        rsip::Uri {
            scheme: Some(scheme),
            host_with_port: addr.socket_addr().into(),
            ..Default::default()
        }
    }
}

impl From<&Address> for HostWithPort {
    fn from(addr: &Address) -> Self {
        addr.socket_addr().into()
    }
}
