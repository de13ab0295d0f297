//! A leg is one socket-bound transport endpoint. It owns the branch tag
//! used for loop detection and response matching, stamps outgoing
//! requests with a Via, and rewrites Via/Route/Record-Route headers when
//! packets are forwarded across legs.

use super::{
    channel::ChannelTransport, tcp::StreamPool, tls::TlsContext, udp::UdpTransport, Address, Proto,
    TlsConfig, TransportEvent, TransportSender,
};
use crate::{
    header_pop,
    message::{branch_nonce, random_text, BRANCH_MAGIC},
    rsip_ext::{extract_uri, RsipHeadersExt},
    Error, Result,
};
use get_if_addrs::IfAddr;
use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Param, SipMessage,
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, info, trace};

static LEG_SEQ: AtomicU64 = AtomicU64::new(0);

const BRANCH_TAG_LEN: usize = 8;

fn make_branch_tag() -> String {
    // Random prefix plus a process-wide counter: unique for the process
    // lifetime even if the RNG repeats itself.
    format!(
        "{}{:04x}",
        random_text(BRANCH_TAG_LEN),
        LEG_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

pub(crate) enum LegTransport {
    Udp(UdpTransport),
    Stream(StreamPool),
    Channel(ChannelTransport),
}

struct LegInner {
    local: Address,
    contact: rsip::Uri,
    branch: String,
    transport: LegTransport,
    fixed_dst: Mutex<Option<Address>>,
    parse_errors: AtomicU64,
}

/// Shared handle to one transport endpoint. Legs are cheap to clone and
/// immutable after construction.
#[derive(Clone)]
pub struct Leg {
    inner: Arc<LegInner>,
}

/// Conjunctive match over leg attributes; unset fields match anything.
#[derive(Clone, Default)]
pub struct LegSpec {
    pub addr: Option<IpAddr>,
    pub port: Option<u16>,
    pub proto: Option<Proto>,
    pub predicate: Option<Arc<dyn Fn(&Leg) -> bool + Send + Sync>>,
}

impl LegSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addr(mut self, addr: IpAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_proto(mut self, proto: Proto) -> Self {
        self.proto = Some(proto);
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Leg) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }
}

impl Leg {
    pub async fn udp(local: SocketAddr, external: Option<SocketAddr>) -> Result<Leg> {
        let transport = UdpTransport::bind(local, external).await?;
        let addr = transport.local_addr();
        Ok(Self::from_parts(
            Proto::Udp,
            addr,
            LegTransport::Udp(transport),
        ))
    }

    /// Build a leg around an already bound socket.
    pub fn from_udp_socket(
        socket: tokio::net::UdpSocket,
        external: Option<SocketAddr>,
    ) -> Result<Leg> {
        let transport = UdpTransport::from_socket(socket, external)?;
        let addr = transport.local_addr();
        Ok(Self::from_parts(
            Proto::Udp,
            addr,
            LegTransport::Udp(transport),
        ))
    }

    pub async fn tcp(local: SocketAddr) -> Result<Leg> {
        let pool = StreamPool::bind(Proto::Tcp, local, None).await?;
        let addr = pool.local_addr();
        Ok(Self::from_parts(
            Proto::Tcp,
            addr,
            LegTransport::Stream(pool),
        ))
    }

    pub async fn tls(local: SocketAddr, config: TlsConfig) -> Result<Leg> {
        let ctx = TlsContext::new(&config)?;
        let pool = StreamPool::bind(Proto::Tls, local, Some(ctx)).await?;
        let addr = pool.local_addr();
        Ok(Self::from_parts(
            Proto::Tls,
            addr,
            LegTransport::Stream(pool),
        ))
    }

    /// In-memory leg for tests and embedded consumers.
    pub fn channel(transport: ChannelTransport) -> Leg {
        let local = transport.addr().clone();
        let contact = Self::make_contact(&local);
        Leg {
            inner: Arc::new(LegInner {
                local,
                contact,
                branch: make_branch_tag(),
                transport: LegTransport::Channel(transport),
                fixed_dst: Mutex::new(None),
                parse_errors: AtomicU64::new(0),
            }),
        }
    }

    fn from_parts(proto: Proto, bound: SocketAddr, transport: LegTransport) -> Leg {
        let bound = Self::resolve_bind_address(bound);
        let local = Address::from_socket_addr(proto, bound);
        let contact = Self::make_contact(&local);
        info!("created leg: {} contact: {}", local, contact);
        Leg {
            inner: Arc::new(LegInner {
                local,
                contact,
                branch: make_branch_tag(),
                transport,
                fixed_dst: Mutex::new(None),
                parse_errors: AtomicU64::new(0),
            }),
        }
    }

    /// Pin every delivery on this leg to one destination, regardless of
    /// what the dispatcher resolved.
    pub fn set_fixed_dst(&self, dst: Option<Address>) {
        *self.inner.fixed_dst.lock().unwrap() = dst;
    }

    pub fn fixed_dst(&self) -> Option<Address> {
        self.inner.fixed_dst.lock().unwrap().clone()
    }

    pub fn local(&self) -> &Address {
        &self.inner.local
    }

    pub fn contact(&self) -> &rsip::Uri {
        &self.inner.contact
    }

    pub fn branch_tag(&self) -> &str {
        &self.inner.branch
    }

    pub fn parse_errors(&self) -> u64 {
        self.inner.parse_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn note_parse_error(&self) {
        self.inner.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn make_contact(local: &Address) -> rsip::Uri {
        let scheme = match local.proto {
            Proto::Tls => rsip::Scheme::Sips,
            _ => rsip::Scheme::Sip,
        };
        let params = match local.proto {
            Proto::Tcp => vec![Param::Transport(rsip::transport::Transport::Tcp)],
            _ => vec![],
        };
        rsip::Uri {
            scheme: Some(scheme),
            host_with_port: local.socket_addr().into(),
            params,
            ..Default::default()
        }
    }

    /// Replace an unspecified bind address with the first usable
    /// interface address, falling back to loopback.
    fn resolve_bind_address(addr: SocketAddr) -> SocketAddr {
        if !addr.ip().is_unspecified() {
            return addr;
        }
        let interfaces = match get_if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(_) => return addr,
        };
        for interface in interfaces {
            if interface.is_loopback() {
                continue;
            }
            if let IfAddr::V4(v4addr) = interface.addr {
                return SocketAddr::new(IpAddr::V4(v4addr.ip), addr.port());
            }
        }
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), addr.port())
    }

    /// Send one packet. Requests get exactly one Via stamped with this
    /// leg's branch; the packet handed in is left untouched, so a
    /// retransmitted packet produces the identical wire image every time.
    pub async fn deliver(&self, msg: &SipMessage, dst: &Address) -> Result<()> {
        let dst = self.fixed_dst().unwrap_or_else(|| dst.clone());
        let msg = match msg {
            SipMessage::Request(req) => {
                let mut req = req.clone();
                self.add_via(&mut req)?;
                SipMessage::Request(req)
            }
            SipMessage::Response(resp) => SipMessage::Response(resp.clone()),
        };
        trace!("{} delivering to {}", self, dst);
        match &self.inner.transport {
            LegTransport::Udp(t) => t.send_to(msg.to_string().as_bytes(), dst.socket_addr()).await,
            LegTransport::Stream(p) => p.send(&msg, &dst).await,
            LegTransport::Channel(c) => c.send(msg),
        }
    }

    fn add_via(&self, req: &mut rsip::Request) -> Result<()> {
        let branch = format!(
            "{}{}{}",
            BRANCH_MAGIC,
            self.inner.branch,
            branch_nonce(&SipMessage::Request(req.clone()))
        );
        let via = rsip::typed::Via {
            version: rsip::Version::V2,
            transport: self.inner.local.proto.transport(),
            uri: rsip::Uri {
                host_with_port: self.inner.contact.host_with_port.clone(),
                ..Default::default()
            },
            params: vec![Param::Branch(branch.into())],
        };
        req.headers.push_front(rsip::Header::Via(via.into()));
        Ok(())
    }

    /// True iff the top Via was stamped by this leg: its branch starts
    /// with the magic cookie followed by this leg's tag.
    pub fn check_via(&self, msg: &SipMessage) -> bool {
        let via = match msg {
            SipMessage::Request(req) => req.via_header(),
            SipMessage::Response(resp) => resp.via_header(),
        };
        match via {
            Ok(via) => self.via_is_ours(via),
            Err(_) => false,
        }
    }

    fn via_is_ours(&self, via: &rsip::headers::Via) -> bool {
        let Ok(typed) = via.typed() else { return false };
        match typed.branch() {
            Some(branch) => branch
                .value()
                .starts_with(&format!("{}{}", BRANCH_MAGIC, self.inner.branch)),
            None => false,
        }
    }

    /// Protocol compatibility check for destination candidates. There is
    /// no OS route introspection at this layer: any address on a
    /// matching protocol is assumed reachable.
    pub fn can_deliver_to(&self, addr: &Address) -> bool {
        addr.proto == self.inner.local.proto
    }

    pub fn matches(&self, spec: &LegSpec) -> bool {
        if let Some(addr) = &spec.addr {
            if *addr != self.inner.local.addr {
                return false;
            }
        }
        if let Some(port) = spec.port {
            if port != self.inner.local.port {
                return false;
            }
        }
        if let Some(proto) = spec.proto {
            if proto != self.inner.local.proto {
                return false;
            }
        }
        if let Some(predicate) = &spec.predicate {
            if !predicate(self) {
                return false;
            }
        }
        true
    }

    /// Rewrite a packet that arrived on this leg and is about to be
    /// handed upstream or forwarded.
    ///
    /// Responses lose the top Via, which must be ours. Requests get a
    /// `received` parameter when the sender lied about its address, an
    /// `rport` value when it asked for one, and their Route set adjusted
    /// for strict- vs loose-routing.
    pub fn forward_incoming(&self, msg: &mut SipMessage, from: &Address) -> Result<()> {
        match msg {
            SipMessage::Response(resp) => {
                if !resp.via_header().map(|v| self.via_is_ours(v)).unwrap_or(false) {
                    return Err(Error::Error(format!(
                        "top Via is not ours on leg {}",
                        self
                    )));
                }
                header_pop!(resp.headers, rsip::Header::Via);
                Ok(())
            }
            SipMessage::Request(req) => {
                Self::apply_received(req, from.socket_addr())?;
                self.process_routes(req)
            }
        }
    }

    /// Rewrite a packet about to leave through this leg on behalf of a
    /// forwarding consumer: record ourselves in the route set and drop a
    /// leading Route entry that already points at us.
    pub fn forward_outgoing(&self, msg: &mut SipMessage, incoming_leg: &Leg) -> Result<()> {
        let SipMessage::Request(req) = msg else {
            return Ok(());
        };

        if let Some(first) = Self::first_route(req) {
            if let Ok(uri) = extract_uri(&first) {
                if self.is_local_uri(&uri) || incoming_leg.is_local_uri(&uri) {
                    Self::pop_first_route(req);
                }
            }
        }

        let contact = &self.inner.contact.host_with_port;
        let record_route = rsip::Header::RecordRoute(format!("<sip:{};lr>", contact).into());
        req.headers.push_front(record_route);
        Ok(())
    }

    /// Add `received=`/`rport=` to the top Via when the observed source
    /// does not match what the sender wrote there.
    fn apply_received(req: &mut rsip::Request, src: SocketAddr) -> Result<()> {
        let via = req.via_header_mut()?;
        let mut typed = via.typed()?;

        let sent_by_ip = match &typed.uri.host_with_port.host {
            rsip::host_with_port::Host::IpAddr(ip) => Some(*ip),
            rsip::host_with_port::Host::Domain(domain) => domain.to_string().parse().ok(),
        };
        let host_differs = sent_by_ip != Some(src.ip());

        let wants_rport = typed.params.iter().any(|param| {
            matches!(param, Param::Other(key, None) if key.value().eq_ignore_ascii_case("rport"))
        });

        if !host_differs && !wants_rport {
            return Ok(());
        }

        typed.params.retain(|param| {
            if let Param::Other(key, _) = param {
                !key.value().eq_ignore_ascii_case("rport")
            } else {
                !matches!(param, Param::Received(_))
            }
        });

        if host_differs {
            typed.params.push(Param::Received(rsip::param::Received::new(
                src.ip().to_string(),
            )));
        }
        if wants_rport {
            typed.params.push(Param::Other(
                rsip::param::OtherParam::new("rport"),
                Some(rsip::param::OtherParamValue::new(src.port().to_string())),
            ));
        }

        *via = typed.into();
        Ok(())
    }

    fn process_routes(&self, req: &mut rsip::Request) -> Result<()> {
        // Strict-routing fixup: a strict router put us in the request-URI
        // and pushed the real target to the end of the Route set.
        if self.is_local_uri(&req.uri) {
            if let Some(last) = Self::last_route(req) {
                let uri = extract_uri(&last)?;
                Self::pop_last_route(req);
                req.uri = uri;
                debug!("{} strict route rewrite to {}", self, req.uri);
                return Ok(());
            }
        }

        // Loose routing: shed leading Route entries that point at us.
        while let Some(first) = Self::first_route(req) {
            match extract_uri(&first) {
                Ok(uri) if self.is_local_uri(&uri) => {
                    Self::pop_first_route(req);
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn first_route(req: &rsip::Request) -> Option<String> {
        req.headers.iter().find_map(|h| match h {
            rsip::Header::Route(route) => route
                .value()
                .split(',')
                .next()
                .map(|entry| entry.trim().to_string()),
            _ => None,
        })
    }

    fn last_route(req: &rsip::Request) -> Option<String> {
        req.headers
            .iter()
            .filter_map(|h| match h {
                rsip::Header::Route(route) => route
                    .value()
                    .split(',')
                    .last()
                    .map(|entry| entry.trim().to_string()),
                _ => None,
            })
            .last()
    }

    fn pop_first_route(req: &mut rsip::Request) {
        let mut done = false;
        let mut headers = req.headers.iter().cloned().collect::<Vec<_>>();
        for h in headers.iter_mut() {
            if done {
                break;
            }
            if let rsip::Header::Route(route) = h {
                let value = route.value().to_string();
                match value.split_once(',') {
                    Some((_, rest)) => {
                        *h = rsip::Header::Route(rest.trim().to_string().into());
                    }
                    None => {
                        *h = rsip::Header::Route(String::new().into());
                    }
                }
                done = true;
            }
        }
        headers.retain(|h| !matches!(h, rsip::Header::Route(route) if route.value().is_empty()));
        req.headers = headers.into();
    }

    fn pop_last_route(req: &mut rsip::Request) {
        let mut headers = req.headers.iter().cloned().collect::<Vec<_>>();
        for h in headers.iter_mut().rev() {
            if let rsip::Header::Route(route) = h {
                let value = route.value().to_string();
                match value.rsplit_once(',') {
                    Some((rest, _)) => {
                        *h = rsip::Header::Route(rest.trim().to_string().into());
                    }
                    None => {
                        *h = rsip::Header::Route(String::new().into());
                    }
                }
                break;
            }
        }
        headers.retain(|h| !matches!(h, rsip::Header::Route(route) if route.value().is_empty()));
        req.headers = headers.into();
    }

    fn is_local_uri(&self, uri: &rsip::Uri) -> bool {
        let port = uri
            .host_with_port
            .port
            .as_ref()
            .map(|p| *p.value())
            .unwrap_or_else(|| self.inner.local.proto.default_port());
        if port != self.inner.local.port {
            return false;
        }
        match &uri.host_with_port.host {
            rsip::host_with_port::Host::IpAddr(ip) => *ip == self.inner.local.addr,
            rsip::host_with_port::Host::Domain(domain) => domain
                .to_string()
                .parse::<IpAddr>()
                .map(|ip| ip == self.inner.local.addr)
                .unwrap_or(false),
        }
    }

    /// Parse and validate inbound bytes until cancelled, feeding
    /// `TransportEvent::Incoming` into the dispatcher.
    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match &self.inner.transport {
            LegTransport::Udp(t) => t.serve_loop(self.clone(), sender).await,
            LegTransport::Stream(p) => p.serve_loop(self.clone(), sender).await,
            LegTransport::Channel(c) => c.serve_loop(self.clone(), sender).await,
        }
    }

    /// Entry point for transport serve loops: stamp requests with
    /// `received`/`rport` and hand the packet to the dispatcher.
    pub(crate) fn ingress(&self, mut msg: SipMessage, from: Address, sender: &TransportSender) {
        if let SipMessage::Request(req) = &mut msg {
            if let Err(e) = Self::apply_received(req, from.socket_addr()) {
                self.note_parse_error();
                debug!("{} failed to update Via: {:?}", self, e);
                return;
            }
        }
        sender
            .send(TransportEvent::Incoming(msg, self.clone(), from))
            .ok();
    }
}

/// Destination a response should be sent back to, derived from its top
/// Via per RFC 3261: `received`/`rport` win over the sent-by values.
pub fn response_target(resp: &rsip::Response) -> Result<(Proto, rsip::HostWithPort)> {
    let typed = resp.via_header()?.typed()?;
    let mut host_with_port = typed.uri.host_with_port.clone();
    let mut proto = Proto::from_transport(&typed.transport).unwrap_or(Proto::Udp);

    for param in &typed.params {
        match param {
            Param::Received(received) => {
                if let Ok(ip) = received.value().parse::<IpAddr>() {
                    host_with_port.host = ip.into();
                }
            }
            Param::Transport(transport) => {
                if let Some(p) = Proto::from_transport(transport) {
                    proto = p;
                }
            }
            Param::Other(key, Some(value)) if key.value().eq_ignore_ascii_case("rport") => {
                if let Ok(port) = value.value().parse::<u16>() {
                    host_with_port.port = Some(port.into());
                }
            }
            _ => {}
        }
    }
    Ok((proto, host_with_port))
}

impl PartialEq for Leg {
    fn eq(&self, other: &Self) -> bool {
        self.inner.branch == other.inner.branch
    }
}

impl Eq for Leg {}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.inner.local, self.inner.branch)
    }
}

impl std::fmt::Debug for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
