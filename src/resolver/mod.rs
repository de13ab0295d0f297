//! URI-to-destination resolution: a partial RFC 3263 walk plus the
//! pre-bound proxy and domain override tables consulted before DNS.

pub mod dns;
pub use dns::{DnsBackend, DnsQuery, DnsRecord, HickoryDns, StaticDns};

use crate::{
    transport::{Address, Leg, Proto},
    Error, Result,
};
use std::{net::IpAddr, sync::Arc};
use tracing::{debug, warn};

/// Ordered domain-to-proxy override table. Patterns are an exact domain,
/// a `*.suffix` wildcard, or the catch-all `*`; lookup prefers exact,
/// then the longest matching suffix, then the catch-all.
#[derive(Clone, Default)]
pub struct DomainProxyTable {
    entries: Vec<(String, Address)>,
}

impl DomainProxyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pattern: impl Into<String>, target: Address) {
        self.entries.push((pattern.into(), target));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, domain: &str) -> Option<&Address> {
        let domain = domain.to_ascii_lowercase();

        if let Some((_, target)) = self
            .entries
            .iter()
            .find(|(pattern, _)| pattern.eq_ignore_ascii_case(&domain))
        {
            return Some(target);
        }

        let mut best: Option<(&str, &Address)> = None;
        for (pattern, target) in &self.entries {
            if let Some(suffix) = pattern.strip_prefix('*') {
                if suffix.starts_with('.')
                    && domain.ends_with(&suffix.to_ascii_lowercase())
                    && best.map(|(s, _)| suffix.len() > s.len()).unwrap_or(true)
                {
                    best = Some((suffix, target));
                }
            }
        }
        if let Some((_, target)) = best {
            return Some(target);
        }

        self.entries
            .iter()
            .find(|(pattern, _)| pattern == "*")
            .map(|(_, target)| target)
    }
}

pub struct Resolver {
    dns: Arc<dyn DnsBackend>,
    outgoing_proxy: Option<Address>,
    domain_proxies: DomainProxyTable,
}

impl Resolver {
    pub fn new(dns: Arc<dyn DnsBackend>) -> Self {
        Resolver {
            dns,
            outgoing_proxy: None,
            domain_proxies: DomainProxyTable::new(),
        }
    }

    pub fn with_outgoing_proxy(mut self, proxy: Option<Address>) -> Self {
        self.outgoing_proxy = proxy;
        self
    }

    pub fn with_domain_proxies(mut self, table: DomainProxyTable) -> Self {
        self.domain_proxies = table;
        self
    }

    /// Destination candidates for `uri`, each paired with the first leg
    /// willing to deliver there. Entries with no usable leg are dropped;
    /// an empty result is a hard resolution failure.
    pub async fn resolve_uri(
        &self,
        uri: &rsip::Uri,
        allowed_protos: Option<&[Proto]>,
        allowed_legs: Option<&[Leg]>,
        legs: &[Leg],
    ) -> Result<Vec<(Address, Leg)>> {
        let addrs = self.resolve_addrs(uri, allowed_protos).await?;

        let pool: &[Leg] = allowed_legs.unwrap_or(legs);
        let mut out = Vec::with_capacity(addrs.len());
        for addr in addrs {
            match pool.iter().find(|leg| leg.can_deliver_to(&addr)) {
                Some(leg) => out.push((addr, leg.clone())),
                None => debug!("no leg can deliver to {}", addr),
            }
        }
        if out.is_empty() {
            return Err(Error::HostUnreachable(uri.to_string()));
        }
        Ok(out)
    }

    async fn resolve_addrs(
        &self,
        uri: &rsip::Uri,
        allowed_protos: Option<&[Proto]>,
    ) -> Result<Vec<Address>> {
        let domain = match &uri.host_with_port.host {
            rsip::host_with_port::Host::Domain(domain) => domain.to_string(),
            rsip::host_with_port::Host::IpAddr(ip) => ip.to_string(),
        };
        let explicit_port = uri.host_with_port.port.as_ref().map(|p| *p.value());
        let protos = self.allowed_protos(uri, allowed_protos);

        // Domain overrides beat the pre-bound proxy, which beats DNS.
        if let Some(target) = self.domain_proxies.lookup(&domain) {
            debug!("domain proxy override for {}: {}", domain, target);
            return Ok(vec![target.clone()]);
        }
        if let Some(proxy) = &self.outgoing_proxy {
            debug!("using outgoing proxy for {}: {}", domain, proxy);
            return Ok(vec![proxy.clone()]);
        }

        // IP literal: no DNS involved.
        if let Ok(ip) = domain.parse::<IpAddr>() {
            let proto = protos[0];
            return Ok(vec![Address::new(
                proto,
                ip,
                explicit_port.unwrap_or_else(|| proto.default_port()),
            )]);
        }

        // Partial RFC 3263: SRV per allowed protocol unless the URI pins
        // a port, then address records of the SRV targets; plain A/AAAA
        // of the domain as the fallback. NAPTR is deliberately skipped.
        let mut out = Vec::new();
        if explicit_port.is_none() {
            for proto in &protos {
                let srv_name = match proto {
                    Proto::Udp => format!("_sip._udp.{}", domain),
                    Proto::Tcp => format!("_sip._tcp.{}", domain),
                    Proto::Tls => format!("_sips._tcp.{}", domain),
                };
                let mut records = match self.dns.query(DnsQuery::Srv(srv_name.clone())).await {
                    Ok(records) => records,
                    Err(e) => {
                        warn!("SRV query {} failed: {}", srv_name, e);
                        continue;
                    }
                };
                records.sort_by(|a, b| match (a, b) {
                    (
                        DnsRecord::Srv {
                            priority: pa,
                            weight: wa,
                            ..
                        },
                        DnsRecord::Srv {
                            priority: pb,
                            weight: wb,
                            ..
                        },
                    ) => pa.cmp(pb).then(wb.cmp(wa)),
                    _ => std::cmp::Ordering::Equal,
                });
                for record in records {
                    let DnsRecord::Srv { target, port, .. } = record else {
                        continue;
                    };
                    for ip in self.resolve_host(&target).await? {
                        out.push(
                            Address::new(*proto, ip, port).with_host(target.clone()),
                        );
                    }
                }
            }
        }

        if out.is_empty() {
            let ips = self.resolve_host(&domain).await?;
            for proto in &protos {
                let port = explicit_port.unwrap_or_else(|| proto.default_port());
                for ip in &ips {
                    out.push(Address::new(*proto, *ip, port).with_host(domain.clone()));
                }
            }
        }

        if out.is_empty() {
            return Err(Error::HostUnreachable(uri.to_string()));
        }
        Ok(out)
    }

    /// A records first, then AAAA. Targets that are already IP literals
    /// skip the query.
    pub async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let mut out = Vec::new();
        for record in self.dns.query(DnsQuery::A(host.to_string())).await? {
            if let DnsRecord::A(ip) = record {
                out.push(IpAddr::V4(ip));
            }
        }
        for record in self.dns.query(DnsQuery::Aaaa(host.to_string())).await? {
            if let DnsRecord::Aaaa(ip) = record {
                out.push(IpAddr::V6(ip));
            }
        }
        Ok(out)
    }

    fn allowed_protos(&self, uri: &rsip::Uri, allowed: Option<&[Proto]>) -> Vec<Proto> {
        if let Some(protos) = allowed {
            if !protos.is_empty() {
                return protos.to_vec();
            }
        }
        if uri.scheme == Some(rsip::Scheme::Sips) {
            return vec![Proto::Tls];
        }
        for param in &uri.params {
            if let rsip::Param::Transport(transport) = param {
                if let Some(proto) = Proto::from_transport(transport) {
                    return vec![proto];
                }
            }
        }
        vec![Proto::Udp, Proto::Tcp]
    }
}
