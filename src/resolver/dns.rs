//! Pluggable DNS backends. Production resolution goes through
//! hickory-dns; tests install a `StaticDns` with canned records.

use crate::{Error, Result};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr},
    sync::Mutex,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DnsQuery {
    Srv(String),
    A(String),
    Aaaa(String),
}

impl DnsQuery {
    pub fn name(&self) -> &str {
        match self {
            DnsQuery::Srv(name) | DnsQuery::A(name) | DnsQuery::Aaaa(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsRecord {
    Srv {
        priority: u16,
        weight: u16,
        target: String,
        port: u16,
    },
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
}

#[async_trait]
pub trait DnsBackend: Send + Sync {
    /// Missing names resolve to an empty record set; `Err` is reserved
    /// for backend failures.
    async fn query(&self, query: DnsQuery) -> Result<Vec<DnsRecord>>;
}

/// System resolver backed by hickory-dns.
pub struct HickoryDns {
    resolver: hickory_resolver::TokioAsyncResolver,
}

impl HickoryDns {
    pub fn from_system_conf() -> Result<Self> {
        let resolver = hickory_resolver::AsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::Config(format!("failed to load DNS configuration: {}", e)))?;
        Ok(HickoryDns { resolver })
    }
}

fn empty_on_missing(e: hickory_resolver::error::ResolveError, what: &str) -> Result<Vec<DnsRecord>> {
    match e.kind() {
        hickory_resolver::error::ResolveErrorKind::NoRecordsFound { .. } => Ok(vec![]),
        _ => Err(Error::Resolve(format!("{}: {}", what, e))),
    }
}

#[async_trait]
impl DnsBackend for HickoryDns {
    async fn query(&self, query: DnsQuery) -> Result<Vec<DnsRecord>> {
        match &query {
            DnsQuery::Srv(name) => match self.resolver.srv_lookup(name.as_str()).await {
                Ok(lookup) => Ok(lookup
                    .iter()
                    .map(|srv| DnsRecord::Srv {
                        priority: srv.priority(),
                        weight: srv.weight(),
                        target: srv.target().to_utf8().trim_end_matches('.').to_string(),
                        port: srv.port(),
                    })
                    .collect()),
                Err(e) => empty_on_missing(e, name),
            },
            DnsQuery::A(name) => match self.resolver.ipv4_lookup(name.as_str()).await {
                Ok(lookup) => Ok(lookup.iter().map(|a| DnsRecord::A(a.0)).collect()),
                Err(e) => empty_on_missing(e, name),
            },
            DnsQuery::Aaaa(name) => match self.resolver.ipv6_lookup(name.as_str()).await {
                Ok(lookup) => Ok(lookup.iter().map(|aaaa| DnsRecord::Aaaa(aaaa.0)).collect()),
                Err(e) => empty_on_missing(e, name),
            },
        }
    }
}

/// Fixed record set for tests and static deployments.
#[derive(Default)]
pub struct StaticDns {
    records: Mutex<HashMap<DnsQuery, Vec<DnsRecord>>>,
}

impl StaticDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_srv(&self, name: &str, priority: u16, weight: u16, target: &str, port: u16) {
        self.records
            .lock()
            .unwrap()
            .entry(DnsQuery::Srv(name.to_string()))
            .or_default()
            .push(DnsRecord::Srv {
                priority,
                weight,
                target: target.to_string(),
                port,
            });
    }

    pub fn add_a(&self, name: &str, addr: Ipv4Addr) {
        self.records
            .lock()
            .unwrap()
            .entry(DnsQuery::A(name.to_string()))
            .or_default()
            .push(DnsRecord::A(addr));
    }

    pub fn add_aaaa(&self, name: &str, addr: Ipv6Addr) {
        self.records
            .lock()
            .unwrap()
            .entry(DnsQuery::Aaaa(name.to_string()))
            .or_default()
            .push(DnsRecord::Aaaa(addr));
    }
}

#[async_trait]
impl DnsBackend for StaticDns {
    async fn query(&self, query: DnsQuery) -> Result<Vec<DnsRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&query)
            .cloned()
            .unwrap_or_default())
    }
}
