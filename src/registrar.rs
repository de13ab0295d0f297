//! Minimal registrar: the example upper-layer consumer that exercises
//! the dispatcher. Keeps an in-memory AOR-to-contacts store with
//! absolute expiries and answers REGISTER on the leg it arrived on.

use crate::{
    dispatcher::{DeliverOpts, DispatcherHandle, Receiver},
    message::make_response,
    rsip_ext::extract_uri,
    transport::{Address, Leg},
    Result,
};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Method, Param, SipMessage, StatusCode,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct RegistrarConfig {
    /// Expiry requests below this are refused with 423.
    pub min_expires: u32,
    /// Requested expiries are capped here; also the default when the
    /// request names none.
    pub max_expires: u32,
    /// Accepted AOR domains: exact names, `.suffix` entries, or `*`.
    /// `None` accepts everything.
    pub domains: Option<Vec<String>>,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        RegistrarConfig {
            min_expires: 60,
            max_expires: 3600,
            domains: None,
        }
    }
}

type ContactMap = HashMap<String, Instant>;

struct RegistrarInner {
    dispatcher: DispatcherHandle,
    config: RegistrarConfig,
    store: Mutex<HashMap<String, ContactMap>>,
    // Deadline of the pending sweep timer, if any. A new sweep is armed
    // only when it would fire earlier.
    pending_sweep: Mutex<Option<Instant>>,
}

#[derive(Clone)]
pub struct Registrar {
    inner: Arc<RegistrarInner>,
}

enum ContactAction {
    /// `Contact: *` with `Expires: 0`: drop every binding of the AOR.
    Flush,
    /// Bind or refresh `(contact URI, expiry seconds)`; zero removes.
    Update(Vec<(String, u32)>),
    /// No Contact header: a query for the current bindings.
    Query,
}

impl Registrar {
    pub fn new(dispatcher: DispatcherHandle, config: RegistrarConfig) -> Self {
        Registrar {
            inner: Arc::new(RegistrarInner {
                dispatcher,
                config,
                store: Mutex::new(HashMap::new()),
                pending_sweep: Mutex::new(None),
            }),
        }
    }

    /// Registered contact URIs for an AOR, unexpired only.
    pub fn contacts(&self, aor: &str) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .store
            .lock()
            .unwrap()
            .get(aor)
            .map(|contacts| {
                contacts
                    .iter()
                    .filter(|(_, expiry)| **expiry > now)
                    .map(|(uri, _)| uri.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.lock().unwrap().is_empty()
    }

    /// Drop expired contacts and empty AORs, then make sure a sweep is
    /// armed for the earliest remaining expiry.
    pub fn expire(&self) {
        self.inner.expire();
    }
}

impl Receiver for Registrar {
    fn receive(&self, msg: SipMessage, leg: &Leg, from: &Address) -> Option<u16> {
        let SipMessage::Request(req) = msg else {
            return None;
        };
        if req.method != Method::Register {
            return None;
        }
        Some(self.inner.on_register(&req, leg, from))
    }
}

impl RegistrarInner {
    fn on_register(self: &Arc<Self>, req: &rsip::Request, leg: &Leg, from: &Address) -> u16 {
        let aor = match Self::aor_of(req) {
            Ok(aor) => aor,
            Err(e) => {
                debug!("unparseable REGISTER from {}: {}", from, e);
                return self.respond(req, StatusCode::BadRequest, vec![], leg, from);
            }
        };
        if !self.domain_allowed(&aor) {
            debug!("REGISTER for foreign domain refused: {}", aor);
            return self.respond(req, StatusCode::Forbidden, vec![], leg, from);
        }

        let action = match self.contact_action(req) {
            Ok(action) => action,
            Err(code) => return self.respond(req, code, vec![], leg, from),
        };

        let now = Instant::now();
        match action {
            ContactAction::Flush => {
                info!("unregistered all contacts of {}", aor);
                self.store.lock().unwrap().remove(&aor);
            }
            ContactAction::Update(updates) => {
                let mut store = self.store.lock().unwrap();
                let contacts = store.entry(aor.clone()).or_default();
                for (uri, expires) in updates {
                    if expires == 0 {
                        info!("unregistered {} -> {}", aor, uri);
                        contacts.remove(&uri);
                    } else {
                        info!("registered {} -> {} for {}s", aor, uri, expires);
                        contacts.insert(uri, now + Duration::from_secs(expires.into()));
                    }
                }
                if contacts.is_empty() {
                    store.remove(&aor);
                }
            }
            ContactAction::Query => {}
        }

        self.expire();

        let mut extra = Vec::new();
        if let Some(contacts) = self.store.lock().unwrap().get(&aor) {
            for (uri, expiry) in contacts {
                let remaining = expiry.saturating_duration_since(now);
                let remaining = (remaining.as_millis() + 500) / 1000;
                match extract_uri(uri) {
                    Ok(uri) => {
                        let contact = rsip::typed::Contact {
                            display_name: None,
                            uri,
                            params: vec![Param::Expires(remaining.to_string().into())],
                        };
                        extra.push(contact.into());
                    }
                    Err(e) => warn!("stored contact no longer parses: {} ({})", uri, e),
                }
            }
        }
        self.respond(req, StatusCode::OK, extra, leg, from)
    }

    /// Validate every Contact before the store is touched: a single
    /// too-brief interval refuses the whole request.
    fn contact_action(&self, req: &rsip::Request) -> std::result::Result<ContactAction, StatusCode> {
        let header_expires = req
            .expires_header()
            .and_then(|expires| expires.value().parse::<u32>().ok());

        let contacts: Vec<&rsip::headers::Contact> = req
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::Contact(contact) => Some(contact),
                _ => None,
            })
            .collect();

        if contacts.is_empty() {
            return Ok(ContactAction::Query);
        }

        if contacts.iter().any(|c| c.value().trim() == "*") {
            // The wildcard stands alone and requires Expires: 0.
            if contacts.len() > 1 || header_expires != Some(0) {
                return Err(StatusCode::BadRequest);
            }
            return Ok(ContactAction::Flush);
        }

        let mut updates = Vec::with_capacity(contacts.len());
        for contact in contacts {
            let (uri, contact_expires) = match Self::parse_contact(contact) {
                Ok(parsed) => parsed,
                Err(_) => return Err(StatusCode::BadRequest),
            };
            let expires = contact_expires
                .or(header_expires)
                .unwrap_or(self.config.max_expires)
                .min(self.config.max_expires);
            if expires != 0 && expires < self.config.min_expires {
                return Err(StatusCode::IntervalTooBrief);
            }
            updates.push((uri, expires));
        }
        Ok(ContactAction::Update(updates))
    }

    fn parse_contact(contact: &rsip::headers::Contact) -> Result<(String, Option<u32>)> {
        match contact.typed() {
            Ok(typed) => {
                let expires = typed.expires().and_then(|expires| expires.seconds().ok());
                Ok((typed.uri.to_string(), expires))
            }
            Err(_) => {
                let uri = extract_uri(contact.value())?;
                Ok((uri.to_string(), None))
            }
        }
    }

    fn aor_of(req: &rsip::Request) -> Result<String> {
        let uri = req.from_header()?.uri()?;
        let user = uri.user().unwrap_or_default();
        let host = match &uri.host_with_port.host {
            rsip::host_with_port::Host::Domain(domain) => domain.to_string(),
            rsip::host_with_port::Host::IpAddr(ip) => ip.to_string(),
        };
        Ok(format!("{}@{}", user, host).to_ascii_lowercase())
    }

    fn domain_allowed(&self, aor: &str) -> bool {
        let Some(domains) = &self.config.domains else {
            return true;
        };
        let domain = aor.rsplit('@').next().unwrap_or_default();
        domains.iter().any(|entry| {
            entry == "*"
                || entry.eq_ignore_ascii_case(domain)
                || (entry.starts_with('.')
                    && domain.to_ascii_lowercase().ends_with(&entry.to_ascii_lowercase()))
        })
    }

    fn respond(
        &self,
        req: &rsip::Request,
        status_code: StatusCode,
        mut extra: Vec<Header>,
        leg: &Leg,
        from: &Address,
    ) -> u16 {
        let code = status_code.code();
        if status_code == StatusCode::IntervalTooBrief {
            extra.push(Header::MinExpires(
                self.config.min_expires.to_string().into(),
            ));
        }
        let resp = make_response(req, status_code, extra, None);
        let delivered = self.dispatcher.deliver(
            SipMessage::Response(resp),
            DeliverOpts {
                leg: Some(leg.clone()),
                dst: Some(from.clone()),
                ..Default::default()
            },
        );
        if !delivered {
            warn!("dispatcher gone, dropping REGISTER response");
        }
        code
    }

    fn expire(self: &Arc<Self>) {
        let now = Instant::now();
        let earliest = {
            let mut store = self.store.lock().unwrap();
            for contacts in store.values_mut() {
                contacts.retain(|uri, expiry| {
                    let keep = *expiry > now;
                    if !keep {
                        debug!("contact expired: {}", uri);
                    }
                    keep
                });
            }
            store.retain(|_, contacts| !contacts.is_empty());
            store
                .values()
                .flat_map(|contacts| contacts.values())
                .min()
                .copied()
        };

        let Some(earliest) = earliest else {
            return;
        };

        // Re-arm only if no earlier sweep is already pending.
        let mut pending = self.pending_sweep.lock().unwrap();
        let already_covered = (*pending)
            .map(|at| at <= earliest && at > now)
            .unwrap_or(false);
        if already_covered {
            return;
        }
        let weak: Weak<RegistrarInner> = Arc::downgrade(self);
        let armed = self.dispatcher.add_timer(
            earliest.saturating_duration_since(now),
            move || {
                if let Some(inner) = weak.upgrade() {
                    *inner.pending_sweep.lock().unwrap() = None;
                    inner.expire();
                }
            },
            None,
        );
        if armed.is_some() {
            *pending = Some(earliest);
        }
    }
}
