//! The dispatcher routes SIP messages between legs and upper-layer
//! consumers: it resolves destinations, drives the retransmission queue
//! off the event loop and demultiplexes inbound traffic to the receiver.

pub mod queue;

pub use queue::{CancelKey, DeliveryCallback};

use crate::{
    eventloop::{EventLoop, TimerId},
    message::{self, Tid},
    resolver::{DnsBackend, DomainProxyTable, HickoryDns, Resolver},
    transport::{
        leg::response_target, Address, Leg, LegRegistry, LegSpec, TransportEvent,
        TransportReceiver, TransportSender,
    },
    Error, Result,
};
use queue::{retransmit_schedule, DeliveryQueue, QEntry, T1, T2, TIMEOUT_FACTOR};
use rsip::{Method, SipMessage};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::{Duration, Instant},
};
use tokio::{select, sync::mpsc::unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const QUEUE_EXPIRE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper-layer consumer of demultiplexed packets: an endpoint, a
/// registrar, a stateless proxy. A `Some` return means the packet was
/// handled (the value is a SIP status code for requests); `None` means
/// ignored.
pub trait Receiver: Send + Sync {
    fn receive(&self, msg: SipMessage, leg: &Leg, from: &Address) -> Option<u16>;
}

/// Per-delivery options for [`Dispatcher::deliver`].
#[derive(Default)]
pub struct DeliverOpts {
    /// Queue key; defaults to the packet's transaction id.
    pub id: Option<String>,
    /// Defaults to the packet's Call-ID.
    pub call_id: Option<String>,
    /// Invoked on terminal failure, or on completion for transports with
    /// write acknowledgement. Cancellation never invokes it.
    pub callback: Option<DeliveryCallback>,
    /// Skip leg selection.
    pub leg: Option<Leg>,
    /// Skip destination resolution.
    pub dst: Option<Address>,
    /// Overrides the dispatcher-wide default.
    pub do_retransmits: Option<bool>,
}

pub struct DispatcherBuilder {
    cancel_token: Option<CancellationToken>,
    legs: Vec<Leg>,
    outgoing_proxy: Option<Address>,
    domain_proxies: DomainProxyTable,
    do_retransmits: bool,
    dns: Option<Arc<dyn DnsBackend>>,
    t1: Duration,
    timer_interval: Option<Duration>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        DispatcherBuilder {
            cancel_token: None,
            legs: Vec::new(),
            outgoing_proxy: None,
            domain_proxies: DomainProxyTable::new(),
            do_retransmits: true,
            dns: None,
            t1: T1,
            timer_interval: None,
        }
    }

    pub fn with_cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    /// Install a leg at construction; more can be added later with
    /// [`Dispatcher::add_leg`].
    pub fn with_leg(&mut self, leg: Leg) -> &mut Self {
        self.legs.push(leg);
        self
    }

    /// Fallback destination used when URI resolution yields nothing
    /// else.
    pub fn with_outgoing_proxy(&mut self, proxy: Address) -> &mut Self {
        self.outgoing_proxy.replace(proxy);
        self
    }

    /// Domain override table consulted before DNS.
    pub fn with_domain_proxies(&mut self, table: DomainProxyTable) -> &mut Self {
        self.domain_proxies = table;
        self
    }

    /// Default retransmit behaviour for deliveries; stateless proxies
    /// turn this off.
    pub fn with_do_retransmits(&mut self, do_retransmits: bool) -> &mut Self {
        self.do_retransmits = do_retransmits;
        self
    }

    /// Replace the built-in DNS backend.
    pub fn with_dns(&mut self, dns: Arc<dyn DnsBackend>) -> &mut Self {
        self.dns.replace(dns);
        self
    }

    /// Retransmission base; tests shrink it to keep runtimes sane.
    pub fn with_t1(&mut self, t1: Duration) -> &mut Self {
        self.t1 = t1;
        self
    }

    pub fn with_timer_interval(&mut self, interval: Duration) -> &mut Self {
        self.timer_interval.replace(interval);
        self
    }

    pub fn build(&mut self) -> Result<Dispatcher> {
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let dns: Arc<dyn DnsBackend> = match self.dns.take() {
            Some(dns) => dns,
            None => Arc::new(HickoryDns::from_system_conf()?),
        };
        let resolver = Resolver::new(dns)
            .with_outgoing_proxy(self.outgoing_proxy.take())
            .with_domain_proxies(std::mem::take(&mut self.domain_proxies));

        let eventloop = EventLoop::new(self.timer_interval, cancel_token.child_token());
        let registry = LegRegistry::new(cancel_token.child_token());
        let (event_tx, event_rx) = unbounded_channel();

        let inner = Arc::new(DispatcherInner {
            eventloop,
            registry,
            resolver,
            queue: DeliveryQueue::new(),
            receiver: RwLock::new(None),
            do_retransmits: self.do_retransmits,
            t1: self.t1,
            cancel_token,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            dropped_responses: AtomicU64::new(0),
        });

        for leg in self.legs.drain(..) {
            inner.registry.add_leg(leg, inner.event_tx.clone());
        }

        let weak = Arc::downgrade(&inner);
        inner.eventloop.add_timer(
            QUEUE_EXPIRE_INTERVAL,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.queue_expire();
                }
            },
            Some(QUEUE_EXPIRE_INTERVAL),
        );

        Ok(Dispatcher { inner })
    }
}

pub(crate) struct DispatcherInner {
    eventloop: EventLoop,
    registry: LegRegistry,
    resolver: Resolver,
    queue: DeliveryQueue,
    receiver: RwLock<Option<Arc<dyn Receiver>>>,
    do_retransmits: bool,
    t1: Duration,
    cancel_token: CancellationToken,
    event_tx: TransportSender,
    event_rx: Mutex<Option<TransportReceiver>>,
    dropped_responses: AtomicU64,
}

pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

/// Non-owning handle held by upper layers (registrar, endpoints) that
/// need to deliver packets or arm timers without keeping the dispatcher
/// alive.
#[derive(Clone)]
pub struct DispatcherHandle {
    inner: Weak<DispatcherInner>,
}

impl Dispatcher {
    /// Serve inbound events and timers until cancelled.
    pub async fn serve(&self) {
        let inner = self.inner.clone();
        select! {
            _ = self.inner.cancel_token.cancelled() => {
                info!("dispatcher cancelled");
            }
            _ = self.inner.eventloop.run() => {}
            _ = inner.process_events() => {}
        }
        info!("dispatcher shutdown");
    }

    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn set_receiver(&self, receiver: Arc<dyn Receiver>) {
        *self.inner.receiver.write().unwrap() = Some(receiver);
    }

    pub fn add_leg(&self, leg: Leg) {
        self.inner
            .registry
            .add_leg(leg, self.inner.event_tx.clone());
    }

    /// Remove a leg; deliveries in flight on it fail with
    /// [`Error::LegRemoved`].
    pub fn remove_leg(&self, leg: &Leg) -> bool {
        let removed = self.inner.registry.remove_leg(leg);
        if removed {
            self.inner.fail_leg(leg);
        }
        removed
    }

    pub fn get_legs(&self, spec: &LegSpec) -> Vec<Leg> {
        self.inner.registry.get_legs(spec)
    }

    pub fn add_timer(
        &self,
        after: Duration,
        cb: impl FnMut() + Send + 'static,
        repeat: Option<Duration>,
    ) -> TimerId {
        self.inner.eventloop.add_timer(after, cb, repeat)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.eventloop.cancel_timer(id)
    }

    pub fn looptime(&self) -> Instant {
        self.inner.eventloop.looptime()
    }

    /// Queue a packet for delivery. Never blocks: resolution happens on
    /// a spawned task and failures surface through `opts.callback`.
    pub fn deliver(&self, msg: SipMessage, opts: DeliverOpts) {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.do_deliver(msg, opts).await });
    }

    /// Drop queued deliveries without invoking their callbacks. Returns
    /// true iff at least one entry was removed.
    pub fn cancel_delivery(&self, key: &CancelKey) -> bool {
        self.inner.cancel_delivery(key)
    }

    /// Inject an inbound packet as if it had arrived on `leg`. Normally
    /// driven by leg serve loops through the event channel.
    pub fn receive(&self, msg: SipMessage, leg: &Leg, from: &Address) {
        self.inner.receive(msg, leg, from)
    }

    /// Responses dropped because their top Via matched no leg.
    pub fn dropped_responses(&self) -> u64 {
        self.inner.dropped_responses.load(Ordering::Relaxed)
    }

    pub fn pending_deliveries(&self) -> usize {
        self.inner.queue.len()
    }
}

impl DispatcherHandle {
    pub fn deliver(&self, msg: SipMessage, opts: DeliverOpts) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                tokio::spawn(async move { inner.do_deliver(msg, opts).await });
                true
            }
            None => false,
        }
    }

    pub fn add_timer(
        &self,
        after: Duration,
        cb: impl FnMut() + Send + 'static,
        repeat: Option<Duration>,
    ) -> Option<TimerId> {
        self.inner
            .upgrade()
            .map(|inner| inner.eventloop.add_timer(after, cb, repeat))
    }

    pub fn cancel_delivery(&self, key: &CancelKey) -> bool {
        self.inner
            .upgrade()
            .map(|inner| inner.cancel_delivery(key))
            .unwrap_or(false)
    }
}

impl DispatcherInner {
    async fn process_events(self: Arc<Self>) {
        let event_rx = self.event_rx.lock().unwrap().take();
        let Some(mut event_rx) = event_rx else {
            warn!("dispatcher served twice");
            return;
        };
        while let Some(event) = event_rx.recv().await {
            match event {
                TransportEvent::Incoming(msg, leg, from) => self.receive(msg, &leg, &from),
                TransportEvent::Closed(leg) => self.fail_leg(&leg),
            }
        }
    }

    /// Demultiplex one inbound packet. Responses must carry one of our
    /// Via branches; a match acknowledges the pending delivery.
    fn receive(&self, msg: SipMessage, leg: &Leg, from: &Address) {
        match &msg {
            SipMessage::Response(_) => {
                if !leg.check_via(&msg) {
                    self.dropped_responses.fetch_add(1, Ordering::Relaxed);
                    warn!("dropping response with foreign Via branch on {}", leg);
                    return;
                }
                if let Ok(tid) = Tid::call_seq(&msg) {
                    if self.cancel_delivery(&CancelKey::Id(tid.to_string())) {
                        debug!("delivery {} acknowledged by response", tid);
                    }
                }
                self.hand_to_receiver(msg, leg, from);
            }
            SipMessage::Request(_) => self.hand_to_receiver(msg, leg, from),
        }
    }

    fn hand_to_receiver(&self, msg: SipMessage, leg: &Leg, from: &Address) {
        let receiver = self.receiver.read().unwrap().clone();
        match receiver {
            Some(receiver) => match receiver.receive(msg, leg, from) {
                Some(code) => trace!("receiver handled packet: {}", code),
                None => debug!("receiver ignored packet from {}", from),
            },
            None => warn!("no receiver installed, dropping packet from {}", from),
        }
    }

    fn cancel_delivery(&self, key: &CancelKey) -> bool {
        let (removed, timers) = self.queue.cancel(key);
        for timer in timers {
            self.eventloop.cancel_timer(timer);
        }
        removed > 0
    }

    fn fail_leg(&self, leg: &Leg) {
        for mut entry in self.queue.remove_by_leg(leg) {
            if let Some(timer) = entry.timer.take() {
                self.eventloop.cancel_timer(timer);
            }
            entry.invoke_callback(Err(Error::LegRemoved(leg.local().clone())));
        }
    }

    async fn do_deliver(self: Arc<Self>, msg: SipMessage, mut opts: DeliverOpts) {
        let callback = opts.callback.take();
        match self.prepare_delivery(msg, opts).await {
            Ok(mut entry) => {
                entry.callback = callback;
                let id = entry.id.clone();
                trace!("queued delivery {} -> {} via {}", id, entry.dst, entry.leg);
                self.queue.insert(entry);
                self.arm_next(&id);
            }
            Err(e) => match callback {
                Some(mut callback) => callback(Err(e)),
                None => warn!("delivery failed before queueing: {}", e),
            },
        }
    }

    async fn prepare_delivery(&self, msg: SipMessage, opts: DeliverOpts) -> Result<QEntry> {
        let call_id = match opts.call_id {
            Some(call_id) => call_id,
            None => message::call_id_of(&msg)?,
        };
        let id = match opts.id {
            Some(id) => id,
            None => Tid::call_seq(&msg)?.to_string(),
        };
        let cseq_method = message::cseq_method_of(&msg)?;
        let do_retransmits = opts.do_retransmits.unwrap_or(self.do_retransmits);
        let (leg, dst) = self.resolve_destination(&msg, opts.leg, opts.dst).await?;

        let now = Instant::now();
        let unreliable = !dst.proto.is_reliable();
        // Requests retransmit per schedule; so do final responses to
        // INVITE, which wait for the ACK. Anything else is one shot.
        let track = unreliable
            && do_retransmits
            && match &msg {
                SipMessage::Request(_) => true,
                SipMessage::Response(_) => cseq_method == Method::Invite,
            };
        let schedule = if track {
            retransmit_schedule(now, self.t1, T2)
        } else {
            vec![now]
        };

        Ok(QEntry {
            id,
            call_id,
            msg,
            dst,
            leg,
            schedule,
            next_idx: 0,
            final_deadline: now + self.t1 * TIMEOUT_FACTOR,
            timer: None,
            callback: None,
            do_retransmits,
            cseq_method,
            track,
            sending: false,
        })
    }

    async fn resolve_destination(
        &self,
        msg: &SipMessage,
        leg: Option<Leg>,
        dst: Option<Address>,
    ) -> Result<(Leg, Address)> {
        if let (Some(leg), Some(dst)) = (&leg, &dst) {
            return Ok((leg.clone(), dst.clone()));
        }

        let legs = self.registry.all();
        let allowed = leg.as_ref().map(std::slice::from_ref);

        if let Some(dst) = dst {
            let pool = allowed.unwrap_or(&legs);
            let leg = pool
                .iter()
                .find(|l| l.can_deliver_to(&dst))
                .cloned()
                .ok_or_else(|| Error::HostUnreachable(dst.to_string()))?;
            return Ok((leg, dst));
        }

        match msg {
            SipMessage::Request(req) => {
                let mut candidates = self
                    .resolver
                    .resolve_uri(&req.uri, None, allowed, &legs)
                    .await?;
                let (addr, leg) = candidates.remove(0);
                Ok((leg, addr))
            }
            SipMessage::Response(resp) => {
                let (proto, host_with_port) = response_target(resp)?;
                let port = host_with_port
                    .port
                    .as_ref()
                    .map(|p| *p.value())
                    .unwrap_or_else(|| proto.default_port());
                let ips = match &host_with_port.host {
                    rsip::host_with_port::Host::IpAddr(ip) => vec![*ip],
                    rsip::host_with_port::Host::Domain(domain) => {
                        self.resolver.resolve_host(&domain.to_string()).await?
                    }
                };
                let ip = ips
                    .first()
                    .ok_or_else(|| Error::HostUnreachable(host_with_port.to_string()))?;
                let addr = Address::new(proto, *ip, port);
                let pool = allowed.unwrap_or(&legs);
                let leg = pool
                    .iter()
                    .find(|l| l.can_deliver_to(&addr))
                    .cloned()
                    .ok_or_else(|| Error::HostUnreachable(addr.to_string()))?;
                Ok((leg, addr))
            }
        }
    }

    /// Arm the timer for the entry's next scheduled transmission, or the
    /// transaction timeout once the schedule is exhausted.
    fn arm_next(self: &Arc<Self>, id: &str) {
        let info = self.queue.with_entry(id, |entry| {
            entry.sending = false;
            (
                entry.schedule.get(entry.next_idx).copied(),
                entry.final_deadline,
            )
        });
        let Some((next_at, final_deadline)) = info else {
            return;
        };

        let weak = Arc::downgrade(self);
        let id_owned = id.to_string();
        let timer = match next_at {
            Some(at) => self.eventloop.add_timer_at(
                at,
                move || {
                    if let Some(inner) = weak.upgrade() {
                        let id = id_owned.clone();
                        tokio::spawn(async move { inner.transmit(id).await });
                    }
                },
                None,
            ),
            None => self.eventloop.add_timer_at(
                final_deadline,
                move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_timeout(&id_owned);
                    }
                },
                None,
            ),
        };

        let still_queued = self
            .queue
            .with_entry(id, |entry| entry.timer = Some(timer))
            .is_some();
        if !still_queued {
            self.eventloop.cancel_timer(timer);
        }
    }

    async fn transmit(self: Arc<Self>, id: String) {
        let ctx = self.queue.with_entry(&id, |entry| {
            entry.timer = None;
            entry.sending = true;
            entry.next_idx += 1;
            (
                entry.msg.clone(),
                entry.leg.clone(),
                entry.dst.clone(),
                entry.track,
            )
        });
        let Some((msg, leg, dst, track)) = ctx else {
            return;
        };
        let reliable = dst.proto.is_reliable();

        match leg.deliver(&msg, &dst).await {
            Ok(()) => {
                if reliable || !track {
                    // Write completion is the acknowledgement.
                    if let Some(mut entry) = self.queue.remove(&id) {
                        entry.invoke_callback(Ok(()));
                    }
                } else {
                    self.arm_next(&id);
                }
            }
            Err(e) if reliable || !track || e.is_fatal_write() => {
                warn!("delivery {} failed: {}", id, e);
                if let Some(mut entry) = self.queue.remove(&id) {
                    entry.invoke_callback(Err(e));
                }
            }
            Err(e) => {
                // Transient write error on an unreliable transport: the
                // schedule keeps running.
                warn!("transmission of {} failed, will retransmit: {}", id, e);
                self.arm_next(&id);
            }
        }
    }

    fn on_timeout(&self, id: &str) {
        if let Some(mut entry) = self.queue.remove(id) {
            debug!("delivery {} exhausted its schedule", id);
            entry.invoke_callback(Err(Error::DeliveryTimeout(id.to_string())));
        }
    }

    /// Defensive sweep behind the per-entry timers: reaps entries past
    /// their final deadline and re-arms any that lost their timer.
    fn queue_expire(self: &Arc<Self>) {
        let now = self.eventloop.looptime();
        let (expired, unarmed) = self.queue.sweep(now);
        for mut entry in expired {
            if let Some(timer) = entry.timer.take() {
                self.eventloop.cancel_timer(timer);
            }
            debug!("queue sweep expired delivery {}", entry.id);
            entry.invoke_callback(Err(Error::DeliveryTimeout(entry.id.clone())));
        }
        for id in unarmed {
            self.arm_next(&id);
        }
    }
}

#[cfg(test)]
mod tests;
