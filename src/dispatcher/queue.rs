//! Per-packet delivery state and the RFC 3261 retransmission schedule.

use crate::{
    eventloop::TimerId,
    transport::{Address, Leg},
    Result,
};
use rsip::{Method, SipMessage};
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// RFC 3261 T1: round-trip estimate and retransmission base.
pub const T1: Duration = Duration::from_millis(500);
/// RFC 3261 T2: cap on the retransmission interval.
pub const T2: Duration = Duration::from_secs(4);
/// The transaction is abandoned 64*T1 after the first transmission.
pub const TIMEOUT_FACTOR: u32 = 64;

pub type DeliveryCallback = Box<dyn FnMut(Result<()>) + Send>;

/// Absolute transmission deadlines for one unreliable delivery: t=0,
/// then gaps doubling from T1 up to T2, all strictly inside the 64*T1
/// transaction window.
pub fn retransmit_schedule(now: Instant, t1: Duration, t2: Duration) -> Vec<Instant> {
    let total = t1 * TIMEOUT_FACTOR;
    let mut out = vec![now];
    let mut gap = t1;
    let mut elapsed = t1;
    while elapsed < total {
        out.push(now + elapsed);
        gap = (gap * 2).min(t2);
        elapsed += gap;
    }
    out
}

/// One queued delivery with its retransmission state.
pub struct QEntry {
    pub id: String,
    pub call_id: String,
    pub msg: SipMessage,
    pub dst: Address,
    pub leg: Leg,
    /// Absolute transmit deadlines; `schedule[0]` is the initial send.
    pub schedule: Vec<Instant>,
    pub next_idx: usize,
    pub final_deadline: Instant,
    pub timer: Option<TimerId>,
    pub callback: Option<DeliveryCallback>,
    pub do_retransmits: bool,
    pub cseq_method: Method,
    /// The transaction window stays open after the last transmission,
    /// waiting for a response (or the timeout timer).
    pub track: bool,
    /// A transmission is in flight; keeps the sweep from double-arming.
    pub sending: bool,
}

impl QEntry {
    pub fn invoke_callback(&mut self, result: Result<()>) {
        if let Some(callback) = self.callback.as_mut() {
            callback(result);
        }
    }
}

/// Selector for `cancel_delivery`.
#[derive(Debug, Clone)]
pub enum CancelKey {
    /// One entry, by its id (the packet tid unless overridden).
    Id(String),
    /// Every entry belonging to one call.
    CallId(String),
}

#[derive(Default)]
pub struct DeliveryQueue {
    entries: Mutex<HashMap<String, QEntry>>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: QEntry) {
        self.entries.lock().unwrap().insert(entry.id.clone(), entry);
    }

    pub fn remove(&self, id: &str) -> Option<QEntry> {
        self.entries.lock().unwrap().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove matching entries without touching their callbacks. Returns
    /// the removal count and the pending timer ids to disarm.
    pub fn cancel(&self, key: &CancelKey) -> (usize, Vec<TimerId>) {
        let mut entries = self.entries.lock().unwrap();
        let ids: Vec<String> = match key {
            CancelKey::Id(id) => {
                if entries.contains_key(id) {
                    vec![id.clone()]
                } else {
                    vec![]
                }
            }
            CancelKey::CallId(call_id) => entries
                .values()
                .filter(|e| &e.call_id == call_id)
                .map(|e| e.id.clone())
                .collect(),
        };
        let mut timers = Vec::new();
        let mut removed = 0;
        for id in ids {
            if let Some(entry) = entries.remove(&id) {
                removed += 1;
                timers.extend(entry.timer);
            }
        }
        (removed, timers)
    }

    /// Remove every entry bound to `leg`; their callbacks still belong
    /// to the caller, which reports the leg failure.
    pub fn remove_by_leg(&self, leg: &Leg) -> Vec<QEntry> {
        let mut entries = self.entries.lock().unwrap();
        let ids: Vec<String> = entries
            .values()
            .filter(|e| &e.leg == leg)
            .map(|e| e.id.clone())
            .collect();
        ids.into_iter().filter_map(|id| entries.remove(&id)).collect()
    }

    /// Defensive once-per-second pass: entries past their final deadline
    /// come back for timeout handling, entries that somehow lost their
    /// timer are listed for re-arming.
    pub fn sweep(&self, now: Instant) -> (Vec<QEntry>, Vec<String>) {
        let mut entries = self.entries.lock().unwrap();
        let expired_ids: Vec<String> = entries
            .values()
            .filter(|e| !e.sending && e.final_deadline <= now)
            .map(|e| e.id.clone())
            .collect();
        let expired = expired_ids
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect();
        let unarmed = entries
            .values()
            .filter(|e| !e.sending && e.timer.is_none())
            .map(|e| e.id.clone())
            .collect();
        (expired, unarmed)
    }

    pub fn with_entry<R>(&self, id: &str, f: impl FnOnce(&mut QEntry) -> R) -> Option<R> {
        self.entries.lock().unwrap().get_mut(id).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_follows_rfc3261_backoff() {
        let now = Instant::now();
        let schedule = retransmit_schedule(now, T1, T2);

        // 0, 0.5, 1.5, 3.5, 7.5, 11.5, ... 31.5
        let offsets: Vec<f64> = schedule
            .iter()
            .map(|t| t.duration_since(now).as_secs_f64())
            .collect();
        assert_eq!(
            offsets,
            vec![0.0, 0.5, 1.5, 3.5, 7.5, 11.5, 15.5, 19.5, 23.5, 27.5, 31.5]
        );
    }

    #[test]
    fn test_schedule_gaps_capped_at_t2() {
        let now = Instant::now();
        let schedule = retransmit_schedule(now, T1, T2);
        let total = T1 * TIMEOUT_FACTOR;

        for pair in schedule.windows(2) {
            assert!(pair[1] - pair[0] <= T2);
        }
        let last = *schedule.last().unwrap();
        assert!(last - now < total);
    }

    #[test]
    fn test_schedule_with_custom_t1() {
        let now = Instant::now();
        let t1 = Duration::from_millis(20);
        let schedule = retransmit_schedule(now, t1, T2);
        assert_eq!(schedule[0], now);
        assert_eq!(schedule[1], now + t1);
        assert_eq!(schedule[2], now + t1 * 3);
        let total = t1 * TIMEOUT_FACTOR;
        assert!(schedule.iter().all(|t| t.duration_since(now) < total));
    }
}
