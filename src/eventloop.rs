//! Timer service shared by the dispatcher, delivery queue and registrar.
//!
//! Timers live in a `BTreeMap` keyed by `(deadline, seq)`, so firing order
//! is non-decreasing by deadline with ties broken by insertion order. The
//! poll loop caches the clock once per iteration (`looptime`) so callbacks
//! dispatched together observe the same instant. Socket readiness is not
//! handled here: legs are driven by their own serve tasks.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub type TimerCb = Box<dyn FnMut() + Send>;

/// Opaque handle returned by `add_timer`, the only way external code can
/// refer to a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerKey {
    execute_at: Instant,
    seq: u64,
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.execute_at
            .cmp(&other.execute_at)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct TimerEntry {
    cb: TimerCb,
    repeat: Option<Duration>,
}

struct EventLoopInner {
    tasks: Mutex<BTreeMap<TimerKey, TimerEntry>>,
    id_index: Mutex<HashMap<u64, Instant>>,
    // Ids cancelled while their entry was out of the map for dispatch.
    tombstones: Mutex<HashSet<u64>>,
    looptime: Mutex<Instant>,
    last_id: AtomicU64,
    interval: Duration,
    cancel_token: CancellationToken,
}

#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<EventLoopInner>,
}

impl EventLoop {
    pub fn new(interval: Option<Duration>, cancel_token: CancellationToken) -> Self {
        EventLoop {
            inner: Arc::new(EventLoopInner {
                tasks: Mutex::new(BTreeMap::new()),
                id_index: Mutex::new(HashMap::new()),
                tombstones: Mutex::new(HashSet::new()),
                looptime: Mutex::new(Instant::now()),
                last_id: AtomicU64::new(1),
                interval: interval.unwrap_or(POLL_INTERVAL),
                cancel_token,
            }),
        }
    }

    /// Arm a timer `after` from now. `Duration::ZERO` fires on the next
    /// poll iteration. With `repeat`, the timer re-arms itself under the
    /// same id until cancelled.
    pub fn add_timer(
        &self,
        after: Duration,
        cb: impl FnMut() + Send + 'static,
        repeat: Option<Duration>,
    ) -> TimerId {
        self.add_timer_at(Instant::now() + after, cb, repeat)
    }

    pub fn add_timer_at(
        &self,
        execute_at: Instant,
        cb: impl FnMut() + Send + 'static,
        repeat: Option<Duration>,
    ) -> TimerId {
        let seq = self.inner.last_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .tasks
            .lock()
            .unwrap()
            .insert(
                TimerKey { execute_at, seq },
                TimerEntry {
                    cb: Box::new(cb),
                    repeat,
                },
            );
        self.inner.id_index.lock().unwrap().insert(seq, execute_at);
        TimerId(seq)
    }

    /// Disarm a timer. Returns false if the timer never existed or has
    /// already fired; cancelling a fired timer is a no-op.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let execute_at = self.inner.id_index.lock().unwrap().remove(&id.0);
        match execute_at {
            Some(execute_at) => {
                let removed = self
                    .inner
                    .tasks
                    .lock()
                    .unwrap()
                    .remove(&TimerKey {
                        execute_at,
                        seq: id.0,
                    })
                    .is_some();
                if !removed {
                    // Mid-dispatch: keep a repeating entry from re-arming.
                    self.inner.tombstones.lock().unwrap().insert(id.0);
                }
                true
            }
            None => false,
        }
    }

    /// Clock snapshot taken once per poll iteration; callers reuse it to
    /// avoid skew within one dispatch.
    pub fn looptime(&self) -> Instant {
        *self.inner.looptime.lock().unwrap()
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn run(&self) {
        while !self.inner.cancel_token.is_cancelled() {
            let now = Instant::now();
            *self.inner.looptime.lock().unwrap() = now;
            self.dispatch(now);
            tokio::time::sleep(self.inner.interval).await;
        }
        trace!("event loop stopped");
    }

    pub fn stop(&self) {
        self.inner.cancel_token.cancel();
    }

    fn dispatch(&self, now: Instant) {
        let due = {
            let mut tasks = self.inner.tasks.lock().unwrap();
            let keys = tasks
                .range(
                    ..=TimerKey {
                        execute_at: now,
                        seq: u64::MAX,
                    },
                )
                .map(|(key, _)| *key)
                .collect::<Vec<_>>();
            if keys.is_empty() {
                return;
            }
            let mut due = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(entry) = tasks.remove(&key) {
                    due.push((key, entry));
                }
            }
            due
        };

        // The map lock is released here: callbacks may add or cancel
        // timers while the batch runs. Ids stay in the index until their
        // entry has either run or been tombstoned, so cancelling a timer
        // that is due in the same batch still suppresses it.
        for (key, mut entry) in due {
            if self.inner.tombstones.lock().unwrap().remove(&key.seq) {
                continue;
            }
            (entry.cb)();
            match entry.repeat {
                Some(every) => {
                    if self.inner.tombstones.lock().unwrap().remove(&key.seq) {
                        continue;
                    }
                    let mut next = key.execute_at + every;
                    if next <= now {
                        next = now + every;
                    }
                    self.inner.tasks.lock().unwrap().insert(
                        TimerKey {
                            execute_at: next,
                            seq: key.seq,
                        },
                        entry,
                    );
                    self.inner.id_index.lock().unwrap().insert(key.seq, next);
                }
                None => {
                    self.inner.id_index.lock().unwrap().remove(&key.seq);
                    // A cancel that raced with this dispatch left a
                    // tombstone nothing will consume.
                    self.inner.tombstones.lock().unwrap().remove(&key.seq);
                }
            }
        }
    }
}
