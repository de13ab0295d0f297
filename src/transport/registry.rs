//! The set of installed legs. Adding a leg spawns its serve task bound
//! to the dispatcher's event channel; removing it cancels the task.

use super::{Leg, LegSpec, TransportEvent, TransportSender};
use std::sync::{Arc, Mutex};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::warn;

struct LegEntry {
    leg: Leg,
    token: CancellationToken,
}

struct RegistryInner {
    legs: Mutex<Vec<LegEntry>>,
    cancel_token: CancellationToken,
}

#[derive(Clone)]
pub struct LegRegistry {
    inner: Arc<RegistryInner>,
}

impl LegRegistry {
    pub fn new(cancel_token: CancellationToken) -> Self {
        LegRegistry {
            inner: Arc::new(RegistryInner {
                legs: Mutex::new(Vec::new()),
                cancel_token,
            }),
        }
    }

    pub fn add_leg(&self, leg: Leg, sender: TransportSender) {
        let token = self.inner.cancel_token.child_token();
        let entry_token = token.clone();
        let serve_leg = leg.clone();
        let registry = self.clone();
        let sender_clone = sender.clone();

        tokio::spawn(async move {
            select! {
                _ = token.cancelled() => {}
                _ = serve_leg.serve_loop(sender_clone.clone()) => {
                    warn!("leg serve loop exited: {}", serve_leg);
                }
            }
            registry.detach(&serve_leg);
            sender_clone.send(TransportEvent::Closed(serve_leg)).ok();
        });

        self.inner.legs.lock().unwrap().push(LegEntry {
            leg,
            token: entry_token,
        });
    }

    /// Cancel the leg's serve task and drop it from the set. Returns
    /// false when the leg was not installed.
    pub fn remove_leg(&self, leg: &Leg) -> bool {
        let mut legs = self.inner.legs.lock().unwrap();
        let before = legs.len();
        legs.retain(|entry| {
            if entry.leg == *leg {
                entry.token.cancel();
                false
            } else {
                true
            }
        });
        legs.len() != before
    }

    fn detach(&self, leg: &Leg) {
        self.inner
            .legs
            .lock()
            .unwrap()
            .retain(|entry| entry.leg != *leg);
    }

    pub fn get_legs(&self, spec: &LegSpec) -> Vec<Leg> {
        self.inner
            .legs
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.leg.matches(spec))
            .map(|entry| entry.leg.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Leg> {
        self.inner
            .legs
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.leg.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.legs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
