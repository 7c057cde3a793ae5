//! Debounced persistence scheduling with a fixed-period heartbeat.
//!
//! Two independent timers per unit (record id):
//! - burst debounce: restarted by every local change, fires once changes
//!   stop arriving for the debounce interval
//! - heartbeat: fires on a fixed period while enabled, whether or not
//!   anything changed
//!
//! The scheduler is pure bookkeeping over deadlines; the owner sleeps until
//! [`PersistenceScheduler::next_deadline`] and then calls
//! [`PersistenceScheduler::drain_due`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::types::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WriteReason {
    Debounce,
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueWrite {
    pub unit: String,
    pub reason: WriteReason,
}

type TimerKey = (String, WriteReason);

pub struct PersistenceScheduler {
    debounce: Duration,
    heartbeat: Duration,
    pending: HashMap<TimerKey, Instant>,
    heap: BinaryHeap<Reverse<(Instant, TimerKey)>>,
}

impl PersistenceScheduler {
    pub fn new(debounce: Duration, heartbeat: Duration) -> Self {
        Self {
            debounce,
            heartbeat,
            pending: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.debounce(), config.heartbeat())
    }

    pub fn debounce_interval(&self) -> Duration {
        self.debounce
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
    }

    pub fn mark_dirty(&mut self, unit: &str) {
        self.mark_dirty_at(unit, Instant::now());
    }

    /// Restart the unit's debounce window.
    pub fn mark_dirty_at(&mut self, unit: &str, now: Instant) {
        self.schedule((unit.to_string(), WriteReason::Debounce), now + self.debounce);
    }

    pub fn start_heartbeat(&mut self, unit: &str) {
        self.start_heartbeat_at(unit, Instant::now());
    }

    /// Begin the fixed-period heartbeat. Already running heartbeats keep
    /// their phase.
    pub fn start_heartbeat_at(&mut self, unit: &str, now: Instant) {
        let key = (unit.to_string(), WriteReason::Heartbeat);
        if self.pending.contains_key(&key) {
            return;
        }
        self.schedule(key, now + self.heartbeat);
    }

    pub fn stop_heartbeat(&mut self, unit: &str) {
        self.pending
            .remove(&(unit.to_string(), WriteReason::Heartbeat));
    }

    pub fn has_heartbeat(&self, unit: &str) -> bool {
        self.pending
            .contains_key(&(unit.to_string(), WriteReason::Heartbeat))
    }

    pub fn is_dirty(&self, unit: &str) -> bool {
        self.pending
            .contains_key(&(unit.to_string(), WriteReason::Debounce))
    }

    pub fn record_failure(&mut self, unit: &str) {
        self.record_failure_at(unit, Instant::now());
    }

    /// Schedule a retry for a failed write at the next tick: one debounce
    /// interval from now, never immediately. A running heartbeat may
    /// retry it sooner.
    pub fn record_failure_at(&mut self, unit: &str, now: Instant) {
        self.schedule((unit.to_string(), WriteReason::Debounce), now + self.debounce);
    }

    /// Cancel both timers for a unit.
    pub fn cancel(&mut self, unit: &str) {
        self.pending.remove(&(unit.to_string(), WriteReason::Debounce));
        self.stop_heartbeat(unit);
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
        self.heap.clear();
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Units with a pending debounce, cleared from the schedule. Used to
    /// flush everything immediately.
    pub fn take_dirty(&mut self) -> Vec<String> {
        let mut dirty: Vec<String> = self
            .pending
            .keys()
            .filter(|(_, reason)| *reason == WriteReason::Debounce)
            .map(|(unit, _)| unit.clone())
            .collect();
        dirty.sort();
        for unit in &dirty {
            self.pending.remove(&(unit.clone(), WriteReason::Debounce));
        }
        dirty
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.pop_stale();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Remove and return every timer due at `now`. A unit whose debounce and
    /// heartbeat are both due is reported once, as a debounce write.
    /// Heartbeats are rescheduled on their fixed period, skipping ticks that
    /// were missed entirely.
    pub fn drain_due(&mut self, now: Instant) -> Vec<DueWrite> {
        let mut due: Vec<DueWrite> = Vec::new();
        loop {
            self.pop_stale();
            let Some(Reverse((fire_at, key))) = self.heap.peek().cloned() else {
                break;
            };
            if fire_at > now {
                break;
            }
            let _ = self.heap.pop();
            if self.pending.get(&key).copied() != Some(fire_at) {
                continue;
            }
            self.pending.remove(&key);

            let (unit, reason) = key;
            if reason == WriteReason::Heartbeat {
                let mut next = fire_at + self.heartbeat;
                while next <= now {
                    next += self.heartbeat;
                }
                self.schedule((unit.clone(), WriteReason::Heartbeat), next);
            }

            match due.iter_mut().find(|d| d.unit == unit) {
                Some(existing) => existing.reason = existing.reason.min(reason),
                None => due.push(DueWrite { unit, reason }),
            }
        }
        due
    }

    fn schedule(&mut self, key: TimerKey, at: Instant) {
        self.pending.insert(key.clone(), at);
        self.heap.push(Reverse((at, key)));
    }

    fn pop_stale(&mut self) {
        while let Some(Reverse((at, key))) = self.heap.peek() {
            if self.pending.get(key) == Some(at) {
                break;
            }
            let _ = self.heap.pop();
        }
    }
}
