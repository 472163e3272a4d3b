//! Min-heap of scheduled callbacks, driven by the worker's idle ticks.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::mem;
use std::time::{Duration, Instant};

use crate::worker::WorkerCtx;
use crate::TimerId;

pub type TimerAction = Box<dyn FnMut(&mut WorkerCtx<'_>) + Send>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimerPolicy {
    Once,
    Frequent,
}

pub struct Timer {
    pub id: TimerId,
    pub interval: Duration,
    pub next_fire: Instant,
    pub policy: TimerPolicy,
    pub caller: &'static str,
    pub action: TimerAction,
}

/// Heap entry ordered so the earliest `next_fire` pops first.
struct HeapEntry(Timer);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.next_fire == other.0.next_fire && self.0.id == other.0.id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .next_fire
            .cmp(&self.0.next_fire)
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

pub struct TimerWheel {
    heap: BinaryHeap<HeapEntry>,
    next_id: TimerId,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            heap: BinaryHeap::new(),
            next_id: 1,
        }
    }

    /// Schedules `action`. The first firing happens after `delay` when given,
    /// otherwise after `interval`.
    pub fn register(
        &mut self,
        now: Instant,
        caller: &'static str,
        interval: Duration,
        policy: TimerPolicy,
        delay: Option<Duration>,
        action: TimerAction,
    ) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        self.heap.push(HeapEntry(Timer {
            id,
            interval,
            next_fire: now + delay.unwrap_or(interval),
            policy,
            caller,
            action,
        }));

        id
    }

    /// Drops a scheduled timer. Unknown ids are ignored.
    pub fn remove(&mut self, timer_id: TimerId) {
        if !self.heap.iter().any(|entry| entry.0.id == timer_id) {
            return;
        }

        let mut entries = mem::take(&mut self.heap).into_vec();
        entries.retain(|entry| entry.0.id != timer_id);
        self.heap = BinaryHeap::from(entries);
    }

    /// Pops the earliest timer whose fire time has passed.
    pub fn pop_expired(&mut self, now: Instant) -> Option<Timer> {
        match self.heap.peek() {
            Some(entry) if entry.0.next_fire <= now => self.heap.pop().map(|entry| entry.0),
            _ => None,
        }
    }

    /// Puts a frequent timer back with its next fire time advanced.
    pub fn reinsert(&mut self, mut timer: Timer, now: Instant) {
        timer.next_fire = now + timer.interval;
        self.heap.push(HeapEntry(timer));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
