//! A virtual-time scheduler of one-shot timers.
//!
//! Timers fire in deadline order; timers sharing a deadline fire in the order
//! they were scheduled.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

/// Handle to a scheduled timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug)]
pub struct Scheduler<E> {
    now: Duration,
    next_id: u64,
    timers: BTreeMap<(Duration, TimerId), E>,
    deadlines: HashMap<TimerId, Duration>,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_id: 0,
            timers: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// The current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Amount of timers that have not fired nor been cancelled.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Arms a timer that fires `event` after `delay` from now.
    pub fn schedule(&mut self, delay: Duration, event: E) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        let deadline = self.now + delay;
        self.timers.insert((deadline, id), event);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Cancels a pending timer, returning its event if it had not fired yet.
    pub fn cancel(&mut self, id: TimerId) -> Option<E> {
        let deadline = self.deadlines.remove(&id)?;
        self.timers.remove(&(deadline, id))
    }

    /// Whether `id` is still pending.
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Pending events in firing order.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.timers.values()
    }

    /// Pops the earliest timer and moves the clock to its deadline.
    pub fn next(&mut self) -> Option<(Duration, E)> {
        let ((deadline, id), event) = self.timers.pop_first()?;
        self.deadlines.remove(&id);
        self.now = deadline;
        Some((deadline, event))
    }

    /// Cancels every pending timer. The clock is left where it is.
    pub fn clear(&mut self) {
        self.timers.clear();
        self.deadlines.clear();
    }
}
