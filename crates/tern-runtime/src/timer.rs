//! Timer Queue.
//!
//! A min-heap of `(fire_at, seq)` keys over an arena of activities. Equal fire
//! times fire in insertion order. Cancellation is not handled here: the loop
//! checks the activity registry when an entry comes due.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use crate::activity::{Activity, ActivityId};

#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, ActivityId)>>,
    arena: HashMap<ActivityId, Activity>,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn insert(&mut self, activity: Activity) {
        self.seq += 1;
        self.heap
            .push(Reverse((activity.fire_at, self.seq, activity.id)));
        self.arena.insert(activity.id, activity);
    }

    /// Fire time of the earliest entry.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Remove and return the earliest entry if it is due at `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<Activity> {
        while let Some(Reverse((at, _, id))) = self.heap.peek().copied() {
            if at > now {
                return None;
            }
            self.heap.pop();
            if let Some(activity) = self.arena.remove(&id) {
                return Some(activity);
            }
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.arena.len()
    }

    /// Remove every entry, returning their ids.
    pub(crate) fn clear(&mut self) -> Vec<ActivityId> {
        self.heap.clear();
        self.arena.drain().map(|(id, _)| id).collect()
    }
}
