//! Tick Queue: the run-as-soon-as-possible queue.
//!
//! Multiple producers on any thread, one consumer (the loop thread). FIFO in
//! order of completed pushes.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::activity::Activity;

#[derive(Debug, Default)]
pub(crate) struct TickQueue {
    queue: Mutex<VecDeque<Activity>>,
}

impl TickQueue {
    pub(crate) fn push(&self, activity: Activity) {
        self.queue.lock().push_back(activity);
    }

    pub(crate) fn pop(&self) -> Option<Activity> {
        self.queue.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Remove everything still queued, in order.
    pub(crate) fn drain(&self) -> Vec<Activity> {
        self.queue.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityId, ActivityKind};

    fn tick(id: u64) -> Activity {
        Activity::task(
            ActivityId(id),
            ActivityKind::Task,
            Box::new(|_| Ok(())),
            None,
            0,
        )
    }

    #[test]
    fn test_fifo_order() {
        let queue = TickQueue::default();
        queue.push(tick(1));
        queue.push(tick(2));
        queue.push(tick(3));
        assert_eq!(queue.len(), 3);

        let ids: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|a| a.id.as_u64())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_producers_keep_per_thread_order() {
        let queue = TickQueue::default();
        std::thread::scope(|s| {
            for t in 0..4u64 {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..250u64 {
                        queue.push(tick(t * 1000 + i));
                    }
                });
            }
        });

        let drained = queue.drain();
        assert_eq!(drained.len(), 1000);
        for t in 0..4u64 {
            let seen: Vec<u64> = drained
                .iter()
                .map(|a| a.id.as_u64())
                .filter(|id| id / 1000 == t)
                .collect();
            let mut sorted = seen.clone();
            sorted.sort();
            assert_eq!(seen, sorted);
        }
    }
}
