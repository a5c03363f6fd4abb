// Copyright 2020 Joyent, Inc.

//! Deadline ordered timer buckets.
//!
//! Callbacks registered for the same instant share one bucket and are
//! handed out together, in registration order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use crate::error::HandlerError;

pub type TimerCallback = Box<dyn FnOnce() -> Result<(), HandlerError>>;

#[derive(Default)]
pub struct TimerQueue {
    deadlines: BinaryHeap<Reverse<Instant>>,
    buckets: HashMap<Instant, Vec<TimerCallback>>,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue::default()
    }

    pub fn schedule(&mut self, due: Instant, callback: TimerCallback) {
        match self.buckets.get_mut(&due) {
            Some(bucket) => bucket.push(callback),
            None => {
                self.buckets.insert(due, vec![callback]);
                self.deadlines.push(Reverse(due));
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek().map(|Reverse(due)| *due)
    }

    /// Remove and return the earliest bucket if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(Instant, Vec<TimerCallback>)> {
        match self.next_deadline() {
            Some(due) if due <= now => {
                self.deadlines.pop();
                let bucket = self.buckets.remove(&due).unwrap_or_default();
                Some((due, bucket))
            }
            _ => None,
        }
    }

    /// Number of pending buckets.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn recorder(log: &Rc<RefCell<Vec<u32>>>, id: u32) -> TimerCallback {
        let log = Rc::clone(log);
        Box::new(move || {
            log.borrow_mut().push(id);
            Ok(())
        })
    }

    fn run(bucket: Vec<TimerCallback>) {
        for callback in bucket {
            callback().unwrap();
        }
    }

    #[test]
    fn same_instant_is_one_bucket_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = TimerQueue::new();
        let due = Instant::now();
        queue.schedule(due, recorder(&log, 1));
        queue.schedule(due, recorder(&log, 2));
        queue.schedule(due, recorder(&log, 3));
        assert_eq!(queue.len(), 1);

        let (popped, bucket) = queue.pop_due(due).unwrap();
        assert_eq!(popped, due);
        assert_eq!(bucket.len(), 3);
        run(bucket);
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn earliest_first_one_bucket_per_pop() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = TimerQueue::new();
        let base = Instant::now();
        queue.schedule(base + Duration::from_millis(30), recorder(&log, 30));
        queue.schedule(base + Duration::from_millis(10), recorder(&log, 10));
        queue.schedule(base + Duration::from_millis(20), recorder(&log, 20));

        assert_eq!(queue.next_deadline(), Some(base + Duration::from_millis(10)));
        let later = base + Duration::from_secs(1);
        while let Some((_, bucket)) = queue.pop_due(later) {
            run(bucket);
        }
        assert_eq!(*log.borrow(), vec![10, 20, 30]);
    }

    #[test]
    fn nothing_before_deadline() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = TimerQueue::new();
        let base = Instant::now();
        queue.schedule(base + Duration::from_secs(60), recorder(&log, 1));
        assert!(queue.pop_due(base).is_none());
        assert_eq!(queue.len(), 1);
    }
}
