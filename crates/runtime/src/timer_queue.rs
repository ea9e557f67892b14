//! Deterministic timer queue.
//!
//! Key properties:
//! - Total ordering on `(deadline, id)`.
//! - Timers sharing a deadline fire in insertion order.
//! - Cancellation does not perturb the order of remaining timers.
//!
//! Backed by a `Vec` with a linear scan for the earliest deadline.

use foundation::time::Time;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Key {
    deadline: Time,
    id: TimerId,
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Item<T> {
    key: Key,
    payload: T,
}

#[derive(Debug)]
pub struct TimerQueue<T> {
    next_id: u64,
    items: Vec<Item<T>>,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            items: Vec::new(),
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, deadline: Time, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.items.push(Item {
            key: Key { deadline, id },
            payload,
        });
        id
    }

    /// Removes a pending timer. Returns the payload if it had not fired yet.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let idx = self.items.iter().position(|i| i.key.id == id)?;
        Some(self.items.swap_remove(idx).payload)
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.items.iter().any(|i| i.key.id == id)
    }

    pub fn next_deadline(&self) -> Option<Time> {
        self.earliest().map(|idx| self.items[idx].key.deadline)
    }

    /// Pops the earliest timer whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Time) -> Option<(TimerId, Time, T)> {
        let idx = self.earliest()?;
        if self.items[idx].key.deadline > now {
            return None;
        }
        let item = self.items.swap_remove(idx);
        Some((item.key.id, item.key.deadline, item.payload))
    }

    fn earliest(&self) -> Option<usize> {
        let mut best_idx: Option<usize> = None;
        for (idx, item) in self.items.iter().enumerate() {
            match best_idx {
                None => best_idx = Some(idx),
                Some(best) => {
                    if item.key < self.items[best].key {
                        best_idx = Some(idx);
                    }
                }
            }
        }
        best_idx
    }
}

#[cfg(test)]
mod tests {
    use super::TimerQueue;
    use foundation::time::Time;

    #[test]
    fn same_deadline_is_insertion_order() {
        let mut q = TimerQueue::new();
        q.push(Time(5), "a");
        q.push(Time(5), "b");
        q.push(Time(5), "c");

        let (_, _, a) = q.pop_due(Time(5)).unwrap();
        let (_, _, b) = q.pop_due(Time(5)).unwrap();
        let (_, _, c) = q.pop_due(Time(5)).unwrap();
        assert_eq!((a, b, c), ("a", "b", "c"));
    }

    #[test]
    fn earlier_deadline_fires_first() {
        let mut q = TimerQueue::new();
        q.push(Time(200), "late");
        q.push(Time(100), "early");
        assert_eq!(q.next_deadline(), Some(Time(100)));
        let (_, at, v) = q.pop_due(Time(1000)).unwrap();
        assert_eq!((at, v), (Time(100), "early"));
    }

    #[test]
    fn nothing_due_before_deadline() {
        let mut q = TimerQueue::new();
        q.push(Time(100), "x");
        assert!(q.pop_due(Time(99)).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cancel_removes_timer() {
        let mut q = TimerQueue::new();
        let a = q.push(Time(1), "a");
        q.push(Time(2), "b");
        assert_eq!(q.cancel(a), Some("a"));
        assert_eq!(q.cancel(a), None);
        assert!(!q.contains(a));

        let (_, _, v) = q.pop_due(Time(10)).unwrap();
        assert_eq!(v, "b");
        assert!(q.pop_due(Time(10)).is_none());
    }
}
