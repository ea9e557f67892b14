use std::cell::RefCell;
use std::fmt;
use std::time::Duration;

use foundation::time::Time;

use crate::timer_queue::{TimerId, TimerQueue};

/// Deferred work run on the single event loop.
pub type Task = Box<dyn FnOnce()>;

/// Delay-based scheduling on a single-threaded event loop.
///
/// Everything that waits on the render target (upsert retries, layer polls)
/// goes through this seam so tests can drive virtual time instead of
/// sleeping.
pub trait Scheduler {
    fn now(&self) -> Time;

    /// Runs `task` once, no earlier than `delay` from now.
    fn schedule(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancels a pending timer. Returns `false` if it already fired or was
    /// never scheduled here.
    fn cancel(&self, id: TimerId) -> bool;
}

/// Virtual-time scheduler: timers only fire when the owner advances time.
///
/// Firing order is deterministic, `(deadline, scheduling order)`. Tasks may
/// schedule further timers; those fire within the same `advance` call when
/// their deadline falls inside the advanced window.
pub struct VirtualScheduler {
    inner: RefCell<Inner>,
}

struct Inner {
    now: Time,
    queue: TimerQueue<Task>,
}

impl VirtualScheduler {
    pub fn new() -> Self {
        Self::starting_at(Time::ZERO)
    }

    pub fn starting_at(now: Time) -> Self {
        Self {
            inner: RefCell::new(Inner {
                now,
                queue: TimerQueue::new(),
            }),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    pub fn next_deadline(&self) -> Option<Time> {
        self.inner.borrow().queue.next_deadline()
    }

    /// Advances virtual time by `d`, firing due timers. Returns how many fired.
    pub fn advance(&self, d: Duration) -> usize {
        let target = self.now().saturating_add(d);
        self.advance_to(target)
    }

    pub fn advance_to(&self, target: Time) -> usize {
        let mut fired = 0usize;
        loop {
            // Release the borrow before running the task: tasks schedule and
            // cancel timers on this same scheduler.
            let next = {
                let mut inner = self.inner.borrow_mut();
                match inner.queue.pop_due(target) {
                    Some((_id, at, task)) => {
                        inner.now = inner.now.max(at);
                        Some(task)
                    }
                    None => None,
                }
            };
            let Some(task) = next else {
                break;
            };
            task();
            fired += 1;
        }
        let mut inner = self.inner.borrow_mut();
        inner.now = inner.now.max(target);
        fired
    }

    /// Fires timers in order until none remain or `max_tasks` have run.
    ///
    /// The cap keeps self-rescheduling pollers from spinning forever.
    pub fn run_until_idle(&self, max_tasks: usize) -> usize {
        let mut fired = 0usize;
        while fired < max_tasks {
            let Some(deadline) = self.next_deadline() else {
                break;
            };
            let next = {
                let mut inner = self.inner.borrow_mut();
                inner.queue.pop_due(deadline).map(|(_id, at, task)| {
                    inner.now = inner.now.max(at);
                    task
                })
            };
            if let Some(task) = next {
                task();
                fired += 1;
            }
        }
        fired
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VirtualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("VirtualScheduler")
            .field("now", &inner.now)
            .field("pending", &inner.queue.len())
            .finish()
    }
}

impl Scheduler for VirtualScheduler {
    fn now(&self) -> Time {
        self.inner.borrow().now
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let mut inner = self.inner.borrow_mut();
        let deadline = inner.now.saturating_add(delay);
        inner.queue.push(deadline, task)
    }

    fn cancel(&self, id: TimerId) -> bool {
        self.inner.borrow_mut().queue.cancel(id).is_some()
    }
}
