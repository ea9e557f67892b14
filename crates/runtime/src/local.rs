use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use foundation::time::Time;
use tokio::task::AbortHandle;

use crate::scheduler::{Scheduler, Task};
use crate::timer_queue::TimerId;

/// Real-time scheduler backed by tokio timers on the current `LocalSet`.
///
/// Must be used from inside `LocalSet::run_until` (or a task spawned on it):
/// tasks are `!Send` and run on the same thread that scheduled them.
pub struct LocalScheduler {
    origin: tokio::time::Instant,
    inner: Rc<RefCell<LocalTimers>>,
}

#[derive(Default)]
struct LocalTimers {
    next_id: u64,
    handles: BTreeMap<TimerId, AbortHandle>,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            inner: Rc::new(RefCell::new(LocalTimers::default())),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.borrow().handles.len()
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for LocalScheduler {
    fn now(&self) -> Time {
        let elapsed = self.origin.elapsed();
        Time(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let id = {
            let mut timers = self.inner.borrow_mut();
            let id = TimerId(timers.next_id);
            timers.next_id = timers.next_id.wrapping_add(1);
            id
        };

        let timers = Rc::downgrade(&self.inner);
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(timers) = timers.upgrade() {
                timers.borrow_mut().handles.remove(&id);
            }
            task();
        });

        self.inner
            .borrow_mut()
            .handles
            .insert(id, handle.abort_handle());
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let handle = self.inner.borrow_mut().handles.remove(&id);
        match handle {
            Some(h) => {
                h.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for LocalScheduler {
    fn drop(&mut self) {
        let handles = std::mem::take(&mut self.inner.borrow_mut().handles);
        if !handles.is_empty() {
            tracing::debug!(pending = handles.len(), "aborting pending timers");
        }
        for h in handles.into_values() {
            h.abort();
        }
    }
}
