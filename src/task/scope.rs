use std::sync::{
    Arc, Condvar, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use super::TaskError;
use crate::hal::Fence;

/// Per-submission failure and retirement accounting.
///
/// The first failure sticks; everything recorded after it is dropped (with a
/// log line) so the error surfaced to the waiter is the one that started the
/// cascade.
pub(crate) struct Scope {
    status: Mutex<Option<TaskError>>,
    remaining: AtomicUsize,
    completion: Vec<Fence>,
    pending: Arc<PendingCounter>,
}

impl Scope {
    pub fn new(tasks: usize, completion: Vec<Fence>, pending: Arc<PendingCounter>) -> Self {
        Self {
            status: Mutex::new(None),
            remaining: AtomicUsize::new(tasks),
            completion,
            pending,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status.lock().expect("failed to lock").is_some()
    }

    pub fn failure(&self) -> Option<String> {
        let status = self.status.lock().expect("failed to lock");
        status.as_ref().map(|err| err.to_string())
    }

    /// Records the scope's permanent status. First writer wins.
    pub fn try_fail(&self, err: TaskError) {
        let mut status = self.status.lock().expect("failed to lock");
        match status.as_ref() {
            Some(first) => log::warn!("scope already failed with `{first}`, dropping `{err}`"),
            None => *status = Some(err),
        }
    }

    /// Marks one task as retired (complete or aborted). The last retirement
    /// resolves the completion fences and releases the submission.
    pub fn retire_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        match self.failure() {
            Some(reason) => {
                for fence in &self.completion {
                    fence.semaphore.fail(reason.clone());
                }
            }
            None => {
                for fence in &self.completion {
                    if let Err(err) = fence.signal() {
                        log::error!("completion fence rejected signal: {err}");
                    }
                }
            }
        }
        self.pending.end();
    }
}

/// Counts submissions in flight so [`Executor::drain`](super::Executor::drain)
/// can park until the pool goes idle.
#[derive(Default)]
pub(crate) struct PendingCounter {
    count: Mutex<usize>,
    idle: Condvar,
}

impl PendingCounter {
    pub fn begin(&self) {
        *self.count.lock().expect("failed to lock") += 1;
    }

    pub fn end(&self) {
        let mut count = self.count.lock().expect("failed to lock");
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    /// Blocks until no submissions remain. Returns `false` on deadline.
    pub fn wait_idle(&self, deadline: Option<Duration>) -> bool {
        let mut count = self.count.lock().expect("failed to lock");
        match deadline {
            Some(deadline) => {
                let (guard, _) = self
                    .idle
                    .wait_timeout_while(count, deadline, |count| *count > 0)
                    .expect("failed to lock");
                *guard == 0
            }
            None => {
                while *count > 0 {
                    count = self.idle.wait(count).expect("failed to lock");
                }
                true
            }
        }
    }
}
