use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use super::HalError;

type WaiterCallback = Box<dyn FnOnce(Result<u64, HalError>) + Send>;

enum Notify {
    Channel(flume::Sender<Result<u64, HalError>>),
    Callback(WaiterCallback),
}

struct Waiter {
    key: u64,
    target: u64,
    notify: Notify,
}

struct Inner {
    value: u64,
    failure: Option<String>,
    next_key: u64,
    waiters: Vec<Waiter>,
}

/// A monotonically increasing 64-bit timeline with a terminal failure state.
///
/// Host threads block on [`wait`](Semaphore::wait), async integrations poll
/// [`wait_async`](Semaphore::wait_async), and the task executor registers
/// callbacks through [`on_reach`](Semaphore::on_reach) so wait tasks never
/// occupy a worker thread.
pub struct Semaphore {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("failed to lock");
        f.debug_struct("Semaphore")
            .field("value", &inner.value)
            .field("failure", &inner.failure)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

impl Semaphore {
    pub fn new(initial: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                value: initial,
                failure: None,
                next_key: 0,
                waiters: Vec::new(),
            }),
        })
    }

    /// Returns the current timeline value, or the recorded failure.
    pub fn query(&self) -> Result<u64, HalError> {
        let inner = self.inner.lock().expect("failed to lock");
        match &inner.failure {
            Some(reason) => Err(HalError::AlreadyFailed(reason.clone())),
            None => Ok(inner.value),
        }
    }

    /// Advances the timeline to `value` and wakes satisfied waiters.
    ///
    /// The watermark never moves backwards: signaling below the current value
    /// is rejected rather than clamped.
    pub fn signal(&self, value: u64) -> Result<(), HalError> {
        let woken = {
            let mut inner = self.inner.lock().expect("failed to lock");
            if let Some(reason) = &inner.failure {
                return Err(HalError::AlreadyFailed(reason.clone()));
            }
            if value < inner.value {
                return Err(HalError::NotMonotonic {
                    value,
                    current: inner.value,
                });
            }
            inner.value = value;
            let (woken, kept) = inner
                .waiters
                .drain(..)
                .partition::<Vec<_>, _>(|waiter| waiter.target <= value);
            inner.waiters = kept;
            woken
        };
        // notify outside the lock: callbacks may re-enter the semaphore
        for waiter in woken {
            waiter.notify.complete(Ok(value));
        }
        Ok(())
    }

    /// Moves the semaphore into its terminal failure state, exactly once, and
    /// wakes every current waiter with the failure. Later signals and waits
    /// observe the same failure.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let woken = {
            let mut inner = self.inner.lock().expect("failed to lock");
            if inner.failure.is_some() {
                log::warn!("semaphore already failed, dropping: {reason}");
                return;
            }
            inner.failure = Some(reason.clone());
            std::mem::take(&mut inner.waiters)
        };
        for waiter in woken {
            waiter.notify.complete(Err(HalError::AlreadyFailed(reason.clone())));
        }
    }

    fn register(&self, target: u64, notify: Notify) -> Option<u64> {
        let mut inner = self.inner.lock().expect("failed to lock");
        if let Some(reason) = &inner.failure {
            let reason = reason.clone();
            drop(inner);
            notify.complete(Err(HalError::AlreadyFailed(reason)));
            return None;
        }
        if inner.value >= target {
            let value = inner.value;
            drop(inner);
            notify.complete(Ok(value));
            return None;
        }
        let key = inner.next_key;
        inner.next_key += 1;
        inner.waiters.push(Waiter {
            key,
            target,
            notify,
        });
        Some(key)
    }

    fn deregister(&self, key: u64) {
        let mut inner = self.inner.lock().expect("failed to lock");
        inner.waiters.retain(|waiter| waiter.key != key);
    }

    /// Invokes `callback` once the timeline reaches `target` or fails.
    /// Fires immediately if the condition already holds.
    pub fn on_reach(&self, target: u64, callback: WaiterCallback) {
        self.register(target, Notify::Callback(callback));
    }

    /// Blocks the calling thread until the timeline reaches `target`, the
    /// semaphore fails, or `deadline` elapses.
    pub fn wait(&self, target: u64, deadline: Option<Duration>) -> Result<(), HalError> {
        let (sender, receiver) = flume::bounded(1);
        let Some(key) = self.register(target, Notify::Channel(sender)) else {
            // resolved inline: the channel already holds the outcome
            return receiver.recv().expect("inline waiter must resolve").map(|_| ());
        };
        let received = match deadline {
            Some(deadline) => receiver.recv_timeout(deadline),
            None => receiver.recv().map_err(|_| flume::RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(outcome) => outcome.map(|_| ()),
            Err(_) => {
                self.deregister(key);
                // the waiter may have fired between the timeout and the
                // deregistration; prefer the definitive outcome if so
                match receiver.try_recv() {
                    Ok(outcome) => outcome.map(|_| ()),
                    Err(_) => Err(HalError::Timeout),
                }
            }
        }
    }

    /// Resolves once the timeline reaches `target` or the semaphore fails.
    pub async fn wait_async(&self, target: u64) -> Result<u64, HalError> {
        let (sender, receiver) = flume::bounded(1);
        self.register(target, Notify::Channel(sender));
        receiver
            .recv_async()
            .await
            .expect("semaphore dropped the waiter")
    }
}

impl Notify {
    fn complete(self, outcome: Result<u64, HalError>) {
        match self {
            // the receiver may have timed out and gone away
            Notify::Channel(sender) => _ = sender.send(outcome),
            Notify::Callback(callback) => callback(outcome),
        }
    }
}

/// A semaphore paired with a target payload value.
#[derive(Debug, Clone)]
pub struct Fence {
    pub semaphore: Arc<Semaphore>,
    pub value: u64,
}

impl Fence {
    pub fn new(semaphore: Arc<Semaphore>, value: u64) -> Self {
        Self { semaphore, value }
    }

    #[inline]
    pub fn signal(&self) -> Result<(), HalError> {
        self.semaphore.signal(self.value)
    }

    #[inline]
    pub fn is_reached(&self) -> Result<bool, HalError> {
        Ok(self.semaphore.query()? >= self.value)
    }
}

/// Waits until every fence is reached, or any semaphore fails, or the
/// deadline elapses.
pub fn wait_all(fences: &[Fence], deadline: Option<Duration>) -> Result<(), HalError> {
    let start = Instant::now();
    for fence in fences {
        let remaining = match deadline {
            Some(deadline) => Some(
                deadline
                    .checked_sub(start.elapsed())
                    .ok_or(HalError::Timeout)?,
            ),
            None => None,
        };
        fence.semaphore.wait(fence.value, remaining)?;
    }
    Ok(())
}

/// Waits until at least one fence is reached. A failed semaphore resolves the
/// wait with its failure.
pub fn wait_any(fences: &[Fence], deadline: Option<Duration>) -> Result<usize, HalError> {
    if fences.is_empty() {
        return Err(HalError::InvalidArgument("empty fence list".into()));
    }
    let (sender, receiver) = flume::bounded::<(usize, Result<u64, HalError>)>(fences.len());
    for (index, fence) in fences.iter().enumerate() {
        let sender = sender.clone();
        fence.semaphore.on_reach(
            fence.value,
            Box::new(move |outcome| {
                _ = sender.send((index, outcome));
            }),
        );
    }
    drop(sender);

    let received = match deadline {
        Some(deadline) => receiver
            .recv_timeout(deadline)
            .map_err(|_| HalError::Timeout)?,
        None => receiver.recv().map_err(|_| HalError::Timeout)?,
    };
    let (index, outcome) = received;
    outcome.map(|_| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_watermark() {
        let semaphore = Semaphore::new(0);
        semaphore.signal(5).unwrap();
        assert_eq!(semaphore.query().unwrap(), 5);

        let err = semaphore.signal(3).unwrap_err();
        assert!(matches!(err, HalError::NotMonotonic { value: 3, current: 5 }));

        // equal and greater both succeed
        semaphore.signal(5).unwrap();
        semaphore.signal(9).unwrap();
        assert_eq!(semaphore.query().unwrap(), 9);
    }

    #[test]
    fn test_failure_is_sticky() {
        let semaphore = Semaphore::new(0);
        semaphore.fail("dispatch exploded");
        assert!(matches!(semaphore.query(), Err(HalError::AlreadyFailed(_))));
        assert!(matches!(semaphore.signal(1), Err(HalError::AlreadyFailed(_))));

        // a second failure does not overwrite the first
        semaphore.fail("later failure");
        match semaphore.query() {
            Err(HalError::AlreadyFailed(reason)) => assert_eq!(reason, "dispatch exploded"),
            other => panic!("unexpected: {other:?}"),
        }

        // waits resolve immediately without blocking
        let err = semaphore.wait(10, None).unwrap_err();
        assert!(matches!(err, HalError::AlreadyFailed(_)));
    }

    #[test]
    fn test_wait_across_threads() {
        let semaphore = Semaphore::new(0);
        let signaler = semaphore.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaler.signal(7).unwrap();
        });
        semaphore.wait(7, Some(Duration::from_secs(5))).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let semaphore = Semaphore::new(0);
        let err = semaphore
            .wait(1, Some(Duration::from_millis(5)))
            .unwrap_err();
        assert!(matches!(err, HalError::Timeout));

        // the timed-out waiter is gone; signaling still works
        semaphore.signal(1).unwrap();
        semaphore.wait(1, Some(Duration::from_millis(5))).unwrap();
    }

    #[test]
    fn test_on_reach_fires_once() {
        let semaphore = Semaphore::new(0);
        let (sender, receiver) = flume::unbounded();
        semaphore.on_reach(3, Box::new(move |outcome| _ = sender.send(outcome)));

        semaphore.signal(2).unwrap();
        assert!(receiver.try_recv().is_err());
        semaphore.signal(3).unwrap();
        assert_eq!(receiver.recv().unwrap().unwrap(), 3);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_wait_any_and_all() {
        let a = Semaphore::new(0);
        let b = Semaphore::new(0);
        let fences = [Fence::new(a.clone(), 1), Fence::new(b.clone(), 1)];

        b.signal(1).unwrap();
        let index = wait_any(&fences, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(index, 1);

        let waiter = {
            let fences = fences.to_vec();
            std::thread::spawn(move || wait_all(&fences, Some(Duration::from_secs(5))))
        };
        a.signal(1).unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_async() {
        let semaphore = Semaphore::new(0);
        let signaler = semaphore.clone();
        let task = crate::platform::spawn(async move { semaphore.wait_async(4).await });
        signaler.signal(4).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), 4);
    }
}
