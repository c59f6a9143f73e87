use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

/// Fixed sleep applied when a poll iteration reported no work.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Dedicated poll-loop thread with cooperative shutdown.
///
/// A `Worker` owns exactly one named OS thread that calls the supplied poll
/// function repeatedly until the abort flag is set. The poll function returns
/// `true` when it did work; an idle iteration sleeps briefly before the next
/// one. Dropping the worker sets the abort flag and joins the thread, so no
/// callback can fire after the `Worker` is gone.
///
/// Producer/consumer ordering across threads is established by the queues the
/// poll function drains, not by the worker's scheduling.
///
/// # Example
/// ```rust
/// use std::sync::{Arc, atomic::{AtomicU32, Ordering}};
/// use argus_core::prelude::Worker;
///
/// let count = Arc::new(AtomicU32::new(0));
/// let seen = count.clone();
/// let mut worker = Worker::new("ticker", move || {
///     seen.fetch_add(1, Ordering::Relaxed);
///     false
/// });
/// worker.run().unwrap();
/// while count.load(Ordering::Relaxed) == 0 {
///     std::thread::yield_now();
/// }
/// drop(worker);
/// ```
pub struct Worker {
    name: String,
    poll: Option<Box<dyn FnMut() -> bool + Send>>,
    abort: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

// The poll closure is only reachable through &mut self (`run` takes it out);
// shared references expose nothing that touches it.
unsafe impl Sync for Worker {}

impl Worker {
    /// Create a worker with a thread name and a poll function.
    ///
    /// The thread is not started until [`Worker::run`] is called.
    pub fn new<F>(name: impl Into<String>, poll: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self {
            name: name.into(),
            poll: Some(Box::new(poll)),
            abort: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Start the thread. Calling `run` a second time is a no-op.
    pub fn run(&mut self) -> std::io::Result<()> {
        let Some(mut poll) = self.poll.take() else {
            return Ok(());
        };
        let abort = self.abort.clone();
        let name = self.name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            tracing::debug!(worker = %name, "worker started");
            while !abort.load(Ordering::Acquire) {
                let busy = poll();
                if !busy {
                    thread::sleep(IDLE_SLEEP);
                }
            }
            tracing::debug!(worker = %name, "worker stopped");
        })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Whether the thread has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Signal the loop to stop and join the thread. Idempotent.
    pub fn stop(&mut self) {
        self.abort.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn drop_joins_and_silences_callbacks() {
        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        let mut worker = Worker::new("test-worker", move || {
            seen.fetch_add(1, Ordering::Relaxed);
            true
        });
        worker.run().unwrap();
        while count.load(Ordering::Relaxed) < 3 {
            thread::yield_now();
        }
        drop(worker);
        let after = count.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::Relaxed), after);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut worker = Worker::new("noop", || false);
        worker.run().unwrap();
        worker.stop();
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn run_without_poll_after_stop_is_noop() {
        let mut worker = Worker::new("once", || false);
        worker.run().unwrap();
        worker.stop();
        // Poll fn was consumed by the first run; a second run must not spawn.
        worker.run().unwrap();
        assert!(!worker.is_running());
    }
}
