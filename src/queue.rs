use crate::model::ExperimentId;
use parking_lot::{Condvar, Mutex};
use signal_hook::{consts::TERM_SIGNALS, flag};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("Refusing to enqueue an empty wake token")]
    EmptyWake,
    #[error("Dequeue was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Default)]
/// Cooperative cancellation signal shared between the queue, the worker loop
/// and whoever owns the process lifetime.
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Trip the flag on the usual termination signals so the worker loop can
    /// wind down at its next checkpoint instead of the process dying mid-run.
    pub fn trigger_on_signals(&self) -> Result<(), std::io::Error> {
        for signal in TERM_SIGNALS {
            flag::register(*signal, self.0.clone())?;
        }

        Ok(())
    }
}

// cancellation is observed by polling, so waits are chopped into short slices
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
/// Unbounded multi-producer/single-consumer FIFO of wake tokens.
///
/// Only the experiment id crosses the channel, never the request payload. The
/// persisted store stays the single source of truth for what is runnable,
/// this queue merely spares the worker loop a full poll interval of latency.
pub struct RequestQueue {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    items: Mutex<VecDeque<ExperimentId>>,
    available: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a wake token to the consumer. Never blocks, the backing store is
    /// unbounded.
    pub fn enqueue(&self, id: ExperimentId) -> Result<(), QueueError> {
        if id.trim().is_empty() {
            return Err(QueueError::EmptyWake);
        }

        self.inner.items.lock().push_back(id);
        self.inner.available.notify_one();

        Ok(())
    }

    /// Block until a wake token is available or `shutdown` fires.
    pub fn dequeue(&self, shutdown: &Shutdown) -> Result<ExperimentId, QueueError> {
        let mut items = self.inner.items.lock();

        loop {
            if let Some(id) = items.pop_front() {
                return Ok(id);
            }

            if shutdown.is_triggered() {
                return Err(QueueError::Cancelled);
            }

            self.inner.available.wait_for(&mut items, WAIT_SLICE);
        }
    }

    /// Like `dequeue` but gives up after `timeout`, returning `None`. Used by
    /// the worker loop as its inter-cycle sleep so a fresh submission cuts the
    /// wait short.
    pub fn dequeue_timeout(
        &self,
        shutdown: &Shutdown,
        timeout: Duration,
    ) -> Result<Option<ExperimentId>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut items = self.inner.items.lock();

        loop {
            if let Some(id) = items.pop_front() {
                return Ok(Some(id));
            }

            if shutdown.is_triggered() {
                return Err(QueueError::Cancelled);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            self.inner
                .available
                .wait_for(&mut items, WAIT_SLICE.min(deadline - now));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }
}

#[cfg(test)]
mod queue_test {
    use super::*;
    use std::thread;

    #[test]
    fn delivers_in_enqueue_order() {
        let queue = RequestQueue::new();
        let shutdown = Shutdown::new();

        for id in ["a", "b", "c"] {
            queue.enqueue(id.to_owned()).unwrap();
        }

        assert_eq!(queue.dequeue(&shutdown).unwrap(), "a");
        assert_eq!(queue.dequeue(&shutdown).unwrap(), "b");
        assert_eq!(queue.dequeue(&shutdown).unwrap(), "c");
        assert!(queue.is_empty());
    }

    #[test]
    fn rejects_empty_wake() {
        let queue = RequestQueue::new();

        assert_eq!(queue.enqueue(String::new()), Err(QueueError::EmptyWake));
        assert_eq!(queue.enqueue("  ".to_owned()), Err(QueueError::EmptyWake));
        assert!(queue.is_empty());
    }

    #[test]
    fn termination_signal_trips_the_shutdown_flag() {
        let shutdown = Shutdown::new();
        shutdown.trigger_on_signals().unwrap();
        assert!(!shutdown.is_triggered());

        // raise() delivers to the calling thread before it returns
        signal_hook::low_level::raise(signal_hook::consts::SIGTERM).unwrap();

        assert!(shutdown.is_triggered());
    }

    #[test]
    fn dequeue_observes_cancellation() {
        let queue = RequestQueue::new();
        let shutdown = Shutdown::new();
        shutdown.trigger();

        assert_eq!(queue.dequeue(&shutdown), Err(QueueError::Cancelled));
    }

    #[test]
    fn dequeue_wakes_on_concurrent_enqueue() {
        let queue = RequestQueue::new();
        let shutdown = Shutdown::new();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.enqueue("wake".to_owned()).unwrap();
            })
        };

        assert_eq!(queue.dequeue(&shutdown).unwrap(), "wake");
        producer.join().unwrap();
    }

    #[test]
    fn dequeue_timeout_expires_empty() {
        let queue = RequestQueue::new();
        let shutdown = Shutdown::new();

        assert_eq!(
            queue
                .dequeue_timeout(&shutdown, Duration::from_millis(50))
                .unwrap(),
            None
        );
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = RequestQueue::new();
        let shutdown = Shutdown::new();

        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for item in 0..16 {
                        queue.enqueue(format!("{producer}-{item}")).unwrap();
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = Vec::new();
        while let Ok(Some(id)) = queue.dequeue_timeout(&shutdown, Duration::from_millis(10)) {
            seen.push(id);
        }

        assert_eq!(seen.len(), 64);
    }
}
