//! A worker thread pool with an ordered result queue.
//!
//! CPU-bound compression and decompression jobs are fanned out to a fixed set
//! of worker threads over a channel. Results come back through a
//! [`ProcessQueue`], which hands them to the consumer strictly in dispatch
//! order regardless of completion order, so file order is preserved on both
//! encode and decode without extra sequencing.
//!
//! The queue is bounded: `reserve` blocks once `capacity` results are
//! dispatched but not yet consumed, which is what throttles a fast producer
//! against slow workers. A reset (used by mid-stream seeks) bumps an epoch
//! counter; completions carrying a stale epoch are handed back to the caller
//! for recycling instead of being enqueued.

use std::collections::BTreeMap;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// A pool of worker threads executing boxed tasks.
///
/// One pool may be shared by several handles; each handle brings its own
/// [`ProcessQueue`] for result ordering.
pub struct ThreadPool {
    tx: Option<crossbeam_channel::Sender<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
}

type Task = Box<dyn FnOnce() + Send + 'static>;

impl ThreadPool {
    /// Creates a pool of `workers` threads; `0` means one per CPU.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = if workers == 0 {
            num_cpus::get()
        } else {
            workers
        };
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let workers = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("bgzf2-worker-{i}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            task();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn execute<F: FnOnce() + Send + 'static>(&self, task: F) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or(Error::Resource("thread pool is shut down"))?
            .send(Box::new(task))
            .map_err(|_| Error::Resource("thread pool workers exited"))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Outcome of reserving a dispatch slot.
pub(crate) enum Reserve {
    Slot(Ticket),
    /// Woken by [`ProcessQueue::interrupt`]; the caller should check its
    /// command channel
    Interrupted,
    Shutdown,
}

/// A reserved place in dispatch order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ticket {
    seq: u64,
    epoch: u64,
}

struct QueueState<T> {
    capacity: usize,
    epoch: u64,
    /// Next dispatch sequence number
    next_seq: u64,
    /// Next sequence to hand to the consumer
    head_seq: u64,
    /// Dispatched but not yet consumed, current epoch only
    in_flight: usize,
    results: BTreeMap<u64, T>,
    shutdown: bool,
    interrupted: bool,
}

/// Order-preserving bounded result queue between a dispatcher, the worker
/// pool, and a single consumer.
pub(crate) struct ProcessQueue<T> {
    state: Mutex<QueueState<T>>,
    space: Condvar,
    ready: Condvar,
}

impl<T> ProcessQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                capacity: capacity.max(1),
                epoch: 0,
                next_seq: 0,
                head_seq: 0,
                in_flight: 0,
                results: BTreeMap::new(),
                shutdown: false,
                interrupted: false,
            }),
            space: Condvar::new(),
            ready: Condvar::new(),
        }
    }

    /// Reserves the next dispatch slot, blocking while the queue is full.
    pub fn reserve(&self) -> Reserve {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Reserve::Shutdown;
            }
            if state.interrupted {
                state.interrupted = false;
                return Reserve::Interrupted;
            }
            if state.in_flight < state.capacity {
                let ticket = Ticket {
                    seq: state.next_seq,
                    epoch: state.epoch,
                };
                state.next_seq += 1;
                state.in_flight += 1;
                return Reserve::Slot(ticket);
            }
            self.space.wait(&mut state);
        }
    }

    /// Delivers a finished result for `ticket`. Returns the value back when
    /// the queue was reset since the ticket was issued, so the caller can
    /// recycle it.
    pub fn complete(&self, ticket: Ticket, value: T) -> Option<T> {
        let mut state = self.state.lock();
        if ticket.epoch != state.epoch || state.shutdown {
            return Some(value);
        }
        state.results.insert(ticket.seq, value);
        if ticket.seq == state.head_seq {
            self.ready.notify_all();
        }
        None
    }

    /// Blocks for the next result in dispatch order. `None` after shutdown.
    pub fn next_result(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            let head = state.head_seq;
            if let Some(value) = state.results.remove(&head) {
                state.head_seq += 1;
                state.in_flight -= 1;
                self.space.notify_all();
                return Some(value);
            }
            if state.shutdown {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Discards all queued results and invalidates in-flight tickets.
    /// Returns the discarded results for recycling.
    pub fn reset(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.head_seq = state.next_seq;
        state.in_flight = 0;
        let drained = std::mem::take(&mut state.results).into_values().collect();
        self.space.notify_all();
        drained
    }

    /// Wakes a dispatcher blocked in [`reserve`](Self::reserve) so it can
    /// service its command channel.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.space.notify_all();
    }

    /// Permanently closes the queue, waking all waiters.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.space.notify_all();
        self.ready.notify_all();
    }
}
