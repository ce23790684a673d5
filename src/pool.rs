//! Bounded worker pool used to run each unordered stage's invocation on one
//! buffer as an independent job (`SPEC_FULL.md` §4.6).
//!
//! The original pool is a hand-rolled mutex/condvar queue with a
//! reference-counted start/stop lifecycle. The Rust port keeps that shape --
//! bounded queue, blocking submitter, per-job completion handle -- but
//! expresses the queue itself with `crossbeam-channel`'s bounded channel,
//! which gives the "submitter blocks when full / worker blocks when empty"
//! behaviour of `SPEC_FULL.md` §5 for free instead of hand-rolling it with a
//! condvar, the way the rest of this crate already leans on
//! `crossbeam-channel` for inter-stage handoff.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct JobCompletion {
    done: Mutex<bool>,
    cvar: Condvar,
}

/// A handle to a submitted job; `wait()` blocks until it has run.
pub struct JobHandle {
    completion: Arc<JobCompletion>,
}

impl JobHandle {
    pub fn wait(&self) {
        let mut done = self.completion.done.lock().unwrap();
        while !*done {
            done = self.completion.cvar.wait(done).unwrap();
        }
    }

    pub fn is_finished(&self) -> bool {
        *self.completion.done.lock().unwrap()
    }
}

struct Shared {
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    client_count: AtomicUsize,
    worker_count: usize,
    dying: AtomicBool,
}

/// A bounded pool of worker threads. Construct once per run and share it
/// across stages via `client_increase`/`client_decrease`, or simply keep one
/// `ThreadPool` alive for the process lifetime (`GlobalThreadPool` in the
/// original is the degenerate case of this with a single, never-decreased
/// client).
pub struct ThreadPool {
    shared: Arc<Shared>,
    requested_workers: usize,
}

impl ThreadPool {
    /// `requested_workers` is clamped to the number of available CPU cores;
    /// queue length is `worker_count / 4`, clamped to at least 1.
    pub fn new(requested_workers: usize) -> Self {
        let worker_count = requested_workers.min(num_cpus::get()).max(1);
        let queue_len = (worker_count / 4).max(1);
        let (sender, receiver) = bounded(queue_len);

        ThreadPool {
            shared: Arc::new(Shared {
                sender: Mutex::new(Some(sender)),
                receiver,
                workers: Mutex::new(Vec::new()),
                client_count: AtomicUsize::new(0),
                worker_count,
                dying: AtomicBool::new(false),
            }),
            requested_workers: worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.requested_workers
    }

    /// Crossing 0 -> 1 starts the worker threads.
    pub fn client_increase(&self) {
        if self.shared.client_count.fetch_add(1, Ordering::SeqCst) == 0 {
            self.start_workers();
        }
    }

    /// Crossing 1 -> 0 drains the queue and stops the worker threads.
    pub fn client_decrease(&self) {
        if self.shared.client_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.stop_workers();
        }
    }

    fn start_workers(&self) {
        debug!("starting {} pool workers", self.shared.worker_count);
        let mut workers = self.shared.workers.lock().unwrap();
        for _ in 0..self.shared.worker_count {
            let receiver = self.shared.receiver.clone();
            workers.push(std::thread::spawn(move || {
                for job in receiver.iter() {
                    job();
                }
            }));
        }
    }

    fn stop_workers(&self) {
        // Dropping the sender closes the channel once every in-flight
        // submitter has returned, which unblocks `receiver.iter()` above.
        *self.shared.sender.lock().unwrap() = None;
        let mut workers = self.shared.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
        self.shared.dying.store(true, Ordering::SeqCst);
    }

    /// Submit a job; blocks the caller while the queue is full. Returns a
    /// handle whose `wait()` blocks until the job has run.
    pub fn queue_job<F>(&self, f: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let completion = Arc::new(JobCompletion {
            done: Mutex::new(false),
            cvar: Condvar::new(),
        });
        let completion_for_job = completion.clone();

        let job: Job = Box::new(move || {
            f();
            let mut done = completion_for_job.done.lock().unwrap();
            *done = true;
            completion_for_job.cvar.notify_all();
        });

        let sender_guard = self.shared.sender.lock().unwrap();
        if let Some(sender) = sender_guard.as_ref() {
            sender.send(job).expect("pool worker threads outlive submitters");
        } else {
            drop(sender_guard);
            job();
        }

        JobHandle { completion }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.shared.client_count.load(Ordering::SeqCst) > 0 {
            self.stop_workers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn runs_jobs_and_waits_for_completion() {
        let pool = ThreadPool::new(4);
        pool.client_increase();

        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let counter = counter.clone();
            handles.push(pool.queue_job(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.wait();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        pool.client_decrease();
    }

    #[test]
    fn worker_count_is_clamped_to_at_least_one() {
        let pool = ThreadPool::new(0);
        assert!(pool.worker_count() >= 1);
    }
}
