use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A unit of work handed to a [`WorkerPool`] or [`Scheduler`].
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Supplies threads for participant and settler tasks.
///
/// Queueing is unbounded and unprioritized.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, work: Work);
}

/// Runs work after a delay. Used to resubmit tasks that asked to be retried.
pub trait Scheduler: Send + Sync {
    fn schedule_retry(&self, work: Work, after: Duration);
}

/// Commands sent to worker threads.
enum PoolCommand {
    Run(Work),
    Shutdown,
}

/// A fixed-size pool of worker threads fed by an unbounded channel.
pub struct ThreadPool {
    sender: Sender<PoolCommand>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ThreadPool {
    /// Starts `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let (sender, receiver) = unbounded::<PoolCommand>();
        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("maat-worker-{}", index))
                .spawn(move || worker_loop(receiver));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!("Failed to spawn worker thread {}: {}", index, e),
            }
        }

        Self {
            sender,
            workers: Mutex::new(workers),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Stops every worker after the work already queued ahead of the
    /// shutdown commands has run. Work submitted afterwards is dropped.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for _ in 0..workers.len() {
            let _ = self.sender.send(PoolCommand::Shutdown);
        }
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if let Err(e) = worker.join() {
                error!("Failed to join worker thread: {:?}", e);
            }
        }
    }
}

impl WorkerPool for ThreadPool {
    fn submit(&self, work: Work) {
        if self.shut_down.load(Ordering::SeqCst) {
            debug!("Worker pool is shut down, dropping submitted work");
            return;
        }
        if self.sender.send(PoolCommand::Run(work)).is_err() {
            debug!("Worker pool channel closed, dropping submitted work");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<PoolCommand>) {
    while let Ok(command) = receiver.recv() {
        match command {
            PoolCommand::Run(work) => {
                if catch_unwind(AssertUnwindSafe(work)).is_err() {
                    error!("Task panicked on worker thread {:?}", thread::current().name());
                }
            }
            PoolCommand::Shutdown => break,
        }
    }
}

/// Commands sent to the timer thread.
enum TimerCommand {
    Schedule(Instant, Work),
    Shutdown,
}

struct TimerEntry {
    due: Instant,
    seq: u64,
    work: Work,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A delay-capable scheduler backed by one timer thread.
///
/// Due work runs on the timer thread itself, so scheduled closures should be
/// cheap; retry drivers only use it to resubmit into a [`WorkerPool`].
pub struct TimerScheduler {
    sender: Sender<TimerCommand>,
    timer: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerScheduler {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded::<TimerCommand>();
        let timer = thread::Builder::new()
            .name("maat-timer".to_string())
            .spawn(move || timer_loop(receiver));
        let timer = match timer {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to spawn timer thread: {}", e);
                None
            }
        };

        Self {
            sender,
            timer: Mutex::new(timer),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Stops the timer thread. Pending work is dropped.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sender.send(TimerCommand::Shutdown);
        if let Some(timer) = self.timer.lock().take() {
            if timer.thread().id() == thread::current().id() {
                return;
            }
            if let Err(e) = timer.join() {
                error!("Failed to join timer thread: {:?}", e);
            }
        }
    }
}

impl Scheduler for TimerScheduler {
    fn schedule_retry(&self, work: Work, after: Duration) {
        if self.shut_down.load(Ordering::SeqCst) {
            debug!("Scheduler is shut down, dropping retry");
            return;
        }
        let due = Instant::now() + after;
        if self.sender.send(TimerCommand::Schedule(due, work)).is_err() {
            debug!("Scheduler channel closed, dropping retry");
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(receiver: Receiver<TimerCommand>) {
    let mut pending: BinaryHeap<TimerEntry> = BinaryHeap::new();
    let mut next_seq: u64 = 0;

    loop {
        let now = Instant::now();
        while pending.peek().is_some_and(|entry| entry.due <= now) {
            if let Some(entry) = pending.pop() {
                if catch_unwind(AssertUnwindSafe(entry.work)).is_err() {
                    error!("Scheduled work panicked on timer thread");
                }
            }
        }

        let command = match pending.peek() {
            Some(entry) => {
                let wait = entry.due.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match receiver.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            TimerCommand::Schedule(due, work) => {
                pending.push(TimerEntry {
                    due,
                    seq: next_seq,
                    work,
                });
                next_seq += 1;
            }
            TimerCommand::Shutdown => {
                debug!("Timer thread shutting down, dropping {} pending", pending.len());
                break;
            }
        }
    }
}
