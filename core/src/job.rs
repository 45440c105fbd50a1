//! Background jobs.
//!
//! RULE: a job owns everything it touches. It gets its own store connection
//! and shared handles only to thread-safe parts (queue, clock), then runs on a
//! JobRunner thread until stopped.

use crate::{
    audit_service::{flush_queue, AuditQueue},
    clock::Clock,
    error::NexoResult,
    store::Store,
};
use std::sync::{
    mpsc::{self, RecvTimeoutError},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub trait PeriodicJob: Send {
    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    /// One unit of work. Errors are logged by the runner; the job keeps its
    /// schedule.
    fn run_once(&mut self) -> NexoResult<()>;
}

/// Runs a job every `interval` on a dedicated thread. The job also runs once
/// more when the runner stops.
#[derive(Debug)]
pub struct JobRunner {
    name: &'static str,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl JobRunner {
    pub fn spawn(mut job: Box<dyn PeriodicJob>, interval: Duration) -> Self {
        let name = job.name();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            log::info!("job {name} started, interval {interval:?}");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => run_logged(job.as_mut()),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            run_logged(job.as_mut());
            log::info!("job {name} stopped");
        });
        Self {
            name,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the thread and wait for its final run.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("job {} panicked", self.name);
            }
        }
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_logged(job: &mut dyn PeriodicJob) {
    if let Err(e) = job.run_once() {
        log::error!("job {} failed: {e}", job.name());
    }
}

// ── Audit flush ────────────────────────────────────────────────

pub struct AuditFlushJob {
    store: Store,
    queue: Arc<dyn AuditQueue>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl AuditFlushJob {
    pub fn new(store: Store, queue: Arc<dyn AuditQueue>, clock: Arc<dyn Clock>, batch_size: usize) -> Self {
        Self { store, queue, clock, batch_size }
    }
}

impl PeriodicJob for AuditFlushJob {
    fn name(&self) -> &'static str {
        "audit_flush"
    }

    /// Drains the whole backlog in `batch_size` transactions, so the final
    /// run on stop leaves nothing behind in memory.
    fn run_once(&mut self) -> NexoResult<()> {
        let batch_size = self.batch_size.max(1);
        let mut total = 0;
        while !self.queue.is_empty() {
            total += flush_queue(&self.store, self.queue.as_ref(), batch_size, self.clock.now())?;
        }
        if total > 0 {
            log::debug!("audit flush tick wrote {total} entries");
        }
        Ok(())
    }
}
