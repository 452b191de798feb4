//! Single-threaded background worker queue.
//!
//! All command dispatch and event-channel I/O for one engine runs here, one
//! job at a time, in submission order.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct Worker {
    name: String,
    tx: Option<Sender<Job>>,
    cancelled: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let cancelled = Arc::new(AtomicBool::new(false));
        let thread_cancelled = cancelled.clone();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_jobs(rx, thread_cancelled))
            .with_context(|| format!("spawn worker thread {}", name))?;
        Ok(Self {
            name: name.to_string(),
            tx: Some(tx),
            cancelled,
            join: Some(join),
        })
    }

    /// Queue a job. Returns false once the worker has been shut down.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        match &self.tx {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Drop every queued job, let the running one finish, then join the thread.
    pub fn shutdown_now(&mut self) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.tx.take();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("worker thread {} panicked", self.name))?;
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.join.is_some() {
            if let Err(err) = self.shutdown_now() {
                log::warn!("{}", err);
            }
        }
    }
}

fn run_jobs(rx: Receiver<Job>, cancelled: Arc<AtomicBool>) {
    for job in rx.iter() {
        if cancelled.load(Ordering::SeqCst) {
            continue;
        }
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            log::warn!("Worker: job panicked; continuing with next job");
        }
    }
}
