/*!
Serial execution queues.

Every context is bound to one `SerialQueue`: a dedicated, named worker thread
draining a FIFO channel of jobs. Jobs submitted to the same queue never run
concurrently and always run in submission order; different queues run in
parallel.
*/

use crate::{DataStoreError, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::{self, ThreadId};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// FIFO queue backed by a single worker thread
///
/// The worker exits once the queue is dropped and every job already
/// submitted has run.
pub struct SerialQueue {
    label: &'static str,
    sender: Mutex<mpsc::Sender<Job>>,
    worker: ThreadId,
}

impl SerialQueue {
    /// Spawn the worker thread for a new queue
    pub fn new(label: &'static str) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(format!("datastore-{label}"))
            .spawn(move || worker_loop(label, receiver))
            .map_err(|e| {
                DataStoreError::store_attach(format!("failed to spawn {label} queue thread: {e}"))
            })?;

        debug!(queue = label, "Started serial queue");
        Ok(Self {
            label,
            sender: Mutex::new(sender),
            worker: handle.thread().id(),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// True when called from this queue's worker thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.worker
    }

    /// Enqueue `job` and return immediately
    pub fn dispatch<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .lock()
            .send(Box::new(job))
            .map_err(|_| DataStoreError::QueueUnavailable(self.label))
    }

    /// Enqueue `job` and block until it has run, returning its output
    ///
    /// A panic inside `job` is resumed on the calling thread. Calling this
    /// from the queue's own worker would wait on itself forever, so it fails
    /// with `ReentrantWait` instead.
    pub fn dispatch_and_wait<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Err(DataStoreError::ReentrantWait(self.label));
        }

        let (response_tx, response_rx) = mpsc::channel();
        self.dispatch(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(job));
            // The waiter only disappears if its own thread is unwinding.
            let _ = response_tx.send(outcome);
        })?;

        match response_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(DataStoreError::QueueUnavailable(self.label)),
        }
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.label)
            .field("worker", &self.worker)
            .finish()
    }
}

fn worker_loop(label: &'static str, receiver: mpsc::Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(
                queue = label,
                panic = panic_message(payload.as_ref()),
                "Job panicked on serial queue"
            );
        }
    }
    debug!(queue = label, "Serial queue drained and stopped");
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
