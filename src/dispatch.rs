//! Bounded dispatch workers for user callbacks.
//!
//! Handlers registered on an [`crate::Application`] never run on the I/O
//! tasks: inbound work is pushed onto a bounded queue drained by a small
//! pool of dedicated threads, so a blocking callback stalls at most one
//! worker and never the network. The queue doubles as the application's
//! backpressure watermark: when it is full, [`Dispatcher::try_dispatch`]
//! fails and the caller decides between an `E_NOT_READY` reply (requests)
//! and a silent drop (notifications).

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

/// Handle to one application's dispatch queue.
#[derive(Clone)]
pub struct Dispatcher {
    tx: SyncSender<Job>,
}

impl Dispatcher {
    /// Spawns `workers` threads sharing one queue of depth `watermark`.
    pub fn new(name: &str, workers: usize, watermark: usize) -> Self {
        let (tx, rx) = sync_channel::<Job>(watermark.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for index in 0..workers.max(1) {
            let rx = rx.clone();
            let _ = thread::Builder::new()
                .name(format!("{name}-dispatch-{index}"))
                .spawn(move || worker_loop(rx));
        }

        Dispatcher { tx }
    }

    /// Enqueues a callback; fails when the watermark is reached.
    pub fn try_dispatch<F>(&self, job: F) -> Result<(), QueueFull>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.tx.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => Err(QueueFull),
        }
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let rx = match rx.lock() {
                Ok(rx) => rx,
                Err(_) => return,
            };
            rx.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}
