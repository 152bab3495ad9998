#[cfg(test)]
mod queue_test;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Byte caps for a send queue.
///
/// A specific cap configured for a (service, method) pair overrides the
/// general cap for frames of that pair; frames without a specific cap fall
/// back to the general one. A cap of zero means unbounded.
#[derive(Debug, Clone, Default)]
pub struct QueueLimits {
    pub max_bytes: usize,
    pub specific: HashMap<(u16, u16), usize>,
}

impl QueueLimits {
    pub fn bounded(max_bytes: usize) -> Self {
        QueueLimits {
            max_bytes,
            specific: HashMap::new(),
        }
    }
}

/// One marshaled frame awaiting transmission.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub data: Bytes,
    pub service: u16,
    pub method: u16,
    pub is_response: bool,
    /// Destination for unconnected (UDP server) endpoints.
    pub target: Option<std::net::SocketAddr>,
}

impl OutboundFrame {
    fn key(&self) -> (u16, u16) {
        (self.service, self.method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Open,
    /// Shutdown grace: only queued responses are still handed out.
    Draining,
    Closed,
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<OutboundFrame>,
    bytes: usize,
    per_key: HashMap<(u16, u16), usize>,
    mode: Mode,
}

/// Bounded, strictly ordered outbound queue.
///
/// Writers block in [`SendQueue::dequeue`]; enqueuing wakes the writer only
/// when the queue was empty, so a busy writer is never re-notified.
#[derive(Debug)]
pub struct SendQueue {
    limits: QueueLimits,
    notify: Notify,
    inner: Mutex<Inner>,
}

impl SendQueue {
    pub fn new(limits: QueueLimits) -> Self {
        SendQueue {
            limits,
            notify: Notify::new(),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                bytes: 0,
                per_key: HashMap::new(),
                mode: Mode::Open,
            }),
        }
    }

    /// Appends a frame. Ownership of the buffer moves into the queue.
    pub fn enqueue(&self, frame: OutboundFrame) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode != Mode::Open {
            return Err(Error::ErrClosed);
        }

        let len = frame.data.len();
        match self.limits.specific.get(&frame.key()) {
            Some(cap) => {
                let used = inner.per_key.get(&frame.key()).copied().unwrap_or(0);
                if *cap != 0 && used + len > *cap {
                    return Err(Error::ErrQueueFull);
                }
            }
            None => {
                if self.limits.max_bytes != 0 && inner.bytes + len > self.limits.max_bytes {
                    return Err(Error::ErrQueueFull);
                }
            }
        }

        let was_empty = inner.queue.is_empty();
        inner.bytes += len;
        if self.limits.specific.contains_key(&frame.key()) {
            *inner.per_key.entry(frame.key()).or_insert(0) += len;
        }
        inner.queue.push_back(frame);
        drop(inner);

        if was_empty {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Takes the next frame, waiting until one is available. Returns `None`
    /// once the queue is closed (or a draining queue ran out of responses).
    pub async fn dequeue(&self) -> Option<OutboundFrame> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                match inner.mode {
                    Mode::Closed => return None,
                    Mode::Open => {
                        if let Some(frame) = inner.queue.pop_front() {
                            Self::account_out(&mut inner, &frame);
                            return Some(frame);
                        }
                    }
                    Mode::Draining => {
                        let pos = inner.queue.iter().position(|f| f.is_response);
                        match pos {
                            Some(i) => {
                                let frame = inner.queue.remove(i).unwrap();
                                Self::account_out(&mut inner, &frame);
                                return Some(frame);
                            }
                            None => {
                                // grace period over, requests are discarded
                                inner.queue.clear();
                                inner.bytes = 0;
                                inner.per_key.clear();
                                inner.mode = Mode::Closed;
                                return None;
                            }
                        }
                    }
                }
            }
            notified.await;
        }
    }

    fn account_out(inner: &mut Inner, frame: &OutboundFrame) {
        inner.bytes -= frame.data.len();
        if let Some(used) = inner.per_key.get_mut(&frame.key()) {
            *used -= frame.data.len();
        }
    }

    /// Wakes the writer if it is parked on an empty queue.
    pub fn flush(&self) {
        self.notify.notify_one();
    }

    /// Begins the shutdown grace: queued responses still go out, queued
    /// requests are discarded once no response remains.
    pub fn close_graceful(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode == Mode::Open {
            inner.mode = Mode::Draining;
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Closes immediately, dropping everything still queued.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.mode = Mode::Closed;
        inner.queue.clear();
        inner.bytes = 0;
        inner.per_key.clear();
        drop(inner);
        self.notify.notify_one();
    }

    /// Drops all queued frames but keeps the queue usable. Used on
    /// reconnect when `queue_on_reconnect` is off.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        inner.bytes = 0;
        inner.per_key.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().unwrap().bytes
    }
}
