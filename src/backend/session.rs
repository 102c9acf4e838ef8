//! Per-connection state shared between the receive loop and responders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, trace};

use super::buffer::BufferBudget;
use super::request::Request;
use crate::protocol::StreamKey;
use crate::transport::{RecvResult, SendResult, Transport};

/// Lock a mutex, carrying on if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One connection to the front-end.
///
/// Requests hold a weak reference back to their session so that a
/// response can be sent from any thread, and so that a request reaching
/// the end of its life can remove itself from the stream table.
pub(crate) struct Session {
    transport: Box<dyn Transport>,
    /// Held for the whole of a frame so concurrent responses never interleave.
    send_lock: Mutex<()>,
    streams: Mutex<HashMap<StreamKey, Arc<Request>>>,
    budget: Arc<BufferBudget>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(transport: Box<dyn Transport>, budget: Arc<BufferBudget>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            send_lock: Mutex::new(()),
            streams: Mutex::new(HashMap::new()),
            budget,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn budget(&self) -> &Arc<BufferBudget> {
        &self.budget
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one encoded frame, retrying until the transport took all of it.
    pub(crate) fn send_frame(&self, frame: &[u8]) -> SendResult {
        let _guard = lock(&self.send_lock);
        let mut rest = frame;
        loop {
            if self.is_closed() {
                return SendResult::Closed;
            }
            match self.transport.send(rest) {
                SendResult::All => return SendResult::All,
                SendResult::BufferFull(sent) => {
                    trace!(sent, remaining = rest.len() - sent, "Transport send buffer full");
                    rest = &rest[sent..];
                    if sent == 0 {
                        thread::yield_now();
                    }
                }
                SendResult::Closed => {
                    debug!("Transport closed while sending");
                    self.closed.store(true, Ordering::Release);
                    return SendResult::Closed;
                }
            }
        }
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> RecvResult {
        if self.is_closed() {
            return RecvResult::Closed;
        }
        let result = self.transport.recv(buf);
        if result == RecvResult::Closed {
            self.closed.store(true, Ordering::Release);
        }
        result
    }

    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.transport.shutdown();
    }

    /// Add a request to the stream table. Returns `false` if its key is taken.
    pub(crate) fn register(&self, request: &Arc<Request>) -> bool {
        let mut streams = lock(&self.streams);
        if streams.contains_key(&request.key()) {
            return false;
        }
        streams.insert(request.key(), Arc::clone(request));
        true
    }

    pub(crate) fn lookup(&self, key: StreamKey) -> Option<Arc<Request>> {
        lock(&self.streams).get(&key).cloned()
    }

    /// Remove `request` from the stream table, unless its key has since been
    /// taken by a different request.
    pub(crate) fn unregister(&self, request: &Arc<Request>) {
        let mut streams = lock(&self.streams);
        if streams
            .get(&request.key())
            .is_some_and(|current| Arc::ptr_eq(current, request))
        {
            streams.remove(&request.key());
        }
    }

    pub(crate) fn active_streams(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Every live request, in no particular order.
    pub(crate) fn requests(&self) -> Vec<Arc<Request>> {
        lock(&self.streams).values().cloned().collect()
    }
}
