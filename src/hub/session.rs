//! Hub-side view of a downstream session
//!
//! The handle is shared by the session's two network tasks and the hub. It
//! owns the sending half of the bounded outbound queue, the set of keys the
//! session is subscribed to, and a one-shot teardown signal.

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::protocol::SubscriptionKey;

/// Unique session identifier
pub type SessionId = u64;

/// Why a frame could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Queue saturated: the session is not keeping up
    Full,
    /// Outbound side already gone
    Closed,
}

pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<Bytes>,
    keys: Mutex<HashSet<SubscriptionKey>>,
    closed: watch::Sender<bool>,
    last_seen: AtomicI64,
}

impl SessionHandle {
    /// Create a handle and the receiving half of its outbound queue
    pub fn new(id: SessionId, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        let handle = Self {
            id,
            tx,
            keys: Mutex::new(HashSet::new()),
            closed,
            last_seen: AtomicI64::new(Utc::now().timestamp_millis()),
        };
        (handle, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a frame without waiting
    pub fn try_deliver(&self, frame: Bytes) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Fire the teardown signal. Returns true only for the first caller.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Receiver that observes the teardown signal
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Record liveness (any inbound frame or pong)
    pub fn touch(&self) {
        self.last_seen
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Time since the peer was last heard from
    pub fn idle_for(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis() - self.last_seen.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    /// Keys this session currently owns
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.keys.lock().iter().cloned().collect();
        keys.sort();
        keys
    }

    pub(crate) fn add_key(&self, key: SubscriptionKey) {
        self.keys.lock().insert(key);
    }

    pub(crate) fn remove_key(&self, key: &SubscriptionKey) {
        self.keys.lock().remove(key);
    }

    pub(crate) fn take_keys(&self) -> HashSet<SubscriptionKey> {
        std::mem::take(&mut *self.keys.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_first_wins() {
        let (handle, _rx) = SessionHandle::new(1, 4);
        assert!(handle.close());
        assert!(!handle.close());
        assert!(handle.is_closed());
    }

    #[test]
    fn test_try_deliver_reports_full_and_closed() {
        let (handle, rx) = SessionHandle::new(1, 1);
        assert_eq!(handle.try_deliver(Bytes::from_static(b"a")), Ok(()));
        assert_eq!(
            handle.try_deliver(Bytes::from_static(b"b")),
            Err(DeliveryError::Full)
        );

        drop(rx);
        assert_eq!(
            handle.try_deliver(Bytes::from_static(b"c")),
            Err(DeliveryError::Closed)
        );
    }

    #[tokio::test]
    async fn test_shutdown_signal_observes_close() {
        let (handle, _rx) = SessionHandle::new(9, 4);
        let mut signal = handle.shutdown_signal();
        handle.close();
        assert!(signal.wait_for(|closed| *closed).await.is_ok());
    }
}
