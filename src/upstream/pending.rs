//! Request/response correlation slots
//!
//! A slot is opened before the request is written and removed when its
//! guard drops, whether the response arrived, the wait timed out, or the
//! send itself failed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{GatewayError, Result};
use crate::protocol::PostResponseBody;

type Slot = oneshot::Sender<Result<PostResponseBody>>;

#[derive(Default)]
pub struct PendingRequests {
    slots: Mutex<HashMap<u64, Slot>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the slot for `id`
    pub fn open(self: &Arc<Self>, id: u64) -> PendingSlot {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id, tx);
        PendingSlot {
            id,
            rx,
            owner: Arc::clone(self),
        }
    }

    /// Hand a response to its waiter. False when nobody is waiting anymore.
    pub fn complete(&self, id: u64, response: PostResponseBody) -> bool {
        match self.slots.lock().remove(&id) {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Fail every open slot; returns how many there were
    pub fn abandon_all(&self) -> usize {
        let slots: Vec<(u64, Slot)> = self.slots.lock().drain().collect();
        let count = slots.len();
        for (id, tx) in slots {
            let _ = tx.send(Err(GatewayError::RequestAbandoned(id)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct PendingSlot {
    id: u64,
    rx: oneshot::Receiver<Result<PostResponseBody>>,
    owner: Arc<PendingRequests>,
}

impl PendingSlot {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response, at most `limit`
    pub async fn wait(mut self, limit: Duration) -> Result<PostResponseBody> {
        match tokio::time::timeout(limit, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::RequestAbandoned(self.id)),
            Err(_) => Err(GatewayError::RequestTimeout(self.id)),
        }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.owner.slots.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body() -> PostResponseBody {
        PostResponseBody {
            kind: "info".to_string(),
            payload: json!({"ok": true}),
        }
    }

    #[tokio::test]
    async fn test_response_reaches_waiter() {
        let pending = Arc::new(PendingRequests::new());
        let slot = pending.open(1);
        assert!(pending.complete(1, body()));
        assert_eq!(slot.wait(Duration::from_secs(1)).await.unwrap(), body());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_slot() {
        let pending = Arc::new(PendingRequests::new());
        let slot = pending.open(2);
        let result = slot.wait(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(GatewayError::RequestTimeout(2))));
        assert!(pending.is_empty());
        assert!(!pending.complete(2, body()));
    }

    #[tokio::test]
    async fn test_abandon_fails_waiters() {
        let pending = Arc::new(PendingRequests::new());
        let a = pending.open(3);
        let b = pending.open(4);
        assert_eq!(pending.abandon_all(), 2);

        assert!(matches!(
            a.wait(Duration::from_secs(1)).await,
            Err(GatewayError::RequestAbandoned(3))
        ));
        assert!(matches!(
            b.wait(Duration::from_secs(1)).await,
            Err(GatewayError::RequestAbandoned(4))
        ));
    }

    #[tokio::test]
    async fn test_wait_stays_pending_until_completed() {
        let pending = Arc::new(PendingRequests::new());
        let mut wait = tokio_test::task::spawn(pending.open(6).wait(Duration::from_secs(60)));

        tokio_test::assert_pending!(wait.poll());
        assert_eq!(pending.len(), 1);

        assert!(pending.complete(6, body()));
        assert!(wait.is_woken());
        let result = tokio_test::assert_ready!(wait.poll());
        tokio_test::assert_ok!(result);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_dropped_slot_is_removed() {
        let pending = Arc::new(PendingRequests::new());
        drop(pending.open(5));
        assert!(pending.is_empty());
    }
}
