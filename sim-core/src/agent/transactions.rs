//! Multi-packet transaction bookkeeping (§4.3, §9 design notes).
//!
//! Each outbound transactional protocol is labeled with a caller-generated
//! `transactionId` and parked on a single-use rendezvous. The reader fiber
//! never blocks on it — when an ack with a matching id arrives, the
//! dispatcher posts the result into the slot and retires the entry. A
//! deadline (default: end of step) resolves the wait as a failure if no ack
//! shows up in time.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::TransactionError;
use crate::packet::PacketBody;

/// Default transaction deadline: one step's worth of wall-clock budget. The
/// runtime is handed the actual step duration at construction so tests can
/// use a short one.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TransactionTable {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<PacketBody>>>,
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTable {
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }

    /// Register a new outstanding transaction and return a waiter future.
    pub fn begin(&self, id: Uuid) -> TransactionWaiter {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        TransactionWaiter { id, rx }
    }

    /// Called by the dispatcher when an ack with a known transaction id
    /// arrives. Returns `true` if a waiter was actually resolved (i.e. the
    /// ack wasn't a duplicate / late / unmatched — §8's uniqueness property).
    pub fn resolve(&self, id: Uuid, body: PacketBody) -> bool {
        if let Some(tx) = self.pending.lock().remove(&id) {
            tx.send(body).is_ok()
        } else {
            false
        }
    }

    /// Cancel every outstanding transaction, e.g. on `KILL_PIPE_AGENT`. The
    /// senders are simply dropped, so waiters observe a closed channel.
    pub fn cancel_all(&self) {
        self.pending.lock().clear();
    }

    pub fn outstanding_count(&self) -> usize {
        self.pending.lock().len()
    }
}

pub struct TransactionWaiter {
    id: Uuid,
    rx: oneshot::Receiver<PacketBody>,
}

impl TransactionWaiter {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Await the ack with the deadline applied. `Err` covers both timeout
    /// and cancellation/shutdown.
    pub async fn wait(self, timeout: Duration) -> Result<PacketBody, TransactionError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(TransactionError::ShuttingDown),
            Err(_) => Err(TransactionError::TimedOut(self.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_completes_the_waiter() {
        let table = TransactionTable::new();
        let id = Uuid::new_v4();
        let waiter = table.begin(id);
        assert!(table.resolve(id, PacketBody::TickBlockedAck));
        let got = waiter.wait(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(got, PacketBody::TickBlockedAck));
    }

    #[tokio::test]
    async fn unmatched_ack_resolves_nothing() {
        let table = TransactionTable::new();
        assert!(!table.resolve(Uuid::new_v4(), PacketBody::TickBlockedAck));
    }

    #[tokio::test]
    async fn timeout_without_an_ack() {
        let table = TransactionTable::new();
        let waiter = table.begin(Uuid::new_v4());
        let result = waiter.wait(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(TransactionError::TimedOut(_))));
    }

    #[tokio::test]
    async fn cancel_all_resolves_waiters_as_shutting_down() {
        let table = TransactionTable::new();
        let id = Uuid::new_v4();
        let waiter = table.begin(id);
        table.cancel_all();
        let result = waiter.wait(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransactionError::ShuttingDown)));
    }
}
