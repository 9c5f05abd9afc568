use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::message::Envelope;

/// Outstanding request/reply calls keyed by correlation id.
///
/// An entry is removed exactly once: by the first matching reply, or when
/// the caller's [`PendingCall`] goes away (timeout, error, or the calling
/// future being dropped). Later replies for the same id find nothing and
/// are discarded.
#[derive(Debug, Default)]
pub struct PendingCalls {
    waiters: Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Envelope>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start waiting for `correlation_id`. The entry lives as long as the
    /// returned handle.
    pub fn register(self: &Arc<Self>, correlation_id: Uuid) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(correlation_id, tx);
        PendingCall {
            correlation_id,
            rx,
            calls: Arc::clone(self),
        }
    }

    /// Hand a reply to its waiter. Returns `false` for unknown or duplicate replies.
    pub fn resolve(&self, correlation_id: Uuid, reply: Envelope) -> bool {
        let waiter = self.waiters().remove(&correlation_id);
        match waiter {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    debug!(correlation_id = %correlation_id, "caller stopped waiting before reply arrived");
                }
                true
            }
            None => {
                debug!(correlation_id = %correlation_id, "discarding reply for unknown correlation id");
                false
            }
        }
    }

    pub fn cancel(&self, correlation_id: Uuid) {
        self.waiters().remove(&correlation_id);
    }

    pub fn len(&self) -> usize {
        self.waiters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One caller's claim on a reply. Dropping it withdraws the waiter.
#[derive(Debug)]
pub struct PendingCall {
    correlation_id: Uuid,
    rx: oneshot::Receiver<Envelope>,
    calls: Arc<PendingCalls>,
}

impl PendingCall {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Wait for the reply; errors only if the waiter was cancelled.
    pub async fn reply(&mut self) -> Result<Envelope, oneshot::error::RecvError> {
        (&mut self.rx).await
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.calls.cancel(self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(n: u32) -> Envelope {
        Envelope::json("reply", &n).unwrap()
    }

    #[tokio::test]
    async fn first_reply_wins_and_duplicates_are_discarded() {
        let pending = Arc::new(PendingCalls::new());
        let cid = Uuid::new_v4();
        let mut call = pending.register(cid);

        assert!(pending.resolve(cid, reply(1)));
        assert!(!pending.resolve(cid, reply(2)));

        let got = call.reply().await.unwrap();
        assert_eq!(got.decode::<u32>().unwrap(), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn cancelled_call_ignores_late_reply() {
        let pending = Arc::new(PendingCalls::new());
        let cid = Uuid::new_v4();
        let _call = pending.register(cid);

        pending.cancel(cid);
        assert!(!pending.resolve(cid, reply(1)));
    }

    #[test]
    fn dropped_call_withdraws_its_waiter() {
        let pending = Arc::new(PendingCalls::new());
        let cid = Uuid::new_v4();
        let call = pending.register(cid);
        assert_eq!(pending.len(), 1);

        drop(call);
        assert!(pending.is_empty());
        assert!(!pending.resolve(cid, reply(1)));
    }

    #[tokio::test]
    async fn unrelated_ids_do_not_interfere() {
        let pending = Arc::new(PendingCalls::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut call_a = pending.register(a);
        let mut call_b = pending.register(b);

        pending.resolve(b, reply(2));
        pending.resolve(a, reply(1));

        assert_eq!(call_a.reply().await.unwrap().decode::<u32>().unwrap(), 1);
        assert_eq!(call_b.reply().await.unwrap().decode::<u32>().unwrap(), 2);
    }
}
