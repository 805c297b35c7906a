use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::oneshot;

use super::envelope::BlazeMessage;

/// Pending request ids mapped to the one-shot slot their reply goes into.
///
/// The lock is never held across an await.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, oneshot::Sender<BlazeMessage>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<BlazeMessage>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, id: impl Into<String>, reply: oneshot::Sender<BlazeMessage>) {
        self.lock().insert(id.into(), reply);
    }

    /// Remove and return the slot for `id`. A given id resolves at most once.
    pub fn resolve(&self, id: &str) -> Option<oneshot::Sender<BlazeMessage>> {
        if id.is_empty() {
            return None;
        }
        self.lock().remove(id)
    }

    /// Hand `msg` to its waiting caller. Returns false when nobody was waiting.
    pub fn complete(&self, msg: BlazeMessage) -> bool {
        let Some(slot) = self.resolve(&msg.id) else {
            return false;
        };
        // A caller that already timed out dropped its receiver; the reply is discarded.
        let _ = slot.send(msg);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_resolves_exactly_once() {
        let c = Correlator::new();
        let (tx, rx) = oneshot::channel();
        c.register("req-1", tx);
        assert_eq!(c.len(), 1);

        let reply = BlazeMessage {
            id: "req-1".to_string(),
            ..Default::default()
        };
        assert!(c.complete(reply.clone()));
        assert!(!c.complete(reply.clone()));
        assert!(c.resolve("req-1").is_none());
        assert!(c.is_empty());

        assert_eq!(rx.await.unwrap(), reply);
    }

    #[test]
    fn unknown_and_empty_ids_do_not_resolve() {
        let c = Correlator::new();
        let (tx, _rx) = oneshot::channel();
        c.register("known", tx);
        assert!(c.resolve("").is_none());
        assert!(c.resolve("other").is_none());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn completing_after_caller_gave_up_is_harmless() {
        let c = Correlator::new();
        let (tx, rx) = oneshot::channel();
        c.register("late", tx);
        drop(rx);
        assert!(c.complete(BlazeMessage {
            id: "late".to_string(),
            ..Default::default()
        }));
        assert!(c.is_empty());
    }
}
