//! Per-session progress bus.
//!
//! Single-writer-multi-reader snapshots over a watch channel: the session
//! executor publishes after every point, pollers borrow the latest snapshot.
//! Readers never observe partial updates and a slow (or absent) subscriber
//! never slows the engine.

use crate::model::SessionSnapshot;
use tokio::sync::watch;

/// Write side, owned by the session executor.
pub struct ProgressBus {
    tx: watch::Sender<SessionSnapshot>,
}

impl ProgressBus {
    /// Create the bus with its initial snapshot.
    pub fn new(initial: SessionSnapshot) -> (Self, watch::Receiver<SessionSnapshot>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, rx)
    }

    /// Publish a new snapshot. Never blocks.
    pub fn publish(&self, snapshot: SessionSnapshot) {
        // send only fails when every receiver is gone; pollers may come back
        // later via subscribe, so keep the latest value regardless.
        self.tx.send_replace(snapshot);
    }

    /// Latest published snapshot.
    pub fn latest(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }

    /// A fresh receiver for an observer.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SessionSnapshot, SessionStatus, TestSession};

    fn snapshot(executed: u32) -> SessionSnapshot {
        let session = TestSession::new("SN1", "st1", None, false);
        let mut snap = SessionSnapshot::from_session(&session);
        snap.executed = executed;
        snap.status = SessionStatus::Running;
        snap
    }

    #[tokio::test]
    async fn readers_observe_the_latest_snapshot() {
        let (bus, rx) = ProgressBus::new(snapshot(0));
        bus.publish(snapshot(1));
        bus.publish(snapshot(2));
        assert_eq!(rx.borrow().executed, 2);
        assert_eq!(bus.latest().executed, 2);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let (bus, rx) = ProgressBus::new(snapshot(0));
        drop(rx);
        bus.publish(snapshot(5));
        assert_eq!(bus.latest().executed, 5);
    }
}
