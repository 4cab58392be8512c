//! Shared ack/reply delivery primitive for connectors (spec §4.5
//! "Source-side outcome delivery").
//!
//! A connector's source-specific `SourceMessage::ack`/`nak` typically
//! needs to hand the outcome back to a handler task that is racing a
//! transport-native timeout. `AckHandle` + [`await_outcome`] package that
//! race once so every connector doesn't reimplement it: `tokio::sync::
//! oneshot`'s sender already consumes itself on send, which gives the
//! one-shot guard for free (spec §8 invariant 1's "capacity 1,
//! non-blocking send guarded by a single-shot guard").

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::message::ReplyData;

/// What a worker decided for one message, carried from the pipeline's Ack
/// coordinator back to the source's handler task.
#[derive(Debug)]
pub enum Outcome {
    Ack { reply: Option<ReplyData> },
    Nak,
}

/// What the source's handler task observed, after folding in its own
/// per-message timeout (spec §4.5's three-way `select`).
#[derive(Debug)]
pub enum DeliveryOutcome {
    Ack(Option<ReplyData>),
    Nak,
    TimedOut,
}

/// The sending half, held by a `SourceMessage` implementation. Cloning is
/// cheap; only the first `ack`/`nak` call actually sends — every later
/// call observes `already_sent` and returns `false` without touching the
/// channel, which is exactly spec §8 invariant 1's "later calls are
/// no-ops and return nil".
pub struct AckHandle {
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl AckHandle {
    /// Build a fresh handle + receiver pair for one message.
    pub fn new() -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Returns `true` if this call actually delivered the outcome.
    pub fn ack(&self, reply: Option<ReplyData>) -> bool {
        self.send(Outcome::Ack { reply })
    }

    /// Returns `true` if this call actually delivered the outcome.
    pub fn nak(&self) -> bool {
        self.send(Outcome::Nak)
    }

    fn send(&self, outcome: Outcome) -> bool {
        let maybe_tx = self.tx.lock().take();
        match maybe_tx {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

/// Race the ack/reply channel against a per-message timeout, as the
/// source's handler task does in spec §4.5. A dropped sender (e.g. the
/// pipeline shut down mid-flight without transitioning the message) is
/// folded into `Nak` rather than surfaced as a channel error, since no
/// in-scope transport distinguishes "no answer" from "answered no".
pub async fn await_outcome(rx: oneshot::Receiver<Outcome>, timeout: Duration) -> DeliveryOutcome {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(Outcome::Ack { reply })) => DeliveryOutcome::Ack(reply),
        Ok(Ok(Outcome::Nak)) => DeliveryOutcome::Nak,
        Ok(Err(_recv_error)) => DeliveryOutcome::Nak,
        Err(_elapsed) => DeliveryOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_the_first_call_is_observed() {
        let (handle, rx) = AckHandle::new();
        assert!(handle.ack(None));
        assert!(!handle.nak());
        assert!(!handle.ack(Some(ReplyData::new("late"))));
        match await_outcome(rx, Duration::from_millis(50)).await {
            DeliveryOutcome::Ack(None) => {}
            other => panic!("expected Ack(None), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_fires_when_nothing_lands_first() {
        let (_handle, rx) = AckHandle::new();
        match await_outcome(rx, Duration::from_millis(20)).await {
            DeliveryOutcome::TimedOut => {}
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }
}
