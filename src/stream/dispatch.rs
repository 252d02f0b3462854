//! Ordered fan-out of received payloads to local subscribers.
//!
//! Each dispatch iterates a snapshot of the registry, so subscribers may be
//! added or removed from any thread (including from inside a callback)
//! without disturbing a delivery that is already in flight.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Identifies one registration in a [`SubscriberRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Failure reported by a subscriber callback.
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// Channel subscriber whose receiver has been dropped.
    #[error("subscriber channel is closed")]
    ChannelClosed,

    /// Payload could not be decoded into the subscriber's event type.
    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// Free-form failure raised by the subscriber itself.
    #[error("{0}")]
    Message(String),
}

impl SubscriberError {
    /// Builds a [`SubscriberError::Message`].
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

type Callback = dyn Fn(&str) -> Result<(), SubscriberError> + Send + Sync;

/// Concurrency-safe, insertion-ordered set of payload callbacks.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<(SubscriptionId, Arc<Callback>)>>,
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback`; it is invoked after every earlier registration.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Arc<Callback> = Arc::new(callback);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        id
    }

    /// Registers a queue-backed subscriber.
    ///
    /// Payloads are pushed onto an unbounded per-subscriber queue, so a slow
    /// consumer never holds up the receive loop. Once the receiver is dropped
    /// each delivery reports [`SubscriberError::ChannelClosed`] until the
    /// subscription is removed.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |payload| {
            tx.send(payload.to_string())
                .map_err(|_| SubscriberError::ChannelClosed)
        });
        (id, rx)
    }

    /// Removes a registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `payload` to every subscriber in registration order.
    ///
    /// Returns the number of subscribers that failed. A failing or panicking
    /// subscriber is logged and skipped; the rest still receive the payload.
    pub fn dispatch(&self, payload: &str) -> usize {
        let snapshot: Vec<(SubscriptionId, Arc<Callback>)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut failures = 0;
        for (id, callback) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    warn!(event = "subscriber_failed", subscription = %id, error = %err);
                }
                Err(panic) => {
                    failures += 1;
                    warn!(
                        event = "subscriber_panicked",
                        subscription = %id,
                        panic = panic_message(panic.as_ref())
                    );
                }
            }
        }
        failures
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.len())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{SubscriberError, SubscriberRegistry};

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    ) -> impl Fn(&str) -> Result<(), SubscriberError> {
        let log = Arc::clone(log);
        move |payload| {
            log.lock().expect("log lock").push(format!("{tag}:{payload}"));
            Ok(())
        }
    }

    #[test]
    fn delivers_in_registration_order() {
        let registry = SubscriberRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.subscribe(recorder(&log, "a"));
        registry.subscribe(recorder(&log, "b"));

        assert_eq!(registry.dispatch("p1"), 0);
        assert_eq!(registry.dispatch("p2"), 0);

        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["a:p1", "b:p1", "a:p2", "b:p2"]
        );
    }

    #[test]
    fn failing_subscriber_does_not_skip_later_ones() {
        let registry = SubscriberRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.subscribe(recorder(&log, "first"));
        registry.subscribe(|_| Err(SubscriberError::msg("boom")));
        registry.subscribe(recorder(&log, "last"));

        assert_eq!(registry.dispatch("p"), 1);
        assert_eq!(*log.lock().expect("log lock"), vec!["first:p", "last:p"]);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let registry = SubscriberRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.subscribe(|_| panic!("subscriber blew up"));
        registry.subscribe(recorder(&log, "after"));

        assert_eq!(registry.dispatch("p"), 1);
        assert_eq!(*log.lock().expect("log lock"), vec!["after:p"]);
        assert_eq!(registry.dispatch("q"), 1);
    }

    #[test]
    fn unsubscribe_removes_only_that_entry() {
        let registry = SubscriberRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = registry.subscribe(recorder(&log, "a"));
        registry.subscribe(recorder(&log, "b"));

        assert!(registry.unsubscribe(a));
        assert!(!registry.unsubscribe(a));
        assert_eq!(registry.len(), 1);

        registry.dispatch("p");
        assert_eq!(*log.lock().expect("log lock"), vec!["b:p"]);
    }

    #[test]
    fn registration_during_dispatch_applies_to_next_payload() {
        let registry = Arc::new(SubscriberRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_registry = Arc::clone(&registry);
        let inner_log = Arc::clone(&log);
        registry.subscribe(move |payload| {
            if payload == "p1" {
                inner_registry.subscribe(recorder(&inner_log, "late"));
            }
            Ok(())
        });

        registry.dispatch("p1");
        assert!(log.lock().expect("log lock").is_empty());

        registry.dispatch("p2");
        assert_eq!(*log.lock().expect("log lock"), vec!["late:p2"]);
    }

    #[test]
    fn self_removal_during_dispatch_is_safe() {
        let registry = Arc::new(SubscriberRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let id_slot = Arc::new(Mutex::new(None));
        let inner_registry = Arc::clone(&registry);
        let inner_slot = Arc::clone(&id_slot);
        let id = registry.subscribe(move |_| {
            if let Some(id) = *inner_slot.lock().expect("slot lock") {
                inner_registry.unsubscribe(id);
            }
            Ok(())
        });
        *id_slot.lock().expect("slot lock") = Some(id);
        registry.subscribe(recorder(&log, "b"));

        registry.dispatch("p1");
        registry.dispatch("p2");
        assert_eq!(registry.len(), 1);
        assert_eq!(*log.lock().expect("log lock"), vec!["b:p1", "b:p2"]);
    }

    #[test]
    fn channel_subscriber_receives_payloads_and_reports_drop() {
        let registry = SubscriberRegistry::new();
        let (_, mut rx) = registry.subscribe_channel();

        assert_eq!(registry.dispatch("p1"), 0);
        assert_eq!(rx.try_recv().expect("queued payload"), "p1");

        drop(rx);
        assert_eq!(registry.dispatch("p2"), 1);
    }
}
