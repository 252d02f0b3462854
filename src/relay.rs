//! Routes payment events to downstream sessions by `externalId`.
//!
//! A relay owns its own session table and one subscription on the stream's
//! registry. Dropping the relay removes that subscription; dropping a
//! session's receiver retires the session on its next delivery.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::stream::client::PaymentStream;
use crate::stream::dispatch::{SubscriberError, SubscriberRegistry, SubscriptionId};
use crate::stream::proto::{NodeEvent, PaymentReceived};

type Sessions = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<PaymentReceived>>>>;

/// Per-session fan-in of payment notifications.
#[derive(Debug)]
pub struct PaymentRelay {
    sessions: Sessions,
    registry: Arc<SubscriberRegistry>,
    subscription: SubscriptionId,
}

impl PaymentRelay {
    /// Subscribes a new relay to `stream`.
    pub fn attach(stream: &PaymentStream) -> Self {
        Self::attach_to(stream.registry())
    }

    /// Subscribes a new relay directly to a registry.
    pub fn attach_to(registry: Arc<SubscriberRegistry>) -> Self {
        let sessions: Sessions = Arc::new(RwLock::new(HashMap::new()));
        let routed = Arc::clone(&sessions);
        let subscription = registry.subscribe(move |payload| route(&routed, payload));
        Self {
            sessions,
            registry,
            subscription,
        }
    }

    /// Registers a session and returns its event receiver.
    ///
    /// Registering an id that is already present replaces the old session;
    /// the previous receiver sees its channel close.
    pub fn register_session(
        &self,
        external_id: impl Into<String>,
    ) -> mpsc::UnboundedReceiver<PaymentReceived> {
        let external_id = external_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let replaced = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(external_id.clone(), tx)
            .is_some();
        debug!(event = "session_registered", external_id = %external_id, replaced);
        rx
    }

    pub fn unregister_session(&self, external_id: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(external_id)
            .is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for PaymentRelay {
    fn drop(&mut self) {
        self.registry.unsubscribe(self.subscription);
    }
}

fn route(sessions: &Sessions, payload: &str) -> Result<(), SubscriberError> {
    let payment = match NodeEvent::from_text(payload)? {
        NodeEvent::PaymentReceived(payment) => payment,
        NodeEvent::Unknown => {
            debug!(event = "relay_ignored", reason = "unhandled event type");
            return Ok(());
        }
    };

    let Some(external_id) = payment.external_id.clone() else {
        debug!(event = "relay_ignored", reason = "missing external id", payment_hash = %payment.payment_hash);
        return Ok(());
    };

    let sender = sessions
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&external_id)
        .cloned();
    let Some(sender) = sender else {
        debug!(event = "relay_ignored", reason = "no session", external_id = %external_id);
        return Ok(());
    };

    let payment_hash = payment.payment_hash.clone();
    if sender.send(payment).is_err() {
        let mut sessions = sessions.write().unwrap_or_else(PoisonError::into_inner);
        // A newer registration under the same id may have replaced this one.
        if sessions
            .get(&external_id)
            .is_some_and(|current| current.same_channel(&sender))
        {
            sessions.remove(&external_id);
        }
        info!(event = "session_retired", external_id = %external_id);
        return Ok(());
    }

    info!(event = "payment_relayed", external_id = %external_id, payment_hash = %payment_hash);
    Ok(())
}
