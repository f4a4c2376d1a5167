//! Listener/Waiter Facility (spec §4.4, DESIGN NOTES §9): a timed one-shot
//! subscription keyed by event name, URI prefix, and token. Modeled as an
//! explicit named-event dispatch table — `await_event` is the first-class
//! primitive the design notes ask for, in place of ad-hoc emitter
//! add/remove-listener calls.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time;

use crate::coap::Message;
use crate::error::SessionError;

struct Waiter {
    event_name: String,
    uri_prefix: Option<String>,
    token: Option<u8>,
    sender: oneshot::Sender<Message>,
}

/// Owns the set of outstanding waiters for one session.
#[derive(Default)]
pub struct ListenerRegistry {
    waiters: Mutex<Vec<Waiter>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a one-shot waiter and awaits a matching event, or times out
    /// with "Request timed out" (spec §4.4's default 15s listener timeout).
    pub async fn await_event(
        &self,
        event_name: impl Into<String>,
        uri_prefix: Option<String>,
        token: Option<u8>,
        timeout: Duration,
    ) -> Result<Message, SessionError> {
        let (sender, receiver) = oneshot::channel();
        self.waiters.lock().push(Waiter {
            event_name: event_name.into(),
            uri_prefix,
            token,
            sender,
        });
        match time::timeout(timeout, receiver).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(SessionError::Disconnected),
            Err(_) => Err(SessionError::RequestTimedOut),
        }
    }

    /// Dispatches an inbound event by name; the first waiter whose filters
    /// all match is resolved and detached.
    pub fn dispatch(&self, event_name: &str, message: &Message) {
        let mut waiters = self.waiters.lock();
        let position = waiters.iter().position(|waiter| {
            waiter.event_name == event_name
                && waiter
                    .uri_prefix
                    .as_deref()
                    .map_or(true, |prefix| message.uri_path.starts_with(prefix))
                && waiter.token.map_or(true, |token| message.token_key() == Some(token))
        });
        if let Some(position) = position {
            let waiter = waiters.remove(position);
            let _ = waiter.sender.send(message.clone());
        }
    }

    /// Rejects every outstanding waiter; called once from `disconnect` so no
    /// verb is left awaiting a response that will never arrive.
    pub fn reject_all(&self) {
        self.waiters.lock().clear();
    }
}
