//! Session observation channel.
//!
//! Two kinds of notification flow through one broadcast channel:
//! explicit in-process session changes (emitted by the token store on every
//! save/clear and by the refresh coordinator) and storage-level change events
//! (emitted by storage backends that can see writes, including writes from
//! other clients sharing the same medium). The session guard subscribes here
//! and never has to care which environment it runs in.

use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 64;

/// In-process session-changed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionChange {
    pub is_authenticated: bool,
    /// Set when the change comes from a successful token rotation.
    pub refreshed: bool,
}

/// A single key mutation in the persisted session storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl StorageEvent {
    /// A value appeared where there was none.
    pub fn is_addition(&self) -> bool {
        self.old_value.is_none() && self.new_value.is_some()
    }

    /// A previously present value was removed.
    pub fn is_removal(&self) -> bool {
        self.old_value.is_some() && self.new_value.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Changed(SessionChange),
    Storage(StorageEvent),
}

/// Broadcast hub for [`SessionEvent`]s.
///
/// Cloning is cheap; all clones publish to the same subscribers.
#[derive(Debug, Clone)]
pub struct SessionObserver {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionObserver {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events. Dropping the subscription unsubscribes.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit_change(&self, is_authenticated: bool, refreshed: bool) {
        self.emit(SessionEvent::Changed(SessionChange {
            is_authenticated,
            refreshed,
        }));
    }

    pub fn emit_storage(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        self.emit(SessionEvent::Storage(StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
        }));
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SessionObserver {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to a [`SessionObserver`].
pub struct Subscription {
    rx: broadcast::Receiver<SessionEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll, used where the caller only drains what is queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
