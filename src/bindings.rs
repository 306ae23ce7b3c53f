//! Per-channel event subscriptions.
//!
//! An ordered multimap: each event name maps to the callbacks registered for
//! it, in registration order. Registering the same closure twice yields two
//! entries and two invocations per broadcast. Catch-all callbacks see every
//! dispatched event after the event's own callbacks.

use std::collections::HashMap;

use serde_json::Value;

/// Callback invoked with a broadcast payload.
pub type EventCallback = Box<dyn FnMut(&Value) + Send + 'static>;

/// Callback invoked with the event name and payload of every broadcast.
pub type MessageCallback = Box<dyn FnMut(&str, &Value) + Send + 'static>;

/// Identity of one registration, returned by [`ChannelHandle::on`](crate::ChannelHandle::on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionRef(pub(crate) u64);

impl std::fmt::Display for SubscriptionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Storage for event callbacks on one channel.
#[derive(Default)]
pub(crate) struct Bindings {
    callbacks: HashMap<String, Vec<(SubscriptionRef, EventCallback)>>,
    catch_all: Vec<(SubscriptionRef, MessageCallback)>,
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings")
            .field("event_count", &self.callbacks.len())
            .field("catch_all", &self.catch_all.len())
            .field("total_callbacks", &self.len())
            .finish()
    }
}

impl Bindings {
    /// Append a callback for `event`.
    pub(crate) fn on(&mut self, event: &str, id: SubscriptionRef, callback: EventCallback) {
        self.callbacks
            .entry(event.to_string())
            .or_default()
            .push((id, callback));
    }

    /// Remove one registration, or every registration for `event` when `id` is `None`.
    ///
    /// Returns the number of callbacks removed.
    pub(crate) fn off(&mut self, event: &str, id: Option<SubscriptionRef>) -> usize {
        let Some(list) = self.callbacks.get_mut(event) else {
            return 0;
        };
        let before = list.len();
        match id {
            Some(id) => list.retain(|(existing, _)| *existing != id),
            None => list.clear(),
        }
        let removed = before - list.len();
        if list.is_empty() {
            self.callbacks.remove(event);
        }
        removed
    }

    /// Append a callback for every event.
    pub(crate) fn on_any(&mut self, id: SubscriptionRef, callback: MessageCallback) {
        self.catch_all.push((id, callback));
    }

    /// Remove one catch-all registration. Returns the number removed.
    pub(crate) fn off_any(&mut self, id: SubscriptionRef) -> usize {
        let before = self.catch_all.len();
        self.catch_all.retain(|(existing, _)| *existing != id);
        before - self.catch_all.len()
    }

    /// Invoke every callback for `event` in registration order, then the
    /// catch-all callbacks.
    ///
    /// Returns the number of callbacks invoked.
    pub(crate) fn dispatch(&mut self, event: &str, payload: &Value) -> usize {
        let mut invoked = 0;
        if let Some(list) = self.callbacks.get_mut(event) {
            for (_, callback) in list.iter_mut() {
                callback(payload);
            }
            invoked += list.len();
        }
        for (_, callback) in &mut self.catch_all {
            callback(event, payload);
        }
        invoked + self.catch_all.len()
    }

    /// Total number of registrations.
    pub(crate) fn len(&self) -> usize {
        self.callbacks.values().map(Vec::len).sum::<usize>() + self.catch_all.len()
    }
}
