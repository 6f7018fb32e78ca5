//! Property-change subscriptions.
//!
//! One server-side subscription (event id) per namespace/instance/property,
//! shared by every local callback for it. The subscription lives while at
//! least one callback is registered. Callbacks added while the peer has not
//! yet confirmed the subscription wait on its outcome.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

pub type PropCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// What identifies a property subscription on the peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropKey {
    pub namespace: String,
    pub instance_id: Option<String>,
    pub prop: String,
}

impl PropKey {
    pub fn new(namespace: &str, instance_id: Option<&str>, prop: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            instance_id: instance_id.map(str::to_string),
            prop: prop.to_string(),
        }
    }
}

/// Returned by `add_prop_listener`, pass back to remove the callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    pub key: PropKey,
    pub event_id: String,
    listener_id: u64,
}

/// Where the peer-side subscription stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeState {
    Pending,
    Active,
    Failed(String),
}

struct Subscription {
    callbacks: Vec<(u64, PropCallback)>,
    state: watch::Sender<SubscribeState>,
}

/// Result of adding a callback
pub struct Added {
    pub handle: ListenerHandle,
    /// True when this is the first callback: the peer must be told to subscribe
    pub is_new: bool,
    pub state: watch::Receiver<SubscribeState>,
}

#[derive(Default)]
pub struct ListenerRegistry {
    subscriptions: HashMap<String, Subscription>,
    by_key: HashMap<PropKey, String>,
    next_listener: u64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: PropKey, callback: PropCallback) -> Added {
        let listener_id = self.next_listener;
        self.next_listener += 1;

        if let Some(event_id) = self.by_key.get(&key) {
            if let Some(subscription) = self.subscriptions.get_mut(event_id) {
                subscription.callbacks.push((listener_id, callback));
                return Added {
                    handle: ListenerHandle {
                        key,
                        event_id: event_id.clone(),
                        listener_id,
                    },
                    is_new: false,
                    state: subscription.state.subscribe(),
                };
            }
        }

        let event_id = Uuid::new_v4().to_string();
        let (state, receiver) = watch::channel(SubscribeState::Pending);
        self.by_key.insert(key.clone(), event_id.clone());
        self.subscriptions.insert(
            event_id.clone(),
            Subscription {
                callbacks: vec![(listener_id, callback)],
                state,
            },
        );

        Added {
            handle: ListenerHandle {
                key,
                event_id,
                listener_id,
            },
            is_new: true,
            state: receiver,
        }
    }

    /// The peer confirmed the subscription
    pub fn activate(&mut self, event_id: &str) {
        if let Some(subscription) = self.subscriptions.get(event_id) {
            subscription.state.send_replace(SubscribeState::Active);
        }
    }

    /// The peer never subscribed: drop every callback waiting on it. Returns
    /// how many callbacks went with it.
    pub fn abandon(&mut self, event_id: &str, reason: String) -> usize {
        let Some(subscription) = self.subscriptions.remove(event_id) else {
            return 0;
        };
        self.by_key.retain(|_, id| id.as_str() != event_id);
        subscription.state.send_replace(SubscribeState::Failed(reason));
        subscription.callbacks.len()
    }

    /// Remove a callback. Returns true when it was the last one for its
    /// subscription, which is then gone.
    pub fn remove(&mut self, handle: &ListenerHandle) -> bool {
        let Some(subscription) = self.subscriptions.get_mut(&handle.event_id) else {
            return false;
        };

        let before = subscription.callbacks.len();
        subscription
            .callbacks
            .retain(|(id, _)| *id != handle.listener_id);
        if subscription.callbacks.len() == before || !subscription.callbacks.is_empty() {
            return false;
        }

        self.subscriptions.remove(&handle.event_id);
        self.by_key.remove(&handle.key);
        true
    }

    /// Callbacks for an event id, cloned so they can run without the registry
    pub fn callbacks(&self, event_id: &str) -> Option<Vec<PropCallback>> {
        self.subscriptions.get(event_id).map(|subscription| {
            subscription
                .callbacks
                .iter()
                .map(|(_, callback)| callback.clone())
                .collect()
        })
    }

    #[cfg(test)]
    pub fn contains(&self, event_id: &str) -> bool {
        self.subscriptions.contains_key(event_id)
    }

    /// Drop every subscription (peer has forgotten them)
    pub fn clear(&mut self) -> usize {
        let count = self.subscriptions.len();
        for (_, subscription) in self.subscriptions.drain() {
            subscription
                .state
                .send_if_modified(|state| match state {
                    SubscribeState::Pending => {
                        *state = SubscribeState::Failed("connection lost".to_string());
                        true
                    }
                    _ => false,
                });
        }
        self.by_key.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
