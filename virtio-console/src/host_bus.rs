//! Host-side byte-stream bus.
//!
//! Devices and host backends (terminal, pty bridges, tests) exchange raw
//! bytes over named channels. Publishing never holds the bus lock while a
//! callback runs, so a subscriber may publish from inside its callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Callback = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
}

#[derive(Default)]
struct BusState {
    channels: HashMap<String, Vec<Subscriber>>,
    next_id: u64,
}

#[derive(Default)]
pub struct HostBus {
    state: Mutex<BusState>,
}

impl HostBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for every publish on `channel`.
    pub fn subscribe<F>(&self, channel: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let mut state = self.state.lock().unwrap();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        log::debug!("[HostBus] Subscribed {:?} to '{}'", id, channel);
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock().unwrap();
        for subscribers in state.channels.values_mut() {
            if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
                subscribers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver `bytes` to every subscriber of `channel` in subscription
    /// order. Returns how many subscribers were called.
    pub fn publish(&self, channel: &str, bytes: &[u8]) -> usize {
        let callbacks: Vec<Callback> = {
            let state = self.state.lock().unwrap();
            match state.channels.get(channel) {
                Some(subscribers) => subscribers.iter().map(|s| Arc::clone(&s.callback)).collect(),
                None => Vec::new(),
            }
        };
        if callbacks.is_empty() {
            log::trace!("[HostBus] No subscriber on '{}', {} bytes discarded", channel, bytes.len());
        }
        for callback in &callbacks {
            callback(bytes);
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.channels.get(channel).map_or(0, Vec::len)
    }
}
