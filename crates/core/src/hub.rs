//! Typed publish/subscribe hub.
//!
//! Each [`EventHub`] is a named event type holding an ordered subscriber
//! list per optional subtype. Emits are synchronous: callbacks run on the
//! emitter's stack in registration order, and a panicking callback never
//! prevents the ones after it. Subscriptions taken on behalf of a
//! connection are swept when that connection closes; subscriptions without
//! a connection are global and only removed explicitly.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

/// Identifier of a live client connection. Allocated by the protocol that
/// accepted the transport.
pub type ConnectionId = u64;

/// Subscriber callback. Receives a borrowed event payload; implementations
/// that need to suspend hand the payload off to a channel.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

struct Subscription {
    conn: Option<ConnectionId>,
    callback: Callback,
}

/// A single event type with per-subtype subscriber lists.
pub struct EventHub {
    event_type: String,
    subtypes: Mutex<HashMap<Option<String>, Vec<Subscription>>>,
}

impl EventHub {
    /// Create a hub for the given event type.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            subtypes: Mutex::new(HashMap::new()),
        }
    }

    /// The event type this hub carries.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Append a subscription. `conn = None` registers a global subscription
    /// that survives connection closes.
    pub fn subscribe(&self, conn: Option<ConnectionId>, subtype: Option<&str>, callback: Callback) {
        let mut subtypes = self.subtypes.lock().expect("hub lock poisoned");
        subtypes
            .entry(subtype.map(str::to_string))
            .or_default()
            .push(Subscription { conn, callback });
    }

    /// Remove every subscription in `subtype` belonging to `conn`
    /// (`conn = None` removes the global ones). Empty subtype lists are
    /// pruned so `subtypes()` only reports live keys.
    pub fn unsubscribe(&self, conn: Option<ConnectionId>, subtype: Option<&str>) {
        let mut subtypes = self.subtypes.lock().expect("hub lock poisoned");
        let key = subtype.map(str::to_string);
        if let Some(list) = subtypes.get_mut(&key) {
            list.retain(|s| s.conn != conn);
            if list.is_empty() {
                subtypes.remove(&key);
            }
        }
    }

    /// Remove a closing connection from every subtype.
    pub fn unsubscribe_connection(&self, conn: ConnectionId) {
        let mut subtypes = self.subtypes.lock().expect("hub lock poisoned");
        subtypes.retain(|_, list| {
            list.retain(|s| s.conn != Some(conn));
            !list.is_empty()
        });
    }

    /// Invoke every callback registered for `subtype`, in registration
    /// order, with `data`. Callbacks run outside the hub lock so they may
    /// subscribe or unsubscribe; such changes affect later emits only.
    pub fn emit(&self, data: &Value, subtype: Option<&str>) {
        let callbacks: Vec<Callback> = {
            let subtypes = self.subtypes.lock().expect("hub lock poisoned");
            match subtypes.get(&subtype.map(str::to_string)) {
                Some(list) => list.iter().map(|s| s.callback.clone()).collect(),
                None => return,
            }
        };

        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(data))) {
                tracing::error!(
                    event_type = %self.event_type,
                    subtype = subtype.unwrap_or("<none>"),
                    panic = ?panic,
                    "Event subscriber panicked"
                );
            }
        }
    }

    /// Whether `subtype` has at least one subscriber.
    pub fn has_subscribers(&self, subtype: Option<&str>) -> bool {
        let subtypes = self.subtypes.lock().expect("hub lock poisoned");
        subtypes.contains_key(&subtype.map(str::to_string))
    }

    /// Whether any subtype of this hub has a subscriber.
    pub fn has_any_subscribers(&self) -> bool {
        !self.subtypes.lock().expect("hub lock poisoned").is_empty()
    }

    /// Number of subscribers for `subtype`.
    pub fn subscribers_count(&self, subtype: Option<&str>) -> usize {
        let subtypes = self.subtypes.lock().expect("hub lock poisoned");
        subtypes
            .get(&subtype.map(str::to_string))
            .map_or(0, Vec::len)
    }

    /// Number of live subtype keys.
    pub fn subtype_count(&self) -> usize {
        self.subtypes.lock().expect("hub lock poisoned").len()
    }

    /// The live subtype keys. `None` appears when no-subtype subscriptions
    /// exist.
    pub fn subtypes(&self) -> Vec<Option<String>> {
        self.subtypes
            .lock()
            .expect("hub lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// The process-wide set of named hubs.
///
/// Connections do not hold hubs; on close the protocol calls
/// [`HubRegistry::unsubscribe_connection`] which sweeps every hub, so a
/// closed connection can never be emitted to again.
pub struct HubRegistry {
    hubs: Mutex<HashMap<String, Arc<EventHub>>>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self {
            hubs: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the hub for `event_type`, creating it on first use.
    pub fn hub(&self, event_type: &str) -> Arc<EventHub> {
        let mut hubs = self.hubs.lock().expect("hub registry lock poisoned");
        hubs.entry(event_type.to_string())
            .or_insert_with(|| Arc::new(EventHub::new(event_type)))
            .clone()
    }

    /// Sweep a closing connection out of every hub.
    pub fn unsubscribe_connection(&self, conn: ConnectionId) {
        let hubs: Vec<Arc<EventHub>> = {
            let hubs = self.hubs.lock().expect("hub registry lock poisoned");
            hubs.values().cloned().collect()
        };
        for hub in hubs {
            hub.unsubscribe_connection(conn);
        }
    }
}

impl Default for HubRegistry {
    fn default() -> Self {
        Self::new()
    }
}
