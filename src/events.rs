//! Event and subscription multiplexing on the transport side
//!
//! Collision/rayhit callbacks are installed once at entity creation under
//! the entity's own identity and removed atomically at removal; they are
//! not subscriptions. Subscriptions watch one body property continuously
//! under a fresh numeric id that is never reused while active.

use crate::protocol::{ContactInfo, Identity, ObservedValue, RayHitInfo};
use crate::registry::TargetRef;
use std::collections::HashMap;
use tracing::trace;

/// A collision delivered to an entity's own callback.
///
/// `target` is the other participant's handle resolved through the
/// registry, so callers receive their own handle objects, never raw
/// identities.
pub struct CollideEvent {
    pub target_identity: Identity,
    pub target: Option<TargetRef>,
    /// Present for continuous `collide` events, absent for begin/end
    pub contact: Option<ContactInfo>,
}

/// A ray intersection delivered to the ray's callback
pub struct RayEvent {
    pub body_identity: Option<Identity>,
    pub body: Option<TargetRef>,
    /// `None` when the ray exhausted its length without hitting
    pub hit: Option<RayHitInfo>,
}

/// Callback invoked for collision events
pub type CollideCallback = Box<dyn FnMut(&CollideEvent)>;

/// Callback invoked for ray events
pub type RayCallback = Box<dyn FnMut(&RayEvent)>;

/// Callback invoked with each observation value
pub type ObservationCallback = Box<dyn FnMut(&ObservedValue)>;

/// Fixed set of optional callbacks installed at entity creation
#[derive(Default)]
pub struct EntityCallbacks {
    pub collide: Option<CollideCallback>,
    pub collide_begin: Option<CollideCallback>,
    pub collide_end: Option<CollideCallback>,
}

impl EntityCallbacks {
    /// Whether any collision callback is present; this is all that
    /// crosses the boundary, as boolean flags on the descriptor
    pub fn any(&self) -> bool {
        self.collide.is_some() || self.collide_begin.is_some() || self.collide_end.is_some()
    }
}

/// Per-identity callback table, owned by the transport side
#[derive(Default)]
pub struct EventTable {
    entities: HashMap<Identity, EntityCallbacks>,
    rays: HashMap<Identity, RayCallback>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, identity: &str, callbacks: EntityCallbacks) {
        if callbacks.any() {
            self.entities.insert(identity.to_owned(), callbacks);
        }
    }

    /// Remove every callback for an identity in one step
    pub fn remove(&mut self, identity: &str) {
        self.entities.remove(identity);
    }

    /// Whether collision callbacks are installed under this identity
    pub fn has_entity(&self, identity: &str) -> bool {
        self.entities.contains_key(identity)
    }

    pub fn install_ray(&mut self, identity: &str, callback: RayCallback) {
        self.rays.insert(identity.to_owned(), callback);
    }

    pub fn remove_ray(&mut self, identity: &str) {
        self.rays.remove(identity);
    }

    pub fn dispatch_collide(&mut self, identity: &str, event: &CollideEvent) {
        if let Some(callbacks) = self.entities.get_mut(identity) {
            if let Some(callback) = callbacks.collide.as_mut() {
                callback(event);
            }
        }
    }

    pub fn dispatch_collide_begin(&mut self, identity: &str, event: &CollideEvent) {
        if let Some(callbacks) = self.entities.get_mut(identity) {
            if let Some(callback) = callbacks.collide_begin.as_mut() {
                callback(event);
            }
        }
    }

    pub fn dispatch_collide_end(&mut self, identity: &str, event: &CollideEvent) {
        if let Some(callbacks) = self.entities.get_mut(identity) {
            if let Some(callback) = callbacks.collide_end.as_mut() {
                callback(event);
            }
        }
    }

    pub fn dispatch_rayhit(&mut self, identity: &str, event: &RayEvent) {
        if let Some(callback) = self.rays.get_mut(identity) {
            callback(event);
        }
    }
}

/// Subscription id -> callback table.
///
/// Ids are assigned by the facade from a monotonic counter and removed
/// locally the moment `unsubscribe` is issued, so an observation for an
/// unsubscribed id arriving later is simply dropped.
#[derive(Default)]
pub struct SubscriptionTable {
    callbacks: HashMap<u32, ObservationCallback>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u32, callback: ObservationCallback) {
        self.callbacks.insert(id, callback);
    }

    pub fn remove(&mut self, id: u32) {
        self.callbacks.remove(&id);
    }

    /// Route one observation to its callback; orphaned ids are dropped
    pub fn dispatch(&mut self, id: u32, value: &ObservedValue) {
        match self.callbacks.get_mut(&id) {
            Some(callback) => callback(value),
            None => trace!(id, "dropping observation for inactive subscription"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_orphaned_subscription_never_fires() {
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();

        let mut table = SubscriptionTable::new();
        table.insert(1, Box::new(move |_| flag.set(true)));
        // Unsubscribed before any frame arrived
        table.remove(1);

        table.dispatch(1, &ObservedValue::Bool(true));
        assert!(!fired.get());
    }

    #[test]
    fn test_entity_callbacks_removed_atomically() {
        let collides = Rc::new(Cell::new(0u32));
        let begins = Rc::new(Cell::new(0u32));
        let c = collides.clone();
        let b = begins.clone();

        let mut table = EventTable::new();
        table.install(
            "a",
            EntityCallbacks {
                collide: Some(Box::new(move |_| c.set(c.get() + 1))),
                collide_begin: Some(Box::new(move |_| b.set(b.get() + 1))),
                collide_end: None,
            },
        );

        let event = CollideEvent {
            target_identity: "b".into(),
            target: None,
            contact: None,
        };
        table.dispatch_collide("a", &event);
        table.dispatch_collide_begin("a", &event);
        assert_eq!((collides.get(), begins.get()), (1, 1));

        table.remove("a");
        table.dispatch_collide("a", &event);
        table.dispatch_collide_begin("a", &event);
        assert_eq!((collides.get(), begins.get()), (1, 1));
    }

    #[test]
    fn test_callbackless_entity_is_not_tracked() {
        let mut table = EventTable::new();
        table.install("b", EntityCallbacks::default());
        assert!(table.entities.is_empty());
    }
}
