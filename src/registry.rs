//! Identity registry mapping stable string tokens to simulation rows
//!
//! The host stores bodies in a dense array whose order changes on every
//! add/remove. Each `sync` message republishes the full ordered identity
//! list and the registry is rebuilt wholesale from it; indices are
//! ephemeral and valid only until the next sync.

use crate::frame::{InstancedPoseTarget, PoseTarget};
use crate::protocol::Identity;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Shared handle to a single visual pose target
pub type SharedTarget = Arc<Mutex<dyn PoseTarget>>;

/// Shared handle to a replicated (instanced) pose target
pub type SharedInstancedTarget = Arc<Mutex<dyn InstancedPoseTarget>>;

/// A consumer-side visual handle, single or replicated
#[derive(Clone)]
pub enum TargetRef {
    /// One body, one transform
    Single(SharedTarget),
    /// One visual handle standing in for `count` simulated bodies,
    /// addressed as `<base>/<replica>`
    Instanced {
        target: SharedInstancedTarget,
        count: usize,
    },
}

/// Bidirectional registry owned exclusively by the transport side.
///
/// `indices` is the identity -> registry index map rebuilt on sync;
/// `refs` is the identity -> visual handle table used to hand callers
/// their own handle objects instead of raw identities.
#[derive(Default)]
pub struct Registry {
    indices: HashMap<Identity, usize>,
    refs: HashMap<Identity, TargetRef>,
    /// Replica identity strings per instanced target, built once at
    /// registration so the frame hot path never formats them
    replica_names: HashMap<Identity, Vec<Identity>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the index table from an authoritative ordered identity list.
    ///
    /// O(bodyCount); runs only on membership changes, never on the frame
    /// hot path.
    pub fn rebuild(&mut self, bodies: &[Identity]) {
        self.indices.clear();
        for (index, identity) in bodies.iter().enumerate() {
            self.indices.insert(identity.clone(), index);
        }
        debug!(count = bodies.len(), "registry rebuilt");
    }

    /// Current registry index for an identity, if the body still exists
    pub fn index_of(&self, identity: &str) -> Option<usize> {
        self.indices.get(identity).copied()
    }

    /// Number of indexed bodies
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Attach a visual handle under an identity (base identity for
    /// replicated handles)
    pub fn register_target(&mut self, identity: &str, target: TargetRef) {
        trace!(identity, "target registered");
        if let TargetRef::Instanced { count, .. } = &target {
            let names = (0..*count)
                .map(|replica| format!("{identity}/{replica}"))
                .collect();
            self.replica_names.insert(identity.to_owned(), names);
        }
        self.refs.insert(identity.to_owned(), target);
    }

    /// Detach the visual handle for an identity
    pub fn remove_target(&mut self, identity: &str) {
        self.refs.remove(identity);
        self.replica_names.remove(identity);
    }

    /// Precomputed `<base>/<i>` identities for an instanced target;
    /// empty for plain targets
    pub fn replica_identities(&self, identity: &str) -> &[Identity] {
        self.replica_names
            .get(identity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_target(&self, identity: &str) -> bool {
        self.refs.contains_key(identity)
    }

    /// Resolve an identity to its handle, falling back to the base
    /// identity for replica tokens of the form `<base>/<i>`
    pub fn resolve(&self, identity: &str) -> Option<TargetRef> {
        if let Some(target) = self.refs.get(identity) {
            return Some(target.clone());
        }
        let base = identity.rsplit_once('/')?.0;
        self.refs.get(base).cloned()
    }

    /// Iterate all registered handles with their identities
    pub fn targets(&self) -> impl Iterator<Item = (&Identity, &TargetRef)> {
        self.refs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idents(names: &[&str]) -> Vec<Identity> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rebuild_is_a_bijection() {
        let mut registry = Registry::new();
        registry.rebuild(&idents(&["a", "b", "c"]));

        assert_eq!(registry.len(), 3);
        let mut seen: Vec<usize> = ["a", "b", "c"]
            .iter()
            .map(|id| registry.index_of(id).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_rebuild_replaces_stale_entries() {
        let mut registry = Registry::new();
        registry.rebuild(&idents(&["a", "b", "c"]));
        registry.rebuild(&idents(&["c", "a"]));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.index_of("c"), Some(0));
        assert_eq!(registry.index_of("a"), Some(1));
        assert_eq!(registry.index_of("b"), None);
    }

    #[test]
    fn test_removal_order_does_not_matter() {
        // Removing in reverse order and in original order must both end in
        // the same empty registry.
        let mut forward = Registry::new();
        let mut reverse = Registry::new();
        forward.rebuild(&idents(&["a", "b", "c"]));
        reverse.rebuild(&idents(&["a", "b", "c"]));

        forward.rebuild(&idents(&["b", "c"]));
        forward.rebuild(&idents(&["c"]));
        forward.rebuild(&[]);

        reverse.rebuild(&idents(&["a", "b"]));
        reverse.rebuild(&idents(&["a"]));
        reverse.rebuild(&[]);

        assert!(forward.is_empty());
        assert!(reverse.is_empty());
    }

    #[test]
    fn test_replica_identities_are_precomputed_at_registration() {
        use crate::frame::InstancedPoseTarget;
        use glam::{Quat, Vec3};

        struct Null;
        impl InstancedPoseTarget for Null {
            fn set_instance_pose(&mut self, _index: usize, _position: Vec3, _rotation: Quat) {}
            fn commit(&mut self) {}
        }

        let mut registry = Registry::new();
        registry.register_target(
            "boxes",
            TargetRef::Instanced {
                target: Arc::new(Mutex::new(Null)),
                count: 3,
            },
        );

        assert_eq!(
            registry.replica_identities("boxes"),
            ["boxes/0", "boxes/1", "boxes/2"]
        );
        assert!(registry.replica_identities("spheres").is_empty());

        registry.remove_target("boxes");
        assert!(registry.replica_identities("boxes").is_empty());
    }

    #[test]
    fn test_resolve_falls_back_to_base_identity() {
        use crate::frame::PoseTarget;
        use glam::{Quat, Vec3};

        struct Null;
        impl PoseTarget for Null {
            fn set_pose(&mut self, _position: Vec3, _rotation: Quat) {}
        }

        let mut registry = Registry::new();
        registry.register_target("boxes", TargetRef::Single(Arc::new(Mutex::new(Null))));

        assert!(registry.resolve("boxes").is_some());
        assert!(registry.resolve("boxes/7").is_some());
        assert!(registry.resolve("spheres/0").is_none());
    }
}
