//! Frame synchronizer: applies double-buffered transform data onto
//! consumer-visible handles once per simulation tick
//!
//! The rendering scene graph is an external collaborator reached only
//! through the pose-target traits; the simulation never sees a scale, so
//! handles keep their own.

use crate::registry::{Registry, TargetRef};
use glam::{Quat, Vec3};
use tracing::{trace, warn};

/// A visual handle with one writable pose
pub trait PoseTarget {
    /// Write the handle's world pose; the handle composes its own scale
    fn set_pose(&mut self, position: Vec3, rotation: Quat);
}

/// A replicated visual handle with an indexed array of per-replica poses
pub trait InstancedPoseTarget {
    /// Write one replica's pose into its slot
    fn set_instance_pose(&mut self, index: usize, position: Vec3, rotation: Quat);

    /// Mark the shared transform array dirty; called exactly once per
    /// frame per target, after all replica slots are written
    fn commit(&mut self);
}

/// Applies one frame's transform buffers onto every registered handle
#[derive(Default)]
pub struct FrameSynchronizer {
    redraw: Option<Box<dyn FnMut()>>,
}

impl FrameSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an adaptive-redraw hook, invoked after applying a frame in
    /// which at least one body moved
    pub fn set_redraw_hook(&mut self, hook: Box<dyn FnMut()>) {
        self.redraw = Some(hook);
    }

    /// Apply the buffers for one completed step.
    ///
    /// When `active` is false the whole world is asleep: poses are
    /// unchanged since the prior tick, so nothing is written and no
    /// redraw is requested.
    pub fn apply(&mut self, positions: &[f32], quaternions: &[f32], active: bool, registry: &Registry) {
        if !active {
            trace!("world asleep, skipping frame application");
            return;
        }

        for (identity, target) in registry.targets() {
            match target {
                TargetRef::Single(handle) => {
                    if let Some((position, rotation)) =
                        read_pose(positions, quaternions, registry.index_of(identity))
                    {
                        // A poisoned handle is skipped for this tick, not
                        // propagated into the render loop.
                        let Ok(mut handle) = handle.lock() else {
                            warn!(identity, "pose target lock poisoned, skipping");
                            continue;
                        };
                        handle.set_pose(position, rotation);
                    }
                }
                TargetRef::Instanced { target, .. } => {
                    let Ok(mut handle) = target.lock() else {
                        warn!(identity, "pose target lock poisoned, skipping");
                        continue;
                    };
                    for (replica, replica_id) in
                        registry.replica_identities(identity).iter().enumerate()
                    {
                        let index = registry.index_of(replica_id);
                        if let Some((position, rotation)) = read_pose(positions, quaternions, index)
                        {
                            handle.set_instance_pose(replica, position, rotation);
                        }
                    }
                    // One dirty mark for the whole array, not one per replica
                    handle.commit();
                }
            }
        }

        if let Some(redraw) = &mut self.redraw {
            redraw();
        }
    }
}

/// Slice one body's pose out of the flat buffers; a missing or stale
/// index is skipped for this tick, never an error
fn read_pose(positions: &[f32], quaternions: &[f32], index: Option<usize>) -> Option<(Vec3, Quat)> {
    let index = index?;
    let p = positions.get(3 * index..3 * index + 3)?;
    let q = quaternions.get(4 * index..4 * index + 4)?;
    Some((
        Vec3::new(p[0], p[1], p[2]),
        Quat::from_xyzw(q[0], q[1], q[2], q[3]),
    ))
}
