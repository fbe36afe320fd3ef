//! Caller-facing facade over the worker boundary
//!
//! [`Physics`] is the only type consumers touch. Every method degrades
//! its arguments into plain-data operations, posts them to the worker,
//! and returns immediately; results come back asynchronously through
//! [`Physics::process_messages`], which the caller pumps once per
//! render tick.

use crate::config::WorldConfig;
use crate::error::BridgeError;
use crate::events::{
    CollideEvent, EntityCallbacks, EventTable, ObservationCallback, RayCallback, RayEvent,
    SubscriptionTable,
};
use crate::frame::FrameSynchronizer;
use crate::host::PhysicsWorker;
use crate::protocol::{
    BodyDesc, ConstraintDesc, ContactMaterialDesc, Identity, RayDesc, Reply, Request, SpringDesc,
    VehicleDesc, WatchProperty,
};
use crate::registry::{Registry, TargetRef};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// The physics bridge: a simulated world running on its own thread,
/// driven and observed from the caller's thread.
///
/// Transform buffers are a baton: they are owned here between steps and
/// by the worker while a step is in flight. A `step` issued while the
/// baton is away is dropped, which naturally paces the caller to the
/// worker instead of queueing unbounded work.
pub struct Physics {
    worker: PhysicsWorker,
    config: WorldConfig,
    registry: Registry,
    synchronizer: FrameSynchronizer,
    events: EventTable,
    subscriptions: SubscriptionTable,
    next_subscription_id: u32,
    /// `Some` when this side holds the buffers, `None` while stepping
    buffers: Option<(Vec<f32>, Vec<f32>)>,
    on_frame: Option<Box<dyn FnMut(bool)>>,
    on_sync: Option<Box<dyn FnMut(&[Identity])>>,
    /// Base identity -> replica count; `None` for plain bodies, whose
    /// host identity is the base itself rather than `<base>/<i>`
    replicas: HashMap<Identity, Option<usize>>,
    body_count: usize,
    paused: bool,
}

impl Physics {
    /// Spawn the worker and initialize the world
    pub fn new(config: WorldConfig) -> Result<Self, BridgeError> {
        let worker = PhysicsWorker::spawn()?;
        worker.send(Request::Init {
            config: config.clone(),
        })?;

        let positions = Vec::with_capacity(3 * config.max_bodies);
        let quaternions = Vec::with_capacity(4 * config.max_bodies);

        Ok(Self {
            worker,
            config,
            registry: Registry::new(),
            synchronizer: FrameSynchronizer::new(),
            events: EventTable::new(),
            subscriptions: SubscriptionTable::new(),
            next_subscription_id: 1,
            buffers: Some((positions, quaternions)),
            on_frame: None,
            on_sync: None,
            replicas: HashMap::new(),
            body_count: 0,
            paused: false,
        })
    }

    /// Current world configuration as sent at init
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Whether a step is currently in flight
    pub fn is_stepping(&self) -> bool {
        self.buffers.is_none()
    }

    /// Number of bodies registered through this facade
    pub fn body_count(&self) -> usize {
        self.body_count
    }

    /// Registry view, for resolving identities to handles
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Stop feeding time to the simulation; bodies freeze in place and
    /// no time accrues, so resuming does not jump
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Install the adaptive-redraw hook invoked after frames in which
    /// something moved
    pub fn set_redraw_hook(&mut self, hook: Box<dyn FnMut()>) {
        self.synchronizer.set_redraw_hook(hook);
    }

    /// Called after each frame has been applied, with the frame's
    /// activity flag
    pub fn set_frame_hook(&mut self, hook: Box<dyn FnMut(bool)>) {
        self.on_frame = Some(hook);
    }

    /// Called with the authoritative identity list after each
    /// membership change
    pub fn set_sync_hook(&mut self, hook: Box<dyn FnMut(&[Identity])>) {
        self.on_sync = Some(hook);
    }

    /// Advance the simulation by `elapsed` seconds of wall time.
    ///
    /// Returns immediately. If the previous step has not come back yet
    /// the call is dropped; if the bridge is paused it is a no-op.
    pub fn step(&mut self, elapsed: f32) -> Result<(), BridgeError> {
        if self.paused {
            return Ok(());
        }
        let Some((positions, quaternions)) = self.buffers.take() else {
            trace!("step still in flight, dropping this tick");
            return Ok(());
        };
        self.worker.send(Request::Step {
            time_since_last_called: elapsed,
            step_size: self.config.step_size,
            max_sub_steps: self.config.max_sub_steps,
            positions,
            quaternions,
        })
    }

    /// Drain and dispatch everything the worker produced since the last
    /// call: frames onto pose targets, collisions and ray hits onto
    /// their callbacks, observations onto subscriptions
    pub fn process_messages(&mut self) {
        for reply in self.worker.drain() {
            self.dispatch(reply);
        }
    }

    fn dispatch(&mut self, reply: Reply) {
        match reply {
            Reply::Frame {
                positions,
                quaternions,
                bodies,
                active,
                observations,
            } => {
                if let Some(bodies) = bodies {
                    self.registry.rebuild(&bodies);
                }
                for observation in observations {
                    self.subscriptions
                        .dispatch(observation.id, &observation.value);
                }
                self.synchronizer
                    .apply(&positions, &quaternions, active, &self.registry);
                // Baton comes home; the next step may go out
                self.buffers = Some((positions, quaternions));
                if let Some(on_frame) = &mut self.on_frame {
                    on_frame(active);
                }
            }
            Reply::Sync { bodies } => {
                self.registry.rebuild(&bodies);
                if let Some(on_sync) = &mut self.on_sync {
                    on_sync(&bodies);
                }
            }
            Reply::Collide {
                body,
                target,
                contact,
            } => {
                let event = CollideEvent {
                    target: self.registry.resolve(&target),
                    target_identity: target,
                    contact: Some(contact),
                };
                let key = listener_key(&self.events, &body);
                self.events.dispatch_collide(key, &event);
            }
            Reply::CollideBegin { body, target } => {
                let event = CollideEvent {
                    target: self.registry.resolve(&target),
                    target_identity: target,
                    contact: None,
                };
                let key = listener_key(&self.events, &body);
                self.events.dispatch_collide_begin(key, &event);
            }
            Reply::CollideEnd { body, target } => {
                let event = CollideEvent {
                    target: self.registry.resolve(&target),
                    target_identity: target,
                    contact: None,
                };
                let key = listener_key(&self.events, &body);
                self.events.dispatch_collide_end(key, &event);
            }
            Reply::RayHit { ray, body, hit } => {
                let event = RayEvent {
                    body: body.as_deref().and_then(|id| self.registry.resolve(id)),
                    body_identity: body,
                    hit,
                };
                self.events.dispatch_rayhit(&ray, &event);
            }
        }
    }

    /// Add one body with optional collision callbacks and an optional
    /// visual handle to keep in sync
    pub fn add_body(
        &mut self,
        identity: &str,
        desc: BodyDesc,
        callbacks: EntityCallbacks,
        target: Option<TargetRef>,
    ) -> Result<(), BridgeError> {
        self.reserve(identity, None)?;

        let desc = BodyDesc {
            on_collide: callbacks.collide.is_some(),
            on_collide_begin: callbacks.collide_begin.is_some(),
            on_collide_end: callbacks.collide_end.is_some(),
            ..desc
        };
        self.events.install(identity, callbacks);
        if let Some(target) = target {
            self.registry.register_target(identity, target);
        }

        self.worker.send(Request::AddBody {
            identity: identity.to_owned(),
            desc,
        })
    }

    /// Add a replicated entity: one call, one visual handle, `descs.len()`
    /// simulated bodies addressed as `<identity>/<i>`
    pub fn add_bodies(
        &mut self,
        identity: &str,
        descs: Vec<BodyDesc>,
        callbacks: EntityCallbacks,
        target: Option<TargetRef>,
    ) -> Result<(), BridgeError> {
        if descs.is_empty() {
            return Err(BridgeError::EmptyBatch);
        }
        self.reserve(identity, Some(descs.len()))?;

        let flags = (
            callbacks.collide.is_some(),
            callbacks.collide_begin.is_some(),
            callbacks.collide_end.is_some(),
        );
        self.events.install(identity, callbacks);
        if let Some(target) = target {
            self.registry.register_target(identity, target);
        }

        let identities: Vec<Identity> = (0..descs.len())
            .map(|replica| format!("{identity}/{replica}"))
            .collect();
        let descs = descs
            .into_iter()
            .map(|desc| BodyDesc {
                on_collide: flags.0,
                on_collide_begin: flags.1,
                on_collide_end: flags.2,
                ..desc
            })
            .collect();

        self.worker.send(Request::AddBodies { identities, descs })
    }

    /// Remove an entity and everything registered under it, replicated
    /// or not
    pub fn remove_body(&mut self, identity: &str) -> Result<(), BridgeError> {
        let Some(replicas) = self.replicas.remove(identity) else {
            warn!(identity, "remove for unknown identity ignored");
            return Ok(());
        };
        self.body_count -= replicas.unwrap_or(1);
        self.events.remove(identity);
        self.registry.remove_target(identity);

        // An instanced entity lives host-side under `<base>/<i>` names,
        // even with a single replica; only plain bodies use the base.
        match replicas {
            None => self.worker.send(Request::RemoveBody {
                identity: identity.to_owned(),
            }),
            Some(count) => {
                let identities = (0..count)
                    .map(|replica| format!("{identity}/{replica}"))
                    .collect();
                self.worker.send(Request::RemoveBodies { identities })
            }
        }
    }

    fn reserve(&mut self, identity: &str, replicas: Option<usize>) -> Result<(), BridgeError> {
        if self.replicas.contains_key(identity) {
            return Err(BridgeError::DuplicateIdentity(identity.to_owned()));
        }
        let count = replicas.unwrap_or(1);
        let requested = self.body_count + count;
        if requested > self.config.max_bodies {
            return Err(BridgeError::CapacityExceeded {
                requested,
                max: self.config.max_bodies,
            });
        }
        self.replicas.insert(identity.to_owned(), replicas);
        self.body_count = requested;
        debug!(identity, count, total = self.body_count, "bodies reserved");
        Ok(())
    }

    pub fn add_constraint(&mut self, identity: &str, desc: ConstraintDesc) -> Result<(), BridgeError> {
        self.worker.send(Request::AddConstraint {
            identity: identity.to_owned(),
            desc,
        })
    }

    pub fn remove_constraint(&mut self, identity: &str) -> Result<(), BridgeError> {
        self.worker.send(Request::RemoveConstraint {
            identity: identity.to_owned(),
        })
    }

    pub fn enable_constraint(&mut self, identity: &str) -> Result<(), BridgeError> {
        self.worker.send(Request::EnableConstraint {
            identity: identity.to_owned(),
        })
    }

    pub fn disable_constraint(&mut self, identity: &str) -> Result<(), BridgeError> {
        self.worker.send(Request::DisableConstraint {
            identity: identity.to_owned(),
        })
    }

    pub fn enable_constraint_motor(&mut self, identity: &str) -> Result<(), BridgeError> {
        self.worker.send(Request::EnableConstraintMotor {
            identity: identity.to_owned(),
        })
    }

    pub fn disable_constraint_motor(&mut self, identity: &str) -> Result<(), BridgeError> {
        self.worker.send(Request::DisableConstraintMotor {
            identity: identity.to_owned(),
        })
    }

    pub fn set_constraint_motor_speed(&mut self, identity: &str, speed: f32) -> Result<(), BridgeError> {
        self.worker.send(Request::SetConstraintMotorSpeed {
            identity: identity.to_owned(),
            speed,
        })
    }

    pub fn set_constraint_motor_max_force(
        &mut self,
        identity: &str,
        max_force: f32,
    ) -> Result<(), BridgeError> {
        self.worker.send(Request::SetConstraintMotorMaxForce {
            identity: identity.to_owned(),
            max_force,
        })
    }

    pub fn add_spring(&mut self, identity: &str, desc: SpringDesc) -> Result<(), BridgeError> {
        self.worker.send(Request::AddSpring {
            identity: identity.to_owned(),
            desc,
        })
    }

    pub fn remove_spring(&mut self, identity: &str) -> Result<(), BridgeError> {
        self.worker.send(Request::RemoveSpring {
            identity: identity.to_owned(),
        })
    }

    pub fn set_spring_stiffness(&mut self, identity: &str, stiffness: f32) -> Result<(), BridgeError> {
        self.worker.send(Request::SetSpringStiffness {
            identity: identity.to_owned(),
            stiffness,
        })
    }

    pub fn set_spring_damping(&mut self, identity: &str, damping: f32) -> Result<(), BridgeError> {
        self.worker.send(Request::SetSpringDamping {
            identity: identity.to_owned(),
            damping,
        })
    }

    pub fn set_spring_rest_length(
        &mut self,
        identity: &str,
        rest_length: f32,
    ) -> Result<(), BridgeError> {
        self.worker.send(Request::SetSpringRestLength {
            identity: identity.to_owned(),
            rest_length,
        })
    }

    /// Install a persistent ray; `callback` fires once per simulation
    /// tick with the hit (or miss) for that tick
    pub fn add_ray(
        &mut self,
        identity: &str,
        desc: RayDesc,
        callback: RayCallback,
    ) -> Result<(), BridgeError> {
        self.events.install_ray(identity, callback);
        self.worker.send(Request::AddRay {
            identity: identity.to_owned(),
            desc,
        })
    }

    pub fn remove_ray(&mut self, identity: &str) -> Result<(), BridgeError> {
        self.events.remove_ray(identity);
        self.worker.send(Request::RemoveRay {
            identity: identity.to_owned(),
        })
    }

    pub fn add_contact_material(&mut self, desc: ContactMaterialDesc) -> Result<(), BridgeError> {
        self.worker.send(Request::AddContactMaterial { desc })
    }

    pub fn remove_contact_material(&mut self, id: u32) -> Result<(), BridgeError> {
        self.worker.send(Request::RemoveContactMaterial { id })
    }

    pub fn add_raycast_vehicle(&mut self, identity: &str, desc: VehicleDesc) -> Result<(), BridgeError> {
        self.worker.send(Request::AddRaycastVehicle {
            identity: identity.to_owned(),
            desc,
        })
    }

    pub fn remove_raycast_vehicle(&mut self, identity: &str) -> Result<(), BridgeError> {
        self.worker.send(Request::RemoveRaycastVehicle {
            identity: identity.to_owned(),
        })
    }

    pub fn set_raycast_vehicle_steering(
        &mut self,
        identity: &str,
        wheel: usize,
        value: f32,
    ) -> Result<(), BridgeError> {
        self.worker.send(Request::SetRaycastVehicleSteering {
            identity: identity.to_owned(),
            wheel,
            value,
        })
    }

    pub fn apply_raycast_vehicle_engine_force(
        &mut self,
        identity: &str,
        wheel: usize,
        value: f32,
    ) -> Result<(), BridgeError> {
        self.worker.send(Request::ApplyRaycastVehicleEngineForce {
            identity: identity.to_owned(),
            wheel,
            value,
        })
    }

    pub fn set_raycast_vehicle_brake(
        &mut self,
        identity: &str,
        wheel: usize,
        value: f32,
    ) -> Result<(), BridgeError> {
        self.worker.send(Request::SetRaycastVehicleBrake {
            identity: identity.to_owned(),
            wheel,
            value,
        })
    }

    pub fn set_position(&mut self, identity: &str, position: [f32; 3]) -> Result<(), BridgeError> {
        self.worker.send(Request::SetPosition {
            identity: identity.to_owned(),
            position,
        })
    }

    pub fn set_quaternion(&mut self, identity: &str, quaternion: [f32; 4]) -> Result<(), BridgeError> {
        self.worker.send(Request::SetQuaternion {
            identity: identity.to_owned(),
            quaternion,
        })
    }

    pub fn set_velocity(&mut self, identity: &str, velocity: [f32; 3]) -> Result<(), BridgeError> {
        self.worker.send(Request::SetVelocity {
            identity: identity.to_owned(),
            velocity,
        })
    }

    pub fn set_angular_velocity(
        &mut self,
        identity: &str,
        angular_velocity: [f32; 3],
    ) -> Result<(), BridgeError> {
        self.worker.send(Request::SetAngularVelocity {
            identity: identity.to_owned(),
            angular_velocity,
        })
    }

    pub fn set_mass(&mut self, identity: &str, mass: f32) -> Result<(), BridgeError> {
        self.worker.send(Request::SetMass {
            identity: identity.to_owned(),
            mass,
        })
    }

    pub fn set_linear_damping(&mut self, identity: &str, damping: f32) -> Result<(), BridgeError> {
        self.worker.send(Request::SetLinearDamping {
            identity: identity.to_owned(),
            damping,
        })
    }

    pub fn set_angular_damping(&mut self, identity: &str, damping: f32) -> Result<(), BridgeError> {
        self.worker.send(Request::SetAngularDamping {
            identity: identity.to_owned(),
            damping,
        })
    }

    pub fn set_linear_factor(&mut self, identity: &str, factor: [f32; 3]) -> Result<(), BridgeError> {
        self.worker.send(Request::SetLinearFactor {
            identity: identity.to_owned(),
            factor,
        })
    }

    pub fn set_angular_factor(&mut self, identity: &str, factor: [f32; 3]) -> Result<(), BridgeError> {
        self.worker.send(Request::SetAngularFactor {
            identity: identity.to_owned(),
            factor,
        })
    }

    pub fn set_fixed_rotation(&mut self, identity: &str, fixed: bool) -> Result<(), BridgeError> {
        self.worker.send(Request::SetFixedRotation {
            identity: identity.to_owned(),
            fixed,
        })
    }

    pub fn set_is_trigger(&mut self, identity: &str, is_trigger: bool) -> Result<(), BridgeError> {
        self.worker.send(Request::SetIsTrigger {
            identity: identity.to_owned(),
            is_trigger,
        })
    }

    pub fn set_collision_filter_group(&mut self, identity: &str, group: u32) -> Result<(), BridgeError> {
        self.worker.send(Request::SetCollisionFilterGroup {
            identity: identity.to_owned(),
            group,
        })
    }

    pub fn set_collision_filter_mask(&mut self, identity: &str, mask: u32) -> Result<(), BridgeError> {
        self.worker.send(Request::SetCollisionFilterMask {
            identity: identity.to_owned(),
            mask,
        })
    }

    pub fn set_sleep_speed_limit(&mut self, identity: &str, limit: f32) -> Result<(), BridgeError> {
        self.worker.send(Request::SetSleepSpeedLimit {
            identity: identity.to_owned(),
            limit,
        })
    }

    pub fn set_sleep_time_limit(&mut self, identity: &str, limit: f32) -> Result<(), BridgeError> {
        self.worker.send(Request::SetSleepTimeLimit {
            identity: identity.to_owned(),
            limit,
        })
    }

    pub fn apply_force(
        &mut self,
        identity: &str,
        force: [f32; 3],
        world_point: [f32; 3],
    ) -> Result<(), BridgeError> {
        self.worker.send(Request::ApplyForce {
            identity: identity.to_owned(),
            force,
            world_point,
        })
    }

    pub fn apply_impulse(
        &mut self,
        identity: &str,
        impulse: [f32; 3],
        world_point: [f32; 3],
    ) -> Result<(), BridgeError> {
        self.worker.send(Request::ApplyImpulse {
            identity: identity.to_owned(),
            impulse,
            world_point,
        })
    }

    pub fn apply_local_force(
        &mut self,
        identity: &str,
        force: [f32; 3],
        local_point: [f32; 3],
    ) -> Result<(), BridgeError> {
        self.worker.send(Request::ApplyLocalForce {
            identity: identity.to_owned(),
            force,
            local_point,
        })
    }

    pub fn apply_local_impulse(
        &mut self,
        identity: &str,
        impulse: [f32; 3],
        local_point: [f32; 3],
    ) -> Result<(), BridgeError> {
        self.worker.send(Request::ApplyLocalImpulse {
            identity: identity.to_owned(),
            impulse,
            local_point,
        })
    }

    pub fn apply_torque(&mut self, identity: &str, torque: [f32; 3]) -> Result<(), BridgeError> {
        self.worker.send(Request::ApplyTorque {
            identity: identity.to_owned(),
            torque,
        })
    }

    pub fn sleep(&mut self, identity: &str) -> Result<(), BridgeError> {
        self.worker.send(Request::Sleep {
            identity: identity.to_owned(),
        })
    }

    pub fn wake_up(&mut self, identity: &str) -> Result<(), BridgeError> {
        self.worker.send(Request::WakeUp {
            identity: identity.to_owned(),
        })
    }

    pub fn set_gravity(&mut self, gravity: [f32; 3]) -> Result<(), BridgeError> {
        self.config.gravity = gravity;
        self.worker.send(Request::SetGravity { gravity })
    }

    pub fn set_iterations(&mut self, iterations: u32) -> Result<(), BridgeError> {
        self.config.iterations = iterations;
        self.worker.send(Request::SetIterations { iterations })
    }

    pub fn set_tolerance(&mut self, tolerance: f32) -> Result<(), BridgeError> {
        self.config.tolerance = tolerance;
        self.worker.send(Request::SetTolerance { tolerance })
    }

    pub fn set_broadphase(&mut self, broadphase: &str) -> Result<(), BridgeError> {
        self.config.broadphase = broadphase.into();
        self.worker.send(Request::SetBroadphase {
            broadphase: broadphase.to_owned(),
        })
    }

    pub fn set_allow_sleep(&mut self, allow_sleep: bool) -> Result<(), BridgeError> {
        self.config.allow_sleep = allow_sleep;
        self.worker.send(Request::SetAllowSleep { allow_sleep })
    }

    /// Watch one property of one body; the callback fires with every
    /// frame until unsubscribed. Returns the subscription id.
    pub fn subscribe(
        &mut self,
        identity: &str,
        property: WatchProperty,
        callback: ObservationCallback,
    ) -> Result<u32, BridgeError> {
        let id = self.next_subscription_id;
        self.next_subscription_id = self.next_subscription_id.wrapping_add(1);
        self.subscriptions.insert(id, callback);
        self.worker.send(Request::Subscribe {
            id,
            identity: identity.to_owned(),
            property,
        })?;
        Ok(id)
    }

    /// Stop a subscription. The callback is dropped immediately, so an
    /// observation already in flight for this id is discarded on arrival.
    pub fn unsubscribe(&mut self, id: u32) -> Result<(), BridgeError> {
        self.subscriptions.remove(id);
        self.worker.send(Request::Unsubscribe { id })
    }

    /// Shut the worker down and wait for it to exit
    pub fn terminate(self) {
        self.worker.terminate();
    }
}

/// Collision replies name the simulated body, which for a replica is
/// `<base>/<i>`; callbacks are installed under the base identity.
/// An exact match wins, so a plain identity containing `/` still routes
/// to its own callbacks (mirrors `Registry::resolve`).
fn listener_key<'a>(events: &EventTable, body: &'a str) -> &'a str {
    if events.has_entity(body) {
        return body;
    }
    body.rsplit_once('/').map(|(base, _)| base).unwrap_or(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ShapeDesc, ShapeEntry};

    fn sphere_desc() -> BodyDesc {
        BodyDesc {
            shapes: vec![ShapeEntry::new(ShapeDesc::Sphere { radius: 0.5 })],
            ..Default::default()
        }
    }

    fn small_world() -> Physics {
        Physics::new(WorldConfig {
            max_bodies: 3,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_duplicate_identity_fails_fast() {
        let mut physics = small_world();
        physics
            .add_body("ball", sphere_desc(), EntityCallbacks::default(), None)
            .unwrap();
        let err = physics
            .add_body("ball", sphere_desc(), EntityCallbacks::default(), None)
            .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateIdentity(id) if id == "ball"));
        physics.terminate();
    }

    #[test]
    fn test_capacity_is_enforced_before_dispatch() {
        let mut physics = small_world();
        let err = physics
            .add_bodies(
                "boxes",
                vec![sphere_desc(); 4],
                EntityCallbacks::default(),
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::CapacityExceeded { requested: 4, max: 3 }
        ));
        assert_eq!(physics.body_count(), 0);
        physics.terminate();
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let mut physics = small_world();
        let err = physics
            .add_bodies("none", Vec::new(), EntityCallbacks::default(), None)
            .unwrap_err();
        assert!(matches!(err, BridgeError::EmptyBatch));
        physics.terminate();
    }

    #[test]
    fn test_remove_frees_capacity() {
        let mut physics = small_world();
        physics
            .add_bodies(
                "boxes",
                vec![sphere_desc(); 3],
                EntityCallbacks::default(),
                None,
            )
            .unwrap();
        assert_eq!(physics.body_count(), 3);
        physics.remove_body("boxes").unwrap();
        assert_eq!(physics.body_count(), 0);
        physics
            .add_body("ball", sphere_desc(), EntityCallbacks::default(), None)
            .unwrap();
        physics.terminate();
    }

    #[test]
    fn test_second_step_is_dropped_while_in_flight() {
        let mut physics = small_world();
        assert!(!physics.is_stepping());
        physics.step(1.0 / 60.0).unwrap();
        assert!(physics.is_stepping());
        // The baton is away; this call must not send a second step.
        physics.step(1.0 / 60.0).unwrap();
        assert!(physics.is_stepping());
        physics.terminate();
    }

    #[test]
    fn test_paused_bridge_ignores_step() {
        let mut physics = small_world();
        physics.pause();
        physics.step(1.0).unwrap();
        // Buffers never left, so nothing was in flight.
        assert!(!physics.is_stepping());
        physics.resume();
        physics.step(1.0 / 60.0).unwrap();
        assert!(physics.is_stepping());
        physics.terminate();
    }

    #[test]
    fn test_listener_key_strips_replica_suffix() {
        let events = EventTable::new();
        assert_eq!(listener_key(&events, "boxes/7"), "boxes");
        assert_eq!(listener_key(&events, "ball"), "ball");
    }

    #[test]
    fn test_listener_key_prefers_exact_identity_with_slash() {
        let mut events = EventTable::new();
        events.install(
            "level/door",
            EntityCallbacks {
                collide: Some(Box::new(|_| {})),
                ..Default::default()
            },
        );
        // A plain body whose name contains '/' routes to itself, not to
        // a phantom "level" listener.
        assert_eq!(listener_key(&events, "level/door"), "level/door");
        assert_eq!(listener_key(&events, "boxes/3"), "boxes");
    }

    #[test]
    fn test_single_replica_instanced_body_is_removed_host_side() {
        let mut physics = small_world();
        physics
            .add_bodies(
                "solo",
                vec![sphere_desc()],
                EntityCallbacks::default(),
                None,
            )
            .unwrap();
        pump_until(&mut physics, |p| p.registry().len() == 1);

        physics.remove_body("solo").unwrap();
        // The host must actually drop the replica-named body; the
        // follow-up sync rebuilds the registry empty.
        pump_until(&mut physics, |p| p.registry().is_empty());
        assert_eq!(physics.body_count(), 0);
        physics.terminate();
    }

    fn pump_until(physics: &mut Physics, done: impl Fn(&Physics) -> bool) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while !done(physics) {
            assert!(
                std::time::Instant::now() < deadline,
                "condition never reached"
            );
            physics.process_messages();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}
