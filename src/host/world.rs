//! Simulation host owning the Rapier world
//!
//! The host runs inside the worker context and is the exclusive owner of
//! all physical state. It executes inbound operations in order, one at a
//! time, and reports results only by returning outbound envelopes; it
//! never reaches back across the boundary.

use crate::config::{Broadphase, ContactMaterialDef, WorldConfig};
use crate::host::stepper::FixedStepper;
use crate::protocol::{
    BodyDesc, BodyType, ConstraintDesc, ConstraintKind, ContactInfo, ContactMaterialDesc, Identity,
    ObservedValue, Observation, RayDesc, RayHitInfo, RayMode, Reply, Request, ShapeDesc,
    ShapeEntry, SpringDesc, VehicleDesc, WatchProperty,
};
use rapier3d::control::{DynamicRayCastVehicleController, WheelTuning};
use rapier3d::na;
use rapier3d::parry::shape::FeatureId;
use rapier3d::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// One tracked body: the Rapier handle plus the wire-level attributes the
/// host needs again after creation
struct BodyRecord {
    handle: RigidBodyHandle,
    group: u32,
    mask: u32,
    on_collide: bool,
    on_collide_begin: bool,
    on_collide_end: bool,
}

/// One constraint: the joint data is kept host-side so disable/enable can
/// remove and re-insert the live joint without losing motor settings
struct ConstraintRecord {
    body_a: RigidBodyHandle,
    body_b: RigidBodyHandle,
    data: GenericJoint,
    handle: Option<ImpulseJointHandle>,
    motor_speed: f32,
    motor_max_force: f32,
    motor_enabled: bool,
}

/// Springs are force generators, not joints: equal and opposite impulses
/// applied at the anchors every sub-step
struct SpringRecord {
    desc: SpringDesc,
    body_a: RigidBodyHandle,
    body_b: RigidBodyHandle,
}

struct VehicleRecord {
    controller: DynamicRayCastVehicleController,
    chassis: RigidBodyHandle,
}

/// Raw contact captured during a pipeline step, resolved to identities
/// after the step completes
struct ContactRecord {
    started: bool,
    collider_a: ColliderHandle,
    collider_b: ColliderHandle,
    normal: [f32; 3],
    points: Vec<[f32; 3]>,
    impact_velocity: f32,
}

/// Collects Rapier collision events during a step.
///
/// Rapier hands events to a shared reference, so the queue sits behind a
/// mutex; contention is impossible because the host steps on one thread.
#[derive(Default)]
struct ContactCollector {
    queue: Mutex<Vec<ContactRecord>>,
}

impl EventHandler for ContactCollector {
    fn handle_collision_event(
        &self,
        bodies: &RigidBodySet,
        colliders: &ColliderSet,
        event: CollisionEvent,
        contact_pair: Option<&ContactPair>,
    ) {
        let mut normal = [0.0; 3];
        let mut points = Vec::new();
        let mut impact_velocity = 0.0;

        if let Some(pair) = contact_pair {
            if let Some(manifold) = pair.manifolds.first() {
                let n = manifold.data.normal;
                normal = [n.x, n.y, n.z];
                if let Some(collider) = colliders.get(pair.collider1) {
                    for point in &manifold.points {
                        let world = collider.position() * point.local_p1;
                        points.push([world.x, world.y, world.z]);
                    }
                }
                let velocity_of = |handle: ColliderHandle| {
                    colliders
                        .get(handle)
                        .and_then(|c| c.parent())
                        .and_then(|b| bodies.get(b))
                        .map(|b| *b.linvel())
                        .unwrap_or_else(na::Vector3::zeros)
                };
                let relative = velocity_of(pair.collider2) - velocity_of(pair.collider1);
                impact_velocity = relative.dot(&n);
            }
        }

        if let Ok(mut queue) = self.queue.lock() {
            queue.push(ContactRecord {
                started: event.started(),
                collider_a: event.collider1(),
                collider_b: event.collider2(),
                normal,
                points,
                impact_velocity,
            });
        }
    }

    fn handle_contact_force_event(
        &self,
        _dt: Real,
        _bodies: &RigidBodySet,
        _colliders: &ColliderSet,
        _contact_pair: &ContactPair,
        _total_force_magnitude: Real,
    ) {
    }
}

/// Applies per-pair contact material overrides through Rapier's contact
/// modification hook.
///
/// Collider `user_data` carries the material id shifted by one, so zero
/// keeps meaning "no material".
#[derive(Default)]
struct PairMaterialHooks {
    pairs: HashMap<(u32, u32), (f32, f32)>,
}

impl PairMaterialHooks {
    fn material_of(colliders: &ColliderSet, handle: ColliderHandle) -> u32 {
        colliders.get(handle).map(|c| c.user_data as u32).unwrap_or(0)
    }
}

impl PhysicsHooks for PairMaterialHooks {
    fn modify_solver_contacts(&self, context: &mut ContactModificationContext) {
        let a = Self::material_of(context.colliders, context.collider1);
        let b = Self::material_of(context.colliders, context.collider2);
        if a == 0 || b == 0 {
            return;
        }
        let key = if a <= b { (a, b) } else { (b, a) };
        if let Some(&(friction, restitution)) = self.pairs.get(&key) {
            for contact in context.solver_contacts.iter_mut() {
                contact.friction = friction;
                contact.restitution = restitution;
            }
        }
    }
}

/// The physics world plus every identity table, owned by the worker
pub struct SimulationHost {
    gravity: na::Vector3<Real>,
    integration_parameters: IntegrationParameters,
    pipeline: PhysicsPipeline,
    islands: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    query_pipeline: QueryPipeline,
    collector: ContactCollector,
    hooks: PairMaterialHooks,
    stepper: FixedStepper,

    /// Ordered identity list; position in this vec *is* the registry index
    order: Vec<Identity>,
    records: HashMap<Identity, BodyRecord>,
    identities: HashMap<RigidBodyHandle, Identity>,
    constraints: HashMap<Identity, ConstraintRecord>,
    springs: BTreeMap<Identity, SpringRecord>,
    rays: BTreeMap<Identity, RayDesc>,
    vehicles: BTreeMap<Identity, VehicleRecord>,
    contact_materials: HashMap<u32, ContactMaterialDesc>,
    subscriptions: BTreeMap<u32, (Identity, WatchProperty)>,

    default_material: ContactMaterialDef,
    allow_sleep: bool,
    broadphase_kind: Broadphase,
    membership_dirty: bool,
}

impl SimulationHost {
    pub fn new() -> Self {
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = 1.0 / 60.0;

        Self {
            gravity: vector![0.0, -9.81, 0.0],
            integration_parameters,
            pipeline: PhysicsPipeline::new(),
            islands: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            collector: ContactCollector::default(),
            hooks: PairMaterialHooks::default(),
            stepper: FixedStepper::new(),
            order: Vec::new(),
            records: HashMap::new(),
            identities: HashMap::new(),
            constraints: HashMap::new(),
            springs: BTreeMap::new(),
            rays: BTreeMap::new(),
            vehicles: BTreeMap::new(),
            contact_materials: HashMap::new(),
            subscriptions: BTreeMap::new(),
            default_material: ContactMaterialDef::default(),
            allow_sleep: false,
            broadphase_kind: Broadphase::Naive,
            membership_dirty: false,
        }
    }

    /// Execute one inbound operation and return the outbound envelopes it
    /// produced. This is the single dispatch seam; the worker loop and
    /// the tests both drive it.
    pub fn execute(&mut self, request: Request) -> Vec<Reply> {
        match request {
            Request::Init { config } => {
                self.apply_config(&config);
                Vec::new()
            }
            Request::Step {
                time_since_last_called,
                step_size,
                max_sub_steps,
                positions,
                quaternions,
            } => self.step(
                time_since_last_called,
                step_size,
                max_sub_steps,
                positions,
                quaternions,
            ),
            Request::AddBody { identity, desc } => {
                self.insert_body(identity, &desc);
                vec![self.sync_reply()]
            }
            Request::AddBodies { identities, descs } => {
                for (identity, desc) in identities.into_iter().zip(descs.iter()) {
                    self.insert_body(identity, desc);
                }
                // One republish after the whole batch, never per member
                vec![self.sync_reply()]
            }
            Request::RemoveBody { identity } => {
                self.remove_body(&identity);
                vec![self.sync_reply()]
            }
            Request::RemoveBodies { identities } => {
                for identity in &identities {
                    self.remove_body(identity);
                }
                vec![self.sync_reply()]
            }
            Request::AddConstraint { identity, desc } => {
                self.insert_constraint(identity, &desc);
                Vec::new()
            }
            Request::RemoveConstraint { identity } => {
                if let Some(record) = self.constraints.remove(&identity) {
                    if let Some(handle) = record.handle {
                        self.impulse_joints.remove(handle, true);
                    }
                }
                Vec::new()
            }
            Request::AddSpring { identity, desc } => {
                if let (Some(a), Some(b)) = (
                    self.records.get(&desc.body_a).map(|r| r.handle),
                    self.records.get(&desc.body_b).map(|r| r.handle),
                ) {
                    self.springs.insert(
                        identity,
                        SpringRecord {
                            desc,
                            body_a: a,
                            body_b: b,
                        },
                    );
                }
                Vec::new()
            }
            Request::RemoveSpring { identity } => {
                self.springs.remove(&identity);
                Vec::new()
            }
            Request::AddRay { identity, desc } => {
                self.rays.insert(identity, desc);
                Vec::new()
            }
            Request::RemoveRay { identity } => {
                self.rays.remove(&identity);
                Vec::new()
            }
            Request::AddContactMaterial { desc } => {
                let key = pair_key(desc.material_a, desc.material_b);
                self.hooks.pairs.insert(key, (desc.friction, desc.restitution));
                self.contact_materials.insert(desc.id, desc);
                Vec::new()
            }
            Request::RemoveContactMaterial { id } => {
                if let Some(desc) = self.contact_materials.remove(&id) {
                    self.hooks
                        .pairs
                        .remove(&pair_key(desc.material_a, desc.material_b));
                }
                Vec::new()
            }
            Request::AddRaycastVehicle { identity, desc } => {
                self.insert_vehicle(identity, &desc);
                Vec::new()
            }
            Request::RemoveRaycastVehicle { identity } => {
                self.vehicles.remove(&identity);
                Vec::new()
            }
            Request::SetPosition { identity, position } => {
                self.with_body(&identity, |body| {
                    body.set_translation(vector![position[0], position[1], position[2]], true);
                });
                Vec::new()
            }
            Request::SetQuaternion {
                identity,
                quaternion,
            } => {
                self.with_body(&identity, |body| {
                    body.set_rotation(to_rotation(quaternion), true);
                });
                Vec::new()
            }
            Request::SetVelocity { identity, velocity } => {
                self.with_body(&identity, |body| {
                    body.set_linvel(vector![velocity[0], velocity[1], velocity[2]], true);
                });
                Vec::new()
            }
            Request::SetAngularVelocity {
                identity,
                angular_velocity,
            } => {
                self.with_body(&identity, |body| {
                    body.set_angvel(
                        vector![
                            angular_velocity[0],
                            angular_velocity[1],
                            angular_velocity[2]
                        ],
                        true,
                    );
                });
                Vec::new()
            }
            Request::SetMass { identity, mass } => {
                self.with_body(&identity, |body| {
                    body.set_additional_mass(mass, true);
                });
                Vec::new()
            }
            Request::SetLinearDamping { identity, damping } => {
                self.with_body(&identity, |body| body.set_linear_damping(damping));
                Vec::new()
            }
            Request::SetAngularDamping { identity, damping } => {
                self.with_body(&identity, |body| body.set_angular_damping(damping));
                Vec::new()
            }
            Request::SetLinearFactor { identity, factor } => {
                self.with_body(&identity, |body| {
                    body.set_enabled_translations(
                        factor[0] != 0.0,
                        factor[1] != 0.0,
                        factor[2] != 0.0,
                        true,
                    );
                });
                Vec::new()
            }
            Request::SetAngularFactor { identity, factor } => {
                self.with_body(&identity, |body| {
                    body.set_enabled_rotations(
                        factor[0] != 0.0,
                        factor[1] != 0.0,
                        factor[2] != 0.0,
                        true,
                    );
                });
                Vec::new()
            }
            Request::SetFixedRotation { identity, fixed } => {
                self.with_body(&identity, |body| body.lock_rotations(fixed, true));
                Vec::new()
            }
            Request::SetIsTrigger {
                identity,
                is_trigger,
            } => {
                self.for_each_collider(&identity, |collider| collider.set_sensor(is_trigger));
                Vec::new()
            }
            Request::SetCollisionFilterGroup { identity, group } => {
                if let Some(record) = self.records.get_mut(&identity) {
                    record.group = group;
                }
                self.refresh_collision_groups(&identity);
                Vec::new()
            }
            Request::SetCollisionFilterMask { identity, mask } => {
                if let Some(record) = self.records.get_mut(&identity) {
                    record.mask = mask;
                }
                self.refresh_collision_groups(&identity);
                Vec::new()
            }
            Request::SetSleepSpeedLimit { identity, limit } => {
                self.with_body(&identity, |body| {
                    body.activation_mut().normalized_linear_threshold = limit;
                });
                Vec::new()
            }
            Request::SetSleepTimeLimit { identity, limit } => {
                self.with_body(&identity, |body| {
                    body.activation_mut().time_until_sleep = limit;
                });
                Vec::new()
            }
            Request::ApplyForce {
                identity,
                force,
                world_point,
            } => {
                self.with_body(&identity, |body| {
                    body.add_force_at_point(
                        vector![force[0], force[1], force[2]],
                        point![world_point[0], world_point[1], world_point[2]],
                        true,
                    );
                });
                Vec::new()
            }
            Request::ApplyImpulse {
                identity,
                impulse,
                world_point,
            } => {
                self.with_body(&identity, |body| {
                    body.apply_impulse_at_point(
                        vector![impulse[0], impulse[1], impulse[2]],
                        point![world_point[0], world_point[1], world_point[2]],
                        true,
                    );
                });
                Vec::new()
            }
            Request::ApplyLocalForce {
                identity,
                force,
                local_point,
            } => {
                self.with_body(&identity, |body| {
                    let position = *body.position();
                    let world_force =
                        position.rotation * vector![force[0], force[1], force[2]];
                    let world_point =
                        position * point![local_point[0], local_point[1], local_point[2]];
                    body.add_force_at_point(world_force, world_point, true);
                });
                Vec::new()
            }
            Request::ApplyLocalImpulse {
                identity,
                impulse,
                local_point,
            } => {
                self.with_body(&identity, |body| {
                    let position = *body.position();
                    let world_impulse =
                        position.rotation * vector![impulse[0], impulse[1], impulse[2]];
                    let world_point =
                        position * point![local_point[0], local_point[1], local_point[2]];
                    body.apply_impulse_at_point(world_impulse, world_point, true);
                });
                Vec::new()
            }
            Request::ApplyTorque { identity, torque } => {
                self.with_body(&identity, |body| {
                    body.add_torque(vector![torque[0], torque[1], torque[2]], true);
                });
                Vec::new()
            }
            Request::Sleep { identity } => {
                self.with_body(&identity, |body| body.sleep());
                Vec::new()
            }
            Request::WakeUp { identity } => {
                self.with_body(&identity, |body| body.wake_up(true));
                Vec::new()
            }
            Request::EnableConstraint { identity } => {
                if let Some(record) = self.constraints.get_mut(&identity) {
                    if record.handle.is_none() {
                        record.handle = Some(self.impulse_joints.insert(
                            record.body_a,
                            record.body_b,
                            record.data,
                            true,
                        ));
                    }
                }
                Vec::new()
            }
            Request::DisableConstraint { identity } => {
                if let Some(record) = self.constraints.get_mut(&identity) {
                    if let Some(handle) = record.handle.take() {
                        self.impulse_joints.remove(handle, true);
                    }
                }
                Vec::new()
            }
            Request::EnableConstraintMotor { identity } => {
                self.update_motor(&identity, |record| record.motor_enabled = true);
                Vec::new()
            }
            Request::DisableConstraintMotor { identity } => {
                self.update_motor(&identity, |record| record.motor_enabled = false);
                Vec::new()
            }
            Request::SetConstraintMotorSpeed { identity, speed } => {
                self.update_motor(&identity, |record| record.motor_speed = speed);
                Vec::new()
            }
            Request::SetConstraintMotorMaxForce {
                identity,
                max_force,
            } => {
                self.update_motor(&identity, |record| record.motor_max_force = max_force);
                Vec::new()
            }
            Request::SetSpringStiffness {
                identity,
                stiffness,
            } => {
                if let Some(record) = self.springs.get_mut(&identity) {
                    record.desc.stiffness = stiffness;
                }
                Vec::new()
            }
            Request::SetSpringDamping { identity, damping } => {
                if let Some(record) = self.springs.get_mut(&identity) {
                    record.desc.damping = damping;
                }
                Vec::new()
            }
            Request::SetSpringRestLength {
                identity,
                rest_length,
            } => {
                if let Some(record) = self.springs.get_mut(&identity) {
                    record.desc.rest_length = rest_length;
                }
                Vec::new()
            }
            Request::SetRaycastVehicleSteering {
                identity,
                wheel,
                value,
            } => {
                self.with_wheel(&identity, wheel, |w| w.steering = value);
                Vec::new()
            }
            Request::ApplyRaycastVehicleEngineForce {
                identity,
                wheel,
                value,
            } => {
                self.with_wheel(&identity, wheel, |w| w.engine_force = value);
                Vec::new()
            }
            Request::SetRaycastVehicleBrake {
                identity,
                wheel,
                value,
            } => {
                self.with_wheel(&identity, wheel, |w| w.brake = value);
                Vec::new()
            }
            Request::SetGravity { gravity } => {
                self.gravity = vector![gravity[0], gravity[1], gravity[2]];
                debug!(?gravity, "gravity updated");
                Vec::new()
            }
            Request::SetIterations { iterations } => {
                if let Some(count) = NonZeroUsize::new(iterations.max(1) as usize) {
                    self.integration_parameters.num_solver_iterations = count;
                }
                Vec::new()
            }
            Request::SetTolerance { tolerance } => {
                self.integration_parameters.normalized_allowed_linear_error = tolerance;
                Vec::new()
            }
            Request::SetBroadphase { broadphase } => {
                self.broadphase_kind = broadphase.as_str().into();
                info!(broadphase = self.broadphase_kind.name(), "broadphase selected");
                Vec::new()
            }
            Request::SetAllowSleep { allow_sleep } => {
                self.set_allow_sleep(allow_sleep);
                Vec::new()
            }
            Request::Subscribe {
                id,
                identity,
                property,
            } => {
                self.subscriptions.insert(id, (identity, property));
                Vec::new()
            }
            Request::Unsubscribe { id } => {
                self.subscriptions.remove(&id);
                Vec::new()
            }
            // Handled by the worker loop before dispatch; inert here so
            // the match stays exhaustive without a wildcard.
            Request::Shutdown => Vec::new(),
        }
    }

    /// Number of bodies currently in the world
    pub fn body_count(&self) -> usize {
        self.order.len()
    }

    fn apply_config(&mut self, config: &WorldConfig) {
        self.gravity = vector![config.gravity[0], config.gravity[1], config.gravity[2]];
        if let Some(count) = NonZeroUsize::new(config.iterations.max(1) as usize) {
            self.integration_parameters.num_solver_iterations = count;
        }
        self.integration_parameters.normalized_allowed_linear_error = config.tolerance;
        self.integration_parameters.dt = config.step_size;
        self.broadphase_kind = config.broadphase;
        self.default_material = config.default_contact_material;
        self.set_allow_sleep(config.allow_sleep);
        self.stepper.reset();
        info!(
            gravity = ?config.gravity,
            iterations = config.iterations,
            broadphase = config.broadphase.name(),
            allow_sleep = config.allow_sleep,
            "world configured"
        );
    }

    fn set_allow_sleep(&mut self, allow: bool) {
        self.allow_sleep = allow;
        for (_, body) in self.bodies.iter_mut() {
            if allow {
                *body.activation_mut() = RigidBodyActivation::default();
            } else {
                *body.activation_mut() = RigidBodyActivation::cannot_sleep();
                body.wake_up(true);
            }
        }
    }

    fn sync_reply(&mut self) -> Reply {
        self.membership_dirty = true;
        Reply::Sync {
            bodies: self.order.clone(),
        }
    }

    fn with_body(&mut self, identity: &str, apply: impl FnOnce(&mut RigidBody)) {
        match self
            .records
            .get(identity)
            .and_then(|record| self.bodies.get_mut(record.handle))
        {
            Some(body) => apply(body),
            // Expected under asynchronous dispatch: the body may have been
            // removed while this operation was in flight.
            None => trace!(identity, "mutation for unknown identity ignored"),
        }
    }

    fn for_each_collider(&mut self, identity: &str, mut apply: impl FnMut(&mut Collider)) {
        let handles: Vec<ColliderHandle> = self
            .records
            .get(identity)
            .and_then(|record| self.bodies.get(record.handle))
            .map(|body| body.colliders().to_vec())
            .unwrap_or_default();
        for handle in handles {
            if let Some(collider) = self.colliders.get_mut(handle) {
                apply(collider);
            }
        }
    }

    fn refresh_collision_groups(&mut self, identity: &str) {
        let Some(record) = self.records.get(identity) else {
            return;
        };
        let groups = InteractionGroups::new(
            Group::from_bits_truncate(record.group),
            Group::from_bits_truncate(record.mask),
        );
        self.for_each_collider(identity, |collider| collider.set_collision_groups(groups));
    }

    fn update_motor(&mut self, identity: &str, change: impl FnOnce(&mut ConstraintRecord)) {
        let Some(record) = self.constraints.get_mut(identity) else {
            trace!(identity, "motor op for unknown constraint ignored");
            return;
        };
        change(record);
        if record.motor_enabled {
            record
                .data
                .set_motor_velocity(JointAxis::AngX, record.motor_speed, 1.0)
                .set_motor_max_force(JointAxis::AngX, record.motor_max_force);
        } else {
            record
                .data
                .set_motor_velocity(JointAxis::AngX, 0.0, 0.0)
                .set_motor_max_force(JointAxis::AngX, 0.0);
        }
        if let Some(handle) = record.handle {
            if let Some(joint) = self.impulse_joints.get_mut(handle) {
                joint.data = record.data;
            }
        }
    }

    fn insert_body(&mut self, identity: Identity, desc: &BodyDesc) {
        if self.records.contains_key(&identity) {
            warn!(identity, "duplicate identity, add ignored");
            return;
        }

        let body_type = match desc.body_type {
            BodyType::Dynamic => RigidBodyType::Dynamic,
            BodyType::Static => RigidBodyType::Fixed,
            BodyType::Kinematic => RigidBodyType::KinematicPositionBased,
        };

        let builder = RigidBodyBuilder::new(body_type)
            .position(to_isometry(desc.position, desc.quaternion))
            .linvel(vector![
                desc.velocity[0],
                desc.velocity[1],
                desc.velocity[2]
            ])
            .angvel(vector![
                desc.angular_velocity[0],
                desc.angular_velocity[1],
                desc.angular_velocity[2]
            ])
            .linear_damping(desc.linear_damping)
            .angular_damping(desc.angular_damping)
            .additional_mass(desc.mass)
            .can_sleep(desc.allow_sleep && self.allow_sleep)
            .enabled_translations(
                desc.linear_factor[0] != 0.0,
                desc.linear_factor[1] != 0.0,
                desc.linear_factor[2] != 0.0,
            )
            .enabled_rotations(
                desc.angular_factor[0] != 0.0 && !desc.fixed_rotation,
                desc.angular_factor[1] != 0.0 && !desc.fixed_rotation,
                desc.angular_factor[2] != 0.0 && !desc.fixed_rotation,
            );

        let handle = self.bodies.insert(builder);
        if let Some(body) = self.bodies.get_mut(handle) {
            let activation = body.activation_mut();
            activation.normalized_linear_threshold = desc.sleep_speed_limit;
            activation.time_until_sleep = desc.sleep_time_limit;
        }

        // Compound shapes are flattened into a list of colliders with
        // composed offsets; rapier has no nested collider tree.
        let mut pending: Vec<(Isometry<Real>, ShapeEntry)> = desc
            .shapes
            .iter()
            .map(|entry| (Isometry::identity(), entry.clone()))
            .collect();

        while let Some((origin, entry)) = pending.pop() {
            let local = origin * to_isometry(entry.offset, entry.orientation);
            if let ShapeDesc::Compound { children } = &entry.shape {
                for child in children {
                    pending.push((local, child.clone()));
                }
                continue;
            }
            let Some(builder) = collider_builder(&entry.shape) else {
                // Unknown shape tag: the body stays an inert placeholder
                // instead of failing the whole batch.
                warn!(identity, "unknown shape tag, body created with zero shapes");
                continue;
            };
            let (friction, restitution, material_tag) = match desc.material {
                Some(material) => (material.friction, material.restitution, material.id as u128 + 1),
                None => (
                    self.default_material.friction,
                    self.default_material.restitution,
                    0,
                ),
            };
            let mut builder = builder
                .position(local)
                .friction(friction)
                .restitution(restitution)
                .density(0.0)
                .sensor(desc.is_trigger)
                .collision_groups(InteractionGroups::new(
                    Group::from_bits_truncate(desc.collision_filter_group),
                    Group::from_bits_truncate(desc.collision_filter_mask),
                ))
                .user_data(material_tag);
            if desc.on_collide || desc.on_collide_begin || desc.on_collide_end {
                builder = builder.active_events(ActiveEvents::COLLISION_EVENTS);
            }
            if material_tag != 0 {
                builder = builder.active_hooks(ActiveHooks::MODIFY_SOLVER_CONTACTS);
            }
            self.colliders
                .insert_with_parent(builder, handle, &mut self.bodies);
        }

        self.identities.insert(handle, identity.clone());
        self.order.push(identity.clone());
        self.records.insert(
            identity,
            BodyRecord {
                handle,
                group: desc.collision_filter_group,
                mask: desc.collision_filter_mask,
                on_collide: desc.on_collide,
                on_collide_begin: desc.on_collide_begin,
                on_collide_end: desc.on_collide_end,
            },
        );
    }

    fn remove_body(&mut self, identity: &str) {
        let Some(record) = self.records.remove(identity) else {
            trace!(identity, "removal for unknown identity ignored");
            return;
        };
        self.identities.remove(&record.handle);
        self.order.retain(|id| id != identity);
        self.bodies.remove(
            record.handle,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
        debug!(identity, remaining = self.order.len(), "body removed");
    }

    fn insert_constraint(&mut self, identity: Identity, desc: &ConstraintDesc) {
        let (Some(a), Some(b)) = (
            self.records.get(&desc.body_a).map(|r| r.handle),
            self.records.get(&desc.body_b).map(|r| r.handle),
        ) else {
            trace!(identity, "constraint references missing bodies, ignored");
            return;
        };

        let data: GenericJoint = match &desc.kind {
            ConstraintKind::PointToPoint { pivot_a, pivot_b } => SphericalJointBuilder::new()
                .local_anchor1(point![pivot_a[0], pivot_a[1], pivot_a[2]])
                .local_anchor2(point![pivot_b[0], pivot_b[1], pivot_b[2]])
                .build()
                .into(),
            ConstraintKind::Hinge {
                pivot_a,
                pivot_b,
                axis_a,
                axis_b,
            } => {
                let mut data: GenericJoint =
                    RevoluteJointBuilder::new(to_unit_axis(*axis_a))
                        .local_anchor1(point![pivot_a[0], pivot_a[1], pivot_a[2]])
                        .local_anchor2(point![pivot_b[0], pivot_b[1], pivot_b[2]])
                        .build()
                        .into();
                data.set_local_axis2(to_unit_axis(*axis_b));
                data
            }
            ConstraintKind::Distance { distance } => {
                RopeJointBuilder::new(*distance).build().into()
            }
            ConstraintKind::Lock => {
                // Weld at the current relative pose
                let frame = self
                    .bodies
                    .get(a)
                    .zip(self.bodies.get(b))
                    .map(|(body_a, body_b)| body_a.position().inv_mul(body_b.position()))
                    .unwrap_or_else(Isometry::identity);
                FixedJointBuilder::new().local_frame1(frame).build().into()
            }
            ConstraintKind::ConeTwist {
                pivot_a,
                pivot_b,
                axis_a,
                axis_b,
                angle,
                twist_angle,
            } => {
                let mut data: GenericJoint = SphericalJointBuilder::new()
                    .local_anchor1(point![pivot_a[0], pivot_a[1], pivot_a[2]])
                    .local_anchor2(point![pivot_b[0], pivot_b[1], pivot_b[2]])
                    .build()
                    .into();
                data.set_local_axis1(to_unit_axis(*axis_a));
                data.set_local_axis2(to_unit_axis(*axis_b));
                data.set_limits(JointAxis::AngX, [-*twist_angle, *twist_angle]);
                data.set_limits(JointAxis::AngY, [-*angle, *angle]);
                data.set_limits(JointAxis::AngZ, [-*angle, *angle]);
                data
            }
        };

        let handle = self.impulse_joints.insert(a, b, data, true);
        self.constraints.insert(
            identity,
            ConstraintRecord {
                body_a: a,
                body_b: b,
                data,
                handle: Some(handle),
                motor_speed: 0.0,
                motor_max_force: f32::MAX,
                motor_enabled: false,
            },
        );
    }

    fn insert_vehicle(&mut self, identity: Identity, desc: &VehicleDesc) {
        let Some(chassis) = self.records.get(&desc.chassis).map(|r| r.handle) else {
            trace!(identity, "vehicle references missing chassis, ignored");
            return;
        };
        let mut controller = DynamicRayCastVehicleController::new(chassis);
        for wheel in &desc.wheels {
            let tuning = WheelTuning {
                suspension_stiffness: wheel.suspension_stiffness,
                max_suspension_travel: wheel.max_suspension_travel,
                friction_slip: wheel.friction_slip,
                ..WheelTuning::default()
            };
            controller.add_wheel(
                point![
                    wheel.connection_point[0],
                    wheel.connection_point[1],
                    wheel.connection_point[2]
                ],
                vector![wheel.direction[0], wheel.direction[1], wheel.direction[2]],
                vector![wheel.axle[0], wheel.axle[1], wheel.axle[2]],
                wheel.suspension_rest_length,
                wheel.radius,
                &tuning,
            );
        }
        self.vehicles
            .insert(identity, VehicleRecord { controller, chassis });
    }

    fn with_wheel(&mut self, identity: &str, wheel: usize, apply: impl FnOnce(&mut rapier3d::control::Wheel)) {
        if let Some(vehicle) = self.vehicles.get_mut(identity) {
            if let Some(wheel) = vehicle.controller.wheels_mut().get_mut(wheel) {
                apply(wheel);
            }
        }
    }

    fn step(
        &mut self,
        elapsed: f32,
        step_size: f32,
        max_sub_steps: u32,
        mut positions: Vec<f32>,
        mut quaternions: Vec<f32>,
    ) -> Vec<Reply> {
        let sub_steps = self.stepper.advance(elapsed, step_size, max_sub_steps);
        self.integration_parameters.dt = step_size;
        self.query_pipeline.update(&self.colliders);

        for _ in 0..sub_steps {
            self.apply_spring_impulses(step_size);
            self.update_vehicles(step_size);
            self.pipeline.step(
                &self.gravity,
                &self.integration_parameters,
                &mut self.islands,
                &mut self.broad_phase,
                &mut self.narrow_phase,
                &mut self.bodies,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                &mut self.ccd_solver,
                Some(&mut self.query_pipeline),
                &self.hooks,
                &self.collector,
            );
        }

        if sub_steps > 0 {
            // Forces from applyForce/applyTorque last exactly one step
            for (_, body) in self.bodies.iter_mut() {
                body.reset_forces(false);
                body.reset_torques(false);
            }
        }

        let mut replies = self.drain_contacts();
        replies.extend(self.cast_rays());

        // Fill the transform buffers in registry order and hand them back
        let count = self.order.len();
        positions.resize(3 * count, 0.0);
        quaternions.resize(4 * count, 0.0);
        for (index, identity) in self.order.iter().enumerate() {
            let Some(body) = self
                .records
                .get(identity)
                .and_then(|record| self.bodies.get(record.handle))
            else {
                continue;
            };
            let translation = body.translation();
            positions[3 * index] = translation.x;
            positions[3 * index + 1] = translation.y;
            positions[3 * index + 2] = translation.z;
            let rotation = body.rotation();
            quaternions[4 * index] = rotation.i;
            quaternions[4 * index + 1] = rotation.j;
            quaternions[4 * index + 2] = rotation.k;
            quaternions[4 * index + 3] = rotation.w;
        }

        let active = self
            .bodies
            .iter()
            .any(|(_, body)| !body.is_fixed() && !body.is_sleeping());

        let bodies = if self.membership_dirty {
            self.membership_dirty = false;
            Some(self.order.clone())
        } else {
            None
        };

        replies.push(Reply::Frame {
            positions,
            quaternions,
            bodies,
            active,
            observations: self.collect_observations(),
        });
        replies
    }

    fn apply_spring_impulses(&mut self, dt: f32) {
        let mut impulses: Vec<(RigidBodyHandle, na::Vector3<Real>, Point<Real>)> = Vec::new();

        for record in self.springs.values() {
            let (Some(body_a), Some(body_b)) =
                (self.bodies.get(record.body_a), self.bodies.get(record.body_b))
            else {
                continue;
            };
            let anchor_a = body_a.position()
                * point![
                    record.desc.local_anchor_a[0],
                    record.desc.local_anchor_a[1],
                    record.desc.local_anchor_a[2]
                ];
            let anchor_b = body_b.position()
                * point![
                    record.desc.local_anchor_b[0],
                    record.desc.local_anchor_b[1],
                    record.desc.local_anchor_b[2]
                ];
            let delta = anchor_b - anchor_a;
            let length = delta.norm();
            if length <= f32::EPSILON {
                continue;
            }
            let direction = delta / length;
            let relative_velocity = (body_b.velocity_at_point(&anchor_b)
                - body_a.velocity_at_point(&anchor_a))
            .dot(&direction);
            let magnitude = record.desc.stiffness * (length - record.desc.rest_length)
                + record.desc.damping * relative_velocity;
            let impulse = direction * magnitude * dt;
            impulses.push((record.body_a, impulse, anchor_a));
            impulses.push((record.body_b, -impulse, anchor_b));
        }

        for (handle, impulse, point) in impulses {
            if let Some(body) = self.bodies.get_mut(handle) {
                body.apply_impulse_at_point(impulse, point, true);
            }
        }
    }

    fn update_vehicles(&mut self, dt: f32) {
        for vehicle in self.vehicles.values_mut() {
            if !self.bodies.contains(vehicle.chassis) {
                continue;
            }
            vehicle.controller.update_vehicle(
                dt,
                &mut self.bodies,
                &self.colliders,
                &self.query_pipeline,
                QueryFilter::default().exclude_rigid_body(vehicle.chassis),
            );
        }
    }

    fn drain_contacts(&mut self) -> Vec<Reply> {
        let contacts = match self.collector.queue.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(_) => Vec::new(),
        };

        let mut replies = Vec::new();
        for contact in contacts {
            let (Some(id_a), Some(id_b)) = (
                self.identity_of_collider(contact.collider_a),
                self.identity_of_collider(contact.collider_b),
            ) else {
                continue;
            };
            let (record_a, record_b) = match (self.records.get(&id_a), self.records.get(&id_b)) {
                (Some(a), Some(b)) => (a, b),
                _ => continue,
            };

            if contact.started {
                if record_a.on_collide_begin {
                    replies.push(Reply::CollideBegin {
                        body: id_a.clone(),
                        target: id_b.clone(),
                    });
                }
                if record_b.on_collide_begin {
                    replies.push(Reply::CollideBegin {
                        body: id_b.clone(),
                        target: id_a.clone(),
                    });
                }
                if record_a.on_collide {
                    replies.push(Reply::Collide {
                        body: id_a.clone(),
                        target: id_b.clone(),
                        contact: ContactInfo {
                            normal: contact.normal,
                            points: contact.points.clone(),
                            impact_velocity: contact.impact_velocity,
                        },
                    });
                }
                if record_b.on_collide {
                    replies.push(Reply::Collide {
                        body: id_b.clone(),
                        target: id_a.clone(),
                        contact: ContactInfo {
                            // Oriented away from the listening body
                            normal: [-contact.normal[0], -contact.normal[1], -contact.normal[2]],
                            points: contact.points.clone(),
                            impact_velocity: contact.impact_velocity,
                        },
                    });
                }
            } else {
                if record_a.on_collide_end {
                    replies.push(Reply::CollideEnd {
                        body: id_a.clone(),
                        target: id_b.clone(),
                    });
                }
                if record_b.on_collide_end {
                    replies.push(Reply::CollideEnd {
                        body: id_b.clone(),
                        target: id_a.clone(),
                    });
                }
            }
        }
        replies
    }

    fn identity_of_collider(&self, handle: ColliderHandle) -> Option<Identity> {
        self.colliders
            .get(handle)
            .and_then(|collider| collider.parent())
            .and_then(|body| self.identities.get(&body))
            .cloned()
    }

    fn cast_rays(&self) -> Vec<Reply> {
        let mut replies = Vec::new();
        for (identity, desc) in &self.rays {
            let origin = point![desc.from[0], desc.from[1], desc.from[2]];
            let delta = vector![
                desc.to[0] - desc.from[0],
                desc.to[1] - desc.from[1],
                desc.to[2] - desc.from[2]
            ];
            let length = delta.norm();
            if length <= f32::EPSILON {
                continue;
            }
            let ray = Ray::new(origin, delta / length);
            let filter = QueryFilter::default().groups(InteractionGroups::new(
                Group::from_bits_truncate(desc.collision_filter_group),
                Group::from_bits_truncate(desc.collision_filter_mask),
            ));

            match desc.mode {
                RayMode::Closest | RayMode::Any => {
                    let hit = self.query_pipeline.cast_ray_and_get_normal(
                        &self.bodies,
                        &self.colliders,
                        &ray,
                        length,
                        true,
                        filter,
                    );
                    replies.push(match hit {
                        Some((collider, intersection)) => Reply::RayHit {
                            ray: identity.clone(),
                            body: self.identity_of_collider(collider),
                            hit: Some(ray_hit_info(&ray, &intersection)),
                        },
                        None => Reply::RayHit {
                            ray: identity.clone(),
                            body: None,
                            hit: None,
                        },
                    });
                }
                RayMode::All => {
                    let mut any = false;
                    self.query_pipeline.intersections_with_ray(
                        &self.bodies,
                        &self.colliders,
                        &ray,
                        length,
                        true,
                        filter,
                        |collider, intersection| {
                            any = true;
                            replies.push(Reply::RayHit {
                                ray: identity.clone(),
                                body: self.identity_of_collider(collider),
                                hit: Some(ray_hit_info(&ray, &intersection)),
                            });
                            true
                        },
                    );
                    if !any {
                        replies.push(Reply::RayHit {
                            ray: identity.clone(),
                            body: None,
                            hit: None,
                        });
                    }
                }
            }
        }
        replies
    }

    fn collect_observations(&self) -> Vec<Observation> {
        let mut observations = Vec::with_capacity(self.subscriptions.len());
        for (&id, (identity, property)) in &self.subscriptions {
            let Some(body) = self
                .records
                .get(identity)
                .and_then(|record| self.bodies.get(record.handle))
            else {
                continue;
            };
            let value = match property {
                WatchProperty::Position => {
                    let t = body.translation();
                    ObservedValue::Vec3([t.x, t.y, t.z])
                }
                WatchProperty::Quaternion => {
                    let r = body.rotation();
                    ObservedValue::Quat([r.i, r.j, r.k, r.w])
                }
                WatchProperty::Velocity => {
                    let v = body.linvel();
                    ObservedValue::Vec3([v.x, v.y, v.z])
                }
                WatchProperty::AngularVelocity => {
                    let v = body.angvel();
                    ObservedValue::Vec3([v.x, v.y, v.z])
                }
                WatchProperty::SleepState => ObservedValue::Bool(body.is_sleeping()),
            };
            observations.push(Observation { id, value });
        }
        observations
    }
}

impl Default for SimulationHost {
    fn default() -> Self {
        Self::new()
    }
}

fn pair_key(a: u32, b: u32) -> (u32, u32) {
    // user_data carries id + 1 so 0 can mean "no material"
    let a = a + 1;
    let b = b + 1;
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn to_isometry(position: [f32; 3], quaternion: [f32; 4]) -> Isometry<Real> {
    Isometry::from_parts(
        na::Translation3::new(position[0], position[1], position[2]),
        to_rotation(quaternion),
    )
}

fn to_rotation(quaternion: [f32; 4]) -> na::UnitQuaternion<Real> {
    na::UnitQuaternion::from_quaternion(na::Quaternion::new(
        quaternion[3],
        quaternion[0],
        quaternion[1],
        quaternion[2],
    ))
}

fn to_unit_axis(axis: [f32; 3]) -> na::UnitVector3<Real> {
    let v = vector![axis[0], axis[1], axis[2]];
    if v.norm() <= f32::EPSILON {
        na::Vector3::x_axis()
    } else {
        na::UnitVector3::new_normalize(v)
    }
}

fn ray_hit_info(ray: &Ray, intersection: &RayIntersection) -> RayHitInfo {
    let point = ray.point_at(intersection.time_of_impact);
    RayHitInfo {
        point: [point.x, point.y, point.z],
        normal: [
            intersection.normal.x,
            intersection.normal.y,
            intersection.normal.z,
        ],
        distance: intersection.time_of_impact,
        face_index: match intersection.feature {
            FeatureId::Face(index) => Some(index),
            _ => None,
        },
    }
}

/// Build the collider for one shape descriptor; `None` means the tag is
/// unknown (or degenerate) and no collider is attached
fn collider_builder(shape: &ShapeDesc) -> Option<ColliderBuilder> {
    match shape {
        ShapeDesc::Box { half_extents } => Some(ColliderBuilder::cuboid(
            half_extents[0],
            half_extents[1],
            half_extents[2],
        )),
        ShapeDesc::Sphere { radius } => Some(ColliderBuilder::ball(*radius)),
        ShapeDesc::Plane { normal } => {
            let n = vector![normal[0], normal[1], normal[2]];
            let axis = if n.norm() <= f32::EPSILON {
                na::Vector3::y_axis()
            } else {
                na::UnitVector3::new_normalize(n)
            };
            Some(ColliderBuilder::halfspace(axis))
        }
        ShapeDesc::Cylinder {
            half_height,
            radius,
        } => Some(ColliderBuilder::cylinder(*half_height, *radius)),
        ShapeDesc::Capsule {
            half_height,
            radius,
        } => Some(ColliderBuilder::capsule_y(*half_height, *radius)),
        // Point mass; a minuscule ball keeps it collidable
        ShapeDesc::Particle => Some(ColliderBuilder::ball(1.0e-4)),
        ShapeDesc::Heightfield {
            rows,
            cols,
            heights,
            scale,
        } => {
            if heights.len() != rows * cols || *rows == 0 || *cols == 0 {
                return None;
            }
            let matrix = na::DMatrix::from_vec(*rows, *cols, heights.clone());
            Some(ColliderBuilder::heightfield(
                matrix,
                vector![scale[0], scale[1], scale[2]],
            ))
        }
        ShapeDesc::Trimesh { vertices, indices } => {
            if vertices.is_empty() || indices.is_empty() {
                return None;
            }
            let points: Vec<Point<Real>> = vertices
                .iter()
                .map(|v| point![v[0], v[1], v[2]])
                .collect();
            Some(ColliderBuilder::trimesh(points, indices.clone()))
        }
        ShapeDesc::ConvexPolyhedron { vertices } => {
            let points: Vec<Point<Real>> = vertices
                .iter()
                .map(|v| point![v[0], v[1], v[2]])
                .collect();
            ColliderBuilder::convex_hull(&points)
        }
        // Flattened by the caller before reaching here
        ShapeDesc::Compound { .. } => None,
        ShapeDesc::Unknown => None,
    }
}
