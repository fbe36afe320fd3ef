//! Message envelope for all cross-boundary communication
//!
//! Both sides of the bridge agree on this closed operation vocabulary.
//! Every payload is plain structured data (numbers, strings, flat arrays,
//! nested plain records) so it can cross the isolation boundary; callbacks
//! never travel, only their presence as boolean flags on [`BodyDesc`].

use crate::config::WorldConfig;
use serde::{Deserialize, Serialize};

/// Stable string token naming one physical entity across the boundary.
///
/// For a replicated entity with N replicas the identities are derived as
/// `<base>/<replica index>`.
pub type Identity = String;

/// Body storage mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BodyType {
    /// Integrated by the solver
    #[default]
    Dynamic,
    /// Never moves
    Static,
    /// Moved by the caller, pushes dynamic bodies
    Kinematic,
}

/// Surface material referenced by colliders and contact-material pairs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaterialDesc {
    /// Pairing key for `addContactMaterial`
    pub id: u32,
    /// Friction coefficient
    pub friction: f32,
    /// Restitution (bounciness)
    pub restitution: f32,
}

/// One collision shape, described as data only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ShapeDesc {
    /// Axis-aligned box given by half extents
    Box { half_extents: [f32; 3] },
    /// Sphere
    Sphere { radius: f32 },
    /// Infinite half-space with an outward normal
    Plane { normal: [f32; 3] },
    /// Cylinder along the local Y axis
    Cylinder { half_height: f32, radius: f32 },
    /// Capsule along the local Y axis
    Capsule { half_height: f32, radius: f32 },
    /// Point mass
    Particle,
    /// Regular grid of heights scaled into world units
    Heightfield {
        rows: usize,
        cols: usize,
        heights: Vec<f32>,
        scale: [f32; 3],
    },
    /// Triangle soup
    Trimesh {
        vertices: Vec<[f32; 3]>,
        indices: Vec<[u32; 3]>,
    },
    /// Convex hull of a point cloud
    ConvexPolyhedron { vertices: Vec<[f32; 3]> },
    /// Nested shapes with their own offsets
    Compound { children: Vec<ShapeEntry> },
    /// Unrecognized shape tag; the body is created with zero shapes
    #[serde(other)]
    Unknown,
}

/// A shape plus its pose relative to the owning body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeEntry {
    pub shape: ShapeDesc,
    pub offset: [f32; 3],
    pub orientation: [f32; 4],
}

impl ShapeEntry {
    /// Shape at the body origin
    pub fn new(shape: ShapeDesc) -> Self {
        Self {
            shape,
            offset: [0.0; 3],
            orientation: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Creation-time snapshot of a body's physical properties.
///
/// The `on_collide*` flags are the degraded form of the caller-side
/// callbacks: only presence crosses the boundary, never the callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyDesc {
    pub body_type: BodyType,
    pub mass: f32,
    pub position: [f32; 3],
    pub quaternion: [f32; 4],
    pub velocity: [f32; 3],
    pub angular_velocity: [f32; 3],
    pub linear_damping: f32,
    pub angular_damping: f32,
    /// One entry for simple bodies, several for compound bodies
    pub shapes: Vec<ShapeEntry>,
    pub material: Option<MaterialDesc>,
    pub collision_filter_group: u32,
    pub collision_filter_mask: u32,
    pub allow_sleep: bool,
    pub sleep_speed_limit: f32,
    pub sleep_time_limit: f32,
    pub fixed_rotation: bool,
    /// Per-axis translation multipliers; zero locks the axis
    pub linear_factor: [f32; 3],
    /// Per-axis rotation multipliers; zero locks the axis
    pub angular_factor: [f32; 3],
    /// Sensor colliders report begin/end but produce no contact response
    pub is_trigger: bool,
    pub on_collide: bool,
    pub on_collide_begin: bool,
    pub on_collide_end: bool,
}

impl Default for BodyDesc {
    fn default() -> Self {
        Self {
            body_type: BodyType::Dynamic,
            mass: 1.0,
            position: [0.0; 3],
            quaternion: [0.0, 0.0, 0.0, 1.0],
            velocity: [0.0; 3],
            angular_velocity: [0.0; 3],
            linear_damping: 0.01,
            angular_damping: 0.01,
            shapes: Vec::new(),
            material: None,
            collision_filter_group: 1,
            collision_filter_mask: u32::MAX,
            allow_sleep: true,
            sleep_speed_limit: 0.1,
            sleep_time_limit: 1.0,
            fixed_rotation: false,
            linear_factor: [1.0; 3],
            angular_factor: [1.0; 3],
            is_trigger: false,
            on_collide: false,
            on_collide_begin: false,
            on_collide_end: false,
        }
    }
}

/// Constraint geometry, by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConstraintKind {
    /// Ball joint pinning two local points together
    PointToPoint {
        pivot_a: [f32; 3],
        pivot_b: [f32; 3],
    },
    /// Rotation around one shared axis, optionally motorized
    Hinge {
        pivot_a: [f32; 3],
        pivot_b: [f32; 3],
        axis_a: [f32; 3],
        axis_b: [f32; 3],
    },
    /// Keeps the anchors within a fixed distance
    Distance { distance: f32 },
    /// Welds the two bodies together
    Lock,
    /// Ball joint with swing and twist limits
    ConeTwist {
        pivot_a: [f32; 3],
        pivot_b: [f32; 3],
        axis_a: [f32; 3],
        axis_b: [f32; 3],
        angle: f32,
        twist_angle: f32,
    },
}

/// References two body identities plus type-specific options.
///
/// Lifecycle is independent of the bodies; the constraint becomes inert
/// if a referenced body no longer exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintDesc {
    pub body_a: Identity,
    pub body_b: Identity,
    pub kind: ConstraintKind,
}

/// Damped spring between two local anchors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpringDesc {
    pub body_a: Identity,
    pub body_b: Identity,
    pub rest_length: f32,
    pub stiffness: f32,
    pub damping: f32,
    pub local_anchor_a: [f32; 3],
    pub local_anchor_b: [f32; 3],
}

/// How many intersections a persistent ray reports per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RayMode {
    /// First intersection found, not necessarily the nearest
    Any,
    /// Nearest intersection
    #[default]
    Closest,
    /// Every intersection along the ray
    All,
}

/// Persistent ray cast once per simulation tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RayDesc {
    pub from: [f32; 3],
    pub to: [f32; 3],
    pub mode: RayMode,
    pub collision_filter_group: u32,
    pub collision_filter_mask: u32,
}

impl Default for RayDesc {
    fn default() -> Self {
        Self {
            from: [0.0; 3],
            to: [0.0, -1.0, 0.0],
            mode: RayMode::Closest,
            collision_filter_group: 1,
            collision_filter_mask: u32::MAX,
        }
    }
}

/// Friction/restitution override for one pair of materials
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContactMaterialDesc {
    pub id: u32,
    pub material_a: u32,
    pub material_b: u32,
    pub friction: f32,
    pub restitution: f32,
}

/// One wheel of a raycast vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WheelDesc {
    /// Attachment point in chassis space
    pub connection_point: [f32; 3],
    /// Suspension direction in chassis space
    pub direction: [f32; 3],
    /// Axle direction in chassis space
    pub axle: [f32; 3],
    pub suspension_rest_length: f32,
    pub radius: f32,
    pub suspension_stiffness: f32,
    pub max_suspension_travel: f32,
    pub friction_slip: f32,
}

impl Default for WheelDesc {
    fn default() -> Self {
        Self {
            connection_point: [0.0; 3],
            direction: [0.0, -1.0, 0.0],
            axle: [1.0, 0.0, 0.0],
            suspension_rest_length: 0.3,
            radius: 0.4,
            suspension_stiffness: 30.0,
            max_suspension_travel: 0.2,
            friction_slip: 10.0,
        }
    }
}

/// Raycast vehicle built on an existing chassis body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleDesc {
    pub chassis: Identity,
    pub wheels: Vec<WheelDesc>,
}

/// Body property watched by a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchProperty {
    Position,
    Quaternion,
    Velocity,
    AngularVelocity,
    SleepState,
}

/// Subscription-driven per-tick value snapshot, delivered inside `frame`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: u32,
    pub value: ObservedValue,
}

/// Value payload of one observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObservedValue {
    Vec3([f32; 3]),
    Quat([f32; 4]),
    Bool(bool),
}

/// Geometric detail of one reported contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactInfo {
    /// Contact normal, oriented away from the listening body
    pub normal: [f32; 3],
    /// World-space contact points
    pub points: Vec<[f32; 3]>,
    /// Relative velocity along the normal at impact
    pub impact_velocity: f32,
}

/// Geometric detail of one ray intersection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RayHitInfo {
    pub point: [f32; 3],
    pub normal: [f32; 3],
    pub distance: f32,
    pub face_index: Option<u32>,
}

/// Inbound operations, transport to host.
///
/// The vocabulary is closed; host dispatch matches exhaustively so a new
/// operation cannot be added without handling it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Request {
    Init {
        config: WorldConfig,
    },
    /// Advances the world; buffer ownership travels with the message and
    /// comes back inside the matching `frame`
    Step {
        time_since_last_called: f32,
        step_size: f32,
        max_sub_steps: u32,
        positions: Vec<f32>,
        quaternions: Vec<f32>,
    },
    AddBody {
        identity: Identity,
        desc: BodyDesc,
    },
    AddBodies {
        identities: Vec<Identity>,
        descs: Vec<BodyDesc>,
    },
    RemoveBody {
        identity: Identity,
    },
    RemoveBodies {
        identities: Vec<Identity>,
    },
    AddConstraint {
        identity: Identity,
        desc: ConstraintDesc,
    },
    RemoveConstraint {
        identity: Identity,
    },
    AddSpring {
        identity: Identity,
        desc: SpringDesc,
    },
    RemoveSpring {
        identity: Identity,
    },
    AddRay {
        identity: Identity,
        desc: RayDesc,
    },
    RemoveRay {
        identity: Identity,
    },
    AddContactMaterial {
        desc: ContactMaterialDesc,
    },
    RemoveContactMaterial {
        id: u32,
    },
    AddRaycastVehicle {
        identity: Identity,
        desc: VehicleDesc,
    },
    RemoveRaycastVehicle {
        identity: Identity,
    },
    SetPosition {
        identity: Identity,
        position: [f32; 3],
    },
    SetQuaternion {
        identity: Identity,
        quaternion: [f32; 4],
    },
    SetVelocity {
        identity: Identity,
        velocity: [f32; 3],
    },
    SetAngularVelocity {
        identity: Identity,
        angular_velocity: [f32; 3],
    },
    SetMass {
        identity: Identity,
        mass: f32,
    },
    SetLinearDamping {
        identity: Identity,
        damping: f32,
    },
    SetAngularDamping {
        identity: Identity,
        damping: f32,
    },
    SetLinearFactor {
        identity: Identity,
        factor: [f32; 3],
    },
    SetAngularFactor {
        identity: Identity,
        factor: [f32; 3],
    },
    SetFixedRotation {
        identity: Identity,
        fixed: bool,
    },
    SetIsTrigger {
        identity: Identity,
        is_trigger: bool,
    },
    SetCollisionFilterGroup {
        identity: Identity,
        group: u32,
    },
    SetCollisionFilterMask {
        identity: Identity,
        mask: u32,
    },
    SetSleepSpeedLimit {
        identity: Identity,
        limit: f32,
    },
    SetSleepTimeLimit {
        identity: Identity,
        limit: f32,
    },
    ApplyForce {
        identity: Identity,
        force: [f32; 3],
        world_point: [f32; 3],
    },
    ApplyImpulse {
        identity: Identity,
        impulse: [f32; 3],
        world_point: [f32; 3],
    },
    ApplyLocalForce {
        identity: Identity,
        force: [f32; 3],
        local_point: [f32; 3],
    },
    ApplyLocalImpulse {
        identity: Identity,
        impulse: [f32; 3],
        local_point: [f32; 3],
    },
    ApplyTorque {
        identity: Identity,
        torque: [f32; 3],
    },
    Sleep {
        identity: Identity,
    },
    WakeUp {
        identity: Identity,
    },
    EnableConstraint {
        identity: Identity,
    },
    DisableConstraint {
        identity: Identity,
    },
    EnableConstraintMotor {
        identity: Identity,
    },
    DisableConstraintMotor {
        identity: Identity,
    },
    SetConstraintMotorSpeed {
        identity: Identity,
        speed: f32,
    },
    SetConstraintMotorMaxForce {
        identity: Identity,
        max_force: f32,
    },
    SetSpringStiffness {
        identity: Identity,
        stiffness: f32,
    },
    SetSpringDamping {
        identity: Identity,
        damping: f32,
    },
    SetSpringRestLength {
        identity: Identity,
        rest_length: f32,
    },
    SetRaycastVehicleSteering {
        identity: Identity,
        wheel: usize,
        value: f32,
    },
    ApplyRaycastVehicleEngineForce {
        identity: Identity,
        wheel: usize,
        value: f32,
    },
    SetRaycastVehicleBrake {
        identity: Identity,
        wheel: usize,
        value: f32,
    },
    SetGravity {
        gravity: [f32; 3],
    },
    SetIterations {
        iterations: u32,
    },
    SetTolerance {
        tolerance: f32,
    },
    SetBroadphase {
        broadphase: String,
    },
    SetAllowSleep {
        allow_sleep: bool,
    },
    Subscribe {
        id: u32,
        identity: Identity,
        property: WatchProperty,
    },
    Unsubscribe {
        id: u32,
    },
    Shutdown,
}

/// Outbound messages, host to transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Reply {
    /// Simulation results for one completed step.
    ///
    /// `bodies` is `Some` only on the first frame after membership changed;
    /// the steady-state hot path carries no identity list.
    Frame {
        positions: Vec<f32>,
        quaternions: Vec<f32>,
        bodies: Option<Vec<Identity>>,
        active: bool,
        observations: Vec<Observation>,
    },
    /// Authoritative ordered identity list after a membership change
    Sync {
        bodies: Vec<Identity>,
    },
    /// Continuous contact on a body that requested `on_collide`
    Collide {
        body: Identity,
        target: Identity,
        contact: ContactInfo,
    },
    CollideBegin {
        body: Identity,
        target: Identity,
    },
    CollideEnd {
        body: Identity,
        target: Identity,
    },
    /// Result of one persistent ray for this tick; `hit` is `None` when
    /// the ray exhausted its length without intersecting
    RayHit {
        ray: Identity,
        body: Option<Identity>,
        hit: Option<RayHitInfo>,
    },
}
