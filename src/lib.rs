//! Worker-thread physics bridge
//!
//! This crate runs a rigid-body simulation on a dedicated thread and
//! exposes it through a message-passing facade: plain-data operations go
//! in, transform buffers and events come out, and the caller's thread
//! never touches the physics world directly.

pub mod config;
pub mod error;
pub mod events;
pub mod facade;
pub mod frame;
pub mod host;
pub mod protocol;
pub mod registry;

// Re-export commonly used types
pub mod prelude {
    // Facade types
    pub use crate::facade::Physics;

    // Configuration types
    pub use crate::config::{Broadphase, ContactMaterialDef, WorldConfig};

    // Descriptor types
    pub use crate::protocol::{
        BodyDesc, BodyType, ConstraintDesc, ConstraintKind, ContactInfo, ContactMaterialDesc,
        Identity, MaterialDesc, RayDesc, RayHitInfo, RayMode, ShapeDesc, ShapeEntry, SpringDesc,
        VehicleDesc, WatchProperty, WheelDesc,
    };

    // Event types
    pub use crate::events::{CollideEvent, EntityCallbacks, RayEvent};

    // Registry and frame types
    pub use crate::frame::{FrameSynchronizer, InstancedPoseTarget, PoseTarget};
    pub use crate::registry::{Registry, TargetRef};

    // Error types
    pub use crate::error::BridgeError;

    // Math types
    pub use glam::{Quat, Vec3};
}

/// Initialize logging for the bridge
pub fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
