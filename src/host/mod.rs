//! Worker-side simulation: the host owning the physics world, the fixed
//! stepper it advances with, and the thread wrapping both

pub mod stepper;
pub mod worker;
pub mod world;

pub use stepper::FixedStepper;
pub use worker::PhysicsWorker;
pub use world::SimulationHost;
