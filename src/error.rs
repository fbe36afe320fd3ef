//! Error types for the bridge

/// Errors surfaced by the caller-facing facade
///
/// Host-side conditions (unknown identity, unknown shape tag) are
/// deliberately *not* errors: they are benign races under asynchronous
/// dispatch and are handled as silent no-ops on the worker.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The worker thread is gone; the simulation context is dead
    #[error("physics worker stopped")]
    WorkerStopped,

    /// Adding this entity would exceed the configured transform buffer capacity
    #[error("body capacity exceeded: {requested} bodies requested, max_bodies is {max}")]
    CapacityExceeded {
        /// Body count the add would result in
        requested: usize,
        /// Configured maximum
        max: usize,
    },

    /// An entity with this identity is already registered
    #[error("identity already registered: {0}")]
    DuplicateIdentity(String),

    /// A replicated add was issued with zero replicas
    #[error("instanced body requires at least one replica")]
    EmptyBatch,
}
