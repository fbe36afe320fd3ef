//! Configuration types for the simulation

use serde::{Deserialize, Serialize};

/// Broadphase algorithm selection
///
/// Selection is by name on the wire; an unknown name falls back to
/// [`Broadphase::Naive`], the simplest quadratic algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Broadphase {
    /// Brute-force pair testing
    #[default]
    Naive,
    /// Sweep-and-prune
    Sap,
}

impl From<&str> for Broadphase {
    fn from(name: &str) -> Self {
        match name {
            "SAP" | "Sap" | "sap" => Broadphase::Sap,
            _ => Broadphase::Naive,
        }
    }
}

impl Broadphase {
    /// Wire name of the algorithm
    pub fn name(&self) -> &'static str {
        match self {
            Broadphase::Naive => "Naive",
            Broadphase::Sap => "SAP",
        }
    }
}

impl Serialize for Broadphase {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Broadphase {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(name.as_str().into())
    }
}

/// Default material applied to colliders whose body declares none
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ContactMaterialDef {
    /// Friction coefficient
    pub friction: f32,
    /// Restitution (bounciness)
    pub restitution: f32,
}

impl Default for ContactMaterialDef {
    fn default() -> Self {
        Self {
            friction: 0.3,
            restitution: 0.0,
        }
    }
}

/// Global simulation parameters
///
/// Sent inside the `init` operation and hot-swappable field by field via
/// the matching `set*` operations without rebuilding body state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldConfig {
    /// Gravity vector
    pub gravity: [f32; 3],
    /// Solver tolerance (allowed positional error)
    pub tolerance: f32,
    /// Solver iteration count
    pub iterations: u32,
    /// Whether bodies may fall asleep at all
    pub allow_sleep: bool,
    /// Broadphase algorithm
    pub broadphase: Broadphase,
    /// Sweep axis for the SAP broadphase
    pub axis_index: u8,
    /// Use the fast quaternion normalization approximation
    pub quat_normalize_fast: bool,
    /// Frames to skip between quaternion renormalizations
    pub quat_normalize_skip: u32,
    /// Material used when a body declares none
    pub default_contact_material: ContactMaterialDef,
    /// Transform buffer capacity in bodies
    pub max_bodies: usize,
    /// Fixed simulation timestep in seconds
    pub step_size: f32,
    /// Cap on catch-up sub-steps after a stall
    pub max_sub_steps: u32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            gravity: [0.0, -9.81, 0.0],
            tolerance: 0.001,
            iterations: 5,
            allow_sleep: false,
            broadphase: Broadphase::Naive,
            axis_index: 0,
            quat_normalize_fast: false,
            quat_normalize_skip: 0,
            default_contact_material: ContactMaterialDef::default(),
            max_bodies: 1000,
            step_size: 1.0 / 60.0,
            max_sub_steps: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadphase_unknown_name_falls_back_to_naive() {
        assert_eq!(Broadphase::from("SAP"), Broadphase::Sap);
        assert_eq!(Broadphase::from("Naive"), Broadphase::Naive);
        assert_eq!(Broadphase::from("Octree"), Broadphase::Naive);
        assert_eq!(Broadphase::from(""), Broadphase::Naive);
    }

    #[test]
    fn test_broadphase_roundtrip() {
        let json = serde_json::to_string(&Broadphase::Sap).unwrap();
        assert_eq!(json, "\"SAP\"");
        let back: Broadphase = serde_json::from_str("\"Quadtree\"").unwrap();
        assert_eq!(back, Broadphase::Naive);
    }

    #[test]
    fn test_config_defaults() {
        let config = WorldConfig::default();
        assert_eq!(config.max_bodies, 1000);
        assert!((config.step_size - 1.0 / 60.0).abs() < f32::EPSILON);
        assert!(!config.allow_sleep);
    }
}
