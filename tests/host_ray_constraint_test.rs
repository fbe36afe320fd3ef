//! Persistent rays, springs, and constraints driven against the host

use physics_bridge::host::SimulationHost;
use physics_bridge::prelude::*;
use physics_bridge::protocol::{Reply, Request};
use tracing::info;

fn step(host: &mut SimulationHost) -> Vec<Reply> {
    host.execute(Request::Step {
        time_since_last_called: 1.0 / 60.0,
        step_size: 1.0 / 60.0,
        max_sub_steps: 10,
        positions: Vec::new(),
        quaternions: Vec::new(),
    })
}

fn static_box(position: [f32; 3], half_extents: [f32; 3]) -> BodyDesc {
    BodyDesc {
        body_type: BodyType::Static,
        position,
        shapes: vec![ShapeEntry::new(ShapeDesc::Box { half_extents })],
        ..Default::default()
    }
}

fn dynamic_sphere(position: [f32; 3]) -> BodyDesc {
    BodyDesc {
        position,
        linear_damping: 0.0,
        shapes: vec![ShapeEntry::new(ShapeDesc::Sphere { radius: 0.5 })],
        ..Default::default()
    }
}

#[test]
fn test_closest_ray_reports_hit_point_and_body() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let mut host = SimulationHost::new();
    host.execute(Request::AddBody {
        identity: "ground".into(),
        desc: static_box([0.0, 0.0, 0.0], [10.0, 0.5, 10.0]),
    });
    host.execute(Request::AddRay {
        identity: "probe".into(),
        desc: RayDesc {
            from: [0.0, 5.0, 0.0],
            to: [0.0, -5.0, 0.0],
            mode: RayMode::Closest,
            ..Default::default()
        },
    });

    let replies = step(&mut host);
    let (body, hit) = replies
        .iter()
        .find_map(|reply| match reply {
            Reply::RayHit { body, hit, .. } => Some((body.clone(), *hit)),
            _ => None,
        })
        .expect("ray result expected every tick");

    let hit = hit.expect("ray should hit the ground");
    info!(?body, ?hit, "ray result");
    assert_eq!(body.as_deref(), Some("ground"));
    assert!((hit.point[1] - 0.5).abs() < 1e-3, "hit at y = {}", hit.point[1]);
    assert!((hit.distance - 4.5).abs() < 1e-3);
    assert!(hit.normal[1] > 0.9, "normal should point up");
}

#[test]
fn test_missing_ray_reports_every_tick_with_no_hit() {
    let mut host = SimulationHost::new();
    host.execute(Request::AddRay {
        identity: "probe".into(),
        desc: RayDesc {
            from: [0.0, 5.0, 0.0],
            to: [0.0, 10.0, 0.0],
            ..Default::default()
        },
    });

    for _ in 0..3 {
        let replies = step(&mut host);
        let miss = replies
            .iter()
            .find_map(|reply| match reply {
                Reply::RayHit { body, hit, .. } => Some((body.clone(), *hit)),
                _ => None,
            })
            .expect("a miss is still reported");
        assert_eq!(miss, (None, None));
    }
}

#[test]
fn test_removed_ray_stops_reporting() {
    let mut host = SimulationHost::new();
    host.execute(Request::AddRay {
        identity: "probe".into(),
        desc: RayDesc::default(),
    });
    assert!(step(&mut host)
        .iter()
        .any(|reply| matches!(reply, Reply::RayHit { .. })));

    host.execute(Request::RemoveRay {
        identity: "probe".into(),
    });
    assert!(!step(&mut host)
        .iter()
        .any(|reply| matches!(reply, Reply::RayHit { .. })));
}

#[test]
fn test_spring_pulls_body_toward_rest_length() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let mut host = SimulationHost::new();
    host.execute(Request::SetGravity {
        gravity: [0.0, 0.0, 0.0],
    });
    host.execute(Request::AddBody {
        identity: "anchor".into(),
        desc: static_box([0.0, 0.0, 0.0], [0.1, 0.1, 0.1]),
    });
    host.execute(Request::AddBody {
        identity: "bob".into(),
        desc: dynamic_sphere([0.0, -3.0, 0.0]),
    });
    host.execute(Request::AddSpring {
        identity: "tether".into(),
        desc: SpringDesc {
            body_a: "anchor".into(),
            body_b: "bob".into(),
            rest_length: 1.0,
            stiffness: 50.0,
            damping: 5.0,
            local_anchor_a: [0.0; 3],
            local_anchor_b: [0.0; 3],
        },
    });

    let mut y = -3.0;
    for _ in 0..180 {
        for reply in step(&mut host) {
            if let Reply::Frame { positions, .. } = reply {
                y = positions[4];
            }
        }
    }

    info!(y, "bob settled");
    // Stretched 2 units past rest; the spring must have pulled it up.
    assert!(y > -2.5, "spring never acted, y = {y}");
}

#[test]
fn test_point_to_point_constraint_tethers_a_falling_body() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let mut host = SimulationHost::new();
    host.execute(Request::AddBody {
        identity: "anchor".into(),
        desc: static_box([0.0, 0.0, 0.0], [0.1, 0.1, 0.1]),
    });
    host.execute(Request::AddBody {
        identity: "bob".into(),
        desc: dynamic_sphere([1.0, 0.0, 0.0]),
    });
    host.execute(Request::AddConstraint {
        identity: "pivot".into(),
        desc: ConstraintDesc {
            body_a: "anchor".into(),
            body_b: "bob".into(),
            kind: ConstraintKind::PointToPoint {
                pivot_a: [0.0; 3],
                pivot_b: [-1.0, 0.0, 0.0],
            },
        },
    });

    let mut position = [1.0, 0.0, 0.0];
    for _ in 0..240 {
        for reply in step(&mut host) {
            if let Reply::Frame { positions, .. } = reply {
                position = [positions[3], positions[4], positions[5]];
            }
        }
    }

    let distance =
        (position[0].powi(2) + position[1].powi(2) + position[2].powi(2)).sqrt();
    info!(?position, distance, "pendulum bob");
    // The bob swings but stays pinned one unit from the anchor.
    assert!((distance - 1.0).abs() < 0.2, "constraint drifted: {distance}");
}

#[test]
fn test_disabled_constraint_releases_the_body() {
    let mut host = SimulationHost::new();
    host.execute(Request::AddBody {
        identity: "anchor".into(),
        desc: static_box([0.0, 0.0, 0.0], [0.1, 0.1, 0.1]),
    });
    host.execute(Request::AddBody {
        identity: "bob".into(),
        desc: dynamic_sphere([1.0, 0.0, 0.0]),
    });
    host.execute(Request::AddConstraint {
        identity: "pivot".into(),
        desc: ConstraintDesc {
            body_a: "anchor".into(),
            body_b: "bob".into(),
            kind: ConstraintKind::PointToPoint {
                pivot_a: [0.0; 3],
                pivot_b: [-1.0, 0.0, 0.0],
            },
        },
    });
    host.execute(Request::DisableConstraint {
        identity: "pivot".into(),
    });

    let mut y = 0.0;
    for _ in 0..120 {
        for reply in step(&mut host) {
            if let Reply::Frame { positions, .. } = reply {
                y = positions[4];
            }
        }
    }

    // Unconstrained free fall for two seconds carries it well below any
    // pendulum arc.
    assert!(y < -2.0, "body still tethered, y = {y}");
}
