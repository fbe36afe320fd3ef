//! Sleep control and contact-material overrides

use physics_bridge::host::SimulationHost;
use physics_bridge::prelude::*;
use physics_bridge::protocol::{ObservedValue, Reply, Request};
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

fn frame_of(replies: &[Reply]) -> (bool, Vec<ObservedValue>) {
    replies
        .iter()
        .find_map(|reply| match reply {
            Reply::Frame {
                active,
                observations,
                ..
            } => Some((
                *active,
                observations.iter().map(|o| o.value.clone()).collect(),
            )),
            _ => None,
        })
        .expect("every step yields a frame")
}

#[test]
fn test_idle_body_falls_asleep_and_wakes_on_demand() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let mut host = SimulationHost::new();
    host.execute(Request::Init {
        config: WorldConfig {
            gravity: [0.0, 0.0, 0.0],
            allow_sleep: true,
            ..Default::default()
        },
    });
    host.execute(Request::AddBody {
        identity: "idler".into(),
        desc: BodyDesc {
            shapes: vec![ShapeEntry::new(ShapeDesc::Sphere { radius: 0.5 })],
            ..Default::default()
        },
    });
    host.execute(Request::Subscribe {
        id: 1,
        identity: "idler".into(),
        property: WatchProperty::SleepState,
    });

    // A motionless body under zero gravity must drift off within a few
    // seconds of simulated time.
    let mut asleep = false;
    for _ in 0..300 {
        let (active, observations) = frame_of(&step(&mut host));
        if let Some(ObservedValue::Bool(sleeping)) = observations.first() {
            if *sleeping {
                assert!(!active, "a world of sleeping bodies must be inactive");
                asleep = true;
                break;
            }
        }
    }
    assert!(asleep, "body never slept");

    host.execute(Request::WakeUp {
        identity: "idler".into(),
    });
    let (active, observations) = frame_of(&step(&mut host));
    info!(active, "after wakeUp");
    assert!(matches!(
        observations.first(),
        Some(ObservedValue::Bool(false))
    ));
    assert!(active);
}

#[test]
fn test_bodies_do_not_sleep_when_world_disallows() {
    // allowSleep is off by default; even a motionless body stays awake.
    let mut host = SimulationHost::new();
    host.execute(Request::AddBody {
        identity: "idler".into(),
        desc: BodyDesc {
            shapes: vec![ShapeEntry::new(ShapeDesc::Sphere { radius: 0.5 })],
            ..Default::default()
        },
    });
    host.execute(Request::SetGravity {
        gravity: [0.0, 0.0, 0.0],
    });
    host.execute(Request::Subscribe {
        id: 1,
        identity: "idler".into(),
        property: WatchProperty::SleepState,
    });

    for _ in 0..300 {
        let (_, observations) = frame_of(&step(&mut host));
        assert!(
            matches!(observations.first(), Some(ObservedValue::Bool(false))),
            "body slept although the world disallows it"
        );
    }
}

#[test]
fn test_contact_material_overrides_pair_restitution() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    // Both materials are dead (zero restitution); the pair override makes
    // the combination bouncy.
    let mut host = SimulationHost::new();
    host.execute(Request::AddBody {
        identity: "ground".into(),
        desc: BodyDesc {
            body_type: BodyType::Static,
            material: Some(MaterialDesc {
                id: 1,
                friction: 0.3,
                restitution: 0.0,
            }),
            shapes: vec![ShapeEntry::new(ShapeDesc::Box {
                half_extents: [10.0, 0.5, 10.0],
            })],
            ..Default::default()
        },
    });
    host.execute(Request::AddBody {
        identity: "ball".into(),
        desc: BodyDesc {
            position: [0.0, 3.0, 0.0],
            linear_damping: 0.0,
            material: Some(MaterialDesc {
                id: 2,
                friction: 0.3,
                restitution: 0.0,
            }),
            shapes: vec![ShapeEntry::new(ShapeDesc::Sphere { radius: 0.5 })],
            ..Default::default()
        },
    });
    host.execute(Request::AddContactMaterial {
        desc: ContactMaterialDesc {
            id: 1,
            material_a: 1,
            material_b: 2,
            friction: 0.3,
            restitution: 0.9,
        },
    });
    host.execute(Request::Subscribe {
        id: 1,
        identity: "ball".into(),
        property: WatchProperty::Velocity,
    });

    let mut max_upward = 0.0f32;
    for _ in 0..240 {
        let (_, observations) = frame_of(&step(&mut host));
        if let Some(ObservedValue::Vec3([_, vy, _])) = observations.first() {
            max_upward = max_upward.max(*vy);
        }
    }

    info!(max_upward, "peak rebound velocity");
    // Without the override both surfaces are dead and the ball would
    // never move upward.
    assert!(max_upward > 1.0, "pair override ignored, vy peak {max_upward}");
}
