//! Invariants of the conversion and cyclic helpers.

use daq_actuators::cyclic::{find_closest, shortest_cyclic_move};
use daq_actuators::{AffineTransform, TransformParams};
use std::f64::consts::{PI, TAU};

fn close(a: (f64, f64), b: (f64, f64)) -> bool {
    (a.0 - b.0).abs() < 1e-9 && (a.1 - b.1).abs() < 1e-9
}

#[test]
fn transform_round_trip() {
    let transforms = [
        TransformParams::default(),
        TransformParams {
            rotation: 0.3,
            scale: (1.5, 0.8),
            translation: (0.01, -0.02),
        },
        TransformParams {
            rotation: -PI / 2.0,
            scale: (-1.0, 1.0),
            translation: (5.0, 0.0),
        },
    ];
    let points = [(0.0, 0.0), (1.0, -2.0), (-3.5, 0.25)];

    for params in transforms {
        let t = AffineTransform::new(params).unwrap();
        for p in points {
            for absolute in [true, false] {
                let q = t.to_dependency(p, absolute);
                assert!(close(t.from_dependency(q, absolute), p), "{params:?} {p:?}");
            }
        }
    }
}

#[test]
fn translation_only_applies_to_positions() {
    let t = AffineTransform::new(TransformParams {
        translation: (1.0, 2.0),
        ..TransformParams::default()
    })
    .unwrap();
    assert!(close(t.to_dependency((0.0, 0.0), true), (1.0, 2.0)));
    assert!(close(t.to_dependency((0.0, 0.0), false), (0.0, 0.0)));
}

#[test]
fn zero_scale_is_rejected() {
    let params = TransformParams {
        scale: (0.0, 1.0),
        ..TransformParams::default()
    };
    assert!(AffineTransform::new(params).is_err());
}

#[test]
fn cyclic_move_never_exceeds_half_a_cycle() {
    for cycle in [1.0, TAU, 360.0] {
        for i in 0..40 {
            let current = -3.0 * cycle + i as f64 * cycle * 0.173;
            for j in 0..40 {
                let target = j as f64 * cycle * 0.05 - cycle;
                let m = shortest_cyclic_move(current, target, cycle);
                assert!(m.abs() <= cycle / 2.0 + 1e-9, "{current} -> {target}: {m}");
                // Lands on the target modulo the cycle
                let landed = (current + m - target).rem_euclid(cycle);
                assert!(landed < 1e-6 || cycle - landed < 1e-6);
            }
        }
    }
}

#[test]
fn closest_candidate_wraps_around() {
    let (c, d) = find_closest(355.0, [0.0, 90.0, 180.0, 270.0], Some(360.0)).unwrap();
    assert_eq!(c, 0.0);
    assert!((d - 5.0).abs() < 1e-9);

    let (c, _) = find_closest(355.0, [0.0, 90.0, 180.0, 270.0], None).unwrap();
    assert_eq!(c, 270.0);
}
