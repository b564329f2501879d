//! Orientation samples and the angular distance between them.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// One normalized orientation reading. Angles are in radians.
///
/// - `azimuth` in (-π, π], rotation about the vertical axis
/// - `pitch` in [-π/2, π/2], tilt forward/back
/// - `roll` in (-π, π], tilt side to side
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrientationSample {
    /// Monotonic clock, nanoseconds.
    pub timestamp_ns: u64,
    pub azimuth: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl OrientationSample {
    pub fn new(timestamp_ns: u64, azimuth: f64, pitch: f64, roll: f64) -> Self {
        Self {
            timestamp_ns,
            azimuth: wrap_angle(azimuth),
            pitch: pitch.clamp(-PI / 2.0, PI / 2.0),
            roll: wrap_angle(roll),
        }
    }

    /// `[azimuth, pitch, roll]` rounded to whole degrees, for log lines.
    pub fn degrees(&self) -> [i64; 3] {
        [
            self.azimuth.to_degrees().round() as i64,
            self.pitch.to_degrees().round() as i64,
            self.roll.to_degrees().round() as i64,
        ]
    }
}

/// Maps any finite angle into (-π, π].
pub fn wrap_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a <= -PI {
        a += 2.0 * PI;
    } else if a > PI {
        a -= 2.0 * PI;
    }
    a
}

/// Perceptual rotation distance between two orientations.
///
/// The (azimuth, pitch) pair is treated as a point on the unit sphere and
/// compared by great-circle distance. Roll is compared on the circle and
/// combined with `max`, unless one of the samples is held near horizontal
/// (|pitch| at or beyond `horizontality_gate`), where roll stops carrying
/// meaning and is ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngularDistance {
    /// `None` always includes the roll term.
    pub horizontality_gate: Option<f64>,
}

impl Default for AngularDistance {
    fn default() -> Self {
        Self {
            horizontality_gate: Some(PI / 3.0),
        }
    }
}

impl AngularDistance {
    pub fn new(horizontality_gate: Option<f64>) -> Self {
        Self { horizontality_gate }
    }

    pub fn distance(&self, a: &OrientationSample, b: &OrientationSample) -> f64 {
        let gc = great_circle(a, b);
        if self.roll_applies(a) && self.roll_applies(b) {
            gc.max(roll_delta(a.roll, b.roll))
        } else {
            gc
        }
    }

    fn roll_applies(&self, o: &OrientationSample) -> bool {
        match self.horizontality_gate {
            Some(gate) => o.pitch.abs() < gate,
            None => true,
        }
    }
}

/// Great-circle distance on (azimuth, pitch). The cosine is clamped so
/// rounding past ±1 never yields NaN.
pub fn great_circle(a: &OrientationSample, b: &OrientationSample) -> f64 {
    let cos_d = a.pitch.sin() * b.pitch.sin()
        + a.pitch.cos() * b.pitch.cos() * (a.azimuth - b.azimuth).cos();
    cos_d.clamp(-1.0, 1.0).acos()
}

/// Shortest distance between two roll angles on the circle, in [0, π].
pub fn roll_delta(r1: f64, r2: f64) -> f64 {
    let d = (r1 - r2).abs() % (2.0 * PI);
    d.min(2.0 * PI - d)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn deg(az: f64, pitch: f64, roll: f64) -> OrientationSample {
        OrientationSample::new(0, az.to_radians(), pitch.to_radians(), roll.to_radians())
    }

    #[test]
    fn zero_for_identical_samples() {
        let metric = AngularDistance::default();
        for o in [
            deg(0.0, 0.0, 0.0),
            deg(123.0, -45.0, 170.0),
            deg(-179.0, 89.9, -90.0),
            deg(37.0, 75.0, 12.0),
        ] {
            let d = metric.distance(&o, &o);
            assert!(d.abs() < 1e-6, "distance to itself was {d}");
            assert!(!d.is_nan());
        }
    }

    #[test]
    fn symmetric() {
        let metric = AngularDistance::default();
        let samples = [
            deg(0.0, 0.0, 0.0),
            deg(90.0, 10.0, -30.0),
            deg(-170.0, -40.0, 175.0),
            deg(45.0, 70.0, 90.0),
            deg(-60.0, -65.0, -120.0),
            deg(179.0, 59.0, 0.0),
        ];
        for a in &samples {
            for b in &samples {
                let ab = metric.distance(a, b);
                let ba = metric.distance(b, a);
                assert!((ab - ba).abs() < EPS, "{a:?} vs {b:?}: {ab} != {ba}");
                assert!(ab >= 0.0);
            }
        }
    }

    #[test]
    fn azimuth_wraps_around() {
        let metric = AngularDistance::default();
        let a = deg(179.0, 0.0, 0.0);
        let b = deg(-179.0, 0.0, 0.0);
        let two = 2f64.to_radians();
        assert!((metric.distance(&a, &b) - two).abs() < 1e-6);
        assert!((metric.distance(&b, &a) - two).abs() < 1e-6);
    }

    #[test]
    fn roll_wraps_around() {
        let d = roll_delta(179f64.to_radians(), (-179f64).to_radians());
        assert!((d - 2f64.to_radians()).abs() < 1e-9);
        assert!((roll_delta(0.0, PI) - PI).abs() < 1e-12);
    }

    #[test]
    fn roll_dominates_when_upright() {
        let metric = AngularDistance::default();
        let a = deg(10.0, 20.0, 0.0);
        let b = deg(10.0, 20.0, 100.0);
        assert!((metric.distance(&a, &b) - 100f64.to_radians()).abs() < 1e-6);
    }

    #[test]
    fn roll_ignored_near_horizontal() {
        let metric = AngularDistance::default();
        let a = deg(10.0, 75.0, 0.0);
        let b = deg(10.0, 75.0, 150.0);
        assert!(metric.distance(&a, &b) < 1e-6);
        // gating on the reference sample alone would give 150° for
        // (upright, flat) but 80° the other way round; both must be upright
        let upright = deg(10.0, 0.0, 0.0);
        let flat = deg(10.0, 80.0, 150.0);
        assert!((metric.distance(&upright, &flat) - 80f64.to_radians()).abs() < 1e-6);
        assert!((metric.distance(&flat, &upright) - 80f64.to_radians()).abs() < 1e-6);
    }

    #[test]
    fn disabled_gate_always_counts_roll() {
        let metric = AngularDistance::new(None);
        let a = deg(10.0, 75.0, 0.0);
        let b = deg(10.0, 75.0, 150.0);
        assert!((metric.distance(&a, &b) - 150f64.to_radians()).abs() < 1e-6);
    }

    #[test]
    fn never_nan_at_domain_edges() {
        let metric = AngularDistance::default();
        let pole = OrientationSample::new(0, 0.3, PI / 2.0, 0.0);
        let pole2 = OrientationSample::new(0, -2.9, PI / 2.0, 0.0);
        let south = OrientationSample::new(0, 1.0, -PI / 2.0, 0.0);
        assert!(!metric.distance(&pole, &pole2).is_nan());
        assert!((metric.distance(&pole, &south) - PI).abs() < 1e-6);
        let near = OrientationSample::new(0, 1e-9, 0.0, 0.0);
        let origin = OrientationSample::new(0, 0.0, 0.0, 0.0);
        assert!(!metric.distance(&near, &origin).is_nan());
    }

    #[test]
    fn wrap_angle_range() {
        assert!((wrap_angle(PI) - PI).abs() < EPS);
        assert!((wrap_angle(-PI) - PI).abs() < EPS);
        assert!((wrap_angle(3.0 * PI / 2.0) + PI / 2.0).abs() < EPS);
        assert!((wrap_angle(-5.0 * PI / 2.0) + PI / 2.0).abs() < EPS);
        assert!(wrap_angle(0.0).abs() < EPS);
    }
}
