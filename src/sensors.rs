//! Sensor strategies and normalization into `OrientationSample`.
//!
//! Exactly one strategy is chosen at startup, in preference order:
//!
//! 1. quaternion rotation vector (full 3-axis)
//! 2. accelerometer + magnetometer fusion (full 3-axis, needs both fresh)
//! 3. single-axis heading (azimuth only)
//!
//! Every strategy ends in the same canonical frame: the device held upright
//! in front of the user, screen facing them. A device lying flat on a table
//! therefore reads pitch ±90°.

use anyhow::{Result, anyhow};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::orientation::{OrientationSample, wrap_angle};

const STANDARD_GRAVITY: f64 = 9.80665;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accuracy {
    Unreliable,
    Low,
    Medium,
    High,
}

impl Accuracy {
    pub fn is_trusted(self) -> bool {
        !matches!(self, Accuracy::Unreliable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawPayload {
    /// Unit quaternion; `w` is derived from x/y/z when the backend omits it.
    RotationVector {
        x: f64,
        y: f64,
        z: f64,
        #[serde(default)]
        w: Option<f64>,
    },
    /// m/s², device frame.
    Accelerometer { x: f64, y: f64, z: f64 },
    /// µT, device frame.
    Magnetometer { x: f64, y: f64, z: f64 },
    /// Coarse heading in degrees; negative means unknown.
    Heading { degrees: f64 },
}

impl RawPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RawPayload::RotationVector { .. } => "rotation_vector",
            RawPayload::Accelerometer { .. } => "accelerometer",
            RawPayload::Magnetometer { .. } => "magnetometer",
            RawPayload::Heading { .. } => "heading",
        }
    }
}

/// One raw event as delivered by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub timestamp_ns: u64,
    pub accuracy: Accuracy,
    pub payload: RawPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorStrategy {
    #[serde(rename = "rotation_vector")]
    QuaternionRotationVector,
    #[serde(rename = "accel_magnet")]
    AccelerometerMagnetometerFusion,
    #[serde(rename = "heading")]
    SingleAxisListener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fidelity {
    Full,
    AzimuthOnly,
}

/// What the host found while probing for sensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub rotation_vector: bool,
    pub accelerometer: bool,
    pub magnetometer: bool,
    pub heading: bool,
}

impl SensorStrategy {
    pub const PREFERENCE_ORDER: [SensorStrategy; 3] = [
        SensorStrategy::QuaternionRotationVector,
        SensorStrategy::AccelerometerMagnetometerFusion,
        SensorStrategy::SingleAxisListener,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SensorStrategy::QuaternionRotationVector => "rotation_vector",
            SensorStrategy::AccelerometerMagnetometerFusion => "accel_magnet",
            SensorStrategy::SingleAxisListener => "heading",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::PREFERENCE_ORDER
            .into_iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| anyhow!("unknown sensor strategy '{name}'"))
    }

    pub fn fidelity(self) -> Fidelity {
        match self {
            SensorStrategy::SingleAxisListener => Fidelity::AzimuthOnly,
            _ => Fidelity::Full,
        }
    }

    pub fn is_available(self, caps: &Capabilities) -> bool {
        match self {
            SensorStrategy::QuaternionRotationVector => caps.rotation_vector,
            SensorStrategy::AccelerometerMagnetometerFusion => {
                caps.accelerometer && caps.magnetometer
            }
            SensorStrategy::SingleAxisListener => caps.heading,
        }
    }

    /// First available strategy in preference order. `None` means gesture
    /// detection is unsupported on this device.
    pub fn select(caps: &Capabilities) -> Option<Self> {
        Self::PREFERENCE_ORDER
            .into_iter()
            .find(|s| s.is_available(caps))
    }

    /// `preferred` when the device has it, otherwise the probe order.
    pub fn choose(caps: &Capabilities, preferred: Option<Self>) -> Option<Self> {
        preferred
            .filter(|s| s.is_available(caps))
            .or_else(|| Self::select(caps))
    }

    /// The strategy a backend of this payload kind feeds.
    pub fn for_payload(payload: &RawPayload) -> Self {
        match payload {
            RawPayload::RotationVector { .. } => SensorStrategy::QuaternionRotationVector,
            RawPayload::Accelerometer { .. } | RawPayload::Magnetometer { .. } => {
                SensorStrategy::AccelerometerMagnetometerFusion
            }
            RawPayload::Heading { .. } => SensorStrategy::SingleAxisListener,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Latched {
    value: [f64; 3],
    timestamp_ns: u64,
}

/// Turns raw readings of the selected strategy into orientation samples.
#[derive(Debug, Clone)]
pub struct OrientationSource {
    strategy: SensorStrategy,
    staleness_ns: u64,
    accel: Option<Latched>,
    magnet: Option<Latched>,
}

impl OrientationSource {
    pub fn new(strategy: SensorStrategy, staleness_ns: u64) -> Self {
        Self {
            strategy,
            staleness_ns,
            accel: None,
            magnet: None,
        }
    }

    pub fn strategy(&self) -> SensorStrategy {
        self.strategy
    }

    /// Returns a sample when this reading completes one. Unreliable readings,
    /// payloads the strategy does not use, and fusion ticks with a stale
    /// latch produce nothing.
    pub fn normalize(&mut self, reading: &RawReading) -> Option<OrientationSample> {
        if !reading.accuracy.is_trusted() {
            debug!(
                "dropping unreliable {} reading @{}",
                reading.payload.kind(),
                reading.timestamp_ns
            );
            return None;
        }

        let t = reading.timestamp_ns;
        match (self.strategy, reading.payload) {
            (SensorStrategy::QuaternionRotationVector, RawPayload::RotationVector { x, y, z, w }) => {
                let r = rotation_matrix_from_vector([x, y, z], w);
                Some(orientation_sample(t, &remap_upright(&r)))
            }
            (SensorStrategy::AccelerometerMagnetometerFusion, RawPayload::Accelerometer { x, y, z }) => {
                self.accel = Some(Latched {
                    value: [x, y, z],
                    timestamp_ns: t,
                });
                self.fuse(t)
            }
            (SensorStrategy::AccelerometerMagnetometerFusion, RawPayload::Magnetometer { x, y, z }) => {
                self.magnet = Some(Latched {
                    value: [x, y, z],
                    timestamp_ns: t,
                });
                self.fuse(t)
            }
            (SensorStrategy::SingleAxisListener, RawPayload::Heading { degrees }) => {
                if degrees < 0.0 || !degrees.is_finite() {
                    return None;
                }
                Some(OrientationSample::new(
                    t,
                    wrap_angle(degrees.to_radians()),
                    0.0,
                    0.0,
                ))
            }
            (_, other) => {
                debug!(
                    "{} reading ignored by {} strategy",
                    other.kind(),
                    self.strategy.name()
                );
                None
            }
        }
    }

    fn fuse(&self, now_ns: u64) -> Option<OrientationSample> {
        let accel = self.accel?;
        let magnet = self.magnet?;
        if !self.is_fresh(&accel, now_ns) || !self.is_fresh(&magnet, now_ns) {
            return None;
        }
        let r = rotation_matrix_from_gravity(accel.value, magnet.value)?;
        Some(orientation_sample(now_ns, &remap_upright(&r)))
    }

    fn is_fresh(&self, latch: &Latched, now_ns: u64) -> bool {
        now_ns.saturating_sub(latch.timestamp_ns) <= self.staleness_ns
    }
}

/// Row-major 3x3 rotation matrix from a unit quaternion.
pub fn rotation_matrix_from_vector(xyz: [f64; 3], w: Option<f64>) -> [f64; 9] {
    let [x, y, z] = xyz;
    let w = w.unwrap_or_else(|| (1.0 - x * x - y * y - z * z).max(0.0).sqrt());

    let (xx, yy, zz) = (2.0 * x * x, 2.0 * y * y, 2.0 * z * z);
    let (xy, zw, xz) = (2.0 * x * y, 2.0 * z * w, 2.0 * x * z);
    let (yw, yz, xw) = (2.0 * y * w, 2.0 * y * z, 2.0 * x * w);

    [
        1.0 - yy - zz,
        xy - zw,
        xz + yw,
        xy + zw,
        1.0 - xx - zz,
        yz - xw,
        xz - yw,
        yz + xw,
        1.0 - xx - yy,
    ]
}

/// Row-major rotation matrix from gravity and geomagnetic vectors in the
/// device frame. `None` while in free fall or when the field is parallel to
/// gravity.
pub fn rotation_matrix_from_gravity(gravity: [f64; 3], geomagnetic: [f64; 3]) -> Option<[f64; 9]> {
    let [ax, ay, az] = gravity;
    let [ex, ey, ez] = geomagnetic;

    let norm_sq_a = ax * ax + ay * ay + az * az;
    if norm_sq_a < 0.01 * STANDARD_GRAVITY * STANDARD_GRAVITY {
        return None;
    }

    let hx = ey * az - ez * ay;
    let hy = ez * ax - ex * az;
    let hz = ex * ay - ey * ax;
    let norm_h = (hx * hx + hy * hy + hz * hz).sqrt();
    if norm_h < 0.1 {
        return None;
    }

    let inv_h = 1.0 / norm_h;
    let (hx, hy, hz) = (hx * inv_h, hy * inv_h, hz * inv_h);
    let inv_a = 1.0 / norm_sq_a.sqrt();
    let (ax, ay, az) = (ax * inv_a, ay * inv_a, az * inv_a);

    let mx = ay * hz - az * hy;
    let my = az * hx - ax * hz;
    let mz = ax * hy - ay * hx;

    Some([hx, hy, hz, mx, my, mz, ax, ay, az])
}

/// Swaps the device Y and Z axes so an upright device reads pitch 0.
/// Equivalent to remapping (X, Z): new Y is old Z, new Z is minus old Y.
pub fn remap_upright(r: &[f64; 9]) -> [f64; 9] {
    let mut out = [0.0; 9];
    for row in 0..3 {
        let o = row * 3;
        out[o] = r[o];
        out[o + 1] = -r[o + 2];
        out[o + 2] = r[o + 1];
    }
    out
}

/// Azimuth, pitch and roll of a row-major rotation matrix.
pub fn orientation_angles(r: &[f64; 9]) -> [f64; 3] {
    [
        r[1].atan2(r[4]),
        (-r[7]).clamp(-1.0, 1.0).asin(),
        (-r[6]).atan2(r[8]),
    ]
}

fn orientation_sample(timestamp_ns: u64, r: &[f64; 9]) -> OrientationSample {
    let [azimuth, pitch, roll] = orientation_angles(r);
    OrientationSample::new(timestamp_ns, azimuth, pitch, roll)
}
