//! Sensor discovery & raw reading feeds (IIO sysfs + evdev 0.13.2)
//!
//! All feeds are polled from one thread and stamped from one monotonic
//! clock, so readings from different channels arrive already serialized.

use anyhow::{Result, anyhow};
use evdev::{AbsoluteAxisCode, Device, EventType, PropType, SynchronizationCode};
use log::{debug, warn};
use serde::Serialize;
use std::{
    fmt, fs,
    io::BufRead,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::sensors::{Accuracy, Capabilities, RawPayload, RawReading, SensorStrategy};

pub const IIO_ROOT: &str = "/sys/bus/iio/devices";

const GAUSS_TO_MICROTESLA: f64 = 100.0;
/// Geomagnetic field strength on Earth is roughly 25..65 µT.
const PLAUSIBLE_FIELD_UT: (f64, f64) = (15.0, 90.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Quaternion,
    Accel,
    Magnet,
    Heading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Iio,
    Evdev,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: PathBuf,
    pub name: String,
    pub channel: Channel,
    pub backend: Backend,
    /// Sysfs file stem of the channel, e.g. "in_rot_quaternion".
    pub prefix: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:?}/{:?}] ({})",
            self.name,
            self.backend,
            self.channel,
            self.path.display()
        )
    }
}

pub fn discover_sensors() -> Vec<DeviceInfo> {
    let mut out = discover_iio(Path::new(IIO_ROOT));
    out.extend(discover_evdev_accelerometers());
    out
}

/// Scans an IIO device tree for the channels the strategies consume.
pub fn discover_iio(root: &Path) -> Vec<DeviceInfo> {
    let mut out = vec![];
    let Ok(rd) = fs::read_dir(root) else {
        return out;
    };
    let mut dirs: Vec<PathBuf> = rd.flatten().map(|e| e.path()).collect();
    dirs.sort();

    for dir in dirs {
        let name = fs::read_to_string(dir.join("name"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let probes = [
            (Channel::Quaternion, "in_rot_quaternion", "in_rot_quaternion_raw"),
            (Channel::Accel, "in_accel", "in_accel_x_raw"),
            (Channel::Magnet, "in_magn", "in_magn_x_raw"),
            (
                Channel::Heading,
                "in_rot_from_north_magnetic_tilt_comp",
                "in_rot_from_north_magnetic_tilt_comp_raw",
            ),
            (
                Channel::Heading,
                "in_rot_from_north_magnetic",
                "in_rot_from_north_magnetic_raw",
            ),
        ];
        for (channel, prefix, marker) in probes {
            let already = out
                .iter()
                .any(|d: &DeviceInfo| d.path == dir && d.channel == channel);
            if !already && dir.join(marker).exists() {
                out.push(DeviceInfo {
                    path: dir.clone(),
                    name: name.clone(),
                    channel,
                    backend: Backend::Iio,
                    prefix: prefix.to_string(),
                });
            }
        }
    }
    out
}

fn discover_evdev_accelerometers() -> Vec<DeviceInfo> {
    let mut out = vec![];
    if let Ok(rd) = fs::read_dir("/dev/input") {
        for e in rd.flatten() {
            let p = e.path();
            if !p
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.starts_with("event"))
            {
                continue;
            }
            if let Ok(dev) = Device::open(&p) {
                let is_accel = dev.properties().contains(PropType::ACCELEROMETER);
                let has_xyz = dev.supported_absolute_axes().is_some_and(|a| {
                    a.contains(AbsoluteAxisCode::ABS_X)
                        && a.contains(AbsoluteAxisCode::ABS_Y)
                        && a.contains(AbsoluteAxisCode::ABS_Z)
                });
                if is_accel && has_xyz {
                    out.push(DeviceInfo {
                        path: p.clone(),
                        name: dev.name().unwrap_or("unknown").to_string(),
                        channel: Channel::Accel,
                        backend: Backend::Evdev,
                        prefix: String::new(),
                    });
                }
            }
        }
    }
    out
}

pub fn capabilities(devices: &[DeviceInfo]) -> Capabilities {
    let has = |c: Channel| devices.iter().any(|d| d.channel == c);
    Capabilities {
        rotation_vector: has(Channel::Quaternion),
        accelerometer: has(Channel::Accel),
        magnetometer: has(Channel::Magnet),
        heading: has(Channel::Heading),
    }
}

/// Nanoseconds since the clock was created; never wall clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

pub trait SensorFeed {
    /// Non-blocking; returns whatever arrived since the last call.
    fn poll(&mut self, clock: &MonotonicClock) -> Result<Vec<RawReading>>;
    fn describe(&self) -> String;
}

/// Opens the feeds `strategy` needs, one per channel, preferring IIO over
/// evdev for the accelerometer.
pub fn open_feeds(
    devices: &[DeviceInfo],
    strategy: SensorStrategy,
    poll_interval: Duration,
) -> Vec<Box<dyn SensorFeed>> {
    let wanted: &[Channel] = match strategy {
        SensorStrategy::QuaternionRotationVector => &[Channel::Quaternion],
        SensorStrategy::AccelerometerMagnetometerFusion => &[Channel::Accel, Channel::Magnet],
        SensorStrategy::SingleAxisListener => &[Channel::Heading],
    };

    let mut feeds: Vec<Box<dyn SensorFeed>> = vec![];
    for channel in wanted {
        let mut candidates: Vec<&DeviceInfo> =
            devices.iter().filter(|d| d.channel == *channel).collect();
        candidates.sort_by_key(|d| d.backend == Backend::Evdev);

        let opened = candidates.into_iter().find_map(|d| {
            let feed: Result<Box<dyn SensorFeed>> = match d.backend {
                Backend::Iio => {
                    IioFeed::open(d, poll_interval).map(|f| Box::new(f) as Box<dyn SensorFeed>)
                }
                Backend::Evdev => {
                    EvdevAccelFeed::open(d).map(|f| Box::new(f) as Box<dyn SensorFeed>)
                }
            };
            match feed {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!("failed to open {d}: {e}");
                    None
                }
            }
        });
        match opened {
            Some(f) => feeds.push(f),
            None => {
                warn!("no usable {channel:?} channel");
                return vec![];
            }
        }
    }
    feeds
}

/// Polls one IIO channel through sysfs.
pub struct IioFeed {
    dir: PathBuf,
    channel: Channel,
    prefix: String,
    scale: f64,
    interval: Duration,
    last_poll: Option<Instant>,
}

impl IioFeed {
    pub fn open(dev: &DeviceInfo, interval: Duration) -> Result<Self> {
        // per-axis channels share one scale file
        let scale = read_f64(&dev.path.join(format!("{}_scale", dev.prefix))).unwrap_or(1.0);
        let feed = Self {
            dir: dev.path.clone(),
            channel: dev.channel,
            prefix: dev.prefix.clone(),
            scale,
            interval,
            last_poll: None,
        };
        // fail at open time rather than on every poll
        feed.read_payload()?;
        Ok(feed)
    }

    fn axis(&self, axis: &str) -> Result<f64> {
        let path = self.dir.join(format!("{}_{axis}_raw", self.prefix));
        Ok(read_f64(&path)? * self.scale)
    }

    fn read_payload(&self) -> Result<(RawPayload, Accuracy)> {
        match self.channel {
            Channel::Quaternion => {
                let path = self.dir.join(format!("{}_raw", self.prefix));
                let txt = fs::read_to_string(&path)?;
                let v: Vec<f64> = txt
                    .split_whitespace()
                    .map(|t| t.parse::<f64>().map(|x| x * self.scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| anyhow!("bad quaternion in {}: {e}", path.display()))?;
                if v.len() != 4 {
                    return Err(anyhow!(
                        "expected 4 quaternion components in {}, got {}",
                        path.display(),
                        v.len()
                    ));
                }
                let payload = RawPayload::RotationVector {
                    x: v[0],
                    y: v[1],
                    z: v[2],
                    w: Some(v[3]),
                };
                Ok((payload, Accuracy::High))
            }
            Channel::Accel => {
                let payload = RawPayload::Accelerometer {
                    x: self.axis("x")?,
                    y: self.axis("y")?,
                    z: self.axis("z")?,
                };
                Ok((payload, Accuracy::High))
            }
            Channel::Magnet => {
                let [x, y, z] = [
                    self.axis("x")? * GAUSS_TO_MICROTESLA,
                    self.axis("y")? * GAUSS_TO_MICROTESLA,
                    self.axis("z")? * GAUSS_TO_MICROTESLA,
                ];
                let payload = RawPayload::Magnetometer { x, y, z };
                Ok((payload, field_accuracy((x * x + y * y + z * z).sqrt())))
            }
            Channel::Heading => {
                let path = self.dir.join(format!("{}_raw", self.prefix));
                let degrees = read_f64(&path)? * self.scale;
                Ok((RawPayload::Heading { degrees }, Accuracy::Medium))
            }
        }
    }
}

/// Magnetometer readings far outside the geomagnetic band are disturbed by
/// nearby metal or magnets and cannot be trusted.
pub fn field_accuracy(magnitude_ut: f64) -> Accuracy {
    let (lo, hi) = PLAUSIBLE_FIELD_UT;
    if !magnitude_ut.is_finite() || magnitude_ut < lo || magnitude_ut > hi {
        Accuracy::Unreliable
    } else if magnitude_ut < 25.0 || magnitude_ut > 65.0 {
        Accuracy::Low
    } else {
        Accuracy::High
    }
}

impl SensorFeed for IioFeed {
    fn poll(&mut self, clock: &MonotonicClock) -> Result<Vec<RawReading>> {
        if self
            .last_poll
            .is_some_and(|t| t.elapsed() < self.interval)
        {
            return Ok(vec![]);
        }
        self.last_poll = Some(Instant::now());

        let (payload, accuracy) = self.read_payload()?;
        Ok(vec![RawReading {
            timestamp_ns: clock.now_ns(),
            accuracy,
            payload,
        }])
    }

    fn describe(&self) -> String {
        format!("iio {:?} at {}", self.channel, self.dir.display())
    }
}

/// Accelerometer exposed as an input device. Values stay in device units;
/// only the direction of gravity matters to the fusion.
pub struct EvdevAccelFeed {
    dev: Device,
    path: PathBuf,
    axes: [i32; 3],
}

impl EvdevAccelFeed {
    pub fn open(info: &DeviceInfo) -> Result<Self> {
        let mut dev = Device::open(&info.path)?;
        dev.set_nonblocking(true)?;
        Ok(Self {
            dev,
            path: info.path.clone(),
            axes: [0; 3],
        })
    }
}

impl SensorFeed for EvdevAccelFeed {
    fn poll(&mut self, clock: &MonotonicClock) -> Result<Vec<RawReading>> {
        let mut out = vec![];
        let events = match self.dev.fetch_events() {
            Ok(events) => events,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for ev in events {
            if ev.event_type() == EventType::ABSOLUTE {
                match ev.code() {
                    c if c == AbsoluteAxisCode::ABS_X.0 => self.axes[0] = ev.value(),
                    c if c == AbsoluteAxisCode::ABS_Y.0 => self.axes[1] = ev.value(),
                    c if c == AbsoluteAxisCode::ABS_Z.0 => self.axes[2] = ev.value(),
                    _ => {}
                }
            } else if ev.event_type() == EventType::SYNCHRONIZATION
                && ev.code() == SynchronizationCode::SYN_REPORT.0
            {
                let [x, y, z] = self.axes.map(f64::from);
                out.push(RawReading {
                    timestamp_ns: clock.now_ns(),
                    accuracy: Accuracy::High,
                    payload: RawPayload::Accelerometer { x, y, z },
                });
            }
        }
        Ok(out)
    }

    fn describe(&self) -> String {
        format!("evdev accelerometer at {}", self.path.display())
    }
}

fn read_f64(path: &Path) -> Result<f64> {
    let txt = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
    txt.trim()
        .parse::<f64>()
        .map_err(|e| anyhow!("bad number in {}: {e}", path.display()))
}

/// Parses a JSON-lines recording. Blank lines and `#` comments are skipped.
pub fn read_recording<R: BufRead>(reader: R) -> Result<Vec<RawReading>> {
    let mut out = vec![];
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let reading: RawReading = serde_json::from_str(trimmed)
            .map_err(|e| anyhow!("line {}: {e}", n + 1))?;
        out.push(reading);
    }
    debug!("recording: {} readings", out.len());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file(dir: &Path, rel: &str, content: &str) {
        let p = dir.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, content).unwrap();
    }

    #[test]
    fn discovers_iio_channels() {
        let tree = TempDir::new().unwrap();
        file(tree.path(), "iio:device0/name", "accel_3d\n");
        file(tree.path(), "iio:device0/in_accel_x_raw", "0\n");
        file(tree.path(), "iio:device1/name", "magn_3d\n");
        file(tree.path(), "iio:device1/in_magn_x_raw", "0\n");
        file(tree.path(), "iio:device1/in_rot_from_north_magnetic_tilt_comp_raw", "0\n");
        file(tree.path(), "iio:device1/in_rot_from_north_magnetic_raw", "0\n");

        let devices = discover_iio(tree.path());
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].name, "accel_3d");
        let heading = devices
            .iter()
            .find(|d| d.channel == Channel::Heading)
            .unwrap();
        assert_eq!(heading.prefix, "in_rot_from_north_magnetic_tilt_comp");

        let caps = capabilities(&devices);
        assert!(!caps.rotation_vector);
        assert!(caps.accelerometer && caps.magnetometer && caps.heading);
        assert_eq!(
            SensorStrategy::select(&caps),
            Some(SensorStrategy::AccelerometerMagnetometerFusion)
        );
    }

    #[test]
    fn missing_root_means_no_capabilities() {
        let devices = discover_iio(Path::new("/nonexistent/iio"));
        assert!(devices.is_empty());
        assert_eq!(SensorStrategy::select(&capabilities(&devices)), None);
    }

    #[test]
    fn polls_scaled_iio_quaternion() {
        let tree = TempDir::new().unwrap();
        file(tree.path(), "iio:device0/name", "dev_rotation\n");
        file(tree.path(), "iio:device0/in_rot_quaternion_raw", "0 0 0 1000\n");
        file(tree.path(), "iio:device0/in_rot_quaternion_scale", "0.001\n");

        let devices = discover_iio(tree.path());
        let mut feeds = open_feeds(
            &devices,
            SensorStrategy::QuaternionRotationVector,
            Duration::from_secs(60),
        );
        assert_eq!(feeds.len(), 1);

        let clock = MonotonicClock::new();
        let readings = feeds[0].poll(&clock).unwrap();
        assert_eq!(readings.len(), 1);
        match readings[0].payload {
            RawPayload::RotationVector { x, w, .. } => {
                assert_eq!(x, 0.0);
                assert!((w.unwrap() - 1.0).abs() < 1e-12);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        // inside the poll interval nothing new is read
        assert!(feeds[0].poll(&clock).unwrap().is_empty());
    }

    #[test]
    fn magnetometer_accuracy_follows_field_strength() {
        let tree = TempDir::new().unwrap();
        file(tree.path(), "iio:device0/name", "magn_3d\n");
        file(tree.path(), "iio:device0/in_magn_x_raw", "0\n");
        file(tree.path(), "iio:device0/in_magn_y_raw", "300\n");
        file(tree.path(), "iio:device0/in_magn_z_raw", "-400\n");
        file(tree.path(), "iio:device0/in_magn_scale", "0.001\n");

        let devices = discover_iio(tree.path());
        let mut feed = IioFeed::open(&devices[0], Duration::ZERO).unwrap();
        let r = feed.poll(&MonotonicClock::new()).unwrap();
        // 0.5 gauss = 50 µT
        assert_eq!(r[0].accuracy, Accuracy::High);
        match r[0].payload {
            RawPayload::Magnetometer { y, z, .. } => {
                assert!((y - 30.0).abs() < 1e-9);
                assert!((z + 40.0).abs() < 1e-9);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        assert_eq!(field_accuracy(5.0), Accuracy::Unreliable);
        assert_eq!(field_accuracy(200.0), Accuracy::Unreliable);
        assert_eq!(field_accuracy(20.0), Accuracy::Low);
        assert_eq!(field_accuracy(f64::NAN), Accuracy::Unreliable);
    }

    #[test]
    fn broken_channel_fails_to_open() {
        let tree = TempDir::new().unwrap();
        file(tree.path(), "iio:device0/name", "dev_rotation\n");
        file(tree.path(), "iio:device0/in_rot_quaternion_raw", "1 2\n");
        let devices = discover_iio(tree.path());
        assert!(IioFeed::open(&devices[0], Duration::ZERO).is_err());
        assert!(
            open_feeds(
                &devices,
                SensorStrategy::QuaternionRotationVector,
                Duration::ZERO
            )
            .is_empty()
        );
    }

    #[test]
    fn reads_recordings() {
        let text = r#"
# upright, then a quarter turn
{"timestamp_ns": 1, "accuracy": "high", "payload": {"heading": {"degrees": 0}}}

{"timestamp_ns": 2, "accuracy": "unreliable", "payload": {"heading": {"degrees": 90}}}
"#;
        let readings = read_recording(text.as_bytes()).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].accuracy, Accuracy::Unreliable);

        let err = read_recording("{\"timestamp_ns\": 1}\n".as_bytes()).unwrap_err();
        assert!(err.to_string().starts_with("line 1"));
    }
}
