use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    thread,
    time::Duration,
};

use super::dispatch::dispatch_gesture;
use super::server::DaemonEvent;
use crate::actions::UinputSink;
use crate::config::Profile;
use crate::gestures::{Gesture, GestureDetector, RecognizerConfig};
use crate::input::{self, MonotonicClock};
use crate::orientation::OrientationSample;
use crate::sensors::{OrientationSource, RawReading, SensorStrategy};

#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub gesture: Gesture,
    pub sample: OrientationSample,
}

/// Drives one reading at a time through normalize -> push -> evaluate, and
/// clears the history after every detection so stale entries cannot fire
/// again.
pub struct GestureHost {
    source: OrientationSource,
    detector: GestureDetector,
    staleness_ns: u64,
    last_timestamp: Option<u64>,
    samples: u64,
    detections: u64,
}

impl GestureHost {
    pub fn new(strategy: SensorStrategy, staleness_ns: u64, cfg: RecognizerConfig) -> Self {
        Self {
            source: OrientationSource::new(strategy, staleness_ns),
            detector: GestureDetector::new(cfg),
            staleness_ns,
            last_timestamp: None,
            samples: 0,
            detections: 0,
        }
    }

    pub fn strategy(&self) -> SensorStrategy {
        self.source.strategy()
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn detections(&self) -> u64 {
        self.detections
    }

    /// Rebuilds whatever the new settings touch. History does not survive a
    /// recognizer change.
    pub fn reconfigure(&mut self, cfg: RecognizerConfig, staleness_ns: u64) {
        if *self.detector.config() != cfg {
            self.detector = GestureDetector::new(cfg);
            info!("recognizer reconfigured");
        }
        if self.staleness_ns != staleness_ns {
            self.source = OrientationSource::new(self.source.strategy(), staleness_ns);
            self.staleness_ns = staleness_ns;
        }
    }

    pub fn handle(&mut self, reading: &RawReading) -> Result<Option<Detection>> {
        let Some(sample) = self.source.normalize(reading) else {
            return Ok(None);
        };
        if self.last_timestamp.is_some_and(|t| sample.timestamp_ns <= t) {
            debug!("sample @{} is not newer than the last one; skipped", sample.timestamp_ns);
            return Ok(None);
        }
        self.last_timestamp = Some(sample.timestamp_ns);
        self.samples += 1;

        let Some(gesture) = self.detector.update(sample)? else {
            return Ok(None);
        };
        let span = self.detector.history().len();
        self.detector.reset();
        self.detections += 1;
        info!(
            "gesture {:?} #{} detected at {:?} over {span} samples",
            gesture,
            self.detections(),
            sample.degrees()
        );
        Ok(Some(Detection { gesture, sample }))
    }
}

/// Sensor loop of the daemon. Returns early when the device has nothing to
/// read; `enabled` gates the bound actions, not detection itself.
pub fn run_pipeline(
    profile: Arc<Mutex<Profile>>,
    enabled: Arc<AtomicBool>,
    tx_evt: Sender<DaemonEvent>,
) -> Result<()> {
    let startup = lock(&profile)?.clone();

    let devices = input::discover_sensors();
    let caps = input::capabilities(&devices);
    let preference = startup.strategy_preference()?;
    let Some(strategy) = SensorStrategy::choose(&caps, preference) else {
        warn!("no orientation sensor found; gesture detection disabled");
        let _ = tx_evt.send(DaemonEvent::Strategy(None));
        return Ok(());
    };
    if let Some(p) = preference.filter(|p| *p != strategy) {
        warn!("{} sensors unavailable; falling back", p.name());
    }

    let mut feeds = input::open_feeds(&devices, strategy, startup.poll_interval());
    if feeds.is_empty() {
        warn!("failed to open sensors for {}; gesture detection disabled", strategy.name());
        let _ = tx_evt.send(DaemonEvent::Strategy(None));
        return Ok(());
    }
    for f in &feeds {
        info!("reading {}", f.describe());
    }
    info!(
        "using {} strategy ({:?} fidelity)",
        strategy.name(),
        strategy.fidelity()
    );
    let _ = tx_evt.send(DaemonEvent::Strategy(Some(strategy)));

    let clock = MonotonicClock::new();
    let mut host = GestureHost::new(
        strategy,
        startup.staleness_ns(),
        startup.recognizer_config(),
    );
    let mut sink = UinputSink::open_or_noop();
    let mut failing = vec![false; feeds.len()];

    loop {
        {
            let p = lock(&profile)?;
            host.reconfigure(p.recognizer_config(), p.staleness_ns());
        }
        sink.set_enabled(enabled.load(Ordering::Relaxed));

        let mut any_reading = false;
        for (i, feed) in feeds.iter_mut().enumerate() {
            let readings = match feed.poll(&clock) {
                Ok(r) => {
                    failing[i] = false;
                    r
                }
                Err(e) => {
                    if !failing[i] {
                        warn!("{}: {e}", feed.describe());
                    }
                    failing[i] = true;
                    continue;
                }
            };

            for reading in readings {
                any_reading = true;
                if let Some(det) = host.handle(&reading)? {
                    if !sink.is_enabled() {
                        debug!("actions disabled; {:?} not dispatched", det.gesture);
                    } else if let Err(e) = dispatch_gesture(&det.gesture, &profile, &mut sink) {
                        error!("dispatch failed: {e}");
                    }
                    let _ = tx_evt.send(DaemonEvent::Detected(det.gesture));
                }
            }
        }

        if !any_reading {
            thread::sleep(Duration::from_millis(4));
        }
    }
}

fn lock(profile: &Mutex<Profile>) -> Result<std::sync::MutexGuard<'_, Profile>> {
    profile.lock().map_err(|_| anyhow!("profile lock poisoned"))
}

#[derive(Debug, Serialize)]
pub struct ReplayDetection {
    pub gesture: &'static str,
    pub timestamp_ns: u64,
    pub orientation_deg: [i64; 3],
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub strategy: Option<SensorStrategy>,
    pub readings: usize,
    pub samples: u64,
    pub detections: Vec<ReplayDetection>,
}

/// Runs a recording through the same path the daemon uses. Without an
/// explicit or configured strategy, the first reading's payload decides.
pub fn replay(
    readings: &[RawReading],
    profile: &Profile,
    strategy: Option<SensorStrategy>,
) -> Result<ReplayReport> {
    let strategy = match strategy.or(profile.strategy_preference()?) {
        Some(s) => Some(s),
        None => readings
            .first()
            .map(|r| SensorStrategy::for_payload(&r.payload)),
    };
    let Some(strategy) = strategy else {
        return Ok(ReplayReport {
            strategy: None,
            readings: 0,
            samples: 0,
            detections: vec![],
        });
    };

    let mut host = GestureHost::new(
        strategy,
        profile.staleness_ns(),
        profile.recognizer_config(),
    );
    let mut detections = vec![];
    for reading in readings {
        if let Some(det) = host.handle(reading)? {
            detections.push(ReplayDetection {
                gesture: det.gesture.binding_key(),
                timestamp_ns: det.sample.timestamp_ns,
                orientation_deg: det.sample.degrees(),
            });
        }
    }

    Ok(ReplayReport {
        strategy: Some(host.strategy()),
        readings: readings.len(),
        samples: host.samples(),
        detections,
    })
}
