use std::f64::consts::PI;

use log::{Level, debug, log_enabled};

use crate::error::HistoryError;
use crate::history::TimeWindowedHistory;
use crate::orientation::{AngularDistance, OrientationSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    /// Device turned roughly a quarter turn away and back again.
    TurnAndReturn,
}

impl Gesture {
    pub fn binding_key(self) -> &'static str {
        match self {
            Gesture::TurnAndReturn => "turn_and_return",
        }
    }
}

/// Immutable for the lifetime of a detector; a profile reload builds a new one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecognizerConfig {
    pub retention_ns: u64,
    pub far_threshold: f64,
    pub near_threshold: f64,
    pub horizontality_gate: Option<f64>,
    pub min_capacity: usize,
    /// Drop samples closer than this to the newest retained one.
    pub dedupe_angle: Option<f64>,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            retention_ns: 1_500_000_000,
            // a bit under 90° so coarse heading sources still register a quarter turn
            far_threshold: 89.5 / 180.0 * PI,
            near_threshold: 20.0 / 180.0 * PI,
            horizontality_gate: Some(PI / 3.0),
            min_capacity: 16,
            dedupe_angle: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    SeekFar,
    SeekNear,
    Detected,
}

/// Scans history newest to oldest, first for a sample farther than the far
/// threshold from the latest one, then for an older sample back within the
/// near threshold.
#[derive(Debug, Clone)]
pub struct GestureRecognizer {
    far: f64,
    near: f64,
    metric: AngularDistance,
}

impl GestureRecognizer {
    pub fn new(cfg: &RecognizerConfig) -> Self {
        Self {
            far: cfg.far_threshold,
            near: cfg.near_threshold,
            metric: AngularDistance::new(cfg.horizontality_gate),
        }
    }

    pub fn metric(&self) -> &AngularDistance {
        &self.metric
    }

    pub fn evaluate(&self, history: &TimeWindowedHistory) -> bool {
        if history.is_empty() {
            return false;
        }
        let newest = history.len() - 1;
        let Ok(latest) = history.get(newest) else {
            return false;
        };
        let tracing = log_enabled!(Level::Debug);
        let mut trace = String::new();
        if tracing {
            trace = format!("from {:?}, size = {}", latest.degrees(), history.len());
        }

        let mut state = ScanState::SeekFar;
        for i in (0..newest).rev() {
            let Ok(past) = history.get(i) else {
                break;
            };
            let d = self.metric.distance(latest, past);
            if tracing {
                trace.push_str(&format!(
                    "\n  to {:?} is {} deg",
                    past.degrees(),
                    d.to_degrees().round()
                ));
            }

            match state {
                ScanState::SeekFar if d > self.far => {
                    state = ScanState::SeekNear;
                    if tracing {
                        trace.push_str("  far");
                    }
                }
                ScanState::SeekNear if d < self.near => {
                    state = ScanState::Detected;
                    if tracing {
                        trace.push_str("  near");
                    }
                    break;
                }
                _ => {}
            }
        }

        if tracing {
            debug!("{trace}");
        }
        state == ScanState::Detected
    }
}

/// Optional pre-filter suppressing near-duplicate consecutive samples.
#[derive(Debug, Clone)]
pub struct DuplicateFilter {
    min_angle: f64,
    metric: AngularDistance,
}

impl DuplicateFilter {
    pub fn new(min_angle: f64, metric: AngularDistance) -> Self {
        Self { min_angle, metric }
    }

    pub fn admits(&self, newest: Option<&OrientationSample>, next: &OrientationSample) -> bool {
        match newest {
            Some(prev) => self.metric.distance(prev, next) >= self.min_angle,
            None => true,
        }
    }
}

/// Owns the history and the recognizer. The host clears the history through
/// `reset` after acting on a detection.
#[derive(Debug)]
pub struct GestureDetector {
    cfg: RecognizerConfig,
    history: TimeWindowedHistory,
    recognizer: GestureRecognizer,
    dedupe: Option<DuplicateFilter>,
}

impl GestureDetector {
    pub fn new(cfg: RecognizerConfig) -> Self {
        let recognizer = GestureRecognizer::new(&cfg);
        let dedupe = cfg
            .dedupe_angle
            .map(|angle| DuplicateFilter::new(angle, *recognizer.metric()));
        Self {
            cfg,
            history: TimeWindowedHistory::new(cfg.retention_ns, cfg.min_capacity),
            recognizer,
            dedupe,
        }
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.cfg
    }

    pub fn history(&self) -> &TimeWindowedHistory {
        &self.history
    }

    pub fn update(&mut self, sample: OrientationSample) -> Result<Option<Gesture>, HistoryError> {
        if let Some(filter) = &self.dedupe {
            if !filter.admits(self.history.latest(), &sample) {
                debug!("duplicate sample {:?} dropped", sample.degrees());
                return Ok(None);
            }
        }

        self.history.push(sample)?;

        if self.recognizer.evaluate(&self.history) {
            Ok(Some(Gesture::TurnAndReturn))
        } else {
            Ok(None)
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}
