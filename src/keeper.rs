//! Periodic keep-alive hook, independent of the gesture core.

use anyhow::Result;
use log::{error, info};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

const TICK: Duration = Duration::from_millis(50);

pub struct Keeper {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Keeper {
    /// Calls `hook` every `interval` until stopped or dropped. A zero
    /// interval disables the keeper.
    pub fn start<F>(interval: Duration, mut hook: F) -> Option<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        if interval.is_zero() {
            return None;
        }
        info!("registering keeper every {}ms", interval.as_millis());

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            let mut next = Instant::now() + interval;
            while !stop_flag.load(Ordering::Relaxed) {
                let now = Instant::now();
                if now >= next {
                    if let Err(e) = hook() {
                        error!("keeper hook failed: {e}");
                    }
                    next = now + interval;
                }
                thread::sleep(TICK.min(next.saturating_duration_since(now)));
            }
        });

        Some(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Keeper {
    fn drop(&mut self) {
        self.halt();
    }
}
