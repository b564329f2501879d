use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use notify::{EventKind, RecursiveMode, Watcher};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    fs,
    io::{BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
    },
    thread,
    time::Duration,
};

use super::dispatch::dispatch_trigger;
use super::pipeline::run_pipeline;
use super::runtime::socket_path;
use crate::actions::UinputSink;
use crate::config::{DaemonConfigState, Profile};
use crate::gestures::Gesture;
use crate::keeper::Keeper;
use crate::sensors::SensorStrategy;

pub fn run_daemon() -> Result<()> {
    // socket
    let sock = socket_path()?;
    if sock.exists() {
        let _ = fs::remove_file(&sock);
    }
    let listener = UnixListener::bind(&sock)?;
    info!("daemon: listening on {}", sock.display());

    // state
    let mut state = DaemonState::new()?;
    info!("daemon: active profile '{}'", state.cfg.active_name);

    // channels
    let (tx_req, rx_req) = mpsc::channel::<IpcMsg>();
    let (tx_evt, rx_evt) = mpsc::channel::<DaemonEvent>();

    // gesture thread
    let gesture_thread = GestureThread::start(
        state.cfg.profile.clone(),
        state.enabled.clone(),
        tx_evt.clone(),
    );
    let mut sink = UinputSink::open_or_noop();
    let mut keeper = start_keeper(&state.cfg.profile);

    // profile edits on disk
    let _watcher = match watch_profiles(&state.cfg.profiles_dir, tx_req.clone()) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!("not watching {}: {e}", state.cfg.profiles_dir.display());
            None
        }
    };

    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    // accept loop
    listener.set_nonblocking(true)?;
    'serve: loop {
        if let Some(sig) = signals.pending().next() {
            info!("daemon: signal {sig}, shutting down");
            break 'serve;
        }

        if let Ok((stream, _)) = listener.accept() {
            let tx = tx_req.clone();
            let snapshot = state.clone();
            thread::spawn(move || {
                if let Err(e) = handle_client(stream, snapshot, tx) {
                    error!("ipc client error: {e}");
                }
            });
        }

        while let Ok(evt) = rx_evt.try_recv() {
            match evt {
                DaemonEvent::Log(s) => info!("[gesture] {s}"),
                DaemonEvent::Strategy(s) => state.strategy = s,
                DaemonEvent::Detected(g) => {
                    state.detections += 1;
                    debug!("{g:?} #{}", state.detections);
                }
            }
        }

        while let Ok(msg) = rx_req.try_recv() {
            match msg {
                IpcMsg::Reload => {
                    if let Err(e) = state.cfg.reload() {
                        error!("reload failed: {e}");
                    } else {
                        gesture_thread.update_profile(state.cfg.profile.clone());
                        restart_keeper(&mut keeper, &state.cfg.profile);
                        info!("profile reloaded");
                    }
                }
                IpcMsg::UseProfile(name) => {
                    if let Err(e) = state.cfg.set_active(&name) {
                        error!("use profile failed: {e}");
                    } else {
                        gesture_thread.update_profile(state.cfg.profile.clone());
                        restart_keeper(&mut keeper, &state.cfg.profile);
                        info!("switched active profile to {}", state.cfg.active_name);
                    }
                }
                IpcMsg::Clear => {
                    sink.set_enabled(state.enabled.load(Ordering::Relaxed));
                    if let Err(e) = dispatch_trigger("manual_clear", &state.cfg.profile, &mut sink)
                    {
                        error!("manual_clear failed: {e}");
                    }
                }
                IpcMsg::Shutdown => break 'serve,
            }
        }

        thread::sleep(Duration::from_millis(5));
    }

    if let Some(k) = keeper.take() {
        k.stop();
    }
    let _ = fs::remove_file(&sock);
    info!("daemon: stopped");
    Ok(())
}

fn handle_client(mut stream: UnixStream, st: DaemonState, tx_req: Sender<IpcMsg>) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }
    let req: serde_json::Value = serde_json::from_str(&line)?;
    let op = req.get("op").and_then(|v| v.as_str()).unwrap_or("");

    let resp = match op {
        "status" => serde_json::json!({"ok": true, "data": {
            "enabled": st.enabled.load(Ordering::Relaxed),
            "active_profile": st.cfg.active_name,
            "strategy": st.strategy,
            "fidelity": st.strategy.map(|s| s.fidelity()),
            "gesture_supported": st.strategy.is_some(),
            "detections": st.detections,
            "socket": socket_path()?,
            "devices": st.cfg.detected_devices,
        }}),
        "reload" => {
            let _ = tx_req.send(IpcMsg::Reload);
            serde_json::json!({"ok": true, "data": {"active_profile": st.cfg.active_name}})
        }
        "use" => match req.get("profile").and_then(|v| v.as_str()) {
            Some(name) if !name.is_empty() => {
                let _ = tx_req.send(IpcMsg::UseProfile(name.to_string()));
                serde_json::json!({"ok": true, "data": {"active_profile": name}})
            }
            _ => serde_json::json!({"ok": false, "error": "missing profile name"}),
        },
        "list" => {
            let list = st.cfg.list_profiles();
            serde_json::json!({"ok": true, "data": {"profiles": list, "active": st.cfg.active_name}})
        }
        "doctor" => {
            let report = st.cfg.doctor_report();
            serde_json::json!({"ok": true, "data": report})
        }
        "clear" => {
            let _ = tx_req.send(IpcMsg::Clear);
            serde_json::json!({"ok": true, "data": "manual_clear dispatched"})
        }
        "enable" | "disable" => {
            let on = op == "enable";
            st.enabled.store(on, Ordering::Relaxed);
            serde_json::json!({"ok": true, "data": {"enabled": on}})
        }
        "shutdown" => {
            let _ = tx_req.send(IpcMsg::Shutdown);
            serde_json::json!({"ok": true, "data": "shutting down"})
        }
        _ => serde_json::json!({"ok": false, "error": format!("unknown op: {op}")}),
    };

    writeln!(stream, "{resp}")?;
    Ok(())
}

/// The daemon's view shared with client threads. `enabled` is live; the
/// rest is a snapshot taken when the client connected.
#[derive(Clone)]
struct DaemonState {
    enabled: Arc<AtomicBool>,
    cfg: DaemonConfigState,
    strategy: Option<SensorStrategy>,
    detections: u64,
}

impl DaemonState {
    fn new() -> Result<Self> {
        let cfg = DaemonConfigState::load_or_install_default()?;
        Ok(Self {
            enabled: Arc::new(AtomicBool::new(true)),
            cfg,
            strategy: None,
            detections: 0,
        })
    }
}

enum IpcMsg {
    Reload,
    UseProfile(String),
    Clear,
    Shutdown,
}

pub enum DaemonEvent {
    Log(String),
    /// Strategy the pipeline settled on; `None` when gestures are unsupported.
    Strategy(Option<SensorStrategy>),
    Detected(Gesture),
}

struct GestureThread {
    profile: Arc<Mutex<Profile>>,
    _thread: thread::JoinHandle<()>,
}

impl GestureThread {
    fn start(profile: Profile, enabled: Arc<AtomicBool>, tx_evt: Sender<DaemonEvent>) -> Self {
        let profile_arc = Arc::new(Mutex::new(profile));
        let prof_clone = profile_arc.clone();
        let handle = thread::spawn(move || {
            if let Err(e) = run_pipeline(prof_clone, enabled, tx_evt.clone()) {
                error!("gesture pipeline failed: {e}");
                let _ = tx_evt.send(DaemonEvent::Log(format!("pipeline stopped: {e}")));
                let _ = tx_evt.send(DaemonEvent::Strategy(None));
            }
        });
        Self {
            profile: profile_arc,
            _thread: handle,
        }
    }

    fn update_profile(&self, new_profile: Profile) {
        if let Ok(mut p) = self.profile.lock() {
            *p = new_profile;
        }
    }
}

fn restart_keeper(keeper: &mut Option<Keeper>, profile: &Profile) {
    if let Some(k) = keeper.take() {
        k.stop();
    }
    *keeper = start_keeper(profile);
}

/// Keeper firing the profile's `keep_alive` binding; `None` when the
/// interval is zero or nothing is bound.
fn start_keeper(profile: &Profile) -> Option<Keeper> {
    let bound = profile
        .bindings
        .get("keep_alive")
        .is_some_and(|b| !b.trim().is_empty());
    if !bound {
        return None;
    }
    let profile = profile.clone();
    let mut sink: Option<UinputSink> = None;
    Keeper::start(
        Duration::from_secs(profile.keeper.interval_sec),
        move || {
            let sink = sink.get_or_insert_with(UinputSink::open_or_noop);
            dispatch_trigger("keep_alive", &profile, sink)
        },
    )
}

fn watch_profiles(dir: &Path, tx_req: Sender<IpcMsg>) -> Result<notify::RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(ev) if matches!(ev.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                let touches_toml = ev
                    .paths
                    .iter()
                    .any(|p| p.extension().is_some_and(|e| e == "toml"));
                if touches_toml {
                    debug!("profile change: {:?}", ev.paths);
                    let _ = tx_req.send(IpcMsg::Reload);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("profile watcher: {e}"),
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

// client helper
pub fn client_request(req: serde_json::Value) -> Result<serde_json::Value> {
    let sock = socket_path()?;
    if !sock.exists() {
        return Err(anyhow!(
            "tiltwipe daemon is not running (socket missing at {})",
            sock.display()
        ));
    }
    let mut stream = UnixStream::connect(sock)?;
    let line = serde_json::to_string(&req)? + "\n";
    stream.write_all(line.as_bytes())?;
    let mut reader = BufReader::new(stream);
    let mut resp = String::new();
    reader.read_line(&mut resp)?;
    let v: serde_json::Value = serde_json::from_str(&resp)?;
    Ok(v)
}
