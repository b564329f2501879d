use anyhow::{Result, anyhow};
use directories::UserDirs;
use log::info;
use serde::{Deserialize, Deserializer};
use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::actions::{self, Action};
use crate::gestures::RecognizerConfig;
use crate::input;
use crate::sensors::{Capabilities, SensorStrategy};

/// Binding keys the daemon fires.
pub const TRIGGERS: [&str; 3] = ["turn_and_return", "manual_clear", "keep_alive"];

#[derive(Debug, Clone, Deserialize)]
pub struct Meta {
    pub name: Option<String>,
    #[serde(default)]
    pub allow_commands: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecognizerSettings {
    pub retention_ms: u64,
    pub far_deg: f64,
    pub near_deg: f64,
    /// Omitted means roll always counts.
    #[serde(default)]
    pub horizontality_deg: Option<f64>,
    #[serde(default = "default_min_capacity")]
    pub min_capacity: usize,
}

fn default_min_capacity() -> usize {
    16
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorSettings {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    pub staleness_ms: u64,
    pub poll_ms: u64,
    #[serde(default)]
    pub dedupe_deg: Option<f64>,
}

fn default_strategy() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeeperSettings {
    #[serde(default)]
    pub interval_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub meta: Meta,
    pub recognizer: RecognizerSettings,
    pub sensor: SensorSettings,
    #[serde(default)]
    pub keeper: KeeperSettings,

    // nested/dotted tables are flattened into "a.b" -> "value"
    #[serde(deserialize_with = "deserialize_bindings_flat")]
    pub bindings: HashMap<String, String>,
}

impl Profile {
    pub fn recognizer_config(&self) -> RecognizerConfig {
        let r = &self.recognizer;
        RecognizerConfig {
            retention_ns: r.retention_ms * 1_000_000,
            far_threshold: r.far_deg.to_radians(),
            near_threshold: r.near_deg.to_radians(),
            horizontality_gate: r.horizontality_deg.map(f64::to_radians),
            min_capacity: r.min_capacity,
            dedupe_angle: self.sensor.dedupe_deg.map(f64::to_radians),
        }
    }

    /// `None` for "auto".
    pub fn strategy_preference(&self) -> Result<Option<SensorStrategy>> {
        match self.sensor.strategy.as_str() {
            "auto" => Ok(None),
            name => SensorStrategy::from_name(name).map(Some),
        }
    }

    pub fn staleness_ns(&self) -> u64 {
        self.sensor.staleness_ms * 1_000_000
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.sensor.poll_ms)
    }

    pub fn actions_for(&self, trigger: &str) -> Result<Vec<Action>> {
        match self.bindings.get(trigger) {
            Some(binding) => Action::parse_list(binding),
            None => Ok(Vec::new()),
        }
    }
}

fn deserialize_bindings_flat<'de, D>(
    de: D,
) -> std::result::Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = toml::Value::deserialize(de)?;
    let table = match val {
        toml::Value::Table(t) => t,
        other => {
            return Err(serde::de::Error::custom(format!(
                "bindings must be a table, got {}",
                other.type_str()
            )));
        }
    };

    let mut out = HashMap::new();
    flatten_table("", &table, &mut out).map_err(serde::de::Error::custom)?;
    Ok(out)
}

fn flatten_table(
    prefix: &str,
    table: &toml::value::Table,
    out: &mut HashMap<String, String>,
) -> std::result::Result<(), String> {
    for (k, v) in table {
        let key = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        match v {
            toml::Value::String(s) => {
                out.insert(key, s.clone());
            }
            toml::Value::Table(sub) => flatten_table(&key, sub, out)?,
            other => {
                return Err(format!(
                    "binding '{key}' value must be a string, got {}",
                    other.type_str()
                ));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DaemonConfigState {
    pub active_name: String,
    pub profile: Profile,
    pub config_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub active_ptr: PathBuf,
    pub capabilities: Capabilities,
    pub detected_devices: Vec<String>,
}

fn config_dir() -> Result<PathBuf> {
    let dirs = UserDirs::new().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(dirs.home_dir().join(".config").join("tiltwipe"))
}

fn profiles_dir() -> Result<PathBuf> {
    Ok(config_dir()?.join("profiles"))
}

fn default_profile_text() -> &'static str {
    include_str!("../profiles/default.toml")
}

/// The compiled-in default profile.
pub fn builtin_profile() -> Result<Profile> {
    parse_profile(default_profile_text())
}

pub fn parse_profile(txt: &str) -> Result<Profile> {
    let profile: Profile = toml::from_str(txt)?;
    validate_profile(&profile)?;
    Ok(profile)
}

impl DaemonConfigState {
    pub fn load_or_install_default() -> Result<Self> {
        let cfgdir = config_dir()?;
        let profdir = profiles_dir()?;
        fs::create_dir_all(&profdir)?;

        let def_path = profdir.join("default.toml");
        if !def_path.exists() {
            fs::write(&def_path, default_profile_text())?;
            info!("installed default profile at {}", def_path.display());
        }

        let active_ptr = cfgdir.join("active");
        if !active_ptr.exists() {
            let mut f = fs::File::create(&active_ptr)?;
            f.write_all(b"default")?;
        }

        let active_name = fs::read_to_string(&active_ptr)?.trim().to_string();
        let profile = load_named_profile(&active_name)?;

        let devices = input::discover_sensors();
        let capabilities = input::capabilities(&devices);
        let detected_devices = devices.iter().map(|d| d.to_string()).collect();

        Ok(Self {
            active_name,
            profile,
            config_dir: cfgdir,
            profiles_dir: profdir,
            active_ptr,
            capabilities,
            detected_devices,
        })
    }

    pub fn reload(&mut self) -> Result<()> {
        self.profile = load_named_profile(&self.active_name)?;
        Ok(())
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        let p = self.profiles_dir.join(format!("{name}.toml"));
        if !p.exists() {
            return Err(anyhow!("profile not found: {}", p.display()));
        }
        let profile = load_named_profile(name)?;
        fs::write(&self.active_ptr, name.as_bytes())?;
        self.active_name = name.to_string();
        self.profile = profile;
        Ok(())
    }

    pub fn list_profiles(&self) -> Vec<String> {
        let mut v = Vec::new();
        if let Ok(rd) = fs::read_dir(&self.profiles_dir) {
            for e in rd.flatten() {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "toml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        v.push(stem.to_string());
                    }
                }
            }
        }
        v.sort();
        v
    }

    pub fn doctor_report(&self) -> serde_json::Value {
        let preference = self.profile.strategy_preference().ok().flatten();
        let selected = SensorStrategy::choose(&self.capabilities, preference);
        serde_json::json!({
            "capabilities": self.capabilities,
            "strategy": selected,
            "fidelity": selected.map(|s| s.fidelity()),
            "gesture_supported": selected.is_some(),
            "devices": self.detected_devices,
            "iio_present": Path::new(input::IIO_ROOT).exists(),
            "uinput_present": Path::new("/dev/uinput").exists(),
            "input_group_member": check_in_input_group(),
            "config_dir": self.config_dir,
            "profiles_dir": self.profiles_dir,
            "active_profile": self.active_name,
            "profile_name": self.profile.meta.name.as_deref().unwrap_or(&self.active_name),
            "hints": {
                "udev_rule": "/etc/udev/rules.d/80-uinput.rules",
                "add_user_to_input_group": "sudo usermod -aG input $USER && newgrp input"
            }
        })
    }
}

/// Loads `<profiles_dir>/<name>.toml`.
pub fn load_named_profile(name: &str) -> Result<Profile> {
    let path = profiles_dir()?.join(format!("{name}.toml"));
    let txt = fs::read_to_string(&path)
        .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
    parse_profile(&txt).map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
}

fn validate_profile(p: &Profile) -> Result<()> {
    let r = &p.recognizer;
    if r.retention_ms == 0 {
        return Err(anyhow!("recognizer.retention_ms must be positive"));
    }
    for (name, v) in [("far_deg", r.far_deg), ("near_deg", r.near_deg)] {
        if !v.is_finite() || v <= 0.0 {
            return Err(anyhow!("recognizer.{name} must be a positive angle"));
        }
    }
    if r.far_deg > 180.0 {
        return Err(anyhow!("recognizer.far_deg must not exceed 180"));
    }
    if r.near_deg >= r.far_deg {
        return Err(anyhow!("recognizer.near_deg must be below far_deg"));
    }
    if let Some(h) = r.horizontality_deg {
        if !(h > 0.0 && h <= 90.0) {
            return Err(anyhow!("recognizer.horizontality_deg must be in (0, 90]"));
        }
    }
    if r.min_capacity < 2 {
        return Err(anyhow!("recognizer.min_capacity must be at least 2"));
    }

    let s = &p.sensor;
    if s.staleness_ms == 0 || s.poll_ms == 0 {
        return Err(anyhow!("sensor.staleness_ms and sensor.poll_ms must be positive"));
    }
    if let Some(d) = s.dedupe_deg {
        if !d.is_finite() || d <= 0.0 {
            return Err(anyhow!("sensor.dedupe_deg must be a positive angle"));
        }
    }
    p.strategy_preference()?;

    for (k, v) in &p.bindings {
        if !TRIGGERS.contains(&k.as_str()) {
            return Err(anyhow!("unknown binding '{k}'"));
        }
        let parsed =
            Action::parse_list(v).map_err(|e| anyhow!("binding '{k}' is invalid: {e}"))?;
        if parsed.iter().any(actions::Action::is_command) && !p.meta.allow_commands {
            return Err(anyhow!("binding '{k}' uses cmd: but allow_commands=false"));
        }
    }
    Ok(())
}

fn check_in_input_group() -> bool {
    let Ok(s) = fs::read_to_string("/etc/group") else {
        return false;
    };
    let user = whoami::username();
    s.lines()
        .filter(|line| line.starts_with("input:"))
        .any(|line| line.split(':').nth(3).unwrap_or("").split(',').any(|u| u == user))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_default(patch: impl FnOnce(&mut String)) -> Result<Profile> {
        let mut txt = default_profile_text().to_string();
        patch(&mut txt);
        parse_profile(&txt)
    }

    #[test]
    fn builtin_profile_is_valid() {
        let p = builtin_profile().unwrap();
        assert_eq!(p.meta.name.as_deref(), Some("default"));
        assert_eq!(p.strategy_preference().unwrap(), None);

        let cfg = p.recognizer_config();
        let default = RecognizerConfig::default();
        assert_eq!(cfg.retention_ns, default.retention_ns);
        assert!((cfg.far_threshold - default.far_threshold).abs() < 1e-12);
        assert!((cfg.near_threshold - default.near_threshold).abs() < 1e-12);
        assert!((cfg.horizontality_gate.unwrap() - default.horizontality_gate.unwrap()).abs() < 1e-12);
        assert_eq!(cfg.dedupe_angle, None);
        assert_eq!(p.keeper.interval_sec, 3);
    }

    #[test]
    fn missing_horizontality_disables_gate() {
        let p = with_default(|t| *t = t.replace("horizontality_deg = 60.0\n", "")).unwrap();
        assert_eq!(p.recognizer_config().horizontality_gate, None);
    }

    #[test]
    fn nested_bindings_flatten() {
        let txt = r#"
[meta]
name = "nested"

[recognizer]
retention_ms = 1000
far_deg = 80.0
near_deg = 15.0

[sensor]
staleness_ms = 100
poll_ms = 10
strategy = "heading"

[bindings]
turn_and_return = "key:CTRL+N; log"
"#;
        let p = parse_profile(txt).unwrap();
        assert_eq!(
            p.strategy_preference().unwrap(),
            Some(SensorStrategy::SingleAxisListener)
        );
        assert_eq!(p.recognizer.min_capacity, 16);
        assert_eq!(p.keeper.interval_sec, 0);
        assert_eq!(
            p.actions_for("turn_and_return").unwrap(),
            vec![Action::Key("CTRL+N".into()), Action::Log]
        );
        assert!(p.actions_for("keep_alive").unwrap().is_empty());

        let bad = txt.replace("[bindings]", "[bindings.extra]");
        assert!(parse_profile(&bad).is_err());
    }

    #[test]
    fn rejects_bad_thresholds() {
        assert!(with_default(|t| *t = t.replace("near_deg = 20.0", "near_deg = 95.0")).is_err());
        assert!(with_default(|t| *t = t.replace("far_deg = 89.5", "far_deg = 200.0")).is_err());
        assert!(with_default(|t| *t = t.replace("retention_ms = 1500", "retention_ms = 0")).is_err());
        assert!(
            with_default(|t| *t = t.replace("horizontality_deg = 60.0", "horizontality_deg = 120.0"))
                .is_err()
        );
        assert!(with_default(|t| *t = t.replace("min_capacity = 16", "min_capacity = 1")).is_err());
        assert!(with_default(|t| *t = t.replace("poll_ms = 20", "poll_ms = 0")).is_err());
    }

    #[test]
    fn rejects_unknown_strategy() {
        assert!(with_default(|t| *t = t.replace("\"auto\"", "\"gyro\"")).is_err());
    }

    #[test]
    fn commands_need_opt_in() {
        let with_cmd = |t: &mut String| *t = t.replace("keep_alive = \"\"", "keep_alive = \"cmd:true\"");
        assert!(with_default(with_cmd).is_err());
        assert!(
            with_default(|t| {
                with_cmd(t);
                *t = t.replace("allow_commands = false", "allow_commands = true");
            })
            .is_ok()
        );
    }

    #[test]
    fn doctor_report_names_profile_and_dirs() {
        let mut profile = builtin_profile().unwrap();
        profile.meta.name = Some("Kiosk A".into());
        let state = DaemonConfigState {
            active_name: "kiosk".into(),
            profile,
            config_dir: PathBuf::from("/tmp/tiltwipe"),
            profiles_dir: PathBuf::from("/tmp/tiltwipe/profiles"),
            active_ptr: PathBuf::from("/tmp/tiltwipe/active"),
            capabilities: Capabilities {
                heading: true,
                ..Capabilities::default()
            },
            detected_devices: vec![],
        };

        let report = state.doctor_report();
        assert_eq!(report["profile_name"], "Kiosk A");
        assert_eq!(report["active_profile"], "kiosk");
        assert_eq!(report["config_dir"], "/tmp/tiltwipe");
        assert_eq!(report["strategy"], "heading");
        assert_eq!(report["fidelity"], "azimuth_only");
        assert_eq!(report["gesture_supported"], true);

        let unnamed = DaemonConfigState {
            profile: with_default(|t| *t = t.replace("name = \"default\"\n", "")).unwrap(),
            ..state
        };
        assert_eq!(unnamed.doctor_report()["profile_name"], "kiosk");
    }

    #[test]
    fn rejects_unknown_binding() {
        assert!(with_default(|t| t.push_str("two_finger_tap = \"log\"\n")).is_err());
        assert!(with_default(|t| *t = t.replace("key:CTRL+N\"\nmanual", "mouse:left\"\nmanual")).is_err());
    }
}
