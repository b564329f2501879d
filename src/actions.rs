use anyhow::{Result, anyhow};
use log::{info, warn};
use std::{process::Command, thread};

/// One side effect bound to a trigger. Bindings hold one or more of these
/// separated by `;`, e.g. `"cmd:buzz 100; key:CTRL+N"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Key chord sent through the virtual keyboard, like "CTRL+N".
    Key(String),
    /// Shell command, only with `allow_commands`.
    Command(String),
    Log,
}

impl Action {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "log" {
            return Ok(Action::Log);
        }
        if let Some(rest) = s.strip_prefix("key:") {
            let chord = rest.trim();
            for tok in chord.split('+') {
                let tok = tok.trim();
                if tok.is_empty() {
                    return Err(anyhow!("empty key in chord '{chord}'"));
                }
                #[cfg(target_os = "linux")]
                map_key(&tok.to_ascii_uppercase())?;
            }
            return Ok(Action::Key(chord.to_string()));
        }
        if let Some(rest) = s.strip_prefix("cmd:") {
            if rest.trim().is_empty() {
                return Err(anyhow!("empty command"));
            }
            return Ok(Action::Command(rest.trim().to_string()));
        }
        Err(anyhow!("invalid action '{s}'"))
    }

    /// Empty entries are skipped, so `""` means "do nothing".
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        s.split(';')
            .filter(|part| !part.trim().is_empty())
            .map(Action::parse)
            .collect()
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Action::Command(_))
    }
}

/// Starts `sh -c cmd` in the background; a helper thread reaps it.
pub fn run_command(cmd: &str) -> Result<()> {
    let mut child = Command::new("sh").arg("-c").arg(cmd).spawn()?;
    info!("spawned '{cmd}' (pid={})", child.id());
    let cmd = cmd.to_string();
    thread::spawn(move || match child.wait() {
        Ok(status) if !status.success() => warn!("'{cmd}' exited with {status}"),
        Ok(_) => {}
        Err(e) => warn!("waiting for '{cmd}' failed: {e}"),
    });
    Ok(())
}

pub struct UinputSink {
    enabled: bool,
    #[allow(dead_code)]
    linux: Option<Box<LinuxUinput>>,
}

impl UinputSink {
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            let dev = LinuxUinput::create()?;
            return Ok(Self {
                enabled: true,
                linux: Some(Box::new(dev)),
            });
        }
        #[allow(unreachable_code)]
        {
            warn!("uinput not available; running in NO-OP mode");
            Ok(Self::noop())
        }
    }

    pub fn noop() -> Self {
        Self {
            enabled: true,
            linux: None,
        }
    }

    /// `new()`, degrading to a no-op sink when uinput cannot be opened.
    pub fn open_or_noop() -> Self {
        Self::new().unwrap_or_else(|e| {
            warn!("uinput unavailable ({e}); key actions disabled");
            Self::noop()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, en: bool) {
        self.enabled = en;
    }

    /// Send a chord like "CTRL+N" or a single "ESC"
    pub fn key_chord(&mut self, chord: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        if let Some(dev) = self.linux.as_mut() {
            let mut keys = Vec::new();
            for tok in chord.split('+') {
                keys.push(map_key(&tok.trim().to_ascii_uppercase())?);
            }
            // press in order
            for k in &keys {
                dev.key_send(*k, 1)?;
            }
            dev.sync()?;
            // release in reverse
            for k in keys.iter().rev() {
                dev.key_send(*k, 0)?;
            }
            dev.sync()?;
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn map_key(tok: &str) -> Result<uinput::event::keyboard::Key> {
    use uinput::event::keyboard::Key as K;
    let k = match tok {
        "CTRL" | "CONTROL" => K::LeftControl,
        "ALT" => K::LeftAlt,
        "SHIFT" => K::LeftShift,
        "SUPER" | "META" | "WIN" => K::LeftMeta,
        "TAB" => K::Tab,
        "ESC" | "ESCAPE" => K::Esc,
        "ENTER" | "RETURN" => K::Enter,
        "SPACE" => K::Space,
        "BACKSPACE" => K::BackSpace,
        "DELETE" | "DEL" => K::Delete,
        "MINUS" | "-" => K::Minus,
        "EQUAL" | "=" => K::Equal,
        "F5" => K::F5,
        "A" => K::A,
        "C" => K::C,
        "E" => K::E,
        "N" => K::N,
        "R" => K::R,
        "S" => K::S,
        "X" => K::X,
        "Z" => K::Z,
        other => return Err(anyhow!("unsupported key token: {other}")),
    };
    Ok(k)
}

#[cfg(target_os = "linux")]
struct LinuxUinput {
    dev: uinput::device::Device,
}

#[cfg(target_os = "linux")]
impl LinuxUinput {
    fn create() -> Result<Self> {
        let dev = uinput::default()?
            .name("Tiltwipe Virtual Keyboard")?
            .event(uinput::event::Keyboard::All)?
            .create()?;

        info!("uinput: created virtual keyboard");
        Ok(Self { dev })
    }

    fn sync(&mut self) -> Result<()> {
        self.dev.synchronize()?;
        Ok(())
    }

    fn key_send(&mut self, key: uinput::event::keyboard::Key, val: i32) -> Result<()> {
        self.dev.send(key, val)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_actions() {
        assert_eq!(Action::parse("log").unwrap(), Action::Log);
        assert_eq!(
            Action::parse(" key:CTRL+N ").unwrap(),
            Action::Key("CTRL+N".into())
        );
        assert_eq!(
            Action::parse("cmd:notify-send cleared").unwrap(),
            Action::Command("notify-send cleared".into())
        );
        assert!(Action::parse("cmd:  ").is_err());
        assert!(Action::parse("key:CTRL+").is_err());
        assert!(Action::parse("mouse:left").is_err());
    }

    #[test]
    fn parses_lists() {
        assert!(Action::parse_list("").unwrap().is_empty());
        assert!(Action::parse_list(" ; ").unwrap().is_empty());
        let list = Action::parse_list("cmd:buzz 100; key:ESC;log").unwrap();
        assert_eq!(
            list,
            vec![
                Action::Command("buzz 100".into()),
                Action::Key("ESC".into()),
                Action::Log
            ]
        );
        assert!(list[0].is_command());
        assert!(Action::parse_list("log; nonsense").is_err());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn rejects_unknown_keys() {
        assert!(Action::parse("key:CTRL+HYPER").is_err());
    }

    #[test]
    fn noop_sink_accepts_chords() {
        let mut sink = UinputSink::noop();
        assert!(sink.is_enabled());
        sink.key_chord("CTRL+N").unwrap();
        sink.set_enabled(false);
        sink.key_chord("CTRL+N").unwrap();
    }
}
