use crate::actions::{self, Action, UinputSink};
use crate::config::Profile;
use crate::gestures::Gesture;
use anyhow::{Result, anyhow};
use log::info;
use std::sync::{Arc, Mutex};

pub fn dispatch_gesture(
    g: &Gesture,
    profile_arc: &Arc<Mutex<Profile>>,
    sink: &mut UinputSink,
) -> Result<()> {
    let profile = profile_arc
        .lock()
        .map_err(|_| anyhow!("profile lock poisoned"))?
        .clone();
    dispatch_trigger(g.binding_key(), &profile, sink)
}

/// Runs every action bound to `trigger`, stopping at the first failure.
pub fn dispatch_trigger(trigger: &str, profile: &Profile, sink: &mut UinputSink) -> Result<()> {
    let actions = profile.actions_for(trigger)?;
    if actions.is_empty() {
        info!("{trigger}: no actions bound");
        return Ok(());
    }

    for action in actions {
        match action {
            Action::Log => info!("{trigger} triggered"),
            Action::Key(chord) => sink.key_chord(&chord)?,
            Action::Command(cmd) => {
                if !profile.meta.allow_commands {
                    return Err(anyhow!(
                        "{trigger}: cmd: actions need allow_commands=true"
                    ));
                }
                actions::run_command(&cmd)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    #[test]
    fn dispatches_bound_keys_through_sink() {
        let profile = config::builtin_profile().unwrap();
        let mut sink = UinputSink::noop();
        dispatch_trigger("turn_and_return", &profile, &mut sink).unwrap();
        dispatch_trigger("keep_alive", &profile, &mut sink).unwrap();
        dispatch_trigger("not_bound", &profile, &mut sink).unwrap();
    }

    #[test]
    fn refuses_commands_without_opt_in() {
        let mut profile = config::builtin_profile().unwrap();
        profile
            .bindings
            .insert("manual_clear".into(), "cmd:true".into());
        let mut sink = UinputSink::noop();
        assert!(dispatch_trigger("manual_clear", &profile, &mut sink).is_err());
    }

    #[test]
    fn gesture_uses_its_binding_key() {
        let profile = Arc::new(Mutex::new(config::builtin_profile().unwrap()));
        let mut sink = UinputSink::noop();
        dispatch_gesture(&Gesture::TurnAndReturn, &profile, &mut sink).unwrap();
    }
}
