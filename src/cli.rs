use anyhow::{Result, anyhow};
use pico_args::Arguments;
use std::{
    env, fs,
    io::{self, BufReader},
    process::Command,
};

use crate::config;
use crate::input;
use crate::ipc::{self, pipeline};
use crate::sensors::SensorStrategy;

pub fn run() -> Result<()> {
    let mut pargs = Arguments::from_env();

    // Hidden daemon mode (spawned by `start`)
    if pargs.contains("--daemon") {
        return ipc::run_daemon();
    }

    // No args -> general help
    if env::args().len() == 1 {
        print_help();
        return Ok(());
    }

    // Flags-based help (-h/--help)
    if pargs.contains("-h") || pargs.contains("--help") {
        print_help();
        return Ok(());
    }

    // First free arg is the subcommand
    let subcmd: Option<String> = pargs.free_from_str().ok();

    match subcmd.as_deref() {
        Some("help") => {
            let topic: Option<String> = pargs.free_from_str().ok();
            if let Some(t) = topic {
                print_subcmd_help(&t);
            } else {
                print_help();
            }
            Ok(())
        }

        Some("start") => {
            let exe = env::current_exe()?;
            let child = Command::new(exe).arg("--daemon").spawn()?;
            println!("tiltwipe: started daemon (pid={})", child.id());
            Ok(())
        }

        Some("stop") => request("shutdown"),
        Some("status") => request("status"),
        Some("reload") => request("reload"),
        Some("list") => request("list"),
        Some("doctor") => request("doctor"),
        Some("clear") => request("clear"),
        Some("enable") => request("enable"),
        Some("disable") => request("disable"),

        Some("use") => {
            let name: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: tiltwipe use <profile_name>"))?;
            let r = ipc::client_request(serde_json::json!({"op":"use","profile":name}))?;
            print_response(&r);
            Ok(())
        }

        Some("replay") => replay(&mut pargs),

        Some(other) => {
            eprintln!("unknown subcommand: {other}\n");
            print_help();
            Ok(())
        }

        None => {
            print_help();
            Ok(())
        }
    }
}

fn request(op: &str) -> Result<()> {
    let r = ipc::client_request(serde_json::json!({ "op": op }))?;
    print_response(&r);
    Ok(())
}

fn replay(pargs: &mut Arguments) -> Result<()> {
    let strategy: Option<String> = pargs.opt_value_from_str("--strategy")?;
    let profile_name: Option<String> = pargs.opt_value_from_str("--profile")?;
    let file: String = pargs
        .free_from_str()
        .map_err(|_| anyhow!("usage: tiltwipe replay <file|-> [--strategy s] [--profile p]"))?;

    let strategy = strategy.as_deref().map(SensorStrategy::from_name).transpose()?;
    let profile = match profile_name {
        Some(name) => config::load_named_profile(&name)?,
        None => config::builtin_profile()?,
    };

    let readings = if file == "-" {
        input::read_recording(io::stdin().lock())?
    } else {
        let f = fs::File::open(&file).map_err(|e| anyhow!("failed to open {file}: {e}"))?;
        input::read_recording(BufReader::new(f))?
    };

    let report = pipeline::replay(&readings, &profile, strategy)?;
    for d in &report.detections {
        println!("{}", serde_json::to_string(d)?);
    }
    println!(
        "{}",
        serde_json::json!({
            "strategy": report.strategy,
            "readings": report.readings,
            "samples": report.samples,
            "detections": report.detections.len(),
        })
    );
    Ok(())
}

fn print_help() {
    println!(
        r#"tiltwipe — turn-and-return gesture daemon

USAGE:
  tiltwipe help [command]                 Show general or command-specific help
  tiltwipe start                          Start the daemon
  tiltwipe stop                           Stop the daemon
  tiltwipe status                         Show daemon state
  tiltwipe reload                         Reload active profile
  tiltwipe use <name>                     Switch active profile
  tiltwipe list                           List profiles
  tiltwipe doctor                         Diagnose sensors/permissions
  tiltwipe clear                          Fire the manual_clear binding
  tiltwipe enable | disable               Resume/pause gesture actions
  tiltwipe replay <file|-> [options]      Run a recorded sensor trace offline

TIPS:
  - Install systemd user unit: ~/.config/systemd/user/tiltwipe.service
  - Profiles: ~/.config/tiltwipe/profiles
  - Active profile pointer: ~/.config/tiltwipe/active
  - Log filter: TILTWIPE_LOG=debug
"#
    );
}

fn print_subcmd_help(cmd: &str) {
    match cmd {
        "start" => println!("usage: tiltwipe start\nStarts the background daemon."),
        "stop" => println!("usage: tiltwipe stop\nStops the running daemon."),
        "status" => println!(
            "usage: tiltwipe status\nShows enabled flag, active profile, sensor strategy, detections, socket."
        ),
        "reload" => println!(
            "usage: tiltwipe reload\nReloads the current profile; keeps last good on error."
        ),
        "use" => {
            println!("usage: tiltwipe use <name>\nSwitches active profile to <name> and reloads.")
        }
        "list" => println!("usage: tiltwipe list\nLists available profiles."),
        "doctor" => println!(
            "usage: tiltwipe doctor\nProbes orientation sensors and checks uinput permissions."
        ),
        "clear" => println!("usage: tiltwipe clear\nRuns the manual_clear binding once."),
        "enable" | "disable" => println!(
            "usage: tiltwipe enable|disable\nResumes or pauses gesture actions; detection keeps running."
        ),
        "replay" => println!(
            "usage: tiltwipe replay <file|-> [--strategy rotation_vector|accel_magnet|heading] [--profile name]\n\
             Feeds a JSON-lines recording through the recognizer and prints each detection."
        ),
        _ => {
            eprintln!("unknown command: {cmd}\n");
            print_help();
        }
    }
}

fn print_response(v: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(v).unwrap_or_default());
}
