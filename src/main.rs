mod actions;
mod cli;
mod config;
mod error;
mod gestures;
mod history;
mod input;
mod ipc;
mod keeper;
mod logging;
mod orientation;
mod sensors;

fn main() -> anyhow::Result<()> {
    logging::init();
    cli::run()
}
