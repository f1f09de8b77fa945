mod ambient_brightness;
mod capture;
mod config;
mod control_client;
mod control_server;
mod curve;
mod dispatcher;
mod error;
mod event;
mod kbd_brightness;
mod kbd_controller;
mod power;
mod screen_brightness;
mod screen_controller;
#[cfg(test)]
mod testing;
mod timer;

use std::{
    fs,
    path::Path,
    sync::{
        atomic::{self, AtomicBool},
        Arc,
    },
    time::Instant,
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam::channel::unbounded;
use env_logger::Env;
use log::{debug, error, info};
use logind_zbus::session::SessionProxyBlocking;
use zbus::blocking::Connection;

use crate::{
    ambient_brightness::{AmbientBrightness, Sampler},
    capture::EvdevSource,
    config::{Cli, Commands, Config, CurveArgs},
    control_client::ControlClient,
    control_server::{Command, ControlServer},
    curve::CalibrationPoints,
    dispatcher::Dispatcher,
    kbd_brightness::KBDBrightness,
    kbd_controller::KeyboardController,
    power::LogindPowerSource,
    screen_brightness::ScreenBrightness,
    screen_controller::ScreenController,
};

/// Reads a single integer sysfs attribute.
fn read_value(path: impl AsRef<Path>) -> Result<u32> {
    let path = path.as_ref();
    let val = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let res = val
        .trim()
        .parse()
        .with_context(|| format!("parsing {:?} from {:?}", val.trim(), path))?;
    Ok(res)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(Config::try_from(args)?),
        Commands::DisplayOff => ControlClient::new()?.send(Command::DisplayOff),
        Commands::DisplayOn => ControlClient::new()?.send(Command::DisplayOn),
        Commands::Retrigger => ControlClient::new()?.send(Command::Retrigger),
        Commands::Curve(args) => print_curve(&args),
    }
}

fn run(config: Config) -> Result<()> {
    let connection = Connection::system()?;
    let proxy = SessionProxyBlocking::builder(&connection)
        .path("/org/freedesktop/login1/session/auto")?
        .build()?;

    let (sender, events) = unbounded();
    let now = Instant::now();

    let keyboard = match &config.keyboard {
        Some(kbd_config) => {
            let backlight = KBDBrightness::new(&proxy, &kbd_config.led, sender.clone())?;
            let input = EvdevSource::open(&kbd_config.input_devices, sender.clone())?;
            let power = LogindPowerSource::spawn(&connection, sender.clone())?;

            let mut kbd = KeyboardController::new(backlight, input, power);
            kbd.set_inactivity_timeout(kbd_config.inactivity_timeout, now)?;
            kbd.set_on_level(kbd_config.on_level, now)?;
            kbd.enable()?;
            info!(
                "Keyboard backlight {}: on level {}, timeout {}s",
                kbd_config.led,
                kbd.on_level(),
                kbd.inactivity_timeout()
            );
            Some(kbd)
        }
        None => None,
    };

    let screen = match &config.screen {
        Some(screen_config) => {
            let slider = ScreenBrightness::new(&proxy, "backlight", &screen_config.backlight)?;
            let device = screen_config.als_device.clone();
            let frames = screen_config.frames;
            let sampler = Sampler::spawn(move || AmbientBrightness::new(&device, frames))?;

            let mut screen = ScreenController::new(slider, sampler);
            screen.set_curvature(screen_config.curvature)?;
            screen.set_learned_points(screen_config.points.iter().copied())?;
            screen.set_poll_period(screen_config.poll_period, now);
            screen.set_hot_key_enabled(screen_config.hot_key_enabled);
            screen.enable(now);
            info!(
                "Screen backlight {}: {} calibration points, curvature {}, poll period {}s",
                screen_config.backlight,
                screen.learned_points().len(),
                screen.curvature(),
                screen.poll_period()
            );
            debug!(
                "Calibration curve: {} samples, valid {}",
                screen.smoothed_curve().points.len(),
                screen.is_curve_valid()
            );
            Some(screen)
        }
        None => None,
    };

    let exit_bool = Arc::new(AtomicBool::new(false));
    let e = exit_bool.clone();
    ctrlc::set_handler(move || {
        e.store(true, atomic::Ordering::Relaxed);
    })?;

    let server_handle = ControlServer::new(sender)?.run(exit_bool.clone());

    let mut dispatcher = Dispatcher::new(keyboard, screen);
    dispatcher.run(&events, &exit_bool);

    // the loop may also end because a producer died
    exit_bool.store(true, atomic::Ordering::Relaxed);
    if let Err(e) = dispatcher.shutdown() {
        error!("Failed to restore the keyboard backlight: {:?}", e);
    }

    server_handle
        .join()
        .map_err(|_| anyhow!("control server panicked"))??;
    info!("Exiting");

    Ok(())
}

fn print_curve(args: &CurveArgs) -> Result<()> {
    let learned = CalibrationPoints::new(args.curve.points());
    let smoothed = curve::smooth(learned.as_slice(), args.curve.curvature.clamp(0.0, 1.0));

    println!(
        "{} points, curvature {}: {}",
        learned.len(),
        args.curve.curvature,
        if smoothed.valid { "valid" } else { "INVALID, folds back" }
    );
    for &x in &args.intensities {
        println!("{:.3} -> {:.3}", x, smoothed.interpolate(x));
    }
    Ok(())
}
