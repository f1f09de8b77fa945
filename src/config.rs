use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};

use crate::{capture::DeviceMatch, curve::Point};

/// Calibration used until the user teaches their own points.
pub(crate) const DEFAULT_POINTS: [Point; 4] = [
    Point::new(0.0, 0.10),
    Point::new(0.10, 0.65),
    Point::new(0.35, 0.95),
    Point::new(1.0, 1.0),
];

/// Built-in keyboard and TrackPoint on the i8042 controller, and the
/// Synaptics TouchPad.
fn default_input_devices() -> Vec<DeviceMatch> {
    vec![
        DeviceMatch::Phys("isa0060/serio0".to_string()),
        DeviceMatch::Phys("isa0060/serio1".to_string()),
        DeviceMatch::Id {
            vendor: 0x06cb,
            product: 0x000f,
        },
    ]
}

/// Keyboard and screen backlight automation
#[derive(Debug, Parser)]
#[command(version, about)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Run the daemon
    Run(RunArgs),
    /// Tell the daemon the display was blanked
    DisplayOff,
    /// Tell the daemon the display is back on
    DisplayOn,
    /// Refresh the screen brightness now
    Retrigger,
    /// Check a calibration curve without touching the hardware
    Curve(CurveArgs),
}

#[derive(Debug, Args)]
pub(crate) struct RunArgs {
    /// Leave the keyboard backlight alone
    #[arg(long)]
    pub no_keyboard: bool,

    /// LED under /sys/class/leds driving the keyboard backlight
    #[arg(long, default_value = "tpacpi::kbd_backlight")]
    pub kbd_led: String,

    /// Seconds without input before the keyboard light goes off (`inf` to never)
    #[arg(long, default_value_t = 60.0)]
    pub timeout: f64,

    /// Keyboard backlight level used while lit
    #[arg(long, default_value_t = 2)]
    pub on_level: u32,

    /// Input device counted as activity: name substring, `phys=<prefix>` or `vvvv:pppp`
    #[arg(long = "input-device")]
    pub input_devices: Vec<DeviceMatch>,

    /// Leave the screen brightness alone
    #[arg(long)]
    pub no_screen: bool,

    /// Device under /sys/class/backlight
    #[arg(long, default_value = "intel_backlight")]
    pub screen_backlight: String,

    /// IIO ambient light sensor
    #[arg(long, default_value = "als")]
    pub als_device: String,

    /// Seconds between ambient light samples (`inf` to sample on demand only)
    #[arg(long, default_value_t = f64::INFINITY)]
    pub poll_period: f64,

    /// Ignore `retrigger` requests
    #[arg(long)]
    pub no_hotkey: bool,

    #[command(flatten)]
    pub curve: CurveOpts,

    /// Sensor frames averaged per sample
    #[arg(long, default_value_t = 5)]
    pub frames: u8,
}

#[derive(Debug, Args)]
pub(crate) struct CurveOpts {
    /// Spline tension between 0 and 1
    #[arg(long, default_value_t = 0.5)]
    pub curvature: f64,

    /// Calibration point `intensity,brightness`, both between 0 and 1
    #[arg(long = "point")]
    pub points: Vec<Point>,
}

#[derive(Debug, Args)]
pub(crate) struct CurveArgs {
    #[command(flatten)]
    pub curve: CurveOpts,

    /// Ambient intensities to look up
    pub intensities: Vec<f64>,
}

impl CurveOpts {
    pub(crate) fn points(&self) -> Vec<Point> {
        if self.points.is_empty() {
            DEFAULT_POINTS.to_vec()
        } else {
            self.points.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KeyboardConfig {
    pub led: String,
    pub inactivity_timeout: f64,
    pub on_level: u32,
    pub input_devices: Vec<DeviceMatch>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScreenConfig {
    pub backlight: String,
    pub als_device: String,
    pub frames: u8,
    pub poll_period: f64,
    pub hot_key_enabled: bool,
    pub curvature: f64,
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Config {
    pub keyboard: Option<KeyboardConfig>,
    pub screen: Option<ScreenConfig>,
}

impl TryFrom<RunArgs> for Config {
    type Error = anyhow::Error;

    fn try_from(args: RunArgs) -> Result<Self> {
        if args.no_keyboard && args.no_screen {
            bail!("nothing to do with both --no-keyboard and --no-screen");
        }

        let keyboard = if args.no_keyboard {
            None
        } else {
            if args.timeout.is_nan() || args.timeout <= 0.0 {
                bail!("--timeout must be positive, got {}", args.timeout);
            }
            let input_devices = if args.input_devices.is_empty() {
                default_input_devices()
            } else {
                args.input_devices
            };
            Some(KeyboardConfig {
                led: args.kbd_led,
                inactivity_timeout: args.timeout,
                on_level: args.on_level,
                input_devices,
            })
        };

        let screen = if args.no_screen {
            None
        } else {
            if args.poll_period.is_nan() || args.poll_period <= 0.0 {
                bail!("--poll-period must be positive, got {}", args.poll_period);
            }
            if !(0.0..=1.0).contains(&args.curve.curvature) {
                bail!("--curvature must be between 0 and 1, got {}", args.curve.curvature);
            }
            if args.frames == 0 {
                bail!("--frames must be at least 1");
            }
            Some(ScreenConfig {
                backlight: args.screen_backlight,
                als_device: args.als_device,
                frames: args.frames,
                poll_period: args.poll_period,
                hot_key_enabled: !args.no_hotkey,
                curvature: args.curve.curvature,
                points: args.curve.points(),
            })
        };

        Ok(Self { keyboard, screen })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> Result<Config> {
        let cli = Cli::try_parse_from(["auto_backlight", "run"].iter().chain(args))?;
        match cli.command {
            Commands::Run(run) => Config::try_from(run),
            other => bail!("parsed {:?}", other),
        }
    }

    #[test]
    fn defaults() {
        let config = run(&[]).unwrap();

        let kbd = config.keyboard.unwrap();
        assert_eq!(kbd.led, "tpacpi::kbd_backlight");
        assert_eq!(kbd.inactivity_timeout, 60.0);
        assert_eq!(kbd.on_level, 2);
        assert_eq!(kbd.input_devices.len(), 3);

        let screen = config.screen.unwrap();
        assert_eq!(screen.backlight, "intel_backlight");
        assert!(screen.poll_period.is_infinite());
        assert!(screen.hot_key_enabled);
        assert_eq!(screen.curvature, 0.5);
        assert_eq!(screen.points, DEFAULT_POINTS.to_vec());
        assert_eq!(screen.frames, 5);
    }

    #[test]
    fn default_devices_are_the_built_in_ones() {
        let kbd = run(&[]).unwrap().keyboard.unwrap();
        let matched = |name: &str, phys: &str, vendor: u16, product: u16| {
            kbd.input_devices
                .iter()
                .any(|m| m.fits(Some(name), Some(phys), vendor, product))
        };

        assert!(matched("AT Translated Set 2 keyboard", "isa0060/serio0/input0", 0x0001, 0x0001));
        assert!(matched("TPPS/2 Elan TrackPoint", "isa0060/serio1/input0", 0x0002, 0x000a));
        assert!(matched("Synaptics TouchPad", "rmi4-00/input0", 0x06cb, 0x000f));

        // same names plugged in over USB
        assert!(!matched(
            "Lenovo TrackPoint Keyboard II",
            "usb-0000:00:14.0-2/input0",
            0x17ef,
            0x60ee
        ));
        assert!(!matched("USB TouchPad", "usb-0000:00:14.0-3/input1", 0x1234, 0x5678));
    }

    #[test]
    fn repeated_flags_collect() {
        let config = run(&[
            "--input-device",
            "phys=isa0060",
            "--input-device",
            "17ef:6009",
            "--point",
            "0,0.2",
            "--point",
            "1,0.9",
            "--no-hotkey",
            "--timeout",
            "inf",
        ])
        .unwrap();

        let kbd = config.keyboard.unwrap();
        assert!(kbd.inactivity_timeout.is_infinite());
        assert_eq!(
            kbd.input_devices,
            vec![
                DeviceMatch::Phys("isa0060".to_string()),
                DeviceMatch::Id {
                    vendor: 0x17ef,
                    product: 0x6009
                },
            ]
        );

        let screen = config.screen.unwrap();
        assert!(!screen.hot_key_enabled);
        assert_eq!(screen.points, vec![Point::new(0.0, 0.2), Point::new(1.0, 0.9)]);
    }

    #[test]
    fn disabled_halves_are_absent() {
        let config = run(&["--no-screen"]).unwrap();
        assert!(config.keyboard.is_some());
        assert!(config.screen.is_none());

        assert!(run(&["--no-screen", "--no-keyboard"]).is_err());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(run(&["--timeout", "0"]).is_err());
        assert!(run(&["--timeout", "-5"]).is_err());
        assert!(run(&["--curvature", "1.5"]).is_err());
        assert!(run(&["--frames", "0"]).is_err());
        assert!(run(&["--point", "nope"]).is_err());
    }

    #[test]
    fn curve_subcommand() {
        let cli =
            Cli::try_parse_from(["auto_backlight", "curve", "--curvature", "0", "0.2", "0.8"])
                .unwrap();
        let Commands::Curve(args) = cli.command else {
            panic!("expected curve");
        };
        assert_eq!(args.curve.curvature, 0.0);
        assert_eq!(args.intensities, vec![0.2, 0.8]);
        assert_eq!(args.curve.points(), DEFAULT_POINTS.to_vec());
    }
}
