//! Turns raw input from the built-in keyboard and pointing devices into
//! single activity pulses.

use std::{
    fmt, fs,
    fs::File,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{self, AtomicBool},
        Arc,
    },
    thread,
};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel::Sender;
use evdev_rs::{
    enums::{EventCode, EV_SYN},
    Device, DeviceWrapper, ReadFlag, ReadStatus,
};
use log::{debug, error, info, trace};

use crate::{error::Error, event::Event};

pub(crate) trait InputSource {
    fn subscribe(&mut self) -> Result<()>;
    fn unsubscribe(&mut self);
}

/// Edge triggered activity capture: once started, the first tick produces a
/// pulse and capture stops itself until started again.
pub(crate) struct Capture<S> {
    source: S,
    started: bool,
}

impl<S: InputSource> Capture<S> {
    pub(crate) fn new(source: S) -> Self {
        Self {
            source,
            started: false,
        }
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        if !self.started {
            self.source.subscribe()?;
            self.started = true;
        }
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        if self.started {
            self.source.unsubscribe();
            self.started = false;
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started
    }

    pub(crate) fn deliver(&mut self) -> bool {
        if !self.started {
            trace!("Input tick while capture stopped");
            return false;
        }
        self.stop();
        true
    }
}

/// Selects an input device by name substring, `phys=` prefix or
/// `vvvv:pppp` vendor and product id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeviceMatch {
    Name(String),
    Phys(String),
    Id { vendor: u16, product: u16 },
}

impl DeviceMatch {
    fn matches(&self, dev: &impl DeviceWrapper) -> bool {
        self.fits(dev.name(), dev.phys(), dev.vendor_id(), dev.product_id())
    }

    pub(crate) fn fits(&self, name: Option<&str>, phys: Option<&str>, vendor: u16, product: u16) -> bool {
        match self {
            DeviceMatch::Name(n) => name.map_or(false, |name| name.contains(n.as_str())),
            DeviceMatch::Phys(p) => phys.map_or(false, |phys| phys.starts_with(p.as_str())),
            DeviceMatch::Id {
                vendor: v,
                product: p,
            } => vendor == *v && product == *p,
        }
    }
}

impl FromStr for DeviceMatch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(phys) = s.strip_prefix("phys=") {
            return Ok(DeviceMatch::Phys(phys.to_string()));
        }
        if let Some((vendor, product)) = s.split_once(':') {
            if let (Ok(vendor), Ok(product)) = (
                u16::from_str_radix(vendor, 16),
                u16::from_str_radix(product, 16),
            ) {
                return Ok(DeviceMatch::Id { vendor, product });
            }
        }
        if s.is_empty() {
            bail!("empty device match");
        }
        Ok(DeviceMatch::Name(s.to_string()))
    }
}

impl fmt::Display for DeviceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMatch::Name(name) => write!(f, "{}", name),
            DeviceMatch::Phys(phys) => write!(f, "phys={}", phys),
            DeviceMatch::Id { vendor, product } => write!(f, "{:04x}:{:04x}", vendor, product),
        }
    }
}

/// Reader threads on the whitelisted `/dev/input/event*` nodes.
///
/// Readers drain their device continuously; while the gate is open the first
/// qualifying event closes it and posts a single `Event::Activity`.
pub(crate) struct EvdevSource {
    gate: Arc<AtomicBool>,
}

impl EvdevSource {
    const INPUT_DIR: &'static str = "/dev/input";

    pub(crate) fn open(matches: &[DeviceMatch], sender: Sender<Event>) -> Result<Self> {
        let gate = Arc::new(AtomicBool::new(false));
        let mut found = vec![false; matches.len()];
        let mut devices = Vec::new();

        for path in event_nodes(Path::new(Self::INPUT_DIR))? {
            let dev = match open_device(&path) {
                Ok(dev) => dev,
                Err(e) => {
                    debug!("Skipping {:?}: {}", path, e);
                    continue;
                }
            };

            let mut hooked = false;
            for (i, m) in matches.iter().enumerate() {
                if m.matches(&dev) {
                    found[i] = true;
                    hooked = true;
                }
            }
            if hooked {
                info!("Capturing input from {:?} ({})", path, dev.name().unwrap_or("?"));
                devices.push(path);
            }
        }

        let missing: Vec<String> = matches
            .iter()
            .zip(&found)
            .filter(|(_, found)| !**found)
            .map(|(m, _)| m.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(anyhow!(Error::HardwareUnavailable(format!(
                "built-in input devices not found: {}",
                missing.join(", ")
            ))));
        }

        for path in devices {
            let gate = gate.clone();
            let sender = sender.clone();
            thread::Builder::new()
                .name(format!("input {}", path.display()))
                .spawn(move || {
                    if let Err(e) = open_device(&path).and_then(|dev| read_loop(&dev, &gate, &sender)) {
                        error!("Input reader for {:?} stopped: {:?}", path, e);
                    }
                })
                .context("spawning input reader")?;
        }

        Ok(Self { gate })
    }
}

impl InputSource for EvdevSource {
    fn subscribe(&mut self) -> Result<()> {
        self.gate.store(true, atomic::Ordering::Release);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.gate.store(false, atomic::Ordering::Release);
    }
}

fn open_device(path: &Path) -> Result<Device> {
    let file = File::open(path)?;
    Ok(Device::new_from_file(file)?)
}

fn event_nodes(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut nodes: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("listing {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with("event"))
        })
        .collect();
    nodes.sort();
    Ok(nodes)
}

/// LED feedback (Caps Lock from another keyboard) and sync markers are not
/// user activity.
fn is_activity(code: &EventCode) -> bool {
    !matches!(
        code,
        EventCode::EV_LED(_) | EventCode::EV_SYN(EV_SYN::SYN_REPORT)
    )
}

fn read_loop(dev: &Device, gate: &AtomicBool, sender: &Sender<Event>) -> Result<()> {
    loop {
        let (status, ev) = dev.next_event(ReadFlag::NORMAL | ReadFlag::BLOCKING)?;
        if matches!(status, ReadStatus::Sync) || !is_activity(&ev.event_code) {
            continue;
        }
        if gate.swap(false, atomic::Ordering::AcqRel) {
            trace!("Activity: {:?}", ev.event_code);
            sender
                .send(Event::Activity)
                .map_err(|_| anyhow!("dispatcher gone"))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use evdev_rs::enums::EV_KEY;

    use super::*;
    use crate::testing::MockSource;

    #[test]
    fn first_tick_pulses_then_stops() {
        let (source, subs) = MockSource::new();
        let mut capture = Capture::new(source);

        assert!(!capture.deliver());
        capture.start().unwrap();
        assert!(subs.borrow().active);

        assert!(capture.deliver());
        assert!(!capture.is_started());
        assert!(!subs.borrow().active);
        assert!(!capture.deliver());
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let (source, subs) = MockSource::new();
        let mut capture = Capture::new(source);

        capture.start().unwrap();
        capture.start().unwrap();
        assert_eq!(subs.borrow().subscribes, 1);
        capture.stop();
        capture.stop();
        assert!(!subs.borrow().active);

        capture.start().unwrap();
        assert_eq!(subs.borrow().subscribes, 2);
    }

    #[test]
    fn device_match_parsing() {
        assert_eq!(
            "06cb:000f".parse::<DeviceMatch>().unwrap(),
            DeviceMatch::Id {
                vendor: 0x06cb,
                product: 0x000f
            }
        );
        assert_eq!(
            "phys=isa0060/serio0".parse::<DeviceMatch>().unwrap(),
            DeviceMatch::Phys("isa0060/serio0".to_string())
        );
        assert_eq!(
            "TPPS/2 Elan TrackPoint".parse::<DeviceMatch>().unwrap(),
            DeviceMatch::Name("TPPS/2 Elan TrackPoint".to_string())
        );
        assert!("".parse::<DeviceMatch>().is_err());
        assert_eq!(
            DeviceMatch::Id {
                vendor: 0x6cb,
                product: 0xf
            }
            .to_string(),
            "06cb:000f"
        );
    }

    #[test]
    fn led_and_sync_are_not_activity() {
        assert!(is_activity(&EventCode::EV_KEY(EV_KEY::KEY_A)));
        assert!(!is_activity(&EventCode::EV_SYN(EV_SYN::SYN_REPORT)));
    }
}
