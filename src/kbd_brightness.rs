use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    sync::{
        atomic::{self, AtomicBool, AtomicU32},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::Sender;
use log::{debug, error, info, trace, warn};
use logind_zbus::session::SessionProxyBlocking;
use mio::{unix::SourceFd, Events, Interest, Poll, Token};

use crate::{error::Error, event::Event, read_value};

pub(crate) trait Backlight {
    /// Current level, clamped to the limit.
    fn read(&mut self) -> Result<u32>;
    fn write(&mut self, state: u32) -> Result<()>;
    fn limit(&self) -> u32;
    /// Starts reporting external changes as `Event::BacklightChanged`.
    fn watch(&mut self) -> Result<()>;
    fn unwatch(&mut self);
}

pub(crate) struct KBDBrightness<'a> {
    proxy: &'a SessionProxyBlocking<'a>,
    name: &'a str,
    dir: PathBuf,
    limit: u32,
    sender: Sender<Event>,
    /// Last level sent to logind, shared with the watcher.
    written: Arc<AtomicU32>,
    watcher: Option<Watcher>,
}

impl<'a> KBDBrightness<'a> {
    const SUBSYSTEM: &'static str = "leds";

    pub(crate) fn new(
        proxy: &'a SessionProxyBlocking<'a>,
        name: &'a str,
        sender: Sender<Event>,
    ) -> Result<Self> {
        let dir = Path::new("/sys/class").join(Self::SUBSYSTEM).join(name);
        let limit = read_value(dir.join("max_brightness"))
            .context(Error::HardwareUnavailable(format!("keyboard backlight {}", name)))?;
        let state = read_value(dir.join("brightness"))
            .context(Error::HardwareUnavailable(format!("keyboard backlight {}", name)))?;
        debug!("KBD {}: state:{} limit:{}", name, state, limit);

        Ok(Self {
            proxy,
            name,
            dir,
            limit,
            sender,
            written: Arc::new(AtomicU32::new(NOTHING_WRITTEN)),
            watcher: None,
        })
    }
}

impl<'a> Backlight for KBDBrightness<'a> {
    fn read(&mut self) -> Result<u32> {
        let state = read_value(self.dir.join("brightness"))?;
        Ok(state.min(self.limit))
    }

    fn write(&mut self, state: u32) -> Result<()> {
        let state = state.min(self.limit);
        info!("Setting KBD Backlight {}: {}", self.name, state);
        self.written.store(state, atomic::Ordering::Release);
        self.proxy
            .set_brightness(Self::SUBSYSTEM, self.name, state)
            .context(Error::HardwareUnavailable(format!("keyboard backlight {}", self.name)))?;
        Ok(())
    }

    fn limit(&self) -> u32 {
        self.limit
    }

    fn watch(&mut self) -> Result<()> {
        if self.watcher.is_none() {
            let initial = self.read()?;
            self.watcher = Some(Watcher::spawn(
                self.dir.clone(),
                self.limit,
                initial,
                self.written.clone(),
                self.sender.clone(),
            ));
        }
        Ok(())
    }

    fn unwatch(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}

impl<'a> Drop for KBDBrightness<'a> {
    fn drop(&mut self) {
        self.unwatch();
    }
}

/// Background thread waiting for the driver to report a hardware change.
struct Watcher {
    exit: Arc<AtomicBool>,
    handle: JoinHandle<Result<()>>,
}

impl Watcher {
    fn spawn(
        dir: PathBuf,
        limit: u32,
        initial: u32,
        written: Arc<AtomicU32>,
        sender: Sender<Event>,
    ) -> Self {
        let exit = Arc::new(AtomicBool::new(false));
        let exit_bool = exit.clone();
        let handle = thread::spawn(move || {
            watch_loop(&dir, limit, initial, &written, &sender, &exit_bool)
        });
        Self { exit, handle }
    }

    fn stop(self) {
        self.exit.store(true, atomic::Ordering::Relaxed);
        match self.handle.join() {
            Ok(Ok(())) => debug!("KBD watcher stopped"),
            Ok(Err(e)) => error!("KBD watcher failed: {:?}", e),
            Err(_) => error!("KBD watcher panicked"),
        }
    }
}

const NOTHING_WRITTEN: u32 = u32::MAX;
const ENODATA: i32 = 61;

fn read_attr(file: &mut File) -> Result<Option<u32>> {
    file.seek(SeekFrom::Start(0))?;
    let mut val = String::new();
    match file.read_to_string(&mut val) {
        Ok(_) => Ok(Some(val.trim().parse()?)),
        // brightness_hw_changed has no data until the first hardware change
        Err(e) if e.raw_os_error() == Some(ENODATA) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn watch_loop(
    dir: &Path,
    limit: u32,
    initial: u32,
    written: &AtomicU32,
    sender: &Sender<Event>,
    exit: &AtomicBool,
) -> Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(4);

    // sysfs signals brightness_hw_changed with POLLPRI once it has been read.
    let mut hw_changed = match File::open(dir.join("brightness_hw_changed")) {
        Ok(mut file) => {
            read_attr(&mut file)?;
            poll.registry().register(
                &mut SourceFd(&file.as_raw_fd()),
                Token(0),
                Interest::PRIORITY,
            )?;
            Some(file)
        }
        Err(e) => {
            warn!(
                "No brightness_hw_changed in {:?} ({}), polling brightness",
                dir, e
            );
            None
        }
    };

    let mut last = initial;
    loop {
        if exit.load(atomic::Ordering::Relaxed) {
            break;
        }

        match poll.poll(&mut events, Some(Duration::from_millis(100))) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            res => res?,
        }

        let raw = match hw_changed.as_mut() {
            Some(file) => {
                if events.is_empty() {
                    continue;
                }
                match read_attr(file)? {
                    Some(raw) => raw,
                    None => continue,
                }
            }
            None => {
                let raw = read_value(dir.join("brightness"))?;
                if raw == last {
                    continue;
                }
                // our own logind write showing up in sysfs
                if raw == written.load(atomic::Ordering::Acquire) {
                    trace!("KBD echo of own write: {}", raw);
                    last = raw;
                    continue;
                }
                raw
            }
        };

        trace!("KBD hardware change: {} -> {}", last, raw);
        last = raw;
        sender
            .send(Event::BacklightChanged(raw.min(limit)))
            .map_err(|_| anyhow!("dispatcher gone"))?;
    }

    Ok(())
}
