//! Hardware doubles shared by the controller tests.

use std::{
    cell::RefCell,
    rc::Rc,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail, Result};

use crate::{
    ambient_brightness::AmbientLight, capture::InputSource, error::Error,
    kbd_brightness::Backlight, power::PowerSource, screen_brightness::BrightnessSlider,
};

#[derive(Debug, Default)]
pub(crate) struct BacklightLog {
    pub writes: Vec<u32>,
    pub watching: bool,
    pub watch_calls: usize,
    pub fail_writes: bool,
}

pub(crate) struct MockBacklight {
    pub log: Rc<RefCell<BacklightLog>>,
    pub limit: u32,
}

impl MockBacklight {
    pub(crate) fn new(limit: u32) -> (Self, Rc<RefCell<BacklightLog>>) {
        let log = Rc::new(RefCell::new(BacklightLog::default()));
        (
            Self {
                log: log.clone(),
                limit,
            },
            log,
        )
    }
}

impl Backlight for MockBacklight {
    fn read(&mut self) -> Result<u32> {
        Ok(self.log.borrow().writes.last().copied().unwrap_or(0))
    }

    fn write(&mut self, state: u32) -> Result<()> {
        let mut log = self.log.borrow_mut();
        if log.fail_writes {
            bail!(Error::HardwareUnavailable("mock backlight".into()));
        }
        log.writes.push(state.min(self.limit));
        Ok(())
    }

    fn limit(&self) -> u32 {
        self.limit
    }

    fn watch(&mut self) -> Result<()> {
        let mut log = self.log.borrow_mut();
        if !log.watching {
            log.watching = true;
            log.watch_calls += 1;
        }
        Ok(())
    }

    fn unwatch(&mut self) {
        self.log.borrow_mut().watching = false;
    }
}

#[derive(Debug, Default)]
pub(crate) struct Subscription {
    pub active: bool,
    pub subscribes: usize,
}

pub(crate) struct MockSource(pub Rc<RefCell<Subscription>>);

impl MockSource {
    pub(crate) fn new() -> (Self, Rc<RefCell<Subscription>>) {
        let sub = Rc::new(RefCell::new(Subscription::default()));
        (Self(sub.clone()), sub)
    }

    fn record_subscribe(&mut self) {
        let mut sub = self.0.borrow_mut();
        sub.active = true;
        sub.subscribes += 1;
    }

    fn record_unsubscribe(&mut self) {
        self.0.borrow_mut().active = false;
    }
}

impl InputSource for MockSource {
    fn subscribe(&mut self) -> Result<()> {
        self.record_subscribe();
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.record_unsubscribe();
    }
}

impl PowerSource for MockSource {
    fn subscribe(&mut self) -> Result<()> {
        self.record_subscribe();
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.record_unsubscribe();
    }
}

#[derive(Debug, Default)]
pub(crate) struct SliderLog {
    pub writes: Vec<u8>,
    /// Value reported on read back instead of the last write.
    pub read_back: Option<u8>,
}

pub(crate) struct MockSlider(pub Rc<RefCell<SliderLog>>);

impl MockSlider {
    pub(crate) fn new() -> (Self, Rc<RefCell<SliderLog>>) {
        let log = Rc::new(RefCell::new(SliderLog::default()));
        (Self(log.clone()), log)
    }
}

impl BrightnessSlider for MockSlider {
    fn set_percent(&mut self, pct: u8) -> Result<()> {
        self.0.borrow_mut().writes.push(pct);
        Ok(())
    }

    fn get_percent(&mut self) -> Result<u8> {
        let log = self.0.borrow();
        log.read_back
            .or_else(|| log.writes.last().copied())
            .ok_or_else(|| anyhow!("nothing written"))
    }
}

/// Light source replaying queued readings; an empty queue fails the sample.
pub(crate) struct MockLight(pub Arc<Mutex<Vec<Result<f64>>>>);

impl MockLight {
    pub(crate) fn new(readings: Vec<Result<f64>>) -> (Self, Arc<Mutex<Vec<Result<f64>>>>) {
        let queue = Arc::new(Mutex::new(readings));
        (Self(queue.clone()), queue)
    }
}

impl AmbientLight for MockLight {
    fn sample(&mut self) -> Result<f64> {
        let mut queue = self.0.lock().map_err(|_| anyhow!("poisoned"))?;
        if queue.is_empty() {
            bail!(Error::SampleFailed("camera busy".into()));
        }
        queue.remove(0)
    }
}
