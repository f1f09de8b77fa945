use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use log::{debug, info, trace};

use crate::{
    capture::{Capture, InputSource},
    kbd_brightness::Backlight,
    power::{PowerSignal, PowerSource, PowerTracker, PowerTransition},
    timer::Timer,
};

/// Notable things the controller did, in the order they happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activity {
    OnLevelChanged,
    UserActivity,
    UserInactivity,
    PowerPause,
    PowerResume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KbdState {
    Disabled,
    /// Light off, timer stopped.
    Idle,
    /// Light on, idle time accumulating.
    Lit,
}

/// A fifth of the timeout, kept within half a second and five seconds.
pub(crate) fn tick_interval(inactivity_timeout: f64) -> Duration {
    Duration::from_secs_f64((inactivity_timeout / 5.0).clamp(0.5, 5.0))
}

/// Lights the keyboard on input from the built-in devices and turns it off
/// after a period of inactivity, following suspend, lid and display changes.
pub(crate) struct KeyboardController<B, I, P> {
    backlight: B,
    capture: Capture<I>,
    tracker: PowerTracker<P>,
    timer: Timer,
    enabled: bool,
    /// Whether external backlight changes are adopted.
    listening: bool,
    on_level: u32,
    /// Last level written to the hardware, 0 or `on_level` when quiescent.
    should_be: u32,
    accum: f64,
    inactivity_timeout: f64,
    activity: Vec<Activity>,
}

impl<B, I, P> KeyboardController<B, I, P>
where
    B: Backlight,
    I: InputSource,
    P: PowerSource,
{
    pub(crate) fn new(backlight: B, input: I, power: P) -> Self {
        let on_level = 2.min(backlight.limit());
        Self {
            backlight,
            capture: Capture::new(input),
            tracker: PowerTracker::new(power),
            timer: Timer::new(tick_interval(f64::INFINITY)),
            enabled: false,
            listening: false,
            on_level,
            should_be: 0,
            accum: 0.0,
            inactivity_timeout: f64::INFINITY,
            activity: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> KbdState {
        match (self.enabled, self.timer.is_running()) {
            (false, _) => KbdState::Disabled,
            (true, false) => KbdState::Idle,
            (true, true) => KbdState::Lit,
        }
    }

    pub(crate) fn on_level(&self) -> u32 {
        self.on_level
    }

    pub(crate) fn inactivity_timeout(&self) -> f64 {
        self.inactivity_timeout
    }

    pub(crate) fn idle_seconds(&self) -> f64 {
        self.accum
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub(crate) fn take_activity(&mut self) -> Vec<Activity> {
        std::mem::take(&mut self.activity)
    }

    pub(crate) fn enable(&mut self) -> Result<()> {
        if self.enabled {
            return Ok(());
        }
        self.enabled = true;
        self.should_be = 0;
        self.backlight.write(self.should_be)?;

        self.tracker.start()?;
        self.capture.start()?;
        self.backlight.watch()?;
        self.listening = true;
        debug!("KBD enable: on_level={}", self.on_level);
        Ok(())
    }

    pub(crate) fn disable(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.enabled = false;
        self.listening = false;
        self.backlight.unwatch();
        self.capture.stop();
        self.tracker.stop();
        self.timer.stop();

        self.should_be = 0;
        self.backlight.write(self.should_be)?;
        debug!("KBD disable: on_level={}", self.on_level);
        Ok(())
    }

    /// Clamped to the hardware limit; a change is enforced right away while
    /// enabled.
    pub(crate) fn set_on_level(&mut self, level: u32, now: Instant) -> Result<()> {
        let level = level.min(self.backlight.limit());
        if level != self.on_level {
            self.on_level = level;
            if self.enabled {
                self.enforce_on_level(now)?;
            }
        }
        Ok(())
    }

    /// Rescales the tick interval; idle time already counted is kept.
    pub(crate) fn set_inactivity_timeout(&mut self, seconds: f64, now: Instant) -> Result<()> {
        if seconds.is_nan() || seconds <= 0.0 {
            bail!("inactivity timeout must be positive, got {}", seconds);
        }
        if seconds != self.inactivity_timeout {
            self.inactivity_timeout = seconds;
            self.timer.set_interval(tick_interval(seconds), now);
            debug!(
                "KBD timeout {}s, tick {:?}",
                seconds,
                self.timer.interval()
            );
        }
        Ok(())
    }

    pub(crate) fn on_input(&mut self, now: Instant) -> Result<()> {
        if !self.capture.deliver() {
            return Ok(());
        }
        if !self.enabled {
            self.capture.stop();
            return Ok(());
        }
        self.lights_on(now)
    }

    pub(crate) fn poll_timer(&mut self, now: Instant) -> Result<()> {
        if self.timer.fire(now) {
            self.tick()?;
        }
        Ok(())
    }

    pub(crate) fn tick(&mut self) -> Result<()> {
        if !self.enabled {
            self.timer.stop();
            return Ok(());
        }

        // another round of input capture
        self.capture.start()?;

        self.accum += self.timer.interval().as_secs_f64();
        trace!(
            "KBD tick: idle {:.1}s, capturing {}",
            self.idle_seconds(),
            self.capture.is_started()
        );
        if self.accum >= self.inactivity_timeout {
            self.lights_off()?;
        }
        Ok(())
    }

    /// The level was changed behind our back, typically with the Fn shortcut.
    pub(crate) fn on_backlight_changed(&mut self, state: u32, now: Instant) -> Result<()> {
        if !self.enabled || !self.listening {
            return Ok(());
        }
        if state != self.should_be {
            self.on_level = state.min(self.backlight.limit());
            self.enforce_on_level(now)?;
        }
        Ok(())
    }

    pub(crate) fn on_power(&mut self, signal: PowerSignal, now: Instant) -> Result<()> {
        match self.tracker.handle(signal) {
            Some(PowerTransition::Pause) => {
                self.listening = false;
                self.timer.stop();
                self.lights_off()?;
                debug!(
                    "KBD pause by {:?}: on_level={}",
                    self.tracker.paused_by(),
                    self.on_level
                );
                self.activity.push(Activity::PowerPause);
            }
            Some(PowerTransition::Resume) => {
                self.timer.start(now);
                self.lights_on(now)?;
                self.listening = true;
                debug!("KBD resume: on_level={}", self.on_level);
                self.activity.push(Activity::PowerResume);
            }
            None => {}
        }
        Ok(())
    }

    fn enforce_on_level(&mut self, now: Instant) -> Result<()> {
        if self.on_level > 0 {
            self.lights_on(now)?;
            self.capture.start()?;
        } else {
            self.lights_off()?;
            self.capture.stop();
        }
        info!("KBD on level changed: {}", self.on_level);
        self.activity.push(Activity::OnLevelChanged);
        Ok(())
    }

    fn lights_on(&mut self, now: Instant) -> Result<()> {
        if self.should_be != self.on_level {
            self.should_be = self.on_level;
            self.backlight.write(self.should_be)?;
        }
        if !self.timer.is_running() {
            debug!("KBD lights on: on_level={}", self.on_level);
            self.activity.push(Activity::UserActivity);
        }
        self.accum = 0.0;
        self.timer.start(now);
        Ok(())
    }

    fn lights_off(&mut self) -> Result<()> {
        if self.should_be != 0 {
            self.should_be = 0;
            self.backlight.write(self.should_be)?;
        }
        if self.timer.is_running() {
            debug!("KBD lights off: on_level={}", self.on_level);
            self.activity.push(Activity::UserInactivity);
        }
        self.timer.stop();
        Ok(())
    }
}
