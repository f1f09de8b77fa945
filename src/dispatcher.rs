use std::{
    sync::atomic::{self, AtomicBool},
    time::{Duration, Instant},
};

use anyhow::Result;
use crossbeam::{
    channel::{never, Receiver},
    select,
};
use log::{debug, info, warn};

use crate::{
    capture::InputSource,
    event::Event,
    kbd_brightness::Backlight,
    kbd_controller::{Activity, KeyboardController},
    power::PowerSource,
    screen_brightness::BrightnessSlider,
    screen_controller::ScreenController,
};

/// Longest the loop sleeps before looking at the exit flag again.
const MAX_WAIT: Duration = Duration::from_millis(100);

/// Routes producer events and timer deadlines to the two controllers.
pub(crate) struct Dispatcher<B, I, P, S> {
    keyboard: Option<KeyboardController<B, I, P>>,
    screen: Option<ScreenController<S>>,
}

impl<B, I, P, S> Dispatcher<B, I, P, S>
where
    B: Backlight,
    I: InputSource,
    P: PowerSource,
    S: BrightnessSlider,
{
    pub(crate) fn new(
        keyboard: Option<KeyboardController<B, I, P>>,
        screen: Option<ScreenController<S>>,
    ) -> Self {
        Self { keyboard, screen }
    }

    pub(crate) fn run(&mut self, events: &Receiver<Event>, exit_bool: &AtomicBool) {
        let samples = match &self.screen {
            Some(screen) => screen.samples().clone(),
            None => never(),
        };

        while !exit_bool.load(atomic::Ordering::Relaxed) {
            let wait = self
                .next_deadline()
                .map_or(MAX_WAIT, |deadline| {
                    deadline.saturating_duration_since(Instant::now())
                })
                .min(MAX_WAIT);

            let res = select! {
                recv(events) -> event => match event {
                    Ok(event) => self.handle(event, Instant::now()),
                    Err(_) => {
                        warn!("All event producers are gone");
                        return;
                    }
                },
                recv(samples) -> sample => match sample {
                    Ok(sample) => self.complete_sample(sample),
                    Err(_) => {
                        warn!("Ambient light worker is gone");
                        return;
                    }
                },
                default(wait) => Ok(()),
            };
            if let Err(e) = res {
                warn!("{:?}", e);
            }

            if let Err(e) = self.poll_timers(Instant::now()) {
                warn!("{:?}", e);
            }
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let kbd = self.keyboard.as_ref().and_then(|k| k.next_deadline());
        let screen = self.screen.as_ref().and_then(|s| s.next_deadline());
        match (kbd, screen) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn handle(&mut self, event: Event, now: Instant) -> Result<()> {
        debug!("Dispatch: {:?}", event);
        match event {
            Event::Retrigger => {
                if let Some(screen) = &mut self.screen {
                    screen.on_hotkey();
                }
                return Ok(());
            }
            Event::Activity | Event::BacklightChanged(_) | Event::Power(_) => {}
        }

        let Some(kbd) = &mut self.keyboard else {
            return Ok(());
        };
        let res = match event {
            Event::Activity => kbd.on_input(now),
            Event::BacklightChanged(state) => kbd.on_backlight_changed(state, now),
            Event::Power(signal) => kbd.on_power(signal, now),
            Event::Retrigger => Ok(()),
        };
        debug!("Keyboard: {:?}", kbd.state());
        self.follow_keyboard();
        res
    }

    pub(crate) fn poll_timers(&mut self, now: Instant) -> Result<()> {
        if let Some(screen) = &mut self.screen {
            screen.poll_timer(now);
        }
        let res = match &mut self.keyboard {
            Some(kbd) => kbd.poll_timer(now),
            None => Ok(()),
        };
        self.follow_keyboard();
        res
    }

    pub(crate) fn complete_sample(&mut self, sample: Result<f64>) -> Result<()> {
        if let Some(screen) = &mut self.screen {
            screen.complete(sample)?;
            for change in screen.take_changes() {
                debug!(
                    "Brightness changed: intensity {:.3}, brightness {:.2}",
                    change.intensity, change.brightness
                );
            }
        }
        Ok(())
    }

    /// The user coming back refreshes the screen brightness too.
    fn follow_keyboard(&mut self) {
        let Some(kbd) = &mut self.keyboard else {
            return;
        };
        for activity in kbd.take_activity() {
            match activity {
                Activity::UserActivity | Activity::PowerResume => {
                    if let Some(screen) = self.screen.as_mut().filter(|s| s.is_enabled()) {
                        screen.retrigger();
                    }
                }
                Activity::OnLevelChanged => info!("Keyboard on level is now {}", kbd.on_level()),
                Activity::UserInactivity | Activity::PowerPause => {}
            }
        }
    }

    pub(crate) fn shutdown(&mut self) -> Result<()> {
        if let Some(screen) = &mut self.screen {
            screen.disable();
        }
        if let Some(kbd) = &mut self.keyboard {
            kbd.disable()?;
        }
        Ok(())
    }
}
