//! Folds display, lid and sleep notifications into one pause/resume pair.

use std::{
    sync::{
        atomic::{self, AtomicBool},
        Arc,
    },
    thread,
};

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::Sender;
use log::{debug, error, info};
use logind_zbus::manager::ManagerProxyBlocking;
use zbus::blocking::Connection;

use crate::event::Event;

/// One notification from any of the four power channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PowerSignal {
    /// Display state, true when on.
    Display(bool),
    /// Lid state, true when open.
    Lid(bool),
    Suspend,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PowerChannel {
    Display,
    Lid,
    Sleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PowerTransition {
    Pause,
    Resume,
}

impl PowerSignal {
    fn channel(&self) -> PowerChannel {
        match self {
            PowerSignal::Display(_) => PowerChannel::Display,
            PowerSignal::Lid(_) => PowerChannel::Lid,
            PowerSignal::Suspend | PowerSignal::Resume => PowerChannel::Sleep,
        }
    }

    fn is_pause(&self) -> bool {
        matches!(
            self,
            PowerSignal::Display(false) | PowerSignal::Lid(false) | PowerSignal::Suspend
        )
    }
}

pub(crate) trait PowerSource {
    fn subscribe(&mut self) -> Result<()>;
    fn unsubscribe(&mut self);
}

/// Single flight pause tracking: the first channel to pause owns the pause
/// and only that channel can resume.
pub(crate) struct PowerTracker<S> {
    source: S,
    enabled: bool,
    paused_by: Option<PowerChannel>,
}

impl<S: PowerSource> PowerTracker<S> {
    pub(crate) fn new(source: S) -> Self {
        Self {
            source,
            enabled: false,
            paused_by: None,
        }
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        if !self.enabled {
            self.source.subscribe()?;
            self.enabled = true;
        }
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        if self.enabled {
            self.source.unsubscribe();
            self.enabled = false;
        }
    }

    pub(crate) fn paused_by(&self) -> Option<PowerChannel> {
        self.paused_by
    }

    pub(crate) fn handle(&mut self, signal: PowerSignal) -> Option<PowerTransition> {
        if !self.enabled {
            return None;
        }

        let channel = signal.channel();
        match (self.paused_by, signal.is_pause()) {
            (None, true) => {
                debug!("Power pause by {:?}", channel);
                self.paused_by = Some(channel);
                Some(PowerTransition::Pause)
            }
            (Some(owner), false) if owner == channel => {
                debug!("Power resume by {:?}", channel);
                self.paused_by = None;
                Some(PowerTransition::Resume)
            }
            _ => {
                debug!("Power signal {:?} ignored, paused by {:?}", signal, self.paused_by);
                None
            }
        }
    }
}

/// logind `PrepareForSleep` and `LidClosed`, posted as `Event::Power`.
///
/// Display on/off arrives through the control socket instead.
pub(crate) struct LogindPowerSource {
    gate: Arc<AtomicBool>,
}

impl LogindPowerSource {
    pub(crate) fn spawn(connection: &Connection, sender: Sender<Event>) -> Result<Self> {
        let gate = Arc::new(AtomicBool::new(false));

        let manager = ManagerProxyBlocking::new(connection)?;
        let sleep = manager
            .receive_prepare_for_sleep()
            .context("subscribing to PrepareForSleep")?;
        let lid = manager.receive_lid_closed_changed();

        {
            let gate = gate.clone();
            let sender = sender.clone();
            thread::Builder::new()
                .name("logind sleep".into())
                .spawn(move || {
                    let res = sleep.into_iter().try_for_each(|signal| {
                        let start = *signal.args()?.start();
                        let signal = if start {
                            PowerSignal::Suspend
                        } else {
                            PowerSignal::Resume
                        };
                        forward(&gate, &sender, signal)
                    });
                    if let Err(e) = res {
                        error!("logind sleep listener stopped: {:?}", e);
                    }
                })?;
        }

        {
            let gate = gate.clone();
            thread::Builder::new()
                .name("logind lid".into())
                .spawn(move || {
                    let res = lid.into_iter().try_for_each(|changed| {
                        let closed = changed.get()?;
                        forward(&gate, &sender, PowerSignal::Lid(!closed))
                    });
                    if let Err(e) = res {
                        error!("logind lid listener stopped: {:?}", e);
                    }
                })?;
        }

        info!("Listening for logind sleep and lid notifications");
        Ok(Self { gate })
    }
}

fn forward(gate: &AtomicBool, sender: &Sender<Event>, signal: PowerSignal) -> Result<()> {
    if gate.load(atomic::Ordering::Acquire) {
        sender
            .send(Event::Power(signal))
            .map_err(|_| anyhow!("dispatcher gone"))?;
    }
    Ok(())
}

impl PowerSource for LogindPowerSource {
    fn subscribe(&mut self) -> Result<()> {
        self.gate.store(true, atomic::Ordering::Release);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.gate.store(false, atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSource;

    impl PowerSource for NullSource {
        fn subscribe(&mut self) -> Result<()> {
            Ok(())
        }

        fn unsubscribe(&mut self) {}
    }

    fn tracker() -> PowerTracker<NullSource> {
        let mut tracker = PowerTracker::new(NullSource);
        tracker.start().unwrap();
        tracker
    }

    #[test]
    fn lid_then_display_pauses_once() {
        let mut tracker = tracker();
        assert_eq!(
            tracker.handle(PowerSignal::Lid(false)),
            Some(PowerTransition::Pause)
        );
        assert_eq!(tracker.handle(PowerSignal::Display(false)), None);
        assert_eq!(
            tracker.handle(PowerSignal::Lid(true)),
            Some(PowerTransition::Resume)
        );
        assert_eq!(tracker.handle(PowerSignal::Display(true)), None);
        assert_eq!(tracker.paused_by(), None);
    }

    #[test]
    fn only_owner_resumes() {
        let mut tracker = tracker();
        assert_eq!(
            tracker.handle(PowerSignal::Suspend),
            Some(PowerTransition::Pause)
        );
        assert_eq!(tracker.handle(PowerSignal::Lid(true)), None);
        assert_eq!(tracker.handle(PowerSignal::Display(true)), None);
        assert_eq!(tracker.paused_by(), Some(PowerChannel::Sleep));
        assert_eq!(
            tracker.handle(PowerSignal::Resume),
            Some(PowerTransition::Resume)
        );
    }

    #[test]
    fn resume_without_pause_is_ignored() {
        let mut tracker = tracker();
        assert_eq!(tracker.handle(PowerSignal::Resume), None);
        assert_eq!(tracker.handle(PowerSignal::Display(true)), None);
    }

    #[test]
    fn stopped_tracker_ignores_everything() {
        let mut tracker = PowerTracker::new(NullSource);
        assert_eq!(tracker.handle(PowerSignal::Suspend), None);
        tracker.start().unwrap();
        tracker.stop();
        assert_eq!(tracker.handle(PowerSignal::Lid(false)), None);
    }
}
