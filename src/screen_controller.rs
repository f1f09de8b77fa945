use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam::channel::Receiver;
use log::{debug, info, warn};

use crate::{
    ambient_brightness::Sampler,
    curve::{self, CalibrationPoints, Point, SmoothedCurve},
    error::Error,
    screen_brightness::BrightnessSlider,
    timer::Timer,
};

const MAX_POLL_PERIOD: f64 = i32::MAX as f64 / 1000.0;

/// Outcome of one sample-and-apply cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BrightnessChanged {
    pub intensity: f64,
    /// Brightness the screen reports after the write, 0 to 1.
    pub brightness: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retrigger {
    Requested,
    /// A sample is already in flight.
    Busy,
}

/// Samples ambient light on a timer or on demand and sets the screen
/// brightness through the calibration curve.
pub(crate) struct ScreenController<S> {
    slider: S,
    sampler: Sampler,
    timer: Timer,
    enabled: bool,
    poll_period: f64,
    hot_key_enabled: bool,
    curvature: f64,
    learned: CalibrationPoints,
    /// Last curve that passed validation.
    smoothed: SmoothedCurve,
    curve_valid: bool,
    changes: Vec<BrightnessChanged>,
}

impl<S: BrightnessSlider> ScreenController<S> {
    pub(crate) fn new(slider: S, sampler: Sampler) -> Self {
        Self {
            slider,
            sampler,
            timer: Timer::new(Duration::from_secs_f64(MAX_POLL_PERIOD)),
            enabled: false,
            poll_period: f64::INFINITY,
            hot_key_enabled: false,
            curvature: 0.5,
            learned: CalibrationPoints::default(),
            smoothed: SmoothedCurve::default(),
            curve_valid: true,
            changes: Vec::new(),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn poll_period(&self) -> f64 {
        self.poll_period
    }

    pub(crate) fn curvature(&self) -> f64 {
        self.curvature
    }

    pub(crate) fn learned_points(&self) -> &CalibrationPoints {
        &self.learned
    }

    pub(crate) fn smoothed_curve(&self) -> &SmoothedCurve {
        &self.smoothed
    }

    pub(crate) fn is_curve_valid(&self) -> bool {
        self.curve_valid
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub(crate) fn samples(&self) -> &Receiver<Result<f64>> {
        self.sampler.results()
    }

    pub(crate) fn take_changes(&mut self) -> Vec<BrightnessChanged> {
        std::mem::take(&mut self.changes)
    }

    pub(crate) fn set_poll_period(&mut self, seconds: f64, now: Instant) {
        if seconds != self.poll_period {
            self.poll_period = seconds;
            let clamped = if seconds.is_nan() {
                MAX_POLL_PERIOD
            } else {
                seconds.clamp(1.0, MAX_POLL_PERIOD)
            };
            self.timer.set_interval(Duration::from_secs_f64(clamped), now);
        }
    }

    pub(crate) fn set_hot_key_enabled(&mut self, enabled: bool) {
        self.hot_key_enabled = enabled;
    }

    /// Replaces the calibration points and regenerates the curve before
    /// returning. A folding curve is reported as `CurveInvalid` and the
    /// previous valid curve stays in use.
    pub(crate) fn set_learned_points(&mut self, points: impl IntoIterator<Item = Point>) -> Result<()> {
        self.learned = CalibrationPoints::new(points);
        self.regenerate()
    }

    /// Clamped to `[0, 1]`; regenerates the curve like `set_learned_points`.
    pub(crate) fn set_curvature(&mut self, curvature: f64) -> Result<()> {
        let curvature = if curvature.is_nan() {
            0.5
        } else {
            curvature.clamp(0.0, 1.0)
        };
        if curvature != self.curvature {
            self.curvature = curvature;
            return self.regenerate();
        }
        Ok(())
    }

    fn regenerate(&mut self) -> Result<()> {
        let curve = curve::smooth(self.learned.as_slice(), self.curvature);
        self.curve_valid = curve.valid;
        if !curve.valid {
            warn!(
                "Calibration curve from {} points with curvature {} is not a function, keeping the previous one",
                self.learned.len(),
                self.curvature
            );
            return Err(anyhow!(Error::CurveInvalid));
        }
        debug!(
            "Calibration curve: {} points -> {} samples",
            self.learned.len(),
            curve.points.len()
        );
        self.smoothed = curve;
        Ok(())
    }

    pub(crate) fn enable(&mut self, now: Instant) {
        if !self.enabled {
            self.enabled = true;
            self.start(true, now);
        }
    }

    pub(crate) fn disable(&mut self) {
        if self.enabled {
            self.enabled = false;
            self.stop();
        }
    }

    pub(crate) fn start(&mut self, trigger_now: bool, now: Instant) {
        self.timer.start(now);
        if trigger_now {
            self.retrigger();
        }
    }

    pub(crate) fn stop(&mut self) {
        self.timer.stop();
    }

    pub(crate) fn retrigger(&mut self) -> Retrigger {
        if !self.sampler.is_busy() && self.sampler.request() {
            debug!("Screen: sampling ambient light");
            Retrigger::Requested
        } else {
            debug!("Screen: sample already in flight");
            Retrigger::Busy
        }
    }

    pub(crate) fn on_hotkey(&mut self) -> Option<Retrigger> {
        if self.enabled && self.hot_key_enabled {
            Some(self.retrigger())
        } else {
            debug!("Screen: hotkey ignored");
            None
        }
    }

    pub(crate) fn poll_timer(&mut self, now: Instant) {
        if self.timer.fire(now) {
            if self.enabled {
                self.retrigger();
            } else {
                self.timer.stop();
            }
        }
    }

    /// Applies a finished sample: interpolate, write, read back.
    ///
    /// Nothing happens when the sample failed or the controller was disabled
    /// while it was in flight.
    pub(crate) fn complete(&mut self, sample: Result<f64>) -> Result<Option<BrightnessChanged>> {
        self.sampler.complete();
        if !self.enabled {
            debug!("Screen: disabled, dropping sample");
            return Ok(None);
        }
        let intensity = match sample {
            Ok(intensity) if !intensity.is_nan() => intensity,
            Ok(_) => {
                debug!("Screen: no reading this cycle");
                return Ok(None);
            }
            Err(e) => {
                match Error::of(&e) {
                    Some(Error::SampleFailed(_)) => debug!("Screen: {:#}", e),
                    _ => warn!("Screen: sampling failed: {:?}", e),
                }
                return Ok(None);
            }
        };
        self.apply(intensity).map(Some)
    }

    fn apply(&mut self, intensity: f64) -> Result<BrightnessChanged> {
        let target = self.smoothed.interpolate(intensity);
        if target.is_finite() {
            let pct = (target.clamp(0.0, 1.0) * 100.0).round() as u8;
            self.slider.set_percent(pct)?;
        }
        // the panel may round or clamp differently from what was written
        let brightness = self.slider.get_percent()? as f64 / 100.0;

        info!(
            "Screen: intensity {:.3} -> target {:.3}, actual {:.2}",
            intensity, target, brightness
        );
        let change = BrightnessChanged {
            intensity,
            brightness,
        };
        self.changes.push(change);
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::testing::{MockLight, MockSlider, SliderLog};

    fn controller(readings: Vec<Result<f64>>) -> (ScreenController<MockSlider>, Rc<RefCell<SliderLog>>) {
        let (light, _) = MockLight::new(readings);
        let sampler = Sampler::spawn(move || Ok(light)).unwrap();
        let (slider, log) = MockSlider::new();
        let mut screen = ScreenController::new(slider, sampler);
        screen
            .set_learned_points([Point::new(0.0, 0.0), Point::new(1.0, 1.0)])
            .unwrap();
        (screen, log)
    }

    fn finish(screen: &mut ScreenController<MockSlider>) -> Option<BrightnessChanged> {
        let sample = screen
            .samples()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        screen.complete(sample).unwrap()
    }

    #[test]
    fn retrigger_writes_and_reports_read_back() {
        let (mut screen, log) = controller(vec![Ok(0.5)]);
        log.borrow_mut().read_back = Some(48);
        screen.enable(Instant::now());

        let change = finish(&mut screen).unwrap();
        assert_eq!(log.borrow().writes, vec![50]);
        assert_eq!(change.intensity, 0.5);
        assert_eq!(change.brightness, 0.48);
        assert_eq!(screen.take_changes(), vec![change]);
    }

    #[test]
    fn second_retrigger_while_sampling_is_refused() {
        let (mut screen, _) = controller(vec![Ok(0.2), Ok(0.3)]);
        screen.enable(Instant::now());
        assert_eq!(screen.retrigger(), Retrigger::Busy);

        finish(&mut screen);
        assert_eq!(screen.retrigger(), Retrigger::Requested);
    }

    #[test]
    fn failed_sample_keeps_brightness() {
        let (mut screen, log) = controller(vec![]);
        screen.enable(Instant::now());

        assert_eq!(finish(&mut screen), None);
        assert!(log.borrow().writes.is_empty());
        assert!(screen.take_changes().is_empty());
    }

    #[test]
    fn sample_finishing_after_disable_is_dropped() {
        let (mut screen, log) = controller(vec![Ok(0.9)]);
        screen.enable(Instant::now());
        screen.disable();

        assert_eq!(finish(&mut screen), None);
        assert!(log.borrow().writes.is_empty());
    }

    #[test]
    fn invalid_curve_keeps_previous_one() {
        let (mut screen, log) = controller(vec![Ok(0.25)]);
        let err = screen
            .set_learned_points([
                Point::new(0.0, 0.0),
                Point::new(0.5, 1.0),
                Point::new(0.51, 0.0),
                Point::new(1.0, 1.0),
            ])
            .unwrap_err();
        assert!(matches!(Error::of(&err), Some(Error::CurveInvalid)));
        assert!(!screen.is_curve_valid());
        assert_eq!(screen.learned_points().len(), 4);
        assert_eq!(screen.smoothed_curve().points.len(), 2);

        screen.enable(Instant::now());
        finish(&mut screen);
        assert_eq!(log.borrow().writes, vec![25]);
    }

    #[test]
    fn curvature_change_regenerates_curve() {
        let (mut screen, _) = controller(vec![]);
        screen
            .set_learned_points([
                Point::new(0.0, 0.1),
                Point::new(0.1, 0.65),
                Point::new(0.35, 0.95),
                Point::new(1.0, 1.0),
            ])
            .unwrap();
        let before = screen.smoothed_curve().clone();
        screen.set_curvature(0.2).unwrap();
        assert_eq!(screen.curvature(), 0.2);
        assert_ne!(screen.smoothed_curve(), &before);

        screen.set_curvature(3.0).unwrap();
        assert_eq!(screen.curvature(), 1.0);
    }

    #[test]
    fn empty_curve_reads_back_without_writing() {
        let (light, _) = MockLight::new(vec![Ok(0.4)]);
        let sampler = Sampler::spawn(move || Ok(light)).unwrap();
        let (slider, log) = MockSlider::new();
        log.borrow_mut().read_back = Some(70);
        let mut screen = ScreenController::new(slider, sampler);
        screen.enable(Instant::now());

        let change = finish(&mut screen).unwrap();
        assert!(log.borrow().writes.is_empty());
        assert_eq!(change.brightness, 0.7);
    }

    #[test]
    fn hotkey_only_when_enabled() {
        let (mut screen, _) = controller(vec![Ok(0.1), Ok(0.1)]);
        screen.set_hot_key_enabled(true);
        assert_eq!(screen.on_hotkey(), None);

        screen.enable(Instant::now());
        finish(&mut screen);
        assert_eq!(screen.on_hotkey(), Some(Retrigger::Requested));
        finish(&mut screen);

        screen.set_hot_key_enabled(false);
        assert_eq!(screen.on_hotkey(), None);
    }

    #[test]
    fn poll_period_is_clamped_and_drives_sampling() {
        let (mut screen, _) = controller(vec![Ok(0.1), Ok(0.2)]);
        let t0 = Instant::now();
        screen.set_poll_period(0.2, t0);
        assert_eq!(screen.poll_period(), 0.2);
        screen.enable(t0);
        assert_eq!(screen.next_deadline(), Some(t0 + Duration::from_secs(1)));
        finish(&mut screen);

        screen.poll_timer(t0 + Duration::from_secs(1));
        assert!(finish(&mut screen).is_some());

        screen.disable();
        assert_eq!(screen.next_deadline(), None);
    }
}
