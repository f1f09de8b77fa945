use std::{
    thread::{self, sleep},
    time::Duration,
};

use anyhow::{anyhow, Context as _, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use industrial_io::{Channel, Context};
use log::{debug, error, trace};
use yata::{core::Method, methods::WMA};

use crate::error::Error;

/// Source of ambient light readings, normalised to `[0, 1]`.
pub(crate) trait AmbientLight {
    fn sample(&mut self) -> Result<f64>;
}

/// IIO ambient light sensor averaged over a burst of frames.
pub(crate) struct AmbientBrightness {
    chan: Channel,
    max: f64,
    frames: u8,
    frame_interval: Duration,
}

impl AmbientBrightness {
    pub(crate) fn new(device: &str, frames: u8) -> Result<Self> {
        let ctx = Context::new().context(Error::HardwareUnavailable("iio context".into()))?;

        let max = (2500000f64).log10();
        let dev = ctx.find_device(device).ok_or_else(|| {
            anyhow!(Error::HardwareUnavailable(format!(
                "ambient light sensor {}",
                device
            )))
        })?;
        let chan = dev.get_channel(0)?;

        Ok(Self {
            chan,
            max,
            frames: frames.max(1),
            frame_interval: Duration::from_millis(100),
        })
    }

    fn read(&self) -> Result<f64> {
        let raw = self
            .chan
            .attr_read_int("raw")
            .context(Error::SampleFailed("reading als raw".into()))?;
        Ok((raw.max(1) as f64).log10())
    }
}

impl AmbientLight for AmbientBrightness {
    fn sample(&mut self) -> Result<f64> {
        let initial = self.read()?.min(self.max);
        let mut wma = WMA::new(self.frames, &initial)?;
        let mut val = initial;
        for _ in 1..self.frames {
            sleep(self.frame_interval);
            let frame = self.read()?.min(self.max);
            trace!("Frame: {}", frame);
            val = wma.next(&frame);
        }

        let intensity = (val / self.max).clamp(0.0, 1.0);
        debug!(
            "Ambient - val:{:.4}, max:{:.4}, intensity:{:.4}",
            val, self.max, intensity
        );
        Ok(intensity)
    }
}

/// Worker thread owning the light source. One sample at a time: a request
/// while another is in flight is refused.
pub(crate) struct Sampler {
    requests: Sender<()>,
    results: Receiver<Result<f64>>,
    in_flight: bool,
}

impl Sampler {
    pub(crate) fn spawn<L, F>(open: F) -> Result<Self>
    where
        L: AmbientLight,
        F: FnOnce() -> Result<L> + Send + 'static,
    {
        let (requests, request_receiver) = bounded::<()>(1);
        let (result_sender, results) = bounded(1);
        let (ready_sender, ready) = bounded(1);

        thread::Builder::new()
            .name("ambient light".into())
            .spawn(move || {
                let mut light = match open() {
                    Ok(light) => {
                        let _ = ready_sender.send(Ok(()));
                        light
                    }
                    Err(e) => {
                        let _ = ready_sender.send(Err(e));
                        return;
                    }
                };
                for () in request_receiver.iter() {
                    if result_sender.send(light.sample()).is_err() {
                        break;
                    }
                }
                debug!("Ambient light worker exiting");
            })?;

        ready
            .recv()
            .map_err(|_| anyhow!("ambient light worker died during startup"))??;

        Ok(Self {
            requests,
            results,
            in_flight: false,
        })
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.in_flight
    }

    pub(crate) fn request(&mut self) -> bool {
        if self.in_flight {
            return false;
        }
        if self.requests.send(()).is_err() {
            error!("Ambient light worker is gone");
            return false;
        }
        self.in_flight = true;
        true
    }

    pub(crate) fn results(&self) -> &Receiver<Result<f64>> {
        &self.results
    }

    pub(crate) fn complete(&mut self) {
        self.in_flight = false;
    }
}
