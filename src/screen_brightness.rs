use anyhow::{Context, Result};
use log::{debug, info};
use logind_zbus::session::SessionProxyBlocking;

use crate::{error::Error, read_value};

/// The screen brightness control, in percent.
pub(crate) trait BrightnessSlider {
    fn set_percent(&mut self, pct: u8) -> Result<()>;
    fn get_percent(&mut self) -> Result<u8>;
}

pub(crate) struct ScreenBrightness<'a> {
    proxy: &'a SessionProxyBlocking<'a>,
    subsystem: &'a str,
    name: &'a str,
    max_brightness: u32,
}

impl<'a> ScreenBrightness<'a> {
    pub(crate) fn new(
        proxy: &'a SessionProxyBlocking<'a>,
        subsystem: &'a str,
        name: &'a str,
    ) -> Result<Self> {
        let max_brightness =
            read_value(format!("/sys/class/{}/{}/max_brightness", subsystem, name))
                .context(Error::HardwareUnavailable(format!("screen backlight {}", name)))?;

        Ok(Self {
            proxy,
            subsystem,
            name,
            max_brightness,
        })
    }

    fn read(&self) -> Result<u32> {
        read_value(format!(
            "/sys/class/{}/{}/brightness",
            self.subsystem, self.name
        ))
    }
}

fn pct_to_brightness(pct: u8, max_brightness: u32) -> u32 {
    (pct.min(100) as u32 * max_brightness) / 100
}

fn brightness_to_pct(level: u32, max_brightness: u32) -> u8 {
    if max_brightness == 0 {
        return 0;
    }
    let level = level.min(max_brightness) as u64;
    let max = max_brightness as u64;
    ((level * 100 + max / 2) / max) as u8
}

impl<'a> BrightnessSlider for ScreenBrightness<'a> {
    fn set_percent(&mut self, pct: u8) -> Result<()> {
        let new_level = pct_to_brightness(pct, self.max_brightness);
        let cur_brightness = self.read()?;

        debug!(
            "Backlight: np:{:?}, nl:{:?}, cb:{:?}",
            pct, new_level, cur_brightness
        );
        if cur_brightness != new_level {
            info!(
                "Adjusting Screen Backlight: old:{:?} new:{:?}%->{:?}",
                cur_brightness, pct, new_level
            );
            self.proxy
                .set_brightness(self.subsystem, self.name, new_level)
                .context(Error::HardwareUnavailable(format!("screen backlight {}", self.name)))?;
        }

        Ok(())
    }

    fn get_percent(&mut self) -> Result<u8> {
        Ok(brightness_to_pct(self.read()?, self.max_brightness))
    }
}
