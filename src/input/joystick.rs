//! Analog joystick on an ADC channel
//!
//! The stick's resting position is sampled at startup and used as the
//! center; readings are then shaped by [`Calibration`].

use std::time::Duration;
use tracing::{debug, info, warn};

use super::calibration::{normalize_raw, Calibration};
use super::AxisSource;
use crate::config::JoystickConfig;
use crate::error::{Result, VescBridgeError};

/// One raw analog channel (e.g. a 10-bit SPI ADC input)
#[cfg_attr(test, mockall::automock)]
pub trait AdcChannel: Send {
    fn read_raw(&mut self) -> Result<u16>;
}

/// Single-axis joystick with a calibrated center
#[derive(Debug)]
pub struct Joystick<A: AdcChannel> {
    adc: A,
    calibration: Calibration,
    center: u16,
    samples: usize,
    sample_interval: Duration,
}

impl<A: AdcChannel> Joystick<A> {
    /// Wrap an ADC channel; the center starts at mid-scale until calibrated
    pub fn new(adc: A, config: &JoystickConfig) -> Self {
        Self {
            adc,
            calibration: Calibration::new(config.deadzone, config.sensitivity),
            center: config.adc_max / 2 + 1,
            samples: config.calibration_samples.max(1),
            sample_interval: Duration::from_millis(config.calibration_interval_ms),
        }
    }

    pub fn center(&self) -> u16 {
        self.center
    }

    /// Sample the resting position and use the mean as the center
    ///
    /// Failed reads are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`VescBridgeError::InputUnavailable`] if every read failed or
    /// the mean is zero.
    pub async fn calibrate(&mut self) -> Result<u16> {
        let mut total: u32 = 0;
        let mut good: u32 = 0;

        for i in 0..self.samples {
            match self.adc.read_raw() {
                Ok(raw) => {
                    total += u32::from(raw);
                    good += 1;
                }
                Err(e) => warn!("Calibration sample {} failed: {}", i, e),
            }
            tokio::time::sleep(self.sample_interval).await;
        }

        if good == 0 {
            return Err(VescBridgeError::InputUnavailable(
                "joystick ADC returned no readings during calibration".to_string(),
            ));
        }

        let center = (total / good) as u16;
        if center == 0 {
            return Err(VescBridgeError::InputUnavailable(
                "joystick center reads as zero (ADC disconnected?)".to_string(),
            ));
        }

        self.center = center;
        info!("Joystick calibrated: center {} from {} samples", center, good);
        Ok(center)
    }
}

impl<A: AdcChannel> AxisSource for Joystick<A> {
    fn read_axis(&mut self) -> Result<f32> {
        let raw = self.adc.read_raw()?;
        let value = self.calibration.apply(normalize_raw(raw, self.center));
        debug!("Joystick raw {} -> {:.3}", raw, value);
        Ok(value)
    }
}
