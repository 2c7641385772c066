//! # Calibration Module
//!
//! Applies a deadzone and a power response curve to joystick input.
//!
//! ## Deadzone
//!
//! A deadzone eliminates small stick movements near center so a resting
//! stick never commands a duty. Values within the deadzone are mapped to 0.0,
//! values outside are rescaled to use the full range.
//!
//! ## Response Curve
//!
//! The curve makes small deflections less sensitive while keeping full
//! deflection at the endpoints.
//!
//! The formula used is: `output = sign(input) * |input|^sensitivity`
//!
//! - `sensitivity = 1.0`: Linear response
//! - `sensitivity = 2.0`: Soft center (default)
//! - `sensitivity = 3.0`: Very soft center
//!
//! ## Usage
//!
//! ```
//! use vesc_bridge::input::calibration::Calibration;
//!
//! let cal = Calibration::new(0.1, 2.0); // 10% deadzone, quadratic curve
//!
//! // Input near center (within deadzone)
//! assert_eq!(cal.apply(0.05), 0.0);
//!
//! // Input at full deflection
//! assert!((cal.apply(1.0) - 1.0).abs() < 0.001);
//! ```

/// Applies deadzone and response curve to a normalized input.
///
/// Input and output are in the range -1.0 to 1.0, where 0.0 is center.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    /// Deadzone as a fraction (0.0 to 0.5).
    deadzone: f32,
    /// Curve exponent (1.0 to 5.0).
    sensitivity: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            deadzone: 0.1,
            sensitivity: 2.0,
        }
    }
}

impl Calibration {
    /// Creates a new calibration with specified deadzone and sensitivity.
    ///
    /// # Arguments
    ///
    /// * `deadzone` - Deadzone fraction (0.0 to 0.5). Values outside this range are clamped.
    /// * `sensitivity` - Curve exponent (1.0 to 5.0). 1.0 = linear.
    #[must_use]
    pub fn new(deadzone: f32, sensitivity: f32) -> Self {
        Self {
            deadzone: deadzone.clamp(0.0, 0.5),
            sensitivity: sensitivity.clamp(1.0, 5.0),
        }
    }

    /// Creates a linear calibration (no deadzone, no curve).
    #[must_use]
    pub fn linear() -> Self {
        Self {
            deadzone: 0.0,
            sensitivity: 1.0,
        }
    }

    #[must_use]
    pub fn deadzone(&self) -> f32 {
        self.deadzone
    }

    #[must_use]
    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    /// Applies deadzone and response curve to a normalized input.
    ///
    /// The result is clamped to -1.0..=1.0, so out-of-range input (a stick
    /// resting off its calibrated center) still saturates cleanly.
    ///
    /// # Examples
    ///
    /// ```
    /// use vesc_bridge::input::calibration::Calibration;
    ///
    /// let cal = Calibration::new(0.1, 2.0);
    ///
    /// assert_eq!(cal.apply(-0.05), 0.0);
    /// assert!((cal.apply(0.55) - 0.25).abs() < 0.001);
    /// assert!((cal.apply(-1.0) - (-1.0)).abs() < 0.001);
    /// ```
    #[must_use]
    pub fn apply(&self, input: f32) -> f32 {
        let sign = input.signum();
        let after_deadzone = self.apply_deadzone(input.abs());
        let curved = after_deadzone.powf(self.sensitivity);

        (sign * curved).clamp(-1.0, 1.0)
    }

    /// Maps values within the deadzone to 0, and scales the rest to 0..1.
    #[inline]
    fn apply_deadzone(&self, abs_input: f32) -> f32 {
        if abs_input < self.deadzone {
            0.0
        } else {
            (abs_input - self.deadzone) / (1.0 - self.deadzone)
        }
    }
}

/// Converts a raw ADC reading to -1.0..1.0 around a calibrated center.
///
/// # Examples
///
/// ```
/// use vesc_bridge::input::calibration::normalize_raw;
///
/// assert_eq!(normalize_raw(511, 511), 0.0);
/// assert!((normalize_raw(0, 511) - (-1.0)).abs() < 0.001);
/// ```
#[must_use]
pub fn normalize_raw(raw: u16, center: u16) -> f32 {
    if center == 0 {
        return 0.0;
    }
    (f32::from(raw) - f32::from(center)) / f32::from(center)
}
