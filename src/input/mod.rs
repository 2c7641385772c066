//! # Input Module
//!
//! Boundary collaborators that feed the coordinator.
//!
//! This module handles:
//! - Relay trigger edges (forward/reverse) with debounce and lockout
//! - Power and mode toggle switches
//! - Analog joystick calibration, deadzone and response curve
//! - Console stand-ins for all of the above

pub mod calibration;
pub mod console;
pub mod joystick;
pub mod switch;
pub mod trigger;

pub use joystick::{AdcChannel, Joystick};
pub use switch::{ConsoleSwitch, OperatingMode, PowerState, ToggleSwitch};
pub use trigger::{TriggerEvent, TriggerFilter, TriggerSource};

use crate::error::Result;

/// Events delivered to the coordinator's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Trigger(TriggerEvent),
    /// Write this duty (whole percent) directly
    Duty(i32),
    StartSweep,
    FinishSweep,
    EmergencyStop,
    Quit,
}

/// Shaped analog axis in -1.0..=1.0
#[cfg_attr(test, mockall::automock)]
pub trait AxisSource: Send {
    fn read_axis(&mut self) -> Result<f32>;
}
