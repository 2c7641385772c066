//! Toggle switches (power and operating mode)
//!
//! Both switches are polled, not evented. An ON-ON switch with neither
//! contact closed reads as `Unknown`, which the coordinator treats the same
//! as OFF for power.

use serde::Deserialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Joystick streams duty continuously
    Manual,
    /// Relay triggers start ramp sessions
    Auto,
    Unknown,
}

/// Polled power and mode switch state
#[cfg_attr(test, mockall::automock)]
pub trait ToggleSwitch: Send + Sync {
    fn power(&self) -> PowerState;
    fn mode(&self) -> OperatingMode;
}

/// Software switch driven from the console
#[derive(Debug, Clone)]
pub struct ConsoleSwitch {
    power: Arc<AtomicU8>,
    mode: Arc<AtomicU8>,
}

impl ConsoleSwitch {
    pub fn new(power: PowerState, mode: OperatingMode) -> Self {
        Self {
            power: Arc::new(AtomicU8::new(power as u8)),
            mode: Arc::new(AtomicU8::new(mode as u8)),
        }
    }

    pub fn set_power(&self, power: PowerState) {
        self.power.store(power as u8, Ordering::Release);
    }

    pub fn set_mode(&self, mode: OperatingMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }
}

impl ToggleSwitch for ConsoleSwitch {
    fn power(&self) -> PowerState {
        match self.power.load(Ordering::Acquire) {
            x if x == PowerState::On as u8 => PowerState::On,
            x if x == PowerState::Off as u8 => PowerState::Off,
            _ => PowerState::Unknown,
        }
    }

    fn mode(&self) -> OperatingMode {
        match self.mode.load(Ordering::Acquire) {
            x if x == OperatingMode::Manual as u8 => OperatingMode::Manual,
            x if x == OperatingMode::Auto as u8 => OperatingMode::Auto,
            _ => OperatingMode::Unknown,
        }
    }
}
