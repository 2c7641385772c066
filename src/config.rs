//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below, which match the reference bench setup (Raspberry Pi UART,
//! 10% duty ceiling, 50 ms ramp steps).

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, VescBridgeError};
use crate::input::{OperatingMode, PowerState};
use crate::vesc::protocol::TELEMETRY_FIELDS;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub duty: DutyConfig,
    #[serde(default)]
    pub stop: StopConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub joystick: JoystickConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_fallback_ports")]
    pub fallback_ports: Vec<String>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

/// What the controller does after the hold phase, before the stop procedure
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Go straight to the stop procedure
    Immediate,
    /// Step back to zero one percent at a time first
    RampDown,
}

/// Duty ramp configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DutyConfig {
    #[serde(default = "default_max_duty")]
    pub max_duty: i32,

    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,

    #[serde(default = "default_hold_time_ms")]
    pub hold_time_ms: u64,

    #[serde(default = "default_stop_mode")]
    pub stop_mode: StopMode,

    /// Dwell at each extreme of the waveform sweep
    #[serde(default = "default_sweep_keep_ms")]
    pub sweep_keep_ms: u64,
}

/// Stop procedure configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StopConfig {
    #[serde(default = "default_zero_burst_count")]
    pub zero_burst_count: u32,

    #[serde(default = "default_zero_burst_interval_ms")]
    pub zero_burst_interval_ms: u64,

    #[serde(default = "default_sustain_repeats")]
    pub sustain_repeats: u32,

    #[serde(default = "default_sustain_interval_ms")]
    pub sustain_interval_ms: u64,

    #[serde(default = "default_reconfirm_current")]
    pub reconfirm_current: bool,
}

/// Telemetry log file format
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Csv,
    Jsonl,
}

/// How telemetry polling behaves while a control session runs
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionTelemetry {
    /// Pause the background poller for the whole session
    Pause,
    /// Record a temporary capture alongside the session
    Capture,
    /// Leave the poller alone
    Off,
}

/// Telemetry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_response_wait_ms")]
    pub response_wait_ms: u64,

    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,

    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    #[serde(default = "default_log_fields")]
    pub fields: Vec<String>,

    #[serde(default = "default_session_mode")]
    pub session_mode: SessionTelemetry,

    #[serde(default = "default_capture_secs")]
    pub capture_secs: u64,
}

/// Coordinator configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    #[serde(default = "default_mode")]
    pub mode: OperatingMode,

    #[serde(default = "default_power")]
    pub power: PowerState,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    #[serde(default = "default_manual_tick_ms")]
    pub manual_tick_ms: u64,

    #[serde(default = "default_mode_poll_ms")]
    pub mode_poll_ms: u64,

    /// Start the waveform sweep as soon as the bridge is up
    #[serde(default)]
    pub sweep_on_start: bool,
}

/// Relay trigger input configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_lockout_ms")]
    pub lockout_ms: u64,
}

/// Analog joystick configuration
#[derive(Debug, Deserialize, Clone)]
pub struct JoystickConfig {
    #[serde(default = "default_deadzone")]
    pub deadzone: f32,

    #[serde(default = "default_sensitivity")]
    pub sensitivity: f32,

    #[serde(default = "default_calibration_samples")]
    pub calibration_samples: usize,

    #[serde(default = "default_calibration_interval_ms")]
    pub calibration_interval_ms: u64,

    #[serde(default = "default_adc_max")]
    pub adc_max: u16,
}

/// Process log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_dir")]
    pub dir: String,

    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

// Default value functions
fn default_serial_port() -> String { "/dev/serial0".to_string() }
fn default_fallback_ports() -> Vec<String> { vec!["/dev/ttyAMA0".to_string(), "/dev/ttyUSB0".to_string()] }
fn default_baud_rate() -> u32 { 115200 }
fn default_read_timeout_ms() -> u64 { 20 }

fn default_max_duty() -> i32 { 10 }
fn default_step_delay_ms() -> u64 { 50 }
fn default_hold_time_ms() -> u64 { 3000 }
fn default_stop_mode() -> StopMode { StopMode::Immediate }
fn default_sweep_keep_ms() -> u64 { 3000 }

fn default_zero_burst_count() -> u32 { 5 }
fn default_zero_burst_interval_ms() -> u64 { 10 }
fn default_sustain_repeats() -> u32 { 15 }
fn default_sustain_interval_ms() -> u64 { 20 }
fn default_reconfirm_current() -> bool { true }

fn default_telemetry_enabled() -> bool { true }
fn default_poll_interval_ms() -> u64 { 50 }
fn default_response_wait_ms() -> u64 { 50 }
fn default_error_backoff_ms() -> u64 { 100 }
fn default_max_buffer_bytes() -> usize { 1000 }
fn default_join_timeout_ms() -> u64 { 3000 }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_log_format() -> LogFormat { LogFormat::Csv }
fn default_log_fields() -> Vec<String> { vec!["time".to_string(), "duty".to_string(), "rpm".to_string()] }
fn default_session_mode() -> SessionTelemetry { SessionTelemetry::Pause }
fn default_capture_secs() -> u64 { 10 }

fn default_mode() -> OperatingMode { OperatingMode::Auto }
fn default_power() -> PowerState { PowerState::On }
fn default_cooldown_ms() -> u64 { 2000 }
fn default_manual_tick_ms() -> u64 { 50 }
fn default_mode_poll_ms() -> u64 { 100 }

fn default_debounce_ms() -> u64 { 50 }
fn default_lockout_ms() -> u64 { 500 }

fn default_deadzone() -> f32 { 0.1 }
fn default_sensitivity() -> f32 { 2.0 }
fn default_calibration_samples() -> usize { 20 }
fn default_calibration_interval_ms() -> u64 { 20 }
fn default_adc_max() -> u16 { 1023 }

fn default_log_level() -> String { "info".to_string() }
fn default_file_prefix() -> String { "vesc-bridge".to_string() }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            fallback_ports: default_fallback_ports(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for DutyConfig {
    fn default() -> Self {
        Self {
            max_duty: default_max_duty(),
            step_delay_ms: default_step_delay_ms(),
            hold_time_ms: default_hold_time_ms(),
            stop_mode: default_stop_mode(),
            sweep_keep_ms: default_sweep_keep_ms(),
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            zero_burst_count: default_zero_burst_count(),
            zero_burst_interval_ms: default_zero_burst_interval_ms(),
            sustain_repeats: default_sustain_repeats(),
            sustain_interval_ms: default_sustain_interval_ms(),
            reconfirm_current: default_reconfirm_current(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            interval_ms: default_poll_interval_ms(),
            response_wait_ms: default_response_wait_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            max_buffer_bytes: default_max_buffer_bytes(),
            join_timeout_ms: default_join_timeout_ms(),
            log_dir: default_log_dir(),
            format: default_log_format(),
            fields: default_log_fields(),
            session_mode: default_session_mode(),
            capture_secs: default_capture_secs(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            power: default_power(),
            cooldown_ms: default_cooldown_ms(),
            manual_tick_ms: default_manual_tick_ms(),
            mode_poll_ms: default_mode_poll_ms(),
            sweep_on_start: false,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            lockout_ms: default_lockout_ms(),
        }
    }
}

impl Default for JoystickConfig {
    fn default() -> Self {
        Self {
            deadzone: default_deadzone(),
            sensitivity: default_sensitivity(),
            calibration_samples: default_calibration_samples(),
            calibration_interval_ms: default_calibration_interval_ms(),
            adc_max: default_adc_max(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            file_prefix: default_file_prefix(),
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl DutyConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn hold_time(&self) -> Duration {
        Duration::from_millis(self.hold_time_ms)
    }

    pub fn sweep_keep(&self) -> Duration {
        Duration::from_millis(self.sweep_keep_ms)
    }
}

impl TelemetryConfig {
    pub fn capture_window(&self) -> Duration {
        Duration::from_secs(self.capture_secs)
    }
}

impl ControlConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn manual_tick(&self) -> Duration {
        Duration::from_millis(self.manual_tick_ms)
    }

    pub fn mode_poll(&self) -> Duration {
        Duration::from_millis(self.mode_poll_ms)
    }
}

/// Build a configuration error with a custom message
fn invalid(msg: impl std::fmt::Display) -> VescBridgeError {
    VescBridgeError::Config(toml::de::Error::custom(msg))
}

/// Check that `value` lies in `min..=max`
fn check_range<T: PartialOrd + std::fmt::Display>(name: &str, value: T, min: T, max: T) -> Result<()> {
    if value < min || value > max {
        return Err(invalid(format!("{} must be between {} and {}", name, min, max)));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use vesc_bridge::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Serial
        if self.serial.port.is_empty() {
            return Err(invalid("serial port cannot be empty"));
        }

        if ![9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600].contains(&self.serial.baud_rate) {
            return Err(invalid(
                "baud_rate must be one of: 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600",
            ));
        }

        check_range("read_timeout_ms", self.serial.read_timeout_ms, 1, 1000)?;

        // Duty ramp
        check_range("max_duty", self.duty.max_duty, 1, 100)?;
        check_range("step_delay_ms", self.duty.step_delay_ms, 1, 10000)?;
        check_range("hold_time_ms", self.duty.hold_time_ms, 0, 600_000)?;
        check_range("sweep_keep_ms", self.duty.sweep_keep_ms, 0, 600_000)?;

        // Stop procedure
        check_range("zero_burst_count", self.stop.zero_burst_count, 1, 100)?;
        check_range("zero_burst_interval_ms", self.stop.zero_burst_interval_ms, 0, 1000)?;
        check_range("sustain_repeats", self.stop.sustain_repeats, 0, 1000)?;
        check_range("sustain_interval_ms", self.stop.sustain_interval_ms, 1, 1000)?;

        // Telemetry
        check_range("interval_ms", self.telemetry.interval_ms, 1, 60000)?;
        check_range("response_wait_ms", self.telemetry.response_wait_ms, 1, 1000)?;
        check_range("error_backoff_ms", self.telemetry.error_backoff_ms, 0, 10000)?;
        check_range("join_timeout_ms", self.telemetry.join_timeout_ms, 1, 60000)?;

        // Must hold at least one full GET_VALUES frame
        if self.telemetry.max_buffer_bytes < 64 {
            return Err(invalid("max_buffer_bytes must be at least 64"));
        }

        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(invalid("telemetry log_dir cannot be empty when enabled"));
        }

        if self.telemetry.fields.is_empty() {
            return Err(invalid("telemetry fields cannot be empty"));
        }

        for field in &self.telemetry.fields {
            if field != "time" && !TELEMETRY_FIELDS.contains(&field.as_str()) {
                return Err(invalid(format!("unknown telemetry field '{}'", field)));
            }
        }

        if self.telemetry.session_mode == SessionTelemetry::Capture && self.telemetry.capture_secs == 0 {
            return Err(invalid("capture_secs must be greater than 0 in capture mode"));
        }

        // Control
        if self.control.mode == OperatingMode::Unknown {
            return Err(invalid("control mode must be 'auto' or 'manual'"));
        }

        if self.control.power == PowerState::Unknown {
            return Err(invalid("control power must be 'on' or 'off'"));
        }

        check_range("cooldown_ms", self.control.cooldown_ms, 0, 600_000)?;
        check_range("manual_tick_ms", self.control.manual_tick_ms, 1, 1000)?;
        check_range("mode_poll_ms", self.control.mode_poll_ms, 1, 10000)?;

        // Relay
        check_range("debounce_ms", self.relay.debounce_ms, 0, 5000)?;
        check_range("lockout_ms", self.relay.lockout_ms, 0, 60000)?;

        // Joystick
        check_range("deadzone", self.joystick.deadzone, 0.0, 0.5)?;
        check_range("sensitivity", self.joystick.sensitivity, 1.0, 5.0)?;
        check_range("calibration_samples", self.joystick.calibration_samples, 1, 1000)?;
        check_range("calibration_interval_ms", self.joystick.calibration_interval_ms, 0, 1000)?;

        if self.joystick.adc_max < 2 {
            return Err(invalid("adc_max must be at least 2"));
        }

        // Logging
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("logging level must be one of: trace, debug, info, warn, error"));
        }

        if self.logging.dir.is_empty() {
            return Err(invalid("logging dir cannot be empty"));
        }

        Ok(())
    }
}
