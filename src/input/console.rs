//! Console stand-ins for the physical inputs
//!
//! Lets the bridge be driven from a terminal when the relay board, toggle
//! switches or ADC are not wired up:
//!
//! | line | effect |
//! |---|---|
//! | `f`, `forward` | forward trigger edge |
//! | `r`, `reverse` | reverse trigger edge |
//! | `m manual`, `m auto` | mode switch |
//! | `p on`, `p off` | power switch |
//! | `a <-1..1>` | simulated joystick deflection |
//! | `d <-100..100>` | write a duty (percent) directly |
//! | `w`, `sweep` / `w stop` | start / finish the waveform sweep |
//! | `s`, `stop` | emergency stop |
//! | `q`, `quit` | shut down |

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::joystick::AdcChannel;
use super::switch::{ConsoleSwitch, OperatingMode, PowerState};
use super::trigger::{TriggerEvent, TriggerSource};
use super::InputEvent;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsoleCommand {
    Trigger(TriggerEvent),
    Mode(OperatingMode),
    Power(PowerState),
    Axis(f32),
    Duty(i32),
    StartSweep,
    FinishSweep,
    EmergencyStop,
    Quit,
    Help,
}

/// Parse one console line
pub fn parse_command(line: &str) -> std::result::Result<ConsoleCommand, String> {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or("").to_ascii_lowercase();
    let arg = words.next().map(str::to_ascii_lowercase);

    match (command.as_str(), arg.as_deref()) {
        ("f" | "forward", None) => Ok(ConsoleCommand::Trigger(TriggerEvent::Forward)),
        ("r" | "reverse", None) => Ok(ConsoleCommand::Trigger(TriggerEvent::Reverse)),
        ("m" | "mode", Some("manual")) => Ok(ConsoleCommand::Mode(OperatingMode::Manual)),
        ("m" | "mode", Some("auto")) => Ok(ConsoleCommand::Mode(OperatingMode::Auto)),
        ("p" | "power", Some("on")) => Ok(ConsoleCommand::Power(PowerState::On)),
        ("p" | "power", Some("off")) => Ok(ConsoleCommand::Power(PowerState::Off)),
        ("a" | "axis", Some(value)) => {
            let value: f32 = value
                .parse()
                .map_err(|_| format!("axis value '{}' is not a number", value))?;
            if !(-1.0..=1.0).contains(&value) {
                return Err(format!("axis value {} outside -1..1", value));
            }
            Ok(ConsoleCommand::Axis(value))
        }
        ("d" | "duty", Some(value)) => {
            let percent: i32 = value
                .parse()
                .map_err(|_| format!("duty '{}' is not a whole percent", value))?;
            if !(-100..=100).contains(&percent) {
                return Err(format!("duty {}% outside -100..100", percent));
            }
            Ok(ConsoleCommand::Duty(percent))
        }
        ("w" | "sweep", None) => Ok(ConsoleCommand::StartSweep),
        ("w" | "sweep", Some("stop")) => Ok(ConsoleCommand::FinishSweep),
        ("s" | "stop", None) => Ok(ConsoleCommand::EmergencyStop),
        ("q" | "quit", None) => Ok(ConsoleCommand::Quit),
        ("h" | "help" | "?", None) => Ok(ConsoleCommand::Help),
        _ => Err(format!("unrecognised command '{}'", line.trim())),
    }
}

/// ADC channel whose level is set from the console
#[derive(Debug, Clone)]
pub struct SimulatedAdc {
    raw: Arc<AtomicU16>,
    adc_max: u16,
}

impl SimulatedAdc {
    /// Starts at mid-scale (stick at rest)
    pub fn new(adc_max: u16) -> Self {
        Self {
            raw: Arc::new(AtomicU16::new(adc_max / 2 + 1)),
            adc_max,
        }
    }

    /// Set the level from a deflection in -1..1
    pub fn set_axis(&self, value: f32) {
        let center = f32::from(self.adc_max / 2 + 1);
        let raw = (center + value.clamp(-1.0, 1.0) * center)
            .round()
            .clamp(0.0, f32::from(self.adc_max));
        self.raw.store(raw as u16, Ordering::Release);
    }
}

impl AdcChannel for SimulatedAdc {
    fn read_raw(&mut self) -> Result<u16> {
        Ok(self.raw.load(Ordering::Acquire))
    }
}

/// Everything the console drives
#[derive(Debug)]
pub struct Console {
    pub triggers: TriggerSource,
    pub switch: ConsoleSwitch,
    pub adc: SimulatedAdc,
    pub events: mpsc::Sender<InputEvent>,
}

fn log_help() {
    info!("Commands: f|forward, r|reverse, m manual|auto, p on|off, a <-1..1>, d <percent>, w|sweep [stop], s|stop, q|quit");
}

/// Read commands line by line until quit or end of input
pub async fn run_console<R: AsyncBufRead + Unpin>(input: R, mut console: Console) -> Result<()> {
    let mut lines = input.lines();
    log_help();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };

        match command {
            ConsoleCommand::Trigger(event) => {
                console.triggers.edge(event);
            }
            ConsoleCommand::Mode(mode) => {
                info!("Mode switch -> {:?}", mode);
                console.switch.set_mode(mode);
            }
            ConsoleCommand::Power(power) => {
                info!("Power switch -> {:?}", power);
                console.switch.set_power(power);
            }
            ConsoleCommand::Axis(value) => console.adc.set_axis(value),
            ConsoleCommand::Duty(percent) => {
                if console.events.send(InputEvent::Duty(percent)).await.is_err() {
                    break;
                }
            }
            ConsoleCommand::StartSweep => {
                if console.events.send(InputEvent::StartSweep).await.is_err() {
                    break;
                }
            }
            ConsoleCommand::FinishSweep => {
                if console.events.send(InputEvent::FinishSweep).await.is_err() {
                    break;
                }
            }
            ConsoleCommand::EmergencyStop => {
                if console.events.send(InputEvent::EmergencyStop).await.is_err() {
                    break;
                }
            }
            ConsoleCommand::Quit => {
                let _ = console.events.send(InputEvent::Quit).await;
                break;
            }
            ConsoleCommand::Help => log_help(),
        }
    }

    info!("Console input closed");
    Ok(())
}
