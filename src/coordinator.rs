//! # Coordinator
//!
//! Arbitrates between input events and the motor.
//!
//! - **Auto mode**: a relay trigger starts one ramp session, gated so only
//!   one runs at a time and none starts within the cooldown after the last.
//! - **Manual mode**: the joystick deflection is streamed as a duty every
//!   tick; leaving manual mode sends a zero duty. After an emergency stop
//!   streaming stays latched off until the stick is centred or a switch is
//!   toggled.
//! - **Power switch**: OFF (or unreadable) rejects triggers; switching from
//!   ON requests an emergency stop.
//! - **Sweep and direct duty**: console commands, admitted like a trigger
//!   (sweep) or only in auto mode with no session running (direct duty).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ControlConfig, SessionTelemetry, TelemetryConfig};
use crate::error::{Result, VescBridgeError};
use crate::input::{AxisSource, InputEvent, OperatingMode, PowerState, ToggleSwitch, TriggerEvent};
use crate::motor::DutyController;
use crate::telemetry::{open_sink, TelemetryPoller};

/// Session gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Busy(u64),
    /// Rejecting triggers until this instant
    Cooldown(Instant),
}

/// Allows one control session at a time, with a cooldown after each
#[derive(Debug)]
pub struct SessionGate {
    state: Mutex<GateState>,
    cooldown: Duration,
    next_id: AtomicU64,
}

impl SessionGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(GateState::Idle),
            cooldown,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the gate for a new session
    ///
    /// Returns the blocking state if busy or still cooling down.
    pub fn try_begin(&self) -> std::result::Result<u64, GateState> {
        let mut state = self.lock();
        match *state {
            GateState::Busy(_) => Err(*state),
            GateState::Cooldown(until) if Instant::now() < until => Err(*state),
            _ => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                *state = GateState::Busy(id);
                Ok(id)
            }
        }
    }

    /// Release the gate after session `id`, starting the cooldown
    pub fn finish(&self, id: u64) {
        let mut state = self.lock();
        if *state == GateState::Busy(id) {
            *state = GateState::Cooldown(Instant::now() + self.cooldown);
        }
    }

    pub fn state(&self) -> GateState {
        match *self.lock() {
            GateState::Cooldown(until) if Instant::now() >= until => GateState::Idle,
            state => state,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state(), GateState::Busy(_))
    }
}

/// What happened to a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started(u64),
    PowerOff,
    NotAuto,
    Busy,
    CoolingDown,
}

/// The sequence a session runs
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionKind {
    Ramp { target: i32, hold: Duration },
    Sweep { amplitude: i32, keep: Duration },
}

impl SessionKind {
    async fn run(self, duty: &DutyController) -> Result<()> {
        match self {
            SessionKind::Ramp { target, hold } => duty.ramp_and_hold(target, hold).await,
            SessionKind::Sweep { amplitude, keep } => duty.run_sweep(amplitude, keep).await,
        }
    }
}

/// Wires inputs to the duty controller and telemetry poller
pub struct Coordinator<S: ToggleSwitch, A: AxisSource> {
    control: ControlConfig,
    telemetry: TelemetryConfig,
    hold: Duration,
    sweep_keep: Duration,
    duty: Arc<DutyController>,
    poller: Option<Arc<TelemetryPoller>>,
    switch: S,
    axis: Option<A>,
    events: mpsc::Receiver<InputEvent>,
    gate: Arc<SessionGate>,
    sessions: JoinSet<()>,
    last_power: PowerState,
    last_mode: OperatingMode,
    missing_axis_logged: bool,
    /// Manual streaming held off after an emergency stop
    manual_latched: bool,
}

impl<S: ToggleSwitch, A: AxisSource> Coordinator<S, A> {
    /// Build the coordinator
    ///
    /// # Errors
    ///
    /// Returns [`VescBridgeError::InputUnavailable`] if the switch is in
    /// manual mode and no analog axis is available.
    pub fn new(
        config: &Config,
        duty: Arc<DutyController>,
        poller: Option<Arc<TelemetryPoller>>,
        switch: S,
        axis: Option<A>,
        events: mpsc::Receiver<InputEvent>,
    ) -> Result<Self> {
        let last_power = switch.power();
        let last_mode = switch.mode();

        if last_mode == OperatingMode::Manual && axis.is_none() {
            return Err(VescBridgeError::InputUnavailable(
                "manual mode requires a joystick".to_string(),
            ));
        }

        Ok(Self {
            control: config.control.clone(),
            telemetry: config.telemetry.clone(),
            hold: config.duty.hold_time(),
            sweep_keep: config.duty.sweep_keep(),
            duty,
            poller,
            switch,
            axis,
            events,
            gate: Arc::new(SessionGate::new(config.control.cooldown())),
            sessions: JoinSet::new(),
            last_power,
            last_mode,
            missing_axis_logged: false,
            manual_latched: false,
        })
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    /// Check the switches and claim the gate for a new session
    fn admit(&self, what: &str) -> std::result::Result<u64, TriggerOutcome> {
        let power = self.switch.power();
        if power != PowerState::On {
            info!("{} ignored: power {:?}", what, power);
            return Err(TriggerOutcome::PowerOff);
        }

        let mode = self.switch.mode();
        if mode != OperatingMode::Auto {
            info!("{} ignored: mode {:?}", what, mode);
            return Err(TriggerOutcome::NotAuto);
        }

        match self.gate.try_begin() {
            Ok(id) => Ok(id),
            Err(GateState::Cooldown(_)) => {
                info!("{} ignored: cooling down", what);
                Err(TriggerOutcome::CoolingDown)
            }
            Err(_) => {
                info!("{} ignored: session in progress", what);
                Err(TriggerOutcome::Busy)
            }
        }
    }

    fn spawn_session(&mut self, id: u64, kind: SessionKind) {
        let duty = self.duty.clone();
        let poller = self.poller.clone();
        let gate = self.gate.clone();
        let telemetry = self.telemetry.clone();

        self.sessions.spawn(async move {
            run_session(id, kind, &duty, poller.as_deref(), &telemetry).await;
            gate.finish(id);
        });
    }

    /// Start a ramp session for a trigger if the switches and gate allow it
    pub fn handle_trigger(&mut self, event: TriggerEvent) -> TriggerOutcome {
        let id = match self.admit(&format!("{:?} trigger", event)) {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };

        let target = event.direction() * self.duty.max_duty();
        info!("Session {} accepted ({:?}, target {}%)", id, event, target);

        self.spawn_session(id, SessionKind::Ramp { target, hold: self.hold });
        TriggerOutcome::Started(id)
    }

    /// Start the waveform sweep as a session, gated like a trigger
    pub fn handle_sweep_start(&mut self) -> TriggerOutcome {
        let id = match self.admit("Sweep") {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };

        let amplitude = self.duty.max_duty();
        info!("Session {} accepted (sweep ±{}%)", id, amplitude);

        self.spawn_session(id, SessionKind::Sweep { amplitude, keep: self.sweep_keep });
        TriggerOutcome::Started(id)
    }

    /// Write one duty directly; returns whether it was sent
    ///
    /// Only in auto mode with power on and no session running; manual mode
    /// owns the duty through the joystick.
    pub async fn handle_direct_duty(&mut self, percent: i32) -> bool {
        let power = self.switch.power();
        let mode = self.switch.mode();
        if power != PowerState::On || mode != OperatingMode::Auto || self.gate.is_busy() {
            info!(
                "Direct duty {}% ignored (power {:?}, mode {:?}, gate {:?})",
                percent,
                power,
                mode,
                self.gate.state()
            );
            return false;
        }

        match self.duty.set_duty(percent).await {
            Ok(()) => {
                info!("Direct duty {}%", self.duty.commanded_duty());
                true
            }
            Err(e) => {
                warn!("Direct duty {}% not sent: {}", percent, e);
                false
            }
        }
    }

    /// Wait for every spawned session to finish
    pub async fn wait_for_sessions(&mut self) {
        while let Some(joined) = self.sessions.join_next().await {
            if let Err(e) = joined {
                error!("Session task failed: {}", e);
            }
        }
    }

    async fn emergency_stop(&mut self) {
        if let Err(e) = self.duty.emergency_stop().await {
            error!("Emergency stop incomplete: {}", e);
        }

        if !self.manual_latched {
            self.manual_latched = true;
            if self.last_mode == OperatingMode::Manual {
                warn!("Manual control latched off; centre the stick or toggle a switch to re-arm");
            }
        }
    }

    fn rearm_manual(&mut self, reason: &str) {
        if self.manual_latched {
            self.manual_latched = false;
            info!("Manual control re-armed ({})", reason);
        }
    }

    /// React to power and mode switch changes
    async fn poll_switches(&mut self) {
        let power = self.switch.power();
        if power != self.last_power {
            info!("Power switch: {:?} -> {:?}", self.last_power, power);
            let was_on = self.last_power == PowerState::On;
            self.last_power = power;
            if was_on {
                self.emergency_stop().await;
            } else if power == PowerState::On {
                self.rearm_manual("power switched on");
            }
        }

        let mode = self.switch.mode();
        if mode != self.last_mode {
            info!("Mode switch: {:?} -> {:?}", self.last_mode, mode);
            let was_manual = self.last_mode == OperatingMode::Manual;
            self.last_mode = mode;
            self.missing_axis_logged = false;
            self.rearm_manual("mode switched");

            if was_manual && !self.gate.is_busy() {
                if let Err(e) = self.duty.set_duty(0).await {
                    warn!("Zero duty on leaving manual mode failed: {}", e);
                }
            }
        }
    }

    /// Stream one joystick reading as a duty command
    async fn manual_tick(&mut self) {
        if self.last_mode != OperatingMode::Manual
            || self.last_power != PowerState::On
            || self.gate.is_busy()
        {
            return;
        }

        let Some(axis) = self.axis.as_mut() else {
            if !self.missing_axis_logged {
                error!("Manual mode selected but no joystick is available");
                self.missing_axis_logged = true;
            }
            return;
        };

        let reading = axis.read_axis();

        if self.manual_latched {
            match reading {
                Ok(value) if value == 0.0 => self.rearm_manual("stick centred"),
                _ => return,
            }
        }

        let percent = match reading {
            Ok(value) => (value * self.duty.max_duty() as f32).round() as i32,
            Err(e) => {
                warn!("Joystick read failed, commanding zero: {}", e);
                0
            }
        };

        if let Err(e) = self.duty.set_duty(percent).await {
            warn!("Manual duty write failed: {}", e);
        }
    }

    /// Process events until `shutdown` resolves or a quit event arrives
    ///
    /// Always ends with an emergency stop and the poller stopped.
    pub async fn run<F: Future<Output = ()>>(mut self, shutdown: F) -> Result<()> {
        tokio::pin!(shutdown);

        let mut mode_ticker = tokio::time::interval(self.control.mode_poll());
        mode_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut manual_ticker = tokio::time::interval(self.control.manual_tick());
        manual_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inputs_open = true;

        info!(
            "Coordinator running (power {:?}, mode {:?})",
            self.last_power, self.last_mode
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                event = self.events.recv(), if inputs_open => match event {
                    Some(InputEvent::Trigger(trigger)) => {
                        self.handle_trigger(trigger);
                    }
                    Some(InputEvent::EmergencyStop) => self.emergency_stop().await,
                    Some(InputEvent::Duty(percent)) => {
                        self.handle_direct_duty(percent).await;
                    }
                    Some(InputEvent::StartSweep) => {
                        self.handle_sweep_start();
                    }
                    Some(InputEvent::FinishSweep) => {
                        info!("Sweep finish requested");
                        self.duty.finish_sweep();
                    }
                    Some(InputEvent::Quit) => {
                        info!("Quit requested");
                        break;
                    }
                    None => {
                        debug!("All input sources closed");
                        inputs_open = false;
                    }
                },
                _ = mode_ticker.tick() => self.poll_switches().await,
                _ = manual_ticker.tick() => self.manual_tick().await,
                Some(joined) = self.sessions.join_next(), if !self.sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Session task failed: {}", e);
                    }
                }
            }
        }

        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        let stopped = self.duty.emergency_stop().await;
        self.wait_for_sessions().await;

        if let Some(poller) = &self.poller {
            poller.stop().await;
        }

        match &stopped {
            Ok(()) => info!("Shutdown complete, motor stopped"),
            Err(e) => error!("Shutdown stop sequence incomplete: {}", e),
        }
        stopped
    }
}

/// One session, with telemetry handled per `session_mode`
async fn run_session(
    id: u64,
    kind: SessionKind,
    duty: &DutyController,
    poller: Option<&TelemetryPoller>,
    telemetry: &TelemetryConfig,
) {
    let mode = match poller {
        Some(_) => telemetry.session_mode,
        None => SessionTelemetry::Off,
    };

    let result = match (mode, poller) {
        (SessionTelemetry::Pause, Some(poller)) => {
            poller.pause();
            let result = kind.run(duty).await;
            poller.resume();
            result
        }
        (SessionTelemetry::Capture, Some(poller)) => {
            match open_sink(telemetry, "capture") {
                Ok(sink) => poller.start_temporary(telemetry.capture_window(), sink).await,
                Err(e) => warn!("Session {} capture not started: {}", id, e),
            }
            kind.run(duty).await
        }
        _ => kind.run(duty).await,
    };

    match result {
        Ok(()) => info!("Session {} finished", id),
        Err(VescBridgeError::Aborted) => warn!("Session {} aborted", id),
        Err(e) => error!("Session {} failed: {}", id, e),
    }
}
