//! Duty Controller
//!
//! Runs control sequences (ramp sessions and the waveform sweep) over the
//! shared serial channel. Only one sequence runs at a time; `emergency_stop`
//! bypasses the sequence lock and interrupts whatever is in flight.
//!
//! State machine: `Idle → RampingUp → Holding → RampingDown/Stopping → Idle`,
//! or `Idle → Sweeping → Stopping → Idle` for the sweep.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{DutyConfig, StopConfig, StopMode};
use crate::error::{Result, VescBridgeError};
use crate::serial::SerialChannel;
use crate::vesc::encoder::{clamp_duty_percent, encode_command, encode_duty_percent};
use crate::vesc::protocol::VescCommand;

/// Where the controller is in a control sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DutyState {
    Idle = 0,
    RampingUp = 1,
    Holding = 2,
    RampingDown = 3,
    Stopping = 4,
    Sweeping = 5,
}

impl DutyState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DutyState::RampingUp,
            2 => DutyState::Holding,
            3 => DutyState::RampingDown,
            4 => DutyState::Stopping,
            5 => DutyState::Sweeping,
            _ => DutyState::Idle,
        }
    }
}

/// Duty-cycle controller for one motor
pub struct DutyController {
    channel: SerialChannel,
    duty: DutyConfig,
    stop: StopConfig,
    /// Held for the whole of a control sequence
    sequence_lock: Mutex<()>,
    /// Bumped by every emergency stop
    abort_epoch: watch::Sender<u64>,
    /// Bumped by every request to end the sweep
    sweep_finish: watch::Sender<u64>,
    /// Stop procedures currently running
    stops_running: AtomicU32,
    state: AtomicU8,
    /// Last duty written, in whole percent
    commanded: AtomicI32,
}

impl std::fmt::Debug for DutyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DutyController")
            .field("state", &self.state())
            .field("commanded", &self.commanded_duty())
            .field("max_duty", &self.duty.max_duty)
            .finish_non_exhaustive()
    }
}

impl DutyController {
    pub fn new(channel: SerialChannel, duty: DutyConfig, stop: StopConfig) -> Self {
        let (abort_epoch, _) = watch::channel(0);
        let (sweep_finish, _) = watch::channel(0);

        Self {
            channel,
            duty,
            stop,
            sequence_lock: Mutex::new(()),
            abort_epoch,
            sweep_finish,
            stops_running: AtomicU32::new(0),
            state: AtomicU8::new(DutyState::Idle as u8),
            commanded: AtomicI32::new(0),
        }
    }

    pub fn state(&self) -> DutyState {
        DutyState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Last duty written to the controller, in whole percent
    pub fn commanded_duty(&self) -> i32 {
        self.commanded.load(Ordering::Acquire)
    }

    /// Configured duty ceiling for sessions, in whole percent
    pub fn max_duty(&self) -> i32 {
        self.duty.max_duty
    }

    fn set_state(&self, state: DutyState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Write a single duty command, clamped to [-100, 100]
    ///
    /// Waits for any running sequence to finish. Write failures are returned
    /// as-is with no retry.
    ///
    /// # Errors
    ///
    /// Returns [`VescBridgeError::Aborted`] without writing if an emergency
    /// stop started after this call, or if a nonzero duty is requested while
    /// a stop procedure is still sending zeros.
    pub async fn set_duty(&self, percent: i32) -> Result<()> {
        let epoch = *self.abort_epoch.borrow();
        let _sequence = self.sequence_lock.lock().await;
        let percent = clamp_duty_percent(percent);

        let mut guard = self.channel.lock().await;
        if self.aborted_since(epoch) || (percent != 0 && self.stopping()) {
            debug!("Duty {}% dropped: stop in progress", percent);
            return Err(VescBridgeError::Aborted);
        }

        guard.send(&encode_duty_percent(percent)).await?;
        self.commanded.store(percent, Ordering::Release);
        debug!("Duty set to {}%", percent);
        Ok(())
    }

    /// Run one control session: ramp to `target`, hold, then stop
    ///
    /// `target` is clamped to the configured `max_duty`. Steps are one whole
    /// percent apart with `step_delay` between them. On a channel error the
    /// stop procedure still runs and the original error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`VescBridgeError::Aborted`] if an emergency stop happens at
    /// any point after this call started, including while it waited for a
    /// previous session.
    pub async fn ramp_and_hold(&self, target: i32, hold: Duration) -> Result<()> {
        let mut abort_rx = self.abort_epoch.subscribe();
        let epoch = *abort_rx.borrow_and_update();

        let _sequence = self.sequence_lock.lock().await;
        if self.aborted_since(epoch) {
            warn!("Control session cancelled before start");
            return Err(VescBridgeError::Aborted);
        }

        let target = target.clamp(-self.duty.max_duty, self.duty.max_duty);
        info!("Control session start: target {}%, hold {:?}", target, hold);

        let result = self.run_session(target, hold, epoch, &mut abort_rx).await;
        self.finish_sequence("Control session", result).await
    }

    async fn run_session(
        &self,
        target: i32,
        hold: Duration,
        epoch: u64,
        abort_rx: &mut watch::Receiver<u64>,
    ) -> Result<()> {
        let direction = target.signum();
        let step_delay = self.duty.step_delay();

        self.set_state(DutyState::RampingUp);
        for magnitude in 1..=target.abs() {
            self.send_step(direction * magnitude, epoch).await?;
            self.interruptible_sleep(step_delay, epoch, abort_rx).await?;
        }

        self.set_state(DutyState::Holding);
        self.send_step(target, epoch).await?;
        self.interruptible_sleep(hold, epoch, abort_rx).await?;

        if self.duty.stop_mode == StopMode::RampDown {
            self.set_state(DutyState::RampingDown);
            for magnitude in (0..target.abs()).rev() {
                self.send_step(direction * magnitude, epoch).await?;
                self.interruptible_sleep(step_delay, epoch, abort_rx).await?;
            }
        }

        Ok(())
    }

    /// Sweep the duty 0 → +amplitude → -amplitude → 0 until asked to finish
    ///
    /// Unit steps `step_delay` apart, dwelling `keep` at each extreme. Runs
    /// cycle after cycle until [`finish_sweep`](Self::finish_sweep), then
    /// runs the stop procedure. `amplitude` is clamped to `1..=max_duty`.
    ///
    /// # Errors
    ///
    /// Returns [`VescBridgeError::Aborted`] on an emergency stop. A channel
    /// error ends the sweep after a best-effort stop.
    pub async fn run_sweep(&self, amplitude: i32, keep: Duration) -> Result<()> {
        let mut abort_rx = self.abort_epoch.subscribe();
        let epoch = *abort_rx.borrow_and_update();
        let mut finish_rx = self.sweep_finish.subscribe();

        let _sequence = self.sequence_lock.lock().await;
        if self.aborted_since(epoch) {
            warn!("Sweep cancelled before start");
            return Err(VescBridgeError::Aborted);
        }
        if finish_rx.has_changed().unwrap_or(true) {
            info!("Sweep finished before start");
            return Ok(());
        }

        let amplitude = amplitude.abs().clamp(1, self.duty.max_duty);
        info!("Sweep start: ±{}%, dwell {:?}", amplitude, keep);

        self.set_state(DutyState::Sweeping);
        let result = self.sweep_cycles(amplitude, keep, epoch, &mut abort_rx, &mut finish_rx).await;
        self.finish_sequence("Sweep", result).await
    }

    /// Ask a running (or waiting) sweep to wind down through the stop procedure
    pub fn finish_sweep(&self) {
        self.sweep_finish.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    async fn sweep_cycles(
        &self,
        amplitude: i32,
        keep: Duration,
        epoch: u64,
        abort_rx: &mut watch::Receiver<u64>,
        finish_rx: &mut watch::Receiver<u64>,
    ) -> Result<()> {
        let step_delay = self.duty.step_delay();
        let mut cycles = 0u64;

        loop {
            let legs: [(Vec<i32>, Duration); 3] = [
                ((0..=amplitude).collect(), keep),
                ((-amplitude..=amplitude).rev().collect(), keep),
                ((-amplitude..=0).collect(), Duration::ZERO),
            ];

            for (steps, dwell) in legs {
                for percent in steps {
                    if finish_rx.has_changed().unwrap_or(true) {
                        return Ok(());
                    }
                    self.send_step(percent, epoch).await?;
                    if self.sweep_sleep(step_delay, epoch, abort_rx, finish_rx).await? {
                        return Ok(());
                    }
                }

                if !dwell.is_zero() && self.sweep_sleep(dwell, epoch, abort_rx, finish_rx).await? {
                    return Ok(());
                }
            }

            cycles += 1;
            debug!("Sweep cycle {} complete", cycles);
        }
    }

    /// Common ending for a sequence: stop on success or failure
    async fn finish_sequence(&self, label: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.stop_procedure().await?;
                info!("{} complete", label);
                Ok(())
            }
            Err(VescBridgeError::Aborted) => {
                warn!("{} aborted by emergency stop", label);
                Err(VescBridgeError::Aborted)
            }
            Err(e) => {
                error!("{} failed: {}", label, e);
                if let Err(stop_err) = self.stop_procedure().await {
                    error!("Stop procedure after failure also failed: {}", stop_err);
                }
                Err(e)
            }
        }
    }

    fn aborted_since(&self, epoch: u64) -> bool {
        *self.abort_epoch.borrow() != epoch
    }

    fn stopping(&self) -> bool {
        self.stops_running.load(Ordering::Acquire) > 0
    }

    /// Send one sequence step unless an emergency stop has started
    ///
    /// The epoch check and the write happen under one channel guard, so no
    /// step can land after the first emergency zero.
    async fn send_step(&self, percent: i32, epoch: u64) -> Result<()> {
        let frame = encode_duty_percent(percent);
        let mut guard = self.channel.lock().await;

        if self.aborted_since(epoch) {
            return Err(VescBridgeError::Aborted);
        }

        guard.send(&frame).await?;
        self.commanded.store(percent, Ordering::Release);
        debug!("Duty step {}%", percent);
        Ok(())
    }

    async fn interruptible_sleep(
        &self,
        duration: Duration,
        epoch: u64,
        abort_rx: &mut watch::Receiver<u64>,
    ) -> Result<()> {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = abort_rx.changed() => {
                    if changed.is_err() || *abort_rx.borrow_and_update() != epoch {
                        return Err(VescBridgeError::Aborted);
                    }
                }
            }
        }
    }

    /// Sleep between sweep steps; `Ok(true)` when a finish was requested
    async fn sweep_sleep(
        &self,
        duration: Duration,
        epoch: u64,
        abort_rx: &mut watch::Receiver<u64>,
        finish_rx: &mut watch::Receiver<u64>,
    ) -> Result<bool> {
        tokio::select! {
            result = self.interruptible_sleep(duration, epoch, abort_rx) => result.map(|()| false),
            _ = finish_rx.changed() => Ok(true),
        }
    }

    /// Cooperative stop: ends any sweep, waits for the running sequence,
    /// then stops
    pub async fn hard_stop(&self) -> Result<()> {
        self.finish_sweep();
        let _sequence = self.sequence_lock.lock().await;
        info!("Hard stop");
        self.stop_procedure().await
    }

    /// Immediate stop that does not wait for the sequence lock
    ///
    /// Cancels any in-progress sequence (it returns `Aborted` at its next
    /// step or sleep) and any sequence still waiting to start, then runs
    /// the stop procedure right away.
    pub async fn emergency_stop(&self) -> Result<()> {
        self.abort_epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
        warn!("EMERGENCY STOP");
        self.stop_procedure().await
    }

    /// Force the motor to zero torque
    ///
    /// 1. burst of zero-duty commands
    /// 2. zero current to leave duty-control mode
    /// 3. sustained zero-duty repeats
    /// 4. clear serial buffers
    /// 5. optional zero-current reconfirmation
    ///
    /// Every step is attempted even if an earlier one failed; the first
    /// failure is returned. The state returns to `Idle` only when the last
    /// of several overlapping stop procedures finishes.
    async fn stop_procedure(&self) -> Result<()> {
        self.stops_running.fetch_add(1, Ordering::AcqRel);
        self.set_state(DutyState::Stopping);

        let zero_duty = encode_duty_percent(0);
        let zero_current = encode_command(&VescCommand::SetCurrent(0));
        let mut first_error = None;

        let burst_interval = Duration::from_millis(self.stop.zero_burst_interval_ms);
        for i in 0..self.stop.zero_burst_count {
            note_failure("zero duty burst", self.channel.send(&zero_duty).await, &mut first_error);
            if i + 1 < self.stop.zero_burst_count {
                tokio::time::sleep(burst_interval).await;
            }
        }

        note_failure("zero current", self.channel.send(&zero_current).await, &mut first_error);

        let sustain_interval = Duration::from_millis(self.stop.sustain_interval_ms);
        for _ in 0..self.stop.sustain_repeats {
            note_failure("sustained zero duty", self.channel.send(&zero_duty).await, &mut first_error);
            tokio::time::sleep(sustain_interval).await;
        }

        note_failure("buffer clear", self.channel.clear_buffers().await, &mut first_error);

        if self.stop.reconfirm_current {
            note_failure("zero current reconfirm", self.channel.send(&zero_current).await, &mut first_error);
        }

        self.commanded.store(0, Ordering::Release);
        if self.stops_running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.set_state(DutyState::Idle);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Motor stopped");
                Ok(())
            }
        }
    }
}

fn note_failure(step: &str, result: Result<()>, first_error: &mut Option<VescBridgeError>) {
    if let Err(e) = result {
        warn!("Stop step '{}' failed: {}", step, e);
        first_error.get_or_insert(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::port_trait::mocks::MockSerialPort;
    use crate::vesc::decoder::extract_frames;
    use crate::vesc::protocol::{COMM_SET_CURRENT, COMM_SET_DUTY};
    use std::io;
    use std::sync::Arc;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Sent {
        Duty(i32),
        Current(i32),
    }

    fn controller_with(stop_mode: StopMode) -> (Arc<DutyController>, MockSerialPort) {
        let mock = MockSerialPort::new();
        let channel = SerialChannel::new(mock.clone(), Duration::from_millis(10));
        let duty = DutyConfig {
            max_duty: 10,
            step_delay_ms: 50,
            hold_time_ms: 1000,
            stop_mode,
            ..DutyConfig::default()
        };
        (Arc::new(DutyController::new(channel, duty, StopConfig::default())), mock)
    }

    fn controller() -> (Arc<DutyController>, MockSerialPort) {
        controller_with(StopMode::Immediate)
    }

    /// Decode every written frame into the command it carries
    fn sent_commands(mock: &MockSerialPort) -> Vec<Sent> {
        mock.get_written_data()
            .iter()
            .map(|frame| {
                let scan = extract_frames(frame);
                assert_eq!(scan.payloads.len(), 1, "each write is exactly one frame");
                let payload = &scan.payloads[0];
                let value = i32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
                match payload[0] {
                    COMM_SET_DUTY => Sent::Duty(value / 1000),
                    COMM_SET_CURRENT => Sent::Current(value),
                    other => panic!("unexpected command id {}", other),
                }
            })
            .collect()
    }

    fn stop_commands() -> Vec<Sent> {
        let stop = StopConfig::default();
        let mut commands = vec![Sent::Duty(0); stop.zero_burst_count as usize];
        commands.push(Sent::Current(0));
        commands.extend(vec![Sent::Duty(0); stop.sustain_repeats as usize]);
        commands.push(Sent::Current(0));
        commands
    }

    fn session_commands(target: i32) -> Vec<Sent> {
        let direction = target.signum();
        let mut commands: Vec<Sent> = (1..=target.abs()).map(|m| Sent::Duty(direction * m)).collect();
        commands.push(Sent::Duty(target));
        commands.extend(stop_commands());
        commands
    }

    #[tokio::test]
    async fn test_set_duty_clamps_to_full_scale() {
        let (controller, mock) = controller();

        controller.set_duty(150).await.unwrap();
        controller.set_duty(-150).await.unwrap();

        let written = mock.get_written_data();
        assert_eq!(written[0], encode_command(&VescCommand::SetDutyCycle(100_000)));
        assert_eq!(written[1], encode_command(&VescCommand::SetDutyCycle(-100_000)));
        assert_eq!(controller.commanded_duty(), -100);
    }

    #[tokio::test]
    async fn test_set_duty_write_error_propagates() {
        let (controller, mock) = controller();
        mock.set_write_error(io::ErrorKind::BrokenPipe);

        assert!(matches!(controller.set_duty(5).await, Err(VescBridgeError::Serial(_))));
        assert_eq!(controller.commanded_duty(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_and_hold_sequence() {
        let (controller, mock) = controller();
        let start = Instant::now();

        controller.ramp_and_hold(10, Duration::from_secs(1)).await.unwrap();

        assert_eq!(sent_commands(&mock), session_commands(10));
        assert_eq!(mock.clear_count(), 1);
        assert_eq!(controller.state(), DutyState::Idle);
        assert_eq!(controller.commanded_duty(), 0);

        // 10 steps, hold, then the stop procedure's own sleeps
        assert!(start.elapsed() >= Duration::from_millis(10 * 50 + 1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_never_exceeds_max_duty() {
        let (controller, mock) = controller();

        controller.ramp_and_hold(80, Duration::from_millis(100)).await.unwrap();

        let duties: Vec<i32> = sent_commands(&mock)
            .into_iter()
            .filter_map(|c| match c {
                Sent::Duty(d) => Some(d),
                Sent::Current(_) => None,
            })
            .collect();
        assert_eq!(duties.iter().map(|d| d.abs()).max(), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_target_ramps_in_reverse() {
        let (controller, mock) = controller();

        controller.ramp_and_hold(-3, Duration::ZERO).await.unwrap();

        assert_eq!(sent_commands(&mock), session_commands(-3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_down_mode_steps_back_to_zero() {
        let (controller, mock) = controller_with(StopMode::RampDown);

        controller.ramp_and_hold(10, Duration::from_millis(200)).await.unwrap();

        let duties: Vec<i32> = sent_commands(&mock)
            .into_iter()
            .filter_map(|c| match c {
                Sent::Duty(d) => Some(d),
                Sent::Current(_) => None,
            })
            .collect();

        let mut expected: Vec<i32> = (1..=10).collect();
        expected.push(10);
        expected.extend((0..10).rev());
        assert_eq!(&duties[..expected.len()], expected.as_slice());

        for pair in duties.windows(2) {
            assert!((pair[1] - pair[0]).abs() <= 1, "jump from {} to {}", pair[0], pair[1]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sessions_do_not_interleave() {
        let (controller, mock) = controller();

        let a = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ramp_and_hold(3, Duration::from_millis(100)).await })
        };
        let b = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ramp_and_hold(-3, Duration::from_millis(100)).await })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let sent = sent_commands(&mock);
        let a_then_b = [session_commands(3), session_commands(-3)].concat();
        let b_then_a = [session_commands(-3), session_commands(3)].concat();
        assert!(sent == a_then_b || sent == b_then_a, "interleaved: {:?}", sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_interrupts_session() {
        let (controller, mock) = controller();
        let start = Instant::now();

        let session = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ramp_and_hold(10, Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_millis(120)).await;
        controller.emergency_stop().await.unwrap();

        assert!(matches!(session.await.unwrap(), Err(VescBridgeError::Aborted)));
        assert!(start.elapsed() < Duration::from_secs(2));

        let sent = sent_commands(&mock);
        let first_zero = sent.iter().position(|c| *c == Sent::Duty(0)).unwrap();
        assert!(first_zero > 0);
        assert!(
            sent[first_zero..].iter().all(|c| matches!(c, Sent::Duty(0) | Sent::Current(0))),
            "nonzero command after emergency stop: {:?}",
            sent
        );
        assert_eq!(&sent[first_zero..], stop_commands().as_slice());
        assert_eq!(controller.state(), DutyState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_cancels_waiting_session() {
        let (controller, mock) = controller();

        let running = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ramp_and_hold(2, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ramp_and_hold(5, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        controller.emergency_stop().await.unwrap();

        assert!(matches!(running.await.unwrap(), Err(VescBridgeError::Aborted)));
        assert!(matches!(waiting.await.unwrap(), Err(VescBridgeError::Aborted)));
        assert!(!sent_commands(&mock).contains(&Sent::Duty(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_after_emergency_stop_runs_normally() {
        let (controller, mock) = controller();

        controller.emergency_stop().await.unwrap();
        controller.ramp_and_hold(2, Duration::ZERO).await.unwrap();

        let expected = [stop_commands(), session_commands(2)].concat();
        assert_eq!(sent_commands(&mock), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_still_runs_stop_procedure() {
        let (controller, mock) = controller();
        // Writes are recorded before the flush fails
        mock.set_flush_error(io::ErrorKind::TimedOut);

        match controller.ramp_and_hold(5, Duration::from_secs(1)).await {
            Err(VescBridgeError::Serial(msg)) => assert!(msg.contains("flush")),
            other => panic!("Expected Serial error, got: {:?}", other),
        }

        let mut expected = vec![Sent::Duty(1)];
        expected.extend(stop_commands());
        assert_eq!(sent_commands(&mock), expected);
        assert_eq!(mock.clear_count(), 1);
        assert_eq!(controller.state(), DutyState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_procedure_continues_past_failures() {
        let (controller, mock) = controller();
        mock.set_write_error(io::ErrorKind::BrokenPipe);

        let result = controller.hard_stop().await;

        assert!(matches!(result, Err(VescBridgeError::Serial(_))));
        // The buffer clear is still attempted after every write failed
        assert_eq!(mock.clear_count(), 1);
        assert_eq!(controller.state(), DutyState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_stop_waits_for_session() {
        let (controller, mock) = controller();

        let session = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ramp_and_hold(2, Duration::from_millis(300)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        controller.hard_stop().await.unwrap();
        session.await.unwrap().unwrap();

        let expected = [session_commands(2), stop_commands()].concat();
        assert_eq!(sent_commands(&mock), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconfirm_when_disabled() {
        let mock = MockSerialPort::new();
        let channel = SerialChannel::new(mock.clone(), Duration::from_millis(10));
        let stop = StopConfig {
            reconfirm_current: false,
            ..StopConfig::default()
        };
        let controller = DutyController::new(channel, DutyConfig::default(), stop);

        controller.hard_stop().await.unwrap();

        let sent = sent_commands(&mock);
        assert_eq!(sent.iter().filter(|c| **c == Sent::Current(0)).count(), 1);
        assert_eq!(sent.last(), Some(&Sent::Duty(0)));
    }

    fn duties(sent: &[Sent]) -> Vec<i32> {
        sent.iter()
            .filter_map(|c| match c {
                Sent::Duty(d) => Some(*d),
                Sent::Current(_) => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_duty_waiting_behind_session_dropped_by_emergency_stop() {
        let (controller, mock) = controller();

        let session = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ramp_and_hold(2, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let write = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.set_duty(7).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        controller.emergency_stop().await.unwrap();

        assert!(matches!(session.await.unwrap(), Err(VescBridgeError::Aborted)));
        assert!(matches!(write.await.unwrap(), Err(VescBridgeError::Aborted)));
        assert!(!sent_commands(&mock).contains(&Sent::Duty(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_duty_rejected_while_stop_runs() {
        let (controller, mock) = controller();

        let stop = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.emergency_stop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(controller.set_duty(5).await, Err(VescBridgeError::Aborted)));
        assert_ok!(controller.set_duty(0).await);

        stop.await.unwrap().unwrap();
        assert!(!sent_commands(&mock).contains(&Sent::Duty(5)));

        // Once the stop is over, duty commands go through again
        assert_ok!(controller.set_duty(5).await);
        assert_eq!(sent_commands(&mock).last(), Some(&Sent::Duty(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_stops_stay_stopping_until_last_finishes() {
        let (controller, _mock) = controller();

        let session = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ramp_and_hold(1, Duration::ZERO).await })
        };
        // Session's own stop procedure runs from about 50ms to 390ms
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.state(), DutyState::Stopping);

        let emergency = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.emergency_stop().await })
        };
        tokio::time::sleep(Duration::from_millis(315)).await;

        assert!(session.is_finished());
        assert_ok!(session.await.unwrap());
        assert!(!emergency.is_finished());
        assert_eq!(controller.state(), DutyState::Stopping);

        emergency.await.unwrap().unwrap();
        assert_eq!(controller.state(), DutyState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_cycles_until_finished() {
        let (controller, mock) = controller();

        let sweep = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run_sweep(3, Duration::from_millis(100)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.state(), DutyState::Sweeping);

        // One cycle takes 15 steps of 50ms plus two 100ms dwells
        tokio::time::sleep(Duration::from_millis(1200)).await;
        controller.finish_sweep();
        assert_ok!(sweep.await.unwrap());

        let sent = sent_commands(&mock);
        let stop = stop_commands();
        assert_eq!(&sent[sent.len() - stop.len()..], stop.as_slice());

        let swept = duties(&sent[..sent.len() - stop.len()]);
        let cycle = [0, 1, 2, 3, 3, 2, 1, 0, -1, -2, -3, -3, -2, -1, 0];
        assert_eq!(&swept[..cycle.len()], cycle.as_slice());
        assert!(swept.len() > cycle.len(), "second cycle never started");
        assert_eq!(swept[cycle.len()], 0);
        for pair in swept.windows(2) {
            assert!((pair[1] - pair[0]).abs() <= 1, "jump from {} to {}", pair[0], pair[1]);
        }
        assert_eq!(mock.clear_count(), 1);
        assert_eq!(controller.state(), DutyState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_amplitude_clamped_to_max_duty() {
        let (controller, mock) = controller();

        let sweep = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run_sweep(50, Duration::ZERO).await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        controller.finish_sweep();
        assert_ok!(sweep.await.unwrap());

        let swept = duties(&sent_commands(&mock));
        assert_eq!(swept.iter().max(), Some(&10));
        assert_eq!(swept.iter().min(), Some(&-10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_aborts_sweep() {
        let (controller, mock) = controller();

        let sweep = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run_sweep(3, Duration::from_millis(100)).await })
        };
        tokio::time::sleep(Duration::from_millis(320)).await;

        let before = mock.get_written_data().len();
        controller.emergency_stop().await.unwrap();

        assert_err!(sweep.await.unwrap());
        assert_eq!(&sent_commands(&mock)[before..], stop_commands().as_slice());
        assert_eq!(controller.state(), DutyState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_stop_ends_sweep() {
        let (controller, mock) = controller();

        let sweep = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run_sweep(2, Duration::ZERO).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        controller.hard_stop().await.unwrap();
        assert_ok!(sweep.await.unwrap());

        let sent = sent_commands(&mock);
        let both_stops = [stop_commands(), stop_commands()].concat();
        assert_eq!(&sent[sent.len() - both_stops.len()..], both_stops.as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_finished_while_waiting_never_starts() {
        let (controller, mock) = controller();

        let session = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ramp_and_hold(2, Duration::from_millis(300)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sweep = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run_sweep(3, Duration::ZERO).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.finish_sweep();

        assert_ok!(session.await.unwrap());
        assert_ok!(sweep.await.unwrap());
        assert_eq!(sent_commands(&mock), session_commands(2));
    }
}
