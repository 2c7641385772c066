//! Telemetry Poller
//!
//! Background task that requests GET_VALUES on a fixed tick, reassembles the
//! responses and hands decoded samples to a sink.
//!
//! States: `Stopped → Running ⇄ Paused → Stopped`. The desired state is
//! published on a watch channel and re-read under the channel guard right
//! before each request is written, so once `pause` returns no request can
//! follow any write made by someone else.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::sink::TelemetrySink;
use crate::config::TelemetryConfig;
use crate::error::Result;
use crate::serial::SerialChannel;
use crate::vesc::decoder::{decode_get_values, FrameBuffer};
use crate::vesc::encoder::encode_command;
use crate::vesc::protocol::{TelemetrySample, VescCommand};

/// Log an empty read only every this many occurrences
const EMPTY_READ_LOG_EVERY: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Stopped,
    Running,
    Paused,
}

/// Counters for one poller run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollerStats {
    pub requests: u64,
    pub reads: u64,
    pub empty_reads: u64,
    pub frames: u64,
    pub samples: u64,
    pub decode_failures: u64,
    pub crc_errors: u64,
    pub buffer_overflows: u64,
    pub channel_errors: u64,
    pub sink_errors: u64,
}

/// A decoded sample and when it arrived relative to the run start
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedSample {
    pub elapsed: Duration,
    pub sample: TelemetrySample,
}

struct PollerRun {
    task: JoinHandle<PollerStats>,
    timer: Option<JoinHandle<()>>,
}

/// Periodic GET_VALUES poller sharing the serial channel
pub struct TelemetryPoller {
    channel: SerialChannel,
    config: TelemetryConfig,
    control: Arc<watch::Sender<PollerState>>,
    latest: Arc<watch::Sender<Option<TimedSample>>>,
    run: Mutex<Option<PollerRun>>,
}

impl std::fmt::Debug for TelemetryPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPoller")
            .field("state", &self.state())
            .field("interval_ms", &self.config.interval_ms)
            .finish_non_exhaustive()
    }
}

impl TelemetryPoller {
    pub fn new(channel: SerialChannel, config: TelemetryConfig) -> Self {
        let (control, _) = watch::channel(PollerState::Stopped);
        let (latest, _) = watch::channel(None);

        Self {
            channel,
            config,
            control: Arc::new(control),
            latest: Arc::new(latest),
            run: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PollerState {
        *self.control.borrow()
    }

    /// Most recent sample of the current or last run
    pub fn latest(&self) -> Option<TimedSample> {
        *self.latest.borrow()
    }

    /// Poll continuously until [`stop`](Self::stop)
    ///
    /// A run already in progress is stopped first; every run starts with an
    /// empty receive buffer and fresh counters.
    pub async fn start(&self, sink: Box<dyn TelemetrySink>) {
        self.start_run(sink, None).await;
    }

    /// Poll for `duration`, then stop on an independent timer
    pub async fn start_temporary(&self, duration: Duration, sink: Box<dyn TelemetrySink>) {
        self.start_run(sink, Some(duration)).await;
    }

    async fn start_run(&self, sink: Box<dyn TelemetrySink>, duration: Option<Duration>) {
        let mut run = self.run.lock().await;
        if let Some(previous) = run.take() {
            info!("Restarting telemetry poller");
            self.finish_run(previous).await;
        }

        self.control.send_replace(PollerState::Running);
        self.latest.send_replace(None);

        let task = tokio::spawn(poll_loop(
            self.channel.clone(),
            self.config.clone(),
            self.control.subscribe(),
            self.latest.clone(),
            sink,
        ));

        let timer = duration.map(|duration| {
            let control = self.control.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                info!("Telemetry capture window of {:?} elapsed", duration);
                control.send_replace(PollerState::Stopped);
            })
        });

        match duration {
            Some(d) => info!("Telemetry poller started for {:?}", d),
            None => info!("Telemetry poller started"),
        }

        *run = Some(PollerRun { task, timer });
    }

    /// Suspend polling without closing the sink; returns false if not running
    pub fn pause(&self) -> bool {
        let paused = self.control.send_if_modified(|state| {
            if *state == PollerState::Running {
                *state = PollerState::Paused;
                true
            } else {
                false
            }
        });

        if paused {
            debug!("Telemetry poller paused");
        }
        paused
    }

    /// Resume a paused poller; returns false if it was not paused
    pub fn resume(&self) -> bool {
        let resumed = self.control.send_if_modified(|state| {
            if *state == PollerState::Paused {
                *state = PollerState::Running;
                true
            } else {
                false
            }
        });

        if resumed {
            debug!("Telemetry poller resumed");
        }
        resumed
    }

    /// Stop polling, flush the sink and return the run's counters
    ///
    /// Idempotent: returns `None` when nothing was running. Waits at most
    /// `join_timeout_ms` for the task, then aborts it.
    pub async fn stop(&self) -> Option<PollerStats> {
        let run = self.run.lock().await.take()?;
        self.finish_run(run).await
    }

    async fn finish_run(&self, mut run: PollerRun) -> Option<PollerStats> {
        self.control.send_replace(PollerState::Stopped);
        if let Some(timer) = run.timer.take() {
            timer.abort();
        }

        let join_timeout = Duration::from_millis(self.config.join_timeout_ms);
        match tokio::time::timeout(join_timeout, &mut run.task).await {
            Ok(Ok(stats)) => {
                info!(
                    "Telemetry poller stopped: {} samples, {} empty reads, {} decode failures, {} CRC errors",
                    stats.samples, stats.empty_reads, stats.decode_failures, stats.crc_errors
                );
                Some(stats)
            }
            Ok(Err(e)) => {
                error!("Telemetry task failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Telemetry poller did not stop within {:?}, aborting", join_timeout);
                run.task.abort();
                None
            }
        }
    }
}

async fn poll_loop(
    channel: SerialChannel,
    config: TelemetryConfig,
    mut control: watch::Receiver<PollerState>,
    latest: Arc<watch::Sender<Option<TimedSample>>>,
    mut sink: Box<dyn TelemetrySink>,
) -> PollerStats {
    let mut stats = PollerStats::default();
    let mut buffer = FrameBuffer::new(config.max_buffer_bytes);
    let response_wait = Duration::from_millis(config.response_wait_ms);
    let backoff = Duration::from_millis(config.error_backoff_ms);
    let started = Instant::now();

    if let Err(e) = channel.clear_buffers().await {
        warn!("Could not clear serial buffers before polling: {}", e);
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(config.interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let state = *control.borrow_and_update();
        match state {
            PollerState::Stopped => break,
            PollerState::Paused => {
                if control.changed().await.is_err() {
                    break;
                }
                continue;
            }
            PollerState::Running => {}
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        let tick = poll_once(&channel, &control, response_wait, &mut buffer, &mut stats).await;
        match tick {
            Ok(samples) => {
                for sample in samples {
                    let timed = TimedSample {
                        elapsed: started.elapsed(),
                        sample,
                    };
                    if let Err(e) = sink.write_sample(timed.elapsed, &timed.sample) {
                        stats.sink_errors += 1;
                        warn!("Telemetry sink write failed: {}", e);
                    }
                    latest.send_replace(Some(timed));
                }
            }
            Err(e) => {
                stats.channel_errors += 1;
                warn!("Telemetry poll failed: {}", e);

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    changed = control.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    if let Err(e) = sink.flush() {
        warn!("Telemetry sink flush failed: {}", e);
    }

    stats
}

/// Send one request, wait for the reply and decode whatever arrived
///
/// Nothing is sent if the poller left `Running` while waiting for the channel.
async fn poll_once(
    channel: &SerialChannel,
    control: &watch::Receiver<PollerState>,
    response_wait: Duration,
    buffer: &mut FrameBuffer,
    stats: &mut PollerStats,
) -> Result<Vec<TelemetrySample>> {
    {
        let mut guard = channel.lock().await;
        if *control.borrow() != PollerState::Running {
            debug!("Telemetry request skipped: poller no longer running");
            return Ok(Vec::new());
        }
        guard.send(&encode_command(&VescCommand::GetValues)).await?;
    }
    stats.requests += 1;

    // The controller needs time to answer; the channel lock is not held here
    tokio::time::sleep(response_wait).await;

    let data = channel.read_available().await?;
    stats.reads += 1;

    if data.is_empty() {
        stats.empty_reads += 1;
        if stats.empty_reads % EMPTY_READ_LOG_EVERY == 0 {
            debug!("No telemetry response ({} empty reads so far)", stats.empty_reads);
        }
        return Ok(Vec::new());
    }

    let fed = buffer.feed(&data);
    stats.crc_errors += fed.crc_errors as u64;
    if fed.discarded > 0 {
        stats.buffer_overflows += 1;
    }

    let mut samples = Vec::with_capacity(fed.payloads.len());
    for payload in fed.payloads {
        stats.frames += 1;
        match decode_get_values(&payload) {
            Ok(sample) => {
                stats.samples += 1;
                samples.push(sample);
            }
            Err(e) => {
                stats.decode_failures += 1;
                warn!("{}", e);
            }
        }
    }

    Ok(samples)
}
