//! Relay trigger events with debounce and lockout
//!
//! The relay board exposes two edges, forward and reverse. Each has its own
//! filter: an edge arriving within `debounce` of the previous raw edge is
//! contact bounce, and an edge within `lockout` of the last accepted edge is
//! a repeat press. Both stack with the coordinator's cooldown.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::InputEvent;
use crate::config::RelayConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerEvent {
    Forward,
    Reverse,
}

impl TriggerEvent {
    /// Direction of the duty this trigger requests
    pub fn direction(self) -> i32 {
        match self {
            TriggerEvent::Forward => 1,
            TriggerEvent::Reverse => -1,
        }
    }
}

/// Edge filter for one trigger line
#[derive(Debug, Clone)]
pub struct TriggerFilter {
    debounce: Duration,
    lockout: Duration,
    last_edge: Option<Instant>,
    last_accepted: Option<Instant>,
}

impl TriggerFilter {
    pub fn new(debounce: Duration, lockout: Duration) -> Self {
        Self {
            debounce,
            lockout,
            last_edge: None,
            last_accepted: None,
        }
    }

    /// Record a raw edge at `now`; true if it should be acted on
    pub fn accept(&mut self, now: Instant) -> bool {
        let bounced = self
            .last_edge
            .is_some_and(|prev| now.saturating_duration_since(prev) < self.debounce);
        self.last_edge = Some(now);
        if bounced {
            return false;
        }

        let locked = self
            .last_accepted
            .is_some_and(|prev| now.saturating_duration_since(prev) < self.lockout);
        if locked {
            return false;
        }

        self.last_accepted = Some(now);
        true
    }
}

/// Filters raw edges and forwards accepted ones to the coordinator
#[derive(Debug)]
pub struct TriggerSource {
    events: mpsc::Sender<InputEvent>,
    forward: TriggerFilter,
    reverse: TriggerFilter,
}

impl TriggerSource {
    pub fn new(events: mpsc::Sender<InputEvent>, config: &RelayConfig) -> Self {
        let debounce = Duration::from_millis(config.debounce_ms);
        let lockout = Duration::from_millis(config.lockout_ms);

        Self {
            events,
            forward: TriggerFilter::new(debounce, lockout),
            reverse: TriggerFilter::new(debounce, lockout),
        }
    }

    /// Handle a raw edge; returns true if it was forwarded
    pub fn edge(&mut self, event: TriggerEvent) -> bool {
        let filter = match event {
            TriggerEvent::Forward => &mut self.forward,
            TriggerEvent::Reverse => &mut self.reverse,
        };

        if !filter.accept(Instant::now()) {
            debug!("{:?} edge filtered (debounce/lockout)", event);
            return false;
        }

        match self.events.try_send(InputEvent::Trigger(event)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping {:?} trigger: {}", event, e);
                false
            }
        }
    }
}
