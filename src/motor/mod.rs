//! # Motor Control Module
//!
//! Duty-cycle sequencing and the stop procedures that keep the motor from
//! being left in an uncommanded state.

pub mod duty;

pub use duty::{DutyController, DutyState};
