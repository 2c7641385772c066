//! # VESC Bridge Library
//!
//! Drive a VESC motor controller over UART with safe duty-cycle ramps and
//! GET_VALUES telemetry logging.
//!
//! This library provides the VESC framing codec, the shared serial channel,
//! the duty controller with its stop procedures, the telemetry poller and the
//! coordinator that connects relay triggers, toggle switches and a joystick
//! to the motor.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod input;
pub mod motor;
pub mod serial;
pub mod telemetry;
pub mod vesc;
