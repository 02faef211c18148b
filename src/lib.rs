//! # TriSonica Logger Library
//!
//! Unattended serial data logger for TriSonica ultrasonic wind sensors.
//!
//! This library provides the ingestion pipeline: serial port discovery,
//! framing and decoding of the sensor's ASCII output, plausibility
//! validation, rolling statistics, and rotated log files, supervised by a
//! reconnecting session controller.

pub mod config;
pub mod error;
pub mod sensor;
pub mod serial;
pub mod session;
pub mod stats;
pub mod telemetry;
