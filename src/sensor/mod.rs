//! # Sensor Protocol Module
//!
//! Handles the line-oriented ASCII protocol of the ultrasonic wind sensor.
//!
//! This module handles:
//! - Framing the serial byte stream into lines ([`framer`])
//! - Decoding a line into an unvalidated [`protocol::Sample`] ([`decoder`])
//! - Validating samples into labelled [`protocol::Reading`]s ([`validator`])
//! - Formatting values at parameter precision ([`encoder`])

pub mod decoder;
pub mod encoder;
pub mod framer;
pub mod protocol;
pub mod validator;
