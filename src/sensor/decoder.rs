//! # Sensor Frame Decoder
//!
//! Decodes one ASCII frame into a [`Sample`].
//!
//! Fields are separated by commas and/or whitespace and come in two spellings,
//! which may be mixed within a frame:
//!
//! ```text
//! S=3.2 D=185.0 T=21.4 H=55.0
//! S 03.24, S2 03.20, D 185, T 21.40
//! ```
//!
//! Unknown codes are dropped so newer firmware with extra fields keeps
//! working. Decoding is pure: no I/O and no shared state.

use super::protocol::{CaptureTime, ParamCode, Sample};
use crate::error::{LoggerError, Result};

/// Decode a complete frame
///
/// # Arguments
///
/// * `frame` - One line of sensor output, without its terminator
/// * `captured` - Time the frame was received
///
/// # Returns
///
/// * `Result<Sample>` - Decoded values in frame order
///
/// # Errors
///
/// Returns `MalformedFrame` if:
/// - A code has no value
/// - A known code carries a non-numeric, NaN or infinite value
/// - A known code appears twice
/// - The frame contains no known parameter
pub fn decode_frame(frame: &str, captured: CaptureTime) -> Result<Sample> {
    let mut tokens = frame
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty());

    let mut values: Vec<(ParamCode, f64)> = Vec::new();

    while let Some(token) = tokens.next() {
        let (key, value) = match token.split_once('=') {
            Some((key, value)) => (key, value),
            None => match tokens.next() {
                Some(value) => (token, value),
                None => {
                    return Err(LoggerError::MalformedFrame(format!(
                        "field '{}' has no value",
                        token
                    )))
                }
            },
        };

        if key.is_empty() || value.is_empty() {
            return Err(LoggerError::MalformedFrame(format!(
                "incomplete field '{}'",
                token
            )));
        }

        let Some(code) = ParamCode::from_code(key) else {
            // Unknown code: dropped
            continue;
        };

        let value = parse_value(code, value)?;

        if values.iter().any(|(c, _)| *c == code) {
            return Err(LoggerError::MalformedFrame(format!(
                "duplicate field {}",
                code
            )));
        }

        values.push((code, value));
    }

    if values.is_empty() {
        return Err(LoggerError::MalformedFrame(
            "no recognized parameters".to_string(),
        ));
    }

    Ok(Sample::new(values, captured, frame))
}

/// Parse a numeric field value, rejecting NaN and infinities
fn parse_value(code: ParamCode, text: &str) -> Result<f64> {
    let value: f64 = text.parse().map_err(|_| {
        LoggerError::MalformedFrame(format!("{} value '{}' is not numeric", code, text))
    })?;

    if !value.is_finite() {
        return Err(LoggerError::MalformedFrame(format!(
            "{} value '{}' is not finite",
            code, text
        )));
    }

    Ok(value)
}
