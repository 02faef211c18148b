//! # Sensor Value Encoder
//!
//! Serializes decoded values back into text at each parameter's configured
//! precision. Used by the tabular log format and by the raw-frame echo.

use super::protocol::{ParamCode, ParameterTable};

/// Format one value at the precision of its parameter
///
/// # Examples
///
/// ```
/// use trisonica_logger::sensor::encoder::format_value;
/// use trisonica_logger::sensor::protocol::{ParamCode, ParameterTable};
///
/// let table = ParameterTable::builtin();
/// assert_eq!(format_value(&table, ParamCode::S, 3.2), "3.20");
/// assert_eq!(format_value(&table, ParamCode::D, 185.0), "185.0");
/// ```
pub fn format_value(table: &ParameterTable, code: ParamCode, value: f64) -> String {
    format!("{:.*}", table.get(code).precision, value)
}

/// Encode values as a `CODE=VALUE` frame
///
/// The output is accepted by [`decode_frame`](super::decoder::decode_frame),
/// reproducing each value to within its precision.
pub fn encode_values(table: &ParameterTable, values: &[(ParamCode, f64)]) -> String {
    values
        .iter()
        .map(|&(code, value)| format!("{}={}", code, format_value(table, code, value)))
        .collect::<Vec<_>>()
        .join(" ")
}
