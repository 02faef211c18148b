//! # Sensor Protocol Constants and Types
//!
//! Parameter vocabulary, plausibility table and the typed representation of
//! one sensor sample.
//!
//! A frame is parsed into a [`Sample`] (unvalidated). Only the validator turns
//! a `Sample` into a [`Reading`], so every `Reading` in the system carries a
//! definite [`Validity`].

use chrono::{DateTime, Local};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use crate::error::LoggerError;

/// Default serial baud rate of the sensor
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Frame terminator
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Number of parameter codes in the vocabulary
pub const NUM_PARAMETERS: usize = 18;

/// Parameter codes emitted by the sensor firmware
///
/// Declaration order is the stable column order used by tabular logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamCode {
    /// 3D wind speed
    S,
    /// 2D (horizontal) wind speed
    S2,
    /// 3D wind speed, alternate path set
    S3,
    /// Horizontal wind direction
    D,
    /// Vertical wind direction
    Dv,
    /// Wind vector, U component
    U,
    /// Wind vector, V component
    V,
    /// Wind vector, W component
    W,
    /// Air temperature
    T,
    /// Sonic temperature, path 1
    T1,
    /// Sonic temperature, path 2
    T2,
    /// Relative humidity
    H,
    /// Dew point
    Dp,
    /// Barometric pressure
    P,
    /// Pitch
    Pi,
    /// Roll
    Ro,
    /// Magnetic heading
    Md,
    /// True heading
    Td,
}

impl ParamCode {
    /// All codes in table order
    pub const ALL: [ParamCode; NUM_PARAMETERS] = [
        ParamCode::S,
        ParamCode::S2,
        ParamCode::S3,
        ParamCode::D,
        ParamCode::Dv,
        ParamCode::U,
        ParamCode::V,
        ParamCode::W,
        ParamCode::T,
        ParamCode::T1,
        ParamCode::T2,
        ParamCode::H,
        ParamCode::Dp,
        ParamCode::P,
        ParamCode::Pi,
        ParamCode::Ro,
        ParamCode::Md,
        ParamCode::Td,
    ];

    /// Wire spelling of the code
    pub fn as_str(self) -> &'static str {
        match self {
            ParamCode::S => "S",
            ParamCode::S2 => "S2",
            ParamCode::S3 => "S3",
            ParamCode::D => "D",
            ParamCode::Dv => "DV",
            ParamCode::U => "U",
            ParamCode::V => "V",
            ParamCode::W => "W",
            ParamCode::T => "T",
            ParamCode::T1 => "T1",
            ParamCode::T2 => "T2",
            ParamCode::H => "H",
            ParamCode::Dp => "DP",
            ParamCode::P => "P",
            ParamCode::Pi => "PI",
            ParamCode::Ro => "RO",
            ParamCode::Md => "MD",
            ParamCode::Td => "TD",
        }
    }

    /// Look up a code by its wire spelling (case-sensitive)
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == code)
    }

    /// Position in [`ParamCode::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ParamCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamCode {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_code(s)
            .ok_or_else(|| LoggerError::InvalidConfig(format!("unknown parameter code '{}'", s)))
    }
}

/// Static description of one parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    /// Parameter code
    pub code: ParamCode,

    /// Human readable name
    pub description: &'static str,

    /// Unit of measure
    pub unit: &'static str,

    /// Lowest plausible value (inclusive)
    pub min: f64,

    /// Highest plausible value (inclusive)
    pub max: f64,

    /// Decimal places used when serializing
    pub precision: usize,
}

impl ParameterSpec {
    const fn new(
        code: ParamCode,
        description: &'static str,
        unit: &'static str,
        min: f64,
        max: f64,
        precision: usize,
    ) -> Self {
        Self {
            code,
            description,
            unit,
            min,
            max,
            precision,
        }
    }

    /// Whether `value` lies inside the plausible range
    pub fn in_range(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Built-in plausibility defaults, in table order
const BUILTIN_SPECS: [ParameterSpec; NUM_PARAMETERS] = [
    ParameterSpec::new(ParamCode::S, "Wind speed (3D)", "m/s", 0.0, 60.0, 2),
    ParameterSpec::new(ParamCode::S2, "Wind speed (2D)", "m/s", 0.0, 60.0, 2),
    ParameterSpec::new(ParamCode::S3, "Wind speed (3D, alt)", "m/s", 0.0, 60.0, 2),
    ParameterSpec::new(ParamCode::D, "Wind direction", "deg", 0.0, 360.0, 1),
    ParameterSpec::new(ParamCode::Dv, "Vertical direction", "deg", -90.0, 90.0, 1),
    ParameterSpec::new(ParamCode::U, "Wind U component", "m/s", -60.0, 60.0, 2),
    ParameterSpec::new(ParamCode::V, "Wind V component", "m/s", -60.0, 60.0, 2),
    ParameterSpec::new(ParamCode::W, "Wind W component", "m/s", -60.0, 60.0, 2),
    ParameterSpec::new(ParamCode::T, "Temperature", "°C", -40.0, 60.0, 1),
    ParameterSpec::new(ParamCode::T1, "Sonic temperature 1", "°C", -40.0, 60.0, 1),
    ParameterSpec::new(ParamCode::T2, "Sonic temperature 2", "°C", -40.0, 60.0, 1),
    ParameterSpec::new(ParamCode::H, "Relative humidity", "%", 0.0, 100.0, 1),
    ParameterSpec::new(ParamCode::Dp, "Dew point", "°C", -60.0, 60.0, 1),
    ParameterSpec::new(ParamCode::P, "Pressure", "hPa", 500.0, 1100.0, 1),
    ParameterSpec::new(ParamCode::Pi, "Pitch", "deg", -90.0, 90.0, 1),
    ParameterSpec::new(ParamCode::Ro, "Roll", "deg", -180.0, 180.0, 1),
    ParameterSpec::new(ParamCode::Md, "Magnetic heading", "deg", 0.0, 360.0, 1),
    ParameterSpec::new(ParamCode::Td, "True heading", "deg", 0.0, 360.0, 1),
];

/// Plausibility table, one entry per parameter code
///
/// Built once at startup (defaults plus configured overrides) and shared
/// read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterTable {
    specs: Vec<ParameterSpec>,
}

impl Default for ParameterTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ParameterTable {
    /// Table with the built-in defaults
    pub fn builtin() -> Self {
        Self {
            specs: BUILTIN_SPECS.to_vec(),
        }
    }

    /// Replace the range and/or precision of one parameter
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the resulting range is empty or inverted.
    pub fn with_override(
        mut self,
        code: ParamCode,
        min: Option<f64>,
        max: Option<f64>,
        precision: Option<usize>,
    ) -> crate::error::Result<Self> {
        let spec = &mut self.specs[code.index()];
        if let Some(min) = min {
            spec.min = min;
        }
        if let Some(max) = max {
            spec.max = max;
        }
        if let Some(precision) = precision {
            spec.precision = precision;
        }

        if !spec.min.is_finite() || !spec.max.is_finite() || spec.min >= spec.max {
            return Err(LoggerError::InvalidConfig(format!(
                "parameter {} range must satisfy min < max (got {}..{})",
                code, spec.min, spec.max
            )));
        }

        Ok(self)
    }

    /// Spec for one code
    pub fn get(&self, code: ParamCode) -> &ParameterSpec {
        &self.specs[code.index()]
    }

    /// All specs in table order
    pub fn iter(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.specs.iter()
    }
}

/// Capture time of a frame (monotonic + wall-clock)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureTime {
    /// Monotonic instant, for intervals
    pub monotonic: Instant,

    /// Wall-clock time, for log records
    pub wall: DateTime<Local>,
}

impl CaptureTime {
    /// Capture the current time
    pub fn now() -> Self {
        Self {
            monotonic: Instant::now(),
            wall: Local::now(),
        }
    }
}

/// A parsed but not yet validated frame
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    values: Vec<(ParamCode, f64)>,
    captured: CaptureTime,
    raw: String,
}

impl Sample {
    /// Create a sample from decoded values
    pub fn new(
        values: Vec<(ParamCode, f64)>,
        captured: CaptureTime,
        raw: impl Into<String>,
    ) -> Self {
        Self {
            values,
            captured,
            raw: raw.into(),
        }
    }

    /// Decoded values in frame order
    pub fn values(&self) -> &[(ParamCode, f64)] {
        &self.values
    }

    /// The frame text the sample was decoded from
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Capture time
    pub fn captured(&self) -> CaptureTime {
        self.captured
    }

    pub(crate) fn into_parts(self) -> (Vec<(ParamCode, f64)>, CaptureTime, String) {
        (self.values, self.captured, self.raw)
    }
}

/// Validation outcome of a reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    /// Every present parameter is inside its plausible range
    Valid,

    /// At least one parameter is out of range
    Invalid {
        /// Offending parameters, in frame order
        out_of_range: Vec<ParamCode>,
    },
}

/// A validated sensor reading
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    values: Vec<(ParamCode, f64)>,
    captured: CaptureTime,
    raw: String,
    validity: Validity,
}

impl Reading {
    pub(crate) fn new(sample: Sample, validity: Validity) -> Self {
        let (values, captured, raw) = sample.into_parts();
        Self {
            values,
            captured,
            raw,
            validity,
        }
    }

    /// Values in frame order
    pub fn values(&self) -> &[(ParamCode, f64)] {
        &self.values
    }

    /// Value of one parameter, if present
    pub fn get(&self, code: ParamCode) -> Option<f64> {
        self.values.iter().find(|(c, _)| *c == code).map(|(_, v)| *v)
    }

    /// Validation outcome
    pub fn validity(&self) -> &Validity {
        &self.validity
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.validity, Validity::Valid)
    }

    /// Capture time
    pub fn captured(&self) -> CaptureTime {
        self.captured
    }

    /// Wall-clock timestamp
    pub fn timestamp(&self) -> DateTime<Local> {
        self.captured.wall
    }

    /// Original frame text
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in ParamCode::ALL {
            assert_eq!(ParamCode::from_code(code.as_str()), Some(code));
        }
    }

    #[test]
    fn test_code_lookup_is_case_sensitive() {
        assert_eq!(ParamCode::from_code("PI"), Some(ParamCode::Pi));
        assert_eq!(ParamCode::from_code("pi"), None);
        assert_eq!(ParamCode::from_code("S1"), None);
    }

    #[test]
    fn test_index_matches_table_order() {
        let table = ParameterTable::builtin();
        for (i, spec) in table.iter().enumerate() {
            assert_eq!(spec.code.index(), i);
            assert_eq!(ParamCode::ALL[i], spec.code);
        }
    }

    #[test]
    fn test_builtin_ranges() {
        let table = ParameterTable::builtin();
        assert!(table.get(ParamCode::S).in_range(0.0));
        assert!(table.get(ParamCode::S).in_range(60.0));
        assert!(!table.get(ParamCode::S).in_range(60.01));
        assert!(!table.get(ParamCode::H).in_range(-0.1));
        assert!(table.get(ParamCode::D).in_range(360.0));
        assert!(!table.get(ParamCode::D).in_range(361.0));
    }

    #[test]
    fn test_override_range() {
        let table = ParameterTable::builtin()
            .with_override(ParamCode::S, None, Some(40.0), Some(3))
            .unwrap();
        assert_eq!(table.get(ParamCode::S).max, 40.0);
        assert_eq!(table.get(ParamCode::S).min, 0.0);
        assert_eq!(table.get(ParamCode::S).precision, 3);
    }

    #[test]
    fn test_override_inverted_range_rejected() {
        let result =
            ParameterTable::builtin().with_override(ParamCode::T, Some(50.0), Some(10.0), None);
        assert!(matches!(result, Err(LoggerError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_str_unknown_code() {
        assert!("XYZ".parse::<ParamCode>().is_err());
        assert_eq!("TD".parse::<ParamCode>().unwrap(), ParamCode::Td);
    }

    #[test]
    fn test_reading_accessors() {
        let sample = Sample::new(
            vec![(ParamCode::S, 3.2), (ParamCode::D, 185.0)],
            CaptureTime::now(),
            "S=3.2 D=185.0",
        );
        let reading = Reading::new(sample, Validity::Valid);
        assert!(reading.is_valid());
        assert_eq!(reading.get(ParamCode::S), Some(3.2));
        assert_eq!(reading.get(ParamCode::T), None);
        assert_eq!(reading.raw(), "S=3.2 D=185.0");
    }
}
