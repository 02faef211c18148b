//! # Reading Validator
//!
//! Checks every parameter of a [`Sample`] against the plausibility table and
//! labels the result. Out-of-range readings are not dropped here: they travel
//! downstream tagged invalid so sensor faults stay auditable.

use serde::Deserialize;
use std::fmt;

use super::protocol::{ParameterTable, Reading, Sample, Validity};

/// Policy for invalid readings in aggregated statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrictnessMode {
    /// Invalid readings never reach the statistics aggregator
    #[default]
    Exclude,

    /// Invalid readings are flagged but still aggregated
    Flag,
}

impl StrictnessMode {
    /// Whether `reading` should be fed to the statistics aggregator
    pub fn admits(self, reading: &Reading) -> bool {
        match self {
            StrictnessMode::Exclude => reading.is_valid(),
            StrictnessMode::Flag => true,
        }
    }
}

impl fmt::Display for StrictnessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrictnessMode::Exclude => f.write_str("exclude"),
            StrictnessMode::Flag => f.write_str("flag"),
        }
    }
}

impl std::str::FromStr for StrictnessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclude" => Ok(StrictnessMode::Exclude),
            "flag" => Ok(StrictnessMode::Flag),
            other => Err(format!("unknown strictness mode '{}' (expected exclude or flag)", other)),
        }
    }
}

/// Validate a sample against the plausibility table
///
/// A reading is invalid if **any** present parameter is out of range.
///
/// # Examples
///
/// ```
/// use trisonica_logger::sensor::decoder::decode_frame;
/// use trisonica_logger::sensor::protocol::{CaptureTime, ParameterTable};
/// use trisonica_logger::sensor::validator::validate;
///
/// let table = ParameterTable::builtin();
/// let sample = decode_frame("S=999.0 D=185.0", CaptureTime::now()).unwrap();
/// assert!(!validate(sample, &table).is_valid());
/// ```
pub fn validate(sample: Sample, table: &ParameterTable) -> Reading {
    let out_of_range: Vec<_> = sample
        .values()
        .iter()
        .filter(|(code, value)| !table.get(*code).in_range(*value))
        .map(|(code, _)| *code)
        .collect();

    let validity = if out_of_range.is_empty() {
        Validity::Valid
    } else {
        Validity::Invalid { out_of_range }
    };

    Reading::new(sample, validity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::decoder::decode_frame;
    use crate::sensor::protocol::{CaptureTime, ParamCode};

    fn reading(frame: &str) -> Reading {
        let table = ParameterTable::builtin();
        validate(decode_frame(frame, CaptureTime::now()).unwrap(), &table)
    }

    #[test]
    fn test_all_in_range_is_valid() {
        let r = reading("S=3.2 D=185.0 T=21.4 H=55.0");
        assert!(r.is_valid());
        assert_eq!(r.get(ParamCode::S), Some(3.2));
        assert_eq!(r.get(ParamCode::D), Some(185.0));
        assert_eq!(r.get(ParamCode::T), Some(21.4));
        assert_eq!(r.get(ParamCode::H), Some(55.0));
    }

    #[test]
    fn test_one_out_of_range_invalidates() {
        let r = reading("S=999.0 D=185.0");
        assert!(!r.is_valid());
        assert_eq!(
            r.validity(),
            &Validity::Invalid {
                out_of_range: vec![ParamCode::S]
            }
        );
        // The offending value is kept for auditing
        assert_eq!(r.get(ParamCode::S), Some(999.0));
    }

    #[test]
    fn test_multiple_out_of_range_listed_in_frame_order() {
        let r = reading("H=120 S=3 D=400");
        assert_eq!(
            r.validity(),
            &Validity::Invalid {
                out_of_range: vec![ParamCode::H, ParamCode::D]
            }
        );
    }

    #[test]
    fn test_range_bounds_inclusive() {
        assert!(reading("S=0 D=360 H=100").is_valid());
        assert!(!reading("S=-0.01").is_valid());
    }

    #[test]
    fn test_overridden_table_used() {
        let table = ParameterTable::builtin()
            .with_override(ParamCode::S, None, Some(20.0), None)
            .unwrap();
        let sample = decode_frame("S=25", CaptureTime::now()).unwrap();
        assert!(!validate(sample, &table).is_valid());
    }

    #[test]
    fn test_strictness_admits() {
        let valid = reading("S=3.2");
        let invalid = reading("S=999");

        assert!(StrictnessMode::Exclude.admits(&valid));
        assert!(!StrictnessMode::Exclude.admits(&invalid));
        assert!(StrictnessMode::Flag.admits(&valid));
        assert!(StrictnessMode::Flag.admits(&invalid));
    }

    #[test]
    fn test_strictness_from_str() {
        assert_eq!("exclude".parse::<StrictnessMode>().unwrap(), StrictnessMode::Exclude);
        assert_eq!("flag".parse::<StrictnessMode>().unwrap(), StrictnessMode::Flag);
        assert!("strict".parse::<StrictnessMode>().is_err());
        assert_eq!(StrictnessMode::default(), StrictnessMode::Exclude);
    }
}
