//! Serialization of readings for the data logs

use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sensor::encoder::format_value;
use crate::sensor::protocol::{ParamCode, ParameterTable, Reading, Validity};

/// Data log serialization format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One row per reading, columns in table order
    Csv,

    /// One self-describing JSON record per line
    Json,

    /// Raw frame echo tagged with time and validity
    Tagged,
}

impl LogFormat {
    /// File name kind (`<prefix><kind>_<timestamp>.<ext>`)
    pub fn kind(self) -> &'static str {
        match self {
            LogFormat::Csv | LogFormat::Json => "Data",
            LogFormat::Tagged => "Raw",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            LogFormat::Csv => "csv",
            LogFormat::Json => "jsonl",
            LogFormat::Tagged => "log",
        }
    }

    /// First line of a new file, if the format has one
    pub fn header(self, table: &ParameterTable) -> Option<String> {
        match self {
            LogFormat::Csv => Some(csv_header(table)),
            LogFormat::Json | LogFormat::Tagged => None,
        }
    }

    /// Serialize a reading as one line, terminator included
    pub fn record(self, table: &ParameterTable, reading: &Reading) -> String {
        match self {
            LogFormat::Csv => csv_record(table, reading),
            LogFormat::Json => json_record(table, reading),
            LogFormat::Tagged => tagged_record(reading),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Csv => "csv",
            LogFormat::Json => "json",
            LogFormat::Tagged => "tagged",
        })
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(LogFormat::Csv),
            "json" => Ok(LogFormat::Json),
            "tagged" => Ok(LogFormat::Tagged),
            other => Err(format!("unknown log format '{}' (expected csv, json or tagged)", other)),
        }
    }
}

/// Timestamp as written in every log
pub fn format_timestamp(ts: &DateTime<Local>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, false)
}

fn csv_header(table: &ParameterTable) -> String {
    let mut line = String::from("timestamp,valid");
    for spec in table.iter() {
        line.push(',');
        line.push_str(spec.code.as_str());
    }
    line.push('\n');
    line
}

fn csv_record(table: &ParameterTable, reading: &Reading) -> String {
    let mut line = format_timestamp(&reading.timestamp());
    line.push(',');
    line.push_str(if reading.is_valid() { "1" } else { "0" });
    for spec in table.iter() {
        line.push(',');
        if let Some(value) = reading.get(spec.code) {
            line.push_str(&format_value(table, spec.code, value));
        }
    }
    line.push('\n');
    line
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    timestamp: String,
    valid: bool,
    values: serde_json::Map<String, serde_json::Value>,
    out_of_range: Vec<&'a str>,
}

fn json_record(table: &ParameterTable, reading: &Reading) -> String {
    let values = reading
        .values()
        .iter()
        .map(|&(code, value)| (code.as_str().to_string(), rounded(table, code, value).into()))
        .collect();

    let out_of_range = match reading.validity() {
        Validity::Valid => Vec::new(),
        Validity::Invalid { out_of_range } => out_of_range.iter().map(|c| c.as_str()).collect(),
    };

    let record = JsonRecord {
        timestamp: format_timestamp(&reading.timestamp()),
        valid: reading.is_valid(),
        values,
        out_of_range,
    };

    // Values are finite by construction, so serialization cannot fail
    let mut line = serde_json::to_string(&record).unwrap_or_default();
    line.push('\n');
    line
}

fn rounded(table: &ParameterTable, code: ParamCode, value: f64) -> f64 {
    let text = format_value(table, code, value);
    text.parse().unwrap_or(value)
}

fn tagged_record(reading: &Reading) -> String {
    format!(
        "{}\t{}\t{}\n",
        format_timestamp(&reading.timestamp()),
        if reading.is_valid() { "VALID" } else { "INVALID" },
        reading.raw()
    )
}
