use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{job::estimate, Vector3};

/// Classifies one response line from the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validator {
    /// Plain `ok` acknowledgment.
    Ok,

    /// Elapsed time report, such as `echo:12 min, 3 sec`.
    Time,

    /// Coordinate report, such as `X:0.00 Y:-3.78 Z:0.15 E:0.00`.
    Xyz,
}

/// Value extracted by a [Validator] from a response line.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ResponseValue {
    /// Elapsed seconds.
    Seconds(u64),

    /// Parsed coordinate triple.
    Position(Vector3),
}

/// Outcome of applying a [Validator] to a line.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Verdict {
    /// Accepted and carried a value.
    Value(ResponseValue),

    /// Accepted.
    Pass,

    /// Not what this validator expects.
    Fail,
}

impl Validator {
    /// Classify `line`.
    pub fn validate(&self, line: &str) -> Verdict {
        let line = line.trim();
        match self {
            Self::Ok => {
                if is_ack(line) {
                    Verdict::Pass
                } else {
                    Verdict::Fail
                }
            }
            Self::Time => {
                let lower = line.to_ascii_lowercase();
                if !(lower.contains("time") || lower.contains("min") || lower.contains("sec")) {
                    return Verdict::Fail;
                }
                match estimate::sum_time_fields(line) {
                    Some(seconds) => Verdict::Value(ResponseValue::Seconds(seconds)),
                    None => Verdict::Fail,
                }
            }
            Self::Xyz => match parse_xyz(line) {
                Some(position) => Verdict::Value(ResponseValue::Position(position)),
                None => Verdict::Fail,
            },
        }
    }
}

/// Acknowledgment lines start with `ok`; Marlin may append a temperature
/// report (`ok T:210.0 /210.0`).
pub fn is_ack(line: &str) -> bool {
    let line = line.trim();
    line == "ok" || line.starts_with("ok ")
}

/// Lines with which firmware reports a failed command.
pub fn is_device_error(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("Error:") || line.starts_with("error:") || line.starts_with("!!")
}

fn parse_xyz(line: &str) -> Option<Vector3> {
    static XYZ: OnceLock<Regex> = OnceLock::new();
    let re = XYZ.get_or_init(|| {
        Regex::new(r"X:\s*(-?\d+(?:\.\d+)?)\s+Y:\s*(-?\d+(?:\.\d+)?)\s+Z:\s*(-?\d+(?:\.\d+)?)")
            .expect("static regex is valid")
    });
    let caps = re.captures(line)?;
    Some(Vector3 {
        x: caps[1].parse().ok()?,
        y: caps[2].parse().ok()?,
        z: caps[3].parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ok() {
        assert_eq!(Validator::Ok.validate("ok"), Verdict::Pass);
        assert_eq!(Validator::Ok.validate("ok T:210.0 /210.0 B:60.0 /60.0"), Verdict::Pass);
        assert_eq!(Validator::Ok.validate("echo:busy: processing"), Verdict::Fail);
        assert_eq!(Validator::Ok.validate("okay"), Verdict::Fail);
    }

    #[test]
    fn test_time() {
        assert_eq!(
            Validator::Time.validate("echo:12 min, 3 sec"),
            Verdict::Value(ResponseValue::Seconds(723))
        );
        assert_eq!(
            Validator::Time.validate("echo:Print time: 1h 0m 5s"),
            Verdict::Value(ResponseValue::Seconds(3605))
        );
        assert_eq!(Validator::Time.validate("ok"), Verdict::Fail);
    }

    #[test]
    fn test_xyz() {
        assert_eq!(
            Validator::Xyz.validate("X:0.20 Y:-3.78 Z:0.15 E:0.00 Count X: 0.20 Y:-3.78 Z:0.15"),
            Verdict::Value(ResponseValue::Position(Vector3 {
                x: 0.2,
                y: -3.78,
                z: 0.15
            }))
        );
        assert_eq!(Validator::Xyz.validate("ok"), Verdict::Fail);
    }

    #[test]
    fn test_device_errors() {
        assert!(is_device_error("Error:Printer halted. kill() called!"));
        assert!(is_device_error("!! thermal runaway"));
        assert!(!is_device_error("echo:busy: processing"));
    }
}
