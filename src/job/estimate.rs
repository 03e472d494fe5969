//! Print-time estimates embedded by slicers in G-code comments.
//!
//! Two dialects are understood:
//!
//! * a header whose first comment names the firmware `FLAVOR`, followed by
//!   `;TIME:<seconds>`;
//! * a free-form comment containing `time` with a duration such as
//!   `; estimated printing time (normal mode) = 1d 2h 3m 4s`.

use std::sync::OnceLock;

use regex::Regex;

/// Estimated print duration in seconds, read from the comment lines of a
/// payload. `None` when neither dialect matches.
pub fn time_from_comments<S>(comment_lines: &[S]) -> Option<u64>
where
    S: AsRef<str>,
{
    let first = comment_lines.first()?.as_ref();
    if first.contains("FLAVOR") {
        let time_line = comment_lines.get(1)?.as_ref();
        let (_, seconds) = time_line.split_once(':')?;
        return seconds.trim().parse().ok();
    }

    let time_line = comment_lines.iter().map(AsRef::as_ref).find(|line| line.contains("time"))?;
    sum_time_fields(time_line)
}

/// Estimated print duration of decompressed G-code `text`.
pub fn time_from_gcode(text: &str) -> Option<u64> {
    let comments: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(';'))
        .collect();
    time_from_comments(&comments)
}

/// Sum the integers in `line` read right to left as seconds, minutes,
/// hours and days. Integers beyond the fourth are ignored. `None` when the
/// total doesn't fit in a `u64`.
pub fn sum_time_fields(line: &str) -> Option<u64> {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    let re = DIGITS.get_or_init(|| Regex::new(r"\d+").expect("static regex is valid"));

    let values: Vec<u64> = re
        .find_iter(line)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    if values.is_empty() {
        return None;
    }

    const UNITS: [u64; 4] = [1, 60, 60 * 60, 24 * 60 * 60];
    values
        .iter()
        .rev()
        .zip(UNITS.iter())
        .try_fold(0u64, |total, (value, unit)| total.checked_add(value.checked_mul(*unit)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prusa_dialect() {
        assert_eq!(
            time_from_comments(&["; estimated printing time (normal mode) = 1h 2m 3s"]),
            Some(3723)
        );
        assert_eq!(
            time_from_comments(&["; generated by PrusaSlicer", "; estimated printing time (normal mode) = 2d 0h 0m 1s"]),
            Some(2 * 86400 + 1)
        );
        assert_eq!(time_from_comments(&["; estimated printing time = 45s"]), Some(45));
    }

    #[test]
    fn test_flavor_dialect() {
        assert_eq!(time_from_comments(&[";FLAVOR:Marlin", ";TIME:125"]), Some(125));
        assert_eq!(time_from_comments(&[";FLAVOR:Marlin"]), None);
    }

    #[test]
    fn test_no_estimate() {
        assert_eq!(time_from_comments::<&str>(&[]), None);
        assert_eq!(time_from_comments(&["; layer 1"]), None);
    }

    #[test]
    fn test_absurd_estimate_is_no_estimate() {
        assert_eq!(
            time_from_gcode("; estimated printing time = 300000000000000d 0h 0m 0s\nG28\n"),
            None
        );
        assert_eq!(sum_time_fields(&format!("{} 59", u64::MAX)), None);
    }

    #[test]
    fn test_from_gcode() {
        let gcode = ";FLAVOR:Marlin\n;TIME:125\nG28\n;LAYER:0\nG1 X1\n";
        assert_eq!(time_from_gcode(gcode), Some(125));
    }
}
