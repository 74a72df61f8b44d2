use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid ISO 8601 duration: {message}, got: {text}"))]
    InvalidIso8601 { message: String, text: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A DSL duration: either an ISO 8601 expression (`PT30S`, `P7D`) or the
/// structured object form (`{ seconds: 30 }`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSpec {
    Inline(DurationInline),
    Iso8601(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DurationInline {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milliseconds: Option<u64>,
}

impl DurationInline {
    #[must_use]
    pub fn total_milliseconds(&self) -> u64 {
        self.days.unwrap_or(0) * 24 * 3600 * 1000
            + self.hours.unwrap_or(0) * 3600 * 1000
            + self.minutes.unwrap_or(0) * 60 * 1000
            + self.seconds.unwrap_or(0) * 1000
            + self.milliseconds.unwrap_or(0)
    }
}

impl DurationSpec {
    pub fn to_duration(&self) -> Result<StdDuration> {
        match self {
            DurationSpec::Inline(inline) => {
                Ok(StdDuration::from_millis(inline.total_milliseconds()))
            }
            DurationSpec::Iso8601(text) => parse_iso8601_duration(text),
        }
    }
}

/// Parse an ISO 8601 duration string into a std Duration.
///
/// Supports day and time components: P1D, PT5S, PT1M30S, P1DT12H, PT0.5S.
/// Calendar components (years, months, weeks) are rejected since their length
/// is not fixed.
pub fn parse_iso8601_duration(iso_str: &str) -> Result<StdDuration> {
    let trimmed = iso_str.trim();

    let Some(without_p) = trimmed.strip_prefix('P') else {
        return InvalidIso8601Snafu {
            message: "must start with 'P'",
            text: iso_str,
        }
        .fail();
    };

    let (date_part, time_part) = match without_p.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (without_p, None),
    };

    if date_part.is_empty() && time_part.is_none_or(str::is_empty) {
        return InvalidIso8601Snafu {
            message: "no components specified",
            text: iso_str,
        }
        .fail();
    }

    let mut total_ms: f64 = 0.0;

    total_ms += parse_components(date_part, iso_str, |unit, value| match unit {
        'D' => Ok(value * 24.0 * 3600.0 * 1000.0),
        'Y' | 'M' | 'W' => InvalidIso8601Snafu {
            message: format!("calendar component '{unit}' is not supported"),
            text: iso_str,
        }
        .fail(),
        _ => InvalidIso8601Snafu {
            message: format!("unsupported date unit '{unit}'"),
            text: iso_str,
        }
        .fail(),
    })?;

    if let Some(time_part) = time_part {
        if time_part.is_empty() {
            return InvalidIso8601Snafu {
                message: "empty time part",
                text: iso_str,
            }
            .fail();
        }
        total_ms += parse_components(time_part, iso_str, |unit, value| match unit {
            'H' => Ok(value * 3600.0 * 1000.0),
            'M' => Ok(value * 60.0 * 1000.0),
            'S' => Ok(value * 1000.0),
            _ => InvalidIso8601Snafu {
                message: format!("unsupported time unit '{unit}'"),
                text: iso_str,
            }
            .fail(),
        })?;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(StdDuration::from_millis(total_ms as u64))
}

fn parse_components(
    part: &str,
    original: &str,
    to_millis: impl Fn(char, f64) -> Result<f64>,
) -> Result<f64> {
    let mut total = 0.0;
    let mut current_num = String::new();

    for ch in part.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            current_num.push(ch);
        } else {
            if current_num.is_empty() {
                return InvalidIso8601Snafu {
                    message: format!("unit '{ch}' without a value"),
                    text: original,
                }
                .fail();
            }
            let value: f64 = current_num.parse().map_err(|_| Error::InvalidIso8601 {
                message: format!("failed to parse number '{current_num}'"),
                text: original.to_string(),
            })?;
            total += to_millis(ch, value)?;
            current_num.clear();
        }
    }

    if !current_num.is_empty() {
        return InvalidIso8601Snafu {
            message: "trailing value without a unit",
            text: original,
        }
        .fail();
    }

    Ok(total)
}
