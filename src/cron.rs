//! Cron expression validation and staggering.
//!
//! Only the five-field form and the common `@` macros are accepted. The
//! parser checks structure and numeric ranges; it does not compute fire
//! times, the periodic scheduler does that.

use std::fmt;

/// Field names and inclusive numeric ranges, in crontab order
const FIELDS: [(&str, u32, u32); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day-of-month", 1, 31),
    ("month", 1, 12),
    ("day-of-week", 0, 7),
];

const MACROS: &[&str] = &[
    "@yearly", "@annually", "@monthly", "@weekly", "@daily", "@midnight", "@hourly",
];

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const DAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// A validated cron-style expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CronExpression(String);

impl CronExpression {
    /// Parse and validate an expression.
    ///
    /// Whitespace between fields is normalised to single spaces so that two
    /// spellings of the same schedule compare equal.
    pub fn parse(input: &str) -> Result<Self, String> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err("cron expression is empty".to_string());
        }

        if trimmed.starts_with('@') {
            let lower = trimmed.to_ascii_lowercase();
            if MACROS.contains(&lower.as_str()) {
                return Ok(Self(lower));
            }
            return Err(format!("unknown cron macro '{}'", trimmed));
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() != FIELDS.len() {
            return Err(format!(
                "cron expression '{}' must have 5 fields, found {}",
                trimmed,
                fields.len()
            ));
        }

        for (field, (name, min, max)) in fields.iter().zip(FIELDS) {
            validate_field(field, name, min, max)
                .map_err(|reason| format!("cron expression '{}': {}", trimmed, reason))?;
        }

        Ok(Self(fields.join(" ")))
    }

    /// `@daily`, the last-resort schedule
    pub(crate) fn daily() -> Self {
        Self("@daily".to_string())
    }

    /// The normalised expression text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Run `offset` minutes later.
    ///
    /// The minute must be a single number. A minute past 59 carries into a
    /// fixed hour; with `*` as hour the job is hourly and simply wraps.
    /// Returns `None` for macros, minute lists/ranges/steps, a carry into a
    /// non-fixed hour, or a carry past 23:59 (that would move the day).
    pub fn stagger(&self, offset: u32) -> Option<Self> {
        let mut fields: Vec<&str> = self.0.split(' ').collect();
        if fields.len() != FIELDS.len() {
            return None;
        }
        let minute: u32 = fields[0].parse().ok()?;
        let total = minute + offset;
        let carry = total / 60;

        let hour = if carry == 0 || fields[1] == "*" {
            fields[1].to_string()
        } else {
            let hour = fields[1].parse::<u32>().ok()? + carry;
            if hour > 23 {
                return None;
            }
            hour.to_string()
        };

        let minute = (total % 60).to_string();
        fields[0] = &minute;
        fields[1] = &hour;
        Some(Self(fields.join(" ")))
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_field(field: &str, name: &str, min: u32, max: u32) -> Result<(), String> {
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (part, None),
        };

        if let Some(step) = step {
            match step.parse::<u32>() {
                Ok(s) if s > 0 => {}
                _ => return Err(format!("invalid step '{}' in {} field", step, name)),
            }
        }

        if range == "*" {
            continue;
        }

        let (lo, hi) = match range.split_once('-') {
            Some((lo, hi)) => (lo, Some(hi)),
            None => (range, None),
        };
        let lo = parse_value(lo, name, min, max)?;
        if let Some(hi) = hi {
            let hi = parse_value(hi, name, min, max)?;
            if hi < lo {
                return Err(format!("descending range '{}' in {} field", range, name));
            }
        }
    }
    Ok(())
}

fn parse_value(token: &str, name: &str, min: u32, max: u32) -> Result<u32, String> {
    let lower = token.to_ascii_lowercase();
    let named = match name {
        "month" => MONTH_NAMES.iter().position(|m| *m == lower).map(|i| i as u32 + 1),
        "day-of-week" => DAY_NAMES.iter().position(|d| *d == lower).map(|i| i as u32),
        _ => None,
    };
    if let Some(value) = named {
        return Ok(value);
    }

    match token.parse::<u32>() {
        Ok(v) if (min..=max).contains(&v) => Ok(v),
        Ok(v) => Err(format!("{} out of range {}-{} in {} field", v, min, max, name)),
        Err(_) => Err(format!("invalid token '{}' in {} field", token, name)),
    }
}
