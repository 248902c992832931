// Store-resident aggregation jobs: periods, structured names, schedules and definitions.
//
// Job names are `<base>.<family>.<subject...>.<period>`. Every segment is a validated
// identifier (no dots, no leading underscore) so a name parses back into exactly one key.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::Deserialize;

use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    Now,
    Today,
    Month,
    Year,
}

impl Period {
    /// Calendar windows that accumulate energy.
    pub const WINDOWS: [Period; 3] = [Period::Today, Period::Month, Period::Year];
    pub const ALL: [Period; 4] = [Period::Now, Period::Today, Period::Month, Period::Year];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Now => "now",
            Period::Today => "today",
            Period::Month => "month",
            Period::Year => "year",
        }
    }

    /// First day of the window containing `today`. `now` shares today's window.
    pub fn window_start(&self, today: NaiveDate) -> NaiveDate {
        match self {
            Period::Now | Period::Today => today,
            Period::Month => today.with_day(1).unwrap_or(today),
            Period::Year => NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today),
        }
    }

    /// The finer window whose totals are summed to produce this one.
    pub fn summed_from(&self) -> Option<Period> {
        match self {
            Period::Month => Some(Period::Today),
            Period::Year => Some(Period::Month),
            _ => None,
        }
    }

    /// Relative range literal covering one window, used by the meter delta scripts.
    pub fn relative_range(&self) -> &'static str {
        match self {
            Period::Now | Period::Today => "-1d",
            Period::Month => "-1mo",
            Period::Year => "-1y",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "now" => Ok(Period::Now),
            "today" => Ok(Period::Today),
            "month" => Ok(Period::Month),
            "year" => Ok(Period::Year),
            other => Err(format!("unknown period {other:?}")),
        }
    }
}

/// Job family; the tag is the second segment of every job name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    /// Per-device integration (today) or summation (month/year).
    Device,
    /// Per-location energy roll-up.
    Location,
    /// Per-location instantaneous power roll-up.
    Power,
    /// Production/consumption delta and its nightly snapshot.
    Meter,
}

impl Family {
    pub const ALL: [Family; 4] = [Family::Device, Family::Location, Family::Power, Family::Meter];

    pub fn tag(&self) -> &'static str {
        match self {
            Family::Device => "_device",
            Family::Location => "_location",
            Family::Power => "_power",
            Family::Meter => "_meter",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Family::ALL.into_iter().find(|f| f.tag() == tag)
    }
}

/// Identifiers interpolated into job names and scripts: `[A-Za-z0-9_-]`, no leading `_`.
pub fn validate_identifier(what: &'static str, value: &str) -> Result<(), JobError> {
    let ok = !value.is_empty()
        && !value.starts_with('_')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(JobError::InvalidIdentifier {
            what,
            value: value.to_string(),
        })
    }
}

/// Structured identity of a job; the store name is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub family: Family,
    pub subject: Vec<String>,
    pub period: Period,
}

impl JobKey {
    pub fn new<S: AsRef<str>>(family: Family, subject: &[S], period: Period) -> Result<Self, JobError> {
        if subject.is_empty() {
            return Err(JobError::InvalidIdentifier {
                what: "job subject",
                value: String::new(),
            });
        }
        let subject = subject
            .iter()
            .map(|s| {
                validate_identifier("job subject", s.as_ref())?;
                Ok(s.as_ref().to_string())
            })
            .collect::<Result<Vec<_>, JobError>>()?;
        Ok(Self {
            family,
            subject,
            period,
        })
    }

    pub fn name(&self, base: &str) -> String {
        format!(
            "{}.{}.{}.{}",
            base,
            self.family.tag(),
            self.subject.join("."),
            self.period
        )
    }

    /// Inverse of [`JobKey::name`]; `None` for anything outside `base`'s namespace.
    pub fn parse(base: &str, name: &str) -> Option<Self> {
        let rest = name.strip_prefix(base)?.strip_prefix('.')?;
        let parts: Vec<&str> = rest.split('.').collect();
        if parts.len() < 3 {
            return None;
        }
        let family = Family::from_tag(parts[0])?;
        let period = parts[parts.len() - 1].parse().ok()?;
        JobKey::new(family, &parts[1..parts.len() - 1], period).ok()
    }
}

/// Execution cadence the store applies to an installed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Every(u64),
    Cron(String),
}

impl Schedule {
    /// Validated five-field cron expression (minute hour day month weekday).
    pub fn cron(expr: &str) -> Result<Self, JobError> {
        let expr = expr.trim();
        if expr.split_whitespace().count() != 5 {
            return Err(JobError::InvalidSchedule(expr.to_string()));
        }
        cron::Schedule::from_str(&format!("0 {expr}"))
            .map_err(|_| JobError::InvalidSchedule(expr.to_string()))?;
        Ok(Schedule::Cron(expr.to_string()))
    }

    pub fn every(secs: u64) -> Result<Self, JobError> {
        if secs == 0 {
            return Err(JobError::InvalidSchedule("every 0s".into()));
        }
        Ok(Schedule::Every(secs))
    }

    fn option_field(&self) -> String {
        match self {
            Schedule::Every(secs) => format!("every: {secs}s"),
            Schedule::Cron(expr) => format!("cron: {}", flux_string(expr)),
        }
    }
}

/// A fully built job definition, ready to install.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub key: JobKey,
    pub name: String,
    pub script: String,
    pub schedule: Schedule,
}

impl JobSpec {
    /// Script with the store's task option header.
    pub fn render(&self) -> String {
        format!(
            "option task = {{name: {}, {}}}\n{}",
            flux_string(&self.name),
            self.schedule.option_field(),
            self.script
        )
    }
}

/// A job as the store reports it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

/// Quoted script string literal.
pub(crate) fn flux_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '$' => out.push_str("\\$"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}
