//! Calendar recurrence specs
//!
//! A [`RecurrenceSpec`] holds optional calendar fields, each a fixed value,
//! a cron-style list/range/step, or a wildcard. Unset fields follow the
//! usual calendar-trigger convention: fields more significant than the
//! most significant set field are wildcards, less significant ones take
//! their minimum. So `hour = 9` means 09:00:00 daily, and a spec with no
//! field set fires every second.
//!
//! Significance order: year, month, day, week, day_of_week, hour, minute, second.
//! `week` (ISO week number) and `day_of_week` are never defaulted to a minimum.
//! `day_of_week` accepts names (`mon`..`sun`) or numbers with 0 = Monday.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use sdk::errors::EngineError;
use sdk::types::RecurrenceId;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// Upper bound on week-to-week jumps when a week filter is set
const MAX_WEEK_JUMPS: usize = 53 * 100;

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Calendar schedule definition attached to emitters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceSpec {
    #[serde(default)]
    pub id: RecurrenceId,
    #[serde(default, deserialize_with = "field_value")]
    pub year: Option<String>,
    #[serde(default, deserialize_with = "field_value")]
    pub month: Option<String>,
    #[serde(default, deserialize_with = "field_value")]
    pub day: Option<String>,
    #[serde(default, deserialize_with = "field_value")]
    pub week: Option<String>,
    #[serde(default, deserialize_with = "field_value")]
    pub day_of_week: Option<String>,
    #[serde(default, deserialize_with = "field_value")]
    pub hour: Option<String>,
    #[serde(default, deserialize_with = "field_value")]
    pub minute: Option<String>,
    #[serde(default, deserialize_with = "field_value")]
    pub second: Option<String>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub jitter_secs: u64,
}

impl RecurrenceSpec {
    /// A spec with every field unset
    pub fn every_second(id: RecurrenceId) -> Self {
        Self {
            id,
            year: None,
            month: None,
            day: None,
            week: None,
            day_of_week: None,
            hour: None,
            minute: None,
            second: None,
            start_date: None,
            end_date: None,
            timezone: None,
            jitter_secs: 0,
        }
    }

    /// Daily at `hour:minute:00` in `timezone`
    pub fn daily_at(id: RecurrenceId, hour: u32, minute: u32, timezone: &str) -> Self {
        Self {
            hour: Some(hour.to_string()),
            minute: Some(minute.to_string()),
            timezone: Some(timezone.to_string()),
            ..Self::every_second(id)
        }
    }
}

/// Accept integers as well as strings for calendar fields
fn field_value<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Int(n)) => Some(n.to_string()),
        Some(Raw::Text(s)) if s.trim().is_empty() => None,
        Some(Raw::Text(s)) => Some(s.trim().to_string()),
        None => None,
    })
}

fn weekday_token(token: &str) -> Result<String, EngineError> {
    match token.parse::<usize>() {
        Ok(n) if n < WEEKDAYS.len() => Ok(WEEKDAYS[n].to_string()),
        Ok(n) => Err(EngineError::Recurrence(format!("day_of_week {} out of range", n))),
        Err(_) => {
            let mut chars = token.chars();
            Ok(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            })
        }
    }
}

fn translate_day_of_week(field: &str) -> Result<String, EngineError> {
    let mut parts = Vec::new();
    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (part, None),
        };
        let base = if base == "*" {
            base.to_string()
        } else if let Some((from, to)) = base.split_once('-') {
            format!("{}-{}", weekday_token(from)?, weekday_token(to)?)
        } else {
            weekday_token(base)?
        };
        parts.push(match step {
            Some(step) => format!("{}/{}", base, step),
            None => base,
        });
    }
    Ok(parts.join(","))
}

fn parse_weeks(field: &str) -> Result<Option<Vec<u32>>, EngineError> {
    if field == "*" {
        return Ok(None);
    }
    let bad = || EngineError::Recurrence(format!("invalid week field '{}'", field));
    let mut weeks = Vec::new();
    for part in field.split(',') {
        match part.split_once('-') {
            Some((from, to)) => {
                let from: u32 = from.trim().parse().map_err(|_| bad())?;
                let to: u32 = to.trim().parse().map_err(|_| bad())?;
                weeks.extend(from..=to);
            }
            None => weeks.push(part.trim().parse().map_err(|_| bad())?),
        }
    }
    if weeks.iter().any(|w| !(1..=53).contains(w)) {
        return Err(bad());
    }
    Ok(Some(weeks))
}

/// A compiled, timezone-aware recurrence
#[derive(Debug, Clone)]
pub struct Recurrence {
    schedule: Schedule,
    expression: String,
    tz: Tz,
    weeks: Option<Vec<u32>>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl Recurrence {
    /// Compile a spec, using `default_tz` when the spec names no timezone.
    ///
    /// # Errors
    ///
    /// `EngineError::Recurrence` for unknown timezones, unparseable fields or
    /// an end date before the start date.
    pub fn compile(spec: &RecurrenceSpec, default_tz: &str) -> Result<Self, EngineError> {
        let tz_name = spec.timezone.as_deref().unwrap_or(default_tz);
        let tz: Tz = tz_name
            .parse()
            .map_err(|_| EngineError::Recurrence(format!("unknown timezone '{}'", tz_name)))?;

        if let (Some(start), Some(end)) = (spec.start_date, spec.end_date) {
            if end < start {
                return Err(EngineError::Recurrence(
                    "end_date is before start_date".to_string(),
                ));
            }
        }

        // (value, minimum) in significance order; week and day_of_week have no minimum
        let ordered: [(&Option<String>, Option<&str>); 8] = [
            (&spec.year, None),
            (&spec.month, Some("1")),
            (&spec.day, Some("1")),
            (&spec.week, None),
            (&spec.day_of_week, None),
            (&spec.hour, Some("0")),
            (&spec.minute, Some("0")),
            (&spec.second, Some("0")),
        ];
        let first_set = ordered.iter().position(|(value, _)| value.is_some());
        let resolved: Vec<String> = ordered
            .iter()
            .enumerate()
            .map(|(i, (value, minimum))| match (value, minimum, first_set) {
                (Some(v), _, _) => v.clone(),
                (None, Some(min), Some(first)) if i > first => min.to_string(),
                _ => "*".to_string(),
            })
            .collect();

        let [year, month, day, week, day_of_week, hour, minute, second] =
            <[String; 8]>::try_from(resolved)
                .map_err(|_| EngineError::Recurrence("field count mismatch".to_string()))?;

        let day_of_week = translate_day_of_week(&day_of_week)?;
        let expression = format!(
            "{} {} {} {} {} {} {}",
            second, minute, hour, day, month, day_of_week, year
        );
        let schedule = Schedule::from_str(&expression).map_err(|e| {
            EngineError::Recurrence(format!("invalid schedule '{}': {}", expression, e))
        })?;

        Ok(Self {
            schedule,
            expression,
            tz,
            weeks: parse_weeks(&week)?,
            start: spec.start_date,
            end: spec.end_date,
        })
    }

    /// The 7-field expression handed to the cron evaluator
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Identity of the firing schedule; equal fingerprints fire at the same instants
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{:?}|{:?}|{:?}",
            self.expression, self.tz, self.weeks, self.start, self.end
        )
    }

    /// First fire strictly after `after`, honouring the active date range
    /// and the week filter
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let floor = match self.start {
            Some(start) if start > after => start - chrono::Duration::seconds(1),
            _ => after,
        };
        let mut cursor = self.tz.from_utc_datetime(&floor.naive_utc());

        for _ in 0..=MAX_WEEK_JUMPS {
            let candidate = self.schedule.after(&cursor).next()?;
            let utc = candidate.with_timezone(&Utc);
            if self.end.is_some_and(|end| utc > end) {
                return None;
            }

            let Some(weeks) = &self.weeks else {
                return Some(utc);
            };
            if weeks.contains(&candidate.iso_week().week()) {
                return Some(utc);
            }

            // Resume just before Monday 00:00 of the next wanted week
            let monday = self.next_wanted_monday(candidate.date_naive(), weeks)?;
            cursor = self.before_local_midnight(monday)?.max(candidate);
        }

        tracing::warn!(expression = %self.expression, weeks = ?self.weeks, "No fire found within the week search bound");
        None
    }

    /// First Monday after the ISO week of `date` whose week number is in `weeks`
    fn next_wanted_monday(&self, date: NaiveDate, weeks: &[u32]) -> Option<NaiveDate> {
        let offset = i64::from(date.weekday().num_days_from_monday());
        let mut monday = date - chrono::Duration::days(offset);
        // Years with a week 53 are at most seven years apart
        for _ in 0..53 * 8 {
            monday = monday + chrono::Duration::days(7);
            if weeks.contains(&monday.iso_week().week()) {
                return Some(monday);
            }
        }
        None
    }

    /// One second before local midnight starting `date`
    fn before_local_midnight(&self, date: NaiveDate) -> Option<DateTime<Tz>> {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        let start = match self.tz.from_local_datetime(&midnight).earliest() {
            Some(start) => start,
            // Midnight skipped by a DST change; no zone is more than 14h ahead of UTC
            None => self
                .tz
                .from_utc_datetime(&(midnight - chrono::Duration::hours(14))),
        };
        Some(start - chrono::Duration::seconds(1))
    }

    /// The next `count` fires after `after`
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut fires = Vec::with_capacity(count);
        let mut cursor = after;
        while fires.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    fires.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        fires
    }
}
