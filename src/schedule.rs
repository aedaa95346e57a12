//! Recurring scan definitions and the timing rules that drive them.
//!
//! [`compute_next_run`] is pure; everything that mutates `next_run` or the
//! run counters goes through [`ScheduleRegistry`] under its write lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, PrimitiveDateTime, Time, Weekday};
use tracing::warn;
use uuid::Uuid;

use crate::error::ScanError;
use crate::job::ScanRequest;
use crate::types::rfc3339;

const WEEK: [Weekday; 7] = [
    Weekday::Monday,
    Weekday::Tuesday,
    Weekday::Wednesday,
    Weekday::Thursday,
    Weekday::Friday,
    Weekday::Saturday,
    Weekday::Sunday,
];

const MAX_CUSTOM_INTERVAL: Duration = Duration::from_secs(366 * 24 * 3600);

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FrequencySpec", into = "FrequencySpec")]
pub enum Frequency {
    Hourly,
    /// Every day at this wall-clock time.
    Daily(Time),
    /// On each listed day at this wall-clock time.
    Weekly { days: Vec<Weekday>, at: Time },
    /// Fixed interval measured from the previous scheduled instant.
    Custom(Duration),
}

impl Frequency {
    pub fn weekly(days: Vec<Weekday>, at: Time) -> Result<Self, ScanError> {
        if days.is_empty() {
            return Err(ScanError::configuration("weekly schedule needs at least one day"));
        }
        Ok(Self::Weekly { days, at })
    }

    pub fn custom(interval: Duration) -> Result<Self, ScanError> {
        if interval < Duration::from_secs(1) {
            return Err(ScanError::configuration("custom interval must be at least 1s"));
        }
        if interval > MAX_CUSTOM_INTERVAL {
            return Err(ScanError::configuration(format!(
                "custom interval must be at most {}s",
                MAX_CUSTOM_INTERVAL.as_secs()
            )));
        }
        Ok(Self::Custom(interval))
    }

    fn fixed_interval(&self) -> Option<Duration> {
        match self {
            Self::Hourly => Some(Duration::from_secs(3600)),
            Self::Custom(interval) => Some(*interval),
            _ => None,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hourly => f.write_str("hourly"),
            Self::Daily(at) => write!(f, "daily at {}", format_time(*at)),
            Self::Weekly { days, at } => {
                let days: Vec<_> = days.iter().map(|d| day_name(*d)).collect();
                write!(f, "weekly on {} at {}", days.join(","), format_time(*at))
            }
            Self::Custom(interval) => write!(f, "every {}s", interval.as_secs()),
        }
    }
}

/// Serialized form of [`Frequency`]:
/// `{ kind = "daily", at = "09:00" }`, `{ kind = "weekly", days = ["mon", 4], at = "22:30" }`,
/// `{ kind = "custom", interval_secs = 21600 }`, `{ kind = "hourly" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrequencySpec {
    Hourly,
    Daily { at: String },
    Weekly { days: Vec<DaySpec>, at: String },
    Custom { interval_secs: u64 },
}

/// A weekday given by name or by index (0 = Monday).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DaySpec {
    Index(u8),
    Name(String),
}

impl TryFrom<FrequencySpec> for Frequency {
    type Error = ScanError;

    fn try_from(spec: FrequencySpec) -> Result<Self, Self::Error> {
        match spec {
            FrequencySpec::Hourly => Ok(Self::Hourly),
            FrequencySpec::Daily { at } => Ok(Self::Daily(parse_time(&at)?)),
            FrequencySpec::Weekly { days, at } => {
                let mut parsed = Vec::with_capacity(days.len());
                for day in days {
                    let day = parse_day(&day)?;
                    if !parsed.contains(&day) {
                        parsed.push(day);
                    }
                }
                Self::weekly(parsed, parse_time(&at)?)
            }
            FrequencySpec::Custom { interval_secs } => {
                Self::custom(Duration::from_secs(interval_secs))
            }
        }
    }
}

impl From<Frequency> for FrequencySpec {
    fn from(freq: Frequency) -> Self {
        match freq {
            Frequency::Hourly => Self::Hourly,
            Frequency::Daily(at) => Self::Daily { at: format_time(at) },
            Frequency::Weekly { days, at } => Self::Weekly {
                days: days
                    .into_iter()
                    .map(|d| DaySpec::Name(day_name(d).to_string()))
                    .collect(),
                at: format_time(at),
            },
            Frequency::Custom(interval) => Self::Custom {
                interval_secs: interval.as_secs(),
            },
        }
    }
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_time(s: &str) -> Result<Time, ScanError> {
    let invalid = || ScanError::configuration(format!("invalid time of day '{s}', expected HH:MM"));
    let parts: Vec<&str> = s.trim().split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(invalid());
    }
    let mut fields = [0u8; 3];
    for (field, part) in fields.iter_mut().zip(&parts) {
        *field = part.parse().map_err(|_| invalid())?;
    }
    Time::from_hms(fields[0], fields[1], fields[2]).map_err(|_| invalid())
}

fn format_time(t: Time) -> String {
    if t.second() == 0 {
        format!("{:02}:{:02}", t.hour(), t.minute())
    } else {
        format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second())
    }
}

fn parse_day(day: &DaySpec) -> Result<Weekday, ScanError> {
    match day {
        DaySpec::Index(i) => WEEK
            .get(usize::from(*i))
            .copied()
            .ok_or_else(|| ScanError::configuration(format!("day index {i} out of range 0..=6"))),
        DaySpec::Name(name) => {
            let lower = name.trim().to_ascii_lowercase();
            WEEK.iter()
                .copied()
                .find(|d| {
                    let full = day_name(*d);
                    lower == full || (lower.len() >= 3 && full.starts_with(&lower))
                })
                .ok_or_else(|| ScanError::configuration(format!("unknown weekday '{name}'")))
        }
    }
}

fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Monday => "monday",
        Weekday::Tuesday => "tuesday",
        Weekday::Wednesday => "wednesday",
        Weekday::Thursday => "thursday",
        Weekday::Friday => "friday",
        Weekday::Saturday => "saturday",
        Weekday::Sunday => "sunday",
    }
}

/// The first firing instant strictly after `from`.
///
/// Wall-clock times are interpreted in `from`'s UTC offset. Fails only when
/// the result falls outside the representable date range.
pub fn compute_next_run(
    frequency: &Frequency,
    from: OffsetDateTime,
) -> Result<OffsetDateTime, ScanError> {
    match frequency {
        Frequency::Hourly => shift(from, time::Duration::HOUR),
        Frequency::Custom(interval) => shift(from, to_time_duration(*interval)?),
        Frequency::Daily(at) => {
            let candidate = from.replace_time(*at);
            if candidate <= from {
                shift(candidate, time::Duration::DAY)
            } else {
                Ok(candidate)
            }
        }
        Frequency::Weekly { days, at } => {
            for offset in 0..=7 {
                let date = from
                    .date()
                    .checked_add(time::Duration::days(offset))
                    .ok_or_else(|| out_of_range(from))?;
                let candidate = PrimitiveDateTime::new(date, *at).assume_offset(from.offset());
                if candidate > from && days.contains(&candidate.weekday()) {
                    return Ok(candidate);
                }
            }
            shift(from, time::Duration::WEEK)
        }
    }
}

fn shift(from: OffsetDateTime, by: time::Duration) -> Result<OffsetDateTime, ScanError> {
    from.checked_add(by).ok_or_else(|| out_of_range(from))
}

fn to_time_duration(d: Duration) -> Result<time::Duration, ScanError> {
    time::Duration::try_from(d)
        .map_err(|_| ScanError::configuration(format!("interval of {}s is too large", d.as_secs())))
}

fn out_of_range(from: OffsetDateTime) -> ScanError {
    ScanError::configuration(format!("next run after {from} is out of range"))
}

/// The first firing instant after `scheduled` that is also after `now`.
///
/// Fixed intervals stay on the grid anchored at `scheduled`, so a late tick
/// does not shift later runs.
fn advance(
    frequency: &Frequency,
    scheduled: OffsetDateTime,
    now: OffsetDateTime,
) -> Result<OffsetDateTime, ScanError> {
    let next = compute_next_run(frequency, scheduled)?;
    if next > now {
        return Ok(next);
    }
    match frequency.fixed_interval() {
        Some(interval) => {
            let step = to_time_duration(interval)?;
            let behind = (now - scheduled).as_seconds_f64();
            let periods = (behind / step.as_seconds_f64()).floor() + 1.0;
            let jump = Duration::try_from_secs_f64(interval.as_secs_f64() * periods)
                .map_err(|_| out_of_range(scheduled))?;
            let mut next = shift(scheduled, to_time_duration(jump)?)?;
            while next <= now {
                next = shift(next, step)?;
            }
            Ok(next)
        }
        None => compute_next_run(frequency, now),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    #[default]
    Discovery,
    Monitoring,
    Compliance,
}

fn default_true() -> bool {
    true
}

/// A schedule as submitted by a caller or declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schedule_type: ScheduleType,
    pub frequency: Frequency,
    #[serde(flatten)]
    pub request: ScanRequest,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Partial update; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub schedule_type: Option<ScheduleType>,
    pub frequency: Option<Frequency>,
    pub targets: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub scan_type: Option<crate::backend::ScanType>,
    pub ports: Option<Vec<u32>>,
    pub scanner: Option<String>,
    pub timeout: Option<u64>,
    pub rate_limit: Option<u32>,
    pub enabled: Option<bool>,
}

impl ScheduleUpdate {
    /// The request the schedule would submit after this update.
    pub fn apply_to_request(&self, request: &ScanRequest) -> ScanRequest {
        let mut request = request.clone();
        if let Some(targets) = &self.targets {
            request.targets = targets.clone();
        }
        if let Some(exclude) = &self.exclude {
            request.exclude = exclude.clone();
        }
        if let Some(scan_type) = self.scan_type {
            request.scan_type = scan_type;
        }
        if let Some(ports) = &self.ports {
            request.ports = Some(ports.clone());
        }
        if let Some(scanner) = &self.scanner {
            request.scanner = scanner.clone();
        }
        if let Some(timeout) = self.timeout {
            request.timeout = Some(timeout);
        }
        if let Some(rate) = self.rate_limit {
            request.rate_limit = Some(rate);
        }
        request
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schedule_type: ScheduleType,
    pub frequency: Frequency,
    #[serde(flatten)]
    pub request: ScanRequest,
    pub enabled: bool,
    #[serde(with = "rfc3339::option")]
    pub next_run: Option<OffsetDateTime>,
    #[serde(with = "rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    #[serde(with = "rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A firing claimed by the ticker or by run-now.
#[derive(Debug, Clone)]
pub struct Firing {
    pub schedule_id: Uuid,
    pub name: String,
    pub request: ScanRequest,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduleStats {
    pub total_schedules: usize,
    pub enabled_schedules: usize,
    pub disabled_schedules: usize,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    /// successful_runs / total_runs, 0 when nothing has run.
    pub success_rate: f64,
    pub scheduler_running: bool,
}

/// In-memory schedule store.
#[derive(Debug, Default)]
pub struct ScheduleRegistry {
    schedules: RwLock<HashMap<Uuid, Schedule>>,
}

impl ScheduleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Schedule>> {
        self.schedules.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Schedule>> {
        self.schedules.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert(&self, draft: ScheduleDraft, now: OffsetDateTime) -> Result<Schedule, ScanError> {
        let next_run = if draft.enabled {
            Some(compute_next_run(&draft.frequency, now)?)
        } else {
            None
        };
        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: draft.name,
            description: draft.description,
            schedule_type: draft.schedule_type,
            frequency: draft.frequency,
            request: draft.request,
            enabled: draft.enabled,
            next_run,
            last_run: None,
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
            created_at: now,
            updated_at: now,
        };
        self.write().insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    pub fn get(&self, id: Uuid) -> Result<Schedule, ScanError> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ScanError::schedule_not_found(id))
    }

    /// Oldest first.
    pub fn list(&self) -> Vec<Schedule> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        all
    }

    pub fn update(
        &self,
        id: Uuid,
        update: ScheduleUpdate,
        now: OffsetDateTime,
    ) -> Result<Schedule, ScanError> {
        if let Some(frequency) = &update.frequency {
            compute_next_run(frequency, now)?;
        }
        let mut schedules = self.write();
        let schedule = schedules
            .get_mut(&id)
            .ok_or_else(|| ScanError::schedule_not_found(id))?;
        schedule.request = update.apply_to_request(&schedule.request);
        if let Some(name) = update.name {
            schedule.name = name;
        }
        if let Some(description) = update.description {
            schedule.description = Some(description);
        }
        if let Some(schedule_type) = update.schedule_type {
            schedule.schedule_type = schedule_type;
        }
        let mut reschedule = false;
        if let Some(frequency) = update.frequency {
            reschedule = frequency != schedule.frequency;
            schedule.frequency = frequency;
        }
        if let Some(enabled) = update.enabled {
            reschedule |= enabled && !schedule.enabled;
            schedule.enabled = enabled;
        }
        if !schedule.enabled {
            schedule.next_run = None;
        } else if reschedule || schedule.next_run.is_none() {
            schedule.next_run = Some(compute_next_run(&schedule.frequency, now)?);
        }
        schedule.updated_at = now;
        Ok(schedule.clone())
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool, now: OffsetDateTime) -> Result<Schedule, ScanError> {
        self.update(
            id,
            ScheduleUpdate {
                enabled: Some(enabled),
                ..ScheduleUpdate::default()
            },
            now,
        )
    }

    pub fn remove(&self, id: Uuid) -> Result<Schedule, ScanError> {
        self.write()
            .remove(&id)
            .ok_or_else(|| ScanError::schedule_not_found(id))
    }

    /// Claim every enabled schedule due at `now`, advancing `next_run` in the
    /// same critical section. A second call for the same window claims nothing.
    pub fn claim_due(&self, now: OffsetDateTime) -> Vec<Firing> {
        let mut schedules = self.write();
        let mut due: Vec<(OffsetDateTime, Firing)> = Vec::new();
        for schedule in schedules.values_mut() {
            let Some(scheduled) = schedule.next_run else { continue };
            if !schedule.enabled || scheduled > now {
                continue;
            }
            schedule.last_run = Some(now);
            schedule.total_runs += 1;
            match advance(&schedule.frequency, scheduled, now) {
                Ok(next) => schedule.next_run = Some(next),
                Err(err) => {
                    warn!(schedule_id = %schedule.id, error = %err, "schedule has no next run, disabling");
                    schedule.enabled = false;
                    schedule.next_run = None;
                }
            }
            due.push((
                scheduled,
                Firing {
                    schedule_id: schedule.id,
                    name: schedule.name.clone(),
                    request: schedule.request.clone(),
                },
            ));
        }
        due.sort_by_key(|(scheduled, _)| *scheduled);
        due.into_iter().map(|(_, firing)| firing).collect()
    }

    /// Claim an immediate run without touching `next_run`. Disabled schedules may run too.
    pub fn claim_now(&self, id: Uuid, now: OffsetDateTime) -> Result<Firing, ScanError> {
        let mut schedules = self.write();
        let schedule = schedules
            .get_mut(&id)
            .ok_or_else(|| ScanError::schedule_not_found(id))?;
        schedule.last_run = Some(now);
        schedule.total_runs += 1;
        Ok(Firing {
            schedule_id: schedule.id,
            name: schedule.name.clone(),
            request: schedule.request.clone(),
        })
    }

    /// Count a finished run. Unknown ids (deleted schedules) are ignored.
    pub fn record_outcome(&self, id: Uuid, success: bool) {
        if let Some(schedule) = self.write().get_mut(&id) {
            if success {
                schedule.successful_runs += 1;
            } else {
                schedule.failed_runs += 1;
            }
        }
    }

    pub fn stats(&self, scheduler_running: bool) -> ScheduleStats {
        let schedules = self.read();
        let enabled = schedules.values().filter(|s| s.enabled).count();
        let total_runs: u64 = schedules.values().map(|s| s.total_runs).sum();
        let successful_runs: u64 = schedules.values().map(|s| s.successful_runs).sum();
        let failed_runs: u64 = schedules.values().map(|s| s.failed_runs).sum();
        ScheduleStats {
            total_schedules: schedules.len(),
            enabled_schedules: enabled,
            disabled_schedules: schedules.len() - enabled,
            total_runs,
            successful_runs,
            failed_runs,
            success_rate: if total_runs > 0 {
                successful_runs as f64 / total_runs as f64
            } else {
                0.0
            },
            scheduler_running,
        }
    }
}
