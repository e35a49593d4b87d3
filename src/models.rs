use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TimerError};

/// Stable task identifier, assigned at creation and kept across edits.
pub type TaskId = u64;

/// Recurrence code for a task that occurs on its creation day only.
pub const ONE_SHOT: i32 = 0;
/// Recurrence code for a task that repeats on the same day of every month.
pub const MONTHLY: i32 = -1;

/// Lowest and highest priority a task may carry.
pub const MIN_PRIORITY: i32 = 0;
pub const MAX_PRIORITY: i32 = 10;

/// Longest duration a task may carry: one leap year.
pub const MAX_DURATION_SECS: i64 = 366 * 86_400;

/// `start` moved forward by `secs`, saturating instead of overflowing.
pub fn offset_by(start: NaiveDateTime, secs: i64) -> NaiveDateTime {
    start
        .checked_add_signed(chrono::Duration::seconds(secs.clamp(0, MAX_DURATION_SECS)))
        .unwrap_or(NaiveDateTime::MAX)
}

/// Immutable identity of a task record.
///
/// Two records describe the same entity iff their keys are equal, whatever
/// their payload says. The key is what the working set and the store index by.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub id: TaskId,
    pub created_time: NaiveDateTime,
    pub is_template: bool,
}

impl TaskKey {
    /// The identity of the concrete instance a template reference stands for.
    pub fn concrete(self) -> TaskKey {
        TaskKey { is_template: false, ..self }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} @ {}", self.id, self.created_time.format("%Y-%m-%d %H:%M:%S"))?;
        if self.is_template {
            write!(f, " (template)")?;
        }
        Ok(())
    }
}

/// Progress state of a concrete instance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Remaining,
    Finished,
}

/// Typed view of the integer `interval_days` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    /// Today only.
    Once,
    /// Same day of the month as the creation date.
    Monthly,
    /// Every n days counted from the creation date.
    EveryDays(u32),
}

impl Recurrence {
    pub fn from_code(code: i32) -> Result<Recurrence> {
        match code {
            ONE_SHOT => Ok(Recurrence::Once),
            MONTHLY => Ok(Recurrence::Monthly),
            n if n > 0 => Ok(Recurrence::EveryDays(n as u32)),
            n => Err(TimerError::InvalidInput(format!("unknown recurrence code {n}"))),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Recurrence::Once => ONE_SHOT,
            Recurrence::Monthly => MONTHLY,
            Recurrence::EveryDays(n) => i32::try_from(n).unwrap_or(i32::MAX),
        }
    }
}

/// A timed task: either a recurring template or a concrete instance.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Task {
    /// Identifier shared by a template and all of its instances.
    pub id: TaskId,
    /// Creation anchor. For fixed-time tasks this is the anchored start.
    pub created_time: NaiveDateTime,
    /// Templates are only expanded, never scheduled or run.
    pub is_template: bool,
    /// Description shown to the user.
    pub text: String,
    /// Full length of the task in seconds.
    pub duration_secs: i64,
    /// Packing priority, higher first.
    pub priority: i32,
    /// Recurrence code, see [`Recurrence`].
    pub interval_days: i32,
    /// Anchored at `created_time` instead of packed by priority.
    pub fixed_time: bool,
    /// Display color, opaque to the engine.
    pub color: String,
    /// Countdown progress in seconds.
    pub time_left_secs: i64,
    /// Wall-clock start of the current running or held period.
    pub period_start: NaiveDateTime,
    /// `time_left_secs` as it was at `period_start`.
    pub time_left_at_period_start: i64,
    pub is_running: bool,
    /// UI-only expansion flag.
    #[serde(default)]
    pub is_detail_visible: bool,
    pub status: TaskStatus,
    /// Planned start computed by the scheduler. Not authoritative state.
    #[serde(default)]
    pub estimated_start_time: Option<NaiveDateTime>,
}

impl Task {
    /// A flexible, non-recurring instance with a full countdown.
    pub fn new(id: TaskId, text: impl Into<String>, duration_secs: i64, created_time: NaiveDateTime) -> Task {
        let duration_secs = duration_secs.clamp(0, MAX_DURATION_SECS);
        Task {
            id,
            created_time,
            is_template: false,
            text: text.into(),
            duration_secs,
            priority: MIN_PRIORITY,
            interval_days: ONE_SHOT,
            fixed_time: false,
            color: String::new(),
            time_left_secs: duration_secs,
            period_start: created_time,
            time_left_at_period_start: duration_secs,
            is_running: false,
            is_detail_visible: false,
            status: TaskStatus::Remaining,
            estimated_start_time: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Task {
        self.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self
    }

    pub fn with_fixed_time(mut self, fixed: bool) -> Task {
        self.fixed_time = fixed;
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Task {
        self.color = color.into();
        self
    }

    /// Sets the recurrence. Anything other than [`Recurrence::Once`] turns the
    /// task into a template.
    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Task {
        self.interval_days = recurrence.code();
        self.is_template = recurrence != Recurrence::Once;
        self
    }

    pub fn as_template(mut self) -> Task {
        self.is_template = true;
        self
    }

    pub fn with_time_left(mut self, secs: i64) -> Task {
        self.time_left_secs = secs.clamp(0, self.duration_secs);
        self.time_left_at_period_start = self.time_left_secs;
        self
    }

    pub fn key(&self) -> TaskKey {
        TaskKey {
            id: self.id,
            created_time: self.created_time,
            is_template: self.is_template,
        }
    }

    /// Identity comparison; payload fields are ignored.
    pub fn same_entity(&self, other: &Task) -> bool {
        self.key() == other.key()
    }

    pub fn date(&self) -> NaiveDate {
        self.created_time.date()
    }

    pub fn recurrence(&self) -> Result<Recurrence> {
        Recurrence::from_code(self.interval_days)
    }

    pub fn is_remaining(&self) -> bool {
        self.status == TaskStatus::Remaining
    }

    /// Whether the recurrence rule of this task fires on `day`.
    ///
    /// Never fires before the creation day. Monthly rules match the day of the
    /// month exactly, so a rule created on the 31st skips shorter months.
    pub fn occurs_on(&self, day: NaiveDate) -> bool {
        let created = self.date();
        if day < created {
            return false;
        }
        match self.interval_days {
            MONTHLY => created.day() == day.day(),
            ONE_SHOT => created == day,
            n if n > 0 => (day - created).num_days() % i64::from(n) == 0,
            _ => false,
        }
    }

    /// Whole days from the creation date to `day`; negative for future tasks.
    pub fn days_since_creation(&self, day: NaiveDate) -> i64 {
        (day - self.date()).num_days()
    }

    /// The concrete occurrence of this task on `day`, at the same time of day.
    pub fn instance_on(&self, day: NaiveDate) -> Task {
        let created_time = day.and_time(self.created_time.time());
        Task {
            created_time,
            is_template: false,
            status: TaskStatus::Remaining,
            is_running: false,
            time_left_secs: self.duration_secs,
            period_start: created_time,
            time_left_at_period_start: self.duration_secs,
            estimated_start_time: None,
            ..self.clone()
        }
    }

    pub fn estimated_end(&self) -> Option<NaiveDateTime> {
        self.estimated_start_time
            .map(|start| offset_by(start, self.time_left_secs))
    }

    /// Starts a new countdown period at `now` from the current time left.
    pub fn reset_period(&mut self, now: NaiveDateTime) {
        self.period_start = now;
        self.time_left_at_period_start = self.time_left_secs;
    }

    /// Assigns time left, clamped to `[0, duration]`, and starts a new period.
    pub fn set_time_left(&mut self, secs: i64, now: NaiveDateTime) {
        self.time_left_secs = secs.clamp(0, self.duration_secs);
        self.reset_period(now);
    }

    /// Time left at `now`, derived from the wall-clock distance to the period
    /// start rather than from a tick count.
    pub fn time_left_at(&self, now: NaiveDateTime) -> i64 {
        if !self.is_running {
            return self.time_left_secs;
        }
        let elapsed = (now - self.period_start).num_seconds().max(0);
        (self.time_left_at_period_start - elapsed).clamp(0, self.duration_secs)
    }

    pub fn finish(&mut self) {
        self.status = TaskStatus::Finished;
        self.is_running = false;
        self.time_left_secs = 0;
        self.time_left_at_period_start = 0;
    }

    /// Restores the record invariants after it crossed a trust boundary.
    pub fn normalize(&mut self) {
        self.duration_secs = self.duration_secs.clamp(0, MAX_DURATION_SECS);
        self.priority = self.priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self.time_left_secs = self.time_left_secs.clamp(0, self.duration_secs);
        self.time_left_at_period_start = self.time_left_at_period_start.clamp(0, self.duration_secs);
        if self.status == TaskStatus::Finished || self.is_template {
            self.is_running = false;
        }
        if self.status == TaskStatus::Finished {
            self.time_left_secs = 0;
            self.time_left_at_period_start = 0;
        }
    }
}

/// Renders a countdown as `HH:MM` from one hour up, `MM:SS` below.
pub fn format_time_left(secs: i64) -> String {
    let secs = secs.max(0);
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}", hours, minutes)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}
