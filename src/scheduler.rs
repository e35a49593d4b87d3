use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use tracing::debug;

use crate::models::{offset_by, Task, MAX_DURATION_SECS};
use crate::recurrence::expand_for_day;
use crate::working_set::WorkingSet;

/// Default gap kept between two consecutively planned tasks.
pub const DEFAULT_PAUSE_SECS: i64 = 60;

/// Packs tasks into a day timeline.
///
/// Fixed-time tasks keep their anchor; flexible tasks fill the gaps in order of
/// priority plus age, so an unstarted flexible task gains one point per day it
/// waits.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    pause: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new(DEFAULT_PAUSE_SECS)
    }
}

/// Sorting key for flexible tasks: priority plus whole days waited.
pub fn effective_priority(task: &Task, day: NaiveDate) -> i64 {
    i64::from(task.priority) + task.days_since_creation(day)
}

fn start_of(day: NaiveDate) -> NaiveDateTime {
    day.and_time(NaiveTime::MIN)
}

impl Scheduler {
    pub fn new(pause_secs: i64) -> Self {
        Scheduler {
            pause: Duration::seconds(pause_secs.clamp(0, MAX_DURATION_SECS)),
        }
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Where the cursor lands after `task` and the following pause.
    fn end_of(&self, start: NaiveDateTime, task: &Task) -> NaiveDateTime {
        let busy = offset_by(start, task.time_left_secs);
        busy.checked_add_signed(self.pause).unwrap_or(NaiveDateTime::MAX)
    }

    /// Plans one day. Every returned task carries `estimated_start_time`.
    pub fn sort(&self, tasks: Vec<Task>, day: NaiveDate, now: NaiveDateTime) -> Vec<Task> {
        let (mut flexible, mut fixed): (Vec<Task>, Vec<Task>) =
            tasks.into_iter().partition(|t| !t.fixed_time);

        flexible.sort_by(|a, b| {
            effective_priority(b, day)
                .cmp(&effective_priority(a, day))
                .then(a.created_time.cmp(&b.created_time))
                .then(a.id.cmp(&b.id))
        });
        fixed.sort_by(|a, b| a.created_time.cmp(&b.created_time).then(a.id.cmp(&b.id)));

        let mut flexible = flexible.into_iter().peekable();
        let mut fixed = fixed.into_iter().peekable();
        let mut cursor = now.max(start_of(day));
        let mut planned = Vec::new();

        loop {
            let take_flexible = match (flexible.peek(), fixed.peek()) {
                (None, None) => break,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(next), Some(anchor)) => {
                    self.end_of(cursor, next) <= anchor.created_time
                }
            };

            let next = if take_flexible { flexible.next() } else { fixed.next() };
            let Some(mut task) = next else { break };

            let start = if take_flexible {
                cursor
            } else {
                task.created_time.max(now).max(cursor)
            };
            task.estimated_start_time = Some(start);
            cursor = cursor.max(self.end_of(start, &task));
            planned.push(task);
        }

        planned
    }

    /// The plan for `end_day`, simulated forward from `start_day`.
    ///
    /// Remaining work that does not fit before a midnight rolls into the next
    /// simulated day, so overdue tasks surface on later days with their
    /// identity intact. An `end_day` before `start_day` has no plan.
    pub fn schedule_range(
        &self,
        working_set: &WorkingSet,
        start_day: NaiveDate,
        end_day: NaiveDate,
        now: NaiveDateTime,
    ) -> Vec<Task> {
        if end_day < start_day {
            debug!("no schedule for past day {end_day}");
            return Vec::new();
        }

        let templates: Vec<&Task> = working_set.templates().collect();
        let mut remaining: Vec<Task> = working_set
            .instances()
            .filter(|t| t.is_remaining())
            .cloned()
            .collect();
        let mut day = start_day;

        loop {
            let added = expand_for_day(templates.iter().copied(), day, working_set);
            let (current, following): (Vec<Task>, Vec<Task>) = remaining
                .into_iter()
                .chain(added)
                .partition(|t| t.date() <= day);

            let midnight = start_of(day + Duration::days(1));
            let (today, spillover): (Vec<Task>, Vec<Task>) = self
                .sort(current, day, now)
                .into_iter()
                .partition(|t| t.estimated_end().map_or(true, |end| end < midnight));

            if day >= end_day {
                return today;
            }

            debug!("{day}: {} planned, {} spill over", today.len(), spillover.len());
            remaining = spillover.into_iter().chain(following).collect();
            day = day + Duration::days(1);
        }
    }
}
