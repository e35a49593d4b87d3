use std::collections::HashSet;

use chrono::{Duration, NaiveDate};

use crate::models::{Recurrence, Task, TaskKey};
use crate::working_set::WorkingSet;

/// Materializes the instances that `templates` produce on `day`.
///
/// Instances whose identity is already present in `existing` (remaining or
/// finished) are skipped, so expanding the same day twice yields nothing new.
pub fn expand_for_day<'a, I>(templates: I, day: NaiveDate, existing: &WorkingSet) -> Vec<Task>
where
    I: IntoIterator<Item = &'a Task>,
{
    let mut seen: HashSet<TaskKey> = HashSet::new();
    templates
        .into_iter()
        .filter(|t| t.is_template && t.occurs_on(day))
        .map(|t| t.instance_on(day))
        .filter(|instance| {
            let key = instance.key();
            !existing.contains(&key) && seen.insert(key)
        })
        .collect()
}

/// Instances of `template` missed on the days before `target_day`.
///
/// Looks back at most `max_days` days, never past the template's creation day,
/// and only at days the rule actually fires on. Only every-n-days rules are
/// backfilled; one-shot and monthly templates yield nothing.
pub fn backfill(template: &Task, target_day: NaiveDate, max_days: u32, existing: &WorkingSet) -> Vec<Task> {
    let interval = match template.recurrence() {
        Ok(Recurrence::EveryDays(n)) if n >= 1 => i64::from(n),
        _ => return Vec::new(),
    };

    let since = template.days_since_creation(target_day);
    if since <= 0 {
        return Vec::new();
    }
    let horizon = since.min(i64::from(max_days));
    let first = match since % interval {
        0 => interval,
        offset => offset,
    };

    (first..=horizon)
        .step_by(interval as usize)
        .map(|offset| template.instance_on(target_day - Duration::days(offset)))
        .filter(|instance| !existing.contains(&instance.key()))
        .collect()
}
