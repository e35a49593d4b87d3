use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context};
use chrono::{NaiveDate, NaiveDateTime};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::engine::{Action, Engine, EngineOptions, RemoveMode, ToggleSource};
use crate::error::TimerError;
use crate::focus::FocusService;
use crate::models::{format_time_left, Recurrence, Task, TaskId};
use crate::signal::{ActionKind, Signal};
use crate::storage::{JsonStore, Store};

/// An engine loaded from the task database for one command.
pub struct Session {
    pub engine: Engine,
    pub config: Config,
    signals: Option<mpsc::UnboundedReceiver<Signal>>,
}

impl Session {
    /// Opens the database named by `config` and loads it for today.
    pub async fn open(config: Config) -> anyhow::Result<Session> {
        let path = config.db_path();
        let store = JsonStore::open(&path).with_context(|| format!("opening {}", path.display()))?;
        debug!("task database at {}", path.display());
        Session::open_with(config, Arc::new(store), Arc::new(SystemClock)).await
    }

    pub async fn open_with(config: Config, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> anyhow::Result<Session> {
        let today = clock.now().date();
        let (engine, signals) = Engine::new(store, clock, EngineOptions::from(&config));
        engine.load(today).await?;
        Ok(Session {
            engine,
            config,
            signals: Some(signals),
        })
    }

    fn today(&self) -> NaiveDate {
        self.engine.today()
    }

    /// Writes everything queued and stops the engine.
    pub async fn close(self) {
        self.engine.shutdown().await;
    }
}

/// Parses a duration such as `25m`, `1h30m`, `90s` or `1:30:00`. A bare
/// number counts minutes.
pub fn parse_duration(s: &str) -> Result<i64, TimerError> {
    let invalid = || TimerError::InvalidInput(format!("invalid duration '{s}'. Use e.g. 25m, 1h30m, 90s or 1:30:00."));
    let too_long = || TimerError::InvalidInput(format!("duration '{s}' is too long"));
    let s = s.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(minutes) = s.parse::<i64>() {
        return minutes.checked_mul(60).ok_or_else(too_long);
    }
    if s.contains(':') {
        let parts: Vec<i64> = s
            .split(':')
            .map(|p| p.parse::<i64>().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        let units: &[i64] = match parts.len() {
            2 => &[60, 1],
            3 => &[3600, 60, 1],
            _ => return Err(invalid()),
        };
        return parts
            .iter()
            .zip(units)
            .try_fold(0i64, |total, (n, unit)| n.checked_mul(*unit)?.checked_add(total))
            .ok_or_else(too_long);
    }

    let mut total: i64 = 0;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c.to_ascii_lowercase() {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid()),
        };
        let n: i64 = digits.parse().map_err(|_| invalid())?;
        total = n
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(too_long)?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(total)
}

/// A signed duration: `+5m`, `-30s`, or an unsigned one meaning `+`.
pub fn parse_delta(s: &str) -> Result<i64, TimerError> {
    let s = s.trim();
    match s.strip_prefix('-') {
        Some(rest) => Ok(parse_duration(rest)?.saturating_neg()),
        None => parse_duration(s.strip_prefix('+').unwrap_or(s)),
    }
}

pub fn parse_day(s: &str) -> Result<NaiveDate, TimerError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| TimerError::InvalidInput(format!("invalid date '{s}': {e}. Use YYYY-MM-DD.")))
}

pub fn parse_at(s: &str) -> Result<NaiveDateTime, TimerError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .map_err(|e| TimerError::InvalidInput(format!("invalid time '{s}': {e}. Use \"YYYY-MM-DD HH:MM\".")))
}

fn recurrence_label(task: &Task) -> String {
    match task.recurrence() {
        Ok(Recurrence::Once) => "-".to_string(),
        Ok(Recurrence::Monthly) => "monthly".to_string(),
        Ok(Recurrence::EveryDays(1)) => "daily".to_string(),
        Ok(Recurrence::EveryDays(n)) => format!("every {n}d"),
        Err(_) => "?".to_string(),
    }
}

/// Options for a new task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub text: String,
    pub duration: String,
    pub priority: i32,
    /// Repeat every n days.
    pub every: Option<u32>,
    pub monthly: bool,
    /// Fixed start, `YYYY-MM-DD HH:MM`.
    pub at: Option<String>,
    pub color: Option<String>,
}

/// Adds a task. Recurring tasks are stored as templates.
pub async fn cmd_add(session: &Session, new: NewTask, silent: bool) -> anyhow::Result<TaskId> {
    let duration_secs = parse_duration(&new.duration)?;
    let recurrence = match (new.every, new.monthly) {
        (Some(_), true) => bail!("--every and --monthly cannot be combined"),
        (Some(0), false) => bail!("--every needs at least 1 day"),
        (Some(n), false) if i32::try_from(n).is_err() => bail!("--every accepts at most {} days", i32::MAX),
        (Some(n), false) => Recurrence::EveryDays(n),
        (None, true) => Recurrence::Monthly,
        (None, false) => Recurrence::Once,
    };
    let (created_time, fixed) = match &new.at {
        Some(at) => (parse_at(at)?, true),
        None => (session.engine.clock().now(), false),
    };

    let id = session.engine.next_id().await;
    let task = Task::new(id, new.text, duration_secs, created_time)
        .with_priority(new.priority)
        .with_fixed_time(fixed)
        .with_color(new.color.unwrap_or_else(|| session.config.default_color.clone()))
        .with_recurrence(recurrence);

    session.engine.apply(Action::Add(task), session.today()).await?;
    info!("added task {id}");
    if !silent {
        println!("Task added (id = {})", id);
    }
    Ok(id)
}

/// Prints the plan for `day` (default today).
///
/// With `all`, finished tasks of that day are listed after the plan.
pub async fn cmd_list(session: &Session, day: Option<NaiveDate>, all: bool) -> anyhow::Result<()> {
    let day = day.unwrap_or_else(|| session.today());
    let schedule = session.engine.refresh(day).await;
    let finished: Vec<Task> = if all {
        session
            .engine
            .records()
            .await
            .into_iter()
            .filter(|t| !t.is_template && !t.is_remaining() && t.date() == day)
            .collect()
    } else {
        Vec::new()
    };

    if schedule.tasks.is_empty() && finished.is_empty() {
        println!("Nothing planned for {day}.");
        return Ok(());
    }

    let now = session.engine.clock().now();
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").add_attribute(Attribute::Bold),
            Cell::new("Task").add_attribute(Attribute::Bold),
            Cell::new("Start").add_attribute(Attribute::Bold),
            Cell::new("Left").add_attribute(Attribute::Bold),
            Cell::new("Prio").add_attribute(Attribute::Bold),
            Cell::new("Repeat").add_attribute(Attribute::Bold),
            Cell::new("Status").add_attribute(Attribute::Bold),
        ]);

    for t in &schedule.tasks {
        let start = t
            .estimated_start_time
            .map(|s| s.format("%H:%M").to_string())
            .unwrap_or_default();
        let (status, status_color) = if t.is_running {
            ("Running", Color::Green)
        } else if t.date() < day {
            ("Overdue", Color::Red)
        } else if t.fixed_time {
            ("Fixed", Color::Cyan)
        } else {
            ("Pending", Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(t.id),
            Cell::new(&t.text),
            Cell::new(start),
            Cell::new(format_time_left(t.time_left_at(now))),
            Cell::new(t.priority),
            Cell::new(recurrence_label(t)),
            Cell::new(status).fg(status_color),
        ]);
    }
    for t in &finished {
        table.add_row(vec![
            Cell::new(t.id).fg(Color::Grey),
            Cell::new(&t.text).fg(Color::Grey),
            Cell::new(""),
            Cell::new(format_time_left(0)).fg(Color::Grey),
            Cell::new(t.priority).fg(Color::Grey),
            Cell::new(recurrence_label(t)).fg(Color::Grey),
            Cell::new("Done").fg(Color::Green),
        ]);
    }

    println!("{table}");
    Ok(())
}

async fn set_running(session: &Session, id: TaskId, run: bool, silent: bool) -> anyhow::Result<()> {
    let task = session.engine.lookup(id).await?;
    if !task.is_remaining() {
        bail!("Task {} is already finished.", id);
    }
    if task.is_running == run {
        if !silent {
            println!("Task {} is already {}.", id, if run { "running" } else { "stopped" });
        }
        return Ok(());
    }
    let action = Action::SetRunningState {
        task,
        source: ToggleSource::Button,
    };
    session.engine.apply(action, session.today()).await?;
    if !silent {
        println!("Task {} {}.", id, if run { "started" } else { "stopped" });
    }
    Ok(())
}

/// Starts the countdown of a task.
pub async fn cmd_start(session: &Session, id: TaskId, silent: bool) -> anyhow::Result<()> {
    set_running(session, id, true, silent).await
}

/// Stops the countdown of a task, keeping the time left.
pub async fn cmd_stop(session: &Session, id: TaskId, silent: bool) -> anyhow::Result<()> {
    set_running(session, id, false, silent).await
}

/// Sets the time left of a task.
pub async fn cmd_set_time(session: &Session, id: TaskId, left: &str, silent: bool) -> anyhow::Result<()> {
    let seconds = parse_duration(left)?;
    let task = session.engine.lookup(id).await?;
    let schedule = session
        .engine
        .apply(Action::SetTime { task, seconds }, session.today())
        .await?;
    if !silent {
        let left = schedule.find(id).map_or(0, |t| t.time_left_secs);
        println!("Task {} has {} left.", id, format_time_left(left));
    }
    Ok(())
}

/// Adds to or takes from the time left of a task.
pub async fn cmd_adjust(session: &Session, id: TaskId, delta: &str, silent: bool) -> anyhow::Result<()> {
    let delta = parse_delta(delta)?;
    let task = session.engine.lookup(id).await?;
    let key = task.key().concrete();
    session
        .engine
        .apply(Action::ModifyTime { task, delta }, session.today())
        .await?;
    if !silent {
        let left = session.engine.task(&key).await?.time_left_at(session.engine.clock().now());
        println!("Task {} has {} left.", id, format_time_left(left));
    }
    Ok(())
}

/// Prints every field of a task and marks it expanded.
pub async fn cmd_detail(session: &Session, id: TaskId, hide: bool) -> anyhow::Result<()> {
    let task = session.engine.lookup(id).await?;
    let now = session.engine.clock().now();
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["Field", "Value"]);
    table.add_row(vec!["ID".to_string(), task.id.to_string()]);
    table.add_row(vec!["Task".to_string(), task.text.clone()]);
    table.add_row(vec!["Created".to_string(), task.created_time.format("%Y-%m-%d %H:%M").to_string()]);
    table.add_row(vec!["Duration".to_string(), format_time_left(task.duration_secs)]);
    table.add_row(vec!["Left".to_string(), format_time_left(task.time_left_at(now))]);
    table.add_row(vec!["Priority".to_string(), task.priority.to_string()]);
    table.add_row(vec!["Repeat".to_string(), recurrence_label(&task)]);
    table.add_row(vec!["Fixed".to_string(), if task.fixed_time { "yes" } else { "no" }.to_string()]);
    table.add_row(vec!["Color".to_string(), task.color.clone()]);
    table.add_row(vec![
        "Planned".to_string(),
        task.estimated_start_time
            .map(|s| s.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into()),
    ]);
    println!("{table}");

    let action = Action::SetDetail { task, visible: !hide };
    session.engine.apply(action, session.today()).await?;
    Ok(())
}

/// Marks a task done, or with `all` deletes it and every repetition.
pub async fn cmd_remove(session: &Session, id: TaskId, all: bool, silent: bool) -> anyhow::Result<()> {
    let task = session.engine.lookup(id).await?;
    let mode = if all { RemoveMode::Hard } else { RemoveMode::Soft };
    session.engine.apply(Action::Remove { task, mode }, session.today()).await?;
    if !silent {
        match mode {
            RemoveMode::Soft => println!("Task {} marked as done.", id),
            RemoveMode::Hard => println!("Task {} removed.", id),
        }
    }
    Ok(())
}

/// Changes to an existing task.
#[derive(Debug, Clone, Default)]
pub struct TaskEdit {
    pub text: Option<String>,
    pub duration: Option<String>,
    pub priority: Option<i32>,
    pub color: Option<String>,
}

/// Edits a task, its template and the open instances sharing its id.
pub async fn cmd_edit(session: &Session, id: TaskId, edit: TaskEdit, silent: bool) -> anyhow::Result<()> {
    let duration = edit.duration.as_deref().map(parse_duration).transpose()?;
    let targets: Vec<Task> = session
        .engine
        .records()
        .await
        .into_iter()
        .filter(|t| t.id == id && (t.is_template || t.is_remaining()))
        .collect();
    if targets.is_empty() {
        return Err(TimerError::IdNotFound(id).into());
    }

    let edited: Vec<Task> = targets
        .into_iter()
        .map(|mut t| {
            if let Some(text) = &edit.text {
                t.text = text.clone();
            }
            if let Some(p) = edit.priority {
                t = t.with_priority(p);
            }
            if let Some(c) = &edit.color {
                t.color = c.clone();
            }
            if let Some(d) = duration {
                let untouched = t.time_left_secs == t.duration_secs;
                t.duration_secs = d.max(0);
                if untouched {
                    t.time_left_secs = t.duration_secs;
                    t.time_left_at_period_start = t.duration_secs;
                }
            }
            t
        })
        .collect();

    session
        .engine
        .apply(Action::AddMultiple(edited), session.today())
        .await?;
    if !silent {
        println!("Task {} updated.", id);
    }
    Ok(())
}

/// Counts running tasks down live until they finish or Ctrl-C.
pub async fn cmd_run(session: &mut Session, silent: bool) -> anyhow::Result<()> {
    let running = session.engine.running_tasks().await;
    if running.is_empty() {
        if !silent {
            println!("No running tasks. Start one with `tasktimer start <ID>`.");
        }
        return Ok(());
    }
    let Some(signals) = session.signals.take() else {
        bail!("the countdown is already running");
    };

    let focus = FocusService::new(
        session.engine.clone(),
        session.config.seek_step_secs,
        session.config.tick_offset_ms,
    );
    for task in running {
        let left = task.time_left_secs;
        focus.handle(Signal::with_value(ActionKind::Add, task, left)).await?;
    }
    let cancel = session.engine.cancel_token();
    let service = focus.spawn(signals, cancel.clone());
    let ticker = session.engine.spawn_ticker(true);

    let mut redraw = tokio::time::interval(StdDuration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if !silent {
                    println!();
                }
                info!("interrupted");
                break;
            }
            _ = redraw.tick() => {
                if ticker.is_finished() {
                    if !silent {
                        println!("\nAll running tasks finished.");
                    }
                    break;
                }
                if !silent {
                    if let Some(line) = focus.describe().await {
                        print!("\r\x1b[2K{line}");
                        io::stdout().flush()?;
                    }
                }
            }
        }
    }

    ticker.stop().await;
    cancel.cancel();
    let _ = service.await;
    Ok(())
}

/// Deletes the task database.
pub fn cmd_reset(path: PathBuf, force: bool) -> anyhow::Result<()> {
    if !force {
        print!("Are you sure you want to delete all tasks? This cannot be undone. [y/N] ");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if input.trim().to_lowercase() != "y" {
            println!("Aborted.");
            return Ok(());
        }
    }

    JsonStore::open(path)?.delete_database()?;
    println!("Database reset successfully.");
    Ok(())
}
