//! The state reconciliation engine.
//!
//! [`Engine`] owns the working set behind one async mutex. Every mutation goes
//! through [`Engine::apply`], which reduces an [`Action`] onto the working set,
//! queues the matching store writes, recomputes the schedule for the caller's
//! display day and publishes it, all before the lock is released.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Result, TimerError};
use crate::models::{Task, TaskId, TaskKey, TaskStatus};
use crate::recurrence::backfill;
use crate::scheduler::{Scheduler, DEFAULT_PAUSE_SECS};
use crate::signal::{ActionKind, Signal};
use crate::storage::{PersistQueue, Store};
use crate::ticker::{TickFlow, Ticker};
use crate::working_set::WorkingSet;

/// Scope of a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    /// Mark the instance finished and keep it as history.
    Soft,
    /// Drop the template and every instance sharing the id.
    Hard,
}

impl RemoveMode {
    /// `0` is soft, anything else hard.
    pub fn from_value(value: i64) -> RemoveMode {
        if value == 0 {
            RemoveMode::Soft
        } else {
            RemoveMode::Hard
        }
    }

    pub fn value(self) -> i64 {
        match self {
            RemoveMode::Soft => 0,
            RemoveMode::Hard => 1,
        }
    }
}

/// Where a running-state toggle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleSource {
    /// An explicit start/stop. Always flips.
    Button,
    /// A scrub gesture. Pauses a running task, and resumes it only if the
    /// previous seek was what paused it.
    Seek,
    /// Stops a running task and leaves a stopped one alone.
    Stop,
}

impl ToggleSource {
    /// Loose form: 1 seek, 2 stop, anything else a button press.
    pub fn from_value(value: i64) -> Self {
        match value {
            1 => ToggleSource::Seek,
            2 => ToggleSource::Stop,
            _ => ToggleSource::Button,
        }
    }

    pub fn value(self) -> i64 {
        match self {
            ToggleSource::Button => 0,
            ToggleSource::Seek => 1,
            ToggleSource::Stop => 2,
        }
    }
}

/// A mutation of the working set.
#[derive(Debug, Clone)]
pub enum Action {
    Add(Task),
    AddMultiple(Vec<Task>),
    Remove { task: Task, mode: RemoveMode },
    SetTime { task: Task, seconds: i64 },
    ModifyTime { task: Task, delta: i64 },
    SetRunningState { task: Task, source: ToggleSource },
    SetDetail { task: Task, visible: bool },
    TimeDecrease,
}

fn missing(kind: ActionKind, what: &'static str) -> TimerError {
    TimerError::MissingArgument { kind, what }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Add(_) => ActionKind::Add,
            Action::AddMultiple(_) => ActionKind::AddMultiple,
            Action::Remove { .. } => ActionKind::Remove,
            Action::SetTime { .. } => ActionKind::SetTime,
            Action::ModifyTime { .. } => ActionKind::ModifyTime,
            Action::SetRunningState { .. } => ActionKind::SetRunningState,
            Action::SetDetail { .. } => ActionKind::SetDetail,
            Action::TimeDecrease => ActionKind::TimeDecrease,
        }
    }

    /// Builds an action from its loose `(kind, task?, batch?, value)` form.
    ///
    /// `value` is the removal scope for `REMOVE` (0 soft, else hard), seconds
    /// for `SET_TIME`, a delta for `MODIFY_TIME`, the toggle source for
    /// `SET_RUNNING_STATE` (1 seek, 2 stop, else button) and visibility for
    /// `SET_DETAIL` (non-zero shown). Kinds the engine does not apply are an
    /// error.
    pub fn from_parts(kind: ActionKind, task: Option<Task>, batch: Option<Vec<Task>>, value: i64) -> Result<Action> {
        let require = || task.ok_or_else(|| missing(kind, "a task"));
        match kind {
            ActionKind::Add => Ok(Action::Add(require()?)),
            ActionKind::AddMultiple => Ok(Action::AddMultiple(batch.ok_or_else(|| missing(kind, "a batch"))?)),
            ActionKind::Remove => Ok(Action::Remove {
                task: require()?,
                mode: RemoveMode::from_value(value),
            }),
            ActionKind::SetTime => Ok(Action::SetTime { task: require()?, seconds: value }),
            ActionKind::ModifyTime => Ok(Action::ModifyTime { task: require()?, delta: value }),
            ActionKind::SetRunningState => Ok(Action::SetRunningState {
                task: require()?,
                source: ToggleSource::from_value(value),
            }),
            ActionKind::SetDetail => Ok(Action::SetDetail {
                task: require()?,
                visible: value != 0,
            }),
            ActionKind::TimeDecrease => Ok(Action::TimeDecrease),
            other => Err(TimerError::UnsupportedAction(other.to_string())),
        }
    }
}

/// A published plan for one display day.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub day: NaiveDate,
    pub generated_at: NaiveDateTime,
    /// Tasks in planned order, each with `estimated_start_time` set.
    pub tasks: Vec<Task>,
}

impl Schedule {
    pub fn empty(day: NaiveDate, generated_at: NaiveDateTime) -> Schedule {
        Schedule { day, generated_at, tasks: Vec::new() }
    }

    pub fn find(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Tunables taken from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub pause_secs: i64,
    pub retention_days: i64,
    pub backfill_days: u32,
    pub tick_offset_ms: i64,
    pub persist_retries: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            pause_secs: DEFAULT_PAUSE_SECS,
            retention_days: 7,
            backfill_days: 7,
            tick_offset_ms: 0,
            persist_retries: 3,
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        EngineOptions {
            pause_secs: config.pause_secs,
            retention_days: config.retention_days,
            backfill_days: config.backfill_days,
            tick_offset_ms: config.tick_offset_ms,
            persist_retries: config.persist_retries,
        }
    }
}

struct EngineState {
    working_set: WorkingSet,
    display_day: NaiveDate,
    /// Running tasks stopped by a seek gesture, to be resumed by the next one.
    paused_by_seek: HashSet<TaskKey>,
}

struct Inner {
    state: Mutex<EngineState>,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    store: Arc<dyn Store>,
    persist: PersistQueue,
    signals: mpsc::UnboundedSender<Signal>,
    published: watch::Sender<Schedule>,
    cancel: CancellationToken,
    options: EngineOptions,
}

/// Handle to the engine. Cheap to clone; all clones share one working set.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Creates an engine over `store` and spawns its persistence worker.
    ///
    /// Returns the receiving end of the outbound signal channel, which the
    /// notification surface consumes. Must be called inside a tokio runtime.
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> (Engine, mpsc::UnboundedReceiver<Signal>) {
        let cancel = CancellationToken::new();
        let (persist, _worker) = PersistQueue::spawn(Arc::clone(&store), options.persist_retries, cancel.child_token());
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let now = clock.now();
        let (published, _) = watch::channel(Schedule::empty(now.date(), now));

        let inner = Inner {
            state: Mutex::new(EngineState {
                working_set: WorkingSet::new(),
                display_day: now.date(),
                paused_by_seek: HashSet::new(),
            }),
            scheduler: Scheduler::new(options.pause_secs),
            clock,
            store,
            persist,
            signals,
            published,
            cancel,
            options,
        };
        (Engine { inner: Arc::new(inner) }, signal_rx)
    }

    /// Reads every stored record into the working set.
    ///
    /// Finished instances older than the retention window are deleted, then
    /// missed occurrences of every template are backfilled.
    pub async fn load(&self, display_day: NaiveDate) -> Result<Schedule> {
        let store = Arc::clone(&self.inner.store);
        let records = tokio::task::spawn_blocking(move || store.get_all()).await??;

        let mut state = self.inner.state.lock().await;
        state.display_day = display_day;
        let now = self.inner.clock.now();

        let cutoff = (display_day - Duration::days(self.inner.options.retention_days)).and_time(NaiveTime::MIN);
        let is_expired =
            move |t: &Task| !t.is_template && t.status == TaskStatus::Finished && t.created_time < cutoff;
        let (expired, kept): (Vec<Task>, Vec<Task>) = records.into_iter().partition(|t| is_expired(t));
        if !expired.is_empty() {
            info!("purging {} finished tasks older than {cutoff}", expired.len());
            self.inner.persist.delete_where(is_expired);
        }
        for mut task in kept {
            task.normalize();
            state.working_set.upsert(task);
        }
        // Countdowns kept running while no process was up.
        self.time_decrease(&mut state, now);

        let today = now.date();
        let missed: Vec<Task> = state
            .working_set
            .templates()
            .flat_map(|template| backfill(template, today, self.inner.options.backfill_days, &state.working_set))
            .collect();
        if !missed.is_empty() {
            info!("backfilling {} missed occurrences", missed.len());
            self.reduce(&mut state, Action::AddMultiple(missed), now)?;
        }

        debug!("loaded {} records", state.working_set.len());
        Ok(self.publish(&state, now))
    }

    /// Applies one action and returns the schedule published for `display_day`.
    pub async fn apply(&self, action: Action, display_day: NaiveDate) -> Result<Schedule> {
        self.run(action, Some(display_day)).await
    }

    /// [`Engine::apply`] for the loose argument form.
    pub async fn dispatch(
        &self,
        kind: ActionKind,
        task: Option<Task>,
        batch: Option<Vec<Task>>,
        value: i64,
        display_day: NaiveDate,
    ) -> Result<Schedule> {
        let action = Action::from_parts(kind, task, batch, value)?;
        self.apply(action, display_day).await
    }

    /// Applies a signal sent back by the notification surface, for the last
    /// display day.
    pub async fn apply_signal(&self, signal: Signal) -> Result<Schedule> {
        let action = Action::from_parts(signal.kind, signal.task, None, signal.value.unwrap_or(0))?;
        self.run(action, None).await
    }

    /// One `TIME_DECREASE` for the last display day.
    pub async fn tick(&self) -> Result<Schedule> {
        self.run(Action::TimeDecrease, None).await
    }

    async fn run(&self, action: Action, display_day: Option<NaiveDate>) -> Result<Schedule> {
        let mut state = self.inner.state.lock().await;
        if let Some(day) = display_day {
            state.display_day = day;
        }
        let now = self.inner.clock.now();
        if !matches!(action, Action::TimeDecrease) {
            debug!(action = %action.kind(), "apply");
        }
        self.reduce(&mut state, action, now)?;
        Ok(self.publish(&state, now))
    }

    fn reduce(&self, state: &mut EngineState, action: Action, now: NaiveDateTime) -> Result<()> {
        match action {
            Action::Add(task) => self.add(state, task),
            Action::AddMultiple(tasks) => {
                for task in tasks {
                    self.add(state, task);
                }
            }
            Action::Remove { task, mode } => self.remove(state, &task, mode),
            Action::SetTime { task, seconds } => {
                let mut task = state.working_set.get_or_create(&task);
                task.set_time_left(seconds, now);
                self.after_time_change(state, task);
            }
            Action::ModifyTime { task, delta } => {
                let mut task = state.working_set.get_or_create(&task);
                let current = task.time_left_at(now);
                task.set_time_left(current.saturating_add(delta), now);
                self.after_time_change(state, task);
            }
            Action::SetRunningState { task, source } => self.toggle(state, &task, source, now),
            Action::SetDetail { task, visible } => {
                let mut task = state.working_set.get_or_create(&task);
                task.is_detail_visible = visible;
                self.store(state, task);
            }
            Action::TimeDecrease => self.time_decrease(state, now),
        }
        Ok(())
    }

    fn add(&self, state: &mut EngineState, mut task: Task) {
        task.normalize();
        self.store(state, task);
    }

    fn remove(&self, state: &mut EngineState, task: &Task, mode: RemoveMode) {
        let mut task = state.working_set.get_or_create(task);
        let was_running = match mode {
            RemoveMode::Soft => {
                let was_running = task.is_running;
                state.paused_by_seek.remove(&task.key());
                task.finish();
                self.store(state, task.clone());
                was_running
            }
            RemoveMode::Hard => {
                let removed = state.working_set.remove_all_with_id(task.id);
                state.paused_by_seek.retain(|k| k.id != task.id);
                self.inner.persist.delete_by_id(task.id);
                info!("removed task {} ({} records)", task.id, removed.len());
                task.is_running || removed.iter().any(|t| t.is_running)
            }
        };
        if was_running {
            self.notify(Signal::with_value(ActionKind::Remove, task, mode.value()));
        }
    }

    fn after_time_change(&self, state: &mut EngineState, mut task: Task) {
        if task.time_left_secs > 0 && task.status == TaskStatus::Finished {
            task.status = TaskStatus::Remaining;
        }
        if task.is_running {
            self.notify(Signal::with_value(ActionKind::SetTime, task.clone(), task.time_left_secs));
        }
        self.store(state, task);
    }

    fn toggle(&self, state: &mut EngineState, task: &Task, source: ToggleSource, now: NaiveDateTime) {
        let mut task = state.working_set.get_or_create(task);
        let key = task.key();
        let runnable = !task.is_template && task.is_remaining();
        let run = match source {
            ToggleSource::Button => {
                state.paused_by_seek.remove(&key);
                !task.is_running && runnable
            }
            ToggleSource::Seek if task.is_running => {
                state.paused_by_seek.insert(key);
                false
            }
            ToggleSource::Seek => state.paused_by_seek.remove(&key) && runnable,
            ToggleSource::Stop => {
                state.paused_by_seek.remove(&key);
                false
            }
        };

        let was_running = task.is_running;
        if was_running && !run {
            task.time_left_secs = task.time_left_at(now);
            task.is_running = false;
            task.reset_period(now);
        } else if !was_running && run {
            task.is_running = true;
            task.reset_period(now);
        }

        if task.time_left_secs > 0 {
            if was_running != task.is_running {
                let kind = if task.is_running { ActionKind::Add } else { ActionKind::Remove };
                self.notify(Signal::with_value(kind, task.clone(), task.time_left_secs));
            }
            self.store(state, task);
        } else if task.is_remaining() && !task.is_template {
            task.finish();
            state.paused_by_seek.remove(&key);
            info!("task {} finished", task.id);
            if was_running {
                self.notify(Signal::with_value(ActionKind::Remove, task.clone(), RemoveMode::Soft.value()));
            }
            self.notify(Signal::with_task(ActionKind::Finish, task.clone()));
            self.store(state, task);
        } else {
            self.store(state, task);
        }
    }

    fn time_decrease(&self, state: &mut EngineState, now: NaiveDateTime) {
        let mut finished = Vec::new();
        for task in state
            .working_set
            .iter_mut()
            .filter(|t| !t.is_template && t.is_running && t.is_remaining())
        {
            task.time_left_secs = task.time_left_at(now);
            if task.time_left_secs == 0 {
                task.finish();
                finished.push(task.clone());
            }
        }
        for task in finished {
            info!("task {} finished", task.id);
            state.paused_by_seek.remove(&task.key());
            self.inner.persist.put(task.clone());
            self.notify(Signal::with_task(ActionKind::Finish, task));
        }
    }

    /// Upserts into the working set and queues the store write.
    fn store(&self, state: &mut EngineState, task: Task) {
        self.inner.persist.put(task.clone());
        state.working_set.upsert(task);
    }

    fn notify(&self, signal: Signal) {
        if self.inner.signals.send(signal).is_err() {
            debug!("no notification surface listening");
        }
    }

    fn publish(&self, state: &EngineState, now: NaiveDateTime) -> Schedule {
        let tasks = self
            .inner
            .scheduler
            .schedule_range(&state.working_set, now.date(), state.display_day, now);
        let schedule = Schedule {
            day: state.display_day,
            generated_at: now,
            tasks,
        };
        self.inner.published.send_replace(schedule.clone());
        schedule
    }

    /// Publishes the plan for `display_day` without changing any task.
    pub async fn refresh(&self, display_day: NaiveDate) -> Schedule {
        let mut state = self.inner.state.lock().await;
        state.display_day = display_day;
        let now = self.inner.clock.now();
        self.publish(&state, now)
    }

    /// Receives every schedule published from now on.
    pub fn subscribe(&self) -> watch::Receiver<Schedule> {
        self.inner.published.subscribe()
    }

    /// The most recently published schedule.
    pub fn current(&self) -> Schedule {
        self.inner.published.borrow().clone()
    }

    /// The record stored under `key`.
    pub async fn task(&self, key: &TaskKey) -> Result<Task> {
        let state = self.inner.state.lock().await;
        state
            .working_set
            .get(key)
            .cloned()
            .ok_or(TimerError::TaskNotFound(*key))
    }

    /// The concrete task a user means by `id`.
    ///
    /// Prefers the instance in the current schedule, then the latest remaining
    /// instance, then the latest finished one, then the template's occurrence
    /// on the display day.
    pub async fn lookup(&self, id: TaskId) -> Result<Task> {
        let scheduled = self.inner.published.borrow().find(id).cloned();
        if let Some(task) = scheduled {
            return Ok(task);
        }
        let state = self.inner.state.lock().await;
        let latest = |remaining: bool| {
            state
                .working_set
                .instances()
                .filter(|t| t.id == id && t.is_remaining() == remaining)
                .max_by_key(|t| t.created_time)
                .cloned()
        };
        if let Some(task) = latest(true).or_else(|| latest(false)) {
            return Ok(task);
        }
        let occurrence = state
            .working_set
            .templates()
            .find(|t| t.id == id)
            .map(|t| t.instance_on(state.display_day.max(t.date())));
        occurrence.ok_or(TimerError::IdNotFound(id))
    }

    /// Every record, templates included, ordered by identity.
    pub async fn records(&self) -> Vec<Task> {
        let state = self.inner.state.lock().await;
        let mut tasks: Vec<Task> = state.working_set.iter().cloned().collect();
        tasks.sort_by_key(|t| t.key());
        tasks
    }

    pub async fn running_tasks(&self) -> Vec<Task> {
        let state = self.inner.state.lock().await;
        let now = self.inner.clock.now();
        state
            .working_set
            .running()
            .map(|t| {
                let mut task = t.clone();
                task.time_left_secs = task.time_left_at(now);
                task
            })
            .collect()
    }

    /// One past the highest id in use.
    pub async fn next_id(&self) -> TaskId {
        let state = self.inner.state.lock().await;
        state.working_set.max_id().map_or(1, |id| id + 1)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    pub fn today(&self) -> NaiveDate {
        self.inner.clock.now().date()
    }

    /// Token cancelled by [`Engine::shutdown`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    /// Ticks once per second until shutdown. With `stop_when_idle` it also
    /// stops after a tick that leaves no task running.
    pub fn spawn_ticker(&self, stop_when_idle: bool) -> Ticker {
        let engine = self.clone();
        Ticker::spawn(
            self.clock(),
            self.inner.options.tick_offset_ms,
            self.cancel_token(),
            move || {
                let engine = engine.clone();
                async move {
                    if let Err(e) = engine.tick().await {
                        warn!("tick failed: {e}");
                    }
                    if stop_when_idle && engine.running_tasks().await.is_empty() {
                        TickFlow::Stop
                    } else {
                        TickFlow::Continue
                    }
                }
            },
        )
    }

    /// Waits for queued store writes. Returns `false` if the worker is gone.
    pub async fn flush(&self) -> bool {
        self.inner.persist.flush().await
    }

    /// Flushes pending writes, then stops the ticker and persistence worker.
    pub async fn shutdown(&self) {
        if !self.flush().await {
            warn!("persistence worker already stopped");
        }
        self.inner.cancel.cancel();
        debug!("engine shut down");
    }
}
