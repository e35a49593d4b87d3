//! Running-task focus register: the notification surface's view of what runs.
//!
//! The register keeps its own copy of every running task and counts it down
//! from its own period snapshot, so it stays usable while the engine is busy.
//! Changes made here travel back to the engine as [`Signal`]s.

use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::engine::{Engine, RemoveMode, ToggleSource};
use crate::error::{Result, TimerError};
use crate::models::{format_time_left, Task, TaskKey};
use crate::signal::{ActionKind, Signal};
use crate::ticker::{TickFlow, Ticker};

/// Default forward/back step in seconds.
pub const DEFAULT_SEEK_STEP_SECS: i64 = 30;

/// What handling one signal produced.
#[derive(Debug, Default)]
pub struct Reaction {
    /// Signal for the engine, if the register changed a task.
    pub outbound: Option<Signal>,
    /// The register ran empty; the surface should go away.
    pub terminated: bool,
}

impl Reaction {
    fn send(signal: Signal) -> Reaction {
        Reaction {
            outbound: Some(signal),
            terminated: false,
        }
    }

    fn terminated(terminated: bool) -> Reaction {
        Reaction {
            outbound: None,
            terminated,
        }
    }
}

/// Ordered running tasks with one rotating focus.
#[derive(Debug)]
pub struct FocusRegister {
    entries: Vec<Task>,
    focus_index: usize,
    seek_step: i64,
}

impl Default for FocusRegister {
    fn default() -> Self {
        FocusRegister::new(DEFAULT_SEEK_STEP_SECS)
    }
}

impl FocusRegister {
    pub fn new(seek_step: i64) -> Self {
        FocusRegister {
            entries: Vec::new(),
            focus_index: 0,
            seek_step: seek_step.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Task] {
        &self.entries
    }

    pub fn focus_index(&self) -> usize {
        self.focus_index
    }

    pub fn focused(&self) -> Option<&Task> {
        self.entries.get(self.focus_index)
    }

    fn position(&self, key: &TaskKey) -> Option<usize> {
        self.entries.iter().position(|t| t.key() == *key)
    }

    /// Tracks `task` from `now`. A task already present only has its time
    /// left replaced.
    pub fn add(&mut self, task: &Task, now: NaiveDateTime) {
        match self.position(&task.key()) {
            Some(i) => self.entries[i].set_time_left(task.time_left_secs, now),
            None => {
                let mut entry = task.clone();
                entry.is_running = true;
                entry.reset_period(now);
                self.entries.push(entry);
            }
        }
    }

    /// Drops the entry for `key`, or with [`RemoveMode::Hard`] every entry
    /// sharing its id. Returns `true` when nothing is left to show.
    pub fn remove(&mut self, key: &TaskKey, mode: RemoveMode) -> bool {
        match mode {
            RemoveMode::Soft => self.entries.retain(|t| t.key() != *key),
            RemoveMode::Hard => self.entries.retain(|t| t.id != key.id),
        }
        self.clamp_focus()
    }

    fn clamp_focus(&mut self) -> bool {
        if self.entries.is_empty() {
            self.focus_index = 0;
            return true;
        }
        self.focus_index %= self.entries.len();
        false
    }

    /// Mirrors a time change made by the engine. Returns whether `key` is
    /// tracked.
    pub fn set_time(&mut self, key: &TaskKey, secs: i64, now: NaiveDateTime) -> bool {
        match self.position(key) {
            Some(i) => {
                self.entries[i].set_time_left(secs, now);
                true
            }
            None => false,
        }
    }

    fn seek(&mut self, delta: i64, now: NaiveDateTime) -> Option<Signal> {
        let entry = self.entries.get_mut(self.focus_index)?;
        let current = entry.time_left_at(now);
        entry.set_time_left(current + delta, now);
        let value = entry.time_left_secs;
        Some(Signal::with_value(ActionKind::SetTime, entry.clone(), value))
    }

    /// Skips the focused task ahead by one step.
    pub fn forward(&mut self, now: NaiveDateTime) -> Option<Signal> {
        self.seek(-self.seek_step, now)
    }

    /// Gives the focused task one step back.
    pub fn back(&mut self, now: NaiveDateTime) -> Option<Signal> {
        self.seek(self.seek_step, now)
    }

    pub fn previous(&mut self) {
        if !self.entries.is_empty() {
            let len = self.entries.len();
            self.focus_index = (self.focus_index + len - 1) % len;
        }
    }

    pub fn next(&mut self) {
        if !self.entries.is_empty() {
            self.focus_index = (self.focus_index + 1) % self.entries.len();
        }
    }

    /// Stops the focused task. The returned reaction asks the engine to stop
    /// it too.
    pub fn play(&mut self, now: NaiveDateTime) -> Reaction {
        let Some(entry) = self.entries.get(self.focus_index) else {
            return Reaction::terminated(true);
        };
        let mut task = entry.clone();
        task.time_left_secs = task.time_left_at(now);
        let terminated = self.remove(&task.key(), RemoveMode::Soft);
        Reaction {
            outbound: Some(Signal::with_value(ActionKind::SetRunningState, task, ToggleSource::Stop.value())),
            terminated,
        }
    }

    /// Counts every entry down to `now`. Entries that reach zero are removed
    /// and returned.
    pub fn tick(&mut self, now: NaiveDateTime) -> Vec<Task> {
        for entry in &mut self.entries {
            entry.time_left_secs = entry.time_left_at(now);
        }
        let (finished, running): (Vec<Task>, Vec<Task>) =
            std::mem::take(&mut self.entries).into_iter().partition(|t| t.time_left_secs == 0);
        self.entries = running;
        if !finished.is_empty() {
            self.clamp_focus();
        }
        finished
    }

    /// Applies a signal from the engine or from the surface's own controls.
    pub fn handle(&mut self, signal: Signal, now: NaiveDateTime) -> Result<Reaction> {
        match signal.kind {
            ActionKind::Add => {
                let mut task = signal.require_task()?.clone();
                if let Some(value) = signal.value {
                    task.time_left_secs = value;
                }
                self.add(&task, now);
                Ok(Reaction::default())
            }
            ActionKind::Remove => {
                let key = signal.require_task()?.key();
                let mode = RemoveMode::from_value(signal.value.unwrap_or(0));
                Ok(Reaction::terminated(self.remove(&key, mode)))
            }
            ActionKind::Finish => {
                let key = signal.require_task()?.key();
                Ok(Reaction::terminated(self.remove(&key, RemoveMode::Soft)))
            }
            ActionKind::SetTime => {
                let task = signal.require_task()?;
                let secs = signal.value.unwrap_or(task.time_left_secs);
                self.set_time(&task.key(), secs, now);
                Ok(Reaction::default())
            }
            ActionKind::Forward => Ok(self.forward(now).map(Reaction::send).unwrap_or_default()),
            ActionKind::Back => Ok(self.back(now).map(Reaction::send).unwrap_or_default()),
            ActionKind::Play => Ok(self.play(now)),
            ActionKind::Previous => {
                self.previous();
                Ok(Reaction::default())
            }
            ActionKind::Next => {
                self.next();
                Ok(Reaction::default())
            }
            other => Err(TimerError::UnsupportedAction(other.to_string())),
        }
    }

    /// One-line summary of the focused task, e.g. `Write report 24:10 (1/2)`.
    pub fn describe(&self, now: NaiveDateTime) -> Option<String> {
        let task = self.focused()?;
        Some(format!(
            "{} {} ({}/{})",
            task.text,
            format_time_left(task.time_left_at(now)),
            self.focus_index + 1,
            self.entries.len()
        ))
    }
}

/// Runs a [`FocusRegister`] against an engine.
///
/// Consumes the engine's outbound signals, forwards the register's own
/// changes back through [`Engine::apply_signal`], and ticks on second
/// boundaries while anything is tracked.
#[derive(Clone)]
pub struct FocusService {
    register: Arc<Mutex<FocusRegister>>,
    engine: Engine,
    tick_offset_ms: i64,
}

impl FocusService {
    pub fn new(engine: Engine, seek_step: i64, tick_offset_ms: i64) -> Self {
        FocusService {
            register: Arc::new(Mutex::new(FocusRegister::new(seek_step))),
            engine,
            tick_offset_ms,
        }
    }

    pub fn register(&self) -> Arc<Mutex<FocusRegister>> {
        Arc::clone(&self.register)
    }

    pub async fn describe(&self) -> Option<String> {
        let now = self.engine.clock().now();
        self.register.lock().await.describe(now)
    }

    /// Handles one signal and forwards whatever the register sends back.
    pub async fn handle(&self, signal: Signal) -> Result<Reaction> {
        let now = self.engine.clock().now();
        let mut reaction = self.register.lock().await.handle(signal, now)?;
        if let Some(outbound) = reaction.outbound.take() {
            debug!(kind = %outbound.kind, "focus -> engine");
            self.engine.apply_signal(outbound.clone()).await?;
            reaction.outbound = Some(outbound);
        }
        Ok(reaction)
    }

    /// A user control on the surface: forward, back, play, previous or next.
    pub async fn control(&self, kind: ActionKind) -> Result<Reaction> {
        match kind {
            ActionKind::Forward | ActionKind::Back | ActionKind::Play | ActionKind::Previous | ActionKind::Next => {
                self.handle(Signal::new(kind)).await
            }
            other => Err(TimerError::UnsupportedAction(other.to_string())),
        }
    }

    fn spawn_ticker(&self, cancel: CancellationToken) -> Ticker {
        let register = Arc::clone(&self.register);
        let clock: Arc<dyn Clock> = self.engine.clock();
        Ticker::spawn(self.engine.clock(), self.tick_offset_ms, cancel, move || {
            let register = Arc::clone(&register);
            let clock = Arc::clone(&clock);
            async move {
                let mut register = register.lock().await;
                for task in register.tick(clock.now()) {
                    info!("focus: task {} finished", task.id);
                }
                if register.is_empty() {
                    TickFlow::Stop
                } else {
                    TickFlow::Continue
                }
            }
        })
    }

    /// Spawns the signal loop. It ends when `cancel` fires or the engine's
    /// signal channel closes.
    pub fn spawn(&self, signals: mpsc::UnboundedReceiver<Signal>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(service.run(signals, cancel))
    }

    async fn run(self, mut signals: mpsc::UnboundedReceiver<Signal>, cancel: CancellationToken) {
        let mut ticker: Option<Ticker> = None;
        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };
            let reaction = match self.handle(signal).await {
                Ok(reaction) => reaction,
                Err(e) => {
                    warn!("focus: {e}");
                    continue;
                }
            };
            if reaction.terminated {
                if let Some(t) = ticker.take() {
                    t.stop().await;
                }
                debug!("focus surface idle");
            } else if ticker.as_ref().map_or(true, Ticker::is_finished) && !self.register.lock().await.is_empty() {
                ticker = Some(self.spawn_ticker(cancel.child_token()));
            }
        }
        if let Some(t) = ticker {
            t.stop().await;
        }
        debug!("focus service stopped");
    }
}
