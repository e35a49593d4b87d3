//! # tasktimer
//!
//! Countdown timers for a day of tasks. Tasks are packed into a timeline by
//! priority and age around fixed-time anchors, recurring tasks are expanded
//! per day, and running countdowns are derived from the wall clock so they
//! survive suspension and restarts.
//!
//! The [`engine::Engine`] owns all task state; everything else either feeds
//! it actions or reads the [`engine::Schedule`] it publishes.

pub mod clock;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod focus;
pub mod models;
pub mod recurrence;
pub mod scheduler;
pub mod signal;
pub mod storage;
pub mod ticker;
pub mod working_set;

pub use engine::{Action, Engine, EngineOptions, RemoveMode, Schedule, ToggleSource};
pub use error::{Result, TimerError};
pub use models::{Recurrence, Task, TaskId, TaskKey, TaskStatus};
pub use working_set::{resolve, WorkingSet};
