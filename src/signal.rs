//! Action vocabulary shared by the engine and the notification surface.

use std::fmt;
use std::str::FromStr;

use crate::error::TimerError;
use crate::models::Task;

/// Every action name either side of the signal channel understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Add,
    AddMultiple,
    Remove,
    SetTime,
    ModifyTime,
    SetRunningState,
    SetDetail,
    TimeDecrease,
    /// Finish feedback; carries the finished task.
    Finish,
    // Notification surface controls.
    Forward,
    Back,
    Play,
    Previous,
    Next,
}

impl ActionKind {
    pub const ALL: [ActionKind; 14] = [
        ActionKind::Add,
        ActionKind::AddMultiple,
        ActionKind::Remove,
        ActionKind::SetTime,
        ActionKind::ModifyTime,
        ActionKind::SetRunningState,
        ActionKind::SetDetail,
        ActionKind::TimeDecrease,
        ActionKind::Finish,
        ActionKind::Forward,
        ActionKind::Back,
        ActionKind::Play,
        ActionKind::Previous,
        ActionKind::Next,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Add => "ADD",
            ActionKind::AddMultiple => "ADD_MULTIPLE",
            ActionKind::Remove => "REMOVE",
            ActionKind::SetTime => "SET_TIME",
            ActionKind::ModifyTime => "MODIFY_TIME",
            ActionKind::SetRunningState => "SET_RUNNING_STATE",
            ActionKind::SetDetail => "SET_DETAIL",
            ActionKind::TimeDecrease => "TIME_DECREASE",
            ActionKind::Finish => "FINISH",
            ActionKind::Forward => "FORWARD",
            ActionKind::Back => "BACK",
            ActionKind::Play => "PLAY",
            ActionKind::Previous => "PREVIOUS",
            ActionKind::Next => "NEXT",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = TimerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TimerError::UnsupportedAction(s.to_string()))
    }
}

/// Fire-and-forget message between the engine and the notification surface.
#[derive(Debug, Clone)]
pub struct Signal {
    pub kind: ActionKind,
    pub task: Option<Task>,
    pub value: Option<i64>,
}

impl Signal {
    pub fn new(kind: ActionKind) -> Signal {
        Signal { kind, task: None, value: None }
    }

    pub fn with_task(kind: ActionKind, task: Task) -> Signal {
        Signal { kind, task: Some(task), value: None }
    }

    pub fn with_value(kind: ActionKind, task: Task, value: i64) -> Signal {
        Signal { kind, task: Some(task), value: Some(value) }
    }

    /// The task this signal is about, or `MissingArgument`.
    pub fn require_task(&self) -> Result<&Task, TimerError> {
        self.task.as_ref().ok_or(TimerError::MissingArgument {
            kind: self.kind,
            what: "a task",
        })
    }
}
