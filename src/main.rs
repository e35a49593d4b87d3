//! # tasktimer
//!
//! A terminal countdown planner for the tasks of a day. Give every task a
//! duration and a priority; tasktimer packs them into a timeline around the
//! tasks that must start at a fixed time, and counts down whatever you start.
//!
//! ## Features
//!
//! *   **Priority + age packing**: a flexible task gains one point of priority
//!     for every day it waits, so nothing starves.
//! *   **Fixed-time tasks**: anchored at a clock time, never moved.
//! *   **Recurrence**: every n days or on the same day every month. Missed
//!     occurrences of the last week are filled in on start.
//! *   **Drift-free countdowns**: time left is derived from the wall clock, so
//!     a suspended laptop or a restart loses nothing.
//!
//! ## Usage
//!
//! ```bash
//! # Plan tasks
//! tasktimer add "Write report" --duration 1h30m --priority 5
//! tasktimer add "Standup" --duration 15m --at "2025-12-01 09:30" --every 1
//!
//! # Today's plan (or any other day)
//! tasktimer list
//! tasktimer list --day 2025-12-02
//!
//! # Count down
//! tasktimer start 1
//! tasktimer run
//! tasktimer adjust 1 -- -5m
//! tasktimer stop 1
//! ```
//!
//! ## Data Storage
//!
//! Tasks are saved in your local data directory:
//! *   Linux: `~/.local/share/tasktimer/tasks.json`
//! *   macOS: `~/Library/Application Support/tasktimer/tasks.json`
//! *   Windows: `%APPDATA%\tasktimer\tasks.json`
//!
//! You can override this by setting the `TASKTIMER_DB` environment variable.
//! Settings are read from `config.toml` in the same directory, or from the
//! file named by `TASKTIMER_CONFIG`.

use std::io;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use tracing_subscriber::EnvFilter;

use tasktimer::commands::*;
use tasktimer::config::Config;
use tasktimer::models::TaskId;

#[derive(Parser)]
#[command(name = "tasktimer")]
#[command(about = "Plan the day and count down your tasks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new task
    Add {
        /// Task text (quoted if it has spaces)
        text: String,
        /// Duration, e.g. 25m, 1h30m, 90s
        #[arg(short, long)]
        duration: String,
        /// Priority from 0 to 10
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
        /// Repeat every N days
        #[arg(short, long)]
        every: Option<u32>,
        /// Repeat on the same day every month
        #[arg(short, long)]
        monthly: bool,
        /// Fixed start time, "YYYY-MM-DD HH:MM"
        #[arg(short, long)]
        at: Option<String>,
        /// Display color, e.g. "#3094F0"
        #[arg(short, long)]
        color: Option<String>,
    },
    /// Show the plan for a day
    List {
        /// Day in YYYY-MM-DD (default today)
        #[arg(short, long)]
        day: Option<String>,
        /// Also show finished tasks
        #[arg(short, long)]
        all: bool,
    },
    /// Start counting a task down
    Start { id: TaskId },
    /// Stop counting a task down
    Stop { id: TaskId },
    /// Set the time left of a task
    SetTime {
        id: TaskId,
        /// Time left, e.g. 10m
        left: String,
    },
    /// Add or take time from a task
    Adjust {
        id: TaskId,
        /// Signed change, e.g. +5m or -30s
        #[arg(allow_hyphen_values = true)]
        delta: String,
    },
    /// Show all details of a task
    Detail {
        id: TaskId,
        /// Collapse the task again
        #[arg(long)]
        hide: bool,
    },
    /// Mark a task as done
    Remove {
        id: TaskId,
        /// Delete the task and every repetition instead
        #[arg(short, long)]
        all: bool,
    },
    /// Edit a task
    Edit {
        id: TaskId,
        /// New text
        #[arg(short, long)]
        text: Option<String>,
        /// New duration
        #[arg(short, long)]
        duration: Option<String>,
        /// New priority
        #[arg(short, long)]
        priority: Option<i32>,
        /// New color
        #[arg(short, long)]
        color: Option<String>,
    },
    /// Count running tasks down live
    Run,
    /// Reset the database (delete all tasks)
    Reset {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    let command = match cli.command {
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "tasktimer", &mut io::stdout());
            return Ok(());
        }
        Some(Commands::Reset { force }) => return cmd_reset(config.db_path(), force),
        Some(command) => command,
        None => Commands::List { day: None, all: false },
    };

    let mut session = Session::open(config).await?;
    let result = match command {
        Commands::Add { text, duration, priority, every, monthly, at, color } => {
            let new = NewTask { text, duration, priority, every, monthly, at, color };
            cmd_add(&session, new, false).await.map(|_| ())
        }
        Commands::List { day, all } => match day.as_deref().map(parse_day).transpose() {
            Ok(day) => cmd_list(&session, day, all).await,
            Err(e) => Err(e.into()),
        },
        Commands::Start { id } => cmd_start(&session, id, false).await,
        Commands::Stop { id } => cmd_stop(&session, id, false).await,
        Commands::SetTime { id, left } => cmd_set_time(&session, id, &left, false).await,
        Commands::Adjust { id, delta } => cmd_adjust(&session, id, &delta, false).await,
        Commands::Detail { id, hide } => cmd_detail(&session, id, hide).await,
        Commands::Remove { id, all } => cmd_remove(&session, id, all, false).await,
        Commands::Edit { id, text, duration, priority, color } => {
            let edit = TaskEdit { text, duration, priority, color };
            cmd_edit(&session, id, edit, false).await
        }
        Commands::Run => cmd_run(&mut session, false).await,
        Commands::Reset { .. } | Commands::Completions { .. } => Ok(()),
    };
    session.close().await;
    result
}
