use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use tokio::sync::mpsc::UnboundedReceiver;
use tasktimer::clock::ManualClock;
use tasktimer::engine::{Action, Engine, EngineOptions, RemoveMode, ToggleSource};
use tasktimer::models::{Recurrence, Task, TaskStatus, MAX_DURATION_SECS};
use tasktimer::signal::{ActionKind, Signal};
use tasktimer::storage::{MemoryStore, Store};
use tasktimer::TimerError;

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn at(d: NaiveDate, h: u32, min: u32) -> NaiveDateTime {
    d.and_hms_opt(h, min, 0).unwrap()
}

const TODAY: (i32, u32, u32) = (2025, 5, 20);

fn today() -> NaiveDate {
    day(TODAY.0, TODAY.1, TODAY.2)
}

struct Harness {
    engine: Engine,
    signals: UnboundedReceiver<Signal>,
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
}

fn harness_with(store: MemoryStore) -> Harness {
    let clock = Arc::new(ManualClock::new(at(today(), 9, 0)));
    let store = Arc::new(store);
    let (engine, signals) = Engine::new(store.clone(), clock.clone(), EngineOptions::default());
    Harness { engine, signals, clock, store }
}

fn harness() -> Harness {
    harness_with(MemoryStore::new())
}

fn drain(signals: &mut UnboundedReceiver<Signal>) -> Vec<Signal> {
    let mut out = Vec::new();
    while let Ok(signal) = signals.try_recv() {
        out.push(signal);
    }
    out
}

fn kinds(signals: &[Signal]) -> Vec<ActionKind> {
    signals.iter().map(|s| s.kind).collect()
}

async fn add(h: &Harness, task: Task) -> Task {
    h.engine.apply(Action::Add(task.clone()), today()).await.unwrap();
    task
}

fn toggle(task: &Task) -> Action {
    Action::SetRunningState {
        task: task.clone(),
        source: ToggleSource::Button,
    }
}

#[tokio::test]
async fn add_publishes_and_persists() {
    let h = harness();
    let mut watch = h.engine.subscribe();
    let task = add(&h, Task::new(1, "Write", 600, at(today(), 8, 0))).await;

    assert!(watch.has_changed().unwrap());
    let schedule = watch.borrow_and_update().clone();
    assert_eq!(schedule.day, today());
    assert_eq!(schedule.tasks.len(), 1);
    assert_eq!(schedule.tasks[0].estimated_start_time, Some(at(today(), 9, 0)));

    assert!(h.engine.flush().await);
    let stored = h.store.get_all().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].key(), task.key());
}

#[tokio::test]
async fn add_with_same_identity_replaces() {
    let h = harness();
    let task = add(&h, Task::new(1, "Write", 600, at(today(), 8, 0))).await;
    let mut renamed = task.clone();
    renamed.text = "Write more".into();
    add(&h, renamed).await;

    let records = h.engine.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].text, "Write more");
    assert_eq!(h.engine.next_id().await, 2);
}

#[tokio::test]
async fn time_changes_stay_within_duration() {
    let h = harness();
    let task = add(&h, Task::new(1, "Clamp", 600, at(today(), 8, 0))).await;
    let key = task.key();

    let set = |seconds| Action::SetTime { task: task.clone(), seconds };
    let modify = |delta| Action::ModifyTime { task: task.clone(), delta };

    h.engine.apply(set(10_000), today()).await.unwrap();
    assert_eq!(h.engine.task(&key).await.unwrap().time_left_secs, 600);
    h.engine.apply(modify(-1_000), today()).await.unwrap();
    assert_eq!(h.engine.task(&key).await.unwrap().time_left_secs, 0);
    h.engine.apply(modify(50), today()).await.unwrap();
    assert_eq!(h.engine.task(&key).await.unwrap().time_left_secs, 50);
    h.engine.apply(set(-7), today()).await.unwrap();
    let record = h.engine.task(&key).await.unwrap();
    assert_eq!(record.time_left_secs, 0);
    assert_eq!(record.time_left_at_period_start, 0);
    assert_eq!(record.period_start, at(today(), 9, 0));
}

#[tokio::test]
async fn starting_and_stopping_settles_elapsed_time() {
    let mut h = harness();
    let task = add(&h, Task::new(1, "Focus", 300, at(today(), 8, 0))).await;

    h.engine.apply(toggle(&task), today()).await.unwrap();
    let started = drain(&mut h.signals);
    assert_eq!(kinds(&started), vec![ActionKind::Add]);
    assert_eq!(started[0].value, Some(300));

    h.clock.advance(100);
    h.engine.apply(toggle(&task), today()).await.unwrap();
    let record = h.engine.task(&task.key()).await.unwrap();
    assert!(!record.is_running);
    assert_eq!(record.time_left_secs, 200);
    assert_eq!(kinds(&drain(&mut h.signals)), vec![ActionKind::Remove]);

    // Stopped tasks do not count down.
    h.clock.advance(100);
    h.engine.tick().await.unwrap();
    assert_eq!(h.engine.task(&task.key()).await.unwrap().time_left_secs, 200);
}

#[tokio::test]
async fn late_tick_finishes_instead_of_decrementing() {
    let mut h = harness();
    let task = add(&h, Task::new(1, "Tea", 300, at(today(), 8, 0))).await;
    h.engine.apply(toggle(&task), today()).await.unwrap();
    drain(&mut h.signals);

    h.clock.advance(1);
    h.engine.tick().await.unwrap();
    assert_eq!(h.engine.task(&task.key()).await.unwrap().time_left_secs, 299);

    h.clock.advance(300);
    let schedule = h.engine.tick().await.unwrap();
    let record = h.engine.task(&task.key()).await.unwrap();
    assert_eq!(record.time_left_secs, 0);
    assert_eq!(record.status, TaskStatus::Finished);
    assert!(!record.is_running);
    assert!(schedule.tasks.is_empty());

    let finished = drain(&mut h.signals);
    assert_eq!(kinds(&finished), vec![ActionKind::Finish]);

    assert!(h.engine.flush().await);
    assert_eq!(h.store.get_all().unwrap()[0].status, TaskStatus::Finished);
}

#[tokio::test]
async fn concurrent_running_tasks_all_count_down() {
    let h = harness();
    let a = add(&h, Task::new(1, "A", 600, at(today(), 8, 0))).await;
    let b = add(&h, Task::new(2, "B", 600, at(today(), 8, 0))).await;
    h.engine.apply(toggle(&a), today()).await.unwrap();
    h.engine.apply(toggle(&b), today()).await.unwrap();

    h.clock.advance(60);
    h.engine.tick().await.unwrap();
    let running = h.engine.running_tasks().await;
    assert_eq!(running.len(), 2);
    assert!(running.iter().all(|t| t.time_left_secs == 540));
}

#[tokio::test]
async fn toggling_a_task_with_no_time_left_finishes_it() {
    let mut h = harness();
    let task = add(&h, Task::new(1, "Done already", 300, at(today(), 8, 0))).await;
    h.engine
        .apply(Action::SetTime { task: task.clone(), seconds: 0 }, today())
        .await
        .unwrap();
    h.engine.apply(toggle(&task), today()).await.unwrap();

    let record = h.engine.task(&task.key()).await.unwrap();
    assert_eq!(record.status, TaskStatus::Finished);
    assert_eq!(kinds(&drain(&mut h.signals)), vec![ActionKind::Finish]);
}

#[tokio::test]
async fn seek_pause_resumes_only_what_it_paused() {
    let h = harness();
    let task = add(&h, Task::new(1, "Seek", 600, at(today(), 8, 0))).await;
    let seek = Action::SetRunningState {
        task: task.clone(),
        source: ToggleSource::Seek,
    };

    h.engine.apply(toggle(&task), today()).await.unwrap();
    h.engine.apply(seek.clone(), today()).await.unwrap();
    assert!(!h.engine.task(&task.key()).await.unwrap().is_running);
    h.engine.apply(seek.clone(), today()).await.unwrap();
    assert!(h.engine.task(&task.key()).await.unwrap().is_running);

    // Stopped with the button: the next seek leaves it stopped.
    h.engine.apply(toggle(&task), today()).await.unwrap();
    h.engine.apply(seek.clone(), today()).await.unwrap();
    assert!(!h.engine.task(&task.key()).await.unwrap().is_running);

    // A button press between seeks clears the pause.
    h.engine.apply(toggle(&task), today()).await.unwrap();
    h.engine.apply(seek.clone(), today()).await.unwrap();
    h.engine.apply(toggle(&task), today()).await.unwrap();
    assert!(h.engine.task(&task.key()).await.unwrap().is_running);
    h.engine.apply(toggle(&task), today()).await.unwrap();
    h.engine.apply(seek, today()).await.unwrap();
    assert!(!h.engine.task(&task.key()).await.unwrap().is_running);
}

#[tokio::test]
async fn soft_remove_keeps_history_and_signals_running_tasks() {
    let mut h = harness();
    let task = add(&h, Task::new(1, "Soft", 600, at(today(), 8, 0))).await;
    h.engine.apply(toggle(&task), today()).await.unwrap();
    drain(&mut h.signals);

    let schedule = h
        .engine
        .apply(Action::Remove { task: task.clone(), mode: RemoveMode::Soft }, today())
        .await
        .unwrap();
    assert!(schedule.tasks.is_empty());
    let record = h.engine.task(&task.key()).await.unwrap();
    assert_eq!(record.status, TaskStatus::Finished);

    let removed = drain(&mut h.signals);
    assert_eq!(kinds(&removed), vec![ActionKind::Remove]);
    assert_eq!(removed[0].value, Some(0));

    // A positive time brings it back.
    h.engine
        .apply(Action::SetTime { task: task.clone(), seconds: 120 }, today())
        .await
        .unwrap();
    assert_eq!(h.engine.task(&task.key()).await.unwrap().status, TaskStatus::Remaining);
}

#[tokio::test]
async fn hard_remove_drops_every_record_of_the_id() {
    let mut h = harness();
    let template = Task::new(3, "Daily", 600, at(today() - Duration::days(2), 8, 0))
        .with_recurrence(Recurrence::EveryDays(1));
    add(&h, template.clone()).await;
    let instance = add(&h, template.instance_on(today())).await;
    add(&h, Task::new(4, "Keep", 60, at(today(), 8, 0))).await;

    h.engine
        .apply(Action::Remove { task: instance.clone(), mode: RemoveMode::Hard }, today())
        .await
        .unwrap();
    assert!(matches!(
        h.engine.task(&instance.key()).await,
        Err(TimerError::TaskNotFound(_))
    ));
    assert!(h.engine.task(&template.key()).await.is_err());
    assert!(drain(&mut h.signals).is_empty());

    assert!(h.engine.flush().await);
    let stored = h.store.get_all().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, 4);
}

#[tokio::test]
async fn template_references_resolve_to_their_instance() {
    let h = harness();
    let template = Task::new(1, "Stretch", 900, at(today() - Duration::days(1), 7, 0))
        .with_recurrence(Recurrence::EveryDays(1));
    add(&h, template.clone()).await;

    let looked_up = h.engine.lookup(1).await.unwrap();
    assert!(!looked_up.is_template);
    assert_eq!(looked_up.created_time, at(today(), 7, 0));

    let reference = template.instance_on(today()).as_template();
    h.engine
        .apply(Action::SetTime { task: reference, seconds: 100 }, today())
        .await
        .unwrap();
    let instance = h.engine.task(&looked_up.key()).await.unwrap();
    assert_eq!(instance.time_left_secs, 100);
    assert_eq!(h.engine.records().await.len(), 2);
    assert_eq!(h.engine.task(&template.key()).await.unwrap().time_left_secs, 900);
}

#[tokio::test]
async fn detail_flag_does_not_change_the_plan() {
    let h = harness();
    let task = add(&h, Task::new(1, "Detail", 600, at(today(), 8, 0))).await;
    let before = h.engine.current();
    let after = h
        .engine
        .apply(Action::SetDetail { task: task.clone(), visible: true }, today())
        .await
        .unwrap();
    assert!(h.engine.task(&task.key()).await.unwrap().is_detail_visible);
    assert_eq!(before.tasks[0].estimated_start_time, after.tasks[0].estimated_start_time);
}

#[tokio::test]
async fn loose_dispatch_validates_arguments() {
    let h = harness();
    let task = Task::new(1, "Loose", 600, at(today(), 8, 0));

    let result = h.engine.dispatch(ActionKind::Forward, Some(task.clone()), None, 0, today()).await;
    assert!(matches!(result, Err(TimerError::UnsupportedAction(_))));

    let result = h.engine.dispatch(ActionKind::Add, None, None, 0, today()).await;
    assert!(matches!(result, Err(TimerError::MissingArgument { kind: ActionKind::Add, .. })));

    let batch = vec![task.clone(), Task::new(2, "Loose too", 60, at(today(), 8, 0))];
    let schedule = h
        .engine
        .dispatch(ActionKind::AddMultiple, None, Some(batch), 0, today())
        .await
        .unwrap();
    assert_eq!(schedule.tasks.len(), 2);

    h.engine
        .dispatch(ActionKind::Remove, Some(task.clone()), None, 1, today())
        .await
        .unwrap();
    assert_eq!(h.engine.records().await.len(), 1);
}

#[tokio::test]
async fn unknown_ids_are_reported() {
    let h = harness();
    assert!(matches!(h.engine.lookup(42).await, Err(TimerError::IdNotFound(42))));
}

#[tokio::test]
async fn lookup_falls_back_to_the_template_occurrence() {
    let h = harness();
    let template = Task::new(5, "Weekly", 600, at(today() + Duration::days(3), 8, 0))
        .with_recurrence(Recurrence::EveryDays(7))
        .as_template();
    add(&h, template.clone()).await;

    let found = h.engine.lookup(5).await.unwrap();
    assert!(!found.is_template);
    assert_eq!(found.date(), today() + Duration::days(3));
}

#[tokio::test]
async fn load_purges_old_history_and_backfills() {
    let template = Task::new(1, "Daily", 600, at(today() - Duration::days(30), 8, 0))
        .with_recurrence(Recurrence::EveryDays(1));
    let mut old = template.instance_on(today() - Duration::days(10));
    old.finish();
    let mut recent = template.instance_on(today() - Duration::days(2));
    recent.finish();
    let h = harness_with(MemoryStore::with_tasks(vec![template.clone(), old.clone(), recent.clone()]));

    let schedule = h.engine.load(today()).await.unwrap();

    let records = h.engine.records().await;
    assert_eq!(records.len(), 8);
    assert!(records.iter().all(|t| t.key() != old.key()));
    let remaining: Vec<&Task> = records.iter().filter(|t| !t.is_template && t.is_remaining()).collect();
    assert_eq!(remaining.len(), 6);
    assert!(remaining
        .iter()
        .all(|t| t.date() >= today() - Duration::days(7) && t.date() < today()));

    // Six overdue instances plus today's occurrence.
    assert_eq!(schedule.tasks.len(), 7);

    assert!(h.engine.flush().await);
    let stored = h.store.get_all().unwrap();
    assert_eq!(stored.len(), 8);
    assert!(stored.iter().all(|t| t.key() != old.key()));
}

#[tokio::test]
async fn engine_ticker_stops_once_nothing_runs() {
    let h = harness();
    let task = add(&h, Task::new(1, "Short", 300, at(today(), 8, 0))).await;
    h.engine.apply(toggle(&task), today()).await.unwrap();
    h.clock.advance(301);

    let ticker = h.engine.spawn_ticker(true);
    tokio::time::timeout(StdDuration::from_secs(5), ticker.join())
        .await
        .expect("ticker should stop after the task finished");
    assert_eq!(h.engine.task(&task.key()).await.unwrap().status, TaskStatus::Finished);
}

#[tokio::test]
async fn shutdown_stops_ticker_and_persistence() {
    let h = harness();
    add(&h, Task::new(1, "Last", 300, at(today(), 8, 0))).await;
    let ticker = h.engine.spawn_ticker(false);
    h.engine.shutdown().await;

    tokio::time::timeout(StdDuration::from_secs(5), ticker.join())
        .await
        .expect("ticker should stop on shutdown");
    assert_eq!(h.store.get_all().unwrap().len(), 1);
}

#[tokio::test]
async fn load_settles_countdowns_that_ran_out_while_closed() {
    let now = at(today(), 9, 0);
    let mut overdue = Task::new(1, "Overdue", 1800, at(today(), 7, 0));
    overdue.is_running = true;
    overdue.period_start = now - Duration::hours(1);
    let mut halfway = Task::new(2, "Halfway", 1800, at(today(), 7, 0));
    halfway.is_running = true;
    halfway.period_start = now - Duration::minutes(10);
    let mut h = harness_with(MemoryStore::with_tasks(vec![overdue.clone(), halfway.clone()]));

    let schedule = h.engine.load(today()).await.unwrap();

    let record = h.engine.task(&overdue.key()).await.unwrap();
    assert_eq!(record.status, TaskStatus::Finished);
    assert!(!record.is_running);
    assert_eq!(h.engine.task(&halfway.key()).await.unwrap().time_left_secs, 1200);
    assert_eq!(schedule.tasks.len(), 1);
    assert_eq!(schedule.tasks[0].id, 2);

    let signals = drain(&mut h.signals);
    assert_eq!(kinds(&signals), vec![ActionKind::Finish]);
    assert!(h.engine.flush().await);
    let stored = h.store.get_all().unwrap();
    assert_eq!(stored.iter().find(|t| t.id == 1).unwrap().status, TaskStatus::Finished);
}

#[tokio::test]
async fn oversized_durations_are_clamped_and_planned() {
    let h = harness();
    let mut huge = Task::new(1, "Huge", 720_000_000_000_000, at(today(), 8, 0));
    assert_eq!(huge.duration_secs, MAX_DURATION_SECS);
    add(&h, huge.clone()).await;

    // Records edited past the cap are clamped when they enter the engine.
    huge.id = 2;
    huge.duration_secs = i64::MAX / 2;
    huge.time_left_secs = i64::MAX / 2;
    let schedule = h.engine.apply(Action::Add(huge.clone()), today()).await.unwrap();
    assert_eq!(h.engine.task(&huge.key()).await.unwrap().duration_secs, MAX_DURATION_SECS);
    assert!(schedule.tasks.len() <= 2);
}

#[tokio::test]
async fn explicit_stop_never_starts_a_task() {
    let mut h = harness();
    let task = add(&h, Task::new(1, "Stop", 600, at(today(), 8, 0))).await;
    let stop = Action::SetRunningState {
        task: task.clone(),
        source: ToggleSource::Stop,
    };

    h.engine.apply(stop.clone(), today()).await.unwrap();
    assert!(!h.engine.task(&task.key()).await.unwrap().is_running);
    assert!(drain(&mut h.signals).is_empty());

    h.engine.apply(toggle(&task), today()).await.unwrap();
    h.clock.advance(60);
    h.engine
        .dispatch(ActionKind::SetRunningState, Some(task.clone()), None, 2, today())
        .await
        .unwrap();
    let record = h.engine.task(&task.key()).await.unwrap();
    assert!(!record.is_running);
    assert_eq!(record.time_left_secs, 540);
    assert_eq!(kinds(&drain(&mut h.signals)), vec![ActionKind::Add, ActionKind::Remove]);
}
