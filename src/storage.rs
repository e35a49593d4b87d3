use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Result, TimerError};
use crate::models::{Task, TaskId};

/// Keyed entity store mirroring the working set.
///
/// Records are keyed by [`crate::models::TaskKey`]. The engine treats the store
/// as eventually consistent and never waits on it for a user-visible action.
pub trait Store: Send + Sync {
    /// Inserts or replaces the record with the same identity.
    fn put(&self, task: &Task) -> Result<()>;
    /// Deletes every record matching `filter`. Returns how many went.
    fn delete_where(&self, filter: &dyn Fn(&Task) -> bool) -> Result<usize>;
    /// Deletes the template and all instances sharing `id`.
    fn delete_by_id(&self, id: TaskId) -> Result<usize>;
    fn get_all(&self) -> Result<Vec<Task>>;
}

/// Stores all tasks in one pretty-printed JSON file.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonStore {
    /// Opens (without reading) the store at `path`, creating its directory.
    pub fn open(path: impl Into<PathBuf>) -> Result<JsonStore> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        Ok(JsonStore { path, lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the database file.
    pub fn delete_database(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn load(&self) -> Result<Vec<Task>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut s = String::new();
        OpenOptions::new()
            .read(true)
            .open(&self.path)
            .and_then(|mut f| f.read_to_string(&mut s))
            .map_err(|e| self.failure("read", e))?;
        if s.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&s)?)
    }

    fn save(&self, tasks: &[Task]) -> Result<()> {
        let s = serde_json::to_string_pretty(tasks)?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(s.as_bytes()))
            .map_err(|e| self.failure("write", e))
    }

    fn failure(&self, op: &str, err: std::io::Error) -> TimerError {
        TimerError::Storage(format!("cannot {op} {}: {err}", self.path.display()))
    }

    fn modify<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Task>) -> T,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut tasks = self.load()?;
        let out = change(&mut tasks);
        self.save(&tasks)?;
        Ok(out)
    }
}

fn upsert(tasks: &mut Vec<Task>, task: &Task) {
    let key = task.key();
    if let Some(t) = tasks.iter_mut().find(|t| t.key() == key) {
        *t = task.clone();
    } else {
        tasks.push(task.clone());
    }
}

fn delete_matching(tasks: &mut Vec<Task>, filter: &dyn Fn(&Task) -> bool) -> usize {
    let before = tasks.len();
    tasks.retain(|t| !filter(t));
    before - tasks.len()
}

impl Store for JsonStore {
    fn put(&self, task: &Task) -> Result<()> {
        self.modify(|tasks| upsert(tasks, task))
    }

    fn delete_where(&self, filter: &dyn Fn(&Task) -> bool) -> Result<usize> {
        self.modify(|tasks| delete_matching(tasks, filter))
    }

    fn delete_by_id(&self, id: TaskId) -> Result<usize> {
        self.modify(|tasks| delete_matching(tasks, &|t: &Task| t.id == id))
    }

    fn get_all(&self) -> Result<Vec<Task>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.load()
    }
}

/// Volatile store, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: Mutex<Vec<Task>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        MemoryStore { tasks: Mutex::new(tasks) }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<Task>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn put(&self, task: &Task) -> Result<()> {
        upsert(&mut self.tasks(), task);
        Ok(())
    }

    fn delete_where(&self, filter: &dyn Fn(&Task) -> bool) -> Result<usize> {
        Ok(delete_matching(&mut self.tasks(), filter))
    }

    fn delete_by_id(&self, id: TaskId) -> Result<usize> {
        Ok(delete_matching(&mut self.tasks(), &|t: &Task| t.id == id))
    }

    fn get_all(&self) -> Result<Vec<Task>> {
        Ok(self.tasks().clone())
    }
}

/// Predicate for bulk deletes queued on a [`PersistQueue`].
pub type TaskFilter = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

#[derive(Clone)]
enum WriteOp {
    Put(Task),
    DeleteById(TaskId),
    DeleteWhere(TaskFilter),
}

impl WriteOp {
    fn apply(&self, store: &dyn Store) -> Result<()> {
        match self {
            WriteOp::Put(task) => store.put(task),
            WriteOp::DeleteById(id) => store.delete_by_id(*id).map(|_| ()),
            WriteOp::DeleteWhere(filter) => store.delete_where(filter.as_ref()).map(|_| ()),
        }
    }
}

enum Message {
    Write(WriteOp),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget write queue in front of a [`Store`].
///
/// Writes are applied in submission order by one background worker. Failed
/// writes are retried a bounded number of times, then logged and dropped.
#[derive(Clone)]
pub struct PersistQueue {
    tx: mpsc::UnboundedSender<Message>,
}

impl PersistQueue {
    /// Spawns the worker. It stops when `cancel` fires or every queue handle
    /// is dropped.
    pub fn spawn(store: Arc<dyn Store>, retries: u32, cancel: CancellationToken) -> (PersistQueue, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(store, rx, retries, cancel));
        (PersistQueue { tx }, handle)
    }

    pub fn put(&self, task: Task) {
        self.send(WriteOp::Put(task));
    }

    pub fn delete_by_id(&self, id: TaskId) {
        self.send(WriteOp::DeleteById(id));
    }

    pub fn delete_where<F>(&self, filter: F)
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        self.send(WriteOp::DeleteWhere(Arc::new(filter)));
    }

    /// Waits until every write queued before this call has been attempted.
    /// Returns `false` if the worker is gone.
    pub async fn flush(&self) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.await.is_ok()
    }

    fn send(&self, op: WriteOp) {
        if self.tx.send(Message::Write(op)).is_err() {
            warn!("persistence worker stopped; write dropped");
        }
    }
}

async fn run_worker(
    store: Arc<dyn Store>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    retries: u32,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match message {
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
            Message::Write(op) => write_with_retry(&store, op, retries).await,
        }
    }
    debug!("persistence worker stopped");
}

async fn write_with_retry(store: &Arc<dyn Store>, op: WriteOp, retries: u32) {
    let mut attempt: u32 = 0;
    loop {
        let store = Arc::clone(store);
        let pending = op.clone();
        match tokio::task::spawn_blocking(move || pending.apply(store.as_ref())).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => warn!(attempt, "store write failed: {e}"),
            Err(e) => warn!(attempt, "store write aborted: {e}"),
        }
        if attempt >= retries {
            error!("dropping store write after {} attempts", attempt + 1);
            return;
        }
        attempt += 1;
        tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
    }
}
