//! In-memory map from task identity to the current task record.

use std::collections::HashMap;

use crate::models::{Task, TaskId, TaskKey};

/// The authoritative set of task records, keyed by immutable identity.
///
/// Only the engine holds it mutably; everything else reads through `&WorkingSet`.
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    tasks: HashMap<TaskKey, Task>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, key: &TaskKey) -> Option<&Task> {
        self.tasks.get(key)
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    /// Inserts or replaces the record with the same identity.
    pub fn upsert(&mut self, task: Task) -> Option<Task> {
        self.tasks.insert(task.key(), task)
    }

    pub fn remove(&mut self, key: &TaskKey) -> Option<Task> {
        self.tasks.remove(key)
    }

    /// Removes the template and every instance sharing `id`.
    pub fn remove_all_with_id(&mut self, id: TaskId) -> Vec<Task> {
        let keys: Vec<TaskKey> = self.tasks.keys().filter(|k| k.id == id).copied().collect();
        keys.iter().filter_map(|k| self.tasks.remove(k)).collect()
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Task) -> bool,
    {
        self.tasks.retain(|_, task| keep(task));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.tasks.values_mut()
    }

    pub fn templates(&self) -> impl Iterator<Item = &Task> {
        self.iter().filter(|t| t.is_template)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Task> {
        self.iter().filter(|t| !t.is_template)
    }

    pub fn running(&self) -> impl Iterator<Item = &Task> {
        self.instances().filter(|t| t.is_running && t.is_remaining())
    }

    pub fn max_id(&self) -> Option<TaskId> {
        self.tasks.keys().map(|k| k.id).max()
    }

    /// The record a caller-supplied task stands for. See [`resolve`].
    pub fn get_or_create(&self, incoming: &Task) -> Task {
        let key = incoming.key().concrete();
        resolve(incoming, self.get(&key))
    }
}

/// Reconciles a caller's copy of a task with the authoritative record.
///
/// The current record wins when one exists; otherwise the incoming value
/// becomes the record. Template references are turned into the identity of
/// their concrete instance first, since callers may hold a template or stale
/// copy of something that was materialized or mutated since.
pub fn resolve(incoming: &Task, current: Option<&Task>) -> Task {
    match current {
        Some(task) => task.clone(),
        None => {
            let mut task = incoming.clone();
            task.is_template = false;
            task.normalize();
            task
        }
    }
}
