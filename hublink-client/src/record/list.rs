//! Lists: records holding an ordered array of strings.
//!
//! Local edits and remote updates both reduce to "the entries went from
//! O to N"; the diff below reconstructs that transition as adds, moves
//! and removes so listeners can mirror it without re-scanning. Adds and
//! moves carry the index in the new sequence, removes the index the
//! entry had in the old one. Events fire adds first, then moves, then
//! removes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::ClientError;
use crate::record::record::{Record, RecordEventsListener, RemoteUpdateHook};

/// Per-entry change notifications.
pub trait ListEntryChangedListener: Send + Sync {
    fn on_entry_added(&self, _list_name: &str, _entry: &str, _index: usize) {}
    fn on_entry_removed(&self, _list_name: &str, _entry: &str, _index: usize) {}
    fn on_entry_moved(&self, _list_name: &str, _entry: &str, _index: usize) {}
}

/// Whole-list change notification: `(list_name, entries)`.
pub type ListChangedListener = dyn Fn(&str, &[String]) + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListChange {
    Added(String, usize),
    Moved(String, usize),
    Removed(String, usize),
}

/// Diff two entry sequences into adds, moves and removes.
///
/// Occurrences of a value are matched pairwise in order: the k-th
/// occurrence in the old sequence corresponds to the k-th in the new
/// one. Surplus new occurrences are adds, surplus old ones removes, and
/// a matched occurrence whose index changed is a move.
pub(crate) fn diff(old: &[String], new: &[String]) -> Vec<ListChange> {
    let old_positions = structure(old);
    let new_positions = structure(new);
    let empty: Vec<usize> = Vec::new();

    let mut changes = Vec::new();

    // Adds first, in new-sequence order.
    for (index, entry) in new.iter().enumerate() {
        let old_idx = old_positions.get(entry).unwrap_or(&empty);
        let new_idx = &new_positions[entry];
        let occurrence = new_idx.iter().position(|i| *i == index).unwrap();
        if occurrence >= old_idx.len() {
            changes.push(ListChange::Added(entry.clone(), index));
        }
    }

    // Moves: surviving occurrences whose index changed.
    for (index, entry) in new.iter().enumerate() {
        let old_idx = old_positions.get(entry).unwrap_or(&empty);
        let new_idx = &new_positions[entry];
        let occurrence = new_idx.iter().position(|i| *i == index).unwrap();
        if occurrence < old_idx.len() && old_idx[occurrence] != index {
            changes.push(ListChange::Moved(entry.clone(), index));
        }
    }

    // Removes, reported at old-sequence indices.
    for (index, entry) in old.iter().enumerate() {
        let old_idx = &old_positions[entry];
        let new_len = new_positions.get(entry).map_or(0, Vec::len);
        let occurrence = old_idx.iter().position(|i| *i == index).unwrap();
        if occurrence >= new_len {
            changes.push(ListChange::Removed(entry.clone(), index));
        }
    }

    changes
}

fn structure(entries: &[String]) -> HashMap<String, Vec<usize>> {
    let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        positions.entry(entry.clone()).or_default().push(index);
    }
    positions
}

pub struct List {
    inner: Arc<ListInner>,
}

impl Clone for List {
    fn clone(&self) -> Self {
        List {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ListInner {
    record: Record,
    entry_listeners: Mutex<Vec<(u64, Arc<dyn ListEntryChangedListener>)>>,
    changed_listeners: Mutex<Vec<(u64, Arc<ListChangedListener>)>>,
    before_remote: Mutex<Option<Vec<String>>>,
    next_id: AtomicU64,
}

struct ListHook {
    list: Weak<ListInner>,
}

impl RemoteUpdateHook for ListHook {
    fn before_remote_update(&self) {
        if let Some(list) = self.list.upgrade() {
            *list.before_remote.lock() = Some(list.entries());
        }
    }

    fn after_remote_update(&self) {
        let Some(list) = self.list.upgrade() else { return };
        let Some(old) = list.before_remote.lock().take() else { return };
        let new = list.entries();
        list.emit(&old, &new);
    }
}

impl List {
    pub(crate) fn new(record: Record) -> List {
        let inner = Arc::new(ListInner {
            record,
            entry_listeners: Mutex::new(Vec::new()),
            changed_listeners: Mutex::new(Vec::new()),
            before_remote: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });
        inner.record.set_remote_update_hook(Arc::new(ListHook {
            list: Arc::downgrade(&inner),
        }));
        List { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.record.name()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.record.is_ready()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// The current entries. A list whose record holds anything other
    /// than an array of strings reads as empty.
    pub fn entries(&self) -> Vec<String> {
        self.inner.entries()
    }

    /// Replace the entries wholesale.
    pub fn set_entries(&self, entries: Vec<String>) -> Result<(), ClientError> {
        self.inner.apply(entries)
    }

    /// Append an entry.
    pub fn add_entry(&self, entry: &str) -> Result<(), ClientError> {
        let mut entries = self.entries();
        entries.push(entry.to_string());
        self.inner.apply(entries)
    }

    /// Insert an entry at `index`.
    pub fn add_entry_at(&self, entry: &str, index: usize) -> Result<(), ClientError> {
        let mut entries = self.entries();
        let index = index.min(entries.len());
        entries.insert(index, entry.to_string());
        self.inner.apply(entries)
    }

    /// Remove every occurrence of `entry`.
    pub fn remove_entry(&self, entry: &str) -> Result<(), ClientError> {
        let entries: Vec<String> = self
            .entries()
            .into_iter()
            .filter(|existing| existing != entry)
            .collect();
        self.inner.apply(entries)
    }

    /// Remove the occurrence of `entry` at `index`, if it is one.
    pub fn remove_entry_at(&self, entry: &str, index: usize) -> Result<(), ClientError> {
        let mut entries = self.entries();
        if entries.get(index).map(String::as_str) == Some(entry) {
            entries.remove(index);
        }
        self.inner.apply(entries)
    }

    /// Listen for per-entry adds, moves and removes.
    pub fn subscribe_entries(&self, listener: Arc<dyn ListEntryChangedListener>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entry_listeners.lock().push((id, listener));
        id
    }

    pub fn unsubscribe_entries(&self, id: u64) {
        self.inner
            .entry_listeners
            .lock()
            .retain(|(lid, _)| *lid != id);
    }

    /// Listen for whole-list changes.
    pub fn subscribe<F>(&self, listener: F) -> u64
    where
        F: Fn(&str, &[String]) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .changed_listeners
            .lock()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner
            .changed_listeners
            .lock()
            .retain(|(lid, _)| *lid != id);
    }

    pub fn add_record_events_listener(&self, listener: Arc<dyn RecordEventsListener>) -> u64 {
        self.inner.record.add_record_events_listener(listener)
    }

    pub async fn when_ready(&self) -> Result<(), ClientError> {
        self.inner.record.when_ready().await
    }

    pub fn discard(&self) -> Result<(), ClientError> {
        self.inner.record.discard()
    }

    pub fn delete(&self) -> Result<(), ClientError> {
        self.inner.record.delete()
    }

    pub(crate) fn record(&self) -> &Record {
        &self.inner.record
    }
}

impl ListInner {
    fn entries(&self) -> Vec<String> {
        match self.record.get() {
            Value::Array(values) => values
                .into_iter()
                .filter_map(|value| match value {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn apply(&self, entries: Vec<String>) -> Result<(), ClientError> {
        let old = self.entries();
        let value = Value::Array(entries.iter().cloned().map(Value::String).collect());
        self.record.set(value)?;
        self.emit(&old, &entries);
        Ok(())
    }

    fn emit(&self, old: &[String], new: &[String]) {
        if old != new {
            let changed: Vec<Arc<ListChangedListener>> = self
                .changed_listeners
                .lock()
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect();
            for listener in changed {
                listener(self.record.name(), new);
            }
        }

        let listeners: Vec<Arc<dyn ListEntryChangedListener>> = self
            .entry_listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        if listeners.is_empty() {
            return;
        }
        for change in diff(old, new) {
            for listener in &listeners {
                match &change {
                    ListChange::Added(entry, index) => {
                        listener.on_entry_added(self.record.name(), entry, *index)
                    }
                    ListChange::Moved(entry, index) => {
                        listener.on_entry_moved(self.record.name(), entry, *index)
                    }
                    ListChange::Removed(entry, index) => {
                        listener.on_entry_removed(self.record.name(), entry, *index)
                    }
                }
            }
        }
    }
}
