//! A late-bound record proxy.
//!
//! Subscriptions live on the proxy and survive retargeting: `set_name`
//! discards the previous record, acquires the new one, re-registers
//! every subscription and, once the new record is loaded, fires each
//! subscriber whose observed value actually changed across the switch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::ClientError;
use crate::record::record::{PathSubscriber, Record, RecordEventsListener, RecordSubscriber};
use crate::record::RecordHandler;

enum Subscription {
    Whole(Arc<RecordSubscriber>),
    Path(String, Arc<PathSubscriber>),
}

struct SubscriptionEntry {
    id: u64,
    subscription: Subscription,
    bound_id: Option<u64>,
}

pub struct AnonymousRecord {
    inner: Arc<AnonymousRecordInner>,
}

impl Clone for AnonymousRecord {
    fn clone(&self) -> Self {
        AnonymousRecord {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct AnonymousRecordInner {
    records: RecordHandler,
    record: Mutex<Option<Record>>,
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
    name_listeners: Mutex<Vec<(u64, Arc<dyn Fn(&str) + Send + Sync>)>>,
    events_listeners: Mutex<Vec<Arc<dyn RecordEventsListener>>>,
    next_id: AtomicU64,
}

impl AnonymousRecord {
    pub(crate) fn new(records: RecordHandler) -> AnonymousRecord {
        AnonymousRecord {
            inner: Arc::new(AnonymousRecordInner {
                records,
                record: Mutex::new(None),
                subscriptions: Mutex::new(Vec::new()),
                name_listeners: Mutex::new(Vec::new()),
                events_listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The bound record's name, if any.
    pub fn name(&self) -> Option<String> {
        self.inner
            .record
            .lock()
            .as_ref()
            .map(|record| record.name().to_string())
    }

    /// The bound record's data; `None` while unbound.
    pub fn get(&self) -> Option<Value> {
        self.inner.record.lock().as_ref().map(Record::get)
    }

    pub fn get_path(&self, record_path: &str) -> Option<Value> {
        self.inner
            .record
            .lock()
            .as_ref()
            .and_then(|record| record.get_path(record_path))
    }

    pub fn set(&self, value: Value) -> Result<(), ClientError> {
        match self.inner.record.lock().as_ref() {
            Some(record) => record.set(value),
            None => Err(ClientError::AnonymousRecordUninitialized),
        }
    }

    pub fn set_path(&self, record_path: &str, value: Value) -> Result<(), ClientError> {
        match self.inner.record.lock().as_ref() {
            Some(record) => record.set_path(record_path, value),
            None => Err(ClientError::AnonymousRecordUninitialized),
        }
    }

    /// Subscribe to whole-record changes of whatever record is bound.
    pub fn subscribe<F>(&self, callback: F) -> u64
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.add_subscription(Subscription::Whole(Arc::new(callback)))
    }

    /// Subscribe to a path of whatever record is bound.
    pub fn subscribe_path<F>(&self, record_path: &str, callback: F) -> u64
    where
        F: Fn(&str, &str, Option<&Value>) + Send + Sync + 'static,
    {
        self.add_subscription(Subscription::Path(
            record_path.to_string(),
            Arc::new(callback),
        ))
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subscriptions = self.inner.subscriptions.lock();
        let Some(position) = subscriptions.iter().position(|entry| entry.id == id) else {
            return;
        };
        let entry = subscriptions.remove(position);
        if let (Some(bound_id), Some(record)) =
            (entry.bound_id, self.inner.record.lock().as_ref())
        {
            let _ = match &entry.subscription {
                Subscription::Whole(_) => record.unsubscribe(bound_id),
                Subscription::Path(path, _) => record.unsubscribe_path(path, bound_id),
            };
        }
    }

    /// Notification when the proxy is retargeted.
    pub fn add_record_name_changed_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .name_listeners
            .lock()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn add_record_events_listener(&self, listener: Arc<dyn RecordEventsListener>) {
        self.inner.events_listeners.lock().push(Arc::clone(&listener));
        if let Some(record) = self.inner.record.lock().as_ref() {
            record.add_record_events_listener(listener);
        }
    }

    /// Bind (or re-bind) the proxy to `name`, moving every subscription.
    pub fn set_name(&self, name: &str) -> Result<(), ClientError> {
        let inner = &self.inner;

        // Capture what each subscription currently observes, then let go
        // of the old record.
        let previous = inner.record.lock().take();
        let old_values: Vec<Option<Value>> = {
            let subscriptions = inner.subscriptions.lock();
            subscriptions
                .iter()
                .map(|entry| match (&entry.subscription, &previous) {
                    (Subscription::Whole(_), Some(record)) => Some(record.get()),
                    (Subscription::Path(path, _), Some(record)) => record.get_path(path),
                    (_, None) => None,
                })
                .collect()
        };
        if let Some(old) = previous {
            for entry in inner.subscriptions.lock().iter_mut() {
                if let Some(bound_id) = entry.bound_id.take() {
                    let _ = match &entry.subscription {
                        Subscription::Whole(_) => old.unsubscribe(bound_id),
                        Subscription::Path(path, _) => old.unsubscribe_path(path, bound_id),
                    };
                }
            }
            old.discard()?;
        }

        let record = inner.records.get_record(name);
        for listener in inner.events_listeners.lock().iter() {
            record.add_record_events_listener(Arc::clone(listener));
        }
        {
            let mut subscriptions = inner.subscriptions.lock();
            for entry in subscriptions.iter_mut() {
                entry.bound_id = Some(match &entry.subscription {
                    Subscription::Whole(callback) => {
                        let callback = Arc::clone(callback);
                        record.subscribe(
                            move |record_name, data| callback(record_name, data),
                            false,
                        )?
                    }
                    Subscription::Path(path, callback) => {
                        let callback = Arc::clone(callback);
                        record.subscribe_path(
                            path,
                            move |record_name, path, value| callback(record_name, path, value),
                            false,
                        )?
                    }
                });
            }
        }
        *inner.record.lock() = Some(record.clone());

        // Once loaded, fire every subscriber whose value changed across
        // the switch.
        let weak = Arc::downgrade(inner);
        record.when_ready_do(move |ready_record| {
            let Some(inner) = weak.upgrade() else { return };
            let subscriptions = inner.subscriptions.lock();
            for (entry, old_value) in subscriptions.iter().zip(old_values.iter()) {
                match &entry.subscription {
                    Subscription::Whole(callback) => {
                        let now = ready_record.get();
                        if old_value.as_ref() != Some(&now) {
                            callback(ready_record.name(), &now);
                        }
                    }
                    Subscription::Path(path, callback) => {
                        let now = ready_record.get_path(path);
                        if *old_value != now {
                            callback(ready_record.name(), path, now.as_ref());
                        }
                    }
                }
            }
        });

        let listeners: Vec<Arc<dyn Fn(&str) + Send + Sync>> = inner
            .name_listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(name);
        }
        Ok(())
    }

    fn add_subscription(&self, subscription: Subscription) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let bound_id = match (&subscription, self.inner.record.lock().as_ref()) {
            (Subscription::Whole(callback), Some(record)) => {
                let callback = Arc::clone(callback);
                record
                    .subscribe(
                        move |record_name, data| callback(record_name, data),
                        false,
                    )
                    .ok()
            }
            (Subscription::Path(path, callback), Some(record)) => {
                let callback = Arc::clone(callback);
                record
                    .subscribe_path(
                        path,
                        move |record_name, path, value| callback(record_name, path, value),
                        false,
                    )
                    .ok()
            }
            (_, None) => None,
        };
        self.inner.subscriptions.lock().push(SubscriptionEntry {
            id,
            subscription,
            bound_id,
        });
        id
    }
}
