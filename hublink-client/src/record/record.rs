//! A single versioned document.
//!
//! A record starts unloaded (`version == -1`), requests its state with
//! CREATEORREAD and becomes ready when the first READ arrives. From then
//! on local writes increment the version optimistically and remote
//! updates must arrive in version order; any gap goes through the merge
//! strategy. Subscribers observe the whole document or a dotted path,
//! and fire only when the value they watch actually changed.
//!
//! Reference: Kleppmann, Chapter 5 — Replication (leaderless write paths)

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use hublink_protocol::{from_typed, to_typed, Action, Message, Topic};

use crate::connection::MessageSender;
use crate::context::ClientContext;
use crate::emitter::Emitter;
use crate::error::{ClientError, ErrorEvent};
use crate::notifier::{await_response, SingleNotifier};
use crate::record::merge::MergeStrategy;
use crate::record::path;
use crate::resubscribe::ResubscribeNotifier;

/// Whole-record subscriber: `(record_name, data)`.
pub type RecordSubscriber = dyn Fn(&str, &Value) + Send + Sync;

/// Path subscriber: `(record_name, path, value_at_path)`.
pub type PathSubscriber = dyn Fn(&str, &str, Option<&Value>) + Send + Sync;

/// Discard/delete/provider notifications for one record.
pub trait RecordEventsListener: Send + Sync {
    fn on_record_discarded(&self, _record_name: &str) {}
    fn on_record_deleted(&self, _record_name: &str) {}
    fn on_record_has_provider_changed(&self, _record_name: &str, _has_provider: bool) {}
}

/// Before/after hooks around a remote update; the list engine uses them
/// to capture the entries it diffs against.
pub(crate) trait RemoteUpdateHook: Send + Sync {
    fn before_remote_update(&self);
    fn after_remote_update(&self);
}

struct RecordState {
    version: i64,
    data: Value,
    ready: bool,
    destroyed: bool,
    discarded: bool,
    has_provider: bool,
    ready_queue: Vec<Box<dyn FnOnce(&Record) + Send>>,
}

/// Values captured before a change, compared afterwards to decide which
/// subscribers fire.
#[derive(Default)]
struct OldValues {
    whole: Option<Value>,
    paths: Vec<(String, Option<Value>)>,
}

pub struct Record {
    inner: Arc<RecordInner>,
}

impl Clone for Record {
    fn clone(&self) -> Self {
        Record {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct RecordInner {
    name: String,
    ctx: Arc<ClientContext>,
    connection: Arc<dyn MessageSender>,
    state: Mutex<RecordState>,
    usages: AtomicI64,
    all_subscribers: Mutex<Vec<(u64, Arc<RecordSubscriber>)>>,
    path_subscribers: Emitter<PathSubscriber>,
    events_listeners: Mutex<Vec<(u64, Arc<dyn RecordEventsListener>)>>,
    destroy_pending: Mutex<Vec<Box<dyn Fn(&str) + Send + Sync>>>,
    remote_hook: Mutex<Option<Arc<dyn RemoteUpdateHook>>>,
    merge_strategy: Mutex<MergeStrategy>,
    set_notifier: SingleNotifier,
    resub: Mutex<Option<ResubscribeNotifier>>,
    next_id: AtomicU64,
}

impl Record {
    pub(crate) fn new(
        name: &str,
        ctx: Arc<ClientContext>,
        connection: Arc<dyn MessageSender>,
    ) -> Record {
        let set_notifier = SingleNotifier::new(
            Arc::clone(&ctx),
            Arc::clone(&connection),
            Topic::Record,
            Action::Patch,
            ctx.config.subscription_timeout,
        );
        let merge_strategy = ctx.config.record_merge_strategy.clone();
        let inner = Arc::new(RecordInner {
            name: name.to_string(),
            ctx,
            connection,
            state: Mutex::new(RecordState {
                version: -1,
                data: Value::Object(serde_json::Map::new()),
                ready: false,
                destroyed: false,
                discarded: false,
                has_provider: false,
                ready_queue: Vec::new(),
            }),
            usages: AtomicI64::new(1),
            all_subscribers: Mutex::new(Vec::new()),
            path_subscribers: Emitter::new(),
            events_listeners: Mutex::new(Vec::new()),
            destroy_pending: Mutex::new(Vec::new()),
            remote_hook: Mutex::new(None),
            merge_strategy: Mutex::new(merge_strategy),
            set_notifier,
            resub: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        let resub = ResubscribeNotifier::new(
            Arc::clone(&inner.ctx.state),
            Arc::new(move || {
                let Some(inner) = weak.upgrade() else { return };
                let record = Record { inner };
                if !record.is_ready() {
                    record.schedule_acks();
                }
                record.send_read();
            }),
        );
        *inner.resub.lock() = Some(resub);

        Record { inner }
    }

    /// Arm the read deadlines and request the record from the hub.
    pub(crate) fn start(&self) {
        self.schedule_acks();
        self.send_read();
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> i64 {
        self.inner.state.lock().version
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    pub fn has_provider(&self) -> bool {
        self.inner.state.lock().has_provider
    }

    /// A deep copy of the record data.
    pub fn get(&self) -> Value {
        self.inner.state.lock().data.clone()
    }

    /// A deep copy of the value at `path`.
    pub fn get_path(&self, record_path: &str) -> Option<Value> {
        let state = self.inner.state.lock();
        if record_path.is_empty() {
            return Some(state.data.clone());
        }
        path::get(&state.data, record_path).cloned()
    }

    pub fn set_merge_strategy(&self, strategy: MergeStrategy) {
        *self.inner.merge_strategy.lock() = strategy;
    }

    /// Replace the whole record value.
    pub fn set(&self, value: Value) -> Result<(), ClientError> {
        self.set_internal(None, value, false)
    }

    /// Set the value at `path`, creating intermediate containers.
    pub fn set_path(&self, record_path: &str, value: Value) -> Result<(), ClientError> {
        self.set_internal(Some(record_path), value, false)
    }

    /// Replace the whole record value and wait for the hub to confirm
    /// the write reached cache and storage.
    pub async fn set_with_ack(&self, value: Value) -> Result<(), ClientError> {
        self.set_with_ack_internal(None, value).await
    }

    pub async fn set_path_with_ack(
        &self,
        record_path: &str,
        value: Value,
    ) -> Result<(), ClientError> {
        self.set_with_ack_internal(Some(record_path), value).await
    }

    /// Subscribe to every change of the record.
    pub fn subscribe<F>(&self, callback: F, trigger_now: bool) -> Result<u64, ClientError>
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.check_destroyed("subscribe")?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Arc<RecordSubscriber> = Arc::new(callback);
        self.inner
            .all_subscribers
            .lock()
            .push((id, Arc::clone(&callback)));
        if trigger_now {
            callback(&self.inner.name, &self.get());
        }
        Ok(id)
    }

    pub fn unsubscribe(&self, id: u64) -> Result<(), ClientError> {
        self.check_destroyed("unsubscribe")?;
        self.inner
            .all_subscribers
            .lock()
            .retain(|(sid, _)| *sid != id);
        Ok(())
    }

    /// Subscribe to changes of the subtree at `path`.
    pub fn subscribe_path<F>(
        &self,
        record_path: &str,
        callback: F,
        trigger_now: bool,
    ) -> Result<u64, ClientError>
    where
        F: Fn(&str, &str, Option<&Value>) + Send + Sync + 'static,
    {
        self.check_destroyed("subscribe")?;
        let callback: Arc<PathSubscriber> = Arc::new(callback);
        let id = self
            .inner
            .path_subscribers
            .on(record_path, Arc::clone(&callback));
        if trigger_now {
            let value = self.get_path(record_path);
            callback(&self.inner.name, record_path, value.as_ref());
        }
        Ok(id)
    }

    pub fn unsubscribe_path(&self, record_path: &str, id: u64) -> Result<(), ClientError> {
        self.check_destroyed("unsubscribe")?;
        self.inner.path_subscribers.off(record_path, id);
        Ok(())
    }

    pub fn add_record_events_listener(&self, listener: Arc<dyn RecordEventsListener>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.events_listeners.lock().push((id, listener));
        id
    }

    pub fn remove_record_events_listener(&self, id: u64) {
        self.inner
            .events_listeners
            .lock()
            .retain(|(lid, _)| *lid != id);
    }

    /// Resolves once the record is loaded; immediately if it already is.
    pub async fn when_ready(&self) -> Result<(), ClientError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.when_ready_do(move |_record| {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| ClientError::IsClosed)
    }

    /// Give up this reference. The last reference unsubscribes from the
    /// hub and destroys the record once the hub acknowledges.
    pub fn discard(&self) -> Result<(), ClientError> {
        self.check_destroyed("discard")?;
        if self.inner.usages.fetch_sub(1, Ordering::SeqCst) <= 1 {
            self.finish_discard();
        }
        Ok(())
    }

    /// Delete the record on the hub, for every client.
    pub fn delete(&self) -> Result<(), ClientError> {
        self.check_destroyed("delete")?;
        self.when_ready_do(move |record| {
            let inner = &record.inner;
            inner.ctx.acks.add_for_event(
                Topic::Record,
                Action::Delete,
                &inner.name,
                ErrorEvent::DeleteTimeout,
                inner.ctx.config.record_delete_timeout,
            );
            inner
                .connection
                .send(Topic::Record, Action::Delete, &[&inner.name]);
            record.fire_destroy_pending();
        });
        Ok(())
    }

    // ── internal ─────────────────────────────────────────────────────

    pub(crate) fn increment_usage(&self) {
        self.inner.usages.fetch_add(1, Ordering::SeqCst);
    }

    /// Wake pending write-acks and ready waiters with `IsClosed`. Used
    /// when the client closes.
    pub(crate) fn abort_pending(&self) {
        self.inner.set_notifier.destroy();
        self.inner.state.lock().ready_queue.clear();
    }

    pub(crate) fn add_destroy_pending_listener<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.destroy_pending.lock().push(Box::new(listener));
    }

    pub(crate) fn set_remote_update_hook(&self, hook: Arc<dyn RemoteUpdateHook>) {
        *self.inner.remote_hook.lock() = Some(hook);
    }

    pub(crate) fn when_ready_do<F>(&self, callback: F)
    where
        F: FnOnce(&Record) + Send + 'static,
    {
        let run_now = {
            let mut state = self.inner.state.lock();
            if state.ready {
                true
            } else {
                state.ready_queue.push(Box::new(callback));
                return;
            }
        };
        if run_now {
            callback(self);
        }
    }

    pub(crate) fn on_message(&self, message: &Message) {
        match message.action {
            Action::Ack => self.process_ack(message),
            Action::Read if self.version() == -1 => self.on_read(message),
            Action::Read | Action::Update | Action::Patch => self.apply_update(message),
            Action::WriteAcknowledgement => self.handle_write_ack(message),
            Action::SubscriptionHasProvider => self.update_has_provider(message),
            Action::Error => match message.field(0) {
                Some(name) if name == ErrorEvent::VersionExists.as_str() => {
                    let version = message.field(2).and_then(|v| v.parse::<i64>().ok());
                    let data = message
                        .field(3)
                        .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
                    if let (Some(version), Some(data)) = (version, data) {
                        self.recover(version, &data);
                    }
                }
                Some(name) if name == ErrorEvent::MessageDenied.as_str() => {
                    self.clear_timeouts();
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn check_destroyed(&self, method: &'static str) -> Result<(), ClientError> {
        if self.inner.state.lock().destroyed {
            return Err(ClientError::RecordDestroyed(
                self.inner.name.clone(),
                method,
            ));
        }
        Ok(())
    }

    fn schedule_acks(&self) {
        let inner = &self.inner;
        inner.ctx.acks.add_for_event(
            Topic::Record,
            Action::Subscribe,
            &inner.name,
            ErrorEvent::AckTimeout,
            inner.ctx.config.record_read_ack_timeout,
        );
        inner.ctx.acks.add_for_event(
            Topic::Record,
            Action::Read,
            &inner.name,
            ErrorEvent::ResponseTimeout,
            inner.ctx.config.record_read_timeout,
        );
    }

    fn clear_timeouts(&self) {
        let inner = &self.inner;
        inner
            .ctx
            .acks
            .clear(Topic::Record, Action::Subscribe, &inner.name);
        inner
            .ctx
            .acks
            .clear(Topic::Record, Action::Read, &inner.name);
    }

    fn send_read(&self) {
        self.inner
            .connection
            .send(Topic::Record, Action::CreateOrRead, &[&self.inner.name]);
    }

    fn begin_change(&self, state: &RecordState) -> OldValues {
        let mut old = OldValues::default();
        if !self.inner.all_subscribers.lock().is_empty() {
            old.whole = Some(state.data.clone());
        }
        for subscribed in self.inner.path_subscribers.events() {
            let value = path::get(&state.data, &subscribed).cloned();
            old.paths.push((subscribed, value));
        }
        old
    }

    fn complete_change(&self, old: OldValues) {
        let mut fire_whole = None;
        let mut fire_paths = Vec::new();
        {
            let state = self.inner.state.lock();
            if let Some(before) = &old.whole {
                if *before != state.data {
                    fire_whole = Some(state.data.clone());
                }
            }
            for (subscribed, before) in old.paths {
                let now = path::get(&state.data, &subscribed).cloned();
                if before != now {
                    fire_paths.push((subscribed, now));
                }
            }
        }

        if let Some(data) = fire_whole {
            let subscribers: Vec<Arc<RecordSubscriber>> = self
                .inner
                .all_subscribers
                .lock()
                .iter()
                .map(|(_, s)| Arc::clone(s))
                .collect();
            for subscriber in subscribers {
                subscriber(&self.inner.name, &data);
            }
        }
        for (subscribed, value) in fire_paths {
            for subscriber in self.inner.path_subscribers.listeners(&subscribed) {
                subscriber(&self.inner.name, &subscribed, value.as_ref());
            }
        }
    }

    fn set_internal(
        &self,
        record_path: Option<&str>,
        value: Value,
        force: bool,
    ) -> Result<(), ClientError> {
        let old = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(ClientError::RecordDestroyed(self.inner.name.clone(), "set"));
            }
            if !force {
                let unchanged = match record_path {
                    Some(p) => path::get(&state.data, p) == Some(&value),
                    None => state.data == value,
                };
                if unchanged {
                    return Ok(());
                }
            }

            let old = self.begin_change(&state);
            match record_path {
                Some(p) => path::set(&mut state.data, p, value.clone()),
                None => state.data = value.clone(),
            }
            state.version += 1;
            let version = state.version.to_string();
            match record_path {
                Some(p) => self.inner.connection.send(
                    Topic::Record,
                    Action::Patch,
                    &[&self.inner.name, &version, p, &to_typed(&value)],
                ),
                None => self.inner.connection.send(
                    Topic::Record,
                    Action::Update,
                    &[&self.inner.name, &version, &state.data.to_string()],
                ),
            }
            old
        };
        self.complete_change(old);
        Ok(())
    }

    async fn set_with_ack_internal(
        &self,
        record_path: Option<&str>,
        value: Value,
    ) -> Result<(), ClientError> {
        const WRITE_CONFIG: &str = "{\"writeSuccess\":true}";

        let (old, rx) = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(ClientError::RecordDestroyed(self.inner.name.clone(), "set"));
            }
            let unchanged = match record_path {
                Some(p) => path::get(&state.data, p) == Some(&value),
                None => state.data == value,
            };
            if unchanged {
                return Ok(());
            }

            let old = self.begin_change(&state);
            match record_path {
                Some(p) => path::set(&mut state.data, p, value.clone()),
                None => state.data = value.clone(),
            }
            state.version += 1;
            let version = state.version.to_string();
            let rx = match record_path {
                Some(p) => self.inner.set_notifier.request_with(
                    &version,
                    Action::Patch,
                    &[&self.inner.name, &version, p, &to_typed(&value), WRITE_CONFIG],
                ),
                None => self.inner.set_notifier.request_with(
                    &version,
                    Action::Update,
                    &[
                        &self.inner.name,
                        &version,
                        &state.data.to_string(),
                        WRITE_CONFIG,
                    ],
                ),
            };
            (old, rx)
        };

        match await_response(rx).await {
            Ok(_) => {
                self.complete_change(old);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn process_ack(&self, message: &Message) {
        let acked = message
            .field(0)
            .and_then(|code| code.parse::<Action>().ok());
        self.inner.ctx.acks.clear_message(message);

        match acked {
            Some(Action::Delete) => {
                for listener in self.events_listeners() {
                    listener.on_record_deleted(&self.inner.name);
                }
                self.destroy();
            }
            Some(Action::Unsubscribe) => {
                for listener in self.events_listeners() {
                    listener.on_record_discarded(&self.inner.name);
                }
                self.destroy();
            }
            _ => {}
        }
    }

    fn on_read(&self, message: &Message) {
        self.inner.ctx.acks.clear_message(message);

        let version = message.field(1).and_then(|v| v.parse::<i64>().ok());
        let data = message
            .field(2)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
        let (Some(version), Some(data)) = (version, data) else {
            self.inner.ctx.errors.report(
                Some(Topic::Record),
                ErrorEvent::MessageParseError,
                &message.raw,
            );
            return;
        };

        let old = {
            let mut state = self.inner.state.lock();
            let old = self.begin_change(&state);
            state.version = version;
            state.data = data;
            old
        };
        self.complete_change(old);
        self.set_ready();
    }

    fn apply_update(&self, message: &Message) {
        let Some(new_version) = message.field(1).and_then(|v| v.parse::<i64>().ok()) else {
            self.inner.ctx.errors.report(
                Some(Topic::Record),
                ErrorEvent::MessageParseError,
                &message.raw,
            );
            return;
        };

        // Patch payloads are typed and may be the undefined sentinel,
        // which deletes the path. Updates carry the whole document.
        let mut delete_path = false;
        let update_value: Option<Value> = if message.action == Action::Patch {
            match message.field(3).map(from_typed) {
                Some(Ok(typed)) => {
                    if typed.is_undefined() {
                        delete_path = true;
                        None
                    } else {
                        typed.into_value()
                    }
                }
                _ => {
                    self.inner.ctx.errors.report(
                        Some(Topic::Record),
                        ErrorEvent::MessageParseError,
                        &message.raw,
                    );
                    return;
                }
            }
        } else {
            match message
                .field(2)
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            {
                Some(value) => Some(value),
                None => {
                    self.inner.ctx.errors.report(
                        Some(Topic::Record),
                        ErrorEvent::MessageParseError,
                        &message.raw,
                    );
                    return;
                }
            }
        };

        {
            let state = self.inner.state.lock();
            if state.version != -1 && state.version + 1 != new_version {
                drop(state);
                if message.action == Action::Patch {
                    // A patch against an unknown base is not mergeable;
                    // fetch the full state and merge on the READ reply.
                    self.inner.connection.send(
                        Topic::Record,
                        Action::Snapshot,
                        &[&self.inner.name],
                    );
                } else if let Some(value) = update_value {
                    self.recover(new_version, &value);
                }
                return;
            }
        }

        let hook = self.inner.remote_hook.lock().clone();
        if let Some(hook) = &hook {
            hook.before_remote_update();
        }

        let old = {
            let mut state = self.inner.state.lock();
            let old = self.begin_change(&state);
            state.version = new_version;
            if message.action == Action::Patch {
                let Some(record_path) = message.field(2) else { return };
                if delete_path {
                    path::delete(&mut state.data, record_path);
                } else if let Some(value) = update_value {
                    path::set(&mut state.data, record_path, value);
                }
            } else if let Some(value) = update_value {
                state.data = value;
            }
            old
        };
        self.complete_change(old);

        if let Some(hook) = &hook {
            hook.after_remote_update();
        }
    }

    fn recover(&self, remote_version: i64, remote_data: &Value) {
        let strategy = self.inner.merge_strategy.lock().clone();
        let (local_data, local_version) = {
            let state = self.inner.state.lock();
            (state.data.clone(), state.version)
        };

        match strategy.resolve(&local_data, local_version, remote_data, remote_version) {
            Ok(merged) => {
                self.inner.state.lock().version = remote_version;
                let _ = self.set_internal(None, merged, true);
            }
            Err(e) => {
                log::debug!("merge strategy failed for {}: {}", self.inner.name, e);
                self.inner.ctx.errors.report(
                    Some(Topic::Record),
                    ErrorEvent::VersionExists,
                    &format!(
                        "Received update for {} but version is {}",
                        remote_version, local_version
                    ),
                );
            }
        }
    }

    fn handle_write_ack(&self, message: &Message) {
        let Some(versions) = message
            .field(1)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|value| value.as_array().cloned())
        else {
            self.inner.ctx.errors.report(
                Some(Topic::Record),
                ErrorEvent::MessageParseError,
                &message.raw,
            );
            return;
        };
        let keys: Vec<String> = versions
            .iter()
            .map(|version| match version {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();

        let error = message
            .field(2)
            .and_then(|field| from_typed(field).ok())
            .and_then(|typed| typed.into_value())
            .and_then(|value| match value {
                Value::Null => None,
                Value::String(s) => Some(ClientError::Write(s)),
                other => Some(ClientError::Write(other.to_string())),
            });

        self.inner.set_notifier.receive_batch(&keys, error);
    }

    fn update_has_provider(&self, message: &Message) {
        let Some(has_provider) = message
            .field(1)
            .and_then(|field| from_typed(field).ok())
            .and_then(|typed| typed.into_value())
            .and_then(|value| value.as_bool())
        else {
            return;
        };
        self.inner.state.lock().has_provider = has_provider;
        for listener in self.events_listeners() {
            listener.on_record_has_provider_changed(&self.inner.name, has_provider);
        }
    }

    fn finish_discard(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.discarded {
                return;
            }
            state.discarded = true;
        }

        self.when_ready_do(move |record| {
            let inner = &record.inner;
            inner.ctx.acks.add(
                Topic::Record,
                Action::Unsubscribe,
                &inner.name,
                inner.ctx.config.subscription_timeout,
            );
            inner
                .connection
                .send(Topic::Record, Action::Unsubscribe, &[&inner.name]);
            record.fire_destroy_pending();
        });
        self.destroy();
    }

    fn fire_destroy_pending(&self) {
        let listeners = self.inner.destroy_pending.lock();
        for listener in listeners.iter() {
            listener(&self.inner.name);
        }
    }

    fn set_ready(&self) {
        let queue = {
            let mut state = self.inner.state.lock();
            state.ready = true;
            std::mem::take(&mut state.ready_queue)
        };
        for callback in queue {
            callback(self);
        }
    }

    fn destroy(&self) {
        self.clear_timeouts();
        self.inner.set_notifier.destroy();
        self.inner.resub.lock().take();
        let mut state = self.inner.state.lock();
        state.ready = false;
        state.destroyed = true;
        state.ready_queue.clear();
    }

    fn events_listeners(&self) -> Vec<Arc<dyn RecordEventsListener>> {
        self.inner
            .events_listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::connection::testing::{wire, wire_message, MockConnection};
    use crate::error::testing::ErrorLog;
    use crate::record::merge::{MergeError, RecordMergeStrategy};
    use crate::state::ConnectionState;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::sleep;

    struct RecordingEvents {
        discarded: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        provider: Mutex<Vec<bool>>,
    }

    impl RecordingEvents {
        fn new() -> Arc<Self> {
            Arc::new(RecordingEvents {
                discarded: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
                provider: Mutex::new(Vec::new()),
            })
        }
    }

    impl RecordEventsListener for RecordingEvents {
        fn on_record_discarded(&self, record_name: &str) {
            self.discarded.lock().push(record_name.to_string());
        }

        fn on_record_deleted(&self, record_name: &str) {
            self.deleted.lock().push(record_name.to_string());
        }

        fn on_record_has_provider_changed(&self, _record_name: &str, has_provider: bool) {
            self.provider.lock().push(has_provider);
        }
    }

    fn test_config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.subscription_timeout = Duration::from_millis(50);
        config.record_read_ack_timeout = Duration::from_millis(50);
        config.record_read_timeout = Duration::from_millis(200);
        config.record_delete_timeout = Duration::from_millis(50);
        config
    }

    fn record() -> (Record, Arc<MockConnection>, Arc<ClientContext>, Arc<RecordingEvents>) {
        let ctx = ClientContext::new(test_config());
        ctx.state.set(ConnectionState::Open);
        let connection = MockConnection::new();
        let record = Record::new("recordA", Arc::clone(&ctx), connection.clone());
        let events = RecordingEvents::new();
        record.add_record_events_listener(events.clone());
        record.start();
        (record, connection, ctx, events)
    }

    fn load(record: &Record) {
        record.on_message(&wire_message("R|A|S|recordA"));
        record.on_message(&wire_message("R|R|recordA|0|{\"name\":\"sam\"}"));
    }

    #[tokio::test]
    async fn test_start_sends_createorread() {
        let (_record, connection, _ctx, _events) = record();
        assert_eq!(connection.last_sent(), Some(wire("R|CR|recordA+")));
    }

    #[tokio::test]
    async fn test_read_makes_record_ready() {
        let (record, _connection, _ctx, _events) = record();
        assert_eq!(record.version(), -1);
        assert!(!record.is_ready());

        load(&record);
        assert!(record.is_ready());
        assert_eq!(record.version(), 0);
        assert_eq!(record.get(), json!({"name": "sam"}));
    }

    #[tokio::test]
    async fn test_discard_sends_unsubscribe_and_destroys() {
        let (record, connection, _ctx, _events) = record();
        load(&record);
        record.discard().unwrap();

        assert_eq!(connection.last_sent(), Some(wire("R|US|recordA+")));
        assert!(record.is_destroyed());
        assert!(!record.is_ready());
    }

    #[tokio::test]
    async fn test_discard_ack_fires_event() {
        let (record, _connection, _ctx, events) = record();
        load(&record);
        record.discard().unwrap();
        record.on_message(&wire_message("R|A|US|recordA"));
        assert_eq!(*events.discarded.lock(), vec!["recordA".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_sends_delete_and_stays_ready_until_ack() {
        let (record, connection, _ctx, events) = record();
        load(&record);
        record.delete().unwrap();

        assert_eq!(connection.last_sent(), Some(wire("R|D|recordA+")));
        assert!(record.is_ready());
        assert!(!record.is_destroyed());

        record.on_message(&wire_message("R|A|D|recordA"));
        assert!(record.is_destroyed());
        assert_eq!(*events.deleted.lock(), vec!["recordA".to_string()]);
    }

    #[tokio::test]
    async fn test_unsolicited_delete_ack_reported() {
        let (record, _connection, ctx, _events) = record();
        let log = ErrorLog::install(&ctx.errors);
        record.on_message(&wire_message("R|A|D|recordA"));
        assert!(log.contains(&ErrorEvent::UnsolicitedMessage, &wire("R|A|D|recordA")));
    }

    #[tokio::test]
    async fn test_subscribe_ack_timeout_reported() {
        let (_record, _connection, ctx, _events) = record();
        let log = ErrorLog::install(&ctx.errors);
        sleep(Duration::from_millis(120)).await;
        assert!(log.contains(
            &ErrorEvent::AckTimeout,
            "No ACK message received in time for SUBSCRIBE recordA"
        ));
    }

    #[tokio::test]
    async fn test_read_timeout_reported() {
        let (record, _connection, ctx, _events) = record();
        let log = ErrorLog::install(&ctx.errors);
        record.on_message(&wire_message("R|A|S|recordA"));
        sleep(Duration::from_millis(300)).await;
        assert!(log.contains(
            &ErrorEvent::ResponseTimeout,
            "No message received in time for READ recordA"
        ));
    }

    #[tokio::test]
    async fn test_delete_timeout_reported() {
        let (record, _connection, ctx, _events) = record();
        load(&record);
        let log = ErrorLog::install(&ctx.errors);
        record.delete().unwrap();
        sleep(Duration::from_millis(120)).await;
        assert!(log.contains(
            &ErrorEvent::DeleteTimeout,
            "No message received in time for DELETE recordA"
        ));
    }

    #[tokio::test]
    async fn test_set_increments_version_and_sends_update() {
        let (record, connection, _ctx, _events) = record();
        load(&record);

        record.set(json!({"name": "max"})).unwrap();
        assert_eq!(record.version(), 1);
        assert_eq!(
            connection.last_sent(),
            Some(wire("R|U|recordA|1|{\"name\":\"max\"}+"))
        );

        record.set_path("age", json!(30)).unwrap();
        assert_eq!(record.version(), 2);
        assert_eq!(connection.last_sent(), Some(wire("R|P|recordA|2|age|N30+")));
    }

    #[tokio::test]
    async fn test_set_equal_value_is_noop() {
        let (record, connection, _ctx, _events) = record();
        load(&record);
        let sent_before = connection.sent_count();

        record.set(json!({"name": "sam"})).unwrap();
        assert_eq!(record.version(), 0);
        assert_eq!(connection.sent_count(), sent_before);
    }

    #[tokio::test]
    async fn test_set_on_destroyed_record_fails() {
        let (record, _connection, _ctx, _events) = record();
        load(&record);
        record.discard().unwrap();
        assert!(matches!(
            record.set(json!({"x": 1})),
            Err(ClientError::RecordDestroyed(_, "set"))
        ));
    }

    #[tokio::test]
    async fn test_path_subscriber_fires_only_on_subtree_change() {
        let (record, _connection, _ctx, _events) = record();
        load(&record);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        record
            .subscribe_path(
                "name",
                move |_record, _path, value| {
                    seen2.lock().push(value.cloned());
                },
                false,
            )
            .unwrap();

        record.set_path("age", json!(30)).unwrap();
        assert!(seen.lock().is_empty());

        record.set_path("name", json!("max")).unwrap();
        assert_eq!(*seen.lock(), vec![Some(json!("max"))]);
    }

    #[tokio::test]
    async fn test_whole_record_subscriber() {
        let (record, _connection, _ctx, _events) = record();
        load(&record);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        record
            .subscribe(
                move |_record, data| {
                    seen2.lock().push(data.clone());
                },
                false,
            )
            .unwrap();

        record.on_message(&wire_message("R|U|recordA|1|{\"name\":\"max\"}"));
        assert_eq!(*seen.lock(), vec![json!({"name": "max"})]);
    }

    #[tokio::test]
    async fn test_trigger_now_fires_immediately() {
        let (record, _connection, _ctx, _events) = record();
        load(&record);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        record
            .subscribe_path(
                "name",
                move |_record, _path, value| {
                    seen2.lock().push(value.cloned());
                },
                true,
            )
            .unwrap();
        assert_eq!(*seen.lock(), vec![Some(json!("sam"))]);
    }

    #[tokio::test]
    async fn test_remote_patch_applies_in_order() {
        let (record, _connection, _ctx, _events) = record();
        load(&record);

        record.on_message(&wire_message("R|P|recordA|1|age|N30"));
        assert_eq!(record.version(), 1);
        assert_eq!(record.get(), json!({"name": "sam", "age": 30}));
    }

    #[tokio::test]
    async fn test_remote_patch_with_undefined_deletes_path() {
        let (record, _connection, _ctx, _events) = record();
        load(&record);

        record.on_message(&wire_message("R|P|recordA|1|name|U"));
        assert_eq!(record.get(), json!({}));
    }

    #[tokio::test]
    async fn test_version_gap_on_patch_requests_snapshot() {
        let (record, connection, _ctx, _events) = record();
        load(&record);

        record.on_message(&wire_message("R|P|recordA|5|age|N30"));
        assert_eq!(connection.last_sent(), Some(wire("R|SN|recordA+")));
        // The out-of-order patch is not applied.
        assert_eq!(record.version(), 0);
    }

    #[tokio::test]
    async fn test_version_gap_on_update_remote_wins() {
        let (record, connection, _ctx, _events) = record();
        load(&record);

        record.on_message(&wire_message("R|U|recordA|5|{\"name\":\"remote\"}"));
        // Remote data adopted at the remote version, then re-sent as the
        // next local version.
        assert_eq!(record.get(), json!({"name": "remote"}));
        assert_eq!(record.version(), 6);
        assert_eq!(
            connection.last_sent(),
            Some(wire("R|U|recordA|6|{\"name\":\"remote\"}+"))
        );
    }

    #[tokio::test]
    async fn test_version_gap_local_wins_reasserts_local_data() {
        let (record, connection, _ctx, _events) = record();
        record.set_merge_strategy(MergeStrategy::LocalWins);
        load(&record);

        record.on_message(&wire_message("R|U|recordA|5|{\"name\":\"remote\"}"));
        assert_eq!(record.get(), json!({"name": "sam"}));
        assert_eq!(record.version(), 6);
        assert_eq!(
            connection.last_sent(),
            Some(wire("R|U|recordA|6|{\"name\":\"sam\"}+"))
        );
    }

    struct AlwaysFails;

    impl RecordMergeStrategy for AlwaysFails {
        fn merge(
            &self,
            _local: &Value,
            _local_version: i64,
            _remote: &Value,
            _remote_version: i64,
        ) -> Result<Value, MergeError> {
            Err(MergeError("no merge possible".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_merge_reports_version_exists() {
        let (record, _connection, ctx, _events) = record();
        record.set_merge_strategy(MergeStrategy::Custom(Arc::new(AlwaysFails)));
        load(&record);
        let log = ErrorLog::install(&ctx.errors);

        record.on_message(&wire_message("R|E|VERSION_EXISTS|recordA|5|{\"name\":\"remote\"}"));
        assert!(log.contains(
            &ErrorEvent::VersionExists,
            "Received update for 5 but version is 0"
        ));
        // Record is left divergent.
        assert_eq!(record.get(), json!({"name": "sam"}));
        assert_eq!(record.version(), 0);
    }

    #[tokio::test]
    async fn test_has_provider_updates_and_notifies() {
        let (record, _connection, _ctx, events) = record();
        load(&record);
        assert!(!record.has_provider());

        record.on_message(&wire_message("R|SP|recordA|T"));
        assert!(record.has_provider());
        record.on_message(&wire_message("R|SP|recordA|F"));
        assert!(!record.has_provider());
        assert_eq!(*events.provider.lock(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_set_with_ack_resolves_on_write_acknowledgement() {
        let (record, connection, _ctx, _events) = record();
        load(&record);

        let writer = record.clone();
        let write = tokio::spawn(async move {
            writer.set_with_ack(json!({"name": "max"})).await
        });
        sleep(Duration::from_millis(20)).await;
        assert_eq!(
            connection.last_sent(),
            Some(wire(
                "R|U|recordA|1|{\"name\":\"max\"}|{\"writeSuccess\":true}+"
            ))
        );

        record.on_message(&wire_message("R|WA|recordA|[1]|L"));
        write.await.unwrap().unwrap();
        assert_eq!(record.version(), 1);
    }

    #[tokio::test]
    async fn test_set_with_ack_propagates_storage_error() {
        let (record, _connection, _ctx, _events) = record();
        load(&record);

        let writer = record.clone();
        let write = tokio::spawn(async move {
            writer.set_with_ack(json!({"name": "max"})).await
        });
        sleep(Duration::from_millis(20)).await;

        record.on_message(&wire_message("R|WA|recordA|[1]|SStorage failed"));
        let result = write.await.unwrap();
        assert!(matches!(
            result,
            Err(ClientError::Write(ref message)) if message == "Storage failed"
        ));
    }

    #[tokio::test]
    async fn test_when_ready_resolves_after_read() {
        let (record, _connection, _ctx, _events) = record();

        let waiter = record.clone();
        let ready = tokio::spawn(async move { waiter.when_ready().await });
        sleep(Duration::from_millis(20)).await;
        assert!(!ready.is_finished());

        load(&record);
        ready.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_when_ready_inline_when_already_ready() {
        let (record, _connection, _ctx, _events) = record();
        load(&record);
        record.when_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_before_ready_defers_unsubscribe() {
        let (record, connection, _ctx, _events) = record();
        record.discard().unwrap();
        // Unsubscribe waits for the record to become ready; destruction
        // already happened, so it never will.
        assert_ne!(connection.last_sent(), Some(wire("R|US|recordA+")));
        assert!(record.is_destroyed());
    }

    #[tokio::test]
    async fn test_message_denied_clears_read_deadlines() {
        let (record, _connection, ctx, _events) = record();
        let log = ErrorLog::install(&ctx.errors);
        assert_eq!(ctx.acks.len(), 2);
        record.on_message(&wire_message("R|E|MESSAGE_DENIED|recordA"));
        assert_eq!(ctx.acks.len(), 0);
        sleep(Duration::from_millis(120)).await;
        assert_eq!(log.len(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_resends_createorread() {
        let (record, connection, ctx, _events) = record();
        load(&record);
        let before = connection.sent_count();

        ctx.state.set(ConnectionState::Reconnecting);
        ctx.state.set(ConnectionState::Open);
        assert_eq!(connection.sent_count(), before + 1);
        assert_eq!(connection.last_sent(), Some(wire("R|CR|recordA+")));
    }
}
