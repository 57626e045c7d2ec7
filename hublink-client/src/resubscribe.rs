//! Resubscription after connection loss.
//!
//! Each subscribing component registers a callback here. The notifier
//! latches when the connection starts RECONNECTING and fires the callback
//! exactly once when it is OPEN again; a direct CLOSED→OPEN (first
//! connect) never fires. The callback runs on the connection task, so it
//! may send immediately, the connection is already open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::state::{ConnectionState, StateBus};

pub(crate) struct ResubscribeNotifier {
    state: Arc<StateBus>,
    listener_id: u64,
}

impl ResubscribeNotifier {
    pub fn new(state: Arc<StateBus>, callback: Arc<dyn Fn() + Send + Sync>) -> Self {
        let reconnecting = AtomicBool::new(false);
        let listener_id = state.add_listener(Arc::new(move |new_state| {
            match new_state {
                ConnectionState::Reconnecting => {
                    reconnecting.store(true, Ordering::SeqCst);
                }
                ConnectionState::Open => {
                    if reconnecting.swap(false, Ordering::SeqCst) {
                        callback();
                    }
                }
                _ => {}
            }
        }));
        ResubscribeNotifier {
            state,
            listener_id,
        }
    }
}

impl Drop for ResubscribeNotifier {
    fn drop(&mut self) {
        self.state.remove_listener(self.listener_id);
    }
}
