//! Shared client context.
//!
//! Handlers need four things from the client: the configuration, the
//! connection state, the error sink and the ack registry. Bundling them
//! here keeps handlers free of back-pointers to the façade (and of the
//! reference cycles those would create).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::ack::AckRegistry;
use crate::config::ClientConfig;
use crate::error::ErrorSink;
use crate::state::StateBus;

pub(crate) struct ClientContext {
    pub config: ClientConfig,
    pub state: Arc<StateBus>,
    pub errors: Arc<ErrorSink>,
    pub acks: AckRegistry,
    next_uid: AtomicU64,
}

impl ClientContext {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let state = Arc::new(StateBus::new());
        let errors = Arc::new(ErrorSink::new(Arc::clone(&state)));
        let acks = AckRegistry::new(Arc::clone(&state), Arc::clone(&errors));
        Arc::new(ClientContext {
            config,
            state,
            errors,
            acks,
            next_uid: AtomicU64::new(1),
        })
    }

    /// Monotonic per-client id source; RPC correlation ids come from here.
    pub fn next_uid(&self) -> String {
        self.next_uid.fetch_add(1, Ordering::Relaxed).to_string()
    }
}
