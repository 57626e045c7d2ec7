//! # hublink-client — realtime data-sync client
//!
//! Connects to a hub over one persistent text-frame transport and
//! multiplexes four domains over it: fire-and-forget **events**,
//! versioned replicated **records**, request/response **RPC**, and peer
//! **presence**.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────── Client ─────────────────────────────┐
//! │  EventHandler   RpcHandler   RecordHandler   PresenceHandler     │
//! │       ▲              ▲             ▲                ▲            │
//! │       │ serial       │ serial      │ serial         │ serial     │
//! │  ┌────┴──────────────┴─────────────┴────────────────┴────────┐   │
//! │  │          per-topic dispatchers (EVENT/RPC/RECORD/PRES)    │   │
//! │  └───────────────────────────▲───────────────────────────────┘   │
//! │                              │ decoded messages                  │
//! │  AckRegistry ◄──── Connection (handshake, auth, buffer,          │
//! │  ResubscribeNotifier         reconnect, CONNECTION/AUTH inline)  │
//! │                              │                                   │
//! │                        Endpoint (WebSocket)                      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per-topic ordering is strict, cross-topic progress is independent.
//! Calls that wait on the hub (`login`, `rpc.make`, `presence.get_all`,
//! `record.set_with_ack`, `records.snapshot`, `records.has`,
//! `record.when_ready`) are async and resolve from the dispatchers.
//!
//! ## Modules
//!
//! - [`client`] — the façade applications hold
//! - [`connection`] — state machine, buffering, reconnection, dispatch
//! - [`endpoint`] — transport abstraction (WebSocket + test mock)
//! - [`events`] — publish/subscribe with pattern-listen providers
//! - [`rpc`] — provider and caller roles
//! - [`record`] — records, lists, anonymous records, merge strategies
//! - [`presence`] — peer login/logout and queries
//! - [`error`] — error events, user errors, the runtime error sink

pub mod client;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod listener;
pub mod presence;
pub mod record;
pub mod rpc;
pub mod state;

mod ack;
mod context;
mod emitter;
mod notifier;
mod resubscribe;

pub use client::Client;
pub use config::ClientConfig;
pub use connection::LoginResult;
pub use error::{ClientError, ErrorEvent};
pub use events::EventHandler;
pub use listener::ListenListener;
pub use presence::{PresenceHandler, PresenceListener};
pub use record::anonymous::AnonymousRecord;
pub use record::list::{List, ListEntryChangedListener};
pub use record::merge::{MergeError, MergeStrategy, RecordMergeStrategy};
pub use record::record::{Record, RecordEventsListener};
pub use record::RecordHandler;
pub use rpc::{RpcHandler, RpcResponse};
pub use state::{ConnectionState, GlobalConnectivityState};

// The protocol crate is part of the public API surface (messages,
// topics, actions, typed values).
pub use hublink_protocol as protocol;
