//! Pattern listening (the provider side of subscriptions).
//!
//! A listener tells the hub "I can provide data for subscriptions
//! matching this pattern". The hub reports each matching subscription;
//! the application accepts or rejects the provider role per match. The
//! same machinery serves events and records; only the topic differs.

use std::sync::Arc;

use parking_lot::Mutex;

use hublink_protocol::{Action, Message, Topic};

use crate::connection::MessageSender;
use crate::context::ClientContext;
use crate::resubscribe::ResubscribeNotifier;

/// Application callback for pattern matches.
pub trait ListenListener: Send + Sync {
    /// A subscription matching the pattern appeared. Return `true` to
    /// accept the provider role for it.
    fn on_subscription_for_pattern_added(&self, subscription: &str) -> bool;

    /// A previously reported subscription went away.
    fn on_subscription_for_pattern_removed(&self, subscription: &str);
}

pub(crate) struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    topic: Topic,
    pattern: String,
    callback: Arc<dyn ListenListener>,
    ctx: Arc<ClientContext>,
    connection: Arc<dyn MessageSender>,
    resub: Mutex<Option<ResubscribeNotifier>>,
}

impl Listener {
    pub fn new(
        topic: Topic,
        pattern: &str,
        callback: Arc<dyn ListenListener>,
        ctx: Arc<ClientContext>,
        connection: Arc<dyn MessageSender>,
    ) -> Self {
        let inner = Arc::new(ListenerInner {
            topic,
            pattern: pattern.to_string(),
            callback,
            ctx,
            connection,
            resub: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let resub = ResubscribeNotifier::new(
            Arc::clone(&inner.ctx.state),
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.schedule_ack();
                    inner.send_listen();
                }
            }),
        );
        *inner.resub.lock() = Some(resub);

        Listener { inner }
    }

    /// Arm the ack deadline and send the listen request.
    pub fn start(&self) {
        self.inner.schedule_ack();
        self.inner.send_listen();
    }

    pub fn on_message(&self, message: &Message) {
        let inner = &self.inner;
        match message.action {
            Action::Ack => inner.ctx.acks.clear_message(message),
            Action::SubscriptionForPatternFound => {
                let Some(subscription) = message.field(1) else { return };
                let accepted = inner
                    .callback
                    .on_subscription_for_pattern_added(subscription);
                let action = if accepted {
                    Action::ListenAccept
                } else {
                    Action::ListenReject
                };
                inner
                    .connection
                    .send(inner.topic, action, &[&inner.pattern, subscription]);
            }
            Action::SubscriptionForPatternRemoved => {
                if let Some(subscription) = message.field(1) {
                    inner
                        .callback
                        .on_subscription_for_pattern_removed(subscription);
                }
            }
            _ => {}
        }
    }

    /// Withdraw the provider role and stop resubscribing.
    pub fn destroy(&self) {
        self.inner
            .connection
            .send(self.inner.topic, Action::Unlisten, &[&self.inner.pattern]);
        self.inner.resub.lock().take();
    }
}

impl ListenerInner {
    fn schedule_ack(&self) {
        self.ctx.acks.add(
            self.topic,
            Action::Listen,
            &self.pattern,
            self.ctx.config.subscription_timeout,
        );
    }

    fn send_listen(&self) {
        self.connection
            .send(self.topic, Action::Listen, &[&self.pattern]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::connection::testing::{wire, wire_message, MockConnection};
    use crate::state::ConnectionState;

    struct AcceptShort;

    impl ListenListener for AcceptShort {
        fn on_subscription_for_pattern_added(&self, subscription: &str) -> bool {
            subscription.len() < 10
        }

        fn on_subscription_for_pattern_removed(&self, _subscription: &str) {}
    }

    fn listener() -> (Listener, Arc<MockConnection>) {
        let ctx = ClientContext::new(ClientConfig::default());
        ctx.state.set(ConnectionState::Open);
        let connection = MockConnection::new();
        let listener = Listener::new(
            Topic::Event,
            "weather/.*",
            Arc::new(AcceptShort),
            ctx,
            connection.clone(),
        );
        (listener, connection)
    }

    #[tokio::test]
    async fn test_start_sends_listen() {
        let (listener, connection) = listener();
        listener.start();
        assert_eq!(connection.last_sent(), Some(wire("E|L|weather/.*+")));
    }

    #[tokio::test]
    async fn test_accepted_match_sends_listen_accept() {
        let (listener, connection) = listener();
        listener.start();
        listener.on_message(&wire_message("E|SF|weather/.*|weather/a"));
        assert_eq!(
            connection.last_sent(),
            Some(wire("E|LA|weather/.*|weather/a+"))
        );
    }

    #[tokio::test]
    async fn test_rejected_match_sends_listen_reject() {
        let (listener, connection) = listener();
        listener.start();
        listener.on_message(&wire_message("E|SF|weather/.*|weather/everywhere"));
        assert_eq!(
            connection.last_sent(),
            Some(wire("E|LR|weather/.*|weather/everywhere+"))
        );
    }

    #[tokio::test]
    async fn test_destroy_sends_unlisten() {
        let (listener, connection) = listener();
        listener.start();
        listener.destroy();
        assert_eq!(connection.last_sent(), Some(wire("E|UL|weather/.*+")));
    }
}
