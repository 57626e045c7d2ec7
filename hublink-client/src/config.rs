//! Client configuration.

use std::time::Duration;

use crate::record::merge::MergeStrategy;

/// Tunables for timeouts, reconnection and record conflict handling.
///
/// The defaults match the hub's reference deployment; tests shrink the
/// timeouts to keep runs fast.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ack deadline for subscribe/unsubscribe/listen requests.
    pub subscription_timeout: Duration,
    /// Ack deadline for a record subscription.
    pub record_read_ack_timeout: Duration,
    /// Response deadline for the initial record read.
    pub record_read_timeout: Duration,
    /// Ack deadline for a record delete.
    pub record_delete_timeout: Duration,
    /// Ack deadline for an outgoing RPC request.
    pub rpc_ack_timeout: Duration,
    /// Response deadline for an outgoing RPC request.
    pub rpc_response_timeout: Duration,
    /// Reconnect budget before the connection closes permanently.
    pub max_reconnect_attempts: u32,
    /// Linear backoff step between reconnect attempts.
    pub reconnect_interval_increment: Duration,
    /// Upper bound on the backoff interval.
    pub max_reconnect_interval: Duration,
    /// Path appended to endpoint urls that carry none.
    pub path: String,
    /// Conflict resolution applied on record version conflicts.
    pub record_merge_strategy: MergeStrategy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            subscription_timeout: Duration::from_millis(2000),
            record_read_ack_timeout: Duration::from_millis(1000),
            record_read_timeout: Duration::from_millis(3000),
            record_delete_timeout: Duration::from_millis(3000),
            rpc_ack_timeout: Duration::from_millis(6000),
            rpc_response_timeout: Duration::from_millis(10_000),
            max_reconnect_attempts: 5,
            reconnect_interval_increment: Duration::from_millis(4000),
            max_reconnect_interval: Duration::from_millis(180_000),
            path: "/deepstream".to_string(),
            record_merge_strategy: MergeStrategy::RemoteWins,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.subscription_timeout, Duration::from_millis(2000));
        assert_eq!(config.rpc_ack_timeout, Duration::from_millis(6000));
        assert_eq!(config.rpc_response_timeout, Duration::from_millis(10_000));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.path, "/deepstream");
        assert!(matches!(
            config.record_merge_strategy,
            MergeStrategy::RemoteWins
        ));
    }
}
