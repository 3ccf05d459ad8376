//! Session error types
//!
//! Errors fall into four groups:
//! - fatal: the control channel lost a message or saw the wrong tag, or the
//!   coordinator could not write the discovery store; the order-based
//!   handshake cannot be resumed, so the driver must terminate
//! - bounded retry: discovery and worker attachment ran out of attempts
//! - aggregate: one or more workers reported a failed protocol run
//! - caller contract: unknown protocol, queue underflow, wrong state

use thiserror::Error;

use crate::config::ConfigError;
use crate::control::ControlState;
use crate::discovery::DiscoveryError;
use crate::packet::PacketError;
use crate::tags::Tag;
use crate::transport::{ChannelId, TransportError};

/// Errors raised by the coordinator and worker sessions
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{op} failed on channel {channel}: {source}")]
    Transport {
        op: &'static str,
        channel: ChannelId,
        #[source]
        source: TransportError,
    },

    #[error("{op}: received tag {actual} on channel {channel}, expected {expected}")]
    UnexpectedTag {
        op: &'static str,
        channel: ChannelId,
        expected: Tag,
        actual: Tag,
    },

    #[error("{op}: undecodable payload on channel {channel}: {source}")]
    Payload {
        op: &'static str,
        channel: ChannelId,
        #[source]
        source: PacketError,
    },

    #[error("{op}: invalid count {count} on channel {channel}")]
    InvalidCount {
        op: &'static str,
        channel: ChannelId,
        count: i64,
    },

    #[error("Failed to create the transport group: {0}")]
    Group(#[source] TransportError),

    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Cannot write connections file: {0}")]
    DiscoveryWrite(#[source] DiscoveryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Rank {0} is too large for an independently launched worker")]
    RankOutOfRange(u32),

    #[error("Connection time-out: {missing} workers failed to attach within {retries} retries")]
    AttachTimeout { missing: usize, retries: u32 },

    #[error("{protocol}: {failed} workers failed")]
    DispatchFailed { protocol: String, failed: i64 },

    #[error("Protocol '{0}' is not loaded")]
    UnknownProtocol(String),

    #[error("Channel registration queue is empty")]
    Underflow,

    #[error("Channel announcement acknowledged by {acked} workers, expected {expected}")]
    AckMismatch { acked: i64, expected: usize },

    #[error("Barrier released by {acked} workers, expected {expected}")]
    BarrierMismatch { acked: i64, expected: usize },

    #[error("{op} is not valid while the control channel is {state}")]
    InvalidState { op: &'static str, state: ControlState },

    #[error("Filter '{name}' not found in {searched}")]
    FilterNotFound { name: String, searched: String },

    #[error("Filter load failed: {0}")]
    FilterLoad(#[source] TransportError),

    #[error("{protocol}: setup failed: {reason}")]
    ProtocolSetup { protocol: String, reason: String },
}

impl SessionError {
    /// Fatal errors leave the two sides unable to agree on what comes next
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Transport { .. }
                | SessionError::UnexpectedTag { .. }
                | SessionError::Payload { .. }
                | SessionError::InvalidCount { .. }
                | SessionError::DiscoveryWrite(_)
        )
    }

    /// Whether this error came out of a bounded retry loop
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(
            self,
            SessionError::AttachTimeout { .. } | SessionError::Discovery(DiscoveryError::NotFound { .. })
        )
    }

    /// Process exit code the top-level driver should use
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() { 1 } else { 2 }
    }

    pub(crate) fn transport(op: &'static str, channel: ChannelId, source: TransportError) -> Self {
        SessionError::Transport { op, channel, source }
    }

    pub(crate) fn payload(op: &'static str, channel: ChannelId, source: PacketError) -> Self {
        SessionError::Payload { op, channel, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let err = SessionError::transport("send", 1, TransportError::Closed(1));
        assert!(err.is_fatal());
        assert_eq!(err.exit_code(), 1);

        let err = SessionError::UnexpectedTag {
            op: "recv",
            channel: 1,
            expected: Tag::ACK,
            actual: Tag::EXIT,
        };
        assert!(err.is_fatal());

        let err = SessionError::DispatchFailed {
            protocol: "PING".to_string(),
            failed: 2,
        };
        assert!(!err.is_fatal());
        assert_eq!(err.exit_code(), 2);

        assert!(!SessionError::Underflow.is_fatal());
        assert!(!SessionError::Config(ConfigError::MissingVariable("TREELINK_NUM_WORKERS")).is_fatal());

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = SessionError::DiscoveryWrite(DiscoveryError::Io {
            path: "/etc/connections".into(),
            source: io,
        });
        assert!(err.is_fatal());
        assert!(!SessionError::UnknownProtocol("X".to_string()).is_fatal());
    }

    #[test]
    fn test_retry_exhausted_classification() {
        let err = SessionError::AttachTimeout { missing: 3, retries: 300 };
        assert!(err.is_retry_exhausted());
        assert!(!err.is_fatal());

        let err = SessionError::Discovery(DiscoveryError::NotFound { rank: 4, attempts: 10 });
        assert!(err.is_retry_exhausted());
    }

    #[test]
    fn test_unexpected_tag_message_names_everything() {
        let err = SessionError::UnexpectedTag {
            op: "dispatch ack",
            channel: 7,
            expected: Tag::ACK,
            actual: Tag::EXIT,
        };
        let msg = err.to_string();
        assert!(msg.contains("dispatch ack"));
        assert!(msg.contains("channel 7"));
        assert!(msg.contains("ACK"));
        assert!(msg.contains("EXIT"));
    }

    #[test]
    fn test_dispatch_failed_message() {
        let err = SessionError::DispatchFailed {
            protocol: "PING".to_string(),
            failed: 1,
        };
        assert_eq!(err.to_string(), "PING: 1 workers failed");
    }

    #[test]
    fn test_attach_timeout_message() {
        let err = SessionError::AttachTimeout { missing: 2, retries: 300 };
        let msg = err.to_string();
        assert!(msg.contains("2 workers"));
        assert!(msg.contains("300"));
    }
}
