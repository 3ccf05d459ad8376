//! The control channel
//!
//! One broadcast channel carries every coordination message: the initial
//! announcement, channel counts during the handshake, protocol identifiers,
//! acknowledgements, barriers and the exit sentinel. Anything that goes wrong
//! here is fatal; see [`SessionError::is_fatal`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::SessionError;
use crate::packet::Packet;
use crate::tags::Tag;
use crate::transport::{ChannelHandle, ChannelId, SyncPolicy, TransformFilter};

/// Lifecycle of the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlState {
    Uninitialized,
    Announced,
    Ready,
    Dispatching,
    ShuttingDown,
    Closed,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlState::Uninitialized => "uninitialized",
            ControlState::Announced => "announced",
            ControlState::Ready => "ready",
            ControlState::Dispatching => "dispatching",
            ControlState::ShuttingDown => "shutting-down",
            ControlState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// How acknowledgements travel back on the control channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlPolicy {
    /// Sum transform, wait for every worker: one pre-summed reply
    #[default]
    Blocking,
    /// Null transform, don't wait: one reply per worker
    NonBlocking,
}

impl ControlPolicy {
    pub fn filters(self) -> (TransformFilter, SyncPolicy) {
        match self {
            ControlPolicy::Blocking => (TransformFilter::Sum, SyncPolicy::WaitForAll),
            ControlPolicy::NonBlocking => (TransformFilter::Null, SyncPolicy::DontWait),
        }
    }
}

/// The control channel plus its state
#[derive(Debug)]
pub struct ControlChannel {
    handle: ChannelHandle,
    state: ControlState,
}

impl ControlChannel {
    pub fn new(handle: ChannelHandle, state: ControlState) -> Self {
        debug!(id = handle.id(), %state, "ControlChannel::new: called");
        Self { handle, state }
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    pub fn id(&self) -> ChannelId {
        self.handle.id()
    }

    /// Number of workers on the control channel
    pub fn size(&self) -> usize {
        self.handle.size()
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ControlState) {
        debug!(id = self.id(), from = %self.state, to = %state, "ControlChannel::set_state: transition");
        self.state = state;
    }

    /// Fail with `InvalidState` unless the channel is in one of `allowed`
    pub(crate) fn require(&self, op: &'static str, allowed: &[ControlState]) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidState { op, state: self.state })
        }
    }

    /// Send and flush; any failure is fatal
    pub async fn send(&self, op: &'static str, packet: Packet) -> Result<(), SessionError> {
        debug!(op, id = self.id(), tag = %packet.tag, "ControlChannel::send: called");
        self.handle.send(packet).await.map_err(|e| {
            error!(op, channel = self.id(), error = %e, "Control channel send failed");
            SessionError::transport(op, self.id(), e)
        })
    }

    /// Blocking receive that insists on `expected` (ANY accepts every tag)
    pub async fn recv_expect(&self, op: &'static str, expected: Tag) -> Result<Packet, SessionError> {
        debug!(op, id = self.id(), %expected, "ControlChannel::recv_expect: called");
        let packet = self.handle.recv().await.map_err(|e| {
            error!(op, channel = self.id(), error = %e, "Control channel receive failed");
            SessionError::transport(op, self.id(), e)
        })?;
        if !expected.accepts(packet.tag) {
            error!(op, channel = self.id(), %expected, actual = %packet.tag, "Unexpected tag on control channel");
            return Err(SessionError::UnexpectedTag {
                op,
                channel: self.id(),
                expected,
                actual: packet.tag,
            });
        }
        Ok(packet)
    }

    /// Receive one integer tagged `expected`
    pub async fn recv_int(&self, op: &'static str, expected: Tag) -> Result<i64, SessionError> {
        let packet = self.recv_expect(op, expected).await?;
        packet.as_int().map_err(|e| {
            error!(op, channel = self.id(), error = %e, "Undecodable control payload");
            SessionError::payload(op, self.id(), e)
        })
    }

    /// Collect one integer from every worker and add them up
    ///
    /// With a summing, wait-for-all channel the transport already delivers the
    /// total; otherwise every worker's reply is received separately.
    pub async fn collect_sum(&self, op: &'static str, expected: Tag) -> Result<i64, SessionError> {
        let size = self.size();
        if size == 0 {
            return Ok(0);
        }
        let receives = match (self.handle.transform(), self.handle.sync()) {
            (TransformFilter::Sum, SyncPolicy::WaitForAll) => 1,
            _ => size,
        };
        debug!(op, id = self.id(), receives, "ControlChannel::collect_sum: called");

        let mut total = 0;
        for _ in 0..receives {
            total += self.recv_int(op, expected).await?;
        }
        Ok(total)
    }
}
