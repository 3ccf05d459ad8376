//! Channel registration handshake
//!
//! Channels are matched between the two sides by position, never by name.
//! While a protocol is set up, the coordinator queues every channel it
//! creates; publishing tells the workers how many there are and sends one
//! empty packet down each, in creation order. A worker's "any channel"
//! receive turns each of those packets into a local channel end, which it
//! queues in arrival order and hands out through `next_channel`.
//!
//! Both sides must pop the same number of channels in the same order. The
//! only mismatch the protocol can see is the acknowledgement count.

use std::collections::VecDeque;

use tracing::{debug, error, info};

use crate::control::ControlChannel;
use crate::error::SessionError;
use crate::packet::Packet;
use crate::tags::Tag;
use crate::transport::{BackNetwork, ChannelHandle};

/// FIFO of channels registered during one protocol's setup
#[derive(Debug, Default)]
pub struct ChannelQueue {
    queue: VecDeque<ChannelHandle>,
}

impl ChannelQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: ChannelHandle) {
        self.queue.push_back(handle);
    }

    /// Pop the oldest channel
    pub fn pop(&mut self) -> Result<ChannelHandle, SessionError> {
        self.queue.pop_front().ok_or(SessionError::Underflow)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Coordinator side: announce every queued channel and wait for the acknowledgement
///
/// The queue is drained; the coordinator's protocol already holds its handles.
pub async fn publish(control: &ControlChannel, queue: &mut ChannelQueue) -> Result<(), SessionError> {
    let count = queue.len();
    debug!(count, control = control.id(), "publish: called");

    control.send("announce channel count", Packet::int(Tag::STREAM, count as i64)).await?;
    while let Ok(channel) = queue.pop() {
        debug!(channel = channel.id(), "publish: announcing channel");
        channel.send(Packet::empty(Tag::STREAM)).await.map_err(|e| {
            error!(channel = channel.id(), error = %e, "Channel announcement failed");
            SessionError::transport("announce channel", channel.id(), e)
        })?;
    }

    let acked = control.collect_sum("channel announcement ack", Tag::ACK).await?;
    let expected = control.size();
    if acked != expected as i64 {
        error!(acked, expected, "Channel announcement acknowledged by the wrong number of workers");
        return Err(SessionError::AckMismatch { acked, expected });
    }
    info!(count, workers = expected, "Published channels");
    Ok(())
}

/// Worker side: receive the announced channels into `queue` and acknowledge
pub async fn announce(
    control: &ControlChannel,
    network: &dyn BackNetwork,
    queue: &mut ChannelQueue,
) -> Result<usize, SessionError> {
    debug!(control = control.id(), "announce: called");
    let count = control.recv_int("receive channel count", Tag::STREAM).await?;
    let count = usize::try_from(count).map_err(|_| {
        error!(channel = control.id(), count, "Negative channel count");
        SessionError::InvalidCount {
            op: "receive channel count",
            channel: control.id(),
            count,
        }
    })?;

    for _ in 0..count {
        let (packet, channel) = network.recv_any().await.map_err(|e| {
            error!(error = %e, "Receiving announced channel failed");
            SessionError::transport("receive announced channel", control.id(), e)
        })?;
        if packet.tag != Tag::STREAM {
            error!(channel = channel.id(), expected = %Tag::STREAM, actual = %packet.tag, "Unexpected tag while receiving channels");
            return Err(SessionError::UnexpectedTag {
                op: "receive announced channel",
                channel: channel.id(),
                expected: Tag::STREAM,
                actual: packet.tag,
            });
        }
        debug!(channel = channel.id(), "announce: received channel");
        queue.push(channel);
    }

    control.send("acknowledge channels", Packet::int(Tag::ACK, 1)).await?;
    Ok(count)
}
