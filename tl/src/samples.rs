//! Sample PING protocol
//!
//! The coordinator sends `PING` on a summing channel, every worker answers
//! with 1 and the coordinator checks that the total equals the number of
//! workers.

use async_trait::async_trait;
use eyre::{Result, eyre};
use tracing::{debug, info};

use crate::packet::Packet;
use crate::protocol::{BackContext, BackProtocol, BackSetup, FrontContext, FrontProtocol, FrontSetup};
use crate::tags::Tag;
use crate::transport::{ChannelHandle, SyncPolicy, TransformFilter};

/// Identifier shared by both halves
pub const PING_ID: &str = "PING";

/// Tag of the ping and its replies
pub const PING_TAG: Tag = Tag::protocol(0);

const PING: &str = "PING";

/// Coordinator half
#[derive(Debug, Default)]
pub struct PingFront {
    channel: Option<ChannelHandle>,
    rounds: usize,
}

impl PingFront {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed rounds
    pub fn rounds(&self) -> usize {
        self.rounds
    }
}

#[async_trait]
impl FrontProtocol for PingFront {
    fn id(&self) -> &str {
        PING_ID
    }

    async fn setup(&mut self, setup: &mut FrontSetup<'_>) -> Result<()> {
        debug!("PingFront::setup: called");
        self.channel = Some(setup.create_channel(TransformFilter::Sum, SyncPolicy::WaitForAll)?);
        Ok(())
    }

    async fn run(&mut self, ctx: &mut FrontContext<'_>) -> Result<()> {
        let channel = self.channel.as_ref().ok_or_else(|| eyre!("PING channel was never created"))?;
        channel.send(Packet::text(PING_TAG, PING)).await?;

        let replies = channel.recv().await?.as_int()?;
        let expected = ctx.num_workers() as i64;
        if replies != expected {
            return Err(eyre!("PING answered by {} of {} workers", replies, expected));
        }
        self.rounds += 1;
        info!(replies, round = self.rounds, "PING answered by every worker");
        Ok(())
    }
}

/// Worker half
#[derive(Debug, Default)]
pub struct PingBack {
    channel: Option<ChannelHandle>,
}

impl PingBack {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackProtocol for PingBack {
    fn id(&self) -> &str {
        PING_ID
    }

    async fn setup(&mut self, setup: &mut BackSetup<'_>) -> Result<()> {
        debug!(rank = setup.rank(), "PingBack::setup: called");
        self.channel = Some(setup.next_channel()?);
        Ok(())
    }

    async fn run(&mut self, ctx: &mut BackContext<'_>) -> Result<()> {
        let channel = self.channel.as_ref().ok_or_else(|| eyre!("PING channel was never received"))?;
        let packet = channel.recv().await?;
        let text = packet.as_text()?;
        if packet.tag != PING_TAG || text != PING {
            return Err(eyre!("expected {} on tag {}, got {:?} on tag {}", PING, PING_TAG, text, packet.tag));
        }
        debug!(rank = ctx.rank(), "PingBack::run: answering");
        channel.send(Packet::int(PING_TAG, 1)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_tag_is_first_protocol_tag() {
        assert_eq!(PING_TAG, Tag::FIRST_PROTOCOL);
        assert!(!PING_TAG.is_reserved());
    }

    #[test]
    fn test_halves_share_identifier() {
        assert_eq!(PingFront::new().id(), PingBack::new().id());
        assert_eq!(PingFront::new().rounds(), 0);
    }
}
