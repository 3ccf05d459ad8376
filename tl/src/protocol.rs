//! Protocols: named units of paired work
//!
//! A protocol has two independent halves, one per role. Both halves share
//! only an identifier; each side keeps its own registry and nothing keeps
//! the two in sync. A worker that is asked to run an identifier it never
//! registered skips the run and still acknowledges success.

use std::collections::HashMap;

use async_trait::async_trait;
use eyre::Result;
use tracing::{debug, error, warn};

use crate::control::ControlChannel;
use crate::error::SessionError;
use crate::filters::FilterLoader;
use crate::packet::Packet;
use crate::streams::ChannelQueue;
use crate::tags::Tag;
use crate::transport::{ChannelHandle, FrontNetwork, SyncPolicy, TransformFilter};

/// Coordinator half of a protocol
#[async_trait]
pub trait FrontProtocol: Send + Sync {
    /// Identifier shared with the worker half
    fn id(&self) -> &str;

    /// Create this protocol's channels, in the same order the worker half pops them
    async fn setup(&mut self, setup: &mut FrontSetup<'_>) -> Result<()>;

    /// Coordinator side of one dispatch
    async fn run(&mut self, ctx: &mut FrontContext<'_>) -> Result<()>;
}

/// Worker half of a protocol
#[async_trait]
pub trait BackProtocol: Send + Sync {
    /// Identifier shared with the coordinator half
    fn id(&self) -> &str;

    /// Pop this protocol's channels, in the order the coordinator created them
    async fn setup(&mut self, setup: &mut BackSetup<'_>) -> Result<()>;

    /// Worker side of one dispatch; an error counts as one failed worker
    async fn run(&mut self, ctx: &mut BackContext<'_>) -> Result<()>;
}

/// Identifier to protocol map, one per role
pub struct ProtocolRegistry<P: ?Sized> {
    protocols: HashMap<String, Box<P>>,
}

impl<P: ?Sized> Default for ProtocolRegistry<P> {
    fn default() -> Self {
        Self {
            protocols: HashMap::new(),
        }
    }
}

impl<P: ?Sized> ProtocolRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under `id`; a later registration replaces an earlier one, an empty id is ignored
    pub fn insert(&mut self, id: &str, protocol: Box<P>) -> bool {
        debug!(%id, "ProtocolRegistry::insert: called");
        if id.is_empty() {
            warn!("Ignoring protocol with an empty identifier");
            return false;
        }
        if self.protocols.insert(id.to_string(), protocol).is_some() {
            warn!(%id, "Protocol registered twice, keeping the latest");
        }
        true
    }

    pub fn fetch(&self, id: &str) -> Option<&P> {
        self.protocols.get(id).map(|p| p.as_ref())
    }

    pub fn fetch_mut(&mut self, id: &str) -> Option<&mut P> {
        self.protocols.get_mut(id).map(|p| p.as_mut())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.protocols.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}

/// What a coordinator protocol can do while it is set up
pub struct FrontSetup<'a> {
    network: &'a dyn FrontNetwork,
    filters: &'a FilterLoader,
    queue: &'a mut ChannelQueue,
}

impl<'a> FrontSetup<'a> {
    pub(crate) fn new(network: &'a dyn FrontNetwork, filters: &'a FilterLoader, queue: &'a mut ChannelQueue) -> Self {
        Self {
            network,
            filters,
            queue,
        }
    }

    /// Create a channel over every worker and queue it for publication
    pub fn create_channel(&mut self, transform: TransformFilter, sync: SyncPolicy) -> Result<ChannelHandle, SessionError> {
        debug!(?transform, ?sync, "FrontSetup::create_channel: called");
        let address = self.network.broadcast_address();
        let handle = self
            .network
            .new_channel(&address, transform, sync)
            .map_err(SessionError::Group)?;
        self.queue.push(handle.clone());
        Ok(handle)
    }

    /// Create a channel whose upstream transform is the named filter
    pub fn create_channel_with_filter(&mut self, name: &str, sync: SyncPolicy) -> Result<ChannelHandle, SessionError> {
        debug!(%name, ?sync, "FrontSetup::create_channel_with_filter: called");
        let filter = self.filters.load(self.network, name)?;
        self.create_channel(TransformFilter::Loaded(filter), sync)
    }

    pub fn num_workers(&self) -> usize {
        self.network.num_workers()
    }
}

/// What a worker protocol can do while it is set up
pub struct BackSetup<'a> {
    queue: &'a mut ChannelQueue,
    rank: u32,
}

impl<'a> BackSetup<'a> {
    pub(crate) fn new(queue: &'a mut ChannelQueue, rank: u32) -> Self {
        Self { queue, rank }
    }

    /// The next channel the coordinator created for this protocol
    pub fn next_channel(&mut self) -> Result<ChannelHandle, SessionError> {
        let handle = self.queue.pop()?;
        debug!(rank = self.rank, channel = handle.id(), "BackSetup::next_channel: popped");
        Ok(handle)
    }

    /// Channels announced but not popped yet
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }
}

/// Coordinator view during a run
pub struct FrontContext<'a> {
    control: &'a ControlChannel,
    rank: u32,
    num_workers: usize,
}

impl<'a> FrontContext<'a> {
    pub(crate) fn new(control: &'a ControlChannel, rank: u32, num_workers: usize) -> Self {
        Self {
            control,
            rank,
            num_workers,
        }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Wait until every worker reached its own `barrier`
    pub async fn barrier(&mut self) -> Result<(), SessionError> {
        debug!("FrontContext::barrier: called");
        let acked = self.control.collect_sum("barrier", Tag::ACK).await?;
        self.control.send("barrier release", Packet::int(Tag::ACK, acked)).await?;
        let expected = self.control.size();
        if acked != expected as i64 {
            error!(acked, expected, "Barrier reached by the wrong number of workers");
            return Err(SessionError::BarrierMismatch { acked, expected });
        }
        Ok(())
    }
}

/// Worker view during a run
pub struct BackContext<'a> {
    control: &'a ControlChannel,
    rank: u32,
    num_workers: usize,
}

impl<'a> BackContext<'a> {
    pub(crate) fn new(control: &'a ControlChannel, rank: u32, num_workers: usize) -> Self {
        Self {
            control,
            rank,
            num_workers,
        }
    }

    /// External rank of this worker
    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Block until the coordinator saw every worker arrive
    pub async fn barrier(&mut self) -> Result<(), SessionError> {
        debug!(rank = self.rank, "BackContext::barrier: called");
        self.control.send("barrier", Packet::int(Tag::ACK, 1)).await?;
        let acked = self.control.recv_int("barrier release", Tag::ACK).await?;
        let expected = self.control.size();
        if acked != expected as i64 {
            error!(rank = self.rank, acked, expected, "Barrier released with the wrong count");
            return Err(SessionError::BarrierMismatch { acked, expected });
        }
        Ok(())
    }
}
