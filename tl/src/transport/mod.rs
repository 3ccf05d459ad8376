//! Transport boundary
//!
//! The multicast tree itself is an external collaborator. This module names
//! the handful of operations the session layer needs from it:
//!
//! - a coordinator-side [`FrontNetwork`]: channels over the broadcast address,
//!   leaf attach points, membership events, filter loading, teardown
//! - a worker-side [`BackNetwork`]: the "any channel" receive that implicitly
//!   creates the local end of channels the coordinator created
//! - [`Channel`]: tagged send (always flushed) and receive
//!
//! [`memory`] provides a complete in-process implementation.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::Packet;

pub mod memory;
mod topology;

pub use topology::{Topology, TopologyNode};

/// Rank of a node in the transport
pub type Rank = u32;

/// Transport-level channel identifier
pub type ChannelId = u32;

/// Identifier of a transform filter loaded into the transport
pub type FilterId = u32;

/// Errors raised by a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send failed on channel {channel}: {reason}")]
    Send { channel: ChannelId, reason: String },

    #[error("receive failed on channel {channel}: {reason}")]
    Recv { channel: ChannelId, reason: String },

    #[error("network receive failed: {0}")]
    NetworkRecv(String),

    #[error("channel {0} is closed")]
    Closed(ChannelId),

    #[error("network has been shut down")]
    ShutDown,

    #[error("no attach point {host}:{port} with rank {rank}")]
    UnknownParent { host: String, port: u16, rank: Rank },

    #[error("rank {0} is already attached")]
    DuplicateRank(Rank),

    #[error("failed to load filter '{symbol}' from {path}: {reason}")]
    FilterLoad {
        path: String,
        symbol: String,
        reason: String,
    },

    #[error("invalid topology: {0}")]
    Topology(String),
}

/// How concurrently arriving upstream payloads are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformFilter {
    /// Deliver every payload untouched
    Null,
    /// Add integer payloads together
    Sum,
    /// A filter loaded at runtime
    Loaded(FilterId),
}

/// When a receive on the coordinator side unblocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPolicy {
    /// Wait until every worker contributed one packet
    WaitForAll,
    /// Deliver packets as they arrive
    DontWait,
}

/// Multicast address a channel is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Worker ranks reached by this address
    pub members: Vec<Rank>,
}

impl Address {
    pub fn new(mut members: Vec<Rank>) -> Self {
        members.sort_unstable();
        members.dedup();
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A transport node that accepts worker connections
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachPoint {
    pub host: String,
    pub port: u16,
    pub rank: Rank,
}

impl fmt::Display for AttachPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.rank)
    }
}

/// Topology change delivered by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A worker attached
    WorkerJoined(Rank),
    /// A node left; the transport cannot tell a clean quit from a failure
    NodeRemoved(Rank),
}

/// Callback invoked by the transport on membership changes
pub type MembershipCallback = Box<dyn Fn(MembershipEvent) + Send + Sync>;

/// Executable and arguments the transport uses to spawn workers itself
#[derive(Debug, Clone, Default)]
pub struct WorkerLaunch {
    pub executable: String,
    pub args: Vec<String>,
}

/// One end of a multicast channel
#[async_trait]
pub trait Channel: Send + Sync {
    /// Transport-level identifier
    fn id(&self) -> ChannelId;

    /// Number of workers reached by this channel
    fn size(&self) -> usize;

    /// Upstream transform filter
    fn transform(&self) -> TransformFilter;

    /// Upstream synchronization policy
    fn sync(&self) -> SyncPolicy;

    /// Send a packet and flush it
    async fn send(&self, packet: Packet) -> Result<(), TransportError>;

    /// Receive the next packet; `None` only when not blocking and nothing is queued
    async fn recv(&self, blocking: bool) -> Result<Option<Packet>, TransportError>;

    /// Whether the coordinator has torn this channel down
    fn is_closed(&self) -> bool;

    /// Wait until the coordinator tears this channel down
    async fn wait_closed(&self);

    /// Tear the channel down (coordinator side)
    async fn close(&self);
}

/// Shared, cloneable reference to a channel end
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<dyn Channel>,
}

impl ChannelHandle {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { inner: channel }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id()
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn transform(&self) -> TransformFilter {
        self.inner.transform()
    }

    pub fn sync(&self) -> SyncPolicy {
        self.inner.sync()
    }

    pub async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        self.inner.send(packet).await
    }

    /// Blocking receive
    pub async fn recv(&self) -> Result<Packet, TransportError> {
        match self.inner.recv(true).await? {
            Some(packet) => Ok(packet),
            None => Err(TransportError::Recv {
                channel: self.id(),
                reason: "blocking receive returned no packet".to_string(),
            }),
        }
    }

    /// Non-blocking receive
    pub async fn try_recv(&self) -> Result<Option<Packet>, TransportError> {
        self.inner.recv(false).await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub async fn wait_closed(&self) {
        self.inner.wait_closed().await
    }

    pub async fn close(&self) {
        self.inner.close().await
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("transform", &self.transform())
            .field("sync", &self.sync())
            .finish()
    }
}

/// Coordinator-side view of the transport group
#[async_trait]
pub trait FrontNetwork: Send + Sync {
    /// Address reaching every attached worker
    fn broadcast_address(&self) -> Address;

    /// Create a channel; the workers learn about it on the first packet
    fn new_channel(
        &self,
        address: &Address,
        transform: TransformFilter,
        sync: SyncPolicy,
    ) -> Result<ChannelHandle, TransportError>;

    /// Leaf nodes workers can attach to, in topology order
    fn leaf_attach_points(&self) -> Vec<AttachPoint>;

    /// Register a membership callback
    fn on_membership_event(&self, callback: MembershipCallback);

    /// Load a transform filter from a shared object
    fn load_filter(&self, path: &Path, symbol: &str) -> Result<FilterId, TransportError>;

    /// Rank of the coordinator
    fn local_rank(&self) -> Rank;

    /// Number of workers currently attached
    fn num_workers(&self) -> usize;

    /// Release the group; every internal node and worker is told to exit
    async fn shutdown(&self);
}

/// Worker-side view of the transport group
#[async_trait]
pub trait BackNetwork: Send + Sync {
    /// Receive the next packet on any channel; unknown channels are created locally
    async fn recv_any(&self) -> Result<(Packet, ChannelHandle), TransportError>;

    /// Transport rank of this worker
    fn local_rank(&self) -> Rank;

    /// Number of workers in the group
    fn num_workers(&self) -> usize;

    /// Block until the coordinator released the group
    async fn wait_for_shutdown(&self);
}

/// Creates transport groups on the coordinator side
#[async_trait]
pub trait FrontTransport: Send + Sync {
    /// Instantiate the tree described by `topology`, optionally spawning workers
    async fn create_group(
        &self,
        topology: &Path,
        launch: Option<&WorkerLaunch>,
    ) -> Result<Arc<dyn FrontNetwork>, TransportError>;
}

/// Attaches independently launched workers to a running group
#[async_trait]
pub trait BackTransport: Send + Sync {
    /// Attach to `parent` using the given transport rank
    async fn attach(&self, parent: &AttachPoint, rank: Rank) -> Result<Arc<dyn BackNetwork>, TransportError>;
}
