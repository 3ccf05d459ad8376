//! Worker role
//!
//! A worker learns about the control channel from the first packet it
//! receives, loads its protocol halves (each one receives the channels the
//! coordinator published for it) and then sits in [`Worker::run_loop`]
//! until the coordinator sends the exit sentinel.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::Environment;
use crate::control::{ControlChannel, ControlState};
use crate::discovery::{DiscoveryStore, RetryPolicy};
use crate::error::SessionError;
use crate::packet::Packet;
use crate::protocol::{BackContext, BackProtocol, BackSetup, ProtocolRegistry};
use crate::streams::{self, ChannelQueue};
use crate::tags::Tag;
use crate::transport::{AttachPoint, BackNetwork, BackTransport, Rank};

/// Added to an independently launched worker's rank to form its transport rank
pub const BACKEND_RANK_OFFSET: Rank = 1_000_000;

/// Callbacks around every protocol run on a worker
pub trait WorkerHooks: Send {
    fn before(&mut self, _id: &str, _protocol: &dyn BackProtocol) {}

    fn after(&mut self, _id: &str, _protocol: &dyn BackProtocol, _outcome: &eyre::Result<()>) {}
}

/// No callbacks
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl WorkerHooks for NoHooks {}

/// Worker side of a session
pub struct Worker {
    network: Arc<dyn BackNetwork>,
    control: ControlChannel,
    registry: ProtocolRegistry<dyn BackProtocol>,
    remote: bool,
}

impl Worker {
    /// Use a network the transport attached when it spawned this worker
    pub async fn from_network(network: Arc<dyn BackNetwork>) -> Result<Self, SessionError> {
        debug!(rank = network.local_rank(), "Worker::from_network: called");
        Self::common_init(network, false).await
    }

    /// Look `rank` up in the discovery store and attach where it says
    pub async fn attach_remote(
        transport: &dyn BackTransport,
        rank: u32,
        store: &DiscoveryStore,
    ) -> Result<Self, SessionError> {
        debug!(rank, path = %store.path().display(), "Worker::attach_remote: called");
        let record = store.lookup(rank).await.inspect_err(|e| {
            error!(rank, error = %e, "Failed to find parent in connections file");
        })?;
        Self::attach_to(transport, rank, &record.attach_point()).await
    }

    /// [`Worker::attach_remote`] with the store named by the environment
    pub async fn attach_from_env(
        transport: &dyn BackTransport,
        rank: u32,
        env: &Environment,
        retry: RetryPolicy,
    ) -> Result<Self, SessionError> {
        let path = env
            .connections_file()
            .inspect_err(|e| error!(rank, error = %e, "No connections file"))?;
        let store = DiscoveryStore::new(path).with_retry(retry);
        Self::attach_remote(transport, rank, &store).await
    }

    /// Attach to a known parent leaf
    pub async fn attach_to(transport: &dyn BackTransport, rank: u32, parent: &AttachPoint) -> Result<Self, SessionError> {
        info!(rank, %parent, "Worker connecting");
        let transport_rank = rank.checked_add(BACKEND_RANK_OFFSET).ok_or_else(|| {
            error!(rank, "Rank leaves no room for the worker offset");
            SessionError::RankOutOfRange(rank)
        })?;
        let network = transport
            .attach(parent, transport_rank)
            .await
            .map_err(|e| {
                error!(rank, %parent, error = %e, "Attach failed");
                SessionError::Group(e)
            })?;
        Self::common_init(network, true).await
    }

    async fn common_init(network: Arc<dyn BackNetwork>, remote: bool) -> Result<Self, SessionError> {
        let (packet, handle) = network.recv_any().await.map_err(|e| {
            error!(rank = network.local_rank(), error = %e, "Receiving the control channel failed");
            SessionError::transport("receive control channel", 0, e)
        })?;
        if packet.tag != Tag::STREAM {
            error!(channel = handle.id(), expected = %Tag::STREAM, actual = %packet.tag, "Unexpected first packet");
            return Err(SessionError::UnexpectedTag {
                op: "receive control channel",
                channel: handle.id(),
                expected: Tag::STREAM,
                actual: packet.tag,
            });
        }
        let control = ControlChannel::new(handle, ControlState::Ready);
        debug!(rank = network.local_rank(), control = control.id(), "Worker::common_init: ready");
        Ok(Self {
            network,
            control,
            registry: ProtocolRegistry::new(),
            remote,
        })
    }

    /// Rank as the application knows it
    pub fn who_am_i(&self) -> u32 {
        let rank = self.network.local_rank();
        if self.remote { rank.saturating_sub(BACKEND_RANK_OFFSET) } else { rank }
    }

    /// Rank inside the transport
    pub fn transport_rank(&self) -> Rank {
        self.network.local_rank()
    }

    /// Workers on the control channel
    pub fn num_workers(&self) -> usize {
        self.control.size()
    }

    pub fn state(&self) -> ControlState {
        self.control.state()
    }

    /// Receive the protocol's channels, set it up and register it
    pub async fn load_protocol(&mut self, mut protocol: Box<dyn BackProtocol>) -> Result<(), SessionError> {
        let id = protocol.id().to_string();
        let rank = self.who_am_i();
        debug!(%id, rank, "Worker::load_protocol: called");
        self.control.require("load protocol", &[ControlState::Ready])?;

        let mut queue = ChannelQueue::new();
        streams::announce(&self.control, self.network.as_ref(), &mut queue).await?;

        let mut setup = BackSetup::new(&mut queue, rank);
        protocol.setup(&mut setup).await.map_err(|e| {
            error!(%id, rank, error = %e, "Protocol setup failed");
            SessionError::ProtocolSetup {
                protocol: id.clone(),
                reason: format!("{:#}", e),
            }
        })?;
        if !queue.is_empty() {
            warn!(%id, rank, unused = queue.len(), "Protocol left announced channels unused");
        }

        if !self.registry.insert(&id, protocol) {
            error!(rank, "Protocol has an empty identifier");
            return Err(SessionError::ProtocolSetup {
                protocol: id,
                reason: "empty protocol identifier".to_string(),
            });
        }
        Ok(())
    }

    pub fn fetch_protocol(&self, id: &str) -> Option<&dyn BackProtocol> {
        self.registry.fetch(id)
    }

    /// Serve dispatches until the exit sentinel arrives, then shut down
    pub async fn run_loop(&mut self) -> Result<(), SessionError> {
        self.run_loop_with(&mut NoHooks).await
    }

    /// [`Worker::run_loop`] with callbacks around every protocol run
    pub async fn run_loop_with(&mut self, hooks: &mut dyn WorkerHooks) -> Result<(), SessionError> {
        let rank = self.who_am_i();
        let num_workers = self.num_workers();
        debug!(rank, "Worker::run_loop_with: called");

        loop {
            let packet = self.control.recv_expect("receive protocol id", Tag::ANY).await?;
            if packet.tag == Tag::EXIT {
                debug!(rank, "Worker::run_loop_with: exit received");
                break;
            }
            if packet.tag != Tag::PROTOCOL_ID {
                error!(rank, channel = self.control.id(), expected = %Tag::PROTOCOL_ID, actual = %packet.tag, "Unexpected tag on control channel");
                return Err(SessionError::UnexpectedTag {
                    op: "receive protocol id",
                    channel: self.control.id(),
                    expected: Tag::PROTOCOL_ID,
                    actual: packet.tag,
                });
            }
            let id = packet
                .as_text()
                .map_err(|e| SessionError::payload("receive protocol id", self.control.id(), e))?;

            self.control.set_state(ControlState::Dispatching);
            let failed = match self.registry.fetch_mut(&id) {
                Some(protocol) => {
                    hooks.before(&id, protocol);
                    let outcome = {
                        let mut ctx = BackContext::new(&self.control, rank, num_workers);
                        protocol.run(&mut ctx).await
                    };
                    hooks.after(&id, protocol, &outcome);
                    match outcome {
                        Ok(()) => 0,
                        Err(e) => {
                            warn!(%id, rank, error = %e, "Protocol run failed");
                            1
                        }
                    }
                }
                None => {
                    warn!(%id, rank, "Protocol is not loaded, skipping");
                    0
                }
            };
            self.control.send("dispatch ack", Packet::int(Tag::ACK, failed)).await?;
            self.control.set_state(ControlState::Ready);
        }

        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<(), SessionError> {
        let rank = self.who_am_i();
        self.control.set_state(ControlState::ShuttingDown);
        self.control.send("exit ack", Packet::int(Tag::EXIT, 1)).await?;

        // The coordinator closes the control channel once every worker acknowledged
        self.control.handle().wait_closed().await;
        self.control.set_state(ControlState::Closed);

        self.network.wait_for_shutdown().await;
        info!(rank, "Worker exiting");
        Ok(())
    }
}
