//! In-process transport
//!
//! A [`MemoryFabric`] hosts at most one group at a time. The coordinator gets
//! a [`FrontNetwork`] from [`FrontTransport::create_group`]; workers either are
//! spawned with the group ([`MemoryFabric::take_spawned`]) or attach to one of
//! its leaves through [`BackTransport::attach`].
//!
//! Downstream packets are fanned out to per-worker inboxes in send order.
//! Reads on different channels of one worker never block each other.
//! Upstream packets go through the channel's sync policy and transform filter
//! before reaching the coordinator.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::topology::Topology;
use super::{
    Address, AttachPoint, BackNetwork, BackTransport, Channel, ChannelHandle, ChannelId, FilterId, FrontNetwork,
    FrontTransport, MembershipCallback, MembershipEvent, Rank, SyncPolicy, TransformFilter, TransportError,
    WorkerLaunch,
};
use crate::packet::Packet;

/// Port of the first attach point; leaves listen on `base + rank`
pub const DEFAULT_BASE_PORT: u16 = 20000;

/// A transform filter implementation: one wave of packets in, packets out
pub type FilterFn = Arc<dyn Fn(Vec<Packet>) -> Vec<Packet> + Send + Sync>;

type Downstream = (ChannelId, Packet);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared in-process fabric
#[derive(Clone)]
pub struct MemoryFabric {
    inner: Arc<Fabric>,
}

struct Fabric {
    base_port: u16,
    filters: Arc<Mutex<HashMap<String, FilterFn>>>,
    group: Mutex<Option<Arc<Group>>>,
    spawned: Mutex<Vec<Arc<MemoryBackNetwork>>>,
}

impl Default for MemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::with_base_port(DEFAULT_BASE_PORT)
    }

    pub fn with_base_port(base_port: u16) -> Self {
        debug!(base_port, "MemoryFabric::new: called");
        Self {
            inner: Arc::new(Fabric {
                base_port,
                filters: Arc::new(Mutex::new(HashMap::new())),
                group: Mutex::new(None),
                spawned: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make a filter available to `load_filter` under its entry point name
    pub fn register_filter(&self, symbol: &str, filter: FilterFn) {
        debug!(%symbol, "MemoryFabric::register_filter: called");
        lock(&self.inner.filters).insert(symbol.to_string(), filter);
    }

    /// Create a group from an already parsed topology
    pub fn create_group_with(
        &self,
        topology: Topology,
        launch: Option<&WorkerLaunch>,
    ) -> Result<Arc<MemoryFrontNetwork>, TransportError> {
        debug!(?topology, spawn = launch.is_some(), "MemoryFabric::create_group_with: called");
        let attach_points = topology.attach_points(self.inner.base_port)?;
        let (shutdown_tx, _) = watch::channel(false);
        let group = Arc::new(Group {
            root_rank: topology.root().rank,
            attach_points,
            state: Mutex::new(GroupState::default()),
            callbacks: Mutex::new(Vec::new()),
            loaded_filters: Mutex::new(Vec::new()),
            next_channel: AtomicU32::new(1),
            shutdown_tx,
        });

        if let Some(launch) = launch {
            // One worker below every leaf, ranked after the tree's own nodes
            let first_rank = topology
                .leaves()
                .iter()
                .map(|l| l.rank)
                .chain(std::iter::once(topology.root().rank))
                .max()
                .unwrap_or(0)
                + 1;
            let mut spawned = lock(&self.inner.spawned);
            for i in 0..topology.leaves().len() as Rank {
                let worker = group.add_worker(first_rank + i)?;
                spawned.push(worker);
            }
            info!(executable = %launch.executable, count = spawned.len(), "Spawned in-process workers");
        }

        *lock(&self.inner.group) = Some(group.clone());
        Ok(Arc::new(MemoryFrontNetwork {
            group,
            filters: self.inner.filters.clone(),
        }))
    }

    /// Worker networks created by a spawning `create_group`
    pub fn take_spawned(&self) -> Vec<Arc<dyn BackNetwork>> {
        debug!("MemoryFabric::take_spawned: called");
        lock(&self.inner.spawned)
            .drain(..)
            .map(|w| w as Arc<dyn BackNetwork>)
            .collect()
    }

    fn current_group(&self) -> Result<Arc<Group>, TransportError> {
        lock(&self.inner.group).clone().ok_or(TransportError::ShutDown)
    }
}

#[async_trait]
impl FrontTransport for MemoryFabric {
    async fn create_group(
        &self,
        topology: &Path,
        launch: Option<&WorkerLaunch>,
    ) -> Result<Arc<dyn FrontNetwork>, TransportError> {
        debug!(topology = %topology.display(), "MemoryFabric::create_group: called");
        let topology = Topology::load(topology)?;
        let network = self.create_group_with(topology, launch)?;
        Ok(network)
    }
}

#[async_trait]
impl BackTransport for MemoryFabric {
    async fn attach(&self, parent: &AttachPoint, rank: Rank) -> Result<Arc<dyn BackNetwork>, TransportError> {
        debug!(%parent, rank, "MemoryFabric::attach: called");
        let group = self.current_group()?;
        if !group.attach_points.contains(parent) {
            return Err(TransportError::UnknownParent {
                host: parent.host.clone(),
                port: parent.port,
                rank: parent.rank,
            });
        }
        let worker = group.add_worker(rank)?;
        group.notify(MembershipEvent::WorkerJoined(rank));
        Ok(worker)
    }
}

struct Group {
    root_rank: Rank,
    attach_points: Vec<AttachPoint>,
    state: Mutex<GroupState>,
    callbacks: Mutex<Vec<MembershipCallback>>,
    loaded_filters: Mutex<Vec<FilterFn>>,
    next_channel: AtomicU32,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct GroupState {
    shut_down: bool,
    workers: BTreeMap<Rank, Arc<Inbox>>,
    channels: HashMap<ChannelId, Arc<ChannelShared>>,
}

impl Group {
    fn add_worker(self: &Arc<Self>, rank: Rank) -> Result<Arc<MemoryBackNetwork>, TransportError> {
        let inbox = Arc::new(Inbox::new());
        {
            let mut state = lock(&self.state);
            if state.shut_down {
                return Err(TransportError::ShutDown);
            }
            if state.workers.contains_key(&rank) {
                return Err(TransportError::DuplicateRank(rank));
            }
            state.workers.insert(rank, inbox.clone());
        }
        debug!(rank, "Group::add_worker: attached");
        Ok(Arc::new(MemoryBackNetwork {
            rank,
            group: self.clone(),
            inbox,
            known: Mutex::new(HashMap::new()),
        }))
    }

    fn remove_worker(&self, rank: Rank) {
        let removed = lock(&self.state).workers.remove(&rank);
        if let Some(inbox) = removed {
            inbox.close();
            debug!(rank, "Group::remove_worker: detached");
            self.notify(MembershipEvent::NodeRemoved(rank));
        }
    }

    fn notify(&self, event: MembershipEvent) {
        for callback in lock(&self.callbacks).iter() {
            callback(event);
        }
    }

    fn num_workers(&self) -> usize {
        lock(&self.state).workers.len()
    }

    fn channel(&self, id: ChannelId) -> Option<Arc<ChannelShared>> {
        lock(&self.state).channels.get(&id).cloned()
    }

    fn apply(&self, transform: TransformFilter, wave: Vec<Packet>) -> Vec<Packet> {
        match transform {
            TransformFilter::Null => wave,
            TransformFilter::Sum => {
                let Some(tag) = wave.first().map(|p| p.tag) else {
                    return wave;
                };
                let total = wave
                    .iter()
                    .map(|p| {
                        p.as_int().unwrap_or_else(|e| {
                            warn!(error = %e, "Sum filter: treating undecodable payload as 0");
                            0
                        })
                    })
                    .sum();
                vec![Packet::int(tag, total)]
            }
            TransformFilter::Loaded(id) => {
                let filter = lock(&self.loaded_filters).get(id as usize).cloned();
                match filter {
                    Some(filter) => filter(wave),
                    None => {
                        warn!(id, "Unknown filter id, delivering packets untouched");
                        wave
                    }
                }
            }
        }
    }
}

struct ChannelShared {
    id: ChannelId,
    members: Vec<Rank>,
    transform: TransformFilter,
    sync: SyncPolicy,
    closed_tx: watch::Sender<bool>,
    upstream: Mutex<BTreeMap<Rank, VecDeque<Packet>>>,
    delivered_tx: mpsc::UnboundedSender<Packet>,
}

impl ChannelShared {
    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Queue one worker's packet and release whatever the sync policy allows
    fn push_upstream(&self, group: &Group, rank: Rank, packet: Packet) {
        let wave = match self.sync {
            SyncPolicy::DontWait => Some(vec![packet]),
            SyncPolicy::WaitForAll => {
                let mut pending = lock(&self.upstream);
                pending.entry(rank).or_default().push_back(packet);
                let complete = self
                    .members
                    .iter()
                    .all(|m| pending.get(m).is_some_and(|q| !q.is_empty()));
                if complete {
                    Some(
                        self.members
                            .iter()
                            .filter_map(|m| pending.get_mut(m).and_then(|q| q.pop_front()))
                            .collect(),
                    )
                } else {
                    None
                }
            }
        };

        if let Some(wave) = wave {
            for packet in group.apply(self.transform, wave) {
                let _ = self.delivered_tx.send(packet);
            }
        }
    }
}

/// Coordinator side of a memory group
pub struct MemoryFrontNetwork {
    group: Arc<Group>,
    filters: Arc<Mutex<HashMap<String, FilterFn>>>,
}

#[async_trait]
impl FrontNetwork for MemoryFrontNetwork {
    fn broadcast_address(&self) -> Address {
        Address::new(lock(&self.group.state).workers.keys().copied().collect())
    }

    fn new_channel(
        &self,
        address: &Address,
        transform: TransformFilter,
        sync: SyncPolicy,
    ) -> Result<ChannelHandle, TransportError> {
        let id = self.group.next_channel.fetch_add(1, Ordering::SeqCst);
        debug!(id, members = address.len(), ?transform, ?sync, "MemoryFrontNetwork::new_channel: called");
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(ChannelShared {
            id,
            members: address.members.clone(),
            transform,
            sync,
            closed_tx,
            upstream: Mutex::new(BTreeMap::new()),
            delivered_tx,
        });

        {
            let mut state = lock(&self.group.state);
            if state.shut_down {
                return Err(TransportError::ShutDown);
            }
            state.channels.insert(id, shared.clone());
        }

        Ok(ChannelHandle::new(Arc::new(FrontChannel {
            shared,
            group: self.group.clone(),
            delivered_rx: tokio::sync::Mutex::new(delivered_rx),
        })))
    }

    fn leaf_attach_points(&self) -> Vec<AttachPoint> {
        self.group.attach_points.clone()
    }

    fn on_membership_event(&self, callback: MembershipCallback) {
        lock(&self.group.callbacks).push(callback);
    }

    fn load_filter(&self, path: &Path, symbol: &str) -> Result<FilterId, TransportError> {
        debug!(path = %path.display(), %symbol, "MemoryFrontNetwork::load_filter: called");
        // The fabric resolves filters by entry point; the shared object only has to exist
        if !path.exists() {
            return Err(TransportError::FilterLoad {
                path: path.display().to_string(),
                symbol: symbol.to_string(),
                reason: "no such file".to_string(),
            });
        }
        let filter = lock(&self.filters).get(symbol).cloned();
        let filter = filter.ok_or_else(|| TransportError::FilterLoad {
            path: path.display().to_string(),
            symbol: symbol.to_string(),
            reason: "entry point not found".to_string(),
        })?;
        let mut loaded = lock(&self.group.loaded_filters);
        loaded.push(filter);
        Ok((loaded.len() - 1) as FilterId)
    }

    fn local_rank(&self) -> Rank {
        self.group.root_rank
    }

    fn num_workers(&self) -> usize {
        self.group.num_workers()
    }

    async fn shutdown(&self) {
        debug!("MemoryFrontNetwork::shutdown: called");
        let channels: Vec<Arc<ChannelShared>> = {
            let mut state = lock(&self.group.state);
            state.shut_down = true;
            // Closing the inboxes wakes any worker still receiving
            for (_, inbox) in std::mem::take(&mut state.workers) {
                inbox.close();
            }
            state.channels.values().cloned().collect()
        };
        for channel in channels {
            channel.closed_tx.send_replace(true);
        }
        self.group.shutdown_tx.send_replace(true);
        info!("Memory group shut down");
    }
}

struct FrontChannel {
    shared: Arc<ChannelShared>,
    group: Arc<Group>,
    delivered_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

#[async_trait]
impl Channel for FrontChannel {
    fn id(&self) -> ChannelId {
        self.shared.id
    }

    fn size(&self) -> usize {
        self.shared.members.len()
    }

    fn transform(&self) -> TransformFilter {
        self.shared.transform
    }

    fn sync(&self) -> SyncPolicy {
        self.shared.sync
    }

    async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed(self.shared.id));
        }
        let state = lock(&self.group.state);
        if state.shut_down {
            return Err(TransportError::ShutDown);
        }
        for rank in &self.shared.members {
            let inbox = state.workers.get(rank).ok_or_else(|| TransportError::Send {
                channel: self.shared.id,
                reason: format!("worker {} is gone", rank),
            })?;
            if !inbox.push((self.shared.id, packet.clone())) {
                return Err(TransportError::Send {
                    channel: self.shared.id,
                    reason: format!("worker {} stopped receiving", rank),
                });
            }
        }
        Ok(())
    }

    async fn recv(&self, blocking: bool) -> Result<Option<Packet>, TransportError> {
        let mut rx = self.delivered_rx.lock().await;
        if blocking {
            rx.recv().await.map(Some).ok_or(TransportError::Recv {
                channel: self.shared.id,
                reason: "delivery queue dropped".to_string(),
            })
        } else {
            Ok(rx.try_recv().ok())
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    async fn wait_closed(&self) {
        self.shared.wait_closed().await
    }

    async fn close(&self) {
        debug!(id = self.shared.id, "FrontChannel::close: called");
        self.shared.closed_tx.send_replace(true);
        lock(&self.group.state).channels.remove(&self.shared.id);
    }
}

/// Per-worker downstream mailbox, buffering packets for channels not being read
///
/// Readers never hold the lock while waiting; every arrival bumps a counter
/// that wakes all of them to look for their own channel.
struct Inbox {
    state: Mutex<InboxState>,
    arrivals: watch::Sender<u64>,
}

#[derive(Default)]
struct InboxState {
    pending: VecDeque<Downstream>,
    closed: bool,
}

impl Inbox {
    fn new() -> Self {
        let (arrivals, _) = watch::channel(0);
        Self {
            state: Mutex::new(InboxState::default()),
            arrivals,
        }
    }

    /// Queue a packet; false once the inbox is closed
    fn push(&self, item: Downstream) -> bool {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return false;
            }
            state.pending.push_back(item);
        }
        self.arrivals.send_modify(|n| *n = n.wrapping_add(1));
        true
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.arrivals.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Next packet for `channel` (any channel when `None`), in arrival order
    ///
    /// Packets already queued are still delivered after the inbox is closed.
    async fn next(&self, channel: Option<ChannelId>, blocking: bool) -> Result<Option<Downstream>, TransportError> {
        let wanted = |id: ChannelId| channel.is_none_or(|c| c == id);
        // Subscribe before looking so an arrival in between is not missed
        let mut arrivals = self.arrivals.subscribe();

        loop {
            {
                let mut state = lock(&self.state);
                if let Some(pos) = state.pending.iter().position(|(id, _)| wanted(*id)) {
                    return Ok(state.pending.remove(pos));
                }
                if state.closed {
                    return Err(TransportError::ShutDown);
                }
                if !blocking {
                    return Ok(None);
                }
            }
            if arrivals.changed().await.is_err() {
                return Err(TransportError::ShutDown);
            }
        }
    }
}

/// Worker side of a memory group
pub struct MemoryBackNetwork {
    rank: Rank,
    group: Arc<Group>,
    inbox: Arc<Inbox>,
    known: Mutex<HashMap<ChannelId, ChannelHandle>>,
}

impl MemoryBackNetwork {
    fn local_channel(&self, id: ChannelId) -> Result<ChannelHandle, TransportError> {
        if let Some(handle) = lock(&self.known).get(&id) {
            return Ok(handle.clone());
        }
        let shared = self.group.channel(id).ok_or(TransportError::Recv {
            channel: id,
            reason: "packet for an unknown channel".to_string(),
        })?;
        let handle = ChannelHandle::new(Arc::new(BackChannel {
            shared,
            rank: self.rank,
            group: self.group.clone(),
            inbox: self.inbox.clone(),
        }));
        lock(&self.known).insert(id, handle.clone());
        debug!(rank = self.rank, id, "MemoryBackNetwork: created local channel end");
        Ok(handle)
    }
}

impl Drop for MemoryBackNetwork {
    fn drop(&mut self) {
        self.group.remove_worker(self.rank);
    }
}

#[async_trait]
impl BackNetwork for MemoryBackNetwork {
    async fn recv_any(&self) -> Result<(Packet, ChannelHandle), TransportError> {
        let (id, packet) = self
            .inbox
            .next(None, true)
            .await?
            .ok_or_else(|| TransportError::NetworkRecv("blocking receive returned nothing".to_string()))?;
        let handle = self.local_channel(id)?;
        Ok((packet, handle))
    }

    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn num_workers(&self) -> usize {
        self.group.num_workers()
    }

    async fn wait_for_shutdown(&self) {
        let mut rx = self.group.shutdown_tx.subscribe();
        let _ = rx.wait_for(|down| *down).await;
    }
}

struct BackChannel {
    shared: Arc<ChannelShared>,
    rank: Rank,
    group: Arc<Group>,
    inbox: Arc<Inbox>,
}

#[async_trait]
impl Channel for BackChannel {
    fn id(&self) -> ChannelId {
        self.shared.id
    }

    fn size(&self) -> usize {
        self.shared.members.len()
    }

    fn transform(&self) -> TransformFilter {
        self.shared.transform
    }

    fn sync(&self) -> SyncPolicy {
        self.shared.sync
    }

    async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed(self.shared.id));
        }
        self.shared.push_upstream(&self.group, self.rank, packet);
        Ok(())
    }

    async fn recv(&self, blocking: bool) -> Result<Option<Packet>, TransportError> {
        Ok(self
            .inbox
            .next(Some(self.shared.id), blocking)
            .await?
            .map(|(_, packet)| packet))
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    async fn wait_closed(&self) {
        self.shared.wait_closed().await
    }

    async fn close(&self) {
        // Workers only hold references to channels; the coordinator owns them
    }
}
