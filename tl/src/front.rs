//! Coordinator role
//!
//! The coordinator owns the transport group and the control channel. It
//! brings the workers up (spawned by the transport, or launched on their own
//! and pointed at the tree through the discovery store), publishes each
//! protocol's channels, dispatches protocols by identifier and turns the
//! workers' acknowledgements into one verdict per dispatch.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, error, info, warn};

use crate::config::{BringUpConfig, Config, Environment, RemoteFrontSettings};
use crate::control::{ControlChannel, ControlPolicy, ControlState};
use crate::discovery::DiscoveryStore;
use crate::error::SessionError;
use crate::filters::FilterLoader;
use crate::packet::Packet;
use crate::protocol::{FrontContext, FrontProtocol, FrontSetup, ProtocolRegistry};
use crate::streams::{self, ChannelQueue};
use crate::tags::Tag;
use crate::transport::{FilterId, FrontNetwork, FrontTransport, MembershipEvent, WorkerLaunch};

/// Result of a dispatch every worker acknowledged without failures
#[derive(Debug)]
pub struct DispatchReport {
    /// Identifier that was dispatched
    pub protocol: String,
    /// Error returned by the coordinator's own half, if any
    pub front_error: Option<eyre::Report>,
}

impl DispatchReport {
    pub fn front_succeeded(&self) -> bool {
        self.front_error.is_none()
    }
}

/// Coordinator side of a session
pub struct Coordinator {
    policy: ControlPolicy,
    bring_up: BringUpConfig,
    filters: FilterLoader,
    network: Option<Arc<dyn FrontNetwork>>,
    control: Option<ControlChannel>,
    registry: ProtocolRegistry<dyn FrontProtocol>,
    connected: Arc<AtomicUsize>,
    pending_workers: Option<usize>,
    connections_written: bool,
    shutdown_called: bool,
}

impl Coordinator {
    pub fn new(config: &Config) -> Self {
        debug!(policy = ?config.control.policy, "Coordinator::new: called");
        Self {
            policy: config.control.policy,
            bring_up: config.bring_up.clone(),
            filters: FilterLoader::default(),
            network: None,
            control: None,
            registry: ProtocolRegistry::new(),
            connected: Arc::new(AtomicUsize::new(0)),
            pending_workers: None,
            connections_written: false,
            shutdown_called: false,
        }
    }

    /// Use `filters` to resolve named transform filters
    pub fn with_filters(mut self, filters: FilterLoader) -> Self {
        self.filters = filters;
        self
    }

    /// Let the transport launch the workers, then announce the control channel
    pub async fn init_spawned(
        &mut self,
        transport: &dyn FrontTransport,
        topology: &Path,
        launch: &WorkerLaunch,
    ) -> Result<(), SessionError> {
        debug!(topology = %topology.display(), executable = %launch.executable, "Coordinator::init_spawned: called");
        let network = transport
            .create_group(topology, Some(launch))
            .await
            .map_err(|e| {
                error!(error = %e, "Network creation failed");
                SessionError::Group(e)
            })?;
        self.adopt_spawned(network).await
    }

    /// Take over a group whose workers are already attached
    pub async fn adopt_spawned(&mut self, network: Arc<dyn FrontNetwork>) -> Result<(), SessionError> {
        debug!(workers = network.num_workers(), "Coordinator::adopt_spawned: called");
        self.connected.store(network.num_workers(), Ordering::SeqCst);
        self.watch_quits(network.as_ref());
        self.network = Some(network);
        self.announce_control().await
    }

    /// Create a group without workers and write the discovery store
    ///
    /// With `wait` the call also waits for every worker and announces the
    /// control channel; otherwise the caller finishes with [`Coordinator::connect`].
    pub async fn init_remote(
        &mut self,
        transport: &dyn FrontTransport,
        settings: &RemoteFrontSettings,
        wait: bool,
    ) -> Result<(), SessionError> {
        debug!(?settings, wait, "Coordinator::init_remote: called");
        let network = transport
            .create_group(&settings.topology_file, None)
            .await
            .map_err(|e| {
                error!(error = %e, "Network creation failed");
                SessionError::Group(e)
            })?;
        self.adopt_remote(network, settings.num_workers, &settings.connections_file, wait)
            .await
    }

    /// [`Coordinator::init_remote`] with settings from the environment
    pub async fn init_remote_from_env(
        &mut self,
        transport: &dyn FrontTransport,
        env: &Environment,
        wait: bool,
    ) -> Result<(), SessionError> {
        let settings = env.remote_front().inspect_err(|e| error!(error = %e, "Missing remote settings"))?;
        self.init_remote(transport, &settings, wait).await
    }

    /// Take over a group that independent workers will attach to
    pub async fn adopt_remote(
        &mut self,
        network: Arc<dyn FrontNetwork>,
        num_workers: u32,
        connections_file: &Path,
        wait: bool,
    ) -> Result<(), SessionError> {
        debug!(num_workers, connections = %connections_file.display(), wait, "Coordinator::adopt_remote: called");
        self.watch_joins(network.as_ref());
        self.watch_quits(network.as_ref());

        let store = DiscoveryStore::new(connections_file);
        let leaves = network.leaf_attach_points();
        self.network = Some(network);
        store.write_partition(num_workers, &leaves).map_err(|e| {
            error!(path = %connections_file.display(), error = %e, "Cannot write connections file");
            SessionError::DiscoveryWrite(e)
        })?;
        self.connections_written = true;
        info!(path = %connections_file.display(), num_workers, "Connections file written");

        self.pending_workers = Some(num_workers as usize);
        if wait { self.connect().await } else { Ok(()) }
    }

    /// Wait for the remote workers to attach, then announce the control channel
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        debug!(pending = ?self.pending_workers, "Coordinator::connect: called");
        let Some(expected) = self.pending_workers else {
            return Err(SessionError::InvalidState {
                op: "connect",
                state: self.state(),
            });
        };
        if let Err(e) = self.wait_for_workers(expected).await {
            if let Some(network) = self.network.take() {
                network.shutdown().await;
            }
            return Err(e);
        }
        self.pending_workers = None;
        self.announce_control().await
    }

    async fn wait_for_workers(&self, expected: usize) -> Result<(), SessionError> {
        let mut retries = 0;
        let mut last_missing = None;
        loop {
            let connected = self.connected.load(Ordering::SeqCst);
            let missing = expected.saturating_sub(connected);
            if missing == 0 {
                info!(workers = expected, "All workers connected");
                return Ok(());
            }
            if last_missing != Some(missing) {
                info!("Waiting for {} workers to connect...", missing);
                last_missing = Some(missing);
            }
            if retries >= self.bring_up.max_attach_retries {
                error!(
                    missing,
                    retries = self.bring_up.max_attach_retries,
                    "Connection time-out: workers failed to attach"
                );
                return Err(SessionError::AttachTimeout {
                    missing,
                    retries: self.bring_up.max_attach_retries,
                });
            }
            retries += 1;
            tokio::time::sleep(self.bring_up.poll_interval()).await;
        }
    }

    fn watch_joins(&self, network: &dyn FrontNetwork) {
        let connected = self.connected.clone();
        network.on_membership_event(Box::new(move |event| {
            if let MembershipEvent::WorkerJoined(rank) = event {
                let now = connected.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(rank, connected = now, "Worker joined");
            }
        }));
    }

    fn watch_quits(&self, network: &dyn FrontNetwork) {
        let connected = self.connected.clone();
        network.on_membership_event(Box::new(move |event| {
            // A quit and a failure look the same from here
            if let MembershipEvent::NodeRemoved(rank) = event {
                let _ = connected.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
                debug!(rank, "Node removed");
            }
        }));
    }

    async fn announce_control(&mut self) -> Result<(), SessionError> {
        let network = self.network()?;
        let (transform, sync) = self.policy.filters();
        let handle = network
            .new_channel(&network.broadcast_address(), transform, sync)
            .map_err(SessionError::Group)?;
        let mut control = ControlChannel::new(handle, ControlState::Uninitialized);
        control.send("announce control channel", Packet::empty(Tag::STREAM)).await?;
        control.set_state(ControlState::Announced);
        info!(channel = control.id(), workers = control.size(), policy = ?self.policy, "Control channel announced");
        self.control = Some(control);
        Ok(())
    }

    fn network(&self) -> Result<Arc<dyn FrontNetwork>, SessionError> {
        self.network.clone().ok_or(SessionError::InvalidState {
            op: "use network",
            state: ControlState::Uninitialized,
        })
    }

    fn ready_control(&self, op: &'static str) -> Result<&ControlChannel, SessionError> {
        let control = self.control.as_ref().ok_or(SessionError::InvalidState {
            op,
            state: ControlState::Uninitialized,
        })?;
        if self.shutdown_called {
            return Err(SessionError::InvalidState {
                op,
                state: control.state(),
            });
        }
        control.require(op, &[ControlState::Announced, ControlState::Ready])?;
        Ok(control)
    }

    /// Set the protocol up, publish its channels and register it
    pub async fn load_protocol(&mut self, mut protocol: Box<dyn FrontProtocol>) -> Result<(), SessionError> {
        let id = protocol.id().to_string();
        debug!(%id, "Coordinator::load_protocol: called");
        let network = self.network()?;
        let control = self.ready_control("load protocol")?;

        let mut queue = ChannelQueue::new();
        let setup_result = {
            let mut setup = FrontSetup::new(network.as_ref(), &self.filters, &mut queue);
            protocol.setup(&mut setup).await
        };
        // Workers wait for the announcement whether or not setup worked
        streams::publish(control, &mut queue).await?;
        if let Some(control) = self.control.as_mut() {
            control.set_state(ControlState::Ready);
        }

        if let Err(e) = setup_result {
            error!(%id, error = %e, "Protocol setup failed");
            return Err(SessionError::ProtocolSetup {
                protocol: id,
                reason: format!("{:#}", e),
            });
        }
        if !self.registry.insert(&id, protocol) {
            error!("Protocol has an empty identifier");
            return Err(SessionError::ProtocolSetup {
                protocol: id,
                reason: "empty protocol identifier".to_string(),
            });
        }
        info!(%id, "Protocol loaded");
        Ok(())
    }

    /// Load the named filter into the transport
    pub fn load_filter(&self, name: &str) -> Result<FilterId, SessionError> {
        let network = self.network()?;
        self.filters.load(network.as_ref(), name)
    }

    pub fn fetch_protocol(&self, id: &str) -> Option<&dyn FrontProtocol> {
        self.registry.fetch(id)
    }

    /// Run protocol `id` on the coordinator and on every worker
    ///
    /// Fails before anything is sent when `id` is not loaded here. A nonzero
    /// acknowledgement total becomes [`SessionError::DispatchFailed`].
    pub async fn dispatch(&mut self, id: &str) -> Result<DispatchReport, SessionError> {
        debug!(%id, "Coordinator::dispatch: called");
        self.ready_control("dispatch")?;
        if !self.registry.contains(id) {
            error!(%id, "Protocol is not loaded");
            return Err(SessionError::UnknownProtocol(id.to_string()));
        }
        let rank = self.network()?.local_rank();

        let Self { control, registry, .. } = self;
        let (Some(control), Some(protocol)) = (control.as_mut(), registry.fetch_mut(id)) else {
            return Err(SessionError::UnknownProtocol(id.to_string()));
        };

        info!(%id, "Dispatching");
        control.set_state(ControlState::Dispatching);
        control.send("dispatch", Packet::text(Tag::PROTOCOL_ID, id)).await?;

        let front_error = {
            let mut ctx = FrontContext::new(control, rank, control.size());
            protocol.run(&mut ctx).await.err()
        };
        if let Some(e) = &front_error {
            warn!(%id, error = %e, "Coordinator half of the protocol failed");
        }

        let failed = control.collect_sum("dispatch ack", Tag::ACK).await?;
        control.set_state(ControlState::Ready);
        if failed != 0 {
            error!(%id, failed, "Workers failed");
            return Err(SessionError::DispatchFailed {
                protocol: id.to_string(),
                failed,
            });
        }
        info!("{}: SUCCESS", id);
        Ok(DispatchReport {
            protocol: id.to_string(),
            front_error,
        })
    }

    /// Tell every worker to exit, wait for them, then release the group
    ///
    /// A second call does nothing. Before the control channel was announced
    /// no channel is touched; the group, if any, is still released.
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        debug!(already = self.shutdown_called, "Coordinator::shutdown: called");
        if self.shutdown_called {
            return Ok(());
        }
        self.shutdown_called = true;

        if let Some(control) = self.control.as_mut() {
            control.set_state(ControlState::ShuttingDown);
            control.send("exit", Packet::empty(Tag::EXIT)).await?;
            let acked = control.collect_sum("exit ack", Tag::EXIT).await?;
            debug!(acked, "Coordinator::shutdown: workers acknowledged exit");
            // Workers are waiting for the control channel to disappear
            control.handle().close().await;
            control.set_state(ControlState::Closed);
        }

        if let Some(network) = self.network.take() {
            network.shutdown().await;
        }
        info!("Coordinator exiting");
        Ok(())
    }

    /// Workers currently attached, as tracked by membership events
    pub fn connected_workers(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_connections_file_written(&self) -> bool {
        self.connections_written
    }

    /// Control channel announced and shutdown not called
    pub fn is_up(&self) -> bool {
        self.control.is_some() && !self.shutdown_called
    }

    /// Workers in the transport group
    pub fn num_workers(&self) -> usize {
        self.network.as_ref().map(|n| n.num_workers()).unwrap_or(0)
    }

    pub fn state(&self) -> ControlState {
        self.control
            .as_ref()
            .map(|c| c.state())
            .unwrap_or(ControlState::Uninitialized)
    }

    pub fn policy(&self) -> ControlPolicy {
        self.policy
    }
}
