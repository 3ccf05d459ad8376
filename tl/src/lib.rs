//! Treelink - coordinator/worker sessions over a multicast tree transport
//!
//! One coordinator drives a group of workers through named protocols. The
//! transport (a tree of internal nodes with workers at the leaves) only moves
//! tagged packets; this crate adds the session on top of it:
//!
//! - bring-up, either with workers the transport spawns or with workers that
//!   were launched on their own and find their parent in a discovery store
//! - a control channel that carries protocol identifiers, acknowledgements
//!   and the exit sentinel
//! - per-protocol channels published by the coordinator in creation order
//! - one aggregate verdict per dispatch
//!
//! # Example
//!
//! ```ignore
//! use treelink::{Config, Coordinator, WorkerLaunch};
//! use treelink::samples::PingFront;
//!
//! let mut coordinator = Coordinator::new(&Config::default());
//! coordinator.init_spawned(&transport, topology, &WorkerLaunch::default()).await?;
//! coordinator.load_protocol(Box::new(PingFront::new())).await?;
//! coordinator.dispatch("PING").await?;
//! coordinator.shutdown().await?;
//! ```

pub mod back;
pub mod cli;
pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod filters;
pub mod front;
pub mod packet;
pub mod protocol;
pub mod samples;
pub mod streams;
pub mod tags;
pub mod transport;

pub use back::{BACKEND_RANK_OFFSET, NoHooks, Worker, WorkerHooks};
pub use config::{Config, Environment};
pub use control::{ControlPolicy, ControlState};
pub use discovery::{DiscoveryRecord, DiscoveryStore, RetryPolicy};
pub use error::SessionError;
pub use front::{Coordinator, DispatchReport};
pub use packet::Packet;
pub use protocol::{BackContext, BackProtocol, BackSetup, FrontContext, FrontProtocol, FrontSetup};
pub use tags::Tag;
pub use transport::{AttachPoint, SyncPolicy, TransformFilter, WorkerLaunch};
