//! # wgadmin-core
//!
//! Lifecycle management for userspace `WireGuard` tunnels.
//!
//! - [`config`]: tunnel files (parse, serialize, validate, on-disk store)
//! - [`client`]: one tunnel's start/stop state machine with rollback
//! - [`net`]: addresses, routes and DNS for a live interface
//! - [`registry`]: at most one running tunnel per name
//! - [`keys`]: key generation and derivation
//! - [`manager`]: the name-based operations a front end calls
//!
//! # Architecture
//!
//! ```text
//! TunnelManager ──► TunnelRegistry ──► TunnelClient<B: Backend>
//!                                         │
//!        ┌──────────────┬─────────────────┼──────────────────┐
//!        ▼              ▼                 ▼                  ▼
//!    TunDevice       Engine ◄── ControlSocket ◄── ControlClient
//!                                                 NetworkConfigurator
//! ```
//!
//! Resources are acquired in a fixed order and released in reverse, both
//! on stop and when a start fails part way.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod client;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod hook;
pub mod keys;
pub mod manager;
pub mod net;
pub mod probe;
pub mod registry;
pub mod status;

pub use backend::{Backend, FakeBackend, UnsupportedBackend};
#[cfg(all(feature = "linux", target_os = "linux"))]
pub use backend::KernelBackend;
pub use client::{ClientOptions, LogLevel, TunnelClient};
pub use config::{Config, ConfigStore, InterfaceConfig, PeerConfig, RouteTable};
pub use error::{
    CleanupErrors, InvalidKeyError, NetworkError, ParseError, Result, TunnelError, ValidationError,
};
pub use hook::HookStage;
pub use keys::{KeyPair, PresharedKey, PrivateKey, PublicKey};
pub use manager::{ManagerSettings, TunnelManager, TunnelSummary};
pub use net::{NetworkConfigurator, UnsupportedNetwork};
pub use probe::{InterfaceProbe, SystemProbe};
pub use registry::TunnelRegistry;
pub use status::{PeerHealth, PeerStats, TunnelState, TunnelStatus};
