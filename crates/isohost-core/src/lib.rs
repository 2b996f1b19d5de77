//! # isohost-core
//!
//! Isolation host management for component activation.
//!
//! Components are activated inside *hosts*: execution contexts with a given
//! isolation level. This crate pools those hosts, creates them on demand,
//! health-checks them with periodic heartbeats and reports hosts that stop
//! answering so callers can fail over.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  isohost-core (caller)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌───────────────────────┐   ┌────────────────────────┐  │
//! │  │ ActivationHostRegistry│──▶│ Vec<PartActivationHost>│  │
//! │  │  - get_host()         │   └────────────────────────┘  │
//! │  │  - activate()         │              │                │
//! │  │  - invoke()           │              ▼                │
//! │  │  - sweep (1s)         │   ┌────────────────────────┐  │
//! │  └───────────────────────┘   │      HostBackend       │  │
//! │             │                │  LocalHost             │  │
//! │             ▼                │  SandboxedHost (thread)│  │
//! │  ┌───────────────────────┐   │  ProcessHost ──────────┼──┼─┐
//! │  │  HostFaulted events   │   └────────────────────────┘  │ │
//! │  └───────────────────────┘                               │ │
//! └──────────────────────────────────────────────────────────┘ │
//!                                                 Unix socket │
//!                                                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │               isohost-agent (child process)              │
//! │            JSON-RPC 2.0, newline-delimited               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use isohost_core::{ActivationHostRegistry, ComponentCatalog, IsolationLevel,
//!     IsolationMetadata, RegistryConfig, RuntimeArgument};
//!
//! # async fn example(catalog: ComponentCatalog) -> isohost_core::Result<()> {
//! let registry = ActivationHostRegistry::new(RegistryConfig::from_env(), catalog)?;
//! registry.start();
//!
//! // Be told when a host dies
//! let mut faults = registry.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = faults.recv().await {
//!         eprintln!("host {} faulted: {}", event.host, event.cause);
//!     }
//! });
//!
//! let metadata = IsolationMetadata::new(IsolationLevel::SandboxedInProcess).group("plugins");
//! let mut reference = registry.activate(&metadata, "plugins", "Formatter").await?;
//! let output = registry
//!     .invoke(&mut reference, "format", vec![RuntimeArgument::new("fn main(){}")])
//!     .await?;
//! println!("{output}");
//!
//! registry.deactivate(&mut reference).await?;
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Three isolation levels**: in-process, sandbox thread, child process
//! - **Host pooling**: hosts are shared per description, or one per type with `host_per_instance`
//! - **Connect handshake**: exponential backoff while a new host comes up
//! - **Heartbeat sweep**: background liveness checks with fault notification
//! - **Fault isolation**: a crashing component only takes down its own host

mod activator;
mod client;
mod component;
mod config;
mod description;
mod error;
mod host;
pub mod protocol;
mod reference;
mod registry;

pub use activator::RemoteActivator;
pub use client::AgentClient;
pub use component::{ActivationServer, Component, ComponentCatalog};
pub use config::{RegistryConfig, RegistryConfigBuilder};
pub use description::{
    ActivationHostDescription, HostId, IsolationLevel, IsolationMetadata, DEFAULT_GROUP,
};
pub use error::{ComponentError, HostError, Result};
pub use host::{
    DefaultHostFactory, HostBackend, HostFactory, LocalHost, PartActivationHost, ProcessHost,
    SandboxedHost,
};
pub use reference::{ObjectId, ObjectReference, RuntimeArgument};
pub use registry::{ActivationHostRegistry, HostFaulted};
