//! Capability traits and wire types for the portward worker.
//!
//! This crate defines the two seams the reconciliation worker depends on:
//!
//! - **[`ModelApi`]** — the orchestrator's model: change streams over
//!   machines and opened port ranges, plus queryable machine / unit /
//!   application handles.
//! - **[`Provider`]** — the cloud's network-security surface: ingress rules
//!   per environment (global firewall mode) or per instance (instance
//!   mode).
//!
//! Both are object-safe async traits so the worker can be wired to the
//! REST clients in [`rest`] in production and to scripted in-memory
//! doubles in tests. The shared wire types — [tags](tags), [`Life`],
//! [`PortRange`], [`IngressRule`], the opened-ports key codec — live here
//! so every implementation speaks the same vocabulary.

pub mod error;
pub mod life;
pub mod model;
pub mod ports;
pub mod provider;
pub mod rest;
pub mod tags;
pub mod transport;
pub mod watch;

pub use error::Error;
pub use life::Life;
pub use model::{Application, Machine, ModelApi, Unit};
pub use ports::{parse_ports_key, IngressRule, PortRange, Protocol};
pub use provider::{Instance, InstanceId, Provider};
pub use rest::{RestModel, RestProvider};
pub use tags::{ApplicationTag, MachineTag, SubnetTag, UnitTag};
pub use transport::{ClientConfig, TlsMode};
pub use watch::{NotifyWatcher, StringsWatcher};
