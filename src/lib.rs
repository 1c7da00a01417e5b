//! A virtual Ethernet NIC protocol engine over reliable RDMA channels.
//!
//! `ibvnic` speaks the host side of the VNIC protocol to an Ethernet I/O
//! controller (EIOC) reached over InfiniBand. Each interface ([`vnic::Vnic`])
//! has a primary and an optional secondary path ([`viport::Viport`]); each
//! path runs a control channel that negotiates and configures the interface,
//! and a data channel that moves Ethernet frames by RDMA-writing them into
//! buffer pools the two ends exchange.
//!
//! The crate does not talk to hardware itself. It is handed a
//! [`transport::Transport`] that opens reliable connections and registers
//! memory, and reports to the network stack above through
//! [`vnic::Upstream`]. The [`sim`] module provides an in-process transport
//! and a scripted EIOC to run the engine without an InfiniBand fabric.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use ibvnic::prelude::*;
//!
//! #[derive(Default)]
//! struct Stack;
//!
//! impl Upstream for Stack {
//!     fn receive(&self, _: VnicHandle, _: Vec<RxFrame>) {}
//!     fn carrier(&self, _: VnicHandle, _: bool) {}
//!     fn stop_queue(&self, _: VnicHandle) {}
//!     fn wake_queue(&self, _: VnicHandle) {}
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut transport = SimTransport::new();
//!     transport.start_pumping()?;
//!     let transport = Arc::new(transport);
//!
//!     let mut driver = Driver::new(DriverConfig::default(), transport, Arc::new(Stack))?;
//!     let vnic = driver.create_vnic(VnicConfig::default())?;
//!     driver.set_flags(vnic, false, true)?;
//!     driver.delete_vnic(vnic)?;
//!     driver.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Warning
//!
//! **The interfaces are unstable and up to change!**

#[macro_use]
mod utils;

/// Engine and interface configuration.
pub mod config;

/// Control channel and its wire protocol.
pub mod control;

/// Data channel, buffer pools and the frame trailer.
pub mod data;

/// The engine instance and its workers.
pub mod driver;

/// Inbound multicast membership.
pub mod multicast;

/// In-process transport and EIOC.
pub mod sim;

/// Transport capability the engine runs on.
pub mod transport;

/// One path to an EIOC and its link-state machine.
pub mod viport;

/// Virtual interfaces and path failover.
pub mod vnic;

/// Commonly used types.
pub mod prelude;
