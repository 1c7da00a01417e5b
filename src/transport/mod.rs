//! The reliable-connection transport the engine runs on.
//!
//! The engine never creates queue pairs or completion queues itself. It is
//! handed a [`Transport`] that knows how to open reliable connections towards
//! an EIOC, register memory for incoming RDMA writes, and subscribe to IB
//! multicast groups. Completions are reported asynchronously through a
//! [`Notify`] sink, possibly from an interrupt-like context.

mod gid;
mod region;
mod wc;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub use self::gid::*;
pub use self::region::*;
pub use self::wc::*;
use crate::config::PathConfig;

/// Which of the two per-path connections a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ChannelKind {
    /// Request/response management connection.
    Control,
    /// Bulk Ethernet frame connection.
    Data,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Control => "control",
            Self::Data => "data",
        })
    }
}

/// Asynchronous event reported by the transport for one connection.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The connection is established and ready to carry traffic.
    Established,
    /// The peer rejected the connection request.
    Rejected,
    /// The connection went down.
    Disconnected,
    /// New work completions can be polled from the connection.
    CompletionReady,
    /// A multicast join requested through [`Transport::join_multicast`]
    /// succeeded; the group resolved to `lid`.
    MulticastJoined { lid: u16 },
    /// A multicast join failed.
    MulticastFailed { error: McError },
}

/// Receiver of [`ChannelEvent`]s.
///
/// Implementations must be callable from any thread and must not block.
/// Transports must not invoke `notify` from inside a `post_*` call on the
/// same connection.
pub trait Notify: Send + Sync {
    fn notify(&self, kind: ChannelKind, event: ChannelEvent);
}

/// A work request posted to the send queue.
#[derive(Debug, Clone)]
pub enum WorkRequest {
    /// Two-sided send consuming one receive buffer at the peer.
    Send {
        wr_id: u64,
        payload: Vec<u8>,
        signaled: bool,
    },
    /// One-sided write into peer memory, optionally with immediate data
    /// consuming one receive buffer at the peer.
    RdmaWrite {
        wr_id: u64,
        payload: Vec<u8>,
        remote: RemoteRegion,
        imm: Option<u32>,
        signaled: bool,
    },
}

impl WorkRequest {
    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> u64 {
        match self {
            Self::Send { wr_id, .. } | Self::RdmaWrite { wr_id, .. } => *wr_id,
        }
    }

    /// Whether a completion will be generated for this request.
    #[inline]
    pub fn signaled(&self) -> bool {
        match self {
            Self::Send { signaled, .. } | Self::RdmaWrite { signaled, .. } => *signaled,
        }
    }
}

/// Transport error type.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The connection has not been established or is already gone.
    #[error("connection not established")]
    NotConnected,

    /// The send or receive queue has no room for the request.
    #[error("work queue full")]
    QueueFull,

    /// The request refers to memory outside any registered region.
    #[error("bad memory reference at {addr:#x} ({len} bytes)")]
    BadAddress { addr: u64, len: usize },

    /// Resources could not be allocated.
    #[error("out of transport resources: {0}")]
    NoResources(String),

    /// Any other failure reported by the underlying stack.
    #[error("transport failure: {0}")]
    Other(String),
}

/// Multicast join error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum McError {
    /// The subnet manager did not answer in time or asked to retry later.
    #[error("multicast join timed out")]
    Timeout,

    /// The subnet manager is busy.
    #[error("multicast join rejected as busy")]
    Busy,

    /// The port or the subnet was reset; all group state is gone.
    #[error("network reset during multicast join")]
    NetReset,

    /// The group is not joinable with the requested parameters.
    #[error("multicast join refused: {0}")]
    Refused(String),
}

impl McError {
    /// Whether retrying the join later may succeed.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Busy)
    }
}

/// Opaque multicast membership handle issued by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct McHandle(pub u64);

/// One reliable connection towards an EIOC.
///
/// All methods take `&self`: posting and polling may happen concurrently from
/// the engine's workers and from completion handlers.
pub trait Connection: Send + Sync {
    /// Which channel this connection carries.
    fn kind(&self) -> ChannelKind;

    /// Start connecting. Completion is reported as [`ChannelEvent::Established`]
    /// or [`ChannelEvent::Rejected`].
    fn connect(&self) -> Result<(), TransportError>;

    /// Tear the connection down. Outstanding work is flushed.
    fn disconnect(&self);

    /// Post a receive buffer of `len` bytes.
    fn post_recv(&self, wr_id: u64, len: usize) -> Result<(), TransportError>;

    /// Post a send-queue work request.
    fn post_send(&self, wr: WorkRequest) -> Result<(), TransportError>;

    /// Non-blockingly poll at most `max` work completions.
    fn poll(&self, max: usize) -> Vec<Completion>;

    /// Attach this connection's receive side to a joined multicast group.
    fn attach_multicast(&self, gid: Gid, lid: u16) -> Result<(), TransportError>;

    /// Detach this connection's receive side from a multicast group.
    fn detach_multicast(&self, gid: Gid, lid: u16) -> Result<(), TransportError>;
}

/// Factory for connections, registered memory and multicast membership.
pub trait Transport: Send + Sync {
    /// Allocate the resources of one connection to the EIOC behind `path`.
    fn open(
        &self,
        kind: ChannelKind,
        path: &PathConfig,
        notify: Arc<dyn Notify>,
    ) -> Result<Arc<dyn Connection>, TransportError>;

    /// Register `len` bytes of memory that the peer may RDMA-write into.
    fn register(&self, len: usize) -> Result<Region, TransportError>;

    /// Start joining a multicast group. The outcome is reported through
    /// `notify` on the [`ChannelKind::Data`] channel.
    fn join_multicast(&self, gid: Gid, notify: Arc<dyn Notify>) -> Result<McHandle, TransportError>;

    /// Release a multicast membership.
    fn leave_multicast(&self, handle: McHandle);
}
