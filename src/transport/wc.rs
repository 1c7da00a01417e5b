use std::fmt;

use thiserror::Error;

/// Opcode of a work completion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompletionOpcode {
    /// Send request.
    Send,
    /// RDMA write request.
    RdmaWrite,
    /// Receive request.
    Recv,
    /// Receive request consumed by an RDMA write with immediate data.
    RecvRdmaImm,
}

impl CompletionOpcode {
    /// Whether this completion belongs to the receive queue.
    #[inline]
    pub fn is_recv(self) -> bool {
        matches!(self, Self::Recv | Self::RecvRdmaImm)
    }
}

/// Status of a work completion.
///
/// Only the statuses that the engine distinguishes are listed; transports
/// fold everything else into [`CompletionStatus::GeneralErr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompletionStatus {
    /// **Operation completed successfully:** the corresponding work request
    /// (and all of the unsignaled work requests that were posted previous to
    /// it) ended and the buffers it refers to are ready to be reused.
    #[error("success")]
    Success,

    /// **Local Length Error:** a message was larger than the posted receive
    /// buffer or than the port's maximum message size.
    #[error("local length error")]
    LocLenErr,

    /// **Local Protection Error:** the locally posted buffers do not reference
    /// a memory region valid for the requested operation.
    #[error("local protection error")]
    LocProtErr,

    /// **Work Request Flushed Error:** a work request was in process or
    /// outstanding when the connection transitioned into the error state.
    #[error("WR flush error")]
    WrFlushErr,

    /// **Remote Access Error:** a protection error occurred on a remote data
    /// buffer written by an RDMA write.
    #[error("remote access error")]
    RemAccessErr,

    /// **Transport Retry Counter Exceeded:** the remote side did not send any
    /// ACK or NAK. After the first message this usually means that the remote
    /// endpoint is gone.
    #[error("transport retry counter exceeded")]
    RetryExcErr,

    /// **RNR Retry Counter Exceeded:** the remote side did not post any
    /// receive buffer in time.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr,

    /// **General Error:** any other error.
    #[error("general error")]
    GeneralErr,
}

/// Work completion entry.
#[derive(Clone)]
pub struct Completion {
    /// Work request ID given at post time.
    pub wr_id: u64,

    /// Completion status.
    pub status: CompletionStatus,

    /// Completed operation.
    pub opcode: CompletionOpcode,

    /// Number of bytes transferred.
    pub bytes: usize,

    /// Received bytes, for receive completions. Empty otherwise.
    pub data: Vec<u8>,

    /// Immediate data, if the peer sent any.
    pub imm: Option<u32>,
}

impl Completion {
    /// Create a successful completion with no payload.
    pub fn success(wr_id: u64, opcode: CompletionOpcode) -> Self {
        Self {
            wr_id,
            status: CompletionStatus::Success,
            opcode,
            bytes: 0,
            data: Vec::new(),
            imm: None,
        }
    }

    /// Create a successful receive completion carrying `data`.
    pub fn received(wr_id: u64, data: Vec<u8>, imm: Option<u32>) -> Self {
        Self {
            wr_id,
            status: CompletionStatus::Success,
            opcode: if imm.is_some() {
                CompletionOpcode::RecvRdmaImm
            } else {
                CompletionOpcode::Recv
            },
            bytes: data.len(),
            data,
            imm,
        }
    }

    /// Create a failed completion.
    pub fn failed(wr_id: u64, opcode: CompletionOpcode, status: CompletionStatus) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            bytes: 0,
            data: Vec::new(),
            imm: None,
        }
    }

    /// Get the completion status as a `Result`.
    ///
    /// - On success, return the number of bytes processed or transferred.
    /// - Otherwise, return the status as an error.
    #[inline]
    pub fn ok(&self) -> Result<usize, CompletionStatus> {
        match self.status {
            CompletionStatus::Success => Ok(self.bytes),
            status => Err(status),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .field("opcode", &self.opcode)
            .field("bytes", &self.bytes)
            .finish()
    }
}
