//! Control channel: one outstanding request at a time over the control
//! connection, plus out-of-band status reports from the EIOC.

pub mod wire;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use quanta::Instant;
use thiserror::Error;

use self::wire::*;
use crate::config::ControlConfig;
use crate::transport::*;

/// Work request ID of control sends. Receives use their buffer index.
const SEND_WR_ID: u64 = 1 << 63;

/// Control channel error type.
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    /// A request is already outstanding.
    #[error("a control request is already outstanding")]
    Busy,

    /// The request slot failed earlier and has not been reset.
    #[error("control channel failed")]
    Failed,

    /// The EIOC did not answer in time.
    #[error("{cmd:?} request timed out")]
    Timeout { cmd: Command },

    /// A response that does not match the outstanding request.
    #[error("response {cmd:?}#{seq} does not match outstanding {expected_cmd:?}#{expected_seq}")]
    Mismatch {
        expected_cmd: Command,
        expected_seq: u8,
        cmd: Command,
        seq: u8,
    },

    /// A response arrived while no request was outstanding.
    #[error("unsolicited {cmd:?} response")]
    Unsolicited { cmd: Command },

    /// The EIOC answered the request with an error packet.
    #[error("EIOC refused {cmd:?} request")]
    Refused { cmd: Command },

    /// A control work request completed with an error.
    #[error("control completion failed")]
    Completion(#[from] CompletionStatus),

    /// A packet could not be decoded or encoded.
    #[error("malformed control packet")]
    Wire(#[from] WireError),

    /// The transport refused a post.
    #[error("control transport error")]
    Transport(#[from] TransportError),
}

/// Observable state of the request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RequestState {
    Inactive,
    Posted,
    Sent,
    RspReceived,
    Completed,
    Failed,
}

/// The request slot. Send completion and response arrival are tracked
/// separately since the transport does not order them.
#[derive(Debug)]
enum Slot {
    Inactive,
    Pending {
        cmd: Command,
        seq: u8,
        sent: bool,
        rsp: Option<Response>,
    },
    Failed,
}

impl Slot {
    fn state(&self) -> RequestState {
        match self {
            Slot::Inactive => RequestState::Inactive,
            Slot::Failed => RequestState::Failed,
            Slot::Pending { sent, rsp, .. } => match (*sent, rsp.is_some()) {
                (false, false) => RequestState::Posted,
                (true, false) => RequestState::Sent,
                (false, true) => RequestState::RspReceived,
                (true, true) => RequestState::Completed,
            },
        }
    }
}

/// Something the owner of the channel must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The outstanding request completed; fetch it with
    /// [`ControlChannel::poll_response`].
    ResponseReady,
    /// The EIOC reported its Ethernet link state.
    LinkStatus { up: bool },
    /// An error report was queued; `fatal` tells whether the EIOC gave up on
    /// this VNIC.
    ErrorReport { fatal: bool },
}

/// Request/response protocol over the control connection.
pub struct ControlChannel {
    conn: Arc<dyn Connection>,
    rsp_timeout: Duration,
    recv_depth: usize,

    seq: u8,
    slot: Slot,
    deadline: Option<Instant>,
    errors: VecDeque<StatusReport>,
}

impl ControlChannel {
    /// Wrap a control connection.
    pub fn new(conn: Arc<dyn Connection>, config: &ControlConfig) -> Self {
        Self {
            conn,
            rsp_timeout: config.rsp_timeout(),
            recv_depth: config.recv_depth,
            seq: 0,
            slot: Slot::Inactive,
            deadline: None,
            errors: VecDeque::new(),
        }
    }

    /// Get the underlying connection.
    #[inline]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Get the state of the request slot.
    #[inline]
    pub fn state(&self) -> RequestState {
        self.slot.state()
    }

    /// Get the sequence number of the last request sent.
    #[inline]
    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Get the response deadline of the outstanding request, if any.
    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Post the receive buffers that incoming responses and reports land in.
    pub fn post_receives(&self) -> Result<(), ControlError> {
        for i in 0..self.recv_depth {
            self.conn.post_recv(i as u64, CONTROL_PACKET_SIZE)?;
        }
        Ok(())
    }

    /// Send a request. Fails with [`ControlError::Busy`] while another
    /// request is outstanding.
    pub fn send_request(&mut self, req: &Request, now: Instant) -> Result<u8, ControlError> {
        match self.slot {
            Slot::Inactive => {}
            Slot::Pending { .. } => return Err(ControlError::Busy),
            Slot::Failed => return Err(ControlError::Failed),
        }

        let seq = self.seq.wrapping_add(1);
        let payload = req.encode(seq, 0)?;
        if let Err(e) = self.conn.post_send(WorkRequest::Send {
            wr_id: SEND_WR_ID | seq as u64,
            payload,
            signaled: true,
        }) {
            self.slot = Slot::Failed;
            return Err(e.into());
        }

        self.seq = seq;
        self.slot = Slot::Pending {
            cmd: req.command(),
            seq,
            sent: false,
            rsp: None,
        };
        self.deadline = Some(now + self.rsp_timeout);
        log::trace!("ibvnic: control {:?}#{} posted", req.command(), seq);
        Ok(seq)
    }

    /// Take the response of a completed request, returning the slot to
    /// inactive. Returns `None` unless the request is completed.
    pub fn poll_response(&mut self) -> Option<Response> {
        if self.state() != RequestState::Completed {
            return None;
        }
        match std::mem::replace(&mut self.slot, Slot::Inactive) {
            Slot::Pending { rsp, .. } => {
                self.deadline = None;
                rsp
            }
            _ => None,
        }
    }

    /// Fail the outstanding request if its deadline has passed.
    pub fn check_timeout(&mut self, now: Instant) -> Result<(), ControlError> {
        let cmd = match self.slot {
            Slot::Pending { cmd, .. } if self.state() != RequestState::Completed => cmd,
            _ => return Ok(()),
        };
        match self.deadline {
            Some(deadline) if now >= deadline => Err(self.fail(ControlError::Timeout { cmd })),
            _ => Ok(()),
        }
    }

    /// Take the queued EIOC error reports.
    pub fn drain_errors(&mut self) -> Vec<StatusReport> {
        self.errors.drain(..).collect()
    }

    /// Return the slot to inactive and forget queued reports.
    pub fn reset(&mut self) {
        self.slot = Slot::Inactive;
        self.deadline = None;
        self.errors.clear();
    }

    fn fail(&mut self, err: ControlError) -> ControlError {
        self.slot = Slot::Failed;
        self.deadline = None;
        err
    }

    /// Process one completion polled from the control connection.
    pub fn handle_completion(&mut self, wc: Completion) -> Result<Option<ControlEvent>, ControlError> {
        if let Err(status) = wc.ok() {
            return Err(self.fail(status.into()));
        }

        if !wc.opcode.is_recv() {
            return match &mut self.slot {
                Slot::Pending { seq, sent, rsp, .. } if wc.wr_id == SEND_WR_ID | *seq as u64 => {
                    *sent = true;
                    Ok(rsp.is_some().then_some(ControlEvent::ResponseReady))
                }
                // Completion of a send that belonged to a failed request.
                _ => Ok(None),
            };
        }

        let packet = Packet::decode(&wc.data);
        self.conn
            .post_recv(wc.wr_id, CONTROL_PACKET_SIZE)
            .map_err(|e| self.fail(e.into()))?;
        match packet.map_err(|e| self.fail(e.into()))? {
            Packet::Status(_, report) => Ok(Some(self.handle_status(report))),
            Packet::Response(h, rsp) => self.handle_response(h, Some(rsp)),
            Packet::ErrorResponse(h) => self.handle_response(h, None),
            Packet::Request(h, _) => Err(self.fail(ControlError::Unsolicited { cmd: h.cmd })),
        }
    }

    fn handle_status(&mut self, report: StatusReport) -> ControlEvent {
        match report.kind() {
            StatusKind::LinkUp => ControlEvent::LinkStatus { up: true },
            StatusKind::LinkDown => ControlEvent::LinkStatus { up: false },
            StatusKind::Error => {
                let fatal = report.fatal;
                self.errors.push_back(report);
                ControlEvent::ErrorReport { fatal }
            }
        }
    }

    fn handle_response(
        &mut self,
        h: Header,
        response: Option<Response>,
    ) -> Result<Option<ControlEvent>, ControlError> {
        let (expected_cmd, expected_seq, sent) = match &self.slot {
            Slot::Pending {
                cmd,
                seq,
                sent,
                rsp: None,
            } => (*cmd, *seq, *sent),
            _ => return Err(self.fail(ControlError::Unsolicited { cmd: h.cmd })),
        };
        if h.cmd != expected_cmd || h.seq != expected_seq {
            return Err(self.fail(ControlError::Mismatch {
                expected_cmd,
                expected_seq,
                cmd: h.cmd,
                seq: h.seq,
            }));
        }
        let Some(response) = response else {
            return Err(self.fail(ControlError::Refused { cmd: h.cmd }));
        };

        if let Slot::Pending { rsp, .. } = &mut self.slot {
            *rsp = Some(response);
        }
        Ok(sent.then_some(ControlEvent::ResponseReady))
    }
}
