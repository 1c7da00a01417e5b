//! In-process transport for tests and demos.
//!
//! [`SimTransport`] implements [`Transport`] over plain memory: registered
//! regions are byte buffers addressed by rkey, RDMA writes copy into them and
//! sends are handed to a scripted [`SimEioc`] standing in for the remote
//! end. Connection events are queued and only delivered by
//! [`SimTransport::pump`] (or the background pump thread), never from inside
//! a post.

mod eioc;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

pub use self::eioc::*;
use crate::config::PathConfig;
use crate::data::{frame_image, Trailer};
use crate::transport::*;

/// Receive buffers a simulated connection accepts before `QueueFull`.
const RECV_QUEUE_DEPTH: usize = 4096;

/// First address handed out by the region allocator.
const REGION_BASE: u64 = 0x10_0000;

/// Gap left between regions so stray writes never land in a neighbor.
const REGION_GUARD: u64 = 0x1000;

/// LID multicast groups resolve to unless scripted otherwise.
pub const DEFAULT_MC_LID: u16 = 0xc001;

struct PendingEvent {
    notify: Arc<dyn Notify>,
    kind: ChannelKind,
    event: ChannelEvent,
}

#[derive(Default)]
struct Membership {
    groups: HashMap<u64, Gid>,
    script: VecDeque<Result<u16, McError>>,
    refuse_calls: bool,
}

/// Everything the simulated connections and EIOCs share.
pub(crate) struct Fabric {
    regions: Mutex<Vec<Region>>,
    next_addr: AtomicU64,
    next_key: AtomicU32,
    eiocs: Mutex<HashMap<Gid, Arc<SimEioc>>>,
    events: Mutex<VecDeque<PendingEvent>>,
    membership: Mutex<Membership>,
    next_handle: AtomicU64,
    joins: AtomicUsize,
    leaves: AtomicUsize,
    attached: Mutex<Vec<Weak<SimConnection>>>,
}

impl Fabric {
    fn new() -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
            next_addr: AtomicU64::new(REGION_BASE),
            next_key: AtomicU32::new(1),
            eiocs: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            membership: Mutex::new(Membership::default()),
            next_handle: AtomicU64::new(1),
            joins: AtomicUsize::new(0),
            leaves: AtomicUsize::new(0),
            attached: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, len: usize) -> Region {
        let span = (len as u64).div_ceil(REGION_GUARD) * REGION_GUARD + REGION_GUARD;
        let addr = self.next_addr.fetch_add(span, Ordering::Relaxed);
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let region = Region::new(addr, len, key, key);
        self.regions.lock().push(region.clone());
        region
    }

    /// Carry out an RDMA write.
    pub(crate) fn write(&self, remote: &RemoteRegion, data: &[u8]) -> Result<(), TransportError> {
        let bad = TransportError::BadAddress {
            addr: remote.addr,
            len: data.len(),
        };
        if data.len() > remote.len {
            return Err(bad);
        }
        let regions = self.regions.lock();
        let region = regions
            .iter()
            .find(|r| r.rkey() == remote.rkey && r.contains(remote.addr, data.len()));
        match region {
            Some(region) if region.write_at(remote.addr, data) => Ok(()),
            _ => Err(bad),
        }
    }

    pub(crate) fn queue(&self, notify: &Arc<dyn Notify>, kind: ChannelKind, event: ChannelEvent) {
        self.events.lock().push_back(PendingEvent {
            notify: notify.clone(),
            kind,
            event,
        });
    }

    fn eioc(&self, dgid: &Gid) -> Option<Arc<SimEioc>> {
        self.eiocs.lock().get(dgid).cloned()
    }
}

#[derive(Debug)]
struct ConnState {
    connected: bool,
    recvs: Vec<(u64, usize)>,
    completions: VecDeque<Completion>,
    multicast: Option<(Gid, u16)>,
}

/// One side of a simulated reliable connection, owned by the host.
pub struct SimConnection {
    kind: ChannelKind,
    dgid: Gid,
    fabric: Weak<Fabric>,
    notify: Arc<dyn Notify>,
    this: Weak<SimConnection>,
    state: Mutex<ConnState>,
}

impl SimConnection {
    #[inline]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Whether the host side considers the connection established.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn queue(&self, event: ChannelEvent) {
        if let Some(fabric) = self.fabric.upgrade() {
            fabric.queue(&self.notify, self.kind, event);
        }
    }

    fn complete(&self, wc: Completion) {
        self.state.lock().completions.push_back(wc);
        self.queue(ChannelEvent::CompletionReady);
    }

    /// Hand a message from the peer to the host. It lands in the smallest
    /// posted receive buffer that fits. Returns `false` if none does.
    pub(crate) fn deliver(&self, data: Vec<u8>, imm: Option<u32>) -> bool {
        let wr_id = {
            let mut state = self.state.lock();
            if !state.connected {
                return false;
            }
            let fit = state
                .recvs
                .iter()
                .enumerate()
                .filter(|(_, (_, len))| *len >= data.len())
                .min_by_key(|(_, (_, len))| *len)
                .map(|(i, _)| i);
            match fit {
                Some(i) => state.recvs.remove(i).0,
                None => {
                    log::debug!("ibvnic: sim: {} receiver not ready for {} bytes", self.kind, data.len());
                    return false;
                }
            }
        };
        self.complete(Completion::received(wr_id, data, imm));
        true
    }

    /// Tear the connection down from the peer side.
    pub(crate) fn drop_remote(&self) {
        let was = std::mem::replace(&mut self.state.lock().connected, false);
        if was {
            self.queue(ChannelEvent::Disconnected);
        }
    }

    fn multicast_group(&self) -> Option<(Gid, u16)> {
        self.state.lock().multicast
    }
}

impl Connection for SimConnection {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn connect(&self) -> Result<(), TransportError> {
        let fabric = self.fabric.upgrade().ok_or(TransportError::NotConnected)?;
        let eioc = fabric.eioc(&self.dgid);
        let accepted = match (&eioc, self.this.upgrade()) {
            (Some(eioc), Some(this)) => eioc.accept(this),
            _ => false,
        };
        if accepted {
            self.state.lock().connected = true;
            self.queue(ChannelEvent::Established);
        } else {
            self.queue(ChannelEvent::Rejected);
        }
        Ok(())
    }

    fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            state.connected = false;
            state.recvs.clear();
            state.multicast = None;
        }
        if let Some(eioc) = self.fabric.upgrade().and_then(|f| f.eioc(&self.dgid)) {
            eioc.detach(self.kind, self);
        }
    }

    fn post_recv(&self, wr_id: u64, len: usize) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.recvs.len() >= RECV_QUEUE_DEPTH {
            return Err(TransportError::QueueFull);
        }
        state.recvs.push((wr_id, len));
        Ok(())
    }

    fn post_send(&self, wr: WorkRequest) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let fabric = self.fabric.upgrade().ok_or(TransportError::NotConnected)?;
        let eioc = fabric.eioc(&self.dgid).ok_or(TransportError::NotConnected)?;

        let wr_id = wr.wr_id();
        let signaled = wr.signaled();
        let (opcode, message) = match wr {
            WorkRequest::Send { payload, .. } => (CompletionOpcode::Send, Some((payload, None))),
            WorkRequest::RdmaWrite {
                payload, remote, imm, ..
            } => {
                fabric.write(&remote, &payload)?;
                (CompletionOpcode::RdmaWrite, imm.map(|imm| (Vec::new(), Some(imm))))
            }
        };

        let reply_first = eioc.reply_before_send_completion();
        if signaled && !reply_first {
            self.complete(Completion::success(wr_id, opcode));
        }
        if let Some((payload, imm)) = message {
            eioc.receive(self.kind, payload, imm);
        }
        if signaled && reply_first {
            self.complete(Completion::success(wr_id, opcode));
        }
        Ok(())
    }

    fn poll(&self, max: usize) -> Vec<Completion> {
        let mut state = self.state.lock();
        let n = max.min(state.completions.len());
        state.completions.drain(..n).collect()
    }

    fn attach_multicast(&self, gid: Gid, lid: u16) -> Result<(), TransportError> {
        self.state.lock().multicast = Some((gid, lid));
        if let Some(fabric) = self.fabric.upgrade() {
            fabric.attached.lock().push(self.this.clone());
        }
        Ok(())
    }

    fn detach_multicast(&self, gid: Gid, lid: u16) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.multicast != Some((gid, lid)) {
            return Err(TransportError::Other(format!("not attached to {}", gid)));
        }
        state.multicast = None;
        Ok(())
    }
}

/// A simulated fabric with any number of EIOCs, addressed by port GID.
pub struct SimTransport {
    fabric: Arc<Fabric>,
    stop: Arc<AtomicBool>,
    pump_thread: Option<JoinHandle<()>>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            fabric: Arc::new(Fabric::new()),
            stop: Arc::new(AtomicBool::new(false)),
            pump_thread: None,
        }
    }

    /// Put an EIOC on the fabric at `gid`.
    pub fn add_eioc(&self, gid: Gid, config: EiocConfig) -> Arc<SimEioc> {
        let eioc = Arc::new(SimEioc::new(gid, config, Arc::downgrade(&self.fabric)));
        self.fabric.eiocs.lock().insert(gid, eioc.clone());
        eioc
    }

    /// Remove the EIOC at `gid`; its connections drop.
    pub fn remove_eioc(&self, gid: &Gid) {
        let eioc = self.fabric.eiocs.lock().remove(gid);
        if let Some(eioc) = eioc {
            eioc.disconnect_all();
        }
    }

    /// Deliver every queued event. Returns the number delivered.
    pub fn pump(&self) -> usize {
        pump(&self.fabric)
    }

    /// Deliver events from a background thread until dropped.
    pub fn start_pumping(&mut self) -> std::io::Result<()> {
        if self.pump_thread.is_some() {
            return Ok(());
        }
        let fabric = self.fabric.clone();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name("ibvnic-sim".into())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if pump(&fabric) == 0 {
                        thread::sleep(Duration::from_micros(200));
                    }
                }
            })?;
        self.pump_thread = Some(handle);
        Ok(())
    }

    /// Script the outcome of the next multicast joins, in order. Joins
    /// beyond the script succeed with [`DEFAULT_MC_LID`].
    pub fn script_joins(&self, outcomes: impl IntoIterator<Item = Result<u16, McError>>) {
        self.fabric.membership.lock().script.extend(outcomes);
    }

    /// Make `join_multicast` itself fail.
    pub fn refuse_join_calls(&self, refuse: bool) {
        self.fabric.membership.lock().refuse_calls = refuse;
    }

    /// Join requests seen so far.
    pub fn joins(&self) -> usize {
        self.fabric.joins.load(Ordering::Relaxed)
    }

    /// Memberships released so far.
    pub fn leaves(&self) -> usize {
        self.fabric.leaves.load(Ordering::Relaxed)
    }

    /// Memberships currently held.
    pub fn groups(&self) -> usize {
        self.fabric.membership.lock().groups.len()
    }

    /// Send `frame` to every connection attached to `gid`. Returns the
    /// number of receivers.
    pub fn multicast(&self, gid: Gid, frame: &[u8]) -> usize {
        let trailer = Trailer {
            length: frame.len() as u16,
            valid: true,
            ..Default::default()
        };
        let image = frame_image(frame, trailer);
        let receivers: Vec<Arc<SimConnection>> = {
            let mut attached = self.fabric.attached.lock();
            attached.retain(|c| c.strong_count() > 0);
            attached.iter().filter_map(Weak::upgrade).collect()
        };
        receivers
            .into_iter()
            .filter(|c| c.multicast_group().is_some_and(|(g, _)| g == gid))
            .filter(|c| c.deliver(image.clone(), None))
            .count()
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.pump_thread.take() {
            let _ = handle.join();
        }
    }
}

fn pump(fabric: &Fabric) -> usize {
    let mut delivered = 0;
    loop {
        let next = fabric.events.lock().pop_front();
        let Some(PendingEvent { notify, kind, event }) = next else {
            return delivered;
        };
        notify.notify(kind, event);
        delivered += 1;
    }
}

impl Transport for SimTransport {
    fn open(
        &self,
        kind: ChannelKind,
        path: &PathConfig,
        notify: Arc<dyn Notify>,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let conn = Arc::new_cyclic(|this| SimConnection {
            kind,
            dgid: path.dgid,
            fabric: Arc::downgrade(&self.fabric),
            notify,
            this: this.clone(),
            state: Mutex::new(ConnState {
                connected: false,
                recvs: Vec::new(),
                completions: VecDeque::new(),
                multicast: None,
            }),
        });
        Ok(conn)
    }

    fn register(&self, len: usize) -> Result<Region, TransportError> {
        if len == 0 {
            return Err(TransportError::NoResources("empty region".into()));
        }
        Ok(self.fabric.register(len))
    }

    fn join_multicast(&self, gid: Gid, notify: Arc<dyn Notify>) -> Result<McHandle, TransportError> {
        let outcome = {
            let mut membership = self.fabric.membership.lock();
            if membership.refuse_calls {
                return Err(TransportError::NoResources("join refused".into()));
            }
            membership.script.pop_front().unwrap_or(Ok(DEFAULT_MC_LID))
        };
        self.fabric.joins.fetch_add(1, Ordering::Relaxed);
        let handle = McHandle(self.fabric.next_handle.fetch_add(1, Ordering::Relaxed));
        let event = match outcome {
            Ok(lid) => {
                self.fabric.membership.lock().groups.insert(handle.0, gid);
                ChannelEvent::MulticastJoined { lid }
            }
            Err(error) => ChannelEvent::MulticastFailed { error },
        };
        self.fabric.queue(&notify, ChannelKind::Data, event);
        Ok(handle)
    }

    fn leave_multicast(&self, handle: McHandle) {
        self.fabric.leaves.fetch_add(1, Ordering::Relaxed);
        self.fabric.membership.lock().groups.remove(&handle.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Events(Mutex<Vec<(ChannelKind, String)>>);

    impl Notify for Events {
        fn notify(&self, kind: ChannelKind, event: ChannelEvent) {
            self.0.lock().push((kind, format!("{:?}", event)));
        }
    }

    #[test]
    fn test_writes_are_bounds_checked() {
        let sim = SimTransport::new();
        let a = sim.register(64).unwrap();
        let b = sim.register(64).unwrap();
        assert!(a.addr() + 64 < b.addr());

        sim.fabric.write(&a.remote(8..16), &[7; 8]).unwrap();
        assert_eq!(a.read(8, 8).unwrap(), vec![7; 8]);

        let wrong_key = RemoteRegion::new(a.addr(), 8, b.rkey());
        assert!(matches!(
            sim.fabric.write(&wrong_key, &[0; 8]),
            Err(TransportError::BadAddress { .. })
        ));
        assert!(sim.fabric.write(&a.remote(60..64), &[0; 8]).is_err());
    }

    #[test]
    fn test_events_wait_for_pump() {
        let sim = SimTransport::new();
        let events = Arc::new(Events::default());
        let path = PathConfig::default();
        let conn = sim.open(ChannelKind::Control, &path, events.clone()).unwrap();

        // Nobody listens at the default GID.
        conn.connect().unwrap();
        assert!(events.0.lock().is_empty());
        assert_eq!(sim.pump(), 1);
        assert_eq!(events.0.lock()[0], (ChannelKind::Control, "Rejected".to_string()));
        assert!(matches!(
            conn.post_send(WorkRequest::Send {
                wr_id: 1,
                payload: vec![],
                signaled: true
            }),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_join_script() {
        let sim = SimTransport::new();
        let events = Arc::new(Events::default());
        let gid = Gid::from([0xff; 16]);
        sim.script_joins([Err(McError::Busy)]);

        sim.join_multicast(gid, events.clone()).unwrap();
        let h = sim.join_multicast(gid, events.clone()).unwrap();
        sim.pump();
        let seen = events.0.lock().clone();
        assert!(seen[0].1.contains("Busy"));
        assert!(seen[1].1.contains("MulticastJoined"));
        assert_eq!(sim.groups(), 1);

        sim.leave_multicast(h);
        assert_eq!((sim.joins(), sim.leaves(), sim.groups()), (2, 1, 0));

        sim.refuse_join_calls(true);
        assert!(sim.join_multicast(gid, events).is_err());
    }
}
