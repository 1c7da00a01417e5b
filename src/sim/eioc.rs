use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{Fabric, SimConnection};
use crate::control::wire::*;
use crate::data::*;
use crate::transport::*;

/// Parameters the simulated EIOC answers with.
#[derive(Debug, Clone)]
pub struct EiocConfig {
    pub version: u16,
    pub num_address_entries: u16,
    pub features: Features,
    pub lan_switch: LanSwitch,
    /// Group for inbound multicast, or [`Gid::ZERO`].
    pub mgid: Gid,
    /// EIOC receive buffers, i.e. the host's transmit pool.
    pub recv_pool_entries: u32,
    pub recv_buf_size: u32,
    /// Cap on the host receive pool the EIOC agrees to.
    pub max_host_entries: u32,
    /// Host writes between kicks the EIOC asks for.
    pub entries_before_kick: u32,
}

impl Default for EiocConfig {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            num_address_entries: 16,
            features: Features::PF_KICK
                | Features::IGNORE_VLAN
                | Features::RX_CSUM
                | Features::TX_CSUM
                | Features::INBOUND_IB_MC,
            lan_switch: LanSwitch {
                num: 0,
                num_enet_ports: 1,
                default_vlan: 0,
                hw_mac: [0x00, 0x06, 0x6a, 0x00, 0x00, 0x01],
            },
            mgid: Gid::from([0xff, 0x12, 0x40, 0x1b, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01]),
            recv_pool_entries: 64,
            recv_buf_size: 2048,
            max_host_entries: 1024,
            entries_before_kick: 1,
        }
    }
}

/// The EIOC end of one data path.
struct PoolState {
    path_id: u64,
    host_buf_size: usize,
    /// Our receive buffers, one per entry of the host's transmit table.
    buffers: Region,
    buf_size: usize,
    /// Where the host publishes its receive buffers.
    table: Region,
    /// The host's transmit table, once exchanged.
    host_table: Option<RemoteRegion>,
    next_full: usize,
    next_host: usize,
}

#[derive(Default)]
struct EiocState {
    control: Option<Arc<SimConnection>>,
    data: Option<Arc<SimConnection>>,
    refuse_connect: bool,
    refuse: HashSet<Command>,
    drop: HashSet<Command>,
    reply_first: bool,

    requests: Vec<Request>,
    addresses: BTreeMap<u16, (bool, [u8; 6])>,
    link: Option<ConfigLink>,
    stats: Statistics,
    pools: Option<PoolState>,
    frames: Vec<Vec<u8>>,
    resets: usize,
}

/// A scripted EIOC on a [`super::SimTransport`] fabric.
///
/// It answers every request the way a well-behaved EIOC does, unless told
/// to refuse or ignore a command, captures the frames the host transmits
/// and can inject frames towards the host.
pub struct SimEioc {
    gid: Gid,
    config: EiocConfig,
    fabric: Weak<Fabric>,
    state: Mutex<EiocState>,
}

impl SimEioc {
    pub(crate) fn new(gid: Gid, config: EiocConfig, fabric: Weak<Fabric>) -> Self {
        Self {
            gid,
            config,
            fabric,
            state: Mutex::new(EiocState::default()),
        }
    }

    #[inline]
    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Reject every connection attempt while set.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connect = refuse;
    }

    /// Answer `cmd` with an error packet.
    pub fn refuse(&self, cmd: Command) {
        self.state.lock().refuse.insert(cmd);
    }

    /// Never answer `cmd`.
    pub fn ignore(&self, cmd: Command) {
        self.state.lock().drop.insert(cmd);
    }

    /// Answer every command normally again.
    pub fn behave(&self) {
        let mut state = self.state.lock();
        state.refuse.clear();
        state.drop.clear();
    }

    /// Deliver responses before the host sees its send completion.
    pub fn reply_first(&self, on: bool) {
        self.state.lock().reply_first = on;
    }

    /// Counters returned by `ReportStatistics`.
    pub fn set_statistics(&self, stats: Statistics) {
        self.state.lock().stats = stats;
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().requests.iter().map(Request::command).collect()
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().requests.clone()
    }

    /// The latest `ConfigLink` request.
    pub fn link(&self) -> Option<ConfigLink> {
        self.state.lock().link
    }

    /// The valid entries of the mirrored address table.
    pub fn addresses(&self) -> Vec<(u16, [u8; 6])> {
        self.state
            .lock()
            .addresses
            .iter()
            .filter(|(_, (valid, _))| *valid)
            .map(|(i, (_, mac))| (*i, *mac))
            .collect()
    }

    /// `Reset` requests received so far.
    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    /// Take the frames the host transmitted.
    pub fn take_frames(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().frames)
    }

    /// Whether both connections of the host are up.
    pub fn is_connected(&self) -> bool {
        let state = self.state.lock();
        state.control.is_some() && state.data.is_some()
    }

    pub(crate) fn reply_before_send_completion(&self) -> bool {
        self.state.lock().reply_first
    }

    pub(crate) fn accept(&self, conn: Arc<SimConnection>) -> bool {
        let mut state = self.state.lock();
        if state.refuse_connect {
            return false;
        }
        match conn.kind() {
            ChannelKind::Control => state.control = Some(conn),
            ChannelKind::Data => state.data = Some(conn),
        }
        true
    }

    pub(crate) fn detach(&self, kind: ChannelKind, conn: &SimConnection) {
        let mut state = self.state.lock();
        let slot = match kind {
            ChannelKind::Control => &mut state.control,
            ChannelKind::Data => &mut state.data,
        };
        if !slot.as_ref().is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), conn)) {
            return;
        }
        *slot = None;
        if kind == ChannelKind::Data {
            state.pools = None;
        }
    }

    /// Drop both connections from this end.
    pub fn disconnect_all(&self) {
        let (control, data) = {
            let mut state = self.state.lock();
            state.pools = None;
            (state.control.take(), state.data.take())
        };
        for conn in [control, data].into_iter().flatten() {
            conn.drop_remote();
        }
    }

    /// Push an unsolicited status report to the host.
    pub fn report(&self, report: StatusReport, error: bool) -> bool {
        let control = self.state.lock().control.clone();
        control.is_some_and(|c| c.deliver(encode_status(&report, error), None))
    }

    /// Report the Ethernet link state to the host.
    pub fn report_link(&self, up: bool) -> bool {
        self.report(
            StatusReport {
                lan_switch_num: self.config.lan_switch.num,
                fatal: false,
                status: if up { STATUS_LINK_UP } else { STATUS_LINK_DOWN },
                info: 0,
                text: String::new(),
            },
            false,
        )
    }

    /// Send `frame` to the host through its receive pool. Returns `false`
    /// if the host published no free buffer.
    pub fn inject(&self, frame: &[u8], trailer: Trailer) -> bool {
        let Some(fabric) = self.fabric.upgrade() else {
            return false;
        };
        let data = {
            let mut state = self.state.lock();
            let Some(pools) = state.pools.as_mut() else {
                return false;
            };
            let slot = pools.next_host;
            let bpe = pools.table.read(slot * BPE_SIZE, BPE_SIZE).and_then(|b| Bpe::decode(&b));
            let Some(bpe) = bpe.filter(|b| b.valid) else {
                return false;
            };
            let image = frame_image(frame, Trailer { valid: true, ..trailer });
            let Some(offset) = pools.host_buf_size.checked_sub(image.len()) else {
                return false;
            };
            let remote = RemoteRegion::new(bpe.addr + offset as u64, image.len(), bpe.rkey);
            if fabric.write(&remote, &image).is_err() {
                return false;
            }
            pools
                .table
                .write(slot * BPE_SIZE, &Bpe { valid: false, ..bpe }.encode());
            pools.next_host = (slot + 1) % (pools.table.len() / BPE_SIZE);
            state.data.clone()
        };
        // Kick the host so it polls its pool.
        data.is_some_and(|c| c.deliver(Vec::new(), None))
    }

    /// A message arrived from the host.
    pub(crate) fn receive(&self, kind: ChannelKind, payload: Vec<u8>, _imm: Option<u32>) {
        match kind {
            ChannelKind::Control => self.on_control(&payload),
            ChannelKind::Data => self.on_kick(),
        }
    }

    fn on_control(&self, payload: &[u8]) {
        let (header, req) = match Packet::decode(payload) {
            Ok(Packet::Request(h, req)) => (h, req),
            other => {
                log::warn!("ibvnic: sim eioc {}: ignoring control packet {:?}", self.gid, other);
                return;
            }
        };
        let (control, reply) = {
            let mut state = self.state.lock();
            state.requests.push(req.clone());
            let cmd = req.command();
            let reply = if state.drop.contains(&cmd) {
                None
            } else if state.refuse.contains(&cmd) {
                Some(encode_error_response(&header))
            } else {
                self.answer(&mut state, req)
                    .and_then(|rsp| rsp.encode(header.seq, 0).ok())
            };
            (state.control.clone(), reply)
        };
        if let (Some(control), Some(reply)) = (control, reply) {
            control.deliver(reply, None);
        }
    }

    fn answer(&self, state: &mut EiocState, req: Request) -> Option<Response> {
        let cfg = &self.config;
        Some(match req {
            Request::InitVnic(req) => Response::InitVnic(InitVnicRsp {
                version: cfg.version,
                num_data_paths: 1,
                num_address_entries: cfg.num_address_entries.min(req.num_address_entries),
                features: cfg.features & req.features,
                lan_switch: cfg.lan_switch,
                mgid: cfg.mgid,
            }),
            Request::ConfigDataPath(req) => {
                let fabric = self.fabric.upgrade()?;
                let host_entries = req.host.num_recv_pool_entries.min(cfg.max_host_entries);
                let buffers = fabric.register((cfg.recv_pool_entries * cfg.recv_buf_size) as usize);
                let table = fabric.register(host_entries as usize * BPE_SIZE);
                state.pools = Some(PoolState {
                    path_id: req.path_id,
                    host_buf_size: req.host.size_recv_pool_entry as usize,
                    buffers,
                    buf_size: cfg.recv_buf_size as usize,
                    table,
                    host_table: None,
                    next_full: 0,
                    next_host: 0,
                });
                Response::ConfigDataPath(ConfigDataPath {
                    path_id: req.path_id,
                    host: RecvPoolConfig {
                        num_recv_pool_entries: host_entries,
                        ..req.host
                    },
                    eioc: RecvPoolConfig {
                        size_recv_pool_entry: cfg.recv_buf_size,
                        num_recv_pool_entries: cfg.recv_pool_entries,
                        timeout_before_kick: 50,
                        num_recv_pool_entries_before_kick: cfg.entries_before_kick,
                        num_recv_pool_bytes_before_kick: 0,
                        free_recv_pool_entries_per_update: 0,
                    },
                })
            }
            Request::ExchangePools(req) => {
                let fabric = self.fabric.upgrade()?;
                let pools = state.pools.as_mut()?;
                if pools.path_id != req.path_id {
                    return None;
                }
                let host_table =
                    RemoteRegion::new(req.pool_addr, cfg.recv_pool_entries as usize * BPE_SIZE, req.pool_rkey);
                pools.host_table = Some(host_table);
                for i in 0..cfg.recv_pool_entries as usize {
                    publish(&fabric, pools, i);
                }
                Response::ExchangePools(ExchangePools {
                    path_id: req.path_id,
                    pool_rkey: pools.table.rkey(),
                    pool_addr: pools.table.addr(),
                })
            }
            Request::ConfigLink(req) => {
                state.link = Some(req);
                Response::ConfigLink(req)
            }
            Request::ConfigAddrs(req) => {
                for op in req.ops.iter().filter(|op| op.set) {
                    state.addresses.insert(op.index, (op.valid, op.mac));
                }
                Response::ConfigAddrs(req)
            }
            Request::ReportStatistics { .. } => Response::ReportStatistics(state.stats),
            Request::Reset => {
                state.resets += 1;
                state.pools = None;
                state.addresses.clear();
                Response::Reset
            }
            Request::Heartbeat { interval } => Response::Heartbeat { interval },
        })
    }

    /// The host kicked: collect the frames it wrote and hand the buffers
    /// back.
    fn on_kick(&self) {
        let Some(fabric) = self.fabric.upgrade() else {
            return;
        };
        let mut state = self.state.lock();
        let EiocState { pools, frames, .. } = &mut *state;
        let Some(pools) = pools.as_mut() else {
            return;
        };
        let entries = pools.buffers.len() / pools.buf_size;
        loop {
            let i = pools.next_full;
            let base = i * pools.buf_size;
            let trailer = pools
                .buffers
                .read(base + pools.buf_size - TRAILER_SIZE, TRAILER_SIZE)
                .and_then(|t| Trailer::decode(&t));
            let Some(trailer) = trailer.filter(|t| t.valid) else {
                break;
            };
            let frame = payload_range(pools.buf_size, &trailer)
                .and_then(|range| pools.buffers.read(base + range.start, range.len()));
            if let Some(mut frame) = frame {
                if trailer.pkt_flags.contains(PktFlags::VLAN_INSERT) {
                    insert_vlan(&mut frame, trailer.vlan);
                }
                frames.push(frame);
            }
            pools
                .buffers
                .write(base + pools.buf_size - TRAILER_SIZE + valid_offset(), &[0]);
            publish(&fabric, pools, i);
            pools.next_full = (i + 1) % entries;
        }
    }
}

/// Hand our buffer `i` to the host through its transmit table.
fn publish(fabric: &Fabric, pools: &PoolState, i: usize) {
    let Some(slot) = pools.host_table.and_then(|t| t.slice(i * BPE_SIZE, BPE_SIZE)) else {
        return;
    };
    let bpe = Bpe {
        addr: pools.buffers.addr() + (i * pools.buf_size) as u64,
        rkey: pools.buffers.rkey(),
        valid: true,
    };
    if let Err(e) = fabric.write(&slot, &bpe.encode()) {
        log::warn!("ibvnic: sim eioc: publishing buffer {} failed: {}", i, e);
    }
}
