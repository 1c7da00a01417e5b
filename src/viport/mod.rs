//! One network path to an EIOC.
//!
//! A [`Viport`] owns the control and data channels of a path and drives them
//! through the link-state machine of [`transition()`]. Every state change
//! happens in [`Viport::run`], which the driver's viport worker calls when
//! the viport was scheduled or one of its deadlines passed, so transitions of
//! one viport are strictly sequential.
//!
//! Other threads only touch three things, each behind its own lock: the
//! desired configuration (addresses, flags, MTU and pending updates), the
//! inbox of transport events, and the data channel. Lock order is core
//! first; the other three are never held together.

mod address;
mod backoff;
mod state;
mod transition;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use quanta::{Clock, Instant};

pub use self::address::*;
pub use self::backoff::Backoff;
pub use self::state::*;
pub use self::transition::{transition, Effect, Event, Transition, View};
use crate::config::{DriverConfig, PathConfig};
use crate::control::wire::*;
use crate::control::{ControlChannel, ControlEvent, RequestState};
use crate::data::*;
use crate::multicast::{McAction, McInfo, McSnapshot};
use crate::transport::*;
use crate::vnic::{PathRole, VnicHandle};

/// Identity of a viport: the VNIC it belongs to and which path it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ViportId {
    pub vnic: VnicHandle,
    pub role: PathRole,
}

impl ViportId {
    /// Data path identifier sent in `ConfigDataPath`.
    #[inline]
    fn path_id(&self) -> u64 {
        ((self.vnic.0 as u64) << 8) | self.role as u64
    }
}

impl fmt::Display for ViportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vnic, self.role)
    }
}

/// Callbacks from a viport into whatever drives it.
///
/// Called with viport locks held except for [`ViportHooks::receive`] and
/// [`ViportHooks::wake`]; implementations must only queue work.
pub trait ViportHooks: Send + Sync {
    /// Run the viport's state machine soon.
    fn schedule(&self, id: ViportId);
    /// Data completions are left over from a capped burst.
    fn defer_drain(&self, id: ViportId);
    /// The path gained or lost carrier.
    fn carrier(&self, id: ViportId, up: bool);
    /// Frames arrived on the path.
    fn receive(&self, id: ViportId, frames: Vec<RxFrame>);
    /// The path can transmit again after running out of buffers.
    fn wake(&self, id: ViportId);
}

/// Transport events waiting for the worker.
#[derive(Debug)]
enum Inbound {
    Connected(ChannelKind),
    McJoined(u16),
    McFailed(McError),
    MtuChanged(u16),
    Reconnect,
}

/// What the upstream interface wants the path to look like.
#[derive(Debug)]
struct Desired {
    /// Unicast MAC; all zero means the EIOC's hardware address.
    mac: [u8; 6],
    multicast: Vec<[u8; 6]>,
    promisc: bool,
    allmulti: bool,
    mtu: u16,
    /// This path carries the VNIC's traffic.
    active: bool,
    table: Option<AddressTable>,
    updates: UpdateFlags,
}

#[derive(Debug, Default)]
struct StatsSlot {
    generation: u64,
    latest: Option<Statistics>,
}

/// State owned by the worker.
struct Core {
    state: LinkState,
    control: Option<ControlChannel>,
    control_up: bool,
    data_conn: Option<Arc<dyn Connection>>,
    dp_req: Option<ConfigDataPath>,
    params: Option<DataParams>,

    features: Features,
    lan_switch: LanSwitch,
    mgid: Gid,
    eioc_mtu: u16,
    addrs_in_flight: Vec<AddressOp>,

    connected: bool,
    link_up: bool,
    backoff: Backoff,
    abandoned: bool,
    mc: McInfo,

    heartbeat_at: Option<Instant>,
    retry_at: Option<Instant>,
}

/// Diagnostic view of a viport.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ViportSnapshot {
    pub id: ViportId,
    pub state: LinkState,
    pub phase: Phase,
    pub connected: bool,
    pub carrier: bool,
    pub active: bool,
    pub errored: bool,
    pub abandoned: bool,
    pub retry_attempts: u32,
    pub features: u32,
    pub mtu: u16,
    pub eioc_mtu: u16,
    pub updates: UpdateFlags,
    pub address_entries: usize,
    pub multicast_overflow: bool,
    pub multicast: McSnapshot,
    pub params: Option<DataParams>,
    pub xmit_pool: Option<Accounting>,
    pub recv_pool: Option<Accounting>,
}

/// One path of a VNIC.
pub struct Viport {
    id: ViportId,
    name: String,
    this: Weak<Viport>,
    path: PathConfig,
    config: Arc<DriverConfig>,
    transport: Arc<dyn Transport>,
    hooks: Arc<dyn ViportHooks>,
    clock: Clock,

    core: Mutex<Core>,
    desired: Mutex<Desired>,
    data: Mutex<Option<DataChannel>>,
    inbox: Mutex<VecDeque<Inbound>>,

    /// Bumped whenever connections are torn down; events carrying an older
    /// value belong to connections that no longer exist.
    epoch: AtomicU64,
    errored: AtomicBool,
    disconnect: AtomicBool,
    carrier: AtomicBool,
    connected: AtomicBool,

    released: Mutex<bool>,
    released_cv: Condvar,
    stats: Mutex<StatsSlot>,
    stats_cv: Condvar,
}

/// Event sink handed to the transport for one connection generation.
struct ChannelNotifier {
    viport: Weak<Viport>,
    epoch: u64,
}

impl Notify for ChannelNotifier {
    fn notify(&self, kind: ChannelKind, event: ChannelEvent) {
        if let Some(viport) = self.viport.upgrade() {
            viport.on_channel_event(self.epoch, kind, event);
        }
    }
}

fn join_error(err: TransportError) -> McError {
    match err {
        TransportError::QueueFull | TransportError::NoResources(_) => McError::Busy,
        other => McError::Refused(other.to_string()),
    }
}

impl Viport {
    /// Create a viport. It stays `Uninitialized` until first scheduled.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ViportId,
        name: impl Into<String>,
        path: PathConfig,
        mtu: u16,
        config: Arc<DriverConfig>,
        transport: Arc<dyn Transport>,
        hooks: Arc<dyn ViportHooks>,
        clock: Clock,
    ) -> Arc<Self> {
        let core = Core {
            state: LinkState::Uninitialized,
            control: None,
            control_up: false,
            data_conn: None,
            dp_req: None,
            params: None,
            features: Features::EMPTY,
            lan_switch: LanSwitch::default(),
            mgid: Gid::ZERO,
            eioc_mtu: 0,
            addrs_in_flight: Vec::new(),
            connected: false,
            link_up: false,
            backoff: Backoff::new(&config.viport),
            abandoned: false,
            mc: McInfo::new(&config.multicast),
            heartbeat_at: None,
            retry_at: None,
        };
        let desired = Desired {
            mac: [0; 6],
            multicast: Vec::new(),
            promisc: false,
            allmulti: false,
            mtu,
            active: false,
            table: None,
            updates: UpdateFlags::EMPTY,
        };
        Arc::new_cyclic(|this| Self {
            id,
            name: name.into(),
            this: this.clone(),
            path,
            config,
            transport,
            hooks,
            clock,
            core: Mutex::new(core),
            desired: Mutex::new(desired),
            data: Mutex::new(None),
            inbox: Mutex::new(VecDeque::new()),
            epoch: AtomicU64::new(0),
            errored: AtomicBool::new(false),
            disconnect: AtomicBool::new(false),
            carrier: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            released: Mutex::new(false),
            released_cv: Condvar::new(),
            stats: Mutex::new(StatsSlot::default()),
            stats_cv: Condvar::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> ViportId {
        self.id
    }

    /// Get the log name, `<vnic name>/<role>`.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn path(&self) -> &PathConfig {
        &self.path
    }

    /// Get the current link state.
    pub fn state(&self) -> LinkState {
        self.core.lock().state
    }

    /// Whether the path has carrier.
    #[inline]
    pub fn carrier(&self) -> bool {
        self.carrier.load(Ordering::Acquire)
    }

    /// Whether the data path is established, regardless of EIOC link state.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn notifier(&self) -> Arc<dyn Notify> {
        Arc::new(ChannelNotifier {
            viport: self.this.clone(),
            epoch: self.epoch.load(Ordering::Acquire),
        })
    }

    /// Record a failure and make sure the worker sees it.
    fn fail(&self, what: fmt::Arguments<'_>) {
        log::warn!("ibvnic: {}: {}", self.name, what);
        self.errored.store(true, Ordering::Release);
        self.hooks.schedule(self.id);
    }

    fn push_inbound(&self, item: Inbound) {
        self.inbox.lock().push_back(item);
        self.hooks.schedule(self.id);
    }

    fn on_channel_event(&self, epoch: u64, kind: ChannelKind, event: ChannelEvent) {
        if epoch != self.epoch.load(Ordering::Acquire) {
            log::trace!("ibvnic: {}: stale {} event {:?}", self.name, kind, event);
            return;
        }
        match event {
            ChannelEvent::CompletionReady => match kind {
                ChannelKind::Control => self.hooks.schedule(self.id),
                ChannelKind::Data => {
                    if self.poll_data(self.config.completion_burst_limit) {
                        self.hooks.defer_drain(self.id);
                    }
                }
            },
            ChannelEvent::Established => {
                log::debug!("ibvnic: {}: {} connection established", self.name, kind);
                self.push_inbound(Inbound::Connected(kind));
            }
            ChannelEvent::Rejected => self.fail(format_args!("{} connection rejected", kind)),
            ChannelEvent::Disconnected => self.fail(format_args!("{} connection lost", kind)),
            ChannelEvent::MulticastJoined { lid } => self.push_inbound(Inbound::McJoined(lid)),
            ChannelEvent::MulticastFailed { error } => self.push_inbound(Inbound::McFailed(error)),
        }
    }

    fn deliver(&self, out: DataOutput) {
        if !out.frames.is_empty() {
            self.hooks.receive(self.id, out.frames);
        }
        if out.wake {
            self.hooks.wake(self.id);
        }
    }

    /// Process at most `max` data completions. Returns `true` if more may be
    /// pending.
    fn poll_data(&self, max: usize) -> bool {
        let now = self.clock.now();
        let (polled, armed) = match self.data.lock().as_mut() {
            Some(data) => {
                let idle = data.next_deadline().is_none();
                let polled = data.poll_completions(max, now);
                (polled, idle && data.next_deadline().is_some())
            }
            None => return false,
        };
        if armed {
            self.hooks.schedule(self.id);
        }
        match polled {
            Ok((out, more)) => {
                self.deliver(out);
                more
            }
            Err(e) => {
                self.fail(format_args!("data path failed: {}", e));
                false
            }
        }
    }

    /// Drain every pending data completion.
    pub fn drain_data(&self) {
        while self.poll_data(self.config.completion_burst_limit) {}
    }

    /// Transmit one Ethernet frame on this path.
    pub fn transmit(&self, frame: &[u8], csum: TxCsumFlags) -> Result<(), XmitError> {
        let now = self.clock.now();
        let (result, armed) = match self.data.lock().as_mut() {
            Some(data) => {
                let idle = data.next_deadline().is_none();
                let result = data.transmit(frame, csum, now);
                (result, idle && data.next_deadline().is_some())
            }
            None => (Err(XmitError::NotRunning), false),
        };
        // A kick timer started; the worker has to see its deadline.
        if armed {
            self.hooks.schedule(self.id);
        }
        if let Err(XmitError::Transport(e)) = &result {
            self.fail(format_args!("transmit failed: {}", e));
        }
        result
    }

    /// Tell the EIOC whether this path carries the VNIC's traffic.
    pub fn set_active(&self, active: bool) {
        {
            let mut desired = self.desired.lock();
            if desired.active == active {
                return;
            }
            desired.active = active;
            desired.updates |= UpdateFlags::LINK_CONFIG;
        }
        self.hooks.schedule(self.id);
    }

    /// Replace the address filter. `unicast` of `None` keeps the current
    /// unicast address.
    pub fn set_addresses(&self, unicast: Option<[u8; 6]>, multicast: &[[u8; 6]]) {
        {
            let mut desired = self.desired.lock();
            let d = &mut *desired;
            if let Some(mac) = unicast {
                d.mac = mac;
            }
            d.multicast = multicast.to_vec();
            if let Some(table) = d.table.as_mut() {
                if let Some(mac) = unicast {
                    table.set_unicast(mac);
                }
                if table.set_multicast(multicast) {
                    d.updates |= UpdateFlags::LINK_CONFIG;
                }
                if table.has_dirty() {
                    d.updates |= UpdateFlags::ADDRESS_CONFIG;
                }
            }
        }
        self.hooks.schedule(self.id);
    }

    /// Set the promiscuous and all-multicast modes.
    pub fn set_flags(&self, promisc: bool, allmulti: bool) {
        {
            let mut desired = self.desired.lock();
            if desired.promisc == promisc && desired.allmulti == allmulti {
                return;
            }
            desired.promisc = promisc;
            desired.allmulti = allmulti;
            desired.updates |= UpdateFlags::LINK_CONFIG;
        }
        self.hooks.schedule(self.id);
    }

    /// Change the MTU. Multicast membership follows the new MTU without a
    /// reconnect.
    pub fn set_mtu(&self, mtu: u16) {
        {
            let mut desired = self.desired.lock();
            if desired.mtu == mtu {
                return;
            }
            desired.mtu = mtu;
            desired.updates |= UpdateFlags::LINK_CONFIG;
        }
        self.push_inbound(Inbound::MtuChanged(mtu));
    }

    /// Largest MTU the negotiated buffers carry, once negotiated.
    pub fn max_mtu(&self) -> Option<u32> {
        self.data.lock().as_ref().map(|data| data.params().max_mtu())
    }

    /// Ask the EIOC for its counters and wait for the answer.
    pub fn request_statistics(&self, timeout: Duration) -> Option<Statistics> {
        if !self.is_connected() {
            return None;
        }
        let generation = self.stats.lock().generation;
        self.desired.lock().updates |= UpdateFlags::STATS;
        self.hooks.schedule(self.id);

        let deadline = std::time::Instant::now() + timeout;
        let mut stats = self.stats.lock();
        while stats.generation == generation {
            if self.stats_cv.wait_until(&mut stats, deadline).timed_out() {
                return None;
            }
        }
        stats.latest
    }

    /// Reconnect a path that gave up retrying.
    pub fn reconnect(&self) {
        self.push_inbound(Inbound::Reconnect);
    }

    /// Start tearing the viport down. Wait with [`Viport::wait_released`].
    pub fn disconnect(&self) {
        log::debug!("ibvnic: {}: disconnect requested", self.name);
        self.disconnect.store(true, Ordering::Release);
        self.errored.store(true, Ordering::Release);
        self.hooks.schedule(self.id);
    }

    /// Wait until the state machine released every resource. Returns
    /// `false` on timeout.
    pub fn wait_released(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut released = self.released.lock();
        while !*released {
            if self.released_cv.wait_until(&mut released, deadline).timed_out() {
                return *released;
            }
        }
        true
    }

    /// Whether teardown finished.
    pub fn is_released(&self) -> bool {
        *self.released.lock()
    }

    /// Earliest instant at which [`Viport::run`] has timer work.
    pub fn next_deadline(&self) -> Option<Instant> {
        let core = self.core.lock();
        let data = self.data.lock().as_ref().and_then(DataChannel::next_deadline);
        [
            core.control.as_ref().and_then(ControlChannel::deadline),
            core.heartbeat_at,
            core.retry_at,
            core.mc.retry_deadline(),
            data,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn snapshot(&self) -> ViportSnapshot {
        let core = self.core.lock();
        let (mtu, active, updates, address_entries, multicast_overflow) = {
            let d = self.desired.lock();
            (
                d.mtu,
                d.active,
                d.updates,
                d.table.as_ref().map_or(0, AddressTable::len),
                d.table.as_ref().is_some_and(AddressTable::overflow),
            )
        };
        let pools = self.data.lock().as_ref().map(DataChannel::accounting);
        ViportSnapshot {
            id: self.id,
            state: core.state,
            phase: core.state.phase(),
            connected: core.connected,
            carrier: self.carrier(),
            active,
            errored: self.errored.load(Ordering::Acquire),
            abandoned: core.abandoned,
            retry_attempts: core.backoff.attempts(),
            features: core.features.bits(),
            mtu,
            eioc_mtu: core.eioc_mtu,
            updates,
            address_entries,
            multicast_overflow,
            multicast: core.mc.snapshot(),
            params: core.params,
            xmit_pool: pools.map(|(xmit, _)| xmit),
            recv_pool: pools.map(|(_, recv)| recv),
        }
    }

    /// Run the state machine until it needs new input.
    pub fn run(&self) {
        let now = self.clock.now();
        let mut core = self.core.lock();
        let mut events = VecDeque::new();

        self.poll_control(&mut core, now, &mut events);
        self.poll_timers(&mut core, now, &mut events);
        self.poll_inbox(&mut core, now, &mut events);
        events.push_back(Event::Step);

        while let Some(event) = events.pop_front() {
            self.dispatch(&mut core, event, now);
        }
    }

    fn view(&self, core: &Core) -> View {
        View {
            errored: self.errored.load(Ordering::Acquire),
            disconnect: self.disconnect.load(Ordering::Acquire),
            updates: self.desired.lock().updates,
            retry_delay: core.backoff.peek(),
            control_usable: core.control_up
                && core
                    .control
                    .as_ref()
                    .is_some_and(|c| c.state() != RequestState::Failed),
        }
    }

    /// Feed one event, then step until the state settles.
    fn dispatch(&self, core: &mut Core, mut event: Event, now: Instant) {
        loop {
            let view = self.view(core);
            let prev = core.state;
            let Transition { next, effects } = transition(prev, &event, &view);
            if next != prev {
                log::trace!("ibvnic: {}: {} -> {}", self.name, prev, next);
            }
            core.state = next;
            for effect in effects {
                self.apply(core, effect, now);
            }
            if next == prev {
                return;
            }
            event = Event::Step;
        }
    }

    fn poll_control(&self, core: &mut Core, now: Instant, events: &mut VecDeque<Event>) {
        let Some(control) = core.control.as_mut() else {
            return;
        };
        let mut link = None;
        loop {
            let wcs = control.connection().poll(self.config.control.recv_depth.max(1) * 2);
            if wcs.is_empty() {
                break;
            }
            for wc in wcs {
                match control.handle_completion(wc) {
                    Ok(Some(ControlEvent::ResponseReady)) => {
                        events.extend(control.poll_response().map(Event::Response));
                    }
                    Ok(Some(ControlEvent::LinkStatus { up })) => link = Some(up),
                    Ok(Some(ControlEvent::ErrorReport { fatal: true })) => {
                        self.errored.store(true, Ordering::Release);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("ibvnic: {}: control channel failed: {}", self.name, e);
                        self.errored.store(true, Ordering::Release);
                    }
                }
            }
        }
        for report in control.drain_errors() {
            log::warn!(
                "ibvnic: {}: EIOC {} error {:#x}/{:#x}: {}",
                self.name,
                if report.fatal { "fatal" } else { "non-fatal" },
                report.status,
                report.info,
                report.text
            );
        }
        if let Err(e) = control.check_timeout(now) {
            log::error!("ibvnic: {}: {}", self.name, e);
            self.errored.store(true, Ordering::Release);
        }

        if let Some(up) = link {
            log::info!("ibvnic: {}: EIOC reports link {}", self.name, if up { "up" } else { "down" });
            core.link_up = up;
            self.update_carrier(core);
        }
    }

    fn poll_timers(&self, core: &mut Core, now: Instant, events: &mut VecDeque<Event>) {
        if core.heartbeat_at.is_some_and(|at| now >= at) {
            core.heartbeat_at = None;
            self.desired.lock().updates |= UpdateFlags::HEARTBEAT;
        }
        if core.retry_at.is_some_and(|at| now >= at) {
            core.retry_at = None;
            events.push_back(Event::RetryExpired);
        }
        if let Some(action) = core.mc.poll(now) {
            self.apply_mc(core, vec![action], now);
        }

        let kicked = self.data.lock().as_mut().map(|data| data.poll_timers(now));
        if let Some(Err(e)) = kicked {
            self.fail(format_args!("kick failed: {}", e));
        }
    }

    fn poll_inbox(&self, core: &mut Core, now: Instant, events: &mut VecDeque<Event>) {
        let inbound: Vec<Inbound> = self.inbox.lock().drain(..).collect();
        for item in inbound {
            match item {
                Inbound::Connected(kind) => {
                    if kind == ChannelKind::Control {
                        core.control_up = true;
                    }
                    events.push_back(Event::Connected(kind));
                }
                Inbound::McJoined(lid) => {
                    let actions = core.mc.on_joined(lid).into_iter().collect();
                    self.apply_mc(core, actions, now);
                }
                Inbound::McFailed(error) => {
                    log::debug!("ibvnic: {}: multicast join failed: {}", self.name, error);
                    let actions = core.mc.on_join_failed(&error, now);
                    self.apply_mc(core, actions, now);
                }
                Inbound::MtuChanged(mtu) => {
                    if core.state.is_up() && self.multicast_enabled(core) {
                        let actions = core.mc.mtu_changed(mtu as u32);
                        self.apply_mc(core, actions, now);
                        core.mc.on_left();
                    }
                }
                Inbound::Reconnect => events.push_back(Event::Reconnect),
            }
        }
    }

    fn multicast_enabled(&self, core: &Core) -> bool {
        self.config.viport.inbound_multicast && core.features.contains(Features::INBOUND_IB_MC)
    }

    fn update_carrier(&self, core: &Core) {
        let up = core.connected && core.link_up;
        if self.carrier.swap(up, Ordering::AcqRel) != up {
            log::info!("ibvnic: {}: carrier {}", self.name, if up { "on" } else { "off" });
            self.hooks.carrier(self.id, up);
        }
    }

    fn apply_mc(&self, core: &mut Core, actions: Vec<McAction>, now: Instant) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                McAction::Join(gid) => match self.transport.join_multicast(gid, self.notifier()) {
                    Ok(handle) => queue.extend(core.mc.join_started(handle)),
                    Err(e) => queue.extend(core.mc.on_join_failed(&join_error(e), now)),
                },
                McAction::Attach { gid, lid } => {
                    let attached = match self.data.lock().as_mut() {
                        Some(data) => data.attach_multicast(gid, lid),
                        None => Err(DataError::Inconsistent("no data path to attach")),
                    };
                    if let Err(e) = &attached {
                        log::debug!("ibvnic: {}: multicast attach failed: {}", self.name, e);
                    }
                    queue.extend(core.mc.on_attached(attached.is_ok(), now));
                }
                McAction::Detach { .. } => {
                    let detached = self.data.lock().as_mut().map(DataChannel::detach_multicast);
                    if let Some(Err(e)) = detached {
                        log::warn!("ibvnic: {}: multicast detach failed: {}", self.name, e);
                    }
                }
                McAction::Release(handle) => self.transport.leave_multicast(handle),
            }
        }
    }

    fn send(&self, core: &mut Core, req: Request, now: Instant) {
        let Some(control) = core.control.as_mut() else {
            return self.fail(format_args!("no control channel for {:?}", req.command()));
        };
        if let Err(e) = control.send_request(&req, now) {
            self.fail(format_args!("{:?} request failed: {}", req.command(), e));
        }
    }

    fn config_link(&self, core: &Core) -> ConfigLink {
        let d = self.desired.lock();
        let allmulti = d.allmulti || d.table.as_ref().is_some_and(AddressTable::overflow);
        let mut flags = LinkFlags::SET_MTU;
        flags |= if d.active {
            LinkFlags::ENABLE_NIC
        } else {
            LinkFlags::DISABLE_NIC
        };
        flags |= if d.promisc {
            LinkFlags::ENABLE_PROMISC
        } else {
            LinkFlags::DISABLE_PROMISC
        };
        flags |= if allmulti {
            LinkFlags::ENABLE_MCAST_ALL
        } else {
            LinkFlags::DISABLE_MCAST_ALL
        };
        ConfigLink {
            flags,
            lan_switch_num: core.lan_switch.num,
            mtu: d.mtu,
            default_vlan: core.lan_switch.default_vlan,
            hw_mac: d
                .table
                .as_ref()
                .map_or(core.lan_switch.hw_mac, AddressTable::unicast),
        }
    }

    fn apply(&self, core: &mut Core, effect: Effect, now: Instant) {
        match effect {
            Effect::AllocControl => {
                match self.transport.open(ChannelKind::Control, &self.path, self.notifier()) {
                    Ok(conn) => {
                        let control = ControlChannel::new(conn, &self.config.control);
                        if let Err(e) = control.post_receives() {
                            self.fail(format_args!("posting control receives failed: {}", e));
                        }
                        core.control = Some(control);
                    }
                    Err(e) => self.fail(format_args!("opening control connection failed: {}", e)),
                }
            }
            Effect::AllocData => match self.transport.open(ChannelKind::Data, &self.path, self.notifier()) {
                Ok(conn) => core.data_conn = Some(conn),
                Err(e) => self.fail(format_args!("opening data connection failed: {}", e)),
            },
            Effect::ConnectControl => {
                let connected = core.control.as_ref().map(|c| c.connection().connect());
                match connected {
                    Some(Ok(())) => {}
                    Some(Err(e)) => self.fail(format_args!("control connect failed: {}", e)),
                    None => self.fail(format_args!("no control connection to connect")),
                }
            }
            Effect::ConnectData => match core.data_conn.as_ref().map(|c| c.connect()) {
                Some(Ok(())) => {}
                Some(Err(e)) => self.fail(format_args!("data connect failed: {}", e)),
                None => self.fail(format_args!("no data connection to connect")),
            },

            Effect::SendInitVnic => {
                let req = InitVnicReq {
                    version: PROTOCOL_VERSION,
                    instance: self.path.instance,
                    num_data_paths: 1,
                    num_address_entries: self.config.viport.address_entries,
                    features: self.config.viport.requested_features(),
                };
                self.send(core, Request::InitVnic(req), now);
            }
            Effect::SendConfigDataPath => {
                let req = DataParams::request(&self.config.data, self.id.path_id());
                core.dp_req = Some(req);
                self.send(core, Request::ConfigDataPath(req), now);
            }
            Effect::SendExchangePools => {
                let table = self.data.lock().as_ref().map(DataChannel::xmit_table);
                match (table, core.params) {
                    (Some(table), Some(params)) => {
                        let req = ExchangePools {
                            path_id: params.path_id,
                            pool_rkey: table.rkey,
                            pool_addr: table.addr,
                        };
                        self.send(core, Request::ExchangePools(req), now);
                    }
                    _ => self.fail(format_args!("no data path to exchange pools for")),
                }
            }
            Effect::SendConfigLink => {
                let req = self.config_link(core);
                self.send(core, Request::ConfigLink(req), now);
            }
            Effect::SendConfigAddrs => {
                let with_gid = self.multicast_enabled(core);
                let ops = self
                    .desired
                    .lock()
                    .table
                    .as_ref()
                    .map(|t| t.dirty_ops(ConfigAddrs::capacity(with_gid)))
                    .unwrap_or_default();
                core.addrs_in_flight = ops.clone();
                let req = ConfigAddrs {
                    lan_switch_num: core.lan_switch.num,
                    with_gid,
                    ops,
                };
                self.send(core, Request::ConfigAddrs(req), now);
            }
            Effect::SendReportStats => {
                let lan_switch_num = core.lan_switch.num;
                self.send(core, Request::ReportStatistics { lan_switch_num }, now);
            }
            Effect::SendHeartbeat => {
                let interval = self.config.viport.heartbeat_interval_ms.min(u32::MAX as u64) as u32;
                self.send(core, Request::Heartbeat { interval }, now);
            }
            Effect::SendReset => {
                if let Some(control) = core.control.as_mut() {
                    control.reset();
                }
                self.send(core, Request::Reset, now);
            }
            Effect::Absorb(rsp) => self.absorb(core, rsp, now),

            Effect::MarkConnected => {
                log::info!("ibvnic: {}: connected", self.name);
                core.connected = true;
                core.link_up = true;
                self.connected.store(true, Ordering::Release);
                self.update_carrier(core);
            }
            Effect::MarkDisconnected => {
                if core.connected {
                    log::info!("ibvnic: {}: disconnected", self.name);
                }
                core.connected = false;
                self.connected.store(false, Ordering::Release);
                self.update_carrier(core);
                if let Some(data) = self.data.lock().as_mut() {
                    data.stop();
                }
            }
            Effect::StartMulticast => {
                if self.multicast_enabled(core) {
                    let mtu = self.desired.lock().mtu as u32;
                    let actions = core.mc.start(core.mgid, mtu).into_iter().collect();
                    self.apply_mc(core, actions, now);
                }
            }
            Effect::StopMulticast => {
                let actions = core.mc.leave();
                self.apply_mc(core, actions, now);
                core.mc.on_left();
            }
            Effect::StartHeartbeatTimer => {
                let interval = self.config.viport.heartbeat_interval();
                core.heartbeat_at = (!interval.is_zero()).then(|| now + interval);
            }
            Effect::StartRetryTimer(delay) => {
                core.backoff.next_delay();
                core.retry_at = Some(now + delay);
                log::warn!(
                    "ibvnic: {}: reconnecting in {:?} (attempt {})",
                    self.name,
                    delay,
                    core.backoff.attempts()
                );
            }
            Effect::ResetBackoff => {
                core.backoff.reset();
                core.abandoned = false;
            }

            Effect::DisconnectData => {
                if let Some(data) = self.data.lock().as_mut() {
                    data.stop();
                    if let Err(e) = data.detach_multicast() {
                        log::debug!("ibvnic: {}: multicast detach failed: {}", self.name, e);
                    }
                }
                if let Some(conn) = &core.data_conn {
                    conn.disconnect();
                }
            }
            Effect::DisconnectControl => {
                if let Some(control) = &core.control {
                    control.connection().disconnect();
                }
                core.control_up = false;
            }
            Effect::CleanupData => {
                let actions = core.mc.leave();
                self.apply_mc(core, actions, now);
                core.mc.clear();
                *self.data.lock() = None;
                core.data_conn = None;
                core.dp_req = None;
                core.params = None;
            }
            Effect::CleanupControl => {
                // Events of the old connections must not leak into the next
                // attempt.
                self.epoch.fetch_add(1, Ordering::AcqRel);
                core.control = None;
                core.control_up = false;
                core.heartbeat_at = None;
                core.features = Features::EMPTY;
                core.mgid = Gid::ZERO;
                core.addrs_in_flight.clear();
            }
            Effect::FreeAddressTable => {
                let mut d = self.desired.lock();
                d.table = None;
                d.updates = UpdateFlags::EMPTY;
            }

            Effect::ClearErrored => self.errored.store(false, Ordering::Release),
            Effect::SetUpdate(flags) => self.desired.lock().updates |= flags,
            Effect::ClearUpdate(flags) => self.desired.lock().updates -= flags,
            Effect::Abandon => {
                core.abandoned = true;
                core.retry_at = None;
                log::warn!(
                    "ibvnic: {}: giving up after {} reconnect attempts",
                    self.name,
                    core.backoff.attempts()
                );
            }
            Effect::SignalReleased => {
                log::debug!("ibvnic: {}: released", self.name);
                *self.released.lock() = true;
                self.released_cv.notify_all();
            }
            Effect::ProtocolError { state, cmd } => {
                log::error!("ibvnic: {}: unexpected {:?} response in {}", self.name, cmd, state);
                self.errored.store(true, Ordering::Release);
            }
        }
    }

    fn absorb(&self, core: &mut Core, rsp: Response, now: Instant) {
        match rsp {
            Response::InitVnic(rsp) => {
                if rsp.version >> 8 != PROTOCOL_VERSION >> 8 {
                    log::error!("ibvnic: {}: unsupported EIOC protocol version {:#06x}", self.name, rsp.version);
                    self.errored.store(true, Ordering::Release);
                    return;
                }
                if (rsp.num_address_entries as usize) < MCAST_BASE_INDEX || rsp.num_data_paths == 0 {
                    log::error!(
                        "ibvnic: {}: EIOC offers {} address entries on {} data paths",
                        self.name,
                        rsp.num_address_entries,
                        rsp.num_data_paths
                    );
                    self.errored.store(true, Ordering::Release);
                    return;
                }
                core.features = self.config.viport.requested_features() & rsp.features;
                core.lan_switch = rsp.lan_switch;
                core.mgid = rsp.mgid;
                log::debug!(
                    "ibvnic: {}: EIOC version {}.{}, features {:?}, {} address entries",
                    self.name,
                    rsp.version >> 8,
                    rsp.version & 0xff,
                    core.features,
                    rsp.num_address_entries
                );

                let mut desired = self.desired.lock();
                let d = &mut *desired;
                let mac = if d.mac == [0; 6] { rsp.lan_switch.hw_mac } else { d.mac };
                let mut table = AddressTable::new(
                    rsp.num_address_entries as usize,
                    mac,
                    rsp.lan_switch.default_vlan,
                );
                table.set_multicast(&d.multicast);
                d.table = Some(table);
            }
            Response::ConfigDataPath(rsp) => {
                let Some(req) = core.dp_req.take() else {
                    return self.fail(format_args!("ConfigDataPath response without request"));
                };
                let params = match DataParams::negotiate(&self.config.data, &req, &rsp) {
                    Ok(params) => params,
                    Err(e) => {
                        log::error!("ibvnic: {}: {}", self.name, e);
                        self.errored.store(true, Ordering::Release);
                        return;
                    }
                };
                let Some(conn) = core.data_conn.clone() else {
                    return self.fail(format_args!("no data connection for the negotiated path"));
                };
                match DataChannel::new(conn, params, core.features, self.transport.as_ref()) {
                    Ok(data) => {
                        *self.data.lock() = Some(data);
                        core.params = Some(params);
                    }
                    Err(e) => return self.fail(format_args!("data path setup failed: {}", e)),
                }

                let mut d = self.desired.lock();
                let max = params.max_mtu();
                if d.mtu as u32 > max {
                    log::warn!("ibvnic: {}: MTU {} exceeds negotiated {}, clamping", self.name, d.mtu, max);
                    d.mtu = max.min(u16::MAX as u32) as u16;
                }
            }
            Response::ExchangePools(rsp) => {
                let Some(params) = core.params else {
                    return self.fail(format_args!("ExchangePools response without data path"));
                };
                if rsp.path_id != params.path_id {
                    log::error!("ibvnic: {}: ExchangePools for path {:#x}", self.name, rsp.path_id);
                    self.errored.store(true, Ordering::Release);
                    return;
                }
                let peer = RemoteRegion::new(rsp.pool_addr, params.recv_pool_size * BPE_SIZE, rsp.pool_rkey);
                let started = match self.data.lock().as_mut() {
                    Some(data) => data.start(peer, now),
                    None => Err(DataError::Inconsistent("data path vanished")),
                };
                if let Err(e) = started {
                    self.fail(format_args!("starting data path failed: {}", e));
                }
            }
            Response::ConfigLink(rsp) => {
                core.eioc_mtu = rsp.mtu;
                log::trace!("ibvnic: {}: link configured, flags {:?}", self.name, rsp.flags);
            }
            Response::ConfigAddrs(rsp) => {
                let ops = std::mem::take(&mut core.addrs_in_flight);
                {
                    let mut desired = self.desired.lock();
                    let d = &mut *desired;
                    if let Some(table) = d.table.as_mut() {
                        table.ack(&ops);
                        if table.has_dirty() {
                            d.updates |= UpdateFlags::ADDRESS_CONFIG;
                        }
                    }
                }
                match rsp.group_gid() {
                    Some(gid) if gid != core.mgid && self.multicast_enabled(core) => {
                        core.mgid = gid;
                        let mtu = self.desired.lock().mtu as u32;
                        let actions = core.mc.start(gid, mtu).into_iter().collect();
                        self.apply_mc(core, actions, now);
                    }
                    _ => {}
                }
            }
            Response::ReportStatistics(stats) => {
                let mut slot = self.stats.lock();
                slot.latest = Some(stats);
                slot.generation += 1;
                self.stats_cv.notify_all();
            }
            Response::Heartbeat { .. } | Response::Reset => {}
        }
    }
}

impl fmt::Debug for Viport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Viport")
            .field("name", &self.name)
            .field("carrier", &self.carrier())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use quanta::Mock;

    use super::*;
    use crate::sim::{EiocConfig, SimEioc, SimTransport};

    #[derive(Default)]
    struct Recorder {
        carrier: Mutex<Vec<bool>>,
        frames: Mutex<Vec<RxFrame>>,
    }

    impl ViportHooks for Recorder {
        fn schedule(&self, _: ViportId) {}
        fn defer_drain(&self, _: ViportId) {}
        fn carrier(&self, _: ViportId, up: bool) {
            self.carrier.lock().push(up);
        }
        fn receive(&self, _: ViportId, frames: Vec<RxFrame>) {
            self.frames.lock().extend(frames);
        }
        fn wake(&self, _: ViportId) {}
    }

    struct Rig {
        sim: Arc<SimTransport>,
        eioc: Arc<SimEioc>,
        hooks: Arc<Recorder>,
        viport: Arc<Viport>,
        mock: Arc<Mock>,
    }

    impl Rig {
        fn new() -> Self {
            Self::with_config(DriverConfig::default())
        }

        fn with_config(config: DriverConfig) -> Self {
            let sim = Arc::new(SimTransport::new());
            let gid = Gid::from("fe80::2".parse::<Ipv6Addr>().unwrap());
            let eioc = sim.add_eioc(gid, EiocConfig::default());
            let hooks = Arc::new(Recorder::default());
            let (clock, mock) = Clock::mock();
            let path = PathConfig {
                dgid: gid,
                ..Default::default()
            };
            let id = ViportId {
                vnic: VnicHandle(1),
                role: PathRole::Primary,
            };
            let viport = Viport::new(
                id,
                "eth0/primary",
                path,
                1500,
                Arc::new(config),
                sim.clone(),
                hooks.clone(),
                clock,
            );
            Self {
                sim,
                eioc,
                hooks,
                viport,
                mock,
            }
        }

        /// Run the viport and the fabric until neither has work left.
        fn settle(&self) {
            loop {
                self.viport.run();
                if self.sim.pump() == 0 {
                    break;
                }
            }
        }

        fn advance(&self, by: Duration) {
            self.mock.increment(by);
            self.settle();
        }

        fn carrier(&self) -> Vec<bool> {
            self.hooks.carrier.lock().clone()
        }
    }

    fn frame(fill: u8) -> Vec<u8> {
        let mut frame = vec![fill; 64];
        frame[..6].copy_from_slice(&[0x00, 0x06, 0x6a, 0x00, 0x00, 0x01]);
        frame
    }

    #[test]
    fn test_connect() {
        let rig = Rig::new();
        assert_eq!(rig.viport.state(), LinkState::Uninitialized);
        rig.settle();

        assert_eq!(rig.viport.state(), LinkState::Idling);
        assert!(rig.viport.is_connected());
        assert!(rig.viport.carrier());
        assert_eq!(rig.carrier(), vec![true]);
        assert_eq!(
            rig.eioc.commands(),
            vec![
                Command::InitVnic,
                Command::ConfigDataPath,
                Command::ExchangePools,
                Command::ConfigLink,
                Command::ConfigAddresses2,
            ]
        );

        let addresses = rig.eioc.addresses();
        assert!(addresses.contains(&(0, [0xff; 6])));
        assert!(addresses.contains(&(1, [0x00, 0x06, 0x6a, 0x00, 0x00, 0x01])));

        let link = rig.eioc.link().unwrap();
        assert!(link.flags.contains(LinkFlags::DISABLE_NIC));
        assert_eq!(link.mtu, 1500);

        let snap = rig.viport.snapshot();
        assert_eq!(snap.multicast.state, crate::multicast::McState::JoinedAttached);
        assert_eq!(rig.sim.groups(), 1);
        assert_eq!(rig.viport.max_mtu(), Some(1998));
        assert!(snap.recv_pool.unwrap().balanced());
    }

    #[test]
    fn test_activate_sends_config_link() {
        let rig = Rig::new();
        rig.settle();
        rig.viport.set_active(true);
        rig.settle();

        assert_eq!(rig.viport.state(), LinkState::Idling);
        assert_eq!(rig.eioc.commands().last(), Some(&Command::ConfigLink));
        assert!(rig.eioc.link().unwrap().flags.contains(LinkFlags::ENABLE_NIC));

        // Setting the same value again is a no-op.
        let sent = rig.eioc.commands().len();
        rig.viport.set_active(true);
        rig.settle();
        assert_eq!(rig.eioc.commands().len(), sent);
    }

    #[test]
    fn test_transmit_and_receive() {
        let rig = Rig::new();
        assert!(matches!(
            rig.viport.transmit(&frame(1), TxCsumFlags::EMPTY),
            Err(XmitError::NotRunning)
        ));
        rig.settle();

        rig.viport.transmit(&frame(1), TxCsumFlags::EMPTY).unwrap();
        rig.settle();
        assert_eq!(rig.eioc.take_frames(), vec![frame(1)]);

        assert!(rig.eioc.inject(&frame(2), Trailer::default()));
        rig.settle();
        let frames = std::mem::take(&mut *rig.hooks.frames.lock());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, frame(2));
        assert!(!frames[0].multicast);

        let mgid = rig.viport.snapshot().multicast.gid;
        assert_eq!(rig.sim.multicast(mgid, &frame(3)), 1);
        rig.settle();
        let frames = std::mem::take(&mut *rig.hooks.frames.lock());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, frame(3));
        assert!(frames[0].multicast);
    }

    #[test]
    fn test_lost_response_retries() {
        let rig = Rig::new();
        rig.eioc.ignore(Command::InitVnic);
        rig.settle();
        assert_eq!(rig.viport.state(), LinkState::InitVnicRsp);
        assert!(rig.viport.next_deadline().is_some());

        rig.advance(Duration::from_millis(1001));
        assert_eq!(rig.viport.state(), LinkState::RetryWait);
        assert_eq!(rig.viport.snapshot().retry_attempts, 1);
        assert!(rig.carrier().is_empty());

        rig.eioc.behave();
        rig.advance(Duration::from_secs(5));
        assert_eq!(rig.viport.state(), LinkState::Idling);
        assert_eq!(rig.viport.snapshot().retry_attempts, 0);
        assert_eq!(rig.carrier(), vec![true]);
        let commands = rig.eioc.commands();
        assert_eq!(&commands[..2], &[Command::InitVnic, Command::InitVnic]);
    }

    #[test]
    fn test_refused_request_reconnects() {
        let rig = Rig::new();
        rig.eioc.refuse(Command::ConfigLink);
        rig.settle();

        assert_eq!(rig.viport.state(), LinkState::RetryWait);
        assert_eq!(rig.carrier(), vec![true, false]);
        assert!(!rig.viport.is_connected());
        assert_eq!(rig.sim.groups(), 0);

        rig.eioc.behave();
        rig.advance(Duration::from_secs(5));
        assert_eq!(rig.viport.state(), LinkState::Idling);
        assert_eq!(rig.carrier(), vec![true, false, true]);
    }

    #[test]
    fn test_statistics() {
        let rig = Rig::new();
        assert_eq!(rig.viport.request_statistics(Duration::ZERO), None);
        rig.settle();

        let stats = Statistics {
            if_in_ok: 7,
            if_out_ok: 9,
            ..Default::default()
        };
        rig.eioc.set_statistics(stats);
        let got = std::thread::scope(|s| {
            let waiter = s.spawn(|| rig.viport.request_statistics(Duration::from_secs(5)));
            while !waiter.is_finished() {
                rig.settle();
                std::thread::yield_now();
            }
            waiter.join().unwrap()
        });
        assert_eq!(got, Some(stats));
        assert_eq!(rig.eioc.commands().last(), Some(&Command::ReportStatistics));
    }

    #[test]
    fn test_disconnect_releases() {
        let rig = Rig::new();
        rig.settle();
        rig.viport.disconnect();
        rig.settle();

        assert!(rig.viport.is_released());
        assert!(rig.viport.wait_released(Duration::ZERO));
        assert_eq!(rig.viport.state(), LinkState::Uninitialized);
        assert_eq!(rig.eioc.resets(), 1);
        assert_eq!(rig.carrier(), vec![true, false]);
        assert!(!rig.eioc.is_connected());
        assert_eq!(rig.sim.groups(), 0);

        // Stays down.
        rig.advance(Duration::from_secs(30));
        assert_eq!(rig.viport.state(), LinkState::Uninitialized);
    }

    #[test]
    fn test_link_status() {
        let rig = Rig::new();
        rig.settle();
        assert!(rig.eioc.report_link(false));
        rig.settle();
        assert!(!rig.viport.carrier());
        assert!(rig.viport.is_connected());

        assert!(rig.eioc.report_link(true));
        rig.settle();
        assert_eq!(rig.carrier(), vec![true, false, true]);
        assert_eq!(rig.viport.state(), LinkState::Idling);
    }

    #[test]
    fn test_heartbeat() {
        let rig = Rig::new();
        rig.settle();
        rig.advance(Duration::from_millis(2000));
        assert_eq!(rig.eioc.commands().last(), Some(&Command::Heartbeat));
        assert_eq!(rig.viport.state(), LinkState::Idling);
    }

    #[test]
    fn test_mtu_above_threshold_leaves_group() {
        let rig = Rig::new();
        rig.settle();
        assert_eq!(rig.sim.groups(), 1);

        rig.viport.set_mtu(1990);
        rig.settle();
        assert_eq!(rig.viport.snapshot().multicast.state, crate::multicast::McState::Invalid);
        assert_eq!(rig.sim.leaves(), 1);
        assert_eq!(rig.sim.groups(), 0);
        assert_eq!(rig.eioc.link().unwrap().mtu, 1990);
        assert_eq!(rig.viport.state(), LinkState::Idling);
    }

    #[test]
    fn test_reply_before_send_completion() {
        let rig = Rig::new();
        rig.eioc.reply_first(true);
        rig.settle();
        assert_eq!(rig.viport.state(), LinkState::Idling);
        assert_eq!(rig.carrier(), vec![true]);
    }

    #[test]
    fn test_multicast_refused() {
        let rig = Rig::new();
        rig.sim.script_joins([Err(McError::Refused("no such group".into()))]);
        rig.settle();
        assert_eq!(rig.viport.state(), LinkState::Idling);
        assert_eq!(rig.viport.snapshot().multicast.state, crate::multicast::McState::Retried);
        assert_eq!(rig.sim.groups(), 0);
    }

    #[test]
    fn test_unicast_only_without_multicast() {
        let mut config = DriverConfig::default();
        config.viport.inbound_multicast = false;
        let rig = Rig::with_config(config);
        rig.settle();
        assert_eq!(rig.viport.state(), LinkState::Idling);
        assert_eq!(rig.eioc.commands().last(), Some(&Command::ConfigAddresses));
        assert_eq!(rig.sim.joins(), 0);
    }
}
