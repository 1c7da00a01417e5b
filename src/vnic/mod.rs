//! Virtual interfaces.
//!
//! A [`Vnic`] owns a primary and an optional secondary [`Viport`] and picks
//! the one that carries traffic with [`Failover`]. Carrier changes reported
//! by the viports are queued and handled by [`Vnic::run`] on the netpath
//! worker, so path selection never waits for a reconnect in progress.

mod netpath;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::{Clock, Instant};

pub use self::netpath::*;
use crate::config::{DriverConfig, VnicConfig};
use crate::control::wire::Statistics;
use crate::data::{TxCsumFlags, XmitError};
use crate::transport::Transport;
use crate::viport::*;

/// Stable handle of a VNIC within one driver instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct VnicHandle(pub u32);

impl fmt::Display for VnicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a VNIC needs from the network stack above it.
pub trait Upstream: Send + Sync {
    /// Frames arrived for the interface.
    fn receive(&self, vnic: VnicHandle, frames: Vec<crate::data::RxFrame>);
    /// The interface gained or lost carrier.
    fn carrier(&self, vnic: VnicHandle, up: bool);
    /// Stop handing frames to [`crate::driver::Driver::transmit`].
    fn stop_queue(&self, vnic: VnicHandle);
    /// Transmitting is possible again.
    fn wake_queue(&self, vnic: VnicHandle);
}

/// Diagnostic view of a VNIC.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VnicSnapshot {
    pub handle: VnicHandle,
    pub name: String,
    pub carrier: bool,
    pub current: Option<PathRole>,
    pub forced: bool,
    pub primary: ViportSnapshot,
    pub secondary: Option<ViportSnapshot>,
}

/// One virtual interface.
pub struct Vnic {
    handle: VnicHandle,
    config: VnicConfig,
    primary: Arc<Viport>,
    secondary: Option<Arc<Viport>>,

    failover: Mutex<Failover>,
    carrier_events: Mutex<VecDeque<(PathRole, bool)>>,
    /// Mirror of the failover choice for the data path.
    current: Mutex<Option<PathRole>>,
    carrier: AtomicBool,
    clock: Clock,
}

impl Vnic {
    /// Create the interface and its viports. Nothing connects until the
    /// viports are scheduled.
    pub fn new(
        handle: VnicHandle,
        config: VnicConfig,
        driver: Arc<DriverConfig>,
        transport: Arc<dyn Transport>,
        hooks: Arc<dyn ViportHooks>,
        clock: Clock,
    ) -> Self {
        let viport = |role: PathRole, path| {
            Viport::new(
                ViportId { vnic: handle, role },
                format!("{}/{}", config.name, role),
                path,
                config.mtu,
                driver.clone(),
                transport.clone(),
                hooks.clone(),
                clock.clone(),
            )
        };
        let primary = viport(PathRole::Primary, config.primary.clone());
        let secondary = config
            .secondary
            .clone()
            .map(|path| viport(PathRole::Secondary, path));

        let mut failover = Failover::new(
            secondary.is_some(),
            config.prefer_primary,
            config.switch_back_delay(),
            config.connect_timeout(),
        );
        failover.start(clock.now());

        Self {
            handle,
            config,
            primary,
            secondary,
            failover: Mutex::new(failover),
            carrier_events: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            carrier: AtomicBool::new(false),
            clock,
        }
    }

    #[inline]
    pub fn handle(&self) -> VnicHandle {
        self.handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[inline]
    pub fn config(&self) -> &VnicConfig {
        &self.config
    }

    pub fn viport(&self, role: PathRole) -> Option<&Arc<Viport>> {
        match role {
            PathRole::Primary => Some(&self.primary),
            PathRole::Secondary => self.secondary.as_ref(),
        }
    }

    /// Every viport of the interface.
    pub fn viports(&self) -> impl Iterator<Item = &Arc<Viport>> {
        std::iter::once(&self.primary).chain(self.secondary.iter())
    }

    /// The path carrying traffic, if any.
    pub fn current(&self) -> Option<PathRole> {
        *self.current.lock()
    }

    fn current_viport(&self) -> Option<Arc<Viport>> {
        self.current().and_then(|role| self.viport(role).cloned())
    }

    /// Whether the interface has carrier.
    #[inline]
    pub fn carrier(&self) -> bool {
        self.carrier.load(Ordering::Acquire)
    }

    /// Queue a carrier change of one path for [`Vnic::run`].
    pub fn carrier_changed(&self, role: PathRole, up: bool) {
        self.carrier_events.lock().push_back((role, up));
    }

    /// Handle queued carrier changes and due failover timers.
    pub fn run(&self, upstream: &dyn Upstream) {
        let now = self.clock.now();
        let events: Vec<_> = self.carrier_events.lock().drain(..).collect();
        let mut changes = Vec::new();
        let polled = {
            let mut failover = self.failover.lock();
            for (role, up) in events {
                log::debug!(
                    "ibvnic: {}: {} path carrier {}",
                    self.name(),
                    role,
                    if up { "on" } else { "off" }
                );
                changes.extend(failover.carrier_changed(role, up, now));
            }
            failover.poll(now)
        };
        for role in polled.connect_timeouts {
            log::warn!("ibvnic: {}: {} path did not come up in time", self.name(), role);
        }
        changes.extend(polled.change);
        for change in changes {
            self.apply(change, upstream);
        }
    }

    fn apply(&self, change: PathChange, upstream: &dyn Upstream) {
        match (change.from, change.to) {
            (Some(from), Some(to)) => log::info!("ibvnic: {}: failing over from {} to {}", self.name(), from, to),
            (None, Some(to)) => log::info!("ibvnic: {}: using {} path", self.name(), to),
            (_, None) => log::warn!("ibvnic: {}: no path has carrier", self.name()),
        }

        // The old path keeps its connection but no longer forwards.
        if let Some(old) = change.from.and_then(|role| self.viport(role)) {
            old.set_active(false);
        }
        *self.current.lock() = change.to;
        if let Some(new) = change.to.and_then(|role| self.viport(role)) {
            new.set_active(true);
        }

        let up = change.to.is_some();
        if self.carrier.swap(up, Ordering::AcqRel) != up {
            upstream.carrier(self.handle, up);
        }
        if up {
            upstream.wake_queue(self.handle);
        } else {
            upstream.stop_queue(self.handle);
        }
    }

    /// Switch to the other path if it has carrier. Returns `false` if no
    /// switch happened.
    pub fn force_failover(&self, upstream: &dyn Upstream) -> bool {
        let change = self.failover.lock().force_failover();
        change.map(|c| self.apply(c, upstream)).is_some()
    }

    /// Undo [`Vnic::force_failover`].
    pub fn unfailover(&self, upstream: &dyn Upstream) -> bool {
        let change = self.failover.lock().unfailover();
        change.map(|c| self.apply(c, upstream)).is_some()
    }

    /// Earliest failover timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.failover.lock().next_deadline()
    }

    /// Whether carrier events wait for [`Vnic::run`].
    pub fn has_pending(&self) -> bool {
        !self.carrier_events.lock().is_empty()
    }

    /// Transmit on the current path.
    pub fn transmit(&self, frame: &[u8], csum: TxCsumFlags) -> Result<(), XmitError> {
        match self.current_viport() {
            Some(viport) => viport.transmit(frame, csum),
            None => Err(XmitError::NotRunning),
        }
    }

    /// Largest MTU every connected path carries.
    pub fn max_mtu(&self) -> Option<u32> {
        self.viports().filter_map(|v| v.max_mtu()).min()
    }

    pub fn set_mtu(&self, mtu: u16) {
        self.viports().for_each(|v| v.set_mtu(mtu));
    }

    pub fn set_addresses(&self, unicast: Option<[u8; 6]>, multicast: &[[u8; 6]]) {
        self.viports().for_each(|v| v.set_addresses(unicast, multicast));
    }

    pub fn set_flags(&self, promisc: bool, allmulti: bool) {
        self.viports().for_each(|v| v.set_flags(promisc, allmulti));
    }

    /// Reconnect paths that gave up retrying.
    pub fn reconnect(&self) {
        self.viports().for_each(|v| v.reconnect());
    }

    /// Counters of the current path, or of any connected one.
    pub fn statistics(&self, timeout: Duration) -> Option<Statistics> {
        let viport = self
            .current_viport()
            .or_else(|| self.viports().find(|v| v.is_connected()).cloned())?;
        viport.request_statistics(timeout)
    }

    /// Start tearing down every path.
    pub fn disconnect(&self) {
        *self.current.lock() = None;
        self.carrier.store(false, Ordering::Release);
        self.viports().for_each(|v| v.disconnect());
    }

    /// Wait for every path to release its resources.
    pub fn wait_released(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        self.viports().all(|v| {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            v.wait_released(left)
        })
    }

    pub fn snapshot(&self) -> VnicSnapshot {
        let forced = self.failover.lock().is_forced();
        VnicSnapshot {
            handle: self.handle,
            name: self.config.name.clone(),
            carrier: self.carrier(),
            current: self.current(),
            forced,
            primary: self.primary.snapshot(),
            secondary: self.secondary.as_ref().map(|v| v.snapshot()),
        }
    }
}

impl fmt::Debug for Vnic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vnic")
            .field("handle", &self.handle)
            .field("name", &self.config.name)
            .field("current", &self.current())
            .finish()
    }
}
