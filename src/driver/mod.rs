//! The engine instance.
//!
//! A [`Driver`] owns every VNIC and the three worker threads that move them:
//!
//! - `ibvnic-viport` runs link-state machines of scheduled viports, and of
//!   viports whose timers are due;
//! - `ibvnic-netpath` runs path selection of VNICs with carrier changes or
//!   due failover timers;
//! - `ibvnic-drain` drains data completions left over from a capped burst.
//!
//! Scheduling is idempotent: a viport queued twice runs once.

mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::{fmt, io};

use parking_lot::{Mutex, RwLock};
use quanta::{Clock, Instant};
use thiserror::Error;

pub use self::queue::*;
use crate::config::{ConfigError, DriverConfig, VnicConfig};
use crate::control::wire::Statistics;
use crate::data::{RxFrame, TxCsumFlags, XmitError};
use crate::transport::Transport;
use crate::viport::{Viport, ViportHooks, ViportId};
use crate::vnic::*;

/// Longest a worker sleeps without looking at timers.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// How often a blocked [`Driver::delete_vnic`] complains.
const RELEASE_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Longest [`Driver::shutdown`] waits for one VNIC.
const SHUTDOWN_RELEASE_LIMIT: Duration = Duration::from_secs(10);

/// Smallest MTU an interface accepts.
pub const MIN_MTU: u16 = 576;

/// Driver operation error type.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no VNIC with handle {0}")]
    UnknownVnic(VnicHandle),

    #[error("a VNIC named `{0}` already exists")]
    DuplicateName(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("transmit failed: {0}")]
    Xmit(#[from] XmitError),

    #[error("no path of the VNIC is connected")]
    NotConnected,

    #[error("timed out waiting for the EIOC")]
    Timeout,

    #[error("MTU {mtu} outside {min}..={max}")]
    MtuOutOfRange { mtu: u16, min: u16, max: u32 },

    #[error("cannot spawn worker: {0}")]
    Spawn(#[from] io::Error),

    #[error("cannot serialize snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

/// Diagnostic view of the whole driver.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DriverSnapshot {
    pub vnics: Vec<VnicSnapshot>,
    /// VNICs being deleted.
    pub retiring: Vec<VnicHandle>,
}

struct Inner {
    config: Arc<DriverConfig>,
    transport: Arc<dyn Transport>,
    upstream: Arc<dyn Upstream>,
    clock: Clock,
    hooks: Arc<dyn ViportHooks>,

    registry: RwLock<HashMap<VnicHandle, Arc<Vnic>>>,
    /// Deleted VNICs whose viports still tear down.
    retiring: Mutex<HashMap<VnicHandle, Arc<Vnic>>>,
    next_handle: AtomicU32,

    viports: WorkQueue<ViportId>,
    netpaths: WorkQueue<VnicHandle>,
    drains: WorkQueue<ViportId>,
}

/// Adapter the viports report through.
struct Hooks {
    inner: Weak<Inner>,
}

impl ViportHooks for Hooks {
    fn schedule(&self, id: ViportId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.viports.push(id);
        }
    }

    fn defer_drain(&self, id: ViportId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.drains.push(id);
        }
    }

    fn carrier(&self, id: ViportId, up: bool) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if let Some(vnic) = inner.vnic(id.vnic) {
            vnic.carrier_changed(id.role, up);
            inner.netpaths.push(id.vnic);
        }
    }

    fn receive(&self, id: ViportId, frames: Vec<RxFrame>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.upstream.receive(id.vnic, frames);
        }
    }

    fn wake(&self, id: ViportId) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let current = inner.vnic(id.vnic).and_then(|vnic| vnic.current());
        if current == Some(id.role) {
            inner.upstream.wake_queue(id.vnic);
        }
    }
}

impl Inner {
    /// Look up a live or retiring VNIC. Never holds a lock on return.
    fn vnic(&self, handle: VnicHandle) -> Option<Arc<Vnic>> {
        if let Some(vnic) = self.registry.read().get(&handle) {
            return Some(vnic.clone());
        }
        self.retiring.lock().get(&handle).cloned()
    }

    /// Look up a VNIC that accepts new operations.
    fn live(&self, handle: VnicHandle) -> Result<Arc<Vnic>, DriverError> {
        self.registry
            .read()
            .get(&handle)
            .cloned()
            .ok_or(DriverError::UnknownVnic(handle))
    }

    fn all_vnics(&self) -> Vec<Arc<Vnic>> {
        let mut vnics: Vec<_> = self.registry.read().values().cloned().collect();
        vnics.extend(self.retiring.lock().values().cloned());
        vnics
    }

    fn viport(&self, id: ViportId) -> Option<Arc<Viport>> {
        self.vnic(id.vnic).and_then(|vnic| vnic.viport(id.role).cloned())
    }

    fn wait_for(&self, next: Option<Instant>) -> Duration {
        let now = self.clock.now();
        next.map_or(IDLE_WAIT, |at| at.saturating_duration_since(now).min(IDLE_WAIT))
    }

    fn viport_loop(&self) {
        loop {
            let viports: Vec<_> = self
                .all_vnics()
                .iter()
                .flat_map(|vnic| vnic.viports().cloned().collect::<Vec<_>>())
                .collect();
            let now = self.clock.now();
            for viport in &viports {
                if viport.next_deadline().is_some_and(|at| now >= at) {
                    viport.run();
                }
            }
            let next = viports.iter().filter_map(|v| v.next_deadline()).min();

            match self.viports.pop(Some(self.wait_for(next))) {
                Pop::Item(id) => {
                    if let Some(viport) = self.viport(id) {
                        viport.run();
                    }
                }
                Pop::Timeout => {}
                Pop::Closed => break,
            }
        }
        log::debug!("ibvnic: viport worker stopped");
    }

    fn netpath_loop(&self) {
        loop {
            let vnics = self.all_vnics();
            let now = self.clock.now();
            for vnic in &vnics {
                if vnic.next_deadline().is_some_and(|at| now >= at) {
                    vnic.run(self.upstream.as_ref());
                }
            }
            let next = vnics.iter().filter_map(|v| v.next_deadline()).min();

            match self.netpaths.pop(Some(self.wait_for(next))) {
                Pop::Item(handle) => {
                    if let Some(vnic) = self.vnic(handle) {
                        vnic.run(self.upstream.as_ref());
                    }
                }
                Pop::Timeout => {}
                Pop::Closed => break,
            }
        }
        log::debug!("ibvnic: netpath worker stopped");
    }

    fn drain_loop(&self) {
        while let Pop::Item(id) = self.drains.pop(None) {
            if let Some(viport) = self.viport(id) {
                viport.drain_data();
            }
        }
        log::debug!("ibvnic: drain worker stopped");
    }

    fn close(&self) {
        self.viports.close();
        self.netpaths.close();
        self.drains.close();
    }
}

/// A VNIC protocol engine instance.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use ibvnic::prelude::*;
///
/// struct Stack;
///
/// impl Upstream for Stack {
///     fn receive(&self, _: VnicHandle, frames: Vec<RxFrame>) {
///         println!("{} frames", frames.len());
///     }
///     fn carrier(&self, vnic: VnicHandle, up: bool) {
///         println!("{} carrier {}", vnic, up);
///     }
///     fn stop_queue(&self, _: VnicHandle) {}
///     fn wake_queue(&self, _: VnicHandle) {}
/// }
///
/// fn main() -> anyhow::Result<()> {
///     let config = DriverConfig::load_toml("ibvnic.toml")?;
///     let driver = Driver::new(config, Arc::new(SimTransport::new()), Arc::new(Stack))?;
///     println!("{}", driver.describe()?);
///     Ok(())
/// }
/// ```
pub struct Driver {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl Driver {
    /// Start a driver and create the VNICs listed in `config`.
    pub fn new(
        config: DriverConfig,
        transport: Arc<dyn Transport>,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self, DriverError> {
        Self::with_clock(config, transport, upstream, Clock::new())
    }

    /// Like [`Driver::new`] with an explicit time source.
    pub fn with_clock(
        mut config: DriverConfig,
        transport: Arc<dyn Transport>,
        upstream: Arc<dyn Upstream>,
        clock: Clock,
    ) -> Result<Self, DriverError> {
        config.validate()?;
        let vnics = std::mem::take(&mut config.vnics);

        let inner = Arc::new_cyclic(|this: &Weak<Inner>| Inner {
            config: Arc::new(config),
            transport,
            upstream,
            clock,
            hooks: Arc::new(Hooks { inner: this.clone() }),
            registry: RwLock::new(HashMap::new()),
            retiring: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            viports: WorkQueue::new(),
            netpaths: WorkQueue::new(),
            drains: WorkQueue::new(),
        });

        let mut driver = Self {
            inner,
            workers: Vec::new(),
        };
        let loops: [(&str, fn(&Inner)); 3] = [
            ("ibvnic-viport", Inner::viport_loop),
            ("ibvnic-netpath", Inner::netpath_loop),
            ("ibvnic-drain", Inner::drain_loop),
        ];
        for (name, body) in loops {
            let inner = driver.inner.clone();
            let worker = thread::Builder::new()
                .name(name.into())
                .spawn(move || body(&inner))?;
            driver.workers.push(worker);
        }

        for vnic in vnics {
            driver.create_vnic(vnic)?;
        }
        Ok(driver)
    }

    #[inline]
    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// Create an interface and start connecting its paths.
    pub fn create_vnic(&self, config: VnicConfig) -> Result<VnicHandle, DriverError> {
        config.validate(&self.inner.config)?;
        let inner = &self.inner;

        let vnic = {
            let mut registry = inner.registry.write();
            if registry.values().any(|v| v.name() == config.name) {
                return Err(DriverError::DuplicateName(config.name));
            }
            let handle = VnicHandle(inner.next_handle.fetch_add(1, Ordering::Relaxed));
            let vnic = Arc::new(Vnic::new(
                handle,
                config,
                inner.config.clone(),
                inner.transport.clone(),
                inner.hooks.clone(),
                inner.clock.clone(),
            ));
            registry.insert(handle, vnic.clone());
            vnic
        };

        log::info!("ibvnic: {}: created as {}", vnic.name(), vnic.handle());
        for viport in vnic.viports() {
            inner.viports.push(viport.id());
        }
        inner.netpaths.push(vnic.handle());
        Ok(vnic.handle())
    }

    /// Tear an interface down. Blocks until both paths released their
    /// connections.
    pub fn delete_vnic(&self, handle: VnicHandle) -> Result<(), DriverError> {
        self.retire(handle, None)
    }

    /// Delete `handle`, giving up waiting after `limit` if set.
    fn retire(&self, handle: VnicHandle, limit: Option<Duration>) -> Result<(), DriverError> {
        let inner = &self.inner;
        let vnic = inner
            .registry
            .write()
            .remove(&handle)
            .ok_or(DriverError::UnknownVnic(handle))?;
        inner.retiring.lock().insert(handle, vnic.clone());

        log::info!("ibvnic: {}: deleting", vnic.name());
        let had_carrier = vnic.carrier();
        vnic.disconnect();
        if had_carrier {
            inner.upstream.carrier(handle, false);
        }
        inner.upstream.stop_queue(handle);

        let mut waited = Duration::ZERO;
        while !vnic.wait_released(RELEASE_WARN_INTERVAL) {
            if self.workers.iter().all(JoinHandle::is_finished) {
                log::error!("ibvnic: {}: workers gone before release", vnic.name());
                break;
            }
            waited += RELEASE_WARN_INTERVAL;
            if limit.is_some_and(|limit| waited >= limit) {
                log::error!("ibvnic: {}: abandoning release after {:?}", vnic.name(), waited);
                break;
            }
            log::warn!("ibvnic: {}: still releasing after {:?}", vnic.name(), waited);
        }
        inner.retiring.lock().remove(&handle);
        Ok(())
    }

    /// Handles of every live interface, in creation order.
    pub fn vnics(&self) -> Vec<VnicHandle> {
        let mut handles: Vec<_> = self.inner.registry.read().keys().copied().collect();
        handles.sort();
        handles
    }

    /// Find an interface by name.
    pub fn find(&self, name: &str) -> Option<VnicHandle> {
        self.inner
            .registry
            .read()
            .values()
            .find(|v| v.name() == name)
            .map(|v| v.handle())
    }

    /// Transmit one Ethernet frame. On [`XmitError::NoBuffers`] the upstream
    /// queue is stopped until the path wakes it.
    pub fn transmit(&self, handle: VnicHandle, frame: &[u8], csum: TxCsumFlags) -> Result<(), DriverError> {
        let vnic = self.inner.live(handle)?;
        vnic.transmit(frame, csum).map_err(|e| {
            if matches!(e, XmitError::NoBuffers) {
                self.inner.upstream.stop_queue(handle);
            }
            DriverError::from(e)
        })
    }

    /// Change the MTU of an interface.
    pub fn set_mtu(&self, handle: VnicHandle, mtu: u16) -> Result<(), DriverError> {
        let vnic = self.inner.live(handle)?;
        let max = vnic
            .max_mtu()
            .map_or(self.inner.config.data.max_mtu(), |m| m.min(self.inner.config.data.max_mtu()));
        if mtu < MIN_MTU || mtu as u32 > max {
            return Err(DriverError::MtuOutOfRange {
                mtu,
                min: MIN_MTU,
                max,
            });
        }
        vnic.set_mtu(mtu);
        Ok(())
    }

    /// Replace the unicast address and the multicast list.
    pub fn set_addresses(
        &self,
        handle: VnicHandle,
        unicast: Option<[u8; 6]>,
        multicast: &[[u8; 6]],
    ) -> Result<(), DriverError> {
        self.inner.live(handle)?.set_addresses(unicast, multicast);
        Ok(())
    }

    /// Set promiscuous and all-multicast reception.
    pub fn set_flags(&self, handle: VnicHandle, promisc: bool, allmulti: bool) -> Result<(), DriverError> {
        self.inner.live(handle)?.set_flags(promisc, allmulti);
        Ok(())
    }

    /// Move traffic to the other path. Returns `false` if it has no carrier.
    pub fn force_failover(&self, handle: VnicHandle) -> Result<bool, DriverError> {
        let vnic = self.inner.live(handle)?;
        Ok(vnic.force_failover(self.inner.upstream.as_ref()))
    }

    /// Return to the path the failover policy prefers.
    pub fn unfailover(&self, handle: VnicHandle) -> Result<bool, DriverError> {
        let vnic = self.inner.live(handle)?;
        Ok(vnic.unfailover(self.inner.upstream.as_ref()))
    }

    /// Restart paths that gave up reconnecting.
    pub fn reconnect(&self, handle: VnicHandle) -> Result<(), DriverError> {
        self.inner.live(handle)?.reconnect();
        Ok(())
    }

    /// Fetch the EIOC counters of an interface. Blocks up to `timeout`.
    pub fn statistics(&self, handle: VnicHandle, timeout: Duration) -> Result<Statistics, DriverError> {
        let vnic = self.inner.live(handle)?;
        if !vnic.viports().any(|v| v.is_connected()) {
            return Err(DriverError::NotConnected);
        }
        vnic.statistics(timeout).ok_or(DriverError::Timeout)
    }

    pub fn snapshot(&self) -> DriverSnapshot {
        let mut vnics: Vec<_> = self.inner.registry.read().values().map(|v| v.snapshot()).collect();
        vnics.sort_by_key(|v| v.handle);
        let mut retiring: Vec<_> = self.inner.retiring.lock().keys().copied().collect();
        retiring.sort();
        DriverSnapshot { vnics, retiring }
    }

    /// Render [`Driver::snapshot`] as pretty JSON.
    pub fn describe(&self) -> Result<String, DriverError> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Delete every interface and stop the workers.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for handle in self.vnics() {
            if let Err(e) = self.retire(handle, Some(SHUTDOWN_RELEASE_LIMIT)) {
                log::warn!("ibvnic: shutdown: {}", e);
            }
        }
        self.inner.close();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("ibvnic: a worker panicked");
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("vnics", &self.vnics())
            .field("workers", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;
    use std::time::Instant as StdInstant;

    use super::*;
    use crate::config::PathConfig;
    use crate::sim::{EiocConfig, SimEioc, SimTransport};
    use crate::transport::Gid;

    #[derive(Default)]
    struct Stack {
        carrier: Mutex<Vec<(VnicHandle, bool)>>,
        frames: Mutex<Vec<RxFrame>>,
        stops: AtomicU32,
    }

    impl Upstream for Stack {
        fn receive(&self, _: VnicHandle, frames: Vec<RxFrame>) {
            self.frames.lock().extend(frames);
        }
        fn carrier(&self, vnic: VnicHandle, up: bool) {
            self.carrier.lock().push((vnic, up));
        }
        fn stop_queue(&self, _: VnicHandle) {
            self.stops.fetch_add(1, Ordering::Relaxed);
        }
        fn wake_queue(&self, _: VnicHandle) {}
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = StdInstant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(StdInstant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn gid(s: &str) -> Gid {
        Gid::from(s.parse::<Ipv6Addr>().unwrap())
    }

    fn path(dgid: Gid) -> PathConfig {
        PathConfig {
            dgid,
            ..Default::default()
        }
    }

    struct Rig {
        sim: Arc<SimTransport>,
        stack: Arc<Stack>,
        driver: Driver,
    }

    impl Rig {
        fn new() -> Self {
            let mut sim = SimTransport::new();
            sim.start_pumping().unwrap();
            let sim = Arc::new(sim);
            let stack = Arc::new(Stack::default());
            let driver = Driver::new(DriverConfig::default(), sim.clone(), stack.clone()).unwrap();
            Self { sim, stack, driver }
        }

        fn eioc(&self, at: &str) -> Arc<SimEioc> {
            self.sim.add_eioc(gid(at), EiocConfig::default())
        }

        fn vnic(&self, name: &str, primary: &str, secondary: Option<&str>) -> VnicHandle {
            let config = VnicConfig {
                name: name.into(),
                primary: path(gid(primary)),
                secondary: secondary.map(|s| path(gid(s))),
                ..Default::default()
            };
            self.driver.create_vnic(config).unwrap()
        }

        fn snapshot(&self, handle: VnicHandle) -> VnicSnapshot {
            self.driver
                .snapshot()
                .vnics
                .into_iter()
                .find(|v| v.handle == handle)
                .unwrap()
        }
    }

    #[test]
    fn test_vnic_lifecycle() {
        let rig = Rig::new();
        let eioc = rig.eioc("fe80::2");
        let vnic = rig.vnic("ib0", "fe80::2", None);
        assert_eq!(rig.driver.find("ib0"), Some(vnic));
        assert_eq!(rig.driver.vnics(), vec![vnic]);

        wait_until("carrier", || rig.stack.carrier.lock().contains(&(vnic, true)));
        assert_eq!(rig.snapshot(vnic).current, Some(PathRole::Primary));
        wait_until("enabled NIC", || {
            eioc.link()
                .is_some_and(|l| l.flags.contains(crate::control::wire::LinkFlags::ENABLE_NIC))
        });

        let frame = vec![0x5a; 128];
        rig.driver.transmit(vnic, &frame, TxCsumFlags::EMPTY).unwrap();
        wait_until("transmitted frame", || !eioc.take_frames().is_empty());

        assert!(eioc.inject(&frame, Default::default()));
        wait_until("received frame", || rig.stack.frames.lock().len() == 1);
        assert_eq!(rig.stack.frames.lock()[0].data, frame);

        let stats = rig.driver.statistics(vnic, Duration::from_secs(5)).unwrap();
        assert_eq!(stats, Statistics::default());

        let json = rig.driver.describe().unwrap();
        assert!(json.contains("\"ib0\""));
        assert!(json.contains("\"Primary\""));

        rig.driver.delete_vnic(vnic).unwrap();
        assert!(rig.driver.vnics().is_empty());
        assert_eq!(rig.stack.carrier.lock().last(), Some(&(vnic, false)));
        assert!(!eioc.is_connected());
        assert!(matches!(
            rig.driver.delete_vnic(vnic),
            Err(DriverError::UnknownVnic(h)) if h == vnic
        ));
        assert!(matches!(
            rig.driver.transmit(vnic, &frame, TxCsumFlags::EMPTY),
            Err(DriverError::UnknownVnic(_))
        ));
    }

    #[test]
    fn test_create_rejects_bad_config() {
        let rig = Rig::new();
        rig.vnic("ib0", "fe80::2", None);
        assert!(matches!(
            rig.driver.create_vnic(VnicConfig {
                name: "ib0".into(),
                ..Default::default()
            }),
            Err(DriverError::DuplicateName(_))
        ));
        assert!(matches!(
            rig.driver.create_vnic(VnicConfig {
                name: "not a name!".into(),
                ..Default::default()
            }),
            Err(DriverError::Config(_))
        ));
        assert!(matches!(
            rig.driver.create_vnic(VnicConfig {
                name: "ib1".into(),
                primary: path(gid("fe80::2")),
                secondary: Some(path(gid("fe80::2"))),
                ..Default::default()
            }),
            Err(DriverError::Config(_))
        ));
        assert_eq!(rig.driver.vnics().len(), 1);
    }

    #[test]
    fn test_mtu_bounds() {
        let rig = Rig::new();
        rig.eioc("fe80::2");
        let vnic = rig.vnic("ib0", "fe80::2", None);
        wait_until("connected", || rig.snapshot(vnic).primary.connected);

        assert!(matches!(
            rig.driver.set_mtu(vnic, MIN_MTU - 1),
            Err(DriverError::MtuOutOfRange { .. })
        ));
        assert!(matches!(
            rig.driver.set_mtu(vnic, 1999),
            Err(DriverError::MtuOutOfRange { max: 1998, .. })
        ));
        rig.driver.set_mtu(vnic, 1600).unwrap();
        wait_until("new MTU", || rig.snapshot(vnic).primary.eioc_mtu == 1600);
    }

    #[test]
    fn test_statistics_without_connection() {
        let rig = Rig::new();
        rig.eioc("fe80::2").refuse_connections(true);
        let vnic = rig.vnic("ib0", "fe80::2", None);
        assert!(matches!(
            rig.driver.statistics(vnic, Duration::from_millis(10)),
            Err(DriverError::NotConnected)
        ));
    }

    #[test]
    fn test_failover() {
        let rig = Rig::new();
        let eiocs = [rig.eioc("fe80::2"), rig.eioc("fe80::3")];
        let vnic = rig.vnic("ib0", "fe80::2", Some("fe80::3"));
        wait_until("both paths", || {
            let snap = rig.snapshot(vnic);
            snap.carrier && snap.primary.carrier && snap.secondary.is_some_and(|s| s.carrier)
        });

        let current = rig.snapshot(vnic).current.unwrap();
        let eioc = match current {
            PathRole::Primary => &eiocs[0],
            PathRole::Secondary => &eiocs[1],
        };
        eioc.disconnect_all();
        wait_until("failover", || rig.snapshot(vnic).current == Some(current.other()));
        assert!(rig.snapshot(vnic).carrier);
    }

    #[test]
    fn test_configured_vnics_start_with_driver() {
        let mut sim = SimTransport::new();
        sim.start_pumping().unwrap();
        let sim = Arc::new(sim);
        sim.add_eioc(gid("fe80::2"), EiocConfig::default());
        let config = DriverConfig {
            vnics: vec![VnicConfig {
                name: "ib7".into(),
                primary: path(gid("fe80::2")),
                ..Default::default()
            }],
            ..Default::default()
        };
        let stack = Arc::new(Stack::default());
        let mut driver = Driver::new(config, sim, stack.clone()).unwrap();
        assert!(driver.config().vnics.is_empty());
        let vnic = driver.find("ib7").unwrap();
        wait_until("carrier", || stack.carrier.lock().contains(&(vnic, true)));

        driver.shutdown();
        assert!(driver.vnics().is_empty());
        assert_eq!(stack.carrier.lock().last(), Some(&(vnic, false)));
        assert!(stack.stops.load(Ordering::Relaxed) > 0);
    }
}
