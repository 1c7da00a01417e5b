//! Inbound multicast group membership of one viport.
//!
//! [`McInfo`] is a plain state machine: it never touches the transport and
//! instead returns the [`McAction`]s its owner must carry out.

use quanta::Instant;
use std::time::Duration;

use crate::config::McConfig;
use crate::transport::{Gid, McError, McHandle};

/// Multicast membership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum McState {
    /// No membership.
    Invalid,
    /// A join was requested from the subnet manager.
    Joining,
    /// Joined; the data connection is being attached.
    Attaching,
    /// Joined and receiving.
    JoinedAttached,
    /// Leaving.
    Detaching,
    /// Gave up after too many failed joins.
    Retried,
}

/// Transport operation requested by [`McInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McAction {
    /// Start joining `gid`; report the handle with [`McInfo::join_started`].
    Join(Gid),
    /// Attach the data connection; report with [`McInfo::on_attached`].
    Attach { gid: Gid, lid: u16 },
    /// Detach the data connection.
    Detach { gid: Gid, lid: u16 },
    /// Release a membership handle.
    Release(McHandle),
}

/// Multicast membership of one viport.
#[derive(Debug)]
pub struct McInfo {
    max_retries: u32,
    retry_delay: Duration,
    mtu_threshold: u32,

    state: McState,
    gid: Gid,
    lid: u16,
    handle: Option<McHandle>,
    failures: u32,
    retry_at: Option<Instant>,
}

/// Diagnostic view of [`McInfo`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct McSnapshot {
    pub state: McState,
    pub gid: Gid,
    pub lid: u16,
    pub failures: u32,
}

impl McInfo {
    pub fn new(config: &McConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            mtu_threshold: config.mtu_threshold,
            state: McState::Invalid,
            gid: Gid::ZERO,
            lid: 0,
            handle: None,
            failures: 0,
            retry_at: None,
        }
    }

    #[inline]
    pub fn state(&self) -> McState {
        self.state
    }

    #[inline]
    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Pending retry deadline, if any.
    #[inline]
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Whether multicast fan-out applies at `mtu`.
    #[inline]
    pub fn mtu_allows(&self, mtu: u32) -> bool {
        mtu <= self.mtu_threshold
    }

    pub fn snapshot(&self) -> McSnapshot {
        McSnapshot {
            state: self.state,
            gid: self.gid,
            lid: self.lid,
            failures: self.failures,
        }
    }

    /// Start joining `gid` if nothing is in progress, the group is a real
    /// multicast group and `mtu` is small enough.
    pub fn start(&mut self, gid: Gid, mtu: u32) -> Option<McAction> {
        if !gid.is_zero() {
            self.gid = gid;
        }
        if self.state != McState::Invalid || !self.gid.is_multicast() || !self.mtu_allows(mtu) {
            return None;
        }
        self.state = McState::Joining;
        self.retry_at = None;
        log::debug!("ibvnic: joining multicast group {}", self.gid);
        Some(McAction::Join(self.gid))
    }

    /// The transport accepted the join request of the last
    /// [`McAction::Join`].
    pub fn join_started(&mut self, handle: McHandle) -> Option<McAction> {
        if self.state != McState::Joining {
            // Left while the join call was being made.
            return Some(McAction::Release(handle));
        }
        self.handle = Some(handle);
        None
    }

    /// The subnet manager completed the join.
    pub fn on_joined(&mut self, lid: u16) -> Option<McAction> {
        if self.state != McState::Joining || self.handle.is_none() {
            return None;
        }
        self.state = McState::Attaching;
        self.lid = lid;
        Some(McAction::Attach { gid: self.gid, lid })
    }

    /// The data connection attach finished.
    pub fn on_attached(&mut self, ok: bool, now: Instant) -> Vec<McAction> {
        if self.state != McState::Attaching {
            return Vec::new();
        }
        if ok {
            self.state = McState::JoinedAttached;
            self.failures = 0;
            log::info!("ibvnic: multicast group {} attached (lid {:#x})", self.gid, self.lid);
            return Vec::new();
        }
        self.fail(&McError::Busy, now)
    }

    /// A join attempt failed, either reported by the transport or because
    /// the join call itself was refused.
    pub fn on_join_failed(&mut self, error: &McError, now: Instant) -> Vec<McAction> {
        if self.state != McState::Joining {
            return Vec::new();
        }
        self.fail(error, now)
    }

    fn fail(&mut self, error: &McError, now: Instant) -> Vec<McAction> {
        let actions: Vec<McAction> = self.handle.take().map(McAction::Release).into_iter().collect();
        if *error == McError::NetReset {
            log::debug!("ibvnic: multicast state cleared by network reset");
            self.clear();
            return actions;
        }

        self.failures += 1;
        if !error.is_transient() || self.failures > self.max_retries {
            log::warn!(
                "ibvnic: giving up on multicast group {} after {} failures ({}), receiving unicast only",
                self.gid,
                self.failures,
                error
            );
            self.state = McState::Retried;
            self.retry_at = None;
            return actions;
        }
        self.state = McState::Joining;
        self.retry_at = Some(now + self.retry_delay);
        actions
    }

    /// Fire a due join retry.
    pub fn poll(&mut self, now: Instant) -> Option<McAction> {
        match self.retry_at {
            Some(at) if now >= at && self.state == McState::Joining => {
                self.retry_at = None;
                Some(McAction::Join(self.gid))
            }
            _ => None,
        }
    }

    /// Leave the group: detach before releasing the handle. A no-op when
    /// there is no membership or after giving up.
    pub fn leave(&mut self) -> Vec<McAction> {
        let mut actions = Vec::new();
        match self.state {
            McState::Invalid | McState::Retried | McState::Detaching => return actions,
            McState::JoinedAttached => actions.push(McAction::Detach {
                gid: self.gid,
                lid: self.lid,
            }),
            McState::Joining | McState::Attaching => {}
        }
        actions.extend(self.handle.take().map(McAction::Release));
        self.state = McState::Detaching;
        self.retry_at = None;
        actions
    }

    /// The actions returned by [`McInfo::leave`] were carried out.
    pub fn on_left(&mut self) {
        if self.state == McState::Detaching {
            self.state = McState::Invalid;
            self.lid = 0;
        }
    }

    /// Apply an MTU change. Raising the MTU past the threshold leaves the
    /// group; lowering it below rejoins a known group.
    pub fn mtu_changed(&mut self, mtu: u32) -> Vec<McAction> {
        if !self.mtu_allows(mtu) {
            return self.leave();
        }
        self.start(Gid::ZERO, mtu).into_iter().collect()
    }

    /// Forget everything, including the give-up state. The handle, if any,
    /// must already have been released.
    pub fn clear(&mut self) {
        self.state = McState::Invalid;
        self.lid = 0;
        self.handle = None;
        self.failures = 0;
        self.retry_at = None;
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;

    fn group() -> Gid {
        "ff12:401b:ffff::1".parse::<Ipv6Addr>().unwrap().into()
    }

    fn joined(mc: &mut McInfo, now: Instant) {
        assert_eq!(mc.start(group(), 1500), Some(McAction::Join(group())));
        assert_eq!(mc.join_started(McHandle(1)), None);
        assert_eq!(mc.on_joined(0xc001), Some(McAction::Attach { gid: group(), lid: 0xc001 }));
        assert!(mc.on_attached(true, now).is_empty());
        assert_eq!(mc.state(), McState::JoinedAttached);
    }

    #[test]
    fn test_join_and_leave() {
        let mut mc = McInfo::new(&McConfig::default());
        joined(&mut mc, Instant::now());
        assert_eq!(
            mc.leave(),
            vec![
                McAction::Detach { gid: group(), lid: 0xc001 },
                McAction::Release(McHandle(1))
            ]
        );
        assert_eq!(mc.state(), McState::Detaching);
        mc.on_left();
        assert_eq!(mc.state(), McState::Invalid);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut mc = McInfo::new(&McConfig::default());
        assert!(mc.leave().is_empty());
        assert_eq!(mc.state(), McState::Invalid);

        joined(&mut mc, clock.now());
        assert_eq!(mc.leave().len(), 2);
        // Leaving again before the first leave finished releases nothing twice.
        assert!(mc.leave().is_empty());
        mc.on_left();
        assert!(mc.leave().is_empty());

        let config = McConfig {
            max_retries: 0,
            ..Default::default()
        };
        let mut mc = McInfo::new(&config);
        mc.start(group(), 1500);
        mc.join_started(McHandle(9));
        assert_eq!(
            mc.on_join_failed(&McError::Timeout, clock.now()),
            vec![McAction::Release(McHandle(9))]
        );
        assert_eq!(mc.state(), McState::Retried);
        assert!(mc.leave().is_empty());
        assert_eq!(mc.state(), McState::Retried);
    }

    #[test]
    fn test_gives_up_after_retry_cap() {
        let (clock, mock) = quanta::Clock::mock();
        let mut mc = McInfo::new(&McConfig::default());
        let mut attempts = 0;

        let mut next = mc.start(group(), 1500);
        while let Some(McAction::Join(_)) = next {
            attempts += 1;
            mc.join_started(McHandle(attempts));
            let released = mc.on_join_failed(&McError::Timeout, clock.now());
            assert_eq!(released, vec![McAction::Release(McHandle(attempts))]);

            mock.increment(Duration::from_millis(999));
            assert_eq!(mc.poll(clock.now()), None);
            mock.increment(Duration::from_millis(1));
            next = mc.poll(clock.now());
        }

        assert_eq!(attempts, 6);
        assert_eq!(mc.state(), McState::Retried);
        mock.increment(Duration::from_secs(60));
        assert_eq!(mc.poll(clock.now()), None);
        assert_eq!(mc.start(group(), 1500), None);
    }

    #[test]
    fn test_net_reset_clears() {
        let mut mc = McInfo::new(&McConfig::default());
        let now = Instant::now();
        mc.start(group(), 1500);
        mc.join_started(McHandle(3));
        mc.on_join_failed(&McError::Timeout, now);
        assert_eq!(mc.snapshot().failures, 1);

        mc.join_started(McHandle(4));
        assert_eq!(
            mc.on_join_failed(&McError::NetReset, now),
            vec![McAction::Release(McHandle(4))]
        );
        assert_eq!(mc.state(), McState::Invalid);
        assert_eq!(mc.snapshot().failures, 0);
        assert_eq!(mc.retry_deadline(), None);
    }

    #[test]
    fn test_mtu_gating() {
        let config = McConfig::default();
        let mut mc = McInfo::new(&config);
        assert_eq!(mc.start(group(), config.mtu_threshold + 1), None);
        assert_eq!(mc.state(), McState::Invalid);

        joined(&mut mc, Instant::now());
        // Raising the MTU past the threshold leaves without any reconnect.
        let actions = mc.mtu_changed(config.mtu_threshold + 1);
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], McAction::Detach { .. }));
        mc.on_left();
        assert_eq!(mc.state(), McState::Invalid);

        // Lowering it again rejoins the remembered group.
        assert_eq!(mc.mtu_changed(1500), vec![McAction::Join(group())]);
    }

    #[test]
    fn test_non_multicast_gid_is_ignored() {
        let mut mc = McInfo::new(&McConfig::default());
        assert_eq!(mc.start(Gid::ZERO, 1500), None);
        let unicast: Gid = "fe80::1".parse::<Ipv6Addr>().unwrap().into();
        assert_eq!(mc.start(unicast, 1500), None);
    }
}
