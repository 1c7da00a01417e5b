use std::fmt;
use std::time::Duration;

use quanta::Instant;

/// Which of the two paths of a VNIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum PathRole {
    Primary,
    Secondary,
}

impl PathRole {
    /// Get the other path.
    #[inline]
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }
}

impl fmt::Display for PathRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        })
    }
}

/// What a running netpath timer is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TimerPurpose {
    /// The path should have carrier by the deadline.
    Connect,
    /// The primary path may take over again at the deadline.
    SwitchBack,
}

/// Single-shot timer of a netpath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetpathTimer {
    Idle,
    Active { purpose: TimerPurpose, deadline: Instant },
    Expired(TimerPurpose),
}

impl NetpathTimer {
    fn start(&mut self, purpose: TimerPurpose, now: Instant, after: Duration) {
        *self = Self::Active {
            purpose,
            deadline: now + after,
        };
    }

    fn cancel(&mut self) {
        *self = Self::Idle;
    }

    /// Fire the timer if due. Returns the purpose of a timer that just
    /// expired.
    fn poll(&mut self, now: Instant) -> Option<TimerPurpose> {
        match *self {
            Self::Active { purpose, deadline } if now >= deadline => {
                *self = Self::Expired(purpose);
                Some(purpose)
            }
            _ => None,
        }
    }

    #[inline]
    fn deadline(&self) -> Option<Instant> {
        match self {
            Self::Active { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    #[inline]
    fn expired(&self, purpose: TimerPurpose) -> bool {
        *self == Self::Expired(purpose)
    }
}

/// Per-path failover bookkeeping.
#[derive(Debug, Clone)]
pub struct Netpath {
    role: PathRole,
    present: bool,
    carrier: bool,
    timer: NetpathTimer,
}

impl Netpath {
    fn new(role: PathRole, present: bool) -> Self {
        Self {
            role,
            present,
            carrier: false,
            timer: NetpathTimer::Idle,
        }
    }

    #[inline]
    pub fn role(&self) -> PathRole {
        self.role
    }

    #[inline]
    pub fn carrier(&self) -> bool {
        self.present && self.carrier
    }

    #[inline]
    pub fn timer(&self) -> NetpathTimer {
        self.timer
    }
}

/// A change of the current path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathChange {
    pub from: Option<PathRole>,
    pub to: Option<PathRole>,
}

/// Outcome of [`Failover::poll`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Polled {
    pub change: Option<PathChange>,
    /// Paths whose connect timer ran out without carrier.
    pub connect_timeouts: Vec<PathRole>,
}

/// Path selection of one VNIC.
#[derive(Debug)]
pub struct Failover {
    prefer_primary: bool,
    switch_back_delay: Duration,
    connect_timeout: Duration,

    primary: Netpath,
    secondary: Netpath,
    current: Option<PathRole>,
    /// Set by a forced failover until undone.
    forced: bool,
}

impl Failover {
    pub fn new(
        has_secondary: bool,
        prefer_primary: bool,
        switch_back_delay: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            prefer_primary,
            switch_back_delay,
            connect_timeout,
            primary: Netpath::new(PathRole::Primary, true),
            secondary: Netpath::new(PathRole::Secondary, has_secondary),
            current: None,
            forced: false,
        }
    }

    /// Start the connect timers of every configured path.
    pub fn start(&mut self, now: Instant) {
        for path in [&mut self.primary, &mut self.secondary] {
            if path.present && !path.carrier {
                path.timer.start(TimerPurpose::Connect, now, self.connect_timeout);
            }
        }
    }

    #[inline]
    pub fn current(&self) -> Option<PathRole> {
        self.current
    }

    #[inline]
    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn path(&self, role: PathRole) -> &Netpath {
        match role {
            PathRole::Primary => &self.primary,
            PathRole::Secondary => &self.secondary,
        }
    }

    fn path_mut(&mut self, role: PathRole) -> &mut Netpath {
        match role {
            PathRole::Primary => &mut self.primary,
            PathRole::Secondary => &mut self.secondary,
        }
    }

    /// The path the policy picks right now.
    fn select(&self) -> Option<PathRole> {
        let up = |role| self.path(role).carrier();
        match self.current {
            Some(role) if self.forced && up(role) => Some(role),
            Some(PathRole::Primary) if up(PathRole::Primary) => Some(PathRole::Primary),
            Some(PathRole::Secondary) if up(PathRole::Secondary) => {
                let switch_back = self.prefer_primary
                    && up(PathRole::Primary)
                    && self.primary.timer.expired(TimerPurpose::SwitchBack);
                Some(if switch_back {
                    PathRole::Primary
                } else {
                    PathRole::Secondary
                })
            }
            _ if up(PathRole::Primary) => Some(PathRole::Primary),
            _ if up(PathRole::Secondary) => Some(PathRole::Secondary),
            _ => None,
        }
    }

    fn reselect(&mut self) -> Option<PathChange> {
        let to = self.select();
        if to == self.current {
            return None;
        }
        let from = self.current;
        self.current = to;
        // The forced path is kept while it has carrier, so it went away.
        self.forced = false;
        if to == Some(PathRole::Primary) {
            self.primary.timer.cancel();
        }
        Some(PathChange { from, to })
    }

    /// Record a carrier transition of one path.
    pub fn carrier_changed(&mut self, role: PathRole, up: bool, now: Instant) -> Option<PathChange> {
        let delay = self.switch_back_delay;
        let prefer_primary = self.prefer_primary;
        let current = self.current;
        let path = self.path_mut(role);
        if path.carrier == up {
            return None;
        }
        path.carrier = up;

        if !up {
            path.timer.cancel();
        } else if role == PathRole::Primary && prefer_primary && current == Some(PathRole::Secondary) {
            path.timer.start(TimerPurpose::SwitchBack, now, delay);
        } else {
            path.timer.cancel();
        }
        self.reselect()
    }

    /// Fire due timers.
    pub fn poll(&mut self, now: Instant) -> Polled {
        let mut polled = Polled::default();
        let mut switch_back = false;
        for path in [&mut self.primary, &mut self.secondary] {
            match path.timer.poll(now) {
                Some(TimerPurpose::Connect) => polled.connect_timeouts.push(path.role),
                Some(TimerPurpose::SwitchBack) => switch_back = true,
                None => {}
            }
        }
        if switch_back {
            polled.change = self.reselect();
        }
        polled
    }

    /// Move to the other path if it has carrier. The choice sticks until
    /// [`Failover::unfailover`] or until the forced path loses carrier.
    pub fn force_failover(&mut self) -> Option<PathChange> {
        let from = self.current?;
        let to = from.other();
        if !self.path(to).carrier() {
            return None;
        }
        self.forced = true;
        self.current = Some(to);
        Some(PathChange { from: Some(from), to: Some(to) })
    }

    /// Undo a forced failover: go back to the path the policy prefers.
    pub fn unfailover(&mut self) -> Option<PathChange> {
        if !self.forced {
            return None;
        }
        self.forced = false;
        let preferred = [PathRole::Primary, PathRole::Secondary]
            .into_iter()
            .find(|role| self.path(*role).carrier());
        if preferred == self.current {
            return None;
        }
        let from = self.current;
        self.current = preferred;
        self.primary.timer.cancel();
        Some(PathChange { from, to: preferred })
    }

    /// Earliest running timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.primary.timer.deadline(), self.secondary.timer.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PathRole::*;

    fn failover(prefer_primary: bool) -> Failover {
        Failover::new(
            true,
            prefer_primary,
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
    }

    fn change(from: Option<PathRole>, to: Option<PathRole>) -> Option<PathChange> {
        Some(PathChange { from, to })
    }

    #[test]
    fn test_first_carrier_wins() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut f = failover(false);
        assert_eq!(f.carrier_changed(Secondary, true, clock.now()), change(None, Some(Secondary)));
        // Without prefer-primary the secondary keeps the traffic.
        assert_eq!(f.carrier_changed(Primary, true, clock.now()), None);
        assert_eq!(f.current(), Some(Secondary));
    }

    #[test]
    fn test_primary_loss_moves_to_idle_secondary() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut f = failover(true);
        f.carrier_changed(Primary, true, clock.now());
        f.carrier_changed(Secondary, true, clock.now());
        assert_eq!(f.current(), Some(Primary));
        assert_eq!(f.path(Secondary).timer(), NetpathTimer::Idle);

        assert_eq!(
            f.carrier_changed(Primary, false, clock.now()),
            change(Some(Primary), Some(Secondary))
        );
        assert_eq!(f.carrier_changed(Secondary, false, clock.now()), change(Some(Secondary), None));
    }

    #[test]
    fn test_switch_back_waits_for_timer() {
        let (clock, mock) = quanta::Clock::mock();
        let mut f = failover(true);
        f.carrier_changed(Secondary, true, clock.now());
        assert_eq!(f.carrier_changed(Primary, true, clock.now()), None);
        assert!(matches!(
            f.path(Primary).timer(),
            NetpathTimer::Active {
                purpose: TimerPurpose::SwitchBack,
                ..
            }
        ));

        mock.increment(Duration::from_secs(9));
        assert_eq!(f.poll(clock.now()), Polled::default());
        mock.increment(Duration::from_secs(1));
        assert_eq!(f.poll(clock.now()).change, change(Some(Secondary), Some(Primary)));
        assert_eq!(f.path(Primary).timer(), NetpathTimer::Idle);
    }

    #[test]
    fn test_primary_flap_cancels_switch_back() {
        let (clock, mock) = quanta::Clock::mock();
        let mut f = failover(true);
        f.carrier_changed(Secondary, true, clock.now());
        f.carrier_changed(Primary, true, clock.now());
        f.carrier_changed(Primary, false, clock.now());
        mock.increment(Duration::from_secs(11));
        assert_eq!(f.poll(clock.now()).change, None);
        assert_eq!(f.current(), Some(Secondary));
    }

    #[test]
    fn test_forced_failover_sticks_until_undone() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut f = failover(true);
        f.carrier_changed(Primary, true, clock.now());
        assert_eq!(f.force_failover(), None);

        f.carrier_changed(Secondary, true, clock.now());
        assert_eq!(f.force_failover(), change(Some(Primary), Some(Secondary)));
        assert!(f.is_forced());
        // A primary flap does not pull the traffic back.
        f.carrier_changed(Primary, false, clock.now());
        f.carrier_changed(Primary, true, clock.now());
        assert_eq!(f.current(), Some(Secondary));

        assert_eq!(f.unfailover(), change(Some(Secondary), Some(Primary)));
        assert!(!f.is_forced());
        assert_eq!(f.unfailover(), None);
    }

    #[test]
    fn test_forced_path_loss_clears_force() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut f = failover(false);
        f.carrier_changed(Primary, true, clock.now());
        f.carrier_changed(Secondary, true, clock.now());
        f.force_failover();
        assert_eq!(
            f.carrier_changed(Secondary, false, clock.now()),
            change(Some(Secondary), Some(Primary))
        );
        assert!(!f.is_forced());
    }

    #[test]
    fn test_connect_timeout() {
        let (clock, mock) = quanta::Clock::mock();
        let mut f = Failover::new(false, false, Duration::from_secs(10), Duration::from_secs(30));
        f.start(clock.now());
        assert_eq!(f.path(Secondary).timer(), NetpathTimer::Idle);

        mock.increment(Duration::from_secs(30));
        let polled = f.poll(clock.now());
        assert_eq!(polled.connect_timeouts, vec![Primary]);
        assert_eq!(polled.change, None);
        assert_eq!(f.next_deadline(), None);

        // A late connection still becomes current.
        assert_eq!(f.carrier_changed(Primary, true, clock.now()), change(None, Some(Primary)));
        assert_eq!(f.carrier_changed(Secondary, true, clock.now()), None);
    }
}
