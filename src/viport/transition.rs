//! The link-state transition function.
//!
//! [`transition`] is pure: it maps a state, an event and a snapshot of the
//! viport's flags to the next state plus the effects the worker must apply.
//! The worker applies the effects and steps again until the state stops
//! changing.

use std::time::Duration;

use super::state::{LinkState, Phase, UpdateFlags};
use crate::control::wire::{Command, Response};
use crate::transport::ChannelKind;

/// Input of one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Re-evaluate the current state.
    Step,
    /// A connection was established.
    Connected(ChannelKind),
    /// The outstanding control request completed.
    Response(Response),
    /// The reconnect delay ran out.
    RetryExpired,
    /// Reconnect an abandoned path on request.
    Reconnect,
}

/// What a transition may look at besides the state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct View {
    /// A failure was observed since the flag was last cleared.
    pub errored: bool,
    /// The owner wants the viport torn down.
    pub disconnect: bool,
    /// Pending configuration pushes.
    pub updates: UpdateFlags,
    /// Delay of the next reconnect, `None` when over the retry budget.
    pub retry_delay: Option<Duration>,
    /// The control connection can still carry a `Reset` request.
    pub control_usable: bool,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    AllocControl,
    AllocData,
    ConnectControl,
    ConnectData,

    SendInitVnic,
    SendConfigDataPath,
    SendExchangePools,
    SendConfigLink,
    SendConfigAddrs,
    SendReportStats,
    SendHeartbeat,
    SendReset,
    /// Take the negotiated values out of a response.
    Absorb(Response),

    /// Data path is up; report carrier.
    MarkConnected,
    /// Data path is going down; report loss of carrier.
    MarkDisconnected,
    StartMulticast,
    StopMulticast,
    StartHeartbeatTimer,
    StartRetryTimer(Duration),
    ResetBackoff,

    DisconnectData,
    DisconnectControl,
    CleanupData,
    CleanupControl,
    FreeAddressTable,

    ClearErrored,
    SetUpdate(UpdateFlags),
    ClearUpdate(UpdateFlags),
    /// The retry budget is spent; stop reconnecting.
    Abandon,
    /// Teardown finished; wake whoever waits for it.
    SignalReleased,
    /// A response that the state did not expect.
    ProtocolError { state: LinkState, cmd: Command },
}

/// Result of one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: LinkState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: LinkState) -> Self {
        Self {
            next,
            effects: Vec::new(),
        }
    }

    fn with(next: LinkState, effects: impl IntoIterator<Item = Effect>) -> Self {
        Self {
            next,
            effects: effects.into_iter().collect(),
        }
    }
}

/// Where a failure observed in `state` leads.
fn error_target(state: LinkState) -> LinkState {
    use LinkState::*;
    match state.phase() {
        // Nothing is connected yet; release whatever was allocated.
        Phase::Init => CleanupData,
        // The control connection may be half open; nothing to reset remotely.
        Phase::ControlConnect => ControlDisconnect,
        _ => Reset,
    }
}

/// The response each waiting state expects, and the state after it.
fn expected_response(state: LinkState) -> Option<(Command, LinkState)> {
    use LinkState::*;
    Some(match state {
        InitVnicRsp => (Command::InitVnic, BeginDataPath),
        ConfigDataPathRsp => (Command::ConfigDataPath, DataConnect),
        XchgPoolRsp => (Command::ExchangePools, Initialized),
        ConfigLinkRsp => (Command::ConfigLink, Idle),
        ReportStatRsp => (Command::ReportStatistics, Idle),
        HeartbeatRsp => (Command::Heartbeat, Idle),
        ResetRsp => (Command::Reset, ResetConfirm),
        _ => return None,
    })
}

/// Compute the next state of a viport.
pub fn transition(state: LinkState, event: &Event, view: &View) -> Transition {
    use LinkState::*;

    // A response is consumed by the state waiting for it, whatever else
    // is going on.
    if let Event::Response(rsp) = event {
        return on_response(state, rsp);
    }

    let failing = view.errored || view.disconnect;
    let errored_in = |s: LinkState| failing && !matches!(s.phase(), Phase::Teardown) && s != Uninitialized;
    if errored_in(state) {
        // Idling only wakes up; Idle makes the jump.
        return if state == Idling {
            Transition::to(Idle)
        } else {
            Transition::to(error_target(state))
        };
    }

    match (state, event) {
        (Uninitialized, _) if view.disconnect => Transition::with(Uninitialized, [Effect::SignalReleased]),
        (Uninitialized, _) => Transition::to(Initialize),
        (Initialize, _) => Transition::with(InitializeControl, [Effect::ClearErrored]),
        (InitializeControl, _) => Transition::with(InitializeData, [Effect::AllocControl]),
        (InitializeData, _) => Transition::with(ControlConnect, [Effect::AllocData]),

        (ControlConnect, _) => Transition::with(ControlConnectWait, [Effect::ConnectControl]),
        (ControlConnectWait, Event::Connected(ChannelKind::Control)) => Transition::to(InitVnicReq),
        (InitVnicReq, _) => Transition::with(InitVnicRsp, [Effect::SendInitVnic]),

        (BeginDataPath, _) => Transition::to(ConfigDataPathReq),
        (ConfigDataPathReq, _) => Transition::with(ConfigDataPathRsp, [Effect::SendConfigDataPath]),

        (DataConnect, _) => Transition::with(DataConnectWait, [Effect::ConnectData]),
        (DataConnectWait, Event::Connected(ChannelKind::Data)) => Transition::to(XchgPoolReq),

        (XchgPoolReq, _) => Transition::with(XchgPoolRsp, [Effect::SendExchangePools]),
        (Initialized, _) => Transition::with(
            Idle,
            [
                Effect::MarkConnected,
                Effect::ResetBackoff,
                Effect::SetUpdate(UpdateFlags::LINK_CONFIG | UpdateFlags::ADDRESS_CONFIG),
                Effect::StartHeartbeatTimer,
                Effect::StartMulticast,
            ],
        ),

        (Idle, _) => {
            let u = view.updates;
            if u.contains(UpdateFlags::LINK_CONFIG) {
                Transition::to(ConfigLinkReq)
            } else if u.contains(UpdateFlags::ADDRESS_CONFIG) {
                Transition::to(ConfigAddrsReq)
            } else if u.contains(UpdateFlags::STATS) {
                Transition::to(ReportStatReq)
            } else if u.contains(UpdateFlags::HEARTBEAT) {
                Transition::to(HeartbeatReq)
            } else {
                Transition::to(Idling)
            }
        }
        (Idling, _) if !view.updates.is_empty() => Transition::to(Idle),

        (ConfigLinkReq, _) => send(ConfigLinkRsp, UpdateFlags::LINK_CONFIG, Effect::SendConfigLink),
        (ConfigAddrsReq, _) => send(ConfigAddrsRsp, UpdateFlags::ADDRESS_CONFIG, Effect::SendConfigAddrs),
        (ReportStatReq, _) => send(ReportStatRsp, UpdateFlags::STATS, Effect::SendReportStats),
        (HeartbeatReq, _) => send(HeartbeatRsp, UpdateFlags::HEARTBEAT, Effect::SendHeartbeat),

        (Reset, _) if view.control_usable => Transition::with(
            ResetRsp,
            [Effect::MarkDisconnected, Effect::StopMulticast, Effect::ClearErrored, Effect::SendReset],
        ),
        (Reset, _) => Transition::with(
            DataDisconnect,
            [Effect::MarkDisconnected, Effect::StopMulticast, Effect::ClearErrored],
        ),
        // The EIOC may never answer; a failure of the reset request ends
        // the wait as well.
        (ResetRsp, _) if view.errored => Transition::to(ResetConfirm),
        (ResetConfirm, _) => Transition::with(DataDisconnect, [Effect::ClearErrored]),
        (DataDisconnect, _) => Transition::with(ControlDisconnect, [Effect::DisconnectData]),
        (ControlDisconnect, _) => Transition::with(CleanupData, [Effect::DisconnectControl]),
        (CleanupData, _) => Transition::with(CleanupControl, [Effect::CleanupData]),
        (CleanupControl, _) => Transition::with(
            Disconnected,
            [Effect::CleanupControl, Effect::FreeAddressTable, Effect::ClearErrored],
        ),

        (Disconnected, _) if view.disconnect => Transition::to(Shutdown),
        (Disconnected, _) => match view.retry_delay {
            Some(delay) => Transition::with(RetryWait, [Effect::StartRetryTimer(delay)]),
            None => Transition::with(RetryWait, [Effect::Abandon]),
        },
        (RetryWait, _) if view.disconnect => Transition::to(Shutdown),
        (RetryWait, Event::RetryExpired) => Transition::to(Initialize),
        (RetryWait, Event::Reconnect) => Transition::with(Initialize, [Effect::ResetBackoff]),
        (Shutdown, _) => Transition::with(Uninitialized, [Effect::SignalReleased]),

        // Waiting for an event that has not come.
        _ => Transition::to(state),
    }
}

fn send(next: LinkState, update: UpdateFlags, effect: Effect) -> Transition {
    // The flag is cleared first so a change made while the request is out
    // triggers another one.
    Transition::with(next, [Effect::ClearUpdate(update), effect])
}

fn on_response(state: LinkState, rsp: &Response) -> Transition {
    let cmd = rsp.command();
    let accepted = match (state, expected_response(state)) {
        (LinkState::ConfigAddrsRsp, _) => {
            matches!(cmd, Command::ConfigAddresses | Command::ConfigAddresses2).then_some(LinkState::Idle)
        }
        (_, Some((expected, next))) if expected == cmd => Some(next),
        _ => None,
    };
    match accepted {
        Some(next) if state == LinkState::HeartbeatRsp => {
            Transition::with(next, [Effect::Absorb(rsp.clone()), Effect::StartHeartbeatTimer])
        }
        Some(next) if state == LinkState::ResetRsp => Transition::to(next),
        Some(next) => Transition::with(next, [Effect::Absorb(rsp.clone())]),
        None => Transition::with(error_target(state), [Effect::ProtocolError { state, cmd }]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::wire::*;
    use crate::control::wire::InitVnicRsp;
    use crate::transport::Gid;
    use LinkState::*;

    /// Step until the state stops changing, collecting every effect.
    fn settle(mut state: LinkState, view: &View) -> (LinkState, Vec<Effect>) {
        let mut effects = Vec::new();
        loop {
            let t = transition(state, &Event::Step, view);
            if t.next == state {
                return (state, effects);
            }
            effects.extend(t.effects);
            state = t.next;
        }
    }

    fn init_rsp() -> Response {
        Response::InitVnic(InitVnicRsp {
            version: PROTOCOL_VERSION,
            num_data_paths: 1,
            num_address_entries: 16,
            features: Features::EMPTY,
            lan_switch: LanSwitch::default(),
            mgid: Gid::ZERO,
        })
    }

    fn pools_rsp() -> Response {
        Response::ExchangePools(ExchangePools {
            path_id: 0,
            pool_rkey: 1,
            pool_addr: 0x1000,
        })
    }

    fn dp_rsp() -> Response {
        Response::ConfigDataPath(ConfigDataPath {
            path_id: 0,
            host: RecvPoolConfig::default(),
            eioc: RecvPoolConfig::default(),
        })
    }

    #[test]
    fn test_happy_path_to_idle() {
        let view = View::default();
        let (s, fx) = settle(Uninitialized, &view);
        assert_eq!(s, ControlConnectWait);
        assert_eq!(
            fx,
            vec![
                Effect::ClearErrored,
                Effect::AllocControl,
                Effect::AllocData,
                Effect::ConnectControl
            ]
        );

        let t = transition(s, &Event::Connected(ChannelKind::Control), &view);
        let (s, fx) = settle(t.next, &view);
        assert_eq!((s, fx), (InitVnicRsp, vec![Effect::SendInitVnic]));

        let t = transition(s, &Event::Response(init_rsp()), &view);
        assert_eq!(t.effects, vec![Effect::Absorb(init_rsp())]);
        let (s, fx) = settle(t.next, &view);
        assert_eq!((s, fx), (ConfigDataPathRsp, vec![Effect::SendConfigDataPath]));

        let t = transition(s, &Event::Response(dp_rsp()), &view);
        let (s, fx) = settle(t.next, &view);
        assert_eq!((s, fx), (DataConnectWait, vec![Effect::ConnectData]));

        // A control-connect event is not what DataConnectWait waits for.
        assert_eq!(transition(s, &Event::Connected(ChannelKind::Control), &view).next, s);
        let t = transition(s, &Event::Connected(ChannelKind::Data), &view);
        let (s, _) = settle(t.next, &view);
        assert_eq!(s, XchgPoolRsp);

        let t = transition(s, &Event::Response(pools_rsp()), &view);
        assert_eq!(t.next, Initialized);
        let t = transition(Initialized, &Event::Step, &view);
        assert_eq!(t.next, Idle);
        assert!(t.effects.contains(&Effect::MarkConnected));
        assert!(t.effects.contains(&Effect::SetUpdate(
            UpdateFlags::LINK_CONFIG | UpdateFlags::ADDRESS_CONFIG
        )));
    }

    #[test]
    fn test_idle_dispatch_order() {
        let view = View {
            updates: UpdateFlags::HEARTBEAT | UpdateFlags::STATS | UpdateFlags::ADDRESS_CONFIG,
            ..Default::default()
        };
        assert_eq!(transition(Idle, &Event::Step, &view).next, ConfigAddrsReq);
        let t = transition(ConfigAddrsReq, &Event::Step, &view);
        assert_eq!(t.next, ConfigAddrsRsp);
        assert_eq!(
            t.effects,
            vec![
                Effect::ClearUpdate(UpdateFlags::ADDRESS_CONFIG),
                Effect::SendConfigAddrs
            ]
        );

        let view = View {
            updates: UpdateFlags::HEARTBEAT | UpdateFlags::STATS,
            ..Default::default()
        };
        assert_eq!(transition(Idle, &Event::Step, &view).next, ReportStatReq);

        let idle = View::default();
        assert_eq!(transition(Idle, &Event::Step, &idle).next, Idling);
        assert_eq!(transition(Idling, &Event::Step, &idle).next, Idling);
        assert_eq!(transition(Idling, &Event::Step, &view).next, Idle);
    }

    #[test]
    fn test_errors_route_by_phase() {
        let view = View {
            errored: true,
            ..Default::default()
        };
        assert_eq!(transition(InitializeData, &Event::Step, &view).next, CleanupData);
        assert_eq!(transition(ControlConnectWait, &Event::Step, &view).next, ControlDisconnect);
        assert_eq!(transition(InitVnicRsp, &Event::Step, &view).next, ControlDisconnect);
        assert_eq!(transition(DataConnectWait, &Event::Step, &view).next, Reset);
        assert_eq!(transition(HeartbeatRsp, &Event::Step, &view).next, Reset);
        assert_eq!(transition(Idling, &Event::Step, &view).next, Idle);
        assert_eq!(transition(Idle, &Event::Step, &view).next, Reset);
    }

    #[test]
    fn test_unexpected_response_is_protocol_error() {
        let t = transition(ConfigLinkRsp, &Event::Response(Response::Reset), &View::default());
        assert_eq!(t.next, Reset);
        assert_eq!(
            t.effects,
            vec![Effect::ProtocolError {
                state: ConfigLinkRsp,
                cmd: Command::Reset
            }]
        );
    }

    #[test]
    fn test_reset_sequence_retries() {
        let view = View {
            errored: true,
            control_usable: true,
            retry_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let t = transition(Idle, &Event::Step, &view);
        let t = transition(t.next, &Event::Step, &view);
        assert_eq!(t.next, ResetRsp);
        assert!(t.effects.contains(&Effect::SendReset));
        assert!(t.effects.contains(&Effect::MarkDisconnected));

        let cleared = View {
            errored: false,
            ..view
        };
        assert_eq!(transition(ResetRsp, &Event::Step, &cleared).next, ResetRsp);
        let t = transition(ResetRsp, &Event::Response(Response::Reset), &cleared);
        let (s, fx) = settle(t.next, &cleared);
        assert_eq!(s, RetryWait);
        assert_eq!(
            fx,
            vec![
                Effect::ClearErrored,
                Effect::DisconnectData,
                Effect::DisconnectControl,
                Effect::CleanupData,
                Effect::CleanupControl,
                Effect::FreeAddressTable,
                Effect::ClearErrored,
                Effect::StartRetryTimer(Duration::from_secs(5)),
            ]
        );
        assert_eq!(transition(RetryWait, &Event::RetryExpired, &cleared).next, Initialize);
    }

    #[test]
    fn test_reset_without_control_skips_request() {
        let view = View {
            errored: true,
            ..Default::default()
        };
        let t = transition(Reset, &Event::Step, &view);
        assert_eq!(t.next, DataDisconnect);
        assert!(!t.effects.contains(&Effect::SendReset));
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let view = View::default();
        let t = transition(Disconnected, &Event::Step, &view);
        assert_eq!(t, Transition::with(RetryWait, [Effect::Abandon]));
        assert_eq!(transition(RetryWait, &Event::Step, &view).next, RetryWait);
        let t = transition(RetryWait, &Event::Reconnect, &view);
        assert_eq!(t, Transition::with(Initialize, [Effect::ResetBackoff]));
    }

    #[test]
    fn test_disconnect_releases() {
        let view = View {
            disconnect: true,
            ..Default::default()
        };
        assert_eq!(transition(Idling, &Event::Step, &view).next, Idle);
        assert_eq!(transition(Idle, &Event::Step, &view).next, Reset);
        let (s, fx) = settle(Disconnected, &view);
        assert_eq!(s, Uninitialized);
        assert_eq!(fx, vec![Effect::SignalReleased]);
        let (s, _) = settle(RetryWait, &view);
        assert_eq!(s, Uninitialized);
    }
}
