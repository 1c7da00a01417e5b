use std::fmt;

/// Link state of a viport.
///
/// States are grouped into phases; see [`LinkState::phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum LinkState {
    Uninitialized,
    Initialize,
    InitializeControl,
    InitializeData,

    ControlConnect,
    ControlConnectWait,
    InitVnicReq,
    InitVnicRsp,

    BeginDataPath,
    ConfigDataPathReq,
    ConfigDataPathRsp,

    DataConnect,
    DataConnectWait,

    XchgPoolReq,
    XchgPoolRsp,
    Initialized,

    Idle,
    Idling,

    ConfigLinkReq,
    ConfigLinkRsp,
    ConfigAddrsReq,
    ConfigAddrsRsp,
    ReportStatReq,
    ReportStatRsp,
    HeartbeatReq,
    HeartbeatRsp,

    Reset,
    ResetRsp,
    ResetConfirm,
    DataDisconnect,
    ControlDisconnect,
    CleanupData,
    CleanupControl,
    Disconnected,
    RetryWait,
    Shutdown,
}

/// Phase of the link-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Phase {
    Init,
    ControlConnect,
    DataPathSetup,
    DataConnect,
    PoolExchange,
    SteadyState,
    Reconfig,
    Teardown,
}

impl LinkState {
    /// Every link state, in declaration order.
    pub const ALL: [LinkState; 36] = {
        use LinkState::*;
        [
            Uninitialized,
            Initialize,
            InitializeControl,
            InitializeData,
            ControlConnect,
            ControlConnectWait,
            InitVnicReq,
            InitVnicRsp,
            BeginDataPath,
            ConfigDataPathReq,
            ConfigDataPathRsp,
            DataConnect,
            DataConnectWait,
            XchgPoolReq,
            XchgPoolRsp,
            Initialized,
            Idle,
            Idling,
            ConfigLinkReq,
            ConfigLinkRsp,
            ConfigAddrsReq,
            ConfigAddrsRsp,
            ReportStatReq,
            ReportStatRsp,
            HeartbeatReq,
            HeartbeatRsp,
            Reset,
            ResetRsp,
            ResetConfirm,
            DataDisconnect,
            ControlDisconnect,
            CleanupData,
            CleanupControl,
            Disconnected,
            RetryWait,
            Shutdown,
        ]
    };

    /// Get the phase this state belongs to.
    pub fn phase(self) -> Phase {
        use LinkState::*;
        match self {
            Uninitialized | Initialize | InitializeControl | InitializeData => Phase::Init,
            ControlConnect | ControlConnectWait | InitVnicReq | InitVnicRsp => Phase::ControlConnect,
            BeginDataPath | ConfigDataPathReq | ConfigDataPathRsp => Phase::DataPathSetup,
            DataConnect | DataConnectWait => Phase::DataConnect,
            XchgPoolReq | XchgPoolRsp | Initialized => Phase::PoolExchange,
            Idle | Idling => Phase::SteadyState,
            ConfigLinkReq | ConfigLinkRsp | ConfigAddrsReq | ConfigAddrsRsp | ReportStatReq | ReportStatRsp
            | HeartbeatReq | HeartbeatRsp => Phase::Reconfig,
            Reset | ResetRsp | ResetConfirm | DataDisconnect | ControlDisconnect | CleanupData
            | CleanupControl | Disconnected | RetryWait | Shutdown => Phase::Teardown,
        }
    }

    /// Whether the state waits for a response of the control channel.
    pub fn awaits_response(self) -> bool {
        use LinkState::*;
        matches!(
            self,
            InitVnicRsp
                | ConfigDataPathRsp
                | XchgPoolRsp
                | ConfigLinkRsp
                | ConfigAddrsRsp
                | ReportStatRsp
                | HeartbeatRsp
                | ResetRsp
        )
    }

    /// Whether the data path is fully up in this state.
    pub fn is_up(self) -> bool {
        matches!(self.phase(), Phase::SteadyState | Phase::Reconfig)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Configuration changes waiting to be pushed to the EIOC.
#[derive(Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct UpdateFlags(u8);

impl UpdateFlags {
    pub const LINK_CONFIG: Self = Self(0x01);
    pub const ADDRESS_CONFIG: Self = Self(0x02);
    pub const STATS: Self = Self(0x04);
    pub const HEARTBEAT: Self = Self(0x08);
}

impl_flag_set!(UpdateFlags, u8);

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_state_table_is_complete() {
        let unique: HashSet<_> = LinkState::ALL.iter().collect();
        assert_eq!(unique.len(), LinkState::ALL.len());
        assert_eq!(
            LinkState::ALL.iter().filter(|s| s.phase() == Phase::Reconfig).count(),
            8
        );
        assert!(LinkState::Idling.is_up());
        assert!(!LinkState::Initialized.is_up());
    }
}
