//! Engine configuration.
//!
//! Everything is `serde`-deserializable with defaults for every field, so a
//! TOML file only needs to name what it changes:
//!
//! ```toml
//! completion_burst_limit = 64
//!
//! [data]
//! notify_bundle = 8
//!
//! [[vnic]]
//! name = "ib-eth0"
//! prefer_primary = true
//! primary = { dgid = "fe80::2:c903:a:1f31" }
//! secondary = { dgid = "fe80::2:c903:a:1f32" }
//! ```

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::wire::Features;
use crate::data::TRAILER_SIZE;
use crate::transport::Gid;

/// Ethernet header with an 802.1Q tag.
pub(crate) const VLAN_ETH_HLEN: u32 = 18;

/// Pattern interface names must match.
const IFNAME_PATTERN: &str = r"^[A-Za-z][A-Za-z0-9_.\-]{0,14}$";

/// Configuration loading error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid TOML or does not match the schema.
    #[error("malformed configuration")]
    Parse(#[from] toml::de::Error),

    /// A field holds a value outside its allowed range.
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn check_bounds(field: &'static str, min: u32, val: u32, max: u32) -> Result<(), ConfigError> {
    if min == 0 || min > val || val > max {
        return Err(invalid(
            field,
            format!("need 0 < min ({}) <= value ({}) <= max ({})", min, val, max),
        ));
    }
    Ok(())
}

/// Control-channel parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Time the EIOC has to answer one request.
    pub rsp_timeout_ms: u64,
    /// Receive buffers kept posted on the control connection.
    pub recv_depth: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            rsp_timeout_ms: 1000,
            recv_depth: 4,
        }
    }
}

impl ControlConfig {
    #[inline]
    pub fn rsp_timeout(&self) -> Duration {
        Duration::from_millis(self.rsp_timeout_ms)
    }
}

/// Data-path and buffer-pool parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Every `notify_bundle`-th transmit is signaled; twice this many local
    /// transmit buffers are allocated.
    pub notify_bundle: u32,

    /// Receive buffers the host asks for.
    pub host_recv_pool_entries: u32,
    pub host_recv_pool_entries_min: u32,
    pub host_recv_pool_entries_max: u32,

    /// Receive buffers the EIOC is asked to provide.
    pub eioc_recv_pool_entries: u32,
    pub eioc_recv_pool_entries_min: u32,
    pub eioc_recv_pool_entries_max: u32,

    /// Size of one host receive buffer, trailer included.
    pub recv_buf_size: u32,
    /// Smallest EIOC receive buffer the host accepts.
    pub eioc_buf_size_min: u32,

    /// Kick thresholds the host asks the EIOC to honor when writing to it.
    pub timeout_before_kick_us: u32,
    pub entries_before_kick: u32,
    pub bytes_before_kick: u32,

    /// Free host receive buffers republished in one bundle.
    pub free_entries_per_update: u32,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            notify_bundle: 5,
            host_recv_pool_entries: 512,
            host_recv_pool_entries_min: 64,
            host_recv_pool_entries_max: 1024,
            eioc_recv_pool_entries: 512,
            eioc_recv_pool_entries_min: 64,
            eioc_recv_pool_entries_max: 1024,
            recv_buf_size: 2048,
            eioc_buf_size_min: 1024,
            timeout_before_kick_us: 50,
            entries_before_kick: 10,
            bytes_before_kick: 16 * 1024,
            free_entries_per_update: 16,
        }
    }
}

impl DataConfig {
    /// Largest MTU the host receive buffers can carry.
    #[inline]
    pub fn max_mtu(&self) -> u32 {
        self.recv_buf_size
            .saturating_sub(TRAILER_SIZE as u32 + VLAN_ETH_HLEN)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.notify_bundle == 0 {
            return Err(invalid("data.notify_bundle", "must be non-zero"));
        }
        check_bounds(
            "data.host_recv_pool_entries",
            self.host_recv_pool_entries_min,
            self.host_recv_pool_entries,
            self.host_recv_pool_entries_max,
        )?;
        check_bounds(
            "data.eioc_recv_pool_entries",
            self.eioc_recv_pool_entries_min,
            self.eioc_recv_pool_entries,
            self.eioc_recv_pool_entries_max,
        )?;
        if self.free_entries_per_update == 0
            || self.free_entries_per_update > self.host_recv_pool_entries_min
        {
            return Err(invalid(
                "data.free_entries_per_update",
                "must be non-zero and fit in the smallest host pool",
            ));
        }
        if self.recv_buf_size % 8 != 0 || self.max_mtu() < 576 {
            return Err(invalid(
                "data.recv_buf_size",
                "must be 8-byte aligned and hold at least a 576-byte frame",
            ));
        }
        Ok(())
    }
}

/// Link-state machine parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViportConfig {
    /// Idle time between heartbeat requests.
    pub heartbeat_interval_ms: u64,
    /// Reconnect delay grows by this much per attempt.
    pub retry_step_ms: u64,
    /// Reconnect delay ceiling.
    pub retry_max_delay_ms: u64,
    /// Cumulative reconnect delay after which a path is abandoned.
    pub retry_total_ms: u64,
    /// Address-table entries asked for in `InitVnic`.
    pub address_entries: u16,
    /// Offload checksums in both directions when the EIOC supports it.
    pub checksum_offload: bool,
    /// Ask the EIOC to fan inbound multicast out through an IB group.
    pub inbound_multicast: bool,
}

impl Default for ViportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2000,
            retry_step_ms: 5000,
            retry_max_delay_ms: 20_000,
            retry_total_ms: 600_000,
            address_entries: 16,
            checksum_offload: true,
            inbound_multicast: true,
        }
    }
}

impl ViportConfig {
    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Features the host asks for in `InitVnic`.
    pub fn requested_features(&self) -> Features {
        let mut features = Features::PF_KICK | Features::IGNORE_VLAN | Features::RDMA_IMMED;
        if self.checksum_offload {
            features |= Features::RX_CSUM | Features::TX_CSUM;
        }
        if self.inbound_multicast {
            features |= Features::INBOUND_IB_MC;
        }
        features
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_step_ms == 0 || self.retry_step_ms > self.retry_max_delay_ms {
            return Err(invalid(
                "viport.retry_step_ms",
                "must be non-zero and not above retry_max_delay_ms",
            ));
        }
        if self.address_entries < 2 {
            return Err(invalid(
                "viport.address_entries",
                "broadcast and unicast slots need at least 2",
            ));
        }
        Ok(())
    }
}

/// Inbound multicast parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McConfig {
    /// Join attempts after the first failure before giving up.
    pub max_retries: u32,
    /// Delay before a join is retried.
    pub retry_delay_ms: u64,
    /// Largest MTU for which multicast fan-out is used.
    pub mtu_threshold: u32,
}

impl Default for McConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 1000,
            // 2048-byte IB MTU minus GRH, trailer and tagged Ethernet header.
            mtu_threshold: 2048 - 40 - TRAILER_SIZE as u32 - VLAN_ETH_HLEN,
        }
    }
}

impl McConfig {
    #[inline]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Where one network path terminates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Port GID of the EIOC.
    pub dgid: Gid,
    /// Service ID of the EIOC control endpoint.
    pub control_service_id: u64,
    /// Service ID of the EIOC data endpoint.
    pub data_service_id: u64,
    /// VNIC instance number on the EIOC.
    pub instance: u8,
}

/// One virtual interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VnicConfig {
    /// Interface name.
    pub name: String,
    /// Switch back to the primary path once it has been up for
    /// `switch_back_delay_ms`.
    pub prefer_primary: bool,
    pub switch_back_delay_ms: u64,
    /// Time each path has to come up before the other one is preferred.
    pub connect_timeout_ms: u64,
    /// Initial MTU.
    pub mtu: u16,
    pub primary: PathConfig,
    pub secondary: Option<PathConfig>,
}

impl Default for VnicConfig {
    fn default() -> Self {
        Self {
            name: "vnic0".into(),
            prefer_primary: false,
            switch_back_delay_ms: 10_000,
            connect_timeout_ms: 10_000,
            mtu: 1500,
            primary: PathConfig::default(),
            secondary: None,
        }
    }
}

impl VnicConfig {
    #[inline]
    pub fn switch_back_delay(&self) -> Duration {
        Duration::from_millis(self.switch_back_delay_ms)
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check this interface against the engine configuration.
    pub fn validate(&self, driver: &DriverConfig) -> Result<(), ConfigError> {
        let re = Regex::new(IFNAME_PATTERN).map_err(|e| invalid("vnic.name", e.to_string()))?;
        if !re.is_match(&self.name) {
            return Err(invalid(
                "vnic.name",
                format!("`{}` does not match {}", self.name, IFNAME_PATTERN),
            ));
        }
        if self.mtu < 576 || self.mtu as u32 > driver.data.max_mtu() {
            return Err(invalid(
                "vnic.mtu",
                format!("{} outside 576..={}", self.mtu, driver.data.max_mtu()),
            ));
        }
        if self.secondary.as_ref() == Some(&self.primary) {
            return Err(invalid("vnic.secondary", "same EIOC as the primary path"));
        }
        Ok(())
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Completions handled inline per notification before the rest of the
    /// burst is deferred to the helper loop.
    pub completion_burst_limit: usize,
    pub control: ControlConfig,
    pub data: DataConfig,
    pub viport: ViportConfig,
    pub multicast: McConfig,
    /// Interfaces to create at startup.
    #[serde(rename = "vnic")]
    pub vnics: Vec<VnicConfig>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            completion_burst_limit: 32,
            control: ControlConfig::default(),
            data: DataConfig::default(),
            viport: ViportConfig::default(),
            multicast: McConfig::default(),
            vnics: Vec::new(),
        }
    }
}

impl DriverConfig {
    /// Parse and validate a TOML configuration.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML configuration file.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.completion_burst_limit == 0 {
            return Err(invalid("completion_burst_limit", "must be non-zero"));
        }
        if self.control.recv_depth == 0 {
            return Err(invalid("control.recv_depth", "must be non-zero"));
        }
        self.data.validate()?;
        self.viport.validate()?;
        for vnic in &self.vnics {
            vnic.validate(self)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DriverConfig::default();
        config.validate().unwrap();
        assert!(config.data.max_mtu() >= 1500);
        assert_eq!(config.multicast.mtu_threshold, 1958);
    }

    #[test]
    fn test_load_partial_toml() -> anyhow::Result<()> {
        let config = DriverConfig::from_toml_str(
            r#"
            [data]
            notify_bundle = 8

            [[vnic]]
            name = "ib-eth0"
            prefer_primary = true
            primary = { dgid = "fe80::1", instance = 1 }
            secondary = { dgid = "fe80::2", instance = 1 }
            "#,
        )?;
        assert_eq!(config.completion_burst_limit, 32);
        assert_eq!(config.data.notify_bundle, 8);
        assert_eq!(config.data.host_recv_pool_entries, 512);
        assert_eq!(config.vnics.len(), 1);
        assert!(config.vnics[0].prefer_primary);
        assert_eq!(config.vnics[0].primary.instance, 1);
        assert!(config.vnics[0].secondary.is_some());
        Ok(())
    }

    #[test]
    fn test_bad_values_rejected() {
        let err = DriverConfig::from_toml_str(
            r#"
            [data]
            host_recv_pool_entries = 2000
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "data.host_recv_pool_entries",
                ..
            }
        ));

        let err = DriverConfig::from_toml_str(
            r#"
            [[vnic]]
            name = "0bad name"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "vnic.name", .. }));

        assert!(matches!(
            DriverConfig::from_toml_str("data = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
