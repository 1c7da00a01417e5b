//! Control-channel wire format.
//!
//! Every control message is a fixed 256-byte packet: an 8-byte header
//! followed by a command-specific body. Integers are big-endian.

use thiserror::Error;

use crate::transport::Gid;
use crate::utils::wire::{Reader, Truncated, Writer};

/// Size of every control packet on the wire.
pub const CONTROL_PACKET_SIZE: usize = 256;

/// Size of the packet header.
pub const HEADER_SIZE: usize = 8;

/// Size of the command body.
pub const BODY_SIZE: usize = CONTROL_PACKET_SIZE - HEADER_SIZE;

/// Protocol version spoken by this engine, `major << 8 | minor`.
pub const PROTOCOL_VERSION: u16 = 0x0101;

/// Size of one address operation without a multicast GID.
const ADDRESS_OP_SIZE: usize = 12;

/// Size of one address operation carrying a multicast GID.
const ADDRESS2_OP_SIZE: usize = ADDRESS_OP_SIZE + 16;

/// Address operations that fit in one `ConfigAddresses` packet.
pub const MAX_ADDRESS_OPS: usize = (BODY_SIZE - 2) / ADDRESS_OP_SIZE;

/// Address operations that fit in one `ConfigAddresses2` packet.
pub const MAX_ADDRESS2_OPS: usize = (BODY_SIZE - 2) / ADDRESS2_OP_SIZE;

/// Status number reported by the EIOC when its Ethernet link comes up.
pub const STATUS_LINK_UP: u32 = 1;

/// Status number reported by the EIOC when its Ethernet link goes down.
pub const STATUS_LINK_DOWN: u32 = 2;

/// Control wire format error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The packet is shorter than its layout requires.
    #[error("truncated packet: {needed} bytes needed, {available} available")]
    Truncated { needed: usize, available: usize },

    /// Unknown packet type in the header.
    #[error("unknown packet type {0:#04x}")]
    BadPacketType(u8),

    /// Unknown command code in the header.
    #[error("unknown command {0}")]
    BadCommand(u8),

    /// A packet type/command combination that the protocol does not define.
    #[error("unexpected {ty:?} packet for command {cmd:?}")]
    Unexpected { ty: PacketType, cmd: Command },

    /// An address list longer than a packet can hold.
    #[error("{count} address operations do not fit in one packet (max {max})")]
    TooManyOps { count: usize, max: usize },
}

impl From<Truncated> for WireError {
    fn from(t: Truncated) -> Self {
        Self::Truncated {
            needed: t.needed,
            available: t.available,
        }
    }
}

/// Control packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Unsolicited informational report.
    Info = 0x01,
    /// Host-to-EIOC request.
    Request = 0x02,
    /// Successful response to a request.
    Response = 0x04,
    /// Unsolicited error report, or a failed response to a request.
    Error = 0x08,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, WireError> {
        match v {
            0x01 => Ok(Self::Info),
            0x02 => Ok(Self::Request),
            0x04 => Ok(Self::Response),
            0x08 => Ok(Self::Error),
            _ => Err(WireError::BadPacketType(v)),
        }
    }
}

/// Control command code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(u8)]
pub enum Command {
    InitVnic = 1,
    ConfigDataPath = 2,
    ExchangePools = 3,
    ConfigLink = 4,
    ConfigAddresses = 5,
    ReportStatistics = 6,
    Reset = 7,
    ReportStatus = 8,
    Heartbeat = 9,
    ConfigAddresses2 = 10,
}

impl TryFrom<u8> for Command {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            1 => Self::InitVnic,
            2 => Self::ConfigDataPath,
            3 => Self::ExchangePools,
            4 => Self::ConfigLink,
            5 => Self::ConfigAddresses,
            6 => Self::ReportStatistics,
            7 => Self::Reset,
            8 => Self::ReportStatus,
            9 => Self::Heartbeat,
            10 => Self::ConfigAddresses2,
            _ => return Err(WireError::BadCommand(v)),
        })
    }
}

/// Control packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub pkt_type: PacketType,
    pub cmd: Command,
    pub seq: u8,
    pub retry: u8,
}

impl Header {
    fn write(&self, w: &mut Writer) {
        w.put_u8(self.pkt_type as u8)
            .put_u8(self.cmd as u8)
            .put_u8(self.seq)
            .put_u8(self.retry)
            .skip(4);
    }

    fn read(r: &mut Reader) -> Result<Self, WireError> {
        let pkt_type = PacketType::try_from(r.u8()?)?;
        let cmd = Command::try_from(r.u8()?)?;
        let seq = r.u8()?;
        let retry = r.u8()?;
        r.skip(4)?;
        Ok(Self {
            pkt_type,
            cmd,
            seq,
            retry,
        })
    }
}

/// Capability bits negotiated with the EIOC.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Features(u32);

impl Features {
    pub const IPV4_CSUM_RX: Self = Self(0x0000_0001);
    pub const IPV6_CSUM_RX: Self = Self(0x0000_0002);
    pub const TCP_CSUM_RX: Self = Self(0x0000_0004);
    pub const UDP_CSUM_RX: Self = Self(0x0000_0008);
    pub const IPV4_CSUM_TX: Self = Self(0x0000_0010);
    pub const IPV6_CSUM_TX: Self = Self(0x0000_0020);
    pub const TCP_CSUM_TX: Self = Self(0x0000_0040);
    pub const UDP_CSUM_TX: Self = Self(0x0000_0080);
    pub const TCP_SEGMENT: Self = Self(0x0000_0100);
    pub const FCS_PROPAGATE: Self = Self(0x0000_0800);
    pub const PF_KICK: Self = Self(0x0000_1000);
    pub const PF_FORCE_ROUTE: Self = Self(0x0000_2000);
    pub const CHASH_OFFLOAD: Self = Self(0x0000_4000);
    pub const RDMA_IMMED: Self = Self(0x0000_8000);
    pub const IGNORE_VLAN: Self = Self(0x0001_0000);
    pub const INBOUND_IB_MC: Self = Self(0x0020_0000);

    /// Every checksum offload bit in the receive direction.
    pub const RX_CSUM: Self = Self(0x0000_000f);

    /// Every checksum offload bit in the transmit direction.
    pub const TX_CSUM: Self = Self(0x0000_00f0);
}

impl_flag_set!(Features, u32);

/// `ConfigLink` command flags.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkFlags(u8);

impl LinkFlags {
    pub const ENABLE_NIC: Self = Self(0x01);
    pub const DISABLE_NIC: Self = Self(0x02);
    pub const ENABLE_MCAST_ALL: Self = Self(0x04);
    pub const DISABLE_MCAST_ALL: Self = Self(0x08);
    pub const ENABLE_PROMISC: Self = Self(0x10);
    pub const DISABLE_PROMISC: Self = Self(0x20);
    pub const SET_MTU: Self = Self(0x40);
}

impl_flag_set!(LinkFlags, u8);

/// LAN switch description returned by `InitVnic`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LanSwitch {
    pub num: u8,
    pub num_enet_ports: u8,
    pub default_vlan: u16,
    pub hw_mac: [u8; 6],
}

/// `InitVnic` request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitVnicReq {
    pub version: u16,
    pub instance: u8,
    pub num_data_paths: u8,
    pub num_address_entries: u16,
    pub features: Features,
}

impl InitVnicReq {
    fn write(&self, w: &mut Writer) {
        w.put_u16(self.version)
            .put_u8(self.instance)
            .put_u8(self.num_data_paths)
            .put_u16(self.num_address_entries)
            .skip(2)
            .put_u32(self.features.bits());
    }

    fn read(r: &mut Reader) -> Result<Self, WireError> {
        let version = r.u16()?;
        let instance = r.u8()?;
        let num_data_paths = r.u8()?;
        let num_address_entries = r.u16()?;
        r.skip(2)?;
        let features = Features::from_bits(r.u32()?);
        Ok(Self {
            version,
            instance,
            num_data_paths,
            num_address_entries,
            features,
        })
    }
}

/// `InitVnic` response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitVnicRsp {
    pub version: u16,
    pub num_data_paths: u8,
    pub num_address_entries: u16,
    pub features: Features,
    pub lan_switch: LanSwitch,
    /// Group the EIOC fans inbound multicast out to, or [`Gid::ZERO`].
    pub mgid: Gid,
}

impl InitVnicRsp {
    fn write(&self, w: &mut Writer) {
        w.put_u16(self.version)
            .put_u8(self.num_data_paths)
            .skip(1)
            .put_u16(self.num_address_entries)
            .skip(2)
            .put_u32(self.features.bits())
            .put_u8(self.lan_switch.num)
            .put_u8(self.lan_switch.num_enet_ports)
            .put_u16(self.lan_switch.default_vlan)
            .put_bytes(&self.lan_switch.hw_mac)
            .put_bytes(self.mgid.raw());
    }

    fn read(r: &mut Reader) -> Result<Self, WireError> {
        let version = r.u16()?;
        let num_data_paths = r.u8()?;
        r.skip(1)?;
        let num_address_entries = r.u16()?;
        r.skip(2)?;
        let features = Features::from_bits(r.u32()?);
        let lan_switch = LanSwitch {
            num: r.u8()?,
            num_enet_ports: r.u8()?,
            default_vlan: r.u16()?,
            hw_mac: r.array()?,
        };
        let mgid = Gid::from(r.array::<16>()?);
        Ok(Self {
            version,
            num_data_paths,
            num_address_entries,
            features,
            lan_switch,
            mgid,
        })
    }
}

/// Receive-pool parameters of one side of the data path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RecvPoolConfig {
    /// Size of one receive buffer, trailer included.
    pub size_recv_pool_entry: u32,
    /// Number of receive buffers.
    pub num_recv_pool_entries: u32,
    /// Microseconds the sender may delay a kick after the first unkicked write.
    pub timeout_before_kick: u32,
    /// Writes after which the sender must kick.
    pub num_recv_pool_entries_before_kick: u32,
    /// Bytes after which the sender must kick.
    pub num_recv_pool_bytes_before_kick: u32,
    /// Free buffers republished to the sender in one bundle.
    pub free_recv_pool_entries_per_update: u32,
}

impl RecvPoolConfig {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.size_recv_pool_entry)
            .put_u32(self.num_recv_pool_entries)
            .put_u32(self.timeout_before_kick)
            .put_u32(self.num_recv_pool_entries_before_kick)
            .put_u32(self.num_recv_pool_bytes_before_kick)
            .put_u32(self.free_recv_pool_entries_per_update);
    }

    fn read(r: &mut Reader) -> Result<Self, WireError> {
        Ok(Self {
            size_recv_pool_entry: r.u32()?,
            num_recv_pool_entries: r.u32()?,
            timeout_before_kick: r.u32()?,
            num_recv_pool_entries_before_kick: r.u32()?,
            num_recv_pool_bytes_before_kick: r.u32()?,
            free_recv_pool_entries_per_update: r.u32()?,
        })
    }
}

/// `ConfigDataPath` request and response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDataPath {
    pub path_id: u64,
    pub host: RecvPoolConfig,
    pub eioc: RecvPoolConfig,
}

impl ConfigDataPath {
    fn write(&self, w: &mut Writer) {
        w.put_u64(self.path_id);
        self.host.write(w);
        self.eioc.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, WireError> {
        Ok(Self {
            path_id: r.u64()?,
            host: RecvPoolConfig::read(r)?,
            eioc: RecvPoolConfig::read(r)?,
        })
    }
}

/// `ExchangePools` request and response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangePools {
    pub path_id: u64,
    pub pool_rkey: u32,
    pub pool_addr: u64,
}

impl ExchangePools {
    fn write(&self, w: &mut Writer) {
        w.put_u64(self.path_id)
            .put_u32(self.pool_rkey)
            .skip(4)
            .put_u64(self.pool_addr);
    }

    fn read(r: &mut Reader) -> Result<Self, WireError> {
        let path_id = r.u64()?;
        let pool_rkey = r.u32()?;
        r.skip(4)?;
        let pool_addr = r.u64()?;
        Ok(Self {
            path_id,
            pool_rkey,
            pool_addr,
        })
    }
}

/// `ConfigLink` request and response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigLink {
    pub flags: LinkFlags,
    pub lan_switch_num: u8,
    pub mtu: u16,
    pub default_vlan: u16,
    pub hw_mac: [u8; 6],
}

impl ConfigLink {
    fn write(&self, w: &mut Writer) {
        w.put_u8(self.flags.bits())
            .put_u8(self.lan_switch_num)
            .put_u16(self.mtu)
            .put_u16(self.default_vlan)
            .put_bytes(&self.hw_mac);
    }

    fn read(r: &mut Reader) -> Result<Self, WireError> {
        Ok(Self {
            flags: LinkFlags::from_bits(r.u8()?),
            lan_switch_num: r.u8()?,
            mtu: r.u16()?,
            default_vlan: r.u16()?,
            hw_mac: r.array()?,
        })
    }
}

/// One address-table update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressOp {
    pub index: u16,
    /// `true` to set the entry, `false` to query it.
    pub set: bool,
    pub valid: bool,
    pub mac: [u8; 6],
    pub vlan: u16,
    /// Multicast group, only carried by `ConfigAddresses2`.
    pub mgid: Gid,
}

impl AddressOp {
    fn write(&self, w: &mut Writer, with_gid: bool) {
        w.put_u16(self.index)
            .put_u8(self.set as u8)
            .put_u8(self.valid as u8)
            .put_bytes(&self.mac)
            .put_u16(self.vlan);
        if with_gid {
            w.put_bytes(self.mgid.raw());
        }
    }

    fn read(r: &mut Reader, with_gid: bool) -> Result<Self, WireError> {
        let index = r.u16()?;
        let set = r.u8()? != 0;
        let valid = r.u8()? != 0;
        let mac = r.array()?;
        let vlan = r.u16()?;
        let mgid = if with_gid {
            Gid::from(r.array::<16>()?)
        } else {
            Gid::ZERO
        };
        Ok(Self {
            index,
            set,
            valid,
            mac,
            vlan,
            mgid,
        })
    }
}

/// `ConfigAddresses`/`ConfigAddresses2` request and response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigAddrs {
    pub lan_switch_num: u8,
    /// Whether the operations carry a multicast GID (`ConfigAddresses2`).
    pub with_gid: bool,
    pub ops: Vec<AddressOp>,
}

impl ConfigAddrs {
    /// Number of operations one packet can carry.
    #[inline]
    pub fn capacity(with_gid: bool) -> usize {
        if with_gid {
            MAX_ADDRESS2_OPS
        } else {
            MAX_ADDRESS_OPS
        }
    }

    fn command(&self) -> Command {
        if self.with_gid {
            Command::ConfigAddresses2
        } else {
            Command::ConfigAddresses
        }
    }

    fn write(&self, w: &mut Writer) -> Result<(), WireError> {
        let max = Self::capacity(self.with_gid);
        if self.ops.len() > max {
            return Err(WireError::TooManyOps {
                count: self.ops.len(),
                max,
            });
        }
        w.put_u8(self.ops.len() as u8).put_u8(self.lan_switch_num);
        for op in &self.ops {
            op.write(w, self.with_gid);
        }
        Ok(())
    }

    fn read(r: &mut Reader, with_gid: bool) -> Result<Self, WireError> {
        let count = r.u8()? as usize;
        let lan_switch_num = r.u8()?;
        let max = Self::capacity(with_gid);
        if count > max {
            return Err(WireError::TooManyOps { count, max });
        }
        let ops = (0..count)
            .map(|_| AddressOp::read(r, with_gid))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            lan_switch_num,
            with_gid,
            ops,
        })
    }

    /// The first multicast group GID carried by the operations, if any.
    pub fn group_gid(&self) -> Option<Gid> {
        self.ops
            .iter()
            .map(|op| op.mgid)
            .find(|gid| !gid.is_zero())
    }
}

macro_rules! statistics {
    ($($field:ident),* $(,)?) => {
        /// Interface counters reported by the EIOC.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
        pub struct Statistics {
            $(pub $field: u64,)*
        }

        impl Statistics {
            fn write(&self, w: &mut Writer) {
                $(w.put_u64(self.$field);)*
            }

            fn read(r: &mut Reader) -> Result<Self, WireError> {
                Ok(Self {
                    $($field: r.u64()?,)*
                })
            }
        }
    };
}

statistics!(
    if_in_broadcast_pkts,
    if_in_multicast_pkts,
    if_in_octets,
    if_in_ucast_pkts,
    if_in_nucast_pkts,
    if_in_underrun,
    if_in_errors,
    if_out_errors,
    if_out_octets,
    if_out_ucast_pkts,
    if_out_multicast_pkts,
    if_out_broadcast_pkts,
    if_out_nucast_pkts,
    if_out_ok,
    if_in_ok,
    if_out_ucast_bytes,
    if_out_multicast_bytes,
    if_out_broadcast_bytes,
    if_in_ucast_bytes,
    if_in_multicast_bytes,
    if_in_broadcast_bytes,
    ethernet_status,
);

/// Length of the free-text part of a status report.
const STATUS_TEXT_LEN: usize = 128;

/// Unsolicited status report pushed by the EIOC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub lan_switch_num: u8,
    pub fatal: bool,
    pub status: u32,
    pub info: u32,
    pub text: String,
}

/// What a [`StatusReport`] means to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    LinkUp,
    LinkDown,
    Error,
}

impl StatusReport {
    /// Classify this report.
    pub fn kind(&self) -> StatusKind {
        match self.status {
            STATUS_LINK_UP => StatusKind::LinkUp,
            STATUS_LINK_DOWN => StatusKind::LinkDown,
            _ => StatusKind::Error,
        }
    }

    fn write(&self, w: &mut Writer) {
        let mut text = [0u8; STATUS_TEXT_LEN];
        let len = self.text.len().min(STATUS_TEXT_LEN - 1);
        text[..len].copy_from_slice(&self.text.as_bytes()[..len]);
        w.put_u8(self.lan_switch_num)
            .put_u8(self.fatal as u8)
            .skip(2)
            .put_u32(self.status)
            .put_u32(self.info)
            .put_bytes(&text);
    }

    fn read(r: &mut Reader) -> Result<Self, WireError> {
        let lan_switch_num = r.u8()?;
        let fatal = r.u8()? != 0;
        r.skip(2)?;
        let status = r.u32()?;
        let info = r.u32()?;
        let text = r.bytes(STATUS_TEXT_LEN)?;
        let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        Ok(Self {
            lan_switch_num,
            fatal,
            status,
            info,
            text: String::from_utf8_lossy(&text[..end]).into_owned(),
        })
    }
}

/// A request the host sends to the EIOC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    InitVnic(InitVnicReq),
    ConfigDataPath(ConfigDataPath),
    ExchangePools(ExchangePools),
    ConfigLink(ConfigLink),
    ConfigAddrs(ConfigAddrs),
    ReportStatistics { lan_switch_num: u8 },
    Reset,
    Heartbeat { interval: u32 },
}

impl Request {
    /// Get the command code of this request.
    pub fn command(&self) -> Command {
        match self {
            Self::InitVnic(_) => Command::InitVnic,
            Self::ConfigDataPath(_) => Command::ConfigDataPath,
            Self::ExchangePools(_) => Command::ExchangePools,
            Self::ConfigLink(_) => Command::ConfigLink,
            Self::ConfigAddrs(body) => body.command(),
            Self::ReportStatistics { .. } => Command::ReportStatistics,
            Self::Reset => Command::Reset,
            Self::Heartbeat { .. } => Command::Heartbeat,
        }
    }

    /// Encode into a full control packet.
    pub fn encode(&self, seq: u8, retry: u8) -> Result<Vec<u8>, WireError> {
        let header = Header {
            pkt_type: PacketType::Request,
            cmd: self.command(),
            seq,
            retry,
        };
        encode_packet(header, |w| {
            match self {
                Self::InitVnic(body) => body.write(w),
                Self::ConfigDataPath(body) => body.write(w),
                Self::ExchangePools(body) => body.write(w),
                Self::ConfigLink(body) => body.write(w),
                Self::ConfigAddrs(body) => body.write(w)?,
                Self::ReportStatistics { lan_switch_num } => {
                    w.put_u8(*lan_switch_num);
                }
                Self::Reset => {}
                Self::Heartbeat { interval } => {
                    w.put_u32(*interval);
                }
            }
            Ok(())
        })
    }

    fn read(cmd: Command, r: &mut Reader) -> Result<Self, WireError> {
        Ok(match cmd {
            Command::InitVnic => Self::InitVnic(InitVnicReq::read(r)?),
            Command::ConfigDataPath => Self::ConfigDataPath(ConfigDataPath::read(r)?),
            Command::ExchangePools => Self::ExchangePools(ExchangePools::read(r)?),
            Command::ConfigLink => Self::ConfigLink(ConfigLink::read(r)?),
            Command::ConfigAddresses => Self::ConfigAddrs(ConfigAddrs::read(r, false)?),
            Command::ConfigAddresses2 => Self::ConfigAddrs(ConfigAddrs::read(r, true)?),
            Command::ReportStatistics => Self::ReportStatistics {
                lan_switch_num: r.u8()?,
            },
            Command::Reset => Self::Reset,
            Command::Heartbeat => Self::Heartbeat { interval: r.u32()? },
            Command::ReportStatus => {
                return Err(WireError::Unexpected {
                    ty: PacketType::Request,
                    cmd,
                })
            }
        })
    }
}

/// A response the EIOC returns to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    InitVnic(InitVnicRsp),
    ConfigDataPath(ConfigDataPath),
    ExchangePools(ExchangePools),
    ConfigLink(ConfigLink),
    ConfigAddrs(ConfigAddrs),
    ReportStatistics(Statistics),
    Reset,
    Heartbeat { interval: u32 },
}

impl Response {
    /// Get the command code of this response.
    pub fn command(&self) -> Command {
        match self {
            Self::InitVnic(_) => Command::InitVnic,
            Self::ConfigDataPath(_) => Command::ConfigDataPath,
            Self::ExchangePools(_) => Command::ExchangePools,
            Self::ConfigLink(_) => Command::ConfigLink,
            Self::ConfigAddrs(body) => body.command(),
            Self::ReportStatistics(_) => Command::ReportStatistics,
            Self::Reset => Command::Reset,
            Self::Heartbeat { .. } => Command::Heartbeat,
        }
    }

    /// Encode into a full control packet.
    pub fn encode(&self, seq: u8, retry: u8) -> Result<Vec<u8>, WireError> {
        let header = Header {
            pkt_type: PacketType::Response,
            cmd: self.command(),
            seq,
            retry,
        };
        encode_packet(header, |w| {
            match self {
                Self::InitVnic(body) => body.write(w),
                Self::ConfigDataPath(body) => body.write(w),
                Self::ExchangePools(body) => body.write(w),
                Self::ConfigLink(body) => body.write(w),
                Self::ConfigAddrs(body) => body.write(w)?,
                Self::ReportStatistics(stats) => {
                    w.put_u8(0).skip(7);
                    stats.write(w);
                }
                Self::Reset => {}
                Self::Heartbeat { interval } => {
                    w.put_u32(*interval);
                }
            }
            Ok(())
        })
    }

    fn read(cmd: Command, r: &mut Reader) -> Result<Self, WireError> {
        Ok(match cmd {
            Command::InitVnic => Self::InitVnic(InitVnicRsp::read(r)?),
            Command::ConfigDataPath => Self::ConfigDataPath(ConfigDataPath::read(r)?),
            Command::ExchangePools => Self::ExchangePools(ExchangePools::read(r)?),
            Command::ConfigLink => Self::ConfigLink(ConfigLink::read(r)?),
            Command::ConfigAddresses => Self::ConfigAddrs(ConfigAddrs::read(r, false)?),
            Command::ConfigAddresses2 => Self::ConfigAddrs(ConfigAddrs::read(r, true)?),
            Command::ReportStatistics => {
                r.skip(8)?;
                Self::ReportStatistics(Statistics::read(r)?)
            }
            Command::Reset => Self::Reset,
            Command::Heartbeat => Self::Heartbeat { interval: r.u32()? },
            Command::ReportStatus => {
                return Err(WireError::Unexpected {
                    ty: PacketType::Response,
                    cmd,
                })
            }
        })
    }
}

/// A decoded control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request(Header, Request),
    Response(Header, Response),
    /// The EIOC refused a request.
    ErrorResponse(Header),
    /// Unsolicited report; the header type tells informational from error.
    Status(Header, StatusReport),
}

impl Packet {
    /// Get the header of this packet.
    pub fn header(&self) -> &Header {
        match self {
            Self::Request(h, _) | Self::Response(h, _) | Self::ErrorResponse(h) | Self::Status(h, _) => h,
        }
    }

    /// Decode a control packet.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let header = Header::read(&mut r)?;
        match (header.pkt_type, header.cmd) {
            (PacketType::Info | PacketType::Error, Command::ReportStatus) => {
                Ok(Self::Status(header, StatusReport::read(&mut r)?))
            }
            (PacketType::Info, cmd) => Err(WireError::Unexpected {
                ty: PacketType::Info,
                cmd,
            }),
            (PacketType::Error, _) => Ok(Self::ErrorResponse(header)),
            (PacketType::Request, cmd) => Ok(Self::Request(header, Request::read(cmd, &mut r)?)),
            (PacketType::Response, cmd) => {
                Ok(Self::Response(header, Response::read(cmd, &mut r)?))
            }
        }
    }
}

/// Encode an unsolicited status report.
pub fn encode_status(report: &StatusReport, error: bool) -> Vec<u8> {
    let header = Header {
        pkt_type: if error {
            PacketType::Error
        } else {
            PacketType::Info
        },
        cmd: Command::ReportStatus,
        seq: 0,
        retry: 0,
    };
    let mut buf = vec![0u8; CONTROL_PACKET_SIZE];
    let mut w = Writer::new(&mut buf);
    header.write(&mut w);
    report.write(&mut w);
    buf
}

/// Encode a refusal of the request identified by `header`.
pub fn encode_error_response(request: &Header) -> Vec<u8> {
    let header = Header {
        pkt_type: PacketType::Error,
        ..*request
    };
    let mut buf = vec![0u8; CONTROL_PACKET_SIZE];
    header.write(&mut Writer::new(&mut buf));
    buf
}

fn encode_packet(
    header: Header,
    body: impl FnOnce(&mut Writer) -> Result<(), WireError>,
) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0u8; CONTROL_PACKET_SIZE];
    let mut w = Writer::new(&mut buf);
    header.write(&mut w);
    body(&mut w)?;
    debug_assert!(w.pos() <= CONTROL_PACKET_SIZE);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;

    #[test]
    fn test_capacities() {
        assert_eq!(MAX_ADDRESS_OPS, 20);
        assert_eq!(MAX_ADDRESS2_OPS, 8);
    }

    #[test]
    fn test_header_layout() {
        let buf = Request::Heartbeat { interval: 1000 }.encode(7, 0).unwrap();
        assert_eq!(buf.len(), CONTROL_PACKET_SIZE);
        assert_eq!(&buf[..4], &[0x02, 9, 7, 0]);
        assert_eq!(&buf[8..12], &1000u32.to_be_bytes());
    }

    #[test]
    fn test_init_vnic_response_decodes() {
        let mgid: Gid = "ff12:401b::1".parse::<Ipv6Addr>().unwrap().into();
        let rsp = Response::InitVnic(InitVnicRsp {
            version: PROTOCOL_VERSION,
            num_data_paths: 1,
            num_address_entries: 16,
            features: Features::INBOUND_IB_MC | Features::RDMA_IMMED,
            lan_switch: LanSwitch {
                num: 3,
                num_enet_ports: 2,
                default_vlan: 100,
                hw_mac: [0, 0x06, 0x6a, 1, 2, 3],
            },
            mgid,
        });
        let buf = rsp.encode(42, 0).unwrap();
        match Packet::decode(&buf).unwrap() {
            Packet::Response(h, decoded) => {
                assert_eq!(h.seq, 42);
                assert_eq!(h.cmd, Command::InitVnic);
                assert_eq!(decoded, rsp);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_address_list_limits() {
        let op = AddressOp {
            index: 2,
            set: true,
            valid: true,
            mac: [1, 0, 0x5e, 0, 0, 1],
            vlan: 0,
            mgid: Gid::ZERO,
        };
        let full = ConfigAddrs {
            lan_switch_num: 0,
            with_gid: true,
            ops: vec![op; MAX_ADDRESS2_OPS],
        };
        assert!(Request::ConfigAddrs(full.clone()).encode(1, 0).is_ok());

        let mut over = full;
        over.ops.push(op);
        assert_eq!(
            Request::ConfigAddrs(over).encode(1, 0),
            Err(WireError::TooManyOps {
                count: MAX_ADDRESS2_OPS + 1,
                max: MAX_ADDRESS2_OPS
            })
        );
    }

    #[test]
    fn test_status_and_error_packets() {
        let report = StatusReport {
            lan_switch_num: 0,
            fatal: false,
            status: STATUS_LINK_DOWN,
            info: 0,
            text: "port 1 down".into(),
        };
        match Packet::decode(&encode_status(&report, false)).unwrap() {
            Packet::Status(h, r) => {
                assert_eq!(h.pkt_type, PacketType::Info);
                assert_eq!(r.kind(), StatusKind::LinkDown);
                assert_eq!(r.text, "port 1 down");
            }
            other => panic!("unexpected packet {:?}", other),
        }

        let req = Request::Reset.encode(5, 0).unwrap();
        let header = *Packet::decode(&req).unwrap().header();
        assert!(matches!(
            Packet::decode(&encode_error_response(&header)),
            Ok(Packet::ErrorResponse(Header { seq: 5, cmd: Command::Reset, .. }))
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut buf = vec![0u8; CONTROL_PACKET_SIZE];
        buf[0] = 0x03;
        assert_eq!(Packet::decode(&buf), Err(WireError::BadPacketType(3)));
        buf[0] = 0x04;
        buf[1] = 99;
        assert_eq!(Packet::decode(&buf), Err(WireError::BadCommand(99)));
        assert!(matches!(
            Packet::decode(&buf[..4]),
            Err(WireError::Truncated { .. })
        ));
    }
}
