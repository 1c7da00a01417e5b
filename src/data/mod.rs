//! Data channel: Ethernet frames carried by RDMA writes into buffer pools
//! exchanged with the EIOC.

mod pool;
mod trailer;

use std::sync::Arc;
use std::time::Duration;

use quanta::Instant;
use thiserror::Error;

pub use self::pool::*;
pub use self::trailer::*;
use crate::config::{DataConfig, VLAN_ETH_HLEN};
use crate::control::wire::{ConfigDataPath, Features, RecvPoolConfig};
use crate::transport::*;

/// Receive buffers kept posted on the data connection for kick messages.
const KICK_RECV_DEPTH: usize = 16;

/// Receive buffers kept posted for multicast frames while attached.
const MC_RECV_DEPTH: usize = 16;

/// Size of a multicast receive buffer: IB MTU less the GRH.
const MC_RECV_SIZE: usize = 2048 - 40;

/// Transmit error type.
#[derive(Debug, Clone, Error)]
pub enum XmitError {
    /// No local transmit buffer or no EIOC receive buffer is available. The
    /// queue is stopped until one becomes available.
    #[error("no transmit buffers available")]
    NoBuffers,

    /// The data path is not up.
    #[error("data path not running")]
    NotRunning,

    /// The frame does not fit in an EIOC receive buffer.
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    TooLong { len: usize, max: usize },

    /// The transport refused the write.
    #[error("data transport error")]
    Transport(#[from] TransportError),
}

/// Data channel error type.
#[derive(Debug, Clone, Error)]
pub enum DataError {
    /// A data work request completed with an error.
    #[error("data completion {wr_id:#x} failed")]
    Completion {
        wr_id: u64,
        #[source]
        status: CompletionStatus,
    },

    /// The EIOC answered `ConfigDataPath` with values outside the configured
    /// bounds.
    #[error("data path negotiation failed: {0}")]
    Negotiation(String),

    /// Pool bookkeeping disagrees with itself.
    #[error("buffer pool inconsistency: {0}")]
    Inconsistent(&'static str),

    /// The transport refused a post or a registration.
    #[error("data transport error")]
    Transport(#[from] TransportError),
}

/// Data-path parameters agreed through `ConfigDataPath`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DataParams {
    pub path_id: u64,
    /// Host receive pool.
    pub recv_pool_size: usize,
    pub recv_buf_size: usize,
    pub free_per_update: usize,
    /// EIOC receive pool, i.e. the host transmit table.
    pub xmit_pool_size: usize,
    pub xmit_buf_size: usize,
    pub notify_bundle: usize,
    /// What the EIOC asks of the host before a kick.
    pub eioc: RecvPoolConfig,
}

impl DataParams {
    /// Build the `ConfigDataPath` request for this host.
    pub fn request(config: &DataConfig, path_id: u64) -> ConfigDataPath {
        ConfigDataPath {
            path_id,
            host: RecvPoolConfig {
                size_recv_pool_entry: config.recv_buf_size,
                num_recv_pool_entries: config.host_recv_pool_entries,
                timeout_before_kick: config.timeout_before_kick_us,
                num_recv_pool_entries_before_kick: config.entries_before_kick,
                num_recv_pool_bytes_before_kick: config.bytes_before_kick,
                free_recv_pool_entries_per_update: config.free_entries_per_update,
            },
            eioc: RecvPoolConfig {
                num_recv_pool_entries: config.eioc_recv_pool_entries,
                ..Default::default()
            },
        }
    }

    /// Check the EIOC's `ConfigDataPath` answer against the configured
    /// bounds and derive the pool geometry.
    pub fn negotiate(config: &DataConfig, req: &ConfigDataPath, rsp: &ConfigDataPath) -> Result<Self, DataError> {
        let fail = |what: String| Err(DataError::Negotiation(what));
        if rsp.path_id != req.path_id {
            return fail(format!("path id {:#x} != {:#x}", rsp.path_id, req.path_id));
        }

        let host_entries = rsp.host.num_recv_pool_entries;
        if !(config.host_recv_pool_entries_min..=config.host_recv_pool_entries_max).contains(&host_entries) {
            return fail(format!("host pool of {} entries", host_entries));
        }
        if rsp.host.size_recv_pool_entry != config.recv_buf_size {
            return fail(format!("host buffer size {}", rsp.host.size_recv_pool_entry));
        }

        let eioc_entries = rsp.eioc.num_recv_pool_entries;
        if !(config.eioc_recv_pool_entries_min..=config.eioc_recv_pool_entries_max).contains(&eioc_entries) {
            return fail(format!("EIOC pool of {} entries", eioc_entries));
        }
        let eioc_size = rsp.eioc.size_recv_pool_entry;
        if eioc_size < config.eioc_buf_size_min || eioc_size % 8 != 0 {
            return fail(format!("EIOC buffer size {}", eioc_size));
        }

        let recv_pool_size = host_entries.min(config.host_recv_pool_entries) as usize;
        let per_update = match rsp.host.free_recv_pool_entries_per_update {
            0 => config.free_entries_per_update,
            n => n.min(config.free_entries_per_update),
        };
        Ok(Self {
            path_id: req.path_id,
            recv_pool_size,
            recv_buf_size: config.recv_buf_size as usize,
            free_per_update: (per_update as usize).clamp(1, recv_pool_size),
            xmit_pool_size: eioc_entries as usize,
            xmit_buf_size: eioc_size as usize,
            notify_bundle: config.notify_bundle as usize,
            eioc: rsp.eioc,
        })
    }

    /// Largest MTU both sides' buffers can carry.
    #[inline]
    pub fn max_mtu(&self) -> u32 {
        (self.recv_buf_size.min(self.xmit_buf_size) as u32).saturating_sub(TRAILER_SIZE as u32 + VLAN_ETH_HLEN)
    }
}

/// A frame handed to the upstream interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrame {
    pub data: Vec<u8>,
    /// Checksum results, empty unless receive offload was negotiated.
    pub csum: RxCsumFlags,
    /// Whether the frame arrived through the multicast group.
    pub multicast: bool,
}

/// Result of processing data-path completions or timers.
#[derive(Debug, Default)]
pub struct DataOutput {
    pub frames: Vec<RxFrame>,
    /// The transmit queue went from stopped to running.
    pub wake: bool,
}

impl DataOutput {
    fn merge(&mut self, other: DataOutput) {
        self.frames.extend(other.frames);
        self.wake |= other.wake;
    }
}

/// One data path: the data connection plus both buffer pools.
pub struct DataChannel {
    conn: Arc<dyn Connection>,
    params: DataParams,
    features: Features,
    xmit: XmitPool,
    recv: RecvPool,
    running: bool,
    mc_attached: Option<(Gid, u16)>,
}

impl DataChannel {
    /// Register both pools and post the kick receive buffers.
    pub fn new(
        conn: Arc<dyn Connection>,
        params: DataParams,
        features: Features,
        transport: &dyn Transport,
    ) -> Result<Self, DataError> {
        let table = transport.register(params.xmit_pool_size * BPE_SIZE)?;
        let buffers = transport.register(params.recv_pool_size * params.recv_buf_size)?;

        let eioc = &params.eioc;
        let xmit_kicker = Kicker::new(
            eioc.num_recv_pool_entries_before_kick,
            eioc.num_recv_pool_bytes_before_kick,
            Duration::from_micros(eioc.timeout_before_kick as u64),
        );
        let recv_kicker = Kicker::new(
            eioc.num_recv_pool_entries_before_kick,
            0,
            Duration::from_micros(eioc.timeout_before_kick as u64),
        );
        let xmit = XmitPool::new(
            table,
            params.xmit_buf_size,
            params.notify_bundle,
            xmit_kicker,
            features.contains(Features::RDMA_IMMED),
        );
        let recv = RecvPool::new(buffers, params.recv_buf_size, params.free_per_update, recv_kicker);

        for i in 0..KICK_RECV_DEPTH {
            conn.post_recv(WR_RECV | i as u64, 0)?;
        }
        Ok(Self {
            conn,
            params,
            features,
            xmit,
            recv,
            running: false,
            mc_attached: None,
        })
    }

    /// Get the data connection.
    #[inline]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    #[inline]
    pub fn params(&self) -> &DataParams {
        &self.params
    }

    /// Get the host transmit table to advertise in `ExchangePools`.
    #[inline]
    pub fn xmit_table(&self) -> RemoteRegion {
        self.xmit.table().as_remote()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether the transmit queue is stopped for lack of buffers.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.xmit.is_stopped()
    }

    /// Start the data path once the EIOC's table is known: publish every
    /// receive buffer and accept transmits.
    pub fn start(&mut self, peer_table: RemoteRegion, now: Instant) -> Result<(), DataError> {
        self.recv.set_peer_table(peer_table);
        self.recv.publish(self.conn.as_ref(), true, now)?;
        self.running = true;
        Ok(())
    }

    /// Stop accepting transmits.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Transmit one Ethernet frame.
    pub fn transmit(&mut self, frame: &[u8], csum: TxCsumFlags, now: Instant) -> Result<(), XmitError> {
        if !self.running {
            return Err(XmitError::NotRunning);
        }
        let mut frame = frame.to_vec();
        let mut trailer = Trailer::default();
        if let Some(tci) = strip_vlan(&mut frame) {
            trailer.pkt_flags |= PktFlags::VLAN_INSERT;
            trailer.vlan = tci;
        }
        if let Some(dst) = frame.get(..6) {
            trailer.dest_mac.copy_from_slice(dst);
        }
        if self.features.intersects(Features::TX_CSUM) {
            trailer.tx_csum = csum;
        }
        self.xmit.xmit(self.conn.as_ref(), &frame, trailer, now)
    }

    fn to_rx(&self, frame: RecvFrame, multicast: bool) -> RxFrame {
        let RecvFrame { trailer, mut payload } = frame;
        if trailer.pkt_flags.contains(PktFlags::VLAN_INSERT) && trailer.vlan != 0 {
            insert_vlan(&mut payload, trailer.vlan);
        }
        RxFrame {
            data: payload,
            csum: if self.features.intersects(Features::RX_CSUM) {
                trailer.rx_csum
            } else {
                RxCsumFlags::EMPTY
            },
            multicast,
        }
    }

    fn drain_recv_pool(&mut self, now: Instant) -> Result<DataOutput, DataError> {
        let frames = self.recv.poll_recv();
        self.recv.publish(self.conn.as_ref(), false, now)?;
        Ok(DataOutput {
            frames: frames.into_iter().map(|f| self.to_rx(f, false)).collect(),
            wake: self.xmit.try_wake(),
        })
    }

    /// Process one completion of the data connection.
    pub fn handle_completion(&mut self, wc: Completion, now: Instant) -> Result<DataOutput, DataError> {
        if let Err(status) = wc.ok() {
            return Err(DataError::Completion { wr_id: wc.wr_id, status });
        }
        let index = wc.wr_id & !WR_TAG_MASK;
        match wc.wr_id & WR_TAG_MASK {
            WR_XMIT => {
                self.xmit.complete(index as usize);
                Ok(DataOutput {
                    wake: self.xmit.try_wake(),
                    ..Default::default()
                })
            }
            WR_BUNDLE => {
                self.recv.complete_bundle(wc.wr_id);
                Ok(DataOutput::default())
            }
            WR_RECV => {
                // A kick from the EIOC: frames were written or buffers
                // republished.
                self.conn.post_recv(wc.wr_id, 0)?;
                self.drain_recv_pool(now)
            }
            WR_MC_RECV => {
                self.conn.post_recv(wc.wr_id, MC_RECV_SIZE)?;
                let frame = Trailer::decode(&wc.data).and_then(|trailer| {
                    let range = payload_range(wc.data.len(), &trailer)?;
                    Some(RecvFrame {
                        trailer,
                        payload: wc.data[range].to_vec(),
                    })
                });
                let mut out = DataOutput::default();
                match frame {
                    Some(frame) if self.mc_attached.is_some() => out.frames.push(self.to_rx(frame, true)),
                    Some(_) => {}
                    None => log::warn!("ibvnic: dropping multicast frame with bad trailer"),
                }
                Ok(out)
            }
            _ => Ok(DataOutput::default()),
        }
    }

    /// Poll and process at most `max` completions. The flag is `true` if the
    /// budget was used up and more may be pending.
    pub fn poll_completions(&mut self, max: usize, now: Instant) -> Result<(DataOutput, bool), DataError> {
        let wcs = self.conn.poll(max);
        let more = wcs.len() >= max;
        let mut out = DataOutput::default();
        for wc in wcs {
            out.merge(self.handle_completion(wc, now)?);
        }
        Ok((out, more))
    }

    /// Run the kick timers.
    pub fn poll_timers(&mut self, now: Instant) -> Result<(), DataError> {
        self.xmit.check_kick(self.conn.as_ref(), now)?;
        self.recv.check_kick(self.conn.as_ref(), now)?;
        Ok(())
    }

    /// Earliest kick deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.xmit.kick_deadline(), self.recv.kick_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Attach the data connection to a joined multicast group and post the
    /// buffers multicast frames land in.
    pub fn attach_multicast(&mut self, gid: Gid, lid: u16) -> Result<(), DataError> {
        if self.mc_attached.is_some() {
            return Ok(());
        }
        self.conn.attach_multicast(gid, lid)?;
        for i in 0..MC_RECV_DEPTH {
            self.conn.post_recv(WR_MC_RECV | i as u64, MC_RECV_SIZE)?;
        }
        self.mc_attached = Some((gid, lid));
        Ok(())
    }

    /// Detach from the multicast group, if attached.
    pub fn detach_multicast(&mut self) -> Result<(), DataError> {
        if let Some((gid, lid)) = self.mc_attached.take() {
            self.conn.detach_multicast(gid, lid)?;
        }
        Ok(())
    }

    #[inline]
    pub fn multicast_attached(&self) -> bool {
        self.mc_attached.is_some()
    }

    /// Ownership breakdown of the transmit and receive pools.
    pub fn accounting(&self) -> (Accounting, Accounting) {
        (self.xmit.accounting(), self.recv.accounting())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiated(config: &DataConfig) -> ConfigDataPath {
        let req = DataParams::request(config, 7);
        let mut rsp = req;
        rsp.eioc = RecvPoolConfig {
            size_recv_pool_entry: 2048,
            num_recv_pool_entries: 256,
            timeout_before_kick: 100,
            num_recv_pool_entries_before_kick: 8,
            num_recv_pool_bytes_before_kick: 8192,
            free_recv_pool_entries_per_update: 4,
        };
        rsp
    }

    #[test]
    fn test_negotiate_takes_smaller_pool() {
        let config = DataConfig::default();
        let req = DataParams::request(&config, 7);
        let mut rsp = negotiated(&config);
        rsp.host.num_recv_pool_entries = 128;
        let params = DataParams::negotiate(&config, &req, &rsp).unwrap();
        assert_eq!(params.recv_pool_size, 128);
        assert_eq!(params.xmit_pool_size, 256);
        assert_eq!(params.xmit_buf_size, 2048);
        assert_eq!(params.free_per_update, 16);
        assert_eq!(params.max_mtu(), 2048 - 32 - 18);
    }

    #[test]
    fn test_negotiate_rejects_out_of_bounds() {
        let config = DataConfig::default();
        let req = DataParams::request(&config, 7);

        let mut rsp = negotiated(&config);
        rsp.eioc.num_recv_pool_entries = 4;
        assert!(matches!(
            DataParams::negotiate(&config, &req, &rsp),
            Err(DataError::Negotiation(_))
        ));

        let mut rsp = negotiated(&config);
        rsp.host.num_recv_pool_entries = 4096;
        assert!(DataParams::negotiate(&config, &req, &rsp).is_err());

        let mut rsp = negotiated(&config);
        rsp.path_id = 8;
        assert!(DataParams::negotiate(&config, &req, &rsp).is_err());

        let mut rsp = negotiated(&config);
        rsp.eioc.size_recv_pool_entry = 1030;
        assert!(DataParams::negotiate(&config, &req, &rsp).is_err());
    }
}
