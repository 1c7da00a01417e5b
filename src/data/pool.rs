//! The two buffer pools of a data path.
//!
//! - [`XmitPool`]: a table of buffer-pool entries (BPEs) the EIOC writes its
//!   free receive buffers into. The host consumes entries in ring order and
//!   RDMA-writes frames into the buffers they describe.
//! - [`RecvPool`]: host receive buffers the EIOC writes frames into. Free
//!   buffers are published to the EIOC's table in bundles.

use std::collections::VecDeque;
use std::time::Duration;

use quanta::Instant;

use super::trailer::*;
use super::{DataError, XmitError};
use crate::transport::*;
use crate::utils::wire::{Reader, Writer};

/// Size of one buffer-pool entry on the wire.
pub const BPE_SIZE: usize = 16;

pub(crate) const WR_TAG_SHIFT: u32 = 60;
pub(crate) const WR_TAG_MASK: u64 = 0xf << WR_TAG_SHIFT;
pub(crate) const WR_XMIT: u64 = 1 << WR_TAG_SHIFT;
pub(crate) const WR_KICK: u64 = 2 << WR_TAG_SHIFT;
pub(crate) const WR_BUNDLE: u64 = 3 << WR_TAG_SHIFT;
pub(crate) const WR_RECV: u64 = 4 << WR_TAG_SHIFT;
pub(crate) const WR_MC_RECV: u64 = 5 << WR_TAG_SHIFT;

/// A buffer-pool entry: one peer buffer the owner of the table may write to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bpe {
    pub addr: u64,
    pub rkey: u32,
    pub valid: bool,
}

impl Bpe {
    pub fn encode(&self) -> [u8; BPE_SIZE] {
        let mut buf = [0u8; BPE_SIZE];
        Writer::new(&mut buf)
            .put_u64(self.addr)
            .put_u32(self.rkey)
            .put_u32(self.valid as u32);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut r = Reader::new(buf);
        Some(Self {
            addr: r.u64().ok()?,
            rkey: r.u32().ok()?,
            valid: r.u32().ok()? != 0,
        })
    }
}

/// Ownership breakdown of a pool.
///
/// For the transmit pool, `free` entries are published by the EIOC and
/// unused, `posted` entries have a write in flight, and `peer_owned` entries
/// were written and await republishing. For the receive pool, `free` buffers
/// sit on the local free list, `posted` buffers have their publishing write
/// in flight, and `peer_owned` buffers are published to the EIOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Accounting {
    pub pool_size: usize,
    pub free: usize,
    pub posted: usize,
    pub peer_owned: usize,
}

impl Accounting {
    /// Whether every entry is accounted for exactly once.
    #[inline]
    pub fn balanced(&self) -> bool {
        self.free + self.posted + self.peer_owned == self.pool_size
    }
}

/// Kick bookkeeping: count/byte thresholds plus a timer started by the first
/// unkicked write.
#[derive(Debug)]
pub(crate) struct Kicker {
    count_limit: u32,
    byte_limit: u32,
    timeout: Duration,

    count: u32,
    bytes: u32,
    deadline: Option<Instant>,
}

impl Kicker {
    pub fn new(count_limit: u32, byte_limit: u32, timeout: Duration) -> Self {
        Self {
            count_limit: count_limit.max(1),
            byte_limit,
            timeout,
            count: 0,
            bytes: 0,
            deadline: None,
        }
    }

    /// Record unkicked writes. Returns `true` if a kick is due right away;
    /// otherwise the kick timer is armed.
    pub fn record(&mut self, count: u32, bytes: usize, now: Instant) -> bool {
        self.count = self.count.saturating_add(count);
        self.bytes = self.bytes.saturating_add(bytes as u32);
        if self.count >= self.count_limit || (self.byte_limit != 0 && self.bytes >= self.byte_limit) {
            return true;
        }
        self.deadline.get_or_insert(now + self.timeout);
        false
    }

    pub fn kicked(&mut self) {
        self.count = 0;
        self.bytes = 0;
        self.deadline = None;
    }

    #[inline]
    pub fn due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

fn send_kick(conn: &dyn Connection) -> Result<(), TransportError> {
    conn.post_send(WorkRequest::Send {
        wr_id: WR_KICK,
        payload: Vec::new(),
        signaled: false,
    })
}

/// Transmit side of a data path.
pub struct XmitPool {
    table: Region,
    pool_size: usize,
    buf_size: usize,
    next_slot: usize,

    /// Local transmit buffers; `Some(slot)` while a write from it is in flight.
    bufs: Vec<Option<usize>>,
    next_buf: usize,
    last_comp_buf: usize,
    bufs_free: usize,

    notify_bundle: usize,
    unsignaled: usize,
    kicker: Kicker,
    kick_in_imm: bool,
    stopped: bool,
}

impl XmitPool {
    /// Create a transmit pool over `table`, which holds one BPE per EIOC
    /// receive buffer of `buf_size` bytes.
    pub(crate) fn new(
        table: Region,
        buf_size: usize,
        notify_bundle: usize,
        kicker: Kicker,
        kick_in_imm: bool,
    ) -> Self {
        let num_bufs = 2 * notify_bundle.max(1);
        Self {
            pool_size: table.len() / BPE_SIZE,
            table,
            buf_size,
            next_slot: 0,
            bufs: vec![None; num_bufs],
            next_buf: 0,
            last_comp_buf: 0,
            bufs_free: num_bufs,
            notify_bundle: notify_bundle.max(1),
            unsignaled: 0,
            kicker,
            kick_in_imm,
            stopped: false,
        }
    }

    /// Get the BPE table the EIOC publishes into.
    #[inline]
    pub fn table(&self) -> &Region {
        &self.table
    }

    #[inline]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Largest payload one EIOC buffer can hold.
    #[inline]
    pub fn max_payload(&self) -> usize {
        (self.buf_size - TRAILER_SIZE) & !7
    }

    /// Whether a previous transmit ran out of buffers and the queue is
    /// stopped.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn bpe(&self, slot: usize) -> Option<Bpe> {
        Bpe::decode(&self.table.read(slot * BPE_SIZE, BPE_SIZE)?)
    }

    /// Whether a frame could be sent right now.
    pub fn can_send(&self) -> bool {
        self.bufs_free > 0 && self.bpe(self.next_slot).is_some_and(|bpe| bpe.valid)
    }

    /// Restart a stopped queue if sending is possible again. Returns `true`
    /// on the stopped-to-running edge only.
    pub fn try_wake(&mut self) -> bool {
        if self.stopped && self.can_send() {
            self.stopped = false;
            return true;
        }
        false
    }

    /// Write one frame into the next EIOC buffer.
    pub(crate) fn xmit(
        &mut self,
        conn: &dyn Connection,
        payload: &[u8],
        mut trailer: Trailer,
        now: Instant,
    ) -> Result<(), XmitError> {
        let bpe = match self.bpe(self.next_slot) {
            Some(bpe) if bpe.valid && self.bufs_free > 0 => bpe,
            _ => {
                self.stopped = true;
                return Err(XmitError::NoBuffers);
            }
        };
        if payload.len() > self.max_payload() {
            return Err(XmitError::TooLong {
                len: payload.len(),
                max: self.max_payload(),
            });
        }

        let kick = self.kicker.record(1, payload.len(), now);
        if kick {
            trailer.pkt_flags |= PktFlags::KICK;
        }
        trailer.valid = true;
        let image = frame_image(payload, trailer);
        let remote = RemoteRegion::new(
            bpe.addr + (self.buf_size - image.len()) as u64,
            image.len(),
            bpe.rkey,
        );

        let buf = self.next_buf;
        let signaled = self.unsignaled + 1 >= self.notify_bundle || self.bufs_free == 1;
        conn.post_send(WorkRequest::RdmaWrite {
            wr_id: WR_XMIT | buf as u64,
            payload: image,
            remote,
            imm: (kick && self.kick_in_imm).then_some(0),
            signaled,
        })?;

        self.unsignaled = if signaled { 0 } else { self.unsignaled + 1 };
        self.table
            .write(self.next_slot * BPE_SIZE, &Bpe { valid: false, ..bpe }.encode());
        self.bufs[buf] = Some(self.next_slot);
        self.bufs_free -= 1;
        self.next_buf = (buf + 1) % self.bufs.len();
        self.next_slot = (self.next_slot + 1) % self.pool_size;

        if kick {
            if !self.kick_in_imm {
                send_kick(conn)?;
            }
            self.kicker.kicked();
        }
        Ok(())
    }

    /// A signaled write from `buf` completed: it and every unsignaled write
    /// before it are done.
    pub fn complete(&mut self, buf: usize) {
        if self.bufs.get(buf).map_or(true, Option::is_none) {
            return;
        }
        loop {
            let i = self.last_comp_buf;
            if self.bufs[i].take().is_some() {
                self.bufs_free += 1;
            }
            self.last_comp_buf = (i + 1) % self.bufs.len();
            if i == buf {
                break;
            }
        }
    }

    /// Send a kick if the kick timer expired. Returns `true` if one was sent.
    pub(crate) fn check_kick(&mut self, conn: &dyn Connection, now: Instant) -> Result<bool, TransportError> {
        if !self.kicker.due(now) {
            return Ok(false);
        }
        send_kick(conn)?;
        self.kicker.kicked();
        Ok(true)
    }

    #[inline]
    pub fn kick_deadline(&self) -> Option<Instant> {
        self.kicker.deadline()
    }

    pub fn accounting(&self) -> Accounting {
        let in_flight: Vec<usize> = self.bufs.iter().flatten().copied().collect();
        let (mut free, mut peer_owned) = (0, 0);
        for slot in (0..self.pool_size).filter(|s| !in_flight.contains(s)) {
            match self.bpe(slot) {
                Some(bpe) if bpe.valid => free += 1,
                _ => peer_owned += 1,
            }
        }
        Accounting {
            pool_size: self.pool_size,
            free,
            posted: in_flight.len(),
            peer_owned,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingSlot {
    Idle,
    /// The write publishing this buffer has not completed yet.
    InFlight(usize),
    Posted(usize),
}

/// A frame found in the receive pool.
#[derive(Debug, Clone)]
pub struct RecvFrame {
    pub trailer: Trailer,
    pub payload: Vec<u8>,
}

/// Receive side of a data path.
pub struct RecvPool {
    buffers: Region,
    buf_size: usize,
    ring: Vec<RingSlot>,
    free: VecDeque<usize>,
    next_full: usize,
    next_free: usize,
    per_update: usize,
    peer_table: Option<RemoteRegion>,
    kicker: Kicker,
}

impl RecvPool {
    /// Create a receive pool over `buffers`, split into `buf_size`-byte
    /// buffers. Free buffers are published `per_update` at a time.
    pub(crate) fn new(buffers: Region, buf_size: usize, per_update: usize, kicker: Kicker) -> Self {
        let pool_size = buffers.len() / buf_size;
        Self {
            buffers,
            buf_size,
            ring: vec![RingSlot::Idle; pool_size],
            free: (0..pool_size).collect(),
            next_full: 0,
            next_free: 0,
            per_update: per_update.clamp(1, pool_size.max(1)),
            peer_table: None,
            kicker,
        }
    }

    #[inline]
    pub fn pool_size(&self) -> usize {
        self.ring.len()
    }

    #[inline]
    pub fn buffers(&self) -> &Region {
        &self.buffers
    }

    /// Set the EIOC table free buffers are published into.
    pub fn set_peer_table(&mut self, table: RemoteRegion) {
        self.peer_table = Some(table);
    }

    /// Publish free buffers to the EIOC. Only whole bundles are published
    /// unless `force` is set. Returns the number of buffers published.
    pub(crate) fn publish(
        &mut self,
        conn: &dyn Connection,
        force: bool,
        now: Instant,
    ) -> Result<usize, DataError> {
        let Some(table) = self.peer_table else {
            return Ok(0);
        };
        let mut published = 0;
        while self.free.len() >= self.per_update || (force && !self.free.is_empty()) {
            let mut remaining = if force { self.free.len() } else { self.per_update };
            // One write per contiguous run of table entries.
            while remaining > 0 {
                let n = self.publish_run(conn, &table, remaining)?;
                remaining -= n;
                published += n;
            }
        }

        if published > 0 && self.kicker.record(published as u32, 0, now) {
            send_kick(conn)?;
            self.kicker.kicked();
        }
        Ok(published)
    }

    /// Publish up to `want` free buffers into the table entries starting at
    /// `next_free`, stopping at the end of the ring.
    fn publish_run(
        &mut self,
        conn: &dyn Connection,
        table: &RemoteRegion,
        want: usize,
    ) -> Result<usize, DataError> {
        let start = self.next_free;
        let n = want.min(self.pool_size() - start).min(self.free.len());
        if self.ring[start..start + n].iter().any(|s| *s != RingSlot::Idle) {
            return Err(DataError::Inconsistent("publishing over a busy ring slot"));
        }

        let bufs: Vec<usize> = self.free.drain(..n).collect();
        let mut bpes = Vec::with_capacity(n * BPE_SIZE);
        for &buf in &bufs {
            let bpe = Bpe {
                addr: self.buffers.addr() + (buf * self.buf_size) as u64,
                rkey: self.buffers.rkey(),
                valid: true,
            };
            bpes.extend_from_slice(&bpe.encode());
        }
        let posted = table
            .slice(start * BPE_SIZE, n * BPE_SIZE)
            .ok_or(DataError::Inconsistent("peer table smaller than the pool"))
            .and_then(|remote| {
                conn.post_send(WorkRequest::RdmaWrite {
                    wr_id: WR_BUNDLE | (start as u64) << 16 | n as u64,
                    payload: bpes,
                    remote,
                    imm: None,
                    signaled: true,
                })
                .map_err(DataError::from)
            });
        if let Err(e) = posted {
            bufs.into_iter().rev().for_each(|b| self.free.push_front(b));
            return Err(e);
        }

        for (k, buf) in bufs.into_iter().enumerate() {
            self.ring[start + k] = RingSlot::InFlight(buf);
        }
        self.next_free = (start + n) % self.pool_size();
        Ok(n)
    }

    /// A publishing write identified by `wr_id` completed.
    pub(crate) fn complete_bundle(&mut self, wr_id: u64) {
        let start = ((wr_id & !WR_TAG_MASK) >> 16) as usize;
        let n = (wr_id & 0xffff) as usize;
        for slot in self.ring.iter_mut().skip(start).take(n) {
            if let RingSlot::InFlight(buf) = *slot {
                *slot = RingSlot::Posted(buf);
            }
        }
    }

    /// Collect every frame the EIOC handed off, in ring order. Consumed
    /// buffers return to the free list; frames with an inconsistent trailer
    /// are dropped.
    pub fn poll_recv(&mut self) -> Vec<RecvFrame> {
        let trailer_at = self.buf_size - TRAILER_SIZE;
        let mut frames = Vec::new();
        loop {
            let buf = match self.ring[self.next_full] {
                RingSlot::InFlight(buf) | RingSlot::Posted(buf) => buf,
                RingSlot::Idle => break,
            };
            let base = buf * self.buf_size;
            let flag_at = base + trailer_at + valid_offset();
            if self.buffers.read_u8(flag_at).map_or(true, |b| b & CHV_VALID == 0) {
                break;
            }

            let trailer = self
                .buffers
                .read(base + trailer_at, TRAILER_SIZE)
                .and_then(|raw| Trailer::decode(&raw));
            let frame = trailer.and_then(|trailer| {
                let range = payload_range(self.buf_size, &trailer)?;
                let payload = self.buffers.read(base + range.start, range.len())?;
                Some(RecvFrame { trailer, payload })
            });
            match frame {
                Some(frame) => frames.push(frame),
                None => log::warn!("ibvnic: dropping frame with bad trailer in buffer {}", buf),
            }

            self.buffers.write(flag_at, &[0]);
            self.free.push_back(buf);
            self.ring[self.next_full] = RingSlot::Idle;
            self.next_full = (self.next_full + 1) % self.pool_size();
        }
        frames
    }

    /// Send a kick if the republish kick timer expired.
    pub(crate) fn check_kick(&mut self, conn: &dyn Connection, now: Instant) -> Result<bool, TransportError> {
        if !self.kicker.due(now) {
            return Ok(false);
        }
        send_kick(conn)?;
        self.kicker.kicked();
        Ok(true)
    }

    #[inline]
    pub fn kick_deadline(&self) -> Option<Instant> {
        self.kicker.deadline()
    }

    pub fn accounting(&self) -> Accounting {
        let (mut posted, mut peer_owned) = (0, 0);
        for slot in &self.ring {
            match slot {
                RingSlot::InFlight(_) => posted += 1,
                RingSlot::Posted(_) => peer_owned += 1,
                RingSlot::Idle => {}
            }
        }
        Accounting {
            pool_size: self.pool_size(),
            free: self.free.len(),
            posted,
            peer_owned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::tests::RecordingConnection;

    const BUF: usize = 256;

    fn kicker() -> Kicker {
        Kicker::new(4, 0, Duration::from_micros(50))
    }

    fn writes(conn: &RecordingConnection) -> Vec<(u64, RemoteRegion, Vec<u8>)> {
        conn.sends
            .lock()
            .iter()
            .filter_map(|wr| match wr {
                WorkRequest::RdmaWrite {
                    wr_id,
                    remote,
                    payload,
                    ..
                } => Some((*wr_id, *remote, payload.clone())),
                _ => None,
            })
            .collect()
    }

    fn kicks(conn: &RecordingConnection) -> usize {
        conn.sends
            .lock()
            .iter()
            .filter(|wr| wr.wr_id() == WR_KICK)
            .count()
    }

    /// EIOC side: publish `n` buffers into the host transmit table.
    fn eioc_publish(pool: &XmitPool, slots: std::ops::Range<usize>) {
        for slot in slots {
            let bpe = Bpe {
                addr: 0x10_0000 + (slot * BUF) as u64,
                rkey: 77,
                valid: true,
            };
            pool.table().write(slot * BPE_SIZE, &bpe.encode());
        }
    }

    fn xmit_pool(pool_size: usize, bundle: usize) -> XmitPool {
        let table = Region::new(0x1000, pool_size * BPE_SIZE, 1, 2);
        XmitPool::new(table, BUF, bundle, kicker(), false)
    }

    #[test]
    fn test_xmit_needs_published_entry() {
        let conn = RecordingConnection::default();
        let mut pool = xmit_pool(8, 2);
        let now = Instant::now();

        assert!(matches!(
            pool.xmit(&conn, &[1; 60], Trailer::default(), now),
            Err(XmitError::NoBuffers)
        ));
        assert!(pool.is_stopped());
        assert!(!pool.try_wake());

        eioc_publish(&pool, 0..1);
        assert!(pool.try_wake());
        assert!(!pool.try_wake());
        pool.xmit(&conn, &[1; 60], Trailer::default(), now).unwrap();

        let w = writes(&conn);
        assert_eq!(w.len(), 1);
        let (_, remote, image) = &w[0];
        // Frame image ends exactly at the end of the EIOC buffer.
        assert_eq!(remote.addr + remote.len as u64, 0x10_0000 + BUF as u64);
        assert_eq!(remote.rkey, 77);
        assert!(Trailer::decode(image).unwrap().valid);
        assert!(!pool.bpe(0).unwrap().valid);
    }

    #[test]
    fn test_xmit_signals_every_bundle_and_recycles() {
        let conn = RecordingConnection::default();
        let mut pool = xmit_pool(16, 2);
        eioc_publish(&pool, 0..16);
        let now = Instant::now();

        // Four local buffers; the second and fourth sends are signaled.
        for _ in 0..4 {
            pool.xmit(&conn, &[0; 60], Trailer::default(), now).unwrap();
        }
        let signaled: Vec<bool> = conn
            .sends
            .lock()
            .iter()
            .filter(|wr| wr.wr_id() & WR_TAG_MASK == WR_XMIT)
            .map(WorkRequest::signaled)
            .collect();
        assert_eq!(signaled, vec![false, true, false, true]);

        assert!(matches!(
            pool.xmit(&conn, &[0; 60], Trailer::default(), now),
            Err(XmitError::NoBuffers)
        ));
        assert_eq!(pool.accounting().posted, 4);

        pool.complete(1);
        assert_eq!(pool.accounting().posted, 2);
        assert!(pool.try_wake());
        pool.complete(3);
        let acct = pool.accounting();
        assert_eq!(acct.posted, 0);
        assert_eq!(acct.peer_owned, 4);
        assert_eq!(acct.free, 12);
    }

    #[test]
    fn test_xmit_kicks_on_count_and_timer() {
        let (clock, mock) = quanta::Clock::mock();
        let conn = RecordingConnection::default();
        let mut pool = xmit_pool(16, 8);
        eioc_publish(&pool, 0..16);

        for _ in 0..3 {
            pool.xmit(&conn, &[0; 60], Trailer::default(), clock.now()).unwrap();
        }
        assert_eq!(kicks(&conn), 0);
        assert!(pool.kick_deadline().is_some());

        pool.xmit(&conn, &[0; 60], Trailer::default(), clock.now()).unwrap();
        assert_eq!(kicks(&conn), 1);
        let last = writes(&conn).pop().unwrap().2;
        assert!(Trailer::decode(&last).unwrap().pkt_flags.contains(PktFlags::KICK));
        assert!(pool.kick_deadline().is_none());

        pool.xmit(&conn, &[0; 60], Trailer::default(), clock.now()).unwrap();
        assert!(!pool.check_kick(&conn, clock.now()).unwrap());
        mock.increment(Duration::from_micros(50));
        assert!(pool.check_kick(&conn, clock.now()).unwrap());
        assert_eq!(kicks(&conn), 2);
    }

    #[test]
    fn test_xmit_rejects_oversized_frames() {
        let conn = RecordingConnection::default();
        let mut pool = xmit_pool(4, 2);
        eioc_publish(&pool, 0..4);
        let err = pool
            .xmit(&conn, &vec![0; BUF], Trailer::default(), Instant::now())
            .unwrap_err();
        assert!(matches!(err, XmitError::TooLong { max: 224, .. }));
        assert!(!pool.is_stopped());
    }

    fn recv_pool(pool_size: usize, per_update: usize) -> RecvPool {
        let buffers = Region::new(0x8000, pool_size * BUF, 3, 4);
        let mut pool = RecvPool::new(buffers, BUF, per_update, Kicker::new(1000, 0, Duration::from_micros(50)));
        pool.set_peer_table(RemoteRegion::new(0x9000, pool_size * BPE_SIZE, 5));
        pool
    }

    /// EIOC side: write a frame into the buffer published at `slot`.
    fn eioc_write(pool: &RecvPool, conn: &RecordingConnection, slot: usize, payload: &[u8]) {
        let (_, remote, bpes) = writes(conn)
            .into_iter()
            .rev()
            .find(|(_, r, _)| r.addr <= 0x9000 + (slot * BPE_SIZE) as u64 && 0x9000 + (slot * BPE_SIZE) as u64 <= r.addr + r.len as u64 - 1)
            .unwrap();
        let off = (0x9000 + (slot * BPE_SIZE) as u64 - remote.addr) as usize;
        let bpe = Bpe::decode(&bpes[off..off + BPE_SIZE]).unwrap();
        let image = frame_image(payload, Trailer { valid: true, ..Default::default() });
        assert!(pool
            .buffers()
            .write_at(bpe.addr + (BUF - image.len()) as u64, &image));
    }

    #[test]
    fn test_initial_publish_splits_nothing_and_forces_all() {
        let conn = RecordingConnection::default();
        let mut pool = recv_pool(10, 4);
        assert_eq!(pool.publish(&conn, true, Instant::now()).unwrap(), 10);
        let w = writes(&conn);
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].1, RemoteRegion::new(0x9000, 10 * BPE_SIZE, 5));
        let acct = pool.accounting();
        assert_eq!((acct.free, acct.posted, acct.peer_owned), (0, 10, 0));

        pool.complete_bundle(w[0].0);
        let acct = pool.accounting();
        assert_eq!((acct.free, acct.posted, acct.peer_owned), (0, 0, 10));
    }

    #[test]
    fn test_republish_waits_for_full_bundle() {
        let conn = RecordingConnection::default();
        let mut pool = recv_pool(8, 3);
        let now = Instant::now();
        pool.publish(&conn, true, now).unwrap();
        pool.complete_bundle(writes(&conn)[0].0);

        // Returning buffers one by one publishes nothing until three are free.
        for slot in 0..3 {
            eioc_write(&pool, &conn, slot, &[slot as u8; 64]);
            let frames = pool.poll_recv();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].payload, vec![slot as u8; 64]);
            let published = pool.publish(&conn, false, now).unwrap();
            assert_eq!(published, if slot == 2 { 3 } else { 0 });
            assert!(pool.accounting().balanced());
        }
        assert_eq!(writes(&conn).len(), 2);
    }

    #[test]
    fn test_republish_splits_at_wrap() {
        let conn = RecordingConnection::default();
        let mut pool = recv_pool(4, 3);
        let now = Instant::now();
        pool.publish(&conn, true, now).unwrap();
        pool.complete_bundle(writes(&conn)[0].0);

        for slot in 0..3 {
            eioc_write(&pool, &conn, slot, &[1; 60]);
        }
        assert_eq!(pool.poll_recv().len(), 3);
        // Ring slots 0, 1 and 2 are contiguous: one write.
        assert_eq!(pool.publish(&conn, false, now).unwrap(), 3);
        pool.complete_bundle(writes(&conn)[1].0);

        eioc_write(&pool, &conn, 3, &[2; 60]);
        eioc_write(&pool, &conn, 0, &[3; 60]);
        eioc_write(&pool, &conn, 1, &[4; 60]);
        let frames = pool.poll_recv();
        assert_eq!(
            frames.iter().map(|f| f.payload[0]).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        // Ring slots 3, 0 and 1 wrap around: two writes.
        assert_eq!(pool.publish(&conn, false, now).unwrap(), 3);
        let w = writes(&conn);
        assert_eq!(w.len(), 4);
        assert_eq!(w[2].1, RemoteRegion::new(0x9000 + 3 * BPE_SIZE as u64, BPE_SIZE, 5));
        assert_eq!(w[3].1, RemoteRegion::new(0x9000, 2 * BPE_SIZE, 5));
        assert!(pool.accounting().balanced());
    }

    #[test]
    fn test_poll_stops_at_first_empty_buffer() {
        let conn = RecordingConnection::default();
        let mut pool = recv_pool(4, 4);
        pool.publish(&conn, true, Instant::now()).unwrap();
        // A frame in slot 1 is not seen while slot 0 is still empty.
        eioc_write(&pool, &conn, 1, &[9; 60]);
        assert!(pool.poll_recv().is_empty());
        eioc_write(&pool, &conn, 0, &[8; 60]);
        let frames = pool.poll_recv();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload[0], 8);
        assert_eq!(frames[1].payload[0], 9);
        assert!(pool.accounting().balanced());
    }

    #[test]
    fn test_republish_kicks() {
        let conn = RecordingConnection::default();
        let buffers = Region::new(0x8000, 4 * BUF, 3, 4);
        let mut pool = RecvPool::new(buffers, BUF, 1, Kicker::new(2, 0, Duration::from_micros(50)));
        pool.set_peer_table(RemoteRegion::new(0x9000, 4 * BPE_SIZE, 5));
        pool.publish(&conn, true, Instant::now()).unwrap();
        assert_eq!(kicks(&conn), 1);
    }

    #[test]
    fn test_bpe_layout() {
        let bpe = Bpe {
            addr: 0x0102_0304_0506_0708,
            rkey: 0x0a0b_0c0d,
            valid: true,
        };
        let raw = bpe.encode();
        assert_eq!(&raw[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&raw[12..], &[0, 0, 0, 1]);
        assert_eq!(Bpe::decode(&raw), Some(bpe));
        assert_eq!(Bpe::decode(&raw[..10]), None);
    }
}
