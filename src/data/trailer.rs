//! Data-path frame trailer and buffer layout.
//!
//! A frame written into a peer receive buffer is laid out as
//!
//! ```text
//! | unused | payload | pad (0..8) | trailer (32) |
//!                                               ^ end of buffer
//! ```
//!
//! so the receiver finds the trailer at a fixed place and polls its last
//! byte for the hand-off flag.

use memoffset::offset_of;

use crate::utils::wire::{Reader, Writer};

/// Size of the trailer on the wire.
pub const TRAILER_SIZE: usize = 32;

/// Shortest Ethernet frame without FCS.
pub const MIN_FRAME_LEN: usize = 60;

/// Ethernet destination plus source address.
const ETH_ALEN2: usize = 12;

/// 802.1Q tag protocol identifier.
pub const ETH_P_8021Q: u16 = 0x8100;

/// Hand-off bit in the last trailer byte.
pub const CHV_VALID: u8 = 0x80;

/// Wire layout of the trailer. Only used to pin the field offsets.
#[repr(C)]
#[allow(dead_code)]
struct RawTrailer {
    data_alignment_offset: i8,
    rsvd1: u8,
    data_length: u16,
    pkt_flags: u8,
    tx_chksum_flags: u8,
    rx_chksum_flags: u8,
    rsvd2: u8,
    tcp_seq_no: u32,
    rsvd3: [u8; 8],
    dest_mac_addr: [u8; 6],
    vlan: u16,
    time_stamp: u16,
    rsvd4: u8,
    connection_hash_and_valid: u8,
}

/// Offset of the hand-off byte within the trailer.
#[inline]
pub fn valid_offset() -> usize {
    offset_of!(RawTrailer, connection_hash_and_valid)
}

/// Per-frame flags.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PktFlags(u8);

impl PktFlags {
    pub const CHASH_VALID: Self = Self(0x01);
    pub const IPSEC: Self = Self(0x02);
    pub const TCP_SEGMENT: Self = Self(0x04);
    pub const KICK: Self = Self(0x08);
    pub const VLAN_INSERT: Self = Self(0x10);
    pub const PVID_OVERRIDDEN: Self = Self(0x20);
    pub const FCS_INCLUDED: Self = Self(0x40);
    pub const FORCE_ROUTE: Self = Self(0x80);
}

impl_flag_set!(PktFlags, u8);

/// Checksums the EIOC is asked to compute on transmit.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TxCsumFlags(u8);

impl TxCsumFlags {
    pub const IPV4: Self = Self(0x01);
    pub const IPV6: Self = Self(0x02);
    pub const TCP: Self = Self(0x04);
    pub const UDP: Self = Self(0x08);
}

impl_flag_set!(TxCsumFlags, u8);

/// Checksum results the EIOC reports on receive.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RxCsumFlags(u8);

impl RxCsumFlags {
    pub const TCP_FAILED: Self = Self(0x01);
    pub const UDP_FAILED: Self = Self(0x02);
    pub const IP_FAILED: Self = Self(0x04);
    pub const TCP_SUCCEEDED: Self = Self(0x08);
    pub const UDP_SUCCEEDED: Self = Self(0x10);
    pub const IP_SUCCEEDED: Self = Self(0x20);
    pub const LOOPBACK: Self = Self(0x40);
}

impl_flag_set!(RxCsumFlags, u8);

/// Decoded frame trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trailer {
    /// Pad bytes between the payload and the trailer.
    pub alignment_offset: i8,
    /// Payload length.
    pub length: u16,
    pub pkt_flags: PktFlags,
    pub tx_csum: TxCsumFlags,
    pub rx_csum: RxCsumFlags,
    pub tcp_seq: u32,
    pub dest_mac: [u8; 6],
    /// VLAN tag control information to reinsert when `VLAN_INSERT` is set.
    pub vlan: u16,
    pub timestamp: u16,
    /// Connection hash, low seven bits.
    pub conn_hash: u8,
    /// Hand-off flag.
    pub valid: bool,
}

impl Trailer {
    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; TRAILER_SIZE] {
        let mut buf = [0u8; TRAILER_SIZE];
        let chv = (self.conn_hash & !CHV_VALID) | if self.valid { CHV_VALID } else { 0 };
        Writer::new(&mut buf)
            .put_i8(self.alignment_offset)
            .skip(1)
            .put_u16(self.length)
            .put_u8(self.pkt_flags.bits())
            .put_u8(self.tx_csum.bits())
            .put_u8(self.rx_csum.bits())
            .skip(1)
            .put_u32(self.tcp_seq)
            .skip(8)
            .put_bytes(&self.dest_mac)
            .put_u16(self.vlan)
            .put_u16(self.timestamp)
            .skip(1)
            .put_u8(chv);
        buf
    }

    /// Decode from the last [`TRAILER_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let start = buf.len().checked_sub(TRAILER_SIZE)?;
        let mut r = Reader::new(&buf[start..]);
        let mut read = || -> Result<Self, crate::utils::wire::Truncated> {
            let alignment_offset = r.i8()?;
            r.skip(1)?;
            let length = r.u16()?;
            let pkt_flags = PktFlags::from_bits(r.u8()?);
            let tx_csum = TxCsumFlags::from_bits(r.u8()?);
            let rx_csum = RxCsumFlags::from_bits(r.u8()?);
            r.skip(1)?;
            let tcp_seq = r.u32()?;
            r.skip(8)?;
            let dest_mac = r.array()?;
            let vlan = r.u16()?;
            let timestamp = r.u16()?;
            r.skip(1)?;
            let chv = r.u8()?;
            Ok(Self {
                alignment_offset,
                length,
                pkt_flags,
                tx_csum,
                rx_csum,
                tcp_seq,
                dest_mac,
                vlan,
                timestamp,
                conn_hash: chv & !CHV_VALID,
                valid: chv & CHV_VALID != 0,
            })
        };
        read().ok()
    }
}

/// Pad bytes needed to align a payload of `len` bytes to 8.
#[inline]
pub fn pad_len(len: usize) -> usize {
    (8 - len % 8) % 8
}

/// Build the bytes written into a peer buffer: payload, pad, trailer. The
/// trailer's length and alignment offset are filled in here.
pub fn frame_image(payload: &[u8], mut trailer: Trailer) -> Vec<u8> {
    let pad = pad_len(payload.len());
    trailer.alignment_offset = pad as i8;
    trailer.length = payload.len() as u16;

    let mut out = Vec::with_capacity(payload.len() + pad + TRAILER_SIZE);
    out.extend_from_slice(payload);
    out.resize(payload.len() + pad, 0);
    out.extend_from_slice(&trailer.encode());
    out
}

/// Locate the payload of a frame occupying a whole buffer of `buf_size`
/// bytes, given its trailer. Returns `None` if the trailer is inconsistent.
pub fn payload_range(buf_size: usize, trailer: &Trailer) -> Option<std::ops::Range<usize>> {
    let pad = usize::try_from(trailer.alignment_offset).ok()?;
    if pad >= 8 {
        return None;
    }
    let end = buf_size.checked_sub(TRAILER_SIZE + pad)?;
    let start = end.checked_sub(trailer.length as usize)?;
    Some(start..end)
}

/// Remove an 802.1Q tag from an outbound frame, shifting the MAC addresses
/// over it. Frames that end up shorter than [`MIN_FRAME_LEN`] are
/// zero-padded. Returns the tag control information if a tag was removed.
pub fn strip_vlan(frame: &mut Vec<u8>) -> Option<u16> {
    if frame.len() < ETH_ALEN2 + 4 || frame[ETH_ALEN2..ETH_ALEN2 + 2] != ETH_P_8021Q.to_be_bytes() {
        return None;
    }
    let tci = u16::from_be_bytes([frame[ETH_ALEN2 + 2], frame[ETH_ALEN2 + 3]]);
    frame.copy_within(0..ETH_ALEN2, 4);
    frame.drain(..4);
    if frame.len() < MIN_FRAME_LEN {
        frame.resize(MIN_FRAME_LEN, 0);
    }
    Some(tci)
}

/// Insert an 802.1Q tag after the MAC addresses of an inbound frame. Frames
/// too short to carry both addresses are left alone and `false` returned.
pub fn insert_vlan(frame: &mut Vec<u8>, tci: u16) -> bool {
    if frame.len() < ETH_ALEN2 {
        return false;
    }
    let [p0, p1] = ETH_P_8021Q.to_be_bytes();
    let [t0, t1] = tci.to_be_bytes();
    frame.splice(ETH_ALEN2..ETH_ALEN2, [p0, p1, t0, t1]);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged_frame(payload_len: usize, tci: u16) -> Vec<u8> {
        let mut f = vec![0xd0, 0xd1, 0xd2, 0xd3, 0xd4, 0xd5, 0x50, 0x51, 0x52, 0x53, 0x54, 0x55];
        f.extend_from_slice(&ETH_P_8021Q.to_be_bytes());
        f.extend_from_slice(&tci.to_be_bytes());
        f.extend_from_slice(&0x0800u16.to_be_bytes());
        f.extend((0..payload_len).map(|i| i as u8));
        f
    }

    #[test]
    fn test_layout_is_pinned() {
        assert_eq!(std::mem::size_of::<RawTrailer>(), TRAILER_SIZE);
        assert_eq!(offset_of!(RawTrailer, data_length), 2);
        assert_eq!(offset_of!(RawTrailer, tcp_seq_no), 8);
        assert_eq!(offset_of!(RawTrailer, dest_mac_addr), 20);
        assert_eq!(offset_of!(RawTrailer, vlan), 26);
        assert_eq!(valid_offset(), TRAILER_SIZE - 1);

        let t = Trailer {
            length: 0x0102,
            vlan: 0x0a0b,
            valid: true,
            conn_hash: 0x05,
            ..Default::default()
        };
        let raw = t.encode();
        assert_eq!(&raw[2..4], &[0x01, 0x02]);
        assert_eq!(&raw[26..28], &[0x0a, 0x0b]);
        assert_eq!(raw[valid_offset()], CHV_VALID | 0x05);
        assert_eq!(Trailer::decode(&raw), Some(t));
    }

    #[test]
    fn test_image_ends_in_trailer() {
        for len in [0usize, 1, 7, 8, 9, 1514] {
            let payload = vec![0xaa; len];
            let image = frame_image(&payload, Trailer { valid: true, ..Default::default() });
            assert_eq!(image.len() % 8, 0);
            let t = Trailer::decode(&image).unwrap();
            assert_eq!(t.length as usize, len);
            assert_eq!(t.alignment_offset as usize, pad_len(len));

            // Placed at the end of a 2048-byte buffer, the payload is found again.
            let mut buf = vec![0u8; 2048];
            let at = buf.len() - image.len();
            buf[at..].copy_from_slice(&image);
            let range = payload_range(buf.len(), &t).unwrap();
            assert_eq!(&buf[range], payload.as_slice());
        }
    }

    #[test]
    fn test_inconsistent_trailer() {
        let t = Trailer {
            length: 4000,
            ..Default::default()
        };
        assert_eq!(payload_range(2048, &t), None);
        let t = Trailer {
            alignment_offset: -1,
            ..Default::default()
        };
        assert_eq!(payload_range(2048, &t), None);
    }

    #[test]
    fn test_strip_vlan_shifts_macs() {
        let mut f = tagged_frame(100, 0x2005);
        let orig = f.clone();
        assert_eq!(strip_vlan(&mut f), Some(0x2005));
        assert_eq!(f.len(), orig.len() - 4);
        assert_eq!(&f[..12], &orig[..12]);
        assert_eq!(&f[12..], &orig[16..]);
    }

    #[test]
    fn test_strip_vlan_pads_short_frames() {
        // 64 bytes tagged: 60 after stripping, no pad needed.
        let mut f = tagged_frame(64 - 18, 1);
        strip_vlan(&mut f);
        assert_eq!(f.len(), MIN_FRAME_LEN);

        // 62 bytes tagged: 58 after stripping, padded to 60 with zeroes.
        let mut f = tagged_frame(62 - 18, 1);
        let orig = f.clone();
        strip_vlan(&mut f);
        assert_eq!(f.len(), MIN_FRAME_LEN);
        assert_eq!(&f[12..58], &orig[16..]);
        assert_eq!(&f[58..], &[0, 0]);
    }

    #[test]
    fn test_strip_vlan_ignores_untagged_and_runts() {
        let mut f = tagged_frame(10, 7);
        f[12] = 0x08;
        f[13] = 0x00;
        let orig = f.clone();
        assert_eq!(strip_vlan(&mut f), None);
        assert_eq!(f, orig);

        let mut runt = tagged_frame(0, 7);
        runt.truncate(15);
        assert_eq!(strip_vlan(&mut runt), None);
        assert_eq!(runt.len(), 15);
    }

    #[test]
    fn test_insert_then_strip() {
        let mut f = tagged_frame(50, 0x0123);
        let orig = f.clone();
        let tci = strip_vlan(&mut f).unwrap();
        assert!(insert_vlan(&mut f, tci));
        assert_eq!(&f[..orig.len()], orig.as_slice());

        let mut short = vec![1, 2, 3];
        assert!(!insert_vlan(&mut short, 5));
        assert_eq!(short, vec![1, 2, 3]);
    }
}
