use crate::control::wire::AddressOp;
use crate::transport::Gid;

/// Index of the broadcast entry.
pub const BROADCAST_INDEX: usize = 0;

/// Index of the unicast entry.
pub const UNICAST_INDEX: usize = 1;

/// First multicast entry.
pub const MCAST_BASE_INDEX: usize = 2;

const BROADCAST_MAC: [u8; 6] = [0xff; 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
struct Entry {
    mac: [u8; 6],
    vlan: u16,
    valid: bool,
    dirty: bool,
}

/// The EIOC-side address filter of one viport, mirrored locally.
///
/// Only allocated once `InitVnic` told how many entries the EIOC has.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AddressTable {
    entries: Vec<Entry>,
    vlan: u16,
    /// More multicast addresses were requested than the table holds.
    overflow: bool,
}

impl AddressTable {
    /// Create a table of `size` entries with broadcast and `unicast` set.
    pub fn new(size: usize, unicast: [u8; 6], vlan: u16) -> Self {
        let blank = Entry {
            mac: [0; 6],
            vlan,
            valid: false,
            dirty: false,
        };
        let mut entries = vec![blank; size.max(MCAST_BASE_INDEX)];
        entries[BROADCAST_INDEX] = Entry {
            mac: BROADCAST_MAC,
            valid: true,
            dirty: true,
            ..blank
        };
        entries[UNICAST_INDEX] = Entry {
            mac: unicast,
            valid: true,
            dirty: true,
            ..blank
        };
        Self {
            entries,
            vlan,
            overflow: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Multicast entries available.
    #[inline]
    pub fn mcast_capacity(&self) -> usize {
        self.entries.len() - MCAST_BASE_INDEX
    }

    /// Whether the multicast list overflowed and all-multicast is needed.
    #[inline]
    pub fn overflow(&self) -> bool {
        self.overflow
    }

    /// Get the unicast MAC.
    #[inline]
    pub fn unicast(&self) -> [u8; 6] {
        self.entries[UNICAST_INDEX].mac
    }

    fn set(&mut self, index: usize, mac: [u8; 6], valid: bool) {
        let e = &mut self.entries[index];
        if e.valid != valid || (valid && e.mac != mac) {
            e.mac = if valid { mac } else { [0; 6] };
            e.valid = valid;
            e.dirty = true;
        }
    }

    /// Change the unicast address.
    pub fn set_unicast(&mut self, mac: [u8; 6]) {
        self.set(UNICAST_INDEX, mac, true);
    }

    /// Replace the multicast list. Returns `true` if the overflow state
    /// changed, in which case the link flags must be pushed too.
    pub fn set_multicast(&mut self, macs: &[[u8; 6]]) -> bool {
        let overflow = macs.len() > self.mcast_capacity();
        for i in 0..self.mcast_capacity() {
            match macs.get(i) {
                Some(mac) if !overflow => self.set(MCAST_BASE_INDEX + i, *mac, true),
                _ => self.set(MCAST_BASE_INDEX + i, [0; 6], false),
            }
        }
        let changed = overflow != self.overflow;
        self.overflow = overflow;
        changed
    }

    /// Whether any entry still has to be sent.
    pub fn has_dirty(&self) -> bool {
        self.entries.iter().any(|e| e.dirty)
    }

    /// Up to `max` dirty entries as address operations, lowest index first.
    pub fn dirty_ops(&self, max: usize) -> Vec<AddressOp> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.dirty)
            .take(max)
            .map(|(i, e)| AddressOp {
                index: i as u16,
                set: true,
                valid: e.valid,
                mac: e.mac,
                vlan: self.vlan,
                mgid: Gid::ZERO,
            })
            .collect()
    }

    /// The EIOC accepted `ops`; entries not changed since are clean.
    pub fn ack(&mut self, ops: &[AddressOp]) {
        for op in ops {
            if let Some(e) = self.entries.get_mut(op.index as usize) {
                if e.valid == op.valid && (!e.valid || e.mac == op.mac) {
                    e.dirty = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x00, 0x06, 0x6a, 0x00, 0x00, 0x01];

    fn mcast(i: u8) -> [u8; 6] {
        [0x01, 0x00, 0x5e, 0x00, 0x00, i]
    }

    #[test]
    fn test_new_table_sends_broadcast_and_unicast() {
        let t = AddressTable::new(8, MAC, 0);
        let ops = t.dirty_ops(20);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].mac, BROADCAST_MAC);
        assert_eq!(ops[1].mac, MAC);
        assert_eq!(t.mcast_capacity(), 6);
    }

    #[test]
    fn test_only_changed_entries_are_sent_in_batches() {
        let mut t = AddressTable::new(16, MAC, 0);
        let ops = t.dirty_ops(20);
        t.ack(&ops);
        assert!(!t.has_dirty());

        let list: Vec<_> = (0..10).map(mcast).collect();
        assert!(!t.set_multicast(&list));
        let first = t.dirty_ops(8);
        assert_eq!(first.len(), 8);
        assert_eq!(first[0].index as usize, MCAST_BASE_INDEX);
        t.ack(&first);
        let rest = t.dirty_ops(8);
        assert_eq!(rest.len(), 2);
        t.ack(&rest);
        assert!(!t.has_dirty());

        // Setting the same list again changes nothing.
        t.set_multicast(&list);
        assert!(!t.has_dirty());
    }

    #[test]
    fn test_change_during_request_stays_dirty() {
        let mut t = AddressTable::new(4, MAC, 0);
        let ops = t.dirty_ops(20);
        t.set_unicast([0x00, 0x06, 0x6a, 0x00, 0x00, 0x02]);
        t.ack(&ops);
        let again = t.dirty_ops(20);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].index as usize, UNICAST_INDEX);
    }

    #[test]
    fn test_overflow_clears_multicast_entries() {
        let mut t = AddressTable::new(4, MAC, 0);
        t.ack(&t.dirty_ops(20));
        assert!(!t.set_multicast(&[mcast(1), mcast(2)]));
        t.ack(&t.dirty_ops(20));

        assert!(t.set_multicast(&[mcast(1), mcast(2), mcast(3)]));
        assert!(t.overflow());
        let ops = t.dirty_ops(20);
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| !op.valid));

        t.ack(&ops);
        assert!(t.set_multicast(&[mcast(1)]));
        assert!(!t.overflow());
    }
}
