use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// Remote registered memory.
///
/// This structure describes a memory area owned by the peer and does not hold
/// any resources locally. It can represent a part of a larger remote region
/// by letting `addr` and `len` cover only that part.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemoteRegion {
    pub addr: u64,
    pub len: usize,
    pub rkey: u32,
}

impl RemoteRegion {
    /// Create a new piece of remote registered memory data.
    pub fn new(addr: u64, len: usize, rkey: u32) -> Self {
        Self { addr, len, rkey }
    }

    /// Get an address at the given offset.
    #[inline]
    pub fn at(&self, offset: usize) -> u64 {
        self.addr + offset as u64
    }

    /// Get the sub-region `[offset, offset + len)`, or `None` if it is out of
    /// bounds.
    #[inline]
    pub fn slice(&self, offset: usize, len: usize) -> Option<Self> {
        (offset.checked_add(len)? <= self.len).then(|| Self::new(self.at(offset), len, self.rkey))
    }
}

struct RegionInner {
    addr: u64,
    lkey: u32,
    rkey: u32,
    buf: Mutex<Box<[u8]>>,
}

/// A memory area registered with the transport.
///
/// The transport hands out the address and keys; the bytes themselves are
/// held here so that the engine and the transport (which performs incoming
/// RDMA writes) see the same memory. Cloning a `Region` clones a reference.
#[derive(Clone)]
pub struct Region {
    inner: Arc<RegionInner>,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("addr", &format_args!("{:#x}", self.inner.addr))
            .field("len", &self.len())
            .field("rkey", &self.inner.rkey)
            .finish()
    }
}

impl Region {
    /// Allocate zeroed memory of the given length with the given registration
    /// identity. Transports call this from their `register` implementation.
    pub fn new(addr: u64, len: usize, lkey: u32, rkey: u32) -> Self {
        Self {
            inner: Arc::new(RegionInner {
                addr,
                lkey,
                rkey,
                buf: Mutex::new(vec![0u8; len].into_boxed_slice()),
            }),
        }
    }

    fn bytes(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.inner.buf.lock()
    }

    /// Get the registered start address.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.inner.addr
    }

    /// Get the length of the registered memory.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// Whether the registered memory is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> u32 {
        self.inner.lkey
    }

    /// Get the remote key of the memory region.
    #[inline]
    pub fn rkey(&self) -> u32 {
        self.inner.rkey
    }

    /// Whether `[addr, addr + len)` falls inside this region.
    #[inline]
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.addr() && addr + len as u64 <= self.addr() + self.len() as u64
    }

    /// Describe a sub-range of this region for the peer.
    #[inline]
    pub fn remote(&self, r: Range<usize>) -> RemoteRegion {
        RemoteRegion::new(self.addr() + r.start as u64, r.end - r.start, self.rkey())
    }

    /// Describe the whole region for the peer.
    #[inline]
    pub fn as_remote(&self) -> RemoteRegion {
        self.remote(0..self.len())
    }

    /// Copy bytes out of the region. Returns `None` if out of bounds.
    pub fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let buf = self.bytes();
        buf.get(offset..offset.checked_add(len)?).map(<[u8]>::to_vec)
    }

    /// Read a single byte. Returns `None` if out of bounds.
    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.bytes().get(offset).copied()
    }

    /// Copy bytes into the region. Returns `false` if out of bounds.
    pub fn write(&self, offset: usize, data: &[u8]) -> bool {
        let mut buf = self.bytes();
        match offset
            .checked_add(data.len())
            .and_then(|end| buf.get_mut(offset..end))
        {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Copy bytes into the region at an absolute registered address, as an
    /// incoming RDMA write does. Returns `false` if out of bounds.
    pub fn write_at(&self, addr: u64, data: &[u8]) -> bool {
        if !self.contains(addr, data.len()) {
            return false;
        }
        self.write((addr - self.addr()) as usize, data)
    }
}
