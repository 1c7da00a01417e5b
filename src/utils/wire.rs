//! Big-endian cursors over fixed-size wire buffers.

/// A read past the end of a wire buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Truncated {
    pub needed: usize,
    pub available: usize,
}

/// Sequential big-endian writer.
///
/// Writes past the end of the buffer are a layout bug and panic on the slice
/// index, so callers size their bodies against the fixed packet length.
pub(crate) struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    #[inline]
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        self
    }

    #[inline]
    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.put_bytes(&[v])
    }

    #[inline]
    pub fn put_i8(&mut self, v: i8) -> &mut Self {
        self.put_bytes(&v.to_be_bytes())
    }

    #[inline]
    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.put_bytes(&v.to_be_bytes())
    }

    #[inline]
    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.put_bytes(&v.to_be_bytes())
    }

    #[inline]
    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.put_bytes(&v.to_be_bytes())
    }

    /// Skip `n` bytes, zero-filling them.
    #[inline]
    pub fn skip(&mut self, n: usize) -> &mut Self {
        self.buf[self.pos..self.pos + n].fill(0);
        self.pos += n;
        self
    }
}

/// Sequential big-endian reader.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], Truncated> {
        if self.remaining() < n {
            return Err(Truncated {
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], Truncated> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    #[inline]
    pub fn u8(&mut self) -> Result<u8, Truncated> {
        Ok(self.array::<1>()?[0])
    }

    #[inline]
    pub fn i8(&mut self) -> Result<i8, Truncated> {
        Ok(i8::from_be_bytes(self.array()?))
    }

    #[inline]
    pub fn u16(&mut self) -> Result<u16, Truncated> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    #[inline]
    pub fn u32(&mut self) -> Result<u32, Truncated> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    #[inline]
    pub fn u64(&mut self) -> Result<u64, Truncated> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    #[inline]
    pub fn skip(&mut self, n: usize) -> Result<(), Truncated> {
        self.bytes(n).map(|_| ())
    }
}
