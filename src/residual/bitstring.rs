//! LSB-first bit packing of variable-width sub-codes.

/// Appends fields of arbitrary width to a zeroed byte buffer, least significant bit first.
#[derive(Debug)]
pub struct BitstringWriter<'a> {
    code: &'a mut [u8],
    i: usize,
}

impl<'a> BitstringWriter<'a> {
    /// Writer over `code`, which is cleared.
    pub fn new(code: &'a mut [u8]) -> Self {
        code.fill(0);
        Self { code, i: 0 }
    }

    /// Append the low `nbit` bits of `x`.
    pub fn write(&mut self, x: u64, nbit: usize) {
        debug_assert!(self.i + nbit <= self.code.len() * 8);
        let mut x = x & low_mask(nbit);
        let mut left = nbit;
        while left > 0 {
            let off = self.i & 7;
            let take = (8 - off).min(left);
            self.code[self.i >> 3] |= ((x & low_mask(take)) as u8) << off;
            x >>= take;
            left -= take;
            self.i += take;
        }
    }

    /// Bits written so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.i
    }
}

/// Reads fields written by [`BitstringWriter`].
#[derive(Debug, Clone)]
pub struct BitstringReader<'a> {
    code: &'a [u8],
    i: usize,
}

impl<'a> BitstringReader<'a> {
    /// Reader at bit 0 of `code`.
    #[must_use]
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, i: 0 }
    }

    /// Read the next `nbit` bits.
    pub fn read(&mut self, nbit: usize) -> u64 {
        debug_assert!(self.i + nbit <= self.code.len() * 8);
        let mut res = 0u64;
        let mut got = 0;
        while got < nbit {
            let off = self.i & 7;
            let take = (8 - off).min(nbit - got);
            let bits = (u64::from(self.code[self.i >> 3]) >> off) & low_mask(take);
            res |= bits << got;
            got += take;
            self.i += take;
        }
        res
    }
}

#[inline]
fn low_mask(nbit: usize) -> u64 {
    if nbit >= 64 {
        u64::MAX
    } else {
        (1u64 << nbit) - 1
    }
}
