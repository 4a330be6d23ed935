//! Checksums attached to write-prepare ops, one per checksum block plus a
//! composite over the whole payload.

use crc32fast::Hasher;

pub const NULL_CHECKSUM: u32 = 0;

/// Streaming checksum over possibly discontiguous payload segments.
pub struct ChecksumAccum {
    hasher: Hasher,
    len: usize,
}

impl ChecksumAccum {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len();
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish(self) -> u32 {
        self.hasher.finalize()
    }
}

impl Default for ChecksumAccum {
    fn default() -> Self {
        Self::new()
    }
}

pub fn checksum_of(data: &[u8]) -> u32 {
    let mut accum = ChecksumAccum::new();
    accum.update(data);
    accum.finish()
}
