//! Byte staging for the write path. An [`IoBuffer`] is an ordered list of
//! reference-counted segments plus a mutable tail for small-write
//! coalescing; moving bytes between buffers transfers segment ownership
//! without copying.

use std::{cmp::min, collections::VecDeque};

use bytes::{Bytes, BytesMut};
use sorafs_common::{checksum::ChecksumAccum, Offset, CHECKSUM_BLOCK_SIZE};

/// Copies into the tail are frozen into a shared segment once the tail
/// reaches this size, bounding the cost of later appends.
const TAIL_FREEZE_SIZE: usize = 64 << 10;

#[derive(Debug, Default)]
pub struct IoBuffer {
    segs: VecDeque<Bytes>,
    tail: BytesMut,
    len: usize,
}

impl IoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.copy_from_slice(data);
        buf
    }

    pub fn from_bytes(data: Bytes) -> Self {
        let mut buf = Self::new();
        buf.append(data);
        buf
    }

    pub fn bytes_consumable(&self) -> Offset {
        self.len as Offset
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.segs.clear();
        self.tail.clear();
        self.len = 0;
    }

    /// Appends a segment by reference.
    pub fn append(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.flatten_tail();
        self.len += data.len();
        self.segs.push_back(data);
    }

    /// Copies bytes into the mutable tail.
    pub fn copy_from_slice(&mut self, data: &[u8]) {
        self.tail.extend_from_slice(data);
        self.len += data.len();
        if self.tail.len() >= TAIL_FREEZE_SIZE {
            self.flatten_tail();
        }
    }

    /// Transfers up to `count` bytes from the front of `src` by reference.
    /// Returns the number of bytes moved.
    pub fn move_from(&mut self, src: &mut IoBuffer, count: Offset) -> Offset {
        let mut remaining = min(count.max(0), src.bytes_consumable()) as usize;
        let moved = remaining;
        if remaining == 0 {
            return 0;
        }
        src.flatten_tail();
        self.flatten_tail();
        while remaining > 0 {
            let mut seg = src.segs.pop_front().expect("segment accounting");
            if seg.len() <= remaining {
                remaining -= seg.len();
                src.len -= seg.len();
                self.len += seg.len();
                self.segs.push_back(seg);
            } else {
                let head = seg.split_to(remaining);
                src.segs.push_front(seg);
                src.len -= remaining;
                self.len += remaining;
                self.segs.push_back(head);
                remaining = 0;
            }
        }
        moved as Offset
    }

    /// Consumes up to `count` bytes from the front of `src`, copying them
    /// into the tail so existing segments stay full.
    pub fn copy_from(&mut self, src: &mut IoBuffer, count: Offset) -> Offset {
        let mut remaining = min(count.max(0), src.bytes_consumable()) as usize;
        let copied = remaining;
        src.flatten_tail();
        while remaining > 0 {
            let mut seg = src.segs.pop_front().expect("segment accounting");
            let n = min(seg.len(), remaining);
            self.tail.extend_from_slice(&seg[..n]);
            self.len += n;
            src.len -= n;
            remaining -= n;
            if n < seg.len() {
                let rest = seg.split_off(n);
                src.segs.push_front(rest);
            }
            if self.tail.len() >= TAIL_FREEZE_SIZE {
                self.flatten_tail();
            }
        }
        copied as Offset
    }

    /// Compacts every segment into one contiguous buffer, releasing the
    /// partially-filled ones accumulated by reference moves.
    pub fn make_buffers_full(&mut self) {
        if self.segs.len() <= 1 && self.tail.is_empty() {
            return;
        }
        let mut merged = BytesMut::with_capacity(self.len);
        for seg in &self.segs {
            merged.extend_from_slice(seg);
        }
        merged.extend_from_slice(&self.tail);
        self.segs.clear();
        self.tail.clear();
        self.segs.push_back(merged.freeze());
    }

    /// Drops up to `count` bytes from the front.
    pub fn consume(&mut self, count: Offset) -> Offset {
        let mut scratch = IoBuffer::new();
        scratch.move_from(self, count)
    }

    /// Shares the current contents as reference-counted segments, e.g. for a
    /// transport payload.
    pub fn share(&mut self) -> Vec<Bytes> {
        self.flatten_tail();
        self.segs.iter().cloned().collect()
    }

    pub fn slices(&self) -> impl Iterator<Item = &[u8]> {
        self.segs
            .iter()
            .map(|b| b.as_ref())
            .chain(std::iter::once(self.tail.as_ref()))
            .filter(|s: &&[u8]| !s.is_empty())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for s in self.slices() {
            out.extend_from_slice(s);
        }
        out
    }

    /// Single checksum over the first `num_bytes` of the payload.
    pub fn composite_checksum(&self, num_bytes: Offset) -> u32 {
        let mut remaining = min(num_bytes.max(0) as usize, self.len);
        let mut accum = ChecksumAccum::new();
        for s in self.slices() {
            if remaining == 0 {
                break;
            }
            let n = min(s.len(), remaining);
            accum.update(&s[..n]);
            remaining -= n;
        }
        accum.finish()
    }

    /// Per-checksum-block checksums over the first `num_bytes`, block
    /// boundaries relative to the payload start. Also returns the composite.
    pub fn block_checksums(&self, num_bytes: Offset) -> (u32, Vec<u32>) {
        let total = min(num_bytes.max(0) as usize, self.len);
        let block = CHECKSUM_BLOCK_SIZE as usize;
        let mut checksums = Vec::with_capacity(total / block + 1);
        let mut composite = ChecksumAccum::new();
        let mut current = ChecksumAccum::new();
        let mut remaining = total;
        for s in self.slices() {
            let mut s = &s[..min(s.len(), remaining)];
            remaining -= s.len();
            while !s.is_empty() {
                let room = block - current.len();
                let n = min(room, s.len());
                current.update(&s[..n]);
                composite.update(&s[..n]);
                if current.len() == block {
                    checksums.push(std::mem::take(&mut current).finish());
                }
                s = &s[n..];
            }
        }
        if !current.is_empty() {
            checksums.push(current.finish());
        }
        (composite.finish(), checksums)
    }

    fn flatten_tail(&mut self) {
        if !self.tail.is_empty() {
            let frozen = std::mem::take(&mut self.tail).freeze();
            self.segs.push_back(frozen);
        }
    }
}
