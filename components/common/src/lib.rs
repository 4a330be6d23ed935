pub mod checksum;

/// Byte offset or byte count within a file or a chunk.
pub type Offset = i64;
/// Wall-clock seconds as observed by the host event loop. The core never
/// reads a clock itself; every entry point takes the current time as an
/// argument.
pub type TimeSec = i64;

pub type FileId = i64;
pub type ChunkId = i64;
pub type ChunkVersion = i64;
pub type SeqNum = i64;
pub type BlockIndex = usize;

/// Unit of placement and lease.
pub const CHUNK_SIZE: Offset = 64 << 20; // 64 MiB

/// Sub-region of a chunk covered by a single checksum.
pub const CHECKSUM_BLOCK_SIZE: Offset = 64 << 10; // 64 KiB

pub const BLOCKS_PER_CHUNK: usize = (CHUNK_SIZE / CHECKSUM_BLOCK_SIZE) as usize;

/// Allocation granularity of the staging buffer; writes smaller than two of
/// these are copied into the tail instead of moved by reference.
pub const DEFAULT_BUFFER_SIZE: Offset = 4 << 10; // 4 KiB

/// Write-lease interval granted by the meta server.
pub const LEASE_INTERVAL_SECS: TimeSec = 300;

/// Slack subtracted from the lease interval so renewal lands well before
/// expiration.
pub const LEASE_RENEW_TIME: TimeSec = LEASE_INTERVAL_SECS / 3;

/// Stand-in lease end when the meta server does not report a duration.
pub const NEVER_EXPIRES: TimeSec = 10 * 365 * 24 * 3600;

pub fn chunk_start_offset(offset: Offset) -> Offset {
    offset - offset % CHUNK_SIZE
}

pub fn offset_in_chunk(offset: Offset) -> Offset {
    offset % CHUNK_SIZE
}

pub fn checksum_block_index(chunk_offset: Offset) -> BlockIndex {
    (chunk_offset / CHECKSUM_BLOCK_SIZE) as BlockIndex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_arithmetic() {
        assert_eq!(chunk_start_offset(0), 0);
        assert_eq!(chunk_start_offset(CHUNK_SIZE - 1), 0);
        assert_eq!(chunk_start_offset(CHUNK_SIZE), CHUNK_SIZE);
        assert_eq!(offset_in_chunk(CHUNK_SIZE + 5), 5);
        assert_eq!(checksum_block_index(0), 0);
        assert_eq!(checksum_block_index(CHECKSUM_BLOCK_SIZE), 1);
        assert_eq!(checksum_block_index(CHUNK_SIZE - 1), BLOCKS_PER_CHUNK - 1);
    }
}
