use std::time::Duration;

use serde::{Deserialize, Serialize};
use sorafs_common::{Offset, SeqNum, TimeSec, CHECKSUM_BLOCK_SIZE, CHUNK_SIZE};

/// Construction-time knobs for a [`crate::FileWriter`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Retry budget per chunk writer and per truncate op.
    pub max_retry_count: i32,
    /// Minimum pending bytes before a write is emitted.
    pub write_threshold: Offset,
    /// Staging-buffer compaction trigger for partial buffers; -1 disables
    /// compaction, 0 forces the copy path for every write.
    pub max_partial_buffers: i32,
    pub time_sec_between_retries: TimeSec,
    pub op_timeout_secs: TimeSec,
    pub idle_timeout_secs: TimeSec,
    /// Largest single write op; rounded down to a checksum-block multiple
    /// and capped at the chunk size.
    pub max_write_size: Offset,
    /// Base for chunk-server connection sequence numbers; advanced by 10 000
    /// per chunk writer.
    pub chunk_server_initial_seq_num: SeqNum,
    /// Prepended to every log line emitted by this writer.
    pub log_prefix: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 6,
            write_threshold: 1 << 20,
            max_partial_buffers: 16,
            time_sec_between_retries: 10,
            op_timeout_secs: 120,
            idle_timeout_secs: 300,
            max_write_size: 1 << 20,
            chunk_server_initial_seq_num: 100_003,
            log_prefix: String::new(),
        }
    }
}

impl WriterConfig {
    /// Applies the documented clamping rules. Called once at writer
    /// construction; the returned config is what the writer actually runs
    /// with.
    pub fn normalized(mut self) -> Self {
        self.max_retry_count = self.max_retry_count.max(0);
        self.write_threshold = self.write_threshold.max(0);
        let rounded = self.max_write_size - self.max_write_size % CHECKSUM_BLOCK_SIZE;
        self.max_write_size = rounded.clamp(CHECKSUM_BLOCK_SIZE, CHUNK_SIZE);
        self
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs.max(0) as u64)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_write_size_rounds_down_to_block_multiple() {
        let cfg = WriterConfig {
            max_write_size: CHECKSUM_BLOCK_SIZE * 3 + 17,
            ..Default::default()
        }
        .normalized();
        assert_eq!(cfg.max_write_size, CHECKSUM_BLOCK_SIZE * 3);
    }

    #[test]
    fn max_write_size_is_clamped() {
        let tiny = WriterConfig {
            max_write_size: 5,
            ..Default::default()
        }
        .normalized();
        assert_eq!(tiny.max_write_size, CHECKSUM_BLOCK_SIZE);

        let huge = WriterConfig {
            max_write_size: CHUNK_SIZE * 2,
            ..Default::default()
        }
        .normalized();
        assert_eq!(huge.max_write_size, CHUNK_SIZE);
    }

    #[test]
    fn serde_roundtrip_with_defaults() {
        let cfg: WriterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_retry_count, WriterConfig::default().max_retry_count);
        let s = serde_json::to_string(&cfg).unwrap();
        let back: WriterConfig = serde_json::from_str(&s).unwrap();
        assert_eq!(back.max_write_size, cfg.max_write_size);
    }
}
