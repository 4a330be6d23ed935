//! Hook for a second level of partitioning above the chunk writers. The
//! erasure-coding striper lives outside this crate; the write path only
//! needs the narrow surface below. Without a striper the staging buffer is
//! handed straight to the chunk writers.

use sorafs_common::Offset;

use crate::buffer::IoBuffer;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StriperKind {
    #[default]
    None,
    ReedSolomon,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StripeLayout {
    pub kind: StriperKind,
    pub stripe_size: i32,
    pub stripe_count: i32,
    pub recovery_stripe_count: i32,
}

/// Target the striper queues transformed stripes into; implemented by the
/// file writer over its chunk-writer list.
pub trait StriperSink {
    /// Queues bytes belonging to a single chunk. Completion is never
    /// invoked from inside this call.
    fn queue_write(
        &mut self,
        buffer: &mut IoBuffer,
        size: Offset,
        offset: Offset,
        write_threshold: Offset,
    ) -> Offset;

    /// Starts execution of everything queued since the last call.
    fn start_queued_write(&mut self, queued_count: Offset);
}

pub trait Striper: Send {
    /// Consumes staged bytes at the current file cursor, queueing zero or
    /// more chunk-level writes into `sink` followed by one
    /// `start_queued_write`. Advances `offset` past the consumed range.
    /// Returns a status code; non-zero latches the file writer error.
    fn process(
        &mut self,
        buffer: &mut IoBuffer,
        offset: &mut Offset,
        write_threshold: Offset,
        sink: &mut dyn StriperSink,
    ) -> i32;

    /// Whether a failed write at `file_offset` must be retried. Returning
    /// false means the striper can reconstruct the range from recovery
    /// stripes; the chunk position is then invalidated instead. `status`
    /// may be rewritten to the code the completion should carry.
    fn is_write_retry_needed(
        &mut self,
        file_offset: Offset,
        retry_count: i32,
        max_retry_count: i32,
        status: &mut i32,
    ) -> bool;

    /// Logical file size including everything queued so far.
    fn file_size(&self) -> Offset;

    /// Bytes accepted but not yet handed to chunk writers.
    fn pending_size(&self) -> Offset;
}

pub trait StriperFactory: Send {
    /// Instantiates a striper for the layout, or `None` for
    /// [`StriperKind::None`]. On success also returns the open-chunk-block
    /// size the file writer should reap outside of.
    fn create(
        &mut self,
        layout: &StripeLayout,
        file_size: Offset,
        log_prefix: &str,
    ) -> Result<Option<(Box<dyn Striper>, Offset)>, String>;
}
