//! Per-file write coordinator: stages application bytes, partitions them at
//! chunk boundaries across chunk writers (most recently used first), reaps
//! idle writers outside the open chunk block, commits the final size through
//! a truncate op, and reports progress to the host completion.

use std::{
    cmp::{max, min},
    time::Duration,
};

use sorafs_common::{
    chunk_start_offset, FileId, Offset, SeqNum, TimeSec, CHUNK_SIZE, DEFAULT_BUFFER_SIZE,
};
use sorafs_proto::{
    status, ChunkReply, ChunkServerClientFactory, MetaReply, MetaRequest, MetaServerClient, OpId,
    OpStatus, TruncateOp,
};
use sorafs_utils::readable_size::ReadableSize;
use tracing::{debug, error, warn};

use crate::{
    buffer::IoBuffer,
    chunk_writer::{Ack, ChunkWriter, StepOut},
    config::WriterConfig,
    monitor::Monitor,
    striper::{StripeLayout, Striper, StriperFactory, StriperKind, StriperSink},
};

/// Sink for write-path progress. `offset == 0 && size == 0` marks
/// writer-level progress; the terminal close completion arrives that way
/// once the file handle is no longer open.
pub trait Completion: Send {
    fn done(&mut self, status: i32, offset: Offset, size: Offset);

    /// Called when another completion sink replaces this one.
    fn unregistered(&mut self) {}
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub write_count: i64,
    pub write_byte_count: Offset,
    pub buffer_compaction_count: i64,
    pub chunk_alloc_count: i64,
    pub ops_write_count: i64,
    pub ops_write_byte_count: Offset,
    pub alloc_retries_count: i64,
    pub retries_count: i64,
    pub meta_ops_queued_count: i64,
    pub meta_ops_cancelled_count: i64,
    pub chunk_ops_queued_count: i64,
    pub sleep_time_sec: TimeSec,
}

impl Stats {
    pub fn clear(&mut self) {
        *self = Stats::default();
    }
}

/// File-level state chunk writers need while stepping: identity, policy,
/// transports, telemetry. Kept apart from the writer list so a chunk writer
/// can be stepped while the list is borrowed by the coordinator.
pub(crate) struct Shared {
    pub(crate) cfg: WriterConfig,
    pub(crate) file_id: FileId,
    pub(crate) path_name: String,
    pub(crate) replica_count: i32,
    pub(crate) open_chunk_block_size: Offset,
    pub(crate) meta: Box<dyn MetaServerClient>,
    pub(crate) chunk_servers: Box<dyn ChunkServerClientFactory>,
    pub(crate) monitor: Box<dyn Monitor>,
    pub(crate) striper: Option<Box<dyn Striper>>,
    pub(crate) stats: Stats,
    pub(crate) log_prefix: String,
}

#[derive(Clone, Debug)]
pub struct OpenParams {
    pub file_id: FileId,
    pub path: String,
    pub file_size: Offset,
    pub layout: StripeLayout,
    pub replica_count: i32,
}

pub struct FileWriter {
    sh: Shared,
    writers: Vec<ChunkWriter>,
    buffer: IoBuffer,
    completion: Option<Box<dyn Completion>>,
    striper_factory: Option<Box<dyn StriperFactory>>,

    closing: bool,
    sleeping: bool,
    wake_time: TimeSec,
    error_code: i32,
    write_threshold: Offset,
    partial_buffers_count: i32,
    pending_count: Offset,
    max_pending_threshold: Offset,
    retry_count: i32,
    offset: Offset,
    chunk_server_initial_seq_num: SeqNum,
    truncate_op: TruncateOp,
    truncate_op_id: Option<OpId>,
    op_start_time: TimeSec,
    completion_depth: i32,
    striper_process_count: i32,
    next_writer_id: u64,
}

impl FileWriter {
    pub fn new(
        meta: Box<dyn MetaServerClient>,
        chunk_servers: Box<dyn ChunkServerClientFactory>,
        completion: Option<Box<dyn Completion>>,
        monitor: Box<dyn Monitor>,
        striper_factory: Option<Box<dyn StriperFactory>>,
        config: WriterConfig,
    ) -> Self {
        let cfg = config.normalized();
        let log_prefix = if cfg.log_prefix.is_empty() {
            String::new()
        } else {
            format!("{} ", cfg.log_prefix)
        };
        let write_threshold = cfg.write_threshold;
        let max_pending_threshold = cfg.max_write_size;
        let chunk_server_initial_seq_num = cfg.chunk_server_initial_seq_num;
        Self {
            sh: Shared {
                cfg,
                file_id: -1,
                path_name: String::new(),
                replica_count: -1,
                open_chunk_block_size: CHUNK_SIZE,
                meta,
                chunk_servers,
                monitor,
                striper: None,
                stats: Stats::default(),
                log_prefix,
            },
            writers: Vec::new(),
            buffer: IoBuffer::new(),
            completion,
            striper_factory,
            closing: false,
            sleeping: false,
            wake_time: 0,
            error_code: 0,
            write_threshold,
            partial_buffers_count: 0,
            pending_count: 0,
            max_pending_threshold,
            retry_count: 0,
            offset: 0,
            chunk_server_initial_seq_num,
            truncate_op: TruncateOp::default(),
            truncate_op_id: None,
            op_start_time: 0,
            completion_depth: 0,
            striper_process_count: 0,
            next_writer_id: 0,
        }
    }

    pub fn open(&mut self, params: OpenParams, now: TimeSec) -> i32 {
        let OpenParams {
            file_id,
            path,
            file_size,
            layout,
            replica_count,
        } = params;
        if file_id <= 0 || path.is_empty() {
            return status::PARAMETERS;
        }
        if replica_count == 0 && file_size != 0 {
            // Overwrite and append are not supported with object store files.
            return status::SEEK;
        }
        if self.sh.file_id > 0 {
            if file_id == self.sh.file_id && path == self.sh.path_name {
                return self.error_code;
            }
            return status::PARAMETERS;
        }
        if self.closing || self.sleeping {
            return status::TRY_AGAIN;
        }
        self.sh.striper = None;
        self.sh.open_chunk_block_size = CHUNK_SIZE;
        if layout.kind != StriperKind::None {
            let Some(factory) = self.striper_factory.as_mut() else {
                error!(prefix = %self.sh.log_prefix, "striped layout without a striper factory");
                return status::PARAMETERS;
            };
            match factory.create(&layout, file_size, &self.sh.log_prefix) {
                Ok(Some((striper, open_chunk_block_size))) => {
                    self.sh.striper = Some(striper);
                    if open_chunk_block_size >= CHUNK_SIZE {
                        self.sh.open_chunk_block_size = open_chunk_block_size;
                    }
                }
                Ok(None) => {}
                Err(msg) => {
                    error!(prefix = %self.sh.log_prefix, %msg, "striper creation failed");
                    return status::PARAMETERS;
                }
            }
        }
        self.buffer.clear();
        self.sh.stats.clear();
        self.sh.replica_count = replica_count;
        self.partial_buffers_count = 0;
        self.sh.path_name = path;
        self.error_code = 0;
        self.sh.file_id = file_id;
        self.offset = 0;
        self.retry_count = 0;
        self.truncate_op = TruncateOp {
            file_offset: file_size,
            ..TruncateOp::default()
        };
        self.truncate_op_id = None;
        self.max_pending_threshold = self.sh.cfg.max_write_size
            * if self.sh.striper.is_some() {
                max(1, layout.stripe_count) as Offset
            } else {
                1
            };
        self.start_write(false, now)
    }

    /// Appends `length` bytes of `buf` at logical `offset`. Returns the
    /// number of bytes accepted into staging or a negative status.
    pub fn write(
        &mut self,
        buf: &mut IoBuffer,
        length: Offset,
        offset: Offset,
        flush: bool,
        write_threshold: Option<Offset>,
        now: TimeSec,
    ) -> Offset {
        if offset < 0 {
            return status::PARAMETERS as Offset;
        }
        if self.error_code != 0 {
            return status::normalize(self.error_code) as Offset;
        }
        if self.closing || !self.is_open() {
            return status::PARAMETERS as Offset;
        }
        if length <= 0 {
            // Nothing to stage: acknowledge immediately, and force progress
            // when flushing.
            self.report_completion_fw(offset, 0, now);
            if flush {
                let ec = self.start_write(true, now);
                return status::normalize(ec) as Offset;
            }
            return 0;
        }
        if offset != self.offset + self.buffer.bytes_consumable() {
            if self.sh.replica_count == 0 {
                // Object store files are strictly sequential.
                return status::SEEK as Offset;
            }
            // Flush staged bytes, then jump the cursor. No attempt to rewrite
            // the buffer in place.
            let ec = self.start_write(true, now);
            if ec != 0 {
                return status::normalize(ec) as Offset;
            }
            self.offset = offset;
        }
        if self.sh.cfg.max_partial_buffers == 0 || length < DEFAULT_BUFFER_SIZE * 2 {
            // Small writes coalesce into the staging tail.
            self.buffer.copy_from(buf, length);
        } else {
            if self.buffer.is_empty() {
                self.partial_buffers_count = 0;
            }
            self.buffer.move_from(buf, length);
            self.partial_buffers_count += 1;
            if self.sh.cfg.max_partial_buffers >= 0
                && self.partial_buffers_count >= self.sh.cfg.max_partial_buffers
            {
                self.buffer.make_buffers_full();
                self.partial_buffers_count = 0;
                self.sh.stats.buffer_compaction_count += 1;
            }
        }
        if let Some(threshold) = write_threshold {
            if threshold >= 0 {
                self.write_threshold = threshold;
            }
        }
        let ec = self.start_write(flush, now);
        if ec == 0 {
            length
        } else {
            status::normalize(ec) as Offset
        }
    }

    /// Convenience wrapper copying from a slice.
    pub fn write_slice(
        &mut self,
        data: &[u8],
        offset: Offset,
        flush: bool,
        now: TimeSec,
    ) -> Offset {
        let mut buf = IoBuffer::from_slice(data);
        self.write(&mut buf, data.len() as Offset, offset, flush, None, now)
    }

    pub fn flush(&mut self, now: TimeSec) -> i32 {
        status::normalize(self.start_write(true, now))
    }

    pub fn close(&mut self, now: TimeSec) -> i32 {
        if !self.is_open() {
            return 0;
        }
        if self.error_code != 0 {
            return self.error_code;
        }
        if self.closing {
            return status::TRY_AGAIN;
        }
        self.closing = true;
        self.start_write(false, now)
    }

    /// Hard cancel: drops every chunk writer with its queued and in-flight
    /// data, the truncate op, and the staging buffer.
    pub fn stop(&mut self) {
        while let Some(mut writer) = self.writers.pop() {
            writer.shutdown(&mut self.sh);
        }
        if let Some(op_id) = self.truncate_op_id.take() {
            self.sh.meta.cancel(op_id);
            self.truncate_op.fid = -1;
            self.truncate_op.file_offset = -1;
        }
        self.sleeping = false;
        self.closing = false;
        self.pending_count = 0;
        self.buffer.clear();
    }

    pub fn shutdown(&mut self) {
        self.stop();
        self.sh.file_id = -1;
        self.error_code = 0;
    }

    pub fn is_open(&self) -> bool {
        self.sh.file_id > 0
    }

    pub fn is_closing(&self) -> bool {
        self.is_open() && self.closing
    }

    pub fn is_active(&self) -> bool {
        self.is_open() && (!self.buffer.is_empty() || !self.writers.is_empty() || self.closing)
    }

    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    pub fn has_error(&self) -> bool {
        self.error_code != 0
    }

    pub fn stats(&self) -> &Stats {
        &self.sh.stats
    }

    pub fn get_pending_size(&self) -> Offset {
        self.pending_size_self() + self.pending_count
    }

    /// Lowering the threshold may immediately unblock queued data.
    pub fn set_write_threshold(&mut self, threshold: Offset, now: TimeSec) -> i32 {
        let threshold = max(0, threshold);
        let start_write = self.write_threshold > threshold;
        self.write_threshold = threshold;
        if start_write && self.is_open() && self.error_code == 0 {
            self.start_write(false, now)
        } else {
            self.error_code
        }
    }

    pub fn register(&mut self, completion: Box<dyn Completion>) {
        if let Some(mut old) = self.completion.take() {
            old.unregistered();
        }
        self.completion = Some(completion);
    }

    pub fn disable_completion(&mut self) {
        self.completion = None;
    }

    /// Earliest armed sleep across the file writer and its chunk writers.
    pub fn next_wakeup(&self) -> Option<TimeSec> {
        let mut wake = self.sleeping.then_some(self.wake_time);
        for writer in &self.writers {
            if let Some(t) = writer.next_wakeup() {
                wake = Some(wake.map_or(t, |cur| min(cur, t)));
            }
        }
        wake
    }

    /// Fires every sleep whose deadline has passed.
    pub fn on_timeout(&mut self, now: TimeSec) {
        if self.sleeping && self.wake_time <= now {
            self.sleeping = false;
            self.start_write(false, now);
        }
        loop {
            let Some(idx) = self
                .writers
                .iter()
                .position(|w| w.next_wakeup().is_some_and(|t| t <= now))
            else {
                break;
            };
            let mut out = StepOut::default();
            let Self { sh, writers, .. } = self;
            writers[idx].on_timeout(sh, now, &mut out);
            self.process_effects(out, now);
        }
    }

    /// Completion entry point for meta-server ops (allocate, truncate).
    pub fn meta_op_done(&mut self, op_id: OpId, canceled: bool, reply: MetaReply, now: TimeSec) {
        if Some(op_id) == self.truncate_op_id {
            let MetaReply::Truncate(st) = reply else {
                error!(prefix = %self.sh.log_prefix, ?op_id, "unexpected meta completion payload");
                return;
            };
            self.truncate_op_id = None;
            self.on_truncate_done(canceled, st, now);
            return;
        }
        let Some(idx) = self.writers.iter().position(|w| w.owns_meta_op(op_id)) else {
            warn!(prefix = %self.sh.log_prefix, ?op_id, "completion for unknown meta op");
            return;
        };
        let MetaReply::Allocate(reply) = reply else {
            error!(prefix = %self.sh.log_prefix, ?op_id, "unexpected meta completion payload");
            return;
        };
        let mut out = StepOut::default();
        let Self { sh, writers, .. } = self;
        writers[idx].on_alloc_done(sh, op_id, canceled, reply, now, &mut out);
        self.process_effects(out, now);
    }

    /// Completion entry point for chunk-server ops.
    pub fn chunk_op_done(&mut self, op_id: OpId, canceled: bool, reply: ChunkReply, now: TimeSec) {
        let Some(idx) = self.writers.iter().position(|w| w.owns_chunk_op(op_id)) else {
            warn!(prefix = %self.sh.log_prefix, ?op_id, "completion for unknown chunk op");
            return;
        };
        let mut out = StepOut::default();
        let Self { sh, writers, .. } = self;
        writers[idx].on_chunk_done(sh, op_id, canceled, reply, now, &mut out);
        self.process_effects(out, now);
    }

    fn pending_size_self(&self) -> Offset {
        self.buffer.bytes_consumable()
            + self
                .sh
                .striper
                .as_ref()
                .map_or(0, |s| max(0, s.pending_size()))
    }

    /// The progress loop. Queues staged bytes to chunk writers while the
    /// thresholds are met, then, when closing, drives every writer to its
    /// close and finally commits the file size.
    fn start_write(&mut self, flush: bool, now: TimeSec) -> i32 {
        debug!(
            prefix = %self.sh.log_prefix,
            offset = self.offset,
            staged = %ReadableSize(self.buffer.bytes_consumable() as u64),
            pending = %ReadableSize(self.get_pending_size() as u64),
            threshold = self.write_threshold,
            flush,
            sleeping = self.sleeping,
            "start write"
        );
        if self.sleeping {
            return self.error_code;
        }
        let flush = flush || self.closing;
        let write_threshold = max(1, if flush { 1 } else { self.write_threshold });
        let queue_write_threshold = min(self.max_pending_threshold, write_threshold);
        while self.error_code == 0
            && (self.max_pending_threshold <= self.buffer.bytes_consumable()
                || write_threshold <= self.pending_size_self())
        {
            self.queue_write_step(queue_write_threshold, now);
            if self.buffer.is_empty() {
                break;
            }
        }
        if !self.closing {
            return self.error_code;
        }
        if self.writers.is_empty() {
            self.report_completion_fw(0, 0, now);
            return self.error_code;
        }
        // Drive every open chunk writer to close. Restart the scan after
        // each call: completions can remove writers from the list.
        'scan: loop {
            for idx in 0..self.writers.len() {
                if !self.writers[idx].is_open() {
                    continue;
                }
                let mut out = StepOut::default();
                let Self { sh, writers, .. } = self;
                writers[idx].close(sh, now, &mut out);
                self.process_effects(out, now);
                continue 'scan;
            }
            break;
        }
        if self.writers.is_empty() && self.closing {
            self.set_file_size(now);
        }
        self.error_code
    }

    /// One round of handing staged bytes onward: through the striper when
    /// installed, directly to the owning chunk writer otherwise.
    fn queue_write_step(&mut self, queue_write_threshold: Offset, now: TimeSec) {
        let mut out = StepOut::default();
        if self.sh.striper.is_some() {
            let mut striper = self.sh.striper.take().expect("striper present");
            self.striper_process_count += 1;
            let mut offset = self.offset;
            let err = {
                let mut sink = ProgressSink {
                    sh: &mut self.sh,
                    writers: &mut self.writers,
                    pending_count: &mut self.pending_count,
                    chunk_server_initial_seq_num: &mut self.chunk_server_initial_seq_num,
                    next_writer_id: &mut self.next_writer_id,
                    out: &mut out,
                    now,
                };
                striper.process(&mut self.buffer, &mut offset, queue_write_threshold, &mut sink)
            };
            self.offset = offset;
            self.sh.striper = Some(striper);
            self.striper_process_count -= 1;
            if err != 0 && self.error_code == 0 {
                self.error_code = err;
            }
        } else {
            let size = self.buffer.bytes_consumable();
            let offset = self.offset;
            let queued = {
                let mut sink = ProgressSink {
                    sh: &mut self.sh,
                    writers: &mut self.writers,
                    pending_count: &mut self.pending_count,
                    chunk_server_initial_seq_num: &mut self.chunk_server_initial_seq_num,
                    next_writer_id: &mut self.next_writer_id,
                    out: &mut out,
                    now,
                };
                let queued = sink.queue_write(&mut self.buffer, size, offset, queue_write_threshold);
                if queued > 0 {
                    sink.start_queued_write(queued);
                }
                queued
            };
            if queued > 0 {
                self.offset += queued;
            }
        }
        self.process_effects(out, now);
    }

    /// Applies the effects a chunk-writer step produced: pending accounting,
    /// error propagation, completion callbacks, then (at top depth only) the
    /// idle reaper and the close sequence.
    fn process_effects(&mut self, mut out: StepOut, now: TimeSec) {
        for ack in out.acks.drain(..) {
            debug_assert!(ack.size >= 0 && self.pending_count >= ack.size);
            self.pending_count -= ack.size;
            if self.error_code == 0 {
                self.error_code = ack.error;
            }
            self.completion_depth += 1;
            if let Some(completion) = self.completion.as_mut() {
                completion.done(self.error_code, ack.offset, ack.size);
            }
            if self.completion_depth <= 1 && self.striper_process_count <= 0 {
                self.try_to_close_idle(now);
                if self.closing && self.writers.is_empty() && !self.sleeping {
                    self.set_file_size(now);
                    if self.truncate_op_id.is_none() && !self.sleeping {
                        self.finish_close();
                    }
                }
            }
            self.completion_depth -= 1;
        }
        if let Some(code) = out.fatal.take() {
            self.fatal_error(code, now);
        }
    }

    fn report_completion_fw(&mut self, offset: Offset, size: Offset, now: TimeSec) {
        let mut out = StepOut::default();
        out.acks.push(Ack {
            offset,
            size,
            error: self.error_code,
        });
        self.process_effects(out, now);
    }

    fn finish_close(&mut self) {
        self.closing = false;
        self.sh.file_id = -1;
        self.sh.striper = None;
        self.completion_depth += 1;
        if let Some(completion) = self.completion.as_mut() {
            completion.done(self.error_code, 0, 0);
        }
        self.completion_depth -= 1;
    }

    fn fatal_error(&mut self, code: i32, now: TimeSec) {
        if self.error_code == 0 {
            self.error_code = code;
        }
        if self.error_code == 0 {
            self.error_code = status::IO;
        }
        self.closing = false;
        self.report_completion_fw(0, 0, now);
    }

    fn can_close(&self, idx: usize) -> bool {
        let writer = &self.writers[idx];
        if !writer.is_idle() {
            return false;
        }
        if !writer.is_open() || self.closing {
            return true;
        }
        let Some(front) = self.writers.first() else {
            return true;
        };
        // The front writer of a replicated file stays: re-writes land there.
        // Object store chunks close as soon as they are complete to keep the
        // non-stable chunk count down.
        if self.sh.replica_count > 0 && idx == 0 {
            return false;
        }
        let left_edge = front.open_chunk_block_file_offset();
        if left_edge < 0 {
            return false;
        }
        let right_edge = left_edge + self.sh.open_chunk_block_size;
        let offset = writer.file_offset();
        offset < left_edge || right_edge <= offset
    }

    /// Walks the writer list from least recently used, closing and deleting
    /// whatever is idle and outside the open chunk block. Stops at the first
    /// idle writer that cannot be closed yet.
    fn try_to_close_idle(&mut self, now: TimeSec) {
        let mut idx = self.writers.len();
        while idx > 0 {
            idx -= 1;
            if self.can_close(idx) {
                let was_open = self.writers[idx].is_open();
                if was_open {
                    let mut out = StepOut::default();
                    let Self { sh, writers, .. } = self;
                    writers[idx].close(sh, now, &mut out);
                    self.process_effects(out, now);
                }
                if !was_open || (!self.writers[idx].is_open() && self.can_close(idx)) {
                    let mut writer = self.writers.remove(idx);
                    writer.shutdown(&mut self.sh);
                }
            } else if self.writers[idx].is_idle() && self.writers[idx].is_open() {
                break;
            }
        }
    }

    /// Commits the final size to the meta server at the tail of close.
    /// Object store chunk sizes are committed by chunk close instead.
    fn set_file_size(&mut self, now: TimeSec) {
        if (self.sh.striper.is_none() && self.sh.replica_count <= 0)
            || self.error_code != 0
            || self.truncate_op_id.is_some()
        {
            return;
        }
        let size = self
            .sh
            .striper
            .as_ref()
            .map_or(self.offset + self.buffer.bytes_consumable(), |s| {
                s.file_size()
            });
        if size < 0 || size <= self.truncate_op.file_offset {
            return;
        }
        self.op_start_time = now;
        self.truncate_op.pathname = self.sh.path_name.clone();
        self.truncate_op.fid = self.sh.file_id;
        self.truncate_op.file_offset = size;
        debug!(prefix = %self.sh.log_prefix, size, "meta +> truncate");
        let op_id = self
            .sh
            .meta
            .enqueue(MetaRequest::Truncate(self.truncate_op.clone()), Duration::ZERO);
        self.truncate_op_id = Some(op_id);
        self.sh.stats.meta_ops_queued_count += 1;
    }

    fn on_truncate_done(&mut self, canceled: bool, st: OpStatus, now: TimeSec) {
        debug!(
            prefix = %self.sh.log_prefix,
            canceled,
            status = st.status,
            "meta <- truncate"
        );
        self.truncate_op.fid = -1;
        self.truncate_op.pathname.clear();
        if canceled {
            self.truncate_op.file_offset = -1;
            return;
        }
        if !st.is_ok() {
            error!(
                prefix = %self.sh.log_prefix,
                offset = self.truncate_op.file_offset,
                status = st.status,
                msg = %st.status_msg,
                retry = self.retry_count,
                of = self.sh.cfg.max_retry_count,
                "set size failure"
            );
            self.truncate_op.file_offset = -1;
            self.retry_count += 1;
            if self.retry_count < self.sh.cfg.max_retry_count {
                let delay = max(
                    if self.retry_count > 1 { 1 } else { 0 },
                    self.sh.cfg.time_sec_between_retries - (now - self.op_start_time),
                );
                if !self.fw_sleep(delay, now) {
                    self.start_write(false, now);
                }
            } else {
                let code = if st.status == status::MAX_RETRY_REACHED && st.last_error < 0 {
                    st.last_error
                } else {
                    st.status
                };
                self.fatal_error(code, now);
            }
        } else {
            self.retry_count = 0;
            self.report_completion_fw(0, 0, now);
        }
    }

    fn fw_sleep(&mut self, secs: TimeSec, now: TimeSec) -> bool {
        if secs <= 0 || self.sleeping {
            return false;
        }
        debug!(prefix = %self.sh.log_prefix, secs, "sleeping");
        self.sleeping = true;
        self.wake_time = now + secs;
        self.sh.stats.sleep_time_sec += secs;
        true
    }
}

/// Borrow of everything [`StriperSink`] needs: the writer list for routing,
/// the shared state for stepping, and the effect collector.
struct ProgressSink<'a> {
    sh: &'a mut Shared,
    writers: &'a mut Vec<ChunkWriter>,
    pending_count: &'a mut Offset,
    chunk_server_initial_seq_num: &'a mut SeqNum,
    next_writer_id: &'a mut u64,
    out: &'a mut StepOut,
    now: TimeSec,
}

impl StriperSink for ProgressSink<'_> {
    fn queue_write(
        &mut self,
        buffer: &mut IoBuffer,
        size: Offset,
        offset: Offset,
        write_threshold: Offset,
    ) -> Offset {
        if size <= 0 || buffer.bytes_consumable() <= 0 {
            return 0;
        }
        debug_assert!(offset >= 0);
        let file_offset = chunk_start_offset(offset);
        match self
            .writers
            .iter()
            .position(|w| w.file_offset() == file_offset)
        {
            Some(idx) => {
                // Promote to front of the MRU list, and make sure the reaper
                // does not take it out from under us.
                let writer = self.writers.remove(idx);
                self.writers.insert(0, writer);
                self.writers[0].cancel_close();
            }
            None => {
                *self.chunk_server_initial_seq_num += 10_000;
                *self.next_writer_id += 1;
                let writer =
                    ChunkWriter::new(self.sh, *self.next_writer_id, *self.chunk_server_initial_seq_num);
                self.writers.insert(0, writer);
            }
        }
        self.writers[0].queue_write(self.sh, buffer, size, offset, write_threshold)
    }

    fn start_queued_write(&mut self, queued_count: Offset) {
        if queued_count <= 0 {
            return;
        }
        debug_assert!(!self.writers.is_empty());
        *self.pending_count += queued_count;
        self.writers[0].start_write(self.sh, self.now, self.out);
    }
}
