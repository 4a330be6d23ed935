//! Per-chunk write state machine: allocation, write-id acquisition, data
//! writes in checksum-block alignment, lease renewal, close. One instance
//! owns the conversation with a single chunk's replica group.
//!
//! Steps never call back into the file writer; anything the coordinator must
//! react to (acknowledged ranges, a fatal status) is collected in a
//! [`StepOut`] and applied by the caller after the step returns.

use std::{
    cmp::{max, min},
    collections::VecDeque,
    time::Duration,
};

use sorafs_common::{
    checksum::NULL_CHECKSUM, Offset, SeqNum, TimeSec, BLOCKS_PER_CHUNK, CHECKSUM_BLOCK_SIZE,
    CHUNK_SIZE, LEASE_INTERVAL_SECS, LEASE_RENEW_TIME, NEVER_EXPIRES,
};
use sorafs_proto::{
    status, AccessReply, AllocateOp, AllocateReply, ChunkAccess, ChunkReply, ChunkRequest,
    CloseChunkOp, MetaRequest, OpId, OpStatus, RpcFormat, WriteIdAllocOp, WriteInfo, WritePrepareOp,
    WriteReply, WriteSyncOp,
};
use tracing::{debug, error, info, warn};

use crate::{buffer::IoBuffer, file_writer::Shared, monitor::ClientOpKind};

/// Effects a chunk-writer step hands back to the file writer.
#[derive(Debug, Default)]
pub(crate) struct StepOut {
    pub(crate) acks: Vec<Ack>,
    pub(crate) fatal: Option<i32>,
}

/// One completion report: `size == 0` marks writer-level progress (e.g.
/// termination) rather than acknowledged bytes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Ack {
    pub(crate) offset: Offset,
    pub(crate) size: Offset,
    pub(crate) error: i32,
}

/// Identity of the most recently enqueued non-data op, plus the last write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LastOp {
    Allocate(OpId),
    WriteIdAlloc(OpId),
    Close(OpId),
    LeaseUpdate(OpId),
    Write(OpId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FailedOp {
    Allocate,
    WriteIdAlloc,
    Write,
    LeaseUpdate,
    Close,
}

/// One bit per checksum block of the chunk; a set bit means some write op
/// covering that block is in flight.
struct BlockBitmap {
    words: [u64; BLOCKS_PER_CHUNK / 64],
}

impl BlockBitmap {
    fn new() -> Self {
        Self {
            words: [0; BLOCKS_PER_CHUNK / 64],
        }
    }

    fn test(&self, block: usize) -> bool {
        self.words[block / 64] & (1u64 << (block % 64)) != 0
    }

    fn set(&mut self, block: usize) {
        self.words[block / 64] |= 1u64 << (block % 64);
    }

    fn clear(&mut self, block: usize) {
        self.words[block / 64] &= !(1u64 << (block % 64));
    }
}

/// A queued or in-flight write: the prepare op, its optional paired sync op,
/// the payload, and the checksum-block range it claims.
pub(crate) struct WriteOp {
    op_id: Option<OpId>,
    prepare: WritePrepareOp,
    sync: WriteSyncOp,
    buffer: IoBuffer,
    begin_block: usize,
    end_block: usize,
    op_start_time: TimeSec,
    checksum_valid: bool,
}

impl WriteOp {
    fn new(chunk_offset: Offset) -> Self {
        let mut prepare = WritePrepareOp::default();
        prepare.offset = chunk_offset;
        Self {
            op_id: None,
            prepare,
            sync: WriteSyncOp::default(),
            buffer: IoBuffer::new(),
            begin_block: 0,
            end_block: 0,
            op_start_time: 0,
            checksum_valid: false,
        }
    }

    fn init_block_range(&mut self) {
        debug_assert!(
            self.prepare.offset >= 0
                && self.prepare.offset + self.buffer.bytes_consumable() <= CHUNK_SIZE
        );
        self.begin_block = (self.prepare.offset / CHECKSUM_BLOCK_SIZE) as usize;
        self.end_block = self.begin_block
            + ((self.buffer.bytes_consumable() + CHECKSUM_BLOCK_SIZE - 1) / CHECKSUM_BLOCK_SIZE)
                as usize;
    }
}

pub(crate) struct ChunkWriter {
    chunk_server: Box<dyn sorafs_proto::ChunkServerClient>,
    log_prefix: String,

    error_code: i32,
    retry_count: i32,
    pending_count: Offset,
    open_chunk_block_file_offset: Offset,
    max_chunk_pos: Offset,
    op_start_time: TimeSec,

    write_ids: Vec<WriteInfo>,
    alloc_op: AllocateOp,
    write_id_alloc_op: WriteIdAllocOp,
    close_op: CloseChunkOp,
    update_lease_op: WritePrepareOp,
    last_op: Option<LastOp>,

    sleeping: bool,
    wake_time: TimeSec,
    closing: bool,
    keep_lease: bool,
    lease_update_pending: bool,
    has_subject_id: bool,

    chunk_access: String,
    lease_end_time: TimeSec,
    lease_expire_time: TimeSec,
    chunk_access_expire_time: TimeSec,
    cs_access_expire_time: TimeSec,

    in_flight_blocks: BlockBitmap,
    pending_queue: VecDeque<WriteOp>,
    in_flight_queue: VecDeque<WriteOp>,
}

impl ChunkWriter {
    pub(crate) fn new(sh: &mut Shared, id: u64, initial_seq_num: SeqNum) -> Self {
        let chunk_server =
            sh.chunk_servers
                .connect(initial_seq_num, sh.cfg.op_timeout(), sh.cfg.idle_timeout());
        Self {
            chunk_server,
            log_prefix: format!("{}CW{} ", sh.log_prefix, id),
            error_code: 0,
            retry_count: 0,
            pending_count: 0,
            open_chunk_block_file_offset: -1,
            max_chunk_pos: 0,
            op_start_time: 0,
            write_ids: Vec::new(),
            alloc_op: AllocateOp::default(),
            write_id_alloc_op: WriteIdAllocOp::default(),
            close_op: CloseChunkOp::default(),
            update_lease_op: WritePrepareOp::default(),
            last_op: None,
            sleeping: false,
            wake_time: 0,
            closing: false,
            keep_lease: false,
            lease_update_pending: false,
            has_subject_id: false,
            chunk_access: String::new(),
            lease_end_time: 0,
            lease_expire_time: 0,
            chunk_access_expire_time: 0,
            cs_access_expire_time: 0,
            in_flight_blocks: BlockBitmap::new(),
            pending_queue: VecDeque::new(),
            in_flight_queue: VecDeque::new(),
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending_queue.is_empty() && self.in_flight_queue.is_empty() && !self.closing
    }

    pub(crate) fn is_open(&self) -> bool {
        self.error_code == 0 && self.alloc_op.file_offset >= 0 && !self.closing
    }

    pub(crate) fn file_offset(&self) -> Offset {
        if self.error_code == 0 {
            self.alloc_op.file_offset
        } else {
            -1
        }
    }

    pub(crate) fn open_chunk_block_file_offset(&self) -> Offset {
        if self.alloc_op.file_offset >= 0 {
            self.open_chunk_block_file_offset
        } else {
            -1
        }
    }

    pub(crate) fn next_wakeup(&self) -> Option<TimeSec> {
        self.sleeping.then_some(self.wake_time)
    }

    pub(crate) fn owns_chunk_op(&self, op_id: OpId) -> bool {
        match self.last_op {
            Some(LastOp::WriteIdAlloc(id))
            | Some(LastOp::Close(id))
            | Some(LastOp::LeaseUpdate(id))
            | Some(LastOp::Write(id))
                if id == op_id =>
            {
                return true;
            }
            _ => {}
        }
        self.in_flight_queue.iter().any(|op| op.op_id == Some(op_id))
    }

    pub(crate) fn owns_meta_op(&self, op_id: OpId) -> bool {
        matches!(self.last_op, Some(LastOp::Allocate(id)) if id == op_id)
    }

    pub(crate) fn cancel_close(&mut self) {
        self.closing = false;
    }

    pub(crate) fn close(&mut self, sh: &mut Shared, now: TimeSec, out: &mut StepOut) {
        if !self.closing && self.is_open() {
            self.closing = true;
            self.start_write(sh, now, out);
        }
    }

    /// Queues the bytes of a single-chunk range as write ops, coalescing with
    /// the pending tail where alignment allows. Never invokes completion;
    /// `start_write` must be called afterwards.
    pub(crate) fn queue_write(
        &mut self,
        sh: &mut Shared,
        buf: &mut IoBuffer,
        size: Offset,
        offset: Offset,
        write_threshold: Offset,
    ) -> Offset {
        let mut size = min(buf.bytes_consumable(), size);
        if size <= 0 {
            return 0;
        }
        debug_assert!(offset >= 0 && !self.closing);
        let chunk_offset = offset % CHUNK_SIZE;
        if self.alloc_op.file_offset < 0 {
            self.alloc_op.file_offset = offset - chunk_offset;
            self.open_chunk_block_file_offset = self.alloc_op.file_offset
                - self.alloc_op.file_offset % sh.open_chunk_block_size;
        } else {
            debug_assert_eq!(self.alloc_op.file_offset, offset - chunk_offset);
        }
        size = min(size, CHUNK_SIZE - chunk_offset);
        sh.stats.write_count += 1;
        sh.stats.write_byte_count += size;
        debug_assert!(size > 0);
        let mut pos = chunk_offset;

        // Try to extend the last pending op first.
        if let Some(tail) = self.pending_queue.back_mut() {
            let op_size = tail.buffer.bytes_consumable();
            let op_pos = tail.prepare.offset;
            if op_pos + op_size == pos {
                let head = op_pos % CHECKSUM_BLOCK_SIZE;
                let mut nwr = min(
                    size,
                    (if head == 0 {
                        sh.cfg.max_write_size
                    } else {
                        CHECKSUM_BLOCK_SIZE - head
                    }) - op_size,
                );
                if nwr > 0 && op_size + nwr > CHECKSUM_BLOCK_SIZE {
                    nwr -= (op_size + nwr) % CHECKSUM_BLOCK_SIZE;
                }
                if nwr > 0 {
                    let moved = tail.buffer.move_from(buf, nwr);
                    debug_assert_eq!(moved, nwr);
                    // Force checksum recomputation on dispatch.
                    tail.checksum_valid = false;
                    tail.prepare.checksums.clear();
                    let cur_begin = tail.begin_block;
                    tail.init_block_range();
                    tail.begin_block = cur_begin;
                    size -= moved;
                    pos += moved;
                }
            }
        }

        let write_threshold = if pos + size >= CHUNK_SIZE {
            1
        } else {
            max(write_threshold, 1)
        };
        // A leading sub-block fragment becomes its own op once there is
        // enough data to matter or to complete the block.
        let block_off = pos % CHECKSUM_BLOCK_SIZE;
        if block_off > 0 && (size >= write_threshold || block_off + size >= CHECKSUM_BLOCK_SIZE) {
            let mut op = WriteOp::new(pos);
            let n = op
                .buffer
                .move_from(buf, min(size, CHECKSUM_BLOCK_SIZE - block_off));
            size -= n;
            pos += n;
            op.init_block_range();
            self.pending_queue.push_back(op);
        }
        while size >= write_threshold {
            let mut op_size = min(sh.cfg.max_write_size, size);
            if op_size > CHECKSUM_BLOCK_SIZE {
                op_size -= op_size % CHECKSUM_BLOCK_SIZE;
            }
            let mut op = WriteOp::new(pos);
            let n = op.buffer.move_from(buf, op_size);
            size -= n;
            pos += n;
            op.init_block_range();
            self.pending_queue.push_back(op);
        }
        debug_assert!(pos <= CHUNK_SIZE && size >= 0);
        let queued = pos - chunk_offset;
        self.pending_count += queued;
        self.max_chunk_pos = max(pos, self.max_chunk_pos);
        queued
    }

    /// Drives the state machine one step. Called after every mutation and
    /// every completion.
    pub(crate) fn start_write(&mut self, sh: &mut Shared, now: TimeSec, out: &mut StepOut) {
        if self.sleeping && !self.cancel_lease_update() {
            return;
        }
        self.lease_update_pending = false;

        if self.error_code != 0 && !self.alloc_op.invalidate_all {
            if self.last_op.is_some() {
                self.reset(sh);
            }
            self.closing = false;
            return;
        }

        if self.closing && !self.can_write() {
            if !self.in_flight_queue.is_empty() {
                return;
            }
            if matches!(self.last_op, Some(LastOp::Close(_))) {
                return;
            }
            // Close the chunk even if the chunk server disconnected, to
            // release the write lease.
            if self.alloc_op.chunk_id > 0 {
                let wid_alloc_in_flight = matches!(self.last_op, Some(LastOp::WriteIdAlloc(_)));
                if !(wid_alloc_in_flight && self.alloc_op.chunk_version < 0) {
                    self.close_chunk(sh, now);
                }
                return;
            }
            if self.keep_lease {
                if !matches!(
                    self.last_op,
                    Some(LastOp::Allocate(_) | LastOp::WriteIdAlloc(_))
                ) {
                    // Re-allocate the object block to force lease creation.
                    self.reset(sh);
                    self.allocate_chunk(sh, now);
                }
                return;
            }
            self.chunk_server.stop();
            if let Some(LastOp::Allocate(id)) = self.last_op {
                sh.meta.cancel(id);
                sh.stats.meta_ops_cancelled_count += 1;
                self.last_op = None;
            }
            self.closing = false;
            self.alloc_op.file_offset = -1;
            self.alloc_op.chunk_id = -1;
            self.report_completion(0, 0, out);
            return;
        }

        if !self.can_write() && !self.schedule_lease_update(sh, now) {
            return;
        }

        if self.alloc_op.chunk_id > 0
            && min(
                self.lease_end_time - 1,
                self.lease_expire_time + LEASE_RENEW_TIME / 2,
            ) <= now
        {
            // The chunk server may have cleaned up the write lease on
            // disconnect; start over from allocation.
            debug!(
                prefix = %self.log_prefix,
                pending = self.pending_queue.len(),
                "write lease expired, starting from chunk allocation"
            );
            self.reset(sh);
            if !self.can_write() && !self.schedule_lease_update(sh, now) {
                return;
            }
        }

        if self.alloc_op.chunk_id > 0 && !self.write_ids.is_empty() {
            if self.can_write() {
                self.write_all(sh, now);
            } else {
                self.update_lease(sh, now);
            }
        } else if self.last_op.is_none() {
            self.reset(sh);
            self.allocate_chunk(sh, now);
        }
    }

    /// Hard teardown: drop every queued and in-flight op and clear the error
    /// latch.
    pub(crate) fn shutdown(&mut self, sh: &mut Shared) {
        self.reset(sh);
        let mut pending = std::mem::take(&mut self.pending_queue);
        for op in pending.drain(..) {
            for b in op.begin_block..op.end_block {
                self.in_flight_blocks.clear(b);
            }
        }
        self.closing = false;
        self.error_code = 0;
        self.pending_count = 0;
    }

    pub(crate) fn on_timeout(&mut self, sh: &mut Shared, now: TimeSec, out: &mut StepOut) {
        debug!(prefix = %self.log_prefix, "timeout");
        if self.sleeping {
            self.sleeping = false;
        }
        self.start_write(sh, now, out);
    }

    pub(crate) fn on_alloc_done(
        &mut self,
        sh: &mut Shared,
        op_id: OpId,
        canceled: bool,
        reply: AllocateReply,
        now: TimeSec,
        out: &mut StepOut,
    ) {
        if !matches!(self.last_op, Some(LastOp::Allocate(id)) if id == op_id) {
            warn!(prefix = %self.log_prefix, ?op_id, "stale allocation completion");
            return;
        }
        self.last_op = None;
        debug!(
            prefix = %self.log_prefix,
            canceled,
            status = reply.status.status,
            chunk = reply.chunk_id,
            "<- allocate"
        );
        if canceled {
            sh.stats.meta_ops_cancelled_count += 1;
            return;
        }
        if !reply.status.is_ok() || (reply.chunk_servers.is_empty() && !self.alloc_op.invalidate_all)
        {
            self.alloc_op.chunk_id = 0;
            self.handle_error(sh, FailedOp::Allocate, reply.status, now, out);
            return;
        }
        self.alloc_op.chunk_id = reply.chunk_id;
        self.alloc_op.chunk_version = reply.chunk_version;
        self.alloc_op.chunk_servers = reply.chunk_servers;
        self.alloc_op.master_server = reply.master_server;
        self.alloc_op.chunk_lease_duration = reply.chunk_lease_duration;
        self.alloc_op.chunk_access = reply.chunk_access;
        self.alloc_op.chunk_server_access_token = reply.chunk_server_access_token;
        self.alloc_op.chunk_server_access_key = reply.chunk_server_access_key;
        self.alloc_op.chunk_server_access_issued_time = reply.chunk_server_access_issued_time;
        self.alloc_op.chunk_server_access_valid_for_time = reply.chunk_server_access_valid_for_time;
        self.alloc_op.allow_cs_clear_text = reply.allow_cs_clear_text;
        self.alloc_op.all_cs_short_rpc = reply.all_cs_short_rpc;

        if self.alloc_op.invalidate_all {
            // Report all queued writes completed; the striper reconstructs
            // this range from recovery stripes on read.
            info!(
                prefix = %self.log_prefix,
                chunk = self.alloc_op.chunk_id,
                offset = self.alloc_op.file_offset,
                pending = self.pending_count,
                "invalidate done"
            );
            let size = self.pending_count;
            let offset = if size > 0 { self.alloc_op.file_offset } else { 0 };
            self.alloc_op.invalidate_all = false;
            self.shutdown(sh);
            self.report_completion(offset, size, out);
            return;
        }

        self.lease_end_time = now
            + if self.alloc_op.chunk_lease_duration < 0 {
                NEVER_EXPIRES
            } else {
                max(1, self.alloc_op.chunk_lease_duration - LEASE_RENEW_TIME)
            };
        self.update_lease_expiration(now);
        self.keep_lease = self.alloc_op.chunk_version < 0;
        self.allocate_write_id(sh, now, out);
    }

    pub(crate) fn on_chunk_done(
        &mut self,
        sh: &mut Shared,
        op_id: OpId,
        canceled: bool,
        reply: ChunkReply,
        now: TimeSec,
        out: &mut StepOut,
    ) {
        debug!(
            prefix = %self.log_prefix,
            ?op_id,
            canceled,
            "<- chunk op"
        );
        match reply {
            ChunkReply::WriteIdAlloc(r)
                if matches!(self.last_op, Some(LastOp::WriteIdAlloc(id)) if id == op_id) =>
            {
                self.last_op = None;
                self.on_write_id_alloc_done(sh, canceled, r, now, out);
            }
            ChunkReply::Close(r)
                if matches!(self.last_op, Some(LastOp::Close(id)) if id == op_id) =>
            {
                self.last_op = None;
                self.on_close_done(sh, canceled, r, now, out);
            }
            ChunkReply::LeaseUpdate(r)
                if matches!(self.last_op, Some(LastOp::LeaseUpdate(id)) if id == op_id) =>
            {
                self.last_op = None;
                self.on_lease_update_done(sh, canceled, r, now, out);
            }
            ChunkReply::Write(r) => {
                if matches!(self.last_op, Some(LastOp::Write(id)) if id == op_id) {
                    self.last_op = None;
                }
                self.on_write_done(sh, op_id, canceled, r, now, out);
            }
            other => {
                // Completion dispatch is keyed strictly on op ids; anything
                // else is a transport defect, not a state we can recover.
                error!(
                    prefix = %self.log_prefix,
                    ?op_id,
                    reply = ?other,
                    "unexpected operation completion"
                );
            }
        }
    }

    fn can_write(&self) -> bool {
        !self.pending_queue.is_empty() || self.alloc_op.invalidate_all
    }

    fn allocate_chunk(&mut self, sh: &mut Shared, now: TimeSec) {
        debug_assert!(sh.file_id > 0 && self.alloc_op.file_offset >= 0);
        debug_assert!(
            !self.pending_queue.is_empty()
                || (self.close_op.chunk_id > 0 && self.close_op.chunk_version < 0)
                || self.keep_lease
                || self.alloc_op.invalidate_all
        );
        if sh.replica_count == 0 {
            // Pin the previous head server when re-allocating an object
            // store block.
            if let Some(front) = self.alloc_op.chunk_servers.first() {
                self.alloc_op.master_server = front.clone();
            }
        } else {
            self.alloc_op.master_server.reset();
        }
        self.alloc_op.fid = sh.file_id;
        self.alloc_op.pathname = sh.path_name.clone();
        self.alloc_op.append = false;
        self.alloc_op.chunk_id = -1;
        self.alloc_op.chunk_version = -1;
        self.alloc_op.chunk_lease_duration = -1;
        self.alloc_op.chunk_server_access_issued_time = 0;
        self.alloc_op.chunk_server_access_valid_for_time = 0;
        self.alloc_op.allow_cs_clear_text = false;
        self.alloc_op.all_cs_short_rpc = false;
        self.alloc_op.chunk_servers.clear();
        self.alloc_op.chunk_access.clear();
        self.alloc_op.chunk_server_access_token.clear();
        self.alloc_op.chunk_server_access_key.clear();
        sh.stats.chunk_alloc_count += 1;
        // Allocation may require a chunk version change; give it extra
        // headroom beyond the meta op timeout.
        let meta_timeout = sh.meta.op_timeout().as_secs() as i64;
        let extra = max(0, max(sh.cfg.op_timeout_secs, 5 * meta_timeout) - meta_timeout);
        debug!(
            prefix = %self.log_prefix,
            offset = self.alloc_op.file_offset,
            invalidate = self.alloc_op.invalidate_all,
            "+> allocate"
        );
        let op_id = sh.meta.enqueue(
            MetaRequest::Allocate(self.alloc_op.clone()),
            Duration::from_secs(extra as u64),
        );
        self.last_op = Some(LastOp::Allocate(op_id));
        self.op_start_time = now;
        sh.stats.meta_ops_queued_count += 1;
    }

    fn allocate_write_id(&mut self, sh: &mut Shared, now: TimeSec, out: &mut StepOut) {
        debug_assert!(self.alloc_op.chunk_id > 0 && !self.alloc_op.chunk_servers.is_empty());
        let mut op = WriteIdAllocOp {
            chunk_id: self.alloc_op.chunk_id,
            chunk_version: self.alloc_op.chunk_version,
            for_record_append: false,
            chunk_server_loc: self.alloc_op.chunk_servers.clone(),
            offset: 0,
            num_bytes: 0,
            access: ChunkAccess::default(),
            write_prep_reply_supported: false,
        };
        self.has_subject_id = false;
        self.chunk_access.clear();

        let clear_text_allowed = sh.meta.is_clear_text_allowed();
        self.chunk_server
            .set_shutdown_ssl(self.alloc_op.allow_cs_clear_text && clear_text_allowed);
        self.chunk_server.set_rpc_format(if self.alloc_op.all_cs_short_rpc {
            RpcFormat::Short
        } else {
            RpcFormat::Long
        });

        let mut st = OpStatus::ok();
        if self.alloc_op.chunk_server_access_token.is_empty()
            || self.alloc_op.chunk_access.is_empty()
        {
            self.chunk_server.clear_session_key();
            if !self.alloc_op.chunk_server_access_token.is_empty() {
                st = OpStatus::error(status::PARAMETERS, "no chunk access");
            } else if !self.alloc_op.chunk_access.is_empty() {
                st = OpStatus::error(status::PARAMETERS, "no chunk server access");
            } else if !clear_text_allowed {
                st = OpStatus::error(status::PERMISSION, "no clear text chunk server access");
            } else {
                self.chunk_access_expire_time = now + 60 * 60 * 24 * 365;
                self.cs_access_expire_time = self.chunk_access_expire_time;
            }
        } else {
            self.chunk_server.set_session_key(
                &self.alloc_op.chunk_server_access_token,
                &self.alloc_op.chunk_server_access_key,
            );
            self.chunk_access = self.alloc_op.chunk_access.clone();
            op.access.access = self.chunk_access.clone();
            // The chunk access returned by allocation is short-lived; always
            // ask for a fresh token carrying the write id subject.
            op.access.create_chunk_access = true;
            self.chunk_access_expire_time = now - 60 * 60 * 24;
            self.cs_access_expire_time = access_expire_time(
                now,
                self.alloc_op.chunk_server_access_issued_time,
                self.alloc_op.chunk_server_access_valid_for_time,
            );
            op.access.create_chunk_server_access = self.cs_access_expire_time <= now;
            op.access.decrypt_with_session_key = self.alloc_op.allow_cs_clear_text
                && clear_text_allowed
                && op.access.create_chunk_server_access;
        }

        if st.is_ok() {
            match self
                .chunk_server
                .set_server(&self.alloc_op.chunk_servers[0], true)
            {
                Ok(()) => {
                    self.write_id_alloc_op = op;
                    debug!(
                        prefix = %self.log_prefix,
                        chunk = self.write_id_alloc_op.chunk_id,
                        "+> write id alloc"
                    );
                    let op_id = self
                        .chunk_server
                        .enqueue(ChunkRequest::WriteIdAlloc(self.write_id_alloc_op.clone()));
                    self.last_op = Some(LastOp::WriteIdAlloc(op_id));
                    self.op_start_time = now;
                    sh.stats.chunk_ops_queued_count += 1;
                    return;
                }
                Err(msg) => {
                    st = OpStatus::error(status::FAULT, msg);
                }
            }
        }
        self.write_id_alloc_op = op;
        self.handle_error(sh, FailedOp::WriteIdAlloc, st, now, out);
    }

    fn on_write_id_alloc_done(
        &mut self,
        sh: &mut Shared,
        canceled: bool,
        reply: sorafs_proto::WriteIdAllocReply,
        now: TimeSec,
        out: &mut StepOut,
    ) {
        self.write_ids.clear();
        if canceled {
            return;
        }
        let mut st = reply.status.clone();
        if st.status >= 0
            && self.write_id_alloc_op.chunk_version < 0
            && !reply.write_prep_reply_supported
        {
            // Object store blocks are committed through write prepare
            // replies; a server without that support cannot host them.
            st = OpStatus::error(
                status::PARAMETERS,
                "invalid write id alloc reply: write prepare reply is not supported",
            );
        }
        if st.status < 0 {
            self.handle_error(sh, FailedOp::WriteIdAlloc, st, now, out);
            return;
        }
        if reply.write_ids.len() != self.write_id_alloc_op.chunk_server_loc.len() {
            error!(
                prefix = %self.log_prefix,
                got = reply.write_ids.len(),
                want = self.write_id_alloc_op.chunk_server_loc.len(),
                "write id alloc: invalid response"
            );
            self.handle_error(
                sh,
                FailedOp::WriteIdAlloc,
                OpStatus::error(status::FAULT, "short write id list"),
                now,
                out,
            );
            return;
        }
        self.write_ids = reply.write_ids;
        self.write_id_alloc_op.write_prep_reply_supported = reply.write_prep_reply_supported;
        self.update_access(&reply.access, now);
        self.update_lease_expiration(now);
        self.start_write(sh, now, out);
    }

    /// Dispatches every pending op whose checksum blocks are free, in queue
    /// order. Acknowledgements arrive per connection in dispatch order, so
    /// per-chunk completions stay monotone in chunk offset.
    fn write_all(&mut self, sh: &mut Shared, now: TimeSec) {
        let mut idx = 0;
        while !self.sleeping
            && self.error_code == 0
            && self.alloc_op.chunk_id > 0
            && idx < self.pending_queue.len()
        {
            let blocked = {
                let op = &mut self.pending_queue[idx];
                let mut blocked = false;
                while op.begin_block < op.end_block {
                    if self.in_flight_blocks.test(op.begin_block) {
                        blocked = true;
                        break;
                    }
                    self.in_flight_blocks.set(op.begin_block);
                    op.begin_block += 1;
                }
                blocked
            };
            if blocked {
                // An equal-range op owns these blocks; keep order within the
                // block and try the next op.
                idx += 1;
                continue;
            }
            let mut op = self.pending_queue.remove(idx).expect("index in bounds");
            self.dispatch_write(sh, &mut op, now);
            self.in_flight_queue.push_back(op);
        }
    }

    fn dispatch_write(&mut self, sh: &mut Shared, op: &mut WriteOp, now: TimeSec) {
        let reply_requested = self.write_id_alloc_op.write_prep_reply_supported;
        op.prepare.chunk_id = self.alloc_op.chunk_id;
        op.prepare.chunk_version = self.alloc_op.chunk_version;
        op.prepare.write_info = self.write_ids.clone();
        op.prepare.num_bytes = op.buffer.bytes_consumable();
        op.prepare.reply_requested = reply_requested;
        op.prepare.access = self.make_access(reply_requested, now);
        if reply_requested {
            if !op.checksum_valid {
                op.prepare.checksum = op.buffer.composite_checksum(op.prepare.num_bytes);
                op.checksum_valid = true;
            }
            op.prepare.checksums.clear();
        } else {
            if op.prepare.checksums.is_empty() {
                let (composite, checksums) = op.buffer.block_checksums(op.prepare.num_bytes);
                op.prepare.checksum = composite;
                op.prepare.checksums = checksums;
                op.checksum_valid = true;
            }
            op.sync.chunk_id = op.prepare.chunk_id;
            op.sync.chunk_version = op.prepare.chunk_version;
            op.sync.offset = op.prepare.offset;
            op.sync.num_bytes = op.prepare.num_bytes;
            op.sync.write_info = op.prepare.write_info.clone();
            op.sync.checksums = op.prepare.checksums.clone();
            op.sync.access = self.make_access(true, now);
        }
        op.op_start_time = now;
        sh.stats.ops_write_count += 1;
        sh.stats.ops_write_byte_count += op.prepare.num_bytes;
        debug!(
            prefix = %self.log_prefix,
            chunk = op.prepare.chunk_id,
            offset = op.prepare.offset,
            num_bytes = op.prepare.num_bytes,
            reply_requested,
            "+> write"
        );
        let request = ChunkRequest::Write {
            prepare: op.prepare.clone(),
            sync: (!reply_requested).then(|| op.sync.clone()),
            data: op.buffer.share(),
        };
        let op_id = self.chunk_server.enqueue(request);
        op.op_id = Some(op_id);
        self.last_op = Some(LastOp::Write(op_id));
        self.op_start_time = now;
        sh.stats.chunk_ops_queued_count += 1;
    }

    fn on_write_done(
        &mut self,
        sh: &mut Shared,
        op_id: OpId,
        canceled: bool,
        reply: WriteReply,
        now: TimeSec,
        out: &mut StepOut,
    ) {
        let Some(pos) = self
            .in_flight_queue
            .iter()
            .position(|op| op.op_id == Some(op_id))
        else {
            warn!(prefix = %self.log_prefix, ?op_id, "stale write completion");
            return;
        };
        let mut op = self.in_flight_queue.remove(pos).expect("index in bounds");
        op.init_block_range();
        for b in op.begin_block..op.end_block {
            self.in_flight_blocks.clear(b);
        }
        if canceled || reply.status.status < 0 {
            let op_start_time = op.op_start_time;
            op.op_id = None;
            // Back to pending so a retry resends the same range.
            self.pending_queue.push_back(op);
            if !canceled {
                self.op_start_time = op_start_time;
                self.handle_error(sh, FailedOp::Write, reply.status, now, out);
            }
            return;
        }
        let offset = self.alloc_op.file_offset + op.prepare.offset;
        let done_count = op.buffer.bytes_consumable();
        debug_assert!(done_count >= 0 && self.pending_count >= done_count);
        self.pending_count -= done_count;
        self.update_access(&reply.access, now);
        drop(op);
        self.report_completion(offset, done_count, out);
        self.update_lease_expiration(now);
        self.start_write(sh, now, out);
    }

    fn update_lease(&mut self, sh: &mut Shared, now: TimeSec) {
        debug_assert!(
            self.write_id_alloc_op.write_prep_reply_supported
                && self.alloc_op.chunk_id > 0
                && !self.write_ids.is_empty()
        );
        let reply_requested = self.write_id_alloc_op.write_prep_reply_supported;
        let access = self.make_access(reply_requested, now);
        self.update_lease_op = WritePrepareOp {
            chunk_id: self.alloc_op.chunk_id,
            chunk_version: self.alloc_op.chunk_version,
            offset: 0,
            num_bytes: 0,
            write_info: self.write_ids.clone(),
            checksum: NULL_CHECKSUM,
            checksums: Vec::new(),
            reply_requested,
            access,
        };
        debug!(prefix = %self.log_prefix, chunk = self.update_lease_op.chunk_id, "+> lease update");
        let op_id = self
            .chunk_server
            .enqueue(ChunkRequest::LeaseUpdate(self.update_lease_op.clone()));
        self.last_op = Some(LastOp::LeaseUpdate(op_id));
        self.op_start_time = now;
        sh.stats.chunk_ops_queued_count += 1;
    }

    fn on_lease_update_done(
        &mut self,
        sh: &mut Shared,
        canceled: bool,
        reply: WriteReply,
        now: TimeSec,
        out: &mut StepOut,
    ) {
        self.update_lease_op.chunk_id = -1;
        if canceled {
            return;
        }
        if !reply.status.is_ok() {
            self.handle_error(sh, FailedOp::LeaseUpdate, reply.status, now, out);
            return;
        }
        if self.update_lease_op.reply_requested {
            self.update_access(&reply.access, now);
        }
        self.update_lease_expiration(now);
        self.start_write(sh, now, out);
    }

    fn close_chunk(&mut self, sh: &mut Shared, now: TimeSec) {
        debug_assert!(self.alloc_op.chunk_id > 0);
        let access = self.make_access(true, now);
        let mut op = CloseChunkOp {
            chunk_id: self.alloc_op.chunk_id,
            chunk_version: self.alloc_op.chunk_version,
            write_info: self.write_ids.clone(),
            chunk_server_loc: Vec::new(),
            access,
        };
        if op.write_info.is_empty() {
            op.chunk_server_loc = self.alloc_op.chunk_servers.clone();
        }
        if op.chunk_version < 0 {
            // Extend the timeout to accommodate the object commit, possibly a
            // single atomic chunk-sized write.
            let max_write_size = max(1 << 9, sh.cfg.max_write_size);
            let timeout = min(
                LEASE_INTERVAL_SECS / 2,
                (sh.cfg.op_timeout_secs + 3) / 4
                    * (1 + max(
                        (sh.cfg.max_retry_count / 3) as i64,
                        (self.max_chunk_pos + max_write_size - 1) / max_write_size,
                    )),
            );
            debug!(
                prefix = %self.log_prefix,
                chunk = op.chunk_id,
                version = op.chunk_version,
                timeout_sec = timeout,
                "chunk close timeout"
            );
            self.chunk_server
                .set_op_timeout(Duration::from_secs(timeout.max(0) as u64));
        }
        self.write_ids.clear();
        self.alloc_op.chunk_id = -1;
        self.close_op = op;
        debug!(prefix = %self.log_prefix, chunk = self.close_op.chunk_id, "+> close");
        let op_id = self
            .chunk_server
            .enqueue(ChunkRequest::Close(self.close_op.clone()));
        self.last_op = Some(LastOp::Close(op_id));
        self.op_start_time = now;
        sh.stats.chunk_ops_queued_count += 1;
    }

    fn on_close_done(
        &mut self,
        sh: &mut Shared,
        canceled: bool,
        reply: sorafs_proto::CloseReply,
        now: TimeSec,
        out: &mut StepOut,
    ) {
        if self.close_op.chunk_version < 0 {
            // Restore the timeout changed for the object commit.
            self.chunk_server.set_op_timeout(sh.cfg.op_timeout());
        }
        if canceled {
            return;
        }
        if !reply.status.is_ok() {
            if self.close_op.chunk_version < 0 {
                self.handle_error(sh, FailedOp::Close, reply.status, now, out);
                return;
            }
            debug!(
                prefix = %self.log_prefix,
                status = reply.status.status,
                "chunk close failure ignored"
            );
        }
        self.keep_lease = false;
        self.close_op.chunk_id = -1;
        self.reset(sh);
        self.start_write(sh, now, out);
    }

    /// Every failure path lands here. Decides between fatal, striper
    /// invalidation, and a retry sleep.
    fn handle_error(
        &mut self,
        sh: &mut Shared,
        failed: FailedOp,
        st: OpStatus,
        now: TimeSec,
        out: &mut StepOut,
    ) {
        let meta_location = sh.meta.location();
        let chunk_server_location = self.chunk_server.server_location();
        sh.monitor.report_error(
            ClientOpKind::Write,
            &meta_location,
            chunk_server_location.as_ref(),
            st.status,
        );
        error!(
            prefix = %self.log_prefix,
            ?failed,
            status = st.status,
            msg = %st.status_msg,
            chunk_server = %chunk_server_location
                .map(|l| l.to_string())
                .unwrap_or_default(),
            "operation failure"
        );
        let mut the_status = st.status;
        let last_error = st.last_error;

        if failed == FailedOp::Allocate {
            if the_status == status::NO_ENTRY {
                // File deleted while the lease was out, or the meta server
                // restarted without it.
                error!(prefix = %self.log_prefix, "file does not exist, giving up");
                self.error_code = the_status;
                self.reset(sh);
                out.fatal = Some(the_status);
                return;
            }
            if the_status == status::READ_ONLY
                && self.closing
                && self.close_op.chunk_id > 0
                && self.keep_lease
            {
                error!(prefix = %self.log_prefix, "object store block is now stable");
                self.keep_lease = false;
                self.close_op.chunk_id = -1;
                self.reset(sh);
                self.start_write(sh, now, out);
                return;
            }
            if the_status == status::MAX_RETRY_REACHED
                && self.retry_count < sh.cfg.max_retry_count
            {
                // The meta transport already burnt every connection attempt.
                self.retry_count = sh.cfg.max_retry_count;
            }
        }

        if sh.striper.is_some() && !self.alloc_op.invalidate_all && self.alloc_op.file_offset >= 0
        {
            let striper = sh.striper.as_mut().expect("checked above");
            if !striper.is_write_retry_needed(
                self.alloc_op.file_offset,
                self.retry_count,
                sh.cfg.max_retry_count,
                &mut the_status,
            ) {
                info!(
                    prefix = %self.log_prefix,
                    offset = self.alloc_op.file_offset,
                    status = the_status,
                    pending = self.pending_count,
                    "invalidate"
                );
                self.error_code = the_status;
                self.alloc_op.invalidate_all = true;
                self.retry_count = 0;
                self.reset(sh);
                debug_assert!(self.can_write());
                self.start_write(sh, now, out);
                return;
            }
        }

        self.retry_count += 1;
        if self.retry_count > sh.cfg.max_retry_count {
            error!(
                prefix = %self.log_prefix,
                retry = self.retry_count,
                "max retry reached, giving up"
            );
            if the_status >= 0 {
                the_status = status::IO;
            } else if the_status == status::MAX_RETRY_REACHED && last_error < 0 {
                the_status = last_error;
            }
            self.error_code = the_status;
            self.reset(sh);
            out.fatal = Some(the_status);
            return;
        }
        if failed == FailedOp::Allocate {
            sh.stats.alloc_retries_count += 1;
        }
        sh.stats.retries_count += 1;

        let mut delay = max(
            if self.retry_count >= 1 { 1 } else { 0 },
            sh.cfg.time_sec_between_retries - (now - self.op_start_time),
        );
        if self.keep_lease {
            // The retry must land before the lease runs out.
            let floor = if self.retry_count <= 1 {
                0
            } else {
                max(
                    2,
                    LEASE_INTERVAL_SECS / (2 * max(1, sh.cfg.max_retry_count as i64)),
                )
            };
            delay = min(max(floor, self.lease_expire_time - now), delay);
        }
        info!(
            prefix = %self.log_prefix,
            retry = self.retry_count,
            of = sh.cfg.max_retry_count,
            in_sec = delay,
            "scheduling retry"
        );
        self.error_code = 0;
        self.reset(sh);
        if !self.sleep(sh, now, delay) {
            self.on_timeout(sh, now, out);
        }
    }

    /// Clears the allocation, write ids and connection state. In-flight
    /// writes return to the pending queue, their blocks released; the
    /// transports never call back synchronously, so the drain happens here.
    fn reset(&mut self, sh: &mut Shared) {
        if let Some(LastOp::Allocate(id)) = self.last_op {
            sh.meta.cancel(id);
            sh.stats.meta_ops_cancelled_count += 1;
        }
        self.write_ids.clear();
        self.alloc_op.chunk_id = 0;
        self.last_op = None;
        self.chunk_server.stop();
        while let Some(mut op) = self.in_flight_queue.pop_back() {
            op.init_block_range();
            for b in op.begin_block..op.end_block {
                self.in_flight_blocks.clear(b);
            }
            op.op_id = None;
            self.pending_queue.push_front(op);
        }
        if self.sleeping {
            self.sleeping = false;
        }
        self.lease_update_pending = false;
    }

    fn schedule_lease_update(&mut self, sh: &mut Shared, now: TimeSec) -> bool {
        if !self.keep_lease {
            return false;
        }
        if now < self.lease_expire_time {
            self.lease_update_pending = true;
            let wait = self.lease_expire_time - now;
            self.sleep(sh, now, wait);
            return false;
        }
        true
    }

    fn cancel_lease_update(&mut self) -> bool {
        if !self.lease_update_pending {
            return false;
        }
        if self.sleeping {
            self.sleeping = false;
        }
        self.lease_update_pending = false;
        true
    }

    fn update_lease_expiration(&mut self, now: TimeSec) {
        self.lease_expire_time = min(
            self.lease_end_time,
            now + LEASE_INTERVAL_SECS - LEASE_RENEW_TIME,
        );
    }

    fn make_access(&mut self, can_request_access: bool, now: TimeSec) -> ChunkAccess {
        let mut access = ChunkAccess {
            access: self.chunk_access.clone(),
            create_chunk_access: can_request_access && self.chunk_access_expire_time <= now,
            create_chunk_server_access: can_request_access && self.cs_access_expire_time <= now,
            has_subject_id: self.has_subject_id && !self.write_ids.is_empty(),
            subject_id: -1,
            decrypt_with_session_key: false,
        };
        if access.has_subject_id {
            access.subject_id = self.write_ids[0].write_id;
        }
        access.decrypt_with_session_key =
            access.create_chunk_server_access && self.chunk_server.is_shutdown_ssl();
        // Roll the expirations forward while the renewal request is in
        // flight; on failure the write restarts from write id allocation.
        if access.create_chunk_access {
            self.chunk_access_expire_time = now + LEASE_INTERVAL_SECS * 3 / 2;
        }
        if access.create_chunk_server_access {
            self.cs_access_expire_time = now + LEASE_INTERVAL_SECS * 3 / 2;
        }
        access
    }

    fn update_access(&mut self, reply: &AccessReply, now: TimeSec) {
        if !reply.chunk_access.is_empty() {
            self.has_subject_id = true;
            self.chunk_access = reply.chunk_access.clone();
            self.chunk_access_expire_time =
                access_expire_time(now, reply.issued_time, reply.valid_for_secs);
        }
        if reply.valid_for_secs > 0 && !reply.chunk_server_access_id.is_empty() {
            self.chunk_server.set_session_key(
                &reply.chunk_server_access_id,
                &reply.chunk_server_access_key,
            );
            self.cs_access_expire_time = if reply.chunk_access.is_empty() {
                access_expire_time(now, reply.issued_time, reply.valid_for_secs)
            } else {
                self.chunk_access_expire_time
            };
        }
    }

    fn sleep(&mut self, sh: &mut Shared, now: TimeSec, secs: TimeSec) -> bool {
        if secs <= 0 || self.sleeping {
            return false;
        }
        debug!(prefix = %self.log_prefix, secs, "sleeping");
        self.sleeping = true;
        self.wake_time = now + secs;
        sh.stats.sleep_time_sec += secs;
        true
    }

    fn report_completion(&mut self, offset: Offset, size: Offset, out: &mut StepOut) {
        if self.error_code == 0 {
            // A successful completion resets the retry budget.
            self.retry_count = 0;
        }
        out.acks.push(Ack {
            offset,
            size,
            error: self.error_code,
        });
    }
}

fn access_expire_time(now: TimeSec, issued_time: i64, valid_for: i64) -> TimeSec {
    // Trust the server's issue time only when the clocks roughly agree.
    let diff = (issued_time - now).abs();
    (if diff > 3 * LEASE_INTERVAL_SECS {
        now
    } else {
        issued_time
    }) + valid_for
        - LEASE_INTERVAL_SECS
}
