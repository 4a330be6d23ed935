//! End-to-end scenarios for the write path, driven through the mock
//! transports with manual time.

use sorafs_client::{
    testing::Harness, IoBuffer, Striper, StriperFactory, StriperSink, WriterConfig,
};
use sorafs_common::{Offset, CHECKSUM_BLOCK_SIZE, CHUNK_SIZE};
use sorafs_proto::{
    status, ChunkReply, ChunkRequest, MetaReply, MetaRequest, OpStatus, WriteReply,
};

const MIB: Offset = 1 << 20;

fn test_config() -> WriterConfig {
    WriterConfig {
        max_write_size: MIB,
        write_threshold: MIB,
        time_sec_between_retries: 0,
        log_prefix: "test".to_string(),
        ..WriterConfig::default()
    }
}

#[test]
fn single_chunk_replicated_write() {
    let mut h = Harness::new(test_config());
    assert_eq!(h.open_plain(7, 3, 0, 0), 0);

    let data = vec![0xa5u8; (3 * MIB) as usize];
    assert_eq!(h.writer.write_slice(&data, 0, false, 0), 3 * MIB);
    assert_eq!(h.writer.get_pending_size(), 3 * MIB);

    // One chunk writer, one allocation.
    let meta_ops = h.take_meta_ops();
    assert_eq!(meta_ops.len(), 1);
    let (alloc_id, MetaRequest::Allocate(alloc)) = &meta_ops[0] else {
        panic!("expected an allocation");
    };
    assert_eq!(alloc.file_offset, 0);
    let reply = h.alloc_ok(alloc);
    h.writer
        .meta_op_done(*alloc_id, false, MetaReply::Allocate(reply), 0);

    assert_eq!(h.conn_count(), 1);
    let chunk_ops = h.take_chunk_ops();
    assert_eq!(chunk_ops.len(), 1);
    let (wid_id, ChunkRequest::WriteIdAlloc(wid)) = &chunk_ops[0] else {
        panic!("expected a write id alloc");
    };
    assert_eq!(wid.chunk_server_loc.len(), 3);
    let reply = h.wid_ok(3);
    h.writer
        .chunk_op_done(*wid_id, false, ChunkReply::WriteIdAlloc(reply), 0);

    // Three 1 MiB ops, checksum-block aligned, all in flight at once.
    let write_ops = h.take_chunk_ops();
    assert_eq!(write_ops.len(), 3);
    for (i, (_, request)) in write_ops.iter().enumerate() {
        let ChunkRequest::Write { prepare, sync, .. } = request else {
            panic!("expected a write");
        };
        assert_eq!(prepare.offset, i as Offset * MIB);
        assert_eq!(prepare.num_bytes, MIB);
        assert_eq!(prepare.offset % CHECKSUM_BLOCK_SIZE, 0);
        assert!(prepare.reply_requested);
        assert!(sync.is_none());
        assert_eq!(prepare.write_info.len(), 3);
    }
    for (op_id, _) in &write_ops {
        h.writer
            .chunk_op_done(*op_id, false, ChunkReply::Write(Harness::write_ok()), 0);
    }
    assert_eq!(h.acked_bytes(), 3 * MIB);
    assert_eq!(h.writer.get_pending_size(), 0);

    // Acks arrive in chunk offset order.
    let acked: Vec<_> = h
        .completions()
        .iter()
        .filter(|(_, _, size)| *size > 0)
        .map(|(_, offset, _)| *offset)
        .collect();
    assert_eq!(acked, vec![0, MIB, 2 * MIB]);

    assert_eq!(h.writer.close(0), 0);
    h.pump(0);

    assert_eq!(h.truncate_offsets, vec![3 * MIB]);
    assert!(!h.writer.is_open());
    assert_eq!(h.writer.error_code(), 0);
    assert_eq!(h.completions().last(), Some(&(0, 0, 0)));
    assert_eq!(h.writer.stats().ops_write_count, 3);
    assert_eq!(h.writer.stats().chunk_alloc_count, 1);
}

#[test]
fn two_chunk_boundary_straddle() {
    let mut h = Harness::new(test_config());
    assert_eq!(h.open_plain(8, 3, 0, 0), 0);

    let data = vec![0x5au8; (CHUNK_SIZE + MIB) as usize];
    assert_eq!(
        h.writer.write_slice(&data, 0, false, 0),
        CHUNK_SIZE + MIB
    );
    h.pump(0);

    // Two chunk writers, at file offsets 0 and CHUNK_SIZE.
    assert_eq!(h.conn_count(), 2);
    assert_eq!(h.acked_bytes(), CHUNK_SIZE + MIB);
    assert_eq!(h.writer.get_pending_size(), 0);

    assert_eq!(h.writer.close(0), 0);
    h.pump(0);
    assert_eq!(h.truncate_offsets, vec![CHUNK_SIZE + MIB]);
    assert!(!h.writer.is_open());
    assert_eq!(h.writer.error_code(), 0);
}

#[test]
fn acks_are_monotone_within_chunk() {
    let mut h = Harness::new(test_config());
    assert_eq!(h.open_plain(9, 3, 0, 0), 0);
    let data = vec![1u8; (CHUNK_SIZE + MIB) as usize];
    h.writer.write_slice(&data, 0, false, 0);
    h.pump(0);
    h.writer.close(0);
    h.pump(0);

    let mut per_chunk: std::collections::HashMap<Offset, Offset> = Default::default();
    for (_, offset, size) in h.completions() {
        if size <= 0 {
            continue;
        }
        let chunk = offset - offset % CHUNK_SIZE;
        let last = per_chunk.entry(chunk).or_insert(-1);
        assert!(offset >= *last, "ack at {offset} after {last}");
        *last = offset;
    }
    assert_eq!(per_chunk.len(), 2);
}

#[test]
fn non_sequential_write_flushes_then_jumps() {
    let mut h = Harness::new(WriterConfig {
        write_threshold: 8 * MIB,
        ..test_config()
    });
    assert_eq!(h.open_plain(10, 3, 0, 0), 0);

    let half = MIB / 2;
    let data = vec![2u8; half as usize];
    assert_eq!(h.writer.write_slice(&data, 0, false, 0), half);
    // Below every threshold: still staged, nothing on the wire.
    assert!(h.take_meta_ops().is_empty());

    // The jump forces the staged bytes out first.
    assert_eq!(h.writer.write_slice(&data, 10 * MIB, false, 0), half);
    h.pump(0);
    assert_eq!(h.acked_bytes(), half);
    let acked: Vec<_> = h
        .completions()
        .iter()
        .filter(|(_, _, size)| *size > 0)
        .map(|(_, offset, _)| *offset)
        .collect();
    assert_eq!(acked, vec![0]);

    // The second write is staged at the new cursor; flush sends it at its
    // own offset.
    assert_eq!(h.writer.flush(0), 0);
    h.pump(0);
    assert_eq!(h.acked_bytes(), MIB);
    assert!(h
        .completions()
        .iter()
        .any(|(_, offset, size)| *offset == 10 * MIB && *size > 0));
}

#[test]
fn object_store_rejects_non_sequential_writes() {
    let mut h = Harness::new(test_config());
    h.object_store = true;
    h.replica_servers = 1;
    assert_eq!(h.open_plain(11, 0, 0, 0), 0);

    let data = vec![3u8; MIB as usize];
    assert_eq!(h.writer.write_slice(&data, 0, false, 0), MIB);
    let pending = h.writer.get_pending_size();
    assert_eq!(
        h.writer.write_slice(&data, 10 * MIB, false, 0),
        status::SEEK as Offset
    );
    // The rejected write leaves no trace.
    assert_eq!(h.writer.get_pending_size(), pending);
}

#[test]
fn object_store_open_rejects_existing_data() {
    let mut h = Harness::new(test_config());
    assert_eq!(h.open_plain(12, 0, 4096, 0), status::SEEK);
    assert_eq!(h.open_plain(0, 3, 0, 0), status::PARAMETERS);
}

#[test]
fn transient_write_failure_retries_once() {
    let mut h = Harness::new(WriterConfig {
        max_retry_count: 3,
        ..test_config()
    });
    assert_eq!(h.open_plain(13, 3, 0, 0), 0);
    let data = vec![4u8; MIB as usize];
    assert_eq!(h.writer.write_slice(&data, 0, true, 0), MIB);

    // Allocation and write id succeed, the first write fails.
    let meta_ops = h.take_meta_ops();
    let (alloc_id, MetaRequest::Allocate(alloc)) = &meta_ops[0] else {
        panic!("expected an allocation");
    };
    let reply = h.alloc_ok(alloc);
    h.writer
        .meta_op_done(*alloc_id, false, MetaReply::Allocate(reply), 0);
    let chunk_ops = h.take_chunk_ops();
    let (wid_id, ChunkRequest::WriteIdAlloc(_)) = &chunk_ops[0] else {
        panic!("expected a write id alloc");
    };
    let reply = h.wid_ok(3);
    h.writer
        .chunk_op_done(*wid_id, false, ChunkReply::WriteIdAlloc(reply), 0);
    let write_ops = h.take_chunk_ops();
    assert_eq!(write_ops.len(), 1);
    h.writer.chunk_op_done(
        write_ops[0].0,
        false,
        ChunkReply::Write(WriteReply {
            status: OpStatus::error(-libc::ECONNRESET, "connection reset"),
            ..WriteReply::default()
        }),
        0,
    );

    // One monitor report, a retry sleep, then the whole pipeline replays.
    assert_eq!(h.monitor_reports.lock().unwrap().len(), 1);
    assert_eq!(h.writer.stats().retries_count, 1);
    let wake = h.writer.next_wakeup().expect("retry sleep armed");
    h.writer.on_timeout(wake);
    h.pump(wake);

    assert_eq!(h.acked_bytes(), MIB);
    assert_eq!(h.writer.error_code(), 0);
    // The caller saw exactly one successful acknowledgement.
    let completions = h.completions();
    let acked: Vec<_> = completions
        .iter()
        .filter(|(_, _, size)| *size > 0)
        .collect();
    assert_eq!(acked.len(), 1);
}

#[test]
fn retry_exhaustion_is_fatal() {
    let mut h = Harness::new(WriterConfig {
        max_retry_count: 1,
        ..test_config()
    });
    assert_eq!(h.open_plain(14, 3, 0, 0), 0);
    let data = vec![5u8; MIB as usize];
    h.writer.write_slice(&data, 0, true, 0);

    let mut write_attempts = 0;
    let mut now = 0;
    for _ in 0..2 {
        // Answer allocation and write id, fail the data op.
        let meta_ops = h.take_meta_ops();
        let (alloc_id, MetaRequest::Allocate(alloc)) = &meta_ops[0] else {
            panic!("expected an allocation");
        };
        let reply = h.alloc_ok(alloc);
        h.writer
            .meta_op_done(*alloc_id, false, MetaReply::Allocate(reply), now);
        let chunk_ops = h.take_chunk_ops();
        let (wid_id, ChunkRequest::WriteIdAlloc(_)) = &chunk_ops[0] else {
            panic!("expected a write id alloc");
        };
        let reply = h.wid_ok(3);
        h.writer
            .chunk_op_done(*wid_id, false, ChunkReply::WriteIdAlloc(reply), now);
        let write_ops = h.take_chunk_ops();
        assert_eq!(write_ops.len(), 1);
        write_attempts += 1;
        h.writer.chunk_op_done(
            write_ops[0].0,
            false,
            ChunkReply::Write(WriteReply {
                status: OpStatus::error(-libc::ECONNRESET, "connection reset"),
                ..WriteReply::default()
            }),
            now,
        );
        if let Some(wake) = h.writer.next_wakeup() {
            now = wake;
            h.writer.on_timeout(now);
        }
    }

    // Retry budget of one: two transport attempts, then the error latches.
    assert_eq!(write_attempts, 2);
    assert!(h.writer.has_error());
    assert_eq!(h.writer.error_code(), -libc::ECONNRESET);
    assert_eq!(h.completions().last(), Some(&(-libc::ECONNRESET, 0, 0)));
    assert_eq!(
        h.writer.write_slice(&data, MIB, false, now),
        -libc::ECONNRESET as Offset
    );
}

#[test]
fn lease_update_during_quiescence() {
    let mut h = Harness::new(test_config());
    h.object_store = true;
    h.replica_servers = 1;
    h.lease_duration = 3600;
    assert_eq!(h.open_plain(15, 0, 0, 0), 0);

    let data = vec![6u8; MIB as usize];
    assert_eq!(h.writer.write_slice(&data, 0, true, 0), MIB);
    h.pump(0);
    assert_eq!(h.acked_bytes(), MIB);
    let completions_before = h.completions().len();

    // Quiescent object-store writer sleeps until the soft lease expiry.
    let wake = h.writer.next_wakeup().expect("lease renewal sleep armed");
    assert_eq!(wake, 200);
    h.writer.on_timeout(wake);
    let ops = h.take_chunk_ops();
    assert_eq!(ops.len(), 1);
    let (lease_id, ChunkRequest::LeaseUpdate(op)) = &ops[0] else {
        panic!("expected a lease update, got {:?}", ops[0].1);
    };
    assert_eq!(op.num_bytes, 0);
    h.writer.chunk_op_done(
        *lease_id,
        false,
        ChunkReply::LeaseUpdate(Harness::write_ok()),
        wake,
    );

    // Renewal advanced the soft expiry and produced no user-visible event.
    assert_eq!(h.completions().len(), completions_before);
    assert_eq!(h.writer.next_wakeup(), Some(400));
}

struct PassThroughStriper {
    file_size: Offset,
}

impl Striper for PassThroughStriper {
    fn process(
        &mut self,
        buffer: &mut IoBuffer,
        offset: &mut Offset,
        write_threshold: Offset,
        sink: &mut dyn StriperSink,
    ) -> i32 {
        let size = buffer.bytes_consumable();
        let queued = sink.queue_write(buffer, size, *offset, write_threshold);
        if queued > 0 {
            *offset += queued;
            self.file_size = self.file_size.max(*offset);
            sink.start_queued_write(queued);
        }
        0
    }

    fn is_write_retry_needed(
        &mut self,
        _file_offset: Offset,
        _retry_count: i32,
        _max_retry_count: i32,
        _status: &mut i32,
    ) -> bool {
        false
    }

    fn file_size(&self) -> Offset {
        self.file_size
    }

    fn pending_size(&self) -> Offset {
        0
    }
}

struct PassThroughFactory;

impl StriperFactory for PassThroughFactory {
    fn create(
        &mut self,
        _layout: &sorafs_client::StripeLayout,
        file_size: Offset,
        _log_prefix: &str,
    ) -> Result<Option<(Box<dyn Striper>, Offset)>, String> {
        Ok(Some((
            Box::new(PassThroughStriper { file_size }),
            CHUNK_SIZE,
        )))
    }
}

#[test]
fn striper_invalidate_reports_pending_as_done() {
    let mut h = Harness::with_striper_factory(test_config(), Some(Box::new(PassThroughFactory)));
    let code = h.writer.open(
        sorafs_client::OpenParams {
            file_id: 16,
            path: "/sora/test/striped".to_string(),
            file_size: 0,
            layout: sorafs_client::StripeLayout {
                kind: sorafs_client::StriperKind::ReedSolomon,
                stripe_size: 64 << 10,
                stripe_count: 6,
                recovery_stripe_count: 3,
            },
            replica_count: 1,
        },
        0,
    );
    assert_eq!(code, 0);

    let data = vec![7u8; MIB as usize];
    assert_eq!(h.writer.write_slice(&data, 0, true, 0), MIB);

    // First allocation fails; the striper elects reconstruction over retry.
    let meta_ops = h.take_meta_ops();
    let (alloc_id, MetaRequest::Allocate(_)) = &meta_ops[0] else {
        panic!("expected an allocation");
    };
    h.writer.meta_op_done(
        *alloc_id,
        false,
        MetaReply::Allocate(sorafs_proto::AllocateReply {
            status: OpStatus::error(status::IO, "allocation failed"),
            ..sorafs_proto::AllocateReply::default()
        }),
        0,
    );

    // The follow-up allocation carries the invalidation flag.
    let meta_ops = h.take_meta_ops();
    assert_eq!(meta_ops.len(), 1);
    let (alloc_id, MetaRequest::Allocate(alloc)) = &meta_ops[0] else {
        panic!("expected an allocation");
    };
    assert!(alloc.invalidate_all);
    let reply = h.alloc_ok(alloc);
    h.writer
        .meta_op_done(*alloc_id, false, MetaReply::Allocate(reply), 0);

    // Pending bytes are reported done, with no terminal error.
    assert_eq!(h.acked_bytes(), MIB);
    assert_eq!(h.writer.error_code(), 0);
    assert_eq!(h.writer.get_pending_size(), 0);
    assert_eq!(h.monitor_reports.lock().unwrap().len(), 1);
}

#[test]
fn lowering_write_threshold_unblocks_staged_data() {
    let mut h = Harness::new(WriterConfig {
        write_threshold: 8 * MIB,
        ..test_config()
    });
    assert_eq!(h.open_plain(17, 3, 0, 0), 0);
    let half = MIB / 2;
    let data = vec![8u8; half as usize];
    assert_eq!(h.writer.write_slice(&data, 0, false, 0), half);
    assert!(h.take_meta_ops().is_empty());

    assert_eq!(h.writer.set_write_threshold(0, 0), 0);
    assert_eq!(h.take_meta_ops().len(), 1);
}

#[test]
fn small_writes_coalesce_into_one_op() {
    let mut h = Harness::new(test_config());
    assert_eq!(h.open_plain(18, 3, 0, 0), 0);

    let data = vec![9u8; 10 << 10];
    assert_eq!(h.writer.write_slice(&data, 0, true, 0), 10 << 10);
    assert_eq!(h.writer.write_slice(&data, 10 << 10, true, 0), 10 << 10);

    // Both fragments merged into the still-undispatched tail op.
    let meta_ops = h.take_meta_ops();
    let (alloc_id, MetaRequest::Allocate(alloc)) = &meta_ops[0] else {
        panic!("expected an allocation");
    };
    let reply = h.alloc_ok(alloc);
    h.writer
        .meta_op_done(*alloc_id, false, MetaReply::Allocate(reply), 0);
    let chunk_ops = h.take_chunk_ops();
    let (wid_id, ChunkRequest::WriteIdAlloc(_)) = &chunk_ops[0] else {
        panic!("expected a write id alloc");
    };
    let reply = h.wid_ok(3);
    h.writer
        .chunk_op_done(*wid_id, false, ChunkReply::WriteIdAlloc(reply), 0);

    let write_ops = h.take_chunk_ops();
    assert_eq!(write_ops.len(), 1);
    let ChunkRequest::Write { prepare, .. } = &write_ops[0].1 else {
        panic!("expected a write");
    };
    assert_eq!(prepare.offset, 0);
    assert_eq!(prepare.num_bytes, 20 << 10);
}

#[test]
fn sub_block_tail_is_split_at_block_multiples() {
    let mut h = Harness::new(test_config());
    assert_eq!(h.open_plain(19, 3, 0, 0), 0);

    let len = (CHECKSUM_BLOCK_SIZE + (36 << 10)) as usize;
    assert_eq!(
        h.writer.write_slice(&vec![1u8; len], 0, true, 0),
        len as Offset
    );
    h.pump(0);

    let sizes: Vec<Offset> = h
        .completions()
        .iter()
        .filter(|(_, _, size)| *size > 0)
        .map(|(_, _, size)| *size)
        .collect();
    // Every op except the trailing one is a checksum-block multiple.
    assert_eq!(sizes.iter().sum::<Offset>(), len as Offset);
    for size in &sizes[..sizes.len() - 1] {
        assert_eq!(size % CHECKSUM_BLOCK_SIZE, 0);
    }
}

#[test]
fn zero_length_write_acknowledges_immediately() {
    let mut h = Harness::new(test_config());
    assert_eq!(h.open_plain(20, 3, 0, 0), 0);
    let mut empty = IoBuffer::new();
    assert_eq!(h.writer.write(&mut empty, 0, 4096, false, None, 0), 0);
    assert_eq!(h.completions(), vec![(0, 4096, 0)]);
    assert!(h.take_meta_ops().is_empty());
}

#[test]
fn flush_on_empty_buffer_is_a_no_op() {
    let mut h = Harness::new(test_config());
    assert_eq!(h.open_plain(21, 3, 0, 0), 0);
    assert_eq!(h.writer.flush(0), 0);
    assert_eq!(h.writer.flush(0), 0);
    assert!(h.take_meta_ops().is_empty());
    assert!(h.completions().is_empty());
}

#[test]
fn truncate_failure_retries_then_succeeds() {
    let mut h = Harness::new(WriterConfig {
        time_sec_between_retries: 10,
        ..test_config()
    });
    assert_eq!(h.open_plain(22, 3, 0, 0), 0);
    let data = vec![1u8; MIB as usize];
    h.writer.write_slice(&data, 0, true, 0);
    h.pump(0);
    h.writer.close(0);

    // Answer the chunk close, then fail the truncate once.
    let chunk_ops = h.take_chunk_ops();
    assert_eq!(chunk_ops.len(), 1);
    h.writer.chunk_op_done(
        chunk_ops[0].0,
        false,
        ChunkReply::Close(Harness::close_ok()),
        0,
    );
    let meta_ops = h.take_meta_ops();
    assert_eq!(meta_ops.len(), 1);
    assert!(matches!(meta_ops[0].1, MetaRequest::Truncate(_)));
    h.writer.meta_op_done(
        meta_ops[0].0,
        false,
        MetaReply::Truncate(OpStatus::error(status::IO, "busy")),
        0,
    );

    // Retry sleeps, then the commit goes through and the close completes.
    let wake = h.writer.next_wakeup().expect("truncate retry sleep");
    assert_eq!(wake, 10);
    h.writer.on_timeout(wake);
    h.pump(wake);
    assert_eq!(h.truncate_offsets, vec![MIB]);
    assert!(!h.writer.is_open());
    assert_eq!(h.writer.error_code(), 0);
    assert_eq!(h.completions().last(), Some(&(0, 0, 0)));
}

#[test]
fn object_store_requires_write_prepare_reply_support() {
    let mut h = Harness::new(WriterConfig {
        max_retry_count: 0,
        ..test_config()
    });
    h.object_store = true;
    h.replica_servers = 1;
    h.write_prep_reply_supported = false;
    assert_eq!(h.open_plain(23, 0, 0, 0), 0);

    let data = vec![2u8; MIB as usize];
    h.writer.write_slice(&data, 0, true, 0);
    h.pump(0);

    assert!(h.writer.has_error());
    assert_eq!(h.writer.error_code(), status::PARAMETERS);
    assert_eq!(h.completions().last(), Some(&(status::PARAMETERS, 0, 0)));
}

#[test]
fn stop_discards_everything() {
    let mut h = Harness::new(test_config());
    assert_eq!(h.open_plain(24, 3, 0, 0), 0);
    let data = vec![3u8; (2 * MIB) as usize];
    h.writer.write_slice(&data, 0, false, 0);
    assert!(h.writer.get_pending_size() > 0);

    h.writer.stop();
    assert_eq!(h.writer.get_pending_size(), 0);
    assert!(h.writer.is_open());

    h.writer.shutdown();
    assert!(!h.writer.is_open());
    assert_eq!(h.writer.error_code(), 0);
}

#[test]
fn reaper_closes_trailing_chunk_writer_early() {
    let mut h = Harness::new(test_config());
    assert_eq!(h.open_plain(25, 3, 0, 0), 0);
    let data = vec![4u8; (CHUNK_SIZE + MIB) as usize];
    h.writer.write_slice(&data, 0, false, 0);
    h.pump(0);

    // The first chunk's writer is idle and behind the open chunk block, so
    // the reaper closed it without waiting for file close.
    let closes: usize = (0..h.conn_count())
        .map(|i| {
            let conn = h.conn(i);
            let ops = conn.ops.lock().unwrap();
            ops.iter()
                .filter(|(_, request)| matches!(request, ChunkRequest::Close(_)))
                .count()
        })
        .sum();
    assert_eq!(h.conn_count(), 2);
    assert!(closes >= 1, "trailing writer not reaped");
}

#[test]
fn chunk_server_sequence_numbers_step_by_ten_thousand() {
    let mut h = Harness::new(test_config());
    assert_eq!(h.open_plain(26, 3, 0, 0), 0);
    let data = vec![5u8; (CHUNK_SIZE + MIB) as usize];
    h.writer.write_slice(&data, 0, false, 0);
    h.pump(0);
    assert_eq!(h.conn_count(), 2);
    let first = h.conn(0).initial_seq_num;
    let second = h.conn(1).initial_seq_num;
    assert_eq!(second - first, 10_000);
}
