//! Drives the tokio shell end to end: commands through the handle,
//! completions through the transport event channel, with a paused clock.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sorafs_client::{
    testing::{Harness, RecordingCompletion},
    OpenParams, StripeLayout, TransportEvent, WriterConfig, WriterDriver,
};
use sorafs_common::Offset;
use sorafs_proto::{ChunkReply, ChunkRequest, MetaReply, MetaRequest, OpStatus};

const MIB: Offset = 1 << 20;

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn driver_write_close_round_trip() {
    let mut harness = Harness::new(WriterConfig {
        max_write_size: MIB,
        write_threshold: 0,
        ..WriterConfig::default()
    });
    harness.replica_servers = 1;
    let meta = harness.meta.clone();
    let fleet = harness.fleet.clone();
    let completions = Arc::new(Mutex::new(Vec::new()));
    harness
        .writer
        .register(Box::new(RecordingCompletion(completions.clone())));

    // Reply fabrication needs the harness, but the driver owns the writer;
    // move the writer out and keep the mock ends.
    let mut reply_shaper = Harness::new(WriterConfig::default());
    reply_shaper.replica_servers = 1;
    let writer = harness.writer;

    let (driver, handle, events) = WriterDriver::new(writer);
    let driver_task = tokio::spawn(driver.run());

    handle
        .open(OpenParams {
            file_id: 42,
            path: "/sora/test/driver".to_string(),
            file_size: 0,
            layout: StripeLayout::default(),
            replica_count: 1,
        })
        .await
        .unwrap();

    let accepted = handle
        .write_with(Bytes::from(vec![0x42u8; (64 << 10) as usize]), 0, true)
        .await
        .unwrap();
    assert_eq!(accepted, 64 << 10);

    // Pump transport completions until the pipeline drains.
    for _ in 0..8 {
        settle().await;
        let meta_ops = std::mem::take(&mut *meta.ops.lock().unwrap());
        for (op_id, request) in meta_ops {
            let reply = match request {
                MetaRequest::Allocate(op) => MetaReply::Allocate(reply_shaper.alloc_ok(&op)),
                MetaRequest::Truncate(_) => MetaReply::Truncate(OpStatus::ok()),
            };
            events
                .send(TransportEvent::Meta {
                    op_id,
                    canceled: false,
                    reply,
                })
                .unwrap();
        }
        let conns: Vec<_> = fleet.conns.lock().unwrap().clone();
        for conn in conns {
            let chunk_ops = std::mem::take(&mut *conn.ops.lock().unwrap());
            for (op_id, request) in chunk_ops {
                let reply = match request {
                    ChunkRequest::WriteIdAlloc(op) => {
                        ChunkReply::WriteIdAlloc(reply_shaper.wid_ok(op.chunk_server_loc.len()))
                    }
                    ChunkRequest::Write { .. } => ChunkReply::Write(Harness::write_ok()),
                    ChunkRequest::LeaseUpdate(_) => ChunkReply::LeaseUpdate(Harness::write_ok()),
                    ChunkRequest::Close(_) => ChunkReply::Close(Harness::close_ok()),
                };
                events
                    .send(TransportEvent::Chunk {
                        op_id,
                        canceled: false,
                        reply,
                    })
                    .unwrap();
            }
        }
    }

    settle().await;
    assert_eq!(handle.pending_size().await.unwrap(), 0);
    {
        let done = completions.lock().unwrap();
        assert!(done.iter().any(|(status, _, size)| *status == 0 && *size == (64 << 10)));
    }

    handle.close().await.unwrap();
    for _ in 0..8 {
        settle().await;
        let meta_ops = std::mem::take(&mut *meta.ops.lock().unwrap());
        for (op_id, request) in meta_ops {
            let reply = match request {
                MetaRequest::Allocate(op) => MetaReply::Allocate(reply_shaper.alloc_ok(&op)),
                MetaRequest::Truncate(_) => MetaReply::Truncate(OpStatus::ok()),
            };
            events
                .send(TransportEvent::Meta {
                    op_id,
                    canceled: false,
                    reply,
                })
                .unwrap();
        }
        let conns: Vec<_> = fleet.conns.lock().unwrap().clone();
        for conn in conns {
            let chunk_ops = std::mem::take(&mut *conn.ops.lock().unwrap());
            for (op_id, request) in chunk_ops {
                let reply = match request {
                    ChunkRequest::Close(_) => ChunkReply::Close(Harness::close_ok()),
                    ChunkRequest::Write { .. } => ChunkReply::Write(Harness::write_ok()),
                    ChunkRequest::WriteIdAlloc(op) => {
                        ChunkReply::WriteIdAlloc(reply_shaper.wid_ok(op.chunk_server_loc.len()))
                    }
                    ChunkRequest::LeaseUpdate(_) => ChunkReply::LeaseUpdate(Harness::write_ok()),
                };
                events
                    .send(TransportEvent::Chunk {
                        op_id,
                        canceled: false,
                        reply,
                    })
                    .unwrap();
            }
        }
    }

    settle().await;
    {
        let done = completions.lock().unwrap();
        assert_eq!(done.last(), Some(&(0, 0, 0)));
    }

    handle.cancel();
    driver_task.await.unwrap();
}
