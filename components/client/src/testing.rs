//! Mock transports and recording sinks for driving the write path
//! deterministically in tests: ops are captured instead of sent, and tests
//! feed replies and time back in by hand.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use sorafs_common::{Offset, SeqNum, TimeSec};
use sorafs_proto::{
    AccessReply, AllocateOp, AllocateReply, ChunkReply, ChunkRequest, ChunkServerClient,
    ChunkServerClientFactory, CloseReply, MetaReply, MetaRequest, MetaServerClient, OpId, OpStatus,
    RpcFormat, ServerLocation, WriteIdAllocReply, WriteInfo, WriteReply,
};

use crate::{
    config::WriterConfig,
    file_writer::{Completion, FileWriter, OpenParams},
    monitor::{ClientOpKind, Monitor},
    striper::{StripeLayout, StriperFactory, StriperKind},
};

#[derive(Clone, Default)]
struct OpIdGen(Arc<AtomicU64>);

impl OpIdGen {
    fn next(&self) -> OpId {
        OpId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[derive(Clone, Default)]
pub struct MetaLog {
    pub ops: Arc<Mutex<Vec<(OpId, MetaRequest)>>>,
    pub canceled: Arc<Mutex<Vec<OpId>>>,
}

pub struct MockMetaClient {
    ids: OpIdGen,
    log: MetaLog,
    pub clear_text_allowed: bool,
    pub op_timeout: Duration,
}

impl MetaServerClient for MockMetaClient {
    fn enqueue(&mut self, request: MetaRequest, _extra_timeout: Duration) -> OpId {
        let id = self.ids.next();
        self.log.ops.lock().unwrap().push((id, request));
        id
    }

    fn cancel(&mut self, op: OpId) {
        self.log.canceled.lock().unwrap().push(op);
    }

    fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    fn location(&self) -> ServerLocation {
        ServerLocation::new("meta", 20000)
    }

    fn is_clear_text_allowed(&self) -> bool {
        self.clear_text_allowed
    }
}

/// Everything observed on one mock chunk-server connection.
#[derive(Default)]
pub struct ChunkConnLog {
    pub initial_seq_num: SeqNum,
    pub ops: Mutex<Vec<(OpId, ChunkRequest)>>,
    pub server: Mutex<Option<ServerLocation>>,
    pub stop_count: AtomicU64,
    pub op_timeout: Mutex<Option<Duration>>,
    pub rpc_format: Mutex<Option<RpcFormat>>,
    pub session_key: Mutex<Option<(String, Vec<u8>)>>,
}

#[derive(Clone, Default)]
pub struct ChunkFleet {
    pub conns: Arc<Mutex<Vec<Arc<ChunkConnLog>>>>,
    ids: OpIdGen,
}

pub struct MockChunkFactory {
    fleet: ChunkFleet,
}

impl ChunkServerClientFactory for MockChunkFactory {
    fn connect(
        &mut self,
        initial_seq_num: SeqNum,
        _op_timeout: Duration,
        _idle_timeout: Duration,
    ) -> Box<dyn ChunkServerClient> {
        let log = Arc::new(ChunkConnLog {
            initial_seq_num,
            ..ChunkConnLog::default()
        });
        self.fleet.conns.lock().unwrap().push(log.clone());
        Box::new(MockChunkClient {
            log,
            ids: self.fleet.ids.clone(),
            shutdown_ssl: false,
        })
    }
}

pub struct MockChunkClient {
    log: Arc<ChunkConnLog>,
    ids: OpIdGen,
    shutdown_ssl: bool,
}

impl ChunkServerClient for MockChunkClient {
    fn set_server(
        &mut self,
        location: &ServerLocation,
        _cancel_pending_ops: bool,
    ) -> Result<(), String> {
        if !location.is_valid() {
            return Err(format!("invalid location: {location}"));
        }
        *self.log.server.lock().unwrap() = Some(location.clone());
        Ok(())
    }

    fn server_location(&self) -> Option<ServerLocation> {
        self.log.server.lock().unwrap().clone()
    }

    fn set_op_timeout(&mut self, timeout: Duration) {
        *self.log.op_timeout.lock().unwrap() = Some(timeout);
    }

    fn set_rpc_format(&mut self, format: RpcFormat) {
        *self.log.rpc_format.lock().unwrap() = Some(format);
    }

    fn set_session_key(&mut self, id: &str, key: &[u8]) {
        *self.log.session_key.lock().unwrap() = Some((id.to_string(), key.to_vec()));
    }

    fn clear_session_key(&mut self) {
        *self.log.session_key.lock().unwrap() = None;
    }

    fn set_shutdown_ssl(&mut self, enabled: bool) {
        self.shutdown_ssl = enabled;
    }

    fn is_shutdown_ssl(&self) -> bool {
        self.shutdown_ssl
    }

    fn enqueue(&mut self, request: ChunkRequest) -> OpId {
        let id = self.ids.next();
        self.log.ops.lock().unwrap().push((id, request));
        id
    }

    fn stop(&mut self) {
        self.log.stop_count.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct RecordingCompletion(pub Arc<Mutex<Vec<(i32, Offset, Offset)>>>);

impl Completion for RecordingCompletion {
    fn done(&mut self, status: i32, offset: Offset, size: Offset) {
        self.0.lock().unwrap().push((status, offset, size));
    }
}

pub struct RecordingMonitor(pub Arc<Mutex<Vec<i32>>>);

impl Monitor for RecordingMonitor {
    fn report_error(
        &mut self,
        _kind: ClientOpKind,
        _meta_server: &ServerLocation,
        _chunk_server: Option<&ServerLocation>,
        status: i32,
    ) {
        self.0.lock().unwrap().push(status);
    }
}

/// A writer wired to mock transports, with helpers to pop outstanding ops
/// and build success replies.
pub struct Harness {
    pub writer: FileWriter,
    pub meta: MetaLog,
    pub fleet: ChunkFleet,
    pub completions: Arc<Mutex<Vec<(i32, Offset, Offset)>>>,
    pub monitor_reports: Arc<Mutex<Vec<i32>>>,
    /// Shape of the replies `pump` fabricates.
    pub replica_servers: usize,
    pub lease_duration: i64,
    pub write_prep_reply_supported: bool,
    /// When set, allocations come back with a negative chunk version, the
    /// object-store convention.
    pub object_store: bool,
    /// File sizes committed through truncate ops answered by `pump`.
    pub truncate_offsets: Vec<Offset>,
    next_chunk_id: i64,
    next_write_id: i64,
}

impl Harness {
    pub fn new(config: WriterConfig) -> Self {
        Self::with_striper_factory(config, None)
    }

    pub fn with_striper_factory(
        config: WriterConfig,
        striper_factory: Option<Box<dyn StriperFactory>>,
    ) -> Self {
        let ids = OpIdGen::default();
        let meta = MetaLog::default();
        let fleet = ChunkFleet {
            conns: Arc::new(Mutex::new(Vec::new())),
            ids: ids.clone(),
        };
        let completions = Arc::new(Mutex::new(Vec::new()));
        let monitor_reports = Arc::new(Mutex::new(Vec::new()));
        let writer = FileWriter::new(
            Box::new(MockMetaClient {
                ids,
                log: meta.clone(),
                clear_text_allowed: true,
                op_timeout: Duration::from_secs(30),
            }),
            Box::new(MockChunkFactory {
                fleet: fleet.clone(),
            }),
            Some(Box::new(RecordingCompletion(completions.clone()))),
            Box::new(RecordingMonitor(monitor_reports.clone())),
            striper_factory,
            config,
        );
        Self {
            writer,
            meta,
            fleet,
            completions,
            monitor_reports,
            replica_servers: 3,
            lease_duration: 300,
            write_prep_reply_supported: true,
            object_store: false,
            truncate_offsets: Vec::new(),
            next_chunk_id: 1000,
            next_write_id: 1,
        }
    }

    pub fn open_plain(&mut self, file_id: i64, replica_count: i32, file_size: Offset, now: TimeSec) -> i32 {
        self.writer.open(
            OpenParams {
                file_id,
                path: format!("/sora/test/{file_id}"),
                file_size,
                layout: StripeLayout {
                    kind: StriperKind::None,
                    ..StripeLayout::default()
                },
                replica_count,
            },
            now,
        )
    }

    pub fn take_meta_ops(&self) -> Vec<(OpId, MetaRequest)> {
        std::mem::take(&mut *self.meta.ops.lock().unwrap())
    }

    pub fn conn_count(&self) -> usize {
        self.fleet.conns.lock().unwrap().len()
    }

    pub fn conn(&self, index: usize) -> Arc<ChunkConnLog> {
        self.fleet.conns.lock().unwrap()[index].clone()
    }

    pub fn take_chunk_ops(&self) -> Vec<(OpId, ChunkRequest)> {
        let conns = self.fleet.conns.lock().unwrap().clone();
        let mut out = Vec::new();
        for conn in conns {
            out.append(&mut conn.ops.lock().unwrap());
        }
        out
    }

    pub fn completions(&self) -> Vec<(i32, Offset, Offset)> {
        self.completions.lock().unwrap().clone()
    }

    pub fn acked_bytes(&self) -> Offset {
        self.completions().iter().map(|(_, _, size)| size).sum()
    }

    pub fn servers(&self) -> Vec<ServerLocation> {
        (0..self.replica_servers)
            .map(|i| ServerLocation::new(format!("cs{i}"), 20_000 + i as i32))
            .collect()
    }

    pub fn alloc_ok(&mut self, _op: &AllocateOp) -> AllocateReply {
        self.next_chunk_id += 1;
        let chunk_version = if self.object_store { -1 } else { 1 };
        AllocateReply {
            status: OpStatus::ok(),
            chunk_id: self.next_chunk_id,
            chunk_version,
            chunk_servers: self.servers(),
            master_server: ServerLocation::new("cs0", 20_000),
            chunk_lease_duration: self.lease_duration,
            ..AllocateReply::default()
        }
    }

    pub fn wid_ok(&mut self, server_count: usize) -> WriteIdAllocReply {
        let write_ids = (0..server_count)
            .map(|i| {
                self.next_write_id += 1;
                WriteInfo {
                    server: ServerLocation::new(format!("cs{i}"), 20_000 + i as i32),
                    write_id: self.next_write_id,
                }
            })
            .collect();
        WriteIdAllocReply {
            status: OpStatus::ok(),
            write_ids,
            write_prep_reply_supported: self.write_prep_reply_supported,
            access: AccessReply::default(),
        }
    }

    pub fn write_ok() -> WriteReply {
        WriteReply {
            status: OpStatus::ok(),
            access: AccessReply::default(),
        }
    }

    pub fn close_ok() -> CloseReply {
        CloseReply {
            status: OpStatus::ok(),
        }
    }

    /// Replies success to every outstanding op, repeatedly, until the writer
    /// stops issuing new ones. Returns the number of ops answered.
    pub fn pump(&mut self, now: TimeSec) -> usize {
        let mut answered = 0;
        loop {
            let meta_ops = self.take_meta_ops();
            let chunk_ops = self.take_chunk_ops();
            if meta_ops.is_empty() && chunk_ops.is_empty() {
                break;
            }
            for (op_id, request) in meta_ops {
                answered += 1;
                match request {
                    MetaRequest::Allocate(op) => {
                        let reply = self.alloc_ok(&op);
                        self.writer
                            .meta_op_done(op_id, false, MetaReply::Allocate(reply), now);
                    }
                    MetaRequest::Truncate(op) => {
                        self.truncate_offsets.push(op.file_offset);
                        self.writer
                            .meta_op_done(op_id, false, MetaReply::Truncate(OpStatus::ok()), now);
                    }
                }
            }
            for (op_id, request) in chunk_ops {
                answered += 1;
                match request {
                    ChunkRequest::WriteIdAlloc(op) => {
                        let reply = self.wid_ok(op.chunk_server_loc.len());
                        self.writer
                            .chunk_op_done(op_id, false, ChunkReply::WriteIdAlloc(reply), now);
                    }
                    ChunkRequest::Write { .. } => {
                        self.writer.chunk_op_done(
                            op_id,
                            false,
                            ChunkReply::Write(Self::write_ok()),
                            now,
                        );
                    }
                    ChunkRequest::LeaseUpdate(_) => {
                        self.writer.chunk_op_done(
                            op_id,
                            false,
                            ChunkReply::LeaseUpdate(Self::write_ok()),
                            now,
                        );
                    }
                    ChunkRequest::Close(_) => {
                        self.writer.chunk_op_done(
                            op_id,
                            false,
                            ChunkReply::Close(Self::close_ok()),
                            now,
                        );
                    }
                }
            }
        }
        answered
    }
}
