//! Transport traits consumed by the write path. A transport accepts ops and
//! returns an `OpId` immediately; the host later feeds the completion (reply
//! or cancellation) back into the core. Nothing here ever calls back into
//! the core synchronously.

use std::time::Duration;

use bytes::Bytes;

use crate::{
    location::ServerLocation,
    ops::{
        AllocateOp, AllocateReply, CloseChunkOp, CloseReply, OpStatus, RpcFormat, TruncateOp,
        WriteIdAllocOp, WriteIdAllocReply, WritePrepareOp, WriteReply, WriteSyncOp,
    },
};

/// Handle identifying one enqueued op, unique per transport set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpId(pub u64);

#[derive(Clone, Debug)]
pub enum MetaRequest {
    Allocate(AllocateOp),
    Truncate(TruncateOp),
}

#[derive(Clone, Debug)]
pub enum MetaReply {
    Allocate(AllocateReply),
    Truncate(OpStatus),
}

pub trait MetaServerClient: Send {
    /// Enqueues an op; `extra_timeout` extends the configured op timeout for
    /// requests that may legitimately take longer (chunk version changes).
    fn enqueue(&mut self, request: MetaRequest, extra_timeout: Duration) -> OpId;

    /// Cancels an in-flight op. The transport stops tracking it; no
    /// completion may be delivered for it afterwards.
    fn cancel(&mut self, op: OpId);

    fn op_timeout(&self) -> Duration;

    fn location(&self) -> ServerLocation;

    /// Whether the authentication context permits clear-text chunk-server
    /// connections.
    fn is_clear_text_allowed(&self) -> bool;
}

#[derive(Clone, Debug)]
pub enum ChunkRequest {
    WriteIdAlloc(WriteIdAllocOp),
    Write {
        prepare: WritePrepareOp,
        /// Absent when the prepare carries `reply_requested`.
        sync: Option<WriteSyncOp>,
        data: Vec<Bytes>,
    },
    LeaseUpdate(WritePrepareOp),
    Close(CloseChunkOp),
}

#[derive(Clone, Debug)]
pub enum ChunkReply {
    WriteIdAlloc(WriteIdAllocReply),
    Write(WriteReply),
    LeaseUpdate(WriteReply),
    Close(CloseReply),
}

/// One connection to a chunk replica group. Created per chunk writer; op
/// retries are handled above this layer, so the connection itself does not
/// retry.
pub trait ChunkServerClient: Send {
    /// Points the connection at a server, optionally cancelling everything
    /// still queued. An error message is returned when the location is
    /// unusable.
    fn set_server(
        &mut self,
        location: &ServerLocation,
        cancel_pending_ops: bool,
    ) -> Result<(), String>;

    fn server_location(&self) -> Option<ServerLocation>;

    fn set_op_timeout(&mut self, timeout: Duration);

    fn set_rpc_format(&mut self, format: RpcFormat);

    fn set_session_key(&mut self, id: &str, key: &[u8]);

    fn clear_session_key(&mut self);

    fn set_shutdown_ssl(&mut self, enabled: bool);

    fn is_shutdown_ssl(&self) -> bool;

    fn enqueue(&mut self, request: ChunkRequest) -> OpId;

    /// Drops the connection and cancels every op still queued on it.
    fn stop(&mut self);
}

pub trait ChunkServerClientFactory: Send {
    /// Opens a fresh chunk-server connection seeded with the given sequence
    /// number.
    fn connect(
        &mut self,
        initial_seq_num: i64,
        op_timeout: Duration,
        idle_timeout: Duration,
    ) -> Box<dyn ChunkServerClient>;
}
