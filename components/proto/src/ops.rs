//! Op payloads the write path sends to the meta server and to chunk servers,
//! and the replies it consumes. Ops are plain data: the core fills them in,
//! hands a copy to a transport, and later merges the reply back into its own
//! persistent op state.

use sorafs_common::{ChunkId, ChunkVersion, FileId, Offset};

use crate::location::ServerLocation;

/// Per-replica write pipeline handle issued by `write_id_alloc`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteInfo {
    pub server: ServerLocation,
    pub write_id: i64,
}

/// Completion status shared by every reply.
#[derive(Clone, Debug, Default)]
pub struct OpStatus {
    pub status: i32,
    pub status_msg: String,
    /// Last transport-level error seen before a `MAX_RETRY_REACHED` status.
    pub last_error: i32,
}

impl OpStatus {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(status: i32, msg: impl Into<String>) -> Self {
        Self {
            status,
            status_msg: msg.into(),
            last_error: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RpcFormat {
    #[default]
    Long,
    Short,
}

/// Access credentials attached to every chunk-server op, plus the in-band
/// renewal request flags.
#[derive(Clone, Debug, Default)]
pub struct ChunkAccess {
    pub access: String,
    pub create_chunk_access: bool,
    pub create_chunk_server_access: bool,
    pub has_subject_id: bool,
    pub subject_id: i64,
    /// Ask the server to wrap the renewed chunk-server key with the session
    /// key when the connection runs in clear text.
    pub decrypt_with_session_key: bool,
}

/// Renewed credentials carried on a reply.
#[derive(Clone, Debug, Default)]
pub struct AccessReply {
    pub chunk_access: String,
    pub chunk_server_access_id: String,
    pub chunk_server_access_key: Vec<u8>,
    pub issued_time: i64,
    pub valid_for_secs: i64,
}

/// Meta-server chunk allocation. Request and reply state live together: the
/// reply fields double as the writer's record of the held lease.
#[derive(Clone, Debug)]
pub struct AllocateOp {
    // request
    pub fid: FileId,
    pub pathname: String,
    pub file_offset: Offset,
    pub append: bool,
    /// Tell the meta server to mark this chunk position missing so reads
    /// reconstruct it from recovery stripes.
    pub invalidate_all: bool,
    /// Master-server hint used when re-allocating an object-store block.
    pub master_server: ServerLocation,
    // reply, merged in by the writer
    pub chunk_id: ChunkId,
    pub chunk_version: ChunkVersion,
    pub chunk_servers: Vec<ServerLocation>,
    pub chunk_lease_duration: i64,
    pub chunk_access: String,
    pub chunk_server_access_token: String,
    pub chunk_server_access_key: Vec<u8>,
    pub chunk_server_access_issued_time: i64,
    pub chunk_server_access_valid_for_time: i64,
    pub allow_cs_clear_text: bool,
    pub all_cs_short_rpc: bool,
}

impl Default for AllocateOp {
    fn default() -> Self {
        Self {
            fid: -1,
            pathname: String::new(),
            file_offset: -1,
            append: false,
            invalidate_all: false,
            master_server: ServerLocation::default(),
            chunk_id: -1,
            chunk_version: -1,
            chunk_servers: Vec::new(),
            chunk_lease_duration: -1,
            chunk_access: String::new(),
            chunk_server_access_token: String::new(),
            chunk_server_access_key: Vec::new(),
            chunk_server_access_issued_time: 0,
            chunk_server_access_valid_for_time: 0,
            allow_cs_clear_text: false,
            all_cs_short_rpc: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AllocateReply {
    pub status: OpStatus,
    pub chunk_id: ChunkId,
    pub chunk_version: ChunkVersion,
    pub chunk_servers: Vec<ServerLocation>,
    pub master_server: ServerLocation,
    pub chunk_lease_duration: i64,
    pub chunk_access: String,
    pub chunk_server_access_token: String,
    pub chunk_server_access_key: Vec<u8>,
    pub chunk_server_access_issued_time: i64,
    pub chunk_server_access_valid_for_time: i64,
    pub allow_cs_clear_text: bool,
    pub all_cs_short_rpc: bool,
}

/// Final file-size commit sent to the meta server at the tail of close.
#[derive(Clone, Debug)]
pub struct TruncateOp {
    pub fid: FileId,
    pub pathname: String,
    pub file_offset: Offset,
}

impl Default for TruncateOp {
    fn default() -> Self {
        Self {
            fid: -1,
            pathname: String::new(),
            file_offset: -1,
        }
    }
}

/// Obtains one write id per replica and probes write-prepare-reply support.
#[derive(Clone, Debug, Default)]
pub struct WriteIdAllocOp {
    pub chunk_id: ChunkId,
    pub chunk_version: ChunkVersion,
    pub for_record_append: bool,
    pub chunk_server_loc: Vec<ServerLocation>,
    pub offset: Offset,
    pub num_bytes: Offset,
    pub access: ChunkAccess,
    /// Learned from the reply; retained so subsequent writes know whether
    /// the sync op is subsumed.
    pub write_prep_reply_supported: bool,
}

#[derive(Clone, Debug, Default)]
pub struct WriteIdAllocReply {
    pub status: OpStatus,
    pub write_ids: Vec<WriteInfo>,
    pub write_prep_reply_supported: bool,
    pub access: AccessReply,
}

/// Stages payload bytes on the replica pipeline. With
/// `reply_requested` the server acknowledges durability directly and no
/// write-sync follows; a zero-byte prepare doubles as the lease keep-alive.
#[derive(Clone, Debug)]
pub struct WritePrepareOp {
    pub chunk_id: ChunkId,
    pub chunk_version: ChunkVersion,
    pub offset: Offset,
    pub num_bytes: Offset,
    pub write_info: Vec<WriteInfo>,
    /// Composite checksum over the whole payload (reply-required variant).
    pub checksum: u32,
    /// Per-checksum-block checksums (write-sync variant).
    pub checksums: Vec<u32>,
    pub reply_requested: bool,
    pub access: ChunkAccess,
}

impl Default for WritePrepareOp {
    fn default() -> Self {
        Self {
            chunk_id: -1,
            chunk_version: -1,
            offset: 0,
            num_bytes: 0,
            write_info: Vec::new(),
            checksum: 0,
            checksums: Vec::new(),
            reply_requested: false,
            access: ChunkAccess::default(),
        }
    }
}

/// Commits a previously prepared range; paired with `WritePrepareOp` when
/// the chunk server does not support write-prepare replies.
#[derive(Clone, Debug, Default)]
pub struct WriteSyncOp {
    pub chunk_id: ChunkId,
    pub chunk_version: ChunkVersion,
    pub offset: Offset,
    pub num_bytes: Offset,
    pub write_info: Vec<WriteInfo>,
    pub checksums: Vec<u32>,
    pub access: ChunkAccess,
}

#[derive(Clone, Debug, Default)]
pub struct WriteReply {
    pub status: OpStatus,
    pub access: AccessReply,
}

/// Releases the write pipeline; for object-store chunks this declares the
/// block stable.
#[derive(Clone, Debug)]
pub struct CloseChunkOp {
    pub chunk_id: ChunkId,
    pub chunk_version: ChunkVersion,
    pub write_info: Vec<WriteInfo>,
    /// Used instead of write ids when none were obtained.
    pub chunk_server_loc: Vec<ServerLocation>,
    pub access: ChunkAccess,
}

impl Default for CloseChunkOp {
    fn default() -> Self {
        Self {
            chunk_id: -1,
            chunk_version: -1,
            write_info: Vec::new(),
            chunk_server_loc: Vec::new(),
            access: ChunkAccess::default(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CloseReply {
    pub status: OpStatus,
}
