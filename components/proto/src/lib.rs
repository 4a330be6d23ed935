//! Wire-level types shared between the client core and the RPC transports:
//! op payloads and replies, server locations, access-token bookkeeping, and
//! the enqueue/cancel traits the core drives its transports through.

pub mod location;
pub mod ops;
pub mod status;
pub mod transport;

pub use location::ServerLocation;
pub use ops::{
    AccessReply, AllocateOp, AllocateReply, ChunkAccess, CloseChunkOp, CloseReply, OpStatus,
    RpcFormat, TruncateOp, WriteIdAllocOp, WriteIdAllocReply, WriteInfo, WritePrepareOp, WriteReply,
    WriteSyncOp,
};
pub use transport::{
    ChunkReply, ChunkRequest, ChunkServerClient, ChunkServerClientFactory, MetaReply, MetaRequest,
    MetaServerClient, OpId,
};
