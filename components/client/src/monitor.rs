use sorafs_proto::ServerLocation;
use tracing::error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientOpKind {
    Write,
}

/// Host hook for per-op failure telemetry. Invoked once for every
/// non-cancelled op failure, before the retry decision.
pub trait Monitor: Send {
    fn report_error(
        &mut self,
        kind: ClientOpKind,
        meta_server: &ServerLocation,
        chunk_server: Option<&ServerLocation>,
        status: i32,
    );
}

#[derive(Debug, Default)]
pub struct NullMonitor;

impl Monitor for NullMonitor {
    fn report_error(
        &mut self,
        _kind: ClientOpKind,
        _meta_server: &ServerLocation,
        _chunk_server: Option<&ServerLocation>,
        _status: i32,
    ) {
    }
}

/// Reports failures through tracing.
#[derive(Debug, Default)]
pub struct LogMonitor;

impl Monitor for LogMonitor {
    fn report_error(
        &mut self,
        kind: ClientOpKind,
        meta_server: &ServerLocation,
        chunk_server: Option<&ServerLocation>,
        status: i32,
    ) {
        error!(
            ?kind,
            meta_server = %meta_server,
            chunk_server = %chunk_server.map(|l| l.to_string()).unwrap_or_default(),
            status,
            "client op failed"
        );
    }
}
