//! Async shell around the core: one task owns the [`FileWriter`] and pumps
//! application commands, transport completions and sleep timers into it.
//! Hosts that run their own event loop can drive the core directly instead.

use std::time::Duration;

use bytes::Bytes;
use sorafs_common::{Offset, TimeSec};
use sorafs_proto::{ChunkReply, MetaReply, OpId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    buffer::IoBuffer,
    err::{Error, GoneSnafu, Result},
    file_writer::{FileWriter, OpenParams},
};

/// Completion delivered by a transport implementation.
#[derive(Debug)]
pub enum TransportEvent {
    Meta {
        op_id: OpId,
        canceled: bool,
        reply: MetaReply,
    },
    Chunk {
        op_id: OpId,
        canceled: bool,
        reply: ChunkReply,
    },
}

enum Command {
    Open {
        params: OpenParams,
        reply: oneshot::Sender<i32>,
    },
    Write {
        data: Bytes,
        offset: Offset,
        flush: bool,
        reply: oneshot::Sender<Offset>,
    },
    Flush {
        reply: oneshot::Sender<i32>,
    },
    Close {
        reply: oneshot::Sender<i32>,
    },
    SetWriteThreshold {
        threshold: Offset,
        reply: oneshot::Sender<i32>,
    },
    PendingSize {
        reply: oneshot::Sender<Offset>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable async API over a writer task.
#[derive(Clone)]
pub struct WriterHandle {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

pub struct WriterDriver {
    writer: FileWriter,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
    started: tokio::time::Instant,
}

impl WriterDriver {
    /// Wraps a writer; returns the driver (to be awaited on its own task),
    /// the command handle, and the sender transports deliver completions
    /// through.
    pub fn new(
        writer: FileWriter,
    ) -> (
        WriterDriver,
        WriterHandle,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let driver = WriterDriver {
            writer,
            commands: command_rx,
            events: event_rx,
            cancel: cancel.clone(),
            started: tokio::time::Instant::now(),
        };
        let handle = WriterHandle {
            commands: command_tx,
            cancel,
        };
        (driver, handle, event_tx)
    }

    pub async fn run(mut self) {
        loop {
            let now = self.now();
            let deadline = self.writer.next_wakeup().map(|wake| {
                self.started + Duration::from_secs(wake.max(now) as u64)
            });
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("writer driver cancelled");
                    break;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    let now = self.now();
                    self.handle_command(command, now);
                }
                Some(event) = self.events.recv() => {
                    let now = self.now();
                    self.handle_event(event, now);
                }
                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let now = self.now();
                    self.writer.on_timeout(now);
                }
            }
        }
    }

    fn now(&self) -> TimeSec {
        self.started.elapsed().as_secs() as TimeSec
    }

    fn handle_command(&mut self, command: Command, now: TimeSec) {
        match command {
            Command::Open { params, reply } => {
                let _ = reply.send(self.writer.open(params, now));
            }
            Command::Write {
                data,
                offset,
                flush,
                reply,
            } => {
                let length = data.len() as Offset;
                let mut buf = IoBuffer::from_bytes(data);
                let _ = reply.send(self.writer.write(&mut buf, length, offset, flush, None, now));
            }
            Command::Flush { reply } => {
                let _ = reply.send(self.writer.flush(now));
            }
            Command::Close { reply } => {
                let _ = reply.send(self.writer.close(now));
            }
            Command::SetWriteThreshold { threshold, reply } => {
                let _ = reply.send(self.writer.set_write_threshold(threshold, now));
            }
            Command::PendingSize { reply } => {
                let _ = reply.send(self.writer.get_pending_size());
            }
            Command::Stop { reply } => {
                self.writer.stop();
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.writer.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent, now: TimeSec) {
        match event {
            TransportEvent::Meta {
                op_id,
                canceled,
                reply,
            } => self.writer.meta_op_done(op_id, canceled, reply, now),
            TransportEvent::Chunk {
                op_id,
                canceled,
                reply,
            } => self.writer.chunk_op_done(op_id, canceled, reply, now),
        }
    }
}

impl WriterHandle {
    pub async fn open(&self, params: OpenParams) -> Result<()> {
        let code = self.request(|reply| Command::Open { params, reply }).await?;
        check(code)
    }

    /// Returns the number of bytes accepted into staging.
    pub async fn write(&self, data: Bytes, offset: Offset) -> Result<Offset> {
        self.write_with(data, offset, false).await
    }

    pub async fn write_with(&self, data: Bytes, offset: Offset, flush: bool) -> Result<Offset> {
        let accepted = self
            .request(|reply| Command::Write {
                data,
                offset,
                flush,
                reply,
            })
            .await?;
        if accepted < 0 {
            return Err(Error::from_code(accepted as i32));
        }
        Ok(accepted)
    }

    pub async fn flush(&self) -> Result<()> {
        let code = self.request(|reply| Command::Flush { reply }).await?;
        check(code)
    }

    /// Requests close; durability is reported through the writer completion.
    pub async fn close(&self) -> Result<()> {
        let code = self.request(|reply| Command::Close { reply }).await?;
        check(code)
    }

    pub async fn set_write_threshold(&self, threshold: Offset) -> Result<()> {
        let code = self
            .request(|reply| Command::SetWriteThreshold { threshold, reply })
            .await?;
        check(code)
    }

    pub async fn pending_size(&self) -> Result<Offset> {
        self.request(|reply| Command::PendingSize { reply }).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Stops the driver task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .ok()
            .ok_or_else(|| GoneSnafu.build())?;
        rx.await.ok().ok_or_else(|| GoneSnafu.build())
    }
}

fn check(code: i32) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(Error::from_code(code))
    }
}
