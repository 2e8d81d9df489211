//! # IPC Server
//!
//! Accepts local application connections on a Unix-domain stream socket
//! and turns them into events for the daemon's loop.
//!
//! Each connection gets a reader task (frames → decoded envelopes →
//! [`IpcEvent::Message`]) and a writer task (queued frames → socket).
//! Neither touches daemon state; connection lifecycle is reported through
//! [`IpcEvent::Connected`] / [`IpcEvent::Disconnected`] so the event loop
//! can run its disconnect semantics: stop-offer every owned server
//! instance, tear down every owned subscription, cancel pending calls.

use std::io;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{unix::OwnedReadHalf, UnixListener, UnixStream};
use tokio::sync::mpsc;

use super::proto::{Envelope, IpcDecodeError};

/// Upper bound for one IPC frame (envelope without the length prefix).
pub const MAX_IPC_FRAME_BYTES: usize = 1 << 22;

/// Identifies one application connection for its lifetime.
pub type ConnId = u64;

/// Connection lifecycle and traffic events toward the event loop.
#[derive(Debug)]
pub enum IpcEvent {
    /// A new application connected; `sender` queues outbound frames.
    Connected {
        conn: ConnId,
        sender: mpsc::Sender<Bytes>,
    },
    /// A decoded envelope arrived from the application.
    Message { conn: ConnId, envelope: Envelope },
    /// The connection is gone (EOF, I/O error, or protocol violation).
    Disconnected { conn: ConnId },
}

/// The Unix-domain socket server.
pub struct IpcServer {
    path: PathBuf,
    accept_task: tokio::task::AbortHandle,
}

impl IpcServer {
    /// Bind the socket (replacing a stale file) and start accepting.
    pub fn bind(path: &Path, events: mpsc::Sender<IpcEvent>) -> io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        tracing::info!("IPC server listening on {}", path.display());

        let accept_task = tokio::spawn(async move {
            let mut next_conn: ConnId = 1;
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!("IPC accept failed: {}", e);
                        continue;
                    }
                };
                let conn = next_conn;
                next_conn += 1;
                handle_connection(stream, conn, events.clone());
            }
        })
        .abort_handle();

        Ok(Self {
            path: path.to_path_buf(),
            accept_task,
        })
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Spawn the reader and writer tasks for one accepted connection.
fn handle_connection(stream: UnixStream, conn: ConnId, events: mpsc::Sender<IpcEvent>) {
    tracing::info!("IPC client {} connected", conn);
    let (read_half, mut write_half) = stream.into_split();

    let (send_tx, mut send_rx) = mpsc::channel::<Bytes>(64);

    // Writer: drain the queue until the loop drops the sender or the
    // socket fails.
    tokio::spawn(async move {
        while let Some(frame) = send_rx.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                tracing::debug!("IPC write to client {} failed: {}", conn, e);
                break;
            }
        }
    });

    tokio::spawn(async move {
        if events
            .send(IpcEvent::Connected {
                conn,
                sender: send_tx,
            })
            .await
            .is_err()
        {
            return;
        }

        let mut read_half = read_half;
        loop {
            match read_envelope(&mut read_half).await {
                Ok(Some(envelope)) => {
                    if events
                        .send(IpcEvent::Message { conn, envelope })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::info!("IPC client {} disconnected", conn);
                    break;
                }
                Err(ReadError::Decode(e)) => {
                    // Protocol violation: drop the connection.
                    tracing::warn!("IPC client {} sent bad envelope: {}", conn, e);
                    break;
                }
                Err(ReadError::Io(e)) => {
                    tracing::debug!("IPC read from client {} failed: {}", conn, e);
                    break;
                }
            }
        }

        let _ = events.send(IpcEvent::Disconnected { conn }).await;
    });
}

enum ReadError {
    Io(io::Error),
    Decode(IpcDecodeError),
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}

/// Read one length-prefixed envelope. `Ok(None)` on clean EOF.
async fn read_envelope(read_half: &mut OwnedReadHalf) -> Result<Option<Envelope>, ReadError> {
    let mut prefix = [0u8; 4];
    match read_half.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 || len > MAX_IPC_FRAME_BYTES {
        return Err(ReadError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("implausible IPC frame length {}", len),
        )));
    }

    let mut frame = BytesMut::with_capacity(len);
    frame.resize(len, 0);
    read_half.read_exact(&mut frame).await?;

    let mut cursor = frame.freeze();
    let envelope = Envelope::decode(&mut cursor).map_err(ReadError::Decode)?;
    Ok(Some(envelope))
}
