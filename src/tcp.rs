//! # TCP Connection Management
//!
//! TCP transport for SOME/IP RPC and events: a passive listener per TCP
//! service instance and an on-demand connector pool for client traffic.
//!
//! ## Message Framing
//!
//! TCP has no message boundaries. SOME/IP frames are delimited by the
//! length field in the header: read the 8-byte prefix, extract the 32-bit
//! length, then read exactly `length + 8` bytes total. A framing error
//! (length below the header minimum or above [`MAX_FRAME_BYTES`])
//! terminates the connection; the event loop then drops any subscriptions
//! bound to that peer.
//!
//! ## Connection Pool
//!
//! The [`TcpPool`] keeps one outgoing connection per remote endpoint,
//! opened on first use. A failed endpoint enters capped exponential
//! backoff; while the backoff holds, sends fail fast with
//! [`Error::NotConnected`](crate::Error::NotConnected) so method calls
//! surface "service temporarily unavailable" instead of stalling.
//!
//! All reader tasks forward raw frames to the daemon's event loop over a
//! channel; they never touch daemon state.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::Error;
use crate::wire::parse_someip_length;

/// Upper bound for one framed SOME/IP message (header + payload).
pub const MAX_FRAME_BYTES: usize = 1 << 24;

/// Initial reconnect backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Time allowed for one connection attempt before it counts as failed.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Event emitted by TCP reader tasks toward the event loop.
#[derive(Debug)]
pub enum TcpEvent<T> {
    /// One complete SOME/IP frame (header + payload) arrived.
    Frame {
        tag: T,
        data: Bytes,
        from: SocketAddr,
    },
    /// The connection to `peer` closed (EOF, I/O error, or framing error).
    PeerClosed { tag: T, peer: SocketAddr },
}

// ============================================================================
// FRAMING
// ============================================================================

/// Read one framed SOME/IP message.
///
/// Returns `Ok(None)` on a clean EOF between messages; any other shortfall
/// or an implausible length field is an error that must close the
/// connection.
async fn read_frame(stream: &mut OwnedReadHalf) -> io::Result<Option<Bytes>> {
    let mut prefix = [0u8; 8];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let length = parse_someip_length(&prefix)
        .expect("prefix is 8 bytes") as usize;
    if length < 8 || length + 8 > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("implausible SOME/IP length field {}", length),
        ));
    }

    let total = length + 8;
    let mut frame = BytesMut::with_capacity(total);
    frame.extend_from_slice(&prefix);
    frame.resize(total, 0);
    stream.read_exact(&mut frame[8..]).await?;

    Ok(Some(frame.freeze()))
}

/// Drive one established connection: frames out of the read half, queued
/// bytes into the write half. Exits on EOF, I/O error, or framing error,
/// then reports `PeerClosed`.
async fn run_connection<T: Clone + Send + 'static>(
    stream: TcpStream,
    tag: T,
    peer: SocketAddr,
    events: mpsc::Sender<TcpEvent<T>>,
    mut outgoing: mpsc::Receiver<Bytes>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    loop {
        tokio::select! {
            frame = read_frame(&mut read_half) => {
                match frame {
                    Ok(Some(data)) => {
                        if events
                            .send(TcpEvent::Frame { tag: tag.clone(), data, from: peer })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("TCP peer {} closed the connection", peer);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("TCP framing error from {}: {}", peer, e);
                        break;
                    }
                }
            }
            data = outgoing.recv() => {
                match data {
                    Some(data) => {
                        if let Err(e) = write_half.write_all(&data).await {
                            tracing::warn!("TCP write to {} failed: {}", peer, e);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = events.send(TcpEvent::PeerClosed { tag, peer }).await;
}

// ============================================================================
// SERVER SIDE
// ============================================================================

/// Passive TCP endpoint of one offered service instance.
///
/// Accepts connections, spawns a connection task per peer, and keeps a
/// per-peer sender so responses and event notifications can be written
/// back on the connection the peer opened.
pub struct TcpServer {
    local_addr: SocketAddr,
    conns: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    accept_task: tokio::task::AbortHandle,
}

impl TcpServer {
    /// Bind the listener and start accepting.
    pub async fn bind<T: Clone + Send + 'static>(
        addr: SocketAddr,
        tag: T,
        events: mpsc::Sender<TcpEvent<T>>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let conns: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());

        let accept_conns = Arc::clone(&conns);
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("TCP accept failed on {}: {}", local_addr, e);
                        continue;
                    }
                };
                tracing::debug!("Accepted TCP connection from {} on {}", peer, local_addr);

                let (send_tx, send_rx) = mpsc::channel::<Bytes>(32);
                accept_conns.insert(peer, send_tx);

                let conn_events = events.clone();
                let conn_tag = tag.clone();
                let conn_map = Arc::clone(&accept_conns);
                tokio::spawn(async move {
                    run_connection(stream, conn_tag, peer, conn_events, send_rx).await;
                    conn_map.remove(&peer);
                });
            }
        })
        .abort_handle();

        Ok(Self {
            local_addr,
            conns,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one framed message to a connected peer.
    ///
    /// Fails with `NotConnected` when the peer never connected or its
    /// connection is gone.
    pub async fn send_to(&self, peer: SocketAddr, data: Bytes) -> Result<(), Error> {
        let sender = self
            .conns
            .get(&peer)
            .map(|entry| entry.value().clone())
            .ok_or(Error::NotConnected)?;
        sender.send(data).await.map_err(|_| Error::NotConnected)
    }

    /// Check whether a peer currently holds a connection.
    pub fn is_connected(&self, peer: SocketAddr) -> bool {
        self.conns.contains_key(&peer)
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.conns.clear();
    }
}

// ============================================================================
// CLIENT SIDE
// ============================================================================

struct PoolConnection {
    sender: mpsc::Sender<Bytes>,
    local_addr: SocketAddr,
    task: tokio::task::AbortHandle,
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    retry_at: Instant,
}

/// Outgoing TCP connection pool, one connection per remote endpoint.
///
/// Connections open on first use. The reader half of every connection
/// forwards frames to the event loop tagged with the pool's tag value.
pub struct TcpPool<T: Clone + Send + 'static> {
    tag: T,
    events: mpsc::Sender<TcpEvent<T>>,
    conns: Arc<DashMap<SocketAddr, PoolConnection>>,
    backoff: DashMap<SocketAddr, Backoff>,
}

impl<T: Clone + Send + 'static> TcpPool<T> {
    pub fn new(tag: T, events: mpsc::Sender<TcpEvent<T>>) -> Self {
        Self {
            tag,
            events,
            conns: Arc::new(DashMap::new()),
            backoff: DashMap::new(),
        }
    }

    /// Ensure a connection to `peer` exists and return our local address
    /// on it.
    ///
    /// TCP subscribers must connect before subscribing so the server can
    /// deliver events on the connection; the local address returned here
    /// is what the Subscribe entry advertises as its endpoint option.
    pub async fn ensure_connected(&self, peer: SocketAddr) -> Result<SocketAddr, Error> {
        if let Some(conn) = self.conns.get(&peer) {
            return Ok(conn.local_addr);
        }
        self.connect(peer).await
    }

    /// Send one framed message to `peer`, connecting on demand.
    ///
    /// While the peer's backoff window holds, fails fast with
    /// `NotConnected`.
    pub async fn send(&self, peer: SocketAddr, data: Bytes) -> Result<(), Error> {
        if let Some(conn) = self.conns.get(&peer) {
            let sender = conn.sender.clone();
            drop(conn);
            if sender.send(data).await.is_ok() {
                return Ok(());
            }
            // Connection task died under us; drop the entry and report.
            self.conns.remove(&peer);
            self.note_failure(peer);
            return Err(Error::NotConnected);
        }

        self.connect(peer).await?;
        let sender = self
            .conns
            .get(&peer)
            .map(|conn| conn.sender.clone())
            .ok_or(Error::NotConnected)?;
        sender.send(data).await.map_err(|_| Error::NotConnected)
    }

    /// Drop the connection to `peer`, if any.
    pub fn close(&self, peer: SocketAddr) {
        if let Some((_, conn)) = self.conns.remove(&peer) {
            conn.task.abort();
        }
    }

    async fn connect(&self, peer: SocketAddr) -> Result<SocketAddr, Error> {
        if let Some(backoff) = self.backoff.get(&peer) {
            if Instant::now() < backoff.retry_at {
                return Err(Error::NotConnected);
            }
        }

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!("TCP connect to {} failed: {}", peer, e);
                self.note_failure(peer);
                return Err(Error::NotConnected);
            }
            Err(_) => {
                tracing::debug!("TCP connect to {} timed out", peer);
                self.note_failure(peer);
                return Err(Error::NotConnected);
            }
        };

        let local_addr = stream.local_addr()?;
        self.backoff.remove(&peer);

        let (send_tx, send_rx) = mpsc::channel::<Bytes>(32);
        let conn_events = self.events.clone();
        let conn_tag = self.tag.clone();
        let conn_map = Arc::clone(&self.conns);
        let task = tokio::spawn(async move {
            run_connection(stream, conn_tag, peer, conn_events, send_rx).await;
            conn_map.remove(&peer);
        })
        .abort_handle();

        self.conns.insert(
            peer,
            PoolConnection {
                sender: send_tx,
                local_addr,
                task,
            },
        );

        tracing::debug!("Established TCP connection to {} from {}", peer, local_addr);
        Ok(local_addr)
    }

    fn note_failure(&self, peer: SocketAddr) {
        let mut entry = self.backoff.entry(peer).or_insert(Backoff {
            failures: 0,
            retry_at: Instant::now(),
        });
        entry.failures = entry.failures.saturating_add(1);
        let delay = BACKOFF_BASE
            .saturating_mul(1u32 << entry.failures.min(8))
            .min(BACKOFF_CAP);
        entry.retry_at = Instant::now() + delay;
        tracing::debug!(
            "Backing off TCP connects to {} for {:?} ({} failures)",
            peer,
            delay,
            entry.failures
        );
    }
}
