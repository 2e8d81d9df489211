//! # Daemon Core
//!
//! The protocol engine behind the IPC surface. One [`Daemon`] per host
//! owns the SD multicast socket, every service endpoint socket, and all
//! SOME/IP wire state; applications stay thin and carry none of it.
//!
//! ## Module Structure
//!
//! - [`state`]: `DaemonState`, the registry directories, and key types
//! - [`sd`]: Service Discovery handlers, builders, offer packing, TTL tick
//! - [`dispatch`]: data-plane routing and the synchronous IPC handlers
//! - [`correlator`]: session id allocation and pending-call correlation
//! - [`event_loop`]: the single select loop and action executor

pub mod correlator;
pub mod dispatch;
pub mod event_loop;
pub mod sd;
pub mod state;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};

use crate::config::Config;
use crate::error::Result;
use crate::ipc::{IpcEvent, IpcServer};
use crate::tcp::{TcpEvent, TcpPool};
use state::{DaemonState, NetEvent, TcpTag};

/// Capacity of the channels feeding the event loop.
const CHANNEL_CAPACITY: usize = 256;

/// The daemon: all state is rooted here and owned by `main`.
///
/// [`Daemon::new`] binds the SD socket (fatal on failure) and the IPC
/// listener; [`Daemon::run`] drives the event loop until a
/// [`ShutdownHandle`] fires, emitting Stop-Offer entries for every
/// Offering instance on the way out.
pub struct Daemon {
    sd_socket: Arc<UdpSocket>,
    state: DaemonState,
    _ipc_server: IpcServer,
    ipc_rx: mpsc::Receiver<IpcEvent>,
    net_tx: mpsc::Sender<NetEvent>,
    net_rx: mpsc::Receiver<NetEvent>,
    tcp_tx: mpsc::Sender<TcpEvent<TcpTag>>,
    tcp_rx: mpsc::Receiver<TcpEvent<TcpTag>>,
    pool: TcpPool<TcpTag>,
    shutdown: Arc<Notify>,
}

impl Daemon {
    /// Bind the SD socket, join the multicast group, and start the IPC
    /// server. Failures here are startup-fatal.
    pub async fn new(config: Config) -> Result<Self> {
        let sd_socket =
            UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.sd_port))).await?;
        // A failed group join degrades discovery to unicast SD; the
        // daemon itself stays functional, so this is not startup-fatal.
        match sd_socket.join_multicast_v4(config.sd_address, config.interface) {
            Ok(()) => {
                let _ = sd_socket.set_multicast_loop_v4(true);
                tracing::info!(
                    "SD socket bound on port {}, joined {} on {}",
                    config.sd_port,
                    config.sd_address,
                    config.interface
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Cannot join SD multicast group {} on {}: {}; multicast reception disabled",
                    config.sd_address,
                    config.interface,
                    e
                );
            }
        }

        let (ipc_tx, ipc_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let ipc_server = IpcServer::bind(&config.uds_path, ipc_tx)?;

        let (net_tx, net_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (tcp_tx, tcp_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pool = TcpPool::new(TcpTag::ClientPool, tcp_tx.clone());

        Ok(Self {
            sd_socket: Arc::new(sd_socket),
            state: DaemonState::new(config),
            _ipc_server: ipc_server,
            ipc_rx,
            net_tx,
            net_rx,
            tcp_tx,
            tcp_rx,
            pool,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// A handle that stops the daemon from another task or a signal
    /// handler.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Drive the event loop until shutdown.
    pub async fn run(self) -> Result<()> {
        event_loop::run(
            self.sd_socket,
            self.state,
            self.net_tx,
            self.net_rx,
            self.tcp_tx,
            self.tcp_rx,
            self.ipc_rx,
            self.pool,
            self.shutdown,
        )
        .await
    }
}

/// Triggers a clean daemon shutdown; cheap to clone around.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Notify>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.notify_one();
    }
}
