//! # Event Loop (Internal)
//!
//! The single cooperative loop that owns every socket, timer, and the
//! whole [`DaemonState`]. It multiplexes:
//!
//! - the SD socket (multicast membership + unicast SD replies),
//! - tagged UDP datagrams from per-instance reader tasks,
//! - TCP frames and connection-state changes,
//! - IPC connection lifecycle and envelopes,
//! - the cyclic offer deadline (its own sleep, so offer cadence never
//!   waits for the coarse tick),
//! - the coarse expiry tick driving every TTL and deadline,
//! - the shutdown signal.
//!
//! Handlers return [`Action`] values; [`execute_action`] is the only
//! place that performs I/O. Registration envelopes are handled here
//! rather than in the dispatcher because they bind sockets.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::correlator;
use super::dispatch;
use super::sd::{self, Action};
use super::state::{
    ClientKey, DaemonState, LocalClient, LocalServer, NetEvent, OfferState, ServerKey,
    SubscribeState, TcpTag,
};
use crate::error::Result;
use crate::ipc::{proto, ConnId, Envelope, IpcBody, IpcEvent};
use crate::tcp::{TcpEvent, TcpPool, TcpServer};
use crate::wire::SdMessage;
use crate::{ServiceSchema, Transport};

/// Granularity of the unified expiry tick. Remote-offer expiry must be
/// observed within one tick of the TTL elapsing.
const EXPIRY_TICK: Duration = Duration::from_millis(50);

/// The main daemon task.
pub async fn run(
    sd_socket: Arc<UdpSocket>,
    mut state: DaemonState,
    net_tx: mpsc::Sender<NetEvent>,
    mut net_rx: mpsc::Receiver<NetEvent>,
    tcp_tx: mpsc::Sender<TcpEvent<TcpTag>>,
    mut tcp_rx: mpsc::Receiver<TcpEvent<TcpTag>>,
    mut ipc_rx: mpsc::Receiver<IpcEvent>,
    pool: TcpPool<TcpTag>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let mut sd_buf = [0u8; 65535];
    let mut tick = tokio::time::interval(EXPIRY_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // Incoming SD traffic (multicast offers, unicast handshakes)
            result = sd_socket.recv_from(&mut sd_buf) => {
                match result {
                    Ok((len, from)) => {
                        let actions = sd::handle_sd_datagram(&sd_buf[..len], from, &mut state);
                        execute_all(&sd_socket, &mut state, &pool, actions).await;
                    }
                    Err(e) => {
                        tracing::error!("Error receiving SD datagram: {}", e);
                    }
                }
            }

            // Tagged datagrams from per-instance UDP sockets
            Some(event) = net_rx.recv() => {
                let actions = match event {
                    NetEvent::ServerDatagram { key, data, from } => {
                        dispatch::handle_server_message(&mut state, key, data, from)
                    }
                    NetEvent::ClientDatagram { key, data, from } => {
                        dispatch::handle_client_message(&mut state, Some(key), data, from)
                    }
                };
                execute_all(&sd_socket, &mut state, &pool, actions).await;
            }

            // TCP frames and connection-state changes
            Some(event) = tcp_rx.recv() => {
                let actions = dispatch::handle_tcp_event(&mut state, event);
                execute_all(&sd_socket, &mut state, &pool, actions).await;
            }

            // IPC connection lifecycle and envelopes
            Some(event) = ipc_rx.recv() => {
                match event {
                    IpcEvent::Connected { conn, sender } => {
                        state.ipc_conns.insert(conn, sender);
                    }
                    IpcEvent::Message { conn, envelope } => {
                        let actions = handle_ipc_envelope(
                            &mut state, conn, envelope, &net_tx, &tcp_tx,
                        ).await;
                        execute_all(&sd_socket, &mut state, &pool, actions).await;
                    }
                    IpcEvent::Disconnected { conn } => {
                        let actions = dispatch::handle_ipc_disconnect(&mut state, conn);
                        execute_all(&sd_socket, &mut state, &pool, actions).await;
                    }
                }
            }

            // Cyclic offer emission at its precise deadline
            () = async {
                match sd::next_offer_deadline(&state) {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                let actions = sd::emit_cyclic_offers(&mut state, Instant::now());
                execute_all(&sd_socket, &mut state, &pool, actions).await;
            }

            // Unified expiry tick: TTLs, deadlines, subscribe timers
            _ = tick.tick() => {
                let actions = sd::handle_expiry_tick(&mut state, Instant::now());
                execute_all(&sd_socket, &mut state, &pool, actions).await;
            }

            // Graceful shutdown
            () = shutdown.notified() => {
                tracing::info!("Daemon shutting down");
                let offering: Vec<ServerKey> = state
                    .local_servers
                    .iter()
                    .filter(|(_, server)| server.state == OfferState::Offering)
                    .map(|(key, _)| *key)
                    .collect();
                for key in offering {
                    let actions = sd::stop_offer(&mut state, key);
                    execute_all(&sd_socket, &mut state, &pool, actions).await;
                }
                break;
            }
        }
    }

    tracing::info!("Daemon stopped");
    Ok(())
}

// ============================================================================
// ACTION EXECUTION
// ============================================================================

async fn execute_all(
    sd_socket: &UdpSocket,
    state: &mut DaemonState,
    pool: &TcpPool<TcpTag>,
    actions: Vec<Action>,
) {
    for action in actions {
        execute_action(sd_socket, state, pool, action).await;
    }
}

/// Execute one action. The only place in the daemon that touches
/// sockets on the send path.
async fn execute_action(
    sd_socket: &UdpSocket,
    state: &mut DaemonState,
    pool: &TcpPool<TcpTag>,
    action: Action,
) {
    match action {
        Action::SendSd { message, target } => {
            send_sd(sd_socket, state, message, target).await;
        }

        Action::SendSubscribe {
            client_key,
            eventgroup_id,
        } => {
            send_subscribe(sd_socket, state, pool, client_key, eventgroup_id).await;
        }

        Action::SendServerMessage { key, data, target } => {
            let Some(server) = state.local_servers.get(&key) else {
                return;
            };
            match key.transport {
                Transport::Udp => {
                    if let Some(socket) = &server.udp_socket {
                        if let Err(e) = socket.send_to(&data, target).await {
                            tracing::warn!("UDP send to {} failed: {}", target, e);
                        }
                    }
                }
                Transport::Tcp => {
                    if let Some(tcp_server) = &server.tcp_server {
                        if let Err(e) = tcp_server.send_to(target, data).await {
                            tracing::debug!("TCP send to {} failed: {}", target, e);
                        }
                    }
                }
            }
        }

        Action::SendClientMessage {
            key,
            data,
            target,
            transport,
            failure_key,
        } => {
            let result = match transport {
                Transport::Udp => match state.local_clients.get(&key) {
                    Some(client) => client
                        .udp_socket
                        .send_to(&data, target)
                        .await
                        .map(|_| ())
                        .map_err(crate::Error::Io),
                    None => return,
                },
                Transport::Tcp => pool.send(target, data).await,
            };

            if let Err(e) = result {
                tracing::debug!("Client send to {} failed: {}", target, e);
                if let Some(call_key) = failure_key {
                    let actions = correlator::fail_call(
                        state,
                        call_key,
                        proto::IPC_ERR_NOT_CONNECTED,
                        "transport to peer is down",
                    );
                    for action in actions {
                        if let Action::SendIpc { conn, envelope } = action {
                            send_ipc(state, conn, envelope);
                        }
                    }
                }
            }
        }

        Action::SendIpc { conn, envelope } => {
            send_ipc(state, conn, envelope);
        }

        Action::ClosePoolPeer { peer } => {
            pool.close(peer);
        }
    }
}

/// Assign a session id from the right counter and put the message on
/// the wire.
async fn send_sd(
    sd_socket: &UdpSocket,
    state: &mut DaemonState,
    message: SdMessage,
    target: SocketAddr,
) {
    let unicast = message.flags & SdMessage::FLAG_UNICAST != 0;
    let (session_id, _) = if unicast {
        state.ucast_session.next()
    } else {
        state.mcast_session.next()
    };
    let data = message.serialize(session_id);
    if let Err(e) = sd_socket.send_to(&data, target).await {
        tracing::warn!("SD send to {} failed: {}", target, e);
    }
}

fn send_ipc(state: &mut DaemonState, conn: ConnId, envelope: Envelope) {
    let Some(sender) = state.ipc_conns.get(&conn) else {
        return;
    };
    // A slow application must not stall the loop; its queue overflowing
    // drops the envelope.
    if sender.try_send(envelope.encode_frame()).is_err() {
        tracing::warn!("IPC queue of client {} full; dropping envelope", conn);
    }
}

/// Resolve and send one SubscribeEventgroup. For TCP eventgroups the
/// pool connection is established first so the endpoint option carries
/// the address the server will see.
async fn send_subscribe(
    sd_socket: &UdpSocket,
    state: &mut DaemonState,
    pool: &TcpPool<TcpTag>,
    client_key: ClientKey,
    eventgroup_id: u16,
) {
    let now = Instant::now();

    let Some(offer) = state.remote_offers.get(&client_key) else {
        if let Some(client) = state.local_clients.get_mut(&client_key) {
            if let Some(sub) = client.subscriptions.get_mut(&eventgroup_id) {
                sub.state = SubscribeState::PendingOffer { retry_at: None };
            }
        }
        return;
    };
    let udp_endpoint = offer.udp_endpoint;
    let tcp_endpoint = offer.tcp_endpoint;
    let sd_target = offer.sd_source;

    let subscribe_timeout = Duration::from_millis(state.config.subscribe_retry_timeout_ms);

    let Some(client) = state.local_clients.get_mut(&client_key) else {
        return;
    };
    let major_version = client.schema.major_version;
    let client_endpoint = client.endpoint;
    let Some(sub) = client.subscriptions.get_mut(&eventgroup_id) else {
        return;
    };

    let (endpoint, transport) = if udp_endpoint.is_some() {
        (SocketAddr::V4(client_endpoint), Transport::Udp)
    } else if let Some(remote_tcp) = tcp_endpoint {
        match pool.ensure_connected(remote_tcp).await {
            Ok(local) => {
                sub.tcp_local = Some(local);
                (local, Transport::Tcp)
            }
            Err(e) => {
                sub.failures = sub.failures.saturating_add(1);
                let backoff = sd::subscribe_backoff(sub.failures);
                sub.state = SubscribeState::PendingOffer {
                    retry_at: Some(now + backoff),
                };
                tracing::debug!(
                    "TCP connect for subscription EG {:04x} failed ({}); retrying in {:?}",
                    eventgroup_id,
                    e,
                    backoff
                );
                return;
            }
        }
    } else {
        sub.state = SubscribeState::PendingOffer { retry_at: None };
        return;
    };

    sub.state = SubscribeState::Subscribing {
        deadline: now + subscribe_timeout,
    };
    let ttl = sub.ttl;

    let message = sd::build_subscribe_message(
        client_key.service_id,
        client_key.instance_id,
        major_version,
        eventgroup_id,
        ttl,
        endpoint,
        transport,
        state.sd_flags(true),
    );

    tracing::debug!(
        "Subscribing EG {:04x} of {:04x}:{:04x} via {:?}, endpoint {}",
        eventgroup_id,
        client_key.service_id,
        client_key.instance_id,
        transport,
        endpoint
    );

    send_sd(sd_socket, state, message, sd_target).await;
}

// ============================================================================
// REGISTRATION (socket-binding IPC requests)
// ============================================================================

async fn handle_ipc_envelope(
    state: &mut DaemonState,
    conn: ConnId,
    envelope: Envelope,
    net_tx: &mpsc::Sender<NetEvent>,
    tcp_tx: &mpsc::Sender<TcpEvent<TcpTag>>,
) -> Vec<Action> {
    match envelope.body {
        IpcBody::RegisterServer {
            schema,
            instance_id,
            endpoint,
            transport,
            ttl,
            cyclic_offer_delay_ms,
        } => {
            register_server(
                state,
                conn,
                envelope.correlation_id,
                schema,
                instance_id,
                endpoint,
                transport,
                ttl,
                cyclic_offer_delay_ms,
                net_tx,
                tcp_tx,
            )
            .await
        }
        IpcBody::RegisterClient {
            schema,
            instance_id,
            endpoint,
        } => {
            register_client(
                state,
                conn,
                envelope.correlation_id,
                schema,
                instance_id,
                endpoint,
                net_tx,
            )
            .await
        }
        _ => dispatch::handle_ipc_message(state, conn, envelope),
    }
}

#[allow(clippy::too_many_arguments)]
async fn register_server(
    state: &mut DaemonState,
    conn: ConnId,
    correlation_id: u32,
    schema: ServiceSchema,
    instance_id: u16,
    endpoint: SocketAddrV4,
    transport: Transport,
    ttl: u32,
    cyclic_offer_delay_ms: u32,
    net_tx: &mpsc::Sender<NetEvent>,
    tcp_tx: &mpsc::Sender<TcpEvent<TcpTag>>,
) -> Vec<Action> {
    let key = ServerKey {
        service_id: schema.service_id,
        instance_id,
        transport,
    };
    if state.local_servers.contains_key(&key) {
        return vec![ipc_error(
            conn,
            correlation_id,
            proto::IPC_ERR_ALREADY_OFFERED,
            "instance already registered for this transport",
        )];
    }

    let mut udp_socket = None;
    let mut tcp_server = None;
    let mut reader = None;

    match transport {
        Transport::Udp => match UdpSocket::bind(endpoint).await {
            Ok(socket) => {
                let socket = Arc::new(socket);
                reader = Some(spawn_udp_reader(
                    Arc::clone(&socket),
                    net_tx.clone(),
                    move |data, from| NetEvent::ServerDatagram { key, data, from },
                ));
                udp_socket = Some(socket);
            }
            Err(e) => {
                tracing::error!("Cannot bind UDP endpoint {}: {}", endpoint, e);
                return vec![ipc_error(
                    conn,
                    correlation_id,
                    proto::IPC_ERR_TRANSPORT,
                    "cannot bind instance endpoint",
                )];
            }
        },
        Transport::Tcp => {
            match TcpServer::bind(SocketAddr::V4(endpoint), TcpTag::Server(key), tcp_tx.clone())
                .await
            {
                Ok(server) => tcp_server = Some(server),
                Err(e) => {
                    tracing::error!("Cannot bind TCP endpoint {}: {}", endpoint, e);
                    return vec![ipc_error(
                        conn,
                        correlation_id,
                        proto::IPC_ERR_TRANSPORT,
                        "cannot bind instance endpoint",
                    )];
                }
            }
        }
    }

    let handle = state.next_handle();
    let server = LocalServer {
        handle,
        owner: conn,
        schema,
        instance_id,
        endpoint,
        transport,
        ttl,
        cyclic_offer_delay: Duration::from_millis(u64::from(cyclic_offer_delay_ms)),
        state: OfferState::Down,
        next_offer_at: None,
        notification_session: 1,
        udp_socket,
        tcp_server,
        reader,
    };

    match state.insert_server(server) {
        Ok(()) => {
            tracing::info!(
                "Registered server {:04x}:{:04x} on {} ({:?}) for IPC client {}",
                key.service_id,
                key.instance_id,
                endpoint,
                transport,
                conn
            );
            vec![Action::SendIpc {
                conn,
                envelope: Envelope::new(correlation_id, IpcBody::Ack { handle }),
            }]
        }
        Err(_) => vec![ipc_error(
            conn,
            correlation_id,
            proto::IPC_ERR_ALREADY_OFFERED,
            "instance already registered for this transport",
        )],
    }
}

async fn register_client(
    state: &mut DaemonState,
    conn: ConnId,
    correlation_id: u32,
    schema: ServiceSchema,
    instance_id: u16,
    endpoint: SocketAddrV4,
    net_tx: &mpsc::Sender<NetEvent>,
) -> Vec<Action> {
    let key = ClientKey {
        service_id: schema.service_id,
        instance_id,
    };
    if state.local_clients.contains_key(&key) {
        return vec![ipc_error(
            conn,
            correlation_id,
            proto::IPC_ERR_ALREADY_OFFERED,
            "client already registered for this instance",
        )];
    }

    let socket = match UdpSocket::bind(endpoint).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            tracing::error!("Cannot bind client endpoint {}: {}", endpoint, e);
            return vec![ipc_error(
                conn,
                correlation_id,
                proto::IPC_ERR_TRANSPORT,
                "cannot bind client endpoint",
            )];
        }
    };

    let reader = spawn_udp_reader(Arc::clone(&socket), net_tx.clone(), move |data, from| {
        NetEvent::ClientDatagram { key, data, from }
    });

    let handle = state.next_handle();
    let client_id = state.next_client_id();
    let client = LocalClient {
        handle,
        owner: conn,
        schema,
        instance_id,
        endpoint,
        client_id,
        next_session: 1,
        subscriptions: std::collections::HashMap::new(),
        udp_socket: socket,
        reader,
    };

    match state.insert_client(client) {
        Ok(()) => {
            tracing::info!(
                "Registered client {:04x}:{:04x} on {} (client id {:04x}) for IPC client {}",
                key.service_id,
                key.instance_id,
                endpoint,
                client_id,
                conn
            );
            vec![Action::SendIpc {
                conn,
                envelope: Envelope::new(correlation_id, IpcBody::Ack { handle }),
            }]
        }
        Err(_) => vec![ipc_error(
            conn,
            correlation_id,
            proto::IPC_ERR_ALREADY_OFFERED,
            "client already registered for this instance",
        )],
    }
}

/// Spawn the reader task of one UDP data socket. Each datagram is
/// copied once into a `Bytes` and tagged for the loop.
fn spawn_udp_reader(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<NetEvent>,
    tag: impl Fn(Bytes, SocketAddr) -> NetEvent + Send + 'static,
) -> tokio::task::AbortHandle {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    if tx.send(tag(data, from)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("UDP receive failed: {}", e);
                }
            }
        }
    })
    .abort_handle()
}

fn ipc_error(conn: ConnId, correlation_id: u32, code: u8, message: &str) -> Action {
    Action::SendIpc {
        conn,
        envelope: Envelope::new(
            correlation_id,
            IpcBody::Error {
                code,
                message: message.to_string(),
            },
        ),
    }
}
