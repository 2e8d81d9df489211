//! # Dispatcher (Internal)
//!
//! Routes decoded SOME/IP data-plane messages to the right local
//! application and handles the synchronous half of the IPC control
//! protocol (everything except the register calls, which bind sockets
//! and therefore live in the event loop).
//!
//! Routing is driven by which socket a message arrived on: server
//! sockets only legitimately carry requests, client sockets only
//! responses and notifications. Anything else is a protocol violation
//! that is counted and dropped, never answered.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::time::Instant;

use super::correlator;
use super::sd::{self, Action};
use super::state::{
    ClientKey, ClientSubscription, DaemonState, PendingReply, ServerKey, SubscribeState,
    SubscriptionKey, TcpTag,
};
use crate::ipc::{proto, ConnId, Envelope, IpcBody};
use crate::tcp::TcpEvent;
use crate::wire::{Header, Message, MessageType, PROTOCOL_VERSION};
use crate::{ReturnCode, Transport};

/// Datagrams larger than this are worth a warning; they are still
/// processed (fragmentation is the sender's problem).
const UDP_WARN_SIZE: usize = 1400;

// ============================================================================
// NETWORK INPUT
// ============================================================================

/// Handle data that arrived on a server instance's socket. A UDP
/// datagram may carry several messages back to back.
pub fn handle_server_message(
    state: &mut DaemonState,
    key: ServerKey,
    data: Bytes,
    from: SocketAddr,
) -> Vec<Action> {
    if data.len() > UDP_WARN_SIZE && key.transport == Transport::Udp {
        tracing::warn!(
            "Datagram of {} bytes from {} exceeds the usual UDP payload limit",
            data.len(),
            from
        );
    }

    let mut actions = Vec::new();
    let mut cursor = data;
    while cursor.remaining() >= Header::SIZE {
        match Message::parse(&mut cursor) {
            Ok(message) => {
                handle_server_messages_one(state, key, message, from, &mut actions);
            }
            Err(e) => {
                state.counters.decode_errors += 1;
                tracing::debug!("Undecodable message from {}: {}", from, e);
                break;
            }
        }
    }
    actions
}

fn handle_server_messages_one(
    state: &mut DaemonState,
    key: ServerKey,
    message: Message,
    from: SocketAddr,
    actions: &mut Vec<Action>,
) {
    let header = &message.header;
    match header.message_type {
        MessageType::Request | MessageType::RequestNoReturn => {
            forward_request(state, key, message, from, actions);
        }
        MessageType::Response | MessageType::Error | MessageType::Notification => {
            state.counters.protocol_violations += 1;
            tracing::debug!(
                "{:?} from {} on server socket of {:04x}:{:04x}; dropping",
                header.message_type,
                from,
                key.service_id,
                key.instance_id
            );
        }
    }
}

/// Validate an incoming request against the instance schema and forward
/// it to the owning application, or answer with an infrastructure error.
fn forward_request(
    state: &mut DaemonState,
    key: ServerKey,
    message: Message,
    from: SocketAddr,
    actions: &mut Vec<Action>,
) {
    let header = message.header;
    let expects_response = header.message_type.expects_response();

    let Some(server) = state.local_servers.get(&key) else {
        return;
    };

    let reject = |code: ReturnCode| -> Option<Action> {
        expects_response.then(|| Action::SendServerMessage {
            key,
            data: error_response(&header, code),
            target: from,
        })
    };

    if header.service_id != server.schema.service_id {
        state.counters.protocol_violations += 1;
        actions.extend(reject(ReturnCode::UnknownService));
        return;
    }
    if header.interface_version != server.schema.major_version {
        state.counters.protocol_violations += 1;
        actions.extend(reject(ReturnCode::WrongInterfaceVersion));
        return;
    }
    if !server.schema.methods.contains(&header.method_id) {
        state.counters.protocol_violations += 1;
        actions.extend(reject(ReturnCode::UnknownMethod));
        return;
    }

    let handle = server.handle;
    let conn = server.owner;
    let interface_version = server.schema.major_version;
    let request_timeout = Duration::from_millis(state.config.request_timeout_ms);
    let correlation_id = state.next_ipc_correlation();

    // Fire-and-forget requests are forwarded without a reply slot; a
    // stray ReplyRequest for them is dropped as a violation.
    if expects_response {
        state.pending_replies.insert(
            correlation_id,
            PendingReply {
                server_key: key,
                method_id: header.method_id,
                client_id: header.client_id,
                session_id: header.session_id,
                interface_version,
                peer: from,
                deadline: Instant::now() + request_timeout,
            },
        );
    }

    let sender = match from {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => return,
    };

    actions.push(Action::SendIpc {
        conn,
        envelope: Envelope::new(
            correlation_id,
            IpcBody::IncomingRequest {
                handle,
                method_id: header.method_id,
                client_id: header.client_id,
                session_id: header.session_id,
                sender,
                payload: message.payload,
            },
        ),
    });
}

/// Handle data that arrived on a client socket (`key` known for UDP) or
/// on a pool connection (`key` unknown, resolved via the sender).
pub fn handle_client_message(
    state: &mut DaemonState,
    key: Option<ClientKey>,
    data: Bytes,
    from: SocketAddr,
) -> Vec<Action> {
    let mut actions = Vec::new();
    let mut cursor = data;
    while cursor.remaining() >= Header::SIZE {
        let message = match Message::parse(&mut cursor) {
            Ok(message) => message,
            Err(e) => {
                state.counters.decode_errors += 1;
                tracing::debug!("Undecodable message from {}: {}", from, e);
                break;
            }
        };

        match message.header.message_type {
            MessageType::Response | MessageType::Error => {
                actions.extend(correlator::complete(state, &message.header, message.payload));
            }
            MessageType::Notification => {
                deliver_notification(state, key, &message.header, message.payload, from, &mut actions);
            }
            MessageType::Request | MessageType::RequestNoReturn => {
                state.counters.protocol_violations += 1;
                tracing::debug!("Request from {} on client socket; dropping", from);
            }
        }
    }
    actions
}

/// Route a notification to subscribed local clients. Unknown or
/// unsubscribed events are dropped with a counter.
fn deliver_notification(
    state: &mut DaemonState,
    key: Option<ClientKey>,
    header: &Header,
    payload: Bytes,
    from: SocketAddr,
    actions: &mut Vec<Action>,
) {
    let event_id = header.method_id;

    // UDP events arrive on the client's own socket; TCP events are
    // matched against the offer's TCP endpoint.
    let targets: Vec<ClientKey> = match key {
        Some(key) => vec![key],
        None => state
            .local_clients
            .keys()
            .filter(|client_key| {
                state
                    .remote_offers
                    .get(client_key)
                    .is_some_and(|offer| offer.tcp_endpoint == Some(from))
            })
            .copied()
            .collect(),
    };

    let mut delivered = false;
    for client_key in targets {
        let Some(client) = state.local_clients.get(&client_key) else {
            continue;
        };
        if client.schema.service_id != header.service_id {
            continue;
        }

        // A subscription awaiting its (re-)Ack already receives events;
        // servers may publish as soon as they accept the Subscribe.
        let subscribed = client.subscriptions.iter().any(|(eventgroup_id, sub)| {
            matches!(
                sub.state,
                SubscribeState::Subscribed { .. } | SubscribeState::Subscribing { .. }
            ) && client.schema.eventgroup_contains(*eventgroup_id, event_id)
        });
        if !subscribed {
            continue;
        }

        let handle = client.handle;
        let conn = client.owner;
        let correlation_id = state.next_ipc_correlation();
        actions.push(Action::SendIpc {
            conn,
            envelope: Envelope::new(
                correlation_id,
                IpcBody::IncomingEvent {
                    handle,
                    event_id,
                    payload: payload.clone(),
                },
            ),
        });
        delivered = true;
    }

    if !delivered {
        state.counters.dropped_events += 1;
        tracing::debug!(
            "Dropping event {:04x} of service {:04x} from {}: no subscribed client",
            event_id,
            header.service_id,
            from
        );
    }
}

/// Handle a TCP transport event.
pub fn handle_tcp_event(state: &mut DaemonState, event: TcpEvent<TcpTag>) -> Vec<Action> {
    match event {
        TcpEvent::Frame {
            tag: TcpTag::Server(key),
            data,
            from,
        } => handle_server_message(state, key, data, from),
        TcpEvent::Frame {
            tag: TcpTag::ClientPool,
            data,
            from,
        } => handle_client_message(state, None, data, from),
        TcpEvent::PeerClosed {
            tag: TcpTag::Server(key),
            peer,
        } => drop_tcp_subscriber(state, key, peer),
        TcpEvent::PeerClosed {
            tag: TcpTag::ClientPool,
            peer,
        } => drop_pool_peer(state, peer),
    }
}

/// A TCP subscriber's connection died: its subscriptions die with it.
fn drop_tcp_subscriber(state: &mut DaemonState, key: ServerKey, peer: SocketAddr) -> Vec<Action> {
    let mut actions = Vec::new();
    let mut removed: Vec<SubscriptionKey> = Vec::new();

    for (sub_key, subscribers) in state.server_subscriptions.iter_mut() {
        if sub_key.service_id != key.service_id || sub_key.instance_id != key.instance_id {
            continue;
        }
        let before = subscribers.len();
        subscribers.retain(|sub| {
            !(sub.transport == Transport::Tcp && sub.subscriber == peer)
        });
        if subscribers.len() != before {
            removed.push(*sub_key);
        }
    }

    for sub_key in removed {
        tracing::debug!(
            "Dropping TCP subscriber {} of EG {:04x} ({:04x}:{:04x}): connection lost",
            peer,
            sub_key.eventgroup_id,
            sub_key.service_id,
            sub_key.instance_id
        );
        let Some(server) = state.local_servers.get(&key) else {
            continue;
        };
        let SocketAddr::V4(subscriber_v4) = peer else {
            continue;
        };
        let handle = server.handle;
        let conn = server.owner;
        let correlation_id = state.next_ipc_correlation();
        actions.push(Action::SendIpc {
            conn,
            envelope: Envelope::new(
                correlation_id,
                IpcBody::SubscriptionChanged {
                    handle,
                    eventgroup_id: sub_key.eventgroup_id,
                    subscriber: subscriber_v4,
                    added: false,
                },
            ),
        });
    }

    actions
}

/// A pool connection died: client subscriptions over it fall back to
/// PendingOffer and retry after the backoff.
fn drop_pool_peer(state: &mut DaemonState, peer: SocketAddr) -> Vec<Action> {
    let affected: Vec<ClientKey> = state
        .remote_offers
        .iter()
        .filter(|(_, offer)| offer.tcp_endpoint == Some(peer))
        .map(|(key, _)| *key)
        .collect();

    for client_key in affected {
        let Some(client) = state.local_clients.get_mut(&client_key) else {
            continue;
        };
        for sub in client.subscriptions.values_mut() {
            if !matches!(sub.state, SubscribeState::PendingOffer { .. }) {
                sub.failures = sub.failures.saturating_add(1);
                sub.state = SubscribeState::PendingOffer {
                    retry_at: Some(Instant::now() + sd::subscribe_backoff(sub.failures)),
                };
                sub.tcp_local = None;
            }
        }
    }

    Vec::new()
}

// ============================================================================
// IPC INPUT
// ============================================================================

/// Handle the synchronous IPC request kinds. Register calls are handled
/// by the event loop because they bind sockets.
pub fn handle_ipc_message(state: &mut DaemonState, conn: ConnId, envelope: Envelope) -> Vec<Action> {
    let correlation_id = envelope.correlation_id;
    match envelope.body {
        IpcBody::StartOffer { handle } => {
            let Some(key) = server_key_for(state, conn, handle) else {
                return vec![unknown_handle(conn, correlation_id)];
            };
            sd::start_offer(state, key);
            vec![ack(conn, correlation_id, handle)]
        }
        IpcBody::StopOffer { handle } => {
            let Some(key) = server_key_for(state, conn, handle) else {
                return vec![unknown_handle(conn, correlation_id)];
            };
            let mut actions = sd::stop_offer(state, key);
            actions.push(ack(conn, correlation_id, handle));
            actions
        }
        IpcBody::Subscribe {
            handle,
            eventgroup_id,
            ttl,
        } => handle_subscribe_request(state, conn, correlation_id, handle, eventgroup_id, ttl),
        IpcBody::Unsubscribe {
            handle,
            eventgroup_id,
        } => handle_unsubscribe_request(state, conn, correlation_id, handle, eventgroup_id),
        IpcBody::SendEvent {
            handle,
            eventgroup_id,
            event_id,
            payload,
        } => handle_send_event(state, conn, correlation_id, handle, eventgroup_id, event_id, payload),
        IpcBody::CallMethod {
            handle,
            method_id,
            payload,
            timeout_ms,
        } => correlator::call_method(state, conn, correlation_id, handle, method_id, payload, timeout_ms),
        IpcBody::ReplyRequest {
            message_type,
            return_code,
            payload,
        } => handle_reply_request(state, conn, correlation_id, message_type, return_code, payload),
        // Daemon-to-app kinds have no business arriving here.
        IpcBody::RegisterServer { .. } | IpcBody::RegisterClient { .. } => {
            unreachable!("register kinds are handled by the event loop")
        }
        _ => {
            state.counters.protocol_violations += 1;
            vec![Action::SendIpc {
                conn,
                envelope: Envelope::new(
                    correlation_id,
                    IpcBody::Error {
                        code: proto::IPC_ERR_BAD_REQUEST,
                        message: "kind is daemon-to-app only".to_string(),
                    },
                ),
            }]
        }
    }
}

fn handle_subscribe_request(
    state: &mut DaemonState,
    conn: ConnId,
    correlation_id: u32,
    handle: u32,
    eventgroup_id: u16,
    ttl: u32,
) -> Vec<Action> {
    let Some((client_key, client)) = state.client_by_handle(handle) else {
        return vec![unknown_handle(conn, correlation_id)];
    };
    if client.owner != conn || !client.schema.has_eventgroup(eventgroup_id) {
        return vec![bad_request(conn, correlation_id, "eventgroup not in schema")];
    }

    let major_version = client.schema.major_version;
    client.subscriptions.insert(
        eventgroup_id,
        ClientSubscription {
            ttl,
            state: SubscribeState::PendingOffer { retry_at: None },
            failures: 0,
            tcp_local: None,
        },
    );

    let mut actions = vec![ack(conn, correlation_id, handle)];
    let offer_matches = state
        .remote_offers
        .get(&client_key)
        .is_some_and(|offer| offer.major_version == major_version);
    if offer_matches {
        actions.push(Action::SendSubscribe {
            client_key,
            eventgroup_id,
        });
    }
    actions
}

fn handle_unsubscribe_request(
    state: &mut DaemonState,
    conn: ConnId,
    correlation_id: u32,
    handle: u32,
    eventgroup_id: u16,
) -> Vec<Action> {
    let Some((client_key, _)) = state.client_by_handle(handle) else {
        return vec![unknown_handle(conn, correlation_id)];
    };

    let mut actions = stop_subscription(state, client_key, eventgroup_id);
    actions.push(ack(conn, correlation_id, handle));
    actions
}

/// Remove one client subscription, telling the remote side when it was
/// active on the wire.
pub fn stop_subscription(
    state: &mut DaemonState,
    client_key: ClientKey,
    eventgroup_id: u16,
) -> Vec<Action> {
    let Some(client) = state.local_clients.get_mut(&client_key) else {
        return Vec::new();
    };
    let Some(sub) = client.subscriptions.remove(&eventgroup_id) else {
        return Vec::new();
    };

    // Only an announced subscription needs a StopSubscribe on the wire.
    if matches!(sub.state, SubscribeState::PendingOffer { .. }) {
        return Vec::new();
    }
    let endpoint = match sub.tcp_local {
        Some(local) => local,
        None => SocketAddr::V4(client.endpoint),
    };
    let transport = if sub.tcp_local.is_some() {
        Transport::Tcp
    } else {
        Transport::Udp
    };
    let major_version = client.schema.major_version;

    let Some(offer) = state.remote_offers.get(&client_key) else {
        return Vec::new();
    };
    let target = offer.sd_source;

    let message = sd::build_stop_subscribe_message(
        client_key.service_id,
        client_key.instance_id,
        major_version,
        eventgroup_id,
        endpoint,
        transport,
        state.sd_flags(true),
    );
    vec![Action::SendSd { message, target }]
}

fn handle_send_event(
    state: &mut DaemonState,
    conn: ConnId,
    correlation_id: u32,
    handle: u32,
    eventgroup_id: u16,
    event_id: u16,
    payload: Bytes,
) -> Vec<Action> {
    let Some((key, server)) = state.server_by_handle(handle) else {
        return vec![unknown_handle(conn, correlation_id)];
    };
    if !server.schema.eventgroup_contains(eventgroup_id, event_id) {
        return vec![bad_request(conn, correlation_id, "event not in eventgroup")];
    }

    let session_id = server.next_notification_session();
    let header = Header {
        service_id: key.service_id,
        method_id: event_id,
        length: 8 + payload.len() as u32,
        client_id: 0x0000,
        session_id,
        protocol_version: PROTOCOL_VERSION,
        interface_version: server.schema.major_version,
        message_type: MessageType::Notification,
        return_code: ReturnCode::Ok as u8,
    };
    let data = correlator::serialize_message(header, &payload);

    let sub_key = SubscriptionKey {
        service_id: key.service_id,
        instance_id: key.instance_id,
        eventgroup_id,
    };
    let now = Instant::now();
    let mut actions: Vec<Action> = state
        .server_subscriptions
        .get(&sub_key)
        .into_iter()
        .flatten()
        .filter(|sub| sub.expires_at > now && sub.transport == key.transport)
        .map(|sub| Action::SendServerMessage {
            key,
            data: data.clone(),
            target: sub.subscriber,
        })
        .collect();

    tracing::trace!(
        "Event {:04x} of EG {:04x} fanned out to {} subscriber(s)",
        event_id,
        eventgroup_id,
        actions.len()
    );

    actions.push(ack(conn, correlation_id, handle));
    actions
}

fn handle_reply_request(
    state: &mut DaemonState,
    conn: ConnId,
    correlation_id: u32,
    message_type: u8,
    return_code: u8,
    payload: Bytes,
) -> Vec<Action> {
    let Some(reply) = state.pending_replies.remove(&correlation_id) else {
        state.counters.protocol_violations += 1;
        return vec![bad_request(conn, correlation_id, "no pending request")];
    };

    let message_type = match MessageType::from_u8(message_type) {
        Some(mt @ (MessageType::Response | MessageType::Error)) => mt,
        _ => {
            state.counters.protocol_violations += 1;
            return vec![bad_request(conn, correlation_id, "reply must be RESPONSE or ERROR")];
        }
    };

    let header = Header {
        service_id: reply.server_key.service_id,
        method_id: reply.method_id,
        length: 8 + payload.len() as u32,
        client_id: reply.client_id,
        session_id: reply.session_id,
        protocol_version: PROTOCOL_VERSION,
        interface_version: reply.interface_version,
        message_type,
        return_code,
    };
    let data = correlator::serialize_message(header, &payload);

    vec![Action::SendServerMessage {
        key: reply.server_key,
        data,
        target: reply.peer,
    }]
}

/// IPC disconnect semantics: stop-offer every owned server instance,
/// unsubscribe every owned client instance, cancel every pending call.
pub fn handle_ipc_disconnect(state: &mut DaemonState, conn: ConnId) -> Vec<Action> {
    let mut actions = Vec::new();

    let owned_servers: Vec<ServerKey> = state
        .local_servers
        .iter()
        .filter(|(_, server)| server.owner == conn)
        .map(|(key, _)| *key)
        .collect();
    for key in owned_servers {
        actions.extend(sd::stop_offer(state, key));
        state.remove_server(key);
    }

    let owned_clients: Vec<ClientKey> = state
        .local_clients
        .iter()
        .filter(|(_, client)| client.owner == conn)
        .map(|(key, _)| *key)
        .collect();
    for key in owned_clients {
        let eventgroups: Vec<u16> = state
            .local_clients
            .get(&key)
            .map(|client| client.subscriptions.keys().copied().collect())
            .unwrap_or_default();
        for eventgroup_id in eventgroups {
            actions.extend(stop_subscription(state, key, eventgroup_id));
        }
        state.remove_client(key);
    }

    state
        .pending_calls
        .retain(|_, call| call.conn != conn);
    state.pending_replies.retain(|_, reply| {
        state_owns_reply(&state.local_servers, reply, conn)
    });
    state.ipc_conns.remove(&conn);

    tracing::info!("Cleaned up after IPC client {}", conn);
    actions
}

fn state_owns_reply(
    servers: &std::collections::HashMap<ServerKey, super::state::LocalServer>,
    reply: &PendingReply,
    gone: ConnId,
) -> bool {
    servers
        .get(&reply.server_key)
        .map_or(false, |server| server.owner != gone)
}

// ============================================================================
// HELPERS
// ============================================================================

fn server_key_for(state: &mut DaemonState, conn: ConnId, handle: u32) -> Option<ServerKey> {
    let (key, server) = state.server_by_handle(handle)?;
    (server.owner == conn).then_some(key)
}

fn ack(conn: ConnId, correlation_id: u32, handle: u32) -> Action {
    Action::SendIpc {
        conn,
        envelope: Envelope::new(correlation_id, IpcBody::Ack { handle }),
    }
}

fn unknown_handle(conn: ConnId, correlation_id: u32) -> Action {
    Action::SendIpc {
        conn,
        envelope: Envelope::new(
            correlation_id,
            IpcBody::Error {
                code: proto::IPC_ERR_UNKNOWN_HANDLE,
                message: "unknown instance handle".to_string(),
            },
        ),
    }
}

fn bad_request(conn: ConnId, correlation_id: u32, message: &str) -> Action {
    Action::SendIpc {
        conn,
        envelope: Envelope::new(
            correlation_id,
            IpcBody::Error {
                code: proto::IPC_ERR_BAD_REQUEST,
                message: message.to_string(),
            },
        ),
    }
}

/// Build an infrastructure ERROR response preserving the request's ids.
fn error_response(request: &Header, return_code: ReturnCode) -> Bytes {
    let header = Header {
        service_id: request.service_id,
        method_id: request.method_id,
        length: 8,
        client_id: request.client_id,
        session_id: request.session_id,
        protocol_version: PROTOCOL_VERSION,
        interface_version: request.interface_version,
        message_type: MessageType::Error,
        return_code: return_code as u8,
    };
    correlator::serialize_message(header, &[])
}
