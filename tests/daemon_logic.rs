//! Dispatcher and correlator coverage: request forwarding, response
//! correlation (including out-of-order completion), session uniqueness,
//! notification routing, and IPC disconnect cleanup.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use someipyd::daemon::sd::{self, Action};
use someipyd::daemon::state::{
    ClientSubscription, DaemonState, LocalClient, LocalServer, OfferState, RemoteOffer, ServerKey,
    SubscribeState,
};
use someipyd::daemon::{correlator, dispatch};
use someipyd::ipc::{proto, Envelope, IpcBody};
use someipyd::wire::{Header, Message, MessageType, PROTOCOL_VERSION};
use someipyd::{Config, ReturnCode, ServiceSchema, Transport};

const SERVICE: u16 = 0x1234;
const INSTANCE: u16 = 0x5678;
const METHOD: u16 = 0x0001;
const EVENTGROUP: u16 = 0x0321;
const EVENT: u16 = 0x8123;

fn schema() -> ServiceSchema {
    let mut event_groups = HashMap::new();
    event_groups.insert(EVENTGROUP, HashSet::from([EVENT]));
    ServiceSchema {
        service_id: SERVICE,
        major_version: 1,
        minor_version: 0,
        methods: HashSet::from([METHOD]),
        events: HashSet::from([EVENT]),
        event_groups,
    }
}

fn insert_server(state: &mut DaemonState, handle: u32, owner: u64) -> ServerKey {
    let server = LocalServer {
        handle,
        owner,
        schema: schema(),
        instance_id: INSTANCE,
        endpoint: "127.0.0.1:3000".parse().unwrap(),
        transport: Transport::Udp,
        ttl: 5,
        cyclic_offer_delay: Duration::from_millis(1000),
        state: OfferState::Offering,
        next_offer_at: None,
        notification_session: 1,
        udp_socket: None,
        tcp_server: None,
        reader: None,
    };
    let key = server.key();
    state.insert_server(server).unwrap();
    key
}

async fn insert_client(state: &mut DaemonState, handle: u32, owner: u64) {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let endpoint = match socket.local_addr().unwrap() {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!(),
    };
    let client = LocalClient {
        handle,
        owner,
        schema: schema(),
        instance_id: INSTANCE,
        endpoint,
        client_id: 0x0100 + handle as u16,
        next_session: 1,
        subscriptions: HashMap::new(),
        udp_socket: Arc::new(socket),
        reader: tokio::spawn(async {}).abort_handle(),
    };
    state.insert_client(client).unwrap();
}

fn live_offer(state: &mut DaemonState, endpoint: &str) {
    state.remote_offers.insert(
        someipyd::daemon::state::ClientKey {
            service_id: SERVICE,
            instance_id: INSTANCE,
        },
        RemoteOffer {
            major_version: 1,
            minor_version: 0,
            udp_endpoint: Some(endpoint.parse().unwrap()),
            tcp_endpoint: None,
            sd_source: "192.168.1.60:30490".parse().unwrap(),
            expires_at: Instant::now() + Duration::from_secs(10),
        },
    );
}

fn request(method_id: u16, client_id: u16, session_id: u16, payload: &'static [u8]) -> Bytes {
    Message {
        header: Header {
            service_id: SERVICE,
            method_id,
            length: 8 + payload.len() as u32,
            client_id,
            session_id,
            protocol_version: PROTOCOL_VERSION,
            interface_version: 1,
            message_type: MessageType::Request,
            return_code: 0,
        },
        payload: Bytes::from_static(payload),
    }
    .serialize()
}

// ============================================================================
// Server-side request forwarding
// ============================================================================

#[test_log::test(tokio::test)]
async fn request_is_forwarded_and_reply_preserves_ids() {
    let mut state = DaemonState::new(Config::default());
    let key = insert_server(&mut state, 1, 7);
    let peer: SocketAddr = "192.168.1.50:40000".parse().unwrap();

    let actions = dispatch::handle_server_message(
        &mut state,
        key,
        request(METHOD, 0x0101, 0x0009, &[0x00, 0x02, 0x00, 0x03]),
        peer,
    );

    // The application receives the request with its wire identity
    let (conn, correlation_id) = match &actions[..] {
        [Action::SendIpc { conn, envelope }] => {
            let IpcBody::IncomingRequest {
                handle,
                method_id,
                client_id,
                session_id,
                sender,
                payload,
            } = &envelope.body
            else {
                panic!("expected IncomingRequest");
            };
            assert_eq!(*handle, 1);
            assert_eq!(*method_id, METHOD);
            assert_eq!(*client_id, 0x0101);
            assert_eq!(*session_id, 0x0009);
            assert_eq!(SocketAddr::V4(*sender), peer);
            assert_eq!(&payload[..], &[0x00, 0x02, 0x00, 0x03]);
            (*conn, envelope.correlation_id)
        }
        other => panic!("expected one IPC action, got {}", other.len()),
    };
    assert_eq!(conn, 7);

    // The application answers; the response carries the original ids
    let actions = dispatch::handle_ipc_message(
        &mut state,
        7,
        Envelope::new(
            correlation_id,
            IpcBody::ReplyRequest {
                message_type: MessageType::Response as u8,
                return_code: ReturnCode::Ok as u8,
                payload: Bytes::from_static(&[0x00, 0x00, 0x00, 0x05]),
            },
        ),
    );

    match &actions[..] {
        [Action::SendServerMessage { key: out_key, data, target }] => {
            assert_eq!(*out_key, key);
            assert_eq!(*target, peer);
            let mut cursor = data.clone();
            let response = Message::parse(&mut cursor).unwrap();
            assert_eq!(response.header.message_type, MessageType::Response);
            assert_eq!(response.header.client_id, 0x0101);
            assert_eq!(response.header.session_id, 0x0009);
            assert_eq!(response.header.return_code, ReturnCode::Ok as u8);
            assert_eq!(&response.payload[..], &[0x00, 0x00, 0x00, 0x05]);
        }
        other => panic!("expected one send action, got {}", other.len()),
    }

    // The reply slot is consumed: a second reply is a violation
    let actions = dispatch::handle_ipc_message(
        &mut state,
        7,
        Envelope::new(
            correlation_id,
            IpcBody::ReplyRequest {
                message_type: MessageType::Response as u8,
                return_code: 0,
                payload: Bytes::new(),
            },
        ),
    );
    assert!(matches!(
        &actions[..],
        [Action::SendIpc { envelope, .. }]
            if matches!(&envelope.body, IpcBody::Error { code, .. } if *code == proto::IPC_ERR_BAD_REQUEST)
    ));
}

#[test_log::test(tokio::test)]
async fn unknown_method_is_answered_with_error() {
    let mut state = DaemonState::new(Config::default());
    let key = insert_server(&mut state, 1, 7);
    let peer: SocketAddr = "192.168.1.50:40000".parse().unwrap();

    let actions =
        dispatch::handle_server_message(&mut state, key, request(0x7777, 1, 1, &[]), peer);

    match &actions[..] {
        [Action::SendServerMessage { data, target, .. }] => {
            assert_eq!(*target, peer);
            let mut cursor = data.clone();
            let response = Message::parse(&mut cursor).unwrap();
            assert_eq!(response.header.message_type, MessageType::Error);
            assert_eq!(
                response.header.return_code,
                ReturnCode::UnknownMethod as u8
            );
        }
        other => panic!("expected one error response, got {}", other.len()),
    }
}

#[test_log::test(tokio::test)]
async fn notification_on_server_socket_is_dropped() {
    let mut state = DaemonState::new(Config::default());
    let key = insert_server(&mut state, 1, 7);
    let peer: SocketAddr = "192.168.1.50:40000".parse().unwrap();

    let notification = Message {
        header: Header {
            service_id: SERVICE,
            method_id: EVENT,
            length: 8,
            client_id: 0,
            session_id: 1,
            protocol_version: PROTOCOL_VERSION,
            interface_version: 1,
            message_type: MessageType::Notification,
            return_code: 0,
        },
        payload: Bytes::new(),
    }
    .serialize();

    let actions = dispatch::handle_server_message(&mut state, key, notification, peer);
    assert!(actions.is_empty());
    assert_eq!(state.counters.protocol_violations, 1);
}

// ============================================================================
// Method correlation
// ============================================================================

#[test_log::test(tokio::test)]
async fn call_without_offer_fails_not_available() {
    let mut state = DaemonState::new(Config::default());
    insert_client(&mut state, 2, 7).await;

    let actions =
        correlator::call_method(&mut state, 7, 11, 2, METHOD, Bytes::new(), 1000);
    assert!(matches!(
        &actions[..],
        [Action::SendIpc { envelope, .. }]
            if envelope.correlation_id == 11
                && matches!(&envelope.body, IpcBody::Error { code, .. } if *code == proto::IPC_ERR_NOT_AVAILABLE)
    ));
}

#[test_log::test(tokio::test)]
async fn out_of_order_responses_route_to_their_callers() {
    let mut state = DaemonState::new(Config::default());
    insert_client(&mut state, 2, 7).await;
    live_offer(&mut state, "192.168.1.60:3000");

    // Three calls A, B, C
    let mut sessions = Vec::new();
    for correlation_id in [21u32, 22, 23] {
        let actions = correlator::call_method(
            &mut state,
            7,
            correlation_id,
            2,
            METHOD,
            Bytes::new(),
            5000,
        );
        match &actions[..] {
            [Action::SendClientMessage { data, .. }] => {
                let mut cursor = data.clone();
                let message = Message::parse(&mut cursor).unwrap();
                sessions.push((message.header.client_id, message.header.session_id));
            }
            other => panic!("expected one send, got {}", other.len()),
        }
    }

    // Session ids are unique among in-flight calls
    let unique: HashSet<_> = sessions.iter().collect();
    assert_eq!(unique.len(), 3);

    // Responses arrive B, C, A; each resolves its own correlation id
    for (idx, expected_correlation) in [(1usize, 22u32), (2, 23), (0, 21)] {
        let (client_id, session_id) = sessions[idx];
        let header = Header {
            service_id: SERVICE,
            method_id: METHOD,
            length: 8 + 1,
            client_id,
            session_id,
            protocol_version: PROTOCOL_VERSION,
            interface_version: 1,
            message_type: MessageType::Response,
            return_code: 0,
        };
        let actions = correlator::complete(&mut state, &header, Bytes::from_static(&[0x55]));
        match &actions[..] {
            [Action::SendIpc { envelope, .. }] => {
                assert_eq!(envelope.correlation_id, expected_correlation);
                assert!(matches!(
                    &envelope.body,
                    IpcBody::MethodResponse { message_type, .. }
                        if *message_type == MessageType::Response as u8
                ));
            }
            other => panic!("expected one IPC action, got {}", other.len()),
        }
    }

    // Everything resolved: a duplicate response is dropped and counted
    let (client_id, session_id) = sessions[0];
    let header = Header {
        service_id: SERVICE,
        method_id: METHOD,
        length: 8,
        client_id,
        session_id,
        protocol_version: PROTOCOL_VERSION,
        interface_version: 1,
        message_type: MessageType::Response,
        return_code: 0,
    };
    assert!(correlator::complete(&mut state, &header, Bytes::new()).is_empty());
    assert_eq!(state.counters.dropped_responses, 1);
}

#[test_log::test(tokio::test)]
async fn call_deadline_is_enforced_by_the_tick() {
    let mut state = DaemonState::new(Config::default());
    insert_client(&mut state, 2, 7).await;
    live_offer(&mut state, "192.168.1.60:3000");

    let actions =
        correlator::call_method(&mut state, 7, 31, 2, METHOD, Bytes::new(), 100);
    assert!(matches!(&actions[..], [Action::SendClientMessage { .. }]));

    let actions = sd::handle_expiry_tick(&mut state, Instant::now() + Duration::from_millis(200));
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::SendIpc { envelope, .. }
            if envelope.correlation_id == 31
                && matches!(&envelope.body, IpcBody::Error { code, .. } if *code == proto::IPC_ERR_TIMEOUT)
    )));
    assert!(state.pending_calls.is_empty());
}

// ============================================================================
// Notification routing
// ============================================================================

#[test_log::test(tokio::test)]
async fn events_reach_subscribed_clients_only() {
    let mut state = DaemonState::new(Config::default());
    insert_client(&mut state, 2, 7).await;
    let key = someipyd::daemon::state::ClientKey {
        service_id: SERVICE,
        instance_id: INSTANCE,
    };

    let notification = Message {
        header: Header {
            service_id: SERVICE,
            method_id: EVENT,
            length: 8 + 3,
            client_id: 0,
            session_id: 1,
            protocol_version: PROTOCOL_VERSION,
            interface_version: 1,
            message_type: MessageType::Notification,
            return_code: 0,
        },
        payload: Bytes::from_static(&[0x01, 0x02, 0x03]),
    }
    .serialize();
    let from: SocketAddr = "192.168.1.60:3000".parse().unwrap();

    // Not subscribed: dropped with a counter
    let actions =
        dispatch::handle_client_message(&mut state, Some(key), notification.clone(), from);
    assert!(actions.is_empty());
    assert_eq!(state.counters.dropped_events, 1);

    // Subscribed: delivered with event id and exact payload
    state
        .local_clients
        .get_mut(&key)
        .unwrap()
        .subscriptions
        .insert(
            EVENTGROUP,
            ClientSubscription {
                ttl: 3,
                state: SubscribeState::Subscribed {
                    refresh_at: Instant::now() + Duration::from_secs(1),
                },
                failures: 0,
                tcp_local: None,
            },
        );
    let actions = dispatch::handle_client_message(&mut state, Some(key), notification, from);
    match &actions[..] {
        [Action::SendIpc { conn, envelope }] => {
            assert_eq!(*conn, 7);
            let IpcBody::IncomingEvent {
                handle,
                event_id,
                payload,
            } = &envelope.body
            else {
                panic!("expected IncomingEvent");
            };
            assert_eq!(*handle, 2);
            assert_eq!(*event_id, EVENT);
            assert_eq!(&payload[..], &[0x01, 0x02, 0x03]);
        }
        other => panic!("expected one IPC action, got {}", other.len()),
    }
}

// ============================================================================
// SendEvent fan-out
// ============================================================================

#[test_log::test(tokio::test)]
async fn send_event_fans_out_to_live_subscribers_only() {
    let mut state = DaemonState::new(Config::default());
    insert_server(&mut state, 1, 7);

    let sub_key = someipyd::daemon::state::SubscriptionKey {
        service_id: SERVICE,
        instance_id: INSTANCE,
        eventgroup_id: EVENTGROUP,
    };
    state.server_subscriptions.insert(
        sub_key,
        vec![
            someipyd::daemon::state::Subscription {
                subscriber: "192.168.1.50:40000".parse().unwrap(),
                transport: Transport::Udp,
                expires_at: Instant::now() + Duration::from_secs(5),
            },
            someipyd::daemon::state::Subscription {
                subscriber: "192.168.1.51:40000".parse().unwrap(),
                transport: Transport::Udp,
                expires_at: Instant::now() - Duration::from_millis(1),
            },
        ],
    );

    let actions = dispatch::handle_ipc_message(
        &mut state,
        7,
        Envelope::new(
            41,
            IpcBody::SendEvent {
                handle: 1,
                eventgroup_id: EVENTGROUP,
                event_id: EVENT,
                payload: Bytes::from_static(&[0x01, 0x02, 0x03]),
            },
        ),
    );

    // One live subscriber gets the event; the expired one does not
    let sends: Vec<&SocketAddr> = actions
        .iter()
        .filter_map(|a| match a {
            Action::SendServerMessage { target, .. } => Some(target),
            _ => None,
        })
        .collect();
    assert_eq!(sends.len(), 1);
    assert_eq!(*sends[0], "192.168.1.50:40000".parse::<SocketAddr>().unwrap());

    // The event on the wire is a NOTIFICATION with the exact payload
    let data = actions
        .iter()
        .find_map(|a| match a {
            Action::SendServerMessage { data, .. } => Some(data.clone()),
            _ => None,
        })
        .unwrap();
    let mut cursor = data;
    let message = Message::parse(&mut cursor).unwrap();
    assert_eq!(message.header.message_type, MessageType::Notification);
    assert_eq!(message.header.method_id, EVENT);
    assert_eq!(&message.payload[..], &[0x01, 0x02, 0x03]);
}

#[test_log::test(tokio::test)]
async fn send_event_outside_eventgroup_is_rejected() {
    let mut state = DaemonState::new(Config::default());
    insert_server(&mut state, 1, 7);

    let actions = dispatch::handle_ipc_message(
        &mut state,
        7,
        Envelope::new(
            42,
            IpcBody::SendEvent {
                handle: 1,
                eventgroup_id: EVENTGROUP,
                event_id: 0x8999,
                payload: Bytes::new(),
            },
        ),
    );
    assert!(matches!(
        &actions[..],
        [Action::SendIpc { envelope, .. }]
            if matches!(&envelope.body, IpcBody::Error { code, .. } if *code == proto::IPC_ERR_BAD_REQUEST)
    ));
}

// ============================================================================
// IPC disconnect semantics
// ============================================================================

#[test_log::test(tokio::test)]
async fn disconnect_stops_offers_and_cancels_calls() {
    let mut state = DaemonState::new(Config::default());
    let server_key = insert_server(&mut state, 1, 7);
    insert_client(&mut state, 2, 7).await;
    live_offer(&mut state, "192.168.1.60:3000");
    state
        .local_servers
        .get_mut(&server_key)
        .unwrap()
        .next_offer_at = Some(Instant::now());

    // One call in flight
    let actions = correlator::call_method(&mut state, 7, 51, 2, METHOD, Bytes::new(), 5000);
    assert!(matches!(&actions[..], [Action::SendClientMessage { .. }]));
    assert_eq!(state.pending_calls.len(), 1);

    let actions = dispatch::handle_ipc_disconnect(&mut state, 7);

    // Exactly one Stop-Offer went out
    let stop_offers = actions
        .iter()
        .filter(|a| {
            matches!(
                a,
                Action::SendSd { message, .. }
                    if message.entries.iter().any(|e| e.is_stop())
            )
        })
        .count();
    assert_eq!(stop_offers, 1);

    // All directories are clean
    assert!(state.local_servers.is_empty());
    assert!(state.local_clients.is_empty());
    assert!(state.pending_calls.is_empty());
    assert!(state.server_handles.is_empty());
    assert!(state.client_handles.is_empty());
}

#[test_log::test(tokio::test)]
async fn duplicate_registration_is_rejected() {
    let mut state = DaemonState::new(Config::default());
    insert_server(&mut state, 1, 7);

    let duplicate = LocalServer {
        handle: 9,
        owner: 8,
        schema: schema(),
        instance_id: INSTANCE,
        endpoint: "127.0.0.1:3001".parse().unwrap(),
        transport: Transport::Udp,
        ttl: 5,
        cyclic_offer_delay: Duration::from_millis(1000),
        state: OfferState::Down,
        next_offer_at: None,
        notification_session: 1,
        udp_socket: None,
        tcp_server: None,
        reader: None,
    };
    assert!(state.insert_server(duplicate).is_err());

    // A different transport for the same (service, instance) is fine
    let tcp_variant = LocalServer {
        handle: 10,
        owner: 8,
        schema: schema(),
        instance_id: INSTANCE,
        endpoint: "127.0.0.1:3000".parse().unwrap(),
        transport: Transport::Tcp,
        ttl: 5,
        cyclic_offer_delay: Duration::from_millis(1000),
        state: OfferState::Down,
        next_offer_at: None,
        notification_session: 1,
        udp_socket: None,
        tcp_server: None,
        reader: None,
    };
    assert!(state.insert_server(tcp_variant).is_ok());
}
