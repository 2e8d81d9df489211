//! SD engine state-machine coverage: offer packing and cadence,
//! subscribe handshake on both sides, TTL expiry, Find answering, and
//! peer reboot handling.
//!
//! Handlers are synchronous and return actions, so most of this runs
//! against a bare `DaemonState`; sockets only appear where a client
//! instance needs its data endpoint.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use someipyd::daemon::sd::{self, Action};
use someipyd::daemon::state::{
    ClientKey, ClientSubscription, DaemonState, LocalClient, LocalServer, OfferState, ServerKey,
    SubscribeState, Subscription, SubscriptionKey,
};
use someipyd::ipc::IpcBody;
use someipyd::wire::{L4Protocol, SdEntry, SdEntryType, SdMessage, SdOption};
use someipyd::{Config, ServiceSchema, Transport};

const SERVICE: u16 = 0x1234;
const INSTANCE: u16 = 0x5678;
const EVENTGROUP: u16 = 0x0321;
const EVENT: u16 = 0x8123;

fn schema() -> ServiceSchema {
    let mut event_groups = HashMap::new();
    event_groups.insert(EVENTGROUP, HashSet::from([EVENT]));
    ServiceSchema {
        service_id: SERVICE,
        major_version: 1,
        minor_version: 0,
        methods: HashSet::from([0x0001]),
        events: HashSet::from([EVENT]),
        event_groups,
    }
}

fn server(
    instance_id: u16,
    endpoint: SocketAddrV4,
    transport: Transport,
    ttl: u32,
    delay_ms: u64,
    handle: u32,
) -> LocalServer {
    LocalServer {
        handle,
        owner: 1,
        schema: schema(),
        instance_id,
        endpoint,
        transport,
        ttl,
        cyclic_offer_delay: Duration::from_millis(delay_ms),
        state: OfferState::Down,
        next_offer_at: None,
        notification_session: 1,
        udp_socket: None,
        tcp_server: None,
        reader: None,
    }
}

async fn client(state: &mut DaemonState, handle: u32) -> ClientKey {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let endpoint = match socket.local_addr().unwrap() {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!(),
    };
    let client = LocalClient {
        handle,
        owner: 1,
        schema: schema(),
        instance_id: INSTANCE,
        endpoint,
        client_id: handle as u16,
        next_session: 1,
        subscriptions: HashMap::new(),
        udp_socket: Arc::new(socket),
        reader: tokio::spawn(async {}).abort_handle(),
    };
    let key = client.key();
    state.insert_client(client).unwrap();
    key
}

/// Serialize an SD message as it would appear from a remote peer.
fn sd_bytes(message: &SdMessage, session_id: u16) -> Vec<u8> {
    message.serialize(session_id).to_vec()
}

fn offer_message(ttl: u32, endpoint: SocketAddrV4, protocol: L4Protocol) -> SdMessage {
    let mut message = SdMessage::new(SdMessage::FLAG_REBOOT);
    let opt_idx = message.intern_option(SdOption::Ipv4Endpoint {
        addr: *endpoint.ip(),
        port: endpoint.port(),
        protocol,
    });
    let mut entry = SdEntry::offer_service(SERVICE, INSTANCE, 1, 0, ttl);
    entry.index_1st_option = opt_idx;
    entry.num_options_1 = 1;
    message.add_entry(entry);
    message
}

// ============================================================================
// Offer emission and packing
// ============================================================================

#[test_log::test(tokio::test)]
async fn coinciding_offers_pack_into_one_message() {
    let mut state = DaemonState::new(Config::default());
    let endpoint: SocketAddrV4 = "127.0.0.1:3000".parse().unwrap();
    state
        .insert_server(server(INSTANCE, endpoint, Transport::Udp, 5, 2000, 1))
        .unwrap();
    state
        .insert_server(server(INSTANCE, endpoint, Transport::Tcp, 5, 2000, 2))
        .unwrap();

    sd::start_offer(
        &mut state,
        ServerKey {
            service_id: SERVICE,
            instance_id: INSTANCE,
            transport: Transport::Udp,
        },
    );
    sd::start_offer(
        &mut state,
        ServerKey {
            service_id: SERVICE,
            instance_id: INSTANCE,
            transport: Transport::Tcp,
        },
    );

    let actions = sd::emit_cyclic_offers(&mut state, Instant::now());
    assert_eq!(actions.len(), 1);
    let Action::SendSd { message, target } = &actions[0] else {
        panic!("expected one SD send");
    };
    assert_eq!(*target, state.sd_multicast_target());
    // Two offer entries but only two options (one UDP, one TCP), not four
    assert_eq!(message.entries.len(), 2);
    assert_eq!(message.options.len(), 2);
    for entry in &message.entries {
        assert_eq!(entry.entry_type, SdEntryType::OfferService);
        assert_eq!(entry.ttl, 5);
    }
}

#[test_log::test(tokio::test)]
async fn offer_cadence_reschedules_from_planned_time() {
    let mut state = DaemonState::new(Config::default());
    let endpoint: SocketAddrV4 = "127.0.0.1:3000".parse().unwrap();
    state
        .insert_server(server(INSTANCE, endpoint, Transport::Udp, 5, 1000, 1))
        .unwrap();
    let key = ServerKey {
        service_id: SERVICE,
        instance_id: INSTANCE,
        transport: Transport::Udp,
    };
    sd::start_offer(&mut state, key);

    let first = sd::next_offer_deadline(&state).unwrap();
    let _ = sd::emit_cyclic_offers(&mut state, first);
    let second = sd::next_offer_deadline(&state).unwrap();
    assert_eq!(second.duration_since(first), Duration::from_millis(1000));
}

#[test_log::test(tokio::test)]
async fn stop_offer_emits_exactly_one_stop_entry() {
    let mut state = DaemonState::new(Config::default());
    let endpoint: SocketAddrV4 = "127.0.0.1:3000".parse().unwrap();
    state
        .insert_server(server(INSTANCE, endpoint, Transport::Udp, 5, 1000, 1))
        .unwrap();
    let key = ServerKey {
        service_id: SERVICE,
        instance_id: INSTANCE,
        transport: Transport::Udp,
    };
    sd::start_offer(&mut state, key);

    let actions = sd::stop_offer(&mut state, key);
    assert_eq!(actions.len(), 1);
    let Action::SendSd { message, .. } = &actions[0] else {
        panic!("expected an SD send");
    };
    assert_eq!(message.entries.len(), 1);
    assert!(message.entries[0].is_stop());

    // Cyclic emission has ceased
    assert!(sd::next_offer_deadline(&state).is_none());
    // A second stop is a no-op
    assert!(sd::stop_offer(&mut state, key).is_empty());
}

#[test_log::test(tokio::test)]
async fn ttl_shorter_than_cycle_still_offers() {
    let mut state = DaemonState::new(Config::default());
    let endpoint: SocketAddrV4 = "127.0.0.1:3000".parse().unwrap();
    // TTL 1 s against a 2000 ms cycle: a warning, not an error
    state
        .insert_server(server(INSTANCE, endpoint, Transport::Udp, 1, 2000, 1))
        .unwrap();
    let key = ServerKey {
        service_id: SERVICE,
        instance_id: INSTANCE,
        transport: Transport::Udp,
    };
    sd::start_offer(&mut state, key);

    assert_eq!(state.local_servers[&key].state, OfferState::Offering);
    let actions = sd::emit_cyclic_offers(&mut state, Instant::now());
    assert!(matches!(&actions[..], [Action::SendSd { .. }]));
}

#[test_log::test(tokio::test)]
async fn find_service_is_answered_unicast() {
    let mut state = DaemonState::new(Config::default());
    let endpoint: SocketAddrV4 = "127.0.0.1:3000".parse().unwrap();
    state
        .insert_server(server(INSTANCE, endpoint, Transport::Udp, 5, 1000, 1))
        .unwrap();
    sd::start_offer(
        &mut state,
        ServerKey {
            service_id: SERVICE,
            instance_id: INSTANCE,
            transport: Transport::Udp,
        },
    );

    let mut find = SdMessage::new(SdMessage::FLAG_REBOOT | SdMessage::FLAG_UNICAST);
    // Wildcard instance
    find.add_entry(SdEntry::find_service(SERVICE, 0xFFFF, 1, 0xFFFF_FFFF, 3));
    let from: SocketAddr = "192.168.1.50:30490".parse().unwrap();

    let actions = sd::handle_sd_datagram(&sd_bytes(&find, 1), from, &mut state);
    let sends: Vec<_> = actions
        .iter()
        .filter_map(|a| match a {
            Action::SendSd { message, target } => Some((message, target)),
            _ => None,
        })
        .collect();
    assert_eq!(sends.len(), 1);
    let (message, target) = &sends[0];
    assert_eq!(**target, from);
    assert_eq!(message.entries.len(), 1);
    assert_eq!(message.entries[0].entry_type, SdEntryType::OfferService);
    assert_eq!(message.entries[0].instance_id, INSTANCE);
}

// ============================================================================
// Server-side subscription handshake
// ============================================================================

fn subscribe_message(eventgroup_id: u16, ttl: u32, subscriber: SocketAddrV4) -> SdMessage {
    let mut message = SdMessage::new(SdMessage::FLAG_REBOOT | SdMessage::FLAG_UNICAST);
    let opt_idx = message.intern_option(SdOption::Ipv4Endpoint {
        addr: *subscriber.ip(),
        port: subscriber.port(),
        protocol: L4Protocol::Udp,
    });
    let mut entry = SdEntry::subscribe_eventgroup(SERVICE, INSTANCE, 1, eventgroup_id, ttl, 0);
    entry.index_1st_option = opt_idx;
    entry.num_options_1 = 1;
    message.add_entry(entry);
    message
}

#[test_log::test(tokio::test)]
async fn subscribe_is_acked_and_reported() {
    let mut state = DaemonState::new(Config::default());
    let endpoint: SocketAddrV4 = "127.0.0.1:3000".parse().unwrap();
    state
        .insert_server(server(INSTANCE, endpoint, Transport::Udp, 5, 1000, 1))
        .unwrap();
    sd::start_offer(
        &mut state,
        ServerKey {
            service_id: SERVICE,
            instance_id: INSTANCE,
            transport: Transport::Udp,
        },
    );

    let subscriber: SocketAddrV4 = "192.168.1.50:40000".parse().unwrap();
    let sd_source: SocketAddr = "192.168.1.50:30490".parse().unwrap();
    let actions = sd::handle_sd_datagram(
        &sd_bytes(&subscribe_message(EVENTGROUP, 3, subscriber), 1),
        sd_source,
        &mut state,
    );

    // Ack goes back to the SD source, echoing the TTL and carrying our
    // endpoint option for the eventgroup's transport
    let ack = actions
        .iter()
        .find_map(|a| match a {
            Action::SendSd { message, target } if *target == sd_source => Some(message),
            _ => None,
        })
        .expect("ack expected");
    assert_eq!(ack.entries.len(), 1);
    let entry = &ack.entries[0];
    assert_eq!(entry.entry_type, SdEntryType::SubscribeEventgroupAck);
    assert_eq!(entry.ttl, 3);
    assert_eq!(
        ack.options[entry.index_1st_option as usize],
        SdOption::Ipv4Endpoint {
            addr: *endpoint.ip(),
            port: endpoint.port(),
            protocol: L4Protocol::Udp,
        }
    );

    // The owning application is told about the new subscriber
    let reported = actions.iter().any(|a| {
        matches!(
            a,
            Action::SendIpc {
                envelope,
                ..
            } if matches!(
                &envelope.body,
                IpcBody::SubscriptionChanged { eventgroup_id, subscriber: s, added: true, .. }
                    if *eventgroup_id == EVENTGROUP && *s == subscriber
            )
        )
    });
    assert!(reported);

    // The subscription is recorded
    let sub_key = SubscriptionKey {
        service_id: SERVICE,
        instance_id: INSTANCE,
        eventgroup_id: EVENTGROUP,
    };
    assert_eq!(state.server_subscriptions[&sub_key].len(), 1);

    // A renewal refreshes without a second SubscriptionChanged
    let actions = sd::handle_sd_datagram(
        &sd_bytes(&subscribe_message(EVENTGROUP, 3, subscriber), 2),
        sd_source,
        &mut state,
    );
    assert_eq!(state.server_subscriptions[&sub_key].len(), 1);
    assert!(!actions.iter().any(|a| matches!(
        a,
        Action::SendIpc { envelope, .. }
            if matches!(&envelope.body, IpcBody::SubscriptionChanged { .. })
    )));
}

#[test_log::test(tokio::test)]
async fn subscribe_for_unknown_eventgroup_is_nacked() {
    let mut state = DaemonState::new(Config::default());
    let endpoint: SocketAddrV4 = "127.0.0.1:3000".parse().unwrap();
    state
        .insert_server(server(INSTANCE, endpoint, Transport::Udp, 5, 1000, 1))
        .unwrap();
    sd::start_offer(
        &mut state,
        ServerKey {
            service_id: SERVICE,
            instance_id: INSTANCE,
            transport: Transport::Udp,
        },
    );

    let subscriber: SocketAddrV4 = "192.168.1.50:40000".parse().unwrap();
    let sd_source: SocketAddr = "192.168.1.50:30490".parse().unwrap();
    let actions = sd::handle_sd_datagram(
        &sd_bytes(&subscribe_message(0x0999, 3, subscriber), 1),
        sd_source,
        &mut state,
    );

    let nack = actions
        .iter()
        .find_map(|a| match a {
            Action::SendSd { message, .. } => Some(message),
            _ => None,
        })
        .expect("nack expected");
    assert_eq!(
        nack.entries[0].entry_type,
        SdEntryType::SubscribeEventgroupAck
    );
    assert!(nack.entries[0].is_stop());
}

#[test_log::test(tokio::test)]
async fn stop_subscribe_removes_the_subscriber() {
    let mut state = DaemonState::new(Config::default());
    let endpoint: SocketAddrV4 = "127.0.0.1:3000".parse().unwrap();
    state
        .insert_server(server(INSTANCE, endpoint, Transport::Udp, 5, 1000, 1))
        .unwrap();
    sd::start_offer(
        &mut state,
        ServerKey {
            service_id: SERVICE,
            instance_id: INSTANCE,
            transport: Transport::Udp,
        },
    );

    let subscriber: SocketAddrV4 = "192.168.1.50:40000".parse().unwrap();
    let sd_source: SocketAddr = "192.168.1.50:30490".parse().unwrap();
    sd::handle_sd_datagram(
        &sd_bytes(&subscribe_message(EVENTGROUP, 30, subscriber), 1),
        sd_source,
        &mut state,
    );

    let actions = sd::handle_sd_datagram(
        &sd_bytes(&subscribe_message(EVENTGROUP, 0, subscriber), 2),
        sd_source,
        &mut state,
    );

    let sub_key = SubscriptionKey {
        service_id: SERVICE,
        instance_id: INSTANCE,
        eventgroup_id: EVENTGROUP,
    };
    assert!(state.server_subscriptions[&sub_key].is_empty());
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::SendIpc { envelope, .. }
            if matches!(&envelope.body, IpcBody::SubscriptionChanged { added: false, .. })
    )));
}

#[test_log::test(tokio::test)]
async fn expired_subscription_stops_receiving() {
    let mut state = DaemonState::new(Config::default());
    let endpoint: SocketAddrV4 = "127.0.0.1:3000".parse().unwrap();
    state
        .insert_server(server(INSTANCE, endpoint, Transport::Udp, 5, 1000, 1))
        .unwrap();

    let sub_key = SubscriptionKey {
        service_id: SERVICE,
        instance_id: INSTANCE,
        eventgroup_id: EVENTGROUP,
    };
    state.server_subscriptions.insert(
        sub_key,
        vec![Subscription {
            subscriber: "192.168.1.50:40000".parse().unwrap(),
            transport: Transport::Udp,
            expires_at: Instant::now() - Duration::from_millis(1),
        }],
    );

    let actions = sd::handle_expiry_tick(&mut state, Instant::now());
    assert!(state.server_subscriptions[&sub_key].is_empty());
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::SendIpc { envelope, .. }
            if matches!(&envelope.body, IpcBody::SubscriptionChanged { added: false, .. })
    )));
}

// ============================================================================
// Client-side state machine
// ============================================================================

#[test_log::test(tokio::test)]
async fn offer_progresses_pending_subscription() {
    let mut state = DaemonState::new(Config::default());
    let key = client(&mut state, 1).await;
    state
        .local_clients
        .get_mut(&key)
        .unwrap()
        .subscriptions
        .insert(
            EVENTGROUP,
            ClientSubscription {
                ttl: 3,
                state: SubscribeState::PendingOffer { retry_at: None },
                failures: 0,
                tcp_local: None,
            },
        );

    let offer = offer_message(3, "192.168.1.60:3000".parse().unwrap(), L4Protocol::Udp);
    let from: SocketAddr = "192.168.1.60:30490".parse().unwrap();
    let actions = sd::handle_sd_datagram(&sd_bytes(&offer, 1), from, &mut state);

    assert!(actions.iter().any(|a| matches!(
        a,
        Action::SendSubscribe { client_key, eventgroup_id }
            if *client_key == key && *eventgroup_id == EVENTGROUP
    )));
    assert!(state.remote_offers.contains_key(&key));
}

#[test_log::test(tokio::test)]
async fn remote_offer_expires_within_ttl() {
    let mut state = DaemonState::new(Config::default());
    let key = client(&mut state, 1).await;

    let offer = offer_message(1, "192.168.1.60:3000".parse().unwrap(), L4Protocol::Udp);
    let from: SocketAddr = "192.168.1.60:30490".parse().unwrap();
    sd::handle_sd_datagram(&sd_bytes(&offer, 1), from, &mut state);
    assert!(state.remote_offers.contains_key(&key));

    // Before the TTL elapsed nothing happens
    sd::handle_expiry_tick(&mut state, Instant::now());
    assert!(state.remote_offers.contains_key(&key));

    // One tick after the TTL the record is gone
    sd::handle_expiry_tick(&mut state, Instant::now() + Duration::from_millis(1100));
    assert!(!state.remote_offers.contains_key(&key));
}

#[test_log::test(tokio::test)]
async fn stop_offer_tears_down_subscription_silently() {
    let mut state = DaemonState::new(Config::default());
    let key = client(&mut state, 1).await;
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

    let offer = offer_message(5, "192.168.1.60:3000".parse().unwrap(), L4Protocol::Udp);
    let from: SocketAddr = "192.168.1.60:30490".parse().unwrap();
    sd::handle_sd_datagram(&sd_bytes(&offer, 1), from, &mut state);

    let stop = offer_message(0, "192.168.1.60:3000".parse().unwrap(), L4Protocol::Udp);
    let actions = sd::handle_sd_datagram(&sd_bytes(&stop, 2), from, &mut state);

    assert!(!state.remote_offers.contains_key(&key));
    let sub = &state.local_clients[&key].subscriptions[&EVENTGROUP];
    assert!(matches!(
        sub.state,
        SubscribeState::PendingOffer { retry_at: None }
    ));
    // Teardown produces no SD traffic
    assert!(!actions
        .iter()
        .any(|a| matches!(a, Action::SendSd { .. } | Action::SendSubscribe { .. })));
}

#[test_log::test(tokio::test)]
async fn nack_backs_off_linearly() {
    let mut state = DaemonState::new(Config::default());
    let key = client(&mut state, 1).await;
    state
        .local_clients
        .get_mut(&key)
        .unwrap()
        .subscriptions
        .insert(
            EVENTGROUP,
            ClientSubscription {
                ttl: 3,
                state: SubscribeState::Subscribing {
                    deadline: Instant::now() + Duration::from_millis(300),
                },
                failures: 0,
                tcp_local: None,
            },
        );

    let mut nack = SdMessage::new(SdMessage::FLAG_REBOOT | SdMessage::FLAG_UNICAST);
    nack.add_entry(SdEntry::subscribe_eventgroup_nack(
        SERVICE, INSTANCE, 1, EVENTGROUP, 0,
    ));
    let from: SocketAddr = "192.168.1.60:30490".parse().unwrap();
    sd::handle_sd_datagram(&sd_bytes(&nack, 1), from, &mut state);

    let sub = &state.local_clients[&key].subscriptions[&EVENTGROUP];
    assert_eq!(sub.failures, 1);
    assert!(matches!(
        sub.state,
        SubscribeState::PendingOffer { retry_at: Some(_) }
    ));

    assert!(sd::subscribe_backoff(1) < sd::subscribe_backoff(4));
    assert_eq!(sd::subscribe_backoff(100), sd::subscribe_backoff(101));
}

#[test_log::test(tokio::test)]
async fn ack_moves_subscription_to_subscribed() {
    let mut state = DaemonState::new(Config::default());
    let key = client(&mut state, 1).await;

    let offer = offer_message(10, "192.168.1.60:3000".parse().unwrap(), L4Protocol::Udp);
    let from: SocketAddr = "192.168.1.60:30490".parse().unwrap();
    sd::handle_sd_datagram(&sd_bytes(&offer, 1), from, &mut state);

    state
        .local_clients
        .get_mut(&key)
        .unwrap()
        .subscriptions
        .insert(
            EVENTGROUP,
            ClientSubscription {
                ttl: 6,
                state: SubscribeState::Subscribing {
                    deadline: Instant::now() + Duration::from_millis(300),
                },
                failures: 2,
                tcp_local: None,
            },
        );

    let mut ack = SdMessage::new(SdMessage::FLAG_REBOOT | SdMessage::FLAG_UNICAST);
    ack.add_entry(SdEntry::subscribe_eventgroup_ack(
        SERVICE, INSTANCE, 1, EVENTGROUP, 6, 0,
    ));
    sd::handle_sd_datagram(&sd_bytes(&ack, 2), from, &mut state);

    let sub = &state.local_clients[&key].subscriptions[&EVENTGROUP];
    assert!(matches!(sub.state, SubscribeState::Subscribed { .. }));
    assert_eq!(sub.failures, 0);
}

// ============================================================================
// Peer reboot
// ============================================================================

#[test_log::test(tokio::test)]
async fn peer_reboot_evicts_its_offers() {
    let mut state = DaemonState::new(Config::default());
    let key = client(&mut state, 1).await;

    let offer = offer_message(100, "192.168.1.60:3000".parse().unwrap(), L4Protocol::Udp);
    let from: SocketAddr = "192.168.1.60:30490".parse().unwrap();
    sd::handle_sd_datagram(&sd_bytes(&offer, 5), from, &mut state);
    assert!(state.remote_offers.contains_key(&key));

    // Same peer, session id regressed with the reboot flag set: the
    // offer set is cleared, then the entries of this message re-add it.
    let mut empty = SdMessage::new(SdMessage::FLAG_REBOOT);
    empty.add_entry(SdEntry::find_service(0x9999, 1, 1, 0xFFFF_FFFF, 0));
    sd::handle_sd_datagram(&sd_bytes(&empty, 1), from, &mut state);
    assert!(!state.remote_offers.contains_key(&key));
}
