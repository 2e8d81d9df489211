//! # Service Discovery Engine (Internal)
//!
//! Handlers and builders for SOME/IP-SD messages, plus the timer-driven
//! producers: cyclic offer emission and the unified expiry tick.
//!
//! ## SD Entry Types
//!
//! | Entry | Direction | Purpose |
//! |-------|-----------|---------|
//! | `OfferService` | server → network | "this instance is reachable here" |
//! | `StopOfferService` | server → network | offer withdrawn (TTL = 0) |
//! | `FindService` | client → network | "who offers this service?" |
//! | `SubscribeEventgroup` | client → server | join an eventgroup |
//! | `StopSubscribeEventgroup` | client → server | leave (TTL = 0) |
//! | `SubscribeEventgroupAck` | server → client | subscription accepted |
//! | `SubscribeEventgroupNack` | server → client | rejected (TTL = 0) |
//!
//! ## Action Pattern
//!
//! Handlers never perform I/O. They mutate [`DaemonState`] and return
//! [`Action`] values; the event loop executes them. This keeps every
//! state transition synchronous and testable.
//!
//! ## Offer Packing
//!
//! Cyclic offers whose deadlines fall within a 20 ms tolerance window are
//! packed into a single SD message with interned options, so two
//! instances at the same endpoint share one option. The daemon has no
//! Initial Wait or Repetition phase: an instance enters the Main Phase on
//! `start_offer` and emits immediately, then cyclically.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::state::{
    CallKey, ClientKey, DaemonState, OfferState, RemoteOffer, SdChannel, ServerKey, SubscribeState,
    Subscription, SubscriptionKey,
};
use crate::ipc::{ConnId, Envelope, IpcBody};
use crate::wire::{EntryEndpoints, L4Protocol, SdEntry, SdEntryType, SdMessage, SdOption};
use crate::Transport;

/// Cyclic offers within this window are packed into one SD message.
pub const OFFER_PACK_TOLERANCE: Duration = Duration::from_millis(20);

/// Linear backoff step after a Subscribe Nack or response timeout.
const SUBSCRIBE_BACKOFF_STEP: Duration = Duration::from_millis(500);

/// Backoff cap for subscribe retries.
const SUBSCRIBE_BACKOFF_CAP: Duration = Duration::from_secs(5);

// ============================================================================
// ACTION TYPE
// ============================================================================

/// Side effect for the event loop to execute after a handler ran.
pub enum Action {
    /// Send an SD message. The executor assigns the session id from the
    /// unicast or multicast counter depending on the message's flags.
    SendSd {
        message: SdMessage,
        target: SocketAddr,
    },
    /// Send (or re-send) a SubscribeEventgroup for one client
    /// subscription. Resolved against the live remote offer at execution
    /// time; for TCP eventgroups the pool connection is established
    /// first.
    SendSubscribe {
        client_key: ClientKey,
        eventgroup_id: u16,
    },
    /// Send a data-plane message from a server instance's endpoint.
    SendServerMessage {
        key: ServerKey,
        data: Bytes,
        target: SocketAddr,
    },
    /// Send a data-plane message from a client instance.
    SendClientMessage {
        key: ClientKey,
        data: Bytes,
        target: SocketAddr,
        transport: Transport,
        /// Pending call to fail with NotConnected if the send fails.
        failure_key: Option<CallKey>,
    },
    /// Queue an envelope to an IPC connection.
    SendIpc { conn: ConnId, envelope: Envelope },
    /// Drop pool connections to a rebooted peer.
    ClosePoolPeer { peer: SocketAddr },
}

/// The backoff delay after `failures` consecutive subscribe failures.
pub fn subscribe_backoff(failures: u32) -> Duration {
    SUBSCRIBE_BACKOFF_STEP
        .saturating_mul(failures.max(1))
        .min(SUBSCRIBE_BACKOFF_CAP)
}

// ============================================================================
// INCOMING SD TRAFFIC
// ============================================================================

/// Handle one datagram received on the SD socket.
pub fn handle_sd_datagram(data: &[u8], from: SocketAddr, state: &mut DaemonState) -> Vec<Action> {
    let mut cursor = data;
    let (header, sd_message) = match SdMessage::parse_message(&mut cursor) {
        Ok(parsed) => parsed,
        Err(e) => {
            state.counters.decode_errors += 1;
            tracing::debug!("Dropping malformed SD datagram from {}: {}", from, e);
            return Vec::new();
        }
    };

    tracing::trace!(
        "SD from {}: session={} flags={:02x} {} entries",
        from,
        header.session_id,
        sd_message.flags,
        sd_message.entries.len()
    );

    let mut actions = Vec::new();

    let channel = if sd_message.flags & SdMessage::FLAG_UNICAST != 0 {
        SdChannel::Unicast
    } else {
        SdChannel::Multicast
    };
    let reboot_flag = sd_message.flags & SdMessage::FLAG_REBOOT != 0;
    if state.check_peer_reboot(from.ip(), channel, header.session_id, reboot_flag) {
        tracing::info!("Detected reboot of peer {}", from.ip());
        actions.extend(handle_peer_reboot(from.ip(), state));
    }

    for entry in &sd_message.entries {
        let endpoints = match sd_message.resolve_endpoints(entry) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                state.counters.decode_errors += 1;
                tracing::debug!("Dropping SD entry with bad option runs from {}: {}", from, e);
                continue;
            }
        };

        match entry.entry_type {
            SdEntryType::OfferService => {
                if entry.is_stop() {
                    handle_stop_offer(entry, state);
                } else {
                    handle_offer(entry, &endpoints, from, state, &mut actions);
                }
            }
            SdEntryType::FindService => {
                handle_find(entry, from, state, &mut actions);
            }
            SdEntryType::SubscribeEventgroup => {
                if entry.is_stop() {
                    handle_stop_subscribe(entry, &endpoints, state, &mut actions);
                } else {
                    handle_subscribe(entry, &endpoints, from, state, &mut actions);
                }
            }
            SdEntryType::SubscribeEventgroupAck => {
                if entry.is_stop() {
                    handle_subscribe_nack(entry, state);
                } else {
                    handle_subscribe_ack(entry, state);
                }
            }
        }
    }

    actions
}

/// Handle an `OfferService` entry: upsert the remote offer and progress
/// any local client subscriptions waiting for it.
fn handle_offer(
    entry: &SdEntry,
    endpoints: &EntryEndpoints,
    from: SocketAddr,
    state: &mut DaemonState,
    actions: &mut Vec<Action>,
) {
    // An endpoint option with an unspecified address means "use the
    // sender's address with the option's port".
    let fixup = |ep: Option<SocketAddr>| -> Option<SocketAddr> {
        ep.map(|ep| {
            if ep.ip().is_unspecified() {
                SocketAddr::new(from.ip(), ep.port())
            } else {
                ep
            }
        })
    };
    let udp_endpoint = fixup(endpoints.udp);
    let tcp_endpoint = fixup(endpoints.tcp);

    if udp_endpoint.is_none() && tcp_endpoint.is_none() {
        state.counters.protocol_violations += 1;
        tracing::debug!(
            "OfferService {:04x}:{:04x} from {} carries no endpoint option",
            entry.service_id,
            entry.instance_id,
            from
        );
        return;
    }

    let key = ClientKey {
        service_id: entry.service_id,
        instance_id: entry.instance_id,
    };
    let ttl = Duration::from_secs(u64::from(entry.ttl));

    tracing::debug!(
        "Remote offer {:04x}:{:04x} v{}.{} udp={:?} tcp={:?} TTL={}s",
        entry.service_id,
        entry.instance_id,
        entry.major_version,
        entry.minor_version,
        udp_endpoint,
        tcp_endpoint,
        entry.ttl
    );

    state.remote_offers.insert(
        key,
        RemoteOffer {
            major_version: entry.major_version,
            minor_version: entry.minor_version,
            udp_endpoint,
            tcp_endpoint,
            sd_source: from,
            expires_at: Instant::now() + ttl,
        },
    );

    // A client in PendingOffer whose versions match moves to Subscribing.
    if let Some(client) = state.local_clients.get(&key) {
        if client.schema.major_version == entry.major_version {
            for (eventgroup_id, sub) in &client.subscriptions {
                if let SubscribeState::PendingOffer { retry_at } = sub.state {
                    if retry_at.map_or(true, |at| at <= Instant::now()) {
                        actions.push(Action::SendSubscribe {
                            client_key: key,
                            eventgroup_id: *eventgroup_id,
                        });
                    }
                }
            }
        }
    }
}

/// Handle a `StopOfferService` entry: evict the offer and tear down
/// subscriptions without network traffic.
fn handle_stop_offer(entry: &SdEntry, state: &mut DaemonState) {
    let key = ClientKey {
        service_id: entry.service_id,
        instance_id: entry.instance_id,
    };

    if state.remote_offers.remove(&key).is_some() {
        tracing::debug!(
            "Remote offer {:04x}:{:04x} withdrawn",
            entry.service_id,
            entry.instance_id
        );
        reset_client_subscriptions(state, key);
    }
}

/// Put every subscription of the client back to PendingOffer, cancelling
/// response and refresh timers.
fn reset_client_subscriptions(state: &mut DaemonState, key: ClientKey) {
    if let Some(client) = state.local_clients.get_mut(&key) {
        for sub in client.subscriptions.values_mut() {
            sub.state = SubscribeState::PendingOffer { retry_at: None };
        }
    }
}

/// Handle a `FindService` entry: answer with unicast offers for every
/// matching Offering local instance, packed into one message.
fn handle_find(
    entry: &SdEntry,
    from: SocketAddr,
    state: &mut DaemonState,
    actions: &mut Vec<Action>,
) {
    let mut message = SdMessage::new(state.sd_flags(true));

    let matching: Vec<ServerKey> = state
        .local_servers
        .iter()
        .filter(|(key, server)| {
            server.state == OfferState::Offering
                && key.service_id == entry.service_id
                && (entry.instance_id == 0xFFFF || entry.instance_id == key.instance_id)
        })
        .map(|(key, _)| *key)
        .collect();

    for key in matching {
        let server = &state.local_servers[&key];
        push_offer_entry(&mut message, server);
    }

    if !message.entries.is_empty() {
        tracing::debug!(
            "Answering FindService {:04x}:{:04x} from {} with {} offer(s)",
            entry.service_id,
            entry.instance_id,
            from,
            message.entries.len()
        );
        actions.push(Action::SendSd {
            message,
            target: from,
        });
    }
}

/// Handle a `SubscribeEventgroup` entry (server side).
fn handle_subscribe(
    entry: &SdEntry,
    endpoints: &EntryEndpoints,
    from: SocketAddr,
    state: &mut DaemonState,
    actions: &mut Vec<Action>,
) {
    // The subscriber names its data endpoint in the option runs; its
    // protocol selects which of our instances the subscription targets.
    let candidate = [
        (endpoints.udp, Transport::Udp),
        (endpoints.tcp, Transport::Tcp),
    ]
    .into_iter()
    .find_map(|(ep, transport)| {
        let subscriber = ep?;
        let key = ServerKey {
            service_id: entry.service_id,
            instance_id: entry.instance_id,
            transport,
        };
        let server = state.local_servers.get(&key)?;
        (server.state == OfferState::Offering
            && server.schema.major_version == entry.major_version
            && server.schema.has_eventgroup(entry.eventgroup_id))
        .then_some((key, subscriber, transport))
    });

    let Some((server_key, subscriber, transport)) = candidate else {
        state.counters.protocol_violations += 1;
        tracing::warn!(
            "Rejecting subscription {:04x}:{:04x} v{} EG {:04x} from {}: no matching instance",
            entry.service_id,
            entry.instance_id,
            entry.major_version,
            entry.eventgroup_id,
            from
        );
        let mut nack = SdMessage::new(state.sd_flags(true));
        nack.add_entry(SdEntry::subscribe_eventgroup_nack(
            entry.service_id,
            entry.instance_id,
            entry.major_version,
            entry.eventgroup_id,
            entry.counter,
        ));
        actions.push(Action::SendSd {
            message: nack,
            target: from,
        });
        return;
    };

    let sub_key = SubscriptionKey {
        service_id: entry.service_id,
        instance_id: entry.instance_id,
        eventgroup_id: entry.eventgroup_id,
    };
    let expires_at = Instant::now() + Duration::from_secs(u64::from(entry.ttl));

    let subscribers = state.server_subscriptions.entry(sub_key).or_default();
    let existing = subscribers
        .iter_mut()
        .find(|sub| sub.subscriber == subscriber && sub.transport == transport);
    let is_new = existing.is_none();
    match existing {
        Some(sub) => {
            sub.expires_at = expires_at;
            tracing::debug!(
                "Renewed subscription EG {:04x} of {:04x}:{:04x} for {} (TTL={}s)",
                entry.eventgroup_id,
                entry.service_id,
                entry.instance_id,
                subscriber,
                entry.ttl
            );
        }
        None => {
            subscribers.push(Subscription {
                subscriber,
                transport,
                expires_at,
            });
            tracing::debug!(
                "New subscription EG {:04x} of {:04x}:{:04x} for {} via {:?} (TTL={}s)",
                entry.eventgroup_id,
                entry.service_id,
                entry.instance_id,
                subscriber,
                transport,
                entry.ttl
            );
        }
    }

    let server = &state.local_servers[&server_key];

    // Ack echoes the client's TTL and carries our endpoint option for
    // the eventgroup's transport.
    let mut ack = SdMessage::new(state.sd_flags(true));
    let opt_idx = ack.intern_option(SdOption::Ipv4Endpoint {
        addr: *server.endpoint.ip(),
        port: server.endpoint.port(),
        protocol: L4Protocol::from(transport),
    });
    let mut ack_entry = SdEntry::subscribe_eventgroup_ack(
        entry.service_id,
        entry.instance_id,
        entry.major_version,
        entry.eventgroup_id,
        entry.ttl,
        entry.counter,
    );
    ack_entry.index_1st_option = opt_idx;
    ack_entry.num_options_1 = 1;
    ack.add_entry(ack_entry);
    actions.push(Action::SendSd {
        message: ack,
        target: from,
    });

    // The owning application learns about new subscribers; renewals stay
    // internal.
    if is_new {
        if let SocketAddr::V4(subscriber_v4) = subscriber {
            let handle = server.handle;
            let conn = server.owner;
            let correlation_id = state.next_ipc_correlation();
            actions.push(Action::SendIpc {
                conn,
                envelope: Envelope::new(
                    correlation_id,
                    IpcBody::SubscriptionChanged {
                        handle,
                        eventgroup_id: entry.eventgroup_id,
                        subscriber: subscriber_v4,
                        added: true,
                    },
                ),
            });
        }
    }
}

/// Handle a `StopSubscribeEventgroup` entry (server side).
fn handle_stop_subscribe(
    entry: &SdEntry,
    endpoints: &EntryEndpoints,
    state: &mut DaemonState,
    actions: &mut Vec<Action>,
) {
    let sub_key = SubscriptionKey {
        service_id: entry.service_id,
        instance_id: entry.instance_id,
        eventgroup_id: entry.eventgroup_id,
    };

    let Some(subscribers) = state.server_subscriptions.get_mut(&sub_key) else {
        return;
    };

    let targets = [endpoints.udp, endpoints.tcp];
    let mut removed = Vec::new();
    subscribers.retain(|sub| {
        if targets.contains(&Some(sub.subscriber)) {
            removed.push((sub.subscriber, sub.transport));
            false
        } else {
            true
        }
    });

    for (subscriber, transport) in removed {
        tracing::debug!(
            "Subscription EG {:04x} of {:04x}:{:04x} stopped by {}",
            entry.eventgroup_id,
            entry.service_id,
            entry.instance_id,
            subscriber
        );
        notify_subscription_removed(state, entry, subscriber, transport, actions);
    }
}

fn notify_subscription_removed(
    state: &mut DaemonState,
    entry: &SdEntry,
    subscriber: SocketAddr,
    transport: Transport,
    actions: &mut Vec<Action>,
) {
    let server_key = ServerKey {
        service_id: entry.service_id,
        instance_id: entry.instance_id,
        transport,
    };
    let Some(server) = state.local_servers.get(&server_key) else {
        return;
    };
    let SocketAddr::V4(subscriber_v4) = subscriber else {
        return;
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
                eventgroup_id: entry.eventgroup_id,
                subscriber: subscriber_v4,
                added: false,
            },
        ),
    });
}

/// Handle a `SubscribeEventgroupAck` (client side).
fn handle_subscribe_ack(entry: &SdEntry, state: &mut DaemonState) {
    let key = ClientKey {
        service_id: entry.service_id,
        instance_id: entry.instance_id,
    };

    let offer_ttl = state
        .remote_offers
        .get(&key)
        .map(|offer| u64::from(entry.ttl).min(offer.expires_at.duration_since(Instant::now()).as_secs().max(1)));

    let Some(client) = state.local_clients.get_mut(&key) else {
        state.counters.protocol_violations += 1;
        return;
    };
    let Some(sub) = client.subscriptions.get_mut(&entry.eventgroup_id) else {
        state.counters.protocol_violations += 1;
        tracing::debug!(
            "SubscribeAck for unknown eventgroup {:04x} of {:04x}:{:04x}",
            entry.eventgroup_id,
            entry.service_id,
            entry.instance_id
        );
        return;
    };

    if !matches!(sub.state, SubscribeState::Subscribing { .. }) {
        // Late or duplicate ack; harmless.
        return;
    }

    // Refresh at half the subscription TTL, clamped to the remaining
    // offer TTL.
    let refresh_secs = (u64::from(sub.ttl) / 2)
        .max(1)
        .min(offer_ttl.unwrap_or(u64::from(sub.ttl)));
    sub.state = SubscribeState::Subscribed {
        refresh_at: Instant::now() + Duration::from_secs(refresh_secs),
    };
    sub.failures = 0;

    tracing::debug!(
        "Subscription EG {:04x} of {:04x}:{:04x} acknowledged, refresh in {}s",
        entry.eventgroup_id,
        entry.service_id,
        entry.instance_id,
        refresh_secs
    );
}

/// Handle a `SubscribeEventgroupNack` (client side): back off linearly
/// and wait in PendingOffer.
fn handle_subscribe_nack(entry: &SdEntry, state: &mut DaemonState) {
    let key = ClientKey {
        service_id: entry.service_id,
        instance_id: entry.instance_id,
    };
    let Some(client) = state.local_clients.get_mut(&key) else {
        return;
    };
    let Some(sub) = client.subscriptions.get_mut(&entry.eventgroup_id) else {
        return;
    };

    sub.failures = sub.failures.saturating_add(1);
    let backoff = subscribe_backoff(sub.failures);
    sub.state = SubscribeState::PendingOffer {
        retry_at: Some(Instant::now() + backoff),
    };

    tracing::warn!(
        "Subscription EG {:04x} of {:04x}:{:04x} rejected, retrying in {:?}",
        entry.eventgroup_id,
        entry.service_id,
        entry.instance_id,
        backoff
    );
}

/// Evict everything learned from a peer that just rebooted.
fn handle_peer_reboot(peer: IpAddr, state: &mut DaemonState) -> Vec<Action> {
    let mut actions = Vec::new();

    // Remote offers from the peer disappear; dependent subscriptions
    // fall back to PendingOffer.
    let stale: Vec<ClientKey> = state
        .remote_offers
        .iter()
        .filter(|(_, offer)| offer.sd_source.ip() == peer)
        .map(|(key, _)| *key)
        .collect();
    for key in stale {
        if let Some(offer) = state.remote_offers.remove(&key) {
            reset_client_subscriptions(state, key);
            if let Some(tcp) = offer.tcp_endpoint {
                actions.push(Action::ClosePoolPeer { peer: tcp });
            }
        }
    }

    // The peer's subscriptions to our instances are stale too.
    let mut removed: Vec<(SubscriptionKey, SocketAddr, Transport)> = Vec::new();
    for (sub_key, subscribers) in state.server_subscriptions.iter_mut() {
        subscribers.retain(|sub| {
            if sub.subscriber.ip() == peer {
                removed.push((*sub_key, sub.subscriber, sub.transport));
                false
            } else {
                true
            }
        });
    }
    for (sub_key, subscriber, transport) in removed {
        let entry = SdEntry::subscribe_eventgroup(
            sub_key.service_id,
            sub_key.instance_id,
            0,
            sub_key.eventgroup_id,
            0,
            0,
        );
        notify_subscription_removed(state, &entry, subscriber, transport, &mut actions);
    }

    actions
}

// ============================================================================
// OFFER EMISSION
// ============================================================================

/// Mark a server instance Offering and schedule its first emission now.
///
/// Surfaces the TTL/cycle misconfiguration as a warning: a subscription
/// TTL shorter than the offer period briefly expires between renewals.
pub fn start_offer(state: &mut DaemonState, key: ServerKey) {
    let Some(server) = state.local_servers.get_mut(&key) else {
        return;
    };
    if server.state == OfferState::Offering {
        return;
    }

    if u128::from(server.ttl) * 1000 < server.cyclic_offer_delay.as_millis() {
        tracing::warn!(
            "Instance {:04x}:{:04x}: TTL {}s is shorter than the cyclic offer delay {:?}; \
             offers will expire between emissions",
            key.service_id,
            key.instance_id,
            server.ttl,
            server.cyclic_offer_delay
        );
    }

    server.state = OfferState::Offering;
    server.next_offer_at = Some(Instant::now());
    tracing::info!(
        "Offering {:04x}:{:04x} on {} ({:?}) every {:?}",
        key.service_id,
        key.instance_id,
        server.endpoint,
        key.transport,
        server.cyclic_offer_delay
    );
}

/// Take a server instance out of Offering and emit one Stop-Offer.
pub fn stop_offer(state: &mut DaemonState, key: ServerKey) -> Vec<Action> {
    let Some(server) = state.local_servers.get_mut(&key) else {
        return Vec::new();
    };
    if server.state == OfferState::Down {
        return Vec::new();
    }
    server.state = OfferState::Down;
    server.next_offer_at = None;

    let mut message = SdMessage::new(state.sd_flags(false));
    let server = &state.local_servers[&key];
    message.add_entry(SdEntry::stop_offer_service(
        key.service_id,
        key.instance_id,
        server.schema.major_version,
        server.schema.minor_version,
    ));

    // Subscriptions die with the offer.
    state.server_subscriptions.retain(|sub_key, _| {
        !(sub_key.service_id == key.service_id && sub_key.instance_id == key.instance_id)
    });

    tracing::info!("Stopped offering {:04x}:{:04x}", key.service_id, key.instance_id);

    vec![Action::SendSd {
        message,
        target: state.sd_multicast_target(),
    }]
}

fn push_offer_entry(message: &mut SdMessage, server: &super::state::LocalServer) {
    let opt_idx = message.intern_option(SdOption::Ipv4Endpoint {
        addr: *server.endpoint.ip(),
        port: server.endpoint.port(),
        protocol: L4Protocol::from(server.transport),
    });
    let mut entry = SdEntry::offer_service(
        server.schema.service_id,
        server.instance_id,
        server.schema.major_version,
        server.schema.minor_version,
        server.ttl,
    );
    entry.index_1st_option = opt_idx;
    entry.num_options_1 = 1;
    message.add_entry(entry);
}

/// The earliest pending cyclic offer deadline, if any instance offers.
pub fn next_offer_deadline(state: &DaemonState) -> Option<Instant> {
    state
        .local_servers
        .values()
        .filter_map(|server| server.next_offer_at)
        .min()
}

/// Emit all offers due within the packing tolerance as one SD message.
pub fn emit_cyclic_offers(state: &mut DaemonState, now: Instant) -> Vec<Action> {
    let due: Vec<ServerKey> = state
        .local_servers
        .iter()
        .filter(|(_, server)| {
            server
                .next_offer_at
                .is_some_and(|at| at <= now + OFFER_PACK_TOLERANCE)
        })
        .map(|(key, _)| *key)
        .collect();

    if due.is_empty() {
        return Vec::new();
    }

    let mut message = SdMessage::new(state.sd_flags(false));
    for key in due {
        let Some(server) = state.local_servers.get_mut(&key) else {
            continue;
        };
        // Reschedule from the planned time, not from now, so the cadence
        // stays strictly periodic.
        if let Some(planned) = server.next_offer_at {
            let mut next = planned + server.cyclic_offer_delay;
            while next <= now {
                next += server.cyclic_offer_delay;
            }
            server.next_offer_at = Some(next);
        }
        push_offer_entry(&mut message, &state.local_servers[&key]);
    }

    tracing::trace!(
        "Cyclic SD emission: {} offer(s), {} option(s)",
        message.entries.len(),
        message.options.len()
    );

    vec![Action::SendSd {
        message,
        target: state.sd_multicast_target(),
    }]
}

// ============================================================================
// EXPIRY TICK
// ============================================================================

/// One pass of the unified timer wheel (every 50 ms): remote-offer TTLs,
/// server subscription TTLs, pending call deadlines, pending reply
/// deadlines, and the client subscribe state machines.
pub fn handle_expiry_tick(state: &mut DaemonState, now: Instant) -> Vec<Action> {
    let mut actions = Vec::new();

    // Remote offers past their TTL: evict, observers fall to
    // not-available, subscriptions reset without traffic.
    let expired: Vec<ClientKey> = state
        .remote_offers
        .iter()
        .filter(|(_, offer)| offer.expires_at <= now)
        .map(|(key, _)| *key)
        .collect();
    for key in expired {
        tracing::info!(
            "Remote offer {:04x}:{:04x} expired",
            key.service_id,
            key.instance_id
        );
        state.remote_offers.remove(&key);
        reset_client_subscriptions(state, key);
    }

    // Server-side subscriptions past their TTL stop receiving events.
    let mut expired_subs: Vec<(SubscriptionKey, SocketAddr, Transport)> = Vec::new();
    for (sub_key, subscribers) in state.server_subscriptions.iter_mut() {
        subscribers.retain(|sub| {
            if sub.expires_at <= now {
                expired_subs.push((*sub_key, sub.subscriber, sub.transport));
                false
            } else {
                true
            }
        });
    }
    for (sub_key, subscriber, transport) in expired_subs {
        tracing::debug!(
            "Subscription EG {:04x} of {:04x}:{:04x} from {} expired",
            sub_key.eventgroup_id,
            sub_key.service_id,
            sub_key.instance_id,
            subscriber
        );
        let entry = SdEntry::subscribe_eventgroup(
            sub_key.service_id,
            sub_key.instance_id,
            0,
            sub_key.eventgroup_id,
            0,
            0,
        );
        notify_subscription_removed(state, &entry, subscriber, transport, &mut actions);
    }

    // Pending method calls past their deadline fail with Timeout.
    let timed_out: Vec<CallKey> = state
        .pending_calls
        .iter()
        .filter(|(_, call)| call.deadline <= now)
        .map(|(key, _)| *key)
        .collect();
    for call_key in timed_out {
        if let Some(call) = state.pending_calls.remove(&call_key) {
            tracing::debug!(
                "Method call session {:04x} of client {:04x} timed out",
                call_key.session_id,
                call_key.client_id
            );
            actions.push(Action::SendIpc {
                conn: call.conn,
                envelope: Envelope::new(
                    call.correlation_id,
                    IpcBody::Error {
                        code: crate::ipc::proto::IPC_ERR_TIMEOUT,
                        message: "method call timed out".to_string(),
                    },
                ),
            });
        }
    }

    // Forwarded requests the application never answered are dropped; the
    // remote caller runs its own timeout.
    let stale_replies: Vec<u32> = state
        .pending_replies
        .iter()
        .filter(|(_, reply)| reply.deadline <= now)
        .map(|(corr, _)| *corr)
        .collect();
    for corr in stale_replies {
        if let Some(reply) = state.pending_replies.remove(&corr) {
            state.counters.dropped_responses += 1;
            tracing::warn!(
                "Application never answered request session {:04x} from {}; dropping",
                reply.session_id,
                reply.peer
            );
        }
    }

    // Client subscribe state machines: response timeouts, retry backoff,
    // refresh timers.
    let mut subscribe_actions: Vec<(ClientKey, u16)> = Vec::new();
    for (client_key, client) in state.local_clients.iter_mut() {
        let offer_live = state.remote_offers.contains_key(client_key);
        for (eventgroup_id, sub) in client.subscriptions.iter_mut() {
            match sub.state {
                SubscribeState::Subscribing { deadline } if deadline <= now => {
                    sub.failures = sub.failures.saturating_add(1);
                    let backoff = subscribe_backoff(sub.failures);
                    sub.state = SubscribeState::PendingOffer {
                        retry_at: Some(now + backoff),
                    };
                    tracing::debug!(
                        "Subscribe EG {:04x} of {:04x}:{:04x} unanswered, retrying in {:?}",
                        eventgroup_id,
                        client_key.service_id,
                        client_key.instance_id,
                        backoff
                    );
                }
                SubscribeState::PendingOffer {
                    retry_at: Some(retry_at),
                } if retry_at <= now => {
                    if offer_live {
                        subscribe_actions.push((*client_key, *eventgroup_id));
                    } else {
                        sub.state = SubscribeState::PendingOffer { retry_at: None };
                    }
                }
                SubscribeState::Subscribed { refresh_at } if refresh_at <= now => {
                    if offer_live {
                        subscribe_actions.push((*client_key, *eventgroup_id));
                    } else {
                        sub.state = SubscribeState::PendingOffer { retry_at: None };
                    }
                }
                _ => {}
            }
        }
    }
    for (client_key, eventgroup_id) in subscribe_actions {
        actions.push(Action::SendSubscribe {
            client_key,
            eventgroup_id,
        });
    }

    actions
}

// ============================================================================
// MESSAGE BUILDERS
// ============================================================================

/// Build a `SubscribeEventgroup` message with the client's endpoint option.
pub fn build_subscribe_message(
    service_id: u16,
    instance_id: u16,
    major_version: u8,
    eventgroup_id: u16,
    ttl: u32,
    endpoint: SocketAddr,
    transport: Transport,
    flags: u8,
) -> SdMessage {
    let mut message = SdMessage::new(flags);
    let opt_idx = message.intern_option(endpoint_option(endpoint, transport));
    let mut entry = SdEntry::subscribe_eventgroup(
        service_id,
        instance_id,
        major_version,
        eventgroup_id,
        ttl,
        0,
    );
    entry.index_1st_option = opt_idx;
    entry.num_options_1 = 1;
    message.add_entry(entry);
    message
}

/// Build a `StopSubscribeEventgroup` message (TTL = 0, same endpoint
/// option so the server can identify the subscriber to remove).
pub fn build_stop_subscribe_message(
    service_id: u16,
    instance_id: u16,
    major_version: u8,
    eventgroup_id: u16,
    endpoint: SocketAddr,
    transport: Transport,
    flags: u8,
) -> SdMessage {
    build_subscribe_message(
        service_id,
        instance_id,
        major_version,
        eventgroup_id,
        0,
        endpoint,
        transport,
        flags,
    )
}

fn endpoint_option(endpoint: SocketAddr, transport: Transport) -> SdOption {
    let addr = match endpoint {
        SocketAddr::V4(v4) => *v4.ip(),
        SocketAddr::V6(_) => std::net::Ipv4Addr::LOCALHOST,
    };
    SdOption::Ipv4Endpoint {
        addr,
        port: endpoint.port(),
        protocol: L4Protocol::from(transport),
    }
}

impl DaemonState {
    /// The configured SD multicast destination.
    pub fn sd_multicast_target(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.config.sd_address), self.config.sd_port)
    }
}
