//! # Daemon State (Internal)
//!
//! All mutable daemon state lives in [`DaemonState`]. The event loop owns
//! this structure exclusively; handler functions in the sibling modules
//! take `&mut DaemonState` and return [`Action`](super::sd::Action) values
//! for the loop to execute, so no locks are needed anywhere.
//!
//! ## Registry Directories
//!
//! | Directory | Key | Value |
//! |-----------|-----|-------|
//! | `local_servers` | (service, instance, transport) | [`LocalServer`] |
//! | `local_clients` | (service, instance) | [`LocalClient`] |
//! | `remote_offers` | (service, instance) | [`RemoteOffer`] |
//! | `server_subscriptions` | (service, instance, eventgroup) | [`Subscription`] set |
//!
//! All mutations go through the registry methods so the one-instance-per
//! (service, instance, transport) invariant is enforced at insertion.
//!
//! ## Session Id Management
//!
//! SD session ids are 16-bit, wrap from 0xFFFF to 0x0001 and never use
//! 0x0000. Multicast and unicast SD keep separate counters, and the
//! reboot flag stays set until the counter wraps for the first time.
//! Incoming SD traffic is checked against per-peer session state so a
//! rebooted peer's stale offers and subscriptions can be evicted.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::Error;
use crate::ipc::ConnId;
use crate::tcp::TcpServer;
use crate::{ServiceSchema, Transport};

// ============================================================================
// KEYS
// ============================================================================

/// Key of a local server instance. The transport is part of the key:
/// at most one instance may exist per (service, instance, transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub service_id: u16,
    pub instance_id: u16,
    pub transport: Transport,
}

/// Key of a local client instance or a remote offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub service_id: u16,
    pub instance_id: u16,
}

/// Key of a server-side subscription set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub service_id: u16,
    pub instance_id: u16,
    pub eventgroup_id: u16,
}

/// Key of an in-flight method call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub client_id: u16,
    pub session_id: u16,
}

// ============================================================================
// NETWORK EVENT PLUMBING
// ============================================================================

/// Tag attached to TCP events so the loop knows which socket they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpTag {
    /// Frame arrived on the listener of this server instance.
    Server(ServerKey),
    /// Frame arrived on an outgoing pool connection.
    ClientPool,
}

/// Datagrams the UDP reader tasks feed into the event loop. TCP traffic
/// arrives on its own channel as [`TcpEvent<TcpTag>`].
#[derive(Debug)]
pub enum NetEvent {
    /// Datagram on a server instance's UDP socket.
    ServerDatagram {
        key: ServerKey,
        data: Bytes,
        from: SocketAddr,
    },
    /// Datagram on a client instance's UDP socket.
    ClientDatagram {
        key: ClientKey,
        data: Bytes,
        from: SocketAddr,
    },
}

// ============================================================================
// SD SESSION TRACKING
// ============================================================================

/// SD channel kinds; each keeps its own session counter per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdChannel {
    Multicast,
    Unicast,
}

/// Outgoing SD session counter with reboot flag semantics.
///
/// Starts at 1 with the reboot flag set; the flag clears once the
/// counter wraps from 0xFFFF back to 1.
#[derive(Debug)]
pub struct SessionCounter {
    next: u16,
    reboot: bool,
}

impl Default for SessionCounter {
    fn default() -> Self {
        Self {
            next: 1,
            reboot: true,
        }
    }
}

impl SessionCounter {
    /// Take the next session id and the current reboot flag.
    pub fn next(&mut self) -> (u16, bool) {
        let id = self.next;
        let reboot = self.reboot;
        self.next = match self.next.checked_add(1) {
            Some(n) => n,
            None => {
                self.reboot = false;
                1
            }
        };
        (id, reboot)
    }
}

/// Last observed SD session state of one (peer, channel).
#[derive(Debug, Clone, Copy)]
pub struct PeerSdState {
    pub last_session_id: u16,
    pub last_reboot_flag: bool,
}

impl PeerSdState {
    /// Update with a newly received (session id, reboot flag) pair and
    /// report whether the peer rebooted since the last message.
    ///
    /// A reboot shows as the flag turning on again, or as a session id
    /// regression while the flag is still set.
    pub fn check_reboot_and_update(&mut self, session_id: u16, reboot_flag: bool) -> bool {
        let rebooted = (reboot_flag && !self.last_reboot_flag)
            || (reboot_flag && self.last_reboot_flag && session_id <= self.last_session_id);
        self.last_session_id = session_id;
        self.last_reboot_flag = reboot_flag;
        rebooted
    }
}

// ============================================================================
// LOCAL SERVER INSTANCES
// ============================================================================

/// Offer state machine of a local server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferState {
    Down,
    Offering,
}

/// A service instance offered by a local application.
pub struct LocalServer {
    pub handle: u32,
    pub owner: ConnId,
    pub schema: ServiceSchema,
    pub instance_id: u16,
    pub endpoint: SocketAddrV4,
    pub transport: Transport,
    pub ttl: u32,
    pub cyclic_offer_delay: Duration,
    pub state: OfferState,
    /// Next cyclic offer emission, set while Offering.
    pub next_offer_at: Option<Instant>,
    /// Session counter for outgoing notifications of this instance.
    pub notification_session: u16,
    /// UDP data socket (UDP transport only).
    pub udp_socket: Option<Arc<UdpSocket>>,
    /// TCP listener (TCP transport only).
    pub tcp_server: Option<TcpServer>,
    /// Reader task of the UDP socket, aborted on removal.
    pub reader: Option<tokio::task::AbortHandle>,
}

impl LocalServer {
    pub fn key(&self) -> ServerKey {
        ServerKey {
            service_id: self.schema.service_id,
            instance_id: self.instance_id,
            transport: self.transport,
        }
    }

    /// Next session id for a notification sent by this instance.
    pub fn next_notification_session(&mut self) -> u16 {
        let id = self.notification_session;
        self.notification_session = match self.notification_session.checked_add(1) {
            Some(n) => n,
            None => 1,
        };
        id
    }
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

/// One remote subscriber of a local eventgroup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub subscriber: SocketAddr,
    pub transport: Transport,
    pub expires_at: Instant,
}

// ============================================================================
// LOCAL CLIENT INSTANCES
// ============================================================================

/// Subscribe state machine of one (client instance, eventgroup).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeState {
    /// Waiting for a matching remote offer (or for the retry backoff).
    PendingOffer { retry_at: Option<Instant> },
    /// Subscribe sent, waiting for the Ack.
    Subscribing { deadline: Instant },
    /// Acknowledged; periodically refreshed.
    Subscribed { refresh_at: Instant },
}

/// A client-side eventgroup subscription.
#[derive(Debug, Clone)]
pub struct ClientSubscription {
    pub ttl: u32,
    pub state: SubscribeState,
    /// Consecutive Nack/timeout failures, drives the linear backoff.
    pub failures: u32,
    /// Our local address on the TCP connection used for this subscription.
    pub tcp_local: Option<SocketAddr>,
}

/// A service client registered by a local application.
pub struct LocalClient {
    pub handle: u32,
    pub owner: ConnId,
    pub schema: ServiceSchema,
    pub instance_id: u16,
    pub endpoint: SocketAddrV4,
    pub client_id: u16,
    /// Next session id to try for an outgoing request.
    pub next_session: u16,
    /// Eventgroup id → subscription state.
    pub subscriptions: HashMap<u16, ClientSubscription>,
    /// UDP data socket for requests, responses, and UDP events.
    pub udp_socket: Arc<UdpSocket>,
    /// Reader task of the UDP socket, aborted on removal.
    pub reader: tokio::task::AbortHandle,
}

impl LocalClient {
    pub fn key(&self) -> ClientKey {
        ClientKey {
            service_id: self.schema.service_id,
            instance_id: self.instance_id,
        }
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ============================================================================
// REMOTE STATE
// ============================================================================

/// A remotely offered service instance, observed via SD.
#[derive(Debug, Clone)]
pub struct RemoteOffer {
    pub major_version: u8,
    pub minor_version: u32,
    pub udp_endpoint: Option<SocketAddr>,
    pub tcp_endpoint: Option<SocketAddr>,
    /// Source of the offer; Subscribe entries are unicast back here.
    pub sd_source: SocketAddr,
    pub expires_at: Instant,
}

impl RemoteOffer {
    /// Pick the data endpoint, preferring UDP when both are offered.
    pub fn endpoint(&self) -> Option<(SocketAddr, Transport)> {
        self.udp_endpoint
            .map(|ep| (ep, Transport::Udp))
            .or_else(|| self.tcp_endpoint.map(|ep| (ep, Transport::Tcp)))
    }

    /// The endpoint for a specific transport.
    pub fn endpoint_for(&self, transport: Transport) -> Option<SocketAddr> {
        match transport {
            Transport::Udp => self.udp_endpoint,
            Transport::Tcp => self.tcp_endpoint,
        }
    }
}

// ============================================================================
// PENDING WORK
// ============================================================================

/// An in-flight method call awaiting its response.
#[derive(Debug)]
pub struct PendingCall {
    pub client_key: ClientKey,
    pub conn: ConnId,
    pub correlation_id: u32,
    pub deadline: Instant,
}

/// A forwarded request awaiting the application's reply.
#[derive(Debug)]
pub struct PendingReply {
    pub server_key: ServerKey,
    pub method_id: u16,
    pub client_id: u16,
    pub session_id: u16,
    pub interface_version: u8,
    pub peer: SocketAddr,
    pub deadline: Instant,
}

/// Drop counters, logged at debug on every expiry tick that evicts work.
#[derive(Debug, Default)]
pub struct Counters {
    pub decode_errors: u64,
    pub protocol_violations: u64,
    pub dropped_events: u64,
    pub dropped_responses: u64,
}

// ============================================================================
// DAEMON STATE
// ============================================================================

/// Top-level state container, owned by the event loop.
pub struct DaemonState {
    pub config: Config,

    // Registry directories
    pub local_servers: HashMap<ServerKey, LocalServer>,
    pub local_clients: HashMap<ClientKey, LocalClient>,
    pub remote_offers: HashMap<ClientKey, RemoteOffer>,
    pub server_subscriptions: HashMap<SubscriptionKey, Vec<Subscription>>,

    // Handle lookup
    pub server_handles: HashMap<u32, ServerKey>,
    pub client_handles: HashMap<u32, ClientKey>,

    // In-flight work
    pub pending_calls: HashMap<CallKey, PendingCall>,
    pub pending_replies: HashMap<u32, PendingReply>,

    // IPC connections (writer queues)
    pub ipc_conns: HashMap<ConnId, mpsc::Sender<Bytes>>,

    // SD session state
    pub mcast_session: SessionCounter,
    pub ucast_session: SessionCounter,
    pub peer_sessions: HashMap<(IpAddr, SdChannel), PeerSdState>,

    pub counters: Counters,

    next_handle: u32,
    next_client_id: u16,
    next_ipc_correlation: u32,
}

impl DaemonState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            local_servers: HashMap::new(),
            local_clients: HashMap::new(),
            remote_offers: HashMap::new(),
            server_subscriptions: HashMap::new(),
            server_handles: HashMap::new(),
            client_handles: HashMap::new(),
            pending_calls: HashMap::new(),
            pending_replies: HashMap::new(),
            ipc_conns: HashMap::new(),
            mcast_session: SessionCounter::default(),
            ucast_session: SessionCounter::default(),
            peer_sessions: HashMap::new(),
            counters: Counters::default(),
            next_handle: 1,
            next_client_id: 1,
            next_ipc_correlation: 1,
        }
    }

    /// Allocate an instance handle for IPC.
    pub fn next_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        handle
    }

    /// Allocate a client id for a new client instance.
    pub fn next_client_id(&mut self) -> u16 {
        let id = self.next_client_id;
        self.next_client_id = match self.next_client_id.checked_add(1) {
            Some(n) => n,
            None => 1,
        };
        id
    }

    /// Allocate a correlation id for daemon-initiated IPC messages.
    pub fn next_ipc_correlation(&mut self) -> u32 {
        let id = self.next_ipc_correlation;
        self.next_ipc_correlation = self.next_ipc_correlation.wrapping_add(1).max(1);
        id
    }

    /// Insert a server instance, enforcing uniqueness per
    /// (service, instance, transport).
    pub fn insert_server(&mut self, server: LocalServer) -> Result<(), Error> {
        let key = server.key();
        if self.local_servers.contains_key(&key) {
            return Err(Error::AlreadyOffered);
        }
        self.server_handles.insert(server.handle, key);
        self.local_servers.insert(key, server);
        Ok(())
    }

    /// Remove a server instance and everything keyed to it.
    pub fn remove_server(&mut self, key: ServerKey) -> Option<LocalServer> {
        let server = self.local_servers.remove(&key)?;
        self.server_handles.remove(&server.handle);
        self.server_subscriptions.retain(|sub_key, _| {
            !(sub_key.service_id == key.service_id && sub_key.instance_id == key.instance_id)
        });
        Some(server)
    }

    /// Insert a client instance, one per (service, instance).
    pub fn insert_client(&mut self, client: LocalClient) -> Result<(), Error> {
        let key = client.key();
        if self.local_clients.contains_key(&key) {
            return Err(Error::AlreadyOffered);
        }
        self.client_handles.insert(client.handle, key);
        self.local_clients.insert(key, client);
        Ok(())
    }

    /// Remove a client instance, dropping its pending calls.
    pub fn remove_client(&mut self, key: ClientKey) -> Option<LocalClient> {
        let client = self.local_clients.remove(&key)?;
        self.client_handles.remove(&client.handle);
        self.pending_calls.retain(|_, call| call.client_key != key);
        Some(client)
    }

    /// Look up a server instance by IPC handle.
    pub fn server_by_handle(&mut self, handle: u32) -> Option<(ServerKey, &mut LocalServer)> {
        let key = *self.server_handles.get(&handle)?;
        self.local_servers.get_mut(&key).map(|server| (key, server))
    }

    /// Look up a client instance by IPC handle.
    pub fn client_by_handle(&mut self, handle: u32) -> Option<(ClientKey, &mut LocalClient)> {
        let key = *self.client_handles.get(&handle)?;
        self.local_clients.get_mut(&key).map(|client| (key, client))
    }

    /// Compute the SD flags byte for an outgoing message without
    /// consuming a session id (the executor assigns those at send time).
    pub fn sd_flags(&self, unicast: bool) -> u8 {
        let counter = if unicast {
            &self.ucast_session
        } else {
            &self.mcast_session
        };
        let mut flags = 0;
        if counter.reboot {
            flags |= crate::wire::SdMessage::FLAG_REBOOT;
        }
        if unicast {
            flags |= crate::wire::SdMessage::FLAG_UNICAST;
        }
        flags
    }

    /// Record an incoming SD message's session state and detect reboot.
    pub fn check_peer_reboot(
        &mut self,
        peer: IpAddr,
        channel: SdChannel,
        session_id: u16,
        reboot_flag: bool,
    ) -> bool {
        match self.peer_sessions.get_mut(&(peer, channel)) {
            Some(peer_state) => peer_state.check_reboot_and_update(session_id, reboot_flag),
            None => {
                self.peer_sessions.insert(
                    (peer, channel),
                    PeerSdState {
                        last_session_id: session_id,
                        last_reboot_flag: reboot_flag,
                    },
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn session_counter_wraps_and_clears_reboot() {
        let mut counter = SessionCounter::default();
        let (first, reboot) = counter.next();
        assert_eq!(first, 1);
        assert!(reboot);

        for _ in 0..0xFFFE {
            counter.next();
        }
        // The counter has handed out 0xFFFF ids; the next is 1 again with
        // the reboot flag cleared.
        let (wrapped, reboot) = counter.next();
        assert_eq!(wrapped, 1);
        assert!(!reboot);
    }

    #[test_log::test]
    fn reboot_detected_on_session_regression() {
        let mut peer = PeerSdState {
            last_session_id: 100,
            last_reboot_flag: true,
        };
        // Normal progression: no reboot
        assert!(!peer.check_reboot_and_update(101, true));
        // Regression with the flag still set: reboot
        assert!(peer.check_reboot_and_update(3, true));
    }

    #[test_log::test]
    fn reboot_detected_on_flag_rise() {
        let mut peer = PeerSdState {
            last_session_id: 5,
            last_reboot_flag: false,
        };
        assert!(peer.check_reboot_and_update(6, true));
    }

    #[test_log::test]
    fn client_id_allocation_skips_zero() {
        let mut state = DaemonState::new(Config::default());
        state.next_client_id = u16::MAX;
        assert_eq!(state.next_client_id(), u16::MAX);
        assert_eq!(state.next_client_id(), 1);
    }
}
