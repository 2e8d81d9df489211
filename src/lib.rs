//! # someipyd
//!
//! A SOME/IP and SOME/IP-SD daemon for tokio.
//!
//! One daemon owns all SOME/IP network resources on a host: the SD
//! multicast socket, every service endpoint socket, and the protocol state.
//! Local applications connect over a Unix-domain stream socket and drive
//! the daemon through a small framed control protocol ([`ipc`]): register
//! services, start and stop offers, subscribe to event groups, publish
//! notifications, and invoke remote methods.
//!
//! ## Running the daemon
//!
//! ```rust,ignore
//! use someipyd::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() -> someipyd::Result<()> {
//!     let config = Config::default();
//!     let daemon = Daemon::new(config).await?;
//!     daemon.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! A single event loop owns all sockets, timers, and registry state.
//! Handler functions mutate [`daemon`] state and return actions for the
//! loop to execute; socket reader tasks and IPC connection tasks feed the
//! loop over channels and never touch state directly.

pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod tcp;

/// Wire format parsing for SOME/IP headers and SD messages.
/// Exposed for testing and interoperability verification.
pub mod wire;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};

// ============================================================================
// PROTOCOL IDENTIFIERS
// ============================================================================

/// Service identifier (0x0001-0xFFFE valid, 0x0000 and 0xFFFF reserved)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(u16);

impl ServiceId {
    /// Create a new ServiceId. Returns None for reserved values.
    pub fn new(id: u16) -> Option<Self> {
        match id {
            0x0000 | 0xFFFF => None,
            id => Some(Self(id)),
        }
    }

    /// Get the raw value
    pub fn value(&self) -> u16 {
        self.0
    }
}

/// Instance identifier (0x0001-0xFFFE valid; 0xFFFF is the SD wildcard)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u16);

impl InstanceId {
    /// Create a specific instance ID. Returns None for reserved values.
    pub fn new(id: u16) -> Option<Self> {
        match id {
            0x0000 | 0xFFFF => None,
            id => Some(Self(id)),
        }
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

/// Eventgroup identifier (0x0001-0xFFFE valid)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventgroupId(u16);

impl EventgroupId {
    pub fn new(id: u16) -> Option<Self> {
        match id {
            0x0000 | 0xFFFF => None,
            id => Some(Self(id)),
        }
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

/// Check whether a method/event id names an event (bit 15 set) or a method.
pub fn is_event_id(id: u16) -> bool {
    id & 0x8000 != 0
}

// ============================================================================
// RETURN CODES
// ============================================================================

/// SOME/IP return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0x00,
    NotOk = 0x01,
    UnknownService = 0x02,
    UnknownMethod = 0x03,
    NotReady = 0x04,
    NotReachable = 0x05,
    Timeout = 0x06,
    WrongProtocolVersion = 0x07,
    WrongInterfaceVersion = 0x08,
    MalformedMessage = 0x09,
    WrongMessageType = 0x0A,
}

// ============================================================================
// SERVICE SCHEMA
// ============================================================================

/// A service interface schema as registered by an application.
///
/// Immutable after creation. The daemon validates incoming method calls
/// against `methods` and routes notifications through `event_groups`;
/// payloads stay opaque byte strings throughout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSchema {
    pub service_id: u16,
    pub major_version: u8,
    pub minor_version: u32,
    /// Method ids offered by the service (bit 15 clear).
    pub methods: std::collections::HashSet<u16>,
    /// Event ids offered by the service (bit 15 set).
    pub events: std::collections::HashSet<u16>,
    /// Eventgroup id → the event ids bundled in that group.
    pub event_groups: std::collections::HashMap<u16, std::collections::HashSet<u16>>,
}

impl ServiceSchema {
    /// Check whether `eventgroup_id` is part of this schema.
    pub fn has_eventgroup(&self, eventgroup_id: u16) -> bool {
        self.event_groups.contains_key(&eventgroup_id)
    }

    /// Check whether `event_id` belongs to the given event group.
    pub fn eventgroup_contains(&self, eventgroup_id: u16, event_id: u16) -> bool {
        self.event_groups
            .get(&eventgroup_id)
            .is_some_and(|events| events.contains(&event_id))
    }

    /// Find every event group of this schema containing `event_id`.
    pub fn eventgroups_of_event(&self, event_id: u16) -> impl Iterator<Item = u16> + '_ {
        self.event_groups
            .iter()
            .filter(move |(_, events)| events.contains(&event_id))
            .map(|(id, _)| *id)
    }
}

/// Transport protocol of a service instance endpoint.
///
/// Service Discovery always uses UDP multicast regardless of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transport {
    /// UDP transport (default). Connectionless, payloads up to ~1400 bytes.
    #[default]
    Udp,
    /// TCP transport. Connection-oriented, framed by the SOME/IP length field.
    Tcp,
}

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub mod prelude {
    pub use crate::{
        Config, Daemon, Error, EventgroupId, InstanceId, Result, ReturnCode, ServiceId,
        ServiceSchema, Transport,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn schema() -> ServiceSchema {
        let mut event_groups = HashMap::new();
        event_groups.insert(0x0321, HashSet::from([0x8123, 0x8124]));
        ServiceSchema {
            service_id: 0x1234,
            major_version: 1,
            minor_version: 0,
            methods: HashSet::from([0x0001]),
            events: HashSet::from([0x8123, 0x8124]),
            event_groups,
        }
    }

    #[test_log::test]
    fn reserved_service_ids_rejected() {
        assert!(ServiceId::new(0x0000).is_none());
        assert!(ServiceId::new(0xFFFF).is_none());
        assert_eq!(ServiceId::new(0x1234).map(|s| s.value()), Some(0x1234));
    }

    #[test_log::test]
    fn event_ids_have_high_bit() {
        assert!(is_event_id(0x8123));
        assert!(!is_event_id(0x0001));
    }

    #[test_log::test]
    fn schema_eventgroup_lookup() {
        let schema = schema();
        assert!(schema.has_eventgroup(0x0321));
        assert!(!schema.has_eventgroup(0x0999));
        assert!(schema.eventgroup_contains(0x0321, 0x8123));
        assert!(!schema.eventgroup_contains(0x0321, 0x8999));
        let groups: Vec<u16> = schema.eventgroups_of_event(0x8124).collect();
        assert_eq!(groups, vec![0x0321]);
    }
}
