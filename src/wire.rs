//! # SOME/IP Wire Format
//!
//! Bit-exact encoding and decoding of SOME/IP headers and SOME/IP-SD
//! messages. No I/O happens here; sockets hand buffers in and take
//! buffers out.
//!
//! ## SOME/IP Header Format (16 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ──────────────────────────────────────────────────────
//!   0      2    Service ID
//!   2      2    Method ID (or Event ID if bit 15 set)
//!   4      4    Length (everything after this field)
//!   8      2    Client ID
//!  10      2    Session ID
//!  12      1    Protocol Version (always 0x01)
//!  13      1    Interface Version
//!  14      1    Message Type
//!  15      1    Return Code
//! ──────────────────────────────────────────────────────
//! ```
//!
//! ## Message Types
//!
//! | Value | Name | Description |
//! |-------|------|-------------|
//! | 0x00 | REQUEST | RPC request expecting a response |
//! | 0x01 | REQUEST_NO_RETURN | Fire-and-forget request |
//! | 0x02 | NOTIFICATION | Event notification |
//! | 0x80 | RESPONSE | RPC response |
//! | 0x81 | ERROR | RPC error response |
//!
//! ## Service Discovery (SD) Messages
//!
//! SD messages carry message id 0xFFFF8100 and a payload of flags, an
//! entries array, and an options array. Each entry references options
//! through two index runs ("first and second option run"); identical
//! options are interned so a packed message stays compact.
//!
//! All decode failures are reported as a distinct [`DecodeError`] kind so
//! the daemon can count and log them without crashing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// SOME/IP protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// SD service id (high half of the SD message id)
pub const SD_SERVICE_ID: u16 = 0xFFFF;

/// SD method id (low half of the SD message id)
pub const SD_METHOD_ID: u16 = 0x8100;

/// Full SD message id
pub const SD_MESSAGE_ID: u32 = 0xFFFF_8100;

/// Client id used in SD headers
pub const SD_CLIENT_ID: u16 = 0x0000;

/// Interface version used in SD headers
pub const SD_INTERFACE_VERSION: u8 = 0x01;

// ============================================================================
// DECODE ERRORS
// ============================================================================

/// Decode failure kinds.
///
/// Wire errors never terminate the daemon: the offending message is
/// dropped and a counter incremented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ended before the structure was complete
    Truncated,
    /// Length field smaller than the minimum of 8 or inconsistent with the buffer
    LengthMismatch { length: u32, available: usize },
    /// Protocol version byte was not 0x01
    WrongProtocolVersion(u8),
    /// Message type byte outside the recognized set
    UnknownMessageType(u8),
    /// A message expected to be SD carried a different message id
    NotSdMessage(u32),
    /// SD entry type byte outside the recognized set
    UnknownEntryType(u8),
    /// An entry's option run points outside the options array
    OptionIndexOutOfRange { index: usize, options: usize },
    /// An option's length field does not fit its kind
    MalformedOption { option_type: u8, length: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "truncated message"),
            DecodeError::LengthMismatch { length, available } => {
                write!(f, "length field {} inconsistent with {} bytes", length, available)
            }
            DecodeError::WrongProtocolVersion(v) => {
                write!(f, "wrong protocol version 0x{:02x}", v)
            }
            DecodeError::UnknownMessageType(t) => write!(f, "unknown message type 0x{:02x}", t),
            DecodeError::NotSdMessage(id) => {
                write!(f, "message id 0x{:08x} is not an SD message", id)
            }
            DecodeError::UnknownEntryType(t) => write!(f, "unknown SD entry type 0x{:02x}", t),
            DecodeError::OptionIndexOutOfRange { index, options } => {
                write!(f, "option index {} out of range ({} options)", index, options)
            }
            DecodeError::MalformedOption {
                option_type,
                length,
            } => write!(
                f,
                "malformed option 0x{:02x} with length {}",
                option_type, length
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// MESSAGE TYPES
// ============================================================================

/// SOME/IP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    RequestNoReturn = 0x01,
    Notification = 0x02,
    Response = 0x80,
    Error = 0x81,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Request),
            0x01 => Some(Self::RequestNoReturn),
            0x02 => Some(Self::Notification),
            0x80 => Some(Self::Response),
            0x81 => Some(Self::Error),
            _ => None,
        }
    }

    /// Check if this is a request type (expects a response)
    pub fn expects_response(&self) -> bool {
        matches!(self, Self::Request)
    }

    /// Check if this is a fire-and-forget request
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, Self::RequestNoReturn)
    }

    /// Check if this is a response type
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response | Self::Error)
    }
}

// ============================================================================
// HEADER
// ============================================================================

/// SOME/IP header (16 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Service ID
    pub service_id: u16,
    /// Method ID or Event ID
    pub method_id: u16,
    /// Length of payload + 8 trailing header bytes
    pub length: u32,
    /// Client ID
    pub client_id: u16,
    /// Session ID
    pub session_id: u16,
    /// Protocol version (always 0x01)
    pub protocol_version: u8,
    /// Interface version (= service major version)
    pub interface_version: u8,
    /// Message type
    pub message_type: MessageType,
    /// Return code
    pub return_code: u8,
}

impl Header {
    pub const SIZE: usize = 16;

    /// The combined message id (service id << 16 | method id)
    pub fn message_id(&self) -> u32 {
        (u32::from(self.service_id) << 16) | u32::from(self.method_id)
    }

    /// Check if this header carries the SD message id
    pub fn is_sd(&self) -> bool {
        self.service_id == SD_SERVICE_ID && self.method_id == SD_METHOD_ID
    }

    /// Parse a header from bytes
    pub fn parse(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < Self::SIZE {
            return Err(DecodeError::Truncated);
        }

        let service_id = buf.get_u16();
        let method_id = buf.get_u16();
        let length = buf.get_u32();
        let client_id = buf.get_u16();
        let session_id = buf.get_u16();
        let protocol_version = buf.get_u8();
        let interface_version = buf.get_u8();
        let message_type_raw = buf.get_u8();
        let return_code = buf.get_u8();

        if protocol_version != PROTOCOL_VERSION {
            return Err(DecodeError::WrongProtocolVersion(protocol_version));
        }

        // The length covers everything after the length field, so the
        // minimum valid value is 8 (header tail, no payload).
        if length < 8 {
            return Err(DecodeError::LengthMismatch {
                length,
                available: buf.remaining(),
            });
        }

        let message_type = MessageType::from_u8(message_type_raw)
            .ok_or(DecodeError::UnknownMessageType(message_type_raw))?;

        Ok(Self {
            service_id,
            method_id,
            length,
            client_id,
            session_id,
            protocol_version,
            interface_version,
            message_type,
            return_code,
        })
    }

    /// Serialize the header to bytes
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.service_id);
        buf.put_u16(self.method_id);
        buf.put_u32(self.length);
        buf.put_u16(self.client_id);
        buf.put_u16(self.session_id);
        buf.put_u8(self.protocol_version);
        buf.put_u8(self.interface_version);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(self.return_code);
    }

    /// Get the payload length (excluding the 8 bytes of header tail)
    pub fn payload_length(&self) -> usize {
        self.length.saturating_sub(8) as usize
    }
}

/// Extract the SOME/IP length field from a raw 8-byte message prefix.
///
/// Used by the TCP framer: read 8 bytes, learn the total frame size
/// (`length + 8`), then read the rest.
pub fn parse_someip_length(prefix: &[u8]) -> Option<u32> {
    if prefix.len() < 8 {
        return None;
    }
    Some(u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]))
}

/// A complete SOME/IP message (header + payload)
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub payload: Bytes,
}

impl Message {
    /// Parse one message from the buffer.
    ///
    /// A UDP datagram may carry several SOME/IP messages back to back;
    /// call this in a loop while at least a header remains.
    pub fn parse(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        let header = Header::parse(buf)?;
        let payload_len = header.payload_length();

        if buf.remaining() < payload_len {
            return Err(DecodeError::LengthMismatch {
                length: header.length,
                available: buf.remaining(),
            });
        }

        let payload = buf.copy_to_bytes(payload_len);

        Ok(Self { header, payload })
    }

    /// Serialize the message to bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Header::SIZE + self.payload.len());
        self.header.serialize(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

// ============================================================================
// SERVICE DISCOVERY: L4 PROTOCOL AND ENTRIES
// ============================================================================

/// L4 Protocol types carried in IPv4 endpoint options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum L4Protocol {
    Tcp = 0x06,
    Udp = 0x11,
}

impl L4Protocol {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x06 => Some(Self::Tcp),
            0x11 => Some(Self::Udp),
            _ => None,
        }
    }
}

impl From<crate::Transport> for L4Protocol {
    fn from(t: crate::Transport) -> Self {
        match t {
            crate::Transport::Udp => Self::Udp,
            crate::Transport::Tcp => Self::Tcp,
        }
    }
}

/// SD entry types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdEntryType {
    FindService = 0x00,
    OfferService = 0x01,
    SubscribeEventgroup = 0x06,
    SubscribeEventgroupAck = 0x07,
}

impl SdEntryType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::FindService),
            0x01 => Some(Self::OfferService),
            0x06 => Some(Self::SubscribeEventgroup),
            0x07 => Some(Self::SubscribeEventgroupAck),
            _ => None,
        }
    }
}

/// A parsed SD entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdEntry {
    pub entry_type: SdEntryType,
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    pub ttl: u32,           // 24-bit, 0 = stop/nack
    pub minor_version: u32, // service entries only
    pub eventgroup_id: u16, // eventgroup entries only
    pub counter: u8,        // eventgroup entries only
    /// Index of the first option of run 1
    pub index_1st_option: u8,
    /// Index of the first option of run 2
    pub index_2nd_option: u8,
    /// Number of options in run 1
    pub num_options_1: u8,
    /// Number of options in run 2
    pub num_options_2: u8,
}

impl fmt::Display for SdEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entry_type {
            SdEntryType::FindService | SdEntryType::OfferService => {
                write!(
                    f,
                    "{:?} {:04x}:{:04x} v{}.{} TTL={}",
                    self.entry_type,
                    self.service_id,
                    self.instance_id,
                    self.major_version,
                    self.minor_version,
                    self.ttl
                )
            }
            SdEntryType::SubscribeEventgroup | SdEntryType::SubscribeEventgroupAck => {
                write!(
                    f,
                    "{:?} {:04x}:{:04x} v{} EG {:04x} TTL={} #{}",
                    self.entry_type,
                    self.service_id,
                    self.instance_id,
                    self.major_version,
                    self.eventgroup_id,
                    self.ttl,
                    self.counter
                )
            }
        }
    }
}

impl SdEntry {
    pub const SIZE: usize = 16;

    /// Check if this is a stop/nack entry (TTL = 0)
    pub fn is_stop(&self) -> bool {
        self.ttl == 0
    }

    pub fn parse(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < Self::SIZE {
            return Err(DecodeError::Truncated);
        }

        let entry_type_raw = buf.get_u8();
        let index_1st_option = buf.get_u8();
        let index_2nd_option = buf.get_u8();
        let num_options = buf.get_u8();
        let num_options_1 = (num_options >> 4) & 0x0F;
        let num_options_2 = num_options & 0x0F;
        let service_id = buf.get_u16();
        let instance_id = buf.get_u16();
        let major_version = buf.get_u8();
        let ttl_bytes = [0, buf.get_u8(), buf.get_u8(), buf.get_u8()];
        let ttl = u32::from_be_bytes(ttl_bytes);

        let entry_type =
            SdEntryType::from_u8(entry_type_raw).ok_or(DecodeError::UnknownEntryType(entry_type_raw))?;

        // Bytes 12-15 depend on entry type
        let (minor_version, eventgroup_id, counter) = match entry_type {
            SdEntryType::FindService | SdEntryType::OfferService => {
                let minor = buf.get_u32();
                (minor, 0, 0)
            }
            SdEntryType::SubscribeEventgroup | SdEntryType::SubscribeEventgroupAck => {
                let _reserved = buf.get_u8();
                let counter = buf.get_u8();
                let eventgroup = buf.get_u16();
                (0, eventgroup, counter)
            }
        };

        Ok(Self {
            entry_type,
            service_id,
            instance_id,
            major_version,
            ttl,
            minor_version,
            eventgroup_id,
            counter,
            index_1st_option,
            index_2nd_option,
            num_options_1,
            num_options_2,
        })
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.entry_type as u8);
        buf.put_u8(self.index_1st_option);
        buf.put_u8(self.index_2nd_option);
        buf.put_u8((self.num_options_1 << 4) | (self.num_options_2 & 0x0F));
        buf.put_u16(self.service_id);
        buf.put_u16(self.instance_id);
        buf.put_u8(self.major_version);
        // TTL is 24-bit
        buf.put_u8(((self.ttl >> 16) & 0xFF) as u8);
        buf.put_u8(((self.ttl >> 8) & 0xFF) as u8);
        buf.put_u8((self.ttl & 0xFF) as u8);

        match self.entry_type {
            SdEntryType::FindService | SdEntryType::OfferService => {
                buf.put_u32(self.minor_version);
            }
            SdEntryType::SubscribeEventgroup | SdEntryType::SubscribeEventgroupAck => {
                buf.put_u8(0); // reserved
                buf.put_u8(self.counter);
                buf.put_u16(self.eventgroup_id);
            }
        }
    }

    /// Create a `FindService` entry
    pub fn find_service(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        minor_version: u32,
        ttl: u32,
    ) -> Self {
        Self {
            entry_type: SdEntryType::FindService,
            service_id,
            instance_id,
            major_version,
            ttl,
            minor_version,
            eventgroup_id: 0,
            counter: 0,
            index_1st_option: 0,
            index_2nd_option: 0,
            num_options_1: 0,
            num_options_2: 0,
        }
    }

    /// Create an `OfferService` entry
    pub fn offer_service(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        minor_version: u32,
        ttl: u32,
    ) -> Self {
        Self {
            entry_type: SdEntryType::OfferService,
            service_id,
            instance_id,
            major_version,
            ttl,
            minor_version,
            eventgroup_id: 0,
            counter: 0,
            index_1st_option: 0,
            index_2nd_option: 0,
            num_options_1: 0,
            num_options_2: 0,
        }
    }

    /// Create a `StopOfferService` entry (`OfferService` with TTL=0)
    pub fn stop_offer_service(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        minor_version: u32,
    ) -> Self {
        Self::offer_service(service_id, instance_id, major_version, minor_version, 0)
    }

    /// Create a `SubscribeEventgroup` entry
    pub fn subscribe_eventgroup(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        eventgroup_id: u16,
        ttl: u32,
        counter: u8,
    ) -> Self {
        Self {
            entry_type: SdEntryType::SubscribeEventgroup,
            service_id,
            instance_id,
            major_version,
            ttl,
            minor_version: 0,
            eventgroup_id,
            counter,
            index_1st_option: 0,
            index_2nd_option: 0,
            num_options_1: 0,
            num_options_2: 0,
        }
    }

    /// Create a `SubscribeEventgroupAck` entry
    pub fn subscribe_eventgroup_ack(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        eventgroup_id: u16,
        ttl: u32,
        counter: u8,
    ) -> Self {
        Self {
            entry_type: SdEntryType::SubscribeEventgroupAck,
            service_id,
            instance_id,
            major_version,
            ttl,
            minor_version: 0,
            eventgroup_id,
            counter,
            index_1st_option: 0,
            index_2nd_option: 0,
            num_options_1: 0,
            num_options_2: 0,
        }
    }

    /// Create a `SubscribeEventgroupNack` entry (same type as Ack, TTL=0)
    pub fn subscribe_eventgroup_nack(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        eventgroup_id: u16,
        counter: u8,
    ) -> Self {
        Self::subscribe_eventgroup_ack(service_id, instance_id, major_version, eventgroup_id, 0, counter)
    }
}

// ============================================================================
// SERVICE DISCOVERY: OPTIONS
// ============================================================================

/// SD option kind bytes
pub const OPTION_CONFIGURATION: u8 = 0x01;
pub const OPTION_LOAD_BALANCING: u8 = 0x02;
pub const OPTION_IPV4_ENDPOINT: u8 = 0x04;
pub const OPTION_IPV4_MULTICAST: u8 = 0x14;

/// SD option (IPv4 endpoint, multicast, or anything else carried opaquely)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdOption {
    Ipv4Endpoint {
        addr: Ipv4Addr,
        port: u16,
        protocol: L4Protocol,
    },
    Ipv4Multicast {
        addr: Ipv4Addr,
        port: u16,
    },
    /// Configuration, load balancing, and unknown kinds: decoded and
    /// skipped, preserving forward compatibility.
    Opaque {
        option_type: u8,
        data: Bytes,
    },
}

impl SdOption {
    pub fn parse(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < 3 {
            return Err(DecodeError::Truncated);
        }

        let length = buf.get_u16() as usize;
        let option_type = buf.get_u8();

        if buf.remaining() < length {
            return Err(DecodeError::Truncated);
        }

        match option_type {
            OPTION_IPV4_ENDPOINT => {
                if length != 9 {
                    return Err(DecodeError::MalformedOption {
                        option_type,
                        length,
                    });
                }
                let _reserved = buf.get_u8();
                let addr = Ipv4Addr::new(buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8());
                let _reserved2 = buf.get_u8();
                let protocol_raw = buf.get_u8();
                let protocol = L4Protocol::from_u8(protocol_raw).ok_or(
                    DecodeError::MalformedOption {
                        option_type,
                        length,
                    },
                )?;
                let port = buf.get_u16();
                Ok(Self::Ipv4Endpoint {
                    addr,
                    port,
                    protocol,
                })
            }
            OPTION_IPV4_MULTICAST => {
                if length != 9 {
                    return Err(DecodeError::MalformedOption {
                        option_type,
                        length,
                    });
                }
                let _reserved = buf.get_u8();
                let addr = Ipv4Addr::new(buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8());
                let _reserved2 = buf.get_u8();
                let _protocol = buf.get_u8();
                let port = buf.get_u16();
                Ok(Self::Ipv4Multicast { addr, port })
            }
            _ => {
                let data = buf.copy_to_bytes(length);
                Ok(Self::Opaque { option_type, data })
            }
        }
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        match self {
            Self::Ipv4Endpoint {
                addr,
                port,
                protocol,
            } => {
                buf.put_u16(9); // length
                buf.put_u8(OPTION_IPV4_ENDPOINT);
                buf.put_u8(0); // reserved
                buf.put_slice(&addr.octets());
                buf.put_u8(0); // reserved
                buf.put_u8(*protocol as u8);
                buf.put_u16(*port);
            }
            Self::Ipv4Multicast { addr, port } => {
                buf.put_u16(9); // length
                buf.put_u8(OPTION_IPV4_MULTICAST);
                buf.put_u8(0); // reserved
                buf.put_slice(&addr.octets());
                buf.put_u8(0); // reserved
                buf.put_u8(L4Protocol::Udp as u8);
                buf.put_u16(*port);
            }
            Self::Opaque { option_type, data } => {
                buf.put_u16(data.len() as u16);
                buf.put_u8(*option_type);
                buf.put_slice(data);
            }
        }
    }

    /// Size in bytes when serialized
    pub fn size(&self) -> usize {
        match self {
            Self::Ipv4Endpoint { .. } | Self::Ipv4Multicast { .. } => 12, // 2 + 1 + 9
            Self::Opaque { data, .. } => 3 + data.len(),
        }
    }
}

// ============================================================================
// SERVICE DISCOVERY: MESSAGE
// ============================================================================

/// Per-entry endpoint options resolved from both option runs.
///
/// Run 1 carries the entry's primary endpoint(s), run 2 the secondary
/// (e.g. a service offered on both TCP and UDP). After resolution the
/// SD engine only deals in this structured pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryEndpoints {
    pub udp: Option<SocketAddr>,
    pub tcp: Option<SocketAddr>,
    pub multicast: Option<SocketAddr>,
}

/// Complete SD message (parsed payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdMessage {
    pub flags: u8,
    pub entries: Vec<SdEntry>,
    pub options: Vec<SdOption>,
}

impl SdMessage {
    /// Reboot flag
    pub const FLAG_REBOOT: u8 = 0x80;
    /// Unicast flag
    pub const FLAG_UNICAST: u8 = 0x40;

    /// Create a new SD message
    pub fn new(flags: u8) -> Self {
        Self {
            flags,
            entries: Vec::new(),
            options: Vec::new(),
        }
    }

    /// Parse from the payload bytes after a SOME/IP header.
    ///
    /// The header must already have been checked with [`Header::is_sd`];
    /// callers that skip the check get [`DecodeError::NotSdMessage`] from
    /// [`SdMessage::parse_message`] instead.
    pub fn parse(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < 12 {
            return Err(DecodeError::Truncated);
        }

        let flags = buf.get_u8();
        let _reserved = [buf.get_u8(), buf.get_u8(), buf.get_u8()];

        let entries_len = buf.get_u32() as usize;
        if buf.remaining() < entries_len {
            return Err(DecodeError::LengthMismatch {
                length: entries_len as u32,
                available: buf.remaining(),
            });
        }

        let mut entries = Vec::new();
        let mut entries_consumed = 0;
        while entries_consumed + SdEntry::SIZE <= entries_len {
            entries.push(SdEntry::parse(buf)?);
            entries_consumed += SdEntry::SIZE;
        }
        // Skip any trailing bytes in the entries array
        if entries_consumed < entries_len {
            buf.advance(entries_len - entries_consumed);
        }

        if buf.remaining() < 4 {
            return Err(DecodeError::Truncated);
        }
        let options_len = buf.get_u32() as usize;
        if buf.remaining() < options_len {
            return Err(DecodeError::LengthMismatch {
                length: options_len as u32,
                available: buf.remaining(),
            });
        }

        let mut options = Vec::new();
        let options_end = buf.remaining() - options_len;
        while buf.remaining() > options_end {
            options.push(SdOption::parse(buf)?);
        }

        Ok(Self {
            flags,
            entries,
            options,
        })
    }

    /// Parse a complete SD message (SOME/IP header + SD payload).
    pub fn parse_message(buf: &mut impl Buf) -> Result<(Header, Self), DecodeError> {
        let header = Header::parse(buf)?;
        if !header.is_sd() {
            return Err(DecodeError::NotSdMessage(header.message_id()));
        }
        let sd = Self::parse(buf)?;
        Ok((header, sd))
    }

    /// Serialize to bytes (just the SD payload, without SOME/IP header)
    pub fn serialize_payload(&self) -> Bytes {
        let entries_len = self.entries.len() * SdEntry::SIZE;
        let options_len: usize = self.options.iter().map(SdOption::size).sum();
        let total_len = 4 + 4 + entries_len + 4 + options_len;

        let mut buf = BytesMut::with_capacity(total_len);

        // Flags + reserved
        buf.put_u8(self.flags);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(0);

        // Entries array
        buf.put_u32(entries_len as u32);
        for entry in &self.entries {
            entry.serialize(&mut buf);
        }

        // Options array
        buf.put_u32(options_len as u32);
        for option in &self.options {
            option.serialize(&mut buf);
        }

        buf.freeze()
    }

    /// Serialize as a complete SOME/IP message
    pub fn serialize(&self, session_id: u16) -> Bytes {
        let payload = self.serialize_payload();

        let header = Header {
            service_id: SD_SERVICE_ID,
            method_id: SD_METHOD_ID,
            length: 8 + payload.len() as u32,
            client_id: SD_CLIENT_ID,
            session_id,
            protocol_version: PROTOCOL_VERSION,
            interface_version: SD_INTERFACE_VERSION,
            message_type: MessageType::Notification,
            return_code: 0x00,
        };

        let mut buf = BytesMut::with_capacity(Header::SIZE + payload.len());
        header.serialize(&mut buf);
        buf.extend_from_slice(&payload);
        buf.freeze()
    }

    /// Add an entry and return its index
    pub fn add_entry(&mut self, entry: SdEntry) -> usize {
        let idx = self.entries.len();
        self.entries.push(entry);
        idx
    }

    /// Intern an option: identical options share one slot.
    ///
    /// This keeps the options array compact when a packed message carries
    /// offers for several instances at the same endpoint.
    pub fn intern_option(&mut self, option: SdOption) -> u8 {
        if let Some(idx) = self.options.iter().position(|o| *o == option) {
            return idx as u8;
        }
        let idx = self.options.len() as u8;
        self.options.push(option);
        idx
    }

    /// Resolve an entry's two option runs into a structured endpoint pair.
    ///
    /// Opaque options are skipped; an index pointing outside the options
    /// array is a decode error.
    pub fn resolve_endpoints(&self, entry: &SdEntry) -> Result<EntryEndpoints, DecodeError> {
        let mut resolved = EntryEndpoints::default();

        let runs = [
            (entry.index_1st_option as usize, entry.num_options_1 as usize),
            (entry.index_2nd_option as usize, entry.num_options_2 as usize),
        ];

        for (start, count) in runs {
            for i in start..start + count {
                let option = self.options.get(i).ok_or(DecodeError::OptionIndexOutOfRange {
                    index: i,
                    options: self.options.len(),
                })?;
                match option {
                    SdOption::Ipv4Endpoint {
                        addr,
                        port,
                        protocol,
                    } => {
                        let sockaddr = SocketAddr::V4(SocketAddrV4::new(*addr, *port));
                        match protocol {
                            L4Protocol::Udp => resolved.udp.get_or_insert(sockaddr),
                            L4Protocol::Tcp => resolved.tcp.get_or_insert(sockaddr),
                        };
                    }
                    SdOption::Ipv4Multicast { addr, port } => {
                        resolved
                            .multicast
                            .get_or_insert(SocketAddr::V4(SocketAddrV4::new(*addr, *port)));
                    }
                    SdOption::Opaque { .. } => {}
                }
            }
        }

        Ok(resolved)
    }
}
