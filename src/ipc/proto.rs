//! # IPC Control Protocol
//!
//! Binary envelopes exchanged between local applications and the daemon
//! over the Unix-domain stream socket.
//!
//! Each envelope is length-prefixed (u32 big-endian, not counting the
//! prefix itself) and starts with a u8 kind and a u32 correlation id:
//!
//! ```text
//! ┌──────────┬──────┬────────────────┬──────────────┐
//! │ len: u32 │ kind │ correlation id │ body (kind-  │
//! │          │ u8   │ u32            │ specific)    │
//! └──────────┴──────┴────────────────┴──────────────┘
//! ```
//!
//! | Kind | Direction | Purpose |
//! |------|-----------|---------|
//! | RegisterServer | app → daemon | announce a server instance |
//! | StartOffer / StopOffer | app → daemon | drive the offer state machine |
//! | RegisterClient | app → daemon | announce a client instance |
//! | Subscribe / Unsubscribe | app → daemon | eventgroup membership |
//! | SendEvent | app → daemon | publish a notification |
//! | CallMethod | app → daemon | invoke a remote method |
//! | MethodResponse | daemon → app | result of CallMethod |
//! | IncomingEvent | daemon → app | notification for a subscription |
//! | IncomingRequest | daemon → app | forwarded remote request |
//! | ReplyRequest | app → daemon | answer to IncomingRequest |
//! | SubscriptionChanged | daemon → app | remote subscriber added/removed |
//! | Ack / Error | daemon → app | outcome of an app request |
//!
//! All integers are big-endian. Payloads are u32-length-prefixed byte
//! strings and stay opaque. An unknown kind closes the connection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::L4Protocol;
use crate::{ServiceSchema, Transport};

/// Envelope kind bytes
pub const KIND_REGISTER_SERVER: u8 = 0x01;
pub const KIND_START_OFFER: u8 = 0x02;
pub const KIND_STOP_OFFER: u8 = 0x03;
pub const KIND_REGISTER_CLIENT: u8 = 0x04;
pub const KIND_SUBSCRIBE: u8 = 0x05;
pub const KIND_UNSUBSCRIBE: u8 = 0x06;
pub const KIND_SEND_EVENT: u8 = 0x07;
pub const KIND_CALL_METHOD: u8 = 0x08;
pub const KIND_METHOD_RESPONSE: u8 = 0x09;
pub const KIND_INCOMING_EVENT: u8 = 0x0A;
pub const KIND_INCOMING_REQUEST: u8 = 0x0B;
pub const KIND_REPLY_REQUEST: u8 = 0x0C;
pub const KIND_SUBSCRIPTION_CHANGED: u8 = 0x0D;
pub const KIND_ACK: u8 = 0x0E;
pub const KIND_ERROR: u8 = 0x0F;

/// IPC error codes carried in [`IpcBody::Error`]
pub const IPC_ERR_ALREADY_OFFERED: u8 = 0x01;
pub const IPC_ERR_UNKNOWN_HANDLE: u8 = 0x02;
pub const IPC_ERR_NOT_AVAILABLE: u8 = 0x03;
pub const IPC_ERR_NOT_CONNECTED: u8 = 0x04;
pub const IPC_ERR_TIMEOUT: u8 = 0x05;
pub const IPC_ERR_BAD_REQUEST: u8 = 0x06;
pub const IPC_ERR_TRANSPORT: u8 = 0x07;

/// Decode failure for IPC envelopes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcDecodeError {
    /// Frame ended before the envelope was complete
    Truncated,
    /// Kind byte outside the catalogue; the connection must be closed
    UnknownKind(u8),
    /// Transport byte was neither UDP (0x11) nor TCP (0x06)
    BadTransport(u8),
    /// A string field was not valid UTF-8
    BadUtf8,
}

impl fmt::Display for IpcDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcDecodeError::Truncated => write!(f, "truncated IPC envelope"),
            IpcDecodeError::UnknownKind(k) => write!(f, "unknown IPC kind 0x{:02x}", k),
            IpcDecodeError::BadTransport(t) => write!(f, "bad transport byte 0x{:02x}", t),
            IpcDecodeError::BadUtf8 => write!(f, "string field is not UTF-8"),
        }
    }
}

impl std::error::Error for IpcDecodeError {}

/// One IPC envelope: correlation id plus a typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub correlation_id: u32,
    pub body: IpcBody,
}

/// Envelope bodies (§ control protocol table)
#[derive(Debug, Clone, PartialEq)]
pub enum IpcBody {
    RegisterServer {
        schema: ServiceSchema,
        instance_id: u16,
        endpoint: SocketAddrV4,
        transport: Transport,
        ttl: u32,
        cyclic_offer_delay_ms: u32,
    },
    StartOffer {
        handle: u32,
    },
    StopOffer {
        handle: u32,
    },
    RegisterClient {
        schema: ServiceSchema,
        instance_id: u16,
        endpoint: SocketAddrV4,
    },
    Subscribe {
        handle: u32,
        eventgroup_id: u16,
        ttl: u32,
    },
    Unsubscribe {
        handle: u32,
        eventgroup_id: u16,
    },
    SendEvent {
        handle: u32,
        eventgroup_id: u16,
        event_id: u16,
        payload: Bytes,
    },
    CallMethod {
        handle: u32,
        method_id: u16,
        payload: Bytes,
        timeout_ms: u32,
    },
    MethodResponse {
        message_type: u8,
        return_code: u8,
        payload: Bytes,
    },
    IncomingEvent {
        handle: u32,
        event_id: u16,
        payload: Bytes,
    },
    IncomingRequest {
        handle: u32,
        method_id: u16,
        client_id: u16,
        session_id: u16,
        sender: SocketAddrV4,
        payload: Bytes,
    },
    ReplyRequest {
        message_type: u8,
        return_code: u8,
        payload: Bytes,
    },
    SubscriptionChanged {
        handle: u32,
        eventgroup_id: u16,
        subscriber: SocketAddrV4,
        added: bool,
    },
    Ack {
        handle: u32,
    },
    Error {
        code: u8,
        message: String,
    },
}

impl Envelope {
    pub fn new(correlation_id: u32, body: IpcBody) -> Self {
        Self {
            correlation_id,
            body,
        }
    }

    /// Encode the envelope including its u32 length prefix.
    pub fn encode_frame(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(64);
        self.encode(&mut body);

        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        frame.freeze()
    }

    /// Encode the envelope without the length prefix.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.body.kind());
        buf.put_u32(self.correlation_id);
        self.body.encode(buf);
    }

    /// Decode one envelope from a complete frame (length prefix already
    /// stripped).
    pub fn decode(buf: &mut impl Buf) -> Result<Self, IpcDecodeError> {
        if buf.remaining() < 5 {
            return Err(IpcDecodeError::Truncated);
        }
        let kind = buf.get_u8();
        let correlation_id = buf.get_u32();
        let body = IpcBody::decode(kind, buf)?;
        Ok(Self {
            correlation_id,
            body,
        })
    }
}

impl IpcBody {
    pub fn kind(&self) -> u8 {
        match self {
            IpcBody::RegisterServer { .. } => KIND_REGISTER_SERVER,
            IpcBody::StartOffer { .. } => KIND_START_OFFER,
            IpcBody::StopOffer { .. } => KIND_STOP_OFFER,
            IpcBody::RegisterClient { .. } => KIND_REGISTER_CLIENT,
            IpcBody::Subscribe { .. } => KIND_SUBSCRIBE,
            IpcBody::Unsubscribe { .. } => KIND_UNSUBSCRIBE,
            IpcBody::SendEvent { .. } => KIND_SEND_EVENT,
            IpcBody::CallMethod { .. } => KIND_CALL_METHOD,
            IpcBody::MethodResponse { .. } => KIND_METHOD_RESPONSE,
            IpcBody::IncomingEvent { .. } => KIND_INCOMING_EVENT,
            IpcBody::IncomingRequest { .. } => KIND_INCOMING_REQUEST,
            IpcBody::ReplyRequest { .. } => KIND_REPLY_REQUEST,
            IpcBody::SubscriptionChanged { .. } => KIND_SUBSCRIPTION_CHANGED,
            IpcBody::Ack { .. } => KIND_ACK,
            IpcBody::Error { .. } => KIND_ERROR,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            IpcBody::RegisterServer {
                schema,
                instance_id,
                endpoint,
                transport,
                ttl,
                cyclic_offer_delay_ms,
            } => {
                put_schema(buf, schema);
                buf.put_u16(*instance_id);
                put_endpoint(buf, endpoint);
                buf.put_u8(L4Protocol::from(*transport) as u8);
                buf.put_u32(*ttl);
                buf.put_u32(*cyclic_offer_delay_ms);
            }
            IpcBody::StartOffer { handle } | IpcBody::StopOffer { handle } => {
                buf.put_u32(*handle);
            }
            IpcBody::RegisterClient {
                schema,
                instance_id,
                endpoint,
            } => {
                put_schema(buf, schema);
                buf.put_u16(*instance_id);
                put_endpoint(buf, endpoint);
            }
            IpcBody::Subscribe {
                handle,
                eventgroup_id,
                ttl,
            } => {
                buf.put_u32(*handle);
                buf.put_u16(*eventgroup_id);
                buf.put_u32(*ttl);
            }
            IpcBody::Unsubscribe {
                handle,
                eventgroup_id,
            } => {
                buf.put_u32(*handle);
                buf.put_u16(*eventgroup_id);
            }
            IpcBody::SendEvent {
                handle,
                eventgroup_id,
                event_id,
                payload,
            } => {
                buf.put_u32(*handle);
                buf.put_u16(*eventgroup_id);
                buf.put_u16(*event_id);
                put_payload(buf, payload);
            }
            IpcBody::CallMethod {
                handle,
                method_id,
                payload,
                timeout_ms,
            } => {
                buf.put_u32(*handle);
                buf.put_u16(*method_id);
                buf.put_u32(*timeout_ms);
                put_payload(buf, payload);
            }
            IpcBody::MethodResponse {
                message_type,
                return_code,
                payload,
            }
            | IpcBody::ReplyRequest {
                message_type,
                return_code,
                payload,
            } => {
                buf.put_u8(*message_type);
                buf.put_u8(*return_code);
                put_payload(buf, payload);
            }
            IpcBody::IncomingEvent {
                handle,
                event_id,
                payload,
            } => {
                buf.put_u32(*handle);
                buf.put_u16(*event_id);
                put_payload(buf, payload);
            }
            IpcBody::IncomingRequest {
                handle,
                method_id,
                client_id,
                session_id,
                sender,
                payload,
            } => {
                buf.put_u32(*handle);
                buf.put_u16(*method_id);
                buf.put_u16(*client_id);
                buf.put_u16(*session_id);
                put_endpoint(buf, sender);
                put_payload(buf, payload);
            }
            IpcBody::SubscriptionChanged {
                handle,
                eventgroup_id,
                subscriber,
                added,
            } => {
                buf.put_u32(*handle);
                buf.put_u16(*eventgroup_id);
                put_endpoint(buf, subscriber);
                buf.put_u8(u8::from(*added));
            }
            IpcBody::Ack { handle } => {
                buf.put_u32(*handle);
            }
            IpcBody::Error { code, message } => {
                buf.put_u8(*code);
                buf.put_u16(message.len() as u16);
                buf.put_slice(message.as_bytes());
            }
        }
    }

    fn decode(kind: u8, buf: &mut impl Buf) -> Result<Self, IpcDecodeError> {
        match kind {
            KIND_REGISTER_SERVER => {
                let schema = get_schema(buf)?;
                let instance_id = get_u16(buf)?;
                let endpoint = get_endpoint(buf)?;
                let transport = get_transport(buf)?;
                let ttl = get_u32(buf)?;
                let cyclic_offer_delay_ms = get_u32(buf)?;
                Ok(IpcBody::RegisterServer {
                    schema,
                    instance_id,
                    endpoint,
                    transport,
                    ttl,
                    cyclic_offer_delay_ms,
                })
            }
            KIND_START_OFFER => Ok(IpcBody::StartOffer {
                handle: get_u32(buf)?,
            }),
            KIND_STOP_OFFER => Ok(IpcBody::StopOffer {
                handle: get_u32(buf)?,
            }),
            KIND_REGISTER_CLIENT => {
                let schema = get_schema(buf)?;
                let instance_id = get_u16(buf)?;
                let endpoint = get_endpoint(buf)?;
                Ok(IpcBody::RegisterClient {
                    schema,
                    instance_id,
                    endpoint,
                })
            }
            KIND_SUBSCRIBE => Ok(IpcBody::Subscribe {
                handle: get_u32(buf)?,
                eventgroup_id: get_u16(buf)?,
                ttl: get_u32(buf)?,
            }),
            KIND_UNSUBSCRIBE => Ok(IpcBody::Unsubscribe {
                handle: get_u32(buf)?,
                eventgroup_id: get_u16(buf)?,
            }),
            KIND_SEND_EVENT => Ok(IpcBody::SendEvent {
                handle: get_u32(buf)?,
                eventgroup_id: get_u16(buf)?,
                event_id: get_u16(buf)?,
                payload: get_payload(buf)?,
            }),
            KIND_CALL_METHOD => Ok(IpcBody::CallMethod {
                handle: get_u32(buf)?,
                method_id: get_u16(buf)?,
                timeout_ms: get_u32(buf)?,
                payload: get_payload(buf)?,
            }),
            KIND_METHOD_RESPONSE => Ok(IpcBody::MethodResponse {
                message_type: get_u8(buf)?,
                return_code: get_u8(buf)?,
                payload: get_payload(buf)?,
            }),
            KIND_INCOMING_EVENT => Ok(IpcBody::IncomingEvent {
                handle: get_u32(buf)?,
                event_id: get_u16(buf)?,
                payload: get_payload(buf)?,
            }),
            KIND_INCOMING_REQUEST => Ok(IpcBody::IncomingRequest {
                handle: get_u32(buf)?,
                method_id: get_u16(buf)?,
                client_id: get_u16(buf)?,
                session_id: get_u16(buf)?,
                sender: get_endpoint(buf)?,
                payload: get_payload(buf)?,
            }),
            KIND_REPLY_REQUEST => Ok(IpcBody::ReplyRequest {
                message_type: get_u8(buf)?,
                return_code: get_u8(buf)?,
                payload: get_payload(buf)?,
            }),
            KIND_SUBSCRIPTION_CHANGED => Ok(IpcBody::SubscriptionChanged {
                handle: get_u32(buf)?,
                eventgroup_id: get_u16(buf)?,
                subscriber: get_endpoint(buf)?,
                added: get_u8(buf)? != 0,
            }),
            KIND_ACK => Ok(IpcBody::Ack {
                handle: get_u32(buf)?,
            }),
            KIND_ERROR => {
                let code = get_u8(buf)?;
                let len = get_u16(buf)? as usize;
                if buf.remaining() < len {
                    return Err(IpcDecodeError::Truncated);
                }
                let raw = buf.copy_to_bytes(len);
                let message =
                    String::from_utf8(raw.to_vec()).map_err(|_| IpcDecodeError::BadUtf8)?;
                Ok(IpcBody::Error { code, message })
            }
            other => Err(IpcDecodeError::UnknownKind(other)),
        }
    }
}

// ============================================================================
// FIELD CODECS
// ============================================================================

fn get_u8(buf: &mut impl Buf) -> Result<u8, IpcDecodeError> {
    if buf.remaining() < 1 {
        return Err(IpcDecodeError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut impl Buf) -> Result<u16, IpcDecodeError> {
    if buf.remaining() < 2 {
        return Err(IpcDecodeError::Truncated);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut impl Buf) -> Result<u32, IpcDecodeError> {
    if buf.remaining() < 4 {
        return Err(IpcDecodeError::Truncated);
    }
    Ok(buf.get_u32())
}

fn put_endpoint(buf: &mut BytesMut, endpoint: &SocketAddrV4) {
    buf.put_slice(&endpoint.ip().octets());
    buf.put_u16(endpoint.port());
}

fn get_endpoint(buf: &mut impl Buf) -> Result<SocketAddrV4, IpcDecodeError> {
    if buf.remaining() < 6 {
        return Err(IpcDecodeError::Truncated);
    }
    let ip = Ipv4Addr::new(buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8());
    let port = buf.get_u16();
    Ok(SocketAddrV4::new(ip, port))
}

fn get_transport(buf: &mut impl Buf) -> Result<Transport, IpcDecodeError> {
    let raw = get_u8(buf)?;
    match L4Protocol::from_u8(raw) {
        Some(L4Protocol::Udp) => Ok(Transport::Udp),
        Some(L4Protocol::Tcp) => Ok(Transport::Tcp),
        None => Err(IpcDecodeError::BadTransport(raw)),
    }
}

fn put_payload(buf: &mut BytesMut, payload: &Bytes) {
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

fn get_payload(buf: &mut impl Buf) -> Result<Bytes, IpcDecodeError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(IpcDecodeError::Truncated);
    }
    Ok(buf.copy_to_bytes(len))
}

fn put_id_set(buf: &mut BytesMut, ids: &HashSet<u16>) {
    // Sorted so encodings are deterministic
    let mut sorted: Vec<u16> = ids.iter().copied().collect();
    sorted.sort_unstable();
    buf.put_u16(sorted.len() as u16);
    for id in sorted {
        buf.put_u16(id);
    }
}

fn get_id_set(buf: &mut impl Buf) -> Result<HashSet<u16>, IpcDecodeError> {
    let count = get_u16(buf)? as usize;
    let mut ids = HashSet::with_capacity(count);
    for _ in 0..count {
        ids.insert(get_u16(buf)?);
    }
    Ok(ids)
}

fn put_schema(buf: &mut BytesMut, schema: &ServiceSchema) {
    buf.put_u16(schema.service_id);
    buf.put_u8(schema.major_version);
    buf.put_u32(schema.minor_version);
    put_id_set(buf, &schema.methods);
    put_id_set(buf, &schema.events);

    let mut groups: Vec<(&u16, &HashSet<u16>)> = schema.event_groups.iter().collect();
    groups.sort_unstable_by_key(|(id, _)| **id);
    buf.put_u16(groups.len() as u16);
    for (eventgroup_id, events) in groups {
        buf.put_u16(*eventgroup_id);
        put_id_set(buf, events);
    }
}

fn get_schema(buf: &mut impl Buf) -> Result<ServiceSchema, IpcDecodeError> {
    let service_id = get_u16(buf)?;
    let major_version = get_u8(buf)?;
    let minor_version = get_u32(buf)?;
    let methods = get_id_set(buf)?;
    let events = get_id_set(buf)?;

    let group_count = get_u16(buf)? as usize;
    let mut event_groups = HashMap::with_capacity(group_count);
    for _ in 0..group_count {
        let eventgroup_id = get_u16(buf)?;
        let group_events = get_id_set(buf)?;
        event_groups.insert(eventgroup_id, group_events);
    }

    Ok(ServiceSchema {
        service_id,
        major_version,
        minor_version,
        methods,
        events,
        event_groups,
    })
}
