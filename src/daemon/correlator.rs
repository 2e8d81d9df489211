//! # Method Call Correlator (Internal)
//!
//! Client/session id allocation, the outstanding-request table, and
//! response correlation.
//!
//! Every in-flight call is keyed by (client id, session id); session ids
//! increment per client instance, wrap from 0xFFFF to 1, never use 0, and
//! skip values that still have a pending entry. Responses arrive in any
//! order and resolve through the table, so out-of-order completion is the
//! normal case. Deadlines are enforced by the expiry tick in
//! [`super::sd::handle_expiry_tick`].

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use super::sd::Action;
use super::state::{CallKey, DaemonState, PendingCall};
use crate::ipc::{proto, ConnId, Envelope, IpcBody};
use crate::wire::{Header, Message, MessageType, PROTOCOL_VERSION};
use crate::ReturnCode;

/// Allocate the next free session id for a client instance.
///
/// Returns `None` when all 65535 session ids are in flight, which means
/// the application has that many unanswered calls outstanding.
fn allocate_session(
    next_session: &mut u16,
    client_id: u16,
    pending: &std::collections::HashMap<CallKey, PendingCall>,
) -> Option<u16> {
    let mut candidate = *next_session;
    for _ in 0..=u16::MAX {
        if candidate == 0 {
            candidate = 1;
        }
        let key = CallKey {
            client_id,
            session_id: candidate,
        };
        if !pending.contains_key(&key) {
            *next_session = candidate.wrapping_add(1);
            return Some(candidate);
        }
        candidate = candidate.wrapping_add(1);
    }
    None
}

/// Handle a `CallMethod` IPC request: validate, allocate a session,
/// build the REQUEST, and register the pending entry.
pub fn call_method(
    state: &mut DaemonState,
    conn: ConnId,
    correlation_id: u32,
    handle: u32,
    method_id: u16,
    payload: Bytes,
    timeout_ms: u32,
) -> Vec<Action> {
    let Some((client_key, client)) = state.client_by_handle(handle) else {
        return vec![ipc_error(
            conn,
            correlation_id,
            proto::IPC_ERR_UNKNOWN_HANDLE,
            "unknown client handle",
        )];
    };

    if !client.schema.methods.contains(&method_id) {
        return vec![ipc_error(
            conn,
            correlation_id,
            proto::IPC_ERR_BAD_REQUEST,
            "method not in service schema",
        )];
    }

    let client_id = client.client_id;
    let major_version = client.schema.major_version;
    let service_id = client.schema.service_id;

    // A call needs a live, version-compatible remote offer.
    let Some(offer) = state.remote_offers.get(&client_key) else {
        return vec![ipc_error(
            conn,
            correlation_id,
            proto::IPC_ERR_NOT_AVAILABLE,
            "no live offer for service",
        )];
    };
    if offer.major_version != major_version {
        return vec![ipc_error(
            conn,
            correlation_id,
            proto::IPC_ERR_NOT_AVAILABLE,
            "offered major version does not match",
        )];
    }
    let Some((target, transport)) = offer.endpoint() else {
        return vec![ipc_error(
            conn,
            correlation_id,
            proto::IPC_ERR_NOT_AVAILABLE,
            "offer carries no usable endpoint",
        )];
    };

    let Some(client) = state.local_clients.get_mut(&client_key) else {
        return Vec::new();
    };
    let Some(session_id) = allocate_session(
        &mut client.next_session,
        client_id,
        &state.pending_calls,
    ) else {
        return vec![ipc_error(
            conn,
            correlation_id,
            proto::IPC_ERR_BAD_REQUEST,
            "no free session id",
        )];
    };

    let header = Header {
        service_id,
        method_id,
        length: 8 + payload.len() as u32,
        client_id,
        session_id,
        protocol_version: PROTOCOL_VERSION,
        interface_version: major_version,
        message_type: MessageType::Request,
        return_code: ReturnCode::Ok as u8,
    };
    let data = Message { header, payload }.serialize();

    let call_key = CallKey {
        client_id,
        session_id,
    };
    state.pending_calls.insert(
        call_key,
        PendingCall {
            client_key,
            conn,
            correlation_id,
            deadline: Instant::now() + Duration::from_millis(u64::from(timeout_ms)),
        },
    );

    tracing::debug!(
        "Calling {:04x}:{:04x} method {:04x} session {:04x} via {:?} to {}",
        service_id,
        client_key.instance_id,
        method_id,
        session_id,
        transport,
        target
    );

    vec![Action::SendClientMessage {
        key: client_key,
        data,
        target,
        transport,
        failure_key: Some(call_key),
    }]
}

/// Correlate an incoming RESPONSE or ERROR with its pending call and
/// deliver the result over IPC.
pub fn complete(state: &mut DaemonState, header: &Header, payload: Bytes) -> Vec<Action> {
    let call_key = CallKey {
        client_id: header.client_id,
        session_id: header.session_id,
    };

    let Some(call) = state.pending_calls.remove(&call_key) else {
        state.counters.dropped_responses += 1;
        tracing::debug!(
            "Response for unknown session {:04x} of client {:04x}; dropping",
            header.session_id,
            header.client_id
        );
        return Vec::new();
    };

    vec![Action::SendIpc {
        conn: call.conn,
        envelope: Envelope::new(
            call.correlation_id,
            IpcBody::MethodResponse {
                message_type: header.message_type as u8,
                return_code: header.return_code,
                payload,
            },
        ),
    }]
}

/// Fail a pending call immediately (transport refused the send).
pub fn fail_call(state: &mut DaemonState, call_key: CallKey, code: u8, message: &str) -> Vec<Action> {
    let Some(call) = state.pending_calls.remove(&call_key) else {
        return Vec::new();
    };
    vec![Action::SendIpc {
        conn: call.conn,
        envelope: Envelope::new(
            call.correlation_id,
            IpcBody::Error {
                code,
                message: message.to_string(),
            },
        ),
    }]
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

/// Serialize helper for handlers that already hold a header + payload.
pub fn serialize_message(header: Header, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(Header::SIZE + payload.len());
    header.serialize(&mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}
