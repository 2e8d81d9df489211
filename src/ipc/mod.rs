//! # IPC Transport (Unix-domain socket)
//!
//! The daemon's application-facing surface: a framed binary control
//! protocol ([`proto`]) served over a Unix-domain stream socket
//! ([`server`]).
//!
//! A lost connection is equivalent to `StopOffer` on every server
//! instance owned by it, `Unsubscribe` on every client instance, and
//! cancellation of every pending method call.

pub mod proto;
pub mod server;

pub use proto::{Envelope, IpcBody, IpcDecodeError};
pub use server::{ConnId, IpcEvent, IpcServer, MAX_IPC_FRAME_BYTES};
