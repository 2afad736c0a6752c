//! # Protocol Inspectors
//!
//! Application-layer inspectors driven by the engine once per stream
//! segment. Each inspector recognizes its wire format, extracts identity
//! metadata into the AppID session, and reports malformed input through
//! named events rather than errors.
//!
//! | Module  | Protocol               | Role                                  |
//! |---------|------------------------|---------------------------------------|
//! | `http`  | HTTP/1.1               | request/response fields, UA clients   |
//! | `http2` | HTTP/2 framing         | per-stream sessions via HPACK         |
//! | `hpack` | RFC 7541 decompression | consumed by `http2`                   |
//! | `tls`   | TLS handshake metadata | SNI, fingerprints, encryption signal  |
//! | `smb2`  | SMB2 wire headers      | command tracking, share types         |

pub mod hpack;
pub mod http;
pub mod http2;
pub mod smb2;
pub mod tls;

use crate::app_info::AppInfoTable;
use crate::change_bits::ChangeBits;
use crate::session::AppIdSession;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Segment direction relative to the flow initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the endpoint that opened the flow (client side).
    Initiator,
    /// From the endpoint that answered (server side).
    Responder,
}

// ---------------------------------------------------------------------------
// Inspection context
// ---------------------------------------------------------------------------

/// Everything an inspector needs for one segment, bundled to keep the
/// inspector signatures stable.
pub struct InspectCtx<'a> {
    pub session: &'a mut AppIdSession,
    pub app_info: &'a AppInfoTable,
    pub change_bits: &'a mut ChangeBits,
    pub direction: Direction,
    pub packet_time: u32,
}
