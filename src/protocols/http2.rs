//! # HTTP/2 Frame Inspector
//!
//! Parses HTTP/2 framing and drives the HPACK decoder. Every HEADERS frame
//! creates or updates the per-stream HTTP session on the AppID session;
//! the engine publishes per-stream change events keyed by stream index.
//!
//! ## Wire format
//!
//! ```text
//! Frame header (9 bytes):
//!   Length (24 bits)
//!   Type (8 bits)
//!   Flags (8 bits)
//!   Reserved (1 bit) + Stream Identifier (31 bits)
//! ```
//!
//! The connection starts with the client preface
//! `PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n`.

use crate::app_info::APP_ID_HTTP2;
use crate::http_session::HttpField;
use crate::protocols::hpack::{HpackDecoder, HpackEvent};
use crate::protocols::{Direction, InspectCtx};
use crate::session::{APPID_SESSION_HTTP_SESSION, APPID_SESSION_SPDY_SESSION};

/// HTTP/2 connection preface sent by the client.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Size of the fixed frame header.
pub const FRAME_HEADER_LENGTH: usize = 9;

// frame types
pub const FT_DATA: u8 = 0x0;
pub const FT_HEADERS: u8 = 0x1;
pub const FT_PRIORITY: u8 = 0x2;
pub const FT_RST_STREAM: u8 = 0x3;
pub const FT_SETTINGS: u8 = 0x4;
pub const FT_PUSH_PROMISE: u8 = 0x5;
pub const FT_PING: u8 = 0x6;
pub const FT_GOAWAY: u8 = 0x7;
pub const FT_WINDOW_UPDATE: u8 = 0x8;
pub const FT_CONTINUATION: u8 = 0x9;

// frame flags
pub const FLAG_END_STREAM: u8 = 0x01;
pub const FLAG_END_HEADERS: u8 = 0x04;
pub const FLAG_PADDED: u8 = 0x08;
pub const FLAG_PRIORITY: u8 = 0x20;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Frame-level and HPACK-level inspection events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http2Event {
    PrefaceMatchFailure,
    InvalidStreamId,
    PaddingLen,
    MisformattedFrame,
    Hpack(HpackEvent),
}

// ---------------------------------------------------------------------------
// Frame header
// ---------------------------------------------------------------------------

/// Parsed 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse a frame header; `None` until 9 bytes are available.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_LENGTH {
            return None;
        }
        Some(Self {
            length: u32::from(data[0]) << 16 | u32::from(data[1]) << 8 | u32::from(data[2]),
            frame_type: data[3],
            flags: data[4],
            // high bit is reserved
            stream_id: u32::from_be_bytes([data[5] & 0x7f, data[6], data[7], data[8]]),
        })
    }
}

// ---------------------------------------------------------------------------
// Flow data
// ---------------------------------------------------------------------------

/// Per-flow HTTP/2 inspector state: one HPACK decoder per direction plus
/// preface and per-stream bookkeeping.
#[derive(Debug)]
pub struct Http2FlowData {
    hpack: [HpackDecoder; 2],
    preface_seen: bool,
    /// Streams that already carried a HEADERS frame per direction; a
    /// second one carries trailers.
    headers_seen: Vec<(u32, [bool; 2])>,
}

impl Http2FlowData {
    pub fn new() -> Self {
        Self {
            hpack: [HpackDecoder::new(), HpackDecoder::new()],
            preface_seen: false,
            headers_seen: Vec::new(),
        }
    }

    fn mark_headers_seen(&mut self, stream_id: u32, dir: usize) -> bool {
        for entry in &mut self.headers_seen {
            if entry.0 == stream_id {
                let seen = entry.1[dir];
                entry.1[dir] = true;
                return seen;
            }
        }
        let mut seen = [false; 2];
        seen[dir] = true;
        self.headers_seen.push((stream_id, seen));
        false
    }
}

impl Default for Http2FlowData {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of inspecting one segment.
#[derive(Debug, Default)]
pub struct Http2InspectResult {
    pub events: Vec<Http2Event>,
    /// Indices into the session's HTTP-session list touched by this
    /// segment, for per-stream publication.
    pub streams_touched: Vec<u32>,
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// Sniff whether a segment looks like the start of HTTP/2.
pub fn starts_with_preface(data: &[u8]) -> bool {
    let n = data.len().min(CONNECTION_PREFACE.len());
    data[..n] == CONNECTION_PREFACE[..n] && n > 0
}

/// Inspect one reassembled segment of an HTTP/2 connection.
pub fn inspect(ctx: &mut InspectCtx, fd: &mut Http2FlowData, data: &[u8]) -> Http2InspectResult {
    let mut result = Http2InspectResult::default();
    let mut offset = 0;

    if !fd.preface_seen && ctx.direction == Direction::Initiator {
        if data.len() >= CONNECTION_PREFACE.len() && starts_with_preface(data) {
            fd.preface_seen = true;
            offset = CONNECTION_PREFACE.len();
            ctx.session.service.update(APP_ID_HTTP2, None);
            ctx.session.set_service_detected();
            ctx.session
                .set_session_flags(APPID_SESSION_HTTP_SESSION | APPID_SESSION_SPDY_SESSION);
            tracing::debug!("http/2 connection preface seen");
        } else {
            result.events.push(Http2Event::PrefaceMatchFailure);
            return result;
        }
    }

    while offset + FRAME_HEADER_LENGTH <= data.len() {
        let Some(header) = FrameHeader::parse(&data[offset..]) else {
            break;
        };
        let payload_start = offset + FRAME_HEADER_LENGTH;
        let payload_end = payload_start + header.length as usize;
        if payload_end > data.len() {
            // frame continues in the next segment
            break;
        }
        let payload = &data[payload_start..payload_end];

        match header.frame_type {
            FT_HEADERS | FT_CONTINUATION => {
                inspect_headers_frame(ctx, fd, &header, payload, &mut result);
            }
            FT_DATA
            | FT_PRIORITY
            | FT_RST_STREAM
            | FT_SETTINGS
            | FT_PUSH_PROMISE
            | FT_PING
            | FT_GOAWAY
            | FT_WINDOW_UPDATE => {}
            _ => result.events.push(Http2Event::MisformattedFrame),
        }

        offset = payload_end;
    }

    result
}

fn inspect_headers_frame(
    ctx: &mut InspectCtx,
    fd: &mut Http2FlowData,
    header: &FrameHeader,
    payload: &[u8],
    result: &mut Http2InspectResult,
) {
    if header.stream_id == 0 {
        result.events.push(Http2Event::InvalidStreamId);
        return;
    }

    let mut block = payload;

    if header.flags & FLAG_PADDED != 0 {
        let Some((&pad_length, rest)) = block.split_first() else {
            result.events.push(Http2Event::MisformattedFrame);
            return;
        };
        if usize::from(pad_length) > rest.len() {
            result.events.push(Http2Event::PaddingLen);
            return;
        }
        block = &rest[..rest.len() - usize::from(pad_length)];
    }

    if header.frame_type == FT_HEADERS && header.flags & FLAG_PRIORITY != 0 {
        if block.len() < 5 {
            result.events.push(Http2Event::MisformattedFrame);
            return;
        }
        block = &block[5..];
    }

    let dir = (ctx.direction == Direction::Responder) as usize;
    let trailers = fd.mark_headers_seen(header.stream_id, dir);

    let mut hpack_events = Vec::new();
    let decoded = fd.hpack[dir].decode_headers(block, trailers, &mut hpack_events);
    result.events.extend(hpack_events.into_iter().map(Http2Event::Hpack));

    let Some(decoded) = decoded else {
        return;
    };

    let index = match ctx.session.get_matching_http_session(header.stream_id) {
        Some(index) => index,
        None => ctx.session.create_http_session(header.stream_id),
    };
    result.streams_touched.push(index as u32);

    let mut authority = None;
    let mut path = None;
    for (name, value) in &decoded.fields {
        let value = String::from_utf8_lossy(value).into_owned();
        match name.as_slice() {
            b":authority" => authority = Some(value),
            b":path" => path = Some(value),
            b":status" => {
                if let Some(hsession) = ctx.session.get_http_session_mut(index) {
                    hsession.response_code = value.parse().unwrap_or(0);
                }
            }
            b"host" => authority = Some(value),
            b"user-agent" => {
                if let Some(hsession) = ctx.session.get_http_session_mut(index) {
                    hsession.set_field(HttpField::UserAgent, Some(value), ctx.change_bits);
                }
            }
            b"referer" => {
                if let Some(hsession) = ctx.session.get_http_session_mut(index) {
                    hsession.set_field(HttpField::Referer, Some(value), ctx.change_bits);
                }
            }
            _ => {}
        }
    }

    if let Some(hsession) = ctx.session.get_http_session_mut(index) {
        if let (Some(authority), Some(path)) = (authority.as_ref(), path.as_ref()) {
            let url = format!("https://{authority}{path}");
            hsession.set_field(HttpField::Url, Some(url), ctx.change_bits);
        }
        if let Some(authority) = authority {
            hsession.set_field(HttpField::Host, Some(authority), ctx.change_bits);
        }
        if let Some(path) = path {
            hsession.set_field(HttpField::Uri, Some(path), ctx.change_bits);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_info::AppInfoTable;
    use crate::change_bits::ChangeBits;
    use crate::flow::IP_PROTO_TCP;
    use crate::session::AppIdSession;

    fn session() -> AppIdSession {
        AppIdSession::new(
            IP_PROTO_TCP,
            0,
            "10.0.0.1".parse().unwrap(),
            49152,
            "10.0.0.2".parse().unwrap(),
            443,
            1000,
            None,
        )
    }

    fn frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LENGTH + payload.len());
        let len = payload.len() as u32;
        out.push((len >> 16) as u8);
        out.push((len >> 8) as u8);
        out.push(len as u8);
        out.push(frame_type);
        out.push(flags);
        out.extend_from_slice(&stream_id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn inspect_segment(
        asd: &mut AppIdSession,
        fd: &mut Http2FlowData,
        direction: Direction,
        data: &[u8],
    ) -> Http2InspectResult {
        let app_info = AppInfoTable::new();
        let mut bits = ChangeBits::new();
        let mut ctx = InspectCtx {
            session: asd,
            app_info: &app_info,
            change_bits: &mut bits,
            direction,
            packet_time: 1000,
        };
        inspect(&mut ctx, fd, data)
    }

    #[test]
    fn test_frame_header_parse() {
        let header = FrameHeader::parse(&[0x00, 0x00, 0x0c, 0x01, 0x05, 0x80, 0x00, 0x00, 0x03]);
        let header = header.unwrap();
        assert_eq!(header.length, 12);
        assert_eq!(header.frame_type, FT_HEADERS);
        assert_eq!(header.flags, FLAG_END_STREAM | FLAG_END_HEADERS);
        // reserved bit is masked off
        assert_eq!(header.stream_id, 3);

        assert!(FrameHeader::parse(&[0x00, 0x00]).is_none());
    }

    #[test]
    fn test_preface_detection() {
        let mut asd = session();
        let mut fd = Http2FlowData::new();

        let mut data = CONNECTION_PREFACE.to_vec();
        data.extend(frame(FT_SETTINGS, 0, 0, &[]));
        let result = inspect_segment(&mut asd, &mut fd, Direction::Initiator, &data);
        assert!(result.events.is_empty());
        assert_eq!(asd.service.get_id(), APP_ID_HTTP2);
        assert!(asd.is_service_detected());
    }

    #[test]
    fn test_bad_preface() {
        let mut asd = session();
        let mut fd = Http2FlowData::new();
        let result =
            inspect_segment(&mut asd, &mut fd, Direction::Initiator, b"GET / HTTP/1.1\r\n\r\nxxxxxxx");
        assert!(result.events.contains(&Http2Event::PrefaceMatchFailure));
    }

    #[test]
    fn test_headers_frame_creates_stream_session() {
        let mut asd = session();
        let mut fd = Http2FlowData::new();

        let mut data = CONNECTION_PREFACE.to_vec();
        // :method: GET, :scheme: https, :path: /index.html
        data.extend(frame(FT_HEADERS, FLAG_END_HEADERS, 1, &[0x82, 0x87, 0x85]));
        let result = inspect_segment(&mut asd, &mut fd, Direction::Initiator, &data);

        assert_eq!(result.streams_touched, vec![0]);
        let hsession = asd.get_http_session(0).unwrap();
        assert_eq!(hsession.http2_stream_id, 1);
        assert_eq!(hsession.uri.as_deref(), Some("/index.html"));
    }

    #[test]
    fn test_two_streams_two_sessions() {
        let mut asd = session();
        let mut fd = Http2FlowData::new();

        let mut data = CONNECTION_PREFACE.to_vec();
        data.extend(frame(FT_HEADERS, FLAG_END_HEADERS, 1, &[0x82, 0x84]));
        data.extend(frame(FT_HEADERS, FLAG_END_HEADERS, 3, &[0x82, 0x85]));
        inspect_segment(&mut asd, &mut fd, Direction::Initiator, &data);

        assert_eq!(asd.hsessions.len(), 2);
        assert_eq!(asd.get_matching_http_session(3), Some(1));
    }

    #[test]
    fn test_padding_longer_than_frame() {
        let mut asd = session();
        let mut fd = Http2FlowData::new();

        let mut data = CONNECTION_PREFACE.to_vec();
        // padded flag with pad length 200 but only 2 bytes of payload left
        data.extend(frame(FT_HEADERS, FLAG_END_HEADERS | FLAG_PADDED, 1, &[200, 0x82, 0x84]));
        let result = inspect_segment(&mut asd, &mut fd, Direction::Initiator, &data);
        assert!(result.events.contains(&Http2Event::PaddingLen));
    }

    #[test]
    fn test_headers_on_stream_zero() {
        let mut asd = session();
        let mut fd = Http2FlowData::new();
        let mut data = CONNECTION_PREFACE.to_vec();
        data.extend(frame(FT_HEADERS, FLAG_END_HEADERS, 0, &[0x82]));
        let result = inspect_segment(&mut asd, &mut fd, Direction::Initiator, &data);
        assert!(result.events.contains(&Http2Event::InvalidStreamId));
    }

    #[test]
    fn test_trailers_reject_pseudo_headers() {
        let mut asd = session();
        let mut fd = Http2FlowData::new();

        let mut data = CONNECTION_PREFACE.to_vec();
        data.extend(frame(FT_HEADERS, FLAG_END_HEADERS, 1, &[0x82, 0x84]));
        // second HEADERS on the same stream and direction is trailers
        data.extend(frame(FT_HEADERS, FLAG_END_HEADERS | FLAG_END_STREAM, 1, &[0x82]));
        let result = inspect_segment(&mut asd, &mut fd, Direction::Initiator, &data);
        assert!(result
            .events
            .contains(&Http2Event::Hpack(HpackEvent::PseudoHeaderInTrailers)));
    }

    #[test]
    fn test_response_status_recorded() {
        let mut asd = session();
        let mut fd = Http2FlowData::new();

        let mut data = CONNECTION_PREFACE.to_vec();
        data.extend(frame(FT_HEADERS, FLAG_END_HEADERS, 1, &[0x82, 0x84]));
        inspect_segment(&mut asd, &mut fd, Direction::Initiator, &data);

        // :status: 404 from the responder
        let response = frame(FT_HEADERS, FLAG_END_HEADERS, 1, &[0x8d]);
        inspect_segment(&mut asd, &mut fd, Direction::Responder, &response);
        assert_eq!(asd.get_http_session(0).unwrap().response_code, 404);
    }
}
