//! # TLS Metadata Inspector
//!
//! Extracts handshake metadata from TLS flows without decrypting them: the
//! server name from the ClientHello, JA3/JA3S-style fingerprints of both
//! hellos, and the handshake-completion signal. The server name feeds the
//! SSL pattern scan; the fingerprints feed the host tracker's fingerprint
//! sets.
//!
//! ## Wire format
//!
//! ```text
//! TLS record:
//!   Content Type (1 byte): 20 = ChangeCipherSpec, 22 = Handshake
//!   Version (2 bytes)
//!   Length (2 bytes)
//!
//! Handshake:
//!   Type (1 byte): 1 = ClientHello, 2 = ServerHello
//!   Length (3 bytes)
//! ```

use std::fmt::Write as _;

use md5::{Digest, Md5};

use crate::protocols::{Direction, InspectCtx};
use crate::session::{APPID_SESSION_SSL_SESSION, SCAN_SSL_HOST_FLAG};

/// TLS content type for handshake records.
const TLS_HANDSHAKE: u8 = 22;
/// TLS content type for change-cipher-spec records.
const TLS_CHANGE_CIPHER_SPEC: u8 = 20;

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;

const TLS_RECORD_HEADER_LEN: usize = 5;
const MIN_HELLO_LEN: usize = 38;

/// GREASE cipher suite and extension values (RFC 8701), randomly injected
/// by clients and excluded from fingerprints.
const GREASE_VALUES: [u16; 16] = [
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a, 0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a, 0x8a8a, 0x9a9a, 0xaaaa,
    0xbaba, 0xcaca, 0xdada, 0xeaea, 0xfafa,
];

fn is_grease(val: u16) -> bool {
    GREASE_VALUES.contains(&val)
}

// ---------------------------------------------------------------------------
// Hello summaries
// ---------------------------------------------------------------------------

/// What the ClientHello revealed.
#[derive(Debug, Clone, Default)]
pub struct ClientHelloSummary {
    pub version: u16,
    pub server_name: Option<String>,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<u16>,
    pub elliptic_curves: Vec<u16>,
    pub ec_point_formats: Vec<u8>,
}

impl ClientHelloSummary {
    /// Fingerprint input string:
    /// `version,ciphers,extensions,curves,formats`.
    pub fn fingerprint_string(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.version,
            join_u16(&self.cipher_suites),
            join_u16(&self.extensions),
            join_u16(&self.elliptic_curves),
            join_u8(&self.ec_point_formats),
        )
    }
}

/// What the ServerHello revealed.
#[derive(Debug, Clone, Default)]
pub struct ServerHelloSummary {
    pub version: u16,
    pub cipher: u16,
    pub extensions: Vec<u16>,
}

impl ServerHelloSummary {
    pub fn fingerprint_string(&self) -> String {
        format!("{},{},{}", self.version, self.cipher, join_u16(&self.extensions))
    }
}

/// Hash a fingerprint string down to a 32-bit fingerprint id.
pub fn fingerprint_id(input: &str) -> u32 {
    let digest = Md5::digest(input.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Full hex digest of a fingerprint string, for operational dumps.
pub fn fingerprint_hex(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    let mut hex = String::with_capacity(32);
    for byte in digest.iter() {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Sniff whether a segment looks like a TLS handshake record.
pub fn looks_like_tls(data: &[u8]) -> bool {
    data.len() >= TLS_RECORD_HEADER_LEN
        && (data[0] == TLS_HANDSHAKE || data[0] == TLS_CHANGE_CIPHER_SPEC)
        && data[1] == 0x03
}

/// Parse a ClientHello handshake body.
pub fn parse_client_hello(payload: &[u8]) -> Option<ClientHelloSummary> {
    if payload.len() < MIN_HELLO_LEN {
        return None;
    }

    let mut summary = ClientHelloSummary::default();
    let mut offset = 0;

    summary.version = u16::from_be_bytes([payload[0], payload[1]]);
    offset += 2;
    offset += 32; // random

    let session_id_len = *payload.get(offset)? as usize;
    offset += 1 + session_id_len;

    let cipher_suites_len =
        u16::from_be_bytes([*payload.get(offset)?, *payload.get(offset + 1)?]) as usize;
    offset += 2;
    if offset + cipher_suites_len > payload.len() {
        return None;
    }
    let cs_end = offset + cipher_suites_len;
    while offset + 1 < cs_end {
        let cs = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        if !is_grease(cs) {
            summary.cipher_suites.push(cs);
        }
        offset += 2;
    }
    offset = cs_end;

    let comp_len = *payload.get(offset)? as usize;
    offset += 1 + comp_len;

    // extensions
    if offset + 2 <= payload.len() {
        let ext_total = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
        offset += 2;
        let ext_end = (offset + ext_total).min(payload.len());

        while offset + 4 <= ext_end {
            let ext_type = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
            let ext_len = u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]) as usize;
            offset += 4;
            let data_end = (offset + ext_len).min(payload.len());

            if !is_grease(ext_type) {
                summary.extensions.push(ext_type);
            }

            match ext_type {
                // server name indication
                0x0000 => summary.server_name = parse_sni(&payload[offset..data_end]),
                // supported groups
                0x000a => {
                    summary.elliptic_curves = parse_u16_list(&payload[offset..data_end], true)
                }
                // ec point formats
                0x000b => summary.ec_point_formats = parse_u8_list(&payload[offset..data_end]),
                _ => {}
            }

            offset = data_end;
        }
    }

    Some(summary)
}

/// Parse a ServerHello handshake body.
pub fn parse_server_hello(payload: &[u8]) -> Option<ServerHelloSummary> {
    if payload.len() < MIN_HELLO_LEN {
        return None;
    }

    let mut summary = ServerHelloSummary::default();
    let mut offset = 0;

    summary.version = u16::from_be_bytes([payload[0], payload[1]]);
    offset += 2;
    offset += 32; // random

    let session_id_len = *payload.get(offset)? as usize;
    offset += 1 + session_id_len;

    summary.cipher = u16::from_be_bytes([*payload.get(offset)?, *payload.get(offset + 1)?]);
    offset += 2;
    offset += 1; // compression method

    if offset + 2 <= payload.len() {
        let ext_total = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
        offset += 2;
        let ext_end = (offset + ext_total).min(payload.len());

        while offset + 4 <= ext_end {
            let ext_type = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
            let ext_len = u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]) as usize;
            offset += 4;
            if !is_grease(ext_type) {
                summary.extensions.push(ext_type);
            }
            offset = (offset + ext_len).min(payload.len());
        }
    }

    Some(summary)
}

/// Parse the SNI extension: list length, name type 0, host name.
fn parse_sni(data: &[u8]) -> Option<String> {
    if data.len() < 5 || data[2] != 0 {
        return None;
    }
    let name_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let name = data.get(5..5 + name_len)?;
    Some(String::from_utf8_lossy(name).into_owned())
}

fn parse_u16_list(data: &[u8], filter_grease: bool) -> Vec<u16> {
    if data.len() < 2 {
        return Vec::new();
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let end = (2 + list_len).min(data.len());
    let mut out = Vec::new();
    let mut offset = 2;
    while offset + 1 < end {
        let val = u16::from_be_bytes([data[offset], data[offset + 1]]);
        if !filter_grease || !is_grease(val) {
            out.push(val);
        }
        offset += 2;
    }
    out
}

fn parse_u8_list(data: &[u8]) -> Vec<u8> {
    let Some((&len, rest)) = data.split_first() else {
        return Vec::new();
    };
    rest[..(len as usize).min(rest.len())].to_vec()
}

fn join_u16(values: &[u16]) -> String {
    values.iter().map(u16::to_string).collect::<Vec<_>>().join("-")
}

fn join_u8(values: &[u8]) -> String {
    values.iter().map(u8::to_string).collect::<Vec<_>>().join("-")
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// Fingerprint ids extracted from a segment, for the host tracker.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsInspectResult {
    pub client_fpid: Option<u32>,
    pub server_fpid: Option<u32>,
}

/// Inspect one segment of a TLS flow.
///
/// The ClientHello marks the session as SSL, stores the server name on the
/// TLS session and raises the SSL-host scan flag; the ServerHello yields
/// the server fingerprint; a change-cipher-spec from the responder marks
/// the handshake as done.
pub fn inspect(ctx: &mut InspectCtx, data: &[u8]) -> TlsInspectResult {
    let mut result = TlsInspectResult::default();
    let mut offset = 0;

    while offset + TLS_RECORD_HEADER_LEN <= data.len() {
        let content_type = data[offset];
        let record_len =
            u16::from_be_bytes([data[offset + 3], data[offset + 4]]) as usize;
        let record_start = offset + TLS_RECORD_HEADER_LEN;
        let record_end = (record_start + record_len).min(data.len());

        if content_type == TLS_CHANGE_CIPHER_SPEC && ctx.direction == Direction::Responder {
            ctx.session.create_tls_session().handshake_done = true;
        }

        if content_type == TLS_HANDSHAKE && record_start + 4 <= data.len() {
            let handshake_type = data[record_start];
            let body = &data[record_start + 4..record_end];

            match (handshake_type, ctx.direction) {
                (CLIENT_HELLO, Direction::Initiator) => {
                    if let Some(summary) = parse_client_hello(body) {
                        ctx.session.set_session_flags(APPID_SESSION_SSL_SESSION);
                        result.client_fpid = Some(fingerprint_id(&summary.fingerprint_string()));

                        if let Some(host) = summary.server_name {
                            ctx.session.api.set_tls_host(&host, ctx.change_bits);
                            ctx.session.create_tls_session().tls_host = Some(host);
                            ctx.session.scan_flags |= SCAN_SSL_HOST_FLAG;
                        }
                    }
                }
                (SERVER_HELLO, Direction::Responder) => {
                    if let Some(summary) = parse_server_hello(body) {
                        result.server_fpid = Some(fingerprint_id(&summary.fingerprint_string()));
                    }
                }
                _ => {}
            }
        }

        if record_end <= offset {
            break;
        }
        offset = record_end;
    }

    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_info::AppInfoTable;
    use crate::change_bits::{ChangeBit, ChangeBits};
    use crate::flow::IP_PROTO_TCP;
    use crate::session::AppIdSession;

    /// Build a minimal ClientHello record with an SNI extension.
    fn client_hello_record(server_name: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes()); // TLS 1.2
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id length

        // cipher suites: one GREASE value and two real ones
        body.extend_from_slice(&6u16.to_be_bytes());
        body.extend_from_slice(&0x0a0au16.to_be_bytes());
        body.extend_from_slice(&0x1301u16.to_be_bytes());
        body.extend_from_slice(&0x1302u16.to_be_bytes());

        body.push(1); // compression methods
        body.push(0);

        // extensions: SNI only
        let name = server_name.as_bytes();
        let sni_data_len = 5 + name.len();
        body.extend_from_slice(&((4 + sni_data_len) as u16).to_be_bytes());
        body.extend_from_slice(&0x0000u16.to_be_bytes()); // type
        body.extend_from_slice(&(sni_data_len as u16).to_be_bytes());
        body.extend_from_slice(&((3 + name.len()) as u16).to_be_bytes()); // list len
        body.push(0); // host_name
        body.extend_from_slice(&(name.len() as u16).to_be_bytes());
        body.extend_from_slice(name);

        let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
        record.push(CLIENT_HELLO);
        record.push(0);
        record.extend_from_slice(&(body.len() as u16).to_be_bytes());
        record.extend_from_slice(&body);
        record
    }

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

    #[test]
    fn test_grease_filtering() {
        assert!(is_grease(0x0a0a));
        assert!(is_grease(0xfafa));
        assert!(!is_grease(0x1301));
    }

    #[test]
    fn test_parse_client_hello_sni_and_ciphers() {
        let record = client_hello_record("secure.example.com");
        let summary = parse_client_hello(&record[9..]).unwrap();
        assert_eq!(summary.server_name.as_deref(), Some("secure.example.com"));
        // GREASE cipher filtered out
        assert_eq!(summary.cipher_suites, vec![0x1301, 0x1302]);
        assert_eq!(summary.version, 0x0303);
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = fingerprint_id("771,4865-4866,0,,");
        let b = fingerprint_id("771,4865-4866,0,,");
        let c = fingerprint_id("770,4865-4866,0,,");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(fingerprint_hex("").len(), 32);
    }

    #[test]
    fn test_inspect_client_hello_flags_session() {
        let mut asd = session();
        let app_info = AppInfoTable::new();
        let mut bits = ChangeBits::new();
        let record = client_hello_record("secure.example.com");

        let result = inspect(
            &mut InspectCtx {
                session: &mut asd,
                app_info: &app_info,
                change_bits: &mut bits,
                direction: Direction::Initiator,
                packet_time: 1000,
            },
            &record,
        );

        assert!(result.client_fpid.is_some());
        assert!(asd.any_session_flags(APPID_SESSION_SSL_SESSION));
        assert_eq!(asd.scan_flags & SCAN_SSL_HOST_FLAG, SCAN_SSL_HOST_FLAG);
        assert_eq!(
            asd.tsession.as_ref().unwrap().tls_host.as_deref(),
            Some("secure.example.com")
        );
        assert_eq!(asd.api.tls_host().as_deref(), Some("secure.example.com"));
        assert!(bits.is_set(ChangeBit::TlsHost));
    }

    #[test]
    fn test_change_cipher_spec_marks_handshake_done() {
        let mut asd = session();
        let app_info = AppInfoTable::new();
        let mut bits = ChangeBits::new();
        let record = [TLS_CHANGE_CIPHER_SPEC, 0x03, 0x03, 0x00, 0x01, 0x01];

        inspect(
            &mut InspectCtx {
                session: &mut asd,
                app_info: &app_info,
                change_bits: &mut bits,
                direction: Direction::Responder,
                packet_time: 1000,
            },
            &record,
        );
        assert!(asd.tsession.as_ref().unwrap().handshake_done);
    }

    #[test]
    fn test_short_segment_ignored() {
        let mut asd = session();
        let app_info = AppInfoTable::new();
        let mut bits = ChangeBits::new();
        let result = inspect(
            &mut InspectCtx {
                session: &mut asd,
                app_info: &app_info,
                change_bits: &mut bits,
                direction: Direction::Initiator,
                packet_time: 1000,
            },
            b"shrt",
        );
        assert!(result.client_fpid.is_none());
        assert!(asd.tsession.is_none());
    }
}
