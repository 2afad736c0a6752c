//! # HTTP/1.1 Inspector
//!
//! Parses HTTP/1.1 requests and responses out of reassembled stream
//! segments and feeds the session's HTTP state: host, URL, user agent,
//! referer, via. HTTP identifies its own clients, so a flow marked as an
//! HTTP session skips the generic client discovery machinery; the
//! user-agent string is mapped to a client id here instead.
//!
//! ## Limitations
//!
//! - Chunked bodies are not reassembled; only header blocks are examined.
//! - Pipelined requests are treated as one transaction per segment.

use std::collections::HashMap;

use crate::app_info::{
    AppId, APP_ID_CHROME, APP_ID_CURL, APP_ID_FIREFOX, APP_ID_HTTP, APP_ID_SAFARI, APP_ID_WGET,
};
use crate::http_session::HttpField;
use crate::protocols::{Direction, InspectCtx};
use crate::session::{APPID_SESSION_HTTP_SESSION, SCAN_HTTP_HOST_URL_FLAG};

const VALID_METHODS: [&str; 9] =
    ["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT"];

// ---------------------------------------------------------------------------
// Parsed transaction halves
// ---------------------------------------------------------------------------

/// Parsed request line plus interesting headers.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: HashMap<String, String>,
}

/// Parsed status line plus interesting headers.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub version: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
}

/// Parse headers after the first line into a lowercase-keyed map.
fn parse_headers(text: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in text.split("\r\n") {
        if line.is_empty() {
            break;
        }
        if let Some(colon) = line.find(':') {
            let name = line[..colon].trim().to_lowercase();
            let value = line[colon + 1..].trim().to_string();
            headers.insert(name, value);
        }
    }
    headers
}

/// Attempt to parse an HTTP request from raw bytes.
pub fn parse_request(payload: &[u8]) -> Option<HttpRequest> {
    let text = std::str::from_utf8(payload).ok()?;
    let first_line_end = text.find("\r\n")?;
    let first_line = &text[..first_line_end];

    // METHOD URI HTTP/VERSION
    let mut parts = first_line.splitn(3, ' ');
    let method = parts.next()?;
    let uri = parts.next()?;
    let version_part = parts.next()?;

    if !version_part.starts_with("HTTP/") || !VALID_METHODS.contains(&method) {
        return None;
    }

    Some(HttpRequest {
        method: method.to_string(),
        uri: uri.to_string(),
        version: version_part.trim_start_matches("HTTP/").to_string(),
        headers: parse_headers(&text[first_line_end + 2..]),
    })
}

/// Attempt to parse an HTTP response from raw bytes.
pub fn parse_response(payload: &[u8]) -> Option<HttpResponse> {
    let text = std::str::from_utf8(payload).ok()?;
    let first_line_end = text.find("\r\n")?;
    let first_line = &text[..first_line_end];

    if !first_line.starts_with("HTTP/") {
        return None;
    }
    let mut parts = first_line.splitn(3, ' ');
    let version = parts.next()?.trim_start_matches("HTTP/").to_string();
    let status_code: u16 = parts.next()?.parse().ok()?;

    Some(HttpResponse {
        version,
        status_code,
        headers: parse_headers(&text[first_line_end + 2..]),
    })
}

// ---------------------------------------------------------------------------
// User-agent client identification
// ---------------------------------------------------------------------------

/// Map a User-Agent string to a client app id and version.
///
/// Order matters: Chrome claims Safari, Safari claims nothing else, so the
/// more specific products are checked first.
pub fn client_from_user_agent(ua: &str) -> Option<(AppId, Option<String>)> {
    fn version_after<'a>(ua: &'a str, product: &str) -> Option<String> {
        let start = ua.find(product)? + product.len();
        let version: String = ua[start..]
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        (!version.is_empty()).then_some(version)
    }

    if ua.contains("curl/") {
        return Some((APP_ID_CURL, version_after(ua, "curl/")));
    }
    if ua.contains("Wget/") {
        return Some((APP_ID_WGET, version_after(ua, "Wget/")));
    }
    if ua.contains("Firefox/") {
        return Some((APP_ID_FIREFOX, version_after(ua, "Firefox/")));
    }
    if ua.contains("Chrome/") || ua.contains("Chromium/") {
        return Some((APP_ID_CHROME, version_after(ua, "Chrome/")));
    }
    if ua.contains("Safari/") {
        return Some((APP_ID_SAFARI, version_after(ua, "Version/")));
    }
    None
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// Sniff whether a segment looks like the start of an HTTP/1 transaction.
pub fn looks_like_http(data: &[u8], direction: Direction) -> bool {
    match direction {
        Direction::Initiator => VALID_METHODS
            .iter()
            .any(|m| data.starts_with(m.as_bytes()) && data.get(m.len()) == Some(&b' ')),
        Direction::Responder => data.starts_with(b"HTTP/"),
    }
}

/// Inspect one segment of an HTTP/1 flow, updating the session's HTTP
/// state and client identity.
pub fn inspect(ctx: &mut InspectCtx, data: &[u8]) {
    match ctx.direction {
        Direction::Initiator => {
            let Some(request) = parse_request(data) else {
                return;
            };

            ctx.session.set_session_flags(APPID_SESSION_HTTP_SESSION);
            ctx.session.scan_flags |= SCAN_HTTP_HOST_URL_FLAG;
            ctx.session.set_service_appid_data(APP_ID_HTTP, None, ctx.change_bits);

            let index = match ctx.session.hsessions.is_empty() {
                true => ctx.session.create_http_session(0),
                false => 0,
            };

            let host = request.headers.get("host").cloned();
            let user_agent = request.headers.get("user-agent").cloned();
            let referer = request.headers.get("referer").cloned();
            let via = request.headers.get("via").cloned();
            let url = host.as_ref().map(|h| format!("http://{}{}", h, request.uri));

            if let Some(hsession) = ctx.session.get_http_session_mut(index) {
                hsession.set_field(HttpField::Host, host, ctx.change_bits);
                hsession.set_field(HttpField::Uri, Some(request.uri.clone()), ctx.change_bits);
                hsession.set_field(HttpField::Url, url, ctx.change_bits);
                hsession.set_field(HttpField::Referer, referer, ctx.change_bits);
                hsession.set_field(HttpField::Via, via, ctx.change_bits);
                hsession.set_field(HttpField::UserAgent, user_agent.clone(), ctx.change_bits);
            }

            if let Some(ua) = user_agent {
                if let Some((client_id, version)) = client_from_user_agent(&ua) {
                    if let Some(hsession) = ctx.session.get_http_session_mut(index) {
                        hsession.set_client(client_id, version.as_deref(), ctx.change_bits);
                    }
                }
            }
        }
        Direction::Responder => {
            let Some(response) = parse_response(data) else {
                return;
            };
            if let Some(hsession) = ctx.session.get_http_session_mut(0) {
                hsession.response_code = response.status_code;
            }
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
            80,
            1000,
            None,
        )
    }

    fn inspect_segment(asd: &mut AppIdSession, direction: Direction, data: &[u8]) -> ChangeBits {
        let app_info = AppInfoTable::new();
        let mut bits = ChangeBits::new();
        let mut ctx = InspectCtx {
            session: asd,
            app_info: &app_info,
            change_bits: &mut bits,
            direction,
            packet_time: 1000,
        };
        inspect(&mut ctx, data);
        bits
    }

    #[test]
    fn test_parse_get_request() {
        let request = parse_request(
            b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: Mozilla/5.0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.uri, "/index.html");
        assert_eq!(request.headers.get("host").unwrap(), "example.com");
        assert_eq!(request.headers.get("user-agent").unwrap(), "Mozilla/5.0");
    }

    #[test]
    fn test_parse_response() {
        let response =
            parse_response(b"HTTP/1.1 404 Not Found\r\nContent-Type: text/html\r\n\r\n").unwrap();
        assert_eq!(response.status_code, 404);
        assert_eq!(response.headers.get("content-type").unwrap(), "text/html");
    }

    #[test]
    fn test_non_http_payload() {
        assert!(parse_request(b"\x16\x03\x01\x00\xf1").is_none());
        assert!(parse_response(b"SSH-2.0-OpenSSH\r\n").is_none());
        assert!(!looks_like_http(b"\x16\x03\x01", Direction::Initiator));
        assert!(looks_like_http(b"GET / HTTP/1.1\r\n", Direction::Initiator));
        assert!(looks_like_http(b"HTTP/1.1 200 OK\r\n", Direction::Responder));
    }

    #[test]
    fn test_inspect_request_fills_session() {
        let mut asd = session();
        let bits = inspect_segment(
            &mut asd,
            Direction::Initiator,
            b"GET /a/b?q=1 HTTP/1.1\r\nHost: www.example.com\r\n\
              User-Agent: curl/8.5.0\r\nReferer: http://other.example/\r\n\r\n",
        );

        assert!(asd.any_session_flags(APPID_SESSION_HTTP_SESSION));
        assert_eq!(asd.client_inferred_service_id, APP_ID_HTTP);
        let hsession = asd.get_http_session(0).unwrap();
        assert_eq!(hsession.host.as_deref(), Some("www.example.com"));
        assert_eq!(hsession.url.as_deref(), Some("http://www.example.com/a/b?q=1"));
        assert_eq!(hsession.client_id, APP_ID_CURL);
        assert_eq!(hsession.client_version.as_deref(), Some("8.5.0"));
        assert!(bits.any());
    }

    #[test]
    fn test_inspect_response_sets_status() {
        let mut asd = session();
        inspect_segment(&mut asd, Direction::Initiator, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        inspect_segment(&mut asd, Direction::Responder, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(asd.get_http_session(0).unwrap().response_code, 200);
    }

    #[test]
    fn test_client_from_user_agent() {
        assert_eq!(
            client_from_user_agent("curl/8.5.0"),
            Some((APP_ID_CURL, Some("8.5.0".to_string())))
        );
        assert_eq!(
            client_from_user_agent(
                "Mozilla/5.0 (X11; Linux x86_64; rv:122.0) Gecko/20100101 Firefox/122.0"
            )
            .map(|c| c.0),
            Some(APP_ID_FIREFOX)
        );
        // Chrome claims Safari in its UA; Chrome must win
        assert_eq!(
            client_from_user_agent(
                "Mozilla/5.0 (X11) AppleWebKit/537.36 Chrome/121.0.0.0 Safari/537.36"
            )
            .map(|c| c.0),
            Some(APP_ID_CHROME)
        );
        assert_eq!(client_from_user_agent("SomethingElse/1.0"), None);
    }
}
