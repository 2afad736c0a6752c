//! # HTTP and DNS Session Records
//!
//! Per-stream HTTP state attached to an AppID session. HTTP/1 flows have a
//! single HTTP session; HTTP/2 flows grow one per stream, looked up by
//! stream id. Field stores set the matching change bit so subscribers see
//! exactly what moved.

use crate::app_info::{AppId, APP_ID_NONE};
use crate::change_bits::{ChangeBit, ChangeBits};

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Identifies one free-text field of an HTTP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpField {
    Host,
    Url,
    Uri,
    UserAgent,
    Referer,
    Via,
}

impl HttpField {
    fn change_bit(&self) -> ChangeBit {
        match self {
            HttpField::Host => ChangeBit::Host,
            HttpField::Url => ChangeBit::Url,
            HttpField::Uri => ChangeBit::Url,
            HttpField::UserAgent => ChangeBit::UserAgent,
            HttpField::Referer => ChangeBit::Referrer,
            HttpField::Via => ChangeBit::Host,
        }
    }
}

// ---------------------------------------------------------------------------
// AppIdHttpSession
// ---------------------------------------------------------------------------

/// HTTP-derived identity and metadata for one stream.
#[derive(Debug, Clone, Default)]
pub struct AppIdHttpSession {
    pub http2_stream_id: u32,
    pub host: Option<String>,
    pub url: Option<String>,
    pub uri: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub via: Option<String>,
    pub response_code: u16,
    pub client_id: AppId,
    pub client_version: Option<String>,
    pub payload_id: AppId,
    pub misc_app_id: AppId,
    pub referred_payload_app_id: AppId,
}

impl AppIdHttpSession {
    pub fn new(http2_stream_id: u32) -> Self {
        Self { http2_stream_id, ..Default::default() }
    }

    /// Store a field value, flagging the change. Passing `None` clears the
    /// field without flagging.
    pub fn set_field(&mut self, field: HttpField, value: Option<String>, change_bits: &mut ChangeBits) {
        let slot = match field {
            HttpField::Host => &mut self.host,
            HttpField::Url => &mut self.url,
            HttpField::Uri => &mut self.uri,
            HttpField::UserAgent => &mut self.user_agent,
            HttpField::Referer => &mut self.referer,
            HttpField::Via => &mut self.via,
        };

        if value.is_some() {
            *slot = value;
            change_bits.set(field.change_bit());
        } else {
            *slot = None;
        }
    }

    pub fn get_field(&self, field: HttpField) -> Option<&str> {
        match field {
            HttpField::Host => self.host.as_deref(),
            HttpField::Url => self.url.as_deref(),
            HttpField::Uri => self.uri.as_deref(),
            HttpField::UserAgent => self.user_agent.as_deref(),
            HttpField::Referer => self.referer.as_deref(),
            HttpField::Via => self.via.as_deref(),
        }
    }

    /// Set the stream's client id; a version flags client info.
    pub fn set_client(&mut self, id: AppId, version: Option<&str>, change_bits: &mut ChangeBits) {
        self.client_id = id;
        if let Some(version) = version {
            self.client_version = Some(version.to_string());
        }
        change_bits.set(ChangeBit::ClientInfo);
    }

    /// Set the stream's payload id.
    pub fn set_payload(&mut self, id: AppId, change_bits: &mut ChangeBits) {
        if self.payload_id != id {
            self.payload_id = id;
            change_bits.set(ChangeBit::PayloadInfo);
        }
    }

    /// Set the payload the request was referred from.
    pub fn set_referred_payload(&mut self, id: AppId, change_bits: &mut ChangeBits) {
        if id > APP_ID_NONE && self.referred_payload_app_id != id {
            self.referred_payload_app_id = id;
            change_bits.set(ChangeBit::ReferredInfo);
        }
    }

    /// Drop every stored field and identity.
    pub fn clear_all_fields(&mut self) {
        *self = Self::new(self.http2_stream_id);
    }
}

// ---------------------------------------------------------------------------
// AppIdDnsSession
// ---------------------------------------------------------------------------

/// DNS query state for flows classified as DNS.
#[derive(Debug, Clone, Default)]
pub struct AppIdDnsSession {
    pub host: Option<String>,
    pub record_type: u16,
    pub response_type: u8,
    pub ttl: u32,
}

impl AppIdDnsSession {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_field_flags_change() {
        let mut hs = AppIdHttpSession::new(0);
        let mut bits = ChangeBits::new();

        hs.set_field(HttpField::Host, Some("example.com".into()), &mut bits);
        assert!(bits.is_set(ChangeBit::Host));
        assert_eq!(hs.get_field(HttpField::Host), Some("example.com"));

        // clearing does not flag
        let mut bits = ChangeBits::new();
        hs.set_field(HttpField::Host, None, &mut bits);
        assert!(bits.none());
        assert_eq!(hs.get_field(HttpField::Host), None);
    }

    #[test]
    fn test_set_payload_deduplicates() {
        let mut hs = AppIdHttpSession::new(3);
        let mut bits = ChangeBits::new();
        hs.set_payload(42, &mut bits);
        assert!(bits.is_set(ChangeBit::PayloadInfo));

        let mut bits = ChangeBits::new();
        hs.set_payload(42, &mut bits);
        assert!(bits.none());
    }

    #[test]
    fn test_clear_all_fields_keeps_stream_id() {
        let mut hs = AppIdHttpSession::new(7);
        let mut bits = ChangeBits::new();
        hs.set_field(HttpField::Url, Some("http://x/".into()), &mut bits);
        hs.set_client(10, Some("1.0"), &mut bits);
        hs.clear_all_fields();
        assert_eq!(hs.http2_stream_id, 7);
        assert_eq!(hs.url, None);
        assert_eq!(hs.client_id, APP_ID_NONE);
    }
}
