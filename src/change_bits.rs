//! # Change Bits
//!
//! A closed, fixed-width enumeration of semantic change kinds. The bitset
//! is accumulated while a packet is processed and doubles as the
//! subscription key: subscribers test the bits they care about and skip
//! the rest. Publication happens at end of packet; no bits means no event.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::flow::FlowKey;
use crate::session::SessionApi;

// ---------------------------------------------------------------------------
// Change kinds
// ---------------------------------------------------------------------------

/// One kind of semantic change to the session's identity view.
///
/// The enumeration is closed and stable; values 24..32 are reserved for
/// future extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChangeBit {
    Created = 0,
    Reset = 1,
    ServiceInfo = 2,
    ClientInfo = 3,
    PayloadInfo = 4,
    MiscInfo = 5,
    ReferredInfo = 6,
    Url = 7,
    Host = 8,
    TlsHost = 9,
    Referrer = 10,
    UserAgent = 11,
    UserInfo = 12,
    ProtocolId = 13,
}

impl ChangeBit {
    fn name(&self) -> &'static str {
        match self {
            ChangeBit::Created => "created",
            ChangeBit::Reset => "reset",
            ChangeBit::ServiceInfo => "service-info",
            ChangeBit::ClientInfo => "client-info",
            ChangeBit::PayloadInfo => "payload-info",
            ChangeBit::MiscInfo => "misc-info",
            ChangeBit::ReferredInfo => "referred-info",
            ChangeBit::Url => "url",
            ChangeBit::Host => "host",
            ChangeBit::TlsHost => "tls-host",
            ChangeBit::Referrer => "referrer",
            ChangeBit::UserAgent => "user-agent",
            ChangeBit::UserInfo => "user-info",
            ChangeBit::ProtocolId => "protocol-id",
        }
    }

    const ALL: [ChangeBit; 14] = [
        ChangeBit::Created,
        ChangeBit::Reset,
        ChangeBit::ServiceInfo,
        ChangeBit::ClientInfo,
        ChangeBit::PayloadInfo,
        ChangeBit::MiscInfo,
        ChangeBit::ReferredInfo,
        ChangeBit::Url,
        ChangeBit::Host,
        ChangeBit::TlsHost,
        ChangeBit::Referrer,
        ChangeBit::UserAgent,
        ChangeBit::UserInfo,
        ChangeBit::ProtocolId,
    ];
}

// ---------------------------------------------------------------------------
// Bitset accumulator
// ---------------------------------------------------------------------------

/// Per-packet accumulator of change bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeBits(u32);

impl ChangeBits {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn set(&mut self, bit: ChangeBit) {
        self.0 |= 1 << bit as u32;
    }

    pub fn is_set(&self, bit: ChangeBit) -> bool {
        self.0 & (1 << bit as u32) != 0
    }

    pub fn any(&self) -> bool {
        self.0 != 0
    }

    pub fn none(&self) -> bool {
        self.0 == 0
    }

    /// Clear every bit.
    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Display for ChangeBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for bit in ChangeBit::ALL {
            if self.is_set(bit) {
                if !first {
                    f.write_str(", ")?;
                }
                f.write_str(bit.name())?;
                first = false;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A published change event: the bitset of what changed plus the shared
/// identity snapshot of the flow it changed on.
#[derive(Debug, Clone)]
pub struct AppidEvent {
    pub bits: ChangeBits,
    pub api: Arc<SessionApi>,
    pub flow_key: FlowKey,
    pub packet_time: u32,
    pub is_http2: bool,
    /// Stream index of the HTTP session the event concerns; meaningful
    /// only when `is_http2` is set.
    pub http2_stream_index: u32,
}

/// Fan-out point for change events.
///
/// The engine owns the sender; subscribers drain the paired receiver.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: Sender<AppidEvent>,
}

impl EventPublisher {
    /// Create a publisher and the receiver subscribers drain.
    pub fn channel() -> (Self, Receiver<AppidEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: AppidEvent) {
        tracing::debug!(flow = %event.flow_key, changes = %event.bits, "published appid event");
        // Send fails only when every receiver is gone; the event is then
        // moot anyway.
        let _ = self.tx.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_test() {
        let mut bits = ChangeBits::new();
        assert!(bits.none());
        bits.set(ChangeBit::Url);
        bits.set(ChangeBit::Host);
        assert!(bits.any());
        assert!(bits.is_set(ChangeBit::Url));
        assert!(!bits.is_set(ChangeBit::Created));
        bits.reset();
        assert!(bits.none());
    }

    #[test]
    fn test_display() {
        let mut bits = ChangeBits::new();
        bits.set(ChangeBit::Created);
        bits.set(ChangeBit::TlsHost);
        assert_eq!(bits.to_string(), "created, tls-host");
    }

    #[test]
    fn test_channel_roundtrip() {
        let (publisher, rx) = EventPublisher::channel();
        let mut bits = ChangeBits::new();
        bits.set(ChangeBit::ServiceInfo);
        publisher.publish(AppidEvent {
            bits,
            api: Arc::new(SessionApi::default()),
            flow_key: crate::flow::FlowKey::new(
                "10.0.0.1".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
                1234,
                80,
                crate::flow::IP_PROTO_TCP,
                0,
            ),
            packet_time: 1,
            is_http2: false,
            http2_stream_index: 0,
        });
        let event = rx.try_recv().unwrap();
        assert!(event.bits.is_set(ChangeBit::ServiceInfo));
    }
}
