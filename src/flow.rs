//! # Flow Table
//!
//! Keys and per-flow state for the engine. A flow is the bidirectional
//! transport-layer conversation identified by its 5-tuple plus the address
//! space it was observed in. The upstream flow manager serializes the
//! packets of one flow onto one thread, so the table only needs cheap
//! per-entry locking; cross-flow concurrency comes from [`DashMap`] shards.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;

use crate::protocols::http2::Http2FlowData;
use crate::protocols::smb2::Smb2FlowData;
use crate::session::{AppIdSession, SessionApi};

/// IP protocol number for TCP.
pub const IP_PROTO_TCP: u8 = 6;
/// IP protocol number for UDP.
pub const IP_PROTO_UDP: u8 = 17;

/// Well-known stash key under which the published identity snapshot lives.
pub const STASH_APPID_DATA: &str = "appid_data";

// ---------------------------------------------------------------------------
// Flow Key
// ---------------------------------------------------------------------------

/// A 5-tuple (plus address space id) identifying a network flow.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// IP protocol number (6=TCP, 17=UDP).
    pub proto: u8,
    /// Address space id distinguishing overlapping address realms.
    pub asid: u16,
}

impl FlowKey {
    pub fn new(
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        proto: u8,
        asid: u16,
    ) -> Self {
        Self { src_ip, dst_ip, src_port, dst_port, proto, asid }
    }

    /// Return the canonical (bidirectional) key so that both directions of
    /// a flow map to the same table entry.
    pub fn canonical(&self) -> Self {
        if (self.src_ip, self.src_port) <= (self.dst_ip, self.dst_port) {
            self.clone()
        } else {
            Self {
                src_ip: self.dst_ip,
                dst_ip: self.src_ip,
                src_port: self.dst_port,
                dst_port: self.src_port,
                proto: self.proto,
                asid: self.asid,
            }
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto_name = match self.proto {
            IP_PROTO_TCP => "tcp",
            IP_PROTO_UDP => "udp",
            _ => "other",
        };
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, proto_name
        )
    }
}

// ---------------------------------------------------------------------------
// Flow stash
// ---------------------------------------------------------------------------

/// Per-flow storage for objects that must outlive the session that created
/// them. The published identity snapshot is stored here under
/// [`STASH_APPID_DATA`] on first publication; subscribers holding the Arc
/// keep reading the same object for the rest of the flow.
#[derive(Debug, Default)]
pub struct FlowStash {
    items: HashMap<&'static str, Arc<SessionApi>>,
}

impl FlowStash {
    /// Store an object under a well-known key. Later stores under the same
    /// key are ignored; the first object wins.
    pub fn store(&mut self, key: &'static str, item: Arc<SessionApi>) {
        self.items.entry(key).or_insert(item);
    }

    pub fn get(&self, key: &'static str) -> Option<&Arc<SessionApi>> {
        self.items.get(key)
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// Per-flow engine state: the AppID session, the stash, and protocol
/// inspector state.
#[derive(Debug)]
pub struct Flow {
    pub key: FlowKey,
    pub session: Option<AppIdSession>,
    pub stash: FlowStash,
    /// Set when the flow was picked up after its first packets were missed.
    pub midstream: bool,
    /// Set when traffic is carried through a non-transparent proxy that can
    /// hand the engine decrypted payload after an encryption upgrade.
    pub proxied: bool,
    pub http2_data: Option<Http2FlowData>,
    pub smb2_data: Option<Smb2FlowData>,
}

impl Flow {
    pub fn new(key: FlowKey) -> Self {
        Self {
            key,
            session: None,
            stash: FlowStash::default(),
            midstream: false,
            proxied: false,
            http2_data: None,
            smb2_data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Flow Table
// ---------------------------------------------------------------------------

/// Concurrent flow table keyed by canonical flow key.
///
/// Each entry carries its own lock; the upstream per-flow serialization
/// guarantees the lock is uncontended in steady state.
pub struct FlowTable {
    flows: DashMap<FlowKey, Arc<Mutex<Flow>>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self { flows: DashMap::new() }
    }

    /// Find or create the flow for a key.
    pub fn find_else_create(&self, key: &FlowKey) -> Arc<Mutex<Flow>> {
        let canonical = key.canonical();
        self.flows
            .entry(canonical.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Flow::new(canonical))))
            .clone()
    }

    /// Look up an existing flow.
    pub fn find(&self, key: &FlowKey) -> Option<Arc<Mutex<Flow>>> {
        self.flows.get(&key.canonical()).map(|f| f.clone())
    }

    /// Remove a flow from the table, returning it for teardown.
    pub fn remove(&self, key: &FlowKey) -> Option<Arc<Mutex<Flow>>> {
        self.flows.remove(&key.canonical()).map(|(_, f)| f)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a flow entry, recovering from a poisoned mutex.
///
/// Packet processing never panics while holding the flow lock, but a test
/// thread might; the flow state itself stays coherent either way.
pub fn lock_flow(flow: &Arc<Mutex<Flow>>) -> MutexGuard<'_, Flow> {
    flow.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
