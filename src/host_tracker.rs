//! # Host Tracker
//!
//! Per-host aggregation of observed facts: MAC addresses, network and
//! transport protocols, services with version/vendor info and payloads,
//! clients, and protocol fingerprints. Trackers live in the
//! [host cache](crate::host_cache) and are shared across packet threads;
//! every operation takes the tracker's own lock.
//!
//! ## Visibility
//!
//! Deletion is soft. A tracker is "visible" while its stored epoch equals
//! the cache's current valid id; retiring a host records the invalid epoch
//! and cascades invisibility down to every child collection. Individual
//! items carry their own visible flag, and each collection keeps a running
//! count of visible members.
//!
//! Bounded collections reuse the first invisible slot on insertion (the
//! invisible-swap policy) so a soft delete gives capacity back without
//! growing the underlying vector.
//!
//! All mutating and reading operations return whether state changed. The
//! cache epoch passed into [`HostTracker::set_visibility`] and
//! [`HostTracker::is_visible`] must be sampled *before* calling, outside
//! the tracker lock; the lock order is cache before tracker.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::app_info::{AppId, APP_ID_NONE};

/// Length of a MAC address in bytes.
pub const MAC_SIZE: usize = 6;

/// The all-zero MAC, rejected on add.
pub const ZERO_MAC: [u8; MAC_SIZE] = [0; MAC_SIZE];

/// Visibility epoch recorded for a retired tracker. Valid cache epochs
/// start at 1, so this value never matches a live cache.
pub const INVALID_EPOCH: u64 = 0;

/// User login mask bit: at least one successful login seen.
pub const USER_LOGIN_SUCCESS: u8 = 1;
/// User login mask bit: at least one failed login seen.
pub const USER_LOGIN_FAILURE: u8 = 2;

// ---------------------------------------------------------------------------
// Operation statistics
// ---------------------------------------------------------------------------

/// Cumulative counters for tracker operations, process-wide.
#[derive(Debug, Default)]
pub struct HostTrackerStats {
    pub service_adds: AtomicU64,
    pub service_finds: AtomicU64,
}

/// Process-wide tracker operation counters.
pub static HOST_TRACKER_STATS: HostTrackerStats =
    HostTrackerStats { service_adds: AtomicU64::new(0), service_finds: AtomicU64::new(0) };

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// Classification of the host's role on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostType {
    #[default]
    Host,
    Router,
    Bridge,
    Nat,
    LoadBalancer,
}

impl HostType {
    fn as_str(&self) -> &'static str {
        match self {
            HostType::Host => "Host",
            HostType::Router => "Router",
            HostType::Bridge => "Bridge",
            HostType::Nat => "NAT",
            HostType::LoadBalancer => "Load Balancer",
        }
    }
}

/// One observed MAC address.
#[derive(Debug, Clone)]
pub struct HostMac {
    pub mac: [u8; MAC_SIZE],
    pub ttl: u8,
    pub primary: bool,
    pub last_seen: u32,
    pub visible: bool,
}

/// A payload observed on a service or client: (app id, visible flag).
pub type Payload = (AppId, bool);

/// Version/vendor details attached to a service.
#[derive(Debug, Clone)]
pub struct HostApplicationInfo {
    pub version: String,
    pub vendor: String,
    pub visible: bool,
}

/// One service observed on the host, keyed by (port, proto).
#[derive(Debug, Clone, Default)]
pub struct HostApplication {
    pub port: u16,
    pub proto: u8,
    pub appid: AppId,
    pub inferred_appid: bool,
    pub hits: u32,
    pub last_seen: u32,
    pub user: String,
    pub user_login: u8,
    pub banner_updated: bool,
    pub visible: bool,
    pub info: Vec<HostApplicationInfo>,
    pub payloads: Vec<Payload>,
    pub num_visible_payloads: usize,
}

impl HostApplication {
    fn new(port: u16, proto: u8, appid: AppId, inferred_appid: bool, hits: u32, lseen: u32) -> Self {
        Self {
            port,
            proto,
            appid,
            inferred_appid,
            hits,
            last_seen: lseen,
            visible: true,
            ..Default::default()
        }
    }
}

/// One client application observed from the host.
#[derive(Debug, Clone, Default)]
pub struct HostClient {
    pub id: AppId,
    pub service: AppId,
    pub version: String,
    pub visible: bool,
    pub payloads: Vec<Payload>,
    pub num_visible_payloads: usize,
}

impl HostClient {
    fn new(id: AppId, version: Option<&str>, service: AppId) -> Self {
        Self {
            id,
            service,
            version: version.unwrap_or_default().to_string(),
            visible: true,
            ..Default::default()
        }
    }

    fn same_identity(&self, other: &HostClient) -> bool {
        self.id == other.id && self.service == other.service && self.version == other.version
    }
}

/// A user-agent fingerprint record.
#[derive(Debug, Clone)]
pub struct DeviceFingerprint {
    pub fpid: u32,
    pub fp_type: u32,
    pub jail_broken: bool,
    pub device: String,
}

/// VLAN tag observed on the host's traffic.
#[derive(Debug, Clone, Copy)]
pub struct VlanTag {
    pub pri_cfi_vlan: u16,
    pub proto: u16,
}

impl VlanTag {
    pub fn vid(&self) -> u16 {
        self.pri_cfi_vlan & 0x0fff
    }

    pub fn cfi(&self) -> u8 {
        ((self.pri_cfi_vlan >> 12) & 0x1) as u8
    }

    pub fn priority(&self) -> u8 {
        (self.pri_cfi_vlan >> 13) as u8
    }
}

// ---------------------------------------------------------------------------
// HostTracker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct HostTrackerInner {
    last_seen: u32,
    last_event: Option<u32>,
    hops: u8,
    ip_ttl: u8,
    host_type: HostType,
    vlan: Option<VlanTag>,
    visibility: u64,
    macs: Vec<HostMac>,
    network_protos: Vec<(u16, bool)>,
    xport_protos: Vec<(u8, bool)>,
    services: Vec<HostApplication>,
    clients: Vec<HostClient>,
    tcp_fpids: HashSet<u32>,
    udp_fpids: HashSet<u32>,
    ua_fps: Vec<DeviceFingerprint>,
    num_visible_macs: usize,
    num_visible_services: usize,
    num_visible_clients: usize,
}

/// The per-host record. All public operations lock the tracker.
#[derive(Debug)]
pub struct HostTracker {
    inner: Mutex<HostTrackerInner>,
}

impl HostTracker {
    /// Create a tracker live at the given cache epoch.
    pub fn new(epoch: u64, last_seen: u32) -> Self {
        Self {
            inner: Mutex::new(HostTrackerInner {
                last_seen,
                last_event: None,
                hops: u8::MAX,
                ip_ttl: 0,
                host_type: HostType::Host,
                vlan: None,
                visibility: epoch,
                macs: Vec::new(),
                network_protos: Vec::new(),
                xport_protos: Vec::new(),
                services: Vec::new(),
                clients: Vec::new(),
                tcp_fpids: HashSet::new(),
                udp_fpids: HashSet::new(),
                ua_fps: Vec::new(),
                num_visible_macs: 0,
                num_visible_services: 0,
                num_visible_clients: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostTrackerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn update_last_seen(&self, now: u32) {
        self.lock().last_seen = now;
    }

    pub fn last_seen(&self) -> u32 {
        self.lock().last_seen
    }

    /// Record the time of the last published event; zero means "use the
    /// host's last-seen time".
    pub fn update_last_event(&self, time: u32) {
        let mut t = self.lock();
        t.last_event = Some(if time != 0 { time } else { t.last_seen });
    }

    pub fn last_event(&self) -> Option<u32> {
        self.lock().last_event
    }

    pub fn set_host_type(&self, host_type: HostType) {
        self.lock().host_type = host_type;
    }

    pub fn set_ip_ttl(&self, ttl: u8) {
        self.lock().ip_ttl = ttl;
    }

    pub fn set_hops(&self, hops: u8) {
        self.lock().hops = hops;
    }

    pub fn update_vlan(&self, pri_cfi_vlan: u16, proto: u16) {
        self.lock().vlan = Some(VlanTag { pri_cfi_vlan, proto });
    }

    pub fn has_vlan(&self) -> bool {
        self.lock().vlan.is_some()
    }

    pub fn get_vlan(&self) -> Option<VlanTag> {
        self.lock().vlan
    }

    // -----------------------------------------------------------------------
    // Protocols
    // -----------------------------------------------------------------------

    /// Record a network-layer protocol. Re-marks an invisible entry visible.
    pub fn add_network_proto(&self, proto: u16) -> bool {
        let mut t = self.lock();
        for p in &mut t.network_protos {
            if p.0 == proto {
                if p.1 {
                    return false;
                }
                p.1 = true;
                return true;
            }
        }
        t.network_protos.push((proto, true));
        true
    }

    /// Record a transport-layer protocol. Re-marks an invisible entry visible.
    pub fn add_xport_proto(&self, proto: u8) -> bool {
        let mut t = self.lock();
        for p in &mut t.xport_protos {
            if p.0 == proto {
                if p.1 {
                    return false;
                }
                p.1 = true;
                return true;
            }
        }
        t.xport_protos.push((proto, true));
        true
    }

    pub fn set_network_proto_visibility(&self, proto: u16, v: bool) -> bool {
        let mut t = self.lock();
        for p in &mut t.network_protos {
            if p.0 == proto {
                p.1 = v;
                return true;
            }
        }
        false
    }

    pub fn set_xport_proto_visibility(&self, proto: u8, v: bool) -> bool {
        let mut t = self.lock();
        for p in &mut t.xport_protos {
            if p.0 == proto {
                p.1 = v;
                return true;
            }
        }
        false
    }

    // -----------------------------------------------------------------------
    // MACs
    // -----------------------------------------------------------------------

    /// Record a MAC address for this host.
    ///
    /// Rejects the all-zero MAC. An already-visible MAC is a no-op; a
    /// previously retired one is re-marked visible. New MACs reuse the
    /// first invisible slot when one exists.
    pub fn add_mac(&self, mac: &[u8; MAC_SIZE], ttl: u8, primary: bool) -> bool {
        if *mac == ZERO_MAC {
            return false;
        }

        let mut guard = self.lock();
        let t = &mut *guard;
        let mut swap_candidate = None;

        for (i, hm) in t.macs.iter_mut().enumerate() {
            if hm.mac == *mac {
                if hm.visible {
                    return false;
                }
                hm.visible = true;
                t.num_visible_macs += 1;
                return true;
            }
            if swap_candidate.is_none() && !hm.visible {
                swap_candidate = Some(i);
            }
        }

        if let Some(i) = swap_candidate {
            let hm = &mut t.macs[i];
            hm.mac = *mac;
            hm.ttl = ttl;
            hm.primary = primary;
            hm.visible = true;
            t.num_visible_macs += 1;
            return true;
        }

        let last_seen = t.last_seen;
        t.macs.push(HostMac { mac: *mac, ttl, primary, last_seen, visible: true });
        t.num_visible_macs += 1;
        true
    }

    /// Fetch the visible record for a MAC, if present.
    pub fn get_hostmac(&self, mac: &[u8; MAC_SIZE]) -> Option<HostMac> {
        if *mac == ZERO_MAC {
            return None;
        }
        let t = self.lock();
        t.macs.iter().find(|hm| hm.mac == *mac).filter(|hm| hm.visible).cloned()
    }

    /// Return the most recently seen visible MAC, or the zero MAC.
    pub fn get_last_seen_mac(&self) -> [u8; MAC_SIZE] {
        let t = self.lock();
        t.macs
            .iter()
            .filter(|hm| hm.visible)
            .max_by_key(|hm| hm.last_seen)
            .map_or(ZERO_MAC, |hm| hm.mac)
    }

    /// Raise a visible MAC's TTL. Returns false if the TTL would not grow.
    pub fn update_mac_ttl(&self, mac: &[u8; MAC_SIZE], new_ttl: u8) -> bool {
        if *mac == ZERO_MAC {
            return false;
        }
        let mut t = self.lock();
        for hm in &mut t.macs {
            if hm.mac == *mac {
                if hm.ttl < new_ttl && hm.visible {
                    hm.ttl = new_ttl;
                    return true;
                }
                return false;
            }
        }
        false
    }

    /// Promote a visible MAC to primary. Returns false if it already was.
    pub fn make_primary(&self, mac: &[u8; MAC_SIZE]) -> bool {
        if *mac == ZERO_MAC {
            return false;
        }
        let mut t = self.lock();
        let last_seen = t.last_seen;
        for hm in &mut t.macs {
            if hm.mac == *mac {
                if !hm.visible {
                    return false;
                }
                hm.last_seen = last_seen;
                if !hm.primary {
                    hm.primary = true;
                    return true;
                }
                return false;
            }
        }
        false
    }

    /// Return the primary visible MAC, or the visible MAC with the highest
    /// TTL.
    pub fn get_max_ttl_hostmac(&self) -> Option<HostMac> {
        let t = self.lock();
        if let Some(primary) = t.macs.iter().find(|hm| hm.primary && hm.visible) {
            return Some(primary.clone());
        }
        t.macs.iter().filter(|hm| hm.visible && hm.ttl > 0).max_by_key(|hm| hm.ttl).cloned()
    }

    /// Snapshot hop count, last-seen time and the MAC list.
    pub fn copy_data(&self) -> (u8, u32, Vec<HostMac>) {
        let t = self.lock();
        (t.hops, t.last_seen, t.macs.clone())
    }

    // -----------------------------------------------------------------------
    // Services
    // -----------------------------------------------------------------------

    /// Record a service on (port, proto).
    ///
    /// An existing entry gets its appid updated when `appid` is non-NONE
    /// and different, and is re-materialized if its visibility had been
    /// dropped. Returns whether anything changed.
    pub fn add_service(&self, port: u16, proto: u8, appid: AppId, inferred_appid: bool) -> bool {
        HOST_TRACKER_STATS.service_adds.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.lock();
        let t = &mut *guard;

        for i in 0..t.services.len() {
            if t.services[i].port == port && t.services[i].proto == proto {
                let mut added = false;
                let s = &mut t.services[i];
                if s.appid != appid && appid != APP_ID_NONE {
                    s.appid = appid;
                    s.inferred_appid = inferred_appid;
                    added = true;
                }
                if !s.visible {
                    s.visible = true;
                    added = true;
                    t.num_visible_services += 1;
                }
                return added;
            }
        }

        t.services.push(HostApplication::new(port, proto, appid, inferred_appid, 0, 0));
        t.num_visible_services += 1;
        true
    }

    /// Look up the appid recorded for (port, proto).
    pub fn get_appid(
        &self,
        port: u16,
        proto: u8,
        inferred_only: bool,
        allow_port_wildcard: bool,
    ) -> AppId {
        HOST_TRACKER_STATS.service_finds.fetch_add(1, Ordering::Relaxed);
        let t = self.lock();
        for s in &t.services {
            let matched =
                s.port == port && s.proto == proto && (!inferred_only || s.inferred_appid);
            if matched || (allow_port_wildcard && s.inferred_appid) {
                return s.appid;
            }
        }
        APP_ID_NONE
    }

    /// Number of visible services.
    pub fn get_service_count(&self) -> usize {
        self.lock().num_visible_services
    }

    /// Number of visible clients.
    pub fn get_client_count(&self) -> usize {
        self.lock().num_visible_clients
    }

    /// Combined lookup/insert used on the per-packet path.
    ///
    /// Updates hit counts and last-seen on an existing entry; an appid
    /// change or a rediscovery restarts the hit count. New services reuse
    /// the first invisible slot; once `max_services` visible services exist
    /// (and no slot is free) the insert is refused. `max_services == 0`
    /// means unbounded.
    ///
    /// Returns a snapshot of the entry and whether it counts as new.
    pub fn find_and_add_service(
        &self,
        port: u16,
        proto: u8,
        lseen: u32,
        appid: AppId,
        max_services: u16,
    ) -> Option<(HostApplication, bool)> {
        let mut t = self.lock();
        let (idx, is_new) =
            Self::find_and_add_service_no_lock(&mut t, port, proto, lseen, appid, max_services)?;
        Some((t.services[idx].clone(), is_new))
    }

    fn find_and_add_service_no_lock(
        t: &mut HostTrackerInner,
        port: u16,
        proto: u8,
        lseen: u32,
        appid: AppId,
        max_services: u16,
    ) -> Option<(usize, bool)> {
        HOST_TRACKER_STATS.service_finds.fetch_add(1, Ordering::Relaxed);
        let mut available = None;

        for i in 0..t.services.len() {
            let s = &mut t.services[i];
            if s.port == port && s.proto == proto {
                let mut is_new = false;
                if (appid != APP_ID_NONE && s.appid != appid) || !s.visible {
                    s.appid = appid;
                    is_new = true;
                    if !s.visible {
                        // rediscovery: the hit count restarts at this packet
                        s.hits = 1;
                        s.visible = true;
                        t.num_visible_services += 1;
                    } else {
                        // appid overwrite on a live service
                        s.hits = 0;
                    }
                } else if s.last_seen == 0 {
                    is_new = true;
                    s.hits = 1;
                } else {
                    s.hits += 1;
                }
                s.last_seen = lseen;
                return Some((i, is_new));
            }
            if available.is_none() && !s.visible {
                available = Some(i);
            }
        }

        HOST_TRACKER_STATS.service_adds.fetch_add(1, Ordering::Relaxed);
        if let Some(i) = available {
            let s = &mut t.services[i];
            s.port = port;
            s.proto = proto;
            s.appid = appid;
            s.hits = 1;
            s.last_seen = lseen;
            s.inferred_appid = false;
            s.user.clear();
            s.user_login = 0;
            s.banner_updated = false;
            s.visible = true;
            t.num_visible_services += 1;
            return Some((i, true));
        }

        if max_services == 0 || t.num_visible_services < max_services as usize {
            t.services.push(HostApplication::new(port, proto, appid, false, 1, lseen));
            t.num_visible_services += 1;
            return Some((t.services.len() - 1, true));
        }

        None
    }

    /// Attach version/vendor info to the service matching `ha`.
    ///
    /// An exact (vendor, version) match rediscovers a previously invisible
    /// info record; otherwise the first invisible info slot is reused, and
    /// a new record is appended only below `max_info`. On success `ha` is
    /// refreshed with the service's appid, visible info and hit count.
    pub fn update_service_info(
        &self,
        ha: &mut HostApplication,
        vendor: Option<&str>,
        version: Option<&str>,
        max_info: u16,
    ) -> bool {
        HOST_TRACKER_STATS.service_finds.fetch_add(1, Ordering::Relaxed);
        let mut t = self.lock();

        let Some(si) = t.services.iter().position(|s| s.port == ha.port && s.proto == ha.proto)
        else {
            return false;
        };
        if !t.services[si].visible {
            return false;
        }
        if vendor.is_none() && version.is_none() {
            return true;
        }

        let mut available = None;
        let mut matched = None;
        for (i, info) in t.services[si].info.iter().enumerate() {
            if version.is_some_and(|v| v == info.version)
                && vendor.is_some_and(|v| v == info.vendor)
            {
                matched = Some((i, info.visible));
                break;
            }
            if available.is_none() && !info.visible {
                available = Some(i);
            }
        }

        if let Some((i, was_visible)) = matched {
            if was_visible {
                return false;
            }
            t.services[si].info[i].visible = true; // rediscover it
            Self::sync_ha_no_lock(ha, &mut t.services[si]);
            return true;
        }

        if let Some(i) = available {
            let info = &mut t.services[si].info[i];
            info.version = version.unwrap_or_default().to_string();
            info.vendor = vendor.unwrap_or_default().to_string();
            info.visible = true;
        } else if t.services[si].info.len() < max_info as usize {
            t.services[si].info.push(HostApplicationInfo {
                version: version.unwrap_or_default().to_string(),
                vendor: vendor.unwrap_or_default().to_string(),
                visible: true,
            });
        } else {
            return false;
        }

        Self::sync_ha_no_lock(ha, &mut t.services[si]);
        true
    }

    /// Reconcile a caller-held service snapshot with the stored entry.
    fn sync_ha_no_lock(ha: &mut HostApplication, s: &mut HostApplication) {
        if ha.appid == APP_ID_NONE {
            ha.appid = s.appid;
        } else {
            s.appid = ha.appid;
        }
        for info in s.info.iter().filter(|i| i.visible) {
            ha.info.push(info.clone());
        }
        ha.hits = s.hits;
    }

    /// Mark the service's banner as captured; at most once per visibility
    /// span.
    pub fn update_service_banner(&self, port: u16, proto: u8) -> bool {
        HOST_TRACKER_STATS.service_finds.fetch_add(1, Ordering::Relaxed);
        let mut t = self.lock();
        for s in &mut t.services {
            if s.port == port && s.proto == proto {
                if !s.visible || s.banner_updated {
                    return false;
                }
                s.banner_updated = true;
                return true;
            }
        }
        false
    }

    /// Record a user login attempt against the service on (port, proto).
    ///
    /// The login mask encodes SUCCESS=1 and FAILURE=2; setting an
    /// already-set bit is a no-op returning false. A changed user name
    /// always returns true and resets the mask to this attempt's outcome.
    pub fn update_service_user(
        &self,
        port: u16,
        proto: u8,
        user: Option<&str>,
        lseen: u32,
        max_services: u16,
        success: bool,
    ) -> bool {
        let mut t = self.lock();

        // User events can arrive before the service event, so find-or-add.
        let Some((idx, _)) = Self::find_and_add_service_no_lock(
            &mut t,
            port,
            proto,
            lseen,
            APP_ID_NONE,
            max_services,
        ) else {
            return false;
        };

        let ha = &mut t.services[idx];
        if !ha.visible {
            return false;
        }

        if let Some(user) = user {
            if user != ha.user {
                ha.user = user.to_string();
                ha.user_login =
                    if success { USER_LOGIN_SUCCESS } else { USER_LOGIN_FAILURE };
                return true;
            }
        }

        let bit = if success { USER_LOGIN_SUCCESS } else { USER_LOGIN_FAILURE };
        if ha.user_login & bit != 0 {
            return false;
        }
        ha.user_login |= bit;
        true
    }

    /// Drop services that were only ever inferred from client traffic.
    pub fn remove_inferred_services(&self) {
        let mut t = self.lock();
        let mut removed_visible = 0;
        t.services.retain(|s| {
            if s.inferred_appid {
                if s.visible {
                    removed_visible += 1;
                }
                false
            } else {
                true
            }
        });
        t.num_visible_services -= removed_visible;
    }

    /// Flip a service's visibility, cascading to its info, user and
    /// payloads.
    pub fn set_service_visibility(&self, port: u16, proto: u8, v: bool) -> bool {
        let mut t = self.lock();
        let mut delta: isize = 0;
        let mut found = false;

        for s in &mut t.services {
            if s.port == port && s.proto == proto {
                if s.visible && !v {
                    delta -= 1;
                } else if !s.visible && v {
                    delta += 1;
                }
                s.visible = v;
                if !v {
                    for info in &mut s.info {
                        info.visible = false;
                    }
                    s.user.clear();
                    s.banner_updated = false;
                }
                set_payload_visibility(&mut s.payloads, v, &mut s.num_visible_payloads);
                found = true;
                break;
            }
        }

        if found {
            t.num_visible_services = (t.num_visible_services as isize + delta) as usize;
        }
        found
    }

    /// Return snapshots of all service records, visible or not.
    pub fn get_services(&self) -> Vec<HostApplication> {
        self.lock().services.clone()
    }

    // -----------------------------------------------------------------------
    // Payloads
    // -----------------------------------------------------------------------

    /// Record a payload on the visible service matching (port, proto,
    /// service appid). Returns whether a payload became visible.
    pub fn add_payload(
        &self,
        port: u16,
        proto: u8,
        payload: AppId,
        service: AppId,
        max_payloads: usize,
    ) -> bool {
        // One lock spans the service lookup and the payload insert.
        let mut t = self.lock();

        let Some(idx) = t.services.iter().position(|s| {
            s.port == port && s.proto == proto && s.visible
                && service != APP_ID_NONE
                && s.appid == service
        }) else {
            return false;
        };

        let s = &mut t.services[idx];
        add_payload_no_lock(payload, &mut s.payloads, &mut s.num_visible_payloads, max_payloads)
    }

    /// Record a payload on the client matching `hc`'s identity. On success
    /// `hc`'s payload snapshot is refreshed.
    pub fn add_client_payload(&self, hc: &mut HostClient, payload: AppId, max_payloads: usize) -> bool {
        let mut t = self.lock();
        for c in &mut t.clients {
            if c.id == hc.id && c.service == hc.service {
                let ok =
                    add_payload_no_lock(payload, &mut c.payloads, &mut c.num_visible_payloads, max_payloads);
                if ok {
                    hc.payloads = c.payloads.clone();
                    hc.version = c.version.clone();
                }
                return ok;
            }
        }
        false
    }

    // -----------------------------------------------------------------------
    // Clients
    // -----------------------------------------------------------------------

    /// Find a client with matching (id, version, service), re-marking it
    /// visible if retired; otherwise insert, reusing the first invisible
    /// slot. Returns the record snapshot and whether it counts as new.
    pub fn find_or_add_client(
        &self,
        id: AppId,
        version: Option<&str>,
        service: AppId,
    ) -> (HostClient, bool) {
        let mut guard = self.lock();
        let t = &mut *guard;
        let mut available = None;

        for i in 0..t.clients.len() {
            let c = &mut t.clients[i];
            if c.id != APP_ID_NONE
                && c.id == id
                && c.service == service
                && c.version.as_str() == version.unwrap_or_default()
            {
                let mut is_new = false;
                if !c.visible {
                    is_new = true;
                    c.visible = true;
                    t.num_visible_clients += 1;
                }
                return (t.clients[i].clone(), is_new);
            }
            if available.is_none() && !c.visible {
                available = Some(i);
            }
        }

        t.num_visible_clients += 1;
        if let Some(i) = available {
            let c = &mut t.clients[i];
            c.id = id;
            c.service = service;
            c.visible = true;
            c.version = version.unwrap_or_default().to_string();
            return (c.clone(), true);
        }

        let c = HostClient::new(id, version, service);
        t.clients.push(c.clone());
        (c, true)
    }

    /// Flip a client's visibility, cascading to its payloads.
    pub fn set_client_visibility(&self, hc: &HostClient, v: bool) -> bool {
        let mut t = self.lock();
        let mut delta: isize = 0;
        let mut changed = false;
        for c in &mut t.clients {
            if c.same_identity(hc) {
                if c.visible && !v {
                    delta -= 1;
                } else if !c.visible && v {
                    delta += 1;
                }
                c.visible = v;
                set_payload_visibility(&mut c.payloads, v, &mut c.num_visible_payloads);
                changed = true;
            }
        }
        t.num_visible_clients = (t.num_visible_clients as isize + delta) as usize;
        changed
    }

    /// Return snapshots of all client records, visible or not.
    pub fn get_clients(&self) -> Vec<HostClient> {
        self.lock().clients.clone()
    }

    // -----------------------------------------------------------------------
    // Fingerprints
    // -----------------------------------------------------------------------

    pub fn add_tcp_fingerprint(&self, fpid: u32) -> bool {
        self.lock().tcp_fpids.insert(fpid)
    }

    pub fn add_udp_fingerprint(&self, fpid: u32) -> bool {
        self.lock().udp_fpids.insert(fpid)
    }

    /// Record a user-agent fingerprint, keeping at most `max_devices`
    /// device variants per (fpid, type).
    pub fn add_ua_fingerprint(
        &self,
        fpid: u32,
        fp_type: u32,
        jail_broken: bool,
        device: Option<&str>,
        max_devices: u8,
    ) -> bool {
        let mut t = self.lock();

        let mut count = 0;
        for fp in &t.ua_fps {
            if fpid != fp.fpid || fp_type != fp.fp_type {
                continue;
            }
            count += 1; // only count same fpid with different device information
            if count >= max_devices as usize {
                return false;
            }
            if jail_broken == fp.jail_broken && fp.device == device.unwrap_or_default() {
                return false;
            }
        }

        t.ua_fps.push(DeviceFingerprint {
            fpid,
            fp_type,
            jail_broken,
            device: device.unwrap_or_default().to_string(),
        });
        true
    }

    // -----------------------------------------------------------------------
    // Visibility
    // -----------------------------------------------------------------------

    /// Set the tracker's visibility.
    ///
    /// `epoch` must be the cache's valid id sampled before this call.
    /// Going invisible records the invalid epoch, clears every child
    /// collection's visible flags and zeroes all visible counts. Returns
    /// true when the visibility value did not change (idempotence signal).
    pub fn set_visibility(&self, v: bool, epoch: u64) -> bool {
        let mut t = self.lock();
        let old_visibility = t.visibility;

        t.visibility = if v { epoch } else { INVALID_EPOCH };

        if t.visibility == INVALID_EPOCH {
            for p in &mut t.network_protos {
                p.1 = false;
            }
            for p in &mut t.xport_protos {
                p.1 = false;
            }
            for hm in &mut t.macs {
                hm.visible = false;
            }
            t.num_visible_macs = 0;

            for s in &mut t.services {
                s.visible = false;
                for info in &mut s.info {
                    info.visible = false;
                }
                s.user.clear();
                set_payload_visibility(&mut s.payloads, false, &mut s.num_visible_payloads);
            }
            t.num_visible_services = 0;

            for c in &mut t.clients {
                c.visible = false;
                set_payload_visibility(&mut c.payloads, false, &mut c.num_visible_payloads);
            }
            t.num_visible_clients = 0;

            t.tcp_fpids.clear();
            t.udp_fpids.clear();
            t.ua_fps.clear();
        }

        old_visibility == t.visibility
    }

    /// Check liveness against the cache's current valid id (sampled by the
    /// caller outside this tracker's lock).
    pub fn is_visible(&self, epoch: u64) -> bool {
        self.lock().visibility == epoch
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    /// Append a deterministic, human-readable rendering of the visible
    /// state to `out`.
    pub fn stringify(&self, out: &mut String) {
        let t = self.lock();

        let _ = write!(
            out,
            "\n    type: {}, ttl: {}, hops: {}, time: {}",
            t.host_type.as_str(),
            t.ip_ttl,
            t.hops,
            to_time_string(t.last_seen)
        );

        if !t.macs.is_empty() && t.num_visible_macs > 0 {
            let _ = write!(out, "\nmacs size: {}", t.num_visible_macs);
            for m in t.macs.iter().filter(|m| m.visible) {
                let _ = write!(
                    out,
                    "\n    mac: {}, ttl: {}, primary: {}, time: {}",
                    to_mac_string(&m.mac),
                    m.ttl,
                    m.primary as u8,
                    to_time_string(m.last_seen)
                );
            }
        }

        if t.num_visible_services > 0 {
            let _ = write!(out, "\nservices size: {}", t.num_visible_services);
            for s in t.services.iter().filter(|s| s.visible) {
                let _ = write!(out, "\n    port: {}, proto: {}", s.port, s.proto);
                if s.appid != APP_ID_NONE {
                    let _ = write!(out, ", appid: {}", s.appid);
                    if s.inferred_appid {
                        out.push_str(", inferred");
                    }
                }
                for i in s.info.iter().filter(|i| i.visible) {
                    if !i.vendor.is_empty() {
                        let _ = write!(out, ", vendor: {}", i.vendor);
                    }
                    if !i.version.is_empty() {
                        let _ = write!(out, ", version: {}", i.version);
                    }
                }
                let mut vis_payloads = s.num_visible_payloads;
                if vis_payloads > 0 {
                    out.push_str(if vis_payloads > 1 { ", payloads: " } else { ", payload: " });
                    for pld in s.payloads.iter().filter(|p| p.1) {
                        vis_payloads -= 1;
                        let _ = write!(out, "{}{}", pld.0, if vis_payloads > 0 { ", " } else { "" });
                    }
                }
                if !s.user.is_empty() {
                    let _ = write!(out, ", user: {}", s.user);
                }
            }
        }

        if t.num_visible_clients > 0 {
            let _ = write!(out, "\nclients size: {}", t.num_visible_clients);
            for c in t.clients.iter().filter(|c| c.visible) {
                let _ = write!(out, "\n    id: {}, service: {}", c.id, c.service);
                if !c.version.is_empty() {
                    let _ = write!(out, ", version: {}", c.version);
                }
                let mut vis_payloads = c.num_visible_payloads;
                if vis_payloads > 0 {
                    out.push_str(if vis_payloads > 1 { ", payloads: " } else { ", payload: " });
                    for pld in c.payloads.iter().filter(|p| p.1) {
                        vis_payloads -= 1;
                        let _ = write!(out, "{}{}", pld.0, if vis_payloads > 0 { ", " } else { "" });
                    }
                }
            }
        }

        if t.network_protos.iter().any(|p| p.1) {
            out.push_str("\nnetwork proto: ");
            let mut rest = t.network_protos.iter().filter(|p| p.1).count();
            for p in t.network_protos.iter().rev().filter(|p| p.1) {
                rest -= 1;
                let _ = write!(out, "{}{}", p.0, if rest > 0 { ", " } else { "" });
            }
        }

        if t.xport_protos.iter().any(|p| p.1) {
            out.push_str("\ntransport proto: ");
            let mut rest = t.xport_protos.iter().filter(|p| p.1).count();
            for p in t.xport_protos.iter().rev().filter(|p| p.1) {
                rest -= 1;
                let _ = write!(out, "{}{}", p.0, if rest > 0 { ", " } else { "" });
            }
        }

        if !t.tcp_fpids.is_empty() {
            let mut fpids: Vec<_> = t.tcp_fpids.iter().copied().collect();
            fpids.sort_unstable();
            out.push_str("\ntcp fingerprint: ");
            let mut rest = fpids.len();
            for fpid in fpids {
                rest -= 1;
                let _ = write!(out, "{}{}", fpid, if rest > 0 { ", " } else { "" });
            }
        }

        if !t.ua_fps.is_empty() {
            out.push_str("\nua fingerprint: ");
            let mut rest = t.ua_fps.len();
            for fp in &t.ua_fps {
                rest -= 1;
                let _ = write!(out, "{} (type: {}", fp.fpid, fp.fp_type);
                if fp.jail_broken {
                    out.push_str(", jail-broken");
                }
                if !fp.device.is_empty() {
                    let _ = write!(out, ", device: {}", fp.device);
                }
                let _ = write!(out, "){}", if rest > 0 { ", " } else { "" });
            }
        }

        if !t.udp_fpids.is_empty() {
            let mut fpids: Vec<_> = t.udp_fpids.iter().copied().collect();
            fpids.sort_unstable();
            out.push_str("\nudp fingerprint: ");
            let mut rest = fpids.len();
            for fpid in fpids {
                rest -= 1;
                let _ = write!(out, "{}{}", fpid, if rest > 0 { ", " } else { "" });
            }
        }
    }

    #[cfg(test)]
    fn visible_counts(&self) -> (usize, usize, usize) {
        let t = self.lock();
        (t.num_visible_macs, t.num_visible_services, t.num_visible_clients)
    }

    #[cfg(test)]
    fn counts_consistent(&self) -> bool {
        let t = self.lock();
        t.num_visible_macs == t.macs.iter().filter(|m| m.visible).count()
            && t.num_visible_services == t.services.iter().filter(|s| s.visible).count()
            && t.num_visible_clients == t.clients.iter().filter(|c| c.visible).count()
            && t.services
                .iter()
                .all(|s| s.num_visible_payloads == s.payloads.iter().filter(|p| p.1).count())
            && t.clients
                .iter()
                .all(|c| c.num_visible_payloads == c.payloads.iter().filter(|p| p.1).count())
    }
}

// ---------------------------------------------------------------------------
// Shared payload helpers
// ---------------------------------------------------------------------------

/// Insert a payload using the invisible-swap policy; bounded by
/// `max_payloads`.
fn add_payload_no_lock(
    pld: AppId,
    payloads: &mut Vec<Payload>,
    num_visible: &mut usize,
    max_payloads: usize,
) -> bool {
    let mut swap_candidate = None;

    for (i, p) in payloads.iter_mut().enumerate() {
        if p.0 == pld {
            if p.1 {
                return false;
            }
            p.1 = true;
            *num_visible += 1;
            return true;
        }
        if swap_candidate.is_none() && !p.1 {
            swap_candidate = Some(i);
        }
    }

    if let Some(i) = swap_candidate {
        payloads[i] = (pld, true);
        *num_visible += 1;
        return true;
    }

    if payloads.len() >= max_payloads {
        return false;
    }

    payloads.push((pld, true));
    *num_visible += 1;
    true
}

/// Flip every payload's visibility, keeping the visible count in step.
fn set_payload_visibility(payloads: &mut [Payload], v: bool, num_visible: &mut usize) {
    for p in payloads {
        if p.1 != v {
            p.1 = v;
            if v {
                *num_visible += 1;
            } else {
                *num_visible -= 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

/// Render a packet-clock timestamp as UTC `YYYY-MM-DD HH:MM:SS`.
fn to_time_string(t: u32) -> String {
    let days = (t / 86_400) as i64;
    let secs = t % 86_400;

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe + era * 400 + i64::from(m <= 2);

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        y,
        m,
        d,
        secs / 3_600,
        (secs / 60) % 60,
        secs % 60
    )
}

/// Render a MAC address as colon-separated uppercase hex.
fn to_mac_string(mac: &[u8; MAC_SIZE]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::IP_PROTO_TCP;

    fn tracker() -> HostTracker {
        HostTracker::new(1, 0)
    }

    #[test]
    fn test_add_find_service() {
        let ht = tracker();

        assert_eq!(ht.get_appid(80, IP_PROTO_TCP, false, false), APP_ID_NONE);

        assert!(ht.add_service(80, IP_PROTO_TCP, 676, true));
        assert!(ht.add_service(443, IP_PROTO_TCP, 1122, false));
        assert_eq!(ht.get_appid(80, IP_PROTO_TCP, false, false), 676);
        assert_eq!(ht.get_appid(443, IP_PROTO_TCP, false, false), 1122);

        // existing entry, appid update
        assert!(ht.add_service(443, IP_PROTO_TCP, 847, false));
        assert_eq!(ht.get_appid(443, IP_PROTO_TCP, false, false), 847);

        // identical re-add changes nothing
        assert!(!ht.add_service(443, IP_PROTO_TCP, 847, false));

        assert_eq!(ht.get_appid(8080, IP_PROTO_TCP, false, false), APP_ID_NONE);
        assert!(ht.counts_consistent());
    }

    #[test]
    fn test_add_mac_rejects_zero_and_duplicates() {
        let ht = tracker();
        assert!(!ht.add_mac(&ZERO_MAC, 64, false));
        assert_eq!(ht.visible_counts().0, 0);

        let mac = [0xfe, 0xed, 0xde, 0xad, 0xbe, 0xef];
        assert!(ht.add_mac(&mac, 64, false));
        assert!(!ht.add_mac(&mac, 64, false));
        assert_eq!(ht.visible_counts().0, 1);
        assert!(ht.counts_consistent());
    }

    #[test]
    fn test_mac_ttl_and_primary() {
        let ht = tracker();
        ht.update_last_seen(100);
        let mac = [1, 2, 3, 4, 5, 6];
        ht.add_mac(&mac, 10, false);

        assert!(ht.update_mac_ttl(&mac, 20));
        assert!(!ht.update_mac_ttl(&mac, 20));
        assert_eq!(ht.get_hostmac(&mac).unwrap().ttl, 20);

        assert!(ht.make_primary(&mac));
        assert!(!ht.make_primary(&mac));
        assert!(ht.get_max_ttl_hostmac().unwrap().primary);
    }

    #[test]
    fn test_invisible_swap_reuses_first_slot() {
        let ht = tracker();
        let m1 = [1, 1, 1, 1, 1, 1];
        let m2 = [2, 2, 2, 2, 2, 2];
        let m3 = [3, 3, 3, 3, 3, 3];
        let m4 = [4, 4, 4, 4, 4, 4];
        ht.add_mac(&m1, 1, false);
        ht.add_mac(&m2, 2, false);
        ht.add_mac(&m3, 3, false);

        ht.set_visibility(false, 1);
        ht.set_visibility(true, 2);
        assert!(ht.add_mac(&m4, 4, false));

        let (hops, _, macs) = ht.copy_data();
        assert_eq!(hops, u8::MAX);
        assert_eq!(macs.len(), 3);
        assert_eq!(macs[0].mac, m4);
        assert_eq!(ht.visible_counts().0, 1);
        assert!(ht.counts_consistent());
    }

    #[test]
    fn test_rediscover_service_payloads() {
        let ht = tracker();
        ht.add_service(80, IP_PROTO_TCP, 676, true);
        ht.add_service(443, IP_PROTO_TCP, 1122, false);

        assert!(ht.add_payload(80, IP_PROTO_TCP, 261, 676, 5));
        assert!(ht.add_payload(80, IP_PROTO_TCP, 100, 676, 5));

        for srv in ht.get_services() {
            assert!(srv.visible);
            for pld in &srv.payloads {
                assert!(pld.1);
            }
        }

        ht.set_service_visibility(80, IP_PROTO_TCP, false);
        for srv in ht.get_services() {
            if srv.port == 80 {
                assert!(!srv.visible);
                for pld in &srv.payloads {
                    assert!(!pld.1);
                }
            }
        }

        // one payload rediscovers itself, the other takes the freed slot
        ht.add_service(80, IP_PROTO_TCP, 676, true);
        assert!(ht.add_payload(80, IP_PROTO_TCP, 261, 676, 5));
        assert!(ht.add_payload(80, IP_PROTO_TCP, 101, 676, 5));

        let services = ht.get_services();
        let s80 = services.iter().find(|s| s.port == 80).unwrap();
        assert!(s80.visible);
        assert_eq!(s80.payloads.len(), 2);
        assert!(s80.payloads.iter().all(|p| p.1));
        assert!(ht.counts_consistent());
    }

    #[test]
    fn test_max_payloads() {
        let ht = tracker();
        ht.add_service(80, IP_PROTO_TCP, 676, true);

        for pld in [111, 222, 333, 444, 555] {
            assert!(ht.add_payload(80, IP_PROTO_TCP, pld, 676, 5));
        }
        assert!(!ht.add_payload(80, IP_PROTO_TCP, 666, 676, 5));
        assert_eq!(ht.get_services()[0].payloads.len(), 5);

        ht.set_service_visibility(80, IP_PROTO_TCP, false);
        ht.add_service(80, IP_PROTO_TCP, 676, true);

        // at max capacity, the new payload reuses an invisible slot
        assert!(ht.add_payload(80, IP_PROTO_TCP, 999, 676, 5));
        let s = &ht.get_services()[0];
        assert_eq!(s.payloads.len(), 5);
        assert!(s.payloads.iter().any(|p| p.0 == 999 && p.1));
        assert_eq!(s.payloads.iter().filter(|p| p.1).count(), 1);
        assert_eq!(s.num_visible_payloads, 1);
    }

    #[test]
    fn test_client_payload_rediscovery() {
        let ht = tracker();
        let (mut hc, is_new) = ht.find_or_add_client(2, Some("one"), 676);
        assert!(is_new);

        assert!(ht.add_client_payload(&mut hc, 123, 5));
        assert!(ht.add_client_payload(&mut hc, 456, 5));
        assert_eq!(ht.get_clients()[0].payloads.len(), 2);

        ht.set_client_visibility(&hc, false);
        assert!(ht.get_clients()[0].payloads.iter().all(|p| !p.1));

        let (mut hc, is_new) = ht.find_or_add_client(2, Some("one"), 676);
        assert!(is_new);
        assert!(ht.get_clients()[0].payloads.iter().all(|p| !p.1));

        assert!(ht.add_client_payload(&mut hc, 123, 5));
        assert!(ht.add_client_payload(&mut hc, 456, 5));
        let clients = ht.get_clients();
        assert!(clients[0].payloads.iter().all(|p| p.1));
        assert_eq!(clients[0].payloads.len(), 2);
        assert_eq!(clients.len(), 1);
        assert!(ht.counts_consistent());
    }

    #[test]
    fn test_client_payload_max() {
        let ht = tracker();
        let (mut hc, _) = ht.find_or_add_client(2, Some("one"), 676);

        for pld in [111, 222, 333, 444, 555] {
            assert!(ht.add_client_payload(&mut hc, pld, 5));
        }
        assert!(!ht.add_client_payload(&mut hc, 666, 5));

        ht.set_client_visibility(&hc, false);
        let (mut hc, _) = ht.find_or_add_client(2, Some("one"), 676);
        assert_eq!(ht.get_clients()[0].num_visible_payloads, 0);

        assert!(ht.add_client_payload(&mut hc, 666, 5));
        assert!(ht.add_client_payload(&mut hc, 777, 5));
        let clients = ht.get_clients();
        for pld in &clients[0].payloads {
            assert_eq!(pld.1, pld.0 == 666 || pld.0 == 777);
        }
        assert_eq!(clients[0].payloads.len(), 5);
        assert_eq!(clients[0].num_visible_payloads, 2);
        assert_eq!(clients.len(), 1);
    }

    #[test]
    fn test_update_service_user() {
        let ht = tracker();
        assert!(ht.add_service(110, IP_PROTO_TCP, 788, false));

        // first discoveries of success and failure both update
        assert!(ht.update_service_user(110, IP_PROTO_TCP, Some("user1"), 1, 1, true));
        assert!(ht.update_service_user(110, IP_PROTO_TCP, Some("user1"), 1, 1, false));

        // repeats do not
        assert!(!ht.update_service_user(110, IP_PROTO_TCP, Some("user1"), 1, 1, true));
        assert!(!ht.update_service_user(110, IP_PROTO_TCP, Some("user1"), 1, 1, false));

        // a new user resets the mask
        assert!(ht.update_service_user(110, IP_PROTO_TCP, Some("user2"), 1, 1, false));
        assert!(ht.update_service_user(110, IP_PROTO_TCP, Some("user2"), 1, 1, true));
    }

    #[test]
    fn test_update_service_info() {
        let ht = tracker();
        ht.add_service(80, IP_PROTO_TCP, 676, false);
        let mut ha = HostApplication { port: 80, proto: IP_PROTO_TCP, ..Default::default() };

        assert!(ht.update_service_info(&mut ha, Some("nginx"), Some("1.24"), 4));
        assert_eq!(ha.appid, 676);
        // exact duplicate while visible
        let mut ha2 = HostApplication { port: 80, proto: IP_PROTO_TCP, ..Default::default() };
        assert!(!ht.update_service_info(&mut ha2, Some("nginx"), Some("1.24"), 4));

        // drop the service, re-add, info rediscovers its old record
        ht.set_service_visibility(80, IP_PROTO_TCP, false);
        ht.add_service(80, IP_PROTO_TCP, 676, false);
        let mut ha3 = HostApplication { port: 80, proto: IP_PROTO_TCP, ..Default::default() };
        assert!(ht.update_service_info(&mut ha3, Some("nginx"), Some("1.24"), 4));
        let services = ht.get_services();
        assert_eq!(services[0].info.len(), 1);
        assert!(services[0].info[0].visible);
    }

    #[test]
    fn test_update_service_banner_once_per_visibility_span() {
        let ht = tracker();
        ht.add_service(21, IP_PROTO_TCP, 78, false);
        assert!(ht.update_service_banner(21, IP_PROTO_TCP));
        assert!(!ht.update_service_banner(21, IP_PROTO_TCP));

        ht.set_service_visibility(21, IP_PROTO_TCP, false);
        assert!(!ht.update_service_banner(21, IP_PROTO_TCP));
        ht.add_service(21, IP_PROTO_TCP, 78, false);
        assert!(ht.update_service_banner(21, IP_PROTO_TCP));
    }

    #[test]
    fn test_find_and_add_service_caps() {
        let ht = tracker();
        for port in 1..=3u16 {
            let res = ht.find_and_add_service(port, IP_PROTO_TCP, 10, 100 + port as AppId, 3);
            assert!(res.is_some());
        }
        // capacity reached, no invisible slot
        assert!(ht.find_and_add_service(4, IP_PROTO_TCP, 10, 104, 3).is_none());

        // free a slot; the next add reuses it without growing the vector
        ht.set_service_visibility(2, IP_PROTO_TCP, false);
        let (ha, is_new) = ht.find_and_add_service(4, IP_PROTO_TCP, 11, 104, 3).unwrap();
        assert!(is_new);
        assert_eq!(ha.port, 4);
        assert_eq!(ha.hits, 1);
        assert_eq!(ht.get_services().len(), 3);
        assert!(ht.counts_consistent());
    }

    #[test]
    fn test_find_and_add_service_hits() {
        let ht = tracker();
        let (ha, is_new) = ht.find_and_add_service(80, IP_PROTO_TCP, 10, 676, 0).unwrap();
        assert!(is_new);
        assert_eq!(ha.hits, 1);

        let (ha, is_new) = ht.find_and_add_service(80, IP_PROTO_TCP, 11, 676, 0).unwrap();
        assert!(!is_new);
        assert_eq!(ha.hits, 2);

        // appid overwrite on a visible service zeroes the hit count
        let (ha, is_new) = ht.find_and_add_service(80, IP_PROTO_TCP, 12, 999, 0).unwrap();
        assert!(is_new);
        assert_eq!(ha.hits, 0);
        assert_eq!(ha.appid, 999);
    }

    #[test]
    fn test_set_visibility_cascade_and_idempotence() {
        let ht = tracker();
        ht.add_mac(&[1, 1, 1, 1, 1, 1], 64, false);
        ht.add_service(80, IP_PROTO_TCP, 676, true);
        ht.add_service(443, IP_PROTO_TCP, 1122, false);
        ht.find_or_add_client(1, Some("one"), 100);
        ht.find_or_add_client(2, Some("two"), 200);
        ht.add_tcp_fingerprint(42);

        assert_eq!(ht.get_service_count(), 2);
        assert_eq!(ht.get_client_count(), 2);

        assert!(!ht.set_visibility(false, 1));
        assert_eq!(ht.visible_counts(), (0, 0, 0));
        assert!(ht.counts_consistent());

        // second call with the same value reports no change
        assert!(ht.set_visibility(false, 1));

        // rediscover the host: nothing becomes visible by itself
        ht.set_visibility(true, 2);
        assert_eq!(ht.get_service_count(), 0);
        assert_eq!(ht.get_client_count(), 0);
        assert!(ht.is_visible(2));
        assert!(!ht.is_visible(3));

        // rediscover one service and one client
        assert!(ht.add_service(443, IP_PROTO_TCP, 1122, false));
        assert_eq!(ht.get_service_count(), 1);
        let (_, is_new) = ht.find_or_add_client(2, Some("one"), 200);
        assert!(is_new);
        assert_eq!(ht.get_client_count(), 1);
        assert!(ht.counts_consistent());
    }

    #[test]
    fn test_stringify() {
        let ht = HostTracker::new(1, 1_562_198_400);

        let mac1 = [254, 237, 222, 173, 190, 239];
        let mac2 = [202, 254, 192, 255, 238, 0];
        ht.update_last_seen(1_562_198_404);
        ht.add_mac(&mac1, 9, false);
        ht.update_last_seen(1_562_198_407);
        ht.add_mac(&mac2, 3, true);

        ht.add_service(80, IP_PROTO_TCP, 676, true);
        ht.update_last_seen(1_562_198_409);
        ht.add_service(443, IP_PROTO_TCP, 1122, false);

        let mut s = String::new();
        ht.stringify(&mut s);
        assert_eq!(
            s,
            "\n    type: Host, ttl: 0, hops: 255, time: 2019-07-04 00:00:09\
             \nmacs size: 2\
             \n    mac: FE:ED:DE:AD:BE:EF, ttl: 9, primary: 0, time: 2019-07-04 00:00:04\
             \n    mac: CA:FE:C0:FF:EE:00, ttl: 3, primary: 1, time: 2019-07-04 00:00:07\
             \nservices size: 2\
             \n    port: 80, proto: 6, appid: 676, inferred\
             \n    port: 443, proto: 6, appid: 1122"
        );
    }

    #[test]
    fn test_stringify_lists_each_visible_item_once() {
        let ht = HostTracker::new(1, 1_562_198_400);
        ht.add_service(80, IP_PROTO_TCP, 676, false);
        ht.add_service(22, IP_PROTO_TCP, 707, false);
        ht.set_service_visibility(22, IP_PROTO_TCP, false);
        ht.find_or_add_client(2, Some("one"), 200);

        let mut s = String::new();
        ht.stringify(&mut s);
        assert_eq!(s.matches("port: 80").count(), 1);
        assert_eq!(s.matches("port: 22").count(), 0);
        assert_eq!(s.matches("id: 2, service: 200, version: one").count(), 1);
    }

    #[test]
    fn test_ua_fingerprint_device_cap() {
        let ht = tracker();
        assert!(ht.add_ua_fingerprint(7, 1, false, Some("phone"), 2));
        // identical record is rejected
        assert!(!ht.add_ua_fingerprint(7, 1, false, Some("phone"), 2));
        assert!(ht.add_ua_fingerprint(7, 1, true, Some("tablet"), 2));
        // per-(fpid, type) device cap reached
        assert!(!ht.add_ua_fingerprint(7, 1, false, Some("laptop"), 2));
        // different fingerprint id is unaffected
        assert!(ht.add_ua_fingerprint(8, 1, false, Some("laptop"), 2));
    }

    #[test]
    fn test_fingerprint_sets() {
        let ht = tracker();
        assert!(ht.add_tcp_fingerprint(1));
        assert!(!ht.add_tcp_fingerprint(1));
        assert!(ht.add_udp_fingerprint(1));
        assert!(!ht.add_udp_fingerprint(1));
    }

    #[test]
    fn test_remove_inferred_services() {
        let ht = tracker();
        ht.add_service(80, IP_PROTO_TCP, 676, true);
        ht.add_service(443, IP_PROTO_TCP, 1122, false);
        ht.remove_inferred_services();
        let services = ht.get_services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].port, 443);
        assert_eq!(ht.get_service_count(), 1);
    }

    #[test]
    fn test_time_string() {
        assert_eq!(to_time_string(1_562_198_400), "2019-07-04 00:00:00");
        assert_eq!(to_time_string(0), "1970-01-01 00:00:00");
    }
}
