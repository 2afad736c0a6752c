//! # AppID Session
//!
//! Per-flow identity record and discovery state. One session exists per
//! flow, created on the first packet carrying data and destroyed with the
//! flow. It aggregates the verdicts of local detectors, protocol
//! inspectors and the third-party classifier; the picked ids are computed
//! from these sources by the resolution rules in [`crate::resolution`].

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::app_info::{AppId, AppInfoTable, APP_ID_HTTP, APP_ID_NONE, APP_ID_UNKNOWN};
use crate::app_info::{is_service_over_ssl, APPINFO_FLAG_DEFER, APPINFO_FLAG_DEFER_PAYLOAD};
use crate::change_bits::{AppidEvent, ChangeBit, ChangeBits, EventPublisher};
use crate::flow::{FlowKey, FlowStash, STASH_APPID_DATA};
use crate::http_session::{AppIdDnsSession, AppIdHttpSession, HttpField};
use crate::service_state::{ServiceKey, ServiceStateStore, INCONCLUSIVE_SERVICE_WEIGHT};
use crate::third_party::{ThirdPartySession, TpState};

// ---------------------------------------------------------------------------
// Session flags
// ---------------------------------------------------------------------------

pub const APPID_SESSION_SERVICE_DETECTED: u64 = 1 << 0;
pub const APPID_SESSION_CLIENT_DETECTED: u64 = 1 << 1;
pub const APPID_SESSION_INITIATOR_CHECKED: u64 = 1 << 2;
pub const APPID_SESSION_RESPONDER_CHECKED: u64 = 1 << 3;
pub const APPID_SESSION_INITIATOR_MONITORED: u64 = 1 << 4;
pub const APPID_SESSION_RESPONDER_MONITORED: u64 = 1 << 5;
pub const APPID_SESSION_ENCRYPTED: u64 = 1 << 6;
pub const APPID_SESSION_DECRYPTED: u64 = 1 << 7;
pub const APPID_SESSION_SSL_SESSION: u64 = 1 << 8;
pub const APPID_SESSION_HTTP_SESSION: u64 = 1 << 9;
pub const APPID_SESSION_HTTP_TUNNEL: u64 = 1 << 10;
pub const APPID_SESSION_APP_REINSPECT: u64 = 1 << 11;
pub const APPID_SESSION_APP_REINSPECT_SSL: u64 = 1 << 12;
pub const APPID_SESSION_CONTINUE: u64 = 1 << 13;
pub const APPID_SESSION_NO_TPI: u64 = 1 << 14;
pub const APPID_SESSION_STICKY_SERVICE: u64 = 1 << 15;
pub const APPID_SESSION_FUTURE_FLOW: u64 = 1 << 16;
pub const APPID_SESSION_MID: u64 = 1 << 17;
pub const APPID_SESSION_OOO: u64 = 1 << 18;
pub const APPID_SESSION_SPDY_SESSION: u64 = 1 << 19;
pub const APPID_SESSION_DISCOVER_APP: u64 = 1 << 20;
pub const APPID_SESSION_DISCOVER_USER: u64 = 1 << 21;
pub const APPID_SESSION_CHP_INSPECTING: u64 = 1 << 22;
pub const APPID_SESSION_UDP_REVERSED: u64 = 1 << 23;
pub const APPID_SESSION_CLIENT_GETS_SERVER_PACKETS: u64 = 1 << 24;

// ---------------------------------------------------------------------------
// Scan flags
// ---------------------------------------------------------------------------

pub const SCAN_HTTP_HOST_URL_FLAG: u32 = 1 << 0;
pub const SCAN_SSL_HOST_FLAG: u32 = 1 << 1;
pub const SCAN_SSL_CERTIFICATE_FLAG: u32 = 1 << 2;
pub const SCAN_CERTVIZ_ENABLED_FLAG: u32 = 1 << 3;

// ---------------------------------------------------------------------------
// Discovery state
// ---------------------------------------------------------------------------

/// Progress of service or client discovery on a flow. Forward transitions
/// only; a detection restart resets the field wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DiscoveryState {
    #[default]
    None = 0,
    /// A single chosen detector is invoked directly.
    Direct = 1,
    /// Candidates are drawn from the pattern matcher and validated.
    Stateful = 2,
    Finished = 3,
}

/// Advance a discovery state. Going backwards is a programming error.
pub fn advance_state(state: &mut DiscoveryState, new: DiscoveryState) {
    debug_assert!(*state < new, "discovery state must advance: {:?} -> {:?}", *state, new);
    *state = new;
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Identity slot for client and payload: the id, an optional version, and
/// the id this one overwrote after a detection restart.
#[derive(Debug, Clone, Default)]
pub struct AppDescriptor {
    id: AppId,
    version: Option<String>,
    overwritten_id: AppId,
}

impl AppDescriptor {
    pub fn get_id(&self) -> AppId {
        self.id
    }

    pub fn set_id(&mut self, id: AppId) {
        self.id = id;
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn set_version(&mut self, version: &str) {
        self.version = Some(version.to_string());
    }

    pub fn set_overwritten_id(&mut self, id: AppId) {
        self.overwritten_id = id;
    }

    pub fn overwritten_id(&self) -> AppId {
        self.overwritten_id
    }

    pub fn reset(&mut self) {
        self.id = APP_ID_NONE;
        self.version = None;
    }
}

/// Identity slot for the service side, including the port-derived id and
/// the resolved service endpoint.
#[derive(Debug, Clone, Default)]
pub struct ServiceDescriptor {
    id: AppId,
    version: Option<String>,
    overwritten_id: AppId,
    port_service_id: AppId,
    deferred: bool,
    service_ip: Option<IpAddr>,
    service_port: u16,
}

impl ServiceDescriptor {
    pub fn get_id(&self) -> AppId {
        self.id
    }

    pub fn set_id(&mut self, id: AppId) {
        self.id = id;
    }

    /// Set the id and version together, as a service detector does.
    pub fn update(&mut self, id: AppId, version: Option<&str>) {
        self.id = id;
        if let Some(version) = version {
            self.version = Some(version.to_string());
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn port_service_id(&self) -> AppId {
        self.port_service_id
    }

    pub fn set_port_service_id(&mut self, id: AppId) {
        self.port_service_id = id;
    }

    pub fn deferred(&self) -> bool {
        self.deferred
    }

    pub fn set_deferred(&mut self, deferred: bool) {
        self.deferred = deferred;
    }

    pub fn set_overwritten_id(&mut self, id: AppId) {
        self.overwritten_id = id;
    }

    pub fn overwritten_id(&self) -> AppId {
        self.overwritten_id
    }

    pub fn service_ip(&self) -> Option<IpAddr> {
        self.service_ip
    }

    pub fn service_port(&self) -> u16 {
        self.service_port
    }

    pub fn set_service_endpoint(&mut self, ip: IpAddr, port: u16) {
        self.service_ip = Some(ip);
        self.service_port = port;
    }

    /// Clear the detected identity. The port-derived id and the resolved
    /// endpoint survive; a restart recomputes identity, not topology.
    pub fn reset(&mut self) {
        self.id = APP_ID_NONE;
        self.version = None;
        self.deferred = false;
    }
}

// ---------------------------------------------------------------------------
// Published identity snapshot
// ---------------------------------------------------------------------------

/// The five picked application ids as last published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplicationIds {
    pub service: AppId,
    pub client: AppId,
    pub payload: AppId,
    pub misc: AppId,
    pub referred: AppId,
}

/// Shared identity view of a session.
///
/// Stored in the flow stash on first publication; subscribers keep the
/// `Arc` and read the current view on each event. Interior mutability keeps
/// the stored object stable while the session updates it.
#[derive(Debug, Default)]
pub struct SessionApi {
    ids: Mutex<ApplicationIds>,
    tls_host: Mutex<Option<String>>,
}

impl SessionApi {
    pub fn application_ids(&self) -> ApplicationIds {
        *self.ids.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store newly picked ids, flagging each change.
    pub fn set_application_ids(&self, new: ApplicationIds, change_bits: &mut ChangeBits) {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        if ids.service != new.service {
            change_bits.set(ChangeBit::ServiceInfo);
        }
        if ids.client != new.client {
            change_bits.set(ChangeBit::ClientInfo);
        }
        if ids.payload != new.payload {
            change_bits.set(ChangeBit::PayloadInfo);
        }
        if ids.misc != new.misc {
            change_bits.set(ChangeBit::MiscInfo);
        }
        if ids.referred != new.referred {
            change_bits.set(ChangeBit::ReferredInfo);
        }
        *ids = new;
    }

    pub fn tls_host(&self) -> Option<String> {
        self.tls_host.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_tls_host(&self, host: &str, change_bits: &mut ChangeBits) {
        *self.tls_host.lock().unwrap_or_else(|e| e.into_inner()) = Some(host.to_string());
        change_bits.set(ChangeBit::TlsHost);
    }
}

// ---------------------------------------------------------------------------
// TLS metadata session
// ---------------------------------------------------------------------------

/// TLS handshake metadata accumulated for SSL sessions.
#[derive(Debug, Clone, Default)]
pub struct TlsSession {
    pub tls_host: Option<String>,
    pub tls_cname: Option<String>,
    pub tls_org_unit: Option<String>,
    pub handshake_done: bool,
}

// ---------------------------------------------------------------------------
// Encrypted snapshot
// ---------------------------------------------------------------------------

/// Picked ids captured at the moment encryption became visible, consulted
/// by resolution when post-decryption discovery comes up empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncryptedSnapshot {
    pub service_id: AppId,
    pub client_id: AppId,
    pub payload_id: AppId,
    pub misc_id: AppId,
    pub referred_id: AppId,
}

// ---------------------------------------------------------------------------
// Inferred-services versioning
// ---------------------------------------------------------------------------

static INFERRED_SVCS_VER: Mutex<u16> = Mutex::new(0);

/// Current inferred-services table version.
pub fn inferred_svcs_version() -> u16 {
    *INFERRED_SVCS_VER.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bump the version after reloading inferred services. Sessions holding a
/// stale version refresh on their next packet.
pub fn bump_inferred_svcs_version() -> u16 {
    let mut ver = INFERRED_SVCS_VER.lock().unwrap_or_else(|e| e.into_inner());
    *ver = ver.wrapping_add(1);
    *ver
}

// ---------------------------------------------------------------------------
// AppIdSession
// ---------------------------------------------------------------------------

/// Per-flow AppID state.
#[derive(Debug)]
pub struct AppIdSession {
    pub protocol: u8,
    pub asid: u16,
    pub initiator_ip: IpAddr,
    pub initiator_port: u16,
    pub responder_ip: IpAddr,
    pub responder_port: u16,
    pub first_packet_time: u32,

    pub service: ServiceDescriptor,
    pub client: AppDescriptor,
    pub payload: AppDescriptor,
    pub misc_app_id: AppId,
    /// User name reported by a client detector, with the login outcome.
    pub client_username: Option<(String, bool)>,

    pub tp_app_id: AppId,
    pub tp_payload_app_id: AppId,
    pub tp_app_id_deferred: bool,
    pub tp_payload_app_id_deferred: bool,
    pub client_inferred_service_id: AppId,
    /// Upstream protocol id the flow is aligned with.
    pub stream_protocol_id: u16,

    pub service_disco_state: DiscoveryState,
    pub client_disco_state: DiscoveryState,
    flags: u64,
    pub scan_flags: u32,

    pub encrypted: EncryptedSnapshot,
    pub api: Arc<SessionApi>,
    published: bool,
    stored_in_stash: bool,

    /// One HTTP session per HTTP/2 stream; index 0 for HTTP/1.
    pub hsessions: Vec<AppIdHttpSession>,
    pub dsession: Option<AppIdDnsSession>,
    pub tsession: Option<TlsSession>,

    pub client_detector: Option<String>,
    pub service_detector: Option<String>,
    /// Surviving client candidates in selection order.
    pub client_candidates: Vec<String>,
    pub service_candidates: Vec<String>,

    pub tpsession: Option<ThirdPartySession>,
    /// Version of the third-party context this session was created under;
    /// `None` when no third-party classifier is configured.
    pub tp_ctxt_version: Option<u32>,

    pub init_pkts_without_reply: u32,
    pub init_bytes_without_reply: u64,
    pub in_expected_cache: bool,
    inferred_svcs_ver: u16,
}

impl AppIdSession {
    pub fn new(
        protocol: u8,
        asid: u16,
        initiator_ip: IpAddr,
        initiator_port: u16,
        responder_ip: IpAddr,
        responder_port: u16,
        first_packet_time: u32,
        tp_ctxt_version: Option<u32>,
    ) -> Self {
        Self {
            protocol,
            asid,
            initiator_ip,
            initiator_port,
            responder_ip,
            responder_port,
            first_packet_time,
            service: ServiceDescriptor::default(),
            client: AppDescriptor::default(),
            payload: AppDescriptor::default(),
            misc_app_id: APP_ID_NONE,
            client_username: None,
            tp_app_id: APP_ID_NONE,
            tp_payload_app_id: APP_ID_NONE,
            tp_app_id_deferred: false,
            tp_payload_app_id_deferred: false,
            client_inferred_service_id: APP_ID_NONE,
            stream_protocol_id: 0,
            service_disco_state: DiscoveryState::None,
            client_disco_state: DiscoveryState::None,
            flags: APPID_SESSION_DISCOVER_APP | APPID_SESSION_DISCOVER_USER,
            scan_flags: 0,
            encrypted: EncryptedSnapshot::default(),
            api: Arc::new(SessionApi::default()),
            published: false,
            stored_in_stash: false,
            hsessions: Vec::new(),
            dsession: None,
            tsession: None,
            client_detector: None,
            service_detector: None,
            client_candidates: Vec::new(),
            service_candidates: Vec::new(),
            tpsession: None,
            tp_ctxt_version,
            init_pkts_without_reply: 0,
            init_bytes_without_reply: 0,
            in_expected_cache: false,
            inferred_svcs_ver: inferred_svcs_version(),
        }
    }

    // -----------------------------------------------------------------------
    // Flags
    // -----------------------------------------------------------------------

    pub fn set_session_flags(&mut self, flags: u64) {
        self.flags |= flags;
    }

    pub fn clear_session_flags(&mut self, flags: u64) {
        self.flags &= !flags;
    }

    /// Return the subset of `flags` currently set.
    pub fn get_session_flags(&self, flags: u64) -> u64 {
        self.flags & flags
    }

    pub fn any_session_flags(&self, flags: u64) -> bool {
        self.flags & flags != 0
    }

    pub fn is_service_detected(&self) -> bool {
        self.any_session_flags(APPID_SESSION_SERVICE_DETECTED)
    }

    pub fn set_service_detected(&mut self) {
        self.flags |= APPID_SESSION_SERVICE_DETECTED;
    }

    pub fn is_client_detected(&self) -> bool {
        self.any_session_flags(APPID_SESSION_CLIENT_DETECTED)
    }

    pub fn set_client_detected(&mut self) {
        self.flags |= APPID_SESSION_CLIENT_DETECTED;
    }

    pub fn is_decrypted(&self) -> bool {
        self.any_session_flags(APPID_SESSION_DECRYPTED)
    }

    // -----------------------------------------------------------------------
    // Third-party state predicates
    // -----------------------------------------------------------------------

    /// Third-party processing reached a final state (or is not configured).
    pub fn is_tp_appid_done(&self) -> bool {
        if self.any_session_flags(APPID_SESSION_FUTURE_FLOW) || self.tp_ctxt_version.is_none() {
            return true;
        }
        match &self.tpsession {
            None => false,
            Some(tp) => {
                matches!(tp.state(), TpState::Classified | TpState::Terminated | TpState::Ha)
            }
        }
    }

    /// A third-party verdict can be consulted right now.
    pub fn is_tp_appid_available(&self) -> bool {
        if self.tp_ctxt_version.is_none() {
            return true;
        }
        match &self.tpsession {
            None => false,
            Some(tp) => matches!(
                tp.state(),
                TpState::Classified | TpState::Terminated | TpState::Monitoring
            ),
        }
    }

    pub fn is_tp_processing_done(&self) -> bool {
        if !self.any_session_flags(APPID_SESSION_NO_TPI)
            && (!self.is_tp_appid_done()
                || self.any_session_flags(
                    APPID_SESSION_APP_REINSPECT | APPID_SESSION_APP_REINSPECT_SSL,
                ))
        {
            return false;
        }
        true
    }

    /// Record a third-party service verdict, picking up the deferred flag
    /// from the app-info table.
    pub fn set_tp_app_id(&mut self, app_id: AppId, app_info: &AppInfoTable) {
        if self.tp_app_id != app_id {
            self.tp_app_id = app_id;
            self.tp_app_id_deferred =
                app_info.get(app_id).is_some_and(|e| e.flags & APPINFO_FLAG_DEFER != 0);
        }
    }

    /// Record a third-party payload verdict with its deferred flag.
    pub fn set_tp_payload_app_id(&mut self, app_id: AppId, app_info: &AppInfoTable) {
        if self.tp_payload_app_id != app_id {
            self.tp_payload_app_id = app_id;
            self.tp_payload_app_id_deferred =
                app_info.get(app_id).is_some_and(|e| e.flags & APPINFO_FLAG_DEFER_PAYLOAD != 0);
        }
    }

    // -----------------------------------------------------------------------
    // Identity setters
    // -----------------------------------------------------------------------

    /// Set the locally detected client id, honoring app priorities. HTTP
    /// is never a client id.
    pub fn set_client_appid_data(
        &mut self,
        id: AppId,
        version: Option<&str>,
        app_info: &AppInfoTable,
        change_bits: &mut ChangeBits,
    ) {
        if id <= APP_ID_NONE || id == APP_ID_HTTP {
            return;
        }

        let cur_id = self.client.get_id();
        if id != cur_id {
            if cur_id != APP_ID_NONE && app_info.priority(cur_id) > app_info.priority(id) {
                return;
            }
            self.client.set_id(id);
        }
        if let Some(version) = version {
            self.client.set_version(version);
            change_bits.set(ChangeBit::ClientInfo);
        }
    }

    /// Set the locally detected payload id, honoring app priorities.
    pub fn set_payload_appid_data(&mut self, id: AppId, version: Option<&str>, app_info: &AppInfoTable) {
        if id <= APP_ID_NONE {
            return;
        }
        if app_info.priority(self.payload.get_id()) > app_info.priority(id) {
            return;
        }
        self.payload.set_id(id);
        if let Some(version) = version {
            self.payload.set_version(version);
        }
    }

    /// Set the locally detected service id. A bare HTTP verdict from a
    /// client detector is recorded as the client-inferred service instead.
    pub fn set_service_appid_data(
        &mut self,
        id: AppId,
        version: Option<&str>,
        change_bits: &mut ChangeBits,
    ) {
        if id <= APP_ID_NONE {
            return;
        }

        if id == APP_ID_HTTP {
            if self.client_inferred_service_id == APP_ID_NONE {
                self.client_inferred_service_id = id;
            }
            return;
        }

        self.service.update(id, version);
        if version.is_some() {
            change_bits.set(ChangeBit::ServiceInfo);
        }
    }

    /// Record a user reported by a client detector.
    pub fn set_client_user(&mut self, user: &str, success: bool, change_bits: &mut ChangeBits) {
        self.client_username = Some((user.to_string(), success));
        change_bits.set(ChangeBit::UserInfo);
    }

    /// Conclude service discovery at the given endpoint without a detector
    /// verdict (port-based or inspector-based identification).
    pub fn stop_service_inspection(&mut self, service_ip: IpAddr, service_port: u16) {
        self.service.set_service_endpoint(service_ip, service_port);
        self.service_disco_state = DiscoveryState::Finished;

        if self.payload.get_id() == APP_ID_NONE
            && (self.is_tp_appid_available() || self.any_session_flags(APPID_SESSION_NO_TPI))
        {
            self.payload.set_id(APP_ID_UNKNOWN);
        }

        self.set_session_flags(APPID_SESSION_SERVICE_DETECTED);
        self.clear_session_flags(APPID_SESSION_CONTINUE);
    }

    /// Align the upstream protocol id with a newly picked service.
    ///
    /// SSL-variant services keep the protocol id of their cleartext
    /// carrier, so they are skipped.
    pub fn sync_with_stream_protocol_id(
        &mut self,
        new_app_id: AppId,
        app_info: &AppInfoTable,
        change_bits: &mut ChangeBits,
    ) {
        if new_app_id <= APP_ID_NONE || is_service_over_ssl(new_app_id) {
            return;
        }
        let Some(entry) = app_info.get(new_app_id) else {
            return;
        };
        if let Some(protocol_id) = entry.protocol_id {
            if protocol_id != self.stream_protocol_id {
                self.stream_protocol_id = protocol_id;
                change_bits.set(ChangeBit::ProtocolId);
            }
        }
    }

    // -----------------------------------------------------------------------
    // HTTP / DNS / TLS sub-sessions
    // -----------------------------------------------------------------------

    /// Append an HTTP session for a stream; returns its index.
    pub fn create_http_session(&mut self, stream_id: u32) -> usize {
        self.hsessions.push(AppIdHttpSession::new(stream_id));
        self.hsessions.len() - 1
    }

    pub fn get_http_session(&self, index: usize) -> Option<&AppIdHttpSession> {
        self.hsessions.get(index)
    }

    pub fn get_http_session_mut(&mut self, index: usize) -> Option<&mut AppIdHttpSession> {
        self.hsessions.get_mut(index)
    }

    /// Find the HTTP session index for an HTTP/2 stream id.
    pub fn get_matching_http_session(&self, stream_id: u32) -> Option<usize> {
        self.hsessions.iter().position(|h| h.http2_stream_id == stream_id)
    }

    pub fn create_dns_session(&mut self) -> &mut AppIdDnsSession {
        self.dsession.insert(AppIdDnsSession::default())
    }

    pub fn create_tls_session(&mut self) -> &mut TlsSession {
        self.tsession.get_or_insert_with(TlsSession::default)
    }

    pub fn clear_http_flags(&mut self) {
        if !self.any_session_flags(APPID_SESSION_SPDY_SESSION) {
            self.clear_session_flags(APPID_SESSION_CHP_INSPECTING);
            if let Some(tp) = &mut self.tpsession {
                tp.clear_attr(crate::third_party::TP_ATTR_CONTINUE_MONITORING);
            }
        }
    }

    pub fn clear_http_data(&mut self) {
        if let Some(hsession) = self.hsessions.first_mut() {
            hsession.clear_all_fields();
        }
    }

    // -----------------------------------------------------------------------
    // Restart support
    // -----------------------------------------------------------------------

    /// Clear derived identities and discovery state after a restart
    /// trigger, preserving the sticky facts.
    ///
    /// The service identity survives when STICKY_SERVICE is set; the
    /// `encrypted` snapshot always survives. The third-party session is
    /// reset in place when its context version still matches
    /// `curr_tp_version`, otherwise terminated.
    pub fn reinit_session_data(&mut self, change_bits: &mut ChangeBits, curr_tp_version: Option<u32>) {
        self.misc_app_id = APP_ID_NONE;

        // payload
        if is_service_over_ssl(self.tp_app_id) {
            self.payload.reset();
            self.tp_payload_app_id = APP_ID_NONE;
            self.clear_session_flags(APPID_SESSION_CONTINUE);
            if let Some(hsession) = self.hsessions.first_mut() {
                hsession.set_field(HttpField::Url, None, change_bits);
            }
        }

        // service
        if !self.any_session_flags(APPID_SESSION_STICKY_SERVICE) {
            self.service.reset();
            self.tp_app_id = APP_ID_NONE;
            self.service_disco_state = DiscoveryState::None;
            self.service_detector = None;
            self.service_candidates.clear();
        }

        // client
        self.client.reset();
        self.client_inferred_service_id = APP_ID_NONE;
        self.client_disco_state = DiscoveryState::None;

        // third party
        self.reset_or_terminate_tpsession(curr_tp_version);

        self.scan_flags &= !SCAN_HTTP_HOST_URL_FLAG;
        self.clear_session_flags(
            APPID_SESSION_SERVICE_DETECTED
                | APPID_SESSION_CLIENT_DETECTED
                | APPID_SESSION_SSL_SESSION
                | APPID_SESSION_HTTP_SESSION
                | APPID_SESSION_APP_REINSPECT,
        );
    }

    /// Full reset of the session's derived data, flagged with the Reset
    /// change bit.
    pub fn reset_session_data(&mut self, change_bits: &mut ChangeBits, curr_tp_version: Option<u32>) {
        self.service.reset();
        self.client.reset();
        self.payload.reset();
        self.hsessions.clear();
        self.dsession = None;
        self.tsession = None;

        self.tp_payload_app_id = APP_ID_UNKNOWN;
        self.tp_app_id = APP_ID_UNKNOWN;

        self.reset_or_terminate_tpsession(curr_tp_version);

        change_bits.reset();
        change_bits.set(ChangeBit::Reset);
    }

    fn reset_or_terminate_tpsession(&mut self, curr_tp_version: Option<u32>) {
        if let Some(tp) = &mut self.tpsession {
            match curr_tp_version {
                Some(v) if tp.ctxt_version() == v => tp.reset(),
                _ => tp.set_state(TpState::Terminated),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Budget and refresh checks
    // -----------------------------------------------------------------------

    /// The initiator keeps sending without any reply and service discovery
    /// still has not concluded.
    pub fn is_svc_taking_too_much_time(
        &self,
        max_packets: u32,
        max_bytes: u64,
        ignore_packets: u32,
    ) -> bool {
        self.init_pkts_without_reply > ignore_packets
            || (self.init_pkts_without_reply > max_packets
                && self.init_bytes_without_reply > max_bytes)
    }

    /// Refresh against the inferred-services version; a stale session
    /// drops its inferred data.
    pub fn check_inferred_svcs_version(&mut self) -> bool {
        let current = inferred_svcs_version();
        if self.inferred_svcs_ver == current {
            return false;
        }
        self.inferred_svcs_ver = current;
        self.client_inferred_service_id = APP_ID_NONE;
        true
    }

    // -----------------------------------------------------------------------
    // Publication
    // -----------------------------------------------------------------------

    /// Store the picked ids on the shared snapshot, flagging changes.
    pub fn set_application_ids(&self, ids: ApplicationIds, change_bits: &mut ChangeBits) {
        self.api.set_application_ids(ids, change_bits);
    }

    /// End-of-packet publication.
    ///
    /// On the first publication the identity snapshot is stored in the
    /// flow stash and the Created bit is set. With no bits set, nothing is
    /// published.
    #[allow(clippy::too_many_arguments)]
    pub fn publish_appid_event(
        &mut self,
        change_bits: &mut ChangeBits,
        stash: &mut FlowStash,
        publisher: &EventPublisher,
        flow_key: &FlowKey,
        packet_time: u32,
        is_http2: bool,
        http2_stream_index: u32,
    ) {
        if !self.stored_in_stash && change_bits.any() {
            stash.store(STASH_APPID_DATA, self.api.clone());
            self.stored_in_stash = true;
        }

        if !self.published {
            change_bits.set(ChangeBit::Created);
            self.published = true;
        }

        if change_bits.none() {
            return;
        }

        publisher.publish(AppidEvent {
            bits: *change_bits,
            api: self.api.clone(),
            flow_key: flow_key.clone(),
            packet_time,
            is_http2,
            http2_stream_index,
        });
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Flow-end bookkeeping: a session that never concluded service
    /// discovery reports the failure to the per-destination store so later
    /// flows stop trying.
    pub fn on_flow_end(&mut self, store: &ServiceStateStore, curr_tp_version: Option<u32>) {
        if !self.in_expected_cache
            && !self.any_session_flags(
                APPID_SESSION_SERVICE_DETECTED
                    | APPID_SESSION_UDP_REVERSED
                    | APPID_SESSION_MID
                    | APPID_SESSION_OOO,
            )
        {
            let key = ServiceKey {
                ip: self.service.service_ip().unwrap_or(self.responder_ip),
                proto: self.protocol,
                port: if self.service.service_port() != 0 {
                    self.service.service_port()
                } else {
                    self.responder_port
                },
                asid: self.asid,
                decrypted: self.is_decrypted(),
            };
            store.set_service_id_failed(key, self.initiator_ip, INCONCLUSIVE_SERVICE_WEIGHT);
        }

        // the third-party session is reusable only under a matching context
        self.reset_or_terminate_tpsession(curr_tp_version);
        self.client_candidates.clear();
        self.service_candidates.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
