//! # AppSight Engine
//!
//! Application identification and host observation engine. Reassembled
//! stream segments go in; structured application-identity facts and change
//! events come out.
//!
//! ## Architecture
//!
//! The engine is structured into several subsystems:
//!
//! - **session**: per-flow AppID state machine with restart handling
//! - **discovery**: pattern-driven client detector selection and execution
//! - **protocols**: HTTP/1, HTTP/2 (HPACK), TLS metadata and SMB2 inspectors
//! - **host_tracker / host_cache**: per-host observational records with a
//!   visibility-epoch retirement discipline
//! - **third_party**: out-of-band classifier integration with context
//!   versioning
//! - **change_bits**: per-packet delta accumulation and event publication
//!
//! ## Driving the engine
//!
//! ```
//! use appsight_engine::flow::{FlowKey, IP_PROTO_TCP};
//! use appsight_engine::protocols::Direction;
//! use appsight_engine::{EngineConfig, InspectorEngine};
//!
//! let engine = InspectorEngine::new(EngineConfig::default()).unwrap();
//! let key = FlowKey::new(
//!     "10.1.1.1".parse().unwrap(),
//!     "10.1.1.2".parse().unwrap(),
//!     49152,
//!     22,
//!     IP_PROTO_TCP,
//!     0,
//! );
//! engine.process_segment(&key, Direction::Initiator, b"SSH-2.0-OpenSSH_9.6\r\n", 1000);
//! for event in engine.drain_events() {
//!     println!("{}: {}", event.flow_key, event.bits);
//! }
//! engine.end_flow(&key);
//! ```
//!
//! The upstream flow manager must serialize the segments of one flow; the
//! engine itself may be driven from multiple worker threads for distinct
//! flows.

pub mod app_info;
pub mod change_bits;
pub mod discovery;
pub mod flow;
pub mod host_cache;
pub mod host_tracker;
pub mod http_session;
pub mod matcher;
pub mod protocols;
pub mod resolution;
pub mod restart;
pub mod service_state;
pub mod session;
pub mod third_party;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::app_info::{port_app_id, AppInfoTable, APP_ID_HTTP2, APP_ID_NONE};
use crate::change_bits::{AppidEvent, ChangeBits, EventPublisher};
use crate::discovery::ClientDiscovery;
use crate::flow::{lock_flow, Flow, FlowKey, FlowTable};
use crate::host_cache::{HostCache, HostKey};
use crate::matcher::SslPatternMatchers;
use crate::protocols::tls::fingerprint_id;
use crate::protocols::{http, http2, smb2, tls, Direction, InspectCtx};
use crate::service_state::{ServiceIdState, ServiceKey, ServiceStateStore};
use crate::session::{AppIdSession, DiscoveryState};
use crate::session::{APPID_SESSION_MID, APPID_SESSION_SSL_SESSION};
use crate::third_party::{ThirdPartyContext, ThirdPartySession, TpState, TpVerdict};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine tunables. The capacity caps bound every host tracker collection;
/// the service-fail limits bound how long discovery keeps trying on a
/// silent responder.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_hosts: usize,
    pub max_services: u16,
    pub max_payloads: usize,
    pub max_info: u16,
    pub max_devices: u8,
    pub max_packets_before_service_fail: u32,
    pub max_bytes_before_service_fail: u64,
    pub packets_service_fail_ignore: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_hosts: 1024,
            max_services: 32,
            max_payloads: 8,
            max_info: 8,
            max_devices: 4,
            max_packets_before_service_fail: 10,
            max_bytes_before_service_fail: 4096,
            packets_service_fail_ignore: 40,
        }
    }
}

/// Errors raised while building an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("pattern matcher: {0}")]
    Matcher(#[from] crate::matcher::MatcherError),

    #[error("app-info table: {0}")]
    AppInfo(#[from] crate::app_info::AppInfoError),
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Cumulative engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub segments_processed: AtomicU64,
    pub bytes_processed: AtomicU64,
    pub flows_created: AtomicU64,
    pub service_detections: AtomicU64,
    pub client_detections: AtomicU64,
    pub restarts: AtomicU64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The engine: flow table, host cache, detector registry and event
/// publisher, driven one stream segment at a time.
pub struct InspectorEngine {
    config: EngineConfig,
    app_info: AppInfoTable,
    flows: FlowTable,
    host_cache: HostCache,
    client_disco: ClientDiscovery,
    ssl_matchers: SslPatternMatchers,
    service_state: ServiceStateStore,
    tp_ctxt: Option<Arc<ThirdPartyContext>>,
    publisher: EventPublisher,
    events: Receiver<AppidEvent>,
    stats: EngineStats,
}

impl InspectorEngine {
    /// Build an engine with the built-in detector set and app table.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let (publisher, events) = EventPublisher::channel();
        let engine = Self {
            host_cache: HostCache::new(config.max_hosts),
            config,
            app_info: AppInfoTable::new(),
            flows: FlowTable::new(),
            client_disco: ClientDiscovery::new()?,
            ssl_matchers: SslPatternMatchers::new(),
            service_state: ServiceStateStore::new(),
            tp_ctxt: None,
            publisher,
            events,
            stats: EngineStats::default(),
        };
        tracing::info!("appsight engine initialized");
        Ok(engine)
    }

    /// Attach a third-party classifier context.
    pub fn with_third_party(mut self, ctxt: Arc<ThirdPartyContext>) -> Self {
        self.tp_ctxt = Some(ctxt);
        self
    }

    /// Replace the SSL pattern tables (call `prep()` on them first).
    pub fn with_ssl_matchers(mut self, matchers: SslPatternMatchers) -> Self {
        self.ssl_matchers = matchers;
        self
    }

    pub fn app_info(&self) -> &AppInfoTable {
        &self.app_info
    }

    pub fn host_cache(&self) -> &HostCache {
        &self.host_cache
    }

    pub fn service_state(&self) -> &ServiceStateStore {
        &self.service_state
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    fn tp_version(&self) -> Option<u32> {
        self.tp_ctxt.as_ref().map(|c| c.version())
    }

    /// Drain all pending change events.
    pub fn drain_events(&self) -> Vec<AppidEvent> {
        self.events.try_iter().collect()
    }

    /// Mark a flow as carried through a decrypting proxy; the SSL restart
    /// check only fires on proxied flows.
    pub fn mark_flow_proxied(&self, key: &FlowKey) {
        let flow = self.flows.find_else_create(key);
        lock_flow(&flow).proxied = true;
    }

    /// Mark a flow as picked up midstream (its first packets were missed).
    pub fn mark_flow_midstream(&self, key: &FlowKey) {
        let flow = self.flows.find_else_create(key);
        lock_flow(&flow).midstream = true;
    }

    // -----------------------------------------------------------------------
    // Third-party delivery
    // -----------------------------------------------------------------------

    /// Deliver an out-of-band classifier verdict for a flow.
    pub fn deliver_tp_verdict(&self, key: &FlowKey, verdict: TpVerdict) {
        let Some(version) = self.tp_version() else {
            return;
        };
        let Some(flow) = self.flows.find(key) else {
            return;
        };
        let mut flow = lock_flow(&flow);
        let Some(session) = flow.session.as_mut() else {
            return;
        };

        let tp = session.tpsession.get_or_insert_with(|| ThirdPartySession::new(version));
        tp.set_state(if verdict.classified { TpState::Classified } else { TpState::Monitoring });
        session.set_tp_app_id(verdict.app_id, &self.app_info);
        if verdict.payload_app_id != APP_ID_NONE {
            session.set_tp_payload_app_id(verdict.payload_app_id, &self.app_info);
        }
    }

    // -----------------------------------------------------------------------
    // Flow lifecycle
    // -----------------------------------------------------------------------

    /// Process one reassembled stream segment.
    pub fn process_segment(
        &self,
        key: &FlowKey,
        direction: Direction,
        data: &[u8],
        packet_time: u32,
    ) {
        self.stats.segments_processed.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_processed.fetch_add(data.len() as u64, Ordering::Relaxed);

        let flow = self.flows.find_else_create(key);
        let mut guard = lock_flow(&flow);
        let flow = &mut *guard;

        if flow.session.is_none() {
            flow.session = Some(self.create_session(key, direction, packet_time, flow.midstream));
            self.stats.flows_created.fetch_add(1, Ordering::Relaxed);
        }
        let Some(session) = flow.session.as_mut() else {
            return;
        };

        let mut change_bits = ChangeBits::new();
        let was_service_detected = session.is_service_detected();
        let was_client_detected = session.is_client_detected();

        session.check_inferred_svcs_version();

        // restart checks observe the state left by the previous packet
        let was_decrypted = session.is_decrypted();
        session.check_app_detection_restart(&mut change_bits, self.tp_version(), flow.proxied);
        if session.is_decrypted() != was_decrypted {
            self.stats.restarts.fetch_add(1, Ordering::Relaxed);
        }

        // reply accounting for the discovery-budget bailout
        match direction {
            Direction::Initiator => {
                session.init_pkts_without_reply += 1;
                session.init_bytes_without_reply += data.len() as u64;
            }
            Direction::Responder => {
                if !data.is_empty() {
                    session.init_pkts_without_reply = 0;
                    session.init_bytes_without_reply = 0;
                }
            }
        }

        // service-side inspection
        let http2_streams = self.inspect_protocols(flow, direction, data, &mut change_bits, packet_time);
        let Some(session) = flow.session.as_mut() else {
            return;
        };

        // client discovery
        self.client_disco.do_client_discovery(
            session,
            data,
            direction,
            flow.midstream,
            &self.app_info,
            &mut change_bits,
            packet_time,
        );

        // TLS metadata scan
        if session.any_session_flags(APPID_SESSION_SSL_SESSION) {
            session.examine_ssl_metadata(&self.ssl_matchers, &self.app_info, &mut change_bits);
        }

        // give up on service discovery when the responder never talks
        if !session.is_service_detected()
            && session.is_svc_taking_too_much_time(
                self.config.max_packets_before_service_fail,
                self.config.max_bytes_before_service_fail,
                self.config.packets_service_fail_ignore,
            )
        {
            session.stop_service_inspection(session.responder_ip, session.responder_port);
        }

        if !was_service_detected && session.is_service_detected() {
            self.stats.service_detections.fetch_add(1, Ordering::Relaxed);
            session.service_disco_state = DiscoveryState::Finished;
            if session.service.service_ip().is_none() {
                session
                    .service
                    .set_service_endpoint(session.responder_ip, session.responder_port);
            }
            if session.service.get_id() > APP_ID_NONE {
                self.service_state.set_service_id_valid(self.service_key(session));
            }
            session.sync_with_stream_protocol_id(
                session.service.get_id(),
                &self.app_info,
                &mut change_bits,
            );
        }
        if !was_client_detected && session.is_client_detected() {
            self.stats.client_detections.fetch_add(1, Ordering::Relaxed);
        }

        // resolution and publication
        let ids = session.picked_ids();
        session.set_application_ids(ids, &mut change_bits);

        let is_http2 = session.service.get_id() == APP_ID_HTTP2;
        let flow_key = flow.key.clone();
        if is_http2 && !http2_streams.is_empty() {
            for stream_index in http2_streams {
                let mut stream_bits = change_bits;
                session.publish_appid_event(
                    &mut stream_bits,
                    &mut flow.stash,
                    &self.publisher,
                    &flow_key,
                    packet_time,
                    true,
                    stream_index,
                );
            }
        } else {
            session.publish_appid_event(
                &mut change_bits,
                &mut flow.stash,
                &self.publisher,
                &flow_key,
                packet_time,
                false,
                0,
            );
        }

        self.update_host_trackers(flow, ids, packet_time);
    }

    /// End a flow: report discovery outcomes and drop the state.
    pub fn end_flow(&self, key: &FlowKey) {
        let Some(flow) = self.flows.remove(key) else {
            return;
        };
        let mut flow = lock_flow(&flow);
        if let Some(session) = flow.session.as_mut() {
            session.on_flow_end(&self.service_state, self.tp_version());
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn create_session(
        &self,
        key: &FlowKey,
        direction: Direction,
        packet_time: u32,
        midstream: bool,
    ) -> AppIdSession {
        let (init_ip, init_port, resp_ip, resp_port) = match direction {
            Direction::Initiator => (key.src_ip, key.src_port, key.dst_ip, key.dst_port),
            Direction::Responder => (key.dst_ip, key.dst_port, key.src_ip, key.src_port),
        };

        let mut session = AppIdSession::new(
            key.proto,
            key.asid,
            init_ip,
            init_port,
            resp_ip,
            resp_port,
            packet_time,
            self.tp_version(),
        );

        session.service.set_port_service_id(port_app_id(resp_port, key.proto));
        if midstream {
            session.set_session_flags(APPID_SESSION_MID);
        }
        if let Some(version) = self.tp_version() {
            session.tpsession = Some(ThirdPartySession::new(version));
        }

        // a destination already known to defeat discovery is not retried
        let service_key = ServiceKey {
            ip: resp_ip,
            proto: key.proto,
            port: resp_port,
            asid: key.asid,
            decrypted: false,
        };
        if self.service_state.state(&service_key) == ServiceIdState::Failed {
            session.stop_service_inspection(resp_ip, resp_port);
        }

        session
    }

    /// Route the segment to the protocol inspector that recognizes it.
    /// Returns the HTTP/2 stream indices touched, for per-stream events.
    fn inspect_protocols(
        &self,
        flow: &mut Flow,
        direction: Direction,
        data: &[u8],
        change_bits: &mut ChangeBits,
        packet_time: u32,
    ) -> Vec<u32> {
        if data.is_empty() {
            return Vec::new();
        }
        let Some(session) = flow.session.as_mut() else {
            return Vec::new();
        };

        if session.service_disco_state == DiscoveryState::None {
            session.service_disco_state = DiscoveryState::Stateful;
        }

        let mut ctx = InspectCtx {
            session,
            app_info: &self.app_info,
            change_bits,
            direction,
            packet_time,
        };

        if flow.http2_data.is_some()
            || (direction == Direction::Initiator && http2::starts_with_preface(data))
        {
            let fd = flow.http2_data.get_or_insert_with(http2::Http2FlowData::new);
            let result = http2::inspect(&mut ctx, fd, data);
            for event in &result.events {
                tracing::debug!(?event, "http/2 inspection event");
            }
            return result.streams_touched;
        }

        if flow.smb2_data.is_some() || smb2::looks_like_smb2(data) {
            let fd = flow.smb2_data.get_or_insert_with(smb2::Smb2FlowData::new);
            for event in smb2::inspect(&mut ctx, fd, data) {
                tracing::debug!(?event, "smb2 inspection event");
            }
            return Vec::new();
        }

        if tls::looks_like_tls(data) {
            let result = tls::inspect(&mut ctx, data);
            let initiator_key = HostKey { ip: ctx.session.initiator_ip, asid: ctx.session.asid };
            let responder_key = HostKey { ip: ctx.session.responder_ip, asid: ctx.session.asid };
            if let Some(fpid) = result.client_fpid {
                let (tracker, _) = self.host_cache.find_else_create(initiator_key, packet_time);
                tracker.add_tcp_fingerprint(fpid);
            }
            if let Some(fpid) = result.server_fpid {
                let (tracker, _) = self.host_cache.find_else_create(responder_key, packet_time);
                tracker.add_tcp_fingerprint(fpid);
            }
            return Vec::new();
        }

        if http::looks_like_http(data, direction) {
            http::inspect(&mut ctx, data);
        }

        Vec::new()
    }

    /// Fold what this packet taught us into the host cache.
    fn update_host_trackers(
        &self,
        flow: &mut Flow,
        ids: crate::session::ApplicationIds,
        packet_time: u32,
    ) {
        let Some(session) = flow.session.as_mut() else {
            return;
        };

        // responder side: services, payloads, users
        let responder_key = HostKey { ip: session.responder_ip, asid: session.asid };
        let (responder, _) = self.host_cache.find_else_create(responder_key, packet_time);
        responder.update_last_seen(packet_time);
        responder.add_xport_proto(session.protocol);

        if ids.service > APP_ID_NONE {
            let inferred = !session.is_service_detected() || session.service.get_id() <= APP_ID_NONE;
            responder.add_service(session.responder_port, session.protocol, ids.service, inferred);

            if ids.payload > APP_ID_NONE {
                responder.add_payload(
                    session.responder_port,
                    session.protocol,
                    ids.payload,
                    ids.service,
                    self.config.max_payloads,
                );
            }

            if let Some(version) = session.service.version() {
                let mut ha = crate::host_tracker::HostApplication {
                    port: session.responder_port,
                    proto: session.protocol,
                    ..Default::default()
                };
                let version = version.to_string();
                responder.update_service_info(
                    &mut ha,
                    Some(""),
                    Some(&version),
                    self.config.max_info,
                );
            }

            if let Some((user, success)) = session.client_username.take() {
                responder.update_service_user(
                    session.responder_port,
                    session.protocol,
                    Some(&user),
                    packet_time,
                    self.config.max_services,
                    success,
                );
            }
        }

        // initiator side: clients and user-agent fingerprints
        if ids.client > APP_ID_NONE {
            let initiator_key = HostKey { ip: session.initiator_ip, asid: session.asid };
            let (initiator, _) = self.host_cache.find_else_create(initiator_key, packet_time);
            initiator.update_last_seen(packet_time);

            let version = session.client.version().map(str::to_string);
            let (mut hc, _) =
                initiator.find_or_add_client(ids.client, version.as_deref(), ids.service);
            if ids.payload > APP_ID_NONE {
                initiator.add_client_payload(&mut hc, ids.payload, self.config.max_payloads);
            }

            if let Some(hsession) = session.get_http_session(0) {
                if let Some(user_agent) = hsession.user_agent.as_deref() {
                    initiator.add_ua_fingerprint(
                        fingerprint_id(user_agent),
                        1,
                        false,
                        None,
                        self.config.max_devices,
                    );
                }
            }
        }
    }

    fn service_key(&self, session: &AppIdSession) -> ServiceKey {
        ServiceKey {
            ip: session.service.service_ip().unwrap_or(session.responder_ip),
            proto: session.protocol,
            port: if session.service.service_port() != 0 {
                session.service.service_port()
            } else {
                session.responder_port
            },
            asid: session.asid,
            decrypted: session.is_decrypted(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
