//! # Session Replay Integration Tests
//!
//! Drives the engine with synthetic, already-reassembled stream segments
//! and checks the externally observable outcomes: published change events,
//! picked application ids, and the facts accumulated in the host cache.
//!
//! Each test plays one conversation shape:
//! - HTTP/1 request/response with client identification
//! - HTTP/2 preface and per-stream header blocks
//! - SMB2 tree connect and file create
//! - TLS on a well-known SSL port triggering a detection restart
//! - an HTTP tunnel verdict from the third-party classifier
//! - host tracker visibility across flows

use appsight_engine::app_info::{
    APP_ID_CURL, APP_ID_HTTP, APP_ID_HTTP2, APP_ID_HTTPS, APP_ID_HTTP_TUNNEL, APP_ID_OPENSSH,
    APP_ID_SMB, APP_ID_SSH,
};
use appsight_engine::change_bits::ChangeBit;
use appsight_engine::flow::{FlowKey, IP_PROTO_TCP};
use appsight_engine::host_cache::HostKey;
use appsight_engine::protocols::{http2, smb2, Direction};
use appsight_engine::third_party::{ThirdPartyContext, TpVerdict};
use appsight_engine::{EngineConfig, InspectorEngine};

fn flow_key(last_octet: u8, dst_port: u16) -> FlowKey {
    FlowKey::new(
        std::net::IpAddr::from([192, 168, 1, last_octet]),
        "192.168.1.200".parse().unwrap(),
        49152,
        dst_port,
        IP_PROTO_TCP,
        0,
    )
}

fn engine() -> InspectorEngine {
    InspectorEngine::new(EngineConfig::default()).unwrap()
}

// ---------------------------------------------------------------------------
// HTTP/1
// ---------------------------------------------------------------------------

#[test]
fn test_http_transaction() {
    let engine = engine();
    let key = flow_key(10, 80);

    engine.process_segment(
        &key,
        Direction::Initiator,
        b"GET /download/tool.tar.gz HTTP/1.1\r\n\
          Host: files.example.com\r\n\
          User-Agent: curl/8.5.0\r\n\r\n",
        1000,
    );
    engine.process_segment(
        &key,
        Direction::Responder,
        b"HTTP/1.1 200 OK\r\nContent-Type: application/gzip\r\n\r\n",
        1001,
    );

    let events = engine.drain_events();
    assert!(!events.is_empty());
    let first = &events[0];
    assert!(first.bits.is_set(ChangeBit::Created));
    assert!(first.bits.is_set(ChangeBit::Host));
    assert!(first.bits.is_set(ChangeBit::Url));
    assert!(first.bits.is_set(ChangeBit::UserAgent));

    let ids = first.api.application_ids();
    assert_eq!(ids.service, APP_ID_HTTP);
    assert_eq!(ids.client, APP_ID_CURL);

    engine.end_flow(&key);
}

// ---------------------------------------------------------------------------
// HTTP/2
// ---------------------------------------------------------------------------

fn http2_frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
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

#[test]
fn test_http2_per_stream_events() {
    let engine = engine();
    let key = flow_key(11, 443);

    let mut data = http2::CONNECTION_PREFACE.to_vec();
    // two streams: indexed :method GET + :path /, then :path /index.html
    data.extend(http2_frame(0x1, 0x4, 1, &[0x82, 0x84]));
    data.extend(http2_frame(0x1, 0x4, 3, &[0x82, 0x85]));
    engine.process_segment(&key, Direction::Initiator, &data, 1000);

    let events = engine.drain_events();
    let stream_events: Vec<_> = events.iter().filter(|e| e.is_http2).collect();
    assert_eq!(stream_events.len(), 2);
    assert_eq!(stream_events[0].http2_stream_index, 0);
    assert_eq!(stream_events[1].http2_stream_index, 1);
    assert_eq!(stream_events[0].api.application_ids().service, APP_ID_HTTP2);
}

// ---------------------------------------------------------------------------
// SMB2
// ---------------------------------------------------------------------------

fn smb2_header(command: u16, flags: u32, message_id: u64, tree_id: u32, session_id: u64) -> Vec<u8> {
    let mut out = vec![0u8; 64];
    out[..4].copy_from_slice(&smb2::SMB2_MAGIC);
    out[4..6].copy_from_slice(&64u16.to_le_bytes());
    out[12..14].copy_from_slice(&command.to_le_bytes());
    out[16..20].copy_from_slice(&flags.to_le_bytes());
    out[24..32].copy_from_slice(&message_id.to_le_bytes());
    out[36..40].copy_from_slice(&tree_id.to_le_bytes());
    out[40..48].copy_from_slice(&session_id.to_le_bytes());
    out
}

#[test]
fn test_smb2_flow_classification() {
    let engine = engine();
    let key = flow_key(12, 445);

    let negotiate = smb2_header(smb2::SMB2_COM_NEGOTIATE, 0, 0, 0, 0);
    engine.process_segment(&key, Direction::Initiator, &negotiate, 1000);

    // tree connect response announcing a disk share
    let mut response =
        smb2_header(smb2::SMB2_COM_TREE_CONNECT, smb2::SMB2_FLAGS_SERVER_TO_REDIR, 1, 7, 0x42);
    let mut body = vec![0u8; 16];
    body[..2].copy_from_slice(&16u16.to_le_bytes());
    body[2] = smb2::SMB2_SHARE_TYPE_DISK;
    response.extend(body);
    engine.process_segment(&key, Direction::Responder, &response, 1001);

    let events = engine.drain_events();
    assert_eq!(events[0].api.application_ids().service, APP_ID_SMB);

    // the responder host now carries the SMB service
    let responder = engine
        .host_cache()
        .find(&HostKey { ip: "192.168.1.200".parse().unwrap(), asid: 0 })
        .unwrap();
    assert_eq!(responder.get_appid(445, IP_PROTO_TCP, false, false), APP_ID_SMB);
}

// ---------------------------------------------------------------------------
// TLS restart
// ---------------------------------------------------------------------------

/// Minimal ClientHello record with an SNI extension.
fn client_hello(server_name: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0x0303u16.to_be_bytes());
    body.extend_from_slice(&[0u8; 32]);
    body.push(0);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&0x1301u16.to_be_bytes());
    body.push(1);
    body.push(0);

    let name = server_name.as_bytes();
    let sni_data_len = 5 + name.len();
    body.extend_from_slice(&((4 + sni_data_len) as u16).to_be_bytes());
    body.extend_from_slice(&0x0000u16.to_be_bytes());
    body.extend_from_slice(&(sni_data_len as u16).to_be_bytes());
    body.extend_from_slice(&((3 + name.len()) as u16).to_be_bytes());
    body.push(0);
    body.extend_from_slice(&(name.len() as u16).to_be_bytes());
    body.extend_from_slice(name);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    record.push(0x01);
    record.push(0);
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(&body);
    record
}

#[test]
fn test_ssl_restart_preserves_encrypted_snapshot() {
    let engine = engine();
    let key = flow_key(13, 443);
    engine.mark_flow_proxied(&key);

    // the port-derived service is HTTPS, so the restart fires immediately
    // on the proxied flow and snapshots it
    engine.process_segment(&key, Direction::Initiator, &client_hello("shop.example.com"), 1000);

    let events = engine.drain_events();
    let tls_event = events.iter().find(|e| e.bits.is_set(ChangeBit::TlsHost)).unwrap();
    assert_eq!(tls_event.api.tls_host().as_deref(), Some("shop.example.com"));

    // decrypted HTTP appears after the restart; the flow re-identifies
    engine.process_segment(
        &key,
        Direction::Initiator,
        b"GET / HTTP/1.1\r\nHost: shop.example.com\r\nUser-Agent: curl/8.5.0\r\n\r\n",
        1001,
    );
    let events = engine.drain_events();
    let ids = events.last().unwrap().api.application_ids();
    assert_eq!(ids.client, APP_ID_CURL);
    // the decrypted side re-identified the carried application
    assert_eq!(ids.service, APP_ID_HTTP);
}

// ---------------------------------------------------------------------------
// HTTP tunnel
// ---------------------------------------------------------------------------

#[test]
fn test_tunnel_verdict_overrides_payload() {
    let engine = InspectorEngine::new(EngineConfig::default())
        .unwrap()
        .with_third_party(ThirdPartyContext::new(1));
    let key = flow_key(14, 8080);

    engine.process_segment(
        &key,
        Direction::Initiator,
        b"GET / HTTP/1.1\r\nHost: proxy.example.com\r\n\r\n",
        1000,
    );
    engine.deliver_tp_verdict(
        &key,
        TpVerdict {
            app_id: APP_ID_HTTP,
            payload_app_id: APP_ID_HTTP_TUNNEL,
            classified: true,
        },
    );
    engine.drain_events();

    // the next packet observes the tunnel verdict and restarts detection
    engine.process_segment(&key, Direction::Initiator, b"\x05\x01\x00", 1001);
    let events = engine.drain_events();
    let ids = events.last().unwrap().api.application_ids();
    assert_eq!(ids.payload, APP_ID_HTTP_TUNNEL);
    assert_eq!(ids.service, APP_ID_HTTP);
}

// ---------------------------------------------------------------------------
// Host tracker across flows
// ---------------------------------------------------------------------------

#[test]
fn test_two_service_host_and_visibility() {
    let engine = engine();
    let responder_key = HostKey { ip: "192.168.1.200".parse().unwrap(), asid: 0 };

    let k1 = flow_key(15, 22);
    engine.process_segment(&k1, Direction::Initiator, b"SSH-2.0-OpenSSH_9.6p1\r\n", 1000);

    let k2 = flow_key(16, 80);
    engine.process_segment(
        &k2,
        Direction::Initiator,
        b"GET / HTTP/1.1\r\nHost: www\r\n\r\n",
        1001,
    );

    let tracker = engine.host_cache().find(&responder_key).unwrap();
    assert_eq!(tracker.get_service_count(), 2);
    assert_eq!(tracker.get_appid(22, IP_PROTO_TCP, false, false), APP_ID_SSH);
    assert_eq!(tracker.get_appid(80, IP_PROTO_TCP, false, false), APP_ID_HTTP);

    // soft-delete one service; the count drops and a re-add restores it
    assert!(tracker.set_service_visibility(22, IP_PROTO_TCP, false));
    assert_eq!(tracker.get_service_count(), 1);
    assert!(tracker.add_service(22, IP_PROTO_TCP, APP_ID_SSH, false));
    assert_eq!(tracker.get_service_count(), 2);

    // the initiator of the SSH flow learned its client
    let initiator = engine
        .host_cache()
        .find(&HostKey { ip: "192.168.1.15".parse().unwrap(), asid: 0 })
        .unwrap();
    let clients = initiator.get_clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].id, APP_ID_OPENSSH);

    // a stringify of the responder lists both services exactly once
    let mut dump = String::new();
    tracker.stringify(&mut dump);
    assert_eq!(dump.matches("port: 22").count(), 1);
    assert_eq!(dump.matches("port: 80").count(), 1);
}

#[test]
fn test_cache_invalidation_retires_hosts() {
    let engine = engine();
    let key = flow_key(17, 22);
    engine.process_segment(&key, Direction::Initiator, b"SSH-2.0-OpenSSH_9.6\r\n", 1000);

    let responder_key = HostKey { ip: "192.168.1.200".parse().unwrap(), asid: 0 };
    assert!(engine.host_cache().find(&responder_key).is_some());

    engine.host_cache().invalidate_all();
    assert!(engine.host_cache().find(&responder_key).is_none());

    // new traffic re-materializes the host with freshly discovered state
    engine.process_segment(&key, Direction::Initiator, b"more data", 1001);
    let tracker = engine.host_cache().find(&responder_key).unwrap();
    assert_eq!(tracker.get_service_count(), 1);
    assert_eq!(tracker.get_appid(22, IP_PROTO_TCP, false, false), APP_ID_SSH);
}
