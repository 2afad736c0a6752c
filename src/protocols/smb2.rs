//! # SMB2 Header Inspector
//!
//! Fixed-layout little-endian SMB2 structures and the per-session
//! file/tree/request trackers keyed by (session id, tree id, file id,
//! message id). The inspector classifies the flow as SMB, follows
//! compounded commands through `next_command`, and keeps enough state to
//! attribute reads and writes to the files they touch.
//!
//! ## Wire format
//!
//! A message starts with the 4-byte magic `FE 'SMB'` and a 64-byte header
//! whose `structure_size` field MUST be 64. Sync and async variants share
//! the layout except for bytes 32..40 (reserved+tree id vs async id),
//! differentiated by a flag bit. Each command's request/response body
//! opens with its own fixed structure size.

use std::collections::HashMap;

use crate::app_info::APP_ID_SMB;
use crate::protocols::InspectCtx;

/// SMB2 protocol magic.
pub const SMB2_MAGIC: [u8; 4] = [0xfe, b'S', b'M', b'B'];

/// Header length; `structure_size` MUST carry this value.
pub const SMB2_HEADER_LENGTH: usize = 64;

// header flags
pub const SMB2_FLAGS_SERVER_TO_REDIR: u32 = 0x0000_0001;
pub const SMB2_FLAGS_ASYNC_COMMAND: u32 = 0x0000_0002;

// command codes
pub const SMB2_COM_NEGOTIATE: u16 = 0x00;
pub const SMB2_COM_SESSION_SETUP: u16 = 0x01;
pub const SMB2_COM_LOGOFF: u16 = 0x02;
pub const SMB2_COM_TREE_CONNECT: u16 = 0x03;
pub const SMB2_COM_TREE_DISCONNECT: u16 = 0x04;
pub const SMB2_COM_CREATE: u16 = 0x05;
pub const SMB2_COM_CLOSE: u16 = 0x06;
pub const SMB2_COM_FLUSH: u16 = 0x07;
pub const SMB2_COM_READ: u16 = 0x08;
pub const SMB2_COM_WRITE: u16 = 0x09;
pub const SMB2_COM_LOCK: u16 = 0x0a;
pub const SMB2_COM_IOCTL: u16 = 0x0b;
pub const SMB2_COM_CANCEL: u16 = 0x0c;
pub const SMB2_COM_ECHO: u16 = 0x0d;
pub const SMB2_COM_QUERY_DIRECTORY: u16 = 0x0e;
pub const SMB2_COM_CHANGE_NOTIFY: u16 = 0x0f;
pub const SMB2_COM_QUERY_INFO: u16 = 0x10;
pub const SMB2_COM_SET_INFO: u16 = 0x11;
pub const SMB2_COM_OPLOCK_BREAK: u16 = 0x12;
pub const SMB2_COM_MAX: u16 = 0x13;

// body structure sizes
pub const SMB2_CREATE_REQUEST_STRUC_SIZE: u16 = 57;
pub const SMB2_CREATE_RESPONSE_STRUC_SIZE: u16 = 89;
pub const SMB2_WRITE_REQUEST_STRUC_SIZE: u16 = 49;
pub const SMB2_WRITE_RESPONSE_STRUC_SIZE: u16 = 17;
pub const SMB2_READ_REQUEST_STRUC_SIZE: u16 = 49;
pub const SMB2_READ_RESPONSE_STRUC_SIZE: u16 = 17;
pub const SMB2_CLOSE_REQUEST_STRUC_SIZE: u16 = 24;
pub const SMB2_TREE_CONNECT_RESPONSE_STRUC_SIZE: u16 = 16;
pub const SMB2_SETUP_REQUEST_STRUC_SIZE: u16 = 25;
pub const SMB2_ERROR_RESPONSE_STRUC_SIZE: u16 = 9;

// share types on tree-connect response
pub const SMB2_SHARE_TYPE_DISK: u8 = 0x01;
pub const SMB2_SHARE_TYPE_PIPE: u8 = 0x02;
pub const SMB2_SHARE_TYPE_PRINT: u8 = 0x03;

/// Command names for operational dumps, indexed by command code.
pub const SMB2_COMMAND_STRINGS: [&str; SMB2_COM_MAX as usize] = [
    "NEGOTIATE",
    "SESSION_SETUP",
    "LOGOFF",
    "TREE_CONNECT",
    "TREE_DISCONNECT",
    "CREATE",
    "CLOSE",
    "FLUSH",
    "READ",
    "WRITE",
    "LOCK",
    "IOCTL",
    "CANCEL",
    "ECHO",
    "QUERY_DIRECTORY",
    "CHANGE_NOTIFY",
    "QUERY_INFO",
    "SET_INFO",
    "OPLOCK_BREAK",
];

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Inspection events for malformed SMB2 input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Smb2Event {
    BadHeaderStructureSize,
    BadBodyStructureSize,
    UnknownCommand,
    TruncatedMessage,
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn le16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn le32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn le64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Parsed 64-byte SMB2 header, sync or async.
#[derive(Debug, Clone, Copy)]
pub struct Smb2Hdr {
    pub structure_size: u16,
    pub credit_charge: u16,
    pub status: u32,
    pub command: u16,
    pub credit: u16,
    pub flags: u32,
    pub next_command: u32,
    pub message_id: u64,
    /// Tree id for sync messages; `None` on the async variant.
    pub tree_id: Option<u32>,
    /// Async id for async messages; `None` on the sync variant.
    pub async_id: Option<u64>,
    pub session_id: u64,
}

impl Smb2Hdr {
    /// True for server-to-client messages.
    pub fn is_response(&self) -> bool {
        self.flags & SMB2_FLAGS_SERVER_TO_REDIR != 0
    }

    pub fn is_async(&self) -> bool {
        self.flags & SMB2_FLAGS_ASYNC_COMMAND != 0
    }

    /// Parse a header from the start of `data`. `None` if the magic or
    /// length do not fit.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < SMB2_HEADER_LENGTH || data[..4] != SMB2_MAGIC {
            return None;
        }

        let flags = le32(data, 16);
        let is_async = flags & SMB2_FLAGS_ASYNC_COMMAND != 0;

        Some(Self {
            structure_size: le16(data, 4),
            credit_charge: le16(data, 6),
            status: le32(data, 8),
            command: le16(data, 12),
            credit: le16(data, 14),
            flags,
            next_command: le32(data, 20),
            message_id: le64(data, 24),
            tree_id: (!is_async).then(|| le32(data, 36)),
            async_id: is_async.then(|| le64(data, 32)),
            session_id: le64(data, 40),
        })
    }
}

// ---------------------------------------------------------------------------
// Command bodies
// ---------------------------------------------------------------------------

/// Create request: carries the file name by offset/length from the SMB2
/// header.
#[derive(Debug, Clone)]
pub struct Smb2CreateRequest {
    pub name_offset: u16,
    pub name_length: u16,
    pub file_name: Option<String>,
}

impl Smb2CreateRequest {
    /// Parse from the body, with the whole message available for the
    /// name-offset dereference.
    pub fn parse(message: &[u8], body: &[u8]) -> Option<Self> {
        if body.len() < 56 || le16(body, 0) != SMB2_CREATE_REQUEST_STRUC_SIZE {
            return None;
        }
        let name_offset = le16(body, 44);
        let name_length = le16(body, 46);

        let start = name_offset as usize;
        let end = start + name_length as usize;
        let file_name = message.get(start..end).map(utf16le_to_string);

        Some(Self { name_offset, name_length, file_name })
    }
}

/// Create response: yields the durable file id.
#[derive(Debug, Clone, Copy)]
pub struct Smb2CreateResponse {
    pub end_of_file: u64,
    pub file_attributes: u32,
    pub file_id: u64,
}

impl Smb2CreateResponse {
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 88 || le16(body, 0) != SMB2_CREATE_RESPONSE_STRUC_SIZE {
            return None;
        }
        Some(Self {
            end_of_file: le64(body, 48),
            file_attributes: le32(body, 56),
            file_id: le64(body, 64),
        })
    }
}

/// Read and write requests share the fields the trackers need.
#[derive(Debug, Clone, Copy)]
pub struct Smb2ReadWriteRequest {
    pub length: u32,
    pub offset: u64,
    pub file_id: u64,
}

impl Smb2ReadWriteRequest {
    pub fn parse(body: &[u8], expected_struc_size: u16) -> Option<Self> {
        if body.len() < 48 || le16(body, 0) != expected_struc_size {
            return None;
        }
        Some(Self { length: le32(body, 4), offset: le64(body, 8), file_id: le64(body, 16) })
    }
}

/// Close request: releases a file id.
#[derive(Debug, Clone, Copy)]
pub struct Smb2CloseRequest {
    pub file_id: u64,
}

impl Smb2CloseRequest {
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 24 || le16(body, 0) != SMB2_CLOSE_REQUEST_STRUC_SIZE {
            return None;
        }
        Some(Self { file_id: le64(body, 8) })
    }
}

/// Tree-connect response: announces the share type.
#[derive(Debug, Clone, Copy)]
pub struct Smb2TreeConnectResponse {
    pub share_type: u8,
}

impl Smb2TreeConnectResponse {
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 16 || le16(body, 0) != SMB2_TREE_CONNECT_RESPONSE_STRUC_SIZE {
            return None;
        }
        Some(Self { share_type: body[2] })
    }
}

fn utf16le_to_string(data: &[u8]) -> String {
    let units: Vec<u16> = data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units)
}

// ---------------------------------------------------------------------------
// Trackers
// ---------------------------------------------------------------------------

/// One open file on a tree.
#[derive(Debug, Clone, Default)]
pub struct Smb2FileTracker {
    pub file_id: u64,
    pub file_name: Option<String>,
    pub file_size: u64,
    pub bytes_processed: u64,
    pub upload: bool,
}

/// A pending request awaiting its response, keyed by message id.
#[derive(Debug, Clone, Default)]
pub struct Smb2RequestTracker {
    pub file_name: Option<String>,
    pub file_id: u64,
    pub offset: u64,
}

/// One tree connect, keyed by tree id.
#[derive(Debug, Default)]
pub struct Smb2TreeTracker {
    pub share_type: u8,
    files: HashMap<u64, Smb2FileTracker>,
    requests: HashMap<u64, Smb2RequestTracker>,
}

impl Smb2TreeTracker {
    pub fn find_file(&self, file_id: u64) -> Option<&Smb2FileTracker> {
        self.files.get(&file_id)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }
}

/// One authenticated session, keyed by session id.
#[derive(Debug, Default)]
pub struct Smb2SessionTracker {
    trees: HashMap<u32, Smb2TreeTracker>,
}

impl Smb2SessionTracker {
    pub fn find_tree(&self, tree_id: u32) -> Option<&Smb2TreeTracker> {
        self.trees.get(&tree_id)
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}

/// Per-flow SMB2 inspector state.
#[derive(Debug, Default)]
pub struct Smb2FlowData {
    sessions: HashMap<u64, Smb2SessionTracker>,
}

impl Smb2FlowData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_session(&self, session_id: u64) -> Option<&Smb2SessionTracker> {
        self.sessions.get(&session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// Sniff whether a segment starts an SMB2 message.
pub fn looks_like_smb2(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == SMB2_MAGIC
}

/// Inspect one segment of an SMB2 flow, following compounded commands.
pub fn inspect(ctx: &mut InspectCtx, fd: &mut Smb2FlowData, data: &[u8]) -> Vec<Smb2Event> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset + SMB2_HEADER_LENGTH <= data.len() {
        let message = &data[offset..];
        let Some(header) = Smb2Hdr::parse(message) else {
            break;
        };

        if header.structure_size as usize != SMB2_HEADER_LENGTH {
            events.push(Smb2Event::BadHeaderStructureSize);
            break;
        }
        if header.command >= SMB2_COM_MAX {
            events.push(Smb2Event::UnknownCommand);
            break;
        }

        // a well-formed header is enough to call the service
        if ctx.session.service.get_id() != APP_ID_SMB {
            ctx.session.service.update(APP_ID_SMB, None);
            ctx.session.set_service_detected();
        }

        let body = &message[SMB2_HEADER_LENGTH..];
        process_command(fd, &header, message, body, &mut events);

        // compounded messages chain via next_command
        if header.next_command == 0 {
            break;
        }
        offset += header.next_command as usize;
    }

    events
}

fn process_command(
    fd: &mut Smb2FlowData,
    header: &Smb2Hdr,
    message: &[u8],
    body: &[u8],
    events: &mut Vec<Smb2Event>,
) {
    if header.command == SMB2_COM_LOGOFF && !header.is_response() {
        fd.sessions.remove(&header.session_id);
        return;
    }

    let session = fd.sessions.entry(header.session_id).or_default();
    let tree_id = header.tree_id.unwrap_or(0);

    match (header.command, header.is_response()) {
        (SMB2_COM_SESSION_SETUP, false) => {
            if body.len() >= 2 && le16(body, 0) != SMB2_SETUP_REQUEST_STRUC_SIZE {
                events.push(Smb2Event::BadBodyStructureSize);
            }
        }
        (SMB2_COM_TREE_CONNECT, true) => {
            if let Some(response) = Smb2TreeConnectResponse::parse(body) {
                let tree = session.trees.entry(tree_id).or_default();
                tree.share_type = response.share_type;
            } else {
                events.push(Smb2Event::BadBodyStructureSize);
            }
        }
        (SMB2_COM_TREE_DISCONNECT, false) => {
            session.trees.remove(&tree_id);
        }
        (SMB2_COM_CREATE, false) => {
            if let Some(request) = Smb2CreateRequest::parse(message, body) {
                let tree = session.trees.entry(tree_id).or_default();
                tree.requests.insert(
                    header.message_id,
                    Smb2RequestTracker { file_name: request.file_name, file_id: 0, offset: 0 },
                );
            } else {
                events.push(Smb2Event::BadBodyStructureSize);
            }
        }
        (SMB2_COM_CREATE, true) => {
            if let Some(response) = Smb2CreateResponse::parse(body) {
                let tree = session.trees.entry(tree_id).or_default();
                let file_name =
                    tree.requests.remove(&header.message_id).and_then(|r| r.file_name);
                tree.files.insert(
                    response.file_id,
                    Smb2FileTracker {
                        file_id: response.file_id,
                        file_name,
                        file_size: response.end_of_file,
                        bytes_processed: 0,
                        upload: false,
                    },
                );
            } else {
                events.push(Smb2Event::BadBodyStructureSize);
            }
        }
        (SMB2_COM_WRITE, false) => {
            if let Some(request) = Smb2ReadWriteRequest::parse(body, SMB2_WRITE_REQUEST_STRUC_SIZE)
            {
                let tree = session.trees.entry(tree_id).or_default();
                if let Some(file) = tree.files.get_mut(&request.file_id) {
                    file.upload = true;
                    file.bytes_processed += u64::from(request.length);
                }
            } else {
                events.push(Smb2Event::BadBodyStructureSize);
            }
        }
        (SMB2_COM_READ, false) => {
            if let Some(request) = Smb2ReadWriteRequest::parse(body, SMB2_READ_REQUEST_STRUC_SIZE)
            {
                let tree = session.trees.entry(tree_id).or_default();
                tree.requests.insert(
                    header.message_id,
                    Smb2RequestTracker {
                        file_name: None,
                        file_id: request.file_id,
                        offset: request.offset,
                    },
                );
            } else {
                events.push(Smb2Event::BadBodyStructureSize);
            }
        }
        (SMB2_COM_READ, true) => {
            let tree = session.trees.entry(tree_id).or_default();
            if let Some(request) = tree.requests.remove(&header.message_id) {
                if body.len() >= 8 && le16(body, 0) == SMB2_READ_RESPONSE_STRUC_SIZE {
                    let length = le32(body, 4);
                    if let Some(file) = tree.files.get_mut(&request.file_id) {
                        file.bytes_processed += u64::from(length);
                    }
                }
            }
        }
        (SMB2_COM_CLOSE, false) => {
            if let Some(request) = Smb2CloseRequest::parse(body) {
                let tree = session.trees.entry(tree_id).or_default();
                tree.files.remove(&request.file_id);
            } else {
                events.push(Smb2Event::BadBodyStructureSize);
            }
        }
        _ => {}
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
    use crate::protocols::Direction;
    use crate::session::AppIdSession;

    fn header(command: u16, flags: u32, message_id: u64, tree_id: u32, session_id: u64) -> Vec<u8> {
        let mut out = vec![0u8; SMB2_HEADER_LENGTH];
        out[..4].copy_from_slice(&SMB2_MAGIC);
        out[4..6].copy_from_slice(&64u16.to_le_bytes());
        out[12..14].copy_from_slice(&command.to_le_bytes());
        out[16..20].copy_from_slice(&flags.to_le_bytes());
        out[24..32].copy_from_slice(&message_id.to_le_bytes());
        out[36..40].copy_from_slice(&tree_id.to_le_bytes());
        out[40..48].copy_from_slice(&session_id.to_le_bytes());
        out
    }

    fn session() -> AppIdSession {
        AppIdSession::new(
            IP_PROTO_TCP,
            0,
            "10.0.0.1".parse().unwrap(),
            49152,
            "10.0.0.2".parse().unwrap(),
            445,
            1000,
            None,
        )
    }

    fn inspect_message(
        asd: &mut AppIdSession,
        fd: &mut Smb2FlowData,
        direction: Direction,
        data: &[u8],
    ) -> Vec<Smb2Event> {
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
    fn test_header_parse_sync() {
        let data = header(SMB2_COM_CREATE, 0, 7, 3, 0x1122);
        let hdr = Smb2Hdr::parse(&data).unwrap();
        assert_eq!(hdr.structure_size, 64);
        assert_eq!(hdr.command, SMB2_COM_CREATE);
        assert_eq!(hdr.message_id, 7);
        assert_eq!(hdr.tree_id, Some(3));
        assert_eq!(hdr.async_id, None);
        assert_eq!(hdr.session_id, 0x1122);
        assert!(!hdr.is_response());
        assert!(!hdr.is_async());
    }

    #[test]
    fn test_header_parse_async() {
        let mut data = header(SMB2_COM_READ, SMB2_FLAGS_ASYNC_COMMAND, 9, 0, 5);
        data[32..40].copy_from_slice(&0xdead_beefu64.to_le_bytes());
        let hdr = Smb2Hdr::parse(&data).unwrap();
        assert!(hdr.is_async());
        assert_eq!(hdr.async_id, Some(0xdead_beef));
        assert_eq!(hdr.tree_id, None);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut data = header(SMB2_COM_CREATE, 0, 1, 1, 1);
        data[0] = 0xff;
        assert!(Smb2Hdr::parse(&data).is_none());
    }

    #[test]
    fn test_tree_connect_share_type() {
        let mut asd = session();
        let mut fd = Smb2FlowData::new();

        let mut message =
            header(SMB2_COM_TREE_CONNECT, SMB2_FLAGS_SERVER_TO_REDIR, 1, 42, 0x99);
        let mut body = vec![0u8; 16];
        body[..2].copy_from_slice(&SMB2_TREE_CONNECT_RESPONSE_STRUC_SIZE.to_le_bytes());
        body[2] = SMB2_SHARE_TYPE_PIPE;
        message.extend(body);

        let events = inspect_message(&mut asd, &mut fd, Direction::Responder, &message);
        assert!(events.is_empty());
        assert_eq!(asd.service.get_id(), APP_ID_SMB);
        assert!(asd.is_service_detected());
        let tree = fd.find_session(0x99).unwrap().find_tree(42).unwrap();
        assert_eq!(tree.share_type, SMB2_SHARE_TYPE_PIPE);
    }

    #[test]
    fn test_create_request_response_tracks_file() {
        let mut asd = session();
        let mut fd = Smb2FlowData::new();

        // create request with a UTF-16LE file name at offset 120
        let mut message = header(SMB2_COM_CREATE, 0, 5, 1, 0x10);
        let name: Vec<u8> = "doc.txt".encode_utf16().flat_map(u16::to_le_bytes).collect();
        let mut body = vec![0u8; 56];
        body[..2].copy_from_slice(&SMB2_CREATE_REQUEST_STRUC_SIZE.to_le_bytes());
        body[44..46].copy_from_slice(&120u16.to_le_bytes()); // name offset
        body[46..48].copy_from_slice(&(name.len() as u16).to_le_bytes());
        message.extend(body);
        message.extend(&name);
        inspect_message(&mut asd, &mut fd, Direction::Initiator, &message);

        let tree = fd.find_session(0x10).unwrap().find_tree(1).unwrap();
        assert_eq!(tree.pending_requests(), 1);

        // matching response carries the file id
        let mut response = header(SMB2_COM_CREATE, SMB2_FLAGS_SERVER_TO_REDIR, 5, 1, 0x10);
        let mut body = vec![0u8; 88];
        body[..2].copy_from_slice(&SMB2_CREATE_RESPONSE_STRUC_SIZE.to_le_bytes());
        body[48..56].copy_from_slice(&4096u64.to_le_bytes()); // end of file
        body[64..72].copy_from_slice(&0xf1u64.to_le_bytes()); // file id
        response.extend(body);
        inspect_message(&mut asd, &mut fd, Direction::Responder, &response);

        let tree = fd.find_session(0x10).unwrap().find_tree(1).unwrap();
        assert_eq!(tree.pending_requests(), 0);
        let file = tree.find_file(0xf1).unwrap();
        assert_eq!(file.file_name.as_deref(), Some("doc.txt"));
        assert_eq!(file.file_size, 4096);
    }

    #[test]
    fn test_write_marks_upload_and_close_releases() {
        let mut asd = session();
        let mut fd = Smb2FlowData::new();

        // open a file directly via create response
        let mut response = header(SMB2_COM_CREATE, SMB2_FLAGS_SERVER_TO_REDIR, 1, 1, 0x10);
        let mut body = vec![0u8; 88];
        body[..2].copy_from_slice(&SMB2_CREATE_RESPONSE_STRUC_SIZE.to_le_bytes());
        body[64..72].copy_from_slice(&0xabu64.to_le_bytes());
        response.extend(body);
        inspect_message(&mut asd, &mut fd, Direction::Responder, &response);

        // write 100 bytes to it
        let mut write = header(SMB2_COM_WRITE, 0, 2, 1, 0x10);
        let mut body = vec![0u8; 48];
        body[..2].copy_from_slice(&SMB2_WRITE_REQUEST_STRUC_SIZE.to_le_bytes());
        body[4..8].copy_from_slice(&100u32.to_le_bytes());
        body[16..24].copy_from_slice(&0xabu64.to_le_bytes());
        write.extend(body);
        inspect_message(&mut asd, &mut fd, Direction::Initiator, &write);

        let tree = fd.find_session(0x10).unwrap().find_tree(1).unwrap();
        let file = tree.find_file(0xab).unwrap();
        assert!(file.upload);
        assert_eq!(file.bytes_processed, 100);

        // close releases the tracker
        let mut close = header(SMB2_COM_CLOSE, 0, 3, 1, 0x10);
        let mut body = vec![0u8; 24];
        body[..2].copy_from_slice(&SMB2_CLOSE_REQUEST_STRUC_SIZE.to_le_bytes());
        body[8..16].copy_from_slice(&0xabu64.to_le_bytes());
        close.extend(body);
        inspect_message(&mut asd, &mut fd, Direction::Initiator, &close);

        let tree = fd.find_session(0x10).unwrap().find_tree(1).unwrap();
        assert_eq!(tree.file_count(), 0);
    }

    #[test]
    fn test_unknown_command_event() {
        let mut asd = session();
        let mut fd = Smb2FlowData::new();
        let message = header(0x55, 0, 1, 1, 1);
        let events = inspect_message(&mut asd, &mut fd, Direction::Initiator, &message);
        assert!(events.contains(&Smb2Event::UnknownCommand));
    }

    #[test]
    fn test_bad_body_structure_size() {
        let mut asd = session();
        let mut fd = Smb2FlowData::new();
        let mut message = header(SMB2_COM_CLOSE, 0, 1, 1, 1);
        let mut body = vec![0u8; 24];
        body[..2].copy_from_slice(&99u16.to_le_bytes());
        message.extend(body);
        let events = inspect_message(&mut asd, &mut fd, Direction::Initiator, &message);
        assert!(events.contains(&Smb2Event::BadBodyStructureSize));
    }

    #[test]
    fn test_command_strings() {
        assert_eq!(SMB2_COMMAND_STRINGS[SMB2_COM_CREATE as usize], "CREATE");
        assert_eq!(SMB2_COMMAND_STRINGS[SMB2_COM_OPLOCK_BREAK as usize], "OPLOCK_BREAK");
    }
}
