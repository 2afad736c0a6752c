//! # HPACK Header Decompression
//!
//! RFC 7541 decoder used by the HTTP/2 inspector. An encoded header block
//! is translated into a decoded header list written as `name: value\r\n`
//! lines followed by a final `\r\n`.
//!
//! Representations handled:
//!
//! | First byte | Representation                          | Prefix |
//! |------------|------------------------------------------|--------|
//! | `1xxxxxxx` | Indexed header field                     | 7-bit  |
//! | `01xxxxxx` | Literal with incremental indexing        | 6-bit  |
//! | `0000xxxx` | Literal without indexing                 | 4-bit  |
//! | `0001xxxx` | Literal never indexed                    | 4-bit  |
//! | `001xxxxx` | Dynamic table size update                | 5-bit  |
//!
//! Table size updates are allowed only at the very start of a header
//! block, at most twice. Pseudo-headers (`:name`) are permitted only at
//! the start of a block and never in trailers. Violations raise named
//! infraction events and fail the block; the session continues on
//! subsequent frames.

use std::collections::{HashMap, VecDeque};

// ---------------------------------------------------------------------------
// Infraction events
// ---------------------------------------------------------------------------

/// Named decode infractions, published alongside the failed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpackEvent {
    IntLeadingZeros,
    IntOverflow,
    IndexOutOfBounds,
    TruncatedHeaderBlock,
    DecodedHeaderBuffOutOfSpace,
    HuffmanDecodeError,
    DynamicTableOverflow,
    TableSizeUpdateWithinHeader,
    TooManyTableSizeUpdates,
    InvalidTableSizeUpdate,
    PseudoHeaderAfterRegularHeader,
    PseudoHeaderInTrailers,
}

impl HpackEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HpackEvent::IntLeadingZeros => "HPACK integer value has leading zeros",
            HpackEvent::IntOverflow => "HPACK integer value overflows",
            HpackEvent::IndexOutOfBounds => "HPACK table index out of bounds",
            HpackEvent::TruncatedHeaderBlock => "truncated HPACK header block",
            HpackEvent::DecodedHeaderBuffOutOfSpace => "decoded header buffer out of space",
            HpackEvent::HuffmanDecodeError => "bad Huffman-coded string literal",
            HpackEvent::DynamicTableOverflow => "HPACK dynamic table size limit exceeded",
            HpackEvent::TableSizeUpdateWithinHeader => {
                "HPACK table size update within header block"
            }
            HpackEvent::TooManyTableSizeUpdates => "more than two HPACK table size updates",
            HpackEvent::InvalidTableSizeUpdate => "invalid HPACK table size update",
            HpackEvent::PseudoHeaderAfterRegularHeader => "pseudo-header after regular header",
            HpackEvent::PseudoHeaderInTrailers => "pseudo-header in trailers",
        }
    }
}

// ---------------------------------------------------------------------------
// Integer decoding
// ---------------------------------------------------------------------------

/// N-bit prefix integer decoder (RFC 7541 §5.1).
#[derive(Debug, Clone, Copy)]
pub struct HpackIntDecoder {
    prefix_bits: u8,
}

impl HpackIntDecoder {
    pub const fn new(prefix_bits: u8) -> Self {
        Self { prefix_bits }
    }

    /// Decode one integer, returning the value and consuming bytes.
    pub fn translate(
        &self,
        buf: &[u8],
        consumed: &mut usize,
        events: &mut Vec<HpackEvent>,
    ) -> Option<u64> {
        let first = *buf.first().or_else(|| {
            events.push(HpackEvent::TruncatedHeaderBlock);
            None
        })?;

        let mask = (1u16 << self.prefix_bits) - 1;
        let mut value = u64::from(first) & u64::from(mask);
        *consumed = 1;

        if value < u64::from(mask) {
            return Some(value);
        }

        // continuation bytes: 7 bits each, high bit = more
        let mut shift = 0u32;
        loop {
            let Some(&byte) = buf.get(*consumed) else {
                events.push(HpackEvent::TruncatedHeaderBlock);
                return None;
            };
            *consumed += 1;

            // a zero continuation byte encodes nothing and signals a
            // non-minimal encoding
            if byte == 0 && shift > 0 {
                events.push(HpackEvent::IntLeadingZeros);
            }

            if shift > 56 {
                events.push(HpackEvent::IntOverflow);
                return None;
            }
            value = value.checked_add(u64::from(byte & 0x7f) << shift).or_else(|| {
                events.push(HpackEvent::IntOverflow);
                None
            })?;

            if byte & 0x80 == 0 {
                return Some(value);
            }
            shift += 7;
        }
    }
}

// ---------------------------------------------------------------------------
// Huffman decoding
// ---------------------------------------------------------------------------

/// RFC 7541 Appendix B canonical Huffman code for each symbol 0..=255 plus
/// EOS, as (code, bit length).
const HUFFMAN_CODES: [(u32, u8); 257] = [
    (0x1ff8, 13),
    (0x7fffd8, 23),
    (0xfffffe2, 28),
    (0xfffffe3, 28),
    (0xfffffe4, 28),
    (0xfffffe5, 28),
    (0xfffffe6, 28),
    (0xfffffe7, 28),
    (0xfffffe8, 28),
    (0xffffea, 24),
    (0x3ffffffc, 30),
    (0xfffffe9, 28),
    (0xfffffea, 28),
    (0x3ffffffd, 30),
    (0xfffffeb, 28),
    (0xfffffec, 28),
    (0xfffffed, 28),
    (0xfffffee, 28),
    (0xfffffef, 28),
    (0xffffff0, 28),
    (0xffffff1, 28),
    (0xffffff2, 28),
    (0x3ffffffe, 30),
    (0xffffff3, 28),
    (0xffffff4, 28),
    (0xffffff5, 28),
    (0xffffff6, 28),
    (0xffffff7, 28),
    (0xffffff8, 28),
    (0xffffff9, 28),
    (0xffffffa, 28),
    (0xffffffb, 28),
    (0x14, 6),
    (0x3f8, 10),
    (0x3f9, 10),
    (0xffa, 12),
    (0x1ff9, 13),
    (0x15, 6),
    (0xf8, 8),
    (0x7fa, 11),
    (0x3fa, 10),
    (0x3fb, 10),
    (0xf9, 8),
    (0x7fb, 11),
    (0xfa, 8),
    (0x16, 6),
    (0x17, 6),
    (0x18, 6),
    (0x0, 5),
    (0x1, 5),
    (0x2, 5),
    (0x19, 6),
    (0x1a, 6),
    (0x1b, 6),
    (0x1c, 6),
    (0x1d, 6),
    (0x1e, 6),
    (0x1f, 6),
    (0x5c, 7),
    (0xfb, 8),
    (0x7ffc, 15),
    (0x20, 6),
    (0xffb, 12),
    (0x3fc, 10),
    (0x1ffa, 13),
    (0x21, 6),
    (0x5d, 7),
    (0x5e, 7),
    (0x5f, 7),
    (0x60, 7),
    (0x61, 7),
    (0x62, 7),
    (0x63, 7),
    (0x64, 7),
    (0x65, 7),
    (0x66, 7),
    (0x67, 7),
    (0x68, 7),
    (0x69, 7),
    (0x6a, 7),
    (0x6b, 7),
    (0x6c, 7),
    (0x6d, 7),
    (0x6e, 7),
    (0x6f, 7),
    (0x70, 7),
    (0x71, 7),
    (0x72, 7),
    (0xfc, 8),
    (0x73, 7),
    (0xfd, 8),
    (0x1ffb, 13),
    (0x7fff0, 19),
    (0x1ffc, 13),
    (0x3ffc, 14),
    (0x22, 6),
    (0x7ffd, 15),
    (0x3, 5),
    (0x23, 6),
    (0x4, 5),
    (0x24, 6),
    (0x5, 5),
    (0x25, 6),
    (0x26, 6),
    (0x27, 6),
    (0x6, 5),
    (0x74, 7),
    (0x75, 7),
    (0x28, 6),
    (0x29, 6),
    (0x2a, 6),
    (0x7, 5),
    (0x2b, 6),
    (0x76, 7),
    (0x2c, 6),
    (0x8, 5),
    (0x9, 5),
    (0x2d, 6),
    (0x77, 7),
    (0x78, 7),
    (0x79, 7),
    (0x7a, 7),
    (0x7b, 7),
    (0x7ffe, 15),
    (0x7fc, 11),
    (0x3ffd, 14),
    (0x1ffd, 13),
    (0xffffffc, 28),
    (0xfffe6, 20),
    (0x3fffd2, 22),
    (0xfffe7, 20),
    (0xfffe8, 20),
    (0x3fffd3, 22),
    (0x3fffd4, 22),
    (0x3fffd5, 22),
    (0x7fffd9, 23),
    (0x3fffd6, 22),
    (0x7fffda, 23),
    (0x7fffdb, 23),
    (0x7fffdc, 23),
    (0x7fffdd, 23),
    (0x7fffde, 23),
    (0xffffeb, 24),
    (0x7fffdf, 23),
    (0xffffec, 24),
    (0xffffed, 24),
    (0x3fffd7, 22),
    (0x7fffe0, 23),
    (0xffffee, 24),
    (0x7fffe1, 23),
    (0x7fffe2, 23),
    (0x7fffe3, 23),
    (0x7fffe4, 23),
    (0x1fffdc, 21),
    (0x3fffd8, 22),
    (0x7fffe5, 23),
    (0x3fffd9, 22),
    (0x7fffe6, 23),
    (0x7fffe7, 23),
    (0xffffef, 24),
    (0x3fffda, 22),
    (0x1fffdd, 21),
    (0xfffe9, 20),
    (0x3fffdb, 22),
    (0x3fffdc, 22),
    (0x7fffe8, 23),
    (0x7fffe9, 23),
    (0x1fffde, 21),
    (0x7fffea, 23),
    (0x3fffdd, 22),
    (0x3fffde, 22),
    (0xfffff0, 24),
    (0x1fffdf, 21),
    (0x3fffdf, 22),
    (0x7fffeb, 23),
    (0x7fffec, 23),
    (0x1fffe0, 21),
    (0x1fffe1, 21),
    (0x3fffe0, 22),
    (0x1fffe2, 21),
    (0x7fffed, 23),
    (0x3fffe1, 22),
    (0x7fffee, 23),
    (0x7fffef, 23),
    (0xfffea, 20),
    (0x3fffe2, 22),
    (0x3fffe3, 22),
    (0x3fffe4, 22),
    (0x7ffff0, 23),
    (0x3fffe5, 22),
    (0x3fffe6, 22),
    (0x7ffff1, 23),
    (0x3ffffe0, 26),
    (0x3ffffe1, 26),
    (0xfffeb, 20),
    (0x7fff1, 19),
    (0x3fffe7, 22),
    (0x7ffff2, 23),
    (0x3fffe8, 22),
    (0x1ffffec, 25),
    (0x3ffffe2, 26),
    (0x3ffffe3, 26),
    (0x3ffffe4, 26),
    (0x7ffffde, 27),
    (0x7ffffdf, 27),
    (0x3ffffe5, 26),
    (0xfffff1, 24),
    (0x1ffffed, 25),
    (0x7fff2, 19),
    (0x1fffe3, 21),
    (0x3ffffe6, 26),
    (0x7ffffe0, 27),
    (0x7ffffe1, 27),
    (0x3ffffe7, 26),
    (0x7ffffe2, 27),
    (0xfffff2, 24),
    (0x1fffe4, 21),
    (0x1fffe5, 21),
    (0x3ffffe8, 26),
    (0x3ffffe9, 26),
    (0xffffffd, 28),
    (0x7ffffe3, 27),
    (0x7ffffe4, 27),
    (0x7ffffe5, 27),
    (0xfffec, 20),
    (0xfffff3, 24),
    (0xfffed, 20),
    (0x1fffe6, 21),
    (0x3fffe9, 22),
    (0x1fffe7, 21),
    (0x1fffe8, 21),
    (0x7ffff3, 23),
    (0x3fffea, 22),
    (0x3fffeb, 22),
    (0x1ffffee, 25),
    (0x1ffffef, 25),
    (0xfffff4, 24),
    (0xfffff5, 24),
    (0x3ffffea, 26),
    (0x7ffff4, 23),
    (0x3ffffeb, 26),
    (0x7ffffe6, 27),
    (0x3ffffec, 26),
    (0x3ffffed, 26),
    (0x7ffffe7, 27),
    (0x7ffffe8, 27),
    (0x7ffffe9, 27),
    (0x7ffffea, 27),
    (0x7ffffeb, 27),
    (0xffffffe, 28),
    (0x7ffffec, 27),
    (0x7ffffed, 27),
    (0x7ffffee, 27),
    (0x7ffffef, 27),
    (0x7fffff0, 27),
    (0x3ffffee, 26),
    (0x3fffffff, 30),
];

const EOS_SYMBOL: u16 = 256;

/// Huffman decoder over the canonical code table.
#[derive(Debug)]
pub struct HuffmanDecoder {
    codes: HashMap<(u8, u32), u16>,
}

impl HuffmanDecoder {
    pub fn new() -> Self {
        let mut codes = HashMap::with_capacity(HUFFMAN_CODES.len());
        for (symbol, &(code, bits)) in HUFFMAN_CODES.iter().enumerate() {
            codes.insert((bits, code), symbol as u16);
        }
        Self { codes }
    }

    /// Decode a Huffman-coded string. Fails on an embedded EOS code or on
    /// padding that is not a prefix of EOS (all ones, at most 7 bits).
    pub fn decode(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2);
        let mut acc: u32 = 0;
        let mut nbits: u8 = 0;

        for &byte in data {
            for bit in (0..8).rev() {
                acc = (acc << 1) | u32::from((byte >> bit) & 1);
                nbits += 1;
                if let Some(&symbol) = self.codes.get(&(nbits, acc)) {
                    if symbol == EOS_SYMBOL {
                        return None;
                    }
                    out.push(symbol as u8);
                    acc = 0;
                    nbits = 0;
                } else if nbits == 30 {
                    return None;
                }
            }
        }

        // remaining bits must be a prefix of EOS: all ones, under one byte
        if nbits >= 8 || acc != (1u32 << nbits) - 1 {
            return None;
        }
        Some(out)
    }
}

impl Default for HuffmanDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// String decoding
// ---------------------------------------------------------------------------

/// String literal decoder (RFC 7541 §5.2): 7-bit prefix length with a
/// Huffman flag in bit 7 of the length byte.
#[derive(Debug)]
pub struct HpackStringDecoder {
    length_decoder: HpackIntDecoder,
    huffman: HuffmanDecoder,
}

impl HpackStringDecoder {
    pub fn new() -> Self {
        Self { length_decoder: HpackIntDecoder::new(7), huffman: HuffmanDecoder::new() }
    }

    pub fn translate(
        &self,
        buf: &[u8],
        consumed: &mut usize,
        events: &mut Vec<HpackEvent>,
    ) -> Option<Vec<u8>> {
        let huffman_coded = buf.first().is_some_and(|b| b & 0x80 != 0);

        let mut length_consumed = 0;
        let length = self.length_decoder.translate(buf, &mut length_consumed, events)?;
        let length = usize::try_from(length).ok().or_else(|| {
            events.push(HpackEvent::IntOverflow);
            None
        })?;

        let start = length_consumed;
        let end = start.checked_add(length).filter(|&e| e <= buf.len()).or_else(|| {
            events.push(HpackEvent::TruncatedHeaderBlock);
            None
        })?;
        *consumed = end;

        if huffman_coded {
            self.huffman.decode(&buf[start..end]).or_else(|| {
                events.push(HpackEvent::HuffmanDecodeError);
                None
            })
        } else {
            Some(buf[start..end].to_vec())
        }
    }
}

impl Default for HpackStringDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Index tables
// ---------------------------------------------------------------------------

/// RFC 7541 Appendix A static table.
const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Hard cap on dynamic table entries, independent of the octet budget.
pub const MAX_DYNAMIC_ENTRIES: usize = 512;

/// Per-entry size overhead defined by RFC 7541 §4.1.
const ENTRY_OVERHEAD: usize = 32;

/// Initial dynamic table octet budget (RFC 7541 default).
const DEFAULT_TABLE_SIZE: usize = 4096;

/// Largest octet budget a size update may request. The entry cap bounds
/// table growth even at this budget.
const MAX_TABLE_SIZE: usize = 65_536;

/// Static plus dynamic index table for one decoding direction.
#[derive(Debug)]
pub struct HpackIndexTable {
    dynamic: VecDeque<(Vec<u8>, Vec<u8>)>,
    dynamic_size: usize,
    max_size: usize,
}

impl HpackIndexTable {
    pub fn new() -> Self {
        Self { dynamic: VecDeque::new(), dynamic_size: 0, max_size: DEFAULT_TABLE_SIZE }
    }

    /// Look up an index: 1..=61 static, 62.. dynamic (most recent first).
    pub fn lookup(&self, index: u64) -> Option<(Vec<u8>, Vec<u8>)> {
        if index == 0 {
            return None;
        }
        let index = usize::try_from(index).ok()?;
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Some((name.as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        self.dynamic.get(index - STATIC_TABLE.len() - 1).cloned()
    }

    /// Insert an entry at the head of the dynamic table, evicting from the
    /// tail to stay within the octet budget. Fails only on the hard entry
    /// cap.
    pub fn add_index(&mut self, name: &[u8], value: &[u8]) -> bool {
        let entry_size = name.len() + value.len() + ENTRY_OVERHEAD;

        while self.dynamic_size + entry_size > self.max_size {
            let Some((n, v)) = self.dynamic.pop_back() else {
                break;
            };
            self.dynamic_size -= n.len() + v.len() + ENTRY_OVERHEAD;
        }

        // an entry larger than the whole budget empties the table
        if entry_size > self.max_size {
            return true;
        }

        if self.dynamic.len() >= MAX_DYNAMIC_ENTRIES {
            return false;
        }

        self.dynamic.push_front((name.to_vec(), value.to_vec()));
        self.dynamic_size += entry_size;
        true
    }

    /// Apply a dynamic table size update; shrinking evicts from the tail.
    /// Growing beyond the protocol default is invalid.
    pub fn size_update(&mut self, new_size: u64) -> bool {
        let Ok(new_size) = usize::try_from(new_size) else {
            return false;
        };
        if new_size > MAX_TABLE_SIZE {
            return false;
        }
        self.max_size = new_size;
        while self.dynamic_size > self.max_size {
            let Some((n, v)) = self.dynamic.pop_back() else {
                break;
            };
            self.dynamic_size -= n.len() + v.len() + ENTRY_OVERHEAD;
        }
        true
    }

    pub fn dynamic_len(&self) -> usize {
        self.dynamic.len()
    }
}

impl Default for HpackIndexTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Header block decoder
// ---------------------------------------------------------------------------

/// Cap on the decoded output of one header block.
const MAX_DECODED_OCTETS: usize = 63 * 1024;

/// A fully decoded header block.
#[derive(Debug, Default)]
pub struct DecodedHeaders {
    /// `name: value\r\n` lines plus the final `\r\n`.
    pub text: Vec<u8>,
    /// Decoded (name, value) pairs in order, pseudo-headers included.
    pub fields: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Stateful HPACK decoder for one direction of one flow.
#[derive(Debug)]
pub struct HpackDecoder {
    table: HpackIndexTable,
    decode_int7: HpackIntDecoder,
    decode_int6: HpackIntDecoder,
    decode_int5: HpackIntDecoder,
    decode_int4: HpackIntDecoder,
    decode_string: HpackStringDecoder,
    // per-block state
    pseudo_headers_allowed: bool,
    table_size_update_allowed: bool,
    num_table_size_updates: u8,
    is_trailers: bool,
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self {
            table: HpackIndexTable::new(),
            decode_int7: HpackIntDecoder::new(7),
            decode_int6: HpackIntDecoder::new(6),
            decode_int5: HpackIntDecoder::new(5),
            decode_int4: HpackIntDecoder::new(4),
            decode_string: HpackStringDecoder::new(),
            pseudo_headers_allowed: true,
            table_size_update_allowed: true,
            num_table_size_updates: 0,
            is_trailers: false,
        }
    }

    pub fn dynamic_table_len(&self) -> usize {
        self.table.dynamic_len()
    }

    /// Decode a complete header block.
    ///
    /// Returns the decoded headers on success; on an unrecoverable decode
    /// error returns `None` after recording the infraction events. The
    /// dynamic table retains any insertions made before the failure, so
    /// later blocks on the flow stay in sync with a well-behaved peer.
    pub fn decode_headers(
        &mut self,
        encoded: &[u8],
        trailers: bool,
        events: &mut Vec<HpackEvent>,
    ) -> Option<DecodedHeaders> {
        let mut out = DecodedHeaders::default();
        let mut offset = 0;

        self.is_trailers = trailers;
        self.pseudo_headers_allowed = !trailers;
        // at most two size updates, and only at the start of the block
        self.table_size_update_allowed = true;
        self.num_table_size_updates = 0;

        while offset < encoded.len() {
            let consumed = self.decode_header_line(&encoded[offset..], &mut out, events)?;
            debug_assert!(consumed > 0);
            offset += consumed;

            if out.text.len() > MAX_DECODED_OCTETS {
                events.push(HpackEvent::DecodedHeaderBuffOutOfSpace);
                return None;
            }
        }

        out.text.extend_from_slice(b"\r\n");
        Some(out)
    }

    /// Decode one header line, returning the bytes consumed.
    fn decode_header_line(
        &mut self,
        buf: &[u8],
        out: &mut DecodedHeaders,
        events: &mut Vec<HpackEvent>,
    ) -> Option<usize> {
        const DYN_TABLE_SIZE_UPDATE_MASK: u8 = 0xe0;
        const DYN_TABLE_SIZE_UPDATE_PATTERN: u8 = 0x20;
        const INDEX_MASK: u8 = 0x80;
        const LITERAL_INDEX_MASK: u8 = 0x40;
        const LITERAL_INDEX_NAME_MASK: u8 = 0x3f;
        const LITERAL_NO_INDEX_NAME_MASK: u8 = 0x0f;

        let first = buf[0];

        if first & DYN_TABLE_SIZE_UPDATE_MASK == DYN_TABLE_SIZE_UPDATE_PATTERN {
            return self.handle_dynamic_size_update(buf, events);
        }
        self.table_size_update_allowed = false;

        let (consumed, name, value) = if first & INDEX_MASK != 0 {
            self.decode_indexed_header(buf, events)?
        } else if first & LITERAL_INDEX_MASK != 0 {
            self.decode_literal_header_line(
                buf,
                LITERAL_INDEX_NAME_MASK,
                self.decode_int6,
                true,
                events,
            )?
        } else {
            // covers both "without indexing" (0x00) and "never indexed"
            // (0x10); they decode identically
            self.decode_literal_header_line(
                buf,
                LITERAL_NO_INDEX_NAME_MASK,
                self.decode_int4,
                false,
                events,
            )?
        };

        if name.first() == Some(&b':') {
            if !self.pseudo_headers_allowed {
                events.push(if self.is_trailers {
                    HpackEvent::PseudoHeaderInTrailers
                } else {
                    HpackEvent::PseudoHeaderAfterRegularHeader
                });
                return None;
            }
        } else if self.pseudo_headers_allowed {
            self.pseudo_headers_allowed = false;
        }

        out.text.extend_from_slice(&name);
        out.text.extend_from_slice(b": ");
        out.text.extend_from_slice(&value);
        out.text.extend_from_slice(b"\r\n");
        out.fields.push((name, value));
        Some(consumed)
    }

    fn lookup_entry(
        &self,
        buf: &[u8],
        decode_int: HpackIntDecoder,
        consumed: &mut usize,
        events: &mut Vec<HpackEvent>,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let index = decode_int.translate(buf, consumed, events)?;
        self.table.lookup(index).or_else(|| {
            events.push(HpackEvent::IndexOutOfBounds);
            None
        })
    }

    fn decode_indexed_header(
        &mut self,
        buf: &[u8],
        events: &mut Vec<HpackEvent>,
    ) -> Option<(usize, Vec<u8>, Vec<u8>)> {
        let mut consumed = 0;
        let (name, value) = self.lookup_entry(buf, self.decode_int7, &mut consumed, events)?;
        Some((consumed, name, value))
    }

    fn decode_literal_header_line(
        &mut self,
        buf: &[u8],
        name_index_mask: u8,
        decode_int: HpackIntDecoder,
        with_indexing: bool,
        events: &mut Vec<HpackEvent>,
    ) -> Option<(usize, Vec<u8>, Vec<u8>)> {
        let mut consumed = 0;

        let name = if buf[0] & name_index_mask != 0 {
            let (name, _) = self.lookup_entry(buf, decode_int, &mut consumed, events)?;
            name
        } else {
            // skip the byte carrying the pattern and the zeroed index
            consumed = 1;
            let mut string_consumed = 0;
            let name =
                self.decode_string.translate(&buf[consumed..], &mut string_consumed, events)?;
            consumed += string_consumed;
            name
        };

        // the value is always a string literal
        let mut string_consumed = 0;
        let value = self.decode_string.translate(&buf[consumed..], &mut string_consumed, events)?;
        consumed += string_consumed;

        if with_indexing && !self.table.add_index(&name, &value) {
            events.push(HpackEvent::DynamicTableOverflow);
            return None;
        }

        Some((consumed, name, value))
    }

    fn handle_dynamic_size_update(
        &mut self,
        buf: &[u8],
        events: &mut Vec<HpackEvent>,
    ) -> Option<usize> {
        let mut consumed = 0;
        let new_size = self.decode_int5.translate(buf, &mut consumed, events)?;

        // Size update shenanigans are dangerous because we cannot be sure
        // how the target will interpret them.
        if !self.table_size_update_allowed {
            events.push(HpackEvent::TableSizeUpdateWithinHeader);
            return None;
        }
        self.num_table_size_updates += 1;
        if self.num_table_size_updates > 2 {
            events.push(HpackEvent::TooManyTableSizeUpdates);
            return None;
        }

        if !self.table.size_update(new_size) {
            events.push(HpackEvent::InvalidTableSizeUpdate);
            return None;
        }

        Some(consumed)
    }
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
