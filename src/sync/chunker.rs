//! Payload chunking and reassembly for the radio MTU.
//!
//! Outbound payloads that do not fit in one frame are split into
//! `[<seq>/<total>] `-prefixed fragments (1-indexed). Inbound fragments are
//! buffered per `(sender, total)` until complete. Buffers expire on a
//! hybrid timeout: a sliding per-chunk window and a hard total window,
//! whichever fires first. The chunker never requests retransmission;
//! that is the sending protocol's job.

use std::collections::HashMap;

use crate::validation::truncate_utf8;

/// Bytes reserved for the `[nn/nn] ` header within a frame.
pub const HEADER_RESERVE: usize = 8;
/// Default usable content bytes per fragment (150-byte chunk frames).
pub const DEFAULT_CONTENT_SIZE: usize = 142;
/// Sliding window: a buffer dies this long after its last fragment.
pub const DEFAULT_CHUNK_TIMEOUT_US: i64 = 120 * 1_000_000;
/// Hard window: a buffer dies this long after its first fragment.
pub const DEFAULT_TOTAL_TIMEOUT_US: i64 = 600 * 1_000_000;

/// Splits payloads into sequenced fragments.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    content_size: usize,
}

impl Chunker {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            content_size: frame_bytes.saturating_sub(HEADER_RESERVE).max(16),
        }
    }

    pub fn content_size(&self) -> usize {
        self.content_size
    }

    /// Split `payload` into at most `u32::MAX` fragments. A payload that
    /// fits in one frame is returned unchanged, without a header. Callers
    /// enforce their own max-chunk budgets on the returned length.
    pub fn chunk(&self, payload: &str) -> Vec<String> {
        if payload.len() <= self.content_size {
            return vec![payload.to_string()];
        }
        let mut pieces = Vec::new();
        let mut rest = payload;
        while !rest.is_empty() {
            let piece = truncate_utf8(rest, self.content_size);
            pieces.push(piece.to_string());
            rest = &rest[piece.len()..];
        }
        let total = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, piece)| format!("[{}/{}] {}", i + 1, total, piece))
            .collect()
    }
}

/// Split a payload into raw UTF-8-safe pieces of at most `piece_bytes`,
/// without headers. Used by MAILDAT/BOARDDAT, whose frames carry their own
/// part/total fields.
pub fn split_raw(payload: &str, piece_bytes: usize) -> Vec<String> {
    let piece_bytes = piece_bytes.max(16);
    let mut pieces = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let piece = truncate_utf8(rest, piece_bytes);
        pieces.push(piece.to_string());
        rest = &rest[piece.len()..];
    }
    if pieces.is_empty() {
        pieces.push(String::new());
    }
    pieces
}

/// Parse a `[seq/total] ` header. Returns `(seq, total, body)` or `None`
/// when the payload is not a fragment.
pub fn parse_header(payload: &str) -> Option<(u32, u32, &str)> {
    let rest = payload.strip_prefix('[')?;
    let close = rest.find(']')?;
    let (seq, total) = rest[..close].split_once('/')?;
    let seq: u32 = seq.parse().ok()?;
    let total: u32 = total.parse().ok()?;
    if seq == 0 || total < 2 || seq > total {
        return None;
    }
    let body = rest[close + 1..].strip_prefix(' ')?;
    Some((seq, total, body))
}

#[derive(Debug)]
struct Buffer {
    parts: HashMap<u32, String>,
    total: u32,
    /// Anchor for the hard total timeout.
    created_us: i64,
    /// Sliding anchor, refreshed by every fragment.
    last_chunk_us: i64,
}

impl Buffer {
    fn expired(&self, now_us: i64, chunk_timeout_us: i64, total_timeout_us: i64) -> bool {
        now_us - self.last_chunk_us > chunk_timeout_us || now_us - self.created_us > total_timeout_us
    }
}

/// Reassembles fragments per `(sender, total)`.
#[derive(Debug)]
pub struct Reassembler {
    buffers: HashMap<(String, u32), Buffer>,
    chunk_timeout_us: i64,
    total_timeout_us: i64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_TIMEOUT_US, DEFAULT_TOTAL_TIMEOUT_US)
    }
}

impl Reassembler {
    pub fn new(chunk_timeout_us: i64, total_timeout_us: i64) -> Self {
        Self {
            buffers: HashMap::new(),
            chunk_timeout_us,
            total_timeout_us,
        }
    }

    /// Feed one inbound payload. Headerless payloads complete immediately.
    /// Returns the full payload once every fragment has arrived.
    pub fn accept(&mut self, sender: &str, payload: &str, now_us: i64) -> Option<String> {
        let Some((seq, total, body)) = parse_header(payload) else {
            return Some(payload.to_string());
        };
        let key = (sender.to_string(), total);

        // A stale buffer under this key is dropped rather than resumed, so
        // a late fragment starts a fresh (and incomplete) assembly.
        if self
            .buffers
            .get(&key)
            .is_some_and(|b| b.expired(now_us, self.chunk_timeout_us, self.total_timeout_us))
        {
            self.buffers.remove(&key);
        }

        let buffer = self.buffers.entry(key.clone()).or_insert_with(|| Buffer {
            parts: HashMap::new(),
            total,
            created_us: now_us,
            last_chunk_us: now_us,
        });
        buffer.last_chunk_us = now_us;
        buffer.parts.insert(seq, body.to_string());

        if buffer.parts.len() as u32 == buffer.total {
            let buffer = self.buffers.remove(&key)?;
            let mut assembled = String::new();
            for i in 1..=buffer.total {
                assembled.push_str(buffer.parts.get(&i)?);
            }
            return Some(assembled);
        }
        None
    }

    /// Drop every expired buffer. Returns how many were discarded.
    pub fn expire(&mut self, now_us: i64) -> usize {
        let before = self.buffers.len();
        let chunk_timeout = self.chunk_timeout_us;
        let total_timeout = self.total_timeout_us;
        self.buffers
            .retain(|_, b| !b.expired(now_us, chunk_timeout, total_timeout));
        before - self.buffers.len()
    }

    pub fn pending_buffers(&self) -> usize {
        self.buffers.len()
    }
}
