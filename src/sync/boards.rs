//! Board batch replication.
//!
//! Synced boards converge by union: each side periodically batches its
//! locally-authored posts to every healthy peer, and inserts whatever it
//! receives that it has not seen. Deletes are never propagated.
//!
//! A batch is post records joined by the 0x1F record separator, fields
//! within a record joined by 0x1E (`uuid`, `author`, `origin_bbs`,
//! `timestamp_us`, `subject`, `body`). The joined batch is base64-encoded
//! before chunking so separators and pipes survive the text transport.
//!
//! Batches fire when a board accumulates `batch_threshold` pending posts,
//! or when at least one post has waited `batch_interval`. Acknowledged
//! UUIDs are recorded in the sync log so a replayed or retried batch can
//! never duplicate a post; failures roll nothing back and the next
//! trigger retries.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, info, warn};
use thiserror::Error;

use crate::config::BoardSyncConfig;
use crate::crypto::{self, KeyRing};
use crate::logutil::short_id;
use crate::storage::{
    Message, MessageKind, PeerHealth, Store, SyncDirection, SyncLogEntry, SyncStatus,
    MESSAGE_SCHEMA_VERSION,
};
use crate::sync::chunker::split_raw;
use crate::sync::limiter::RateLimiter;
use crate::sync::{Frame, Outbound};

pub const RECORD_SEP: char = '\u{1f}';
pub const FIELD_SEP: char = '\u{1e}';
pub const NAK_SYNC_DISABLED: &str = "SYNC_DISABLED";
pub const NAK_UNKNOWN: &str = "UNKNOWN";

#[derive(Debug, Error)]
pub enum BoardSyncError {
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

type Result<T> = std::result::Result<T, BoardSyncError>;

/// One decrypted post inside a batch payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardRecord {
    pub uuid: String,
    pub author: String,
    pub origin_bbs: String,
    pub timestamp_us: i64,
    pub subject: String,
    pub body: String,
}

/// Join records into the raw (pre-base64) batch payload.
pub fn encode_batch(records: &[BoardRecord]) -> String {
    records
        .iter()
        .map(|r| {
            [
                r.uuid.as_str(),
                r.author.as_str(),
                r.origin_bbs.as_str(),
                &r.timestamp_us.to_string(),
                r.subject.as_str(),
                r.body.as_str(),
            ]
            .join(&FIELD_SEP.to_string())
        })
        .collect::<Vec<_>>()
        .join(&RECORD_SEP.to_string())
}

/// Parse a raw batch payload. Malformed records are skipped, not fatal:
/// one bad post must not sink the batch.
pub fn decode_batch(payload: &str) -> Vec<BoardRecord> {
    payload
        .split(RECORD_SEP)
        .filter(|r| !r.is_empty())
        .filter_map(|record| {
            let fields: Vec<&str> = record.split(FIELD_SEP).collect();
            if fields.len() < 6 {
                warn!("skipping malformed board record ({} fields)", fields.len());
                return None;
            }
            Some(BoardRecord {
                uuid: fields[0].to_string(),
                author: fields[1].to_string(),
                origin_bbs: fields[2].to_uppercase(),
                timestamp_us: fields[3].parse().ok()?,
                subject: fields[4].to_string(),
                body: fields[5].to_string(),
            })
        })
        .collect()
}

#[derive(Debug)]
struct OutgoingBatch {
    chunks: Vec<String>,
    uuids: Vec<String>,
    /// Newest record timestamp; becomes the peer watermark on DLV.
    high_water_us: i64,
    created_us: i64,
}

#[derive(Debug)]
struct IncomingBatch {
    parts: HashMap<u32, String>,
    total: u32,
    created_us: i64,
}

#[derive(Debug)]
pub struct BoardSyncEngine {
    my_callsign: String,
    enabled: bool,
    config: BoardSyncConfig,
    piece_bytes: usize,
    /// Posts accumulated since the last batch, per board.
    pending_counts: HashMap<String, u32>,
    /// Last time a batch fired, per board.
    last_batch_us: HashMap<String, i64>,
    outgoing: HashMap<(String, String), OutgoingBatch>,
    incoming: HashMap<(String, String), IncomingBatch>,
}

impl BoardSyncEngine {
    pub fn new(my_callsign: String, enabled: bool, config: BoardSyncConfig, piece_bytes: usize) -> Self {
        Self {
            my_callsign: my_callsign.to_uppercase(),
            enabled,
            config,
            piece_bytes,
            pending_counts: HashMap::new(),
            last_batch_us: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    /// Count a fresh local post toward the batch trigger.
    pub fn note_local_post(&mut self, board: &str) {
        *self.pending_counts.entry(board.to_string()).or_insert(0) += 1;
    }

    fn due(&self, board: &str, now_us: i64) -> bool {
        let pending = self.pending_counts.get(board).copied().unwrap_or(0);
        if pending == 0 {
            return false;
        }
        if pending >= self.config.batch_threshold {
            return true;
        }
        let last = self.last_batch_us.get(board).copied().unwrap_or(0);
        now_us - last >= self.config.batch_interval_seconds as i64 * 1_000_000
    }

    /// Periodic trigger check. Builds batches for every due board toward
    /// every healthy peer (subject to the per-peer request throttle) and
    /// returns the BOARDREQ frames to send.
    pub fn maybe_batch(
        &mut self,
        store: &Store,
        keys: &KeyRing,
        limiter: &mut RateLimiter,
        now_us: i64,
    ) -> Result<Vec<Outbound>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for board in store.synced_boards()? {
            if !self.due(&board.name, now_us) {
                continue;
            }
            let board_key = keys.unwrap(&board.wrapped_key)?;
            let mut any_sent = false;
            for peer in store.list_peers()? {
                if !peer.enabled || matches!(peer.health, PeerHealth::Dead) {
                    continue;
                }
                if self.outgoing.contains_key(&(board.name.clone(), peer.node_id.clone())) {
                    continue; // a batch to this peer is already in flight
                }
                let since = store.board_peer_watermark(&board.name, &peer.node_id)?;
                let posts = store.board_posts_for_sync(
                    &board.name,
                    since,
                    &self.my_callsign,
                    self.config.batch_size,
                )?;
                let mut records = Vec::new();
                let mut high_water_us = since;
                for post in posts {
                    if store.sync_acked(&post.uuid, &peer.node_id)? {
                        continue;
                    }
                    let body =
                        crypto::decrypt_message(&board_key, &post.body_enc, &post.uuid, post.created_at_us)?;
                    let subject = match &post.subject_enc {
                        Some(enc) => {
                            crypto::decrypt_message(&board_key, enc, &post.uuid, post.created_at_us)?
                        }
                        None => String::new(),
                    };
                    high_water_us = high_water_us.max(post.created_at_us);
                    records.push(BoardRecord {
                        uuid: post.uuid.clone(),
                        author: post.author.clone().unwrap_or_else(|| "unknown".to_string()),
                        origin_bbs: post.origin_bbs.clone(),
                        timestamp_us: post.created_at_us,
                        subject,
                        body,
                    });
                }
                if records.is_empty() {
                    continue;
                }
                if !limiter.allow_sync_request(&peer.node_id, now_us) {
                    debug!(
                        "board {}: sync to {} throttled, retrying next trigger",
                        board.name, peer.node_id
                    );
                    continue;
                }
                let encoded = BASE64.encode(encode_batch(&records));
                let chunks = split_raw(&encoded, self.piece_bytes);
                let uuids: Vec<String> = records.iter().map(|r| r.uuid.clone()).collect();
                for uuid in &uuids {
                    store.log_sync(SyncLogEntry {
                        message_uuid: uuid.clone(),
                        peer_node: peer.node_id.clone(),
                        direction: SyncDirection::Sent,
                        status: SyncStatus::Pending,
                        attempts: 1,
                        last_attempt_us: now_us,
                    })?;
                }
                info!(
                    "board {}: batching {} post(s) to {}",
                    board.name,
                    uuids.len(),
                    peer.callsign
                );
                out.push(Outbound::control(
                    peer.node_id.clone(),
                    Frame::BoardReq {
                        board: board.name.clone(),
                        count: uuids.len() as u32,
                        since_us: since,
                    }
                    .to_wire(),
                ));
                self.outgoing.insert(
                    (board.name.clone(), peer.node_id.clone()),
                    OutgoingBatch {
                        chunks,
                        uuids,
                        high_water_us,
                        created_us: now_us,
                    },
                );
                any_sent = true;
            }
            if any_sent {
                self.last_batch_us.insert(board.name.clone(), now_us);
            }
        }
        Ok(out)
    }

    // -- outgoing side responses --------------------------------------------

    /// Peer accepted our BOARDREQ: stream the data chunks.
    pub fn handle_ack(&mut self, board: &str, peer_node: &str) -> Vec<Outbound> {
        let Some(batch) = self.outgoing.get(&(board.to_string(), peer_node.to_string())) else {
            warn!("BOARDACK for unknown batch {}:{}", board, peer_node);
            return Vec::new();
        };
        let total = batch.chunks.len() as u32;
        batch
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                Outbound::board_chunk(
                    peer_node,
                    Frame::BoardDat {
                        board: board.to_string(),
                        part: i as u32 + 1,
                        total,
                        payload: chunk.clone(),
                    }
                    .to_wire(),
                )
            })
            .collect()
    }

    /// Peer refused: abandon the batch. Sync-log entries stay pending so
    /// the next trigger retries the same posts.
    pub fn handle_nak(&mut self, board: &str, peer_node: &str, reason: &str) {
        if self
            .outgoing
            .remove(&(board.to_string(), peer_node.to_string()))
            .is_some()
        {
            warn!("board {}: peer {} refused sync: {}", board, peer_node, reason);
        }
    }

    /// Peer stored the whole batch: mark UUIDs acked, advance watermark,
    /// reset the pending counter.
    pub fn handle_dlv(&mut self, store: &Store, board: &str, peer_node: &str, now_us: i64) -> Result<()> {
        let Some(batch) = self
            .outgoing
            .remove(&(board.to_string(), peer_node.to_string()))
        else {
            return Ok(());
        };
        for uuid in &batch.uuids {
            store.log_sync(SyncLogEntry {
                message_uuid: uuid.clone(),
                peer_node: peer_node.to_string(),
                direction: SyncDirection::Sent,
                status: SyncStatus::Acked,
                attempts: 1,
                last_attempt_us: now_us,
            })?;
        }
        store.set_board_peer_watermark(board, peer_node, batch.high_water_us)?;
        if let Some(mut peer) = store.get_peer(peer_node)? {
            peer.last_sync_us = Some(now_us);
            store.put_peer(peer)?;
        }
        self.pending_counts.insert(board.to_string(), 0);
        info!(
            "board {}: {} post(s) acknowledged by {}",
            board,
            batch.uuids.len(),
            peer_node
        );
        Ok(())
    }

    // -- incoming side ------------------------------------------------------

    /// Peer wants to push a batch at us.
    pub fn handle_req(
        &mut self,
        store: &Store,
        board: &str,
        count: u32,
        peer_node: &str,
        now_us: i64,
    ) -> Result<Vec<Outbound>> {
        let known = store.get_board(board)?;
        let response = match known {
            None => {
                // Boards are operator-created; peers cannot mint them.
                warn!("BOARDREQ for unknown board '{}' from {}", board, peer_node);
                Frame::BoardNak {
                    board: board.to_string(),
                    reason: NAK_UNKNOWN.to_string(),
                }
            }
            Some(b) if !self.enabled || !b.synced => Frame::BoardNak {
                board: board.to_string(),
                reason: NAK_SYNC_DISABLED.to_string(),
            },
            Some(_) => {
                debug!(
                    "board {}: accepting {} post(s) from {}",
                    board, count, peer_node
                );
                self.incoming.insert(
                    (board.to_string(), peer_node.to_string()),
                    IncomingBatch {
                        parts: HashMap::new(),
                        total: 0,
                        created_us: now_us,
                    },
                );
                Frame::BoardAck {
                    board: board.to_string(),
                }
            }
        };
        Ok(vec![Outbound::control(peer_node, response.to_wire())])
    }

    /// Buffer a data chunk; on completion decode, dedup, re-encrypt, and
    /// confirm with BOARDDLV.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_dat(
        &mut self,
        store: &Store,
        keys: &KeyRing,
        board: &str,
        part: u32,
        total: u32,
        payload: &str,
        peer_node: &str,
        now_us: i64,
    ) -> Result<Vec<Outbound>> {
        let key = (board.to_string(), peer_node.to_string());
        let Some(batch) = self.incoming.get_mut(&key) else {
            warn!("BOARDDAT without BOARDREQ for {} from {}", board, peer_node);
            return Ok(Vec::new());
        };
        batch.total = total;
        batch.parts.insert(part, payload.to_string());
        if (batch.parts.len() as u32) < total {
            return Ok(Vec::new());
        }
        let batch = self.incoming.remove(&key).expect("batch present");
        let mut encoded = String::new();
        for i in 1..=batch.total {
            match batch.parts.get(&i) {
                Some(part) => encoded.push_str(part),
                None => return Ok(Vec::new()),
            }
        }
        let raw = match BASE64.decode(encoded.as_bytes()) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Err(e) => {
                warn!("board {}: undecodable batch from {}: {}", board, peer_node, e);
                return Ok(Vec::new());
            }
        };
        self.store_batch(store, keys, board, &raw, peer_node, now_us)?;
        Ok(vec![Outbound::control(
            peer_node,
            Frame::BoardDlv {
                board: board.to_string(),
            }
            .to_wire(),
        )])
    }

    fn store_batch(
        &self,
        store: &Store,
        keys: &KeyRing,
        board_name: &str,
        raw: &str,
        peer_node: &str,
        now_us: i64,
    ) -> Result<()> {
        let Some(board) = store.get_board(board_name)? else {
            return Ok(());
        };
        let board_key = keys.unwrap(&board.wrapped_key)?;
        let mut stored = 0usize;
        let mut duplicates = 0usize;
        for record in decode_batch(raw) {
            if store.message_exists(&record.uuid)? {
                duplicates += 1;
                store.log_sync(SyncLogEntry {
                    message_uuid: record.uuid.clone(),
                    peer_node: peer_node.to_string(),
                    direction: SyncDirection::Received,
                    status: SyncStatus::Acked,
                    attempts: 1,
                    last_attempt_us: now_us,
                })?;
                continue;
            }
            // Tag foreign authors with their home BBS once.
            let author = if record.author.contains('@') {
                record.author.clone()
            } else {
                format!("{}@{}", record.author, record.origin_bbs)
            };
            let body_enc =
                crypto::encrypt_message(&board_key, &record.body, &record.uuid, record.timestamp_us)?;
            let subject_enc = if record.subject.is_empty() {
                None
            } else {
                Some(crypto::encrypt_message(
                    &board_key,
                    &record.subject,
                    &record.uuid,
                    record.timestamp_us,
                )?)
            };
            store.insert_message(Message {
                schema_version: MESSAGE_SCHEMA_VERSION,
                uuid: record.uuid.clone(),
                kind: MessageKind::Bulletin,
                sender: None,
                recipient: None,
                board: Some(board_name.to_string()),
                author: Some(author),
                origin_bbs: record.origin_bbs.clone(),
                subject_enc,
                body_enc,
                created_at_us: record.timestamp_us,
                delivered_at_us: None,
                read_at_us: None,
                expires_at_us: None,
                delivery_attempts: 0,
                last_attempt_us: None,
                forwarded_to: None,
                hop_count: 0,
            })?;
            store.log_sync(SyncLogEntry {
                message_uuid: record.uuid,
                peer_node: peer_node.to_string(),
                direction: SyncDirection::Received,
                status: SyncStatus::Acked,
                attempts: 1,
                last_attempt_us: now_us,
            })?;
            stored += 1;
        }
        info!(
            "board {}: stored {} post(s) from {} ({} duplicate(s) skipped)",
            board_name,
            stored,
            short_id(peer_node),
            duplicates
        );
        Ok(())
    }

    /// Drop transfer state past the hard expiry.
    pub fn expire_sweep(&mut self, now_us: i64, expiry_us: i64) {
        self.outgoing.retain(|_, b| now_us - b.created_us <= expiry_us);
        self.incoming.retain(|_, b| now_us - b.created_us <= expiry_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::crypto::{generate_key, KeyRing};
    use crate::storage::{Board, BoardKind, Peer, StoreBuilder, BOARD_SCHEMA_VERSION, PEER_SCHEMA_VERSION};
    use tempfile::TempDir;

    const S: i64 = 1_000_000;

    fn store(dir: &TempDir) -> Store {
        StoreBuilder::new(dir.path().join("db")).open().unwrap()
    }

    fn setup(store: &Store, keys: &KeyRing) -> [u8; 32] {
        let board_key = generate_key();
        store
            .create_board(Board {
                schema_version: BOARD_SCHEMA_VERSION,
                name: "general".to_string(),
                description: "General discussion".to_string(),
                created_at_us: 0,
                synced: true,
                kind: BoardKind::Public,
                wrapped_key: keys.wrap(&board_key).unwrap(),
            })
            .unwrap();
        store
            .put_peer(Peer {
                schema_version: PEER_SCHEMA_VERSION,
                node_id: "!b1".to_string(),
                callsign: "B1".to_string(),
                enabled: true,
                last_seen_us: None,
                last_sync_us: None,
                health: PeerHealth::Alive,
                consecutive_misses: 0,
                total_misses: 0,
                quality: 1.0,
            })
            .unwrap();
        board_key
    }

    fn post(store: &Store, board_key: &[u8; 32], uuid: &str, author: &str, at: i64, body: &str) {
        store
            .insert_message(Message {
                schema_version: MESSAGE_SCHEMA_VERSION,
                uuid: uuid.to_string(),
                kind: MessageKind::Bulletin,
                sender: None,
                recipient: None,
                board: Some("general".to_string()),
                author: Some(author.to_string()),
                origin_bbs: "B0".to_string(),
                subject_enc: None,
                body_enc: crypto::encrypt_message(board_key, body, uuid, at).unwrap(),
                created_at_us: at,
                delivered_at_us: None,
                read_at_us: None,
                expires_at_us: None,
                delivery_attempts: 0,
                last_attempt_us: None,
                forwarded_to: None,
                hop_count: 0,
            })
            .unwrap();
    }

    #[test]
    fn batch_codec_round_trips_with_separators_in_no_field() {
        let records = vec![
            BoardRecord {
                uuid: "u-1".to_string(),
                author: "alice".to_string(),
                origin_bbs: "B0".to_string(),
                timestamp_us: 123,
                subject: "hello".to_string(),
                body: "first post".to_string(),
            },
            BoardRecord {
                uuid: "u-2".to_string(),
                author: "bob@B2".to_string(),
                origin_bbs: "B2".to_string(),
                timestamp_us: 456,
                subject: String::new(),
                body: "second".to_string(),
            },
        ];
        let decoded = decode_batch(&encode_batch(&records));
        assert_eq!(decoded, records);
    }

    #[test]
    fn decode_skips_malformed_records() {
        let raw = format!(
            "junk{}u-1{}alice{}B0{}99{}s{}b",
            RECORD_SEP, FIELD_SEP, FIELD_SEP, FIELD_SEP, FIELD_SEP, FIELD_SEP
        );
        let decoded = decode_batch(&raw);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].uuid, "u-1");
    }

    #[test]
    fn threshold_triggers_batch() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let keys = KeyRing::from_key(generate_key());
        let board_key = setup(&store, &keys);
        let mut engine =
            BoardSyncEngine::new("B0".to_string(), true, BoardSyncConfig::default(), 140);
        let mut limiter = RateLimiter::new(&RateLimitConfig::default());

        for i in 0..10 {
            let uuid = format!("u-{}", i);
            post(&store, &board_key, &uuid, "alice", (i + 1) * S, "text");
            engine.note_local_post("general");
        }
        let out = engine.maybe_batch(&store, &keys, &mut limiter, 100 * S).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].frame.starts_with("BOARDREQ|general|10|0"));

        // Data flows after the ACK.
        let chunks = engine.handle_ack("general", "!b1");
        assert!(!chunks.is_empty());
        assert!(chunks[0].frame.starts_with("BOARDDAT|general|1/"));

        // DLV marks everything acked and resets the counter.
        engine.handle_dlv(&store, "general", "!b1", 200 * S).unwrap();
        assert!(store.sync_acked("u-0", "!b1").unwrap());
        assert_eq!(store.board_peer_watermark("general", "!b1").unwrap(), 10 * S);

        // Nothing new: no more batches even after the interval.
        let out = engine
            .maybe_batch(&store, &keys, &mut limiter, 100_000 * S)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn age_trigger_fires_with_single_pending_post() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let keys = KeyRing::from_key(generate_key());
        let board_key = setup(&store, &keys);
        let mut engine =
            BoardSyncEngine::new("B0".to_string(), true, BoardSyncConfig::default(), 140);
        let mut limiter = RateLimiter::new(&RateLimitConfig::default());

        post(&store, &board_key, "u-solo", "alice", S, "text");
        engine.note_local_post("general");

        // Under both thresholds: nothing.
        assert!(engine
            .maybe_batch(&store, &keys, &mut limiter, 10 * S)
            .unwrap()
            .is_empty());
        // Past the hour: fires.
        assert_eq!(
            engine
                .maybe_batch(&store, &keys, &mut limiter, 3601 * S)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn disabled_engine_never_batches_and_naks_requests() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let keys = KeyRing::from_key(generate_key());
        let board_key = setup(&store, &keys);
        let mut engine =
            BoardSyncEngine::new("B0".to_string(), false, BoardSyncConfig::default(), 140);
        let mut limiter = RateLimiter::new(&RateLimitConfig::default());

        post(&store, &board_key, "u-1", "alice", S, "text");
        engine.note_local_post("general");
        assert!(engine
            .maybe_batch(&store, &keys, &mut limiter, 4000 * S)
            .unwrap()
            .is_empty());

        let out = engine.handle_req(&store, "general", 1, "!b1", 0).unwrap();
        assert_eq!(out[0].frame, "BOARDNAK|general|SYNC_DISABLED");
    }

    #[test]
    fn incoming_unknown_board_naks() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut engine =
            BoardSyncEngine::new("B0".to_string(), true, BoardSyncConfig::default(), 140);
        let out = engine.handle_req(&store, "mystery", 3, "!b1", 0).unwrap();
        assert_eq!(out[0].frame, "BOARDNAK|mystery|UNKNOWN");
    }

    #[test]
    fn incoming_batch_dedups_and_tags_authors() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let keys = KeyRing::from_key(generate_key());
        let board_key = setup(&store, &keys);
        let mut engine =
            BoardSyncEngine::new("B0".to_string(), true, BoardSyncConfig::default(), 4096);

        // u-known is already present locally.
        post(&store, &board_key, "u-known", "alice", S, "existing");
        let records = vec![
            BoardRecord {
                uuid: "u-known".to_string(),
                author: "alice".to_string(),
                origin_bbs: "B1".to_string(),
                timestamp_us: S,
                subject: String::new(),
                body: "replayed".to_string(),
            },
            BoardRecord {
                uuid: "u-new".to_string(),
                author: "carol".to_string(),
                origin_bbs: "B1".to_string(),
                timestamp_us: 2 * S,
                subject: "hi".to_string(),
                body: "fresh".to_string(),
            },
        ];
        let payload = BASE64.encode(encode_batch(&records));

        engine.handle_req(&store, "general", 2, "!b1", 0).unwrap();
        let out = engine
            .handle_dat(&store, &keys, "general", 1, 1, &payload, "!b1", 10 * S)
            .unwrap();
        assert_eq!(out[0].frame, "BOARDDLV|general");

        assert_eq!(store.count_board_posts("general").unwrap(), 2);
        let stored = store.get_message("u-new").unwrap().unwrap();
        assert_eq!(stored.author.as_deref(), Some("carol@B1"));
        assert_eq!(stored.origin_bbs, "B1");
        let body =
            crypto::decrypt_message(&board_key, &stored.body_enc, "u-new", stored.created_at_us)
                .unwrap();
        assert_eq!(body, "fresh");

        // Replaying the same batch changes nothing.
        engine.handle_req(&store, "general", 2, "!b1", 20 * S).unwrap();
        engine
            .handle_dat(&store, &keys, "general", 1, 1, &payload, "!b1", 20 * S)
            .unwrap();
        assert_eq!(store.count_board_posts("general").unwrap(), 2);
    }

    #[test]
    fn nak_leaves_sync_log_pending_for_retry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let keys = KeyRing::from_key(generate_key());
        let board_key = setup(&store, &keys);
        let mut engine =
            BoardSyncEngine::new("B0".to_string(), true, BoardSyncConfig::default(), 140);
        let mut limiter = RateLimiter::new(&RateLimitConfig::default());

        post(&store, &board_key, "u-1", "alice", S, "text");
        engine.note_local_post("general");
        engine
            .maybe_batch(&store, &keys, &mut limiter, 4000 * S)
            .unwrap();
        engine.handle_nak("general", "!b1", NAK_SYNC_DISABLED);

        assert!(!store.sync_acked("u-1", "!b1").unwrap());
        let entry = store
            .get_sync("u-1", "!b1", SyncDirection::Sent)
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, SyncStatus::Pending);
    }
}
