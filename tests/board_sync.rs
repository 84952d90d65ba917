//! Cross-station board replication: batches converge by union, replays
//! and already-known UUIDs never duplicate rows, and the sender's sync
//! log ends up acknowledged.

use advbbs::config::{BoardSyncConfig, CryptoConfig, RateLimitConfig};
use advbbs::crypto::{self, Crypto, KeyRing};
use advbbs::storage::{
    Board, BoardKind, Message, MessageKind, Peer, PeerHealth, Store, StoreBuilder,
    BOARD_SCHEMA_VERSION, MESSAGE_SCHEMA_VERSION, PEER_SCHEMA_VERSION,
};
use advbbs::sync::boards::BoardSyncEngine;
use advbbs::sync::limiter::RateLimiter;
use advbbs::sync::{Frame, Outbound};
use tempfile::TempDir;

const S: i64 = 1_000_000;

struct Station {
    callsign: String,
    store: Store,
    keys: KeyRing,
    board_key: [u8; 32],
    engine: BoardSyncEngine,
    limiter: RateLimiter,
}

impl Station {
    fn new(dir: &TempDir, callsign: &str, peer_node: &str, peer_callsign: &str) -> Self {
        let store = StoreBuilder::new(dir.path().join(callsign)).open().unwrap();
        let crypto = Crypto::new(&CryptoConfig {
            argon2_memory_kib: 8,
            argon2_time_cost: 1,
            argon2_parallelism: 1,
            recovery_enabled: true,
        })
        .unwrap();
        let keys = KeyRing::derive(&crypto, "operator", &store.master_salt().unwrap()).unwrap();
        let board_key = crypto::generate_key();
        store
            .create_board(Board {
                schema_version: BOARD_SCHEMA_VERSION,
                name: "general".to_string(),
                description: "shared".to_string(),
                created_at_us: 0,
                synced: true,
                kind: BoardKind::Public,
                wrapped_key: keys.wrap(&board_key).unwrap(),
            })
            .unwrap();
        store
            .put_peer(Peer {
                schema_version: PEER_SCHEMA_VERSION,
                node_id: peer_node.to_string(),
                callsign: peer_callsign.to_string(),
                enabled: true,
                last_seen_us: None,
                last_sync_us: None,
                health: PeerHealth::Alive,
                consecutive_misses: 0,
                total_misses: 0,
                quality: 1.0,
            })
            .unwrap();
        Station {
            callsign: callsign.to_string(),
            engine: BoardSyncEngine::new(
                callsign.to_string(),
                true,
                BoardSyncConfig::default(),
                140,
            ),
            limiter: RateLimiter::new(&RateLimitConfig::default()),
            store,
            keys,
            board_key,
        }
    }

    fn post(&mut self, uuid: &str, author: &str, origin: &str, at_us: i64, body: &str) {
        self.store
            .insert_message(Message {
                schema_version: MESSAGE_SCHEMA_VERSION,
                uuid: uuid.to_string(),
                kind: MessageKind::Bulletin,
                sender: None,
                recipient: None,
                board: Some("general".to_string()),
                author: Some(author.to_string()),
                origin_bbs: origin.to_string(),
                subject_enc: None,
                body_enc: crypto::encrypt_message(&self.board_key, body, uuid, at_us).unwrap(),
                created_at_us: at_us,
                delivered_at_us: None,
                read_at_us: None,
                expires_at_us: None,
                delivery_attempts: 0,
                last_attempt_us: None,
                forwarded_to: None,
                hop_count: 0,
            })
            .unwrap();
        if origin == self.callsign {
            self.engine.note_local_post("general");
        }
    }
}

/// Run one complete batch exchange from `a` to `b`. Returns the frames
/// that crossed the link.
fn exchange(a: &mut Station, b: &mut Station, a_node: &str, b_node: &str, now: i64) -> Vec<String> {
    let mut wire = Vec::new();
    let reqs = a
        .engine
        .maybe_batch(&a.store, &a.keys, &mut a.limiter, now)
        .unwrap();
    for req in &reqs {
        assert_eq!(req.to, b_node);
        wire.push(req.frame.clone());
    }
    if reqs.is_empty() {
        return wire;
    }

    let mut pending: Vec<Outbound> = Vec::new();
    for req in reqs {
        match Frame::parse(&req.frame).unwrap().unwrap() {
            Frame::BoardReq { board, count, .. } => {
                pending.extend(b.engine.handle_req(&b.store, &board, count, a_node, now).unwrap());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    while let Some(frame) = pending.pop().map(|o| o.frame) {
        wire.push(frame.clone());
        match Frame::parse(&frame).unwrap().unwrap() {
            Frame::BoardAck { board } => {
                pending.extend(a.engine.handle_ack(&board, b_node));
            }
            Frame::BoardNak { board, reason } => {
                a.engine.handle_nak(&board, b_node, &reason);
            }
            Frame::BoardDat {
                board,
                part,
                total,
                payload,
            } => {
                pending.extend(
                    b.engine
                        .handle_dat(&b.store, &b.keys, &board, part, total, &payload, a_node, now)
                        .unwrap(),
                );
            }
            Frame::BoardDlv { board } => {
                a.engine.handle_dlv(&a.store, &board, b_node, now).unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    wire
}

#[test]
fn batch_converges_and_replay_does_not_duplicate() {
    let dir = TempDir::new().unwrap();
    let mut a = Station::new(&dir, "B0", "!b1", "B1");
    let mut b = Station::new(&dir, "B1", "!b0", "B0");

    // B already knows u-shared via some earlier path.
    a.post("u-shared", "alice", "B0", S, "seen everywhere");
    b.post("u-shared", "alice@B0", "B0", S, "seen everywhere");
    a.post("u-fresh", "alice", "B0", 2 * S, "only on A so far");

    let before = b.store.count_board_posts("general").unwrap();
    assert_eq!(before, 1);

    let wire = exchange(&mut a, &mut b, "!b0", "!b1", 3700 * S);
    assert!(wire.iter().any(|w| w.starts_with("BOARDREQ|general|2|")));
    assert!(wire.iter().any(|w| w == "BOARDACK|general"));
    assert!(wire.iter().any(|w| w == "BOARDDLV|general"));

    // Union: exactly one new row, the duplicate skipped silently.
    assert_eq!(b.store.count_board_posts("general").unwrap(), 2);
    let fresh = b.store.get_message("u-fresh").unwrap().unwrap();
    assert_eq!(fresh.author.as_deref(), Some("alice@B0"));
    let body = crypto::decrypt_message(
        &b.board_key,
        &fresh.body_enc,
        "u-fresh",
        fresh.created_at_us,
    )
    .unwrap();
    assert_eq!(body, "only on A so far");

    // Sender marked both UUIDs acked.
    assert!(a.store.sync_acked("u-shared", "!b1").unwrap());
    assert!(a.store.sync_acked("u-fresh", "!b1").unwrap());

    // Nothing pending: a later trigger produces no traffic.
    let wire = exchange(&mut a, &mut b, "!b0", "!b1", 9999 * S);
    assert!(wire.is_empty());
}

#[test]
fn acked_posts_are_excluded_from_later_batches() {
    let dir = TempDir::new().unwrap();
    let mut a = Station::new(&dir, "B0", "!b1", "B1");
    let mut b = Station::new(&dir, "B1", "!b0", "B0");

    a.post("u-1", "alice", "B0", S, "one");
    exchange(&mut a, &mut b, "!b0", "!b1", 3700 * S);
    assert_eq!(b.store.count_board_posts("general").unwrap(), 1);

    // A new post later: the next batch carries only it.
    a.post("u-2", "alice", "B0", 4000 * S, "two");
    let wire = exchange(&mut a, &mut b, "!b0", "!b1", 8000 * S);
    assert!(wire.iter().any(|w| w.starts_with("BOARDREQ|general|1|")));
    assert_eq!(b.store.count_board_posts("general").unwrap(), 2);
}
