//! Multi-hop mail delivery across a five-station chain: the MAILREQ walks
//! B0→B1→B2→B3→B4 growing its route set, the MAILACK walks back, data
//! chunks flow forward, and the MAILDLV confirmation returns to the
//! origin. Plus loop rejection at a relay.

use advbbs::config::{CryptoConfig, RapConfig, SyncConfig};
use advbbs::crypto::{self, Crypto, KeyRing};
use advbbs::storage::{
    Peer, PeerHealth, Store, StoreBuilder, User, PEER_SCHEMA_VERSION, SALT_LEN,
    USER_SCHEMA_VERSION,
};
use advbbs::sync::mail::{MailEngine, MailEvent};
use advbbs::sync::rap::RapEngine;
use advbbs::sync::{Frame, MailReq, NakReason};
use tempfile::TempDir;

fn fast_crypto() -> Crypto {
    Crypto::new(&CryptoConfig {
        argon2_memory_kib: 8,
        argon2_time_cost: 1,
        argon2_parallelism: 1,
        recovery_enabled: true,
    })
    .unwrap()
}

struct Node {
    node_id: String,
    store: Store,
    keys: KeyRing,
    rap: RapEngine,
    mail: MailEngine,
}

impl Node {
    fn new(dir: &TempDir, index: usize) -> Self {
        let callsign = format!("B{}", index);
        let store = StoreBuilder::new(dir.path().join(format!("db{}", index)))
            .open()
            .unwrap();
        let crypto = fast_crypto();
        let keys = KeyRing::derive(
            &crypto,
            &format!("operator-{}", index),
            &store.master_salt().unwrap(),
        )
        .unwrap();
        Node {
            node_id: format!("!b{}", index),
            keys,
            rap: RapEngine::new(callsign.clone(), RapConfig::default(), 5),
            mail: MailEngine::new(callsign, SyncConfig::default(), 150),
            store,
        }
    }

    fn add_user(&self, name: &str) -> [u8; 32] {
        let user_key = crypto::generate_key();
        self.store
            .create_user(User {
                schema_version: USER_SCHEMA_VERSION,
                username: name.to_string(),
                password_hash: "$argon2id$stub".to_string(),
                password_salt: [0u8; SALT_LEN],
                wrapped_key: self.keys.wrap(&user_key).unwrap(),
                wrapped_key_pw: vec![],
                created_at_us: 0,
                last_seen_us: 0,
                is_admin: false,
                must_change_password: false,
                ban: None,
            })
            .unwrap();
        user_key
    }
}

fn build_chain(dir: &TempDir) -> Vec<Node> {
    let mut nodes: Vec<Node> = (0..5).map(|i| Node::new(dir, i)).collect();
    for (i, node) in nodes.iter().enumerate() {
        for j in [i.wrapping_sub(1), i + 1] {
            if j < 5 && j != i {
                node.store
                    .put_peer(Peer {
                        schema_version: PEER_SCHEMA_VERSION,
                        node_id: format!("!b{}", j),
                        callsign: format!("B{}", j),
                        enabled: true,
                        last_seen_us: None,
                        last_sync_us: None,
                        health: PeerHealth::Alive,
                        consecutive_misses: 0,
                        total_misses: 0,
                        quality: 1.0,
                    })
                    .unwrap();
            }
        }
    }
    // Route-share rounds until the tables converge.
    for round in 0..4i64 {
        let tables: Vec<String> = nodes
            .iter()
            .map(|n| n.rap.export_routes(&n.store, round).unwrap())
            .collect();
        for i in 0..nodes.len() {
            for (j, table) in tables.iter().enumerate() {
                if i == j {
                    continue;
                }
                let advertiser = format!("!b{}", j);
                let node = &mut nodes[i];
                if node.store.get_peer(&advertiser).unwrap().is_some() {
                    node.rap
                        .handle_routes(&node.store, &advertiser, table, round)
                        .unwrap();
                }
            }
        }
    }
    nodes
}

fn node_index(node_id: &str) -> usize {
    node_id
        .trim_start_matches("!b")
        .parse::<usize>()
        .expect("chain node id")
}

/// Deliver queued frames until the mesh goes quiet. Returns the full
/// wire trace as (from, to, frame) triples.
fn pump(
    nodes: &mut [Node],
    mut queue: Vec<(String, String, String)>,
    now: i64,
) -> (Vec<(String, String, String)>, Vec<(String, String)>) {
    let mut trace = Vec::new();
    let mut notices = Vec::new();
    while !queue.is_empty() {
        let (from, to, wire) = queue.remove(0);
        trace.push((from.clone(), to.clone(), wire.clone()));
        let idx = node_index(&to);
        let node = &mut nodes[idx];
        let frame = Frame::parse(&wire).unwrap().expect("federation frame");
        let events = match frame {
            Frame::MailReq(req) => node
                .mail
                .handle_req(&node.store, &node.rap, req, &from, now)
                .unwrap(),
            Frame::MailAck { uuid } => node.mail.handle_ack(&uuid, &from),
            Frame::MailNak { uuid, reason } => node.mail.handle_nak(&node.store, &uuid, reason),
            Frame::MailDat {
                uuid,
                part,
                total,
                data,
            } => node
                .mail
                .handle_dat(&node.store, &node.keys, &uuid, part, total, &data, now)
                .unwrap(),
            Frame::MailDlv { uuid, dest } => node.mail.handle_dlv(&node.store, &uuid, &dest, now),
            other => panic!("unexpected frame in mail test: {:?}", other),
        };
        for event in events {
            match event {
                MailEvent::Send(outbound) => {
                    queue.push((node.node_id.clone(), outbound.to, outbound.frame));
                }
                MailEvent::NotifyUser { username, text } => notices.push((username, text)),
            }
        }
    }
    (trace, notices)
}

#[test]
fn four_hop_delivery_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut nodes = build_chain(&dir);
    nodes[0].add_user("u0");
    let u4_key = nodes[4].add_user("u4");

    let node0 = &mut nodes[0];
    let (uuid, events) = node0
        .mail
        .send_remote_mail(&node0.store, &node0.rap, "u0", "u4", "B4", "hi", 0)
        .unwrap();

    let mut queue = Vec::new();
    for event in events {
        if let MailEvent::Send(o) = event {
            queue.push(("!b0".to_string(), o.to, o.frame));
        }
    }
    let (trace, notices) = pump(&mut nodes, queue, 0);

    // The MAILREQ grew its route set hop by hop.
    let reqs: Vec<&String> = trace
        .iter()
        .filter(|(_, _, w)| w.starts_with("MAILREQ|"))
        .map(|(_, _, w)| w)
        .collect();
    assert_eq!(reqs.len(), 4);
    assert!(reqs[0].ends_with("|1|1|B0"));
    assert!(reqs[1].ends_with("|2|1|B0,B1"));
    assert!(reqs[2].ends_with("|3|1|B0,B1,B2"));
    assert!(reqs[3].ends_with("|4|1|B0,B1,B2,B3"));

    // ACK, one data chunk, and the delivery confirmation all traversed
    // the full relay path in both directions.
    assert_eq!(
        trace.iter().filter(|(_, _, w)| w.starts_with("MAILACK|")).count(),
        4
    );
    assert_eq!(
        trace.iter().filter(|(_, _, w)| w.starts_with("MAILDAT|")).count(),
        4
    );
    assert_eq!(
        trace.iter().filter(|(_, _, w)| w.starts_with("MAILDLV|")).count(),
        4
    );

    // Terminal: u4 has exactly one message, readable with their key.
    let inbox = nodes[4].store.mail_for_user("u4", false, 10, 0).unwrap();
    assert_eq!(inbox.len(), 1);
    let message = &inbox[0];
    assert_eq!(message.uuid, uuid);
    assert_eq!(message.origin_bbs, "B0");
    assert_eq!(message.sender.as_deref(), Some("u0@B0"));
    let body =
        crypto::decrypt_message(&u4_key, &message.body_enc, &message.uuid, message.created_at_us)
            .unwrap();
    assert_eq!(body, "hi");

    // Origin: the pending slot is released and the sender was told.
    assert_eq!(nodes[0].mail.pending_count(), 0);
    assert!(notices
        .iter()
        .any(|(user, text)| user == "u0" && text.contains("delivered")));
    assert!(notices
        .iter()
        .any(|(user, text)| user == "u4" && text.contains("u0@B0")));
}

#[test]
fn relay_rejects_looped_request() {
    let dir = TempDir::new().unwrap();
    let mut nodes = build_chain(&dir);

    let req = MailReq {
        uuid: "u-loop".to_string(),
        from_user: "a".to_string(),
        from_bbs: "B0".to_string(),
        to_user: "z".to_string(),
        to_bbs: "B4".to_string(),
        hop: 1,
        num_parts: 1,
        route: vec!["B0".to_string(), "B1".to_string()],
    };
    let queue = vec![("!b0".to_string(), "!b1".to_string(), req.to_wire())];
    let (trace, _) = pump(&mut nodes, queue, 0);

    // B1 NAKs with LOOP and forwards nothing.
    assert_eq!(trace.len(), 2);
    let (_, to, nak) = &trace[1];
    assert_eq!(to, "!b0");
    assert_eq!(nak, "MAILNAK|u-loop|LOOP");
    assert_eq!(
        Frame::parse(nak).unwrap().unwrap(),
        Frame::MailNak {
            uuid: "u-loop".to_string(),
            reason: NakReason::Loop
        }
    );
}
