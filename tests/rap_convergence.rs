//! Five stations in a line (B0-B1-B2-B3-B4), each peered only with its
//! neighbors, must converge to full route tables through periodic route
//! sharing, and next-hop lookup must point at the adjacent peer.

use advbbs::config::RapConfig;
use advbbs::storage::{Peer, PeerHealth, Store, StoreBuilder, PEER_SCHEMA_VERSION};
use advbbs::sync::rap::RapEngine;
use tempfile::TempDir;

struct Node {
    callsign: String,
    node_id: String,
    store: Store,
    rap: RapEngine,
}

fn build_chain(dir: &TempDir) -> Vec<Node> {
    let mut nodes = Vec::new();
    for i in 0..5 {
        let callsign = format!("B{}", i);
        let store = StoreBuilder::new(dir.path().join(format!("db{}", i)))
            .open()
            .expect("store");
        nodes.push(Node {
            node_id: format!("!b{}", i),
            rap: RapEngine::new(callsign.clone(), RapConfig::default(), 5),
            callsign,
            store,
        });
    }
    // Adjacent peering only.
    for i in 0..5usize {
        for j in [i.wrapping_sub(1), i + 1] {
            if j < 5 && j != i {
                nodes[i]
                    .store
                    .put_peer(Peer {
                        schema_version: PEER_SCHEMA_VERSION,
                        node_id: format!("!b{}", j),
                        callsign: format!("B{}", j),
                        enabled: true,
                        last_seen_us: None,
                        last_sync_us: None,
                        health: PeerHealth::Unknown,
                        consecutive_misses: 0,
                        total_misses: 0,
                        quality: 1.0,
                    })
                    .unwrap();
            }
        }
    }
    nodes
}

/// One route-share round: every station advertises its current table to
/// its neighbors.
fn share_round(nodes: &mut [Node], now_us: i64) {
    let tables: Vec<String> = nodes
        .iter()
        .map(|n| n.rap.export_routes(&n.store, now_us).unwrap())
        .collect();
    for i in 0..nodes.len() {
        for j in 0..nodes.len() {
            if i == j {
                continue;
            }
            let advertiser_node = nodes[j].node_id.clone();
            let table = tables[j].clone();
            let node = &mut nodes[i];
            if node.store.get_peer(&advertiser_node).unwrap().is_some() {
                node.rap
                    .handle_routes(&node.store, &advertiser_node, &table, now_us)
                    .unwrap();
            }
        }
    }
}

#[test]
fn linear_chain_converges_to_full_tables() {
    let dir = TempDir::new().unwrap();
    let mut nodes = build_chain(&dir);

    for round in 0..4 {
        share_round(&mut nodes, (round + 1) * 1_000_000);
    }

    // B0 sees every station at the expected distance.
    let b0 = &nodes[0];
    let expectations = [("B2", 2u8), ("B3", 3), ("B4", 4)];
    for (dest, hops) in expectations {
        let route = b0
            .store
            .get_route(dest)
            .unwrap()
            .unwrap_or_else(|| panic!("B0 has no route to {}", dest));
        assert_eq!(route.hop_count, hops, "hops to {}", dest);
        assert_eq!(route.via_node, "!b1", "everything beyond B1 goes via B1");
    }
    // B1 is a direct peer, not a learned route.
    assert!(b0.store.get_peer("!b1").unwrap().is_some());

    // Next-hop resolution for the far end returns the adjacent peer.
    let next = b0.rap.lookup(&b0.store, "B4", 10_000_000).unwrap();
    assert_eq!(next, Some("!b1".to_string()));

    // The middle of the chain sees both directions.
    let b2 = &nodes[2];
    assert_eq!(
        b2.rap.lookup(&b2.store, "B0", 10_000_000).unwrap(),
        Some("!b1".to_string())
    );
    assert_eq!(
        b2.rap.lookup(&b2.store, "B4", 10_000_000).unwrap(),
        Some("!b3".to_string())
    );
}

#[test]
fn hop_cap_excludes_distant_stations() {
    // With max_hops 2, a five-node chain must not learn the far end.
    let dir = TempDir::new().unwrap();
    let mut nodes: Vec<Node> = build_chain(&dir);
    for node in &mut nodes {
        node.rap = RapEngine::new(node.callsign.clone(), RapConfig::default(), 2);
    }
    for round in 0..4 {
        share_round(&mut nodes, (round + 1) * 1_000_000);
    }
    let b0 = &nodes[0];
    assert!(b0.store.get_route("B2").unwrap().is_some());
    assert!(b0.store.get_route("B3").unwrap().is_none());
    assert!(b0.store.get_route("B4").unwrap().is_none());
}
