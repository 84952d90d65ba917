//! Route Announcement Protocol.
//!
//! A small distance-vector layer over the peer mesh. Peers exchange
//! heartbeats and route tables; indirect destinations become reachable
//! transparently through the best-advertised next hop. Route state and
//! peer health live in the store; this engine owns the outstanding-ping
//! ledger and all transition rules.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::config::RapConfig;
use crate::storage::{Peer, PeerHealth, Route, Store, ROUTE_SCHEMA_VERSION};
use crate::sync::{Frame, Outbound};

#[derive(Debug)]
pub struct RapEngine {
    my_callsign: String,
    config: RapConfig,
    max_hops: u8,
    /// node_id -> when we pinged it (µs). A ping still here after the
    /// heartbeat timeout counts as a miss.
    pending_pings: HashMap<String, i64>,
}

type Result<T> = std::result::Result<T, crate::storage::StorageError>;

impl RapEngine {
    pub fn new(my_callsign: String, config: RapConfig, max_hops: u8) -> Self {
        Self {
            my_callsign: my_callsign.to_uppercase(),
            config,
            max_hops,
            pending_pings: HashMap::new(),
        }
    }

    // -- periodic work ------------------------------------------------------

    /// Ping every enabled peer. Dead peers are pinged too: a PONG is their
    /// only way back.
    pub fn heartbeat(&mut self, store: &Store, now_us: i64) -> Result<Vec<Outbound>> {
        let mut out = Vec::new();
        for peer in store.list_peers()? {
            if !peer.enabled {
                continue;
            }
            self.pending_pings.insert(peer.node_id.clone(), now_us);
            out.push(Outbound::control(
                peer.node_id,
                Frame::RapPing { ts_us: now_us }.to_wire(),
            ));
        }
        Ok(out)
    }

    /// Share the full route table with every enabled, non-dead peer.
    pub fn share_routes(&self, store: &Store, now_us: i64) -> Result<Vec<Outbound>> {
        let table = self.export_routes(store, now_us)?;
        let mut out = Vec::new();
        for peer in store.list_peers()? {
            if !peer.enabled || peer.health == PeerHealth::Dead {
                continue;
            }
            out.push(Outbound::control(
                peer.node_id,
                Frame::RapRoutes {
                    routes: table.clone(),
                }
                .to_wire(),
            ));
        }
        Ok(out)
    }

    /// Turn timed-out pings into misses and advance the health FSM.
    pub fn sweep_pending(&mut self, store: &Store, now_us: i64) -> Result<()> {
        let timeout_us = self.config.heartbeat_timeout_seconds as i64 * 1_000_000;
        let expired: Vec<String> = self
            .pending_pings
            .iter()
            .filter(|(_, sent)| now_us - **sent > timeout_us)
            .map(|(node, _)| node.clone())
            .collect();
        for node in expired {
            self.pending_pings.remove(&node);
            self.record_miss(store, &node)?;
        }
        Ok(())
    }

    pub fn expire_routes(&self, store: &Store, now_us: i64) -> Result<usize> {
        let expired = store.expire_routes(now_us)?;
        if expired > 0 {
            debug!("expired {} stale route(s)", expired);
        }
        Ok(expired)
    }

    // -- inbound frames -----------------------------------------------------

    /// RAP_PING: reply immediately with our table; sender is alive.
    pub fn handle_ping(
        &mut self,
        store: &Store,
        peer_node: &str,
        now_us: i64,
    ) -> Result<Vec<Outbound>> {
        self.mark_alive(store, peer_node, now_us)?;
        let routes = self.export_routes(store, now_us)?;
        Ok(vec![Outbound::control(
            peer_node,
            Frame::RapPong {
                ts_us: now_us,
                routes,
            }
            .to_wire(),
        )])
    }

    /// RAP_PONG: record latency, mark alive, install advertised routes.
    /// Returns true when the peer transitioned back to alive (callers use
    /// this to make pending mail through it immediately retryable).
    pub fn handle_pong(
        &mut self,
        store: &Store,
        peer_node: &str,
        ping_ts_us: i64,
        routes: &str,
        now_us: i64,
    ) -> Result<bool> {
        self.pending_pings.remove(peer_node);
        if ping_ts_us > 0 {
            debug!(
                "RAP_PONG from {} rtt={}ms",
                peer_node,
                (now_us - ping_ts_us) / 1000
            );
        }
        let came_alive = self.mark_alive(store, peer_node, now_us)?;
        if !routes.is_empty() {
            self.install_routes(store, peer_node, routes, now_us)?;
        }
        Ok(came_alive)
    }

    /// RAP_ROUTES: any traffic proves liveness, then install.
    pub fn handle_routes(
        &mut self,
        store: &Store,
        peer_node: &str,
        routes: &str,
        now_us: i64,
    ) -> Result<bool> {
        let came_alive = self.mark_alive(store, peer_node, now_us)?;
        self.install_routes(store, peer_node, routes, now_us)?;
        Ok(came_alive)
    }

    // -- route table --------------------------------------------------------

    /// `;`-joined `callsign:hop:quality` triples: self at hop 0, healthy
    /// direct peers at hop 1, then unexpired learned routes. Dead peers and
    /// routes through them are excluded.
    pub fn export_routes(&self, store: &Store, now_us: i64) -> Result<String> {
        let mut entries = vec![format!("{}:0:1.0", self.my_callsign)];
        let mut seen = vec![self.my_callsign.clone()];

        let peers = store.list_peers()?;
        for peer in &peers {
            if !peer.enabled || matches!(peer.health, PeerHealth::Dead | PeerHealth::Unreachable) {
                continue;
            }
            entries.push(format!("{}:1:{:.2}", peer.callsign, peer.quality));
            seen.push(peer.callsign.clone());
        }

        for route in store.list_routes()? {
            if route.expires_at_us <= now_us || seen.contains(&route.dest) {
                continue;
            }
            let via_ok = peers
                .iter()
                .any(|p| p.node_id == route.via_node && p.enabled && p.health != PeerHealth::Dead);
            if !via_ok {
                continue;
            }
            entries.push(format!(
                "{}:{}:{:.2}",
                route.dest, route.hop_count, route.quality
            ));
            seen.push(route.dest.clone());
        }
        Ok(entries.join(";"))
    }

    /// Apply the distance-vector install rules to an advertised table.
    fn install_routes(
        &self,
        store: &Store,
        peer_node: &str,
        routes: &str,
        now_us: i64,
    ) -> Result<()> {
        let expires_at_us = now_us + self.config.route_expiry_seconds as i64 * 1_000_000;
        let mut installed = 0usize;
        for entry in routes.split(';') {
            if entry.is_empty() {
                continue;
            }
            let fields: Vec<&str> = entry.split(':').collect();
            if fields.len() < 2 {
                continue;
            }
            let dest = fields[0].to_uppercase();
            let Ok(advertised_hop) = fields[1].parse::<u8>() else {
                continue;
            };
            let quality = fields
                .get(2)
                .and_then(|q| q.parse::<f32>().ok())
                .unwrap_or(1.0)
                .clamp(0.0, 1.0);

            if dest == self.my_callsign {
                continue;
            }
            let candidate_hop = advertised_hop.saturating_add(1);
            if candidate_hop > self.max_hops {
                continue;
            }

            let existing = store.get_route(&dest)?;
            let install = match &existing {
                None => true,
                Some(route) => {
                    candidate_hop < route.hop_count
                        || (candidate_hop == route.hop_count && quality > route.quality)
                }
            };
            if install {
                store.put_route(Route {
                    schema_version: ROUTE_SCHEMA_VERSION,
                    dest: dest.clone(),
                    via_node: peer_node.to_string(),
                    hop_count: candidate_hop,
                    quality,
                    learned_at_us: now_us,
                    expires_at_us,
                })?;
                installed += 1;
            } else if let Some(mut route) = existing {
                // Same advertisement from the same next hop refreshes expiry.
                if route.via_node == peer_node && route.hop_count == candidate_hop {
                    route.expires_at_us = expires_at_us;
                    store.put_route(route)?;
                }
            }
        }
        if installed > 0 {
            debug!("installed {} route(s) via {}", installed, peer_node);
        }
        Ok(())
    }

    /// Resolve the next-hop node for a destination callsign. Direct peers
    /// win; otherwise an unexpired learned route whose next hop is not
    /// dead. Returns `None` when unreachable.
    pub fn lookup(&self, store: &Store, callsign: &str, now_us: i64) -> Result<Option<String>> {
        let dest = callsign.to_uppercase();
        if dest == self.my_callsign {
            return Ok(None);
        }
        let peers = store.list_peers()?;
        if let Some(peer) = peers
            .iter()
            .find(|p| p.callsign == dest && p.enabled && p.health != PeerHealth::Dead)
        {
            return Ok(Some(peer.node_id.clone()));
        }
        let Some(route) = store.get_route(&dest)? else {
            return Ok(None);
        };
        if route.expires_at_us <= now_us {
            return Ok(None);
        }
        let via_alive = peers
            .iter()
            .any(|p| p.node_id == route.via_node && p.enabled && p.health != PeerHealth::Dead);
        Ok(via_alive.then_some(route.via_node))
    }

    // -- health FSM ---------------------------------------------------------

    /// Any successful contact resets a peer to alive. Returns true on a
    /// transition from a non-alive state.
    fn mark_alive(&self, store: &Store, peer_node: &str, now_us: i64) -> Result<bool> {
        let Some(mut peer) = store.get_peer(peer_node)? else {
            // Not whitelisted; the router should have dropped this.
            warn!("RAP traffic from unknown node {}", peer_node);
            return Ok(false);
        };
        let was = peer.health;
        peer.health = PeerHealth::Alive;
        peer.consecutive_misses = 0;
        peer.total_misses = 0;
        peer.last_seen_us = Some(now_us);
        store.put_peer(peer)?;
        let came_alive = was != PeerHealth::Alive;
        if came_alive {
            info!("peer {} is alive (was {:?})", peer_node, was);
        }
        Ok(came_alive)
    }

    /// Health only moves forward on misses:
    /// unknown -> unreachable (first miss), alive -> unreachable after
    /// `unreachable_threshold` consecutive misses, unreachable -> dead
    /// after `dead_threshold` total misses. Dead peers lose their routes.
    fn record_miss(&self, store: &Store, peer_node: &str) -> Result<()> {
        let Some(mut peer) = store.get_peer(peer_node)? else {
            return Ok(());
        };
        peer.consecutive_misses += 1;
        peer.total_misses += 1;
        let next = match peer.health {
            PeerHealth::Unknown => PeerHealth::Unreachable,
            PeerHealth::Alive => {
                if peer.consecutive_misses >= self.config.unreachable_threshold {
                    PeerHealth::Unreachable
                } else {
                    PeerHealth::Alive
                }
            }
            PeerHealth::Unreachable => {
                if peer.total_misses >= self.config.dead_threshold {
                    PeerHealth::Dead
                } else {
                    PeerHealth::Unreachable
                }
            }
            PeerHealth::Dead => PeerHealth::Dead,
        };
        let went_dead = next == PeerHealth::Dead && peer.health != PeerHealth::Dead;
        if next != peer.health {
            info!(
                "peer {} health {:?} -> {:?} ({} consecutive / {} total misses)",
                peer_node, peer.health, next, peer.consecutive_misses, peer.total_misses
            );
        }
        peer.health = next;
        let node_id = peer.node_id.clone();
        store.put_peer(peer)?;
        if went_dead {
            let dropped = store.delete_routes_via(&node_id)?;
            if dropped > 0 {
                info!("dropped {} route(s) via dead peer {}", dropped, node_id);
            }
        }
        Ok(())
    }
}
