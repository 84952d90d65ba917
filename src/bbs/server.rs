//! The BBS server: one cooperative loop that consumes inbound radio
//! frames, drives the periodic schedule, and routes between the command
//! dispatcher and the federation engines.
//!
//! All shared state (sessions, chunk buffers, pending deliveries, the
//! route table) is owned by this task and only mutated here. The radio
//! driver's threads reach the loop exclusively through the inbound mpsc
//! channel, so nothing in this module ever blocks a driver callback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::bbs::commands::{CommandContext, Reply};
use crate::bbs::dispatch;
use crate::bbs::session::{LoginGuard, Session};
use crate::config::Config;
use crate::crypto::{self, Crypto, KeyRing};
use crate::mesh::{self, ChannelTransport, TextEvent, Transport};
use crate::storage::{
    backup, Board, BoardKind, Peer, PeerHealth, Store, BOARD_SCHEMA_VERSION, PEER_SCHEMA_VERSION,
};
use crate::sync::boards::BoardSyncEngine;
use crate::sync::chunker::{Chunker, Reassembler};
use crate::sync::limiter::{RateLimiter, SendClass};
use crate::sync::mail::{MailEngine, MailEvent};
use crate::sync::rap::RapEngine;
use crate::sync::{Frame, FrameError, Outbound};

/// Due-times for the periodic work the scheduler drives.
#[derive(Debug)]
struct Schedule {
    heartbeat_us: i64,
    route_share_us: i64,
    sweep_us: i64,
    cleanup_us: i64,
    board_check_us: i64,
    announce_us: i64,
    backup_us: i64,
    expiry_us: i64,
}

const SWEEP_INTERVAL_US: i64 = 10 * 1_000_000;
const CLEANUP_INTERVAL_US: i64 = 60 * 1_000_000;
const BOARD_CHECK_INTERVAL_US: i64 = 60 * 1_000_000;
const EXPIRY_INTERVAL_US: i64 = 3600 * 1_000_000;

impl Schedule {
    fn new(now_us: i64) -> Self {
        Self {
            heartbeat_us: now_us,
            route_share_us: now_us,
            sweep_us: now_us,
            cleanup_us: now_us,
            board_check_us: now_us,
            announce_us: now_us,
            backup_us: now_us,
            expiry_us: now_us,
        }
    }

    fn due(slot: &mut i64, interval_us: i64, now_us: i64) -> bool {
        if interval_us <= 0 || now_us < *slot {
            return false;
        }
        *slot = now_us + interval_us;
        true
    }
}

#[derive(Debug)]
pub struct BbsServer {
    config: Config,
    store: Store,
    crypto: Crypto,
    keys: KeyRing,
    chunker: Chunker,
    reassembler: Reassembler,
    limiter: RateLimiter,
    rap: RapEngine,
    mail: MailEngine,
    boards: BoardSyncEngine,
    guard: LoginGuard,
    sessions: HashMap<String, Session>,
    transport: Transport,
    inbound_tx: mpsc::UnboundedSender<TextEvent>,
    inbound_rx: mpsc::UnboundedReceiver<TextEvent>,
    schedule: Schedule,
}

fn now_us() -> i64 {
    Utc::now().timestamp_micros()
}

impl BbsServer {
    /// Build the server: open the store (refusing to run on a corrupt
    /// master salt), derive the master key, seed peers and default boards.
    pub async fn new(config: Config) -> Result<Self> {
        let store = Store::open(&config.storage.data_dir)
            .map_err(|e| anyhow!("store startup failed: {}", e))?;
        let crypto = Crypto::new(&config.crypto).context("crypto init")?;
        if config.bbs.passphrase.is_empty() {
            return Err(anyhow!("operator passphrase is empty; set bbs.passphrase"));
        }
        let keys = KeyRing::derive(&crypto, &config.bbs.passphrase, &store.master_salt()?)
            .context("master key derivation")?;

        let now = now_us();
        seed_peers(&store, &config, now)?;
        seed_default_boards(&store, &keys)?;

        let callsign = config.bbs.callsign.clone();
        let chunker = Chunker::new(config.mesh.chunk_frame_bytes);
        let mail_piece = config.mesh.chunk_frame_bytes;
        let board_piece = chunker.content_size();
        let (inbound_tx, inbound_rx) = mesh::inbound_channel();

        Ok(BbsServer {
            rap: RapEngine::new(callsign.clone(), config.sync.rap.clone(), config.sync.mail_max_hops),
            mail: MailEngine::new(callsign.clone(), config.sync.clone(), mail_piece),
            boards: BoardSyncEngine::new(
                callsign,
                config.sync.enabled,
                config.sync.boards.clone(),
                board_piece,
            ),
            guard: LoginGuard::new(
                config.security.max_failed_logins,
                config.security.lockout_minutes,
                config.security.login_attempts_per_minute,
            ),
            limiter: RateLimiter::new(&config.rate_limits),
            chunker,
            reassembler: Reassembler::default(),
            sessions: HashMap::new(),
            transport: Transport::Detached,
            inbound_tx,
            inbound_rx,
            schedule: Schedule::new(now),
            store,
            crypto,
            keys,
            config,
        })
    }

    /// Sender half of the inbound channel, for the radio driver thread.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<TextEvent> {
        self.inbound_tx.clone()
    }

    pub fn attach_transport(&mut self, transport: Transport) {
        self.transport = transport;
    }

    pub fn connect(&mut self) {
        self.transport = mesh::connect(&self.config.mesh.transport, &self.config.mesh.port);
        if !self.transport.is_attached() {
            warn!("running without a radio; inbound-only via injected events");
        }
    }

    /// Main loop: inbound events, the periodic schedule, and shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "{} [{}] on the air; {} peer(s) configured",
            self.config.bbs.name,
            self.config.bbs.callsign,
            self.config.sync.peers.len()
        );
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = self.inbound_rx.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.handle_inbound(event).await {
                                error!("inbound handling failed: {:#}", e);
                            }
                        }
                        None => {
                            warn!("inbound channel closed; shutting down");
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.run_scheduled(now_us()).await {
                        error!("scheduled work failed: {:#}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    // -- inbound ------------------------------------------------------------

    /// One radio frame: reassemble, then demux into the federation plane
    /// or the user command path.
    pub async fn handle_inbound(&mut self, event: TextEvent) -> Result<()> {
        let now = now_us();
        self.store
            .touch_node(&event.sender, now, event.snr, event.rssi)?;

        let Some(payload) = self.reassembler.accept(&event.sender, &event.text, now) else {
            return Ok(()); // fragment buffered
        };

        match Frame::parse(&payload) {
            Err(FrameError::LegacyProtocol) => {
                warn!("rejected legacy FQ51 frame from {}", event.sender);
            }
            Err(e) => {
                debug!("unparseable frame from {}: {}", event.sender, e);
            }
            Ok(Some(frame)) => {
                // Federation traffic is whitelisted. A MAILREQ from a
                // stranger is never honored.
                if !self.config.is_peer(&event.sender) {
                    warn!(
                        target: "security",
                        "dropping federation frame from non-peer {}", event.sender
                    );
                    return Ok(());
                }
                let events = self.route_frame(frame, &event.sender, now)?;
                self.process_events(events).await?;
            }
            Ok(None) => {
                self.handle_user_payload(&event.sender, &payload, now).await?;
            }
        }
        Ok(())
    }

    /// Demux one federation frame into its engine.
    fn route_frame(&mut self, frame: Frame, sender: &str, now: i64) -> Result<Vec<MailEvent>> {
        let mut events = Vec::new();
        match frame {
            Frame::RapPing { .. } => {
                for o in self.rap.handle_ping(&self.store, sender, now)? {
                    events.push(MailEvent::Send(o));
                }
            }
            Frame::RapPong { ts_us, routes } => {
                if self.rap.handle_pong(&self.store, sender, ts_us, &routes, now)? {
                    self.mail.peer_alive(sender);
                }
            }
            Frame::RapRoutes { routes } => {
                if self.rap.handle_routes(&self.store, sender, &routes, now)? {
                    self.mail.peer_alive(sender);
                }
            }
            Frame::Hello {
                callsign,
                name,
                capabilities,
            } => {
                info!(
                    "HELLO from {} ({}) [{}]: {:?}",
                    name, callsign, sender, capabilities
                );
                let reply = Frame::Hello {
                    callsign: self.config.bbs.callsign.clone(),
                    name: self.config.bbs.name.clone(),
                    capabilities: vec!["mail".to_string(), "boards".to_string()],
                };
                events.push(MailEvent::Send(Outbound::control(sender, reply.to_wire())));
            }
            Frame::SyncAck { uuid } => {
                debug!("SYNC_ACK {} from {}", uuid, sender);
            }
            Frame::MailReq(req) => {
                events.extend(self.mail.handle_req(&self.store, &self.rap, req, sender, now)?);
            }
            Frame::MailAck { uuid } => {
                events.extend(self.mail.handle_ack(&uuid, sender));
            }
            Frame::MailNak { uuid, reason } => {
                events.extend(self.mail.handle_nak(&self.store, &uuid, reason));
            }
            Frame::MailDat {
                uuid,
                part,
                total,
                data,
            } => {
                events.extend(self.mail.handle_dat(
                    &self.store,
                    &self.keys,
                    &uuid,
                    part,
                    total,
                    &data,
                    now,
                )?);
            }
            Frame::MailDlv { uuid, dest } => {
                events.extend(self.mail.handle_dlv(&self.store, &uuid, &dest, now));
            }
            Frame::BoardReq { board, count, .. } => {
                for o in self.boards.handle_req(&self.store, &board, count, sender, now)? {
                    events.push(MailEvent::Send(o));
                }
            }
            Frame::BoardAck { board } => {
                for o in self.boards.handle_ack(&board, sender) {
                    events.push(MailEvent::Send(o));
                }
            }
            Frame::BoardNak { board, reason } => {
                self.boards.handle_nak(&board, sender, &reason);
            }
            Frame::BoardDat {
                board,
                part,
                total,
                payload,
            } => {
                for o in self.boards.handle_dat(
                    &self.store,
                    &self.keys,
                    &board,
                    part,
                    total,
                    &payload,
                    sender,
                    now,
                )? {
                    events.push(MailEvent::Send(o));
                }
            }
            Frame::BoardDlv { board } => {
                self.boards.handle_dlv(&self.store, &board, sender, now)?;
            }
        }
        Ok(events)
    }

    /// Commands and reply-context plaintext from (possibly unknown) nodes.
    async fn handle_user_payload(&mut self, sender: &str, payload: &str, now: i64) -> Result<()> {
        let mut session = self.take_session(sender, now);
        let reply = {
            let mut ctx = CommandContext {
                config: &self.config,
                store: &self.store,
                crypto: &self.crypto,
                keys: &self.keys,
                rap: &self.rap,
                mail: &mut self.mail,
                boards: &mut self.boards,
                guard: &mut self.guard,
                active_users: self
                    .sessions
                    .values()
                    .filter_map(|s| s.username.clone())
                    .collect(),
                now_us: now,
            };
            dispatch::dispatch(&mut ctx, &mut session, payload)
        };
        self.sessions.insert(sender.to_string(), session);
        self.deliver_reply(sender, reply).await
    }

    async fn deliver_reply(&mut self, sender: &str, reply: Reply) -> Result<()> {
        if let Some(text) = &reply.text {
            self.send_text(sender, text).await?;
        }
        if let Some((channel, text)) = &reply.broadcast {
            self.limiter.acquire(SendClass::Unicast).await;
            self.transport.broadcast(*channel, text).await?;
        }
        self.process_events(reply.events).await
    }

    /// Get-or-create the sender's session, expiring idle logins.
    fn take_session(&mut self, sender: &str, now: i64) -> Session {
        let mut session = self
            .sessions
            .remove(sender)
            .unwrap_or_else(|| Session::new(sender.to_string(), now));
        if session.is_logged_in()
            && session.is_idle(self.config.bbs.session_timeout_minutes, now)
        {
            info!("session timeout for {}", session.display_name());
            session.logout();
        }
        session
    }

    // -- outbound -----------------------------------------------------------

    /// Chunk and send a user-facing text reply.
    async fn send_text(&mut self, node: &str, text: &str) -> Result<()> {
        for chunk in self.chunker.chunk(text) {
            self.limiter.acquire(SendClass::Unicast).await;
            self.transport.send_unicast(node, &chunk).await?;
        }
        Ok(())
    }

    /// Drain engine events: transmit frames (paced per class) and deliver
    /// user notifications to their primary node.
    async fn process_events(&mut self, events: Vec<MailEvent>) -> Result<()> {
        for event in events {
            match event {
                MailEvent::Send(outbound) => self.send_outbound(outbound).await?,
                MailEvent::NotifyUser { username, text } => {
                    match self.store.primary_node(&username)? {
                        Some(node) => self.send_text(&node, &text).await?,
                        None => debug!("no node to notify {} on", username),
                    }
                }
            }
        }
        Ok(())
    }

    async fn send_outbound(&mut self, outbound: Outbound) -> Result<()> {
        self.limiter.acquire(outbound.class).await;
        if outbound.await_ack {
            let timeout = Duration::from_secs(self.config.sync.mail_ack_timeout_seconds);
            let outcome = self
                .transport
                .send_unicast_await_ack(&outbound.to, &outbound.frame, timeout)
                .await?;
            if !outcome.delivered {
                if let Some(uuid) = &outbound.tag {
                    // Failing a delivery only yields user notifications,
                    // which go out as plain text (no re-entry into here).
                    let events = self
                        .mail
                        .chunk_send_failed(&self.store, uuid, &outcome.detail);
                    for event in events {
                        if let MailEvent::NotifyUser { username, text } = event {
                            if let Some(node) = self.store.primary_node(&username)? {
                                self.send_text(&node, &text).await?;
                            }
                        }
                    }
                }
            }
        } else {
            self.transport
                .send_unicast(&outbound.to, &outbound.frame)
                .await?;
        }
        Ok(())
    }

    // -- periodic work ------------------------------------------------------

    async fn run_scheduled(&mut self, now: i64) -> Result<()> {
        let heartbeat_interval_us =
            self.config.sync.rap.heartbeat_interval_seconds as i64 * 1_000_000;
        let route_share_interval_us =
            self.config.sync.rap.route_share_interval_seconds as i64 * 1_000_000;
        if self.config.sync.enabled {
            if Schedule::due(&mut self.schedule.heartbeat_us, heartbeat_interval_us, now) {
                let outbounds = self.rap.heartbeat(&self.store, now)?;
                self.send_all(outbounds).await?;
            }
            if Schedule::due(
                &mut self.schedule.route_share_us,
                route_share_interval_us,
                now,
            ) {
                let outbounds = self.rap.share_routes(&self.store, now)?;
                self.send_all(outbounds).await?;
            }
            if Schedule::due(&mut self.schedule.sweep_us, SWEEP_INTERVAL_US, now) {
                self.rap.sweep_pending(&self.store, now)?;
                let events = self.mail.retry_sweep(&self.store, now);
                self.process_events(events).await?;
            }
            if Schedule::due(&mut self.schedule.board_check_us, BOARD_CHECK_INTERVAL_US, now) {
                let outbounds =
                    self.boards
                        .maybe_batch(&self.store, &self.keys, &mut self.limiter, now)?;
                self.send_all(outbounds).await?;
            }
        }
        if Schedule::due(&mut self.schedule.cleanup_us, CLEANUP_INTERVAL_US, now) {
            self.rap.expire_routes(&self.store, now)?;
            let dropped = self.reassembler.expire(now);
            if dropped > 0 {
                debug!("dropped {} stale chunk buffer(s)", dropped);
            }
            let events = self.mail.expire_sweep(&self.store, now);
            self.process_events(events).await?;
            let pending_expiry =
                self.config.sync.pending_expiry_seconds as i64 * 1_000_000;
            self.boards.expire_sweep(now, pending_expiry);
            self.prune_idle_sessions(now);
        }
        if Schedule::due(
            &mut self.schedule.announce_us,
            self.config.bbs.announcement_interval_hours as i64 * 3600 * 1_000_000,
            now,
        ) {
            self.broadcast_announcement().await?;
        }
        if Schedule::due(
            &mut self.schedule.backup_us,
            self.config.storage.backup_interval_hours as i64 * 3600 * 1_000_000,
            now,
        ) {
            let data_dir = PathBuf::from(&self.config.storage.data_dir);
            let backup_dir = PathBuf::from(&self.config.storage.backup_dir);
            if let Err(e) = backup::create_snapshot(&data_dir, &backup_dir, self.config.storage.backup_keep)
            {
                error!("store snapshot failed: {}", e);
            }
        }
        if Schedule::due(&mut self.schedule.expiry_us, EXPIRY_INTERVAL_US, now) {
            let expired = self.store.delete_expired_messages(now)?;
            if expired > 0 {
                info!("expired {} old message(s)", expired);
            }
        }
        Ok(())
    }

    async fn send_all(&mut self, outbounds: Vec<Outbound>) -> Result<()> {
        for outbound in outbounds {
            self.send_outbound(outbound).await?;
        }
        Ok(())
    }

    fn prune_idle_sessions(&mut self, now: i64) {
        let timeout = self.config.bbs.session_timeout_minutes;
        self.sessions.retain(|_, session| {
            // Anonymous sessions with no recent activity just evaporate;
            // logged-in ones were already timed out on next contact.
            session.is_logged_in() || !session.is_idle(timeout.max(1), now)
        });
    }

    async fn broadcast_announcement(&mut self) -> Result<()> {
        let text = if self.config.bbs.announcement_message.is_empty() {
            format!(
                "{} [{}] online. DM !bbs for commands.",
                self.config.bbs.name, self.config.bbs.callsign
            )
        } else {
            self.config.bbs.announcement_message.clone()
        };
        self.limiter.acquire(SendClass::Unicast).await;
        self.transport
            .broadcast(self.config.bbs.announcement_channel, &text)
            .await
    }

    // -- status / test support ----------------------------------------------

    pub async fn show_status(&self) -> Result<()> {
        println!("{} [{}]", self.config.bbs.name, self.config.bbs.callsign);
        println!("users:  {}", self.store.user_count()?);
        println!("boards: {}", self.store.list_boards()?.len());
        println!(
            "outbound mail in flight: {}",
            self.store.pending_outbound_mail(100)?.len()
        );
        for peer in self.store.list_peers()? {
            println!("peer {} {:?}", peer.callsign, peer.health);
        }
        for route in self.store.list_routes()? {
            println!("route {} via {} hop {}", route.dest, route.via_node, route.hop_count);
        }
        Ok(())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn test_transport(&mut self) -> ChannelTransport {
        let channel = ChannelTransport::new();
        self.transport = Transport::Channel(channel.clone());
        channel
    }

    pub fn test_session(&self, node: &str) -> Option<&Session> {
        self.sessions.get(node)
    }
}

/// Mirror the configured peer list into the store, preserving learned
/// health state across restarts.
fn seed_peers(store: &Store, config: &Config, now: i64) -> Result<()> {
    for peer in &config.sync.peers {
        match store.get_peer(&peer.node_id)? {
            Some(mut existing) => {
                existing.callsign = peer.callsign.clone();
                existing.enabled = peer.enabled;
                store.put_peer(existing)?;
            }
            None => {
                store.put_peer(Peer {
                    schema_version: PEER_SCHEMA_VERSION,
                    node_id: peer.node_id.clone(),
                    callsign: peer.callsign.clone(),
                    enabled: peer.enabled,
                    last_seen_us: None,
                    last_sync_us: None,
                    health: PeerHealth::Unknown,
                    consecutive_misses: 0,
                    total_misses: 0,
                    quality: 1.0,
                })?;
                info!("peer {} ({}) registered at {}", peer.callsign, peer.node_id, now);
            }
        }
    }
    Ok(())
}

/// First boot: a synced `general` board and a never-synced `local` board.
fn seed_default_boards(store: &Store, keys: &KeyRing) -> Result<()> {
    if !store.list_boards()?.is_empty() {
        return Ok(());
    }
    for (name, description, synced) in [
        ("general", "General discussion", true),
        ("local", "Local-only notices", false),
    ] {
        let board_key = crypto::generate_key();
        store.create_board(Board {
            schema_version: BOARD_SCHEMA_VERSION,
            name: name.to_string(),
            description: description.to_string(),
            created_at_us: now_us(),
            synced,
            kind: BoardKind::Public,
            wrapped_key: keys.wrap(&board_key)?,
        })?;
    }
    info!("seeded default boards (general*, local)");
    Ok(())
}
