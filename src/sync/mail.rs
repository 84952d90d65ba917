//! Remote mail delivery state machine.
//!
//! One delivery walks MAILREQ -> MAILACK -> MAILDAT* -> MAILDLV, with
//! MAILNAK terminating any stage. This node plays three roles:
//!
//! * **origin**: owns the pending-delivery entry, the ACK timer and the
//!   retry/backoff schedule;
//! * **relay**: forwards REQ downstream with `hop+1` and itself appended
//!   to the route, then shuttles ACK/NAK/DAT/DLV between its two sides
//!   without ever looking inside the payload;
//! * **terminal**: reassembles the body, encrypts it under the recipient
//!   user's key, stores it, and confirms with MAILDLV along the return
//!   path.
//!
//! Loop prevention is route-set membership; the hop counter is only a
//! secondary bound. Mail crosses the federation links as plaintext (peers
//! are operator-whitelisted and the link has its own PSK); only the
//! terminal BBS can produce a ciphertext its recipient can later decrypt.
//!
//! The engine never touches the transport: every handler returns
//! [`MailEvent`]s for the server to pace and send.

use std::collections::HashMap;

use log::{info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::crypto::{self, KeyRing};
use crate::logutil::short_id;
use crate::storage::{Message, MessageKind, Store, SyncDirection, SyncLogEntry, SyncStatus};
use crate::sync::chunker::split_raw;
use crate::sync::rap::RapEngine;
use crate::sync::{Frame, MailReq, NakReason, Outbound};

pub const MAIL_MAX_PARTS: usize = 3;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("message too long for remote delivery (max {0} chars)")]
    RemoteBodyTooLong(usize),
    #[error("no route to BBS {0}")]
    NoRouteToBbs(String),
    #[error("recipient unknown at {0}")]
    RecipientUnknown(String),
    #[error("routing loop involving {0}; check peer configuration")]
    Looped(String),
    #[error("no acknowledgement after {0} attempts")]
    AckTimeout(u32),
    #[error("chunk transmission failed: {0}")]
    ChunkSendFailed(String),
    #[error("delivery expired in transit")]
    DeliveryExpired,
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// What the server should do after a handler ran.
#[derive(Debug)]
pub enum MailEvent {
    Send(Outbound),
    /// Tell a local user something (delivered via their primary node).
    NotifyUser { username: String, text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingState {
    AwaitingAck,
    AwaitingDlv,
}

/// One in-flight outbound delivery. Never persisted; a restart abandons
/// in-flight transfers and the stored message row keeps its sent status.
#[derive(Debug)]
struct Pending {
    dest_node: String,
    chunks: Vec<String>,
    sender: String,
    recipient: String,
    mailreq: String,
    attempts: u32,
    next_retry_us: i64,
    created_us: i64,
    state: PendingState,
}

#[derive(Debug)]
struct Relay {
    origin_node: String,
    dest_node: String,
    created_us: i64,
}

#[derive(Debug)]
struct IncomingMail {
    from_user: String,
    from_bbs: String,
    to_user: String,
    num_parts: u32,
    parts: HashMap<u32, String>,
    sender_node: String,
    created_us: i64,
}

#[derive(Debug)]
pub struct MailEngine {
    my_callsign: String,
    config: SyncConfig,
    pending: HashMap<String, Pending>,
    relays: HashMap<String, Relay>,
    incoming: HashMap<String, IncomingMail>,
    /// Max bytes of body per MAILDAT fragment.
    piece_bytes: usize,
}

impl MailEngine {
    pub fn new(my_callsign: String, config: SyncConfig, piece_bytes: usize) -> Self {
        Self {
            my_callsign: my_callsign.to_uppercase(),
            config,
            pending: HashMap::new(),
            relays: HashMap::new(),
            incoming: HashMap::new(),
            piece_bytes,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // -- origin side --------------------------------------------------------

    /// Start a remote delivery. Returns the mail UUID and the MAILREQ to
    /// transmit. The caller persists the sender-side message row.
    pub fn send_remote_mail(
        &mut self,
        store: &Store,
        rap: &RapEngine,
        from_user: &str,
        to_user: &str,
        to_bbs: &str,
        body: &str,
        now_us: i64,
    ) -> Result<(String, Vec<MailEvent>), DeliveryError> {
        if body.len() > self.config.remote_body_max {
            return Err(DeliveryError::RemoteBodyTooLong(self.config.remote_body_max));
        }
        let to_bbs = to_bbs.to_uppercase();
        let dest_node = rap
            .lookup(store, &to_bbs, now_us)?
            .ok_or_else(|| DeliveryError::NoRouteToBbs(to_bbs.clone()))?;

        let chunks = split_raw(body, self.piece_bytes);
        if chunks.len() > MAIL_MAX_PARTS {
            return Err(DeliveryError::RemoteBodyTooLong(self.config.remote_body_max));
        }

        let uuid = Uuid::new_v4().to_string();
        let req = MailReq {
            uuid: uuid.clone(),
            from_user: from_user.to_string(),
            from_bbs: self.my_callsign.clone(),
            to_user: to_user.to_string(),
            to_bbs: to_bbs.clone(),
            hop: 1,
            num_parts: chunks.len() as u32,
            route: vec![self.my_callsign.clone()],
        };
        let wire = req.to_wire();
        self.pending.insert(
            uuid.clone(),
            Pending {
                dest_node: dest_node.clone(),
                chunks,
                sender: from_user.to_string(),
                recipient: format!("{}@{}", to_user, to_bbs),
                mailreq: wire.clone(),
                attempts: 1,
                next_retry_us: now_us + self.ack_timeout_us(),
                created_us: now_us,
                state: PendingState::AwaitingAck,
            },
        );
        info!(
            "MAILREQ {} -> {} via {} (attempt 1/{})",
            short_id(&uuid),
            to_bbs,
            dest_node,
            self.config.mail_retry_attempts
        );
        Ok((uuid, vec![MailEvent::Send(Outbound::control(dest_node, wire))]))
    }

    fn ack_timeout_us(&self) -> i64 {
        self.config.mail_ack_timeout_seconds as i64 * 1_000_000
    }

    /// Retry MAILREQs whose ACK timer fired; give up past the attempt cap.
    pub fn retry_sweep(&mut self, store: &Store, now_us: i64) -> Vec<MailEvent> {
        let mut events = Vec::new();
        let mut failed = Vec::new();
        for (uuid, pending) in self.pending.iter_mut() {
            if pending.state != PendingState::AwaitingAck || now_us < pending.next_retry_us {
                continue;
            }
            if pending.attempts >= self.config.mail_retry_attempts {
                failed.push(uuid.clone());
                continue;
            }
            let backoff_idx =
                (pending.attempts as usize - 1).min(self.config.mail_retry_backoff_seconds.len() - 1);
            pending.attempts += 1;
            pending.next_retry_us =
                now_us + self.config.mail_retry_backoff_seconds[backoff_idx] as i64 * 1_000_000;
            let _ = store.record_delivery_attempt(uuid, now_us);
            info!(
                "retrying MAILREQ {} (attempt {}/{})",
                short_id(uuid),
                pending.attempts,
                self.config.mail_retry_attempts
            );
            events.push(MailEvent::Send(Outbound::control(
                pending.dest_node.clone(),
                pending.mailreq.clone(),
            )));
        }
        for uuid in failed {
            let error = DeliveryError::AckTimeout(self.config.mail_retry_attempts);
            events.extend(self.fail_pending(store, &uuid, &error));
        }
        events
    }

    /// Expire in-flight state past the hard deadline.
    pub fn expire_sweep(&mut self, store: &Store, now_us: i64) -> Vec<MailEvent> {
        let expiry_us = self.config.pending_expiry_seconds as i64 * 1_000_000;
        let mut events = Vec::new();
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now_us - p.created_us > expiry_us)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in stale {
            warn!("pending delivery {} expired", short_id(&uuid));
            events.extend(self.fail_pending(store, &uuid, &DeliveryError::DeliveryExpired));
        }
        self.relays.retain(|_, r| now_us - r.created_us <= expiry_us);
        self.incoming.retain(|_, i| now_us - i.created_us <= expiry_us);
        events
    }

    /// A peer came back alive: anything queued through it may retry now.
    pub fn peer_alive(&mut self, node_id: &str) {
        for pending in self.pending.values_mut() {
            if pending.dest_node == node_id && pending.state == PendingState::AwaitingAck {
                pending.next_retry_us = 0;
            }
        }
    }

    /// Transport-level chunk send failed: the delivery is dead.
    pub fn chunk_send_failed(&mut self, store: &Store, uuid: &str, detail: &str) -> Vec<MailEvent> {
        let error = DeliveryError::ChunkSendFailed(detail.to_string());
        self.fail_pending(store, uuid, &error)
    }

    fn fail_pending(&mut self, store: &Store, uuid: &str, error: &DeliveryError) -> Vec<MailEvent> {
        let Some(pending) = self.pending.remove(uuid) else {
            return Vec::new();
        };
        warn!(
            "remote mail {} to {} failed: {}",
            short_id(uuid),
            pending.recipient,
            error
        );
        let _ = store.mark_delivery_failed(uuid, &error.to_string());
        vec![MailEvent::NotifyUser {
            username: pending.sender,
            text: format!("Mail to {} failed: {}", pending.recipient, error),
        }]
    }

    // -- inbound frames -----------------------------------------------------

    /// Inbound MAILREQ from a whitelisted peer.
    pub fn handle_req(
        &mut self,
        store: &Store,
        rap: &RapEngine,
        req: MailReq,
        sender_node: &str,
        now_us: i64,
    ) -> Result<Vec<MailEvent>, DeliveryError> {
        let uuid = req.uuid.clone();
        info!(
            "MAILREQ {} {}@{} -> {}@{} hop {} via {}",
            short_id(&uuid),
            req.from_user,
            req.from_bbs,
            req.to_user,
            req.to_bbs,
            req.hop,
            sender_node
        );

        // Loop prevention by route membership, before anything else.
        if req.route_contains(&self.my_callsign) {
            warn!("MAILREQ {}: loop detected", short_id(&uuid));
            return Ok(vec![nak(sender_node, &uuid, NakReason::Loop)]);
        }
        if req.hop > self.config.mail_max_hops {
            return Ok(vec![nak(sender_node, &uuid, NakReason::MaxHops)]);
        }

        if req.to_bbs == self.my_callsign {
            // Terminal. A replayed REQ for mail we already stored is
            // answered with DLV so the origin stops retrying.
            if store.message_exists(&uuid)? {
                let dest = format!("{}@{}", req.to_user, self.my_callsign);
                return Ok(vec![MailEvent::Send(Outbound::control(
                    sender_node,
                    Frame::MailDlv { uuid, dest }.to_wire(),
                ))]);
            }
            let recipient = store.get_user(&req.to_user)?;
            let deliverable = recipient.as_ref().is_some_and(|u| u.ban.is_none());
            if !deliverable {
                warn!(
                    "MAILREQ {}: no deliverable user '{}'",
                    short_id(&uuid),
                    req.to_user
                );
                return Ok(vec![nak(sender_node, &uuid, NakReason::NoUser)]);
            }
            self.incoming.insert(
                uuid.clone(),
                IncomingMail {
                    from_user: req.from_user,
                    from_bbs: req.from_bbs,
                    to_user: req.to_user,
                    num_parts: req.num_parts,
                    parts: HashMap::new(),
                    sender_node: sender_node.to_string(),
                    created_us: now_us,
                },
            );
            return Ok(vec![MailEvent::Send(Outbound::control(
                sender_node,
                Frame::MailAck { uuid }.to_wire(),
            ))]);
        }

        // Relay. Refuse when forwarding would blow the hop budget.
        if req.hop >= self.config.mail_max_hops {
            return Ok(vec![nak(sender_node, &uuid, NakReason::MaxHops)]);
        }
        let Some(next_hop) = rap.lookup(store, &req.to_bbs, now_us)? else {
            warn!("MAILREQ {}: no route to {}", short_id(&uuid), req.to_bbs);
            return Ok(vec![nak(sender_node, &uuid, NakReason::NoRoute)]);
        };
        let mut forwarded = req.clone();
        forwarded.hop += 1;
        forwarded.route.push(self.my_callsign.clone());
        self.relays.insert(
            uuid.clone(),
            Relay {
                origin_node: sender_node.to_string(),
                dest_node: next_hop.clone(),
                created_us: now_us,
            },
        );
        info!(
            "MAILREQ {}: relaying to {} via {}",
            short_id(&uuid),
            forwarded.to_bbs,
            next_hop
        );
        Ok(vec![MailEvent::Send(Outbound::control(
            next_hop,
            forwarded.to_wire(),
        ))])
    }

    /// MAILACK: at the origin, release the data chunks; at a relay, pass it
    /// back toward the origin.
    pub fn handle_ack(&mut self, uuid: &str, sender_node: &str) -> Vec<MailEvent> {
        if let Some(relay) = self.relays.get(uuid) {
            return vec![MailEvent::Send(Outbound::control(
                relay.origin_node.clone(),
                Frame::MailAck {
                    uuid: uuid.to_string(),
                }
                .to_wire(),
            ))];
        }
        let Some(pending) = self.pending.get_mut(uuid) else {
            warn!("MAILACK {}: no pending delivery", short_id(uuid));
            return Vec::new();
        };
        info!(
            "MAILACK {}: sending {} chunk(s) to {}",
            short_id(uuid),
            pending.chunks.len(),
            sender_node
        );
        pending.state = PendingState::AwaitingDlv;
        let total = pending.chunks.len() as u32;
        pending
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                MailEvent::Send(Outbound::mail_chunk(
                    pending.dest_node.clone(),
                    Frame::MailDat {
                        uuid: uuid.to_string(),
                        part: i as u32 + 1,
                        total,
                        data: chunk.clone(),
                    }
                    .to_wire(),
                    uuid,
                ))
            })
            .collect()
    }

    /// MAILNAK: relays propagate it toward the origin unchanged; the
    /// origin reports the reason to the sending user.
    pub fn handle_nak(&mut self, store: &Store, uuid: &str, reason: NakReason) -> Vec<MailEvent> {
        if let Some(relay) = self.relays.remove(uuid) {
            return vec![MailEvent::Send(Outbound::control(
                relay.origin_node,
                Frame::MailNak {
                    uuid: uuid.to_string(),
                    reason,
                }
                .to_wire(),
            ))];
        }
        let Some(pending) = self.pending.remove(uuid) else {
            return Vec::new();
        };
        warn!(
            "MAILNAK {} for {}: {}",
            short_id(uuid),
            pending.recipient,
            reason.code()
        );
        let _ = store.mark_delivery_failed(uuid, reason.code());
        vec![MailEvent::NotifyUser {
            username: pending.sender,
            text: format!("Mail to {}: {}", pending.recipient, reason.describe()),
        }]
    }

    /// MAILDAT: relays forward the opaque chunk; the terminal buffers it
    /// and delivers once complete.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_dat(
        &mut self,
        store: &Store,
        keys: &KeyRing,
        uuid: &str,
        part: u32,
        total: u32,
        data: &str,
        now_us: i64,
    ) -> Result<Vec<MailEvent>, DeliveryError> {
        if let Some(relay) = self.relays.get(uuid) {
            return Ok(vec![MailEvent::Send(Outbound::mail_chunk(
                relay.dest_node.clone(),
                Frame::MailDat {
                    uuid: uuid.to_string(),
                    part,
                    total,
                    data: data.to_string(),
                }
                .to_wire(),
                uuid,
            ))]);
        }
        let Some(incoming) = self.incoming.get_mut(uuid) else {
            warn!("MAILDAT {}: no reassembly buffer", short_id(uuid));
            return Ok(Vec::new());
        };
        incoming.parts.insert(part, data.to_string());
        if (incoming.parts.len() as u32) < incoming.num_parts {
            return Ok(Vec::new());
        }
        let incoming = self.incoming.remove(uuid).expect("buffer present");
        self.deliver_local(store, keys, uuid, incoming, now_us)
    }

    /// All parts arrived at the terminal: encrypt under the recipient's
    /// key, store, confirm, and notify the recipient.
    fn deliver_local(
        &mut self,
        store: &Store,
        keys: &KeyRing,
        uuid: &str,
        incoming: IncomingMail,
        now_us: i64,
    ) -> Result<Vec<MailEvent>, DeliveryError> {
        let mut body = String::new();
        for i in 1..=incoming.num_parts {
            match incoming.parts.get(&i) {
                Some(part) => body.push_str(part),
                None => return Ok(Vec::new()),
            }
        }
        let Some(recipient) = store.get_user(&incoming.to_user)? else {
            return Ok(vec![nak(&incoming.sender_node, uuid, NakReason::NoUser)]);
        };
        let user_key = keys.unwrap(&recipient.wrapped_key)?;
        let body_enc = crypto::encrypt_message(&user_key, &body, uuid, now_us)?;
        let sender_tag = format!("{}@{}", incoming.from_user, incoming.from_bbs);

        let inserted = store.insert_message(Message {
            schema_version: crate::storage::MESSAGE_SCHEMA_VERSION,
            uuid: uuid.to_string(),
            kind: MessageKind::Mail,
            sender: Some(sender_tag.clone()),
            recipient: Some(recipient.username.clone()),
            board: None,
            author: None,
            origin_bbs: incoming.from_bbs.clone(),
            subject_enc: None,
            body_enc,
            created_at_us: now_us,
            delivered_at_us: Some(now_us),
            read_at_us: None,
            expires_at_us: None,
            delivery_attempts: 0,
            last_attempt_us: None,
            forwarded_to: None,
            hop_count: 0,
        })?;
        store.log_sync(SyncLogEntry {
            message_uuid: uuid.to_string(),
            peer_node: incoming.sender_node.clone(),
            direction: SyncDirection::Received,
            status: SyncStatus::Acked,
            attempts: 1,
            last_attempt_us: now_us,
        })?;
        info!(
            "delivered remote mail {} from {} to {} ({:?})",
            short_id(uuid),
            sender_tag,
            recipient.username,
            inserted
        );

        let dest = format!("{}@{}", recipient.username, self.my_callsign);
        Ok(vec![
            MailEvent::Send(Outbound::control(
                incoming.sender_node,
                Frame::MailDlv {
                    uuid: uuid.to_string(),
                    dest,
                }
                .to_wire(),
            )),
            MailEvent::NotifyUser {
                username: recipient.username,
                text: format!("[MAIL] From: {}. DM !mail to check.", sender_tag),
            },
        ])
    }

    /// MAILDLV: relays pass it back; the origin marks the mail delivered.
    pub fn handle_dlv(&mut self, store: &Store, uuid: &str, dest: &str, now_us: i64) -> Vec<MailEvent> {
        if let Some(relay) = self.relays.remove(uuid) {
            return vec![MailEvent::Send(Outbound::control(
                relay.origin_node,
                Frame::MailDlv {
                    uuid: uuid.to_string(),
                    dest: dest.to_string(),
                }
                .to_wire(),
            ))];
        }
        let Some(pending) = self.pending.remove(uuid) else {
            return Vec::new();
        };
        info!("MAILDLV {}: delivered to {}", short_id(uuid), dest);
        let _ = store.mark_delivered(uuid, dest, now_us);
        vec![MailEvent::NotifyUser {
            username: pending.sender,
            text: format!("Mail to {} delivered.", pending.recipient),
        }]
    }
}

fn nak(to: &str, uuid: &str, reason: NakReason) -> MailEvent {
    MailEvent::Send(Outbound::control(
        to,
        Frame::MailNak {
            uuid: uuid.to_string(),
            reason,
        }
        .to_wire(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RapConfig;
    use crate::crypto::generate_key;
    use crate::storage::{Peer, PeerHealth, StoreBuilder, PEER_SCHEMA_VERSION, SALT_LEN};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Store {
        StoreBuilder::new(dir.path().join("db")).open().unwrap()
    }

    fn add_peer(store: &Store, node: &str, callsign: &str) {
        store
            .put_peer(Peer {
                schema_version: PEER_SCHEMA_VERSION,
                node_id: node.to_string(),
                callsign: callsign.to_string(),
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

    fn add_user(store: &Store, keys: &KeyRing, name: &str) -> [u8; 32] {
        let user_key = generate_key();
        store
            .create_user(crate::storage::User {
                schema_version: crate::storage::USER_SCHEMA_VERSION,
                username: name.to_string(),
                password_hash: "$argon2id$stub".to_string(),
                password_salt: [0u8; SALT_LEN],
                wrapped_key: keys.wrap(&user_key).unwrap(),
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

    fn engine(callsign: &str) -> (MailEngine, RapEngine) {
        let config = SyncConfig::default();
        (
            MailEngine::new(callsign.to_string(), config, 150),
            RapEngine::new(callsign.to_string(), RapConfig::default(), 5),
        )
    }

    fn sends(events: &[MailEvent]) -> Vec<&Outbound> {
        events
            .iter()
            .filter_map(|e| match e {
                MailEvent::Send(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn origin_emits_mailreq_with_self_route() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        add_peer(&store, "!b1", "B1");
        let (mut mail, rap) = engine("B0");

        let (uuid, events) = mail
            .send_remote_mail(&store, &rap, "alice", "bob", "b1", "hi", 0)
            .unwrap();
        let out = sends(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, "!b1");
        assert_eq!(
            out[0].frame,
            format!("MAILREQ|{}|alice|B0|bob|B1|1|1|B0", uuid)
        );
        assert_eq!(mail.pending_count(), 1);
    }

    #[test]
    fn body_over_limit_rejected_before_any_frame() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        add_peer(&store, "!b1", "B1");
        let (mut mail, rap) = engine("B0");
        let long = "x".repeat(451);
        assert!(matches!(
            mail.send_remote_mail(&store, &rap, "alice", "bob", "B1", &long, 0),
            Err(DeliveryError::RemoteBodyTooLong(450))
        ));
        assert_eq!(mail.pending_count(), 0);
    }

    #[test]
    fn no_route_fails_locally() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (mut mail, rap) = engine("B0");
        assert!(matches!(
            mail.send_remote_mail(&store, &rap, "alice", "bob", "NOPE", "hi", 0),
            Err(DeliveryError::NoRouteToBbs(_))
        ));
    }

    #[test]
    fn loop_in_route_naks_even_at_hop_one() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (mut mail, rap) = engine("B1");
        let req = MailReq {
            uuid: "u-loop".to_string(),
            from_user: "a".to_string(),
            from_bbs: "B0".to_string(),
            to_user: "b".to_string(),
            to_bbs: "B9".to_string(),
            hop: 1,
            num_parts: 1,
            route: vec!["B0".to_string(), "B1".to_string()],
        };
        let events = mail.handle_req(&store, &rap, req, "!b0", 0).unwrap();
        let out = sends(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].frame, "MAILNAK|u-loop|LOOP");
        assert_eq!(out[0].to, "!b0");
    }

    #[test]
    fn hop_boundary_relay_naks_terminal_accepts() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        add_peer(&store, "!b9", "B9");
        let keys = KeyRing::from_key(generate_key());
        add_user(&store, &keys, "bob");
        let (mut mail, rap) = engine("B1");

        // hop == max_hops at a relay: would need hop 6 downstream.
        let relay_req = MailReq {
            uuid: "u-relay".to_string(),
            from_user: "a".to_string(),
            from_bbs: "B0".to_string(),
            to_user: "x".to_string(),
            to_bbs: "B9".to_string(),
            hop: 5,
            num_parts: 1,
            route: vec!["B0".to_string()],
        };
        let events = mail.handle_req(&store, &rap, relay_req, "!b0", 0).unwrap();
        assert_eq!(sends(&events)[0].frame, "MAILNAK|u-relay|MAXHOPS");

        // Same hop count addressed to us: accepted.
        let term_req = MailReq {
            uuid: "u-term".to_string(),
            from_user: "a".to_string(),
            from_bbs: "B0".to_string(),
            to_user: "bob".to_string(),
            to_bbs: "B1".to_string(),
            hop: 5,
            num_parts: 1,
            route: vec!["B0".to_string()],
        };
        let events = mail.handle_req(&store, &rap, term_req, "!b0", 0).unwrap();
        assert_eq!(sends(&events)[0].frame, "MAILACK|u-term|OK");
    }

    #[test]
    fn unknown_recipient_naks_nouser() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (mut mail, rap) = engine("B1");
        let req = MailReq {
            uuid: "u-x".to_string(),
            from_user: "a".to_string(),
            from_bbs: "B0".to_string(),
            to_user: "ghost".to_string(),
            to_bbs: "B1".to_string(),
            hop: 1,
            num_parts: 1,
            route: vec!["B0".to_string()],
        };
        let events = mail.handle_req(&store, &rap, req, "!b0", 0).unwrap();
        assert_eq!(sends(&events)[0].frame, "MAILNAK|u-x|NOUSER");
    }

    #[test]
    fn relay_grows_route_and_shuttles_responses() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        add_peer(&store, "!b2", "B2");
        let (mut mail, rap) = engine("B1");

        let req = MailReq {
            uuid: "u-r".to_string(),
            from_user: "a".to_string(),
            from_bbs: "B0".to_string(),
            to_user: "c".to_string(),
            to_bbs: "B2".to_string(),
            hop: 1,
            num_parts: 2,
            route: vec!["B0".to_string()],
        };
        let events = mail.handle_req(&store, &rap, req, "!b0", 0).unwrap();
        let out = sends(&events);
        assert_eq!(out[0].to, "!b2");
        assert_eq!(out[0].frame, "MAILREQ|u-r|a|B0|c|B2|2|2|B0,B1");

        // Downstream ACK flows back to the origin node.
        let events = mail.handle_ack("u-r", "!b2");
        let out = sends(&events);
        assert_eq!(out[0].to, "!b0");
        assert_eq!(out[0].frame, "MAILACK|u-r|OK");

        // Chunks flow downstream unchanged.
        let keys = KeyRing::from_key(generate_key());
        let events = mail
            .handle_dat(&store, &keys, "u-r", 1, 2, "chunk-one", 10)
            .unwrap();
        let out = sends(&events);
        assert_eq!(out[0].to, "!b2");
        assert!(out[0].frame.starts_with("MAILDAT|u-r|1/2|chunk-one"));
        assert!(out[0].await_ack);

        // Terminal DLV flows back and clears the relay entry.
        let events = mail.handle_dlv(&store, "u-r", "c@B2", 20);
        let out = sends(&events);
        assert_eq!(out[0].to, "!b0");
        assert_eq!(mail.relays.len(), 0);
    }

    #[test]
    fn terminal_delivery_encrypts_and_confirms() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let keys = KeyRing::from_key(generate_key());
        let bob_key = add_user(&store, &keys, "bob");
        let (mut mail, rap) = engine("B4");

        let req = MailReq {
            uuid: "u-d".to_string(),
            from_user: "alice".to_string(),
            from_bbs: "B0".to_string(),
            to_user: "bob".to_string(),
            to_bbs: "B4".to_string(),
            hop: 4,
            num_parts: 2,
            route: vec!["B0".to_string(), "B1".to_string()],
        };
        mail.handle_req(&store, &rap, req, "!b3", 0).unwrap();

        assert!(mail
            .handle_dat(&store, &keys, "u-d", 1, 2, "hello ", 100)
            .unwrap()
            .is_empty());
        let events = mail
            .handle_dat(&store, &keys, "u-d", 2, 2, "world", 200)
            .unwrap();
        let out = sends(&events);
        assert_eq!(out[0].to, "!b3");
        assert_eq!(out[0].frame, "MAILDLV|u-d|OK|bob@B4");
        assert!(events
            .iter()
            .any(|e| matches!(e, MailEvent::NotifyUser { username, .. } if username == "bob")));

        let stored = store.get_message("u-d").unwrap().unwrap();
        assert_eq!(stored.origin_bbs, "B0");
        assert_eq!(stored.sender.as_deref(), Some("alice@B0"));
        // Body is ciphertext the recipient's key can open.
        assert_ne!(stored.body_enc, b"hello world");
        let plain =
            crypto::decrypt_message(&bob_key, &stored.body_enc, "u-d", stored.created_at_us)
                .unwrap();
        assert_eq!(plain, "hello world");
    }

    #[test]
    fn replayed_req_for_stored_mail_gets_dlv() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let keys = KeyRing::from_key(generate_key());
        add_user(&store, &keys, "bob");
        let (mut mail, rap) = engine("B4");

        let req = MailReq {
            uuid: "u-d".to_string(),
            from_user: "alice".to_string(),
            from_bbs: "B0".to_string(),
            to_user: "bob".to_string(),
            to_bbs: "B4".to_string(),
            hop: 1,
            num_parts: 1,
            route: vec!["B0".to_string()],
        };
        mail.handle_req(&store, &rap, req.clone(), "!b0", 0).unwrap();
        mail.handle_dat(&store, &keys, "u-d", 1, 1, "hi", 1).unwrap();

        let events = mail.handle_req(&store, &rap, req, "!b0", 10).unwrap();
        assert_eq!(sends(&events)[0].frame, "MAILDLV|u-d|OK|bob@B4");
    }

    #[test]
    fn ack_timeout_retries_then_fails() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        add_peer(&store, "!b1", "B1");
        let (mut mail, rap) = engine("B0");
        let (_uuid, _) = mail
            .send_remote_mail(&store, &rap, "alice", "bob", "B1", "hi", 0)
            .unwrap();

        const S: i64 = 1_000_000;
        // Before the 30 s ACK window nothing happens.
        assert!(mail.retry_sweep(&store, 29 * S).is_empty());
        // Attempt 2 at 30 s, next due 60 s later.
        assert_eq!(sends(&mail.retry_sweep(&store, 31 * S)).len(), 1);
        assert!(mail.retry_sweep(&store, 60 * S).is_empty());
        // Attempt 3.
        assert_eq!(sends(&mail.retry_sweep(&store, 92 * S)).len(), 1);
        // Cap reached: the next due sweep fails the delivery.
        let events = mail.retry_sweep(&store, 300 * S);
        assert!(events
            .iter()
            .any(|e| matches!(e, MailEvent::NotifyUser { username, .. } if username == "alice")));
        assert_eq!(mail.pending_count(), 0);
    }

    #[test]
    fn nak_at_origin_reports_reason() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        add_peer(&store, "!b1", "B1");
        let (mut mail, rap) = engine("B0");
        let (uuid, _) = mail
            .send_remote_mail(&store, &rap, "alice", "ghost", "B1", "hi", 0)
            .unwrap();
        let events = mail.handle_nak(&store, &uuid, NakReason::NoUser);
        match &events[0] {
            MailEvent::NotifyUser { username, text } => {
                assert_eq!(username, "alice");
                assert!(text.contains("no such user"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(mail.pending_count(), 0);
    }

    #[test]
    fn pending_expiry_sweep_fails_delivery() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        add_peer(&store, "!b1", "B1");
        let (mut mail, rap) = engine("B0");
        mail.send_remote_mail(&store, &rap, "alice", "bob", "B1", "hi", 0)
            .unwrap();
        const S: i64 = 1_000_000;
        assert!(mail.expire_sweep(&store, 599 * S).is_empty());
        let events = mail.expire_sweep(&store, 601 * S);
        assert!(!events.is_empty());
        assert_eq!(mail.pending_count(), 0);
    }

    #[test]
    fn peer_alive_makes_pending_immediately_retryable() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        add_peer(&store, "!b1", "B1");
        let (mut mail, rap) = engine("B0");
        mail.send_remote_mail(&store, &rap, "alice", "bob", "B1", "hi", 0)
            .unwrap();
        assert!(mail.retry_sweep(&store, 1).is_empty());
        mail.peer_alive("!b1");
        assert_eq!(sends(&mail.retry_sweep(&store, 1)).len(), 1);
    }
}
