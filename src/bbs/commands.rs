//! Command handlers.
//!
//! Every handler takes the shared [`CommandContext`], the caller's
//! session, and the raw argument string, and returns a [`Reply`]: an
//! optional text answer for the sender plus any federation events and
//! broadcasts the command produced. Handlers never touch the transport.

use log::{info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use crate::bbs::session::{LoginGuard, ReplyKind, Session};
use crate::config::Config;
use crate::crypto::{self, Crypto, KeyRing};
use crate::logutil::escape_log;
use crate::storage::{
    BanRecord, Board, BoardKind, Message, MessageKind, Store, BOARD_SCHEMA_VERSION,
    MESSAGE_SCHEMA_VERSION, USER_SCHEMA_VERSION,
};
use crate::sync::boards::BoardSyncEngine;
use crate::sync::mail::{MailEngine, MailEvent};
use crate::sync::rap::RapEngine;
use crate::validation::{sanitize_content, validate_board_name, validate_username};

/// Longest accepted local mail or post body, pre-encryption.
const LOCAL_BODY_MAX: usize = 1000;
const MIN_PASSWORD_LEN: usize = 8;
const LIST_PAGE_SIZE: usize = 5;

pub struct CommandContext<'a> {
    pub config: &'a Config,
    pub store: &'a Store,
    pub crypto: &'a Crypto,
    pub keys: &'a KeyRing,
    pub rap: &'a RapEngine,
    pub mail: &'a mut MailEngine,
    pub boards: &'a mut BoardSyncEngine,
    pub guard: &'a mut LoginGuard,
    /// Usernames with an active session, for `!who`.
    pub active_users: Vec<String>,
    pub now_us: i64,
}

/// What a handler produced.
#[derive(Debug, Default)]
pub struct Reply {
    pub text: Option<String>,
    pub events: Vec<MailEvent>,
    /// Channel broadcast (channel, text).
    pub broadcast: Option<(u8, String)>,
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Reply {
            text: Some(s.into()),
            ..Default::default()
        }
    }

    pub fn none() -> Self {
        Reply::default()
    }

    fn with_events(s: impl Into<String>, events: Vec<MailEvent>) -> Self {
        Reply {
            text: Some(s.into()),
            events,
            broadcast: None,
        }
    }
}

/// Execute a resolved command. `name` is the canonical command name from
/// the dispatch table.
pub fn run(ctx: &mut CommandContext<'_>, session: &mut Session, name: &str, args: &str) -> Reply {
    let result = match name {
        "bbs" | "help" => Ok(cmd_help(session)),
        "info" => cmd_info(ctx),
        "register" => cmd_register(ctx, session, args),
        "login" => cmd_login(ctx, session, args),
        "logout" => Ok(cmd_logout(session)),
        "passwd" => cmd_passwd(ctx, session, args),
        "addnode" => cmd_addnode(ctx, session, args),
        "rmnode" => cmd_rmnode(ctx, session, args),
        "nodes" => cmd_nodes(ctx, session),
        "send" => cmd_send(ctx, session, args),
        "mail" => cmd_mail(ctx, session),
        "sent" => cmd_sent(ctx, session),
        "read" => cmd_read(ctx, session, args),
        "reply" => cmd_reply(ctx, session, args),
        "forward" => cmd_forward(ctx, session, args),
        "delete" => cmd_delete(ctx, session, args),
        "board" => cmd_board(ctx, session, args),
        "list" => cmd_list(ctx, session, args),
        "post" => cmd_post(ctx, session, args),
        "quit" => Ok(cmd_quit(session)),
        "peers" => cmd_peers(ctx),
        "who" => Ok(cmd_who(ctx)),
        "ban" => cmd_ban(ctx, session, args),
        "unban" => cmd_unban(ctx, args),
        "mkboard" => cmd_mkboard(ctx, session, args),
        "rmboard" => cmd_rmboard(ctx, args),
        "syncboard" => cmd_syncboard(ctx, args),
        "grant" => cmd_grant(ctx, args),
        "revoke" => cmd_revoke(ctx, args),
        "announce" => cmd_announce(ctx, args),
        "recover" => cmd_recover(ctx, args),
        other => {
            warn!("dispatch table references unknown handler '{}'", other);
            Ok(Reply::text("Unknown command."))
        }
    };
    result.unwrap_or_else(|e| {
        warn!("command '{}' failed: {:#}", name, e);
        Reply::text("Error processing command.")
    })
}

type CmdResult = anyhow::Result<Reply>;

fn cmd_help(session: &Session) -> Reply {
    let text = if session.is_admin {
        "Admin: !ban !unban !mkboard !rmboard !syncboard !grant !revoke !announce !recover\n\
         Plus all user commands. !bbs for the user list."
    } else if session.is_logged_in() {
        "Mail: !send user[@BBS] msg, !mail, !read n, !reply n msg, !fwd n user, !d n, !sent\n\
         Boards: !board [name], !list, !post text, !quit\n\
         Account: !passwd, !addnode, !rmnode, !nodes, !logout | !peers !info"
    } else {
        "!register user pass - new account\n\
         !login user pass | !board [name] - browse boards\n\
         !peers !info | Commands start with !"
    };
    Reply::text(text)
}

fn cmd_info(ctx: &mut CommandContext<'_>) -> CmdResult {
    let users = ctx.store.user_count()?;
    let boards = ctx.store.list_boards()?.len();
    let peers = ctx.store.list_peers()?.len();
    Ok(Reply::text(format!(
        "{} [{}] | users {} | boards {} | peers {}\n{}",
        ctx.config.bbs.name, ctx.config.bbs.callsign, users, boards, peers, ctx.config.bbs.motd
    )))
}

// -- account ----------------------------------------------------------------

fn cmd_register(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    let mut parts = args.split_whitespace();
    let (Some(name), Some(password)) = (parts.next(), parts.next()) else {
        return Ok(Reply::text("Usage: !register <user> <pass>"));
    };
    if !ctx.guard.allow_attempt(&session.node_id, ctx.now_us) {
        return Ok(Reply::text("Too many attempts. Wait a minute."));
    }
    let username = match validate_username(name) {
        Ok(u) => u,
        Err(e) => return Ok(Reply::text(format!("Invalid username: {}", e))),
    };
    if password.len() < MIN_PASSWORD_LEN {
        return Ok(Reply::text("Password too short (min 8 characters)."));
    }
    if ctx.store.get_user(&username)?.is_some() {
        return Ok(Reply::text(format!("Username '{}' is taken.", username)));
    }

    // Fresh user key, wrapped under the master key (so this station can
    // encrypt inbound federated mail for them) and under their password.
    let user_key = crypto::generate_key();
    let password_salt = crypto::generate_salt();
    let password_key = ctx.crypto.derive_key(password.as_bytes(), &password_salt)?;
    let user = crate::storage::User {
        schema_version: USER_SCHEMA_VERSION,
        username: username.clone(),
        password_hash: ctx.crypto.hash_password(password)?,
        password_salt,
        wrapped_key: ctx.keys.wrap(&user_key)?,
        wrapped_key_pw: crypto::wrap_key(&password_key, &user_key)?,
        created_at_us: ctx.now_us,
        last_seen_us: ctx.now_us,
        is_admin: ctx.store.user_count()? == 0,
        must_change_password: false,
        ban: None,
    };
    let is_admin = user.is_admin;
    ctx.store.create_user(user)?;
    // Registration atomically binds the registering node as primary.
    ctx.store
        .add_binding(&username, &session.node_id, true, ctx.now_us)?;

    info!(
        target: "security",
        "registered user {} from node {}{}",
        username,
        session.node_id,
        if is_admin { " (first user, admin)" } else { "" }
    );
    session.login(username.clone(), is_admin, false, ctx.now_us);
    Ok(Reply::text(format!(
        "Welcome, {}! This device is now your primary node.{}",
        username,
        if is_admin { " You are the admin." } else { "" }
    )))
}

fn cmd_login(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    let mut parts = args.split_whitespace();
    let (Some(name), Some(password)) = (parts.next(), parts.next()) else {
        return Ok(Reply::text("Usage: !login <user> <pass>"));
    };
    if !ctx.guard.allow_attempt(&session.node_id, ctx.now_us) {
        return Ok(Reply::text("Too many attempts. Wait a minute."));
    }
    let username = name.to_lowercase();
    if ctx.guard.is_locked_out(&username, ctx.now_us) {
        warn!(target: "security", "login while locked out: {} from {}", username, session.node_id);
        return Ok(Reply::text("Account temporarily locked. Try later."));
    }
    let Some(mut user) = ctx.store.get_user(&username)? else {
        ctx.guard.record_failure(&username, ctx.now_us);
        return Ok(Reply::text("Invalid credentials."));
    };
    if let Some(ban) = &user.ban {
        warn!(target: "security", "banned user {} attempted login: {}", username, ban.reason);
        return Ok(Reply::text("This account is banned."));
    }
    if !ctx.crypto.verify_password(password, &user.password_hash) {
        ctx.guard.record_failure(&username, ctx.now_us);
        warn!(target: "security", "bad password for {} from {}", username, session.node_id);
        return Ok(Reply::text("Invalid credentials."));
    }
    // Second factor: the sending radio must be one of the user's nodes.
    if !ctx.store.user_bound_to_node(&username, &session.node_id)? {
        warn!(
            target: "security",
            "login for {} from unbound node {}", username, session.node_id
        );
        return Ok(Reply::text(
            "This device is not registered to that account. Use !addnode from a bound device.",
        ));
    }
    ctx.guard.record_success(&username);
    user.last_seen_us = ctx.now_us;
    let is_admin = user.is_admin;
    let must_change = user.must_change_password;
    ctx.store.put_user(user)?;
    session.login(username.clone(), is_admin, must_change, ctx.now_us);

    if must_change {
        // Recovery login: nothing else works until a real password is set.
        return Ok(Reply::text(format!(
            "Hello {}. Your password is temporary; set a new one now: \
             !passwd <temp> <new>. Other commands are locked until then.",
            username
        )));
    }
    let unread = ctx.store.count_unread_mail(&username)?;
    Ok(Reply::text(format!(
        "Hello {}! {} unread message(s).",
        username, unread
    )))
}

fn cmd_logout(session: &mut Session) -> Reply {
    if !session.is_logged_in() {
        return Reply::text("Not logged in.");
    }
    info!("logout {}", session.display_name());
    session.logout();
    Reply::text("Logged out. 73!")
}

fn cmd_passwd(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    let mut parts = args.split_whitespace();
    let (Some(old), Some(new)) = (parts.next(), parts.next()) else {
        return Ok(Reply::text("Usage: !passwd <old> <new>"));
    };
    let username = session.display_name().to_string();
    let Some(mut user) = ctx.store.get_user(&username)? else {
        return Ok(Reply::text("Account not found."));
    };
    if !ctx.crypto.verify_password(old, &user.password_hash) {
        return Ok(Reply::text("Current password incorrect."));
    }
    if new.len() < MIN_PASSWORD_LEN {
        return Ok(Reply::text("New password too short (min 8 characters)."));
    }
    // Rewrap the password-derived copy of the user key under the new
    // password; the master-wrapped copy is untouched.
    let user_key = ctx.keys.unwrap(&user.wrapped_key)?;
    let new_salt = crypto::generate_salt();
    let new_key = ctx.crypto.derive_key(new.as_bytes(), &new_salt)?;
    user.password_hash = ctx.crypto.hash_password(new)?;
    user.password_salt = new_salt;
    user.wrapped_key_pw = crypto::wrap_key(&new_key, &user_key)?;
    user.must_change_password = false;
    ctx.store.put_user(user)?;
    session.must_change_password = false;
    info!(target: "security", "password changed for {}", username);
    Ok(Reply::text("Password changed."))
}

fn cmd_addnode(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    let node_id = args.trim();
    if node_id.is_empty() {
        return Ok(Reply::text("Usage: !addnode <node_id>"));
    }
    let username = session.display_name().to_string();
    match ctx
        .store
        .add_binding(&username, node_id, false, ctx.now_us)
    {
        Ok(()) => {
            info!(target: "security", "node {} bound to {}", node_id, username);
            Ok(Reply::text(format!("Node {} added to your account.", node_id)))
        }
        Err(crate::storage::StorageError::Conflict(msg)) => Ok(Reply::text(msg)),
        Err(e) => Err(e.into()),
    }
}

fn cmd_rmnode(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    let node_id = args.trim();
    if node_id.is_empty() {
        return Ok(Reply::text("Usage: !rmnode <node_id>"));
    }
    if node_id == session.node_id {
        return Ok(Reply::text(
            "Cannot remove the device you are using. Switch devices first.",
        ));
    }
    let username = session.display_name().to_string();
    match ctx.store.remove_binding(&username, node_id) {
        Ok(()) => Ok(Reply::text(format!("Node {} removed.", node_id))),
        Err(crate::storage::StorageError::Conflict(msg))
        | Err(crate::storage::StorageError::NotFound(msg)) => Ok(Reply::text(msg)),
        Err(e) => Err(e.into()),
    }
}

fn cmd_nodes(ctx: &mut CommandContext<'_>, session: &mut Session) -> CmdResult {
    let bindings = ctx.store.bindings_for_user(session.display_name())?;
    let lines: Vec<String> = bindings
        .iter()
        .map(|b| {
            format!(
                "{}{}",
                b.node_id,
                if b.primary { " (primary)" } else { "" }
            )
        })
        .collect();
    Ok(Reply::text(format!("Your nodes:\n{}", lines.join("\n"))))
}

// -- mail -------------------------------------------------------------------

/// Split `user[@BBS] message` addressing.
fn parse_dest(args: &str) -> Option<(&str, Option<&str>, &str)> {
    let (dest, body) = args.split_once(char::is_whitespace)?;
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    match dest.split_once('@') {
        Some((user, bbs)) => Some((user, Some(bbs), body)),
        None => Some((dest, None, body)),
    }
}

fn cmd_send(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    let Some((to_user, to_bbs, body)) = parse_dest(args) else {
        return Ok(Reply::text("Usage: !send <user[@BBS]> <message>"));
    };
    let sender = session.display_name().to_string();
    let my_callsign = &ctx.config.bbs.callsign;

    match to_bbs {
        Some(bbs) if !bbs.eq_ignore_ascii_case(my_callsign) => {
            send_remote(ctx, &sender, to_user, bbs, body)
        }
        _ => send_local(ctx, &sender, to_user, body),
    }
}

fn send_local(
    ctx: &mut CommandContext<'_>,
    sender: &str,
    to_user: &str,
    body: &str,
) -> CmdResult {
    let body = match sanitize_content(body, LOCAL_BODY_MAX) {
        Ok(b) => b,
        Err(e) => return Ok(Reply::text(format!("Invalid message: {}", e))),
    };
    let recipient_name = to_user.to_lowercase();
    let Some(recipient) = ctx.store.get_user(&recipient_name)? else {
        return Ok(Reply::text(format!("User '{}' not found.", recipient_name)));
    };
    if recipient.ban.is_some() {
        return Ok(Reply::text("Cannot send mail to that user."));
    }
    if recipient.username == sender {
        return Ok(Reply::text("Cannot send mail to yourself."));
    }
    let recipient_key = ctx.keys.unwrap(&recipient.wrapped_key)?;
    let uuid = Uuid::new_v4().to_string();
    let expires =
        ctx.now_us + ctx.config.bbs.max_message_age_days as i64 * 86_400 * 1_000_000;
    ctx.store.insert_message(Message {
        schema_version: MESSAGE_SCHEMA_VERSION,
        uuid: uuid.clone(),
        kind: MessageKind::Mail,
        sender: Some(sender.to_string()),
        recipient: Some(recipient.username.clone()),
        board: None,
        author: None,
        origin_bbs: ctx.config.bbs.callsign.clone(),
        subject_enc: None,
        body_enc: crypto::encrypt_message(&recipient_key, &body, &uuid, ctx.now_us)?,
        created_at_us: ctx.now_us,
        delivered_at_us: Some(ctx.now_us),
        read_at_us: None,
        expires_at_us: Some(expires),
        delivery_attempts: 0,
        last_attempt_us: None,
        forwarded_to: None,
        hop_count: 0,
    })?;
    info!("mail {} -> {}", sender, recipient.username);
    Ok(Reply::with_events(
        format!("Mail sent to {}.", recipient.username),
        vec![MailEvent::NotifyUser {
            username: recipient.username,
            text: format!("[MAIL] From: {}. DM !mail to check.", sender),
        }],
    ))
}

fn send_remote(
    ctx: &mut CommandContext<'_>,
    sender: &str,
    to_user: &str,
    to_bbs: &str,
    body: &str,
) -> CmdResult {
    // Pipes never cross the federation link inside positional frames.
    let body = match sanitize_content(body, ctx.config.sync.remote_body_max) {
        Ok(b) => crate::validation::escape_pipes(&b),
        Err(e) => return Ok(Reply::text(format!("Invalid message: {}", e))),
    };
    let (uuid, events) = match ctx.mail.send_remote_mail(
        ctx.store,
        ctx.rap,
        sender,
        to_user,
        to_bbs,
        &body,
        ctx.now_us,
    ) {
        Ok(r) => r,
        Err(e) => return Ok(Reply::text(format!("Cannot send: {}", e))),
    };

    // Keep a sender-side record, encrypted under the sender's own key so
    // `!sent` and future reads work without storing plaintext.
    let sender_row = ctx.store.get_user(sender)?;
    if let Some(user) = sender_row {
        let sender_key = ctx.keys.unwrap(&user.wrapped_key)?;
        ctx.store.insert_message(Message {
            schema_version: MESSAGE_SCHEMA_VERSION,
            uuid: uuid.clone(),
            kind: MessageKind::Mail,
            sender: Some(sender.to_string()),
            recipient: None,
            board: None,
            author: None,
            origin_bbs: ctx.config.bbs.callsign.clone(),
            subject_enc: None,
            body_enc: crypto::encrypt_message(&sender_key, &body, &uuid, ctx.now_us)?,
            created_at_us: ctx.now_us,
            delivered_at_us: None,
            read_at_us: None,
            expires_at_us: None,
            delivery_attempts: 1,
            last_attempt_us: Some(ctx.now_us),
            forwarded_to: Some(format!("{}@{}", to_user, to_bbs.to_uppercase())),
            hop_count: 1,
        })?;
    }
    Ok(Reply::with_events(
        format!("Mail queued for {}@{}.", to_user, to_bbs.to_uppercase()),
        events,
    ))
}

fn cmd_mail(ctx: &mut CommandContext<'_>, session: &mut Session) -> CmdResult {
    let username = session.display_name();
    let unread = ctx.store.count_unread_mail(username)?;
    let total = ctx.store.mail_for_user(username, false, 100, 0)?.len();
    Ok(Reply::text(format!(
        "Inbox: {} message(s), {} unread. !read [n] to read.",
        total, unread
    )))
}

fn cmd_sent(ctx: &mut CommandContext<'_>, session: &mut Session) -> CmdResult {
    let sent = ctx.store.sent_remote_mail(session.display_name(), 10)?;
    if sent.is_empty() {
        return Ok(Reply::text("No outbound remote mail."));
    }
    let lines: Vec<String> = sent
        .iter()
        .map(|m| {
            let to = m
                .forwarded_to
                .as_deref()
                .unwrap_or("?")
                .trim_start_matches("DELIVERED:")
                .trim_start_matches("FAILED:");
            let status = match m.forwarded_to.as_deref() {
                _ if m.delivered_at_us.is_some() => "delivered",
                Some(f) if f.starts_with("FAILED:") => "failed",
                _ => "pending",
            };
            format!("{} {} [{}]", crate::logutil::short_id(&m.uuid), to, status)
        })
        .collect();
    Ok(Reply::text(format!("Sent mail:\n{}", lines.join("\n"))))
}

/// Fetch mail #n for a user (1-based, newest first).
fn nth_mail(ctx: &CommandContext<'_>, username: &str, n: usize) -> anyhow::Result<Option<Message>> {
    Ok(ctx
        .store
        .mail_for_user(username, false, 1, n.saturating_sub(1))?
        .into_iter()
        .next())
}

fn decrypt_mail_body(ctx: &CommandContext<'_>, username: &str, message: &Message) -> anyhow::Result<String> {
    let user = ctx
        .store
        .get_user(username)?
        .ok_or_else(|| anyhow::anyhow!("user vanished"))?;
    let key = ctx.keys.unwrap(&user.wrapped_key)?;
    Ok(crypto::decrypt_message(
        &key,
        &message.body_enc,
        &message.uuid,
        message.created_at_us,
    )?)
}

fn cmd_read(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    if let Some(board) = session.current_board.clone() {
        return read_board_post(ctx, session, &board, args);
    }
    if !session.is_logged_in() {
        return Ok(Reply::text("Login required. !login <user> <pass>"));
    }
    let username = session.display_name().to_string();
    let message = match args.trim().parse::<usize>() {
        Ok(n) if n >= 1 => nth_mail(ctx, &username, n)?,
        _ => ctx
            .store
            .mail_for_user(&username, true, 1, 0)?
            .into_iter()
            .next(),
    };
    let Some(message) = message else {
        return Ok(Reply::text("No such message."));
    };
    let body = decrypt_mail_body(ctx, &username, &message)?;
    let from = message.sender.clone().unwrap_or_else(|| "?".to_string());
    ctx.store.mark_read(&message.uuid, ctx.now_us)?;

    // Plain text in the next five minutes becomes a reply to this sender.
    session.set_reply_context(ReplyKind::MailReply { to: from.clone() }, ctx.now_us);
    Ok(Reply::text(format!("From: {}\n{}", from, body)))
}

fn cmd_reply(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    let Some((n, body)) = args.split_once(char::is_whitespace) else {
        return Ok(Reply::text("Usage: !reply <n> <message>"));
    };
    let Ok(n) = n.trim().parse::<usize>() else {
        return Ok(Reply::text("Usage: !reply <n> <message>"));
    };
    let username = session.display_name().to_string();
    let Some(original) = nth_mail(ctx, &username, n)? else {
        return Ok(Reply::text("No such message."));
    };
    let to = original.sender.unwrap_or_default();
    if to.is_empty() {
        return Ok(Reply::text("Cannot determine who to reply to."));
    }
    cmd_send(ctx, session, &format!("{} {}", to, body.trim()))
}

fn cmd_forward(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    let mut parts = args.split_whitespace();
    let (Some(n), Some(dest)) = (parts.next(), parts.next()) else {
        return Ok(Reply::text("Usage: !forward <n> <user[@BBS]>"));
    };
    let Ok(n) = n.parse::<usize>() else {
        return Ok(Reply::text("Usage: !forward <n> <user[@BBS]>"));
    };
    let username = session.display_name().to_string();
    let Some(original) = nth_mail(ctx, &username, n)? else {
        return Ok(Reply::text("No such message."));
    };
    let body = decrypt_mail_body(ctx, &username, &original)?;
    let from = original.sender.unwrap_or_else(|| "?".to_string());
    cmd_send(ctx, session, &format!("{} Fwd from {}: {}", dest, from, body))
}

fn cmd_delete(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    let Ok(n) = args.trim().parse::<usize>() else {
        return Ok(Reply::text("Usage: !delete <n>"));
    };
    let username = session.display_name().to_string();
    let Some(message) = nth_mail(ctx, &username, n)? else {
        return Ok(Reply::text("No such message."));
    };
    ctx.store.delete_message(&message.uuid)?;
    Ok(Reply::text(format!("Message {} deleted.", n)))
}

// -- boards -----------------------------------------------------------------

fn board_key_for(ctx: &CommandContext<'_>, board: &Board) -> anyhow::Result<[u8; 32]> {
    Ok(ctx.keys.unwrap(&board.wrapped_key)?)
}

fn can_enter_board(ctx: &CommandContext<'_>, session: &Session, board: &Board) -> anyhow::Result<bool> {
    match board.kind {
        BoardKind::Public => Ok(true),
        BoardKind::Restricted => {
            if session.is_admin {
                return Ok(true);
            }
            let Some(username) = &session.username else {
                return Ok(false);
            };
            Ok(ctx.store.board_access_for(&board.name, username)?.is_some())
        }
    }
}

fn cmd_board(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    let name = args.trim().to_lowercase();
    if name.is_empty() {
        let boards = ctx.store.list_boards()?;
        if boards.is_empty() {
            return Ok(Reply::text("No boards yet."));
        }
        let lines: Vec<String> = boards
            .iter()
            .map(|b| {
                let posts = ctx.store.count_board_posts(&b.name).unwrap_or(0);
                format!(
                    "{}{}{} ({})",
                    b.name,
                    if b.synced { "*" } else { "" },
                    if b.kind == BoardKind::Restricted { "#" } else { "" },
                    posts
                )
            })
            .collect();
        return Ok(Reply::text(format!(
            "Boards (* synced, # restricted):\n{}\n!board <name> to enter.",
            lines.join("\n")
        )));
    }

    let Some(board) = ctx.store.get_board(&name)? else {
        return Ok(Reply::text(format!("No board '{}'.", name)));
    };
    // Unauthenticated browsing is allowed only on synced boards.
    if !session.is_logged_in() && !board.synced {
        return Ok(Reply::text("Login required for this board."));
    }
    if !can_enter_board(ctx, session, &board)? {
        return Ok(Reply::text("You don't have access to this board."));
    }
    session.current_board = Some(board.name.clone());
    // Plain text in the next ten minutes posts here.
    if session.is_logged_in() {
        session.set_reply_context(
            ReplyKind::BoardPost {
                board: board.name.clone(),
            },
            ctx.now_us,
        );
    }
    let count = ctx.store.count_board_posts(&board.name)?;
    Ok(Reply::text(format!(
        "[{}] {} - {} post(s). !list to browse, !post <text>, !quit to leave.",
        board.name, board.description, count
    )))
}

fn read_board_post(
    ctx: &mut CommandContext<'_>,
    session: &mut Session,
    board_name: &str,
    args: &str,
) -> CmdResult {
    let Ok(n) = args.trim().parse::<usize>() else {
        return Ok(Reply::text("Usage (in board): !read <n>"));
    };
    let Some(board) = ctx.store.get_board(board_name)? else {
        session.current_board = None;
        return Ok(Reply::text("Board is gone."));
    };
    let Some(post) = ctx
        .store
        .board_posts(&board.name, 1, n.saturating_sub(1), None)?
        .into_iter()
        .next()
    else {
        return Ok(Reply::text("No such post."));
    };
    let key = board_key_for(ctx, &board)?;
    let body = crypto::decrypt_message(&key, &post.body_enc, &post.uuid, post.created_at_us)?;
    let subject = match &post.subject_enc {
        Some(enc) => crypto::decrypt_message(&key, enc, &post.uuid, post.created_at_us)?,
        None => String::new(),
    };
    let author = post.author.unwrap_or_else(|| "?".to_string());
    let header = if subject.is_empty() {
        format!("#{} {}", n, author)
    } else {
        format!("#{} {} - {}", n, author, subject)
    };
    Ok(Reply::text(format!("{}\n{}", header, body)))
}

fn cmd_list(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    let Some(board_name) = session.current_board.clone() else {
        return Ok(Reply::text("Enter a board first: !board <name>"));
    };
    let Some(board) = ctx.store.get_board(&board_name)? else {
        session.current_board = None;
        return Ok(Reply::text("Board is gone."));
    };
    let page = args.trim().parse::<usize>().unwrap_or(1).max(1);
    let offset = (page - 1) * LIST_PAGE_SIZE;
    let posts = ctx.store.board_posts(&board.name, LIST_PAGE_SIZE, offset, None)?;
    if posts.is_empty() {
        return Ok(Reply::text("No posts on this page."));
    }
    let key = board_key_for(ctx, &board)?;
    let mut lines = Vec::new();
    for (i, post) in posts.iter().enumerate() {
        let body = crypto::decrypt_message(&key, &post.body_enc, &post.uuid, post.created_at_us)?;
        let preview: String = body.chars().take(40).collect();
        lines.push(format!(
            "#{} {}: {}",
            offset + i + 1,
            post.author.as_deref().unwrap_or("?"),
            preview
        ));
    }
    Ok(Reply::text(lines.join("\n")))
}

fn cmd_post(ctx: &mut CommandContext<'_>, session: &mut Session, args: &str) -> CmdResult {
    let Some(board_name) = session.current_board.clone() else {
        return Ok(Reply::text("Enter a board first: !board <name>"));
    };
    let Some(board) = ctx.store.get_board(&board_name)? else {
        session.current_board = None;
        return Ok(Reply::text("Board is gone."));
    };
    if !can_enter_board(ctx, session, &board)? {
        return Ok(Reply::text("You don't have access to this board."));
    }
    let body = match sanitize_content(args, LOCAL_BODY_MAX) {
        Ok(b) => b,
        Err(e) => return Ok(Reply::text(format!("Invalid post: {}", e))),
    };
    let key = board_key_for(ctx, &board)?;
    let uuid = Uuid::new_v4().to_string();
    let author = session.display_name().to_string();
    ctx.store.insert_message(Message {
        schema_version: MESSAGE_SCHEMA_VERSION,
        uuid: uuid.clone(),
        kind: MessageKind::Bulletin,
        sender: None,
        recipient: None,
        board: Some(board.name.clone()),
        author: Some(author.clone()),
        origin_bbs: ctx.config.bbs.callsign.clone(),
        subject_enc: None,
        body_enc: crypto::encrypt_message(&key, &body, &uuid, ctx.now_us)?,
        created_at_us: ctx.now_us,
        delivered_at_us: None,
        read_at_us: None,
        expires_at_us: None,
        delivery_attempts: 0,
        last_attempt_us: None,
        forwarded_to: None,
        hop_count: 0,
    })?;
    if board.synced {
        ctx.boards.note_local_post(&board.name);
    }
    info!("post by {} on {}", author, board.name);
    // Keep the posting context alive for follow-up plain text.
    session.set_reply_context(
        ReplyKind::BoardPost {
            board: board.name.clone(),
        },
        ctx.now_us,
    );
    Ok(Reply::text(format!("Posted to {}.", board.name)))
}

fn cmd_quit(session: &mut Session) -> Reply {
    match session.current_board.take() {
        Some(board) => {
            session.reply_context = None;
            Reply::text(format!("Left {}.", board))
        }
        None => Reply::text("Not in a board."),
    }
}

// -- federation visibility --------------------------------------------------

fn cmd_peers(ctx: &mut CommandContext<'_>) -> CmdResult {
    let peers = ctx.store.list_peers()?;
    if peers.is_empty() {
        return Ok(Reply::text("No federation peers configured."));
    }
    let lines: Vec<String> = peers
        .iter()
        .map(|p| {
            format!(
                "{} {:?}{}",
                p.callsign,
                p.health,
                if p.enabled { "" } else { " (disabled)" }
            )
        })
        .collect();
    Ok(Reply::text(format!("Peers:\n{}", lines.join("\n"))))
}

fn cmd_who(ctx: &CommandContext<'_>) -> Reply {
    if ctx.active_users.is_empty() {
        return Reply::text("Nobody else is on.");
    }
    Reply::text(format!("Online: {}", ctx.active_users.join(", ")))
}

// -- admin ------------------------------------------------------------------

fn cmd_ban(ctx: &mut CommandContext<'_>, session: &Session, args: &str) -> CmdResult {
    let mut parts = args.splitn(2, char::is_whitespace);
    let Some(name) = parts.next().filter(|s| !s.is_empty()) else {
        return Ok(Reply::text("Usage: !ban <user> [reason]"));
    };
    let reason = parts.next().unwrap_or("no reason given").trim().to_string();
    let username = name.to_lowercase();
    let Some(mut user) = ctx.store.get_user(&username)? else {
        return Ok(Reply::text(format!("User '{}' not found.", username)));
    };
    if user.is_admin {
        return Ok(Reply::text("Cannot ban an admin."));
    }
    // Bans are strictly local; nothing about them is ever sent to peers.
    user.ban = Some(BanRecord {
        reason: reason.clone(),
        origin: ctx.config.bbs.callsign.clone(),
        actor: session.display_name().to_string(),
        at_us: ctx.now_us,
    });
    ctx.store.put_user(user)?;
    warn!(
        target: "security",
        "{} banned {} ({})", session.display_name(), username, escape_log(&reason)
    );
    Ok(Reply::text(format!("User {} banned.", username)))
}

fn cmd_unban(ctx: &mut CommandContext<'_>, args: &str) -> CmdResult {
    let username = args.trim().to_lowercase();
    if username.is_empty() {
        return Ok(Reply::text("Usage: !unban <user>"));
    }
    let Some(mut user) = ctx.store.get_user(&username)? else {
        return Ok(Reply::text(format!("User '{}' not found.", username)));
    };
    if user.ban.take().is_none() {
        return Ok(Reply::text(format!("{} is not banned.", username)));
    }
    ctx.store.put_user(user)?;
    Ok(Reply::text(format!("User {} unbanned.", username)))
}

fn cmd_mkboard(ctx: &mut CommandContext<'_>, session: &Session, args: &str) -> CmdResult {
    let mut parts = args.splitn(2, char::is_whitespace);
    let Some(raw_name) = parts.next().filter(|s| !s.is_empty()) else {
        return Ok(Reply::text("Usage: !mkboard <name> [private] [description]"));
    };
    let name = match validate_board_name(raw_name) {
        Ok(n) => n,
        Err(e) => return Ok(Reply::text(format!("Invalid board name: {}", e))),
    };
    let rest = parts.next().unwrap_or("").trim();
    let (kind, description) = match rest.strip_prefix("private") {
        Some(desc) => (BoardKind::Restricted, desc.trim().to_string()),
        None => (BoardKind::Public, rest.to_string()),
    };
    let board_key = crypto::generate_key();
    let board = Board {
        schema_version: BOARD_SCHEMA_VERSION,
        name: name.clone(),
        description,
        created_at_us: ctx.now_us,
        synced: false,
        kind,
        wrapped_key: ctx.keys.wrap(&board_key)?,
    };
    match ctx.store.create_board(board) {
        Ok(()) => {
            info!("board '{}' created by {}", name, session.display_name());
            Ok(Reply::text(format!("Board {} created.", name)))
        }
        Err(crate::storage::StorageError::Conflict(msg)) => Ok(Reply::text(msg)),
        Err(e) => Err(e.into()),
    }
}

fn cmd_rmboard(ctx: &mut CommandContext<'_>, args: &str) -> CmdResult {
    let name = args.trim().to_lowercase();
    if name.is_empty() {
        return Ok(Reply::text("Usage: !rmboard <name>"));
    }
    if ctx.store.delete_board(&name)? {
        Ok(Reply::text(format!("Board {} and its posts deleted.", name)))
    } else {
        Ok(Reply::text(format!("No board '{}'.", name)))
    }
}

fn cmd_syncboard(ctx: &mut CommandContext<'_>, args: &str) -> CmdResult {
    let mut parts = args.split_whitespace();
    let (Some(name), Some(state)) = (parts.next(), parts.next()) else {
        return Ok(Reply::text("Usage: !syncboard <name> <on|off>"));
    };
    let synced = match state.to_lowercase().as_str() {
        "on" => true,
        "off" => false,
        _ => return Ok(Reply::text("Usage: !syncboard <name> <on|off>")),
    };
    match ctx.store.set_board_synced(
        &name.to_lowercase(),
        synced,
        ctx.config.sync.boards.max_synced_boards,
    ) {
        Ok(()) => Ok(Reply::text(format!(
            "Board {} sync {}.",
            name,
            if synced { "enabled" } else { "disabled" }
        ))),
        Err(crate::storage::StorageError::Conflict(msg))
        | Err(crate::storage::StorageError::NotFound(msg)) => Ok(Reply::text(msg)),
        Err(e) => Err(e.into()),
    }
}

fn cmd_grant(ctx: &mut CommandContext<'_>, args: &str) -> CmdResult {
    let mut parts = args.split_whitespace();
    let (Some(board_name), Some(user_name)) = (parts.next(), parts.next()) else {
        return Ok(Reply::text("Usage: !grant <board> <user>"));
    };
    let Some(board) = ctx.store.get_board(&board_name.to_lowercase())? else {
        return Ok(Reply::text(format!("No board '{}'.", board_name)));
    };
    if board.kind != BoardKind::Restricted {
        return Ok(Reply::text("That board is public; everyone can read it."));
    }
    let Some(user) = ctx.store.get_user(user_name)? else {
        return Ok(Reply::text(format!("User '{}' not found.", user_name)));
    };
    // Wrap the board key under the grantee's own key so they hold an
    // independent copy.
    let board_key = ctx.keys.unwrap(&board.wrapped_key)?;
    let user_key = ctx.keys.unwrap(&user.wrapped_key)?;
    let wrapped = crypto::wrap_key(&user_key, &board_key)?;
    ctx.store
        .grant_board_access(&board.name, &user.username, wrapped)?;
    Ok(Reply::text(format!(
        "{} granted access to {}.",
        user.username, board.name
    )))
}

fn cmd_revoke(ctx: &mut CommandContext<'_>, args: &str) -> CmdResult {
    let mut parts = args.split_whitespace();
    let (Some(board_name), Some(user_name)) = (parts.next(), parts.next()) else {
        return Ok(Reply::text("Usage: !revoke <board> <user>"));
    };
    if ctx
        .store
        .revoke_board_access(&board_name.to_lowercase(), &user_name.to_lowercase())?
    {
        Ok(Reply::text(format!(
            "{} revoked from {}.",
            user_name, board_name
        )))
    } else {
        Ok(Reply::text("No such grant."))
    }
}

fn cmd_announce(ctx: &mut CommandContext<'_>, args: &str) -> CmdResult {
    let text = args.trim();
    if text.is_empty() {
        return Ok(Reply::text("Usage: !announce <message>"));
    }
    let message = format!("[{}] {}", ctx.config.bbs.name, text);
    Ok(Reply {
        text: Some("Announcement queued.".to_string()),
        events: Vec::new(),
        broadcast: Some((ctx.config.bbs.announcement_channel, message)),
    })
}

fn cmd_recover(ctx: &mut CommandContext<'_>, args: &str) -> CmdResult {
    if !ctx.config.crypto.recovery_enabled {
        return Ok(Reply::text("Recovery is disabled on this station."));
    }
    let username = args.trim().to_lowercase();
    if username.is_empty() {
        return Ok(Reply::text("Usage: !recover <user>"));
    }
    let Some(mut user) = ctx.store.get_user(&username)? else {
        return Ok(Reply::text(format!("User '{}' not found.", username)));
    };
    // The master-wrapped copy lets us rebuild the password wrapping
    // without knowing the old password.
    let user_key = ctx.keys.unwrap(&user.wrapped_key)?;
    let temp_password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    let new_salt = crypto::generate_salt();
    let password_key = ctx.crypto.derive_key(temp_password.as_bytes(), &new_salt)?;
    user.password_hash = ctx.crypto.hash_password(&temp_password)?;
    user.password_salt = new_salt;
    user.wrapped_key_pw = crypto::wrap_key(&password_key, &user_key)?;
    user.must_change_password = true;
    ctx.store.put_user(user)?;
    warn!(target: "security", "account recovery issued for {}", username);
    Ok(Reply::text(format!(
        "Temporary password for {}: {}\nThey must change it at next login.",
        username, temp_password
    )))
}
