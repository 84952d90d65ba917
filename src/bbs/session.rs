//! Per-node session state.
//!
//! A session exists for every node that talks to us and tracks
//! authentication, the board the user is browsing, and short-lived reply
//! contexts: after reading a mail message, plain (non-command) text from
//! the same node within five minutes is treated as a reply; after entering
//! a board, plain text within ten minutes is treated as a post. Any
//! explicit command invalidates the context.

use std::collections::HashMap;

pub const MAIL_REPLY_WINDOW_US: i64 = 5 * 60 * 1_000_000;
pub const BOARD_POST_WINDOW_US: i64 = 10 * 60 * 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    /// Reply goes to this address (`user` or `user@BBS`).
    MailReply { to: String },
    /// Plain text becomes a post on this board.
    BoardPost { board: String },
}

#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub kind: ReplyKind,
    pub set_at_us: i64,
}

impl ReplyContext {
    fn window_us(&self) -> i64 {
        match self.kind {
            ReplyKind::MailReply { .. } => MAIL_REPLY_WINDOW_US,
            ReplyKind::BoardPost { .. } => BOARD_POST_WINDOW_US,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub node_id: String,
    pub username: Option<String>,
    pub is_admin: bool,
    /// Logged in on a recovery-issued temporary password; everything but
    /// `!passwd` and `!logout` stays locked until a new password is set.
    pub must_change_password: bool,
    pub current_board: Option<String>,
    pub login_at_us: i64,
    pub last_activity_us: i64,
    pub reply_context: Option<ReplyContext>,
}

impl Session {
    pub fn new(node_id: String, now_us: i64) -> Self {
        Session {
            node_id,
            username: None,
            is_admin: false,
            must_change_password: false,
            current_board: None,
            login_at_us: now_us,
            last_activity_us: now_us,
            reply_context: None,
        }
    }

    pub fn touch(&mut self, now_us: i64) {
        self.last_activity_us = now_us;
    }

    pub fn is_logged_in(&self) -> bool {
        self.username.is_some()
    }

    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or("guest")
    }

    pub fn login(&mut self, username: String, is_admin: bool, must_change_password: bool, now_us: i64) {
        self.username = Some(username);
        self.is_admin = is_admin;
        self.must_change_password = must_change_password;
        self.login_at_us = now_us;
        self.last_activity_us = now_us;
        self.reply_context = None;
    }

    pub fn logout(&mut self) {
        self.username = None;
        self.is_admin = false;
        self.must_change_password = false;
        self.current_board = None;
        self.reply_context = None;
    }

    pub fn is_idle(&self, timeout_minutes: u32, now_us: i64) -> bool {
        timeout_minutes > 0
            && now_us - self.last_activity_us > timeout_minutes as i64 * 60 * 1_000_000
    }

    pub fn set_reply_context(&mut self, kind: ReplyKind, now_us: i64) {
        self.reply_context = Some(ReplyContext {
            kind,
            set_at_us: now_us,
        });
    }

    /// Consume the reply context if it is still inside its window.
    pub fn take_reply(&mut self, now_us: i64) -> Option<ReplyKind> {
        let context = self.reply_context.take()?;
        (now_us - context.set_at_us <= context.window_us()).then_some(context.kind)
    }
}

/// Login throttling: a per-node attempts-per-minute cap, and a per-user
/// failure counter that locks the account out for a while.
#[derive(Debug)]
pub struct LoginGuard {
    max_failed: u32,
    lockout_us: i64,
    attempts_per_minute: u32,
    /// username -> (consecutive failures, locked_until_us)
    failures: HashMap<String, (u32, i64)>,
    /// node -> recent attempt timestamps
    node_attempts: HashMap<String, Vec<i64>>,
}

impl LoginGuard {
    pub fn new(max_failed: u32, lockout_minutes: u32, attempts_per_minute: u32) -> Self {
        Self {
            max_failed,
            lockout_us: lockout_minutes as i64 * 60 * 1_000_000,
            attempts_per_minute,
            failures: HashMap::new(),
            node_attempts: HashMap::new(),
        }
    }

    /// Record an attempt from this node; false when the node is over its
    /// per-minute budget.
    pub fn allow_attempt(&mut self, node_id: &str, now_us: i64) -> bool {
        let window_start = now_us - 60 * 1_000_000;
        let attempts = self.node_attempts.entry(node_id.to_string()).or_default();
        attempts.retain(|t| *t > window_start);
        if attempts.len() >= self.attempts_per_minute as usize {
            return false;
        }
        attempts.push(now_us);
        true
    }

    pub fn is_locked_out(&self, username: &str, now_us: i64) -> bool {
        self.failures
            .get(&username.to_lowercase())
            .is_some_and(|(_, until)| *until > now_us)
    }

    pub fn record_failure(&mut self, username: &str, now_us: i64) {
        let entry = self
            .failures
            .entry(username.to_lowercase())
            .or_insert((0, 0));
        entry.0 += 1;
        if entry.0 >= self.max_failed {
            entry.1 = now_us + self.lockout_us;
            entry.0 = 0;
        }
    }

    pub fn record_success(&mut self, username: &str) {
        self.failures.remove(&username.to_lowercase());
    }
}
