//! Command registry and dispatch.
//!
//! Commands are `!`-prefixed, case-insensitive, and gated by access level.
//! Plain text without a prefix is only meaningful inside a reply context
//! (see [`crate::bbs::session`]).

use log::{debug, warn};

use crate::bbs::commands::{self, CommandContext, Reply};
use crate::bbs::session::{ReplyKind, Session};
use crate::logutil::escape_log;

/// Who may run a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Always,
    /// Authenticated, or unauthenticated but browsing a synced board.
    SyncBoardOrAuth,
    Authenticated,
    Admin,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub alias: Option<&'static str>,
    pub access: Access,
    pub help: &'static str,
}

/// The full command table. Lookup is case-insensitive over name and alias.
pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "bbs", alias: Some("?"), access: Access::Always, help: "!bbs - this help" },
    CommandSpec { name: "help", alias: None, access: Access::Always, help: "!help - this help" },
    CommandSpec { name: "info", alias: Some("i"), access: Access::Always, help: "!info - station info" },
    CommandSpec { name: "register", alias: None, access: Access::Always, help: "!register <user> <pass>" },
    CommandSpec { name: "login", alias: None, access: Access::Always, help: "!login <user> <pass>" },
    CommandSpec { name: "logout", alias: None, access: Access::Authenticated, help: "!logout" },
    CommandSpec { name: "passwd", alias: None, access: Access::Authenticated, help: "!passwd <old> <new>" },
    CommandSpec { name: "addnode", alias: Some("an"), access: Access::Authenticated, help: "!addnode <node_id>" },
    CommandSpec { name: "rmnode", alias: Some("rn"), access: Access::Authenticated, help: "!rmnode <node_id>" },
    CommandSpec { name: "nodes", alias: Some("n"), access: Access::Authenticated, help: "!nodes - list your nodes" },
    CommandSpec { name: "send", alias: Some("s"), access: Access::Authenticated, help: "!send <user[@BBS]> <msg>" },
    CommandSpec { name: "mail", alias: Some("m"), access: Access::Authenticated, help: "!mail - inbox summary" },
    CommandSpec { name: "sent", alias: None, access: Access::Authenticated, help: "!sent - outbound mail status" },
    CommandSpec { name: "read", alias: Some("r"), access: Access::SyncBoardOrAuth, help: "!read [n]" },
    CommandSpec { name: "reply", alias: Some("re"), access: Access::Authenticated, help: "!reply <n> <msg>" },
    CommandSpec { name: "forward", alias: Some("fwd"), access: Access::Authenticated, help: "!forward <n> <user[@BBS]>" },
    CommandSpec { name: "delete", alias: Some("d"), access: Access::Authenticated, help: "!delete <n>" },
    CommandSpec { name: "board", alias: Some("b"), access: Access::Always, help: "!board [name]" },
    CommandSpec { name: "list", alias: Some("l"), access: Access::SyncBoardOrAuth, help: "!list [page]" },
    CommandSpec { name: "post", alias: Some("p"), access: Access::Authenticated, help: "!post <text>" },
    CommandSpec { name: "quit", alias: Some("q"), access: Access::Always, help: "!quit - leave board" },
    CommandSpec { name: "peers", alias: None, access: Access::Always, help: "!peers - federation peers" },
    CommandSpec { name: "who", alias: None, access: Access::Authenticated, help: "!who - active users" },
    CommandSpec { name: "ban", alias: None, access: Access::Admin, help: "!ban <user> [reason]" },
    CommandSpec { name: "unban", alias: None, access: Access::Admin, help: "!unban <user>" },
    CommandSpec { name: "mkboard", alias: Some("mb"), access: Access::Admin, help: "!mkboard <name> [private] [desc]" },
    CommandSpec { name: "rmboard", alias: Some("rb"), access: Access::Admin, help: "!rmboard <name>" },
    CommandSpec { name: "syncboard", alias: None, access: Access::Admin, help: "!syncboard <name> <on|off>" },
    CommandSpec { name: "grant", alias: None, access: Access::Admin, help: "!grant <board> <user>" },
    CommandSpec { name: "revoke", alias: None, access: Access::Admin, help: "!revoke <board> <user>" },
    CommandSpec { name: "announce", alias: Some("ann"), access: Access::Admin, help: "!announce <msg>" },
    CommandSpec { name: "recover", alias: None, access: Access::Admin, help: "!recover <user>" },
];

pub fn find_command(token: &str) -> Option<&'static CommandSpec> {
    let token = token.to_lowercase();
    COMMANDS
        .iter()
        .find(|c| c.name == token || c.alias == Some(token.as_str()))
}

/// Split `!cmd args...` into the lowercased command token and the raw
/// argument remainder.
pub fn parse_command(raw: &str) -> Option<(String, &str)> {
    let stripped = raw.trim().strip_prefix('!')?;
    if stripped.is_empty() {
        return None;
    }
    let (cmd, args) = match stripped.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (stripped, ""),
    };
    Some((cmd.to_lowercase(), args))
}

/// Route one inbound payload from a (non-peer) node through the command
/// table, or through the session's reply context for plain text.
pub fn dispatch(ctx: &mut CommandContext<'_>, session: &mut Session, raw: &str) -> Reply {
    session.touch(ctx.now_us);

    let Some((token, args)) = parse_command(raw) else {
        return dispatch_plain(ctx, session, raw);
    };

    // An explicit command always invalidates a lingering reply context.
    session.reply_context = None;

    let Some(spec) = find_command(&token) else {
        debug!("unknown command '{}' from {}", escape_log(&token), session.node_id);
        return Reply::text("Unknown command. Send !bbs for help.");
    };

    if let Some(denied) = check_access(ctx, session, spec) {
        return denied;
    }

    // A recovery login is good for exactly one thing: setting a real
    // password. Until then only that, logging out, and the open commands
    // work.
    if session.must_change_password
        && !matches!(spec.name, "passwd" | "logout")
        && spec.access != Access::Always
    {
        return Reply::text("Password change required first: !passwd <temp> <new>");
    }

    commands::run(ctx, session, spec.name, args)
}

fn check_access(
    ctx: &CommandContext<'_>,
    session: &Session,
    spec: &CommandSpec,
) -> Option<Reply> {
    match spec.access {
        Access::Always => None,
        Access::Authenticated => (!session.is_logged_in())
            .then(|| Reply::text("Login required. !login <user> <pass>")),
        Access::Admin => {
            if !session.is_logged_in() {
                Some(Reply::text("Login required. !login <user> <pass>"))
            } else if !session.is_admin {
                warn!(
                    target: "security",
                    "admin command '{}' refused for {} ({})",
                    spec.name,
                    session.display_name(),
                    session.node_id
                );
                Some(Reply::text("Admin access required."))
            } else {
                None
            }
        }
        Access::SyncBoardOrAuth => {
            if session.is_logged_in() || on_synced_board(ctx, session) {
                None
            } else {
                Some(Reply::text("Login required. !login <user> <pass>"))
            }
        }
    }
}

fn on_synced_board(ctx: &CommandContext<'_>, session: &Session) -> bool {
    session
        .current_board
        .as_ref()
        .and_then(|name| ctx.store.get_board(name).ok().flatten())
        .is_some_and(|b| b.synced)
}

/// Plain (non-`!`) text: meaningful only inside a reply context.
fn dispatch_plain(ctx: &mut CommandContext<'_>, session: &mut Session, raw: &str) -> Reply {
    let text = raw.trim();
    if text.is_empty() {
        return Reply::none();
    }
    if session.must_change_password {
        return Reply::text("Password change required first: !passwd <temp> <new>");
    }
    match session.take_reply(ctx.now_us) {
        Some(ReplyKind::MailReply { to }) => {
            commands::run(ctx, session, "send", &format!("{} {}", to, text))
        }
        Some(ReplyKind::BoardPost { board }) => {
            // Post lands on the board the context was created in, even if
            // the user wandered elsewhere since.
            let previous = session.current_board.replace(board);
            let reply = commands::run(ctx, session, "post", text);
            session.current_board = previous;
            reply
        }
        None => Reply::none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_prefix_and_lowercases() {
        assert_eq!(
            parse_command("!LOGIN alice Secret"),
            Some(("login".to_string(), "alice Secret"))
        );
        assert_eq!(parse_command("!q"), Some(("q".to_string(), "")));
        assert_eq!(parse_command("no prefix"), None);
        assert_eq!(parse_command("!"), None);
    }

    #[test]
    fn aliases_resolve() {
        assert_eq!(find_command("S").unwrap().name, "send");
        assert_eq!(find_command("fwd").unwrap().name, "forward");
        assert_eq!(find_command("?").unwrap().name, "bbs");
        assert!(find_command("frobnicate").is_none());
    }

    #[test]
    fn table_has_no_duplicate_tokens() {
        let mut seen = std::collections::HashSet::new();
        for spec in COMMANDS {
            assert!(seen.insert(spec.name), "duplicate command {}", spec.name);
            if let Some(alias) = spec.alias {
                assert!(seen.insert(alias), "duplicate alias {}", alias);
            }
        }
    }
}
