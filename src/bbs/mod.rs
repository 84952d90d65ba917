//! BBS core: server loop, sessions, and the command surface.
//!
//! - [`server`] - the cooperative session loop, scheduler, and federation
//!   router
//! - [`session`] - per-node session state and login throttling
//! - [`dispatch`] - command table, access levels, reply contexts
//! - [`commands`] - the command handlers themselves

pub mod commands;
pub mod dispatch;
pub mod server;
pub mod session;

pub use server::BbsServer;
pub use session::Session;
