//! # advBBS - federated bulletin board for Meshtastic mesh networks
//!
//! advBBS turns a Meshtastic-class radio node into a store-and-forward
//! BBS: users register and authenticate over DM, exchange encrypted
//! private mail, and post to shared boards. Multiple stations peer with
//! each other to route mail across the mesh (including multi-hop relays)
//! and to batch-replicate selected boards.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use advbbs::bbs::BbsServer;
//! use advbbs::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut server = BbsServer::new(config).await?;
//!     server.connect();
//!     server.run().await
//! }
//! ```
//!
//! ## Module organization
//!
//! - [`bbs`] - session loop, command dispatch, federation routing
//! - [`sync`] - wire protocol, chunker, rate limiter, RAP, mail and board
//!   engines
//! - [`storage`] - sled-backed persistent store and snapshots
//! - [`crypto`] - Argon2id key derivation, AEAD, key wrapping
//! - [`mesh`] - transport adapter contract to the radio driver
//! - [`config`] - TOML configuration
//!
//! ## Data flow
//!
//! ```text
//! radio -> mesh adapter -> chunker -> frame demux -+-> RAP engine
//!                                                  +-> mail FSM
//!                                                  +-> board engine
//!                                                  +-> command dispatch
//! handlers -> chunker -> rate limiter -> mesh adapter -> radio
//! ```
//!
//! Everything persistent is AEAD ciphertext at rest; the master key is
//! derived from the operator passphrase at startup and never stored.

pub mod bbs;
pub mod config;
pub mod crypto;
pub mod logutil;
pub mod mesh;
pub mod storage;
pub mod sync;
pub mod validation;
