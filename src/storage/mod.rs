//! Persistent store for the BBS.
//!
//! Sled-backed, one tree per entity family plus two secondary indexes so
//! mail and board listings avoid full scans:
//!
//! ```text
//! settings      schema_version, master_key_salt (immutable once written)
//! users         username -> User
//! nodes         node_id -> Node
//! bindings      user:<u>:<n> and node:<n>:<u> -> Binding
//! messages      uuid -> Message
//! idx_mail      <recipient>:<created>:<uuid> -> uuid
//! idx_board     <board>:<created>:<uuid> -> uuid
//! boards        name -> Board
//! board_access  <board>:<user> -> wrapped board key
//! peers         node_id -> Peer
//! routes        DEST -> Route
//! sync_log      <uuid>:<peer>:<dir> -> SyncLogEntry
//! board_sync    <board>:<peer> -> last acked timestamp
//! ```
//!
//! All writes flow through the server task; readers may fan out. Message
//! bodies and subjects are AEAD ciphertext only; plaintext never reaches
//! this module.

pub mod backup;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sled::IVec;
use thiserror::Error;

pub use crate::crypto::SALT_LEN;

const TREE_SETTINGS: &str = "settings";
const TREE_USERS: &str = "users";
const TREE_NODES: &str = "nodes";
const TREE_BINDINGS: &str = "bindings";
const TREE_MESSAGES: &str = "messages";
const TREE_IDX_MAIL: &str = "idx_mail";
const TREE_IDX_BOARD: &str = "idx_board";
const TREE_BOARDS: &str = "boards";
const TREE_BOARD_ACCESS: &str = "board_access";
const TREE_PEERS: &str = "peers";
const TREE_ROUTES: &str = "routes";
const TREE_SYNC_LOG: &str = "sync_log";
const TREE_BOARD_SYNC: &str = "board_sync";

const KEY_SCHEMA_VERSION: &[u8] = b"schema_version";
const KEY_MASTER_SALT: &[u8] = b"master_key_salt";

/// Store-level schema version; bumped by forward-only migrations.
pub const STORE_SCHEMA_VERSION: u32 = 1;

pub const USER_SCHEMA_VERSION: u32 = 1;
pub const MESSAGE_SCHEMA_VERSION: u32 = 1;
pub const BOARD_SCHEMA_VERSION: u32 = 1;
pub const PEER_SCHEMA_VERSION: u32 = 1;
pub const ROUTE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sled(#[from] sled::Error),
    #[error(transparent)]
    Encoding(#[from] bincode::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("schema mismatch for {entity}: expected {expected}, found {found}")]
    SchemaMismatch {
        entity: &'static str,
        expected: u32,
        found: u32,
    },
    /// The store is in a state that would silently destroy data if we kept
    /// running. Fatal at startup.
    #[error("corrupt store: {0}")]
    CorruptStore(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub reason: String,
    /// Callsign of the BBS where the ban was placed. Bans are local-only
    /// and never transmitted to peers.
    pub origin: String,
    pub actor: String,
    pub at_us: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub schema_version: u32,
    /// Canonical lowercase username.
    pub username: String,
    /// Argon2id PHC verifier string.
    pub password_hash: String,
    /// Salt for the password-derived wrapping key.
    pub password_salt: [u8; SALT_LEN],
    /// User key wrapped under the master key. Lets the station encrypt
    /// for this user while they are offline (federated delivery) and
    /// backs admin recovery.
    pub wrapped_key: Vec<u8>,
    /// User key wrapped under the password-derived key; rewrapped on
    /// password change.
    pub wrapped_key_pw: Vec<u8>,
    pub created_at_us: i64,
    pub last_seen_us: i64,
    pub is_admin: bool,
    pub must_change_password: bool,
    pub ban: Option<BanRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub display_name: Option<String>,
    pub first_seen_us: i64,
    pub last_seen_us: i64,
    pub last_snr: Option<f32>,
    pub last_rssi: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub username: String,
    pub node_id: String,
    pub primary: bool,
    pub bound_at_us: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Mail,
    Bulletin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub schema_version: u32,
    /// Globally unique; the federation dedup key.
    pub uuid: String,
    pub kind: MessageKind,
    /// Local username, or `user@BBS` for mail that arrived via federation.
    pub sender: Option<String>,
    /// Local recipient username (mail only).
    pub recipient: Option<String>,
    pub board: Option<String>,
    /// Bulletin author; `user@BBS` for federated posts.
    pub author: Option<String>,
    pub origin_bbs: String,
    pub subject_enc: Option<Vec<u8>>,
    pub body_enc: Vec<u8>,
    pub created_at_us: i64,
    pub delivered_at_us: Option<i64>,
    pub read_at_us: Option<i64>,
    pub expires_at_us: Option<i64>,
    pub delivery_attempts: u32,
    pub last_attempt_us: Option<i64>,
    /// Remote addressing / final status for outbound federated mail
    /// (`user@BBS`, `DELIVERED:user@BBS`, `FAILED:<reason>`).
    pub forwarded_to: Option<String>,
    pub hop_count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardKind {
    Public,
    Restricted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub schema_version: u32,
    pub name: String,
    pub description: String,
    pub created_at_us: i64,
    pub synced: bool,
    pub kind: BoardKind,
    /// Board key wrapped under the master key. Restricted boards carry
    /// additional per-grantee wrappings in `board_access`.
    pub wrapped_key: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerHealth {
    Unknown,
    Alive,
    Unreachable,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub schema_version: u32,
    pub node_id: String,
    pub callsign: String,
    pub enabled: bool,
    pub last_seen_us: Option<i64>,
    pub last_sync_us: Option<i64>,
    pub health: PeerHealth,
    /// Consecutive missed heartbeats since the last PONG.
    pub consecutive_misses: u32,
    /// Total missed heartbeats since the last PONG.
    pub total_misses: u32,
    pub quality: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub schema_version: u32,
    /// Destination callsign (uppercase).
    pub dest: String,
    /// Next-hop peer node id.
    pub via_node: String,
    pub hop_count: u8,
    pub quality: f32,
    pub learned_at_us: i64,
    pub expires_at_us: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    Sent,
    Received,
}

impl SyncDirection {
    fn key_tag(self) -> &'static str {
        match self {
            SyncDirection::Sent => "tx",
            SyncDirection::Received => "rx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Acked,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub message_uuid: String,
    pub peer_node: String,
    pub direction: SyncDirection,
    pub status: SyncStatus,
    pub attempts: u32,
    pub last_attempt_us: i64,
}

/// Outcome of a message insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    Fresh,
    /// UUID already present; the insert was a no-op.
    Duplicate,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Builder so tests can spin up throwaway stores.
pub struct StoreBuilder {
    path: PathBuf,
}

impl StoreBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn open(self) -> Result<Store> {
        Store::open(self.path)
    }
}

/// Sled-backed persistence for all BBS entities.
#[derive(Debug)]
pub struct Store {
    _db: sled::Db,
    path: PathBuf,
    settings: sled::Tree,
    users: sled::Tree,
    nodes: sled::Tree,
    bindings: sled::Tree,
    messages: sled::Tree,
    idx_mail: sled::Tree,
    idx_board: sled::Tree,
    boards: sled::Tree,
    board_access: sled::Tree,
    peers: sled::Tree,
    routes: sled::Tree,
    sync_log: sled::Tree,
    board_sync: sled::Tree,
}

impl Store {
    /// Open (or create) the store rooted at `path`, run pending migrations,
    /// and verify the master-salt invariant.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref).map_err(|e| {
            StorageError::CorruptStore(format!("cannot create data dir {:?}: {}", path_ref, e))
        })?;
        let db = sled::open(path_ref)?;
        let store = Self {
            settings: db.open_tree(TREE_SETTINGS)?,
            users: db.open_tree(TREE_USERS)?,
            nodes: db.open_tree(TREE_NODES)?,
            bindings: db.open_tree(TREE_BINDINGS)?,
            messages: db.open_tree(TREE_MESSAGES)?,
            idx_mail: db.open_tree(TREE_IDX_MAIL)?,
            idx_board: db.open_tree(TREE_IDX_BOARD)?,
            boards: db.open_tree(TREE_BOARDS)?,
            board_access: db.open_tree(TREE_BOARD_ACCESS)?,
            peers: db.open_tree(TREE_PEERS)?,
            routes: db.open_tree(TREE_ROUTES)?,
            sync_log: db.open_tree(TREE_SYNC_LOG)?,
            board_sync: db.open_tree(TREE_BOARD_SYNC)?,
            path: path_ref.to_path_buf(),
            _db: db,
        };
        store.migrate()?;
        store.verify_master_salt()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: for<'de> Deserialize<'de>>(bytes: IVec) -> Result<T> {
        Ok(bincode::deserialize::<T>(&bytes)?)
    }

    // -- migrations & master salt -------------------------------------------

    fn schema_version(&self) -> Result<u32> {
        Ok(self
            .settings
            .get(KEY_SCHEMA_VERSION)?
            .map(|v| {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&v[..4.min(v.len())]);
                u32::from_le_bytes(buf)
            })
            .unwrap_or(0))
    }

    /// Forward-only migrations. v0 -> v1 creates the master-salt row on a
    /// fresh store.
    fn migrate(&self) -> Result<()> {
        let mut version = self.schema_version()?;
        while version < STORE_SCHEMA_VERSION {
            match version {
                0 => {
                    if self.settings.get(KEY_MASTER_SALT)?.is_none() && self.user_count()? == 0 {
                        let salt = crate::crypto::generate_salt();
                        self.settings.insert(KEY_MASTER_SALT, &salt[..])?;
                    }
                }
                _ => {
                    return Err(StorageError::CorruptStore(format!(
                        "no migration from schema version {}",
                        version
                    )))
                }
            }
            version += 1;
            self.settings
                .insert(KEY_SCHEMA_VERSION, &version.to_le_bytes())?;
        }
        self.settings.flush()?;
        Ok(())
    }

    /// The master salt is immutable for the life of the store: losing it
    /// while users exist makes every wrapped user key unrecoverable, so a
    /// missing or blank salt with user rows present aborts startup instead
    /// of regenerating.
    fn verify_master_salt(&self) -> Result<()> {
        let salt = self.settings.get(KEY_MASTER_SALT)?;
        let intact = salt.as_ref().is_some_and(|s| s.len() == SALT_LEN);
        if intact {
            return Ok(());
        }
        if self.user_count()? > 0 {
            return Err(StorageError::CorruptStore(
                "master_key_salt is missing or blank while user accounts exist; \
                 restore it from a backup; regenerating it would destroy all \
                 encrypted mail"
                    .to_string(),
            ));
        }
        let fresh = crate::crypto::generate_salt();
        self.settings.insert(KEY_MASTER_SALT, &fresh[..])?;
        self.settings.flush()?;
        Ok(())
    }

    pub fn master_salt(&self) -> Result<[u8; SALT_LEN]> {
        let bytes = self
            .settings
            .get(KEY_MASTER_SALT)?
            .ok_or_else(|| StorageError::CorruptStore("master_key_salt missing".into()))?;
        if bytes.len() != SALT_LEN {
            return Err(StorageError::CorruptStore("master_key_salt malformed".into()));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes);
        Ok(salt)
    }

    /// Test hook: blank the salt row the way a botched restore would.
    #[doc(hidden)]
    pub fn corrupt_master_salt_for_test(&self) -> Result<()> {
        self.settings.insert(KEY_MASTER_SALT, &[][..])?;
        self.settings.flush()?;
        Ok(())
    }

    // -- users --------------------------------------------------------------

    pub fn user_count(&self) -> Result<usize> {
        Ok(self.users.len())
    }

    pub fn create_user(&self, mut user: User) -> Result<()> {
        user.schema_version = USER_SCHEMA_VERSION;
        user.username = user.username.to_lowercase();
        if self.users.contains_key(user.username.as_bytes())? {
            return Err(StorageError::Conflict(format!(
                "username '{}' is already taken",
                user.username
            )));
        }
        self.users
            .insert(user.username.as_bytes(), Self::serialize(&user)?)?;
        self.users.flush()?;
        Ok(())
    }

    pub fn get_user(&self, username: &str) -> Result<Option<User>> {
        let key = username.to_lowercase();
        let Some(bytes) = self.users.get(key.as_bytes())? else {
            return Ok(None);
        };
        let user: User = Self::deserialize(bytes)?;
        if user.schema_version != USER_SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                entity: "user",
                expected: USER_SCHEMA_VERSION,
                found: user.schema_version,
            });
        }
        Ok(Some(user))
    }

    pub fn put_user(&self, mut user: User) -> Result<()> {
        user.schema_version = USER_SCHEMA_VERSION;
        user.username = user.username.to_lowercase();
        self.users
            .insert(user.username.as_bytes(), Self::serialize(&user)?)?;
        self.users.flush()?;
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut out = Vec::new();
        for entry in self.users.iter() {
            let (_, v) = entry?;
            out.push(Self::deserialize(v)?);
        }
        out.sort_by(|a: &User, b: &User| a.username.cmp(&b.username));
        Ok(out)
    }

    // -- nodes --------------------------------------------------------------

    pub fn get_node(&self, node_id: &str) -> Result<Option<Node>> {
        Ok(match self.nodes.get(node_id.as_bytes())? {
            Some(bytes) => Some(Self::deserialize(bytes)?),
            None => None,
        })
    }

    /// Record that a node was heard from, refreshing signal metrics.
    pub fn touch_node(
        &self,
        node_id: &str,
        now_us: i64,
        snr: Option<f32>,
        rssi: Option<i32>,
    ) -> Result<Node> {
        let mut node = self.get_node(node_id)?.unwrap_or(Node {
            node_id: node_id.to_string(),
            display_name: None,
            first_seen_us: now_us,
            last_seen_us: now_us,
            last_snr: None,
            last_rssi: None,
        });
        node.last_seen_us = now_us;
        if snr.is_some() {
            node.last_snr = snr;
        }
        if rssi.is_some() {
            node.last_rssi = rssi;
        }
        self.nodes
            .insert(node_id.as_bytes(), Self::serialize(&node)?)?;
        Ok(node)
    }

    // -- bindings -----------------------------------------------------------

    fn binding_user_key(username: &str, node_id: &str) -> Vec<u8> {
        format!("user:{}:{}", username, node_id).into_bytes()
    }

    fn binding_node_key(node_id: &str, username: &str) -> Vec<u8> {
        format!("node:{}:{}", node_id, username).into_bytes()
    }

    pub fn add_binding(&self, username: &str, node_id: &str, primary: bool, now_us: i64) -> Result<()> {
        let username = username.to_lowercase();
        if self
            .bindings
            .contains_key(Self::binding_user_key(&username, node_id))?
        {
            return Err(StorageError::Conflict(format!(
                "node {} already bound to {}",
                node_id, username
            )));
        }
        if primary {
            // Demote any existing primary.
            for mut existing in self.bindings_for_user(&username)? {
                if existing.primary {
                    existing.primary = false;
                    self.write_binding(&existing)?;
                }
            }
        }
        let binding = Binding {
            username: username.clone(),
            node_id: node_id.to_string(),
            primary,
            bound_at_us: now_us,
        };
        self.write_binding(&binding)?;
        self.bindings.flush()?;
        Ok(())
    }

    fn write_binding(&self, binding: &Binding) -> Result<()> {
        let bytes = Self::serialize(binding)?;
        self.bindings.insert(
            Self::binding_user_key(&binding.username, &binding.node_id),
            bytes.clone(),
        )?;
        self.bindings.insert(
            Self::binding_node_key(&binding.node_id, &binding.username),
            bytes,
        )?;
        Ok(())
    }

    /// Remove a binding. Refuses to remove the last one: a registered user
    /// must keep at least one bound node.
    pub fn remove_binding(&self, username: &str, node_id: &str) -> Result<()> {
        let username = username.to_lowercase();
        let existing = self.bindings_for_user(&username)?;
        if !existing.iter().any(|b| b.node_id == node_id) {
            return Err(StorageError::NotFound(format!(
                "node {} is not bound to {}",
                node_id, username
            )));
        }
        if existing.len() <= 1 {
            return Err(StorageError::Conflict(
                "cannot remove the last bound node".to_string(),
            ));
        }
        self.bindings
            .remove(Self::binding_user_key(&username, node_id))?;
        self.bindings
            .remove(Self::binding_node_key(node_id, &username))?;
        // Keep a primary designated.
        let remaining = self.bindings_for_user(&username)?;
        if !remaining.iter().any(|b| b.primary) {
            if let Some(mut first) = remaining.into_iter().next() {
                first.primary = true;
                self.write_binding(&first)?;
            }
        }
        self.bindings.flush()?;
        Ok(())
    }

    pub fn bindings_for_user(&self, username: &str) -> Result<Vec<Binding>> {
        let prefix = format!("user:{}:", username.to_lowercase());
        let mut out = Vec::new();
        for entry in self.bindings.scan_prefix(prefix.as_bytes()) {
            let (_, v) = entry?;
            out.push(Self::deserialize(v)?);
        }
        Ok(out)
    }

    pub fn user_bound_to_node(&self, username: &str, node_id: &str) -> Result<bool> {
        Ok(self
            .bindings
            .contains_key(Self::binding_user_key(&username.to_lowercase(), node_id))?)
    }

    pub fn primary_node(&self, username: &str) -> Result<Option<String>> {
        let bindings = self.bindings_for_user(username)?;
        Ok(bindings
            .iter()
            .find(|b| b.primary)
            .or(bindings.first())
            .map(|b| b.node_id.clone()))
    }

    // -- messages -----------------------------------------------------------

    fn mail_index_key(recipient: &str, created_at_us: i64, uuid: &str) -> Vec<u8> {
        format!("{}:{:020}:{}", recipient, created_at_us, uuid).into_bytes()
    }

    fn board_index_key(board: &str, created_at_us: i64, uuid: &str) -> Vec<u8> {
        format!("{}:{:020}:{}", board, created_at_us, uuid).into_bytes()
    }

    /// Insert a message. A UUID collision is a silent no-op: the dedup
    /// path for replayed federation traffic.
    pub fn insert_message(&self, mut message: Message) -> Result<Inserted> {
        message.schema_version = MESSAGE_SCHEMA_VERSION;
        if self.messages.contains_key(message.uuid.as_bytes())? {
            return Ok(Inserted::Duplicate);
        }
        self.messages
            .insert(message.uuid.as_bytes(), Self::serialize(&message)?)?;
        if let Some(recipient) = &message.recipient {
            self.idx_mail.insert(
                Self::mail_index_key(recipient, message.created_at_us, &message.uuid),
                message.uuid.as_bytes(),
            )?;
        }
        if let Some(board) = &message.board {
            self.idx_board.insert(
                Self::board_index_key(board, message.created_at_us, &message.uuid),
                message.uuid.as_bytes(),
            )?;
        }
        self.messages.flush()?;
        Ok(Inserted::Fresh)
    }

    pub fn get_message(&self, uuid: &str) -> Result<Option<Message>> {
        Ok(match self.messages.get(uuid.as_bytes())? {
            Some(bytes) => Some(Self::deserialize(bytes)?),
            None => None,
        })
    }

    pub fn message_exists(&self, uuid: &str) -> Result<bool> {
        Ok(self.messages.contains_key(uuid.as_bytes())?)
    }

    /// Update a message in place. `uuid`, `created_at_us`, `recipient` and
    /// `board` are index-bearing and must not change.
    pub fn put_message(&self, mut message: Message) -> Result<()> {
        message.schema_version = MESSAGE_SCHEMA_VERSION;
        self.messages
            .insert(message.uuid.as_bytes(), Self::serialize(&message)?)?;
        self.messages.flush()?;
        Ok(())
    }

    pub fn delete_message(&self, uuid: &str) -> Result<bool> {
        let Some(message) = self.get_message(uuid)? else {
            return Ok(false);
        };
        self.messages.remove(uuid.as_bytes())?;
        if let Some(recipient) = &message.recipient {
            self.idx_mail
                .remove(Self::mail_index_key(recipient, message.created_at_us, uuid))?;
        }
        if let Some(board) = &message.board {
            self.idx_board
                .remove(Self::board_index_key(board, message.created_at_us, uuid))?;
        }
        self.messages.flush()?;
        Ok(true)
    }

    /// Mail for a user, newest first.
    pub fn mail_for_user(
        &self,
        username: &str,
        unread_only: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let prefix = format!("{}:", username.to_lowercase());
        let mut out = Vec::new();
        for entry in self.idx_mail.scan_prefix(prefix.as_bytes()).rev() {
            let (_, uuid) = entry?;
            let uuid = String::from_utf8_lossy(&uuid).to_string();
            if let Some(message) = self.get_message(&uuid)? {
                if message.kind != MessageKind::Mail {
                    continue;
                }
                if unread_only && message.read_at_us.is_some() {
                    continue;
                }
                out.push(message);
                if out.len() >= offset + limit {
                    break;
                }
            }
        }
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    pub fn count_unread_mail(&self, username: &str) -> Result<usize> {
        Ok(self
            .mail_for_user(username, true, usize::MAX - 1, 0)?
            .len())
    }

    /// Board posts oldest first, so post numbering is stable.
    pub fn board_posts(
        &self,
        board: &str,
        limit: usize,
        offset: usize,
        since_us: Option<i64>,
    ) -> Result<Vec<Message>> {
        let prefix = format!("{}:", board);
        let mut out = Vec::new();
        let mut skipped = 0usize;
        for entry in self.idx_board.scan_prefix(prefix.as_bytes()) {
            let (_, uuid) = entry?;
            let uuid = String::from_utf8_lossy(&uuid).to_string();
            if let Some(message) = self.get_message(&uuid)? {
                if let Some(since) = since_us {
                    if message.created_at_us <= since {
                        continue;
                    }
                }
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                out.push(message);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Locally authored posts newer than `since_us`, for board sync batches.
    pub fn board_posts_for_sync(
        &self,
        board: &str,
        since_us: i64,
        origin_bbs: &str,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let posts = self.board_posts(board, usize::MAX - 1, 0, Some(since_us))?;
        Ok(posts
            .into_iter()
            .filter(|m| m.origin_bbs == origin_bbs)
            .take(limit)
            .collect())
    }

    pub fn count_board_posts(&self, board: &str) -> Result<usize> {
        let prefix = format!("{}:", board);
        Ok(self.idx_board.scan_prefix(prefix.as_bytes()).count())
    }

    pub fn mark_read(&self, uuid: &str, now_us: i64) -> Result<()> {
        let mut message = self
            .get_message(uuid)?
            .ok_or_else(|| StorageError::NotFound(format!("message {}", uuid)))?;
        if message.read_at_us.is_none() {
            message.read_at_us = Some(now_us);
            self.put_message(message)?;
        }
        Ok(())
    }

    pub fn mark_delivered(&self, uuid: &str, dest: &str, now_us: i64) -> Result<()> {
        let mut message = self
            .get_message(uuid)?
            .ok_or_else(|| StorageError::NotFound(format!("message {}", uuid)))?;
        message.delivered_at_us = Some(now_us);
        message.forwarded_to = Some(format!("DELIVERED:{}", dest));
        self.put_message(message)
    }

    pub fn mark_delivery_failed(&self, uuid: &str, reason: &str) -> Result<()> {
        let mut message = self
            .get_message(uuid)?
            .ok_or_else(|| StorageError::NotFound(format!("message {}", uuid)))?;
        message.forwarded_to = Some(format!("FAILED:{}", reason));
        self.put_message(message)
    }

    pub fn record_delivery_attempt(&self, uuid: &str, now_us: i64) -> Result<()> {
        let mut message = self
            .get_message(uuid)?
            .ok_or_else(|| StorageError::NotFound(format!("message {}", uuid)))?;
        message.delivery_attempts += 1;
        message.last_attempt_us = Some(now_us);
        self.put_message(message)
    }

    /// Outbound federated mail still awaiting delivery confirmation,
    /// oldest first.
    pub fn pending_outbound_mail(&self, limit: usize) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        for entry in self.messages.iter() {
            let (_, v) = entry?;
            let message: Message = Self::deserialize(v)?;
            let in_flight = message.kind == MessageKind::Mail
                && message.recipient.is_none()
                && message.delivered_at_us.is_none()
                && message
                    .forwarded_to
                    .as_deref()
                    .is_some_and(|f| !f.starts_with("FAILED:"));
            if in_flight {
                out.push(message);
            }
        }
        out.sort_by_key(|m| m.created_at_us);
        out.truncate(limit);
        Ok(out)
    }

    /// Outbound federated mail sent by `username`, newest first.
    pub fn sent_remote_mail(&self, username: &str, limit: usize) -> Result<Vec<Message>> {
        let username = username.to_lowercase();
        let mut out = Vec::new();
        for entry in self.messages.iter() {
            let (_, v) = entry?;
            let message: Message = Self::deserialize(v)?;
            if message.kind == MessageKind::Mail
                && message.sender.as_deref() == Some(username.as_str())
                && message.forwarded_to.is_some()
                && message.recipient.is_none()
            {
                out.push(message);
            }
        }
        out.sort_by(|a, b| b.created_at_us.cmp(&a.created_at_us));
        out.truncate(limit);
        Ok(out)
    }

    /// Delete messages whose expiry has passed. Returns how many went.
    pub fn delete_expired_messages(&self, now_us: i64) -> Result<usize> {
        let mut expired = Vec::new();
        for entry in self.messages.iter() {
            let (_, v) = entry?;
            let message: Message = Self::deserialize(v)?;
            if message.expires_at_us.is_some_and(|e| e < now_us) {
                expired.push(message.uuid);
            }
        }
        let count = expired.len();
        for uuid in expired {
            self.delete_message(&uuid)?;
        }
        Ok(count)
    }

    // -- boards -------------------------------------------------------------

    pub fn create_board(&self, mut board: Board) -> Result<()> {
        board.schema_version = BOARD_SCHEMA_VERSION;
        if self.boards.contains_key(board.name.as_bytes())? {
            return Err(StorageError::Conflict(format!(
                "board '{}' already exists",
                board.name
            )));
        }
        self.boards
            .insert(board.name.as_bytes(), Self::serialize(&board)?)?;
        self.boards.flush()?;
        Ok(())
    }

    pub fn get_board(&self, name: &str) -> Result<Option<Board>> {
        Ok(match self.boards.get(name.as_bytes())? {
            Some(bytes) => Some(Self::deserialize(bytes)?),
            None => None,
        })
    }

    pub fn put_board(&self, mut board: Board) -> Result<()> {
        board.schema_version = BOARD_SCHEMA_VERSION;
        self.boards
            .insert(board.name.as_bytes(), Self::serialize(&board)?)?;
        self.boards.flush()?;
        Ok(())
    }

    pub fn list_boards(&self) -> Result<Vec<Board>> {
        let mut out = Vec::new();
        for entry in self.boards.iter() {
            let (_, v) = entry?;
            out.push(Self::deserialize(v)?);
        }
        out.sort_by(|a: &Board, b: &Board| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn synced_boards(&self) -> Result<Vec<Board>> {
        Ok(self.list_boards()?.into_iter().filter(|b| b.synced).collect())
    }

    /// Toggle a board's sync flag. Enabling fails once `max_synced` boards
    /// are already syncing, and `local` can never sync.
    pub fn set_board_synced(&self, name: &str, synced: bool, max_synced: usize) -> Result<()> {
        let mut board = self
            .get_board(name)?
            .ok_or_else(|| StorageError::NotFound(format!("board {}", name)))?;
        if synced && board.name == "local" {
            return Err(StorageError::Conflict(
                "the local board cannot be synced".to_string(),
            ));
        }
        if synced && !board.synced {
            let active = self.synced_boards()?.len();
            if active >= max_synced {
                return Err(StorageError::Conflict(format!(
                    "sync limit reached ({} boards)",
                    max_synced
                )));
            }
        }
        board.synced = synced;
        self.put_board(board)
    }

    pub fn delete_board(&self, name: &str) -> Result<bool> {
        if self.boards.remove(name.as_bytes())?.is_none() {
            return Ok(false);
        }
        let posts = self.board_posts(name, usize::MAX - 1, 0, None)?;
        for post in posts {
            self.delete_message(&post.uuid)?;
        }
        let prefix = format!("{}:", name);
        let keys: Vec<_> = self
            .board_access
            .scan_prefix(prefix.as_bytes())
            .filter_map(|e| e.ok().map(|(k, _)| k))
            .collect();
        for key in keys {
            self.board_access.remove(key)?;
        }
        self.boards.flush()?;
        Ok(true)
    }

    fn access_key(board: &str, username: &str) -> Vec<u8> {
        format!("{}:{}", board, username.to_lowercase()).into_bytes()
    }

    /// Store a restricted board's key wrapped under a grantee's user key.
    pub fn grant_board_access(&self, board: &str, username: &str, wrapped: Vec<u8>) -> Result<()> {
        self.board_access
            .insert(Self::access_key(board, username), wrapped)?;
        self.board_access.flush()?;
        Ok(())
    }

    pub fn revoke_board_access(&self, board: &str, username: &str) -> Result<bool> {
        let removed = self
            .board_access
            .remove(Self::access_key(board, username))?
            .is_some();
        self.board_access.flush()?;
        Ok(removed)
    }

    pub fn board_access_for(&self, board: &str, username: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .board_access
            .get(Self::access_key(board, username))?
            .map(|v| v.to_vec()))
    }

    // -- peers --------------------------------------------------------------

    pub fn get_peer(&self, node_id: &str) -> Result<Option<Peer>> {
        Ok(match self.peers.get(node_id.as_bytes())? {
            Some(bytes) => Some(Self::deserialize(bytes)?),
            None => None,
        })
    }

    pub fn put_peer(&self, mut peer: Peer) -> Result<()> {
        peer.schema_version = PEER_SCHEMA_VERSION;
        self.peers
            .insert(peer.node_id.as_bytes(), Self::serialize(&peer)?)?;
        self.peers.flush()?;
        Ok(())
    }

    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        let mut out = Vec::new();
        for entry in self.peers.iter() {
            let (_, v) = entry?;
            out.push(Self::deserialize(v)?);
        }
        out.sort_by(|a: &Peer, b: &Peer| a.callsign.cmp(&b.callsign));
        Ok(out)
    }

    pub fn peers_by_health(&self, health: PeerHealth) -> Result<Vec<Peer>> {
        Ok(self
            .list_peers()?
            .into_iter()
            .filter(|p| p.health == health)
            .collect())
    }

    // -- routes -------------------------------------------------------------

    pub fn put_route(&self, mut route: Route) -> Result<()> {
        route.schema_version = ROUTE_SCHEMA_VERSION;
        route.dest = route.dest.to_uppercase();
        self.routes
            .insert(route.dest.as_bytes(), Self::serialize(&route)?)?;
        self.routes.flush()?;
        Ok(())
    }

    pub fn get_route(&self, dest: &str) -> Result<Option<Route>> {
        Ok(match self.routes.get(dest.to_uppercase().as_bytes())? {
            Some(bytes) => Some(Self::deserialize(bytes)?),
            None => None,
        })
    }

    pub fn list_routes(&self) -> Result<Vec<Route>> {
        let mut out = Vec::new();
        for entry in self.routes.iter() {
            let (_, v) = entry?;
            out.push(Self::deserialize(v)?);
        }
        out.sort_by(|a: &Route, b: &Route| a.dest.cmp(&b.dest));
        Ok(out)
    }

    pub fn delete_route(&self, dest: &str) -> Result<()> {
        self.routes.remove(dest.to_uppercase().as_bytes())?;
        Ok(())
    }

    pub fn expire_routes(&self, now_us: i64) -> Result<usize> {
        let stale: Vec<String> = self
            .list_routes()?
            .into_iter()
            .filter(|r| r.expires_at_us <= now_us)
            .map(|r| r.dest)
            .collect();
        let count = stale.len();
        for dest in stale {
            self.delete_route(&dest)?;
        }
        Ok(count)
    }

    /// Drop every route whose next hop is the given peer.
    pub fn delete_routes_via(&self, node_id: &str) -> Result<usize> {
        let via: Vec<String> = self
            .list_routes()?
            .into_iter()
            .filter(|r| r.via_node == node_id)
            .map(|r| r.dest)
            .collect();
        let count = via.len();
        for dest in via {
            self.delete_route(&dest)?;
        }
        Ok(count)
    }

    // -- sync log -----------------------------------------------------------

    fn sync_key(uuid: &str, peer_node: &str, direction: SyncDirection) -> Vec<u8> {
        format!("{}:{}:{}", uuid, peer_node, direction.key_tag()).into_bytes()
    }

    pub fn log_sync(&self, entry: SyncLogEntry) -> Result<()> {
        self.sync_log.insert(
            Self::sync_key(&entry.message_uuid, &entry.peer_node, entry.direction),
            Self::serialize(&entry)?,
        )?;
        self.sync_log.flush()?;
        Ok(())
    }

    pub fn get_sync(
        &self,
        uuid: &str,
        peer_node: &str,
        direction: SyncDirection,
    ) -> Result<Option<SyncLogEntry>> {
        Ok(
            match self.sync_log.get(Self::sync_key(uuid, peer_node, direction))? {
                Some(bytes) => Some(Self::deserialize(bytes)?),
                None => None,
            },
        )
    }

    /// True when this UUID was already sent to and acknowledged by the peer.
    pub fn sync_acked(&self, uuid: &str, peer_node: &str) -> Result<bool> {
        Ok(self
            .get_sync(uuid, peer_node, SyncDirection::Sent)?
            .is_some_and(|e| e.status == SyncStatus::Acked))
    }

    // -- board sync watermarks ----------------------------------------------

    fn board_sync_key(board: &str, peer_node: &str) -> Vec<u8> {
        format!("{}:{}", board, peer_node).into_bytes()
    }

    pub fn board_peer_watermark(&self, board: &str, peer_node: &str) -> Result<i64> {
        Ok(self
            .board_sync
            .get(Self::board_sync_key(board, peer_node))?
            .map(|v| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&v[..8.min(v.len())]);
                i64::from_le_bytes(buf)
            })
            .unwrap_or(0))
    }

    pub fn set_board_peer_watermark(&self, board: &str, peer_node: &str, at_us: i64) -> Result<()> {
        self.board_sync
            .insert(Self::board_sync_key(board, peer_node), &at_us.to_le_bytes())?;
        self.board_sync.flush()?;
        Ok(())
    }
}
