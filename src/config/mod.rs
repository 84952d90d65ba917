//! Configuration management.
//!
//! All runtime tuning lives in one TOML file, organized into sections that
//! map 1:1 onto the structs below. Every section has serde defaults so a
//! minimal config only needs the BBS identity and peer list:
//!
//! ```toml
//! [bbs]
//! name = "Ridgeline BBS"
//! callsign = "RIDGE"
//! passphrase = "correct horse battery staple"
//!
//! [[sync.peers]]
//! node_id = "!a1b2c3d4"
//! callsign = "VALLEY"
//! ```
//!
//! The config file is the sole source of the peer whitelist, the operator
//! passphrase, interval values and thresholds, the BBS callsign, and the
//! transport settings. Nothing is read from the environment.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::validation::validate_callsign;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bbs: BbsConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BbsConfig {
    pub name: String,
    /// Short identifier used in `user@CALLSIGN` addressing. Uppercased on
    /// load; must be unique among peers.
    pub callsign: String,
    /// Operator passphrase the master key is derived from. May be left
    /// empty, in which case `advbbs start` prompts for it.
    #[serde(default)]
    pub passphrase: String,
    #[serde(default = "default_motd")]
    pub motd: String,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_minutes: u32,
    /// Hours between public announcement broadcasts. 0 disables.
    #[serde(default = "default_announce_hours")]
    pub announcement_interval_hours: u32,
    #[serde(default)]
    pub announcement_channel: u8,
    #[serde(default)]
    pub announcement_message: String,
    #[serde(default = "default_message_age_days")]
    pub max_message_age_days: u32,
}

fn default_motd() -> String {
    "Welcome. DM !bbs for help.".to_string()
}
fn default_session_timeout() -> u32 {
    30
}
fn default_announce_hours() -> u32 {
    12
}
fn default_message_age_days() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Transport driver: "serial", "tcp", or "none" to run detached.
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// Our radio node id (e.g. "!a1b2c3d4"). Informational; the driver
    /// reports the authoritative value.
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub channel: u8,
    /// Hard ceiling on any single transmitted frame.
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: usize,
    /// Frame budget the chunker targets for multipart payloads. Kept well
    /// under `max_frame_bytes` so protocol prefixes and radio overhead fit.
    #[serde(default = "default_chunk_frame")]
    pub chunk_frame_bytes: usize,
}

fn default_transport() -> String {
    "none".to_string()
}
fn default_baud() -> u32 {
    115_200
}
fn default_max_frame() -> usize {
    237
}
fn default_chunk_frame() -> usize {
    150
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            port: String::new(),
            baud_rate: default_baud(),
            node_id: String::new(),
            channel: 0,
            max_frame_bytes: default_max_frame(),
            chunk_frame_bytes: default_chunk_frame(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    #[serde(default = "default_backup_hours")]
    pub backup_interval_hours: u32,
    #[serde(default = "default_backup_keep")]
    pub backup_keep: usize,
}

fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_backup_dir() -> String {
    "./data/backups".to_string()
}
fn default_backup_hours() -> u32 {
    24
}
fn default_backup_keep() -> usize {
    7
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backup_dir: default_backup_dir(),
            backup_interval_hours: default_backup_hours(),
            backup_keep: default_backup_keep(),
        }
    }
}

/// Argon2id tuning. Defaults sized for Raspberry-Pi-class hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default = "default_argon2_memory")]
    pub argon2_memory_kib: u32,
    #[serde(default = "default_argon2_time")]
    pub argon2_time_cost: u32,
    #[serde(default = "default_argon2_parallelism")]
    pub argon2_parallelism: u32,
    /// Keep a master-wrapped copy of each user key so an operator can issue
    /// a temporary password with `!recover` without destroying stored mail.
    #[serde(default = "default_true")]
    pub recovery_enabled: bool,
}

fn default_argon2_memory() -> u32 {
    32 * 1024
}
fn default_argon2_time() -> u32 {
    3
}
fn default_argon2_parallelism() -> u32 {
    1
}
fn default_true() -> bool {
    true
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_memory_kib: default_argon2_memory(),
            argon2_time_cost: default_argon2_time(),
            argon2_parallelism: default_argon2_parallelism(),
            recovery_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_max_failed_logins")]
    pub max_failed_logins: u32,
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: u32,
    #[serde(default = "default_login_attempts_per_minute")]
    pub login_attempts_per_minute: u32,
}

fn default_max_failed_logins() -> u32 {
    5
}
fn default_lockout_minutes() -> u32 {
    15
}
fn default_login_attempts_per_minute() -> u32 {
    5
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_failed_logins: default_max_failed_logins(),
            lockout_minutes: default_lockout_minutes(),
            login_attempts_per_minute: default_login_attempts_per_minute(),
        }
    }
}

/// One whitelisted remote BBS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Transport-level node identifier (e.g. "!a1b2c3d4").
    pub node_id: String,
    /// Human callsign used in `user@CALLSIGN` addressing.
    pub callsign: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default = "default_mail_retry_attempts")]
    pub mail_retry_attempts: u32,
    #[serde(default = "default_ack_timeout")]
    pub mail_ack_timeout_seconds: u64,
    /// Retry backoff schedule in seconds after the ACK timer fires.
    #[serde(default = "default_backoff")]
    pub mail_retry_backoff_seconds: Vec<u64>,
    #[serde(default = "default_max_hops")]
    pub mail_max_hops: u8,
    #[serde(default = "default_remote_body_max")]
    pub remote_body_max: usize,
    /// Hard expiry for in-flight deliveries.
    #[serde(default = "default_pending_expiry")]
    pub pending_expiry_seconds: u64,
    #[serde(default)]
    pub rap: RapConfig,
    #[serde(default)]
    pub boards: BoardSyncConfig,
}

fn default_mail_retry_attempts() -> u32 {
    3
}
fn default_ack_timeout() -> u64 {
    30
}
fn default_backoff() -> Vec<u64> {
    vec![60, 120, 240]
}
fn default_max_hops() -> u8 {
    5
}
fn default_remote_body_max() -> usize {
    450
}
fn default_pending_expiry() -> u64 {
    600
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            peers: Vec::new(),
            mail_retry_attempts: default_mail_retry_attempts(),
            mail_ack_timeout_seconds: default_ack_timeout(),
            mail_retry_backoff_seconds: default_backoff(),
            mail_max_hops: default_max_hops(),
            remote_body_max: default_remote_body_max(),
            pending_expiry_seconds: default_pending_expiry(),
            rap: RapConfig::default(),
            boards: BoardSyncConfig::default(),
        }
    }
}

/// Route Announcement Protocol tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RapConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,
    #[serde(default = "default_route_share_interval")]
    pub route_share_interval_seconds: u64,
    #[serde(default = "default_route_expiry")]
    pub route_expiry_seconds: u64,
    /// Consecutive missed heartbeats before a peer is unreachable.
    #[serde(default = "default_unreachable_threshold")]
    pub unreachable_threshold: u32,
    /// Total missed heartbeats before a peer is dead.
    #[serde(default = "default_dead_threshold")]
    pub dead_threshold: u32,
}

fn default_heartbeat_interval() -> u64 {
    12 * 3600
}
fn default_heartbeat_timeout() -> u64 {
    60
}
fn default_route_share_interval() -> u64 {
    24 * 3600
}
fn default_route_expiry() -> u64 {
    36 * 3600
}
fn default_unreachable_threshold() -> u32 {
    2
}
fn default_dead_threshold() -> u32 {
    5
}

impl Default for RapConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            heartbeat_timeout_seconds: default_heartbeat_timeout(),
            route_share_interval_seconds: default_route_share_interval(),
            route_expiry_seconds: default_route_expiry(),
            unreachable_threshold: default_unreachable_threshold(),
            dead_threshold: default_dead_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSyncConfig {
    /// Pending-post count that triggers an immediate batch.
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: u32,
    /// A single pending post is batched once it is this old.
    #[serde(default = "default_batch_interval")]
    pub batch_interval_seconds: u64,
    #[serde(default = "default_max_synced_boards")]
    pub max_synced_boards: usize,
    /// Posts per BOARDREQ batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_threshold() -> u32 {
    10
}
fn default_batch_interval() -> u64 {
    3600
}
fn default_max_synced_boards() -> usize {
    3
}
fn default_batch_size() -> usize {
    20
}

impl Default for BoardSyncConfig {
    fn default() -> Self {
        Self {
            batch_threshold: default_batch_threshold(),
            batch_interval_seconds: default_batch_interval(),
            max_synced_boards: default_max_synced_boards(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Minimum gap between any two outbound unicast frames (ms).
    #[serde(default = "default_unicast_gap")]
    pub unicast_gap_ms: u64,
    /// Spacing between MAILDAT chunks (ms, jittered upward slightly).
    #[serde(default = "default_mail_chunk_gap")]
    pub mail_chunk_gap_ms: u64,
    /// Spacing between BOARDDAT chunks (ms).
    #[serde(default = "default_board_chunk_gap")]
    pub board_chunk_gap_ms: u64,
    /// Minimum seconds between sync requests to the same peer.
    #[serde(default = "default_sync_request_interval")]
    pub sync_request_interval_seconds: u64,
}

fn default_unicast_gap() -> u64 {
    3500
}
fn default_mail_chunk_gap() -> u64 {
    2400
}
fn default_board_chunk_gap() -> u64 {
    3000
}
fn default_sync_request_interval() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            unicast_gap_ms: default_unicast_gap(),
            mail_chunk_gap_ms: default_mail_chunk_gap(),
            board_chunk_gap_ms: default_board_chunk_gap(),
            sync_request_interval_seconds: default_sync_request_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub security_file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: Some("advbbs.log".to_string()),
            security_file: Some("advbbs-security.log".to_string()),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("failed to read config file {}: {}", path, e))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("failed to parse config file {}: {}", path, e))?;
        config.normalize()?;
        Ok(config)
    }

    /// Write a default configuration file for the operator to edit.
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("failed to serialize default config: {}", e))?;
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("failed to write config file {}: {}", path, e))?;
        Ok(())
    }

    /// Normalize callsigns and reject configurations that cannot work.
    pub fn normalize(&mut self) -> Result<()> {
        self.bbs.callsign = validate_callsign(&self.bbs.callsign)?;
        let mut seen = std::collections::HashSet::new();
        for peer in &mut self.sync.peers {
            peer.callsign = validate_callsign(&peer.callsign)?;
            if peer.callsign == self.bbs.callsign {
                return Err(anyhow!(
                    "peer callsign {} collides with our own",
                    peer.callsign
                ));
            }
            if !seen.insert(peer.callsign.clone()) {
                return Err(anyhow!("duplicate peer callsign {}", peer.callsign));
            }
            if peer.node_id.trim().is_empty() {
                return Err(anyhow!("peer {} has an empty node_id", peer.callsign));
            }
        }
        if self.mesh.chunk_frame_bytes > self.mesh.max_frame_bytes {
            return Err(anyhow!(
                "mesh.chunk_frame_bytes ({}) exceeds mesh.max_frame_bytes ({})",
                self.mesh.chunk_frame_bytes,
                self.mesh.max_frame_bytes
            ));
        }
        if self.sync.mail_retry_backoff_seconds.is_empty() {
            return Err(anyhow!("sync.mail_retry_backoff_seconds must not be empty"));
        }
        Ok(())
    }

    /// Find a configured peer by transport node id.
    pub fn peer_by_node(&self, node_id: &str) -> Option<&PeerConfig> {
        self.sync.peers.iter().find(|p| p.node_id == node_id)
    }

    /// Find an enabled peer by callsign (case-insensitive).
    pub fn peer_by_callsign(&self, callsign: &str) -> Option<&PeerConfig> {
        let cs = callsign.to_uppercase();
        self.sync
            .peers
            .iter()
            .find(|p| p.enabled && p.callsign == cs)
    }

    /// True if `node_id` belongs to an enabled peer.
    pub fn is_peer(&self, node_id: &str) -> bool {
        self.peer_by_node(node_id).is_some_and(|p| p.enabled)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bbs: BbsConfig {
                name: "advBBS Station".to_string(),
                callsign: "ADV".to_string(),
                passphrase: String::new(),
                motd: default_motd(),
                session_timeout_minutes: default_session_timeout(),
                announcement_interval_hours: default_announce_hours(),
                announcement_channel: 0,
                announcement_message: String::new(),
                max_message_age_days: default_message_age_days(),
            },
            mesh: MeshConfig::default(),
            storage: StorageConfig::default(),
            crypto: CryptoConfig::default(),
            security: SecurityConfig::default(),
            sync: SyncConfig::default(),
            rate_limits: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(node: &str, cs: &str) -> PeerConfig {
        PeerConfig {
            node_id: node.to_string(),
            callsign: cs.to_string(),
            enabled: true,
        }
    }

    #[test]
    fn default_config_normalizes() {
        let mut config = Config::default();
        config.normalize().expect("defaults valid");
        assert_eq!(config.sync.mail_max_hops, 5);
        assert_eq!(config.sync.rap.unreachable_threshold, 2);
        assert_eq!(config.sync.boards.max_synced_boards, 3);
    }

    #[test]
    fn peer_callsigns_are_uppercased_and_unique() {
        let mut config = Config::default();
        config.sync.peers = vec![peer("!aaaa0001", "valley")];
        config.normalize().unwrap();
        assert_eq!(config.sync.peers[0].callsign, "VALLEY");
        assert!(config.peer_by_callsign("valley").is_some());

        config.sync.peers.push(peer("!aaaa0002", "VALLEY"));
        assert!(config.normalize().is_err());
    }

    #[test]
    fn peer_collision_with_own_callsign_rejected() {
        let mut config = Config::default();
        config.sync.peers = vec![peer("!aaaa0001", "adv")];
        assert!(config.normalize().is_err());
    }

    #[test]
    fn chunk_frame_must_fit_transport() {
        let mut config = Config::default();
        config.mesh.chunk_frame_bytes = 500;
        assert!(config.normalize().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let s = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&s).unwrap();
        assert_eq!(back.bbs.callsign, config.bbs.callsign);
        assert_eq!(back.rate_limits.unicast_gap_ms, 3500);
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let toml_src = r#"
            [bbs]
            name = "Test"
            callsign = "T1"

            [[sync.peers]]
            node_id = "!deadbeef"
            callsign = "T2"
        "#;
        let mut config: Config = toml::from_str(toml_src).unwrap();
        config.normalize().unwrap();
        assert!(config.is_peer("!deadbeef"));
        assert_eq!(config.sync.mail_ack_timeout_seconds, 30);
        assert_eq!(config.bbs.session_timeout_minutes, 30);
    }
}
