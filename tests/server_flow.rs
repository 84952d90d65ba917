//! End-to-end server behavior over an in-memory transport: the command
//! path, the federation whitelist, legacy-protocol rejection, and the
//! master-salt startup guard.

use advbbs::bbs::BbsServer;
use advbbs::config::{Config, CryptoConfig, PeerConfig};
use advbbs::mesh::TextEvent;
use advbbs::storage::StoreBuilder;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.bbs.name = "Test Station".to_string();
    config.bbs.callsign = "ADV".to_string();
    config.bbs.passphrase = "operator passphrase".to_string();
    config.crypto = CryptoConfig {
        argon2_memory_kib: 8,
        argon2_time_cost: 1,
        argon2_parallelism: 1,
        recovery_enabled: true,
    };
    config.storage.data_dir = dir.path().join("data").to_string_lossy().to_string();
    config.storage.backup_dir = dir.path().join("backups").to_string_lossy().to_string();
    config.sync.peers = vec![PeerConfig {
        node_id: "!peer1".to_string(),
        callsign: "RIDGE".to_string(),
        enabled: true,
    }];
    config
}

fn event(sender: &str, text: &str) -> TextEvent {
    TextEvent {
        sender: sender.to_string(),
        channel: 0,
        text: text.to_string(),
        snr: Some(7.5),
        rssi: Some(-80),
    }
}

#[tokio::test(start_paused = true)]
async fn register_login_and_default_boards() {
    let dir = TempDir::new().unwrap();
    let mut server = BbsServer::new(test_config(&dir)).await.unwrap();
    let transport = server.test_transport();

    server
        .handle_inbound(event("!user1", "!register alice secret123"))
        .await
        .unwrap();
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to.as_deref(), Some("!user1"));
    assert!(sent[0].text.contains("Welcome, alice"));

    // Default boards were seeded; only `general` is sync-enabled.
    let boards = server.store().list_boards().unwrap();
    let names: Vec<(&str, bool)> = boards
        .iter()
        .map(|b| (b.name.as_str(), b.synced))
        .collect();
    assert!(names.contains(&("general", true)));
    assert!(names.contains(&("local", false)));

    // The registering node is bound, so login from it works after logout.
    transport.clear();
    server
        .handle_inbound(event("!user1", "!logout"))
        .await
        .unwrap();
    server
        .handle_inbound(event("!user1", "!login alice secret123"))
        .await
        .unwrap();
    let sent = transport.sent();
    assert!(sent.last().unwrap().text.starts_with("Hello alice"));
}

#[tokio::test(start_paused = true)]
async fn federation_frames_from_non_peers_are_dropped() {
    let dir = TempDir::new().unwrap();
    let mut server = BbsServer::new(test_config(&dir)).await.unwrap();
    let transport = server.test_transport();

    // A stranger's MAILREQ is never honored - not even with a NAK.
    server
        .handle_inbound(event(
            "!rando",
            "MAILREQ|u-1|mallory|EVIL|alice|ADV|1|1|EVIL",
        ))
        .await
        .unwrap();
    assert!(transport.sent().is_empty());

    // The same frame from a whitelisted peer gets a proper response
    // (NOUSER, since nobody is registered yet).
    server
        .handle_inbound(event(
            "!peer1",
            "MAILREQ|u-1|mallory|RIDGE|alice|ADV|1|1|RIDGE",
        ))
        .await
        .unwrap();
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "MAILNAK|u-1|NOUSER");
}

#[tokio::test(start_paused = true)]
async fn legacy_fq51_frames_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut server = BbsServer::new(test_config(&dir)).await.unwrap();
    let transport = server.test_transport();

    server
        .handle_inbound(event("!peer1", "FQ51|1|SYNC_MSG|deadbeef"))
        .await
        .unwrap();
    assert!(transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rap_ping_from_peer_answers_pong() {
    let dir = TempDir::new().unwrap();
    let mut server = BbsServer::new(test_config(&dir)).await.unwrap();
    let transport = server.test_transport();

    server
        .handle_inbound(event("!peer1", "advBBS|1|RAP_PING|123456"))
        .await
        .unwrap();
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].text.starts_with("advBBS|1|RAP_PONG|"));
    assert!(sent[0].text.contains("ADV:0:1.0"));

    let peer = server.store().get_peer("!peer1").unwrap().unwrap();
    assert_eq!(peer.health, advbbs::storage::PeerHealth::Alive);
}

#[tokio::test(start_paused = true)]
async fn blanked_master_salt_refuses_startup() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    {
        let mut server = BbsServer::new(config.clone()).await.unwrap();
        server.test_transport();
        server
            .handle_inbound(event("!user1", "!register alice secret123"))
            .await
            .unwrap();
        assert_eq!(server.store().user_count().unwrap(), 1);
    }
    // Simulate a botched restore that blanked the salt row.
    {
        let store = StoreBuilder::new(&config.storage.data_dir).open().unwrap();
        store.corrupt_master_salt_for_test().unwrap();
    }
    let err = BbsServer::new(config).await.unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("corrupt store"), "got: {}", message);
    assert!(message.contains("master_key_salt"));
}
