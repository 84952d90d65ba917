//! Transport adapter between the BBS core and the radio driver.
//!
//! The driver itself (serial/TCP Meshtastic link) lives outside this crate;
//! what the core depends on is the contract below:
//!
//! * `send_unicast` returns once the radio has queued the frame;
//! * `send_unicast_await_ack` waits for the mesh-level ACK of a frame
//!   (used for mail data chunks);
//! * `broadcast` sends on a channel;
//! * inbound text arrives as [`TextEvent`]s on an unbounded mpsc channel.
//!
//! Drivers deliver receive callbacks and ACK signals on their own threads.
//! Those threads must only ever push into the mpsc channels or complete a
//! oneshot, never waiting for the session loop to make progress. Blocking the
//! driver callback until a cooperative task wakes shows up as phantom ACK
//! timeouts under load.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::logutil::escape_log;

/// One inbound text frame from the radio.
#[derive(Debug, Clone)]
pub struct TextEvent {
    /// Transport-level sender node id (e.g. "!a1b2c3d4").
    pub sender: String,
    pub channel: u8,
    pub text: String,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
}

/// Result of an awaited-ack unicast.
#[derive(Debug, Clone)]
pub struct AckOutcome {
    pub delivered: bool,
    pub detail: String,
}

/// A frame captured by the test transport.
#[derive(Debug, Clone)]
pub struct SentFrame {
    /// Unicast destination, or `None` for broadcasts.
    pub to: Option<String>,
    pub channel: Option<u8>,
    pub text: String,
    pub awaited_ack: bool,
}

/// The transport the server talks to. A detached station logs and drops
/// outbound traffic so the BBS keeps running without a radio.
#[derive(Debug)]
pub enum Transport {
    Detached,
    Channel(ChannelTransport),
}

impl Transport {
    pub async fn send_unicast(&self, node: &str, text: &str) -> Result<()> {
        match self {
            Transport::Detached => {
                debug!("no radio attached; dropping DM to {}: {}", node, escape_log(text));
                Ok(())
            }
            Transport::Channel(t) => t.record(Some(node), None, text, false),
        }
    }

    pub async fn send_unicast_await_ack(
        &self,
        node: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<AckOutcome> {
        match self {
            Transport::Detached => {
                debug!(
                    "no radio attached; dropping reliable DM to {} ({}s timeout): {}",
                    node,
                    timeout.as_secs(),
                    escape_log(text)
                );
                Ok(AckOutcome {
                    delivered: false,
                    detail: "no radio attached".to_string(),
                })
            }
            Transport::Channel(t) => {
                t.record(Some(node), None, text, true)?;
                Ok(t.scripted_ack(node))
            }
        }
    }

    pub async fn broadcast(&self, channel: u8, text: &str) -> Result<()> {
        match self {
            Transport::Detached => {
                debug!(
                    "no radio attached; dropping broadcast on ch{}: {}",
                    channel,
                    escape_log(text)
                );
                Ok(())
            }
            Transport::Channel(t) => t.record(None, Some(channel), text, false),
        }
    }

    pub fn is_attached(&self) -> bool {
        !matches!(self, Transport::Detached)
    }
}

#[derive(Default, Debug)]
struct ChannelState {
    sent: Vec<SentFrame>,
    /// Per-node scripted ack outcomes; nodes not listed ack successfully.
    nak_nodes: HashMap<String, String>,
}

/// In-memory transport used by tests and the loopback mode: records every
/// outbound frame and resolves awaited acks from a script.
#[derive(Clone, Default, Debug)]
pub struct ChannelTransport {
    state: Arc<Mutex<ChannelState>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, to: Option<&str>, channel: Option<u8>, text: &str, awaited: bool) -> Result<()> {
        let mut state = self.state.lock().expect("transport state");
        state.sent.push(SentFrame {
            to: to.map(|s| s.to_string()),
            channel,
            text: text.to_string(),
            awaited_ack: awaited,
        });
        Ok(())
    }

    fn scripted_ack(&self, node: &str) -> AckOutcome {
        let state = self.state.lock().expect("transport state");
        match state.nak_nodes.get(node) {
            Some(detail) => AckOutcome {
                delivered: false,
                detail: detail.clone(),
            },
            None => AckOutcome {
                delivered: true,
                detail: "acked".to_string(),
            },
        }
    }

    /// Make awaited-ack sends to `node` fail with `detail`.
    pub fn script_nak(&self, node: &str, detail: &str) {
        let mut state = self.state.lock().expect("transport state");
        state.nak_nodes.insert(node.to_string(), detail.to_string());
    }

    /// Snapshot of everything sent so far.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.state.lock().expect("transport state").sent.clone()
    }

    pub fn clear(&self) {
        self.state.lock().expect("transport state").sent.clear();
    }
}

/// Create the inbound event channel. The sender half goes to the driver's
/// receive thread; the receiver half is consumed by the session loop.
pub fn inbound_channel() -> (mpsc::UnboundedSender<TextEvent>, mpsc::UnboundedReceiver<TextEvent>) {
    mpsc::unbounded_channel()
}

/// Build the transport described by the config. Unknown or unbuilt drivers
/// degrade to detached so the station still serves whatever is reachable.
pub fn connect(transport: &str, port: &str) -> Transport {
    match transport {
        "none" | "" => Transport::Detached,
        other => {
            warn!(
                "transport driver '{}' (port '{}') is not built into this binary; \
                 starting detached",
                other, port
            );
            Transport::Detached
        }
    }
}
