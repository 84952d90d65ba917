//! Federation wire protocol and engines.
//!
//! Everything between BBS instances is ASCII and pipe-delimited. Control
//! traffic (RAP, handshake, generic receipts) rides inside the versioned
//! envelope `advBBS|1|<TYPE>|<payload>`; the mail and board transfer frames
//! are bare positional frames (`MAILREQ|...`, `BOARDDAT|...`) so their
//! first field doubles as the demux key. The retired `FQ51|` prefix is a
//! migration artifact and is rejected at parse time.
//!
//! User content never carries a raw `|`: fields are pipe-escaped before
//! framing, and batch payloads use the 0x1F/0x1E separators instead.

pub mod boards;
pub mod chunker;
pub mod limiter;
pub mod mail;
pub mod rap;

use thiserror::Error;

pub use limiter::SendClass;

pub const PROTO_NAME: &str = "advBBS";
pub const PROTO_VERSION: &str = "1";
const LEGACY_PREFIX: &str = "FQ51|";

/// An outbound frame an engine wants transmitted. Engines never touch the
/// transport directly; the server paces these through the rate limiter.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Destination node id.
    pub to: String,
    pub frame: String,
    pub class: SendClass,
    /// Send with a transport-level awaited ack (mail data chunks).
    pub await_ack: bool,
    /// Delivery UUID for awaited-ack frames, so a transport failure can be
    /// reported back to the owning state machine.
    pub tag: Option<String>,
}

impl Outbound {
    pub fn control(to: impl Into<String>, frame: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            frame: frame.into(),
            class: SendClass::Unicast,
            await_ack: false,
            tag: None,
        }
    }

    pub fn mail_chunk(
        to: impl Into<String>,
        frame: impl Into<String>,
        uuid: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            frame: frame.into(),
            class: SendClass::MailChunk,
            await_ack: true,
            tag: Some(uuid.into()),
        }
    }

    pub fn board_chunk(to: impl Into<String>, frame: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            frame: frame.into(),
            class: SendClass::BoardChunk,
            await_ack: false,
            tag: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// A pre-rename `FQ51|` frame. Incompatible; never serviced.
    #[error("legacy FQ51 frame rejected")]
    LegacyProtocol,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Reason codes carried by MAILNAK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NakReason {
    Loop,
    MaxHops,
    NoRoute,
    NoUser,
    Other(String),
}

impl NakReason {
    pub fn code(&self) -> &str {
        match self {
            NakReason::Loop => "LOOP",
            NakReason::MaxHops => "MAXHOPS",
            NakReason::NoRoute => "NOROUTE",
            NakReason::NoUser => "NOUSER",
            NakReason::Other(code) => code,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "LOOP" => NakReason::Loop,
            "MAXHOPS" => NakReason::MaxHops,
            "NOROUTE" => NakReason::NoRoute,
            "NOUSER" => NakReason::NoUser,
            other => NakReason::Other(other.to_string()),
        }
    }

    /// Human rendering for the sending user.
    pub fn describe(&self) -> String {
        match self {
            NakReason::Loop => "routing loop detected".to_string(),
            NakReason::MaxHops => "too many hops to destination".to_string(),
            NakReason::NoRoute => "no route to destination BBS".to_string(),
            NakReason::NoUser => "no such user at destination BBS".to_string(),
            NakReason::Other(code) => format!("rejected ({})", code),
        }
    }
}

/// Parsed MAILREQ envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailReq {
    pub uuid: String,
    pub from_user: String,
    pub from_bbs: String,
    pub to_user: String,
    pub to_bbs: String,
    pub hop: u8,
    pub num_parts: u32,
    /// Callsigns the request has visited, origin first.
    pub route: Vec<String>,
}

impl MailReq {
    pub fn to_wire(&self) -> String {
        format!(
            "MAILREQ|{}|{}|{}|{}|{}|{}|{}|{}",
            self.uuid,
            self.from_user,
            self.from_bbs,
            self.to_user,
            self.to_bbs,
            self.hop,
            self.num_parts,
            self.route.join(",")
        )
    }

    pub fn route_contains(&self, callsign: &str) -> bool {
        let upper = callsign.to_uppercase();
        self.route.iter().any(|r| r.to_uppercase() == upper)
    }
}

/// Every federation frame this node understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    RapPing {
        ts_us: i64,
    },
    RapPong {
        ts_us: i64,
        routes: String,
    },
    RapRoutes {
        routes: String,
    },
    Hello {
        callsign: String,
        name: String,
        capabilities: Vec<String>,
    },
    SyncAck {
        uuid: String,
    },
    MailReq(MailReq),
    MailAck {
        uuid: String,
    },
    MailNak {
        uuid: String,
        reason: NakReason,
    },
    MailDat {
        uuid: String,
        part: u32,
        total: u32,
        data: String,
    },
    MailDlv {
        uuid: String,
        dest: String,
    },
    BoardReq {
        board: String,
        count: u32,
        since_us: i64,
    },
    BoardAck {
        board: String,
    },
    BoardNak {
        board: String,
        reason: String,
    },
    BoardDat {
        board: String,
        part: u32,
        total: u32,
        payload: String,
    },
    BoardDlv {
        board: String,
    },
}

impl Frame {
    pub fn to_wire(&self) -> String {
        match self {
            Frame::RapPing { ts_us } => envelope("RAP_PING", &ts_us.to_string()),
            Frame::RapPong { ts_us, routes } => {
                envelope("RAP_PONG", &format!("{}|{}", ts_us, routes))
            }
            Frame::RapRoutes { routes } => envelope("RAP_ROUTES", routes),
            Frame::Hello {
                callsign,
                name,
                capabilities,
            } => envelope(
                "HELLO",
                &format!("{}:{}|{}", callsign, name, capabilities.join(",")),
            ),
            Frame::SyncAck { uuid } => envelope("SYNC_ACK", uuid),
            Frame::MailReq(req) => req.to_wire(),
            Frame::MailAck { uuid } => format!("MAILACK|{}|OK", uuid),
            Frame::MailNak { uuid, reason } => format!("MAILNAK|{}|{}", uuid, reason.code()),
            Frame::MailDat {
                uuid,
                part,
                total,
                data,
            } => format!("MAILDAT|{}|{}/{}|{}", uuid, part, total, data),
            Frame::MailDlv { uuid, dest } => format!("MAILDLV|{}|OK|{}", uuid, dest),
            Frame::BoardReq {
                board,
                count,
                since_us,
            } => format!("BOARDREQ|{}|{}|{}", board, count, since_us),
            Frame::BoardAck { board } => format!("BOARDACK|{}", board),
            Frame::BoardNak { board, reason } => format!("BOARDNAK|{}|{}", board, reason),
            Frame::BoardDat {
                board,
                part,
                total,
                payload,
            } => format!("BOARDDAT|{}|{}/{}|{}", board, part, total, payload),
            Frame::BoardDlv { board } => format!("BOARDDLV|{}", board),
        }
    }

    /// Parse an inbound payload. `Ok(None)` means the payload is not
    /// federation traffic (a user command, plaintext, noise).
    pub fn parse(raw: &str) -> Result<Option<Frame>, FrameError> {
        let raw = raw.trim();
        if raw.starts_with(LEGACY_PREFIX) {
            return Err(FrameError::LegacyProtocol);
        }
        if let Some(rest) = raw.strip_prefix("advBBS|") {
            return parse_envelope(rest).map(Some);
        }
        // Bare transfer frames are recognized by their exact head field,
        // so chat text that merely starts with "MAIL" stays user traffic.
        let head = raw.split('|').next().unwrap_or_default();
        if matches!(
            head,
            "MAILREQ" | "MAILACK" | "MAILNAK" | "MAILDAT" | "MAILDLV" | "BOARDREQ" | "BOARDACK"
                | "BOARDNAK" | "BOARDDAT" | "BOARDDLV"
        ) {
            return parse_bare(raw).map(Some);
        }
        Ok(None)
    }
}

fn envelope(msg_type: &str, payload: &str) -> String {
    format!("{}|{}|{}|{}", PROTO_NAME, PROTO_VERSION, msg_type, payload)
}

fn parse_envelope(rest: &str) -> Result<Frame, FrameError> {
    // rest = "<version>|<type>|<payload...>"
    let mut parts = rest.splitn(3, '|');
    let version = parts.next().unwrap_or_default();
    let msg_type = parts
        .next()
        .ok_or_else(|| FrameError::Malformed("missing frame type".into()))?;
    let payload = parts.next().unwrap_or_default();
    if version != PROTO_VERSION {
        return Err(FrameError::UnsupportedVersion(version.to_string()));
    }
    match msg_type {
        "RAP_PING" => Ok(Frame::RapPing {
            ts_us: payload.parse().unwrap_or(0),
        }),
        "RAP_PONG" => {
            let (ts, routes) = payload.split_once('|').unwrap_or((payload, ""));
            Ok(Frame::RapPong {
                ts_us: ts.parse().unwrap_or(0),
                routes: routes.to_string(),
            })
        }
        "RAP_ROUTES" => Ok(Frame::RapRoutes {
            routes: payload.to_string(),
        }),
        "HELLO" => {
            let (info, caps) = payload.split_once('|').unwrap_or((payload, ""));
            let (callsign, name) = info.split_once(':').unwrap_or((info, info));
            Ok(Frame::Hello {
                callsign: callsign.to_uppercase(),
                name: name.to_string(),
                capabilities: caps
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect(),
            })
        }
        "SYNC_ACK" => Ok(Frame::SyncAck {
            uuid: payload.to_string(),
        }),
        other => Err(FrameError::Malformed(format!("unknown type {}", other))),
    }
}

fn parse_part_total(s: &str) -> Result<(u32, u32), FrameError> {
    let (part, total) = s
        .split_once('/')
        .ok_or_else(|| FrameError::Malformed(format!("bad part field '{}'", s)))?;
    let part: u32 = part
        .parse()
        .map_err(|_| FrameError::Malformed(format!("bad part number '{}'", s)))?;
    let total: u32 = total
        .parse()
        .map_err(|_| FrameError::Malformed(format!("bad part total '{}'", s)))?;
    if part == 0 || total == 0 || part > total {
        return Err(FrameError::Malformed(format!("part out of range '{}'", s)));
    }
    Ok((part, total))
}

fn parse_bare(raw: &str) -> Result<Frame, FrameError> {
    let head = raw.split('|').next().unwrap_or_default();
    match head {
        "MAILREQ" => {
            let parts: Vec<&str> = raw.splitn(9, '|').collect();
            if parts.len() < 9 {
                return Err(FrameError::Malformed(format!(
                    "MAILREQ needs 9 fields, got {}",
                    parts.len()
                )));
            }
            let hop: u8 = parts[6]
                .parse()
                .map_err(|_| FrameError::Malformed("bad hop count".into()))?;
            let num_parts: u32 = parts[7]
                .parse()
                .map_err(|_| FrameError::Malformed("bad num_parts".into()))?;
            Ok(Frame::MailReq(MailReq {
                uuid: parts[1].to_string(),
                from_user: parts[2].to_string(),
                from_bbs: parts[3].to_uppercase(),
                to_user: parts[4].to_string(),
                to_bbs: parts[5].to_uppercase(),
                hop,
                num_parts,
                route: parts[8]
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_uppercase())
                    .collect(),
            }))
        }
        "MAILACK" => {
            let parts: Vec<&str> = raw.splitn(3, '|').collect();
            if parts.len() < 3 {
                return Err(FrameError::Malformed("short MAILACK".into()));
            }
            Ok(Frame::MailAck {
                uuid: parts[1].to_string(),
            })
        }
        "MAILNAK" => {
            let parts: Vec<&str> = raw.splitn(3, '|').collect();
            if parts.len() < 3 {
                return Err(FrameError::Malformed("short MAILNAK".into()));
            }
            Ok(Frame::MailNak {
                uuid: parts[1].to_string(),
                reason: NakReason::from_code(parts[2]),
            })
        }
        "MAILDAT" => {
            let parts: Vec<&str> = raw.splitn(4, '|').collect();
            if parts.len() < 4 {
                return Err(FrameError::Malformed("short MAILDAT".into()));
            }
            let (part, total) = parse_part_total(parts[2])?;
            Ok(Frame::MailDat {
                uuid: parts[1].to_string(),
                part,
                total,
                data: parts[3].to_string(),
            })
        }
        "MAILDLV" => {
            let parts: Vec<&str> = raw.splitn(4, '|').collect();
            if parts.len() < 4 {
                return Err(FrameError::Malformed("short MAILDLV".into()));
            }
            Ok(Frame::MailDlv {
                uuid: parts[1].to_string(),
                dest: parts[3].to_string(),
            })
        }
        "BOARDREQ" => {
            let parts: Vec<&str> = raw.splitn(4, '|').collect();
            if parts.len() < 4 {
                return Err(FrameError::Malformed("short BOARDREQ".into()));
            }
            Ok(Frame::BoardReq {
                board: parts[1].to_string(),
                count: parts[2].parse().unwrap_or(0),
                since_us: parts[3].parse().unwrap_or(0),
            })
        }
        "BOARDACK" => {
            let parts: Vec<&str> = raw.splitn(2, '|').collect();
            if parts.len() < 2 {
                return Err(FrameError::Malformed("short BOARDACK".into()));
            }
            Ok(Frame::BoardAck {
                board: parts[1].to_string(),
            })
        }
        "BOARDNAK" => {
            let parts: Vec<&str> = raw.splitn(3, '|').collect();
            if parts.len() < 3 {
                return Err(FrameError::Malformed("short BOARDNAK".into()));
            }
            Ok(Frame::BoardNak {
                board: parts[1].to_string(),
                reason: parts[2].to_string(),
            })
        }
        "BOARDDAT" => {
            let parts: Vec<&str> = raw.splitn(4, '|').collect();
            if parts.len() < 4 {
                return Err(FrameError::Malformed("short BOARDDAT".into()));
            }
            let (part, total) = parse_part_total(parts[2])?;
            Ok(Frame::BoardDat {
                board: parts[1].to_string(),
                part,
                total,
                payload: parts[3].to_string(),
            })
        }
        "BOARDDLV" => {
            let parts: Vec<&str> = raw.splitn(2, '|').collect();
            if parts.len() < 2 {
                return Err(FrameError::Malformed("short BOARDDLV".into()));
            }
            Ok(Frame::BoardDlv {
                board: parts[1].to_string(),
            })
        }
        other => Err(FrameError::Malformed(format!("unknown frame head {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fq51_prefix_is_rejected() {
        assert_eq!(
            Frame::parse("FQ51|1|SYNC_MSG|abc"),
            Err(FrameError::LegacyProtocol)
        );
    }

    #[test]
    fn non_federation_payloads_pass_through() {
        assert_eq!(Frame::parse("!login alice pw").unwrap(), None);
        assert_eq!(Frame::parse("just some chatter").unwrap(), None);
        // Chat that merely starts with a frame word is still chat.
        assert_eq!(Frame::parse("MAIL me when you land").unwrap(), None);
        assert_eq!(Frame::parse("BOARD games tonight?").unwrap(), None);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        assert!(matches!(
            Frame::parse("advBBS|2|RAP_PING|123"),
            Err(FrameError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn rap_frames_round_trip() {
        let pong = Frame::RapPong {
            ts_us: 1_700_000,
            routes: "ADV:0:1.0;B1:1:0.90".to_string(),
        };
        let wire = pong.to_wire();
        assert_eq!(wire, "advBBS|1|RAP_PONG|1700000|ADV:0:1.0;B1:1:0.90");
        assert_eq!(Frame::parse(&wire).unwrap().unwrap(), pong);

        let ping = Frame::RapPing { ts_us: 42 };
        assert_eq!(Frame::parse(&ping.to_wire()).unwrap().unwrap(), ping);
    }

    #[test]
    fn mailreq_round_trip_uppercases_callsigns() {
        let req = MailReq {
            uuid: "u-1".to_string(),
            from_user: "alice".to_string(),
            from_bbs: "B0".to_string(),
            to_user: "bob".to_string(),
            to_bbs: "B4".to_string(),
            hop: 2,
            num_parts: 3,
            route: vec!["B0".to_string(), "B1".to_string()],
        };
        let wire = req.to_wire();
        assert_eq!(wire, "MAILREQ|u-1|alice|B0|bob|B4|2|3|B0,B1");
        match Frame::parse(&wire.to_lowercase().replace("mailreq", "MAILREQ")) {
            Ok(Some(Frame::MailReq(parsed))) => {
                assert_eq!(parsed.to_bbs, "B4");
                assert!(parsed.route_contains("b1"));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn maildat_keeps_pipes_in_payload() {
        // splitn(4) must leave the data field untouched even if it
        // contains separators (base64 payloads never do, but be safe).
        let frame = Frame::parse("MAILDAT|u-1|2/3|chunk|with|pipes")
            .unwrap()
            .unwrap();
        match frame {
            Frame::MailDat { part, total, data, .. } => {
                assert_eq!((part, total), (2, 3));
                assert_eq!(data, "chunk|with|pipes");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn part_total_bounds_checked() {
        assert!(Frame::parse("MAILDAT|u|0/3|x").is_err());
        assert!(Frame::parse("MAILDAT|u|4/3|x").is_err());
        assert!(Frame::parse("MAILDAT|u|nope|x").is_err());
    }

    #[test]
    fn board_frames_round_trip() {
        for frame in [
            Frame::BoardReq {
                board: "general".to_string(),
                count: 5,
                since_us: 1000,
            },
            Frame::BoardAck {
                board: "general".to_string(),
            },
            Frame::BoardNak {
                board: "general".to_string(),
                reason: "SYNC_DISABLED".to_string(),
            },
            Frame::BoardDlv {
                board: "general".to_string(),
            },
        ] {
            assert_eq!(Frame::parse(&frame.to_wire()).unwrap().unwrap(), frame);
        }
    }

    #[test]
    fn hello_parses_capabilities() {
        let hello = Frame::Hello {
            callsign: "RIDGE".to_string(),
            name: "Ridgeline BBS".to_string(),
            capabilities: vec!["mail".to_string(), "boards".to_string()],
        };
        assert_eq!(Frame::parse(&hello.to_wire()).unwrap().unwrap(), hello);
    }
}
