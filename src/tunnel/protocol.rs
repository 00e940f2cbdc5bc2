//! Relay wire protocol
//!
//! Newline-terminated UTF-8 text frames with pipe-separated fields:
//!
//! | Direction     | Frame           | Fields                          |
//! |---------------|-----------------|---------------------------------|
//! | client→relay  | `REGISTER`      | serverIdentity, localPort, label |
//! | relay→client  | `REGISTERED`    | publicHost, publicPort          |
//! | relay→client  | `HEARTBEAT`     | -                               |
//! | client→relay  | `HEARTBEAT_ACK` | -                               |
//! | client→relay  | `KEEPALIVE`     | -                               |
//! | relay→client  | `CONNECTION`    | connectionId                    |
//!
//! `CONNECTION|<id>` is also the first line a client writes on a data channel
//! it opens to the relay for that forwarded connection.

use std::fmt;
use thiserror::Error;

/// Field separator
const SEPARATOR: char = '|';

/// One relay protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// Client registration
    Register {
        /// Identity of the exposed server
        server_identity: String,
        /// Port of the local service
        local_port: u16,
        /// Free-form label shown by the relay
        label: String,
    },
    /// Registration accepted
    Registered {
        /// Host clients should connect to
        public_host: String,
        /// Port clients should connect to
        public_port: u16,
    },
    /// Relay liveness probe
    Heartbeat,
    /// Answer to [`RelayMessage::Heartbeat`]
    HeartbeatAck,
    /// Client liveness signal
    Keepalive,
    /// A public client connected; forward it
    Connection {
        /// Relay-assigned connection id
        id: String,
    },
}

/// Frame parsing errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Blank line
    #[error("Empty frame")]
    Empty,
    /// First field is not a known frame type
    #[error("Unknown frame type: {0}")]
    UnknownType(String),
    /// Known frame type with missing or invalid fields
    #[error("Malformed {kind} frame: {line}")]
    Malformed {
        /// Frame type
        kind: &'static str,
        /// Offending line
        line: String,
    },
}

impl RelayMessage {
    /// Frame type keyword
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Register { .. } => "REGISTER",
            RelayMessage::Registered { .. } => "REGISTERED",
            RelayMessage::Heartbeat => "HEARTBEAT",
            RelayMessage::HeartbeatAck => "HEARTBEAT_ACK",
            RelayMessage::Keepalive => "KEEPALIVE",
            RelayMessage::Connection { .. } => "CONNECTION",
        }
    }

    /// Encode as a wire line including the trailing newline
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }

    /// Parse one line (trailing `\r\n` / `\n` allowed)
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(FrameError::Empty);
        }

        let fields: Vec<&str> = line.split(SEPARATOR).collect();
        let malformed = |kind: &'static str| FrameError::Malformed {
            kind,
            line: line.to_string(),
        };

        match fields[0] {
            "REGISTER" => {
                if fields.len() < 4 {
                    return Err(malformed("REGISTER"));
                }
                let local_port = fields[2].parse().map_err(|_| malformed("REGISTER"))?;
                Ok(RelayMessage::Register {
                    server_identity: fields[1].to_string(),
                    local_port,
                    label: fields[3].to_string(),
                })
            }
            "REGISTERED" => {
                if fields.len() < 3 || fields[1].is_empty() {
                    return Err(malformed("REGISTERED"));
                }
                let public_port = match fields[2].trim().parse::<u16>() {
                    Ok(p) if p > 0 => p,
                    _ => return Err(malformed("REGISTERED")),
                };
                Ok(RelayMessage::Registered {
                    public_host: fields[1].to_string(),
                    public_port,
                })
            }
            "HEARTBEAT" => Ok(RelayMessage::Heartbeat),
            "HEARTBEAT_ACK" => Ok(RelayMessage::HeartbeatAck),
            "KEEPALIVE" => Ok(RelayMessage::Keepalive),
            "CONNECTION" => match fields.get(1) {
                Some(id) if !id.is_empty() => Ok(RelayMessage::Connection { id: id.to_string() }),
                _ => Err(malformed("CONNECTION")),
            },
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for RelayMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayMessage::Register {
                server_identity,
                local_port,
                label,
            } => write!(
                f,
                "REGISTER|{}|{}|{}",
                field(server_identity),
                local_port,
                field(label)
            ),
            RelayMessage::Registered {
                public_host,
                public_port,
            } => write!(f, "REGISTERED|{}|{}", field(public_host), public_port),
            RelayMessage::Connection { id } => write!(f, "CONNECTION|{}", field(id)),
            other => f.write_str(other.kind()),
        }
    }
}

/// Fields must not carry separators or line breaks
fn field(value: &str) -> String {
    value.replace([SEPARATOR, '\r', '\n'], "_")
}
