//! Text control frames for the framed session protocol.
//!
//! A WebSocket carries exactly one TCP relay. Control traffic travels as
//! ASCII text frames; relay data travels as raw binary frames (which never
//! reach this codec) or, for backward compatibility, as `DATA:` text frames.
//!
//! ```text
//! CONNECT:<target>|<first-payload>   client -> server, exactly once
//! CONNECTED                          server -> client, upstream is open
//! DATA:<bytes>                       either direction, UTF-8 payload
//! CLOSE                              either direction, terminates
//! ERROR:<message>                    advisory; message may be JSON {msg,name}
//! PING / PONG                        application-level heartbeat
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Frame decode errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown control frame {0:?}")]
    UnknownControl(String),
}

/// Advisory error payload. The wire form is either a bare message or a JSON
/// body `{"msg": ..., "name": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ErrorInfo {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            name: None,
        }
    }

    pub fn named(msg: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            name: Some(name.into()),
        }
    }

    fn from_wire(s: &str) -> Self {
        if s.starts_with('{') {
            if let Ok(info) = serde_json::from_str::<ErrorInfo>(s) {
                return info;
            }
        }
        Self::new(s)
    }

    fn to_wire(&self) -> String {
        if self.name.is_some() {
            serde_json::to_string(self).unwrap_or_else(|_| self.msg.clone())
        } else {
            self.msg.clone()
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", self.msg, name),
            None => write!(f, "{}", self.msg),
        }
    }
}

/// A decoded text control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `CONNECT:<target>|<first-payload>`. Without a `|` the whole suffix is
    /// the target and the payload is empty.
    Connect { target: String, payload: String },
    Connected,
    Data(String),
    Close,
    Error(ErrorInfo),
    Ping,
    Pong,
}

impl Frame {
    /// Decode a text frame. Prefixes are case-sensitive ASCII.
    pub fn parse(s: &str) -> Result<Self, FrameError> {
        if let Some(rest) = s.strip_prefix("CONNECT:") {
            let (target, payload) = match rest.split_once('|') {
                Some((t, p)) => (t, p),
                None => (rest, ""),
            };
            return Ok(Frame::Connect {
                target: target.to_string(),
                payload: payload.to_string(),
            });
        }
        if let Some(rest) = s.strip_prefix("DATA:") {
            return Ok(Frame::Data(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("ERROR:") {
            return Ok(Frame::Error(ErrorInfo::from_wire(rest)));
        }
        match s {
            "CONNECTED" => Ok(Frame::Connected),
            "CLOSE" => Ok(Frame::Close),
            "PING" => Ok(Frame::Ping),
            "PONG" => Ok(Frame::Pong),
            _ => Err(FrameError::UnknownControl(s.chars().take(64).collect())),
        }
    }

    /// Encode into the wire text.
    pub fn encode(&self) -> String {
        match self {
            Frame::Connect { target, payload } => format!("CONNECT:{}|{}", target, payload),
            Frame::Connected => "CONNECTED".to_string(),
            Frame::Data(payload) => format!("DATA:{}", payload),
            Frame::Close => "CLOSE".to_string(),
            Frame::Error(info) => format!("ERROR:{}", info.to_wire()),
            Frame::Ping => "PING".to_string(),
            Frame::Pong => "PONG".to_string(),
        }
    }
}
