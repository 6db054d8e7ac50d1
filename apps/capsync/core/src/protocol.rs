//! Text frames exchanged on the participant (`/ws`) and observer (`/status`)
//! channels.
//!
//! Inbound: exactly `"0"` or `"1"`. Outbound: `"0"`/`"1"` for the flag and
//! `"c <n>"` for the participant count. There is no error frame; anything the
//! server cannot parse is dropped on the floor.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Prefix of a participant-count status frame.
pub const COUNT_PREFIX: &str = "c ";

/// A participant's request to move the flag to `enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleRequest {
    pub enabled: bool,
}

impl ToggleRequest {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Parses an inbound text payload.
    ///
    /// Length is measured in characters, not bytes, so a single multi-byte
    /// character is reported as an unknown value rather than a length error.
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let mut chars = payload.chars();
        match (chars.next(), chars.next()) {
            (Some('1'), None) => Ok(Self::new(true)),
            (Some('0'), None) => Ok(Self::new(false)),
            (Some(other), None) => Err(ProtocolError::UnknownValue(other)),
            _ => Err(ProtocolError::InvalidLength {
                len: payload.chars().count(),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        flag_str(self.enabled)
    }
}

impl FromStr for ToggleRequest {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMessage {
    /// Current flag value, rendered as `"1"` or `"0"`.
    State(bool),
    /// Number of connected participants, rendered as `"c <n>"`.
    Count(usize),
}

impl StatusMessage {
    pub fn is_state(&self) -> bool {
        matches!(self, StatusMessage::State(_))
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusMessage::State(enabled) => f.write_str(flag_str(*enabled)),
            StatusMessage::Count(count) => write!(f, "{COUNT_PREFIX}{count}"),
        }
    }
}

impl FromStr for StatusMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" => Ok(StatusMessage::State(true)),
            "0" => Ok(StatusMessage::State(false)),
            other => {
                let digits = other
                    .strip_prefix(COUNT_PREFIX)
                    .ok_or_else(|| ProtocolError::MalformedStatus(other.to_owned()))?;
                digits
                    .parse()
                    .map(StatusMessage::Count)
                    .map_err(|_| ProtocolError::MalformedStatus(other.to_owned()))
            }
        }
    }
}

/// Reasons a frame could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("toggle payload must be one character, got {len}")]
    InvalidLength { len: usize },
    #[error("toggle payload must be '0' or '1', got {0:?}")]
    UnknownValue(char),
    #[error("toggle payload must be text")]
    NotText,
    #[error("unrecognised status frame {0:?}")]
    MalformedStatus(String),
}

impl ProtocolError {
    /// Low-cardinality label for counters.
    pub fn metric_label(&self) -> &'static str {
        match self {
            ProtocolError::InvalidLength { .. } => "invalid_length",
            ProtocolError::UnknownValue(_) => "unknown_value",
            ProtocolError::NotText => "not_text",
            ProtocolError::MalformedStatus(_) => "malformed_status",
        }
    }
}

fn flag_str(enabled: bool) -> &'static str {
    if enabled {
        "1"
    } else {
        "0"
    }
}
