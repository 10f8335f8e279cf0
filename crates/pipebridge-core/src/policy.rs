//! Queue overflow and output fan-out policies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// What `submit` does when the input queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Wait until the stdin writer frees a slot.
    #[default]
    Block,
    /// Fail immediately with a queue-full error.
    Reject,
    /// Evict the oldest queued line to make room.
    DropOldest,
}

impl OverflowPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Reject => "reject",
            Self::DropOldest => "drop-oldest",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "reject" => Ok(Self::Reject),
            "drop-oldest" | "drop_oldest" => Ok(Self::DropOldest),
            _ => Err(Error::UnknownPolicy {
                kind: "overflow",
                value: s.to_string(),
            }),
        }
    }
}

/// How output messages are distributed among connected clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FanoutPolicy {
    /// Each message goes to exactly one connection. Connections waiting for
    /// output are served in the order they started waiting.
    #[default]
    SingleConsumer,
    /// Every connection receives every message emitted while it is connected.
    Broadcast,
}

impl FanoutPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SingleConsumer => "single-consumer",
            Self::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for FanoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FanoutPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single-consumer" | "single_consumer" | "single" => Ok(Self::SingleConsumer),
            "broadcast" => Ok(Self::Broadcast),
            _ => Err(Error::UnknownPolicy {
                kind: "fanout",
                value: s.to_string(),
            }),
        }
    }
}
