//! Identity and replication primitives shared by every engine component

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Namespaced identity of a managed cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Name of the member with the given ordinal (`{cluster}-{ordinal}`)
    pub fn member_name(&self, id: MemberId) -> String {
        format!("{}-{}", self.name, id.0)
    }

    /// Name of the data volume that belongs to a member ordinal
    pub fn volume_name(&self, id: MemberId) -> String {
        format!("data-{}-{}", self.name, id.0)
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Stable member identity: the ordinal within its cluster
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema,
)]
#[serde(transparent)]
pub struct MemberId(pub u32);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication role a member reports
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum MemberRole {
    Primary,
    Standby,
    #[default]
    Unknown,
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberRole::Primary => write!(f, "primary"),
            MemberRole::Standby => write!(f, "standby"),
            MemberRole::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health as seen by the topology observer
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum MemberHealth {
    Ready,
    #[default]
    NotReady,
    Unreachable,
}

/// Promotion epoch. Every promotion moves the cluster onto a new timeline.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema,
)]
#[serde(transparent)]
pub struct Timeline(pub u32);

impl Timeline {
    /// PostgreSQL starts every fresh cluster on timeline 1
    pub const INITIAL: Timeline = Timeline(1);

    pub fn next(self) -> Timeline {
        Timeline(self.0.saturating_add(1))
    }

    pub fn prev(self) -> Timeline {
        Timeline(self.0.saturating_sub(1).max(1))
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Timeline::INITIAL
    }
}

impl fmt::Display for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in the write-ahead log stream (an LSN)
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    JsonSchema,
)]
#[serde(transparent)]
pub struct WalPosition(pub u64);

impl WalPosition {
    /// Bytes this position trails `ahead` by; zero when not behind
    pub fn lag_behind(self, ahead: WalPosition) -> u64 {
        ahead.0.saturating_sub(self.0)
    }
}

impl fmt::Display for WalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Error parsing a textual `X/Y` position
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid WAL position: {0}")]
pub struct ParsePositionError(pub String);

impl FromStr for WalPosition {
    type Err = ParsePositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| ParsePositionError(s.to_string()))?;
        let hi = u64::from_str_radix(hi, 16).map_err(|_| ParsePositionError(s.to_string()))?;
        let lo = u64::from_str_radix(lo, 16).map_err(|_| ParsePositionError(s.to_string()))?;
        if hi > u64::from(u32::MAX) || lo > u64::from(u32::MAX) {
            return Err(ParsePositionError(s.to_string()));
        }
        Ok(WalPosition((hi << 32) | lo))
    }
}
