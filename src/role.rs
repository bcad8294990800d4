//! Instance roles and request routing modes.

use std::fmt;

use serde::Serialize;

/// Role of a database instance as reported by its status call.
///
/// A live connection always carries a discovered role (`Master` or
/// `Replica`). `Unknown` is the sentinel stored on an endpoint before a
/// connection is established and after it is torn down; a connection with an
/// unknown role is never registered in any subpool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// No live connection, or the role has not been discovered yet.
    #[default]
    Unknown,
    /// Writable instance (`ro = false`).
    Master,
    /// Read-only instance (`ro = true`).
    Replica,
}

impl Role {
    #[inline]
    #[must_use]
    pub const fn is_master(&self) -> bool {
        matches!(self, Self::Master)
    }

    #[inline]
    #[must_use]
    pub const fn is_replica(&self) -> bool {
        matches!(self, Self::Replica)
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Master => "master",
            Self::Replica => "replica",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Routing directive supplied by the caller per operation.
///
/// Selects which role subpool a request is dispatched to, and in which order
/// the subpools are tried:
///
/// | Mode       | First try | Second try |
/// |------------|-----------|------------|
/// | `Any`      | any       | —          |
/// | `Rw`       | rw        | —          |
/// | `Ro`       | ro        | —          |
/// | `PreferRw` | rw        | ro         |
/// | `PreferRo` | ro        | rw         |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Any live instance, regardless of role.
    #[default]
    Any,
    /// Writable instances only.
    Rw,
    /// Read-only instances only.
    Ro,
    /// Prefer a writable instance, fall back to a read-only one.
    PreferRw,
    /// Prefer a read-only instance, fall back to a writable one.
    PreferRo,
}

impl Mode {
    /// Whether a connection with the given role matches this mode for
    /// watcher fan-out purposes. `Rw` matches masters, `Ro` matches
    /// replicas, every other mode matches all live connections.
    #[inline]
    #[must_use]
    pub const fn matches_role(&self, role: Role) -> bool {
        match self {
            Self::Rw => role.is_master(),
            Self::Ro => role.is_replica(),
            _ => true,
        }
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Rw => "rw",
            Self::Ro => "ro",
            Self::PreferRw => "prefer-rw",
            Self::PreferRo => "prefer-ro",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
