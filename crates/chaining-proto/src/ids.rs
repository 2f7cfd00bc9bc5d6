//! Party and user identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Plaintext identity of a user in the social graph.
pub type UserId = u64;

/// Agency index in `0..agencies`. The Leader is always [`AgencyId::LEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgencyId(pub u32);

impl AgencyId {
    /// The investigating agency.
    pub const LEADER: Self = Self(0);

    /// Returns true for the Leader.
    pub fn is_leader(self) -> bool {
        self == Self::LEADER
    }
}

impl fmt::Display for AgencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agency-{}", self.0)
    }
}

/// Telecom index in `0..telecoms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelecomId(pub u32);

impl fmt::Display for TelecomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "telecom-{}", self.0)
    }
}

/// Any protocol participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PartyId {
    /// Leader or Oversight agency.
    Agency(AgencyId),
    /// Data custodian.
    Telecom(TelecomId),
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agency(id) => id.fmt(f),
            Self::Telecom(id) => id.fmt(f),
        }
    }
}

impl From<AgencyId> for PartyId {
    fn from(id: AgencyId) -> Self {
        Self::Agency(id)
    }
}

impl From<TelecomId> for PartyId {
    fn from(id: TelecomId) -> Self {
        Self::Telecom(id)
    }
}

/// The telecom that holds `user`'s adjacency list.
///
/// Returns `None` when `telecoms` is zero.
pub fn owner_of(user: UserId, telecoms: u32) -> Option<TelecomId> {
    if telecoms == 0 {
        return None;
    }
    // The remainder is below `telecoms`, which fits in u32.
    #[allow(clippy::cast_possible_truncation)]
    Some(TelecomId((user % u64::from(telecoms)) as u32))
}
