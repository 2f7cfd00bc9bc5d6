//! Admission rule and search frontier.
//!
//! The Leader and every Oversight agency run exactly this code over exactly
//! the same signed responses, so they build identical frontiers and
//! therefore byte-identical batches for the next round.
//!
//! # Admission Rule
//!
//! For a `Data` response at distance `d` carrying `n` neighbor tokens:
//!
//! - `d == max_distance`: admit nothing (the search stops here)
//! - `d > 0` and `n > max_degree`: admit nothing (high-degree node)
//! - otherwise: admit every neighbor token under its owning telecom
//!
//! The target (distance 0) is always expanded regardless of its degree.

use std::collections::BTreeMap;

use chaining_proto::{IdentityToken, TelecomId};

use crate::config::SearchParams;

/// Outcome of applying the admission rule to one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Enqueue every neighbor.
    Expand,
    /// Distance limit reached.
    DistanceLimit,
    /// Too many neighbors beyond distance 0.
    DegreeLimit,
}

/// Decide whether neighbors found at `distance` enter the frontier.
pub fn admit(params: &SearchParams, distance: u32, neighbors: usize) -> Admission {
    if distance >= params.max_distance {
        Admission::DistanceLimit
    } else if distance > 0 && neighbors > params.max_degree as usize {
        Admission::DegreeLimit
    } else {
        Admission::Expand
    }
}

/// Counts of neighbors dropped by the admission rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Suppressed {
    /// Neighbors dropped at the distance limit.
    pub by_distance: usize,
    /// Neighbors dropped because their parent exceeded `max_degree`.
    pub by_degree: usize,
}

/// Pending tokens grouped by owning telecom.
///
/// Iteration order is ascending telecom id, then arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frontier {
    pending: BTreeMap<TelecomId, Vec<IdentityToken>>,
}

impl Frontier {
    /// Create an empty frontier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue one token under its owner.
    pub fn push(&mut self, token: IdentityToken) {
        self.pending.entry(token.owner).or_default().push(token);
    }

    /// Apply the admission rule and enqueue the admitted neighbors.
    pub fn admit_neighbors(
        &mut self,
        params: &SearchParams,
        distance: u32,
        neighbors: &[IdentityToken],
        suppressed: &mut Suppressed,
    ) -> Admission {
        let admission = admit(params, distance, neighbors.len());
        match admission {
            Admission::Expand => {
                for token in neighbors {
                    self.push(token.clone());
                }
            },
            Admission::DistanceLimit => suppressed.by_distance += neighbors.len(),
            Admission::DegreeLimit => suppressed.by_degree += neighbors.len(),
        }
        admission
    }

    /// Total pending tokens: the work remaining for the next round.
    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Returns true if no tokens are pending.
    pub fn is_empty(&self) -> bool {
        self.pending.values().all(Vec::is_empty)
    }

    /// Telecoms with pending tokens.
    pub fn telecoms(&self) -> impl Iterator<Item = TelecomId> + '_ {
        self.pending.iter().filter(|(_, tokens)| !tokens.is_empty()).map(|(&id, _)| id)
    }

    /// Take every pending token, leaving the frontier empty.
    pub fn drain(&mut self) -> BTreeMap<TelecomId, Vec<IdentityToken>> {
        std::mem::take(&mut self.pending)
    }
}
