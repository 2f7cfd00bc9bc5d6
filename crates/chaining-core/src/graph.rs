//! Telecom graph partitions, edge-list import and synthetic graphs.
//!
//! A partition file is a CBOR map `{user: [neighbor, ...]}` holding the
//! adjacency lists of every user the telecom owns. It is loaded once at
//! startup and never mutated.
//!
//! Graphs come from one of two places:
//!
//! - An edge list: one `source destination` pair per line, `#` lines are
//!   comments. Edges are undirected.
//! - [`generate_graph`], with either the two-class uniform degree model or
//!   a log-normal out-degree model.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs::File,
    io::{BufRead, BufReader, BufWriter},
    path::{Path, PathBuf},
};

use chaining_proto::{TelecomId, UserId, owner_of};
use rand::Rng;
use rand_distr::{Distribution, LogNormal};
use serde::{Deserialize, Serialize};

use crate::{ChainError, config::ConfigError};

/// Log-normal location fitted to phone-call degree data.
pub const LOG_NORMAL_MU: f64 = 1.6389;

/// Log-normal shape fitted to phone-call degree data.
pub const LOG_NORMAL_SIGMA: f64 = 1.5454;

/// One telecom's share of the social graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphPartition {
    adjacency: HashMap<UserId, Vec<UserId>>,
}

impl GraphPartition {
    /// Build from adjacency lists.
    pub fn new(adjacency: HashMap<UserId, Vec<UserId>>) -> Self {
        Self { adjacency }
    }

    /// Load a partition file.
    pub fn load(path: &Path) -> Result<Self, ChainError> {
        let reader = BufReader::new(File::open(path)?);
        let adjacency: HashMap<UserId, Vec<UserId>> = ciborium::de::from_reader(reader)
            .map_err(|e| ChainError::protocol(format!("bad graph file {}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), users = adjacency.len(), "loaded graph partition");
        Ok(Self { adjacency })
    }

    /// Write a partition file.
    pub fn save(&self, path: &Path) -> Result<(), ChainError> {
        let ordered: BTreeMap<_, _> = self.adjacency.iter().collect();
        let writer = BufWriter::new(File::create(path)?);
        ciborium::ser::into_writer(&ordered, writer).map_err(|e| {
            ChainError::protocol(format!("cannot write graph file {}: {e}", path.display()))
        })
    }

    /// Neighbors of `user`, or `None` if the partition does not hold it.
    pub fn neighbors(&self, user: UserId) -> Option<&[UserId]> {
        self.adjacency.get(&user).map(Vec::as_slice)
    }

    /// Number of users held.
    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    /// Returns true if the partition holds no users.
    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    /// Split a whole graph by owning telecom.
    pub fn split(graph: &BTreeMap<UserId, Vec<UserId>>, telecoms: u32) -> Vec<Self> {
        let mut parts: Vec<Self> = (0..telecoms).map(|_| Self::default()).collect();
        for (&user, neighbors) in graph {
            if let Some(owner) = owner_of(user, telecoms) {
                parts[owner.0 as usize].adjacency.insert(user, neighbors.clone());
            }
        }
        parts
    }

    /// Read an edge list and split it by owning telecom.
    pub fn from_edge_list(reader: impl BufRead, telecoms: u32) -> Result<Vec<Self>, ChainError> {
        if telecoms == 0 {
            let reason = "need at least one telecom".to_string();
            return Err(ConfigError::Invalid { reason }.into());
        }
        Ok(Self::split(&read_edge_list(reader)?, telecoms))
    }
}

/// Read an undirected edge list into sorted adjacency lists.
///
/// Blank lines and lines starting with `#` are skipped. Columns after the
/// first two are ignored. Repeated edges collapse; self-loops are dropped.
pub fn read_edge_list(
    reader: impl BufRead,
) -> Result<BTreeMap<UserId, Vec<UserId>>, ChainError> {
    let mut adjacency: BTreeMap<UserId, BTreeSet<UserId>> = BTreeMap::new();
    let mut edges = 0u64;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let bad_line = |reason: &str| ConfigError::Invalid {
            reason: format!("edge list line {}: {reason}: {line:?}", index + 1),
        };
        let mut columns = line.split_whitespace().map(str::parse::<UserId>);
        let (Some(source), Some(dest)) = (columns.next(), columns.next()) else {
            return Err(bad_line("expected two user ids").into());
        };
        let source = source.map_err(|_| bad_line("bad user id"))?;
        let dest = dest.map_err(|_| bad_line("bad user id"))?;

        adjacency.entry(source).or_default();
        if source != dest {
            adjacency.entry(source).or_default().insert(dest);
            adjacency.entry(dest).or_default().insert(source);
        }
        edges += 1;
    }

    tracing::info!(users = adjacency.len(), edges, "edge list read");
    Ok(adjacency
        .into_iter()
        .map(|(user, contacts)| (user, contacts.into_iter().collect()))
        .collect())
}

/// Conventional partition file name for `telecom` under `dir`.
pub fn partition_path(dir: &Path, telecom: TelecomId) -> PathBuf {
    dir.join(format!("{telecom}.graph"))
}

/// How many contacts each synthetic user gets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "kebab-case")]
pub enum DegreeModel {
    /// Each user is "large" with probability `large_chance` (a business),
    /// else "small"; its contact count is uniform in the matching range.
    /// Contacts are one-directional.
    Uniform,

    /// Each user draws `ceil(X)` contacts with `X` log-normal, and every
    /// contact is recorded on both ends.
    LogNormal {
        /// Location of the underlying normal.
        mu: f64,
        /// Shape of the underlying normal.
        sigma: f64,
    },
}

impl DegreeModel {
    /// Log-normal model with the fitted phone-call parameters.
    pub fn log_normal() -> Self {
        Self::LogNormal { mu: LOG_NORMAL_MU, sigma: LOG_NORMAL_SIGMA }
    }
}

/// Parameters for synthetic graphs over users `0..users`.
///
/// Contacts are uniform over all other users, without self-loops. The
/// degree ranges apply to [`DegreeModel::Uniform`] only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataGenParams {
    /// Number of users, ids `0..users`.
    pub users: u64,
    /// Degree model.
    pub model: DegreeModel,
    /// Probability a user is large.
    pub large_chance: f64,
    /// Smallest small-user degree.
    pub small_min: u64,
    /// Largest small-user degree.
    pub small_max: u64,
    /// Smallest large-user degree.
    pub large_min: u64,
    /// Largest large-user degree.
    pub large_max: u64,
}

impl DataGenParams {
    /// Default uniform distribution over `users` users.
    pub fn new(users: u64) -> Self {
        Self {
            users,
            model: DegreeModel::Uniform,
            large_chance: 0.01,
            small_min: 3,
            small_max: 200,
            large_min: 3,
            large_max: 5000,
        }
    }

    /// Check the model's parameters fit the user count.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid { reason };
        if self.users < 2 {
            return Err(invalid(format!("{} users cannot have contacts", self.users)));
        }

        match self.model {
            DegreeModel::Uniform => {
                if !(0.0..=1.0).contains(&self.large_chance) {
                    return Err(invalid(format!(
                        "large_chance {} is not a probability",
                        self.large_chance
                    )));
                }
                if self.small_min > self.small_max || self.large_min > self.large_max {
                    return Err(invalid("degree range minimum exceeds maximum".to_string()));
                }
                let widest = self.small_max.max(self.large_max);
                if widest >= self.users {
                    return Err(invalid(format!(
                        "degree up to {widest} needs more than {} users",
                        self.users
                    )));
                }
            },
            DegreeModel::LogNormal { mu, sigma } => {
                if !mu.is_finite() || !sigma.is_finite() || sigma <= 0.0 {
                    return Err(invalid(format!("log-normal mu {mu}, sigma {sigma} is unusable")));
                }
            },
        }
        Ok(())
    }
}

/// Generate a random contact graph.
pub fn generate_graph(
    params: &DataGenParams,
    rng: &mut impl Rng,
) -> Result<BTreeMap<UserId, Vec<UserId>>, ConfigError> {
    params.validate()?;
    match params.model {
        DegreeModel::Uniform => Ok(generate_uniform(params, rng)),
        DegreeModel::LogNormal { mu, sigma } => {
            let degrees = LogNormal::new(mu, sigma)
                .map_err(|e| ConfigError::Invalid { reason: format!("log-normal: {e}") })?;
            Ok(generate_log_normal(params.users, &degrees, rng))
        },
    }
}

/// Uniform contact other than `user` among `0..users`.
fn other_user(user: UserId, users: u64, rng: &mut impl Rng) -> UserId {
    // Skip over `user` to rule out self-contacts.
    let contact = rng.gen_range(0..users - 1);
    if contact >= user { contact + 1 } else { contact }
}

fn generate_uniform(params: &DataGenParams, rng: &mut impl Rng) -> BTreeMap<UserId, Vec<UserId>> {
    let mut graph = BTreeMap::new();
    for user in 0..params.users {
        let degree = if rng.gen_bool(params.large_chance) {
            rng.gen_range(params.large_min..=params.large_max)
        } else {
            rng.gen_range(params.small_min..=params.small_max)
        };

        let mut contacts = BTreeSet::new();
        while (contacts.len() as u64) < degree {
            contacts.insert(other_user(user, params.users, rng));
        }
        graph.insert(user, contacts.into_iter().collect());
    }
    graph
}

fn generate_log_normal(
    users: u64,
    degrees: &LogNormal<f64>,
    rng: &mut impl Rng,
) -> BTreeMap<UserId, Vec<UserId>> {
    let mut graph: BTreeMap<UserId, BTreeSet<UserId>> =
        (0..users).map(|user| (user, BTreeSet::new())).collect();

    for user in 0..users {
        // Samples are positive, so every user makes at least one contact.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let out_degree = degrees.sample(rng).ceil() as u64;
        for _ in 0..out_degree {
            let contact = other_user(user, users, rng);
            graph.entry(user).or_default().insert(contact);
            graph.entry(contact).or_default().insert(user);
        }
    }
    graph.into_iter().map(|(user, contacts)| (user, contacts.into_iter().collect())).collect()
}
