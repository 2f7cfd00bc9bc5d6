//! Role configuration.
//!
//! Each role is configured by one TOML file deserialized into an explicit
//! struct and handed to the role by value. There is no process-wide mutable
//! configuration; log verbosity is a `tracing` filter owned by the binary.
//!
//! ```toml
//! agencies = 3
//! telecoms = 2
//! key_dir = "keys"
//! listen = "0.0.0.0:7000"
//!
//! [search]
//! target = 1
//! max_distance = 2
//! max_degree = 100
//!
//! [[telecom]]
//! id = 0
//! address = "10.0.0.5:7100"
//! ```

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chaining_proto::{AgencyId, TelecomId, UserId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::responder::MAX_WORKERS_ALLOWED;

/// Default number of connection attempts.
pub const DEFAULT_MAX_TRIES: u32 = 10;

/// Default pause between connection attempts.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Default time the Leader waits for every Oversight agency to connect.
pub const DEFAULT_ACCEPT_TIMEOUT_SECS: u64 = 60;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this role.
    #[error("cannot parse {}: {reason}", path.display())]
    Parse {
        /// File that was being parsed.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// Values are individually valid but inconsistent.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { reason: reason.into() }
}

/// Party counts shared by every role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Number of agencies, Leader included.
    pub agencies: u32,
    /// Number of telecoms.
    pub telecoms: u32,
}

impl Topology {
    /// Every agency id in ascending order.
    pub fn agency_ids(&self) -> impl Iterator<Item = AgencyId> {
        (0..self.agencies).map(AgencyId)
    }

    /// Every telecom id in ascending order.
    pub fn telecom_ids(&self) -> impl Iterator<Item = TelecomId> {
        (0..self.telecoms).map(TelecomId)
    }

    /// Number of Oversight agencies.
    pub fn oversight_count(&self) -> u32 {
        self.agencies.saturating_sub(1)
    }

    /// Check both counts are non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agencies == 0 {
            return Err(invalid("at least one agency (the Leader) is required"));
        }
        if self.telecoms == 0 {
            return Err(invalid("at least one telecom is required"));
        }
        Ok(())
    }
}

/// What the search is authorized to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Starting identity.
    pub target: UserId,
    /// Path length bound. Zero looks up only the target.
    #[serde(default)]
    pub max_distance: u32,
    /// Neighbor lists longer than this are not expanded (beyond distance 0).
    #[serde(default = "default_max_degree")]
    pub max_degree: u32,
}

fn default_max_degree() -> u32 {
    u32::MAX
}

impl SearchParams {
    /// Override individual fields, as command-line flags do.
    #[must_use]
    pub fn with_overrides(
        mut self,
        target: Option<UserId>,
        max_distance: Option<u32>,
        max_degree: Option<u32>,
    ) -> Self {
        if let Some(target) = target {
            self.target = target;
        }
        if let Some(max_distance) = max_distance {
            self.max_distance = max_distance;
        }
        if let Some(max_degree) = max_degree {
            self.max_degree = max_degree;
        }
        self
    }
}

/// Connection retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before giving up.
    pub max_tries: u32,
    /// Pause between attempts in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_tries: DEFAULT_MAX_TRIES, delay_ms: DEFAULT_RETRY_DELAY_MS }
    }
}

impl RetryPolicy {
    /// Pause between attempts.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Where to reach one telecom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelecomEndpoint {
    /// Telecom id.
    pub id: TelecomId,
    /// `host:port`.
    pub address: String,
}

/// Leader agency configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    /// Party counts.
    #[serde(flatten)]
    pub topology: Topology,
    /// Directory holding key files.
    pub key_dir: PathBuf,
    /// Address Oversight agencies connect to.
    pub listen: String,
    /// Search parameters.
    pub search: SearchParams,
    /// One endpoint per telecom.
    #[serde(rename = "telecom", default)]
    pub telecoms: Vec<TelecomEndpoint>,
    /// How long to wait for all Oversight agencies.
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_secs: u64,
    /// Output file for agency-ciphertexts.
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// CSV file a timing record is appended to after each run.
    #[serde(default)]
    pub timing_log: Option<PathBuf>,
    /// Telecom connection retry.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_accept_timeout() -> u64 {
    DEFAULT_ACCEPT_TIMEOUT_SECS
}

impl LeaderConfig {
    /// Load and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every telecom has exactly one endpoint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.topology.validate()?;

        let mut seen = BTreeSet::new();
        for endpoint in &self.telecoms {
            if endpoint.id.0 >= self.topology.telecoms {
                let telecoms = self.topology.telecoms;
                return Err(invalid(format!("{} is outside 0..{telecoms}", endpoint.id)));
            }
            if !seen.insert(endpoint.id) {
                return Err(invalid(format!("{} listed twice", endpoint.id)));
            }
        }
        if let Some(missing) = self.topology.telecom_ids().find(|id| !seen.contains(id)) {
            return Err(invalid(format!("no address configured for {missing}")));
        }
        Ok(())
    }

    /// Address of `telecom`.
    pub fn telecom_address(&self, telecom: TelecomId) -> Option<&str> {
        self.telecoms.iter().find(|e| e.id == telecom).map(|e| e.address.as_str())
    }

    /// How long to wait for all Oversight agencies.
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }
}

/// Oversight agency configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OversightConfig {
    /// Party counts.
    #[serde(flatten)]
    pub topology: Topology,
    /// This agency's id (never the Leader's).
    pub agency: AgencyId,
    /// Directory holding key files.
    pub key_dir: PathBuf,
    /// Leader's `host:port`.
    pub leader: String,
    /// Independently authorized search parameters.
    pub search: SearchParams,
    /// Output file for agency-ciphertexts.
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// CSV file a timing record is appended to after each run.
    #[serde(default)]
    pub timing_log: Option<PathBuf>,
    /// Leader connection retry.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl OversightConfig {
    /// Load and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the agency id is an Oversight id within range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.topology.validate()?;
        if self.agency.is_leader() {
            return Err(invalid("oversight agency id must not be 0 (the Leader)"));
        }
        if self.agency.0 >= self.topology.agencies {
            let agencies = self.topology.agencies;
            return Err(invalid(format!("{} is outside 0..{agencies}", self.agency)));
        }
        Ok(())
    }
}

/// Telecom configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelecomConfig {
    /// Party counts.
    #[serde(flatten)]
    pub topology: Topology,
    /// This telecom's id.
    pub id: TelecomId,
    /// Directory holding key files.
    pub key_dir: PathBuf,
    /// Address the Leader connects to.
    pub listen: String,
    /// Graph partition file.
    pub graph: PathBuf,
    /// Worker threads per batch; 0 selects the maximum.
    #[serde(default)]
    pub max_workers: usize,
}

impl TelecomConfig {
    /// Load and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the id is in range and the worker count within the hard cap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.topology.validate()?;
        if self.id.0 >= self.topology.telecoms {
            return Err(invalid(format!("{} is outside 0..{}", self.id, self.topology.telecoms)));
        }
        if self.max_workers > MAX_WORKERS_ALLOWED {
            return Err(invalid(format!(
                "max_workers {} exceeds the limit of {MAX_WORKERS_ALLOWED}",
                self.max_workers
            )));
        }
        Ok(())
    }

    /// Worker count actually used.
    pub fn effective_workers(&self) -> usize {
        if self.max_workers == 0 {
            tracing::warn!("max_workers is 0, using {MAX_WORKERS_ALLOWED}");
            MAX_WORKERS_ALLOWED
        } else {
            self.max_workers
        }
    }
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    toml::from_str(&text)
        .map_err(|e| ConfigError::Parse { path: path.to_path_buf(), reason: e.to_string() })
}
