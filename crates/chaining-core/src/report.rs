//! Run telemetry handed to the reporting layer.

use std::{collections::BTreeMap, fmt, time::Duration};

use chaining_proto::{AgencyCiphertext, AgencyId, AuditOutcome};

/// Outcome and accounting of one completed run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Agency-ciphertexts discovered, in discovery order.
    pub outputs: Vec<AgencyCiphertext>,
    /// Rounds executed, the initial query included.
    pub rounds: u32,
    /// Neighbors of the target.
    pub target_degree: Option<usize>,
    /// Time to establish every connection.
    pub setup_time: Duration,
    /// Time from the initial query to the final audit.
    pub protocol_time: Duration,
    /// Bytes written to peers.
    pub bytes_sent: u64,
    /// Bytes read from peers.
    pub bytes_received: u64,
    /// Busy time reported by telecoms.
    pub telecom_cpu: Duration,
    /// Busy time reported by agencies.
    pub agency_cpu: Duration,
    /// Audit verdict of each Oversight agency.
    pub audits: BTreeMap<AgencyId, AuditOutcome>,
}

impl RunReport {
    /// Agency-ciphertexts discovered.
    pub fn outputs(&self) -> &[AgencyCiphertext] {
        &self.outputs
    }

    /// Setup plus protocol time.
    pub fn total_time(&self) -> Duration {
        self.setup_time + self.protocol_time
    }

    /// Returns true if every Oversight agency passed the run.
    pub fn all_audits_passed(&self) -> bool {
        self.audits.values().all(AuditOutcome::is_passed)
    }

    /// Add busy time reported in nanoseconds by a telecom.
    pub fn add_telecom_cpu(&mut self, nanos: u64) {
        self.telecom_cpu += Duration::from_nanos(nanos);
    }

    /// Add busy time reported in nanoseconds by an agency.
    pub fn add_agency_cpu(&mut self, nanos: u64) {
        self.agency_cpu += Duration::from_nanos(nanos);
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "users found: {}", self.outputs.len())?;
        if let Some(degree) = self.target_degree {
            writeln!(f, "target degree: {degree}")?;
        }
        writeln!(f, "rounds: {}", self.rounds)?;
        writeln!(f, "setup time: {:?}", self.setup_time)?;
        writeln!(f, "protocol time: {:?}", self.protocol_time)?;
        writeln!(f, "total time: {:?}", self.total_time())?;
        writeln!(f, "bytes sent: {}", self.bytes_sent)?;
        writeln!(f, "bytes received: {}", self.bytes_received)?;
        writeln!(f, "telecom cpu: {:?}", self.telecom_cpu)?;
        write!(f, "agency cpu: {:?}", self.agency_cpu)
    }
}
