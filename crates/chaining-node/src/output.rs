//! Output and timing files.
//!
//! The output file is a short `#` header followed by one hex-encoded
//! agency-ciphertext per line, in discovery order:
//!
//! ```text
//! # Data obtained by contact chaining search
//! # Timestamp:   1760745600
//! # Target:      42
//! # Path length: 2
//! 8c1f...
//! ```
//!
//! Each agency removes its own layer with [`strip_output_file`], which
//! copies the header, notes the removed layer and rewrites the values. When
//! the last layer comes off, the values are written as decimal user ids.
//!
//! The timing log is a CSV file; one record is appended per run.

use std::{
    fs::{self, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chaining_core::{
    ChainError, KeyStore, RunReport, SearchParams,
    disclose::{layers_remaining, reveal, strip_layer},
};
use chaining_proto::{AgencyCiphertext, UserId};

const TITLE: &str = "# Data obtained by contact chaining search";

const TIMING_HEADER: &str = "role,target,max_distance,max_degree,users_found,rounds,\
                             setup_ms,protocol_ms,total_ms,bytes_sent,bytes_received,\
                             telecom_cpu_ms,agency_cpu_ms";

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

/// Write the header and one hex line per agency-ciphertext.
pub fn write_outputs(
    path: &Path,
    params: &SearchParams,
    outputs: &[AgencyCiphertext],
) -> Result<(), ChainError> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    writeln!(out, "{TITLE}")?;
    writeln!(out, "# Timestamp:   {}", unix_now())?;
    writeln!(out, "# Target:      {}", params.target)?;
    writeln!(out, "# Path length: {}", params.max_distance)?;
    for value in outputs {
        writeln!(out, "{}", hex::encode(&value.0))?;
    }
    out.flush()?;

    tracing::info!(path = %path.display(), users = outputs.len(), "output written");
    Ok(())
}

/// Read an output file back, skipping header and blank lines.
pub fn read_outputs(path: &Path) -> Result<Vec<AgencyCiphertext>, ChainError> {
    parse_values(path, &fs::read_to_string(path)?)
}

fn parse_values(path: &Path, text: &str) -> Result<Vec<AgencyCiphertext>, ChainError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            hex::decode(line).map(AgencyCiphertext).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("{}: {e}", path.display()))
                    .into()
            })
        })
        .collect()
}

/// What [`strip_output_file`] left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stripped {
    /// Other agencies still hold layers; the file holds ciphertexts.
    Partial {
        /// Values rewritten.
        values: usize,
        /// Layers left on every value.
        layers_left: usize,
    },
    /// Every layer is gone; the file holds user ids.
    Revealed(Vec<UserId>),
}

/// Remove the key holder's layer from every value in `input` and write the
/// result to `output`.
///
/// All values must carry the same layers; a value missing this agency's
/// layer fails the whole file.
pub fn strip_output_file(
    keys: &KeyStore,
    input: &Path,
    output: &Path,
) -> Result<Stripped, ChainError> {
    let text = fs::read_to_string(input)?;
    let stripped = parse_values(input, &text)?
        .iter()
        .map(|value| strip_layer(keys, value))
        .collect::<Result<Vec<_>, _>>()?;

    let layers_left = stripped.first().map(layers_remaining).transpose()?.unwrap_or(0);
    for value in &stripped {
        let left = layers_remaining(value)?;
        if left != layers_left {
            let reason =
                format!("{}: values carry {left} and {layers_left} layers", input.display());
            return Err(io::Error::new(io::ErrorKind::InvalidData, reason).into());
        }
    }

    let mut out = BufWriter::new(fs::File::create(output)?);
    for line in text.lines().take_while(|line| line.starts_with('#')) {
        writeln!(out, "{line}")?;
    }
    writeln!(out, "# Layer removed: {}", keys.me())?;

    let result = if layers_left == 0 {
        let users = stripped.iter().map(reveal).collect::<Result<Vec<_>, _>>()?;
        writeln!(out, "# Disclosed user ids")?;
        for user in &users {
            writeln!(out, "{user}")?;
        }
        Stripped::Revealed(users)
    } else {
        for value in &stripped {
            writeln!(out, "{}", hex::encode(&value.0))?;
        }
        Stripped::Partial { values: stripped.len(), layers_left }
    };
    out.flush()?;

    tracing::info!(
        party = %keys.me(),
        input = %input.display(),
        output = %output.display(),
        values = stripped.len(),
        layers_left,
        "layer removed"
    );
    Ok(result)
}

fn millis(d: Duration) -> u128 {
    d.as_millis()
}

/// Append one CSV record for a finished run, writing the header first if
/// the file is new.
pub fn append_timing_record(
    path: &Path,
    role: &str,
    params: &SearchParams,
    report: &RunReport,
) -> Result<(), ChainError> {
    let is_new = fs::metadata(path).map_or(true, |m| m.len() == 0);
    let mut out = OpenOptions::new().create(true).append(true).open(path)?;

    if is_new {
        writeln!(out, "{TIMING_HEADER}")?;
    }
    writeln!(
        out,
        "{role},{},{},{},{},{},{},{},{},{},{},{},{}",
        params.target,
        params.max_distance,
        params.max_degree,
        report.outputs.len(),
        report.rounds,
        millis(report.setup_time),
        millis(report.protocol_time),
        millis(report.total_time()),
        report.bytes_sent,
        report.bytes_received,
        millis(report.telecom_cpu),
        millis(report.agency_cpu),
    )?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chaining_core::{KeyMaterial, Topology};
    use chaining_proto::{AgencyId, PartyId, TelecomId};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn params() -> SearchParams {
        SearchParams { target: 42, max_distance: 2, max_degree: 100 }
    }

    #[test]
    fn outputs_survive_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let outputs = vec![AgencyCiphertext(vec![0xab, 0xcd]), AgencyCiphertext(vec![0x01])];

        write_outputs(&path, &params(), &outputs).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], TITLE);
        assert!(lines[1].starts_with("# Timestamp:"));
        assert_eq!(lines[2], "# Target:      42");
        assert_eq!(lines[3], "# Path length: 2");
        assert_eq!(&lines[4..], ["abcd", "01"]);
        assert_eq!(read_outputs(&path).unwrap(), outputs);
    }

    #[test]
    fn bad_hex_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        fs::write(&path, "# header\nnot-hex\n").unwrap();
        assert!(matches!(read_outputs(&path), Err(ChainError::Io(_))));
    }

    #[test]
    fn timing_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timing.csv");
        let report = RunReport { rounds: 3, ..RunReport::default() };

        append_timing_record(&path, "leader", &params(), &report).unwrap();
        append_timing_record(&path, "leader", &params(), &report).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], TIMING_HEADER);
        assert!(lines[1].starts_with("leader,42,2,100,0,3,"));
        assert_eq!(lines[1], lines[2]);
    }

    #[test]
    fn stripping_every_layer_reveals_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let material = KeyMaterial::generate(Topology { agencies: 2, telecoms: 1 }, &mut rng);
        let telecom = material.store_for(PartyId::Telecom(TelecomId(0))).unwrap();
        let agency = |id| material.store_for(PartyId::Agency(AgencyId(id))).unwrap();

        let outputs: Vec<_> =
            [42, 7].iter().map(|&u| telecom.encrypt_for_agencies(u, &mut rng).unwrap()).collect();
        let first = dir.path().join("leader.out");
        let second = dir.path().join("leader.out.1");
        let last = dir.path().join("leader.out.0");
        write_outputs(&first, &params(), &outputs).unwrap();

        let partial = strip_output_file(&agency(1), &first, &second).unwrap();
        assert_eq!(partial, Stripped::Partial { values: 2, layers_left: 1 });
        assert_eq!(read_outputs(&second).unwrap().len(), 2);

        let revealed = strip_output_file(&agency(0), &second, &last).unwrap();
        assert_eq!(revealed, Stripped::Revealed(vec![42, 7]));

        let text = fs::read_to_string(&last).unwrap();
        assert!(text.starts_with(TITLE));
        assert!(text.contains("# Layer removed: agency-1"));
        assert!(text.contains("# Layer removed: agency-0"));
        assert!(text.ends_with("42\n7\n"));
    }

    #[test]
    fn stripping_a_layer_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let material = KeyMaterial::generate(Topology { agencies: 2, telecoms: 1 }, &mut rng);
        let telecom = material.store_for(PartyId::Telecom(TelecomId(0))).unwrap();
        let agency = material.store_for(PartyId::Agency(AgencyId(1))).unwrap();

        let path = dir.path().join("out");
        let once = dir.path().join("out.1");
        let outputs = vec![telecom.encrypt_for_agencies(3, &mut rng).unwrap()];
        write_outputs(&path, &params(), &outputs).unwrap();

        strip_output_file(&agency, &path, &once).unwrap();
        assert!(strip_output_file(&agency, &once, &dir.path().join("out.2")).is_err());
    }
}
