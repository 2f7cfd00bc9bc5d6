//! Contact chaining binary.
//!
//! # Usage
//!
//! ```bash
//! # One-time setup
//! chaining keygen --dir keys --agencies 3 --telecoms 2
//! chaining datagen --dir data --users 10000 --telecoms 2 --distribution log-normal
//! chaining import calls.txt data --telecoms 2
//!
//! # One process per party
//! chaining telecom --config telecom-0.toml
//! chaining oversight --config agency-1.toml
//! chaining leader --config leader.toml --target 42 --max-distance 2
//!
//! # Joint disclosure, one agency at a time, any order
//! chaining disclose --keys keys --party 1 --agencies 3 --telecoms 2 leader.out leader.out.1
//! chaining disclose --keys keys --party 0 --agencies 3 --telecoms 2 leader.out.1 leader.out.2
//! chaining disclose --keys keys --party 2 --agencies 3 --telecoms 2 leader.out.2 users.txt
//! ```

use std::{
    fs,
    io::BufReader,
    path::{Path, PathBuf},
};

use chaining_core::{
    ChainError, DataGenParams, DegreeModel, GraphPartition, KeyMaterial, KeyStore, LeaderConfig,
    OversightConfig, RunReport, SearchParams, TelecomConfig, Topology, generate_graph,
    partition_path,
};
use chaining_node::{
    Leader, Oversight, SystemEnv, TelecomServer,
    output::{Stripped, strip_output_file},
};
use chaining_proto::{AgencyId, PartyId, TelecomId, UserId};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use rand::{SeedableRng, rngs::StdRng};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Privacy-constrained contact chaining across telecoms
#[derive(Parser, Debug)]
#[command(name = "chaining")]
#[command(about = "Contact chaining with oversight agencies and encrypted telecom queries")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve one telecom's graph partition
    Telecom {
        /// Telecom config file (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Worker threads per batch (0 selects the maximum)
        #[arg(short, long)]
        threads: Option<usize>,
    },

    /// Run a search as the Leader agency
    Leader {
        /// Leader config file (TOML)
        #[arg(short, long)]
        config: PathBuf,

        #[command(flatten)]
        search: SearchOverrides,
    },

    /// Audit a search as an Oversight agency
    Oversight {
        /// Oversight config file (TOML)
        #[arg(short, long)]
        config: PathBuf,

        #[command(flatten)]
        search: SearchOverrides,
    },

    /// Generate key files for every party
    Keygen {
        /// Output directory
        #[arg(short, long, default_value = "keys")]
        dir: PathBuf,

        /// Number of agencies, Leader included
        #[arg(short, long)]
        agencies: u32,

        /// Number of telecoms
        #[arg(short, long)]
        telecoms: u32,
    },

    /// Generate a synthetic contact graph split per telecom
    Datagen {
        /// Output directory
        #[arg(short, long, default_value = "data")]
        dir: PathBuf,

        /// Number of users
        #[arg(short, long)]
        users: u64,

        /// Number of telecoms
        #[arg(short, long)]
        telecoms: u32,

        /// Largest degree of an ordinary user
        #[arg(long)]
        small_max: Option<u64>,

        /// Largest degree of a high-degree user
        #[arg(long)]
        large_max: Option<u64>,

        /// Degree distribution
        #[arg(long, value_enum, default_value_t = Distribution::Uniform)]
        distribution: Distribution,

        /// RNG seed for reproducible graphs
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Split an edge-list file into per-telecom partitions
    Import {
        /// Edge list, one `source destination` pair per line
        edges: PathBuf,

        /// Output directory
        dir: PathBuf,

        /// Number of telecoms
        #[arg(short, long)]
        telecoms: u32,
    },

    /// Remove this agency's layer from an output file
    Disclose {
        /// Key directory
        #[arg(short, long, default_value = "keys")]
        keys: PathBuf,

        /// Agency id of the key holder
        #[arg(short, long)]
        party: u32,

        /// Number of agencies, Leader included
        #[arg(short, long)]
        agencies: u32,

        /// Number of telecoms
        #[arg(short, long)]
        telecoms: u32,

        /// Output file to read
        input: PathBuf,

        /// File to write
        output: PathBuf,
    },
}

/// Degree distribution for `datagen`.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Distribution {
    /// Two classes of users with uniform degree ranges
    Uniform,
    /// Log-normal out-degree, undirected contacts
    LogNormal,
}

/// Command-line overrides for the configured search.
#[derive(ClapArgs, Debug)]
struct SearchOverrides {
    /// Target user id
    #[arg(long)]
    target: Option<UserId>,

    /// Maximum path length
    #[arg(long)]
    max_distance: Option<u32>,

    /// Neighbor lists longer than this are not expanded
    #[arg(long)]
    max_degree: Option<u32>,

    /// Output file for agency-ciphertexts
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl SearchOverrides {
    fn apply(&self, params: SearchParams) -> SearchParams {
        params.with_overrides(self.target, self.max_distance, self.max_degree)
    }
}

fn log_report(report: &RunReport) {
    for line in report.to_string().lines() {
        tracing::info!("{line}");
    }
}

fn write_partitions(dir: &Path, parts: &[GraphPartition]) -> Result<(), ChainError> {
    fs::create_dir_all(dir)?;
    for (id, part) in (0..).map(TelecomId).zip(parts) {
        let path = partition_path(dir, id);
        part.save(&path)?;
        tracing::info!(
            telecom = %id,
            users = part.len(),
            path = %path.display(),
            "partition written"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = if args.quiet { "warn" } else { args.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    match args.command {
        Command::Telecom { config, threads } => {
            let mut config = TelecomConfig::load(&config)?;
            if let Some(threads) = threads {
                config.max_workers = threads;
                config.validate()?;
            }

            let server = TelecomServer::bind(&config, SystemEnv::new()).await?;
            tracing::info!("Telecom {} listening on {}", config.id, server.local_addr()?);
            server.run().await?;
        },

        Command::Leader { config, search } => {
            let mut config = LeaderConfig::load(&config)?;
            config.search = search.apply(config.search);
            if search.output.is_some() {
                config.output = search.output;
            }

            let leader = Leader::bind(config, SystemEnv::new()).await?;
            tracing::info!("Leader waiting for oversight on {}", leader.local_addr()?);

            let report = leader.run().await?;
            log_report(&report);
            if !report.all_audits_passed() {
                let reason = "an oversight agency failed the audit".to_string();
                return Err(ChainError::Audit { reason }.into());
            }
        },

        Command::Oversight { config, search } => {
            let mut config = OversightConfig::load(&config)?;
            config.search = search.apply(config.search);
            if search.output.is_some() {
                config.output = search.output;
            }

            let report = Oversight::new(config, SystemEnv::new())?.run().await?;
            log_report(&report);
        },

        Command::Keygen { dir, agencies, telecoms } => {
            let topology = Topology { agencies, telecoms };
            topology.validate()?;
            let mut rng = StdRng::from_entropy();
            KeyMaterial::generate(topology, &mut rng).write(&dir)?;
        },

        Command::Datagen { dir, users, telecoms, small_max, large_max, distribution, seed } => {
            let mut params = DataGenParams::new(users);
            params.small_max = small_max.unwrap_or(params.small_max);
            params.large_max = large_max.unwrap_or(params.large_max);
            if distribution == Distribution::LogNormal {
                params.model = DegreeModel::log_normal();
            }
            Topology { agencies: 1, telecoms }.validate()?;

            let mut rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
            let graph = generate_graph(&params, &mut rng)?;
            write_partitions(&dir, &GraphPartition::split(&graph, telecoms))?;
        },

        Command::Import { edges, dir, telecoms } => {
            Topology { agencies: 1, telecoms }.validate()?;
            let reader = BufReader::new(fs::File::open(&edges)?);
            write_partitions(&dir, &GraphPartition::from_edge_list(reader, telecoms)?)?;
        },

        Command::Disclose { keys, party, agencies, telecoms, input, output } => {
            let topology = Topology { agencies, telecoms };
            topology.validate()?;
            let keys = KeyStore::load(&keys, PartyId::Agency(AgencyId(party)), topology)?;

            match strip_output_file(&keys, &input, &output)? {
                Stripped::Partial { values, layers_left } => {
                    let next = output.display();
                    tracing::info!(values, layers_left, "pass {next} to the next agency");
                },
                Stripped::Revealed(users) => {
                    let file = output.display();
                    tracing::info!(users = users.len(), "all layers removed, ids in {file}");
                },
            }
        },
    }

    Ok(())
}
