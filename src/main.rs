use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use drivacy::client::{Client, ClientMap, LocalDeployment};
use drivacy::network::{self, ConnectedParty};
use drivacy::party::{PartyHandle, ProtocolConfig, Role, Topology};
use drivacy::preprocessing::recompute;
use drivacy::query::QueryKind;
use drivacy::share::VertexId;
use drivacy::table::PlainTable;
use itertools::Itertools;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Privacy-preserving route lookup over a garbled, secret-shared table")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs one party of a networked deployment.
    Party {
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        #[arg(long, value_name = "FILE", help = "The plaintext routing table. Required for backend parties")]
        table: Option<PathBuf>,

        #[arg(
            long,
            value_name = "N_THREADS",
            help = "The number of worker threads. Set to 0 to indicate the number of cores on the machine. Optional, default single-threaded"
        )]
        threads: Option<usize>,

        #[arg(long, value_name = "SECONDS", help = "Recompute the garbled table periodically. Only used by the backend leader")]
        recompute_every: Option<u64>,
    },
    /// Runs a whole deployment in this process and walks one route.
    Simulate {
        #[arg(long, default_value_t = 3)]
        owners: usize,

        #[arg(long, default_value_t = 1)]
        replicas: usize,

        #[arg(long, value_name = "FILE", help = "The plaintext routing table. Default: a directed path over 1..=dest")]
        table: Option<PathBuf>,

        #[arg(long)]
        src: VertexId,

        #[arg(long)]
        dest: VertexId,

        #[arg(long, help = "Use the malicious-client protocol", default_value_t = false)]
        malicious: bool,
    },
}

fn load_table(path: Option<&PathBuf>) -> Result<Option<PlainTable>, String> {
    path.map(|p| PlainTable::from_file(p).map_err(|err| err.to_string())).transpose()
}

fn run_party(config: PathBuf, table: Option<PathBuf>, threads: Option<usize>, recompute_every: Option<u64>) -> Result<(), String> {
    let config = network::Config::from_file(&config).map_err(|err| format!("cannot load {}: {}", config.display(), err))?;
    let id = config.id();
    let topology = config.topology;
    let table = load_table(table.as_ref())?.map(Arc::new);
    if topology.role(id) == Role::Backend && table.is_none() {
        return Err(format!("backend party {} needs --table", id));
    }

    info!("{} connecting to {} parties", id, topology.size());
    let connected = ConnectedParty::bind_and_connect(config, None).map_err(|err| err.to_string())?;
    let handle = PartyHandle::connect(connected, table, threads).map_err(|err| err.to_string())?;
    info!("{} connected", id);

    if id == topology.backend_leader() {
        loop {
            match recompute(handle.party()) {
                Ok(report) => info!("epoch {} ready: {} in {:?}", report.epoch, report.success, report.duration),
                Err(err) => error!("recompute failed: {}", err),
            }
            match recompute_every {
                Some(seconds) => thread::sleep(Duration::from_secs(seconds)),
                None => break,
            }
        }
    }
    // serve until killed
    loop {
        thread::park();
    }
}

fn run_simulation(owners: usize, replicas: usize, table: Option<PathBuf>, src: VertexId, dest: VertexId, malicious: bool) -> Result<(), String> {
    let topology = Topology::new(owners, replicas).map_err(|err| err.to_string())?;
    let table = load_table(table.as_ref())?.unwrap_or_else(|| PlainTable::directed_path(VertexId::max(src, dest)));
    let map = ClientMap::from_table(&table);
    let deployment = LocalDeployment::start(topology, table, ProtocolConfig::default()).map_err(|err| err.to_string())?;
    let report = deployment.recompute().map_err(|err| err.to_string())?;
    if !report.success {
        return Err(format!("preprocessing of epoch {} failed", report.epoch));
    }

    let kind = if malicious { QueryKind::Malicious } else { QueryKind::Honest };
    let client = Client::new(&deployment, map, kind);
    let path = client.route(src, dest).map_err(|err| err.to_string())?;
    println!("{:?}: {}", path.status, path.vertices.iter().join(" -> "));
    deployment.teardown().map_err(|err| err.to_string())
}

fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Party { config, table, threads, recompute_every } => run_party(config, table, threads, recompute_every),
        Command::Simulate { owners, replicas, table, src, dest, malicious } => run_simulation(owners, replicas, table, src, dest, malicious),
    }
}
