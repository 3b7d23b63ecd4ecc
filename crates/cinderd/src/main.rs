use cinder_ledger::{BalanceSnapshot, BalanceTable};
use cinderd::config::{ConfigError, NodeConfig};
use cinderd::node::{Node, NodeError};
use cinderd::peers::KnownPeerBook;
use cinderd::store::{
    read_json_opt, BalancesFile, LedgerStore, StoreConfig, StoreError, BALANCES_FILE, PEERS_FILE,
    SNAPSHOTS_FILE,
};
use cinderd::{init_tracing, LogLevel};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cinderd", version, about = "Cinder proof-of-work node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a node
    Run(RunArgs),
    /// Print balances and total supply
    Balances {
        /// Data directory of the node
        #[arg(long)]
        data_dir: PathBuf,
    },
    /// Print blocks
    Chain {
        /// Data directory of the node
        #[arg(long)]
        data_dir: PathBuf,
        /// First block index
        #[arg(long, default_value_t = 0)]
        from: u64,
        /// Maximum number of blocks
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print balance snapshot summaries
    Snapshots {
        /// Data directory of the node
        #[arg(long)]
        data_dir: PathBuf,
    },
    /// Print the known peer book
    Peers {
        /// Data directory of the node
        #[arg(long)]
        data_dir: PathBuf,
    },
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Optional TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address (host:port)
    #[arg(long)]
    listen: Option<String>,
    /// Bootstrap peer address (repeatable, replaces the configured list)
    #[arg(long)]
    peer: Vec<String>,
    /// Data directory for on-disk persistence
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Keep all state in memory
    #[arg(long, conflicts_with = "data_dir")]
    in_memory: bool,
    /// Address credited with mining rewards
    #[arg(long)]
    miner: Option<String>,
    /// Start mining on boot
    #[arg(long)]
    mine: bool,
    /// Required block hash prefix (lowercase hex)
    #[arg(long)]
    difficulty: Option<String>,
    /// Block reward
    #[arg(long)]
    reward: Option<f64>,
    /// Emit periodic node stats (seconds, 0=disabled)
    #[arg(long, default_value_t = 0)]
    stats_interval: u64,
    /// Log level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
    /// Optional log file path
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("node error: {0}")]
    Node(#[from] NodeError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_node(args),
        Command::Balances { data_dir } => print_balances(&data_dir),
        Command::Chain {
            data_dir,
            from,
            limit,
        } => print_chain(&data_dir, from, limit),
        Command::Snapshots { data_dir } => print_snapshots(&data_dir),
        Command::Peers { data_dir } => print_peers(&data_dir),
    }
}

fn build_config(args: &RunArgs) -> Result<NodeConfig, CliError> {
    let mut cfg = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = &args.listen {
        cfg.network.listen = listen.clone();
    }
    if !args.peer.is_empty() {
        cfg.network.bootstrap = args.peer.clone();
    }
    if args.in_memory {
        cfg.storage.data_dir = None;
    } else if let Some(dir) = &args.data_dir {
        cfg.storage.data_dir = Some(dir.clone());
    }
    if let Some(miner) = &args.miner {
        cfg.mining.miner_address = miner.clone();
    }
    if args.mine {
        cfg.mining.autostart = true;
    }
    if let Some(prefix) = &args.difficulty {
        cfg.mining.difficulty_prefix = prefix.clone();
    }
    if let Some(reward) = args.reward {
        cfg.mining.reward = reward;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn run_node(args: RunArgs) -> Result<(), CliError> {
    let cfg = build_config(&args)?;
    init_tracing(args.log_level, args.log_file.as_deref())?;

    let node = Arc::new(Node::open(cfg)?);
    node.start()?;
    if args.stats_interval > 0 {
        node.spawn_stats_logger(Duration::from_secs(args.stats_interval))?;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(shutdown_signal())?;
    info!("termination signal received");
    node.shutdown()?;
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn require_data_dir(data_dir: &Path) -> Result<(), CliError> {
    if !data_dir.join("chain.sled").exists() {
        return Err(CliError::InvalidArgs(format!(
            "no node data in {}",
            data_dir.display()
        )));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BalancesReport {
    applied_height: u64,
    total_supply: f64,
    balances: BalanceTable,
}

fn load_balances(data_dir: &Path) -> Result<BalancesReport, CliError> {
    require_data_dir(data_dir)?;
    let file: BalancesFile = read_json_opt(&data_dir.join(BALANCES_FILE))?.unwrap_or_default();
    Ok(BalancesReport {
        applied_height: file.applied_height,
        total_supply: file.balances.total_supply(),
        balances: file.balances,
    })
}

fn print_balances(data_dir: &Path) -> Result<(), CliError> {
    let report = load_balances(data_dir)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_chain(data_dir: &Path, from: u64, limit: usize) -> Result<(), CliError> {
    require_data_dir(data_dir)?;
    let store = LedgerStore::open(
        Some(data_dir.to_path_buf()),
        Arc::new(cinder_consensus::StaticDifficulty::default()),
        StoreConfig::default(),
    )?;
    let blocks = store.blocks_from(from, limit)?;
    println!("{}", serde_json::to_string_pretty(&blocks)?);
    Ok(())
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SnapshotSummary {
    timestamp: i64,
    total_supply: f64,
    accounts: usize,
}

fn summarize_snapshots(snapshots: &[BalanceSnapshot]) -> Vec<SnapshotSummary> {
    snapshots
        .iter()
        .map(|s| SnapshotSummary {
            timestamp: s.timestamp,
            total_supply: s.total_supply,
            accounts: s.balances.len(),
        })
        .collect()
}

fn print_snapshots(data_dir: &Path) -> Result<(), CliError> {
    require_data_dir(data_dir)?;
    let snapshots: Vec<BalanceSnapshot> =
        read_json_opt(&data_dir.join(SNAPSHOTS_FILE))?.unwrap_or_default();
    println!(
        "{}",
        serde_json::to_string_pretty(&summarize_snapshots(&snapshots))?
    );
    Ok(())
}

fn print_peers(data_dir: &Path) -> Result<(), CliError> {
    let book = KnownPeerBook::load(Some(data_dir.join(PEERS_FILE)))?;
    println!("{}", serde_json::to_string_pretty(&book.ranked())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> RunArgs {
        let mut argv = vec!["cinderd", "run"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Run(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_flags_override_defaults() {
        let args = parse(&[
            "--listen",
            "127.0.0.1:6000",
            "--peer",
            "10.0.0.1:5470",
            "--peer",
            "10.0.0.2:5470",
            "--miner",
            "alice",
            "--mine",
            "--difficulty",
            "00",
            "--reward",
            "2.5",
            "--in-memory",
        ]);
        let cfg = build_config(&args).unwrap();
        assert_eq!(cfg.network.listen, "127.0.0.1:6000");
        assert_eq!(cfg.network.bootstrap.len(), 2);
        assert_eq!(cfg.mining.miner_address, "alice");
        assert!(cfg.mining.autostart);
        assert_eq!(cfg.mining.difficulty_prefix, "00");
        assert_eq!(cfg.mining.reward, 2.5);
        assert!(cfg.storage.data_dir.is_none());
    }

    #[test]
    fn mine_without_miner_is_rejected() {
        let args = parse(&["--mine", "--in-memory"]);
        assert!(matches!(build_config(&args), Err(CliError::Config(_))));
    }

    #[test]
    fn config_file_then_flags() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("node.toml");
        std::fs::write(
            &path,
            "[mining]\nreward = 4.0\nminer_address = \"bob\"\n[network]\nmax_peers = 5\n",
        )
        .unwrap();
        let args = parse(&["--config", path.to_str().unwrap(), "--reward", "3.0"]);
        let cfg = build_config(&args).unwrap();
        assert_eq!(cfg.mining.reward, 3.0);
        assert_eq!(cfg.mining.miner_address, "bob");
        assert_eq!(cfg.network.max_peers, 5);
    }

    #[test]
    fn balances_report_reads_data_dir() {
        let temp = tempdir().unwrap();
        let dir = temp.path().to_path_buf();
        assert!(load_balances(&dir).is_err());
        {
            let store = LedgerStore::open(
                Some(dir.clone()),
                Arc::new(cinder_consensus::StaticDifficulty::default()),
                StoreConfig::default(),
            )
            .unwrap();
            store.credit("alice", 2.0).unwrap();
            store.credit("bob", 1.0).unwrap();
        }
        let report = load_balances(&dir).unwrap();
        assert_eq!(report.total_supply, 3.0);
        assert_eq!(report.balances.len(), 2);
    }

    #[test]
    fn snapshot_summaries() {
        let mut balances = BTreeMap::new();
        balances.insert("a".to_string(), 1.0);
        let snaps = vec![BalanceSnapshot {
            timestamp: 5,
            total_supply: 1.0,
            balances,
        }];
        assert_eq!(
            summarize_snapshots(&snaps),
            vec![SnapshotSummary {
                timestamp: 5,
                total_supply: 1.0,
                accounts: 1,
            }]
        );
    }
}
