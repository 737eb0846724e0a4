use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use nodectl_core::NodeManager;
use nodectl_core::find_nodectl_home;
use nodectl_protocol::NodeConfig;
use nodectl_protocol::RunState;
use nodectl_protocol::SupervisorEvent;
use tracing_subscriber::EnvFilter;

/// Local control surface for the node worker process: start/stop, binary
/// updates, and log streaming.
#[derive(Debug, clap::Parser)]
#[command(name = "nodectl", version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Start the node and stream its logs until Ctrl-C, then stop it
    /// gracefully.
    Run(RunArgs),

    /// Check the release index and install the latest worker binary.
    Update(DbArgs),

    /// Report whether the worker binary is installed.
    Check(DbArgs),

    /// Show or change the persisted data directory.
    DataDir(DataDirArgs),
}

#[derive(Debug, clap::Parser)]
struct RunArgs {
    /// Port the node serves its API on.
    #[arg(long, default_value_t = 8080)]
    api_port: u16,

    /// Port the node uses for peer-to-peer traffic.
    #[arg(long, default_value_t = 2000)]
    p2p_port: u16,

    /// Data directory for this run; defaults to the persisted choice.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Debug, clap::Parser)]
struct DbArgs {
    /// Data directory; defaults to the persisted choice.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Debug, clap::Parser)]
struct DataDirArgs {
    #[command(subcommand)]
    subcommand: Option<DataDirSubcommand>,
}

#[derive(Debug, clap::Subcommand)]
enum DataDirSubcommand {
    /// Print the current and default data directories.
    Get,

    /// Persist a new data directory.
    Set {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let manager = build_manager()?;
    match cli.subcommand {
        Subcommand::Run(args) => run_node(&manager, args).await,
        Subcommand::Update(args) => run_update(&manager, args).await,
        Subcommand::Check(args) => run_check(&manager, args),
        Subcommand::DataDir(args) => run_data_dir(&manager, args),
    }
}

fn build_manager() -> Result<NodeManager> {
    let home = find_nodectl_home().context("could not resolve the nodectl home directory")?;
    NodeManager::new(home).context("could not load nodectl settings")
}

fn db_path_for(manager: &NodeManager, db: Option<PathBuf>) -> String {
    db.unwrap_or_else(|| manager.current_data_path())
        .to_string_lossy()
        .into_owned()
}

async fn run_node(manager: &NodeManager, args: RunArgs) -> Result<()> {
    let db_path = db_path_for(manager, args.db);
    if !manager.check_executable_exists(&db_path) {
        bail!(
            "worker binary not installed at {}; run `nodectl update` first",
            manager.executable_path(&db_path).display()
        );
    }

    let mut events = manager.subscribe();
    manager
        .start_node(NodeConfig {
            db_path,
            api_port: args.api_port,
            p2p_port: args.p2p_port,
        })
        .await?;
    println!("node running; press Ctrl-C to stop");

    let mut cursor = 0u64;
    let mut poll = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("stopping node...");
                manager.stop_node().await?;
                break;
            }
            event = events.recv() => {
                if let Ok(SupervisorEvent::StatusChanged { state: RunState::Stopped }) = event {
                    // The reconciler noticed the worker die out from under us.
                    tail_new_lines(manager, &mut cursor);
                    bail!("node exited unexpectedly");
                }
            }
            _ = poll.tick() => {
                tail_new_lines(manager, &mut cursor);
            }
        }
    }
    tail_new_lines(manager, &mut cursor);
    println!("node stopped");
    Ok(())
}

/// Prints log lines appended since the last call. The cursor counts total
/// appends rather than retained length, so the tail keeps moving after the
/// ring fills; lines evicted before a poll are lost.
fn tail_new_lines(manager: &NodeManager, cursor: &mut u64) {
    let (lines, next) = manager.logs_since(*cursor);
    for line in &lines {
        println!("{}", line.render());
    }
    *cursor = next;
}

async fn run_update(manager: &NodeManager, args: DbArgs) -> Result<()> {
    let db_path = db_path_for(manager, args.db);
    let mut events = manager.subscribe();
    manager.check_and_download_update(&db_path).await?;
    println!("checking for updates...");

    loop {
        let event = events
            .recv()
            .await
            .context("event stream ended before the update finished")?;
        match event {
            SupervisorEvent::DownloadProgress(progress) => match progress.percent() {
                Some(percent) => println!(
                    "downloaded {} / {} bytes ({percent}%)",
                    progress.bytes_received, progress.bytes_total
                ),
                None => println!("downloaded {} bytes", progress.bytes_received),
            },
            SupervisorEvent::DownloadComplete => {
                println!(
                    "update installed at {}",
                    manager.executable_path(&db_path).display()
                );
                return Ok(());
            }
            SupervisorEvent::DownloadFailed { reason } => {
                bail!("update failed: {reason}");
            }
            SupervisorEvent::StatusChanged { .. } => {}
        }
    }
}

fn run_check(manager: &NodeManager, args: DbArgs) -> Result<()> {
    let db_path = db_path_for(manager, args.db);
    let path = manager.executable_path(&db_path);
    if manager.check_executable_exists(&db_path) {
        println!("worker binary installed at {}", path.display());
    } else {
        println!(
            "worker binary missing at {}; run `nodectl update`",
            path.display()
        );
    }
    Ok(())
}

fn run_data_dir(manager: &NodeManager, args: DataDirArgs) -> Result<()> {
    match args.subcommand.unwrap_or(DataDirSubcommand::Get) {
        DataDirSubcommand::Get => {
            println!("current: {}", manager.current_data_path().display());
            println!("default: {}", manager.default_data_path().display());
        }
        DataDirSubcommand::Set { path } => {
            manager.set_custom_data_path(path.clone())?;
            println!("data directory set to {}", path.display());
        }
    }
    Ok(())
}
