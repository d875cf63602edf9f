//! The sync tool: load configuration, start the engine, translate outcomes to exit codes.
//!
//! Exit codes: 0 on clean shutdown, 1 on fatal errors (stale oplog, authentication,
//! unrecoverable write errors, bad configuration), 130 on user interrupt.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mongosync::config::{FileConfig, Overrides, SyncConf};
use mongosync::sync::Synchronizer;

#[derive(Debug, Parser)]
#[command(
    name = "mongosync",
    version,
    about = "Sync data from a MongoDB replica set to a MongoDB or Elasticsearch cluster."
)]
struct Args {
    /// TOML configuration file; command-line flags override its values.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Source, a member of a replica set, as host:port.
    #[arg(long, value_name = "HOSTPORT")]
    src: Option<String>,

    /// Source authentication database.
    #[arg(long, value_name = "DB")]
    src_authdb: Option<String>,

    /// Source username.
    #[arg(long, value_name = "NAME")]
    src_username: Option<String>,

    /// Source password.
    #[arg(long, value_name = "PASSWORD")]
    src_password: Option<String>,

    /// Destination mongod/mongos as host:port.
    #[arg(long, value_name = "HOSTPORT")]
    dst: Option<String>,

    /// Destination authentication database.
    #[arg(long, value_name = "DB")]
    dst_authdb: Option<String>,

    /// Destination username.
    #[arg(long, value_name = "NAME")]
    dst_username: Option<String>,

    /// Destination password.
    #[arg(long, value_name = "PASSWORD")]
    dst_password: Option<String>,

    /// Start position in whole seconds; snapped forward to the first oplog entry at or
    /// after it. Skips the initial copy.
    #[arg(long, value_name = "SECONDS")]
    start_optime: Option<u32>,

    /// Checkpoint file; read at start to resume, rewritten while tailing.
    #[arg(long, value_name = "PATH")]
    optime_logfile: Option<String>,

    /// Log file; stdout when absent.
    #[arg(long, value_name = "PATH")]
    logfile: Option<String>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            src: self.src.clone(),
            src_authdb: self.src_authdb.clone(),
            src_username: self.src_username.clone(),
            src_password: self.src_password.clone(),
            dst: self.dst.clone(),
            dst_authdb: self.dst_authdb.clone(),
            dst_username: self.dst_username.clone(),
            dst_password: self.dst_password.clone(),
            start_optime: self.start_optime,
            optime_logfile: self.optime_logfile.clone(),
            logfile: self.logfile.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();

    let file = match &args.config {
        Some(path) => match FileConfig::load(path) {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("{}", e);
                return 1;
            }
        },
        None => None,
    };
    let conf = match SyncConf::assemble(file, args.overrides()) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    if let Err(e) = init_logging(&conf) {
        eprintln!("{}", e);
        return 1;
    }
    banner(&conf);

    let (tx, rx) = watch::channel(false);
    let interrupted = rx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing the current flush");
            let _ = tx.send(true);
        }
    });

    match Synchronizer::new(conf, rx).run().await {
        Ok(()) if *interrupted.borrow() => 130,
        Ok(()) => 0,
        Err(mongosync::Error::Interrupted) => 130,
        Err(e) => {
            error!(error = %e, "replication failed");
            1
        }
    }
}

fn init_logging(conf: &SyncConf) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &conf.logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn banner(conf: &SyncConf) {
    info!("================================================");
    info!(version = env!("CARGO_PKG_VERSION"), "mongosync");
    info!(src = conf.src.hosts.join(",").as_str(), "source");
    info!(dst = conf.dst.hosts.join(",").as_str(), dst_type = ?conf.dst_type, "destination");
    if let Some(username) = &conf.src.username {
        info!(username = username.as_str(), authdb = conf.src.authdb.as_str(), "source auth");
    }
    if let Some(username) = &conf.dst.username {
        info!(username = username.as_str(), authdb = conf.dst.authdb.as_str(), "destination auth");
    }
    match conf.start_optime {
        Some(start) => info!(start = %start, "explicit start optime"),
        None => info!("start optime from checkpoint or source primary"),
    }
    if let Some(path) = &conf.optime_logfile {
        info!(path = %path.display(), "checkpoint file");
    }
    if let Some(path) = &conf.logfile {
        info!(path = %path.display(), "log file");
    }
    info!("================================================");
}
