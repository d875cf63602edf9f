//! The synchronizer ties the phases together: decide the start position, mirror indexes,
//! run the initial copy, then hand over to the oplog replayer.
//!
//! The start timestamp is captured from the source primary before any collection scan
//! begins, so operations concurrent with the copy are re-applied idempotently by the tail.
//! When the operator supplies a start position (flag or existing checkpoint file), the copy
//! is skipped and the engine goes straight to tailing.

use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::checkpoint::{read_optime, OptimeLog};
use crate::config::SyncConf;
use crate::copy::InitialCopier;
use crate::dest::DestClient;
use crate::oper::Optime;
use crate::progress::{ProgressReporter, DEFAULT_LOG_INTERVAL};
use crate::replay::{OplogReplayer, StartMode};
use crate::source::MongoSource;
use crate::Result;

/// Bound on how long the tail blocks on an idle source before flushing.
const IDLE_FLUSH: Duration = Duration::from_secs(1);

/// The replication engine.
pub struct Synchronizer {
    conf: SyncConf,
    shutdown: watch::Receiver<bool>,
}

impl Synchronizer {
    /// Create an engine over an assembled configuration. `shutdown` flips to true on user
    /// interrupt; the current flush finishes, the checkpoint is written, and `run` returns.
    pub fn new(conf: SyncConf, shutdown: watch::Receiver<bool>) -> Synchronizer {
        Synchronizer { conf, shutdown }
    }

    /// Run to completion (which, absent interrupts and fatal errors, is forever).
    pub async fn run(self) -> Result<()> {
        let source = MongoSource::connect(&self.conf.src).await?;
        let version = source.server_version().await?;
        info!(version = version.as_str(), replset = ?source.replset(), "source connected");
        let dest = DestClient::connect(&self.conf).await?;
        let (reporter, reporter_handle) = ProgressReporter::spawn(DEFAULT_LOG_INTERVAL);

        let mut optime_log = match &self.conf.optime_logfile {
            Some(path) => Some(OptimeLog::open(path)?),
            None => None,
        };

        let (start, mode) = match self.start_position()? {
            Some(resume) => resume,
            None => {
                // Full sync: capture the primary position first, then indexes, then data.
                let start = source.primary_optime().await?;
                info!(start = %start, "captured start optime from source primary");

                self.mirror_indexes(&source, &dest).await?;

                let copier = InitialCopier::new(
                    source.clone(),
                    dest.clone(),
                    self.conf.filter.clone(),
                    reporter.clone(),
                    self.conf.workers,
                    self.conf.large_threshold,
                    self.shutdown.clone(),
                );
                copier.run().await?;

                if let Some(log) = &mut optime_log {
                    log.write(start)?;
                }
                (start, StartMode::Exact)
            }
        };

        let mut replayer = OplogReplayer::new(
            source,
            dest,
            self.conf.filter.clone(),
            optime_log,
            reporter.clone(),
            self.conf.workers,
            IDLE_FLUSH,
            self.shutdown.clone(),
        );
        let final_optime = replayer.run(start, mode).await?;
        info!(optime = %final_optime, "replication stopped");

        drop(replayer);
        drop(reporter);
        let _ = reporter_handle.await;
        Ok(())
    }

    /// The explicit start position, if the operator supplied one: the `--start-optime` flag
    /// wins, then an existing checkpoint file. `None` means a full initial sync.
    fn start_position(&self) -> Result<Option<(Optime, StartMode)>> {
        if let Some(start) = self.conf.start_optime {
            info!(start = %start, "starting from explicit optime");
            return Ok(Some((start, StartMode::SnapForward)));
        }
        if let Some(path) = &self.conf.optime_logfile {
            if let Some(checkpoint) = read_optime(path)? {
                info!(checkpoint = %checkpoint, path = %path.display(), "resuming from checkpoint");
                return Ok(Some((checkpoint, StartMode::Exact)));
            }
        }
        Ok(None)
    }

    /// Recreate the user indexes of every in-scope collection at the destination. Runs
    /// before data load so unique-index conflicts surface per document during the copy.
    async fn mirror_indexes(&self, source: &MongoSource, dest: &DestClient) -> Result<()> {
        for ns in source.list_namespaces(&self.conf.filter).await? {
            let dst_ns = self.conf.filter.map_ns(&ns);
            for spec in source.list_indexes(&ns).await? {
                if spec.is_id_index() {
                    continue;
                }
                info!(ns = ns.as_str(), index = spec.standard_name().as_str(), "mirroring index");
                dest.create_index(&dst_ns, &spec).await?;
            }
        }
        Ok(())
    }
}
