//! The oplog replayer: tail from a start timestamp, group contiguous non-command entries,
//! dispatch them as bulk writes, advance the checkpoint after acknowledgment, and survive
//! cursor disconnects by reopening at the checkpoint.
//!
//! Grouping preserves per-document order: a group larger than the singleton threshold is
//! sharded by a hash of each `_id`'s string form, so every operation on one `_id` lands in
//! the same partition in arrival order, while distinct `_id`s spread over parallel writers.
//! Commands never group; the buffer is flushed before one is applied and the command is
//! acknowledged before anything after it is dispatched.

use std::collections::HashMap;
use std::io::Cursor as IoCursor;
use std::time::Duration;

use bson::Bson;
use futures::StreamExt;
use mongodb::bson;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::checkpoint::OptimeLog;
use crate::dest::{DestClient, DocOp};
use crate::filter::{split_namespace, DataFilter};
use crate::oper::{Operation, Optime};
use crate::oplog::Oplog;
use crate::progress::ProgressReporter;
use crate::source::MongoSource;
use crate::{Error, Result};

/// Entries buffered before a size-triggered flush.
pub const GROUP_FLUSH_SIZE: usize = 1000;

/// Largest namespace group dispatched as a single bulk write; larger groups are sharded.
pub const SMALL_GROUP_LIMIT: usize = 40;

/// How the tail was positioned, which decides whether the first entry must match exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMode {
    /// Resuming from a checkpoint or a captured primary optime: the entry must still be
    /// present, otherwise the oplog has rolled past it and data would be silently lost.
    Exact,
    /// An operator-supplied start in whole seconds: snap forward to the first entry at or
    /// after it.
    SnapForward,
}

/// The oplog replayer. Owns the tailing cursor and the checkpoint file.
pub struct OplogReplayer {
    source: MongoSource,
    dest: DestClient,
    filter: DataFilter,
    optime_log: Option<OptimeLog>,
    reporter: ProgressReporter,
    partitions: usize,
    idle_flush: Duration,
    shutdown: watch::Receiver<bool>,
    /// Arrival-ordered buffer of pending writes, keyed by destination namespace.
    buffer: Vec<(String, DocOp)>,
    /// Optime of the newest entry seen, including filtered-out ones; the checkpoint
    /// advances to this once everything buffered before it is acknowledged.
    latest_seen: Optime,
    /// Optime the checkpoint currently stands at.
    applied: Optime,
}

impl OplogReplayer {
    /// Create a replayer. `partitions` bounds in-group write parallelism; `idle_flush` is
    /// how long the tail waits on a quiet source before flushing what it has.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: MongoSource,
        dest: DestClient,
        filter: DataFilter,
        optime_log: Option<OptimeLog>,
        reporter: ProgressReporter,
        partitions: usize,
        idle_flush: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> OplogReplayer {
        OplogReplayer {
            source,
            dest,
            filter,
            optime_log,
            reporter,
            partitions: partitions.max(1),
            idle_flush,
            shutdown,
            buffer: Vec::new(),
            latest_seen: Optime::zero(),
            applied: Optime::zero(),
        }
    }

    /// Tail the oplog from `start` until shutdown. Returns the optime of the last
    /// acknowledged entry; any returned error is fatal and the checkpoint is left at the
    /// last acknowledged position.
    pub async fn run(&mut self, start: Optime, mode: StartMode) -> Result<Optime> {
        self.latest_seen = start;
        self.applied = start;
        let mut position = start;
        let mut mode = mode;

        'reopen: loop {
            info!(start = %position, "opening oplog tail");
            let mut stream = self.open(position).await?;

            let first = match self.next_entry(&mut stream).await? {
                Some(entry) => entry,
                None => {
                    // Shutdown while waiting for the first entry.
                    self.finish().await?;
                    return Ok(self.applied);
                }
            };
            if mode == StartMode::Exact && first.optime() != position {
                return Err(Error::StaleOplog {
                    requested: position,
                    found: Some(first.optime()),
                });
            }
            info!(first = %first.optime(), "oplog tail validated");
            self.handle_entry(first).await?;

            loop {
                if *self.shutdown.borrow() {
                    self.finish().await?;
                    return Ok(self.applied);
                }

                match timeout(self.idle_flush, stream.next()).await {
                    // Idle source: flush what we have so the destination converges and the
                    // checkpoint keeps moving.
                    Err(_) => self.flush(true).await?,
                    Ok(Some(Ok(oper))) => self.handle_entry(oper).await?,
                    Ok(Some(Err(e))) if e.is_transient() => {
                        warn!(error = %e, "oplog cursor interrupted, reconnecting");
                        self.flush(true).await?;
                        self.source.reconnect().await?;
                        position = self.applied;
                        mode = StartMode::Exact;
                        continue 'reopen;
                    }
                    Ok(Some(Err(e))) => return Err(e),
                    Ok(None) => {
                        warn!("oplog cursor ended, reconnecting");
                        self.flush(true).await?;
                        self.source.reconnect().await?;
                        position = self.applied;
                        mode = StartMode::Exact;
                        continue 'reopen;
                    }
                }
            }
        }
    }

    async fn open(&self, position: Optime) -> Result<Oplog> {
        loop {
            match Oplog::builder()
                .start(position)
                .await_time(self.idle_flush)
                .build(self.source.client())
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "cannot open oplog cursor, retrying");
                    self.source.reconnect().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Await the first entry of a fresh cursor, looping over idle periods. `None` means
    /// shutdown was requested while waiting.
    async fn next_entry(&mut self, stream: &mut Oplog) -> Result<Option<Operation>> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(None);
            }
            match timeout(self.idle_flush, stream.next()).await {
                Err(_) => continue,
                Ok(Some(Ok(oper))) => return Ok(Some(oper)),
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => {
                    return Err(Error::StaleOplog {
                        requested: self.applied,
                        found: None,
                    })
                }
            }
        }
    }

    async fn handle_entry(&mut self, oper: Operation) -> Result<()> {
        self.latest_seen = self.latest_seen.max(oper.optime());

        if !self.filter.valid_oplog(&oper) {
            // Out-of-scope entries still move the checkpoint forward at the next flush.
            return Ok(());
        }

        match oper {
            Operation::Noop { .. } => Ok(()),
            Operation::Command {
                ref namespace,
                ref command,
                ..
            } => {
                // Commands serialise with everything around them.
                self.flush(false).await?;
                let (db, _) = split_namespace(namespace);
                self.dest
                    .handle_command(self.filter.map_db(db), command)
                    .await?;
                self.acknowledge(1).await?;
                Ok(())
            }
            Operation::ApplyOps { operations, .. } => {
                self.flush(false).await?;
                let mut applied = 0u64;
                for inner in operations {
                    if !self.filter.valid_oplog(&inner) {
                        continue;
                    }
                    if let Some(ns) = inner.namespace() {
                        let dst_ns = self.filter.map_ns(ns);
                        self.dest.apply_oplog(&dst_ns, &inner).await?;
                        applied += 1;
                    }
                }
                self.acknowledge(applied).await?;
                Ok(())
            }
            _ => {
                let ns = match oper.namespace() {
                    Some(ns) => self.filter.map_ns(ns),
                    None => return Ok(()),
                };
                match DocOp::from_operation(&oper) {
                    Some(op) => {
                        self.buffer.push((ns, op));
                        if self.buffer.len() >= GROUP_FLUSH_SIZE {
                            self.flush(true).await?;
                        }
                        Ok(())
                    }
                    None => {
                        // No document identity; apply alone to keep ordering simple.
                        self.flush(false).await?;
                        self.dest.apply_oplog(&ns, &oper).await?;
                        self.acknowledge(1).await?;
                        Ok(())
                    }
                }
            }
        }
    }

    /// Dispatch everything buffered, grouped by namespace, and advance the checkpoint once
    /// the destination has acknowledged. `advance_idle` also moves the checkpoint when the
    /// buffer was empty (idle flush over filtered-out entries).
    async fn flush(&mut self, advance_idle: bool) -> Result<()> {
        if self.buffer.is_empty() {
            if advance_idle && self.latest_seen > self.applied {
                self.acknowledge(0).await?;
            }
            return Ok(());
        }

        let buffer = std::mem::take(&mut self.buffer);
        let count = buffer.len() as u64;

        // Group by namespace, preserving arrival order within each group.
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<DocOp>> = HashMap::new();
        for (ns, op) in buffer {
            if !groups.contains_key(&ns) {
                order.push(ns.clone());
            }
            groups.entry(ns).or_default().push(op);
        }

        for ns in order {
            let ops = groups.remove(&ns).unwrap_or_default();
            if ops.len() <= SMALL_GROUP_LIMIT {
                self.dest.bulk_write(&ns, &ops).await?;
            } else {
                let parts = partition_by_id(ops, self.partitions);
                let writes = parts.into_iter().filter(|p| !p.is_empty()).map(|part| {
                    let dest = self.dest.clone();
                    let ns = ns.clone();
                    async move { dest.bulk_write(&ns, &part).await }
                });
                futures::future::try_join_all(writes).await?;
            }
        }

        self.acknowledge(count).await?;
        Ok(())
    }

    /// Move the checkpoint to the newest seen entry; everything at or before it has been
    /// acknowledged by the destination.
    async fn acknowledge(&mut self, applied_count: u64) -> Result<()> {
        self.applied = self.latest_seen;
        if applied_count > 0 {
            self.reporter.applied(applied_count, self.applied).await;
        }
        if let Some(log) = &mut self.optime_log {
            log.maybe_write(self.applied)?;
        }
        Ok(())
    }

    /// Final flush and unconditional checkpoint write, for shutdown.
    async fn finish(&mut self) -> Result<()> {
        self.flush(true).await?;
        if let Some(log) = &mut self.optime_log {
            log.write(self.applied)?;
        }
        debug!(optime = %self.applied, "replayer stopped");
        Ok(())
    }
}

/// Shard a namespace group into `partitions` buckets by `_id` hash, keeping arrival order
/// inside each bucket.
pub fn partition_by_id(ops: Vec<DocOp>, partitions: usize) -> Vec<Vec<DocOp>> {
    let partitions = partitions.max(1);
    let mut parts: Vec<Vec<DocOp>> = (0..partitions).map(|_| Vec::new()).collect();
    for op in ops {
        let index = (id_hash(op.id()) as usize) % partitions;
        parts[index].push(op);
    }
    parts
}

/// MurmurHash3 (32-bit, zero seed) over the `_id`'s string form.
pub fn id_hash(id: &Bson) -> u32 {
    let key = id.to_string();
    murmur3::murmur3_32(&mut IoCursor::new(key.as_bytes()), 0).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn replace(id: i32, v: i32) -> DocOp {
        DocOp::Replace {
            id: Bson::Int32(id),
            document: doc! { "_id": id, "v": v },
        }
    }

    #[test]
    fn id_hash_is_deterministic() {
        assert_eq!(id_hash(&Bson::Int32(7)), id_hash(&Bson::Int32(7)));
        assert_eq!(
            id_hash(&Bson::String("abc".into())),
            id_hash(&Bson::String("abc".into()))
        );
    }

    #[test]
    fn partitioning_preserves_per_id_order() {
        // Version numbers of one _id arrive in increasing order; they must stay that way
        // inside whichever partition the _id hashes to.
        let ops: Vec<DocOp> = (0..300).map(|v| replace(v % 10, v)).collect();
        let parts = partition_by_id(ops, 4);

        assert_eq!(parts.len(), 4);
        assert_eq!(parts.iter().map(Vec::len).sum::<usize>(), 300);

        for part in parts {
            let mut last_version: HashMap<i32, i32> = HashMap::new();
            for op in part {
                if let DocOp::Replace { id, document } = op {
                    let id = id.as_i32().unwrap();
                    let v = document.get_i32("v").unwrap();
                    if let Some(prev) = last_version.insert(id, v) {
                        assert!(v > prev, "versions of one _id out of order");
                    }
                }
            }
        }
    }

    #[test]
    fn all_ops_for_one_id_share_a_partition() {
        let ops: Vec<DocOp> = (0..50).map(|v| replace(42, v)).collect();
        let parts = partition_by_id(ops, 8);

        let populated: Vec<_> = parts.iter().filter(|p| !p.is_empty()).collect();
        assert_eq!(populated.len(), 1);
        assert_eq!(populated[0].len(), 50);
    }

    #[test]
    fn a_single_partition_is_the_identity() {
        let ops = vec![replace(1, 0), replace(2, 0), replace(1, 1)];
        let parts = partition_by_id(ops.clone(), 1);

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0], ops);
    }
}
