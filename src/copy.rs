//! The initial bulk copy: classify collections as small or large, split large ones at `_id`
//! boundaries, and drive the batched parallel copy against the destination.
//!
//! The reader builds replace-by-`_id` batches from an `_id`-ordered scan and dispatches
//! groups of batches to parallel writers; the group is the back-pressure boundary, the
//! cursor only advances while there is headroom. Operations concurrent with the copy are
//! reconciled later by the oplog phase, whose start timestamp is captured before any scan
//! begins.

use bson::{Bson, Document};
use futures::stream::{self, TryStreamExt};
use mongodb::bson;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::dest::{DestClient, DocOp};
use crate::filter::DataFilter;
use crate::progress::ProgressReporter;
use crate::source::MongoSource;
use crate::{Error, Result};

/// Documents per replace batch.
const BATCH_DOCS: usize = 100;

/// Batches dispatched to writers as one group.
const GROUP_BATCHES: usize = 10;

/// The copy plan for one collection.
#[derive(Clone, Debug)]
pub struct CollPlan {
    /// Source namespace.
    pub src_ns: String,
    /// Destination namespace, rename applied.
    pub dst_ns: String,
    /// Approximate document count at planning time.
    pub count: u64,
    /// Average document size in bytes.
    pub avg_obj_size: u64,
    /// Ordered `_id` boundaries partitioning a large collection; empty for small ones.
    pub split_points: Vec<Bson>,
}

impl CollPlan {
    /// The half-open `_id` ranges the split points induce. A collection without split
    /// points is a single unbounded range.
    pub fn ranges(&self) -> Vec<(Option<Bson>, Option<Bson>)> {
        if self.split_points.is_empty() {
            return vec![(None, None)];
        }
        let mut ranges = Vec::with_capacity(self.split_points.len() + 1);
        let mut lower: Option<Bson> = None;
        for point in &self.split_points {
            ranges.push((lower.take(), Some(point.clone())));
            lower = Some(point.clone());
        }
        ranges.push((lower, None));
        ranges
    }
}

/// Drives the initial copy of all in-scope collections.
pub struct InitialCopier {
    source: MongoSource,
    dest: DestClient,
    filter: DataFilter,
    reporter: ProgressReporter,
    workers: usize,
    large_threshold: u64,
    shutdown: watch::Receiver<bool>,
}

impl InitialCopier {
    /// Create a copier over connected source and destination. A flipped `shutdown` aborts
    /// the copy at the next batch boundary.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: MongoSource,
        dest: DestClient,
        filter: DataFilter,
        reporter: ProgressReporter,
        workers: usize,
        large_threshold: u64,
        shutdown: watch::Receiver<bool>,
    ) -> InitialCopier {
        InitialCopier {
            source,
            dest,
            filter,
            reporter,
            workers,
            large_threshold,
            shutdown,
        }
    }

    /// Copy every in-scope collection. Small collections run through a bounded-concurrency
    /// pool first; large ones follow, each `_id` range its own worker.
    pub async fn run(&self) -> Result<()> {
        let namespaces = self.source.list_namespaces(&self.filter).await?;
        info!(collections = namespaces.len(), "initial copy starting");

        let mut small = Vec::new();
        let mut large = Vec::new();
        for ns in namespaces {
            let plan = self.plan(&ns).await?;
            if plan.count > self.large_threshold {
                large.push(plan);
            } else {
                small.push(plan);
            }
        }

        stream::iter(small.into_iter().map(Ok))
            .try_for_each_concurrent(self.workers, |plan| {
                let copier = self;
                async move { copier.copy_collection(plan).await }
            })
            .await?;

        for plan in large {
            if *self.shutdown.borrow() {
                return Err(Error::Interrupted);
            }
            self.copy_large_collection(plan).await?;
        }

        info!("initial copy done");
        Ok(())
    }

    async fn plan(&self, ns: &str) -> Result<CollPlan> {
        let stats = self.source.collection_stats(ns).await?;
        let split_points = if stats.count > self.large_threshold {
            self.source
                .split_points(ns, stats.count, self.workers - 1)
                .await?
        } else {
            Vec::new()
        };

        debug!(
            ns,
            count = stats.count,
            splits = split_points.len(),
            "collection planned"
        );
        Ok(CollPlan {
            src_ns: ns.to_string(),
            dst_ns: self.filter.map_ns(ns),
            count: stats.count,
            avg_obj_size: stats.avg_obj_size,
            split_points,
        })
    }

    async fn copy_collection(&self, plan: CollPlan) -> Result<()> {
        self.reporter.start(&plan.src_ns, plan.count).await;
        copy_range(
            &self.source,
            &self.dest,
            &self.reporter,
            &self.shutdown,
            &plan.src_ns,
            &plan.dst_ns,
            None,
            None,
        )
        .await?;
        self.reporter.done(&plan.src_ns).await;
        Ok(())
    }

    /// One worker per key range; the collection is only reported done once every range has
    /// reported back.
    async fn copy_large_collection(&self, plan: CollPlan) -> Result<()> {
        self.reporter.start(&plan.src_ns, plan.count).await;

        let mut handles = Vec::new();
        for (lower, upper) in plan.ranges() {
            let source = self.source.clone();
            let dest = self.dest.clone();
            let reporter = self.reporter.clone();
            let shutdown = self.shutdown.clone();
            let src_ns = plan.src_ns.clone();
            let dst_ns = plan.dst_ns.clone();
            handles.push(tokio::spawn(async move {
                copy_range(
                    &source, &dest, &reporter, &shutdown, &src_ns, &dst_ns, lower, upper,
                )
                .await
            }));
        }

        for handle in handles {
            handle.await.map_err(|e| Error::Worker(e.to_string()))??;
        }
        self.reporter.done(&plan.src_ns).await;
        Ok(())
    }
}

/// Copy one `_id` range of one collection: scan in `_id` order, batch replaces, dispatch
/// groups of batches to parallel writers.
#[allow(clippy::too_many_arguments)]
async fn copy_range(
    source: &MongoSource,
    dest: &DestClient,
    reporter: &ProgressReporter,
    shutdown: &watch::Receiver<bool>,
    src_ns: &str,
    dst_ns: &str,
    lower: Option<Bson>,
    upper: Option<Bson>,
) -> Result<()> {
    let mut cursor = source.scan(src_ns, lower, upper).await?;
    let mut batch: Vec<DocOp> = Vec::with_capacity(BATCH_DOCS);
    let mut group: Vec<Vec<DocOp>> = Vec::with_capacity(GROUP_BATCHES);

    while let Some(document) = cursor.try_next().await? {
        batch.push(replace_op(document));
        if batch.len() == BATCH_DOCS {
            group.push(std::mem::replace(&mut batch, Vec::with_capacity(BATCH_DOCS)));
            if group.len() == GROUP_BATCHES {
                flush_group(dest, reporter, src_ns, dst_ns, &mut group).await?;
                if *shutdown.borrow() {
                    return Err(Error::Interrupted);
                }
            }
        }
    }
    if !batch.is_empty() {
        group.push(batch);
    }
    flush_group(dest, reporter, src_ns, dst_ns, &mut group).await?;
    Ok(())
}

async fn flush_group(
    dest: &DestClient,
    reporter: &ProgressReporter,
    src_ns: &str,
    dst_ns: &str,
    group: &mut Vec<Vec<DocOp>>,
) -> Result<()> {
    if group.is_empty() {
        return Ok(());
    }
    let written: u64 = group.iter().map(|b| b.len() as u64).sum();

    let writes = group.drain(..).map(|batch| {
        let dest = dest.clone();
        let dst_ns = dst_ns.to_string();
        async move { dest.bulk_write(&dst_ns, &batch).await }
    });
    futures::future::try_join_all(writes).await?;

    reporter.advance(src_ns, written).await;
    Ok(())
}

fn replace_op(document: Document) -> DocOp {
    let id = document.get("_id").cloned().unwrap_or(Bson::Null);
    DocOp::Replace { id, document }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with_splits(points: Vec<Bson>) -> CollPlan {
        CollPlan {
            src_ns: "db.a".into(),
            dst_ns: "db.a".into(),
            count: 5_000_000,
            avg_obj_size: 128,
            split_points: points,
        }
    }

    #[test]
    fn no_split_points_is_one_unbounded_range() {
        let ranges = plan_with_splits(Vec::new()).ranges();
        assert_eq!(ranges, vec![(None, None)]);
    }

    #[test]
    fn split_points_induce_half_open_ranges() {
        let ranges =
            plan_with_splits(vec![Bson::Int32(100), Bson::Int32(200)]).ranges();

        assert_eq!(
            ranges,
            vec![
                (None, Some(Bson::Int32(100))),
                (Some(Bson::Int32(100)), Some(Bson::Int32(200))),
                (Some(Bson::Int32(200)), None),
            ]
        );
    }

    #[test]
    fn n_minus_one_points_make_n_workers() {
        let points: Vec<Bson> = (1..8).map(Bson::Int32).collect();
        assert_eq!(plan_with_splits(points).ranges().len(), 8);
    }
}
