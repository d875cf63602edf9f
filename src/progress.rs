//! Progress reporting: workers publish per-namespace counters into a bounded channel, a
//! single consumer task owns the registry and prints rate-limited progress lines and
//! completion summaries.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::oper::Optime;

/// Default minimum gap between progress lines for one namespace.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(2);

const CHANNEL_CAPACITY: usize = 256;

/// A progress event sent by a worker.
#[derive(Clone, Debug)]
pub enum ProgressMsg {
    /// A namespace copy began, with the expected document total.
    Start {
        /// The source namespace.
        ns: String,
        /// Expected document count.
        total: u64,
    },
    /// `n` more documents of a namespace were written.
    Advance {
        /// The source namespace.
        ns: String,
        /// Number of documents written since the last event.
        n: u64,
    },
    /// A namespace finished copying.
    Done {
        /// The source namespace.
        ns: String,
    },
    /// Oplog entries were applied up to an optime.
    Applied {
        /// Entries applied since the last event.
        n: u64,
        /// The optime of the newest applied entry.
        optime: Optime,
    },
}

struct Entry {
    processed: u64,
    total: u64,
    started: Instant,
    last_log: Option<Instant>,
    done: bool,
}

/// The sending half handed to workers. Cheap to clone; the consumer stops once every clone
/// is dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<ProgressMsg>,
}

impl ProgressReporter {
    /// Spawn the consumer task and return the reporter plus its handle, to be awaited at
    /// shutdown.
    pub fn spawn(log_interval: Duration) -> (ProgressReporter, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(consume(rx, log_interval));
        (ProgressReporter { tx }, handle)
    }

    /// Announce a namespace and its expected total.
    pub async fn start(&self, ns: &str, total: u64) {
        self.send(ProgressMsg::Start {
            ns: ns.to_string(),
            total,
        })
        .await;
    }

    /// Record `n` more documents written for a namespace.
    pub async fn advance(&self, ns: &str, n: u64) {
        self.send(ProgressMsg::Advance {
            ns: ns.to_string(),
            n,
        })
        .await;
    }

    /// Mark a namespace complete.
    pub async fn done(&self, ns: &str) {
        self.send(ProgressMsg::Done { ns: ns.to_string() }).await;
    }

    /// Record applied oplog entries.
    pub async fn applied(&self, n: u64, optime: Optime) {
        self.send(ProgressMsg::Applied { n, optime }).await;
    }

    async fn send(&self, msg: ProgressMsg) {
        // A closed channel only happens at shutdown; losing a progress line is fine.
        let _ = self.tx.send(msg).await;
    }
}

async fn consume(mut rx: mpsc::Receiver<ProgressMsg>, log_interval: Duration) {
    let mut registry: HashMap<String, Entry> = HashMap::new();
    let mut applied_total: u64 = 0;
    let mut applied_last_log: Option<Instant> = None;

    while let Some(msg) = rx.recv().await {
        match msg {
            ProgressMsg::Start { ns, total } => {
                info!(ns = ns.as_str(), total, ">>>> copy started");
                registry.insert(
                    ns,
                    Entry {
                        processed: 0,
                        total,
                        started: Instant::now(),
                        last_log: None,
                        done: false,
                    },
                );
            }
            ProgressMsg::Advance { ns, n } => {
                let entry = registry.entry(ns.clone()).or_insert_with(|| Entry {
                    processed: 0,
                    total: 0,
                    started: Instant::now(),
                    last_log: None,
                    done: false,
                });
                entry.processed += n;
                let due = match entry.last_log {
                    None => true,
                    Some(at) => at.elapsed() >= log_interval,
                };
                if due {
                    info!(
                        ns = ns.as_str(),
                        processed = entry.processed,
                        total = entry.total,
                        ">> copying"
                    );
                    entry.last_log = Some(Instant::now());
                }
            }
            ProgressMsg::Done { ns } => {
                if let Some(entry) = registry.get_mut(&ns) {
                    entry.done = true;
                    info!(
                        ns = ns.as_str(),
                        processed = entry.processed,
                        elapsed_secs = entry.started.elapsed().as_secs(),
                        "==== copy done"
                    );
                }
            }
            ProgressMsg::Applied { n, optime } => {
                applied_total += n;
                let due = match applied_last_log {
                    None => true,
                    Some(at) => at.elapsed() >= log_interval,
                };
                if due {
                    info!(
                        applied = applied_total,
                        optime = %optime,
                        at = %optime.to_datetime(),
                        "oplog replay"
                    );
                    applied_last_log = Some(Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consumer_drains_and_stops_when_senders_drop() {
        let (reporter, handle) = ProgressReporter::spawn(Duration::from_millis(1));

        reporter.start("db.a", 10).await;
        reporter.advance("db.a", 5).await;
        reporter.advance("db.a", 5).await;
        reporter.done("db.a").await;
        reporter.applied(3, Optime::new(100, 1)).await;

        drop(reporter);
        handle.await.unwrap();
    }
}
