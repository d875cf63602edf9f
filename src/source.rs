//! The source side: a client connected to a replica set member, with primary discovery,
//! paged collection scans, split-point computation and reconnect-with-backoff.
//!
//! Transient network failures are retried with a fixed back-off until they succeed;
//! authentication and authorisation failures fail fast.

use std::time::Duration;

use bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, Credential, FindOptions, ServerAddress};
use mongodb::{bson, Client, Cursor};
use tracing::{info, warn};

use crate::config::Endpoint;
use crate::filter::{split_namespace, DataFilter};
use crate::index::IndexSpec;
use crate::oper::Optime;
use crate::{Error, Result};

/// Fixed pause between reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Per-collection statistics driving the small/large classification.
#[derive(Clone, Copy, Debug, Default)]
pub struct CollStats {
    /// Document count.
    pub count: u64,
    /// Average document size in bytes.
    pub avg_obj_size: u64,
}

/// A client for the replica set the data is read from.
#[derive(Clone)]
pub struct MongoSource {
    client: Client,
    replset: Option<String>,
}

impl MongoSource {
    /// Connect to a replica set member and discover the set it belongs to.
    pub async fn connect(endpoint: &Endpoint) -> Result<MongoSource> {
        let client = build_client(endpoint)?;

        let hello = client
            .database("admin")
            .run_command(doc! { "isMaster": 1 }, None)
            .await?;
        let replset = hello.get_str("setName").ok().map(str::to_string);
        match &replset {
            Some(name) => info!(replset = name.as_str(), "connected to source replica set"),
            None => warn!("source does not report a replica set name; oplog tailing will fail"),
        }

        Ok(MongoSource { client, replset })
    }

    /// The underlying driver client, for opening oplog cursors.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The replica set name reported by the source, if any.
    pub fn replset(&self) -> Option<&str> {
        self.replset.as_deref()
    }

    /// The server version string, for the startup banner.
    pub async fn server_version(&self) -> Result<String> {
        let status = self
            .client
            .database("admin")
            .run_command(doc! { "serverStatus": 1 }, None)
            .await?;
        Ok(status.get_str("version").unwrap_or("unknown").to_string())
    }

    /// The applied-operation timestamp of the current primary, read from the replica set
    /// status.
    pub async fn primary_optime(&self) -> Result<Optime> {
        let status = self
            .client
            .database("admin")
            .run_command(doc! { "replSetGetStatus": 1 }, None)
            .await?;

        let members = status.get_array("members")?;
        for member in members.iter().filter_map(Bson::as_document) {
            if member.get_str("stateStr") != Ok("PRIMARY") {
                continue;
            }
            // Servers before 3.4 report a bare timestamp, newer ones a { ts, t } document.
            match member.get("optime") {
                Some(Bson::Timestamp(ts)) => return Ok((*ts).into()),
                Some(Bson::Document(optime)) => {
                    return Ok(optime.get_timestamp("ts")?.into());
                }
                _ => return Err(Error::NoPrimary),
            }
        }
        Err(Error::NoPrimary)
    }

    /// Enumerate the in-scope namespaces, ignore lists and filter applied.
    pub async fn list_namespaces(&self, filter: &DataFilter) -> Result<Vec<String>> {
        let mut namespaces = Vec::new();
        for db in self.client.list_database_names(None, None).await? {
            if !filter.valid_db(&db) {
                continue;
            }
            let mut colls = self
                .client
                .database(&db)
                .list_collection_names(None)
                .await?;
            colls.sort();
            for coll in colls {
                let ns = format!("{}.{}", db, coll);
                if filter.valid_ns(&ns) {
                    namespaces.push(ns);
                }
            }
        }
        Ok(namespaces)
    }

    /// Document count and average object size for a collection.
    pub async fn collection_stats(&self, ns: &str) -> Result<CollStats> {
        let (db, coll) = split_namespace(ns);
        let stats = self
            .client
            .database(db)
            .run_command(doc! { "collStats": coll }, None)
            .await?;

        Ok(CollStats {
            count: as_u64(stats.get("count")),
            avg_obj_size: as_u64(stats.get("avgObjSize")),
        })
    }

    /// Compute up to `max_points` split `_id` values partitioning the collection into ranges
    /// of roughly equal document count. An empty result means the collection is copied
    /// unsplit; `splitVector` is not available everywhere, so failures degrade to that.
    pub async fn split_points(
        &self,
        ns: &str,
        count: u64,
        max_points: usize,
    ) -> Result<Vec<Bson>> {
        if count == 0 || max_points == 0 {
            return Ok(Vec::new());
        }
        let (db, _) = split_namespace(ns);
        let chunk_objects = (count / (max_points as u64 + 1)).max(1);

        let response = self
            .client
            .database(db)
            .run_command(
                doc! {
                    "splitVector": ns,
                    "keyPattern": { "_id": 1 },
                    "maxChunkObjects": chunk_objects as i64,
                    "maxSplitPoints": max_points as i64,
                },
                None,
            )
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(ns, error = %e, "splitVector unavailable, copying unsplit");
                return Ok(Vec::new());
            }
        };

        let mut points = Vec::new();
        if let Ok(keys) = response.get_array("splitKeys") {
            for key in keys.iter().filter_map(Bson::as_document) {
                if let Some(id) = key.get("_id") {
                    points.push(id.clone());
                }
            }
        }
        Ok(points)
    }

    /// Open an `_id`-ordered scan over a collection, optionally bounded to the half-open
    /// range `[lower, upper)`.
    pub async fn scan(
        &self,
        ns: &str,
        lower: Option<Bson>,
        upper: Option<Bson>,
    ) -> Result<Cursor<Document>> {
        let (db, coll) = split_namespace(ns);

        let mut range = Document::new();
        if let Some(lower) = lower {
            range.insert("$gte", lower);
        }
        if let Some(upper) = upper {
            range.insert("$lt", upper);
        }
        let query = if range.is_empty() {
            None
        } else {
            Some(doc! { "_id": range })
        };

        let opts = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .no_cursor_timeout(true)
            .build();

        let cursor = self
            .client
            .database(db)
            .collection::<Document>(coll)
            .find(query, opts)
            .await?;
        Ok(cursor)
    }

    /// Enumerate the user indexes of a collection.
    pub async fn list_indexes(&self, ns: &str) -> Result<Vec<IndexSpec>> {
        let (db, coll) = split_namespace(ns);
        let database = self.client.database(db);

        let mut response = database
            .run_command(doc! { "listIndexes": coll }, None)
            .await?;

        let mut specs = Vec::new();
        loop {
            let cursor = response.get_document("cursor")?;
            let batch = cursor
                .get_array("firstBatch")
                .or_else(|_| cursor.get_array("nextBatch"))?;
            for doc in batch.iter().filter_map(Bson::as_document) {
                specs.push(IndexSpec::from_document(doc)?);
            }
            let id = cursor.get_i64("id")?;
            if id == 0 {
                break;
            }
            response = database
                .run_command(doc! { "getMore": id, "collection": coll }, None)
                .await?;
        }
        Ok(specs)
    }

    /// Block until the source answers a ping again, with a fixed back-off between attempts.
    /// Authentication failures abort immediately.
    pub async fn reconnect(&self) -> Result<()> {
        let mut attempts = 0u64;
        loop {
            match self
                .client
                .database("admin")
                .run_command(doc! { "ping": 1 }, None)
                .await
            {
                Ok(_) => {
                    if attempts > 0 {
                        info!(attempts, "source connection re-established");
                    }
                    return Ok(());
                }
                Err(e) => {
                    let err = Error::from(e);
                    if err.is_unauthorized() {
                        return Err(err);
                    }
                    attempts += 1;
                    if attempts % 10 == 1 {
                        warn!(attempts, error = %err, "waiting for source");
                    }
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

}

/// Build a driver client for an endpoint.
pub fn build_client(endpoint: &Endpoint) -> Result<Client> {
    let mut hosts = Vec::with_capacity(endpoint.hosts.len());
    for host in &endpoint.hosts {
        hosts.push(ServerAddress::parse(host)?);
    }

    let credential = match (&endpoint.username, &endpoint.password) {
        (Some(username), Some(password)) => Some(
            Credential::builder()
                .username(username.clone())
                .password(password.clone())
                .source(endpoint.authdb.clone())
                .build(),
        ),
        _ => None,
    };

    let options = ClientOptions::builder()
        .hosts(hosts)
        .credential(credential)
        .app_name("mongosync".to_string())
        .build();

    Ok(Client::with_options(options)?)
}

fn as_u64(value: Option<&Bson>) -> u64 {
    match value {
        Some(Bson::Int32(i)) => (*i).max(0) as u64,
        Some(Bson::Int64(i)) => (*i).max(0) as u64,
        Some(Bson::Double(f)) => {
            if *f > 0.0 {
                *f as u64
            } else {
                0
            }
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_fields_widen_to_u64() {
        assert_eq!(as_u64(Some(&Bson::Int32(7))), 7);
        assert_eq!(as_u64(Some(&Bson::Int64(1 << 40))), 1 << 40);
        assert_eq!(as_u64(Some(&Bson::Double(12.9))), 12);
        assert_eq!(as_u64(Some(&Bson::Double(-1.0))), 0);
        assert_eq!(as_u64(None), 0);
    }
}
