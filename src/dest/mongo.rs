//! The MongoDB destination: ordered bulk writes, a single-entry replay fallback and the two
//! sharded-cluster special cases.
//!
//! The 2.x driver has no mixed-operation bulk API, so a batch is expressed as consecutive
//! runs of `update` and `delete` database commands, dispatched in batch order. A run never
//! spans an operation-kind change: an insert followed by a delete of the same `_id` must
//! reach the server in that order.

use std::time::Duration;

use bson::{doc, Bson, Document};
use mongodb::bson;
use mongodb::options::ReplaceOptions;
use mongodb::Client;
use tracing::{debug, error, info, warn};

use crate::config::Endpoint;
use crate::dest::DocOp;
use crate::filter::split_namespace;
use crate::index::IndexSpec;
use crate::oper::Operation;
use crate::source::build_client;
use crate::{Error, Result};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// A writer for a MongoDB destination: standalone, replica set or mongos.
#[derive(Clone)]
pub struct MongoDest {
    client: Client,
    is_mongos: bool,
}

impl MongoDest {
    /// Connect to the destination and record whether it is a mongos.
    pub async fn connect(endpoint: &Endpoint) -> Result<MongoDest> {
        let client = build_client(endpoint)?;
        let hello = client
            .database("admin")
            .run_command(doc! { "isMaster": 1 }, None)
            .await?;
        let is_mongos = hello.get_str("msg") == Ok("isdbgrid");
        if is_mongos {
            info!("destination is a mongos");
        }

        Ok(MongoDest { client, is_mongos })
    }

    /// Whether the destination is a sharded cluster router.
    pub fn is_mongos(&self) -> bool {
        self.is_mongos
    }

    /// Recreate a source index on the destination collection.
    pub async fn create_index(&self, ns: &str, spec: &IndexSpec) -> Result<()> {
        let (db, coll) = split_namespace(ns);
        self.client
            .database(db)
            .collection::<Document>(coll)
            .create_index(spec.to_index_model(), None)
            .await?;
        debug!(ns, index = spec.name.as_str(), "index created");
        Ok(())
    }

    /// Apply an ordered batch of per-document writes. Transient failures retry after a
    /// reconnect; a server-reported write error falls back to per-operation application to
    /// localise the failure, and anything that is not a duplicate key abandons the batch.
    pub async fn bulk_write(&self, ns: &str, ops: &[DocOp]) -> Result<()> {
        let (db, coll) = split_namespace(ns);

        let mut offset = 0;
        for (command, run_len) in build_write_commands(coll, ops) {
            let response = self.run_write_command(db, command).await?;
            if response.get_array("writeErrors").is_ok() {
                warn!(ns, "bulk write reported errors, isolating per operation");
                self.apply_each(ns, &ops[offset..offset + run_len]).await?;
            }
            offset += run_len;
        }
        Ok(())
    }

    /// Apply a single oplog operation. The slow path used for grouped-replay fallback and for
    /// entries without a document identity.
    ///
    /// An insert without `_id` is assumed to be a legacy index-creation insert and applied
    /// verbatim. An update rejected for touching an immutable field on a mongos is compensated
    /// by delete-then-insert; the two steps are not transactional, a crash in between loses
    /// the document.
    pub async fn apply_oplog(&self, ns: &str, oper: &Operation) -> Result<()> {
        let (db, coll) = split_namespace(ns);
        let collection = self.client.database(db).collection::<Document>(coll);

        match oper {
            Operation::Insert { document, .. } if document.get("_id").is_none() => {
                collection.insert_one(document.clone(), None).await?;
                Ok(())
            }
            Operation::Insert { document, .. } => {
                let id = document.get("_id").cloned().unwrap_or(Bson::Null);
                self.replace_by_id(ns, id, document.clone()).await
            }
            Operation::Update { query, update, .. } => {
                if super::has_modifiers(update) {
                    collection
                        .update_one(query.clone(), update.clone(), None)
                        .await?;
                    Ok(())
                } else {
                    let id = query.get("_id").cloned().unwrap_or(Bson::Null);
                    self.replace_by_id(ns, id, update.clone()).await
                }
            }
            Operation::Delete { query, .. } => {
                collection.delete_one(query.clone(), None).await?;
                Ok(())
            }
            Operation::Command { namespace, command, .. } => {
                let (cmd_db, _) = split_namespace(namespace);
                self.handle_command(cmd_db, command).await
            }
            Operation::Noop { .. } | Operation::ApplyOps { .. } => Ok(()),
        }
    }

    /// Apply a database command, tolerating "namespace not found". Other command failures are
    /// logged and skipped; replicating a command that the destination rejects must not stall
    /// the tail.
    pub async fn handle_command(&self, db: &str, command: &Document) -> Result<()> {
        if command.contains_key("renameCollection") {
            // renameCollection embeds fully-qualified namespaces and runs against admin;
            // it cannot be rewritten through the rename table.
            warn!(db, %command, "renameCollection is not replicated, skipped");
            return Ok(());
        }

        loop {
            match self
                .client
                .database(db)
                .run_command(command.clone(), None)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    let err = Error::from(e);
                    if err.is_transient() {
                        self.reconnect().await?;
                        continue;
                    }
                    if is_ns_not_found(&err) {
                        debug!(db, %command, "command target namespace missing, ignored");
                    } else {
                        warn!(db, %command, error = %err, "command failed, skipped");
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Block until the destination answers a ping again, with a fixed back-off.
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
                        info!(attempts, "destination connection re-established");
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
                        warn!(attempts, error = %err, "waiting for destination");
                    }
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

    async fn run_write_command(&self, db: &str, command: Document) -> Result<Document> {
        loop {
            match self
                .client
                .database(db)
                .run_command(command.clone(), None)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let err = Error::from(e);
                    if !err.is_transient() {
                        return Err(err);
                    }
                    warn!(error = %err, "write command interrupted, reconnecting");
                    self.reconnect().await?;
                }
            }
        }
    }

    async fn apply_each(&self, ns: &str, ops: &[DocOp]) -> Result<()> {
        for op in ops {
            if let Err(err) = self.apply_doc_op(ns, op).await {
                if err.is_duplicate_key() {
                    warn!(ns, id = %op.id(), "duplicate key on replay, skipped");
                    continue;
                }
                error!(ns, id = %op.id(), error = %err, "write failed after isolation");
                return Err(Error::BulkWrite {
                    ns: ns.to_string(),
                    detail: err.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn apply_doc_op(&self, ns: &str, op: &DocOp) -> Result<()> {
        let (db, coll) = split_namespace(ns);
        let collection = self.client.database(db).collection::<Document>(coll);

        match op {
            DocOp::Replace { id, document } => {
                self.replace_by_id(ns, id.clone(), document.clone()).await
            }
            DocOp::Update { id, update } => {
                collection
                    .update_one(doc! { "_id": id.clone() }, update.clone(), None)
                    .await?;
                Ok(())
            }
            DocOp::Delete { id } => {
                collection
                    .delete_one(doc! { "_id": id.clone() }, None)
                    .await?;
                Ok(())
            }
        }
    }

    async fn replace_by_id(&self, ns: &str, id: Bson, document: Document) -> Result<()> {
        let (db, coll) = split_namespace(ns);
        let collection = self.client.database(db).collection::<Document>(coll);
        let options = ReplaceOptions::builder().upsert(true).build();

        match collection
            .replace_one(doc! { "_id": id.clone() }, document.clone(), options)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if self.is_mongos && is_immutable_field(&e) => {
                // A replace that moves a shard-key field is rejected by mongos. Delete the
                // old document and insert the new one; not transactional.
                warn!(ns, %id, "immutable field on mongos, compensating with delete+insert");
                collection.delete_one(doc! { "_id": id }, None).await?;
                collection.insert_one(document, None).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Express an ordered `DocOp` batch as database write commands: maximal runs of
/// consecutive same-kind operations, each run one `update` or `delete` command. Returns each
/// command with the number of batch entries it covers.
pub fn build_write_commands(coll: &str, ops: &[DocOp]) -> Vec<(Document, usize)> {
    let mut commands = Vec::new();
    let mut i = 0;

    while i < ops.len() {
        let deleting = matches!(ops[i], DocOp::Delete { .. });
        let mut entries = Vec::new();
        let start = i;

        while i < ops.len() && matches!(ops[i], DocOp::Delete { .. }) == deleting {
            entries.push(match &ops[i] {
                DocOp::Replace { id, document } => doc! {
                    "q": { "_id": id.clone() },
                    "u": document.clone(),
                    "upsert": true,
                    "multi": false,
                },
                DocOp::Update { id, update } => doc! {
                    "q": { "_id": id.clone() },
                    "u": update.clone(),
                    "upsert": false,
                    "multi": false,
                },
                DocOp::Delete { id } => doc! {
                    "q": { "_id": id.clone() },
                    "limit": 1,
                },
            });
            i += 1;
        }

        let command = if deleting {
            doc! { "delete": coll, "ordered": true, "deletes": entries }
        } else {
            doc! { "update": coll, "ordered": true, "updates": entries }
        };
        commands.push((command, i - start));
    }
    commands
}

fn is_immutable_field(e: &mongodb::error::Error) -> bool {
    // Code 66 (ImmutableField); older mongos versions only carry the message.
    e.to_string().contains("immutable")
        || matches!(
            *e.kind,
            mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref w))
                if w.code == 66
        )
}

fn is_ns_not_found(err: &Error) -> bool {
    match err {
        Error::Database(e) => match *e.kind {
            mongodb::error::ErrorKind::Command(ref c) => {
                c.code == 26 || c.message.contains("ns not found")
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replace(id: i32) -> DocOp {
        DocOp::Replace {
            id: Bson::Int32(id),
            document: doc! { "_id": id, "v": 1 },
        }
    }

    fn delete(id: i32) -> DocOp {
        DocOp::Delete { id: Bson::Int32(id) }
    }

    #[test]
    fn a_uniform_batch_is_one_command() {
        let ops = vec![replace(1), replace(2), replace(3)];
        let commands = build_write_commands("a", &ops);

        assert_eq!(commands.len(), 1);
        let (command, covered) = &commands[0];
        assert_eq!(*covered, 3);
        assert_eq!(command.get_str("update"), Ok("a"));
        assert_eq!(command.get_bool("ordered"), Ok(true));
        assert_eq!(command.get_array("updates").unwrap().len(), 3);
    }

    #[test]
    fn mixed_kinds_split_into_ordered_runs() {
        // insert 1, delete 1, insert 1 again: collapsing across kinds would break the
        // per-id sequence, so three commands must come out in order.
        let ops = vec![replace(1), delete(1), replace(1)];
        let commands = build_write_commands("a", &ops);

        assert_eq!(commands.len(), 3);
        assert!(commands[0].0.contains_key("update"));
        assert!(commands[1].0.contains_key("delete"));
        assert!(commands[2].0.contains_key("update"));
        assert_eq!(commands.iter().map(|(_, n)| n).sum::<usize>(), 3);
    }

    #[test]
    fn replaces_upsert_and_modifier_updates_do_not() {
        let ops = vec![
            replace(1),
            DocOp::Update {
                id: Bson::Int32(2),
                update: doc! { "$set": { "v": 2 } },
            },
        ];
        let commands = build_write_commands("a", &ops);

        assert_eq!(commands.len(), 1);
        let updates = commands[0].0.get_array("updates").unwrap();
        let first = updates[0].as_document().unwrap();
        let second = updates[1].as_document().unwrap();
        assert_eq!(first.get_bool("upsert"), Ok(true));
        assert_eq!(second.get_bool("upsert"), Ok(false));
    }

    #[test]
    fn deletes_carry_limit_one() {
        let commands = build_write_commands("a", &[delete(9)]);
        let deletes = commands[0].0.get_array("deletes").unwrap();
        let entry = deletes[0].as_document().unwrap();

        assert_eq!(entry.get_i32("limit"), Ok(1));
        assert_eq!(
            entry.get_document("q").unwrap().get_i32("_id"),
            Ok(9)
        );
    }
}
