//! The destination side: a fixed operation vocabulary and a tagged-variant writer over the
//! two destination flavors.
//!
//! Oplog entries are converted to `DocOp`s before dispatch; the conversion encodes the
//! idempotent-replay rules (inserts become replaces with upsert so re-running a tail from an
//! older checkpoint converges to the same state).

use bson::{Bson, Document};
use mongodb::bson;

use crate::config::{DstType, SyncConf};
use crate::index::IndexSpec;
use crate::oper::Operation;
use crate::Result;

pub mod es;
pub mod mongo;

pub use es::EsDest;
pub use mongo::MongoDest;

/// A single per-document write, keyed by `_id`.
#[derive(Clone, Debug, PartialEq)]
pub enum DocOp {
    /// Replace the document with the given `_id`, inserting it if absent.
    Replace {
        /// The document identity.
        id: Bson,
        /// The full replacement document.
        document: Document,
    },
    /// Apply a modifier document (`$set`, `$inc`, ...) to the document with the given `_id`.
    Update {
        /// The document identity.
        id: Bson,
        /// The modifier document.
        update: Document,
    },
    /// Delete the document with the given `_id`.
    Delete {
        /// The document identity.
        id: Bson,
    },
}

impl DocOp {
    /// Convert an insert/update/delete operation into its destination write. Returns `None`
    /// for commands, no-ops and the rare entries without a document identity; those take the
    /// singleton `apply_oplog` path instead.
    pub fn from_operation(oper: &Operation) -> Option<DocOp> {
        match oper {
            Operation::Insert { document, .. } => {
                let id = document.get("_id")?.clone();
                Some(DocOp::Replace {
                    id,
                    document: document.clone(),
                })
            }
            Operation::Update { query, update, .. } => {
                let id = query.get("_id")?.clone();
                if has_modifiers(update) {
                    Some(DocOp::Update {
                        id,
                        update: update.clone(),
                    })
                } else {
                    Some(DocOp::Replace {
                        id,
                        document: update.clone(),
                    })
                }
            }
            Operation::Delete { query, .. } => {
                let id = query.get("_id")?.clone();
                Some(DocOp::Delete { id })
            }
            _ => None,
        }
    }

    /// The `_id` the write is keyed by.
    pub fn id(&self) -> &Bson {
        match self {
            DocOp::Replace { id, .. } | DocOp::Update { id, .. } | DocOp::Delete { id } => id,
        }
    }
}

/// Whether an update payload is a modifier document rather than a full replacement.
pub fn has_modifiers(update: &Document) -> bool {
    update.keys().any(|k| k.starts_with('$'))
}

/// The destination writer, one variant per destination flavor.
#[derive(Clone)]
pub enum DestClient {
    /// MongoDB destination.
    Mongo(MongoDest),
    /// Elasticsearch destination.
    Es(EsDest),
}

impl DestClient {
    /// Connect the destination named by the configuration.
    pub async fn connect(conf: &SyncConf) -> Result<DestClient> {
        match conf.dst_type {
            DstType::Mongo => Ok(DestClient::Mongo(MongoDest::connect(&conf.dst).await?)),
            DstType::Es => Ok(DestClient::Es(EsDest::connect(
                &conf.dst,
                conf.projection.clone(),
            )?)),
        }
    }

    /// Recreate a source index at the destination.
    pub async fn create_index(&self, ns: &str, spec: &IndexSpec) -> Result<()> {
        match self {
            DestClient::Mongo(dest) => dest.create_index(ns, spec).await,
            DestClient::Es(dest) => dest.create_index(ns, spec).await,
        }
    }

    /// Apply an ordered batch of per-document writes to one namespace.
    pub async fn bulk_write(&self, ns: &str, ops: &[DocOp]) -> Result<()> {
        match self {
            DestClient::Mongo(dest) => dest.bulk_write(ns, ops).await,
            DestClient::Es(dest) => dest.bulk_write(ns, ops).await,
        }
    }

    /// Apply a single oplog operation, the slow path for entries that cannot be grouped.
    /// `ns` is the destination namespace, rename already applied.
    pub async fn apply_oplog(&self, ns: &str, oper: &Operation) -> Result<()> {
        match self {
            DestClient::Mongo(dest) => dest.apply_oplog(ns, oper).await,
            DestClient::Es(dest) => dest.apply_oplog(ns, oper).await,
        }
    }

    /// Apply a database command. Failures other than "namespace not found" are logged and
    /// skipped; only transport-level problems surface as errors.
    pub async fn handle_command(&self, db: &str, command: &Document) -> Result<()> {
        match self {
            DestClient::Mongo(dest) => dest.handle_command(db, command).await,
            DestClient::Es(dest) => dest.handle_command(db, command).await,
        }
    }

    /// Block until the destination is reachable again.
    pub async fn reconnect(&self) -> Result<()> {
        match self {
            DestClient::Mongo(dest) => dest.reconnect().await,
            DestClient::Es(dest) => dest.reconnect().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oper::Optime;
    use bson::doc;

    #[test]
    fn inserts_become_replaces_with_upsert_semantics() {
        let oper = Operation::Insert {
            optime: Optime::new(1, 0),
            namespace: "db.a".into(),
            document: doc! { "_id": 7, "v": 1 },
        };

        assert_eq!(
            DocOp::from_operation(&oper),
            Some(DocOp::Replace {
                id: Bson::Int32(7),
                document: doc! { "_id": 7, "v": 1 },
            })
        );
    }

    #[test]
    fn modifier_updates_stay_updates() {
        let oper = Operation::Update {
            optime: Optime::new(1, 0),
            namespace: "db.a".into(),
            query: doc! { "_id": 7 },
            update: doc! { "$set": { "v": 2 } },
        };

        assert_eq!(
            DocOp::from_operation(&oper),
            Some(DocOp::Update {
                id: Bson::Int32(7),
                update: doc! { "$set": { "v": 2 } },
            })
        );
    }

    #[test]
    fn full_document_updates_become_replaces() {
        let oper = Operation::Update {
            optime: Optime::new(1, 0),
            namespace: "db.a".into(),
            query: doc! { "_id": 7 },
            update: doc! { "_id": 7, "v": 3 },
        };

        assert_eq!(
            DocOp::from_operation(&oper),
            Some(DocOp::Replace {
                id: Bson::Int32(7),
                document: doc! { "_id": 7, "v": 3 },
            })
        );
    }

    #[test]
    fn deletes_become_deletes() {
        let oper = Operation::Delete {
            optime: Optime::new(1, 0),
            namespace: "db.a".into(),
            query: doc! { "_id": 7 },
        };

        assert_eq!(
            DocOp::from_operation(&oper),
            Some(DocOp::Delete { id: Bson::Int32(7) })
        );
    }

    #[test]
    fn entries_without_identity_take_the_singleton_path() {
        let noop = Operation::Noop {
            optime: Optime::new(1, 0),
            message: None,
        };
        let command = Operation::Command {
            optime: Optime::new(1, 0),
            namespace: "db.$cmd".into(),
            command: doc! { "create": "a" },
        };
        let headless_insert = Operation::Insert {
            optime: Optime::new(1, 0),
            namespace: "db.a".into(),
            document: doc! { "v": 1 },
        };

        assert_eq!(DocOp::from_operation(&noop), None);
        assert_eq!(DocOp::from_operation(&command), None);
        assert_eq!(DocOp::from_operation(&headless_insert), None);
    }
}
