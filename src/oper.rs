//! The operation module is responsible for converting MongoDB BSON documents into specific
//! `Operation` types, one for each type of document stored in the MongoDB oplog. The raw
//! `(seconds, counter)` timestamp pair is kept as an `Optime` rather than being widened to a
//! wall-clock type: checkpointing and stale-stream validation compare the exact pair.
//!
//! As we accept _any_ document, it may not be a valid operation so wrap any conversions in a
//! `Result`.

use std::fmt;

use crate::{Error, Result};
use bson::{Bson, Document};
use chrono::{DateTime, TimeZone, Utc};
use mongodb::bson;

/// The position of an operation in the oplog: a `(seconds, counter)` pair, ordered
/// lexicographically. Within one source primary this is strictly monotonically increasing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Optime {
    /// Seconds since the Unix epoch.
    pub seconds: u32,
    /// Ordinal of the operation within that second.
    pub counter: u32,
}

impl Optime {
    /// Creates an optime from its two components.
    pub fn new(seconds: u32, counter: u32) -> Optime {
        Optime { seconds, counter }
    }

    /// The zero optime, ordered before every real oplog entry.
    pub fn zero() -> Optime {
        Optime::new(0, 0)
    }

    /// The wall-clock time of the operation, for display only.
    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.seconds as i64, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
    }
}

impl From<bson::Timestamp> for Optime {
    fn from(ts: bson::Timestamp) -> Optime {
        Optime::new(ts.time, ts.increment)
    }
}

impl From<Optime> for bson::Timestamp {
    fn from(optime: Optime) -> bson::Timestamp {
        bson::Timestamp {
            time: optime.seconds,
            increment: optime.counter,
        }
    }
}

impl From<Optime> for Bson {
    fn from(optime: Optime) -> Bson {
        Bson::Timestamp(optime.into())
    }
}

impl fmt::Display for Optime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.seconds, self.counter)
    }
}

/// A MongoDB oplog operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// A no-op as inserted periodically by MongoDB or used to initiate new replica sets.
    Noop {
        /// The position of the operation in the oplog.
        optime: Optime,
        /// The message associated with this operation.
        message: Option<String>,
    },
    /// An insert of a document into a specific database and collection.
    Insert {
        /// The position of the operation in the oplog.
        optime: Optime,
        /// The full namespace of the operation including its database and collection.
        namespace: String,
        /// The BSON document inserted into the namespace.
        document: Document,
    },
    /// An update of a document in a specific database and collection matching a given query.
    Update {
        /// The position of the operation in the oplog.
        optime: Optime,
        /// The full namespace of the operation including its database and collection.
        namespace: String,
        /// The BSON selection criteria for the update.
        query: Document,
        /// The BSON update applied in this operation.
        update: Document,
    },
    /// The deletion of a document in a specific database and collection matching a given query.
    Delete {
        /// The position of the operation in the oplog.
        optime: Optime,
        /// The full namespace of the operation including its database and collection.
        namespace: String,
        /// The BSON selection criteria for the delete.
        query: Document,
    },
    /// A command such as the creation or deletion of a collection.
    Command {
        /// The position of the operation in the oplog.
        optime: Optime,
        /// The full namespace of the operation including its database and collection.
        namespace: String,
        /// The BSON command.
        command: Document,
    },
    /// A command to apply multiple oplog operations at once.
    ApplyOps {
        /// The position of the operation in the oplog.
        optime: Optime,
        /// The full namespace of the operation including its database and collection.
        namespace: String,
        /// A vector of operations to apply.
        operations: Vec<Operation>,
    },
}

impl Operation {
    /// Try to create a new Operation from a BSON document.
    ///
    /// # Example
    ///
    /// ```
    /// # use mongosync::bson::{self, Bson, doc};
    /// use mongosync::Operation;
    ///
    /// # fn main() {
    /// let document = doc! {
    ///     "ts": Bson::Timestamp(bson::Timestamp {
    ///         time: 1479561394,
    ///         increment: 0,
    ///     }),
    ///     "v": 2,
    ///     "op": "i",
    ///     "ns": "foo.bar",
    ///     "o": {
    ///         "foo": "bar"
    ///     }
    /// };
    /// let operation = Operation::new(&document);
    /// # }
    /// ```
    pub fn new(document: &Document) -> Result<Operation> {
        let op = document.get_str("op")?;

        match op {
            "n" => Operation::from_noop(document),
            "i" => Operation::from_insert(document),
            "u" => Operation::from_update(document),
            "d" => Operation::from_delete(document),
            "c" => Operation::from_command(document),
            op => Err(Error::UnknownOperation(op.into())),
        }
    }

    /// The position of the operation in the oplog.
    pub fn optime(&self) -> Optime {
        match *self {
            Operation::Noop { optime, .. }
            | Operation::Insert { optime, .. }
            | Operation::Update { optime, .. }
            | Operation::Delete { optime, .. }
            | Operation::Command { optime, .. }
            | Operation::ApplyOps { optime, .. } => optime,
        }
    }

    /// The namespace the operation applies to, if it has one. No-ops carry an empty
    /// namespace and yield `None`.
    pub fn namespace(&self) -> Option<&str> {
        match *self {
            Operation::Noop { .. } => None,
            Operation::Insert { ref namespace, .. }
            | Operation::Update { ref namespace, .. }
            | Operation::Delete { ref namespace, .. }
            | Operation::Command { ref namespace, .. }
            | Operation::ApplyOps { ref namespace, .. } => Some(namespace),
        }
    }

    /// The `_id` of the document the operation touches. Inserts and deletes carry it in the
    /// payload, updates in the match predicate. Commands and no-ops have no document identity.
    pub fn document_id(&self) -> Option<&Bson> {
        match *self {
            Operation::Insert { ref document, .. } => document.get("_id"),
            Operation::Update { ref query, .. } => query.get("_id"),
            Operation::Delete { ref query, .. } => query.get("_id"),
            _ => None,
        }
    }

    /// Returns an operation from any BSON value.
    fn from_bson(bson: &Bson) -> Result<Operation> {
        match *bson {
            Bson::Document(ref document) => Operation::new(document),
            _ => Err(Error::InvalidOperation),
        }
    }

    /// Returns a no-op operation for a given document.
    fn from_noop(document: &Document) -> Result<Operation> {
        let ts = document.get_timestamp("ts")?;
        // We don't always get a document in "o"
        let message = document
            .get("o")
            .and_then(|d| d.as_document())
            .and_then(|d| d.get("msg"))
            .and_then(|d| d.as_str())
            .map(|s| s.to_string());

        Ok(Operation::Noop {
            optime: ts.into(),
            message,
        })
    }

    /// Return an insert operation for a given document.
    fn from_insert(document: &Document) -> Result<Operation> {
        let ts = document.get_timestamp("ts")?;
        let ns = document.get_str("ns")?;
        let o = document.get_document("o")?;

        Ok(Operation::Insert {
            optime: ts.into(),
            namespace: ns.into(),
            document: o.to_owned(),
        })
    }

    /// Return an update operation for a given document.
    fn from_update(document: &Document) -> Result<Operation> {
        let ts = document.get_timestamp("ts")?;
        let ns = document.get_str("ns")?;
        let o = document.get_document("o")?;
        let o2 = document.get_document("o2")?;

        Ok(Operation::Update {
            optime: ts.into(),
            namespace: ns.into(),
            query: o2.to_owned(),
            update: o.to_owned(),
        })
    }

    /// Return a delete operation for a given document.
    fn from_delete(document: &Document) -> Result<Operation> {
        let ts = document.get_timestamp("ts")?;
        let ns = document.get_str("ns")?;
        let o = document.get_document("o")?;

        Ok(Operation::Delete {
            optime: ts.into(),
            namespace: ns.into(),
            query: o.to_owned(),
        })
    }

    /// Return a command operation for a given document.
    ///
    /// Note that this can return either an `Operation::Command` or an `Operation::ApplyOps` when
    /// successful.
    fn from_command(document: &Document) -> Result<Operation> {
        let ts = document.get_timestamp("ts")?;
        let ns = document.get_str("ns")?;
        let o = document.get_document("o")?;

        match o.get_array("applyOps") {
            Ok(ops) => {
                let operations = ops
                    .iter()
                    .map(Operation::from_bson)
                    .collect::<Result<Vec<Operation>>>()?;

                Ok(Operation::ApplyOps {
                    optime: ts.into(),
                    namespace: ns.into(),
                    operations,
                })
            }
            Err(_) => Ok(Operation::Command {
                optime: ts.into(),
                namespace: ns.into(),
                command: o.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Operation::Noop {
                optime,
                ref message,
            } => {
                write!(f, "No-op at {}: {:?}", optime, message)
            }
            Operation::Insert {
                optime,
                ref namespace,
                ref document,
            } => {
                write!(f, "Insert into {} at {}: {}", namespace, optime, document)
            }
            Operation::Update {
                optime,
                ref namespace,
                ref query,
                ref update,
            } => {
                write!(
                    f,
                    "Update {} with {} at {}: {}",
                    namespace, query, optime, update
                )
            }
            Operation::Delete {
                optime,
                ref namespace,
                ref query,
            } => {
                write!(f, "Delete from {} at {}: {}", namespace, optime, query)
            }
            Operation::Command {
                optime,
                ref namespace,
                ref command,
            } => {
                write!(f, "Command  {} at {}: {}", namespace, optime, command)
            }
            Operation::ApplyOps {
                optime,
                ref namespace,
                ref operations,
            } => {
                write!(
                    f,
                    "ApplyOps {} at {}: {} operations",
                    namespace,
                    optime,
                    operations.len()
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn optime_orders_lexicographically() {
        assert!(Optime::new(100, 5) < Optime::new(100, 6));
        assert!(Optime::new(100, 9) < Optime::new(101, 0));
        assert_eq!(Optime::new(100, 5), Optime::new(100, 5));
        assert!(Optime::zero() < Optime::new(0, 1));
    }

    #[test]
    fn optime_roundtrips_through_bson() {
        let optime = Optime::new(1479561394, 7);
        let ts: bson::Timestamp = optime.into();
        assert_eq!(ts.time, 1479561394);
        assert_eq!(ts.increment, 7);
        assert_eq!(Optime::from(ts), optime);
    }

    #[test]
    fn operation_converts_noops() {
        let doc = doc! {
            "ts" : Bson::Timestamp(bson::Timestamp {
                time: 1479419535 ,
                increment: 0,
            }),
            "v" : 2,
            "op" : "n",
            "ns" : "",
            "o" : {
                "msg" : "initiating set"
            }
        };
        let operation = Operation::new(&doc).unwrap();

        assert_eq!(
            operation,
            Operation::Noop {
                optime: Optime::new(1479419535, 0),
                message: Some("initiating set".into()),
            }
        );
        assert_eq!(operation.namespace(), None);
        assert_eq!(operation.document_id(), None);
    }

    #[test]
    fn operation_converts_inserts() {
        let doc = doc! {
            "ts" : Bson::Timestamp(bson::Timestamp {
                time: 1479561394 ,
                increment:0
            }),
            "v" : 2,
            "op" : "i",
            "ns" : "foo.bar",
            "o" : {
                "_id" : 1,
                "foo" : "bar"
            }
        };
        let operation = Operation::new(&doc).unwrap();

        assert_eq!(
            operation,
            Operation::Insert {
                optime: Optime::new(1479561394, 0),
                namespace: "foo.bar".into(),
                document: doc! { "_id" : 1, "foo" : "bar" },
            }
        );
        assert_eq!(operation.document_id(), Some(&Bson::Int32(1)));
    }

    #[test]
    fn operation_converts_updates() {
        let doc = doc! {
            "ts" : Bson::Timestamp(bson::Timestamp {
                time: 1479561033 ,
                increment: 0,
            }),
            "v" : 2,
            "op" : "u",
            "ns" : "foo.bar",
            "o2" : {
                "_id" : 1
            },
            "o" : {
                "$set" : {
                    "foo" : "baz"
                }
            }
        };
        let operation = Operation::new(&doc).unwrap();

        assert_eq!(
            operation,
            Operation::Update {
                optime: Optime::new(1479561033, 0),
                namespace: "foo.bar".into(),
                query: doc! { "_id" : 1 },
                update: doc! { "$set" : { "foo" : "baz" } },
            }
        );
        assert_eq!(operation.document_id(), Some(&Bson::Int32(1)));
    }

    #[test]
    fn operation_converts_deletes() {
        let doc = doc! {
            "ts" : Bson::Timestamp(bson::Timestamp {
                time: 1479421186 ,
                increment: 0,
            }),
            "v" : 2,
            "op" : "d",
            "ns" : "foo.bar",
            "o" : {
                "_id" : 1
            }
        };
        let operation = Operation::new(&doc).unwrap();

        assert_eq!(
            operation,
            Operation::Delete {
                optime: Optime::new(1479421186, 0),
                namespace: "foo.bar".into(),
                query: doc! { "_id" : 1 },
            }
        );
    }

    #[test]
    fn operation_converts_commands() {
        let doc = doc! {
            "ts" : Bson::Timestamp(bson::Timestamp {
                time: 1479553955 ,
                increment: 0,
            }),
            "v" : 2,
            "op" : "c",
            "ns" : "test.$cmd",
            "o" : {
                "create" : "foo"
            }
        };
        let operation = Operation::new(&doc).unwrap();

        assert_eq!(
            operation,
            Operation::Command {
                optime: Optime::new(1479553955, 0),
                namespace: "test.$cmd".into(),
                command: doc! { "create" : "foo" },
            }
        );
    }

    #[test]
    fn operation_returns_unknown_operations() {
        let doc = doc! { "op" : "x" };
        let operation = Operation::new(&doc);

        match operation {
            Err(Error::UnknownOperation(op)) => assert_eq!(op, "x"),
            _ => panic!("Expected unknown operation."),
        }
    }

    #[test]
    fn operation_returns_missing_fields() {
        use bson::document::ValueAccessError;

        let doc = doc! { "foo" : "bar" };
        let operation = Operation::new(&doc);

        match operation {
            Err(Error::MissingField(err)) => assert_eq!(err, ValueAccessError::NotPresent),
            _ => panic!("Expected missing field."),
        }
    }

    #[test]
    fn operation_returns_apply_ops() {
        let doc = doc! {
            "ts" : Bson::Timestamp(bson::Timestamp {
                time: 1483789052 ,
                increment: 0,
            }),
            "op" : "c",
            "ns" : "foo.$cmd",
            "o" : {
                "applyOps" : [
                    {
                        "ts" : Bson::Timestamp(bson::Timestamp {
                            time: 1479561394 ,
                            increment: 0,
                        }),
                        "t" : 2,
                        "op" : "i",
                        "ns" : "foo.bar",
                        "o" : {
                            "_id" : 1,
                            "foo" : "bar"
                        }
                    }
                ]
            }
        };
        let operation = Operation::new(&doc).unwrap();

        assert_eq!(
            operation,
            Operation::ApplyOps {
                optime: Optime::new(1483789052, 0),
                namespace: "foo.$cmd".into(),
                operations: vec![Operation::Insert {
                    optime: Optime::new(1479561394, 0),
                    namespace: "foo.bar".into(),
                    document: doc! { "_id" : 1, "foo" : "bar" },
                }],
            }
        );
    }
}
