//! Decides which databases, collections and oplog entries are in scope, and rewrites source
//! namespaces to destination namespaces through an optional database rename table.
//!
//! An empty include set means "sync everything" (minus the fixed ignore lists). A namespace is
//! admitted when the include set contains either the exact `db.coll` entry or the `db.*`
//! wildcard for its database. Commands carry no collection, so they are admitted by membership
//! of their database in the set of related databases.

use std::collections::{HashMap, HashSet};

use crate::oper::Operation;

/// Databases that are never replicated.
pub const IGNORE_DBS: [&str; 3] = ["admin", "local", "config"];

/// Collections that are never replicated, in any database.
pub const IGNORE_COLLS: [&str; 3] = ["system.users", "system.profile", "system.indexes"];

/// Splits a dot-separated namespace into its database and collection components.
pub fn split_namespace(ns: &str) -> (&str, &str) {
    match ns.find('.') {
        Some(pos) => (&ns[..pos], &ns[pos + 1..]),
        None => (ns, ""),
    }
}

/// An include-set of namespaces with `db.*` wildcard support plus a database rename table.
#[derive(Clone, Debug, Default)]
pub struct DataFilter {
    /// Exact `db.coll` entries and `db.*` wildcards.
    include: HashSet<String>,
    /// The databases the include entries project onto.
    related_dbs: HashSet<String>,
    /// Source database name to destination database name.
    rename: HashMap<String, String>,
}

impl DataFilter {
    /// Creates a filter that admits everything outside the ignore lists.
    pub fn new() -> DataFilter {
        DataFilter::default()
    }

    /// Add a namespace to the include set. The collection component may be `*` to include the
    /// whole database.
    pub fn add_include(&mut self, db: &str, coll: &str) {
        self.include.insert(format!("{}.{}", db, coll));
        self.related_dbs.insert(db.to_string());
    }

    /// Record that `src_db` is written under `dst_db` at the destination.
    pub fn add_rename(&mut self, src_db: &str, dst_db: &str) {
        self.rename.insert(src_db.to_string(), dst_db.to_string());
    }

    /// Whether no include entries were configured, i.e. the "sync everything" case.
    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
    }

    /// Whether a database is in scope.
    pub fn valid_db(&self, db: &str) -> bool {
        if IGNORE_DBS.contains(&db) {
            return false;
        }
        self.include.is_empty() || self.related_dbs.contains(db)
    }

    /// Whether a fully-qualified namespace is in scope.
    pub fn valid_ns(&self, ns: &str) -> bool {
        let (db, coll) = split_namespace(ns);
        if IGNORE_DBS.contains(&db) || IGNORE_COLLS.contains(&coll) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.contains(ns) || self.include.contains(&format!("{}.*", db))
    }

    /// Whether an oplog operation is in scope. No-ops are dropped, commands are admitted by
    /// database membership, inserts/updates/deletes by namespace membership.
    pub fn valid_oplog(&self, oper: &Operation) -> bool {
        match oper {
            Operation::Noop { .. } => false,
            Operation::Command { namespace, .. } | Operation::ApplyOps { namespace, .. } => {
                let (db, _) = split_namespace(namespace);
                self.valid_db(db)
            }
            _ => match oper.namespace() {
                Some(ns) => self.valid_ns(ns),
                None => false,
            },
        }
    }

    /// The destination database a source database is written under. Identity when no rename
    /// is configured.
    pub fn map_db<'a>(&'a self, db: &'a str) -> &'a str {
        match self.rename.get(db) {
            Some(renamed) => renamed.as_str(),
            None => db,
        }
    }

    /// The destination namespace a source namespace is written under.
    pub fn map_ns(&self, ns: &str) -> String {
        let (db, coll) = split_namespace(ns);
        format!("{}.{}", self.map_db(db), coll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oper::Optime;
    use mongodb::bson::doc;

    fn insert(ns: &str) -> Operation {
        Operation::Insert {
            optime: Optime::new(1, 0),
            namespace: ns.into(),
            document: doc! { "_id": 1 },
        }
    }

    fn command(ns: &str) -> Operation {
        Operation::Command {
            optime: Optime::new(1, 0),
            namespace: ns.into(),
            command: doc! { "create": "coll1" },
        }
    }

    #[test]
    fn empty_filter_admits_everything_but_ignored() {
        let filter = DataFilter::new();

        assert!(filter.valid_db("db"));
        assert!(filter.valid_ns("db.coll"));
        assert!(!filter.valid_db("admin"));
        assert!(!filter.valid_db("local"));
        assert!(!filter.valid_db("config"));
        assert!(!filter.valid_ns("db.system.profile"));
        assert!(!filter.valid_ns("db.system.users"));
        assert!(!filter.valid_ns("db.system.indexes"));
    }

    #[test]
    fn collection_filter_admits_exact_namespaces() {
        let mut filter = DataFilter::new();
        filter.add_include("db", "coll");

        assert!(filter.valid_ns("db.coll"));
        assert!(!filter.valid_ns("db.coll1"));
        assert!(!filter.valid_ns("db1.coll"));
        assert!(!filter.valid_ns("db1.coll1"));
    }

    #[test]
    fn wildcard_admits_whole_database() {
        let mut filter = DataFilter::new();
        filter.add_include("db", "*");

        assert!(filter.valid_ns("db.coll"));
        assert!(filter.valid_ns("db.other"));
        assert!(!filter.valid_ns("db1.coll"));
    }

    #[test]
    fn oplog_admission_follows_the_original_table() {
        let mut filter = DataFilter::new();
        filter.add_include("db", "coll");

        assert!(filter.valid_oplog(&insert("db.coll")));
        assert!(!filter.valid_oplog(&insert("db.coll1")));
        assert!(!filter.valid_oplog(&insert("db1.coll")));
        // Commands have no collection of their own and ride on database membership.
        assert!(filter.valid_oplog(&command("db.$cmd")));
        assert!(!filter.valid_oplog(&command("db1.$cmd")));
    }

    #[test]
    fn noops_are_dropped() {
        let filter = DataFilter::new();
        let noop = Operation::Noop {
            optime: Optime::new(1, 0),
            message: None,
        };

        assert!(!filter.valid_oplog(&noop));
    }

    #[test]
    fn rename_maps_database_component_only() {
        let mut filter = DataFilter::new();
        filter.add_rename("a", "b");

        assert_eq!(filter.map_db("a"), "b");
        assert_eq!(filter.map_db("c"), "c");
        assert_eq!(filter.map_ns("a.x"), "b.x");
        assert_eq!(filter.map_ns("c.x"), "c.x");
    }

    #[test]
    fn split_namespace_handles_dotted_collections() {
        assert_eq!(split_namespace("db.coll"), ("db", "coll"));
        assert_eq!(split_namespace("db.system.profile"), ("db", "system.profile"));
        assert_eq!(split_namespace("db"), ("db", ""));
    }
}
