//! Configuration: the TOML file model, command-line overrides and the effective runtime
//! configuration assembled from both. Command-line flags take precedence over file values.
//!
//! All validation happens here, before any network activity; a bad configuration is a
//! `Error::Config` and the process exits without touching either cluster.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::filter::DataFilter;
use crate::oper::Optime;
use crate::project::FieldProjection;
use crate::{Error, Result};

/// Default number of parallel workers for bulk copy and group partitioning.
pub const DEFAULT_WORKERS: usize = 8;

/// Collections with more documents than this are split into parallel key ranges.
pub const DEFAULT_LARGE_THRESHOLD: u64 = 1_000_000;

/// The destination flavor.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DstType {
    /// A MongoDB standalone, replica set or sharded cluster.
    Mongo,
    /// An Elasticsearch cluster.
    Es,
}

impl Default for DstType {
    fn default() -> DstType {
        DstType::Mongo
    }
}

/// The `[src]` and `[dst]` endpoint tables.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct EndpointSection {
    /// `host:port` members, or the base URL for an Elasticsearch destination.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Database to authenticate against, `admin` if unset.
    pub authdb: Option<String>,
    /// Username, for authenticated clusters.
    pub username: Option<String>,
    /// Password, for authenticated clusters.
    pub password: Option<String>,
    /// Destination flavor discriminator; only meaningful in `[dst]`.
    #[serde(rename = "type", default)]
    pub kind: DstType,
}

/// One collection entry under a `[sync] dbs` table.
#[derive(Clone, Debug, Deserialize)]
pub struct CollSpec {
    /// Collection name, or `*` for every collection in the database.
    pub coll: String,
    /// Dotted field paths to project (Elasticsearch targets only).
    pub fields: Option<Vec<String>>,
}

/// One database entry under `[sync] dbs`.
#[derive(Clone, Debug, Deserialize)]
pub struct DbSpec {
    /// Source database name.
    pub db: String,
    /// Name the database is written under at the destination.
    pub rename_db: Option<String>,
    /// Collections to include; empty means the whole database.
    #[serde(default)]
    pub colls: Vec<CollSpec>,
}

/// The `[sync]` table.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SyncSection {
    /// Start timestamp in integer seconds; the counter snaps forward to the first real entry.
    pub start_optime: Option<u32>,
    /// Databases and collections in scope; empty means everything.
    #[serde(default)]
    pub dbs: Vec<DbSpec>,
}

/// The `[log]` table.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogSection {
    /// Log file path; stdout when unset.
    pub filepath: Option<String>,
    /// Checkpoint file path.
    pub optime_filepath: Option<String>,
}

/// The parsed configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FileConfig {
    /// Source endpoint.
    #[serde(default)]
    pub src: EndpointSection,
    /// Destination endpoint.
    #[serde(default)]
    pub dst: EndpointSection,
    /// Sync scope and start position.
    #[serde(default)]
    pub sync: SyncSection,
    /// Log and checkpoint paths.
    #[serde(default)]
    pub log: LogSection,
}

impl FileConfig {
    /// Load and parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<FileConfig> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        FileConfig::parse(&text)
    }

    /// Parse configuration from TOML text.
    pub fn parse(text: &str) -> Result<FileConfig> {
        let config: FileConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for db in &self.sync.dbs {
            if db.db.is_empty() {
                return Err(Error::Config("empty database name in [sync] dbs".into()));
            }
            if !seen.insert(db.db.clone()) {
                return Err(Error::Config(format!(
                    "database {} listed more than once",
                    db.db
                )));
            }
            for coll in &db.colls {
                if coll.coll == "*" && coll.fields.is_some() {
                    return Err(Error::Config(format!(
                        "{}: `coll = \"*\"` and `fields` are mutually exclusive",
                        db.db
                    )));
                }
                if coll.coll.is_empty() {
                    return Err(Error::Config(format!(
                        "empty collection name under database {}",
                        db.db
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Command-line values that override the file. All fields optional; `None` defers to the
/// file (and the file's absence to the defaults).
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    /// `--src HOSTPORT`.
    pub src: Option<String>,
    /// `--src-authdb`.
    pub src_authdb: Option<String>,
    /// `--src-username`.
    pub src_username: Option<String>,
    /// `--src-password`.
    pub src_password: Option<String>,
    /// `--dst HOSTPORT`.
    pub dst: Option<String>,
    /// `--dst-authdb`.
    pub dst_authdb: Option<String>,
    /// `--dst-username`.
    pub dst_username: Option<String>,
    /// `--dst-password`.
    pub dst_password: Option<String>,
    /// `--start-optime SECONDS`.
    pub start_optime: Option<u32>,
    /// `--optime-logfile PATH`.
    pub optime_logfile: Option<String>,
    /// `--logfile PATH`.
    pub logfile: Option<String>,
}

/// A resolved endpoint: hosts plus credentials.
#[derive(Clone, Debug)]
pub struct Endpoint {
    /// `host:port` members, or the base URL for Elasticsearch.
    pub hosts: Vec<String>,
    /// Authentication database.
    pub authdb: String,
    /// Username, if authentication is configured.
    pub username: Option<String>,
    /// Password, if authentication is configured.
    pub password: Option<String>,
}

impl Endpoint {
    fn resolve(
        section: &EndpointSection,
        host: Option<String>,
        authdb: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Endpoint {
        Endpoint {
            hosts: match host {
                Some(host) => vec![host],
                None => section.hosts.clone(),
            },
            authdb: authdb
                .or_else(|| section.authdb.clone())
                .unwrap_or_else(|| "admin".to_string()),
            username: username.or_else(|| section.username.clone()),
            password: password.or_else(|| section.password.clone()),
        }
    }
}

/// The effective configuration the engine runs with.
#[derive(Clone, Debug)]
pub struct SyncConf {
    /// Source endpoint; must be a member of a replica set.
    pub src: Endpoint,
    /// Destination endpoint.
    pub dst: Endpoint,
    /// Destination flavor.
    pub dst_type: DstType,
    /// Explicit start position, seconds precision.
    pub start_optime: Option<Optime>,
    /// Checkpoint file path, if checkpointing is enabled.
    pub optime_logfile: Option<PathBuf>,
    /// Log file path; stdout when unset.
    pub logfile: Option<PathBuf>,
    /// Namespace scope and rename table.
    pub filter: DataFilter,
    /// Field projections for Elasticsearch targets.
    pub projection: FieldProjection,
    /// Parallel worker count for bulk copy and replay partitioning.
    pub workers: usize,
    /// Document-count threshold for the large-collection path.
    pub large_threshold: u64,
}

impl SyncConf {
    /// Merge an optional configuration file with command-line overrides into the effective
    /// configuration, validating the result.
    pub fn assemble(file: Option<FileConfig>, overrides: Overrides) -> Result<SyncConf> {
        let file = file.unwrap_or_default();

        let src = Endpoint::resolve(
            &file.src,
            overrides.src,
            overrides.src_authdb,
            overrides.src_username,
            overrides.src_password,
        );
        let dst = Endpoint::resolve(
            &file.dst,
            overrides.dst,
            overrides.dst_authdb,
            overrides.dst_username,
            overrides.dst_password,
        );

        if src.hosts.is_empty() {
            return Err(Error::Config("source host is required".into()));
        }
        if dst.hosts.is_empty() {
            return Err(Error::Config("destination host is required".into()));
        }
        for host in &src.hosts {
            validate_hostport(host)?;
        }
        if file.dst.kind == DstType::Mongo {
            for host in &dst.hosts {
                validate_hostport(host)?;
            }
        }

        let mut filter = DataFilter::new();
        let mut projection = FieldProjection::new();
        for db in &file.sync.dbs {
            if let Some(renamed) = &db.rename_db {
                filter.add_rename(&db.db, renamed);
            }
            if db.colls.is_empty() {
                filter.add_include(&db.db, "*");
            }
            // Projections are keyed by destination namespace, the name the writer sees.
            let dst_db = db.rename_db.as_deref().unwrap_or(&db.db);
            for coll in &db.colls {
                filter.add_include(&db.db, &coll.coll);
                if let Some(fields) = &coll.fields {
                    projection.add(&format!("{}.{}", dst_db, coll.coll), fields.clone());
                }
            }
        }

        let start_optime = overrides
            .start_optime
            .or(file.sync.start_optime)
            .map(|seconds| Optime::new(seconds, 0));

        let optime_logfile = overrides
            .optime_logfile
            .or(file.log.optime_filepath)
            .map(PathBuf::from);
        let logfile = overrides
            .logfile
            .or(file.log.filepath)
            .map(PathBuf::from);

        Ok(SyncConf {
            src,
            dst,
            dst_type: file.dst.kind,
            start_optime,
            optime_logfile,
            logfile,
            filter,
            projection,
            workers: DEFAULT_WORKERS,
            large_threshold: DEFAULT_LARGE_THRESHOLD,
        })
    }
}

fn validate_hostport(hostport: &str) -> Result<()> {
    let valid = match hostport.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "invalid host:port address: {}",
            hostport
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [src]
        hosts = ["127.0.0.1:27017"]
        authdb = "admin"
        username = "sync"
        password = "secret"

        [dst]
        type = "mongo"
        hosts = ["127.0.0.1:27018"]

        [sync]
        start_optime = 1479561394
        dbs = [
            { db = "a", rename_db = "b", colls = [ { coll = "x" } ] },
            { db = "c" },
        ]

        [log]
        filepath = "sync.log"
        optime_filepath = "optime.bin"
    "#;

    #[test]
    fn parses_the_documented_layout() {
        let config = FileConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.src.hosts, vec!["127.0.0.1:27017"]);
        assert_eq!(config.dst.kind, DstType::Mongo);
        assert_eq!(config.sync.start_optime, Some(1479561394));
        assert_eq!(config.sync.dbs.len(), 2);
        assert_eq!(config.sync.dbs[0].rename_db.as_deref(), Some("b"));
        assert_eq!(config.log.filepath.as_deref(), Some("sync.log"));
    }

    #[test]
    fn wildcard_and_fields_are_mutually_exclusive() {
        let text = r#"
            [sync]
            dbs = [ { db = "a", colls = [ { coll = "*", fields = ["x"] } ] } ]
        "#;

        match FileConfig::parse(text) {
            Err(Error::Config(msg)) => assert!(msg.contains("mutually exclusive")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_databases_are_rejected() {
        let text = r#"
            [sync]
            dbs = [ { db = "a" }, { db = "a" } ]
        "#;

        assert!(FileConfig::parse(text).is_err());
    }

    #[test]
    fn cli_overrides_win_over_the_file() {
        let file = FileConfig::parse(SAMPLE).unwrap();
        let overrides = Overrides {
            src: Some("10.0.0.1:27017".to_string()),
            start_optime: Some(42),
            ..Overrides::default()
        };

        let conf = SyncConf::assemble(Some(file), overrides).unwrap();

        assert_eq!(conf.src.hosts, vec!["10.0.0.1:27017"]);
        assert_eq!(conf.src.username.as_deref(), Some("sync"));
        assert_eq!(conf.start_optime, Some(Optime::new(42, 0)));
    }

    #[test]
    fn filter_and_projection_are_assembled_from_dbs() {
        let text = r#"
            [src]
            hosts = ["127.0.0.1:27017"]
            [dst]
            type = "es"
            hosts = ["http://127.0.0.1:9200"]
            [sync]
            dbs = [ { db = "a", colls = [ { coll = "x", fields = ["f", "g.h"] } ] } ]
        "#;
        let conf = SyncConf::assemble(Some(FileConfig::parse(text).unwrap()), Overrides::default())
            .unwrap();

        assert!(conf.filter.valid_ns("a.x"));
        assert!(!conf.filter.valid_ns("a.y"));
        assert_eq!(
            conf.projection.get("a.x"),
            Some(&["f".to_string(), "g.h".to_string()][..])
        );
    }

    #[test]
    fn projections_are_keyed_by_the_renamed_namespace() {
        let text = r#"
            [src]
            hosts = ["127.0.0.1:27017"]
            [dst]
            type = "es"
            hosts = ["http://127.0.0.1:9200"]
            [sync]
            dbs = [ { db = "a", rename_db = "b", colls = [ { coll = "x", fields = ["f"] } ] } ]
        "#;
        let conf = SyncConf::assemble(Some(FileConfig::parse(text).unwrap()), Overrides::default())
            .unwrap();

        assert!(conf.projection.get("a.x").is_none());
        assert_eq!(conf.projection.get("b.x"), Some(&["f".to_string()][..]));
        assert_eq!(conf.filter.map_ns("a.x"), "b.x");
    }

    #[test]
    fn database_without_colls_becomes_a_wildcard() {
        let text = r#"
            [src]
            hosts = ["127.0.0.1:27017"]
            [dst]
            hosts = ["127.0.0.1:27018"]
            [sync]
            dbs = [ { db = "a" } ]
        "#;
        let conf = SyncConf::assemble(Some(FileConfig::parse(text).unwrap()), Overrides::default())
            .unwrap();

        assert!(conf.filter.valid_ns("a.anything"));
        assert!(!conf.filter.valid_ns("b.anything"));
    }

    #[test]
    fn missing_source_is_a_config_error() {
        let result = SyncConf::assemble(None, Overrides::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn bad_hostport_is_rejected() {
        let overrides = Overrides {
            src: Some("nonsense".to_string()),
            dst: Some("127.0.0.1:27018".to_string()),
            ..Overrides::default()
        };
        assert!(matches!(
            SyncConf::assemble(None, overrides),
            Err(Error::Config(_))
        ));
    }
}
