//! The consistency check tool: compare per-collection document counts and canonical index
//! signatures between two clusters, printing one OK/ERR row per item.
//!
//! Index comparison works on the canonical signature derived from each index's key list, so
//! clusters agree even when operators chose different index names. Exits 0 iff every row
//! is OK.

use std::collections::BTreeSet;
use std::process;

use clap::Parser;
use mongosync::bson::{doc, Bson};
use mongosync::filter::{IGNORE_COLLS, IGNORE_DBS};
use mongosync::index::standard_name;
use mongosync::mongodb::Client;
use mongosync::Result;

#[derive(Debug, Parser)]
#[command(
    name = "mongocheck",
    version,
    about = "Compare document counts and index signatures between two MongoDB clusters."
)]
struct Args {
    /// Connection URI of the cluster that was copied from.
    #[arg(long, value_name = "URI")]
    origin: String,

    /// Connection URI of the cluster that was copied to.
    #[arg(long, value_name = "URI")]
    target: String,

    /// Databases to check; all origin databases when empty.
    #[arg(long, num_args = 1.., value_name = "DB", conflicts_with_all = ["src_db", "dst_db"])]
    dbs: Vec<String>,

    /// Check a single origin database under a different target name.
    #[arg(long, value_name = "NAME", requires = "dst_db")]
    src_db: Option<String>,

    /// Target name for --src-db.
    #[arg(long, value_name = "NAME", requires = "src_db")]
    dst_db: Option<String>,
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(passed) => process::exit(if passed { 0 } else { 1 }),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

async fn run() -> Result<bool> {
    let args = Args::parse();

    println!("{}", "=".repeat(48));
    println!("origin :  {}", args.origin);
    println!("target :  {}", args.target);
    println!("dbs    :  {:?}", args.dbs);
    if let (Some(src_db), Some(dst_db)) = (&args.src_db, &args.dst_db) {
        println!("rename :  {} -> {}", src_db, dst_db);
    }
    println!("{}", "=".repeat(48));

    let origin = Client::with_uri_str(&args.origin).await?;
    let target = Client::with_uri_str(&args.target).await?;

    let dbs: Vec<String> = match &args.src_db {
        Some(src_db) => vec![src_db.clone()],
        None if !args.dbs.is_empty() => args.dbs.clone(),
        None => origin
            .list_database_names(None, None)
            .await?
            .into_iter()
            .filter(|db| !IGNORE_DBS.contains(&db.as_str()))
            .collect(),
    };

    let mut data_pass = true;
    println!("{}", "-".repeat(88));
    println!(
        "{:<8}{:<48}{:>16}{:>16}",
        "RESULT", "COLL", "ORIGIN", "TARGET"
    );
    println!("{}", "-".repeat(88));

    for db in sorted(&dbs) {
        let target_db = mapped_db(&args, &db);
        for coll in collections(&origin, &db).await? {
            let src_count = count(&origin, &db, &coll).await?;
            let dst_count = count(&target, &target_db, &coll).await?;
            let ok = src_count == dst_count;
            data_pass &= ok;
            println!(
                "{:<8}{:<48}{:>16}{:>16}",
                if ok { "OK" } else { "ERR" },
                format!("{}.{}", db, coll),
                src_count,
                dst_count
            );
        }
    }
    println!("{}", "-".repeat(88));

    let mut index_pass = true;
    println!("{}", "-".repeat(120));
    println!("{:<8}{:<48}{:>64}", "RESULT", "COLL", "INDEX");
    println!("{}", "-".repeat(120));

    for db in sorted(&dbs) {
        let target_db = mapped_db(&args, &db);
        for coll in collections(&origin, &db).await? {
            let src_signatures = index_signatures(&origin, &db, &coll).await?;
            let dst_signatures = index_signatures(&target, &target_db, &coll).await?;
            for signature in &src_signatures {
                let ok = dst_signatures.contains(signature);
                index_pass &= ok;
                println!(
                    "{:<8}{:<48}{:>64}",
                    if ok { "OK" } else { "ERR" },
                    format!("{}.{}", db, coll),
                    signature
                );
            }
        }
    }
    println!("{}", "-".repeat(120));

    println!("data : {}", if data_pass { "SUCCESS" } else { "FAILED" });
    println!("index: {}", if index_pass { "SUCCESS" } else { "FAILED" });

    Ok(data_pass && index_pass)
}

fn sorted(dbs: &[String]) -> Vec<String> {
    let mut dbs = dbs.to_vec();
    dbs.sort();
    dbs
}

fn mapped_db(args: &Args, db: &str) -> String {
    match (&args.src_db, &args.dst_db) {
        (Some(src_db), Some(dst_db)) if src_db == db => dst_db.clone(),
        _ => db.to_string(),
    }
}

async fn collections(client: &Client, db: &str) -> Result<Vec<String>> {
    let mut colls: Vec<String> = client
        .database(db)
        .list_collection_names(None)
        .await?
        .into_iter()
        .filter(|coll| !IGNORE_COLLS.contains(&coll.as_str()))
        .collect();
    colls.sort();
    Ok(colls)
}

async fn count(client: &Client, db: &str, coll: &str) -> Result<u64> {
    Ok(client
        .database(db)
        .collection::<mongosync::bson::Document>(coll)
        .estimated_document_count(None)
        .await?)
}

async fn index_signatures(client: &Client, db: &str, coll: &str) -> Result<BTreeSet<String>> {
    let database = client.database(db);
    let response = database
        .run_command(doc! { "listIndexes": coll }, None)
        .await;

    // A collection absent from the target still gets a row, with no signatures to match.
    let response = match response {
        Ok(response) => response,
        Err(_) => return Ok(BTreeSet::new()),
    };

    let mut signatures = BTreeSet::new();
    let cursor = response.get_document("cursor")?;
    for index in cursor
        .get_array("firstBatch")?
        .iter()
        .filter_map(Bson::as_document)
    {
        signatures.insert(standard_name(index.get_document("key")?)?);
    }
    Ok(signatures)
}
