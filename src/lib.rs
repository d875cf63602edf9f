#![warn(missing_docs)]

//! One-way replication from a MongoDB replica set to a MongoDB cluster or an Elasticsearch
//! cluster.
//!
//! The engine works in two phases. An initial bulk copy reproduces the selected databases
//! and collections at the destination, splitting large collections at `_id` boundaries for
//! parallel workers. A tailing phase then follows the source oplog from a timestamp captured
//! before the copy began, grouping contiguous entries per namespace and replaying them as
//! idempotent bulk writes, so the destination converges toward the source in near real time.
//! The position of the last acknowledged entry is checkpointed to a small file and the tail
//! resumes from it after a restart.
//!
//! # Example
//!
//! The lowest layer is a tailing `Stream` over the oplog, usable on its own:
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use mongodb::Client;
//! use mongosync::Oplog;
//!
//! # async fn run() -> Result<(), mongosync::Error> {
//! let client = Client::with_uri_str("mongodb://localhost").await?;
//!
//! let mut oplog = Oplog::new(&client).await?;
//!
//! while let Some(res) = oplog.next().await {
//!     let oper = res?;
//!     println!("{}", oper);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The full engine is driven through a [`config::SyncConf`] and a [`sync::Synchronizer`];
//! the `mongosync` binary is a thin wrapper over those, and `mongocheck` compares document
//! counts and canonical index signatures between two clusters after the fact.

pub use oper::{Operation, Optime};
pub use oplog::{Oplog, OplogBuilder};

pub use mongodb;
pub use mongodb::bson;

pub mod checkpoint;
pub mod config;
pub mod copy;
pub mod dest;
mod error;
pub mod filter;
pub mod index;
mod oper;
mod oplog;
pub mod progress;
pub mod project;
pub mod replay;
pub mod source;
pub mod sync;

pub use error::{Error, Result};
