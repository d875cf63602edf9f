//! A tailing stream over a replica set's `local.oplog.rs` collection.
//!
//! The cursor is opened in tailable-await mode with a bounded await time so a consumer can
//! observe idle periods (and flush pending work) instead of blocking indefinitely on a quiet
//! source.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bson::{doc, Bson, Document};
use futures::ready;
use futures::Stream;
use mongodb::options::{CursorType, FindOptions};
use mongodb::{bson, Client, Cursor};

use crate::oper::{Operation, Optime};
use crate::Result;

/// Oplog represents a tail over a MongoDB replica set oplog.
///
/// It implements the `Stream` trait so it can be iterated over, yielding successive
/// `Operation`s as they are read from the server. This will effectively iterate forever as it
/// will await new operations.
///
/// Any errors raised while tailing the oplog (e.g. a connectivity issue) will cause the
/// iteration to end.
pub struct Oplog {
    /// The internal MongoDB cursor for the current position in the oplog.
    cursor: Cursor<bson::Document>,
}

impl Oplog {
    /// Creates an instance with default options, yielding every operation in the oplog.
    pub async fn new(client: &Client) -> Result<Oplog> {
        OplogBuilder::new().build(client).await
    }

    /// Builder to configure the Oplog.
    pub fn builder() -> OplogBuilder {
        OplogBuilder::new()
    }
}

impl Stream for Oplog {
    type Item = Result<Operation>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(res) = ready!(Pin::new(&mut this.cursor).poll_next(cx)) {
            match res {
                Ok(v) => match Operation::new(&v) {
                    Ok(o) => Some(Ok(o)).into(),
                    Err(e) => Some(Err(e)).into(),
                },
                Err(e) => Some(Err(e.into())).into(),
            }
        } else {
            // Underlying cursor is over. This probably indicates that the oplog.rs collection
            // is empty. See https://jira.mongodb.org/browse/SERVER-13955
            None.into()
        }
    }
}

/// A builder for an `Oplog`.
///
/// This builder enables configuring a start position and an additional filter on the oplog so
/// that only operations matching a given criteria are returned.
#[derive(Clone)]
pub struct OplogBuilder {
    start: Option<Optime>,
    filter: Option<Document>,
    batch_size: Option<u32>,
    await_time: Duration,
}

impl OplogBuilder {
    pub(crate) fn new() -> OplogBuilder {
        OplogBuilder {
            start: None,
            filter: None,
            batch_size: None,
            await_time: Duration::from_secs(1),
        }
    }

    /// Tail from the first entry whose timestamp is greater than or equal to `start`.
    ///
    /// The caller is responsible for validating that the first yielded entry carries exactly
    /// this optime; anything later means the oplog has rolled past the requested position.
    pub fn start(mut self, start: Optime) -> Self {
        self.start = Some(start);
        self
    }

    /// Provide an optional filter for the oplog.
    ///
    /// This is empty by default so all operations are returned.
    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set `batch_size` option on the underlying mongodb cursor.
    ///
    /// Default this is not set and falls back on whatever the default is.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Bound how long the server holds an exhausted await-cursor open before returning an
    /// empty batch. Defaults to one second.
    pub fn await_time(mut self, await_time: Duration) -> Self {
        self.await_time = await_time;
        self
    }

    /// Executes the query and builds the `Oplog` over the client provided.
    pub async fn build(self, client: &Client) -> Result<Oplog> {
        let coll = client.database("local").collection("oplog.rs");

        let mut filter = self.filter.unwrap_or_default();
        if let Some(start) = self.start {
            filter.insert("ts", doc! { "$gte": Bson::from(start) });
        }

        let opts = FindOptions::builder()
            .no_cursor_timeout(true)
            .cursor_type(CursorType::TailableAwait)
            .max_await_time(self.await_time)
            .batch_size(self.batch_size)
            .build();

        let cursor = coll.find(filter, opts).await?;

        Ok(Oplog { cursor })
    }
}
