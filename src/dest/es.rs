//! The Elasticsearch destination: the same operation stream expressed as `_bulk` NDJSON
//! actions over HTTP.
//!
//! Inserts and full-document updates become `index` actions, `$set` becomes a partial
//! document update, `$unset` a remove-script per dotted path, deletes become `delete`
//! actions. `dropDatabase` deletes the database's indices. Field projection is applied to
//! full documents before indexing.

use std::time::Duration;

use bson::{Bson, Document};
use mongodb::bson;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::Endpoint;
use crate::dest::DocOp;
use crate::index::IndexSpec;
use crate::oper::Operation;
use crate::project::FieldProjection;
use crate::{Error, Result};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// A writer for an Elasticsearch destination.
#[derive(Clone)]
pub struct EsDest {
    http: reqwest::Client,
    base: String,
    username: Option<String>,
    password: Option<String>,
    projection: FieldProjection,
}

impl EsDest {
    /// Build a client for the cluster at the endpoint's first host (a base URL).
    pub fn connect(endpoint: &Endpoint, projection: FieldProjection) -> Result<EsDest> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        let base = endpoint
            .hosts
            .first()
            .map(|h| h.trim_end_matches('/').to_string())
            .ok_or_else(|| Error::Config("elasticsearch destination host is required".into()))?;

        Ok(EsDest {
            http,
            base,
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
            projection,
        })
    }

    /// Index mirroring does not apply to Elasticsearch; mappings are managed cluster-side.
    pub async fn create_index(&self, ns: &str, spec: &IndexSpec) -> Result<()> {
        debug!(ns, index = spec.name.as_str(), "elasticsearch manages mappings, index skipped");
        Ok(())
    }

    /// Apply an ordered batch of per-document writes as one `_bulk` request.
    pub async fn bulk_write(&self, ns: &str, ops: &[DocOp]) -> Result<()> {
        let index = index_name(ns);
        let mut body = String::new();

        for op in ops {
            for line in self.action_lines(ns, &index, op) {
                body.push_str(&line);
                body.push('\n');
            }
        }
        if body.is_empty() {
            return Ok(());
        }

        let response = self.submit_bulk(body).await?;
        if response.get("errors").and_then(Value::as_bool) == Some(true) {
            for item in response
                .get("items")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let failed = item
                    .as_object()
                    .and_then(|action| action.values().next())
                    .filter(|result| result.get("error").is_some());
                if let Some(result) = failed {
                    warn!(ns, %result, "bulk action rejected, skipped");
                }
            }
        }
        Ok(())
    }

    /// Apply a single oplog operation.
    pub async fn apply_oplog(&self, ns: &str, oper: &Operation) -> Result<()> {
        match oper {
            Operation::Command { namespace, command, .. } => {
                let (db, _) = crate::filter::split_namespace(namespace);
                self.handle_command(db, command).await
            }
            Operation::Noop { .. } | Operation::ApplyOps { .. } => Ok(()),
            _ => match DocOp::from_operation(oper) {
                Some(op) => self.bulk_write(ns, &[op]).await,
                None => Ok(()),
            },
        }
    }

    /// Translate collection lifecycle commands into index lifecycle calls.
    pub async fn handle_command(&self, db: &str, command: &Document) -> Result<()> {
        if command.contains_key("dropDatabase") {
            self.delete_index(&format!("{}.*", db.to_lowercase())).await
        } else if let Ok(coll) = command.get_str("drop") {
            self.delete_index(&index_name(&format!("{}.{}", db, coll)))
                .await
        } else if command.contains_key("create") {
            // Indices are created implicitly on first write.
            Ok(())
        } else {
            warn!(db, %command, "command has no elasticsearch translation, skipped");
            Ok(())
        }
    }

    /// Block until the cluster root answers again, with a fixed back-off. Authentication
    /// failures abort immediately.
    pub async fn reconnect(&self) -> Result<()> {
        let mut attempts = 0u64;
        loop {
            let response = self.request(reqwest::Method::GET, &self.base).send().await;
            match response {
                Ok(r) if r.status().is_success() => {
                    if attempts > 0 {
                        info!(attempts, "elasticsearch connection re-established");
                    }
                    return Ok(());
                }
                Ok(r) if r.status().as_u16() == 401 || r.status().as_u16() == 403 => {
                    return Err(Error::Elasticsearch {
                        status: r.status().as_u16(),
                        body: r.text().await.unwrap_or_default(),
                    });
                }
                _ => {
                    attempts += 1;
                    if attempts % 10 == 1 {
                        warn!(attempts, "waiting for elasticsearch");
                    }
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

    fn action_lines(&self, ns: &str, index: &str, op: &DocOp) -> Vec<String> {
        match op {
            DocOp::Replace { id, document } => {
                let projected = self.projection.apply(ns, document);
                vec![
                    json!({ "index": { "_index": index, "_id": doc_id(id) } }).to_string(),
                    document_to_json(&projected).to_string(),
                ]
            }
            DocOp::Update { id, update } => match translate_update(update) {
                Some(body) => vec![
                    json!({ "update": { "_index": index, "_id": doc_id(id) } }).to_string(),
                    body.to_string(),
                ],
                None => {
                    warn!(ns, id = %id, "update has no elasticsearch translation, skipped");
                    Vec::new()
                }
            },
            DocOp::Delete { id } => {
                vec![json!({ "delete": { "_index": index, "_id": doc_id(id) } }).to_string()]
            }
        }
    }

    async fn submit_bulk(&self, body: String) -> Result<Value> {
        loop {
            let response = self
                .request(reqwest::Method::POST, &format!("{}/_bulk", self.base))
                .header("Content-Type", "application/x-ndjson")
                .body(body.clone())
                .send()
                .await;

            match response {
                Ok(r) if r.status().is_success() => return Ok(r.json().await?),
                Ok(r) => {
                    return Err(Error::Elasticsearch {
                        status: r.status().as_u16(),
                        body: r.text().await.unwrap_or_default(),
                    });
                }
                Err(e) => {
                    let err = Error::from(e);
                    if !err.is_transient() {
                        return Err(err);
                    }
                    warn!(error = %err, "bulk request interrupted, reconnecting");
                    self.reconnect().await?;
                }
            }
        }
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("{}/{}", self.base, index),
            )
            .send()
            .await?;

        // 404 is the "namespace not found" of the index world.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            warn!(
                index,
                status = response.status().as_u16(),
                "index deletion failed, skipped"
            );
        }
        Ok(())
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_ref());
        }
        builder
    }
}

/// The index a namespace is written to. Elasticsearch index names must be lowercase.
pub fn index_name(ns: &str) -> String {
    ns.to_lowercase()
}

/// Render a document `_id` as an Elasticsearch document id.
pub fn doc_id(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        other => other.clone().into_relaxed_extjson().to_string(),
    }
}

/// Translate a modifier document into an update-action body: a partial `doc` for pure
/// `$set`, a painless script when `$unset` is involved. Modifiers with no translation
/// (e.g. `$inc`) yield `None`.
pub fn translate_update(update: &Document) -> Option<Value> {
    let mut sets: Vec<(String, Value)> = Vec::new();
    let mut unsets: Vec<String> = Vec::new();

    for (key, value) in update {
        match key.as_str() {
            "$set" => {
                for (path, v) in value.as_document()? {
                    sets.push((path.clone(), bson_to_json(v)));
                }
            }
            "$unset" => {
                for (path, _) in value.as_document()? {
                    unsets.push(path.clone());
                }
            }
            _ => return None,
        }
    }

    if unsets.is_empty() {
        let mut doc = Map::new();
        for (path, value) in sets {
            insert_json_path(&mut doc, &path, value);
        }
        return Some(json!({ "doc": Value::Object(doc) }));
    }

    let mut statements = Vec::new();
    let mut params = Map::new();
    for (i, (path, value)) in sets.into_iter().enumerate() {
        statements.push(format!("ctx._source.{} = params.p{};", path, i));
        params.insert(format!("p{}", i), value);
    }
    for path in unsets {
        statements.push(match path.rsplit_once('.') {
            Some((parent, leaf)) => format!("ctx._source.{}.remove('{}');", parent, leaf),
            None => format!("ctx._source.remove('{}');", path),
        });
    }

    Some(json!({
        "script": {
            "lang": "painless",
            "source": statements.join(" "),
            "params": Value::Object(params),
        }
    }))
}

/// Rebuild the nesting of a dotted path inside a JSON object.
fn insert_json_path(object: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            object.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = object
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(inner) = entry {
                insert_json_path(inner, rest, value);
            }
        }
    }
}

/// Convert a BSON document to the JSON document indexed at the destination.
pub fn document_to_json(document: &Document) -> Value {
    let mut object = Map::new();
    for (key, value) in document {
        object.insert(key.clone(), bson_to_json(value));
    }
    Value::Object(object)
}

fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Double(f) => json!(f),
        Bson::String(s) => json!(s),
        Bson::Boolean(b) => json!(b),
        Bson::Null => Value::Null,
        Bson::Int32(i) => json!(i),
        Bson::Int64(i) => json!(i),
        Bson::ObjectId(oid) => json!(oid.to_hex()),
        Bson::DateTime(dt) => json!(dt.try_to_rfc3339_string().unwrap_or_default()),
        Bson::Document(doc) => document_to_json(doc),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        other => other.clone().into_relaxed_extjson(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};

    #[test]
    fn index_names_are_lowercased_namespaces() {
        assert_eq!(index_name("Db.Coll"), "db.coll");
    }

    #[test]
    fn object_ids_render_as_hex() {
        let oid = ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap();
        assert_eq!(doc_id(&Bson::ObjectId(oid)), "507f1f77bcf86cd799439011");
        assert_eq!(doc_id(&Bson::Int32(42)), "42");
        assert_eq!(doc_id(&Bson::String("k".into())), "k");
    }

    #[test]
    fn pure_set_becomes_a_partial_doc() {
        let body = translate_update(&doc! { "$set": { "a": 1, "b.c": 2 } }).unwrap();

        assert_eq!(body, json!({ "doc": { "a": 1, "b": { "c": 2 } } }));
    }

    #[test]
    fn unset_becomes_a_remove_script() {
        let body = translate_update(&doc! { "$unset": { "a": 1, "b.c": 1 } }).unwrap();
        let source = body["script"]["source"].as_str().unwrap();

        assert!(source.contains("ctx._source.remove('a');"));
        assert!(source.contains("ctx._source.b.remove('c');"));
    }

    #[test]
    fn mixed_set_and_unset_share_one_script() {
        let body = translate_update(&doc! { "$set": { "a": 5 }, "$unset": { "b": 1 } }).unwrap();
        let source = body["script"]["source"].as_str().unwrap();

        assert!(source.contains("ctx._source.a = params.p0;"));
        assert!(source.contains("ctx._source.remove('b');"));
        assert_eq!(body["script"]["params"]["p0"], json!(5));
    }

    #[test]
    fn untranslatable_modifiers_yield_none() {
        assert!(translate_update(&doc! { "$inc": { "a": 1 } }).is_none());
    }

    #[test]
    fn documents_convert_to_plain_json() {
        let oid = ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap();
        let value = document_to_json(&doc! {
            "_id": oid,
            "n": 3,
            "nested": { "x": [1, 2] },
        });

        assert_eq!(
            value,
            json!({
                "_id": "507f1f77bcf86cd799439011",
                "n": 3,
                "nested": { "x": [1, 2] },
            })
        );
    }
}
