//! Per-namespace field projection, applied to documents bound for an Elasticsearch
//! destination. Paths are dotted (`a.b.c`) and the projected document reconstructs the
//! nesting of the source document for each selected path. `_id` is always carried.

use std::collections::HashMap;

use bson::{Bson, Document};
use mongodb::bson;

/// A map from destination namespace to the set of dotted field paths to keep.
#[derive(Clone, Debug, Default)]
pub struct FieldProjection {
    fields: HashMap<String, Vec<String>>,
}

impl FieldProjection {
    /// Creates an empty projection map; namespaces without an entry are passed through whole.
    pub fn new() -> FieldProjection {
        FieldProjection::default()
    }

    /// Register the field paths to keep for a namespace.
    pub fn add(&mut self, ns: &str, paths: Vec<String>) {
        self.fields.insert(ns.to_string(), paths);
    }

    /// The registered paths for a namespace, if any.
    pub fn get(&self, ns: &str) -> Option<&[String]> {
        self.fields.get(ns).map(|v| v.as_slice())
    }

    /// Project a document onto the paths registered for `ns`. Documents of namespaces with no
    /// registered paths are returned unchanged.
    pub fn apply(&self, ns: &str, document: &Document) -> Document {
        match self.get(ns) {
            Some(paths) => project(document, paths),
            None => document.clone(),
        }
    }
}

/// Build a new document holding only the given dotted paths of `document`, preserving
/// nesting. Paths that do not resolve are omitted.
pub fn project(document: &Document, paths: &[String]) -> Document {
    let mut out = Document::new();

    if let Some(id) = document.get("_id") {
        out.insert("_id", id.clone());
    }
    for path in paths {
        if let Some(value) = lookup(document, path) {
            insert_path(&mut out, path, value.clone());
        }
    }
    out
}

/// Resolve a dotted path against nested documents.
fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current = document;
    let mut parts = path.split('.').peekable();

    while let Some(part) = parts.next() {
        let value = current.get(part)?;
        if parts.peek().is_none() {
            return Some(value);
        }
        current = value.as_document()?;
    }
    None
}

/// Insert a value at a dotted path, creating intermediate documents as needed.
fn insert_path(document: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
        }
        Some((head, rest)) => {
            let entry = document
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            if let Bson::Document(inner) = entry {
                insert_path(inner, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn projects_top_level_fields() {
        let doc = doc! { "_id": 1, "a": 2, "b": 3 };
        let out = project(&doc, &["a".to_string()]);

        assert_eq!(out, doc! { "_id": 1, "a": 2 });
    }

    #[test]
    fn projects_nested_paths_with_reconstruction() {
        let doc = doc! { "_id": 1, "a": { "b": { "c": 7, "d": 8 }, "e": 9 }, "f": 10 };
        let out = project(&doc, &["a.b.c".to_string(), "a.e".to_string()]);

        assert_eq!(out, doc! { "_id": 1, "a": { "b": { "c": 7 }, "e": 9 } });
    }

    #[test]
    fn missing_paths_are_omitted() {
        let doc = doc! { "_id": 1, "a": 2 };
        let out = project(&doc, &["nope".to_string(), "a.b".to_string()]);

        assert_eq!(out, doc! { "_id": 1 });
    }

    #[test]
    fn namespaces_without_entry_pass_through() {
        let mut projection = FieldProjection::new();
        projection.add("db.a", vec!["x".to_string()]);
        let doc = doc! { "_id": 1, "x": 2, "y": 3 };

        assert_eq!(projection.apply("db.b", &doc), doc);
        assert_eq!(projection.apply("db.a", &doc), doc! { "_id": 1, "x": 2 });
    }
}
