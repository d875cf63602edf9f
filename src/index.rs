//! Index descriptors: parsing the server's `listIndexes` documents, normalising key
//! directions, rebuilding indexes at the destination and deriving the canonical signature
//! used by the consistency checker.
//!
//! Users can pick any name for an index, so cross-cluster comparison works on a name derived
//! from the key list alone: each `(field, direction)` pair renders as `field_direction` and
//! the pairs join with underscores. Numeric directions (including floats, which old servers
//! report for indexes created by old drivers) are formatted as integers; string directions
//! (`text`, `2d`, `hashed`, ...) verbatim.

use std::fmt;
use std::time::Duration;

use bson::{Bson, Document};
use mongodb::bson;
use mongodb::options::IndexOptions;
use mongodb::IndexModel;

use crate::{Error, Result};

/// A normalised index key direction.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexDirection {
    /// An ordering direction, `1` or `-1` (floats are coerced).
    Order(i64),
    /// A named index kind: `text`, `2d`, `2dsphere`, `geoHaystack`, `hashed`.
    Kind(String),
}

impl IndexDirection {
    /// Normalise a raw BSON direction. Anything that is neither numeric nor a string is a
    /// hard error.
    pub fn from_bson(value: &Bson) -> Result<IndexDirection> {
        match value {
            Bson::Int32(i) => Ok(IndexDirection::Order(i64::from(*i))),
            Bson::Int64(i) => Ok(IndexDirection::Order(*i)),
            Bson::Double(f) => Ok(IndexDirection::Order(*f as i64)),
            Bson::String(s) => Ok(IndexDirection::Kind(s.clone())),
            other => Err(Error::InvalidIndexDirection(format!("{:?}", other))),
        }
    }

    fn to_bson(&self) -> Bson {
        match self {
            IndexDirection::Order(i) => Bson::Int32(*i as i32),
            IndexDirection::Kind(s) => Bson::String(s.clone()),
        }
    }
}

impl fmt::Display for IndexDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IndexDirection::Order(i) => write!(f, "{}", i),
            IndexDirection::Kind(s) => write!(f, "{}", s),
        }
    }
}

/// A source index, normalised for recreation at the destination.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexSpec {
    /// The user-chosen index name.
    pub name: String,
    /// The ordered key list.
    pub keys: Vec<(String, IndexDirection)>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    /// Whether the index skips documents missing the indexed fields.
    pub sparse: bool,
    /// TTL in seconds, for TTL indexes.
    pub expire_after_seconds: Option<i64>,
    /// The partial-index filter, if any.
    pub partial_filter_expression: Option<Document>,
    /// Legacy duplicate-dropping flag. Parsed for the descriptor; never forwarded, the
    /// option was removed in server 3.0.
    pub drop_dups: bool,
    /// Per-field weights for text indexes.
    pub weights: Option<Document>,
    /// Default language for text indexes.
    pub default_language: Option<String>,
    /// Language override field for text indexes.
    pub language_override: Option<String>,
}

impl IndexSpec {
    /// Parse one document of a `listIndexes` cursor. The `background` flag is dropped here:
    /// indexes are recreated before data load, where a foreground build is what surfaces
    /// duplicate-key conflicts per document.
    pub fn from_document(doc: &Document) -> Result<IndexSpec> {
        let key = doc.get_document("key")?;
        let mut keys = Vec::with_capacity(key.len());
        for (field, direction) in key {
            keys.push((field.clone(), IndexDirection::from_bson(direction)?));
        }

        Ok(IndexSpec {
            name: doc.get_str("name").unwrap_or_default().to_string(),
            keys,
            unique: doc.get_bool("unique").unwrap_or(false),
            sparse: doc.get_bool("sparse").unwrap_or(false),
            expire_after_seconds: numeric_seconds(doc.get("expireAfterSeconds")),
            partial_filter_expression: doc
                .get_document("partialFilterExpression")
                .ok()
                .cloned(),
            drop_dups: doc.get_bool("dropDups").unwrap_or(false),
            weights: doc.get_document("weights").ok().cloned(),
            default_language: doc.get_str("default_language").ok().map(str::to_string),
            language_override: doc.get_str("language_override").ok().map(str::to_string),
        })
    }

    /// Whether this is the automatic `_id` index, which every collection already has.
    pub fn is_id_index(&self) -> bool {
        self.name == "_id_"
    }

    /// The canonical signature of the index, independent of the user-chosen name.
    pub fn standard_name(&self) -> String {
        self.keys
            .iter()
            .map(|(field, direction)| format!("{}_{}", field, direction))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// The destination representation of the index.
    pub fn to_index_model(&self) -> IndexModel {
        let mut keys = Document::new();
        for (field, direction) in &self.keys {
            keys.insert(field.clone(), direction.to_bson());
        }

        let options = IndexOptions::builder()
            .name(if self.name.is_empty() {
                None
            } else {
                Some(self.name.clone())
            })
            .unique(if self.unique { Some(true) } else { None })
            .sparse(if self.sparse { Some(true) } else { None })
            .expire_after(
                self.expire_after_seconds
                    .map(|s| Duration::from_secs(s.max(0) as u64)),
            )
            .partial_filter_expression(self.partial_filter_expression.clone())
            .weights(self.weights.clone())
            .default_language(self.default_language.clone())
            .language_override(self.language_override.clone())
            .build();

        IndexModel::builder().keys(keys).options(options).build()
    }
}

/// Compute the canonical signature for a raw `listIndexes` key document without building a
/// full descriptor. Used by the consistency checker.
pub fn standard_name(key: &Document) -> Result<String> {
    let mut parts = Vec::with_capacity(key.len());
    for (field, direction) in key {
        parts.push(format!("{}_{}", field, IndexDirection::from_bson(direction)?));
    }
    Ok(parts.join("_"))
}

fn numeric_seconds(value: Option<&Bson>) -> Option<i64> {
    match value {
        Some(Bson::Int32(i)) => Some(i64::from(*i)),
        Some(Bson::Int64(i)) => Some(*i),
        Some(Bson::Double(f)) => Some(*f as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn standard_name_joins_fields_and_directions() {
        let spec = IndexSpec::from_document(&doc! {
            "v": 2,
            "key": { "a": 1, "b": -1 },
            "name": "my_fancy_index",
            "ns": "db.coll"
        })
        .unwrap();

        assert_eq!(spec.standard_name(), "a_1_b_-1");
    }

    #[test]
    fn standard_name_is_independent_of_the_user_chosen_name() {
        let one = IndexSpec::from_document(&doc! { "key": { "a": 1 }, "name": "x" }).unwrap();
        let two = IndexSpec::from_document(&doc! { "key": { "a": 1 }, "name": "y" }).unwrap();

        assert_eq!(one.standard_name(), two.standard_name());
    }

    #[test]
    fn standard_name_is_order_sensitive() {
        let ab = standard_name(&doc! { "a": 1, "b": 1 }).unwrap();
        let ba = standard_name(&doc! { "b": 1, "a": 1 }).unwrap();

        assert_ne!(ab, ba);
    }

    #[test]
    fn float_directions_coerce_to_integers() {
        assert_eq!(standard_name(&doc! { "a": 1.0 }).unwrap(), "a_1");
        assert_eq!(standard_name(&doc! { "a": -1.0 }).unwrap(), "a_-1");
    }

    #[test]
    fn string_directions_render_verbatim() {
        assert_eq!(
            standard_name(&doc! { "loc": "2d", "body": "text" }).unwrap(),
            "loc_2d_body_text"
        );
        assert_eq!(standard_name(&doc! { "h": "hashed" }).unwrap(), "h_hashed");
    }

    #[test]
    fn other_direction_types_are_hard_errors() {
        match standard_name(&doc! { "a": true }) {
            Err(Error::InvalidIndexDirection(_)) => {}
            other => panic!("expected InvalidIndexDirection, got {:?}", other),
        }
    }

    #[test]
    fn options_survive_parsing() {
        let spec = IndexSpec::from_document(&doc! {
            "v": 1,
            "key": { "created": 1 },
            "name": "ttl",
            "unique": true,
            "sparse": true,
            "dropDups": true,
            "background": true,
            "expireAfterSeconds": 3600.0
        })
        .unwrap();

        assert!(spec.unique);
        assert!(spec.sparse);
        assert!(spec.drop_dups);
        assert_eq!(spec.expire_after_seconds, Some(3600));
    }

    #[test]
    fn id_index_is_recognised() {
        let spec = IndexSpec::from_document(&doc! { "key": { "_id": 1 }, "name": "_id_" }).unwrap();
        assert!(spec.is_id_index());
    }
}
