//! Syndex schema: collection field descriptors and dotted-path resolution.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field type tags. Closed set: unregistered tags fall through to the
/// default stringifier in the transformer registry, never to reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    Text,
    Textarea,
    RichText,
    Number,
    Checkbox,
    Date,
    Email,
    Select,
    Relationship,
    Upload,
    Json,
    Group,
    Array,
}

impl FieldType {
    /// Group and array fields carry a child field list to descend into.
    pub fn is_nested(self) -> bool {
        matches!(self, FieldType::Group | FieldType::Array)
    }
}

/// Schema metadata for one field: name, type tag, and (for nested types)
/// the child field list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldDescriptor>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self { name: name.into(), field_type, fields: Vec::new() }
    }

    pub fn nested(name: impl Into<String>, field_type: FieldType, fields: Vec<FieldDescriptor>) -> Self {
        Self { name: name.into(), field_type, fields }
    }
}

/// Ordered field descriptor tree for one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub slug: String,
    pub fields: Vec<FieldDescriptor>,
}

/// Accept only simple dotted paths like `author.name`; segments are
/// alphanumeric plus `_`/`-`, no wildcards or indexing. Checked once at
/// configuration time, not per request.
pub fn validate_field_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    path.split('.').all(|seg| {
        !seg.is_empty()
            && seg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}

/// Locate the descriptor for a dotted field path, descending into group and
/// array children. Not-found is a normal outcome: most documents populate
/// only a fraction of declared fields.
pub fn resolve_field<'a>(schema: &'a CollectionSchema, path: &str) -> Option<&'a FieldDescriptor> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut fields = &schema.fields;
    let mut found: Option<&FieldDescriptor> = None;
    for (i, seg) in segments.iter().enumerate() {
        found = fields.iter().find(|f| f.name == *seg);
        match found {
            Some(f) if f.field_type.is_nested() && i < segments.len() - 1 => {
                fields = &f.fields;
            }
            Some(_) => {}
            None => return None,
        }
    }
    found
}

/// Walk a document with the same dotted segments. Any missing intermediate
/// segment yields `None`, never an error.
pub fn lookup_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for seg in path.split('.') {
        if seg.is_empty() {
            return None;
        }
        match cur {
            Value::Object(map) => cur = map.get(seg)?,
            _ => return None,
        }
    }
    Some(cur)
}
