//! Syndex transform: field-type keyed transformers and document flattening.
//!
//! Transformers are total pure functions from a raw field value to an
//! index-safe scalar. `None` means the value transformed to nothing and the
//! field is omitted from the flat record.

#![forbid(unsafe_code)]

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use syndex_core::{TransformedRecord, TransformedValue};
use syndex_schema::{lookup_value, resolve_field, CollectionSchema, FieldDescriptor, FieldType};

/// Pure conversion from a raw field value to an index-safe value.
/// The descriptor and origin collection are advisory; built-ins ignore them.
pub type Transformer =
    Arc<dyn Fn(&Value, Option<&FieldDescriptor>, Option<&str>) -> Option<TransformedValue> + Send + Sync>;

/// Field-type -> transformer dispatch table. Composed once at configuration
/// time; caller registrations replace same-keyed defaults entirely.
#[derive(Clone)]
pub struct TransformerRegistry {
    map: FxHashMap<FieldType, Transformer>,
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::defaults()
    }
}

impl TransformerRegistry {
    pub fn empty() -> Self {
        Self { map: FxHashMap::default() }
    }

    /// Registry pre-populated with the built-in transformers.
    pub fn defaults() -> Self {
        let mut reg = Self::empty();
        reg.register(FieldType::RichText, Arc::new(|v, _, _| rich_text(v)));
        reg.register(FieldType::Json, Arc::new(|v, _, _| json_string(v)));
        reg.register(FieldType::Array, Arc::new(|v, _, _| array_join(v)));
        reg.register(FieldType::Relationship, Arc::new(|v, _, _| relationship(v)));
        reg.register(FieldType::Select, Arc::new(|v, _, _| select(v)));
        reg.register(FieldType::Upload, Arc::new(|v, _, _| upload(v)));
        reg
    }

    /// Last registration wins.
    pub fn register(&mut self, field_type: FieldType, transformer: Transformer) {
        self.map.insert(field_type, transformer);
    }

    pub fn get(&self, field_type: FieldType) -> Option<&Transformer> {
        self.map.get(&field_type)
    }
}

/// Flatten a document into a transformed record: for each requested path,
/// resolve the raw value, apply the field type's transformer (or the default
/// stringifier when the type is unregistered or unresolved), and keep the
/// result under the literal dotted path. Absent and transformed-to-null
/// fields are omitted entirely.
pub fn flatten(
    doc: &Value,
    field_paths: &[String],
    schema: &CollectionSchema,
    registry: &TransformerRegistry,
) -> TransformedRecord {
    let mut out = TransformedRecord::new();
    for path in field_paths {
        let Some(raw) = lookup_value(doc, path) else { continue };
        if raw.is_null() {
            continue;
        }
        let descriptor = resolve_field(schema, path);
        let transformed = match descriptor.and_then(|d| registry.get(d.field_type)) {
            Some(t) => t(raw, descriptor, Some(&schema.slug)),
            None => stringify(raw),
        };
        if let Some(value) = transformed {
            out.insert(path.clone(), value.into());
        }
    }
    out
}

// ---- built-in transformers ----

/// Render a scalar for joining into display strings. Containers fall back to
/// compact JSON rather than an opaque placeholder.
fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Default for unregistered types: stringify the raw value. Null never
/// reaches here (the flattener treats it as absent), so the literal "null"
/// is never emitted.
pub fn stringify(value: &Value) -> Option<TransformedValue> {
    if value.is_null() {
        return None;
    }
    Some(TransformedValue::Text(display(value)))
}

/// Rich structured text -> plain text: collect `text` leaves in tree order.
fn rich_text(value: &Value) -> Option<TransformedValue> {
    fn walk(node: &Value, out: &mut Vec<String>) {
        match node {
            Value::Object(map) => {
                if let Some(Value::String(text)) = map.get("text") {
                    if !text.is_empty() {
                        out.push(text.clone());
                    }
                }
                if let Some(Value::Array(children)) = map.get("children") {
                    for child in children {
                        walk(child, out);
                    }
                }
            }
            Value::Array(nodes) => {
                for n in nodes {
                    walk(n, out);
                }
            }
            _ => {}
        }
    }
    let mut parts = Vec::new();
    walk(value, &mut parts);
    if parts.is_empty() {
        None
    } else {
        Some(TransformedValue::Text(parts.join(" ")))
    }
}

/// Structured/opaque JSON -> serialized string.
fn json_string(value: &Value) -> Option<TransformedValue> {
    if value.is_null() {
        return None;
    }
    serde_json::to_string(value).ok().map(TransformedValue::Text)
}

/// Sequence -> one string: objects join their values with a space, scalars
/// render directly; elements join with ", ". Non-sequences yield nothing.
fn array_join(value: &Value) -> Option<TransformedValue> {
    let items = value.as_array()?;
    let rendered: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Object(map) => map
                .values()
                .map(display)
                .collect::<Vec<_>>()
                .join(" "),
            other => display(other),
        })
        .collect();
    Some(TransformedValue::Text(rendered.join(", ")))
}

/// Prefer a human label on a populated related object, else its identity.
fn relation_label(value: &Value) -> String {
    if let Some(map) = value.as_object() {
        for key in ["title", "name", "slug"] {
            if let Some(Value::String(s)) = map.get(key) {
                if !s.is_empty() {
                    return s.clone();
                }
            }
        }
        if let Some(id) = map.get("id") {
            return display(id);
        }
    }
    display(value)
}

/// Relationship, single or multi. Unpopulated scalars stringify as-is.
fn relationship(value: &Value) -> Option<TransformedValue> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(TransformedValue::Text(
            items.iter().map(relation_label).collect::<Vec<_>>().join(", "),
        )),
        other => Some(TransformedValue::Text(relation_label(other))),
    }
}

/// Selection (possibly multi): join sequence values, else stringify.
fn select(value: &Value) -> Option<TransformedValue> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(TransformedValue::Text(
            items.iter().map(display).collect::<Vec<_>>().join(", "),
        )),
        other => Some(TransformedValue::Text(display(other))),
    }
}

/// File/upload reference: filename, then alt, then title.
fn upload(value: &Value) -> Option<TransformedValue> {
    let map = value.as_object()?;
    for key in ["filename", "alt", "title"] {
        if let Some(Value::String(s)) = map.get(key) {
            if !s.is_empty() {
                return Some(TransformedValue::Text(s.clone()));
            }
        }
    }
    None
}
