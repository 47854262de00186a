// Per-resource schema (§3 Data Model): field names, types, the designated
// primary-key field, and the allow-lists the Filter Engine enforces (§4.A).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    /// Fields may be excluded from filtering by an allow-list (§4.A:
    /// "fields excluded by an allow-list likewise fail").
    pub filterable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub name: String,
    pub primary_key: String,
    pub fields: Vec<FieldSchema>,
    /// Relations this resource can `include`, keyed by relation name, value
    /// is the target resource name (§2 Supplemented features: include).
    pub relations: HashMap<String, String>,
}

impl ResourceSchema {
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            fields: Vec::new(),
            relations: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldSchema {
            name: name.into(),
            field_type,
            filterable: true,
        });
        self
    }

    pub fn with_unfilterable_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldSchema {
            name: name.into(),
            field_type,
            filterable: false,
        });
        self
    }

    pub fn with_relation(mut self, relation_name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relations.insert(relation_name.into(), target.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_filterable(&self, name: &str) -> bool {
        self.field(name).map(|f| f.filterable).unwrap_or(false)
    }
}

/// Registry of resource schemas, looked up by resource name. Passed around
/// as `Arc<SchemaRegistry>` (Design Note §9: explicit handles, not a
/// singleton).
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    resources: HashMap<String, ResourceSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: ResourceSchema) {
        self.resources.insert(schema.name.clone(), schema);
    }

    pub fn get(&self, resource: &str) -> Option<&ResourceSchema> {
        self.resources.get(resource)
    }
}
