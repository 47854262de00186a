// `include` relation loading (SPEC_FULL.md §2 supplemented feature): a
// breadth-first loader over a resource's declared relations with a
// `maxDepth` cycle guard, returning partially-loaded results with a
// `truncated` marker rather than failing outright.
//
// Relation target rows are located by the convention `{relation}_id` on
// the parent row matching the target resource's primary key — the engine
// carries no foreign-key metadata beyond `ResourceSchema::relations`, so
// this is the same naming convention a hand-rolled breadth-limited loader
// in the retrieval pack uses.

use std::collections::VecDeque;

use serde_json::{Map, Value as Json};

use crate::db::{Database, SelectOptions};
use crate::error::Result;
use crate::filter::{FilterNode, Operand, Operator};
use crate::schema::SchemaRegistry;
use crate::value::record_to_json;

pub fn parse_include(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Attaches requested relations to each row, breadth-first, stopping at
/// `max_depth` hops from the root resource. Returns the enriched rows plus
/// whether any branch was cut short by the depth guard.
pub async fn load_includes(
    db: &dyn Database,
    schemas: &SchemaRegistry,
    resource: &str,
    rows: Vec<crate::value::Record>,
    include: &[String],
    max_depth: usize,
) -> Result<(Vec<Json>, bool)> {
    let mut truncated = false;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut json = match record_to_json(&row) {
            Json::Object(map) => map,
            _ => Map::new(),
        };
        let mut queue: VecDeque<(String, usize)> = include.iter().map(|name| (name.clone(), 1)).collect();
        while let Some((relation_name, depth)) = queue.pop_front() {
            if depth > max_depth {
                truncated = true;
                continue;
            }
            let Some(schema) = schemas.get(resource) else { continue };
            let Some(target_resource) = schema.relations.get(&relation_name) else { continue };
            let Some(target_schema) = schemas.get(target_resource) else { continue };

            let fk_field = format!("{relation_name}_id");
            let Some(fk_value) = row.get(&fk_field) else { continue };

            let predicate = FilterNode::Op {
                field: target_schema.primary_key.clone(),
                operator: Operator::Eq,
                operand: Operand::Scalar(fk_value.clone()),
            };
            let related = db.select(target_resource, &predicate, &SelectOptions::default()).await?;
            let related_json: Vec<Json> = related.iter().map(record_to_json).collect();
            json.insert(relation_name, Json::Array(related_json));
        }
        out.push(Json::Object(json));
    }
    Ok((out, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDb;
    use crate::schema::{FieldType, ResourceSchema};
    use crate::value::{Record, Value as V};

    fn widget(id: &str, owner_id: &str) -> Record {
        let mut r = Record::new();
        r.insert("id".to_string(), V::String(id.to_string()));
        r.insert("owner_id".to_string(), V::String(owner_id.to_string()));
        r
    }

    fn owner(id: &str) -> Record {
        let mut r = Record::new();
        r.insert("id".to_string(), V::String(id.to_string()));
        r.insert("name".to_string(), V::String("alice".to_string()));
        r
    }

    #[tokio::test]
    async fn loads_one_hop_relation() {
        let db = InMemoryDb::new();
        db.seed("widgets", "id", widget("w1", "u1"));
        db.seed("owners", "id", owner("u1"));

        let mut schemas = SchemaRegistry::new();
        schemas.register(
            ResourceSchema::new("widgets", "id")
                .with_field("owner_id", FieldType::String)
                .with_relation("owner", "owners"),
        );
        schemas.register(ResourceSchema::new("owners", "id").with_field("name", FieldType::String));

        let rows = vec![widget("w1", "u1")];
        let (enriched, truncated) =
            load_includes(&db, &schemas, "widgets", rows, &["owner".to_string()], 3).await.unwrap();
        assert!(!truncated);
        let owner_arr = enriched[0].get("owner").unwrap().as_array().unwrap();
        assert_eq!(owner_arr.len(), 1);
        assert_eq!(owner_arr[0]["name"], "alice");
    }

    #[tokio::test]
    async fn depth_guard_marks_truncated() {
        let db = InMemoryDb::new();
        let mut schemas = SchemaRegistry::new();
        schemas.register(ResourceSchema::new("widgets", "id").with_relation("owner", "owners"));
        schemas.register(ResourceSchema::new("owners", "id"));

        let rows = vec![widget("w1", "u1")];
        let (_enriched, truncated) =
            load_includes(&db, &schemas, "widgets", rows, &["owner".to_string()], 0).await.unwrap();
        assert!(truncated);
    }
}
