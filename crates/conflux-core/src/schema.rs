//! Resolved schemas
//!
//! Schemas are authored and stored elsewhere; the engine only receives them
//! resolved, through a [`SchemaCatalog`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Logical type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// UTF-8 string
    String,
    /// Whole number
    Integer,
    /// Any number
    Number,
    /// true / false
    Boolean,
    /// Nested object
    Object,
    /// Array
    Array,
    /// No type constraint
    Any,
}

impl FieldType {
    /// Whether `value` conforms to this type; null conforms to nothing but `Any`
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

/// One field of a schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaField {
    /// Field name
    pub name: String,
    /// Field type
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: FieldType,
    /// Whether the field must be present and non-null
    #[serde(default)]
    pub required: bool,
}

fn default_field_type() -> FieldType {
    FieldType::Any
}

/// A resolved schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema id referenced by `Record::schema_id`
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Declared fields
    #[serde(default)]
    pub fields: Vec<SchemaField>,
}

impl Schema {
    /// Check a record's data against the schema, returning every violation
    pub fn violations(&self, data: &serde_json::Map<String, Value>) -> Vec<String> {
        let mut out = Vec::new();
        for field in &self.fields {
            match data.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    out.push(format!("required field '{}' is missing", field.name));
                }
                Some(value) if !value.is_null() && !field.field_type.matches(value) => {
                    out.push(format!(
                        "field '{}' expected {:?}, got {}",
                        field.name,
                        field.field_type,
                        json_type_name(value)
                    ));
                }
                _ => {}
            }
        }
        out
    }
}

/// Schemas known to a run, keyed by id
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    schemas: HashMap<String, Schema>,
}

impl SchemaCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema, replacing any previous one with the same id
    pub fn insert(&mut self, schema: Schema) {
        self.schemas.insert(schema.id.clone(), schema);
    }

    /// Look up a schema
    pub fn get(&self, id: &str) -> Option<&Schema> {
        self.schemas.get(id)
    }

    /// Whether the catalog holds no schemas
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl FromIterator<Schema> for SchemaCatalog {
    fn from_iter<I: IntoIterator<Item = Schema>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for schema in iter {
            catalog.insert(schema);
        }
        catalog
    }
}

/// Short name of a JSON value's type, for messages
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orders() -> Schema {
        serde_yaml::from_str(
            r#"
id: orders
name: Orders
fields:
  - name: order_id
    type: Integer
    required: true
  - name: email
    type: String
  - name: tags
    type: Array
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_schema() {
        let schema = orders();
        assert_eq!(schema.fields.len(), 3);
        assert!(schema.fields[0].required);
        assert_eq!(schema.fields[1].field_type, FieldType::String);
    }

    #[test]
    fn test_valid_record_has_no_violations() {
        let data = json!({"order_id": 7, "email": "a@b.c", "tags": []});
        assert!(orders().violations(data.as_object().unwrap()).is_empty());
    }

    #[test]
    fn test_missing_required_and_wrong_type() {
        let data = json!({"email": 12});
        let violations = orders().violations(data.as_object().unwrap());
        assert_eq!(violations.len(), 2);
        assert!(violations[0].contains("order_id"));
        assert!(violations[1].contains("expected String"));
    }

    #[test]
    fn test_optional_null_is_allowed() {
        let data = json!({"order_id": 1, "email": null});
        assert!(orders().violations(data.as_object().unwrap()).is_empty());
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog: SchemaCatalog = vec![orders()].into_iter().collect();
        assert!(catalog.get("orders").is_some());
        assert!(catalog.get("customers").is_none());
    }
}
