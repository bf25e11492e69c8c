//! Portable JSON-Schema-shaped description of tool parameters and
//! constrained response shapes.
//!
//! This is a typed stand-in for the bare `serde_json::Value` the teacher
//! crate uses for `Tool::parameters` (`llm/provider.rs`). A bare `Value`
//! can't enforce "object implies a properties map is present" at the type
//! level, which the gateway's wire adapters rely on (OpenAI rejects an
//! object schema with no `properties` key).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// JSON-Schema primitive type tags used by this system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
}

/// Recursive schema description for a tool parameter or a constrained
/// response shape.
///
/// Invariants (spec §3):
/// - `type == Object` implies `properties` is present (possibly empty).
/// - `type == Array` implies `items` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl Schema {
    pub fn object(properties: BTreeMap<String, Schema>, required: Vec<String>) -> Self {
        Self {
            schema_type: SchemaType::Object,
            description: None,
            properties: Some(properties),
            items: None,
            required,
        }
    }

    pub fn array(items: Schema) -> Self {
        Self {
            schema_type: SchemaType::Array,
            description: None,
            properties: None,
            items: Some(Box::new(items)),
            required: Vec::new(),
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self {
            schema_type: SchemaType::String,
            description: Some(description.into()),
            properties: None,
            items: None,
            required: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validate the object/array invariants hold. Schemas built through the
    /// constructors above always satisfy this; this guards schemas that
    /// round-tripped through `from_json`.
    pub fn validate(&self) -> Result<(), SchemaError> {
        match self.schema_type {
            SchemaType::Object if self.properties.is_none() => {
                Err(SchemaError::MissingProperties)
            }
            SchemaType::Array if self.items.is_none() => Err(SchemaError::MissingItems),
            _ => {
                if let Some(props) = &self.properties {
                    for child in props.values() {
                        child.validate()?;
                    }
                }
                if let Some(items) = &self.items {
                    items.validate()?;
                }
                Ok(())
            }
        }
    }

    /// Serialize to a plain JSON-Schema `Value`, normalizing per-backend
    /// where the caller requires it (e.g. OpenAI's `integer -> number`
    /// wire-compatibility rule, applied by the caller via
    /// [`Schema::to_json_normalized`]).
    pub fn to_json(&self) -> Value {
        self.to_json_inner(false)
    }

    /// Same as [`Schema::to_json`] but collapses `integer` to `number`,
    /// matching spec §3's OpenAI wire-compatibility rule.
    pub fn to_json_normalized(&self) -> Value {
        self.to_json_inner(true)
    }

    fn to_json_inner(&self, normalize_integer: bool) -> Value {
        let type_str = match (self.schema_type, normalize_integer) {
            (SchemaType::Integer, true) => "number",
            (SchemaType::Object, _) => "object",
            (SchemaType::Array, _) => "array",
            (SchemaType::String, _) => "string",
            (SchemaType::Number, _) => "number",
            (SchemaType::Integer, false) => "integer",
            (SchemaType::Boolean, _) => "boolean",
        };

        let mut obj = serde_json::Map::new();
        obj.insert("type".to_string(), json!(type_str));

        if let Some(desc) = &self.description {
            obj.insert("description".to_string(), json!(desc));
        }

        if self.schema_type == SchemaType::Object {
            let props = self.properties.as_ref().cloned().unwrap_or_default();
            let props_json: serde_json::Map<String, Value> = props
                .into_iter()
                .map(|(k, v)| (k, v.to_json_inner(normalize_integer)))
                .collect();
            obj.insert("properties".to_string(), Value::Object(props_json));
            if !self.required.is_empty() {
                obj.insert("required".to_string(), json!(self.required));
            }
        }

        if self.schema_type == SchemaType::Array {
            if let Some(items) = &self.items {
                obj.insert("items".to_string(), items.to_json_inner(normalize_integer));
            }
        }

        Value::Object(obj)
    }

    /// Parse a plain JSON-Schema `Value` back into a `Schema`.
    pub fn from_json(value: &Value) -> Result<Self, SchemaError> {
        let obj = value.as_object().ok_or(SchemaError::NotAnObject)?;

        let type_str = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(SchemaError::MissingType)?;

        let schema_type = match type_str {
            "object" => SchemaType::Object,
            "array" => SchemaType::Array,
            "string" => SchemaType::String,
            "number" => SchemaType::Number,
            "integer" => SchemaType::Integer,
            "boolean" => SchemaType::Boolean,
            other => return Err(SchemaError::UnknownType(other.to_string())),
        };

        let description = obj
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);

        let properties = match obj.get("properties") {
            Some(Value::Object(map)) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), Schema::from_json(v)?);
                }
                Some(out)
            }
            _ if schema_type == SchemaType::Object => Some(BTreeMap::new()),
            _ => None,
        };

        let items = match obj.get("items") {
            Some(v) => Some(Box::new(Schema::from_json(v)?)),
            None => None,
        };

        let required = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let schema = Schema {
            schema_type,
            description,
            properties,
            items,
            required,
        };
        schema.validate()?;
        Ok(schema)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema value is not a JSON object")]
    NotAnObject,
    #[error("schema is missing a \"type\" field")]
    MissingType,
    #[error("unknown schema type: {0}")]
    UnknownType(String),
    #[error("object schema is missing a properties map")]
    MissingProperties,
    #[error("array schema is missing an items schema")]
    MissingItems,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_without_properties_still_serializes_empty_map() {
        let schema = Schema {
            schema_type: SchemaType::Object,
            description: None,
            properties: Some(BTreeMap::new()),
            items: None,
            required: vec![],
        };
        let json = schema.to_json();
        assert_eq!(json["properties"], json!({}));
    }

    #[test]
    fn integer_normalizes_to_number_for_openai() {
        let schema = Schema {
            schema_type: SchemaType::Integer,
            description: None,
            properties: None,
            items: None,
            required: vec![],
        };
        assert_eq!(schema.to_json()["type"], "integer");
        assert_eq!(schema.to_json_normalized()["type"], "number");
    }

    #[test]
    fn round_trip_up_to_integer_normalization() {
        let mut props = BTreeMap::new();
        props.insert("command".to_string(), Schema::string("shell command"));
        let schema = Schema::object(props, vec!["command".to_string()]);

        let json = schema.to_json();
        let parsed = Schema::from_json(&json).unwrap();
        assert_eq!(schema, parsed);
    }

    #[test]
    fn array_requires_items() {
        let bad = json!({"type": "array"});
        assert!(matches!(
            Schema::from_json(&bad),
            Err(SchemaError::MissingItems)
        ));
    }

    #[test]
    fn object_without_properties_key_defaults_to_empty() {
        let value = json!({"type": "object"});
        let schema = Schema::from_json(&value).unwrap();
        assert_eq!(schema.properties, Some(BTreeMap::new()));
    }
}
