use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One logical collection owned by one principal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionRef {
    pub owner: String,
    pub name: String,
}

impl CollectionRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A keyed bag of fields mirrored from the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EntityRecord {
    /// Create a record with a fresh UUID v4 identifier.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), fields)
    }

    pub fn with_id(id: impl Into<String>, mut fields: Map<String, Value>) -> Self {
        fields.remove("id");
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        let field = field.into();
        if field != "id" {
            self.fields.insert(field, value);
        }
    }

    /// Overlay `patch` onto the current fields. `id` is never patched.
    pub fn merge(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            self.set(key, value);
        }
    }

    /// Build a record from any serializable value that has an `id` field.
    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(value)?)
    }

    /// Decode the record (id included) into a typed value.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        serde_json::from_value(Value::Object(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_new_assigns_unique_ids() {
        let a = EntityRecord::new(Map::new());
        let b = EntityRecord::new(Map::new());
        assert_ne!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());
    }

    #[test]
    fn test_with_id_strips_id_field() {
        let record = EntityRecord::with_id("r1", fields(json!({"id": "other", "valor": 12})));
        assert_eq!(record.id, "r1");
        assert!(record.get("id").is_none());
        assert_eq!(record.get("valor"), Some(&json!(12)));
    }

    #[test]
    fn test_serde_flattens_fields() {
        let record = EntityRecord::with_id("r1", fields(json!({"categoria": "food"})));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value, json!({"id": "r1", "categoria": "food"}));

        let parsed: EntityRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_merge_ignores_id() {
        let mut record = EntityRecord::with_id("r1", fields(json!({"a": 1, "b": 2})));
        record.merge(fields(json!({"b": 3, "id": "hijack"})));
        assert_eq!(record.id, "r1");
        assert_eq!(record.get("a"), Some(&json!(1)));
        assert_eq!(record.get("b"), Some(&json!(3)));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Envelope {
        id: String,
        nome: String,
        saldo_atual: f64,
    }

    #[test]
    fn test_typed_conversion() {
        let envelope = Envelope {
            id: "env-1".to_string(),
            nome: "mercado".to_string(),
            saldo_atual: 42.5,
        };
        let record = EntityRecord::from_typed(&envelope).unwrap();
        assert_eq!(record.id, "env-1");
        assert_eq!(record.get_str("nome"), Some("mercado"));

        let back: Envelope = record.to_typed().unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_collection_ref_display() {
        let collection = CollectionRef::new("alice", "gastos");
        assert_eq!(collection.to_string(), "alice/gastos");
    }
}
