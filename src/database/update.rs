use serde_json::{Map, Value};

use super::error::StoreError;

/// Field assignments applied by an update or upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Map<String, Value>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    /// A request body is either a plain partial record or `{ "$set": {...} }`.
    pub fn from_body(body: Value) -> Result<Self, StoreError> {
        match body {
            Value::Object(mut map) => match map.remove("$set") {
                Some(Value::Object(set)) => Ok(Self { set }),
                Some(other) => Err(StoreError::Cast {
                    kind: "Object",
                    value: other.to_string(),
                    path: "$set".into(),
                }),
                None => Ok(Self { set: map }),
            },
            other => Err(StoreError::Cast {
                kind: "Object",
                value: other.to_string(),
                path: "body".into(),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_and_set_bodies_are_equivalent() {
        let a = Update::from_body(json!({"name": "X"})).unwrap();
        let b = Update::from_body(json!({"$set": {"name": "X"}})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, Update::new().set("name", "X"));
    }

    #[test]
    fn non_object_body_is_rejected() {
        assert!(Update::from_body(json!([1, 2])).is_err());
        assert!(Update::from_body(json!({"$set": 3})).is_err());
    }
}
