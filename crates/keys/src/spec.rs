use crate::{compare, ShardKey};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse shard key document")]
    Json(#[from] serde_json::Error),
    #[error("shard key document has no fields")]
    Empty,
    #[error("shard key field {field:?} has invalid direction {value}")]
    BadDirection { field: String, value: Value },
    #[error("shard key declares more than one hashed field")]
    MultipleHashed,
}

/// Ordering direction of one shard-key field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
    Hashed,
}

/// One field of a shard key, in declaration order.
#[derive(Debug, Clone)]
pub struct KeyField {
    pub name: String,
    pub order: Order,
}

/// KeySpec is an ordered shard-key specification, parsed from a JSON
/// document such as `{"user_id": "hashed"}` or `{"region": 1, "ts": -1}`.
/// Field declaration order is significant and preserved.
#[derive(Debug, Clone)]
pub struct KeySpec {
    fields: Vec<KeyField>,
    hashed: Option<usize>,
}

impl KeySpec {
    pub fn new(fields: Vec<KeyField>) -> Result<Self, Error> {
        if fields.is_empty() {
            return Err(Error::Empty);
        }
        let mut hashed = None;
        for (index, field) in fields.iter().enumerate() {
            if field.order == Order::Hashed {
                if hashed.is_some() {
                    return Err(Error::MultipleHashed);
                }
                hashed = Some(index);
            }
        }
        Ok(Self { fields, hashed })
    }

    /// Parse a KeySpec from its JSON document encoding.
    /// Directions are `1` (ascending), `-1` (descending), or `"hashed"`.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut de = serde_json::Deserializer::from_str(text);
        let raw = serde::de::Deserializer::deserialize_map(&mut de, OrderedFields)?;

        let mut fields = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            let order = match &value {
                Value::Number(n) if n.as_i64() == Some(1) => Order::Ascending,
                Value::Number(n) if n.as_i64() == Some(-1) => Order::Descending,
                Value::String(s) if s == "hashed" => Order::Hashed,
                _ => return Err(Error::BadDirection { field: name, value }),
            };
            fields.push(KeyField { name, order });
        }
        Self::new(fields)
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    /// Index of the hashed field, if the key is hashed.
    pub fn hashed(&self) -> Option<usize> {
        self.hashed
    }

    pub fn is_hashed(&self) -> bool {
        self.hashed.is_some()
    }

    /// Does the key include the `_id` field?
    pub fn includes_id(&self) -> bool {
        self.fields.iter().any(|f| f.name == "_id")
    }

    /// Compare two extracted keys under this specification.
    /// Hashed fields hold their hashes and compare ascending.
    pub fn compare(&self, lhs: &ShardKey, rhs: &ShardKey) -> Ordering {
        self.fields
            .iter()
            .zip(lhs.values().iter().zip(rhs.values()))
            .map(|(field, (lhs, rhs))| match field.order {
                Order::Descending => compare(lhs, rhs).reverse(),
                _ => compare(lhs, rhs),
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

// Visitor which collects object entries in their declaration order.
// serde_json's Map type sorts properties, which would destroy the
// field order that chunk routing depends upon.
struct OrderedFields;

impl<'de> serde::de::Visitor<'de> for OrderedFields {
    type Value = Vec<(String, Value)>;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "a shard key object")
    }

    fn visit_map<A: serde::de::MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut fields = Vec::new();
        while let Some(entry) = map.next_entry()? {
            fields.push(entry);
        }
        Ok(fields)
    }
}
