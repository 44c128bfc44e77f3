use std::hash::Hasher;

use anyhow::Result;
use seahash::SeaHasher;
use serde_json::Value;

use crate::error::AppError;
use crate::model::Event;

/// A hash deterministically derived from a configured subset of an event's attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentificationHash(u64);

impl IdentificationHash {
    /// The raw value of this hash.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The big-endian bytes of this hash, as used for hash ring lookups.
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

/// The ordered set of attribute names which identify the group an event belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentificationKeys {
    keys: Vec<String>,
}

impl IdentificationKeys {
    /// Create a new instance, which requires at least one key.
    pub fn new(keys: Vec<String>) -> Result<Self> {
        if keys.is_empty() {
            return Err(AppError::InvalidConfig("identification keys must not be empty".into()).into());
        }
        Ok(Self { keys })
    }

    /// The configured attribute names, in order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Compute the identification hash of the given event.
    ///
    /// Missing attributes hash as null. Object attributes hash the same regardless of the order in
    /// which their fields were inserted.
    pub fn hash(&self, event: &Event) -> IdentificationHash {
        let mut hasher = SeaHasher::default();
        for key in self.keys.iter() {
            hash_value(event.get(key).unwrap_or(&Value::Null), &mut hasher);
        }
        IdentificationHash(hasher.finish())
    }

    /// The identifying values of the given event, in key order.
    pub fn values(&self, event: &Event) -> Vec<Value> {
        self.keys.iter().map(|key| event.get(key).cloned().unwrap_or(Value::Null)).collect()
    }
}

/// Feed the given value into the hasher in a canonical, type-tagged form.
fn hash_value(value: &Value, hasher: &mut SeaHasher) {
    match value {
        Value::Null => hasher.write_u8(0),
        Value::Bool(val) => {
            hasher.write_u8(1);
            hasher.write_u8(*val as u8);
        }
        Value::Number(val) => {
            hasher.write_u8(2);
            write_str(&val.to_string(), hasher);
        }
        Value::String(val) => {
            hasher.write_u8(3);
            write_str(val, hasher);
        }
        Value::Array(vals) => {
            hasher.write_u8(4);
            hasher.write_u64(vals.len() as u64);
            vals.iter().for_each(|val| hash_value(val, hasher));
        }
        Value::Object(map) => {
            hasher.write_u8(5);
            hasher.write_u64(map.len() as u64);
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (key, val) in entries {
                write_str(key, hasher);
                hash_value(val, hasher);
            }
        }
    }
}

fn write_str(val: &str, hasher: &mut SeaHasher) {
    hasher.write_u64(val.len() as u64);
    hasher.write(val.as_bytes());
}
