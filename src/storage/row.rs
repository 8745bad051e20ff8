//! Row encoding.
//!
//! Each row is stored as its own JSON blob, with metadata for version
//! tracking next to the user's columns:
//!
//! ```text
//! {
//!   "_pk": "01j9...",
//!   "_version": 1,
//!   "_created_at": "2024-01-01T00:00:00+00:00",
//!   "_updated_at": "2024-01-01T00:00:00+00:00",
//!   "name": "John"
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::RowKey;

/// A document row with metadata and user data.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Must match the file name without `.json`.
    pub key: RowKey,
    pub version: u64,
    pub created_at: String,
    pub updated_at: String,
    pub data: BTreeMap<String, Value>,
}

impl Row {
    /// Version 1, timestamped now.
    pub fn new(key: RowKey, data: BTreeMap<String, Value>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            key,
            version: 1,
            created_at: now.clone(),
            updated_at: now,
            data,
        }
    }

    /// Build a row from a JSON object.
    pub fn from_value(key: RowKey, value: Value) -> StorageResult<Self> {
        match value {
            Value::Object(map) => Ok(Self::new(key, map.into_iter().collect())),
            _ => Err(StorageError::SchemaViolation(
                "row data must be a JSON object".to_string(),
            )),
        }
    }

    /// Next version of this row carrying `data`.
    pub fn with_update(self, data: BTreeMap<String, Value>) -> Self {
        Self {
            key: self.key,
            version: self.version + 1,
            created_at: self.created_at,
            updated_at: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }

    /// Column value as a string, if it is one.
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }
}

/// `_` prefixed metadata keeps clear of user columns.
#[derive(Serialize, Deserialize)]
struct RowJson {
    #[serde(rename = "_pk")]
    pk: String,
    #[serde(rename = "_version")]
    version: u64,
    #[serde(rename = "_created_at")]
    created_at: String,
    #[serde(rename = "_updated_at")]
    updated_at: String,
    #[serde(flatten)]
    data: BTreeMap<String, Value>,
}

/// Encode a row. BTreeMap keeps the byte output stable for identical rows.
pub(crate) fn encode(row: &Row) -> StorageResult<Vec<u8>> {
    let json = RowJson {
        pk: row.key.as_str().to_string(),
        version: row.version,
        created_at: row.created_at.clone(),
        updated_at: row.updated_at.clone(),
        data: row.data.clone(),
    };
    Ok(serde_json::to_vec_pretty(&json)?)
}

/// Decode a row stored under `expected_key`.
pub(crate) fn decode(bytes: &[u8], expected_key: &RowKey) -> StorageResult<Row> {
    let json: RowJson = serde_json::from_slice(bytes)?;

    if json.pk != expected_key.as_str() {
        return Err(StorageError::CorruptedData {
            path: expected_key.file_name().into(),
            reason: format!(
                "primary key mismatch: file name suggests '{}' but content has '{}'",
                expected_key, json.pk
            ),
        });
    }

    Ok(Row {
        key: expected_key.clone(),
        version: json.version,
        created_at: json.created_at,
        updated_at: json.updated_at,
        data: json.data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_requires_object() {
        let key = RowKey::new("a").unwrap();
        assert!(Row::from_value(key.clone(), json!({"name": "John"})).is_ok());
        assert!(matches!(
            Row::from_value(key, json!(["John"])),
            Err(StorageError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_encoded_layout() {
        let key = RowKey::new("abc").unwrap();
        let row = Row::from_value(key, json!({"b_field": 2, "a_field": 1})).unwrap();
        let parsed: Value = serde_json::from_slice(&encode(&row).unwrap()).unwrap();

        assert_eq!(parsed["_pk"], json!("abc"));
        assert_eq!(parsed["_version"], json!(1));
        assert_eq!(parsed["a_field"], json!(1));
        assert!(parsed.get("data").is_none());
    }

    #[test]
    fn test_decode_keeps_columns_and_version() {
        let key = RowKey::new("john").unwrap();
        let row = Row::from_value(key.clone(), json!({"name": "John"}))
            .unwrap()
            .with_update([("name".to_string(), json!("Johnny"))].into());

        let restored = decode(&encode(&row).unwrap(), &key).unwrap();
        assert_eq!(restored.version, 2);
        assert_eq!(restored.get_str("name"), Some("Johnny"));
        assert_eq!(restored.created_at, row.created_at);
    }

    #[test]
    fn test_key_mismatch_detection() {
        let row = Row::new(RowKey::new("correct").unwrap(), BTreeMap::new());
        let bytes = encode(&row).unwrap();

        let result = decode(&bytes, &RowKey::new("wrong").unwrap());
        assert!(matches!(result, Err(StorageError::CorruptedData { .. })));
    }
}
