//! Hive partition names and typed partition values.

use crate::cache::MetaCacheError;
use crate::catalog::ColumnType;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::BTreeMap;

/// Value Hive writes for a null partition key.
pub const HIVE_DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

fn needs_escape(c: char) -> bool {
    matches!(
        c,
        '\u{01}'..='\u{1F}'
            | '"'
            | '#'
            | '%'
            | '\''
            | '*'
            | '/'
            | ':'
            | '='
            | '?'
            | '\\'
            | '\u{7F}'
            | '{'
            | '['
            | ']'
            | '^'
    )
}

/// Escape a partition key or value the way Hive writes directory names.
pub fn escape_path_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if needs_escape(c) {
            escaped.push_str(&format!("%{:02X}", c as u32));
        } else {
            escaped.push(c);
        }
    }
    escaped
}

pub fn unescape_path_name(name: &str) -> Result<String, MetaCacheError> {
    urlencoding::decode(name)
        .map(|s| s.into_owned())
        .map_err(|_| MetaCacheError::InvalidPartitionName(name.to_string()))
}

/// Build `k1=v1/k2=v2` from partition keys and raw values.
pub fn make_partition_name(keys: &[&str], values: &[String]) -> String {
    keys.iter()
        .zip(values)
        .map(|(k, v)| format!("{}={}", escape_path_name(k), escape_path_name(v)))
        .collect::<Vec<_>>()
        .join("/")
}

/// Split a partition name into unescaped `(key, value)` pairs.
pub fn parse_partition_name(name: &str) -> Result<Vec<(String, String)>, MetaCacheError> {
    name.split('/')
        .map(|part| {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| MetaCacheError::InvalidPartitionName(name.to_string()))?;
            Ok((unescape_path_name(k)?, unescape_path_name(v)?))
        })
        .collect()
}

/// Raw values of a partition name, in key order.
pub fn partition_values_from_name(name: &str) -> Result<Vec<String>, MetaCacheError> {
    Ok(parse_partition_name(name)?
        .into_iter()
        .map(|(_, v)| v)
        .collect())
}

/// A partition key value parsed as its column type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PartitionValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    /// Kept textual to preserve scale.
    Decimal(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    String(String),
}

impl PartitionValue {
    pub fn parse(raw: &str, column_type: ColumnType) -> Result<Self, MetaCacheError> {
        if raw == HIVE_DEFAULT_PARTITION {
            return Ok(PartitionValue::Null);
        }
        let invalid = || MetaCacheError::InvalidPartitionValue {
            value: raw.to_string(),
            column_type,
        };
        let value = match column_type {
            ColumnType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" => PartitionValue::Boolean(true),
                "false" => PartitionValue::Boolean(false),
                _ => return Err(invalid()),
            },
            ColumnType::Int | ColumnType::BigInt => {
                PartitionValue::Integer(raw.trim().parse().map_err(|_| invalid())?)
            }
            ColumnType::Double => PartitionValue::Double(raw.trim().parse().map_err(|_| invalid())?),
            ColumnType::Decimal => {
                raw.trim().parse::<f64>().map_err(|_| invalid())?;
                PartitionValue::Decimal(raw.trim().to_string())
            }
            ColumnType::Date => PartitionValue::Date(
                NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| invalid())?,
            ),
            ColumnType::Timestamp => PartitionValue::Timestamp(
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").map_err(|_| invalid())?,
            ),
            ColumnType::String => PartitionValue::String(raw.to_string()),
        };
        Ok(value)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PartitionValue::Null)
    }
}

/// One partition of a table's partition value list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionItem {
    pub name: String,
    /// Unescaped values as stored by the metastore.
    pub raw_values: Vec<String>,
    pub values: Vec<PartitionValue>,
}

/// Every partition of a table: name -> id, id -> typed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HivePartitionValues {
    name_to_id: BTreeMap<String, i64>,
    items: BTreeMap<i64, PartitionItem>,
    next_id: i64,
}

impl HivePartitionValues {
    pub fn new(names: &[String], types: &[ColumnType]) -> Result<Self, MetaCacheError> {
        let mut values = Self::default();
        values.add(names, types)?;
        Ok(values)
    }

    fn parse_item(name: &str, types: &[ColumnType]) -> Result<PartitionItem, MetaCacheError> {
        let raw_values = partition_values_from_name(name)?;
        if raw_values.len() != types.len() {
            return Err(MetaCacheError::InvalidPartitionName(format!(
                "{} (expected {} keys)",
                name,
                types.len()
            )));
        }
        let values = raw_values
            .iter()
            .zip(types)
            .map(|(raw, ty)| PartitionValue::parse(raw, *ty))
            .collect::<Result<_, _>>()?;
        Ok(PartitionItem {
            name: name.to_string(),
            raw_values,
            values,
        })
    }

    /// Add partitions not seen yet under fresh ids. Returns how many were added.
    ///
    /// Every name is parsed before anything is added, so a bad name leaves the
    /// list unchanged.
    pub fn add(&mut self, names: &[String], types: &[ColumnType]) -> Result<usize, MetaCacheError> {
        let mut parsed = Vec::new();
        for name in names {
            if !self.name_to_id.contains_key(name) && !parsed.iter().any(|p: &PartitionItem| &p.name == name) {
                parsed.push(Self::parse_item(name, types)?);
            }
        }
        let added = parsed.len();
        for item in parsed {
            let id = self.next_id;
            self.next_id += 1;
            self.name_to_id.insert(item.name.clone(), id);
            self.items.insert(id, item);
        }
        Ok(added)
    }

    /// Remove partitions by name, returning the removed items.
    pub fn remove(&mut self, names: &[String]) -> Vec<PartitionItem> {
        names
            .iter()
            .filter_map(|name| self.name_to_id.remove(name))
            .filter_map(|id| self.items.remove(&id))
            .collect()
    }

    pub fn partition_id(&self, name: &str) -> Option<i64> {
        self.name_to_id.get(name).copied()
    }

    pub fn item(&self, id: i64) -> Option<&PartitionItem> {
        self.items.get(&id)
    }

    pub fn items(&self) -> impl Iterator<Item = (i64, &PartitionItem)> {
        self.items.iter().map(|(id, item)| (*id, item))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.name_to_id.keys().map(String::as_str)
    }

    /// Raw value lists of every partition, in id order.
    pub fn raw_values(&self) -> Vec<Vec<String>> {
        self.items.values().map(|i| i.raw_values.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
