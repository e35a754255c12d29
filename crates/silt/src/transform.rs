//! Upstream record transformation
//!
//! A [`Transformer`] turns one raw upstream record into a canonical
//! [`Row`]. Returning `Ok(false)` is a benign skip (tombstone, empty
//! payload, record for an unmapped table), not an error; malformed
//! payloads fail with a transform error and are skipped with a warning by
//! the pipeline.
//!
//! Two dialects ship:
//!
//! - [`DebeziumTransformer`] for topic-per-table CDC: a JSON envelope with
//!   a `payload` object carrying `op`, `ts_ms`, `before`/`after`.
//! - [`MaxwellTransformer`] for partitioned single-topic CDC: a flat JSON
//!   envelope with `database`, `table`, `type`, `ts`, `data`, `old`.
//!
//! The transformer owns type decoding: values land in the row already in
//! the target's bulk-load text encoding.

use crate::encoding::{
    decode_binary, decode_bit, decode_date, decode_numeric, decode_time, encode_line,
    escape_binary, quote_text,
};
use crate::error::{Result, SiltError};
use crate::pipeline::SourceRecord;
use crate::row::{Row, RowOp};
use crate::table::{ColumnType, Table};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Decode one upstream record into a supplied [`Row`].
pub trait Transformer: Send {
    /// Populate `row` from `record`. `Ok(false)` means the record is a
    /// benign skip and the row must not be used.
    fn transform(&self, record: &SourceRecord, row: &mut Row) -> Result<bool>;
}

/// Case-insensitive field lookup; upstream producers do not agree with
/// the target catalog on identifier casing.
fn json_get<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key)
        .or_else(|| map.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v))
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Encode the named columns of a JSON row object into one COPY line.
fn encode_fields<F>(table: &Table, columns: &[String], get: F) -> Result<String>
where
    F: Fn(&str) -> Option<Value>,
{
    let mut fields = Vec::with_capacity(columns.len());
    for name in columns {
        let value = get(name);
        let value = match value {
            None | Some(Value::Null) => {
                fields.push(None);
                continue;
            }
            Some(value) => value,
        };
        let column = table.column(name).ok_or_else(|| {
            SiltError::transform(format!("unknown column {name} for {}", table.name))
        })?;
        let encoded = match column.ty {
            ColumnType::Numeric => match &value {
                Value::String(s) => decode_numeric(s, column.scale)?,
                other => plain(other),
            },
            ColumnType::Date => decode_date(&plain(&value)).or_else(|_| match &value {
                Value::String(s) => Ok(s.clone()),
                other => Err(SiltError::transform(format!(
                    "invalid date value {other} for {name}"
                ))),
            })?,
            ColumnType::Time | ColumnType::Timestamp => decode_time(&plain(&value), column.ty)?,
            ColumnType::Bit => match &value {
                Value::Bool(true) => "1".to_string(),
                Value::Bool(false) => "0".to_string(),
                other => decode_bit(&plain(other), column.precision.max(1) as usize)?,
            },
            ColumnType::Binary => escape_binary(&decode_binary(&plain(&value))?),
            ColumnType::Text => quote_text(&plain(&value)),
            ColumnType::Other => plain(&value),
        };
        fields.push(Some(encoded));
    }
    Ok(encode_line(&fields))
}

/// Transformer for the topic-per-table dialect.
///
/// The source table identity lives in the topic name: the mapping key is
/// the configured source name plus the topic's `.schema.table` suffix.
pub struct DebeziumTransformer {
    source_name: String,
    table_map: Arc<HashMap<String, String>>,
    tables: Arc<HashMap<String, Arc<Table>>>,
}

impl DebeziumTransformer {
    pub fn new(
        source_name: impl Into<String>,
        table_map: Arc<HashMap<String, String>>,
        tables: Arc<HashMap<String, Arc<Table>>>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            table_map,
            tables,
        }
    }

    fn mapped_table(&self, topic: &str) -> Option<&String> {
        let suffix = &topic[topic.find('.')?..];
        self.table_map.get(&format!("{}{}", self.source_name, suffix))
    }
}

impl Transformer for DebeziumTransformer {
    fn transform(&self, record: &SourceRecord, row: &mut Row) -> Result<bool> {
        let Some(value) = record.value.as_deref().filter(|v| !v.trim().is_empty()) else {
            return Ok(false);
        };
        let envelope: Value = serde_json::from_str(value)
            .map_err(|e| SiltError::transform(format!("invalid record json: {e}")))?;
        let Some(payload) = envelope.get("payload").filter(|p| !p.is_null()) else {
            return Ok(false);
        };

        let op = payload
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| SiltError::transform("payload has no op field"))?;
        let (op, data_field) = match op {
            "r" | "c" => (RowOp::Insert, "after"),
            "u" => (RowOp::Update, "after"),
            "d" => (RowOp::Delete, "before"),
            other => {
                return Err(SiltError::transform(format!("unknown op {other:?}")));
            }
        };
        let produce_time = payload
            .get("ts_ms")
            .and_then(Value::as_i64)
            .ok_or_else(|| SiltError::transform("payload has no ts_ms field"))?;
        let data = payload
            .get(data_field)
            .and_then(Value::as_object)
            .ok_or_else(|| {
                SiltError::transform(format!("payload has no {data_field} object"))
            })?;

        let mapped = self.mapped_table(&record.topic).ok_or_else(|| {
            SiltError::transform(format!("no table mapping for topic {}", record.topic))
        })?;
        let table = self.tables.get(mapped).ok_or_else(|| {
            SiltError::transform(format!("no metadata for target table {mapped}"))
        })?;

        row.op = op;
        row.produce_time = produce_time;
        row.origin_table = record.topic.clone();
        row.mapped_table = mapped.clone();
        row.old_keys = None;
        row.keys = encode_fields(table, &table.key_names, |c| json_get(data, c).cloned())?;
        row.tuple = if op == RowOp::Delete {
            None
        } else {
            Some(encode_fields(table, &table.column_names(), |c| {
                json_get(data, c).cloned()
            })?)
        };
        Ok(true)
    }
}

/// Transformer for the partitioned single-topic dialect.
///
/// Each record names its source table in the envelope; rows for tables
/// outside the mapping are skipped. An update carries the changed
/// columns' prior values in `old`, which is how key changes are detected.
pub struct MaxwellTransformer {
    table_map: Arc<HashMap<String, String>>,
    tables: Arc<HashMap<String, Arc<Table>>>,
}

impl MaxwellTransformer {
    pub fn new(
        table_map: Arc<HashMap<String, String>>,
        tables: Arc<HashMap<String, Arc<Table>>>,
    ) -> Self {
        Self { table_map, tables }
    }
}

impl Transformer for MaxwellTransformer {
    fn transform(&self, record: &SourceRecord, row: &mut Row) -> Result<bool> {
        let Some(value) = record.value.as_deref().filter(|v| !v.trim().is_empty()) else {
            return Ok(false);
        };
        let envelope: Value = serde_json::from_str(value)
            .map_err(|e| SiltError::transform(format!("invalid record json: {e}")))?;

        let op = match envelope.get("type").and_then(Value::as_str) {
            Some("insert") => RowOp::Insert,
            Some("update") => RowOp::Update,
            Some("delete") => RowOp::Delete,
            // bootstrap-*, table-create and friends carry no row change
            Some(_) | None => return Ok(false),
        };
        let database = envelope
            .get("database")
            .and_then(Value::as_str)
            .ok_or_else(|| SiltError::transform("record has no database field"))?;
        let table_name = envelope
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| SiltError::transform("record has no table field"))?;
        let origin = format!("{database}.{table_name}");
        let Some(mapped) = self.table_map.get(&origin) else {
            return Ok(false);
        };
        let table = self.tables.get(mapped).ok_or_else(|| {
            SiltError::transform(format!("no metadata for target table {mapped}"))
        })?;

        let produce_time = envelope
            .get("ts")
            .and_then(Value::as_i64)
            .ok_or_else(|| SiltError::transform("record has no ts field"))?
            * 1000;
        let data = envelope
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(|| SiltError::transform("record has no data object"))?;

        row.op = op;
        row.produce_time = produce_time;
        row.origin_table = origin;
        row.mapped_table = mapped.clone();
        row.keys = encode_fields(table, &table.key_names, |c| json_get(data, c).cloned())?;
        row.old_keys = None;
        if op == RowOp::Update {
            if let Some(old) = envelope.get("old").and_then(Value::as_object) {
                let old_keys = encode_fields(table, &table.key_names, |c| {
                    json_get(old, c).or_else(|| json_get(data, c)).cloned()
                })?;
                if old_keys != row.keys {
                    row.old_keys = Some(old_keys);
                }
            }
        }
        row.tuple = if op == RowOp::Delete {
            None
        } else {
            Some(encode_fields(table, &table.column_names(), |c| {
                json_get(data, c).cloned()
            })?)
        };
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Column;

    fn users_table() -> Arc<Table> {
        Arc::new(Table {
            name: "analytics.users".to_string(),
            columns: vec![
                Column {
                    name: "id".to_string(),
                    ty: ColumnType::Other,
                    precision: 0,
                    scale: 0,
                },
                Column {
                    name: "name".to_string(),
                    ty: ColumnType::Text,
                    precision: 0,
                    scale: 0,
                },
                Column {
                    name: "price".to_string(),
                    ty: ColumnType::Numeric,
                    precision: 0,
                    scale: 2,
                },
            ],
            key_names: vec!["id".to_string()],
        })
    }

    fn debezium() -> DebeziumTransformer {
        let table_map = Arc::new(HashMap::from([(
            "orders.public.users".to_string(),
            "analytics.users".to_string(),
        )]));
        let tables = Arc::new(HashMap::from([(
            "analytics.users".to_string(),
            users_table(),
        )]));
        DebeziumTransformer::new("orders", table_map, tables)
    }

    fn record(value: &str) -> SourceRecord {
        SourceRecord {
            topic: "dbserver1.public.users".to_string(),
            value: Some(value.to_string()),
        }
    }

    #[test]
    fn test_debezium_insert_with_decimal() {
        // S6: base64 0x00989680 = 10,000,000 at scale 2 -> 100000.00
        let t = debezium();
        let mut row = Row::default();
        let ok = t
            .transform(
                &record(
                    r#"{"payload":{"op":"c","ts_ms":0,"after":{"id":1,"name":"a","price":"AJiWgA=="}}}"#,
                ),
                &mut row,
            )
            .unwrap();

        assert!(ok);
        assert_eq!(row.op, RowOp::Insert);
        assert_eq!(row.mapped_table, "analytics.users");
        assert_eq!(row.keys, "1\n");
        assert_eq!(row.tuple.as_deref(), Some("1|\"a\"|100000.00\n"));
    }

    #[test]
    fn test_debezium_delete_uses_before() {
        let t = debezium();
        let mut row = Row::default();
        let ok = t
            .transform(
                &record(r#"{"payload":{"op":"d","ts_ms":5,"before":{"id":2,"name":"b"}}}"#),
                &mut row,
            )
            .unwrap();

        assert!(ok);
        assert_eq!(row.op, RowOp::Delete);
        assert_eq!(row.keys, "2\n");
        assert!(row.tuple.is_none());
        assert_eq!(row.produce_time, 5);
    }

    #[test]
    fn test_debezium_benign_skips() {
        let t = debezium();
        let mut row = Row::default();

        // tombstone
        let tombstone = SourceRecord {
            topic: "dbserver1.public.users".to_string(),
            value: None,
        };
        assert!(!t.transform(&tombstone, &mut row).unwrap());

        // empty payload
        assert!(!t.transform(&record(r#"{"payload":null}"#), &mut row).unwrap());
        assert!(!t.transform(&record(r#"{"schema":{}}"#), &mut row).unwrap());
    }

    #[test]
    fn test_debezium_malformed_records() {
        let t = debezium();
        let mut row = Row::default();

        assert!(t.transform(&record("not json"), &mut row).is_err());
        assert!(t
            .transform(&record(r#"{"payload":{"ts_ms":0}}"#), &mut row)
            .is_err());
        assert!(t
            .transform(
                &record(r#"{"payload":{"op":"x","ts_ms":0,"after":{}}}"#),
                &mut row
            )
            .is_err());
    }

    #[test]
    fn test_debezium_null_fields_encode_empty() {
        let t = debezium();
        let mut row = Row::default();
        t.transform(
            &record(r#"{"payload":{"op":"c","ts_ms":0,"after":{"id":3,"name":null}}}"#),
            &mut row,
        )
        .unwrap();
        assert_eq!(row.tuple.as_deref(), Some("3||\n"));
    }

    #[test]
    fn test_debezium_field_lookup_ignores_case() {
        let t = debezium();
        let mut row = Row::default();
        t.transform(
            &record(r#"{"payload":{"op":"c","ts_ms":0,"after":{"ID":4,"NAME":"d"}}}"#),
            &mut row,
        )
        .unwrap();
        assert_eq!(row.keys, "4\n");
        assert_eq!(row.tuple.as_deref(), Some("4|\"d\"|\n"));
    }

    fn maxwell() -> MaxwellTransformer {
        let table_map = Arc::new(HashMap::from([(
            "shop.users".to_string(),
            "analytics.users".to_string(),
        )]));
        let tables = Arc::new(HashMap::from([(
            "analytics.users".to_string(),
            users_table(),
        )]));
        MaxwellTransformer::new(table_map, tables)
    }

    fn maxwell_record(value: &str) -> SourceRecord {
        SourceRecord {
            topic: "maxwell".to_string(),
            value: Some(value.to_string()),
        }
    }

    #[test]
    fn test_maxwell_insert() {
        let t = maxwell();
        let mut row = Row::default();
        let ok = t
            .transform(
                &maxwell_record(
                    r#"{"database":"shop","table":"users","type":"insert","ts":10,"data":{"id":1,"name":"a"}}"#,
                ),
                &mut row,
            )
            .unwrap();

        assert!(ok);
        assert_eq!(row.op, RowOp::Insert);
        assert_eq!(row.origin_table, "shop.users");
        assert_eq!(row.produce_time, 10_000);
        assert_eq!(row.keys, "1\n");
    }

    #[test]
    fn test_maxwell_update_with_key_change() {
        let t = maxwell();
        let mut row = Row::default();
        t.transform(
            &maxwell_record(
                r#"{"database":"shop","table":"users","type":"update","ts":10,"data":{"id":2,"name":"a"},"old":{"id":1}}"#,
            ),
            &mut row,
        )
        .unwrap();

        assert_eq!(row.keys, "2\n");
        assert_eq!(row.old_keys.as_deref(), Some("1\n"));
    }

    #[test]
    fn test_maxwell_update_without_key_change() {
        let t = maxwell();
        let mut row = Row::default();
        t.transform(
            &maxwell_record(
                r#"{"database":"shop","table":"users","type":"update","ts":10,"data":{"id":2,"name":"b"},"old":{"name":"a"}}"#,
            ),
            &mut row,
        )
        .unwrap();

        assert_eq!(row.keys, "2\n");
        assert!(row.old_keys.is_none());
    }

    #[test]
    fn test_maxwell_skips_non_dml_and_unmapped() {
        let t = maxwell();
        let mut row = Row::default();

        let ddl = r#"{"database":"shop","table":"users","type":"table-create","ts":10}"#;
        assert!(!t.transform(&maxwell_record(ddl), &mut row).unwrap());

        let unmapped =
            r#"{"database":"shop","table":"audit","type":"insert","ts":10,"data":{"id":1}}"#;
        assert!(!t.transform(&maxwell_record(unmapped), &mut row).unwrap());
    }
}
