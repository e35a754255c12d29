//! Target table metadata
//!
//! Column order, column types, and primary-key columns are discovered once
//! at startup from the target's catalogs and are read-only afterwards.
//! Loaders build COPY column lists and DELETE predicates from this,
//! transformers pick their decode path per column.

use crate::error::{Result, SiltError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_postgres::Client;
use tracing::info;

/// Decode/encode category of a target column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// NUMERIC/DECIMAL, upstream-encoded as scaled base64 integers
    Numeric,
    /// DATE, upstream-encoded as days since epoch
    Date,
    /// TIME, upstream-encoded as milliseconds
    Time,
    /// TIMESTAMP, upstream-encoded as milliseconds
    Timestamp,
    /// BIT/BIT VARYING, upstream-encoded as base64 little-endian bytes
    Bit,
    /// BYTEA, upstream-encoded as base64
    Binary,
    /// Character types, CSV-quoted on encode
    Text,
    /// Everything else passes through verbatim
    Other,
}

impl ColumnType {
    /// Map an `information_schema` data type name.
    pub fn from_data_type(data_type: &str) -> Self {
        match data_type {
            "numeric" | "decimal" => ColumnType::Numeric,
            "date" => ColumnType::Date,
            "time without time zone" | "time with time zone" => ColumnType::Time,
            "timestamp without time zone" | "timestamp with time zone" => ColumnType::Timestamp,
            "bit" | "bit varying" => ColumnType::Bit,
            "bytea" => ColumnType::Binary,
            "character" | "character varying" | "text" => ColumnType::Text,
            _ => ColumnType::Other,
        }
    }
}

/// One target column.
#[derive(Debug, Clone)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Decode category
    pub ty: ColumnType,
    /// Declared precision (bit length for bit columns)
    pub precision: i32,
    /// Declared scale (numeric columns)
    pub scale: i32,
}

/// Target-side table descriptor.
#[derive(Debug, Clone)]
pub struct Table {
    /// Fully-qualified name, `schema.table`
    pub name: String,
    /// Columns in catalog order
    pub columns: Vec<Column>,
    /// Primary-key column names in index order
    pub key_names: Vec<String>,
}

impl Table {
    /// Ordered column names, the COPY column list for inserts.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Look up a column case-insensitively.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

fn split_qualified(name: &str) -> Result<(&str, &str)> {
    name.split_once('.').ok_or_else(|| {
        SiltError::catalog(format!("target table {name:?} is not schema-qualified"))
    })
}

/// Discover metadata for every mapped target table.
///
/// Fails startup on a missing table or a table without a primary key; the
/// delete protocol cannot work without one.
pub async fn discover_tables<'a>(
    client: &Client,
    mapped: impl IntoIterator<Item = &'a String>,
) -> Result<HashMap<String, Arc<Table>>> {
    let mut tables = HashMap::new();
    for fullname in mapped {
        if tables.contains_key(fullname) {
            continue;
        }
        let table = discover_table(client, fullname).await?;
        tables.insert(fullname.clone(), Arc::new(table));
    }
    info!(count = tables.len(), "discovered target table metadata");
    Ok(tables)
}

async fn discover_table(client: &Client, fullname: &str) -> Result<Table> {
    let (schema, name) = split_qualified(fullname)?;

    let rows = client
        .query(
            "SELECT column_name::text, data_type::text, \
                    coalesce(character_maximum_length, 0)::int, \
                    coalesce(numeric_scale, 0)::int \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
            &[&schema, &name],
        )
        .await?;
    if rows.is_empty() {
        return Err(SiltError::catalog(format!(
            "target table {fullname} does not exist"
        )));
    }
    let columns = rows
        .iter()
        .map(|row| {
            let data_type: String = row.get(1);
            Column {
                name: row.get(0),
                ty: ColumnType::from_data_type(&data_type),
                precision: row.get(2),
                scale: row.get(3),
            }
        })
        .collect();

    let rows = client
        .query(
            "SELECT a.attname::text \
             FROM pg_index i \
             JOIN pg_attribute a \
               ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = $1::regclass AND i.indisprimary \
             ORDER BY array_position(i.indkey::smallint[], a.attnum)",
            &[&fullname],
        )
        .await?;
    let key_names: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
    if key_names.is_empty() {
        return Err(SiltError::catalog(format!(
            "target table {fullname} has no primary key"
        )));
    }

    Ok(Table {
        name: fullname.to_string(),
        columns,
        key_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_mapping() {
        assert_eq!(ColumnType::from_data_type("numeric"), ColumnType::Numeric);
        assert_eq!(ColumnType::from_data_type("date"), ColumnType::Date);
        assert_eq!(
            ColumnType::from_data_type("time without time zone"),
            ColumnType::Time
        );
        assert_eq!(
            ColumnType::from_data_type("timestamp with time zone"),
            ColumnType::Timestamp
        );
        assert_eq!(ColumnType::from_data_type("bit varying"), ColumnType::Bit);
        assert_eq!(ColumnType::from_data_type("bytea"), ColumnType::Binary);
        assert_eq!(ColumnType::from_data_type("text"), ColumnType::Text);
        assert_eq!(ColumnType::from_data_type("integer"), ColumnType::Other);
    }

    #[test]
    fn test_column_lookup_is_case_insensitive() {
        let table = Table {
            name: "public.users".to_string(),
            columns: vec![Column {
                name: "UserId".to_string(),
                ty: ColumnType::Other,
                precision: 0,
                scale: 0,
            }],
            key_names: vec!["UserId".to_string()],
        };
        assert!(table.column("userid").is_some());
        assert!(table.column("USERID").is_some());
        assert!(table.column("missing").is_none());
    }

    #[test]
    fn test_split_qualified() {
        assert_eq!(split_qualified("public.users").unwrap(), ("public", "users"));
        assert!(split_qualified("users").is_err());
    }
}
