//! Driver-independent result shape and the MySQL row conversion into it.

use bigdecimal::BigDecimal;
use serde::ser::{Serialize, Serializer};
use sqlx::mysql::MySqlRow;
use sqlx::{Column as _, Row as _, TypeInfo, ValueRef};

/// The small, fixed set of types callers see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Text,
    Integer,
    Decimal,
    Boolean,
    DateTime,
    Binary,
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    /// Exact decimal, rendered as a string to keep its precision.
    Decimal(BigDecimal),
    Text(String),
    /// Date, time or timestamp in ISO 8601 form.
    DateTime(String),
    /// Opaque bytes; only the length is exposed.
    Binary(Vec<u8>),
}

impl ScalarValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::Text(s) | ScalarValue::DateTime(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for ScalarValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ScalarValue::Null => serializer.serialize_none(),
            ScalarValue::Boolean(b) => serializer.serialize_bool(*b),
            ScalarValue::Integer(i) => serializer.serialize_i64(*i),
            ScalarValue::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            ScalarValue::Float(f) => serializer.serialize_str(&f.to_string()),
            ScalarValue::Decimal(d) => serializer.serialize_str(&d.to_string()),
            ScalarValue::Text(s) | ScalarValue::DateTime(s) => serializer.serialize_str(s),
            ScalarValue::Binary(bytes) => {
                serializer.serialize_str(&format!("<binary {} bytes>", bytes.len()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Column {
    pub name: String,
    pub semantic_type: SemanticType,
    pub native_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, native_type: impl Into<String>) -> Self {
        let native_type = native_type.into();
        Self {
            name: name.into(),
            semantic_type: semantic_type_for(&native_type),
            native_type,
        }
    }
}

/// One result row; values line up with the result's columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub values: Vec<ScalarValue>,
}

impl Row {
    pub fn new(values: Vec<ScalarValue>) -> Self {
        Self { values }
    }

    pub fn get<'a>(&'a self, columns: &[Column], name: &str) -> Option<&'a ScalarValue> {
        columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .and_then(|i| self.values.get(i))
    }

    /// Row as a JSON object keyed by column name. With duplicate column names
    /// the last one wins.
    pub fn to_json(&self, columns: &[Column]) -> serde_json::Value {
        let mut object = serde_json::Map::with_capacity(columns.len());
        for (column, value) in columns.iter().zip(&self.values) {
            object.insert(column.name.clone(), value.to_json());
        }
        serde_json::Value::Object(object)
    }
}

/// Maps a MySQL type name, as reported by the driver, to its semantic type.
pub fn semantic_type_for(native: &str) -> SemanticType {
    let upper = native.to_ascii_uppercase();
    let base = upper.strip_suffix(" UNSIGNED").unwrap_or(&upper);
    match base {
        "BOOLEAN" | "BOOL" => SemanticType::Boolean,
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" | "YEAR" | "BIT" => {
            SemanticType::Integer
        }
        "FLOAT" | "DOUBLE" | "REAL" | "DECIMAL" | "NUMERIC" => SemanticType::Decimal,
        "DATE" | "TIME" | "DATETIME" | "TIMESTAMP" => SemanticType::DateTime,
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "GEOMETRY" => {
            SemanticType::Binary
        }
        "NULL" => SemanticType::Null,
        _ => SemanticType::Text,
    }
}

pub fn columns_of(row: &MySqlRow) -> Vec<Column> {
    row.columns()
        .iter()
        .map(|c| Column::new(c.name(), c.type_info().name()))
        .collect()
}

pub fn normalize_row(row: &MySqlRow, columns: &[Column]) -> Row {
    let values = columns
        .iter()
        .enumerate()
        .map(|(i, column)| scalar_at(row, i, column))
        .collect();
    Row::new(values)
}

fn scalar_at(row: &MySqlRow, index: usize, column: &Column) -> ScalarValue {
    match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return ScalarValue::Null,
        Ok(_) => {}
        Err(_) => return unrepresentable(column),
    }

    let native = column.native_type.to_ascii_uppercase();
    let decoded = match column.semantic_type {
        SemanticType::Boolean => row.try_get::<bool, _>(index).ok().map(ScalarValue::Boolean),
        SemanticType::Integer => decode_integer(row, index),
        SemanticType::Decimal => decode_decimal(row, index, &native),
        SemanticType::DateTime => decode_datetime(row, index, &native),
        SemanticType::Binary => row.try_get::<Vec<u8>, _>(index).ok().map(ScalarValue::Binary),
        SemanticType::Text => row.try_get::<String, _>(index).ok().map(ScalarValue::Text),
        SemanticType::Null => Some(ScalarValue::Null),
    };
    decoded.unwrap_or_else(|| degrade_to_text(row, index, column))
}

fn decode_integer(row: &MySqlRow, index: usize) -> Option<ScalarValue> {
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Some(ScalarValue::Integer(v));
    }
    match row.try_get::<u64, _>(index) {
        Ok(v) => Some(match i64::try_from(v) {
            Ok(v) => ScalarValue::Integer(v),
            Err(_) => ScalarValue::Decimal(BigDecimal::from(v)),
        }),
        Err(_) => None,
    }
}

fn decode_decimal(row: &MySqlRow, index: usize, native: &str) -> Option<ScalarValue> {
    if native.starts_with("DECIMAL") || native.starts_with("NUMERIC") {
        return row.try_get::<BigDecimal, _>(index).ok().map(ScalarValue::Decimal);
    }
    row.try_get::<f64, _>(index)
        .or_else(|_| row.try_get::<f32, _>(index).map(f64::from))
        .ok()
        .map(ScalarValue::Float)
}

fn decode_datetime(row: &MySqlRow, index: usize, native: &str) -> Option<ScalarValue> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    let text = match native {
        "DATE" => row.try_get::<NaiveDate, _>(index).ok().map(|d| d.to_string()),
        "TIME" => row.try_get::<NaiveTime, _>(index).ok().map(|t| t.to_string()),
        "DATETIME" => row
            .try_get::<NaiveDateTime, _>(index)
            .ok()
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        "TIMESTAMP" => row
            .try_get::<DateTime<Utc>, _>(index)
            .ok()
            .map(|dt| dt.to_rfc3339()),
        _ => None,
    };
    text.map(ScalarValue::DateTime)
}

/// Values the typed decoders cannot handle (negative TIME, JSON, spatial
/// types…) come back as text rather than failing the whole result.
fn degrade_to_text(row: &MySqlRow, index: usize, column: &Column) -> ScalarValue {
    if let Ok(s) = row.try_get_unchecked::<String, _>(index) {
        return ScalarValue::Text(s);
    }
    match row.try_get_unchecked::<Vec<u8>, _>(index) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(s) => ScalarValue::Text(s),
            Err(e) => ScalarValue::Binary(e.into_bytes()),
        },
        Err(_) => unrepresentable(column),
    }
}

fn unrepresentable(column: &Column) -> ScalarValue {
    ScalarValue::Text(format!("<{}>", column.native_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_semantic_type_mapping() {
        assert_eq!(semantic_type_for("BOOLEAN"), SemanticType::Boolean);
        assert_eq!(semantic_type_for("INT"), SemanticType::Integer);
        assert_eq!(semantic_type_for("BIGINT UNSIGNED"), SemanticType::Integer);
        assert_eq!(semantic_type_for("DECIMAL"), SemanticType::Decimal);
        assert_eq!(semantic_type_for("double"), SemanticType::Decimal);
        assert_eq!(semantic_type_for("DATETIME"), SemanticType::DateTime);
        assert_eq!(semantic_type_for("VARBINARY"), SemanticType::Binary);
        assert_eq!(semantic_type_for("VARCHAR"), SemanticType::Text);
        assert_eq!(semantic_type_for("JSON"), SemanticType::Text);
        assert_eq!(semantic_type_for("ENUM"), SemanticType::Text);
        assert_eq!(semantic_type_for("NULL"), SemanticType::Null);
    }

    #[test]
    fn test_scalar_serialization() {
        let decimal = BigDecimal::from_str("12345678901234567890.123456789").unwrap();
        assert_eq!(
            ScalarValue::Decimal(decimal).to_json(),
            json!("12345678901234567890.123456789")
        );
        assert_eq!(ScalarValue::Integer(-4).to_json(), json!(-4));
        assert_eq!(ScalarValue::Float(1.5).to_json(), json!(1.5));
        assert_eq!(ScalarValue::Float(f64::NAN).to_json(), json!("NaN"));
        assert_eq!(ScalarValue::Boolean(true).to_json(), json!(true));
        assert_eq!(ScalarValue::Null.to_json(), json!(null));
        assert_eq!(
            ScalarValue::Binary(vec![0, 1, 2]).to_json(),
            json!("<binary 3 bytes>")
        );
    }

    #[test]
    fn test_row_to_json_and_lookup() {
        let columns = vec![Column::new("id", "INT"), Column::new("Name", "VARCHAR")];
        let row = Row::new(vec![ScalarValue::Integer(7), ScalarValue::Text("Ada".into())]);
        assert_eq!(row.to_json(&columns), json!({"id": 7, "Name": "Ada"}));
        assert_eq!(row.get(&columns, "name"), Some(&ScalarValue::Text("Ada".into())));
        assert_eq!(row.get(&columns, "missing"), None);
    }
}
