//! Transform stage: raw string fields to typed records.

use crate::client::RowSerializer;
use crate::models::{ColumnSpec, ColumnType, Config, RawRecord, Record, TransformError, Value};

/// Raw field spelling of SQL NULL.
const NULL_MARKER: &str = "\\N";

/// Maps a raw record to a typed record.
///
/// Implementations must be deterministic and free of I/O so that replayed
/// records produce identical output.
pub trait Transform: Send + Sync {
    fn transform(&self, raw: &RawRecord) -> Result<Record, TransformError>;
}

/// Schema-driven transform.
#[derive(Debug, Clone)]
pub struct SchemaTransform {
    columns: Vec<ColumnSpec>,
    /// Byte sequences no encoded value may contain
    reserved: Vec<Vec<u8>>,
}

impl SchemaTransform {
    pub fn new(columns: Vec<ColumnSpec>, reserved: Vec<Vec<u8>>) -> Self {
        Self { columns, reserved }
    }

    /// Transform for the configured schema, guarding the serializer's framing.
    pub fn from_config(config: &Config, serializer: &dyn RowSerializer) -> Self {
        Self::new(config.schema.columns.clone(), serializer.reserved_sequences())
    }

    fn convert(&self, column: &ColumnSpec, field: &str) -> Result<Value, TransformError> {
        if field == NULL_MARKER {
            return Ok(Value::Null);
        }

        let parse_error = || TransformError::Parse {
            column: column.name.clone(),
            value: field.to_string(),
            kind: column.kind.to_string(),
        };

        let value = match column.kind {
            ColumnType::Int => {
                let v: i32 = field.trim().parse().map_err(|_| parse_error())?;
                Value::Int(v as i64)
            }
            ColumnType::Bigint => Value::Int(field.trim().parse().map_err(|_| parse_error())?),
            ColumnType::Varchar => {
                match column.length {
                    Some(max) if field.len() > max => {
                        return Err(TransformError::ValueTooLong {
                            column: column.name.clone(),
                            len: field.len(),
                            max,
                        });
                    }
                    _ => {}
                }
                Value::Str(field.to_string())
            }
        };

        let encoded = value.to_string();
        if self
            .reserved
            .iter()
            .any(|seq| contains(encoded.as_bytes(), seq))
        {
            return Err(TransformError::DelimiterCollision {
                column: column.name.clone(),
            });
        }
        Ok(value)
    }
}

impl Transform for SchemaTransform {
    fn transform(&self, raw: &RawRecord) -> Result<Record, TransformError> {
        if raw.fields.len() != self.columns.len() {
            return Err(TransformError::FieldCount {
                expected: self.columns.len(),
                actual: raw.fields.len(),
            });
        }

        let values = self
            .columns
            .iter()
            .zip(&raw.fields)
            .map(|(column, field)| self.convert(column, field))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Record::new(values))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
