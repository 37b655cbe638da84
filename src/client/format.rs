//! Row encodings for stream load requests.
//!
//! A `RowSerializer` turns a batch into the request body and contributes the
//! format headers the store needs to parse it.

use crate::models::{Batch, ColumnSpec, Config, ConfigError, LoadError, Record, SinkFormat, Value};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// Encodes batches for the sink.
pub trait RowSerializer: Send + Sync {
    /// Encode all records of a batch into one request body.
    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, LoadError>;

    /// Format headers sent with every load request.
    fn headers(&self) -> Vec<(&'static str, String)>;

    /// Byte sequences that must never appear inside a field value.
    fn reserved_sequences(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

/// Build the serializer selected by `sink.format`.
pub fn serializer_from_config(config: &Config) -> Result<Arc<dyn RowSerializer>, ConfigError> {
    match config.sink.format {
        SinkFormat::Csv => Ok(Arc::new(DelimitedSerializer::from_config(config)?)),
        SinkFormat::Json => Ok(Arc::new(JsonSerializer::new(config.schema.columns.clone()))),
    }
}

/// Delimited text: values joined by a column separator, rows by a row delimiter.
///
/// Values must not contain either sequence; the transform stage rejects such
/// records before they reach the buffer.
#[derive(Debug, Clone)]
pub struct DelimitedSerializer {
    column_separator: Vec<u8>,
    row_delimiter: Vec<u8>,
    /// Header spelling of the separators, e.g. "\x01"
    column_separator_header: String,
    row_delimiter_header: String,
    columns: Vec<String>,
}

impl DelimitedSerializer {
    pub fn new(
        column_separator: Vec<u8>,
        row_delimiter: Vec<u8>,
        column_separator_header: String,
        row_delimiter_header: String,
        columns: Vec<String>,
    ) -> Self {
        Self {
            column_separator,
            row_delimiter,
            column_separator_header,
            row_delimiter_header,
            columns,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.sink.column_separator_bytes()?,
            config.sink.row_delimiter_bytes()?,
            config.sink.column_separator.clone(),
            config.sink.row_delimiter.clone(),
            config
                .schema
                .columns
                .iter()
                .map(|c| c.name.clone())
                .collect(),
        ))
    }

    /// Encode a single record without a trailing row delimiter.
    pub fn encode_record(&self, record: &Record, out: &mut Vec<u8>) {
        for (i, value) in record.values.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(&self.column_separator);
            }
            out.extend_from_slice(value.to_string().as_bytes());
        }
    }

    /// Split an encoded body back into rows of raw field strings.
    pub fn decode(&self, body: &[u8]) -> Result<Vec<Vec<String>>, LoadError> {
        if body.is_empty() {
            return Ok(Vec::new());
        }
        split_on(body, &self.row_delimiter)
            .into_iter()
            .map(|row| {
                split_on(row, &self.column_separator)
                    .into_iter()
                    .map(|field| {
                        String::from_utf8(field.to_vec())
                            .map_err(|e| LoadError::Encoding(format!("invalid utf-8 field: {e}")))
                    })
                    .collect()
            })
            .collect()
    }
}

fn split_on<'a>(data: &'a [u8], separator: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + separator.len() <= data.len() {
        if &data[i..i + separator.len()] == separator {
            parts.push(&data[start..i]);
            i += separator.len();
            start = i;
        } else {
            i += 1;
        }
    }
    parts.push(&data[start..]);
    parts
}

impl RowSerializer for DelimitedSerializer {
    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, LoadError> {
        let mut out = Vec::with_capacity(batch.byte_size() + batch.len());
        for (i, record) in batch.records.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(&self.row_delimiter);
            }
            self.encode_record(record, &mut out);
        }
        Ok(out)
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("format", "csv".to_string()),
            ("column_separator", self.column_separator_header.clone()),
            ("row_delimiter", self.row_delimiter_header.clone()),
            ("columns", self.columns.join(",")),
        ]
    }

    fn reserved_sequences(&self) -> Vec<Vec<u8>> {
        vec![self.column_separator.clone(), self.row_delimiter.clone()]
    }
}

/// JSON array of objects keyed by column name, sent with `strip_outer_array`.
#[derive(Debug, Clone)]
pub struct JsonSerializer {
    columns: Vec<ColumnSpec>,
}

impl JsonSerializer {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    fn to_object(&self, record: &Record) -> Result<JsonValue, LoadError> {
        if record.values.len() != self.columns.len() {
            return Err(LoadError::Encoding(format!(
                "record has {} values for {} columns",
                record.values.len(),
                self.columns.len()
            )));
        }
        let mut object = Map::with_capacity(self.columns.len());
        for (column, value) in self.columns.iter().zip(&record.values) {
            let json = match value {
                Value::Int(v) => JsonValue::from(*v),
                Value::Str(s) => JsonValue::from(s.as_str()),
                Value::Null => JsonValue::Null,
            };
            object.insert(column.name.clone(), json);
        }
        Ok(JsonValue::Object(object))
    }
}

impl RowSerializer for JsonSerializer {
    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, LoadError> {
        let rows = batch
            .records
            .iter()
            .map(|r| self.to_object(r))
            .collect::<Result<Vec<_>, _>>()?;
        serde_json::to_vec(&rows).map_err(|e| LoadError::Encoding(e.to_string()))
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("format", "json".to_string()),
            ("strip_outer_array", "true".to_string()),
        ]
    }
}
