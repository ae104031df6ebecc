//! Parquet encoder.
//!
//! Converts a batch of records of one stream into an Arrow [`RecordBatch`]
//! whose schema is derived from the stream's [`StreamSchema`], and writes it
//! as a complete, self-contained Parquet file.

use std::sync::Arc;

use ::parquet::arrow::ArrowWriter;
use ::parquet::basic::Compression;
use ::parquet::errors::ParquetError;
use ::parquet::file::properties::WriterProperties;
use arrow::array::{
    ArrayBuilder, ArrayRef, Float64Builder, Int32Builder, RecordBatch, StringBuilder,
    StructArray, TimestampMicrosecondBuilder,
};
use arrow::buffer::NullBuffer;
use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use bytes::Bytes;
use smartcity_types::record::{ColumnValue, EventRecord, Location};
use smartcity_types::schema::{FieldSpec, FieldType, StreamSchema};
use thiserror::Error as ThisError;


/// Time zone attached to every timestamp column.
pub const TIMESTAMP_TIME_ZONE: &str = "UTC";

#[derive(Debug, ThisError)]
pub enum EncodeError {
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("record of stream '{found}' in a batch of stream '{expected}'")]
    WrongStream {
        expected: smartcity_types::StreamKind,
        found: smartcity_types::StreamKind,
    },

    #[error("unsupported nested field type for '{0}'")]
    UnsupportedNestedField(String),
}

fn data_type(field_type: &FieldType) -> DataType {
    match field_type {
        FieldType::String => DataType::Utf8,
        FieldType::Double => DataType::Float64,
        FieldType::Integer => DataType::Int32,
        FieldType::Timestamp => {
            DataType::Timestamp(TimeUnit::Microsecond, Some(TIMESTAMP_TIME_ZONE.into()))
        }
        FieldType::Struct(fields) => DataType::Struct(arrow_fields(fields)),
    }
}

fn arrow_fields(fields: &[FieldSpec]) -> Fields {
    Fields::from(
        fields
            .iter()
            .map(|f| Field::new(f.name, data_type(&f.field_type), f.nullable))
            .collect::<Vec<_>>(),
    )
}

/// Arrow schema of the Parquet files written for `schema`.
pub fn arrow_schema(schema: &StreamSchema) -> SchemaRef {
    Arc::new(Schema::new(arrow_fields(schema.fields)))
}

/// Converts `records` into a single Arrow record batch.
pub fn to_record_batch(
    schema: &StreamSchema,
    records: &[EventRecord],
) -> Result<RecordBatch, EncodeError> {
    if let Some(record) = records.iter().find(|r| r.kind() != schema.kind) {
        return Err(EncodeError::WrongStream {
            expected: schema.kind,
            found: record.kind(),
        });
    }
    let columns = schema
        .fields
        .iter()
        .map(|field| column(field, records))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(arrow_schema(schema), columns)?)
}

fn column(field: &FieldSpec, records: &[EventRecord]) -> Result<ArrayRef, EncodeError> {
    let values = records.iter().map(|r| r.column(field.name));
    Ok(match &field.field_type {
        FieldType::String => {
            let mut builder = StringBuilder::new();
            for value in values {
                match value {
                    ColumnValue::String(s) => builder.append_value(s),
                    _ => builder.append_null(),
                }
            }
            finish(builder)
        }
        FieldType::Double => {
            let mut builder = Float64Builder::with_capacity(records.len());
            for value in values {
                match value {
                    ColumnValue::Double(d) => builder.append_value(d),
                    _ => builder.append_null(),
                }
            }
            finish(builder)
        }
        FieldType::Integer => {
            let mut builder = Int32Builder::with_capacity(records.len());
            for value in values {
                match value {
                    ColumnValue::Integer(i) => builder.append_value(i),
                    _ => builder.append_null(),
                }
            }
            finish(builder)
        }
        FieldType::Timestamp => {
            let mut builder = TimestampMicrosecondBuilder::with_capacity(records.len())
                .with_timezone(TIMESTAMP_TIME_ZONE);
            for value in values {
                match value {
                    ColumnValue::Timestamp(ts) => builder.append_value(ts.timestamp_micros()),
                    _ => builder.append_null(),
                }
            }
            finish(builder)
        }
        FieldType::Struct(children) => {
            let locations: Vec<Option<&Location>> = values
                .map(|value| match value {
                    ColumnValue::Location(location) => Some(location),
                    _ => None,
                })
                .collect();
            location_column(field.name, children, &locations)?
        }
    })
}

fn finish(mut builder: impl ArrayBuilder) -> ArrayRef {
    builder.finish()
}

/// Builds a struct column from nested coordinate values.  Every child of the
/// struct must be a `double` named after a [`Location`] member.
fn location_column(
    name: &str,
    children: &[FieldSpec],
    locations: &[Option<&Location>],
) -> Result<ArrayRef, EncodeError> {
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(children.len());
    for child in children {
        let member: fn(&Location) -> Option<f64> = match (child.name, &child.field_type) {
            ("latitude", FieldType::Double) => |l| l.latitude,
            ("longitude", FieldType::Double) => |l| l.longitude,
            _ => {
                return Err(EncodeError::UnsupportedNestedField(format!(
                    "{name}.{}",
                    child.name
                )))
            }
        };
        let mut builder = Float64Builder::with_capacity(locations.len());
        for location in locations {
            builder.append_option(location.and_then(member));
        }
        arrays.push(finish(builder));
    }
    let nulls = NullBuffer::from(locations.iter().map(Option::is_some).collect::<Vec<_>>());
    Ok(Arc::new(StructArray::try_new(
        arrow_fields(children),
        arrays,
        Some(nulls),
    )?))
}

/// Encodes `records` as one Parquet file.
pub fn encode(schema: &StreamSchema, records: &[EventRecord]) -> Result<Bytes, EncodeError> {
    let batch = to_record_batch(schema, records)?;
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(
        &mut buffer,
        batch.schema(),
        Some(
            WriterProperties::builder()
                .set_compression(Compression::SNAPPY)
                .build(),
        ),
    )?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(Bytes::from(buffer))
}
