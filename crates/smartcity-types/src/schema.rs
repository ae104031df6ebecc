//! Fixed field layout of each event stream.
//!
//! The layout is a static value table: the decoder walks it to validate and
//! coerce incoming JSON, and the Parquet encoder walks it to derive the
//! columnar schema.  There is no mutation API.

use crate::error::SchemaError;
use crate::StreamKind;

/// Semantic type of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    String,
    Double,
    Integer,
    Timestamp,
    Struct(&'static [FieldSpec]),
}

impl FieldType {
    /// Human-readable name, used in decode errors.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Double => "double",
            Self::Integer => "integer",
            Self::Timestamp => "timestamp",
            Self::Struct(_) => "struct",
        }
    }
}

/// A single field of a stream schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            nullable: false,
        }
    }

    pub const fn nullable(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            nullable: true,
        }
    }
}

/// Schema of one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSchema {
    pub kind: StreamKind,
    pub fields: &'static [FieldSpec],
}

impl StreamSchema {
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

const LOCATION: &[FieldSpec] = &[
    FieldSpec::nullable("latitude", FieldType::Double),
    FieldSpec::nullable("longitude", FieldType::Double),
];

const VEHICLE: &[FieldSpec] = &[
    FieldSpec::required("id", FieldType::String),
    FieldSpec::nullable("device_id", FieldType::String),
    FieldSpec::required("timestamp", FieldType::Timestamp),
    FieldSpec::nullable("location", FieldType::Struct(LOCATION)),
    FieldSpec::nullable("speed", FieldType::Double),
    FieldSpec::nullable("direction", FieldType::String),
    FieldSpec::nullable("make", FieldType::String),
    FieldSpec::nullable("model", FieldType::String),
    FieldSpec::nullable("year", FieldType::Integer),
    FieldSpec::nullable("fuel_type", FieldType::String),
];

const GPS: &[FieldSpec] = &[
    FieldSpec::required("id", FieldType::String),
    FieldSpec::nullable("device_id", FieldType::String),
    FieldSpec::required("timestamp", FieldType::Timestamp),
    FieldSpec::nullable("speed", FieldType::Double),
    FieldSpec::nullable("direction", FieldType::String),
    FieldSpec::nullable("vehicle_type", FieldType::String),
];

const TRAFFIC: &[FieldSpec] = &[
    FieldSpec::required("id", FieldType::String),
    FieldSpec::nullable("device_id", FieldType::String),
    FieldSpec::nullable("cameraId", FieldType::String),
    FieldSpec::nullable("location", FieldType::String),
    FieldSpec::required("timestamp", FieldType::Timestamp),
    FieldSpec::nullable("snapshot", FieldType::String),
];

const WEATHER: &[FieldSpec] = &[
    FieldSpec::required("id", FieldType::String),
    FieldSpec::nullable("device_id", FieldType::String),
    FieldSpec::nullable("location", FieldType::Struct(LOCATION)),
    FieldSpec::required("timestamp", FieldType::Timestamp),
    FieldSpec::nullable("temperature", FieldType::Double),
    FieldSpec::nullable("weatherCondition", FieldType::String),
    FieldSpec::nullable("precipitation", FieldType::Double),
    FieldSpec::nullable("windspeed", FieldType::Double),
    FieldSpec::nullable("humidity", FieldType::Integer),
    FieldSpec::nullable("AQI", FieldType::Double),
];

const EMERGENCY: &[FieldSpec] = &[
    FieldSpec::required("id", FieldType::String),
    FieldSpec::nullable("device_id", FieldType::String),
    FieldSpec::nullable("incidentId", FieldType::String),
    FieldSpec::nullable("type", FieldType::String),
    FieldSpec::required("timestamp", FieldType::Timestamp),
    FieldSpec::nullable("location", FieldType::String),
    FieldSpec::nullable("status", FieldType::String),
    FieldSpec::nullable("description", FieldType::String),
];

static SCHEMAS: [StreamSchema; 5] = [
    StreamSchema {
        kind: StreamKind::Vehicle,
        fields: VEHICLE,
    },
    StreamSchema {
        kind: StreamKind::Gps,
        fields: GPS,
    },
    StreamSchema {
        kind: StreamKind::Traffic,
        fields: TRAFFIC,
    },
    StreamSchema {
        kind: StreamKind::Weather,
        fields: WEATHER,
    },
    StreamSchema {
        kind: StreamKind::Emergency,
        fields: EMERGENCY,
    },
];

/// Read-only registry of stream schemas.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchemaRegistry;

impl SchemaRegistry {
    pub const fn new() -> Self {
        Self
    }

    /// Returns the schema registered for `kind`.
    pub fn schema_for(&self, kind: StreamKind) -> &'static StreamSchema {
        // `SCHEMAS` is indexed in `StreamKind::ALL` order.
        &SCHEMAS[kind as usize]
    }

    /// Looks up a schema by stream name, e.g., from configuration.
    pub fn schema_for_name(&self, name: &str) -> Result<&'static StreamSchema, SchemaError> {
        let kind: StreamKind = name.parse()?;
        Ok(self.schema_for(kind))
    }
}
