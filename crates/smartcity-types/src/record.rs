//! Decoded event records.
//!
//! Records are produced by the JSON decoder from a raw payload and are
//! immutable afterwards.  Field names follow the JSON emitted by the
//! device simulators, including their mixed casing (`cameraId`, `AQI`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::StreamKind;

/// Geographic coordinates attached to vehicle and weather readings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub id: String,
    pub device_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub location: Option<Location>,
    pub speed: Option<f64>,
    pub direction: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub fuel_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsRecord {
    pub id: String,
    pub device_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub speed: Option<f64>,
    pub direction: Option<String>,
    pub vehicle_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub id: String,
    pub device_id: Option<String>,
    #[serde(rename = "cameraId")]
    pub camera_id: Option<String>,
    pub location: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub snapshot: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub id: String,
    pub device_id: Option<String>,
    pub location: Option<Location>,
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    #[serde(rename = "weatherCondition")]
    pub weather_condition: Option<String>,
    pub precipitation: Option<f64>,
    pub windspeed: Option<f64>,
    pub humidity: Option<i32>,
    #[serde(rename = "AQI")]
    pub aqi: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmergencyRecord {
    pub id: String,
    pub device_id: Option<String>,
    #[serde(rename = "incidentId")]
    pub incident_id: Option<String>,
    #[serde(rename = "type")]
    pub incident_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub location: Option<String>,
    pub status: Option<String>,
    pub description: Option<String>,
}

/// A decoded event of any kind.
#[derive(Clone, Debug, PartialEq)]
pub enum EventRecord {
    Vehicle(VehicleRecord),
    Gps(GpsRecord),
    Traffic(TrafficRecord),
    Weather(WeatherRecord),
    Emergency(EmergencyRecord),
}

/// Value of one top-level column of a record, borrowed from the record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ColumnValue<'a> {
    Null,
    String(&'a str),
    Double(f64),
    Integer(i32),
    Timestamp(DateTime<Utc>),
    Location(&'a Location),
}

impl<'a> From<&'a Option<String>> for ColumnValue<'a> {
    fn from(value: &'a Option<String>) -> Self {
        value.as_deref().map_or(Self::Null, Self::String)
    }
}

impl From<&Option<f64>> for ColumnValue<'_> {
    fn from(value: &Option<f64>) -> Self {
        value.map_or(Self::Null, Self::Double)
    }
}

impl From<&Option<i32>> for ColumnValue<'_> {
    fn from(value: &Option<i32>) -> Self {
        value.map_or(Self::Null, Self::Integer)
    }
}

impl<'a> From<&'a Option<Location>> for ColumnValue<'a> {
    fn from(value: &'a Option<Location>) -> Self {
        value.as_ref().map_or(Self::Null, Self::Location)
    }
}

impl EventRecord {
    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Vehicle(_) => StreamKind::Vehicle,
            Self::Gps(_) => StreamKind::Gps,
            Self::Traffic(_) => StreamKind::Traffic,
            Self::Weather(_) => StreamKind::Weather,
            Self::Emergency(_) => StreamKind::Emergency,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Vehicle(r) => &r.id,
            Self::Gps(r) => &r.id,
            Self::Traffic(r) => &r.id,
            Self::Weather(r) => &r.id,
            Self::Emergency(r) => &r.id,
        }
    }

    /// Event time of the record.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Vehicle(r) => r.timestamp,
            Self::Gps(r) => r.timestamp,
            Self::Traffic(r) => r.timestamp,
            Self::Weather(r) => r.timestamp,
            Self::Emergency(r) => r.timestamp,
        }
    }

    /// Serializes the record as the JSON object it was decoded from,
    /// with every schema field present (`null` for absent values).
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Vehicle(r) => serde_json::to_vec(r),
            Self::Gps(r) => serde_json::to_vec(r),
            Self::Traffic(r) => serde_json::to_vec(r),
            Self::Weather(r) => serde_json::to_vec(r),
            Self::Emergency(r) => serde_json::to_vec(r),
        }
    }

    /// Builds a record of `kind` from a JSON object whose values already
    /// have the canonical representation of their schema types.
    pub fn from_canonical_json(
        kind: StreamKind,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            StreamKind::Vehicle => Self::Vehicle(serde_json::from_value(value)?),
            StreamKind::Gps => Self::Gps(serde_json::from_value(value)?),
            StreamKind::Traffic => Self::Traffic(serde_json::from_value(value)?),
            StreamKind::Weather => Self::Weather(serde_json::from_value(value)?),
            StreamKind::Emergency => Self::Emergency(serde_json::from_value(value)?),
        })
    }

    /// Returns the value of the top-level column `name`, as named in the
    /// stream schema.  Unknown names read as null.
    pub fn column(&self, name: &str) -> ColumnValue<'_> {
        match name {
            "id" => return ColumnValue::String(self.id()),
            "timestamp" => return ColumnValue::Timestamp(self.timestamp()),
            _ => (),
        }
        match self {
            Self::Vehicle(r) => match name {
                "device_id" => (&r.device_id).into(),
                "location" => (&r.location).into(),
                "speed" => (&r.speed).into(),
                "direction" => (&r.direction).into(),
                "make" => (&r.make).into(),
                "model" => (&r.model).into(),
                "year" => (&r.year).into(),
                "fuel_type" => (&r.fuel_type).into(),
                _ => ColumnValue::Null,
            },
            Self::Gps(r) => match name {
                "device_id" => (&r.device_id).into(),
                "speed" => (&r.speed).into(),
                "direction" => (&r.direction).into(),
                "vehicle_type" => (&r.vehicle_type).into(),
                _ => ColumnValue::Null,
            },
            Self::Traffic(r) => match name {
                "device_id" => (&r.device_id).into(),
                "cameraId" => (&r.camera_id).into(),
                "location" => (&r.location).into(),
                "snapshot" => (&r.snapshot).into(),
                _ => ColumnValue::Null,
            },
            Self::Weather(r) => match name {
                "device_id" => (&r.device_id).into(),
                "location" => (&r.location).into(),
                "temperature" => (&r.temperature).into(),
                "weatherCondition" => (&r.weather_condition).into(),
                "precipitation" => (&r.precipitation).into(),
                "windspeed" => (&r.windspeed).into(),
                "humidity" => (&r.humidity).into(),
                "AQI" => (&r.aqi).into(),
                _ => ColumnValue::Null,
            },
            Self::Emergency(r) => match name {
                "device_id" => (&r.device_id).into(),
                "incidentId" => (&r.incident_id).into(),
                "type" => (&r.incident_type).into(),
                "location" => (&r.location).into(),
                "status" => (&r.status).into(),
                "description" => (&r.description).into(),
                _ => ColumnValue::Null,
            },
        }
    }
}
