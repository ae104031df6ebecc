//! `proptest` strategies for event records.

use chrono::{DateTime, Utc};
use proptest::option;
use proptest::prelude::*;

use crate::record::{
    EmergencyRecord, EventRecord, GpsRecord, Location, TrafficRecord, VehicleRecord,
    WeatherRecord,
};
use crate::StreamKind;

/// Event times between 2000-01-01 and 2100-01-01, at microsecond
/// precision.
pub fn timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (946_684_800_000_000i64..4_102_444_800_000_000i64)
        .prop_filter_map("out of range", DateTime::from_timestamp_micros)
}

fn text() -> impl Strategy<Value = Option<String>> {
    option::of("[a-zA-Z0-9 _-]{0,16}")
}

fn double() -> impl Strategy<Value = Option<f64>> {
    option::of(-1.0e6f64..1.0e6f64)
}

fn integer() -> impl Strategy<Value = Option<i32>> {
    option::of(any::<i32>())
}

fn location() -> impl Strategy<Value = Option<Location>> {
    option::of(
        (option::of(-90.0f64..90.0), option::of(-180.0f64..180.0)).prop_map(
            |(latitude, longitude)| Location {
                latitude,
                longitude,
            },
        ),
    )
}

fn id() -> impl Strategy<Value = String> {
    "[a-f0-9-]{1,36}"
}

pub fn vehicle() -> impl Strategy<Value = VehicleRecord> {
    (
        (id(), text(), timestamp(), location()),
        (double(), text(), text(), text(), integer(), text()),
    )
        .prop_map(
            |((id, device_id, timestamp, location), (speed, direction, make, model, year, fuel_type))| {
                VehicleRecord {
                    id,
                    device_id,
                    timestamp,
                    location,
                    speed,
                    direction,
                    make,
                    model,
                    year,
                    fuel_type,
                }
            },
        )
}

pub fn gps() -> impl Strategy<Value = GpsRecord> {
    (id(), text(), timestamp(), double(), text(), text()).prop_map(
        |(id, device_id, timestamp, speed, direction, vehicle_type)| GpsRecord {
            id,
            device_id,
            timestamp,
            speed,
            direction,
            vehicle_type,
        },
    )
}

pub fn traffic() -> impl Strategy<Value = TrafficRecord> {
    (id(), text(), text(), text(), timestamp(), text()).prop_map(
        |(id, device_id, camera_id, location, timestamp, snapshot)| TrafficRecord {
            id,
            device_id,
            camera_id,
            location,
            timestamp,
            snapshot,
        },
    )
}

pub fn weather() -> impl Strategy<Value = WeatherRecord> {
    (
        (id(), text(), location(), timestamp(), double()),
        (text(), double(), double(), integer(), double()),
    )
        .prop_map(
            |(
                (id, device_id, location, timestamp, temperature),
                (weather_condition, precipitation, windspeed, humidity, aqi),
            )| WeatherRecord {
                id,
                device_id,
                location,
                timestamp,
                temperature,
                weather_condition,
                precipitation,
                windspeed,
                humidity,
                aqi,
            },
        )
}

pub fn emergency() -> impl Strategy<Value = EmergencyRecord> {
    (
        (id(), text(), text(), text()),
        (timestamp(), text(), text(), text()),
    )
        .prop_map(
            |((id, device_id, incident_id, incident_type), (timestamp, location, status, description))| {
                EmergencyRecord {
                    id,
                    device_id,
                    incident_id,
                    incident_type,
                    timestamp,
                    location,
                    status,
                    description,
                }
            },
        )
}

/// Records of the given kind.
pub fn record_of(kind: StreamKind) -> BoxedStrategy<EventRecord> {
    match kind {
        StreamKind::Vehicle => vehicle().prop_map(EventRecord::Vehicle).boxed(),
        StreamKind::Gps => gps().prop_map(EventRecord::Gps).boxed(),
        StreamKind::Traffic => traffic().prop_map(EventRecord::Traffic).boxed(),
        StreamKind::Weather => weather().prop_map(EventRecord::Weather).boxed(),
        StreamKind::Emergency => emergency().prop_map(EventRecord::Emergency).boxed(),
    }
}

/// Records of any kind.
pub fn record() -> impl Strategy<Value = EventRecord> {
    prop_oneof![
        record_of(StreamKind::Vehicle),
        record_of(StreamKind::Gps),
        record_of(StreamKind::Traffic),
        record_of(StreamKind::Weather),
        record_of(StreamKind::Emergency),
    ]
}
