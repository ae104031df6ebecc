//! Data formats: JSON input and Parquet output.

pub mod json;
pub mod parquet;
