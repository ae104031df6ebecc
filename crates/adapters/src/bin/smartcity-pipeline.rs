//! Runs the smart-city ingestion pipeline.
//!
//! ```text
//! smartcity-pipeline --config-file pipeline.yaml
//! ```

use smartcity_adapters::server::{exit_diagnostic, server_main};
use std::process::ExitCode;

fn main() -> ExitCode {
    match server_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{}", exit_diagnostic(&error));
            ExitCode::FAILURE
        }
    }
}
