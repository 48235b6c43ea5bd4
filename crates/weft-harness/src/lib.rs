//! Conformance scenario harness for the weft thread runtime.
//!
//! This crate provides:
//! - Scenario library: the literal cross-primitive scenarios (barrier
//!   lockstep, writer priority, cancel inside a condition wait, ...)
//!   runnable as tests or from the CLI
//! - Report generation: a JSON run report with a SHA-256 integrity
//!   digest

#![forbid(unsafe_code)]

pub mod report;
pub mod scenarios;

use thiserror::Error;

/// Harness-level failures.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// No scenario is registered under the requested name.
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),

    /// Report could not be written.
    #[error("report io: {0}")]
    Io(#[from] std::io::Error),

    /// Report could not be serialized.
    #[error("report encoding: {0}")]
    Json(#[from] serde_json::Error),
}

pub use report::{Outcome, RunReport, ScenarioReport};
pub use scenarios::{run_all, run_scenario, SCENARIOS};
