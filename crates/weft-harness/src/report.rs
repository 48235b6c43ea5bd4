//! Run reports: JSON serialization and integrity digest.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Scenario outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

/// Result of one scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    /// Scenario identifier.
    pub name: String,
    pub outcome: Outcome,
    /// Wall-clock duration in milliseconds.
    pub millis: u128,
    /// Human-readable detail: what was observed, or why it failed.
    pub detail: String,
}

/// Result of a full harness run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Schema version.
    pub version: String,
    pub scenarios: Vec<ScenarioReport>,
}

impl RunReport {
    pub fn new(scenarios: Vec<ScenarioReport>) -> Self {
        Self {
            version: "1".to_string(),
            scenarios,
        }
    }

    /// Whether every scenario passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.scenarios.iter().all(|s| s.outcome == Outcome::Pass)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// SHA-256 digest of the JSON body, for report integrity checks.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let body = self.to_json()?;
        let hash = Sha256::digest(body.as_bytes());
        Ok(hash.iter().map(|b| format!("{b:02x}")).collect())
    }
}
