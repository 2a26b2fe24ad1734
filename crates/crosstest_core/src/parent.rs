//! Data a host hands to every runner instance it starts.

use serde::{Deserialize, Serialize};

/// Environment variable carrying [`ParentData`] as JSON for process backends.
pub const PARENT_DATA_ENV: &str = "CROSSTEST_PARENT_DATA";

/// Where the runner came from and how to reach its controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentData {
    /// The test file the artifact was built from (reported as each context's origin).
    pub file: String,
    /// Runtime name as configured on the host (`node`, `bun`, ...).
    pub runtime: String,
    /// Base URL of the controller's transport.
    pub server: String,
    #[serde(default)]
    pub is_debug: bool,
}

impl ParentData {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
