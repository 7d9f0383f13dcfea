use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

/// Tunables shared by reconciliation, imputation and the geo-join.
/// Every field has a default so a partial JSON file is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `chrono` format strings tried in order when casting to `datetime`.
    /// Formats without a time component parse as midnight.
    pub date_formats: Vec<String>,

    /// Token written into missing `string` cells.
    pub blank_sentinel: String,

    /// Separator used when stringifying list-like cells.
    pub list_separator: String,

    /// Zip codes are left-padded with `'0'` to this width.
    pub zip_width: usize,

    /// Marker counted by the conditional-count geo aggregation.
    pub affirmative_marker: String,

    /// Attempts made to load the reference table before giving up.
    pub reference_attempts: u32,

    /// Pause between reference-table attempts, in milliseconds.
    pub reference_retry_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            date_formats: vec![
                "%Y-%m-%d %H:%M:%S".to_string(),
                "%Y-%m-%dT%H:%M:%S".to_string(),
                "%Y-%m-%d".to_string(),
                "%m/%d/%Y".to_string(),
                "%d.%m.%Y".to_string(),
            ],
            blank_sentinel: "blank".to_string(),
            list_separator: ",".to_string(),
            zip_width: 5,
            affirmative_marker: "Yes".to_string(),
            reference_attempts: 3,
            reference_retry_delay_ms: 250,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file; missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&text).context("parsing config JSON")?;
        log::debug!("Loaded engine config from {}: {config:?}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "blank_sentinel": "n/a", "zip_width": 9 }"#).unwrap();
        assert_eq!(config.blank_sentinel, "n/a");
        assert_eq!(config.zip_width, 9);
        assert_eq!(config.affirmative_marker, "Yes");
        assert_eq!(config.date_formats, EngineConfig::default().date_formats);
    }
}
