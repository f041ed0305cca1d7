use crate::error::{EngineError, ErrorCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable thresholds for the engine and its controllers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub debounce_ms: u64,
    pub retry_ms: u64,
    pub search_debounce_ms: u64,
    pub barrier_poll_ms: u64,
    pub max_search_results: usize,
    pub variation_chunk_size: usize,
    pub variation_direct_node_limit: usize,
    pub density_min_nodes: usize,
    pub density_min_window: f64,
    pub density_min_span: f64,
    pub search_cache_capacity: usize,
    pub reference_width: f64,
    pub y_scale: f64,
    pub x_percentile: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            retry_ms: 100,
            search_debounce_ms: 500,
            barrier_poll_ms: 100,
            max_search_results: 10_000,
            variation_chunk_size: 10_000,
            variation_direct_node_limit: 90_000,
            density_min_nodes: 10_000,
            density_min_window: 1_000.0,
            density_min_span: 0.002,
            search_cache_capacity: 100_000_000,
            reference_width: 450.0,
            y_scale: 2000.0,
            x_percentile: 0.99,
        }
    }
}

impl EngineSettings {
    pub fn load_from_path(path: &str) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError {
            code: ErrorCode::Io,
            message: format!("Could not read settings file '{path}': {e}"),
        })?;
        serde_json::from_str(&text).map_err(|e| EngineError {
            code: ErrorCode::InvalidInput,
            message: format!("Could not parse settings JSON '{path}': {e}"),
        })
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }

    pub fn barrier_poll(&self) -> Duration {
        Duration::from_millis(self.barrier_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_settings_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_search_results": 50, "debounce_ms": 20}}"#).unwrap();
        let settings = EngineSettings::load_from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(settings.max_search_results, 50);
        assert_eq!(settings.debounce(), Duration::from_millis(20));
        assert_eq!(settings.variation_chunk_size, 10_000);
        assert_eq!(settings.reference_width, 450.0);
    }

    #[test]
    fn test_missing_settings_file_is_io_error() {
        let err = EngineSettings::load_from_path("/nonexistent/taxonium-settings.json").unwrap_err();
        assert_eq!(err.code, ErrorCode::Io);
    }
}
