//! Metric-state persistence
//!
//! Broker-side metric statuses are cached in a JSON file so new metrics
//! can still be detected across agent restarts. Writes go through a temp
//! file and rename so a crash never leaves a torn state file.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

/// Metric name → broker-side status (`active`, `available`, `disabled`)
pub type MetricStates = HashMap<String, String>;

/// File name of the state cache inside `check.state_path`
pub const STATE_FILE: &str = "metrics.json";

/// Load persisted metric states
pub fn load_state(file: &Path) -> io::Result<MetricStates> {
    let data = fs::read(file)?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Persist metric states atomically (write temp, then rename)
pub fn save_state(file: &Path, states: &MetricStates) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(states)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let tmp = file.with_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(STATE_FILE);

        let mut states = MetricStates::new();
        states.insert("web`requests".to_string(), "active".to_string());
        states.insert("db`queries".to_string(), "available".to_string());

        save_state(&file, &states).unwrap();
        let loaded = load_state(&file).unwrap();
        assert_eq!(loaded, states);

        // no temp file left behind
        assert!(!file.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_state(&dir.path().join(STATE_FILE)).is_err());
    }

    #[test]
    fn test_load_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(STATE_FILE);
        fs::write(&file, b"not json").unwrap();

        let err = load_state(&file).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(STATE_FILE);

        let mut states = MetricStates::new();
        states.insert("a".to_string(), "active".to_string());
        save_state(&file, &states).unwrap();

        states.insert("b".to_string(), "disabled".to_string());
        save_state(&file, &states).unwrap();

        assert_eq!(load_state(&file).unwrap().len(), 2);
    }
}
