//! Metric representation shared by the local HTTP surface and the check
//! manager.
//!
//! Metrics use the compact tagged form co-located processes push to
//! `/write/<id>`: a one-character type tag and a JSON value. Tags:
//! `i`/`I` 32-bit signed/unsigned, `l`/`L` 64-bit signed/unsigned,
//! `n` double, `s` text.

use serde::{Deserialize, Serialize};

/// A single metric sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// One-character type tag
    #[serde(rename = "_type")]
    pub kind: String,

    /// Sample value
    #[serde(rename = "_value")]
    pub value: serde_json::Value,
}

impl Metric {
    /// Create a 64-bit unsigned metric
    pub fn uint(value: u64) -> Self {
        Self {
            kind: "L".to_string(),
            value: value.into(),
        }
    }

    /// Create a 64-bit signed metric
    pub fn int(value: i64) -> Self {
        Self {
            kind: "l".to_string(),
            value: value.into(),
        }
    }

    /// Create a double metric
    pub fn double(value: f64) -> Self {
        Self {
            kind: "n".to_string(),
            value: value.into(),
        }
    }

    /// Create a text metric
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: "s".to_string(),
            value: value.into().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_wire_shape() {
        let m = Metric::uint(42);
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"_type":"L","_value":42}"#);
    }

    #[test]
    fn test_metric_parse() {
        let m: Metric = serde_json::from_str(r#"{"_type":"s","_value":"idle"}"#).unwrap();
        assert_eq!(m.kind, "s");
        assert_eq!(m.value, serde_json::json!("idle"));
    }

    #[test]
    fn test_metric_map_parse() {
        use std::collections::HashMap;

        let body = r#"{"requests":{"_type":"L","_value":10},"state":{"_type":"s","_value":"ok"}}"#;
        let metrics: HashMap<String, Metric> = serde_json::from_str(body).unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics["requests"], Metric::uint(10));
    }
}
