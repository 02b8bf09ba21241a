use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named, pluggable algorithm with string properties, e.g. a rate limiter
/// `{"type": "QPS", "props": {"qps": "500"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

impl AlgorithmConfig {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            props: BTreeMap::new(),
        }
    }

    pub fn with_prop(mut self, key: &str, value: impl ToString) -> Self {
        self.props.insert(key.to_string(), value.to_string());
        self
    }

    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// Parses a numeric property; `Ok(None)` when absent.
    pub fn parse_prop<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, String> {
        match self.prop(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| format!("property '{key}' of {} has invalid value '{raw}'", self.type_name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typed_props() {
        let cfg = AlgorithmConfig::new("QPS").with_prop("qps", 50);
        assert_eq!(cfg.parse_prop::<u32>("qps").unwrap(), Some(50));
        assert_eq!(cfg.parse_prop::<u32>("missing").unwrap(), None);
        let bad = AlgorithmConfig::new("QPS").with_prop("qps", "fast");
        assert!(bad.parse_prop::<u32>("qps").is_err());

        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"type\":\"QPS\""));
    }
}
