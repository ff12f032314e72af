//! Federate configuration files.
//!
//! JSON and TOML are accepted with the same schema: federate-level timing
//! defaults plus interface declarations. `Federate::from_config` registers
//! everything a file declares.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use weave_core::{ErrorKind, Time, WeaveError};

/// One publication, input or endpoint declaration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub units: String,
    /// Use the name as-is instead of prefixing the federate name.
    pub global: bool,
    pub required: bool,
    /// For inputs: the publication to subscribe to.
    pub target: String,
    /// Deliver only when the value changes.
    pub only_update_on_change: bool,
}

/// A filter declaration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub name: String,
    /// Operation: delay, random_delay, random_drop, reroute, clone.
    pub operation: String,
    /// Operation argument, e.g. the delay in seconds.
    pub properties: String,
    /// Endpoints this filter attaches to on the source side.
    pub source_endpoints: Vec<String>,
    /// Endpoints this filter attaches to on the destination side.
    pub dest_endpoints: Vec<String>,
}

/// A `[publication, input]` connection pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionConfig {
    Pair([String; 2]),
    Targets {
        publication: String,
        targets: Vec<String>,
    },
}

/// Top-level federate configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederateConfig {
    pub name: String,
    pub core_type: String,
    pub broker: String,
    // Timing, in seconds.
    pub period: f64,
    pub offset: f64,
    pub time_delta: f64,
    pub input_delay: f64,
    pub output_delay: f64,
    pub max_iterations: u16,
    pub realtime: bool,
    pub terminate_on_error: bool,
    pub publications: Vec<InterfaceConfig>,
    pub subscriptions: Vec<String>,
    pub inputs: Vec<InterfaceConfig>,
    pub endpoints: Vec<InterfaceConfig>,
    pub filters: Vec<FilterConfig>,
    pub connections: Vec<ConnectionConfig>,
    pub globals: HashMap<String, String>,
    pub tags: HashMap<String, String>,
}

impl FederateConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_iterations: 50,
            ..Default::default()
        }
    }

    /// Load from a JSON or TOML file, chosen by extension.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, WeaveError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            WeaveError::new(
                ErrorKind::InvalidArgument,
                format!("cannot read {}: {err}", path.display()),
            )
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&text),
            _ => Self::from_json(&text),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, WeaveError> {
        serde_json::from_str(text)
            .map_err(|err| WeaveError::new(ErrorKind::InvalidArgument, err.to_string()))
    }

    pub fn from_toml(text: &str) -> Result<Self, WeaveError> {
        toml::from_str(text)
            .map_err(|err| WeaveError::new(ErrorKind::InvalidArgument, err.to_string()))
    }

    pub fn time_delta(&self) -> Time {
        if self.time_delta > 0.0 {
            Time::from_seconds(self.time_delta)
        } else {
            Time::EPSILON
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_config() {
        let cfg = FederateConfig::from_json(
            r#"{
                "name": "battery",
                "core_type": "test",
                "period": 1.0,
                "publications": [
                    {"name": "soc", "type": "double", "units": "%", "global": true}
                ],
                "subscriptions": ["charger/voltage"],
                "endpoints": [{"name": "ctrl", "global": true}],
                "filters": [
                    {"name": "lag", "operation": "delay", "properties": "0.1",
                     "dest_endpoints": ["ctrl"]}
                ],
                "connections": [["soc", "monitor/soc_in"]],
                "globals": {"scenario": "baseline"}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.name, "battery");
        assert_eq!(cfg.publications.len(), 1);
        assert!(cfg.publications[0].global);
        assert_eq!(cfg.subscriptions, vec!["charger/voltage"]);
        assert_eq!(cfg.filters[0].dest_endpoints, vec!["ctrl"]);
        assert!(matches!(cfg.connections[0], ConnectionConfig::Pair(_)));
        assert_eq!(cfg.globals["scenario"], "baseline");
    }

    #[test]
    fn toml_config() {
        let cfg = FederateConfig::from_toml(
            r#"
                name = "charger"
                period = 0.25
                realtime = false

                [[publications]]
                name = "voltage"
                type = "double"
                global = true

                [[inputs]]
                name = "soc_reading"
                target = "battery/soc"
                required = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.name, "charger");
        assert_eq!(cfg.period, 0.25);
        assert_eq!(cfg.inputs[0].target, "battery/soc");
        assert!(cfg.inputs[0].required);
    }

    #[test]
    fn bad_config_is_invalid_argument() {
        let err = FederateConfig::from_json("{ not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
