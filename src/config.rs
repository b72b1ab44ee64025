//! Fleet configuration: the CSMS endpoint, default intervals, and how
//! many simulated charge points to spin up. Loaded from a TOML file
//! with environment-variable overrides taking precedence over the
//! file's values.

use serde::Deserialize;

use crate::errors::{SimError, SimResult};

#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    pub csms_url: String,
    #[serde(default = "default_connector_count")]
    pub connectors_per_station: u32,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u32,
    #[serde(default = "default_meter_value_interval")]
    pub meter_value_sample_interval_secs: u32,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_connector_count() -> u32 {
    1
}

fn default_heartbeat_interval() -> u32 {
    300
}

fn default_meter_value_interval() -> u32 {
    60
}

impl FleetConfig {
    pub fn from_toml_str(text: &str) -> SimResult<Self> {
        toml::from_str(text).map_err(|e| SimError::Configuration(format!("invalid config: {e}")))
    }

    pub fn from_file(path: &str) -> SimResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SimError::Configuration(format!("cannot read {path}: {e}")))?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables take precedence over the file, following
    /// the `EVSE_SIM_<FIELD>` naming convention.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("EVSE_SIM_CSMS_URL") {
            self.csms_url = url;
        }
        if let Ok(token) = std::env::var("EVSE_SIM_AUTH_TOKEN") {
            self.auth_token = Some(token);
        }
        if let Ok(value) = std::env::var("EVSE_SIM_CONNECTORS_PER_STATION") {
            if let Ok(parsed) = value.parse() {
                self.connectors_per_station = parsed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config = FleetConfig::from_toml_str(r#"csms_url = "ws://localhost:9000/ocpp""#).unwrap();
        assert_eq!(config.connectors_per_station, 1);
        assert_eq!(config.heartbeat_interval_secs, 300);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(FleetConfig::from_toml_str("not valid toml {{{").is_err());
    }

    #[test]
    fn honors_explicit_overrides() {
        let config = FleetConfig::from_toml_str(
            r#"
            csms_url = "ws://localhost:9000/ocpp"
            connectors_per_station = 4
            heartbeat_interval_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.connectors_per_station, 4);
        assert_eq!(config.heartbeat_interval_secs, 60);
    }
}
