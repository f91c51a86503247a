use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Startup configuration problems. Any of these stops the process.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub forwarder: ForwarderConfig,
    pub ttn: TtnConfig,
    pub publish: PublishConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub retain: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            topic_prefix: "gateways".to_string(),
            client_id: "basicstation-mqtt-publisher".to_string(),
            keep_alive_secs: 60,
            retain: true,
        }
    }
}

/// Where the forwarder's log lines come from and how to read them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Container whose output is followed with `docker logs`
    pub container: String,
    /// Explicit command whose stdout/stderr is the log stream.
    /// Overrides `container` when set.
    pub command: Option<Vec<String>>,
    pub reconnect_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Each marker is a set of substrings that must all appear in a line
    pub uplink_markers: Vec<Vec<String>>,
    pub downlink_markers: Vec<Vec<String>>,
    /// Local link is considered lost when no RX was seen for this long
    pub stale_threshold_secs: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            container: "basicstation".to_string(),
            command: None,
            reconnect_backoff_secs: 1,
            max_backoff_secs: 30,
            uplink_markers: vec![
                vec!["[S2E:".to_string(), " RX ".to_string()],
                vec!["JSON up:".to_string(), "rxpk".to_string()],
            ],
            downlink_markers: vec![
                vec!["[S2E:".to_string(), " TX ".to_string()],
                vec!["PULL_RESP received".to_string()],
            ],
            stale_threshold_secs: 300,
        }
    }
}

impl ForwarderConfig {
    /// The argv of the process that produces the log stream
    pub fn log_command(&self) -> Vec<String> {
        match &self.command {
            Some(cmd) => cmd.clone(),
            None => vec![
                "docker".to_string(),
                "logs".to_string(),
                "--follow".to_string(),
                "--tail".to_string(),
                "0".to_string(),
                self.container.clone(),
            ],
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

/// The Things Stack gateway status polling
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtnConfig {
    pub enabled: bool,
    pub cluster: String,
    /// Overrides `https://{cluster}.cloud.thethings.network`
    pub base_url: Option<String>,
    pub gateway_id: String,
    pub api_key: String,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub stale_threshold_secs: u64,
}

impl Default for TtnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cluster: "eu1".to_string(),
            base_url: None,
            gateway_id: String::new(),
            api_key: String::new(),
            poll_interval_secs: 10,
            request_timeout_secs: 5,
            stale_threshold_secs: 600,
        }
    }
}

impl TtnConfig {
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.cloud.thethings.network", self.cluster),
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    /// Gateway id and API key are both set, yet polling is switched off.
    /// Usually a deployment that forgot `TTN_ENABLED=true`.
    pub fn has_idle_credentials(&self) -> bool {
        !self.enabled && !self.gateway_id.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub interval_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug: false,
        }
    }
}

impl LoggingConfig {
    pub fn effective_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.level
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Like [`Config::load`], but a missing file yields `Ok(None)` so the
    /// caller can fall back to defaults. A file that exists but cannot be
    /// read or parsed is still an error.
    pub fn load_optional(path: &Path) -> Result<Option<Self>, ConfigError> {
        match Self::load(path) {
            Ok(config) => Ok(Some(config)),
            Err(ConfigError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply the deployment's environment variables on top of the file values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(host) = get("MQTT_BROKER") {
            self.mqtt.host = host;
        }
        if let Some(port) = get("MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid("MQTT_PORT", port))?;
        }
        if let Some(user) = get("MQTT_USER") {
            self.mqtt.username = Some(user);
        }
        if let Some(pass) = get("MQTT_PASS") {
            self.mqtt.password = Some(pass);
        }
        if let Some(prefix) = get("MQTT_TOPIC_PREFIX") {
            self.mqtt.topic_prefix = prefix;
        }
        if let Some(container) = get("BASICSTATION_CONTAINER") {
            self.forwarder.container = container;
        }
        if let Some(debug) = get("DEBUG") {
            self.logging.debug = parse_bool(&debug);
        }
        if let Some(enabled) = get("TTN_ENABLED") {
            self.ttn.enabled = parse_bool(&enabled);
        }
        if let Some(cluster) = get("TTN_CLUSTER") {
            self.ttn.cluster = cluster;
        }
        if let Some(gateway_id) = get("TTN_GATEWAY_ID") {
            self.ttn.gateway_id = gateway_id;
        }
        if let Some(api_key) = get("TTN_API_KEY") {
            self.ttn.api_key = api_key;
        }
        Ok(())
    }

    /// Reject configurations that would run with a feature silently off.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::Missing("mqtt.host"));
        }
        if self.mqtt.topic_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Missing("mqtt.topic_prefix"));
        }
        if self.publish.interval_secs == 0 {
            return Err(ConfigError::Invalid("publish.interval_secs", "0".to_string()));
        }
        if self.forwarder.log_command().is_empty() {
            return Err(ConfigError::Missing("forwarder.command"));
        }
        let markers = self
            .forwarder
            .uplink_markers
            .iter()
            .chain(self.forwarder.downlink_markers.iter());
        for marker in markers {
            if marker.is_empty() || marker.iter().any(|part| part.is_empty()) {
                return Err(ConfigError::Invalid(
                    "forwarder markers",
                    format!("{:?}", marker),
                ));
            }
        }
        if self.ttn.enabled {
            if self.ttn.gateway_id.trim().is_empty() {
                return Err(ConfigError::Missing("ttn.gateway_id (TTN_GATEWAY_ID)"));
            }
            if self.ttn.api_key.trim().is_empty() {
                return Err(ConfigError::Missing("ttn.api_key (TTN_API_KEY)"));
            }
            if self.ttn.base_url.is_none() && self.ttn.cluster.trim().is_empty() {
                return Err(ConfigError::Missing("ttn.cluster (TTN_CLUSTER)"));
            }
            if self.ttn.poll_interval_secs == 0 {
                return Err(ConfigError::Invalid(
                    "ttn.poll_interval_secs",
                    "0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mqtt.topic_prefix, "gateways");
        assert!(!config.ttn.enabled);
        assert_eq!(
            config.forwarder.log_command(),
            vec!["docker", "logs", "--follow", "--tail", "0", "basicstation"]
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [mqtt]
            host = "broker.local"

            [ttn]
            enabled = true
            gateway_id = "my-gw"
            api_key = "NNSXS.secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.ttn.cluster, "eu1");
        assert_eq!(config.publish.interval_secs, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("MQTT_BROKER", "10.0.0.2"),
                ("MQTT_PORT", "8883"),
                ("MQTT_USER", ""),
                ("DEBUG", "True"),
                ("TTN_CLUSTER", "nam1"),
                ("BASICSTATION_CONTAINER", "bs"),
            ]))
            .unwrap();

        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username, None);
        assert!(config.logging.debug);
        assert_eq!(config.logging.effective_level(), "debug");
        assert_eq!(config.ttn.base_url(), "https://nam1.cloud.thethings.network");
        assert_eq!(config.forwarder.log_command().last().unwrap(), "bs");
    }

    #[test]
    fn test_bad_port_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(lookup(&[("MQTT_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("MQTT_PORT", _)));
    }

    #[test]
    fn test_enabled_ttn_requires_credentials() {
        let mut config = Config::default();
        config.ttn.enabled = true;
        config.ttn.gateway_id = "gw".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));

        config.ttn.api_key = "key".to_string();
        assert!(config.validate().is_ok());

        config.ttn.gateway_id.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_disabled_ttn_needs_no_credentials() {
        let config = Config::default();
        assert!(config.ttn.api_key.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_marker_is_rejected() {
        let mut config = Config::default();
        config.forwarder.uplink_markers.push(vec![]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid("forwarder markers", _))
        ));
    }

    fn scratch_file(content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "gateway-telemetry-{}.toml",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("gateway-telemetry-does-not-exist.toml");
        assert!(Config::load_optional(&path).unwrap().is_none());
    }

    #[test]
    fn test_broken_file_is_fatal() {
        let path = scratch_file(
            "[ttn]\nenabled = true\ngateway_id = \"my-gw\"\napi_key = \"NNSXS.KEY\n",
        );
        let result = Config::load_optional(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unreadable_file_is_fatal() {
        // a directory exists but cannot be read as a file
        let result = Config::load_optional(&std::env::temp_dir());
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_valid_file_is_loaded() {
        let path = scratch_file("[mqtt]\nhost = \"broker.local\"\n");
        let result = Config::load_optional(&path);
        std::fs::remove_file(&path).ok();
        assert_eq!(result.unwrap().unwrap().mqtt.host, "broker.local");
    }

    #[test]
    fn test_idle_credentials_detected() {
        let mut config = Config::default();
        assert!(!config.ttn.has_idle_credentials());

        config
            .apply_overrides(lookup(&[
                ("TTN_GATEWAY_ID", "my-gw"),
                ("TTN_API_KEY", "NNSXS.KEY"),
            ]))
            .unwrap();
        assert!(config.ttn.has_idle_credentials());

        config
            .apply_overrides(lookup(&[("TTN_ENABLED", "true")]))
            .unwrap();
        assert!(!config.ttn.has_idle_credentials());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_base_url_override_trims_slash() {
        let mut config = TtnConfig::default();
        config.base_url = Some("http://127.0.0.1:9000/".to_string());
        assert_eq!(config.base_url(), "http://127.0.0.1:9000");
    }
}
