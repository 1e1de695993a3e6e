//! Process configuration and bootstrap (§4.L). Every binary (master,
//! worker, agent) loads one of these from a TOML file given on the
//! command line, falling back to the field defaults below.
use std::time::Duration;

use serde::Deserialize;

/// TLS material for a gRPC server/client pair. Left unset, servers bind
/// plaintext — matching the source's default deployment, which expects
/// TLS termination to be layered on by the operator when needed.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsConfig {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub ca_path: Option<String>,
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

/// Registration-plane heartbeat tuning (§4.I, §9). The default 3s/3-miss
/// pair is this crate's choice, not the source's.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "HeartbeatConfig::default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "HeartbeatConfig::default_missed_limit")]
    pub missed_limit: u32,
}

impl HeartbeatConfig {
    fn default_interval_secs() -> u64 {
        3
    }

    fn default_missed_limit() -> u32 {
        3
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval_secs: Self::default_interval_secs(),
            missed_limit: Self::default_missed_limit(),
        }
    }
}

fn default_registration_timeout_secs() -> u64 {
    10
}

fn default_rank_poll_timeout_secs() -> u64 {
    10
}

fn default_pool_size() -> usize {
    8
}

fn default_batch_size() -> usize {
    1
}

fn default_max_batch_wait_millis() -> u64 {
    10
}

/// Default gRPC message size cap (§6): 100 MiB.
fn default_max_message_size_bytes() -> usize {
    100 * 1024 * 1024
}

/// Hard cap on `max_message_size_bytes` (§6): 512 MiB.
pub const MAX_MESSAGE_SIZE_CAP_BYTES: usize = 512 * 1024 * 1024;

fn default_servable_name() -> String {
    "default".to_string()
}

fn default_method_name() -> String {
    "predict".to_string()
}

fn default_version_number() -> u64 {
    1
}

/// Top-level process configuration, shared in shape across the master,
/// worker, and agent binaries; each reads only the fields it needs.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bind_address: String,
    /// Address of the peer this process registers with: the master for a
    /// worker, or the worker hosting the coordinator for an agent. Unset
    /// for the master itself, which has no upstream.
    pub upstream_address: Option<String>,
    pub rank_table_path: Option<String>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default = "default_registration_timeout_secs")]
    pub registration_timeout_secs: u64,
    #[serde(default = "default_rank_poll_timeout_secs")]
    pub rank_poll_timeout_secs: u64,
    #[serde(default = "default_pool_size")]
    pub stage_pool_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_batch_wait_millis")]
    pub max_batch_wait_millis: u64,
    #[serde(default)]
    pub log_filter: Option<String>,
    /// Max gRPC message size, both directions (§6). Clamped to
    /// [`MAX_MESSAGE_SIZE_CAP_BYTES`] on load.
    #[serde(default = "default_max_message_size_bytes")]
    pub max_message_size_bytes: usize,
    /// §6: "Ports disable SO_REUSEPORT" — kept as a config knob a
    /// deployment's socket layer can honor; this crate's own `tonic`
    /// servers don't set SO_REUSEPORT regardless of this flag.
    #[serde(default)]
    pub grpc_reuseport: bool,
    /// §3 servable declaration: name this worker/agent registers under.
    #[serde(default = "default_servable_name")]
    pub servable_name: String,
    /// §3: the one callable method this servable exposes.
    #[serde(default = "default_method_name")]
    pub method_name: String,
    #[serde(default = "default_version_number")]
    pub version_number: u64,
    /// Names of the inputs the servable's `predict` method takes.
    #[serde(default)]
    pub input_names: Vec<String>,
    /// Names of the outputs the servable's `predict` method returns.
    #[serde(default)]
    pub output_names: Vec<String>,
    /// §4.E: input names broadcast from instance 0 rather than packed.
    #[serde(default)]
    pub without_batch_dim_inputs: Vec<String>,
    /// Model file path for a locally served servable (§3). Unset for a
    /// distributed servable, which has no local model to load.
    #[serde(default)]
    pub model_path: Option<String>,
    /// Model file format for a locally served servable (§3): `"om"` or
    /// `"mindir"`.
    #[serde(default)]
    pub model_format: Option<String>,
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        let mut config: Config = toml::from_str(contents)?;
        config.max_message_size_bytes = config.max_message_size_bytes.min(MAX_MESSAGE_SIZE_CAP_BYTES);
        Ok(config)
    }

    pub async fn from_toml_file(path: &str) -> std::io::Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Config::from_toml_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn rank_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.rank_poll_timeout_secs)
    }

    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_millis)
    }

    /// Parse `model_format` into the registry's [`ModelFormat`](crate::registry::ModelFormat),
    /// defaulting to `Om` when a local model path is set but the format isn't spelled out.
    pub fn parsed_model_format(&self) -> crate::registry::ModelFormat {
        match self.model_format.as_deref() {
            Some(s) if s.eq_ignore_ascii_case("mindir") => crate::registry::ModelFormat::MindIr,
            _ => crate::registry::ModelFormat::Om,
        }
    }
}

/// Install the process-wide `tracing` subscriber, honoring `RUST_LOG`
/// when set and otherwise falling back to `config.log_filter` or `info`.
pub fn init_tracing(config: &Config) {
    let filter = config
        .log_filter
        .clone()
        .unwrap_or_else(|| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = Config::from_toml_str(r#"bind_address = "0.0.0.0:6100""#).unwrap();
        assert_eq!(cfg.bind_address, "0.0.0.0:6100");
        assert_eq!(cfg.heartbeat.interval_secs, 3);
        assert_eq!(cfg.heartbeat.missed_limit, 3);
        assert_eq!(cfg.registration_timeout_secs, 10);
        assert!(!cfg.tls.is_enabled());
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
            bind_address = "0.0.0.0:6200"
            upstream_address = "http://master:6100"
            rank_table_path = "/etc/rank_table.json"
            registration_timeout_secs = 30
            batch_size = 8

            [tls]
            cert_path = "/etc/tls/cert.pem"
            key_path = "/etc/tls/key.pem"

            [heartbeat]
            interval_secs = 5
            missed_limit = 2
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.upstream_address.as_deref(), Some("http://master:6100"));
        assert!(cfg.tls.is_enabled());
        assert_eq!(cfg.heartbeat.missed_limit, 2);
        assert_eq!(cfg.batch_size, 8);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(Config::from_toml_str("not = [valid").is_err());
    }

    #[test]
    fn max_message_size_defaults_to_100_mib() {
        let cfg = Config::from_toml_str(r#"bind_address = "0.0.0.0:6100""#).unwrap();
        assert_eq!(cfg.max_message_size_bytes, 100 * 1024 * 1024);
        assert!(!cfg.grpc_reuseport);
    }

    #[test]
    fn servable_declaration_fields_default_sensibly() {
        let cfg = Config::from_toml_str(r#"bind_address = "0.0.0.0:6100""#).unwrap();
        assert_eq!(cfg.servable_name, "default");
        assert_eq!(cfg.method_name, "predict");
        assert_eq!(cfg.version_number, 1);
        assert!(cfg.input_names.is_empty());
        assert!(cfg.without_batch_dim_inputs.is_empty());
        assert!(matches!(cfg.parsed_model_format(), crate::registry::ModelFormat::Om));
    }

    #[test]
    fn parses_servable_declaration_fields() {
        let toml = r#"
            bind_address = "0.0.0.0:6100"
            servable_name = "resnet"
            method_name = "classify"
            version_number = 2
            input_names = ["x"]
            output_names = ["y"]
            without_batch_dim_inputs = ["bias"]
            model_path = "/models/resnet.mindir"
            model_format = "mindir"
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.servable_name, "resnet");
        assert_eq!(cfg.version_number, 2);
        assert_eq!(cfg.without_batch_dim_inputs, vec!["bias".to_string()]);
        assert!(matches!(cfg.parsed_model_format(), crate::registry::ModelFormat::MindIr));
    }

    #[test]
    fn max_message_size_is_clamped_to_512_mib_cap() {
        let toml = r#"
            bind_address = "0.0.0.0:6100"
            max_message_size_bytes = 1073741824
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.max_message_size_bytes, MAX_MESSAGE_SIZE_CAP_BYTES);
    }
}
