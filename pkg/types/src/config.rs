use serde::{Deserialize, Serialize};

/// Gateway configuration file (YAML).
///
/// Example `gateway.yaml`:
/// ```yaml
/// api-server: http://10.0.0.1:6443
/// http-port: 80
/// https-port: 443
/// state-dir: /var/lib/kato/gateway
/// ignore-interfaces: [docker0, cni0]
/// min-lb-port: 20001
/// max-lb-port: 35000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfigFile {
    #[serde(default, alias = "api-server")]
    pub api_server: Option<String>,
    #[serde(default, alias = "api-token")]
    pub api_token: Option<String>,
    #[serde(default, alias = "node-name")]
    pub node_name: Option<String>,
    #[serde(default, alias = "http-port")]
    pub http_port: Option<u16>,
    #[serde(default, alias = "https-port")]
    pub https_port: Option<u16>,
    #[serde(default, alias = "stream-port")]
    pub stream_port: Option<u16>,
    #[serde(default, alias = "status-port")]
    pub status_port: Option<u16>,
    #[serde(default, alias = "health-port")]
    pub health_port: Option<u16>,
    #[serde(default, alias = "monitor-port")]
    pub monitor_port: Option<u16>,
    #[serde(default, alias = "state-dir")]
    pub state_dir: Option<String>,
    #[serde(default, alias = "call-timeout-secs")]
    pub call_timeout_secs: Option<u64>,
    #[serde(default, alias = "ignore-interfaces")]
    pub ignore_interfaces: Option<Vec<String>>,
    #[serde(default, alias = "sync-rate")]
    pub sync_rate: Option<f64>,
    #[serde(default, alias = "sync-burst")]
    pub sync_burst: Option<u32>,
    #[serde(default, alias = "min-lb-port")]
    pub min_lb_port: Option<u16>,
    #[serde(default, alias = "max-lb-port")]
    pub max_lb_port: Option<u16>,
    #[serde(default, alias = "access-log")]
    pub access_log: Option<String>,
    #[serde(default, alias = "enable-metrics")]
    pub enable_metrics: Option<bool>,
    #[serde(default, alias = "enable-ssl-stapling")]
    pub enable_ssl_stapling: Option<bool>,
    #[serde(default, alias = "retry-non-idempotent")]
    pub retry_non_idempotent: Option<bool>,
    #[serde(default, alias = "nginx-binary")]
    pub nginx_binary: Option<String>,
    #[serde(default, alias = "conf-dir")]
    pub conf_dir: Option<String>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
