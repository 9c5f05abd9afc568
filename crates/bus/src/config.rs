use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ClientOptions;
use crate::error::BusError;
use crate::transport::Transport;

// ── Top-level config ────────────────────────────────────────────────

/// Configuration of the messaging layer.
///
/// Parsed from `renderflow.toml` with support for environment variable overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub broker: BrokerSection,

    #[serde(default)]
    pub client: ClientSection,
}

// ── Section configs ─────────────────────────────────────────────────

/// Where the broker daemon listens and who may talk to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Credentials presented by clients. No credentials = open broker.
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub secret: Option<String>,

    /// Optional HTTP port for `/metrics` on the daemon.
    #[serde(default)]
    pub metrics_port: Option<u16>,

    /// Seconds a client waits for the broker to accept its hello.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Seconds between liveness pings a client sends the daemon.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    /// Seconds of silence after which the daemon closes a client session,
    /// requeueing its unacknowledged deliveries.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "tcp://127.0.0.1:5672".into()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_heartbeat() -> u64 {
    5
}

fn default_session_timeout() -> u64 {
    15
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            username: None,
            secret: None,
            metrics_port: None,
            connect_timeout_secs: default_connect_timeout(),
            heartbeat_secs: default_heartbeat(),
            session_timeout_secs: default_session_timeout(),
        }
    }
}

/// Per-client defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Topic exchange every service publishes to.
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Upper bound for a request/reply round trip.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// Unacknowledged deliveries per consumer; also the handler concurrency.
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
}

fn default_exchange() -> String {
    "rrremote".into()
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_prefetch() -> u16 {
    1
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            rpc_timeout_secs: default_rpc_timeout(),
            prefetch: default_prefetch(),
        }
    }
}

/// Username and secret presented in the connection handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

// ── Loading & Validation ────────────────────────────────────────────

impl BusConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, BusError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BusError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides, for deployments without a file.
    pub fn from_env() -> Result<Self, BusError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn broker_transport(&self) -> Result<Transport, BusError> {
        self.broker.endpoint.parse()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.broker.username, &self.broker.secret) {
            (Some(username), Some(secret)) => Some(Credentials {
                username: username.clone(),
                secret: secret.clone(),
            }),
            _ => None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.broker.heartbeat_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.session_timeout_secs)
    }

    /// Client options for a service, reply queue derived from its name.
    pub fn client_options(&self, service_name: &str) -> ClientOptions {
        ClientOptions::new(service_name)
            .exchange(&self.client.exchange)
            .rpc_timeout(Duration::from_secs(self.client.rpc_timeout_secs))
            .prefetch(self.client.prefetch)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `RENDERFLOW_BUS_SECTION_KEY` overrides `section.key`.
    /// - `RENDERFLOW_BUS_BROKER_ENDPOINT` -> `broker.endpoint`
    /// - `RENDERFLOW_BUS_BROKER_USERNAME` -> `broker.username`
    /// - `RENDERFLOW_BUS_BROKER_SECRET` -> `broker.secret`
    /// - `RENDERFLOW_BUS_BROKER_METRICS_PORT` -> `broker.metrics_port`
    /// - `RENDERFLOW_BUS_CLIENT_EXCHANGE` -> `client.exchange`
    /// - `RENDERFLOW_BUS_CLIENT_RPC_TIMEOUT_SECS` -> `client.rpc_timeout_secs`
    /// - `RENDERFLOW_BUS_CLIENT_PREFETCH` -> `client.prefetch`
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RENDERFLOW_BUS_BROKER_ENDPOINT") {
            self.broker.endpoint = v;
        }
        if let Ok(v) = std::env::var("RENDERFLOW_BUS_BROKER_USERNAME") {
            self.broker.username = Some(v);
        }
        if let Ok(v) = std::env::var("RENDERFLOW_BUS_BROKER_SECRET") {
            self.broker.secret = Some(v);
        }
        if let Ok(v) = std::env::var("RENDERFLOW_BUS_BROKER_METRICS_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.broker.metrics_port = Some(port);
            }
        }
        if let Ok(v) = std::env::var("RENDERFLOW_BUS_BROKER_HEARTBEAT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.broker.heartbeat_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("RENDERFLOW_BUS_BROKER_SESSION_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.broker.session_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("RENDERFLOW_BUS_CLIENT_EXCHANGE") {
            self.client.exchange = v;
        }
        if let Ok(v) = std::env::var("RENDERFLOW_BUS_CLIENT_RPC_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.client.rpc_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("RENDERFLOW_BUS_CLIENT_PREFETCH") {
            if let Ok(n) = v.parse::<u16>() {
                self.client.prefetch = n;
            }
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), BusError> {
        self.broker_transport()?;
        if self.client.exchange.trim().is_empty() {
            return Err(BusError::Config("client.exchange must not be empty".into()));
        }
        if self.client.rpc_timeout_secs == 0 {
            return Err(BusError::Config("client.rpc_timeout_secs must be positive".into()));
        }
        if self.broker.heartbeat_secs == 0 {
            return Err(BusError::Config("broker.heartbeat_secs must be positive".into()));
        }
        if self.broker.session_timeout_secs <= self.broker.heartbeat_secs {
            return Err(BusError::Config(
                "broker.session_timeout_secs must exceed broker.heartbeat_secs".into(),
            ));
        }
        if self.client.prefetch == 0 {
            return Err(BusError::Config("client.prefetch must be positive".into()));
        }
        if self.broker.username.is_some() != self.broker.secret.is_some() {
            return Err(BusError::Config(
                "broker.username and broker.secret must be set together".into(),
            ));
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg = BusConfig::from_toml("").unwrap();
        assert_eq!(cfg.client.exchange, "rrremote");
        assert_eq!(cfg.client.rpc_timeout_secs, 30);
        assert_eq!(cfg.client.prefetch, 1);
        assert!(cfg.credentials().is_none());
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[broker]
endpoint = "tcp://10.0.0.5:5672"
username = "render"
secret = "s3cret"
metrics_port = 9090

[client]
exchange = "studio"
rpc_timeout_secs = 10
prefetch = 4
"#;
        let cfg = BusConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.broker_transport().unwrap(), Transport::tcp("10.0.0.5", 5672));
        assert_eq!(
            cfg.credentials(),
            Some(Credentials {
                username: "render".into(),
                secret: "s3cret".into()
            })
        );

        let opts = cfg.client_options("Files");
        assert_eq!(opts.exchange, "studio");
        assert_eq!(opts.prefetch, 4);
        assert_eq!(opts.rpc_timeout, Duration::from_secs(10));
        assert_eq!(opts.reply_queue(), "Files.reply-to");
    }

    #[test]
    fn reject_bad_endpoint() {
        let err = BusConfig::from_toml("[broker]\nendpoint = \"amqp://x\"\n").unwrap_err();
        assert!(err.to_string().contains("amqp://x"), "got: {err}");
    }

    #[test]
    fn reject_zero_prefetch() {
        let err = BusConfig::from_toml("[client]\nprefetch = 0\n").unwrap_err();
        assert!(err.to_string().contains("prefetch"));
    }

    #[test]
    fn session_must_outlive_heartbeat() {
        let err = BusConfig::from_toml("[broker]\nheartbeat_secs = 10\nsession_timeout_secs = 10\n")
            .unwrap_err();
        assert!(err.to_string().contains("session_timeout_secs"));

        let cfg = BusConfig::from_toml("").unwrap();
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(cfg.session_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn reject_half_credentials() {
        let err = BusConfig::from_toml("[broker]\nusername = \"render\"\n").unwrap_err();
        assert!(err.to_string().contains("secret"));
    }

    #[test]
    fn env_override_metrics_port() {
        // SAFETY: test-only, no other test reads this key
        unsafe {
            std::env::set_var("RENDERFLOW_BUS_BROKER_METRICS_PORT", "9191");
        }
        let cfg = BusConfig::from_toml("").unwrap();
        assert_eq!(cfg.broker.metrics_port, Some(9191));
        unsafe {
            std::env::remove_var("RENDERFLOW_BUS_BROKER_METRICS_PORT");
        }
    }
}
