use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Directory holding IPC socket files.
const IPC_DIR: &str = "/tmp/renderflow";

/// Address of the broker daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Unix domain socket, named below [`IPC_DIR`].
    Ipc(String),

    Tcp { host: String, port: u16 },
}

impl Transport {
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// ZeroMQ endpoint address string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(name) => format!("ipc://{IPC_DIR}/{name}.sock"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    fn ipc_path(&self) -> Option<String> {
        match self {
            Self::Ipc(name) => Some(format!("{IPC_DIR}/{name}.sock")),
            Self::Tcp { .. } => None,
        }
    }

    /// Prepare the filesystem for binding: create the socket directory and
    /// remove a socket file left behind by a previous run. No-op for TCP.
    pub fn prepare_bind(&self) -> std::io::Result<()> {
        let Some(path) = self.ipc_path() else {
            return Ok(());
        };
        if let Some(parent) = Path::new(&path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path, "removed stale IPC socket");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

impl FromStr for Transport {
    type Err = BusError;

    /// Parse `ipc:///tmp/renderflow/<name>.sock`, `ipc://<name>` or `tcp://host:port`.
    fn from_str(endpoint: &str) -> Result<Self, Self::Err> {
        if let Some(path) = endpoint.strip_prefix("ipc://") {
            let name = Path::new(path)
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| BusError::Config(format!("invalid ipc endpoint '{endpoint}'")))?;
            return Ok(Self::ipc(name));
        }
        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| BusError::Config(format!("missing port in '{endpoint}'")))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| BusError::Config(format!("invalid port in '{endpoint}'")))?;
            return Ok(Self::tcp(host, port));
        }
        Err(BusError::Config(format!(
            "unsupported endpoint '{endpoint}', expected ipc:// or tcp://"
        )))
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_endpoint() {
        let t = Transport::ipc("broker");
        assert_eq!(t.endpoint(), "ipc:///tmp/renderflow/broker.sock");
    }

    #[test]
    fn tcp_endpoint() {
        let t = Transport::tcp("127.0.0.1", 5672);
        assert_eq!(t.endpoint(), "tcp://127.0.0.1:5672");
    }

    #[test]
    fn parse_roundtrips_endpoints() {
        for endpoint in ["ipc:///tmp/renderflow/broker.sock", "tcp://10.0.0.1:5672"] {
            let t: Transport = endpoint.parse().unwrap();
            assert_eq!(t.endpoint(), endpoint);
        }
    }

    #[test]
    fn parse_rejects_unknown_scheme_and_bad_port() {
        assert!("amqp://host:5672".parse::<Transport>().is_err());
        assert!("tcp://host:notaport".parse::<Transport>().is_err());
        assert!("tcp://host".parse::<Transport>().is_err());
    }

    #[test]
    fn prepare_bind_is_noop_for_tcp() {
        Transport::tcp("127.0.0.1", 1).prepare_bind().unwrap();
    }
}
