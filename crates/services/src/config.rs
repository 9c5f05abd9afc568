//! Node configuration: which services run, and how they reach the broker.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use renderflow_bus::{BusConfig, ClientOptions};
use renderflow_core::Config;

use crate::contracts::{FILES_SERVICE, JOBS_SERVICE, PROXY_REPLY_QUEUE, PROXY_SERVICE};
use crate::error::ServiceError;

/// A service a node can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Jobs,
    Files,
    Proxy,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Jobs, Role::Files, Role::Proxy];

    /// Name the service uses on the bus; every queue it owns ends with it.
    pub fn service_name(self) -> &'static str {
        match self {
            Role::Jobs => JOBS_SERVICE,
            Role::Files => FILES_SERVICE,
            Role::Proxy => PROXY_SERVICE,
        }
    }

    /// Parse `jobs`, `files`, `proxy` or `all`.
    pub fn parse_list(value: &str) -> Result<Vec<Role>, ServiceError> {
        let mut roles = Vec::new();
        for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.to_lowercase().as_str() {
                "all" => roles.extend(Role::ALL),
                "jobs" => roles.push(Role::Jobs),
                "files" => roles.push(Role::Files),
                "proxy" | "submitproxy" => roles.push(Role::Proxy),
                other => {
                    return Err(ServiceError::Config(format!("unknown role '{other}'")));
                }
            }
        }
        roles.sort();
        roles.dedup();
        if roles.is_empty() {
            return Err(ServiceError::Config("no role given".into()));
        }
        Ok(roles)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.service_name())
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub roles: Vec<Role>,
    pub bus: BusConfig,
    pub core: Config,
    pub shutdown_timeout: Duration,
}

impl NodeConfig {
    /// Bus settings from `bus_config` (or defaults plus environment), job
    /// settings from the environment.
    pub fn load(
        roles: Vec<Role>,
        bus_config: Option<&Path>,
        shutdown_timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let bus = match bus_config {
            Some(path) => BusConfig::from_file(path)?,
            None => BusConfig::from_env()?,
        };
        Ok(Self {
            roles,
            bus,
            core: Config::from_env(),
            shutdown_timeout,
        })
    }

    pub fn runs(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Client options for a role; the proxy keeps its historical reply queue.
    pub fn client_options(&self, role: Role) -> ClientOptions {
        let options = self.bus.client_options(role.service_name());
        match role {
            Role::Proxy => options.with_reply_queue(PROXY_REPLY_QUEUE),
            Role::Jobs | Role::Files => options,
        }
    }

    pub fn callback_addr(&self) -> Result<SocketAddr, ServiceError> {
        let callback = &self.core.callback;
        format!("{}:{}", callback.host, callback.port)
            .parse()
            .map_err(|e| ServiceError::Config(format!("invalid callback address: {e}")))
    }
}
