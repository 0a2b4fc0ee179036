//! Client configuration
//!
//! Loaded from YAML:
//!
//! ```yaml
//! http:
//!   default: http://127.0.0.1:3000
//!   routes:
//!     "app.example.com:80": http://127.0.0.1:3000/app
//! ws:
//!   default: ws://127.0.0.1:3000
//! tcp:
//!   "2222": 127.0.0.1:22
//! tunnels:
//!   ssh: { proto: tcp, addr: 127.0.0.1:2222 }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use backhaul_proto::{ProtoError, Tunnel};
use backhaul_router::{RouterError, TargetResolver, TcpTargets};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatcher::Dispatcher;
use crate::observer::DispatchObserver;

/// Schemes accepted for HTTP targets
const HTTP_SCHEMES: &[&str] = &["http"];

/// Schemes accepted for WebSocket targets
const WS_SCHEMES: &[&str] = &["ws", "http"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid {section} targets: {source}")]
    Targets {
        section: &'static str,
        #[source]
        source: RouterError,
    },

    #[error(transparent)]
    Tunnel(#[from] ProtoError),

    #[error("No http, ws or tcp targets configured")]
    NothingToRelay,
}

/// Default target and/or selector table for one URL-based relay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetsConfig {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

impl TargetsConfig {
    fn resolver(&self, section: &'static str, schemes: &[&str]) -> Result<TargetResolver, ConfigError> {
        TargetResolver::parse(self.default.as_deref(), &self.routes, schemes)
            .map_err(|source| ConfigError::Targets { section, source })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default)]
    pub http: Option<TargetsConfig>,
    #[serde(default)]
    pub ws: Option<TargetsConfig>,
    /// Exposed port identifier to backend `host:port`
    #[serde(default)]
    pub tcp: HashMap<String, String>,
    #[serde(default)]
    pub tunnels: BTreeMap<String, Tunnel>,
}

impl RelayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.http_resolver()?;
        self.ws_resolver()?;
        self.tcp_targets()?;
        for (name, tunnel) in &self.tunnels {
            tunnel.validate(name)?;
        }
        if self.http.is_none() && self.ws.is_none() && self.tcp.is_empty() {
            return Err(ConfigError::NothingToRelay);
        }
        Ok(())
    }

    pub fn http_resolver(&self) -> Result<Option<TargetResolver>, ConfigError> {
        self.http
            .as_ref()
            .map(|targets| targets.resolver("http", HTTP_SCHEMES))
            .transpose()
    }

    pub fn ws_resolver(&self) -> Result<Option<TargetResolver>, ConfigError> {
        self.ws
            .as_ref()
            .map(|targets| targets.resolver("ws", WS_SCHEMES))
            .transpose()
    }

    pub fn tcp_targets(&self) -> Result<Option<TcpTargets>, ConfigError> {
        if self.tcp.is_empty() {
            return Ok(None);
        }
        TcpTargets::new(self.tcp.clone())
            .map(Some)
            .map_err(|source| ConfigError::Targets {
                section: "tcp",
                source,
            })
    }

    /// Build a dispatcher over the configured tables
    pub fn build_dispatcher(
        &self,
        observer: Option<Arc<dyn DispatchObserver>>,
    ) -> Result<Dispatcher, ConfigError> {
        let mut builder = Dispatcher::builder();
        if let Some(resolver) = self.http_resolver()? {
            builder = builder.http(resolver);
        }
        if let Some(resolver) = self.ws_resolver()? {
            builder = builder.ws(resolver);
        }
        if let Some(targets) = self.tcp_targets()? {
            builder = builder.tcp(targets);
        }
        if let Some(observer) = observer {
            builder = builder.observer(observer);
        }
        Ok(builder.build())
    }
}
