//! TCP port-based routing
//!
//! Exact match only: the selector must equal a configured key.

use crate::{split_host_port, RouterError};
use std::collections::HashMap;
use tracing::trace;

/// Exposed port identifier to local backend address (`host:port`)
#[derive(Debug, Clone, Default)]
pub struct TcpTargets {
    routes: HashMap<String, String>,
}

impl TcpTargets {
    /// Build the table, validating every backend address
    pub fn new(routes: HashMap<String, String>) -> Result<Self, RouterError> {
        for (selector, address) in &routes {
            let valid = split_host_port(address)
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(RouterError::InvalidAddress {
                    selector: selector.clone(),
                    address: address.clone(),
                });
            }
        }
        Ok(Self { routes })
    }

    /// Port selector for a forwarding descriptor: the port of `host:port`,
    /// otherwise the descriptor itself
    pub fn selector_for(descriptor: &str) -> &str {
        split_host_port(descriptor)
            .map(|(_, port)| port)
            .unwrap_or(descriptor)
    }

    /// Lookup backend address by selector
    pub fn lookup(&self, selector: &str) -> Option<&str> {
        trace!("Looking up TCP target for {}", selector);
        self.routes.get(selector).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Entries sorted by selector
    pub fn routes(&self) -> Vec<(&str, &str)> {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .map(|(selector, address)| (selector.as_str(), address.as_str()))
            .collect();
        routes.sort();
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> TcpTargets {
        TcpTargets::new(HashMap::from([
            ("5432".to_string(), "localhost:5432".to_string()),
            ("2222".to_string(), "127.0.0.1:22".to_string()),
        ]))
        .unwrap()
    }

    #[test]
    fn test_tcp_lookup_exact() {
        let targets = targets();
        assert_eq!(targets.lookup("5432"), Some("localhost:5432"));
        assert_eq!(targets.lookup("2222"), Some("127.0.0.1:22"));
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_tcp_lookup_has_no_fallback() {
        let targets = targets();
        assert_eq!(targets.lookup("9999"), None);
        assert_eq!(targets.lookup("0.0.0.0:5432"), None);
        assert_eq!(targets.lookup("localhost"), None);
    }

    #[test]
    fn test_selector_for() {
        assert_eq!(TcpTargets::selector_for("0.0.0.0:5432"), "5432");
        assert_eq!(TcpTargets::selector_for("[::]:2222"), "2222");
        assert_eq!(TcpTargets::selector_for("5432"), "5432");
    }

    #[test]
    fn test_tcp_rejects_bad_address() {
        let result = TcpTargets::new(HashMap::from([(
            "5432".to_string(),
            "localhost".to_string(),
        )]));
        assert!(matches!(result, Err(RouterError::InvalidAddress { .. })));

        let result = TcpTargets::new(HashMap::from([(
            "5432".to_string(),
            "localhost:99999".to_string(),
        )]));
        assert!(result.is_err());
    }
}
