//! Descriptor to backend URL resolution for HTTP and WebSocket streams
//!
//! Precedence, first match wins:
//! - full descriptor (`host:port`)
//! - port alone
//! - host alone
//! - default target

use crate::{split_host_port, MatchedBy, RouterError};
use std::collections::HashMap;
use tracing::trace;
use url::Url;

/// A successful lookup
#[derive(Debug, PartialEq, Eq)]
pub struct Resolution<'a, T> {
    pub target: &'a T,
    pub matched_by: MatchedBy,
}

impl<T> Clone for Resolution<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Resolution<'_, T> {}

/// Resolve `descriptor` against `table`, falling back to `default`.
///
/// With no table (single-backend mode) the default is returned as is.
/// Descriptors that cannot be split into host and port skip the port step and
/// use the whole descriptor as host.
pub fn resolve<'a, T>(
    descriptor: &str,
    table: Option<&'a HashMap<String, T>>,
    default: Option<&'a T>,
) -> Option<Resolution<'a, T>> {
    let fallback = default.map(|target| Resolution {
        target,
        matched_by: MatchedBy::Default,
    });

    let Some(table) = table else {
        return fallback;
    };

    if let Some(target) = table.get(descriptor) {
        return Some(Resolution {
            target,
            matched_by: MatchedBy::HostPort,
        });
    }

    let host = match split_host_port(descriptor) {
        Some((host, port)) => {
            if let Some(target) = table.get(port) {
                return Some(Resolution {
                    target,
                    matched_by: MatchedBy::Port,
                });
            }
            host
        }
        None => descriptor,
    };

    if let Some(target) = table.get(host) {
        return Some(Resolution {
            target,
            matched_by: MatchedBy::Host,
        });
    }

    fallback
}

/// Resolver for URL targets (HTTP and WebSocket relays)
#[derive(Debug, Clone)]
pub struct TargetResolver {
    table: Option<HashMap<String, Url>>,
    default: Option<Url>,
}

impl TargetResolver {
    /// Single-backend mode: every descriptor resolves to `default`
    pub fn single(default: Url) -> Self {
        Self {
            table: None,
            default: Some(default),
        }
    }

    /// Table mode with an optional default
    pub fn multi(table: HashMap<String, Url>, default: Option<Url>) -> Self {
        Self {
            table: Some(table),
            default,
        }
    }

    /// Build from raw configuration strings.
    ///
    /// Every URL must use one of `schemes` and carry a host. An empty route map
    /// selects single-backend mode, which then requires a default.
    pub fn parse(
        default: Option<&str>,
        routes: &HashMap<String, String>,
        schemes: &[&str],
    ) -> Result<Self, RouterError> {
        let default = default
            .map(|raw| parse_target("default", raw, schemes))
            .transpose()?;

        if routes.is_empty() {
            return default.map(Self::single).ok_or(RouterError::Empty);
        }

        let table = routes
            .iter()
            .map(|(selector, raw)| Ok((selector.clone(), parse_target(selector, raw, schemes)?)))
            .collect::<Result<HashMap<_, _>, RouterError>>()?;

        Ok(Self::multi(table, default))
    }

    pub fn resolve(&self, descriptor: &str) -> Option<Resolution<'_, Url>> {
        let resolution = resolve(descriptor, self.table.as_ref(), self.default.as_ref());
        trace!(
            descriptor,
            matched_by = ?resolution.map(|r| r.matched_by),
            "Resolved target"
        );
        resolution
    }

    pub fn default_target(&self) -> Option<&Url> {
        self.default.as_ref()
    }

    pub fn is_single(&self) -> bool {
        self.table.is_none()
    }

    /// Table entries sorted by selector
    pub fn routes(&self) -> Vec<(&str, &Url)> {
        let mut routes: Vec<_> = self
            .table
            .iter()
            .flatten()
            .map(|(selector, url)| (selector.as_str(), url))
            .collect();
        routes.sort_by(|a, b| a.0.cmp(b.0));
        routes
    }
}

fn parse_target(selector: &str, raw: &str, schemes: &[&str]) -> Result<Url, RouterError> {
    let invalid = |reason: String| RouterError::InvalidTarget {
        selector: selector.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(format!("{}: {}", raw, e)))?;
    if !schemes.contains(&url.scheme()) {
        return Err(invalid(format!(
            "unsupported scheme {:?}, expected one of {:?}",
            url.scheme(),
            schemes
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid(format!("{} has no host", raw)));
    }
    Ok(url)
}
