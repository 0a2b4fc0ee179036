//! Request rewriting towards a resolved backend URL
//!
//! Shared by the HTTP and WebSocket relays. Pure: the inbound head is never
//! modified, a new head is returned alongside the backend's address.

use crate::error::RelayError;
use crate::http_parser::RequestHead;
use url::Url;

/// A request head rewritten for one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenRequest {
    pub head: RequestHead,
    /// Backend scheme (`http` or `ws`)
    pub scheme: String,
    /// Value of the rewritten Host header (`host[:port]`)
    pub authority: String,
    /// Address to dial (`host:port`, port defaulted from the scheme)
    pub address: String,
}

/// Join a base path and a request path with exactly one slash between them
pub fn join_path(base: &str, path: &str) -> String {
    if base.is_empty() || base == "/" {
        return path.to_string();
    }
    if path.is_empty() || path == "/" {
        return base.to_string();
    }
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Merge the target's base query with the request query
pub fn merge_query(target: &str, request: &str) -> String {
    match (target.is_empty(), request.is_empty()) {
        (false, false) => format!("{}&{}", target, request),
        (false, true) => target.to_string(),
        (true, _) => request.to_string(),
    }
}

/// Rewrite `head` so it can be sent to `target`
pub fn rewrite_request(head: &RequestHead, target: &Url) -> Result<RewrittenRequest, RelayError> {
    let host = target
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| RelayError::NoTarget(format!("{} has no host", target)))?;
    let port = target
        .port_or_known_default()
        .ok_or_else(|| RelayError::NoTarget(format!("{} has no port", target)))?;

    let authority = match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let (request_path, request_query) = head.path_and_query()?;
    let mut path = join_path(target.path(), &request_path);
    if path.is_empty() {
        path.push('/');
    }
    let query = merge_query(target.query().unwrap_or_default(), &request_query);

    let mut rewritten = head.clone();
    rewritten.target = if query.is_empty() {
        path
    } else {
        format!("{}?{}", path, query)
    };
    rewritten.set_header("Host", &authority);
    if !rewritten.has_header("user-agent") {
        rewritten.set_header("User-Agent", "");
    }

    Ok(RewrittenRequest {
        head: rewritten,
        scheme: target.scheme().to_string(),
        address: format!("{}:{}", host, port),
        authority,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/base", "/p"), "/base/p");
        assert_eq!(join_path("", "/p"), "/p");
        assert_eq!(join_path("/", "/p"), "/p");
        assert_eq!(join_path("/base", ""), "/base");
        assert_eq!(join_path("/base", "/"), "/base");
        assert_eq!(join_path("/a/", "/b"), "/a/b");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(join_path("/a/", "b"), "/a/b");
    }

    #[test]
    fn test_merge_query() {
        assert_eq!(merge_query("x=1", "y=2"), "x=1&y=2");
        assert_eq!(merge_query("", "y=2"), "y=2");
        assert_eq!(merge_query("x=1", ""), "x=1");
        assert_eq!(merge_query("", ""), "");
    }

    #[test]
    fn test_rewrite_request() {
        let head = RequestHead::new("GET", "/users?page=2")
            .with_header("Host", "app.example.com")
            .with_header("User-Agent", "curl/8.0");
        let target = Url::parse("http://127.0.0.1:3000/api?key=abc").unwrap();

        let rewritten = rewrite_request(&head, &target).unwrap();
        assert_eq!(rewritten.head.target, "/api/users?key=abc&page=2");
        assert_eq!(rewritten.head.header("host"), Some("127.0.0.1:3000"));
        assert_eq!(rewritten.head.header("user-agent"), Some("curl/8.0"));
        assert_eq!(rewritten.address, "127.0.0.1:3000");
        assert_eq!(rewritten.scheme, "http");

        // The inbound head is left untouched
        assert_eq!(head.target, "/users?page=2");
        assert_eq!(head.header("host"), Some("app.example.com"));
    }

    #[test]
    fn test_rewrite_sets_empty_user_agent() {
        let head = RequestHead::new("GET", "/").with_header("Host", "a.com");
        let target = Url::parse("http://localhost").unwrap();

        let rewritten = rewrite_request(&head, &target).unwrap();
        assert_eq!(rewritten.head.header("user-agent"), Some(""));
        assert_eq!(rewritten.head.header("host"), Some("localhost"));
        assert_eq!(rewritten.head.target, "/");
        assert_eq!(rewritten.address, "localhost:80");
    }

    #[test]
    fn test_rewrite_absolute_form_and_ws_scheme() {
        let head = RequestHead::new("GET", "http://public.example.com/chat?room=1");
        let target = Url::parse("ws://[::1]:9000/socket").unwrap();

        let rewritten = rewrite_request(&head, &target).unwrap();
        assert_eq!(rewritten.head.target, "/socket/chat?room=1");
        assert_eq!(rewritten.head.header("host"), Some("[::1]:9000"));
        assert_eq!(rewritten.address, "[::1]:9000");
        assert_eq!(rewritten.scheme, "ws");
    }
}
