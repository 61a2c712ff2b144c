//! Access control for collaborator endpoints and sync connections.
//!
//! This module handles:
//! - Capability token issue and verification
//! - Loopback detection for local-trust admission
//! - Client address extraction behind an optional reverse proxy
//! - The remote-auth guard of the project-scoped HTTP endpoints

pub mod token;

pub use token::{TokenClaims, TokenCodec, TokenError};

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Errors from the remote-auth guard
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("Token is for another project")]
    ProjectMismatch,
}

/// Loopback, including IPv4-mapped IPv6 loopback
pub fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().map_or(false, |v4| v4.is_loopback()),
    }
}

/// Address of the client. The first `X-Forwarded-For` entry is used only
/// when the deployment sits behind a trusted proxy.
pub fn client_ip(peer: SocketAddr, headers: &HeaderMap, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

/// Token from an `Authorization: Bearer` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Guard for project-scoped endpoints: loopback callers pass, everyone else
/// needs a valid token for `project_id`.
pub fn authorize_project_request(
    codec: &TokenCodec,
    require_token: bool,
    ip: IpAddr,
    token: Option<&str>,
    project_id: &str,
) -> Result<(), AuthError> {
    if !require_token || is_local_address(ip) {
        return Ok(());
    }

    let token = token.ok_or(AuthError::MissingToken)?;
    let claims = codec.verify(token)?;
    if claims.project_id != project_id {
        return Err(AuthError::ProjectMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn codec() -> TokenCodec {
        TokenCodec::new("guard-secret", 3600).unwrap()
    }

    #[test]
    fn test_local_addresses() {
        assert!(is_local_address("127.0.0.1".parse().unwrap()));
        assert!(is_local_address("127.8.9.10".parse().unwrap()));
        assert!(is_local_address("::1".parse().unwrap()));
        assert!(is_local_address("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_local_address("10.0.0.5".parse().unwrap()));
        assert!(!is_local_address("::ffff:192.168.1.2".parse().unwrap()));
    }

    #[test]
    fn test_forwarded_for_only_when_trusted() {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));

        assert_eq!(client_ip(peer, &headers, false), peer.ip());
        assert_eq!(
            client_ip(peer, &headers, true),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );

        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(client_ip(peer, &headers, true), peer.ip());
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer op1.abc.def"));
        assert_eq!(bearer_token(&headers), Some("op1.abc.def"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_authorize_project_request() {
        let codec = codec();
        let remote: IpAddr = "198.51.100.4".parse().unwrap();
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let token = codec.issue_invite("proj-a").unwrap();

        assert!(authorize_project_request(&codec, true, local, None, "proj-a").is_ok());
        assert!(authorize_project_request(&codec, false, remote, None, "proj-a").is_ok());
        assert_eq!(
            authorize_project_request(&codec, true, remote, None, "proj-a"),
            Err(AuthError::MissingToken)
        );
        assert!(authorize_project_request(&codec, true, remote, Some(&token), "proj-a").is_ok());
        assert_eq!(
            authorize_project_request(&codec, true, remote, Some(&token), "proj-b"),
            Err(AuthError::ProjectMismatch)
        );
        assert!(matches!(
            authorize_project_request(&codec, true, remote, Some("op1.x.y"), "proj-a"),
            Err(AuthError::InvalidToken(_))
        ));
    }
}
