//! Proxy authorization
//!
//! Tunnel clients authenticate with `Proxy-Authorization: Basic`; the user
//! name is the access token and the password is ignored.

use base64::{engine::general_purpose::STANDARD, Engine};
use hyper::header::{HeaderMap, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Body, Response, StatusCode};

/// Realm advertised in the 407 challenge
pub const PROXY_REALM: &str = "zns";

/// Token carried by the Basic proxy credentials, if any
pub fn proxy_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(PROXY_AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let username = credentials
        .split_once(':')
        .map_or(credentials.as_str(), |(user, _)| user);

    if username.is_empty() {
        None
    } else {
        Some(username.to_string())
    }
}

/// 407 challenge
pub fn proxy_auth_required() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    if let Ok(value) = format!("Basic realm=\"{}\"", PROXY_REALM).parse() {
        response.headers_mut().insert(PROXY_AUTHENTICATE, value);
    }
    response
}
