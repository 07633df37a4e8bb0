//! Login route issuing API keys.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, header::AUTHORIZATION},
    routing::post,
};
use base64::Engine as _;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::LoginResponse;
use crate::api::server::AppState;

/// Create the auth router.
pub fn router() -> Router<AppState> {
    Router::new().route("/login", post(login))
}

async fn login(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<LoginResponse>> {
    let (username, password) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic_credentials)
        .ok_or_else(|| ApiError::unauthorized("Missing basic credentials"))?;

    let issued = state
        .api_keys
        .login(&username, &password)
        .ok_or_else(|| ApiError::unauthorized("Invalid credentials"))?;

    Ok(Json(LoginResponse {
        message: "Login successful",
        expiration: issued.expires_at.timestamp(),
        api_key: issued.api_key,
    }))
}

/// Decode an `Authorization: Basic <base64(user:pass)>` header value.
fn parse_basic_credentials(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_credentials() {
        assert_eq!(
            parse_basic_credentials("Basic dXNlcjpwYXNz"),
            Some(("user".to_string(), "pass".to_string()))
        );
        assert_eq!(
            parse_basic_credentials("basic QWRtaW46MTI6MzQ="),
            Some(("Admin".to_string(), "12:34".to_string()))
        );
        assert!(parse_basic_credentials("Bearer token").is_none());
        assert!(parse_basic_credentials("Basic !!!").is_none());
    }
}
