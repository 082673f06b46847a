use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, StatusCode},
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use market_core::MarketContext;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// JWT claims issued by the identity provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

const PUBLIC_PATHS: [&str; 2] = ["/health", "/api/v1/auth/account-type"];

fn extract_token(auth_header: Option<&str>) -> Option<String> {
    auth_header?
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Browsers cannot set headers on a WebSocket upgrade, so `/ws` also accepts
/// `?token=`.
fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
        .filter(|s| !s.is_empty())
}

pub fn generate_token(user_id: &str, secret: &str, expires_in_days: u64) -> Result<String, StatusCode> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .as_secs() as usize;

    let claims = Claims {
        sub: user_id.to_string(),
        exp: now + (expires_in_days * 24 * 60 * 60) as usize,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref())).map_err(|e| {
        tracing::error!("Failed to generate JWT token: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Returns the user id carried in `sub`.
pub fn verify_token(token: &str, secret: &str) -> Result<String, StatusCode> {
    let decoding_key = DecodingKey::from_secret(secret.as_ref());

    match decode::<Claims>(token, &decoding_key, &Validation::default()) {
        Ok(token_data) => Ok(token_data.claims.sub),
        Err(e) => {
            tracing::debug!("JWT verification failed: {}", e);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

pub async fn auth_middleware(
    mut req: Request,
    next: axum::middleware::Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();
    if PUBLIC_PATHS.contains(&path) {
        return Ok(next.run(req).await);
    }

    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    let token = extract_token(header).or_else(|| {
        if path == "/ws" {
            query_token(req.uri().query())
        } else {
            None
        }
    });

    let token = match token {
        Some(t) => t,
        None => {
            tracing::debug!("Missing bearer token for {}", path);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let ctx = req
        .extensions()
        .get::<MarketContext>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    let user_id = verify_token(&token, &ctx.config.server.jwt_secret)?;
    tracing::debug!("Authenticated user: {}", user_id);
    req.extensions_mut().insert(AuthenticatedUser { user_id });

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip_uses_sub() {
        let token = generate_token("user-1", "secret", 1).unwrap();
        assert_eq!(verify_token(&token, "secret").unwrap(), "user-1");
        assert_eq!(verify_token(&token, "other").unwrap_err(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(extract_token(Some("Bearer abc")).as_deref(), Some("abc"));
        assert_eq!(extract_token(Some("Basic abc")), None);
        assert_eq!(extract_token(Some("Bearer ")), None);
        assert_eq!(extract_token(None), None);
    }

    #[test]
    fn test_query_token() {
        assert_eq!(query_token(Some("table=leads&token=xyz")).as_deref(), Some("xyz"));
        assert_eq!(query_token(Some("table=leads")), None);
        assert_eq!(query_token(None), None);
    }
}
