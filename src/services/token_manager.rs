//! Token manager.
//!
//! Produces a valid upstream access token for a user, refreshing via the
//! OAuth refresh-token exchange when the stored token is expired. A rejected
//! refresh (revoked refresh token) is terminal for the current sync attempt
//! and surfaces as `AuthenticationExpired`, never as a generic failure.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::user::{self, User};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// Tokens expiring within this window are refreshed eagerly, so a token
/// cannot expire mid-fetch.
const EXPIRY_SKEW_SECS: i64 = 60;

/// OAuth application credentials for the refresh exchange.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// Token refresh response from `POST /oauth/token`.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    /// Lifetime of the access token in seconds.
    expires_in: i64,
}

/// Whether a stored token is still usable at `now`.
fn token_is_fresh(expires_at: Option<i64>, now: i64) -> bool {
    matches!(expires_at, Some(exp) if exp > now + EXPIRY_SKEW_SECS)
}

/// Get a valid access token for a user, refreshing if expired.
///
/// The refreshed token set is persisted in a single write before being
/// returned, so a concurrent reader never observes a token without its
/// matching expiry. The deadline is applied per request, so a runtime
/// timeout change reaches the refresh exchange without a client rebuild.
pub async fn get_access_token(
    pool: &DbPool,
    http: &Client,
    oauth: &OAuthConfig,
    user: &User,
    timeout: Duration,
) -> Result<String, AppError> {
    if user.needs_reauth {
        return Err(AppError::authentication_expired_for_user(
            "User requires re-authentication",
            user.id,
        ));
    }

    let now = Utc::now().timestamp();
    if let Some(token) = &user.access_token {
        if token_is_fresh(user.token_expires_at, now) {
            return Ok(token.clone());
        }
    }

    let Some(refresh_token) = &user.refresh_token else {
        user::mark_needs_reauth(pool, user.id).await?;
        return Err(AppError::authentication_expired_for_user(
            "No refresh token stored",
            user.id,
        ));
    };

    let url = format!(
        "{}/oauth/token",
        user.gitlab_base_url.trim_end_matches('/')
    );
    let response = http
        .post(&url)
        .timeout(timeout)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", oauth.client_id.as_str()),
            ("client_secret", oauth.client_secret.as_str()),
        ])
        .send()
        .await?;

    let status = response.status();
    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
        // The refresh token itself was rejected; only re-authentication helps.
        user::mark_needs_reauth(pool, user.id).await?;
        return Err(AppError::authentication_expired_for_user(
            "Refresh token rejected by GitLab. Please re-authenticate.",
            user.id,
        ));
    }
    if !status.is_success() {
        return Err(AppError::gitlab_api_full(
            "Token refresh failed",
            status.as_u16(),
            "/oauth/token",
        ));
    }

    let tokens: TokenResponse = response
        .json()
        .await
        .map_err(|e| AppError::internal(format!("Failed to parse token response: {}", e)))?;

    let expires_at = now + tokens.expires_in;
    user::store_tokens(
        pool,
        user.id,
        &tokens.access_token,
        &tokens.refresh_token,
        expires_at,
    )
    .await?;

    log::info!("Refreshed access token for user {}", user.id);
    Ok(tokens.access_token)
}
