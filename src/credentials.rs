//! Container registry Docker credentials: issue, expiry tracking, revocation.
//!
//! The API hands out a Docker `config.json` document whose
//! `auths.<registry>.auth` field is `base64(token:token)`. The embedded token
//! is an OAuth token, so revoking a credential means posting that token to the
//! OAuth revocation endpoint.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::client::{ApiRequest, Client, Method};
use crate::context::OpContext;
use crate::error::{ApiError, ProviderError};
use crate::lookup::parse_timestamp;
use crate::types::Sensitive;

/// Largest TTL the API accepts (about 50 years); also the default.
pub const MAX_EXPIRY_SECONDS: i64 = 1_576_800_000;

/// OAuth token revocation endpoint.
pub const OAUTH_REVOKE_URL: &str = "https://cloud.digitalocean.com/v1/oauth/revoke";

/// Docker credentials endpoint.
pub const DOCKER_CREDENTIALS_PATH: &str = "/v2/registry/docker-credentials";

const NO_TOKEN: &str = "unable to find OAuth token";

/// An issued credential.
#[derive(Debug, Clone)]
pub struct DockerCredential {
    /// The Docker `config.json` document.
    pub docker_config: Sensitive<String>,
    /// When it was issued.
    pub issued_at: DateTime<Utc>,
    /// When it stops working.
    pub expires_at: DateTime<Utc>,
}

impl DockerCredential {
    /// Expiry rendered for state (RFC 3339, seconds precision).
    pub fn expiration_time(&self) -> String {
        self.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Resolve a configured TTL; `0` means the maximum.
pub fn effective_ttl(expiry_seconds: i64) -> Result<i64, ProviderError> {
    if !(0..=MAX_EXPIRY_SECONDS).contains(&expiry_seconds) {
        return Err(ProviderError::Validation(format!(
            "expiry_seconds must be between 0 and {}, got {}",
            MAX_EXPIRY_SECONDS, expiry_seconds
        )));
    }
    Ok(if expiry_seconds == 0 {
        MAX_EXPIRY_SECONDS
    } else {
        expiry_seconds
    })
}

/// Request a new credential valid for `expiry_seconds` from `now`.
pub async fn issue(
    ctx: &OpContext,
    client: &Client,
    read_write: bool,
    expiry_seconds: i64,
    now: DateTime<Utc>,
) -> Result<DockerCredential, ProviderError> {
    let ttl = effective_ttl(expiry_seconds)?;
    let read_write_param = read_write.to_string();
    let ttl_param = ttl.to_string();
    let body = client
        .get(
            ctx,
            DOCKER_CREDENTIALS_PATH,
            &[("read_write", read_write_param.as_str()), ("expiry_seconds", ttl_param.as_str())],
        )
        .await?;
    if !body.get("auths").is_some_and(Value::is_object) {
        return Err(ProviderError::Parse(
            "docker credentials response has no `auths` document".to_string(),
        ));
    }

    debug!(read_write, ttl, "issued docker credentials");
    Ok(DockerCredential {
        docker_config: Sensitive::new(serde_json::to_string(&body)?),
        issued_at: now,
        expires_at: now + ChronoDuration::seconds(ttl),
    })
}

/// Whether a stored expiry has passed. A missing or unreadable expiry counts
/// as expired.
pub fn is_expired(expiration_time: Option<&str>, now: DateTime<Utc>) -> bool {
    match parse_timestamp(expiration_time) {
        Some(expires_at) => now >= expires_at,
        None => true,
    }
}

/// Reissue the credential when the stored expiry has passed.
///
/// Returns the new credential, or `None` when the current one is still valid.
pub async fn refresh_if_expired(
    ctx: &OpContext,
    client: &Client,
    read_write: bool,
    expiry_seconds: i64,
    expiration_time: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<DockerCredential>, ProviderError> {
    if !is_expired(expiration_time, now) {
        return Ok(None);
    }
    info!(expired_at = expiration_time.unwrap_or(""), "docker credentials expired, reissuing");
    issue(ctx, client, read_write, expiry_seconds, now)
        .await
        .map(Some)
}

/// Recover the OAuth token embedded in a Docker `config.json` document.
pub fn extract_oauth_token(docker_config: &str) -> Result<Sensitive<String>, ProviderError> {
    let no_token = || ProviderError::Parse(NO_TOKEN.to_string());

    let document: Value = serde_json::from_str(docker_config).map_err(|_| no_token())?;
    let auth = document
        .get("auths")
        .and_then(Value::as_object)
        .and_then(|auths| auths.values().next())
        .and_then(|entry| entry.get("auth"))
        .and_then(Value::as_str)
        .ok_or_else(no_token)?;
    let decoded = STANDARD.decode(auth).map_err(|_| no_token())?;
    let decoded = String::from_utf8(decoded).map_err(|_| no_token())?;

    let parts: Vec<&str> = decoded.split(':').collect();
    match parts.as_slice() {
        [token, _] if !token.is_empty() => Ok(Sensitive::new(token.to_string())),
        _ => Err(no_token()),
    }
}

/// Revoke the OAuth token inside a credential. Anything but 200 fails.
pub async fn revoke(ctx: &OpContext, client: &Client, docker_config: &str) -> Result<(), ProviderError> {
    let token = extract_oauth_token(docker_config)?;
    let request = ApiRequest::new(Method::Post, OAUTH_REVOKE_URL)
        .with_form(vec![("token".to_string(), token.expose().clone())])
        .with_bearer(token);
    let response = client.execute(ctx, request).await?;
    if response.status != 200 {
        return Err(ApiError::new(
            "POST",
            OAUTH_REVOKE_URL,
            response.status,
            format!("Error revoking docker credentials: unexpected status {}", response.status),
        )
        .into());
    }
    info!("revoked docker credentials");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ApiResponse, Body};
    use crate::testing::MockTransport;
    use chrono::TimeZone;
    use serde_json::json;

    fn config_for(token: &str) -> Value {
        let auth = STANDARD.encode(format!("{}:{}", token, token));
        json!({"auths": {"registry.digitalocean.com": {"auth": auth}}})
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_issue_records_expiry() {
        let mock = MockTransport::new().on(Method::Get, DOCKER_CREDENTIALS_PATH, 200, config_for("tok"));
        let credential = issue(&OpContext::new(), &mock.client(), true, 3600, t0())
            .await
            .unwrap();
        assert_eq!(credential.expires_at - credential.issued_at, ChronoDuration::seconds(3600));
        assert_eq!(credential.expiration_time(), "2024-05-01T13:00:00Z");
        assert!(credential.docker_config.expose().contains("registry.digitalocean.com"));

        let request = &mock.requests_to(Method::Get, DOCKER_CREDENTIALS_PATH)[0];
        assert_eq!(request.query_param("read_write"), Some("true"));
        assert_eq!(request.query_param("expiry_seconds"), Some("3600"));
    }

    #[tokio::test]
    async fn test_zero_ttl_means_maximum() {
        let mock = MockTransport::new().on(Method::Get, DOCKER_CREDENTIALS_PATH, 200, config_for("tok"));
        let credential = issue(&OpContext::new(), &mock.client(), false, 0, t0())
            .await
            .unwrap();
        assert_eq!(
            credential.expires_at,
            t0() + ChronoDuration::seconds(MAX_EXPIRY_SECONDS)
        );
        assert!(credential.expires_at > credential.issued_at);
    }

    #[test]
    fn test_ttl_range() {
        assert!(effective_ttl(-1).is_err());
        assert!(effective_ttl(MAX_EXPIRY_SECONDS + 1).is_err());
        assert_eq!(effective_ttl(60).unwrap(), 60);
    }

    #[tokio::test]
    async fn test_refresh_only_when_expired() {
        let mock = MockTransport::new().on(Method::Get, DOCKER_CREDENTIALS_PATH, 200, config_for("tok"));
        let client = mock.client();
        let ctx = OpContext::new();
        let stored = "2024-05-01T13:00:00Z";

        let fresh = refresh_if_expired(&ctx, &client, true, 3600, Some(stored), t0())
            .await
            .unwrap();
        assert!(fresh.is_none());
        assert_eq!(mock.count(Method::Get, DOCKER_CREDENTIALS_PATH), 0);

        let later = t0() + ChronoDuration::seconds(3601);
        let reissued = refresh_if_expired(&ctx, &client, true, 3600, Some(stored), later)
            .await
            .unwrap()
            .unwrap();
        assert!(reissued.expires_at > later);

        let never_set = refresh_if_expired(&ctx, &client, true, 3600, None, t0())
            .await
            .unwrap();
        assert!(never_set.is_some());
    }

    #[test]
    fn test_extract_oauth_token() {
        let token = extract_oauth_token(&config_for("abc123").to_string()).unwrap();
        assert_eq!(token.expose(), "abc123");
    }

    #[test]
    fn test_extract_oauth_token_failures() {
        let three_parts = STANDARD.encode("a:b:c");
        let cases = vec![
            "not json".to_string(),
            json!({"auths": {}}).to_string(),
            json!({"auths": {"r": {"auth": "%%%"}}}).to_string(),
            json!({"auths": {"r": {"auth": three_parts}}}).to_string(),
        ];
        for case in cases {
            let err = extract_oauth_token(&case).unwrap_err();
            assert_eq!(err.message(), NO_TOKEN, "{case}");
        }
    }

    #[tokio::test]
    async fn test_revoke_posts_token() {
        let mock = MockTransport::new().on(Method::Post, OAUTH_REVOKE_URL, 200, json!({}));
        revoke(&OpContext::new(), &mock.client(), &config_for("abc123").to_string())
            .await
            .unwrap();

        let request = &mock.requests_to(Method::Post, OAUTH_REVOKE_URL)[0];
        assert_eq!(
            request.body,
            Some(Body::Form(vec![("token".to_string(), "abc123".to_string())]))
        );
        assert_eq!(request.bearer.as_ref().map(|t| t.expose().as_str()), Some("abc123"));
    }

    #[tokio::test]
    async fn test_revoke_requires_200() {
        let mock = MockTransport::new().on_response(Method::Post, OAUTH_REVOKE_URL, ApiResponse::new(204, Value::Null));
        let result = revoke(&OpContext::new(), &mock.client(), &config_for("abc123").to_string()).await;
        let err = tokio_test::assert_err!(result);
        assert_eq!(err.status(), Some(204));

        let mock = MockTransport::new().on(Method::Post, OAUTH_REVOKE_URL, 401, json!({"id": "unauthorized", "message": "bad token"}));
        let result = revoke(&OpContext::new(), &mock.client(), &config_for("abc123").to_string()).await;
        assert_eq!(tokio_test::assert_err!(result).status(), Some(401));
    }
}
