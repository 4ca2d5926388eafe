//! Provider configuration.
//!
//! The `provider` block is validated with the same schema machinery as
//! resources, then resolved into a [`ProviderConfig`]. Attributes left unset
//! fall back to environment variables; the lookup is injectable so tests never
//! touch the process environment.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::ProviderError;
use crate::retry::Backoff;
use crate::schema::{Attribute, AttributeFlags, AttributeType, Schema, Validator};
use crate::types::Sensitive;
use crate::validation;

/// Default DigitalOcean API base URL.
pub const DEFAULT_API_ENDPOINT: &str = "https://api.digitalocean.com";

/// Default Spaces endpoint template.
pub const DEFAULT_SPACES_ENDPOINT: &str = "https://{{.Region}}.digitaloceanspaces.com";

/// Default host version reported in the User-Agent.
pub const DEFAULT_HOST_VERSION: &str = "0.11+compatible";

const REGION_PLACEHOLDER: &str = "{{.Region}}";

/// Environment lookup used to fill unset attributes.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Reads the real process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    token: Option<String>,
    api_endpoint: Option<String>,
    spaces_endpoint: Option<String>,
    spaces_access_id: Option<String>,
    spaces_secret_key: Option<String>,
    requests_per_second: Option<f64>,
    http_retry_max: Option<i64>,
    http_retry_wait_min: Option<f64>,
    http_retry_wait_max: Option<f64>,
    host_version: Option<String>,
}

/// Resolved provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// API token.
    pub token: Sensitive<String>,
    /// API base URL.
    pub api_endpoint: Url,
    /// Spaces endpoint template containing `{{.Region}}`.
    pub spaces_endpoint: String,
    /// Spaces access key id.
    pub spaces_access_id: Option<Sensitive<String>>,
    /// Spaces secret key.
    pub spaces_secret_key: Option<Sensitive<String>>,
    /// Static request ceiling; 0 means unlimited.
    pub requests_per_second: f64,
    /// Maximum HTTP-level retries for 429/5xx and connection failures.
    pub http_retry_max: u32,
    /// Lower bound of the HTTP retry backoff.
    pub http_retry_wait_min: Duration,
    /// Upper bound of the HTTP retry backoff.
    pub http_retry_wait_max: Duration,
    /// Host version reported in the User-Agent.
    pub host_version: String,
}

impl ProviderConfig {
    /// Schema of the `provider` block.
    pub fn schema() -> Schema {
        Schema::v0()
            .with_description("DigitalOcean provider configuration")
            .with_attribute(
                "token",
                Attribute::optional_string()
                    .sensitive()
                    .with_description("The token key for API operations."),
            )
            .with_attribute(
                "api_endpoint",
                Attribute::optional_string()
                    .with_description("The URL to use for the DigitalOcean API."),
            )
            .with_attribute(
                "spaces_endpoint",
                Attribute::optional_string()
                    .with_description("The URL to use for the DigitalOcean Spaces API."),
            )
            .with_attribute(
                "spaces_access_id",
                Attribute::optional_string().sensitive(),
            )
            .with_attribute(
                "spaces_secret_key",
                Attribute::optional_string().sensitive(),
            )
            .with_attribute(
                "requests_per_second",
                Attribute::new(AttributeType::Float64, AttributeFlags::optional())
                    .with_validator(Validator::float_between(0.0, f64::MAX)),
            )
            .with_attribute(
                "http_retry_max",
                Attribute::optional_int64().with_validator(Validator::int_between(0, 100)),
            )
            .with_attribute("http_retry_wait_min", Attribute::optional_float64())
            .with_attribute("http_retry_wait_max", Attribute::optional_float64())
            .with_attribute("host_version", Attribute::optional_string())
    }

    /// Resolve a configuration value against the process environment.
    pub fn from_value(value: &Value) -> Result<Self, ProviderError> {
        Self::from_value_with_env(value, &process_env)
    }

    /// Resolve a configuration value against an injected environment.
    pub fn from_value_with_env(value: &Value, env: EnvLookup<'_>) -> Result<Self, ProviderError> {
        let mut value = if value.is_null() {
            Value::Object(Default::default())
        } else {
            value.clone()
        };
        let schema = Self::schema();
        validation::coerce(&schema, &mut value);
        let diagnostics = validation::validate(&schema, &value);
        if let Some(err) = ProviderError::from_diagnostics(&diagnostics) {
            return Err(err);
        }
        let raw: RawConfig = serde_json::from_value(value)?;

        let token = non_empty(raw.token)
            .or_else(|| env("DIGITALOCEAN_TOKEN"))
            .or_else(|| env("DIGITALOCEAN_ACCESS_TOKEN"))
            .ok_or_else(|| {
                ProviderError::Configuration(
                    "a DigitalOcean API token is required; set `token` or DIGITALOCEAN_TOKEN"
                        .to_string(),
                )
            })?;

        let api_endpoint = non_empty(raw.api_endpoint)
            .or_else(|| env("DIGITALOCEAN_API_URL"))
            .unwrap_or_else(|| DEFAULT_API_ENDPOINT.to_string());
        let api_endpoint = Url::parse(&api_endpoint).map_err(|e| {
            ProviderError::Configuration(format!("invalid api_endpoint {:?}: {}", api_endpoint, e))
        })?;

        let spaces_endpoint = non_empty(raw.spaces_endpoint)
            .or_else(|| env("SPACES_ENDPOINT_URL"))
            .unwrap_or_else(|| DEFAULT_SPACES_ENDPOINT.to_string());

        let requests_per_second = match raw.requests_per_second {
            Some(rps) => rps,
            None => match env("DIGITALOCEAN_REQUESTS_PER_SECOND") {
                Some(s) => s.trim().parse::<f64>().map_err(|_| {
                    ProviderError::Configuration(format!(
                        "DIGITALOCEAN_REQUESTS_PER_SECOND must be a number, got {:?}",
                        s
                    ))
                })?,
                None => 0.0,
            },
        };

        let http_retry_max = match raw.http_retry_max {
            Some(n) => n,
            None => match env("DIGITALOCEAN_HTTP_RETRY_MAX") {
                Some(s) => s.trim().parse::<i64>().map_err(|_| {
                    ProviderError::Configuration(format!(
                        "DIGITALOCEAN_HTTP_RETRY_MAX must be an integer, got {:?}",
                        s
                    ))
                })?,
                None => 4,
            },
        };
        let http_retry_max = u32::try_from(http_retry_max).map_err(|_| {
            ProviderError::Configuration("http_retry_max must not be negative".to_string())
        })?;

        let wait_min = raw.http_retry_wait_min.unwrap_or(1.0);
        let wait_max = raw.http_retry_wait_max.unwrap_or(30.0);
        if wait_min < 0.0 || wait_max < wait_min {
            return Err(ProviderError::Configuration(format!(
                "http_retry_wait_min ({}) must be >= 0 and <= http_retry_wait_max ({})",
                wait_min, wait_max
            )));
        }

        let config = Self {
            token: Sensitive::new(token),
            api_endpoint,
            spaces_endpoint,
            spaces_access_id: non_empty(raw.spaces_access_id)
                .or_else(|| env("SPACES_ACCESS_KEY_ID"))
                .map(Sensitive::new),
            spaces_secret_key: non_empty(raw.spaces_secret_key)
                .or_else(|| env("SPACES_SECRET_ACCESS_KEY"))
                .map(Sensitive::new),
            requests_per_second,
            http_retry_max,
            http_retry_wait_min: seconds("http_retry_wait_min", wait_min)?,
            http_retry_wait_max: seconds("http_retry_wait_max", wait_max)?,
            host_version: non_empty(raw.host_version)
                .unwrap_or_else(|| DEFAULT_HOST_VERSION.to_string()),
        };
        config.request_interval()?;
        let sample = config.spaces_endpoint_for("nyc3");
        Url::parse(&sample).map_err(|e| {
            ProviderError::Configuration(format!(
                "invalid spaces_endpoint {:?}: {}",
                config.spaces_endpoint, e
            ))
        })?;
        Ok(config)
    }

    /// A configuration pointing at `endpoint` with default tuning, for tests
    /// and embedders that build their own transport.
    pub fn for_endpoint(token: impl Into<String>, endpoint: Url) -> Self {
        Self {
            token: Sensitive::new(token.into()),
            api_endpoint: endpoint,
            spaces_endpoint: DEFAULT_SPACES_ENDPOINT.to_string(),
            spaces_access_id: None,
            spaces_secret_key: None,
            requests_per_second: 0.0,
            http_retry_max: 4,
            http_retry_wait_min: Duration::from_secs(1),
            http_retry_wait_max: Duration::from_secs(30),
            host_version: DEFAULT_HOST_VERSION.to_string(),
        }
    }

    /// The User-Agent sent with every API request.
    pub fn user_agent(&self) -> String {
        format!(
            "Terraform/{} hemmer-provider-digitalocean/{}",
            self.host_version,
            env!("CARGO_PKG_VERSION")
        )
    }

    /// Minimum spacing between API requests; `None` when unlimited.
    pub fn request_interval(&self) -> Result<Option<Duration>, ProviderError> {
        if self.requests_per_second > 0.0 {
            seconds("1 / requests_per_second", 1.0 / self.requests_per_second).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Backoff between HTTP-level retries.
    pub fn http_backoff(&self) -> Backoff {
        Backoff::Exponential {
            initial: self.http_retry_wait_min,
            max: self.http_retry_wait_max,
        }
    }

    /// Render the Spaces endpoint for a region.
    pub fn spaces_endpoint_for(&self, region: &str) -> String {
        self.spaces_endpoint
            .replace(REGION_PLACEHOLDER, &region.trim().to_lowercase())
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration, ProviderError> {
    Duration::try_from_secs_f64(value).map_err(|e| {
        ProviderError::Configuration(format!("{} ({}) is not a usable duration: {}", name, value, e))
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
