//! Uptime checks and their alert policies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::client::{extract, Client};
use crate::context::OpContext;
use crate::error::ProviderError;
use crate::mapping::{expand_block, flatten_block, string_set};
use crate::provider::ProviderMeta;
use crate::resource::{clear_if_not_found, parse_compound_id, Resource};
use crate::schema::{Attribute, AttributeFlags, Block, NestedBlock, Schema, Validator};
use crate::state::ResourceData;

const CHECKS_PATH: &str = "/v2/uptime/checks";

const CHECK_TYPES: [&str; 3] = ["ping", "http", "https"];
const CHECK_REGIONS: [&str; 4] = ["us_east", "us_west", "eu_west", "se_asia"];

const ALERT_TYPES: [&str; 4] = ["latency", "down", "down_global", "ssl_expiry"];
const COMPARISONS: [&str; 2] = ["greater_than", "less_than"];
const PERIODS: [&str; 7] = ["2m", "3m", "5m", "10m", "15m", "30m", "1h"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Check {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    target: String,
    regions: Vec<String>,
    enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct SlackDetails {
    channel: String,
    url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Notifications {
    email: Vec<String>,
    slack: Vec<SlackDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Alert {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    threshold: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    comparison: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    period: String,
    notifications: Notifications,
}

fn check_path(id: &str) -> String {
    format!("{}/{}", CHECKS_PATH, id)
}

fn alerts_path(check_id: &str) -> String {
    format!("{}/alerts", check_path(check_id))
}

fn alert_path(check_id: &str, alert_id: &str) -> String {
    format!("{}/{}", alerts_path(check_id), alert_id)
}

async fn get_check(ctx: &OpContext, client: &Client, id: &str) -> Result<Check, ProviderError> {
    let body = client.get(ctx, &check_path(id), &[]).await?;
    extract(&body, "check")
}

fn check_request(data: &ResourceData) -> Result<Value, ProviderError> {
    let mut body = json!({
        "name": data.require_str("name")?,
        "type": data.require_str("type")?,
        "target": data.require_str("target")?,
        "enabled": data.get_bool("enabled").unwrap_or(true),
    });
    let regions = data.get_strings("regions");
    if !regions.is_empty() {
        body["regions"] = json!(regions);
    }
    Ok(body)
}

fn set_check_state(data: &mut ResourceData, check: &Check) {
    data.set_id(check.id.as_str());
    data.set("name", check.name.as_str());
    data.set("type", check.kind.as_str());
    data.set("target", check.target.as_str());
    data.set("regions", string_set(&check.regions));
    data.set("enabled", check.enabled);
}

/// `digitalocean_uptime_check`
#[derive(Debug, Clone, Copy, Default)]
pub struct UptimeCheckResource;

#[async_trait]
impl Resource for UptimeCheckResource {
    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("Checks an endpoint from one or more regions.")
            .with_attribute(
                "name",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "type",
                Attribute::optional_string()
                    .with_default(json!("https"))
                    .with_validator(Validator::string_in(CHECK_TYPES)),
            )
            .with_attribute(
                "target",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "regions",
                Attribute::string_set(AttributeFlags::optional_computed())
                    .with_validator(Validator::string_in(CHECK_REGIONS)),
            )
            .with_attribute("enabled", Attribute::optional_bool().with_default(json!(true)))
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let body = check_request(data)?;
        let response = meta.client.post(ctx, CHECKS_PATH, body).await?;
        let check: Check = extract(&response, "check")?;
        info!(id = %check.id, "uptime check created");
        data.set_id(check.id);
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        match get_check(ctx, &meta.client, data.id()).await {
            Ok(check) => {
                set_check_state(data, &check);
                Ok(())
            },
            Err(err) => clear_if_not_found(err, "uptime check", data),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if !data.has_changes(&["name", "type", "target", "regions", "enabled"]) {
            return Ok(());
        }
        let body = check_request(data)?;
        meta.client.put(ctx, &check_path(data.id()), body).await?;
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if let Err(err) = meta.client.delete(ctx, &check_path(data.id()), &[]).await {
            return clear_if_not_found(err, "uptime check", data);
        }
        data.clear_id();
        Ok(())
    }
}

fn alert_request(data: &ResourceData) -> Result<Value, ProviderError> {
    let mut notifications: Notifications = expand_block(data.get("notifications"))?.unwrap_or_default();
    notifications.email.sort();
    let alert = Alert {
        name: data.require_str("name")?.to_string(),
        kind: data.require_str("type")?.to_string(),
        threshold: data.get_i64("threshold"),
        comparison: data.get_string("comparison"),
        period: data.get_string("period"),
        notifications,
        ..Default::default()
    };
    let mut body = serde_json::to_value(&alert)?;
    if let Value::Object(map) = &mut body {
        map.remove("id");
    }
    Ok(body)
}

fn set_alert_state(data: &mut ResourceData, alert: &Alert) -> Result<(), ProviderError> {
    let mut notifications = alert.notifications.clone();
    notifications.email.sort();
    data.set_id(alert.id.as_str());
    data.set("name", alert.name.as_str());
    data.set("type", alert.kind.as_str());
    match alert.threshold {
        Some(threshold) => data.set("threshold", threshold),
        None => {
            data.remove("threshold");
        },
    }
    for (key, value) in [("comparison", &alert.comparison), ("period", &alert.period)] {
        if value.is_empty() {
            data.remove(key);
        } else {
            data.set(key, value.as_str());
        }
    }
    data.set("notifications", flatten_block(&notifications)?);
    Ok(())
}

/// `digitalocean_uptime_alert`
#[derive(Debug, Clone, Copy, Default)]
pub struct UptimeAlertResource;

#[async_trait]
impl Resource for UptimeAlertResource {
    fn schema(&self) -> Schema {
        let slack = Block::new()
            .with_attribute("channel", Attribute::required_string())
            .with_attribute("url", Attribute::required_string().sensitive());
        let notifications = Block::new()
            .with_attribute("email", Attribute::string_set(AttributeFlags::optional()))
            .with_block("slack", NestedBlock::list(slack));

        Schema::v0()
            .with_description("Notifies email addresses or Slack channels when an uptime check trips.")
            .with_attribute(
                "check_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "name",
                Attribute::required_string().with_validator(Validator::NoZeroValues),
            )
            .with_attribute(
                "type",
                Attribute::required_string().with_validator(Validator::string_in(ALERT_TYPES)),
            )
            .with_attribute("threshold", Attribute::optional_int64())
            .with_attribute(
                "comparison",
                Attribute::optional_string().with_validator(Validator::string_in(COMPARISONS)),
            )
            .with_attribute(
                "period",
                Attribute::optional_string().with_validator(Validator::string_in(PERIODS)),
            )
            .with_block(
                "notifications",
                NestedBlock::list(notifications)
                    .with_min_items(1)
                    .with_max_items(1),
            )
    }

    fn import_state(&self, id: &str) -> Result<ResourceData, ProviderError> {
        let fields = parse_compound_id(id, 2, "<check_id>,<alert_id>")?;
        let mut data = ResourceData::with_id(fields[1].as_str());
        data.set("check_id", fields[0].as_str());
        Ok(data)
    }

    async fn create(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let check_id = data.require_str("check_id")?.to_string();
        let body = alert_request(data)?;
        let response = meta.client.post(ctx, &alerts_path(&check_id), body).await?;
        let alert: Alert = extract(&response, "alert")?;
        info!(check_id = %check_id, id = %alert.id, "uptime alert created");
        data.set_id(alert.id);
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let path = alert_path(data.require_str("check_id")?, data.id());
        let alert: Alert = match meta.client.get(ctx, &path, &[]).await {
            Ok(body) => extract(&body, "alert")?,
            Err(err) => return clear_if_not_found(err, "uptime alert", data),
        };
        set_alert_state(data, &alert)
    }

    async fn update(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let path = alert_path(data.require_str("check_id")?, data.id());
        let body = alert_request(data)?;
        meta.client.put(ctx, &path, body).await?;
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        meta: &ProviderMeta,
        data: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let path = alert_path(data.require_str("check_id")?, data.id());
        if let Err(err) = meta.client.delete(ctx, &path, &[]).await {
            return clear_if_not_found(err, "uptime alert", data);
        }
        data.clear_id();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Method;
    use crate::testing::{
        assert_plan_no_changes, assert_plan_redacts, assert_plan_updates_in_place, MockTransport,
        ProviderTester,
    };
    use crate::DigitalOceanProvider;

    const CHECK: &str = "/v2/uptime/checks/chk-1";
    const ALERT: &str = "/v2/uptime/checks/chk-1/alerts/al-1";

    fn check(enabled: bool) -> Value {
        json!({"check": {
            "id": "chk-1",
            "name": "site",
            "type": "https",
            "target": "https://example.com",
            "regions": ["us_west", "us_east"],
            "enabled": enabled
        }})
    }

    fn alert(threshold: i64) -> Value {
        json!({"alert": {
            "id": "al-1",
            "name": "slow",
            "type": "latency",
            "threshold": threshold,
            "comparison": "greater_than",
            "period": "2m",
            "notifications": {
                "email": ["ops@example.com", "dev@example.com"],
                "slack": [{"channel": "#alerts", "url": "https://hooks.slack.com/services/T/B/X"}]
            }
        }})
    }

    fn alert_config() -> Value {
        json!({
            "check_id": "chk-1",
            "name": "slow",
            "type": "latency",
            "threshold": 300,
            "comparison": "greater_than",
            "period": "2m",
            "notifications": [{
                "email": ["dev@example.com", "ops@example.com"],
                "slack": [{"channel": "#alerts", "url": "https://hooks.slack.com/services/T/B/X"}]
            }]
        })
    }

    async fn configured(mock: &MockTransport) -> ProviderTester<DigitalOceanProvider> {
        let tester = ProviderTester::new(mock.provider().unwrap());
        tester
            .configure(json!({"token": MockTransport::TOKEN}))
            .await
            .unwrap();
        tester
    }

    #[tokio::test]
    async fn test_check_defaults_and_disable() {
        let mock = MockTransport::new()
            .on(Method::Post, CHECKS_PATH, 201, check(true))
            .on(Method::Get, CHECK, 200, check(true));
        let tester = configured(&mock).await;

        let state = tester
            .create(
                "digitalocean_uptime_check",
                json!({"name": "site", "target": "https://example.com", "regions": ["us_east", "us_west"]}),
            )
            .await
            .unwrap();
        let body = mock.requests_to(Method::Post, CHECKS_PATH)[0].json().cloned().unwrap();
        assert_eq!(body["type"], "https");
        assert_eq!(body["enabled"], true);
        assert_eq!(state["regions"], json!(["us_east", "us_west"]));

        let mut planned = state.clone();
        planned["enabled"] = json!(false);
        mock.replace(Method::Put, CHECK, 200, check(false));
        mock.replace(Method::Get, CHECK, 200, check(false));
        let state = tester
            .lifecycle_update("digitalocean_uptime_check", state, planned)
            .await
            .unwrap();
        assert_eq!(state["enabled"], false);
        assert_eq!(mock.requests_to(Method::Put, CHECK)[0].json().unwrap()["enabled"], false);
    }

    #[tokio::test]
    async fn test_check_type_is_validated() {
        let mock = MockTransport::new();
        let tester = configured(&mock).await;
        let result = tester
            .validate_resource_config(
                "digitalocean_uptime_check",
                json!({"name": "site", "target": "example.com", "type": "tcp"}),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_alert_create_and_threshold_update() {
        let mock = MockTransport::new()
            .on(Method::Post, "/v2/uptime/checks/chk-1/alerts", 201, alert(300))
            .on(Method::Get, ALERT, 200, alert(300));
        let tester = configured(&mock).await;

        let state = tester
            .create("digitalocean_uptime_alert", alert_config())
            .await
            .unwrap();
        assert_eq!(state["id"], "al-1");
        assert_eq!(state["check_id"], "chk-1");
        assert_eq!(
            state["notifications"][0]["email"],
            json!(["dev@example.com", "ops@example.com"])
        );

        let mut planned = alert_config();
        planned["id"] = json!("al-1");
        planned["threshold"] = json!(500);
        let plan = tester
            .plan_update("digitalocean_uptime_alert", state.clone(), planned)
            .await
            .unwrap();
        assert_plan_updates_in_place(&plan);
        assert_plan_redacts(&plan, "hooks.slack.com");

        mock.replace(Method::Put, ALERT, 200, alert(500));
        mock.replace(Method::Get, ALERT, 200, alert(500));
        let state = tester
            .update("digitalocean_uptime_alert", state, plan.planned_state)
            .await
            .unwrap();
        assert_eq!(state["threshold"], 500);
        let body = mock.requests_to(Method::Put, ALERT)[0].json().cloned().unwrap();
        assert_eq!(body["notifications"]["slack"][0]["channel"], "#alerts");
        assert!(body.get("id").is_none());
    }

    #[tokio::test]
    async fn test_alert_import() {
        let mock = MockTransport::new().on(Method::Get, ALERT, 200, alert(300));
        let tester = configured(&mock).await;

        let (state, plan) = tester
            .lifecycle_import("digitalocean_uptime_alert", "chk-1,al-1")
            .await
            .unwrap();
        assert_eq!(state["id"], "al-1");
        assert_eq!(state["check_id"], "chk-1");
        assert_plan_no_changes(&plan);

        let err = tester
            .import_resource("digitalocean_uptime_alert", "al-1")
            .await
            .unwrap_err();
        assert!(err.message().contains("<check_id>,<alert_id>"));
    }
}
