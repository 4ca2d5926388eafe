//! Page walker for DigitalOcean list endpoints.
//!
//! List responses carry the items under a resource-specific key plus a
//! `links.pages` block. Pages are fetched in order starting at page 1; the
//! walk ends when `links` is missing, when no `next` page is advertised, or on
//! an empty page.

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::client::{Client, Links};
use crate::context::OpContext;
use crate::error::ProviderError;

/// Page size used by lookups.
pub const LOOKUP_PER_PAGE: u32 = 200;

/// Page size used for generic lists.
pub const DEFAULT_PER_PAGE: u32 = 100;

/// One list endpoint to walk.
#[derive(Debug, Clone)]
pub struct ListRequest<'a> {
    /// Endpoint path.
    pub path: &'a str,
    /// Envelope key holding the items.
    pub key: &'a str,
    /// Extra query parameters.
    pub query: Vec<(&'a str, String)>,
    /// Page size.
    pub per_page: u32,
}

impl<'a> ListRequest<'a> {
    /// Walk `path`, reading items from `key`, at the lookup page size.
    pub fn new(path: &'a str, key: &'a str) -> Self {
        Self {
            path,
            key,
            query: Vec::new(),
            per_page: LOOKUP_PER_PAGE,
        }
    }

    /// Add a query parameter sent with every page.
    pub fn with_query(mut self, key: &'a str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    /// Override the page size.
    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page;
        self
    }
}

/// Fetch every page of a list endpoint.
///
/// `id_of` extracts each item's identifier; an identifier seen twice fails the
/// walk. Any page error is returned and the partial result discarded.
pub async fn list_all<T, F>(
    client: &Client,
    ctx: &OpContext,
    request: &ListRequest<'_>,
    id_of: F,
) -> Result<Vec<T>, ProviderError>
where
    T: DeserializeOwned,
    F: Fn(&T) -> String,
{
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut page = 1u32;
    let per_page = request.per_page.to_string();

    loop {
        let page_str = page.to_string();
        let mut query: Vec<(&str, &str)> = request
            .query
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .collect();
        query.push(("page", page_str.as_str()));
        query.push(("per_page", per_page.as_str()));

        let body = client.get(ctx, request.path, &query).await?;
        let batch: Vec<T> = match body.get(request.key) {
            Some(Value::Array(_)) => serde_json::from_value(body[request.key].clone())?,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(ProviderError::Parse(format!(
                    "expected `{}` to be a list, got {}",
                    request.key, other
                )))
            },
        };
        debug!(path = request.path, page, count = batch.len(), "listed page");

        let empty = batch.is_empty();
        for item in batch {
            let id = id_of(&item);
            if !seen.insert(id.clone()) {
                return Err(ProviderError::Sdk(format!(
                    "duplicate id {:?} while listing {}",
                    id, request.path
                )));
            }
            items.push(item);
        }

        let links: Option<Links> = match body.get("links") {
            None | Some(Value::Null) => None,
            Some(value) => Some(serde_json::from_value(value.clone())?),
        };
        match links {
            None => break,
            Some(links) if links.is_last_page() => break,
            Some(_) if empty => break,
            Some(_) => page += 1,
        }
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ApiResponse, Method};
    use crate::testing::MockTransport;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Item {
        id: String,
    }

    fn page(ids: &[&str], next: Option<&str>) -> Value {
        let items: Vec<Value> = ids.iter().map(|id| json!({"id": id})).collect();
        let pages = match next {
            Some(next) => json!({"next": next, "last": "https://api/last"}),
            None => json!({"prev": "https://api/prev"}),
        };
        json!({"items": items, "links": {"pages": pages}, "meta": {"total": 0}})
    }

    #[tokio::test]
    async fn test_walks_every_page_in_order() {
        let mock = MockTransport::new()
            .on(Method::Get, "/v2/items", 200, page(&["a", "b"], Some("p2")))
            .on(Method::Get, "/v2/items", 200, page(&["c"], Some("p3")))
            .on(Method::Get, "/v2/items", 200, page(&["d"], None));
        let request = ListRequest::new("/v2/items", "items").with_query("region", "atl1");

        let items: Vec<Item> = list_all(&mock.client(), &OpContext::new(), &request, |i: &Item| i.id.clone())
            .await
            .unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);

        let requests = mock.requests_to(Method::Get, "/v2/items");
        assert_eq!(requests.len(), 3);
        for (i, r) in requests.iter().enumerate() {
            assert_eq!(r.query_param("page"), Some((i + 1).to_string().as_str()));
            assert_eq!(r.query_param("per_page"), Some("200"));
            assert_eq!(r.query_param("region"), Some("atl1"));
        }
    }

    #[tokio::test]
    async fn test_missing_links_ends_walk() {
        let mock = MockTransport::new().on(Method::Get, "/v2/items", 200, json!({"items": [{"id": "a"}]}));
        let items: Vec<Item> = list_all(
            &mock.client(),
            &OpContext::new(),
            &ListRequest::new("/v2/items", "items"),
            |i: &Item| i.id.clone(),
        )
        .await
        .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(mock.count(Method::Get, "/v2/items"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_ids_fail() {
        let mock = MockTransport::new()
            .on(Method::Get, "/v2/items", 200, page(&["a"], Some("p2")))
            .on(Method::Get, "/v2/items", 200, page(&["a"], None));
        let result: Result<Vec<Item>, _> = list_all(
            &mock.client(),
            &OpContext::new(),
            &ListRequest::new("/v2/items", "items"),
            |i: &Item| i.id.clone(),
        )
        .await;
        assert!(matches!(result, Err(ProviderError::Sdk(_))));
    }

    #[tokio::test]
    async fn test_page_error_propagates() {
        let mock = MockTransport::new()
            .on(Method::Get, "/v2/items", 200, page(&["a"], Some("p2")))
            .on_response(
                Method::Get,
                "/v2/items",
                ApiResponse::new(500, json!({"id": "server_error", "message": "boom"})),
            );
        let result: Result<Vec<Item>, _> = list_all(
            &mock.client(),
            &OpContext::new(),
            &ListRequest::new("/v2/items", "items"),
            |i: &Item| i.id.clone(),
        )
        .await;
        let err = tokio_test::assert_err!(result);
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn test_empty_page_ends_walk() {
        let mock = MockTransport::new().on(Method::Get, "/v2/items", 200, page(&[], Some("p2")));
        let items: Vec<Item> = list_all(
            &mock.client(),
            &OpContext::new(),
            &ListRequest::new("/v2/items", "items").with_per_page(DEFAULT_PER_PAGE),
            |i: &Item| i.id.clone(),
        )
        .await
        .unwrap();
        assert!(items.is_empty());
        assert_eq!(mock.count(Method::Get, "/v2/items"), 1);
    }
}
