//! JSON-over-HTTP marketplace client
//!
//! Speaks a small REST dialect:
//! - `GET  {api_url}/offers?min_memory=N`
//! - `POST {api_url}/leases` with `{"instance_type": ...}`
//! - `GET  {api_url}/leases/{id}`
//! - `DELETE {api_url}/leases/{id}`

use async_trait::async_trait;
use gpufleet_core::{
    Capabilities, FleetError, FleetResult, LeaseHandle, LeaseStatus, ProviderConfig, SpotOffer,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::provider::SpotProvider;

pub const SFCOMPUTE_API_URL: &str = "https://api.sfcompute.com/v1";
pub const VAST_API_URL: &str = "https://console.vast.ai/api/v0";

#[derive(Debug, Serialize)]
struct LeaseRequest<'a> {
    instance_type: &'a str,
}

/// Marketplace reached over HTTP
pub struct HttpMarketplace {
    name: String,
    api_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpMarketplace {
    /// Build a client from config, reading the API key from the named env var
    pub fn from_config(config: &ProviderConfig, default_url: &str) -> FleetResult<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(key) => Some(key),
                Err(_) => {
                    warn!(provider = %config.name, var = %var, "API key variable not set");
                    None
                }
            },
            None => None,
        };
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| default_url.to_string());
        Self::new(&config.name, &api_url, api_key, config.request_timeout_secs)
    }

    pub fn new(
        name: &str,
        api_url: &str,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> FleetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| FleetError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn error(&self, e: impl std::fmt::Display) -> FleetError {
        FleetError::provider(&self.name, e.to_string())
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> FleetResult<reqwest::Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.error(e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.error(format!("{}: {}", status, body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl SpotProvider for HttpMarketplace {
    async fn offers(
        &self,
        min_memory: u64,
        capabilities: &Capabilities,
    ) -> FleetResult<Vec<SpotOffer>> {
        let url = format!("{}/offers", self.api_url);
        let request = self
            .client
            .get(&url)
            .query(&[("min_memory", min_memory.to_string())]);
        let offers: Vec<SpotOffer> = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| self.error(e))?;

        // the marketplace filters on memory only
        let offers: Vec<_> = offers
            .into_iter()
            .filter(|o| o.memory >= min_memory && o.capabilities.satisfies(capabilities))
            .map(|mut o| {
                o.provider = self.name.clone();
                o
            })
            .collect();
        debug!(provider = %self.name, count = offers.len(), "Fetched spot offers");
        Ok(offers)
    }

    async fn provision(&self, offer: &SpotOffer) -> FleetResult<LeaseHandle> {
        let url = format!("{}/leases", self.api_url);
        let request = self.client.post(&url).json(&LeaseRequest {
            instance_type: &offer.instance_type,
        });
        let mut handle: LeaseHandle = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| self.error(e))?;
        handle.provider = self.name.clone();
        Ok(handle)
    }

    async fn status(&self, lease_id: &str) -> FleetResult<LeaseStatus> {
        let url = format!("{}/leases/{}", self.api_url, lease_id);
        self.send(self.client.get(&url))
            .await?
            .json()
            .await
            .map_err(|e| self.error(e))
    }

    async fn terminate(&self, lease_id: &str) -> FleetResult<()> {
        let url = format!("{}/leases/{}", self.api_url, lease_id);
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use gpufleet_core::{LeaseState, ProviderKind};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    type StubResult = Result<Json<Value>, (StatusCode, String)>;

    async fn stub_offers(
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> StubResult {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        if auth != Some("Bearer secret") {
            return Err((StatusCode::UNAUTHORIZED, "missing token".to_string()));
        }
        if !query.contains_key("min_memory") {
            return Err((StatusCode::BAD_REQUEST, "min_memory required".to_string()));
        }
        // ignores min_memory like a lazy marketplace would
        Ok(Json(json!([
            {
                "instance_type": "a100-40g",
                "price": 1.1,
                "memory": 40000,
                "capabilities": { "compute_capability": "8.0" },
                "gpu_name": "A100"
            },
            {
                "instance_type": "v100-16g",
                "price": 0.5,
                "memory": 16000,
                "capabilities": { "compute_capability": "7.0" },
                "gpu_name": "V100"
            },
            { "instance_type": "t4-small", "price": 0.2, "memory": 8000 }
        ])))
    }

    async fn stub_create_lease(Json(body): Json<Value>) -> StubResult {
        match body["instance_type"].as_str() {
            Some("a100-40g") => Ok(Json(json!({
                "lease_id": "lease-1",
                "instance_type": "a100-40g",
                "gpu_name": "A100",
                "total_memory": 40000,
                "cost_per_hour": 1.1,
                "expires_at": "2030-01-01T00:00:00Z"
            }))),
            _ => Err((StatusCode::CONFLICT, "sold out".to_string())),
        }
    }

    async fn stub_lease_status(Path(id): Path<String>) -> StubResult {
        match id.as_str() {
            "lease-1" => Ok(Json(json!({
                "state": "ready",
                "termination_notice": "2030-01-01T00:00:00Z"
            }))),
            "lease-2" => Ok(Json(json!({ "state": "failed", "error": "host lost" }))),
            _ => Err((StatusCode::NOT_FOUND, format!("no lease {}", id))),
        }
    }

    async fn stub_delete_lease(Path(id): Path<String>) -> Result<StatusCode, StatusCode> {
        if id == "lease-1" {
            Ok(StatusCode::NO_CONTENT)
        } else {
            Err(StatusCode::NOT_FOUND)
        }
    }

    /// Serve a fake marketplace on an ephemeral port and return its base URL
    async fn marketplace_stub() -> String {
        let router = Router::new()
            .route("/offers", get(stub_offers))
            .route("/leases", post(stub_create_lease))
            .route(
                "/leases/:id",
                get(stub_lease_status).delete(stub_delete_lease),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(url: &str, key: Option<&str>) -> HttpMarketplace {
        HttpMarketplace::new("vast", url, key.map(str::to_string), 5).unwrap()
    }

    #[tokio::test]
    async fn test_offers_filtered_by_memory_and_capabilities() {
        let url = marketplace_stub().await;
        let market = client(&url, Some("secret"));

        let wanted = Capabilities::new().with("compute_capability", "7.5");
        let offers = market.offers(12000, &wanted).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].instance_type, "a100-40g");
        assert_eq!(offers[0].provider, "vast");
        assert_eq!(offers[0].gpu_name, "A100");

        let offers = market.offers(12000, &Capabilities::new()).await.unwrap();
        let types: Vec<_> = offers.iter().map(|o| o.instance_type.as_str()).collect();
        assert_eq!(types, vec!["a100-40g", "v100-16g"]);
    }

    #[tokio::test]
    async fn test_non_success_responses_are_provider_errors() {
        let url = marketplace_stub().await;

        let err = client(&url, None)
            .offers(0, &Capabilities::new())
            .await
            .unwrap_err();
        match err {
            FleetError::Provider { provider, message } => {
                assert_eq!(provider, "vast");
                assert!(message.contains("401"), "{}", message);
                assert!(message.contains("missing token"), "{}", message);
            }
            other => panic!("expected provider error, got {:?}", other),
        }

        let market = client(&url, Some("secret"));
        let sold_out = SpotOffer {
            provider: "vast".to_string(),
            instance_type: "h100".to_string(),
            price: 3.0,
            memory: 80000,
            capabilities: Capabilities::new(),
            gpu_name: "H100".to_string(),
        };
        assert!(matches!(
            market.provision(&sold_out).await,
            Err(FleetError::Provider { .. })
        ));
        assert!(matches!(
            market.status("lease-9").await,
            Err(FleetError::Provider { .. })
        ));
        assert!(matches!(
            market.terminate("lease-9").await,
            Err(FleetError::Provider { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_marketplace_is_provider_error() {
        // bind then drop so nothing listens on the port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let market = client(&format!("http://{}", addr), Some("secret"));
        assert!(matches!(
            market.offers(0, &Capabilities::new()).await,
            Err(FleetError::Provider { .. })
        ));
    }

    #[tokio::test]
    async fn test_lease_lifecycle_decoding() {
        let url = marketplace_stub().await;
        let market = client(&url, Some("secret"));
        let offer = market
            .offers(12000, &Capabilities::new())
            .await
            .unwrap()
            .remove(0);

        let handle = market.provision(&offer).await.unwrap();
        assert_eq!(handle.provider, "vast");
        assert_eq!(handle.lease_id, "lease-1");
        assert_eq!(handle.total_memory, 40000);
        assert_eq!(handle.cost_per_hour, 1.1);
        assert!(handle.capabilities.is_empty());
        assert_eq!(
            handle.expires_at.map(|t| t.to_rfc3339()),
            Some("2030-01-01T00:00:00+00:00".to_string())
        );

        let status = market.status(&handle.lease_id).await.unwrap();
        assert_eq!(status.state, LeaseState::Ready);
        assert!(status.termination_notice.is_some());
        assert!(status.error.is_none());

        let failed = market.status("lease-2").await.unwrap();
        assert_eq!(failed.state, LeaseState::Failed);
        assert_eq!(failed.error.as_deref(), Some("host lost"));

        market.terminate(&handle.lease_id).await.unwrap();
    }

    #[test]
    fn test_from_config_defaults_url() {
        let config = ProviderConfig {
            name: "sfc".to_string(),
            kind: ProviderKind::SfCompute,
            api_url: None,
            api_key_env: None,
            request_timeout_secs: 5,
            offers: Vec::new(),
            ready_after_polls: 0,
        };
        let market = HttpMarketplace::from_config(&config, SFCOMPUTE_API_URL).unwrap();
        assert_eq!(market.api_url(), SFCOMPUTE_API_URL);
        assert_eq!(market.name(), "sfc");
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let market = HttpMarketplace::new("vast", "http://localhost:8080/", None, 5).unwrap();
        assert_eq!(market.api_url(), "http://localhost:8080");
    }
}
