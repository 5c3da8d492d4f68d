//! API follow-up calls for backends whose SRP embeds search credentials.
//!
//! Parsers stay pure; every network call they imply lands here behind the
//! `BackendApi` trait so the orchestrator (and tests) can swap transports.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::{ParseError, ScrapeError};
use crate::parsers::cdk::CdkInventoryRequest;
use crate::parsers::dealer_alchemy::TypesenseConfig;
use crate::parsers::dealer_inspire::AlgoliaConfig;
use crate::parsers::dealer_on::DealerOnPage;
use crate::parsers::smartpath::SmartPathPage;

/// Network seam for backend-specific inventory APIs.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// DealerOn Cosmos SRP vehicles endpoint.
    async fn dealeron_inventory(&self, page: &DealerOnPage) -> Result<Value, ScrapeError>;
    /// SmartPath Typesense document search.
    async fn smartpath_search(&self, page: &SmartPathPage) -> Result<Value, ScrapeError>;
    /// DealerInspire Algolia index query.
    async fn algolia_query(&self, config: &AlgoliaConfig, params: &str)
        -> Result<Value, ScrapeError>;
    /// Alchemy/Venom/Fox Typesense multi-search.
    async fn typesense_search(
        &self,
        config: &TypesenseConfig,
        model: &str,
    ) -> Result<Value, ScrapeError>;
    /// CDK widget inventory endpoint, replaying the captured payload.
    async fn cdk_inventory(
        &self,
        origin: &str,
        request: &CdkInventoryRequest,
    ) -> Result<Value, ScrapeError>;
}

/// Production implementation over reqwest.
pub struct HttpBackendApi {
    client: reqwest::Client,
}

impl HttpBackendApi {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(HttpBackendApi { client })
    }
}

#[async_trait]
impl BackendApi for HttpBackendApi {
    async fn dealeron_inventory(&self, page: &DealerOnPage) -> Result<Value, ScrapeError> {
        let response = self
            .client
            .get(page.api_url())
            .query(&page.api_params())
            .send()
            .await
            .map_err(|e| ParseError::DealerOn(format!("DealerOn API request failed: {e}")))?;

        // A 404 from the Cosmos SRP endpoint means a filtered page with no
        // inventory, not a broken dealer.
        if response.status().as_u16() == 404 {
            return Ok(Value::Null);
        }
        if !response.status().is_success() {
            return Err(ParseError::DealerOn(format!(
                "DealerOn API returned {}",
                response.status()
            ))
            .into());
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ParseError::DealerOn(format!("DealerOn API returned bad JSON: {e}")).into())
    }

    async fn smartpath_search(&self, page: &SmartPathPage) -> Result<Value, ScrapeError> {
        let filter_by = page.filter_by();
        let response = self
            .client
            .get(page.search_url())
            .query(&[
                ("q", "*"),
                ("query_by", "model"),
                ("per_page", "250"),
                ("filter_by", filter_by.as_str()),
            ])
            .header("x-typesense-api-key", &page.api_key)
            .send()
            .await
            .map_err(|e| ParseError::SmartPath(format!("Typesense request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ParseError::SmartPath(format!(
                "Typesense returned {}",
                response.status()
            ))
            .into());
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ParseError::SmartPath(format!("Typesense returned bad JSON: {e}")).into())
    }

    async fn algolia_query(
        &self,
        config: &AlgoliaConfig,
        params: &str,
    ) -> Result<Value, ScrapeError> {
        let url = format!(
            "https://{}-dsn.algolia.net/1/indexes/{}/query",
            config.app_id.to_lowercase(),
            config.index
        );
        let response = self
            .client
            .post(url)
            .header("X-Algolia-API-Key", &config.api_key)
            .header("X-Algolia-Application-Id", &config.app_id)
            .json(&json!({ "params": params }))
            .send()
            .await
            .map_err(|e| ScrapeError::FetchTerminal(format!("Algolia request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ScrapeError::FetchTerminal(format!(
                "Algolia returned {}",
                response.status()
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ScrapeError::FetchTerminal(format!("Algolia returned bad JSON: {e}")))
    }

    async fn typesense_search(
        &self,
        config: &TypesenseConfig,
        model: &str,
    ) -> Result<Value, ScrapeError> {
        let response = self
            .client
            .post(config.multi_search_url())
            .header("x-typesense-api-key", &config.api_key)
            .json(&config.build_search_body(model))
            .send()
            .await
            .map_err(|e| ScrapeError::FetchTerminal(format!("Typesense request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ScrapeError::FetchTerminal(format!(
                "Typesense returned {}",
                response.status()
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ScrapeError::FetchTerminal(format!("Typesense returned bad JSON: {e}")))
    }

    async fn cdk_inventory(
        &self,
        origin: &str,
        request: &CdkInventoryRequest,
    ) -> Result<Value, ScrapeError> {
        let url = format!("{}{}", origin.trim_end_matches('/'), request.endpoint);
        let response = self
            .client
            .post(url)
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| ScrapeError::FetchTerminal(format!("CDK inventory request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ScrapeError::FetchTerminal(format!(
                "CDK inventory endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ScrapeError::FetchTerminal(format!("CDK returned bad JSON: {e}")))
    }
}
