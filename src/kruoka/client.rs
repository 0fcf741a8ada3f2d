use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use super::rate_limiter::{Sleeper, ThreadSleeper};
use super::session_pool::STATUS_FORBIDDEN;
use super::transport::{Transport, TransportError};
use super::types::{
    ApiRequest, ApiResponse, CategoryRef, OfferCategory, OfferCategoryListing, OfferPage,
    SearchOffersPage, StoreInfo, StoreListing,
};

/// The API answers 400 for anything larger.
pub const MAX_OFFER_CATEGORY_LIMIT: u32 = 25;
pub const SEARCH_OFFERS_PAGE_SIZE: u32 = 48;
pub const DEFAULT_SEGMENT_ID: u32 = 1565;
const ALL_STORES_LIMIT: u32 = 2000;
const LANGUAGE: &str = "fi";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("{endpoint} still forbidden after re-authentication")]
    SessionInvalid { endpoint: String },

    #[error("Failed to decode {endpoint} response: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Whether a page retry can help. A 403 that survived re-authentication
    /// and an unreadable body are final.
    pub fn retryable(&self) -> bool {
        match self {
            ApiError::Transport(TransportError::Network(_)) => true,
            ApiError::Transport(_) => false,
            ApiError::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            ApiError::SessionInvalid { .. } | ApiError::Decode { .. } => false,
        }
    }
}

/// Retry policy for bulk page fetches, on top of the transport's own.
#[derive(Debug, Clone)]
pub struct PageRetry {
    pub max_retries: u32,
    /// Wait before retry `n` (from zero) is `step * (n + 1)`
    pub step: Duration,
}

impl Default for PageRetry {
    fn default() -> Self {
        Self {
            max_retries: 2,
            step: Duration::from_millis(1500),
        }
    }
}

/// Typed wrappers over the remote endpoints.
#[derive(Clone)]
pub struct ApiClient {
    transport: Transport,
    page_retry: PageRetry,
    sleeper: Arc<dyn Sleeper>,
}

impl ApiClient {
    pub fn new(transport: Transport) -> Self {
        Self::with_retry(transport, PageRetry::default(), Arc::new(ThreadSleeper))
    }

    pub fn with_retry(transport: Transport, page_retry: PageRetry, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            transport,
            page_retry,
            sleeper,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Send without interpreting the status.
    pub fn send_raw(&self, request: &ApiRequest) -> ApiResult<ApiResponse> {
        Ok(self.transport.request(request)?)
    }

    fn send<T: DeserializeOwned>(&self, request: &ApiRequest) -> ApiResult<T> {
        let response = self.send_raw(request)?;
        decode(&request.endpoint, &response)
    }

    /// Send, retrying throttling, server and network failures with a linear wait.
    pub fn send_with_retry<T: DeserializeOwned>(&self, request: &ApiRequest) -> ApiResult<T> {
        let mut attempt = 0;
        loop {
            match self.send(request) {
                Ok(value) => return Ok(value),
                Err(e) if e.retryable() && attempt < self.page_retry.max_retries => {
                    let wait = self.page_retry.step * (attempt + 1);
                    debug!(
                        endpoint = %request.endpoint,
                        attempt = attempt + 1,
                        wait_secs = wait.as_secs_f64(),
                        error = %e,
                        "Retrying request"
                    );
                    self.sleeper.sleep(wait);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn post_with_retry<T: DeserializeOwned>(&self, endpoint: &str, body: Value) -> ApiResult<T> {
        self.send_with_retry(&ApiRequest::post(endpoint, body))
    }

    pub fn search_stores(&self, query: &str, offset: u32, limit: u32) -> ApiResult<Vec<StoreInfo>> {
        let listing: StoreListing = self.send(&ApiRequest::post(
            "stores/search",
            json!({"query": query, "offset": offset, "limit": limit}),
        ))?;
        Ok(listing.into_stores())
    }

    pub fn fetch_all_stores(&self) -> ApiResult<Vec<StoreInfo>> {
        self.search_stores("", 0, ALL_STORES_LIMIT)
    }

    pub fn fetch_offer_categories(&self, store_id: &str) -> ApiResult<Vec<OfferCategory>> {
        let listing: OfferCategoryListing = self.send(&ApiRequest::post(
            "offer-categories",
            json!({"storeId": store_id}),
        ))?;
        Ok(listing.offer_categories)
    }

    fn offer_category_request(
        store_id: &str,
        category: &CategoryRef,
        offset: u32,
        limit: u32,
    ) -> ApiRequest {
        let limit = if limit > MAX_OFFER_CATEGORY_LIMIT {
            warn!(limit, max = MAX_OFFER_CATEGORY_LIMIT, "Clamping offer-category page size");
            MAX_OFFER_CATEGORY_LIMIT
        } else {
            limit
        };

        ApiRequest::post(
            "offer-category",
            json!({
                "storeId": store_id,
                "category": category,
                "offset": offset,
                "limit": limit,
                "pricing": {},
            }),
        )
    }

    pub fn fetch_offer_category(
        &self,
        store_id: &str,
        category: &CategoryRef,
        offset: u32,
        limit: u32,
    ) -> ApiResult<OfferPage> {
        self.send(&Self::offer_category_request(store_id, category, offset, limit))
    }

    /// One full-size page of a category, with page retries.
    pub fn offer_category_page(&self, store_id: &str, slug: &str, offset: u32) -> ApiResult<OfferPage> {
        self.send_with_retry(&Self::offer_category_request(
            store_id,
            &CategoryRef::product_category(slug),
            offset,
            MAX_OFFER_CATEGORY_LIMIT,
        ))
    }

    /// Offer details, including the product list of compound offers.
    pub fn fetch_offers(&self, store_id: &str, offer_ids: &[String]) -> ApiResult<OfferPage> {
        self.send(&ApiRequest::post(
            "fetch-offers",
            json!({"storeId": store_id, "offerIds": offer_ids, "pricing": {}}),
        ))
    }

    pub fn search_offers(&self, store_id: &str, category_path: &str, offset: u32) -> ApiResult<SearchOffersPage> {
        self.send_with_retry(
            &ApiRequest::get("search-offers/")
                .with_query("storeId", store_id)
                .with_query("offset", offset)
                .with_query("categoryPath", category_path)
                .with_query("language", LANGUAGE),
        )
    }

    /// Free-text product search, used for manual lookups.
    #[allow(dead_code)]
    pub fn search_product(&self, query: &str, store_id: &str, offset: u32, limit: u32) -> ApiResult<Value> {
        self.send(
            &ApiRequest::post_empty(format!("v2/product-search/{query}"))
                .with_query("offset", offset)
                .with_query("language", LANGUAGE)
                .with_query("storeId", store_id)
                .with_query("limit", limit)
                .with_query("discountFilter", false)
                .with_query("isTosTrOffer", false),
        )
    }

    #[allow(dead_code)]
    pub fn fetch_related_products(&self, product_id: &str, store_id: &str, segment_id: u32) -> ApiResult<Value> {
        self.send(
            &ApiRequest::get(format!("v2/products/{product_id}/related"))
                .with_query("storeId", store_id)
                .with_query("segmentId", segment_id),
        )
    }
}

/// Turn a response into `T`, mapping failure statuses to errors.
pub fn decode<T: DeserializeOwned>(endpoint: &str, response: &ApiResponse) -> ApiResult<T> {
    if response.status == STATUS_FORBIDDEN {
        return Err(ApiError::SessionInvalid {
            endpoint: endpoint.to_string(),
        });
    }
    if !response.is_success() {
        return Err(ApiError::Status {
            endpoint: endpoint.to_string(),
            status: response.status,
            body: response.snippet(),
        });
    }
    response.json().map_err(|source| ApiError::Decode {
        endpoint: endpoint.to_string(),
        source,
    })
}
