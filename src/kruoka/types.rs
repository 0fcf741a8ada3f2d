//! Typed request, response and payload records for the K-Ruoka API

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// HTTP verb used by the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One outbound call. Built per request and never reused.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base, without a leading slash.
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            endpoint: endpoint.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            endpoint: endpoint.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    /// POST carrying only query parameters.
    pub fn post_empty(endpoint: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            endpoint: endpoint.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

/// Status and raw body of a completed call. Non-2xx statuses are normal values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }

    /// First 200 characters of the body, for error messages.
    pub fn snippet(&self) -> String {
        self.body.chars().take(200).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Store address. The API sends either an object or a single string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreLocation {
    Address {
        #[serde(default)]
        address: Option<String>,
        #[serde(rename = "postalCode", default)]
        postal_code: Option<String>,
        #[serde(default)]
        city: Option<String>,
    },
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub chain_name: Option<String>,
    #[serde(default)]
    pub geo: Option<GeoPoint>,
    #[serde(default)]
    pub location: Option<StoreLocation>,
}

impl StoreInfo {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        let geo = self.geo.as_ref()?;
        Some((geo.latitude?, geo.longitude?))
    }
}

/// `stores/search` answers with a bare list or a wrapper object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum StoreListing {
    List(Vec<StoreInfo>),
    Results { results: Vec<StoreInfo> },
    Stores { stores: Vec<StoreInfo> },
}

impl StoreListing {
    pub(crate) fn into_stores(self) -> Vec<StoreInfo> {
        match self {
            StoreListing::List(stores)
            | StoreListing::Results { results: stores }
            | StoreListing::Stores { stores } => stores,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalizedName {
    #[serde(default)]
    pub finnish: Option<String>,
    #[serde(default)]
    pub english: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferCategory {
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub name: Option<LocalizedName>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OfferCategoryListing {
    #[serde(default)]
    pub offer_categories: Vec<OfferCategory>,
}

/// Category selector sent to `offer-category`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryRef {
    pub kind: String,
    pub slug: String,
}

impl CategoryRef {
    pub fn product_category(slug: &str) -> Self {
        Self {
            kind: "productCategory".to_string(),
            slug: slug.to_string(),
        }
    }
}

/// A remote record kept as JSON, identified by its non-empty `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    id: String,
    value: Value,
}

impl RawRecord {
    /// Returns `None` when the value has no usable id.
    pub fn from_value(value: Value) -> Option<Self> {
        let id = match value.get("id")? {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self { id, value })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

/// Convert raw page items into records, dropping the ones without an id.
pub fn records_from(values: Vec<Value>, context: &str) -> Vec<RawRecord> {
    let total = values.len();
    let records: Vec<RawRecord> = values.into_iter().filter_map(RawRecord::from_value).collect();
    if records.len() < total {
        debug!(
            context,
            dropped = total - records.len(),
            "Dropped records without an id"
        );
    }
    records
}

/// Body of `offer-category` and `fetch-offers`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPage {
    #[serde(default)]
    pub offers: Vec<Value>,
    #[serde(default)]
    pub total_hits: u64,
}

/// Body of `search-offers/`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOffersPage {
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub total_hits: u64,
    #[serde(default)]
    pub category_name: Option<String>,
}

/// One page of a paginated query.
#[derive(Debug, Clone, Default)]
pub struct PageResult {
    pub items: Vec<RawRecord>,
    pub total_hits: u64,
    pub api_calls_used: u32,
}

impl PageResult {
    /// A page fetched with one call.
    pub fn new(items: Vec<RawRecord>, total_hits: u64) -> Self {
        Self {
            items,
            total_hits,
            api_calls_used: 1,
        }
    }
}

/// Accumulated result of a pagination or fan-out run.
#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    pub items: Vec<RawRecord>,
    pub total_hits: u64,
    pub api_calls: u32,
    pub elapsed_seconds: f64,
}

/// Outcome of one partition inside a fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSummary {
    pub key: String,
    pub items: usize,
    pub api_calls: u32,
    pub failed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FanOutResult {
    pub aggregate: AggregateResult,
    pub partitions: Vec<PartitionSummary>,
}

impl FanOutResult {
    pub fn failed_partitions(&self) -> usize {
        self.partitions.iter().filter(|p| p.failed).count()
    }
}
