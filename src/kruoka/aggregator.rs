//! Bulk fetch orchestration
//!
//! Two patterns are provided:
//! 1. Single-query pagination: fixed page size, increasing offsets, until a
//!    page comes back empty or the running total reaches the reported hits
//! 2. Fan-out: pagination once per partition, strictly one partition after
//!    another, merged with first-seen deduplication by record id
//!
//! Partitions run sequentially so the request rate stays predictable and a
//! shared 429 backoff does not release a burst of synchronized retries.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use super::client::{ApiClient, ApiResult, MAX_OFFER_CATEGORY_LIMIT, SEARCH_OFFERS_PAGE_SIZE};
use super::types::{AggregateResult, FanOutResult, PageResult, PartitionSummary, RawRecord, records_from};

/// Offsets at or beyond this are rejected by `search-offers/`.
pub const SEARCH_OFFERS_MAX_OFFSET: u32 = 1000;

/// Progress hooks. Both methods default to doing nothing.
pub trait AggregationObserver: Send + Sync {
    fn on_page(&self, _partition: &str, _offset: u32, _page_items: usize, _total_hits: u64) {}

    fn on_partition_done(&self, _summary: &PartitionSummary) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl AggregationObserver for NoopObserver {}

/// Parameters for one paginated query.
pub struct PageQuery<'a> {
    pub partition: &'a str,
    pub page_size: u32,
    /// Stop before requesting an offset at or past this value
    pub max_offset: Option<u32>,
}

/// Page through one query until it is exhausted.
pub fn paginate<F>(
    query: &PageQuery<'_>,
    observer: &dyn AggregationObserver,
    mut fetch: F,
) -> ApiResult<AggregateResult>
where
    F: FnMut(u32) -> ApiResult<PageResult>,
{
    let started = Instant::now();
    let mut items: Vec<RawRecord> = Vec::new();
    let mut total_hits: Option<u64> = None;
    let mut api_calls = 0u32;
    let mut offset = 0u32;

    loop {
        let page = fetch(offset)?;
        api_calls += page.api_calls_used;

        let total = *total_hits.get_or_insert(page.total_hits);
        let page_items = page.items.len();
        items.extend(page.items);
        observer.on_page(query.partition, offset, page_items, total);

        // A zero or missing hit count says nothing; keep going while pages have items
        let reached_total = total > 0 && items.len() as u64 >= total;
        if page_items == 0 || reached_total {
            break;
        }

        offset += query.page_size;
        if let Some(max_offset) = query.max_offset {
            if offset >= max_offset {
                warn!(
                    partition = query.partition,
                    fetched = items.len(),
                    total_hits = total,
                    "Offset ceiling reached, result truncated"
                );
                break;
            }
        }
    }

    Ok(AggregateResult {
        items,
        total_hits: total_hits.unwrap_or(0),
        api_calls,
        elapsed_seconds: started.elapsed().as_secs_f64(),
    })
}

/// Run `fetch_partition` for each key in order and merge the results.
///
/// A failing partition is logged and contributes nothing.
pub fn fan_out<'k, K, F>(keys: K, observer: &dyn AggregationObserver, mut fetch_partition: F) -> FanOutResult
where
    K: IntoIterator<Item = &'k str>,
    F: FnMut(&str) -> ApiResult<AggregateResult>,
{
    let started = Instant::now();
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged: Vec<RawRecord> = Vec::new();
    let mut partitions = Vec::new();
    let mut api_calls = 0u32;

    for key in keys {
        let summary = match fetch_partition(key) {
            Ok(result) => {
                api_calls += result.api_calls;
                let fetched = result.items.len();
                for item in result.items {
                    if seen.insert(item.id().to_string()) {
                        merged.push(item);
                    }
                }
                PartitionSummary {
                    key: key.to_string(),
                    items: fetched,
                    api_calls: result.api_calls,
                    failed: false,
                }
            }
            Err(e) => {
                warn!(partition = key, error = %e, "Partition failed, skipping");
                PartitionSummary {
                    key: key.to_string(),
                    items: 0,
                    api_calls: 0,
                    failed: true,
                }
            }
        };

        observer.on_partition_done(&summary);
        partitions.push(summary);
    }

    FanOutResult {
        aggregate: AggregateResult {
            total_hits: merged.len() as u64,
            items: merged,
            api_calls,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        },
        partitions,
    }
}

/// Store-level bulk fetches over an [`ApiClient`].
#[derive(Clone)]
pub struct Aggregator {
    client: ApiClient,
    observer: Arc<dyn AggregationObserver>,
}

impl Aggregator {
    pub fn new(client: ApiClient) -> Self {
        Self::with_observer(client, Arc::new(NoopObserver))
    }

    pub fn with_observer(client: ApiClient, observer: Arc<dyn AggregationObserver>) -> Self {
        Self { client, observer }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Every offer of one category, 25 per call.
    pub fn paginate_category(&self, store_id: &str, slug: &str) -> ApiResult<AggregateResult> {
        let query = PageQuery {
            partition: slug,
            page_size: MAX_OFFER_CATEGORY_LIMIT,
            max_offset: None,
        };
        paginate(&query, self.observer.as_ref(), |offset| {
            let page = self.client.offer_category_page(store_id, slug, offset)?;
            Ok(PageResult::new(records_from(page.offers, slug), page.total_hits))
        })
    }

    /// Every offer under a category path via `search-offers/`, up to the
    /// endpoint's offset ceiling.
    #[allow(dead_code)]
    pub fn paginate_search_offers(&self, store_id: &str, category_path: &str) -> ApiResult<AggregateResult> {
        let query = PageQuery {
            partition: category_path,
            page_size: SEARCH_OFFERS_PAGE_SIZE,
            max_offset: Some(SEARCH_OFFERS_MAX_OFFSET),
        };
        paginate(&query, self.observer.as_ref(), |offset| {
            let page = self.client.search_offers(store_id, category_path, offset)?;
            Ok(PageResult::new(records_from(page.results, category_path), page.total_hits))
        })
    }

    /// Every offer of a store: list its categories, then page through each.
    ///
    /// Fails only when the category listing itself fails.
    pub fn search_all_offers_for_store(&self, store_id: &str) -> ApiResult<FanOutResult> {
        let started = Instant::now();
        let categories = self.client.fetch_offer_categories(store_id)?;
        let slugs: Vec<&str> = categories
            .iter()
            .map(|c| c.slug.as_str())
            .filter(|slug| !slug.is_empty())
            .collect();

        if slugs.is_empty() {
            warn!(store_id, "No offer categories found");
            return Ok(FanOutResult {
                aggregate: AggregateResult {
                    api_calls: 1,
                    ..Default::default()
                },
                partitions: Vec::new(),
            });
        }

        let mut result = fan_out(slugs, self.observer.as_ref(), |slug| {
            self.paginate_category(store_id, slug)
        });
        result.aggregate.api_calls += 1;
        result.aggregate.elapsed_seconds = started.elapsed().as_secs_f64();

        info!(
            store_id,
            offers = result.aggregate.items.len(),
            api_calls = result.aggregate.api_calls,
            failed_categories = result.failed_partitions(),
            elapsed_secs = result.aggregate.elapsed_seconds,
            "Fetched store offers"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kruoka::client::ApiError;
    use crate::kruoka::client::tests::mock_client;
    use crate::kruoka::types::ApiResponse;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    fn records(ids: &[&str]) -> Vec<RawRecord> {
        ids.iter()
            .filter_map(|id| RawRecord::from_value(json!({"id": id})))
            .collect()
    }

    fn numbered(prefix: &str, start: usize, count: usize) -> Vec<Value> {
        (start..start + count)
            .map(|i| json!({"id": format!("{prefix}{i}")}))
            .collect()
    }

    #[test]
    fn test_pagination_stops_at_total_hits() {
        let sizes = [25usize, 25, 25, 10, 0];
        let mut calls = 0usize;
        let query = PageQuery {
            partition: "juomat",
            page_size: 25,
            max_offset: None,
        };

        let result = paginate(&query, &NoopObserver, |offset| {
            let size = sizes[calls];
            calls += 1;
            let page = numbered("o", offset as usize, size);
            Ok(PageResult::new(records_from(page, "test"), 85))
        })
        .unwrap();

        assert_eq!(result.items.len(), 85);
        assert_eq!(result.api_calls, 4);
        assert_eq!(result.total_hits, 85);
        assert_eq!(calls, 4);
        assert_eq!(result.items[84].id(), "o84");
    }

    #[test]
    fn test_pagination_without_hit_count_uses_empty_page() {
        let sizes = [25usize, 10, 0];
        let mut calls = 0usize;
        let query = PageQuery {
            partition: "x",
            page_size: 25,
            max_offset: None,
        };

        let result = paginate(&query, &NoopObserver, |offset| {
            let size = sizes[calls];
            calls += 1;
            Ok(PageResult::new(records_from(numbered("o", offset as usize, size), "test"), 0))
        })
        .unwrap();

        assert_eq!(result.items.len(), 35);
        assert_eq!(result.api_calls, 3);
    }

    #[test]
    fn test_pagination_respects_offset_ceiling() {
        let query = PageQuery {
            partition: "huge",
            page_size: 48,
            max_offset: Some(SEARCH_OFFERS_MAX_OFFSET),
        };

        let result = paginate(&query, &NoopObserver, |offset| {
            assert!(offset < SEARCH_OFFERS_MAX_OFFSET);
            Ok(PageResult::new(records_from(numbered("s", offset as usize, 48), "test"), 5000))
        })
        .unwrap();

        // Offsets 0, 48, ..., 960
        assert_eq!(result.api_calls, 21);
        assert_eq!(result.items.len(), 21 * 48);
    }

    #[test]
    fn test_fan_out_keeps_first_copy() {
        let result = fan_out(["a", "b"], &NoopObserver, |key| {
            let own = format!("{key}-only");
            let mut items = records(&["X1", own.as_str()]);
            if key == "b" {
                items[0] = RawRecord::from_value(json!({"id": "X1", "from": "b"})).unwrap();
            }
            Ok(AggregateResult {
                items,
                total_hits: 2,
                api_calls: 1,
                elapsed_seconds: 0.0,
            })
        });

        let ids: Vec<&str> = result.aggregate.items.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["X1", "a-only", "b-only"]);
        assert!(result.aggregate.items[0].value().get("from").is_none());
        assert_eq!(result.aggregate.api_calls, 2);
        assert_eq!(result.aggregate.total_hits, 3);
    }

    #[test]
    fn test_fan_out_skips_failed_partition() {
        struct Recorder(Mutex<Vec<PartitionSummary>>);
        impl AggregationObserver for Recorder {
            fn on_partition_done(&self, summary: &PartitionSummary) {
                self.0.lock().push(summary.clone());
            }
        }

        let observer = Recorder(Mutex::new(Vec::new()));
        let result = fan_out(["good", "bad", "also-good"], &observer, |key| {
            if key == "bad" {
                return Err(ApiError::Status {
                    endpoint: "offer-category".to_string(),
                    status: 500,
                    body: String::new(),
                });
            }
            Ok(AggregateResult {
                items: records(&[key]),
                total_hits: 1,
                api_calls: 1,
                elapsed_seconds: 0.0,
            })
        });

        assert_eq!(result.aggregate.items.len(), 2);
        assert_eq!(result.failed_partitions(), 1);
        let seen = observer.0.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen[1].failed);
    }

    #[test]
    fn test_search_offers_pages_by_offset() {
        let (client, factory, _) = mock_client(|request| {
            let offset: usize = request
                .query
                .iter()
                .find(|(key, _)| key == "offset")
                .and_then(|(_, value)| value.parse().ok())
                .unwrap_or(0);
            let size = if offset == 0 { 48 } else { 12 };
            let results = numbered("s", offset, size);
            ApiResponse::new(
                200,
                json!({"results": results, "totalHits": 60, "categoryName": "Juomat"}).to_string(),
            )
        });

        let aggregator = Aggregator::new(client);
        let result = aggregator.paginate_search_offers("N110", "juomat").unwrap();

        assert_eq!(result.items.len(), 60);
        assert_eq!(result.api_calls, 2);
        assert_eq!(result.total_hits, 60);
        assert_eq!(result.items[59].id(), "s59");

        let log = factory.log.lock();
        let offsets: Vec<&str> = log
            .iter()
            .filter(|r| r.endpoint == "search-offers/")
            .filter_map(|r| r.query.iter().find(|(key, _)| key == "offset"))
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(offsets, vec!["0", "48"]);
    }

    #[test]
    fn test_store_fan_out_through_client() {
        let (client, factory, _) = mock_client(|request| match request.endpoint.as_str() {
            "offer-categories" => ApiResponse::new(
                200,
                r#"{"offerCategories": [{"slug": "juomat"}, {"slug": ""}, {"slug": "liha"}]}"#,
            ),
            "offer-category" => {
                let body = request.body.as_ref().unwrap();
                let slug = body["category"]["slug"].as_str().unwrap_or_default();
                let offset = body["offset"].as_u64().unwrap_or(0);
                let offers = if offset > 0 {
                    json!([])
                } else if slug == "juomat" {
                    json!([{"id": "X1"}, {"id": "J2"}])
                } else {
                    json!([{"id": "X1"}, {"id": "L2"}, {"title": "no id"}])
                };
                ApiResponse::new(200, json!({"offers": offers, "totalHits": 2}).to_string())
            }
            _ => ApiResponse::new(404, ""),
        });

        let aggregator = Aggregator::new(client);
        let result = aggregator.search_all_offers_for_store("N110").unwrap();

        let ids: Vec<&str> = result.aggregate.items.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["X1", "J2", "L2"]);
        assert_eq!(result.partitions.len(), 2);
        assert_eq!(factory.calls_to("offer-category"), 2);
        // Listing plus one page per category
        assert_eq!(result.aggregate.api_calls, 3);
    }
}
