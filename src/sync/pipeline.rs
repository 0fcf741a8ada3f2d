//! Offer sync pipeline
//!
//! For every store near the configured center: fetch all offers, expand
//! compound offers, map them to rows, upsert products and offers, then
//! delete the store's offers that were not seen in this run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::config_loader;
use super::database::{DatabaseError, DeleteFilter, Store};
use super::mapper::{self, MapOutcome, MappingResult, OfferRow, ProductRow, SkipReason};
use crate::kruoka::aggregator::Aggregator;
use crate::kruoka::client::ApiError;
use crate::kruoka::geo::filter_stores_by_distance;
use crate::kruoka::types::{RawRecord, records_from};

/// Offer ids per `fetch-offers` call
pub const COMPOUND_FETCH_BATCH: usize = 25;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// UTC timestamp with a fixed width so stored values sort as text.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// What happened to the offers of one store while mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingCounters {
    pub mapped: usize,
    pub skipped: HashMap<SkipReason, usize>,
    pub malformed: usize,
    pub compound_offers: usize,
    pub compound_products: usize,
}

impl MappingCounters {
    pub fn skipped(&self, reason: SkipReason) -> usize {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreSyncReport {
    pub store_id: String,
    pub offers: usize,
    pub products: usize,
    pub deleted: usize,
    pub api_calls: u32,
    pub failed_partitions: usize,
    pub counters: MappingCounters,
    pub elapsed_seconds: f64,
    /// Set when the store's sync failed as a whole
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub stores: usize,
    pub total_offers: usize,
    pub failed_stores: Vec<String>,
    pub reports: Vec<StoreSyncReport>,
    pub elapsed_seconds: f64,
    pub failure_threshold: f64,
}

impl SyncSummary {
    /// True when strictly more than the threshold share of stores failed.
    pub fn exceeds_failure_threshold(&self) -> bool {
        !self.failed_stores.is_empty()
            && self.failed_stores.len() as f64 > self.stores as f64 * self.failure_threshold
    }
}

/// Rows collected for one store before they are written.
#[derive(Default)]
struct Collected {
    offers: Vec<OfferRow>,
    /// First product seen for each EAN
    products: BTreeMap<String, ProductRow>,
    /// offer id -> EAN, for the product id lookup
    offer_eans: HashMap<String, String>,
    counters: MappingCounters,
}

impl Collected {
    fn record(&mut self, store_id: &str, offer_id: &str, outcome: MappingResult<MapOutcome>) {
        match outcome {
            Ok(MapOutcome::Mapped { offer, product }) => {
                if let Some(product) = product {
                    self.offer_eans.insert(offer.id.clone(), product.ean.clone());
                    self.products.entry(product.ean.clone()).or_insert(product);
                }
                self.offers.push(offer);
                self.counters.mapped += 1;
            }
            Ok(MapOutcome::Skipped(reason)) => {
                *self.counters.skipped.entry(reason).or_default() += 1;
            }
            Err(e) => {
                warn!(store_id, offer_id, error = %e, "Failed to map offer, skipping");
                self.counters.malformed += 1;
            }
        }
    }
}

/// Keep the last row for each id, at the position of its first occurrence.
fn dedupe_offers(rows: Vec<OfferRow>) -> Vec<OfferRow> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut deduped: Vec<OfferRow> = Vec::with_capacity(rows.len());
    for row in rows {
        match index.get(&row.id) {
            Some(&i) => deduped[i] = row,
            None => {
                index.insert(row.id.clone(), deduped.len());
                deduped.push(row);
            }
        }
    }
    deduped
}

pub struct Pipeline<S: Store> {
    aggregator: Aggregator,
    store: Arc<S>,
}

impl<S: Store> Pipeline<S> {
    pub fn new(aggregator: Aggregator, store: Arc<S>) -> Self {
        Self { aggregator, store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn delete_stale(&self, store_id: &str, sync_time: &str) -> SyncResult<usize> {
        let filter = DeleteFilter::new(
            "store_id",
            mapper::store_row_id(store_id),
            "updated_at",
            sync_time.to_string(),
        );
        let deleted = self.store.delete_where("offers", &filter)?;
        if deleted > 0 {
            info!(store_id, deleted, "Deleted stale offers");
        }
        Ok(deleted)
    }

    fn expand_compound(&self, store_id: &str, ids: &[String], sync_time: &str, collected: &mut Collected) {
        info!(
            store_id,
            compound = ids.len(),
            calls = ids.len().div_ceil(COMPOUND_FETCH_BATCH),
            "Batch-fetching compound offers"
        );

        for batch in ids.chunks(COMPOUND_FETCH_BATCH) {
            let page = match self.aggregator.client().fetch_offers(store_id, batch) {
                Ok(page) => page,
                Err(e) => {
                    warn!(store_id, ?batch, error = %e, "Failed to fetch compound offers, skipping");
                    continue;
                }
            };

            for detail in records_from(page.offers, "fetch-offers") {
                let components = detail
                    .value()
                    .get("products")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if components.is_empty() {
                    debug!(store_id, offer_id = detail.id(), "Compound offer has no products");
                    continue;
                }

                for component in &components {
                    let outcome = mapper::map_component(store_id, &detail, component, sync_time);
                    if outcome.as_ref().is_ok_and(MapOutcome::is_mapped) {
                        collected.counters.compound_products += 1;
                    }
                    collected.record(store_id, detail.id(), outcome);
                }
            }
        }
    }

    fn map_offers(&self, store_id: &str, items: &[RawRecord], sync_time: &str) -> Collected {
        let mut collected = Collected::default();
        let mut compound_ids = Vec::new();

        for raw in items {
            if mapper::is_compound(raw.value()) {
                collected.counters.compound_offers += 1;
                compound_ids.push(raw.id().to_string());
                continue;
            }
            collected.record(store_id, raw.id(), mapper::map_primary(store_id, raw, sync_time));
        }

        if !compound_ids.is_empty() {
            self.expand_compound(store_id, &compound_ids, sync_time, &mut collected);
        }

        let counters = &collected.counters;
        if counters.total_skipped() > 0 || counters.compound_offers > 0 || counters.malformed > 0 {
            info!(
                store_id,
                no_discount = counters.skipped(SkipReason::NoDiscount),
                price_unresolved = counters.skipped(SkipReason::PriceUnresolved),
                unavailable = counters.skipped(SkipReason::Unavailable),
                missing_ean = counters.skipped(SkipReason::MissingEan),
                malformed = counters.malformed,
                compound_offers = counters.compound_offers,
                compound_products = counters.compound_products,
                "Mapping finished with skips"
            );
        }
        collected
    }

    /// Fetch, map and persist every offer of one store.
    pub fn sync_store_offers(&self, store_id: &str, sync_time: &str) -> SyncResult<StoreSyncReport> {
        let started = Instant::now();
        let fetched = self.aggregator.search_all_offers_for_store(store_id)?;
        let aggregate = fetched.aggregate;
        info!(
            store_id,
            offers = aggregate.items.len(),
            api_calls = aggregate.api_calls,
            elapsed_secs = aggregate.elapsed_seconds,
            "Fetched offers"
        );

        let mut report = StoreSyncReport {
            store_id: store_id.to_string(),
            api_calls: aggregate.api_calls,
            failed_partitions: fetched.partitions.iter().filter(|p| p.failed).count(),
            ..Default::default()
        };

        if aggregate.items.is_empty() {
            report.deleted = self.delete_stale(store_id, sync_time)?;
            report.elapsed_seconds = started.elapsed().as_secs_f64();
            return Ok(report);
        }

        let collected = self.map_offers(store_id, &aggregate.items, sync_time);

        let products: Vec<ProductRow> = collected.products.into_values().collect();
        if !products.is_empty() {
            self.store.upsert_batch(&products)?;
            info!(store_id, products = products.len(), "Upserted products");
        }

        let eans: Vec<String> = products.iter().map(|p| p.ean.clone()).collect();
        let product_ids: HashMap<String, i64> = self
            .store
            .select_by_keys::<ProductRow>("ean", &eans)?
            .into_iter()
            .filter_map(|p| Some((p.ean, p.id?)))
            .collect();

        let mut offers = collected.offers;
        for offer in &mut offers {
            offer.canonical_product_id = collected
                .offer_eans
                .get(&offer.id)
                .and_then(|ean| product_ids.get(ean))
                .copied();
        }

        let offers = dedupe_offers(offers);
        self.store.upsert_batch(&offers)?;
        info!(store_id, offers = offers.len(), "Upserted offers");

        report.offers = offers.len();
        report.products = products.len();
        report.counters = collected.counters;
        report.deleted = self.delete_stale(store_id, sync_time)?;
        report.elapsed_seconds = started.elapsed().as_secs_f64();
        Ok(report)
    }

    fn sync_one(&self, store_id: &str, sync_time: &str) -> StoreSyncReport {
        match self.sync_store_offers(store_id, sync_time) {
            Ok(report) => report,
            Err(e) => {
                error!(store_id, error = %e, "Store sync failed");
                StoreSyncReport {
                    store_id: store_id.to_string(),
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    /// Sync the given stores on a pool of `workers` threads.
    pub fn sync_stores(
        &self,
        store_ids: &[String],
        sync_time: &str,
        workers: usize,
    ) -> SyncResult<Vec<StoreSyncReport>> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("sync-worker-{i}"))
            .build()
            .map_err(|e| SyncError::WorkerPool(e.to_string()))?;

        let total = store_ids.len();
        Ok(pool.install(|| {
            store_ids
                .par_iter()
                .enumerate()
                .map(|(idx, store_id)| {
                    info!(store_id = %store_id, "[{}/{}] Syncing store", idx + 1, total);
                    self.sync_one(store_id, sync_time)
                })
                .collect()
        }))
    }

    /// Full run: stores near the center, then every store's offers.
    pub fn run(&self, settings: &config_loader::Sync) -> SyncResult<SyncSummary> {
        let started = Instant::now();
        let sync_time = timestamp();

        let stores = self.aggregator.client().fetch_all_stores()?;
        info!(stores = stores.len(), "Fetched store list");
        let stores = filter_stores_by_distance(
            stores,
            settings.center_latitude,
            settings.center_longitude,
            settings.max_distance_km,
        );

        let mut summary = SyncSummary {
            stores: stores.len(),
            failure_threshold: settings.failure_threshold,
            ..Default::default()
        };
        if stores.is_empty() {
            warn!("No stores found near the configured center");
            return Ok(summary);
        }

        let rows: Vec<_> = stores.iter().map(|s| mapper::map_store(s, &sync_time)).collect();
        self.store.upsert_batch(&rows)?;
        info!(stores = rows.len(), "Upserted stores");

        let ids: Vec<String> = stores.into_iter().map(|s| s.id).collect();
        let reports = self.sync_stores(&ids, &sync_time, settings.workers)?;

        summary.total_offers = reports.iter().map(|r| r.offers).sum();
        summary.failed_stores = reports
            .iter()
            .filter(|r| r.error.is_some())
            .map(|r| r.store_id.clone())
            .collect();
        summary.reports = reports;
        summary.elapsed_seconds = started.elapsed().as_secs_f64();

        info!(
            stores = summary.stores,
            total_offers = summary.total_offers,
            failed = summary.failed_stores.len(),
            elapsed_secs = summary.elapsed_seconds,
            "Sync complete"
        );
        Ok(summary)
    }
}
