//! Record mapping from K-Ruoka payloads to store rows
//!
//! Offers arrive as loosely shaped JSON. This module resolves prices through
//! the fallback chain, decides whether an offer is worth keeping and builds
//! the `stores`, `offers` and `products` rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::kruoka::types::{RawRecord, StoreLocation, StoreInfo};

pub const SOURCE: &str = "k-ruoka";
const SITE_URL: &str = "https://www.k-ruoka.fi";
const UNKNOWN_TITLE: &str = "Unknown";
/// EANs with this prefix are in-store codes and never become products
const IN_STORE_EAN_PREFIX: char = '2';

#[derive(Error, Debug, PartialEq)]
pub enum MappingError {
    #[error("Malformed record {id}: {reason}")]
    Malformed { id: String, reason: String },
}

pub type MappingResult<T> = Result<T, MappingError>;

/// Why an offer was deliberately left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Offer price is not below the normal price
    NoDiscount,
    /// No price in any fallback position
    PriceUnresolved,
    /// Product is marked unavailable at the store
    Unavailable,
    /// Compound component without an EAN
    MissingEan,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoDiscount => write!(f, "no_discount"),
            SkipReason::PriceUnresolved => write!(f, "price_unresolved"),
            SkipReason::Unavailable => write!(f, "unavailable"),
            SkipReason::MissingEan => write!(f, "missing_ean"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreRow {
    pub id: String,
    pub remote_id: String,
    pub source: String,
    pub name: String,
    pub slug: Option<String>,
    pub brand: Option<String>,
    pub street_address: Option<String>,
    pub postcode: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_active: bool,
    pub last_seen_at: String,
    pub raw_data: Value,
}

/// One level of the category tree, leaf first once mapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCrumb {
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfferRow {
    pub id: String,
    pub store_id: String,
    pub title: String,
    pub price: f64,
    pub unit_price: Option<f64>,
    pub unit: Option<String>,
    pub normal_price: Option<f64>,
    pub quantity_required: u32,
    pub source_url: Option<String>,
    pub image_url: Option<String>,
    pub categories: Option<Vec<CategoryCrumb>>,
    pub valid_from: Option<String>,
    pub valid_to: Option<String>,
    /// Set after products are upserted
    pub canonical_product_id: Option<i64>,
    /// Price sources disagreed
    pub needs_review: bool,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductRow {
    /// Assigned by the store
    pub id: Option<i64>,
    pub ean: String,
    pub name: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MapOutcome {
    Mapped {
        offer: OfferRow,
        product: Option<ProductRow>,
    },
    Skipped(SkipReason),
}

impl MapOutcome {
    pub fn is_mapped(&self) -> bool {
        matches!(self, MapOutcome::Mapped { .. })
    }
}

/// Canonical short code for a raw unit string.
pub fn map_unit(raw: &str) -> Option<&'static str> {
    match raw.trim().to_lowercase().as_str() {
        "kpl" | "st" | "pcs" => Some("pcs"),
        "kg" | "kg1" => Some("kg"),
        "l" | "ltr" => Some("l"),
        "g" | "gr" => Some("g"),
        "ml" => Some("ml"),
        _ => None,
    }
}

pub fn store_row_id(store_id: &str) -> String {
    format!("{SOURCE}:{store_id}")
}

pub fn map_store(store: &StoreInfo, seen_at: &str) -> StoreRow {
    let (street_address, postcode, city) = match &store.location {
        Some(StoreLocation::Address {
            address,
            postal_code,
            city,
        }) => (address.clone(), postal_code.clone(), city.clone()),
        Some(StoreLocation::Text(text)) => (Some(text.clone()), None, None),
        None => (None, None, None),
    };
    let geo = store.geo.clone().unwrap_or_default();

    StoreRow {
        id: store_row_id(&store.id),
        remote_id: store.id.clone(),
        source: SOURCE.to_string(),
        name: store.name.clone(),
        slug: store.slug.clone(),
        brand: store.chain_name.clone(),
        street_address,
        postcode,
        city,
        latitude: geo.latitude,
        longitude: geo.longitude,
        is_active: true,
        last_seen_at: seen_at.to_string(),
        raw_data: serde_json::to_value(store).unwrap_or_default(),
    }
}

/// An offer without an embedded product lists several products and needs a
/// separate detail fetch.
pub fn is_compound(offer: &Value) -> bool {
    match offer.get("product") {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn present<'a>(value: &'a Value, pointer: &str) -> Option<&'a Value> {
    value.pointer(pointer).filter(|v| !v.is_null())
}

fn text(value: &Value, pointer: &str) -> Option<String> {
    present(value, pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn malformed(id: &str, reason: impl Into<String>) -> MappingError {
    MappingError::Malformed {
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn number(value: &Value, pointer: &str, id: &str) -> MappingResult<Option<f64>> {
    match present(value, pointer) {
        None => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .map(Some)
            .map_err(|_| malformed(id, format!("{pointer} is not a number: {s:?}"))),
        Some(other) => Err(malformed(id, format!("{pointer} has unexpected type: {other}"))),
    }
}

/// EAN as a trimmed string; the API sends both strings and numbers.
fn ean_at(value: &Value, pointer: &str) -> Option<String> {
    let ean = match present(value, pointer)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!ean.is_empty()).then_some(ean)
}

fn search_url(ean: &str) -> String {
    format!("{SITE_URL}/kauppa/tuotehaku?haku={ean}")
}

fn offer_title(offer: &Value) -> String {
    text(offer, "/localizedTitle/finnish")
        .or_else(|| text(offer, "/localizedTitle/english"))
        .unwrap_or_else(|| UNKNOWN_TITLE.to_string())
}

fn is_unavailable(product: &Value) -> bool {
    matches!(present(product, "/availability/store"), Some(Value::Bool(false)))
}

/// Offer price and normal price after the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ResolvedPrice {
    price: Option<f64>,
    normal_price: Option<f64>,
    needs_review: bool,
}

/// A fallback price that cannot be read counts as absent. The second value
/// reports whether it was unreadable.
fn fallback_number(value: &Value, pointer: &str, id: &str) -> (Option<f64>, bool) {
    match number(value, pointer, id) {
        Ok(found) => (found, false),
        Err(e) => {
            warn!(offer_id = id, error = %e, "Ignoring unreadable fallback price");
            (None, true)
        }
    }
}

fn resolve_price(offer: &Value, product: &Value, id: &str) -> MappingResult<ResolvedPrice> {
    let top = number(offer, "/pricing/price", id)?;
    let (discount, bad_discount) = fallback_number(product, "/mobilescan/pricing/discount/price", id);
    let (batch, bad_batch) = fallback_number(product, "/mobilescan/pricing/batch/price", id);

    let (normal_price, bad_normal) = match number(offer, "/normalPricing/price", id)? {
        Some(normal) => (Some(normal), false),
        None => fallback_number(product, "/mobilescan/pricing/normal/price", id),
    };

    let sources: Vec<f64> = [top, discount, batch].into_iter().flatten().collect();
    let disagree = sources.windows(2).any(|pair| (pair[0] - pair[1]).abs() > f64::EPSILON);
    if disagree {
        debug!(offer_id = id, ?top, ?discount, ?batch, "Price sources disagree");
    }

    Ok(ResolvedPrice {
        price: top.or(discount).or(batch),
        normal_price,
        needs_review: disagree || bad_discount || bad_batch || bad_normal,
    })
}

fn price_skip(resolved: &ResolvedPrice) -> Option<SkipReason> {
    match (resolved.price, resolved.normal_price) {
        (Some(price), Some(normal)) if price >= normal => Some(SkipReason::NoDiscount),
        (None, _) => Some(SkipReason::PriceUnresolved),
        _ => None,
    }
}

/// Fields shared by single-product offers and compound components.
struct ProductFields {
    ean: Option<String>,
    image_url: Option<String>,
    source_url: Option<String>,
    categories: Option<Vec<CategoryCrumb>>,
    unit_price: Option<f64>,
    unit: Option<String>,
    valid_from: Option<String>,
    valid_to: Option<String>,
    quantity_required: u32,
}

fn product_fields(product: &Value, offer: &Value, id: &str) -> MappingResult<ProductFields> {
    let mut unit_price = None;
    let mut unit = None;
    for source in ["discount", "batch", "normal"] {
        let base = format!("/mobilescan/pricing/{source}/unitPrice");
        if let Some(value) = number(product, &format!("{base}/value"), id)? {
            unit_price = Some(value);
            unit = text(product, &format!("{base}/unit"))
                .and_then(|raw| map_unit(&raw))
                .map(str::to_string);
            break;
        }
    }

    let ean = ean_at(product, "/ean");

    let image_url = present(product, "/images/0")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| text(offer, "/image"));

    let source_url = match (text(product, "/productAttributes/urlSlug"), &ean) {
        (Some(slug), _) => Some(format!("{SITE_URL}/kauppa/tuote/{slug}")),
        (None, Some(ean)) => Some(search_url(ean)),
        (None, None) => None,
    };

    let valid_from = text(product, "/mobilescan/pricing/discount/startDate")
        .or_else(|| text(product, "/mobilescan/pricing/batch/startDate"));
    let valid_to = text(product, "/mobilescan/pricing/discount/endDate")
        .or_else(|| text(product, "/mobilescan/pricing/batch/endDate"));

    let categories = present(product, "/category/tree")
        .and_then(Value::as_array)
        .filter(|tree| !tree.is_empty())
        .map(|tree| {
            tree.iter()
                .rev()
                .map(|entry| CategoryCrumb {
                    name: text(entry, "/localizedName/finnish").unwrap_or_default(),
                    slug: text(entry, "/slug").unwrap_or_default(),
                })
                .collect()
        });

    let quantity_required = number(product, "/mobilescan/pricing/batch/amount", id)?
        .filter(|amount| *amount >= 1.0)
        .map(|amount| amount.round() as u32)
        .unwrap_or(1);

    Ok(ProductFields {
        ean,
        image_url,
        source_url,
        categories,
        unit_price,
        unit,
        valid_from,
        valid_to,
        quantity_required,
    })
}

fn product_row(ean: &str, title: &str, image_url: &Option<String>) -> Option<ProductRow> {
    (!ean.starts_with(IN_STORE_EAN_PREFIX)).then(|| ProductRow {
        id: None,
        ean: ean.to_string(),
        name: title.to_string(),
        image_url: image_url.clone(),
    })
}

fn offer_row(
    id: String,
    store_id: &str,
    title: String,
    resolved: &ResolvedPrice,
    price: f64,
    fields: ProductFields,
    updated_at: &str,
) -> OfferRow {
    OfferRow {
        id,
        store_id: store_row_id(store_id),
        title,
        price,
        unit_price: fields.unit_price,
        unit: fields.unit,
        normal_price: resolved.normal_price,
        quantity_required: fields.quantity_required,
        source_url: fields.source_url,
        image_url: fields.image_url,
        categories: fields.categories,
        valid_from: fields.valid_from,
        valid_to: fields.valid_to,
        canonical_product_id: None,
        needs_review: resolved.needs_review,
        updated_at: updated_at.to_string(),
    }
}

/// Map a single-product offer.
pub fn map_primary(store_id: &str, raw: &RawRecord, updated_at: &str) -> MappingResult<MapOutcome> {
    let offer = raw.value();
    let id = raw.id();
    if !offer.is_object() {
        return Err(malformed(id, "offer is not an object"));
    }

    let wrapper = present(offer, "/product").cloned().unwrap_or(Value::Null);
    let product = present(&wrapper, "/product").cloned().unwrap_or(Value::Null);

    let resolved = resolve_price(offer, &product, id)?;
    if let Some(reason) = price_skip(&resolved) {
        return Ok(MapOutcome::Skipped(reason));
    }
    if is_unavailable(&product) {
        return Ok(MapOutcome::Skipped(SkipReason::Unavailable));
    }
    let Some(price) = resolved.price else {
        return Ok(MapOutcome::Skipped(SkipReason::PriceUnresolved));
    };

    let title = offer_title(offer);
    let mut fields = product_fields(&product, offer, id)?;
    let ean = fields.ean.take().or_else(|| ean_at(&wrapper, "/id"));
    if fields.source_url.is_none() {
        fields.source_url = ean.as_deref().map(search_url);
    }
    let product = ean
        .as_deref()
        .and_then(|ean| product_row(ean, &title, &fields.image_url));

    let offer = offer_row(
        format!("{SOURCE}:{store_id}:{id}"),
        store_id,
        title,
        &resolved,
        price,
        fields,
        updated_at,
    );
    Ok(MapOutcome::Mapped { offer, product })
}

/// Map one product of a compound offer. `parent` is the offer detail and
/// `component` one entry of its `products` list.
pub fn map_component(
    store_id: &str,
    parent: &RawRecord,
    component: &Value,
    updated_at: &str,
) -> MappingResult<MapOutcome> {
    let offer = parent.value();
    let id = parent.id();
    if !component.is_object() {
        return Err(malformed(id, "component is not an object"));
    }

    let product = present(component, "/product").cloned().unwrap_or(Value::Null);
    if is_unavailable(&product) {
        return Ok(MapOutcome::Skipped(SkipReason::Unavailable));
    }

    let resolved = resolve_price(offer, &product, id)?;
    if let Some(reason) = price_skip(&resolved) {
        return Ok(MapOutcome::Skipped(reason));
    }
    let Some(price) = resolved.price else {
        return Ok(MapOutcome::Skipped(SkipReason::PriceUnresolved));
    };

    let mut fields = product_fields(&product, offer, id)?;
    let Some(ean) = fields.ean.take() else {
        return Ok(MapOutcome::Skipped(SkipReason::MissingEan));
    };

    let title = text(&product, "/localizedName/finnish").unwrap_or_else(|| offer_title(offer));
    let product = product_row(&ean, &title, &fields.image_url);

    let offer = offer_row(
        format!("{SOURCE}:{store_id}:{id}:{ean}"),
        store_id,
        title,
        &resolved,
        price,
        fields,
        updated_at,
    );
    Ok(MapOutcome::Mapped { offer, product })
}
