//! Table bindings for the mapped rows

use rusqlite::Row;
use rusqlite::types::{Type, Value as SqlValue};
use serde::de::DeserializeOwned;

use super::{DatabaseResult, Record};
use crate::sync::mapper::{OfferRow, ProductRow, StoreRow};

fn json_column<T: DeserializeOwned>(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<T>> {
    let Some(text) = row.get::<_, Option<String>>(column)? else {
        return Ok(None);
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn json_value<T: serde::Serialize>(value: &Option<T>) -> DatabaseResult<SqlValue> {
    Ok(match value {
        Some(value) => SqlValue::Text(serde_json::to_string(value)?),
        None => SqlValue::Null,
    })
}

impl Record for StoreRow {
    const TABLE: &'static str = "stores";
    const CONFLICT_KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "remote_id",
        "source",
        "name",
        "slug",
        "brand",
        "street_address",
        "postcode",
        "city",
        "latitude",
        "longitude",
        "is_active",
        "last_seen_at",
        "raw_data",
    ];

    fn values(&self) -> DatabaseResult<Vec<SqlValue>> {
        Ok(vec![
            self.id.clone().into(),
            self.remote_id.clone().into(),
            self.source.clone().into(),
            self.name.clone().into(),
            self.slug.clone().into(),
            self.brand.clone().into(),
            self.street_address.clone().into(),
            self.postcode.clone().into(),
            self.city.clone().into(),
            self.latitude.into(),
            self.longitude.into(),
            self.is_active.into(),
            self.last_seen_at.clone().into(),
            SqlValue::Text(serde_json::to_string(&self.raw_data)?),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            remote_id: row.get("remote_id")?,
            source: row.get("source")?,
            name: row.get("name")?,
            slug: row.get("slug")?,
            brand: row.get("brand")?,
            street_address: row.get("street_address")?,
            postcode: row.get("postcode")?,
            city: row.get("city")?,
            latitude: row.get("latitude")?,
            longitude: row.get("longitude")?,
            is_active: row.get("is_active")?,
            last_seen_at: row.get("last_seen_at")?,
            raw_data: json_column(row, "raw_data")?.unwrap_or_default(),
        })
    }
}

impl Record for ProductRow {
    const TABLE: &'static str = "products";
    const CONFLICT_KEY: &'static str = "ean";
    const COLUMNS: &'static [&'static str] = &["ean", "name", "image_url"];

    fn values(&self) -> DatabaseResult<Vec<SqlValue>> {
        Ok(vec![
            self.ean.clone().into(),
            self.name.clone().into(),
            self.image_url.clone().into(),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            ean: row.get("ean")?,
            name: row.get("name")?,
            image_url: row.get("image_url")?,
        })
    }
}

impl Record for OfferRow {
    const TABLE: &'static str = "offers";
    const CONFLICT_KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "store_id",
        "title",
        "price",
        "unit_price",
        "unit",
        "normal_price",
        "quantity_required",
        "source_url",
        "image_url",
        "categories",
        "valid_from",
        "valid_to",
        "canonical_product_id",
        "needs_review",
        "updated_at",
    ];

    fn values(&self) -> DatabaseResult<Vec<SqlValue>> {
        Ok(vec![
            self.id.clone().into(),
            self.store_id.clone().into(),
            self.title.clone().into(),
            self.price.into(),
            self.unit_price.into(),
            self.unit.clone().into(),
            self.normal_price.into(),
            self.quantity_required.into(),
            self.source_url.clone().into(),
            self.image_url.clone().into(),
            json_value(&self.categories)?,
            self.valid_from.clone().into(),
            self.valid_to.clone().into(),
            self.canonical_product_id.into(),
            self.needs_review.into(),
            self.updated_at.clone().into(),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            store_id: row.get("store_id")?,
            title: row.get("title")?,
            price: row.get("price")?,
            unit_price: row.get("unit_price")?,
            unit: row.get("unit")?,
            normal_price: row.get("normal_price")?,
            quantity_required: row.get("quantity_required")?,
            source_url: row.get("source_url")?,
            image_url: row.get("image_url")?,
            categories: json_column(row, "categories")?,
            valid_from: row.get("valid_from")?,
            valid_to: row.get("valid_to")?,
            canonical_product_id: row.get("canonical_product_id")?,
            needs_review: row.get("needs_review")?,
            updated_at: row.get("updated_at")?,
        })
    }
}
