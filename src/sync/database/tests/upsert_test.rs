//! Upsert, lookup and stale-row deletion tests

#[cfg(test)]
mod tests {
    use super::super::super::*;
    use crate::sync::mapper::{CategoryCrumb, OfferRow, ProductRow, StoreRow};

    use serde_json::json;
    use tempfile::tempdir;

    const EARLIER: &str = "2026-01-01T00:00:00.000000Z";
    const SYNC_TIME: &str = "2026-01-02T00:00:00.000000Z";
    const LATER: &str = "2026-01-02T00:00:05.000000Z";

    fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("db").join("test.sqlite")).unwrap();
        (dir, store)
    }

    fn store_row(id: &str) -> StoreRow {
        StoreRow {
            id: format!("k-ruoka:{id}"),
            remote_id: id.to_string(),
            source: "k-ruoka".to_string(),
            name: format!("Store {id}"),
            slug: None,
            brand: Some("K-Market".to_string()),
            street_address: None,
            postcode: None,
            city: Some("Helsinki".to_string()),
            latitude: Some(60.17),
            longitude: Some(24.94),
            is_active: true,
            last_seen_at: SYNC_TIME.to_string(),
            raw_data: json!({"id": id}),
        }
    }

    fn offer_row(id: &str, store: &str, updated_at: &str) -> OfferRow {
        OfferRow {
            id: id.to_string(),
            store_id: format!("k-ruoka:{store}"),
            title: format!("Offer {id}"),
            price: 1.99,
            unit_price: Some(3.98),
            unit: Some("kg".to_string()),
            normal_price: Some(2.49),
            quantity_required: 1,
            source_url: None,
            image_url: None,
            categories: Some(vec![CategoryCrumb {
                name: "Maito".to_string(),
                slug: "maito".to_string(),
            }]),
            valid_from: None,
            valid_to: None,
            canonical_product_id: None,
            needs_review: false,
            updated_at: updated_at.to_string(),
        }
    }

    fn product_row(ean: &str, name: &str) -> ProductRow {
        ProductRow {
            id: None,
            ean: ean.to_string(),
            name: name.to_string(),
            image_url: None,
        }
    }

    #[test]
    fn test_upsert_twice_is_idempotent() {
        let (_dir, store) = open_store();
        store.upsert_batch(&[store_row("N110")]).unwrap();

        let offers = vec![offer_row("a", "N110", SYNC_TIME), offer_row("b", "N110", SYNC_TIME)];
        store.upsert_batch(&offers).unwrap();
        store.upsert_batch(&offers).unwrap();

        assert_eq!(store.count("offers").unwrap(), 2);

        let keys = vec!["a".to_string(), "b".to_string()];
        let mut stored: Vec<OfferRow> = store.select_by_keys("id", &keys).unwrap();
        stored.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(stored, offers);
    }

    #[test]
    fn test_upsert_updates_fields_and_keeps_product_ids() {
        let (_dir, store) = open_store();
        store.upsert_batch(&[product_row("6408430000012", "Maito")]).unwrap();
        let first: Vec<ProductRow> = store
            .select_by_keys("ean", &["6408430000012".to_string()])
            .unwrap();

        store.upsert_batch(&[product_row("6408430000012", "Maito 1 l")]).unwrap();
        let second: Vec<ProductRow> = store
            .select_by_keys("ean", &["6408430000012".to_string()])
            .unwrap();

        assert_eq!(store.count("products").unwrap(), 1);
        assert_eq!(second[0].name, "Maito 1 l");
        assert!(second[0].id.is_some());
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn test_large_batches_are_split() {
        let (_dir, store) = open_store();
        let products: Vec<ProductRow> = (0..(BATCH_SIZE + 20))
            .map(|i| product_row(&format!("64{i:011}"), "P"))
            .collect();

        assert_eq!(store.upsert_batch(&products).unwrap(), products.len());

        let keys: Vec<String> = products.iter().map(|p| p.ean.clone()).collect();
        let found: Vec<ProductRow> = store.select_by_keys("ean", &keys).unwrap();
        assert_eq!(found.len(), products.len());
    }

    #[test]
    fn test_stale_rows_are_deleted_per_store() {
        let (_dir, store) = open_store();
        store.upsert_batch(&[store_row("N110"), store_row("N111")]).unwrap();
        store
            .upsert_batch(&[
                offer_row("old", "N110", EARLIER),
                offer_row("current", "N110", SYNC_TIME),
                offer_row("fresh", "N110", LATER),
                offer_row("other-store", "N111", EARLIER),
            ])
            .unwrap();

        let filter = DeleteFilter::new("store_id", "k-ruoka:N110".to_string(), "updated_at", SYNC_TIME.to_string());
        assert_eq!(store.delete_where("offers", &filter).unwrap(), 1);

        let keys: Vec<String> = ["old", "current", "fresh", "other-store"]
            .iter()
            .map(|k| k.to_string())
            .collect();
        let mut remaining: Vec<String> = store
            .select_by_keys::<OfferRow>("id", &keys)
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["current", "fresh", "other-store"]);
    }

    #[test]
    fn test_identifiers_are_checked() {
        let (_dir, store) = open_store();
        let filter = DeleteFilter::new("store_id; DROP TABLE offers", "x".to_string(), "updated_at", "y".to_string());
        assert!(matches!(
            store.delete_where("offers", &filter),
            Err(DatabaseError::Schema(_))
        ));
        assert!(store.schema_ok().unwrap());
    }
}
