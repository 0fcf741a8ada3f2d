use tracing::info;

use super::types::StoreInfo;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_KM * 2.0 * a.sqrt().asin()
}

/// Stores within `max_km` of the point. Stores without coordinates are dropped.
pub fn filter_stores_by_distance(stores: Vec<StoreInfo>, lat: f64, lon: f64, max_km: f64) -> Vec<StoreInfo> {
    let total = stores.len();
    let kept: Vec<StoreInfo> = stores
        .into_iter()
        .filter(|store| {
            store
                .coordinates()
                .is_some_and(|(store_lat, store_lon)| haversine(lat, lon, store_lat, store_lon) <= max_km)
        })
        .collect();

    info!(kept = kept.len(), total, max_km, "Distance filter applied");
    kept
}
