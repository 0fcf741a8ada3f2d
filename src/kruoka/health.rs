use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::client::ApiClient;
use super::types::ApiRequest;

const PROBE_STORE: &str = "N110";
const PROBE_CATEGORY: &str = "juomat";

/// Result of probing two representative endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub ok: bool,
    /// HTTP status of `stores/search`, 0 when the call itself failed
    pub stores_status: u16,
    pub search_offers_status: u16,
    pub errors: Vec<String>,
}

fn probe(client: &ApiClient, name: &str, request: &ApiRequest, errors: &mut Vec<String>) -> u16 {
    match client.send_raw(request) {
        Ok(response) => {
            if response.status != 200 {
                errors.push(format!("{name} returned {}", response.status));
            }
            response.status
        }
        Err(e) => {
            errors.push(format!("{name} failed: {e}"));
            0
        }
    }
}

/// Check that the API is reachable with the current session.
pub fn check(client: &ApiClient) -> HealthReport {
    let mut errors = Vec::new();

    let stores_status = probe(
        client,
        "stores/search",
        &ApiRequest::post("stores/search", json!({"query": "", "offset": 0, "limit": 1})),
        &mut errors,
    );

    let search_offers_status = probe(
        client,
        "search-offers",
        &ApiRequest::get("search-offers/")
            .with_query("storeId", PROBE_STORE)
            .with_query("offset", 0)
            .with_query("categoryPath", PROBE_CATEGORY)
            .with_query("language", "fi"),
        &mut errors,
    );

    let report = HealthReport {
        ok: errors.is_empty(),
        stores_status,
        search_offers_status,
        errors,
    };

    if report.ok {
        info!(stores = report.stores_status, search_offers = report.search_offers_status, "Health check passed");
    } else {
        warn!(errors = ?report.errors, "Health check failed");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kruoka::client::tests::mock_client;
    use crate::kruoka::types::ApiResponse;

    #[test]
    fn test_healthy() {
        let (client, _, _) = mock_client(|_| ApiResponse::new(200, "{}"));
        let report = check(&client);
        assert!(report.ok);
        assert_eq!(report.stores_status, 200);
        assert_eq!(report.search_offers_status, 200);
    }

    #[test]
    fn test_one_endpoint_down() {
        let (client, _, _) = mock_client(|request| {
            if request.endpoint == "search-offers/" {
                ApiResponse::new(502, "bad gateway")
            } else {
                ApiResponse::new(200, "{}")
            }
        });

        let report = check(&client);
        assert!(!report.ok);
        assert_eq!(report.search_offers_status, 502);
        assert_eq!(report.errors, vec!["search-offers returned 502".to_string()]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["searchOffersStatus"], 502);
    }
}
