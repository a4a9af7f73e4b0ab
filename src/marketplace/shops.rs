use crate::config::MARKETPLACE_ROOT;
use crate::fetch::Fetcher;
use crate::marketplace::auth::MarketplaceCredential;
use crate::marketplace::listing::MarketplaceError;
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ShopsResponse {
    #[serde(default)]
    shops: Vec<Shop>,
}

#[derive(Debug, Deserialize)]
struct Shop {
    id: u64,
    name: String,
}

/// Look up the numeric id for a shop by its display name. Matching is
/// case-insensitive; a single shop on the account is used as a fallback
/// when the name does not match anything.
pub(crate) async fn resolve_shop_id(
    http: &Client,
    fetcher: &Fetcher,
    credential: &MarketplaceCredential,
    shop_name: &str,
) -> Result<u64, MarketplaceError> {
    let url = format!("{}/shops", *MARKETPLACE_ROOT);
    let request = http
        .get(url)
        .header("x-api-key", &credential.api_key)
        .bearer_auth(&credential.access_token);
    let response = fetcher.execute("marketplace", request).await?;
    let payload: ShopsResponse = response
        .json()
        .await
        .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))?;

    let wanted = shop_name.trim().to_ascii_lowercase();
    if let Some(shop) = payload
        .shops
        .iter()
        .find(|shop| shop.name.to_ascii_lowercase() == wanted)
    {
        return Ok(shop.id);
    }
    if payload.shops.len() == 1 {
        return Ok(payload.shops[0].id);
    }
    Err(MarketplaceError::UnknownShop(shop_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shops_payload_parses_without_optional_fields() {
        let payload: ShopsResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(payload.shops.is_empty());

        let payload: ShopsResponse =
            serde_json::from_str(r#"{"shops":[{"id":42,"name":"Mugs & More"}]}"#).unwrap();
        assert_eq!(payload.shops[0].id, 42);
        assert_eq!(payload.shops[0].name, "Mugs & More");
    }
}
