//! Pricing and publish orchestration. Pricing turns every generated image
//! into a product card; publishing pushes each card to the fulfillment store
//! and the marketplace, isolating per-card failures so one bad card never
//! sinks the batch.

use crate::config::{
    FULFILLMENT_STORE_ID, MARKETPLACE_SHOP_NAME, SELLING_REGION, publish_call_delay,
};
use crate::fetch::Fetcher;
use crate::fulfillment::{
    MockupClient, MockupTaskService, PlacementGeometry, PricingCandidate, PricingClient,
    PricingRequest, PricingService, StoreClient, StorePublishRequest, StorePublisher,
    store::PlacementFile,
};
use crate::marketplace::{
    ListingClient, MarketplaceCredential, MarketplaceError, MarketplaceListingRequest,
    MarketplaceListings,
};
use crate::models::{CreatedListing, placement_key};
use crate::pipeline::PipelineError;
use crate::poller::{MockupPoller, PendingMockup, SessionCards};
use crate::session::SessionState;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// One priced product awaiting publication. A card carries everything a
/// publish needs, so the payload attached by [`CardView`] can be echoed back
/// and published even after the in-memory card map was rebuilt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductCard {
    pub product_id: String,
    pub catalog_product_id: String,
    pub catalog_variant_id: Option<u64>,
    pub title: String,
    pub description: String,
    pub image_url: String,
    pub placement: PlacementGeometry,
    pub technique: String,
    pub tags: Vec<String>,
    pub materials: Vec<String>,
    pub retail_price: Option<f64>,
    pub currency: Option<String>,
    pub mockups: Vec<String>,
    pub mockup_loading: bool,
    pub actions_enabled: bool,
    pub error: Option<String>,
}

impl ProductCard {
    fn from_candidate(candidate: &PricingCandidate) -> Self {
        Self {
            product_id: candidate.product_id.clone(),
            catalog_product_id: candidate.catalog_product_id.clone(),
            catalog_variant_id: candidate.catalog_variant_id,
            title: candidate.title.clone(),
            description: candidate.description.clone(),
            image_url: candidate.image_url.clone(),
            placement: candidate.placement.clone(),
            technique: candidate.technique.clone(),
            tags: candidate.tags.clone(),
            materials: candidate.materials.clone(),
            retail_price: None,
            currency: None,
            mockups: Vec::new(),
            mockup_loading: false,
            actions_enabled: false,
            error: None,
        }
    }

    pub fn encode_payload(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        BASE64.encode(json)
    }

    pub fn decode_payload(payload: &str) -> Option<Self> {
        let bytes = BASE64.decode(payload.trim()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    #[cfg(test)]
    pub fn placeholder(product_id: &str) -> Self {
        Self {
            product_id: product_id.to_string(),
            catalog_product_id: product_id
                .rsplit_once('_')
                .map(|(head, _)| head.to_string())
                .unwrap_or_else(|| product_id.to_string()),
            catalog_variant_id: None,
            title: "Test product".into(),
            description: "Test description".into(),
            image_url: "https://cdn/art.png".into(),
            placement: PlacementGeometry {
                position: "front".into(),
                width: 1800,
                height: 2400,
            },
            technique: "dtg".into(),
            tags: vec![],
            materials: vec![],
            retail_price: Some(19.99),
            currency: Some("USD".into()),
            mockups: vec![],
            mockup_loading: false,
            actions_enabled: false,
            error: None,
        }
    }
}

/// API view of a card: the card fields plus a base64 `payload` holding the
/// card itself, for the single-card publish endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CardView {
    #[serde(flatten)]
    pub card: ProductCard,
    pub payload: String,
}

impl From<ProductCard> for CardView {
    fn from(card: ProductCard) -> Self {
        let payload = card.encode_payload();
        Self { card, payload }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CardFailure {
    pub product_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishSummary {
    pub attempted: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Set when every card published; clients offer a reset back to the
    /// first step.
    pub reset_offered: bool,
    /// Set when a failure looked like an expired marketplace token; clients
    /// should prompt a reauthorize instead of a plain retry.
    pub reauthorize: bool,
    pub listings: Vec<CreatedListing>,
    pub failures: Vec<CardFailure>,
}

pub struct Publisher {
    pricing: Arc<dyn PricingService>,
    tasks: Arc<dyn MockupTaskService>,
    store: Arc<dyn StorePublisher>,
    marketplace: Option<Arc<dyn MarketplaceListings>>,
    cards: Arc<Mutex<SessionCards>>,
    pending: Arc<Mutex<Vec<PendingMockup>>>,
    poller_active: Arc<AtomicBool>,
    store_id: Option<String>,
    shop_name: String,
    call_delay: Duration,
}

impl Publisher {
    pub fn from_env(fetcher: Fetcher) -> Self {
        let marketplace = MarketplaceCredential::from_env().map(|credential| {
            Arc::new(ListingClient::new(fetcher.clone(), credential)) as Arc<dyn MarketplaceListings>
        });
        let store_id = Some(FULFILLMENT_STORE_ID.clone()).filter(|id| !id.trim().is_empty());
        Self::new(
            Arc::new(PricingClient::new(fetcher.clone())),
            Arc::new(MockupClient::new(fetcher.clone())),
            Arc::new(StoreClient::new(fetcher)),
            marketplace,
            store_id,
            MARKETPLACE_SHOP_NAME.clone(),
        )
    }

    pub fn new(
        pricing: Arc<dyn PricingService>,
        tasks: Arc<dyn MockupTaskService>,
        store: Arc<dyn StorePublisher>,
        marketplace: Option<Arc<dyn MarketplaceListings>>,
        store_id: Option<String>,
        shop_name: String,
    ) -> Self {
        Self {
            pricing,
            tasks,
            store,
            marketplace,
            cards: Arc::new(Mutex::new(BTreeMap::new())),
            pending: Arc::new(Mutex::new(Vec::new())),
            poller_active: Arc::new(AtomicBool::new(false)),
            store_id,
            shop_name,
            call_delay: publish_call_delay(),
        }
    }

    #[cfg(test)]
    fn without_call_delay(mut self) -> Self {
        self.call_delay = Duration::ZERO;
        self
    }

    pub async fn cards(&self, session_id: &str) -> Vec<CardView> {
        self.cards
            .lock()
            .await
            .get(session_id)
            .map(|cards| cards.values().cloned().map(CardView::from).collect())
            .unwrap_or_default()
    }

    /// Price every generated image in one batch call. Cards whose mockups
    /// are still rendering are handed to the shared poller.
    pub async fn price_batch(
        &self,
        session_id: &str,
        state: &SessionState,
    ) -> Result<Vec<ProductCard>, PipelineError> {
        let candidates = candidates_from(state);
        if candidates.is_empty() {
            return Err(PipelineError::invalid_input(
                "pricing",
                "no generated images to price",
            ));
        }
        let request = PricingRequest {
            products: candidates.clone(),
            selling_region: SELLING_REGION.clone(),
            store_id: self.store_id.clone(),
        };
        info!(target: "podforge.publish", products = candidates.len(), "submitting pricing batch");
        let priced = self
            .pricing
            .submit_batch(&request)
            .await
            .map_err(|err| PipelineError::internal("pricing", err.to_string()))?;

        let mut all_cards = self.cards.lock().await;
        let cards = all_cards.entry(session_id.to_string()).or_default();
        let mut pending = self.pending.lock().await;
        for candidate in &candidates {
            let card = cards
                .entry(candidate.product_id.clone())
                .or_insert_with(|| ProductCard::from_candidate(candidate));
            let Some(product) = priced.iter().find(|p| p.product_id == candidate.product_id)
            else {
                card.error = Some("missing from pricing response".into());
                continue;
            };
            card.error = None;
            if product.catalog_variant_id.is_some() {
                card.catalog_variant_id = product.catalog_variant_id;
            }
            if let Some(pricing) = &product.pricing {
                card.retail_price = Some(pricing.retail_price);
                card.currency = pricing.currency.clone();
            }
            if !product.mockups.is_empty() {
                card.mockups = product.mockups.clone();
                card.mockup_loading = false;
                card.actions_enabled = true;
            } else if product.mockup_pending || product.rate_limited {
                card.mockup_loading = true;
                pending.retain(|entry| {
                    entry.session_id != session_id || entry.product_id != candidate.product_id
                });
                pending.push(PendingMockup {
                    session_id: session_id.to_string(),
                    product_id: candidate.product_id.clone(),
                    task_id: product.mockup_task_id.clone(),
                    retry_payload: Some(candidate.clone()),
                    is_retry: false,
                });
            } else {
                // Priced but no mockups and nothing pending; usable as-is.
                card.actions_enabled = true;
            }
        }
        let has_pending = !pending.is_empty();
        let result: Vec<ProductCard> = cards.values().cloned().collect();
        drop(pending);
        drop(all_cards);

        if has_pending {
            self.ensure_poller();
        }
        Ok(result)
    }

    fn ensure_poller(&self) {
        if self
            .poller_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let poller = MockupPoller::new(
            self.tasks.clone(),
            self.pricing.clone(),
            self.cards.clone(),
            self.pending.clone(),
            self.store_id.clone(),
            self.poller_active.clone(),
        );
        tokio::spawn(poller.run());
    }

    fn publish_targets(
        &self,
    ) -> Result<(String, Arc<dyn MarketplaceListings>), PipelineError> {
        let store_id = self
            .store_id
            .clone()
            .ok_or_else(|| PipelineError::fatal("publish", "fulfillment store id not configured"))?;
        let marketplace = self
            .marketplace
            .clone()
            .ok_or_else(|| PipelineError::fatal("publish", "marketplace credential missing"))?;
        Ok((store_id, marketplace))
    }

    async fn resolve_shop(
        &self,
        marketplace: &dyn MarketplaceListings,
    ) -> Result<u64, PipelineError> {
        marketplace
            .resolve_shop_id(&self.shop_name)
            .await
            .map_err(|err| match err {
                MarketplaceError::CredentialExpired(message) => {
                    PipelineError::credential_expired("publish", message)
                }
                other => PipelineError::internal("publish", other.to_string()),
            })
    }

    /// Publish every card in the session. Fatal preconditions fail the whole
    /// call; after that, each card succeeds or fails on its own and every
    /// card is attempted no matter how many before it failed.
    pub async fn publish_all(
        &self,
        session_id: &str,
        state: &mut SessionState,
    ) -> Result<PublishSummary, PipelineError> {
        let (store_id, marketplace) = self.publish_targets()?;

        let cards: Vec<ProductCard> = self
            .cards
            .lock()
            .await
            .get(session_id)
            .map(|cards| cards.values().cloned().collect())
            .unwrap_or_default();
        if cards.is_empty() {
            return Err(PipelineError::invalid_input("publish", "no cards to publish"));
        }

        let shop_id = self.resolve_shop(&*marketplace).await?;

        let mut summary = PublishSummary {
            attempted: cards.len(),
            ..PublishSummary::default()
        };
        for (i, card) in cards.iter().enumerate() {
            if i > 0 {
                sleep(self.call_delay).await;
            }
            match self.publish_card(card, &store_id, shop_id, &*marketplace).await {
                Ok(listing) => {
                    info!(
                        target: "podforge.publish",
                        product_id = %card.product_id,
                        listing_id = %listing.listing_id,
                        "card published"
                    );
                    summary.success_count += 1;
                    state.created_listings.push(listing.clone());
                    summary.listings.push(listing);
                }
                Err(err) => {
                    error!(target: "podforge.publish", product_id = %card.product_id, error = %err, "card publish failed");
                    if matches!(err, MarketplaceError::CredentialExpired(_)) {
                        summary.reauthorize = true;
                    }
                    summary.failure_count += 1;
                    summary.failures.push(CardFailure {
                        product_id: card.product_id.clone(),
                        error: err.to_string(),
                    });
                    let mut cards = self.cards.lock().await;
                    if let Some(slot) = cards
                        .get_mut(session_id)
                        .and_then(|session| session.get_mut(&card.product_id))
                    {
                        slot.error = Some(err.to_string());
                    }
                }
            }
        }
        if summary.failure_count > 0 {
            warn!(
                target: "podforge.publish",
                failed = summary.failure_count,
                succeeded = summary.success_count,
                "publish finished with failures"
            );
        } else {
            summary.reset_offered = true;
        }
        Ok(summary)
    }

    /// Publish one card from the payload a client echoed back. The card is
    /// self-contained, so a retry works even after the card map was rebuilt.
    pub async fn publish_one(
        &self,
        session_id: &str,
        state: &mut SessionState,
        payload: &str,
    ) -> Result<CreatedListing, PipelineError> {
        let card = ProductCard::decode_payload(payload)
            .ok_or_else(|| PipelineError::invalid_input("publish", "card payload did not decode"))?;
        let (store_id, marketplace) = self.publish_targets()?;
        let shop_id = self.resolve_shop(&*marketplace).await?;

        match self.publish_card(&card, &store_id, shop_id, &*marketplace).await {
            Ok(listing) => {
                info!(
                    target: "podforge.publish",
                    product_id = %card.product_id,
                    listing_id = %listing.listing_id,
                    "card published"
                );
                state.created_listings.push(listing.clone());
                let mut cards = self.cards.lock().await;
                if let Some(slot) = cards
                    .get_mut(session_id)
                    .and_then(|session| session.get_mut(&card.product_id))
                {
                    slot.error = None;
                }
                Ok(listing)
            }
            Err(err) => {
                error!(target: "podforge.publish", product_id = %card.product_id, error = %err, "card publish failed");
                let mut cards = self.cards.lock().await;
                if let Some(slot) = cards
                    .get_mut(session_id)
                    .and_then(|session| session.get_mut(&card.product_id))
                {
                    slot.error = Some(err.to_string());
                }
                drop(cards);
                Err(match err {
                    MarketplaceError::CredentialExpired(message) => {
                        PipelineError::credential_expired("publish", message)
                    }
                    other => PipelineError::internal("publish", other.to_string()),
                })
            }
        }
    }

    async fn publish_card(
        &self,
        card: &ProductCard,
        store_id: &str,
        shop_id: u64,
        marketplace: &dyn MarketplaceListings,
    ) -> Result<CreatedListing, MarketplaceError> {
        let retail_price = card.retail_price.unwrap_or(19.99);
        let store_request = StorePublishRequest {
            title: card.title.clone(),
            description: card.description.clone(),
            catalog_product_id: card.catalog_product_id.clone(),
            catalog_variant_id: card.catalog_variant_id,
            placement_files: vec![PlacementFile {
                placement: card.placement.position.clone(),
                image_url: card.image_url.clone(),
                width: card.placement.width,
                height: card.placement.height,
            }],
            technique: card.technique.clone(),
            store_id: store_id.to_string(),
            retail_price,
        };
        let store_product_id = self
            .store
            .publish(&store_request)
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(format!("store publish: {err}")))?;

        let mut images = card.mockups.clone();
        if images.is_empty() {
            images.push(card.image_url.clone());
        }
        let listing_request = MarketplaceListingRequest {
            title: card.title.clone(),
            description: card.description.clone(),
            price: retail_price,
            images,
            shop_id,
            tags: card.tags.clone(),
            materials: card.materials.clone(),
            shipping_profile: None,
        };
        let mut listing = marketplace
            .create_listing(&card.product_id, &listing_request)
            .await?;
        listing.product_id = store_product_id;
        Ok(listing)
    }
}

/// Build one pricing candidate per generated image, preferring the catalog's
/// exact print-area geometry over the user's design selection.
fn candidates_from(state: &SessionState) -> Vec<PricingCandidate> {
    let mut candidates = Vec::new();
    for (job_id, image_url) in &state.generated_images {
        let Some((product_id, position)) = job_id.rsplit_once('_') else {
            continue;
        };
        let catalog = state.catalog_products.get(product_id);
        let selection = state
            .product_designs
            .get(product_id)
            .and_then(|placements| placements.iter().find(|p| p.position == position));
        let placement = catalog
            .and_then(|product| product.print_area(position))
            .map(|area| PlacementGeometry {
                position: area.position.clone(),
                width: area.width,
                height: area.height,
            })
            .or_else(|| {
                selection.map(|s| PlacementGeometry {
                    position: s.position.clone(),
                    width: s.width,
                    height: s.height,
                })
            });
        let Some(placement) = placement else {
            continue;
        };
        let technique = selection
            .map(|s| s.resolved_technique(catalog))
            .or_else(|| catalog.and_then(|c| c.default_technique.clone()))
            .unwrap_or_else(|| crate::models::DEFAULT_TECHNIQUE.to_string());
        let content = state.product_content.get(product_id);
        let fallback_title = catalog
            .map(|c| c.name.clone())
            .unwrap_or_else(|| product_id.to_string());
        candidates.push(PricingCandidate {
            product_id: placement_key(product_id, position),
            catalog_product_id: product_id.to_string(),
            catalog_variant_id: catalog.and_then(|c| c.first_variant()).map(|v| v.id),
            title: content.map(|c| c.title.clone()).unwrap_or(fallback_title),
            description: content.map(|c| c.description.clone()).unwrap_or_default(),
            image_url: image_url.clone(),
            placement,
            technique,
            tags: content.map(|c| c.tags.clone()).unwrap_or_default(),
            materials: content.map(|c| c.materials.clone()).unwrap_or_default(),
        });
    }
    candidates
}
