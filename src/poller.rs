//! Shared mockup poller. All cards waiting on fulfillment mockup tasks are
//! drained by a single ticking task instead of one timer per card.

use crate::config::{SELLING_REGION, mockup_poll_interval, mockup_poll_max_ticks};
use crate::fulfillment::{MockupTaskService, PricingCandidate, PricingRequest, PricingService};
use crate::publish::ProductCard;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

/// One card still waiting on a mockup task. Entries without a task id were
/// rate limited at pricing time and get exactly one resubmission.
#[derive(Debug, Clone)]
pub struct PendingMockup {
    pub session_id: String,
    pub product_id: String,
    pub task_id: Option<String>,
    pub retry_payload: Option<PricingCandidate>,
    pub is_retry: bool,
}

/// Card maps are keyed by session id first, then by card product id.
pub type SessionCards = BTreeMap<String, BTreeMap<String, ProductCard>>;

pub struct MockupPoller {
    tasks: Arc<dyn MockupTaskService>,
    pricing: Arc<dyn PricingService>,
    cards: Arc<Mutex<SessionCards>>,
    pending: Arc<Mutex<Vec<PendingMockup>>>,
    store_id: Option<String>,
    active: Arc<AtomicBool>,
    interval: Duration,
    max_ticks: u32,
}

impl MockupPoller {
    pub fn new(
        tasks: Arc<dyn MockupTaskService>,
        pricing: Arc<dyn PricingService>,
        cards: Arc<Mutex<SessionCards>>,
        pending: Arc<Mutex<Vec<PendingMockup>>>,
        store_id: Option<String>,
        active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tasks,
            pricing,
            cards,
            pending,
            store_id,
            active,
            interval: mockup_poll_interval(),
            max_ticks: mockup_poll_max_ticks(),
        }
    }

    #[cfg(test)]
    fn with_timing(mut self, interval: Duration, max_ticks: u32) -> Self {
        self.interval = interval;
        self.max_ticks = max_ticks;
        self
    }

    /// Tick until every pending entry resolves or the tick ceiling is hit.
    /// The active flag is released on exit so a later batch can restart us.
    pub async fn run(self) {
        for _ in 0..self.max_ticks {
            sleep(self.interval).await;
            self.tick().await;
            if self.pending.lock().await.is_empty() {
                self.active.store(false, Ordering::SeqCst);
                return;
            }
        }
        self.expire_remaining().await;
        self.active.store(false, Ordering::SeqCst);
    }

    async fn tick(&self) {
        let snapshot: Vec<PendingMockup> = self.pending.lock().await.clone();
        // Walk backwards so finished entries can be removed by index.
        for index in (0..snapshot.len()).rev() {
            let entry = &snapshot[index];
            match &entry.task_id {
                Some(task_id) => self.poll_task(index, entry, task_id).await,
                None => self.resubmit(index, entry).await,
            }
        }
    }

    async fn poll_task(&self, index: usize, entry: &PendingMockup, task_id: &str) {
        let product_id = entry.product_id.as_str();
        match self.tasks.task_status(task_id).await {
            Ok(status) if status.is_completed() => {
                let urls = status.all_urls();
                info!(
                    target: "podforge.poller",
                    product_id, mockups = urls.len(), "mockup task completed"
                );
                self.complete_card(entry, urls).await;
                self.remove_entry(index).await;
            }
            Ok(status) if status.is_failed() => {
                warn!(target: "podforge.poller", product_id, status = %status.status, "mockup task failed");
                // Status casing varies upstream; the card error is lowercased.
                self.fail_card(
                    entry,
                    format!("mockup task {}", status.status.to_ascii_lowercase()),
                )
                .await;
                self.remove_entry(index).await;
            }
            Ok(_) => {}
            // Transient status errors: leave the entry for the next tick.
            Err(err) => {
                warn!(target: "podforge.poller", product_id, error = %err, "mockup status check failed");
            }
        }
    }

    /// A pricing response that was rate limited carries no task id. Resubmit
    /// that one candidate once; a second rate limit abandons the card.
    async fn resubmit(&self, index: usize, entry: &PendingMockup) {
        if entry.is_retry {
            self.fail_card(entry, "mockup generation rate limited".into())
                .await;
            self.remove_entry(index).await;
            return;
        }
        let Some(candidate) = entry.retry_payload.clone() else {
            self.fail_card(entry, "no mockup task was created".into())
                .await;
            self.remove_entry(index).await;
            return;
        };
        let request = PricingRequest {
            products: vec![candidate],
            selling_region: SELLING_REGION.clone(),
            store_id: self.store_id.clone(),
        };
        match self.pricing.submit_batch(&request).await {
            Ok(products) => {
                let priced = products.into_iter().find(|p| p.product_id == entry.product_id);
                let mut pending = self.pending.lock().await;
                if let Some(slot) = pending
                    .iter_mut()
                    .find(|p| p.session_id == entry.session_id && p.product_id == entry.product_id)
                {
                    slot.is_retry = true;
                    slot.task_id = priced.as_ref().and_then(|p| p.mockup_task_id.clone());
                }
                drop(pending);
                if let Some(priced) = priced {
                    if !priced.mockups.is_empty() {
                        self.complete_card(entry, priced.mockups).await;
                        self.remove_matching(entry).await;
                    }
                }
            }
            Err(err) => {
                warn!(target: "podforge.poller", product_id = %entry.product_id, error = %err, "mockup resubmission failed");
                let mut pending = self.pending.lock().await;
                if let Some(slot) = pending
                    .iter_mut()
                    .find(|p| p.session_id == entry.session_id && p.product_id == entry.product_id)
                {
                    slot.is_retry = true;
                }
            }
        }
    }

    async fn expire_remaining(&self) {
        let mut pending = self.pending.lock().await;
        let expired: Vec<PendingMockup> = pending.drain(..).collect();
        drop(pending);
        warn!(target: "podforge.poller", count = expired.len(), "mockup polling hit tick ceiling");
        for entry in expired {
            self.fail_card(&entry, "mockup polling timed out".into())
                .await;
        }
    }

    async fn complete_card(&self, entry: &PendingMockup, mockups: Vec<String>) {
        let mut cards = self.cards.lock().await;
        if let Some(card) = cards
            .get_mut(&entry.session_id)
            .and_then(|session| session.get_mut(&entry.product_id))
        {
            card.mockups = mockups;
            card.mockup_loading = false;
            card.actions_enabled = true;
            card.error = None;
        }
    }

    async fn fail_card(&self, entry: &PendingMockup, message: String) {
        let mut cards = self.cards.lock().await;
        if let Some(card) = cards
            .get_mut(&entry.session_id)
            .and_then(|session| session.get_mut(&entry.product_id))
        {
            card.mockup_loading = false;
            card.error = Some(message);
        }
    }

    async fn remove_entry(&self, index: usize) {
        let mut pending = self.pending.lock().await;
        if index < pending.len() {
            pending.remove(index);
        }
    }

    async fn remove_matching(&self, target: &PendingMockup) {
        self.pending.lock().await.retain(|entry| {
            entry.session_id != target.session_id || entry.product_id != target.product_id
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fulfillment::{
        MockupError, MockupTaskStatus, PricedProduct, PricingError, VariantMockups,
    };
    use crate::publish::ProductCard;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU64;

    struct ScriptedTasks {
        calls: AtomicU64,
        script: Mutex<VecDeque<Result<MockupTaskStatus, MockupError>>>,
    }

    impl ScriptedTasks {
        fn new(script: Vec<Result<MockupTaskStatus, MockupError>>) -> Self {
            Self {
                calls: AtomicU64::new(0),
                script: Mutex::new(script.into()),
            }
        }
    }

    #[async_trait]
    impl MockupTaskService for ScriptedTasks {
        async fn task_status(&self, _task_id: &str) -> Result<MockupTaskStatus, MockupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(pending_status()))
        }
    }

    struct ScriptedPricing {
        calls: AtomicU64,
        script: Mutex<VecDeque<Result<Vec<PricedProduct>, PricingError>>>,
    }

    impl ScriptedPricing {
        fn new(script: Vec<Result<Vec<PricedProduct>, PricingError>>) -> Self {
            Self {
                calls: AtomicU64::new(0),
                script: Mutex::new(script.into()),
            }
        }
    }

    #[async_trait]
    impl PricingService for ScriptedPricing {
        async fn submit_batch(
            &self,
            _request: &PricingRequest,
        ) -> Result<Vec<PricedProduct>, PricingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(vec![]))
        }
    }

    fn pending_status() -> MockupTaskStatus {
        MockupTaskStatus {
            status: "pending".into(),
            catalog_variant_mockups: vec![],
        }
    }

    fn completed_status(urls: &[&str]) -> MockupTaskStatus {
        MockupTaskStatus {
            status: "completed".into(),
            catalog_variant_mockups: vec![VariantMockups {
                mockups: urls
                    .iter()
                    .map(|url| crate::fulfillment::MockupFile {
                        mockup_url: url.to_string(),
                        placement: None,
                        style_id: None,
                    })
                    .collect(),
            }],
        }
    }

    fn card(product_id: &str) -> ProductCard {
        let mut card = ProductCard::placeholder(product_id);
        card.mockup_loading = true;
        card
    }

    fn session_cards(product_id: &str) -> Arc<Mutex<SessionCards>> {
        Arc::new(Mutex::new(BTreeMap::from([(
            "s1".to_string(),
            BTreeMap::from([(product_id.to_string(), card(product_id))]),
        )])))
    }

    fn pending_entry(product_id: &str, task_id: Option<&str>) -> PendingMockup {
        PendingMockup {
            session_id: "s1".into(),
            product_id: product_id.into(),
            task_id: task_id.map(str::to_string),
            retry_payload: None,
            is_retry: false,
        }
    }

    fn poller(
        tasks: Arc<dyn MockupTaskService>,
        pricing: Arc<dyn PricingService>,
        cards: Arc<Mutex<SessionCards>>,
        pending: Arc<Mutex<Vec<PendingMockup>>>,
        max_ticks: u32,
    ) -> MockupPoller {
        MockupPoller::new(
            tasks,
            pricing,
            cards,
            pending,
            None,
            Arc::new(AtomicBool::new(true)),
        )
        .with_timing(Duration::from_millis(10), max_ticks)
    }

    #[tokio::test(start_paused = true)]
    async fn completed_task_fills_card_and_stops() {
        let tasks = Arc::new(ScriptedTasks::new(vec![
            Ok(pending_status()),
            Ok(completed_status(&["https://cdn/m1.png", "https://cdn/m2.png"])),
        ]));
        let pricing = Arc::new(ScriptedPricing::new(vec![]));
        let cards = session_cards("mug-2_wrap");
        let pending = Arc::new(Mutex::new(vec![pending_entry("mug-2_wrap", Some("task-1"))]));

        poller(tasks.clone(), pricing, cards.clone(), pending.clone(), 50)
            .run()
            .await;

        // The loop ends on the tick that drained the list, not at the ceiling.
        assert_eq!(tasks.calls.load(Ordering::SeqCst), 2);
        assert!(pending.lock().await.is_empty());
        let cards = cards.lock().await;
        let card = &cards["s1"]["mug-2_wrap"];
        assert!(!card.mockup_loading);
        assert!(card.actions_enabled);
        assert_eq!(card.mockups.len(), 2);
        assert!(card.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_marks_card_and_removes_entry() {
        let tasks = Arc::new(ScriptedTasks::new(vec![Ok(MockupTaskStatus {
            status: "Failed".into(),
            catalog_variant_mockups: vec![],
        })]));
        let pricing = Arc::new(ScriptedPricing::new(vec![]));
        let cards = session_cards("tee-1_front");
        let pending = Arc::new(Mutex::new(vec![pending_entry("tee-1_front", Some("task-9"))]));

        poller(tasks.clone(), pricing, cards.clone(), pending.clone(), 50)
            .run()
            .await;

        assert_eq!(tasks.calls.load(Ordering::SeqCst), 1);
        assert!(pending.lock().await.is_empty());
        let cards = cards.lock().await;
        assert_eq!(
            cards["s1"]["tee-1_front"].error.as_deref(),
            Some("mockup task failed")
        );
        assert!(!cards["s1"]["tee-1_front"].actions_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_status_errors_are_tolerated() {
        let tasks = Arc::new(ScriptedTasks::new(vec![
            Err(MockupError::InvalidResponse("boom".into())),
            Ok(completed_status(&["https://cdn/m.png"])),
        ]));
        let pricing = Arc::new(ScriptedPricing::new(vec![]));
        let cards = session_cards("mug-2_wrap");
        let pending = Arc::new(Mutex::new(vec![pending_entry("mug-2_wrap", Some("task-1"))]));

        poller(tasks.clone(), pricing, cards.clone(), pending.clone(), 50)
            .run()
            .await;

        assert_eq!(tasks.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cards.lock().await["s1"]["mug-2_wrap"].mockups.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_ceiling_expires_remaining_cards() {
        let tasks = Arc::new(ScriptedTasks::new(vec![]));
        let pricing = Arc::new(ScriptedPricing::new(vec![]));
        let cards = session_cards("mug-2_wrap");
        let pending = Arc::new(Mutex::new(vec![pending_entry("mug-2_wrap", Some("task-1"))]));

        poller(tasks.clone(), pricing, cards.clone(), pending.clone(), 4)
            .run()
            .await;

        assert_eq!(tasks.calls.load(Ordering::SeqCst), 4);
        assert!(pending.lock().await.is_empty());
        let cards = cards.lock().await;
        assert_eq!(
            cards["s1"]["mug-2_wrap"].error.as_deref(),
            Some("mockup polling timed out")
        );
        assert!(!cards["s1"]["mug-2_wrap"].mockup_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_entry_is_resubmitted_exactly_once() {
        let tasks = Arc::new(ScriptedTasks::new(vec![]));
        // First resubmission is rate limited again, so the card is abandoned
        // on the following tick without a second pricing call.
        let pricing = Arc::new(ScriptedPricing::new(vec![Ok(vec![PricedProduct {
            product_id: "tote-3_front".into(),
            catalog_variant_id: None,
            pricing: None,
            mockups: vec![],
            mockup_pending: true,
            mockup_task_id: None,
            rate_limited: true,
        }])]));
        let cards = session_cards("tote-3_front");
        let pending = Arc::new(Mutex::new(vec![PendingMockup {
            session_id: "s1".into(),
            product_id: "tote-3_front".into(),
            task_id: None,
            retry_payload: Some(PricingCandidate {
                product_id: "tote-3_front".into(),
                catalog_product_id: "tote-3".into(),
                catalog_variant_id: None,
                title: "Tote".into(),
                description: "A tote".into(),
                image_url: "https://cdn/art.png".into(),
                placement: crate::fulfillment::PlacementGeometry {
                    position: "front".into(),
                    width: 1800,
                    height: 2400,
                },
                technique: "dtg".into(),
                tags: vec![],
                materials: vec![],
            }),
            is_retry: false,
        }]));

        poller(tasks, pricing.clone(), cards.clone(), pending.clone(), 50)
            .run()
            .await;

        assert_eq!(pricing.calls.load(Ordering::SeqCst), 1);
        assert!(pending.lock().await.is_empty());
        assert_eq!(
            cards.lock().await["s1"]["tote-3_front"].error.as_deref(),
            Some("mockup generation rate limited")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resubmission_adopting_task_id_can_still_complete() {
        let tasks = Arc::new(ScriptedTasks::new(vec![Ok(completed_status(&[
            "https://cdn/m.png",
        ]))]));
        let pricing = Arc::new(ScriptedPricing::new(vec![Ok(vec![PricedProduct {
            product_id: "tee-1_back".into(),
            catalog_variant_id: None,
            pricing: None,
            mockups: vec![],
            mockup_pending: true,
            mockup_task_id: Some("task-7".into()),
            rate_limited: false,
        }])]));
        let cards = session_cards("tee-1_back");
        let pending = Arc::new(Mutex::new(vec![PendingMockup {
            session_id: "s1".into(),
            product_id: "tee-1_back".into(),
            task_id: None,
            retry_payload: Some(PricingCandidate {
                product_id: "tee-1_back".into(),
                catalog_product_id: "tee-1".into(),
                catalog_variant_id: None,
                title: "Tee".into(),
                description: "A tee".into(),
                image_url: "https://cdn/art.png".into(),
                placement: crate::fulfillment::PlacementGeometry {
                    position: "back".into(),
                    width: 1200,
                    height: 1600,
                },
                technique: "dtg".into(),
                tags: vec![],
                materials: vec![],
            }),
            is_retry: false,
        }]));

        poller(tasks.clone(), pricing, cards.clone(), pending.clone(), 50)
            .run()
            .await;

        assert_eq!(tasks.calls.load(Ordering::SeqCst), 1);
        assert!(pending.lock().await.is_empty());
        assert_eq!(cards.lock().await["s1"]["tee-1_back"].mockups.len(), 1);
    }
}
