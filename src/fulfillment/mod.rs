pub mod mockups;
pub mod pricing;
pub mod store;

pub use mockups::{
    MockupClient, MockupError, MockupFile, MockupTaskService, MockupTaskStatus, VariantMockups,
};
pub use pricing::{
    PlacementGeometry, PricedProduct, PricingCandidate, PricingClient, PricingError,
    PricingRequest, PricingService, ProductPricing,
};
pub use store::{StoreClient, StoreError, StorePublishRequest, StorePublisher};
