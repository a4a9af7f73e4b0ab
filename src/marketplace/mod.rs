pub mod auth;
pub mod listing;
pub mod shops;

pub use auth::MarketplaceCredential;
pub use listing::{ListingClient, MarketplaceError, MarketplaceListingRequest, MarketplaceListings};
