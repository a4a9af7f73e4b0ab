//! Marketplace credential handling.
//!
//! The credential is established out-of-band; this module only reads it
//! from the environment and recognizes expiry in error payloads so the
//! caller can prompt a reauthorize instead of a generic failure.

use crate::config::{MARKETPLACE_ACCESS_TOKEN, MARKETPLACE_API_KEY};

/// Error substrings the marketplace uses when an OAuth grant has lapsed.
const EXPIRY_MARKERS: &[&str] = &[
    "invalid_token",
    "access token expired",
    "token has expired",
    "oauth_problem=token_expired",
    "invalid_grant",
];

#[derive(Debug, Clone)]
pub struct MarketplaceCredential {
    pub api_key: String,
    pub access_token: String,
}

impl MarketplaceCredential {
    /// `None` when no usable credential is configured. A fatal publish
    /// precondition for marketplace sends.
    pub fn from_env() -> Option<Self> {
        let api_key = MARKETPLACE_API_KEY.trim().to_string();
        let access_token = MARKETPLACE_ACCESS_TOKEN.trim().to_string();
        if api_key.is_empty() || access_token.is_empty() {
            return None;
        }
        Some(Self {
            api_key,
            access_token,
        })
    }
}

pub fn is_credential_expiry(message: &str) -> bool {
    let lowered = message.to_lowercase();
    EXPIRY_MARKERS.iter().any(|marker| lowered.contains(marker))
}
