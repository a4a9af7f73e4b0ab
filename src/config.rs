#![allow(dead_code)]

use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

pub static GENAI_ROOT: Lazy<String> =
    Lazy::new(|| env::var("GENAI_ROOT").unwrap_or_else(|_| "http://localhost:3400".to_string()));

pub static FULFILLMENT_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("FULFILLMENT_ROOT").unwrap_or_else(|_| "http://localhost:3500".to_string())
});

pub static MARKETPLACE_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("MARKETPLACE_ROOT").unwrap_or_else(|_| "https://openapi.etsy.com/v3".to_string())
});

pub static MARKETPLACE_API_KEY: Lazy<String> =
    Lazy::new(|| env::var("MARKETPLACE_API_KEY").unwrap_or_default());

/// Token granting access to the user's marketplace shop. Absence is a fatal
/// publish precondition, not a startup error.
pub static MARKETPLACE_ACCESS_TOKEN: Lazy<String> =
    Lazy::new(|| env::var("MARKETPLACE_ACCESS_TOKEN").unwrap_or_default());

pub static SELLING_REGION: Lazy<String> =
    Lazy::new(|| env::var("SELLING_REGION").unwrap_or_else(|_| "worldwide".to_string()));

/// Fulfillment store the generated products are created under. Like the
/// access token, absence only fails the publish step.
pub static FULFILLMENT_STORE_ID: Lazy<String> =
    Lazy::new(|| env::var("FULFILLMENT_STORE_ID").unwrap_or_default());

pub static MARKETPLACE_SHOP_NAME: Lazy<String> =
    Lazy::new(|| env::var("MARKETPLACE_SHOP_NAME").unwrap_or_default());

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

/// Largest side, in pixels, requested from the image backend. Print areas
/// come in at catalog DPI (3000px+ sides) and time the backend out.
pub fn generation_max_side() -> u32 {
    env_u32("GENERATION_MAX_SIDE", 2048)
}

/// Absolute ceiling some image backends enforce regardless of our ask.
pub fn generation_hard_cap() -> u32 {
    env_u32("GENERATION_HARD_CAP", 4096)
}

pub fn image_poll_max_attempts() -> u32 {
    env_u32("IMAGE_POLL_MAX_ATTEMPTS", 10)
}

pub fn image_poll_first_delay() -> Duration {
    Duration::from_millis(env_u64("IMAGE_POLL_FIRST_DELAY_MS", 2_000))
}

pub fn image_poll_interval() -> Duration {
    Duration::from_millis(env_u64("IMAGE_POLL_INTERVAL_MS", 5_000))
}

pub fn mockup_poll_interval() -> Duration {
    Duration::from_millis(env_u64("MOCKUP_POLL_INTERVAL_MS", 1_000))
}

pub fn mockup_poll_max_ticks() -> u32 {
    env_u32("MOCKUP_POLL_MAX_TICKS", 120)
}

/// Pause between sequential publish calls so the remote limiter is never
/// hit by a burst.
pub fn publish_call_delay() -> Duration {
    Duration::from_millis(env_u64("PUBLISH_CALL_DELAY_MS", 500))
}
