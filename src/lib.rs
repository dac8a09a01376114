pub mod amounts;
pub mod btc;
pub mod chain;
pub mod config;
pub mod error;
pub mod intermediary;
pub mod lightning;
pub mod lock;
pub mod logging;
pub mod plugins;
pub mod price;
pub mod store;
pub mod swap;
pub mod vault;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
