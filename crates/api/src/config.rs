//! Runtime configuration read from `FREIGHTLINE_*` environment variables.

use serde::{Deserialize, Serialize};

pub const ENV_BACKSTOP: &str = "FREIGHTLINE_BACKSTOP";
pub const ENV_MAX_DISTANCE: &str = "FREIGHTLINE_MAX_DISTANCE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    /// Refetch freight when stages reference names missing from the cache.
    pub backstop: bool,
    /// Evict matrix entries whose distance grows beyond this. `None` keeps all.
    pub max_distance: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self { Self { backstop: true, max_distance: None } }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let backstop = lookup(ENV_BACKSTOP).and_then(|s| parse_flag(&s)).unwrap_or(defaults.backstop);
        let max_distance = lookup(ENV_MAX_DISTANCE).and_then(|s| s.trim().parse::<u32>().ok());
        Self { backstop, max_distance }
    }
}
