//! Compute-cache budget presets for the model engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::engine::ModelEngine;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Named compute-cache budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePreset {
    /// 512 MiB.
    LowMemory,
    /// 2 GiB.
    #[default]
    Balanced,
    /// 8 GiB.
    HighMemory,
}

impl CachePreset {
    /// The byte budget this preset stands for.
    #[must_use]
    pub const fn limit_bytes(self) -> u64 {
        match self {
            Self::LowMemory => 512 * MIB,
            Self::Balanced => 2 * GIB,
            Self::HighMemory => 8 * GIB,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LowMemory => "low_memory",
            Self::Balanced => "balanced",
            Self::HighMemory => "high_memory",
        }
    }
}

impl fmt::Display for CachePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CachePreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "low_memory" | "low" => Ok(Self::LowMemory),
            "balanced" => Ok(Self::Balanced),
            "high_memory" | "high" => Ok(Self::HighMemory),
            other => Err(format!("Unknown cache preset: {other}")),
        }
    }
}

/// Applies a compute-cache budget to an engine on load and clears it on unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceCachePolicy {
    preset: CachePreset,
    limit_override: Option<u64>,
}

impl ResourceCachePolicy {
    #[must_use]
    pub const fn new(preset: CachePreset) -> Self {
        Self { preset, limit_override: None }
    }

    /// Use an explicit byte budget instead of the preset's, when given.
    #[must_use]
    pub const fn with_limit(mut self, limit: Option<u64>) -> Self {
        if limit.is_some() {
            self.limit_override = limit;
        }
        self
    }

    #[must_use]
    pub const fn preset(&self) -> CachePreset {
        self.preset
    }

    /// The byte budget handed to the engine.
    #[must_use]
    pub const fn limit_bytes(&self) -> u64 {
        match self.limit_override {
            Some(limit) => limit,
            None => self.preset.limit_bytes(),
        }
    }

    /// Set the engine's cache limit.
    pub fn apply(&self, engine: &dyn ModelEngine) {
        let limit_bytes = self.limit_bytes();
        engine.set_cache_limit(limit_bytes);
        info!(
            engine_id = engine.engine_id(),
            preset = %self.preset,
            limit_bytes,
            "Applied compute cache limit"
        );
    }

    /// Drop the engine's cached intermediate buffers.
    pub fn clear(&self, engine: &dyn ModelEngine) {
        engine.clear_cache();
        info!(engine_id = engine.engine_id(), "Cleared compute cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockEngine;

    #[test]
    fn test_preset_limits() {
        assert_eq!(CachePreset::LowMemory.limit_bytes(), 512 * 1024 * 1024);
        assert_eq!(CachePreset::Balanced.limit_bytes(), 2 * 1024 * 1024 * 1024);
        assert_eq!(CachePreset::HighMemory.limit_bytes(), 8 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_preset_from_str() {
        assert_eq!("low-memory".parse::<CachePreset>(), Ok(CachePreset::LowMemory));
        assert_eq!("Balanced".parse::<CachePreset>(), Ok(CachePreset::Balanced));
        assert_eq!("high".parse::<CachePreset>(), Ok(CachePreset::HighMemory));
        assert!("huge".parse::<CachePreset>().is_err());
    }

    #[test]
    fn test_override_wins_over_preset() {
        let policy = ResourceCachePolicy::new(CachePreset::LowMemory).with_limit(Some(1234));
        assert_eq!(policy.limit_bytes(), 1234);

        let policy = policy.with_limit(None);
        assert_eq!(policy.limit_bytes(), 1234);

        let policy = ResourceCachePolicy::new(CachePreset::HighMemory).with_limit(None);
        assert_eq!(policy.limit_bytes(), CachePreset::HighMemory.limit_bytes());
    }

    #[test]
    fn test_apply_and_clear_reach_engine() {
        let engine = MockEngine::new("mock-image");
        let policy = ResourceCachePolicy::new(CachePreset::Balanced);

        policy.apply(&engine);
        assert_eq!(engine.cache_limit(), Some(CachePreset::Balanced.limit_bytes()));

        policy.clear(&engine);
        assert_eq!(engine.cache_clears(), 1);
    }
}
