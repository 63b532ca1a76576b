//! Device identity selection
//!
//! Weighted random selection from a pool of device identities.

use std::sync::Mutex;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ClientType, DeviceIdentity, DeviceTier};

/// Source of device identities for visits
pub trait DeviceIdentityProvider: Send + Sync {
    /// Next identity. Random providers return a fresh draw on every call.
    fn next_identity(&self) -> DeviceIdentity;
}

/// Pool entry with its selection weight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedIdentity {
    pub identity: DeviceIdentity,
    pub weight: f32,
}

/// Weighted identity pool
pub struct IdentityPool {
    entries: Vec<WeightedIdentity>,
    rng: Mutex<ChaCha20Rng>,
}

impl IdentityPool {
    /// Pool over the given entries. An empty list falls back to the built-in pool.
    pub fn new(entries: Vec<WeightedIdentity>) -> Self {
        Self::with_rng(entries, ChaCha20Rng::from_entropy())
    }

    pub fn with_seed(entries: Vec<WeightedIdentity>, seed: u64) -> Self {
        Self::with_rng(entries, ChaCha20Rng::seed_from_u64(seed))
    }

    fn with_rng(entries: Vec<WeightedIdentity>, rng: ChaCha20Rng) -> Self {
        let entries = if entries.is_empty() {
            default_entries()
        } else {
            entries
        };
        Self {
            entries,
            rng: Mutex::new(rng),
        }
    }

    pub fn entries(&self) -> &[WeightedIdentity] {
        &self.entries
    }

    fn select_weighted(&self) -> &DeviceIdentity {
        let total: f32 = self.entries.iter().map(|e| e.weight.max(0.0)).sum();
        if total <= 0.0 {
            return &self.entries[0].identity;
        }

        let roll = self.rng.lock().unwrap_or_else(|e| e.into_inner()).gen::<f32>() * total;
        let mut cumulative = 0.0;
        for entry in &self.entries {
            cumulative += entry.weight.max(0.0);
            if roll < cumulative {
                return &entry.identity;
            }
        }

        &self.entries[self.entries.len() - 1].identity
    }
}

impl Default for IdentityPool {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl DeviceIdentityProvider for IdentityPool {
    fn next_identity(&self) -> DeviceIdentity {
        let identity = self.select_weighted().clone();
        debug!("🎯 Device identity: {}", identity);
        identity
    }
}

/// Always hands out the same identity
pub struct FixedIdentity(pub DeviceIdentity);

impl DeviceIdentityProvider for FixedIdentity {
    fn next_identity(&self) -> DeviceIdentity {
        self.0.clone()
    }
}

fn default_entries() -> Vec<WeightedIdentity> {
    let entry = |platform: &str, tier, client_type, user_agent: &str, weight| WeightedIdentity {
        identity: DeviceIdentity {
            platform: platform.to_string(),
            tier,
            client_type,
            user_agent: user_agent.to_string(),
        },
        weight,
    };

    vec![
        entry(
            "android",
            DeviceTier::MidRange,
            ClientType::Mobile,
            "Mozilla/5.0 (Linux; Android 14) AppleWebKit/537.36 Chrome/124.0.0.0 Mobile Safari/537.36",
            0.4,
        ),
        entry(
            "ios",
            DeviceTier::Flagship,
            ClientType::Mobile,
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 Mobile/15E148",
            0.3,
        ),
        entry(
            "android",
            DeviceTier::Budget,
            ClientType::Mobile,
            "Mozilla/5.0 (Linux; Android 12) AppleWebKit/537.36 Chrome/120.0.0.0 Mobile Safari/537.36",
            0.1,
        ),
        entry(
            "windows",
            DeviceTier::MidRange,
            ClientType::Desktop,
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/124.0.0.0 Safari/537.36",
            0.2,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(platform: &str) -> DeviceIdentity {
        DeviceIdentity {
            platform: platform.into(),
            tier: DeviceTier::MidRange,
            client_type: ClientType::Desktop,
            user_agent: format!("ua-{platform}"),
        }
    }

    #[test]
    fn test_default_pool_not_empty() {
        let pool = IdentityPool::default();
        assert!(!pool.entries().is_empty());
        let picked = pool.next_identity();
        assert!(pool.entries().iter().any(|e| e.identity == picked));
    }

    #[test]
    fn test_zero_weight_entries_never_picked() {
        let pool = IdentityPool::with_seed(
            vec![
                WeightedIdentity { identity: identity("a"), weight: 1.0 },
                WeightedIdentity { identity: identity("b"), weight: 0.0 },
            ],
            7,
        );
        for _ in 0..1_000 {
            assert_eq!(pool.next_identity().platform, "a");
        }
    }

    #[test]
    fn test_weights_bias_selection() {
        let pool = IdentityPool::with_seed(
            vec![
                WeightedIdentity { identity: identity("heavy"), weight: 0.9 },
                WeightedIdentity { identity: identity("light"), weight: 0.1 },
            ],
            11,
        );
        let heavy = (0..2_000)
            .filter(|_| pool.next_identity().platform == "heavy")
            .count();
        assert!(heavy > 1_500, "heavy picked {heavy} times");
    }

    #[test]
    fn test_fixed_identity() {
        let fixed = FixedIdentity(identity("only"));
        assert_eq!(fixed.next_identity(), fixed.next_identity());
    }
}
