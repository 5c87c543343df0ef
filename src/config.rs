//! Engine-wide tunables.
//!
//! This crate reads no configuration file of its own (the on-disk format is
//! a collaborator's concern); [`EngineConfig`] exists so a hosting process
//! can fill in the knobs the spec leaves as parameters and pass them in.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables governing signing, key lifecycle timing, and NOTIFY behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Delay before the first key lifecycle timer tick after signing or
    /// startup.
    #[serde(with = "secs")]
    pub key_lifecycle_first_tick: Duration,

    /// Steady-state interval between key lifecycle timer ticks.
    #[serde(with = "secs")]
    pub key_lifecycle_tick_interval: Duration,

    /// How far inception is placed before "now" when signing.
    #[serde(with = "secs")]
    pub signature_inception_offset: Duration,

    /// Extra validity margin added on top of `SOA.expire` to compute RRSIG
    /// expiration.
    #[serde(with = "secs")]
    pub signature_validity_margin: Duration,

    /// Fraction of the validity period between signature-refresh checks
    /// (spec: 1/10).
    pub signature_refresh_check_fraction: f64,

    /// Refresh an RRSIG once less than this fraction of its lifetime
    /// remains (spec: one half).
    pub signature_refresh_remaining_fraction: f64,

    /// Delay before a coalesced NOTIFY actually fires.
    #[serde(with = "secs")]
    pub notify_coalesce_delay: Duration,

    /// Per-target NOTIFY timeout.
    #[serde(with = "secs")]
    pub notify_timeout: Duration,

    /// Number of NOTIFY retries per target.
    pub notify_retries: u32,

    /// Extra slack added on top of `2 * SOA.expire + max-TTL-ever-seen` when
    /// pruning IXFR history.
    #[serde(with = "secs")]
    pub history_retention_extra: Duration,

    /// Default NSEC3 iteration count used by `sign-zone` when the caller
    /// does not specify one.
    pub default_nsec3_iterations: u16,

    /// Default NSEC3 salt length in bytes.
    pub default_nsec3_salt_len: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_lifecycle_first_tick: Duration::from_secs(30),
            key_lifecycle_tick_interval: Duration::from_secs(15 * 60),
            signature_inception_offset: Duration::from_secs(60 * 60),
            signature_validity_margin: Duration::from_secs(3 * 24 * 60 * 60),
            signature_refresh_check_fraction: 0.1,
            signature_refresh_remaining_fraction: 0.5,
            notify_coalesce_delay: Duration::from_secs(10),
            notify_timeout: Duration::from_secs(10),
            notify_retries: 5,
            history_retention_extra: Duration::ZERO,
            default_nsec3_iterations: 10,
            default_nsec3_salt_len: 4,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.key_lifecycle_first_tick.as_secs(), 30);
        assert_eq!(cfg.key_lifecycle_tick_interval.as_secs(), 900);
        assert_eq!(cfg.signature_inception_offset.as_secs(), 3600);
        assert_eq!(cfg.signature_validity_margin.as_secs(), 3 * 86400);
        assert_eq!(cfg.notify_retries, 5);
    }
}
