//! Agent configuration.

use std::ops::RangeInclusive;

use crate::util::layout::next_power_of_two;
use crate::util::size::kb;

/// Largest shard count honored; larger requests are clamped.
pub const MAX_SHARD_COUNT: usize = 1 << 12;

/// Largest deferred queue honored; the queue is allocated up front.
pub const MAX_PENDING_CAPACITY: usize = 1 << 20;

/// What an allocation callback does when its table shard is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Wait for the shard. Critical sections are bounded by bucket size.
    Wait,
    /// Skip the lookup and let the allocation through unmodified.
    SkipWhenContended,
}

/// How far the agent may go when it finds a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteMode {
    /// Use the strongest rewrite primitive the runtime offers.
    Auto,
    /// Never rewrite; only count duplicates.
    ObserveOnly,
}

/// Configuration for the dedup agent.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Number of table shards, rounded up to a power of two and capped at
    /// [`MAX_SHARD_COUNT`] (default: 64)
    pub shard_count: usize,

    /// Maximum canonical entries kept at once (default: 1M)
    pub max_entries: usize,

    /// Shortest payload, in bytes, worth deduplicating
    pub min_length: usize,

    /// Longest payload, in bytes, hashed on the allocation path (default: 64 KB)
    pub max_length: usize,

    /// Behavior under shard contention
    pub lock_policy: LockPolicy,

    /// Rewrite aggressiveness
    pub rewrite_mode: RewriteMode,

    /// Capacity of the deferred substitution queue, between 1 and
    /// [`MAX_PENDING_CAPACITY`]
    pub pending_capacity: usize,

    /// Run the reference consolidation pass after each collection
    pub consolidate_on_gc: bool,

    /// Oldest generation scanned by the consolidation pass (default: 2)
    pub consolidate_min_generation: u8,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            shard_count: 64,
            max_entries: 1 << 20,
            min_length: 2,
            max_length: kb(64),
            lock_policy: LockPolicy::Wait,
            rewrite_mode: RewriteMode::Auto,
            pending_capacity: 4096,
            consolidate_on_gc: true,
            consolidate_min_generation: 2,
        }
    }
}

impl DedupConfig {
    /// Create a small config for tests or constrained processes.
    pub fn minimal() -> Self {
        Self {
            shard_count: 4,
            max_entries: 1024,
            min_length: 0,
            max_length: kb(4),
            lock_policy: LockPolicy::Wait,
            rewrite_mode: RewriteMode::Auto,
            pending_capacity: 64,
            consolidate_on_gc: true,
            consolidate_min_generation: 2,
        }
    }

    /// Create a config that never rewrites anything.
    pub fn observe_only() -> Self {
        Self {
            rewrite_mode: RewriteMode::ObserveOnly,
            consolidate_on_gc: false,
            ..Self::default()
        }
    }

    /// Builder pattern: set shard count.
    pub fn with_shard_count(mut self, shards: usize) -> Self {
        self.shard_count = shards.clamp(1, MAX_SHARD_COUNT);
        self
    }

    /// Builder pattern: set the entry limit.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Builder pattern: set the payload length window.
    pub fn with_length_range(mut self, min: usize, max: usize) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    /// Builder pattern: set the lock policy.
    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    /// Builder pattern: set the rewrite mode.
    pub fn with_rewrite_mode(mut self, mode: RewriteMode) -> Self {
        self.rewrite_mode = mode;
        self
    }

    /// Builder pattern: set the deferred queue capacity.
    pub fn with_pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity.clamp(1, MAX_PENDING_CAPACITY);
        self
    }

    /// Builder pattern: configure the consolidation pass.
    pub fn with_consolidation(mut self, enable: bool, min_generation: u8) -> Self {
        self.consolidate_on_gc = enable;
        self.consolidate_min_generation = min_generation;
        self
    }

    /// Shard count actually allocated: a power of two in `1..=MAX_SHARD_COUNT`.
    pub(crate) fn effective_shard_count(&self) -> usize {
        next_power_of_two(self.shard_count.clamp(1, MAX_SHARD_COUNT))
    }

    /// Deferred queue capacity actually allocated.
    pub(crate) fn effective_pending_capacity(&self) -> usize {
        self.pending_capacity.clamp(1, MAX_PENDING_CAPACITY)
    }

    /// Build a config from `STRDEDUP_*` environment variables.
    ///
    /// - `STRDEDUP_MODE`: "auto" or "observe"
    /// - `STRDEDUP_SHARDS`, `STRDEDUP_MAX_ENTRIES`, `STRDEDUP_PENDING`
    /// - `STRDEDUP_MIN_LENGTH`, `STRDEDUP_MAX_LENGTH`
    /// - `STRDEDUP_LOCK`: "wait" or "skip"
    /// - `STRDEDUP_CONSOLIDATE`: "0"/"false" to disable, or a minimum generation
    ///
    /// Unparseable or out-of-range values keep the default and log a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("STRDEDUP_MODE") {
            match val.to_lowercase().as_str() {
                "auto" => config.rewrite_mode = RewriteMode::Auto,
                "observe" | "observe-only" => config.rewrite_mode = RewriteMode::ObserveOnly,
                _ => warn_invalid("STRDEDUP_MODE", &val),
            }
        }

        if let Some(val) = lookup("STRDEDUP_LOCK") {
            match val.to_lowercase().as_str() {
                "wait" => config.lock_policy = LockPolicy::Wait,
                "skip" => config.lock_policy = LockPolicy::SkipWhenContended,
                _ => warn_invalid("STRDEDUP_LOCK", &val),
            }
        }

        parse_into(&lookup, "STRDEDUP_SHARDS", 1..=MAX_SHARD_COUNT, &mut config.shard_count);
        parse_into(&lookup, "STRDEDUP_MAX_ENTRIES", 0..=usize::MAX, &mut config.max_entries);
        parse_into(&lookup, "STRDEDUP_PENDING", 1..=MAX_PENDING_CAPACITY, &mut config.pending_capacity);
        parse_into(&lookup, "STRDEDUP_MIN_LENGTH", 0..=usize::MAX, &mut config.min_length);
        parse_into(&lookup, "STRDEDUP_MAX_LENGTH", 0..=usize::MAX, &mut config.max_length);

        if let Some(val) = lookup("STRDEDUP_CONSOLIDATE") {
            match val.to_lowercase().as_str() {
                "0" | "false" | "off" => config.consolidate_on_gc = false,
                other => match other.parse::<u8>() {
                    Ok(generation) => {
                        config.consolidate_on_gc = true;
                        config.consolidate_min_generation = generation;
                    }
                    Err(_) => warn_invalid("STRDEDUP_CONSOLIDATE", &val),
                },
            }
        }

        config
    }
}

fn parse_into(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    bounds: RangeInclusive<usize>,
    slot: &mut usize,
) {
    let Some(val) = lookup(key) else {
        return;
    };
    match val.trim().parse() {
        Ok(parsed) if bounds.contains(&parsed) => *slot = parsed,
        Ok(_) => log::warn!(
            "ignoring {}={:?}: outside {}..={}",
            key,
            val,
            bounds.start(),
            bounds.end()
        ),
        Err(_) => warn_invalid(key, &val),
    }
}

fn warn_invalid(key: &str, value: &str) {
    log::warn!("ignoring {}={:?}: not a recognized value", key, value);
}
