//! Shard selection strategies.
//!
//! Every increment lands on one shard picked by a [`ShardSelector`]. The
//! distribution over `[0, shard_count)` must be close to uniform: a selector
//! that favours some shards recreates the hot spot sharding is meant to
//! remove.
//!
//! | Selector | Distribution | Use case |
//! |----------|--------------|----------|
//! | [`RandomSelector`] | uniform, per-thread generator | production |
//! | [`SeededSelector`] | uniform, reproducible | tests, simulations |
//! | [`FixedSelector`] | always one shard | tests, hot-spot baselines |

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Picks the shard receiving a write.
pub trait ShardSelector {
    /// Returns an index in `[0, shard_count)`. `shard_count` is never zero.
    fn select(&self, shard_count: usize) -> usize;
}

/// Uniform selection from the thread-local generator of `rand`.
///
/// The generator is seeded once per thread from the operating system and
/// periodically reseeded by `rand` itself; it is never reseeded per call, so
/// concurrent callers do not produce correlated indices.
///
/// ```rust
/// use contatori_distribuiti::counter::selector::{RandomSelector, ShardSelector};
///
/// let index = RandomSelector.select(16);
/// assert!(index < 16);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSelector;

impl ShardSelector for RandomSelector {
    #[inline]
    fn select(&self, shard_count: usize) -> usize {
        rand::thread_rng().gen_range(0..shard_count)
    }
}

/// Uniform, reproducible selection from a seeded generator.
#[derive(Debug)]
pub struct SeededSelector {
    rng: Mutex<StdRng>,
}

impl SeededSelector {
    /// Creates a selector whose sequence is fully determined by `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl ShardSelector for SeededSelector {
    fn select(&self, shard_count: usize) -> usize {
        self.rng.lock().gen_range(0..shard_count)
    }
}

/// Sends every write to the same shard (modulo the shard count).
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedSelector(pub usize);

impl ShardSelector for FixedSelector {
    #[inline]
    fn select(&self, shard_count: usize) -> usize {
        self.0 % shard_count
    }
}

impl<R: ShardSelector + ?Sized> ShardSelector for &R {
    fn select(&self, shard_count: usize) -> usize {
        (**self).select(shard_count)
    }
}

impl<R: ShardSelector + ?Sized> ShardSelector for Arc<R> {
    fn select(&self, shard_count: usize) -> usize {
        (**self).select(shard_count)
    }
}
